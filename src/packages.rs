use std::collections::HashSet;
use chrono::{DateTime, Utc};
use log::info;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use crate::auth::{AdminUser, CurrentUser};
use crate::db::{count, DbPool};
use crate::students::{age_on, load_accessible_student, today};
use crate::util::{ok, require_non_empty, require_positive, ActionError, ActionResult, Validate};
use crate::{audit, SharedAcademyState};

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct PackageRecord {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub credits: i64,
    pub validity_days: Option<i64>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug, PartialEq)]
pub struct PackagePrice {
    pub age_group_id: i64,
    pub age_group_name: String,
    pub price_cents: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PackageWithPrices {
    #[serde(flatten)]
    pub package: PackageRecord,
    pub prices: Vec<PackagePrice>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PriceInput {
    pub age_group_id: i64,
    pub price_cents: i64,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct PackageInput {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub credits: i64,
    #[serde(default)]
    pub validity_days: Option<i64>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub prices: Vec<PriceInput>,
}
fn default_true() -> bool {
    true
}
impl Validate for PackageInput {
    fn validate(&self) -> Result<(), ActionError> {
        require_non_empty("Name", &self.name)?;
        require_positive("Credits", self.credits)?;
        if let Some(validity_days) = self.validity_days {
            require_positive("Validity days", validity_days)?;
        }
        let mut age_groups = HashSet::new();
        for price in &self.prices {
            if price.price_cents < 0 {
                return Err(ActionError::bad_request("Price cannot be negative"));
            }
            if !age_groups.insert(price.age_group_id) {
                return Err(ActionError::bad_request(format!("Age group id={} is priced more than once", price.age_group_id)));
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct PriceQuote {
    pub package_id: i64,
    pub student_id: i64,
    pub age_group_id: i64,
    pub price_cents: i64,
}

async fn load_prices(package_id: i64, pool: &SqlitePool) -> Result<Vec<PackagePrice>, sqlx::Error> {
    sqlx::query_as::<_, PackagePrice>("SELECT pp.age_group_id, ag.name AS age_group_name, pp.price_cents
            FROM package_prices pp JOIN age_groups ag ON ag.id=pp.age_group_id
            WHERE pp.package_id=? ORDER BY ag.min_age")
        .bind(package_id)
        .fetch_all(pool)
        .await
}

pub async fn load_package(package_id: i64, pool: &SqlitePool) -> Result<PackageWithPrices, ActionError> {
    let package = sqlx::query_as::<_, PackageRecord>("SELECT * FROM packages WHERE id=?")
        .bind(package_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ActionError::not_found(format!("Package id={package_id} not found")))?;
    let prices = load_prices(package_id, pool).await?;
    Ok(PackageWithPrices { package, prices })
}

/// Price of a package for the age group the student falls in today; the narrowest matching group wins.
pub async fn price_for_student(conn: &mut SqliteConnection, package_id: i64, student_id: i64) -> Result<PriceQuote, ActionError> {
    let date_of_birth: Option<(chrono::NaiveDate,)> = sqlx::query_as("SELECT date_of_birth FROM students WHERE id=?")
        .bind(student_id)
        .fetch_optional(&mut *conn)
        .await?;
    let Some((date_of_birth,)) = date_of_birth else {
        return Err(ActionError::not_found(format!("Student id={student_id} not found")));
    };
    let age = age_on(date_of_birth, today());
    let price: Option<(i64, i64)> = sqlx::query_as("SELECT pp.age_group_id, pp.price_cents
            FROM package_prices pp JOIN age_groups ag ON ag.id=pp.age_group_id
            WHERE pp.package_id=? AND ag.min_age<=? AND ag.max_age>=?
            ORDER BY ag.max_age - ag.min_age, ag.id
            LIMIT 1")
        .bind(package_id)
        .bind(age)
        .bind(age)
        .fetch_optional(&mut *conn)
        .await?;
    let Some((age_group_id, price_cents)) = price else {
        return Err(ActionError::bad_request(format!("Package id={package_id} has no price for a student aged {age}")));
    };
    Ok(PriceQuote { package_id, student_id, age_group_id, price_cents })
}

async fn check_age_groups(input: &PackageInput, pool: &SqlitePool) -> Result<(), ActionError> {
    for price in &input.prices {
        if count(pool, "SELECT COUNT(*) FROM age_groups WHERE id=?", price.age_group_id).await? == 0 {
            return Err(ActionError::bad_request(format!("Age group id={} not found", price.age_group_id)));
        }
    }
    Ok(())
}

async fn replace_prices(conn: &mut SqliteConnection, package_id: i64, prices: &[PriceInput]) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM package_prices WHERE package_id=?")
        .bind(package_id)
        .execute(&mut *conn)
        .await?;
    for price in prices {
        sqlx::query("INSERT INTO package_prices (package_id, age_group_id, price_cents) VALUES (?, ?, ?)")
            .bind(package_id)
            .bind(price.age_group_id)
            .bind(price.price_cents)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn ensure_unique_name(name: &str, except_id: i64, pool: &SqlitePool) -> Result<(), ActionError> {
    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM packages WHERE name=? AND id<>?")
        .bind(name.trim())
        .bind(except_id)
        .fetch_one(pool)
        .await?;
    if n > 0 {
        return Err(ActionError::conflict(format!("Package '{}' already exists", name.trim())));
    }
    Ok(())
}

#[get("/api/packages?<active_only>")]
async fn list_packages(active_only: Option<bool>, db: &State<DbPool>) -> ActionResult<Vec<PackageWithPrices>> {
    let sql = if active_only.unwrap_or(false) {
        "SELECT * FROM packages WHERE is_active=1 ORDER BY credits, name"
    } else {
        "SELECT * FROM packages ORDER BY credits, name"
    };
    let packages = sqlx::query_as::<_, PackageRecord>(sql)
        .fetch_all(&db.0)
        .await?;
    let mut ret = Vec::with_capacity(packages.len());
    for package in packages {
        let prices = load_prices(package.id, &db.0).await?;
        ret.push(PackageWithPrices { package, prices });
    }
    ok(ret)
}

#[get("/api/packages/<package_id>")]
async fn get_package(package_id: i64, db: &State<DbPool>) -> ActionResult<PackageWithPrices> {
    ok(load_package(package_id, &db.0).await?)
}

#[get("/api/packages/<package_id>/price?<student_id>")]
async fn get_price(package_id: i64, student_id: i64, user: CurrentUser, db: &State<DbPool>) -> ActionResult<PriceQuote> {
    load_accessible_student(student_id, &user.0, &db.0).await?;
    let mut conn = db.0.acquire().await?;
    ok(price_for_student(&mut conn, package_id, student_id).await?)
}

#[post("/api/packages", data = "<input>")]
async fn create_package(input: Json<PackageInput>, admin: AdminUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<PackageWithPrices> {
    input.validate()?;
    ensure_unique_name(&input.name, 0, &db.0).await?;
    check_age_groups(&input, &db.0).await?;
    let mut tx = db.0.begin().await?;
    let (id,): (i64,) = sqlx::query_as("INSERT INTO packages
                (name, description, credits, validity_days, is_active, created_at)
                VALUES (?, ?, ?, ?, ?, ?) RETURNING id")
        .bind(input.name.trim())
        .bind(&input.description)
        .bind(input.credits)
        .bind(input.validity_days)
        .bind(input.is_active)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;
    replace_prices(&mut tx, id, &input.prices).await?;
    let rec = audit::record(&mut tx, Some(admin.0.id), "CREATE", "package", Some(id), serde_json::to_value(&*input).unwrap_or_default()).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    info!("Package created, id: {id}, name: {}", input.name);
    ok(load_package(id, &db.0).await?)
}

#[put("/api/packages/<package_id>", data = "<input>")]
async fn update_package(package_id: i64, input: Json<PackageInput>, admin: AdminUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<PackageWithPrices> {
    input.validate()?;
    load_package(package_id, &db.0).await?;
    ensure_unique_name(&input.name, package_id, &db.0).await?;
    check_age_groups(&input, &db.0).await?;
    let mut tx = db.0.begin().await?;
    sqlx::query("UPDATE packages SET name=?, description=?, credits=?, validity_days=?, is_active=? WHERE id=?")
        .bind(input.name.trim())
        .bind(&input.description)
        .bind(input.credits)
        .bind(input.validity_days)
        .bind(input.is_active)
        .bind(package_id)
        .execute(&mut *tx)
        .await?;
    replace_prices(&mut tx, package_id, &input.prices).await?;
    let rec = audit::record(&mut tx, Some(admin.0.id), "UPDATE", "package", Some(package_id), serde_json::to_value(&*input).unwrap_or_default()).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    ok(load_package(package_id, &db.0).await?)
}

#[delete("/api/packages/<package_id>")]
async fn delete_package(package_id: i64, admin: AdminUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<i64> {
    let package = load_package(package_id, &db.0).await?;
    let purchased = count(&db.0, "SELECT COUNT(*) FROM student_packages WHERE package_id=?", package_id).await?;
    let payments = count(&db.0, "SELECT COUNT(*) FROM payments WHERE package_id=?", package_id).await?;
    if purchased > 0 || payments > 0 {
        return Err(ActionError::conflict(format!(
            "Cannot delete package that has been purchased {purchased} time(s) or has {payments} payment(s). Deactivate it instead.")));
    }
    let mut tx = db.0.begin().await?;
    sqlx::query("DELETE FROM package_prices WHERE package_id=?")
        .bind(package_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM packages WHERE id=?")
        .bind(package_id)
        .execute(&mut *tx)
        .await?;
    let rec = audit::record(&mut tx, Some(admin.0.id), "DELETE", "package", Some(package_id), serde_json::json!({ "name": package.package.name })).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    info!("Package deleted, id: {package_id}");
    ok(package_id)
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
        list_packages,
        get_package,
        get_price,
        create_package,
        update_package,
        delete_package,
    ])
}
