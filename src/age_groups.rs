use academyd_proc_macros::PatchFields;
use chrono::{DateTime, NaiveDate, Utc};
use log::info;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use crate::auth::AdminUser;
use crate::db::{count, update_sql, DbPool};
use crate::students::{age_on, today};
use crate::util::{ok, parse_date, require_non_empty, trim_opt, ActionError, ActionResult, Validate};
use crate::{audit, SharedAcademyState};

#[derive(Serialize, Deserialize, FromRow, Clone, Debug, PartialEq)]
pub struct AgeGroupRecord {
    pub id: i64,
    pub name: String,
    pub min_age: i64,
    pub max_age: i64,
    pub created_at: DateTime<Utc>,
}

fn validate_range(min_age: i64, max_age: i64) -> Result<(), ActionError> {
    if min_age < 0 {
        return Err(ActionError::bad_request("Minimum age cannot be negative"));
    }
    if min_age > max_age {
        return Err(ActionError::bad_request("Minimum age must not be greater than maximum age"));
    }
    Ok(())
}

#[derive(Serialize, Deserialize, Debug)]
pub struct AgeGroupInput {
    pub name: String,
    pub min_age: i64,
    pub max_age: i64,
}
impl Validate for AgeGroupInput {
    fn validate(&self) -> Result<(), ActionError> {
        require_non_empty("Name", &self.name)?;
        validate_range(self.min_age, self.max_age)
    }
}

#[derive(Serialize, Deserialize, PatchFields, Default, Debug)]
pub struct AgeGroupPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub min_age: Option<i64>,
    #[serde(default)]
    pub max_age: Option<i64>,
}

/// The group containing `age`; when groups overlap the narrowest one wins.
pub fn pick_age_group(groups: &[AgeGroupRecord], age: i64) -> Option<&AgeGroupRecord> {
    groups.iter()
        .filter(|g| g.min_age <= age && age <= g.max_age)
        .min_by_key(|g| (g.max_age - g.min_age, g.id))
}

pub async fn age_group_for(date_of_birth: NaiveDate, today: NaiveDate, pool: &SqlitePool) -> Result<Option<AgeGroupRecord>, sqlx::Error> {
    let groups = list(pool).await?;
    let age = age_on(date_of_birth, today);
    Ok(pick_age_group(&groups, age).cloned())
}

async fn list(pool: &SqlitePool) -> Result<Vec<AgeGroupRecord>, sqlx::Error> {
    sqlx::query_as::<_, AgeGroupRecord>("SELECT * FROM age_groups ORDER BY min_age, max_age")
        .fetch_all(pool)
        .await
}

async fn load_age_group(age_group_id: i64, pool: &SqlitePool) -> Result<AgeGroupRecord, ActionError> {
    sqlx::query_as::<_, AgeGroupRecord>("SELECT * FROM age_groups WHERE id=?")
        .bind(age_group_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ActionError::not_found(format!("Age group id={age_group_id} not found")))
}

async fn ensure_unique_name(name: &str, except_id: i64, pool: &SqlitePool) -> Result<(), ActionError> {
    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM age_groups WHERE name=? AND id<>?")
        .bind(name.trim())
        .bind(except_id)
        .fetch_one(pool)
        .await?;
    if n > 0 {
        return Err(ActionError::conflict(format!("Age group '{}' already exists", name.trim())));
    }
    Ok(())
}

#[get("/api/age-groups")]
async fn list_age_groups(db: &State<DbPool>) -> ActionResult<Vec<AgeGroupRecord>> {
    ok(list(&db.0).await?)
}

#[get("/api/age-groups/match?<date_of_birth>")]
async fn match_age_group(date_of_birth: &str, db: &State<DbPool>) -> ActionResult<Option<AgeGroupRecord>> {
    let date_of_birth = parse_date("Date of birth", date_of_birth)?;
    ok(age_group_for(date_of_birth, today(), &db.0).await?)
}

#[get("/api/age-groups/<age_group_id>")]
async fn get_age_group(age_group_id: i64, db: &State<DbPool>) -> ActionResult<AgeGroupRecord> {
    ok(load_age_group(age_group_id, &db.0).await?)
}

#[post("/api/age-groups", data = "<input>")]
async fn create_age_group(input: Json<AgeGroupInput>, admin: AdminUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<AgeGroupRecord> {
    input.validate()?;
    ensure_unique_name(&input.name, 0, &db.0).await?;
    let mut tx = db.0.begin().await?;
    let group: AgeGroupRecord = sqlx::query_as("INSERT INTO age_groups (name, min_age, max_age, created_at) VALUES (?, ?, ?, ?) RETURNING *")
        .bind(input.name.trim())
        .bind(input.min_age)
        .bind(input.max_age)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;
    let rec = audit::record(&mut tx, Some(admin.0.id), "CREATE", "age_group", Some(group.id), serde_json::to_value(&*input).unwrap_or_default()).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    info!("Age group created, id: {}, name: {}", group.id, group.name);
    ok(group)
}

#[patch("/api/age-groups/<age_group_id>", data = "<patch>")]
async fn update_age_group(age_group_id: i64, mut patch: Json<AgeGroupPatch>, admin: AdminUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<AgeGroupRecord> {
    trim_opt(&mut patch.name);
    let group = load_age_group(age_group_id, &db.0).await?;
    let fields = patch.fields_with_value();
    if fields.is_empty() {
        return ok(group);
    }
    if let Some(name) = &patch.name {
        require_non_empty("Name", name)?;
        ensure_unique_name(name, age_group_id, &db.0).await?;
    }
    validate_range(patch.min_age.unwrap_or(group.min_age), patch.max_age.unwrap_or(group.max_age))?;
    let sql = update_sql("age_groups", &fields);
    let mut tx = db.0.begin().await?;
    patch.bind_values(sqlx::query(&sql))
        .bind(age_group_id)
        .execute(&mut *tx)
        .await?;
    let rec = audit::record(&mut tx, Some(admin.0.id), "UPDATE", "age_group", Some(age_group_id), serde_json::to_value(&*patch).unwrap_or_default()).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    ok(load_age_group(age_group_id, &db.0).await?)
}

#[delete("/api/age-groups/<age_group_id>")]
async fn delete_age_group(age_group_id: i64, admin: AdminUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<i64> {
    let group = load_age_group(age_group_id, &db.0).await?;
    let prices = count(&db.0, "SELECT COUNT(*) FROM package_prices WHERE age_group_id=?", age_group_id).await?;
    if prices > 0 {
        return Err(ActionError::conflict(format!("Cannot delete age group used by {prices} package price(s)")));
    }
    let templates = count(&db.0, "SELECT COUNT(*) FROM class_templates WHERE age_group_id=?", age_group_id).await?;
    if templates > 0 {
        return Err(ActionError::conflict(format!("Cannot delete age group used by {templates} class template(s)")));
    }
    let mut tx = db.0.begin().await?;
    sqlx::query("DELETE FROM age_groups WHERE id=?")
        .bind(age_group_id)
        .execute(&mut *tx)
        .await?;
    let rec = audit::record(&mut tx, Some(admin.0.id), "DELETE", "age_group", Some(age_group_id), serde_json::json!({ "name": group.name })).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    info!("Age group deleted, id: {age_group_id}");
    ok(age_group_id)
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
        list_age_groups,
        match_age_group,
        get_age_group,
        create_age_group,
        update_age_group,
        delete_age_group,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(id: i64, min_age: i64, max_age: i64) -> AgeGroupRecord {
        AgeGroupRecord { id, name: format!("{min_age}-{max_age}"), min_age, max_age, created_at: Utc::now() }
    }

    #[test]
    fn test_pick_age_group() {
        let groups = vec![group(1, 5, 17), group(2, 8, 11), group(3, 12, 17)];
        assert_eq!(pick_age_group(&groups, 9).map(|g| g.id), Some(2));
        assert_eq!(pick_age_group(&groups, 6).map(|g| g.id), Some(1));
        assert_eq!(pick_age_group(&groups, 12).map(|g| g.id), Some(3));
        assert_eq!(pick_age_group(&groups, 18), None);
    }

    #[test]
    fn test_validate_range() {
        assert!(validate_range(6, 6).is_ok());
        assert!(validate_range(7, 6).is_err());
        assert!(validate_range(-1, 6).is_err());
    }
}
