use academyd_proc_macros::PatchFields;
use chrono::{DateTime, Utc};
use log::info;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use crate::auth::AdminUser;
use crate::db::{count, update_sql, DbPool};
use crate::util::{ok, require_non_empty, require_positive, trim_opt, ActionError, ActionResult, Validate};
use crate::{audit, SharedAcademyState};

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct LocationRecord {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub city: Option<String>,
    pub capacity: Option<i64>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct LocationInput {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub capacity: Option<i64>,
}
impl Validate for LocationInput {
    fn validate(&self) -> Result<(), ActionError> {
        require_non_empty("Name", &self.name)?;
        require_non_empty("Address", &self.address)?;
        if let Some(capacity) = self.capacity {
            require_positive("Capacity", capacity)?;
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, PatchFields, Default, Debug)]
pub struct LocationPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub capacity: Option<i64>,
    #[serde(default)]
    pub is_active: Option<bool>,
}
impl Validate for LocationPatch {
    fn validate(&self) -> Result<(), ActionError> {
        if let Some(name) = &self.name {
            require_non_empty("Name", name)?;
        }
        if let Some(address) = &self.address {
            require_non_empty("Address", address)?;
        }
        if let Some(capacity) = self.capacity {
            require_positive("Capacity", capacity)?;
        }
        Ok(())
    }
}

pub async fn load_location(location_id: i64, pool: &SqlitePool) -> Result<LocationRecord, ActionError> {
    sqlx::query_as::<_, LocationRecord>("SELECT * FROM locations WHERE id=?")
        .bind(location_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ActionError::not_found(format!("Location id={location_id} not found")))
}

#[get("/api/locations?<active_only>")]
async fn list_locations(active_only: Option<bool>, db: &State<DbPool>) -> ActionResult<Vec<LocationRecord>> {
    let sql = if active_only.unwrap_or(false) {
        "SELECT * FROM locations WHERE is_active=1 ORDER BY name"
    } else {
        "SELECT * FROM locations ORDER BY name"
    };
    let locations = sqlx::query_as::<_, LocationRecord>(sql)
        .fetch_all(&db.0)
        .await?;
    ok(locations)
}

#[get("/api/locations/<location_id>")]
async fn get_location(location_id: i64, db: &State<DbPool>) -> ActionResult<LocationRecord> {
    ok(load_location(location_id, &db.0).await?)
}

#[post("/api/locations", data = "<input>")]
async fn create_location(input: Json<LocationInput>, admin: AdminUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<LocationRecord> {
    input.validate()?;
    let mut tx = db.0.begin().await?;
    let location: LocationRecord = sqlx::query_as("INSERT INTO locations
                (name, address, city, capacity, is_active, created_at)
                VALUES (?, ?, ?, ?, 1, ?) RETURNING *")
        .bind(input.name.trim())
        .bind(input.address.trim())
        .bind(&input.city)
        .bind(input.capacity)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;
    let rec = audit::record(&mut tx, Some(admin.0.id), "CREATE", "location", Some(location.id), serde_json::to_value(&*input).unwrap_or_default()).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    info!("Location created, id: {}, name: {}", location.id, location.name);
    ok(location)
}

#[patch("/api/locations/<location_id>", data = "<patch>")]
async fn update_location(location_id: i64, mut patch: Json<LocationPatch>, admin: AdminUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<LocationRecord> {
    trim_opt(&mut patch.name);
    trim_opt(&mut patch.address);
    trim_opt(&mut patch.city);
    patch.validate()?;
    let location = load_location(location_id, &db.0).await?;
    let fields = patch.fields_with_value();
    if fields.is_empty() {
        return ok(location);
    }
    let sql = update_sql("locations", &fields);
    let mut tx = db.0.begin().await?;
    patch.bind_values(sqlx::query(&sql))
        .bind(location_id)
        .execute(&mut *tx)
        .await?;
    let rec = audit::record(&mut tx, Some(admin.0.id), "UPDATE", "location", Some(location_id), serde_json::to_value(&*patch).unwrap_or_default()).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    ok(load_location(location_id, &db.0).await?)
}

#[delete("/api/locations/<location_id>")]
async fn delete_location(location_id: i64, admin: AdminUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<i64> {
    let location = load_location(location_id, &db.0).await?;
    let schedules = count(&db.0, "SELECT COUNT(*) FROM class_schedules WHERE location_id=?", location_id).await?;
    if schedules > 0 {
        return Err(ActionError::conflict(format!("Cannot delete location with {schedules} schedule(s). Deactivate it instead.")));
    }
    let sessions = count(&db.0, "SELECT COUNT(*) FROM class_sessions WHERE location_id=?", location_id).await?;
    if sessions > 0 {
        return Err(ActionError::conflict(format!("Cannot delete location with {sessions} session(s). Deactivate it instead.")));
    }
    let mut tx = db.0.begin().await?;
    sqlx::query("DELETE FROM locations WHERE id=?")
        .bind(location_id)
        .execute(&mut *tx)
        .await?;
    let rec = audit::record(&mut tx, Some(admin.0.id), "DELETE", "location", Some(location_id), serde_json::json!({ "name": location.name })).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    info!("Location deleted, id: {location_id}");
    ok(location_id)
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
        list_locations,
        get_location,
        create_location,
        update_location,
        delete_location,
    ])
}
