use academyd_proc_macros::PatchFields;
use chrono::Utc;
use log::info;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use crate::auth::{new_password_hash, validate_password, verify_password, CurrentUser};
use crate::db::{count, update_sql, DbPool};
use crate::users::{load_user, UserRecord};
use crate::util::{ok, require_non_empty, trim_opt, ActionError, ActionResult, Validate};
use crate::{audit, SharedAcademyState};

#[derive(Serialize, Deserialize, PatchFields, Default, Debug)]
pub struct ProfilePatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub avatar_file_id: Option<i64>,
}
impl Validate for ProfilePatch {
    fn validate(&self) -> Result<(), ActionError> {
        if let Some(name) = &self.name {
            require_non_empty("Name", name)?;
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct PasswordChange {
    pub current_password: String,
    pub new_password: String,
}

#[get("/api/profile")]
async fn get_profile(user: CurrentUser, db: &State<DbPool>) -> ActionResult<UserRecord> {
    ok(load_user(user.0.id, &db.0).await?)
}

#[patch("/api/profile", data = "<patch>")]
async fn update_profile(mut patch: Json<ProfilePatch>, user: CurrentUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<UserRecord> {
    trim_opt(&mut patch.name);
    trim_opt(&mut patch.phone);
    patch.validate()?;
    let user_id = user.0.id;
    let mut fields = patch.fields_with_value();
    if fields.is_empty() {
        return ok(load_user(user_id, &db.0).await?);
    }
    if let Some(file_id) = patch.avatar_file_id {
        if count(&db.0, "SELECT COUNT(*) FROM files WHERE id=?", file_id).await? == 0 {
            return Err(ActionError::bad_request(format!("File id={file_id} not found")));
        }
    }
    fields.push("updated_at");
    let sql = update_sql("users", &fields);
    let mut tx = db.0.begin().await?;
    patch.bind_values(sqlx::query(&sql))
        .bind(Utc::now())
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    let rec = audit::record(&mut tx, Some(user_id), "UPDATE_PROFILE", "user", Some(user_id), serde_json::to_value(&*patch).unwrap_or_default()).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    let updated = load_user(user_id, &db.0).await?;
    if let Ok(mut state) = state.write() {
        // keep the cached session name in sync
        for session_user in state.sessions.values_mut().filter(|u| u.id == user_id) {
            session_user.name = updated.name.clone();
        }
    }
    ok(updated)
}

#[post("/api/profile/password", data = "<input>")]
async fn change_password(input: Json<PasswordChange>, user: CurrentUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<bool> {
    validate_password(&input.new_password)?;
    let user_id = user.0.id;
    let (password_hash, password_salt): (String, String) = sqlx::query_as("SELECT password_hash, password_salt FROM users WHERE id=?")
        .bind(user_id)
        .fetch_one(&db.0)
        .await?;
    if !verify_password(&input.current_password, &password_salt, &password_hash) {
        return Err(ActionError::bad_request("Current password is incorrect"));
    }
    let (password_hash, password_salt) = new_password_hash(&input.new_password);
    let mut tx = db.0.begin().await?;
    sqlx::query("UPDATE users SET password_hash=?, password_salt=?, updated_at=? WHERE id=?")
        .bind(password_hash)
        .bind(password_salt)
        .bind(Utc::now())
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    let rec = audit::record(&mut tx, Some(user_id), "CHANGE_PASSWORD", "user", Some(user_id), serde_json::json!({})).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    info!("Password changed, user id: {user_id}");
    ok(true)
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
        get_profile,
        update_profile,
        change_password,
    ])
}
