use academyd_proc_macros::PatchFields;
use chrono::{DateTime, Utc};
use log::info;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use crate::auth::{drop_user_sessions, insert_user, validate_password, AdminUser, Role};
use crate::csvio::{to_csv, CsvFile};
use crate::db::{count, update_sql, DbPool};
use crate::util::{ok, require_email, require_non_empty, trim_opt, ActionError, ActionResult, Validate};
use crate::{audit, SharedAcademyState};

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct UserRecord {
    pub id: i64,
    pub email: String,
    pub name: String,
    pub phone: Option<String>,
    pub role: Role,
    pub avatar_file_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const USER_COLUMNS: &str = "id, email, name, phone, role, avatar_file_id, created_at, updated_at";

pub async fn load_user(user_id: i64, pool: &SqlitePool) -> Result<UserRecord, ActionError> {
    let user = sqlx::query_as::<_, UserRecord>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id=?"))
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    user.ok_or_else(|| ActionError::not_found(format!("User id={user_id} not found")))
}

#[derive(Serialize, Deserialize, Debug)]
pub struct CreateUserInput {
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    pub role: Role,
    pub password: String,
}
impl Validate for CreateUserInput {
    fn validate(&self) -> Result<(), ActionError> {
        require_email("Email", &self.email)?;
        require_non_empty("Name", &self.name)?;
        validate_password(&self.password)
    }
}

#[derive(Serialize, Deserialize, PatchFields, Default, Debug)]
pub struct UserPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
}
impl Validate for UserPatch {
    fn validate(&self) -> Result<(), ActionError> {
        if let Some(name) = &self.name {
            require_non_empty("Name", name)?;
        }
        Ok(())
    }
}

#[get("/api/users?<search>&<role>")]
async fn list_users(search: Option<&str>, role: Option<&str>, _admin: AdminUser, db: &State<DbPool>) -> ActionResult<Vec<UserRecord>> {
    let mut query_builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!("SELECT {USER_COLUMNS} FROM users WHERE 1=1"));
    if let Some(search) = search.map(str::trim).filter(|s| !s.is_empty()) {
        let pattern = format!("%{}%", search.to_lowercase());
        query_builder.push(" AND (LOWER(name) LIKE ");
        query_builder.push_bind(pattern.clone());
        query_builder.push(" OR email LIKE ");
        query_builder.push_bind(pattern);
        query_builder.push(")");
    }
    if let Some(role) = role {
        let role = role.parse::<Role>().map_err(|e| ActionError::bad_request(e.to_string()))?;
        query_builder.push(" AND role=");
        query_builder.push_bind(role);
    }
    query_builder.push(" ORDER BY name");
    let users = query_builder.build_query_as::<UserRecord>()
        .fetch_all(&db.0)
        .await?;
    ok(users)
}

#[get("/api/users/<user_id>")]
async fn get_user(user_id: i64, _admin: AdminUser, db: &State<DbPool>) -> ActionResult<UserRecord> {
    ok(load_user(user_id, &db.0).await?)
}

#[post("/api/users", data = "<input>")]
async fn create_user(input: Json<CreateUserInput>, admin: AdminUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<UserRecord> {
    input.validate()?;
    let mut tx = db.0.begin().await?;
    let id = insert_user(&mut tx, &input.email, &input.name, input.phone.as_deref(), input.role, &input.password).await?;
    let rec = audit::record(&mut tx, Some(admin.0.id), "CREATE", "user", Some(id), serde_json::json!({ "email": input.email, "role": input.role })).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    ok(load_user(id, &db.0).await?)
}

#[patch("/api/users/<user_id>", data = "<patch>")]
async fn update_user(user_id: i64, mut patch: Json<UserPatch>, admin: AdminUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<UserRecord> {
    trim_opt(&mut patch.name);
    trim_opt(&mut patch.phone);
    patch.validate()?;
    let user = load_user(user_id, &db.0).await?;
    let mut fields = patch.fields_with_value();
    if fields.is_empty() {
        return ok(user);
    }
    if let Some(role) = patch.role {
        if role != user.role {
            if user_id == admin.0.id {
                return Err(ActionError::bad_request("You cannot change your own role"));
            }
            let coach_profiles = count(&db.0, "SELECT COUNT(*) FROM coaches WHERE user_id=?", user_id).await?;
            if user.role == Role::Coach && coach_profiles > 0 {
                return Err(ActionError::conflict("Remove the coach profile before changing the role of a coach"));
            }
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
    let rec = audit::record(&mut tx, Some(admin.0.id), "UPDATE", "user", Some(user_id), serde_json::to_value(&*patch).unwrap_or_default()).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    if patch.role.is_some_and(|role| role != user.role) {
        drop_user_sessions(state, user_id);
    }
    info!("User updated, id: {user_id}, fields: {:?}", patch.fields_with_value());
    ok(load_user(user_id, &db.0).await?)
}

#[delete("/api/users/<user_id>")]
async fn delete_user(user_id: i64, admin: AdminUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<i64> {
    if user_id == admin.0.id {
        return Err(ActionError::bad_request("You cannot delete your own account"));
    }
    let user = load_user(user_id, &db.0).await?;
    let students = count(&db.0, "SELECT COUNT(*) FROM students WHERE parent_id=?", user_id).await?;
    if students > 0 {
        return Err(ActionError::conflict(format!("Cannot delete user with {students} student(s). Remove or reassign them first.")));
    }
    let payments = count(&db.0, "SELECT COUNT(*) FROM payments WHERE user_id=?", user_id).await?;
    if payments > 0 {
        return Err(ActionError::conflict(format!("Cannot delete user with {payments} payment(s) on record")));
    }
    let coach_profiles = count(&db.0, "SELECT COUNT(*) FROM coaches WHERE user_id=?", user_id).await?;
    if coach_profiles > 0 {
        return Err(ActionError::conflict("Cannot delete a user with a coach profile. Remove the coach profile first."));
    }
    let mut tx = db.0.begin().await?;
    sqlx::query("UPDATE files SET uploaded_by=NULL WHERE uploaded_by=?")
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE credit_ledger SET created_by=NULL WHERE created_by=?")
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM users WHERE id=?")
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    let rec = audit::record(&mut tx, Some(admin.0.id), "DELETE", "user", Some(user_id), serde_json::json!({ "email": user.email })).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    drop_user_sessions(state, user_id);
    info!("User deleted, id: {user_id}");
    ok(user_id)
}

#[derive(Serialize, Debug)]
struct UserCsvRow {
    id: i64,
    email: String,
    name: String,
    phone: Option<String>,
    role: Role,
    created_at: String,
}

#[get("/api/users/export")]
async fn export_users(_admin: AdminUser, db: &State<DbPool>) -> Result<CsvFile, ActionError> {
    let users = sqlx::query_as::<_, UserRecord>(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY id"))
        .fetch_all(&db.0)
        .await?;
    let rows = users.into_iter().map(|u| UserCsvRow {
        id: u.id,
        email: u.email,
        name: u.name,
        phone: u.phone,
        role: u.role,
        created_at: u.created_at.to_rfc3339(),
    }).collect::<Vec<_>>();
    Ok(CsvFile {
        file_name: "users.csv".to_string(),
        content: to_csv(&rows)?,
    })
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
        list_users,
        export_users,
        get_user,
        create_user,
        update_user,
        delete_user,
    ])
}
