use academyd_proc_macros::PatchFields;
use chrono::{DateTime, Duration, Utc};
use log::info;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use crate::auth::{drop_user_sessions, AdminUser, Role, StaffUser};
use crate::db::{count, update_sql, DbPool};
use crate::schedules::{list_sessions, SessionFilter, SessionRecord};
use crate::students::today;
use crate::users::load_user;
use crate::util::{ok, parse_opt_date, ActionError, ActionResult};
use crate::{audit, SharedAcademyState};

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct CoachRecord {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub bio: Option<String>,
    pub specialties: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

const COACH_SELECT: &str = "SELECT c.id, c.user_id, u.name, u.email, u.phone, c.bio, c.specialties, c.is_active, c.created_at
    FROM coaches c JOIN users u ON u.id=c.user_id";

#[derive(Serialize, Deserialize, Debug)]
pub struct CoachInput {
    pub user_id: i64,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub specialties: Option<String>,
}

#[derive(Serialize, Deserialize, PatchFields, Default, Debug)]
pub struct CoachPatch {
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub specialties: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

pub async fn load_coach(coach_id: i64, pool: &SqlitePool) -> Result<CoachRecord, ActionError> {
    sqlx::query_as::<_, CoachRecord>(&format!("{COACH_SELECT} WHERE c.id=?"))
        .bind(coach_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ActionError::not_found(format!("Coach id={coach_id} not found")))
}

#[get("/api/coaches?<active_only>")]
async fn list_coaches(active_only: Option<bool>, db: &State<DbPool>) -> ActionResult<Vec<CoachRecord>> {
    let sql = if active_only.unwrap_or(false) {
        format!("{COACH_SELECT} WHERE c.is_active=1 ORDER BY u.name")
    } else {
        format!("{COACH_SELECT} ORDER BY u.name")
    };
    let coaches = sqlx::query_as::<_, CoachRecord>(&sql)
        .fetch_all(&db.0)
        .await?;
    ok(coaches)
}

#[get("/api/coaches/<coach_id>")]
async fn get_coach(coach_id: i64, db: &State<DbPool>) -> ActionResult<CoachRecord> {
    ok(load_coach(coach_id, &db.0).await?)
}

#[post("/api/coaches", data = "<input>")]
async fn create_coach(input: Json<CoachInput>, admin: AdminUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<CoachRecord> {
    let user = load_user(input.user_id, &db.0).await?;
    if count(&db.0, "SELECT COUNT(*) FROM coaches WHERE user_id=?", user.id).await? > 0 {
        return Err(ActionError::conflict(format!("User {} already has a coach profile", user.email)));
    }
    let promote = user.role == Role::Parent;
    let mut tx = db.0.begin().await?;
    let (id,): (i64,) = sqlx::query_as("INSERT INTO coaches (user_id, bio, specialties, is_active, created_at)
                VALUES (?, ?, ?, 1, ?) RETURNING id")
        .bind(user.id)
        .bind(&input.bio)
        .bind(&input.specialties)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;
    if promote {
        sqlx::query("UPDATE users SET role=?, updated_at=? WHERE id=?")
            .bind(Role::Coach)
            .bind(Utc::now())
            .bind(user.id)
            .execute(&mut *tx)
            .await?;
    }
    let rec = audit::record(&mut tx, Some(admin.0.id), "CREATE", "coach", Some(id), serde_json::to_value(&*input).unwrap_or_default()).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    if promote {
        drop_user_sessions(state, user.id);
    }
    info!("Coach created, id: {id}, user: {}", user.email);
    ok(load_coach(id, &db.0).await?)
}

#[patch("/api/coaches/<coach_id>", data = "<patch>")]
async fn update_coach(coach_id: i64, patch: Json<CoachPatch>, admin: AdminUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<CoachRecord> {
    let coach = load_coach(coach_id, &db.0).await?;
    let fields = patch.fields_with_value();
    if fields.is_empty() {
        return ok(coach);
    }
    let sql = update_sql("coaches", &fields);
    let mut tx = db.0.begin().await?;
    patch.bind_values(sqlx::query(&sql))
        .bind(coach_id)
        .execute(&mut *tx)
        .await?;
    let rec = audit::record(&mut tx, Some(admin.0.id), "UPDATE", "coach", Some(coach_id), serde_json::to_value(&*patch).unwrap_or_default()).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    ok(load_coach(coach_id, &db.0).await?)
}

#[delete("/api/coaches/<coach_id>")]
async fn delete_coach(coach_id: i64, admin: AdminUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<i64> {
    let coach = load_coach(coach_id, &db.0).await?;
    let schedules = count(&db.0, "SELECT COUNT(*) FROM class_schedules WHERE coach_id=?", coach_id).await?;
    if schedules > 0 {
        return Err(ActionError::conflict(format!("Cannot delete coach assigned to {schedules} schedule(s)")));
    }
    let sessions = count(&db.0, "SELECT COUNT(*) FROM class_sessions WHERE coach_id=?", coach_id).await?;
    if sessions > 0 {
        return Err(ActionError::conflict(format!("Cannot delete coach assigned to {sessions} session(s)")));
    }
    let user = load_user(coach.user_id, &db.0).await?;
    let demote = user.role == Role::Coach;
    let mut tx = db.0.begin().await?;
    sqlx::query("DELETE FROM coaches WHERE id=?")
        .bind(coach_id)
        .execute(&mut *tx)
        .await?;
    if demote {
        sqlx::query("UPDATE users SET role=?, updated_at=? WHERE id=?")
            .bind(Role::Parent)
            .bind(Utc::now())
            .bind(user.id)
            .execute(&mut *tx)
            .await?;
    }
    let rec = audit::record(&mut tx, Some(admin.0.id), "DELETE", "coach", Some(coach_id), serde_json::json!({ "user_id": coach.user_id })).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    if demote {
        drop_user_sessions(state, user.id);
    }
    info!("Coach deleted, id: {coach_id}");
    ok(coach_id)
}

#[get("/api/coaches/me/sessions?<from>&<to>")]
async fn my_sessions(from: Option<&str>, to: Option<&str>, staff: StaffUser, db: &State<DbPool>) -> ActionResult<Vec<SessionRecord>> {
    let coach_id: Option<(i64,)> = sqlx::query_as("SELECT id FROM coaches WHERE user_id=?")
        .bind(staff.0.id)
        .fetch_optional(&db.0)
        .await?;
    let Some((coach_id,)) = coach_id else {
        return Err(ActionError::not_found("You do not have a coach profile"));
    };
    let from = parse_opt_date("From", from)?.unwrap_or_else(today);
    let to = parse_opt_date("To", to)?.unwrap_or(from + Duration::days(7));
    let filter = SessionFilter {
        from: Some(from),
        to: Some(to),
        coach_id: Some(coach_id),
        ..Default::default()
    };
    ok(list_sessions(&filter, &db.0).await?)
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
        list_coaches,
        my_sessions,
        get_coach,
        create_coach,
        update_coach,
        delete_coach,
    ])
}
