use chrono::{DateTime, Utc};
use log::{error, warn};
use rocket::response::stream::{Event, EventStream};
use rocket::tokio::sync::broadcast::error::RecvError;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection};
use crate::auth::AdminUser;
use crate::db::DbPool;
use crate::util::{ok, ActionResult};
use crate::{impl_sqlx_json_text, SharedAcademyState};

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(transparent)]
pub struct AuditDetails(pub serde_json::Value);
impl_sqlx_json_text!(AuditDetails);

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct AuditRecord {
    pub id: i64,
    pub user_id: Option<i64>,
    pub action: String,
    pub entity: String,
    pub entity_id: Option<i64>,
    pub details: AuditDetails,
    pub created_at: DateTime<Utc>,
}

/// Appends an audit entry on the caller's connection, so it commits or rolls back together with the audited write.
pub async fn record(
    conn: &mut SqliteConnection,
    user_id: Option<i64>,
    action: &str,
    entity: &str,
    entity_id: Option<i64>,
    details: serde_json::Value,
) -> Result<AuditRecord, sqlx::Error> {
    let rec: AuditRecord = sqlx::query_as("INSERT INTO audit_log
                (user_id, action, entity, entity_id, details, created_at)
                VALUES (?, ?, ?, ?, ?, ?) RETURNING *")
        .bind(user_id)
        .bind(action)
        .bind(entity)
        .bind(entity_id)
        .bind(AuditDetails(details))
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await?;
    Ok(rec)
}

/// Sends a committed entry to the live feed.
pub fn publish(state: &SharedAcademyState, rec: AuditRecord) {
    match state.read() {
        Ok(state) => state.broadcast_audit_record(rec),
        Err(e) => error!("Academy state poisoned, audit record {} not published: {e}", rec.id),
    }
}

#[get("/api/audit?<entity>&<entity_id>&<user_id>&<limit>")]
async fn list_audit(entity: Option<&str>, entity_id: Option<i64>, user_id: Option<i64>, limit: Option<i64>, _admin: AdminUser, db: &State<DbPool>) -> ActionResult<Vec<AuditRecord>> {
    let mut query_builder: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM audit_log WHERE 1=1");
    if let Some(entity) = entity {
        query_builder.push(" AND entity=");
        query_builder.push_bind(entity);
    }
    if let Some(entity_id) = entity_id {
        query_builder.push(" AND entity_id=");
        query_builder.push_bind(entity_id);
    }
    if let Some(user_id) = user_id {
        query_builder.push(" AND user_id=");
        query_builder.push_bind(user_id);
    }
    query_builder.push(" ORDER BY id DESC LIMIT ");
    query_builder.push_bind(limit.unwrap_or(200).clamp(1, 1000));
    let records = query_builder.build_query_as::<AuditRecord>()
        .fetch_all(&db.0)
        .await?;
    ok(records)
}

#[get("/api/audit/sse")]
fn audit_sse(_admin: AdminUser, state: &State<SharedAcademyState>) -> Option<EventStream![]> {
    let mut receiver = state.read().ok()?.audit_sender.subscribe();
    Some(EventStream! {
        loop {
            let rec = match receiver.recv().await {
                Ok(rec) => rec,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Audit feed lagged, {skipped} records skipped");
                    continue;
                }
                Err(e) => {
                    error!("Receive audit record error: {e}");
                    break;
                }
            };
            match serde_json::to_string(&rec) {
                Ok(json) => {
                    yield Event::data(json);
                }
                Err(e) => {
                    error!("Serde error: {e}");
                    break;
                }
            }
        }
    })
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
        list_audit,
        audit_sse,
    ])
}
