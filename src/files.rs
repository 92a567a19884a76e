use chrono::{DateTime, Utc};
use log::info;
use rocket::data::ToByteUnit;
use rocket::http::{ContentType, Status};
use rocket::{Build, Data, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use crate::auth::{AdminUser, CurrentUser};
use crate::db::DbPool;
use crate::util::{ok, require_non_empty, unzip_data, ActionError, ActionResult};
use crate::{audit, AppConfig, SharedAcademyState};

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct FileInfo {
    pub id: i64,
    pub name: String,
    pub content_type: String,
    pub size: i64,
    pub uploaded_by: Option<i64>,
    pub created: DateTime<Utc>,
}

/// Stored content type; inflated uploads are typed by their file name.
fn stored_content_type(name: &str, content_type: Option<&ContentType>) -> String {
    match content_type {
        Some(ct) if ct != &ContentType::ZIP => ct.to_string(),
        _ => name.rsplit_once('.')
            .and_then(|(_, ext)| ContentType::from_extension(ext))
            .unwrap_or(ContentType::Binary)
            .to_string(),
    }
}

#[get("/api/files")]
async fn list_files(_admin: AdminUser, db: &State<DbPool>) -> ActionResult<Vec<FileInfo>> {
    let files = sqlx::query_as::<_, FileInfo>("SELECT id, name, content_type, LENGTH(data) AS size, uploaded_by, created FROM files ORDER BY id")
        .fetch_all(&db.0)
        .await?;
    ok(files)
}

#[get("/api/files/<file_id>")]
async fn get_file(file_id: i64, _user: CurrentUser, db: &State<DbPool>) -> Result<(ContentType, Vec<u8>), ActionError> {
    let file: Option<(String, Vec<u8>)> = sqlx::query_as("SELECT content_type, data FROM files WHERE id=?")
        .bind(file_id)
        .fetch_optional(&db.0)
        .await?;
    let Some((content_type, data)) = file else {
        return Err(ActionError::not_found(format!("File id={file_id} not found")));
    };
    let content_type = ContentType::parse_flexible(&content_type).unwrap_or(ContentType::Binary);
    Ok((content_type, data))
}

#[post("/api/files?<name>", data = "<data>")]
async fn upload_file(name: &str, data: Data<'_>, content_type: Option<&ContentType>, user: CurrentUser, cfg: &State<AppConfig>, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<i64> {
    require_non_empty("File name", name)?;
    let limit = cfg.upload_limit_mib;
    let data = data.open(limit.mebibytes()).into_bytes().await
        .map_err(|e| ActionError::bad_request(format!("Cannot read upload: {e}")))?;
    if !data.is_complete() {
        return Err(ActionError::new(Status::PayloadTooLarge, format!("File is larger than {limit} MiB")));
    }
    let data = data.into_inner();
    let data = if content_type == Some(&ContentType::ZIP) {
        unzip_data(&data, limit.mebibytes().as_u64())
            .map_err(|e| if e.status == Status::PayloadTooLarge {
                ActionError::new(Status::PayloadTooLarge, format!("File is larger than {limit} MiB"))
            } else {
                e
            })?
    } else {
        data
    };
    let stored_type = stored_content_type(name, content_type);
    let size = data.len();
    let mut tx = db.0.begin().await?;
    let (file_id,): (i64,) = sqlx::query_as("INSERT INTO files (name, content_type, data, uploaded_by, created) VALUES (?, ?, ?, ?, ?) RETURNING id")
        .bind(name)
        .bind(&stored_type)
        .bind(data)
        .bind(user.0.id)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;
    let rec = audit::record(&mut tx, Some(user.0.id), "UPLOAD", "file", Some(file_id), serde_json::json!({ "name": name, "size": size, "content_type": stored_type })).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    info!("File uploaded, id: {file_id}, name: {name}, {size} bytes");
    ok(file_id)
}

#[delete("/api/files/<file_id>")]
async fn delete_file(file_id: i64, admin: AdminUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<i64> {
    let mut tx = db.0.begin().await?;
    sqlx::query("UPDATE users SET avatar_file_id=NULL WHERE avatar_file_id=?")
        .bind(file_id)
        .execute(&mut *tx)
        .await?;
    let res = sqlx::query("DELETE FROM files WHERE id=?")
        .bind(file_id)
        .execute(&mut *tx)
        .await?;
    if res.rows_affected() == 0 {
        return Err(ActionError::not_found(format!("File id={file_id} not found")));
    }
    let rec = audit::record(&mut tx, Some(admin.0.id), "DELETE", "file", Some(file_id), serde_json::json!({})).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    info!("File deleted, id: {file_id}");
    ok(file_id)
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
        list_files,
        get_file,
        upload_file,
        delete_file,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_content_type() {
        assert_eq!(stored_content_type("avatar.png", Some(&ContentType::PNG)), "image/png");
        assert_eq!(stored_content_type("avatar.png", Some(&ContentType::ZIP)), "image/png");
        assert_eq!(stored_content_type("notes", Some(&ContentType::ZIP)), "application/octet-stream");
    }
}
