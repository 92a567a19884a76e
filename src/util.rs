use std::backtrace::Backtrace;
use std::io::Read;
use chrono::NaiveDate;
use log::{error, warn};
use rocket::http::Status;
use rocket::response::status::Custom;
use rocket::response::{self, Responder};
use rocket::serde::json::Json;
use rocket::Request;
use serde::{Deserialize, Serialize};

/// Envelope of every successful API call.
#[derive(Serialize, Deserialize, Debug)]
pub struct ActionSuccess<T> {
    pub success: bool,
    pub data: T,
}

/// Envelope of every failed API call.
#[derive(Serialize, Deserialize, Debug)]
pub struct ActionFailure {
    pub success: bool,
    pub error: String,
}

#[derive(Debug)]
pub struct ActionError {
    pub status: Status,
    pub message: String,
}
impl ActionError {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(Status::BadRequest, message)
    }
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Status::NotFound, message)
    }
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(Status::Conflict, message)
    }
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(Status::Forbidden, message)
    }
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(Status::Unauthorized, message)
    }
}
impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.status.code, self.message)
    }
}
impl From<sqlx::Error> for ActionError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => ActionError::not_found("Record not found"),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                warn!("Unique constraint violation: {db_err}");
                ActionError::conflict("A record with the same value already exists")
            }
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                warn!("Foreign key violation: {db_err}");
                ActionError::bad_request("Referenced record does not exist")
            }
            _ => {
                error!("SQL Error: {err}\nbacktrace: {}", Backtrace::capture());
                ActionError::new(Status::InternalServerError, format!("Database error: {err}"))
            }
        }
    }
}
impl From<anyhow::Error> for ActionError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ActionError>() {
            Ok(action_error) => action_error,
            Err(err) => {
                error!("Error: {err}\nbacktrace: {}", Backtrace::capture());
                ActionError::new(Status::InternalServerError, format!("Error: {err}"))
            }
        }
    }
}
impl std::error::Error for ActionError {}

impl<'r> Responder<'r, 'static> for ActionError {
    fn respond_to(self, request: &'r Request<'_>) -> response::Result<'static> {
        Custom(self.status, Json(ActionFailure { success: false, error: self.message })).respond_to(request)
    }
}

pub type ActionResult<T> = Result<Json<ActionSuccess<T>>, ActionError>;

pub fn ok<T>(data: T) -> ActionResult<T> {
    Ok(Json(ActionSuccess { success: true, data }))
}

pub fn require_non_empty(field: &str, value: &str) -> Result<(), ActionError> {
    if value.trim().is_empty() {
        return Err(ActionError::bad_request(format!("{field} is required")));
    }
    Ok(())
}
pub fn require_positive(field: &str, value: i64) -> Result<(), ActionError> {
    if value <= 0 {
        return Err(ActionError::bad_request(format!("{field} must be greater than zero")));
    }
    Ok(())
}
pub fn require_email(field: &str, value: &str) -> Result<(), ActionError> {
    let value = value.trim();
    let valid = match value.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.'),
        None => false,
    };
    if !valid {
        return Err(ActionError::bad_request(format!("{field} is not a valid email address")));
    }
    Ok(())
}

/// `YYYY-MM-DD` from a query string.
pub fn parse_date(field: &str, value: &str) -> Result<NaiveDate, ActionError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|e| ActionError::bad_request(format!("{field} '{value}' is not a valid date: {e}")))
}
pub fn parse_opt_date(field: &str, value: Option<&str>) -> Result<Option<NaiveDate>, ActionError> {
    value.map(|value| parse_date(field, value)).transpose()
}

/// Trims an optional text field of a partial update in place.
pub fn trim_opt(value: &mut Option<String>) {
    if let Some(v) = value {
        let trimmed = v.trim();
        if trimmed.len() != v.len() {
            *v = trimmed.to_string();
        }
    }
}

/// Input that can check itself before any database work is done.
pub trait Validate {
    fn validate(&self) -> Result<(), ActionError>;
}

/// Inflates a zlib body, reading at most one byte past `limit` so an oversized result is refused without being buffered.
pub(crate) fn unzip_data(bytes: &[u8], limit: u64) -> Result<Vec<u8>, ActionError> {
    let mut z = flate2::read::ZlibDecoder::new(bytes).take(limit + 1);
    let mut s = Vec::new();
    z.read_to_end(&mut s)
        .map_err(|e| ActionError::new(Status::UnprocessableEntity, format!("Cannot inflate upload: {e}")))?;
    if s.len() as u64 > limit {
        return Err(ActionError::new(Status::PayloadTooLarge, format!("Inflated upload is larger than {limit} bytes")));
    }
    Ok(s)
}

#[cfg(test)]
pub(crate) mod test {
    use std::io::Read;
    use flate2::bufread::ZlibEncoder;
    use flate2::Compression;
    use rocket::http::Status;
    use crate::util::{parse_date, parse_opt_date, require_email, unzip_data};

    pub(crate) fn zip_data(bytes: &[u8]) -> Result<Vec<u8>, String> {
        let mut ret_vec = Vec::new();
        let mut deflater = ZlibEncoder::new(bytes, Compression::fast());
        deflater.read_to_end(&mut ret_vec).map_err(|e| e.to_string())?;
        Ok(ret_vec)
    }

    #[test]
    fn test_zip() {
        let data = b"foo bar baz";
        let zdata = zip_data(data).unwrap();
        let udata = unzip_data(&zdata, 1024).unwrap();
        assert_eq!(udata, data);
        assert_eq!(unzip_data(&zdata, data.len() as u64).unwrap(), data);
        let err = unzip_data(&zdata, data.len() as u64 - 1).unwrap_err();
        assert_eq!(err.status, Status::PayloadTooLarge);
        let err = unzip_data(b"not zlib at all", 1024).unwrap_err();
        assert_eq!(err.status, Status::UnprocessableEntity);
    }

    #[test]
    fn test_require_email() {
        assert!(require_email("email", "coach@academy.org").is_ok());
        assert!(require_email("email", "coach@academy").is_err());
        assert!(require_email("email", "@academy.org").is_err());
        assert!(require_email("email", "coach.academy.org").is_err());
    }

    #[test]
    fn test_parse_date() {
        assert_eq!(parse_date("from", "2025-03-01").unwrap().to_string(), "2025-03-01");
        assert_eq!(parse_date("from", "01.03.2025").unwrap_err().status.code, 400);
        assert_eq!(parse_opt_date("to", None).unwrap(), None);
    }
}
