use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use log::info;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use crate::auth::{CurrentUser, StaffUser};
use crate::db::DbPool;
use crate::schedules::{load_session, now_local, SessionStatus};
use crate::settings::load_settings;
use crate::student_package::{consume_credit, refund_credit};
use crate::students::load_accessible_student;
use crate::util::{ok, ActionError, ActionResult};
use crate::{audit, impl_sqlx_text_enum, impl_text_enum_strings, SharedAcademyState};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Booked,
    Cancelled,
    Attended,
    NoShow,
}
impl_text_enum_strings!(BookingStatus { Booked => "BOOKED", Cancelled => "CANCELLED", Attended => "ATTENDED", NoShow => "NO_SHOW" });
impl_sqlx_text_enum!(BookingStatus);

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct BookingRecord {
    pub id: i64,
    pub session_id: i64,
    pub student_id: i64,
    pub student_name: String,
    pub student_package_id: Option<i64>,
    pub status: BookingStatus,
    pub starts_at: NaiveDateTime,
    pub template_name: String,
    pub created_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

const BOOKING_SELECT: &str = "SELECT b.id, b.session_id, b.student_id, st.first_name || ' ' || st.last_name AS student_name,
        b.student_package_id, b.status, s.starts_at, t.name AS template_name, b.created_at, b.cancelled_at
    FROM bookings b
    JOIN students st ON st.id=b.student_id
    JOIN class_sessions s ON s.id=b.session_id
    JOIN class_templates t ON t.id=s.template_id";

async fn load_booking(conn: &mut SqliteConnection, booking_id: i64) -> Result<BookingRecord, ActionError> {
    sqlx::query_as::<_, BookingRecord>(&format!("{BOOKING_SELECT} WHERE b.id=?"))
        .bind(booking_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| ActionError::not_found(format!("Booking id={booking_id} not found")))
}

async fn load_booking_from_pool(booking_id: i64, pool: &SqlitePool) -> Result<BookingRecord, ActionError> {
    let mut conn = pool.acquire().await?;
    load_booking(&mut conn, booking_id).await
}

/// A cancellation made at least `cancellation_hours` before the start gets its credit back.
pub fn refund_due(starts_at: NaiveDateTime, now: NaiveDateTime, cancellation_hours: i64) -> bool {
    starts_at - now >= Duration::hours(cancellation_hours)
}

#[derive(Serialize, Deserialize, Debug)]
pub struct BookInput {
    pub session_id: i64,
    pub student_id: i64,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct AttendanceInput {
    pub status: BookingStatus,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct BookingCancellation {
    pub booking: BookingRecord,
    pub credit_refunded: bool,
}

#[get("/api/bookings?<session_id>&<student_id>")]
async fn list_bookings(session_id: Option<i64>, student_id: Option<i64>, user: CurrentUser, db: &State<DbPool>) -> ActionResult<Vec<BookingRecord>> {
    let mut query_builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!("{BOOKING_SELECT} WHERE 1=1"));
    if let Some(session_id) = session_id {
        query_builder.push(" AND b.session_id=");
        query_builder.push_bind(session_id);
    }
    if let Some(student_id) = student_id {
        query_builder.push(" AND b.student_id=");
        query_builder.push_bind(student_id);
    }
    if !user.0.role.is_staff() {
        query_builder.push(" AND st.parent_id=");
        query_builder.push_bind(user.0.id);
    }
    query_builder.push(" ORDER BY s.starts_at, b.id");
    let bookings = query_builder.build_query_as::<BookingRecord>()
        .fetch_all(&db.0)
        .await?;
    ok(bookings)
}

#[get("/api/bookings/<booking_id>")]
async fn get_booking(booking_id: i64, user: CurrentUser, db: &State<DbPool>) -> ActionResult<BookingRecord> {
    let booking = load_booking_from_pool(booking_id, &db.0).await?;
    load_accessible_student(booking.student_id, &user.0, &db.0).await?;
    ok(booking)
}

#[post("/api/bookings", data = "<input>")]
async fn book(input: Json<BookInput>, user: CurrentUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<BookingRecord> {
    load_accessible_student(input.student_id, &user.0, &db.0).await?;
    let session = load_session(input.session_id, &db.0).await?;
    if session.status != SessionStatus::Scheduled {
        return Err(ActionError::bad_request(format!("Session is {}", session.status)));
    }
    let now = now_local();
    if session.starts_at <= now {
        return Err(ActionError::bad_request("Session has already started"));
    }
    if !user.0.role.is_staff() {
        let settings = load_settings(&db.0).await?;
        if session.starts_at > now + Duration::days(settings.booking_horizon_days) {
            return Err(ActionError::bad_request(format!("Sessions can be booked at most {} days ahead", settings.booking_horizon_days)));
        }
    }
    let mut tx = db.0.begin().await?;
    let (capacity, booked, already_booked): (Option<i64>, i64, i64) = sqlx::query_as("SELECT
                (SELECT capacity FROM class_sessions WHERE id=? AND status=?),
                COUNT(*), COALESCE(SUM(student_id=?), 0)
            FROM bookings WHERE session_id=? AND status<>?")
        .bind(input.session_id)
        .bind(SessionStatus::Scheduled)
        .bind(input.student_id)
        .bind(input.session_id)
        .bind(BookingStatus::Cancelled)
        .fetch_one(&mut *tx)
        .await?;
    let Some(capacity) = capacity else {
        return Err(ActionError::bad_request("Session is no longer scheduled"));
    };
    if already_booked > 0 {
        return Err(ActionError::conflict("Student is already booked for this session"));
    }
    if booked >= capacity {
        return Err(ActionError::conflict("Session is full"));
    }
    let (booking_id,): (i64,) = sqlx::query_as("INSERT INTO bookings (session_id, student_id, status, created_at)
                VALUES (?, ?, ?, ?) RETURNING id")
        .bind(input.session_id)
        .bind(input.student_id)
        .bind(BookingStatus::Booked)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;
    let sp = consume_credit(&mut tx, input.student_id, booking_id, Some(user.0.id)).await?;
    sqlx::query("UPDATE bookings SET student_package_id=? WHERE id=?")
        .bind(sp.id)
        .bind(booking_id)
        .execute(&mut *tx)
        .await?;
    let rec = audit::record(&mut tx, Some(user.0.id), "BOOK", "booking", Some(booking_id),
                            serde_json::json!({ "session_id": input.session_id, "student_id": input.student_id, "student_package_id": sp.id })).await?;
    let booking = load_booking(&mut tx, booking_id).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    info!("Booking created, id: {booking_id}, session id: {}, student id: {}, credits left: {}", input.session_id, input.student_id, sp.credits_remaining);
    ok(booking)
}

#[post("/api/bookings/<booking_id>/cancel")]
async fn cancel_booking(booking_id: i64, user: CurrentUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<BookingCancellation> {
    let booking = load_booking_from_pool(booking_id, &db.0).await?;
    load_accessible_student(booking.student_id, &user.0, &db.0).await?;
    let settings = load_settings(&db.0).await?;
    let mut tx = db.0.begin().await?;
    // only one caller can move the booking out of BOOKED
    let cancelled = sqlx::query("UPDATE bookings SET status=?, cancelled_at=? WHERE id=? AND status=?")
        .bind(BookingStatus::Cancelled)
        .bind(Utc::now())
        .bind(booking_id)
        .bind(BookingStatus::Booked)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    if cancelled == 0 {
        let booking = load_booking(&mut tx, booking_id).await?;
        return Err(ActionError::bad_request(format!("Booking is {}", booking.status)));
    }
    let booking = load_booking(&mut tx, booking_id).await?;
    let refund = refund_due(booking.starts_at, now_local(), settings.cancellation_hours);
    let credit_refunded = match (refund, booking.student_package_id) {
        (true, Some(student_package_id)) => refund_credit(&mut tx, student_package_id, booking_id, Some(user.0.id)).await?.is_some(),
        _ => false,
    };
    let rec = audit::record(&mut tx, Some(user.0.id), "CANCEL", "booking", Some(booking_id), serde_json::json!({ "credit_refunded": credit_refunded })).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    info!("Booking cancelled, id: {booking_id}, credit refunded: {credit_refunded}");
    ok(BookingCancellation { booking, credit_refunded })
}

#[post("/api/bookings/<booking_id>/attendance", data = "<input>")]
async fn mark_attendance(booking_id: i64, input: Json<AttendanceInput>, staff: StaffUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<BookingRecord> {
    if !matches!(input.status, BookingStatus::Attended | BookingStatus::NoShow) {
        return Err(ActionError::bad_request("Attendance must be ATTENDED or NO_SHOW"));
    }
    let booking = load_booking_from_pool(booking_id, &db.0).await?;
    if booking.status == BookingStatus::Cancelled {
        return Err(ActionError::bad_request("Booking is cancelled"));
    }
    if booking.starts_at > now_local() {
        return Err(ActionError::bad_request("Attendance cannot be taken before the session starts"));
    }
    let mut tx = db.0.begin().await?;
    let updated = sqlx::query("UPDATE bookings SET status=? WHERE id=? AND status<>?")
        .bind(input.status)
        .bind(booking_id)
        .bind(BookingStatus::Cancelled)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    if updated == 0 {
        return Err(ActionError::bad_request("Booking is cancelled"));
    }
    let rec = audit::record(&mut tx, Some(staff.0.id), "ATTENDANCE", "booking", Some(booking_id), serde_json::json!({ "status": input.status })).await?;
    let booking = load_booking(&mut tx, booking_id).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    ok(booking)
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
        list_bookings,
        get_booking,
        book,
        cancel_booking,
        mark_attendance,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    #[test]
    fn test_refund_due() {
        let starts_at = at("2025-03-10 17:00");
        assert!(refund_due(starts_at, at("2025-03-09 17:00"), 24));
        assert!(!refund_due(starts_at, at("2025-03-09 17:01"), 24));
        assert!(refund_due(starts_at, at("2025-03-10 16:59"), 0));
    }

    #[test]
    fn test_booking_status_text() {
        assert_eq!(BookingStatus::NoShow.to_string(), "NO_SHOW");
        assert_eq!(serde_json::to_string(&BookingStatus::NoShow).unwrap(), "\"NO_SHOW\"");
        assert_eq!("ATTENDED".parse::<BookingStatus>().unwrap(), BookingStatus::Attended);
    }
}
