use academyd_proc_macros::PatchFields;
use chrono::{DateTime, Datelike, Days, Duration, Local, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use log::info;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use crate::auth::{AdminUser, StaffUser};
use crate::bookings::BookingStatus;
use crate::classes::load_template;
use crate::db::{update_sql, DbPool};
use crate::student_package::refund_credit;
use crate::util::{ok, parse_opt_date, require_positive, ActionError, ActionResult, Validate};
use crate::{audit, impl_sqlx_text_enum, impl_text_enum_strings, AppConfig, SharedAcademyState};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Scheduled,
    Cancelled,
    Completed,
}
impl_text_enum_strings!(SessionStatus { Scheduled => "SCHEDULED", Cancelled => "CANCELLED", Completed => "COMPLETED" });
impl_sqlx_text_enum!(SessionStatus);

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct ScheduleRecord {
    pub id: i64,
    pub template_id: i64,
    pub location_id: i64,
    pub coach_id: Option<i64>,
    /// 0 = Sunday .. 6 = Saturday
    pub day_of_week: i64,
    pub start_time: String,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct SessionRecord {
    pub id: i64,
    pub schedule_id: Option<i64>,
    pub template_id: i64,
    pub template_name: String,
    pub location_id: i64,
    pub location_name: String,
    pub coach_id: Option<i64>,
    pub starts_at: NaiveDateTime,
    pub ends_at: NaiveDateTime,
    pub capacity: i64,
    pub status: SessionStatus,
    pub booked: i64,
}

/// `booked` counts every booking that holds a seat.
const SESSION_SELECT: &str = "SELECT s.id, s.schedule_id, s.template_id, t.name AS template_name,
        s.location_id, l.name AS location_name, s.coach_id, s.starts_at, s.ends_at, s.capacity, s.status,
        (SELECT COUNT(*) FROM bookings b WHERE b.session_id=s.id AND b.status<>'CANCELLED') AS booked
    FROM class_sessions s
    JOIN class_templates t ON t.id=s.template_id
    JOIN locations l ON l.id=s.location_id";

#[derive(Default, Debug)]
pub struct SessionFilter {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub location_id: Option<i64>,
    pub template_id: Option<i64>,
    pub coach_id: Option<i64>,
}

pub async fn list_sessions(filter: &SessionFilter, pool: &SqlitePool) -> Result<Vec<SessionRecord>, sqlx::Error> {
    let mut query_builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!("{SESSION_SELECT} WHERE 1=1"));
    if let Some(from) = filter.from {
        query_builder.push(" AND s.starts_at>=");
        query_builder.push_bind(from.and_time(NaiveTime::MIN));
    }
    // the last calendar day has no upper bound
    if let Some(end) = filter.to.and_then(|to| to.succ_opt()) {
        query_builder.push(" AND s.starts_at<");
        query_builder.push_bind(end.and_time(NaiveTime::MIN));
    }
    if let Some(location_id) = filter.location_id {
        query_builder.push(" AND s.location_id=");
        query_builder.push_bind(location_id);
    }
    if let Some(template_id) = filter.template_id {
        query_builder.push(" AND s.template_id=");
        query_builder.push_bind(template_id);
    }
    if let Some(coach_id) = filter.coach_id {
        query_builder.push(" AND s.coach_id=");
        query_builder.push_bind(coach_id);
    }
    query_builder.push(" ORDER BY s.starts_at, s.id");
    query_builder.build_query_as::<SessionRecord>()
        .fetch_all(pool)
        .await
}

pub async fn load_session(session_id: i64, pool: &SqlitePool) -> Result<SessionRecord, ActionError> {
    sqlx::query_as::<_, SessionRecord>(&format!("{SESSION_SELECT} WHERE s.id=?"))
        .bind(session_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ActionError::not_found(format!("Session id={session_id} not found")))
}

async fn load_schedule(schedule_id: i64, pool: &SqlitePool) -> Result<ScheduleRecord, ActionError> {
    sqlx::query_as::<_, ScheduleRecord>("SELECT * FROM class_schedules WHERE id=?")
        .bind(schedule_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ActionError::not_found(format!("Schedule id={schedule_id} not found")))
}

pub fn parse_start_time(start_time: &str) -> Result<NaiveTime, ActionError> {
    NaiveTime::parse_from_str(start_time.trim(), "%H:%M")
        .map_err(|_| ActionError::bad_request(format!("Start time '{start_time}' is not in HH:MM format")))
}

fn validate_day_of_week(day_of_week: i64) -> Result<(), ActionError> {
    if !(0..=6).contains(&day_of_week) {
        return Err(ActionError::bad_request("Day of week must be between 0 (Sunday) and 6 (Saturday)"));
    }
    Ok(())
}

fn validate_date_range(start_date: NaiveDate, end_date: Option<NaiveDate>) -> Result<(), ActionError> {
    if end_date.is_some_and(|end_date| end_date < start_date) {
        return Err(ActionError::bad_request("End date must not be before start date"));
    }
    Ok(())
}

/// Dates falling on `day_of_week` (0 = Sunday) inside both [from, to] and the schedule's [start_date, end_date].
pub fn occurrences(day_of_week: i64, start_date: NaiveDate, end_date: Option<NaiveDate>, from: NaiveDate, to: NaiveDate) -> Vec<NaiveDate> {
    let first = from.max(start_date);
    let last = match end_date {
        Some(end_date) => to.min(end_date),
        None => to,
    };
    if first > last {
        return vec![];
    }
    let offset = (day_of_week - first.weekday().num_days_from_sunday() as i64).rem_euclid(7);
    let mut next = first.checked_add_days(Days::new(offset as u64));
    let mut ret = vec![];
    while let Some(day) = next.filter(|day| *day <= last) {
        ret.push(day);
        next = day.checked_add_days(Days::new(7));
    }
    ret
}

async fn check_session_refs(template_id: Option<i64>, location_id: Option<i64>, coach_id: Option<i64>, pool: &SqlitePool) -> Result<(), ActionError> {
    if let Some(template_id) = template_id {
        load_template(template_id, pool).await?;
    }
    if let Some(location_id) = location_id {
        crate::locations::load_location(location_id, pool).await?;
    }
    if let Some(coach_id) = coach_id {
        crate::coaches::load_coach(coach_id, pool).await?;
    }
    Ok(())
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ScheduleInput {
    pub template_id: i64,
    pub location_id: i64,
    #[serde(default)]
    pub coach_id: Option<i64>,
    pub day_of_week: i64,
    pub start_time: String,
    pub start_date: NaiveDate,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
}
impl Validate for ScheduleInput {
    fn validate(&self) -> Result<(), ActionError> {
        validate_day_of_week(self.day_of_week)?;
        parse_start_time(&self.start_time)?;
        validate_date_range(self.start_date, self.end_date)
    }
}

#[derive(Serialize, Deserialize, PatchFields, Default, Debug)]
pub struct SchedulePatch {
    #[serde(default)]
    pub location_id: Option<i64>,
    #[serde(default)]
    pub coach_id: Option<i64>,
    #[serde(default)]
    pub day_of_week: Option<i64>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

#[get("/api/schedules?<template_id>&<location_id>")]
async fn list_schedules(template_id: Option<i64>, location_id: Option<i64>, db: &State<DbPool>) -> ActionResult<Vec<ScheduleRecord>> {
    let mut query_builder: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM class_schedules WHERE 1=1");
    if let Some(template_id) = template_id {
        query_builder.push(" AND template_id=");
        query_builder.push_bind(template_id);
    }
    if let Some(location_id) = location_id {
        query_builder.push(" AND location_id=");
        query_builder.push_bind(location_id);
    }
    query_builder.push(" ORDER BY day_of_week, start_time");
    let schedules = query_builder.build_query_as::<ScheduleRecord>()
        .fetch_all(&db.0)
        .await?;
    ok(schedules)
}

#[get("/api/schedules/<schedule_id>")]
async fn get_schedule(schedule_id: i64, db: &State<DbPool>) -> ActionResult<ScheduleRecord> {
    ok(load_schedule(schedule_id, &db.0).await?)
}

#[post("/api/schedules", data = "<input>")]
async fn create_schedule(input: Json<ScheduleInput>, admin: AdminUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<ScheduleRecord> {
    input.validate()?;
    check_session_refs(Some(input.template_id), Some(input.location_id), input.coach_id, &db.0).await?;
    let start_time = parse_start_time(&input.start_time)?.format("%H:%M").to_string();
    let mut tx = db.0.begin().await?;
    let schedule: ScheduleRecord = sqlx::query_as("INSERT INTO class_schedules
                (template_id, location_id, coach_id, day_of_week, start_time, start_date, end_date, is_active, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?) RETURNING *")
        .bind(input.template_id)
        .bind(input.location_id)
        .bind(input.coach_id)
        .bind(input.day_of_week)
        .bind(start_time)
        .bind(input.start_date)
        .bind(input.end_date)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;
    let rec = audit::record(&mut tx, Some(admin.0.id), "CREATE", "schedule", Some(schedule.id), serde_json::to_value(&*input).unwrap_or_default()).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    info!("Schedule created, id: {}, template id: {}, day: {}, time: {}", schedule.id, schedule.template_id, schedule.day_of_week, schedule.start_time);
    ok(schedule)
}

#[patch("/api/schedules/<schedule_id>", data = "<patch>")]
async fn update_schedule(schedule_id: i64, mut patch: Json<SchedulePatch>, admin: AdminUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<ScheduleRecord> {
    let schedule = load_schedule(schedule_id, &db.0).await?;
    if let Some(day_of_week) = patch.day_of_week {
        validate_day_of_week(day_of_week)?;
    }
    if let Some(start_time) = &patch.start_time {
        patch.start_time = Some(parse_start_time(start_time)?.format("%H:%M").to_string());
    }
    validate_date_range(patch.start_date.unwrap_or(schedule.start_date), patch.end_date.or(schedule.end_date))?;
    let fields = patch.fields_with_value();
    if fields.is_empty() {
        return ok(schedule);
    }
    check_session_refs(None, patch.location_id, patch.coach_id, &db.0).await?;
    let sql = update_sql("class_schedules", &fields);
    let mut tx = db.0.begin().await?;
    patch.bind_values(sqlx::query(&sql))
        .bind(schedule_id)
        .execute(&mut *tx)
        .await?;
    let rec = audit::record(&mut tx, Some(admin.0.id), "UPDATE", "schedule", Some(schedule_id), serde_json::to_value(&*patch).unwrap_or_default()).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    ok(load_schedule(schedule_id, &db.0).await?)
}

#[delete("/api/schedules/<schedule_id>")]
async fn delete_schedule(schedule_id: i64, admin: AdminUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<i64> {
    load_schedule(schedule_id, &db.0).await?;
    let (bookings,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM bookings b
            JOIN class_sessions s ON s.id=b.session_id
            WHERE s.schedule_id=?")
        .bind(schedule_id)
        .fetch_one(&db.0)
        .await?;
    if bookings > 0 {
        return Err(ActionError::conflict(format!("Cannot delete schedule whose sessions have {bookings} booking(s). Deactivate it instead.")));
    }
    let mut tx = db.0.begin().await?;
    let sessions = sqlx::query("DELETE FROM class_sessions WHERE schedule_id=?")
        .bind(schedule_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    sqlx::query("DELETE FROM class_schedules WHERE id=?")
        .bind(schedule_id)
        .execute(&mut *tx)
        .await?;
    let rec = audit::record(&mut tx, Some(admin.0.id), "DELETE", "schedule", Some(schedule_id), serde_json::json!({ "sessions_deleted": sessions })).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    info!("Schedule deleted, id: {schedule_id}, sessions deleted: {sessions}");
    ok(schedule_id)
}

/// Longest range a single generate call may cover.
pub const MAX_GENERATE_DAYS: i64 = 366;

#[derive(Serialize, Deserialize, Debug)]
pub struct GenerateSessionsInput {
    pub from: NaiveDate,
    #[serde(default)]
    pub to: Option<NaiveDate>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct GenerateSessionsReport {
    pub created: u64,
    pub skipped: u64,
}

#[post("/api/schedules/<schedule_id>/generate", data = "<input>")]
async fn generate_sessions(schedule_id: i64, input: Json<GenerateSessionsInput>, admin: AdminUser, cfg: &State<AppConfig>, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<GenerateSessionsReport> {
    let schedule = load_schedule(schedule_id, &db.0).await?;
    if !schedule.is_active {
        return Err(ActionError::bad_request("Schedule is not active"));
    }
    let to = match input.to {
        Some(to) => to,
        None => input.from.checked_add_signed(Duration::days(cfg.session_horizon_days))
            .ok_or_else(|| ActionError::bad_request("Session horizon reaches past the last supported date"))?,
    };
    if to < input.from {
        return Err(ActionError::bad_request("End of the range must not be before its start"));
    }
    if (to - input.from).num_days() > MAX_GENERATE_DAYS {
        return Err(ActionError::bad_request(format!("Sessions can be generated for at most {MAX_GENERATE_DAYS} days at once")));
    }
    let template = load_template(schedule.template_id, &db.0).await?;
    let start_time = parse_start_time(&schedule.start_time)?;
    let dates = occurrences(schedule.day_of_week, schedule.start_date, schedule.end_date, input.from, to);
    let mut report = GenerateSessionsReport { created: 0, skipped: 0 };
    let mut tx = db.0.begin().await?;
    for date in dates {
        let starts_at = date.and_time(start_time);
        let inserted = sqlx::query("INSERT INTO class_sessions
                    (schedule_id, template_id, location_id, coach_id, starts_at, ends_at, capacity, status, created_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT (schedule_id, starts_at) DO NOTHING")
            .bind(schedule.id)
            .bind(schedule.template_id)
            .bind(schedule.location_id)
            .bind(schedule.coach_id)
            .bind(starts_at)
            .bind(starts_at + Duration::minutes(template.duration_minutes))
            .bind(template.capacity)
            .bind(SessionStatus::Scheduled)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if inserted > 0 {
            report.created += 1;
        } else {
            report.skipped += 1;
        }
    }
    let rec = audit::record(&mut tx, Some(admin.0.id), "GENERATE_SESSIONS", "schedule", Some(schedule_id),
                            serde_json::json!({ "from": input.from, "to": to, "created": report.created })).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    info!("Sessions generated, schedule id: {schedule_id}, {} .. {to}, created: {}, skipped: {}", input.from, report.created, report.skipped);
    ok(report)
}

#[get("/api/sessions?<from>&<to>&<location_id>&<template_id>&<coach_id>")]
async fn get_sessions(from: Option<&str>, to: Option<&str>, location_id: Option<i64>, template_id: Option<i64>, coach_id: Option<i64>, db: &State<DbPool>) -> ActionResult<Vec<SessionRecord>> {
    let filter = SessionFilter {
        from: parse_opt_date("From", from)?,
        to: parse_opt_date("To", to)?,
        location_id,
        template_id,
        coach_id,
    };
    ok(list_sessions(&filter, &db.0).await?)
}

#[get("/api/sessions/<session_id>")]
async fn get_session(session_id: i64, db: &State<DbPool>) -> ActionResult<SessionRecord> {
    ok(load_session(session_id, &db.0).await?)
}

#[derive(Serialize, Deserialize, Debug)]
pub struct SessionInput {
    pub template_id: i64,
    pub location_id: i64,
    #[serde(default)]
    pub coach_id: Option<i64>,
    pub starts_at: NaiveDateTime,
    #[serde(default)]
    pub capacity: Option<i64>,
}

#[post("/api/sessions", data = "<input>")]
async fn create_session(input: Json<SessionInput>, admin: AdminUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<SessionRecord> {
    if let Some(capacity) = input.capacity {
        require_positive("Capacity", capacity)?;
    }
    check_session_refs(None, Some(input.location_id), input.coach_id, &db.0).await?;
    let template = load_template(input.template_id, &db.0).await?;
    let mut tx = db.0.begin().await?;
    let (id,): (i64,) = sqlx::query_as("INSERT INTO class_sessions
                (schedule_id, template_id, location_id, coach_id, starts_at, ends_at, capacity, status, created_at)
                VALUES (NULL, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id")
        .bind(input.template_id)
        .bind(input.location_id)
        .bind(input.coach_id)
        .bind(input.starts_at)
        .bind(input.starts_at + Duration::minutes(template.duration_minutes))
        .bind(input.capacity.unwrap_or(template.capacity))
        .bind(SessionStatus::Scheduled)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;
    let rec = audit::record(&mut tx, Some(admin.0.id), "CREATE", "session", Some(id), serde_json::to_value(&*input).unwrap_or_default()).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    info!("One-off session created, id: {id}, starts at: {}", input.starts_at);
    ok(load_session(id, &db.0).await?)
}

#[derive(Serialize, Deserialize, PatchFields, Default, Debug)]
pub struct SessionPatch {
    #[serde(default)]
    pub coach_id: Option<i64>,
    #[serde(default)]
    pub capacity: Option<i64>,
    #[serde(default)]
    pub starts_at: Option<NaiveDateTime>,
}

#[patch("/api/sessions/<session_id>", data = "<patch>")]
async fn update_session(session_id: i64, patch: Json<SessionPatch>, staff: StaffUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<SessionRecord> {
    let session = load_session(session_id, &db.0).await?;
    let mut fields = patch.fields_with_value();
    if fields.is_empty() {
        return ok(session);
    }
    if session.status != SessionStatus::Scheduled {
        return Err(ActionError::bad_request(format!("Session is {}", session.status)));
    }
    if let Some(capacity) = patch.capacity {
        require_positive("Capacity", capacity)?;
    }
    check_session_refs(None, None, patch.coach_id, &db.0).await?;
    let duration = session.ends_at - session.starts_at;
    let ends_at = patch.starts_at.map(|starts_at| starts_at + duration);
    if ends_at.is_some() {
        fields.push("ends_at");
    }
    let sql = update_sql("class_sessions", &fields);
    let mut tx = db.0.begin().await?;
    if let Some(capacity) = patch.capacity {
        let (booked,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM bookings WHERE session_id=? AND status<>?")
            .bind(session_id)
            .bind(BookingStatus::Cancelled)
            .fetch_one(&mut *tx)
            .await?;
        if capacity < booked {
            return Err(ActionError::bad_request(format!("Capacity cannot be lower than the {booked} booked seat(s)")));
        }
    }
    let mut query = patch.bind_values(sqlx::query(&sql));
    if let Some(ends_at) = ends_at {
        query = query.bind(ends_at);
    }
    query.bind(session_id)
        .execute(&mut *tx)
        .await?;
    let rec = audit::record(&mut tx, Some(staff.0.id), "UPDATE", "session", Some(session_id), serde_json::to_value(&*patch).unwrap_or_default()).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    ok(load_session(session_id, &db.0).await?)
}

#[derive(Serialize, Deserialize, Debug)]
pub struct SessionCancellation {
    pub session: SessionRecord,
    pub bookings_cancelled: usize,
    pub credits_refunded: usize,
}

#[post("/api/sessions/<session_id>/cancel")]
async fn cancel_session(session_id: i64, staff: StaffUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<SessionCancellation> {
    let session = load_session(session_id, &db.0).await?;
    if session.status != SessionStatus::Scheduled {
        return Err(ActionError::bad_request(format!("Session is already {}", session.status)));
    }
    let mut tx = db.0.begin().await?;
    let cancelled = sqlx::query("UPDATE class_sessions SET status=? WHERE id=? AND status=?")
        .bind(SessionStatus::Cancelled)
        .bind(session_id)
        .bind(SessionStatus::Scheduled)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    if cancelled == 0 {
        return Err(ActionError::bad_request("Session is no longer scheduled"));
    }
    let bookings: Vec<(i64, Option<i64>)> = sqlx::query_as("SELECT id, student_package_id FROM bookings WHERE session_id=? AND status=?")
        .bind(session_id)
        .bind(BookingStatus::Booked)
        .fetch_all(&mut *tx)
        .await?;
    let mut credits_refunded = 0;
    for (booking_id, student_package_id) in &bookings {
        sqlx::query("UPDATE bookings SET status=?, cancelled_at=? WHERE id=?")
            .bind(BookingStatus::Cancelled)
            .bind(Utc::now())
            .bind(booking_id)
            .execute(&mut *tx)
            .await?;
        if let Some(student_package_id) = student_package_id {
            if refund_credit(&mut tx, *student_package_id, *booking_id, Some(staff.0.id)).await?.is_some() {
                credits_refunded += 1;
            }
        }
    }
    let rec = audit::record(&mut tx, Some(staff.0.id), "CANCEL", "session", Some(session_id),
                            serde_json::json!({ "bookings_cancelled": bookings.len(), "credits_refunded": credits_refunded })).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    info!("Session cancelled, id: {session_id}, bookings cancelled: {}", bookings.len());
    ok(SessionCancellation {
        session: load_session(session_id, &db.0).await?,
        bookings_cancelled: bookings.len(),
        credits_refunded,
    })
}

/// Local wall clock, session times are stored without a zone.
pub fn now_local() -> NaiveDateTime {
    Local::now().naive_local()
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
        list_schedules,
        get_schedule,
        create_schedule,
        update_schedule,
        delete_schedule,
        generate_sessions,
        get_sessions,
        get_session,
        create_session,
        update_session,
        cancel_session,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_occurrences_weekday() {
        // 2025-03-03 is a Monday
        let mondays = occurrences(1, date("2025-01-01"), None, date("2025-03-01"), date("2025-03-31"));
        assert_eq!(mondays, vec![date("2025-03-03"), date("2025-03-10"), date("2025-03-17"), date("2025-03-24"), date("2025-03-31")]);
        let sundays = occurrences(0, date("2025-01-01"), None, date("2025-03-01"), date("2025-03-10"));
        assert_eq!(sundays, vec![date("2025-03-02"), date("2025-03-09")]);
    }

    #[test]
    fn test_occurrences_clipped_by_schedule_range() {
        let saturdays = occurrences(6, date("2025-03-10"), Some(date("2025-03-20")), date("2025-03-01"), date("2025-03-31"));
        assert_eq!(saturdays, vec![date("2025-03-15")]);
        assert!(occurrences(6, date("2025-04-01"), None, date("2025-03-01"), date("2025-03-31")).is_empty());
        assert!(occurrences(6, date("2025-01-01"), Some(date("2025-02-01")), date("2025-03-01"), date("2025-03-31")).is_empty());
    }

    #[test]
    fn test_occurrences_at_end_of_calendar() {
        let last = NaiveDate::MAX;
        let from = last - Duration::days(20);
        let days = occurrences(last.weekday().num_days_from_sunday() as i64, from, None, from, last);
        assert_eq!(days.last(), Some(&last));
        assert_eq!(days.len(), 3);
    }

    #[test]
    fn test_parse_start_time() {
        assert_eq!(parse_start_time("17:30").unwrap(), NaiveTime::from_hms_opt(17, 30, 0).unwrap());
        assert!(parse_start_time("5pm").is_err());
        assert!(parse_start_time("25:00").is_err());
    }

    #[test]
    fn test_session_status_text() {
        assert_eq!(SessionStatus::Cancelled.to_string(), "CANCELLED");
        assert_eq!("SCHEDULED".parse::<SessionStatus>().unwrap(), SessionStatus::Scheduled);
    }
}
