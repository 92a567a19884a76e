use chrono::{DateTime, Duration, NaiveDate, Utc};
use log::info;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use crate::auth::{AdminUser, CurrentUser, StaffUser};
use crate::db::DbPool;
use crate::students::{load_accessible_student, load_student, today};
use crate::util::{ok, require_non_empty, ActionError, ActionResult, Validate};
use crate::{audit, impl_sqlx_text_enum, impl_text_enum_strings, SharedAcademyState};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum PackageStatus {
    Active,
    Depleted,
    Expired,
}
impl_text_enum_strings!(PackageStatus { Active => "ACTIVE", Depleted => "DEPLETED", Expired => "EXPIRED" });
impl_sqlx_text_enum!(PackageStatus);

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerReason {
    Purchase,
    Assignment,
    Booking,
    BookingCancelled,
    Adjustment,
    Refund,
}
impl_text_enum_strings!(LedgerReason {
    Purchase => "PURCHASE",
    Assignment => "ASSIGNMENT",
    Booking => "BOOKING",
    BookingCancelled => "BOOKING_CANCELLED",
    Adjustment => "ADJUSTMENT",
    Refund => "REFUND",
});
impl_sqlx_text_enum!(LedgerReason);

/// Expired wins over the credit count, otherwise the package is active while credits remain.
pub fn status_for(credits_remaining: i64, expires_at: Option<NaiveDate>, today: NaiveDate) -> PackageStatus {
    if expires_at.is_some_and(|expires_at| expires_at < today) {
        PackageStatus::Expired
    } else if credits_remaining <= 0 {
        PackageStatus::Depleted
    } else {
        PackageStatus::Active
    }
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct StudentPackageRecord {
    pub id: i64,
    pub student_id: i64,
    pub package_id: i64,
    pub package_name: String,
    pub credits_total: i64,
    pub credits_remaining: i64,
    pub status: PackageStatus,
    pub purchased_at: DateTime<Utc>,
    pub expires_at: Option<NaiveDate>,
    /// Set once the payment behind the package is refunded, the package never holds credits again.
    pub refunded_at: Option<DateTime<Utc>>,
}

const STUDENT_PACKAGE_SELECT: &str = "SELECT sp.id, sp.student_id, sp.package_id, p.name AS package_name,
        sp.credits_total, sp.credits_remaining, sp.status, sp.purchased_at, sp.expires_at, sp.refunded_at
    FROM student_packages sp JOIN packages p ON p.id=sp.package_id";

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct LedgerEntry {
    pub id: i64,
    pub student_package_id: i64,
    pub delta: i64,
    pub reason: LedgerReason,
    pub booking_id: Option<i64>,
    pub created_by: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct StudentPackageDetail {
    pub package: StudentPackageRecord,
    pub ledger: Vec<LedgerEntry>,
}

pub async fn list_student_packages(student_id: i64, pool: &SqlitePool) -> Result<Vec<StudentPackageRecord>, sqlx::Error> {
    sqlx::query_as::<_, StudentPackageRecord>(&format!("{STUDENT_PACKAGE_SELECT} WHERE sp.student_id=? ORDER BY sp.purchased_at DESC"))
        .bind(student_id)
        .fetch_all(pool)
        .await
}

pub async fn load_student_package(conn: &mut SqliteConnection, student_package_id: i64) -> Result<StudentPackageRecord, ActionError> {
    let rec = sqlx::query_as::<_, StudentPackageRecord>(&format!("{STUDENT_PACKAGE_SELECT} WHERE sp.id=?"))
        .bind(student_package_id)
        .fetch_optional(&mut *conn)
        .await?;
    rec.ok_or_else(|| ActionError::not_found(format!("Student package id={student_package_id} not found")))
}

async fn insert_ledger_entry(conn: &mut SqliteConnection, student_package_id: i64, delta: i64, reason: LedgerReason, booking_id: Option<i64>, created_by: Option<i64>) -> Result<i64, sqlx::Error> {
    let (id,): (i64,) = sqlx::query_as("INSERT INTO credit_ledger
                (student_package_id, delta, reason, booking_id, created_by, created_at)
                VALUES (?, ?, ?, ?, ?, ?) RETURNING id")
        .bind(student_package_id)
        .bind(delta)
        .bind(reason)
        .bind(booking_id)
        .bind(created_by)
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await?;
    Ok(id)
}

/// Creates a student's instance of a package with the package's full credits and a matching ledger entry.
pub async fn create_student_package(conn: &mut SqliteConnection, student_id: i64, package_id: i64, reason: LedgerReason, created_by: Option<i64>) -> Result<StudentPackageRecord, ActionError> {
    let package: Option<(i64, Option<i64>, bool)> = sqlx::query_as("SELECT credits, validity_days, is_active FROM packages WHERE id=?")
        .bind(package_id)
        .fetch_optional(&mut *conn)
        .await?;
    let Some((credits, validity_days, is_active)) = package else {
        return Err(ActionError::not_found(format!("Package id={package_id} not found")));
    };
    if !is_active {
        return Err(ActionError::bad_request("Package is not available"));
    }
    let expires_at = validity_days.map(|days| today() + Duration::days(days));
    let (id,): (i64,) = sqlx::query_as("INSERT INTO student_packages
                (student_id, package_id, credits_total, credits_remaining, status, purchased_at, expires_at)
                VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id")
        .bind(student_id)
        .bind(package_id)
        .bind(credits)
        .bind(credits)
        .bind(status_for(credits, expires_at, today()))
        .bind(Utc::now())
        .bind(expires_at)
        .fetch_one(&mut *conn)
        .await?;
    insert_ledger_entry(conn, id, credits, reason, None, created_by).await?;
    info!("Student package created, id: {id}, student id: {student_id}, package id: {package_id}, credits: {credits}");
    load_student_package(conn, id).await
}

/// Moves the credit balance by `delta`, writes the ledger entry and recomputes the status.
pub async fn apply_credit_delta(conn: &mut SqliteConnection, student_package_id: i64, delta: i64, reason: LedgerReason, booking_id: Option<i64>, created_by: Option<i64>) -> Result<StudentPackageRecord, ActionError> {
    let sp = load_student_package(conn, student_package_id).await?;
    if delta > 0 && sp.refunded_at.is_some() {
        return Err(ActionError::bad_request(format!("Student package id={student_package_id} was refunded")));
    }
    let remaining = sp.credits_remaining + delta;
    if remaining < 0 {
        return Err(ActionError::bad_request(format!("Not enough credits, {} remaining", sp.credits_remaining)));
    }
    let total = sp.credits_total.max(remaining);
    let status = status_for(remaining, sp.expires_at, today());
    sqlx::query("UPDATE student_packages SET credits_remaining=?, credits_total=?, status=? WHERE id=?")
        .bind(remaining)
        .bind(total)
        .bind(status)
        .bind(student_package_id)
        .execute(&mut *conn)
        .await?;
    insert_ledger_entry(conn, student_package_id, delta, reason, booking_id, created_by).await?;
    load_student_package(conn, student_package_id).await
}

/// Takes one credit from the student's usable package that expires first.
pub async fn consume_credit(conn: &mut SqliteConnection, student_id: i64, booking_id: i64, created_by: Option<i64>) -> Result<StudentPackageRecord, ActionError> {
    let candidate: Option<(i64,)> = sqlx::query_as("SELECT id FROM student_packages
            WHERE student_id=? AND status='ACTIVE' AND credits_remaining>0 AND refunded_at IS NULL AND (expires_at IS NULL OR expires_at>=?)
            ORDER BY expires_at IS NULL, expires_at, id
            LIMIT 1")
        .bind(student_id)
        .bind(today())
        .fetch_optional(&mut *conn)
        .await?;
    let Some((student_package_id,)) = candidate else {
        return Err(ActionError::bad_request("Student has no active package with available credits"));
    };
    apply_credit_delta(conn, student_package_id, -1, LedgerReason::Booking, Some(booking_id), created_by).await
}

/// Gives the credit of a cancelled booking back, `None` when the package was refunded meanwhile.
pub async fn refund_credit(conn: &mut SqliteConnection, student_package_id: i64, booking_id: i64, created_by: Option<i64>) -> Result<Option<StudentPackageRecord>, ActionError> {
    let sp = load_student_package(conn, student_package_id).await?;
    if sp.refunded_at.is_some() {
        info!("Credit not returned, student package id: {student_package_id} was refunded, booking id: {booking_id}");
        return Ok(None);
    }
    let sp = apply_credit_delta(conn, student_package_id, 1, LedgerReason::BookingCancelled, Some(booking_id), created_by).await?;
    Ok(Some(sp))
}

/// Removes the remaining credits of a refunded package and closes it for good. Returns the credits removed.
pub async fn revoke_package(conn: &mut SqliteConnection, student_package_id: i64, created_by: Option<i64>) -> Result<i64, ActionError> {
    let sp = load_student_package(conn, student_package_id).await?;
    if sp.refunded_at.is_some() {
        return Ok(0);
    }
    let removed = sp.credits_remaining.max(0);
    if removed > 0 {
        apply_credit_delta(conn, student_package_id, -removed, LedgerReason::Refund, None, created_by).await?;
    }
    sqlx::query("UPDATE student_packages SET refunded_at=? WHERE id=?")
        .bind(Utc::now())
        .bind(student_package_id)
        .execute(&mut *conn)
        .await?;
    Ok(removed)
}

pub async fn expire_overdue(pool: &SqlitePool) -> Result<u64, sqlx::Error> {
    let res = sqlx::query("UPDATE student_packages SET status='EXPIRED' WHERE status<>'EXPIRED' AND expires_at IS NOT NULL AND expires_at<?")
        .bind(today())
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

#[derive(Serialize, Deserialize, Debug)]
pub struct AssignPackageInput {
    pub student_id: i64,
    pub package_id: i64,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct AdjustCreditsInput {
    pub delta: i64,
    pub note: String,
}
impl Validate for AdjustCreditsInput {
    fn validate(&self) -> Result<(), ActionError> {
        if self.delta == 0 {
            return Err(ActionError::bad_request("Credit adjustment cannot be zero"));
        }
        require_non_empty("Reason", &self.note)
    }
}

#[get("/api/students/<student_id>/packages")]
async fn get_student_packages(student_id: i64, user: CurrentUser, db: &State<DbPool>) -> ActionResult<Vec<StudentPackageRecord>> {
    load_accessible_student(student_id, &user.0, &db.0).await?;
    ok(list_student_packages(student_id, &db.0).await?)
}

#[get("/api/student-packages/<student_package_id>")]
async fn get_student_package(student_package_id: i64, user: CurrentUser, db: &State<DbPool>) -> ActionResult<StudentPackageDetail> {
    let mut conn = db.0.acquire().await?;
    let package = load_student_package(&mut conn, student_package_id).await?;
    let ledger = sqlx::query_as::<_, LedgerEntry>("SELECT * FROM credit_ledger WHERE student_package_id=? ORDER BY id")
        .bind(student_package_id)
        .fetch_all(&mut *conn)
        .await?;
    drop(conn);
    load_accessible_student(package.student_id, &user.0, &db.0).await?;
    ok(StudentPackageDetail { package, ledger })
}

#[post("/api/student-packages", data = "<input>")]
async fn assign_package(input: Json<AssignPackageInput>, staff: StaffUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<StudentPackageRecord> {
    load_student(input.student_id, &db.0).await?;
    let mut tx = db.0.begin().await?;
    let sp = create_student_package(&mut tx, input.student_id, input.package_id, LedgerReason::Assignment, Some(staff.0.id)).await?;
    let rec = audit::record(&mut tx, Some(staff.0.id), "ASSIGN", "student_package", Some(sp.id),
                            serde_json::json!({ "student_id": input.student_id, "package_id": input.package_id, "credits": sp.credits_total })).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    ok(sp)
}

#[post("/api/student-packages/<student_package_id>/adjust", data = "<input>")]
async fn adjust_credits(student_package_id: i64, input: Json<AdjustCreditsInput>, staff: StaffUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<StudentPackageRecord> {
    input.validate()?;
    let mut tx = db.0.begin().await?;
    let sp = apply_credit_delta(&mut tx, student_package_id, input.delta, LedgerReason::Adjustment, None, Some(staff.0.id)).await?;
    let rec = audit::record(&mut tx, Some(staff.0.id), "ADJUST_CREDITS", "student_package", Some(student_package_id),
                            serde_json::json!({ "delta": input.delta, "note": input.note, "credits_remaining": sp.credits_remaining })).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    info!("Credits adjusted, student package id: {student_package_id}, delta: {}", input.delta);
    ok(sp)
}

#[post("/api/student-packages/expire")]
async fn expire_packages(admin: AdminUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<u64> {
    let expired = expire_overdue(&db.0).await?;
    let mut conn = db.0.acquire().await?;
    let rec = audit::record(&mut conn, Some(admin.0.id), "EXPIRE", "student_package", None, serde_json::json!({ "expired": expired })).await?;
    audit::publish(state, rec);
    info!("Overdue student packages expired: {expired}");
    ok(expired)
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
        get_student_packages,
        get_student_package,
        assign_package,
        adjust_credits,
        expire_packages,
    ])
}
