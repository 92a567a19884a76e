use std::collections::HashMap;
use chrono::{DateTime, Utc};
use log::info;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use crate::auth::{CurrentUser, StaffUser};
use crate::csvio::{to_csv, CsvFile};
use crate::db::DbPool;
use crate::packages::price_for_student;
use crate::student_package::{create_student_package, revoke_package, LedgerReason};
use crate::students::{load_accessible_student, load_student};
use crate::util::{ok, parse_opt_date, ActionError, ActionResult};
use crate::{audit, impl_sqlx_text_enum, impl_text_enum_strings, SharedAcademyState};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentMethod {
    Cash,
    Card,
    Transfer,
    Online,
}
impl_text_enum_strings!(PaymentMethod { Cash => "CASH", Card => "CARD", Transfer => "TRANSFER", Online => "ONLINE" });
impl_sqlx_text_enum!(PaymentMethod);

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Refunded,
    Failed,
}
impl_text_enum_strings!(PaymentStatus { Pending => "PENDING", Completed => "COMPLETED", Refunded => "REFUNDED", Failed => "FAILED" });
impl_sqlx_text_enum!(PaymentStatus);

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct PaymentRecord {
    pub id: i64,
    pub user_id: Option<i64>,
    pub student_id: i64,
    pub package_id: i64,
    pub student_package_id: Option<i64>,
    pub amount_cents: i64,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub refunded_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct PaymentInput {
    #[serde(default)]
    pub user_id: Option<i64>,
    pub student_id: i64,
    pub package_id: i64,
    #[serde(default)]
    pub amount_cents: Option<i64>,
    pub method: PaymentMethod,
    #[serde(default = "default_status")]
    pub status: PaymentStatus,
    #[serde(default)]
    pub reference: Option<String>,
}
fn default_status() -> PaymentStatus {
    PaymentStatus::Completed
}

async fn load_payment(conn: &mut SqliteConnection, payment_id: i64) -> Result<PaymentRecord, ActionError> {
    sqlx::query_as::<_, PaymentRecord>("SELECT * FROM payments WHERE id=?")
        .bind(payment_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| ActionError::not_found(format!("Payment id={payment_id} not found")))
}

/// Turns a paid package into the student's credits and links it to the payment.
async fn fulfil(conn: &mut SqliteConnection, payment: &PaymentRecord, created_by: i64) -> Result<i64, ActionError> {
    let sp = create_student_package(conn, payment.student_id, payment.package_id, LedgerReason::Purchase, Some(created_by)).await?;
    sqlx::query("UPDATE payments SET status=?, student_package_id=? WHERE id=?")
        .bind(PaymentStatus::Completed)
        .bind(sp.id)
        .bind(payment.id)
        .execute(&mut *conn)
        .await?;
    Ok(sp.id)
}

#[post("/api/payments", data = "<input>")]
async fn record_payment(input: Json<PaymentInput>, staff: StaffUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<PaymentRecord> {
    if !matches!(input.status, PaymentStatus::Completed | PaymentStatus::Pending) {
        return Err(ActionError::bad_request("A new payment must be COMPLETED or PENDING"));
    }
    let student = load_student(input.student_id, &db.0).await?;
    let user_id = input.user_id.unwrap_or(student.parent_id);
    let mut tx = db.0.begin().await?;
    let amount_cents = match input.amount_cents {
        Some(amount_cents) if amount_cents < 0 => return Err(ActionError::bad_request("Amount cannot be negative")),
        Some(amount_cents) => amount_cents,
        None => price_for_student(&mut tx, input.package_id, input.student_id).await?.price_cents,
    };
    let payment: PaymentRecord = sqlx::query_as("INSERT INTO payments
                (user_id, student_id, package_id, amount_cents, method, status, reference, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING *")
        .bind(user_id)
        .bind(input.student_id)
        .bind(input.package_id)
        .bind(amount_cents)
        .bind(input.method)
        .bind(PaymentStatus::Pending)
        .bind(&input.reference)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;
    if input.status == PaymentStatus::Completed {
        fulfil(&mut tx, &payment, staff.0.id).await?;
    }
    let rec = audit::record(&mut tx, Some(staff.0.id), "CREATE", "payment", Some(payment.id),
                            serde_json::json!({ "student_id": input.student_id, "package_id": input.package_id, "amount_cents": amount_cents, "status": input.status })).await?;
    let payment = load_payment(&mut tx, payment.id).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    info!("Payment recorded, id: {}, amount: {amount_cents}, status: {}", payment.id, payment.status);
    ok(payment)
}

#[post("/api/payments/<payment_id>/complete")]
async fn complete_payment(payment_id: i64, staff: StaffUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<PaymentRecord> {
    let mut tx = db.0.begin().await?;
    let payment = load_payment(&mut tx, payment_id).await?;
    if payment.status != PaymentStatus::Pending {
        return Err(ActionError::bad_request(format!("Only a PENDING payment can be completed, this one is {}", payment.status)));
    }
    let student_package_id = fulfil(&mut tx, &payment, staff.0.id).await?;
    let rec = audit::record(&mut tx, Some(staff.0.id), "COMPLETE", "payment", Some(payment_id), serde_json::json!({ "student_package_id": student_package_id })).await?;
    let payment = load_payment(&mut tx, payment_id).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    info!("Payment completed, id: {payment_id}");
    ok(payment)
}

#[post("/api/payments/<payment_id>/refund")]
async fn refund_payment(payment_id: i64, staff: StaffUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<PaymentRecord> {
    let mut tx = db.0.begin().await?;
    let payment = load_payment(&mut tx, payment_id).await?;
    if payment.status != PaymentStatus::Completed {
        return Err(ActionError::bad_request(format!("Only a COMPLETED payment can be refunded, this one is {}", payment.status)));
    }
    let credits_removed = match payment.student_package_id {
        Some(student_package_id) => revoke_package(&mut tx, student_package_id, Some(staff.0.id)).await?,
        None => 0,
    };
    sqlx::query("UPDATE payments SET status=?, refunded_at=? WHERE id=?")
        .bind(PaymentStatus::Refunded)
        .bind(Utc::now())
        .bind(payment_id)
        .execute(&mut *tx)
        .await?;
    let rec = audit::record(&mut tx, Some(staff.0.id), "REFUND", "payment", Some(payment_id), serde_json::json!({ "credits_removed": credits_removed })).await?;
    let payment = load_payment(&mut tx, payment_id).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    info!("Payment refunded, id: {payment_id}, credits removed: {credits_removed}");
    ok(payment)
}

async fn query_payments(student_id: Option<i64>, status: Option<&str>, from: Option<&str>, to: Option<&str>, parent_id: Option<i64>, pool: &SqlitePool) -> Result<Vec<PaymentRecord>, ActionError> {
    let mut query_builder: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT p.* FROM payments p JOIN students s ON s.id=p.student_id WHERE 1=1");
    if let Some(student_id) = student_id {
        query_builder.push(" AND p.student_id=");
        query_builder.push_bind(student_id);
    }
    if let Some(status) = status {
        let status = status.parse::<PaymentStatus>().map_err(|e| ActionError::bad_request(e.to_string()))?;
        query_builder.push(" AND p.status=");
        query_builder.push_bind(status);
    }
    if let Some(from) = parse_opt_date("From", from)? {
        query_builder.push(" AND substr(p.created_at, 1, 10)>=");
        query_builder.push_bind(from.to_string());
    }
    if let Some(to) = parse_opt_date("To", to)? {
        query_builder.push(" AND substr(p.created_at, 1, 10)<=");
        query_builder.push_bind(to.to_string());
    }
    if let Some(parent_id) = parent_id {
        query_builder.push(" AND s.parent_id=");
        query_builder.push_bind(parent_id);
    }
    query_builder.push(" ORDER BY p.created_at DESC, p.id DESC");
    Ok(query_builder.build_query_as::<PaymentRecord>()
        .fetch_all(pool)
        .await?)
}

#[get("/api/payments?<student_id>&<status>&<from>&<to>")]
async fn list_payments(student_id: Option<i64>, status: Option<&str>, from: Option<&str>, to: Option<&str>, user: CurrentUser, db: &State<DbPool>) -> ActionResult<Vec<PaymentRecord>> {
    let parent_id = if user.0.role.is_staff() { None } else { Some(user.0.id) };
    ok(query_payments(student_id, status, from, to, parent_id, &db.0).await?)
}

#[get("/api/payments/<payment_id>")]
async fn get_payment(payment_id: i64, user: CurrentUser, db: &State<DbPool>) -> ActionResult<PaymentRecord> {
    let mut conn = db.0.acquire().await?;
    let payment = load_payment(&mut conn, payment_id).await?;
    drop(conn);
    load_accessible_student(payment.student_id, &user.0, &db.0).await?;
    ok(payment)
}

#[derive(Serialize, Debug)]
struct PaymentCsvRow {
    id: i64,
    created_at: String,
    student: String,
    package: String,
    amount_cents: i64,
    method: String,
    status: String,
    reference: Option<String>,
}

#[get("/api/payments/export?<student_id>&<status>&<from>&<to>")]
async fn export_payments(student_id: Option<i64>, status: Option<&str>, from: Option<&str>, to: Option<&str>, _staff: StaffUser, db: &State<DbPool>) -> Result<CsvFile, ActionError> {
    let payments = query_payments(student_id, status, from, to, None, &db.0).await?;
    let students: HashMap<i64, String> = sqlx::query_as::<_, (i64, String)>("SELECT id, first_name || ' ' || last_name FROM students")
        .fetch_all(&db.0)
        .await?
        .into_iter()
        .collect();
    let packages: HashMap<i64, String> = sqlx::query_as::<_, (i64, String)>("SELECT id, name FROM packages")
        .fetch_all(&db.0)
        .await?
        .into_iter()
        .collect();
    let rows = payments.into_iter().map(|p| PaymentCsvRow {
        id: p.id,
        created_at: p.created_at.to_rfc3339(),
        student: students.get(&p.student_id).cloned().unwrap_or_default(),
        package: packages.get(&p.package_id).cloned().unwrap_or_default(),
        amount_cents: p.amount_cents,
        method: p.method.to_string(),
        status: p.status.to_string(),
        reference: p.reference,
    }).collect::<Vec<_>>();
    Ok(CsvFile {
        file_name: "payments.csv".to_string(),
        content: to_csv(&rows)?,
    })
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
        list_payments,
        export_payments,
        get_payment,
        record_payment,
        complete_payment,
        refund_payment,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_input_defaults_to_completed() {
        let input: PaymentInput = serde_json::from_str(r#"{"student_id": 1, "package_id": 2, "method": "CASH"}"#).unwrap();
        assert_eq!(input.status, PaymentStatus::Completed);
        assert_eq!(input.amount_cents, None);
        assert_eq!(input.method, PaymentMethod::Cash);
    }
}
