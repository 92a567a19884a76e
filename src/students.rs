use std::collections::HashMap;
use academyd_proc_macros::PatchFields;
use chrono::{DateTime, Datelike, Local, NaiveDate, Utc};
use log::info;
use rocket::serde::json::Json;
use rocket::data::{Data, ToByteUnit};
use rocket::http::Status;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use crate::auth::{normalize_email, AdminUser, CurrentUser, SessionUser, StaffUser};
use crate::csvio::{parse_csv, to_csv, CsvFile, CsvLineError};
use crate::db::{count, update_sql, DbPool};
use crate::student_package::{list_student_packages, PackageStatus, StudentPackageRecord};
use crate::util::{ok, require_non_empty, trim_opt, ActionError, ActionResult, Validate};
use crate::{audit, SharedAcademyState};

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct StudentRecord {
    pub id: i64,
    pub parent_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct StudentDetail {
    pub student: StudentRecord,
    pub age: i64,
    pub active_packages: Vec<StudentPackageRecord>,
    pub credits_available: i64,
    pub upcoming_bookings: i64,
}

/// Full years between `date_of_birth` and `today`.
pub fn age_on(date_of_birth: NaiveDate, today: NaiveDate) -> i64 {
    let mut age = (today.year() - date_of_birth.year()) as i64;
    if (today.month(), today.day()) < (date_of_birth.month(), date_of_birth.day()) {
        age -= 1;
    }
    age
}

pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

pub async fn load_student(student_id: i64, pool: &SqlitePool) -> Result<StudentRecord, ActionError> {
    let student = sqlx::query_as::<_, StudentRecord>("SELECT * FROM students WHERE id=?")
        .bind(student_id)
        .fetch_optional(pool)
        .await?;
    student.ok_or_else(|| ActionError::not_found(format!("Student id={student_id} not found")))
}

/// Parents may only touch their own children, staff may touch everybody.
pub fn ensure_student_access(user: &SessionUser, student: &StudentRecord) -> Result<(), ActionError> {
    if user.role.is_staff() || student.parent_id == user.id {
        Ok(())
    } else {
        Err(ActionError::forbidden("This student does not belong to your family"))
    }
}

/// Loads a student and checks that `user` may access it.
pub async fn load_accessible_student(student_id: i64, user: &SessionUser, pool: &SqlitePool) -> Result<StudentRecord, ActionError> {
    let student = load_student(student_id, pool).await?;
    ensure_student_access(user, &student)?;
    Ok(student)
}

fn validate_date_of_birth(date_of_birth: NaiveDate) -> Result<(), ActionError> {
    if date_of_birth > today() {
        return Err(ActionError::bad_request("Date of birth cannot be in the future"));
    }
    Ok(())
}

#[derive(Serialize, Deserialize, Debug)]
pub struct StudentInput {
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    #[serde(default)]
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub notes: Option<String>,
}
impl Validate for StudentInput {
    fn validate(&self) -> Result<(), ActionError> {
        require_non_empty("First name", &self.first_name)?;
        require_non_empty("Last name", &self.last_name)?;
        validate_date_of_birth(self.date_of_birth)
    }
}

#[derive(Serialize, Deserialize, PatchFields, Default, Debug)]
pub struct StudentPatch {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub date_of_birth: Option<NaiveDate>,
    #[serde(default)]
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub notes: Option<String>,
}
impl Validate for StudentPatch {
    fn validate(&self) -> Result<(), ActionError> {
        if let Some(first_name) = &self.first_name {
            require_non_empty("First name", first_name)?;
        }
        if let Some(last_name) = &self.last_name {
            require_non_empty("Last name", last_name)?;
        }
        if let Some(date_of_birth) = self.date_of_birth {
            validate_date_of_birth(date_of_birth)?;
        }
        Ok(())
    }
}

async fn ensure_parent_exists(parent_id: i64, pool: &SqlitePool) -> Result<(), ActionError> {
    if count(pool, "SELECT COUNT(*) FROM users WHERE id=?", parent_id).await? == 0 {
        return Err(ActionError::bad_request(format!("Parent user id={parent_id} not found")));
    }
    Ok(())
}

#[get("/api/students?<parent_id>")]
async fn list_students(parent_id: Option<i64>, user: CurrentUser, db: &State<DbPool>) -> ActionResult<Vec<StudentRecord>> {
    let parent_id = if user.0.role.is_staff() { parent_id } else { Some(user.0.id) };
    let students = match parent_id {
        Some(parent_id) => sqlx::query_as::<_, StudentRecord>("SELECT * FROM students WHERE parent_id=? ORDER BY last_name, first_name")
            .bind(parent_id)
            .fetch_all(&db.0)
            .await?,
        None => sqlx::query_as::<_, StudentRecord>("SELECT * FROM students ORDER BY last_name, first_name")
            .fetch_all(&db.0)
            .await?,
    };
    ok(students)
}

#[get("/api/students/<student_id>")]
async fn get_student(student_id: i64, user: CurrentUser, db: &State<DbPool>) -> ActionResult<StudentDetail> {
    let student = load_accessible_student(student_id, &user.0, &db.0).await?;
    let active_packages = list_student_packages(student_id, &db.0).await?
        .into_iter()
        .filter(|p| p.status == PackageStatus::Active)
        .collect::<Vec<_>>();
    let credits_available = active_packages.iter().map(|p| p.credits_remaining).sum();
    let (upcoming_bookings,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM bookings b
            JOIN class_sessions s ON s.id=b.session_id
            WHERE b.student_id=? AND b.status='BOOKED' AND s.starts_at>=?")
        .bind(student_id)
        .bind(Local::now().naive_local())
        .fetch_one(&db.0)
        .await?;
    ok(StudentDetail {
        age: age_on(student.date_of_birth, today()),
        student,
        active_packages,
        credits_available,
        upcoming_bookings,
    })
}

#[post("/api/students", data = "<input>")]
async fn create_student(input: Json<StudentInput>, user: CurrentUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<StudentRecord> {
    input.validate()?;
    let parent_id = if user.0.role.is_staff() {
        input.parent_id.ok_or_else(|| ActionError::bad_request("Parent is required"))?
    } else {
        user.0.id
    };
    ensure_parent_exists(parent_id, &db.0).await?;
    let mut tx = db.0.begin().await?;
    let student: StudentRecord = sqlx::query_as("INSERT INTO students
                (parent_id, first_name, last_name, date_of_birth, notes, created_at)
                VALUES (?, ?, ?, ?, ?, ?) RETURNING *")
        .bind(parent_id)
        .bind(input.first_name.trim())
        .bind(input.last_name.trim())
        .bind(input.date_of_birth)
        .bind(&input.notes)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;
    let rec = audit::record(&mut tx, Some(user.0.id), "CREATE", "student", Some(student.id), serde_json::to_value(&*input).unwrap_or_default()).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    info!("Student created, id: {}, parent id: {parent_id}", student.id);
    ok(student)
}

#[patch("/api/students/<student_id>", data = "<patch>")]
async fn update_student(student_id: i64, mut patch: Json<StudentPatch>, user: CurrentUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<StudentRecord> {
    trim_opt(&mut patch.first_name);
    trim_opt(&mut patch.last_name);
    patch.validate()?;
    let student = load_accessible_student(student_id, &user.0, &db.0).await?;
    let fields = patch.fields_with_value();
    if fields.is_empty() {
        return ok(student);
    }
    if let Some(parent_id) = patch.parent_id {
        if !user.0.role.is_staff() && parent_id != user.0.id {
            return Err(ActionError::forbidden("Only staff can move a student to another family"));
        }
        ensure_parent_exists(parent_id, &db.0).await?;
    }
    let sql = update_sql("students", &fields);
    let mut tx = db.0.begin().await?;
    patch.bind_values(sqlx::query(&sql))
        .bind(student_id)
        .execute(&mut *tx)
        .await?;
    let rec = audit::record(&mut tx, Some(user.0.id), "UPDATE", "student", Some(student_id), serde_json::to_value(&*patch).unwrap_or_default()).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    ok(load_student(student_id, &db.0).await?)
}

#[delete("/api/students/<student_id>")]
async fn delete_student(student_id: i64, user: CurrentUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<i64> {
    let student = load_accessible_student(student_id, &user.0, &db.0).await?;
    let bookings = count(&db.0, "SELECT COUNT(*) FROM bookings WHERE student_id=?", student_id).await?;
    if bookings > 0 {
        return Err(ActionError::conflict(format!("Cannot delete student with {bookings} booking(s)")));
    }
    let packages = count(&db.0, "SELECT COUNT(*) FROM student_packages WHERE student_id=?", student_id).await?;
    if packages > 0 {
        return Err(ActionError::conflict(format!("Cannot delete student with {packages} package(s)")));
    }
    let payments = count(&db.0, "SELECT COUNT(*) FROM payments WHERE student_id=?", student_id).await?;
    if payments > 0 {
        return Err(ActionError::conflict(format!("Cannot delete student with {payments} payment(s)")));
    }
    let mut tx = db.0.begin().await?;
    sqlx::query("DELETE FROM students WHERE id=?")
        .bind(student_id)
        .execute(&mut *tx)
        .await?;
    let rec = audit::record(&mut tx, Some(user.0.id), "DELETE", "student", Some(student_id),
                            serde_json::json!({ "name": format!("{} {}", student.first_name, student.last_name) })).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    info!("Student deleted, id: {student_id}");
    ok(student_id)
}

const IMPORT_LIMIT_MIB: u64 = 2;

#[derive(Serialize, Deserialize, Debug)]
pub struct StudentCsvRow {
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: String,
    pub parent_email: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ImportReport {
    pub imported: usize,
    pub errors: Vec<CsvLineError>,
}

#[derive(Debug)]
struct NewStudent {
    parent_id: i64,
    first_name: String,
    last_name: String,
    date_of_birth: NaiveDate,
    notes: Option<String>,
}

fn check_import_row(row: StudentCsvRow, parents: &HashMap<String, i64>) -> Result<NewStudent, String> {
    require_non_empty("first_name", &row.first_name).map_err(|e| e.message)?;
    require_non_empty("last_name", &row.last_name).map_err(|e| e.message)?;
    let date_of_birth = NaiveDate::parse_from_str(&row.date_of_birth, "%Y-%m-%d")
        .map_err(|e| format!("Invalid date_of_birth '{}': {e}", row.date_of_birth))?;
    validate_date_of_birth(date_of_birth).map_err(|e| e.message)?;
    let email = normalize_email(&row.parent_email);
    let parent_id = *parents.get(&email).ok_or_else(|| format!("Unknown parent email: {email}"))?;
    Ok(NewStudent {
        parent_id,
        first_name: row.first_name,
        last_name: row.last_name,
        date_of_birth,
        notes: row.notes.filter(|n| !n.is_empty()),
    })
}

#[post("/api/students/import", data = "<data>")]
async fn import_students(data: Data<'_>, admin: AdminUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<ImportReport> {
    let csv_text = data.open(IMPORT_LIMIT_MIB.mebibytes()).into_string().await
        .map_err(|e| ActionError::bad_request(format!("Cannot read CSV: {e}")))?;
    if !csv_text.is_complete() {
        return Err(ActionError::new(Status::PayloadTooLarge, format!("CSV is larger than {IMPORT_LIMIT_MIB} MiB")));
    }
    let rows = parse_csv::<StudentCsvRow>(&csv_text).map_err(|e| ActionError::bad_request(format!("Invalid CSV: {e}")))?;
    if rows.is_empty() {
        return Err(ActionError::bad_request("CSV contains no data rows"));
    }
    let parents: HashMap<String, i64> = sqlx::query_as::<_, (String, i64)>("SELECT email, id FROM users")
        .fetch_all(&db.0)
        .await?
        .into_iter()
        .collect();
    let mut errors = vec![];
    let mut new_students = vec![];
    for (line, row) in rows {
        match row.and_then(|row| check_import_row(row, &parents)) {
            Ok(student) => new_students.push(student),
            Err(error) => errors.push(CsvLineError { line, error }),
        }
    }
    if !errors.is_empty() {
        info!("Student import rejected, {} invalid row(s)", errors.len());
        return ok(ImportReport { imported: 0, errors });
    }
    let mut tx = db.0.begin().await?;
    let now = Utc::now();
    for student in &new_students {
        sqlx::query("INSERT INTO students
                (parent_id, first_name, last_name, date_of_birth, notes, created_at)
                VALUES (?, ?, ?, ?, ?, ?)")
            .bind(student.parent_id)
            .bind(student.first_name.trim())
            .bind(student.last_name.trim())
            .bind(student.date_of_birth)
            .bind(&student.notes)
            .bind(now)
            .execute(&mut *tx)
            .await?;
    }
    let rec = audit::record(&mut tx, Some(admin.0.id), "IMPORT", "student", None, serde_json::json!({ "rows": new_students.len() })).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    info!("Students imported: {}", new_students.len());
    ok(ImportReport { imported: new_students.len(), errors })
}

#[derive(Serialize, Debug, FromRow)]
struct StudentExportRow {
    id: i64,
    first_name: String,
    last_name: String,
    date_of_birth: NaiveDate,
    parent_email: String,
    parent_name: String,
    notes: Option<String>,
}

#[get("/api/students/export")]
async fn export_students(_staff: StaffUser, db: &State<DbPool>) -> Result<CsvFile, ActionError> {
    let rows = sqlx::query_as::<_, StudentExportRow>("SELECT s.id, s.first_name, s.last_name, s.date_of_birth,
                u.email AS parent_email, u.name AS parent_name, s.notes
            FROM students s JOIN users u ON u.id=s.parent_id
            ORDER BY s.last_name, s.first_name")
        .fetch_all(&db.0)
        .await?;
    Ok(CsvFile {
        file_name: "students.csv".to_string(),
        content: to_csv(&rows)?,
    })
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
        list_students,
        export_students,
        import_students,
        get_student,
        create_student,
        update_student,
        delete_student,
    ])
}
