use chrono::{Datelike, Duration, Local, Months, NaiveDate};
use rocket::figment::Figment;
use rocket::http::{ContentType, Status};
use rocket::local::blocking::{Client, LocalResponse};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use crate::bookings::{BookingCancellation, BookingRecord};
use crate::files::FileInfo;
use crate::payments::{PaymentRecord, PaymentStatus};
use crate::analytics::{MonthRevenue, Overview};
use crate::audit::AuditRecord;
use crate::auth::SessionUser;
use crate::schedules::{GenerateSessionsReport, SessionRecord};
use crate::settings::AcademySettings;
use crate::student_package::{LedgerReason, PackageStatus, StudentPackageDetail, StudentPackageRecord};
use crate::students::ImportReport;
use crate::util::test::zip_data;
use crate::util::{ActionFailure, ActionSuccess};

const ADMIN_EMAIL: &str = "admin@academy.test";
const ADMIN_PASSWORD: &str = "admin-secret";
const PARENT_PASSWORD: &str = "parent-secret";

fn test_figment() -> Figment {
    rocket::Config::figment()
        .merge(("database_url", "sqlite::memory:"))
        .merge(("admin_email", ADMIN_EMAIL))
        .merge(("admin_password", ADMIN_PASSWORD))
}

fn start_test_server(figment: Figment) -> Client {
    let client = Client::tracked(super::build(figment)).unwrap();
    login(&client, ADMIN_EMAIL, ADMIN_PASSWORD);
    client
}

fn create_test_server() -> Client {
    start_test_server(test_figment())
}

/// Runs a statement on a file database behind the server's back, on a connection of its own.
fn run_sql(database_url: &str, sql: &str) {
    let runtime = rocket::tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    runtime.block_on(async {
        let pool = sqlx::SqlitePool::connect(database_url).await.unwrap();
        sqlx::query(sql).execute(&pool).await.unwrap();
        pool.close().await;
    });
}

fn login(client: &Client, email: &str, password: &str) {
    let resp = client.post("/api/auth/login")
        .json(&json!({ "email": email, "password": password }))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
}

fn register_parent(client: &Client, email: &str) -> i64 {
    let resp = client.post("/api/auth/register")
        .json(&json!({ "email": email, "name": "Parent", "password": PARENT_PASSWORD }))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    data::<Value>(resp)["id"].as_i64().unwrap()
}

fn data<T: DeserializeOwned + Send + 'static>(resp: LocalResponse) -> T {
    let success = resp.into_json::<ActionSuccess<T>>().unwrap();
    assert!(success.success);
    success.data
}

fn error(resp: LocalResponse, status: Status) -> String {
    assert_eq!(resp.status(), status);
    let failure = resp.into_json::<ActionFailure>().unwrap();
    assert!(!failure.success);
    failure.error
}

fn post(client: &Client, uri: &str, body: Value) -> Value {
    let resp = client.post(uri.to_string()).json(&body).dispatch();
    assert_eq!(resp.status(), Status::Ok, "POST {uri}");
    data(resp)
}

fn id_of(value: &Value) -> i64 {
    value["id"].as_i64().unwrap()
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

struct Catalog {
    age_group_id: i64,
    template_id: i64,
    location_id: i64,
    package_id: i64,
}

/// Kids age group, one class template, one location and a single credit package priced 15.00.
fn create_catalog(client: &Client) -> Catalog {
    let age_group_id = id_of(&post(client, "/api/age-groups", json!({ "name": "Kids", "min_age": 5, "max_age": 17 })));
    let class_type_id = id_of(&post(client, "/api/class-types", json!({ "name": "Parkour" })));
    let template_id = id_of(&post(client, "/api/class-templates", json!({
        "name": "Parkour Kids",
        "class_type_id": class_type_id,
        "age_group_id": age_group_id,
        "duration_minutes": 60,
        "capacity": 10,
    })));
    let location_id = id_of(&post(client, "/api/locations", json!({ "name": "Main Gym", "address": "Vault Street 1" })));
    let package_id = id_of(&post(client, "/api/packages", json!({
        "name": "Single class",
        "credits": 1,
        "validity_days": 30,
        "prices": [{ "age_group_id": age_group_id, "price_cents": 1500 }],
    })));
    Catalog { age_group_id, template_id, location_id, package_id }
}

fn create_student(client: &Client, parent_id: i64) -> i64 {
    let date_of_birth = today().checked_sub_months(Months::new(10 * 12)).unwrap();
    id_of(&post(client, "/api/students", json!({
        "first_name": "Ada",
        "last_name": "Flip",
        "date_of_birth": date_of_birth,
        "parent_id": parent_id,
    })))
}

fn create_parent(client: &Client, email: &str) -> i64 {
    id_of(&post(client, "/api/users", json!({ "email": email, "name": "Parent", "role": "PARENT", "password": PARENT_PASSWORD })))
}

fn create_session(client: &Client, catalog: &Catalog, days_ahead: i64) -> i64 {
    let starts_at = (today() + Duration::days(days_ahead)).and_hms_opt(17, 0, 0).unwrap();
    id_of(&post(client, "/api/sessions", json!({
        "template_id": catalog.template_id,
        "location_id": catalog.location_id,
        "starts_at": starts_at,
    })))
}

fn load_student_package(client: &Client, student_package_id: i64) -> StudentPackageDetail {
    let resp = client.get(format!("/api/student-packages/{student_package_id}")).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    data(resp)
}

#[test]
fn login_required() {
    let client = create_test_server();
    let resp = client.post("/api/auth/logout").dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = client.get("/api/users").dispatch();
    error(resp, Status::Unauthorized);

    let resp = client.post("/api/auth/login")
        .json(&json!({ "email": ADMIN_EMAIL, "password": "wrong-password" }))
        .dispatch();
    assert_eq!(error(resp, Status::Unauthorized), "Invalid email or password");
}

#[test]
fn duplicate_class_type_fails() {
    let client = create_test_server();
    post(&client, "/api/class-types", json!({ "name": "Tricking" }));
    let resp = client.post("/api/class-types").json(&json!({ "name": "tricking" })).dispatch();
    let message = error(resp, Status::Conflict);
    assert!(message.contains("already exists"), "{message}");
}

#[test]
fn class_type_with_templates_cannot_be_deleted() {
    let client = create_test_server();
    let catalog = create_catalog(&client);
    let template = client.get(format!("/api/class-templates/{}", catalog.template_id)).dispatch();
    let class_type_id = data::<Value>(template)["class_type_id"].as_i64().unwrap();
    let resp = client.delete(format!("/api/class-types/{class_type_id}")).dispatch();
    error(resp, Status::Conflict);
}

#[test]
fn delete_package_in_use_fails() {
    let client = create_test_server();
    let catalog = create_catalog(&client);
    let parent_id = create_parent(&client, "mum@academy.test");
    let student_id = create_student(&client, parent_id);
    post(&client, "/api/student-packages", json!({ "student_id": student_id, "package_id": catalog.package_id }));

    let resp = client.delete(format!("/api/packages/{}", catalog.package_id)).dispatch();
    let message = error(resp, Status::Conflict);
    assert!(message.contains("purchased"), "{message}");

    let unused = id_of(&post(&client, "/api/packages", json!({ "name": "Unused", "credits": 10 })));
    let resp = client.delete(format!("/api/packages/{unused}")).dispatch();
    assert_eq!(resp.status(), Status::Ok);
}

#[test]
fn booking_consumes_one_credit() {
    let client = create_test_server();
    let catalog = create_catalog(&client);
    let parent_id = create_parent(&client, "dad@academy.test");
    let student_id = create_student(&client, parent_id);

    // amount comes from the age group price
    let resp = client.post("/api/payments")
        .json(&json!({ "student_id": student_id, "package_id": catalog.package_id, "method": "CASH" }))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let payment = data::<PaymentRecord>(resp);
    assert_eq!(payment.status, PaymentStatus::Completed);
    assert_eq!(payment.amount_cents, 1500);
    let student_package_id = payment.student_package_id.unwrap();

    let session_id = create_session(&client, &catalog, 3);
    let resp = client.post("/api/bookings")
        .json(&json!({ "session_id": session_id, "student_id": student_id }))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let booking = data::<BookingRecord>(resp);
    assert_eq!(booking.student_package_id, Some(student_package_id));

    let detail = load_student_package(&client, student_package_id);
    assert_eq!(detail.package.credits_remaining, 0);
    assert_eq!(detail.package.status, PackageStatus::Depleted);
    let reasons = detail.ledger.iter().map(|e| (e.reason, e.delta)).collect::<Vec<_>>();
    assert_eq!(reasons, vec![(LedgerReason::Purchase, 1), (LedgerReason::Booking, -1)]);

    // no credits left for another session
    let other_session_id = create_session(&client, &catalog, 4);
    let resp = client.post("/api/bookings")
        .json(&json!({ "session_id": other_session_id, "student_id": student_id }))
        .dispatch();
    error(resp, Status::BadRequest);

    // early cancellation gives the credit back
    let resp = client.post(format!("/api/bookings/{}/cancel", booking.id)).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let cancellation = data::<BookingCancellation>(resp);
    assert!(cancellation.credit_refunded);
    let detail = load_student_package(&client, student_package_id);
    assert_eq!(detail.package.credits_remaining, 1);
    assert_eq!(detail.package.status, PackageStatus::Active);
    assert_eq!(detail.ledger.last().map(|e| e.reason), Some(LedgerReason::BookingCancelled));

    let resp = client.get(format!("/api/sessions/{session_id}")).dispatch();
    assert_eq!(data::<SessionRecord>(resp).booked, 0);
}

#[test]
fn full_session_and_double_booking_are_refused() {
    let client = create_test_server();
    let catalog = create_catalog(&client);
    let parent_id = create_parent(&client, "family@academy.test");
    let student_id = create_student(&client, parent_id);
    let other_student_id = create_student(&client, parent_id);
    for sid in [student_id, other_student_id] {
        post(&client, "/api/student-packages", json!({ "student_id": sid, "package_id": catalog.package_id }));
        post(&client, "/api/student-packages", json!({ "student_id": sid, "package_id": catalog.package_id }));
    }
    let session_id = create_session(&client, &catalog, 2);
    let resp = client.patch(format!("/api/sessions/{session_id}")).json(&json!({ "capacity": 1 })).dispatch();
    assert_eq!(resp.status(), Status::Ok);

    post(&client, "/api/bookings", json!({ "session_id": session_id, "student_id": student_id }));
    let resp = client.post("/api/bookings").json(&json!({ "session_id": session_id, "student_id": student_id })).dispatch();
    error(resp, Status::Conflict);
    let resp = client.post("/api/bookings").json(&json!({ "session_id": session_id, "student_id": other_student_id })).dispatch();
    assert_eq!(error(resp, Status::Conflict), "Session is full");
}

#[test]
fn cancelled_session_refunds_bookings() {
    let client = create_test_server();
    let catalog = create_catalog(&client);
    let parent_id = create_parent(&client, "kids@academy.test");
    let student_id = create_student(&client, parent_id);
    let sp = post(&client, "/api/student-packages", json!({ "student_id": student_id, "package_id": catalog.package_id }));
    let session_id = create_session(&client, &catalog, 1);
    post(&client, "/api/bookings", json!({ "session_id": session_id, "student_id": student_id }));

    let resp = client.post(format!("/api/sessions/{session_id}/cancel")).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let cancellation = data::<Value>(resp);
    assert_eq!(cancellation["bookings_cancelled"], 1);
    assert_eq!(cancellation["credits_refunded"], 1);
    let detail = load_student_package(&client, id_of(&sp));
    assert_eq!(detail.package.credits_remaining, 1);

    let resp = client.post("/api/bookings").json(&json!({ "session_id": session_id, "student_id": student_id })).dispatch();
    error(resp, Status::BadRequest);
}

#[test]
fn generate_sessions_skips_existing() {
    let client = create_test_server();
    let catalog = create_catalog(&client);
    let from = today();
    let to = from + Duration::days(13);
    let schedule_id = id_of(&post(&client, "/api/schedules", json!({
        "template_id": catalog.template_id,
        "location_id": catalog.location_id,
        "day_of_week": 1,
        "start_time": "17:30",
        "start_date": from,
    })));

    let uri = format!("/api/schedules/{schedule_id}/generate");
    let resp = client.post(uri.clone()).json(&json!({ "from": from, "to": to })).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    assert_eq!(data::<GenerateSessionsReport>(resp), GenerateSessionsReport { created: 2, skipped: 0 });
    let resp = client.post(uri).json(&json!({ "from": from, "to": to })).dispatch();
    assert_eq!(data::<GenerateSessionsReport>(resp), GenerateSessionsReport { created: 0, skipped: 2 });

    let resp = client.get(format!("/api/sessions?from={from}&to={to}&template_id={}", catalog.template_id)).dispatch();
    let sessions = data::<Vec<SessionRecord>>(resp);
    assert_eq!(sessions.len(), 2);
    for session in &sessions {
        assert_eq!(session.schedule_id, Some(schedule_id));
        assert_eq!(session.starts_at.format("%H:%M").to_string(), "17:30");
        assert_eq!(session.ends_at - session.starts_at, Duration::minutes(60));
        assert_eq!(session.capacity, 10);
    }

    let resp = client.post("/api/schedules")
        .json(&json!({
            "template_id": catalog.template_id,
            "location_id": catalog.location_id,
            "day_of_week": 1,
            "start_time": "17:30",
            "start_date": from,
            "end_date": from - Duration::days(1),
        }))
        .dispatch();
    error(resp, Status::BadRequest);

    // no bookings, the schedule goes together with its sessions
    let resp = client.delete(format!("/api/schedules/{schedule_id}")).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = client.get(format!("/api/sessions?from={from}&to={to}")).dispatch();
    assert!(data::<Vec<SessionRecord>>(resp).is_empty());
}

#[test]
fn refunded_payment_depletes_package() {
    let client = create_test_server();
    let catalog = create_catalog(&client);
    let parent_id = create_parent(&client, "refund@academy.test");
    let student_id = create_student(&client, parent_id);
    let resp = client.post("/api/payments")
        .json(&json!({ "student_id": student_id, "package_id": catalog.package_id, "method": "TRANSFER", "status": "PENDING", "amount_cents": 1200 }))
        .dispatch();
    let payment = data::<PaymentRecord>(resp);
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(payment.student_package_id, None);

    let resp = client.post(format!("/api/payments/{}/complete", payment.id)).dispatch();
    let payment = data::<PaymentRecord>(resp);
    assert_eq!(payment.status, PaymentStatus::Completed);
    let student_package_id = payment.student_package_id.unwrap();

    let resp = client.post(format!("/api/payments/{}/refund", payment.id)).dispatch();
    assert_eq!(data::<PaymentRecord>(resp).status, PaymentStatus::Refunded);
    let detail = load_student_package(&client, student_package_id);
    assert_eq!(detail.package.credits_remaining, 0);
    assert_eq!(detail.package.status, PackageStatus::Depleted);
    assert_eq!(detail.ledger.last().map(|e| (e.reason, e.delta)), Some((LedgerReason::Refund, -1)));

    let resp = client.post(format!("/api/payments/{}/refund", payment.id)).dispatch();
    error(resp, Status::BadRequest);

    let resp = client.get("/api/payments/export").dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let csv = resp.into_string().unwrap();
    assert!(csv.starts_with("id,created_at,student,package,amount_cents,method,status,reference"), "{csv}");
    assert!(csv.contains("Ada Flip,Single class,1200,TRANSFER,REFUNDED"), "{csv}");
}

#[test]
fn parent_sees_only_own_family() {
    let client = create_test_server();
    let catalog = create_catalog(&client);
    let other_parent_id = create_parent(&client, "other@academy.test");
    let other_student_id = create_student(&client, other_parent_id);

    register_parent(&client, "me@academy.test");
    let date_of_birth = today().checked_sub_months(Months::new(9 * 12)).unwrap();
    let own = post(&client, "/api/students", json!({ "first_name": "Bo", "last_name": "Roll", "date_of_birth": date_of_birth }));
    let resp = client.get("/api/students").dispatch();
    let students = data::<Vec<Value>>(resp);
    assert_eq!(students.len(), 1);
    assert_eq!(id_of(&students[0]), id_of(&own));

    let resp = client.get(format!("/api/students/{other_student_id}")).dispatch();
    error(resp, Status::Forbidden);
    let resp = client.get(format!("/api/packages/{}/price?student_id={}", catalog.package_id, id_of(&own))).dispatch();
    let quote = data::<Value>(resp);
    assert_eq!(quote["price_cents"], 1500);
    assert_eq!(quote["age_group_id"], catalog.age_group_id);
    let resp = client.get("/api/users").dispatch();
    error(resp, Status::Forbidden);
    let resp = client.post("/api/class-types").json(&json!({ "name": "Freerun" })).dispatch();
    error(resp, Status::Forbidden);
}

#[test]
fn student_csv_import_export() {
    let client = create_test_server();
    create_parent(&client, "mum@academy.test");

    let bad_csv = "first_name,last_name,date_of_birth,parent_email,notes\n\
                   Ada,Flip,2014-01-02,mum@academy.test,\n\
                   Bo,Roll,02/03/2015,mum@academy.test,\n";
    let resp = client.post("/api/students/import").header(ContentType::CSV).body(bad_csv).dispatch();
    let report = data::<ImportReport>(resp);
    assert_eq!(report.imported, 0);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].line, 3);

    let good_csv = "first_name,last_name,date_of_birth,parent_email,notes\n\
                    Ada,Flip,2014-01-02,mum@academy.test,\n\
                    Bo,Roll,2015-03-02,MUM@academy.test,\"likes walls, hates mats\"\n";
    let resp = client.post("/api/students/import").header(ContentType::CSV).body(good_csv).dispatch();
    let report = data::<ImportReport>(resp);
    assert_eq!(report.imported, 2);
    assert!(report.errors.is_empty());

    let resp = client.get("/api/students/export").dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let csv = resp.into_string().unwrap();
    assert!(csv.contains("Ada,Flip,2014-01-02,mum@academy.test"), "{csv}");
    assert!(csv.contains("\"likes walls, hates mats\""), "{csv}");
}

#[test]
fn upload_file() {
    let client = create_test_server();

    // send file
    let file_name = "a.txt";
    let orig = b"foo-bar-baz";
    let compressed = zip_data(orig).unwrap();
    let resp = client.post(format!("/api/files?name={file_name}"))
        .header(ContentType::ZIP)
        .body(compressed)
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let file_id = data::<i64>(resp);

    // get this file
    let resp = client.get(format!("/api/files/{file_id}")).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    assert_eq!(resp.content_type(), Some(ContentType::Text));
    let content = resp.into_bytes().unwrap();
    assert_eq!(&content, orig);

    // list files
    let resp = client.get("/api/files").dispatch();
    let files = data::<Vec<FileInfo>>(resp);
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, file_name);
    assert_eq!(files[0].size, orig.len() as i64);

    // use it as avatar
    let resp = client.patch("/api/profile").json(&json!({ "avatar_file_id": file_id })).dispatch();
    assert_eq!(data::<Value>(resp)["avatar_file_id"], file_id);
}

#[test]
fn credit_adjustment_cannot_go_negative() {
    let client = create_test_server();
    let catalog = create_catalog(&client);
    let parent_id = create_parent(&client, "late@academy.test");
    let student_id = create_student(&client, parent_id);
    let sp = post(&client, "/api/student-packages", json!({ "student_id": student_id, "package_id": catalog.package_id }));
    let resp = client.post(format!("/api/student-packages/{}/adjust", id_of(&sp)))
        .json(&json!({ "delta": 2, "note": "goodwill" }))
        .dispatch();
    let adjusted = data::<StudentPackageRecord>(resp);
    assert_eq!(adjusted.credits_remaining, 3);
    assert_eq!(adjusted.credits_total, 3);

    let resp = client.post(format!("/api/student-packages/{}/adjust", id_of(&sp)))
        .json(&json!({ "delta": -4, "note": "too much" }))
        .dispatch();
    error(resp, Status::BadRequest);

    let resp = client.get(format!("/api/students/{student_id}")).dispatch();
    assert_eq!(data::<Value>(resp)["credits_available"], 3);
}

fn book(client: &Client, session_id: i64, student_id: i64) -> BookingRecord {
    let resp = client.post("/api/bookings").json(&json!({ "session_id": session_id, "student_id": student_id })).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    data(resp)
}

fn assign_package(client: &Client, student_id: i64, package_id: i64) -> i64 {
    id_of(&post(client, "/api/student-packages", json!({ "student_id": student_id, "package_id": package_id })))
}

#[test]
fn inflated_upload_over_limit_is_refused() {
    let client = start_test_server(test_figment().merge(("upload_limit_mib", 1)));
    let zeros = vec![0u8; 3 * 1024 * 1024];
    let compressed = zip_data(&zeros).unwrap();
    assert!(compressed.len() < 1024 * 1024);
    let resp = client.post("/api/files?name=zeros.bin")
        .header(ContentType::ZIP)
        .body(compressed)
        .dispatch();
    error(resp, Status::PayloadTooLarge);

    let resp = client.get("/api/files").dispatch();
    assert!(data::<Vec<FileInfo>>(resp).is_empty());

    let fits = zip_data(&zeros[..1024 * 1024]).unwrap();
    let resp = client.post("/api/files?name=zeros.bin")
        .header(ContentType::ZIP)
        .body(fits)
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
}

#[test]
fn refunded_package_does_not_regain_credit() {
    let client = create_test_server();
    let catalog = create_catalog(&client);
    let parent_id = create_parent(&client, "refunded@academy.test");
    let student_id = create_student(&client, parent_id);
    let payment = data::<PaymentRecord>(client.post("/api/payments")
        .json(&json!({ "student_id": student_id, "package_id": catalog.package_id, "method": "CARD" }))
        .dispatch());
    let student_package_id = payment.student_package_id.unwrap();
    let session_id = create_session(&client, &catalog, 5);
    let booking = book(&client, session_id, student_id);

    let resp = client.post(format!("/api/payments/{}/refund", payment.id)).dispatch();
    assert_eq!(data::<PaymentRecord>(resp).status, PaymentStatus::Refunded);
    let detail = load_student_package(&client, student_package_id);
    assert_eq!(detail.package.credits_remaining, 0);
    assert!(detail.package.refunded_at.is_some());

    // early cancellation, but the credit was paid back with the payment
    let resp = client.post(format!("/api/bookings/{}/cancel", booking.id)).dispatch();
    let cancellation = data::<BookingCancellation>(resp);
    assert!(!cancellation.credit_refunded);
    let detail = load_student_package(&client, student_package_id);
    assert_eq!(detail.package.credits_remaining, 0);
    assert_eq!(detail.package.status, PackageStatus::Depleted);
    assert!(detail.ledger.iter().all(|e| e.reason != LedgerReason::BookingCancelled));

    let resp = client.post("/api/bookings").json(&json!({ "session_id": session_id, "student_id": student_id })).dispatch();
    error(resp, Status::BadRequest);
    let resp = client.post(format!("/api/student-packages/{student_package_id}/adjust"))
        .json(&json!({ "delta": 1, "note": "goodwill" }))
        .dispatch();
    error(resp, Status::BadRequest);
}

#[test]
fn session_cancel_skips_refunded_packages() {
    let client = create_test_server();
    let catalog = create_catalog(&client);
    let parent_id = create_parent(&client, "skip@academy.test");
    let student_id = create_student(&client, parent_id);
    let payment = data::<PaymentRecord>(client.post("/api/payments")
        .json(&json!({ "student_id": student_id, "package_id": catalog.package_id, "method": "CASH" }))
        .dispatch());
    let session_id = create_session(&client, &catalog, 2);
    book(&client, session_id, student_id);
    post(&client, &format!("/api/payments/{}/refund", payment.id), json!({}));

    let cancellation = post(&client, &format!("/api/sessions/{session_id}/cancel"), json!({}));
    assert_eq!(cancellation["bookings_cancelled"], 1);
    assert_eq!(cancellation["credits_refunded"], 0);
    let detail = load_student_package(&client, payment.student_package_id.unwrap());
    assert_eq!(detail.package.credits_remaining, 0);

    let resp = client.post(format!("/api/sessions/{session_id}/cancel")).dispatch();
    error(resp, Status::BadRequest);
}

#[test]
fn revenue_nets_out_refunds() {
    let client = create_test_server();
    let catalog = create_catalog(&client);
    let parent_id = create_parent(&client, "money@academy.test");
    let student_id = create_student(&client, parent_id);
    let payment = data::<PaymentRecord>(client.post("/api/payments")
        .json(&json!({ "student_id": student_id, "package_id": catalog.package_id, "method": "CARD" }))
        .dispatch());

    let overview = data::<Overview>(client.get("/api/analytics/overview").dispatch());
    assert_eq!(overview.students, 1);
    assert_eq!(overview.active_packages, 1);
    assert_eq!(overview.revenue_this_month_cents, 1500);
    assert_eq!(overview.attendance_rate, None);

    post(&client, &format!("/api/payments/{}/refund", payment.id), json!({}));
    let overview = data::<Overview>(client.get("/api/analytics/overview").dispatch());
    assert_eq!(overview.active_packages, 0);
    assert_eq!(overview.revenue_this_month_cents, 0);

    let months = data::<Vec<MonthRevenue>>(client.get("/api/analytics/revenue?months=3").dispatch());
    assert_eq!(months.len(), 3);
    let current = months.last().unwrap();
    assert_eq!((current.completed_cents, current.refunded_cents, current.net_cents), (1500, 1500, 0));
    assert!(months[..2].iter().all(|m| m.completed_cents == 0 && m.net_cents == 0));

    let resp = client.get("/api/analytics/revenue?months=0").dispatch();
    error(resp, Status::BadRequest);
}

#[test]
fn generate_sessions_range_is_bounded() {
    let client = create_test_server();
    let catalog = create_catalog(&client);
    let from = today();
    let schedule_id = id_of(&post(&client, "/api/schedules", json!({
        "template_id": catalog.template_id,
        "location_id": catalog.location_id,
        "day_of_week": 3,
        "start_time": "18:00",
        "start_date": from,
    })));
    let uri = format!("/api/schedules/{schedule_id}/generate");
    let resp = client.post(uri.clone()).json(&json!({ "from": from, "to": from + Duration::days(3 * 365) })).dispatch();
    error(resp, Status::BadRequest);

    // default horizon would run past the end of the calendar
    let resp = client.post(uri.clone()).json(&json!({ "from": NaiveDate::MAX - Duration::days(3) })).dispatch();
    error(resp, Status::BadRequest);

    let resp = client.post(uri).json(&json!({ "from": from, "to": from + Duration::days(365) })).dispatch();
    let report = data::<GenerateSessionsReport>(resp);
    assert!((52..=53).contains(&report.created), "{report:?}");
}

#[test]
fn settings_drive_parent_booking_rules() {
    let client = create_test_server();
    let catalog = create_catalog(&client);
    let resp = client.patch("/api/settings").json(&json!({ "cancellation_hours": 72, "booking_horizon_days": 5 })).dispatch();
    let settings = data::<AcademySettings>(resp);
    assert_eq!((settings.cancellation_hours, settings.booking_horizon_days), (72, 5));
    let near_session_id = create_session(&client, &catalog, 2);
    let far_session_id = create_session(&client, &catalog, 10);

    register_parent(&client, "rules@academy.test");
    let date_of_birth = today().checked_sub_months(Months::new(8 * 12)).unwrap();
    let student_id = id_of(&post(&client, "/api/students", json!({ "first_name": "Cy", "last_name": "Wall", "date_of_birth": date_of_birth })));
    login(&client, ADMIN_EMAIL, ADMIN_PASSWORD);
    let student_package_id = assign_package(&client, student_id, catalog.package_id);

    login(&client, "rules@academy.test", PARENT_PASSWORD);
    let resp = client.post("/api/bookings").json(&json!({ "session_id": far_session_id, "student_id": student_id })).dispatch();
    let message = error(resp, Status::BadRequest);
    assert!(message.contains("5 days"), "{message}");

    // less than 72 hours ahead, the credit stays spent
    let booking = book(&client, near_session_id, student_id);
    let cancellation = data::<BookingCancellation>(client.post(format!("/api/bookings/{}/cancel", booking.id)).dispatch());
    assert!(!cancellation.credit_refunded);
    let detail = load_student_package(&client, student_package_id);
    assert_eq!(detail.package.credits_remaining, 0);
    assert_eq!(detail.ledger.last().map(|e| e.reason), Some(LedgerReason::Booking));

    let resp = client.post(format!("/api/bookings/{}/cancel", booking.id)).dispatch();
    error(resp, Status::BadRequest);

    // staff are not bound by the horizon
    login(&client, ADMIN_EMAIL, ADMIN_PASSWORD);
    assign_package(&client, student_id, catalog.package_id);
    book(&client, far_session_id, student_id);
}

#[test]
fn users_and_students_in_use_cannot_be_deleted() {
    let client = create_test_server();
    let catalog = create_catalog(&client);
    let me = data::<SessionUser>(client.get("/api/auth/me").dispatch());
    let resp = client.delete(format!("/api/users/{}", me.id)).dispatch();
    error(resp, Status::BadRequest);

    let parent_id = create_parent(&client, "busy@academy.test");
    let student_id = create_student(&client, parent_id);
    let resp = client.delete(format!("/api/users/{parent_id}")).dispatch();
    let message = error(resp, Status::Conflict);
    assert!(message.contains("student"), "{message}");

    assign_package(&client, student_id, catalog.package_id);
    let resp = client.delete(format!("/api/students/{student_id}")).dispatch();
    let message = error(resp, Status::Conflict);
    assert!(message.contains("package"), "{message}");

    let lonely_id = create_parent(&client, "lonely@academy.test");
    let resp = client.delete(format!("/api/users/{lonely_id}")).dispatch();
    assert_eq!(resp.status(), Status::Ok);
}

#[test]
fn catalog_in_use_cannot_be_deleted() {
    let client = create_test_server();
    let catalog = create_catalog(&client);
    let coach_user_id = create_parent(&client, "coach@academy.test");
    let coach_id = id_of(&post(&client, "/api/coaches", json!({ "user_id": coach_user_id, "bio": "Flips" })));
    let starts_at = (today() + Duration::days(3)).and_hms_opt(17, 0, 0).unwrap();
    post(&client, "/api/sessions", json!({
        "template_id": catalog.template_id,
        "location_id": catalog.location_id,
        "coach_id": coach_id,
        "starts_at": starts_at,
    }));

    let resp = client.delete(format!("/api/locations/{}", catalog.location_id)).dispatch();
    error(resp, Status::Conflict);
    let resp = client.delete(format!("/api/coaches/{coach_id}")).dispatch();
    error(resp, Status::Conflict);
    let resp = client.delete(format!("/api/age-groups/{}", catalog.age_group_id)).dispatch();
    let message = error(resp, Status::Conflict);
    assert!(message.contains("package price"), "{message}");

    let unused = id_of(&post(&client, "/api/age-groups", json!({ "name": "Adults", "min_age": 18, "max_age": 99 })));
    let resp = client.delete(format!("/api/age-groups/{unused}")).dispatch();
    assert_eq!(resp.status(), Status::Ok);
}

#[test]
fn booked_schedule_and_seats_are_protected() {
    let client = create_test_server();
    let catalog = create_catalog(&client);
    let from = today() + Duration::days(1);
    let schedule_id = id_of(&post(&client, "/api/schedules", json!({
        "template_id": catalog.template_id,
        "location_id": catalog.location_id,
        "day_of_week": from.weekday().num_days_from_sunday(),
        "start_time": "16:00",
        "start_date": from,
    })));
    let report = data::<GenerateSessionsReport>(client.post(format!("/api/schedules/{schedule_id}/generate"))
        .json(&json!({ "from": from, "to": from }))
        .dispatch());
    assert_eq!(report.created, 1);
    let sessions = data::<Vec<SessionRecord>>(client.get(format!("/api/sessions?from={from}&to={from}")).dispatch());
    let session_id = sessions[0].id;

    let parent_id = create_parent(&client, "seats@academy.test");
    for _ in 0..2 {
        let student_id = create_student(&client, parent_id);
        assign_package(&client, student_id, catalog.package_id);
        book(&client, session_id, student_id);
    }

    let resp = client.patch(format!("/api/sessions/{session_id}")).json(&json!({ "capacity": 1 })).dispatch();
    let message = error(resp, Status::BadRequest);
    assert!(message.contains("2 booked"), "{message}");
    let resp = client.patch(format!("/api/sessions/{session_id}")).json(&json!({ "capacity": 2 })).dispatch();
    assert_eq!(data::<SessionRecord>(resp).capacity, 2);

    let resp = client.delete(format!("/api/schedules/{schedule_id}")).dispatch();
    let message = error(resp, Status::Conflict);
    assert!(message.contains("2 booking(s)"), "{message}");
}

#[test]
fn attendance_waits_for_session_start() {
    let client = create_test_server();
    let catalog = create_catalog(&client);
    let parent_id = create_parent(&client, "present@academy.test");
    let student_id = create_student(&client, parent_id);
    assign_package(&client, student_id, catalog.package_id);
    let session_id = create_session(&client, &catalog, 1);
    let booking = book(&client, session_id, student_id);

    let uri = format!("/api/bookings/{}/attendance", booking.id);
    let resp = client.post(uri.clone()).json(&json!({ "status": "ATTENDED" })).dispatch();
    error(resp, Status::BadRequest);

    let started = (today() - Duration::days(1)).and_hms_opt(17, 0, 0).unwrap();
    let resp = client.patch(format!("/api/sessions/{session_id}")).json(&json!({ "starts_at": started })).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = client.post(uri.clone()).json(&json!({ "status": "BOOKED" })).dispatch();
    error(resp, Status::BadRequest);
    let resp = client.post(uri).json(&json!({ "status": "NO_SHOW" })).dispatch();
    assert_eq!(data::<BookingRecord>(resp).status, crate::bookings::BookingStatus::NoShow);
}

#[test]
fn overdue_packages_expire() {
    let db_path = std::env::temp_dir().join(format!("academyd-expire-{}.sqlite", std::process::id()));
    let remove_db_files = || {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", db_path.display()));
        }
    };
    remove_db_files();
    let database_url = format!("sqlite://{}", db_path.display());
    let client = start_test_server(test_figment().merge(("database_url", database_url.clone())));
    let catalog = create_catalog(&client);
    let parent_id = create_parent(&client, "overdue@academy.test");
    let student_id = create_student(&client, parent_id);
    let student_package_id = assign_package(&client, student_id, catalog.package_id);
    assert_eq!(data::<u64>(client.post("/api/student-packages/expire").dispatch()), 0);

    run_sql(&database_url, &format!("UPDATE student_packages SET expires_at='2000-01-01' WHERE id={student_package_id}"));
    assert_eq!(data::<u64>(client.post("/api/student-packages/expire").dispatch()), 1);
    let detail = load_student_package(&client, student_package_id);
    assert_eq!(detail.package.status, PackageStatus::Expired);
    let session_id = create_session(&client, &catalog, 2);
    let resp = client.post("/api/bookings").json(&json!({ "session_id": session_id, "student_id": student_id })).dispatch();
    error(resp, Status::BadRequest);

    drop(client);
    remove_db_files();
}

#[test]
fn audit_log_filters() {
    let client = create_test_server();
    let me = data::<SessionUser>(client.get("/api/auth/me").dispatch());
    let location_id = id_of(&post(&client, "/api/locations", json!({ "name": "Roof Park", "address": "High Street 5" })));
    post(&client, "/api/locations", json!({ "name": "Beach", "address": "Shore 1" }));
    post(&client, "/api/class-types", json!({ "name": "Freerun" }));

    let records = data::<Vec<AuditRecord>>(client.get("/api/audit?entity=location").dispatch());
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.entity == "location"));
    let records = data::<Vec<AuditRecord>>(client.get(format!("/api/audit?entity=location&entity_id={location_id}")).dispatch());
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].action, "CREATE");
    assert_eq!(records[0].user_id, Some(me.id));
    let records = data::<Vec<AuditRecord>>(client.get(format!("/api/audit?user_id={}&limit=1", me.id)).dispatch());
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].entity, "class_type");
}

#[test]
fn patched_names_are_trimmed() {
    let client = create_test_server();
    let group_id = id_of(&post(&client, "/api/age-groups", json!({ "name": "Teens", "min_age": 13, "max_age": 17 })));
    let resp = client.patch(format!("/api/age-groups/{group_id}")).json(&json!({ "name": "  Juniors  " })).dispatch();
    assert_eq!(data::<Value>(resp)["name"], "Juniors");
    let type_id = id_of(&post(&client, "/api/class-types", json!({ "name": "Parkour" })));
    let resp = client.patch(format!("/api/class-types/{type_id}")).json(&json!({ "name": " Freerun " })).dispatch();
    assert_eq!(data::<Value>(resp)["name"], "Freerun");
    post(&client, "/api/class-types", json!({ "name": "Tricking" }));
    let resp = client.patch(format!("/api/class-types/{type_id}")).json(&json!({ "name": "Tricking  " })).dispatch();
    error(resp, Status::Conflict);
}
