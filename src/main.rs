#[macro_use] extern crate rocket;

use std::collections::HashMap;
use std::sync::RwLock;
use log::{debug, warn};
use rocket::figment::Figment;
use rocket::{Build, Request, Rocket, State};
use rocket::serde::json::Json;
use rocket::tokio::sync::broadcast;
use serde::{Deserialize, Serialize};
use crate::audit::AuditRecord;
use crate::auth::{SessionId, SessionUser};
use crate::db::{DbPool, DbPoolFairing};
use crate::settings::load_settings;
use crate::util::{ok, ActionFailure, ActionResult};

#[cfg(test)]
mod tests;
mod db;
mod util;
mod csvio;
mod audit;
mod auth;
mod users;
mod profile;
mod students;
mod age_groups;
mod locations;
mod coaches;
mod classes;
mod schedules;
mod bookings;
mod packages;
mod student_package;
mod payments;
mod analytics;
mod settings;
mod files;

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    pub admin_email: Option<String>,
    pub admin_password: Option<String>,
    pub session_horizon_days: i64,
    pub upload_limit_mib: u64,
}
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://academy.sqlite".to_string(),
            admin_email: None,
            admin_password: None,
            session_horizon_days: 28,
            upload_limit_mib: 10,
        }
    }
}

pub(crate) struct AcademyState {
    sessions: HashMap<SessionId, SessionUser>,
    audit_sender: broadcast::Sender<AuditRecord>,
}
impl AcademyState {
    fn new() -> Self {
        let (audit_sender, _receiver) = broadcast::channel(64);
        Self {
            sessions: Default::default(),
            audit_sender,
        }
    }
    fn broadcast_audit_record(&self, rec: AuditRecord) {
        // nobody listening is not an error
        let _ = self.audit_sender.send(rec);
    }
}
pub(crate) type SharedAcademyState = RwLock<AcademyState>;

#[derive(Serialize, Deserialize, Debug)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
}

#[get("/api")]
async fn index(db: &State<DbPool>) -> ActionResult<ServiceInfo> {
    let settings = load_settings(&db.0).await?;
    ok(ServiceInfo {
        name: settings.academy_name,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

fn failure(status: u16, req: &Request<'_>, message: &str) -> Json<ActionFailure> {
    debug!("{} {} -> {status}", req.method(), req.uri());
    Json(ActionFailure { success: false, error: message.to_string() })
}
#[catch(400)]
fn bad_request(req: &Request<'_>) -> Json<ActionFailure> {
    failure(400, req, "Bad request")
}
#[catch(401)]
fn unauthorized(req: &Request<'_>) -> Json<ActionFailure> {
    failure(401, req, "Login required")
}
#[catch(403)]
fn forbidden(req: &Request<'_>) -> Json<ActionFailure> {
    failure(403, req, "Insufficient permissions")
}
#[catch(404)]
fn not_found(req: &Request<'_>) -> Json<ActionFailure> {
    failure(404, req, "Not found")
}
#[catch(422)]
fn unprocessable(req: &Request<'_>) -> Json<ActionFailure> {
    failure(422, req, "Invalid request data")
}
#[catch(500)]
fn internal_error(req: &Request<'_>) -> Json<ActionFailure> {
    failure(500, req, "Internal server error")
}

pub fn build(figment: Figment) -> Rocket<Build> {
    let rocket = rocket::custom(figment);
    let cfg = match rocket.figment().extract::<AppConfig>() {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("Invalid application config, using defaults: {e}");
            AppConfig::default()
        }
    };
    let rocket = rocket
        .manage(cfg)
        .manage(SharedAcademyState::new(AcademyState::new()))
        .attach(DbPoolFairing())
        .register("/", catchers![bad_request, unauthorized, forbidden, not_found, unprocessable, internal_error])
        .mount("/", routes![
            index,
        ]);
    let rocket = auth::extend(rocket);
    let rocket = users::extend(rocket);
    let rocket = profile::extend(rocket);
    let rocket = students::extend(rocket);
    let rocket = age_groups::extend(rocket);
    let rocket = locations::extend(rocket);
    let rocket = coaches::extend(rocket);
    let rocket = classes::extend(rocket);
    let rocket = schedules::extend(rocket);
    let rocket = bookings::extend(rocket);
    let rocket = packages::extend(rocket);
    let rocket = student_package::extend(rocket);
    let rocket = payments::extend(rocket);
    let rocket = analytics::extend(rocket);
    let rocket = settings::extend(rocket);
    let rocket = audit::extend(rocket);
    files::extend(rocket)
}

#[launch]
fn rocket() -> _ {
    build(rocket::Config::figment())
}
