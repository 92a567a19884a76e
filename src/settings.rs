use log::{info, warn};
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use crate::auth::AdminUser;
use crate::db::DbPool;
use crate::util::{ok, require_email, require_non_empty, require_positive, ActionError, ActionResult, Validate};
use crate::{audit, SharedAcademyState};

/// Runtime settings of the academy, stored as JSON values in the `settings` key/value table.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AcademySettings {
    pub academy_name: String,
    pub contact_email: Option<String>,
    pub currency: String,
    /// Cancellations at least this many hours before the start get their credit back.
    pub cancellation_hours: i64,
    /// How far ahead parents may book.
    pub booking_horizon_days: i64,
}
impl Default for AcademySettings {
    fn default() -> Self {
        Self {
            academy_name: "Parkour Academy".to_string(),
            contact_email: None,
            currency: "EUR".to_string(),
            cancellation_hours: 24,
            booking_horizon_days: 60,
        }
    }
}

#[derive(Serialize, Deserialize, Default, Debug)]
pub struct SettingsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub academy_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation_hours: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_horizon_days: Option<i64>,
}
impl Validate for SettingsPatch {
    fn validate(&self) -> Result<(), ActionError> {
        if let Some(academy_name) = &self.academy_name {
            require_non_empty("Academy name", academy_name)?;
        }
        if let Some(contact_email) = &self.contact_email {
            require_email("Contact email", contact_email)?;
        }
        if let Some(currency) = &self.currency {
            if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()) {
                return Err(ActionError::bad_request("Currency must be a three letter ISO code, like EUR"));
            }
        }
        if let Some(cancellation_hours) = self.cancellation_hours {
            if cancellation_hours < 0 {
                return Err(ActionError::bad_request("Cancellation hours cannot be negative"));
            }
        }
        if let Some(booking_horizon_days) = self.booking_horizon_days {
            require_positive("Booking horizon days", booking_horizon_days)?;
        }
        Ok(())
    }
}

/// Stored values overlay the defaults, unknown keys and unreadable values are ignored.
pub async fn load_settings(pool: &SqlitePool) -> Result<AcademySettings, sqlx::Error> {
    let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM settings")
        .fetch_all(pool)
        .await?;
    let mut settings = serde_json::to_value(AcademySettings::default()).unwrap_or_default();
    if let Some(map) = settings.as_object_mut() {
        for (key, value) in rows {
            if !map.contains_key(&key) {
                continue;
            }
            match serde_json::from_str::<serde_json::Value>(&value) {
                Ok(value) => { map.insert(key, value); }
                Err(e) => warn!("Invalid value of setting {key}: {e}"),
            }
        }
    }
    Ok(serde_json::from_value(settings).unwrap_or_else(|e| {
        warn!("Invalid academy settings, using defaults: {e}");
        AcademySettings::default()
    }))
}

#[get("/api/settings")]
async fn get_settings(db: &State<DbPool>) -> ActionResult<AcademySettings> {
    ok(load_settings(&db.0).await?)
}

#[patch("/api/settings", data = "<patch>")]
async fn update_settings(patch: Json<SettingsPatch>, admin: AdminUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<AcademySettings> {
    patch.validate()?;
    let values = serde_json::to_value(&*patch).map_err(anyhow::Error::from)?;
    let Some(values) = values.as_object().filter(|m| !m.is_empty()) else {
        return ok(load_settings(&db.0).await?);
    };
    let mut tx = db.0.begin().await?;
    for (key, value) in values {
        sqlx::query("INSERT INTO settings (key, value) VALUES (?, ?)
                ON CONFLICT(key) DO UPDATE SET value=excluded.value")
            .bind(key)
            .bind(value.to_string())
            .execute(&mut *tx)
            .await?;
    }
    let rec = audit::record(&mut tx, Some(admin.0.id), "UPDATE", "settings", None, serde_json::Value::Object(values.clone())).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    info!("Settings updated: {:?}", values.keys().collect::<Vec<_>>());
    ok(load_settings(&db.0).await?)
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
        get_settings,
        update_settings,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_patch_serializes_only_set_keys() {
        let patch = SettingsPatch { cancellation_hours: Some(12), ..Default::default() };
        assert_eq!(serde_json::to_value(&patch).unwrap(), serde_json::json!({ "cancellation_hours": 12 }));
    }

    #[test]
    fn test_settings_patch_validation() {
        assert!(SettingsPatch { currency: Some("usd".to_string()), ..Default::default() }.validate().is_err());
        assert!(SettingsPatch { cancellation_hours: Some(-1), ..Default::default() }.validate().is_err());
        assert!(SettingsPatch { booking_horizon_days: Some(0), ..Default::default() }.validate().is_err());
        assert!(SettingsPatch { currency: Some("CZK".to_string()), cancellation_hours: Some(0), ..Default::default() }.validate().is_ok());
    }
}
