use chrono::{Datelike, Days, Duration, Months, NaiveDate, NaiveDateTime, NaiveTime};
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use crate::auth::AdminUser;
use crate::db::DbPool;
use crate::schedules::now_local;
use crate::students::today;
use crate::util::{ok, parse_opt_date, ActionError, ActionResult};

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct Overview {
    pub students: i64,
    pub active_packages: i64,
    pub upcoming_sessions: i64,
    pub bookings_this_month: i64,
    pub revenue_this_month_cents: i64,
    /// Attended share of the sessions that took attendance in the last 30 days, `None` without data.
    pub attendance_rate: Option<f64>,
}

#[derive(Serialize, Deserialize, FromRow, Debug, PartialEq)]
pub struct MonthRevenue {
    /// `YYYY-MM`
    pub month: String,
    pub completed_cents: i64,
    pub refunded_cents: i64,
    pub net_cents: i64,
}

#[derive(Serialize, Deserialize, FromRow, Debug, PartialEq)]
pub struct LocationBookings {
    pub location_id: i64,
    pub location_name: String,
    pub sessions: i64,
    pub bookings: i64,
    pub attended: i64,
}

/// Money taken in the month a payment was made, money returned in the month of its refund.
const REVENUE_ENTRIES: &str = "SELECT substr(created_at, 1, 7) AS month, amount_cents AS completed, 0 AS refunded
        FROM payments WHERE status IN ('COMPLETED', 'REFUNDED')
    UNION ALL
    SELECT substr(refunded_at, 1, 7) AS month, 0 AS completed, amount_cents AS refunded
        FROM payments WHERE status='REFUNDED' AND refunded_at IS NOT NULL";

pub fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// `YYYY-MM` keys of the last `months` months, oldest first, ending with the month of `today`.
pub fn month_keys(today: NaiveDate, months: u32) -> Vec<String> {
    let current = month_start(today);
    (0..months).rev()
        .filter_map(|back| current.checked_sub_months(Months::new(back)))
        .map(|date| date.format("%Y-%m").to_string())
        .collect()
}

pub fn attendance_rate(attended: i64, no_show: i64) -> Option<f64> {
    let total = attended + no_show;
    if total == 0 {
        None
    } else {
        Some(attended as f64 / total as f64)
    }
}

#[get("/api/analytics/overview")]
async fn overview(_admin: AdminUser, db: &State<DbPool>) -> ActionResult<Overview> {
    let pool = &db.0;
    let now = now_local();
    let month = today().format("%Y-%m").to_string();
    let (students,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM students")
        .fetch_one(pool)
        .await?;
    let (active_packages,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM student_packages WHERE status='ACTIVE'")
        .fetch_one(pool)
        .await?;
    let (upcoming_sessions,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM class_sessions WHERE status='SCHEDULED' AND starts_at>=? AND starts_at<?")
        .bind(now)
        .bind(now + Duration::days(7))
        .fetch_one(pool)
        .await?;
    let (bookings_this_month,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM bookings b
            JOIN class_sessions s ON s.id=b.session_id
            WHERE b.status<>'CANCELLED' AND substr(s.starts_at, 1, 7)=?")
        .bind(&month)
        .fetch_one(pool)
        .await?;
    let (revenue_this_month_cents,): (i64,) = sqlx::query_as(&format!("SELECT COALESCE(SUM(completed - refunded), 0)
            FROM ({REVENUE_ENTRIES}) WHERE month=?"))
        .bind(&month)
        .fetch_one(pool)
        .await?;
    let (attended, no_show): (i64, i64) = sqlx::query_as("SELECT COALESCE(SUM(b.status='ATTENDED'), 0), COALESCE(SUM(b.status='NO_SHOW'), 0)
            FROM bookings b JOIN class_sessions s ON s.id=b.session_id
            WHERE s.starts_at>=? AND s.starts_at<?")
        .bind(now - Duration::days(30))
        .bind(now)
        .fetch_one(pool)
        .await?;
    ok(Overview {
        students,
        active_packages,
        upcoming_sessions,
        bookings_this_month,
        revenue_this_month_cents,
        attendance_rate: attendance_rate(attended, no_show),
    })
}

#[get("/api/analytics/revenue?<months>")]
async fn revenue_by_month(months: Option<u32>, _admin: AdminUser, db: &State<DbPool>) -> ActionResult<Vec<MonthRevenue>> {
    let months = months.unwrap_or(12);
    if !(1..=120).contains(&months) {
        return Err(ActionError::bad_request("Months must be between 1 and 120"));
    }
    let keys = month_keys(today(), months);
    let Some(first) = keys.first() else {
        return ok(vec![]);
    };
    let rows = sqlx::query_as::<_, MonthRevenue>(&format!("SELECT month,
                COALESCE(SUM(completed), 0) AS completed_cents,
                COALESCE(SUM(refunded), 0) AS refunded_cents,
                COALESCE(SUM(completed - refunded), 0) AS net_cents
            FROM ({REVENUE_ENTRIES})
            WHERE month>=?
            GROUP BY month"))
        .bind(first)
        .fetch_all(&db.0)
        .await?;
    // months without payments are reported as zero
    let ret = keys.into_iter().map(|month| {
        match rows.iter().find(|r| r.month == month) {
            Some(r) => MonthRevenue { month, completed_cents: r.completed_cents, refunded_cents: r.refunded_cents, net_cents: r.net_cents },
            None => MonthRevenue { month, completed_cents: 0, refunded_cents: 0, net_cents: 0 },
        }
    }).collect();
    ok(ret)
}

#[get("/api/analytics/bookings-by-location?<from>&<to>")]
async fn bookings_by_location(from: Option<&str>, to: Option<&str>, _admin: AdminUser, db: &State<DbPool>) -> ActionResult<Vec<LocationBookings>> {
    let to = parse_opt_date("To", to)?.unwrap_or_else(today);
    let from = parse_opt_date("From", from)?.unwrap_or(to.checked_sub_days(Days::new(30)).unwrap_or(NaiveDate::MIN));
    if to < from {
        return Err(ActionError::bad_request("End of the range must not be before its start"));
    }
    let rows = sqlx::query_as::<_, LocationBookings>("SELECT l.id AS location_id, l.name AS location_name,
                COUNT(DISTINCT s.id) AS sessions,
                COUNT(b.id) AS bookings,
                COALESCE(SUM(b.status='ATTENDED'), 0) AS attended
            FROM locations l
            LEFT JOIN class_sessions s ON s.location_id=l.id AND s.starts_at>=? AND s.starts_at<?
            LEFT JOIN bookings b ON b.session_id=s.id AND b.status<>'CANCELLED'
            GROUP BY l.id, l.name
            ORDER BY bookings DESC, l.name")
        .bind(from.and_time(NaiveTime::MIN))
        .bind(to.succ_opt().map_or(NaiveDateTime::MAX, |next| next.and_time(NaiveTime::MIN)))
        .fetch_all(&db.0)
        .await?;
    ok(rows)
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
        overview,
        revenue_by_month,
        bookings_by_location,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_month_keys() {
        assert_eq!(month_keys(date("2025-02-15"), 3), vec!["2024-12", "2025-01", "2025-02"]);
        assert_eq!(month_keys(date("2025-03-31"), 1), vec!["2025-03"]);
        assert!(month_keys(date("2025-03-31"), 0).is_empty());
    }

    #[test]
    fn test_attendance_rate() {
        assert_eq!(attendance_rate(0, 0), None);
        assert_eq!(attendance_rate(3, 1), Some(0.75));
    }
}
