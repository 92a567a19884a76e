use chrono::Utc;
use log::{error, info, warn};
use rand::Rng;
use rocket::fairing::AdHoc;
use rocket::http::{Cookie, CookieJar, SameSite, Status};
use rocket::request::{FromRequest, Outcome};
use rocket::serde::json::Json;
use rocket::{Build, Request, Rocket, State};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{FromRow, SqliteConnection};
use subtle::ConstantTimeEq;
use crate::db::DbPool;
use crate::util::{ok, require_email, require_non_empty, ActionError, ActionResult, Validate};
use crate::{audit, impl_sqlx_text_enum, impl_text_enum_strings, AppConfig, SharedAcademyState};

pub const SESSION_COOKIE: &str = "academy_session_id";
const PASSWORD_HASH_ROUNDS: usize = 10_000;
pub const MIN_PASSWORD_LEN: usize = 8;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Admin,
    Coach,
    Parent,
}
impl_text_enum_strings!(Role { Admin => "ADMIN", Coach => "COACH", Parent => "PARENT" });
impl_sqlx_text_enum!(Role);

impl Role {
    pub fn is_staff(&self) -> bool {
        matches!(self, Role::Admin | Role::Coach)
    }
}

#[derive(Eq, Hash, PartialEq, Clone, Debug)]
pub struct SessionId(pub String);

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct SessionUser {
    pub id: i64,
    pub email: String,
    pub name: String,
    pub role: Role,
}

pub fn generate_random_string(len: usize) -> String {
    const WOWELS: &str = "aeiouy";
    const CONSONANTS: &str = "bcdfghjklmnpqrstvwxz";
    let mut rng = rand::rng();
    (0..len)
        .map(|n| {
            let charset = if n % 2 == 0 { CONSONANTS.as_bytes() } else { WOWELS.as_bytes() };
            charset[rng.random_range(0..charset.len())] as char
        })
        .collect()
}

/// Iterated, salted SHA-256, hex encoded.
pub fn hash_password(password: &str, salt: &str) -> String {
    let mut digest = Sha256::new()
        .chain_update(salt.as_bytes())
        .chain_update(password.as_bytes())
        .finalize();
    for _ in 1..PASSWORD_HASH_ROUNDS {
        digest = Sha256::new()
            .chain_update(digest)
            .chain_update(salt.as_bytes())
            .finalize();
    }
    hex::encode(digest)
}

/// Compares in constant time so the stored hash does not leak through response timing.
pub fn verify_password(password: &str, salt: &str, password_hash: &str) -> bool {
    hash_password(password, salt).as_bytes().ct_eq(password_hash.as_bytes()).into()
}

pub fn new_password_hash(password: &str) -> (String, String) {
    let salt = generate_random_string(16);
    (hash_password(password, &salt), salt)
}

pub fn validate_password(password: &str) -> Result<(), ActionError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ActionError::bad_request(format!("Password must be at least {MIN_PASSWORD_LEN} characters long")));
    }
    Ok(())
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Inserts a user with a fresh salted password. Email uniqueness is reported as a user-facing error.
pub async fn insert_user(conn: &mut SqliteConnection, email: &str, name: &str, phone: Option<&str>, role: Role, password: &str) -> Result<i64, ActionError> {
    let email = normalize_email(email);
    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users WHERE email=?")
        .bind(&email)
        .fetch_one(&mut *conn)
        .await?;
    if n > 0 {
        return Err(ActionError::conflict(format!("Email {email} is already registered")));
    }
    let (password_hash, password_salt) = new_password_hash(password);
    let now = Utc::now();
    let (id,): (i64,) = sqlx::query_as("INSERT INTO users
                (email, name, phone, role, password_hash, password_salt, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id")
        .bind(&email)
        .bind(name.trim())
        .bind(phone)
        .bind(role)
        .bind(password_hash)
        .bind(password_salt)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;
    info!("User created, id: {id}, email: {email}, role: {role}");
    Ok(id)
}

fn start_session(user: SessionUser, cookies: &CookieJar<'_>, state: &SharedAcademyState) -> Result<(), ActionError> {
    let session_id = generate_random_string(32);
    state.write()
        .map_err(|e| ActionError::new(Status::InternalServerError, e.to_string()))?
        .sessions.insert(SessionId(session_id.clone()), user);
    cookies.add_private(
        Cookie::build((SESSION_COOKIE, session_id))
            .same_site(SameSite::Lax)
            .http_only(true)
            .build()
    );
    Ok(())
}

/// Forgets every session of a user, used after deletion or a role change.
pub fn drop_user_sessions(state: &SharedAcademyState, user_id: i64) {
    match state.write() {
        Ok(mut state) => state.sessions.retain(|_, user| user.id != user_id),
        Err(e) => error!("Academy state poisoned, sessions of user {user_id} kept: {e}"),
    }
}

pub struct CurrentUser(pub SessionUser);
pub struct StaffUser(pub SessionUser);
pub struct AdminUser(pub SessionUser);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for CurrentUser {
    type Error = ();
    async fn from_request(request: &'r Request<'_>) -> Outcome<CurrentUser, ()> {
        let Some(cookie) = request.cookies().get_private(SESSION_COOKIE) else {
            return Outcome::Error((Status::Unauthorized, ()));
        };
        let Some(state) = request.rocket().state::<SharedAcademyState>() else {
            return Outcome::Error((Status::InternalServerError, ()));
        };
        let session_id = SessionId(cookie.value().to_string());
        let user = match state.read() {
            Ok(state) => state.sessions.get(&session_id).cloned(),
            Err(_) => None,
        };
        match user {
            Some(user) => Outcome::Success(CurrentUser(user)),
            None => Outcome::Error((Status::Unauthorized, ())),
        }
    }
}
#[rocket::async_trait]
impl<'r> FromRequest<'r> for StaffUser {
    type Error = ();
    async fn from_request(request: &'r Request<'_>) -> Outcome<StaffUser, ()> {
        match request.guard::<CurrentUser>().await {
            Outcome::Success(CurrentUser(user)) if user.role.is_staff() => Outcome::Success(StaffUser(user)),
            Outcome::Success(_) => Outcome::Error((Status::Forbidden, ())),
            Outcome::Error(e) => Outcome::Error(e),
            Outcome::Forward(status) => Outcome::Forward(status),
        }
    }
}
#[rocket::async_trait]
impl<'r> FromRequest<'r> for AdminUser {
    type Error = ();
    async fn from_request(request: &'r Request<'_>) -> Outcome<AdminUser, ()> {
        match request.guard::<CurrentUser>().await {
            Outcome::Success(CurrentUser(user)) if user.role == Role::Admin => Outcome::Success(AdminUser(user)),
            Outcome::Success(_) => Outcome::Error((Status::Forbidden, ())),
            Outcome::Error(e) => Outcome::Error(e),
            Outcome::Forward(status) => Outcome::Forward(status),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct RegisterInput {
    pub email: String,
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub phone: Option<String>,
}
impl Validate for RegisterInput {
    fn validate(&self) -> Result<(), ActionError> {
        require_email("Email", &self.email)?;
        require_non_empty("Name", &self.name)?;
        validate_password(&self.password)
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct LoginInput {
    pub email: String,
    pub password: String,
}

#[post("/api/auth/register", data = "<input>")]
async fn register(input: Json<RegisterInput>, cookies: &CookieJar<'_>, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<SessionUser> {
    input.validate()?;
    let mut tx = db.0.begin().await?;
    let id = insert_user(&mut tx, &input.email, &input.name, input.phone.as_deref(), Role::Parent, &input.password).await?;
    let rec = audit::record(&mut tx, Some(id), "REGISTER", "user", Some(id), serde_json::json!({ "email": normalize_email(&input.email) })).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    let user = SessionUser {
        id,
        email: normalize_email(&input.email),
        name: input.name.trim().to_string(),
        role: Role::Parent,
    };
    start_session(user.clone(), cookies, state)?;
    ok(user)
}

#[post("/api/auth/login", data = "<input>")]
async fn login(input: Json<LoginInput>, cookies: &CookieJar<'_>, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<SessionUser> {
    let email = normalize_email(&input.email);
    let row: Option<(i64, String, String, Role, String, String)> = sqlx::query_as("SELECT id, email, name, role, password_hash, password_salt FROM users WHERE email=?")
        .bind(&email)
        .fetch_optional(&db.0)
        .await?;
    let Some((id, email, name, role, password_hash, password_salt)) = row else {
        warn!("Login failed, unknown email: {email}");
        return Err(ActionError::unauthorized("Invalid email or password"));
    };
    if !verify_password(&input.password, &password_salt, &password_hash) {
        warn!("Login failed, wrong password for: {email}");
        return Err(ActionError::unauthorized("Invalid email or password"));
    }
    info!("User log in, id: {id}, email: {email}");
    let user = SessionUser { id, email, name, role };
    start_session(user.clone(), cookies, state)?;
    ok(user)
}

#[post("/api/auth/logout")]
fn logout(cookies: &CookieJar<'_>, state: &State<SharedAcademyState>) -> ActionResult<bool> {
    let Some(cookie) = cookies.get_private(SESSION_COOKIE) else {
        return ok(false);
    };
    let removed = state.write()
        .map_err(|e| ActionError::new(Status::InternalServerError, e.to_string()))?
        .sessions.remove(&SessionId(cookie.value().to_string()))
        .is_some();
    cookies.remove_private(SESSION_COOKIE);
    ok(removed)
}

#[get("/api/auth/me")]
fn me(user: CurrentUser) -> ActionResult<SessionUser> {
    ok(user.0)
}

async fn bootstrap_admin(cfg: &AppConfig, db: &DbPool) -> anyhow::Result<()> {
    let (Some(email), Some(password)) = (&cfg.admin_email, &cfg.admin_password) else {
        return Ok(());
    };
    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
        .fetch_one(&db.0)
        .await?;
    if n > 0 {
        return Ok(());
    }
    let mut tx = db.0.begin().await?;
    let id = insert_user(&mut tx, email, "Administrator", None, Role::Admin, password).await?;
    audit::record(&mut tx, None, "BOOTSTRAP", "user", Some(id), serde_json::json!({ "email": email })).await?;
    tx.commit().await?;
    info!("Bootstrap admin created: {email}");
    Ok(())
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            register,
            login,
            logout,
            me,
        ])
        .attach(AdHoc::try_on_ignite("Bootstrap admin", |rocket| async {
            let (Some(cfg), Some(db)) = (rocket.state::<AppConfig>(), rocket.state::<DbPool>()) else {
                error!("Bootstrap admin requires the database pool");
                return Err(rocket);
            };
            if let Err(e) = bootstrap_admin(cfg, db).await {
                error!("Bootstrap admin error: {e}");
                return Err(rocket);
            }
            Ok(rocket)
        }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash() {
        let (hash, salt) = new_password_hash("parkour-rocks");
        assert_eq!(hash.len(), 64);
        assert!(verify_password("parkour-rocks", &salt, &hash));
        assert!(!verify_password("parkour-rock", &salt, &hash));
        assert!(!verify_password("parkour-rocks", &salt, &hash[..63]));
        assert!(!verify_password("parkour-rocks", &salt, ""));
        let (hash2, salt2) = new_password_hash("parkour-rocks");
        assert_ne!(salt, salt2);
        assert_ne!(hash, hash2);
    }

    #[test]
    fn test_role_text() {
        assert_eq!(Role::Coach.to_string(), "COACH");
        assert_eq!("ADMIN".parse::<Role>().unwrap(), Role::Admin);
        assert!("admin".parse::<Role>().is_err());
        assert!(Role::Admin.is_staff());
        assert!(!Role::Parent.is_staff());
    }

    #[test]
    fn test_generate_random_string() {
        let s = generate_random_string(12);
        assert_eq!(s.len(), 12);
        assert!(s.chars().all(|c| c.is_ascii_lowercase()));
    }
}
