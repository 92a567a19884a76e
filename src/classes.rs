use academyd_proc_macros::PatchFields;
use chrono::{DateTime, Utc};
use log::info;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use crate::auth::AdminUser;
use crate::db::{count, update_sql, DbPool};
use crate::util::{ok, require_non_empty, require_positive, trim_opt, ActionError, ActionResult, Validate};
use crate::{audit, SharedAcademyState};

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct ClassTypeRecord {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, PatchFields, Default, Debug)]
pub struct ClassTypeInput {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct ClassTemplateRecord {
    pub id: i64,
    pub name: String,
    pub class_type_id: i64,
    pub class_type_name: String,
    pub age_group_id: Option<i64>,
    pub duration_minutes: i64,
    pub capacity: i64,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

const TEMPLATE_SELECT: &str = "SELECT t.id, t.name, t.class_type_id, ct.name AS class_type_name, t.age_group_id,
        t.duration_minutes, t.capacity, t.description, t.is_active, t.created_at
    FROM class_templates t JOIN class_types ct ON ct.id=t.class_type_id";

#[derive(Serialize, Deserialize, Debug)]
pub struct TemplateInput {
    pub name: String,
    pub class_type_id: i64,
    #[serde(default)]
    pub age_group_id: Option<i64>,
    pub duration_minutes: i64,
    pub capacity: i64,
    #[serde(default)]
    pub description: Option<String>,
}
impl Validate for TemplateInput {
    fn validate(&self) -> Result<(), ActionError> {
        require_non_empty("Name", &self.name)?;
        require_positive("Duration", self.duration_minutes)?;
        require_positive("Capacity", self.capacity)
    }
}

#[derive(Serialize, Deserialize, PatchFields, Default, Debug)]
pub struct TemplatePatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub class_type_id: Option<i64>,
    #[serde(default)]
    pub age_group_id: Option<i64>,
    #[serde(default)]
    pub duration_minutes: Option<i64>,
    #[serde(default)]
    pub capacity: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
}
impl Validate for TemplatePatch {
    fn validate(&self) -> Result<(), ActionError> {
        if let Some(name) = &self.name {
            require_non_empty("Name", name)?;
        }
        if let Some(duration_minutes) = self.duration_minutes {
            require_positive("Duration", duration_minutes)?;
        }
        if let Some(capacity) = self.capacity {
            require_positive("Capacity", capacity)?;
        }
        Ok(())
    }
}

async fn load_class_type(class_type_id: i64, pool: &SqlitePool) -> Result<ClassTypeRecord, ActionError> {
    sqlx::query_as::<_, ClassTypeRecord>("SELECT * FROM class_types WHERE id=?")
        .bind(class_type_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ActionError::not_found(format!("Class type id={class_type_id} not found")))
}

pub async fn load_template(template_id: i64, pool: &SqlitePool) -> Result<ClassTemplateRecord, ActionError> {
    sqlx::query_as::<_, ClassTemplateRecord>(&format!("{TEMPLATE_SELECT} WHERE t.id=?"))
        .bind(template_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ActionError::not_found(format!("Class template id={template_id} not found")))
}

async fn ensure_unique_type_name(name: &str, except_id: i64, pool: &SqlitePool) -> Result<(), ActionError> {
    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM class_types WHERE LOWER(name)=LOWER(?) AND id<>?")
        .bind(name.trim())
        .bind(except_id)
        .fetch_one(pool)
        .await?;
    if n > 0 {
        return Err(ActionError::conflict(format!("Class type '{}' already exists", name.trim())));
    }
    Ok(())
}

async fn check_template_refs(class_type_id: Option<i64>, age_group_id: Option<i64>, pool: &SqlitePool) -> Result<(), ActionError> {
    if let Some(class_type_id) = class_type_id {
        load_class_type(class_type_id, pool).await?;
    }
    if let Some(age_group_id) = age_group_id {
        if count(pool, "SELECT COUNT(*) FROM age_groups WHERE id=?", age_group_id).await? == 0 {
            return Err(ActionError::bad_request(format!("Age group id={age_group_id} not found")));
        }
    }
    Ok(())
}

#[get("/api/class-types")]
async fn list_class_types(db: &State<DbPool>) -> ActionResult<Vec<ClassTypeRecord>> {
    let class_types = sqlx::query_as::<_, ClassTypeRecord>("SELECT * FROM class_types ORDER BY name")
        .fetch_all(&db.0)
        .await?;
    ok(class_types)
}

#[post("/api/class-types", data = "<input>")]
async fn create_class_type(input: Json<ClassTypeInput>, admin: AdminUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<ClassTypeRecord> {
    let name = input.name.as_deref().unwrap_or_default();
    require_non_empty("Name", name)?;
    ensure_unique_type_name(name, 0, &db.0).await?;
    let mut tx = db.0.begin().await?;
    let class_type: ClassTypeRecord = sqlx::query_as("INSERT INTO class_types (name, description, created_at) VALUES (?, ?, ?) RETURNING *")
        .bind(name.trim())
        .bind(&input.description)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;
    let rec = audit::record(&mut tx, Some(admin.0.id), "CREATE", "class_type", Some(class_type.id), serde_json::to_value(&*input).unwrap_or_default()).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    info!("Class type created, id: {}, name: {}", class_type.id, class_type.name);
    ok(class_type)
}

#[patch("/api/class-types/<class_type_id>", data = "<patch>")]
async fn update_class_type(class_type_id: i64, mut patch: Json<ClassTypeInput>, admin: AdminUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<ClassTypeRecord> {
    trim_opt(&mut patch.name);
    let class_type = load_class_type(class_type_id, &db.0).await?;
    let fields = patch.fields_with_value();
    if fields.is_empty() {
        return ok(class_type);
    }
    if let Some(name) = &patch.name {
        require_non_empty("Name", name)?;
        ensure_unique_type_name(name, class_type_id, &db.0).await?;
    }
    let sql = update_sql("class_types", &fields);
    let mut tx = db.0.begin().await?;
    patch.bind_values(sqlx::query(&sql))
        .bind(class_type_id)
        .execute(&mut *tx)
        .await?;
    let rec = audit::record(&mut tx, Some(admin.0.id), "UPDATE", "class_type", Some(class_type_id), serde_json::to_value(&*patch).unwrap_or_default()).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    ok(load_class_type(class_type_id, &db.0).await?)
}

#[delete("/api/class-types/<class_type_id>")]
async fn delete_class_type(class_type_id: i64, admin: AdminUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<i64> {
    let class_type = load_class_type(class_type_id, &db.0).await?;
    let templates = count(&db.0, "SELECT COUNT(*) FROM class_templates WHERE class_type_id=?", class_type_id).await?;
    if templates > 0 {
        return Err(ActionError::conflict(format!("Cannot delete class type with {templates} template(s) attached")));
    }
    let mut tx = db.0.begin().await?;
    sqlx::query("DELETE FROM class_types WHERE id=?")
        .bind(class_type_id)
        .execute(&mut *tx)
        .await?;
    let rec = audit::record(&mut tx, Some(admin.0.id), "DELETE", "class_type", Some(class_type_id), serde_json::json!({ "name": class_type.name })).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    info!("Class type deleted, id: {class_type_id}");
    ok(class_type_id)
}

#[get("/api/class-templates?<class_type_id>&<active_only>")]
async fn list_templates(class_type_id: Option<i64>, active_only: Option<bool>, db: &State<DbPool>) -> ActionResult<Vec<ClassTemplateRecord>> {
    let mut query_builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!("{TEMPLATE_SELECT} WHERE 1=1"));
    if let Some(class_type_id) = class_type_id {
        query_builder.push(" AND t.class_type_id=");
        query_builder.push_bind(class_type_id);
    }
    if active_only.unwrap_or(false) {
        query_builder.push(" AND t.is_active=1");
    }
    query_builder.push(" ORDER BY ct.name, t.name");
    let templates = query_builder.build_query_as::<ClassTemplateRecord>()
        .fetch_all(&db.0)
        .await?;
    ok(templates)
}

#[get("/api/class-templates/<template_id>")]
async fn get_template(template_id: i64, db: &State<DbPool>) -> ActionResult<ClassTemplateRecord> {
    ok(load_template(template_id, &db.0).await?)
}

#[post("/api/class-templates", data = "<input>")]
async fn create_template(input: Json<TemplateInput>, admin: AdminUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<ClassTemplateRecord> {
    input.validate()?;
    check_template_refs(Some(input.class_type_id), input.age_group_id, &db.0).await?;
    let mut tx = db.0.begin().await?;
    let (id,): (i64,) = sqlx::query_as("INSERT INTO class_templates
                (name, class_type_id, age_group_id, duration_minutes, capacity, description, is_active, created_at)
                VALUES (?, ?, ?, ?, ?, ?, 1, ?) RETURNING id")
        .bind(input.name.trim())
        .bind(input.class_type_id)
        .bind(input.age_group_id)
        .bind(input.duration_minutes)
        .bind(input.capacity)
        .bind(&input.description)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;
    let rec = audit::record(&mut tx, Some(admin.0.id), "CREATE", "class_template", Some(id), serde_json::to_value(&*input).unwrap_or_default()).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    info!("Class template created, id: {id}, name: {}", input.name);
    ok(load_template(id, &db.0).await?)
}

#[patch("/api/class-templates/<template_id>", data = "<patch>")]
async fn update_template(template_id: i64, mut patch: Json<TemplatePatch>, admin: AdminUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<ClassTemplateRecord> {
    trim_opt(&mut patch.name);
    patch.validate()?;
    let template = load_template(template_id, &db.0).await?;
    let fields = patch.fields_with_value();
    if fields.is_empty() {
        return ok(template);
    }
    check_template_refs(patch.class_type_id, patch.age_group_id, &db.0).await?;
    let sql = update_sql("class_templates", &fields);
    let mut tx = db.0.begin().await?;
    patch.bind_values(sqlx::query(&sql))
        .bind(template_id)
        .execute(&mut *tx)
        .await?;
    let rec = audit::record(&mut tx, Some(admin.0.id), "UPDATE", "class_template", Some(template_id), serde_json::to_value(&*patch).unwrap_or_default()).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    ok(load_template(template_id, &db.0).await?)
}

#[delete("/api/class-templates/<template_id>")]
async fn delete_template(template_id: i64, admin: AdminUser, state: &State<SharedAcademyState>, db: &State<DbPool>) -> ActionResult<i64> {
    let template = load_template(template_id, &db.0).await?;
    let schedules = count(&db.0, "SELECT COUNT(*) FROM class_schedules WHERE template_id=?", template_id).await?;
    if schedules > 0 {
        return Err(ActionError::conflict(format!("Cannot delete template with {schedules} schedule(s). Deactivate it instead.")));
    }
    let sessions = count(&db.0, "SELECT COUNT(*) FROM class_sessions WHERE template_id=?", template_id).await?;
    if sessions > 0 {
        return Err(ActionError::conflict(format!("Cannot delete template with {sessions} session(s). Deactivate it instead.")));
    }
    let mut tx = db.0.begin().await?;
    sqlx::query("DELETE FROM class_templates WHERE id=?")
        .bind(template_id)
        .execute(&mut *tx)
        .await?;
    let rec = audit::record(&mut tx, Some(admin.0.id), "DELETE", "class_template", Some(template_id), serde_json::json!({ "name": template.name })).await?;
    tx.commit().await?;
    audit::publish(state, rec);
    info!("Class template deleted, id: {template_id}");
    ok(template_id)
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
        list_class_types,
        create_class_type,
        update_class_type,
        delete_class_type,
        list_templates,
        get_template,
        create_template,
        update_template,
        delete_template,
    ])
}
