use rocket::fairing::{Fairing, Info, Kind};
use rocket::{Build, Rocket};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::migrate::Migrator;
use std::path::Path;
use std::str::FromStr;
use itertools::Itertools;
use log::{error, info};

// macro to store a unit enum as SQL text, the enum must implement Display and FromStr
#[macro_export]
macro_rules! impl_sqlx_text_enum {
    ($type:ident) => {
        impl sqlx::Type<sqlx::Sqlite> for $type {
            fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                // TEXT columns only
                <&str as sqlx::Type<sqlx::Sqlite>>::type_info()
            }
            fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
                <&str as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $type {
            fn encode_by_ref(&self, buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                <String as sqlx::Encode<'q, sqlx::Sqlite>>::encode(self.to_string(), buf)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $type {
            fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
                let value = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
                Ok(value.parse::<$type>()?)
            }
        }
    };
}

// macro to implement Display and FromStr for a unit enum stored as UPPER_CASE text
#[macro_export]
macro_rules! impl_text_enum_strings {
    ($type:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl std::fmt::Display for $type {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $($type::$variant => f.write_str($text),)+
                }
            }
        }
        impl std::str::FromStr for $type {
            type Err = anyhow::Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($type::$variant),)+
                    _ => Err(anyhow::anyhow!("Unknown {} value: {}", stringify!($type), s)),
                }
            }
        }
    };
}

// macro to store a serde type as SQL JSON text
#[macro_export]
macro_rules! impl_sqlx_json_text {
    ($type:ident) => {
        impl sqlx::Type<sqlx::Sqlite> for $type {
            fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                // TEXT columns only
                <&str as sqlx::Type<sqlx::Sqlite>>::type_info()
            }
            fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
                <&str as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $type {
            fn encode_by_ref(&self, buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                let json = serde_json::to_string(self)?;
                <String as sqlx::Encode<'q, sqlx::Sqlite>>::encode(json, buf)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $type {
            fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
                let value = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
                Ok(serde_json::from_str::<$type>(value)?)
            }
        }
    };
}

static MIGRATOR: Migrator = sqlx::migrate!("db/migrations");

pub struct DbPool(pub SqlitePool);

pub async fn open_pool(database_url: &str) -> anyhow::Result<SqlitePool> {
    if database_url.starts_with("sqlite://") {
        let db_path = database_url.trim_start_matches("sqlite://");
        if !Path::new(db_path).exists() {
            info!("Creating database file: {db_path}");
            std::fs::File::create(db_path)?;
        }
    }
    info!("Opening database: {database_url}");
    let opts = SqliteConnectOptions::from_str(database_url)?
        .foreign_keys(true);
    let pool = if database_url.contains(":memory:") {
        // every in-memory connection is a separate database, keep exactly one alive
        SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts.journal_mode(SqliteJournalMode::Wal))
            .await?
    };
    MIGRATOR.run(&pool).await?;
    info!("Migrations applied successfully!");
    Ok(pool)
}

/// `UPDATE {table} SET a=?, b=? WHERE id=?` for the listed columns.
pub fn update_sql(table: &str, fields: &[&str]) -> String {
    let placeholders = fields.iter().map(|&fld_name| format!("{fld_name}=?")).join(", ");
    format!("UPDATE {table} SET {placeholders} WHERE id=?")
}

pub async fn count(pool: &SqlitePool, sql: &str, id: i64) -> Result<i64, sqlx::Error> {
    let (n,): (i64,) = sqlx::query_as(sql)
        .bind(id)
        .fetch_one(pool)
        .await?;
    Ok(n)
}

pub struct DbPoolFairing();
#[rocket::async_trait]
impl Fairing for DbPoolFairing {
    fn info(&self) -> Info {
        Info {
            name: "SQLite Database Pool with Migrations",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        let Some(database_url) = rocket.state::<crate::AppConfig>().map(|cfg| cfg.database_url.clone()) else {
            error!("Application config must be managed before the database fairing is attached");
            return Err(rocket);
        };
        let pool = match open_pool(&database_url).await {
            Ok(pool) => pool,
            Err(err) => {
                error!("Database initialization error: {:?}", err);
                return Err(rocket);
            }
        };
        Ok(rocket.manage(DbPool(pool)))
    }
}

#[cfg(test)]
mod tests {
    use super::update_sql;

    #[test]
    fn test_update_sql() {
        assert_eq!(update_sql("locations", &["name", "city"]), "UPDATE locations SET name=?, city=? WHERE id=?");
    }
}
