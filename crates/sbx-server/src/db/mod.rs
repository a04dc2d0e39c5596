//! Reference database: users, distinct file contents, and file placements.
//!
//! Schema is created from static DDL at startup. Concurrent reconciliations
//! may insert the same row; duplicate-key conflicts are the sanctioned
//! idempotency pattern and surface as [`AddOutcome::Duplicate`].

mod query;
mod record;

pub use query::Select;
pub use record::{FileRecord, FileRefRecord, UserRecord};

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::debug;

use sbx_core::constants::{
    ENV_DB_DATABASE, ENV_DB_HOST, ENV_DB_PORT, ENV_DB_PWD, ENV_DB_USER,
};
use sbx_core::error::{Error, Result};

/// Environment-derived connection settings, read once at startup.
///
/// The SQLite driver only consumes `database` (the file path, `:memory:` for
/// tests); the remaining fields are carried for network-backed drivers
/// behind the same contract.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: String,
    pub database: String,
}

impl DbConfig {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).unwrap_or_default();
        let mut config = Self {
            user: var(ENV_DB_USER),
            password: var(ENV_DB_PWD),
            host: var(ENV_DB_HOST),
            port: var(ENV_DB_PORT),
            database: var(ENV_DB_DATABASE),
        };
        if config.database.is_empty() {
            config.database = "sbx.db".to_string();
        }
        config
    }
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS user (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        password TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS file (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        checksum TEXT NOT NULL,
        user_id INTEGER NOT NULL REFERENCES user(id),
        UNIQUE (user_id, checksum)
    )",
    "CREATE TABLE IF NOT EXISTS file_ref (
        user_id INTEGER NOT NULL REFERENCES user(id),
        file_id INTEGER NOT NULL REFERENCES file(id),
        path TEXT NOT NULL,
        device TEXT NOT NULL,
        PRIMARY KEY (user_id, file_id, path, device)
    )",
];

/// Whether an insert landed a new row or hit an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Inserted,
    Duplicate,
}

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    pub async fn connect(config: &DbConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", config.database))
            .map_err(db_err)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // single connection: SQLite permits limited write concurrency, and
        // the duplicate-key idempotency pattern needs serialized inserts.
        // the connection must never be recycled or an in-memory database
        // would vanish with it
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        let db = Self { pool };
        db.create_schema().await?;
        Ok(db)
    }

    /// Private in-memory database, one per call. Test support.
    pub async fn connect_in_memory() -> Result<Self> {
        let config = DbConfig {
            user: String::new(),
            password: String::new(),
            host: String::new(),
            port: String::new(),
            database: ":memory:".to_string(),
        };
        Self::connect(&config).await
    }

    async fn create_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    /// Look up a user, creating the row on first contact.
    pub async fn get_or_create_user(&self, username: &str, password: &str) -> Result<UserRecord> {
        let select = Select::from("user").filter("username = ?").sql();
        if let Some(user) = sqlx::query_as::<_, UserRecord>(&select)
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
        {
            return Ok(user);
        }

        match sqlx::query("INSERT INTO user (username, password) VALUES (?, ?)")
            .bind(username)
            .bind(password)
            .execute(&self.pool)
            .await
        {
            Ok(_) => debug!(username, "created user"),
            // another connection won the race; fall through to the re-select
            Err(err) if is_unique_violation(&err) => {}
            Err(err) => return Err(db_err(err)),
        }

        sqlx::query_as::<_, UserRecord>(&select)
            .bind(username)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }

    pub async fn add_file_record(&self, user_id: i64, checksum: &str) -> Result<AddOutcome> {
        match sqlx::query("INSERT INTO file (checksum, user_id) VALUES (?, ?)")
            .bind(checksum)
            .bind(user_id)
            .execute(&self.pool)
            .await
        {
            Ok(_) => Ok(AddOutcome::Inserted),
            Err(err) if is_unique_violation(&err) => Ok(AddOutcome::Duplicate),
            Err(err) => Err(db_err(err)),
        }
    }

    pub async fn file_record(&self, user_id: i64, checksum: &str) -> Result<Option<FileRecord>> {
        let sql = Select::from("file")
            .filter("user_id = ? AND checksum = ?")
            .sql();
        sqlx::query_as::<_, FileRecord>(&sql)
            .bind(user_id)
            .bind(checksum)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    pub async fn file_records(&self, user_id: i64) -> Result<Vec<FileRecord>> {
        let sql = Select::from("file").filter("user_id = ?").sql();
        sqlx::query_as::<_, FileRecord>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    pub async fn file_ref_records(&self, user_id: i64) -> Result<Vec<FileRefRecord>> {
        let sql = Select::from("file_ref").filter("user_id = ?").sql();
        sqlx::query_as::<_, FileRefRecord>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    pub async fn add_file_ref_record(
        &self,
        user_id: i64,
        file_id: i64,
        path: &str,
        device: &str,
    ) -> Result<AddOutcome> {
        match sqlx::query(
            "INSERT INTO file_ref (user_id, file_id, path, device) VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(file_id)
        .bind(path)
        .bind(device)
        .execute(&self.pool)
        .await
        {
            Ok(_) => Ok(AddOutcome::Inserted),
            Err(err) if is_unique_violation(&err) => Ok(AddOutcome::Duplicate),
            Err(err) => Err(db_err(err)),
        }
    }

    /// Drop every placement of this content for the user. Returns how many
    /// rows went away.
    pub async fn delete_file_ref_records(&self, user_id: i64, checksum: &str) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM file_ref
             WHERE user_id = ?
               AND file_id IN (SELECT id FROM file WHERE user_id = ? AND checksum = ?)",
        )
        .bind(user_id)
        .bind(user_id)
        .bind(checksum)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    pub async fn delete_file_record(&self, file_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM file WHERE id = ?")
            .bind(file_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// File rows with no surviving placement: the GC roots.
    pub async fn no_ref_files(&self, user_id: i64) -> Result<Vec<FileRecord>> {
        sqlx::query_as::<_, FileRecord>(
            "SELECT f.id, f.checksum, f.user_id FROM file f
             LEFT JOIN file_ref r ON r.file_id = f.id
             WHERE f.user_id = ? AND r.file_id IS NULL",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }
}

fn db_err(err: sqlx::Error) -> Error {
    Error::database(err.to_string())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}
