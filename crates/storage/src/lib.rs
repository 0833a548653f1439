use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use shared::domain::{Identity, Session};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use tokio::sync::Mutex;
use tracing::debug;

const ACCESS_TOKEN_KEY: &str = "access_token";
const REFRESH_TOKEN_KEY: &str = "refresh_token";
const IDENTITY_KEY: &str = "identity";

/// Durable home of the session's token pair and identity.
///
/// Implementations persist all three values together; callers serialize
/// access through the request client's refresh gate.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<Option<Session>>;
    async fn save(&self, session: &Session) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteCredentialStore {
    pool: Pool<Sqlite>,
}

impl SqliteCredentialStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid credential database url '{database_url}'"))?
            .create_if_missing(true);
        // A single connection keeps `sqlite::memory:` stores coherent and
        // serializes writers for file-backed ones.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open credential store at '{database_url}'"))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                name       TEXT PRIMARY KEY NOT NULL,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to ensure credentials table exists")?;

        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn read_value(&self, name: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM credentials WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to read credential '{name}'"))?;
        row.map(|row| row.try_get::<String, _>("value"))
            .transpose()
            .map_err(Into::into)
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn load(&self) -> Result<Option<Session>> {
        let (Some(access_token), Some(refresh_token)) = (
            self.read_value(ACCESS_TOKEN_KEY).await?,
            self.read_value(REFRESH_TOKEN_KEY).await?,
        ) else {
            return Ok(None);
        };
        let Some(raw_identity) = self.read_value(IDENTITY_KEY).await? else {
            return Ok(None);
        };
        let identity: Identity = serde_json::from_str(&raw_identity)
            .context("stored identity is not valid json")?;

        Ok(Some(Session {
            access_token,
            refresh_token,
            identity,
        }))
    }

    async fn save(&self, session: &Session) -> Result<()> {
        if session.access_token.is_empty() || session.refresh_token.is_empty() {
            return Err(anyhow!("refusing to persist a session with an empty token"));
        }
        let identity = serde_json::to_string(&session.identity)?;

        let mut tx = self.pool.begin().await?;
        for (name, value) in [
            (REFRESH_TOKEN_KEY, session.refresh_token.as_str()),
            (ACCESS_TOKEN_KEY, session.access_token.as_str()),
            (IDENTITY_KEY, identity.as_str()),
        ] {
            sqlx::query(
                r#"
                INSERT INTO credentials (name, value, updated_at)
                VALUES (?, ?, CURRENT_TIMESTAMP)
                ON CONFLICT(name) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(name)
            .bind(value)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to write credential '{name}'"))?;
        }
        tx.commit().await.context("failed to commit credentials")?;

        debug!(user_id = %session.identity.id, "credentials: session persisted");
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let removed = sqlx::query("DELETE FROM credentials")
            .execute(&self.pool)
            .await
            .context("failed to clear credentials")?
            .rows_affected();
        debug!(removed, "credentials: cleared");
        Ok(())
    }
}

/// Process-local store for tests and sessions that must not outlive the process.
#[derive(Default)]
pub struct MemoryCredentialStore {
    session: Mutex<Option<Session>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: Session) -> Self {
        Self {
            session: Mutex::new(Some(session)),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<Session>> {
        Ok(self.session.lock().await.clone())
    }

    async fn save(&self, session: &Session) -> Result<()> {
        *self.session.lock().await = Some(session.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.session.lock().await.take();
        Ok(())
    }
}

pub fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
