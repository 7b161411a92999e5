use std::{
    collections::HashMap,
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use tokio::sync::Mutex;
use tracing::debug;

/// Named fields of the persisted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKey {
    ChannelId,
    ScreenName,
    ParticipantId,
}

impl StoreKey {
    pub const ALL: [StoreKey; 3] = [Self::ChannelId, Self::ScreenName, Self::ParticipantId];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChannelId => "channelId",
            Self::ScreenName => "screenName",
            Self::ParticipantId => "participantId",
        }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreKey {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|key| key.as_str() == value)
            .ok_or_else(|| anyhow!("unknown session store key '{value}'"))
    }
}

/// String-valued key/value store backing the client session. An absent key
/// means "unset".
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: StoreKey) -> Result<Option<String>>;
    /// Reads several related fields in one step so callers never observe a
    /// half-written session.
    async fn get_many(&self, keys: &[StoreKey]) -> Result<HashMap<StoreKey, String>>;
    async fn set_many(&self, entries: &[(StoreKey, &str)]) -> Result<()>;
    async fn remove(&self, key: StoreKey) -> Result<()>;
    async fn clear(&self) -> Result<()>;

    async fn set(&self, key: StoreKey, value: &str) -> Result<()> {
        self.set_many(&[(key, value)]).await
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<StoreKey, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get(&self, key: StoreKey) -> Result<Option<String>> {
        Ok(self.entries.lock().await.get(&key).cloned())
    }

    async fn get_many(&self, keys: &[StoreKey]) -> Result<HashMap<StoreKey, String>> {
        let guard = self.entries.lock().await;
        Ok(keys
            .iter()
            .filter_map(|key| guard.get(key).map(|value| (*key, value.clone())))
            .collect())
    }

    async fn set_many(&self, entries: &[(StoreKey, &str)]) -> Result<()> {
        let mut guard = self.entries.lock().await;
        for (key, value) in entries {
            guard.insert(*key, (*value).to_string());
        }
        Ok(())
    }

    async fn remove(&self, key: StoreKey) -> Result<()> {
        self.entries.lock().await.remove(&key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.lock().await.clear();
        Ok(())
    }
}

/// SQLite-backed store; survives process restarts when pointed at a file.
#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: Pool<Sqlite>,
}

impl SqliteSessionStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid session store url '{database_url}'"))?
            .create_if_missing(true);
        // Every connection to `sqlite::memory:` opens a fresh database, so the
        // pool must keep exactly one connection alive.
        let pool_options = if is_memory_url(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open session store '{database_url}'"))?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!(url = database_url, "storage: session store ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get(&self, key: StoreKey) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM session_kv WHERE key = ?")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to read session field '{key}'"))?;
        Ok(value)
    }

    async fn get_many(&self, keys: &[StoreKey]) -> Result<HashMap<StoreKey, String>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let placeholders = vec!["?"; keys.len()].join(", ");
        let sql = format!("SELECT key, value FROM session_kv WHERE key IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for key in keys {
            query = query.bind(key.as_str());
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .context("failed to read session fields")?;

        let mut values = HashMap::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("key")?;
            let value: String = row.try_get("value")?;
            values.insert(StoreKey::from_str(&key)?, value);
        }
        Ok(values)
    }

    async fn set_many(&self, entries: &[(StoreKey, &str)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (key, value) in entries {
            sqlx::query(
                r#"
                INSERT INTO session_kv (key, value, updated_at)
                VALUES (?, ?, CURRENT_TIMESTAMP)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = CURRENT_TIMESTAMP
                "#,
            )
            .bind(key.as_str())
            .bind(*value)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to write session field '{key}'"))?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn remove(&self, key: StoreKey) -> Result<()> {
        sqlx::query("DELETE FROM session_kv WHERE key = ?")
            .bind(key.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to remove session field '{key}'"))?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM session_kv")
            .execute(&self.pool)
            .await
            .context("failed to clear session store")?;
        Ok(())
    }
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
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
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
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
