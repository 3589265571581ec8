// Credential store: token pair persisted in a cookie jar

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::types::{TokenPair, ACCESS_TOKEN_COOKIE, REFRESH_TOKEN_COOKIE};

/// Retention horizon for both token cookies (30 days)
pub const TOKEN_TTL_DAYS: i64 = 30;

/// Path every session cookie is scoped to
pub const COOKIE_PATH: &str = "/";

/// One cookie write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub max_age: Duration,
}

/// A change made to a jar, used to emit `Set-Cookie` headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieChange {
    Set(Cookie),
    Removed(String),
}

/// Persisted key-value jar holding session cookies
///
/// Batched reads and writes are atomic: a reader never observes half of a
/// batch.
pub trait CookieStore: Send + Sync {
    /// Read several cookies at once. Expired entries read as `None`.
    fn read(&self, names: &[&str]) -> Result<Vec<Option<String>>>;

    /// Write several cookies at once
    fn write(&self, cookies: &[Cookie]) -> Result<()>;

    /// Remove several cookies at once
    fn remove(&self, names: &[&str]) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryJar {
    entries: HashMap<String, (String, DateTime<Utc>)>,
    changes: Vec<CookieChange>,
}

/// In-process cookie jar
///
/// Clones share the same jar, so several simulated tabs can sit on one
/// origin's cookies. The SSR server seeds one per request from the
/// `Cookie` header and drains [`MemoryCookieStore::take_changes`] afterwards.
#[derive(Debug, Clone, Default)]
pub struct MemoryCookieStore {
    jar: Arc<Mutex<MemoryJar>>,
}

impl MemoryCookieStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a jar from cookies sent by a browser (no expiry known, so the
    /// default TTL applies). Seeding is not recorded as a change.
    pub fn seeded<'a>(cookies: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let store = Self::new();
        {
            let mut jar = store.lock();
            let expires_at = Utc::now() + Duration::days(TOKEN_TTL_DAYS);
            for (name, value) in cookies {
                jar.entries
                    .insert(name.to_string(), (value.to_string(), expires_at));
            }
        }
        store
    }

    /// Drain the writes and removals made since the last call
    pub fn take_changes(&self) -> Vec<CookieChange> {
        std::mem::take(&mut self.lock().changes)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryJar> {
        self.jar.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CookieStore for MemoryCookieStore {
    fn read(&self, names: &[&str]) -> Result<Vec<Option<String>>> {
        let jar = self.lock();
        let now = Utc::now();
        Ok(names
            .iter()
            .map(|name| {
                jar.entries
                    .get(*name)
                    .filter(|(_, expires_at)| *expires_at > now)
                    .map(|(value, _)| value.clone())
            })
            .collect())
    }

    fn write(&self, cookies: &[Cookie]) -> Result<()> {
        let mut jar = self.lock();
        let now = Utc::now();
        for cookie in cookies {
            jar.entries.insert(
                cookie.name.clone(),
                (cookie.value.clone(), now + cookie.max_age),
            );
            jar.changes.push(CookieChange::Set(cookie.clone()));
        }
        Ok(())
    }

    fn remove(&self, names: &[&str]) -> Result<()> {
        let mut jar = self.lock();
        for name in names {
            jar.entries.remove(*name);
            jar.changes.push(CookieChange::Removed(name.to_string()));
        }
        Ok(())
    }
}

/// Cookie jar persisted in a SQLite database
pub struct SqliteCookieStore {
    conn: Mutex<Connection>,
}

impl SqliteCookieStore {
    /// Open (or create) the jar at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create cookie directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        Self::from_connection(conn)
    }

    /// Jar that lives only as long as the process
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cookies (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                path TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )",
        )
        .context("Failed to create cookies table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CookieStore for SqliteCookieStore {
    fn read(&self, names: &[&str]) -> Result<Vec<Option<String>>> {
        let mut conn = self.lock();
        // One transaction so both rows come from the same snapshot
        let tx = conn.transaction().context("Failed to begin cookie read")?;
        let now = Utc::now();
        let mut values = Vec::with_capacity(names.len());

        for name in names {
            let row: Option<(String, String)> = tx
                .query_row(
                    "SELECT value, expires_at FROM cookies WHERE name = ?",
                    [name],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .with_context(|| format!("Failed to read cookie {}", name))?;

            let value = match row {
                Some((value, expires_at)) => {
                    let expires_at = DateTime::parse_from_rfc3339(&expires_at)
                        .with_context(|| format!("Corrupt expiry for cookie {}", name))?
                        .with_timezone(&Utc);
                    (expires_at > now).then_some(value)
                }
                None => None,
            };
            values.push(value);
        }

        tx.commit().context("Failed to finish cookie read")?;
        Ok(values)
    }

    fn write(&self, cookies: &[Cookie]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().context("Failed to begin cookie write")?;
        let now = Utc::now();

        for cookie in cookies {
            tx.execute(
                "INSERT INTO cookies (name, value, path, expires_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(name) DO UPDATE SET
                    value = excluded.value,
                    path = excluded.path,
                    expires_at = excluded.expires_at",
                params![
                    cookie.name,
                    cookie.value,
                    COOKIE_PATH,
                    (now + cookie.max_age).to_rfc3339()
                ],
            )
            .with_context(|| format!("Failed to write cookie {}", cookie.name))?;
        }

        tx.commit().context("Failed to commit cookie write")?;
        Ok(())
    }

    fn remove(&self, names: &[&str]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().context("Failed to begin cookie removal")?;

        for name in names {
            tx.execute("DELETE FROM cookies WHERE name = ?", [name])
                .with_context(|| format!("Failed to remove cookie {}", name))?;
        }

        tx.commit().context("Failed to commit cookie removal")?;
        Ok(())
    }
}

/// Token pair kept in two cookies with a fixed retention policy
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn CookieStore>,
    ttl: Duration,
}

impl CredentialStore {
    /// Store with the default 30 day retention
    pub fn new(backend: Arc<dyn CookieStore>) -> Self {
        Self::with_ttl(backend, Duration::days(TOKEN_TTL_DAYS))
    }

    pub fn with_ttl(backend: Arc<dyn CookieStore>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    /// Shorthand for a fresh in-memory store
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCookieStore::new()))
    }

    /// Current token pair, if both halves are present
    pub fn get(&self) -> Result<Option<TokenPair>> {
        let values = self
            .backend
            .read(&[ACCESS_TOKEN_COOKIE, REFRESH_TOKEN_COOKIE])?;

        match (values.first().cloned().flatten(), values.get(1).cloned().flatten()) {
            (Some(access_token), Some(refresh_token)) => Ok(Some(TokenPair {
                access_token,
                refresh_token,
            })),
            (None, None) => Ok(None),
            _ => {
                tracing::warn!("Only one session cookie present, treating session as empty");
                Ok(None)
            }
        }
    }

    /// Current access token, if a full pair is stored
    pub fn access_token(&self) -> Result<Option<String>> {
        Ok(self.get()?.map(|pair| pair.access_token))
    }

    /// Persist both tokens with the store's retention
    pub fn set(&self, pair: &TokenPair) -> Result<()> {
        self.backend
            .write(&[
                Cookie {
                    name: ACCESS_TOKEN_COOKIE.to_string(),
                    value: pair.access_token.clone(),
                    max_age: self.ttl,
                },
                Cookie {
                    name: REFRESH_TOKEN_COOKIE.to_string(),
                    value: pair.refresh_token.clone(),
                    max_age: self.ttl,
                },
            ])
            .context("Failed to persist token pair")
    }

    /// Remove both tokens
    pub fn clear(&self) -> Result<()> {
        self.backend
            .remove(&[ACCESS_TOKEN_COOKIE, REFRESH_TOKEN_COOKIE])
            .context("Failed to clear token pair")
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> TokenPair {
        TokenPair::new("T1", "R1")
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = CredentialStore::in_memory();
        assert_eq!(store.get().unwrap(), None);

        store.set(&pair()).unwrap();
        assert_eq!(store.get().unwrap(), Some(pair()));
        assert_eq!(store.access_token().unwrap().as_deref(), Some("T1"));

        store.clear().unwrap();
        assert_eq!(store.get().unwrap(), None);
    }

    #[test]
    fn test_clear_is_idempotent() {
        let store = CredentialStore::in_memory();
        store.clear().unwrap();
        store.clear().unwrap();
        assert_eq!(store.get().unwrap(), None);
    }

    #[test]
    fn test_half_pair_reads_as_empty() {
        let backend = Arc::new(MemoryCookieStore::seeded([(ACCESS_TOKEN_COOKIE, "T1")]));
        let store = CredentialStore::new(backend);
        assert_eq!(store.get().unwrap(), None);
    }

    #[test]
    fn test_expired_cookies_read_as_absent() {
        let backend = Arc::new(MemoryCookieStore::new());
        let store = CredentialStore::with_ttl(backend, Duration::seconds(-1));
        store.set(&pair()).unwrap();
        assert_eq!(store.get().unwrap(), None);
    }

    #[test]
    fn test_clones_share_the_jar() {
        let backend = MemoryCookieStore::new();
        let tab_a = CredentialStore::new(Arc::new(backend.clone()));
        let tab_b = CredentialStore::new(Arc::new(backend));

        tab_a.set(&pair()).unwrap();
        assert_eq!(tab_b.get().unwrap(), Some(pair()));

        tab_b.clear().unwrap();
        assert_eq!(tab_a.get().unwrap(), None);
    }

    #[test]
    fn test_memory_store_records_changes() {
        let backend = MemoryCookieStore::seeded([
            (ACCESS_TOKEN_COOKIE, "T1"),
            (REFRESH_TOKEN_COOKIE, "R1"),
        ]);
        assert!(backend.take_changes().is_empty());

        let store = CredentialStore::new(Arc::new(backend.clone()));
        store.set(&TokenPair::new("T2", "R2")).unwrap();
        store.clear().unwrap();

        let changes = backend.take_changes();
        assert_eq!(changes.len(), 4);
        assert!(matches!(&changes[0], CookieChange::Set(c) if c.name == ACCESS_TOKEN_COOKIE && c.value == "T2"));
        assert_eq!(changes[3], CookieChange::Removed(REFRESH_TOKEN_COOKIE.to_string()));
        assert!(backend.take_changes().is_empty());
    }

    #[test]
    fn test_sqlite_store_roundtrip() {
        let store = CredentialStore::new(Arc::new(SqliteCookieStore::open_in_memory().unwrap()));
        assert_eq!(store.get().unwrap(), None);

        store.set(&pair()).unwrap();
        assert_eq!(store.get().unwrap(), Some(pair()));

        store.set(&TokenPair::new("T2", "R2")).unwrap();
        assert_eq!(store.get().unwrap(), Some(TokenPair::new("T2", "R2")));

        store.clear().unwrap();
        assert_eq!(store.get().unwrap(), None);
    }

    #[test]
    fn test_sqlite_store_persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cookies.sqlite3");

        {
            let store = CredentialStore::new(Arc::new(SqliteCookieStore::open(&path).unwrap()));
            store.set(&pair()).unwrap();
        }

        let store = CredentialStore::new(Arc::new(SqliteCookieStore::open(&path).unwrap()));
        assert_eq!(store.get().unwrap(), Some(pair()));
    }

    #[test]
    fn test_sqlite_store_expiry() {
        let backend = Arc::new(SqliteCookieStore::open_in_memory().unwrap());
        let store = CredentialStore::with_ttl(backend, Duration::seconds(-1));
        store.set(&pair()).unwrap();
        assert_eq!(store.get().unwrap(), None);
    }
}
