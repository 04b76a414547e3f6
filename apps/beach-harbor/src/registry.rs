//! SQLite-backed registry of game droplets.
//!
//! One row per droplet address. Every write runs inside its own transaction and
//! starts with a write statement, so SQLite's write lock serializes concurrent
//! read-modify-write cycles on the same row without application-level locking.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Sqlite, Transaction};
use thiserror::Error;
use tracing::{debug, info};

pub const SHARE_TAG_LEN: usize = 6;
const SHARE_TAG_ATTEMPTS: usize = 8;

/// Produces share tag candidates. Collisions are detected by the store, so a
/// source only has to be random enough to make them rare.
pub type ShareTagSource = Arc<dyn Fn() -> String + Send + Sync>;

/// Provider-assigned droplet identifier. Zero is not a valid id; records without
/// a backing droplet carry `None` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct DropletId(i64);

impl DropletId {
    pub fn new(raw: i64) -> Option<Self> {
        (raw > 0).then_some(Self(raw))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for DropletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A droplet as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Droplet {
    pub address: String,
    pub id: DropletId,
}

impl Droplet {
    pub fn new(address: impl Into<String>, id: DropletId) -> Self {
        Self {
            address: address.into(),
            id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub address: String,
    pub connected_clients: u32,
    pub last_seen: DateTime<Utc>,
    pub droplet_id: Option<DropletId>,
    pub share_tag: String,
}

impl SessionRecord {
    pub fn is_free(&self) -> bool {
        self.connected_clients == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeSession {
    pub address: String,
    pub share_tag: String,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("no unique share tag after {0} attempts")]
    ShareTagExhausted(usize),
}

#[derive(FromRow)]
struct DropletRow {
    ipv4: String,
    connected_clients: i64,
    last_heartbeat: i64,
    droplet_id: Option<i64>,
    share_tag: String,
}

impl From<DropletRow> for SessionRecord {
    fn from(row: DropletRow) -> Self {
        Self {
            address: row.ipv4,
            connected_clients: u32::try_from(row.connected_clients.max(0)).unwrap_or(u32::MAX),
            last_seen: DateTime::from_timestamp_millis(row.last_heartbeat).unwrap_or_default(),
            droplet_id: row.droplet_id.and_then(DropletId::new),
            share_tag: row.share_tag,
        }
    }
}

#[derive(Clone)]
pub struct Registry {
    pool: SqlitePool,
    share_tags: ShareTagSource,
}

impl Registry {
    /// Opens (creating if needed) the database file at `path` and applies migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        info!(path = %path.display(), "registry opened");
        Self::from_pool(pool).await
    }

    /// A private in-memory database. The pool is pinned to one connection that
    /// never expires, since every SQLite memory connection is its own database.
    pub async fn in_memory() -> Result<Self, RegistryError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, RegistryError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self {
            pool,
            share_tags: Arc::new(generate_share_tag),
        })
    }

    pub fn with_share_tags(mut self, source: ShareTagSource) -> Self {
        self.share_tags = source;
        self
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// The least recently touched droplet with no connected clients.
    pub async fn find_free_session(&self) -> Result<Option<FreeSession>, RegistryError> {
        let row: Option<(String, String)> = sqlx::query_as(
            r#"
            SELECT ipv4, share_tag FROM game_droplets
            WHERE connected_clients <= 0
            ORDER BY last_heartbeat ASC, ipv4 ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(address, share_tag)| FreeSession { address, share_tag }))
    }

    /// Records a heartbeat, creating the row when the droplet is not known yet.
    pub async fn upsert_heartbeat(
        &self,
        address: &str,
        connected_clients: u32,
    ) -> Result<bool, RegistryError> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE game_droplets SET connected_clients = ?, last_heartbeat = ? WHERE ipv4 = ?",
        )
        .bind(i64::from(connected_clients))
        .bind(now)
        .bind(address)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            let share_tag = self.reserve_share_tag(&mut tx, now).await?;
            sqlx::query(
                r#"
                INSERT INTO game_droplets (ipv4, connected_clients, last_heartbeat, droplet_id, share_tag)
                VALUES (?, ?, ?, NULL, ?)
                "#,
            )
            .bind(address)
            .bind(i64::from(connected_clients))
            .bind(now)
            .bind(&share_tag)
            .execute(&mut *tx)
            .await?;
            debug!(%address, %share_tag, "heartbeat created registry record");
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Folds the provider's view into the registry. Known rows get their droplet
    /// id and timestamp refreshed; unknown ones are created free with a new tag.
    /// Client counts of existing rows are left alone.
    pub async fn reconcile(&self, droplets: &[Droplet]) -> Result<(), RegistryError> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        for droplet in droplets {
            let updated = sqlx::query(
                "UPDATE game_droplets SET droplet_id = ?, last_heartbeat = ? WHERE ipv4 = ?",
            )
            .bind(droplet.id.get())
            .bind(now)
            .bind(&droplet.address)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if updated == 0 {
                let share_tag = self.reserve_share_tag(&mut tx, now).await?;
                sqlx::query(
                    r#"
                    INSERT INTO game_droplets (ipv4, connected_clients, last_heartbeat, droplet_id, share_tag)
                    VALUES (?, 0, ?, ?, ?)
                    "#,
                )
                .bind(&droplet.address)
                .bind(now)
                .bind(droplet.id.get())
                .bind(&share_tag)
                .execute(&mut *tx)
                .await?;
                debug!(
                    address = %droplet.address,
                    droplet_id = %droplet.id,
                    %share_tag,
                    "reconcile created registry record"
                );
            }
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_by_address(&self, address: &str) -> Result<bool, RegistryError> {
        let removed = sqlx::query("DELETE FROM game_droplets WHERE ipv4 = ?")
            .bind(address)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed > 0)
    }

    /// Removes the row only while it still points at `id`.
    pub async fn delete_if_droplet(
        &self,
        address: &str,
        id: DropletId,
    ) -> Result<bool, RegistryError> {
        let removed = sqlx::query("DELETE FROM game_droplets WHERE ipv4 = ? AND droplet_id = ?")
            .bind(address)
            .bind(id.get())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed > 0)
    }

    pub async fn droplet_id_for(&self, address: &str) -> Result<Option<DropletId>, RegistryError> {
        let raw: Option<Option<i64>> =
            sqlx::query_scalar("SELECT droplet_id FROM game_droplets WHERE ipv4 = ?")
                .bind(address)
                .fetch_optional(&self.pool)
                .await?;
        Ok(raw.flatten().and_then(DropletId::new))
    }

    /// Tags are matched case-insensitively.
    pub async fn address_for_share_tag(&self, tag: &str) -> Result<Option<String>, RegistryError> {
        let tag = tag.trim().to_ascii_uppercase();
        let address = sqlx::query_scalar("SELECT ipv4 FROM game_droplets WHERE share_tag = ?")
            .bind(tag)
            .fetch_optional(&self.pool)
            .await?;
        Ok(address)
    }

    pub async fn share_tag_for(&self, address: &str) -> Result<Option<String>, RegistryError> {
        let tag = sqlx::query_scalar("SELECT share_tag FROM game_droplets WHERE ipv4 = ?")
            .bind(address)
            .fetch_optional(&self.pool)
            .await?;
        Ok(tag)
    }

    pub async fn get(&self, address: &str) -> Result<Option<SessionRecord>, RegistryError> {
        let row: Option<DropletRow> = sqlx::query_as(
            r#"
            SELECT ipv4, connected_clients, last_heartbeat, droplet_id, share_tag
            FROM game_droplets WHERE ipv4 = ?
            "#,
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SessionRecord::from))
    }

    pub async fn list(&self) -> Result<Vec<SessionRecord>, RegistryError> {
        let rows: Vec<DropletRow> = sqlx::query_as(
            r#"
            SELECT ipv4, connected_clients, last_heartbeat, droplet_id, share_tag
            FROM game_droplets ORDER BY ipv4 ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(SessionRecord::from).collect())
    }

    async fn reserve_share_tag(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        now: i64,
    ) -> Result<String, RegistryError> {
        for _ in 0..SHARE_TAG_ATTEMPTS {
            let candidate = (self.share_tags)().to_ascii_uppercase();
            let inserted = sqlx::query(
                "INSERT OR IGNORE INTO issued_share_tags (share_tag, issued_at) VALUES (?, ?)",
            )
            .bind(&candidate)
            .bind(now)
            .execute(&mut **tx)
            .await?
            .rows_affected();
            if inserted == 1 {
                return Ok(candidate);
            }
            debug!(share_tag = %candidate, "share tag already issued; regenerating");
        }
        Err(RegistryError::ShareTagExhausted(SHARE_TAG_ATTEMPTS))
    }
}

fn generate_share_tag() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(|c| char::from(c).to_ascii_uppercase())
        .take(SHARE_TAG_LEN)
        .collect()
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    async fn registry() -> Registry {
        Registry::in_memory().await.expect("in-memory registry")
    }

    fn scripted_tags(tags: &[&str]) -> ShareTagSource {
        let queue: Mutex<VecDeque<String>> =
            Mutex::new(tags.iter().map(|t| t.to_string()).collect());
        Arc::new(move || {
            queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| "ZZZZZZ".to_string())
        })
    }

    async fn tick() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    #[tokio::test]
    async fn heartbeat_creates_record_with_share_tag() {
        let registry = registry().await;
        assert!(registry.upsert_heartbeat("10.0.9.1", 0).await.unwrap());

        let record = registry.get("10.0.9.1").await.unwrap().expect("record");
        assert_eq!(record.connected_clients, 0);
        assert!(record.is_free());
        assert_eq!(record.droplet_id, None);
        assert_eq!(record.share_tag.len(), SHARE_TAG_LEN);
        assert!(record
            .share_tag
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn last_heartbeat_wins_and_drives_freeness() {
        let registry = registry().await;
        let original_tag = {
            registry.upsert_heartbeat("10.0.0.4", 3).await.unwrap();
            registry.share_tag_for("10.0.0.4").await.unwrap().unwrap()
        };

        for clients in [5, 5, 0, 2, 0] {
            registry.upsert_heartbeat("10.0.0.4", clients).await.unwrap();
            let record = registry.get("10.0.0.4").await.unwrap().unwrap();
            assert_eq!(record.connected_clients, clients);
            assert_eq!(record.is_free(), clients == 0);
        }

        assert_eq!(
            registry.share_tag_for("10.0.0.4").await.unwrap().unwrap(),
            original_tag
        );
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_refreshes_last_seen() {
        let registry = registry().await;
        registry.upsert_heartbeat("10.0.0.4", 1).await.unwrap();
        let first = registry.get("10.0.0.4").await.unwrap().unwrap().last_seen;
        tick().await;
        registry.upsert_heartbeat("10.0.0.4", 1).await.unwrap();
        let second = registry.get("10.0.0.4").await.unwrap().unwrap().last_seen;
        assert!(second > first);
    }

    #[tokio::test]
    async fn find_free_session_skips_busy_droplets() {
        let registry = registry().await;
        assert_eq!(registry.find_free_session().await.unwrap(), None);

        registry.upsert_heartbeat("10.0.0.1", 4).await.unwrap();
        registry.upsert_heartbeat("10.0.0.2", 1).await.unwrap();
        assert_eq!(registry.find_free_session().await.unwrap(), None);

        registry.upsert_heartbeat("10.0.0.2", 0).await.unwrap();
        let free = registry.find_free_session().await.unwrap().unwrap();
        assert_eq!(free.address, "10.0.0.2");
    }

    #[tokio::test]
    async fn find_free_session_prefers_least_recently_seen() {
        let registry = registry().await;
        registry.upsert_heartbeat("10.0.0.1", 0).await.unwrap();
        tick().await;
        registry.upsert_heartbeat("10.0.0.2", 0).await.unwrap();
        tick().await;
        registry.upsert_heartbeat("10.0.0.3", 0).await.unwrap();

        let free = registry.find_free_session().await.unwrap().unwrap();
        assert_eq!(free.address, "10.0.0.1");

        tick().await;
        registry.upsert_heartbeat("10.0.0.1", 0).await.unwrap();
        let free = registry.find_free_session().await.unwrap().unwrap();
        assert_eq!(free.address, "10.0.0.2");

        // Reading does not touch the row.
        let again = registry.find_free_session().await.unwrap().unwrap();
        assert_eq!(again, free);
    }

    #[tokio::test]
    async fn reconciled_droplet_is_free() {
        let registry = registry().await;
        let id = DropletId::new(5).unwrap();
        registry
            .reconcile(&[Droplet::new("10.0.0.5", id)])
            .await
            .unwrap();

        let free = registry.find_free_session().await.unwrap().unwrap();
        assert_eq!(free.address, "10.0.0.5");
        assert_eq!(registry.droplet_id_for("10.0.0.5").await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn reconcile_keeps_client_count_and_tag() {
        let registry = registry().await;
        registry.upsert_heartbeat("10.0.0.6", 7).await.unwrap();
        let tag = registry.share_tag_for("10.0.0.6").await.unwrap().unwrap();

        let id = DropletId::new(66).unwrap();
        registry
            .reconcile(&[
                Droplet::new("10.0.0.6", id),
                Droplet::new("10.0.0.7", DropletId::new(67).unwrap()),
            ])
            .await
            .unwrap();

        let record = registry.get("10.0.0.6").await.unwrap().unwrap();
        assert_eq!(record.connected_clients, 7);
        assert_eq!(record.droplet_id, Some(id));
        assert_eq!(record.share_tag, tag);
        assert_eq!(registry.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delete_reports_whether_a_row_went_away() {
        let registry = registry().await;
        registry.upsert_heartbeat("10.0.9.1", 0).await.unwrap();
        let tag = registry.share_tag_for("10.0.9.1").await.unwrap().unwrap();

        assert!(registry.delete_by_address("10.0.9.1").await.unwrap());
        assert!(!registry.delete_by_address("10.0.9.1").await.unwrap());
        assert_eq!(registry.get("10.0.9.1").await.unwrap(), None);
        assert_eq!(registry.droplet_id_for("10.0.9.1").await.unwrap(), None);
        assert_eq!(registry.address_for_share_tag(&tag).await.unwrap(), None);
        assert_eq!(registry.find_free_session().await.unwrap(), None);
    }

    #[tokio::test]
    async fn scoped_delete_spares_rows_owned_by_others() {
        let registry = registry().await;
        let id = DropletId::new(9).unwrap();
        registry.upsert_heartbeat("10.0.0.9", 2).await.unwrap();

        assert!(!registry.delete_if_droplet("10.0.0.9", id).await.unwrap());
        assert!(registry.get("10.0.0.9").await.unwrap().is_some());

        registry
            .reconcile(&[Droplet::new("10.0.0.9", DropletId::new(10).unwrap())])
            .await
            .unwrap();
        assert!(!registry.delete_if_droplet("10.0.0.9", id).await.unwrap());

        registry
            .reconcile(&[Droplet::new("10.0.0.9", id)])
            .await
            .unwrap();
        assert!(registry.delete_if_droplet("10.0.0.9", id).await.unwrap());
        assert_eq!(registry.get("10.0.0.9").await.unwrap(), None);
    }

    #[tokio::test]
    async fn share_tag_lookup_ignores_case() {
        let registry = registry()
            .await
            .with_share_tags(scripted_tags(&["AB12CD"]));
        registry.upsert_heartbeat("10.0.0.8", 0).await.unwrap();

        for tag in ["AB12CD", "ab12cd", " Ab12Cd "] {
            assert_eq!(
                registry.address_for_share_tag(tag).await.unwrap().as_deref(),
                Some("10.0.0.8")
            );
        }
        assert_eq!(registry.address_for_share_tag("MISSING").await.unwrap(), None);
    }

    #[tokio::test]
    async fn colliding_tags_are_regenerated() {
        let registry = registry()
            .await
            .with_share_tags(scripted_tags(&["AAAAAA", "AAAAAA", "BBBBBB"]));
        registry.upsert_heartbeat("10.0.0.1", 0).await.unwrap();
        registry.upsert_heartbeat("10.0.0.2", 0).await.unwrap();

        assert_eq!(registry.share_tag_for("10.0.0.1").await.unwrap().unwrap(), "AAAAAA");
        assert_eq!(registry.share_tag_for("10.0.0.2").await.unwrap().unwrap(), "BBBBBB");
    }

    #[tokio::test]
    async fn tags_of_deleted_records_are_never_reissued() {
        let registry = registry()
            .await
            .with_share_tags(scripted_tags(&["OLDTAG", "OLDTAG", "NEWTAG"]));
        registry.upsert_heartbeat("10.0.0.1", 0).await.unwrap();
        assert!(registry.delete_by_address("10.0.0.1").await.unwrap());

        registry.upsert_heartbeat("10.0.0.2", 0).await.unwrap();
        assert_eq!(registry.share_tag_for("10.0.0.2").await.unwrap().unwrap(), "NEWTAG");
        assert_eq!(registry.address_for_share_tag("OLDTAG").await.unwrap(), None);
    }

    #[tokio::test]
    async fn exhausted_tag_space_leaves_no_record() {
        let registry = registry()
            .await
            .with_share_tags(Arc::new(|| "SAMESA".to_string()));
        registry.upsert_heartbeat("10.0.0.1", 0).await.unwrap();

        let err = registry.upsert_heartbeat("10.0.0.2", 0).await.unwrap_err();
        assert!(matches!(err, RegistryError::ShareTagExhausted(SHARE_TAG_ATTEMPTS)));
        assert_eq!(registry.get("10.0.0.2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn generated_tags_are_distinct() {
        let registry = registry().await;
        for i in 0..50 {
            registry
                .upsert_heartbeat(&format!("10.1.0.{i}"), 0)
                .await
                .unwrap();
        }
        let tags: HashSet<String> = registry
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.share_tag)
            .collect();
        assert_eq!(tags.len(), 50);
    }

    #[test]
    fn droplet_id_rejects_zero_and_negative() {
        assert_eq!(DropletId::new(0), None);
        assert_eq!(DropletId::new(-3), None);
        assert_eq!(DropletId::new(77).map(DropletId::get), Some(77));
    }
}
