use crate::models::{Hit, HitType, QueuedHit};
use crate::storage::{HitStore, PendingPage, StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

#[derive(sqlx::FromRow)]
struct HitRow {
    id: i64,
    tracking_id: String,
    client_id: String,
    hit_type: String,
    created_at_ms: i64,
    session_start: bool,
    use_https: bool,
    parameters: String,
    custom_dimensions: String,
    custom_metrics: String,
}

impl HitRow {
    fn decode(self) -> StorageResult<QueuedHit> {
        let id = self.id;
        let corrupt = |reason: String| StorageError::Corrupt { id, reason };

        let hit_type = HitType::from_str(&self.hit_type).map_err(|e| corrupt(e.to_string()))?;
        let timestamp = Utc
            .timestamp_millis_opt(self.created_at_ms)
            .single()
            .ok_or_else(|| corrupt(format!("bad timestamp {}", self.created_at_ms)))?;
        let parameters =
            serde_json::from_str(&self.parameters).map_err(|e| corrupt(e.to_string()))?;
        let custom_dimensions =
            serde_json::from_str(&self.custom_dimensions).map_err(|e| corrupt(e.to_string()))?;
        let custom_metrics =
            serde_json::from_str(&self.custom_metrics).map_err(|e| corrupt(e.to_string()))?;

        Ok(QueuedHit {
            id,
            hit: Hit {
                tracking_id: self.tracking_id,
                client_id: self.client_id,
                hit_type,
                timestamp,
                session_start: self.session_start,
                use_https: self.use_https,
                parameters,
                custom_dimensions,
                custom_metrics,
            },
        })
    }
}

/// SQLite-backed persistent queue
pub struct SqliteHitStore {
    pool: Arc<SqlitePool>,
}

impl SqliteHitStore {
    pub async fn new(database_url: &str, max_connections: u32) -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Single-connection in-memory queue, mostly for tests
    pub async fn in_memory() -> StorageResult<Self> {
        Self::new("sqlite::memory:", 1).await
    }
}

#[async_trait]
impl HitStore for SqliteHitStore {
    async fn init(&self) -> StorageResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hits (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tracking_id TEXT NOT NULL,
                client_id TEXT NOT NULL,
                hit_type TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                session_start INTEGER NOT NULL DEFAULT 0,
                use_https INTEGER NOT NULL DEFAULT 1,
                parameters TEXT NOT NULL,
                custom_dimensions TEXT NOT NULL,
                custom_metrics TEXT NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_hits_tracking_id ON hits(tracking_id, id)")
            .execute(self.pool.as_ref())
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_hits_created_at ON hits(created_at_ms)")
            .execute(self.pool.as_ref())
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS properties (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn append(&self, hit: &Hit) -> StorageResult<i64> {
        let parameters = serde_json::to_string(&hit.parameters)?;
        let custom_dimensions = serde_json::to_string(&hit.custom_dimensions)?;
        let custom_metrics = serde_json::to_string(&hit.custom_metrics)?;

        let result = sqlx::query(
            r#"
            INSERT INTO hits (
                tracking_id, client_id, hit_type, created_at_ms, session_start,
                use_https, parameters, custom_dimensions, custom_metrics
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&hit.tracking_id)
        .bind(&hit.client_id)
        .bind(hit.hit_type.as_str())
        .bind(hit.timestamp.timestamp_millis())
        .bind(hit.session_start)
        .bind(hit.use_https)
        .bind(parameters)
        .bind(custom_dimensions)
        .bind(custom_metrics)
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn pending_trackers(&self) -> StorageResult<Vec<String>> {
        let trackers = sqlx::query_scalar::<_, String>(
            r#"
            SELECT tracking_id
            FROM hits
            GROUP BY tracking_id
            ORDER BY MIN(created_at_ms), MIN(id)
            "#,
        )
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(trackers)
    }

    async fn oldest(&self, tracking_id: &str, limit: usize) -> StorageResult<PendingPage> {
        let mut page = PendingPage::default();

        loop {
            let rows = sqlx::query_as::<_, HitRow>(
                r#"
                SELECT id, tracking_id, client_id, hit_type, created_at_ms, session_start,
                       use_https, parameters, custom_dimensions, custom_metrics
                FROM hits
                WHERE tracking_id = ?
                ORDER BY id ASC
                LIMIT ?
                "#,
            )
            .bind(tracking_id)
            .bind(limit as i64)
            .fetch_all(self.pool.as_ref())
            .await?;

            let mut corrupt = Vec::new();
            for row in rows {
                match row.decode() {
                    Ok(hit) => page.hits.push(hit),
                    Err(StorageError::Corrupt { id, reason }) => {
                        warn!("Dropping unreadable queued hit {}: {}", id, reason);
                        corrupt.push(id);
                    }
                    Err(e) => return Err(e),
                }
            }

            if corrupt.is_empty() {
                return Ok(page);
            }
            page.dropped += self.remove(&corrupt).await?;

            // A page made only of unreadable rows says nothing about the rows behind it
            if !page.hits.is_empty() {
                return Ok(page);
            }
        }
    }

    async fn remove(&self, ids: &[i64]) -> StorageResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM hits WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = builder.build().execute(self.pool.as_ref()).await?;
        Ok(result.rows_affected())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM hits WHERE created_at_ms < ?")
            .bind(cutoff.timestamp_millis())
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected())
    }

    async fn count(&self, tracking_id: Option<&str>) -> StorageResult<u64> {
        let count = match tracking_id {
            Some(tid) => {
                sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM hits WHERE tracking_id = ?")
                    .bind(tid)
                    .fetch_one(self.pool.as_ref())
                    .await?
            }
            None => {
                sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM hits")
                    .fetch_one(self.pool.as_ref())
                    .await?
            }
        };

        Ok(count.max(0) as u64)
    }

    async fn property(&self, key: &str) -> StorageResult<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM properties WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool.as_ref())
            .await?;

        Ok(value)
    }

    async fn set_property(&self, key: &str, value: &str) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO properties (key, value)
            VALUES (?, ?)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Param;
    use chrono::Duration;
    use std::collections::BTreeMap;

    async fn setup_sqlite() -> SqliteHitStore {
        let store = SqliteHitStore::in_memory().await.unwrap();
        store.init().await.unwrap();
        store
    }

    fn view(tracking_id: &str, screen: &str, timestamp: DateTime<Utc>) -> Hit {
        let mut parameters = BTreeMap::new();
        parameters.insert(Param::ScreenName, screen.to_string());
        let mut custom_dimensions = BTreeMap::new();
        custom_dimensions.insert(3, "gold".to_string());
        let mut custom_metrics = BTreeMap::new();
        custom_metrics.insert(1, -42);
        Hit {
            tracking_id: tracking_id.to_string(),
            client_id: "cid-1".to_string(),
            hit_type: HitType::AppView,
            timestamp,
            session_start: true,
            use_https: false,
            parameters,
            custom_dimensions,
            custom_metrics,
        }
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let store = setup_sqlite().await;
        let now = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let hit = view("UA-1-1", "Home", now);

        let id = store.append(&hit).await.unwrap();
        let pending = store.oldest("UA-1-1", 10).await.unwrap().hits;

        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].hit, hit);
    }

    #[tokio::test]
    async fn test_fifo_per_tracker() {
        let store = setup_sqlite().await;
        let now = Utc::now();
        for i in 0..5 {
            store
                .append(&view("UA-1-1", &format!("S{i}"), now))
                .await
                .unwrap();
        }

        let pending = store.oldest("UA-1-1", 3).await.unwrap().hits;
        let screens: Vec<_> = pending
            .iter()
            .map(|q| q.hit.param(Param::ScreenName).unwrap().to_string())
            .collect();
        assert_eq!(screens, vec!["S0", "S1", "S2"]);
    }

    #[tokio::test]
    async fn test_pending_trackers_by_oldest_hit() {
        let store = setup_sqlite().await;
        let now = Utc::now();
        store.append(&view("UA-2-1", "B", now)).await.unwrap();
        store
            .append(&view("UA-1-1", "A", now - Duration::seconds(5)))
            .await
            .unwrap();

        let trackers = store.pending_trackers().await.unwrap();
        assert_eq!(trackers, vec!["UA-1-1".to_string(), "UA-2-1".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_and_count() {
        let store = setup_sqlite().await;
        let now = Utc::now();
        let a = store.append(&view("UA-1-1", "A", now)).await.unwrap();
        let _b = store.append(&view("UA-1-1", "B", now)).await.unwrap();
        store.append(&view("UA-2-1", "C", now)).await.unwrap();

        assert_eq!(store.count(None).await.unwrap(), 3);
        assert_eq!(store.remove(&[a]).await.unwrap(), 1);
        assert_eq!(store.remove(&[]).await.unwrap(), 0);
        assert_eq!(store.count(Some("UA-1-1")).await.unwrap(), 1);
        assert_eq!(store.count(None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_purge_older_than() {
        let store = setup_sqlite().await;
        let now = Utc::now();
        store
            .append(&view("UA-1-1", "old", now - Duration::hours(5)))
            .await
            .unwrap();
        store.append(&view("UA-1-1", "new", now)).await.unwrap();

        let purged = store
            .purge_older_than(now - Duration::hours(4))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.count(None).await.unwrap(), 1);
    }

    async fn insert_corrupt(store: &SqliteHitStore, tracking_id: &str) {
        sqlx::query(
            r#"
            INSERT INTO hits (tracking_id, client_id, hit_type, created_at_ms, parameters,
                              custom_dimensions, custom_metrics)
            VALUES (?, 'cid', 'appview', 0, 'not json', '{}', '{}')
            "#,
        )
        .bind(tracking_id)
        .execute(store.pool.as_ref())
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_rows_are_skipped() {
        let store = setup_sqlite().await;
        let now = Utc::now();
        store.append(&view("UA-1-1", "A", now)).await.unwrap();
        insert_corrupt(&store, "UA-1-1").await;

        let page = store.oldest("UA-1-1", 10).await.unwrap();
        assert_eq!(page.hits.len(), 1);
        assert_eq!(page.dropped, 1);
        assert_eq!(store.count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reading_continues_past_a_fully_corrupt_page() {
        let store = setup_sqlite().await;
        for _ in 0..3 {
            insert_corrupt(&store, "UA-1-1").await;
        }
        store.append(&view("UA-1-1", "After", Utc::now())).await.unwrap();

        let page = store.oldest("UA-1-1", 2).await.unwrap();
        assert_eq!(page.dropped, 3);
        assert_eq!(page.hits.len(), 1);
        assert_eq!(page.hits[0].hit.param(Param::ScreenName), Some("After"));

        let empty = store.oldest("UA-1-1", 2).await.unwrap();
        assert!(empty.hits.is_empty());
        assert_eq!(empty.dropped, 0);
    }

    #[tokio::test]
    async fn test_properties_upsert() {
        let store = setup_sqlite().await;
        assert_eq!(store.property("client_id").await.unwrap(), None);
        store.set_property("client_id", "a").await.unwrap();
        store.set_property("client_id", "b").await.unwrap();
        assert_eq!(
            store.property("client_id").await.unwrap(),
            Some("b".to_string())
        );
    }
}
