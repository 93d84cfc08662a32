//! libSQL storage layer (local, offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding the build registry
//! and the model response cache. Per-build progress lives in the build's own
//! `state.json`; the registry only indexes builds for `skillfactory list`.

mod migrations;

use std::path::Path;

use chrono::{DateTime, TimeDelta, Utc};
use libsql::{Connection, Database, params};
use skillfactory_shared::{BuildRecord, BuildStatus, Result, SkillFactoryError};

/// Cached model responses older than this are treated as misses.
pub const DEFAULT_CACHE_TTL_HOURS: u64 = 168;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
    cache_ttl: TimeDelta,
}

/// A cached model response.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SkillFactoryError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| SkillFactoryError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| SkillFactoryError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
            cache_ttl: ttl_from_hours(DEFAULT_CACHE_TTL_HOURS),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (for `status`/`list`).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| SkillFactoryError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| SkillFactoryError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
            cache_ttl: ttl_from_hours(DEFAULT_CACHE_TTL_HOURS),
        })
    }

    /// Set how long cached model responses stay valid.
    pub fn with_cache_ttl_hours(mut self, hours: u64) -> Self {
        self.cache_ttl = ttl_from_hours(hours);
        self
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        SkillFactoryError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(SkillFactoryError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Build registry
    // -----------------------------------------------------------------------

    /// Insert or refresh a build record (keyed by id).
    pub async fn upsert_build(&self, build: &BuildRecord) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO builds (id, name, domain, output_dir, status, quality_score, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                   name = excluded.name,
                   domain = excluded.domain,
                   output_dir = excluded.output_dir,
                   status = excluded.status,
                   quality_score = excluded.quality_score,
                   updated_at = excluded.updated_at",
                params![
                    build.id.as_str(),
                    build.name.as_str(),
                    build.domain.as_str(),
                    build.output_dir.as_str(),
                    build.status.as_str(),
                    build.quality_score,
                    build.created_at.to_rfc3339(),
                    build.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| SkillFactoryError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Update a build's status and, when known, its final quality score.
    pub async fn update_build_status(
        &self,
        id: &str,
        status: BuildStatus,
        quality_score: Option<f64>,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE builds SET status = ?1, quality_score = COALESCE(?2, quality_score), updated_at = ?3
                 WHERE id = ?4",
                params![status.as_str(), quality_score, now.as_str(), id],
            )
            .await
            .map_err(|e| SkillFactoryError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Get a build by id.
    pub async fn get_build(&self, id: &str) -> Result<Option<BuildRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, domain, output_dir, status, quality_score, created_at, updated_at
                 FROM builds WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| SkillFactoryError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_build(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(SkillFactoryError::Storage(e.to_string())),
        }
    }

    /// List all builds, newest first.
    pub async fn list_builds(&self) -> Result<Vec<BuildRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, domain, output_dir, status, quality_score, created_at, updated_at
                 FROM builds ORDER BY created_at DESC",
                params![],
            )
            .await
            .map_err(|e| SkillFactoryError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_build(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Model response cache
    // -----------------------------------------------------------------------

    /// Look up a cached response by request hash and model. Entries older
    /// than the cache TTL are misses.
    pub async fn get_cached_response(
        &self,
        key: &str,
        model_id: &str,
    ) -> Result<Option<CachedResponse>> {
        let mut rows = self
            .conn
            .query(
                "SELECT response, input_tokens, output_tokens, created_at FROM model_cache
                 WHERE key = ?1 AND model_id = ?2",
                params![key, model_id],
            )
            .await
            .map_err(|e| SkillFactoryError::Storage(e.to_string()))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) => return Err(SkillFactoryError::Storage(e.to_string())),
        };
        let created_at: String = row
            .get(3)
            .map_err(|e| SkillFactoryError::Storage(e.to_string()))?;
        if parse_timestamp(&created_at)? < self.cache_cutoff() {
            tracing::debug!(model_id, "cached response expired");
            return Ok(None);
        }
        Ok(Some(CachedResponse {
            text: row
                .get::<String>(0)
                .map_err(|e| SkillFactoryError::Storage(e.to_string()))?,
            input_tokens: row.get::<i64>(1).unwrap_or(0).max(0) as u64,
            output_tokens: row.get::<i64>(2).unwrap_or(0).max(0) as u64,
        }))
    }

    /// Store a response in the cache (upserts).
    pub async fn set_cached_response(
        &self,
        key: &str,
        model_id: &str,
        response: &CachedResponse,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO model_cache (key, model_id, response, input_tokens, output_tokens, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(key, model_id) DO UPDATE SET
                   response = excluded.response,
                   input_tokens = excluded.input_tokens,
                   output_tokens = excluded.output_tokens,
                   created_at = excluded.created_at",
                params![
                    key,
                    model_id,
                    response.text.as_str(),
                    response.input_tokens as i64,
                    response.output_tokens as i64,
                    now.as_str()
                ],
            )
            .await
            .map_err(|e| SkillFactoryError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Drop cached responses older than the cache TTL. Returns the number
    /// of rows removed.
    pub async fn prune_cache(&self) -> Result<u64> {
        self.check_writable()?;
        let cutoff = self.cache_cutoff().to_rfc3339();
        self.conn
            .execute(
                "DELETE FROM model_cache WHERE created_at < ?1",
                params![cutoff.as_str()],
            )
            .await
            .map_err(|e| SkillFactoryError::Storage(e.to_string()))
    }

    fn cache_cutoff(&self) -> DateTime<Utc> {
        Utc::now() - self.cache_ttl
    }

    /// Drop every cached response. Returns the number of rows removed.
    pub async fn clear_cache(&self) -> Result<u64> {
        self.check_writable()?;
        self.conn
            .execute("DELETE FROM model_cache", params![])
            .await
            .map_err(|e| SkillFactoryError::Storage(e.to_string()))
    }
}

/// Capped at a century so the cutoff arithmetic cannot overflow.
fn ttl_from_hours(hours: u64) -> TimeDelta {
    TimeDelta::try_hours(hours.min(24 * 365 * 100) as i64).unwrap_or_default()
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SkillFactoryError::Storage(format!("invalid date: {e}")))
}

/// Convert a database row to a [`BuildRecord`].
fn row_to_build(row: &libsql::Row) -> Result<BuildRecord> {
    let status: String = row
        .get(4)
        .map_err(|e| SkillFactoryError::Storage(e.to_string()))?;
    let created_at: String = row
        .get(6)
        .map_err(|e| SkillFactoryError::Storage(e.to_string()))?;
    let updated_at: String = row
        .get(7)
        .map_err(|e| SkillFactoryError::Storage(e.to_string()))?;

    Ok(BuildRecord {
        id: row
            .get::<String>(0)
            .map_err(|e| SkillFactoryError::Storage(e.to_string()))?,
        name: row
            .get::<String>(1)
            .map_err(|e| SkillFactoryError::Storage(e.to_string()))?,
        domain: row
            .get::<String>(2)
            .map_err(|e| SkillFactoryError::Storage(e.to_string()))?,
        output_dir: row
            .get::<String>(3)
            .map_err(|e| SkillFactoryError::Storage(e.to_string()))?,
        status: status.parse()?,
        quality_score: row.get::<f64>(5).ok(),
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("sf_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn record(id: &str, status: BuildStatus) -> BuildRecord {
        let now = Utc::now();
        BuildRecord {
            id: id.into(),
            name: "negotiation".into(),
            domain: "sales".into(),
            output_dir: format!("/tmp/{id}"),
            status,
            quality_score: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("sf_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn build_registry_lifecycle() {
        let storage = test_storage().await;
        storage
            .upsert_build(&record("build_a", BuildStatus::Running))
            .await
            .expect("insert build");

        storage
            .update_build_status("build_a", BuildStatus::Paused, None)
            .await
            .expect("pause");
        let found = storage.get_build("build_a").await.unwrap().unwrap();
        assert_eq!(found.status, BuildStatus::Paused);
        assert_eq!(found.quality_score, None);

        storage
            .update_build_status("build_a", BuildStatus::Completed, Some(82.5))
            .await
            .expect("complete");
        let found = storage.get_build("build_a").await.unwrap().unwrap();
        assert_eq!(found.status, BuildStatus::Completed);
        assert_eq!(found.quality_score, Some(82.5));

        storage
            .upsert_build(&record("build_b", BuildStatus::Running))
            .await
            .unwrap();
        assert_eq!(storage.list_builds().await.unwrap().len(), 2);
        assert!(storage.get_build("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn model_cache_roundtrip() {
        let storage = test_storage().await;
        let cached = CachedResponse {
            text: r#"{"topics": []}"#.into(),
            input_tokens: 120,
            output_tokens: 8,
        };

        assert!(
            storage
                .get_cached_response("abc", "claude-sonnet")
                .await
                .unwrap()
                .is_none()
        );
        storage
            .set_cached_response("abc", "claude-sonnet", &cached)
            .await
            .expect("store");
        let hit = storage
            .get_cached_response("abc", "claude-sonnet")
            .await
            .unwrap();
        assert_eq!(hit, Some(cached));

        // Same key under another model is a miss
        assert!(
            storage
                .get_cached_response("abc", "claude-haiku")
                .await
                .unwrap()
                .is_none()
        );

        assert_eq!(storage.clear_cache().await.unwrap(), 1);
        assert!(
            storage
                .get_cached_response("abc", "claude-sonnet")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn expired_cache_entries_miss_and_prune() {
        let storage = test_storage().await.with_cache_ttl_hours(24);
        let cached = CachedResponse {
            text: "fresh".into(),
            input_tokens: 10,
            output_tokens: 2,
        };
        storage
            .set_cached_response("fresh", "claude-sonnet", &cached)
            .await
            .unwrap();
        let stale = (Utc::now() - TimeDelta::try_hours(48).unwrap()).to_rfc3339();
        storage
            .conn
            .execute(
                "INSERT INTO model_cache (key, model_id, response, input_tokens, output_tokens, created_at)
                 VALUES ('stale', 'claude-sonnet', 'old', 1, 1, ?1)",
                params![stale.as_str()],
            )
            .await
            .unwrap();

        assert!(
            storage
                .get_cached_response("stale", "claude-sonnet")
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(
            storage.get_cached_response("fresh", "claude-sonnet").await.unwrap(),
            Some(cached)
        );

        assert_eq!(storage.prune_cache().await.unwrap(), 1);
        assert_eq!(storage.clear_cache().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("sf_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.expect("open rw");
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.expect("open ro");
        let result = ro.upsert_build(&record("build_c", BuildStatus::Running)).await;
        assert!(result.is_err());
        assert!(ro.list_builds().await.unwrap().is_empty());
    }
}
