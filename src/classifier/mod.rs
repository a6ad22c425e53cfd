//! Classifier Registry — canonical code <-> UUID translation for the
//! enum-like reference data (sections, operation types, collections,
//! quality levels, item classes/types, languages).
//!
//! The in-process cache mirrors the dashmap-backed caches used elsewhere in
//! this codebase for hot read paths; entries older than the configured TTL
//! are reloaded synchronously on next access, and an admin edit invalidates
//! a classifier immediately.

use crate::db::Db;
use crate::error::InventoryError;
use anyhow::{Context, Result};
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub const BASE_CODE: &str = "base";

struct CachedClassifier {
    code_to_uuid: HashMap<String, Uuid>,
    uuid_to_code: HashMap<Uuid, String>,
    fetched_at: Instant,
}

pub struct ClassifierRegistry {
    db: Db,
    ttl: Duration,
    cache: DashMap<String, CachedClassifier>,
}

impl ClassifierRegistry {
    pub fn new(db: Db, ttl: Duration) -> Self {
        Self {
            db,
            ttl,
            cache: DashMap::new(),
        }
    }

    pub async fn code_to_uuid(&self, classifier_code: &str) -> Result<HashMap<String, Uuid>> {
        self.ensure_fresh(classifier_code).await?;
        Ok(self
            .cache
            .get(classifier_code)
            .map(|entry| entry.code_to_uuid.clone())
            .unwrap_or_default())
    }

    pub async fn uuid_to_code(&self, classifier_code: &str) -> Result<HashMap<Uuid, String>> {
        self.ensure_fresh(classifier_code).await?;
        Ok(self
            .cache
            .get(classifier_code)
            .map(|entry| entry.uuid_to_code.clone())
            .unwrap_or_default())
    }

    /// Resolves a single code within a classifier, substituting `base` when
    /// `item_code` is `None` (collection/quality defaulting, §4.1).
    pub async fn resolve(
        &self,
        classifier_code: &str,
        item_code: Option<&str>,
    ) -> Result<Uuid, InventoryError> {
        let code = item_code.unwrap_or(BASE_CODE);
        let map = self
            .code_to_uuid(classifier_code)
            .await
            .map_err(InventoryError::Internal)?;

        map.get(code).copied().ok_or_else(|| {
            if code == BASE_CODE {
                InventoryError::MissingBaseClassifier(classifier_code.to_string())
            } else {
                InventoryError::UnknownClassifierCode(code.to_string())
            }
        })
    }

    pub fn invalidate(&self, classifier_code: &str) {
        self.cache.remove(classifier_code);
    }

    async fn ensure_fresh(&self, classifier_code: &str) -> Result<()> {
        let stale = match self.cache.get(classifier_code) {
            Some(entry) => entry.fetched_at.elapsed() > self.ttl,
            None => true,
        };

        if !stale {
            return Ok(());
        }

        let conn = self.db.conn.lock().await;
        let classifier_id: String = conn
            .query_row(
                "SELECT id FROM classifiers WHERE code = ?1",
                [classifier_code],
                |row| row.get(0),
            )
            .with_context(|| format!("loading classifier {classifier_code}"))?;

        let mut stmt = conn
            .prepare("SELECT id, code FROM classifier_items WHERE classifier_id = ?1")
            .context("preparing classifier item query")?;
        let rows = stmt
            .query_map([classifier_id], |row| {
                let id: String = row.get(0)?;
                let code: String = row.get(1)?;
                Ok((id, code))
            })
            .context("loading classifier items")?;

        let mut code_to_uuid = HashMap::new();
        let mut uuid_to_code = HashMap::new();
        for row in rows {
            let (id, code) = row.context("reading classifier item row")?;
            let uuid = Uuid::parse_str(&id).context("parsing classifier item id")?;
            code_to_uuid.insert(code.clone(), uuid);
            uuid_to_code.insert(uuid, code);
        }
        drop(stmt);
        drop(conn);

        self.cache.insert(
            classifier_code.to_string(),
            CachedClassifier {
                code_to_uuid,
                uuid_to_code,
                fetched_at: Instant::now(),
            },
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    async fn seed(db: &Db) -> String {
        let classifier_id = Uuid::new_v4().to_string();
        let conn = db.conn.lock().await;
        conn.execute(
            "INSERT INTO classifiers (id, code) VALUES (?1, 'test_classifier')",
            [&classifier_id],
        )
        .unwrap();
        classifier_id
    }

    #[tokio::test]
    async fn missing_classifier_errors() {
        let db = Db::open_in_memory().unwrap();
        let registry = ClassifierRegistry::new(db, Duration::from_secs(60));
        let result = registry.code_to_uuid("nonexistent").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn resolve_falls_back_to_base() {
        let db = Db::open_in_memory().unwrap();
        let classifier_id = seed(&db).await;
        {
            let conn = db.conn.lock().await;
            conn.execute(
                "INSERT INTO classifier_items (id, classifier_id, code) VALUES (?1, ?2, 'base')",
                rusqlite::params![Uuid::new_v4().to_string(), classifier_id],
            )
            .unwrap();
        }
        let registry = ClassifierRegistry::new(db, Duration::from_secs(60));
        let resolved = registry.resolve("test_classifier", None).await;
        assert!(resolved.is_ok());
    }

    #[tokio::test]
    async fn seeded_sections_resolve() {
        let db = Db::open_in_memory().unwrap();
        let registry = ClassifierRegistry::new(db, Duration::from_secs(60));
        assert!(registry
            .resolve("inventory_section", Some("main"))
            .await
            .is_ok());
        assert!(registry
            .resolve("inventory_section", Some("factory"))
            .await
            .is_ok());
        assert!(registry
            .resolve("operation_type", Some("chest_reward"))
            .await
            .is_ok());
    }
}
