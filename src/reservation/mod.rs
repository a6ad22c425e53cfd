//! Reservation Engine — atomic transfer between `main` and `factory`
//! sections with no-oversell, no-double-reserve, and idempotent finalize
//! semantics (§4.6). This is the component that carries the bulk of the
//! system's correctness obligations.

use crate::cache::CacheCoordinator;
use crate::classifier::ClassifierRegistry;
use crate::codes;
use crate::db::Db;
use crate::error::{InventoryError, MissingItem};
use crate::operations::{self, NewOperation};
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ReserveItem {
    pub item_id: Uuid,
    pub collection_code: Option<String>,
    pub quality_code: Option<String>,
    pub quantity: i64,
}

#[derive(Debug, Clone)]
struct ResolvedItem {
    item_id: Uuid,
    collection_id: Uuid,
    quality_level_id: Uuid,
    quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationStatus {
    NotFound,
    Active,
    Returned,
    Consumed,
}

#[derive(Debug, Clone)]
pub struct ReservationStatusReport {
    pub status: ReservationStatus,
    pub user_id: Option<Uuid>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub items: Vec<(Uuid, Uuid, Uuid, i64)>,
}

pub struct ReservationEngine {
    db: Db,
    classifiers: Arc<ClassifierRegistry>,
    cache: Arc<CacheCoordinator>,
}

impl ReservationEngine {
    pub fn new(db: Db, classifiers: Arc<ClassifierRegistry>, cache: Arc<CacheCoordinator>) -> Self {
        Self {
            db,
            classifiers,
            cache,
        }
    }

    pub async fn reserve(
        &self,
        user_id: Uuid,
        operation_id: Uuid,
        items: Vec<ReserveItem>,
    ) -> Result<Vec<Uuid>, InventoryError> {
        if items.is_empty() {
            return Err(InventoryError::Validation("items list is empty".into()));
        }
        for item in &items {
            if item.quantity <= 0 {
                return Err(InventoryError::Validation(
                    "quantity must be positive".into(),
                ));
            }
        }

        // Resolve every classifier reference before taking the connection
        // lock below: classifier resolution is itself async and, on a cache
        // miss, locks this same connection to refresh — holding the lock
        // across that call would deadlock the single-connection mutex.
        let main_id = self
            .classifiers
            .resolve(codes::CLASSIFIER_SECTION, Some(codes::SECTION_MAIN))
            .await?;
        let factory_id = self
            .classifiers
            .resolve(codes::CLASSIFIER_SECTION, Some(codes::SECTION_FACTORY))
            .await?;
        let reservation_type_id = self
            .classifiers
            .resolve(
                codes::CLASSIFIER_OPERATION_TYPE,
                Some(codes::OP_FACTORY_RESERVATION),
            )
            .await?;

        let mut resolved = Vec::with_capacity(items.len());
        for item in &items {
            let collection_id = self
                .resolve_item_collection(item.item_id, item.collection_code.as_deref())
                .await?;
            let quality_level_id = self
                .resolve_item_quality(item.item_id, item.quality_code.as_deref())
                .await?;
            resolved.push(ResolvedItem {
                item_id: item.item_id,
                collection_id,
                quality_level_id,
                quantity: item.quantity,
            });
        }

        // Deterministic lock order — kept for portability to a real
        // multi-connection/row-locking deployment even though the shared
        // connection mutex already rules out lock-cycle deadlocks here.
        resolved.sort_by_key(|r| (r.item_id, r.collection_id, r.quality_level_id));

        // Idempotency check, balance check, and insert all happen under one
        // uninterrupted lock so a concurrent replay of the same
        // operation_id cannot race past the existence check.
        let conn = self.db.conn.lock().await;

        let existing = operations::by_external_id(&conn, operation_id)
            .context("checking for existing reservation")
            .map_err(InventoryError::Internal)?;
        if !existing.is_empty() {
            return Ok(existing.into_iter().map(|op| op.id).collect());
        }

        let today = Utc::now().date_naive();
        let mut missing = Vec::new();
        for item in &resolved {
            let available = self
                .read_main_balance(&conn, user_id, main_id, item.item_id, item.collection_id, item.quality_level_id, today)
                .map_err(InventoryError::Internal)?;
            if available < item.quantity {
                missing.push(MissingItem {
                    item_id: item.item_id,
                    collection_id: Some(item.collection_id),
                    quality_level_id: Some(item.quality_level_id),
                    required: item.quantity,
                    available,
                });
            }
        }

        if !missing.is_empty() {
            return Err(InventoryError::InsufficientBalance(missing));
        }

        let mut batch = Vec::with_capacity(resolved.len() * 2);
        for item in &resolved {
            batch.push(NewOperation {
                user_id,
                section_id: main_id,
                item_id: item.item_id,
                collection_id: item.collection_id,
                quality_level_id: item.quality_level_id,
                quantity_change: -item.quantity,
                operation_type_id: reservation_type_id,
                operation_id: Some(operation_id),
                recipe_id: None,
                comment: None,
            });
            batch.push(NewOperation {
                user_id,
                section_id: factory_id,
                item_id: item.item_id,
                collection_id: item.collection_id,
                quality_level_id: item.quality_level_id,
                quantity_change: item.quantity,
                operation_type_id: reservation_type_id,
                operation_id: Some(operation_id),
                recipe_id: None,
                comment: None,
            });
        }

        let ids = operations::create_batch(&conn, &batch)
            .context("inserting reservation operations")
            .map_err(|err| self.trigger_to_domain_error(err))?;

        drop(conn);
        self.cache.invalidate_user(user_id);
        Ok(ids)
    }

    pub async fn return_reservation(
        &self,
        operation_id: Uuid,
        caller_user_id: Uuid,
    ) -> Result<Vec<Uuid>, InventoryError> {
        let reservation_type_id = self
            .classifiers
            .resolve(
                codes::CLASSIFIER_OPERATION_TYPE,
                Some(codes::OP_FACTORY_RESERVATION),
            )
            .await?;
        let return_type_id = self
            .classifiers
            .resolve(codes::CLASSIFIER_OPERATION_TYPE, Some(codes::OP_FACTORY_RETURN))
            .await?;

        let conn = self.db.conn.lock().await;
        let existing = operations::by_external_id(&conn, operation_id)
            .context("loading reservation")
            .map_err(InventoryError::Internal)?;

        if existing.is_empty() || existing[0].user_id != caller_user_id {
            // Same response whether the reservation doesn't exist or belongs
            // to another user, so a caller can't probe for other users'
            // operation ids.
            return Err(InventoryError::ReservationNotFound(operation_id));
        }

        if existing
            .iter()
            .any(|op| op.operation_type_id != reservation_type_id)
        {
            return Err(InventoryError::ReservationAlreadyFinalized(operation_id));
        }

        let user_id = existing[0].user_id;
        let batch: Vec<NewOperation> = existing
            .iter()
            .map(|op| NewOperation {
                user_id: op.user_id,
                section_id: op.section_id,
                item_id: op.item_id,
                collection_id: op.collection_id,
                quality_level_id: op.quality_level_id,
                quantity_change: -op.quantity_change,
                operation_type_id: return_type_id,
                operation_id: Some(operation_id),
                recipe_id: None,
                comment: None,
            })
            .collect();

        let ids = operations::create_batch(&conn, &batch)
            .context("inserting return operations")
            .map_err(InventoryError::Internal)?;

        drop(conn);
        self.cache.invalidate_user(user_id);
        Ok(ids)
    }

    pub async fn consume_reservation(
        &self,
        operation_id: Uuid,
        caller_user_id: Uuid,
    ) -> Result<Vec<Uuid>, InventoryError> {
        let reservation_type_id = self
            .classifiers
            .resolve(
                codes::CLASSIFIER_OPERATION_TYPE,
                Some(codes::OP_FACTORY_RESERVATION),
            )
            .await?;
        let factory_id = self
            .classifiers
            .resolve(codes::CLASSIFIER_SECTION, Some(codes::SECTION_FACTORY))
            .await?;
        let consumption_type_id = self
            .classifiers
            .resolve(
                codes::CLASSIFIER_OPERATION_TYPE,
                Some(codes::OP_FACTORY_CONSUMPTION),
            )
            .await?;

        let conn = self.db.conn.lock().await;
        let existing = operations::by_external_id(&conn, operation_id)
            .context("loading reservation")
            .map_err(InventoryError::Internal)?;

        if existing.is_empty() || existing[0].user_id != caller_user_id {
            return Err(InventoryError::ReservationNotFound(operation_id));
        }
        if existing
            .iter()
            .any(|op| op.operation_type_id != reservation_type_id)
        {
            return Err(InventoryError::ReservationAlreadyFinalized(operation_id));
        }

        let user_id = existing[0].user_id;
        // §4.3 convention: a single balance-move row per reserved triple,
        // no zero-change audit rows.
        let batch: Vec<NewOperation> = existing
            .iter()
            .filter(|op| op.section_id == factory_id)
            .map(|op| NewOperation {
                user_id: op.user_id,
                section_id: factory_id,
                item_id: op.item_id,
                collection_id: op.collection_id,
                quality_level_id: op.quality_level_id,
                quantity_change: -op.quantity_change,
                operation_type_id: consumption_type_id,
                operation_id: Some(operation_id),
                recipe_id: None,
                comment: None,
            })
            .collect();

        let ids = operations::create_batch(&conn, &batch)
            .context("inserting consumption operation")
            .map_err(InventoryError::Internal)?;

        drop(conn);
        self.cache.invalidate_user(user_id);
        Ok(ids)
    }

    pub async fn reservation_status(
        &self,
        operation_id: Uuid,
    ) -> Result<ReservationStatusReport, InventoryError> {
        let conn = self.db.conn.lock().await;
        let existing = operations::by_external_id(&conn, operation_id)
            .context("loading reservation")
            .map_err(InventoryError::Internal)?;
        drop(conn);

        if existing.is_empty() {
            return Ok(ReservationStatusReport {
                status: ReservationStatus::NotFound,
                user_id: None,
                reserved_at: None,
                items: vec![],
            });
        }

        let consumption_type_id = self
            .classifiers
            .resolve(
                codes::CLASSIFIER_OPERATION_TYPE,
                Some(codes::OP_FACTORY_CONSUMPTION),
            )
            .await?;
        let return_type_id = self
            .classifiers
            .resolve(codes::CLASSIFIER_OPERATION_TYPE, Some(codes::OP_FACTORY_RETURN))
            .await?;
        let reservation_type_id = self
            .classifiers
            .resolve(
                codes::CLASSIFIER_OPERATION_TYPE,
                Some(codes::OP_FACTORY_RESERVATION),
            )
            .await?;
        let factory_id = self
            .classifiers
            .resolve(codes::CLASSIFIER_SECTION, Some(codes::SECTION_FACTORY))
            .await?;

        let status = if existing.iter().any(|op| op.operation_type_id == consumption_type_id) {
            ReservationStatus::Consumed
        } else if existing.iter().any(|op| op.operation_type_id == return_type_id) {
            ReservationStatus::Returned
        } else {
            ReservationStatus::Active
        };

        let reserved_at = existing
            .iter()
            .filter(|op| op.operation_type_id == reservation_type_id)
            .map(|op| op.created_at)
            .min();

        let mut items = Vec::new();
        for op in existing
            .iter()
            .filter(|op| op.operation_type_id == reservation_type_id && op.section_id == factory_id)
        {
            items.push((op.item_id, op.collection_id, op.quality_level_id, op.quantity_change));
        }

        Ok(ReservationStatusReport {
            status,
            user_id: Some(existing[0].user_id),
            reserved_at,
            items,
        })
    }

    async fn resolve_item_collection(
        &self,
        item_id: Uuid,
        code: Option<&str>,
    ) -> Result<Uuid, InventoryError> {
        let classifier_code = self.item_collections_classifier(item_id).await?;
        self.classifiers.resolve(&classifier_code, code).await
    }

    async fn resolve_item_quality(
        &self,
        item_id: Uuid,
        code: Option<&str>,
    ) -> Result<Uuid, InventoryError> {
        let classifier_code = self.item_quality_classifier(item_id).await?;
        self.classifiers.resolve(&classifier_code, code).await
    }

    async fn item_collections_classifier(&self, item_id: Uuid) -> Result<String, InventoryError> {
        let conn = self.db.conn.lock().await;
        conn.query_row(
            "SELECT c.code FROM items i JOIN classifiers c ON c.id = i.collections_classifier_id
             WHERE i.id = ?1",
            [item_id.to_string()],
            |row| row.get(0),
        )
        .context("loading item's collections classifier")
        .map_err(InventoryError::Internal)
    }

    async fn item_quality_classifier(&self, item_id: Uuid) -> Result<String, InventoryError> {
        let conn = self.db.conn.lock().await;
        conn.query_row(
            "SELECT c.code FROM items i JOIN classifiers c ON c.id = i.quality_levels_classifier_id
             WHERE i.id = ?1",
            [item_id.to_string()],
            |row| row.get(0),
        )
        .context("loading item's quality classifier")
        .map_err(InventoryError::Internal)
    }

    fn read_main_balance(
        &self,
        conn: &rusqlite::Connection,
        user_id: Uuid,
        section_id: Uuid,
        item_id: Uuid,
        collection_id: Uuid,
        quality_level_id: Uuid,
        today: chrono::NaiveDate,
    ) -> anyhow::Result<i64> {
        let yesterday = today - chrono::Duration::days(1);
        let base_row = crate::snapshot::latest_before_or_on(
            conn, user_id, section_id, item_id, collection_id, quality_level_id, yesterday,
        )?;
        let (base, since) = match base_row {
            Some(row) => (
                row.quantity,
                row.balance_date.and_hms_opt(23, 59, 59).unwrap().and_utc().to_rfc3339(),
            ),
            None => (0, "0000-00-00T00:00:00+00:00".to_string()),
        };
        let delta = operations::since_snapshot(
            conn, user_id, section_id, item_id, collection_id, quality_level_id, &since, None,
        )?;
        Ok(base + delta)
    }

    fn trigger_to_domain_error(&self, err: anyhow::Error) -> InventoryError {
        if err.to_string().contains("insufficient_balance") {
            InventoryError::InsufficientBalance(vec![])
        } else {
            InventoryError::Internal(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reserve_rejects_empty_items() {
        let db = Db::open_in_memory().unwrap();
        let classifiers = Arc::new(ClassifierRegistry::new(db.clone(), std::time::Duration::from_secs(60)));
        let cache = Arc::new(CacheCoordinator::new(std::time::Duration::from_secs(60)));
        let engine = ReservationEngine::new(db, classifiers, cache);

        let result = engine.reserve(Uuid::new_v4(), Uuid::new_v4(), vec![]).await;
        assert!(matches!(result, Err(InventoryError::Validation(_))));
    }

    #[tokio::test]
    async fn reserve_rejects_non_positive_quantity() {
        let db = Db::open_in_memory().unwrap();
        let classifiers = Arc::new(ClassifierRegistry::new(db.clone(), std::time::Duration::from_secs(60)));
        let cache = Arc::new(CacheCoordinator::new(std::time::Duration::from_secs(60)));
        let engine = ReservationEngine::new(db, classifiers, cache);

        let items = vec![ReserveItem {
            item_id: Uuid::new_v4(),
            collection_code: None,
            quality_code: None,
            quantity: 0,
        }];
        let result = engine.reserve(Uuid::new_v4(), Uuid::new_v4(), items).await;
        assert!(matches!(result, Err(InventoryError::Validation(_))));
    }

    #[tokio::test]
    async fn status_of_unknown_reservation_is_not_found() {
        let db = Db::open_in_memory().unwrap();
        let classifiers = Arc::new(ClassifierRegistry::new(db.clone(), std::time::Duration::from_secs(60)));
        let cache = Arc::new(CacheCoordinator::new(std::time::Duration::from_secs(60)));
        let engine = ReservationEngine::new(db, classifiers, cache);

        let report = engine.reservation_status(Uuid::new_v4()).await.unwrap();
        assert_eq!(report.status, ReservationStatus::NotFound);
    }
}
