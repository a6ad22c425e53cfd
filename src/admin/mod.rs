//! Admin Adjustment — privileged signed quantity changes with an audit
//! comment, reusing the Operations Log and Balance Calculator (§4.9).

use crate::balance::{BalanceCalculator, BalanceKey};
use crate::cache::CacheCoordinator;
use crate::classifier::ClassifierRegistry;
use crate::codes;
use crate::db::Db;
use crate::error::{InventoryError, MissingItem};
use crate::operations::{self, NewOperation};
use anyhow::Context;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct AdjustItem {
    pub item_id: Uuid,
    pub collection_code: Option<String>,
    pub quality_code: Option<String>,
    pub quantity_change: i64,
}

#[derive(Debug, Clone)]
pub struct AdjustmentResult {
    pub item_id: Uuid,
    pub new_balance: i64,
}

pub struct AdminAdjustment {
    db: Db,
    classifiers: Arc<ClassifierRegistry>,
    balances: Arc<BalanceCalculator>,
    cache: Arc<CacheCoordinator>,
}

impl AdminAdjustment {
    pub fn new(
        db: Db,
        classifiers: Arc<ClassifierRegistry>,
        balances: Arc<BalanceCalculator>,
        cache: Arc<CacheCoordinator>,
    ) -> Self {
        Self {
            db,
            classifiers,
            balances,
            cache,
        }
    }

    /// Credits `main` with externally-granted items (chest rewards, purchase
    /// fulfillment, ...). Unlike `adjust`, this is caller-idempotent on
    /// `operation_id` rather than operator-audited: the same grant replayed
    /// with the same id returns the original operation ids instead of
    /// crediting twice.
    pub async fn add_items(
        &self,
        user_id: Uuid,
        operation_id: Uuid,
        items: Vec<AdjustItem>,
    ) -> Result<Vec<Uuid>, InventoryError> {
        if items.is_empty() {
            return Err(InventoryError::Validation("items list is empty".into()));
        }
        for item in &items {
            if item.quantity_change <= 0 {
                return Err(InventoryError::Validation(
                    "add-items quantity must be positive".into(),
                ));
            }
        }

        let main_id = self
            .classifiers
            .resolve(codes::CLASSIFIER_SECTION, Some(codes::SECTION_MAIN))
            .await?;
        let chest_reward_id = self
            .classifiers
            .resolve(codes::CLASSIFIER_OPERATION_TYPE, Some(codes::OP_CHEST_REWARD))
            .await?;

        let mut batch = Vec::with_capacity(items.len());
        for item in &items {
            let collections_classifier = self.item_collections_classifier(item.item_id).await?;
            let quality_classifier = self.item_quality_classifier(item.item_id).await?;
            let collection_id = self
                .classifiers
                .resolve(&collections_classifier, item.collection_code.as_deref())
                .await?;
            let quality_level_id = self
                .classifiers
                .resolve(&quality_classifier, item.quality_code.as_deref())
                .await?;

            batch.push(NewOperation {
                user_id,
                section_id: main_id,
                item_id: item.item_id,
                collection_id,
                quality_level_id,
                quantity_change: item.quantity_change,
                operation_type_id: chest_reward_id,
                operation_id: Some(operation_id),
                recipe_id: None,
                comment: None,
            });
        }

        let ids = {
            let conn = self.db.conn.lock().await;
            let existing = operations::by_external_id(&conn, operation_id)
                .context("checking for existing add-items grant")
                .map_err(InventoryError::Internal)?;
            if !existing.is_empty() {
                return Ok(existing.into_iter().map(|op| op.id).collect());
            }

            operations::create_batch(&conn, &batch)
                .context("inserting add-items operations")
                .map_err(InventoryError::Internal)?
        };

        self.cache.invalidate_user(user_id);
        Ok(ids)
    }

    pub async fn adjust(
        &self,
        user_id: Uuid,
        section_code: &str,
        items: Vec<AdjustItem>,
        reason: String,
    ) -> Result<Vec<AdjustmentResult>, InventoryError> {
        if items.is_empty() {
            return Err(InventoryError::Validation("items list is empty".into()));
        }

        let section_id = self
            .classifiers
            .resolve(codes::CLASSIFIER_SECTION, Some(section_code))
            .await?;
        let adjustment_type_id = self
            .classifiers
            .resolve(
                codes::CLASSIFIER_OPERATION_TYPE,
                Some(codes::OP_ADMIN_ADJUSTMENT),
            )
            .await?;

        let operation_id = Uuid::new_v4();
        let mut batch = Vec::with_capacity(items.len());
        let mut keys = Vec::with_capacity(items.len());

        for item in &items {
            let collections_classifier = self.item_collections_classifier(item.item_id).await?;
            let quality_classifier = self.item_quality_classifier(item.item_id).await?;
            let collection_id = self
                .classifiers
                .resolve(&collections_classifier, item.collection_code.as_deref())
                .await?;
            let quality_level_id = self
                .classifiers
                .resolve(&quality_classifier, item.quality_code.as_deref())
                .await?;

            batch.push(NewOperation {
                user_id,
                section_id,
                item_id: item.item_id,
                collection_id,
                quality_level_id,
                quantity_change: item.quantity_change,
                operation_type_id: adjustment_type_id,
                operation_id: Some(operation_id),
                recipe_id: None,
                comment: Some(reason.clone()),
            });
            keys.push(BalanceKey {
                user_id,
                section_id,
                item_id: item.item_id,
                collection_id,
                quality_level_id,
            });
        }

        {
            let conn = self.db.conn.lock().await;

            // Same validation chain reserve uses for negative main-section
            // changes: pre-check via the snapshot+since-ops window, relying
            // on the database trigger as defense in depth.
            let mut missing = Vec::new();
            for (item, key) in items.iter().zip(&keys) {
                if item.quantity_change < 0 {
                    let today = chrono::Utc::now().date_naive();
                    let yesterday = today - chrono::Duration::days(1);
                    let base_row = crate::snapshot::latest_before_or_on(
                        &conn,
                        key.user_id,
                        key.section_id,
                        key.item_id,
                        key.collection_id,
                        key.quality_level_id,
                        yesterday,
                    )
                    .context("loading base snapshot")
                    .map_err(InventoryError::Internal)?;
                    let (base, since) = match base_row {
                        Some(row) => (
                            row.quantity,
                            row.balance_date
                                .and_hms_opt(23, 59, 59)
                                .unwrap()
                                .and_utc()
                                .to_rfc3339(),
                        ),
                        None => (0, "0000-00-00T00:00:00+00:00".to_string()),
                    };
                    let delta = operations::since_snapshot(
                        &conn,
                        key.user_id,
                        key.section_id,
                        key.item_id,
                        key.collection_id,
                        key.quality_level_id,
                        &since,
                        None,
                    )
                    .context("summing operations since snapshot")
                    .map_err(InventoryError::Internal)?;
                    let available = base + delta;
                    if available + item.quantity_change < 0 {
                        missing.push(MissingItem {
                            item_id: item.item_id,
                            collection_id: Some(key.collection_id),
                            quality_level_id: Some(key.quality_level_id),
                            required: -item.quantity_change,
                            available,
                        });
                    }
                }
            }

            if !missing.is_empty() {
                return Err(InventoryError::InsufficientBalance(missing));
            }

            operations::create_batch(&conn, &batch)
                .context("inserting admin adjustment operations")
                .map_err(|err| {
                    if err.to_string().contains("insufficient_balance") {
                        InventoryError::InsufficientBalance(vec![])
                    } else {
                        InventoryError::Internal(err)
                    }
                })?;
        }

        self.cache.invalidate_user(user_id);

        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            let new_balance = self.balances.current_balance(key).await?;
            results.push(AdjustmentResult {
                item_id: key.item_id,
                new_balance,
            });
        }
        Ok(results)
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn adjust_rejects_empty_items() {
        let db = Db::open_in_memory().unwrap();
        let classifiers = Arc::new(ClassifierRegistry::new(db.clone(), std::time::Duration::from_secs(60)));
        let cache = Arc::new(CacheCoordinator::new(std::time::Duration::from_secs(60)));
        let balances = Arc::new(BalanceCalculator::new(db.clone(), cache.clone()));
        let admin = AdminAdjustment::new(db, classifiers, balances, cache);

        let result = admin
            .adjust(Uuid::new_v4(), codes::SECTION_MAIN, vec![], "test".into())
            .await;
        assert!(matches!(result, Err(InventoryError::Validation(_))));
    }
}
