//! Balance Calculator — current balance = latest snapshot + operations
//! since, with a one-hour cache on top (§4.5).

use crate::cache::CacheCoordinator;
use crate::db::Db;
use crate::error::InventoryError;
use crate::{operations, snapshot};
use anyhow::Context;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BalanceKey {
    pub user_id: Uuid,
    pub section_id: Uuid,
    pub item_id: Uuid,
    pub collection_id: Uuid,
    pub quality_level_id: Uuid,
}

impl BalanceKey {
    pub fn cache_key(&self) -> String {
        format!(
            "inventory:{}:{}:{}:{}:{}",
            self.user_id, self.section_id, self.item_id, self.collection_id, self.quality_level_id
        )
    }
}

pub struct BalanceCalculator {
    db: Db,
    cache: Arc<CacheCoordinator>,
}

impl BalanceCalculator {
    pub fn new(db: Db, cache: Arc<CacheCoordinator>) -> Self {
        Self { db, cache }
    }

    pub async fn current_balance(&self, key: BalanceKey) -> Result<i64, InventoryError> {
        let cache_key = key.cache_key();
        if let Some(cached) = self.cache.get_balance(&cache_key) {
            return Ok(cached);
        }

        let conn = self.db.conn.lock().await;
        let today = Utc::now().date_naive();
        let yesterday = today - ChronoDuration::days(1);

        let base_row = snapshot::latest_before_or_on(
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

        let (base, since_exclusive) = match base_row {
            Some(row) => (
                row.quantity,
                row.balance_date
                    .and_hms_opt(23, 59, 59)
                    .unwrap()
                    .and_utc()
                    .to_rfc3339(),
            ),
            None => {
                // Lazily materialize yesterday's snapshot so future reads
                // stay O(|today's ops|) rather than rescanning all history.
                let created = snapshot::get_or_create(
                    &conn,
                    key.user_id,
                    key.section_id,
                    key.item_id,
                    key.collection_id,
                    key.quality_level_id,
                    yesterday,
                )?;
                (
                    created.quantity,
                    created
                        .balance_date
                        .and_hms_opt(23, 59, 59)
                        .unwrap()
                        .and_utc()
                        .to_rfc3339(),
                )
            }
        };

        let delta = operations::since_snapshot(
            &conn,
            key.user_id,
            key.section_id,
            key.item_id,
            key.collection_id,
            key.quality_level_id,
            &since_exclusive,
            None,
        )
        .context("summing operations since snapshot")
        .map_err(InventoryError::Internal)?;

        let result = base + delta;
        drop(conn);

        self.cache.put_balance(cache_key, result);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use std::time::Duration;

    #[tokio::test]
    async fn balance_with_no_history_is_zero() {
        let db = Db::open_in_memory().unwrap();
        let cache = Arc::new(CacheCoordinator::new(Duration::from_secs(3600)));
        let calc = BalanceCalculator::new(db, cache);
        let key = BalanceKey {
            user_id: Uuid::new_v4(),
            section_id: Uuid::new_v4(),
            item_id: Uuid::new_v4(),
            collection_id: Uuid::new_v4(),
            quality_level_id: Uuid::new_v4(),
        };
        assert_eq!(calc.current_balance(key).await.unwrap(), 0);
    }
}
