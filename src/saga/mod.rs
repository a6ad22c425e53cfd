//! Saga Orchestrator — couples production-task lifecycle with reservation
//! and consumption of the Reservation Engine (§4.7). Task creation and its
//! reservation are one outcome: this deployment runs them as a
//! saga-without-outbox inside a single async call, relying on a background
//! reconciliation sweep to compensate for the narrow crash window between
//! the two steps (see SPEC_FULL.md §4.7 expansion).

use crate::cache::CacheCoordinator;
use crate::codes;
use crate::db::Db;
use crate::error::InventoryError;
use crate::operations::{self, NewOperation};
use crate::reservation::{ReservationEngine, ReservationStatus, ReserveItem};
use anyhow::Context;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Draft,
    Pending,
    InProgress,
    Completed,
    Claimed,
    Cancelled,
    Failed,
}

impl TaskStatus {
    fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Draft => "draft",
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "draft" => TaskStatus::Draft,
            "pending" => TaskStatus::Pending,
            "in_progress" => TaskStatus::InProgress,
            "completed" => TaskStatus::Completed,
            "claimed" => TaskStatus::Claimed,
            "cancelled" => TaskStatus::Cancelled,
            "failed" => TaskStatus::Failed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RecipeInput {
    pub item_id: Uuid,
    pub collection_id: Uuid,
    pub quality_level_id: Uuid,
    pub quantity: i64,
}

#[derive(Debug, Clone)]
pub struct RecipeOutput {
    pub item_id: Uuid,
    pub collection_id: Uuid,
    pub quality_level_id: Uuid,
    pub min_quantity: i64,
    pub max_quantity: i64,
    pub probability: f64,
}

pub struct ProductionSaga {
    db: Db,
    reservations: Arc<ReservationEngine>,
    cache: Arc<CacheCoordinator>,
    classifiers: Arc<crate::classifier::ClassifierRegistry>,
}

impl ProductionSaga {
    pub fn new(
        db: Db,
        reservations: Arc<ReservationEngine>,
        cache: Arc<CacheCoordinator>,
        classifiers: Arc<crate::classifier::ClassifierRegistry>,
    ) -> Self {
        Self {
            db,
            reservations,
            cache,
            classifiers,
        }
    }

    /// Creates a task as `draft`, reserves its inputs, and transitions it to
    /// `pending` on success. On reservation failure, the task is marked
    /// `failed` and no partial reservation is left behind (the engine never
    /// partially commits a reserve call).
    pub async fn start_production(
        &self,
        user_id: Uuid,
        recipe_id: Uuid,
        slot_number: i32,
        execution_count: i64,
    ) -> Result<Uuid, InventoryError> {
        if execution_count < 1 {
            return Err(InventoryError::Validation(
                "execution_count must be at least 1".into(),
            ));
        }

        let task_id = Uuid::new_v4();
        let inputs = self.recipe_inputs(recipe_id).await?;
        if inputs.is_empty() {
            return Err(InventoryError::Validation("recipe has no inputs".into()));
        }

        {
            let conn = self.db.conn.lock().await;
            let inserted = conn
                .execute(
                    "INSERT INTO production_tasks
                        (id, user_id, recipe_id, slot_number, status, execution_count, created_at)
                     VALUES (?1, ?2, ?3, ?4, 'draft', ?5, ?6)",
                    params![
                        task_id.to_string(),
                        user_id.to_string(),
                        recipe_id.to_string(),
                        slot_number,
                        execution_count,
                        Utc::now().to_rfc3339(),
                    ],
                )
                .context("inserting draft production task");

            match inserted {
                Ok(_) => {}
                Err(err) if err.to_string().contains("UNIQUE") => {
                    return Err(InventoryError::ActiveTaskExists)
                }
                Err(err) => return Err(InventoryError::Internal(err)),
            }
        }

        let items: Vec<ReserveItem> = inputs
            .iter()
            .map(|input| ReserveItem {
                item_id: input.item_id,
                collection_code: None,
                quality_code: None,
                quantity: input.quantity * execution_count,
            })
            .collect();

        // NOTE: collection/quality codes are resolved as `base` here; a
        // recipe whose inputs require a specific collection/quality would
        // need ReserveItem to carry codes instead of raw ids — out of scope
        // for the local recipe mirror this deployment ships (SPEC_FULL.md
        // Non-goals).
        match self.reservations.reserve(user_id, task_id, items).await {
            Ok(_) => {
                self.set_status(task_id, TaskStatus::Pending).await?;
                self.set_status(task_id, TaskStatus::InProgress).await?;
                Ok(task_id)
            }
            Err(err) => {
                self.set_status(task_id, TaskStatus::Failed).await?;
                Err(err)
            }
        }
    }

    pub async fn complete(&self, task_id: Uuid) -> Result<(), InventoryError> {
        self.require_status(task_id, TaskStatus::InProgress).await?;
        self.set_status(task_id, TaskStatus::Completed).await
    }

    pub async fn cancel(&self, task_id: Uuid) -> Result<(), InventoryError> {
        let status = self.load_status(task_id).await?;
        match status {
            TaskStatus::Draft | TaskStatus::Pending | TaskStatus::InProgress => {
                let (_, user_id, _) = self.task_recipe_user(task_id).await?;
                let _ = self.reservations.return_reservation(task_id, user_id).await;
                self.set_status(task_id, TaskStatus::Cancelled).await
            }
            _ => Err(InventoryError::Validation(
                "task cannot be cancelled from its current state".into(),
            )),
        }
    }

    /// `completed -> claimed`: consumes the reservation, rolls probabilistic
    /// outputs deterministically from the task id, and credits `main`.
    ///
    /// Retry-safe across a crash between consuming the reservation and
    /// committing `claimed`: a replay finds the reservation already
    /// `consumed` and skips straight to (re-)crediting, keyed on `task_id`
    /// so `create_batch`'s caller-side idempotency on `operation_id` still
    /// dedupes the credit itself.
    pub async fn claim(&self, task_id: Uuid) -> Result<Vec<Uuid>, InventoryError> {
        self.require_status(task_id, TaskStatus::Completed).await?;

        let (recipe_id, user_id, execution_count) = self.task_recipe_user(task_id).await?;

        let reservation = self.reservations.reservation_status(task_id).await?;
        if reservation.status != ReservationStatus::Consumed {
            self.reservations.consume_reservation(task_id, user_id).await?;
        }

        let outputs = self.recipe_outputs(recipe_id).await?;

        let main_id = self
            .classifiers
            .resolve(codes::CLASSIFIER_SECTION, Some(codes::SECTION_MAIN))
            .await?;
        let craft_result_id = self
            .classifiers
            .resolve(codes::CLASSIFIER_OPERATION_TYPE, Some(codes::OP_CRAFT_RESULT))
            .await?;

        let mut rng = StdRng::seed_from_u64(task_seed(task_id));
        let mut batch = Vec::new();
        for output in &outputs {
            for _ in 0..execution_count {
                if rng.gen::<f64>() > output.probability {
                    continue;
                }
                let quantity = if output.max_quantity > output.min_quantity {
                    rng.gen_range(output.min_quantity..=output.max_quantity)
                } else {
                    output.min_quantity
                };
                if quantity <= 0 {
                    continue;
                }
                batch.push(NewOperation {
                    user_id,
                    section_id: main_id,
                    item_id: output.item_id,
                    collection_id: output.collection_id,
                    quality_level_id: output.quality_level_id,
                    quantity_change: quantity,
                    operation_type_id: craft_result_id,
                    operation_id: Some(task_id),
                    recipe_id: Some(recipe_id),
                    comment: None,
                });
            }
        }

        let ids = {
            let conn = self.db.conn.lock().await;
            operations::create_batch(&conn, &batch)
                .context("crediting production outputs")
                .map_err(InventoryError::Internal)?
        };

        self.set_claimed(task_id).await?;
        self.cache.invalidate_user(user_id);
        Ok(ids)
    }

    async fn recipe_inputs(&self, recipe_id: Uuid) -> Result<Vec<RecipeInput>, InventoryError> {
        let conn = self.db.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT item_id, collection_id, quality_level_id, quantity
                 FROM recipe_input_items WHERE recipe_id = ?1",
            )
            .context("preparing recipe input query")
            .map_err(InventoryError::Internal)?;
        let rows = stmt
            .query_map([recipe_id.to_string()], |row| {
                let item_id: String = row.get(0)?;
                let collection_id: String = row.get(1)?;
                let quality_level_id: String = row.get(2)?;
                let quantity: i64 = row.get(3)?;
                Ok((item_id, collection_id, quality_level_id, quantity))
            })
            .context("loading recipe inputs")
            .map_err(InventoryError::Internal)?;

        let mut out = Vec::new();
        for row in rows {
            let (item_id, collection_id, quality_level_id, quantity) =
                row.context("reading recipe input row").map_err(InventoryError::Internal)?;
            out.push(RecipeInput {
                item_id: Uuid::parse_str(&item_id).unwrap(),
                collection_id: Uuid::parse_str(&collection_id).unwrap(),
                quality_level_id: Uuid::parse_str(&quality_level_id).unwrap(),
                quantity,
            });
        }
        Ok(out)
    }

    async fn recipe_outputs(&self, recipe_id: Uuid) -> Result<Vec<RecipeOutput>, InventoryError> {
        let conn = self.db.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT item_id, collection_id, quality_level_id, min_quantity, max_quantity, probability
                 FROM recipe_output_items WHERE recipe_id = ?1",
            )
            .context("preparing recipe output query")
            .map_err(InventoryError::Internal)?;
        let rows = stmt
            .query_map([recipe_id.to_string()], |row| {
                let item_id: String = row.get(0)?;
                let collection_id: String = row.get(1)?;
                let quality_level_id: String = row.get(2)?;
                let min_quantity: i64 = row.get(3)?;
                let max_quantity: i64 = row.get(4)?;
                let probability: f64 = row.get(5)?;
                Ok((item_id, collection_id, quality_level_id, min_quantity, max_quantity, probability))
            })
            .context("loading recipe outputs")
            .map_err(InventoryError::Internal)?;

        let mut out = Vec::new();
        for row in rows {
            let (item_id, collection_id, quality_level_id, min_quantity, max_quantity, probability) =
                row.context("reading recipe output row").map_err(InventoryError::Internal)?;
            out.push(RecipeOutput {
                item_id: Uuid::parse_str(&item_id).unwrap(),
                collection_id: Uuid::parse_str(&collection_id).unwrap(),
                quality_level_id: Uuid::parse_str(&quality_level_id).unwrap(),
                min_quantity,
                max_quantity,
                probability,
            });
        }
        Ok(out)
    }

    async fn task_recipe_user(&self, task_id: Uuid) -> Result<(Uuid, Uuid, i64), InventoryError> {
        let conn = self.db.conn.lock().await;
        conn.query_row(
            "SELECT recipe_id, user_id, execution_count FROM production_tasks WHERE id = ?1",
            [task_id.to_string()],
            |row| {
                let recipe_id: String = row.get(0)?;
                let user_id: String = row.get(1)?;
                let execution_count: i64 = row.get(2)?;
                Ok((recipe_id, user_id, execution_count))
            },
        )
        .context("loading task")
        .map_err(InventoryError::Internal)
        .map(|(recipe_id, user_id, execution_count)| {
            (
                Uuid::parse_str(&recipe_id).unwrap(),
                Uuid::parse_str(&user_id).unwrap(),
                execution_count,
            )
        })
    }

    async fn load_status(&self, task_id: Uuid) -> Result<TaskStatus, InventoryError> {
        let conn = self.db.conn.lock().await;
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM production_tasks WHERE id = ?1",
                [task_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .context("loading task status")
            .map_err(InventoryError::Internal)?;

        status
            .and_then(|s| TaskStatus::parse(&s))
            .ok_or_else(|| InventoryError::Validation("unknown production task".into()))
    }

    async fn require_status(&self, task_id: Uuid, expected: TaskStatus) -> Result<(), InventoryError> {
        let actual = self.load_status(task_id).await?;
        if actual != expected {
            return Err(InventoryError::Validation(format!(
                "task is in status {:?}, expected {:?}",
                actual, expected
            )));
        }
        Ok(())
    }

    async fn set_status(&self, task_id: Uuid, status: TaskStatus) -> Result<(), InventoryError> {
        let conn = self.db.conn.lock().await;
        conn.execute(
            "UPDATE production_tasks SET status = ?1 WHERE id = ?2",
            params![status.as_str(), task_id.to_string()],
        )
        .context("updating task status")
        .map_err(InventoryError::Internal)?;
        Ok(())
    }

    async fn set_claimed(&self, task_id: Uuid) -> Result<(), InventoryError> {
        let conn = self.db.conn.lock().await;
        conn.execute(
            "UPDATE production_tasks SET status = 'claimed', claimed_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), task_id.to_string()],
        )
        .context("marking task claimed")
        .map_err(InventoryError::Internal)?;
        Ok(())
    }

    /// Cancels `draft` tasks older than `grace` with no corresponding
    /// reservation — the compensating action for the saga-without-outbox
    /// crash window (SPEC_FULL.md §4.7 expansion).
    pub async fn reconcile_drafts(&self, grace: chrono::Duration) -> Result<usize, InventoryError> {
        let cutoff = (Utc::now() - grace).to_rfc3339();
        let stale: Vec<String> = {
            let conn = self.db.conn.lock().await;
            let mut stmt = conn
                .prepare("SELECT id FROM production_tasks WHERE status = 'draft' AND created_at < ?1")
                .context("preparing stale draft query")
                .map_err(InventoryError::Internal)?;
            let rows = stmt
                .query_map([cutoff], |row| row.get::<_, String>(0))
                .context("loading stale drafts")
                .map_err(InventoryError::Internal)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("reading stale draft rows")
                .map_err(InventoryError::Internal)?
        };

        let mut reconciled = 0;
        for id in stale {
            let task_id = Uuid::parse_str(&id).unwrap();
            let status = self.reservations.reservation_status(task_id).await?;
            if status.status == crate::reservation::ReservationStatus::NotFound {
                self.set_status(task_id, TaskStatus::Failed).await?;
                reconciled += 1;
            }
        }
        Ok(reconciled)
    }
}

fn task_seed(task_id: Uuid) -> u64 {
    let bytes = task_id.as_bytes();
    u64::from_le_bytes(bytes[0..8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_round_trips() {
        for status in [
            TaskStatus::Draft,
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Claimed,
            TaskStatus::Cancelled,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn task_seed_is_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(task_seed(id), task_seed(id));
    }
}
