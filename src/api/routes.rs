//! HTTP handlers for the inventory surface (§6).

use crate::admin::AdjustItem;
use crate::auth::Claims;
use crate::balance::BalanceKey;
use crate::catalog::{ImageRequest, MAX_BATCH_SIZE};
use crate::classifier::BASE_CODE;
use crate::codes;
use crate::error::InventoryError;
use crate::reservation::{ReserveItem, ReservationStatus};
use crate::AppState;
use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct SectionQuery {
    #[serde(default = "default_section")]
    pub section: String,
}

fn default_section() -> String {
    codes::SECTION_MAIN.to_string()
}

/// Drops a resolved classifier code back to `None` when it's the `base`
/// entry, so response bodies only surface a `collection`/`quality_level`
/// field when the caller's item actually has a non-default one (§6).
fn display_code(code: Option<&str>) -> Option<String> {
    match code {
        Some(c) if c != BASE_CODE => Some(c.to_string()),
        _ => None,
    }
}

#[derive(Debug, Serialize)]
pub struct InventoryRow {
    pub item_id: Uuid,
    pub item_class: String,
    pub item_type: String,
    pub collection: Option<String>,
    pub quality_level: Option<String>,
    pub quantity: i64,
}

#[derive(Debug, Serialize)]
pub struct InventoryResponse {
    pub items: Vec<InventoryRow>,
}

pub async fn get_inventory(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<SectionQuery>,
) -> Result<Json<InventoryResponse>, InventoryError> {
    let section_id = state
        .classifiers
        .resolve(codes::CLASSIFIER_SECTION, Some(&query.section))
        .await?;

    let triples: Vec<(String, String, String)> = {
        let conn = state.db.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT item_id, collection_id, quality_level_id FROM operations
                 WHERE user_id = ?1 AND section_id = ?2",
            )
            .map_err(|e| InventoryError::Internal(e.into()))?;
        let rows = stmt
            .query_map(
                rusqlite::params![claims.user_id().to_string(), section_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(|e| InventoryError::Internal(e.into()))?
            .collect::<rusqlite::Result<_>>()
            .map_err(|e| InventoryError::Internal(e.into()))?;
        rows
    };

    let parsed: Vec<(Uuid, Uuid, Uuid)> = triples
        .into_iter()
        .map(|(item_id, collection_id, quality_level_id)| {
            Ok((
                Uuid::parse_str(&item_id).map_err(|e| InventoryError::Internal(e.into()))?,
                Uuid::parse_str(&collection_id).map_err(|e| InventoryError::Internal(e.into()))?,
                Uuid::parse_str(&quality_level_id).map_err(|e| InventoryError::Internal(e.into()))?,
            ))
        })
        .collect::<Result<_, InventoryError>>()?;

    let unique_item_ids: Vec<Uuid> = parsed
        .iter()
        .map(|(item_id, _, _)| *item_id)
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();

    let details = if unique_item_ids.is_empty() {
        HashMap::new()
    } else {
        state.catalog.items_batch(&unique_item_ids).await?
    };

    let mut code_ids = Vec::new();
    for detail in details.values() {
        code_ids.push(detail.item_class_id);
        code_ids.push(detail.item_type_id);
    }
    for (_, collection_id, quality_level_id) in &parsed {
        code_ids.push(*collection_id);
        code_ids.push(*quality_level_id);
    }
    let code_names = state.catalog.classifier_item_codes(&code_ids).await?;

    let mut items = Vec::new();
    for (item_id, collection_id, quality_level_id) in parsed {
        let key = BalanceKey {
            user_id: claims.user_id(),
            section_id,
            item_id,
            collection_id,
            quality_level_id,
        };
        let quantity = state.balances.current_balance(key).await?;
        if quantity <= 0 {
            continue;
        }

        let detail = details.get(&item_id).ok_or_else(|| {
            InventoryError::Internal(anyhow::anyhow!("item {item_id} missing from catalog"))
        })?;
        let item_class = code_names.get(&detail.item_class_id).cloned().ok_or_else(|| {
            InventoryError::Internal(anyhow::anyhow!(
                "classifier item {} missing a code",
                detail.item_class_id
            ))
        })?;
        let item_type = code_names.get(&detail.item_type_id).cloned().ok_or_else(|| {
            InventoryError::Internal(anyhow::anyhow!(
                "classifier item {} missing a code",
                detail.item_type_id
            ))
        })?;
        let collection = display_code(code_names.get(&collection_id).map(|s| s.as_str()));
        let quality_level = display_code(code_names.get(&quality_level_id).map(|s| s.as_str()));

        items.push(InventoryRow {
            item_id,
            item_class,
            item_type,
            collection,
            quality_level,
            quantity,
        });
    }

    Ok(Json(InventoryResponse { items }))
}

#[derive(Debug, Deserialize)]
pub struct ItemDetailsQuery {
    #[serde(default = "default_lang")]
    pub lang: String,
}

fn default_lang() -> String {
    "en".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ItemDetailsItemRequest {
    pub item_id: Uuid,
    pub collection: Option<String>,
    pub quality_level: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ItemDetailsRequest {
    pub items: Vec<ItemDetailsItemRequest>,
}

#[derive(Debug, Serialize)]
pub struct ItemDetailEntry {
    pub item_id: Uuid,
    pub item_class: Option<String>,
    pub item_type: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub collection: Option<String>,
    pub quality_level: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ItemDetailsResponse {
    pub items: Vec<ItemDetailEntry>,
}

pub async fn get_item_details(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ItemDetailsQuery>,
    Json(body): Json<ItemDetailsRequest>,
) -> Result<Json<ItemDetailsResponse>, InventoryError> {
    if body.items.len() > MAX_BATCH_SIZE {
        return Err(InventoryError::Validation(format!(
            "at most {MAX_BATCH_SIZE} items per call"
        )));
    }

    let item_ids: Vec<Uuid> = body.items.iter().map(|i| i.item_id).collect();
    let details = if item_ids.is_empty() {
        HashMap::new()
    } else {
        state.catalog.items_batch(&item_ids).await?
    };
    let translations = if item_ids.is_empty() {
        HashMap::new()
    } else {
        state
            .catalog
            .translations_batch("item", &item_ids, &query.lang)
            .await?
    };

    let mut code_ids = Vec::new();
    for detail in details.values() {
        code_ids.push(detail.item_class_id);
        code_ids.push(detail.item_type_id);
    }
    let code_names = state.catalog.classifier_item_codes(&code_ids).await?;

    let mut items = Vec::new();
    for requested in body.items {
        let detail = details.get(&requested.item_id);
        let translation = translations.get(&requested.item_id).cloned().unwrap_or_default();

        let item_class = detail.and_then(|d| code_names.get(&d.item_class_id).cloned());
        let item_type = detail.and_then(|d| code_names.get(&d.item_type_id).cloned());

        let image_url = match detail {
            Some(_) => {
                let (collections_classifier, quality_classifier) = state
                    .catalog
                    .item_classifier_codes(requested.item_id)
                    .await?;
                let collection_id = state
                    .classifiers
                    .resolve(&collections_classifier, requested.collection.as_deref())
                    .await?;
                let quality_level_id = state
                    .classifiers
                    .resolve(&quality_classifier, requested.quality_level.as_deref())
                    .await?;
                let images = state
                    .catalog
                    .images_batch(&[ImageRequest {
                        item_id: requested.item_id,
                        collection_id,
                        quality_level_id,
                    }])
                    .await?;
                images
                    .get(&(requested.item_id, collection_id, quality_level_id))
                    .cloned()
            }
            None => None,
        };

        items.push(ItemDetailEntry {
            item_id: requested.item_id,
            item_class,
            item_type,
            name: translation.get("name").cloned(),
            description: translation.get("description").cloned(),
            image_url,
            collection: display_code(requested.collection.as_deref()),
            quality_level: display_code(requested.quality_level.as_deref()),
        });
    }

    Ok(Json(ItemDetailsResponse { items }))
}

#[derive(Debug, Deserialize)]
pub struct ReserveItemBody {
    pub item_id: Uuid,
    pub collection: Option<String>,
    pub quality_level: Option<String>,
    pub quantity: i64,
}

#[derive(Debug, Deserialize)]
pub struct ReserveRequest {
    pub operation_id: Uuid,
    pub items: Vec<ReserveItemBody>,
}

#[derive(Debug, Serialize)]
pub struct OperationIdsResponse {
    pub operation_ids: Vec<Uuid>,
}

pub async fn reserve(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<ReserveRequest>,
) -> Result<Json<OperationIdsResponse>, InventoryError> {
    let items = body
        .items
        .into_iter()
        .map(|item| ReserveItem {
            item_id: item.item_id,
            collection_code: item.collection,
            quality_code: item.quality_level,
            quantity: item.quantity,
        })
        .collect();

    let ids = state
        .reservations
        .reserve(claims.user_id(), body.operation_id, items)
        .await?;

    Ok(Json(OperationIdsResponse { operation_ids: ids }))
}

#[derive(Debug, Deserialize)]
pub struct OperationIdRequest {
    pub operation_id: Uuid,
}

pub async fn return_reserve(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<OperationIdRequest>,
) -> Result<Json<OperationIdsResponse>, InventoryError> {
    let ids = state
        .reservations
        .return_reservation(body.operation_id, claims.user_id())
        .await?;
    Ok(Json(OperationIdsResponse { operation_ids: ids }))
}

pub async fn consume_reserve(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<OperationIdRequest>,
) -> Result<Json<OperationIdsResponse>, InventoryError> {
    let ids = state
        .reservations
        .consume_reservation(body.operation_id, claims.user_id())
        .await?;
    Ok(Json(OperationIdsResponse { operation_ids: ids }))
}

#[derive(Debug, Serialize)]
pub struct ReservationStatusItem {
    pub item_id: Uuid,
    pub collection_id: Uuid,
    pub quality_level_id: Uuid,
    pub quantity: i64,
}

#[derive(Debug, Serialize)]
pub struct ReservationStatusResponse {
    pub exists: bool,
    pub status: Option<&'static str>,
    pub user_id: Option<Uuid>,
    pub reserved_at: Option<chrono::DateTime<chrono::Utc>>,
    pub items: Vec<ReservationStatusItem>,
}

impl ReservationStatusResponse {
    fn not_found() -> Self {
        Self {
            exists: false,
            status: None,
            user_id: None,
            reserved_at: None,
            items: Vec::new(),
        }
    }
}

pub async fn reservation_status(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(operation_id): Path<Uuid>,
) -> Result<Json<ReservationStatusResponse>, InventoryError> {
    let report = state.reservations.reservation_status(operation_id).await?;

    // A reservation belonging to another user is reported identically to one
    // that doesn't exist, so a caller can't distinguish "not mine" from
    // "never existed" by probing operation ids.
    if report.user_id.is_some() && report.user_id != Some(claims.user_id()) {
        return Ok(Json(ReservationStatusResponse::not_found()));
    }

    let status = match report.status {
        ReservationStatus::NotFound => None,
        ReservationStatus::Active => Some("active"),
        ReservationStatus::Returned => Some("returned"),
        ReservationStatus::Consumed => Some("consumed"),
    };

    Ok(Json(ReservationStatusResponse {
        exists: status.is_some(),
        status,
        user_id: report.user_id,
        reserved_at: report.reserved_at,
        items: report
            .items
            .into_iter()
            .map(|(item_id, collection_id, quality_level_id, quantity)| ReservationStatusItem {
                item_id,
                collection_id,
                quality_level_id,
                quantity,
            })
            .collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct AdjustItemBody {
    pub item_id: Uuid,
    pub collection: Option<String>,
    pub quality_level: Option<String>,
    pub quantity_change: i64,
}

#[derive(Debug, Deserialize)]
pub struct AdjustRequest {
    pub user_id: Uuid,
    #[serde(default = "default_section")]
    pub section: String,
    pub items: Vec<AdjustItemBody>,
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct AdjustResponse {
    pub balances: Vec<(Uuid, i64)>,
}

pub async fn admin_adjust(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AdjustRequest>,
) -> Result<Json<AdjustResponse>, InventoryError> {
    let items = body
        .items
        .into_iter()
        .map(|item| AdjustItem {
            item_id: item.item_id,
            collection_code: item.collection,
            quality_code: item.quality_level,
            quantity_change: item.quantity_change,
        })
        .collect();

    let results = state
        .admin
        .adjust(body.user_id, &body.section, items, body.reason)
        .await?;

    Ok(Json(AdjustResponse {
        balances: results
            .into_iter()
            .map(|r| (r.item_id, r.new_balance))
            .collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct AddItemsItemBody {
    pub item_id: Uuid,
    pub collection: Option<String>,
    pub quality_level: Option<String>,
    pub quantity: i64,
}

#[derive(Debug, Deserialize)]
pub struct AddItemsRequest {
    pub user_id: Uuid,
    pub operation_id: Uuid,
    pub items: Vec<AddItemsItemBody>,
}

/// `POST /inventory/add-items` — grants items to a player's `main` section
/// (chest rewards, purchase fulfillment), mirroring `admin_adjust` but
/// crediting under `chest_reward` and idempotent on the caller's
/// `operation_id` instead of operator-audited.
pub async fn add_items(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddItemsRequest>,
) -> Result<Json<OperationIdsResponse>, InventoryError> {
    let items = body
        .items
        .into_iter()
        .map(|item| AdjustItem {
            item_id: item.item_id,
            collection_code: item.collection,
            quality_code: item.quality_level,
            quantity_change: item.quantity,
        })
        .collect();

    let ids = state
        .admin
        .add_items(body.user_id, body.operation_id, items)
        .await?;

    Ok(Json(OperationIdsResponse { operation_ids: ids }))
}

#[derive(Debug, Deserialize)]
pub struct StartProductionRequest {
    pub recipe_id: Uuid,
    pub slot_number: i32,
    #[serde(default = "default_execution_count")]
    pub execution_count: i64,
}

fn default_execution_count() -> i64 {
    1
}

#[derive(Debug, Serialize)]
pub struct TaskIdResponse {
    pub task_id: Uuid,
}

pub async fn start_production(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<StartProductionRequest>,
) -> Result<Json<TaskIdResponse>, InventoryError> {
    let task_id = state
        .saga
        .start_production(
            claims.user_id(),
            body.recipe_id,
            body.slot_number,
            body.execution_count,
        )
        .await?;
    Ok(Json(TaskIdResponse { task_id }))
}

#[derive(Debug, Deserialize)]
pub struct TaskIdRequest {
    pub task_id: Uuid,
}

pub async fn complete_production(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TaskIdRequest>,
) -> Result<Json<serde_json::Value>, InventoryError> {
    state.saga.complete(body.task_id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn claim_production(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TaskIdRequest>,
) -> Result<Json<OperationIdsResponse>, InventoryError> {
    let ids = state.saga.claim(body.task_id).await?;
    Ok(Json(OperationIdsResponse { operation_ids: ids }))
}

pub async fn cancel_production(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TaskIdRequest>,
) -> Result<Json<serde_json::Value>, InventoryError> {
    state.saga.cancel(body.task_id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn health() -> &'static str {
    "ok"
}
