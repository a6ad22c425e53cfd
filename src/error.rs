//! Edge-facing error taxonomy for the inventory core.
//!
//! Internal components return `anyhow::Result<T>`; this type is the thing an
//! HTTP handler ultimately turns into a status code. Errors are recovered
//! from `anyhow::Error` chains via `downcast_ref` at the handler boundary,
//! matching the house convention of never deriving `thiserror` and instead
//! hand-writing `Display`/`Error`/`IntoResponse`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct MissingItem {
    pub item_id: Uuid,
    pub collection_id: Option<Uuid>,
    pub quality_level_id: Option<Uuid>,
    pub required: i64,
    pub available: i64,
}

#[derive(Debug)]
pub enum InventoryError {
    UnknownClassifierCode(String),
    UnknownClassifierUuid(Uuid),
    MissingBaseClassifier(String),
    Validation(String),
    InsufficientBalance(Vec<MissingItem>),
    ReservationNotFound(Uuid),
    ReservationAlreadyFinalized(Uuid),
    ActiveTaskExists,
    NegativeSnapshot(String),
    Internal(anyhow::Error),
}

impl std::fmt::Display for InventoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InventoryError::UnknownClassifierCode(code) => {
                write!(f, "unknown classifier code: {code}")
            }
            InventoryError::UnknownClassifierUuid(id) => {
                write!(f, "unknown classifier uuid: {id}")
            }
            InventoryError::MissingBaseClassifier(classifier) => {
                write!(f, "classifier {classifier} has no base entry")
            }
            InventoryError::Validation(msg) => write!(f, "validation failed: {msg}"),
            InventoryError::InsufficientBalance(_) => write!(f, "insufficient balance"),
            InventoryError::ReservationNotFound(id) => write!(f, "reservation {id} not found"),
            InventoryError::ReservationAlreadyFinalized(id) => {
                write!(f, "reservation {id} already finalized")
            }
            InventoryError::ActiveTaskExists => {
                write!(f, "an active production task already exists for this recipe")
            }
            InventoryError::NegativeSnapshot(key) => {
                write!(f, "corrupted history produced a negative snapshot: {key}")
            }
            InventoryError::Internal(err) => write!(f, "internal error: {err}"),
        }
    }
}

impl std::error::Error for InventoryError {}

impl From<anyhow::Error> for InventoryError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<InventoryError>() {
            Ok(domain) => domain,
            Err(err) => InventoryError::Internal(err),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    missing_items: Option<&'a [MissingItem]>,
}

impl IntoResponse for InventoryError {
    fn into_response(self) -> Response {
        if let InventoryError::NegativeSnapshot(ref key) = self {
            tracing::error!(snapshot_key = %key, "negative snapshot detected, history may be corrupted");
        }

        let (status, message, missing): (StatusCode, String, Option<Vec<MissingItem>>) = match self
        {
            InventoryError::UnknownClassifierCode(_)
            | InventoryError::UnknownClassifierUuid(_)
            | InventoryError::MissingBaseClassifier(_)
            | InventoryError::Validation(_) => {
                (StatusCode::BAD_REQUEST, self.to_string(), None)
            }
            InventoryError::InsufficientBalance(ref items) => (
                StatusCode::CONFLICT,
                self.to_string(),
                Some(items.clone()),
            ),
            InventoryError::ReservationNotFound(_) => {
                (StatusCode::NOT_FOUND, self.to_string(), None)
            }
            InventoryError::ReservationAlreadyFinalized(_) | InventoryError::ActiveTaskExists => {
                (StatusCode::CONFLICT, self.to_string(), None)
            }
            InventoryError::NegativeSnapshot(_) | InventoryError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
                None,
            ),
        };

        let body = ErrorBody {
            error: &message,
            missing_items: missing.as_deref(),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_balance_maps_to_409() {
        let err = InventoryError::InsufficientBalance(vec![MissingItem {
            item_id: Uuid::new_v4(),
            collection_id: None,
            quality_level_id: None,
            required: 5,
            available: 2,
        }]);
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn reservation_not_found_maps_to_404() {
        let err = InventoryError::ReservationNotFound(Uuid::new_v4());
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn validation_maps_to_400() {
        let err = InventoryError::Validation("empty item list".to_string());
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
