//! Catalog — item metadata, per-item images, and i18n-aware detail
//! resolution. All lookups are batched and bounded (§6: at most 100 items
//! per call).

use crate::db::Db;
use crate::error::InventoryError;
use anyhow::Context;
use rusqlite::OptionalExtension;
use std::collections::HashMap;
use uuid::Uuid;

pub const MAX_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct ItemDetails {
    pub item_class_id: Uuid,
    pub item_type_id: Uuid,
    pub collections_classifier_id: Uuid,
    pub quality_levels_classifier_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub item_id: Uuid,
    pub collection_id: Uuid,
    pub quality_level_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct Language {
    pub code: String,
    pub name: String,
    pub is_default: bool,
}

pub struct Catalog {
    db: Db,
}

impl Catalog {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn items_batch(
        &self,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, ItemDetails>, InventoryError> {
        if ids.is_empty() {
            return Err(InventoryError::Validation("items batch is empty".into()));
        }
        if ids.len() > MAX_BATCH_SIZE {
            return Err(InventoryError::Validation(format!(
                "items batch exceeds max of {MAX_BATCH_SIZE}"
            )));
        }

        let conn = self.db.conn.lock().await;
        let mut out = HashMap::new();
        for id in ids {
            let row = conn
                .query_row(
                    "SELECT item_class_id, item_type_id, collections_classifier_id, quality_levels_classifier_id
                     FROM items WHERE id = ?1",
                    [id.to_string()],
                    |row| {
                        let class_id: String = row.get(0)?;
                        let type_id: String = row.get(1)?;
                        let collections_classifier_id: String = row.get(2)?;
                        let quality_levels_classifier_id: String = row.get(3)?;
                        Ok((class_id, type_id, collections_classifier_id, quality_levels_classifier_id))
                    },
                )
                .optional()
                .context("loading item")
                .map_err(InventoryError::Internal)?;

            if let Some((class_id, type_id, collections_classifier_id, quality_levels_classifier_id)) = row {
                out.insert(
                    *id,
                    ItemDetails {
                        item_class_id: Uuid::parse_str(&class_id)
                            .context("parsing item_class_id")
                            .map_err(InventoryError::Internal)?,
                        item_type_id: Uuid::parse_str(&type_id)
                            .context("parsing item_type_id")
                            .map_err(InventoryError::Internal)?,
                        collections_classifier_id: Uuid::parse_str(&collections_classifier_id)
                            .context("parsing collections_classifier_id")
                            .map_err(InventoryError::Internal)?,
                        quality_levels_classifier_id: Uuid::parse_str(&quality_levels_classifier_id)
                            .context("parsing quality_levels_classifier_id")
                            .map_err(InventoryError::Internal)?,
                    },
                );
            }
        }
        Ok(out)
    }

    /// Resolves classifier_item ids back to their string codes, e.g. to turn
    /// `items.item_class_id`/`operations.collection_id` into the external
    /// vocabulary for a response body.
    pub async fn classifier_item_codes(
        &self,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, String>, InventoryError> {
        let conn = self.db.conn.lock().await;
        let mut out = HashMap::new();
        for id in ids {
            if out.contains_key(id) {
                continue;
            }
            let code: Option<String> = conn
                .query_row(
                    "SELECT code FROM classifier_items WHERE id = ?1",
                    [id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .context("loading classifier item code")
                .map_err(InventoryError::Internal)?;
            if let Some(code) = code {
                out.insert(*id, code);
            }
        }
        Ok(out)
    }

    /// Looks up the classifier codes that govern an item's collections and
    /// quality levels, so a caller can resolve a requested collection/quality
    /// code into the ids `images_batch` needs.
    pub async fn item_classifier_codes(&self, item_id: Uuid) -> Result<(String, String), InventoryError> {
        let conn = self.db.conn.lock().await;
        let collections_classifier: String = conn
            .query_row(
                "SELECT c.code FROM items i JOIN classifiers c ON c.id = i.collections_classifier_id
                 WHERE i.id = ?1",
                [item_id.to_string()],
                |row| row.get(0),
            )
            .context("loading item's collections classifier")
            .map_err(InventoryError::Internal)?;
        let quality_classifier: String = conn
            .query_row(
                "SELECT c.code FROM items i JOIN classifiers c ON c.id = i.quality_levels_classifier_id
                 WHERE i.id = ?1",
                [item_id.to_string()],
                |row| row.get(0),
            )
            .context("loading item's quality classifier")
            .map_err(InventoryError::Internal)?;
        Ok((collections_classifier, quality_classifier))
    }

    /// Looks up translations for a batch of entities, falling back to the
    /// default language when a translation is missing (§4.2), and to an
    /// empty string when even the default is missing.
    pub async fn translations_batch(
        &self,
        entity_type: &str,
        ids: &[Uuid],
        language: &str,
    ) -> Result<HashMap<Uuid, HashMap<String, String>>, InventoryError> {
        let default_language = self.default_language().await?;
        let conn = self.db.conn.lock().await;

        let mut out: HashMap<Uuid, HashMap<String, String>> = HashMap::new();
        for id in ids {
            let mut stmt = conn
                .prepare(
                    "SELECT field_name, content, language_code FROM i18n_translations \
                     WHERE entity_type = ?1 AND entity_id = ?2 AND language_code IN (?3, ?4)",
                )
                .context("preparing translations query")
                .map_err(InventoryError::Internal)?;

            let rows = stmt
                .query_map(
                    rusqlite::params![entity_type, id.to_string(), language, default_language.code],
                    |row| {
                        let field: String = row.get(0)?;
                        let content: String = row.get(1)?;
                        let lang: String = row.get(2)?;
                        Ok((field, content, lang))
                    },
                )
                .context("loading translations")
                .map_err(InventoryError::Internal)?;

            let mut by_field: HashMap<String, (String, bool)> = HashMap::new();
            for row in rows {
                let (field, content, lang) = row
                    .context("reading translation row")
                    .map_err(InventoryError::Internal)?;
                let is_requested = lang == language;
                let entry = by_field.entry(field).or_insert((String::new(), false));
                if is_requested || !entry.1 {
                    *entry = (content, is_requested);
                }
            }

            out.insert(
                *id,
                by_field.into_iter().map(|(k, (v, _))| (k, v)).collect(),
            );
        }
        Ok(out)
    }

    pub async fn default_language(&self) -> Result<Language, InventoryError> {
        let conn = self.db.conn.lock().await;
        conn.query_row(
            "SELECT code, name FROM i18n_languages WHERE is_default = 1 AND is_active = 1 LIMIT 1",
            [],
            |row| {
                Ok(Language {
                    code: row.get(0)?,
                    name: row.get(1)?,
                    is_default: true,
                })
            },
        )
        .context("loading default language")
        .map_err(InventoryError::Internal)
    }

    pub async fn images_batch(
        &self,
        requests: &[ImageRequest],
    ) -> Result<HashMap<(Uuid, Uuid, Uuid), String>, InventoryError> {
        const DEFAULT_IMAGE: &str = "/static/images/default-item.png";

        let conn = self.db.conn.lock().await;
        let mut out = HashMap::new();
        for req in requests {
            let url: Option<String> = conn
                .query_row(
                    "SELECT image_url FROM item_images \
                     WHERE item_id = ?1 AND collection_id = ?2 AND quality_level_id = ?3",
                    rusqlite::params![
                        req.item_id.to_string(),
                        req.collection_id.to_string(),
                        req.quality_level_id.to_string()
                    ],
                    |row| row.get(0),
                )
                .optional()
                .context("loading item image")
                .map_err(InventoryError::Internal)?;

            out.insert(
                (req.item_id, req.collection_id, req.quality_level_id),
                url.unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
            );
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_batch_rejected() {
        let db = Db::open_in_memory().unwrap();
        let catalog = Catalog::new(db);
        let result = catalog.items_batch(&[]).await;
        assert!(matches!(result, Err(InventoryError::Validation(_))));
    }

    #[tokio::test]
    async fn oversized_batch_rejected() {
        let db = Db::open_in_memory().unwrap();
        let catalog = Catalog::new(db);
        let ids: Vec<Uuid> = (0..101).map(|_| Uuid::new_v4()).collect();
        let result = catalog.items_batch(&ids).await;
        assert!(matches!(result, Err(InventoryError::Validation(_))));
    }

    #[tokio::test]
    async fn missing_image_returns_default() {
        let db = Db::open_in_memory().unwrap();
        let catalog = Catalog::new(db);
        let req = ImageRequest {
            item_id: Uuid::new_v4(),
            collection_id: Uuid::new_v4(),
            quality_level_id: Uuid::new_v4(),
        };
        let result = catalog.images_batch(&[req.clone()]).await.unwrap();
        let key = (req.item_id, req.collection_id, req.quality_level_id);
        assert_eq!(result.get(&key).unwrap(), "/static/images/default-item.png");
    }
}
