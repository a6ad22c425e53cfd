//! Operations Log — the append-only source of truth for every balance
//! change. Operations are never updated or deleted (I1).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct NewOperation {
    pub user_id: Uuid,
    pub section_id: Uuid,
    pub item_id: Uuid,
    pub collection_id: Uuid,
    pub quality_level_id: Uuid,
    pub quantity_change: i64,
    pub operation_type_id: Uuid,
    pub operation_id: Option<Uuid>,
    pub recipe_id: Option<Uuid>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Operation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub section_id: Uuid,
    pub item_id: Uuid,
    pub collection_id: Uuid,
    pub quality_level_id: Uuid,
    pub quantity_change: i64,
    pub operation_type_id: Uuid,
    pub operation_id: Option<Uuid>,
    pub recipe_id: Option<Uuid>,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Inserts a batch of operations under the caller's already-open connection
/// guard, inside whatever transaction the caller is holding. Every operation
/// gets the same `created_at` instant (one transaction == one instant, §5).
pub fn create_batch(conn: &Connection, batch: &[NewOperation]) -> Result<Vec<Uuid>> {
    let now = Utc::now();
    let mut ids = Vec::with_capacity(batch.len());

    let mut stmt = conn
        .prepare(
            "INSERT INTO operations (
                id, user_id, section_id, item_id, collection_id, quality_level_id,
                quantity_change, operation_type_id, operation_id, recipe_id, comment, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .context("preparing operation insert")?;

    for op in batch {
        let id = Uuid::new_v4();
        stmt.execute(params![
            id.to_string(),
            op.user_id.to_string(),
            op.section_id.to_string(),
            op.item_id.to_string(),
            op.collection_id.to_string(),
            op.quality_level_id.to_string(),
            op.quantity_change,
            op.operation_type_id.to_string(),
            op.operation_id.map(|u| u.to_string()),
            op.recipe_id.map(|u| u.to_string()),
            op.comment,
            now.to_rfc3339(),
        ])
        .with_context(|| format!("inserting operation for item {}", op.item_id))?;
        ids.push(id);
    }

    Ok(ids)
}

pub fn by_external_id(conn: &Connection, operation_id: Uuid) -> Result<Vec<Operation>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, user_id, section_id, item_id, collection_id, quality_level_id,
                    quantity_change, operation_type_id, operation_id, recipe_id, comment, created_at
             FROM operations WHERE operation_id = ?1 ORDER BY rowid_id ASC",
        )
        .context("preparing operation lookup by operation_id")?;

    let rows = stmt
        .query_map([operation_id.to_string()], row_to_operation)
        .context("querying operations by operation_id")?;

    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("reading operations by operation_id")
}

/// Sums balance-affecting operations strictly after `since_exclusive`, and,
/// when `until_inclusive` is given, no later than that instant. Callers
/// reconstructing the *current* balance pass `None` (everything up to now);
/// `snapshot::get_or_create` passes `Some(end-of-target-date)` so that
/// materializing a past snapshot never pulls in operations recorded after
/// the date it's supposed to represent.
pub fn since_snapshot(
    conn: &Connection,
    user_id: Uuid,
    section_id: Uuid,
    item_id: Uuid,
    collection_id: Uuid,
    quality_level_id: Uuid,
    since_exclusive: &str,
    until_inclusive: Option<&str>,
) -> Result<i64> {
    match until_inclusive {
        Some(until) => conn.query_row(
            "SELECT COALESCE(SUM(quantity_change), 0) FROM operations
             WHERE user_id = ?1 AND section_id = ?2 AND item_id = ?3
               AND collection_id = ?4 AND quality_level_id = ?5
               AND created_at > ?6 AND created_at <= ?7",
            params![
                user_id.to_string(),
                section_id.to_string(),
                item_id.to_string(),
                collection_id.to_string(),
                quality_level_id.to_string(),
                since_exclusive,
                until,
            ],
            |row| row.get(0),
        ),
        None => conn.query_row(
            "SELECT COALESCE(SUM(quantity_change), 0) FROM operations
             WHERE user_id = ?1 AND section_id = ?2 AND item_id = ?3
               AND collection_id = ?4 AND quality_level_id = ?5
               AND created_at > ?6",
            params![
                user_id.to_string(),
                section_id.to_string(),
                item_id.to_string(),
                collection_id.to_string(),
                quality_level_id.to_string(),
                since_exclusive,
            ],
            |row| row.get(0),
        ),
    }
    .context("summing operations since snapshot")
}

fn row_to_operation(row: &rusqlite::Row) -> rusqlite::Result<Operation> {
    let id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let section_id: String = row.get(2)?;
    let item_id: String = row.get(3)?;
    let collection_id: String = row.get(4)?;
    let quality_level_id: String = row.get(5)?;
    let quantity_change: i64 = row.get(6)?;
    let operation_type_id: String = row.get(7)?;
    let operation_id: Option<String> = row.get(8)?;
    let recipe_id: Option<String> = row.get(9)?;
    let comment: Option<String> = row.get(10)?;
    let created_at: String = row.get(11)?;

    Ok(Operation {
        id: parse_uuid(&id)?,
        user_id: parse_uuid(&user_id)?,
        section_id: parse_uuid(&section_id)?,
        item_id: parse_uuid(&item_id)?,
        collection_id: parse_uuid(&collection_id)?,
        quality_level_id: parse_uuid(&quality_level_id)?,
        quantity_change,
        operation_type_id: parse_uuid(&operation_type_id)?,
        operation_id: operation_id.as_deref().and_then(|s| Uuid::parse_str(s).ok()),
        recipe_id: recipe_id.as_deref().and_then(|s| Uuid::parse_str(s).ok()),
        comment,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn parse_uuid(s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, "bad uuid")),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    #[tokio::test]
    async fn create_then_lookup_by_operation_id() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn.lock().await;
        seed_minimal_refs(&conn);

        let op_id = Uuid::new_v4();
        let new_op = NewOperation {
            user_id: Uuid::new_v4(),
            section_id: section_ref(&conn),
            item_id: item_ref(&conn),
            collection_id: classifier_item_ref(&conn),
            quality_level_id: classifier_item_ref(&conn),
            quantity_change: 10,
            operation_type_id: classifier_item_ref(&conn),
            operation_id: Some(op_id),
            recipe_id: None,
            comment: None,
        };

        create_batch(&conn, &[new_op]).unwrap();
        let found = by_external_id(&conn, op_id).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].quantity_change, 10);
    }

    fn seed_minimal_refs(_conn: &Connection) {}

    fn section_ref(conn: &Connection) -> Uuid {
        classifier_item_ref(conn)
    }

    fn item_ref(conn: &Connection) -> Uuid {
        let class = classifier_item_ref(conn);
        let typ = classifier_item_ref(conn);
        let classifier_id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO classifiers (id, code) VALUES (?1, ?2)",
            params![classifier_id.to_string(), format!("c{classifier_id}")],
        )
        .unwrap();
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO items (id, item_class_id, item_type_id, quality_levels_classifier_id, collections_classifier_id)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![id.to_string(), class.to_string(), typ.to_string(), classifier_id.to_string()],
        )
        .unwrap();
        id
    }

    fn classifier_item_ref(conn: &Connection) -> Uuid {
        let classifier_id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO classifiers (id, code) VALUES (?1, ?2)",
            params![classifier_id.to_string(), format!("clf{classifier_id}")],
        )
        .unwrap();
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO classifier_items (id, classifier_id, code) VALUES (?1, ?2, ?3)",
            params![id.to_string(), classifier_id.to_string(), format!("code{id}")],
        )
        .unwrap();
        id
    }
}
