//! Daily Snapshot Engine — lazily materializes end-of-day balance rows that
//! serve as the O(1) base for current-balance reconstruction (§4.4).

use crate::error::InventoryError;
use crate::operations;
use anyhow::Context;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DailyBalance {
    pub balance_date: NaiveDate,
    pub quantity: i64,
}

/// Finds or creates the snapshot for `target_date`. Concurrent callers for
/// the same key+date converge on one row: we `INSERT ... ON CONFLICT DO
/// NOTHING` then `SELECT`, which — combined with the single connection
/// mutex every caller already holds — means there is never actually a
/// second writer to conflict with, but the upsert keeps the code correct if
/// this deployment ever moves to a real multi-connection pool.
pub fn get_or_create(
    conn: &Connection,
    user_id: Uuid,
    section_id: Uuid,
    item_id: Uuid,
    collection_id: Uuid,
    quality_level_id: Uuid,
    target_date: NaiveDate,
) -> Result<DailyBalance, InventoryError> {
    if let Some(existing) = find(
        conn,
        user_id,
        section_id,
        item_id,
        collection_id,
        quality_level_id,
        target_date,
    )
    .map_err(InventoryError::Internal)?
    {
        return Ok(existing);
    }

    let latest = latest_before_or_on(
        conn,
        user_id,
        section_id,
        item_id,
        collection_id,
        quality_level_id,
        target_date,
    )
    .map_err(InventoryError::Internal)?;

    let (base, from_date_exclusive) = match latest {
        Some(row) => (row.quantity, row.balance_date),
        None => (0, NaiveDate::from_ymd_opt(1970, 1, 1).unwrap() - ChronoDuration::days(1)),
    };

    let since = from_date_exclusive
        .and_hms_opt(23, 59, 59)
        .unwrap()
        .and_utc()
        .to_rfc3339();
    let until = target_date
        .and_hms_opt(23, 59, 59)
        .unwrap()
        .and_utc()
        .to_rfc3339();

    // Bounded at end-of-target_date: this snapshot must not absorb
    // operations recorded after the date it represents.
    let delta = operations::since_snapshot(
        conn,
        user_id,
        section_id,
        item_id,
        collection_id,
        quality_level_id,
        &since,
        Some(&until),
    )
    .map_err(InventoryError::Internal)?;

    let quantity = base + delta;

    if quantity < 0 {
        return Err(InventoryError::NegativeSnapshot(format!(
            "{user_id}:{item_id}:{collection_id}:{quality_level_id}:{target_date}"
        )));
    }

    conn.execute(
        "INSERT INTO daily_balances
            (user_id, section_id, item_id, collection_id, quality_level_id, balance_date, quantity, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT (user_id, section_id, item_id, collection_id, quality_level_id, balance_date)
         DO NOTHING",
        params![
            user_id.to_string(),
            section_id.to_string(),
            item_id.to_string(),
            collection_id.to_string(),
            quality_level_id.to_string(),
            target_date.to_string(),
            quantity,
            Utc::now().to_rfc3339(),
        ],
    )
    .context("inserting daily balance")
    .map_err(InventoryError::Internal)?;

    find(
        conn,
        user_id,
        section_id,
        item_id,
        collection_id,
        quality_level_id,
        target_date,
    )
    .map_err(InventoryError::Internal)?
    .context("daily balance missing immediately after insert")
    .map_err(InventoryError::Internal)
}

fn find(
    conn: &Connection,
    user_id: Uuid,
    section_id: Uuid,
    item_id: Uuid,
    collection_id: Uuid,
    quality_level_id: Uuid,
    date: NaiveDate,
) -> anyhow::Result<Option<DailyBalance>> {
    conn.query_row(
        "SELECT balance_date, quantity FROM daily_balances
         WHERE user_id = ?1 AND section_id = ?2 AND item_id = ?3
           AND collection_id = ?4 AND quality_level_id = ?5 AND balance_date = ?6",
        params![
            user_id.to_string(),
            section_id.to_string(),
            item_id.to_string(),
            collection_id.to_string(),
            quality_level_id.to_string(),
            date.to_string(),
        ],
        |row| {
            let date_str: String = row.get(0)?;
            let quantity: i64 = row.get(1)?;
            Ok((date_str, quantity))
        },
    )
    .optional()
    .context("looking up daily balance")
    .map(|opt| {
        opt.map(|(date_str, quantity)| DailyBalance {
            balance_date: date_str.parse().expect("stored balance_date is valid"),
            quantity,
        })
    })
}

pub fn latest_before_or_on(
    conn: &Connection,
    user_id: Uuid,
    section_id: Uuid,
    item_id: Uuid,
    collection_id: Uuid,
    quality_level_id: Uuid,
    on_or_before: NaiveDate,
) -> anyhow::Result<Option<DailyBalance>> {
    conn.query_row(
        "SELECT balance_date, quantity FROM daily_balances
         WHERE user_id = ?1 AND section_id = ?2 AND item_id = ?3
           AND collection_id = ?4 AND quality_level_id = ?5 AND balance_date <= ?6
         ORDER BY balance_date DESC LIMIT 1",
        params![
            user_id.to_string(),
            section_id.to_string(),
            item_id.to_string(),
            collection_id.to_string(),
            quality_level_id.to_string(),
            on_or_before.to_string(),
        ],
        |row| {
            let date_str: String = row.get(0)?;
            let quantity: i64 = row.get(1)?;
            Ok((date_str, quantity))
        },
    )
    .optional()
    .context("looking up latest daily balance")
    .map(|opt| {
        opt.map(|(date_str, quantity)| DailyBalance {
            balance_date: date_str.parse().expect("stored balance_date is valid"),
            quantity,
        })
    })
}
