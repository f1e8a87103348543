//! Trigger event repository.
//!
//! Events dedupe on `(trigger_id, external_event_id)` at insert time; rows
//! without an external id never collide (SQLite treats the NULLs as
//! distinct), matching the ordering contract.

use super::{CatalogStore, corrupt, fmt_ts, is_unique_violation, parse_json, parse_opt_ts, parse_ts, parse_uuid};
use crate::error::StoreError;
use crate::types::{TriggerEvent, TriggerEventStatus};
use chrono::{DateTime, Duration, Utc};
use rusqlite::Row;
use serde_json::Value;
use uuid::Uuid;

const EVENT_COLUMNS: &str = "id, trigger_id, event_type, event_data, external_event_id, \
     status, received_at, processed_at, delivered_at, expires_at, error_message";

/// Default retention for received events.
const EVENT_RETENTION_DAYS: i64 = 30;

fn event_from_row(row: &Row<'_>) -> Result<TriggerEvent, StoreError> {
    let id: String = row.get("id")?;
    let trigger_id: String = row.get("trigger_id")?;
    let event_data: String = row.get("event_data")?;
    let status: String = row.get("status")?;
    let received_at: String = row.get("received_at")?;
    let processed_at: Option<String> = row.get("processed_at")?;
    let delivered_at: Option<String> = row.get("delivered_at")?;
    let expires_at: String = row.get("expires_at")?;
    Ok(TriggerEvent {
        id: parse_uuid("trigger_events.id", &id)?,
        trigger_id: parse_uuid("trigger_events.trigger_id", &trigger_id)?,
        event_type: row.get("event_type")?,
        event_data: parse_json("trigger_events.event_data", &event_data)?,
        external_event_id: row.get("external_event_id")?,
        status: TriggerEventStatus::parse(&status)
            .ok_or_else(|| corrupt("trigger_events.status", status.clone()))?,
        received_at: parse_ts("trigger_events.received_at", &received_at)?,
        processed_at: parse_opt_ts("trigger_events.processed_at", processed_at)?,
        delivered_at: parse_opt_ts("trigger_events.delivered_at", delivered_at)?,
        expires_at: parse_ts("trigger_events.expires_at", &expires_at)?,
        error_message: row.get("error_message")?,
    })
}

impl CatalogStore {
    /// Persist a received webhook event as PENDING. A duplicate
    /// `(trigger_id, external_event_id)` pair surfaces as `AlreadyExists`.
    pub fn create_trigger_event(
        &self,
        trigger_id: Uuid,
        event_type: &str,
        event_data: Value,
        external_event_id: Option<&str>,
    ) -> Result<TriggerEvent, StoreError> {
        let now = Utc::now();
        let event = TriggerEvent {
            id: Uuid::new_v4(),
            trigger_id,
            event_type: event_type.into(),
            event_data,
            external_event_id: external_event_id.map(String::from),
            status: TriggerEventStatus::Pending,
            received_at: now,
            processed_at: None,
            delivered_at: None,
            expires_at: now + Duration::days(EVENT_RETENTION_DAYS),
            error_message: None,
        };
        let result = self.conn().execute(
            "INSERT INTO trigger_events (id, trigger_id, event_type, event_data, \
             external_event_id, status, received_at, processed_at, delivered_at, expires_at, \
             error_message) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, NULL, ?8, NULL)",
            rusqlite::params![
                event.id.to_string(),
                event.trigger_id.to_string(),
                event.event_type,
                serde_json::to_string(&event.event_data)?,
                event.external_event_id,
                event.status.as_str(),
                fmt_ts(event.received_at),
                fmt_ts(event.expires_at),
            ],
        );
        match result {
            Ok(_) => Ok(event),
            Err(e) if is_unique_violation(&e) => Err(StoreError::AlreadyExists {
                kind: "TriggerEvent",
                name: external_event_id.unwrap_or("<none>").to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether an event with this external id was already recorded.
    pub fn check_duplicate_event(
        &self,
        trigger_id: Uuid,
        external_event_id: &str,
    ) -> Result<bool, StoreError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM trigger_events \
             WHERE trigger_id = ?1 AND external_event_id = ?2",
            rusqlite::params![trigger_id.to_string(), external_event_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Events for one trigger, newest first.
    pub fn get_trigger_events(
        &self,
        trigger_id: Uuid,
        status: Option<TriggerEventStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TriggerEvent>, StoreError> {
        let mut sql = format!("SELECT {EVENT_COLUMNS} FROM trigger_events WHERE trigger_id = ?1");
        if status.is_some() {
            sql.push_str(" AND status = ?2");
        }
        sql.push_str(&format!(
            " ORDER BY received_at DESC, id DESC LIMIT {} OFFSET {}",
            limit as i64, offset as i64
        ));
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = match status {
            Some(status) => stmt.query_and_then(
                rusqlite::params![trigger_id.to_string(), status.as_str()],
                event_from_row,
            )?,
            None => stmt.query_and_then([trigger_id.to_string()], event_from_row)?,
        };
        rows.collect()
    }

    /// PENDING events older than the bound, for the delivery retry loop.
    pub fn get_pending_events(
        &self,
        received_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TriggerEvent>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM trigger_events \
             WHERE status = 'PENDING' AND received_at <= ?1 \
             ORDER BY received_at LIMIT {}",
            limit as i64
        ))?;
        let rows = stmt.query_and_then([fmt_ts(received_before)], event_from_row)?;
        rows.collect()
    }

    pub fn mark_event_delivered(&self, id: Uuid) -> Result<(), StoreError> {
        let now = fmt_ts(Utc::now());
        self.conn().execute(
            "UPDATE trigger_events SET status = 'DELIVERED', processed_at = ?2, \
             delivered_at = ?2 WHERE id = ?1",
            rusqlite::params![id.to_string(), now],
        )?;
        Ok(())
    }

    pub fn mark_event_failed(&self, id: Uuid, error_message: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE trigger_events SET status = 'FAILED', processed_at = ?2, \
             error_message = ?3 WHERE id = ?1",
            rusqlite::params![id.to_string(), fmt_ts(Utc::now()), error_message],
        )?;
        Ok(())
    }

    /// Delete expired events in batches. Returns the total deleted.
    pub fn cleanup_expired_events(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<usize, StoreError> {
        let bound = fmt_ts(now);
        let mut total = 0;
        loop {
            let deleted = self.conn().execute(
                &format!(
                    "DELETE FROM trigger_events WHERE id IN \
                     (SELECT id FROM trigger_events WHERE expires_at <= ?1 LIMIT {})",
                    batch_size as i64
                ),
                [&bound],
            )?;
            total += deleted;
            if deleted < batch_size {
                break;
            }
        }
        Ok(total)
    }
}
