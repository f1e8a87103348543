//! Trigger repository.

use super::{CatalogStore, corrupt, fmt_ts, parse_json, parse_opt_ts, parse_ts, parse_uuid};
use crate::error::StoreError;
use crate::types::{Trigger, TriggerStatus};
use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde_json::Value;
use uuid::Uuid;

const TRIGGER_COLUMNS: &str = "id, project_id, app_id, linked_account_id, trigger_name, \
     trigger_type, webhook_url, external_webhook_id, verification_token, config, status, \
     last_triggered_at, expires_at, created_at, updated_at";

fn trigger_from_row(row: &Row<'_>) -> Result<Trigger, StoreError> {
    let id: String = row.get("id")?;
    let project_id: String = row.get("project_id")?;
    let app_id: String = row.get("app_id")?;
    let linked_account_id: String = row.get("linked_account_id")?;
    let config: String = row.get("config")?;
    let status: String = row.get("status")?;
    let last_triggered_at: Option<String> = row.get("last_triggered_at")?;
    let expires_at: Option<String> = row.get("expires_at")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(Trigger {
        id: parse_uuid("triggers.id", &id)?,
        project_id: parse_uuid("triggers.project_id", &project_id)?,
        app_id: parse_uuid("triggers.app_id", &app_id)?,
        linked_account_id: parse_uuid("triggers.linked_account_id", &linked_account_id)?,
        trigger_name: row.get("trigger_name")?,
        trigger_type: row.get("trigger_type")?,
        webhook_url: row.get("webhook_url")?,
        external_webhook_id: row.get("external_webhook_id")?,
        verification_token: row.get("verification_token")?,
        config: parse_json("triggers.config", &config)?,
        status: TriggerStatus::parse(&status)
            .ok_or_else(|| corrupt("triggers.status", status.clone()))?,
        last_triggered_at: parse_opt_ts("triggers.last_triggered_at", last_triggered_at)?,
        expires_at: parse_opt_ts("triggers.expires_at", expires_at)?,
        created_at: parse_ts("triggers.created_at", &created_at)?,
        updated_at: parse_ts("triggers.updated_at", &updated_at)?,
    })
}

impl CatalogStore {
    /// Insert a new trigger row (status ACTIVE, registration pending). The
    /// id is caller-supplied because the webhook URL embeds it.
    #[allow(clippy::too_many_arguments)]
    pub fn create_trigger(
        &self,
        id: Uuid,
        project_id: Uuid,
        app_id: Uuid,
        linked_account_id: Uuid,
        trigger_name: &str,
        trigger_type: &str,
        webhook_url: &str,
        verification_token: &str,
        config: Value,
    ) -> Result<Trigger, StoreError> {
        let now = Utc::now();
        let trigger = Trigger {
            id,
            project_id,
            app_id,
            linked_account_id,
            trigger_name: trigger_name.into(),
            trigger_type: trigger_type.into(),
            webhook_url: webhook_url.into(),
            external_webhook_id: None,
            verification_token: verification_token.into(),
            config,
            status: TriggerStatus::Active,
            last_triggered_at: None,
            expires_at: None,
            created_at: now,
            updated_at: now,
        };
        self.conn().execute(
            "INSERT INTO triggers (id, project_id, app_id, linked_account_id, trigger_name, \
             trigger_type, webhook_url, external_webhook_id, verification_token, config, \
             status, last_triggered_at, expires_at, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8, ?9, ?10, NULL, NULL, ?11, ?12)",
            rusqlite::params![
                trigger.id.to_string(),
                trigger.project_id.to_string(),
                trigger.app_id.to_string(),
                trigger.linked_account_id.to_string(),
                trigger.trigger_name,
                trigger.trigger_type,
                trigger.webhook_url,
                trigger.verification_token,
                serde_json::to_string(&trigger.config)?,
                trigger.status.as_str(),
                fmt_ts(trigger.created_at),
                fmt_ts(trigger.updated_at),
            ],
        )?;
        Ok(trigger)
    }

    pub fn get_trigger(&self, id: Uuid) -> Result<Option<Trigger>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {TRIGGER_COLUMNS} FROM triggers WHERE id = ?1"))?;
        let mut rows = stmt.query_and_then([id.to_string()], trigger_from_row)?;
        rows.next().transpose()
    }

    /// List a project's triggers, newest first.
    pub fn list_triggers(
        &self,
        project_id: Uuid,
        status: Option<TriggerStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Trigger>, StoreError> {
        let mut sql = format!("SELECT {TRIGGER_COLUMNS} FROM triggers WHERE project_id = ?1");
        if status.is_some() {
            sql.push_str(" AND status = ?2");
        }
        sql.push_str(&format!(
            " ORDER BY created_at DESC, id DESC LIMIT {} OFFSET {}",
            limit as i64, offset as i64
        ));
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = match status {
            Some(status) => stmt.query_and_then(
                rusqlite::params![project_id.to_string(), status.as_str()],
                trigger_from_row,
            )?,
            None => stmt.query_and_then([project_id.to_string()], trigger_from_row)?,
        };
        rows.collect()
    }

    pub fn update_trigger_status(
        &self,
        id: Uuid,
        status: TriggerStatus,
    ) -> Result<(), StoreError> {
        self.touch_trigger(id, "status = ?2", &[&status.as_str()])
    }

    pub fn update_trigger_external_id(
        &self,
        id: Uuid,
        external_webhook_id: &str,
    ) -> Result<(), StoreError> {
        self.touch_trigger(id, "external_webhook_id = ?2", &[&external_webhook_id])
    }

    pub fn update_trigger_expires_at(
        &self,
        id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.touch_trigger(id, "expires_at = ?2", &[&fmt_ts(expires_at)])
    }

    pub fn update_trigger_config(&self, id: Uuid, config: &Value) -> Result<(), StoreError> {
        self.touch_trigger(id, "config = ?2", &[&serde_json::to_string(config)?])
    }

    pub fn update_trigger_last_triggered_at(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.touch_trigger(id, "last_triggered_at = ?2", &[&fmt_ts(at)])
    }

    fn touch_trigger(
        &self,
        id: Uuid,
        set_clause: &str,
        extra: &[&dyn rusqlite::ToSql],
    ) -> Result<(), StoreError> {
        let sql = format!("UPDATE triggers SET {set_clause}, updated_at = ?3 WHERE id = ?1");
        let id_str = id.to_string();
        let now = fmt_ts(Utc::now());
        let mut params: Vec<&dyn rusqlite::ToSql> = vec![&id_str];
        params.extend_from_slice(extra);
        params.push(&now);
        let updated = self.conn().execute(&sql, params.as_slice())?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                kind: "Trigger",
                name: id.to_string(),
            });
        }
        Ok(())
    }

    pub fn delete_trigger(&self, id: Uuid) -> Result<bool, StoreError> {
        let deleted = self
            .conn()
            .execute("DELETE FROM triggers WHERE id = ?1", [id.to_string()])?;
        Ok(deleted > 0)
    }

    /// ACTIVE triggers whose subscription expires at or before the bound.
    pub fn get_expiring_triggers(
        &self,
        expires_before: DateTime<Utc>,
    ) -> Result<Vec<Trigger>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRIGGER_COLUMNS} FROM triggers \
             WHERE status = 'ACTIVE' AND expires_at IS NOT NULL AND expires_at <= ?1 \
             ORDER BY expires_at"
        ))?;
        let rows = stmt.query_and_then([fmt_ts(expires_before)], trigger_from_row)?;
        rows.collect()
    }

    /// ERROR triggers created since the cutoff (registration retry pool).
    pub fn get_error_triggers_since(
        &self,
        created_after: DateTime<Utc>,
    ) -> Result<Vec<Trigger>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRIGGER_COLUMNS} FROM triggers \
             WHERE status = 'ERROR' AND created_at >= ?1 ORDER BY created_at"
        ))?;
        let rows = stmt.query_and_then([fmt_ts(created_after)], trigger_from_row)?;
        rows.collect()
    }

    /// Flip ACTIVE triggers past their expiry to EXPIRED. Returns the count.
    pub fn expire_stale_triggers(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let updated = self.conn().execute(
            "UPDATE triggers SET status = 'EXPIRED', updated_at = ?1 \
             WHERE status = 'ACTIVE' AND expires_at IS NOT NULL AND expires_at <= ?1",
            [fmt_ts(now)],
        )?;
        Ok(updated)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::super::linked_accounts::tests::seed_linked_account;
    use super::*;
    use serde_json::json;

    pub(crate) fn seed_trigger(store: &CatalogStore) -> Trigger {
        let (project, account) = seed_linked_account(store);
        store
            .create_trigger(
                Uuid::new_v4(),
                project.id,
                account.app_id,
                account.id,
                "inbox-watch",
                "message.received",
                "https://gw.example.com/v1/webhooks/gmail/abc",
                "a".repeat(64).as_str(),
                json!({}),
            )
            .unwrap()
    }

    #[test]
    fn test_create_and_get_trigger() {
        let store = CatalogStore::open_in_memory().unwrap();
        let trigger = seed_trigger(&store);
        let fetched = store.get_trigger(trigger.id).unwrap().unwrap();
        assert_eq!(fetched.status, TriggerStatus::Active);
        assert_eq!(fetched.verification_token.len(), 64);
        assert!(fetched.external_webhook_id.is_none());
    }

    #[test]
    fn test_status_and_external_id_updates() {
        let store = CatalogStore::open_in_memory().unwrap();
        let trigger = seed_trigger(&store);

        store
            .update_trigger_external_id(trigger.id, "ext-123")
            .unwrap();
        store
            .update_trigger_status(trigger.id, TriggerStatus::Error)
            .unwrap();
        store
            .update_trigger_config(trigger.id, &json!({"retry_count": 1}))
            .unwrap();

        let fetched = store.get_trigger(trigger.id).unwrap().unwrap();
        assert_eq!(fetched.external_webhook_id.as_deref(), Some("ext-123"));
        assert_eq!(fetched.status, TriggerStatus::Error);
        assert_eq!(fetched.retry_count(), 1);
        assert!(fetched.updated_at >= trigger.updated_at);
    }

    #[test]
    fn test_expiring_and_stale_queries() {
        let store = CatalogStore::open_in_memory().unwrap();
        let trigger = seed_trigger(&store);
        let now = Utc::now();

        store
            .update_trigger_expires_at(trigger.id, now - chrono::Duration::minutes(5))
            .unwrap();

        let expiring = store
            .get_expiring_triggers(now + chrono::Duration::hours(24))
            .unwrap();
        assert_eq!(expiring.len(), 1);

        assert_eq!(store.expire_stale_triggers(now).unwrap(), 1);
        let fetched = store.get_trigger(trigger.id).unwrap().unwrap();
        assert_eq!(fetched.status, TriggerStatus::Expired);
        // Expired triggers leave the renewal pool.
        assert!(store.get_expiring_triggers(now).unwrap().is_empty());
    }

    #[test]
    fn test_error_triggers_since() {
        let store = CatalogStore::open_in_memory().unwrap();
        let trigger = seed_trigger(&store);
        store
            .update_trigger_status(trigger.id, TriggerStatus::Error)
            .unwrap();

        let recent = store
            .get_error_triggers_since(Utc::now() - chrono::Duration::hours(24))
            .unwrap();
        assert_eq!(recent.len(), 1);
        let stale_window = store
            .get_error_triggers_since(Utc::now() + chrono::Duration::hours(1))
            .unwrap();
        assert!(stale_window.is_empty());
    }

    #[test]
    fn test_delete_trigger_idempotent() {
        let store = CatalogStore::open_in_memory().unwrap();
        let trigger = seed_trigger(&store);
        assert!(store.delete_trigger(trigger.id).unwrap());
        assert!(!store.delete_trigger(trigger.id).unwrap());
    }
}
