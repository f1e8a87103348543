//! Linked account repository.
//!
//! A linked account is the (project, app, external user) tuple carrying
//! credentials. Creation enforces the scheme invariant against the app
//! configuration; listing is cursor-paginated.

use super::cursor::{decode_cursor, encode_cursor};
use super::{CatalogStore, corrupt, fmt_ts, is_unique_violation, parse_json, parse_opt_ts, parse_ts, parse_uuid};
use crate::error::StoreError;
use crate::types::{LinkedAccount, SecurityScheme};
use chrono::{DateTime, Utc};
use rusqlite::Row;
use rusqlite::types::Value as SqlValue;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

const LINKED_ACCOUNT_COLUMNS: &str = "la.id, la.project_id, la.app_id, \
     la.linked_account_owner_id, la.security_scheme, la.security_credentials, la.enabled, \
     la.last_used_at, la.created_at";

/// One page of linked accounts plus the follow-up cursor, present iff a
/// further page exists.
#[derive(Debug)]
pub struct LinkedAccountPage {
    pub accounts: Vec<LinkedAccount>,
    pub next_cursor: Option<String>,
}

fn account_from_row(row: &Row<'_>) -> Result<LinkedAccount, StoreError> {
    let id: String = row.get("id")?;
    let project_id: String = row.get("project_id")?;
    let app_id: String = row.get("app_id")?;
    let scheme: String = row.get("security_scheme")?;
    let credentials: String = row.get("security_credentials")?;
    let last_used_at: Option<String> = row.get("last_used_at")?;
    let created_at: String = row.get("created_at")?;
    Ok(LinkedAccount {
        id: parse_uuid("linked_accounts.id", &id)?,
        project_id: parse_uuid("linked_accounts.project_id", &project_id)?,
        app_id: parse_uuid("linked_accounts.app_id", &app_id)?,
        linked_account_owner_id: row.get("linked_account_owner_id")?,
        security_scheme: SecurityScheme::parse(&scheme)
            .ok_or_else(|| corrupt("linked_accounts.security_scheme", scheme.clone()))?,
        security_credentials: parse_json("linked_accounts.security_credentials", &credentials)?,
        enabled: row.get("enabled")?,
        last_used_at: parse_opt_ts("linked_accounts.last_used_at", last_used_at)?,
        created_at: parse_ts("linked_accounts.created_at", &created_at)?,
    })
}

impl CatalogStore {
    /// Create a linked account. The scheme must match the project's app
    /// configuration; the (project, app, owner) tuple must be new.
    pub fn create_linked_account(
        &self,
        project_id: Uuid,
        app_name: &str,
        linked_account_owner_id: &str,
        security_scheme: SecurityScheme,
        security_credentials: Value,
        enabled: bool,
    ) -> Result<LinkedAccount, StoreError> {
        let configuration = self
            .get_app_configuration(project_id, app_name)?
            .ok_or_else(|| StoreError::NotFound {
                kind: "AppConfiguration",
                name: app_name.to_string(),
            })?;
        if configuration.security_scheme != security_scheme {
            return Err(StoreError::SchemeMismatch {
                configured: configuration.security_scheme.as_str().into(),
                given: security_scheme.as_str().into(),
            });
        }

        let account = LinkedAccount {
            id: Uuid::new_v4(),
            project_id,
            app_id: configuration.app_id,
            linked_account_owner_id: linked_account_owner_id.into(),
            security_scheme,
            security_credentials,
            enabled,
            last_used_at: None,
            created_at: Utc::now(),
        };
        let result = self.conn().execute(
            "INSERT INTO linked_accounts (id, project_id, app_id, linked_account_owner_id, \
             security_scheme, security_credentials, enabled, last_used_at, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8)",
            rusqlite::params![
                account.id.to_string(),
                account.project_id.to_string(),
                account.app_id.to_string(),
                account.linked_account_owner_id,
                account.security_scheme.as_str(),
                serde_json::to_string(&account.security_credentials)?,
                account.enabled,
                fmt_ts(account.created_at),
            ],
        );
        match result {
            Ok(_) => Ok(account),
            Err(e) if is_unique_violation(&e) => Err(StoreError::AlreadyExists {
                kind: "LinkedAccount",
                name: format!("{app_name}/{linked_account_owner_id}"),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch a linked account by its (project, app, owner) tuple.
    pub fn get_linked_account(
        &self,
        project_id: Uuid,
        app_name: &str,
        linked_account_owner_id: &str,
    ) -> Result<Option<LinkedAccount>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {LINKED_ACCOUNT_COLUMNS} FROM linked_accounts la \
             JOIN apps a ON la.app_id = a.id \
             WHERE la.project_id = ?1 AND a.name = ?2 AND la.linked_account_owner_id = ?3"
        ))?;
        let mut rows = stmt.query_and_then(
            rusqlite::params![project_id.to_string(), app_name, linked_account_owner_id],
            account_from_row,
        )?;
        rows.next().transpose()
    }

    pub fn get_linked_account_by_id(&self, id: Uuid) -> Result<Option<LinkedAccount>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {LINKED_ACCOUNT_COLUMNS} FROM linked_accounts la WHERE la.id = ?1"
        ))?;
        let mut rows = stmt.query_and_then([id.to_string()], account_from_row)?;
        rows.next().transpose()
    }

    /// Cursor-paginated listing, newest first. A malformed cursor behaves
    /// as if none was supplied.
    pub fn list_linked_accounts(
        &self,
        project_id: Uuid,
        app_name: Option<&str>,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<LinkedAccountPage, StoreError> {
        let position = cursor.and_then(|c| {
            let decoded = decode_cursor(c);
            if decoded.is_none() {
                warn!(cursor = c, "malformed pagination cursor ignored");
            }
            decoded
        });

        let mut sql = format!(
            "SELECT {LINKED_ACCOUNT_COLUMNS} FROM linked_accounts la \
             JOIN apps a ON la.app_id = a.id WHERE la.project_id = ?1"
        );
        let mut params: Vec<SqlValue> = vec![SqlValue::Text(project_id.to_string())];
        if let Some(app_name) = app_name {
            params.push(SqlValue::Text(app_name.into()));
            sql.push_str(&format!(" AND a.name = ?{}", params.len()));
        }
        if let Some((created_at, id)) = position {
            params.push(SqlValue::Text(fmt_ts(created_at)));
            let ts_idx = params.len();
            params.push(SqlValue::Text(id.to_string()));
            let id_idx = params.len();
            sql.push_str(&format!(
                " AND (la.created_at < ?{ts_idx} OR \
                 (la.created_at = ?{ts_idx} AND la.id < ?{id_idx}))"
            ));
        }
        // Probe one row beyond the page to decide whether to emit a cursor.
        sql.push_str(&format!(
            " ORDER BY la.created_at DESC, la.id DESC LIMIT {}",
            limit as i64 + 1
        ));

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_and_then(rusqlite::params_from_iter(params), account_from_row)?;
        let mut accounts: Vec<LinkedAccount> = rows.collect::<Result<_, _>>()?;

        let next_cursor = if accounts.len() > limit {
            accounts.truncate(limit);
            accounts
                .last()
                .map(|last| encode_cursor(last.created_at, last.id))
        } else {
            None
        };
        Ok(LinkedAccountPage {
            accounts,
            next_cursor,
        })
    }

    /// Swap in refreshed or re-linked credentials.
    pub fn update_linked_account_credentials(
        &self,
        id: Uuid,
        security_credentials: &Value,
    ) -> Result<(), StoreError> {
        let updated = self.conn().execute(
            "UPDATE linked_accounts SET security_credentials = ?2 WHERE id = ?1",
            rusqlite::params![id.to_string(), serde_json::to_string(security_credentials)?],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                kind: "LinkedAccount",
                name: id.to_string(),
            });
        }
        Ok(())
    }

    pub fn set_linked_account_enabled(&self, id: Uuid, enabled: bool) -> Result<(), StoreError> {
        let updated = self.conn().execute(
            "UPDATE linked_accounts SET enabled = ?2 WHERE id = ?1",
            rusqlite::params![id.to_string(), enabled],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                kind: "LinkedAccount",
                name: id.to_string(),
            });
        }
        Ok(())
    }

    pub fn update_linked_account_last_used_at(
        &self,
        id: Uuid,
        last_used_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE linked_accounts SET last_used_at = ?2 WHERE id = ?1",
            rusqlite::params![id.to_string(), fmt_ts(last_used_at)],
        )?;
        Ok(())
    }

    pub fn delete_linked_account(&self, id: Uuid) -> Result<bool, StoreError> {
        let deleted = self.conn().execute(
            "DELETE FROM linked_accounts WHERE id = ?1",
            [id.to_string()],
        )?;
        Ok(deleted > 0)
    }

    /// Whether the owner id already appears anywhere in the organization.
    pub fn linked_account_owner_exists_in_org(
        &self,
        org_id: Uuid,
        linked_account_owner_id: &str,
    ) -> Result<bool, StoreError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM linked_accounts la \
             JOIN projects p ON la.project_id = p.id \
             WHERE p.org_id = ?1 AND la.linked_account_owner_id = ?2",
            rusqlite::params![org_id.to_string(), linked_account_owner_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Count distinct linked-account owners in an organization. Racy under
    /// concurrent linking; quota checks must treat this as a lower bound.
    pub fn count_unique_linked_account_owners(&self, org_id: Uuid) -> Result<i64, StoreError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(DISTINCT la.linked_account_owner_id) FROM linked_accounts la \
             JOIN projects p ON la.project_id = p.id WHERE p.org_id = ?1",
            [org_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::super::apps::tests::{gmail_manifest, simple_manifest};
    use super::super::projects::tests::seed_project_agent;
    use super::*;
    use crate::types::Project;
    use serde_json::json;

    pub(crate) fn seed_linked_account(store: &CatalogStore) -> (Project, LinkedAccount) {
        let (project, _) = seed_project_agent(store);
        store.create_app(&gmail_manifest(), vec![]).unwrap();
        store
            .create_app_configuration(project.id, "GMAIL", SecurityScheme::OAuth2, json!({}))
            .unwrap();
        let account = store
            .create_linked_account(
                project.id,
                "GMAIL",
                "u1",
                SecurityScheme::OAuth2,
                json!({"access_token": "tok"}),
                true,
            )
            .unwrap();
        (project, account)
    }

    #[test]
    fn test_create_get_roundtrip() {
        let store = CatalogStore::open_in_memory().unwrap();
        let (project, account) = seed_linked_account(&store);
        let fetched = store
            .get_linked_account(project.id, "GMAIL", "u1")
            .unwrap()
            .unwrap();
        assert_eq!(fetched.id, account.id);
        assert_eq!(fetched.security_credentials["access_token"], "tok");
    }

    #[test]
    fn test_scheme_invariant_enforced_at_write() {
        let store = CatalogStore::open_in_memory().unwrap();
        let (project, _) = seed_linked_account(&store);
        let err = store
            .create_linked_account(
                project.id,
                "GMAIL",
                "u2",
                SecurityScheme::ApiKey,
                json!({"secret_key": "sk"}),
                true,
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::SchemeMismatch { .. }));
    }

    #[test]
    fn test_relink_conflict() {
        let store = CatalogStore::open_in_memory().unwrap();
        let (project, _) = seed_linked_account(&store);
        let err = store
            .create_linked_account(
                project.id,
                "GMAIL",
                "u1",
                SecurityScheme::OAuth2,
                json!({}),
                true,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::AlreadyExists {
                kind: "LinkedAccount",
                ..
            }
        ));
    }

    #[test]
    fn test_cursor_pagination_covers_all_rows_once() {
        let store = CatalogStore::open_in_memory().unwrap();
        let (project, _) = seed_project_agent(&store);
        store.create_app(&simple_manifest("SLACK"), vec![]).unwrap();
        store
            .create_app_configuration(project.id, "SLACK", SecurityScheme::ApiKey, json!({}))
            .unwrap();
        for i in 0..7 {
            store
                .create_linked_account(
                    project.id,
                    "SLACK",
                    &format!("user-{i}"),
                    SecurityScheme::ApiKey,
                    json!({"secret_key": "sk"}),
                    true,
                )
                .unwrap();
        }

        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = store
                .list_linked_accounts(project.id, None, cursor.as_deref(), 3)
                .unwrap();
            seen.extend(page.accounts.iter().map(|a| a.id));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(seen.len(), 7);
        let unique: std::collections::HashSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), 7);

        // Same set and order as one unpaginated scan.
        let all = store
            .list_linked_accounts(project.id, None, None, 100)
            .unwrap();
        assert!(all.next_cursor.is_none());
        let all_ids: Vec<_> = all.accounts.iter().map(|a| a.id).collect();
        assert_eq!(seen, all_ids);
    }

    #[test]
    fn test_malformed_cursor_treated_as_first_page() {
        let store = CatalogStore::open_in_memory().unwrap();
        let (project, _) = seed_linked_account(&store);
        let page = store
            .list_linked_accounts(project.id, None, Some("!!not-a-cursor!!"), 10)
            .unwrap();
        assert_eq!(page.accounts.len(), 1);
    }

    #[test]
    fn test_owner_exists_and_unique_count() {
        let store = CatalogStore::open_in_memory().unwrap();
        let (project, _) = seed_linked_account(&store);
        let org_id = store.get_project(project.id).unwrap().unwrap().org_id;
        assert!(
            store
                .linked_account_owner_exists_in_org(org_id, "u1")
                .unwrap()
        );
        assert!(
            !store
                .linked_account_owner_exists_in_org(org_id, "u9")
                .unwrap()
        );
        assert_eq!(store.count_unique_linked_account_owners(org_id).unwrap(), 1);
    }

    #[test]
    fn test_credential_and_enabled_updates() {
        let store = CatalogStore::open_in_memory().unwrap();
        let (project, account) = seed_linked_account(&store);
        store
            .update_linked_account_credentials(account.id, &json!({"access_token": "rotated"}))
            .unwrap();
        store.set_linked_account_enabled(account.id, false).unwrap();
        store
            .update_linked_account_last_used_at(account.id, Utc::now())
            .unwrap();

        let fetched = store
            .get_linked_account(project.id, "GMAIL", "u1")
            .unwrap()
            .unwrap();
        assert_eq!(fetched.security_credentials["access_token"], "rotated");
        assert!(!fetched.enabled);
        assert!(fetched.last_used_at.is_some());
    }
}
