//! App configuration repository.

use super::{CatalogStore, corrupt, fmt_ts, is_unique_violation, parse_json, parse_ts, parse_uuid};
use crate::error::StoreError;
use crate::types::{AppConfiguration, SecurityScheme};
use chrono::Utc;
use rusqlite::Row;
use serde_json::Value;
use uuid::Uuid;

fn configuration_from_row(row: &Row<'_>) -> Result<AppConfiguration, StoreError> {
    let id: String = row.get("id")?;
    let project_id: String = row.get("project_id")?;
    let app_id: String = row.get("app_id")?;
    let scheme: String = row.get("security_scheme")?;
    let overrides: String = row.get("scheme_overrides")?;
    let created_at: String = row.get("created_at")?;
    Ok(AppConfiguration {
        id: parse_uuid("app_configurations.id", &id)?,
        project_id: parse_uuid("app_configurations.project_id", &project_id)?,
        app_id: parse_uuid("app_configurations.app_id", &app_id)?,
        security_scheme: SecurityScheme::parse(&scheme)
            .ok_or_else(|| corrupt("app_configurations.security_scheme", scheme.clone()))?,
        enabled: row.get("enabled")?,
        scheme_overrides: parse_json("app_configurations.scheme_overrides", &overrides)?,
        created_at: parse_ts("app_configurations.created_at", &created_at)?,
    })
}

impl CatalogStore {
    /// Configure an app for a project. One configuration per (project, app).
    pub fn create_app_configuration(
        &self,
        project_id: Uuid,
        app_name: &str,
        security_scheme: SecurityScheme,
        scheme_overrides: Value,
    ) -> Result<AppConfiguration, StoreError> {
        let app = self
            .get_app(app_name, false, false)?
            .ok_or_else(|| StoreError::NotFound {
                kind: "App",
                name: app_name.to_string(),
            })?;
        if !app.security_schemes.supports(security_scheme) {
            return Err(StoreError::SchemeMismatch {
                configured: format!("none ({app_name} does not support it)"),
                given: security_scheme.as_str().into(),
            });
        }

        let configuration = AppConfiguration {
            id: Uuid::new_v4(),
            project_id,
            app_id: app.id,
            security_scheme,
            enabled: true,
            scheme_overrides,
            created_at: Utc::now(),
        };
        let result = self.conn().execute(
            "INSERT INTO app_configurations (id, project_id, app_id, security_scheme, \
             enabled, scheme_overrides, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                configuration.id.to_string(),
                configuration.project_id.to_string(),
                configuration.app_id.to_string(),
                configuration.security_scheme.as_str(),
                configuration.enabled,
                serde_json::to_string(&configuration.scheme_overrides)?,
                fmt_ts(configuration.created_at),
            ],
        );
        match result {
            Ok(_) => Ok(configuration),
            Err(e) if is_unique_violation(&e) => Err(StoreError::AlreadyExists {
                kind: "AppConfiguration",
                name: app_name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch the configuration a project holds for an app, by app name.
    pub fn get_app_configuration(
        &self,
        project_id: Uuid,
        app_name: &str,
    ) -> Result<Option<AppConfiguration>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT c.id, c.project_id, c.app_id, c.security_scheme, c.enabled, \
             c.scheme_overrides, c.created_at \
             FROM app_configurations c JOIN apps a ON c.app_id = a.id \
             WHERE c.project_id = ?1 AND a.name = ?2",
        )?;
        let mut rows = stmt.query_and_then(
            rusqlite::params![project_id.to_string(), app_name],
            configuration_from_row,
        )?;
        rows.next().transpose()
    }

    pub fn set_app_configuration_enabled(
        &self,
        configuration_id: Uuid,
        enabled: bool,
    ) -> Result<(), StoreError> {
        let updated = self.conn().execute(
            "UPDATE app_configurations SET enabled = ?2 WHERE id = ?1",
            rusqlite::params![configuration_id.to_string(), enabled],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                kind: "AppConfiguration",
                name: configuration_id.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::apps::tests::gmail_manifest;
    use super::super::projects::tests::seed_project_agent;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_configure_and_fetch() {
        let store = CatalogStore::open_in_memory().unwrap();
        let (project, _) = seed_project_agent(&store);
        store.create_app(&gmail_manifest(), vec![]).unwrap();

        let config = store
            .create_app_configuration(project.id, "GMAIL", SecurityScheme::OAuth2, json!({}))
            .unwrap();
        assert!(config.enabled);

        let fetched = store
            .get_app_configuration(project.id, "GMAIL")
            .unwrap()
            .unwrap();
        assert_eq!(fetched.id, config.id);
        assert_eq!(fetched.security_scheme, SecurityScheme::OAuth2);
    }

    #[test]
    fn test_unsupported_scheme_rejected() {
        let store = CatalogStore::open_in_memory().unwrap();
        let (project, _) = seed_project_agent(&store);
        store.create_app(&gmail_manifest(), vec![]).unwrap();

        let err = store
            .create_app_configuration(project.id, "GMAIL", SecurityScheme::ApiKey, json!({}))
            .unwrap_err();
        assert!(matches!(err, StoreError::SchemeMismatch { .. }));
    }

    #[test]
    fn test_one_configuration_per_project_app() {
        let store = CatalogStore::open_in_memory().unwrap();
        let (project, _) = seed_project_agent(&store);
        store.create_app(&gmail_manifest(), vec![]).unwrap();

        store
            .create_app_configuration(project.id, "GMAIL", SecurityScheme::OAuth2, json!({}))
            .unwrap();
        let err = store
            .create_app_configuration(project.id, "GMAIL", SecurityScheme::OAuth2, json!({}))
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[test]
    fn test_disable_configuration() {
        let store = CatalogStore::open_in_memory().unwrap();
        let (project, _) = seed_project_agent(&store);
        store.create_app(&gmail_manifest(), vec![]).unwrap();
        let config = store
            .create_app_configuration(project.id, "GMAIL", SecurityScheme::OAuth2, json!({}))
            .unwrap();

        store
            .set_app_configuration_enabled(config.id, false)
            .unwrap();
        let fetched = store
            .get_app_configuration(project.id, "GMAIL")
            .unwrap()
            .unwrap();
        assert!(!fetched.enabled);
    }
}
