//! App repository.

use super::{
    CatalogStore, blob_to_embedding, corrupt, embedding_to_blob, fmt_ts, is_unique_violation,
    parse_ts, parse_uuid,
};
use crate::error::StoreError;
use crate::manifest::AppManifest;
use crate::types::{App, SecurityScheme, SecuritySchemes, Visibility};
use chrono::Utc;
use rusqlite::Row;
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

const APP_COLUMNS: &str = "id, name, display_name, description, provider, categories, \
     visibility, active, embedding, security_schemes, default_security_credentials, \
     created_at, updated_at";

pub(super) fn app_from_row(row: &Row<'_>) -> Result<App, StoreError> {
    let id: String = row.get("id")?;
    let visibility: String = row.get("visibility")?;
    let categories: String = row.get("categories")?;
    let schemes: String = row.get("security_schemes")?;
    let defaults: String = row.get("default_security_credentials")?;
    let embedding: Vec<u8> = row.get("embedding")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(App {
        id: parse_uuid("apps.id", &id)?,
        name: row.get("name")?,
        display_name: row.get("display_name")?,
        description: row.get("description")?,
        provider: row.get("provider")?,
        categories: serde_json::from_str(&categories)
            .map_err(|e| corrupt("apps.categories", e.to_string()))?,
        visibility: Visibility::parse(&visibility)
            .ok_or_else(|| corrupt("apps.visibility", visibility.clone()))?,
        active: row.get("active")?,
        embedding: blob_to_embedding(&embedding),
        security_schemes: serde_json::from_str::<SecuritySchemes>(&schemes)
            .map_err(|e| corrupt("apps.security_schemes", e.to_string()))?,
        default_security_credentials: serde_json::from_str::<HashMap<SecurityScheme, Value>>(
            &defaults,
        )
        .map_err(|e| corrupt("apps.default_security_credentials", e.to_string()))?,
        created_at: parse_ts("apps.created_at", &created_at)?,
        updated_at: parse_ts("apps.updated_at", &updated_at)?,
    })
}

impl CatalogStore {
    /// Create an app from its manifest and a freshly generated embedding.
    pub fn create_app(
        &self,
        manifest: &AppManifest,
        embedding: Vec<f32>,
    ) -> Result<App, StoreError> {
        let now = Utc::now();
        let app = App {
            id: Uuid::new_v4(),
            name: manifest.name.clone(),
            display_name: manifest.display_name.clone(),
            description: manifest.description.clone(),
            provider: manifest.provider.clone(),
            categories: manifest.categories.clone(),
            visibility: manifest.visibility,
            active: true,
            embedding,
            security_schemes: manifest.security_schemes.clone(),
            default_security_credentials: manifest
                .default_security_credentials_by_scheme
                .clone()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| corrupt("apps.default_security_credentials", e.to_string()))?
                .unwrap_or_default(),
            created_at: now,
            updated_at: now,
        };

        let result = self.conn().execute(
            "INSERT INTO apps (id, name, display_name, description, provider, categories, \
             visibility, active, embedding, security_schemes, default_security_credentials, \
             created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            rusqlite::params![
                app.id.to_string(),
                app.name,
                app.display_name,
                app.description,
                app.provider,
                serde_json::to_string(&app.categories)?,
                app.visibility.as_str(),
                app.active,
                embedding_to_blob(&app.embedding),
                serde_json::to_string(&app.security_schemes)?,
                serde_json::to_string(&app.default_security_credentials)?,
                fmt_ts(app.created_at),
                fmt_ts(app.updated_at),
            ],
        );
        match result {
            Ok(_) => Ok(app),
            Err(e) if is_unique_violation(&e) => Err(StoreError::AlreadyExists {
                kind: "App",
                name: app.name,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Look up an app by name, optionally restricted to public/active rows.
    pub fn get_app(
        &self,
        name: &str,
        public_only: bool,
        active_only: bool,
    ) -> Result<Option<App>, StoreError> {
        let mut sql = format!("SELECT {APP_COLUMNS} FROM apps WHERE name = ?1");
        if public_only {
            sql.push_str(" AND visibility = 'PUBLIC'");
        }
        if active_only {
            sql.push_str(" AND active = 1");
        }
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_and_then([name], app_from_row)?;
        rows.next().transpose()
    }

    pub fn get_app_by_id(&self, id: Uuid) -> Result<Option<App>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {APP_COLUMNS} FROM apps WHERE id = ?1"))?;
        let mut rows = stmt.query_and_then([id.to_string()], app_from_row)?;
        rows.next().transpose()
    }

    /// List apps sorted by name.
    pub fn list_apps(
        &self,
        public_only: bool,
        active_only: bool,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<App>, StoreError> {
        let mut sql = format!("SELECT {APP_COLUMNS} FROM apps WHERE 1 = 1");
        if public_only {
            sql.push_str(" AND visibility = 'PUBLIC'");
        }
        if active_only {
            sql.push_str(" AND active = 1");
        }
        sql.push_str(" ORDER BY name LIMIT ?1 OFFSET ?2");
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_and_then(
            rusqlite::params![limit as i64, offset as i64],
            app_from_row,
        )?;
        rows.collect()
    }

    /// Update an app's mutable fields together with its regenerated
    /// embedding. The name is immutable; callers must have rebuilt the
    /// vector whenever a contributing field changed.
    pub fn update_app(&self, app: &App) -> Result<(), StoreError> {
        let updated = self.conn().execute(
            "UPDATE apps SET display_name = ?2, description = ?3, provider = ?4, \
             categories = ?5, visibility = ?6, active = ?7, embedding = ?8, \
             security_schemes = ?9, default_security_credentials = ?10, updated_at = ?11 \
             WHERE id = ?1",
            rusqlite::params![
                app.id.to_string(),
                app.display_name,
                app.description,
                app.provider,
                serde_json::to_string(&app.categories)?,
                app.visibility.as_str(),
                app.active,
                embedding_to_blob(&app.embedding),
                serde_json::to_string(&app.security_schemes)?,
                serde_json::to_string(&app.default_security_credentials)?,
                fmt_ts(Utc::now()),
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                kind: "App",
                name: app.name.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{ApiKeySchemeConfig, HttpLocation, NoAuthSchemeConfig};

    pub(crate) fn gmail_manifest() -> AppManifest {
        AppManifest {
            name: "GMAIL".into(),
            display_name: "Gmail".into(),
            description: "Google email service".into(),
            provider: "google".into(),
            categories: vec!["email".into()],
            logo: None,
            visibility: Visibility::Public,
            security_schemes: SecuritySchemes {
                oauth2: Some(crate::types::OAuth2SchemeConfig {
                    client_id: "cid".into(),
                    client_secret: "csecret".into(),
                    scope: "https://mail.google.com/".into(),
                    authorize_url: "https://accounts.google.com/o/oauth2/v2/auth".into(),
                    access_token_url: "https://oauth2.googleapis.com/token".into(),
                    refresh_token_url: "https://oauth2.googleapis.com/token".into(),
                    token_endpoint_auth_method: None,
                    location: HttpLocation::Header,
                    name: "Authorization".into(),
                    prefix: Some("Bearer".into()),
                    additional_headers: None,
                    redirect_url: None,
                }),
                ..Default::default()
            },
            default_security_credentials_by_scheme: None,
        }
    }

    pub(crate) fn simple_manifest(name: &str) -> AppManifest {
        AppManifest {
            name: name.into(),
            display_name: name.to_lowercase(),
            description: format!("{name} integration"),
            provider: name.to_lowercase(),
            categories: vec![],
            logo: None,
            visibility: Visibility::Public,
            security_schemes: SecuritySchemes {
                api_key: Some(ApiKeySchemeConfig {
                    location: HttpLocation::Header,
                    name: "X-Api-Key".into(),
                    prefix: None,
                }),
                no_auth: Some(NoAuthSchemeConfig {}),
                ..Default::default()
            },
            default_security_credentials_by_scheme: None,
        }
    }

    #[test]
    fn test_create_and_get_app() {
        let store = CatalogStore::open_in_memory().unwrap();
        let created = store
            .create_app(&gmail_manifest(), vec![0.5, 0.25])
            .unwrap();
        let fetched = store.get_app("GMAIL", false, false).unwrap().unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.embedding, vec![0.5, 0.25]);
        assert!(fetched.security_schemes.oauth2.is_some());
    }

    #[test]
    fn test_duplicate_app_name_rejected() {
        let store = CatalogStore::open_in_memory().unwrap();
        store.create_app(&gmail_manifest(), vec![]).unwrap();
        let err = store.create_app(&gmail_manifest(), vec![]).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { kind: "App", .. }));
    }

    #[test]
    fn test_public_only_filter() {
        let store = CatalogStore::open_in_memory().unwrap();
        let mut manifest = gmail_manifest();
        manifest.visibility = Visibility::Private;
        store.create_app(&manifest, vec![]).unwrap();

        assert!(store.get_app("GMAIL", true, false).unwrap().is_none());
        assert!(store.get_app("GMAIL", false, false).unwrap().is_some());
    }

    #[test]
    fn test_update_app_regenerates_embedding() {
        let store = CatalogStore::open_in_memory().unwrap();
        let mut app = store.create_app(&gmail_manifest(), vec![1.0]).unwrap();
        app.description = "Google mail".into();
        app.embedding = vec![0.0, 1.0];
        store.update_app(&app).unwrap();

        let fetched = store.get_app("GMAIL", false, false).unwrap().unwrap();
        assert_eq!(fetched.description, "Google mail");
        assert_eq!(fetched.embedding, vec![0.0, 1.0]);
        assert!(fetched.updated_at >= fetched.created_at);
    }
}
