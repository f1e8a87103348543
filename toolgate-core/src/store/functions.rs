//! Function repository, including the search candidate query.

use super::{
    CatalogStore, blob_to_embedding, corrupt, embedding_to_blob, fmt_ts, is_unique_violation,
    parse_json, parse_ts, parse_uuid,
};
use crate::embeddings::cosine_distance;
use crate::error::StoreError;
use crate::manifest::FunctionManifest;
use crate::types::{Function, Protocol, Visibility};
use chrono::Utc;
use rusqlite::Row;
use rusqlite::types::Value as SqlValue;
use uuid::Uuid;

const FUNCTION_COLUMNS: &str = "f.id, f.app_id, f.name, f.description, f.parameters, \
     f.protocol, f.protocol_data, f.visibility, f.active, f.embedding, f.created_at, \
     f.updated_at";

/// Parameters of a function search against the store.
#[derive(Debug, Clone, Default)]
pub struct FunctionQuery {
    pub public_only: bool,
    pub active_only: bool,
    /// Restrict to functions of these apps (by app name).
    pub app_names: Option<Vec<String>>,
    /// Intent embedding; when present, results are ordered by ascending
    /// cosine distance.
    pub intent_embedding: Option<Vec<f32>>,
    /// Raw intent text for the lexical candidate pruner.
    pub intent_text: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

pub(super) fn function_from_row(row: &Row<'_>) -> Result<Function, StoreError> {
    let id: String = row.get("id")?;
    let app_id: String = row.get("app_id")?;
    let parameters: String = row.get("parameters")?;
    let protocol: String = row.get("protocol")?;
    let protocol_data: String = row.get("protocol_data")?;
    let visibility: String = row.get("visibility")?;
    let embedding: Vec<u8> = row.get("embedding")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Function {
        id: parse_uuid("functions.id", &id)?,
        app_id: parse_uuid("functions.app_id", &app_id)?,
        name: row.get("name")?,
        description: row.get("description")?,
        parameters: parse_json("functions.parameters", &parameters)?,
        protocol: Protocol::parse(&protocol)
            .ok_or_else(|| corrupt("functions.protocol", protocol.clone()))?,
        protocol_data: parse_json("functions.protocol_data", &protocol_data)?,
        visibility: Visibility::parse(&visibility)
            .ok_or_else(|| corrupt("functions.visibility", visibility.clone()))?,
        active: row.get("active")?,
        embedding: blob_to_embedding(&embedding),
        created_at: parse_ts("functions.created_at", &created_at)?,
        updated_at: parse_ts("functions.updated_at", &updated_at)?,
    })
}

/// Sanitize an intent and pick the lexical prune token: allow
/// `[A-Za-z0-9_\-.\s]`, split on whitespace, drop tokens of length <= 3,
/// keep up to 3, and use the first.
fn lexical_prune_token(intent: &str) -> Option<String> {
    if intent.trim().len() <= 2 {
        return None;
    }
    let clean: String = intent
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') || c.is_whitespace())
        .collect();
    let terms: Vec<String> = clean
        .split_whitespace()
        .filter(|t| t.len() > 3)
        .take(3)
        .map(|t| t.to_lowercase())
        .collect();
    terms.into_iter().next().filter(|t| !t.is_empty())
}

impl CatalogStore {
    /// Create a function from its manifest and a freshly generated embedding.
    /// The name prefix must match an existing app.
    pub fn create_function(
        &self,
        manifest: &FunctionManifest,
        embedding: Vec<f32>,
    ) -> Result<Function, StoreError> {
        let app_name = manifest
            .name
            .split_once("__")
            .map(|(app, _)| app)
            .unwrap_or(&manifest.name);
        let app = self
            .get_app(app_name, false, false)?
            .ok_or_else(|| StoreError::NotFound {
                kind: "App",
                name: app_name.to_string(),
            })?;

        let now = Utc::now();
        let function = Function {
            id: Uuid::new_v4(),
            app_id: app.id,
            name: manifest.name.clone(),
            description: manifest.description.clone(),
            parameters: manifest.parameters.clone(),
            protocol: manifest.protocol,
            protocol_data: manifest.protocol_data.clone(),
            visibility: manifest.visibility,
            active: manifest.active,
            embedding,
            created_at: now,
            updated_at: now,
        };

        let result = self.conn().execute(
            "INSERT INTO functions (id, app_id, name, description, parameters, protocol, \
             protocol_data, visibility, active, embedding, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            rusqlite::params![
                function.id.to_string(),
                function.app_id.to_string(),
                function.name,
                function.description,
                serde_json::to_string(&function.parameters)?,
                function.protocol.as_str(),
                serde_json::to_string(&function.protocol_data)?,
                function.visibility.as_str(),
                function.active,
                embedding_to_blob(&function.embedding),
                fmt_ts(function.created_at),
                fmt_ts(function.updated_at),
            ],
        );
        match result {
            Ok(_) => Ok(function),
            Err(e) if is_unique_violation(&e) => Err(StoreError::AlreadyExists {
                kind: "Function",
                name: function.name,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Look up a function by name with the same access filters as search.
    pub fn get_function(
        &self,
        name: &str,
        public_only: bool,
        active_only: bool,
    ) -> Result<Option<Function>, StoreError> {
        let mut sql = format!(
            "SELECT {FUNCTION_COLUMNS} FROM functions f \
             JOIN apps a ON f.app_id = a.id WHERE f.name = ?1"
        );
        if active_only {
            sql.push_str(" AND a.active = 1 AND f.active = 1");
        }
        if public_only {
            sql.push_str(" AND a.visibility = 'PUBLIC' AND f.visibility = 'PUBLIC'");
        }
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_and_then([name], function_from_row)?;
        rows.next().transpose()
    }

    /// List functions sorted by name.
    pub fn list_functions(
        &self,
        public_only: bool,
        active_only: bool,
        app_names: Option<&[String]>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Function>, StoreError> {
        let mut sql = format!(
            "SELECT {FUNCTION_COLUMNS} FROM functions f \
             JOIN apps a ON f.app_id = a.id WHERE 1 = 1"
        );
        let mut params: Vec<SqlValue> = Vec::new();
        if active_only {
            sql.push_str(" AND a.active = 1 AND f.active = 1");
        }
        if public_only {
            sql.push_str(" AND a.visibility = 'PUBLIC' AND f.visibility = 'PUBLIC'");
        }
        push_app_filter(&mut sql, &mut params, app_names);
        sql.push_str(" ORDER BY f.name");
        sql.push_str(&format!(
            " LIMIT {} OFFSET {}",
            limit as i64, offset as i64
        ));

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_and_then(rusqlite::params_from_iter(params), function_from_row)?;
        rows.collect()
    }

    /// Search functions: access filter, app filter, lexical prune, then
    /// cosine ordering when an intent embedding is present. The lexical
    /// filter is a cheap candidate pruner, not the ranker.
    pub fn search_functions(&self, query: &FunctionQuery) -> Result<Vec<Function>, StoreError> {
        let mut sql = format!(
            "SELECT {FUNCTION_COLUMNS} FROM functions f \
             JOIN apps a ON f.app_id = a.id WHERE 1 = 1"
        );
        let mut params: Vec<SqlValue> = Vec::new();
        if query.active_only {
            sql.push_str(" AND a.active = 1 AND f.active = 1");
        }
        if query.public_only {
            sql.push_str(" AND a.visibility = 'PUBLIC' AND f.visibility = 'PUBLIC'");
        }
        push_app_filter(&mut sql, &mut params, query.app_names.as_deref());

        if let Some(token) = query.intent_text.as_deref().and_then(lexical_prune_token) {
            // SQLite LIKE is ASCII case-insensitive, matching the ILIKE prune.
            sql.push_str(
                " AND (f.name LIKE ?x OR f.description LIKE ?x OR a.name LIKE ?x)"
                    .replace("?x", &format!("?{}", params.len() + 1))
                    .as_str(),
            );
            params.push(SqlValue::Text(format!("%{token}%")));
        }

        match &query.intent_embedding {
            Some(intent) => {
                // Rank in process; the SQL filters bound the candidate set.
                let conn = self.conn();
                let mut stmt = conn.prepare(&sql)?;
                let rows =
                    stmt.query_and_then(rusqlite::params_from_iter(params), function_from_row)?;
                let mut candidates: Vec<(f32, Function)> = rows
                    .map(|r| r.map(|f| (cosine_distance(intent, &f.embedding), f)))
                    .collect::<Result<_, _>>()?;
                candidates.sort_by(|a, b| {
                    a.0.partial_cmp(&b.0)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.1.name.cmp(&b.1.name))
                });
                Ok(candidates
                    .into_iter()
                    .skip(query.offset)
                    .take(query.limit)
                    .map(|(_, f)| f)
                    .collect())
            }
            None => {
                sql.push_str(" ORDER BY f.name");
                sql.push_str(&format!(
                    " LIMIT {} OFFSET {}",
                    query.limit as i64, query.offset as i64
                ));
                let conn = self.conn();
                let mut stmt = conn.prepare(&sql)?;
                let rows =
                    stmt.query_and_then(rusqlite::params_from_iter(params), function_from_row)?;
                rows.collect()
            }
        }
    }

    /// Update a function's mutable fields together with its regenerated
    /// embedding.
    pub fn update_function(&self, function: &Function) -> Result<(), StoreError> {
        let updated = self.conn().execute(
            "UPDATE functions SET description = ?2, parameters = ?3, protocol_data = ?4, \
             visibility = ?5, active = ?6, embedding = ?7, updated_at = ?8 WHERE id = ?1",
            rusqlite::params![
                function.id.to_string(),
                function.description,
                serde_json::to_string(&function.parameters)?,
                serde_json::to_string(&function.protocol_data)?,
                function.visibility.as_str(),
                function.active,
                embedding_to_blob(&function.embedding),
                fmt_ts(Utc::now()),
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                kind: "Function",
                name: function.name.clone(),
            });
        }
        Ok(())
    }
}

fn push_app_filter(sql: &mut String, params: &mut Vec<SqlValue>, app_names: Option<&[String]>) {
    if let Some(names) = app_names {
        let placeholders: Vec<String> = names
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", params.len() + i + 1))
            .collect();
        sql.push_str(&format!(" AND a.name IN ({})", placeholders.join(", ")));
        for name in names {
            params.push(SqlValue::Text(name.clone()));
        }
    }
}
