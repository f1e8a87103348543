//! Project and agent repositories.

use super::{CatalogStore, corrupt, fmt_ts, parse_ts, parse_uuid};
use crate::error::StoreError;
use crate::types::{Agent, Project, Visibility};
use chrono::Utc;
use rusqlite::Row;
use std::collections::HashMap;
use uuid::Uuid;

fn project_from_row(row: &Row<'_>) -> Result<Project, StoreError> {
    let id: String = row.get("id")?;
    let org_id: String = row.get("org_id")?;
    let visibility: String = row.get("visibility_access")?;
    let created_at: String = row.get("created_at")?;
    Ok(Project {
        id: parse_uuid("projects.id", &id)?,
        org_id: parse_uuid("projects.org_id", &org_id)?,
        name: row.get("name")?,
        visibility_access: Visibility::parse(&visibility)
            .ok_or_else(|| corrupt("projects.visibility_access", visibility.clone()))?,
        created_at: parse_ts("projects.created_at", &created_at)?,
    })
}

fn agent_from_row(row: &Row<'_>) -> Result<Agent, StoreError> {
    let id: String = row.get("id")?;
    let project_id: String = row.get("project_id")?;
    let allowed_apps: String = row.get("allowed_apps")?;
    let custom_instructions: String = row.get("custom_instructions")?;
    let created_at: String = row.get("created_at")?;
    Ok(Agent {
        id: parse_uuid("agents.id", &id)?,
        project_id: parse_uuid("agents.project_id", &project_id)?,
        name: row.get("name")?,
        api_key: row.get("api_key")?,
        allowed_apps: serde_json::from_str(&allowed_apps)
            .map_err(|e| corrupt("agents.allowed_apps", e.to_string()))?,
        custom_instructions: serde_json::from_str::<HashMap<String, String>>(&custom_instructions)
            .map_err(|e| corrupt("agents.custom_instructions", e.to_string()))?,
        created_at: parse_ts("agents.created_at", &created_at)?,
    })
}

impl CatalogStore {
    pub fn create_project(
        &self,
        org_id: Uuid,
        name: &str,
        visibility_access: Visibility,
    ) -> Result<Project, StoreError> {
        let project = Project {
            id: Uuid::new_v4(),
            org_id,
            name: name.into(),
            visibility_access,
            created_at: Utc::now(),
        };
        self.conn().execute(
            "INSERT INTO projects (id, org_id, name, visibility_access, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                project.id.to_string(),
                project.org_id.to_string(),
                project.name,
                project.visibility_access.as_str(),
                fmt_ts(project.created_at),
            ],
        )?;
        Ok(project)
    }

    pub fn get_project(&self, id: Uuid) -> Result<Option<Project>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, org_id, name, visibility_access, created_at FROM projects WHERE id = ?1",
        )?;
        let mut rows = stmt.query_and_then([id.to_string()], project_from_row)?;
        rows.next().transpose()
    }

    pub fn create_agent(
        &self,
        project_id: Uuid,
        name: &str,
        api_key: &str,
        allowed_apps: Vec<String>,
        custom_instructions: HashMap<String, String>,
    ) -> Result<Agent, StoreError> {
        let agent = Agent {
            id: Uuid::new_v4(),
            project_id,
            name: name.into(),
            api_key: api_key.into(),
            allowed_apps,
            custom_instructions,
            created_at: Utc::now(),
        };
        self.conn().execute(
            "INSERT INTO agents (id, project_id, name, api_key, allowed_apps, \
             custom_instructions, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                agent.id.to_string(),
                agent.project_id.to_string(),
                agent.name,
                agent.api_key,
                serde_json::to_string(&agent.allowed_apps)?,
                serde_json::to_string(&agent.custom_instructions)?,
                fmt_ts(agent.created_at),
            ],
        )?;
        Ok(agent)
    }

    /// Resolve an API key to its (project, agent) pair. The key is the sole
    /// authentication credential for the agent-facing API.
    pub fn get_agent_by_api_key(
        &self,
        api_key: &str,
    ) -> Result<Option<(Project, Agent)>, StoreError> {
        let agent = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT id, project_id, name, api_key, allowed_apps, custom_instructions, \
                 created_at FROM agents WHERE api_key = ?1",
            )?;
            let mut rows = stmt.query_and_then([api_key], agent_from_row)?;
            rows.next().transpose()?
        };
        let Some(agent) = agent else {
            return Ok(None);
        };
        let project = self
            .get_project(agent.project_id)?
            .ok_or_else(|| StoreError::NotFound {
                kind: "Project",
                name: agent.project_id.to_string(),
            })?;
        Ok(Some((project, agent)))
    }

    pub fn update_agent_allowed_apps(
        &self,
        agent_id: Uuid,
        allowed_apps: &[String],
    ) -> Result<(), StoreError> {
        let updated = self.conn().execute(
            "UPDATE agents SET allowed_apps = ?2 WHERE id = ?1",
            rusqlite::params![agent_id.to_string(), serde_json::to_string(allowed_apps)?],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                kind: "Agent",
                name: agent_id.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn seed_project_agent(store: &CatalogStore) -> (Project, Agent) {
        let project = store
            .create_project(Uuid::new_v4(), "Default Project", Visibility::Public)
            .unwrap();
        let agent = store
            .create_agent(
                project.id,
                "Default Agent",
                "tg_test_key",
                vec!["GMAIL".into()],
                HashMap::new(),
            )
            .unwrap();
        (project, agent)
    }

    #[test]
    fn test_agent_lookup_by_api_key() {
        let store = CatalogStore::open_in_memory().unwrap();
        let (project, agent) = seed_project_agent(&store);

        let (found_project, found_agent) =
            store.get_agent_by_api_key("tg_test_key").unwrap().unwrap();
        assert_eq!(found_project.id, project.id);
        assert_eq!(found_agent.id, agent.id);
        assert_eq!(found_agent.allowed_apps, vec!["GMAIL".to_string()]);

        assert!(store.get_agent_by_api_key("wrong").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_api_key_rejected() {
        let store = CatalogStore::open_in_memory().unwrap();
        let (project, _) = seed_project_agent(&store);
        let err = store
            .create_agent(project.id, "Another", "tg_test_key", vec![], HashMap::new())
            .unwrap_err();
        assert!(matches!(err, StoreError::Sqlite(_)));
    }

    #[test]
    fn test_update_allowed_apps() {
        let store = CatalogStore::open_in_memory().unwrap();
        let (_, agent) = seed_project_agent(&store);
        store
            .update_agent_allowed_apps(agent.id, &["GMAIL".into(), "SLACK".into()])
            .unwrap();
        let (_, updated) = store.get_agent_by_api_key("tg_test_key").unwrap().unwrap();
        assert_eq!(updated.allowed_apps.len(), 2);
    }
}
