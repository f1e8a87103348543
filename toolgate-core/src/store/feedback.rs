//! Function search feedback repository.

use super::{CatalogStore, corrupt, fmt_ts, parse_json, parse_ts, parse_uuid};
use crate::error::StoreError;
use crate::types::{FeedbackType, FunctionSearchFeedback};
use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde_json::Value;
use uuid::Uuid;

/// Fields of a feedback row supplied by the caller.
#[derive(Debug, Clone)]
pub struct NewSearchFeedback {
    pub intent: Option<String>,
    pub returned_function_names: Vec<String>,
    pub selected_function_name: Option<String>,
    pub was_helpful: bool,
    pub feedback_type: FeedbackType,
    pub feedback_comment: Option<String>,
    pub search_metadata: Value,
}

fn feedback_from_row(row: &Row<'_>) -> Result<FunctionSearchFeedback, StoreError> {
    let id: String = row.get("id")?;
    let agent_id: String = row.get("agent_id")?;
    let project_id: String = row.get("project_id")?;
    let names: String = row.get("returned_function_names")?;
    let feedback_type: String = row.get("feedback_type")?;
    let metadata: String = row.get("search_metadata")?;
    let created_at: String = row.get("created_at")?;
    Ok(FunctionSearchFeedback {
        id: parse_uuid("function_search_feedback.id", &id)?,
        agent_id: parse_uuid("function_search_feedback.agent_id", &agent_id)?,
        project_id: parse_uuid("function_search_feedback.project_id", &project_id)?,
        intent: row.get("intent")?,
        returned_function_names: serde_json::from_str(&names)
            .map_err(|e| corrupt("function_search_feedback.returned_function_names", e.to_string()))?,
        selected_function_name: row.get("selected_function_name")?,
        was_helpful: row.get("was_helpful")?,
        feedback_type: FeedbackType::parse(&feedback_type)
            .ok_or_else(|| corrupt("function_search_feedback.feedback_type", feedback_type.clone()))?,
        feedback_comment: row.get("feedback_comment")?,
        search_metadata: parse_json("function_search_feedback.search_metadata", &metadata)?,
        created_at: parse_ts("function_search_feedback.created_at", &created_at)?,
    })
}

impl CatalogStore {
    pub fn create_search_feedback(
        &self,
        agent_id: Uuid,
        project_id: Uuid,
        feedback: NewSearchFeedback,
    ) -> Result<FunctionSearchFeedback, StoreError> {
        let row = FunctionSearchFeedback {
            id: Uuid::new_v4(),
            agent_id,
            project_id,
            intent: feedback.intent,
            returned_function_names: feedback.returned_function_names,
            selected_function_name: feedback.selected_function_name,
            was_helpful: feedback.was_helpful,
            feedback_type: feedback.feedback_type,
            feedback_comment: feedback.feedback_comment,
            search_metadata: feedback.search_metadata,
            created_at: Utc::now(),
        };
        self.conn().execute(
            "INSERT INTO function_search_feedback (id, agent_id, project_id, intent, \
             returned_function_names, selected_function_name, was_helpful, feedback_type, \
             feedback_comment, search_metadata, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                row.id.to_string(),
                row.agent_id.to_string(),
                row.project_id.to_string(),
                row.intent,
                serde_json::to_string(&row.returned_function_names)?,
                row.selected_function_name,
                row.was_helpful,
                row.feedback_type.as_str(),
                row.feedback_comment,
                serde_json::to_string(&row.search_metadata)?,
                fmt_ts(row.created_at),
            ],
        )?;
        Ok(row)
    }

    /// Feedback rows an agent has produced since the bound (rate limiting).
    pub fn count_recent_feedback(
        &self,
        agent_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM function_search_feedback \
             WHERE agent_id = ?1 AND created_at > ?2",
            rusqlite::params![agent_id.to_string(), fmt_ts(since)],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// A project's feedback, newest first.
    pub fn list_feedback_by_project(
        &self,
        project_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<FunctionSearchFeedback>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, agent_id, project_id, intent, returned_function_names, \
             selected_function_name, was_helpful, feedback_type, feedback_comment, \
             search_metadata, created_at FROM function_search_feedback \
             WHERE project_id = ?1 ORDER BY created_at DESC LIMIT {} OFFSET {}",
            limit as i64, offset as i64
        ))?;
        let rows = stmt.query_and_then([project_id.to_string()], feedback_from_row)?;
        rows.collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::projects::tests::seed_project_agent;
    use super::*;
    use serde_json::json;

    fn implicit_feedback() -> NewSearchFeedback {
        NewSearchFeedback {
            intent: Some("send an email".into()),
            returned_function_names: vec!["GMAIL__SEND_EMAIL".into()],
            selected_function_name: Some("GMAIL__SEND_EMAIL".into()),
            was_helpful: true,
            feedback_type: FeedbackType::ImplicitExecution,
            feedback_comment: None,
            search_metadata: json!({"execution_success": true}),
        }
    }

    #[test]
    fn test_create_and_list_feedback() {
        let store = CatalogStore::open_in_memory().unwrap();
        let (project, agent) = seed_project_agent(&store);

        let created = store
            .create_search_feedback(agent.id, project.id, implicit_feedback())
            .unwrap();
        assert_eq!(created.feedback_type, FeedbackType::ImplicitExecution);

        let listed = store.list_feedback_by_project(project.id, 10, 0).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].intent.as_deref(), Some("send an email"));
        assert_eq!(listed[0].search_metadata["execution_success"], true);
    }

    #[test]
    fn test_count_recent_feedback_window() {
        let store = CatalogStore::open_in_memory().unwrap();
        let (project, agent) = seed_project_agent(&store);
        for _ in 0..3 {
            store
                .create_search_feedback(agent.id, project.id, implicit_feedback())
                .unwrap();
        }

        let hour_ago = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(store.count_recent_feedback(agent.id, hour_ago).unwrap(), 3);
        let future = Utc::now() + chrono::Duration::seconds(5);
        assert_eq!(store.count_recent_feedback(agent.id, future).unwrap(), 0);
    }
}
