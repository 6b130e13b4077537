//! Channel builders for the project views that listen live

use super::channel::{ChannelSpec, TableFilter};
use super::queries::QueryKey;
use super::reconcile::TableBinding;

/// A channel together with the queries its tables feed
#[derive(Debug, Clone)]
pub struct Topic {
    pub spec: ChannelSpec,
    pub bindings: Vec<TableBinding>,
}

pub fn project_members_key(project_id: &str) -> QueryKey {
    QueryKey::new(format!("project_members:{}", project_id))
}

pub fn audit_log_key(project_id: &str) -> QueryKey {
    QueryKey::new(format!("audit_logs:{}", project_id))
}

pub fn tasks_key(project_id: &str) -> QueryKey {
    QueryKey::new(format!("tasks:{}", project_id))
}

/// Team roster and activity feed of one project on a single channel
pub fn project_activity_channel(project_id: &str) -> Topic {
    Topic {
        spec: ChannelSpec::new(format!("project-activity-{}", project_id))
            .with_table(TableFilter::eq("project_members", "project_id", project_id))
            .with_table(TableFilter::eq("audit_logs", "project_id", project_id)),
        bindings: vec![
            TableBinding::new("project_members", project_members_key(project_id))
                .patchable(["role", "updated_at"]),
            // Audit rows are append-only
            TableBinding::new("audit_logs", audit_log_key(project_id)),
        ],
    }
}

/// Task board of one project. Labels drive board filtering, so a label
/// change always refetches.
pub fn task_board_channel(project_id: &str) -> Topic {
    Topic {
        spec: ChannelSpec::new(format!("task-board-{}", project_id))
            .with_table(TableFilter::eq("tasks", "project_id", project_id)),
        bindings: vec![TableBinding::new("tasks", tasks_key(project_id)).patchable([
            "title",
            "description",
            "status",
            "priority",
            "due_date",
            "assigned_to",
            "updated_at",
        ])],
    }
}
