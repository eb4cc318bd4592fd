//! Structured management task reports.

use serde::{Deserialize, Serialize};

use crate::error::{JbiError, JbiResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Error,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub kind: MessageKind,
    pub message: String,
}

/// Outcome of a management task (install, deploy, start...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<TaskMessage>,
}

impl TaskReport {
    pub fn success(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            status: TaskStatus::Success,
            messages: Vec::new(),
        }
    }

    /// Failure report with one message per failing entity; composites are flattened.
    pub fn failure(task: impl Into<String>, error: &JbiError) -> Self {
        let mut messages = Vec::new();
        collect(error, &mut messages);
        Self {
            task: task.into(),
            status: TaskStatus::Failed,
            messages,
        }
    }

    pub fn from_result<T>(task: impl Into<String>, result: &JbiResult<T>) -> Self {
        match result {
            Ok(_) => Self::success(task),
            Err(e) => Self::failure(task, e),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }
}

fn collect(error: &JbiError, out: &mut Vec<TaskMessage>) {
    match error {
        JbiError::Composite { failures, .. } => {
            for failure in failures {
                collect(failure, out);
            }
        }
        JbiError::Timeout {
            component, unit, ..
        } => out.push(TaskMessage {
            component: Some(component.clone()),
            unit: Some(unit.clone()),
            kind: MessageKind::Timeout,
            message: error.to_string(),
        }),
        JbiError::Deployment {
            component, unit, ..
        } => out.push(TaskMessage {
            component: Some(component.clone()),
            unit: Some(unit.clone()),
            kind: MessageKind::Error,
            message: error.to_string(),
        }),
        JbiError::Plugin { component, .. }
        | JbiError::ComponentHasServiceUnits { component, .. }
        | JbiError::SharedLibraryInUse { component, .. } => out.push(TaskMessage {
            component: Some(component.clone()),
            unit: None,
            kind: MessageKind::Error,
            message: error.to_string(),
        }),
        other => out.push(TaskMessage {
            component: None,
            unit: None,
            kind: MessageKind::Error,
            message: other.to_string(),
        }),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn composite_failure_is_flattened() {
        let err = JbiError::Composite {
            task: "start",
            assembly: "sa".to_owned(),
            failures: vec![
                JbiError::Timeout {
                    task: "start",
                    component: "c1".to_owned(),
                    unit: "su1".to_owned(),
                    timeout: Duration::from_millis(5),
                },
                JbiError::Deployment {
                    task: "init",
                    component: "c2".to_owned(),
                    unit: "su2".to_owned(),
                    message: "boom".to_owned(),
                },
            ],
        };

        let report = TaskReport::failure("start", &err);
        assert!(!report.is_success());
        assert_eq!(report.messages.len(), 2);
        assert_eq!(report.messages[0].kind, MessageKind::Timeout);
        assert_eq!(report.messages[1].unit.as_deref(), Some("su2"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "FAILED");
        assert_eq!(json["messages"][0]["kind"], "timeout");
    }

    #[test]
    fn success_has_no_messages() {
        let report = TaskReport::from_result("deploy", &Ok::<_, JbiError>(()));
        assert!(report.is_success());
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("messages").is_none());
    }
}
