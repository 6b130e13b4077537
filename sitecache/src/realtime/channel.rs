//! Channel model
//!
//! Row-change payloads, table filters and the state a channel reports while
//! it is open.

use crate::config::REALTIME_SCHEMA;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ChangeAction::Insert => "INSERT",
            ChangeAction::Update => "UPDATE",
            ChangeAction::Delete => "DELETE",
        })
    }
}

/// One row change delivered on a channel. Either record may be absent
/// depending on the action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePayload {
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
    #[serde(rename = "eventType")]
    pub event_type: ChangeAction,
    #[serde(default)]
    pub new: Option<Value>,
    #[serde(default)]
    pub old: Option<Value>,
    #[serde(default)]
    pub commit_timestamp: Option<DateTime<Utc>>,
}

fn default_schema() -> String {
    REALTIME_SCHEMA.to_string()
}

impl ChangePayload {
    pub fn new(table: impl Into<String>, event_type: ChangeAction) -> Self {
        Self {
            schema: default_schema(),
            table: table.into(),
            event_type,
            new: None,
            old: None,
            commit_timestamp: None,
        }
    }

    pub fn with_new(mut self, record: Value) -> Self {
        self.new = non_empty(record);
        self
    }

    pub fn with_old(mut self, record: Value) -> Self {
        self.old = non_empty(record);
        self
    }

    /// The record that best describes the row: `new`, else `old`
    pub fn record(&self) -> Option<&Value> {
        self.new.as_ref().or(self.old.as_ref())
    }

    /// Primary key of the affected row
    pub fn row_id(&self) -> Option<&Value> {
        self.record()
            .and_then(|record| record.get("id"))
            .filter(|id| !id.is_null())
    }
}

/// Empty objects count as an absent record
pub(crate) fn non_empty(record: Value) -> Option<Value> {
    match &record {
        Value::Null => None,
        Value::Object(map) if map.is_empty() => None,
        _ => Some(record),
    }
}

/// Table subscription inside a channel, optionally narrowed by
/// `column=eq.value`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableFilter {
    pub table: String,
    pub filter: Option<String>,
}

impl TableFilter {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: None,
        }
    }

    pub fn eq(table: impl Into<String>, column: &str, value: impl std::fmt::Display) -> Self {
        Self {
            table: table.into(),
            filter: Some(format!("{}=eq.{}", column, value)),
        }
    }

    /// Column and value of an `eq` filter
    pub fn eq_parts(&self) -> Option<(&str, &str)> {
        let (column, rest) = self.filter.as_deref()?.split_once('=')?;
        let value = rest.strip_prefix("eq.")?;
        Some((column, value))
    }

    pub fn matches(&self, change: &ChangePayload) -> bool {
        if change.table != self.table {
            return false;
        }
        let Some((column, expected)) = self.eq_parts() else {
            return self.filter.is_none();
        };
        change
            .record()
            .and_then(|record| record.get(column))
            .is_some_and(|actual| match actual {
                Value::String(s) => s == expected,
                Value::Null => false,
                other => other.to_string() == expected,
            })
    }
}

/// A logical channel multiplexing several table filters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub name: String,
    pub schema: String,
    pub filters: Vec<TableFilter>,
}

impl ChannelSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: default_schema(),
            filters: Vec::new(),
        }
    }

    pub fn with_table(mut self, filter: TableFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Whether any table filter of this channel admits the change
    pub fn admits(&self, change: &ChangePayload) -> bool {
        change.schema == self.schema && self.filters.iter().any(|f| f.matches(change))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of one channel: `Connecting -> Subscribed -> (Errored | Closed)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Subscribed,
    Errored(String),
    Closed,
}

impl ChannelState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelState::Errored(_) | ChannelState::Closed)
    }
}

/// What a transport delivers into a channel sink
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    State(ChannelState),
    Change(ChangePayload),
}
