use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::table::Table;

const DEFAULT_SCHEMA: &str = "public";

/// Row-level mutation verb carried by a change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeVerb {
    /// A row was created.
    Insert,
    /// A row was modified.
    Update,
    /// A row was removed.
    Delete,
}

impl ChangeVerb {
    /// Wire spelling of the verb.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl TryFrom<&str> for ChangeVerb {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        if value.eq_ignore_ascii_case("insert") {
            Ok(Self::Insert)
        } else if value.eq_ignore_ascii_case("update") {
            Ok(Self::Update)
        } else if value.eq_ignore_ascii_case("delete") {
            Ok(Self::Delete)
        } else {
            Err("unknown change verb")
        }
    }
}

/// Change notification exactly as the backend's feed delivers it.
///
/// Every field defaults when absent so a damaged payload still decodes and
/// can be rejected, with a diagnostic, by the normalizer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawChange {
    /// Mutation verb (`INSERT`, `UPDATE`, `DELETE`).
    #[serde(default)]
    pub event: String,
    /// Database schema of the table.
    #[serde(default)]
    pub schema: String,
    /// Table name.
    #[serde(default)]
    pub table: String,
    /// Row before the change. Deletes often carry only the primary key.
    #[serde(default)]
    pub old: Value,
    /// Row after the change.
    #[serde(default)]
    pub new: Value,
    /// Commit time reported by the backend, RFC 3339.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_timestamp: Option<String>,
}

impl RawChange {
    fn build(verb: ChangeVerb, table: Table, old: Value, new: Value) -> Self {
        Self {
            event: verb.as_str().to_string(),
            schema: DEFAULT_SCHEMA.to_string(),
            table: table.as_str().to_string(),
            old,
            new,
            commit_timestamp: Some(Utc::now().to_rfc3339()),
        }
    }

    /// Notification for a newly inserted row.
    #[must_use]
    pub fn insert(table: Table, new: Value) -> Self {
        Self::build(ChangeVerb::Insert, table, Value::Null, new)
    }

    /// Notification for a modified row.
    #[must_use]
    pub fn update(table: Table, old: Value, new: Value) -> Self {
        Self::build(ChangeVerb::Update, table, old, new)
    }

    /// Notification for a removed row.
    #[must_use]
    pub fn delete(table: Table, old: Value) -> Self {
        Self::build(ChangeVerb::Delete, table, old, Value::Null)
    }

    /// Replaces the commit timestamp.
    #[must_use]
    pub fn at(mut self, when: DateTime<Utc>) -> Self {
        self.commit_timestamp = Some(when.to_rfc3339());
        self
    }

    /// Parsed mutation verb, if recognised.
    #[must_use]
    pub fn verb(&self) -> Option<ChangeVerb> {
        ChangeVerb::try_from(self.event.as_str()).ok()
    }

    /// Parsed table, if recognised.
    #[must_use]
    pub fn table(&self) -> Option<Table> {
        Table::try_from(self.table.as_str()).ok()
    }

    /// Parsed commit timestamp, if present and well formed.
    #[must_use]
    pub fn commit_time(&self) -> Option<DateTime<Utc>> {
        self.commit_timestamp
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|parsed| parsed.with_timezone(&Utc))
    }
}
