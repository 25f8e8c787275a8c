//! Conversion between local task rows and Taskwarrior JSON tasks
//!
//! Mapped fields become local columns; every other attribute the server
//! sends is kept in the task's `additional_entries` JSON blob and merged
//! back into the outgoing JSON so nothing is lost on a round trip. The blob
//! always mirrors the latest server version of the task.

use crate::error::{SyncError, SyncResult};
use crate::recurrence::RecurrenceInterval;
use crate::store::{DirtyState, LocalId, LocalTask, Row};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Attributes that map onto local columns and are never stored in the
/// additional-entries blob.
const MAPPED_ATTRIBUTES: &[&str] = &[
    "uuid",
    "status",
    "description",
    "entry",
    "modified",
    "due",
    "project",
    "priority",
    "tags",
    "depends",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStatus {
    Pending,
    Completed,
    Deleted,
    Waiting,
    Recurring,
}

/// Task priority as exchanged with the server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Priority {
    #[default]
    None,
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn as_wire(self) -> &'static str {
        match self {
            Priority::None => "",
            Priority::Low => "L",
            Priority::Medium => "M",
            Priority::High => "H",
        }
    }

    pub fn from_wire(text: &str) -> Option<Self> {
        match text.trim() {
            "" => Some(Priority::None),
            "L" | "l" => Some(Priority::Low),
            "M" | "m" => Some(Priority::Medium),
            "H" | "h" => Some(Priority::High),
            _ => None,
        }
    }

    pub fn to_local(self) -> i64 {
        match self {
            Priority::Low => -1,
            Priority::None => 0,
            Priority::Medium => 1,
            Priority::High => 2,
        }
    }

    /// Local priorities range from -2 to 2; both negative levels are low.
    pub fn from_local(value: i64) -> Self {
        match value {
            i64::MIN..=-1 => Priority::Low,
            0 => Priority::None,
            1 => Priority::Medium,
            _ => Priority::High,
        }
    }

    pub fn is_none(&self) -> bool {
        *self == Priority::None
    }
}

impl Serialize for Priority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_wire())
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Priority::from_wire(&text)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown priority: {}", text)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(default, skip_serializing_if = "Option::is_none", with = "tw_date::option")]
    pub entry: Option<DateTime<Utc>>,
    pub description: String,
}

/// A task as represented on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTask {
    pub uuid: String,
    pub status: RemoteStatus,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "tw_date::option")]
    pub entry: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "tw_date::option")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "tw_date::option")]
    pub due: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "tw_date::option")]
    pub until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Priority::is_none")]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        serialize_with = "depends::serialize",
        deserialize_with = "depends::deserialize"
    )]
    pub depends: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recur: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imask: Option<f64>,
    /// Attributes this engine does not interpret
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl RemoteTask {
    /// Parse one JSON line of a response payload.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Protocol` when the line is not a valid task.
    pub fn from_json_line(line: &str) -> SyncResult<Self> {
        let fields = match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(fields)) => fields,
            Ok(_) => return Err(SyncError::Protocol("remote task is not a JSON object".into())),
            Err(e) => return Err(SyncError::Protocol(format!("cannot parse remote task: {}", e))),
        };
        Self::from_fields(fields)
            .map_err(|e| SyncError::Protocol(format!("cannot parse remote task: {}", e)))
    }

    /// A priority outside `H`/`M`/`L` (user-defined priority values) leaves
    /// the task without priority and is kept verbatim in `extra`.
    fn from_fields(mut fields: Map<String, Value>) -> serde_json::Result<Self> {
        let custom_priority = match fields.remove("priority") {
            Some(Value::String(text)) if Priority::from_wire(&text).is_some() => {
                fields.insert("priority".into(), Value::String(text));
                None
            }
            Some(Value::Null) | None => None,
            other => other,
        };

        let mut task: Self = serde_json::from_value(Value::Object(fields))?;
        if let Some(raw) = custom_priority {
            tracing::debug!(uuid = %task.uuid, priority = %raw, "Keeping unknown priority as attribute");
            task.extra.insert("priority".into(), raw);
        }
        Ok(task)
    }

    /// # Errors
    ///
    /// Returns `SyncError::Serialization` if the task cannot be encoded.
    pub fn to_json_line(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn is_deleted(&self) -> bool {
        self.status == RemoteStatus::Deleted
    }

    pub fn has_project(&self) -> bool {
        self.project.as_deref().is_some_and(|p| !p.trim().is_empty())
    }

    pub fn is_recurring_master(&self) -> bool {
        self.status == RemoteStatus::Recurring
    }

    pub fn is_recurring_child(&self) -> bool {
        self.parent.is_some() && self.imask.is_some()
    }

    /// Offset of a generated instance within its master's recurrence.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn imask(&self) -> Option<u32> {
        self.imask
            .filter(|mask| mask.is_finite() && *mask >= 0.0 && *mask <= f64::from(u32::MAX))
            .map(|mask| mask.round() as u32)
    }

    /// # Errors
    ///
    /// Returns `SyncError::UnsupportedRecurrence` when `recur` has no local form.
    pub fn recurrence(&self) -> SyncResult<Option<RecurrenceInterval>> {
        self.recur
            .as_deref()
            .map(RecurrenceInterval::parse)
            .transpose()
    }

    /// Tag names as stored locally; the wire form cannot carry spaces.
    pub fn local_tag_names(&self) -> impl Iterator<Item = String> + '_ {
        self.tags.iter().map(|tag| tag_to_local(tag))
    }

    /// Column values of the local task row for this remote task.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::DeletedTask` for deleted tasks; callers must
    /// delete the local row instead of writing it.
    pub fn to_local_values(&self, list_id: LocalId) -> SyncResult<Row> {
        if self.is_deleted() {
            return Err(SyncError::DeletedTask(self.uuid.clone()));
        }

        let content = self
            .annotations
            .iter()
            .map(|a| a.description.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let created = self.entry.or(self.modified).map(|d| d.timestamp());
        let updated = self.modified.or(self.entry).map(|d| d.timestamp());

        Ok(Row::new()
            .with("uuid", self.uuid.as_str())
            .with("list_id", list_id)
            .with("name", self.description.as_str())
            .with("content", content)
            .with("done", i64::from(self.status == RemoteStatus::Completed))
            .with("priority", self.priority.to_local())
            .with("due", self.due.map(|d| d.timestamp()))
            .with("created_at", created.unwrap_or(0))
            .with("updated_at", updated.unwrap_or(0))
            .with("additional_entries", self.additional_entries()?)
            .with("sync_state", DirtyState::Nothing.as_i64()))
    }

    /// The unmapped attributes of this task. Attributes the server dropped
    /// since the last sync are gone from the result.
    fn additional_entries(&self) -> SyncResult<Option<String>> {
        let Value::Object(fields) = serde_json::to_value(self)? else {
            return Err(SyncError::Internal("remote task did not encode as object".into()));
        };

        let mut blob = Map::new();
        for (key, value) in fields {
            let keep = match key.as_str() {
                "status" => matches!(self.status, RemoteStatus::Waiting | RemoteStatus::Recurring),
                "priority" => self.extra.contains_key("priority"),
                other => !MAPPED_ATTRIBUTES.contains(&other),
            };
            if keep {
                blob.insert(key, value);
            }
        }

        if blob.is_empty() {
            Ok(None)
        } else {
            Ok(Some(serde_json::to_string(&blob)?))
        }
    }

    /// Build the wire task for a local row.
    ///
    /// `project` is `None` for tasks in the inbox. `depends` holds the UUIDs
    /// of the task's subtasks.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Serialization` if the additional entries hold
    /// values of the wrong shape for a known attribute.
    pub fn from_local(
        task: &LocalTask,
        project: Option<&str>,
        tags: &[String],
        depends: &[String],
    ) -> SyncResult<Self> {
        let mut fields = parse_additional(task.additional_entries.as_deref());

        let status = match (task.sync_state, task.done) {
            (DirtyState::Delete, _) => "deleted",
            (_, true) => "completed",
            _ => match fields.get("status").and_then(Value::as_str) {
                Some("waiting") => "waiting",
                Some("recurring") => "recurring",
                _ => "pending",
            },
        };

        fields.insert("uuid".into(), Value::from(task.uuid.as_str()));
        fields.insert("status".into(), Value::from(status));
        fields.insert("description".into(), Value::from(task.name.as_str()));
        fields.insert("entry".into(), Value::from(tw_date::format_timestamp(task.created_at)));
        fields.insert("modified".into(), Value::from(tw_date::format_timestamp(task.updated_at)));
        match task.due {
            Some(due) => fields.insert("due".into(), Value::from(tw_date::format_timestamp(due))),
            None => fields.remove("due"),
        };
        match project {
            Some(project) => fields.insert("project".into(), Value::from(project)),
            None => fields.remove("project"),
        };
        // a user-defined priority stays unless the task got a local one
        let priority = Priority::from_local(task.priority);
        if !priority.is_none() || !fields.contains_key("priority") {
            fields.insert("priority".into(), Value::from(priority.as_wire()));
        }
        fields.insert(
            "tags".into(),
            Value::from(tags.iter().map(|t| tag_to_wire(t)).collect::<Vec<_>>()),
        );
        fields.insert("depends".into(), Value::from(depends.to_vec()));

        let stored_content = fields
            .get("annotations")
            .and_then(|a| serde_json::from_value::<Vec<Annotation>>(a.clone()).ok())
            .map(|annotations| {
                annotations
                    .iter()
                    .map(|a| a.description.as_str())
                    .collect::<Vec<_>>()
                    .join("\n")
            });
        if stored_content.as_deref() != Some(task.content.as_str()) {
            let annotations: Vec<Annotation> = task
                .content
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(|line| Annotation {
                    entry: DateTime::from_timestamp(task.updated_at, 0),
                    description: line.to_string(),
                })
                .collect();
            fields.insert("annotations".into(), serde_json::to_value(annotations)?);
        }

        Ok(Self::from_fields(fields)?)
    }
}

fn parse_additional(blob: Option<&str>) -> Map<String, Value> {
    match blob.map(serde_json::from_str::<Value>) {
        Some(Ok(Value::Object(map))) => map,
        Some(Ok(_)) | Some(Err(_)) => {
            tracing::warn!("Ignoring additional entries that are not a JSON object");
            Map::new()
        }
        None => Map::new(),
    }
}

pub fn tag_to_local(tag: &str) -> String {
    tag.replace('_', " ")
}

pub fn tag_to_wire(tag: &str) -> String {
    tag.replace(' ', "_")
}

/// Taskwarrior timestamps: `20240131T090000Z`; RFC 3339 accepted on input.
mod tw_date {
    use chrono::{DateTime, NaiveDateTime, Utc};

    const FORMAT: &str = "%Y%m%dT%H%M%SZ";

    pub fn format(date: &DateTime<Utc>) -> String {
        date.format(FORMAT).to_string()
    }

    pub fn format_timestamp(secs: i64) -> String {
        DateTime::from_timestamp(secs, 0)
            .map(|d| format(&d))
            .unwrap_or_default()
    }

    pub fn parse(text: &str) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(text, FORMAT)
            .map(|naive| naive.and_utc())
            .ok()
            .or_else(|| {
                DateTime::parse_from_rfc3339(text)
                    .ok()
                    .map(|d| d.with_timezone(&Utc))
            })
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match date {
                Some(date) => serializer.serialize_str(&super::format(date)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
        where
            D: Deserializer<'de>,
        {
            match Option::<String>::deserialize(deserializer)? {
                None => Ok(None),
                Some(text) if text.is_empty() => Ok(None),
                Some(text) => super::parse(&text)
                    .map(Some)
                    .ok_or_else(|| serde::de::Error::custom(format!("invalid date: {}", text))),
            }
        }
    }
}

/// `depends` arrives either as `"uuid1,uuid2"` or as a JSON array.
mod depends {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Joined(String),
        List(Vec<String>),
    }

    pub fn serialize<S: Serializer>(depends: &[String], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&depends.join(","))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
        let items = match Raw::deserialize(deserializer)? {
            Raw::Joined(joined) => joined.split(',').map(str::to_string).collect(),
            Raw::List(list) => list,
        };
        Ok(items
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect())
    }
}
