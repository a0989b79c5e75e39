//! Core domain model, timestamp normalization, and field projection for the
//! work-note relay.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const CRATE_NAME: &str = "wnr-core";

/// Timezone-aware instant normalized for recency comparisons.
///
/// Ordering and equality hold at whole-second granularity: the tracker emits
/// second-precision timestamps, and recency decisions must not depend on
/// sub-second noise. The inner instant keeps full precision for display.
#[derive(Debug, Clone, Copy)]
pub struct Stamp(DateTime<Tz>);

impl Stamp {
    pub fn new(instant: DateTime<Tz>) -> Self {
        Self(instant)
    }

    pub fn instant(&self) -> DateTime<Tz> {
        self.0
    }

    fn seconds(&self) -> i64 {
        self.0.timestamp()
    }
}

impl PartialEq for Stamp {
    fn eq(&self, other: &Self) -> bool {
        self.seconds() == other.seconds()
    }
}

impl Eq for Stamp {}

impl PartialOrd for Stamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Stamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.seconds().cmp(&other.seconds())
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S"))
    }
}

/// Raised when a tracker timestamp cannot be read as ISO-8601; the caller
/// skips that entity for the cycle and continues with the rest.
#[derive(Debug, Clone, Error)]
#[error("unparseable timestamp {input:?}")]
pub struct StampParseError {
    pub input: String,
}

/// Parses the tracker's heterogeneous date representations into instants in
/// one configured target timezone.
#[derive(Debug, Clone, Copy)]
pub struct StampNormalizer {
    tz: Tz,
}

impl StampNormalizer {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Current instant in the target timezone.
    pub fn now(&self) -> Stamp {
        Stamp(Utc::now().with_timezone(&self.tz))
    }

    /// Lower bound for "recently updated": now minus the polling window.
    pub fn cutoff(&self, window_minutes: i64) -> Stamp {
        Stamp(Utc::now().with_timezone(&self.tz) - Duration::minutes(window_minutes))
    }

    /// Normalizes one raw timestamp. Offset-bearing values are converted to
    /// the target timezone; offset-free values are taken as already local to
    /// it and only tagged. A `Z` suffix is rewritten to an explicit `+00:00`
    /// offset before parsing.
    pub fn normalize(&self, raw: &str) -> Result<Stamp, StampParseError> {
        let trimmed = raw.trim();
        let rewritten = match trimmed.strip_suffix('Z') {
            Some(head) => format!("{head}+00:00"),
            None => trimmed.to_string(),
        };

        if let Ok(instant) = DateTime::parse_from_rfc3339(&rewritten) {
            return Ok(Stamp(instant.with_timezone(&self.tz)));
        }

        for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(&rewritten, format) {
                return self.tag_local(naive, raw);
            }
        }

        Err(StampParseError {
            input: raw.to_string(),
        })
    }

    fn tag_local(&self, naive: NaiveDateTime, raw: &str) -> Result<Stamp, StampParseError> {
        // A DST fold resolves to the earlier instant; a gap has no valid
        // mapping and is treated as unparseable.
        match self.tz.from_local_datetime(&naive) {
            LocalResult::Single(instant) => Ok(Stamp(instant)),
            LocalResult::Ambiguous(earliest, _) => Ok(Stamp(earliest)),
            LocalResult::None => Err(StampParseError {
                input: raw.to_string(),
            }),
        }
    }
}

/// Note author as reported by the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reporter {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// One work note attached to an issue. Immutable once created.
#[derive(Debug, Clone)]
pub struct Note {
    pub id: u64,
    pub created_at: String,
    pub text: String,
    pub reporter: Reporter,
    pub raw: Value,
}

/// One tracker issue as fetched this cycle. The raw record is kept alongside
/// the typed envelope so field projection can reach arbitrary attributes.
#[derive(Debug, Clone)]
pub struct Issue {
    pub id: u64,
    pub created_at: String,
    pub updated_at: String,
    pub notes: Vec<Note>,
    pub raw: Value,
}

#[derive(Debug, Clone, Error)]
pub enum EnvelopeError {
    #[error("tracker record is missing required field `{field}`")]
    MissingField { field: &'static str },
}

impl Issue {
    /// Builds the envelope from a raw tracker record. Notes missing their
    /// mandatory fields are dropped individually rather than failing the
    /// whole issue.
    pub fn from_value(raw: Value) -> Result<Self, EnvelopeError> {
        let id = raw
            .get("id")
            .and_then(Value::as_u64)
            .ok_or(EnvelopeError::MissingField { field: "id" })?;
        let created_at = str_field(&raw, "created_at")
            .ok_or(EnvelopeError::MissingField { field: "created_at" })?;
        let updated_at = str_field(&raw, "updated_at")
            .ok_or(EnvelopeError::MissingField { field: "updated_at" })?;
        let notes = raw
            .get("notes")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| Note::from_value(entry.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            id,
            created_at,
            updated_at,
            notes,
            raw,
        })
    }
}

impl Note {
    pub fn from_value(raw: Value) -> Result<Self, EnvelopeError> {
        let id = raw
            .get("id")
            .and_then(Value::as_u64)
            .ok_or(EnvelopeError::MissingField { field: "id" })?;
        let created_at = str_field(&raw, "created_at")
            .ok_or(EnvelopeError::MissingField { field: "created_at" })?;
        let text = str_field(&raw, "text").unwrap_or_default();
        let reporter = raw
            .get("reporter")
            .map(|entry| Reporter {
                name: str_field(entry, "name").unwrap_or_else(|| "unknown".to_string()),
                email: str_field(entry, "email"),
            })
            .unwrap_or(Reporter {
                name: "unknown".to_string(),
                email: None,
            });

        Ok(Self {
            id,
            created_at,
            text,
            reporter,
            raw,
        })
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(ToString::to_string)
}

/// Newly detected note, ready for the log writer and the dispatcher. Derived
/// per cycle and discarded after delivery.
#[derive(Debug, Clone)]
pub struct NoteRecord {
    pub issue_id: u64,
    pub note_id: u64,
    pub text: String,
    pub reporter_name: String,
    pub reporter_email: Option<String>,
    pub submitted_at: Stamp,
    pub attachments: Vec<PathBuf>,
}

/// One projection specifier: a bare key or a dotted `parent.child` path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSpec {
    Bare(String),
    Nested { parent: String, child: String },
}

impl FieldSpec {
    pub fn parse(spec: &str) -> Self {
        match spec.split_once('.') {
            Some((parent, child)) => Self::Nested {
                parent: parent.to_string(),
                child: child.to_string(),
            },
            None => Self::Bare(spec.to_string()),
        }
    }
}

/// Splits a comma-separated specifier list, trimming whitespace around each
/// entry.
pub fn parse_field_list(list: &str) -> Vec<FieldSpec> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(FieldSpec::parse)
        .collect()
}

/// Ordered label -> value projection of a tracker record. Serializes as a
/// JSON object whose member order matches insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlatRecord(Map<String, Value>);

impl FlatRecord {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn insert(&mut self, label: impl Into<String>, value: Value) {
        self.0.insert(label.into(), value);
    }

    pub fn get(&self, label: &str) -> Option<&Value> {
        self.0.get(label)
    }

    pub fn remove(&mut self, label: &str) -> Option<Value> {
        self.0.remove(label)
    }

    /// Appends `other`'s entries in order; labels already present are
    /// overwritten.
    pub fn merge(&mut self, other: &FlatRecord) {
        for (label, value) in &other.0 {
            self.0.insert(label.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn labels(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_pretty_json(&self) -> String {
        serde_json::to_string_pretty(&self.0).expect("flat record serializes")
    }
}

/// Projects `record` through `specs` in order, prefixing and capitalizing
/// each derived label. Missing parents or children yield `null` values
/// rather than errors.
pub fn extract_fields(record: &Value, specs: &[FieldSpec], prefix: &str) -> FlatRecord {
    let mut out = FlatRecord::new();
    for spec in specs {
        let (label, value) = match spec {
            FieldSpec::Bare(key) => (
                capitalize(key),
                record.get(key).cloned().unwrap_or(Value::Null),
            ),
            FieldSpec::Nested { parent, child } => {
                let value = record
                    .get(parent)
                    .and_then(|nested| nested.get(child))
                    .cloned()
                    .unwrap_or(Value::Null);
                (nested_label(parent, child), value)
            }
        };
        out.insert(format!("{prefix}{label}"), value);
    }
    out
}

fn nested_label(parent: &str, child: &str) -> String {
    // The tracker's internal "handler" role is the externally visible
    // assignee. Reporter paths keep the full dotted label so name and email
    // stay distinct.
    if parent == "handler" {
        "Assignee".to_string()
    } else if parent == "reporter" {
        capitalize(&format!("{parent}.{child}"))
    } else {
        capitalize(parent)
    }
}

fn capitalize(input: &str) -> String {
    let mut chars = input.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}
