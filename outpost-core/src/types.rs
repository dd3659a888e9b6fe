use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::{Error, Result};

/// A schema-agnostic entity record: field name to JSON value.
pub type Record = Map<String, Value>;

pub const ID: &str = "id";
pub const CREATED_AT: &str = "created_at";
pub const UPDATED_AT: &str = "updated_at";
pub const CLIENT_UPDATED_AT: &str = "client_updated_at";
pub const VERSION: &str = "version";
pub const CONFLICT_RESOLUTION: &str = "conflict_resolution";
pub const CONFLICT_RESOLVED_AT: &str = "conflict_resolved_at";

/// Current wall-clock time formatted the way records store timestamps.
pub fn now_iso() -> String {
    format_timestamp(Utc::now())
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses an RFC 3339 timestamp, also accepting epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// Accessors for the sync metadata carried by every record.
pub trait RecordExt {
    fn id(&self) -> Option<&str>;
    fn updated_at(&self) -> Option<DateTime<Utc>>;
    fn client_updated_at(&self) -> Option<DateTime<Utc>>;
    fn version(&self) -> Option<i64>;

    /// `updated_at`, falling back to `client_updated_at`.
    fn local_timestamp(&self) -> Option<DateTime<Utc>> {
        self.updated_at().or_else(|| self.client_updated_at())
    }

    /// Copies every field of `other` onto `self`, replacing shared fields.
    fn overlay(&mut self, other: &Record);
}

impl RecordExt for Record {
    fn id(&self) -> Option<&str> {
        self.get(ID)
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.get(UPDATED_AT).and_then(parse_timestamp)
    }

    fn client_updated_at(&self) -> Option<DateTime<Utc>> {
        self.get(CLIENT_UPDATED_AT).and_then(parse_timestamp)
    }

    fn version(&self) -> Option<i64> {
        self.get(VERSION).and_then(Value::as_i64)
    }

    fn overlay(&mut self, other: &Record) {
        for (field, value) in other {
            self.insert(field.clone(), value.clone());
        }
    }
}

/// Converts an arbitrary JSON value into a record, rejecting non-objects.
pub fn into_record(value: Value) -> Result<Record> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::InvalidRecord(format!(
            "expected a JSON object, got {}",
            other
        ))),
    }
}

/// Ensures the record carries an id, generating a UUID when absent.
pub fn ensure_id(record: &mut Record) -> Result<String> {
    match record.get(ID) {
        None | Some(Value::Null) => {
            let id = uuid::Uuid::new_v4().to_string();
            record.insert(ID.to_string(), Value::String(id.clone()));
            Ok(id)
        }
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => {
            let id = n.to_string();
            record.insert(ID.to_string(), Value::String(id.clone()));
            Ok(id)
        }
        Some(other) => Err(Error::InvalidRecord(format!("unusable id: {}", other))),
    }
}

/// Predicate on a single field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum FilterValue {
    /// Field equals the value
    Eq(Value),
    /// Field equals one of the values
    In(Vec<Value>),
}

impl FilterValue {
    pub fn matches(&self, candidate: Option<&Value>) -> bool {
        let candidate = candidate.unwrap_or(&Value::Null);
        match self {
            FilterValue::Eq(expected) => loosely_equal(expected, candidate),
            FilterValue::In(set) => set.iter().any(|v| loosely_equal(v, candidate)),
        }
    }
}

// Numbers and strings compare by their textual form, matching how a REST
// backend sees query-string filters.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(x), Value::Number(y)) | (Value::Number(y), Value::String(x)) => {
            *x == y.to_string()
        }
        _ => a == b,
    }
}

/// Field-to-predicate filter set. Ordered so serialization is stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filters(BTreeMap<String, FilterValue>);

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), FilterValue::Eq(value.into()));
        self
    }

    pub fn in_set<V: Into<Value>>(
        mut self,
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.0.insert(field.into(), FilterValue::In(values));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FilterValue)> {
        self.0.iter()
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.0
            .iter()
            .all(|(field, predicate)| predicate.matches(record.get(field)))
    }

    /// Client-side filtering used when serving from cache or the local store.
    pub fn apply(&self, records: &[Record]) -> Vec<Record> {
        records
            .iter()
            .filter(|record| self.matches(record))
            .cloned()
            .collect()
    }

    /// Composite cache key: the table name alone when unfiltered, otherwise
    /// table plus the serialized filter set.
    pub fn cache_key(&self, table: &str) -> String {
        if self.is_empty() {
            table.to_string()
        } else {
            let encoded = serde_json::to_string(&self.0).unwrap_or_default();
            format!("{}?{}", table, encoded)
        }
    }
}
