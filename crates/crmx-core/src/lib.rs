//! Core record model, identity derivation and overlay merge for CRMX.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "crmx-core";

/// Single storage key holding the whole snapshot blob.
pub const SNAPSHOT_KEY: &str = "close_data";

/// Label substituted when a record has no discriminating text at all.
pub const UNKNOWN_LABEL: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Contact,
    Opportunity,
    Task,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Contact, Category::Opportunity, Category::Task];

    /// Prefix used in generated identifiers.
    pub fn tag(self) -> &'static str {
        match self {
            Category::Contact => "con",
            Category::Opportunity => "opp",
            Category::Task => "task",
        }
    }

    /// Name of the snapshot list holding this category.
    pub fn list_name(self) -> &'static str {
        match self {
            Category::Contact => "contacts",
            Category::Opportunity => "opportunities",
            Category::Task => "tasks",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Contact => "contact",
            Category::Opportunity => "opportunity",
            Category::Task => "task",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown record category `{0}`")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "contact" | "contacts" | "con" => Ok(Category::Contact),
            "opportunity" | "opportunities" | "opp" => Ok(Category::Opportunity),
            "task" | "tasks" => Ok(Category::Task),
            other => Err(UnknownCategory(other.to_string())),
        }
    }
}

/// A stored record: a generated id plus an open set of named fields.
///
/// Fields stay open so an overlay can keep values the incoming copy never
/// mentioned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Shallow overlay: incoming fields win, fields only present here survive.
    pub fn overlay(&mut self, incoming: &Record) {
        for (name, value) in &incoming.fields {
            self.fields.insert(name.clone(), value.clone());
        }
    }
}

/// Typed view over a [`Record`] of one category.
pub trait TypedRecord: Sized {
    const CATEGORY: Category;

    fn id(&self) -> &str;
    fn to_record(&self) -> Record;
    fn from_record(record: &Record) -> Result<Self, serde_json::Error>;
}

fn decode_record<T: serde::de::DeserializeOwned>(record: &Record) -> Result<T, serde_json::Error> {
    let mut map = record.fields.clone();
    map.insert("id".to_string(), Value::String(record.id.clone()));
    serde_json::from_value(Value::Object(map))
}

fn string_list(values: &[String]) -> Value {
    Value::Array(values.iter().cloned().map(Value::String).collect())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub emails: Vec<String>,
    #[serde(default)]
    pub phones: Vec<String>,
    #[serde(default)]
    pub lead: String,
}

impl TypedRecord for Contact {
    const CATEGORY: Category = Category::Contact;

    fn id(&self) -> &str {
        &self.id
    }

    fn to_record(&self) -> Record {
        Record::new(self.id.clone())
            .with_field("name", self.name.clone())
            .with_field("emails", string_list(&self.emails))
            .with_field("phones", string_list(&self.phones))
            .with_field("lead", self.lead.clone())
    }

    fn from_record(record: &Record) -> Result<Self, serde_json::Error> {
        decode_record(record)
    }
}

impl Contact {
    /// Case-insensitive substring match over name, lead and emails.
    pub fn matches_query(&self, query: &str) -> bool {
        let q = query.trim().to_lowercase();
        if q.is_empty() {
            return true;
        }
        self.name.to_lowercase().contains(&q)
            || self.lead.to_lowercase().contains(&q)
            || self.emails.join(" ").to_lowercase().contains(&q)
    }
}

fn default_opportunity_status() -> String {
    "Active".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default = "default_opportunity_status")]
    pub status: String,
    #[serde(default)]
    pub close_date: String,
}

impl TypedRecord for Opportunity {
    const CATEGORY: Category = Category::Opportunity;

    fn id(&self) -> &str {
        &self.id
    }

    fn to_record(&self) -> Record {
        Record::new(self.id.clone())
            .with_field("name", self.name.clone())
            .with_field("value", self.value.clone())
            .with_field("status", self.status.clone())
            .with_field("closeDate", self.close_date.clone())
    }

    fn from_record(record: &Record) -> Result<Self, serde_json::Error> {
        decode_record(record)
    }
}

fn default_due_date() -> String {
    "No date".to_string()
}

fn default_assignee() -> String {
    "Me".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_due_date")]
    pub due_date: String,
    #[serde(default = "default_assignee")]
    pub assignee: String,
    #[serde(default)]
    pub done: bool,
}

impl TypedRecord for Task {
    const CATEGORY: Category = Category::Task;

    fn id(&self) -> &str {
        &self.id
    }

    fn to_record(&self) -> Record {
        Record::new(self.id.clone())
            .with_field("description", self.description.clone())
            .with_field("dueDate", self.due_date.clone())
            .with_field("assignee", self.assignee.clone())
            .with_field("done", self.done)
    }

    fn from_record(record: &Record) -> Result<Self, serde_json::Error> {
        decode_record(record)
    }
}

/// Text an identifier is derived from.
///
/// `Nonce` carries a random component and is not stable across runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discriminator {
    Stable(String),
    Nonce(String),
}

impl Discriminator {
    /// Contact identity is name + first email. Without an email a random
    /// nonce stands in, so the id changes on every extraction.
    pub fn for_contact(name: &str, first_email: Option<&str>) -> Self {
        match first_email.map(str::trim).filter(|e| !e.is_empty()) {
            Some(email) => Discriminator::Stable(format!("{name}{email}")),
            None => Discriminator::Nonce(format!("{name}{}", Uuid::new_v4().simple())),
        }
    }

    pub fn stable(text: &str) -> Self {
        Discriminator::Stable(text.to_string())
    }

    pub fn is_stable(&self) -> bool {
        matches!(self, Discriminator::Stable(_))
    }

    pub fn text(&self) -> &str {
        match self {
            Discriminator::Stable(text) | Discriminator::Nonce(text) => text,
        }
    }
}

fn collapse_whitespace_to_hyphens(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_space = false;
    for ch in input.chars() {
        if ch.is_whitespace() {
            if !in_space {
                out.push('-');
                in_space = true;
            }
        } else {
            out.push(ch);
            in_space = false;
        }
    }
    out
}

/// Deterministic, storage-safe id: `<tag>_<base64("<tag>-<text>")>` where the
/// composite is lowercased and whitespace runs become single hyphens.
pub fn generate_id(category: Category, discriminating_text: &str) -> String {
    let text = if discriminating_text.trim().is_empty() {
        UNKNOWN_LABEL
    } else {
        discriminating_text
    };
    let composite = collapse_whitespace_to_hyphens(&format!("{}-{}", category.tag(), text)).to_lowercase();
    format!("{}_{}", category.tag(), STANDARD.encode(composite.as_bytes()))
}

/// Overlay `incoming` onto `existing` keyed by id.
///
/// Existing records keep their relative order, unseen ids are appended in
/// incoming order, and no id appears twice in the result.
pub fn merge(existing: &[Record], incoming: &[Record]) -> Vec<Record> {
    let mut out: Vec<Record> = Vec::with_capacity(existing.len() + incoming.len());
    let mut index: HashMap<String, usize> = HashMap::with_capacity(existing.len() + incoming.len());

    for record in existing.iter().chain(incoming.iter()) {
        match index.get(&record.id) {
            Some(&pos) => out[pos].overlay(record),
            None => {
                index.insert(record.id.clone(), out.len());
                out.push(record.clone());
            }
        }
    }

    out
}

/// Records produced by one extraction pass.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionBatch {
    #[serde(default)]
    pub contacts: Vec<Record>,
    #[serde(default)]
    pub opportunities: Vec<Record>,
    #[serde(default)]
    pub tasks: Vec<Record>,
}

impl ExtractionBatch {
    pub fn list(&self, category: Category) -> &[Record] {
        match category {
            Category::Contact => &self.contacts,
            Category::Opportunity => &self.opportunities,
            Category::Task => &self.tasks,
        }
    }

    pub fn counts(&self) -> CategoryCounts {
        CategoryCounts {
            contacts: self.contacts.len(),
            opportunities: self.opportunities.len(),
            tasks: self.tasks.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counts().total() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CategoryCounts {
    pub contacts: usize,
    pub opportunities: usize,
    pub tasks: usize,
}

impl CategoryCounts {
    pub fn total(&self) -> usize {
        self.contacts + self.opportunities + self.tasks
    }
}

/// The single persisted blob.
///
/// `revision` is absent from older blobs and then decodes as zero.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default)]
    pub contacts: Vec<Record>,
    #[serde(default)]
    pub opportunities: Vec<Record>,
    #[serde(default)]
    pub tasks: Vec<Record>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revision: u64,
}

impl Snapshot {
    pub fn list(&self, category: Category) -> &[Record] {
        match category {
            Category::Contact => &self.contacts,
            Category::Opportunity => &self.opportunities,
            Category::Task => &self.tasks,
        }
    }

    pub fn list_mut(&mut self, category: Category) -> &mut Vec<Record> {
        match category {
            Category::Contact => &mut self.contacts,
            Category::Opportunity => &mut self.opportunities,
            Category::Task => &mut self.tasks,
        }
    }

    pub fn counts(&self) -> CategoryCounts {
        CategoryCounts {
            contacts: self.contacts.len(),
            opportunities: self.opportunities.len(),
            tasks: self.tasks.len(),
        }
    }

    /// Remove every record with `id` from one list. Returns how many went.
    pub fn remove(&mut self, category: Category, id: &str) -> usize {
        let list = self.list_mut(category);
        let before = list.len();
        list.retain(|r| r.id != id);
        before - list.len()
    }

    /// Decode one list through its typed view, skipping records that do not fit.
    pub fn typed<T: TypedRecord>(&self) -> Vec<T> {
        self.list(T::CATEGORY)
            .iter()
            .filter_map(|r| T::from_record(r).ok())
            .collect()
    }
}

/// Merge every category of `batch` into `snapshot` and stamp `last_sync`.
///
/// `last_sync` moves even when nothing changed.
pub fn merge_batch(snapshot: &Snapshot, batch: &ExtractionBatch, now: DateTime<Utc>) -> Snapshot {
    let mut next = snapshot.clone();
    for category in Category::ALL {
        *next.list_mut(category) = merge(snapshot.list(category), batch.list(category));
    }
    next.last_sync = Some(now);
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;

    fn rec(id: &str, fields: &[(&str, &str)]) -> Record {
        fields
            .iter()
            .fold(Record::new(id), |r, (k, v)| r.with_field(k, *v))
    }

    fn ids(records: &[Record]) -> Vec<&str> {
        records.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn generated_ids_match_known_encodings() {
        assert_eq!(
            generate_id(Category::Contact, "Jane Doejane@x.com"),
            "con_Y29uLWphbmUtZG9lamFuZUB4LmNvbQ=="
        );
        assert_eq!(generate_id(Category::Opportunity, "Acme Renewal"), "opp_b3BwLWFjbWUtcmVuZXdhbA==");
        assert_eq!(generate_id(Category::Task, "Call  Jane"), "task_dGFzay1jYWxsLWphbmU=");
        assert_eq!(generate_id(Category::Contact, "Zoë Ünal"), "con_Y29uLXpvw6stw7xuYWw=");
    }

    #[test]
    fn generate_id_is_deterministic() {
        let a = generate_id(Category::Contact, "Jane Doe jane@x.com");
        let b = generate_id(Category::Contact, "Jane Doe jane@x.com");
        assert_eq!(a, b);
        assert_ne!(a, generate_id(Category::Opportunity, "Jane Doe jane@x.com"));
    }

    #[test]
    fn empty_discriminator_falls_back_to_unknown_label() {
        assert_eq!(generate_id(Category::Opportunity, ""), "opp_b3BwLXVua25vd24=");
        assert_eq!(generate_id(Category::Opportunity, "   "), "opp_b3BwLXVua25vd24=");
    }

    #[test]
    fn contact_without_email_gets_nonce_discriminator() {
        let a = Discriminator::for_contact("Jane", None);
        let b = Discriminator::for_contact("Jane", Some("  "));
        assert!(!a.is_stable());
        assert!(!b.is_stable());
        assert_ne!(a.text(), b.text());

        let stable = Discriminator::for_contact("Jane", Some("jane@x.com"));
        assert_eq!(stable, Discriminator::Stable("Janejane@x.com".into()));
    }

    #[test]
    fn overlay_keeps_untouched_fields() {
        let existing = vec![rec("x", &[("name", "A"), ("lead", "L")])];
        let incoming = vec![rec("x", &[("name", "B")])];
        let merged = merge(&existing, &incoming);
        assert_eq!(merged, vec![rec("x", &[("name", "B"), ("lead", "L")])]);
    }

    #[test]
    fn merge_appends_new_ids_after_existing_in_incoming_order() {
        let existing = vec![rec("a", &[]), rec("b", &[])];
        let incoming = vec![rec("d", &[("n", "4")]), rec("b", &[("n", "2")]), rec("c", &[("n", "3")])];
        let merged = merge(&existing, &incoming);
        assert_eq!(ids(&merged), vec!["a", "b", "d", "c"]);
        assert_eq!(merged[2], incoming[0]);
        assert_eq!(merged[3], incoming[2]);
    }

    #[test]
    fn merge_is_idempotent() {
        let existing = vec![rec("a", &[("name", "A"), ("lead", "L")]), rec("b", &[("name", "B")])];
        let incoming = vec![rec("a", &[("name", "A2")]), rec("c", &[("name", "C")]), rec("c", &[("lead", "X")])];
        let once = merge(&existing, &incoming);
        let twice = merge(&once, &incoming);
        assert_eq!(once, twice);
    }

    #[test]
    fn merge_output_has_unique_ids_even_with_duplicate_inputs() {
        let existing = vec![rec("a", &[("n", "1")]), rec("a", &[("m", "2")]), rec("b", &[])];
        let incoming = vec![rec("b", &[]), rec("c", &[]), rec("c", &[]), rec("a", &[])];
        let merged = merge(&existing, &incoming);
        let unique: HashSet<&str> = ids(&merged).into_iter().collect();
        assert_eq!(unique.len(), merged.len());
        assert_eq!(ids(&merged), vec!["a", "b", "c"]);
        assert_eq!(merged[0].get_str("n"), Some("1"));
        assert_eq!(merged[0].get_str("m"), Some("2"));
    }

    #[test]
    fn merge_batch_stamps_last_sync_even_without_changes() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap();
        let snapshot = Snapshot::default();
        let merged = merge_batch(&snapshot, &ExtractionBatch::default(), now);
        assert_eq!(merged.last_sync, Some(now));
        assert_eq!(merged.counts().total(), 0);
    }

    #[test]
    fn snapshot_json_shape_uses_millis_and_camel_case() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_123).single().unwrap();
        let mut snapshot = Snapshot::default();
        snapshot.last_sync = Some(now);
        snapshot.opportunities.push(
            Opportunity {
                id: "opp_1".into(),
                name: "Deal".into(),
                value: "$10".into(),
                status: "Active".into(),
                close_date: String::new(),
            }
            .to_record(),
        );
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["lastSync"], 1_700_000_000_123i64);
        assert_eq!(value["opportunities"][0]["closeDate"], "");
        assert_eq!(value["opportunities"][0]["id"], "opp_1");

        let empty: Snapshot = serde_json::from_str(r#"{"contacts":[],"opportunities":[],"tasks":[],"lastSync":null}"#).unwrap();
        assert_eq!(empty, Snapshot::default());
    }

    #[test]
    fn typed_views_fill_documented_defaults() {
        let task = Task::from_record(&rec("task_1", &[("description", "Call back")])).unwrap();
        assert_eq!(task.due_date, "No date");
        assert_eq!(task.assignee, "Me");
        assert!(!task.done);

        let opp = Opportunity::from_record(&rec("opp_1", &[("name", "Deal")])).unwrap();
        assert_eq!(opp.status, "Active");
        assert_eq!(opp.close_date, "");
    }

    #[test]
    fn contact_search_covers_name_lead_and_emails() {
        let contact = Contact {
            id: "con_1".into(),
            name: "Jane Doe".into(),
            emails: vec!["jane@acme.io".into()],
            phones: vec![],
            lead: "Acme Corp".into(),
        };
        assert!(contact.matches_query("jane"));
        assert!(contact.matches_query("ACME CORP"));
        assert!(contact.matches_query("@acme.io"));
        assert!(contact.matches_query(""));
        assert!(!contact.matches_query("globex"));
    }

    #[test]
    fn remove_drops_only_matching_id() {
        let mut snapshot = Snapshot::default();
        snapshot.contacts = vec![rec("a", &[]), rec("b", &[])];
        assert_eq!(snapshot.remove(Category::Contact, "a"), 1);
        assert_eq!(snapshot.remove(Category::Contact, "zzz"), 0);
        assert_eq!(ids(&snapshot.contacts), vec!["b"]);
    }

    #[test]
    fn category_parses_singular_plural_and_tag() {
        assert_eq!("contacts".parse::<Category>().unwrap(), Category::Contact);
        assert_eq!("opp".parse::<Category>().unwrap(), Category::Opportunity);
        assert_eq!("Task".parse::<Category>().unwrap(), Category::Task);
        assert!("lead".parse::<Category>().is_err());
    }

    #[test]
    fn unknown_category_is_a_boxable_error() {
        let err = "Leads".parse::<Category>().unwrap_err();
        assert_eq!(err.to_string(), "unknown record category `leads`");
        let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(err);
        assert!(boxed.source().is_none());
    }
}
