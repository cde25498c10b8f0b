//! Record extraction from rendered CRM list views.
//!
//! Row classification and field lookup are driven by [`ExtractionRules`], a
//! plain data description that compiles to `scraper` selectors. The built-in
//! rules target Close list views; a YAML file can replace them.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crmx_core::{
    generate_id, Category, Contact, Discriminator, ExtractionBatch, Opportunity, Record, Task,
    TypedRecord,
};
use crmx_storage::HttpFetcher;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "crmx-adapters";

pub const UNSUPPORTED_VIEW_MESSAGE: &str = "Navigate to a list view in Close";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Navigate to a list view in Close")]
    UnsupportedView { url: String },
    #[error("invalid selector `{selector}`: {reason}")]
    InvalidSelector { selector: String, reason: String },
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Ordered selector fallback chain with a default for when nothing matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChain {
    pub selectors: Vec<String>,
    #[serde(default)]
    pub default: String,
}

impl FieldChain {
    fn new(selectors: &[&str], default: &str) -> Self {
        Self {
            selectors: selectors.iter().map(|s| s.to_string()).collect(),
            default: default.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierRule {
    pub category: Category,
    pub markers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRules {
    pub name: FieldChain,
    pub emails: Vec<String>,
    pub phones: Vec<String>,
    pub lead: FieldChain,
    /// Column captions that show up when a header row carries a mailto link.
    #[serde(default)]
    pub header_labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpportunityRules {
    pub name: FieldChain,
    pub status: FieldChain,
    pub close_date: FieldChain,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRules {
    pub due_date: FieldChain,
    pub assignee: FieldChain,
    pub done: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewRules {
    pub url_patterns: Vec<String>,
    #[serde(default)]
    pub dom_markers: Vec<String>,
}

/// Selector tables for one CRM. Classifiers are tried in order and the first
/// matching category owns the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRules {
    pub rows: Vec<String>,
    pub classifiers: Vec<ClassifierRule>,
    pub contact: ContactRules,
    pub opportunity: OpportunityRules,
    pub task: TaskRules,
    pub view: ViewRules,
}

impl Default for ExtractionRules {
    fn default() -> Self {
        Self {
            rows: strings(&["tr", "[role=\"row\"]", ".ContactListRow", ".list-row"]),
            classifiers: vec![
                ClassifierRule {
                    category: Category::Contact,
                    markers: strings(&["a[href^=\"mailto:\"]"]),
                },
                ClassifierRule {
                    category: Category::Opportunity,
                    markers: strings(&[
                        "[data-testid*=\"value\"]",
                        ".opportunity-value",
                        ".OpportunityValue",
                    ]),
                },
                ClassifierRule {
                    category: Category::Task,
                    markers: strings(&[".description", ".TaskDescription", "[data-testid*=\"task\"]"]),
                },
            ],
            contact: ContactRules {
                name: FieldChain::new(&["td:first-child a", "[data-testid*=\"name\"]", ".ContactName"], ""),
                emails: strings(&["a[href^=\"mailto:\"]"]),
                phones: strings(&["a[href^=\"tel:\"]"]),
                lead: FieldChain::new(&["td:nth-child(2)", ".lead"], ""),
                header_labels: strings(&["Name"]),
            },
            opportunity: OpportunityRules {
                name: FieldChain::new(&[".opp-name", "[data-testid*=\"title\"]", ".OpportunityTitle"], "Opportunity"),
                status: FieldChain::new(&[".status", ".OpportunityStatus"], "Active"),
                close_date: FieldChain::new(&[".date", ".ExpectedCloseDate"], ""),
            },
            task: TaskRules {
                due_date: FieldChain::new(&[".due-date", ".TaskDueDate"], "No date"),
                assignee: FieldChain::new(&[".assignee", ".TaskAssignee"], "Me"),
                done: strings(&["input[type=\"checkbox\"][checked]"]),
            },
            view: ViewRules {
                url_patterns: strings(&["/leads", "/contacts", "/opportunities", "/tasks"]),
                dom_markers: strings(&["a[href^=\"mailto:\"]"]),
            },
        }
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

impl ExtractionRules {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing extraction rules")
    }
}

pub fn load_rules(path: impl AsRef<Path>) -> Result<ExtractionRules> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    ExtractionRules::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Built-in rules unless a rules file is configured.
pub fn load_rules_or_default(path: Option<&Path>) -> Result<ExtractionRules> {
    match path {
        Some(path) => load_rules(path),
        None => Ok(ExtractionRules::default()),
    }
}

fn compile(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::InvalidSelector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

fn compile_all(selectors: &[String]) -> Result<Vec<Selector>, AdapterError> {
    selectors.iter().map(|s| compile(s)).collect()
}

struct CompiledChain {
    selectors: Vec<Selector>,
    default: String,
}

impl CompiledChain {
    fn compile(chain: &FieldChain) -> Result<Self, AdapterError> {
        Ok(Self {
            selectors: compile_all(&chain.selectors)?,
            default: chain.default.clone(),
        })
    }

    /// First selector whose first match carries text.
    fn find(&self, row: ElementRef<'_>) -> Option<String> {
        self.selectors.iter().find_map(|sel| {
            row.select(sel)
                .next()
                .and_then(|el| text_or_none(element_text(el)))
        })
    }

    fn text_or_default(&self, row: ElementRef<'_>) -> String {
        self.find(row).unwrap_or_else(|| self.default.clone())
    }
}

struct CompiledClassifier {
    category: Category,
    markers: Vec<Selector>,
}

impl CompiledClassifier {
    fn marker<'a>(&self, row: ElementRef<'a>) -> Option<ElementRef<'a>> {
        self.markers.iter().find_map(|sel| row.select(sel).next())
    }
}

/// Collapse whitespace runs the way rendered text reads.
fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn mailto_address(el: ElementRef<'_>) -> Option<String> {
    text_or_none(element_text(el)).or_else(|| {
        let href = el.value().attr("href")?;
        let address = href.strip_prefix("mailto:").unwrap_or(href);
        let address = address.split('?').next().unwrap_or_default();
        text_or_none(address.to_string())
    })
}

fn any_match(root: ElementRef<'_>, selectors: &[Selector]) -> bool {
    selectors.iter().any(|sel| root.select(sel).next().is_some())
}

fn dedup_last_seen_wins(records: Vec<Record>) -> Vec<Record> {
    let mut out: Vec<Record> = Vec::with_capacity(records.len());
    for record in records {
        match out.iter_mut().find(|r| r.id == record.id) {
            Some(slot) => *slot = record,
            None => out.push(record),
        }
    }
    out
}

/// Compiled extractor. Selector errors surface here, never during extraction.
pub struct RecordExtractor {
    rows: Selector,
    classifiers: Vec<CompiledClassifier>,
    contact_name: CompiledChain,
    contact_emails: Vec<Selector>,
    contact_phones: Vec<Selector>,
    contact_lead: CompiledChain,
    header_labels: Vec<String>,
    opportunity_name: CompiledChain,
    opportunity_status: CompiledChain,
    opportunity_close_date: CompiledChain,
    task_due_date: CompiledChain,
    task_assignee: CompiledChain,
    task_done: Vec<Selector>,
    url_patterns: Vec<String>,
    dom_markers: Vec<Selector>,
}

impl RecordExtractor {
    pub fn new(rules: &ExtractionRules) -> Result<Self, AdapterError> {
        if rules.rows.is_empty() {
            return Err(AdapterError::Message("extraction rules list no row selectors".into()));
        }
        Ok(Self {
            rows: compile(&rules.rows.join(", "))?,
            classifiers: rules
                .classifiers
                .iter()
                .map(|c| {
                    Ok(CompiledClassifier {
                        category: c.category,
                        markers: compile_all(&c.markers)?,
                    })
                })
                .collect::<Result<_, AdapterError>>()?,
            contact_name: CompiledChain::compile(&rules.contact.name)?,
            contact_emails: compile_all(&rules.contact.emails)?,
            contact_phones: compile_all(&rules.contact.phones)?,
            contact_lead: CompiledChain::compile(&rules.contact.lead)?,
            header_labels: rules.contact.header_labels.clone(),
            opportunity_name: CompiledChain::compile(&rules.opportunity.name)?,
            opportunity_status: CompiledChain::compile(&rules.opportunity.status)?,
            opportunity_close_date: CompiledChain::compile(&rules.opportunity.close_date)?,
            task_due_date: CompiledChain::compile(&rules.task.due_date)?,
            task_assignee: CompiledChain::compile(&rules.task.assignee)?,
            task_done: compile_all(&rules.task.done)?,
            url_patterns: rules.view.url_patterns.clone(),
            dom_markers: compile_all(&rules.view.dom_markers)?,
        })
    }

    pub fn with_default_rules() -> Result<Self, AdapterError> {
        Self::new(&ExtractionRules::default())
    }

    pub fn count_rows(&self, document: &Html) -> usize {
        document.select(&self.rows).count()
    }

    pub fn count_rows_in(&self, html: &str) -> usize {
        self.count_rows(&Html::parse_document(html))
    }

    /// URL pattern first, then any configured DOM marker.
    pub fn is_supported_view(&self, url: &str, document: &Html) -> bool {
        if self.url_patterns.iter().any(|p| url.contains(p.as_str())) {
            return true;
        }
        any_match(document.root_element(), &self.dom_markers)
    }

    /// Classify every row and pull its fields. Unusable rows are skipped.
    pub fn extract(&self, document: &Html) -> ExtractionBatch {
        let mut batch = ExtractionBatch::default();
        let mut rows = 0usize;
        let mut dropped = 0usize;

        for row in document.select(&self.rows) {
            rows += 1;
            let Some((category, marker)) = self
                .classifiers
                .iter()
                .find_map(|c| c.marker(row).map(|m| (c.category, m)))
            else {
                continue;
            };

            let record = match category {
                Category::Contact => self.contact_from_row(row),
                Category::Opportunity => Some(self.opportunity_from_row(row, marker)),
                Category::Task => self.task_from_row(row, marker),
            };

            match (category, record) {
                (Category::Contact, Some(r)) => batch.contacts.push(r),
                (Category::Opportunity, Some(r)) => batch.opportunities.push(r),
                (Category::Task, Some(r)) => batch.tasks.push(r),
                (_, None) => dropped += 1,
            }
        }

        batch.contacts = dedup_last_seen_wins(batch.contacts);
        debug!(
            rows,
            dropped,
            contacts = batch.contacts.len(),
            opportunities = batch.opportunities.len(),
            tasks = batch.tasks.len(),
            "classified list rows"
        );
        batch
    }

    pub fn extract_html(&self, html: &str) -> ExtractionBatch {
        self.extract(&Html::parse_document(html))
    }

    /// View check followed by extraction.
    pub fn extract_page(&self, page: &CapturedPage) -> Result<ExtractionBatch, AdapterError> {
        let document = Html::parse_document(&page.html);
        if !self.is_supported_view(&page.url, &document) {
            return Err(AdapterError::UnsupportedView { url: page.url.clone() });
        }
        Ok(self.extract(&document))
    }

    fn contact_from_row(&self, row: ElementRef<'_>) -> Option<Record> {
        let name = self.contact_name.find(row)?;
        if self.header_labels.iter().any(|label| label == &name) {
            return None;
        }

        let emails: Vec<String> = self
            .contact_emails
            .iter()
            .flat_map(|sel| row.select(sel))
            .filter_map(mailto_address)
            .collect();
        let phones: Vec<String> = self
            .contact_phones
            .iter()
            .flat_map(|sel| row.select(sel))
            .filter_map(|el| text_or_none(element_text(el)))
            .collect();
        let lead = self.contact_lead.text_or_default(row);

        let discriminator = Discriminator::for_contact(&name, emails.first().map(String::as_str));
        if !discriminator.is_stable() {
            debug!(%name, "contact row has no email text; id will not be stable across runs");
        }

        Some(
            Contact {
                id: generate_id(Category::Contact, discriminator.text()),
                name,
                emails,
                phones,
                lead,
            }
            .to_record(),
        )
    }

    fn opportunity_from_row(&self, row: ElementRef<'_>, value_el: ElementRef<'_>) -> Record {
        let name = self.opportunity_name.text_or_default(row);
        Opportunity {
            id: generate_id(Category::Opportunity, &name),
            name,
            value: element_text(value_el),
            status: self.opportunity_status.text_or_default(row),
            close_date: self.opportunity_close_date.text_or_default(row),
        }
        .to_record()
    }

    fn task_from_row(&self, row: ElementRef<'_>, description_el: ElementRef<'_>) -> Option<Record> {
        let description = text_or_none(element_text(description_el))?;
        Some(
            Task {
                id: generate_id(Category::Task, &description),
                description,
                due_date: self.task_due_date.text_or_default(row),
                assignee: self.task_assignee.text_or_default(row),
                done: any_match(row, &self.task_done),
            }
            .to_record(),
        )
    }
}

/// Rendered document as seen at one moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPage {
    pub url: String,
    pub html: String,
    pub captured_at: DateTime<Utc>,
}

impl CapturedPage {
    pub fn new(url: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            html: html.into(),
            captured_at: Utc::now(),
        }
    }
}

/// Read-only access to the document being extracted from.
#[async_trait]
pub trait PageSource: Send + Sync {
    fn describe(&self) -> String;
    async fn capture(&self) -> Result<CapturedPage, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct StaticPage {
    url: String,
    html: String,
}

impl StaticPage {
    pub fn new(url: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            html: html.into(),
        }
    }
}

#[async_trait]
impl PageSource for StaticPage {
    fn describe(&self) -> String {
        format!("static page {}", self.url)
    }

    async fn capture(&self) -> Result<CapturedPage, AdapterError> {
        Ok(CapturedPage::new(self.url.clone(), self.html.clone()))
    }
}

/// Saved page on disk, re-read on every capture.
#[derive(Debug, Clone)]
pub struct FilePage {
    url: String,
    path: PathBuf,
}

impl FilePage {
    pub fn new(url: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl PageSource for FilePage {
    fn describe(&self) -> String {
        format!("{} (as {})", self.path.display(), self.url)
    }

    async fn capture(&self) -> Result<CapturedPage, AdapterError> {
        let html = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading saved page {}", self.path.display()))?;
        Ok(CapturedPage::new(self.url.clone(), html))
    }
}

/// Page fetched over HTTP on every capture.
#[derive(Debug, Clone)]
pub struct HttpPage {
    url: String,
    fetcher: HttpFetcher,
}

impl HttpPage {
    pub fn new(url: impl Into<String>, fetcher: HttpFetcher) -> Self {
        Self {
            url: url.into(),
            fetcher,
        }
    }
}

#[async_trait]
impl PageSource for HttpPage {
    fn describe(&self) -> String {
        format!("remote page {}", self.url)
    }

    async fn capture(&self) -> Result<CapturedPage, AdapterError> {
        let resp = self
            .fetcher
            .fetch_bytes(&self.url)
            .await
            .map_err(|e| AdapterError::Message(e.to_string()))?;
        if !is_html_content_type(resp.content_type.as_deref()) {
            return Err(AdapterError::Message(format!(
                "{} did not return HTML (content type {})",
                resp.final_url,
                resp.content_type.as_deref().unwrap_or("unknown")
            )));
        }
        let html = String::from_utf8_lossy(&resp.body).into_owned();
        Ok(CapturedPage::new(resp.final_url, html))
    }
}

/// Missing content types are let through; servers often omit them.
fn is_html_content_type(content_type: Option<&str>) -> bool {
    match content_type {
        None => true,
        Some(value) => {
            let mime = value.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
            mime == "text/html" || mime == "application/xhtml+xml"
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(3000),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Poll the source until list rows render or the deadline passes.
///
/// Fail-open: on timeout the latest capture is returned as is.
pub async fn wait_for_rows(
    source: &dyn PageSource,
    extractor: &RecordExtractor,
    policy: WaitPolicy,
) -> Result<CapturedPage, AdapterError> {
    let deadline = Instant::now() + policy.timeout;
    loop {
        let page = source.capture().await?;
        if extractor.count_rows_in(&page.html) > 0 {
            return Ok(page);
        }
        let now = Instant::now();
        if now >= deadline {
            warn!(
                source = %source.describe(),
                timeout_ms = policy.timeout.as_millis() as u64,
                "no list rows rendered before timeout; continuing with current page"
            );
            return Ok(page);
        }
        let pause = policy.poll_interval.min(deadline - now).max(Duration::from_millis(1));
        tokio::time::sleep(pause).await;
    }
}
