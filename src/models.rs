use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Stable id for a listing: hex SHA-256 over the normalized
/// `title|company|location` triple. Case, punctuation, and whitespace
/// differences between scrapes of the same posting collapse to one id.
pub fn job_id(title: &str, company: &str, location: &str) -> String {
    let key = format!(
        "{}|{}|{}",
        normalize_id_part(title),
        normalize_id_part(company),
        normalize_id_part(location)
    );
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

fn normalize_id_part(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_space = false;
    for ch in input.chars() {
        if ch.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
        } else {
            pending_space = true;
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub site_id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub country: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requirements: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub posted_date: Option<String>,
    pub scraped_at: DateTime<Utc>,
    pub run_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredJob {
    pub job_id: String,
    pub score: i64,
    pub reasoning: String,
    pub provider: String,
    pub scored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TailoredResume {
    pub job_id: String,
    pub html_path: String,
    pub pdf_path: String,
    pub verified: bool,
    pub verification_issues: Vec<String>,
    pub generated_at: DateTime<Utc>,
    pub run_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Matched,
    Applied,
    PhoneScreen,
    Interview,
    Offer,
    Rejected,
    Withdrawn,
    Expired,
}

impl ApplicationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Matched => "matched",
            Self::Applied => "applied",
            Self::PhoneScreen => "phone_screen",
            Self::Interview => "interview",
            Self::Offer => "offer",
            Self::Rejected => "rejected",
            Self::Withdrawn => "withdrawn",
            Self::Expired => "expired",
        }
    }

    pub fn parse(input: &str) -> anyhow::Result<Self> {
        match input {
            "matched" => Ok(Self::Matched),
            "applied" => Ok(Self::Applied),
            "phone_screen" => Ok(Self::PhoneScreen),
            "interview" => Ok(Self::Interview),
            "offer" => Ok(Self::Offer),
            "rejected" => Ok(Self::Rejected),
            "withdrawn" => Ok(Self::Withdrawn),
            "expired" => Ok(Self::Expired),
            other => anyhow::bail!("unknown application status: {other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub job_id: String,
    pub company: String,
    pub role: String,
    pub country: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_version: Option<String>,
    pub status: ApplicationStatus,
    pub status_updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub source_site: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackAction {
    Applied,
    Skipped,
    NotRelevant,
}

impl FeedbackAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Skipped => "skipped",
            Self::NotRelevant => "not_relevant",
        }
    }

    /// Parses a callback payload action. Button payloads use `skip` for the
    /// skipped action.
    pub fn parse(input: &str) -> anyhow::Result<Self> {
        match input {
            "applied" => Ok(Self::Applied),
            "skip" | "skipped" => Ok(Self::Skipped),
            "not_relevant" => Ok(Self::NotRelevant),
            other => anyhow::bail!("unknown feedback action: {other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub job_id: String,
    pub score: i64,
    pub action: FeedbackAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Crashed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Crashed => "crashed",
        }
    }

    pub fn parse(input: &str) -> anyhow::Result<Self> {
        match input {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "crashed" => Ok(Self::Crashed),
            other => anyhow::bail!("unknown run status: {other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteFailure {
    pub site: String,
    pub error: String,
    pub stage: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub sites_attempted: u64,
    pub sites_succeeded: u64,
    pub sites_failed: Vec<SiteFailure>,
    pub jobs_scraped: u64,
    pub jobs_new: u64,
    pub jobs_filtered_out: u64,
    pub jobs_scored: u64,
    pub jobs_above_threshold: u64,
    pub resumes_generated: u64,
    pub notifications_sent: u64,
    pub errors: Vec<String>,
    pub llm_providers_used: Vec<String>,
}

impl PipelineRun {
    pub fn new(run_id: String, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            completed_at: None,
            status: RunStatus::Running,
            sites_attempted: 0,
            sites_succeeded: 0,
            sites_failed: Vec::new(),
            jobs_scraped: 0,
            jobs_new: 0,
            jobs_filtered_out: 0,
            jobs_scored: 0,
            jobs_above_threshold: 0,
            resumes_generated: 0,
            notifications_sent: 0,
            errors: Vec::new(),
            llm_providers_used: Vec::new(),
        }
    }
}

// --- Site configuration ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    pub site_id: String,
    pub name: String,
    pub url: String,
    pub country: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(flatten)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub detail_page: Option<DetailPageConfig>,
    #[serde(default)]
    pub keywords: Option<SiteKeywords>,
    /// Pause between page fetches of one site.
    #[serde(default)]
    pub delay_ms: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_max_pages() -> u32 {
    1
}

/// Strategy payload, selected by the `strategy` string in the site file.
/// An unknown strategy fails the config parse instead of being skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum StrategyConfig {
    Api(ApiStrategyConfig),
    Html(HtmlStrategyConfig),
    Browser(BrowserStrategyConfig),
}

impl StrategyConfig {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Api(_) => "api",
            Self::Html(_) => "html",
            Self::Browser(_) => "browser",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiStrategyConfig {
    /// Request URL; `{page}` is substituted before the call.
    pub list_url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Dot-path from the response root to the array of listings.
    pub listings_path: String,
    /// Per-field dot-path into each listing object.
    pub fields: HashMap<String, String>,
}

fn default_method() -> String {
    "get".to_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HtmlStrategyConfig {
    /// List page URL; `{page}` is substituted before the fetch.
    pub list_url: String,
    pub card_selector: String,
    pub fields: HashMap<String, FieldSelector>,
    #[serde(default)]
    pub pagination: PaginationMode,
    /// Anchor pointing at the next list page; required for `next_button`.
    #[serde(default)]
    pub next_selector: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationMode {
    #[default]
    UrlParam,
    NextButton,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserStrategyConfig {
    pub list_url: String,
    /// Selector to wait for after navigation.
    pub wait_for: String,
    /// Scroll-to-bottom passes for lazily loaded lists.
    #[serde(default)]
    pub scroll_passes: u32,
    pub card_selector: String,
    pub fields: HashMap<String, FieldSelector>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSelector {
    pub selector: String,
    /// `text`, `href`, `src`, or any attribute name.
    #[serde(default = "default_attribute")]
    pub attribute: String,
    /// Prepended to the extracted value (relative URLs).
    #[serde(default)]
    pub prefix: Option<String>,
}

fn default_attribute() -> String {
    "text".to_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailPageConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub description_selector: Option<String>,
    #[serde(default)]
    pub requirements_selector: Option<String>,
}

// --- Keyword configuration ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeywordConfig {
    #[serde(default)]
    pub must_have_any: Vec<String>,
    #[serde(default)]
    pub must_not_have: Vec<String>,
    #[serde(default)]
    pub title_must_have_any: Vec<String>,
}

/// Per-site keyword block. With `override: true` the site lists replace the
/// global ones; otherwise they are unioned in (case-insensitive dedup).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteKeywords {
    #[serde(rename = "override", default)]
    pub replace: bool,
    #[serde(default)]
    pub must_have_any: Vec<String>,
    #[serde(default)]
    pub must_not_have: Vec<String>,
    #[serde(default)]
    pub title_must_have_any: Vec<String>,
}

impl KeywordConfig {
    pub fn effective(&self, site: Option<&SiteKeywords>) -> KeywordConfig {
        let Some(site) = site else {
            return self.clone();
        };
        if site.replace {
            return KeywordConfig {
                must_have_any: site.must_have_any.clone(),
                must_not_have: site.must_not_have.clone(),
                title_must_have_any: site.title_must_have_any.clone(),
            };
        }
        KeywordConfig {
            must_have_any: union_keywords(&self.must_have_any, &site.must_have_any),
            must_not_have: union_keywords(&self.must_not_have, &site.must_not_have),
            title_must_have_any: union_keywords(
                &self.title_must_have_any,
                &site.title_must_have_any,
            ),
        }
    }
}

fn union_keywords(global: &[String], site: &[String]) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    let mut out = Vec::new();
    for kw in global.iter().chain(site.iter()) {
        let lower = kw.to_lowercase();
        if seen.contains(&lower) {
            continue;
        }
        seen.push(lower);
        out.push(kw.clone());
    }
    out
}
