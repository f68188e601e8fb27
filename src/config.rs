use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::models::{KeywordConfig, SiteConfig};

pub const TELEGRAM_TOKEN_ENV: &str = "TELEGRAM_BOT_TOKEN";
pub const TELEGRAM_CHAT_ID_ENV: &str = "TELEGRAM_CHAT_ID";
pub const SMTP_PASSWORD_ENV: &str = "SMTP_PASSWORD";
pub const PRIMARY_BASE_URL_ENV: &str = "JOBHUNTER_LLM_BASE_URL";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub scoring: ScoringSettings,
    #[serde(default)]
    pub notifications: NotificationSettings,
    pub llm: LlmSettings,
    #[serde(default)]
    pub scrape: ScrapeSettings,
    #[serde(default)]
    pub keywords: KeywordConfig,
    #[serde(default)]
    pub paths: PathSettings,
    #[serde(default)]
    pub pdf: PdfSettings,
    #[serde(skip)]
    pub secrets: Secrets,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoringSettings {
    /// Named weight → points breakdown, echoed into the scoring prompt.
    pub weights: BTreeMap<String, u32>,
    /// Minimum score at which a résumé is tailored.
    #[serde(default = "default_score_threshold")]
    pub score_threshold: i64,
    /// Listing text beyond this many characters is truncated in prompts.
    #[serde(default = "default_max_listing_chars")]
    pub max_listing_chars: usize,
}

fn default_score_threshold() -> i64 {
    60
}

fn default_max_listing_chars() -> usize {
    8000
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationSettings {
    #[serde(default = "default_instant_threshold")]
    pub instant_threshold: i64,
    #[serde(default = "default_digest_threshold")]
    pub digest_threshold: i64,
    #[serde(default = "default_log_threshold")]
    pub log_threshold: i64,
    #[serde(default = "default_telegram_api_base")]
    pub telegram_api_base: String,
    #[serde(default)]
    pub smtp: Option<SmtpSettings>,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            instant_threshold: default_instant_threshold(),
            digest_threshold: default_digest_threshold(),
            log_threshold: default_log_threshold(),
            telegram_api_base: default_telegram_api_base(),
            smtp: None,
        }
    }
}

fn default_instant_threshold() -> i64 {
    80
}

fn default_digest_threshold() -> i64 {
    60
}

fn default_log_threshold() -> i64 {
    40
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_owned()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpSettings {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: String,
    pub from: String,
    pub to: String,
}

fn default_smtp_port() -> u16 {
    587
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmSettings {
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_json_retries")]
    pub json_retries: usize,
    pub providers: Vec<ProviderSettings>,
}

fn default_llm_timeout_secs() -> u64 {
    60
}

fn default_json_retries() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScrapeSettings {
    pub timeout_secs: u64,
    /// Delay schedule between page-fetch retries; its length is the retry count.
    pub retry_backoff_secs: Vec<u64>,
    pub max_workers: usize,
}

impl Default for ScrapeSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            retry_backoff_secs: vec![1, 3, 10],
            max_workers: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSettings {
    pub name: String,
    pub base_url: String,
    pub model: String,
    /// Environment variable holding this provider's API key, if it needs one.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(skip)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    pub site_configs_dir: PathBuf,
    pub master_resume: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            output_dir: PathBuf::from("output"),
            log_dir: PathBuf::from("logs"),
            site_configs_dir: PathBuf::from("config/site_configs"),
            master_resume: PathBuf::from("config/master_resume.yaml"),
        }
    }
}

impl PathSettings {
    pub fn database(&self) -> PathBuf {
        self.data_dir.join("jobhunter.db")
    }

    pub fn checkpoint(&self) -> PathBuf {
        self.data_dir.join("checkpoints").join("last_run.json")
    }

    pub fn raw_archive(&self) -> PathBuf {
        self.data_dir.join("raw")
    }

    pub fn resumes(&self) -> PathBuf {
        self.output_dir.join("resumes")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PdfSettings {
    /// External HTML→PDF renderer, invoked as `<bin> <html> <pdf>`.
    pub renderer_bin: String,
}

impl Default for PdfSettings {
    fn default() -> Self {
        Self {
            renderer_bin: "wkhtmltopdf".to_owned(),
        }
    }
}

/// Secrets come only from the environment, never from the settings file.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub smtp_password: Option<String>,
}

pub fn load_settings(path: &str) -> anyhow::Result<Settings> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read settings: {path}"))?;
    let mut settings: Settings =
        serde_yaml::from_str(&text).with_context(|| format!("parse settings: {path}"))?;

    if settings.llm.providers.is_empty() {
        anyhow::bail!("settings must configure at least one llm provider");
    }

    if let Ok(base_url) = std::env::var(PRIMARY_BASE_URL_ENV)
        && !base_url.trim().is_empty()
    {
        settings.llm.providers[0].base_url = base_url;
    }
    for provider in &mut settings.llm.providers {
        if let Some(env) = provider.api_key_env.as_deref() {
            provider.api_key = std::env::var(env).ok().filter(|v| !v.trim().is_empty());
        }
    }

    settings.secrets = Secrets {
        telegram_bot_token: non_empty_env(TELEGRAM_TOKEN_ENV),
        telegram_chat_id: non_empty_env(TELEGRAM_CHAT_ID_ENV),
        smtp_password: non_empty_env(SMTP_PASSWORD_ENV),
    };

    Ok(settings)
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// The master résumé is opaque nested data: parsed only to prove it is valid
/// YAML with the expected top-level sections, then rendered back verbatim
/// into prompts.
#[derive(Debug, Clone, Serialize)]
pub struct MasterResume {
    raw: serde_yaml::Value,
}

const RESUME_SECTIONS: &[&str] = &["personal", "summary", "experience", "skills"];

impl MasterResume {
    pub fn to_prompt_text(&self) -> String {
        serde_yaml::to_string(&self.raw).unwrap_or_default()
    }
}

pub fn load_master_resume(path: &Path) -> anyhow::Result<MasterResume> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read master resume: {}", path.display()))?;
    let raw: serde_yaml::Value = serde_yaml::from_str(&text)
        .with_context(|| format!("parse master resume: {}", path.display()))?;

    let mapping = raw
        .as_mapping()
        .ok_or_else(|| anyhow::anyhow!("master resume must be a mapping: {}", path.display()))?;
    for section in RESUME_SECTIONS {
        if !mapping.contains_key(&serde_yaml::Value::from(*section)) {
            anyhow::bail!(
                "master resume is missing the `{section}` section: {}",
                path.display()
            );
        }
    }

    Ok(MasterResume { raw })
}

/// Loads every site config under `dir`, skipping `_`-prefixed templates.
/// Disabled sites are dropped here; a malformed file fails the load.
pub fn load_site_configs(dir: &Path) -> anyhow::Result<Vec<SiteConfig>> {
    let mut sites = Vec::new();

    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("read site configs dir: {}", dir.display()))?;
    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("iterate dir: {}", dir.display()))?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('_') {
            continue;
        }
        if !matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        ) {
            continue;
        }
        paths.push(path);
    }
    paths.sort();

    for path in paths {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("read site config: {}", path.display()))?;
        let site: SiteConfig = serde_yaml::from_str(&text)
            .with_context(|| format!("parse site config: {}", path.display()))?;
        if !site.enabled {
            tracing::debug!(site = %site.site_id, "site disabled; skipping");
            continue;
        }
        sites.push(site);
    }

    Ok(sites)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_SETTINGS: &str = r#"
scoring:
  weights:
    skills_match: 50
    experience_level: 30
    location: 20
llm:
  providers:
    - name: primary
      base_url: http://localhost:8080/v1
      model: test-model
"#;

    #[test]
    fn settings_parse_applies_defaults() {
        let settings: Settings = serde_yaml::from_str(MINIMAL_SETTINGS).expect("parse settings");
        assert_eq!(settings.scoring.score_threshold, 60);
        assert_eq!(settings.scoring.max_listing_chars, 8000);
        assert_eq!(settings.notifications.instant_threshold, 80);
        assert_eq!(settings.notifications.digest_threshold, 60);
        assert_eq!(settings.notifications.log_threshold, 40);
        assert_eq!(settings.llm.timeout_secs, 60);
        assert_eq!(settings.llm.json_retries, 1);
        assert_eq!(settings.paths.database(), PathBuf::from("data/jobhunter.db"));
        assert_eq!(
            settings.paths.checkpoint(),
            PathBuf::from("data/checkpoints/last_run.json")
        );
    }

    #[test]
    fn site_config_loader_skips_templates_and_disabled() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let site = |id: &str, enabled: bool| {
            format!(
                r#"
site_id: {id}
name: {id}
url: https://{id}.example
country: NL
enabled: {enabled}
strategy: html
list_url: "https://{id}.example/jobs?page={{page}}"
card_selector: ".job"
fields:
  title: {{ selector: ".t" }}
"#
            )
        };
        std::fs::write(dir.path().join("one.yaml"), site("one", true))?;
        std::fs::write(dir.path().join("two.yaml"), site("two", false))?;
        std::fs::write(dir.path().join("_template.yaml"), site("tmpl", true))?;
        std::fs::write(dir.path().join("notes.txt"), "not a site")?;

        let sites = load_site_configs(dir.path())?;
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].site_id, "one");
        Ok(())
    }

    #[test]
    fn master_resume_requires_expected_sections() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("master_resume.yaml");
        std::fs::write(&path, "personal:\n  name: Tester\n")?;
        let err = load_master_resume(&path).unwrap_err();
        assert!(err.to_string().contains("summary"));

        std::fs::write(
            &path,
            "personal:\n  name: Tester\nsummary:\n  default: Engineer\nexperience: []\nskills: {}\n",
        )?;
        let resume = load_master_resume(&path)?;
        assert!(resume.to_prompt_text().contains("Tester"));
        Ok(())
    }
}
