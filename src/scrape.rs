use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use chrono::Utc;
use scraper::{Html, Selector};

use crate::archive;
use crate::config::ScrapeSettings;
use crate::models::{
    ApiStrategyConfig, BrowserStrategyConfig, DetailPageConfig, FieldSelector, Job,
    PaginationMode, SiteConfig, SiteFailure, StrategyConfig, job_id,
};

/// One extracted listing before normalization. Field names in strategy
/// configs map onto these slots; unknown names are ignored with a warning.
#[derive(Debug, Clone, Default)]
struct RawRow {
    title: String,
    company: String,
    location: String,
    url: String,
    salary: Option<String>,
    description: Option<String>,
    requirements: Option<String>,
    posted_date: Option<String>,
}

impl RawRow {
    fn set_field(&mut self, name: &str, value: String) {
        match name {
            "title" => self.title = value,
            "company" => self.company = value,
            "location" => self.location = value,
            "url" => self.url = value,
            "salary" => self.salary = Some(value),
            "description" => self.description = Some(value),
            "requirements" => self.requirements = Some(value),
            "posted_date" => self.posted_date = Some(value),
            other => tracing::warn!(field = other, "unknown field in site config; ignoring"),
        }
    }
}

/// One fetched page: extracted rows plus, for `next_button` pagination, the
/// resolved URL of the following page.
#[derive(Debug)]
struct PageFetch {
    rows: Vec<RawRow>,
    next_url: Option<String>,
}

fn uses_next_button(site: &SiteConfig) -> bool {
    matches!(
        &site.strategy,
        StrategyConfig::Html(html) if html.pagination == PaginationMode::NextButton
    )
}

#[derive(Debug, Default)]
pub struct ScrapeReport {
    /// Jobs per site that completed, in completion order.
    pub site_jobs: Vec<(String, Vec<Job>)>,
    pub failures: Vec<SiteFailure>,
}

#[derive(Clone)]
pub struct Scraper {
    client: reqwest::Client,
    archive_root: PathBuf,
    run_id: String,
    backoff_secs: Vec<u64>,
}

impl Scraper {
    pub fn new(
        settings: &ScrapeSettings,
        archive_root: PathBuf,
        run_id: String,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .user_agent(concat!("jobhunter/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .context("build scrape http client")?;
        Ok(Self {
            client,
            archive_root,
            run_id,
            backoff_secs: settings.retry_backoff_secs.clone(),
        })
    }

    /// Scrapes the given sites concurrently with a bounded worker count.
    /// A failing site is quarantined into the report; siblings finish.
    pub async fn scrape_sites(&self, sites: &[SiteConfig], max_workers: usize) -> ScrapeReport {
        let concurrency = sites.len().min(max_workers).max(1);
        tracing::info!(sites = sites.len(), concurrency, "scrape: start");

        let mut report = ScrapeReport::default();
        let mut join_set = tokio::task::JoinSet::new();
        let mut next_idx = 0usize;

        while next_idx < sites.len() || !join_set.is_empty() {
            while next_idx < sites.len() && join_set.len() < concurrency {
                let site = sites[next_idx].clone();
                let scraper = self.clone();
                join_set.spawn(async move {
                    let site_id = site.site_id.clone();
                    let outcome = scraper.scrape_site(&site).await;
                    (site_id, outcome)
                });
                next_idx += 1;
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            match joined {
                Ok((site_id, Ok(jobs))) => {
                    tracing::info!(site = %site_id, jobs = jobs.len(), "scrape: site done");
                    report.site_jobs.push((site_id, jobs));
                }
                Ok((site_id, Err(err))) => {
                    tracing::error!(site = %site_id, error = %format!("{err:#}"), stage = "scrape", "scrape: site failed");
                    report.failures.push(SiteFailure {
                        site: site_id,
                        error: format!("{err:#}"),
                        stage: "scrape".to_owned(),
                    });
                }
                Err(join_err) => {
                    tracing::error!(error = %join_err, "scrape: worker panicked");
                    report.failures.push(SiteFailure {
                        site: "unknown".to_owned(),
                        error: format!("scrape worker panicked: {join_err}"),
                        stage: "scrape".to_owned(),
                    });
                }
            }
        }

        report
    }

    async fn scrape_site(&self, site: &SiteConfig) -> anyhow::Result<Vec<Job>> {
        let mut rows = Vec::new();
        let mut next_url: Option<String> = None;

        for page in 1..=site.max_pages {
            if page > 1 && site.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(site.delay_ms)).await;
            }

            let fetched = self
                .fetch_page_with_retry(site, page, next_url.as_deref())
                .await
                .with_context(|| format!("page {page}"))?;
            if fetched.rows.is_empty() {
                tracing::debug!(site = %site.site_id, page, "empty page; stopping pagination");
                break;
            }
            rows.extend(fetched.rows);

            // next_button pagination ends when the page has no next link.
            if uses_next_button(site) {
                match fetched.next_url {
                    Some(url) => next_url = Some(url),
                    None => break,
                }
            }
        }

        if let Some(detail) = &site.detail_page
            && detail.enabled
        {
            self.fetch_detail_pages(site, detail, &mut rows).await;
        }

        Ok(self.normalize_rows(site, rows))
    }

    /// One page: fetch, archive the raw text before parsing, then extract.
    /// Transient failures (transport, non-2xx, page-level extraction) retry
    /// on the configured backoff schedule before the site is abandoned.
    async fn fetch_page_with_retry(
        &self,
        site: &SiteConfig,
        page: u32,
        url_override: Option<&str>,
    ) -> anyhow::Result<PageFetch> {
        let attempts = self.backoff_secs.len() + 1;
        let mut last_err = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.backoff_secs[attempt - 1];
                tracing::warn!(
                    site = %site.site_id,
                    page,
                    attempt,
                    delay_secs = delay,
                    "retrying page fetch"
                );
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }

            match self.fetch_page(site, page, url_override).await {
                Ok(fetched) => return Ok(fetched),
                Err(err) => last_err = Some(err),
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no fetch attempts made")))
    }

    async fn fetch_page(
        &self,
        site: &SiteConfig,
        page: u32,
        url_override: Option<&str>,
    ) -> anyhow::Result<PageFetch> {
        let page_url = match (&site.strategy, url_override) {
            (StrategyConfig::Html(_), Some(url)) => url.to_owned(),
            (StrategyConfig::Api(api), _) => substitute_page(&api.list_url, page),
            (StrategyConfig::Html(html), None) => substitute_page(&html.list_url, page),
            (StrategyConfig::Browser(browser), _) => substitute_page(&browser.list_url, page),
        };

        let raw = match &site.strategy {
            StrategyConfig::Api(api) => self.fetch_api_text(api, page).await?,
            StrategyConfig::Html(_) => self.fetch_html_text(&page_url).await?,
            StrategyConfig::Browser(browser) => fetch_browser_text(browser, &page_url).await?,
        };

        let path = archive::raw_page_path(&self.archive_root, &site.site_id, page, Utc::now());
        archive::write_raw_page(&path, &raw)
            .with_context(|| format!("archive page {page}"))?;

        match &site.strategy {
            StrategyConfig::Api(api) => Ok(PageFetch {
                rows: parse_api_rows(&raw, api)?,
                next_url: None,
            }),
            StrategyConfig::Html(html) => Ok(PageFetch {
                rows: parse_html_rows(&raw, &html.card_selector, &html.fields)?,
                next_url: match html.pagination {
                    PaginationMode::NextButton => {
                        extract_next_url(&raw, html.next_selector.as_deref(), &page_url)?
                    }
                    PaginationMode::UrlParam => None,
                },
            }),
            StrategyConfig::Browser(browser) => Ok(PageFetch {
                rows: parse_html_rows(&raw, &browser.card_selector, &browser.fields)?,
                next_url: None,
            }),
        }
    }

    async fn fetch_api_text(&self, api: &ApiStrategyConfig, page: u32) -> anyhow::Result<String> {
        // `{page}` substitutes into both the URL and the parameter values.
        let url = substitute_page(&api.list_url, page);
        let params: Vec<(String, String)> = api
            .params
            .iter()
            .map(|(k, v)| (k.clone(), substitute_page(v, page)))
            .collect();

        let mut request = match api.method.to_lowercase().as_str() {
            "get" => self.client.get(&url).query(&params),
            "post" => {
                let body: serde_json::Map<String, serde_json::Value> = params
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::Value::String(v)))
                    .collect();
                self.client.post(&url).json(&body)
            }
            other => anyhow::bail!("unsupported api method: {other}"),
        };
        for (name, value) in &api.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.with_context(|| format!("GET {url}"))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("site returned {status} for {url}");
        }
        response.text().await.context("read api response body")
    }

    async fn fetch_html_text(&self, url: &str) -> anyhow::Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("site returned {status} for {url}");
        }
        response.text().await.context("read list page body")
    }

    async fn fetch_detail_pages(
        &self,
        site: &SiteConfig,
        detail: &DetailPageConfig,
        rows: &mut [RawRow],
    ) {
        for row in rows.iter_mut() {
            if row.url.trim().is_empty() {
                continue;
            }
            match self.fetch_detail(&row.url, detail).await {
                Ok((description, requirements)) => {
                    if description.is_some() {
                        row.description = description;
                    }
                    if requirements.is_some() {
                        row.requirements = requirements;
                    }
                }
                Err(err) => {
                    // The listing survives on list-page data alone.
                    tracing::warn!(
                        site = %site.site_id,
                        url = %row.url,
                        error = %format!("{err:#}"),
                        "detail page fetch failed; keeping row"
                    );
                }
            }
        }
    }

    async fn fetch_detail(
        &self,
        url: &str,
        detail: &DetailPageConfig,
    ) -> anyhow::Result<(Option<String>, Option<String>)> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("detail page returned {status}");
        }
        let body = response.text().await.context("read detail page body")?;
        Ok(extract_detail_fields(&body, detail))
    }

    fn normalize_rows(&self, site: &SiteConfig, rows: Vec<RawRow>) -> Vec<Job> {
        let scraped_at = Utc::now();
        let mut jobs = Vec::new();

        for row in rows {
            let title = row.title.trim();
            let company = row.company.trim();
            let location = row.location.trim();
            if title.is_empty() || company.is_empty() || location.is_empty() {
                tracing::debug!(site = %site.site_id, ?row, "dropping row with missing required fields");
                continue;
            }

            jobs.push(Job {
                id: job_id(title, company, location),
                site_id: site.site_id.clone(),
                title: title.to_owned(),
                company: company.to_owned(),
                location: location.to_owned(),
                country: site.country.clone(),
                url: row.url.trim().to_owned(),
                salary: trimmed_opt(row.salary),
                description: trimmed_opt(row.description),
                requirements: trimmed_opt(row.requirements),
                posted_date: trimmed_opt(row.posted_date),
                scraped_at,
                run_id: self.run_id.clone(),
            });
        }

        jobs
    }
}

fn trimmed_opt(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

fn substitute_page(template: &str, page: u32) -> String {
    template.replace("{page}", &page.to_string())
}

// --- api strategy ---

fn parse_api_rows(raw: &str, api: &ApiStrategyConfig) -> anyhow::Result<Vec<RawRow>> {
    let root: serde_json::Value = serde_json::from_str(raw).context("parse api response json")?;
    let listings = lookup_path(&root, &api.listings_path)
        .ok_or_else(|| anyhow::anyhow!("listings path not found: {}", api.listings_path))?
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("listings path is not an array: {}", api.listings_path))?
        .clone();

    let mut rows = Vec::new();
    for listing in &listings {
        let mut row = RawRow::default();
        for (field, path) in &api.fields {
            if let Some(value) = lookup_path(listing, path) {
                row.set_field(field, json_to_text(value));
            }
        }
        rows.push(row);
    }
    Ok(rows)
}

fn lookup_path<'a>(root: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = root;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        current = match segment.parse::<usize>() {
            Ok(index) => current.get(index)?,
            Err(_) => current.get(segment)?,
        };
    }
    Some(current)
}

fn json_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

// --- html selector schema (shared by html and browser strategies) ---

fn parse_html_rows(
    raw: &str,
    card_selector: &str,
    fields: &std::collections::HashMap<String, FieldSelector>,
) -> anyhow::Result<Vec<RawRow>> {
    let document = Html::parse_document(raw);
    let cards = parse_selector(card_selector)?;

    let mut rows = Vec::new();
    for card in document.select(&cards) {
        let mut row = RawRow::default();
        for (field, rule) in fields {
            let selector = parse_selector(&rule.selector)?;
            let Some(element) = card.select(&selector).next() else {
                continue;
            };
            let value = match rule.attribute.as_str() {
                "text" => element.text().collect::<String>(),
                attr => element.value().attr(attr).unwrap_or_default().to_owned(),
            };
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            let value = match &rule.prefix {
                Some(prefix) if !value.starts_with("http") => format!("{prefix}{value}"),
                _ => value.to_owned(),
            };
            row.set_field(field, value);
        }
        rows.push(row);
    }
    Ok(rows)
}

fn parse_selector(selector: &str) -> anyhow::Result<Selector> {
    Selector::parse(selector).map_err(|err| anyhow::anyhow!("invalid selector `{selector}`: {err}"))
}

/// Resolves the next-page link against the current page URL. A missing link
/// is the normal end of pagination, not an error.
fn extract_next_url(
    raw: &str,
    next_selector: Option<&str>,
    current_url: &str,
) -> anyhow::Result<Option<String>> {
    let next_selector = next_selector
        .ok_or_else(|| anyhow::anyhow!("next_button pagination requires next_selector"))?;
    let document = Html::parse_document(raw);
    let selector = parse_selector(next_selector)?;

    let Some(href) = document
        .select(&selector)
        .next()
        .and_then(|el| el.value().attr("href"))
        .map(str::trim)
        .filter(|href| !href.is_empty())
    else {
        return Ok(None);
    };

    let base = url::Url::parse(current_url)
        .with_context(|| format!("parse current page url: {current_url}"))?;
    let next = base
        .join(href)
        .with_context(|| format!("resolve next page url: {href}"))?;
    Ok(Some(next.to_string()))
}

fn extract_detail_fields(
    body: &str,
    detail: &DetailPageConfig,
) -> (Option<String>, Option<String>) {
    let document = Html::parse_document(body);
    let select_text = |selector: Option<&str>| {
        let selector = selector?;
        let parsed = Selector::parse(selector).ok()?;
        let element = document.select(&parsed).next()?;
        let text = element.text().collect::<String>();
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_owned())
    };
    (
        select_text(detail.description_selector.as_deref()),
        select_text(detail.requirements_selector.as_deref()),
    )
}

// --- browser strategy ---

/// Navigates with a headless browser, waits for the configured selector,
/// optionally scrolls for lazy content, and returns the rendered HTML. Runs
/// on a blocking thread; the selector extraction reuses the html schema.
async fn fetch_browser_text(browser: &BrowserStrategyConfig, url: &str) -> anyhow::Result<String> {
    let config = browser.clone();
    let url = url.to_owned();
    tokio::task::spawn_blocking(move || fetch_browser_text_blocking(&config, &url))
        .await
        .context("join browser fetch task")?
}

fn fetch_browser_text_blocking(config: &BrowserStrategyConfig, url: &str) -> anyhow::Result<String> {
    use headless_chrome::{Browser, LaunchOptions};

    let options = LaunchOptions::default_builder()
        .headless(true)
        .build()
        .map_err(|err| anyhow::anyhow!("build browser launch options: {err}"))?;
    let browser = Browser::new(options).context("launch headless browser")?;
    let tab = browser.new_tab().context("open browser tab")?;

    tab.navigate_to(url)
        .with_context(|| format!("navigate to {url}"))?;
    tab.wait_for_element(&config.wait_for)
        .with_context(|| format!("wait for selector `{}`", config.wait_for))?;

    for _ in 0..config.scroll_passes {
        tab.evaluate("window.scrollTo(0, document.body.scrollHeight)", false)
            .context("scroll for lazy content")?;
        std::thread::sleep(Duration::from_millis(500));
    }

    tab.get_content().context("read rendered page content")
}
