use std::path::Path;

use anyhow::Context as _;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::config::{NotificationSettings, Secrets, SmtpSettings};
use crate::models::{Application, ApplicationStatus, Feedback, FeedbackAction, Job, ScoredJob};
use crate::store::Store;

const FEEDBACK_CURSOR_KEY: &str = "telegram_updates";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyTier {
    Instant,
    Digest,
    LogOnly,
    Discard,
}

/// Thin wrapper over the Telegram Bot API. The base URL is configurable so
/// tests can point it at a stub server.
pub struct TelegramClient {
    client: reqwest::Client,
    api_base: String,
    token: String,
    chat_id: String,
}

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
}

#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    #[serde(default)]
    pub data: Option<String>,
}

impl TelegramClient {
    pub fn new(api_base: &str, token: &str, chat_id: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_owned(),
            token: token.to_owned(),
            chat_id: chat_id.to_owned(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    pub async fn send_message(
        &self,
        text: &str,
        reply_markup: Option<serde_json::Value>,
    ) -> anyhow::Result<()> {
        let mut body = json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "Markdown",
        });
        if let Some(markup) = reply_markup {
            body["reply_markup"] = markup;
        }

        let url = self.method_url("sendMessage");
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("POST sendMessage")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("sendMessage returned {status}");
        }
        Ok(())
    }

    pub async fn send_document(&self, caption: &str, path: &Path) -> anyhow::Result<()> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("read attachment: {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "resume.pdf".to_owned());

        let form = reqwest::multipart::Form::new()
            .text("chat_id", self.chat_id.clone())
            .text("caption", caption.to_owned())
            .part(
                "document",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name),
            );

        let url = self.method_url("sendDocument");
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .context("POST sendDocument")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("sendDocument returned {status}");
        }
        Ok(())
    }

    pub async fn get_updates(&self, offset: Option<i64>) -> anyhow::Result<Vec<Update>> {
        let mut body = json!({ "timeout": 0, "allowed_updates": ["callback_query"] });
        if let Some(offset) = offset {
            body["offset"] = json!(offset);
        }

        let url = self.method_url("getUpdates");
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("POST getUpdates")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("getUpdates returned {status}");
        }
        let parsed: UpdatesResponse = response.json().await.context("decode getUpdates")?;
        if !parsed.ok {
            anyhow::bail!("getUpdates replied ok=false");
        }
        Ok(parsed.result)
    }

    pub async fn answer_callback(&self, callback_id: &str) -> anyhow::Result<()> {
        let url = self.method_url("answerCallbackQuery");
        let response = self
            .client
            .post(&url)
            .json(&json!({ "callback_query_id": callback_id }))
            .send()
            .await
            .context("POST answerCallbackQuery")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("answerCallbackQuery returned {status}");
        }
        Ok(())
    }
}

struct DigestEntry {
    title: String,
    company: String,
    location: String,
    score: i64,
    url: String,
}

/// Synchronous façade the pipeline talks to: threshold routing, instant
/// messages with reaction buttons, digest mail, feedback polling, health
/// alerts. Without Telegram credentials every chat call is a no-op.
pub struct Notifier {
    telegram: Option<TelegramClient>,
    smtp: Option<(SmtpSettings, String)>,
    settings: NotificationSettings,
    digest: Vec<DigestEntry>,
}

impl Notifier {
    pub fn new(settings: &NotificationSettings, secrets: &Secrets) -> Self {
        let telegram = match (&secrets.telegram_bot_token, &secrets.telegram_chat_id) {
            (Some(token), Some(chat_id)) => Some(TelegramClient::new(
                &settings.telegram_api_base,
                token,
                chat_id,
            )),
            _ => {
                tracing::warn!("telegram credentials missing; chat notifications are no-ops");
                None
            }
        };
        let smtp = match (&settings.smtp, &secrets.smtp_password) {
            (Some(smtp), Some(password)) => Some((smtp.clone(), password.clone())),
            _ => None,
        };

        Self {
            telegram,
            smtp,
            settings: settings.clone(),
            digest: Vec::new(),
        }
    }

    pub fn tier(&self, score: i64) -> NotifyTier {
        if score >= self.settings.instant_threshold {
            NotifyTier::Instant
        } else if score >= self.settings.digest_threshold {
            NotifyTier::Digest
        } else if score >= self.settings.log_threshold {
            NotifyTier::LogOnly
        } else {
            NotifyTier::Discard
        }
    }

    /// Instant message with reaction buttons and an optional PDF attachment.
    /// A send failure is logged and reported as `false`, never an error.
    pub async fn send_match(
        &self,
        job: &Job,
        score: &ScoredJob,
        prior_applications: &[Application],
        pdf_path: Option<&Path>,
    ) -> bool {
        let Some(telegram) = &self.telegram else {
            return false;
        };

        let text = format_match_message(job, score, prior_applications);
        let markup = json!({
            "inline_keyboard": [[
                { "text": "Applied", "callback_data": format!("applied:{}", job.id) },
                { "text": "Skip", "callback_data": format!("skip:{}", job.id) },
                { "text": "Not Relevant", "callback_data": format!("not_relevant:{}", job.id) },
            ]]
        });

        if let Err(err) = telegram.send_message(&text, Some(markup)).await {
            tracing::warn!(job = %job.id, error = %format!("{err:#}"), "instant message failed");
            return false;
        }

        if let Some(pdf_path) = pdf_path
            && let Err(err) = telegram
                .send_document(&format!("Tailored résumé: {}", job.title), pdf_path)
                .await
        {
            tracing::warn!(job = %job.id, error = %format!("{err:#}"), "attachment send failed");
        }

        true
    }

    pub fn queue_digest(&mut self, job: &Job, score: &ScoredJob) {
        self.digest.push(DigestEntry {
            title: job.title.clone(),
            company: job.company.clone(),
            location: job.location.clone(),
            score: score.score,
            url: job.url.clone(),
        });
    }

    pub fn digest_len(&self) -> usize {
        self.digest.len()
    }

    /// Best-effort digest mail; transport failures are logged and swallowed.
    pub fn send_digest(&mut self) {
        let entries = std::mem::take(&mut self.digest);
        if entries.is_empty() {
            return;
        }
        let Some((smtp, password)) = &self.smtp else {
            tracing::info!(matches = entries.len(), "no smtp configured; digest skipped");
            return;
        };

        let mut body = format!("Job matches in today's run ({}):\n\n", entries.len());
        for entry in &entries {
            body.push_str(&format!(
                "[{}] {} — {} ({})\n{}\n\n",
                entry.score, entry.title, entry.company, entry.location, entry.url
            ));
        }

        if let Err(err) = send_mail(smtp, password, "jobhunter digest", &body) {
            tracing::warn!(error = %format!("{err:#}"), "digest mail failed");
        }
    }

    /// Immediate alert for catastrophic errors and the end-of-run summary.
    pub async fn send_health_alert(&self, text: &str) {
        let Some(telegram) = &self.telegram else {
            return;
        };
        if let Err(err) = telegram
            .send_message(&format!("🚨 *jobhunter*\n\n{text}"), None)
            .await
        {
            tracing::warn!(error = %format!("{err:#}"), "health alert failed");
        }
    }

    /// Pulls pending button presses, writes feedback records, acknowledges
    /// the events, and advances the shared update cursor. Returns the number
    /// of feedback records written.
    pub async fn poll_feedback(&self, store: &Store) -> anyhow::Result<usize> {
        let Some(telegram) = &self.telegram else {
            return Ok(0);
        };

        let cursor = store.get_transport_cursor(FEEDBACK_CURSOR_KEY)?;
        let updates = telegram
            .get_updates(cursor.map(|c| c + 1))
            .await
            .context("poll telegram updates")?;

        let mut written = 0usize;
        let mut max_update_id = cursor;
        for update in updates {
            max_update_id = Some(max_update_id.map_or(update.update_id, |m| m.max(update.update_id)));
            let Some(callback) = update.callback_query else {
                continue;
            };
            let Some(data) = callback.data.as_deref() else {
                continue;
            };

            match self.handle_callback(store, data).await {
                Ok(()) => written += 1,
                Err(err) => {
                    tracing::warn!(payload = data, error = %format!("{err:#}"), "feedback event ignored");
                }
            }
            if let Err(err) = telegram.answer_callback(&callback.id).await {
                tracing::warn!(error = %format!("{err:#}"), "answerCallbackQuery failed");
            }
        }

        if let Some(max_update_id) = max_update_id
            && Some(max_update_id) != cursor
        {
            store.set_transport_cursor(FEEDBACK_CURSOR_KEY, max_update_id)?;
        }

        Ok(written)
    }

    async fn handle_callback(&self, store: &Store, payload: &str) -> anyhow::Result<()> {
        let (action, job_id) = parse_callback_payload(payload)?;
        let score = store
            .get_score(job_id)?
            .map(|s| s.score)
            .unwrap_or_default();

        store.insert_feedback(&Feedback {
            job_id: job_id.to_owned(),
            score,
            action,
            reason: None,
            timestamp: Utc::now(),
        })?;

        // Only "applied" moves the application; skip/not-relevant describe
        // the listing, not something the user did with an application.
        if action == FeedbackAction::Applied {
            store.set_application_status(
                job_id,
                ApplicationStatus::Applied,
                Some(&Utc::now().format("%Y-%m-%d").to_string()),
            )?;
        }

        tracing::info!(job = %job_id, action = action.as_str(), "feedback recorded");
        Ok(())
    }
}

pub fn parse_callback_payload(payload: &str) -> anyhow::Result<(FeedbackAction, &str)> {
    let (action, job_id) = payload
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("malformed callback payload: {payload}"))?;
    if job_id.is_empty() {
        anyhow::bail!("callback payload has empty job id: {payload}");
    }
    Ok((FeedbackAction::parse(action)?, job_id))
}

pub fn format_match_message(
    job: &Job,
    score: &ScoredJob,
    prior_applications: &[Application],
) -> String {
    let mut text = format!(
        "*Match Score: {}/100*\n\n*{}* — {}\n{}\n",
        score.score, job.title, job.company, job.location
    );
    if let Some(salary) = &job.salary {
        text.push_str(&format!("{salary}\n"));
    }
    text.push_str(&format!("\n_{}_\n", score.reasoning));

    if !prior_applications.is_empty() {
        text.push_str("\n⚠️ *Prior applications at this company:*\n");
        for application in prior_applications {
            text.push_str(&format!(
                "  • {} ({})\n",
                application.role,
                application.status.as_str()
            ));
        }
    }

    text.push_str(&format!("\n[View Listing]({})", job.url));
    text
}

fn send_mail(smtp: &SmtpSettings, password: &str, subject: &str, body: &str) -> anyhow::Result<()> {
    use lettre::transport::smtp::authentication::Credentials;
    use lettre::{Message, SmtpTransport, Transport as _};

    let message = Message::builder()
        .from(smtp.from.parse().context("parse smtp from address")?)
        .to(smtp.to.parse().context("parse smtp to address")?)
        .subject(subject)
        .body(body.to_owned())
        .context("build digest message")?;

    let mailer = SmtpTransport::starttls_relay(&smtp.host)
        .context("build smtp transport")?
        .port(smtp.port)
        .credentials(Credentials::new(smtp.username.clone(), password.to_owned()))
        .build();

    mailer.send(&message).context("send digest mail")?;
    Ok(())
}
