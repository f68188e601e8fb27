use std::path::PathBuf;

use anyhow::Context as _;
use chrono::Utc;

use crate::llm::{ChatMessage, ModelClient};
use crate::models::{Job, TailoredResume};
use crate::pdf::PdfRenderer;

pub const MAX_TAILOR_ATTEMPTS: usize = 3;
const ID_PREFIX_LEN: usize = 8;

/// The verifier rejected every draft. Distinguished from model-call failures
/// so the orchestrator can attribute the quarantined error to verification.
#[derive(Debug, thiserror::Error)]
#[error("résumé verification failed after {attempts} attempts: {}", .issues.join("; "))]
pub struct VerificationFailed {
    pub attempts: usize,
    pub issues: Vec<String>,
}

pub struct Tailor<'a> {
    llm: &'a ModelClient,
    renderer: &'a dyn PdfRenderer,
    resume_text: &'a str,
    resumes_dir: PathBuf,
    run_id: String,
}

impl<'a> Tailor<'a> {
    pub fn new(
        llm: &'a ModelClient,
        renderer: &'a dyn PdfRenderer,
        resume_text: &'a str,
        resumes_dir: PathBuf,
        run_id: String,
    ) -> Self {
        Self {
            llm,
            renderer,
            resume_text,
            resumes_dir,
            run_id,
        }
    }

    /// Tailor → verify loop, at most three attempts. A pass writes the HTML,
    /// renders the PDF, and returns the verified record; three failed
    /// verifications give the job up with the last issue list in the error.
    pub async fn tailor(&self, job: &Job) -> anyhow::Result<TailoredResume> {
        let mut last_issues: Vec<String> = Vec::new();

        for attempt in 1..=MAX_TAILOR_ATTEMPTS {
            let html = self
                .tailor_call(job, &last_issues)
                .await
                .with_context(|| format!("tailor attempt {attempt}/{MAX_TAILOR_ATTEMPTS}"))?;

            let report = self
                .verify_call(job, &html)
                .await
                .with_context(|| format!("verify attempt {attempt}/{MAX_TAILOR_ATTEMPTS}"))?;

            if report.pass {
                return self.emit(job, &html);
            }

            tracing::warn!(
                job = %job.id,
                attempt,
                issues = report.issues.len(),
                "résumé verification failed"
            );
            last_issues = report.issues;
        }

        Err(VerificationFailed {
            attempts: MAX_TAILOR_ATTEMPTS,
            issues: last_issues,
        }
        .into())
    }

    async fn tailor_call(&self, job: &Job, prior_issues: &[String]) -> anyhow::Result<String> {
        let mut prompt = format!(
            "Write a tailored résumé for the job below, using ONLY content from the master résumé.\n\
             \n\
             Hard rules:\n\
             - Never invent skills, employers, dates, metrics, or certifications that are not in the master résumé.\n\
             - Reorder and rephrase freely; fabricate nothing.\n\
             - Keep the candidate's contact information.\n\
             - Output body HTML only: no <html>, <head>, or <body> tags.\n\
             \n\
             BEGIN_MASTER_RESUME\n\
             {resume}\n\
             END_MASTER_RESUME\n\
             \n\
             BEGIN_JOB_LISTING\n\
             Title: {title}\nCompany: {company}\nLocation: {location}\n{description}\n\
             END_JOB_LISTING\n",
            resume = self.resume_text,
            title = job.title,
            company = job.company,
            location = job.location,
            description = job.description.as_deref().unwrap_or_default(),
        );
        if !prior_issues.is_empty() {
            prompt.push_str(&format!(
                "\nA previous draft was rejected for these issues; avoid them:\n- {}\n",
                prior_issues.join("\n- ")
            ));
        }

        let messages = vec![
            ChatMessage::system("You are an expert résumé writer."),
            ChatMessage::user(prompt),
        ];
        let outcome = self.llm.chat(&messages).await?;
        Ok(strip_code_fences(&outcome.content).to_owned())
    }

    async fn verify_call(&self, job: &Job, html: &str) -> anyhow::Result<VerifyReport> {
        let prompt = format!(
            "Compare the tailored résumé against the master résumé and flag fabrication.\n\
             \n\
             Flag as issues:\n\
             - skills not present in the master résumé\n\
             - inflated metrics or achievements\n\
             - mismatched companies, roles, or dates\n\
             - missing essential contact information\n\
             \n\
             BEGIN_MASTER_RESUME\n\
             {resume}\n\
             END_MASTER_RESUME\n\
             \n\
             BEGIN_TAILORED_HTML\n\
             {html}\n\
             END_TAILORED_HTML\n\
             \n\
             Reply with a single JSON object: {{\"pass\": <bool>, \"issues\": [\"...\"]}}\n\
             Output JSON ONLY (no markdown fences, no commentary).",
            resume = self.resume_text,
        );

        let messages = vec![
            ChatMessage::system("You are a strict résumé fact checker."),
            ChatMessage::user(prompt),
        ];
        let outcome = self
            .llm
            .chat_json(&messages)
            .await
            .with_context(|| format!("verify résumé for job {}", job.id))?;

        let pass = outcome.value["pass"]
            .as_bool()
            .ok_or_else(|| anyhow::anyhow!("verifier reply has no boolean `pass` field"))?;
        let issues = outcome.value["issues"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();

        Ok(VerifyReport { pass, issues })
    }

    fn emit(&self, job: &Job, html: &str) -> anyhow::Result<TailoredResume> {
        std::fs::create_dir_all(&self.resumes_dir).with_context(|| {
            format!("create resumes dir: {}", self.resumes_dir.display())
        })?;

        let base = resume_file_base(&job.company, &job.title, &job.id);
        let html_path = self.resumes_dir.join(format!("{base}.html"));
        let pdf_path = self.resumes_dir.join(format!("{base}.pdf"));

        // File writes are idempotent; a retry after a crash overwrites.
        std::fs::write(&html_path, html)
            .with_context(|| format!("write résumé html: {}", html_path.display()))?;
        self.renderer
            .render(&html_path, &pdf_path)
            .context("render résumé pdf")?;

        Ok(TailoredResume {
            job_id: job.id.clone(),
            html_path: html_path.to_string_lossy().into_owned(),
            pdf_path: pdf_path.to_string_lossy().into_owned(),
            verified: true,
            verification_issues: Vec::new(),
            generated_at: Utc::now(),
            run_id: self.run_id.clone(),
        })
    }
}

#[derive(Debug)]
struct VerifyReport {
    pass: bool,
    issues: Vec<String>,
}

/// Drops a wrapping triple-backtick fence (with optional language tag), if
/// the model added one despite instructions.
pub fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(rest) = rest.split_once('\n').map(|(_, body)| body) else {
        return trimmed;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return trimmed;
    };
    body.trim()
}

pub fn resume_file_base(company: &str, title: &str, job_id: &str) -> String {
    let prefix: String = job_id.chars().take(ID_PREFIX_LEN).collect();
    format!(
        "{}_{}_{}",
        sanitize_component(company),
        sanitize_component(title),
        prefix
    )
}

fn sanitize_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_was_sep = true;
    for ch in input.chars() {
        if ch.is_alphanumeric() {
            out.push(ch);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}
