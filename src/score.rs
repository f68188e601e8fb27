use std::collections::BTreeMap;

use anyhow::Context as _;
use chrono::Utc;

use crate::llm::{ChatMessage, ModelClient};
use crate::models::{Job, ScoredJob};

pub struct Scorer<'a> {
    llm: &'a ModelClient,
    resume_text: &'a str,
    weights: &'a BTreeMap<String, u32>,
    max_listing_chars: usize,
}

impl<'a> Scorer<'a> {
    pub fn new(
        llm: &'a ModelClient,
        resume_text: &'a str,
        weights: &'a BTreeMap<String, u32>,
        max_listing_chars: usize,
    ) -> Self {
        Self {
            llm,
            resume_text,
            weights,
            max_listing_chars,
        }
    }

    /// Scores one job against the candidate profile. Any error here is
    /// per-job: the orchestrator quarantines it and moves on.
    pub async fn score(&self, job: &Job) -> anyhow::Result<ScoredJob> {
        let messages = self.build_messages(job);
        let outcome = self
            .llm
            .chat_json(&messages)
            .await
            .with_context(|| format!("score job {}", job.id))?;

        let raw_score = outcome.value["score"]
            .as_i64()
            .or_else(|| outcome.value["score"].as_f64().map(|f| f.round() as i64))
            .ok_or_else(|| anyhow::anyhow!("scoring reply has no numeric `score` field"))?;
        let score = raw_score.clamp(0, 100);
        if score != raw_score {
            tracing::warn!(job = %job.id, raw_score, score, "model score out of range; clamped");
        }

        let mut reasoning = outcome.value["reasoning"]
            .as_str()
            .unwrap_or_default()
            .trim()
            .to_owned();
        if let Some(concerns) = outcome.value["concerns"].as_str()
            && !concerns.trim().is_empty()
        {
            if !reasoning.is_empty() {
                reasoning.push(' ');
            }
            reasoning.push_str(&format!("Concerns: {}", concerns.trim()));
        }

        Ok(ScoredJob {
            job_id: job.id.clone(),
            score,
            reasoning,
            provider: outcome.provider,
            scored_at: Utc::now(),
        })
    }

    fn build_messages(&self, job: &Job) -> Vec<ChatMessage> {
        let weights = self
            .weights
            .iter()
            .map(|(name, points)| format!("- {name}: {points} points"))
            .collect::<Vec<_>>()
            .join("\n");

        let listing = listing_text(job, self.max_listing_chars);

        let prompt = format!(
            "Score how well this job listing fits the candidate, from 0 to 100.\n\
             \n\
             Weight breakdown:\n\
             {weights}\n\
             \n\
             BEGIN_MASTER_RESUME\n\
             {resume}\n\
             END_MASTER_RESUME\n\
             \n\
             BEGIN_JOB_LISTING\n\
             {listing}\n\
             END_JOB_LISTING\n\
             \n\
             Reply with a single JSON object:\n\
             {{\"score\": <int 0-100>, \"reasoning\": \"<short explanation>\", \"concerns\": \"<optional red flags>\"}}\n\
             Output JSON ONLY (no markdown fences, no commentary).",
            resume = self.resume_text,
        );

        vec![
            ChatMessage::system(
                "You are a pragmatic recruiter scoring job listings against one candidate's profile.",
            ),
            ChatMessage::user(prompt),
        ]
    }
}

fn listing_text(job: &Job, max_chars: usize) -> String {
    let mut text = format!(
        "Title: {}\nCompany: {}\nLocation: {} ({})",
        job.title, job.company, job.location, job.country
    );
    if let Some(salary) = &job.salary {
        text.push_str(&format!("\nSalary: {salary}"));
    }
    if let Some(description) = &job.description {
        text.push_str(&format!("\n\nDescription:\n{description}"));
    }
    if let Some(requirements) = &job.requirements {
        text.push_str(&format!("\n\nRequirements:\n{requirements}"));
    }

    if text.chars().count() > max_chars {
        tracing::warn!(
            job = %job.id,
            chars = text.chars().count(),
            max_chars,
            "listing text over budget; truncating"
        );
        text = text.chars().take(max_chars).collect();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job_id;

    fn long_job(description_len: usize) -> Job {
        Job {
            id: job_id("Cloud Engineer", "Acme", "Utrecht"),
            site_id: "acme_board".to_owned(),
            title: "Cloud Engineer".to_owned(),
            company: "Acme".to_owned(),
            location: "Utrecht".to_owned(),
            country: "NL".to_owned(),
            url: "https://acme.example/jobs/1".to_owned(),
            salary: None,
            description: Some("x".repeat(description_len)),
            requirements: None,
            posted_date: None,
            scraped_at: Utc::now(),
            run_id: "run-1".to_owned(),
        }
    }

    #[test]
    fn listing_text_is_truncated_at_the_budget() {
        let text = listing_text(&long_job(20_000), 8_000);
        assert_eq!(text.chars().count(), 8_000);
    }

    #[test]
    fn listing_text_under_budget_is_untouched() {
        let job = long_job(100);
        let text = listing_text(&job, 8_000);
        assert!(text.contains("Title: Cloud Engineer"));
        assert!(text.contains(&"x".repeat(100)));
    }
}
