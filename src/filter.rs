use chrono::Utc;

use crate::models::{Job, KeywordConfig};
use crate::store::Store;

/// Drops every job whose id has been seen in any prior run and records the
/// survivors' hashes. Runs after the scrape join, in insertion order.
pub fn dedup_new_jobs(store: &Store, jobs: Vec<Job>) -> anyhow::Result<Vec<Job>> {
    let mut fresh = Vec::new();
    for job in jobs {
        if store.mark_seen(&job.id, Utc::now())? {
            fresh.push(job);
        } else {
            tracing::debug!(job = %job.id, title = %job.title, "already seen; dropping");
        }
    }
    Ok(fresh)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeywordVerdict {
    Accept,
    Reject(String),
}

/// Three-rule keyword test. All comparisons are case-insensitive substring
/// matches over `title ∥ description ∥ requirements`.
pub fn keyword_check(job: &Job, keywords: &KeywordConfig) -> KeywordVerdict {
    let text = format!(
        "{} {} {}",
        job.title,
        job.description.as_deref().unwrap_or_default(),
        job.requirements.as_deref().unwrap_or_default()
    )
    .to_lowercase();

    if !keywords.must_have_any.is_empty()
        && !keywords
            .must_have_any
            .iter()
            .any(|kw| text.contains(&kw.to_lowercase()))
    {
        return KeywordVerdict::Reject("no_required_keyword".to_owned());
    }

    for kw in &keywords.must_not_have {
        if text.contains(&kw.to_lowercase()) {
            return KeywordVerdict::Reject(format!("has_excluded_keyword:{kw}"));
        }
    }

    if !keywords.title_must_have_any.is_empty() {
        let title = job.title.to_lowercase();
        if !keywords
            .title_must_have_any
            .iter()
            .any(|kw| title.contains(&kw.to_lowercase()))
        {
            return KeywordVerdict::Reject("title_missing_role_keyword".to_owned());
        }
    }

    KeywordVerdict::Accept
}
