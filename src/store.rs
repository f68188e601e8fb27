use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension as _, params};

use crate::models::{
    Application, ApplicationStatus, Feedback, FeedbackAction, Job, PipelineRun, RunStatus,
    ScoredJob, SiteFailure, TailoredResume,
};

/// Embedded relational store. Single writer per run; WAL mode so external
/// readers can inspect the database while a run is in flight.
pub struct Store {
    conn: Connection,
    path: PathBuf,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create database dir: {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open database: {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enable WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("enable foreign keys")?;

        let store = Self {
            conn,
            path: path.to_owned(),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    site_id TEXT NOT NULL,
                    title TEXT NOT NULL,
                    company TEXT NOT NULL,
                    location TEXT NOT NULL,
                    country TEXT NOT NULL,
                    url TEXT NOT NULL,
                    salary TEXT,
                    description TEXT,
                    requirements TEXT,
                    posted_date TEXT,
                    scraped_at TEXT NOT NULL,
                    run_id TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS seen_jobs (
                    hash TEXT PRIMARY KEY,
                    first_seen_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS scores (
                    job_id TEXT PRIMARY KEY REFERENCES jobs(id),
                    score INTEGER NOT NULL,
                    reasoning TEXT NOT NULL,
                    provider TEXT NOT NULL,
                    scored_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS resumes (
                    job_id TEXT PRIMARY KEY REFERENCES jobs(id),
                    html_path TEXT NOT NULL,
                    pdf_path TEXT NOT NULL,
                    verified INTEGER NOT NULL,
                    verification_issues TEXT NOT NULL,
                    generated_at TEXT NOT NULL,
                    run_id TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS applications (
                    id TEXT PRIMARY KEY,
                    job_id TEXT NOT NULL UNIQUE REFERENCES jobs(id),
                    company TEXT NOT NULL,
                    role TEXT NOT NULL,
                    country TEXT NOT NULL,
                    applied_date TEXT,
                    resume_version TEXT,
                    status TEXT NOT NULL,
                    status_updated TEXT NOT NULL,
                    notes TEXT,
                    source_site TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS feedback (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id TEXT NOT NULL REFERENCES jobs(id),
                    score INTEGER NOT NULL,
                    action TEXT NOT NULL,
                    reason TEXT,
                    timestamp TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS pipeline_runs (
                    run_id TEXT PRIMARY KEY,
                    started_at TEXT NOT NULL,
                    completed_at TEXT,
                    status TEXT NOT NULL,
                    sites_attempted INTEGER NOT NULL,
                    sites_succeeded INTEGER NOT NULL,
                    sites_failed TEXT NOT NULL,
                    jobs_scraped INTEGER NOT NULL,
                    jobs_new INTEGER NOT NULL,
                    jobs_filtered_out INTEGER NOT NULL,
                    jobs_scored INTEGER NOT NULL,
                    jobs_above_threshold INTEGER NOT NULL,
                    resumes_generated INTEGER NOT NULL,
                    notifications_sent INTEGER NOT NULL,
                    errors TEXT NOT NULL,
                    llm_providers_used TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS notifications (
                    job_id TEXT PRIMARY KEY REFERENCES jobs(id),
                    channel TEXT NOT NULL,
                    telegram_sent INTEGER NOT NULL,
                    sent_at TEXT NOT NULL,
                    run_id TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS transport_state (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_run ON jobs(run_id);
                CREATE INDEX IF NOT EXISTS idx_applications_company ON applications(company);
                CREATE INDEX IF NOT EXISTS idx_feedback_job ON feedback(job_id);
                "#,
            )
            .context("initialize schema")?;
        Ok(())
    }

    // --- Jobs ---

    pub fn insert_job(&self, job: &Job) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO jobs (id, site_id, title, company, location, country, url,
                                   salary, description, requirements, posted_date, scraped_at, run_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    job.id,
                    job.site_id,
                    job.title,
                    job.company,
                    job.location,
                    job.country,
                    job.url,
                    job.salary,
                    job.description,
                    job.requirements,
                    job.posted_date,
                    job.scraped_at.to_rfc3339(),
                    job.run_id,
                ],
            )
            .with_context(|| format!("insert job: {}", job.id))?;
        Ok(())
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        self.conn
            .query_row(
                "SELECT id, site_id, title, company, location, country, url, salary,
                        description, requirements, posted_date, scraped_at, run_id
                 FROM jobs WHERE id = ?1",
                [id],
                row_to_job,
            )
            .optional()
            .with_context(|| format!("get job: {id}"))
    }

    /// All jobs scraped under one run, in insertion order.
    pub fn jobs_for_run(&self, run_id: &str) -> Result<Vec<Job>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, site_id, title, company, location, country, url, salary,
                    description, requirements, posted_date, scraped_at, run_id
             FROM jobs WHERE run_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map([run_id], row_to_job)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("list jobs for run")
    }

    // --- Seen hashes ---

    /// Records a hash on first encounter. Returns `true` when the hash was
    /// new; repeat encounters are no-ops.
    pub fn mark_seen(&self, hash: &str, first_seen_at: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO seen_jobs (hash, first_seen_at) VALUES (?1, ?2)",
                params![hash, first_seen_at.to_rfc3339()],
            )
            .context("insert seen hash")?;
        Ok(changed == 1)
    }

    pub fn is_seen(&self, hash: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM seen_jobs WHERE hash = ?1",
                [hash],
                |row| row.get(0),
            )
            .context("query seen hash")?;
        Ok(count > 0)
    }

    // --- Scores ---

    pub fn insert_score(&self, score: &ScoredJob) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO scores (job_id, score, reasoning, provider, scored_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    score.job_id,
                    score.score,
                    score.reasoning,
                    score.provider,
                    score.scored_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("insert score: {}", score.job_id))?;
        Ok(())
    }

    pub fn get_score(&self, job_id: &str) -> Result<Option<ScoredJob>> {
        self.conn
            .query_row(
                "SELECT job_id, score, reasoning, provider, scored_at FROM scores WHERE job_id = ?1",
                [job_id],
                |row| {
                    Ok(ScoredJob {
                        job_id: row.get(0)?,
                        score: row.get(1)?,
                        reasoning: row.get(2)?,
                        provider: row.get(3)?,
                        scored_at: parse_timestamp(row, 4)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("get score: {job_id}"))
    }

    // --- Résumés ---

    pub fn insert_resume(&self, resume: &TailoredResume) -> Result<()> {
        let issues =
            serde_json::to_string(&resume.verification_issues).context("serialize issues")?;
        self.conn
            .execute(
                "INSERT INTO resumes (job_id, html_path, pdf_path, verified,
                                      verification_issues, generated_at, run_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    resume.job_id,
                    resume.html_path,
                    resume.pdf_path,
                    resume.verified,
                    issues,
                    resume.generated_at.to_rfc3339(),
                    resume.run_id,
                ],
            )
            .with_context(|| format!("insert resume: {}", resume.job_id))?;
        Ok(())
    }

    pub fn get_resume(&self, job_id: &str) -> Result<Option<TailoredResume>> {
        self.conn
            .query_row(
                "SELECT job_id, html_path, pdf_path, verified, verification_issues,
                        generated_at, run_id
                 FROM resumes WHERE job_id = ?1",
                [job_id],
                |row| {
                    let issues: String = row.get(4)?;
                    Ok(TailoredResume {
                        job_id: row.get(0)?,
                        html_path: row.get(1)?,
                        pdf_path: row.get(2)?,
                        verified: row.get(3)?,
                        verification_issues: serde_json::from_str(&issues).unwrap_or_default(),
                        generated_at: parse_timestamp(row, 5)?,
                        run_id: row.get(6)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("get resume: {job_id}"))
    }

    // --- Applications ---

    pub fn insert_application(&self, application: &Application) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO applications (id, job_id, company, role, country, applied_date,
                                           resume_version, status, status_updated, notes, source_site)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    application.id,
                    application.job_id,
                    application.company,
                    application.role,
                    application.country,
                    application.applied_date,
                    application.resume_version,
                    application.status.as_str(),
                    application.status_updated.to_rfc3339(),
                    application.notes,
                    application.source_site,
                ],
            )
            .with_context(|| format!("insert application: {}", application.job_id))?;
        Ok(())
    }

    pub fn get_application_for_job(&self, job_id: &str) -> Result<Option<Application>> {
        self.conn
            .query_row(
                "SELECT id, job_id, company, role, country, applied_date, resume_version,
                        status, status_updated, notes, source_site
                 FROM applications WHERE job_id = ?1",
                [job_id],
                row_to_application,
            )
            .optional()
            .with_context(|| format!("get application for job: {job_id}"))
    }

    /// Prior applications at a company, excluding the one for `exclude_job_id`.
    /// Matching is case-insensitive on the company name.
    pub fn applications_for_company(
        &self,
        company: &str,
        exclude_job_id: &str,
    ) -> Result<Vec<Application>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, job_id, company, role, country, applied_date, resume_version,
                    status, status_updated, notes, source_site
             FROM applications
             WHERE LOWER(company) = LOWER(?1) AND job_id != ?2
             ORDER BY status_updated",
        )?;
        let rows = stmt.query_map(params![company, exclude_job_id], row_to_application)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("list applications for company")
    }

    pub fn set_application_status(
        &self,
        job_id: &str,
        status: ApplicationStatus,
        applied_date: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE applications
                 SET status = ?1, status_updated = ?2,
                     applied_date = COALESCE(?3, applied_date)
                 WHERE job_id = ?4",
                params![
                    status.as_str(),
                    Utc::now().to_rfc3339(),
                    applied_date,
                    job_id
                ],
            )
            .with_context(|| format!("update application status: {job_id}"))?;
        Ok(())
    }

    // --- Feedback ---

    pub fn insert_feedback(&self, feedback: &Feedback) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO feedback (job_id, score, action, reason, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    feedback.job_id,
                    feedback.score,
                    feedback.action.as_str(),
                    feedback.reason,
                    feedback.timestamp.to_rfc3339(),
                ],
            )
            .with_context(|| format!("insert feedback: {}", feedback.job_id))?;
        Ok(())
    }

    pub fn feedback_for_job(&self, job_id: &str) -> Result<Vec<Feedback>> {
        let mut stmt = self.conn.prepare(
            "SELECT job_id, score, action, reason, timestamp
             FROM feedback WHERE job_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([job_id], |row| {
            let action: String = row.get(2)?;
            Ok(Feedback {
                job_id: row.get(0)?,
                score: row.get(1)?,
                action: FeedbackAction::parse(&action).map_err(|err| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        rusqlite::types::Type::Text,
                        err.into(),
                    )
                })?,
                reason: row.get(3)?,
                timestamp: parse_timestamp(row, 4)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("list feedback for job")
    }

    // --- Pipeline runs ---

    pub fn upsert_run(&self, run: &PipelineRun) -> Result<()> {
        let sites_failed = serde_json::to_string(&run.sites_failed).context("serialize failures")?;
        let errors = serde_json::to_string(&run.errors).context("serialize errors")?;
        let providers =
            serde_json::to_string(&run.llm_providers_used).context("serialize providers")?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO pipeline_runs
                   (run_id, started_at, completed_at, status, sites_attempted, sites_succeeded,
                    sites_failed, jobs_scraped, jobs_new, jobs_filtered_out, jobs_scored,
                    jobs_above_threshold, resumes_generated, notifications_sent, errors,
                    llm_providers_used)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    run.run_id,
                    run.started_at.to_rfc3339(),
                    run.completed_at.map(|t| t.to_rfc3339()),
                    run.status.as_str(),
                    run.sites_attempted,
                    run.sites_succeeded,
                    sites_failed,
                    run.jobs_scraped,
                    run.jobs_new,
                    run.jobs_filtered_out,
                    run.jobs_scored,
                    run.jobs_above_threshold,
                    run.resumes_generated,
                    run.notifications_sent,
                    errors,
                    providers,
                ],
            )
            .with_context(|| format!("upsert run: {}", run.run_id))?;
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<PipelineRun>> {
        self.conn
            .query_row(
                "SELECT run_id, started_at, completed_at, status, sites_attempted,
                        sites_succeeded, sites_failed, jobs_scraped, jobs_new,
                        jobs_filtered_out, jobs_scored, jobs_above_threshold,
                        resumes_generated, notifications_sent, errors, llm_providers_used
                 FROM pipeline_runs WHERE run_id = ?1",
                [run_id],
                |row| {
                    let status: String = row.get(3)?;
                    let sites_failed: String = row.get(6)?;
                    let errors: String = row.get(14)?;
                    let providers: String = row.get(15)?;
                    let completed_at: Option<String> = row.get(2)?;
                    Ok(PipelineRun {
                        run_id: row.get(0)?,
                        started_at: parse_timestamp(row, 1)?,
                        completed_at: completed_at.as_deref().map(parse_rfc3339).transpose()?,
                        status: RunStatus::parse(&status).map_err(|err| {
                            rusqlite::Error::FromSqlConversionFailure(
                                3,
                                rusqlite::types::Type::Text,
                                err.into(),
                            )
                        })?,
                        sites_attempted: row.get(4)?,
                        sites_succeeded: row.get(5)?,
                        sites_failed: serde_json::from_str::<Vec<SiteFailure>>(&sites_failed)
                            .unwrap_or_default(),
                        jobs_scraped: row.get(7)?,
                        jobs_new: row.get(8)?,
                        jobs_filtered_out: row.get(9)?,
                        jobs_scored: row.get(10)?,
                        jobs_above_threshold: row.get(11)?,
                        resumes_generated: row.get(12)?,
                        notifications_sent: row.get(13)?,
                        errors: serde_json::from_str(&errors).unwrap_or_default(),
                        llm_providers_used: serde_json::from_str(&providers).unwrap_or_default(),
                    })
                },
            )
            .optional()
            .with_context(|| format!("get run: {run_id}"))
    }

    // --- Notifications ---

    pub fn insert_notification(
        &self,
        job_id: &str,
        channel: &str,
        telegram_sent: bool,
        run_id: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO notifications (job_id, channel, telegram_sent, sent_at, run_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![job_id, channel, telegram_sent, Utc::now().to_rfc3339(), run_id],
            )
            .with_context(|| format!("insert notification: {job_id}"))?;
        Ok(())
    }

    /// Channel and telegram-send flag for a job's notification record.
    pub fn get_notification(&self, job_id: &str) -> Result<Option<(String, bool)>> {
        self.conn
            .query_row(
                "SELECT channel, telegram_sent FROM notifications WHERE job_id = ?1",
                [job_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .with_context(|| format!("get notification: {job_id}"))
    }

    /// How many of a run's notifications actually went out over Telegram.
    pub fn count_notifications_sent(&self, run_id: &str) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM notifications WHERE run_id = ?1 AND telegram_sent = 1",
                [run_id],
                |row| row.get(0),
            )
            .context("count sent notifications")?;
        Ok(count as u64)
    }

    pub fn notification_exists(&self, job_id: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM notifications WHERE job_id = ?1",
                [job_id],
                |row| row.get(0),
            )
            .context("query notification")?;
        Ok(count > 0)
    }

    // --- Transport state (feedback cursor) ---

    pub fn get_transport_cursor(&self, key: &str) -> Result<Option<i64>> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM transport_state WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()
            .context("get transport cursor")?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    pub fn set_transport_cursor(&self, key: &str, value: i64) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO transport_state (key, value) VALUES (?1, ?2)",
                params![key, value.to_string()],
            )
            .context("set transport cursor")?;
        Ok(())
    }
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        site_id: row.get(1)?,
        title: row.get(2)?,
        company: row.get(3)?,
        location: row.get(4)?,
        country: row.get(5)?,
        url: row.get(6)?,
        salary: row.get(7)?,
        description: row.get(8)?,
        requirements: row.get(9)?,
        posted_date: row.get(10)?,
        scraped_at: parse_timestamp(row, 11)?,
        run_id: row.get(12)?,
    })
}

fn row_to_application(row: &rusqlite::Row) -> rusqlite::Result<Application> {
    let status: String = row.get(7)?;
    Ok(Application {
        id: row.get(0)?,
        job_id: row.get(1)?,
        company: row.get(2)?,
        role: row.get(3)?,
        country: row.get(4)?,
        applied_date: row.get(5)?,
        resume_version: row.get(6)?,
        status: ApplicationStatus::parse(&status).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, err.into())
        })?,
        status_updated: parse_timestamp(row, 8)?,
        notes: row.get(9)?,
        source_site: row.get(10)?,
    })
}

fn parse_timestamp(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    parse_rfc3339(&text)
}

fn parse_rfc3339(text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, err.into())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job_id;

    fn open_temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(&dir.path().join("jobhunter.db")).expect("open store");
        (dir, store)
    }

    fn sample_job(title: &str, company: &str) -> Job {
        Job {
            id: job_id(title, company, "Amsterdam"),
            site_id: "acme_board".to_owned(),
            title: title.to_owned(),
            company: company.to_owned(),
            location: "Amsterdam".to_owned(),
            country: "NL".to_owned(),
            url: "https://acme.example/jobs/1".to_owned(),
            salary: Some("€70k".to_owned()),
            description: Some("Build cloud things".to_owned()),
            requirements: None,
            posted_date: None,
            scraped_at: Utc::now(),
            run_id: "run-1".to_owned(),
        }
    }

    #[test]
    fn job_insert_then_fetch_round_trips() -> Result<()> {
        let (_dir, store) = open_temp_store();
        let job = sample_job("Cloud Engineer", "Acme");
        store.insert_job(&job)?;
        let fetched = store.get_job(&job.id)?.expect("job exists");
        assert_eq!(fetched, job);
        assert_eq!(store.jobs_for_run("run-1")?, vec![job]);
        Ok(())
    }

    #[test]
    fn seen_hash_inserts_exactly_once() -> Result<()> {
        let (_dir, store) = open_temp_store();
        let hash = job_id("Cloud Engineer", "Acme", "Amsterdam");
        assert!(store.mark_seen(&hash, Utc::now())?);
        assert!(!store.mark_seen(&hash, Utc::now())?);
        assert!(store.is_seen(&hash)?);
        assert!(!store.is_seen("deadbeef")?);
        Ok(())
    }

    #[test]
    fn score_requires_job_and_is_unique() -> Result<()> {
        let (_dir, store) = open_temp_store();
        let score = ScoredJob {
            job_id: "nonexistent".to_owned(),
            score: 80,
            reasoning: "good".to_owned(),
            provider: "primary".to_owned(),
            scored_at: Utc::now(),
        };
        assert!(store.insert_score(&score).is_err(), "FK must be enforced");

        let job = sample_job("Cloud Engineer", "Acme");
        store.insert_job(&job)?;
        let score = ScoredJob {
            job_id: job.id.clone(),
            ..score
        };
        store.insert_score(&score)?;
        assert!(
            store.insert_score(&score).is_err(),
            "at most one score per job"
        );
        assert_eq!(store.get_score(&job.id)?.expect("score exists"), score);
        Ok(())
    }

    #[test]
    fn resume_round_trips_with_issues() -> Result<()> {
        let (_dir, store) = open_temp_store();
        let job = sample_job("Cloud Engineer", "Acme");
        store.insert_job(&job)?;
        let resume = TailoredResume {
            job_id: job.id.clone(),
            html_path: "output/resumes/a.html".to_owned(),
            pdf_path: "output/resumes/a.pdf".to_owned(),
            verified: true,
            verification_issues: vec![],
            generated_at: Utc::now(),
            run_id: "run-1".to_owned(),
        };
        store.insert_resume(&resume)?;
        assert!(store.insert_resume(&resume).is_err());
        assert_eq!(store.get_resume(&job.id)?.expect("resume exists"), resume);
        Ok(())
    }

    #[test]
    fn applications_query_by_company_excludes_current_job() -> Result<()> {
        let (_dir, store) = open_temp_store();
        let prior = sample_job("Platform Engineer", "Acme");
        let current = sample_job("Cloud Architect", "Acme");
        store.insert_job(&prior)?;
        store.insert_job(&current)?;

        let make_app = |job: &Job| Application {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job.id.clone(),
            company: job.company.clone(),
            role: job.title.clone(),
            country: job.country.clone(),
            applied_date: None,
            resume_version: None,
            status: ApplicationStatus::Matched,
            status_updated: Utc::now(),
            notes: None,
            source_site: job.site_id.clone(),
        };
        let prior_app = make_app(&prior);
        store.insert_application(&prior_app)?;
        store.insert_application(&make_app(&current))?;
        assert_eq!(
            store.get_application_for_job(&prior.id)?.expect("app"),
            prior_app
        );

        let priors = store.applications_for_company("ACME", &current.id)?;
        assert_eq!(priors.len(), 1);
        assert_eq!(priors[0].role, "Platform Engineer");

        store.set_application_status(&prior.id, ApplicationStatus::Applied, Some("2026-08-01"))?;
        let updated = store.get_application_for_job(&prior.id)?.expect("app");
        assert_eq!(updated.status, ApplicationStatus::Applied);
        assert_eq!(updated.applied_date.as_deref(), Some("2026-08-01"));
        Ok(())
    }

    #[test]
    fn feedback_appends_and_round_trips() -> Result<()> {
        let (_dir, store) = open_temp_store();
        let job = sample_job("Cloud Engineer", "Acme");
        store.insert_job(&job)?;

        let feedback = Feedback {
            job_id: job.id.clone(),
            score: 85,
            action: FeedbackAction::Applied,
            reason: None,
            timestamp: Utc::now(),
        };
        store.insert_feedback(&feedback)?;
        store.insert_feedback(&feedback)?;
        let rows = store.feedback_for_job(&job.id)?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], feedback);
        Ok(())
    }

    #[test]
    fn run_round_trips_with_json_columns() -> Result<()> {
        let (_dir, store) = open_temp_store();
        let mut run = PipelineRun::new("run-1".to_owned(), Utc::now());
        run.sites_attempted = 3;
        run.sites_succeeded = 2;
        run.sites_failed.push(SiteFailure {
            site: "broken_board".to_owned(),
            error: "HTTP 500".to_owned(),
            stage: "scrape".to_owned(),
        });
        run.errors.push("score failed for job x".to_owned());
        run.llm_providers_used.push("fallback".to_owned());
        store.upsert_run(&run)?;

        run.status = RunStatus::Completed;
        run.completed_at = Some(Utc::now());
        store.upsert_run(&run)?;

        let fetched = store.get_run("run-1")?.expect("run exists");
        assert_eq!(fetched, run);
        Ok(())
    }

    #[test]
    fn notification_recorded_once_per_job() -> Result<()> {
        let (_dir, store) = open_temp_store();
        let job = sample_job("Cloud Engineer", "Acme");
        store.insert_job(&job)?;
        assert!(!store.notification_exists(&job.id)?);
        store.insert_notification(&job.id, "instant", true, "run-1")?;
        assert!(store.notification_exists(&job.id)?);
        assert!(
            store
                .insert_notification(&job.id, "instant", true, "run-1")
                .is_err()
        );
        Ok(())
    }

    #[test]
    fn transport_cursor_round_trips() -> Result<()> {
        let (_dir, store) = open_temp_store();
        assert_eq!(store.get_transport_cursor("telegram_updates")?, None);
        store.set_transport_cursor("telegram_updates", 42)?;
        assert_eq!(store.get_transport_cursor("telegram_updates")?, Some(42));
        store.set_transport_cursor("telegram_updates", 43)?;
        assert_eq!(store.get_transport_cursor("telegram_updates")?, Some(43));
        Ok(())
    }
}
