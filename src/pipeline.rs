use std::collections::HashMap;

use anyhow::Context as _;
use chrono::Utc;

use crate::checkpoint::{Checkpoint, CheckpointFile, CheckpointStatus};
use crate::config::{Settings, load_master_resume, load_site_configs};
use crate::filter::{KeywordVerdict, dedup_new_jobs, keyword_check};
use crate::llm::ModelClient;
use crate::models::{
    Application, ApplicationStatus, Job, PipelineRun, RunStatus, ScoredJob, SiteConfig,
    TailoredResume,
};
use crate::notify::{Notifier, NotifyTier};
use crate::pdf::CommandPdfRenderer;
use crate::score::Scorer;
use crate::scrape::Scraper;
use crate::store::Store;
use crate::tailor::{Tailor, VerificationFailed};

pub const STAGE_POLL_FEEDBACK: &str = "poll-feedback";
pub const STAGE_SCRAPE: &str = "scrape";
pub const STAGE_DEDUP: &str = "dedup";
pub const STAGE_KEYWORD_FILTER: &str = "keyword-filter";
pub const STAGE_SCORE: &str = "score";
pub const STAGE_TAILOR: &str = "tailor";
pub const STAGE_NOTIFY: &str = "notify";
pub const STAGE_FINALIZE: &str = "finalize";

/// Runs the whole pipeline once. A crashed previous run (checkpoint status
/// still `running`) is resumed: completed sites and per-item progress are
/// skipped, everything else re-runs against the same run id.
pub async fn run(settings: &Settings) -> anyhow::Result<PipelineRun> {
    let mut notifier = Notifier::new(&settings.notifications, &settings.secrets);

    match run_stages(settings, &mut notifier).await {
        Ok(run) => Ok(run),
        Err(err) => {
            notifier
                .send_health_alert(&format!("Pipeline crashed: {err:#}"))
                .await;
            Err(err)
        }
    }
}

async fn run_stages(settings: &Settings, notifier: &mut Notifier) -> anyhow::Result<PipelineRun> {
    // Everything here is fatal: without the profile, the site list, or the
    // store there is no run to quarantine into.
    let resume_text = load_master_resume(&settings.paths.master_resume)
        .context("load master resume")?
        .to_prompt_text();
    let sites = load_site_configs(&settings.paths.site_configs_dir).context("load site configs")?;
    if sites.is_empty() {
        tracing::warn!("no enabled sites configured; the run will be empty");
    }
    let store = Store::open(&settings.paths.database()).context("open store")?;
    let llm = ModelClient::new(&settings.llm).context("build model client")?;

    let checkpoint_file = CheckpointFile::new(settings.paths.checkpoint());
    let checkpoint = match checkpoint_file.load().context("load checkpoint")? {
        Some(previous) if previous.status == CheckpointStatus::Running => {
            tracing::info!(run_id = %previous.run_id, "previous run did not finish; resuming");
            previous
        }
        _ => Checkpoint::new(uuid::Uuid::new_v4().to_string(), Utc::now()),
    };

    // A resumed run continues its stored record; counters and the error log
    // carry across attempts instead of being zeroed on every process start.
    let run = match store.get_run(&checkpoint.run_id).context("load run record")? {
        Some(mut previous) => {
            previous.status = RunStatus::Running;
            previous.completed_at = None;
            previous
        }
        None => PipelineRun::new(checkpoint.run_id.clone(), checkpoint.started_at),
    };

    let mut pipeline = Pipeline {
        settings,
        notifier,
        store,
        checkpoint_file,
        run,
        checkpoint,
        llm,
        renderer: CommandPdfRenderer::new(&settings.pdf.renderer_bin),
        resume_text,
        sites,
    };

    match pipeline.execute().await {
        Ok(run) => Ok(run),
        Err(err) => {
            pipeline.run.status = RunStatus::Crashed;
            pipeline.run.errors.push(format!("{err:#}"));
            if let Err(store_err) = pipeline.store.upsert_run(&pipeline.run) {
                tracing::error!(error = %format!("{store_err:#}"), "failed to record crashed run");
            }
            Err(err)
        }
    }
}

struct Pipeline<'a> {
    settings: &'a Settings,
    notifier: &'a mut Notifier,
    store: Store,
    checkpoint_file: CheckpointFile,
    run: PipelineRun,
    checkpoint: Checkpoint,
    llm: ModelClient,
    renderer: CommandPdfRenderer,
    resume_text: String,
    sites: Vec<SiteConfig>,
}

impl Pipeline<'_> {
    async fn execute(&mut self) -> anyhow::Result<PipelineRun> {
        tracing::info!(run_id = %self.run.run_id, sites = self.sites.len(), "pipeline: start");
        self.store.upsert_run(&self.run)?;
        self.save_checkpoint()?;

        self.poll_feedback_stage().await?;
        self.scrape_stage().await?;

        let candidates = self.keyword_filter_stage()?;
        let scored = self.score_stage(&candidates).await?;
        let resumes = self.tailor_stage(&scored).await?;
        self.notify_stage(&scored, &resumes).await?;

        self.finalize().await
    }

    fn save_checkpoint(&mut self) -> anyhow::Result<()> {
        self.checkpoint_file
            .save(&mut self.checkpoint)
            .context("save checkpoint")
    }

    async fn poll_feedback_stage(&mut self) -> anyhow::Result<()> {
        if self.checkpoint.stage_done(STAGE_POLL_FEEDBACK) {
            return Ok(());
        }

        match self.notifier.poll_feedback(&self.store).await {
            Ok(written) => tracing::info!(feedback = written, "poll-feedback: done"),
            Err(err) => {
                // Feedback is retried next run; never blocks the pipeline.
                tracing::warn!(error = %format!("{err:#}"), "poll-feedback: failed; continuing");
            }
        }

        self.checkpoint.mark_stage_done(STAGE_POLL_FEEDBACK);
        self.save_checkpoint()
    }

    /// Scrape and dedup run interleaved per site: a site is marked scraped in
    /// the checkpoint only once its new jobs are durably in the store, so a
    /// crash in between re-runs the site and dedup drops the duplicates.
    ///
    /// The resume rule is per-site, never stage-level: a site is skipped iff
    /// the checkpoint lists it in `scraped_sites`, so sites that failed
    /// before a crash are retried on every attempt of the same run.
    async fn scrape_stage(&mut self) -> anyhow::Result<()> {
        self.run.sites_attempted = self.sites.len() as u64;

        let pending: Vec<SiteConfig> = self
            .sites
            .iter()
            .filter(|site| !self.checkpoint.site_scraped(&site.site_id))
            .cloned()
            .collect();
        if pending.len() < self.sites.len() {
            tracing::info!(
                skipped = self.sites.len() - pending.len(),
                "scrape: sites already complete in checkpoint"
            );
        }

        // Carried-forward failure entries go stale once their site has been
        // scraped or is about to be retried; those sites get a fresh verdict.
        self.run.sites_failed.retain(|failure| {
            !self.checkpoint.site_scraped(&failure.site)
                && !pending.iter().any(|site| site.site_id == failure.site)
        });

        if !pending.is_empty() {
            let scraper = Scraper::new(
                &self.settings.scrape,
                self.settings.paths.raw_archive(),
                self.run.run_id.clone(),
            )?;
            let report = scraper
                .scrape_sites(&pending, self.settings.scrape.max_workers)
                .await;

            for (site_id, jobs) in report.site_jobs {
                self.run.jobs_scraped += jobs.len() as u64;
                let fresh = dedup_new_jobs(&self.store, jobs)?;
                for job in &fresh {
                    self.store.insert_job(job)?;
                }
                self.checkpoint.mark_site_scraped(&site_id);
                self.save_checkpoint()?;
            }
            self.run.sites_failed.extend(report.failures);
        }

        // Both counters are derived from durable state so a crash between
        // per-site checkpoint saves and the run upsert cannot skew them.
        self.run.jobs_new = self.store.jobs_for_run(&self.run.run_id)?.len() as u64;
        self.run.sites_succeeded = self
            .sites
            .iter()
            .filter(|site| self.checkpoint.site_scraped(&site.site_id))
            .count() as u64;

        // A partially failing scrape is quarantined; every site failing is
        // catastrophic.
        if !self.sites.is_empty() && self.run.sites_succeeded == 0 {
            anyhow::bail!("all {} sites failed to scrape", self.sites.len());
        }

        self.checkpoint.mark_stage_done(STAGE_SCRAPE);
        self.checkpoint.mark_stage_done(STAGE_DEDUP);
        self.save_checkpoint()?;
        self.store.upsert_run(&self.run)?;
        Ok(())
    }

    /// The working set is always re-read from the store: on resume this
    /// brings back jobs from sites that were skipped this attempt.
    fn keyword_filter_stage(&mut self) -> anyhow::Result<Vec<Job>> {
        let all_jobs = self.store.jobs_for_run(&self.run.run_id)?;
        if all_jobs.is_empty() {
            tracing::warn!("no new jobs this run");
        }

        let site_keywords: HashMap<&str, &SiteConfig> = self
            .sites
            .iter()
            .map(|site| (site.site_id.as_str(), site))
            .collect();

        // Recomputed over the whole working set on every attempt.
        self.run.jobs_filtered_out = 0;
        let mut candidates = Vec::new();
        for job in all_jobs {
            let effective = self.settings.keywords.effective(
                site_keywords
                    .get(job.site_id.as_str())
                    .and_then(|site| site.keywords.as_ref()),
            );
            match keyword_check(&job, &effective) {
                KeywordVerdict::Accept => candidates.push(job),
                KeywordVerdict::Reject(reason) => {
                    self.run.jobs_filtered_out += 1;
                    tracing::debug!(job = %job.id, title = %job.title, reason, "filtered out");
                }
            }
        }

        tracing::info!(
            candidates = candidates.len(),
            filtered_out = self.run.jobs_filtered_out,
            "keyword-filter: done"
        );
        if !self.checkpoint.stage_done(STAGE_KEYWORD_FILTER) {
            self.checkpoint.mark_stage_done(STAGE_KEYWORD_FILTER);
            self.save_checkpoint()?;
        }
        Ok(candidates)
    }

    async fn score_stage(&mut self, candidates: &[Job]) -> anyhow::Result<Vec<(Job, ScoredJob)>> {
        let mut scored = Vec::new();

        for job in candidates {
            if self.checkpoint.job_scored(&job.id) {
                if let Some(existing) = self.store.get_score(&job.id)? {
                    scored.push((job.clone(), existing));
                }
                continue;
            }

            let outcome = Scorer::new(
                &self.llm,
                &self.resume_text,
                &self.settings.scoring.weights,
                self.settings.scoring.max_listing_chars,
            )
            .score(job)
            .await;

            match outcome {
                Ok(score) => {
                    self.store.insert_score(&score)?;
                    if !self.run.llm_providers_used.contains(&score.provider) {
                        self.run.llm_providers_used.push(score.provider.clone());
                    }
                    self.checkpoint.mark_job_scored(&job.id);
                    self.save_checkpoint()?;
                    tracing::info!(job = %job.id, score = score.score, provider = %score.provider, "scored");
                    scored.push((job.clone(), score));
                }
                Err(err) => {
                    tracing::error!(job = %job.id, stage = "score", error = %format!("{err:#}"), "scoring failed; continuing");
                    self.run
                        .errors
                        .push(format!("stage=score job={}: {err:#}", job.id));
                }
            }
        }

        self.run.jobs_scored = scored.len() as u64;
        self.checkpoint.mark_stage_done(STAGE_SCORE);
        self.save_checkpoint()?;
        self.store.upsert_run(&self.run)?;
        Ok(scored)
    }

    async fn tailor_stage(
        &mut self,
        scored: &[(Job, ScoredJob)],
    ) -> anyhow::Result<HashMap<String, TailoredResume>> {
        let threshold = self.settings.scoring.score_threshold;
        self.run.jobs_above_threshold = 0;
        let mut resumes = HashMap::new();

        for (job, score) in scored {
            if score.score < threshold {
                continue;
            }
            self.run.jobs_above_threshold += 1;

            if self.checkpoint.job_tailored(&job.id) {
                if let Some(existing) = self.store.get_resume(&job.id)? {
                    resumes.insert(job.id.clone(), existing);
                }
                continue;
            }

            let outcome = Tailor::new(
                &self.llm,
                &self.renderer,
                &self.resume_text,
                self.settings.paths.resumes(),
                self.run.run_id.clone(),
            )
            .tailor(job)
            .await;

            match outcome {
                Ok(resume) => {
                    self.store.insert_resume(&resume)?;
                    self.checkpoint.mark_job_tailored(&job.id);
                    self.save_checkpoint()?;
                    tracing::info!(job = %job.id, pdf = %resume.pdf_path, "résumé generated");
                    resumes.insert(job.id.clone(), resume);
                }
                Err(err) => {
                    // The job stays in the notify stage, just without a PDF.
                    let stage = if err.downcast_ref::<VerificationFailed>().is_some() {
                        "verify"
                    } else {
                        "tailor"
                    };
                    tracing::error!(job = %job.id, stage, error = %format!("{err:#}"), "tailoring failed; continuing");
                    self.run
                        .errors
                        .push(format!("stage={stage} job={}: {err:#}", job.id));
                }
            }
        }

        // Includes résumés tailored before a crash and fetched back above.
        self.run.resumes_generated = resumes.len() as u64;

        self.checkpoint.mark_stage_done(STAGE_TAILOR);
        self.save_checkpoint()?;
        self.store.upsert_run(&self.run)?;
        Ok(resumes)
    }

    async fn notify_stage(
        &mut self,
        scored: &[(Job, ScoredJob)],
        resumes: &HashMap<String, TailoredResume>,
    ) -> anyhow::Result<()> {
        for (job, score) in scored {
            if self.checkpoint.job_notified(&job.id) {
                continue;
            }

            match self.notifier.tier(score.score) {
                NotifyTier::Instant => {
                    if let Err(err) = self.send_instant(job, score, resumes).await {
                        tracing::error!(job = %job.id, stage = "notify", error = %format!("{err:#}"), "notification failed; continuing");
                        self.run
                            .errors
                            .push(format!("stage=notify job={}: {err:#}", job.id));
                    }
                }
                NotifyTier::Digest => {
                    self.notifier.queue_digest(job, score);
                    self.store
                        .insert_notification(&job.id, "digest", false, &self.run.run_id)?;
                }
                NotifyTier::LogOnly => {
                    tracing::info!(job = %job.id, score = score.score, title = %job.title, "match logged only");
                }
                NotifyTier::Discard => {
                    tracing::debug!(job = %job.id, score = score.score, "below log threshold; discarded");
                }
            }

            self.checkpoint.mark_job_notified(&job.id);
            self.save_checkpoint()?;
        }

        let digest_len = self.notifier.digest_len();
        if digest_len > 0 {
            tracing::info!(matches = digest_len, "sending digest");
        }
        self.notifier.send_digest();

        // Derived from the notification rows so sends from a crashed attempt
        // stay counted on resume.
        self.run.notifications_sent = self
            .store
            .count_notifications_sent(&self.run.run_id)?;

        self.checkpoint.mark_stage_done(STAGE_NOTIFY);
        self.save_checkpoint()?;
        self.store.upsert_run(&self.run)?;
        Ok(())
    }

    async fn send_instant(
        &mut self,
        job: &Job,
        score: &ScoredJob,
        resumes: &HashMap<String, TailoredResume>,
    ) -> anyhow::Result<()> {
        if self.store.get_application_for_job(&job.id)?.is_none() {
            self.store.insert_application(&Application {
                id: uuid::Uuid::new_v4().to_string(),
                job_id: job.id.clone(),
                company: job.company.clone(),
                role: job.title.clone(),
                country: job.country.clone(),
                applied_date: None,
                resume_version: resumes.get(&job.id).map(|r| r.pdf_path.clone()),
                status: ApplicationStatus::Matched,
                status_updated: Utc::now(),
                notes: None,
                source_site: job.site_id.clone(),
            })?;
        }

        let priors = self.store.applications_for_company(&job.company, &job.id)?;
        if !priors.is_empty() {
            tracing::info!(job = %job.id, company = %job.company, priors = priors.len(), "prior applications at this company");
        }

        let pdf_path = resumes
            .get(&job.id)
            .filter(|resume| resume.verified)
            .map(|resume| std::path::PathBuf::from(&resume.pdf_path));
        let sent = self
            .notifier
            .send_match(job, score, &priors, pdf_path.as_deref())
            .await;

        self.store
            .insert_notification(&job.id, "instant", sent, &self.run.run_id)?;
        Ok(())
    }

    async fn finalize(&mut self) -> anyhow::Result<PipelineRun> {
        if !self.run.sites_failed.is_empty() || !self.run.errors.is_empty() {
            let summary = format!(
                "Run {} finished with issues: {} site failure(s), {} error(s).\n{}",
                self.run.run_id,
                self.run.sites_failed.len(),
                self.run.errors.len(),
                self.run
                    .sites_failed
                    .iter()
                    .map(|f| format!("• {} ({}): {}", f.site, f.stage, f.error))
                    .chain(self.run.errors.iter().map(|e| format!("• {e}")))
                    .collect::<Vec<_>>()
                    .join("\n")
            );
            self.notifier.send_health_alert(&summary).await;
        }

        let now = Utc::now();
        self.run.status = RunStatus::Completed;
        self.run.completed_at = Some(now);
        self.store.upsert_run(&self.run)?;

        self.checkpoint.mark_stage_done(STAGE_FINALIZE);
        self.checkpoint.complete(now);
        self.save_checkpoint()?;

        tracing::info!(
            run_id = %self.run.run_id,
            sites_succeeded = self.run.sites_succeeded,
            sites_failed = self.run.sites_failed.len(),
            jobs_scraped = self.run.jobs_scraped,
            jobs_new = self.run.jobs_new,
            jobs_filtered_out = self.run.jobs_filtered_out,
            jobs_scored = self.run.jobs_scored,
            jobs_above_threshold = self.run.jobs_above_threshold,
            resumes_generated = self.run.resumes_generated,
            notifications_sent = self.run.notifications_sent,
            errors = self.run.errors.len(),
            "pipeline: completed"
        );

        Ok(self.run.clone())
    }
}
