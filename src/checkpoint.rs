use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Running,
    Completed,
}

/// Durable record of a run's progress: completed stages plus per-item
/// progress sets. The orchestrator is the only writer; every save is an
/// atomic rewrite, so the last consistent state survives a crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    pub status: CheckpointStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub completed_stages: Vec<String>,
    pub scraped_sites: Vec<String>,
    pub scored_jobs: Vec<String>,
    pub tailored_jobs: Vec<String>,
    pub notified_jobs: Vec<String>,
}

impl Checkpoint {
    pub fn new(run_id: String, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            status: CheckpointStatus::Running,
            started_at,
            completed_at: None,
            updated_at: started_at,
            completed_stages: Vec::new(),
            scraped_sites: Vec::new(),
            scored_jobs: Vec::new(),
            tailored_jobs: Vec::new(),
            notified_jobs: Vec::new(),
        }
    }

    pub fn stage_done(&self, stage: &str) -> bool {
        self.completed_stages.iter().any(|s| s == stage)
    }

    pub fn mark_stage_done(&mut self, stage: &str) {
        if !self.stage_done(stage) {
            self.completed_stages.push(stage.to_owned());
        }
    }

    pub fn site_scraped(&self, site_id: &str) -> bool {
        self.scraped_sites.iter().any(|s| s == site_id)
    }

    pub fn mark_site_scraped(&mut self, site_id: &str) {
        if !self.site_scraped(site_id) {
            self.scraped_sites.push(site_id.to_owned());
        }
    }

    pub fn job_scored(&self, job_id: &str) -> bool {
        self.scored_jobs.iter().any(|j| j == job_id)
    }

    pub fn mark_job_scored(&mut self, job_id: &str) {
        if !self.job_scored(job_id) {
            self.scored_jobs.push(job_id.to_owned());
        }
    }

    pub fn job_tailored(&self, job_id: &str) -> bool {
        self.tailored_jobs.iter().any(|j| j == job_id)
    }

    pub fn mark_job_tailored(&mut self, job_id: &str) {
        if !self.job_tailored(job_id) {
            self.tailored_jobs.push(job_id.to_owned());
        }
    }

    pub fn job_notified(&self, job_id: &str) -> bool {
        self.notified_jobs.iter().any(|j| j == job_id)
    }

    pub fn mark_job_notified(&mut self, job_id: &str) {
        if !self.job_notified(job_id) {
            self.notified_jobs.push(job_id.to_owned());
        }
    }

    pub fn complete(&mut self, at: DateTime<Utc>) {
        self.status = CheckpointStatus::Completed;
        self.completed_at = Some(at);
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointFile {
    path: PathBuf,
}

impl CheckpointFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the last checkpoint, or `None` when no run has happened yet.
    pub fn load(&self) -> anyhow::Result<Option<Checkpoint>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read checkpoint: {}", self.path.display()));
            }
        };
        let checkpoint = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse checkpoint: {}", self.path.display()))?;
        Ok(Some(checkpoint))
    }

    /// Atomic rewrite: write to a temp sibling, then rename over the target.
    pub fn save(&self, checkpoint: &mut Checkpoint) -> anyhow::Result<()> {
        checkpoint.updated_at = Utc::now();

        let parent = self
            .path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("checkpoint path has no parent: {}", self.path.display()))?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create checkpoint dir: {}", parent.display()))?;

        let tmp_path = self
            .path
            .with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
        let data = serde_json::to_vec_pretty(checkpoint).context("serialize checkpoint")?;
        std::fs::write(&tmp_path, &data)
            .with_context(|| format!("write tmp checkpoint: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("rename tmp to final: {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_round_trips_all_sets() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = CheckpointFile::new(dir.path().join("checkpoints/last_run.json"));
        assert!(file.load()?.is_none());

        let mut checkpoint = Checkpoint::new("run-1".to_owned(), Utc::now());
        checkpoint.mark_stage_done("scrape");
        checkpoint.mark_site_scraped("site_a");
        checkpoint.mark_site_scraped("site_a");
        checkpoint.mark_job_scored("job1");
        checkpoint.mark_job_tailored("job1");
        checkpoint.mark_job_notified("job1");
        file.save(&mut checkpoint)?;

        let loaded = file.load()?.expect("checkpoint exists");
        assert_eq!(loaded, checkpoint);
        assert_eq!(loaded.scraped_sites, vec!["site_a"]);
        assert!(loaded.stage_done("scrape"));
        assert!(!loaded.stage_done("score"));
        Ok(())
    }

    #[test]
    fn save_overwrites_previous_state() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = CheckpointFile::new(dir.path().join("last_run.json"));

        let mut checkpoint = Checkpoint::new("run-1".to_owned(), Utc::now());
        file.save(&mut checkpoint)?;
        checkpoint.mark_job_scored("job1");
        file.save(&mut checkpoint)?;
        checkpoint.complete(Utc::now());
        file.save(&mut checkpoint)?;

        let loaded = file.load()?.expect("checkpoint exists");
        assert_eq!(loaded.status, CheckpointStatus::Completed);
        assert!(loaded.completed_at.is_some());
        assert_eq!(loaded.scored_jobs, vec!["job1"]);

        // No temp files left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("tmp"))
            .collect();
        assert!(leftovers.is_empty());
        Ok(())
    }
}
