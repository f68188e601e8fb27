mod stubs;

use chrono::Utc;
use jobhunter::checkpoint::{Checkpoint, CheckpointFile, CheckpointStatus};
use jobhunter::models::{Job, RunStatus, ScoredJob, job_id};
use jobhunter::store::Store;
use stubs::{JobBoardStub, ModelStub, test_settings, write_site_config};

fn seeded_job(index: usize, run_id: &str) -> Job {
    let title = format!("Engineer {index} fit50");
    let company = format!("Corp {index}");
    Job {
        id: job_id(&title, &company, "Utrecht"),
        site_id: "board1".to_owned(),
        title,
        company,
        location: "Utrecht".to_owned(),
        country: "NL".to_owned(),
        url: format!("https://corp{index}.example/jobs/{index}"),
        salary: None,
        description: None,
        requirements: None,
        posted_date: None,
        scraped_at: Utc::now(),
        run_id: run_id.to_owned(),
    }
}

/// A run crashed after scraping its one site and scoring jobs 1–3. On
/// restart the site must not be re-fetched, the model must only be called
/// for jobs 4–6, and the stored scores for 1–3 must come back untouched.
#[tokio::test(flavor = "multi_thread")]
async fn resumed_run_skips_scraped_sites_and_scored_jobs() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let board = JobBoardStub::spawn(
        (1..=6)
            .map(|i| {
                (
                    format!("Engineer {i} fit50"),
                    format!("Corp {i}"),
                    "Utrecht".to_owned(),
                )
            })
            .collect(),
        false,
    );
    let model = ModelStub::spawn(0);

    let settings = test_settings(temp.path(), &model.base_url, None);
    write_site_config(&settings, "board1", &board);

    let run_id = "crashed-run".to_owned();
    let jobs: Vec<Job> = (1..=6).map(|i| seeded_job(i, &run_id)).collect();

    let mut seeded_scores = Vec::new();
    {
        let store = Store::open(&settings.paths.database())?;
        for job in &jobs {
            store.insert_job(job)?;
            store.mark_seen(&job.id, Utc::now())?;
        }
        for job in &jobs[..3] {
            store.insert_score(&ScoredJob {
                job_id: job.id.clone(),
                score: 50,
                reasoning: "reasoning from the crashed attempt".to_owned(),
                provider: "seeded-provider".to_owned(),
                scored_at: Utc::now(),
            })?;
            seeded_scores.push(store.get_score(&job.id)?.expect("seeded score"));
        }
    }

    // Checkpoint as the crashed process left it: status still running.
    let mut checkpoint = Checkpoint::new(run_id.clone(), Utc::now());
    checkpoint.mark_stage_done("poll-feedback");
    checkpoint.mark_stage_done("scrape");
    checkpoint.mark_stage_done("dedup");
    checkpoint.mark_site_scraped("board1");
    for job in &jobs[..3] {
        checkpoint.mark_job_scored(&job.id);
    }
    CheckpointFile::new(settings.paths.checkpoint()).save(&mut checkpoint)?;

    let run = jobhunter::pipeline::run(&settings).await?;

    assert_eq!(run.run_id, run_id, "resumed under the same run id");
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.errors.is_empty(), "errors: {:?}", run.errors);

    assert_eq!(board.request_count(), 0, "completed site is not re-fetched");
    assert_eq!(model.score_calls(), 3, "model called only for jobs 4-6");

    let store = Store::open(&settings.paths.database())?;
    assert_eq!(store.jobs_for_run(&run_id)?.len(), 6, "no duplicate inserts");

    for (job, before) in jobs[..3].iter().zip(&seeded_scores) {
        let after = store.get_score(&job.id)?.expect("score still present");
        assert_eq!(&after, before, "stored score changed across resume");
    }
    for job in &jobs[3..] {
        let score = store.get_score(&job.id)?.expect("new score");
        assert_eq!(score.provider, "primary");
        assert_eq!(score.score, 50);
    }
    assert_eq!(run.jobs_scored, 6);

    let final_checkpoint = CheckpointFile::new(settings.paths.checkpoint())
        .load()?
        .expect("checkpoint exists");
    assert_eq!(final_checkpoint.status, CheckpointStatus::Completed);
    assert_eq!(final_checkpoint.scored_jobs.len(), 6);
    Ok(())
}

/// A completed checkpoint means the next invocation is a fresh run.
#[tokio::test(flavor = "multi_thread")]
async fn completed_checkpoint_starts_a_fresh_run() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let board = JobBoardStub::spawn(vec![], false);
    let model = ModelStub::spawn(0);

    let settings = test_settings(temp.path(), &model.base_url, None);
    write_site_config(&settings, "board1", &board);

    let mut checkpoint = Checkpoint::new("finished-run".to_owned(), Utc::now());
    checkpoint.complete(Utc::now());
    CheckpointFile::new(settings.paths.checkpoint()).save(&mut checkpoint)?;

    let run = jobhunter::pipeline::run(&settings).await?;
    assert_ne!(run.run_id, "finished-run");
    assert_eq!(run.status, RunStatus::Completed);
    assert!(board.request_count() > 0, "fresh run scrapes the site");
    Ok(())
}
