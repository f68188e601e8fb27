use std::path::Path;

use anyhow::Context as _;
use tracing_subscriber::fmt::writer::MakeWriterExt as _;

/// Initialize the global subscriber: env-filtered (`RUST_LOG`, default
/// `info`), formatted to stderr and, when `log_dir` is given, teed into a
/// dated log file under it.
pub fn init(log_dir: Option<&Path>) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))
        .context("build log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create log dir: {}", dir.display()))?;
            let path = dir.join(format!(
                "jobhunter-{}.log",
                chrono::Utc::now().format("%Y-%m-%d")
            ));
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("open log file: {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(std::io::stderr.and(std::sync::Arc::new(file)))
                .try_init()
                .map_err(|err| anyhow::anyhow!("initialize tracing subscriber: {err}"))?;
        }
        None => {
            builder
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|err| anyhow::anyhow!("initialize tracing subscriber: {err}"))?;
        }
    }

    Ok(())
}
