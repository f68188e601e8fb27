use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    let cli = jobhunter::cli::Cli::parse();

    match cli.command {
        jobhunter::cli::Command::Run(args) => {
            let settings =
                jobhunter::config::load_settings(&args.settings).context("load settings")?;
            jobhunter::logging::init(Some(settings.paths.log_dir.as_path()))
                .context("init logging")?;
            tracing::debug!(?args, "parsed cli");

            jobhunter::pipeline::run(&settings)
                .await
                .context("run pipeline")?;
        }
    }

    Ok(())
}
