use std::process::ExitCode;

use anyhow::Context;

use testgen::config::Config;
use testgen::error::{EXIT_FAILURE, TestgenError};
use testgen::orchestrator::{Orchestrator, RunSummary};
use testgen::task::TaskFamily;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // .env in the working directory; real environment variables win.
    dotenvy::dotenv().ok();

    match run().await {
        Ok(summary) if summary.has_failures() => ExitCode::from(EXIT_FAILURE),
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => match e.downcast_ref::<TestgenError>() {
            Some(err) => {
                tracing::error!(stage = err.stage(), "{e:#}");
                tracing::error!("{}", err.user_message());
                ExitCode::from(err.exit_code())
            }
            None => {
                tracing::error!("{e:#}");
                ExitCode::from(EXIT_FAILURE)
            }
        },
    }
}

async fn run() -> anyhow::Result<RunSummary> {
    let config = Config::from_env();

    let family = match &config.tasks_file {
        Some(path) => TaskFamily::load(&config.root_dir.join(path))
            .await
            .with_context(|| format!("loading task family from {}", path.display()))?,
        None => TaskFamily::pet_status(),
    };

    Ok(Orchestrator::new(config, family).run().await?)
}
