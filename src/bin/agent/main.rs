use std::sync::Arc;

use anyhow::{Context, Result};
use browser_pilot::config::Config;
use browser_pilot::face::{self, AppState};
use browser_pilot::hands::ChromeBrowser;
use browser_pilot::{Brain, FileReport};
use clap::Parser;
use dotenvy::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::parse();
    info!("starting browser agent");

    // Chrome is launched lazily by the first session so the server is
    // reachable immediately.
    let browser = Arc::new(ChromeBrowser::new(config.chrome_settings()));
    let brain = Arc::new(Brain::new(config.brain_settings()));
    let reports = Arc::new(
        FileReport::new(&config.reports_dir, config.report_base_url.clone())
            .with_context(|| format!("cannot use reports dir {}", config.reports_dir.display()))?,
    );

    let state = AppState::new(
        browser,
        brain,
        reports,
        config.loop_settings(),
        config.interaction_settings(),
    );
    face::serve(&config.host, config.port, state).await
}
