type Result<T> = color_eyre::eyre::Result<T>;

mod cli;

use clap::Parser;
use eyre::WrapErr;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Config};
use delivery_oracle::verifier::check_all;
use delivery_oracle::{DaemonController, ExpectedDelivery, MessageGenerator, RunContext};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    info!("delivery-oracle starting");

    let cli = Cli::parse();
    let config = Config::from_cli(cli)?;

    let config_text = tokio::fs::read_to_string(&config.config_file)
        .await
        .wrap_err_with(|| format!("failed to read {}", config.config_file.display()))?;

    let mut controller = DaemonController::new(config.controller.clone());
    controller.start(&config_text).await?;

    let outcome = run_scenario(&config, &mut controller).await;
    if outcome.is_err() && controller.is_running() {
        if let Err(e) = controller.stop().await {
            warn!("failed to stop subject after error: {}", e);
        }
    }

    if !outcome? {
        error!("delivery verification failed");
        std::process::exit(1);
    }

    info!("delivery-oracle exiting");
    Ok(())
}

/// Sends every stream, then checks the sinks and stops the subject
///
/// # Returns
/// * `Result<bool>` - True if every sink matched and the subject exited cleanly
async fn run_scenario(config: &Config, controller: &mut DaemonController) -> Result<bool> {
    let mut ctx = RunContext::new();
    let mut generator = MessageGenerator::new(config.transport.clone());

    let mut expected: Vec<ExpectedDelivery> = Vec::with_capacity(config.kinds.len());
    for kind in &config.kinds {
        expected.push(
            generator
                .send_stream_with_priority(&mut ctx, kind, config.priority)
                .await?,
        );
    }
    generator.close().await?;

    let (verdict, clean_exit) = if config.check_after_stop {
        let clean_exit = controller.stop().await?;
        let verdict = check_all(controller, &mut ctx, &config.sinks, &expected, config.settle_time, &config.scan).await?;
        (verdict, clean_exit)
    } else {
        let verdict = check_all(controller, &mut ctx, &config.sinks, &expected, config.settle_time, &config.scan).await?;
        (verdict, controller.stop().await?)
    };

    if !clean_exit {
        warn!("subject exited with {:?}", controller.exit_status());
    }
    Ok(verdict.is_ok() && clean_exit)
}
