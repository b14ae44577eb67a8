use clap::Parser;
use evmproxy::cli::{Cli, Commands};
use evmproxy::settings::Settings;
use evmproxy::tasks::Tasks;
use evmproxy::{logging, server};
use std::time::Duration;

#[tokio::main]
async fn main() {
    evmproxy::install_crypto_provider();
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose);

    if let Err(err) = run_command(cli).await {
        tracing::error!(error = %err, "fatal error");
        std::process::exit(1);
    }
}

async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let mut settings = Settings::from_env()?;

    match cli.command {
        Commands::Api { bind, port } => {
            if let Some(bind) = bind {
                settings.api_bind = bind;
            }
            if let Some(port) = port {
                settings.api_port = port;
            }
            server::serve(settings).await?;
        }
        Commands::Tasks { once, pause_sec } => {
            let tasks = Tasks::new(settings, Duration::from_secs_f64(pause_sec));
            tasks.run(once).await?;
        }
    }
    Ok(())
}
