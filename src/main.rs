use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use webshell_gateway::bridge::{Gateway, SshConnector};
use webshell_gateway::cli::Cli;
use webshell_gateway::config::{load_config, GatewayConfig};
use webshell_gateway::ssh::HostKeyPolicy;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    webshell_gateway::init_logging();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => load_config(path).await?,
        None => GatewayConfig::default(),
    };
    cli.apply(&mut config);
    config.validate()?;

    info!("Starting webshell-gateway {}", env!("CARGO_PKG_VERSION"));
    if config.host_key_policy == HostKeyPolicy::AutoAccept {
        warn!("Host key policy is auto_accept: server host keys are NOT verified");
    }

    let config = Arc::new(config);
    let connector = SshConnector::from_config(config.clone())?;
    let gateway = Arc::new(Gateway::new(config, Arc::new(connector)));
    let listener = gateway.bind().await?;

    gateway
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    Ok(())
}
