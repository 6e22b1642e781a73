mod cli;
mod config;
mod connection;
mod error;
mod message;
mod protocol;
mod registry;
mod server;
mod sink;
mod types;

use clap::Parser;
use tracing::{Level, error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use cli::Cli;
use error::ChatError;
use server::Server;

#[tokio::main]
async fn main() -> Result<(), ChatError> {
    let cli = Cli::parse();
    init_logging(cli.log_level);

    let config = cli.to_config()?;
    let server = Server::new(config);

    let listener = match server.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "cannot start chat server");
            return Err(e);
        }
    };

    let result = server
        .run(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await;
    match &result {
        Ok(()) => info!(online = server.registry().len(), "chat server stopped"),
        Err(e) => error!(error = %e, "listener stopped"),
    }
    result
}

fn init_logging(level: Level) {
    let directive = format!("line_chat_server={}", level.as_str().to_ascii_lowercase());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive)))
        .with(tracing_subscriber::fmt::layer().with_target(true).compact())
        .init();
}
