//! CLI for msgrouter
//!
//! Subcommands:
//! - `server`: run the message router until Ctrl-C
//! - `client`: connect, subscribe, publish and print what arrives (useful for smoke tests)

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use msgrouter::broker::MessageRouterServer;
use msgrouter::client::{MessageRouterClient, PublishOptions};
use msgrouter::config::{Settings, load_config};
use msgrouter::transport::WebSocketServer;
use msgrouter::utils::logging;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "msgrouter", about = "WebSocket message router")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the message router
    Server,
    /// Run a simple client: subscribe to a topic, publish to it, print what arrives
    Client {
        /// WebSocket URL of the router
        #[arg(long)]
        url: String,
        /// Access token sent with the handshake
        #[arg(long)]
        token: Option<String>,
        #[arg(long, default_value = "chat")]
        topic: String,
        #[arg(long, default_value = "Hello from msgrouter")]
        message: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    logging::init(&settings.logging.level);

    let result = match cli.command {
        Command::Server => run_server(settings).await,
        Command::Client {
            url,
            token,
            topic,
            message,
        } => run_client(&url, token.as_deref(), &topic, &message).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_server(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let broker = MessageRouterServer::from_settings(&settings.broker);
    let server =
        WebSocketServer::start(&settings.server, broker.clone(), settings.broker.queue_capacity)
            .await?;
    info!("Message router ready at {}", server.url());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully.");

    server.stop().await;
    broker.shutdown().await;
    Ok(())
}

async fn run_client(
    url: &str,
    token: Option<&str>,
    topic: &str,
    message: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = MessageRouterClient::connect(url, token).await?;
    println!("Connected as {}", client.client_id());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let subscription = client
        .subscribe(topic, move |message| {
            let _ = tx.send(message);
        })
        .await?;

    client
        .publish(topic, message, PublishOptions::default())
        .await?;

    match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
        Ok(Some(incoming)) => println!(
            "Incoming on {}: {}",
            incoming.topic,
            incoming.payload.unwrap_or_default()
        ),
        _ => println!("Nothing received on {topic}"),
    }

    subscription.unsubscribe().await?;
    client.close().await;
    Ok(())
}
