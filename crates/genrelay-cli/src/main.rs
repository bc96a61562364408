mod config;

use crate::config::GenrelayConfig;
use clap::{Parser, Subcommand};
use genrelay_agent::{GenerateImageTool, OpenAiBackend, StreamRelay, ToolRegistry};
use genrelay_gateway::GatewayServer;
use genrelay_generation::{GenerationCoordinator, HttpImageGenerator, PromptDescriptor};
use genrelay_session::{FileMessageStore, PersistenceReconciler};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "genrelay", about = "genrelay: streaming chat relay with deduplicated image generation")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "genrelay.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Generate one image and print its reference
    Generate {
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        style: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = GenrelayConfig::load(&cli.config).await?;

    let generator = Arc::new(HttpImageGenerator::new(config.image.clone()));
    let coordinator = GenerationCoordinator::new(generator, &config.coordinator);

    match cli.command {
        Commands::Serve { host, port } => {
            let host = host.unwrap_or(config.server.host);
            let port = port.unwrap_or(config.server.port);

            info!("Starting genrelay gateway on {}:{}", host, port);

            let store = Arc::new(FileMessageStore::new(config.data_dir.join("messages")).await?);
            let reconciler = Arc::new(PersistenceReconciler::new(
                store.clone(),
                &config.reconciler,
            ));
            let _watcher = reconciler.clone().watch(coordinator.subscribe());

            let mut tools = ToolRegistry::new();
            tools.register(Arc::new(
                GenerateImageTool::new(coordinator.clone()).with_reconciler(reconciler.clone()),
            ));
            info!(count = tools.len(), "Tools registered");

            let relay = StreamRelay::new(
                Arc::new(OpenAiBackend::new(config.model)),
                Arc::new(tools),
                store.clone(),
                reconciler,
                config.relay,
            );

            let app = GatewayServer::build(relay, coordinator, store);

            let addr = format!("{}:{}", host, port);
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!("genrelay gateway listening on {}", addr);
            axum::serve(listener, app).await?;
        }
        Commands::Generate { prompt, style } => {
            let mut descriptor = PromptDescriptor::new(prompt);
            if let Some(style) = style {
                descriptor = descriptor.with_style(style);
            }
            let artifact = coordinator.request(descriptor).await?;
            println!("{}", artifact);
        }
    }

    Ok(())
}
