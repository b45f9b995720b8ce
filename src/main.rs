use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use tochka_exchange::config::Config;
use tochka_exchange::deploy::{self, ComposeFile};
use tochka_exchange::engine::{generate_api_key, Exchange};
use tochka_exchange::server::{start_server, AppState};
use tochka_exchange::{logging, metrics, storage};

#[derive(Parser)]
#[command(name = "tochka")]
#[command(about = "Exchange trading API with an in-process matching engine")]
#[command(version)]
struct Cli {
    /// Path to a config.toml (defaults to ./config.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve {
        /// Port to listen on, overriding config and PORT
        #[arg(long)]
        port: Option<u16>,
    },
    /// Create or upgrade the database schema and exit
    Migrate,
    /// Verify a docker-compose file
    CheckDeploy {
        #[arg(long, default_value = "docker-compose.yml")]
        file: PathBuf,
        /// Services the file must declare, and no others (comma-separated)
        #[arg(long, value_delimiter = ',')]
        expect_services: Vec<String>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Probe a running server's health endpoint; exits non-zero when unhealthy
    Healthcheck {
        #[arg(long, default_value = "http://127.0.0.1:8000/health")]
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            let _guard = logging::init_logging(&config.logging);
            serve(config).await
        }
        Commands::Migrate => {
            logging::init_console_logging(&config.logging);
            migrate(&config).await
        }
        Commands::CheckDeploy {
            file,
            expect_services,
            json,
        } => {
            logging::init_console_logging(&config.logging);
            check_deploy(&file, &expect_services, json)
        }
        Commands::Healthcheck { url } => healthcheck(&url).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    metrics::init_metrics();

    let storage = storage::connect(&config.database)
        .await
        .context("Failed to open storage")?;
    storage.migrate().await.context("Failed to run migrations")?;

    let admin_token = match config.exchange.admin_token.clone() {
        Some(token) => token,
        None => {
            let token = generate_api_key();
            warn!(
                "ADMIN_TOKEN is not set, generated a one-off admin token: {}",
                token
            );
            token
        }
    };

    let exchange = Arc::new(Exchange::new(storage, config.exchange.clone()));
    exchange
        .bootstrap(&admin_token)
        .await
        .context("Failed to initialize base data")?;

    let addr: SocketAddr = format!("{}:{}", config.server.bind_addr, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid listen address {}:{}",
                config.server.bind_addr, config.server.port
            )
        })?;

    start_server(AppState::new(exchange), addr).await
}

async fn migrate(config: &Config) -> Result<()> {
    let storage = storage::connect(&config.database)
        .await
        .context("Failed to open storage")?;
    storage.migrate().await.context("Failed to run migrations")?;
    info!("Schema is up to date");
    println!("✅ Migrations applied");
    Ok(())
}

fn check_deploy(file: &Path, expected: &[String], json: bool) -> Result<()> {
    let compose = ComposeFile::load(file)
        .with_context(|| format!("Failed to parse {}", file.display()))?;

    let mut report = deploy::check(&compose, |key| std::env::var(key).ok());
    if !expected.is_empty() {
        let names: Vec<&str> = expected.iter().map(String::as_str).collect();
        deploy::expect_services(&compose, &names, &mut report);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for finding in &report.findings {
            println!("{finding}");
        }
    }

    if report.has_errors() {
        bail!(
            "{} failed with {} error(s)",
            file.display(),
            report.errors().count()
        );
    }
    if !json {
        println!(
            "✅ {} passed ({} warning(s))",
            file.display(),
            report.warnings().count()
        );
    }
    Ok(())
}

async fn healthcheck(url: &str) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to reach {url}"))?;
    if !response.status().is_success() {
        bail!("{} responded with {}", url, response.status());
    }
    println!("healthy");
    Ok(())
}
