use anyhow::Result;
use clap::{Parser, Subcommand};
use clinical_ai_gateway::audit::create_audit_store;
use clinical_ai_gateway::{gateway, Config};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Safety gateway for AI decision support in clinical workflows.
#[derive(Parser, Debug)]
#[command(name = "clinical-ai-gateway")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP gateway
    Serve {
        /// Bind address (overrides gateway.host)
        #[arg(long)]
        host: Option<String>,

        /// Port (overrides gateway.port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Inspect configuration
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Inspect the audit trail
    #[command(subcommand)]
    Audit(AuditCommands),
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective config as TOML
    Show,
    /// Print the JSON Schema of the config file
    Schema,
}

#[derive(Subcommand, Debug)]
enum AuditCommands {
    /// Print recent audit records as JSON lines
    Tail {
        /// Only records for this session (oldest first)
        #[arg(long)]
        session: Option<String>,

        /// Number of records to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
}

/// `RUST_LOG` wins over `logging.level`.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Config(ConfigCommands::Schema) = cli.command {
        println!("{}", Config::json_schema()?);
        return Ok(());
    }

    let config = Config::load(cli.config.as_deref())?;
    init_tracing(&config.logging.level);

    match cli.command {
        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.gateway.host.clone());
            let port = port.unwrap_or(config.gateway.port);
            tracing::info!(
                model = %config.provider.model,
                provider = %config.provider.kind,
                audit = %config.audit.backend,
                "Starting clinical AI gateway"
            );
            gateway::run_gateway(&host, port, config).await
        }
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Config(ConfigCommands::Schema) => Ok(()),
        Commands::Audit(AuditCommands::Tail { session, limit }) => {
            let store = create_audit_store(&config)?;
            let records = match session {
                Some(session) => store.for_session(&session, limit).await?,
                None => store.recent(limit).await?,
            };
            for record in records {
                println!("{}", serde_json::to_string(&record)?);
            }
            Ok(())
        }
    }
}
