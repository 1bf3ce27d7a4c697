//! querygate CLI Entry Point
//!
//! Subcommands:
//! - `query` - Run one SQL statement
//! - `schema` - List tables, or describe one table
//! - `connections` - List configured connections
//! - `mcp` - MCP server mode (hidden, for AI agent integration)
//!
//! Rendered output goes to stdout. Logs, advisories and errors go to stderr.
//! Exit codes: 0 on success, 1 on error, 2 when a query was denied.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use querygate::gateway::render_connections;
use querygate::output::render_outcome;
use querygate::{Gateway, GatewayConfig, GatewayError, OutputFormat, QueryOutcome, QueryRequest};

/// Environment variable holding the log filter
const LOG_ENV: &str = "QUERYGATE_LOG";

/// querygate - safety-gated SQL execution gateway
#[derive(Parser)]
#[command(name = "querygate")]
#[command(about = "Run SQL against configured databases with a read-only-by-default safety gate")]
#[command(version)]
struct Cli {
    /// Config file (default: .querygate/config.json, then the user config directory)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one SQL statement
    Query {
        /// SQL text
        sql: String,

        /// Connection name (default: the configured default connection)
        #[arg(short, long)]
        connection: Option<String>,

        /// Output encoding
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,

        /// Maximum rows to return
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// List tables and views, or describe one table
    Schema {
        /// Table to describe
        table: Option<String>,

        /// Connection name (default: the configured default connection)
        #[arg(short, long)]
        connection: Option<String>,
    },

    /// List configured connections
    Connections {
        /// Connect to each connection and report whether it answers
        #[arg(long)]
        check: bool,
    },

    /// Start MCP server (hidden from help, for AI agent integration)
    #[command(hide = true)]
    Mcp,
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let config = match GatewayConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e.render());
            return ExitCode::FAILURE;
        }
    };
    let gateway = Gateway::new(config);

    match cli.command {
        Commands::Mcp => match querygate::mcp::serve(gateway).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("MCP server failed: {e:#}");
                ExitCode::FAILURE
            }
        },
        command => {
            let code = run(&gateway, command).await.unwrap_or_else(|e| {
                eprintln!("{}", e.render());
                ExitCode::FAILURE
            });
            gateway.shutdown().await;
            code
        }
    }
}

async fn run(gateway: &Gateway, command: Commands) -> Result<ExitCode, GatewayError> {
    match command {
        Commands::Query { sql, connection, format, limit } => {
            let request = QueryRequest { connection, sql, limit, format };
            let response = gateway.run_query(&request).await?;

            println!("{}", render_outcome(&response.outcome, format)?);
            if let Some(advisory) = response.advisory {
                eprintln!("{advisory}");
            }
            Ok(match response.outcome {
                QueryOutcome::Denied { .. } => ExitCode::from(2),
                _ => ExitCode::SUCCESS,
            })
        }
        Commands::Schema { table, connection } => {
            println!("{}", gateway.schema_text(connection.as_deref(), table.as_deref()).await?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Connections { check } => {
            println!("{}", render_connections(&gateway.list_connections())?);
            if check {
                let mut all_ok = true;
                let names: Vec<String> = gateway.config().connections.keys().cloned().collect();
                for name in names {
                    let status = match gateway.check_connection(Some(&name)).await {
                        Ok(true) => "ok".to_string(),
                        Ok(false) => "no response".to_string(),
                        Err(e) => e.render(),
                    };
                    all_ok &= status == "ok";
                    println!("{name}: {status}");
                }
                if !all_ok {
                    return Ok(ExitCode::FAILURE);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Mcp => Err(GatewayError::invalid_input("mcp is handled before dispatch")),
    }
}
