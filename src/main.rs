//! # LedgerBox CLI (`lbx`)
//!
//! The `lbx` binary runs the invoice assistant: database initialization,
//! the HTTP API server, and a database stats overview.
//!
//! ## Usage
//!
//! ```bash
//! lbx --config ./config/lbx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `lbx init` | Create the SQLite database and run schema migrations |
//! | `lbx serve` | Start the HTTP API server |
//! | `lbx stats` | Print a database summary |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! lbx init --config ./config/lbx.toml
//!
//! # Start the API server
//! LEDGERBOX_JWT_SECRET=change-me lbx serve --config ./config/lbx.toml
//!
//! # Inspect the database
//! lbx stats --config ./config/lbx.toml
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use ledgerbox::{config, migrate, server, stats};

/// LedgerBox CLI — an invoice-parsing and expense-chat service.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/lbx.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "lbx",
    about = "LedgerBox — an invoice-parsing and expense-chat service",
    version,
    long_about = "LedgerBox stores uploaded invoices, sends them to an external parsing \
    service, derives vendor/amount/date fields, and answers spending questions through \
    a chat API with keyword classification and embedding-based similarity search."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/lbx.toml`. Database, server, auth, embedding,
    /// and parser settings are read from this file.
    #[arg(long, global = true, default_value = "./config/lbx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (users,
    /// accounts, chat_sessions, messages, invoices, invoice_searches).
    /// This command is idempotent — running it multiple times is safe.
    Init,

    /// Start the HTTP API server.
    ///
    /// Binds to the address configured in `[server].bind`. Requires the
    /// `LEDGERBOX_JWT_SECRET` environment variable for session signing.
    Serve,

    /// Print a database summary.
    ///
    /// Shows user, session, message, and invoice counts, invoice status
    /// breakdown, and embedding coverage.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| "ledgerbox=info,tower_http=info".into()),
                )
                .init();
            server::run_server(&cfg).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
