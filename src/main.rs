//! # Appealdesk CLI (`apd`)
//!
//! The `apd` binary is the primary interface for Appealdesk. It provides
//! commands for database initialization, demo data seeding, policy indexing,
//! retrieval, corpus statistics, and starting the HTTP API server.
//!
//! ## Usage
//!
//! ```bash
//! apd --config ./config/apd.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `apd init` | Create the SQLite database and run schema migrations |
//! | `apd seed` | Load the demo corpus (policies, cases, denial letters) |
//! | `apd index <file>` | Register a policy from a local file and index it |
//! | `apd search "<query>"` | Semantic search over indexed policy excerpts |
//! | `apd stats` | Print corpus statistics |
//! | `apd serve` | Start the HTTP API server |
//! | `apd completions <shell>` | Generate shell completions |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! apd init --config ./config/apd.toml
//!
//! # Load demo policies and cases
//! apd seed --config ./config/apd.toml
//!
//! # Index a payer policy PDF
//! apd index ./bcbs_imaging.pdf --name "BCBS Advanced Imaging" \
//!     --payer "Blue Cross Blue Shield" --state CA --effective-date 2024-01-01
//!
//! # Search the policy corpus
//! apd search "prior authorization for MRI" --payer "Blue Cross Blue Shield" -k 3
//!
//! # Start the API server
//! apd serve --config ./config/apd.toml
//! ```

mod chunk;
mod config;
mod db;
mod embedding;
mod extract;
mod indexer;
mod llm;
mod migrate;
mod models;
mod ocr;
mod pipeline;
mod search;
mod seed;
mod server;
mod stats;
mod store;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Appealdesk CLI — a document understanding and retrieval pipeline for
/// insurance appeal drafting.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/apd.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "apd",
    about = "Appealdesk — a document understanding and retrieval pipeline for insurance appeal drafting",
    version,
    long_about = "Appealdesk turns denied-claim paperwork into appeal drafts: it extracts text \
    from uploaded documents (with OCR fallback), chunks and embeds payer policies for semantic \
    retrieval, and runs a staged generation pipeline that grounds every draft in retrieved \
    policy excerpts."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/apd.toml`. Database, embedding, generation,
    /// retrieval, OCR, and server settings are read from this file.
    #[arg(long, global = true, default_value = "./config/apd.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (cases, documents, policies, policy_chunks, audit_log).
    /// This command is idempotent — running it multiple times is safe.
    Init,

    /// Load the demo corpus.
    ///
    /// Registers two payer policies (indexed when embeddings are enabled)
    /// and three demo cases with denial letters. Policies reindex cleanly
    /// on every run; demo cases are only created once.
    Seed,

    /// Register a policy from a local file and index it.
    ///
    /// Extracts text from the file (PDF or plain text, with OCR fallback),
    /// chunks it, embeds the chunks, and replaces any prior excerpt set for
    /// the same policy. Requires an embedding provider.
    Index {
        /// Path to the policy file.
        file: PathBuf,

        /// Policy name. A policy is identified by name, payer, and state;
        /// re-indexing the same triple replaces its excerpts.
        #[arg(long)]
        name: String,

        /// Payer the policy belongs to.
        #[arg(long)]
        payer: String,

        /// State the policy applies in.
        #[arg(long)]
        state: String,

        /// Policy effective date (YYYY-MM-DD).
        #[arg(long, default_value = "")]
        effective_date: String,
    },

    /// Search indexed policy excerpts.
    ///
    /// Embeds the query, ranks stored excerpts by cosine similarity, and
    /// prints the top matches with their policy metadata.
    Search {
        /// The search query string.
        query: String,

        /// Only return excerpts from this payer.
        #[arg(long)]
        payer: Option<String>,

        /// Only return excerpts for this state.
        #[arg(long)]
        state: Option<String>,

        /// Maximum number of results to return.
        #[arg(short)]
        k: Option<usize>,
    },

    /// Print corpus statistics.
    ///
    /// Shows case, document, policy, and chunk counts, embedding coverage,
    /// and a per-payer breakdown.
    Stats,

    /// Start the HTTP API server.
    ///
    /// Binds to the address configured in `[server].bind` and serves the
    /// case, document, policy, search, and pipeline endpoints.
    Serve,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "apd=info,appealdesk=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer().with_ansi(atty::is(atty::Stream::Stdout)),
        )
        .init();

    let cli = Cli::parse();

    // Completions need no config file
    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        let name = cmd.get_name().to_string();
        clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Seed => {
            seed::run_seed(&cfg).await?;
        }
        Commands::Index {
            file,
            name,
            payer,
            state,
            effective_date,
        } => {
            indexer::run_index(&cfg, &file, &name, &payer, &state, &effective_date).await?;
        }
        Commands::Search {
            query,
            payer,
            state,
            k,
        } => {
            search::run_search(&cfg, &query, payer, state, k).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Completions { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}
