//! MAAS CLI — evaluate procurement proposals with a team of agents.
//!
//! Reuses the same core domain logic (maas-core) that an API service would
//! expose, over a local SQLite database.

use clap::{Parser, Subcommand};

use maas_cli::commands;

/// MAAS — multi-agent procurement proposal evaluation
#[derive(Parser)]
#[command(name = "maas", version, about = "MAAS — multi-agent procurement proposal evaluation")]
pub struct Cli {
    /// Path to the SQLite database file (overrides `db_path` in the config)
    #[arg(long, env = "MAAS_DB_PATH")]
    db: Option<String>,

    /// Path to a YAML configuration file
    #[arg(long, env = "MAAS_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan a proposal, run every agent and print the final report
    Evaluate {
        /// Proposal JSON file
        #[arg(long)]
        proposal: String,
    },

    /// Show which agents would run for a proposal, without running them
    Plan {
        /// Proposal JSON file
        #[arg(long)]
        proposal: String,
    },

    /// Show a workflow's status and per-status task counts
    Status {
        /// Workflow ID
        id: String,
    },

    /// Show the full workflow, including partial results
    Show {
        /// Workflow ID
        id: String,
    },

    /// Show the final recommendation of a finished workflow
    Result {
        /// Workflow ID
        id: String,
    },

    /// List workflows, newest first
    List {
        /// Only workflows in this status (e.g. completed, partially_failed)
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Attach a human annotation to a workflow
    Feedback {
        /// Workflow ID
        id: String,
        /// Free-form annotation
        #[arg(long)]
        note: String,
        /// Agent task the note refers to
        #[arg(long)]
        task: Option<String>,
        /// Rating from 1 to 5
        #[arg(long)]
        rating: Option<u8>,
        #[arg(long)]
        author: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    // Load .env if present (for API keys referenced from the config)
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "maas_core=info,maas_cli=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run(cli).await;
    match result {
        Ok(value) => commands::print_json(&value),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<serde_json::Value, String> {
    let config = commands::load_config(cli.config.as_deref(), cli.db.as_deref())?;
    let manager = commands::init_manager(&config)?;

    match cli.command {
        Commands::Evaluate { proposal } => {
            commands::evaluate::evaluate(&manager, &config, &proposal).await
        }
        Commands::Plan { proposal } => commands::evaluate::plan(&manager, &proposal).await,
        Commands::Status { id } => commands::workflow::status(&manager, &id).await,
        Commands::Show { id } => commands::workflow::show(&manager, &id).await,
        Commands::Result { id } => commands::workflow::result(&manager, &id).await,
        Commands::List {
            status,
            limit,
            offset,
        } => commands::workflow::list(&manager, status.as_deref(), limit, offset).await,
        Commands::Feedback {
            id,
            note,
            task,
            rating,
            author,
        } => {
            commands::feedback::submit(
                &manager,
                &id,
                &note,
                task.as_deref(),
                rating,
                author.as_deref(),
            )
            .await
        }
    }
}
