//! scopegraph binary — thin CLI shell over the [`scopegraph`] library crate.

use clap::{CommandFactory, Parser, Subcommand};
use scopegraph::config::EngineConfig;
use scopegraph::engine::{Engine, SearchOptions};
use scopegraph::mcp::run_mcp;
use scopegraph::pillars::Pillar;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// Persistent code intelligence engine — adaptive LOD indexing, hybrid
/// search, and budgeted evidence packs over an MCP stdio server.
#[derive(Parser)]
#[command(name = "scopegraph", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Workspace root directory (default: current directory)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Run as MCP stdio server (for agent clients)
    #[arg(long)]
    mcp: bool,

    /// Skip the file watcher and background persistence
    #[arg(long)]
    no_watch: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build or refresh the workspace index
    Index,
    /// One-shot hybrid search, printed as JSON
    Search {
        /// Query text
        query: String,

        /// Max clusters to return
        #[arg(long, default_value_t = 10)]
        limit: usize,

        /// Load callers/callees/type family eagerly
        #[arg(long)]
        expand: bool,
    },
    /// Engine statistics: graph, LOD promotions, indexes
    Stats,
    /// Run one pillar verb with JSON arguments (debugging aid)
    Pillar {
        /// Verb: explore, understand, change, manage, write
        verb: String,

        /// JSON arguments
        #[arg(default_value = "{}")]
        args: String,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn main() {
    let cli = Cli::parse();

    // Logs go to stderr: stdout belongs to the MCP transport.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("scopegraph=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Some(Commands::Completions { shell }) = &cli.command {
        clap_complete::generate(
            *shell,
            &mut Cli::command(),
            "scopegraph",
            &mut std::io::stdout(),
        );
        return;
    }

    let root = cli
        .root
        .clone()
        .unwrap_or_else(|| std::env::current_dir().expect("current directory must exist"));
    let config = EngineConfig::load(&root);
    let engine = match Engine::open(&root, config) {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "failed to open workspace");
            std::process::exit(1);
        }
    };

    if let Err(e) = engine.index_workspace() {
        error!(error = %e, "initial index failed");
        std::process::exit(1);
    }

    match cli.command {
        None => {
            if cli.mcp {
                if !cli.no_watch {
                    engine.start_background();
                }
                run_mcp(Arc::clone(&engine));
            } else {
                // Index happened above; without a subcommand that's the job.
                println!("{}", serde_json::to_string_pretty(&engine.stats()).unwrap());
            }
        }
        Some(Commands::Index) => {
            println!("{}", serde_json::to_string_pretty(&engine.stats()).unwrap());
        }
        Some(Commands::Search { query, limit, expand }) => {
            let options = SearchOptions {
                limit,
                expand_relationships: expand,
                ..SearchOptions::default()
            };
            match engine.search(&query, &options) {
                Ok(response) => {
                    println!("{}", serde_json::to_string_pretty(&response).unwrap());
                }
                Err(e) => {
                    error!(error = %e, "search failed");
                    std::process::exit(1);
                }
            }
        }
        Some(Commands::Stats) => {
            println!("{}", serde_json::to_string_pretty(&engine.stats()).unwrap());
        }
        Some(Commands::Pillar { verb, args }) => {
            let args: serde_json::Value = match serde_json::from_str(&args) {
                Ok(v) => v,
                Err(e) => {
                    error!(error = %e, "arguments must be JSON");
                    std::process::exit(1);
                }
            };
            let response = Pillar::new().handle(&engine, &verb, &args);
            println!("{}", serde_json::to_string_pretty(&response).unwrap());
        }
        Some(Commands::Completions { .. }) => unreachable!("handled above"),
    }

    engine.dispose();
}
