//! deckflow CLI entry point

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use deckflow::{
    commands::{
        cmd_delete, cmd_init, cmd_list, cmd_list_dead_letters, cmd_record_dead_letter,
        cmd_status, cmd_upload, cmd_watch, cmd_worker, parse_worker_selection,
        print_dead_letters, print_lectures, print_progress,
    },
    config::Config,
    error::Result,
    meta::MetaDb,
    progress::LogWriterFactory,
};
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "deckflow")]
#[command(version, about = "Turn slide decks into explanations and a search index", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, env = "DECKFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON lines (for worker deployments)
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize deckflow configuration and database
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Upload a slide deck and queue it for processing
    Upload {
        /// Path to the document
        path: PathBuf,

        /// Lecture title (defaults to the file name)
        #[arg(short, long)]
        title: Option<String>,
    },

    /// Show lecture progress (all lectures when no ID is given)
    Status {
        /// Lecture ID
        lecture_id: Option<String>,

        /// Keep polling until the lecture completes or fails
        #[arg(short, long, requires = "lecture_id")]
        watch: bool,

        /// Poll interval for --watch in milliseconds
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
    },

    /// Delete a lecture, its rows and its stored files
    Delete {
        /// Lecture ID
        lecture_id: String,
    },

    /// Inspect or record dead-lettered messages
    DeadLetters {
        #[command(subcommand)]
        action: DeadLetterAction,
    },

    /// Run pipeline workers until Ctrl-C
    Worker {
        /// Stage to run: ingestion, image-analysis, explanation, embedding,
        /// summary, dead-letter, a comma-separated list, or all
        #[arg(default_value = "all")]
        stages: String,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum DeadLetterAction {
    /// List persisted dead-letter messages
    List {
        /// Maximum number of records
        #[arg(short, long, default_value = "50")]
        limit: i64,
    },

    /// Record a push envelope read from stdin (always succeeds)
    Record,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let (json_layer, text_layer) = if cli.log_json {
        (Some(fmt::layer().json().with_writer(std::io::stderr)), None)
    } else {
        (None, Some(fmt::layer().with_writer(LogWriterFactory::default())))
    };

    tracing_subscriber::registry()
        .with(json_layer)
        .with(text_layer)
        .with(filter)
        .init();

    // Handle init command specially (doesn't need existing config)
    if let Commands::Init { force } = cli.command {
        return handle_init(cli.config, force).await;
    }

    // Handle completions command (doesn't need config/db)
    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "deckflow", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;
    let db = MetaDb::connect(&config).await?;

    match cli.command {
        Commands::Init { .. } | Commands::Completions { .. } => unreachable!(),

        Commands::Upload { path, title } => {
            let lecture = cmd_upload(&config, &db, &path, title).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&lecture)?);
            } else {
                println!("✓ Uploaded {}", path.display());
                println!("  Lecture: {}", lecture.id);
                println!("  Status: {}", lecture.status);
            }
        }

        Commands::Status {
            lecture_id,
            watch,
            interval_ms,
        } => match lecture_id {
            Some(id) => {
                let progress = if watch {
                    cmd_watch(&db, &id, Duration::from_millis(interval_ms.max(50))).await?
                } else {
                    cmd_status(&db, &id).await?
                };
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&progress)?);
                } else {
                    print_progress(&progress);
                }
            }
            None => {
                let lectures = cmd_list(&db).await?;
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&lectures)?);
                } else {
                    print_lectures(&lectures);
                }
            }
        },

        Commands::Delete { lecture_id } => {
            if cmd_delete(&config, &db, &lecture_id).await? {
                println!("✓ Lecture '{}' deleted", lecture_id);
            } else {
                println!("Lecture '{}' not found", lecture_id);
            }
        }

        Commands::DeadLetters { action } => match action {
            DeadLetterAction::List { limit } => {
                let records = cmd_list_dead_letters(&db, limit).await?;
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&records)?);
                } else {
                    print_dead_letters(&records);
                }
            }
            DeadLetterAction::Record => {
                let mut input = String::new();
                if let Err(e) = std::io::stdin().read_to_string(&mut input) {
                    error!(error = %e, "Could not read envelope from stdin");
                    return Ok(());
                }
                cmd_record_dead_letter(&db, &input).await?;
            }
        },

        Commands::Worker { stages } => {
            let kinds = parse_worker_selection(&stages)?;
            cmd_worker(&config, db, kinds).await?;
        }
    }

    Ok(())
}

async fn handle_init(config: Option<PathBuf>, force: bool) -> Result<()> {
    // A .toml path names the file; anything else names the base directory
    let (base_dir, config_path) = match config {
        Some(path) if path.extension().is_some_and(|e| e == "toml") => {
            let base = path
                .parent()
                .map(PathBuf::from)
                .unwrap_or_else(Config::default_base_dir);
            (base, path)
        }
        Some(dir) => (dir.clone(), dir.join("config.toml")),
        None => {
            let base = Config::default_base_dir();
            (base.clone(), base.join("config.toml"))
        }
    };

    let report = cmd_init(base_dir, config_path, force).await?;

    println!("✓ deckflow initialized successfully");
    println!("  Config: {}", report.config_path);
    println!("  Database: {}", report.db_path);
    println!("  Blob storage: {}", report.storage_root);
    println!("\nNext steps:");
    println!("  1. Point [llm] and [embedding] at your model services");
    println!("  2. Start the workers: deckflow worker all");
    println!("  3. Upload a deck: deckflow upload lecture.pdf");

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    let config_path = path
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_config_path);

    if !config_path.exists() {
        eprintln!(
            "Config file not found: {}\nRun 'deckflow init' first.",
            config_path.display()
        );
        std::process::exit(1);
    }

    Config::load(&config_path)
}
