use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod config;
mod curriculum;
mod db;
mod engine;
mod error;
mod import;
mod ingress;
mod mastery;
mod models;
mod publish;
mod report;
mod store;
mod streak;
mod struggle;

use config::Config;
use engine::Engine;
use error::EngineError;
use models::{Activity, ActivityType};
use publish::{DaprPublisher, LogPublisher, Publisher};
use store::{MemoryStore, ProgressStore};

#[derive(Parser)]
#[command(name = "learning-progress")]
#[command(about = "Learner mastery tracking and struggle detection", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Replay a short demo history for three learners
    Seed,
    /// Replay activity rows from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Process newline-delimited JSON signals, each tagged with a "kind"
    Stream {
        /// Read from this file instead of stdin
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Record one learning activity
    Record {
        #[arg(long)]
        learner: String,
        #[arg(long)]
        module: Option<String>,
        /// exercise_completed, quiz_taken or code_executed
        #[arg(long)]
        activity: String,
        #[arg(long)]
        score: Option<f64>,
        /// Code quality score for code_executed activity
        #[arg(long)]
        quality: Option<f64>,
    },
    /// Submit a code execution result
    CodeEvent {
        #[arg(long)]
        learner: String,
        #[arg(long)]
        status: String,
        #[arg(long)]
        module: Option<String>,
        #[arg(long)]
        error_type: Option<String>,
    },
    /// Submit the error type found by an error analysis
    DebugEvent {
        #[arg(long)]
        learner: String,
        #[arg(long)]
        error_type: String,
    },
    /// Submit a free-text question
    Ask {
        #[arg(long)]
        learner: String,
        #[arg(long)]
        question: String,
    },
    /// List curriculum modules
    Curriculum,
    /// Show per-module mastery for a learner, or list known learners
    Progress {
        #[arg(long)]
        learner: Option<String>,
    },
    /// List open struggle alerts
    Struggles {
        #[arg(long)]
        learner: Option<String>,
    },
    /// Generate a markdown progress report
    Report {
        #[arg(long)]
        learner: String,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

async fn connect_store(config: &Config) -> anyhow::Result<Arc<dyn ProgressStore>> {
    let Some(database_url) = config.database_url.as_deref() else {
        warn!("DATABASE_URL not set, progress is kept in memory for this run only");
        return Ok(Arc::new(MemoryStore::new()));
    };

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(Arc::new(db::PgStore::new(pool)))
}

fn build_publisher(config: &Config) -> anyhow::Result<Arc<dyn Publisher>> {
    if !config.publish_enabled {
        return Ok(Arc::new(LogPublisher));
    }
    let publisher = DaprPublisher::new(&config.dapr_base_url(), &config.pubsub_name)
        .context("failed to build pubsub client")?;
    Ok(Arc::new(publisher))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env()?;

    if let Commands::InitDb = cli.command {
        let database_url = config
            .database_url
            .as_deref()
            .context("DATABASE_URL must be set to a production Postgres instance")?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(database_url)
            .await
            .context("failed to connect to Postgres")?;
        db::init_db(&pool).await?;
        println!("Schema ready.");
        return Ok(());
    }

    if let Commands::Curriculum = cli.command {
        for module in curriculum::list_modules() {
            println!(
                "{}. {} {} ({} exercises): {}",
                module.order,
                module.id,
                module.name,
                module.exercises_count,
                module.topics.join(", ")
            );
            println!("   {}", module.description);
        }
        return Ok(());
    }

    let store = connect_store(&config).await?;
    let engine = Engine::new(store, build_publisher(&config)?);
    execute(cli.command, &engine).await
}

/// Runs one command, then waits for in-flight notifications whether or not
/// the command succeeded.
async fn execute(command: Commands, engine: &Engine) -> anyhow::Result<()> {
    let result = run(command, engine).await;
    engine.publisher().flush().await;
    result
}

/// Feeds newline-delimited signals to the engine. Returns the processed and
/// rejected counts; a read or store failure stops the stream.
async fn process_stream<R: AsyncBufRead + Unpin>(
    engine: &Engine,
    reader: R,
) -> anyhow::Result<(usize, usize)> {
    let (mut processed, mut rejected) = (0usize, 0usize);
    let mut lines = reader.lines();
    let mut number = 0usize;
    while let Some(line) = lines
        .next_line()
        .await
        .context("failed to read signal stream")?
    {
        number += 1;
        if line.trim().is_empty() {
            continue;
        }
        let entry: serde_json::Value = match serde_json::from_str(&line) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(line = number, error = %err, "skipping malformed signal");
                rejected += 1;
                continue;
            }
        };
        match ingress::route_entry(engine, &entry).await {
            Ok(outcome) => {
                print_outcome(&outcome);
                processed += 1;
            }
            Err(err @ (EngineError::ModuleNotFound(_) | EngineError::InvalidInput(_))) => {
                warn!(line = number, error = %err, "rejected signal");
                rejected += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok((processed, rejected))
}

async fn run(command: Commands, engine: &Engine) -> anyhow::Result<()> {
    match command {
        Commands::InitDb | Commands::Curriculum => unreachable!("handled in main"),
        Commands::Seed => {
            let recorded = import::seed(engine).await?;
            println!("Seed data recorded ({recorded} activities).");
        }
        Commands::Import { csv } => {
            let recorded = import::import_csv(engine, &csv).await?;
            println!("Recorded {recorded} activities from {}.", csv.display());
        }
        Commands::Stream { input } => {
            let (processed, rejected) = match &input {
                Some(path) => {
                    let file = tokio::fs::File::open(path)
                        .await
                        .with_context(|| format!("failed to open {}", path.display()))?;
                    process_stream(engine, BufReader::new(file)).await?
                }
                None => process_stream(engine, BufReader::new(tokio::io::stdin())).await?,
            };
            println!("Processed {processed} signals ({rejected} rejected).");
        }
        Commands::Record {
            learner,
            module,
            activity,
            score,
            quality,
        } => {
            let activity_type: ActivityType = activity.parse()?;
            let details = match quality {
                Some(quality) => serde_json::json!({ "quality_score": quality }),
                None => serde_json::json!({}),
            };
            let activity = Activity {
                learner_id: learner,
                module_id: module.unwrap_or_else(|| curriculum::first_module().id.to_string()),
                activity_type,
                score: score.unwrap_or(0.0),
                details,
            };
            let update = engine.record_activity(&activity).await?;
            println!(
                "Recorded {} for {} in {}: mastery {:.1} ({})",
                activity.activity_type,
                activity.learner_id,
                activity.module_id,
                update.mastery,
                update.mastery_level
            );
        }
        Commands::CodeEvent {
            learner,
            status,
            module,
            error_type,
        } => {
            let payload = serde_json::json!({
                "user_id": learner,
                "status": status,
                "module_id": module,
            });
            let outcome = ingress::handle_code_event(engine, &payload).await?;
            print_outcome(&outcome);
            if let Some(error_type) = error_type {
                let payload = serde_json::json!({ "user_id": learner, "error_type": error_type });
                print_outcome(&ingress::handle_debug_event(engine, &payload).await?);
            }
        }
        Commands::DebugEvent {
            learner,
            error_type,
        } => {
            let payload = serde_json::json!({ "user_id": learner, "error_type": error_type });
            print_outcome(&ingress::handle_debug_event(engine, &payload).await?);
        }
        Commands::Ask { learner, question } => {
            let payload = serde_json::json!({ "user_id": learner, "question": question });
            print_outcome(&ingress::handle_question(engine, &payload).await?);
        }
        Commands::Progress { learner: None } => {
            let learners = engine.learner_ids().await?;
            if learners.is_empty() {
                println!("No learners recorded.");
            }
            for learner in learners.iter() {
                println!("- {learner}");
            }
        }
        Commands::Progress {
            learner: Some(learner),
        } => {
            let progress = engine.progress(&learner).await?;
            println!(
                "{}: streak {}, {} exercises, {} quizzes",
                progress.learner_id,
                progress.streak,
                progress.total_exercises,
                progress.total_quizzes
            );
            for module in curriculum::list_modules() {
                if let Some(record) = progress.modules.get(module.id) {
                    println!(
                        "- {} {}: mastery {:.1} ({})",
                        record.module_id, record.module_name, record.mastery, record.mastery_level
                    );
                }
            }
        }
        Commands::Struggles { learner } => {
            let alerts = engine.open_alerts(learner.as_deref()).await?;
            if alerts.is_empty() {
                println!("No open struggle alerts.");
                return Ok(());
            }
            for alert in alerts.iter() {
                println!(
                    "- {} {} ({}) at {}: {}",
                    alert.learner_id,
                    alert.struggle_type,
                    alert.module_id.as_deref().unwrap_or("no module"),
                    alert.created_at.format("%Y-%m-%d %H:%M"),
                    alert.details
                );
            }
        }
        Commands::Report { learner, out } => {
            let progress = engine.progress(&learner).await?;
            let alerts = engine.open_alerts(Some(&learner)).await?;
            let report = report::build_report(&progress, &alerts);
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
    }
    Ok(())
}

fn print_outcome(outcome: &ingress::Outcome) {
    match outcome {
        ingress::Outcome::Processed { update, alert } => {
            if let Some(update) = update {
                println!("Mastery {:.1} ({})", update.mastery, update.mastery_level);
            }
            match alert {
                Some(alert) => println!("Struggle detected: {} {}", alert.struggle_type, alert.details),
                None => println!("Processed."),
            }
        }
        ingress::Outcome::Ignored(reason) => println!("Ignored: {reason}"),
    }
}
