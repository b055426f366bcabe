use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use taskstore_core::db::{self, Database};
use taskstore_core::migrate::{
    catalog, MigrationError, MigrationReport, Migrator, RevisionChain, Target,
};
use taskstore_core::Config;

#[derive(Parser)]
#[command(name = "taskstore")]
#[command(about = "Schema migrations for the task-processing store")]
struct Cli {
    /// Database path or sqlite:// URL (defaults to $DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Seconds to wait for the migration lock and for busy tables
    #[arg(long, global = true)]
    lock_timeout: Option<u64>,

    /// Load revisions from this directory instead of the built-in set
    #[arg(long, global = true)]
    migrations: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the revision recorded in the ledger
    Current,
    /// List the revision chain, base first
    History,
    /// Show the head revision
    Heads,
    /// Ledger, head, pending count and lock holder
    Status,
    /// Recent ledger movements
    Log {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Apply revisions up to TARGET (head, an id, an id prefix, or +N)
    Upgrade {
        #[arg(default_value = "head")]
        target: String,
    },
    /// Revert revisions down to TARGET (base, an id, an id prefix, or -N)
    Downgrade { target: String },
    /// Set the ledger to TARGET without running anything
    Stamp { target: String },
    /// Show the steps a migration to TARGET would run
    Plan { target: String },
    /// Fail unless the ledger is at head and the head schema is intact
    Check,
    /// Scaffold a new revision on top of the current head
    Revision {
        #[arg(short, long)]
        message: String,

        /// Revision directory to write into
        #[arg(long, default_value = "migrations")]
        dir: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "taskstore=info,taskstore_core=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    if let Commands::Revision { message, dir } = &cli.command {
        return author_revision(dir, message, cli.json);
    }

    let chain = load_chain(cli.migrations.as_deref())?;

    let mut config = Config::from_env_with(cli.database_url.as_deref())?;
    if let Some(secs) = cli.lock_timeout {
        config.lock.timeout = Duration::from_secs(secs);
    }
    let mut db = Database::from_config(&config)?;
    let mut migrator = Migrator::new(&mut db, &chain);

    match &cli.command {
        Commands::Current => {
            let current = migrator.current()?;
            if cli.json {
                print_json(&json!({ "current": current }))?;
            } else {
                println!("{}", current.as_deref().unwrap_or("base"));
            }
        }
        Commands::History => {
            let history = migrator.history()?;
            if cli.json {
                print_json(&history)?;
            } else {
                for entry in history.iter().rev() {
                    let mut marks = Vec::new();
                    if entry.is_head {
                        marks.push("head");
                    }
                    if entry.is_current {
                        marks.push("current");
                    }
                    let marks = if marks.is_empty() {
                        String::new()
                    } else {
                        format!(" ({})", marks.join(", "))
                    };
                    println!(
                        "{} -> {}{}, {}",
                        entry.parent.as_deref().unwrap_or("<base>"),
                        entry.id,
                        marks,
                        entry.message
                    );
                }
            }
        }
        Commands::Heads => {
            let heads = migrator.heads();
            if cli.json {
                print_json(&json!({ "heads": heads }))?;
            } else {
                for head in heads {
                    println!("{head} (head)");
                }
            }
        }
        Commands::Status => {
            let status = migrator.status()?;
            if cli.json {
                print_json(&status)?;
            } else {
                println!("current: {}", status.current.as_deref().unwrap_or("base"));
                println!("head:    {}", status.head.as_deref().unwrap_or("base"));
                match status.pending {
                    Some(pending) => println!("pending: {pending}"),
                    None => println!("pending: unknown (ledger revision is not in this build)"),
                }
                if let Some(lock) = &status.lock {
                    println!("locked by {} until {}", lock.holder, lock.expires_at_ms);
                }
            }
        }
        Commands::Log { limit } => {
            let entries = migrator.log(*limit)?;
            if cli.json {
                print_json(&entries)?;
            } else {
                for entry in entries {
                    println!(
                        "{} {:<9} {} -> {}",
                        entry.recorded_at.to_rfc3339(),
                        entry.action.as_str(),
                        entry.from_revision.as_deref().unwrap_or("base"),
                        entry.to_revision.as_deref().unwrap_or("base"),
                    );
                }
            }
        }
        Commands::Upgrade { target } => {
            let result = migrator.upgrade(&Target::parse(target));
            finish(&migrator, result, cli.json)?;
        }
        Commands::Downgrade { target } => {
            let result = migrator.downgrade(&Target::parse(target));
            finish(&migrator, result, cli.json)?;
        }
        Commands::Stamp { target } => {
            let result = migrator.stamp(&Target::parse(target));
            finish(&migrator, result, cli.json)?;
        }
        Commands::Plan { target } => {
            let steps = migrator.plan(&Target::parse(target))?;
            if cli.json {
                print_json(&steps)?;
            } else if steps.is_empty() {
                println!("nothing to do");
            } else {
                for step in steps {
                    println!("{:<9} {}  {}", step.direction.as_str(), step.revision, step.message);
                }
            }
        }
        Commands::Check => {
            let status = migrator.status()?;
            let mut problems = Vec::new();
            if status.current != status.head {
                problems.push(format!(
                    "ledger at {} but head is {}",
                    status.current.as_deref().unwrap_or("base"),
                    status.head.as_deref().unwrap_or("base")
                ));
            } else {
                problems.extend(db::check_head_model(migrator.connection())?);
            }

            if cli.json {
                print_json(&json!({ "ok": problems.is_empty(), "problems": problems }))?;
            } else {
                for problem in &problems {
                    println!("{problem}");
                }
            }
            if !problems.is_empty() {
                anyhow::bail!("schema check failed with {} problem(s)", problems.len());
            }
            if !cli.json {
                println!("ok");
            }
        }
        Commands::Revision { .. } => unreachable!("handled before the database is opened"),
    }

    Ok(())
}

fn load_chain(dir: Option<&Path>) -> anyhow::Result<RevisionChain> {
    let revisions = match dir {
        Some(dir) => catalog::load_dir(dir)
            .with_context(|| format!("loading revisions from {}", dir.display()))?,
        None => catalog::embedded()?,
    };
    Ok(RevisionChain::new(revisions)?)
}

fn author_revision(dir: &Path, message: &str, json: bool) -> anyhow::Result<()> {
    let parent = if dir.exists() {
        let chain = RevisionChain::new(catalog::load_dir(dir)?)?;
        chain.head().map(|rev| rev.id().to_string())
    } else {
        None
    };

    let (id, path) = catalog::author(dir, message, parent.as_deref())?;
    if json {
        print_json(&json!({ "id": id, "parent": parent, "path": path }))?;
    } else {
        println!("Generated {} at {}", id, path.display());
    }
    Ok(())
}

/// Report the outcome of a ledger-moving command. The final ledger value is
/// always printed, failure included.
fn finish(
    migrator: &Migrator<'_>,
    result: Result<MigrationReport, MigrationError>,
    json: bool,
) -> anyhow::Result<()> {
    match result {
        Ok(report) => {
            if json {
                print_json(&report)?;
            } else {
                for step in &report.steps {
                    println!(
                        "{:<9} {}  {} ({} ms)",
                        step.direction.as_str(),
                        step.revision,
                        step.message,
                        step.elapsed_ms
                    );
                }
                println!("ledger at {}", report.to.as_deref().unwrap_or("base"));
            }
            Ok(())
        }
        Err(err) => {
            let ledger = match err.ledger() {
                Some(ledger) => ledger.map(str::to_string),
                None => migrator.current().ok().flatten(),
            };
            tracing::error!(
                error = %err,
                ledger = ledger.as_deref().unwrap_or("base"),
                retryable = err.is_retryable(),
                "migration failed"
            );
            if json {
                print_json(&json!({
                    "error": err.to_string(),
                    "ledger": ledger,
                    "retryable": err.is_retryable(),
                }))?;
            } else {
                println!("ledger at {}", ledger.as_deref().unwrap_or("base"));
            }
            Err(err.into())
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
