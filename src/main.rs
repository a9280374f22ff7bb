//! Steward - durable execution and idempotent patching for content pipelines
//!
//! Thin command-line front end over the library: inspect a run, manage its
//! checkpoints, compute a resume plan, plan and apply patches, and run one
//! iteration of the fix loop.

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use steward::checkpoint::{resume, CheckpointStore};
use steward::events::replay::load_current;
use steward::events::EventLog;
use steward::fixer::{FixOutcome, IssueFixLoop, ValidationReport};
use steward::patch::PatchOutcome;
use steward::{RunContext, RunLayout, Snapshot, StewardConfig, StewardError};

#[derive(Parser)]
#[command(name = "steward")]
#[command(version)]
#[command(about = "Durable, resumable execution and idempotent patching for content pipelines", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Run directory (defaults to current directory)
    #[arg(short = 'd', long, global = true, default_value = ".", env = "STEWARD_RUN_DIR")]
    run_dir: PathBuf,

    /// Configuration file (defaults to <run-dir>/steward.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the current state of the run
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage checkpoints
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Show which workers still have to run
    Resume {
        /// Target workers, in execution order
        #[arg(short, long = "worker", value_name = "NAME", required = true)]
        workers: Vec<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Plan or apply patches from drafts
    Patch {
        #[command(subcommand)]
        action: PatchAction,
    },

    /// Fix one open issue from a validation report
    Fix {
        /// Validation report (JSON); updated in place
        #[arg(short, long)]
        report: PathBuf,

        /// Fix this issue instead of the next one in priority order
        #[arg(short, long)]
        issue: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Create a checkpoint from the current snapshot
    Create,

    /// List all checkpoints
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete all but the most recent checkpoints
    Prune {
        /// Number of checkpoints to keep (defaults to checkpoint.keep_last)
        #[arg(short, long)]
        keep: Option<usize>,
    },
}

#[derive(Subcommand)]
enum PatchAction {
    /// Generate the patch bundle from drafts
    Plan,
    /// Apply the patch bundle to the worktree
    Apply,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    if let Err(e) = run(cli) {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(exit_code(&e));
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose {
        "steward=debug,info"
    } else {
        "steward=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<StewardError>())
        .map_or(1, StewardError::exit_code)
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let run_dir = cli.run_dir.canonicalize().unwrap_or(cli.run_dir.clone());
    if !run_dir.is_dir() {
        return Err(StewardError::missing(run_dir).into());
    }

    let config = match &cli.config {
        Some(path) => StewardConfig::load_file(path)?,
        None => StewardConfig::load(&run_dir)?,
    };
    let ctx = RunContext::new(config.resolve_run_id(&run_dir), &run_dir)
        .with_layout(RunLayout::new(&run_dir).with_worktree(&config.patch.worktree));

    match cli.command {
        Commands::Status { json } => {
            let snapshot = load_current(ctx.layout(), ctx.run_id())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print_status(&snapshot);
            }
        }

        Commands::Checkpoint { action } => {
            let store = CheckpointStore::new(&ctx);
            match action {
                CheckpointAction::Create => {
                    let checkpoint = store.create_checkpoint()?;
                    println!(
                        "{} Created checkpoint {}",
                        "OK".green().bold(),
                        checkpoint.checkpoint_id
                    );
                }
                CheckpointAction::List { json } => {
                    let checkpoints = store.list_checkpoints()?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&checkpoints)?);
                    } else if checkpoints.is_empty() {
                        println!("\n{} No checkpoints found.", "Checkpoints:".cyan().bold());
                    } else {
                        println!(
                            "\n{} {} total",
                            "Checkpoints:".cyan().bold(),
                            checkpoints.len()
                        );
                        println!("{}", "─".repeat(60));
                        for checkpoint in &checkpoints {
                            println!("   {}", checkpoint.summary());
                        }
                    }
                }
                CheckpointAction::Prune { keep } => {
                    let keep = keep.unwrap_or(config.checkpoint.keep_last);
                    let removed = store.cleanup_old_checkpoints(keep)?;
                    println!(
                        "{} Removed {} checkpoints (keeping {})",
                        "OK".green().bold(),
                        removed,
                        keep
                    );
                }
            }
        }

        Commands::Resume { workers, json } => {
            let plan = resume(&ctx, workers.as_slice())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                match &plan.checkpoint_id {
                    Some(id) => println!("{} from checkpoint {}", "Resume:".cyan().bold(), id),
                    None => println!("{} fresh start", "Resume:".cyan().bold()),
                }
                if !plan.completed_workers.is_empty() {
                    println!("   Completed: {}", plan.completed_workers.join(", "));
                }
                if plan.workers_to_rerun.is_empty() {
                    println!("   {} nothing left to run", "OK".green());
                } else {
                    println!("   Pending:   {}", plan.workers_to_rerun.join(", "));
                }
                if plan.events_since_checkpoint > 0 {
                    println!(
                        "   {} events after checkpoint ({} malformed lines skipped)",
                        plan.events_since_checkpoint, plan.skipped_lines
                    );
                }
            }
        }

        Commands::Patch { action } => {
            let mut log = EventLog::open(&ctx)?;
            match action {
                PatchAction::Plan => {
                    let bundle = steward::patch::plan(&ctx, &config.patch, &mut log)?;
                    println!(
                        "{} {} patches planned",
                        "OK".green().bold(),
                        bundle.patches.len()
                    );
                    for patch in &bundle.patches {
                        println!("   {:<24} {}", patch.op.type_name(), patch.path);
                    }
                }
                PatchAction::Apply => {
                    let report = steward::patch::apply(&ctx, &config.patch, &mut log)?;
                    for entry in &report.entries {
                        print_outcome(entry);
                    }
                    println!("{} {}", "Patch:".cyan().bold(), report.summary());
                    report.ensure_clean()?;
                }
            }
        }

        Commands::Fix {
            report: report_path,
            issue,
            json,
        } => {
            let mut report = ValidationReport::load(&report_path)?;
            let mut log = EventLog::open(&ctx)?;
            let fixer = IssueFixLoop::new(&ctx, &config);
            let outcome = fixer.run_once(&mut log, &mut report, issue.as_deref())?;
            if matches!(outcome, FixOutcome::Resolved { .. }) {
                report.save(&report_path)?;
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                print_fix(&outcome, &report_path);
            }
        }
    }

    Ok(())
}

fn print_status(snapshot: &Snapshot) {
    println!("\n{} {}", "Run:".cyan().bold(), snapshot.run_id);
    println!("{}", "─".repeat(60));
    println!("   State:     {}", snapshot.run_state);
    println!("   Events:    {}", snapshot.events_applied);
    if let Some(updated) = snapshot.updated_at {
        println!("   Updated:   {}", updated.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if !snapshot.completed_workers.is_empty() {
        println!("   Completed: {}", snapshot.completed_workers.join(", "));
    }
    println!("   Artifacts: {}", snapshot.artifacts_index.len());
    if !snapshot.open_issues.is_empty() {
        println!();
        println!("   Open issues ({}):", snapshot.open_issues.len());
        for issue in &snapshot.open_issues {
            println!(
                "     - {} [{:?}] {}/{}",
                issue.issue_id, issue.severity, issue.gate, issue.error_code
            );
        }
    }
    if let Some(failure) = &snapshot.failure {
        println!();
        println!(
            "   {} {}: {}",
            "Failed:".red().bold(),
            failure.error_kind,
            failure.message
        );
    }
}

fn print_outcome(outcome: &PatchOutcome) {
    match outcome {
        PatchOutcome::Applied { path, .. } => println!("   {} {}", "applied ".green(), path),
        PatchOutcome::Skipped { path, reason, .. } => {
            println!("   {} {} ({})", "skipped ".dimmed(), path, reason);
        }
        PatchOutcome::Conflict { path, reason, .. } => {
            println!("   {} {} ({})", "conflict".red().bold(), path, reason);
        }
    }
}

fn print_fix(outcome: &FixOutcome, report_path: &Path) {
    match outcome {
        FixOutcome::Resolved {
            issue_id,
            changed_files,
        } => {
            println!(
                "{} Resolved {} ({})",
                "OK".green().bold(),
                issue_id,
                changed_files.join(", ")
            );
            println!("   Report updated: {}", report_path.display());
        }
        FixOutcome::Unfixable { issue_id, reason } => {
            println!("{} {} is unfixable: {}", "Warning:".yellow(), issue_id, reason);
        }
        FixOutcome::NoIssues => println!("{} No open blocking issues", "OK".green().bold()),
    }
}
