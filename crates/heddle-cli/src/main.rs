use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use heddle_core::domain::{
    CommitManifest, EventId, NewTask, ProcessOutcome, TaskFilter, TaskId, TaskStatus, TaskUpdate,
    TaskView, TransitionOptions,
};
use heddle_core::{Orchestrator, OrchestratorBuilder};

#[derive(Debug, Parser)]
#[command(name = "heddle", version, about = "Persistent task orchestration for many workers")]
struct Cli {
    /// SQLite database shared by every worker process.
    #[arg(long, global = true, env = "HEDDLE_DB_PATH", default_value = ".heddle/heddle.db")]
    db: PathBuf,

    /// Print JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the database and apply the schema.
    Init,
    #[command(subcommand)]
    Task(TaskCommand),
    /// Hand ready tasks to workers.
    Dispatch(WorkerArgs),
    /// Requeue running tasks whose lease expired.
    Reclaim,
    /// Lease, queue and task counts.
    Status {
        /// Also print the task board.
        #[arg(long)]
        board: bool,
    },
    #[command(subcommand)]
    Events(EventsCommand),
    #[command(subcommand)]
    Commit(CommitCommand),
    /// Dispatch and reclaim on an interval until Ctrl-C.
    Run {
        #[command(flatten)]
        workers: WorkerArgs,

        #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
        interval_ms: u64,
    },
}

#[derive(Debug, Subcommand)]
enum TaskCommand {
    Create {
        title: String,
        /// Generated when omitted.
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        priority: Option<u8>,
    },
    Get {
        id: String,
    },
    List {
        #[arg(long, conflicts_with = "completed")]
        ready: bool,
        #[arg(long)]
        completed: bool,
    },
    Update {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        priority: Option<u8>,
    },
    /// `id` waits for `on`.
    Block {
        id: String,
        #[arg(long)]
        on: String,
    },
    Unblock {
        id: String,
        #[arg(long)]
        on: String,
    },
    Start {
        id: String,
    },
    Complete {
        id: String,
    },
    /// Rejected by the state machine: done tasks stay done.
    Reopen {
        id: String,
    },
    Delete {
        id: String,
    },
    NextReady,
    Search {
        query: String,
    },
    Progress,
}

#[derive(Debug, Subcommand)]
enum EventsCommand {
    Replay {
        /// Last event id already processed.
        #[arg(long)]
        after: Option<i64>,
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
}

#[derive(Debug, Subcommand)]
enum CommitCommand {
    Enqueue {
        task: String,
        #[arg(long = "path", required = true)]
        paths: Vec<String>,
        #[arg(long, default_value = "")]
        summary: String,
        #[arg(long, requires = "current")]
        base: Option<String>,
        #[arg(long, requires = "base")]
        current: Option<String>,
    },
    Process {
        task: String,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        sha: String,
    },
    Queued,
}

#[derive(Debug, Args)]
struct WorkerArgs {
    #[arg(long = "worker", required = true)]
    workers: Vec<String>,

    /// Defaults to the number of workers.
    #[arg(long)]
    max: Option<usize>,

    #[arg(long)]
    lease_ttl_secs: Option<u64>,
}

impl WorkerArgs {
    fn max_concurrency(&self) -> usize {
        self.max.unwrap_or(self.workers.len())
    }

    fn lease_ttl(&self, orchestrator: &Orchestrator) -> Duration {
        self.lease_ttl_secs
            .map(Duration::from_secs)
            .unwrap_or(orchestrator.config().default_lease_ttl)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_env("HEDDLE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn open(db: &Path) -> anyhow::Result<Orchestrator> {
    if let Some(parent) = db.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    OrchestratorBuilder::new()
        .database(db)
        .build()
        .with_context(|| format!("opening {}", db.display()))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let orchestrator = open(&cli.db)?;
    let out = Output { json: cli.json };

    match cli.command {
        Command::Init => out.line(&serde_json::json!({ "db": cli.db }), || {
            format!("initialized {}", cli.db.display())
        }),
        Command::Task(command) => task(&orchestrator, &out, command),
        Command::Dispatch(args) => {
            let dispatched = orchestrator.dispatch(
                args.workers.as_slice(),
                args.max_concurrency(),
                args.lease_ttl(&orchestrator),
            )?;
            out.line(&dispatched, || {
                dispatched
                    .iter()
                    .map(|d| format!("{} -> {}", d.task.id, d.worker_id))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        Command::Reclaim => {
            let report = orchestrator.reclaim_expired()?;
            out.line(&report, || {
                format!(
                    "expired leases: {}, requeued: {}",
                    report.expired_leases,
                    report.requeued.len()
                )
            })
        }
        Command::Status { board } => {
            let snapshot = orchestrator.board()?;
            out.line(&snapshot, || {
                format!(
                    "tasks: {} running, {} pending\nleases: {} task, {} path, {} locks\ncommits queued: {}\nruns escalated: {}",
                    snapshot.running_tasks,
                    snapshot.pending_tasks,
                    snapshot.task_leases,
                    snapshot.path_leases,
                    snapshot.locks,
                    snapshot.queued_commits,
                    snapshot.escalated_runs
                )
            })?;
            if board {
                let board = orchestrator.task_board()?;
                out.line(&board, || {
                    board
                        .graph
                        .iter()
                        .map(|node| {
                            let deps: Vec<_> = node.blocked_by.iter().map(TaskId::as_str).collect();
                            format!(
                                "{:<8} {} {} (blocked by: {})",
                                node.status.as_str(),
                                node.id,
                                node.title,
                                deps.join(", ")
                            )
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                })?;
            }
            Ok(())
        }
        Command::Events(EventsCommand::Replay { after, limit }) => {
            let events = orchestrator.replay_events(after.map(EventId::new), limit)?;
            out.line(&events, || {
                events
                    .iter()
                    .map(|e| format!("{} {} {} {}", e.id.get(), e.created_at, e.event_type, e.task_id))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        Command::Commit(command) => commit(&orchestrator, &out, command),
        Command::Run {
            workers,
            interval_ms,
        } => run_loop(&orchestrator, &workers, Duration::from_millis(interval_ms)).await,
    }
}

fn task(orchestrator: &Orchestrator, out: &Output, command: TaskCommand) -> anyhow::Result<()> {
    match command {
        TaskCommand::Create {
            title,
            id,
            priority,
        } => {
            let view = match id {
                Some(id) => orchestrator.create_task(NewTask {
                    id: TaskId::new(id),
                    title,
                    priority,
                })?,
                None => orchestrator.create_task_with_generated_id(&title, priority)?,
            };
            out.task(&view)
        }
        TaskCommand::Get { id } => out.task(&orchestrator.get_task(&TaskId::new(id))?),
        TaskCommand::List { ready, completed } => {
            let filter = if ready {
                TaskFilter::Ready
            } else if completed {
                TaskFilter::Completed
            } else {
                TaskFilter::All
            };
            out.tasks(&orchestrator.list_tasks(filter)?)
        }
        TaskCommand::Update {
            id,
            title,
            priority,
        } => {
            let update = TaskUpdate { title, priority };
            if update.is_empty() {
                bail!("pass --title and/or --priority");
            }
            out.task(&orchestrator.update_task(&TaskId::new(id), &update)?)
        }
        TaskCommand::Block { id, on } => {
            out.task(&orchestrator.block(&TaskId::new(id), &TaskId::new(on))?)
        }
        TaskCommand::Unblock { id, on } => {
            out.task(&orchestrator.unblock(&TaskId::new(id), &TaskId::new(on))?)
        }
        TaskCommand::Start { id } => out.task(&orchestrator.transition(
            &TaskId::new(id),
            TaskStatus::Running,
            TransitionOptions::expecting(TaskStatus::Pending),
        )?),
        TaskCommand::Complete { id } => out.task(&orchestrator.transition(
            &TaskId::new(id),
            TaskStatus::Done,
            TransitionOptions::expecting(TaskStatus::Running),
        )?),
        TaskCommand::Reopen { id } => out.task(&orchestrator.transition(
            &TaskId::new(id),
            TaskStatus::Pending,
            TransitionOptions::expecting(TaskStatus::Done),
        )?),
        TaskCommand::Delete { id } => {
            let id = TaskId::new(id);
            orchestrator.delete_task(&id)?;
            out.line(&serde_json::json!({ "deleted": id }), || format!("deleted {id}"))
        }
        TaskCommand::NextReady => match orchestrator.next_ready()? {
            Some(view) => out.task(&view),
            None => out.line(&serde_json::Value::Null, || "no ready task".to_string()),
        },
        TaskCommand::Search { query } => out.tasks(&orchestrator.search_tasks(&query)?),
        TaskCommand::Progress => {
            let progress = orchestrator.progress()?;
            out.line(&progress, || {
                format!(
                    "{}/{} done, {} ready, {} blocked",
                    progress.completed, progress.total, progress.ready, progress.blocked
                )
            })
        }
    }
}

fn commit(orchestrator: &Orchestrator, out: &Output, command: CommitCommand) -> anyhow::Result<()> {
    match command {
        CommitCommand::Enqueue {
            task,
            paths,
            summary,
            base,
            current,
        } => {
            let mut manifest = CommitManifest::new(paths);
            if let (Some(base), Some(current)) = (base, current) {
                manifest = manifest.with_revisions(base, current);
            }
            let entry = orchestrator.enqueue_commit(&TaskId::new(task), &summary, &manifest)?;
            out.line(&entry, || format!("queued {} for {}", entry.id, entry.task_id))
        }
        CommitCommand::Process { task, owner, sha } => {
            let outcome = orchestrator.process_commit(&owner, &sha, &TaskId::new(task))?;
            out.line(&outcome, || match outcome {
                ProcessOutcome::LockContended => "commit lock is held by another owner".to_string(),
                ProcessOutcome::NothingQueued => "nothing queued".to_string(),
                ProcessOutcome::Failed { entry_id } => format!("{entry_id} failed: empty manifest"),
                ProcessOutcome::Committed {
                    entry_id,
                    transaction_id,
                } => format!("{entry_id} committed as {transaction_id}"),
            })
        }
        CommitCommand::Queued => {
            let entries = orchestrator.queued_commits()?;
            out.line(&entries, || {
                entries
                    .iter()
                    .map(|e| format!("{} {} {} [{}]", e.id, e.task_id, e.summary, e.manifest.paths.join(", ")))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
    }
}

/// ポーリング型のワーカーループ：reclaim -> dispatch を一定間隔で繰り返す
async fn run_loop(
    orchestrator: &Orchestrator,
    workers: &WorkerArgs,
    every: Duration,
) -> anyhow::Result<()> {
    let lease_ttl = workers.lease_ttl(orchestrator);
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tracing::info!(workers = workers.workers.len(), ?every, "worker loop started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // Reclaim first so expired rows are seen before a claim purges them.
                let report = orchestrator.reclaim_expired()?;
                for reclaimed in &report.requeued {
                    println!("reclaimed {} from {}", reclaimed.task.id, reclaimed.previous_owner);
                }
                let dispatched = orchestrator.dispatch(
                    workers.workers.as_slice(),
                    workers.max_concurrency(),
                    lease_ttl,
                )?;
                for d in &dispatched {
                    println!("dispatched {} -> {}", d.task.id, d.worker_id);
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for Ctrl-C")?;
                tracing::info!("worker loop stopped");
                return Ok(());
            }
        }
    }
}

struct Output {
    json: bool,
}

impl Output {
    fn line<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            let text = text();
            if !text.is_empty() {
                println!("{text}");
            }
        }
        Ok(())
    }

    fn task(&self, view: &TaskView) -> anyhow::Result<()> {
        self.line(view, || format_task(view))
    }

    fn tasks(&self, views: &[TaskView]) -> anyhow::Result<()> {
        self.line(&views, || {
            views.iter().map(format_task).collect::<Vec<_>>().join("\n")
        })
    }
}

fn format_task(view: &TaskView) -> String {
    let task = &view.task;
    let mut line = format!(
        "{} [{}] p{} {}",
        task.id,
        task.status.as_str(),
        task.priority,
        task.title
    );
    if !view.blocked_by.is_empty() {
        let deps: Vec<_> = view.blocked_by.iter().map(TaskId::as_str).collect();
        line.push_str(&format!(" (blocked by {})", deps.join(", ")));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_worker_flags() {
        let cli = Cli::try_parse_from([
            "heddle", "--db", "x.db", "dispatch", "--worker", "w1", "--worker", "w2", "--max", "1",
        ])
        .unwrap();
        let Command::Dispatch(args) = cli.command else {
            panic!("expected dispatch");
        };
        assert_eq!(args.workers, vec!["w1", "w2"]);
        assert_eq!(args.max_concurrency(), 1);
    }

    #[test]
    fn run_interval_must_be_positive() {
        let zero = Cli::try_parse_from(["heddle", "run", "--worker", "w1", "--interval-ms", "0"]);
        assert!(zero.is_err());

        let cli = Cli::try_parse_from(["heddle", "run", "--worker", "w1", "--interval-ms", "5"])
            .unwrap();
        let Command::Run { interval_ms, .. } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(interval_ms, 5);
    }

    #[test]
    fn revisions_come_in_pairs() {
        let result = Cli::try_parse_from([
            "heddle", "commit", "enqueue", "t1", "--path", "a.rs", "--base", "r1",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn reopen_is_rejected_by_the_state_machine() {
        let orchestrator = OrchestratorBuilder::new().build().unwrap();
        let id = TaskId::from("t1");
        orchestrator.create_task(NewTask::new("t1", "x")).unwrap();
        for next in [TaskStatus::Running, TaskStatus::Done] {
            orchestrator
                .transition(&id, next, TransitionOptions::default())
                .unwrap();
        }
        let out = Output { json: true };
        let err = task(&orchestrator, &out, TaskCommand::Reopen { id: "t1".into() }).unwrap_err();
        assert!(format!("{err:#}").contains("invalid transition"));
    }
}
