use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Local;
use clap::{Args, Parser, Subcommand, ValueEnum};
use reelsmith_core::{
    complete_pairs, discover_channels, init_channel, load_workflow_config, ChannelPaths,
    Orchestrator, QueueReport, SqliteTaskStore, TaskFilter, TaskRecord, TaskStatus, TaskSummary,
    WorkflowConfig,
};
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] reelsmith_core::ConfigError),
    #[error("channel error: {0}")]
    Channel(#[from] reelsmith_core::ChannelError),
    #[error("task store error: {0}")]
    Task(#[from] reelsmith_core::TaskError),
    #[error("orchestrator error: {0}")]
    Watch(#[from] reelsmith_core::WatchError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Reelsmith workflow control interface", long_about = None)]
pub struct Cli {
    /// Path to the workflow configuration
    #[arg(long, default_value = "configs/reelsmith.toml")]
    pub config: PathBuf,
    /// Workflow root override (takes precedence over WORKFLOW_ROOT)
    #[arg(long)]
    pub root: Option<PathBuf>,
    /// Task database override
    #[arg(long)]
    pub task_db: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Watches every channel until Ctrl-C
    Run,
    /// Lists channels under the workflow root
    Channels,
    /// Channel management
    #[command(subcommand)]
    Channel(ChannelCommands),
    /// Inspects the task database
    #[command(subcommand)]
    Tasks(TaskCommands),
    /// Shows complete pairs waiting in a channel's Scripts folder
    Pairs(PairsArgs),
}

#[derive(Subcommand, Debug)]
pub enum ChannelCommands {
    /// Creates a channel from the template
    Init(ChannelInitArgs),
}

#[derive(Args, Debug)]
pub struct ChannelInitArgs {
    pub name: String,
}

#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// Lists recorded tasks, newest first
    List(TaskListArgs),
    /// Counts tasks per status
    Summary,
}

#[derive(Args, Debug)]
pub struct TaskListArgs {
    /// Filter by status (pending, processing, completed, error)
    #[arg(long)]
    pub status: Option<String>,
    /// Filter by channel name
    #[arg(long)]
    pub channel: Option<String>,
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct PairsArgs {
    pub channel: String,
}

pub fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;
    init_tracing(&context.config.logging.level);

    match &cli.command {
        Commands::Run => {
            let report = context.run_until_interrupted()?;
            render(&report, cli.format)?;
        }
        Commands::Channels => {
            let channels = context.channel_list()?;
            render(&channels, cli.format)?;
        }
        Commands::Channel(ChannelCommands::Init(args)) => {
            let created = context.channel_init(&args.name)?;
            render(&created, cli.format)?;
        }
        Commands::Tasks(TaskCommands::List(args)) => {
            let tasks = context.task_list(args)?;
            render(&tasks, cli.format)?;
        }
        Commands::Tasks(TaskCommands::Summary) => {
            let summary = context.task_summary()?;
            render(&summary, cli.format)?;
        }
        Commands::Pairs(args) => {
            let pairs = context.pair_list(&args.channel)?;
            render(&pairs, cli.format)?;
        }
    }

    Ok(())
}

/// RUST_LOG wins over the configured level. Safe to call more than once.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

pub trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
pub struct AppContext {
    config: WorkflowConfig,
}

impl AppContext {
    /// Loads the config file when present; with only `--root` given, every
    /// setting falls back to its default.
    pub fn new(cli: &Cli) -> Result<Self> {
        let mut config = match (&cli.root, cli.config.exists()) {
            (Some(root), false) => WorkflowConfig::with_root("reelsmith", root),
            _ => load_workflow_config(&cli.config)?,
        };
        config.apply_env();
        if let Some(root) = &cli.root {
            config.workflow.root_dir = root.clone();
        }
        if let Some(db) = &cli.task_db {
            config.workflow.task_db = Some(db.clone());
        }
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    fn run_until_interrupted(&self) -> Result<RunReport> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        runtime.block_on(async {
            let orchestrator = Orchestrator::from_config(&self.config)?;
            let started = orchestrator.start_all_channels().await?;
            info!(
                workflow = %self.config.workflow.name,
                channels = started.len(),
                "watching channels; press Ctrl-C to stop"
            );
            tokio::signal::ctrl_c().await?;
            info!("shutdown requested");
            let stopped = orchestrator
                .stop()
                .await
                .into_iter()
                .map(|(name, report)| (name, ChannelStopEntry::from(report)))
                .collect();
            Ok::<_, AppError>(RunReport { started, stopped })
        })
    }

    pub fn channel_list(&self) -> Result<ChannelList> {
        let rows = discover_channels(&self.config.workflow.root_dir)?
            .into_iter()
            .map(|paths| {
                let problem = paths.validate().err().map(|err| err.to_string());
                ChannelEntry {
                    waiting_pairs: complete_pairs(&paths.scripts).len(),
                    valid: problem.is_none(),
                    name: paths.name,
                    problem,
                }
            })
            .collect();
        Ok(ChannelList { rows })
    }

    pub fn channel_init(&self, name: &str) -> Result<ChannelCreated> {
        let paths = init_channel(&self.config.workflow.root_dir, name)?;
        Ok(ChannelCreated {
            name: paths.name,
            path: paths.root,
        })
    }

    pub fn task_list(&self, args: &TaskListArgs) -> Result<TaskList> {
        let store = self.open_store()?;
        let status = args
            .status
            .as_deref()
            .map(str::parse::<TaskStatus>)
            .transpose()?;
        let rows = store.list(&TaskFilter {
            status,
            channel: args.channel.clone(),
            limit: Some(args.limit),
        })?;
        Ok(TaskList { rows })
    }

    pub fn task_summary(&self) -> Result<TaskSummary> {
        Ok(self.open_store()?.summary()?)
    }

    pub fn pair_list(&self, channel: &str) -> Result<PairList> {
        let paths = ChannelPaths::new(&self.config.workflow.root_dir, channel);
        if !paths.scripts.is_dir() {
            return Err(AppError::MissingResource(format!(
                "channel {channel} has no Scripts folder at {}",
                paths.scripts.display()
            )));
        }
        let pairs = complete_pairs(&paths.scripts)
            .into_iter()
            .map(|pair| PairEntry {
                prefix: pair.prefix,
                hook: pair.hook,
                kb: pair.kb,
            })
            .collect();
        Ok(PairList {
            channel: channel.to_string(),
            pairs,
        })
    }

    fn open_store(&self) -> Result<SqliteTaskStore> {
        let path = self.config.task_db_path().ok_or_else(|| {
            AppError::MissingResource("task database not configured".to_string())
        })?;
        if !path.exists() {
            return Err(AppError::MissingResource(format!(
                "task database not found at {}",
                path.display()
            )));
        }
        Ok(SqliteTaskStore::builder()
            .path(&path)
            .create_if_missing(false)
            .build()?)
    }
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub started: Vec<String>,
    pub stopped: BTreeMap<String, ChannelStopEntry>,
}

#[derive(Debug, Serialize)]
pub struct ChannelStopEntry {
    pub processed: usize,
    pub dropped: usize,
    pub abandoned: Vec<String>,
}

impl From<QueueReport> for ChannelStopEntry {
    fn from(report: QueueReport) -> Self {
        Self {
            processed: report.processed,
            dropped: report.dropped,
            abandoned: report.abandoned,
        }
    }
}

impl DisplayFallback for RunReport {
    fn display(&self) -> String {
        let mut lines = vec![format!("Started channels: {}", self.started.len())];
        for (name, entry) in &self.stopped {
            let mut line = format!(
                "  - {name}: processed={} dropped={}",
                entry.processed, entry.dropped
            );
            if !entry.abandoned.is_empty() {
                line.push_str(&format!(" abandoned={}", entry.abandoned.join(",")));
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ChannelList {
    pub rows: Vec<ChannelEntry>,
}

#[derive(Debug, Serialize)]
pub struct ChannelEntry {
    pub name: String,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
    pub waiting_pairs: usize,
}

impl DisplayFallback for ChannelList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No channels found".to_string();
        }
        self.rows
            .iter()
            .map(|entry| match &entry.problem {
                None => format!("{} | ok | waiting={}", entry.name, entry.waiting_pairs),
                Some(problem) => format!("{} | invalid | {}", entry.name, problem),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ChannelCreated {
    pub name: String,
    pub path: PathBuf,
}

impl DisplayFallback for ChannelCreated {
    fn display(&self) -> String {
        format!("Channel {} ready at {}", self.name, self.path.display())
    }
}

#[derive(Debug, Serialize)]
pub struct TaskList {
    pub rows: Vec<TaskRecord>,
}

impl DisplayFallback for TaskList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No tasks recorded".to_string();
        }
        let mut lines = Vec::new();
        for task in &self.rows {
            let elapsed = task
                .elapsed()
                .map(|d| format!("{}s", d.num_seconds()))
                .unwrap_or_else(|| "-".to_string());
            let created = task
                .created_at
                .map(|at| at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            let mut line = format!(
                "#{id} {channel}/{prefix} status={status} created={created} elapsed={elapsed}",
                id = task.id,
                channel = task.channel_name,
                prefix = task.prefix,
                status = task.status,
            );
            if let Some(error) = &task.error_message {
                line.push_str(&format!(" error={error}"));
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

impl DisplayFallback for TaskSummary {
    fn display(&self) -> String {
        let mut lines = vec![format!("Tasks: {}", self.total)];
        for status in [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Error,
        ] {
            lines.push(format!("  - {status}: {}", self.count(status)));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct PairList {
    pub channel: String,
    pub pairs: Vec<PairEntry>,
}

#[derive(Debug, Serialize)]
pub struct PairEntry {
    pub prefix: String,
    pub hook: PathBuf,
    pub kb: PathBuf,
}

impl DisplayFallback for PairList {
    fn display(&self) -> String {
        if self.pairs.is_empty() {
            return format!("{}: no complete pairs waiting", self.channel);
        }
        let mut lines = vec![format!("{}:", self.channel)];
        for pair in &self.pairs {
            lines.push(format!("  - {}", pair.prefix));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use reelsmith_core::{NewTask, TaskPriority};
    use tempfile::TempDir;

    use super::*;

    fn cli_for(root: &TempDir, command: Commands) -> Cli {
        Cli {
            config: root.path().join("missing.toml"),
            root: Some(root.path().join("workflow")),
            task_db: Some(root.path().join("tasks.sqlite")),
            format: OutputFormat::Json,
            command,
        }
    }

    #[test]
    fn parses_nested_subcommands() {
        let cli = Cli::try_parse_from([
            "reelsmithctl",
            "--root",
            "/tmp/wf",
            "tasks",
            "list",
            "--status",
            "error",
            "--limit",
            "5",
        ])
        .unwrap();
        assert_eq!(cli.root, Some(PathBuf::from("/tmp/wf")));
        match cli.command {
            Commands::Tasks(TaskCommands::List(args)) => {
                assert_eq!(args.status.as_deref(), Some("error"));
                assert_eq!(args.limit, 5);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn channel_init_then_list_reports_valid_channel() {
        let temp = TempDir::new().unwrap();
        let cli = cli_for(&temp, Commands::Channels);
        let context = AppContext::new(&cli).unwrap();
        reelsmith_core::ensure_template(&context.config().workflow.root_dir).unwrap();

        let created = context.channel_init("news").unwrap();
        assert!(created.path.join("Scripts").is_dir());

        let listed = context.channel_list().unwrap();
        assert_eq!(listed.rows.len(), 1);
        assert_eq!(listed.rows[0].name, "news");
        assert!(listed.rows[0].valid, "{:?}", listed.rows[0].problem);
    }

    #[test]
    fn pairs_lists_only_complete_pairs() {
        let temp = TempDir::new().unwrap();
        let cli = cli_for(&temp, Commands::Channels);
        let context = AppContext::new(&cli).unwrap();
        let scripts = temp.path().join("workflow/news/Scripts");
        fs::create_dir_all(&scripts).unwrap();
        fs::write(scripts.join("ABC_hook.txt"), "hook").unwrap();
        fs::write(scripts.join("ABC_kb.txt"), "kb").unwrap();
        fs::write(scripts.join("XYZ_hook.txt"), "hook").unwrap();

        let pairs = context.pair_list("news").unwrap();
        let prefixes: Vec<&str> = pairs.pairs.iter().map(|p| p.prefix.as_str()).collect();
        assert_eq!(prefixes, vec!["ABC"]);
        assert!(context.pair_list("missing").is_err());
    }

    #[test]
    fn task_commands_read_the_store() {
        let temp = TempDir::new().unwrap();
        let cli = cli_for(&temp, Commands::Tasks(TaskCommands::Summary));
        let context = AppContext::new(&cli).unwrap();
        assert!(matches!(
            context.task_summary(),
            Err(AppError::MissingResource(_))
        ));

        let store = SqliteTaskStore::new(temp.path().join("tasks.sqlite")).unwrap();
        store.initialize().unwrap();
        let id = store
            .create(&NewTask {
                workflow_name: "reelsmith".into(),
                channel_name: "news".into(),
                prefix: "ABC".into(),
                file_path: temp.path().join("ABC_hook.txt"),
                priority: TaskPriority::Normal,
            })
            .unwrap();
        store.mark_error(id, "Video generation failed: boom").unwrap();

        let summary = context.task_summary().unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.count(TaskStatus::Error), 1);

        let listed = context
            .task_list(&TaskListArgs {
                status: Some("error".into()),
                channel: None,
                limit: 10,
            })
            .unwrap();
        assert_eq!(listed.rows.len(), 1);
        assert!(listed.display().contains("Video generation failed"));

        let bad = context.task_list(&TaskListArgs {
            status: Some("bogus".into()),
            channel: None,
            limit: 10,
        });
        assert!(matches!(bad, Err(AppError::Task(_))));
    }
}
