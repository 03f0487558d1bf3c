//! `lodestar` command-line interface.
//!
//! # Examples
//!
//! ```sh
//! # Run the agent against OpenRouter (reads OPENROUTER_KEY)
//! lodestar run --prompt "Summarize src/lib.rs" --workdir .
//!
//! # Let the agent write files too; writes are checkpointed first
//! lodestar run --prompt "Add a README" --allow-write
//!
//! # Optimize a JSON list of context items offline
//! lodestar optimize --items items.json --strategy selective_pruning --max-tokens 1000
//!
//! # Inspect and prune checkpoints
//! lodestar checkpoints list --session my-session
//! lodestar checkpoints cleanup --session my-session --keep-last 3
//! ```

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use lodestar::agent::{AgentLoop, AgentRequest, LoggingHandler};
use lodestar::api::OpenRouterService;
use lodestar::checkpoint::{CheckpointManager, FileSessionStore, SessionStore};
use lodestar::config::{DEFAULT_CONFIG_FILE, LodestarConfig};
use lodestar::context::{ContextItem, ContextManager, StrategyKind};
use lodestar::tools::{
    Capability, CapabilityPolicy, ParamKind, ParamSchema, Tool, ToolArgs, ToolFuture,
};
use lodestar::{Error, Result};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lodestar", version, about = "Context-optimizing tool-calling agent")]
struct Cli {
    /// Config file (defaults to ./lodestar.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent on one prompt
    Run {
        /// Task for the agent
        #[arg(long)]
        prompt: Option<String>,

        /// Read the task from stdin
        #[arg(long)]
        stdin: bool,

        /// Session id (a new one is generated when absent)
        #[arg(long)]
        session: Option<String>,

        /// Override the configured model
        #[arg(long)]
        model: Option<String>,

        /// Directory the file tools operate in
        #[arg(long, default_value = ".")]
        workdir: PathBuf,

        /// Grant the write capability to file tools
        #[arg(long)]
        allow_write: bool,
    },
    /// Optimize a JSON array of context items and print a report
    Optimize {
        /// JSON file holding an array of context items
        #[arg(long)]
        items: PathBuf,

        #[arg(long)]
        strategy: Option<StrategyKind>,

        #[arg(long)]
        max_tokens: Option<usize>,

        #[arg(long)]
        target_tokens: Option<usize>,

        #[arg(long)]
        min_relevance: Option<f64>,
    },
    /// Manage stored checkpoints
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List a session's checkpoints, newest first
    List {
        #[arg(long)]
        session: String,
    },
    /// Print one checkpoint as JSON
    Show { id: String },
    /// Delete one checkpoint
    Delete { id: String },
    /// Keep only the newest checkpoints of a session
    Cleanup {
        #[arg(long)]
        session: String,
        #[arg(long)]
        keep_last: Option<usize>,
    },
}

// ── File tools ─────────────────────────────────────────────────────

struct ReadFile {
    root: PathBuf,
    params: ParamSchema,
}

impl ReadFile {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            params: ParamSchema::new().required("path", ParamKind::String, "File path relative to the workdir"),
        }
    }
}

impl Tool for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file"
    }

    fn parameters(&self) -> &ParamSchema {
        &self.params
    }

    fn capability(&self) -> Option<Capability> {
        Some(Capability::Read)
    }

    fn resource(&self, args: &ToolArgs) -> String {
        args.str("path").unwrap_or_default().to_string()
    }

    fn execute(&self, args: ToolArgs) -> ToolFuture<'_> {
        Box::pin(async move {
            let path = resolve(&self.root, args.require_str("path")?)?;
            Ok(tokio::fs::read_to_string(path).await?)
        })
    }
}

struct WriteFile {
    root: PathBuf,
    params: ParamSchema,
}

impl WriteFile {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            params: ParamSchema::new()
                .required("path", ParamKind::String, "File path relative to the workdir")
                .required("content", ParamKind::String, "Full new file content"),
        }
    }
}

impl Tool for WriteFile {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a text file"
    }

    fn parameters(&self) -> &ParamSchema {
        &self.params
    }

    fn capability(&self) -> Option<Capability> {
        Some(Capability::Write)
    }

    fn resource(&self, args: &ToolArgs) -> String {
        args.str("path").unwrap_or_default().to_string()
    }

    fn is_destructive(&self) -> bool {
        true
    }

    fn execute(&self, args: ToolArgs) -> ToolFuture<'_> {
        Box::pin(async move {
            let path = resolve(&self.root, args.require_str("path")?)?;
            let content = args.require_str("content")?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, content).await?;
            Ok(format!("wrote {} bytes to {}", content.len(), path.display()))
        })
    }
}

/// Join `relative` onto `root`, refusing absolute paths and `..`.
fn resolve(root: &Path, relative: &str) -> Result<PathBuf> {
    let rel = Path::new(relative);
    if rel.is_absolute() || rel.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        return Err(Error::invalid_arguments(format!(
            "path '{relative}' must stay inside the workdir"
        )));
    }
    Ok(root.join(rel))
}

// ── Commands ───────────────────────────────────────────────────────

fn load_config(path: Option<&Path>) -> Result<LodestarConfig> {
    let default = Path::new(DEFAULT_CONFIG_FILE);
    let path = path.or_else(|| default.exists().then_some(default));
    LodestarConfig::load(path)
}

async fn run(
    config: &LodestarConfig,
    prompt: Option<String>,
    stdin: bool,
    session: Option<String>,
    model: Option<String>,
    workdir: PathBuf,
    allow_write: bool,
) -> Result<()> {
    let prompt = match (prompt, stdin) {
        (Some(p), _) => p,
        (None, true) => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf)?;
            buf
        }
        (None, false) => return Err(Error::invalid_arguments("provide --prompt or --stdin")),
    };
    if prompt.trim().is_empty() {
        return Err(Error::invalid_arguments("prompt is empty"));
    }

    let mut agent_config = config.agent_config();
    if let Some(model) = model {
        agent_config.model = model;
    }

    let service = Arc::new(OpenRouterService::from_env()?);
    let store: Arc<dyn SessionStore> = Arc::new(FileSessionStore::open(&config.checkpoints.dir).await?);
    let checkpoints = Arc::new(
        CheckpointManager::new(store.clone()).with_keep_last(config.checkpoints.keep_last),
    );
    let context = Arc::new(ContextManager::new(config.context.clone()));
    let tools = Arc::new(
        config
            .tool_registry()
            .with(ReadFile::new(workdir.clone()))
            .with(WriteFile::new(workdir)),
    );
    let policy = if allow_write {
        CapabilityPolicy::read_only().allow(Capability::Write)
    } else {
        CapabilityPolicy::read_only()
    };

    // Restore the working set from the newest checkpoint of a resumed session.
    let session_id = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let history = match store.load_session(&session_id).await? {
        Some(record) => record.messages,
        None => Vec::new(),
    };
    if let Some(latest) = checkpoints.list_checkpoints(&session_id).await?.first() {
        context.restore_snapshot(&session_id, &latest.context).await?;
    }

    let agent = AgentLoop::new(service, tools, context, agent_config)
        .with_event_handler(Arc::new(LoggingHandler))
        .with_permissions(Arc::new(policy))
        .with_checkpoints(checkpoints)
        .with_recovery(Arc::new(config.error_recovery()))
        .with_store(store);

    eprintln!("session: {session_id}");
    match agent
        .run(AgentRequest::new(&session_id, prompt).with_history(history))
        .await
    {
        Ok(response) => {
            println!("{}", response.content);
            Ok(())
        }
        Err(failure) => {
            if !failure.partial.content.is_empty() {
                println!("{}", failure.partial.content);
            }
            Err(failure.into_error())
        }
    }
}

async fn optimize(
    config: &LodestarConfig,
    items_path: &Path,
    strategy: Option<StrategyKind>,
    max_tokens: Option<usize>,
    target_tokens: Option<usize>,
    min_relevance: Option<f64>,
) -> Result<()> {
    let raw = tokio::fs::read_to_string(items_path).await?;
    let items: Vec<ContextItem> = serde_json::from_str(&raw)?;

    let mut opt = config.context.clone().with_auto_optimize(false);
    if let Some(strategy) = strategy {
        opt.strategy = strategy;
    }
    if let Some(max) = max_tokens {
        opt.max_tokens = max;
    }
    if let Some(target) = target_tokens {
        opt.target_tokens = Some(target);
    }
    if let Some(min) = min_relevance {
        opt.min_relevance = min;
    }

    let session = "optimize";
    let manager = ContextManager::new(opt.clone());
    manager.configure_session(session, opt.clone()).await?;
    for item in items {
        manager.add_item(session, item).await?;
    }
    let before = manager.get_metrics(session).await?;
    let after = manager.optimize_context(session).await?;
    let snapshot = manager.create_snapshot(session).await?;

    let report = json!({
        "strategy": opt.strategy,
        "target_tokens": opt.target(),
        "before": before,
        "after": after,
        "items": snapshot.items,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn checkpoints(config: &LodestarConfig, action: CheckpointAction) -> Result<()> {
    let store = Arc::new(FileSessionStore::open(&config.checkpoints.dir).await?);
    let manager = CheckpointManager::new(store).with_keep_last(config.checkpoints.keep_last);
    match action {
        CheckpointAction::List { session } => {
            let list = manager.list_checkpoints(&session).await?;
            if list.is_empty() {
                eprintln!("no checkpoints for session {session}");
            }
            for cp in list {
                println!(
                    "{}  {}  {}  {} items, {} messages",
                    cp.id,
                    cp.created_at.format("%Y-%m-%d %H:%M:%S"),
                    cp.name,
                    cp.context.items.len(),
                    cp.messages.len()
                );
            }
        }
        CheckpointAction::Show { id } => {
            let cp = manager.get_checkpoint(&id).await?;
            println!("{}", serde_json::to_string_pretty(&cp)?);
        }
        CheckpointAction::Delete { id } => {
            manager.delete_checkpoint(&id).await?;
            eprintln!("deleted {id}");
        }
        CheckpointAction::Cleanup { session, keep_last } => {
            let keep = keep_last.unwrap_or(manager.keep_last());
            let outcome = manager.cleanup_old_checkpoints(&session, keep).await?;
            eprintln!(
                "deleted {} checkpoint(s), {} failed",
                outcome.deleted, outcome.failed
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lodestar=info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match load_config(cli.config.as_deref()) {
        Ok(config) => match cli.command {
            Command::Run {
                prompt,
                stdin,
                session,
                model,
                workdir,
                allow_write,
            } => run(&config, prompt, stdin, session, model, workdir, allow_write).await,
            Command::Optimize {
                items,
                strategy,
                max_tokens,
                target_tokens,
                min_relevance,
            } => optimize(&config, &items, strategy, max_tokens, target_tokens, min_relevance).await,
            Command::Checkpoints { action } => checkpoints(&config, action).await,
        },
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        if let Some(hint) = e.user_message() {
            eprintln!("  {hint}");
        }
        process::exit(1);
    }
}
