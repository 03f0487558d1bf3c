//! Custom tools example: define domain tools with `FnTool` and `ParamSchema`.
//!
//! Demonstrates:
//! - Typed argument parsing with `ToolArgs::parse`
//! - Capability requirements and a read-only permission policy
//! - Destructive tools that trigger an automatic checkpoint
//! - Event handling with `CompositeEventHandler`
//!
//! # Usage
//!
//! ```bash
//! OPENROUTER_KEY=sk-... cargo run --example custom_tools
//! ```

use std::sync::Arc;

use lodestar::prelude::*;
use serde::Deserialize;

#[derive(Deserialize)]
struct SaveNoteArgs {
    title: String,
    content: String,
}

/// A read-only tool that "looks up" a word (stub implementation).
fn lookup_word_tool() -> FnTool {
    let params = ParamSchema::new().required("word", ParamKind::String, "The word to look up");
    FnTool::new(
        "lookup_word",
        "Look up the definition of a word",
        params,
        |args| async move {
            let word = args.require_str("word")?;
            Ok(format!("{word}: [stub] this is where the definition would go."))
        },
    )
    .requires(Capability::Read)
}

/// A mutation tool that "saves" a note (stub implementation).
fn save_note_tool() -> FnTool {
    let params = ParamSchema::new()
        .required("title", ParamKind::String, "Title for the note")
        .required("content", ParamKind::String, "Note content (markdown)");
    FnTool::new(
        "save_note",
        "Save a markdown note to the user's notebook",
        params,
        |args| async move {
            let args: SaveNoteArgs = args.parse()?;
            Ok(format!("Saved note '{}' ({} bytes)", args.title, args.content.len()))
        },
    )
    .requires(Capability::Write)
    .destructive()
}

#[tokio::main]
async fn main() -> Result<()> {
    let service = Arc::new(OpenRouterService::from_env()?);
    let tools = Arc::new(
        ToolRegistry::new()
            .with(lookup_word_tool())
            .with(save_note_tool()),
    );
    let context = Arc::new(ContextManager::new(OptimizationConfig::default()));
    let store = Arc::new(InMemorySessionStore::new());
    let checkpoints = Arc::new(CheckpointManager::new(store.clone()));

    let handler = CompositeEventHandler::new()
        .with(LoggingHandler)
        .with(FnEventHandler::new(|event| {
            if let AgentEvent::CheckpointCreated { name, .. } = event {
                eprintln!("  [checkpoint] {name}");
            }
        }));

    // Writes are allowed, so save_note runs after an automatic checkpoint.
    let agent = AgentLoop::new(service, tools, context, AgentConfig::default())
        .with_event_handler(Arc::new(handler))
        .with_permissions(Arc::new(CapabilityPolicy::read_only().allow(Capability::Write)))
        .with_checkpoints(checkpoints.clone());

    let response = agent
        .run(AgentRequest::new(
            "notes",
            "Look up 'ephemeral' and save the definition as a note.",
        ))
        .await
        .map_err(AgentFailure::into_error)?;

    println!("{}", response.content);
    for exec in &response.tool_executions {
        println!("  {} -> {}", exec.name, if exec.success { "ok" } else { "failed" });
    }
    println!(
        "{} checkpoint(s) taken",
        checkpoints.list_checkpoints("notes").await?.len()
    );
    Ok(())
}
