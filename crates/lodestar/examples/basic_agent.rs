//! Minimal agent example.
//!
//! Seeds the session's working memory with a couple of context items, sends
//! a prompt, and prints the response along with token usage and cost.
//!
//! # Usage
//!
//! ```bash
//! OPENROUTER_KEY=sk-... cargo run --example basic_agent
//! ```

use std::sync::Arc;

use lodestar::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Create the completion backend.
    let service = Arc::new(OpenRouterService::from_env()?);

    // 2. Working memory with a 20k token budget, pruned by relevance.
    let context = Arc::new(ContextManager::new(
        OptimizationConfig::with_max_tokens(20_000).with_strategy(StrategyKind::SelectivePruning),
    ));
    context
        .add_text(
            "demo",
            ItemType::Architecture,
            "The project is a Rust workspace with one library crate and one binary.",
            1.0,
        )
        .await?;
    context
        .add_text("demo", ItemType::Plan, "1. Read Cargo.toml 2. Summarize", 0.7)
        .await?;

    // 3. Configure the loop.
    let config = AgentConfig::new("anthropic/claude-sonnet-4")
        .with_system_prompt("You are a helpful coding assistant. Be concise.")
        .with_max_iterations(10);

    // 4. Run it.
    let agent = AgentLoop::new(service, Arc::new(ToolRegistry::new()), context.clone(), config)
        .with_event_handler(Arc::new(LoggingHandler));
    let response = agent
        .run(AgentRequest::new("demo", "Summarize what this project does."))
        .await
        .map_err(AgentFailure::into_error)?;

    // 5. Print results.
    let metrics = context.get_metrics("demo").await?;
    println!("\n{}", response.content);
    println!(
        "\n--- {} iterations | {} tokens | ${:.4} | context {:.0}% ---",
        response.iterations,
        response.usage.total(),
        response.estimated_cost_usd,
        metrics.utilization() * 100.0
    );

    Ok(())
}
