//! stepflow CLI — interactive operator shell
//!
//! Thin presentation/persistence layer over the execution engine: renders
//! state, collects operator commands, and saves the session snapshot after
//! every mutation. All workflow semantics live in the library crates.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use stepflow::definition::WorkflowDefinition;
use stepflow::engine::ExecutionEngine;
use stepflow::persistence;
use stepflow::providers::gemini::GEMINI_MODEL_ID;
use stepflow::providers::{GeminiProvider, SimulatedProvider};
use stepflow::registry::ProviderRegistry;
use stepflow::state::{StateStore, WorkflowState};
use stepflow_sdk::{
    log_error, log_info, log_success, log_warning, ExecutionMode, LogLevel, StepStatus,
    DEFAULT_BATCH_SIZE,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Human-in-the-loop LLM workflow orchestrator", long_about = None)]
struct Args {
    /// Workflow definition YAML (uses the built-in pipeline when omitted)
    #[arg(short, long)]
    workflow: Option<PathBuf>,

    /// Provider to select at startup
    #[arg(short, long)]
    model: Option<String>,

    /// Execution granularity: step, batch, batch:N, all
    #[arg(long)]
    mode: Option<String>,

    /// Session snapshot path (platform data directory when omitted)
    #[arg(long)]
    session: Option<PathBuf>,

    /// Ignore any saved session and start fresh
    #[arg(long)]
    fresh: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let definition = match &args.workflow {
        Some(path) => WorkflowDefinition::from_yaml_file(path)?,
        None => WorkflowDefinition::default_pipeline(),
    };

    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(GeminiProvider::new(
        std::env::var("GEMINI_API_KEY").ok(),
    )));
    registry.register(Arc::new(SimulatedProvider::claude()));
    registry.register(Arc::new(SimulatedProvider::gpt()));
    let registry = Arc::new(registry);

    let default_model = args
        .model
        .clone()
        .unwrap_or_else(|| GEMINI_MODEL_ID.to_string());
    if !registry.contains(&default_model) {
        anyhow::bail!(
            "unknown model `{}` — available: {}",
            default_model,
            available_models(&registry)
        );
    }

    let snapshot_path = args.session.clone().or_else(persistence::default_snapshot_path);

    let state = if args.fresh {
        definition.initial_state(&default_model)
    } else {
        restore_session(&snapshot_path, &definition, &registry)
            .unwrap_or_else(|| definition.initial_state(&default_model))
    };

    let engine = ExecutionEngine::new(StateStore::new(state), registry.clone())
        .with_system_instruction(definition.system_instruction.clone().unwrap_or_default());
    if let Some(model) = &args.model {
        if let Err(err) = engine.select_model(model) {
            anyhow::bail!("{} — available: {}", err, available_models(&registry));
        }
    }
    if let Some(mode) = &args.mode {
        engine.set_mode(parse_mode(mode)?);
    }

    println!("╔════════════════════════════════════════╗");
    println!("║  stepflow — {:<26} ║", truncated(&definition.name, 26));
    println!("╚════════════════════════════════════════╝");
    println!("\nProviders:");
    for meta in registry.metadata_list() {
        let kind = if meta.local { "local" } else { "remote" };
        println!("  {:<18} {:<24} [{}]", meta.id, meta.name, kind);
    }
    print_status(&engine.snapshot());
    println!("\nType 'help' for commands.");

    loop {
        print!("\nstepflow> ");
        std::io::stdout().flush().ok();

        let mut buffer = String::new();
        if std::io::stdin().read_line(&mut buffer)? == 0 {
            break;
        }
        let line = buffer.trim();
        if line.is_empty() {
            continue;
        }
        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((cmd, rest)) => (cmd, rest.trim()),
            None => (line, ""),
        };

        match command.to_lowercase().as_str() {
            "run" | "r" => {
                let state = engine.snapshot();
                if state.is_complete() {
                    log_warning!("Workflow is complete — use 'reset' to start over");
                    continue;
                }
                let index = state.current_step_index;
                log_info!("Dispatching step {}...", index + 1);
                match engine.run_step(index).await {
                    Ok(()) => print_step_detail(&engine.snapshot(), index),
                    Err(err) => log_error!("{}", err),
                }
                persist(&engine, &snapshot_path);
            }
            "approve" | "a" | "continue" => {
                match engine.approve_and_advance() {
                    Ok(()) => {
                        let state = engine.snapshot();
                        if state.is_complete() {
                            log_success!("Workflow complete — all steps approved");
                        } else {
                            log_success!(
                                "Approved. Next up: step {} — {}",
                                state.current_step_index + 1,
                                state.steps[state.current_step_index].title
                            );
                        }
                    }
                    Err(err) => log_error!("{}", err),
                }
                persist(&engine, &snapshot_path);
            }
            "feedback" | "f" => {
                let state = engine.snapshot();
                if state.is_complete() {
                    log_warning!("Workflow is complete — nothing to give feedback on");
                    continue;
                }
                let index = state.current_step_index;
                match engine.set_feedback(index, rest) {
                    Ok(()) => {
                        if rest.trim().is_empty() {
                            log_info!("Feedback cleared for step {}", index + 1);
                        } else {
                            log_info!(
                                "Feedback recorded for step {} — 'run' to re-run with it",
                                index + 1
                            );
                        }
                    }
                    Err(err) => log_error!("{}", err),
                }
                persist(&engine, &snapshot_path);
            }
            "model" | "m" => {
                if rest.is_empty() {
                    log_info!("Selected model: {}", engine.snapshot().selected_model);
                    continue;
                }
                match engine.select_model(rest) {
                    Ok(()) => log_success!("Model set to {}", rest),
                    Err(err) => {
                        log_error!("{} — available: {}", err, available_models(&registry))
                    }
                }
                persist(&engine, &snapshot_path);
            }
            "mode" => {
                if rest.is_empty() {
                    log_info!("Execution mode: {}", engine.snapshot().execution_mode);
                    continue;
                }
                match parse_mode(rest) {
                    Ok(mode) => {
                        engine.set_mode(mode);
                        log_success!("Execution mode set to {}", mode);
                    }
                    Err(err) => log_error!("{}", err),
                }
                persist(&engine, &snapshot_path);
            }
            "auto" => {
                match engine.run_auto().await {
                    Ok(0) => {}
                    Ok(n) => log_info!("Auto-approved {} step(s)", n),
                    Err(err) => log_error!("{}", err),
                }
                print_status(&engine.snapshot());
                persist(&engine, &snapshot_path);
            }
            "reset" => {
                print!("This clears all step progress (history is kept). Type 'yes' to confirm: ");
                std::io::stdout().flush().ok();
                let mut confirm = String::new();
                std::io::stdin().read_line(&mut confirm)?;
                if confirm.trim().eq_ignore_ascii_case("yes") {
                    engine.reset_workflow();
                    log_success!("Workflow reset");
                    persist(&engine, &snapshot_path);
                } else {
                    log_info!("Reset cancelled");
                }
            }
            "status" | "s" => print_status(&engine.snapshot()),
            "show" => {
                let state = engine.snapshot();
                let index = match rest.parse::<usize>() {
                    Ok(n) if n >= 1 && n <= state.steps.len() => n - 1,
                    _ if rest.is_empty() => state.current_step_index.min(state.steps.len() - 1),
                    _ => {
                        log_error!("Usage: show [1..{}]", state.steps.len());
                        continue;
                    }
                };
                print_step_detail(&state, index);
            }
            "logs" | "l" => {
                let limit = rest.parse::<usize>().unwrap_or(20);
                print_logs(&engine.snapshot(), limit);
            }
            "stats" => print_stats(&engine.snapshot()),
            "help" | "h" | "?" => print_help(),
            "quit" | "exit" | "q" => break,
            other => log_error!("Unknown command `{}` — type 'help'", other),
        }
    }

    persist(&engine, &snapshot_path);
    println!("Session saved. Goodbye!");
    Ok(())
}

fn restore_session(
    snapshot_path: &Option<PathBuf>,
    definition: &WorkflowDefinition,
    registry: &ProviderRegistry,
) -> Option<WorkflowState> {
    let path = snapshot_path.as_ref().filter(|p| p.exists())?;
    match persistence::load_snapshot(path)
        .and_then(|snapshot| persistence::restore_state(snapshot, definition, registry))
    {
        Ok(state) => {
            log_info!("Restored session from {}", path.display());
            Some(state)
        }
        Err(err) => {
            log_warning!("Ignoring saved session ({}) — starting fresh", err);
            None
        }
    }
}

/// Best-effort save; failures are reported but never block the workflow.
fn persist(engine: &ExecutionEngine, snapshot_path: &Option<PathBuf>) {
    if let Some(path) = snapshot_path {
        if let Err(err) = persistence::save_snapshot(path, &engine.snapshot()) {
            log_warning!("Failed to save session: {}", err);
        }
    }
}

fn available_models(registry: &ProviderRegistry) -> String {
    registry
        .metadata_list()
        .into_iter()
        .map(|meta| meta.id)
        .collect::<Vec<_>>()
        .join(", ")
}

fn parse_mode(text: &str) -> Result<ExecutionMode> {
    let text = text.trim().to_lowercase();
    match text.as_str() {
        "step" => Ok(ExecutionMode::Step),
        "all" => Ok(ExecutionMode::All),
        "batch" => Ok(ExecutionMode::Batch {
            size: DEFAULT_BATCH_SIZE,
        }),
        other => {
            if let Some(size) = other.strip_prefix("batch:") {
                let size: usize = size
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid batch size `{}`", size))?;
                if size == 0 {
                    anyhow::bail!("batch size must be at least 1");
                }
                Ok(ExecutionMode::Batch { size })
            } else {
                anyhow::bail!("unknown mode `{}` — expected step, batch, batch:N, or all", other)
            }
        }
    }
}

fn status_marker(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Pending => "·",
        StepStatus::Running => "▶",
        StepStatus::Paused => "⏸",
        StepStatus::Completed => "✓",
        StepStatus::Error => "✗",
    }
}

fn print_status(state: &WorkflowState) {
    println!(
        "\nSteps ({} total, model: {}, mode: {}):",
        state.steps.len(),
        state.selected_model,
        state.execution_mode
    );
    for (idx, step) in state.steps.iter().enumerate() {
        let pointer = if idx == state.current_step_index { "→" } else { " " };
        let mut line = format!(
            " {} {} {}. {}",
            pointer,
            status_marker(step.status),
            idx + 1,
            step.title
        );
        if let Some(latency) = step.latency_ms {
            line.push_str(&format!("  ({}ms)", latency));
        }
        println!("{}", line);
        if step.status == StepStatus::Error {
            if let Some(error) = &step.error {
                println!("      error: {}", error);
            }
        }
    }
    if state.is_complete() {
        log_success!("All steps approved");
    }
}

fn print_step_detail(state: &WorkflowState, index: usize) {
    let Some(step) = state.steps.get(index) else {
        return;
    };
    println!(
        "\n─── Step {}: {} [{:?}] ───",
        index + 1,
        step.title,
        step.status
    );
    if let Some(model) = &step.model_used {
        println!("model: {}", model);
    }
    if let Some(feedback) = &step.feedback {
        println!("feedback on file: {}", feedback);
    }
    // A failed step shows its error inline in place of a result; the last
    // good output, if any, stays visible next to it.
    if let Some(error) = &step.error {
        log_error!("{}", error);
        if let Some(result) = &step.result {
            println!("\nlast good output:\n{}", result);
        }
        return;
    }
    match &step.result {
        Some(result) => println!("\n{}", result),
        None => println!("(no output yet — 'run' to execute this step)"),
    }
    if step.status == StepStatus::Paused {
        log_info!("Awaiting review: 'approve' to continue, or 'feedback <text>' then 'run'");
    }
}

fn print_logs(state: &WorkflowState, limit: usize) {
    let start = state.history.len().saturating_sub(limit);
    for entry in &state.history[start..] {
        let stamp = entry.timestamp.format("%H:%M:%S");
        match entry.level {
            LogLevel::Info => println!("\x1b[36m{} ℹ {}\x1b[0m", stamp, entry.message),
            LogLevel::Success => println!("\x1b[32m{} ✓ {}\x1b[0m", stamp, entry.message),
            LogLevel::Warning => println!("\x1b[33m{} ⚠ {}\x1b[0m", stamp, entry.message),
            LogLevel::Error => {
                println!("\x1b[31m{} ✗ {}\x1b[0m", stamp, entry.message);
                if let Some(details) = &entry.details {
                    println!("\x1b[31m           {}\x1b[0m", details);
                }
            }
        }
    }
    if state.history.is_empty() {
        log_info!("No log entries yet");
    }
}

fn print_stats(state: &WorkflowState) {
    let timed: Vec<&stepflow_sdk::Step> = state
        .steps
        .iter()
        .filter(|step| step.latency_ms.is_some())
        .collect();
    if timed.is_empty() {
        log_info!("No latency data yet — run a step first");
        return;
    }
    println!("\nLatency per step:");
    let mut total = 0u64;
    for step in &timed {
        let latency = step.latency_ms.unwrap_or_default();
        total += latency;
        println!(
            "  {:<28} {:>6}ms  ({})",
            truncated(&step.title, 28),
            latency,
            step.model_used.as_deref().unwrap_or("-")
        );
    }
    println!("  average: {}ms over {} run(s)", total / timed.len() as u64, timed.len());
}

fn print_help() {
    println!("Commands:");
    println!("  run            run the current step with the selected model");
    println!("  approve        approve the paused step and advance");
    println!("  feedback <t>   attach feedback to the current step (re-run applies it)");
    println!("  model [id]     show or change the selected provider");
    println!("  mode [m]       show or change granularity: step, batch, batch:N, all");
    println!("  auto           run according to the current mode (batch/all auto-approve)");
    println!("  show [n]       print a step's output (current step when omitted)");
    println!("  status         render the step list");
    println!("  logs [n]       print the last n log entries (default 20)");
    println!("  stats          per-step latency overview");
    println!("  reset          clear all step progress (asks for confirmation)");
    println!("  quit           save the session and exit");
}

fn truncated(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
