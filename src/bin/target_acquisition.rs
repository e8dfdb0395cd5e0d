//! Target acquisition runner.
//!
//! Builds the crew from the embedded YAML, runs one session with inputs
//! from the environment and prints the final decision.
//!
//! Environment:
//!   OPENAI_API_KEY, OPENAI_MODEL_NAME, OPENAI_BASE_URL  generation backend
//!   SERPER_API_KEY                                      web search tool
//!   PUSHOVER_USER, PUSHOVER_TOKEN                       push tool
//!   CREW_PROCESS                                        hierarchical | sequential
//!   TA_INDUSTRY, TA_SECTOR, TA_GEOGRAPHY, TA_TIME_HORIZON
//!   RUST_LOG                                            log filter

use std::process::ExitCode;
use std::sync::Arc;

use target_acquisition::crews::target_acquisition::{self as pipeline, TERMINAL_TASK};
use target_acquisition::events::OrchestrationEvent;
use target_acquisition::llms::OpenAICompletion;
use target_acquisition::tools::{BaseTool, PushNotificationTool, SerperDevTool};
use target_acquisition::utilities::printer::{Printer, PrinterColor};
use target_acquisition::{Crew, CrewConfig, Process};

const INPUT_VARS: [(&str, &str); 4] = [
    ("industry", "TA_INDUSTRY"),
    ("sector", "TA_SECTOR"),
    ("geography", "TA_GEOGRAPHY"),
    ("time_horizon", "TA_TIME_HORIZON"),
];

fn tools() -> Vec<Arc<dyn BaseTool>> {
    let mut tools: Vec<Arc<dyn BaseTool>> = Vec::new();
    match SerperDevTool::new() {
        Ok(search) if search.is_configured() => tools.push(Arc::new(search)),
        Ok(_) => tracing::warn!("SERPER_API_KEY not set; search tool disabled"),
        Err(e) => tracing::warn!("search tool unavailable: {}", e),
    }
    match PushNotificationTool::new() {
        Ok(push) if push.is_configured() => tools.push(Arc::new(push)),
        Ok(_) => tracing::warn!("PUSHOVER_USER/PUSHOVER_TOKEN not set; push tool disabled"),
        Err(e) => tracing::warn!("push tool unavailable: {}", e),
    }
    tools
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,target_acquisition=debug".into()),
        )
        .init();

    let printer = Printer::new();

    let mut inputs = pipeline::default_inputs();
    for (key, var) in INPUT_VARS {
        if let Ok(value) = std::env::var(var) {
            if !value.trim().is_empty() {
                inputs.insert(key.to_string(), value);
            }
        }
    }

    let process = match std::env::var("CREW_PROCESS") {
        Ok(value) => match value.parse::<Process>() {
            Ok(process) => process,
            Err(e) => {
                printer.print(&format!("Invalid CREW_PROCESS: {}", e), PrinterColor::BoldRed);
                return ExitCode::from(2);
            }
        },
        Err(_) => Process::Hierarchical,
    };

    let model = std::env::var("OPENAI_MODEL_NAME").ok();
    let llm = match OpenAICompletion::new(model.as_deref(), 120.0) {
        Ok(llm) => llm,
        Err(e) => {
            printer.print(&format!("Failed to create generation backend: {}", e), PrinterColor::BoldRed);
            return ExitCode::from(2);
        }
    };

    let project = match pipeline::project() {
        Ok(project) => project,
        Err(e) => {
            printer.print(&format!("Invalid crew configuration: {}", e), PrinterColor::BoldRed);
            return ExitCode::from(2);
        }
    };

    let config = CrewConfig {
        terminal_task: Some(TERMINAL_TASK.to_string()),
        ..CrewConfig::default()
    };
    let crew = Crew::new(project.agents, project.tasks, pipeline::schema_registry(), Arc::new(llm))
        .with_name("target_acquisition")
        .with_process(process)
        .with_config(config)
        .with_tools(tools());

    let cancellation = crew.cancellation();
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::warn!("interrupt received, cancelling session");
        cancellation.cancel();
    }) {
        tracing::warn!("failed to install Ctrl-C handler: {}", e);
    }

    let mut events = crew.subscribe();
    let progress = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event {
                OrchestrationEvent::TaskDispatched { task, roles, attempt } => {
                    tracing::info!("dispatched {} to {} (attempt {})", task, roles.join(" + "), attempt)
                }
                OrchestrationEvent::TaskSucceeded { task, agent, .. } => {
                    tracing::info!("{} completed by {}", task, agent)
                }
                OrchestrationEvent::TaskFailed { task, reason, .. } => tracing::warn!("{} failed: {}", task, reason),
                OrchestrationEvent::SessionFinished { .. } => break,
                _ => {}
            }
        }
    });

    tracing::info!("starting {} with inputs {:?}", crew, inputs);
    let result = crew.kickoff(&inputs).await;
    if result.is_ok() {
        let _ = progress.await;
    } else {
        progress.abort();
    }

    match result {
        Ok(output) if output.is_completed() => {
            printer.print("\n\n=== FINAL DECISION ===\n\n", PrinterColor::BoldGreen);
            println!("{}", output);
            ExitCode::SUCCESS
        }
        Ok(output) => {
            printer.print("\n\n=== SESSION ABORTED ===\n\n", PrinterColor::BoldRed);
            println!("{}", output);
            ExitCode::FAILURE
        }
        Err(e) => {
            printer.print(&format!("Crew failed: {}", e), PrinterColor::BoldRed);
            ExitCode::FAILURE
        }
    }
}
