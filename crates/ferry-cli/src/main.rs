//! Ferry command-line interface.
//!
//! Builds migration plans and runs them with simulated step handlers, which
//! is enough to inspect the plan shape, the dispatch order and the progress
//! reporting of the orchestrator.

mod args;
mod error;
mod output;

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ferry_core::{OrchestrationController, PlanBuilder, PlanStatus, Platform, SimulatedHandler};

use args::{Args, Command, PlanArgs, RunArgs};
use output::{create_formatter, Formatter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ferry=info,ferry_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let formatter = create_formatter(args.format);

    match args.command {
        Command::Platforms => {
            println!("{}", formatter.format_platforms(&Platform::ALL));
        }
        Command::Plan(plan) => show_plan(&plan, formatter.as_ref())?,
        Command::Run(run) => {
            let status = run_plan(&run, formatter.as_ref()).await?;
            if status != PlanStatus::Completed {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Build a plan and print it.
fn show_plan(args: &PlanArgs, formatter: &dyn Formatter) -> Result<(), error::CliError> {
    let plan = PlanBuilder::new().build_from_names(
        &args.source,
        &args.destination,
        &args.source_path,
        &args.destination_path,
        &args.option_map()?,
    )?;
    println!("{}", formatter.format_plan(&plan));
    Ok(())
}

/// Build a plan, run it to the end and print its events and final status.
async fn run_plan(args: &RunArgs, formatter: &dyn Formatter) -> Result<PlanStatus, error::CliError> {
    let config = args.to_config()?;
    tracing::info!(
        max_concurrent_steps = config.max_concurrent_steps,
        retry_attempts = config.retry_attempts,
        step_delay_ms = args.step_delay_ms,
        "configuration loaded"
    );

    let controller = Arc::new(OrchestrationController::new(config)?);
    controller.set_default_handler(Arc::new(SimulatedHandler::new(args.step_delay())));

    let plan = controller.create_migration_plan(
        &args.plan.source,
        &args.plan.destination,
        &args.plan.source_path,
        &args.plan.destination_path,
        &args.plan.option_map()?,
    )?;
    println!("{}", formatter.format_plan(&plan));

    let mut events = controller.execute_migration(plan.id)?;

    // Cancel the plan on ctrl+c; the event stream then runs to its end.
    let signal_controller = controller.clone();
    let plan_id = plan.id;
    let signal = tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl+c");
            return;
        }
        tracing::info!(plan_id = %plan_id, "received interrupt, cancelling migration");
        if let Err(e) = signal_controller.cancel_migration(plan_id) {
            tracing::error!(error = %e, "cancel failed");
        }
    });

    while let Some(event) = events.next().await {
        println!("{}", formatter.format_event(&event));
    }
    signal.abort();

    let status = controller.get_migration_status(plan.id)?;
    println!("{}", formatter.format_status(&status));
    if args.metrics {
        println!("{}", controller.metrics().to_prometheus());
    }
    Ok(status.status)
}
