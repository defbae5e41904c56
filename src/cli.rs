use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{resolve_settings, Settings};
use crate::execute::PapermillRunner;
use crate::google::GoogleApi;
use crate::load_config::load_manifest;
use crate::scheduler::{Scheduler, TriggerOutcome};
use crate::workflow::{build_workflows, now_execution_time, Services};

/// CLI for notebook-scheduler: run notebooks on a schedule and publish their outputs.
#[derive(Parser)]
#[clap(
    name = "notebook-scheduler",
    version,
    about = "Run notebooks on a schedule and post their outputs to Google Drive and Sheets"
)]
pub struct Cli {
    /// Path to a YAML settings file
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    /// Deployment root holding notebooks/, output/, config/ and credentials/
    #[clap(long, global = true, conflicts_with = "config")]
    pub root: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the registered workflows and their intervals
    List,
    /// Run one workflow immediately
    Run {
        /// Notebook basename (the workflow id)
        notebook: String,
        /// Execution timestamp passed to the notebook; defaults to now
        #[clap(long)]
        execution_time: Option<String>,
    },
    /// Run the scheduler until interrupted
    Serve,
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    let settings = resolve_settings(cli.config.as_deref(), cli.root.as_deref())?;
    let manifest = load_manifest(&settings.manifest_path)?;
    let workflows = build_workflows(&settings, &manifest)?;

    let result = match cli.command {
        Commands::List => {
            for wf in &workflows {
                let stages: Vec<&str> = wf.stages().iter().map(|s| s.id()).collect();
                println!("{}\t{}\t{}", wf.id, wf.interval, stages.join(" -> "));
            }
            Ok(())
        }
        Commands::Run {
            notebook,
            execution_time,
        } => {
            let scheduler = Scheduler::new(services(&settings), settings.output_dir.clone(), workflows);
            let execution_time = execution_time.unwrap_or_else(now_execution_time);
            println!("Run of '{notebook}' starting...");
            match scheduler.trigger(&notebook, &execution_time).await {
                None => Err(anyhow::anyhow!("No workflow named '{notebook}'")),
                Some(TriggerOutcome::Completed(report)) => {
                    println!("Run complete.\nReport:");
                    println!("{:#?}", report);
                    Ok(())
                }
                Some(TriggerOutcome::Failed(e)) => {
                    eprintln!("[ERROR] Run failed: {}", e);
                    Err(anyhow::Error::new(e))
                }
                Some(TriggerOutcome::Skipped) => Err(anyhow::anyhow!("A run of '{notebook}' is already active")),
            }
        }
        Commands::Serve => {
            let scheduler = Scheduler::new(services(&settings), settings.output_dir.clone(), workflows);
            scheduler
                .run_until(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!(error = %e, "Cannot listen for shutdown signal");
                    }
                })
                .await;
            Ok(())
        }
    };

    let exit_span = tracing::info_span!("exit");
    exit_span.in_scope(|| {
        tracing::info!("notebook-scheduler exiting");
    });

    result
}

fn services(settings: &Settings) -> Services {
    let google = GoogleApi::from_settings(settings);
    Services {
        runner: Arc::new(PapermillRunner::new(&settings.runner)),
        sheets: google.sheets,
        drive: google.drive,
    }
}
