//! `weft serve` - run the weaving runtime on the simulated executor.
//!
//! The real request path arrives through an external ingestion layer;
//! this command exists to validate a deployment end to end (`--smoke`)
//! or to hold a runtime up for inspection while traffic is driven from
//! elsewhere.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use console::style;
use tokio::signal;
use tracing::{info, warn};

use weft_core::config::MuxConfig;
use weft_core::executor::SimulatedStepExecutor;
use weft_core::output::ResponseEvent;
use weft_core::replay::ReplayingExecutor;
use weft_core::request::SamplingParams;
use weft_core::MuxService;

use crate::error::{CliError, Result};

pub async fn run(path: &Path, smoke: Option<usize>, report_interval: u64) -> Result<()> {
    let config = MuxConfig::load(path)?;

    // Simulated backend with graph replay layered underneath, the same
    // stack the integration tests drive.
    let executor = Arc::new(ReplayingExecutor::new(
        SimulatedStepExecutor::new(Duration::from_millis(2)).realtime(),
        Duration::from_millis(1),
    ));
    let service = MuxService::start(config, executor)?;

    match smoke {
        Some(per_model) => {
            let result = run_smoke(&service, per_model).await;
            service.shutdown().await?;
            result
        }
        None => {
            info!("serving; press Ctrl+C to stop");
            let mut report = tokio::time::interval(Duration::from_secs(report_interval.max(1)));
            report.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = signal::ctrl_c() => break,
                    _ = report.tick() => print_metrics(&service),
                }
            }
            info!("shutting down");
            service.shutdown().await?;
            Ok(())
        }
    }
}

async fn run_smoke(service: &MuxService, per_model: usize) -> Result<()> {
    let models: Vec<String> = service.models().cloned().collect();
    let total = models.len() * per_model;
    println!(
        "submitting {} smoke requests across {} models",
        total,
        models.len()
    );

    let mut streams = Vec::new();
    for model in &models {
        for i in 0..per_model {
            let params = SamplingParams {
                seed: i as u64,
                max_tokens: 8,
                ..Default::default()
            };
            match service.submit(model, vec![1, 2, 3, 4], params).await {
                Ok(stream) => streams.push((model.clone(), stream)),
                Err(e) => warn!(model = %model, error = %e, "smoke submission rejected"),
            }
        }
    }

    let mut finished = 0usize;
    let mut failed = 0usize;
    for (model, mut stream) in streams {
        let events = stream.drain().await;
        match events.last() {
            Some(ResponseEvent::Finished { .. }) => finished += 1,
            other => {
                failed += 1;
                warn!(model = %model, outcome = ?other, "smoke request did not finish");
            }
        }
    }

    if failed == 0 && finished == total {
        println!(
            "{} all {} smoke requests completed",
            style("✓").green().bold(),
            total
        );
        print_metrics(service);
        Ok(())
    } else {
        Err(CliError::SmokeFailed {
            failed: total - finished,
            total,
        })
    }
}

fn print_metrics(service: &MuxService) {
    for summary in service.metrics() {
        println!(
            "{} epoch {} (fg wait {:.0}µs)",
            style(format!("device {}", summary.device)).cyan().bold(),
            summary.epoch,
            summary.foreground_wait_us,
        );
        for model in &summary.models {
            println!(
                "  {:<20} steps {:>5}  tokens {:>6}  util {:>5.1}%  lat {:>6.1}ms{}{}",
                model.model,
                model.steps_completed,
                model.tokens_generated,
                model.quota_utilization * 100.0,
                model.avg_request_latency_ms,
                if model.boosted { "  boosted" } else { "" },
                if model.migrations_out + model.migrations_in > 0 {
                    format!(
                        "  mig {}/{}",
                        model.migrations_out, model.migrations_in
                    )
                } else {
                    String::new()
                },
            );
        }
    }
}
