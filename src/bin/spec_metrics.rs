//! spec-metrics: inspect device backends and exercise the async metrics collector.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;

use spec_decode_metrics::backend::host::HostBackend;
use spec_decode_metrics::backend::{backend_for, DeviceType};
use spec_decode_metrics::cli;
use spec_decode_metrics::sampler::SimulatedSampler;
use spec_decode_metrics::{AsyncMetricsCollector, Clock, ManualClock, SpecDecodeMetrics};

#[derive(Parser)]
#[command(
    name = "spec-metrics",
    about = "Speculative-decoding metrics collection tools"
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Suppress all logging
    #[arg(long, global = true)]
    log_disable: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Report which device backends are available
    Probe {
        /// Output format: text or json
        #[arg(long, default_value = "text", value_parser = validate_output_format)]
        format: String,
    },

    /// Drive a collector against the host backend with a simulated sampler
    Simulate {
        /// Number of decode steps to run
        #[arg(long, default_value_t = 100)]
        steps: usize,

        /// Draft tokens proposed per sequence per step
        #[arg(short = 'k', long, default_value_t = 4)]
        k: usize,

        /// Sequences verified per step
        #[arg(long, default_value_t = 8)]
        batch_size: usize,

        /// Minimum seconds between metric copies (overrides --config)
        #[arg(long)]
        interval: Option<f64>,

        /// Simulated wall-clock duration of one step, in milliseconds
        #[arg(long, default_value_t = 50.0)]
        step_ms: f64,

        /// Probability that each draft token is accepted
        #[arg(long, default_value_t = 0.7)]
        accept_prob: f64,

        /// Seed for the simulated sampler
        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Collector config file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output format: text or json
        #[arg(long, default_value = "text", value_parser = validate_output_format)]
        format: String,
    },
}

fn validate_output_format(s: &str) -> Result<String, String> {
    match s {
        "text" | "json" => Ok(s.to_string()),
        _ => Err(format!("Unknown output format '{}'. Options: text, json", s)),
    }
}

#[derive(Serialize)]
struct ProbeEntry {
    backend: DeviceType,
    available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    devices: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

#[derive(Serialize)]
struct ProbeOutput {
    backends: Vec<ProbeEntry>,
    selected: DeviceType,
}

#[derive(Serialize)]
struct StepReport<'a> {
    step: usize,
    time_s: f64,
    #[serde(flatten)]
    metrics: &'a SpecDecodeMetrics,
}

fn main() {
    let args = Args::parse();
    cli::init_logging(args.log_disable);

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    match args.command {
        Command::Probe { format } => probe(&format),
        Command::Simulate {
            steps,
            k,
            batch_size,
            interval,
            step_ms,
            accept_prob,
            seed,
            config,
            format,
        } => {
            if !step_ms.is_finite() || step_ms < 0.0 {
                return Err(format!("--step-ms must be finite and >= 0, got {}", step_ms).into());
            }
            let config = cli::load_config(config.as_deref(), interval, None)?;

            let clock = Arc::new(ManualClock::new(0.0));
            let backend = Arc::new(HostBackend::new());
            let sampler = Arc::new(SimulatedSampler::new(
                Arc::clone(&backend),
                0,
                accept_prob,
                seed,
            )?);

            let mut collector = AsyncMetricsCollector::with_clock(
                sampler.clone(),
                backend.clone(),
                clock.clone(),
                &config,
            )?;
            collector.initialize(0)?;

            let mut reports = 0usize;
            for step in 0..steps {
                sampler.step(batch_size, k)?;
                clock.advance(step_ms / 1000.0);

                let Some(metrics) = collector.poll(k)? else {
                    continue;
                };
                reports += 1;
                let time_s = clock.now();
                match format.as_str() {
                    "json" => {
                        let report = StepReport {
                            step,
                            time_s,
                            metrics: &metrics,
                        };
                        println!("{}", serde_json::to_string(&report)?);
                    }
                    _ => println!("step {:>5} t={:>8.3}s {}", step, time_s, metrics),
                }
            }

            if format != "json" {
                println!(
                    "{} steps, {} metric reports (interval {}s)",
                    steps, reports, config.collect_interval_s
                );
            }
            Ok(())
        }
    }
}

fn probe(format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let backends: Vec<ProbeEntry> = [DeviceType::Host, DeviceType::Cuda, DeviceType::Npu]
        .into_iter()
        .map(|device_type| match backend_for(device_type) {
            Ok(backend) => match backend.device_count() {
                Ok(devices) => ProbeEntry {
                    backend: device_type,
                    available: true,
                    devices: Some(devices),
                    reason: None,
                },
                Err(e) => ProbeEntry {
                    backend: device_type,
                    available: false,
                    devices: None,
                    reason: Some(e.to_string()),
                },
            },
            Err(e) => ProbeEntry {
                backend: device_type,
                available: false,
                devices: None,
                reason: Some(e.to_string()),
            },
        })
        .collect();

    let selected = cli::backend::resolve_backend(None)?.device_type();

    match format {
        "json" => {
            let output = ProbeOutput { backends, selected };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        _ => {
            for entry in &backends {
                match (entry.devices, &entry.reason) {
                    (Some(devices), _) => {
                        println!("{:<5} available ({} device(s))", entry.backend, devices)
                    }
                    (None, Some(reason)) => {
                        println!("{:<5} unavailable: {}", entry.backend, reason)
                    }
                    (None, None) => println!("{:<5} unavailable", entry.backend),
                }
            }
            println!("selected: {}", selected);
        }
    }
    Ok(())
}
