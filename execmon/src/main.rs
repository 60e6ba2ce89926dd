use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use aya::include_bytes_aligned;
use clap::{Parser, Subcommand};
use execmon::{
    ExecMonitor, probe_entry_points,
    selftest::{self, SelftestConfig},
    settings::Settings,
    telemetry,
};

#[derive(Debug, Parser)]
#[command(version, about = "Reports process executions as they happen")]
struct Opt {
    /// Verbose output
    #[clap(short, long)]
    verbose: bool,

    /// YAML settings file; EXECMON_* environment variables override it
    #[clap(short, long, env = "EXECMON_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Attach to the kernel and print exec events until interrupted (default)
    Run,
    /// Show each candidate entry point and whether this kernel has it
    EntryPoints,
    /// Run the pipeline in-process under synthetic concurrent load
    Selftest {
        #[arg(long, default_value_t = 4)]
        producers: usize,
        #[arg(long, default_value_t = 10_000)]
        events: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if opt.verbose { "info" } else { "warn" }),
    )
    .init();

    let settings = Settings::load(opt.config.as_deref()).context("Failed to load settings")?;

    match opt.command.unwrap_or(Command::Run) {
        Command::Run => {
            telemetry::init_metrics(settings.otel_exporter_otlp_endpoint.as_deref())?;
            // build.rs compiles execmon-ebpf and leaves the object in OUT_DIR.
            let result = ExecMonitor::new(settings)
                .run(include_bytes_aligned!(concat!(env!("OUT_DIR"), "/execmon")))
                .await;
            telemetry::shutdown_metrics();
            result
        }
        Command::EntryPoints => {
            for (entry, present) in probe_entry_points(&settings)? {
                let status = if present { "available" } else { "missing" };
                println!("{entry}\t{status}");
            }
            Ok(())
        }
        Command::Selftest { producers, events } => {
            let config = SelftestConfig {
                producers,
                events_per_producer: events,
                slots: settings.local_slots(),
                poll_timeout: settings.poll_timeout(),
            };
            let report = tokio::task::spawn_blocking(move || selftest::run(&config)).await??;
            println!(
                "attempted {} emitted {} dropped {} delivered {} (worst producer latency {:?})",
                report.attempted,
                report.emitted,
                report.dropped,
                report.delivered,
                report.worst_producer_latency
            );
            if !report.lossless() {
                bail!("selftest lost events: {report:?}");
            }
            Ok(())
        }
    }
}
