//! Node Acquisition Engine - Main Entry Point
//!
//! Runs the acquisition engine headless against the simulated hardware
//! bench and periodically prints the live-value table.
//!
//! # Usage
//!
//! ```bash
//! nodeacq sample-config --format toml > bench.toml
//! nodeacq validate --config bench.toml
//! nodeacq run --config bench.toml --duration-secs 30 --log-dir logs/
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nodeacq_rs::config::{ConfigFormat, EngineConfig};
use nodeacq_rs::engine::{Engine, LiveValue, Registry};
use nodeacq_rs::hardware::{AdcKind, MockHardware, PinMode};
use nodeacq_rs::source::{AdcDevice, SourceSpec};
use nodeacq_rs::store::{FileNodeStore, MemoryNodeStore, NodeStore};
use nodeacq_rs::types::{Node, NodeSpec};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "nodeacq")]
#[command(about = "Node acquisition and scaling engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine until interrupted
    Run {
        /// Engine configuration file (TOML or JSON); the sample bench if omitted
        #[arg(long)]
        config: Option<PathBuf>,

        /// Stop after this many seconds
        #[arg(long)]
        duration_secs: Option<u64>,

        /// How often to print the live-value table
        #[arg(long, default_value = "1000")]
        print_interval_ms: u64,

        /// Also write logs to a daily rolling file in this directory
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },

    /// Check a configuration file without running it
    Validate {
        /// Engine configuration file (TOML or JSON)
        #[arg(long)]
        config: PathBuf,
    },

    /// Print the sample configuration
    SampleConfig {
        /// Output format: toml or json
        #[arg(long, default_value = "toml")]
        format: String,
    },
}

/// Initialize logging; the returned guard flushes the log file on drop
fn init_logging(log_dir: Option<&PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "nodeacq.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,nodeacq_rs=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            duration_secs,
            print_interval_ms,
            log_dir,
        } => {
            let _log_guard = init_logging(log_dir.as_ref());
            let config = match config {
                Some(path) => EngineConfig::load(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => {
                    tracing::info!("No config given, running the sample bench");
                    EngineConfig::sample()
                }
            };
            run(config, duration_secs, Duration::from_millis(print_interval_ms.max(50))).await
        }
        Commands::Validate { config } => {
            let _log_guard = init_logging(None);
            let loaded = EngineConfig::load(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            let (_, summary) = Registry::new()
                .plan(&loaded.nodes, loaded.acquisition.min_interval_ms)
                .context("configuration is invalid")?;
            println!("{}: {} node(s) valid", config.display(), summary.added);
            Ok(())
        }
        Commands::SampleConfig { format } => {
            let format: ConfigFormat = format.parse()?;
            print!("{}", EngineConfig::sample().render(format)?);
            Ok(())
        }
    }
}

async fn run(config: EngineConfig, duration_secs: Option<u64>, print_interval: Duration) -> Result<()> {
    tracing::info!("Starting node acquisition engine");

    let store: Arc<dyn NodeStore> = match config.store_path()? {
        Some(path) => Arc::new(FileNodeStore::open(path)?),
        None => Arc::new(MemoryNodeStore::new()),
    };

    // Converters for stored nodes as well as the ones in the file
    let mut bench_nodes: Vec<NodeSpec> = store.list()?.iter().map(Node::to_spec).collect();
    bench_nodes.extend(config.nodes.iter().cloned());
    let hardware = Arc::new(build_bench(&config, &bench_nodes));

    let (engine, events) = Engine::new(&config.acquisition, hardware.clone(), store);
    let loaded = engine.load_from_store().await?;
    if !config.nodes.is_empty() {
        let summary = engine.apply_config(config.nodes.clone()).await?;
        tracing::info!(
            loaded,
            %summary,
            "Configuration file applied; stored nodes it does not list were removed"
        );
    }

    let registered: Vec<NodeSpec> = engine.list_nodes().iter().map(Node::to_spec).collect();
    let stimulus = tokio::spawn(toggle_input_pins(hardware.clone(), input_pins(&registered)));

    let deadline = async {
        match duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut ticker = tokio::time::interval(print_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            _ = &mut deadline => break,
            _ = ticker.tick() => {
                for msg in events.drain() {
                    tracing::debug!(?msg, "Engine event");
                }
                print_table(&engine.get_live_values());
            }
        }
    }

    stimulus.abort();
    engine.shutdown().await;

    let stats = engine.stats();
    tracing::info!(
        cycles = stats.counters.cycles,
        failed = stats.counters.failed_cycles,
        dropped_events = stats.counters.events_dropped,
        uptime_s = stats.counters.uptime_seconds,
        "Engine stopped"
    );
    Ok(())
}

/// Simulated bench with a converter behind every analog node
fn build_bench(config: &EngineConfig, nodes: &[NodeSpec]) -> MockHardware {
    let hw_config = &config.hardware;
    let bench = MockHardware::new()
        .with_pin_range(hw_config.pin_min..=hw_config.pin_max)
        .with_latency(Duration::from_micros(hw_config.latency_us))
        .with_noise(
            hw_config.noise_volts,
            config.acquisition.simulation_seed.unwrap_or(0x5EED),
        );

    for spec in nodes {
        let Ok(SourceSpec::Analog(analog)) =
            SourceSpec::parse(spec.source_type, &spec.source_config, spec.initial_value)
        else {
            continue;
        };
        match analog.device {
            AdcDevice::Ads1115 { bus, address, .. } => bench.attach_ads1115(bus, address),
            AdcDevice::Mcp3008 {
                bus,
                chip_select,
                vref,
            } => bench.attach_spi_adc(AdcKind::Mcp3008, bus, chip_select, vref),
            AdcDevice::Mcp3208 {
                bus,
                chip_select,
                vref,
            } => bench.attach_spi_adc(AdcKind::Mcp3208, bus, chip_select, vref),
        }
        let key = analog.device.key();
        for channel in 0..usize::from(analog.device.channel_count()) {
            bench.set_channel_voltage(key, channel, hw_config.bench_voltage);
        }
        tracing::debug!(key = %key, device = analog.device.name(), "Attached simulated converter");
    }
    bench
}

fn input_pins(nodes: &[NodeSpec]) -> Vec<u8> {
    nodes
        .iter()
        .filter_map(|spec| {
            match SourceSpec::parse(spec.source_type, &spec.source_config, spec.initial_value) {
                Ok(SourceSpec::DigitalIo {
                    pin,
                    mode: PinMode::Input,
                }) => Some(pin),
                _ => None,
            }
        })
        .collect()
}

/// Flip every simulated input pin once per second
async fn toggle_input_pins(bench: Arc<MockHardware>, pins: Vec<u8>) {
    if pins.is_empty() {
        return;
    }
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut level = false;
    loop {
        ticker.tick().await;
        level = !level;
        for &pin in &pins {
            bench.set_pin_level(pin, level);
        }
    }
}

fn print_table(values: &[LiveValue]) {
    println!(
        "{:<4} {:<20} {:<10} {:>12} {:>10} {:<6} {:>7} {:>9} {:>9} {}",
        "id", "name", "state", "value", "raw", "unit", "ok%", "avg_us", "jitter", "error"
    );
    for v in values {
        let value = v
            .typed_value
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "-".to_string());
        let raw = v
            .raw_value
            .map(|r| format!("{:.4}", r))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<4} {:<20} {:<10} {:>12} {:>10} {:<6} {:>7.1} {:>9.0} {:>9} {}",
            v.id,
            v.display_name,
            v.state.to_string(),
            value,
            raw,
            v.unit,
            v.stats.success_rate(),
            v.stats.avg_read_time_us(),
            v.stats.jitter_us(),
            v.error.as_deref().unwrap_or("")
        );
    }
    println!();
}
