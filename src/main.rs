// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::Result;
use color_eyre::eyre::{Context, bail};
use fastrace::collector::Config;
use fastrace_opentelemetry::OpenTelemetryReporter;
use grinding_attack::fleet::Fleet;
use grinding_attack::{
    AttackRun, DetachedLauncher, HarnessConfig, Launcher, NodeChannel, SshLauncher, TcpChannel,
    logging,
};
use log::info;
use opentelemetry::{InstrumentationScope, KeyValue};
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;

/// Runs a grinding attack against a fleet of consensus nodes.
#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Config file to use.
    #[arg(long, required_unless_present = "write_default_config")]
    config: Option<PathBuf>,
    /// Overrides the number of consensus rounds.
    #[arg(long)]
    rounds: Option<usize>,
    /// Overrides the number of randomly generated blocks before staking.
    #[arg(long)]
    pregenerated_blocks: Option<usize>,
    /// Seed for the harness's randomness.
    #[arg(long)]
    seed: Option<u64>,
    /// Writes an example config to the given file and exits.
    #[arg(long)]
    write_default_config: Option<PathBuf>,
    /// Exports spans to this OTLP endpoint, e.g. `http://127.0.0.1:4317`.
    #[arg(long)]
    otlp_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // enable fancy `color_eyre` error messages
    color_eyre::install()?;

    let args = Args::parse();
    if let Some(path) = args.write_default_config {
        let toml = HarnessConfig::template().to_toml()?;
        std::fs::write(&path, toml)
            .with_context(|| format!("can not write {}", path.display()))?;
        return Ok(());
    }

    // enable `fastrace` tracing
    if let Some(endpoint) = &args.otlp_endpoint {
        let reporter = OpenTelemetryReporter::new(
            SpanExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint.clone())
                .with_protocol(opentelemetry_otlp::Protocol::Grpc)
                .with_timeout(opentelemetry_otlp::OTEL_EXPORTER_OTLP_TIMEOUT_DEFAULT)
                .build()
                .context("can not initialize otlp exporter")?,
            Cow::Owned(
                Resource::builder()
                    .with_attributes([KeyValue::new("service.name", "grinding-attack")])
                    .build(),
            ),
            InstrumentationScope::builder("grinding-attack")
                .with_version(env!("CARGO_PKG_VERSION"))
                .build(),
        );
        fastrace::set_reporter(reporter, Config::default());
        logging::enable_logforth_with_spans();
    } else {
        logging::enable_logforth();
    }

    // load config and apply overrides
    let Some(config_path) = args.config else {
        bail!("config file is required");
    };
    let mut config = HarnessConfig::from_file(&config_path)
        .with_context(|| format!("can not load {}", config_path.display()))?;
    if let Some(rounds) = args.rounds {
        config.attack.consensus_rounds = rounds;
    }
    if let Some(blocks) = args.pregenerated_blocks {
        config.attack.pregenerated_blocks = blocks;
    }
    if args.seed.is_some() {
        config.attack.seed = args.seed;
    }
    config.validate()?;
    info!(
        "attacking with {} nodes for {} rounds",
        config.nodes.len(),
        config.attack.consensus_rounds
    );

    let channel = TcpChannel::new(&config.channel);
    let fleet = Fleet::from_config(&config, channel)?;
    let res = match &config.launch {
        Some(launch) => {
            let launcher = Arc::new(SshLauncher::new(launch.binary.clone()));
            attack(fleet, launcher, &config).await
        }
        None => attack(fleet, Arc::new(DetachedLauncher), &config).await,
    };

    fastrace::flush();
    res
}

async fn attack<C, L>(fleet: Fleet<C>, launcher: Arc<L>, config: &HarnessConfig) -> Result<()>
where
    C: NodeChannel,
    L: Launcher + 'static,
{
    let report = AttackRun::new(fleet, launcher, config.attack.clone())
        .run()
        .await?;
    if report.is_successful() {
        println!("Attack successful! {report}");
    } else {
        println!("Attack unsuccessful! {report}");
    }
    Ok(())
}
