#![doc = include_str!("../README.md")]

mod config;
mod output;
mod telemetry;

use anyhow::Context;
use clap::Parser;
use config::{CliArgs, CliConfig, Request};
use docfetch::{
    RetrievalEngine, RetrieveOptions,
    memory::{ClusterFixture, MemoryCluster},
};
use output::Summary;
use std::{io::BufWriter, path::Path, time::Instant};
use telemetry::init_telemetry;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

// Result sequences block the calling thread, so `main` stays synchronous and
// the engine owns its runtime.
fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = CliConfig::try_from(args)?;

    init_telemetry()?;

    let cluster = load_fixture(&config.fixture)?;
    let engine = RetrievalEngine::new(config.engine.clone(), cluster)?;
    log_startup_info(&config);

    let started = Instant::now();
    let res = run(&engine, &config);
    engine.shutdown_blocking();

    match &res {
        Ok(summary) => tracing::info!(
            command = config.request.name(),
            partitions = summary.partitions,
            yielded = summary.yielded,
            not_found = summary.not_found,
            failed = summary.failed,
            elapsed_ms = started.elapsed().as_millis(),
            "Retrieval finished"
        ),
        Err(e) => tracing::error!("Retrieval failed: {e:#}"),
    }
    res.map(|_| ())
}

fn load_fixture(path: &Path) -> anyhow::Result<MemoryCluster> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read fixture {}", path.display()))?;
    let fixture: ClusterFixture = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse fixture {}", path.display()))?;
    Ok(MemoryCluster::from_fixture(fixture))
}

fn run(engine: &RetrievalEngine<MemoryCluster>, config: &CliConfig) -> anyhow::Result<Summary> {
    let opts = RetrieveOptions {
        parallelism: config.parallelism,
        ..RetrieveOptions::new()
    };
    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    match &config.request {
        Request::Get { keys } => {
            output::drain(&engine.retrieve_documents(keys.clone(), opts), &mut out)
        }
        Request::Subdoc { keys, get, exists } => output::drain(
            &engine.retrieve_subdocs(keys.clone(), get.clone(), exists.clone(), opts),
            &mut out,
        ),
        Request::View(query) => output::drain(&engine.run_view(query.clone(), opts), &mut out),
        Request::Spatial(query) => {
            output::drain(&engine.run_spatial_view(query.clone(), opts), &mut out)
        }
        Request::Query(stmt) => output::drain(&engine.run_query(stmt.clone(), opts), &mut out),
    }
}

fn log_startup_info(config: &CliConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Running `{}` against {} with full config: {:#?}",
            config.request.name(),
            config.fixture.display(),
            config
        );
    } else {
        tracing::info!(
            "Running `{}` against {} on collection `{}` with {} worker threads",
            config.request.name(),
            config.fixture.display(),
            config.engine.default_collection,
            config.engine.worker_threads
        );
    }
}
