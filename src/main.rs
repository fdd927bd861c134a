use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use mdpipe_rs::engine::types::now_ms;
use mdpipe_rs::market_data::adapters::ConnectionHandle;
use mdpipe_rs::persist::{snapshot, JsonFileStore, TopologyStore};
use mdpipe_rs::{build_from_config, telemetry, GraphHost, MessageCategory, MessageFormat, PipelineConfig, PipelineEvent};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Json,
    Fix,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CategoryArg {
    Trade,
    Orderbook,
}

/// Normalizes raw market-data lines from stdin (`source|payload`) and prints
/// the emitted events as JSON, one per line.
#[derive(Debug, Parser)]
#[command(name = "mdpipe", version)]
struct Cli {
    /// Optional config file (toml, json or yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Source id for lines without a `source|` prefix
    #[arg(long)]
    source: Option<String>,

    #[arg(long, value_enum)]
    format: Option<FormatArg>,

    #[arg(long, value_enum)]
    category: Option<CategoryArg>,

    /// Tracing filter used when RUST_LOG is unset
    #[arg(long)]
    log_filter: Option<String>,

    /// Write the topology as JSON to this directory on exit
    #[arg(long)]
    topology_dir: Option<PathBuf>,

    /// Print the topology JSON to stdout and exit
    #[arg(long)]
    dump_topology: bool,

    #[arg(long, default_value_t = 9000)]
    metrics_port: u16,
}

struct Session {
    host: GraphHost,
    base: PipelineConfig,
    handles: HashMap<String, ConnectionHandle>,
}

impl Session {
    fn new(base: PipelineConfig) -> anyhow::Result<Self> {
        let mut session = Self { host: GraphHost::new(), base, handles: HashMap::new() };
        let source = session.base.source_id.clone();
        session.handle(&source)?;
        Ok(session)
    }

    // one chain per source, built on first sight; chains share the updater
    fn handle(&mut self, source: &str) -> anyhow::Result<ConnectionHandle> {
        if let Some(handle) = self.handles.get(source) {
            return Ok(handle.clone());
        }
        let cfg = PipelineConfig { source_id: source.to_string(), ..self.base.clone() };
        let chain = build_from_config(&mut self.host, &cfg).with_context(|| format!("building chain for {source}"))?;
        let handle = self.host.connection_handle(chain.connection)?;
        info!(source, "Chain added");
        self.handles.insert(source.to_string(), handle.clone());
        Ok(handle)
    }
}

// `source|payload` only when the prefix looks like a source id; FIX tags
// (`8=FIX.4.4|...`) and JSON never do
fn split_source(line: &str) -> Option<(&str, &str)> {
    let (source, payload) = line.split_once('|')?;
    let is_id = !source.is_empty()
        && source.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    is_id.then_some((source, payload))
}

fn print_events(out: &mut impl Write, events: &[PipelineEvent]) -> anyhow::Result<()> {
    for event in events {
        serde_json::to_writer(&mut *out, event)?;
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut cfg = PipelineConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(source) = &cli.source {
        cfg.source_id = source.clone();
    }
    if let Some(format) = cli.format {
        cfg.format = match format {
            FormatArg::Json => MessageFormat::Json,
            FormatArg::Fix => MessageFormat::Fix,
        };
    }
    if let Some(category) = cli.category {
        cfg.category = match category {
            CategoryArg::Trade => MessageCategory::Trade,
            CategoryArg::Orderbook => MessageCategory::Orderbook,
        };
    }
    if let Some(filter) = &cli.log_filter {
        cfg.log_filter = filter.clone();
    }

    telemetry::init_tracing(&cfg.log_filter);
    telemetry::init_metrics(cli.metrics_port)?;

    let mut session = Session::new(cfg)?;
    let stdout = std::io::stdout();

    if cli.dump_topology {
        let snap = snapshot::capture(&session.host);
        serde_json::to_writer_pretty(stdout.lock(), &snap)?;
        println!();
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_count = 0u64;
    let mut event_count = 0usize;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        line_count += 1;
        let (source, payload) = match split_source(line) {
            Some((source, payload)) => (source.to_string(), payload),
            None => (session.base.source_id.clone(), line),
        };
        let handle = session.handle(&source)?;
        let now = now_ms();
        handle.push(payload, now);

        let report = session.host.tick(now);
        for err in &report.processing_errors {
            warn!(message_id = %err.message_id, error = %err.error, "Processing error");
        }
        event_count += report.events.len();
        print_events(&mut stdout.lock(), &report.events)?;
    }

    let final_events = session.host.shutdown();
    event_count += final_events.len();
    print_events(&mut stdout.lock(), &final_events)?;

    if let Some(dir) = cli.topology_dir {
        let mut store = JsonFileStore::new(dir);
        store.save_topology("mdpipe", &snapshot::capture(&session.host)).await?;
    }
    info!(lines = line_count, events = event_count, chains = session.handles.len(), "Input exhausted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_prefix_framing() {
        assert_eq!(split_source(r#"venue-a|{"id":"T1"}"#), Some(("venue-a", r#"{"id":"T1"}"#)));
        assert_eq!(split_source("8=FIX.4.4|35=AE|55=BTC/USD"), None);
        assert_eq!(split_source("venue-b|8=FIX.4.4|35=AE"), Some(("venue-b", "8=FIX.4.4|35=AE")));
        assert_eq!(split_source(r#"{"memo":"a|b"}"#), None);
        assert_eq!(split_source("|payload"), None);
    }

    #[test]
    fn test_new_sources_share_one_updater() {
        let mut session = Session::new(PipelineConfig::default()).unwrap();
        session.handle("venue-a").unwrap();
        session.handle("venue-a").unwrap();
        let updaters = session.host.nodes().filter(|n| n.kind() == mdpipe_rs::graph::NodeKind::Updater).count();
        assert_eq!(session.handles.len(), 2);
        assert_eq!(updaters, 1);
        assert!(session.host.validate().is_empty());
    }
}
