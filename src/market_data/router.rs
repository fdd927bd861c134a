// Router drives the graph: sources push into connection inboxes, a timer ticks
// the host and every emitted event is forwarded to a channel.
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engine::types::now_ms;
use crate::graph::{GraphError, GraphHost, NodeId, PipelineEvent};
use crate::market_data::adapters::ConnectionSource;

/// Counters for one `run_pipeline` session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterSummary {
    pub ticks: u64,
    pub events_forwarded: u64,
    pub processing_errors: u64,
}

/// Starts every source against its connection node. The returned task ends
/// when all sources are exhausted.
pub fn spawn_sources(
    graph: &Arc<Mutex<GraphHost>>,
    sources: Vec<(NodeId, Arc<dyn ConnectionSource>)>,
) -> Result<JoinHandle<()>, GraphError> {
    let mut runs = Vec::with_capacity(sources.len());
    {
        let host = graph.lock();
        for (node, source) in sources {
            let handle = host.connection_handle(node)?;
            if handle.source_id() != source.source_id() {
                warn!(%node, node_source = handle.source_id(), source = source.source_id(), "Source id differs from node");
            }
            runs.push(async move { source.spawn(handle).await });
        }
    }
    Ok(tokio::spawn(async move {
        let count = runs.len();
        join_all(runs).await;
        debug!(count, "All sources finished");
    }))
}

/// Ticks the graph every `period` until `shutdown` flips to true or the event
/// receiver goes away. On shutdown the graph is shut down and its final events
/// are forwarded too.
pub async fn run_pipeline(
    graph: Arc<Mutex<GraphHost>>,
    period: Duration,
    events: mpsc::Sender<PipelineEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> RouterSummary {
    let mut summary = RouterSummary::default();
    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(period_ms = period.as_millis() as u64, "Pipeline router started");

    loop {
        tokio::select! {
            _ = timer.tick() => {
                // lock only for the synchronous pass
                let report = graph.lock().tick(now_ms());
                summary.ticks += 1;
                summary.processing_errors += report.processing_errors.len() as u64;
                for err in &report.processing_errors {
                    debug!(message_id = %err.message_id, error = %err.error, "Processing error");
                }
                for event in report.events {
                    if events.send(event).await.is_err() {
                        warn!("Event receiver dropped, stopping router");
                        return summary;
                    }
                    summary.events_forwarded += 1;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    let final_events = graph.lock().shutdown();
    for event in final_events {
        if events.send(event).await.is_err() {
            break;
        }
        summary.events_forwarded += 1;
    }
    info!(ticks = summary.ticks, events = summary.events_forwarded, "Pipeline router stopped");
    summary
}
