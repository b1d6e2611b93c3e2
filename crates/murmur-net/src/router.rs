//! Topic router: one consume loop per session that parses every inbound
//! record and hands it to a single handler, strictly in delivery order.
//!
//! The loop runs in its own tokio task. A record is handled to completion
//! before the next one is read, so handlers see the same order the broker
//! delivered. Nothing a record contains can stop the loop; it only ends
//! when the consumer channel closes or the router is stopped.

use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use murmur_shared::Topic;

use crate::error::Result;
use crate::session::BrokerSession;
use crate::transport::BrokerRecord;

/// Receives every parsed record of a subscription.
pub trait RecordHandler: Send + 'static {
    /// Handle one record. Errors are logged by the router and never end
    /// the loop.
    fn on_record(&mut self, topic: Topic, value: Value) -> anyhow::Result<()>;

    /// Periodic housekeeping between records.
    fn on_tick(&mut self, _now: Instant) {}
}

impl<F> RecordHandler for F
where
    F: FnMut(Topic, Value) -> anyhow::Result<()> + Send + 'static,
{
    fn on_record(&mut self, topic: Topic, value: Value) -> anyhow::Result<()> {
        self(topic, value)
    }
}

/// Parse a record body. Anything that is not valid JSON becomes `{}`.
pub fn parse_body(payload: &[u8]) -> Value {
    match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, len = payload.len(), "Malformed record body, treating as empty object");
            Value::Object(Default::default())
        }
    }
}

/// Handle to a running consume loop.
pub struct RouterHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RouterHandle {
    /// Stop the loop and wait for the record in progress to finish.
    pub async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Err(e) = self.task.await {
            warn!(error = %e, "Router task ended abnormally");
        }
    }
}

/// Subscribe the session's consumer to exactly `topics` and start
/// delivering records to `handler`.
///
/// Only a failure to establish the subscription is returned.
pub async fn subscribe<H: RecordHandler>(
    session: &BrokerSession,
    topics: &[Topic],
    handler: H,
    tick_interval: Duration,
) -> Result<RouterHandle> {
    let records = session.subscribe(topics).await?;
    info!(topics = ?topics, "Subscribed, starting router");
    Ok(spawn(records, handler, tick_interval))
}

/// Start the consume loop over an existing record channel.
pub fn spawn<H: RecordHandler>(
    records: mpsc::Receiver<BrokerRecord>,
    handler: H,
    tick_interval: Duration,
) -> RouterHandle {
    let (stop_tx, stop_rx) = oneshot::channel();
    let task = tokio::spawn(run(records, handler, tick_interval, stop_rx));
    RouterHandle {
        stop_tx: Some(stop_tx),
        task,
    }
}

async fn run<H: RecordHandler>(
    mut records: mpsc::Receiver<BrokerRecord>,
    mut handler: H,
    tick_interval: Duration,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;

            _ = &mut stop_rx => {
                debug!("Router stop requested");
                break;
            }

            record = records.recv() => {
                let Some(record) = record else {
                    info!("Record channel closed, router exiting");
                    break;
                };
                dispatch(&mut handler, record);
            }

            _ = ticker.tick() => {
                handler.on_tick(Instant::now());
            }
        }
    }

    info!("Router loop terminated");
}

fn dispatch<H: RecordHandler>(handler: &mut H, record: BrokerRecord) {
    let Some(topic) = Topic::from_wire(&record.topic) else {
        warn!(topic = %record.topic, "Record on unexpected topic ignored");
        return;
    };

    let value = parse_body(&record.payload);
    if let Err(e) = handler.on_record(topic, value) {
        warn!(topic = %topic, error = %e, "Record handler failed");
    }
}
