//! Chunked file transfers.
//!
//! Files larger than the chunk budget are split into fragments that share a
//! transfer id and are published one after another. Receivers buffer
//! fragments per transfer and hand a single rebuilt message downstream once
//! every index has arrived; partial transfers are never surfaced.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use murmur_shared::protocol::is_chunk_shaped;
use murmur_shared::{ChatMessage, FileFragment, InboundMessage, MessageBody, Topic};

use crate::error::{GatewayError, Result};
use crate::router::RecordHandler;
use crate::session::BrokerSession;

// ---------------------------------------------------------------------------
// Send path
// ---------------------------------------------------------------------------

/// An oversized file message split into publishable fragments.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub transfer_id: String,
    pub fragments: Vec<ChatMessage>,
}

impl Transfer {
    pub fn total(&self) -> u32 {
        self.fragments.len() as u32
    }
}

/// Split `message` if it carries a file larger than `chunk_size` bytes.
///
/// Returns `None` for text messages, for files within the budget and for
/// messages that already are a fragment.
pub fn split(message: &ChatMessage, chunk_size: usize) -> Option<Transfer> {
    let file = message.file_fragment()?;
    if file.chunked || file.data.len() <= chunk_size || chunk_size == 0 {
        return None;
    }

    let transfer_id = Uuid::new_v4().to_string();
    let total = file.data.len().div_ceil(chunk_size) as u32;

    let fragments = file
        .data
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, bytes)| ChatMessage {
            sender: message.sender.clone(),
            recipient: message.recipient.clone(),
            timestamp: message.timestamp,
            body: MessageBody::File(FileFragment {
                transfer_id: Some(transfer_id.clone()),
                sequence_index: index as u32,
                total_fragments: total,
                mime_type: file.mime_type.clone(),
                filename: file.filename.clone(),
                data: bytes.to_vec(),
                chunked: true,
            }),
        })
        .collect();

    Some(Transfer {
        transfer_id,
        fragments,
    })
}

/// Publish every fragment of `transfer` on `topic`, in index order.
///
/// Each publish is awaited before the next one starts. The first failure
/// aborts the transfer: later fragments are never published and the error
/// names the failed index.
pub async fn publish_transfer(
    session: &BrokerSession,
    topic: Topic,
    transfer: &Transfer,
) -> Result<u32> {
    let total = transfer.total();
    info!(
        transfer = %transfer.transfer_id,
        total,
        topic = %topic,
        "Sending chunked transfer"
    );

    for (index, fragment) in transfer.fragments.iter().enumerate() {
        let index = index as u32;
        let payload = fragment.to_json()?;

        if let Err(source) = session.publish_bytes(topic, payload).await {
            warn!(
                transfer = %transfer.transfer_id,
                index,
                total,
                error = %source,
                "Fragment publish failed, aborting transfer"
            );
            return Err(GatewayError::FragmentPublish {
                index,
                total,
                source,
            });
        }
        debug!(transfer = %transfer.transfer_id, index, total, "Fragment published");
    }

    Ok(total)
}

// ---------------------------------------------------------------------------
// Receive path
// ---------------------------------------------------------------------------

struct TransferBuffer {
    received: HashMap<u32, Vec<u8>>,
    total: u32,
    mime_type: String,
    filename: String,
    last_touched: Instant,
}

/// Per-session table of partially received transfers.
pub struct ReassemblyEngine {
    buffers: HashMap<String, TransferBuffer>,
    ttl: Duration,
}

impl ReassemblyEngine {
    pub fn new(ttl: Duration) -> Self {
        Self {
            buffers: HashMap::new(),
            ttl,
        }
    }

    /// Number of transfers still waiting for fragments.
    pub fn in_flight(&self) -> usize {
        self.buffers.len()
    }

    /// Feed one inbound chat message.
    ///
    /// Non-fragments come straight back. Fragments are buffered and yield
    /// `Some` only when they complete their transfer.
    pub fn accept(
        &mut self,
        message: ChatMessage,
        now: Instant,
    ) -> anyhow::Result<Option<ChatMessage>> {
        self.evict_expired(now);

        let ChatMessage {
            sender,
            recipient,
            timestamp,
            body,
        } = message;
        let fragment = match body {
            MessageBody::File(fragment) if fragment.chunked => fragment,
            body => {
                return Ok(Some(ChatMessage {
                    sender,
                    recipient,
                    timestamp,
                    body,
                }))
            }
        };

        let Some(transfer_id) = fragment.transfer_id else {
            anyhow::bail!("chunked fragment without transfer id");
        };
        let index = fragment.sequence_index;

        let buffer = self
            .buffers
            .entry(transfer_id.clone())
            .or_insert_with(|| TransferBuffer {
                received: HashMap::new(),
                total: fragment.total_fragments,
                mime_type: fragment.mime_type,
                filename: fragment.filename,
                last_touched: now,
            });

        if buffer.total != fragment.total_fragments {
            anyhow::bail!(
                "fragment {index} of transfer {transfer_id} claims {} chunks, expected {}",
                fragment.total_fragments,
                buffer.total
            );
        }

        if buffer.received.insert(index, fragment.data).is_some() {
            debug!(transfer = %transfer_id, index, "Duplicate fragment overwritten");
        }
        buffer.last_touched = now;

        if buffer.received.len() < buffer.total as usize {
            debug!(
                transfer = %transfer_id,
                received = buffer.received.len(),
                total = buffer.total,
                "Fragment buffered"
            );
            return Ok(None);
        }

        let Some(mut buffer) = self.buffers.remove(&transfer_id) else {
            return Ok(None);
        };

        let mut data = Vec::with_capacity(buffer.received.values().map(Vec::len).sum());
        for i in 0..buffer.total {
            match buffer.received.remove(&i) {
                Some(bytes) => data.extend_from_slice(&bytes),
                None => anyhow::bail!("transfer {transfer_id} completed without fragment {i}"),
            }
        }

        info!(
            transfer = %transfer_id,
            fragments = buffer.total,
            bytes = data.len(),
            "Transfer reassembled"
        );

        Ok(Some(ChatMessage {
            sender,
            recipient,
            timestamp,
            body: MessageBody::File(FileFragment {
                transfer_id: Some(transfer_id),
                sequence_index: 0,
                total_fragments: 1,
                mime_type: buffer.mime_type,
                filename: buffer.filename,
                data,
                chunked: false,
            }),
        }))
    }

    /// Drop transfers untouched for longer than the TTL. Returns how many
    /// were evicted.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.buffers.len();
        self.buffers.retain(|transfer_id, buffer| {
            let idle = now.saturating_duration_since(buffer.last_touched);
            let keep = idle <= ttl;
            if !keep {
                warn!(
                    transfer = %transfer_id,
                    received = buffer.received.len(),
                    total = buffer.total,
                    "Evicting incomplete transfer"
                );
            }
            keep
        });
        before - self.buffers.len()
    }
}

/// Record handler that classifies parsed bodies, reassembles chunked
/// transfers and forwards finished messages to `downstream`.
pub struct Reassembler<F> {
    engine: ReassemblyEngine,
    downstream: F,
}

impl<F> Reassembler<F>
where
    F: FnMut(Topic, InboundMessage) + Send + 'static,
{
    pub fn new(ttl: Duration, downstream: F) -> Self {
        Self {
            engine: ReassemblyEngine::new(ttl),
            downstream,
        }
    }
}

impl<F> RecordHandler for Reassembler<F>
where
    F: FnMut(Topic, InboundMessage) + Send + 'static,
{
    fn on_record(&mut self, topic: Topic, value: Value) -> anyhow::Result<()> {
        let message = match InboundMessage::parse(topic, &value) {
            Ok(message) => message,
            Err(e) if is_chunk_shaped(&value) => {
                anyhow::bail!("dropping malformed fragment: {e}");
            }
            Err(e) => {
                debug!(topic = %topic, error = %e, "Unrecognized record body");
                InboundMessage::Unrecognized(value)
            }
        };

        let message = match message {
            InboundMessage::Chat(chat) => match self.engine.accept(chat, Instant::now())? {
                Some(chat) => InboundMessage::Chat(chat),
                None => return Ok(()),
            },
            other => other,
        };

        (self.downstream)(topic, message);
        Ok(())
    }

    fn on_tick(&mut self, now: Instant) {
        let evicted = self.engine.evict_expired(now);
        if evicted > 0 {
            debug!(evicted, in_flight = self.engine.in_flight(), "Transfer sweep");
        }
    }
}
