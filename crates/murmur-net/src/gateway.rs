//! The application-facing gateway: join, send, listen, leave.
//!
//! A `Gateway` owns at most one active session at a time. Joining opens a
//! broker session, seeds presence, announces the participant and starts
//! the topic router; leaving unwinds the same steps. Listener callbacks
//! outlive sessions and may be registered before the first join.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use murmur_shared::{
    identity, ChatMessage, ConsumerIdentity, InboundMessage, PresenceDirectory, PresenceNotice,
    Topic,
};

use crate::chunking::{self, Reassembler};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::presence::{self, PresenceView};
use crate::router::{self, RouterHandle};
use crate::session::BrokerSession;
use crate::transport::BrokerTransport;

type Callback = Arc<dyn Fn(Topic, &InboundMessage) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: AtomicU64,
    callbacks: Mutex<BTreeMap<u64, Callback>>,
}

impl Listeners {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, Callback>> {
        self.callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add(&self, callback: Callback) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, callback);
        id
    }

    fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Invoke every callback in registration order. Callbacks run outside
    /// the lock so they may register or drop subscriptions themselves.
    fn dispatch(&self, topic: Topic, message: &InboundMessage) {
        let callbacks: Vec<Callback> = self.lock().values().cloned().collect();
        for callback in callbacks {
            callback(topic, message);
        }
    }
}

/// A registered message callback. Dropping it unregisters the callback.
#[must_use = "dropping a Subscription unregisters its callback"]
pub struct Subscription {
    id: u64,
    listeners: Weak<Listeners>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.remove(self.id);
        }
    }
}

/// Outcome of a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    /// Records published: 1, or the fragment count of a chunked transfer
    pub records: u32,
    /// Set when the message went out as a chunked transfer
    pub transfer_id: Option<String>,
}

/// A presence refresh request from the consume loop.
enum PresenceHint {
    Joined(PresenceNotice),
    Left(PresenceNotice),
}

struct ActiveSession {
    identity: ConsumerIdentity,
    session: Arc<BrokerSession>,
    router: RouterHandle,
    presence_task: JoinHandle<()>,
}

pub struct Gateway {
    transport: Arc<dyn BrokerTransport>,
    config: GatewayConfig,
    listeners: Arc<Listeners>,
    presence: Arc<PresenceView>,
    active: tokio::sync::Mutex<Option<ActiveSession>>,
}

impl Gateway {
    pub fn new(transport: Arc<dyn BrokerTransport>, config: GatewayConfig) -> Self {
        Self {
            transport,
            config,
            listeners: Arc::new(Listeners::default()),
            presence: Arc::new(PresenceView::new()),
            active: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Identity of the active session, if joined.
    pub async fn identity(&self) -> Option<ConsumerIdentity> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| active.identity.clone())
    }

    pub async fn is_joined(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Join the chat as `display_name` and return the seeded presence
    /// directory.
    ///
    /// Any failing step closes the broker session again; nothing of the
    /// attempt is retained and the caller may simply retry.
    pub async fn join(&self, display_name: &str) -> Result<PresenceDirectory> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(GatewayError::AlreadyJoined);
        }

        let identity = ConsumerIdentity::generate(display_name);
        info!(name = %display_name, group = %identity.group_id(), "Joining chat");

        let session = Arc::new(BrokerSession::new(
            Arc::clone(&self.transport),
            self.config.connection_timeout,
            self.config.request_timeout,
        ));
        session.open(&identity).await?;

        match self.start(&identity, &session).await {
            Ok((router, presence_task)) => {
                let directory = self.presence.snapshot();
                info!(
                    group = %identity.group_id(),
                    participants = directory.participants().len(),
                    "Joined chat"
                );
                *active = Some(ActiveSession {
                    identity,
                    session,
                    router,
                    presence_task,
                });
                Ok(directory)
            }
            Err(e) => {
                warn!(group = %identity.group_id(), error = %e, "Join failed, closing session");
                session.close().await;
                self.presence.reset();
                Err(e)
            }
        }
    }

    async fn start(
        &self,
        identity: &ConsumerIdentity,
        session: &Arc<BrokerSession>,
    ) -> Result<(RouterHandle, JoinHandle<()>)> {
        let own_entry = self_entry(identity);

        refresh_into(&self.presence, self.transport.as_ref(), &[&own_entry]).await;

        let notice = PresenceNotice {
            username: own_entry.0.clone(),
            consumer_id: identity.group_id().to_string(),
        };
        session.publish(Topic::Joined, &notice).await?;

        let (hint_tx, hint_rx) = mpsc::unbounded_channel();
        let listeners = Arc::clone(&self.listeners);
        let view = Arc::clone(&self.presence);
        let own_group = identity.group_id().to_string();
        let handler = Reassembler::new(self.config.transfer_ttl, move |topic, message| {
            // Retire before listeners run so they never see the leaver listed.
            if let InboundMessage::Left(notice) = &message {
                if notice.consumer_id != own_group {
                    view.retire(&notice.consumer_id);
                }
            }
            listeners.dispatch(topic, &message);
            let hint = match message {
                InboundMessage::Joined(notice) => PresenceHint::Joined(notice),
                InboundMessage::Left(notice) => PresenceHint::Left(notice),
                _ => return,
            };
            let _ = hint_tx.send(hint);
        });

        let router = match router::subscribe(
            session,
            &Topic::ALL,
            handler,
            self.config.router_sweep_interval,
        )
        .await
        {
            Ok(router) => router,
            Err(e) => {
                // Peers may already have merged us from the join notice.
                announce_leave(session, &notice).await;
                return Err(e);
            }
        };

        let presence_task = tokio::spawn(run_presence(
            Arc::clone(&self.transport),
            Arc::clone(&self.presence),
            own_entry,
            hint_rx,
            self.config.presence_refresh_interval,
        ));

        Ok((router, presence_task))
    }

    /// Publish a chat message on the broadcast or direct topic, chunking
    /// files larger than the configured budget.
    pub async fn send(&self, topic: Topic, message: &ChatMessage) -> Result<SendReceipt> {
        if !topic.carries_chat() {
            return Err(GatewayError::InvalidTopic(topic));
        }
        let session = self.session().await?;

        match chunking::split(message, self.config.chunk_size) {
            Some(transfer) => {
                let records = chunking::publish_transfer(&session, topic, &transfer).await?;
                Ok(SendReceipt {
                    records,
                    transfer_id: Some(transfer.transfer_id),
                })
            }
            None => {
                session.publish(topic, message).await?;
                Ok(SendReceipt {
                    records: 1,
                    transfer_id: None,
                })
            }
        }
    }

    async fn session(&self) -> Result<Arc<BrokerSession>> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| Arc::clone(&active.session))
            .ok_or(GatewayError::NotJoined)
    }

    /// Register a callback for every inbound message, across sessions.
    pub fn on_message<F>(&self, callback: F) -> Subscription
    where
        F: Fn(Topic, &InboundMessage) + Send + Sync + 'static,
    {
        let id = self.listeners.add(Arc::new(callback));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// The latest presence snapshot. Never queries the broker.
    pub fn list_active_participants(&self) -> PresenceDirectory {
        self.presence.snapshot()
    }

    /// Query the broker now and return the refreshed directory.
    pub async fn refresh_participants(&self) -> Result<PresenceDirectory> {
        let own_entry = {
            let active = self.active.lock().await;
            let active = active.as_ref().ok_or(GatewayError::NotJoined)?;
            self_entry(&active.identity)
        };
        Ok(refresh_into(&self.presence, self.transport.as_ref(), &[&own_entry]).await)
    }

    /// Announce departure and close the session. Always completes; a no-op
    /// when not joined.
    pub async fn leave(&self) {
        let Some(active) = self.active.lock().await.take() else {
            debug!("Leave requested while not joined");
            return;
        };

        let notice = PresenceNotice {
            username: self_entry(&active.identity).0,
            consumer_id: active.identity.group_id().to_string(),
        };
        announce_leave(&active.session, &notice).await;

        active.router.stop().await;
        active.presence_task.abort();
        active.session.close().await;
        self.presence.reset();

        info!(group = %active.identity.group_id(), "Left chat");
    }
}

/// The directory entry for a session's own identity.
///
/// Other participants recover the name from the group id, so that decoded
/// form is what the session announces and lists itself under.
fn self_entry(identity: &ConsumerIdentity) -> (String, String) {
    let name = identity
        .announced_name()
        .unwrap_or_else(|| identity.display_name().to_string());
    (name, identity.group_id().to_string())
}

async fn announce_leave(session: &BrokerSession, notice: &PresenceNotice) {
    if let Err(e) = session.publish(Topic::Left, notice).await {
        warn!(group = %notice.consumer_id, error = %e, "Failed to announce leave");
    }
}

/// Refresh from the broker, merge `extra` entries and publish the result
/// unless a newer refresh got there first.
async fn refresh_into(
    view: &PresenceView,
    transport: &dyn BrokerTransport,
    extra: &[&(String, String)],
) -> PresenceDirectory {
    let ticket = view.ticket();
    let mut directory = presence::refresh(transport).await;
    for (name, group_id) in extra {
        directory.insert(name.as_str(), group_id.as_str());
    }
    directory.insert_broadcast_room();
    view.apply(ticket, &mut directory);
    directory
}

async fn run_presence(
    transport: Arc<dyn BrokerTransport>,
    view: Arc<PresenceView>,
    own_entry: (String, String),
    mut hints: mpsc::UnboundedReceiver<PresenceHint>,
    every: Duration,
) {
    let mut ticker = (!every.is_zero()).then(|| {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker
    });
    if let Some(ticker) = ticker.as_mut() {
        ticker.tick().await;
    }

    loop {
        let joined = tokio::select! {
            hint = hints.recv() => match hint {
                Some(PresenceHint::Joined(notice)) => Some(notice),
                Some(PresenceHint::Left(notice)) => {
                    debug!(group = %notice.consumer_id, "Participant left, refreshing presence");
                    None
                }
                None => break,
            },
            _ = async {
                match ticker.as_mut() {
                    Some(ticker) => { ticker.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                debug!("Periodic presence refresh");
                None
            }
        };

        let directory = match joined {
            Some(notice) => {
                let name = identity::decode(&notice.consumer_id).unwrap_or(notice.username);
                debug!(name = %name, "Participant joined, refreshing presence");
                let announced = (name, notice.consumer_id);
                refresh_into(&view, transport.as_ref(), &[&own_entry, &announced]).await
            }
            None => refresh_into(&view, transport.as_ref(), &[&own_entry]).await,
        };
        debug!(entries = directory.len(), "Presence updated");
    }

    debug!("Presence task exiting");
}
