//! Presence derived from broker consumer-group metadata.
//!
//! There is no heartbeat protocol: a participant is "present" while its
//! consumer group reports a stable state. Newly joined participants may
//! only appear once their group settles, which is why join handling
//! merges the announced identity in directly.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

use murmur_shared::constants::GROUP_PREFIX;
use murmur_shared::identity;
use murmur_shared::PresenceDirectory;

use crate::transport::{BrokerResult, BrokerTransport};

/// Rebuild the directory from the broker.
///
/// Never fails: any broker error yields a directory holding only the
/// broadcast room.
pub async fn refresh(transport: &dyn BrokerTransport) -> PresenceDirectory {
    let mut directory = match query_stable_participants(transport).await {
        Ok(directory) => directory,
        Err(e) => {
            warn!(error = %e, "Presence query failed, falling back to empty directory");
            PresenceDirectory::default()
        }
    };
    directory.insert_broadcast_room();
    directory
}

async fn query_stable_participants(
    transport: &dyn BrokerTransport,
) -> BrokerResult<PresenceDirectory> {
    let mut directory = PresenceDirectory::default();

    for group_id in transport.list_groups().await? {
        if !group_id.starts_with(GROUP_PREFIX) {
            continue;
        }

        let state = transport.describe_group(&group_id).await?;
        if !state.is_stable() {
            debug!(group = %group_id, state = ?state, "Skipping unsettled group");
            continue;
        }

        match identity::decode(&group_id) {
            Some(name) => directory.insert(name, group_id),
            None => debug!(group = %group_id, "Skipping undecodable group id"),
        }
    }

    Ok(directory)
}

/// The latest presence snapshot shared between the gateway and its
/// background refreshes.
///
/// Each refresh takes a ticket before querying the broker; a result is
/// only applied if no later ticket has been applied first, so a slow
/// query cannot roll the directory back.
///
/// Groups that announced their departure are retired: their consumer
/// group may still report stable for a while, but they are kept out of
/// every later snapshot.
pub struct PresenceView {
    inner: Mutex<ViewState>,
}

struct ViewState {
    directory: PresenceDirectory,
    next_ticket: u64,
    applied_ticket: u64,
    retired: HashSet<String>,
}

impl PresenceView {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ViewState {
                directory: PresenceDirectory::with_broadcast_room(),
                next_ticket: 1,
                applied_ticket: 0,
                retired: HashSet::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ViewState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> PresenceDirectory {
        self.lock().directory.clone()
    }

    pub fn ticket(&self) -> u64 {
        let mut state = self.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        ticket
    }

    /// Store `directory` if `ticket` is newer than the last applied one.
    /// Retired groups are removed from it first.
    pub fn apply(&self, ticket: u64, directory: &mut PresenceDirectory) -> bool {
        let mut state = self.lock();
        for group_id in &state.retired {
            directory.remove_group(group_id);
        }
        if ticket <= state.applied_ticket {
            debug!(ticket, applied = state.applied_ticket, "Discarding stale presence refresh");
            return false;
        }
        state.applied_ticket = ticket;
        state.directory = directory.clone();
        true
    }

    /// Remove `group_id` from the current snapshot and from every later one.
    pub fn retire(&self, group_id: &str) {
        let mut state = self.lock();
        state.directory.remove_group(group_id);
        state.retired.insert(group_id.to_string());
    }

    /// Forget everyone but the broadcast room.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.applied_ticket = state.next_ticket;
        state.next_ticket += 1;
        state.directory = PresenceDirectory::with_broadcast_room();
        state.retired.clear();
    }
}

impl Default for PresenceView {
    fn default() -> Self {
        Self::new()
    }
}
