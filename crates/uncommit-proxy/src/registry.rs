//! Connection group registry.
//!
//! Maps a [`GroupKey`] to the group's single upstream connection and its
//! member clients. The registry does no locking of its own: the lifecycle
//! manager owns it behind a mutex and serializes mutations per key.
//!
//! ```text
//! GroupRegistry
//!   "conn-1" → ConnectionGroup { upstream ⇄ mysql, members: {1} }
//!   "shared" → ConnectionGroup { upstream ⇄ mysql, members: {2, 3, 5} }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{Mutex, watch};

use crate::context::{ConnectionId, GroupKey};
use crate::upstream::UpstreamConnection;

/// Upstream connection shared by the members of a group. The mutex
/// serializes statements from different members.
pub type SharedUpstream = Arc<Mutex<Box<dyn UpstreamConnection>>>;

/// Generation id of a group. A key can be reused after its group is torn
/// down; the id tells the two apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GroupId(pub u64);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── ClientHandle ─────────────────────────────────────────────────────

/// Registry-side handle of a member client. Dropping it, or calling
/// [`force_close`](Self::force_close), ends the client's connection task.
#[derive(Debug)]
pub struct ClientHandle {
    pub id: ConnectionId,
    pub peer: Option<SocketAddr>,
    close_tx: watch::Sender<bool>,
}

impl ClientHandle {
    /// Returns the handle and the receiver the connection task watches.
    pub fn new(id: ConnectionId, peer: Option<SocketAddr>) -> (Self, watch::Receiver<bool>) {
        let (close_tx, close_rx) = watch::channel(false);
        (Self { id, peer, close_tx }, close_rx)
    }

    pub fn force_close(&self) {
        let _ = self.close_tx.send(true);
    }
}

/// Resolves once `rx` signals a close or its handle is dropped.
pub async fn closed(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

// ── ConnectionGroup ──────────────────────────────────────────────────

/// What the query pipeline needs from a group.
#[derive(Clone)]
pub struct GroupHandle {
    pub id: GroupId,
    pub key: GroupKey,
    pub upstream: SharedUpstream,
}

impl std::fmt::Debug for GroupHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupHandle")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish()
    }
}

/// One upstream connection and the clients sharing it.
pub struct ConnectionGroup {
    id: GroupId,
    key: GroupKey,
    upstream: SharedUpstream,
    members: HashMap<ConnectionId, ClientHandle>,
    /// Stops the group's background tasks when signalled or dropped.
    stop_tx: watch::Sender<bool>,
}

impl ConnectionGroup {
    /// A group is never empty, so it is created with its first member.
    pub fn new(
        id: GroupId,
        key: GroupKey,
        upstream: Box<dyn UpstreamConnection>,
        first: ClientHandle,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let mut members = HashMap::new();
        members.insert(first.id, first);
        Self {
            id,
            key,
            upstream: Arc::new(Mutex::new(upstream)),
            members,
            stop_tx,
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn handle(&self) -> GroupHandle {
        GroupHandle {
            id: self.id,
            key: self.key.clone(),
            upstream: Arc::clone(&self.upstream),
        }
    }

    /// Receiver for background tasks tied to this group's lifetime.
    pub fn subscribe_stop(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn member_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.members.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Force-close every member, stop background tasks, then close the
    /// upstream. Waits for a statement already running on the upstream.
    pub async fn teardown(self) {
        for member in self.members.values() {
            member.force_close();
            tracing::debug!(conn = %member.id, group = %self.key, "force-closed member");
        }
        let _ = self.stop_tx.send(true);
        self.upstream.lock().await.close().await;
        tracing::info!(
            group = %self.key,
            id = %self.id,
            members = self.members.len(),
            "connection group torn down"
        );
    }
}

impl std::fmt::Debug for ConnectionGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGroup")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("members", &self.member_ids())
            .finish()
    }
}

// ── GroupRegistry ────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct GroupRegistry {
    groups: HashMap<GroupKey, ConnectionGroup>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the group for `key`, creating it with `factory` if absent.
    pub fn get_or_create(
        &mut self,
        key: &GroupKey,
        factory: impl FnOnce() -> ConnectionGroup,
    ) -> &mut ConnectionGroup {
        self.groups.entry(key.clone()).or_insert_with(factory)
    }

    /// Adds a member to an existing group. Hands the member back when no
    /// group is registered under `key`.
    pub fn add_member(&mut self, key: &GroupKey, member: ClientHandle) -> Result<(), ClientHandle> {
        match self.groups.get_mut(key) {
            Some(group) => {
                group.members.insert(member.id, member);
                Ok(())
            }
            None => Err(member),
        }
    }

    /// Removes a member. Returns whether the group is now empty, or `None`
    /// when no group is registered under `key`.
    pub fn remove_member(&mut self, key: &GroupKey, id: ConnectionId) -> Option<bool> {
        let group = self.groups.get_mut(key)?;
        group.members.remove(&id);
        Some(group.is_empty())
    }

    pub fn remove(&mut self, key: &GroupKey) -> Option<ConnectionGroup> {
        self.groups.remove(key)
    }

    /// Removes the group under `key` only if it is generation `id`.
    pub fn remove_if(&mut self, key: &GroupKey, id: GroupId) -> Option<ConnectionGroup> {
        if self.groups.get(key)?.id != id {
            return None;
        }
        self.groups.remove(key)
    }

    pub fn get(&self, key: &GroupKey) -> Option<&ConnectionGroup> {
        self.groups.get(key)
    }

    pub fn count(&self) -> usize {
        self.groups.len()
    }

    pub fn membership(&self) -> BTreeMap<GroupKey, Vec<ConnectionId>> {
        self.groups
            .iter()
            .map(|(key, group)| (key.clone(), group.member_ids()))
            .collect()
    }

    /// Removes and returns every group.
    pub fn drain(&mut self) -> Vec<ConnectionGroup> {
        self.groups.drain().map(|(_, group)| group).collect()
    }
}
