use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use rms_types::{Hash, Range};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::config::SessionConfig;
use crate::dataset::Dataset;
use crate::error::{SyncError, SyncResult};
use crate::message::Message;

/// Sink for outbound messages. Sessions never perform I/O themselves; the
/// caller decides how each emitted message reaches the peer.
pub type Emit<'a, R, C> = dyn FnMut(Message<R, C>) + 'a;

/// Message type spoken by a session.
pub type SessionMessage<S> = Message<<S as Session>::Range, <S as Session>::Contents>;

/// Coarse lifecycle of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Neither started nor contacted by the peer.
    Idle,
    /// Work is queued or acknowledgements are outstanding.
    Active,
    /// Nothing queued and nothing awaiting acknowledgement.
    Settled,
}

/// One side of a synchronization session.
///
/// The core [`SyncSession`] and its decorators all implement this trait, so
/// decorators stack in any order over any core.
pub trait Session {
    type Range: Range;
    type Contents: Clone + fmt::Debug;

    /// Announce the local root. Both peers must call this exactly once.
    fn start(&mut self, emit: &mut Emit<'_, Self::Range, Self::Contents>) -> SyncResult<()>;

    /// Handle one inbound message. Returns whether work remains queued.
    fn recv(
        &mut self,
        msg: Message<Self::Range, Self::Contents>,
        emit: &mut Emit<'_, Self::Range, Self::Contents>,
    ) -> SyncResult<bool>;

    /// Perform one unit of queued work. Returns whether more remains.
    fn send(&mut self, emit: &mut Emit<'_, Self::Range, Self::Contents>) -> SyncResult<bool>;

    fn has_pending(&self) -> bool;

    /// Hash of local data in `range`.
    fn local_hash(&self, range: &Self::Range) -> Hash;

    /// Retract the most recently emitted, still unacknowledged request for
    /// `range` as though the peer had acknowledged it. Used by decorators
    /// that swallow a request instead of forwarding it.
    fn withdraw(
        &mut self,
        range: &Self::Range,
        emit: &mut Emit<'_, Self::Range, Self::Contents>,
    ) -> SyncResult<()>;

    fn state(&self) -> SessionState;

    fn is_settled(&self) -> bool {
        self.state() == SessionState::Settled
    }
}

/// Counters kept by a [`SyncSession`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub requests_sent: u64,
    pub requests_received: u64,
    pub acks_sent: u64,
    pub leaves_sent: u64,
    pub leaves_received: u64,
    pub retransmits: u64,
}

type InboundId = u64;

/// A peer request we owe an `Ack` for.
#[derive(Debug)]
struct Inbound<R> {
    range: R,
    /// Own requests and streams still open on its behalf.
    waiting: usize,
}

#[derive(Debug)]
enum Task<R: Range> {
    Compare {
        id: InboundId,
        range: R,
        remote: Hash,
    },
    Stream {
        id: InboundId,
        range: R,
        after: Option<R::Key>,
    },
}

/// The core bisection session over a [`Dataset`].
///
/// Every inbound request is compared against local data and answered by
/// exactly one `Ack`, emitted only once every request sent on its behalf
/// has been acknowledged and every leaf it triggered has been sent.
pub struct SyncSession<D: Dataset> {
    dataset: D,
    config: SessionConfig,
    started: bool,
    contacted: bool,
    queue: VecDeque<Task<D::Range>>,
    /// Unacknowledged outbound requests per range, oldest first, with the
    /// inbound request each was sent for (`None` for our root).
    requests: BTreeMap<D::Range, VecDeque<Option<InboundId>>>,
    inbound: BTreeMap<InboundId, Inbound<D::Range>>,
    next_id: InboundId,
    echoed: BTreeSet<<D::Range as Range>::Key>,
    stats: SessionStats,
}

impl<D: Dataset> SyncSession<D> {
    pub fn new(dataset: D, config: SessionConfig) -> Self {
        Self {
            dataset,
            config,
            started: false,
            contacted: false,
            queue: VecDeque::new(),
            requests: BTreeMap::new(),
            inbound: BTreeMap::new(),
            next_id: 0,
            echoed: BTreeSet::new(),
            stats: SessionStats::default(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    pub fn into_dataset(self) -> D {
        self.dataset
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Outbound requests awaiting acknowledgement.
    pub fn unacknowledged(&self) -> usize {
        self.requests.values().map(VecDeque::len).sum()
    }

    fn accept(&mut self, range: D::Range, remote: Hash) {
        let id = self.next_id;
        self.next_id += 1;
        self.stats.requests_received += 1;
        self.inbound.insert(
            id,
            Inbound {
                range: range.clone(),
                waiting: 0,
            },
        );
        self.queue.push_back(Task::Compare { id, range, remote });
    }

    fn step(&mut self, emit: &mut Emit<'_, D::Range, D::Contents>) -> SyncResult<bool> {
        let Some(task) = self.queue.pop_front() else {
            return Ok(false);
        };
        match task {
            Task::Compare { id, range, remote } => self.compare(id, range, remote, emit)?,
            Task::Stream { id, range, after } => self.stream(id, range, after, emit),
        }
        Ok(true)
    }

    fn compare(
        &mut self,
        id: InboundId,
        range: D::Range,
        remote: Hash,
        emit: &mut Emit<'_, D::Range, D::Contents>,
    ) -> SyncResult<()> {
        let local = self.dataset.hash(&range);
        if local == remote {
            trace!(?range, "hashes agree");
        } else if remote.is_zero() {
            debug!(?range, "peer holds nothing here, streaming leaves");
            self.hold(id);
            self.queue.push_back(Task::Stream {
                id,
                range,
                after: None,
            });
        } else if local.is_zero() {
            trace!(?range, "nothing held here, requesting leaves");
            self.request(id, range, Hash::ZERO, emit);
        } else if range.is_leaf() {
            trace!(?range, "divergent leaf");
            for contents in self.dataset.leaves(&range, None, 1) {
                self.send_leaf(contents, emit);
            }
        } else {
            let (left, right) = range.split()?;
            let left_hash = self.dataset.hash(&left);
            let right_hash = self.dataset.hash(&right);
            self.request(id, left, left_hash, emit);
            self.request(id, right, right_hash, emit);
        }
        self.settle(id, emit);
        Ok(())
    }

    fn stream(
        &mut self,
        id: InboundId,
        range: D::Range,
        after: Option<<D::Range as Range>::Key>,
        emit: &mut Emit<'_, D::Range, D::Contents>,
    ) {
        let batch_size = self.config.batch();
        let batch = self.dataset.leaves(&range, after.as_ref(), batch_size);
        let last = match batch.last() {
            Some(contents) if batch.len() == batch_size => Some(self.dataset.key_of(contents)),
            _ => None,
        };
        for contents in batch {
            self.send_leaf(contents, emit);
        }
        match last {
            Some(after) => self.queue.push_back(Task::Stream {
                id,
                range,
                after: Some(after),
            }),
            None => self.release(id, emit),
        }
    }

    fn request(
        &mut self,
        id: InboundId,
        range: D::Range,
        hash: Hash,
        emit: &mut Emit<'_, D::Range, D::Contents>,
    ) {
        self.hold(id);
        self.requests
            .entry(range.clone())
            .or_default()
            .push_back(Some(id));
        self.stats.requests_sent += 1;
        emit(Message::Node { range, hash });
    }

    fn send_leaf(&mut self, contents: D::Contents, emit: &mut Emit<'_, D::Range, D::Contents>) {
        self.stats.leaves_sent += 1;
        emit(Message::Leaf { contents });
    }

    fn hold(&mut self, id: InboundId) {
        if let Some(inbound) = self.inbound.get_mut(&id) {
            inbound.waiting += 1;
        }
    }

    /// One piece of work held for `id` finished.
    fn release(&mut self, id: InboundId, emit: &mut Emit<'_, D::Range, D::Contents>) {
        if let Some(inbound) = self.inbound.get_mut(&id) {
            inbound.waiting = inbound.waiting.saturating_sub(1);
        }
        self.settle(id, emit);
    }

    /// Acknowledge `id` once nothing is held for it.
    fn settle(&mut self, id: InboundId, emit: &mut Emit<'_, D::Range, D::Contents>) {
        if self.inbound.get(&id).is_some_and(|i| i.waiting == 0) {
            if let Some(done) = self.inbound.remove(&id) {
                trace!(range = ?done.range, "acknowledging");
                self.stats.acks_sent += 1;
                emit(Message::Ack { range: done.range });
            }
        }
    }

    /// Resolve one outstanding request for `range`, newest first when
    /// `newest` is set and oldest first otherwise.
    fn resolve(
        &mut self,
        range: &D::Range,
        newest: bool,
        emit: &mut Emit<'_, D::Range, D::Contents>,
    ) -> bool {
        let Some(pending) = self.requests.get_mut(range) else {
            return false;
        };
        let origin = if newest {
            pending.pop_back()
        } else {
            pending.pop_front()
        };
        if pending.is_empty() {
            self.requests.remove(range);
        }
        match origin {
            Some(Some(id)) => self.release(id, emit),
            Some(None) => debug!("root acknowledged"),
            None => return false,
        }
        true
    }

    fn absorb(
        &mut self,
        contents: D::Contents,
        emit: &mut Emit<'_, D::Range, D::Contents>,
    ) -> SyncResult<()> {
        self.stats.leaves_received += 1;
        let key = self.dataset.key_of(&contents);
        let incoming = self.dataset.digest(&contents);
        let kept = self.dataset.insert(contents)?;
        if kept == incoming || self.echoed.contains(&key) {
            return Ok(());
        }
        if self.echoed.len() >= self.config.max_retransmits {
            warn!(?key, "retransmit limit reached, leaving key divergent");
            return Ok(());
        }
        debug!(?key, "peer holds a divergent value, sending ours back");
        self.echoed.insert(key.clone());
        for contents in self.dataset.leaves(&D::Range::leaf(&key), None, 1) {
            self.stats.retransmits += 1;
            self.send_leaf(contents, emit);
        }
        Ok(())
    }
}

fn violation(detail: impl fmt::Display) -> SyncError {
    SyncError::ProtocolViolation(detail.to_string())
}

impl<D: Dataset> Session for SyncSession<D> {
    type Range = D::Range;
    type Contents = D::Contents;

    fn start(&mut self, emit: &mut Emit<'_, D::Range, D::Contents>) -> SyncResult<()> {
        if self.started {
            warn!("session already started");
            return Ok(());
        }
        self.started = true;
        let range = D::Range::root();
        let hash = self.dataset.hash(&range);
        debug!(?hash, "announcing root");
        self.requests.entry(range.clone()).or_default().push_back(None);
        self.stats.requests_sent += 1;
        emit(Message::Root { range, hash });
        Ok(())
    }

    fn recv(
        &mut self,
        msg: Message<D::Range, D::Contents>,
        emit: &mut Emit<'_, D::Range, D::Contents>,
    ) -> SyncResult<bool> {
        self.contacted = true;
        match msg {
            Message::Root { range, hash } => {
                range.validate().map_err(violation)?;
                if !range.is_root() {
                    return Err(violation(format!("root announced for {range:?}")));
                }
                debug!(?hash, "peer root received");
                self.accept(range, hash);
            }
            Message::Node { range, hash } => {
                range.validate().map_err(violation)?;
                self.accept(range, hash);
            }
            Message::Ack { range } => {
                if !self.resolve(&range, false, emit) {
                    debug!(?range, "ignoring unexpected ack");
                }
            }
            Message::Leaf { contents } => self.absorb(contents, emit)?,
        }
        if self.config.eager {
            while self.step(emit)? {}
        }
        Ok(self.has_pending())
    }

    fn send(&mut self, emit: &mut Emit<'_, D::Range, D::Contents>) -> SyncResult<bool> {
        self.step(emit)?;
        Ok(self.has_pending())
    }

    fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    fn local_hash(&self, range: &D::Range) -> Hash {
        self.dataset.hash(range)
    }

    fn withdraw(
        &mut self,
        range: &D::Range,
        emit: &mut Emit<'_, D::Range, D::Contents>,
    ) -> SyncResult<()> {
        if !self.resolve(range, true, emit) {
            warn!(?range, "withdrawing a request that was never sent");
        }
        Ok(())
    }

    fn state(&self) -> SessionState {
        if !self.started && !self.contacted {
            SessionState::Idle
        } else if self.queue.is_empty() && self.requests.is_empty() && self.inbound.is_empty() {
            SessionState::Settled
        } else {
            SessionState::Active
        }
    }
}

impl<D: Dataset> fmt::Debug for SyncSession<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncSession")
            .field("state", &self.state())
            .field("queued", &self.queue.len())
            .field("unacknowledged", &self.unacknowledged())
            .field("inbound", &self.inbound.len())
            .finish()
    }
}
