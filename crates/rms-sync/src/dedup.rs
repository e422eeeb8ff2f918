use std::collections::BTreeSet;

use rms_types::{Hash, Range};
use tracing::trace;

use crate::error::SyncResult;
use crate::message::Message;
use crate::session::{Emit, Session, SessionState};

/// Ranges already settled in one direction or the other.
#[derive(Debug)]
struct Ledger<R> {
    /// Ranges we committed to stream to the peer in full.
    local: BTreeSet<R>,
    /// Ranges the peer will stream to us in full.
    remote: BTreeSet<R>,
    /// Zero-hash requests we sent that are not yet acknowledged.
    outgoing: BTreeSet<R>,
    suppressed: u64,
    answered: u64,
}

impl<R: Range> Ledger<R> {
    fn new() -> Self {
        Self {
            local: BTreeSet::new(),
            remote: BTreeSet::new(),
            outgoing: BTreeSet::new(),
            suppressed: 0,
            answered: 0,
        }
    }

    /// Whether an outbound request for `range` still needs to reach the
    /// peer. Admitted zero-hash requests are recorded.
    fn admit(&mut self, range: &R, hash: &Hash) -> bool {
        if covered(&self.local, range) || covered(&self.remote, range) {
            return false;
        }
        if hash.is_zero() {
            if covered(&self.outgoing, range) {
                return false;
            }
            self.outgoing.insert(range.clone());
            self.remote.insert(range.clone());
        }
        true
    }

    /// The peer finished answering our request for `range`; anything it
    /// streamed is now held locally.
    fn settle(&mut self, range: &R) {
        self.remote.retain(|r| !range.contains(r));
        self.outgoing.retain(|r| !range.contains(r));
    }

    fn commit(&mut self, range: &R) {
        self.remote.retain(|r| !range.contains(r));
        self.outgoing.retain(|r| !range.contains(r));
        self.local.insert(range.clone());
    }
}

/// Whether some range in `set` contains `range`.
fn covered<R: Range>(set: &BTreeSet<R>, range: &R) -> bool {
    !set.is_empty() && range.ancestors().any(|a| set.contains(&a))
}

/// Pass `msg` on to `emit` unless the ledger deems it redundant, in which
/// case its range is queued for withdrawal.
fn filter<R: Range, C>(
    ledger: &mut Ledger<R>,
    msg: Message<R, C>,
    withheld: &mut Vec<R>,
    emit: &mut Emit<'_, R, C>,
) {
    let withhold = match &msg {
        Message::Root { range, hash } | Message::Node { range, hash }
            if !ledger.admit(range, hash) =>
        {
            Some(range.clone())
        }
        _ => None,
    };
    match withhold {
        Some(range) => {
            trace!(?range, "suppressing redundant request");
            ledger.suppressed += 1;
            withheld.push(range);
        }
        None => emit(msg),
    }
}

/// Session decorator that keeps a key from crossing the wire twice.
///
/// Tracks which ranges each side has committed to stream in full, answers
/// requests already covered by such a commitment without consulting the
/// inner session, and suppresses outbound requests that could only return
/// data already on its way. Suppressed requests are withdrawn from the
/// inner session so its acknowledgement bookkeeping still balances.
///
/// When both peers hold data, the peer configured with `priority` answers
/// the other's root directly and leaves the bisection of roots to the other
/// side. Exactly one of the two peers should set it.
#[derive(Debug)]
pub struct Dedup<S: Session> {
    inner: S,
    priority: bool,
    started: bool,
    ledger: Ledger<S::Range>,
}

impl<S: Session> Dedup<S> {
    pub fn new(inner: S, priority: bool) -> Self {
        Self {
            inner,
            priority,
            started: false,
            ledger: Ledger::new(),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Outbound requests suppressed so far.
    pub fn suppressed(&self) -> u64 {
        self.ledger.suppressed
    }

    /// Inbound requests answered without reaching the inner session.
    pub fn answered(&self) -> u64 {
        self.ledger.answered
    }

    /// Ranges committed to the peer in full.
    pub fn committed(&self) -> impl Iterator<Item = &S::Range> {
        self.ledger.local.iter()
    }

    /// Why an inbound request can be acknowledged without delegating, if it
    /// can.
    fn answer(&self, is_root: bool, range: &S::Range, hash: &Hash) -> Option<&'static str> {
        if is_root
            && self.priority
            && self.started
            && !hash.is_zero()
            && !self.inner.local_hash(range).is_zero()
        {
            return Some("peer bisects crossing roots");
        }
        if covered(&self.ledger.local, range) {
            return Some("already streaming");
        }
        if hash.is_zero() && covered(&self.ledger.outgoing, range) {
            return Some("already requested");
        }
        None
    }

    /// Run `f` against the inner session with outbound filtering, then
    /// withdraw everything the filter held back.
    fn forward<T>(
        &mut self,
        emit: &mut Emit<'_, S::Range, S::Contents>,
        f: impl FnOnce(&mut S, &mut Emit<'_, S::Range, S::Contents>) -> SyncResult<T>,
    ) -> SyncResult<T> {
        let Self { inner, ledger, .. } = self;
        let mut withheld = Vec::new();
        let result = f(&mut *inner, &mut |msg: Message<S::Range, S::Contents>| {
            filter(&mut *ledger, msg, &mut withheld, &mut *emit)
        })?;
        while let Some(range) = withheld.pop() {
            let mut more = Vec::new();
            inner.withdraw(&range, &mut |msg: Message<S::Range, S::Contents>| {
                filter(&mut *ledger, msg, &mut more, &mut *emit)
            })?;
            withheld.append(&mut more);
        }
        Ok(result)
    }
}

impl<S: Session> Session for Dedup<S> {
    type Range = S::Range;
    type Contents = S::Contents;

    fn start(&mut self, emit: &mut Emit<'_, S::Range, S::Contents>) -> SyncResult<()> {
        self.started = true;
        self.forward(emit, |inner, emit| inner.start(emit))
    }

    fn recv(
        &mut self,
        msg: Message<S::Range, S::Contents>,
        emit: &mut Emit<'_, S::Range, S::Contents>,
    ) -> SyncResult<bool> {
        match &msg {
            Message::Root { range, hash } | Message::Node { range, hash } => {
                let is_root = matches!(msg, Message::Root { .. });
                if let Some(reason) = self.answer(is_root, range, hash) {
                    trace!(?range, reason, "answering request directly");
                    self.ledger.answered += 1;
                    emit(Message::Ack {
                        range: range.clone(),
                    });
                    return Ok(self.inner.has_pending());
                }
                if hash.is_zero() && !self.inner.local_hash(range).is_zero() {
                    self.ledger.commit(range);
                }
            }
            Message::Ack { range } => {
                self.ledger.settle(range);
            }
            Message::Leaf { .. } => {}
        }
        self.forward(emit, |inner, emit| inner.recv(msg, emit))
    }

    fn send(&mut self, emit: &mut Emit<'_, S::Range, S::Contents>) -> SyncResult<bool> {
        self.forward(emit, |inner, emit| inner.send(emit))
    }

    fn has_pending(&self) -> bool {
        self.inner.has_pending()
    }

    fn local_hash(&self, range: &S::Range) -> Hash {
        self.inner.local_hash(range)
    }

    fn withdraw(
        &mut self,
        range: &S::Range,
        emit: &mut Emit<'_, S::Range, S::Contents>,
    ) -> SyncResult<()> {
        let range = range.clone();
        self.forward(emit, move |inner, emit| inner.withdraw(&range, emit))
    }

    fn state(&self) -> SessionState {
        self.inner.state()
    }
}
