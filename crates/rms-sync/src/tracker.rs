use std::collections::BTreeMap;
use std::fmt;

use rms_types::Hash;
use tracing::{debug, trace};

use crate::error::SyncResult;
use crate::message::Message;
use crate::session::{Emit, Session, SessionState};

/// Session decorator that detects when synchronization has finished.
///
/// Counts requests that actually reached the peer and are not yet
/// acknowledged. Once the peer's root has arrived, that count is zero, and
/// the inner session has no queued work, the callback fires. It fires at
/// most once.
pub struct Tracked<S: Session, F> {
    inner: S,
    on_complete: Option<F>,
    outstanding: BTreeMap<S::Range, usize>,
    count: usize,
    started: bool,
    remote_root: bool,
    complete: bool,
}

impl<S: Session, F: FnOnce()> Tracked<S, F> {
    pub fn new(inner: S, on_complete: F) -> Self {
        Self {
            inner,
            on_complete: Some(on_complete),
            outstanding: BTreeMap::new(),
            count: 0,
            started: false,
            remote_root: false,
            complete: false,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Requests sent and not yet acknowledged.
    pub fn outstanding(&self) -> usize {
        self.count
    }

    fn release(&mut self, range: &S::Range) {
        let Some(n) = self.outstanding.get_mut(range) else {
            trace!(?range, "ack for an untracked request");
            return;
        };
        *n -= 1;
        if *n == 0 {
            self.outstanding.remove(range);
        }
        self.count -= 1;
    }

    fn check(&mut self) {
        if self.complete
            || !self.started
            || !self.remote_root
            || self.count > 0
            || self.inner.has_pending()
        {
            return;
        }
        self.complete = true;
        debug!("synchronization complete");
        if let Some(callback) = self.on_complete.take() {
            callback();
        }
    }

    fn forward<T>(
        &mut self,
        emit: &mut Emit<'_, S::Range, S::Contents>,
        f: impl FnOnce(&mut S, &mut Emit<'_, S::Range, S::Contents>) -> SyncResult<T>,
    ) -> SyncResult<T> {
        let Self {
            inner,
            outstanding,
            count,
            ..
        } = self;
        let result = f(inner, &mut |msg: Message<S::Range, S::Contents>| {
            if let Message::Root { range, .. } | Message::Node { range, .. } = &msg {
                *outstanding.entry(range.clone()).or_default() += 1;
                *count += 1;
            }
            emit(msg)
        });
        self.check();
        result
    }
}

impl<S: Session, F: FnOnce()> Session for Tracked<S, F> {
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
            Message::Root { .. } => self.remote_root = true,
            Message::Ack { range } => self.release(range),
            _ => {}
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
        self.release(range);
        let range = range.clone();
        self.forward(emit, move |inner, emit| inner.withdraw(&range, emit))
    }

    fn state(&self) -> SessionState {
        self.inner.state()
    }
}

impl<S: Session + fmt::Debug, F> fmt::Debug for Tracked<S, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracked")
            .field("inner", &self.inner)
            .field("outstanding", &self.count)
            .field("remote_root", &self.remote_root)
            .field("complete", &self.complete)
            .finish()
    }
}
