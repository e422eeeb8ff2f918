//! Shared fixtures for session tests: replica builders and an in-process
//! loopback that shuttles messages between two sessions.

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rms_merkle::{SparseAccumulator, TreeAccumulator};
use rms_types::{LinearRange, PrefixRange};

use crate::config::SessionConfig;
use crate::dataset::{Dataset, LeafStore, MemoryStore, Record, Replica};
use crate::dedup::Dedup;
use crate::message::Message;
use crate::session::{Session, SyncSession};
use crate::tracker::Tracked;

pub type LinearReplica = Replica<SparseAccumulator<LinearRange>, MemoryStore<LinearRange>>;
pub type PrefixReplica = Replica<TreeAccumulator<PrefixRange>, MemoryStore<PrefixRange>>;

/// Full stack as an application would assemble it.
pub type Stack<D> = Tracked<Dedup<SyncSession<D>>, fn()>;

const MAX_DELIVERIES: usize = 1_000_000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn linear(keys: impl IntoIterator<Item = u64>) -> LinearReplica {
    let mut replica = Replica::new(SparseAccumulator::new(), MemoryStore::new());
    for k in keys {
        replica.insert(Record::new(k, k.to_be_bytes())).unwrap();
    }
    replica
}

pub fn prefix(keys: &[&str]) -> PrefixReplica {
    let mut replica = Replica::new(TreeAccumulator::new(), MemoryStore::new());
    for k in keys {
        replica.insert(Record::new(k.as_bytes().to_vec(), *k)).unwrap();
    }
    replica
}

/// `n` distinct random keys below `bound`.
pub fn random_keys(rng: &mut StdRng, n: usize, bound: u64) -> Vec<u64> {
    let mut keys: Vec<u64> = (0..n).map(|_| rng.gen_range(0..bound)).collect();
    keys.sort_unstable();
    keys.dedup();
    keys
}

pub fn seeded(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

pub fn stack<D: Dataset>(dataset: D, config: SessionConfig) -> Stack<D> {
    let priority = config.priority;
    Tracked::new(Dedup::new(SyncSession::new(dataset, config), priority), (|| {}) as fn())
}

pub fn into_dataset<D: Dataset>(stack: Stack<D>) -> D {
    stack.into_inner().into_inner().into_dataset()
}

/// What crossed the wire during one exchange.
#[derive(Debug, Default)]
pub struct Exchange {
    pub leaves_from_a: usize,
    pub leaves_from_b: usize,
    pub requests_from_a: usize,
    pub requests_from_b: usize,
    pub messages: usize,
}

fn tally<R, C>(msg: &Message<R, C>, leaves: &mut usize, requests: &mut usize) {
    match msg {
        Message::Leaf { .. } => *leaves += 1,
        Message::Root { .. } | Message::Node { .. } => *requests += 1,
        Message::Ack { .. } => {}
    }
}

/// Start both sessions and deliver messages in order until neither side
/// has anything in flight or queued.
pub fn exchange<A, B>(a: &mut A, b: &mut B) -> Exchange
where
    A: Session,
    B: Session<Range = A::Range, Contents = A::Contents>,
{
    let mut to_a: VecDeque<Message<A::Range, A::Contents>> = VecDeque::new();
    let mut to_b: VecDeque<Message<A::Range, A::Contents>> = VecDeque::new();
    let mut stats = Exchange::default();

    a.start(&mut |m| to_b.push_back(m)).unwrap();
    b.start(&mut |m| to_a.push_back(m)).unwrap();

    for _ in 0..MAX_DELIVERIES {
        let mut progressed = false;
        if let Some(msg) = to_b.pop_front() {
            tally(&msg, &mut stats.leaves_from_a, &mut stats.requests_from_a);
            stats.messages += 1;
            b.recv(msg, &mut |m| to_a.push_back(m)).unwrap();
            progressed = true;
        }
        if let Some(msg) = to_a.pop_front() {
            tally(&msg, &mut stats.leaves_from_b, &mut stats.requests_from_b);
            stats.messages += 1;
            a.recv(msg, &mut |m| to_b.push_back(m)).unwrap();
            progressed = true;
        }
        if a.has_pending() {
            a.send(&mut |m| to_b.push_back(m)).unwrap();
            progressed = true;
        }
        if b.has_pending() {
            b.send(&mut |m| to_a.push_back(m)).unwrap();
            progressed = true;
        }
        if !progressed {
            return stats;
        }
    }
    panic!("exchange did not quiesce after {MAX_DELIVERIES} deliveries");
}

/// Assert two replicas hold identical data.
pub fn assert_converged<A, S>(a: &Replica<A, S>, b: &Replica<A, S>)
where
    A: rms_merkle::Accumulator,
    S: LeafStore<Range = A::Range>,
    S::Contents: PartialEq,
{
    assert_eq!(a.root_hash(), b.root_hash(), "root hashes differ");
    assert_eq!(a.len(), b.len(), "key counts differ");
    let root = <A::Range as rms_types::Range>::root();
    assert_eq!(
        a.leaves(&root, None, usize::MAX),
        b.leaves(&root, None, usize::MAX)
    );
}
