use serde::{Deserialize, Serialize};

/// Configuration for a synchronization session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Role flag shared by both peers with opposite values. When both peers
    /// hold data, the priority peer lets the other side drive the
    /// bisection of the root instead of bisecting both roots.
    pub priority: bool,
    /// Drain all queued work inside `recv`. When `false`, work is only
    /// performed by explicit `send` calls.
    pub eager: bool,
    /// Leaves emitted per unit of streaming work.
    pub leaf_batch: usize,
    /// Maximum number of divergent leaves echoed back to the peer.
    pub max_retransmits: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            priority: false,
            eager: true,
            leaf_batch: 64,
            max_retransmits: 1024,
        }
    }
}

impl SessionConfig {
    /// Configuration for the peer that opened the connection.
    pub fn initiator() -> Self {
        Self {
            priority: true,
            ..Default::default()
        }
    }

    /// Configuration for the peer that accepted the connection.
    pub fn responder() -> Self {
        Self::default()
    }

    /// Leaves per streaming step, never zero.
    pub fn batch(&self) -> usize {
        self.leaf_batch.max(1)
    }
}
