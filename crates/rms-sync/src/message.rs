use rms_types::Hash;
use serde::{Deserialize, Serialize};

/// Messages exchanged between peers during a session.
///
/// `Root` and `Node` are requests: the receiver answers each with exactly
/// one `Ack` for the same range, after everything it sent in response has
/// itself been acknowledged. A request carrying [`Hash::ZERO`] asks the
/// receiver to stream every leaf it holds in the range.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message<R, C> {
    /// Announcement of the sender's hash for the whole key space.
    Root { range: R, hash: Hash },
    /// The sender's hash for `range`, to be compared by the receiver.
    Node { range: R, hash: Hash },
    /// The request for `range` is fully answered.
    Ack { range: R },
    /// Literal contents of one key.
    Leaf { contents: C },
}

impl<R, C> Message<R, C> {
    pub fn type_tag(&self) -> u8 {
        match self {
            Self::Root { .. } => 1,
            Self::Node { .. } => 2,
            Self::Ack { .. } => 3,
            Self::Leaf { .. } => 4,
        }
    }

    /// Whether `tag` names a message variant.
    pub fn is_known_tag(tag: u8) -> bool {
        (1..=4).contains(&tag)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Root { .. } => "Root",
            Self::Node { .. } => "Node",
            Self::Ack { .. } => "Ack",
            Self::Leaf { .. } => "Leaf",
        }
    }

    /// The range a message refers to; `None` for leaves.
    pub fn range(&self) -> Option<&R> {
        match self {
            Self::Root { range, .. } | Self::Node { range, .. } | Self::Ack { range } => Some(range),
            Self::Leaf { .. } => None,
        }
    }

    /// Whether the receiver owes an `Ack` for this message.
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Root { .. } | Self::Node { .. })
    }
}
