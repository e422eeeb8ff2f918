use bytes::BytesMut;
use rms_crypto::{SigningKey, VerifyingKey};
use rms_sync::{Message, Session};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::codec::{Frame, SyncCodec};
use crate::error::{ProtocolError, ProtocolResult};

const READ_CHUNK: usize = 8 * 1024;

/// Signing identity for an authenticated stream.
struct Identity {
    local: SigningKey,
    peer: VerifyingKey,
}

/// Codec plus the optional identity frames are sealed and opened with.
struct Framing {
    codec: SyncCodec,
    identity: Option<Identity>,
}

impl Framing {
    fn encode<R: Serialize, C: Serialize>(
        &self,
        msg: &Message<R, C>,
        dst: &mut BytesMut,
    ) -> ProtocolResult<()> {
        match &self.identity {
            Some(identity) => {
                dst.extend_from_slice(&self.codec.encode_sealed(msg, &identity.local)?);
                Ok(())
            }
            None => self.codec.encode_into(msg, dst),
        }
    }

    /// Next complete message in `buffer`, if one has fully arrived.
    fn decode<R: DeserializeOwned, C: DeserializeOwned>(
        &self,
        buffer: &mut BytesMut,
    ) -> ProtocolResult<Option<Message<R, C>>> {
        let Some(frame) = self.codec.decode_from(buffer)? else {
            return Ok(None);
        };
        match (frame, &self.identity) {
            (Frame::Message(msg), None) => Ok(Some(msg)),
            (Frame::Message(_), Some(_)) => Err(ProtocolError::Unsigned),
            (Frame::Sealed(envelope), identity) => self
                .codec
                .open(&envelope, identity.as_ref().map(|i| &i.peer))
                .map(Some),
        }
    }
}

/// End of stream reached with `buffer` still holding unread bytes.
fn truncated(buffer: &BytesMut) -> ProtocolError {
    ProtocolError::FramingError(format!(
        "stream closed with {} bytes of a partial frame",
        buffer.len()
    ))
}

/// Framed sync messages over an async byte stream.
///
/// Messages are written and read in order. When built with
/// [`authenticated`](Self::authenticated), every outgoing frame is sealed
/// with the local key and every incoming frame must be sealed by the peer.
pub struct MessageStream<T> {
    io: T,
    framing: Framing,
    buffer: BytesMut,
}

impl<T: AsyncRead + AsyncWrite + Unpin> MessageStream<T> {
    pub fn new(io: T) -> Self {
        Self {
            io,
            framing: Framing {
                codec: SyncCodec::default(),
                identity: None,
            },
            buffer: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    pub fn with_codec(mut self, codec: SyncCodec) -> Self {
        self.framing.codec = codec;
        self
    }

    /// Seal outgoing frames with `local` and accept only frames sealed by
    /// `peer`.
    pub fn authenticated(mut self, local: SigningKey, peer: VerifyingKey) -> Self {
        self.framing.identity = Some(Identity { local, peer });
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.framing.identity.is_some()
    }

    pub async fn write<R: Serialize, C: Serialize>(&mut self, msg: &Message<R, C>) -> ProtocolResult<()> {
        let mut bytes = BytesMut::new();
        self.framing.encode(msg, &mut bytes)?;
        self.io.write_all(&bytes).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> ProtocolResult<()> {
        self.io.flush().await?;
        Ok(())
    }

    /// Stop writing. The peer reads end-of-stream once it has consumed
    /// everything already written; reading continues to work.
    pub async fn shutdown(&mut self) -> ProtocolResult<()> {
        self.io.shutdown().await?;
        Ok(())
    }

    /// Next message, or `None` once the peer has closed the stream cleanly.
    pub async fn read<R: DeserializeOwned, C: DeserializeOwned>(
        &mut self,
    ) -> ProtocolResult<Option<Message<R, C>>> {
        loop {
            if let Some(msg) = self.framing.decode(&mut self.buffer)? {
                return Ok(Some(msg));
            }
            if self.io.read_buf(&mut self.buffer).await? == 0 {
                if self.buffer.is_empty() {
                    debug!("peer closed stream");
                    return Ok(None);
                }
                return Err(truncated(&self.buffer));
            }
        }
    }

    pub fn into_inner(self) -> T {
        self.io
    }
}

/// Run `session` over `stream` until `done` reports completion.
///
/// Reading and writing proceed together: while emitted frames wait for the
/// peer to make room, inbound frames keep being read and fed to the
/// session, so two peers with large backlogs never stall on each other.
/// Once done, the remaining output is written, the write half is shut down,
/// and inbound frames are discarded until the peer closes too, so the peer
/// can still receive everything sent before completion.
pub async fn drive<S, T>(
    stream: &mut MessageStream<T>,
    session: &mut S,
    done: impl Fn(&S) -> bool,
) -> ProtocolResult<()>
where
    S: Session,
    S::Range: Serialize + DeserializeOwned,
    S::Contents: Serialize + DeserializeOwned,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let MessageStream { io, framing, buffer } = stream;
    let (mut reader, mut writer) = tokio::io::split(io);
    let mut outbox = Vec::new();
    let mut outbound = BytesMut::new();
    let mut complete = false;
    let mut write_closed = false;
    let mut read_closed = false;

    session.start(&mut |m| outbox.push(m))?;
    loop {
        if complete {
            while framing.decode::<S::Range, S::Contents>(buffer)?.is_some() {}
        } else {
            while let Some(msg) = framing.decode(buffer)? {
                session.recv(msg, &mut |m| outbox.push(m))?;
            }
            while session.has_pending() {
                session.send(&mut |m| outbox.push(m))?;
            }
            for msg in outbox.drain(..) {
                framing.encode(&msg, &mut outbound)?;
            }
            if done(session) {
                debug!("session complete, finishing writes");
                complete = true;
            }
        }
        if complete && outbound.is_empty() && !write_closed {
            writer.flush().await?;
            writer.shutdown().await?;
            write_closed = true;
        }
        if write_closed && read_closed {
            return Ok(());
        }

        tokio::select! {
            written = writer.write_buf(&mut outbound), if !outbound.is_empty() => {
                let written = written?;
                trace!(written, pending = outbound.len(), "wrote frames");
                if outbound.is_empty() {
                    writer.flush().await?;
                }
            }
            read = reader.read_buf(&mut *buffer), if !read_closed => {
                if read? == 0 {
                    if !buffer.is_empty() {
                        return Err(truncated(buffer));
                    }
                    if !complete {
                        return Err(ProtocolError::Incomplete);
                    }
                    debug!("peer closed stream");
                    read_closed = true;
                }
            }
            else => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rms_crypto::KeyGenerator;
    use rms_merkle::SparseAccumulator;
    use rms_sync::{
        Dataset, Dedup, MemoryStore, Record, Replica, SessionConfig, SyncSession, Tracked,
    };
    use rms_types::{Hash, LinearRange, Range};
    use std::time::Duration;
    use tokio::io::duplex;

    type LinearReplica = Replica<SparseAccumulator<LinearRange>, MemoryStore<LinearRange>>;
    type LinearMsg = Message<LinearRange, Record<u64>>;
    type Stack = Tracked<Dedup<SyncSession<LinearReplica>>, fn()>;

    fn replica(keys: impl IntoIterator<Item = u64>) -> LinearReplica {
        let mut replica = Replica::new(SparseAccumulator::new(), MemoryStore::new());
        for k in keys {
            replica.insert(Record::new(k, k.to_le_bytes())).unwrap();
        }
        replica
    }

    fn padded(keys: impl IntoIterator<Item = u64>, value: &[u8]) -> LinearReplica {
        let mut replica = Replica::new(SparseAccumulator::new(), MemoryStore::new());
        for k in keys {
            replica.insert(Record::new(k, value.to_vec())).unwrap();
        }
        replica
    }

    fn stack(keys: impl IntoIterator<Item = u64>, config: SessionConfig) -> Stack {
        stack_over(replica(keys), config)
    }

    fn stack_over(replica: LinearReplica, config: SessionConfig) -> Stack {
        let priority = config.priority;
        Tracked::new(
            Dedup::new(SyncSession::new(replica, config), priority),
            (|| {}) as fn(),
        )
    }

    async fn run<T>(mut stream: MessageStream<T>, mut session: Stack) -> LinearReplica
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        drive(&mut stream, &mut session, |s| s.is_complete()).await.unwrap();
        session.into_inner().into_inner().into_dataset()
    }

    #[tokio::test]
    async fn messages_cross_a_stream_in_order() {
        let (left, right) = duplex(1024);
        let mut a = MessageStream::new(left);
        let mut b = MessageStream::new(right);
        let sent: Vec<LinearMsg> = vec![
            Message::Root { range: LinearRange::root(), hash: Hash::ZERO },
            Message::Leaf { contents: Record::new(3, b"three".to_vec()) },
            Message::Ack { range: LinearRange::leaf(&3) },
        ];
        for msg in &sent {
            a.write(msg).await.unwrap();
        }
        a.shutdown().await.unwrap();

        let mut received = Vec::new();
        while let Some(msg) = b.read::<LinearRange, Record<u64>>().await.unwrap() {
            received.push(msg);
        }
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn partial_frame_at_close_is_an_error() {
        let (mut left, right) = duplex(64);
        left.write_all(&[0, 0, 0, 9, 3, 1]).await.unwrap();
        drop(left);
        let mut b = MessageStream::new(right);
        let err = b.read::<LinearRange, Record<u64>>().await.unwrap_err();
        assert!(matches!(err, ProtocolError::FramingError(_)));
    }

    #[tokio::test]
    async fn authenticated_stream_rejects_unsigned_frames() {
        let mut generator = KeyGenerator::new([3; 32]);
        let (alice, bob) = (generator.next_key(), generator.next_key());
        let alice_public = alice.verifying_key();
        let (left, right) = duplex(1024);
        let mut plain = MessageStream::new(left);
        let mut guarded = MessageStream::new(right).authenticated(bob, alice_public);
        assert!(guarded.is_authenticated());

        plain
            .write(&LinearMsg::Ack { range: LinearRange::root() })
            .await
            .unwrap();
        let err = guarded.read::<LinearRange, Record<u64>>().await.unwrap_err();
        assert!(matches!(err, ProtocolError::Unsigned));
    }

    #[tokio::test]
    async fn sessions_converge_over_a_stream() {
        let (left, right) = duplex(64 * 1024);
        let a = tokio::spawn(run(
            MessageStream::new(left),
            stack((0..200).map(|k| k * 7), SessionConfig::initiator()),
        ));
        let b = tokio::spawn(run(
            MessageStream::new(right),
            stack((0..200).map(|k| k * 11), SessionConfig::responder()),
        ));
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!(a.root_hash(), b.root_hash());
        assert_eq!(a.len(), b.len());
        assert_eq!(
            a.leaves(&LinearRange::root(), None, usize::MAX),
            b.leaves(&LinearRange::root(), None, usize::MAX)
        );
    }

    #[tokio::test]
    async fn signed_sessions_converge() {
        let mut generator = KeyGenerator::from_entropy();
        let (alice, bob) = (generator.next_key(), generator.next_key());
        let (alice_public, bob_public) = (alice.verifying_key(), bob.verifying_key());
        let (left, right) = duplex(64 * 1024);
        let a = tokio::spawn(run(
            MessageStream::new(left).authenticated(alice, bob_public),
            stack([1, 2, 3, 1 << 33], SessionConfig::initiator()),
        ));
        let b = tokio::spawn(run(
            MessageStream::new(right).authenticated(bob, alice_public),
            stack([3, 4, u64::MAX], SessionConfig::responder()),
        ));
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!(a.root_hash(), b.root_hash());
        assert_eq!(b.len(), 6);
    }

    #[tokio::test]
    async fn large_backlogs_cross_a_small_pipe() {
        let value = [7u8; 256];
        let evens = padded((0..2000u64).map(|k| k * 2), &value);
        let odds = padded((0..2000u64).map(|k| (1 << 40) + k * 2 + 1), &value);
        let (left, right) = duplex(16 * 1024);
        let a = tokio::spawn(run(
            MessageStream::new(left),
            stack_over(evens, SessionConfig::initiator()),
        ));
        let b = tokio::spawn(run(
            MessageStream::new(right),
            stack_over(odds, SessionConfig::responder()),
        ));
        let (a, b) = tokio::time::timeout(Duration::from_secs(20), async {
            (a.await.unwrap(), b.await.unwrap())
        })
        .await
        .expect("peers stalled on a full pipe");
        assert_eq!(a.root_hash(), b.root_hash());
        assert_eq!(a.len(), 4000);
        assert_eq!(b.len(), 4000);
    }
}
