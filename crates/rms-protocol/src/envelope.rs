use rms_crypto::{Signature, SignatureKind, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ProtocolError, ProtocolResult};

pub const PROTOCOL_VERSION: u32 = 1;

/// A payload signed by its sender.
///
/// The signature covers the protocol version, the signature kind and the
/// payload, so none of them can be swapped without detection. Receivers
/// must call [`open`](Self::open) or [`open_from`](Self::open_from) before
/// trusting the payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub version: u32,
    pub kind: u8,
    pub signer: [u8; 32],
    pub signature: Signature,
    pub payload: Vec<u8>,
}

fn signed_bytes(version: u32, kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.extend_from_slice(&version.to_be_bytes());
    buf.push(kind);
    buf.extend_from_slice(payload);
    buf
}

impl SignedEnvelope {
    /// Sign `payload` with `key`.
    pub fn seal(payload: Vec<u8>, key: &SigningKey) -> Self {
        let kind = key.kind().tag();
        let signature = key.sign(&signed_bytes(PROTOCOL_VERSION, kind, &payload));
        Self {
            version: PROTOCOL_VERSION,
            kind,
            signer: key.verifying_key().as_bytes(),
            signature,
            payload,
        }
    }

    /// Verify the signature against the embedded signer and return the
    /// payload.
    pub fn open(&self) -> ProtocolResult<&[u8]> {
        if self.version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: self.version,
            });
        }
        match SignatureKind::from_tag(self.kind)? {
            SignatureKind::Ed25519 => {
                let key = self.signer()?;
                key.verify(
                    &signed_bytes(self.version, self.kind, &self.payload),
                    &self.signature,
                )
                .inspect_err(|_| warn!(signer = ?key, "rejecting envelope with bad signature"))?;
            }
        }
        Ok(&self.payload)
    }

    /// Like [`open`](Self::open), but also require the envelope to come from
    /// `expected`.
    pub fn open_from(&self, expected: &VerifyingKey) -> ProtocolResult<&[u8]> {
        if self.signer != expected.as_bytes() {
            return Err(ProtocolError::UnexpectedSigner);
        }
        self.open()
    }

    /// The key that claims to have signed this envelope. Unverified.
    pub fn signer(&self) -> ProtocolResult<VerifyingKey> {
        Ok(VerifyingKey::from_bytes(self.signer)?)
    }

    pub fn to_bytes(&self) -> ProtocolResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> ProtocolResult<Self> {
        bincode::deserialize(data).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}
