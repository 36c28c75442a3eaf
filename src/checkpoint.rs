//! Signed checkpoint note.
//!
//! The signing/verifying primitives themselves are an external
//! collaborator; this module only builds and parses the note text and
//! treats `Signer` as a black box behind a trait object.

use async_trait::async_trait;
use thiserror::Error;

use crate::hash::Hash;

/// `sign(bytes) -> signature`, implemented by the caller. Treated as an
/// opaque capability, same boundary as the storage driver.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Human-readable name included in the signature stanza, e.g. an email
    /// or key identifier, matching the note format convention.
    fn name(&self) -> &str;

    async fn sign(&self, message: &[u8]) -> Vec<u8>;
}

/// `verify(bytes, sig) -> bool`, the counterpart consumed when validating
/// a fetched checkpoint (used by the migration copier's caller, not by
/// this crate directly).
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, message: &[u8], signature: &[u8]) -> bool;
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("malformed checkpoint note: {0}")]
    Malformed(String),
}

/// A checkpoint body: `(origin, size, root)`, the part that gets signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub origin: String,
    pub size: u64,
    pub root: Hash,
}

impl Checkpoint {
    /// The text line(s) that get signed: `<origin>\n<size>\n<base64(root)>\n`.
    #[must_use]
    pub fn body(&self) -> String {
        format!("{}\n{}\n{}\n", self.origin, self.size, self.root.to_base64())
    }
}

/// A checkpoint body plus one or more trailing signature stanzas. Multiple
/// signers (primary + witness cosigners) each append one stanza without
/// changing the wire format other subsystems parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedNote {
    pub checkpoint: Checkpoint,
    /// One opaque signature blob per signer, in the order they were asked
    /// to sign.
    pub signatures: Vec<Vec<u8>>,
}

impl SignedNote {
    /// Builds and signs a new checkpoint note with every signer in
    /// `signers`, each appending one signature stanza.
    pub async fn sign(checkpoint: Checkpoint, signers: &[&dyn Signer]) -> Self {
        let body = checkpoint.body();
        let mut signatures = Vec::with_capacity(signers.len());
        for signer in signers {
            signatures.push(signer.sign(body.as_bytes()).await);
        }
        Self { checkpoint, signatures }
    }

    /// Serializes to the on-the-wire note: the body followed by one
    /// base64 signature line per signer.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        use base64::Engine;
        let mut out = self.checkpoint.body().into_bytes();
        for sig in &self.signatures {
            out.extend_from_slice(
                format!("— sig {}\n", base64::engine::general_purpose::STANDARD.encode(sig))
                    .as_bytes(),
            );
        }
        out
    }

    /// Parses a note previously produced by [`Self::to_bytes`].
    ///
    /// # Errors
    /// Returns [`CheckpointError::Malformed`] if the body doesn't have the
    /// three required lines or the root isn't valid base64 of 32 bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, CheckpointError> {
        use base64::Engine;
        let text = std::str::from_utf8(bytes)
            .map_err(|e| CheckpointError::Malformed(e.to_string()))?;
        let mut lines = text.lines();
        let origin = lines
            .next()
            .ok_or_else(|| CheckpointError::Malformed("missing origin line".into()))?
            .to_string();
        let size = lines
            .next()
            .ok_or_else(|| CheckpointError::Malformed("missing size line".into()))?
            .parse::<u64>()
            .map_err(|e| CheckpointError::Malformed(format!("bad size: {e}")))?;
        let root_b64 = lines
            .next()
            .ok_or_else(|| CheckpointError::Malformed("missing root line".into()))?;
        let root_bytes = base64::engine::general_purpose::STANDARD
            .decode(root_b64)
            .map_err(|e| CheckpointError::Malformed(format!("bad root: {e}")))?;
        let root: [u8; 32] = root_bytes
            .try_into()
            .map_err(|_| CheckpointError::Malformed("root is not 32 bytes".into()))?;

        let mut signatures = Vec::new();
        for line in lines {
            if let Some(rest) = line.strip_prefix("— sig ") {
                let sig = base64::engine::general_purpose::STANDARD
                    .decode(rest)
                    .map_err(|e| CheckpointError::Malformed(format!("bad signature: {e}")))?;
                signatures.push(sig);
            }
        }

        Ok(Self {
            checkpoint: Checkpoint {
                origin,
                size,
                root: Hash::from_bytes(root),
            },
            signatures,
        })
    }
}
