//! Entry bundle model and writer.
//!
//! A bundle packs up to [`crate::layout::TILE_WIDTH`] leaves into one
//! object, entries concatenated in leaf-index order with a two-byte
//! big-endian length prefix per entry.

use thiserror::Error;

use crate::layout::{bundle_partial_size, BundleAddress};

#[derive(Debug, Clone, Error)]
pub enum BundleError {
    #[error("entry of length {0} exceeds the 65535-byte length-prefix limit")]
    EntryTooLarge(usize),
    #[error("truncated bundle: expected {expected} more bytes for length prefix")]
    TruncatedLengthPrefix { expected: usize },
    #[error("truncated bundle: entry claims {claimed} bytes but only {available} remain")]
    TruncatedEntry { claimed: usize, available: usize },
}

/// Serializes a sequence of leaf entries (in index order) into bundle bytes.
///
/// # Errors
/// Returns [`BundleError::EntryTooLarge`] if any entry exceeds 65535 bytes
/// (the two-byte length prefix cannot address longer entries).
pub fn encode_bundle<'a>(entries: impl IntoIterator<Item = &'a [u8]>) -> Result<Vec<u8>, BundleError> {
    let mut out = Vec::new();
    for entry in entries {
        if entry.len() > u16::MAX as usize {
            return Err(BundleError::EntryTooLarge(entry.len()));
        }
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(entry.len() as u16).to_be_bytes());
        out.extend_from_slice(entry);
    }
    Ok(out)
}

/// Parses bundle bytes back into entries, in the order they were written.
///
/// # Errors
/// Returns a [`BundleError`] if the bytes are truncated mid-entry.
pub fn decode_bundle(bytes: &[u8]) -> Result<Vec<Vec<u8>>, BundleError> {
    let mut entries = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        if bytes.len() - pos < 2 {
            return Err(BundleError::TruncatedLengthPrefix { expected: 2 - (bytes.len() - pos) });
        }
        let len = u16::from_be_bytes([bytes[pos], bytes[pos + 1]]) as usize;
        pos += 2;
        if bytes.len() - pos < len {
            return Err(BundleError::TruncatedEntry {
                claimed: len,
                available: bytes.len() - pos,
            });
        }
        entries.push(bytes[pos..pos + len].to_vec());
        pos += len;
    }
    Ok(entries)
}

/// Given the previous contents of a (possibly empty) bundle and the new
/// leaves landing in it, produces the new bundle bytes plus the `partial`
/// count to write it under: `0` once it reaches
/// [`crate::layout::TILE_WIDTH`] leaves, else the running count.
///
/// # Errors
/// Propagates [`BundleError`] from decoding the previous bundle or encoding
/// the combined entries.
pub fn append_to_bundle(
    existing: Option<&[u8]>,
    new_leaves: &[&[u8]],
) -> Result<Vec<u8>, BundleError> {
    let mut entries: Vec<Vec<u8>> = match existing {
        Some(bytes) => decode_bundle(bytes)?,
        None => Vec::new(),
    };
    entries.extend(new_leaves.iter().map(|e| e.to_vec()));
    let refs: Vec<&[u8]> = entries.iter().map(Vec::as_slice).collect();
    encode_bundle(refs)
}

/// `partial` count to publish a freshly written bundle under: `0` if it now
/// holds a full [`crate::layout::TILE_WIDTH`] leaves, else the leaf count.
#[must_use]
pub fn bundle_partial_for(address: BundleAddress, tree_size_after: u64) -> u64 {
    bundle_partial_size(address.bundle_index, tree_size_after)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_entries() {
        let entries: Vec<&[u8]> = vec![b"hello", b"", b"world!!"];
        let encoded = encode_bundle(entries.clone()).unwrap();
        let decoded = decode_bundle(&encoded).unwrap();
        assert_eq!(decoded, entries.iter().map(|e| e.to_vec()).collect::<Vec<_>>());
    }

    #[test]
    fn rejects_oversized_entry() {
        let big = vec![0u8; u16::MAX as usize + 1];
        let entries: Vec<&[u8]> = vec![&big];
        assert!(matches!(
            encode_bundle(entries),
            Err(BundleError::EntryTooLarge(_))
        ));
    }

    #[test]
    fn rejects_truncated_bytes() {
        let bytes = [0u8, 5, b'h', b'i']; // claims 5 bytes, has 2
        assert!(matches!(
            decode_bundle(&bytes),
            Err(BundleError::TruncatedEntry { .. })
        ));
    }

    #[test]
    fn s1_single_entry_bundle_matches_length_prefix() {
        let encoded = encode_bundle(vec![b"hello".as_slice()]).unwrap();
        assert_eq!(encoded, [0u8, 5, b'h', b'e', b'l', b'l', b'o']);
    }
}
