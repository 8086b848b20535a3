//! Serialized cache image format.
//!
//! A cache image is the portable byte layout used to carry a runtime cache
//! across sessions. It is an interoperability contract, so the layout is
//! written by hand, little-endian, with no padding:
//!
//! ```text
//! ImageHeader { magic: u32, entry_count: u64 }          // 12 bytes
//! repeated entry_count times, back to back:
//!   key: 16 bytes | payload_len: u64 | payload bytes
//! ```
//!
//! Only committed (`Ready`) entries appear in an image, each key at most
//! once, sorted by key so that equal caches serialize to identical bytes.

use std::sync::Arc;

use prism_common::CacheKey;

use crate::error::CacheError;

/// Magic/version word at the start of every cache image, `b"PRC1"` on the
/// wire. Bump the trailing digit on breaking layout changes.
pub const IMAGE_MAGIC: u32 = u32::from_le_bytes(*b"PRC1");

/// Fixed per-record framing: 16-byte key plus 8-byte payload length.
pub const RECORD_OVERHEAD: usize = CacheKey::SIZE + 8;

/// Fixed-size record at the start of a serialized cache image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    /// Format magic/version; must equal [`IMAGE_MAGIC`].
    pub magic: u32,

    /// Number of entry records following the header.
    pub entry_count: u64,
}

impl ImageHeader {
    /// Encoded size of the header in bytes.
    pub const SIZE: usize = 12;

    /// Creates a header for an image with the given entry count.
    pub fn new(entry_count: u64) -> Self {
        Self {
            magic: IMAGE_MAGIC,
            entry_count,
        }
    }

    /// Writes the header into the first [`Self::SIZE`] bytes of `buffer`.
    pub fn encode_into(&self, buffer: &mut [u8]) {
        buffer[..4].copy_from_slice(&self.magic.to_le_bytes());
        buffer[4..Self::SIZE].copy_from_slice(&self.entry_count.to_le_bytes());
    }

    /// Decodes and validates a header from the start of `image`.
    pub fn decode(image: &[u8]) -> Result<Self, CacheError> {
        if image.len() < Self::SIZE {
            return Err(corrupt("truncated header"));
        }
        let magic = u32::from_le_bytes(image[..4].try_into().map_err(|_| corrupt("bad magic field"))?);
        if magic != IMAGE_MAGIC {
            return Err(corrupt(&format!("bad magic {magic:#010x}")));
        }
        let entry_count =
            u64::from_le_bytes(image[4..Self::SIZE].try_into().map_err(|_| corrupt("bad count field"))?);
        Ok(Self { magic, entry_count })
    }
}

/// Returns the exact encoded size of an image holding payloads of the given
/// lengths.
pub(crate) fn encoded_size<I>(payload_lens: I) -> usize
where
    I: IntoIterator<Item = usize>,
{
    ImageHeader::SIZE
        + payload_lens
            .into_iter()
            .map(|len| RECORD_OVERHEAD + len)
            .sum::<usize>()
}

/// Encodes `entries` into `buffer`. The buffer must already be sized via
/// [`encoded_size`]; the caller performs the all-or-nothing size check.
pub(crate) fn encode(buffer: &mut [u8], entries: &[(CacheKey, Arc<[u8]>)]) {
    ImageHeader::new(entries.len() as u64).encode_into(buffer);
    let mut offset = ImageHeader::SIZE;
    for (key, payload) in entries {
        buffer[offset..offset + CacheKey::SIZE].copy_from_slice(key.as_bytes());
        offset += CacheKey::SIZE;
        buffer[offset..offset + 8].copy_from_slice(&(payload.len() as u64).to_le_bytes());
        offset += 8;
        buffer[offset..offset + payload.len()].copy_from_slice(payload);
        offset += payload.len();
    }
}

/// Decodes a full image into `(key, payload)` records, validating framing.
///
/// Rejection is all-or-nothing: any truncation, bad magic, or trailing bytes
/// fails the whole image.
pub(crate) fn decode(image: &[u8]) -> Result<Vec<(CacheKey, &[u8])>, CacheError> {
    let header = ImageHeader::decode(image)?;
    let mut offset = ImageHeader::SIZE;
    let mut records = Vec::new();
    for _ in 0..header.entry_count {
        if image.len() < offset + RECORD_OVERHEAD {
            return Err(corrupt("truncated record framing"));
        }
        let key_bytes: [u8; CacheKey::SIZE] = image[offset..offset + CacheKey::SIZE]
            .try_into()
            .map_err(|_| corrupt("bad key field"))?;
        offset += CacheKey::SIZE;
        let len_bytes: [u8; 8] = image[offset..offset + 8]
            .try_into()
            .map_err(|_| corrupt("bad length field"))?;
        offset += 8;
        let len = u64::from_le_bytes(len_bytes) as usize;
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= image.len())
            .ok_or_else(|| corrupt("truncated payload"))?;
        records.push((CacheKey::from_bytes(key_bytes), &image[offset..end]));
        offset = end;
    }
    if offset != image.len() {
        return Err(corrupt("trailing bytes after last record"));
    }
    Ok(records)
}

fn corrupt(reason: &str) -> CacheError {
    CacheError::CorruptImage {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key_seed: u32, payload: &[u8]) -> (CacheKey, Arc<[u8]>) {
        (CacheKey::from_dwords(key_seed, 0, 0, 0), Arc::from(payload))
    }

    #[test]
    fn header_roundtrip() {
        let header = ImageHeader::new(42);
        let mut buf = [0u8; ImageHeader::SIZE];
        header.encode_into(&mut buf);
        let back = ImageHeader::decode(&buf).unwrap();
        assert_eq!(back, header);
    }

    #[test]
    fn header_rejects_bad_magic() {
        let mut buf = [0u8; ImageHeader::SIZE];
        ImageHeader::new(0).encode_into(&mut buf);
        buf[0] ^= 0xff;
        assert!(matches!(
            ImageHeader::decode(&buf),
            Err(CacheError::CorruptImage { .. })
        ));
    }

    #[test]
    fn header_rejects_truncation() {
        assert!(matches!(
            ImageHeader::decode(&[0u8; 4]),
            Err(CacheError::CorruptImage { .. })
        ));
    }

    #[test]
    fn empty_image_is_header_only() {
        assert_eq!(encoded_size(std::iter::empty()), ImageHeader::SIZE);
        let mut buf = vec![0u8; ImageHeader::SIZE];
        encode(&mut buf, &[]);
        let records = decode(&buf).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn encode_decode_roundtrip() {
        let entries = vec![entry(1, b"vertex binary"), entry(2, b"fragment binary")];
        let size = encoded_size(entries.iter().map(|(_, p)| p.len()));
        let mut buf = vec![0u8; size];
        encode(&mut buf, &entries);

        let records = decode(&buf).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, entries[0].0);
        assert_eq!(records[0].1, b"vertex binary");
        assert_eq!(records[1].1, b"fragment binary");
    }

    #[test]
    fn size_matches_layout_formula() {
        let entries = vec![entry(1, &[0u8; 64])];
        let size = encoded_size(entries.iter().map(|(_, p)| p.len()));
        assert_eq!(size, ImageHeader::SIZE + CacheKey::SIZE + 8 + 64);
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let entries = vec![entry(1, b"some payload")];
        let size = encoded_size(entries.iter().map(|(_, p)| p.len()));
        let mut buf = vec![0u8; size];
        encode(&mut buf, &entries);
        buf.truncate(size - 3);
        assert!(matches!(
            decode(&buf),
            Err(CacheError::CorruptImage { .. })
        ));
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut buf = vec![0u8; ImageHeader::SIZE];
        encode(&mut buf, &[]);
        buf.push(0);
        assert!(matches!(
            decode(&buf),
            Err(CacheError::CorruptImage { .. })
        ));
    }

    #[test]
    fn decode_rejects_absurd_count() {
        // Claims u64::MAX records but carries none.
        let mut buf = vec![0u8; ImageHeader::SIZE];
        ImageHeader::new(u64::MAX).encode_into(&mut buf);
        assert!(matches!(
            decode(&buf),
            Err(CacheError::CorruptImage { .. })
        ));
    }

    #[test]
    fn zero_length_payload_roundtrips() {
        let entries = vec![entry(7, b"")];
        let size = encoded_size(entries.iter().map(|(_, p)| p.len()));
        let mut buf = vec![0u8; size];
        encode(&mut buf, &entries);
        let records = decode(&buf).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].1.is_empty());
    }
}
