//! Binary record format for [`BlobAttributes`].
//!
//! ```text
//! [4 bytes: magic "CSKA"]
//! [2 bytes: format version (big-endian u16)]
//! [4 bytes: body length (big-endian u32)]
//! [N bytes: body]
//! [4 bytes: CRC32 of body (big-endian u32)]
//!
//! body:
//!   state          u8
//!   created_ms     i64
//!   content_size   u64
//!   sha1           opt-string
//!   header count   u32, then (key string, value opt-string)*
//!   ext count      u16, then (tag u16, len u32, bytes)*
//!
//! string     = u32 length + UTF-8
//! opt-string = u8 presence (0/1) + string when present
//! ```
//!
//! Optional fields added after version 1 travel as tagged extensions;
//! readers skip tags they do not know.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use cask_types::{BlobMetrics, Headers, LifecycleState};

use crate::attributes::BlobAttributes;
use crate::error::{MetadataError, MetadataResult};

/// Magic bytes opening every record.
pub const RECORD_MAGIC: &[u8; 4] = b"CSKA";
/// Current record format version.
pub const RECORD_VERSION: u16 = 1;

const PREAMBLE_SIZE: usize = 4 + 2 + 4;
const CHECKSUM_SIZE: usize = 4;

const EXT_DELETED_REASON: u16 = 1;
const EXT_DELETED_AT: u16 = 2;

/// Serialize attributes into a framed record.
pub fn encode(attributes: &BlobAttributes) -> Bytes {
    let mut body = BytesMut::with_capacity(128);
    body.put_u8(attributes.state.as_u8());
    body.put_i64(attributes.metrics.created_ms);
    body.put_u64(attributes.metrics.content_size);
    put_opt_string(&mut body, attributes.metrics.sha1.as_deref());

    body.put_u32(attributes.headers.len() as u32);
    for (key, value) in attributes.headers.iter() {
        put_string(&mut body, key);
        put_opt_string(&mut body, value);
    }

    let mut extensions: Vec<(u16, Vec<u8>)> = Vec::new();
    if let Some(reason) = &attributes.deleted_reason {
        extensions.push((EXT_DELETED_REASON, reason.as_bytes().to_vec()));
    }
    if let Some(at) = attributes.deleted_at_ms {
        extensions.push((EXT_DELETED_AT, at.to_be_bytes().to_vec()));
    }
    body.put_u16(extensions.len() as u16);
    for (tag, data) in &extensions {
        body.put_u16(*tag);
        body.put_u32(data.len() as u32);
        body.put_slice(data);
    }

    let mut out = BytesMut::with_capacity(PREAMBLE_SIZE + body.len() + CHECKSUM_SIZE);
    out.put_slice(RECORD_MAGIC);
    out.put_u16(RECORD_VERSION);
    out.put_u32(body.len() as u32);
    out.put_slice(&body);
    out.put_u32(crc32fast::hash(&body));
    out.freeze()
}

/// Parse a framed record.
pub fn decode(data: &[u8]) -> MetadataResult<BlobAttributes> {
    if data.len() < PREAMBLE_SIZE + CHECKSUM_SIZE {
        return Err(MetadataError::Corrupt(format!(
            "record too short: {} bytes",
            data.len()
        )));
    }
    let mut buf = data;
    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if &magic != RECORD_MAGIC {
        return Err(MetadataError::BadMagic(magic));
    }
    let version = buf.get_u16();
    if version == 0 || version > RECORD_VERSION {
        return Err(MetadataError::UnsupportedVersion(version));
    }
    let body_len = buf.get_u32() as usize;
    if buf.remaining() != body_len + CHECKSUM_SIZE {
        return Err(MetadataError::Corrupt(format!(
            "body length {body_len} does not match record size {}",
            data.len()
        )));
    }
    let (body, mut tail) = buf.split_at(body_len);
    let expected = tail.get_u32();
    let computed = crc32fast::hash(body);
    if expected != computed {
        return Err(MetadataError::ChecksumMismatch { expected, computed });
    }

    let mut body = body;
    need(&body, 1 + 8 + 8)?;
    let state = LifecycleState::from_u8(body.get_u8())?;
    let created_ms = body.get_i64();
    let content_size = body.get_u64();
    let sha1 = get_opt_string(&mut body)?;

    need(&body, 4)?;
    let header_count = body.get_u32();
    let mut headers = Headers::new();
    for _ in 0..header_count {
        let key = get_string(&mut body)?;
        match get_opt_string(&mut body)? {
            Some(value) => headers.insert(key, value),
            None => headers.insert_null(key),
        }
    }

    let mut attributes = BlobAttributes {
        headers,
        state,
        metrics: BlobMetrics::new(created_ms, sha1, content_size),
        deleted_reason: None,
        deleted_at_ms: None,
    };

    need(&body, 2)?;
    let ext_count = body.get_u16();
    for _ in 0..ext_count {
        need(&body, 2 + 4)?;
        let tag = body.get_u16();
        let len = body.get_u32() as usize;
        need(&body, len)?;
        let mut data = body.copy_to_bytes(len);
        match tag {
            EXT_DELETED_REASON => {
                attributes.deleted_reason = Some(utf8(data.to_vec())?);
            }
            EXT_DELETED_AT => {
                if data.len() != 8 {
                    return Err(MetadataError::Corrupt("deleted-at must be 8 bytes".into()));
                }
                attributes.deleted_at_ms = Some(data.get_i64());
            }
            _ => {}
        }
    }

    if body.has_remaining() {
        return Err(MetadataError::Corrupt(format!(
            "{} trailing bytes in record body",
            body.remaining()
        )));
    }
    Ok(attributes)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_opt_string(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.put_u8(1);
            put_string(buf, s);
        }
        None => buf.put_u8(0),
    }
}

fn utf8(bytes: Vec<u8>) -> MetadataResult<String> {
    String::from_utf8(bytes).map_err(|e| MetadataError::Corrupt(format!("invalid UTF-8: {e}")))
}

/// `Buf` getters panic on underflow; check first.
fn need(buf: &impl Buf, n: usize) -> MetadataResult<()> {
    if buf.remaining() < n {
        return Err(MetadataError::Corrupt(format!(
            "needed {n} bytes, {} remaining",
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_string(buf: &mut &[u8]) -> MetadataResult<String> {
    need(&*buf, 4)?;
    let len = buf.get_u32() as usize;
    need(&*buf, len)?;
    utf8(buf.copy_to_bytes(len).to_vec())
}

fn get_opt_string(buf: &mut &[u8]) -> MetadataResult<Option<String>> {
    need(&*buf, 1)?;
    match buf.get_u8() {
        0 => Ok(None),
        1 => Ok(Some(get_string(buf)?)),
        other => Err(MetadataError::Corrupt(format!(
            "invalid presence flag {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cask_types::{BLOB_NAME_HEADER, CREATED_BY_HEADER};
    use proptest::prelude::*;

    fn sample() -> BlobAttributes {
        let mut headers = Headers::new()
            .with(CREATED_BY_HEADER, "test")
            .with(BLOB_NAME_HEADER, "test/randomData.bin");
        headers.insert_null("foo");
        BlobAttributes::new(
            headers,
            BlobMetrics::new(1_700_000_000_000, Some("da39a3ee".into()), 10),
        )
        .with_state(LifecycleState::Alive)
    }

    #[test]
    fn roundtrip_with_null_header() {
        let attrs = sample();
        let decoded = decode(&encode(&attrs)).unwrap();
        assert_eq!(decoded, attrs);
        assert!(decoded.headers.contains_key("foo"));
        assert_eq!(decoded.headers.get("foo"), None);
    }

    #[test]
    fn roundtrip_zero_metrics() {
        let attrs = BlobAttributes::new(Headers::new(), BlobMetrics::default());
        let decoded = decode(&encode(&attrs)).unwrap();
        assert_eq!(decoded, attrs);
        assert_eq!(decoded.metrics.sha1, None);
    }

    #[test]
    fn encoding_is_byte_stable() {
        let mut attrs = sample();
        attrs.mark_deleted("gone");
        let first = encode(&attrs);
        let second = encode(&decode(&first).unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn detects_corruption() {
        let mut bytes = encode(&sample()).to_vec();
        let mid = PREAMBLE_SIZE + 3;
        bytes[mid] ^= 0xFF;
        assert!(matches!(
            decode(&bytes),
            Err(MetadataError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn rejects_bad_magic_and_future_version() {
        let mut bytes = encode(&sample()).to_vec();
        bytes[0] = b'X';
        assert!(matches!(decode(&bytes), Err(MetadataError::BadMagic(_))));

        let mut bytes = encode(&sample()).to_vec();
        bytes[5] = 99;
        assert!(matches!(
            decode(&bytes),
            Err(MetadataError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn rejects_truncated_record() {
        let bytes = encode(&sample());
        assert!(decode(&bytes[..bytes.len() - 1]).is_err());
        assert!(decode(&bytes[..3]).is_err());
    }

    #[test]
    fn short_body_with_valid_checksum_is_corrupt() {
        // Declares five headers, then ends.
        let mut body = BytesMut::new();
        body.put_u8(LifecycleState::Alive.as_u8());
        body.put_i64(0);
        body.put_u64(0);
        body.put_u8(0);
        body.put_u32(5);

        let mut record = BytesMut::new();
        record.put_slice(RECORD_MAGIC);
        record.put_u16(RECORD_VERSION);
        record.put_u32(body.len() as u32);
        record.put_slice(&body);
        record.put_u32(crc32fast::hash(&body));

        assert!(matches!(decode(&record), Err(MetadataError::Corrupt(_))));
    }

    #[test]
    fn skips_unknown_extensions() {
        let attrs = sample();
        let bytes = encode(&attrs);
        // Rebuild the record with one extra extension tag appended.
        let body_len = u32::from_be_bytes(bytes[6..10].try_into().unwrap()) as usize;
        let mut body = bytes[PREAMBLE_SIZE..PREAMBLE_SIZE + body_len].to_vec();
        let ext_pos = body.len() - 2;
        body[ext_pos..].copy_from_slice(&1u16.to_be_bytes());
        body.extend_from_slice(&0x7777u16.to_be_bytes());
        body.extend_from_slice(&3u32.to_be_bytes());
        body.extend_from_slice(b"new");

        let mut record = Vec::new();
        record.extend_from_slice(RECORD_MAGIC);
        record.extend_from_slice(&RECORD_VERSION.to_be_bytes());
        record.extend_from_slice(&(body.len() as u32).to_be_bytes());
        record.extend_from_slice(&body);
        record.extend_from_slice(&crc32fast::hash(&body).to_be_bytes());

        assert_eq!(decode(&record).unwrap(), attrs);
    }

    fn arb_state() -> impl Strategy<Value = LifecycleState> {
        prop_oneof![
            Just(LifecycleState::Creating),
            Just(LifecycleState::Alive),
            Just(LifecycleState::MarkedForDeletion),
        ]
    }

    proptest! {
        #[test]
        fn roundtrip_arbitrary_attributes(
            state in arb_state(),
            created_ms in any::<i64>(),
            size in any::<u64>(),
            sha1 in proptest::option::of("[0-9a-f]{40}"),
            headers in proptest::collection::btree_map(".{0,16}", proptest::option::of(".{0,32}"), 0..8),
            reason in proptest::option::of(".{0,24}"),
            deleted_at in proptest::option::of(any::<i64>()),
        ) {
            let mut h = Headers::new();
            h.extend(headers);
            let attrs = BlobAttributes {
                headers: h,
                state,
                metrics: BlobMetrics::new(created_ms, sha1, size),
                deleted_reason: reason,
                deleted_at_ms: deleted_at,
            };
            let decoded = decode(&encode(&attrs)).unwrap();
            prop_assert_eq!(decoded, attrs);
        }
    }
}
