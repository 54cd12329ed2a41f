//! On-Disk Frame Codec
//!
//! Every message is persisted as one self-delimiting frame. Two profiles
//! share the same fence header and are distinguished by the byte that
//! follows it, so a reader needs no mode flag:
//!
//! ```text
//! minimal:    <8-hex length><json-metadata>\n<body>\n
//! integrity:  <8-hex length>:<64-hex sha>:<json-metadata>\n<body>\n
//! ```
//!
//! `length` is the zero-padded hex byte count of metadata + body + the two
//! newline terminators. An 8-hex length caps a single message at 4 GiB and
//! makes frames self-synchronizing by scanning. The sha sits in the header
//! (not in the metadata JSON) so chain verification can walk a segment
//! without parsing any JSON.
//!
//! This module is pure byte-level codec; file IO and seeking live in the
//! storage crate.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::message::{Message, Metadata, Sha};

/// Bytes in the hex length fence.
pub const LEN_HEX: usize = 8;

/// Bytes in the hex sha of an integrity-profile header.
pub const SHA_HEX: usize = 64;

/// Encode a message into a complete frame.
///
/// The sha goes into the header when the message carries one; callers in
/// integrity mode are expected to have set it via [`Message::chain`].
pub fn encode(m: &Message) -> Result<Vec<u8>> {
    let meta = serde_json::to_vec(&m.metadata())?;
    let content_len = meta.len() + 1 + m.body.len() + 1;
    if content_len > u32::MAX as usize {
        return Err(Error::BadLength);
    }
    let mut out = Vec::with_capacity(LEN_HEX + SHA_HEX + 2 + content_len);
    match m.sha {
        Some(sha) => {
            out.extend_from_slice(format!("{:08x}:{}:", content_len, sha.to_hex()).as_bytes())
        }
        None => out.extend_from_slice(format!("{:08x}", content_len).as_bytes()),
    }
    out.extend_from_slice(&meta);
    out.push(b'\n');
    out.extend_from_slice(&m.body);
    out.push(b'\n');
    Ok(out)
}

/// Parse the 8-hex length fence.
pub fn parse_len(fence: &[u8]) -> Result<u64> {
    if fence.len() != LEN_HEX {
        return Err(Error::BadLength);
    }
    let s = std::str::from_utf8(fence).map_err(|_| Error::BadLength)?;
    u64::from_str_radix(s, 16).map_err(|_| Error::BadLength)
}

/// Split frame content into its raw `(metadata, body)` slices.
///
/// Chain verification hashes these slices directly, which is why they are
/// exposed separately from [`decode_content`].
pub fn split_content(content: &[u8]) -> Result<(&[u8], &[u8])> {
    let nl = content
        .iter()
        .position(|&b| b == b'\n')
        .ok_or(Error::MissingMetaTerminator)?;
    let meta = &content[..nl];
    let rest = &content[nl + 1..];
    if rest.last() != Some(&b'\n') {
        return Err(Error::MissingBodyTerminator);
    }
    Ok((meta, &rest[..rest.len() - 1]))
}

/// Decode frame content (the bytes counted by the fence) into a message.
pub fn decode_content(content: &[u8], sha: Option<Sha>) -> Result<Message> {
    let (meta, body) = split_content(content)?;
    let meta: Metadata = serde_json::from_slice(meta)?;
    Ok(Message {
        id: meta.id,
        ts: meta.ts,
        content_type: meta.content_type,
        body: Bytes::copy_from_slice(body),
        sha,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(id: u64, body: &str) -> Message {
        Message {
            id,
            ts: Utc::now(),
            content_type: "text/plain".to_string(),
            body: Bytes::copy_from_slice(body.as_bytes()),
            sha: None,
        }
    }

    #[test]
    fn test_minimal_frame_layout() {
        let m = sample(7, "foo");
        let frame = encode(&m).unwrap();

        let len = parse_len(&frame[..LEN_HEX]).unwrap() as usize;
        assert_eq!(len, frame.len() - LEN_HEX);
        assert_eq!(frame[LEN_HEX], b'{');
        assert_eq!(*frame.last().unwrap(), b'\n');
    }

    #[test]
    fn test_integrity_frame_layout() {
        let mut m = sample(0, "foo");
        m.sha = Some(m.chain(&Sha::ZERO).unwrap());
        let frame = encode(&m).unwrap();

        let len = parse_len(&frame[..LEN_HEX]).unwrap() as usize;
        assert_eq!(frame[LEN_HEX], b':');
        let sha = Sha::from_hex(&frame[LEN_HEX + 1..LEN_HEX + 1 + SHA_HEX]).unwrap();
        assert_eq!(Some(sha), m.sha);
        assert_eq!(frame[LEN_HEX + 1 + SHA_HEX], b':');
        assert_eq!(len, frame.len() - (LEN_HEX + SHA_HEX + 2));
    }

    #[test]
    fn test_roundtrip_minimal() {
        let m = sample(42, "hello world");
        let frame = encode(&m).unwrap();
        let decoded = decode_content(&frame[LEN_HEX..], None).unwrap();
        assert_eq!(decoded.id, 42);
        assert_eq!(decoded.content_type, "text/plain");
        assert_eq!(decoded.body, m.body);
        assert_eq!(decoded.ts, m.ts);
    }

    #[test]
    fn test_roundtrip_integrity() {
        let mut m = sample(0, "chained");
        m.sha = Some(m.chain(&Sha::ZERO).unwrap());
        let frame = encode(&m).unwrap();
        let content = &frame[LEN_HEX + SHA_HEX + 2..];
        let sha = Sha::from_hex(&frame[LEN_HEX + 1..LEN_HEX + 1 + SHA_HEX]).unwrap();
        let decoded = decode_content(content, Some(sha)).unwrap();
        assert_eq!(decoded.body, m.body);
        assert_eq!(decoded.sha, m.sha);
    }

    #[test]
    fn test_roundtrip_empty_body() {
        let m = sample(0, "");
        let frame = encode(&m).unwrap();
        let decoded = decode_content(&frame[LEN_HEX..], None).unwrap();
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn test_roundtrip_body_with_newlines() {
        // newlines in the body must not confuse the metadata split
        let m = sample(1, "line1\nline2\n");
        let frame = encode(&m).unwrap();
        let decoded = decode_content(&frame[LEN_HEX..], None).unwrap();
        assert_eq!(decoded.body, Bytes::from("line1\nline2\n"));
    }

    #[test]
    fn test_split_content_raw_slices() {
        let m = sample(5, "abc");
        let frame = encode(&m).unwrap();
        let (meta, body) = split_content(&frame[LEN_HEX..]).unwrap();
        assert_eq!(body, b"abc");
        let parsed: crate::message::Metadata = serde_json::from_slice(meta).unwrap();
        assert_eq!(parsed.id, 5);
    }

    #[test]
    fn test_parse_len_rejects_garbage() {
        assert!(parse_len(b"zzzzzzzz").is_err());
        assert!(parse_len(b"123").is_err());
    }

    #[test]
    fn test_decode_rejects_truncated_content() {
        let m = sample(9, "foo");
        let frame = encode(&m).unwrap();
        // drop the trailing newline: torn tail
        let content = &frame[LEN_HEX..frame.len() - 1];
        assert!(decode_content(content, None).is_err());
    }

    #[test]
    fn test_decode_rejects_missing_meta_newline() {
        assert!(decode_content(b"{\"id\":0}", None).is_err());
    }
}
