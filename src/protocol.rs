//! Wire formats for a file transfer.
//!
//! Two framings share the same TCP stream layout (sender writes, receiver
//! reads, nothing flows back):
//!
//! ## Sentinel
//!
//! Raw file chunks back to back, followed by one chunk holding exactly the
//! 3 ASCII bytes `EOF`. The receiver only recognises the marker when a
//! single read returns those 3 bytes and nothing else, so a file whose
//! final chunk happens to be `EOF` is cut short.
//!
//! ## Framed
//!
//! ```text
//! Data: 0x01 | len: u32 BE | payload[len]
//! End:  0x02 | total: u64 BE
//! ```
//!
//! `total` is the number of payload bytes carried by the preceding data
//! records.

use bytes::{Buf, BufMut, BytesMut};

/// End-of-transfer marker for the sentinel framing.
pub const SENTINEL: &[u8] = b"EOF";

/// Largest payload a single data record may carry.
pub const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

const TAG_DATA: u8 = 0x01;
const TAG_END: u8 = 0x02;

const DATA_HEADER_LEN: usize = 1 + 4;
const END_RECORD_LEN: usize = 1 + 8;

/// True when a received chunk is the sentinel marker.
///
/// Length and content must both match; a read that merely contains or
/// starts with `EOF` is file data.
pub fn is_sentinel(chunk: &[u8]) -> bool {
    chunk == SENTINEL
}

/// A decoded framed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// File payload.
    Data(BytesMut),
    /// Transfer finished after `total` payload bytes.
    End { total: u64 },
}

/// Parse result.
#[derive(Debug)]
pub enum ParseResult {
    /// A full record is buffered; the second field is its encoded length.
    Complete(Record, usize),
    /// Need more data.
    Incomplete,
    /// The stream cannot be decoded.
    Error(FrameError),
}

/// Framing violations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    UnknownTag(u8),
    Oversized(usize),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::UnknownTag(tag) => write!(f, "unknown record tag 0x{tag:02x}"),
            FrameError::Oversized(len) => write!(
                f,
                "record length {len} exceeds limit of {MAX_RECORD_LEN} bytes"
            ),
        }
    }
}

impl std::error::Error for FrameError {}

/// Append a data record carrying `payload` to `output`.
pub fn encode_data(payload: &[u8], output: &mut BytesMut) {
    debug_assert!(payload.len() <= MAX_RECORD_LEN);
    output.reserve(DATA_HEADER_LEN + payload.len());
    output.put_u8(TAG_DATA);
    output.put_u32(payload.len() as u32);
    output.put_slice(payload);
}

/// Append the end record to `output`.
pub fn encode_end(total: u64, output: &mut BytesMut) {
    output.reserve(END_RECORD_LEN);
    output.put_u8(TAG_END);
    output.put_u64(total);
}

/// Parse one record from the front of `input` without consuming it.
pub fn parse(input: &[u8]) -> ParseResult {
    let Some(&tag) = input.first() else {
        return ParseResult::Incomplete;
    };

    match tag {
        TAG_DATA => {
            if input.len() < DATA_HEADER_LEN {
                return ParseResult::Incomplete;
            }
            let len = (&input[1..DATA_HEADER_LEN]).get_u32() as usize;
            if len > MAX_RECORD_LEN {
                return ParseResult::Error(FrameError::Oversized(len));
            }
            let consumed = DATA_HEADER_LEN + len;
            if input.len() < consumed {
                return ParseResult::Incomplete;
            }
            let payload = BytesMut::from(&input[DATA_HEADER_LEN..consumed]);
            ParseResult::Complete(Record::Data(payload), consumed)
        }
        TAG_END => {
            if input.len() < END_RECORD_LEN {
                return ParseResult::Incomplete;
            }
            let total = (&input[1..END_RECORD_LEN]).get_u64();
            ParseResult::Complete(Record::End { total }, END_RECORD_LEN)
        }
        other => ParseResult::Error(FrameError::UnknownTag(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_exact_match_only() {
        assert!(is_sentinel(b"EOF"));
        assert!(!is_sentinel(b"EO"));
        assert!(!is_sentinel(b"EOFX"));
        assert!(!is_sentinel(b"dataEOF"));
        assert!(!is_sentinel(b""));
    }

    #[test]
    fn test_encode_data_layout() {
        let mut out = BytesMut::new();
        encode_data(b"hey", &mut out);
        assert_eq!(&out[..], &[0x01, 0, 0, 0, 3, b'h', b'e', b'y']);
    }

    #[test]
    fn test_encode_end_layout() {
        let mut out = BytesMut::new();
        encode_end(1025, &mut out);
        assert_eq!(&out[..], &[0x02, 0, 0, 0, 0, 0, 0, 0x04, 0x01]);
    }

    #[test]
    fn test_parse_data_then_end() {
        let mut out = BytesMut::new();
        encode_data(b"EOF", &mut out);
        encode_end(3, &mut out);

        match parse(&out) {
            ParseResult::Complete(Record::Data(payload), 8) => assert_eq!(&payload[..], b"EOF"),
            other => panic!("unexpected: {:?}", other),
        }
        match parse(&out[8..]) {
            ParseResult::Complete(Record::End { total: 3 }, 9) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_incomplete() {
        let mut out = BytesMut::new();
        encode_data(b"payload", &mut out);

        for cut in [0, 1, 4, 5, out.len() - 1] {
            match parse(&out[..cut]) {
                ParseResult::Incomplete => {}
                other => panic!("cut {cut}: unexpected: {:?}", other),
            }
        }
        match parse(&[TAG_END, 0, 0]) {
            ParseResult::Incomplete => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_empty_data_record() {
        match parse(&[TAG_DATA, 0, 0, 0, 0]) {
            ParseResult::Complete(Record::Data(payload), 5) => assert!(payload.is_empty()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tag() {
        match parse(b"EOF") {
            ParseResult::Error(FrameError::UnknownTag(b'E')) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_oversized_length() {
        let mut input = vec![TAG_DATA];
        input.extend_from_slice(&(MAX_RECORD_LEN as u32 + 1).to_be_bytes());
        match parse(&input) {
            ParseResult::Error(FrameError::Oversized(len)) => assert_eq!(len, MAX_RECORD_LEN + 1),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
