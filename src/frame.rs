//! On-disk frame codec: `length | magic | crc32 | payload`.
//!
//! One frame encodes exactly one message. Frames are written back to back
//! with no inter-frame padding, so a segment file is just a concatenation of
//! [`encode`] outputs.

use bytes::Bytes;

use crate::error::DecodeError;

/// Format version written to every frame's `magic` byte. Any other value read
/// back is a hard error.
pub const MAGIC: u8 = 0;

/// Total on-disk bytes occupied by a frame's header: `length` (4) + `magic`
/// (1) + `crc32` (4).
pub const HEADER_LEN: usize = 4 + 1 + 4;

/// Minimum valid value of the on-disk `length` field. The field does not
/// count its own 4 bytes, only `magic` (1) + `crc32` (4); an empty payload
/// therefore still yields a `length` of 5.
pub const MIN_LENGTH: u32 = 5;

/// Upper bound on a frame's declared length, guarding against a corrupt or
/// adversarial length field turning a bad read into an unbounded allocation.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Encode `payload` as a single on-disk frame.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let length = MIN_LENGTH + payload.len() as u32;
    let crc = crc32fast::hash(payload);

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.push(MAGIC);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Validate a frame's `length` field (the first 4 bytes of a frame), and
/// return the number of bytes still to be read for the rest of the frame
/// (`magic` + `crc32` + `payload`) — the field's value already excludes
/// itself, so this is exactly `length`.
pub fn parse_length(buf: [u8; 4]) -> Result<u32, DecodeError> {
    let length = u32::from_le_bytes(buf);
    if length < MIN_LENGTH || length > MAX_FRAME_LEN {
        return Err(DecodeError::InvalidLength(length));
    }
    Ok(length)
}

/// Validate and extract the payload from the remainder of a frame (everything
/// after the 4-byte length): `magic` (1) + `crc32` (4) + `payload`.
pub fn parse_body(buf: &[u8]) -> Result<Bytes, DecodeError> {
    debug_assert!(buf.len() >= 5);
    let magic = buf[0];
    if magic != MAGIC {
        return Err(DecodeError::BadMagic(magic));
    }
    let expected = u32::from_le_bytes(buf[1..5].try_into().unwrap());
    let payload = &buf[5..];
    let got = crc32fast::hash(payload);
    if got != expected {
        return Err(DecodeError::CrcMismatch { got, expected });
    }
    Ok(Bytes::copy_from_slice(payload))
}

/// Outcome of reading one frame from a non-growing reader: either a decoded
/// message, or a clean end of input with zero bytes consumed.
pub enum Frame {
    Message(Bytes),
    Eof,
}

/// Read and validate exactly one frame from `r`, a plain (non-follower)
/// reader over a static byte range. Used by [`crate::segment::Segment::open`]
/// to scan a whole file at startup.
///
/// A trailing partial frame (fewer than [`HEADER_LEN`] bytes, or a declared
/// length longer than what remains in the file) is reported as
/// [`DecodeError::ShortRead`], the same as a clean EOF at a frame boundary:
/// callers that are scanning a live segment must treat both as "not yet
/// committed", not as corruption.
pub fn decode_one<R: std::io::Read>(r: &mut R) -> Result<Frame, DecodeError> {
    let mut len_buf = [0u8; 4];
    let n = read_partial(r, &mut len_buf)?;
    if n == 0 {
        return Ok(Frame::Eof);
    }
    if n < len_buf.len() {
        return Err(DecodeError::ShortRead);
    }
    let length = parse_length(len_buf)?;

    let mut rest = vec![0u8; length as usize];
    let n = read_partial(r, &mut rest)?;
    if n < rest.len() {
        return Err(DecodeError::ShortRead);
    }
    Ok(Frame::Message(parse_body(&rest)?))
}

/// Fill `buf` as far as possible before hitting EOF, returning the number of
/// bytes actually read. Unlike `Read::read_exact`, a short read is not an
/// error here — the caller decides what a partial fill means.
fn read_partial<R: std::io::Read>(r: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn round_trip() {
        for payload in [&b""[..], b"a", b"hello, world", &[0u8; 1024]] {
            let encoded = encode(payload);
            let mut reader = &encoded[..];
            match decode_one(&mut reader).unwrap() {
                Frame::Message(got) => assert_eq!(&got[..], payload),
                Frame::Eof => panic!("expected a message"),
            }
        }
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut encoded = encode(b"hello");
        encoded[4] = 1;
        let mut reader = &encoded[..];
        match decode_one(&mut reader).unwrap_err() {
            DecodeError::BadMagic(1) => {}
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn crc_mismatch_is_detected() {
        let mut encoded = encode(b"hello");
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        let mut reader = &encoded[..];
        match decode_one(&mut reader).unwrap_err() {
            DecodeError::CrcMismatch { .. } => {}
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_input_is_clean_eof() {
        let mut reader = &b""[..];
        assert!(matches!(decode_one(&mut reader).unwrap(), Frame::Eof));
    }

    #[test]
    fn truncated_tail_is_short_read_not_corruption() {
        let encoded = encode(b"hello, world");
        for cut in 1..encoded.len() {
            let mut reader = &encoded[..cut];
            assert!(matches!(decode_one(&mut reader).unwrap_err(), DecodeError::ShortRead));
        }
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut buf = Vec::new();
        buf.extend(encode(b"a"));
        buf.extend(encode(b"b"));
        buf.extend(encode(b"c"));
        let mut reader = &buf[..];

        for expected in [&b"a"[..], b"b", b"c"] {
            match decode_one(&mut reader).unwrap() {
                Frame::Message(got) => assert_eq!(&got[..], expected),
                Frame::Eof => panic!("expected a message"),
            }
        }
        assert!(matches!(decode_one(&mut reader).unwrap(), Frame::Eof));
    }

    proptest! {
        #[test]
        fn prop_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let encoded = encode(&payload);
            let mut reader = &encoded[..];
            match decode_one(&mut reader).unwrap() {
                Frame::Message(got) => prop_assert_eq!(&got[..], &payload[..]),
                Frame::Eof => prop_assert!(false, "expected a message"),
            }
        }

        #[test]
        fn prop_single_flipped_payload_byte_is_detected(
            payload in proptest::collection::vec(any::<u8>(), 1..256),
            flip_index in 0usize..255,
        ) {
            let flip_index = flip_index % payload.len();
            let mut encoded = encode(&payload);
            encoded[HEADER_LEN + flip_index] ^= 0xff;
            let mut reader = &encoded[..];
            let is_crc_mismatch = matches!(decode_one(&mut reader), Err(DecodeError::CrcMismatch { .. }));
            prop_assert!(is_crc_mismatch);
        }
    }
}
