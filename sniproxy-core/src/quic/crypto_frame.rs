//! Reassembles CRYPTO frames carried in a decrypted Initial payload
//! (spec.md §4.1 step 5): frames are accumulated by offset; a gap (a frame
//! whose offset does not abut previously accumulated data) is rejected
//! rather than buffered across datagrams (spec.md §4.1: "a ClientHello
//! spanning multiple Initials is unsupported").
//!
//! New code — the teacher never looks inside a QUIC payload. Only PADDING
//! and CRYPTO frames are recognized; a first client flight in practice is
//! PADDING-then-CRYPTO (plus possibly an ACK, which isn't expected before
//! any packet has been acknowledged and so isn't handled here).

use crate::error::ParseError;

const FRAME_TYPE_PADDING: u64 = 0x00;
const FRAME_TYPE_CRYPTO: u64 = 0x06;

/// Walks the frame stream, reassembles CRYPTO frame data by offset, and
/// returns the contiguous reassembled bytes (expected to hold a TLS
/// Handshake message).
pub fn reassemble_crypto(payload: &[u8]) -> Result<Vec<u8>, ParseError> {
    let mut b = octets::Octets::with_slice(payload);
    let mut out: Vec<u8> = Vec::new();
    // Tracks which byte positions in `out` have actually been written by a
    // CRYPTO frame, independent of `out.len()` (which only reflects how far
    // the buffer has been grown to fit the highest offset seen so far).
    // Frames can arrive in any order within the packet, so a later offset
    // growing the buffer must not be mistaken for a gap at an earlier one.
    let mut written: Vec<bool> = Vec::new();

    while b.cap() > 0 {
        if b.peek_u8()? == 0 {
            // Fast-path padding run without re-parsing a varint per byte.
            let _ = b.get_u8()?;
            continue;
        }

        let frame_type = b.get_varint()?;
        match frame_type {
            FRAME_TYPE_PADDING => {
                // A lone non-zero-prefixed PADDING varint is disallowed by
                // spec, but treat defensively as a single consumed byte.
            }
            FRAME_TYPE_CRYPTO => {
                let offset = b.get_varint()? as usize;
                let data = b.get_bytes_with_varint_length()?.to_vec();

                let end = offset + data.len();
                if end > out.len() {
                    out.resize(end, 0);
                    written.resize(end, false);
                }
                out[offset..end].copy_from_slice(&data);
                written[offset..end].fill(true);
            }
            _ => {
                // Any other frame type in a first Initial (ACK, CONNECTION_CLOSE,
                // ...) is out of scope for SNI extraction; stop reassembling
                // rather than mis-parse an unknown frame body.
                break;
            }
        }
    }

    if out.is_empty() {
        return Err(ParseError::NoSni);
    }
    if written.iter().any(|&w| !w) {
        return Err(ParseError::Truncated); // gap: reject, don't buffer
    }

    Ok(out)
}
