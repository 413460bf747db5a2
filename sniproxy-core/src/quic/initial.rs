//! RFC 9001 Initial secrets, header-protection removal, and AEAD decryption.
//!
//! New code (the teacher never decrypts QUIC payloads), built atop
//! `rustls::quic::{Keys, Version, Side}` rather than hand-rolling HKDF/AEAD
//! or pulling in `ring` directly — `rustls` and `quinn` are already teacher
//! dependencies, and `quinn` obtains its own Initial keys through this exact
//! rustls module internally.

use crate::error::ParseError;
use rustls::crypto::ring::cipher_suite::TLS13_AES_128_GCM_SHA256;
use rustls::quic::{Keys, Side, Version};

/// Derives the Initial keys for the given DCID (RFC 9001 §5.2) and strips
/// header protection + AEAD-decrypts the payload in place (RFC 9001
/// §5.3-5.4). Returns the packet number and the plaintext payload (the
/// CRYPTO/PADDING frame stream).
pub fn decrypt_initial(datagram: &mut [u8], pn_offset: usize, payload_len: usize) -> Result<(u64, Vec<u8>), ParseError> {
    let dcid = long_header_dcid(datagram)?;

    let suite = TLS13_AES_128_GCM_SHA256
        .tls13()
        .expect("TLS13_AES_128_GCM_SHA256 is a TLS 1.3 suite");
    // We are on-path, not the server: deriving with `Side::Server` yields
    // `remote` keys, i.e. the keys the real server would use to *decrypt*
    // packets sent *by* the client — exactly what we need to read the
    // ClientHello without ever completing a handshake ourselves.
    let keys = Keys::initial(Version::V1, suite, &dcid, Side::Server);

    if pn_offset + payload_len > datagram.len() {
        return Err(ParseError::Truncated);
    }

    // RFC 9001 §5.4.2: sample starts 4 bytes into the (as yet unknown-length)
    // packet number field, regardless of its real encoded length. Both need
    // to fit inside payload_len itself, not just inside the datagram overall
    // — a malformed Initial can declare a short payload_len while the
    // datagram keeps going (padding, a coalesced packet).
    const SAMPLE_LEN: usize = 16;
    if payload_len < 4 + SAMPLE_LEN {
        return Err(ParseError::Truncated);
    }
    let sample_offset = pn_offset + 4;
    if sample_offset + SAMPLE_LEN > datagram.len() {
        return Err(ParseError::Truncated);
    }

    let (header_part, rest) = datagram.split_at_mut(pn_offset);
    let (pn_and_sample, _) = rest.split_at_mut(payload_len);
    let sample = pn_and_sample[4..4 + SAMPLE_LEN].to_vec();

    let first_byte = &mut header_part[0];
    let mut pn_bytes = [0u8; 4];
    pn_bytes.copy_from_slice(&pn_and_sample[..4]);

    keys.remote
        .header
        .decrypt_in_place(&sample, first_byte, &mut pn_bytes)
        .map_err(|_| ParseError::Truncated)?;

    // Low two bits of the now-unmasked first byte give the real packet
    // number length (1-4 bytes), per RFC 9000 §17.1.
    let pn_len = (*first_byte & 0x03) as usize + 1;
    let packet_number = decode_packet_number(&pn_bytes[..pn_len]);

    let header_len = pn_offset + pn_len;
    let (header, payload) = datagram.split_at_mut(header_len);
    let ciphertext_len = payload_len - pn_len;
    let ciphertext = &mut payload[..ciphertext_len];

    let plain_len = keys
        .remote
        .packet
        .decrypt_in_place(packet_number, header, ciphertext)
        .map_err(|_| ParseError::Truncated)?
        .len();

    Ok((packet_number, ciphertext[..plain_len].to_vec()))
}

fn decode_packet_number(bytes: &[u8]) -> u64 {
    let mut v: u64 = 0;
    for b in bytes {
        v = (v << 8) | *b as u64;
    }
    v
}

fn long_header_dcid(datagram: &[u8]) -> Result<Vec<u8>, ParseError> {
    let hdr = super::header::parse_long_header(datagram)?;
    Ok(hdr.dcid)
}
