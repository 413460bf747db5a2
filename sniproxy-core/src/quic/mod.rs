//! QUIC Initial-packet inspection: the ClientHello parser (C1).
//!
//! Ties together long-header decode, RFC 9001 Initial decryption, CRYPTO
//! frame reassembly and TLS extension extraction into the single pipeline
//! spec.md §4.1 describes. No full QUIC endpoint is run here — only enough
//! of the protocol to read a first-flight ClientHello.

pub mod crypto_frame;
pub mod header;
pub mod initial;
pub mod tls;

pub use header::{is_long_header, parse_short_header_dcid, LongHeader, LongPacketType};

use crate::error::ParseError;

/// Everything the chain needs out of a parsed ClientHello.
#[derive(Debug, Clone)]
pub struct ClientHelloInfo {
    pub sni: Option<String>,
    pub alpn: Vec<String>,
    /// The SCID the client offered in its Initial, for forward CID learning
    /// (spec.md §4.7 step 2c).
    pub scid: Vec<u8>,
    pub dcid: Vec<u8>,
}

/// Runs the full C1 pipeline over one UDP datagram: long-header decode,
/// Initial key derivation + header-protection removal + AEAD decryption,
/// CRYPTO frame reassembly, then SNI/ALPN extraction.
///
/// `datagram` is mutated in place during header-protection removal and AEAD
/// decryption (spec.md §4.1 step 3-4 operate in place to avoid a copy).
pub fn parse_client_hello(datagram: &mut [u8]) -> Result<ClientHelloInfo, ParseError> {
    let hdr = header::parse_long_header(datagram)?;
    if hdr.ty != LongPacketType::Initial {
        return Err(ParseError::NotInitial);
    }

    let pn_offset = hdr.pn_offset;
    let payload_len = hdr.length;
    let (_, plaintext) = initial::decrypt_initial(datagram, pn_offset, payload_len)?;

    let handshake_msg = crypto_frame::reassemble_crypto(&plaintext)?;

    let sni = match tls::extract_sni(&handshake_msg) {
        Ok(s) => Some(s),
        Err(ParseError::NoSni) => None,
        Err(e) => return Err(e),
    };
    let alpn = tls::extract_alpn(&handshake_msg)?;

    Ok(ClientHelloInfo {
        sni,
        alpn,
        scid: hdr.scid,
        dcid: hdr.dcid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quic::header::PROTOCOL_VERSION_V1;
    use rustls::crypto::ring::cipher_suite::TLS13_AES_128_GCM_SHA256;
    use rustls::quic::{Keys, Side, Version};

    const CLIENT_HELLO: u8 = 0x01;
    const SNI_EXTENSION: u16 = 0x0000;
    const ALPN_EXTENSION: u16 = 0x0010;

    fn encode_varint(v: u64) -> Vec<u8> {
        if v < 0x40 {
            vec![v as u8]
        } else if v < 0x4000 {
            ((v as u16) | 0x4000).to_be_bytes().to_vec()
        } else {
            ((v as u32) | 0x8000_0000).to_be_bytes().to_vec()
        }
    }

    fn sni_extension(host: &str) -> Vec<u8> {
        let mut ext = Vec::new();
        ext.extend_from_slice(&SNI_EXTENSION.to_be_bytes());
        let list_len = 3 + host.len();
        ext.extend_from_slice(&((2 + list_len) as u16).to_be_bytes());
        ext.extend_from_slice(&(list_len as u16).to_be_bytes());
        ext.push(0x00);
        ext.extend_from_slice(&(host.len() as u16).to_be_bytes());
        ext.extend_from_slice(host.as_bytes());
        ext
    }

    fn alpn_extension(protocols: &[&str]) -> Vec<u8> {
        let mut list = Vec::new();
        for p in protocols {
            list.push(p.len() as u8);
            list.extend_from_slice(p.as_bytes());
        }
        let mut ext = Vec::new();
        ext.extend_from_slice(&ALPN_EXTENSION.to_be_bytes());
        ext.extend_from_slice(&((2 + list.len()) as u16).to_be_bytes());
        ext.extend_from_slice(&(list.len() as u16).to_be_bytes());
        ext.extend_from_slice(&list);
        ext
    }

    fn client_hello_message(sni: Option<&str>, alpn: &[&str]) -> Vec<u8> {
        let mut extensions = Vec::new();
        if let Some(host) = sni {
            extensions.extend_from_slice(&sni_extension(host));
        }
        if !alpn.is_empty() {
            extensions.extend_from_slice(&alpn_extension(alpn));
        }

        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[0u8; 32]);
        body.push(0x00);
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
        body.push(0x01);
        body.push(0x00);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut msg = vec![CLIENT_HELLO];
        let len = body.len() as u32;
        msg.push((len >> 16) as u8);
        msg.push((len >> 8) as u8);
        msg.push(len as u8);
        msg.extend_from_slice(&body);
        msg
    }

    /// Builds a real, AEAD-encrypted and header-protected QUIC v1 Initial
    /// datagram carrying the given SNI/ALPN, the way a client actually sends
    /// one — the mirror image of `initial::decrypt_initial`.
    pub(crate) fn build_quic_initial(dcid: &[u8], scid: &[u8], sni: Option<&str>, alpn: &[&str]) -> Vec<u8> {
        let handshake = client_hello_message(sni, alpn);

        let mut plaintext = vec![0x06u8]; // CRYPTO frame
        plaintext.extend(encode_varint(0)); // offset
        plaintext.extend(encode_varint(handshake.len() as u64));
        plaintext.extend_from_slice(&handshake);

        const PN_LEN: usize = 4;
        const TAG_LEN: usize = 16;
        let packet_number: u64 = 0;
        let payload_len_field = PN_LEN + plaintext.len() + TAG_LEN;

        let mut header = vec![0xC3u8]; // long header, Initial, pn_len=4
        header.extend_from_slice(&PROTOCOL_VERSION_V1.to_be_bytes());
        header.push(dcid.len() as u8);
        header.extend_from_slice(dcid);
        header.push(scid.len() as u8);
        header.extend_from_slice(scid);
        header.extend(encode_varint(0)); // token length
        header.extend(encode_varint(payload_len_field as u64));
        let pn_offset = header.len();
        header.extend_from_slice(&(packet_number as u32).to_be_bytes());

        let suite = TLS13_AES_128_GCM_SHA256.tls13().unwrap();
        let keys = Keys::initial(Version::V1, suite, dcid, Side::Client);

        let mut payload = plaintext;
        let tag = keys
            .local
            .packet
            .encrypt_in_place(packet_number, &header, &mut payload)
            .unwrap();
        payload.extend_from_slice(tag.as_ref());

        let mut datagram = header;
        datagram.extend_from_slice(&payload);

        let sample_offset = pn_offset + 4;
        let sample = datagram[sample_offset..sample_offset + 16].to_vec();

        let mut first_byte = datagram[0];
        let mut pn_bytes = datagram[pn_offset..pn_offset + PN_LEN].to_vec();
        keys.local
            .header
            .encrypt_in_place(&sample, &mut first_byte, &mut pn_bytes)
            .unwrap();
        datagram[0] = first_byte;
        datagram[pn_offset..pn_offset + PN_LEN].copy_from_slice(&pn_bytes);

        datagram
    }

    #[test]
    fn round_trips_sni_and_alpn_through_the_full_pipeline() {
        let dcid = [0xAA; 8];
        let scid = [0xBB; 8];
        let mut datagram = build_quic_initial(&dcid, &scid, Some("example.com"), &["h3"]);

        let hello = parse_client_hello(&mut datagram).unwrap();
        assert_eq!(hello.sni.as_deref(), Some("example.com"));
        assert_eq!(hello.alpn, vec!["h3".to_string()]);
        assert_eq!(hello.dcid, dcid);
        assert_eq!(hello.scid, scid);
    }

    #[test]
    fn round_trip_without_sni_yields_none() {
        let dcid = [0xCC; 8];
        let scid = [0xDD; 8];
        let mut datagram = build_quic_initial(&dcid, &scid, None, &["h3"]);

        let hello = parse_client_hello(&mut datagram).unwrap();
        assert_eq!(hello.sni, None);
        assert_eq!(hello.alpn, vec!["h3".to_string()]);
    }

    #[test]
    fn short_header_datagram_is_not_initial() {
        let mut pkt = vec![0x40u8, 1, 2, 3, 4, 5, 6, 7, 8];
        assert!(matches!(parse_client_hello(&mut pkt), Err(ParseError::NotInitial)));
    }
}
