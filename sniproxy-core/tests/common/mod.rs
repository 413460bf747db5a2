//! Shared helpers for the end-to-end scenario tests (spec.md §8).
//!
//! `build_quic_initial` is the encrypt-side mirror of
//! `quic::initial::decrypt_initial`: it builds a real, AEAD-encrypted and
//! header-protected QUIC v1 Initial datagram the way a client would send
//! one, so the scenario tests exercise the actual wire parser rather than a
//! hand-built `ClientHelloInfo`.

use rustls::crypto::ring::cipher_suite::TLS13_AES_128_GCM_SHA256;
use rustls::quic::{Keys, Side, Version};

const PROTOCOL_VERSION_V1: u32 = 0x0000_0001;
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

/// Builds a real QUIC v1 Initial datagram carrying a ClientHello with the
/// given SNI/ALPN, addressed to `dcid` and offering `scid`.
pub fn build_quic_initial(dcid: &[u8], scid: &[u8], sni: Option<&str>, alpn: &[&str]) -> Vec<u8> {
    let handshake = client_hello_message(sni, alpn);

    let mut plaintext = vec![0x06u8]; // CRYPTO frame
    plaintext.extend(encode_varint(0));
    plaintext.extend(encode_varint(handshake.len() as u64));
    plaintext.extend_from_slice(&handshake);

    const PN_LEN: usize = 4;
    const TAG_LEN: usize = 16;
    let packet_number: u64 = 0;
    let payload_len_field = PN_LEN + plaintext.len() + TAG_LEN;

    let mut header = vec![0xC3u8];
    header.extend_from_slice(&PROTOCOL_VERSION_V1.to_be_bytes());
    header.push(dcid.len() as u8);
    header.extend_from_slice(dcid);
    header.push(scid.len() as u8);
    header.extend_from_slice(scid);
    header.extend(encode_varint(0));
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

/// Builds a plaintext (unencrypted) long-header packet of the kind a
/// backend's own QUIC stack would send back to the client, carrying
/// `scid` — the shape `forwarder::run_backend_pump` scans for CID
/// learning, which never goes through Initial decryption.
pub fn build_plain_long_header(dcid: &[u8], scid: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut pkt = vec![0xC0u8 | 0x20]; // long header, Handshake type, pn_len=1
    pkt.extend_from_slice(&PROTOCOL_VERSION_V1.to_be_bytes());
    pkt.push(dcid.len() as u8);
    pkt.extend_from_slice(dcid);
    pkt.push(scid.len() as u8);
    pkt.extend_from_slice(scid);
    let len_val = (1 + payload.len()) as u16; // pn(1) + payload
    pkt.push(0x40 | ((len_val >> 8) as u8));
    pkt.push((len_val & 0xff) as u8);
    pkt.push(0x00); // packet number, 1 byte
    pkt.extend_from_slice(payload);
    pkt
}
