//! SNI and ALPN extraction from a bare TLS 1.3 Handshake message (C1 step 6).
//!
//! `extract_sni` is adapted from the teacher's `lib.rs::extract_sni`: the same
//! byte-walking ClientHello parser, minus the 5-byte TLS record header the
//! teacher skips first — a QUIC CRYPTO stream carries the Handshake message
//! directly, with no record layer wrapped around it. `extract_alpn` is new,
//! written in the same walking style for extension 0x10
//! (application_layer_protocol_negotiation, RFC 7301).

use crate::error::ParseError;

const CLIENT_HELLO: u8 = 0x01;
const SNI_EXTENSION: u16 = 0x0000;
const ALPN_EXTENSION: u16 = 0x0010;

struct ClientHelloExtensions<'a> {
    data: &'a [u8],
    pos: usize,
    end: usize,
}

/// Parses the ClientHello up to its extensions block and hands back a cursor
/// over just the extensions, so `extract_sni`/`extract_alpn` share the exact
/// same framing logic instead of each re-walking the fixed fields.
fn client_hello_extensions(msg: &[u8]) -> Result<ClientHelloExtensions<'_>, ParseError> {
    if msg.len() < 4 {
        return Err(ParseError::Truncated);
    }
    if msg[0] != CLIENT_HELLO {
        return Err(ParseError::NoSni);
    }
    let handshake_length =
        ((msg[1] as usize) << 16) | ((msg[2] as usize) << 8) | (msg[3] as usize);
    if msg.len() < 4 + handshake_length {
        return Err(ParseError::Truncated);
    }

    // version(2) + random(32)
    let mut pos = 4 + 2 + 32;

    if msg.len() < pos + 1 {
        return Err(ParseError::Truncated);
    }
    let session_id_length = msg[pos] as usize;
    pos += 1 + session_id_length;

    if msg.len() < pos + 2 {
        return Err(ParseError::Truncated);
    }
    let cipher_suites_length = ((msg[pos] as usize) << 8) | (msg[pos + 1] as usize);
    pos += 2 + cipher_suites_length;

    if msg.len() < pos + 1 {
        return Err(ParseError::Truncated);
    }
    let compression_methods_length = msg[pos] as usize;
    pos += 1 + compression_methods_length;

    if msg.len() < pos + 2 {
        return Err(ParseError::Truncated);
    }
    let extensions_length = ((msg[pos] as usize) << 8) | (msg[pos + 1] as usize);
    pos += 2;

    if msg.len() < pos + extensions_length {
        return Err(ParseError::Truncated);
    }

    Ok(ClientHelloExtensions {
        data: msg,
        pos,
        end: pos + extensions_length,
    })
}

impl<'a> ClientHelloExtensions<'a> {
    fn next(&mut self) -> Option<(u16, &'a [u8])> {
        if self.pos + 4 > self.end {
            return None;
        }
        let data = self.data;
        let ext_type = ((data[self.pos] as u16) << 8) | (data[self.pos + 1] as u16);
        let ext_len = ((data[self.pos + 2] as usize) << 8) | (data[self.pos + 3] as usize);
        let body_start = self.pos + 4;
        if body_start + ext_len > self.end {
            return None;
        }
        self.pos = body_start + ext_len;
        Some((ext_type, &data[body_start..body_start + ext_len]))
    }
}

/// IDN-decodes (punycode -> Unicode) and lower-cases a host_name per
/// spec.md §3's ClientHello data model ("SNI (IDN-decoded lower-cased
/// hostname)"). Falls back to a plain ASCII lower-case of the raw label on
/// IDNA decode errors rather than rejecting an otherwise well-formed SNI.
fn normalize_hostname(raw: &str) -> String {
    let (decoded, result) = idna::domain_to_unicode(raw);
    if result.is_err() {
        return raw.to_ascii_lowercase();
    }
    decoded.to_lowercase()
}

/// Extracts the SNI host_name from a ClientHello's server_name extension
/// (RFC 6066 §3). Returns `NoSni` if the message parses but carries none.
pub fn extract_sni(msg: &[u8]) -> Result<String, ParseError> {
    let mut exts = client_hello_extensions(msg)?;

    while let Some((ext_type, body)) = exts.next() {
        if ext_type != SNI_EXTENSION {
            continue;
        }

        if body.len() < 2 {
            return Err(ParseError::NoSni);
        }
        let list_len = ((body[0] as usize) << 8) | (body[1] as usize);
        if list_len + 2 > body.len() {
            return Err(ParseError::NoSni);
        }

        let mut pos = 2;
        while pos + 3 <= body.len() {
            let name_type = body[pos];
            let name_len = ((body[pos + 1] as usize) << 8) | (body[pos + 2] as usize);
            pos += 3;
            if pos + name_len > body.len() {
                return Err(ParseError::Truncated);
            }
            if name_type == 0 {
                return std::str::from_utf8(&body[pos..pos + name_len])
                    .map(normalize_hostname)
                    .map_err(|_| ParseError::NoSni);
            }
            pos += name_len;
        }
    }

    Err(ParseError::NoSni)
}

/// Extracts the client's offered ALPN protocol list (RFC 7301 §3.1), in the
/// order offered. Empty (but present) extension returns an empty vec.
pub fn extract_alpn(msg: &[u8]) -> Result<Vec<String>, ParseError> {
    let mut exts = client_hello_extensions(msg)?;

    while let Some((ext_type, body)) = exts.next() {
        if ext_type != ALPN_EXTENSION {
            continue;
        }

        if body.len() < 2 {
            return Err(ParseError::Truncated);
        }
        let list_len = ((body[0] as usize) << 8) | (body[1] as usize);
        if list_len + 2 > body.len() {
            return Err(ParseError::Truncated);
        }

        let mut protocols = Vec::new();
        let mut pos = 2;
        let list_end = 2 + list_len;
        while pos < list_end {
            if pos >= body.len() {
                return Err(ParseError::Truncated);
            }
            let proto_len = body[pos] as usize;
            pos += 1;
            if pos + proto_len > body.len() {
                return Err(ParseError::Truncated);
            }
            let proto = std::str::from_utf8(&body[pos..pos + proto_len])
                .map_err(|_| ParseError::NoSni)?;
            protocols.push(proto.to_string());
            pos += proto_len;
        }
        return Ok(protocols);
    }

    Ok(Vec::new())
}
