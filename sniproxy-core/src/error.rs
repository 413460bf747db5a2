//! Error kinds for the packet engine, matching the policy table in the design
//! doc: most are logged-and-dropped, never retried (UDP offers no delivery
//! guarantee to retry against).

use std::fmt;

/// Failure modes of the ClientHello parser (C1).
#[derive(Debug)]
pub enum ParseError {
    /// First byte's high bit is clear, or an unsupported QUIC version.
    NotInitial,
    /// Buffer ran out before a field could be read.
    Truncated,
    /// ClientHello parsed but carried no (or an empty) SNI.
    NoSni,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::NotInitial => write!(f, "not a QUIC Initial packet"),
            ParseError::Truncated => write!(f, "packet truncated"),
            ParseError::NoSni => write!(f, "no SNI in ClientHello"),
        }
    }
}

impl std::error::Error for ParseError {}

impl From<octets::BufferTooShortError> for ParseError {
    fn from(_: octets::BufferTooShortError) -> Self {
        ParseError::Truncated
    }
}

/// Errors surfaced by a handler while admitting or servicing a connection.
/// Every `ChainResult::Drop` reason raised for one of these conditions is
/// built from this enum's `Display` impl rather than an ad hoc format
/// string, so the taxonomy and the text handed to `Metrics::drop_reason_label`
/// can't drift apart.
#[derive(Debug)]
pub enum HandlerError {
    UnknownSni(String),
    RateLimited { current: u64, max: u64 },
    DnsResolutionFailure(String),
    BackendDialFailure(String),
    BackendWriteFailure(String),
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::UnknownSni(sni) => write!(f, "unknown SNI: {sni}"),
            HandlerError::RateLimited { current, max } => {
                write!(f, "rate limited: {current} >= {max}")
            }
            HandlerError::DnsResolutionFailure(detail) => {
                write!(f, "DNS resolution failed for {detail}")
            }
            HandlerError::BackendDialFailure(detail) => {
                write!(f, "failed to dial backend {detail}")
            }
            HandlerError::BackendWriteFailure(detail) => {
                write!(f, "backend write failed: {detail}")
            }
        }
    }
}

impl std::error::Error for HandlerError {}
