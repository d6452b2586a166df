//! Minimal DNS wire handling for the query side.
//!
//! Requests are built from scratch: header, one uncompressed question, and an
//! optional EDNS(0) OPT pseudo-record. Replies are never fully parsed — the
//! engine only needs the transaction id and the rcode, which live in the
//! first four bytes of the header.

use std::fmt;

/// Flags word for an ordinary query: RD set, everything else clear.
const FLAGS_RD: u16 = 0x0100;

/// RR type of the EDNS(0) OPT pseudo-record.
const TYPE_OPT: u16 = 41;

/// DO ("DNSSEC OK") bit in the OPT TTL field.
const EDNS_DO: u32 = 0x8000;

const CLASS_IN: u16 = 1;

const MAX_LABEL: usize = 63;
const MAX_NAME: usize = 255;

/// Response-code names, indexed by the low 4 bits of the header flags word.
pub const RCODE_NAMES: [&str; 16] = [
    "NOERROR", "FORMERR", "SERVFAIL", "NXDOMAIN", "NOTIMP", "REFUSED", "YXDOMAIN", "YXRRSET",
    "NXRRSET", "NOTAUTH", "NOTZONE", "RESERVED11", "RESERVED12", "RESERVED13", "RESERVED14",
    "RESERVED15",
];

pub fn rcode_name(rcode: u8) -> &'static str {
    RCODE_NAMES[usize::from(rcode & 0x0f)]
}

/// Problems turning a textual descriptor into a wire query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    EmptyName,
    LabelTooLong(String),
    NameTooLong(String),
    UnknownType(String),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyName => write!(f, "empty query name"),
            Self::LabelTooLong(name) => write!(f, "label exceeds 63 octets in '{name}'"),
            Self::NameTooLong(name) => write!(f, "name exceeds 255 octets: '{name}'"),
            Self::UnknownType(t) => write!(f, "unknown query type '{t}'"),
        }
    }
}

/// Resolve a query-type mnemonic (or `TYPEnnn` escape) to its wire value.
pub fn qtype_value(text: &str) -> Result<u16, WireError> {
    let v = match text {
        "A" => 1,
        "NS" => 2,
        "CNAME" => 5,
        "SOA" => 6,
        "PTR" => 12,
        "MX" => 15,
        "TXT" => 16,
        "AAAA" => 28,
        "SRV" => 33,
        "NAPTR" => 35,
        "DS" => 43,
        "DNSKEY" => 48,
        "ANY" => 255,
        other => {
            if let Some(num) = other.strip_prefix("TYPE") {
                return num
                    .parse::<u16>()
                    .map_err(|_| WireError::UnknownType(text.to_string()));
            }
            return Err(WireError::UnknownType(text.to_string()));
        }
    };
    Ok(v)
}

/// Check that a name fits wire limits without encoding it.
pub fn validate_name(name: &str) -> Result<(), WireError> {
    let trimmed = name.strip_suffix('.').unwrap_or(name);
    if trimmed.is_empty() && name != "." {
        return Err(WireError::EmptyName);
    }
    let mut encoded = 1; // terminating root label
    for label in trimmed.split('.') {
        if label.is_empty() {
            continue;
        }
        if label.len() > MAX_LABEL {
            return Err(WireError::LabelTooLong(name.to_string()));
        }
        encoded += 1 + label.len();
    }
    if encoded > MAX_NAME {
        return Err(WireError::NameTooLong(name.to_string()));
    }
    Ok(())
}

/// Builds wire queries with a fixed set of options; one per worker.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    pub edns: bool,
    pub dnssec_ok: bool,
    /// EDNS requestor payload size, advertised in the OPT class field.
    pub udpsize: u16,
}

impl Default for QueryBuilder {
    fn default() -> Self {
        Self { edns: false, dnssec_ok: false, udpsize: 4096 }
    }
}

impl QueryBuilder {
    /// Encode a query for `name`/`qtype` under transaction id `qid` into
    /// `out` (cleared first).
    pub fn build(&self, name: &str, qtype: u16, qid: u16, out: &mut Vec<u8>) -> Result<(), WireError> {
        validate_name(name)?;
        out.clear();

        let arcount: u16 = if self.edns || self.dnssec_ok { 1 } else { 0 };
        out.extend_from_slice(&qid.to_be_bytes());
        out.extend_from_slice(&FLAGS_RD.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes()); // qdcount
        out.extend_from_slice(&0u16.to_be_bytes()); // ancount
        out.extend_from_slice(&0u16.to_be_bytes()); // nscount
        out.extend_from_slice(&arcount.to_be_bytes());

        let trimmed = name.strip_suffix('.').unwrap_or(name);
        for label in trimmed.split('.') {
            if label.is_empty() {
                continue;
            }
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0); // root

        out.extend_from_slice(&qtype.to_be_bytes());
        out.extend_from_slice(&CLASS_IN.to_be_bytes());

        if arcount == 1 {
            let ttl: u32 = if self.dnssec_ok { EDNS_DO } else { 0 };
            out.push(0); // empty owner name
            out.extend_from_slice(&TYPE_OPT.to_be_bytes());
            out.extend_from_slice(&self.udpsize.to_be_bytes());
            out.extend_from_slice(&ttl.to_be_bytes());
            out.extend_from_slice(&0u16.to_be_bytes()); // rdlength
        }
        Ok(())
    }
}

/// Pull `(qid, rcode)` out of a reply header. `None` when the message is too
/// short to carry one — the caller's short-response path.
pub fn peek_header(msg: &[u8]) -> Option<(u16, u8)> {
    if msg.len() < 4 {
        return None;
    }
    let qid = u16::from_be_bytes([msg[0], msg[1]]);
    let flags = u16::from_be_bytes([msg[2], msg[3]]);
    Some((qid, (flags & 0x000f) as u8))
}
