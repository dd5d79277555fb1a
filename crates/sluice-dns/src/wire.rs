//! Minimal DNS message codec.
//!
//! Only what the tunnel speaks: TXT/IN queries with an EDNS0 OPT record, and
//! responses whose answers are TTL-0 TXT records carrying base64 chunks. No
//! zone semantics, no record types beyond TXT and OPT.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::debug;

pub const RR_TXT: u16 = 16;
pub const RR_OPT: u16 = 41;
pub const CLASS_IN: u16 = 1;

/// Advertised EDNS0 UDP payload size. 1232 avoids IPv6 fragmentation while
/// leaving room to pack several TXT answers per response.
pub const EDNS_UDP_PAYLOAD: u16 = 1232;

const HEADER_LEN: usize = 12;
const FLAG_QR: u16 = 0x8000;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;
const MAX_WIRE_NAME: usize = 255;
const MAX_CHAR_STRING: usize = 255;
const MAX_POINTER_HOPS: usize = 16;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("message truncated")]
    Truncated,
    #[error("message has no question")]
    NoQuestion,
    #[error("label exceeds 63 octets")]
    LabelTooLong,
    #[error("name exceeds 255 octets")]
    NameTooLong,
    #[error("bad compression pointer")]
    BadPointer,
}

/// Response codes the tunnel emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Rcode {
    NoError = 0,
    FormErr = 1,
    ServFail = 2,
    NxDomain = 3,
    NotImp = 4,
    Refused = 5,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub qname: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// A parsed query, question case preserved as received.
#[derive(Debug)]
pub struct Query {
    pub id: u16,
    pub rd: bool,
    pub questions: u16,
    pub question: Question,
}

pub struct QueryParams<'a> {
    pub id: u16,
    pub qname: &'a str,
    pub qtype: u16,
    pub qclass: u16,
    pub rd: bool,
}

/// A parsed response; `answers` holds each TXT record's chunk, already
/// base64-decoded, with undecodable records dropped.
#[derive(Debug)]
pub struct Response {
    pub id: u16,
    pub rcode: u8,
    pub answers: Vec<Vec<u8>>,
}

pub struct ResponseParams<'a> {
    pub id: u16,
    pub rd: bool,
    pub question: &'a Question,
    pub rcode: Rcode,
    /// Raw chunk bytes; one TXT answer is emitted per chunk.
    pub chunks: &'a [Vec<u8>],
}

/// Build a query with one question and an EDNS0 OPT record.
pub fn encode_query(params: &QueryParams<'_>) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(HEADER_LEN + params.qname.len() + 2 + 4 + 11);
    out.extend_from_slice(&params.id.to_be_bytes());
    let flags = if params.rd { FLAG_RD } else { 0 };
    out.extend_from_slice(&flags.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    out.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    out.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    out.extend_from_slice(&1u16.to_be_bytes()); // ARCOUNT (OPT)

    write_name(&mut out, params.qname)?;
    out.extend_from_slice(&params.qtype.to_be_bytes());
    out.extend_from_slice(&params.qclass.to_be_bytes());

    // EDNS0 OPT pseudo-record: root name, CLASS carries the payload size.
    out.push(0);
    out.extend_from_slice(&RR_OPT.to_be_bytes());
    out.extend_from_slice(&EDNS_UDP_PAYLOAD.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    Ok(out)
}

/// Parse a query far enough to route it: header flags plus the first
/// question.
pub fn decode_query(packet: &[u8]) -> Result<Query, WireError> {
    if packet.len() < HEADER_LEN {
        return Err(WireError::Truncated);
    }
    let id = u16::from_be_bytes([packet[0], packet[1]]);
    let flags = u16::from_be_bytes([packet[2], packet[3]]);
    let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
    if qdcount == 0 {
        return Err(WireError::NoQuestion);
    }

    let (qname, pos) = read_name(packet, HEADER_LEN)?;
    let rest = packet.get(pos..pos + 4).ok_or(WireError::Truncated)?;
    Ok(Query {
        id,
        rd: flags & FLAG_RD != 0,
        questions: qdcount,
        question: Question {
            qname,
            qtype: u16::from_be_bytes([rest[0], rest[1]]),
            qclass: u16::from_be_bytes([rest[2], rest[3]]),
        },
    })
}

/// Build a response mirroring the question, with one TTL-0 TXT answer per
/// chunk. Zero chunks with `Rcode::NoError` is a valid idle reply.
pub fn encode_response(params: &ResponseParams<'_>) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(HEADER_LEN + params.question.qname.len() + 8);
    out.extend_from_slice(&params.id.to_be_bytes());
    let mut flags = FLAG_QR | FLAG_RA | params.rcode as u16;
    if params.rd {
        flags |= FLAG_RD;
    }
    out.extend_from_slice(&flags.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&(params.chunks.len() as u16).to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());

    write_name(&mut out, &params.question.qname)?;
    out.extend_from_slice(&params.question.qtype.to_be_bytes());
    out.extend_from_slice(&params.question.qclass.to_be_bytes());

    for chunk in params.chunks {
        // Compressed pointer back to the question name.
        out.extend_from_slice(&[0xc0, HEADER_LEN as u8]);
        out.extend_from_slice(&RR_TXT.to_be_bytes());
        out.extend_from_slice(&CLASS_IN.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes()); // TTL 0: never worth caching

        let txt = BASE64.encode(chunk);
        let segments = txt.as_bytes().chunks(MAX_CHAR_STRING);
        let rdlen = txt.len() + segments.len();
        out.extend_from_slice(&(rdlen as u16).to_be_bytes());
        for segment in txt.as_bytes().chunks(MAX_CHAR_STRING) {
            out.push(segment.len() as u8);
            out.extend_from_slice(segment);
        }
    }
    Ok(out)
}

/// Parse a response and extract the chunk carried by each TXT answer.
///
/// A TXT record's logical string may arrive split across several
/// character-strings (recursors re-segment strings over 255 bytes); they are
/// rejoined before base64 decoding. Records that fail to decode are dropped
/// individually.
pub fn decode_response(packet: &[u8]) -> Result<Response, WireError> {
    if packet.len() < HEADER_LEN {
        return Err(WireError::Truncated);
    }
    let id = u16::from_be_bytes([packet[0], packet[1]]);
    let flags = u16::from_be_bytes([packet[2], packet[3]]);
    let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
    let ancount = u16::from_be_bytes([packet[6], packet[7]]);

    let mut pos = HEADER_LEN;
    for _ in 0..qdcount {
        let (_, next) = read_name(packet, pos)?;
        pos = next + 4;
        if pos > packet.len() {
            return Err(WireError::Truncated);
        }
    }

    let mut answers = Vec::new();
    for _ in 0..ancount {
        let (_, next) = read_name(packet, pos)?;
        pos = next;
        let fixed = packet.get(pos..pos + 10).ok_or(WireError::Truncated)?;
        let rtype = u16::from_be_bytes([fixed[0], fixed[1]]);
        let rclass = u16::from_be_bytes([fixed[2], fixed[3]]);
        let rdlen = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
        pos += 10;
        let rdata = packet.get(pos..pos + rdlen).ok_or(WireError::Truncated)?;
        pos += rdlen;

        if rtype != RR_TXT || rclass != CLASS_IN {
            continue;
        }
        let mut txt = Vec::with_capacity(rdlen);
        let mut at = 0;
        while at < rdata.len() {
            let len = rdata[at] as usize;
            at += 1;
            let segment = rdata.get(at..at + len).ok_or(WireError::Truncated)?;
            txt.extend_from_slice(segment);
            at += len;
        }
        match BASE64.decode(&txt) {
            Ok(chunk) => answers.push(chunk),
            Err(_) => debug!("dropping TXT answer with undecodable payload"),
        }
    }

    Ok(Response {
        id,
        rcode: (flags & 0x000f) as u8,
        answers,
    })
}

fn write_name(out: &mut Vec<u8>, name: &str) -> Result<(), WireError> {
    let start = out.len();
    for label in name.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(WireError::LabelTooLong);
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    if out.len() - start > MAX_WIRE_NAME {
        return Err(WireError::NameTooLong);
    }
    Ok(())
}

/// Read a possibly-compressed name; returns the dotted name and the offset
/// just past its in-stream encoding.
fn read_name(packet: &[u8], mut pos: usize) -> Result<(String, usize), WireError> {
    let mut name = String::new();
    let mut end = 0;
    let mut jumped = false;
    let mut hops = 0;
    loop {
        let len = *packet.get(pos).ok_or(WireError::Truncated)? as usize;
        if len & 0xc0 == 0xc0 {
            let low = *packet.get(pos + 1).ok_or(WireError::Truncated)? as usize;
            if !jumped {
                end = pos + 2;
                jumped = true;
            }
            pos = ((len & 0x3f) << 8) | low;
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return Err(WireError::BadPointer);
            }
            continue;
        }
        if len == 0 {
            if !jumped {
                end = pos + 1;
            }
            break;
        }
        if len > 63 {
            return Err(WireError::LabelTooLong);
        }
        let label = packet.get(pos + 1..pos + 1 + len).ok_or(WireError::Truncated)?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(label));
        pos += 1 + len;
    }
    Ok((name, end))
}
