//! DNS-side plumbing for the sluice tunnel.
//!
//! QUIC datagrams do not fit in a DNS name, so the tunnel splits every
//! datagram into numbered chunks ([`fragment`]), carries them upstream as
//! base32 QNAME labels and downstream as base64 TXT strings ([`name`],
//! [`wire`]), and reassembles them on the far side ([`fragment::Reassembler`]).

pub mod fragment;
pub mod name;
pub mod wire;

pub use fragment::{fragment, parse_chunk, Chunk, FragmentError, Reassembler, CHUNK_HEADER_LEN};
pub use name::{
    chunk_qname, max_chunk_for_domain, poll_qname, split_tunnel_name, NameError, QueryPayload,
    TunnelName, DEFAULT_MAX_CHUNK,
};
pub use wire::{
    decode_query, decode_response, encode_query, encode_response, Query, QueryParams, Question,
    Rcode, Response, ResponseParams, WireError, CLASS_IN, EDNS_UDP_PAYLOAD, RR_OPT, RR_TXT,
};
