//! Datagram fragmentation and reassembly.
//!
//! A DNS query has room for at most a couple hundred payload bytes once the
//! tunnel suffix is accounted for, while the QUIC engine hands us datagrams
//! up to its configured MTU. Each datagram is split into up to 255 chunks
//! carrying a fixed 4-byte header, and the receiving side reassembles them
//! in any order, exactly once.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

/// Chunk header: packet_id (u16 BE), total (u8), seq (u8).
pub const CHUNK_HEADER_LEN: usize = 4;

/// Largest number of chunks a single datagram may occupy.
const MAX_TOTAL: usize = 255;

/// How long a finished packet_id keeps suppressing late duplicates.
const DUP_WINDOW: Duration = Duration::from_secs(30);

/// Pending-map size past which the whole map is flushed.
const PENDING_FLUSH_CAP: usize = 1000;

/// A parsed chunk, borrowing its payload from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub packet_id: u16,
    pub total: u8,
    pub seq: u8,
    pub payload: &'a [u8],
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FragmentError {
    #[error("datagram of {len} bytes exceeds {max} chunks of {chunk} bytes")]
    Oversized { len: usize, max: usize, chunk: usize },
    #[error("chunk payload size must be nonzero")]
    ZeroChunkSize,
}

/// Split a datagram into chunks of at most `max_payload` bytes each.
///
/// The caller picks the `packet_id`; it must be random per datagram so that
/// interleaved datagrams from the same peer do not collide. Empty datagrams
/// still produce one (payload-free) chunk so that they survive the trip.
pub fn fragment(
    datagram: &[u8],
    packet_id: u16,
    max_payload: usize,
) -> Result<Vec<Vec<u8>>, FragmentError> {
    if max_payload == 0 {
        return Err(FragmentError::ZeroChunkSize);
    }
    let total = datagram.len().div_ceil(max_payload).max(1);
    if total > MAX_TOTAL {
        return Err(FragmentError::Oversized {
            len: datagram.len(),
            max: MAX_TOTAL,
            chunk: max_payload,
        });
    }

    let mut chunks = Vec::with_capacity(total);
    for seq in 0..total {
        let start = seq * max_payload;
        let end = (start + max_payload).min(datagram.len());
        let slice = &datagram[start..end];
        let mut chunk = Vec::with_capacity(CHUNK_HEADER_LEN + slice.len());
        chunk.extend_from_slice(&packet_id.to_be_bytes());
        chunk.push(total as u8);
        chunk.push(seq as u8);
        chunk.extend_from_slice(slice);
        chunks.push(chunk);
    }
    Ok(chunks)
}

/// Parse a chunk header; `None` for anything shorter than the header.
pub fn parse_chunk(data: &[u8]) -> Option<Chunk<'_>> {
    if data.len() < CHUNK_HEADER_LEN {
        return None;
    }
    Some(Chunk {
        packet_id: u16::from_be_bytes([data[0], data[1]]),
        total: data[2],
        seq: data[3],
        payload: &data[CHUNK_HEADER_LEN..],
    })
}

#[derive(Debug)]
struct PendingPacket {
    slots: Vec<Option<Vec<u8>>>,
    received: usize,
    created: Instant,
}

impl PendingPacket {
    fn new(total: u8) -> Self {
        Self {
            slots: vec![None; total as usize],
            received: 0,
            created: Instant::now(),
        }
    }
}

/// Order-insensitive, duplicate-suppressing reassembler.
///
/// One instance exists per tunnel session; it is only ever driven from one
/// task (or behind one mutex), so it needs no interior locking.
#[derive(Debug)]
pub struct Reassembler {
    pending: HashMap<u16, PendingPacket>,
    completed: HashMap<u16, Instant>,
    dup_window: Duration,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self::with_dup_window(DUP_WINDOW)
    }

    /// A reassembler with a custom duplicate-suppression window.
    pub fn with_dup_window(dup_window: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            completed: HashMap::new(),
            dup_window,
        }
    }

    /// Consume one chunk; returns the whole datagram when it completes.
    ///
    /// Duplicate chunks are idempotent, chunks for already-finished packets
    /// are dropped outright, and a `total` that disagrees with the pending
    /// record restarts that record (the sender generated a fresh datagram
    /// under a colliding id).
    pub fn ingest(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        let chunk = parse_chunk(data)?;
        if chunk.total == 0 || chunk.seq >= chunk.total {
            return None;
        }
        let now = Instant::now();
        let window = self.dup_window;
        self.completed.retain(|_, done| now.duration_since(*done) < window);
        if self.completed.contains_key(&chunk.packet_id) {
            return None;
        }

        if self.pending.len() >= PENDING_FLUSH_CAP && !self.pending.contains_key(&chunk.packet_id)
        {
            debug!(
                pending = self.pending.len(),
                "pending reassembly map overflow, flushing"
            );
            self.pending.clear();
        }

        let entry = self
            .pending
            .entry(chunk.packet_id)
            .or_insert_with(|| PendingPacket::new(chunk.total));
        if entry.slots.len() != chunk.total as usize {
            debug!(
                packet_id = chunk.packet_id,
                had = entry.slots.len(),
                got = chunk.total,
                "chunk total mismatch, restarting packet"
            );
            *entry = PendingPacket::new(chunk.total);
        }

        let slot = &mut entry.slots[chunk.seq as usize];
        if slot.is_none() {
            *slot = Some(chunk.payload.to_vec());
            entry.received += 1;
        }

        if entry.received < entry.slots.len() {
            return None;
        }

        let finished = self.pending.remove(&chunk.packet_id)?;
        self.completed.insert(chunk.packet_id, now);
        let mut datagram =
            Vec::with_capacity(finished.slots.iter().map(|s| s.as_ref().map_or(0, Vec::len)).sum());
        for slot in finished.slots {
            datagram.extend_from_slice(&slot?);
        }
        Some(datagram)
    }

    /// Number of partially reassembled packets.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop pending packets older than `max_age`.
    pub fn expire_pending(&mut self, max_age: Duration) {
        self.pending
            .retain(|_, entry| entry.created.elapsed() < max_age);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_CHUNK: usize = 124;

    #[test]
    fn single_chunk_roundtrip() {
        let data = vec![1u8, 2, 3, 4, 5];
        let chunks = fragment(&data, 0x1234, MAX_CHUNK).unwrap();
        assert_eq!(chunks.len(), 1);

        let parsed = parse_chunk(&chunks[0]).unwrap();
        assert_eq!(parsed.packet_id, 0x1234);
        assert_eq!(parsed.total, 1);
        assert_eq!(parsed.seq, 0);
        assert_eq!(parsed.payload, &data[..]);

        let mut r = Reassembler::new();
        assert_eq!(r.ingest(&chunks[0]), Some(data));
    }

    #[test]
    fn empty_datagram_survives() {
        let chunks = fragment(&[], 7, MAX_CHUNK).unwrap();
        assert_eq!(chunks.len(), 1);
        let mut r = Reassembler::new();
        assert_eq!(r.ingest(&chunks[0]), Some(Vec::new()));
    }

    #[test]
    fn splits_at_chunk_boundary() {
        let exact = vec![9u8; MAX_CHUNK];
        assert_eq!(fragment(&exact, 1, MAX_CHUNK).unwrap().len(), 1);
        let over = vec![9u8; MAX_CHUNK + 1];
        assert_eq!(fragment(&over, 1, MAX_CHUNK).unwrap().len(), 2);
    }

    #[test]
    fn rejects_oversized_datagram() {
        let limit = 255 * MAX_CHUNK;
        assert_eq!(fragment(&vec![0u8; limit], 1, MAX_CHUNK).unwrap().len(), 255);
        assert!(matches!(
            fragment(&vec![0u8; limit + 1], 1, MAX_CHUNK),
            Err(FragmentError::Oversized { .. })
        ));
    }

    #[test]
    fn reassembles_shuffled_255_chunks() {
        let data: Vec<u8> = (0..255 * MAX_CHUNK).map(|i| (i % 251) as u8).collect();
        let mut chunks = fragment(&data, 42, MAX_CHUNK).unwrap();
        // Deterministic shuffle: stride through the chunk list.
        let mut order: Vec<Vec<u8>> = Vec::with_capacity(chunks.len());
        let mut i = 0usize;
        while !chunks.is_empty() {
            i = (i + 97) % chunks.len();
            order.push(chunks.swap_remove(i));
        }

        let mut r = Reassembler::new();
        let mut emitted = None;
        for chunk in &order {
            if let Some(out) = r.ingest(chunk) {
                assert!(emitted.is_none(), "emitted more than once");
                emitted = Some(out);
            }
        }
        assert_eq!(emitted, Some(data));
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn duplicates_are_idempotent() {
        let data: Vec<u8> = (0..300).map(|i| i as u8).collect();
        let chunks = fragment(&data, 5, MAX_CHUNK).unwrap();
        assert_eq!(chunks.len(), 3);

        let mut r = Reassembler::new();
        let mut emissions = 0;
        // Every chunk delivered twice, interleaved.
        for chunk in chunks.iter().chain(chunks.iter()) {
            if r.ingest(chunk).is_some() {
                emissions += 1;
            }
        }
        assert_eq!(emissions, 1);
    }

    #[test]
    fn interleaved_packets_both_complete() {
        let d1: Vec<u8> = vec![0xaa; 250];
        let d2: Vec<u8> = vec![0xbb; 250];
        let c1 = fragment(&d1, 1, MAX_CHUNK).unwrap();
        let c2 = fragment(&d2, 2, MAX_CHUNK).unwrap();

        let mut r = Reassembler::new();
        let mut out = Vec::new();
        for (a, b) in c1.iter().zip(c2.iter()) {
            out.extend(r.ingest(a));
            out.extend(r.ingest(b));
        }
        assert_eq!(out, vec![d1, d2]);
    }

    #[test]
    fn reordered_delivery_then_late_duplicate() {
        let data: Vec<u8> = (0..300).map(|i| i as u8).collect();
        let chunks = fragment(&data, 0x7777, MAX_CHUNK).unwrap();

        let mut r = Reassembler::new();
        assert_eq!(r.ingest(&chunks[2]), None);
        assert_eq!(r.ingest(&chunks[0]), None);
        assert_eq!(r.ingest(&chunks[1]), Some(data));

        // A replay after completion neither emits nor reopens the packet.
        assert_eq!(r.ingest(&chunks[1]), None);
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn dup_window_expires() {
        let data = vec![3u8; 10];
        let chunks = fragment(&data, 9, MAX_CHUNK).unwrap();

        let mut r = Reassembler::with_dup_window(Duration::from_millis(40));
        assert_eq!(r.ingest(&chunks[0]), Some(data));

        // Inside the window: suppressed.
        assert_eq!(r.ingest(&chunks[0]), None);
        assert_eq!(r.pending_count(), 0);

        // After the window the id is forgotten; for a multi-chunk packet the
        // replayed chunk would open a fresh pending record.
        std::thread::sleep(Duration::from_millis(60));
        let big: Vec<u8> = vec![4u8; 300];
        let big_chunks = fragment(&big, 9, MAX_CHUNK).unwrap();
        assert_eq!(r.ingest(&big_chunks[0]), None);
        assert_eq!(r.pending_count(), 1);
    }

    #[test]
    fn total_mismatch_restarts_packet() {
        let small = fragment(&vec![1u8; 200], 11, MAX_CHUNK).unwrap();
        let large = fragment(&vec![2u8; 300], 11, MAX_CHUNK).unwrap();

        let mut r = Reassembler::new();
        assert_eq!(r.ingest(&small[0]), None);
        // Same packet_id, different total: the old record is discarded.
        for chunk in &large {
            let out = r.ingest(chunk);
            if chunk == large.last().unwrap() {
                assert_eq!(out, Some(vec![2u8; 300]));
            } else {
                assert_eq!(out, None);
            }
        }
    }

    #[test]
    fn short_input_dropped() {
        let mut r = Reassembler::new();
        assert_eq!(r.ingest(&[0x01, 0x02, 0x03]), None);
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn stray_seq_dropped() {
        // seq >= total is not a valid chunk.
        let mut bad = vec![0x00, 0x01, 2, 2];
        bad.push(0xff);
        let mut r = Reassembler::new();
        assert_eq!(r.ingest(&bad), None);
        assert_eq!(r.pending_count(), 0);
    }
}
