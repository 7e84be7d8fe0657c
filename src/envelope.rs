//! Logic for slicing and building MySQL envelopes.
//!
//! MySQL frames every payload in envelopes of at most 2^24 - 1 bytes:
//! a 3-byte little-endian payload length, a 1-byte sequence id, then
//! the payload. A message whose payload is exactly the maximum
//! continues in the next envelope; the first envelope with a shorter
//! (possibly empty) payload terminates the logical packet.
//!
//! See: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_packets.html>

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Maximum payload size of a single envelope (2^24 - 1 bytes).
pub const MAX_ENVELOPE_SIZE: usize = 0xFF_FF_FF;

/// Size of the envelope header in bytes.
pub const ENVELOPE_HEADER_SIZE: usize = 4;

/// One framing unit on the wire: sequence id plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Sequence id, contiguous modulo 256 within one exchange.
    pub sequence_id: u8,
    /// Payload bytes, at most [`MAX_ENVELOPE_SIZE`] of them.
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// Whether this envelope continues in the next one.
    pub fn is_continuation(&self) -> bool {
        self.payload.len() == MAX_ENVELOPE_SIZE
    }

    /// Re-encodes header and payload into `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        put_envelope_header(out, self.payload.len(), self.sequence_id);
        out.extend_from_slice(&self.payload);
    }
}

#[inline]
fn put_envelope_header(out: &mut BytesMut, len: usize, sequence_id: u8) {
    debug_assert!(len <= MAX_ENVELOPE_SIZE);
    out.put_u8((len & 0xFF) as u8);
    out.put_u8(((len >> 8) & 0xFF) as u8);
    out.put_u8(((len >> 16) & 0xFF) as u8);
    out.put_u8(sequence_id);
}

/// Splits a payload into envelopes with consecutive sequence ids.
///
/// A payload that is an exact multiple of [`MAX_ENVELOPE_SIZE`]
/// (including the empty payload) gets a terminating empty envelope so
/// the peer can tell the message is complete. `sequence_id` is advanced
/// past the last id written, wrapping at 255.
pub fn write_envelopes(payload: &[u8], sequence_id: &mut u8, out: &mut BytesMut) {
    let mut rest = payload;

    loop {
        let take = rest.len().min(MAX_ENVELOPE_SIZE);
        put_envelope_header(out, take, *sequence_id);
        out.extend_from_slice(&rest[..take]);
        *sequence_id = sequence_id.wrapping_add(1);
        rest = &rest[take..];

        // A max-size chunk forces a follow-up envelope, empty if need be.
        if take < MAX_ENVELOPE_SIZE {
            break;
        }
    }
}

/// Splits the raw inbound byte stream into envelopes.
///
/// Holds a rolling buffer; [`feed`](Self::feed) appends a chunk read
/// from the transport and [`next_envelope`](Self::next_envelope)
/// extracts complete envelopes without copying payload bytes.
#[derive(Debug, Default)]
pub struct EnvelopeSlicer {
    buf: BytesMut,
}

impl EnvelopeSlicer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk of raw bytes from the transport.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Buffer to read into directly, avoiding the `feed` copy.
    pub fn read_buf(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Extracts the next complete envelope, if the buffer holds one.
    pub fn next_envelope(&mut self) -> Option<Envelope> {
        if self.buf.len() < ENVELOPE_HEADER_SIZE {
            return None;
        }

        let len = u32::from(self.buf[0])
            | (u32::from(self.buf[1]) << 8)
            | (u32::from(self.buf[2]) << 16);
        let len = len as usize;

        if self.buf.len() < ENVELOPE_HEADER_SIZE + len {
            return None;
        }

        let sequence_id = self.buf[3];
        self.buf.advance(ENVELOPE_HEADER_SIZE);
        let payload = self.buf.split_to(len).freeze();

        Some(Envelope {
            sequence_id,
            payload,
        })
    }

    /// Bytes retained awaiting a complete envelope.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Reassembles logical packets from a run of envelopes.
///
/// Envelopes with a max-size payload accumulate; the first shorter one
/// completes the packet, emitted as the ordered list of payload buffers
/// so a multi-gigabyte packet never has to be contiguous. Sequence ids
/// are checked for contiguity modulo 256.
#[derive(Debug, Default)]
pub struct PacketAssembler {
    parts: Vec<Bytes>,
    expected_sequence_id: Option<u8>,
}

impl PacketAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets the expected sequence id at an exchange boundary.
    pub fn reset_sequence_id(&mut self) {
        self.expected_sequence_id = None;
    }

    /// The sequence id the next outbound envelope should carry, i.e.
    /// one past the last inbound envelope observed.
    pub fn next_sequence_id(&self) -> u8 {
        self.expected_sequence_id.unwrap_or(0)
    }

    /// Pins the sequence id the next inbound envelope must carry,
    /// after the client wrote envelopes of its own.
    pub fn expect_sequence_id(&mut self, sequence_id: u8) {
        self.expected_sequence_id = Some(sequence_id);
    }

    /// Feeds one envelope; returns the completed logical packet, if any.
    ///
    /// A sequence-id gap means the connection has desynchronised and
    /// is reported as a protocol violation.
    pub fn push(&mut self, envelope: Envelope) -> Result<Option<Vec<Bytes>>> {
        if let Some(expected) = self.expected_sequence_id {
            if envelope.sequence_id != expected {
                return Err(Error::ProtocolViolation(format!(
                    "sequence id mismatch: expected {expected}, got {}",
                    envelope.sequence_id
                )));
            }
        }
        self.expected_sequence_id = Some(envelope.sequence_id.wrapping_add(1));

        let terminal = !envelope.is_continuation();
        self.parts.push(envelope.payload);

        if terminal {
            Ok(Some(std::mem::take(&mut self.parts)))
        } else {
            Ok(None)
        }
    }

    /// Whether a partially-assembled packet is pending.
    pub fn in_progress(&self) -> bool {
        !self.parts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};

    use super::{Envelope, EnvelopeSlicer, MAX_ENVELOPE_SIZE, PacketAssembler, write_envelopes};

    #[test]
    fn test_slice_single_envelope() {
        let mut slicer = EnvelopeSlicer::new();
        slicer.feed(&[3, 0, 0, 5, b'a', b'b', b'c']);

        let env = slicer.next_envelope().unwrap();
        assert_eq!(env.sequence_id, 5);
        assert_eq!(&env.payload[..], b"abc");
        assert!(slicer.next_envelope().is_none());
        assert_eq!(slicer.pending(), 0);
    }

    #[test]
    fn test_slice_waits_for_full_payload() {
        let mut slicer = EnvelopeSlicer::new();
        slicer.feed(&[3, 0, 0, 0, b'a']);
        assert!(slicer.next_envelope().is_none());

        slicer.feed(&[b'b', b'c']);
        let env = slicer.next_envelope().unwrap();
        assert_eq!(&env.payload[..], b"abc");
    }

    #[test]
    fn test_slice_waits_for_header() {
        let mut slicer = EnvelopeSlicer::new();
        slicer.feed(&[1, 0]);
        assert!(slicer.next_envelope().is_none());
        slicer.feed(&[0, 9, 0xAA]);
        let env = slicer.next_envelope().unwrap();
        assert_eq!(env.sequence_id, 9);
        assert_eq!(&env.payload[..], &[0xAA]);
    }

    #[test]
    fn test_slice_multiple_envelopes_in_one_chunk() {
        let mut slicer = EnvelopeSlicer::new();
        slicer.feed(&[1, 0, 0, 0, b'x', 2, 0, 0, 1, b'y', b'z']);

        assert_eq!(&slicer.next_envelope().unwrap().payload[..], b"x");
        assert_eq!(&slicer.next_envelope().unwrap().payload[..], b"yz");
        assert!(slicer.next_envelope().is_none());
    }

    #[test]
    fn test_slice_empty_envelope() {
        let mut slicer = EnvelopeSlicer::new();
        slicer.feed(&[0, 0, 0, 2]);
        let env = slicer.next_envelope().unwrap();
        assert_eq!(env.sequence_id, 2);
        assert!(env.payload.is_empty());
    }

    #[test]
    fn test_write_small_payload() {
        let mut out = BytesMut::new();
        let mut seq = 0;
        write_envelopes(b"ping", &mut seq, &mut out);

        assert_eq!(&out[..], &[4, 0, 0, 0, b'p', b'i', b'n', b'g']);
        assert_eq!(seq, 1);
    }

    #[test]
    fn test_write_empty_payload() {
        let mut out = BytesMut::new();
        let mut seq = 3;
        write_envelopes(b"", &mut seq, &mut out);

        assert_eq!(&out[..], &[0, 0, 0, 3]);
        assert_eq!(seq, 4);
    }

    #[test]
    fn test_write_exact_multiple_gets_empty_terminator() {
        let payload = vec![0u8; MAX_ENVELOPE_SIZE];
        let mut out = BytesMut::new();
        let mut seq = 0;
        write_envelopes(&payload, &mut seq, &mut out);

        // One full envelope plus an empty terminator.
        assert_eq!(out.len(), 4 + MAX_ENVELOPE_SIZE + 4);
        assert_eq!(&out[..4], &[0xFF, 0xFF, 0xFF, 0]);
        let tail = &out[4 + MAX_ENVELOPE_SIZE..];
        assert_eq!(tail, &[0, 0, 0, 1]);
        assert_eq!(seq, 2);
    }

    #[test]
    fn test_sequence_id_wraps_mid_message() {
        // Enough payload for 256+ envelopes starting near the wrap point.
        let payload = vec![0u8; MAX_ENVELOPE_SIZE * 2 + 1];
        let mut out = BytesMut::new();
        let mut seq = 255;
        write_envelopes(&payload, &mut seq, &mut out);

        assert_eq!(out[3], 255);
        assert_eq!(out[4 + MAX_ENVELOPE_SIZE + 3], 0);
        assert_eq!(out[(4 + MAX_ENVELOPE_SIZE) * 2 + 3], 1);
        assert_eq!(seq, 2);
    }

    #[test]
    fn test_assemble_single() {
        let mut assembler = PacketAssembler::new();
        let packet = assembler
            .push(Envelope::new(0, Bytes::from_static(b"abc")))
            .unwrap()
            .unwrap();
        assert_eq!(packet.len(), 1);
        assert_eq!(&packet[0][..], b"abc");
    }

    #[test]
    fn test_assemble_continuation() {
        let mut assembler = PacketAssembler::new();
        let full = Bytes::from(vec![7u8; MAX_ENVELOPE_SIZE]);

        assert!(assembler.push(Envelope::new(0, full.clone())).unwrap().is_none());
        assert!(assembler.in_progress());

        let packet = assembler
            .push(Envelope::new(1, Bytes::from_static(b"tail")))
            .unwrap()
            .unwrap();
        assert_eq!(packet.len(), 2);
        assert_eq!(packet[0].len(), MAX_ENVELOPE_SIZE);
        assert_eq!(&packet[1][..], b"tail");
    }

    #[test]
    fn test_assemble_max_plus_empty_is_one_packet() {
        let mut assembler = PacketAssembler::new();
        let full = Bytes::from(vec![1u8; MAX_ENVELOPE_SIZE]);

        assert!(assembler.push(Envelope::new(0, full)).unwrap().is_none());
        let packet = assembler
            .push(Envelope::new(1, Bytes::new()))
            .unwrap()
            .unwrap();

        let total: usize = packet.iter().map(|b| b.len()).sum();
        assert_eq!(total, MAX_ENVELOPE_SIZE);
    }

    #[test]
    fn test_assemble_rejects_sequence_gap() {
        let mut assembler = PacketAssembler::new();
        assembler
            .push(Envelope::new(0, Bytes::from_static(b"a")))
            .unwrap();
        let err = assembler
            .push(Envelope::new(5, Bytes::from_static(b"b")))
            .unwrap_err();
        assert!(err.to_string().contains("sequence id"));
    }

    #[test]
    fn test_slice_then_reencode_is_identity() {
        let mut wire = BytesMut::new();
        let mut seq = 0;
        write_envelopes(b"first", &mut seq, &mut wire);
        write_envelopes(&[0xAB; 300], &mut seq, &mut wire);
        write_envelopes(b"", &mut seq, &mut wire);
        let original = wire.clone();

        let mut slicer = EnvelopeSlicer::new();
        slicer.feed(&wire);

        let mut reencoded = BytesMut::new();
        while let Some(env) = slicer.next_envelope() {
            env.encode(&mut reencoded);
        }

        assert_eq!(&original[..], &reencoded[..]);
    }
}
