//! Wire-level invariants checked with generated inputs.

use bytes::{Bytes, BytesMut};
use proptest::collection::vec;
use proptest::prelude::*;

use mysql_stream::{
    Envelope, EnvelopeSlicer, FieldReader, MAX_ENVELOPE_SIZE, PacketAssembler,
    messages::{put_lenenc_int, read_lenenc_int},
    write_envelopes,
};

proptest! {
    /// Slicing a valid envelope stream and re-encoding it yields the
    /// original bytes, regardless of how the stream is chunked.
    #[test]
    fn prop_slice_then_reencode_is_identity(
        payloads in vec(vec(any::<u8>(), 0..512), 0..8),
        chunk_size in 1usize..64,
    ) {
        let mut wire = BytesMut::new();
        let mut sequence_id = 0;
        for payload in &payloads {
            write_envelopes(payload, &mut sequence_id, &mut wire);
        }
        let original = wire.to_vec();

        let mut slicer = EnvelopeSlicer::new();
        let mut reencoded = BytesMut::new();
        for chunk in original.chunks(chunk_size) {
            slicer.feed(chunk);
            while let Some(envelope) = slicer.next_envelope() {
                envelope.encode(&mut reencoded);
            }
        }

        prop_assert_eq!(original, reencoded.to_vec());
        prop_assert_eq!(slicer.pending(), 0);
    }

    /// Length-encoded integers round-trip over the whole u64 range.
    #[test]
    fn prop_lenenc_int_roundtrip(value in any::<u64>()) {
        let mut buf = BytesMut::new();
        put_lenenc_int(&mut buf, value);

        let (decoded, consumed) = read_lenenc_int(&buf).expect("decodes");
        prop_assert_eq!(decoded, value);
        prop_assert_eq!(consumed, buf.len());
    }

    /// Reading fixed chunks through a field reader sees the same bytes
    /// as the concatenated packet, however it was split into buffers.
    #[test]
    fn prop_field_reader_preserves_bytes(
        data in vec(any::<u8>(), 1..2048),
        splits in vec(1usize..256, 0..8),
    ) {
        let mut buffers = Vec::new();
        let mut rest = &data[..];
        for split in splits {
            if rest.is_empty() {
                break;
            }
            let take = split.min(rest.len());
            buffers.push(Bytes::copy_from_slice(&rest[..take]));
            rest = &rest[take..];
        }
        if !rest.is_empty() {
            buffers.push(Bytes::copy_from_slice(rest));
        }

        let mut reader = FieldReader::new(buffers);
        let mut seen = Vec::new();
        while reader.remaining() > 0 {
            let take = (reader.remaining() as usize).min(7);
            seen.extend_from_slice(&reader.read_fixed_bytes(take).unwrap());
        }
        prop_assert_eq!(seen, data);
    }
}

#[test]
fn test_max_envelope_plus_empty_is_one_packet() {
    let mut assembler = PacketAssembler::new();
    let full = Bytes::from(vec![0u8; MAX_ENVELOPE_SIZE]);

    assert!(assembler.push(Envelope::new(0, full)).unwrap().is_none());
    let packet = assembler
        .push(Envelope::new(1, Bytes::new()))
        .unwrap()
        .unwrap();

    let total: usize = packet.iter().map(|b| b.len()).sum();
    assert_eq!(total, MAX_ENVELOPE_SIZE);
}

#[test]
fn test_two_gigabyte_packet_selects_large_mode() {
    // 2^31 bytes of shared clones: mode selection must go Large one
    // byte past i32::MAX, without this test allocating gigabytes.
    let chunk = Bytes::from(vec![0u8; 1 << 24]);
    let buffers: Vec<Bytes> = (0..128).map(|_| chunk.clone()).collect();
    let total: u64 = buffers.iter().map(|b| b.len() as u64).sum();
    assert_eq!(total, 1 << 31);

    let mut reader = FieldReader::new(buffers);
    assert!(matches!(reader, FieldReader::Large(_)));
    assert!(reader.read_fixed_bytes(1).is_err());

    // One byte short of the boundary stays Normal.
    let mut buffers: Vec<Bytes> = (0..127).map(|_| chunk.clone()).collect();
    buffers.push(chunk.slice(..(1 << 24) - 1));
    let reader = FieldReader::new(buffers);
    assert!(matches!(reader, FieldReader::Normal(_)));
}

#[test]
fn test_sequence_id_wraps_at_256() {
    // A message spanning more than 256 envelopes walks its sequence
    // ids 0..=255 and wraps back to 0 mid-message.
    let mut wire = BytesMut::new();
    let mut sequence_id = 255;
    let payload = vec![0u8; MAX_ENVELOPE_SIZE + 1];
    write_envelopes(&payload, &mut sequence_id, &mut wire);

    let mut slicer = EnvelopeSlicer::new();
    slicer.feed(&wire);
    assert_eq!(slicer.next_envelope().unwrap().sequence_id, 255);
    assert_eq!(slicer.next_envelope().unwrap().sequence_id, 0);
    assert_eq!(sequence_id, 1);

    // The assembler accepts the wrap as contiguous across an
    // arbitrarily long run of envelopes.
    let mut assembler = PacketAssembler::new();
    for turn in 0u32..300 {
        let envelope = Envelope::new((turn % 256) as u8, Bytes::from_static(b"x"));
        assert!(assembler.push(envelope).unwrap().is_some());
    }
}
