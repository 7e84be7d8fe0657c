//! Streaming reads of column values out of logical packets.
//!
//! A row packet arrives as an ordered list of envelope payloads and may
//! exceed 2 GiB in total. The reader walks that list in place: small
//! packets get a byte-array convenience path, oversized ones only ever
//! hand out [`FieldValue`]s that reference the original buffers.

use bytes::Bytes;

use crate::error::{Error, Result};

/// Largest total size a [`FieldValue::Normal`] may hold.
const NORMAL_LIMIT: u64 = i32::MAX as u64;

/// One column value cut out of a row packet.
///
/// The value shares the row's underlying buffers; cloning retains them
/// and dropping the last clone releases them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// SQL NULL, i.e. the 0xFB marker in a text row.
    Null,
    /// A value of at most 2^31 - 1 bytes, contiguous.
    Normal(Bytes),
    /// A value larger than 2^31 - 1 bytes, as the ordered list of
    /// spans it occupies. Never copied into one allocation.
    Large(Vec<Bytes>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Total value size in bytes; 0 for NULL.
    pub fn len(&self) -> u64 {
        match self {
            FieldValue::Null => 0,
            FieldValue::Normal(bytes) => bytes.len() as u64,
            FieldValue::Large(parts) => parts.iter().map(|b| b.len() as u64).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The spans backing this value, in order.
    pub fn buffers(&self) -> &[Bytes] {
        match self {
            FieldValue::Null => &[],
            FieldValue::Normal(bytes) => std::slice::from_ref(bytes),
            FieldValue::Large(parts) => parts,
        }
    }
}

/// Cursor over an ordered list of buffers.
#[derive(Debug)]
struct BufferCursor {
    buffers: Vec<Bytes>,
    index: usize,
    offset: usize,
}

impl BufferCursor {
    fn new(buffers: Vec<Bytes>) -> Self {
        Self {
            buffers,
            index: 0,
            offset: 0,
        }
    }

    fn remaining(&self) -> u64 {
        let mut total = 0u64;
        if let Some(current) = self.buffers.get(self.index) {
            total += (current.len() - self.offset) as u64;
        }
        for buf in &self.buffers[(self.index + 1).min(self.buffers.len())..] {
            total += buf.len() as u64;
        }
        total
    }

    /// Skips exhausted buffers so `index` points at readable bytes.
    fn align(&mut self) {
        while let Some(current) = self.buffers.get(self.index) {
            if self.offset < current.len() {
                return;
            }
            self.index += 1;
            self.offset = 0;
        }
    }

    fn peek_u8(&mut self) -> Option<u8> {
        self.align();
        self.buffers.get(self.index).map(|buf| buf[self.offset])
    }

    fn read_u8(&mut self) -> Option<u8> {
        let byte = self.peek_u8()?;
        self.offset += 1;
        Some(byte)
    }

    /// Cuts `len` bytes into zero-copy spans, advancing the cursor.
    fn take_spans(&mut self, len: u64) -> Result<Vec<Bytes>> {
        let mut spans = Vec::new();
        let mut rest = len;

        while rest > 0 {
            self.align();
            let Some(current) = self.buffers.get(self.index) else {
                return Err(Error::ProtocolViolation(format!(
                    "field truncated: {rest} of {len} bytes missing"
                )));
            };

            let available = current.len() - self.offset;
            let take = (available as u64).min(rest) as usize;
            spans.push(current.slice(self.offset..self.offset + take));
            self.offset += take;
            rest -= take as u64;
        }

        Ok(spans)
    }

    fn copy_to_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let spans = self.take_spans(len as u64)?;
        let mut out = Vec::with_capacity(len);
        for span in &spans {
            out.extend_from_slice(span);
        }
        Ok(out)
    }
}

/// Reads field values from one logical packet.
///
/// Construction picks the mode from the packet's total size: packets
/// of at most 2^31 - 1 bytes allow contiguous byte-array reads, larger
/// ones restrict reads to span-referencing [`FieldValue`]s.
#[derive(Debug)]
pub enum FieldReader {
    Normal(NormalFieldReader),
    Large(LargeFieldReader),
}

impl FieldReader {
    pub fn new(buffers: Vec<Bytes>) -> Self {
        let total: u64 = buffers.iter().map(|b| b.len() as u64).sum();
        if total <= NORMAL_LIMIT {
            FieldReader::Normal(NormalFieldReader {
                cursor: BufferCursor::new(buffers),
            })
        } else {
            FieldReader::Large(LargeFieldReader {
                cursor: BufferCursor::new(buffers),
            })
        }
    }

    fn cursor(&mut self) -> &mut BufferCursor {
        match self {
            FieldReader::Normal(reader) => &mut reader.cursor,
            FieldReader::Large(reader) => &mut reader.cursor,
        }
    }

    /// Unread bytes left in the packet.
    pub fn remaining(&self) -> u64 {
        match self {
            FieldReader::Normal(reader) => reader.cursor.remaining(),
            FieldReader::Large(reader) => reader.cursor.remaining(),
        }
    }

    /// Current byte without advancing the cursor.
    pub fn peek_u8(&mut self) -> Result<u8> {
        self.cursor()
            .peek_u8()
            .ok_or_else(|| Error::ProtocolViolation("peek past end of packet".into()))
    }

    pub fn skip_one(&mut self) -> Result<()> {
        self.cursor()
            .read_u8()
            .map(drop)
            .ok_or_else(|| Error::ProtocolViolation("skip past end of packet".into()))
    }

    /// Reads `len` bytes into a fresh byte array.
    ///
    /// Only the normal mode supports this; a large packet refuses so a
    /// caller cannot accidentally materialise gigabytes.
    pub fn read_fixed_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        match self {
            FieldReader::Normal(reader) => reader.cursor.copy_to_vec(len),
            FieldReader::Large(_) => Err(Error::ProtocolViolation(
                "byte-array read on a large packet".into(),
            )),
        }
    }

    /// Reads a field of `len` known bytes as a [`FieldValue`].
    ///
    /// Spans stay zero-copy where they lie inside one buffer; a span
    /// that crosses buffers but fits the normal limit is stitched into
    /// one contiguous allocation, anything larger stays in parts.
    pub fn read_size_fixed_field(&mut self, len: u64) -> Result<FieldValue> {
        let spans = self.cursor().take_spans(len)?;
        Ok(field_from_spans(spans, len))
    }

    /// Reads a length-encoded field: varint length prefix, then that
    /// many bytes. The 0xFB marker decodes as NULL.
    pub fn read_var_int_sized_field(&mut self) -> Result<FieldValue> {
        if self.peek_u8()? == 0xFB {
            self.skip_one()?;
            return Ok(FieldValue::Null);
        }
        let len = self.read_var_int()?;
        self.read_size_fixed_field(len)
    }

    /// Reads a MySQL length-encoded integer (1, 3, 4 or 9 bytes).
    pub fn read_var_int(&mut self) -> Result<u64> {
        let cursor = self.cursor();
        let first = cursor
            .read_u8()
            .ok_or_else(|| Error::ProtocolViolation("varint past end of packet".into()))?;

        let read_le = |cursor: &mut BufferCursor, n: usize| -> Result<u64> {
            let mut value = 0u64;
            for shift in 0..n {
                let byte = cursor.read_u8().ok_or_else(|| {
                    Error::ProtocolViolation("varint truncated".into())
                })?;
                value |= u64::from(byte) << (8 * shift);
            }
            Ok(value)
        };

        match first {
            0x00..=0xFA => Ok(u64::from(first)),
            0xFC => read_le(cursor, 2),
            0xFD => read_le(cursor, 3),
            0xFE => read_le(cursor, 8),
            marker => Err(Error::ProtocolViolation(format!(
                "invalid varint marker 0x{marker:02X}"
            ))),
        }
    }
}

fn field_from_spans(spans: Vec<Bytes>, len: u64) -> FieldValue {
    if len > NORMAL_LIMIT {
        return FieldValue::Large(spans);
    }

    match spans.len() {
        0 => FieldValue::Normal(Bytes::new()),
        1 => FieldValue::Normal(spans.into_iter().next().expect("one span")),
        _ => {
            let mut stitched = Vec::with_capacity(len as usize);
            for span in &spans {
                stitched.extend_from_slice(span);
            }
            FieldValue::Normal(Bytes::from(stitched))
        }
    }
}

/// Reader over a packet of at most 2^31 - 1 bytes.
#[derive(Debug)]
pub struct NormalFieldReader {
    cursor: BufferCursor,
}

/// Reader over a packet larger than 2^31 - 1 bytes; the cursor is a
/// buffer index plus an offset into that buffer.
#[derive(Debug)]
pub struct LargeFieldReader {
    cursor: BufferCursor,
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::{FieldReader, FieldValue, NORMAL_LIMIT};

    fn reader_of(parts: &[&[u8]]) -> FieldReader {
        FieldReader::new(parts.iter().map(|p| Bytes::copy_from_slice(p)).collect())
    }

    #[test]
    fn test_mode_selection_by_total_size() {
        assert!(matches!(
            reader_of(&[b"small"]),
            FieldReader::Normal(_)
        ));

        // Many shared clones of one max-size buffer reach past 2^31 - 1
        // without allocating gigabytes.
        let chunk = Bytes::from(vec![0u8; 1 << 24]);
        let buffers: Vec<Bytes> = (0..129).map(|_| chunk.clone()).collect();
        let total: u64 = buffers.iter().map(|b| b.len() as u64).sum();
        assert!(total > NORMAL_LIMIT);
        assert!(matches!(FieldReader::new(buffers), FieldReader::Large(_)));
    }

    #[test]
    fn test_peek_does_not_advance() {
        let mut reader = reader_of(&[b"\x07rest"]);
        assert_eq!(reader.peek_u8().unwrap(), 7);
        assert_eq!(reader.peek_u8().unwrap(), 7);
        reader.skip_one().unwrap();
        assert_eq!(reader.peek_u8().unwrap(), b'r');
    }

    #[test]
    fn test_peek_crosses_empty_buffers() {
        let mut reader = reader_of(&[b"", b"", b"x"]);
        assert_eq!(reader.peek_u8().unwrap(), b'x');
    }

    #[test]
    fn test_read_fixed_bytes_across_buffers() {
        let mut reader = reader_of(&[b"ab", b"cd", b"ef"]);
        assert_eq!(reader.read_fixed_bytes(3).unwrap(), b"abc");
        assert_eq!(reader.read_fixed_bytes(3).unwrap(), b"def");
        assert!(reader.read_fixed_bytes(1).is_err());
    }

    #[test]
    fn test_size_fixed_field_zero_copy_within_buffer() {
        let mut reader = reader_of(&[b"hello world"]);
        let field = reader.read_size_fixed_field(5).unwrap();
        match field {
            FieldValue::Normal(bytes) => assert_eq!(&bytes[..], b"hello"),
            other => panic!("unexpected field {other:?}"),
        }
        assert_eq!(reader.remaining(), 6);
    }

    #[test]
    fn test_size_fixed_field_stitches_across_buffers() {
        let mut reader = reader_of(&[b"he", b"llo"]);
        let field = reader.read_size_fixed_field(5).unwrap();
        match field {
            FieldValue::Normal(bytes) => assert_eq!(&bytes[..], b"hello"),
            other => panic!("unexpected field {other:?}"),
        }
    }

    #[test]
    fn test_var_int_widths() {
        let mut reader = reader_of(&[&[0x42]]);
        assert_eq!(reader.read_var_int().unwrap(), 0x42);

        let mut reader = reader_of(&[&[0xFC, 0x34, 0x12]]);
        assert_eq!(reader.read_var_int().unwrap(), 0x1234);

        let mut reader = reader_of(&[&[0xFD, 0x56, 0x34, 0x12]]);
        assert_eq!(reader.read_var_int().unwrap(), 0x0012_3456);

        let mut reader = reader_of(&[&[
            0xFE, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08,
        ]]);
        assert_eq!(reader.read_var_int().unwrap(), 0x0807_0605_0403_0201);
    }

    #[test]
    fn test_var_int_crosses_buffer_boundary() {
        let mut reader = reader_of(&[&[0xFC, 0x34], &[0x12]]);
        assert_eq!(reader.read_var_int().unwrap(), 0x1234);
    }

    #[test]
    fn test_var_int_sized_field_null() {
        let mut reader = reader_of(&[&[0xFB, 0x01, b'a']]);
        assert!(reader.read_var_int_sized_field().unwrap().is_null());

        let field = reader.read_var_int_sized_field().unwrap();
        assert_eq!(field.buffers()[0].as_ref(), b"a");
    }

    #[test]
    fn test_large_refuses_fixed_bytes() {
        let chunk = Bytes::from(vec![0u8; 1 << 24]);
        let buffers: Vec<Bytes> = (0..129).map(|_| chunk.clone()).collect();
        let mut reader = FieldReader::new(buffers);
        assert!(reader.read_fixed_bytes(4).is_err());
    }

    #[test]
    fn test_large_field_keeps_spans() {
        let chunk = Bytes::from(vec![9u8; 1 << 24]);
        let buffers: Vec<Bytes> = (0..129).map(|_| chunk.clone()).collect();
        let total: u64 = buffers.iter().map(|b| b.len() as u64).sum();

        let mut reader = FieldReader::new(buffers);
        let field = reader.read_size_fixed_field(total).unwrap();
        match &field {
            FieldValue::Large(parts) => {
                assert_eq!(parts.len(), 129);
                assert_eq!(field.len(), total);
            }
            other => panic!("unexpected field {other:?}"),
        }
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_field_truncated() {
        let mut reader = reader_of(&[b"ab"]);
        assert!(reader.read_size_fixed_field(3).is_err());
    }
}
