//! Sequential big-endian codec shared by every datagram family.
//!
//! [`ByteReader`] walks an immutable buffer with a moving offset and hands out
//! borrowed sub-slices, so raw fields are never copied during a decode pass.
//! [`ByteWriter`] records scalars and borrowed byte ranges as chunks and
//! concatenates them exactly once in [`ByteWriter::finish`].
//!
//! Variable-length fields always travel as `(u32 length, raw bytes)`. The
//! `*_prefixed` helpers are the only place that convention is spelled out.

use bytes::{BufMut, Bytes, BytesMut};

use crate::errors::{ProtocolError, Result};

mod sealed {
    pub trait Sealed {}
}

/// Fixed-width scalar that can be written and read big-endian.
///
/// Implemented for the 1/2/4/8-byte signed and unsigned integers and for
/// `f32`/`f64`. The width is a compile-time constant of the type.
pub trait WireScalar: Copy + sealed::Sealed {
    /// Encoded width in bytes
    const WIDTH: usize;

    /// Write `self` big-endian into `dst[..WIDTH]`.
    fn put_be(self, dst: &mut [u8]);

    /// Interpret `src[..WIDTH]` as a big-endian value.
    fn get_be(src: &[u8]) -> Self;
}

macro_rules! impl_wire_scalar {
    ($($ty:ty),* $(,)?) => {$(
        impl sealed::Sealed for $ty {}

        impl WireScalar for $ty {
            const WIDTH: usize = std::mem::size_of::<$ty>();

            fn put_be(self, dst: &mut [u8]) {
                dst[..Self::WIDTH].copy_from_slice(&self.to_be_bytes());
            }

            fn get_be(src: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(&src[..Self::WIDTH]);
                <$ty>::from_be_bytes(raw)
            }
        }
    )*};
}

impl_wire_scalar!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

/// Cursor over a borrowed datagram.
///
/// Every successful read advances the offset. A read that would run past the
/// end fails with [`ProtocolError::Truncated`] and leaves the offset where it
/// was.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    /// Start reading `buf` from offset 0.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    /// Current read offset
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes left after the current offset
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    /// True once every byte has been consumed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Read one big-endian scalar.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Truncated`] if fewer than `T::WIDTH` bytes
    /// remain.
    pub fn read<T: WireScalar>(&mut self) -> Result<T> {
        let raw = self.read_bytes(T::WIDTH)?;
        Ok(T::get_be(raw))
    }

    /// Borrow the next `len` bytes without copying.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Truncated`] if fewer than `len` bytes remain.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(ProtocolError::Truncated {
                offset: self.offset,
                needed: len,
                available: self.remaining(),
            });
        }

        let start = self.offset;
        self.offset += len;
        Ok(&self.buf[start..self.offset])
    }

    /// Read a fixed-size array (signatures, nonces).
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Truncated`] if fewer than `N` bytes remain.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    /// Read a `(u32 length, raw bytes)` field.
    ///
    /// The length is validated against the remaining buffer before anything
    /// is borrowed, so a hostile prefix cannot cause an out-of-bounds read or
    /// a large allocation. On failure the offset is left at the start of the
    /// length prefix.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Truncated`] if either the prefix or the
    /// declared body does not fit.
    pub fn read_prefixed(&mut self) -> Result<&'a [u8]> {
        let start = self.offset;
        let len = self.read::<u32>()? as usize;

        self.read_bytes(len).inspect_err(|_| self.offset = start)
    }
}

/// One recorded piece of output.
#[derive(Debug)]
enum Chunk<'a> {
    Scalar { raw: [u8; 8], width: u8 },
    Borrowed(&'a [u8]),
    Shared(Bytes),
}

impl Chunk<'_> {
    fn as_slice(&self) -> &[u8] {
        match self {
            Chunk::Scalar { raw, width } => &raw[..usize::from(*width)],
            Chunk::Borrowed(slice) => slice,
            Chunk::Shared(bytes) => bytes,
        }
    }
}

/// Chunked big-endian writer for building one datagram.
///
/// Writes are recorded, not copied; [`ByteWriter::finish`] consumes the writer
/// and performs the single concatenation into a right-sized buffer.
#[derive(Debug, Default)]
pub struct ByteWriter<'a> {
    chunks: Vec<Chunk<'a>>,
    len: usize,
}

impl<'a> ByteWriter<'a> {
    /// Create an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self { chunks: Vec::new(), len: 0 }
    }

    /// Total bytes recorded so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if nothing has been written
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append one big-endian scalar at its declared width.
    pub fn write<T: WireScalar>(&mut self, value: T) -> &mut Self {
        let mut raw = [0u8; 8];
        value.put_be(&mut raw);

        #[allow(clippy::cast_possible_truncation)]
        self.chunks.push(Chunk::Scalar { raw, width: T::WIDTH as u8 });
        self.len += T::WIDTH;
        self
    }

    /// Append a raw byte range unmodified.
    pub fn write_bytes(&mut self, bytes: &'a [u8]) -> &mut Self {
        if !bytes.is_empty() {
            self.len += bytes.len();
            self.chunks.push(Chunk::Borrowed(bytes));
        }
        self
    }

    /// Append a reference-counted buffer unmodified.
    pub fn write_shared(&mut self, bytes: Bytes) -> &mut Self {
        if !bytes.is_empty() {
            self.len += bytes.len();
            self.chunks.push(Chunk::Shared(bytes));
        }
        self
    }

    /// Append a `(u32 length, raw bytes)` field.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FieldTooLong`] if `bytes` cannot be described
    /// by a `u32` length.
    pub fn write_prefixed(&mut self, bytes: &'a [u8]) -> Result<&mut Self> {
        let len = prefix_len(bytes.len())?;
        self.write(len);
        Ok(self.write_bytes(bytes))
    }

    /// Concatenate every recorded chunk into one buffer.
    #[must_use]
    pub fn finish(self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.len);
        for chunk in &self.chunks {
            out.put_slice(chunk.as_slice());
        }

        debug_assert_eq!(out.len(), self.len);
        out.freeze()
    }
}

/// Length of a variable field as it appears on the wire.
///
/// # Errors
///
/// Returns [`ProtocolError::FieldTooLong`] if `len` exceeds `u32::MAX`.
pub fn prefix_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| ProtocolError::FieldTooLong { len })
}

/// Encoded size of a `(u32 length, raw bytes)` field holding `len` bytes.
#[must_use]
pub const fn prefixed_size(len: usize) -> usize {
    4 + len
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn scalars_are_big_endian_at_declared_width() {
        let mut writer = ByteWriter::new();
        writer.write(0x01u8).write(0x0203u16).write(0x0405_0607u32).write(-2i16);
        let bytes = writer.finish();

        assert_eq!(&bytes[..], &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0xFF, 0xFE]);
    }

    #[test]
    fn floats_round_trip_bitwise() {
        let mut writer = ByteWriter::new();
        writer.write(1.5f32).write(-0.25f64);
        let bytes = writer.finish();
        assert_eq!(bytes.len(), 12);

        let mut reader = ByteReader::new(&bytes);
        assert_eq!(reader.read::<f32>().unwrap(), 1.5);
        assert_eq!(reader.read::<f64>().unwrap(), -0.25);
        assert!(reader.is_empty());
    }

    #[test]
    fn reads_advance_offset() {
        let buf = [0u8, 0, 0, 2, 0xAA, 0xBB, 0xCC];
        let mut reader = ByteReader::new(&buf);

        assert_eq!(reader.read_prefixed().unwrap(), &[0xAA, 0xBB]);
        assert_eq!(reader.offset(), 6);
        assert_eq!(reader.read::<u8>().unwrap(), 0xCC);
        assert!(reader.is_empty());
    }

    #[test]
    fn read_past_end_fails_without_advancing() {
        let buf = [0u8, 1, 2];
        let mut reader = ByteReader::new(&buf);

        let err = reader.read::<u32>().unwrap_err();
        assert_eq!(err, ProtocolError::Truncated { offset: 0, needed: 4, available: 3 });
        assert_eq!(reader.offset(), 0);
    }

    #[test]
    fn oversized_prefix_is_rejected() {
        // Claims 0xFFFF_FFFF bytes with only two present
        let buf = [0xFF, 0xFF, 0xFF, 0xFF, 0x01, 0x02];
        let mut reader = ByteReader::new(&buf);

        assert!(matches!(reader.read_prefixed(), Err(ProtocolError::Truncated { .. })));
        assert_eq!(reader.offset(), 0);
    }

    #[test]
    fn writer_tracks_length_and_skips_empty_ranges() {
        let mut writer = ByteWriter::new();
        writer.write_bytes(&[]);
        assert!(writer.is_empty());

        writer.write_prefixed(b"abc").unwrap();
        writer.write_shared(Bytes::from_static(b"de"));
        assert_eq!(writer.len(), 9);
        assert_eq!(&writer.finish()[..], b"\x00\x00\x00\x03abcde");
    }

    proptest! {
        #[test]
        fn prefixed_fields_survive_the_wire(fields in prop::collection::vec(any::<Vec<u8>>(), 0..8)) {
            let mut writer = ByteWriter::new();
            for field in &fields {
                writer.write_prefixed(field).unwrap();
            }
            let expected_len: usize = fields.iter().map(|f| prefixed_size(f.len())).sum();
            let bytes = writer.finish();
            prop_assert_eq!(bytes.len(), expected_len);

            let mut reader = ByteReader::new(&bytes);
            for field in &fields {
                prop_assert_eq!(reader.read_prefixed().unwrap(), &field[..]);
            }
            prop_assert!(reader.is_empty());
        }

        #[test]
        fn prefix_longer_than_buffer_never_reads_out_of_bounds(
            declared in any::<u32>(),
            body in prop::collection::vec(any::<u8>(), 0..64),
        ) {
            let mut buf = declared.to_be_bytes().to_vec();
            buf.extend_from_slice(&body);

            let mut reader = ByteReader::new(&buf);
            let result = reader.read_prefixed();

            if declared as usize <= body.len() {
                prop_assert_eq!(result.unwrap(), &body[..declared as usize]);
            } else {
                let is_truncated = matches!(result, Err(ProtocolError::Truncated { .. }));
                prop_assert!(is_truncated);
            }
        }

        #[test]
        fn u64_round_trip(value in any::<u64>(), signed in any::<i32>()) {
            let mut writer = ByteWriter::new();
            writer.write(value).write(signed);
            let bytes = writer.finish();

            let mut reader = ByteReader::new(&bytes);
            prop_assert_eq!(reader.read::<u64>().unwrap(), value);
            prop_assert_eq!(reader.read::<i32>().unwrap(), signed);
        }
    }
}
