//! Primitive field encoding shared by methods and content headers.
//!
//! All integers are big-endian. Short strings carry a one-byte length, long
//! strings and tables a four-byte length. Tables are never interpreted; they
//! are carried as raw bytes.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub(crate) fn invalid_data(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

/// Bounds-checked reader over a received frame payload.
pub(crate) struct Reader {
    buf: Bytes,
}

impl Reader {
    pub(crate) fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize, what: &str) -> io::Result<()> {
        if self.buf.remaining() < n {
            return Err(invalid_data(format!(
                "truncated {what}: need {n} bytes, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub(crate) fn u8(&mut self) -> io::Result<u8> {
        self.need(1, "octet")?;
        Ok(self.buf.get_u8())
    }

    pub(crate) fn u16(&mut self) -> io::Result<u16> {
        self.need(2, "short")?;
        Ok(self.buf.get_u16())
    }

    pub(crate) fn u32(&mut self) -> io::Result<u32> {
        self.need(4, "long")?;
        Ok(self.buf.get_u32())
    }

    pub(crate) fn u64(&mut self) -> io::Result<u64> {
        self.need(8, "longlong")?;
        Ok(self.buf.get_u64())
    }

    pub(crate) fn short_str(&mut self) -> io::Result<String> {
        let len = usize::from(self.u8()?);
        self.need(len, "shortstr")?;
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec()).map_err(|_| invalid_data("shortstr is not valid UTF-8"))
    }

    pub(crate) fn long_bytes(&mut self) -> io::Result<Bytes> {
        let len = self.u32()? as usize;
        self.need(len, "longstr")?;
        Ok(self.buf.split_to(len))
    }

    pub(crate) fn long_str(&mut self) -> io::Result<String> {
        let raw = self.long_bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| invalid_data("longstr is not valid UTF-8"))
    }

    /// A field table, returned undecoded (without its length prefix).
    pub(crate) fn table(&mut self) -> io::Result<Bytes> {
        self.long_bytes()
    }

    /// Everything not yet consumed.
    pub(crate) fn rest(&mut self) -> Bytes {
        self.buf.split_off(0)
    }
}

pub(crate) fn put_short_str(dst: &mut BytesMut, value: &str) -> io::Result<()> {
    let len = u8::try_from(value.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("shortstr too long: {} bytes (max 255)", value.len()),
        )
    })?;
    dst.put_u8(len);
    dst.extend_from_slice(value.as_bytes());
    Ok(())
}

pub(crate) fn put_long_bytes(dst: &mut BytesMut, value: &[u8]) -> io::Result<()> {
    let len = u32::try_from(value.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "longstr too long"))?;
    dst.put_u32(len);
    dst.extend_from_slice(value);
    Ok(())
}

/// Pack boolean flags into one octet, first flag in the lowest bit.
pub(crate) fn pack_bits(flags: &[bool]) -> u8 {
    flags
        .iter()
        .enumerate()
        .fold(0u8, |acc, (i, &set)| if set { acc | (1 << i) } else { acc })
}

pub(crate) fn bit(octet: u8, index: u8) -> bool {
    octet & (1 << index) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_reads_fail() {
        let mut reader = Reader::new(Bytes::from_static(&[0, 1, 2]));
        assert!(reader.u32().is_err());

        let mut reader = Reader::new(Bytes::from_static(&[5, b'a', b'b']));
        let err = reader.short_str().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_short_str_length_limit() {
        let mut dst = BytesMut::new();
        assert!(put_short_str(&mut dst, &"x".repeat(255)).is_ok());
        let err = put_short_str(&mut dst, &"x".repeat(256)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_bits() {
        let packed = pack_bits(&[true, false, true]);
        assert_eq!(packed, 0b101);
        assert!(bit(packed, 0));
        assert!(!bit(packed, 1));
        assert!(bit(packed, 2));
    }
}
