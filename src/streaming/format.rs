//! Little-endian primitives shared by the container header and chunk framing

use std::io::{self, Read, Write};

/// Container magic at offset zero.
pub const CONTAINER_MAGIC: &[u8; 4] = b"ATLS";

/// Magic that starts every framed chunk.
pub const FRAME_MAGIC: &[u8; 4] = b"ATSP";

/// Current stub table format version, written for every TOC.
pub const FORMAT_VERSION: u32 = 1;

/// Pack four ASCII bytes into a sentinel value.
pub const fn fourcc(tag: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*tag)
}

pub fn read_u8(reader: &mut impl Read) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub fn read_u32(reader: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn read_u64(reader: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn read_f32(reader: &mut impl Read) -> io::Result<f32> {
    Ok(f32::from_bits(read_u32(reader)?))
}

/// Read a string prefixed by its u8 length.
pub fn read_short_string(reader: &mut impl Read) -> io::Result<String> {
    let len = read_u8(reader)? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write a string prefixed by its u8 length. Longer strings are rejected.
pub fn write_short_string(writer: &mut impl Write, s: &str) -> io::Result<()> {
    let len = u8::try_from(s.len()).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("string too long: {}", s.len()))
    })?;
    writer.write_all(&[len])?;
    writer.write_all(s.as_bytes())
}

/// Read a fixed-width, zero-padded name field.
pub fn read_fixed_name<const N: usize>(reader: &mut impl Read) -> io::Result<String> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(N);
    String::from_utf8(buf[..end].to_vec()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write a name into a fixed-width, zero-padded field, truncating on a char boundary.
pub fn write_fixed_name<const N: usize>(writer: &mut impl Write, name: &str) -> io::Result<()> {
    let mut buf = [0u8; N];
    let mut end = name.len().min(N);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    buf[..end].copy_from_slice(&name.as_bytes()[..end]);
    writer.write_all(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_fourcc_is_byte_order() {
        assert_eq!(fourcc(b"agch").to_le_bytes(), *b"agch");
    }

    #[test]
    fn test_short_string_roundtrip() {
        let mut buf = Vec::new();
        write_short_string(&mut buf, "GeomTOC").unwrap();
        assert_eq!(buf[0], 7);
        let s = read_short_string(&mut Cursor::new(buf)).unwrap();
        assert_eq!(s, "GeomTOC");
    }

    #[test]
    fn test_short_string_too_long() {
        let long = "x".repeat(300);
        assert!(write_short_string(&mut Vec::new(), &long).is_err());
    }

    #[test]
    fn test_fixed_name_pads_and_truncates() {
        let mut buf = Vec::new();
        write_fixed_name::<8>(&mut buf, "schema").unwrap();
        assert_eq!(buf.len(), 8);
        assert_eq!(read_fixed_name::<8>(&mut Cursor::new(&buf)).unwrap(), "schema");

        let mut buf = Vec::new();
        write_fixed_name::<4>(&mut buf, "overlong").unwrap();
        assert_eq!(read_fixed_name::<4>(&mut Cursor::new(&buf)).unwrap(), "over");
    }
}
