//! KLV (Key-Length-Value) triplet handling
//!
//! All data in MXF files is encoded as KLV triplets:
//! - Key: 16-byte Universal Label identifying the data
//! - Length: BER-encoded length of the value
//! - Value: The actual data
//!
//! The stream functions only read or write the key and length; values are
//! streamed by the caller so large essence elements are never duplicated.

use crate::error::{MxfError, Result};
use crate::stream::StreamExt;
use crate::ul::{labels, UniversalLabel};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Seek, Write};

/// Size of a KLV key in bytes
pub const KEY_LEN: u64 = 16;

/// Largest length-of-length supported (1 prefix byte + 8 value bytes)
pub const MAX_LLEN: u8 = 9;

/// Key and length of one KLV triplet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KlHeader {
    /// Universal Label (key)
    pub key: UniversalLabel,
    /// Number of bytes used by the BER length
    pub llen: u8,
    /// Value length
    pub len: u64,
}

impl KlHeader {
    /// Size of key plus length field
    pub fn header_len(&self) -> u64 {
        KEY_LEN + self.llen as u64
    }

    /// Size of the whole triplet, saturating for lengths near `u64::MAX`
    pub fn total_len(&self) -> u64 {
        self.header_len().saturating_add(self.len)
    }
}

/// A KLV triplet held in memory
#[derive(Debug, Clone)]
pub struct Klv {
    /// Universal Label (key)
    pub key: UniversalLabel,
    /// Value data
    pub value: Vec<u8>,
    /// Offset of the key in the source buffer
    pub offset: u64,
}

impl Klv {
    /// Create new KLV
    pub fn new(key: UniversalLabel, value: Vec<u8>) -> Self {
        Klv { key, value, offset: 0 }
    }

    /// Total size including key and length encoding
    pub fn total_size(&self) -> u64 {
        KEY_LEN + ber_length_size(self.value.len() as u64) as u64 + self.value.len() as u64
    }

    /// Write KLV using the minimum length encoding
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<u64> {
        write_kl(writer, &self.key, self.value.len() as u64)?;
        writer.write_all(&self.value)?;
        Ok(self.total_size())
    }
}

/// KLV reader over an in-memory buffer
pub struct KlvReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> KlvReader<'a> {
    /// Create new KLV reader
    pub fn new(data: &'a [u8]) -> Self {
        KlvReader { data, position: 0 }
    }

    /// Get current position
    pub fn position(&self) -> usize {
        self.position
    }

    /// Check if there's room for another key
    pub fn has_more(&self) -> bool {
        self.position + KEY_LEN as usize <= self.data.len()
    }

    /// Read next KLV, borrowing the value from the buffer
    pub fn read_klv(&mut self) -> Result<Option<(KlHeader, &'a [u8])>> {
        if self.position >= self.data.len() {
            return Ok(None);
        }
        if !self.has_more() {
            return Err(MxfError::TruncatedStream(format!(
                "{} bytes left for a 16 byte key",
                self.data.len() - self.position
            )));
        }

        let mut key = [0u8; 16];
        key.copy_from_slice(&self.data[self.position..self.position + 16]);
        let (len, llen) = decode_ber_length(&self.data[self.position + 16..]).map_err(|e| {
            e.with_context(format!("KLV at offset {}", self.position))
        })?;

        let value_start = self.position + 16 + llen as usize;
        let available = (self.data.len() - value_start) as u64;
        if len > available {
            return Err(MxfError::TruncatedStream(format!(
                "KLV at offset {} needs {} value bytes, {} available",
                self.position, len, available
            )));
        }
        let value_end = value_start + len as usize;
        self.position = value_end;

        Ok(Some((
            KlHeader {
                key: UniversalLabel(key),
                llen,
                len,
            },
            &self.data[value_start..value_end],
        )))
    }
}

/// Minimum number of bytes needed to BER encode `length`
pub fn ber_length_size(length: u64) -> u8 {
    if length < 0x80 {
        return 1;
    }
    let significant = 8 - (length.leading_zeros() / 8) as u8;
    1 + significant
}

/// Encode length as BER using the minimum number of bytes
pub fn encode_ber_length(length: u64) -> Vec<u8> {
    let llen = ber_length_size(length);
    // minimum size always fits
    encode_fixed_ber_length(length, llen).unwrap_or_default()
}

/// Encode length as BER using exactly `llen` bytes
pub fn encode_fixed_ber_length(length: u64, llen: u8) -> Result<Vec<u8>> {
    if llen == 0 || llen > MAX_LLEN {
        return Err(MxfError::InvalidLengthEncoding {
            offset: 0,
            message: format!("unsupported llen {}", llen),
        });
    }
    if llen == 1 {
        if length >= 0x80 {
            return Err(MxfError::InvalidLengthEncoding {
                offset: 0,
                message: format!("length {} does not fit in 1 byte", length),
            });
        }
        return Ok(vec![length as u8]);
    }

    let num_bytes = (llen - 1) as u32;
    if num_bytes < 8 && length >> (8 * num_bytes) != 0 {
        return Err(MxfError::InvalidLengthEncoding {
            offset: 0,
            message: format!("length {} does not fit in {} bytes", length, num_bytes),
        });
    }

    let mut out = Vec::with_capacity(llen as usize);
    out.push(0x80 | num_bytes as u8);
    for i in (0..num_bytes).rev() {
        out.push((length >> (8 * i)) as u8);
    }
    Ok(out)
}

/// Decode BER length from bytes, returning (length, bytes used)
pub fn decode_ber_length(data: &[u8]) -> Result<(u64, u8)> {
    let first_byte = *data
        .first()
        .ok_or_else(|| MxfError::TruncatedStream("no data for BER length".into()))?;

    if first_byte < 0x80 {
        return Ok((first_byte as u64, 1));
    }

    let num_bytes = (first_byte & 0x7F) as usize;
    check_length_of_length(num_bytes)?;
    if data.len() < 1 + num_bytes {
        return Err(MxfError::TruncatedStream(format!(
            "BER length needs {} bytes, {} available",
            num_bytes,
            data.len() - 1
        )));
    }

    let length = data[1..=num_bytes]
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | *b as u64);
    Ok((length, 1 + num_bytes as u8))
}

fn check_length_of_length(num_bytes: usize) -> Result<()> {
    if num_bytes == 0 {
        return Err(MxfError::InvalidLengthEncoding {
            offset: 0,
            message: "indefinite length is not supported".into(),
        });
    }
    if num_bytes > 8 {
        return Err(MxfError::InvalidLengthEncoding {
            offset: 0,
            message: format!("length-of-length {} exceeds 8 bytes", num_bytes),
        });
    }
    Ok(())
}

/// Read a 16-byte key
pub fn read_key<R: Read>(reader: &mut R) -> Result<UniversalLabel> {
    let mut key = [0u8; 16];
    reader.read_exact(&mut key)?;
    Ok(UniversalLabel(key))
}

/// Read a BER length, returning (length, bytes used)
pub fn read_ber_length<R: Read>(reader: &mut R) -> Result<(u64, u8)> {
    let first_byte = reader.read_u8()?;
    if first_byte < 0x80 {
        return Ok((first_byte as u64, 1));
    }

    let num_bytes = (first_byte & 0x7F) as usize;
    check_length_of_length(num_bytes)?;

    let mut length = 0u64;
    for _ in 0..num_bytes {
        length = (length << 8) | reader.read_u8()? as u64;
    }
    Ok((length, 1 + num_bytes as u8))
}

/// Read a key and length
pub fn read_kl<R: Read + Seek>(reader: &mut R) -> Result<KlHeader> {
    let offset = reader.tell()?;
    let key = read_key(reader)?;
    let (len, llen) = read_ber_length(reader).map_err(|e| match e {
        MxfError::InvalidLengthEncoding { message, .. } => MxfError::InvalidLengthEncoding {
            offset: offset + KEY_LEN,
            message,
        },
        other => other,
    })?;
    Ok(KlHeader { key, llen, len })
}

/// Read the next key and length that is not a filler, skipping fillers
pub fn read_next_nonfiller_kl<R: Read + Seek>(reader: &mut R) -> Result<KlHeader> {
    let mut kl = read_kl(reader)?;
    while kl.key.is_filler() {
        reader.skip(kl.len)?;
        kl = read_kl(reader)?;
    }
    Ok(kl)
}

/// Write a key and minimum-size BER length, returning the llen used
pub fn write_kl<W: Write>(writer: &mut W, key: &UniversalLabel, len: u64) -> Result<u8> {
    let len_bytes = encode_ber_length(len);
    writer.write_all(key.as_bytes())?;
    writer.write_all(&len_bytes)?;
    Ok(len_bytes.len() as u8)
}

/// Write a key and a BER length of at least `min_llen` bytes
pub fn write_kl_min<W: Write>(writer: &mut W, key: &UniversalLabel, min_llen: u8, len: u64) -> Result<u8> {
    let llen = llen_for(min_llen, len);
    write_fixed_kl(writer, key, llen, len)?;
    Ok(llen)
}

/// Write a key and a BER length using exactly `llen` bytes
pub fn write_fixed_kl<W: Write>(writer: &mut W, key: &UniversalLabel, llen: u8, len: u64) -> Result<()> {
    let len_bytes = encode_fixed_ber_length(len, llen)?;
    writer.write_all(key.as_bytes())?;
    writer.write_all(&len_bytes)?;
    Ok(())
}

/// The llen used for `len` when at least `min_llen` bytes are required
pub fn llen_for(min_llen: u8, len: u64) -> u8 {
    ber_length_size(len).max(min_llen.clamp(1, MAX_LLEN))
}

/// Write `count` zero bytes
pub fn write_zeros<W: Write>(writer: &mut W, count: u64) -> Result<()> {
    const ZEROS: [u8; 4096] = [0u8; 4096];
    let mut remaining = count;
    while remaining > 0 {
        let chunk = remaining.min(ZEROS.len() as u64) as usize;
        writer.write_all(&ZEROS[..chunk])?;
        remaining -= chunk as u64;
    }
    Ok(())
}

/// Write a filler KLV occupying exactly `size` bytes
pub fn write_fill<W: Write>(writer: &mut W, size: u64, min_llen: u8) -> Result<()> {
    let min_size = KEY_LEN + min_llen.max(1) as u64;
    if size < min_size {
        return Err(MxfError::Other(format!(
            "filler of {} bytes is smaller than its {} byte header",
            size, min_size
        )));
    }

    let mut fill_len = size - KEY_LEN;
    let llen = llen_for(min_llen, fill_len);
    fill_len -= llen as u64;

    write_fixed_kl(writer, &labels::FILL_ITEM, llen, fill_len)?;
    write_zeros(writer, fill_len)
}

/// Write a local set item (2-byte tag, 2-byte length)
pub fn write_local_item<W: Write>(writer: &mut W, tag: u16, value: &[u8]) -> Result<usize> {
    let len = u16::try_from(value.len()).map_err(|_| {
        MxfError::Other(format!("local set item 0x{:04x} too large: {} bytes", tag, value.len()))
    })?;
    writer.write_u16::<BigEndian>(tag)?;
    writer.write_u16::<BigEndian>(len)?;
    writer.write_all(value)?;
    Ok(4 + value.len())
}

/// Iterator over the items of a local set value
pub struct LocalSetReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> LocalSetReader<'a> {
    /// Create a reader over a local set value
    pub fn new(data: &'a [u8]) -> Self {
        LocalSetReader { data, offset: 0 }
    }

    /// Read the next (tag, value) item
    pub fn next_item(&mut self) -> Result<Option<(u16, &'a [u8])>> {
        if self.offset >= self.data.len() {
            return Ok(None);
        }
        let rest = &self.data[self.offset..];
        if rest.len() < 4 {
            return Err(MxfError::TruncatedStream(format!(
                "local set item header needs 4 bytes, {} available",
                rest.len()
            )));
        }

        let mut header = &rest[..4];
        let tag = header.read_u16::<BigEndian>()?;
        let len = header.read_u16::<BigEndian>()? as usize;
        if rest.len() < 4 + len {
            return Err(MxfError::TruncatedStream(format!(
                "local set item 0x{:04x} needs {} bytes, {} available",
                tag,
                len,
                rest.len() - 4
            )));
        }

        self.offset += 4 + len;
        Ok(Some((tag, &rest[4..4 + len])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    const KEY: UniversalLabel = UniversalLabel::new([
        0x06, 0x0E, 0x2B, 0x34, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12,
    ]);

    #[test]
    fn test_ber_length_short() {
        let encoded = encode_ber_length(100);
        assert_eq!(encoded, vec![100]);

        let (decoded, size) = decode_ber_length(&encoded).unwrap();
        assert_eq!(decoded, 100);
        assert_eq!(size, 1);
    }

    #[test]
    fn test_ber_length_long() {
        let encoded = encode_ber_length(1000);
        assert_eq!(encoded, vec![0x82, 0x03, 0xE8]);

        let (decoded, size) = decode_ber_length(&encoded).unwrap();
        assert_eq!(decoded, 1000);
        assert_eq!(size, 3);
    }

    #[test]
    fn test_ber_length_sizes() {
        assert_eq!(ber_length_size(0), 1);
        assert_eq!(ber_length_size(127), 1);
        assert_eq!(ber_length_size(128), 2);
        assert_eq!(ber_length_size(255), 2);
        assert_eq!(ber_length_size(256), 3);
        assert_eq!(ber_length_size(u32::MAX as u64), 5);
        assert_eq!(ber_length_size(u64::MAX), 9);
    }

    #[test]
    fn test_ber_round_trip_minimal() {
        for length in [0u64, 1, 127, 128, 255, 256, 65535, 65536, u32::MAX as u64] {
            let encoded = encode_ber_length(length);
            assert_eq!(encoded.len(), ber_length_size(length) as usize);
            assert_eq!(decode_ber_length(&encoded).unwrap(), (length, encoded.len() as u8));
        }
    }

    #[test]
    fn test_fixed_llen() {
        assert_eq!(encode_fixed_ber_length(5, 4).unwrap(), vec![0x83, 0, 0, 5]);
        assert_eq!(encode_fixed_ber_length(0x1234, 9).unwrap().len(), 9);
        assert!(matches!(
            encode_fixed_ber_length(0x1_0000, 3),
            Err(MxfError::InvalidLengthEncoding { .. })
        ));
        assert!(encode_fixed_ber_length(200, 1).is_err());
    }

    #[test]
    fn test_length_of_length_too_large() {
        let mut data = KEY.as_bytes().to_vec();
        data.push(0x89);
        data.extend_from_slice(&[0u8; 9]);
        let err = read_kl(&mut Cursor::new(data)).unwrap_err();
        assert!(matches!(err, MxfError::InvalidLengthEncoding { offset: 16, .. }));
    }

    #[test]
    fn test_indefinite_length_rejected() {
        assert!(matches!(
            decode_ber_length(&[0x80]),
            Err(MxfError::InvalidLengthEncoding { .. })
        ));
    }

    #[test]
    fn test_truncated_kl() {
        let err = read_kl(&mut Cursor::new(KEY.as_bytes()[..10].to_vec())).unwrap_err();
        assert!(matches!(err, MxfError::TruncatedStream(_)));

        let mut data = KEY.as_bytes().to_vec();
        data.extend_from_slice(&[0x83, 0x01]);
        let err = read_kl(&mut Cursor::new(data)).unwrap_err();
        assert!(matches!(err, MxfError::TruncatedStream(_)));
    }

    #[test]
    fn test_klv_write() {
        let klv = Klv::new(KEY, vec![1, 2, 3, 4]);

        let mut buffer = Vec::new();
        let size = klv.write(&mut buffer).unwrap();

        assert_eq!(size, 16 + 1 + 4);
        assert_eq!(buffer[16], 4);
        assert_eq!(&buffer[17..21], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_klv_reader() {
        let mut data = Vec::new();
        Klv::new(KEY, vec![0xAA, 0xBB, 0xCC]).write(&mut data).unwrap();
        Klv::new(labels::FILL_ITEM, vec![0u8; 200]).write(&mut data).unwrap();

        let mut reader = KlvReader::new(&data);
        let (kl, value) = reader.read_klv().unwrap().unwrap();
        assert_eq!(kl.key, KEY);
        assert_eq!(value, &[0xAA, 0xBB, 0xCC]);

        let (kl, value) = reader.read_klv().unwrap().unwrap();
        assert!(kl.key.is_filler());
        assert_eq!(kl.llen, 2);
        assert_eq!(value.len(), 200);
        assert!(reader.read_klv().unwrap().is_none());
    }

    #[test]
    fn test_write_fill_exact_size() {
        for size in [20u64, 21, 100, 300, 70000] {
            let mut buffer = Vec::new();
            write_fill(&mut buffer, size, 4).unwrap();
            assert_eq!(buffer.len() as u64, size);

            let kl = read_kl(&mut Cursor::new(&buffer)).unwrap();
            assert!(kl.key.is_filler());
            assert_eq!(kl.total_len(), size);
        }

        assert!(write_fill(&mut Vec::new(), 19, 4).is_err());
    }

    #[test]
    fn test_read_next_nonfiller() {
        let mut data = Vec::new();
        write_fill(&mut data, 40, 4).unwrap();
        write_fill(&mut data, 17, 1).unwrap();
        write_kl(&mut data, &KEY, 2).unwrap();
        data.extend_from_slice(&[9, 9]);

        let mut cursor = Cursor::new(data);
        let kl = read_next_nonfiller_kl(&mut cursor).unwrap();
        assert_eq!(kl.key, KEY);
        assert_eq!(kl.len, 2);
        assert_eq!(cursor.tell().unwrap(), 40 + 17 + 17);
    }

    #[test]
    fn test_local_set() {
        let mut buffer = Vec::new();
        write_local_item(&mut buffer, 0x1234, &[1, 2, 3]).unwrap();
        write_local_item(&mut buffer, 0x3f05, &[]).unwrap();

        let mut reader = LocalSetReader::new(&buffer);
        assert_eq!(reader.next_item().unwrap(), Some((0x1234, &[1u8, 2, 3][..])));
        assert_eq!(reader.next_item().unwrap(), Some((0x3f05, &[][..])));
        assert_eq!(reader.next_item().unwrap(), None);
    }

    proptest! {
        #[test]
        fn prop_kl_round_trip(length in any::<u64>(), min_llen in 1u8..=9) {
            let mut buffer = Vec::new();
            let llen = write_kl_min(&mut buffer, &KEY, min_llen, length).unwrap();
            prop_assert!(llen >= min_llen);
            prop_assert_eq!(buffer.len() as u64, KEY_LEN + llen as u64);

            let kl = read_kl(&mut Cursor::new(&buffer)).unwrap();
            prop_assert_eq!(kl.key, KEY);
            prop_assert_eq!(kl.len, length);
            prop_assert_eq!(kl.llen, llen);
        }
    }
}
