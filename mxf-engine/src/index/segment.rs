//! Index table segment codec

use crate::error::{MxfError, Result};
use crate::klv::{self, LocalSetReader};
use crate::log::{log_warn, Logger};
use crate::types::{EditRate, InstanceUid, Rational};
use crate::ul::labels;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Write;

/// Largest entry array written into one segment, keeping the local set
/// length within its 2-byte limit.
pub const MAX_INDEX_SEGMENT_SIZE: usize = 65000;

mod tag {
    pub const INSTANCE_UID: u16 = 0x3c0a;
    pub const EDIT_RATE: u16 = 0x3f0b;
    pub const START_POSITION: u16 = 0x3f0c;
    pub const DURATION: u16 = 0x3f0d;
    pub const EDIT_UNIT_BYTE_COUNT: u16 = 0x3f05;
    pub const INDEX_SID: u16 = 0x3f06;
    pub const BODY_SID: u16 = 0x3f07;
    pub const SLICE_COUNT: u16 = 0x3f08;
    pub const POS_TABLE_COUNT: u16 = 0x3f0e;
    pub const DELTA_ENTRY_ARRAY: u16 = 0x3f09;
    pub const INDEX_ENTRY_ARRAY: u16 = 0x3f0a;
}

const DELTA_ENTRY_SIZE: u32 = 6;

/// Location of an element within an edit unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeltaEntry {
    /// -1 when the element is temporally reordered
    pub pos_table_index: i8,
    pub slice: u8,
    /// Byte offset of the element from the start of its slice
    pub element_delta: u32,
}

/// One edit unit of a VBE segment
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IndexEntry {
    pub temporal_offset: i8,
    pub key_frame_offset: i8,
    pub flags: u8,
    /// Offset of the edit unit within the body stream
    pub stream_offset: u64,
    pub slice_offsets: Vec<u32>,
}

/// An index table segment
#[derive(Debug, Clone, PartialEq)]
pub struct IndexTableSegment {
    pub instance_uid: InstanceUid,
    pub edit_rate: EditRate,
    pub start_position: i64,
    pub duration: i64,
    /// Non-zero for constant bytes per element (CBE) segments
    pub edit_unit_byte_count: u32,
    pub index_sid: u32,
    pub body_sid: u32,
    pub slice_count: u8,
    pub pos_table_count: u8,
    pub delta_entries: Vec<DeltaEntry>,
    pub entries: Vec<IndexEntry>,
}

impl IndexTableSegment {
    /// Empty segment with a fresh instance UID
    pub fn new(index_sid: u32, body_sid: u32, edit_rate: EditRate, start_position: i64, slice_count: u8) -> Self {
        IndexTableSegment {
            instance_uid: InstanceUid::generate(),
            edit_rate,
            start_position,
            duration: 0,
            edit_unit_byte_count: 0,
            index_sid,
            body_sid,
            slice_count,
            pos_table_count: 0,
            delta_entries: Vec::new(),
            entries: Vec::new(),
        }
    }

    pub fn is_cbe(&self) -> bool {
        self.edit_unit_byte_count != 0
    }

    /// Size of one entry in the index entry array
    pub fn entry_size(&self) -> u32 {
        11 + 4 * self.slice_count as u32 + 8 * self.pos_table_count as u32
    }

    /// Bytes used by the index entry array items
    pub fn entries_size(&self) -> usize {
        self.entries.len() * self.entry_size() as usize
    }

    /// Exclusive end position
    pub fn end_position(&self) -> i64 {
        self.start_position + self.duration
    }

    /// Check whether `position` falls inside the segment
    pub fn contains(&self, position: i64) -> bool {
        position >= self.start_position && (self.duration == 0 || position < self.end_position())
    }

    /// Encode the local set value
    pub fn encode_value(&self) -> Result<Vec<u8>> {
        let mut value = Vec::with_capacity(128 + self.entries_size());

        klv::write_local_item(&mut value, tag::INSTANCE_UID, self.instance_uid.as_bytes())?;
        let mut rate = Vec::with_capacity(8);
        self.edit_rate.write(&mut rate)?;
        klv::write_local_item(&mut value, tag::EDIT_RATE, &rate)?;
        klv::write_local_item(&mut value, tag::START_POSITION, &self.start_position.to_be_bytes())?;
        klv::write_local_item(&mut value, tag::DURATION, &self.duration.to_be_bytes())?;
        klv::write_local_item(
            &mut value,
            tag::EDIT_UNIT_BYTE_COUNT,
            &self.edit_unit_byte_count.to_be_bytes(),
        )?;
        klv::write_local_item(&mut value, tag::INDEX_SID, &self.index_sid.to_be_bytes())?;
        klv::write_local_item(&mut value, tag::BODY_SID, &self.body_sid.to_be_bytes())?;
        klv::write_local_item(&mut value, tag::SLICE_COUNT, &[self.slice_count])?;
        if self.pos_table_count > 0 {
            klv::write_local_item(&mut value, tag::POS_TABLE_COUNT, &[self.pos_table_count])?;
        }

        if !self.delta_entries.is_empty() {
            let mut array = Vec::with_capacity(8 + 6 * self.delta_entries.len());
            array.write_u32::<BigEndian>(self.delta_entries.len() as u32)?;
            array.write_u32::<BigEndian>(DELTA_ENTRY_SIZE)?;
            for delta in &self.delta_entries {
                array.write_i8(delta.pos_table_index)?;
                array.write_u8(delta.slice)?;
                array.write_u32::<BigEndian>(delta.element_delta)?;
            }
            klv::write_local_item(&mut value, tag::DELTA_ENTRY_ARRAY, &array)?;
        }

        if !self.entries.is_empty() {
            let entry_size = self.entry_size();
            let mut array = Vec::with_capacity(8 + self.entries_size());
            array.write_u32::<BigEndian>(self.entries.len() as u32)?;
            array.write_u32::<BigEndian>(entry_size)?;
            for entry in &self.entries {
                if entry.slice_offsets.len() != self.slice_count as usize {
                    return Err(MxfError::InvalidIndexSegment(format!(
                        "index entry has {} slice offsets, segment has {} slices",
                        entry.slice_offsets.len(),
                        self.slice_count
                    )));
                }
                array.write_i8(entry.temporal_offset)?;
                array.write_i8(entry.key_frame_offset)?;
                array.write_u8(entry.flags)?;
                array.write_u64::<BigEndian>(entry.stream_offset)?;
                for offset in &entry.slice_offsets {
                    array.write_u32::<BigEndian>(*offset)?;
                }
                for _ in 0..self.pos_table_count {
                    array.write_i32::<BigEndian>(0)?;
                    array.write_i32::<BigEndian>(1)?;
                }
            }
            klv::write_local_item(&mut value, tag::INDEX_ENTRY_ARRAY, &array)?;
        }

        Ok(value)
    }

    /// Write the segment KLV, returning the number of bytes written
    pub fn write<W: Write>(&self, writer: &mut W, min_llen: u8) -> Result<u64> {
        let value = self.encode_value()?;
        let llen = klv::write_kl_min(writer, &labels::INDEX_TABLE_SEGMENT, min_llen, value.len() as u64)?;
        writer.write_all(&value)?;
        Ok(klv::KEY_LEN + llen as u64 + value.len() as u64)
    }

    /// Parse a segment from its local set value
    pub fn parse(value: &[u8], logger: &Logger) -> Result<Self> {
        let mut segment = IndexTableSegment {
            instance_uid: InstanceUid::default(),
            edit_rate: Rational::new(0, 1),
            start_position: 0,
            duration: 0,
            edit_unit_byte_count: 0,
            index_sid: 0,
            body_sid: 0,
            slice_count: 0,
            pos_table_count: 0,
            delta_entries: Vec::new(),
            entries: Vec::new(),
        };
        let mut entry_array: Option<&[u8]> = None;

        let mut items = LocalSetReader::new(value);
        while let Some((item_tag, mut data)) = items.next_item()? {
            match item_tag {
                tag::INSTANCE_UID => {
                    let bytes: [u8; 16] = data
                        .try_into()
                        .map_err(|_| invalid_item(item_tag, data.len()))?;
                    segment.instance_uid = InstanceUid(bytes);
                }
                tag::EDIT_RATE => {
                    check_len(item_tag, data, 8)?;
                    segment.edit_rate = Rational::read(&mut data)?;
                }
                tag::START_POSITION => {
                    check_len(item_tag, data, 8)?;
                    segment.start_position = data.read_i64::<BigEndian>()?;
                }
                tag::DURATION => {
                    check_len(item_tag, data, 8)?;
                    segment.duration = data.read_i64::<BigEndian>()?;
                }
                tag::EDIT_UNIT_BYTE_COUNT => {
                    check_len(item_tag, data, 4)?;
                    segment.edit_unit_byte_count = data.read_u32::<BigEndian>()?;
                }
                tag::INDEX_SID => {
                    check_len(item_tag, data, 4)?;
                    segment.index_sid = data.read_u32::<BigEndian>()?;
                }
                tag::BODY_SID => {
                    check_len(item_tag, data, 4)?;
                    segment.body_sid = data.read_u32::<BigEndian>()?;
                }
                tag::SLICE_COUNT => {
                    check_len(item_tag, data, 1)?;
                    segment.slice_count = data[0];
                }
                tag::POS_TABLE_COUNT => {
                    check_len(item_tag, data, 1)?;
                    segment.pos_table_count = data[0];
                }
                tag::DELTA_ENTRY_ARRAY => {
                    segment.delta_entries = parse_delta_entries(data)?;
                }
                tag::INDEX_ENTRY_ARRAY => entry_array = Some(data),
                other => {
                    log_warn!(logger, "skipping unknown index table segment item 0x{:04x}", other);
                }
            }
        }

        if segment.duration < 0 {
            log_warn!(
                logger,
                "index duration {} is invalid, assuming 0",
                segment.duration
            );
            segment.duration = 0;
        }

        if let Some(array) = entry_array {
            segment.entries = parse_index_entries(array, segment.slice_count)?;
        }

        if segment.entries.is_empty() {
            if segment.edit_unit_byte_count == 0 && segment.duration > 0 {
                return Err(MxfError::InvalidIndexSegment(format!(
                    "segment at {} has neither entries nor an edit unit byte count",
                    segment.start_position
                )));
            }
        } else if (segment.entries.len() as i64) < segment.duration {
            return Err(MxfError::InvalidIndexSegment(format!(
                "segment at {} has {} entries for duration {}",
                segment.start_position,
                segment.entries.len(),
                segment.duration
            )));
        }

        Ok(segment)
    }
}

fn invalid_item(item_tag: u16, len: usize) -> MxfError {
    MxfError::InvalidIndexSegment(format!("item 0x{:04x} has invalid length {}", item_tag, len))
}

fn check_len(item_tag: u16, data: &[u8], len: usize) -> Result<()> {
    if data.len() != len {
        return Err(invalid_item(item_tag, data.len()));
    }
    Ok(())
}

fn read_array_header(data: &mut &[u8], what: &str) -> Result<(u32, u32)> {
    if data.len() < 8 {
        return Err(MxfError::InvalidIndexSegment(format!("{} array header truncated", what)));
    }
    let count = data.read_u32::<BigEndian>()?;
    let item_size = data.read_u32::<BigEndian>()?;
    if data.len() as u64 != count as u64 * item_size as u64 {
        return Err(MxfError::InvalidIndexSegment(format!(
            "{} array holds {} bytes, header declares {} x {}",
            what,
            data.len(),
            count,
            item_size
        )));
    }
    Ok((count, item_size))
}

fn parse_delta_entries(mut data: &[u8]) -> Result<Vec<DeltaEntry>> {
    let (count, item_size) = read_array_header(&mut data, "delta entry")?;
    if count > 0 && item_size < DELTA_ENTRY_SIZE {
        return Err(MxfError::InvalidIndexSegment(format!(
            "delta entry size {} is too small",
            item_size
        )));
    }

    data.chunks_exact(item_size.max(1) as usize)
        .take(count as usize)
        .map(|mut item| {
            Ok(DeltaEntry {
                pos_table_index: item.read_i8()?,
                slice: item.read_u8()?,
                element_delta: item.read_u32::<BigEndian>()?,
            })
        })
        .collect()
}

fn parse_index_entries(mut data: &[u8], slice_count: u8) -> Result<Vec<IndexEntry>> {
    let (count, item_size) = read_array_header(&mut data, "index entry")?;
    let min_size = 11 + 4 * slice_count as u32;
    if count > 0 && item_size < min_size {
        return Err(MxfError::InvalidIndexSegment(format!(
            "index entry size {} is smaller than {} for {} slices",
            item_size, min_size, slice_count
        )));
    }

    data.chunks_exact(item_size.max(1) as usize)
        .take(count as usize)
        .map(|mut item| {
            let temporal_offset = item.read_i8()?;
            let key_frame_offset = item.read_i8()?;
            let flags = item.read_u8()?;
            let stream_offset = item.read_u64::<BigEndian>()?;
            if stream_offset > i64::MAX as u64 {
                return Err(MxfError::InvalidIndexSegment(format!(
                    "stream offset {} out of range",
                    stream_offset
                )));
            }
            let slice_offsets = (0..slice_count)
                .map(|_| item.read_u32::<BigEndian>())
                .collect::<std::io::Result<Vec<_>>>()?;
            Ok(IndexEntry {
                temporal_offset,
                key_frame_offset,
                flags,
                stream_offset,
                slice_offsets,
            })
        })
        .collect()
}
