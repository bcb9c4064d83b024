//! MXF partition handling
//!
//! MXF files are divided into partitions:
//! - Header partition (required)
//! - Body partitions (optional, carrying essence or index segments)
//! - Footer partition (required for closed/complete files)
//!
//! A Random Index Pack (RIP) at the very end of the file lists the offset of
//! every partition. When it is missing or damaged the partitions can still
//! be recovered from the footer's `previous_partition` chain or by scanning
//! forward from the header.

use crate::error::{MxfError, Result};
use crate::klv::{self, KlHeader, KEY_LEN};
use crate::log::{log_debug, log_warn, Logger};
use crate::stream::StreamExt;
use crate::ul::{labels, UniversalLabel};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom, Write};

/// Fixed part of the partition pack value
pub const PARTITION_PACK_FIXED_LEN: u64 = 88;

/// Maximum run-in size allowed before the header partition pack
pub const MAX_RUN_IN_LEN: u64 = 65535;

/// Default byte limit of the backward footer search
pub const DEFAULT_FOOTER_SEARCH_LIMIT: u64 = 250 * 32768;

const FOOTER_SEARCH_BUFFER: usize = 32768;

/// Partition kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PartitionKind {
    /// Header partition
    Header,
    /// Body partition
    Body,
    /// Generic stream body partition (recognised on read only)
    GenericStream,
    /// Footer partition
    Footer,
}

/// Partition status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PartitionStatus {
    /// Open (values may still change)
    Open,
    /// Closed (finalized)
    Closed,
}

/// MXF partition pack
#[derive(Debug, Clone)]
pub struct Partition {
    pub kind: PartitionKind,
    pub status: PartitionStatus,
    /// Header metadata is complete
    pub complete: bool,
    pub major_version: u16,
    pub minor_version: u16,
    /// KAG size (key alignment grid)
    pub kag_size: u32,
    /// Offset of this partition pack, relative to the end of the run-in
    pub this_partition: u64,
    pub previous_partition: u64,
    pub footer_partition: u64,
    /// Bytes of header metadata following the pack, including filler
    pub header_byte_count: u64,
    /// Bytes of index segments following the header metadata
    pub index_byte_count: u64,
    pub index_sid: u32,
    /// Offset of the first essence byte of this partition within its body stream
    pub body_offset: u64,
    pub body_sid: u32,
    pub operational_pattern: UniversalLabel,
    pub essence_containers: Vec<UniversalLabel>,
    header_mark: Option<u64>,
    index_mark: Option<u64>,
}

impl Default for Partition {
    fn default() -> Self {
        Partition {
            kind: PartitionKind::Header,
            status: PartitionStatus::Open,
            complete: false,
            major_version: 1,
            minor_version: 3,
            kag_size: 1,
            this_partition: 0,
            previous_partition: 0,
            footer_partition: 0,
            header_byte_count: 0,
            index_byte_count: 0,
            index_sid: 0,
            body_offset: 0,
            body_sid: 0,
            operational_pattern: labels::OP1A_MULTI_TRACK,
            essence_containers: Vec::new(),
            header_mark: None,
            index_mark: None,
        }
    }
}

impl Partition {
    /// Create an open, incomplete partition of the given kind
    pub fn new(kind: PartitionKind) -> Self {
        let mut partition = Partition {
            kind,
            ..Default::default()
        };
        if kind == PartitionKind::Footer {
            partition.status = PartitionStatus::Closed;
        }
        partition
    }

    /// New partition inheriting the layout properties of `source`
    pub fn from_partition(kind: PartitionKind, source: &Partition) -> Self {
        let mut partition = Partition::new(kind);
        partition.major_version = source.major_version;
        partition.minor_version = source.minor_version;
        partition.kag_size = source.kag_size;
        partition.operational_pattern = source.operational_pattern;
        partition.essence_containers = source.essence_containers.clone();
        partition
    }

    /// Partition pack key derived from kind, status and completeness
    pub fn key(&self) -> UniversalLabel {
        let mut key = labels::PARTITION_PACK_PREFIX;
        key[13] = match self.kind {
            PartitionKind::Header => 0x02,
            PartitionKind::Body | PartitionKind::GenericStream => 0x03,
            PartitionKind::Footer => 0x04,
        };
        key[14] = if self.kind == PartitionKind::GenericStream {
            0x11
        } else {
            match (self.status, self.complete) {
                (PartitionStatus::Open, false) => 0x01,
                (PartitionStatus::Closed, false) => 0x02,
                (PartitionStatus::Open, true) => 0x03,
                (PartitionStatus::Closed, true) => 0x04,
            }
        };
        UniversalLabel(key)
    }

    pub fn is_closed(&self) -> bool {
        self.status == PartitionStatus::Closed
    }

    /// Mark the partition closed; values written afterwards are final
    pub fn close(&mut self) {
        self.status = PartitionStatus::Closed;
    }

    /// Mark the partition closed and complete
    pub fn close_complete(&mut self) {
        self.status = PartitionStatus::Closed;
        self.complete = true;
    }

    /// Add an essence container label, ignoring duplicates
    pub fn add_essence_container(&mut self, label: UniversalLabel) {
        if !self.essence_containers.contains(&label) {
            self.essence_containers.push(label);
        }
    }

    /// Length of the partition pack value
    pub fn value_len(&self) -> u64 {
        PARTITION_PACK_FIXED_LEN + 16 * self.essence_containers.len() as u64
    }

    /// Size of the whole partition pack KLV when written with `min_llen`
    pub fn pack_size(&self, min_llen: u8) -> u64 {
        KEY_LEN + klv::llen_for(min_llen, self.value_len()) as u64 + self.value_len()
    }

    /// Check whether the partition carries essence for a body stream
    pub fn has_essence(&self) -> bool {
        self.body_sid != 0
    }

    /// Parse the partition pack value once `kl` has identified a partition pack
    pub fn read<R: Read + Seek>(reader: &mut R, kl: &KlHeader, logger: &Logger) -> Result<Self> {
        if !kl.key.is_partition_pack() {
            return Err(MxfError::InvalidPartition(format!("{:?} is not a partition pack", kl.key)));
        }
        if kl.len < PARTITION_PACK_FIXED_LEN || kl.len > i64::MAX as u64 {
            return Err(MxfError::InvalidPartition(format!(
                "partition pack length {} is invalid",
                kl.len
            )));
        }

        let key = kl.key.as_bytes();
        let kind = match key[13] {
            0x02 => PartitionKind::Header,
            0x03 if key[14] == 0x11 => PartitionKind::GenericStream,
            0x03 => PartitionKind::Body,
            _ => PartitionKind::Footer,
        };
        let (status, complete) = match key[14] {
            0x01 => (PartitionStatus::Open, false),
            0x03 => (PartitionStatus::Open, true),
            0x04 => (PartitionStatus::Closed, true),
            _ => (PartitionStatus::Closed, false),
        };

        let major_version = reader.read_u16::<BigEndian>()?;
        let minor_version = reader.read_u16::<BigEndian>()?;
        let kag_size = reader.read_u32::<BigEndian>()?;
        let this_partition = reader.read_u64::<BigEndian>()?;
        let previous_partition = reader.read_u64::<BigEndian>()?;
        let footer_partition = reader.read_u64::<BigEndian>()?;
        let header_byte_count = reader.read_u64::<BigEndian>()?;
        let index_byte_count = reader.read_u64::<BigEndian>()?;
        let index_sid = reader.read_u32::<BigEndian>()?;
        let body_offset = reader.read_u64::<BigEndian>()?;
        let body_sid = reader.read_u32::<BigEndian>()?;
        let operational_pattern = klv::read_key(reader)?;

        let count = reader.read_u32::<BigEndian>()?;
        let item_len = reader.read_u32::<BigEndian>()?;
        if count != 0 && item_len != 16 {
            return Err(MxfError::InvalidPartition(format!(
                "essence container batch item size {} is not 16",
                item_len
            )));
        }
        let expected_len = PARTITION_PACK_FIXED_LEN + count as u64 * 16;
        if kl.len < expected_len {
            return Err(MxfError::InvalidPartition(format!(
                "partition pack length {} too small for {} essence containers",
                kl.len, count
            )));
        }

        // count is only trusted as far as keys can actually be read
        let mut essence_containers = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            essence_containers.push(klv::read_key(reader)?);
        }

        if kl.len > expected_len {
            log_warn!(
                logger,
                "Partition pack len {} is larger than expected len {}",
                kl.len,
                expected_len
            );
            reader.skip(kl.len - expected_len)?;
        }

        Ok(Partition {
            kind,
            status,
            complete,
            major_version,
            minor_version,
            kag_size,
            this_partition,
            previous_partition,
            footer_partition,
            header_byte_count,
            index_byte_count,
            index_sid,
            body_offset,
            body_sid,
            operational_pattern,
            essence_containers,
            header_mark: None,
            index_mark: None,
        })
    }

    /// Write the partition pack at the current stream position.
    ///
    /// `this_partition` is taken from the stream position, and a footer
    /// records itself as the footer partition.
    pub fn write<W: Write + Seek>(&mut self, writer: &mut W, min_llen: u8) -> Result<()> {
        self.this_partition = writer.tell()?;
        if self.kind == PartitionKind::Footer {
            self.footer_partition = self.this_partition;
        }

        klv::write_kl_min(writer, &self.key(), min_llen, self.value_len())?;

        writer.write_u16::<BigEndian>(self.major_version)?;
        writer.write_u16::<BigEndian>(self.minor_version)?;
        writer.write_u32::<BigEndian>(self.kag_size)?;
        writer.write_u64::<BigEndian>(self.this_partition)?;
        writer.write_u64::<BigEndian>(self.previous_partition)?;
        writer.write_u64::<BigEndian>(self.footer_partition)?;
        writer.write_u64::<BigEndian>(self.header_byte_count)?;
        writer.write_u64::<BigEndian>(self.index_byte_count)?;
        writer.write_u32::<BigEndian>(self.index_sid)?;
        writer.write_u64::<BigEndian>(self.body_offset)?;
        writer.write_u32::<BigEndian>(self.body_sid)?;
        writer.write_all(self.operational_pattern.as_bytes())?;

        writer.write_u32::<BigEndian>(self.essence_containers.len() as u32)?;
        writer.write_u32::<BigEndian>(16)?;
        for label in &self.essence_containers {
            writer.write_all(label.as_bytes())?;
        }

        Ok(())
    }

    /// Pad with filler up to the next KAG boundary
    pub fn fill_to_kag<W: Write + Seek>(&self, writer: &mut W, min_llen: u8) -> Result<()> {
        self.allocate_space_to_kag(writer, 0, min_llen)
    }

    /// Reserve at least `size` bytes with a filler that ends on a KAG boundary.
    ///
    /// With a KAG of 1 and no reservation nothing is written.
    pub fn allocate_space_to_kag<W: Write + Seek>(
        &self,
        writer: &mut W,
        size: u64,
        min_llen: u8,
    ) -> Result<()> {
        let kag = self.kag_size.max(1) as u64;
        if size == 0 && kag == 1 {
            return Ok(());
        }

        let pos = writer.tell()?;
        let rel = (pos + size)
            .checked_sub(self.this_partition)
            .ok_or_else(|| {
                MxfError::InvalidPartition(format!(
                    "stream position {} is before partition at {}",
                    pos, self.this_partition
                ))
            })?;
        if size == 0 && rel % kag == 0 {
            return Ok(());
        }

        let llen_of = |fill: i64| {
            if fill >= 0 {
                klv::llen_for(min_llen, fill as u64)
            } else {
                0
            }
        };
        let mut fill = size as i64 - KEY_LEN as i64;
        if kag > 1 {
            fill += (kag - rel % kag) as i64;
        }
        let mut llen = llen_of(fill);
        while fill < llen as i64 {
            fill += kag as i64;
            llen = llen_of(fill);
        }
        let fill_len = (fill - llen as i64) as u64;

        klv::write_fixed_kl(writer, &labels::FILL_ITEM, llen, fill_len)?;
        klv::write_zeros(writer, fill_len)
    }

    pub fn mark_header_start<S: Seek>(&mut self, stream: &mut S) -> Result<()> {
        self.header_mark = Some(stream.tell()?);
        Ok(())
    }

    pub fn mark_header_end<S: Seek>(&mut self, stream: &mut S) -> Result<()> {
        self.header_byte_count = mark_end(stream, self.header_mark.take(), "header")?;
        Ok(())
    }

    pub fn mark_index_start<S: Seek>(&mut self, stream: &mut S) -> Result<()> {
        self.index_mark = Some(stream.tell()?);
        Ok(())
    }

    pub fn mark_index_end<S: Seek>(&mut self, stream: &mut S) -> Result<()> {
        self.index_byte_count = mark_end(stream, self.index_mark.take(), "index")?;
        Ok(())
    }
}

fn mark_end<S: Seek>(stream: &mut S, start: Option<u64>, what: &str) -> Result<u64> {
    let start =
        start.ok_or_else(|| MxfError::InvalidPartition(format!("{} end marked without a start", what)))?;
    let end = stream.tell()?;
    end.checked_sub(start)
        .ok_or_else(|| MxfError::InvalidPartition(format!("{} end {} is before start {}", what, end, start)))
}

/// Write a filler so the stream reaches exactly `position`
pub fn fill_to_position<W: Write + Seek>(writer: &mut W, position: u64, min_llen: u8) -> Result<()> {
    let pos = writer.tell()?;
    if pos == position {
        return Ok(());
    }
    if pos > position || position - pos < KEY_LEN + min_llen.max(1) as u64 {
        return Err(MxfError::HeaderMetadataOverflow {
            required: pos + KEY_LEN + min_llen.max(1) as u64,
            available: position,
        });
    }
    klv::write_fill(writer, position - pos, min_llen)
}

/// The partitions of a file in stream order
#[derive(Debug, Clone, Default)]
pub struct PartitionList {
    partitions: Vec<Partition>,
}

impl PartitionList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a partition, linking it to the previous one
    pub fn push(&mut self, mut partition: Partition) -> &mut Partition {
        if let Some(last) = self.partitions.last() {
            partition.previous_partition = last.this_partition;
        }
        self.partitions.push(partition);
        let idx = self.partitions.len() - 1;
        &mut self.partitions[idx]
    }

    /// Append a new partition of `kind` inheriting the layout of the last one
    pub fn create_partition(&mut self, kind: PartitionKind) -> &mut Partition {
        let partition = match self.partitions.last() {
            Some(last) => Partition::from_partition(kind, last),
            None => Partition::new(kind),
        };
        self.push(partition)
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Partition> {
        self.partitions.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Partition> {
        self.partitions.iter_mut()
    }

    pub fn first(&self) -> Option<&Partition> {
        self.partitions.first()
    }

    pub fn first_mut(&mut self) -> Option<&mut Partition> {
        self.partitions.first_mut()
    }

    pub fn last(&self) -> Option<&Partition> {
        self.partitions.last()
    }

    pub fn last_mut(&mut self) -> Option<&mut Partition> {
        self.partitions.last_mut()
    }

    pub fn get(&self, idx: usize) -> Option<&Partition> {
        self.partitions.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Partition> {
        self.partitions.get_mut(idx)
    }

    /// The footer partition, if the list ends with one
    pub fn footer(&self) -> Option<&Partition> {
        self.partitions.last().filter(|p| p.kind == PartitionKind::Footer)
    }

    /// Set previous and footer offsets from the list order
    pub fn update_in_memory(&mut self) {
        let footer = self.footer().map(|p| p.this_partition);
        let mut previous: Option<u64> = None;
        for partition in &mut self.partitions {
            if let Some(prev) = previous {
                partition.previous_partition = prev;
            }
            if let Some(footer) = footer {
                partition.footer_partition = footer;
            }
            previous = Some(partition.this_partition);
        }
    }

    /// Rewrite every partition pack in place and return to the end of the stream
    pub fn rewrite<W: Write + Seek>(&mut self, writer: &mut W, min_llen: u8) -> Result<()> {
        for partition in &mut self.partitions {
            writer.seek_to(partition.this_partition)?;
            partition
                .write(writer, min_llen)
                .map_err(|e| e.with_context(format!("rewriting partition at {}", partition.this_partition)))?;
        }
        writer.seek(SeekFrom::End(0))?;
        Ok(())
    }

    /// `update_in_memory` followed by `rewrite`
    pub fn update<W: Write + Seek>(&mut self, writer: &mut W, min_llen: u8) -> Result<()> {
        self.update_in_memory();
        self.rewrite(writer, min_llen)
    }

    /// Check that each partition's previous offset names the partition before it
    pub fn chain_is_valid(&self) -> bool {
        self.partitions.windows(2).all(|pair| {
            pair[1].previous_partition == pair[0].this_partition
                && pair[1].this_partition > pair[0].this_partition
        })
    }

    /// Offsets visited when following `previous_partition` from the footer
    pub fn walk_back_from_footer(&self) -> Result<Vec<u64>> {
        let footer = self
            .footer()
            .ok_or_else(|| MxfError::InvalidPartition("no footer partition".into()))?;
        let mut offsets = vec![footer.this_partition];
        let mut current = footer;
        while current.kind != PartitionKind::Header {
            let prev = self
                .partitions
                .iter()
                .find(|p| p.this_partition == current.previous_partition && p.this_partition < current.this_partition)
                .ok_or_else(|| {
                    MxfError::InvalidPartition(format!(
                        "no partition at previous offset {} of partition at {}",
                        current.previous_partition, current.this_partition
                    ))
                })?;
            offsets.push(prev.this_partition);
            current = prev;
        }
        Ok(offsets)
    }
}

impl From<Vec<Partition>> for PartitionList {
    fn from(partitions: Vec<Partition>) -> Self {
        PartitionList { partitions }
    }
}

impl<'a> IntoIterator for &'a PartitionList {
    type Item = &'a Partition;
    type IntoIter = std::slice::Iter<'a, Partition>;

    fn into_iter(self) -> Self::IntoIter {
        self.partitions.iter()
    }
}

/// Random Index Pack entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RipEntry {
    /// Body SID (0 for partitions without essence)
    pub body_sid: u32,
    /// Byte offset of the partition, relative to the end of the run-in
    pub this_partition: u64,
}

/// Random Index Pack
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RandomIndexPack {
    pub entries: Vec<RipEntry>,
}

impl RandomIndexPack {
    /// Build the RIP listing every partition
    pub fn from_partitions(partitions: &PartitionList) -> Self {
        RandomIndexPack {
            entries: partitions
                .iter()
                .map(|p| RipEntry {
                    body_sid: p.body_sid,
                    this_partition: p.this_partition,
                })
                .collect(),
        }
    }

    /// Write the RIP followed by its overall length
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<u64> {
        let len = 12 * self.entries.len() as u64 + 4;
        let llen = klv::write_kl(writer, &labels::RANDOM_INDEX_PACK, len)?;
        for entry in &self.entries {
            writer.write_u32::<BigEndian>(entry.body_sid)?;
            writer.write_u64::<BigEndian>(entry.this_partition)?;
        }

        let overall = KEY_LEN + llen as u64 + len;
        let overall_u32 = u32::try_from(overall)
            .map_err(|_| MxfError::InvalidPartition(format!("RIP of {} bytes is too large", overall)))?;
        writer.write_u32::<BigEndian>(overall_u32)?;
        Ok(overall)
    }

    /// Read the RIP at the end of the stream.
    ///
    /// Returns `None` when the stream does not end with a RIP.
    pub fn read<R: Read + Seek>(reader: &mut R) -> Result<Option<Self>> {
        let size = reader.size()?;
        // key + 1 byte length + one entry + overall length
        if size < 33 {
            return Ok(None);
        }

        reader.seek(SeekFrom::End(-4))?;
        let overall = reader.read_u32::<BigEndian>()? as u64;
        if overall < 33 || overall > size {
            return Ok(None);
        }

        reader.seek_to(size - overall)?;
        let kl = klv::read_kl(reader)?;
        if !kl.key.eq_mod_regver(&labels::RANDOM_INDEX_PACK) {
            return Ok(None);
        }
        if kl.len < 4 || (kl.len - 4) % 12 != 0 || kl.total_len() != overall {
            return Err(MxfError::InvalidPartition(format!(
                "RIP length {} does not hold whole entries",
                kl.len
            )));
        }

        let count = (kl.len - 4) / 12;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let body_sid = reader.read_u32::<BigEndian>()?;
            let this_partition = reader.read_u64::<BigEndian>()?;
            entries.push(RipEntry { body_sid, this_partition });
        }

        Ok(Some(RandomIndexPack { entries }))
    }
}

/// Locate the header partition pack, allowing a run-in of up to `max_run_in` bytes.
///
/// Returns the run-in length and the header partition pack KL, with the
/// stream positioned at the start of the pack value.
pub fn read_header_partition_kl<R: Read + Seek>(reader: &mut R, max_run_in: u64) -> Result<(u64, KlHeader)> {
    reader.seek_to(0)?;
    let mut window = Vec::new();
    reader
        .by_ref()
        .take(max_run_in + KEY_LEN)
        .read_to_end(&mut window)?;

    let prefix = &labels::PARTITION_PACK_PREFIX[..11];
    let run_in = window
        .windows(KEY_LEN as usize)
        .position(|w| w[..11] == *prefix && UniversalLabel::from(w_key(w)).is_header_partition_pack())
        .ok_or_else(|| {
            MxfError::InvalidPartition(format!(
                "no header partition pack within the first {} bytes",
                max_run_in
            ))
        })? as u64;

    reader.seek_to(run_in)?;
    let kl = klv::read_kl(reader)?;
    Ok((run_in, kl))
}

fn w_key(window: &[u8]) -> [u8; 16] {
    let mut key = [0u8; 16];
    key.copy_from_slice(&window[..16]);
    key
}

/// Read the partition pack at `offset` (relative to the end of the run-in)
pub fn read_partition_at<R: Read + Seek>(
    reader: &mut R,
    run_in: u64,
    offset: u64,
    logger: &Logger,
) -> Result<Partition> {
    let pack_start = run_in.checked_add(offset).ok_or_else(|| {
        MxfError::InvalidPartition(format!("partition offset {} is beyond the stream", offset))
    })?;
    reader.seek_to(pack_start)?;
    let kl = klv::read_kl(reader)?;
    if !kl.key.is_partition_pack() {
        return Err(MxfError::InvalidPartition(format!(
            "expected a partition pack at {}, found {:?}",
            offset, kl.key
        )));
    }
    Partition::read(reader, &kl, logger).map_err(|e| e.with_context(format!("partition at {}", offset)))
}

/// Search backward from the end of the stream for a footer partition pack key.
///
/// Returns the absolute stream offset of the key. The search stops at the
/// first header or body partition key seen, or after `limit` bytes.
pub fn find_footer_partition<R: Read + Seek>(reader: &mut R, limit: u64) -> Result<Option<u64>> {
    let prefix = &labels::PARTITION_PACK_PREFIX[..13];
    let mut end = reader.size()?;
    let stop = end.saturating_sub(limit);
    let mut buffer = vec![0u8; FOOTER_SEARCH_BUFFER + 15];
    let mut carried = 0usize;

    while end > stop && end >= 17 {
        let num_read = (FOOTER_SEARCH_BUFFER as u64).min(end - stop) as usize;
        let start = end - num_read as u64;

        // keep the first 15 bytes of the previous read for keys spanning reads
        buffer.copy_within(0..carried, num_read);
        reader.seek_to(start)?;
        reader.read_exact(&mut buffer[..num_read])?;
        let available = num_read + carried;

        let mut found_other = false;
        for j in (0..num_read).rev() {
            if j + 14 > available || buffer[j..j + 13] != *prefix {
                continue;
            }
            match buffer[j + 13] {
                0x04 => return Ok(Some(start + j as u64)),
                0x02 | 0x03 => {
                    found_other = true;
                    break;
                }
                _ => {}
            }
        }
        if found_other {
            break;
        }

        carried = 15.min(num_read);
        end = start;
    }

    Ok(None)
}

/// Follow `previous_partition` from the footer back to the header.
///
/// Partitions are returned in stream order.
pub fn walk_previous_chain<R: Read + Seek>(
    reader: &mut R,
    run_in: u64,
    footer_offset: u64,
    logger: &Logger,
) -> Result<Vec<Partition>> {
    let mut visited = HashSet::new();
    let mut chain = Vec::new();
    let mut offset = footer_offset;

    loop {
        if !visited.insert(offset) {
            return Err(MxfError::InvalidPartition(format!(
                "partition chain loops back to {}",
                offset
            )));
        }
        let partition = read_partition_at(reader, run_in, offset, logger)?;
        let is_header = partition.kind == PartitionKind::Header;
        let previous = partition.previous_partition;
        chain.push(partition);

        if is_header {
            break;
        }
        if previous >= offset {
            return Err(MxfError::InvalidPartition(format!(
                "previous partition {} is not before partition {}",
                previous, offset
            )));
        }
        offset = previous;
    }

    log_debug!(logger, "recovered {} partitions from the footer chain", chain.len());
    chain.reverse();
    Ok(chain)
}

/// Read every partition pack by walking all KLVs from the header partition.
///
/// A truncated trailing KLV ends the scan.
pub fn scan_partitions_forward<R: Read + Seek>(
    reader: &mut R,
    run_in: u64,
    logger: &Logger,
) -> Result<Vec<Partition>> {
    let size = reader.size()?;
    let mut partitions = Vec::new();
    reader.seek_to(run_in)?;

    loop {
        let pos = reader.tell()?;
        if pos + KEY_LEN >= size {
            break;
        }
        let kl = match klv::read_kl(reader) {
            Ok(kl) => kl,
            Err(e) if e.is_recoverable() => {
                log_warn!(logger, "forward partition scan stopped at {}: {}", pos, e);
                break;
            }
            Err(e) => return Err(e),
        };

        if kl.key.is_partition_pack() {
            let partition = Partition::read(reader, &kl, logger)
                .map_err(|e| e.with_context(format!("partition at {}", pos - run_in)))?;
            partitions.push(partition);
        } else if kl.key.is_random_index_pack() {
            break;
        } else {
            let next = reader.tell()?.checked_add(kl.len).unwrap_or(u64::MAX);
            if next > size {
                log_warn!(logger, "KLV at {} extends past the end of the stream", pos);
                break;
            }
            reader.seek_to(next)?;
        }
    }

    log_debug!(logger, "forward scan found {} partitions", partitions.len());
    Ok(partitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn write_pack(cursor: &mut Cursor<Vec<u8>>, partition: &mut Partition) {
        partition.write(cursor, 4).unwrap();
        partition.fill_to_kag(cursor, 4).unwrap();
    }

    #[test]
    fn test_partition_keys() {
        let mut part = Partition::new(PartitionKind::Header);
        assert_eq!(part.key().as_bytes()[13..15], [0x02, 0x01]);
        part.close();
        assert_eq!(part.key().as_bytes()[13..15], [0x02, 0x02]);
        part.close_complete();
        assert_eq!(part.key().as_bytes()[13..15], [0x02, 0x04]);
        assert!(part.key().is_closed_partition());

        let footer = Partition::new(PartitionKind::Footer);
        assert!(footer.is_closed());
        assert_eq!(footer.key().as_bytes()[13..15], [0x04, 0x02]);
    }

    #[test]
    fn test_partition_write_read() {
        let mut part = Partition::new(PartitionKind::Body);
        part.kag_size = 512;
        part.body_sid = 2;
        part.index_sid = 1;
        part.body_offset = 123_456;
        part.add_essence_container(labels::ESSENCE_MPEG2_FRAME);
        part.add_essence_container(labels::ESSENCE_MPEG2_FRAME);

        let mut cursor = Cursor::new(Vec::new());
        cursor.write_all(&[0u8; 10]).unwrap();
        part.write(&mut cursor, 4).unwrap();
        assert_eq!(part.this_partition, 10);
        assert_eq!(cursor.get_ref().len() as u64, 10 + part.pack_size(4));

        cursor.seek_to(10).unwrap();
        let kl = klv::read_kl(&mut cursor).unwrap();
        assert_eq!(kl.llen, 4);
        let parsed = Partition::read(&mut cursor, &kl, &Logger::silent()).unwrap();
        assert_eq!(parsed.kind, PartitionKind::Body);
        assert_eq!(parsed.kag_size, 512);
        assert_eq!(parsed.body_offset, 123_456);
        assert_eq!(parsed.essence_containers, vec![labels::ESSENCE_MPEG2_FRAME]);
    }

    #[test]
    fn test_read_short_pack_fails() {
        let kl = KlHeader {
            key: Partition::new(PartitionKind::Header).key(),
            llen: 1,
            len: 87,
        };
        let err = Partition::read(&mut Cursor::new(vec![0u8; 87]), &kl, &Logger::silent()).unwrap_err();
        assert!(matches!(err, MxfError::InvalidPartition(_)));
    }

    #[test]
    fn test_read_extra_bytes_skipped() {
        let mut part = Partition::new(PartitionKind::Header);
        let mut data = Vec::new();
        part.write(&mut Cursor::new(&mut data), 1).unwrap();
        let value = data[17..].to_vec();

        let mut padded = value.clone();
        padded.extend_from_slice(&[0xEE; 8]);
        padded.push(0x42);
        let kl = KlHeader {
            key: part.key(),
            llen: 1,
            len: value.len() as u64 + 8,
        };
        let mut cursor = Cursor::new(padded);
        Partition::read(&mut cursor, &kl, &Logger::silent()).unwrap();
        assert_eq!(cursor.read_u8().unwrap(), 0x42);
    }

    #[test]
    fn test_fill_to_kag() {
        let mut part = Partition::new(PartitionKind::Header);
        part.kag_size = 512;
        let mut cursor = Cursor::new(Vec::new());
        write_pack(&mut cursor, &mut part);
        assert_eq!(cursor.get_ref().len() % 512, 0);

        // already aligned: nothing written
        let before = cursor.get_ref().len();
        part.fill_to_kag(&mut cursor, 4).unwrap();
        assert_eq!(cursor.get_ref().len(), before);

        // 500 bytes leaves room for only 12 bytes: the filler spills into the next grid
        cursor.write_all(&[0u8; 500]).unwrap();
        part.fill_to_kag(&mut cursor, 4).unwrap();
        assert_eq!(cursor.get_ref().len(), before + 1024);
    }

    #[test]
    fn test_fill_kag_one_is_noop() {
        let part = Partition::new(PartitionKind::Body);
        let mut cursor = Cursor::new(vec![0u8; 33]);
        cursor.seek(SeekFrom::End(0)).unwrap();
        part.fill_to_kag(&mut cursor, 4).unwrap();
        assert_eq!(cursor.get_ref().len(), 33);
    }

    #[test]
    fn test_allocate_space_to_kag() {
        let mut part = Partition::new(PartitionKind::Header);
        part.kag_size = 256;
        let mut cursor = Cursor::new(Vec::new());
        write_pack(&mut cursor, &mut part);
        let start = cursor.get_ref().len() as u64;

        part.allocate_space_to_kag(&mut cursor, 1000, 4).unwrap();
        let end = cursor.get_ref().len() as u64;
        assert!(end - start >= 1000);
        assert_eq!(end % 256, 0);

        // KAG 1 reservation is exact
        let part = Partition::new(PartitionKind::Body);
        let mut cursor = Cursor::new(Vec::new());
        part.allocate_space_to_kag(&mut cursor, 100, 4).unwrap();
        assert_eq!(cursor.get_ref().len(), 100);
    }

    #[test]
    fn test_marks() {
        let mut part = Partition::new(PartitionKind::Header);
        let mut cursor = Cursor::new(Vec::new());
        part.mark_header_start(&mut cursor).unwrap();
        cursor.write_all(&[0u8; 77]).unwrap();
        part.mark_header_end(&mut cursor).unwrap();
        assert_eq!(part.header_byte_count, 77);
        assert!(part.mark_index_end(&mut cursor).is_err());
    }

    #[test]
    fn test_partition_list_update() {
        let mut list = PartitionList::new();
        let mut cursor = Cursor::new(Vec::new());

        let header = list.create_partition(PartitionKind::Header);
        header.kag_size = 1;
        header.write(&mut cursor, 4).unwrap();
        cursor.write_all(&[0u8; 40]).unwrap();

        let body = list.create_partition(PartitionKind::Body);
        body.body_sid = 2;
        body.write(&mut cursor, 4).unwrap();
        cursor.write_all(&[0u8; 40]).unwrap();

        let footer = list.create_partition(PartitionKind::Footer);
        footer.write(&mut cursor, 4).unwrap();
        let footer_offset = footer.this_partition;

        list.update(&mut cursor, 4).unwrap();
        assert!(list.chain_is_valid());
        assert!(list.iter().all(|p| p.footer_partition == footer_offset));
        assert_eq!(list.walk_back_from_footer().unwrap().len(), 3);

        // rewritten packs agree with memory
        let body_offset = list.get(1).unwrap().this_partition;
        cursor.seek(SeekFrom::End(0)).unwrap();
        let parsed = read_partition_at(&mut cursor, 0, body_offset, &Logger::silent()).unwrap();
        assert_eq!(parsed.footer_partition, footer_offset);
        assert_eq!(parsed.previous_partition, 0);
    }

    #[test]
    fn test_rip_write_read() {
        let rip = RandomIndexPack {
            entries: vec![
                RipEntry { body_sid: 0, this_partition: 0 },
                RipEntry { body_sid: 2, this_partition: 1000 },
                RipEntry { body_sid: 0, this_partition: 5000 },
            ],
        };

        let mut cursor = Cursor::new(vec![0u8; 64]);
        cursor.seek(SeekFrom::End(0)).unwrap();
        let size = rip.write(&mut cursor).unwrap();
        assert_eq!(size, 16 + 1 + 36 + 4);

        let parsed = RandomIndexPack::read(&mut cursor).unwrap().unwrap();
        assert_eq!(parsed, rip);
    }

    #[test]
    fn test_rip_missing() {
        let mut cursor = Cursor::new(vec![0u8; 200]);
        assert!(RandomIndexPack::read(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_find_footer_and_walk_chain() {
        let mut list = PartitionList::new();
        let mut cursor = Cursor::new(Vec::new());
        for kind in [PartitionKind::Header, PartitionKind::Body, PartitionKind::Body] {
            list.create_partition(kind).write(&mut cursor, 4).unwrap();
            cursor.write_all(&vec![0x11u8; 40_000]).unwrap();
        }
        list.create_partition(PartitionKind::Footer).write(&mut cursor, 4).unwrap();
        list.update(&mut cursor, 4).unwrap();
        let footer_offset = list.footer().unwrap().this_partition;
        cursor.write_all(&[0u8; 50]).unwrap();

        let found = find_footer_partition(&mut cursor, DEFAULT_FOOTER_SEARCH_LIMIT).unwrap();
        assert_eq!(found, Some(footer_offset));

        let chain = walk_previous_chain(&mut cursor, 0, footer_offset, &Logger::silent()).unwrap();
        assert_eq!(chain.len(), 4);
        assert_eq!(chain[0].kind, PartitionKind::Header);

        let scanned = scan_partitions_forward(&mut cursor, 0, &Logger::silent()).unwrap();
        assert_eq!(scanned.len(), 4);
    }

    #[test]
    fn test_run_in() {
        let mut data = vec![0xABu8; 300];
        let mut header = Partition::new(PartitionKind::Header);
        let mut pack = Cursor::new(Vec::new());
        header.write(&mut pack, 4).unwrap();
        data.extend_from_slice(pack.get_ref());

        let mut cursor = Cursor::new(data);
        let (run_in, kl) = read_header_partition_kl(&mut cursor, MAX_RUN_IN_LEN).unwrap();
        assert_eq!(run_in, 300);
        assert!(kl.key.is_header_partition_pack());

        assert!(read_header_partition_kl(&mut cursor, 100).is_err());
    }
}
