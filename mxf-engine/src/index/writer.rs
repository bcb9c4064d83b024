//! Write-side index table.
//!
//! Entries are cached per element until their content package is indexed.
//! Entries for temporally reordered pictures may be written before their
//! temporal offset is known; they stay unresolved until patched and a
//! segment is only flushed once every entry in it is resolved.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Seek, Write};

use crate::error::{MxfError, Result};
use crate::index::segment::{DeltaEntry, IndexEntry, IndexTableSegment, MAX_INDEX_SEGMENT_SIZE};
use crate::index::{EntryPatch, IndexEntryInfo};
use crate::partition::Partition;
use crate::track::TrackKind;
use crate::types::EditRate;

/// Entries a single element may cache ahead of the indexed duration
pub const MAX_CACHE_ENTRIES: usize = 250;

// expected entries between partition starts, used to start a new segment early
const MAX_GOP_SIZE_GUESS: usize = 30;

#[derive(Debug, Clone)]
struct CachedEntry {
    info: IndexEntryInfo,
}

impl CachedEntry {
    fn is_default(&self) -> bool {
        self.info.temporal_offset == 0 && self.info.key_frame_offset == 0 && self.info.flags == 0
    }
}

#[derive(Debug)]
struct IndexElement {
    track_index: u32,
    kind: TrackKind,
    is_cbe: bool,
    temporal_reordering: bool,
    slice: u8,
    element_size: u32,
    cache: BTreeMap<i64, CachedEntry>,
}

impl IndexElement {
    fn can_start_partition(&self, position: i64) -> bool {
        self.is_cbe
            || self
                .cache
                .get(&position)
                .map_or(true, |e| e.info.can_start_partition)
    }
}

/// Builds the index table segments of one body stream
#[derive(Debug)]
pub struct IndexTableWriter {
    index_sid: u32,
    body_sid: u32,
    edit_rate: EditRate,
    elements: Vec<IndexElement>,
    prepared: bool,
    is_cbe: bool,
    slice_count: u8,
    delta_entries: Vec<DeltaEntry>,
    cbe_segment: Option<IndexTableSegment>,
    segments: Vec<IndexTableSegment>,
    /// (position, track index) of entries waiting for a patch
    unresolved: BTreeSet<(i64, u32)>,
    duration: i64,
    flushed_duration: i64,
    stream_offset: u64,
}

impl IndexTableWriter {
    pub fn new(index_sid: u32, body_sid: u32, edit_rate: EditRate) -> Self {
        IndexTableWriter {
            index_sid,
            body_sid,
            edit_rate,
            elements: Vec::new(),
            prepared: false,
            is_cbe: true,
            slice_count: 0,
            delta_entries: Vec::new(),
            cbe_segment: None,
            segments: Vec::new(),
            unresolved: BTreeSet::new(),
            duration: 0,
            flushed_duration: 0,
            stream_offset: 0,
        }
    }

    /// Register the element of a track. The table is CBE only if every
    /// element has a fixed size.
    pub fn register_element(
        &mut self,
        track_index: u32,
        kind: TrackKind,
        fixed_size: bool,
        temporal_reordering: bool,
    ) -> Result<()> {
        if self.prepared {
            return Err(MxfError::InvalidConfig(format!(
                "track {} registered after writing started",
                track_index
            )));
        }
        if self.elements.iter().any(|e| e.track_index == track_index) {
            return Err(MxfError::InvalidConfig(format!(
                "track {} registered twice",
                track_index
            )));
        }
        self.elements.push(IndexElement {
            track_index,
            kind,
            is_cbe: fixed_size,
            temporal_reordering,
            slice: 0,
            element_size: 0,
            cache: BTreeMap::new(),
        });
        self.is_cbe &= fixed_size;
        Ok(())
    }

    /// Order the elements and assign slices; a new slice follows every
    /// variable-size element.
    pub fn prepare(&mut self) -> Result<()> {
        if self.elements.is_empty() {
            return Err(MxfError::InvalidConfig("no tracks registered".into()));
        }
        self.elements.sort_by_key(|e| e.kind.emission_rank());

        let mut slice = 0u8;
        for i in 0..self.elements.len() {
            if i > 0 && !self.elements[i - 1].is_cbe {
                slice = slice
                    .checked_add(1)
                    .ok_or_else(|| MxfError::InvalidConfig("more than 255 index slices".into()))?;
            }
            self.elements[i].slice = slice;
        }
        self.slice_count = slice;

        if self.is_cbe {
            self.cbe_segment = Some(IndexTableSegment::new(
                self.index_sid,
                self.body_sid,
                self.edit_rate,
                0,
                0,
            ));
        }
        self.prepared = true;
        Ok(())
    }

    pub fn is_cbe(&self) -> bool {
        self.is_cbe
    }

    pub fn slice_count(&self) -> u8 {
        self.slice_count
    }

    pub fn index_sid(&self) -> u32 {
        self.index_sid
    }

    /// Number of indexed edit units
    pub fn duration(&self) -> i64 {
        self.duration
    }

    /// Body stream offset of the next edit unit
    pub fn stream_offset(&self) -> u64 {
        self.stream_offset
    }

    /// Edit unit byte count of a CBE table, 0 until the first package is indexed
    pub fn edit_unit_byte_count(&self) -> u32 {
        self.cbe_segment.as_ref().map_or(0, |s| s.edit_unit_byte_count)
    }

    pub fn delta_entries(&self) -> &[DeltaEntry] {
        &self.delta_entries
    }

    /// Track indexes in index element order
    pub fn element_order(&self) -> Vec<u32> {
        self.elements.iter().map(|e| e.track_index).collect()
    }

    fn element_mut(&mut self, track_index: u32) -> Result<&mut IndexElement> {
        self.elements
            .iter_mut()
            .find(|e| e.track_index == track_index)
            .ok_or(MxfError::InvalidTrack(track_index))
    }

    /// Cache the entry for `position` of an element of a VBE table.
    ///
    /// An unresolved entry must be patched with [`update_index_entry`]
    /// before its segment can be written.
    ///
    /// [`update_index_entry`]: IndexTableWriter::update_index_entry
    pub fn add_index_entry(
        &mut self,
        track_index: u32,
        position: i64,
        info: IndexEntryInfo,
        is_resolved: bool,
    ) -> Result<()> {
        let duration = self.duration;
        let is_cbe = self.is_cbe;
        let element = self.element_mut(track_index)?;
        if is_cbe {
            return Ok(());
        }
        if position < duration {
            return Err(MxfError::OutOfSequence {
                track_index,
                message: format!("index entry {} is before indexed duration {}", position, duration),
            });
        }
        if element.cache.len() >= MAX_CACHE_ENTRIES && !element.cache.contains_key(&position) {
            return Err(MxfError::OutOfSequence {
                track_index,
                message: format!("more than {} index entries cached", MAX_CACHE_ENTRIES),
            });
        }

        element.cache.insert(position, CachedEntry { info });
        if is_resolved {
            self.unresolved.remove(&(position, track_index));
        } else {
            self.unresolved.insert((position, track_index));
        }
        Ok(())
    }

    /// Patch the entry at `position`, marking it resolved.
    ///
    /// Works on cached entries and on entries appended to segments that have
    /// not been written yet.
    pub fn update_index_entry(&mut self, track_index: u32, position: i64, patch: EntryPatch) -> Result<()> {
        if self.is_cbe {
            return Err(MxfError::InvalidConfig("index entries cannot be patched in a CBE index".into()));
        }
        if position < 0 {
            return Err(MxfError::OutOfSequence {
                track_index,
                message: format!("index entry position {} is negative", position),
            });
        }
        if position < self.flushed_duration {
            return Err(MxfError::IndexEntryFinalized { position });
        }

        if position >= self.duration {
            let element = self.element_mut(track_index)?;
            let entry = element.cache.get_mut(&position).ok_or(MxfError::OutOfSequence {
                track_index,
                message: format!("no index entry cached for position {}", position),
            })?;
            patch.apply(&mut entry.info.temporal_offset, &mut entry.info.key_frame_offset, &mut entry.info.flags);
        } else {
            self.element_mut(track_index)?;
            let entry = self.appended_entry_mut(position)?;
            patch.apply(&mut entry.temporal_offset, &mut entry.key_frame_offset, &mut entry.flags);
        }

        self.unresolved.remove(&(position, track_index));
        Ok(())
    }

    fn appended_entry_mut(&mut self, position: i64) -> Result<&mut IndexEntry> {
        let segment = self
            .segments
            .iter_mut()
            .rev()
            .find(|s| position >= s.start_position)
            .ok_or(MxfError::IndexEntryFinalized { position })?;
        let rel = (position - segment.start_position) as usize;
        segment
            .entries
            .get_mut(rel)
            .ok_or(MxfError::IndexUnavailable { position })
    }

    /// Whether a new partition may start before the next edit unit
    pub fn can_start_partition(&self) -> bool {
        if self.is_cbe {
            return true;
        }
        self.unresolved_before(self.duration).next().is_none()
            && self.elements.iter().all(|e| e.can_start_partition(self.duration))
    }

    /// Index the next content package.
    ///
    /// `element_sizes` holds the written size of each element in index
    /// element order.
    pub fn update_index(&mut self, size: u32, element_sizes: &[u32]) -> Result<()> {
        if !self.prepared {
            return Err(MxfError::InvalidConfig("index table used before prepare".into()));
        }
        if element_sizes.len() != self.elements.len() {
            return Err(MxfError::Other(format!(
                "{} element sizes for {} index elements",
                element_sizes.len(),
                self.elements.len()
            )));
        }

        if self.duration == 0 {
            self.create_delta_entries(element_sizes);
        } else {
            self.check_element_sizes(element_sizes)?;
        }

        if self.is_cbe {
            self.update_cbe_index(size)?;
        } else {
            self.update_vbe_index(element_sizes)?;
        }

        self.duration += 1;
        self.stream_offset += size as u64;
        Ok(())
    }

    fn create_delta_entries(&mut self, element_sizes: &[u32]) {
        self.delta_entries.clear();
        let mut prev_slice = 0u8;
        let mut element_delta = 0u32;
        for (element, &size) in self.elements.iter_mut().zip(element_sizes) {
            if element.slice != prev_slice {
                element_delta = 0;
            }
            self.delta_entries.push(DeltaEntry {
                pos_table_index: if element.temporal_reordering { -1 } else { 0 },
                slice: element.slice,
                element_delta,
            });
            prev_slice = element.slice;
            element_delta += size;
            if element.is_cbe {
                element.element_size = size;
            }
        }

        if self.delta_entries.len() == 1 && self.delta_entries[0] == DeltaEntry::default() {
            self.delta_entries.clear();
        }

        if let Some(segment) = self.cbe_segment.as_mut() {
            segment.delta_entries = self.delta_entries.clone();
        }
    }

    fn check_element_sizes(&self, element_sizes: &[u32]) -> Result<()> {
        for (element, &size) in self.elements.iter().zip(element_sizes) {
            if element.is_cbe && element.element_size != size {
                return Err(MxfError::SampleSizeMismatch {
                    track_index: element.track_index,
                    expected: element.element_size as u64,
                    actual: size as u64,
                });
            }
        }
        Ok(())
    }

    fn update_cbe_index(&mut self, size: u32) -> Result<()> {
        let segment = self
            .cbe_segment
            .as_mut()
            .ok_or_else(|| MxfError::Other("CBE index segment missing".into()))?;
        if segment.edit_unit_byte_count == 0 {
            segment.edit_unit_byte_count = size;
        } else if segment.edit_unit_byte_count != size {
            return Err(MxfError::InvalidIndexSegment(format!(
                "variable content package size {} in CBE index with edit unit byte count {}",
                size, segment.edit_unit_byte_count
            )));
        }
        segment.duration += 1;
        Ok(())
    }

    fn update_vbe_index(&mut self, element_sizes: &[u32]) -> Result<()> {
        // checked before the cached entries are taken
        let can_start_partition = self.elements.iter().all(|e| e.can_start_partition(self.duration));

        let mut entry = IndexEntry {
            stream_offset: self.stream_offset,
            ..Default::default()
        };
        let mut have_entry = false;
        let mut slice_offset = 0u32;
        let mut prev_slice = 0u8;
        for (element, &size) in self.elements.iter_mut().zip(element_sizes) {
            if let Some(cached) = element.cache.remove(&self.duration) {
                if !cached.is_default() {
                    let info = cached.info;
                    if have_entry
                        && (entry.temporal_offset != info.temporal_offset
                            || entry.key_frame_offset != info.key_frame_offset
                            || entry.flags != info.flags)
                    {
                        return Err(MxfError::InvalidIndexSegment(format!(
                            "conflicting index entries for position {}",
                            self.duration
                        )));
                    }
                    entry.temporal_offset = info.temporal_offset;
                    entry.key_frame_offset = info.key_frame_offset;
                    entry.flags = info.flags;
                    have_entry = true;
                }
            }
            if element.slice != prev_slice {
                entry.slice_offsets.push(slice_offset);
                prev_slice = element.slice;
            }
            slice_offset += size;
        }

        let entry_size = 11 + 4 * self.slice_count as usize;
        let need_segment = match self.segments.last() {
            None => true,
            Some(last) => {
                let used = last.entries.len() * entry_size;
                used >= MAX_INDEX_SEGMENT_SIZE
                    || (used >= MAX_INDEX_SEGMENT_SIZE - MAX_GOP_SIZE_GUESS * entry_size && can_start_partition)
            }
        };
        if need_segment {
            self.segments.push(IndexTableSegment::new(
                self.index_sid,
                self.body_sid,
                self.edit_rate,
                self.duration,
                self.slice_count,
            ));
        }

        if let Some(segment) = self.segments.last_mut() {
            segment.entries.push(entry);
            segment.duration += 1;
        }
        Ok(())
    }

    /// Check whether there is index data to write
    pub fn have_segments(&self) -> bool {
        self.is_cbe || self.segments.iter().any(|s| s.duration > 0)
    }

    /// Number of entries that are still unresolved
    pub fn unresolved_count(&self) -> usize {
        self.unresolved.len()
    }

    fn unresolved_before(&self, position: i64) -> impl Iterator<Item = &(i64, u32)> {
        self.unresolved.range(..(position, 0))
    }

    /// Check that no unresolved or un-indexed entries remain
    pub fn check_complete(&self) -> Result<()> {
        if let Some(&(first_position, _)) = self.unresolved.iter().next() {
            return Err(MxfError::PendingIndexEntries {
                count: self.unresolved.len(),
                first_position,
            });
        }
        let cached: usize = self.elements.iter().map(|e| e.cache.len()).sum();
        if cached > 0 {
            let first_position = self
                .elements
                .iter()
                .filter_map(|e| e.cache.keys().next().copied())
                .min()
                .unwrap_or(self.duration);
            return Err(MxfError::PendingIndexEntries {
                count: cached,
                first_position,
            });
        }
        Ok(())
    }

    /// Drop cached entries for positions that were never indexed.
    ///
    /// Returns the number of entries dropped.
    pub fn discard_pending(&mut self) -> usize {
        let duration = self.duration;
        let dropped = self
            .elements
            .iter_mut()
            .map(|e| e.cache.split_off(&duration).len())
            .sum();
        self.unresolved.retain(|&(p, _)| p < duration);
        dropped
    }

    /// Write the CBE segment again at the current stream position with its
    /// final duration. The encoding has the size of the first write.
    pub fn rewrite_cbe_segment<W: Write>(&self, writer: &mut W, min_llen: u8) -> Result<()> {
        let segment = self
            .cbe_segment
            .as_ref()
            .ok_or_else(|| MxfError::Other("no CBE index segment to rewrite".into()))?;
        segment.write(writer, min_llen)?;
        Ok(())
    }

    /// Write the index segments into `partition`.
    ///
    /// A non-final CBE write records duration 0, completed by the final
    /// rewrite. VBE segments are drained and may only be written once all of
    /// their entries are resolved.
    pub fn write_segments<W: Write + Seek>(
        &mut self,
        writer: &mut W,
        partition: &mut Partition,
        final_write: bool,
        min_llen: u8,
    ) -> Result<()> {
        if !self.have_segments() {
            return Err(MxfError::Other("no index segments to write".into()));
        }
        if !self.is_cbe {
            if let Some(&(first_position, _)) = self.unresolved_before(self.duration).next() {
                return Err(MxfError::PendingIndexEntries {
                    count: self.unresolved_before(self.duration).count(),
                    first_position,
                });
            }
        }

        partition.mark_index_start(writer)?;
        if let Some(segment) = self.cbe_segment.as_ref() {
            let mut segment = segment.clone();
            if !final_write {
                segment.duration = 0;
            }
            segment.write(writer, min_llen)?;
        } else {
            for mut segment in self.segments.drain(..) {
                segment.delta_entries = self.delta_entries.clone();
                segment.write(writer, min_llen)?;
            }
            self.flushed_duration = self.duration;
        }
        partition.fill_to_kag(writer, min_llen)?;
        partition.mark_index_end(writer)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{FLAG_RANDOM_ACCESS, FLAG_P_FRAME};
    use crate::klv::KlvReader;
    use crate::log::Logger;
    use crate::partition::PartitionKind;
    use crate::types::Rational;
    use proptest::prelude::*;
    use std::io::Cursor;

    fn vbe_writer() -> IndexTableWriter {
        let mut writer = IndexTableWriter::new(1, 2, Rational::fps_25());
        writer.register_element(0, TrackKind::Picture, false, true).unwrap();
        writer.register_element(1, TrackKind::Sound, true, false).unwrap();
        writer.prepare().unwrap();
        writer
    }

    fn info(temporal_offset: i8, flags: u8) -> IndexEntryInfo {
        IndexEntryInfo {
            temporal_offset,
            key_frame_offset: 0,
            flags,
            can_start_partition: true,
        }
    }

    fn written_segments(writer: &mut IndexTableWriter) -> Vec<IndexTableSegment> {
        let mut cursor = Cursor::new(Vec::new());
        let mut partition = Partition::new(PartitionKind::Body);
        writer.write_segments(&mut cursor, &mut partition, true, 4).unwrap();
        assert_eq!(partition.index_byte_count, cursor.get_ref().len() as u64);

        let data = cursor.into_inner();
        let mut reader = KlvReader::new(&data);
        let mut segments = Vec::new();
        while let Some((kl, value)) = reader.read_klv().unwrap() {
            if kl.key.is_index_table_segment() {
                segments.push(IndexTableSegment::parse(value, &Logger::silent()).unwrap());
            }
        }
        segments
    }

    #[test]
    fn test_cbe_index() {
        let mut writer = IndexTableWriter::new(1, 2, Rational::fps_29_97());
        writer.register_element(1, TrackKind::Sound, true, false).unwrap();
        writer.register_element(0, TrackKind::Picture, true, false).unwrap();
        writer.prepare().unwrap();
        assert!(writer.is_cbe());
        assert_eq!(writer.element_order(), vec![0, 1]);

        for _ in 0..10 {
            writer.update_index(103_264, &[100_020, 3244]).unwrap();
        }
        assert_eq!(writer.edit_unit_byte_count(), 103_264);
        assert_eq!(writer.delta_entries()[1].element_delta, 100_020);
        assert_eq!(writer.stream_offset(), 1_032_640);

        let err = writer.update_index(103_265, &[100_021, 3244]).unwrap_err();
        assert!(matches!(err, MxfError::SampleSizeMismatch { track_index: 0, .. }));

        let segments = written_segments(&mut writer);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].duration, 10);
    }

    #[test]
    fn test_cbe_non_final_write_has_zero_duration() {
        let mut writer = IndexTableWriter::new(1, 2, Rational::fps_25());
        writer.register_element(0, TrackKind::Picture, true, false).unwrap();
        writer.prepare().unwrap();
        writer.update_index(1000, &[1000]).unwrap();

        let mut cursor = Cursor::new(Vec::new());
        let mut partition = Partition::new(PartitionKind::Body);
        writer.write_segments(&mut cursor, &mut partition, false, 4).unwrap();
        let data = cursor.into_inner();
        let (_, value) = KlvReader::new(&data).read_klv().unwrap().unwrap();
        let segment = IndexTableSegment::parse(value, &Logger::silent()).unwrap();
        assert_eq!(segment.duration, 0);
        // single trivial delta entry dropped
        assert!(segment.delta_entries.is_empty());
    }

    #[test]
    fn test_vbe_entries_and_slices() {
        let mut writer = vbe_writer();
        assert_eq!(writer.slice_count(), 1);

        writer.add_index_entry(0, 0, info(0, FLAG_RANDOM_ACCESS), true).unwrap();
        writer.update_index(5020, &[5000, 20]).unwrap();
        writer.add_index_entry(0, 1, info(0, FLAG_P_FRAME), true).unwrap();
        writer.update_index(3020, &[3000, 20]).unwrap();

        let segments = written_segments(&mut writer);
        assert_eq!(segments.len(), 1);
        let entries = &segments[0].entries;
        assert_eq!(entries[1].stream_offset, 5020);
        assert_eq!(entries[1].slice_offsets, vec![3000]);
        assert_eq!(entries[1].flags, FLAG_P_FRAME);
        assert_eq!(segments[0].delta_entries[0].pos_table_index, -1);
        assert_eq!(segments[0].delta_entries[1].slice, 1);
    }

    #[test]
    fn test_patch_appended_entry() {
        let mut writer = vbe_writer();
        writer.add_index_entry(0, 0, info(0, FLAG_RANDOM_ACCESS), false).unwrap();
        writer.update_index(100, &[80, 20]).unwrap();
        assert!(!writer.can_start_partition());

        writer
            .update_index_entry(0, 0, EntryPatch::temporal_offset(2))
            .unwrap();
        assert!(writer.can_start_partition());
        let segments = written_segments(&mut writer);
        assert_eq!(segments[0].entries[0].temporal_offset, 2);

        let err = writer.update_index_entry(0, 0, EntryPatch::temporal_offset(1)).unwrap_err();
        assert!(matches!(err, MxfError::IndexEntryFinalized { position: 0 }));
    }

    #[test]
    fn test_flush_with_unresolved_fails() {
        let mut writer = vbe_writer();
        writer.add_index_entry(0, 0, info(0, FLAG_RANDOM_ACCESS), false).unwrap();
        writer.update_index(100, &[80, 20]).unwrap();

        let mut cursor = Cursor::new(Vec::new());
        let mut partition = Partition::new(PartitionKind::Body);
        let err = writer.write_segments(&mut cursor, &mut partition, false, 4).unwrap_err();
        assert!(matches!(err, MxfError::PendingIndexEntries { count: 1, first_position: 0 }));
        assert!(writer.check_complete().is_err());
    }

    #[test]
    fn test_entry_before_duration_rejected() {
        let mut writer = vbe_writer();
        writer.add_index_entry(0, 0, info(0, FLAG_RANDOM_ACCESS), true).unwrap();
        writer.update_index(100, &[80, 20]).unwrap();
        let err = writer.add_index_entry(0, 0, info(0, FLAG_RANDOM_ACCESS), true).unwrap_err();
        assert!(matches!(err, MxfError::OutOfSequence { .. }));
    }

    #[test]
    fn test_fixed_size_picture_entries_in_vbe_table() {
        let mut writer = IndexTableWriter::new(1, 2, Rational::fps_25());
        writer.register_element(0, TrackKind::Picture, true, false).unwrap();
        writer.register_element(1, TrackKind::Data, false, false).unwrap();
        writer.prepare().unwrap();
        assert!(!writer.is_cbe());

        writer.add_index_entry(0, 0, info(0, FLAG_RANDOM_ACCESS), true).unwrap();
        writer.update_index(1040, &[1020, 20]).unwrap();
        writer.add_index_entry(0, 1, info(0, FLAG_P_FRAME), true).unwrap();
        writer.update_index(1041, &[1020, 21]).unwrap();

        let segments = written_segments(&mut writer);
        let flags: Vec<u8> = segments[0].entries.iter().map(|e| e.flags).collect();
        assert_eq!(flags, vec![FLAG_RANDOM_ACCESS, FLAG_P_FRAME]);
    }

    #[test]
    fn test_unresolved_entries_tracked_per_track() {
        let mut writer = IndexTableWriter::new(1, 2, Rational::fps_25());
        writer.register_element(0, TrackKind::Picture, false, true).unwrap();
        writer.register_element(1, TrackKind::Picture, false, true).unwrap();
        writer.prepare().unwrap();

        writer.add_index_entry(0, 0, info(0, FLAG_RANDOM_ACCESS), false).unwrap();
        writer.add_index_entry(1, 0, info(0, FLAG_RANDOM_ACCESS), false).unwrap();
        writer.update_index(200, &[100, 100]).unwrap();
        assert_eq!(writer.unresolved_count(), 2);

        writer.update_index_entry(0, 0, EntryPatch::temporal_offset(1)).unwrap();
        assert_eq!(writer.unresolved_count(), 1);
        assert!(!writer.can_start_partition());
        assert!(writer.check_complete().is_err());

        writer.update_index_entry(1, 0, EntryPatch::temporal_offset(1)).unwrap();
        assert!(writer.can_start_partition());
        assert!(writer.check_complete().is_ok());
        let segments = written_segments(&mut writer);
        assert_eq!(segments[0].entries[0].temporal_offset, 1);
    }

    #[test]
    fn test_segments_split_at_size_limit() {
        let mut writer = IndexTableWriter::new(1, 2, Rational::fps_25());
        writer.register_element(0, TrackKind::Picture, false, false).unwrap();
        writer.prepare().unwrap();
        // 11 byte entries, no slices: 5910 entries fill one segment
        for position in 0..6000 {
            writer
                .add_index_entry(0, position, info(0, FLAG_RANDOM_ACCESS), true)
                .unwrap();
            writer.update_index(10, &[10]).unwrap();
        }
        let segments = written_segments(&mut writer);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].start_position, segments[0].duration);
        assert!(segments[0].entries_size() <= MAX_INDEX_SEGMENT_SIZE);
        assert_eq!(segments[0].duration + segments[1].duration, 6000);
    }

    #[test]
    fn test_discard_pending_drops_unindexed_entries() {
        let mut writer = vbe_writer();
        writer.add_index_entry(0, 0, info(0, FLAG_RANDOM_ACCESS), true).unwrap();
        writer.update_index(100, &[80, 20]).unwrap();
        writer.add_index_entry(0, 1, info(0, FLAG_P_FRAME), false).unwrap();
        assert!(writer.check_complete().is_err());

        assert_eq!(writer.discard_pending(), 1);
        assert_eq!(writer.unresolved_count(), 0);
        assert!(writer.check_complete().is_ok());
    }

    #[test]
    fn test_rewrite_cbe_segment_keeps_size() {
        let mut writer = IndexTableWriter::new(1, 2, Rational::fps_25());
        writer.register_element(0, TrackKind::Picture, true, false).unwrap();
        writer.prepare().unwrap();
        writer.update_index(1000, &[1000]).unwrap();

        let mut first = Vec::new();
        let mut partition = Partition::new(PartitionKind::Body);
        let mut cursor = Cursor::new(&mut first);
        writer.write_segments(&mut cursor, &mut partition, false, 4).unwrap();

        for _ in 0..99 {
            writer.update_index(1000, &[1000]).unwrap();
        }
        let mut second = Vec::new();
        writer.rewrite_cbe_segment(&mut second, 4).unwrap();
        assert_eq!(first.len(), second.len());

        let (_, value) = KlvReader::new(&second).read_klv().unwrap().unwrap();
        let segment = IndexTableSegment::parse(value, &Logger::silent()).unwrap();
        assert_eq!(segment.duration, 100);
        assert!(vbe_writer().rewrite_cbe_segment(&mut Vec::new(), 4).is_err());
    }

    proptest! {
        #[test]
        fn prop_last_patch_wins(
            patches in prop::collection::vec((0i64..8, -3i8..4), 1..40),
        ) {
            let mut writer = vbe_writer();
            for position in 0..8 {
                writer.add_index_entry(0, position, info(0, FLAG_P_FRAME), false).unwrap();
            }
            for position in 0..4 {
                writer.update_index(100, &[80, 20]).unwrap();
                prop_assert_eq!(writer.duration(), position + 1);
            }

            let mut expected = [None; 8];
            for (position, offset) in &patches {
                writer.update_index_entry(0, *position, EntryPatch::temporal_offset(*offset)).unwrap();
                expected[*position as usize] = Some(*offset);
            }
            for position in 0..8 {
                if expected[position].is_none() {
                    writer.update_index_entry(0, position as i64, EntryPatch::temporal_offset(0)).unwrap();
                    expected[position] = Some(0);
                }
            }
            for _ in 4..8 {
                writer.update_index(100, &[80, 20]).unwrap();
            }

            let segments = written_segments(&mut writer);
            let offsets: Vec<i8> = segments.iter().flat_map(|s| s.entries.iter().map(|e| e.temporal_offset)).collect();
            let expected: Vec<i8> = expected.iter().map(|o| o.unwrap_or(0)).collect();
            prop_assert_eq!(offsets, expected);
        }
    }
}
