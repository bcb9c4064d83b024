//! Read-side index table: resolves edit units to body stream offsets.

use crate::error::{MxfError, Result};
use crate::index::segment::IndexTableSegment;
use crate::index::FLAG_RANDOM_ACCESS;
use crate::log::{log_debug, log_warn, Logger};

/// Resolved edit unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditUnit {
    pub position: i64,
    /// Offset of the content package in the body stream
    pub offset: u64,
    /// Content package size, 0 when unknown
    pub size: u64,
    pub temporal_offset: i8,
    pub key_frame_offset: i8,
    pub flags: u8,
    pub slice_offsets: Vec<u32>,
}

impl EditUnit {
    pub fn is_random_access(&self) -> bool {
        self.flags & FLAG_RANDOM_ACCESS != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditUnitLookup {
    Found(EditUnit),
    /// Position precedes the first indexed edit unit
    Before,
    /// Position follows the last indexed edit unit
    After,
}

#[derive(Debug, Clone)]
struct ReaderSegment {
    segment: IndexTableSegment,
    // body stream offset of the first CBE edit unit
    essence_start: u64,
}

impl ReaderSegment {
    fn essence_end(&self) -> u64 {
        self.essence_start + self.segment.edit_unit_byte_count as u64 * self.segment.duration.max(0) as u64
    }

    fn is_open_ended(&self) -> bool {
        self.segment.is_cbe() && self.segment.duration == 0
    }
}

/// Index table of one body stream assembled from its segments
#[derive(Debug, Clone)]
pub struct IndexTableReader {
    index_sid: u32,
    segments: Vec<ReaderSegment>,
    is_cbe: bool,
    essence_data_size: Option<u64>,
    logger: Logger,
}

impl IndexTableReader {
    pub fn new(index_sid: u32, logger: Logger) -> Self {
        IndexTableReader {
            index_sid,
            segments: Vec::new(),
            is_cbe: false,
            essence_data_size: None,
            logger,
        }
    }

    /// Build a table from segments in stream order
    pub fn from_segments<I>(index_sid: u32, segments: I, logger: Logger) -> Result<Self>
    where
        I: IntoIterator<Item = IndexTableSegment>,
    {
        let mut reader = IndexTableReader::new(index_sid, logger);
        for segment in segments {
            reader.add_segment(segment)?;
        }
        Ok(reader)
    }

    /// Add a segment.
    ///
    /// A segment starting at or before an existing one replaces it and every
    /// later segment; repeated segments in a later partition carry the more
    /// complete data.
    pub fn add_segment(&mut self, segment: IndexTableSegment) -> Result<()> {
        if segment.index_sid != self.index_sid {
            return Err(MxfError::InvalidIndexSegment(format!(
                "segment index SID {} added to index table {}",
                segment.index_sid, self.index_sid
            )));
        }
        if segment.start_position < 0 {
            return Err(MxfError::InvalidIndexSegment(format!(
                "negative segment start position {}",
                segment.start_position
            )));
        }

        if self.segments.is_empty() {
            self.is_cbe = segment.is_cbe();
        } else if self.is_cbe != segment.is_cbe() {
            return Err(MxfError::InvalidIndexSegment(
                "mixed CBE and VBE index table segments".into(),
            ));
        }

        if let Some(i) = self
            .segments
            .iter()
            .position(|s| s.segment.start_position >= segment.start_position)
        {
            if self.segments[i].segment.start_position != segment.start_position {
                return Err(MxfError::InvalidIndexSegment(format!(
                    "segment start {} overlaps segment starting at {}",
                    segment.start_position, self.segments[i].segment.start_position
                )));
            }
            log_debug!(
                self.logger,
                start = segment.start_position,
                dropped = self.segments.len() - i,
                "replacing index table segments"
            );
            self.segments.truncate(i);
        } else if let Some(last) = self.segments.last() {
            if last.is_open_ended() || last.segment.end_position() != segment.start_position {
                return Err(MxfError::InvalidIndexSegment(format!(
                    "segment start {} does not follow previous segment end {}",
                    segment.start_position,
                    last.segment.end_position()
                )));
            }
        }

        let essence_start = self.segments.last().map_or(0, |s| s.essence_end());
        self.segments.push(ReaderSegment { segment, essence_start });
        Ok(())
    }

    /// Record the size of the essence in the body stream; completes an
    /// open-ended CBE segment.
    pub fn set_essence_data_size(&mut self, size: u64) {
        self.essence_data_size = Some(size);
        if let Some(last) = self.segments.last_mut() {
            if last.is_open_ended() && last.segment.edit_unit_byte_count > 0 {
                let available = size.saturating_sub(last.essence_start);
                last.segment.duration = (available / last.segment.edit_unit_byte_count as u64) as i64;
                log_debug!(self.logger, duration = last.segment.duration, "completed CBE index duration");
            }
        }
    }

    pub fn index_sid(&self) -> u32 {
        self.index_sid
    }

    pub fn is_cbe(&self) -> bool {
        self.is_cbe
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn edit_unit_byte_count(&self) -> u32 {
        self.segments.first().map_or(0, |s| s.segment.edit_unit_byte_count)
    }

    pub fn start_position(&self) -> i64 {
        self.segments.first().map_or(0, |s| s.segment.start_position)
    }

    /// Indexed duration, counted from position 0
    pub fn duration(&self) -> i64 {
        self.segments.last().map_or(0, |s| s.segment.end_position())
    }

    /// Look up the edit unit at `position`
    pub fn get_edit_unit(&self, position: i64) -> EditUnitLookup {
        let first = match self.segments.first() {
            Some(first) => first,
            None => return EditUnitLookup::After,
        };
        if position < first.segment.start_position {
            return EditUnitLookup::Before;
        }

        let i = self
            .segments
            .partition_point(|s| s.segment.start_position <= position)
            - 1;
        let current = &self.segments[i];
        if !current.is_open_ended() && position >= current.segment.end_position() {
            return EditUnitLookup::After;
        }
        let rel = position - current.segment.start_position;

        if current.segment.is_cbe() {
            let eubc = current.segment.edit_unit_byte_count as u64;
            let offset = current.essence_start + rel as u64 * eubc;
            let size = match self.essence_data_size {
                Some(total) if total <= offset => return EditUnitLookup::After,
                Some(total) => (total - offset).min(eubc),
                None => eubc,
            };
            return EditUnitLookup::Found(EditUnit {
                position,
                offset,
                size,
                temporal_offset: 0,
                key_frame_offset: 0,
                flags: FLAG_RANDOM_ACCESS,
                slice_offsets: Vec::new(),
            });
        }

        let entry = &current.segment.entries[rel as usize];
        let next_offset = current
            .segment
            .entries
            .get(rel as usize + 1)
            .or_else(|| self.segments.get(i + 1).and_then(|s| s.segment.entries.first()))
            .map(|e| e.stream_offset)
            .or(self.essence_data_size);
        let size = next_offset.map_or(0, |next| next.saturating_sub(entry.stream_offset));

        EditUnitLookup::Found(EditUnit {
            position,
            offset: entry.stream_offset,
            size,
            temporal_offset: entry.temporal_offset,
            key_frame_offset: entry.key_frame_offset,
            flags: entry.flags,
            slice_offsets: entry.slice_offsets.clone(),
        })
    }

    fn found(&self, position: i64) -> Option<EditUnit> {
        match self.get_edit_unit(position) {
            EditUnitLookup::Found(unit) => Some(unit),
            _ => None,
        }
    }

    /// Number of edit units before `position` (as a negative value) that
    /// must be decoded to present it
    pub fn get_precharge(&self, position: i64) -> i64 {
        if position < 0 || position >= self.duration() {
            return 0;
        }
        let unit = match self.found(position) {
            Some(unit) => unit,
            None => return 0,
        };

        let mut precharge = if unit.temporal_offset != 0 {
            match self.found(position + unit.temporal_offset as i64) {
                Some(displayed) => unit.temporal_offset as i64 + displayed.key_frame_offset as i64,
                None => unit.temporal_offset as i64,
            }
        } else {
            unit.key_frame_offset as i64
        };

        if precharge > 0 {
            log_warn!(self.logger, position, precharge, "ignoring positive precharge");
            precharge = 0;
        }
        (position + precharge).max(0) - position
    }

    /// Number of edit units after `position` that must be read to present it
    pub fn get_rollout(&self, position: i64) -> i64 {
        let duration = self.duration();
        if position < 0 || position >= duration {
            return 0;
        }
        let rollout = match self.found(position) {
            Some(unit) if unit.temporal_offset > 0 => unit.temporal_offset as i64,
            _ => 0,
        };
        (position + rollout).min(duration - 1) - position
    }
}
