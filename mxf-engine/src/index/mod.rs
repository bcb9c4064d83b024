//! Index table model.
//!
//! [`IndexTableWriter`] builds CBE or VBE segments while a body stream is
//! written, [`IndexTableReader`] resolves edit units from parsed segments and
//! [`TemporalReorder`] derives entries for long-GOP pictures written in
//! coded order.

mod reader;
mod reorder;
mod segment;
mod writer;

pub use reader::{EditUnit, EditUnitLookup, IndexTableReader};
pub use reorder::{FrameInfo, FrameType, ReorderOutput, TemporalReorder};
pub use segment::{DeltaEntry, IndexEntry, IndexTableSegment, MAX_INDEX_SEGMENT_SIZE};
pub use writer::{IndexTableWriter, MAX_CACHE_ENTRIES};

/// Edit unit is a random access point
pub const FLAG_RANDOM_ACCESS: u8 = 0x80;
/// Edit unit carries a sequence header
pub const FLAG_SEQUENCE_HEADER: u8 = 0x40;
/// Forward predicted picture
pub const FLAG_P_FRAME: u8 = 0x22;
/// Bidirectionally predicted picture
pub const FLAG_B_FRAME: u8 = 0x33;
/// B picture predicted only from the following anchor of a closed GOP
pub const FLAG_B_FRAME_BACKWARD: u8 = 0x13;
/// Temporal or key frame offset points before the start of the stream
pub const FLAG_OFFSET_OUT_OF_RANGE: u8 = 0x0b;

/// Index entry values supplied with a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntryInfo {
    pub temporal_offset: i8,
    pub key_frame_offset: i8,
    pub flags: u8,
    /// A partition may start before this edit unit
    pub can_start_partition: bool,
}

impl IndexEntryInfo {
    /// Entry for a self-contained random access unit
    pub fn random_access() -> Self {
        IndexEntryInfo {
            flags: FLAG_RANDOM_ACCESS,
            ..Default::default()
        }
    }
}

impl Default for IndexEntryInfo {
    fn default() -> Self {
        IndexEntryInfo {
            temporal_offset: 0,
            key_frame_offset: 0,
            flags: 0,
            can_start_partition: true,
        }
    }
}

/// Correction applied to an entry written earlier.
///
/// Fields left `None` keep their current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryPatch {
    pub temporal_offset: Option<i8>,
    pub key_frame_offset: Option<i8>,
    pub flags: Option<u8>,
}

impl EntryPatch {
    pub fn temporal_offset(offset: i8) -> Self {
        EntryPatch {
            temporal_offset: Some(offset),
            ..Default::default()
        }
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = Some(flags);
        self
    }

    pub(crate) fn apply(&self, temporal_offset: &mut i8, key_frame_offset: &mut i8, flags: &mut u8) {
        if let Some(to) = self.temporal_offset {
            *temporal_offset = to;
        }
        if let Some(kfo) = self.key_frame_offset {
            *key_frame_offset = kfo;
        }
        if let Some(f) = self.flags {
            *flags = f;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_patch() {
        let (mut to, mut kfo, mut flags) = (0i8, -3i8, FLAG_B_FRAME);
        EntryPatch::temporal_offset(-1)
            .with_flags(FLAG_B_FRAME | FLAG_OFFSET_OUT_OF_RANGE)
            .apply(&mut to, &mut kfo, &mut flags);
        assert_eq!((to, kfo, flags), (-1, -3, 0x3b));
    }
}
