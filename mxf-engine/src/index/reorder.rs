//! Index entries for long-GOP pictures stored in coded order.
//!
//! The temporal offset at display position `p` points at the coded position
//! holding the picture shown at `p`. It only becomes known once that picture
//! has been written, so entries are emitted unresolved and patched as later
//! pictures of the GOP arrive.

use crate::error::{MxfError, Result};
use crate::index::{
    EntryPatch, IndexEntryInfo, FLAG_B_FRAME, FLAG_B_FRAME_BACKWARD, FLAG_OFFSET_OUT_OF_RANGE, FLAG_P_FRAME,
    FLAG_RANDOM_ACCESS, FLAG_SEQUENCE_HEADER,
};
use crate::log::{log_warn, Logger};

const GOP_TABLE_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    I,
    P,
    B,
}

/// Picture properties parsed from the coded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame_type: FrameType,
    /// Display position within the GOP
    pub temporal_reference: u16,
    pub gop_header: bool,
    pub closed_gop: bool,
    pub sequence_header: bool,
}

impl FrameInfo {
    /// I picture opening a closed GOP with a sequence header
    pub fn closed_gop_start() -> Self {
        FrameInfo {
            frame_type: FrameType::I,
            temporal_reference: 0,
            gop_header: true,
            closed_gop: true,
            sequence_header: true,
        }
    }

    pub fn new(frame_type: FrameType, temporal_reference: u16) -> Self {
        FrameInfo {
            frame_type,
            temporal_reference,
            gop_header: false,
            closed_gop: false,
            sequence_header: false,
        }
    }
}

/// Index updates produced for one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorderOutput {
    pub position: i64,
    pub entry: IndexEntryInfo,
    /// Whether the entry's temporal offset is already known
    pub resolved: bool,
    /// Corrections to earlier entries, applied before `entry` is added
    pub patches: Vec<(i64, EntryPatch)>,
}

/// Derives temporal offsets, key frame offsets and flags for one picture track
#[derive(Debug, Clone)]
pub struct TemporalReorder {
    track_index: u32,
    position: i64,
    gop_start: i64,
    offsets: [Option<i8>; GOP_TABLE_LEN],
    gop_flags: Vec<u8>,
    key_position: i64,
    key_temporal_reference: i64,
    prev_key_position: i64,
    current_gop_closed: bool,
    all_closed_gop: bool,
    b_count: u32,
    max_gop: i64,
    logger: Logger,
}

impl TemporalReorder {
    pub fn new(track_index: u32, logger: Logger) -> Self {
        TemporalReorder {
            track_index,
            position: 0,
            gop_start: 0,
            offsets: [None; GOP_TABLE_LEN],
            gop_flags: Vec::new(),
            key_position: 0,
            key_temporal_reference: 0,
            prev_key_position: 0,
            current_gop_closed: false,
            all_closed_gop: true,
            b_count: 0,
            max_gop: 0,
            logger,
        }
    }

    /// Position of the next frame
    pub fn position(&self) -> i64 {
        self.position
    }

    /// Every GOP seen so far was closed
    pub fn all_closed_gop(&self) -> bool {
        self.all_closed_gop
    }

    /// Largest GOP length seen so far, excluding the open last GOP
    pub fn max_gop(&self) -> i64 {
        self.max_gop
    }

    fn error(&self, message: String) -> MxfError {
        MxfError::OutOfSequence {
            track_index: self.track_index,
            message,
        }
    }

    fn to_offset(&self, value: i64) -> Result<i8> {
        i8::try_from(value).map_err(|_| self.error(format!("offset {} at frame {} out of range", value, self.position)))
    }

    /// Process the next frame in coded order
    pub fn process(&mut self, frame: FrameInfo) -> Result<ReorderOutput> {
        let pos = self.position;
        if pos == 0 && frame.frame_type != FrameType::I {
            return Err(self.error("first frame is not an I frame".into()));
        }

        if frame.gop_header {
            if !frame.closed_gop {
                self.all_closed_gop = false;
            }
            self.current_gop_closed = frame.closed_gop;
        }

        if frame.frame_type == FrameType::B {
            self.b_count += 1;
        } else {
            self.b_count = 0;
        }

        let key_frame_offset = if frame.frame_type == FrameType::I {
            0
        } else if !self.current_gop_closed && self.key_position + self.key_temporal_reference >= pos {
            self.to_offset(self.prev_key_position - pos)?
        } else {
            self.to_offset(self.key_position - pos)?
        };

        let mut patches = Vec::new();
        if frame.gop_header {
            if pos > 0 {
                self.max_gop = self.max_gop.max(pos - self.gop_start);
            }
            patches.extend(self.incomplete_patches());
            self.gop_start = pos;
            self.offsets = [None; GOP_TABLE_LEN];
            self.gop_flags.clear();
        }

        let gop_offset = pos - self.gop_start;
        let tr = frame.temporal_reference as i64;
        if gop_offset >= GOP_TABLE_LEN as i64 || tr >= GOP_TABLE_LEN as i64 {
            return Err(self.error(format!("GOP at frame {} exceeds {} frames", pos, GOP_TABLE_LEN)));
        }
        self.offsets[tr as usize] = Some(self.to_offset(gop_offset - tr)?);

        let temporal_offset = self.offsets[gop_offset as usize];

        if tr < gop_offset {
            if let Some(prev_offset) = self.offsets[tr as usize] {
                let patch_position = pos - prev_offset as i64;
                if prev_offset as i64 <= pos {
                    patches.push((patch_position, EntryPatch::temporal_offset(prev_offset)));
                } else {
                    log_warn!(
                        self.logger,
                        track = self.track_index,
                        position = pos,
                        "temporal offset refers to an entry before the start"
                    );
                }
            }
        }

        let mut flags = 0u8;
        if frame.sequence_header {
            flags |= FLAG_SEQUENCE_HEADER;
        }
        match frame.frame_type {
            FrameType::I => {
                if frame.sequence_header && frame.gop_header && frame.closed_gop {
                    flags |= FLAG_RANDOM_ACCESS;
                }
            }
            FrameType::P => flags |= FLAG_P_FRAME,
            FrameType::B => {
                if self.current_gop_closed && tr + 1 == self.b_count as i64 {
                    flags |= FLAG_B_FRAME_BACKWARD;
                } else {
                    flags |= FLAG_B_FRAME;
                }
            }
        }
        if key_frame_offset as i64 + pos < 0 || temporal_offset.map_or(false, |to| to as i64 + pos < 0) {
            flags |= FLAG_OFFSET_OUT_OF_RANGE;
        }

        if frame.frame_type == FrameType::I {
            self.prev_key_position = self.key_position;
            self.key_position = pos;
            self.key_temporal_reference = tr;
        }

        self.gop_flags.push(flags);
        self.position += 1;

        Ok(ReorderOutput {
            position: pos,
            entry: IndexEntryInfo {
                temporal_offset: temporal_offset.unwrap_or(0),
                key_frame_offset,
                flags,
                can_start_partition: frame.gop_header,
            },
            resolved: temporal_offset.is_some(),
            patches,
        })
    }

    // entries of the current GOP whose displayed picture never arrived
    fn incomplete_patches(&self) -> Vec<(i64, EntryPatch)> {
        let len = (self.position - self.gop_start) as usize;
        let patches: Vec<(i64, EntryPatch)> = (0..len)
            .filter(|&i| self.offsets[i].is_none())
            .map(|i| {
                let flags = self.gop_flags.get(i).copied().unwrap_or(0);
                let patch = EntryPatch::temporal_offset(0)
                    .with_flags((flags | FLAG_OFFSET_OUT_OF_RANGE) & !FLAG_RANDOM_ACCESS);
                (self.gop_start + i as i64, patch)
            })
            .collect();
        if !patches.is_empty() {
            log_warn!(
                self.logger,
                track = self.track_index,
                gop_start = self.gop_start,
                missing = patches.len(),
                "incomplete temporal offsets in GOP"
            );
        }
        patches
    }

    /// Resolve every entry still missing a temporal offset at the end of the stream
    pub fn finish(&mut self) -> Vec<(i64, EntryPatch)> {
        let patches = self.incomplete_patches();
        for (position, _) in &patches {
            self.offsets[(position - self.gop_start) as usize] = Some(0);
        }
        patches
    }
}
