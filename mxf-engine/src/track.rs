//! Track registrations and generic container element keys

use crate::error::{MxfError, Result};
use crate::sequence::{sample_sequence, SampleSequence};
use crate::types::Rational;
use crate::ul::{labels, UniversalLabel};

/// Essence item a track's elements belong to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TrackKind {
    /// Picture item
    Picture,
    /// Sound item
    Sound,
    /// Data item
    Data,
}

impl TrackKind {
    /// Generic container item type (byte 12 of the element key)
    pub fn item_type(&self) -> u8 {
        match self {
            TrackKind::Picture => 0x15,
            TrackKind::Sound => 0x16,
            TrackKind::Data => 0x17,
        }
    }

    /// Kind for a generic container item type
    pub fn from_item_type(item_type: u8) -> Option<Self> {
        match item_type {
            0x15 => Some(TrackKind::Picture),
            0x16 => Some(TrackKind::Sound),
            0x17 => Some(TrackKind::Data),
            _ => None,
        }
    }

    /// Position of the item within a content package
    pub(crate) fn emission_rank(&self) -> u8 {
        match self {
            TrackKind::Picture => 0,
            TrackKind::Sound => 1,
            TrackKind::Data => 2,
        }
    }
}

/// A track's participation in the interleave
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrackRegistration {
    pub track_index: u32,
    pub kind: TrackKind,
    /// Element type (byte 14 of the element key)
    pub element_type: u8,
    /// Size of one sample when constant (a frame for pictures, a block for sound)
    pub fixed_sample_size: Option<u32>,
    /// Samples per edit unit
    pub sample_sequence: Vec<u32>,
    /// Pictures are stored in coded order and need temporal offsets
    pub temporal_reordering: bool,
    pub essence_container: UniversalLabel,
    /// Element key, assigned once every track is registered
    pub element_key: UniversalLabel,
}

impl TrackRegistration {
    /// Variable-size picture track, one frame per edit unit
    pub fn picture(track_index: u32, element_type: u8, essence_container: UniversalLabel) -> Self {
        TrackRegistration {
            track_index,
            kind: TrackKind::Picture,
            element_type,
            fixed_sample_size: None,
            sample_sequence: vec![1],
            temporal_reordering: false,
            essence_container,
            element_key: UniversalLabel::default(),
        }
    }

    /// Sound track with `block_align` bytes per sample
    pub fn sound(
        track_index: u32,
        block_align: u32,
        edit_rate: Rational,
        sampling_rate: Rational,
    ) -> Result<Self> {
        if block_align == 0 {
            return Err(MxfError::InvalidConfig(format!(
                "sound track {} has a zero block align",
                track_index
            )));
        }
        Ok(TrackRegistration {
            track_index,
            kind: TrackKind::Sound,
            element_type: 0x01,
            fixed_sample_size: Some(block_align),
            sample_sequence: sample_sequence(edit_rate, sampling_rate)?,
            temporal_reordering: false,
            essence_container: labels::ESSENCE_BWF_FRAME,
            element_key: UniversalLabel::default(),
        })
    }

    /// Variable-size data track, one element per edit unit
    pub fn data(track_index: u32, element_type: u8, essence_container: UniversalLabel) -> Self {
        TrackRegistration {
            track_index,
            kind: TrackKind::Data,
            element_type,
            fixed_sample_size: None,
            sample_sequence: vec![1],
            temporal_reordering: false,
            essence_container,
            element_key: UniversalLabel::default(),
        }
    }

    /// Mark every sample as `size` bytes
    pub fn with_fixed_size(mut self, size: u32) -> Self {
        self.fixed_sample_size = Some(size);
        self
    }

    pub fn with_temporal_reordering(mut self) -> Self {
        self.temporal_reordering = true;
        self
    }

    pub fn is_fixed_size(&self) -> bool {
        self.fixed_sample_size.is_some()
    }

    pub fn sequence(&self) -> SampleSequence {
        SampleSequence::new(self.sample_sequence.clone())
    }

    /// Number of samples expected at `position`
    pub fn samples_at(&self, position: u64) -> u32 {
        self.sequence().count_at(position)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.sample_sequence.is_empty() || self.sample_sequence.contains(&0) {
            return Err(MxfError::InvalidConfig(format!(
                "track {} has an empty sample sequence",
                self.track_index
            )));
        }
        if self.temporal_reordering && self.kind != TrackKind::Picture {
            return Err(MxfError::InvalidConfig(format!(
                "track {}: only picture tracks can be temporally reordered",
                self.track_index
            )));
        }
        if self.fixed_sample_size == Some(0) {
            return Err(MxfError::InvalidConfig(format!(
                "track {} has a zero fixed sample size",
                self.track_index
            )));
        }
        Ok(())
    }
}

/// Generic container element key
pub fn element_key(kind: TrackKind, count: u8, element_type: u8, number: u8) -> UniversalLabel {
    let mut key = [0u8; 16];
    key[..12].copy_from_slice(&labels::GC_ELEMENT_PREFIX[..12]);
    key[12] = kind.item_type();
    key[13] = count;
    key[14] = element_type;
    key[15] = number;
    UniversalLabel(key)
}

/// Sort tracks into content package order: picture, sound, data, keeping
/// registration order within a kind.
pub fn sort_for_emission(tracks: &mut [TrackRegistration]) {
    tracks.sort_by_key(|t| t.kind.emission_rank());
}

/// Assign element keys to tracks that do not carry one yet.
///
/// The element count and 1-based number are taken per item kind.
pub fn assign_element_keys(tracks: &mut [TrackRegistration]) -> Result<()> {
    for kind in [TrackKind::Picture, TrackKind::Sound, TrackKind::Data] {
        let count = tracks.iter().filter(|t| t.kind == kind).count();
        let count = u8::try_from(count)
            .map_err(|_| MxfError::InvalidConfig(format!("{} {:?} tracks exceed 255", count, kind)))?;
        let mut number = 0u8;
        for track in tracks.iter_mut().filter(|t| t.kind == kind) {
            number += 1;
            if track.element_key == UniversalLabel::default() {
                track.element_key = element_key(kind, count, track.element_type, number);
            }
        }
    }
    Ok(())
}
