//! Universal Label (UL) keys
//!
//! Every KLV in an MXF file starts with a 16-byte SMPTE Universal Label.
//! Byte 7 carries the registry version, which readers ignore when matching
//! (see [`UniversalLabel::eq_mod_regver`]).

use std::fmt;

/// A 16-byte Universal Label
pub type UL = [u8; 16];

/// Universal Label wrapper with helper methods
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UniversalLabel(pub UL);

impl UniversalLabel {
    /// Create from raw bytes
    pub const fn new(bytes: UL) -> Self {
        UniversalLabel(bytes)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &UL {
        &self.0
    }

    /// Check if this is a SMPTE-registered label (starts with 06 0E 2B 34)
    pub fn is_smpte(&self) -> bool {
        self.0[0..4] == labels::SMPTE_PREFIX
    }

    /// Equality ignoring the registry version byte.
    pub fn eq_mod_regver(&self, other: &UniversalLabel) -> bool {
        self.0[0..7] == other.0[0..7] && self.0[8..16] == other.0[8..16]
    }

    /// Compare the first `len` bytes, ignoring the registry version byte.
    pub fn prefix_eq_mod_regver(&self, other: &UL, len: usize) -> bool {
        let len = len.min(16);
        if len <= 7 {
            return self.0[..len] == other[..len];
        }
        self.0[0..7] == other[0..7] && self.0[8..len] == other[8..len]
    }

    /// Partition pack of any kind (header, body or footer)
    pub fn is_partition_pack(&self) -> bool {
        self.0[0..13] == labels::PARTITION_PACK_PREFIX[0..13] && (0x02..=0x04).contains(&self.0[13])
    }

    /// Header partition pack
    pub fn is_header_partition_pack(&self) -> bool {
        self.is_partition_pack() && self.0[13] == 0x02
    }

    /// Body partition pack (including generic stream partitions)
    pub fn is_body_partition_pack(&self) -> bool {
        self.is_partition_pack() && self.0[13] == 0x03
    }

    /// Generic stream partition pack
    pub fn is_generic_stream_partition_pack(&self) -> bool {
        self.is_body_partition_pack() && self.0[14] == 0x11
    }

    /// Footer partition pack
    pub fn is_footer_partition_pack(&self) -> bool {
        self.is_partition_pack() && self.0[13] == 0x04
    }

    /// Closed partition pack
    pub fn is_closed_partition(&self) -> bool {
        self.is_partition_pack() && (self.0[14] == 0x02 || self.0[14] == 0x04)
    }

    /// Complete partition pack
    pub fn is_complete_partition(&self) -> bool {
        self.is_partition_pack() && (self.0[14] == 0x03 || self.0[14] == 0x04)
    }

    /// KLV fill item
    pub fn is_filler(&self) -> bool {
        self.eq_mod_regver(&labels::FILL_ITEM) || self.eq_mod_regver(&labels::FILL_ITEM_V1)
    }

    /// Index table segment
    pub fn is_index_table_segment(&self) -> bool {
        self.eq_mod_regver(&labels::INDEX_TABLE_SEGMENT)
    }

    /// Random index pack
    pub fn is_random_index_pack(&self) -> bool {
        self.eq_mod_regver(&labels::RANDOM_INDEX_PACK)
    }

    /// Primer pack
    pub fn is_primer_pack(&self) -> bool {
        self.eq_mod_regver(&labels::PRIMER_PACK)
    }

    /// Primer pack or a header metadata set
    pub fn is_header_metadata(&self) -> bool {
        self.is_primer_pack()
            || (self.is_smpte() && self.0[4] == 0x02 && self.0[8..12] == [0x0D, 0x01, 0x01, 0x01])
    }

    /// Generic container essence element
    pub fn is_gc_essence_element(&self) -> bool {
        self.prefix_eq_mod_regver(&labels::GC_ELEMENT_PREFIX, 12)
            && matches!(self.0[12], 0x15 | 0x16 | 0x17 | 0x18)
    }

    /// Generic container system item
    pub fn is_gc_system_item(&self) -> bool {
        self.prefix_eq_mod_regver(&labels::GC_ELEMENT_PREFIX, 12) && matches!(self.0[12], 0x04 | 0x14)
    }

    /// The 4-byte track number carried in the last bytes of an essence key.
    pub fn track_number(&self) -> u32 {
        u32::from_be_bytes([self.0[12], self.0[13], self.0[14], self.0[15]])
    }

    /// Get kind description
    pub fn kind(&self) -> LabelKind {
        if self.is_partition_pack() {
            LabelKind::PartitionPack
        } else if self.is_primer_pack() {
            LabelKind::PrimerPack
        } else if self.is_filler() {
            LabelKind::FillItem
        } else if self.is_index_table_segment() {
            LabelKind::IndexTable
        } else if self.is_random_index_pack() {
            LabelKind::RandomIndexPack
        } else if self.is_gc_essence_element() || self.is_gc_system_item() {
            LabelKind::EssenceElement
        } else if self.is_header_metadata() {
            LabelKind::MetadataSet
        } else {
            LabelKind::Unknown
        }
    }
}

impl fmt::Debug for UniversalLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UL(")?;
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for UniversalLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            LabelKind::Unknown => write!(f, "{:?}", self),
            LabelKind::EssenceElement => write!(f, "Essence Element {:08x}", self.track_number()),
            _ => write!(f, "{}", labels::lookup_name(&self.0)),
        }
    }
}

impl From<UL> for UniversalLabel {
    fn from(bytes: UL) -> Self {
        UniversalLabel(bytes)
    }
}

impl From<&[u8; 16]> for UniversalLabel {
    fn from(bytes: &[u8; 16]) -> Self {
        UniversalLabel(*bytes)
    }
}

impl PartialEq<UL> for UniversalLabel {
    fn eq(&self, other: &UL) -> bool {
        &self.0 == other
    }
}

/// Kind of Universal Label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelKind {
    /// Partition pack
    PartitionPack,
    /// Primer pack
    PrimerPack,
    /// Fill item (KLV fill)
    FillItem,
    /// Index table segment
    IndexTable,
    /// Random index pack
    RandomIndexPack,
    /// Essence element or system item
    EssenceElement,
    /// Header metadata set
    MetadataSet,
    /// Unknown
    Unknown,
}

/// Well-known Universal Labels
pub mod labels {
    use super::{UniversalLabel, UL};

    /// SMPTE Label prefix
    pub const SMPTE_PREFIX: [u8; 4] = [0x06, 0x0E, 0x2B, 0x34];

    /// Partition pack prefix; bytes 13 and 14 select kind and status
    pub const PARTITION_PACK_PREFIX: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x05, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x00, 0x00,
        0x00,
    ];

    /// Primer pack
    pub const PRIMER_PACK: UniversalLabel = UniversalLabel::new([
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x05, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x05, 0x01,
        0x00,
    ]);

    /// KLV fill item
    pub const FILL_ITEM: UniversalLabel = UniversalLabel::new([
        0x06, 0x0E, 0x2B, 0x34, 0x01, 0x01, 0x01, 0x02, 0x03, 0x01, 0x02, 0x10, 0x01, 0x00, 0x00,
        0x00,
    ]);

    /// Legacy fill item key written by some older encoders
    pub const FILL_ITEM_V1: UniversalLabel = UniversalLabel::new([
        0x06, 0x0E, 0x2B, 0x34, 0x01, 0x01, 0x01, 0x01, 0x03, 0x01, 0x02, 0x10, 0x01, 0x00, 0x00,
        0x00,
    ]);

    /// Index table segment
    pub const INDEX_TABLE_SEGMENT: UniversalLabel = UniversalLabel::new([
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x53, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x10, 0x01,
        0x00,
    ]);

    /// Random index pack
    pub const RANDOM_INDEX_PACK: UniversalLabel = UniversalLabel::new([
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x05, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x11, 0x01,
        0x00,
    ]);

    /// Generic container element key prefix (first 12 bytes)
    pub const GC_ELEMENT_PREFIX: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x01, 0x02, 0x01, 0x01, 0x0D, 0x01, 0x03, 0x01, 0x00, 0x00, 0x00,
        0x00,
    ];

    // Header metadata sets

    /// Preface (root of metadata tree)
    pub const PREFACE: UniversalLabel = UniversalLabel::new([
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x53, 0x01, 0x01, 0x0D, 0x01, 0x01, 0x01, 0x01, 0x01, 0x2F,
        0x00,
    ]);

    /// Content storage
    pub const CONTENT_STORAGE: UniversalLabel = UniversalLabel::new([
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x53, 0x01, 0x01, 0x0D, 0x01, 0x01, 0x01, 0x01, 0x01, 0x18,
        0x00,
    ]);

    /// Material package
    pub const MATERIAL_PACKAGE: UniversalLabel = UniversalLabel::new([
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x53, 0x01, 0x01, 0x0D, 0x01, 0x01, 0x01, 0x01, 0x01, 0x36,
        0x00,
    ]);

    /// Source package
    pub const SOURCE_PACKAGE: UniversalLabel = UniversalLabel::new([
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x53, 0x01, 0x01, 0x0D, 0x01, 0x01, 0x01, 0x01, 0x01, 0x37,
        0x00,
    ]);

    /// Timeline track
    pub const TIMELINE_TRACK: UniversalLabel = UniversalLabel::new([
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x53, 0x01, 0x01, 0x0D, 0x01, 0x01, 0x01, 0x01, 0x01, 0x3B,
        0x00,
    ]);

    /// Sequence
    pub const SEQUENCE: UniversalLabel = UniversalLabel::new([
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x53, 0x01, 0x01, 0x0D, 0x01, 0x01, 0x01, 0x01, 0x01, 0x0F,
        0x00,
    ]);

    // Data definitions

    pub const DATA_DEF_PICTURE: UniversalLabel = UniversalLabel::new([
        0x06, 0x0E, 0x2B, 0x34, 0x04, 0x01, 0x01, 0x01, 0x01, 0x03, 0x02, 0x02, 0x01, 0x00, 0x00,
        0x00,
    ]);

    pub const DATA_DEF_SOUND: UniversalLabel = UniversalLabel::new([
        0x06, 0x0E, 0x2B, 0x34, 0x04, 0x01, 0x01, 0x01, 0x01, 0x03, 0x02, 0x02, 0x02, 0x00, 0x00,
        0x00,
    ]);

    pub const DATA_DEF_DATA: UniversalLabel = UniversalLabel::new([
        0x06, 0x0E, 0x2B, 0x34, 0x04, 0x01, 0x01, 0x01, 0x01, 0x03, 0x02, 0x02, 0x03, 0x00, 0x00,
        0x00,
    ]);

    // Operational patterns and essence containers

    /// OP1a, multi-track, stream file, internal essence
    pub const OP1A_MULTI_TRACK: UniversalLabel = UniversalLabel::new([
        0x06, 0x0E, 0x2B, 0x34, 0x04, 0x01, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x01, 0x09,
        0x00,
    ]);

    /// Multiple wrappings essence container (more than one track)
    pub const ESSENCE_MULTIPLE_WRAPPINGS: UniversalLabel = UniversalLabel::new([
        0x06, 0x0E, 0x2B, 0x34, 0x04, 0x01, 0x01, 0x03, 0x0D, 0x01, 0x03, 0x01, 0x02, 0x7F, 0x01,
        0x00,
    ]);

    /// MPEG-2 long GOP, frame wrapped
    pub const ESSENCE_MPEG2_FRAME: UniversalLabel = UniversalLabel::new([
        0x06, 0x0E, 0x2B, 0x34, 0x04, 0x01, 0x01, 0x02, 0x0D, 0x01, 0x03, 0x01, 0x02, 0x04, 0x60,
        0x01,
    ]);

    /// Uncompressed picture, frame wrapped
    pub const ESSENCE_UNCOMPRESSED_FRAME: UniversalLabel = UniversalLabel::new([
        0x06, 0x0E, 0x2B, 0x34, 0x04, 0x01, 0x01, 0x01, 0x0D, 0x01, 0x03, 0x01, 0x02, 0x05, 0x7F,
        0x01,
    ]);

    /// BWF PCM audio, frame wrapped
    pub const ESSENCE_BWF_FRAME: UniversalLabel = UniversalLabel::new([
        0x06, 0x0E, 0x2B, 0x34, 0x04, 0x01, 0x01, 0x01, 0x0D, 0x01, 0x03, 0x01, 0x02, 0x06, 0x01,
        0x00,
    ]);

    /// ANC data, frame wrapped
    pub const ESSENCE_ANC_FRAME: UniversalLabel = UniversalLabel::new([
        0x06, 0x0E, 0x2B, 0x34, 0x04, 0x01, 0x01, 0x09, 0x0D, 0x01, 0x03, 0x01, 0x02, 0x0E, 0x00,
        0x00,
    ]);

    /// Lookup human-readable name for a UL
    pub fn lookup_name(ul: &UL) -> &'static str {
        let label = UniversalLabel(*ul);

        // Primer pack shares its first 13 bytes with the partition packs
        if label.is_primer_pack() {
            return "Primer Pack";
        }

        if label.is_partition_pack() {
            return match ul[13..15] {
                [0x02, 0x01] => "Header Partition (Open Incomplete)",
                [0x02, 0x02] => "Header Partition (Closed Incomplete)",
                [0x02, 0x03] => "Header Partition (Open Complete)",
                [0x02, 0x04] => "Header Partition (Closed Complete)",
                [0x03, 0x01] => "Body Partition (Open Incomplete)",
                [0x03, 0x02] => "Body Partition (Closed Incomplete)",
                [0x03, 0x03] => "Body Partition (Open Complete)",
                [0x03, 0x04] => "Body Partition (Closed Complete)",
                [0x03, 0x11] => "Generic Stream Partition",
                [0x04, 0x02] => "Footer Partition (Closed Incomplete)",
                [0x04, 0x04] => "Footer Partition (Closed Complete)",
                _ => "Partition Pack (Unknown)",
            };
        }

        if label.is_filler() {
            return "Fill Item";
        }
        if label.is_index_table_segment() {
            return "Index Table Segment";
        }
        if label.is_random_index_pack() {
            return "Random Index Pack";
        }
        if label.eq_mod_regver(&PREFACE) {
            return "Preface";
        }
        if label.eq_mod_regver(&CONTENT_STORAGE) {
            return "Content Storage";
        }
        if label.eq_mod_regver(&MATERIAL_PACKAGE) {
            return "Material Package";
        }
        if label.eq_mod_regver(&SOURCE_PACKAGE) {
            return "Source Package";
        }
        if label.is_gc_essence_element() {
            return "Essence Element";
        }
        if label.is_gc_system_item() {
            return "System Item";
        }
        if label.is_header_metadata() {
            return "Metadata Set";
        }

        "Unknown"
    }
}
