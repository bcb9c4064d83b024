//! MXF (Material eXchange Format) mux/demux engine
//!
//! Writes and reads OP1a files: KLV coded partitions, interleaved content
//! packages of picture, sound and data elements, and the index table that
//! maps edit units to byte offsets.
//!
//! # Features
//!
//! - KLV coding with BER lengths
//! - Header, body and footer partitions with a random index pack
//! - CBE and VBE index tables, including entries patched after the fact for
//!   temporally reordered pictures
//! - Content package assembly with per-track sample sequences
//! - Demuxing with RIP, footer chain and forward scan recovery, and seeking
//!   with precharge and rollout
//!
//! # Example
//!
//! ```no_run
//! use std::io::Cursor;
//! use mxf_engine::{
//!     labels, DemuxerConfig, Logger, MinimalHeaderMetadata, MxfDemuxer, MxfWriter, Rational,
//!     SeekMode, TrackRegistration, WriterConfig,
//! };
//!
//! # fn main() -> mxf_engine::Result<()> {
//! let logger = Logger::current();
//! let mut writer = MxfWriter::new(Cursor::new(Vec::new()), WriterConfig::default(), logger.clone())?;
//! writer.register_track(TrackRegistration::picture(0, 0x05, labels::ESSENCE_MPEG2_FRAME))?;
//! writer.register_track(TrackRegistration::sound(1, 4, Rational::fps_25(), Rational::hz_48000())?)?;
//! writer.prepare_write(Box::new(MinimalHeaderMetadata::default()))?;
//! for _ in 0..25 {
//!     writer.write_sample(0, &[0u8; 4096])?;
//!     writer.write_samples(1, &[0u8; 1920 * 4], 1920)?;
//! }
//! writer.complete_write()?;
//!
//! let mut demuxer = MxfDemuxer::open(writer.into_inner(), DemuxerConfig::default(), logger)?;
//! demuxer.discover_tracks()?;
//! demuxer.seek(10, SeekMode::Exact)?;
//! while let Some(package) = demuxer.read_content_package()? {
//!     println!("edit unit {}: {} elements", package.position, package.frames.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod demuxer;
pub mod error;
pub mod index;
pub mod klv;
pub mod log;
pub mod metadata;
pub mod partition;
pub mod sequence;
pub mod stream;
pub mod track;
pub mod types;
pub mod ul;
pub mod writer;

pub use demuxer::{
    ContentPackage, DemuxerConfig, MxfDemuxer, PartitionSource, SeekMode, SeekResult, TrackFrame,
};
pub use error::{MxfError, Result};
pub use index::{
    EditUnit, EditUnitLookup, EntryPatch, FrameInfo, FrameType, IndexEntryInfo, IndexTableReader,
    IndexTableSegment, IndexTableWriter, TemporalReorder,
};
pub use klv::{Klv, KlvReader};
pub use log::Logger;
pub use metadata::{HeaderMetadata, MetadataContext, MinimalHeaderMetadata, OpaqueHeaderMetadata};
pub use partition::{Partition, PartitionKind, PartitionList, PartitionStatus, RandomIndexPack, RipEntry};
pub use sequence::{sample_sequence, SampleSequence};
pub use stream::StreamExt;
pub use track::{TrackKind, TrackRegistration};
pub use types::{EditRate, InstanceUid, Rational, Timestamp, Umid};
pub use ul::{labels, UniversalLabel, UL};
pub use writer::{ContentPackageAssembler, MxfWriter, WriterConfig};
