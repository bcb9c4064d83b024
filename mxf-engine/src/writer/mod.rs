//! OP1a file writer.
//!
//! Layout of a finished file:
//!
//! ```text
//! header partition | header metadata + reserve | [index partition (CBE)]
//! essence partition | content packages ... | [index partition | essence partition | ...]
//! [index partition (remaining VBE segments)] | footer partition | RIP
//! ```

mod content_package;

pub use content_package::{ContentPackageAssembler, ELEMENT_LLEN};

use std::collections::HashMap;
use std::io::{Seek, Write};

use crate::error::{MxfError, Result};
use crate::index::{EntryPatch, FrameInfo, IndexEntryInfo, IndexTableWriter, TemporalReorder};
use crate::klv::{KEY_LEN, MAX_LLEN};
use crate::log::{log_debug, log_warn, Logger};
use crate::metadata::{HeaderMetadata, MetadataContext};
use crate::partition::{fill_to_position, PartitionKind, PartitionList, RandomIndexPack};
use crate::stream::StreamExt;
use crate::track::{assign_element_keys, sort_for_emission, TrackKind, TrackRegistration};
use crate::types::EditRate;
use crate::ul::{labels, UniversalLabel};

/// Writer configuration
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WriterConfig {
    pub edit_rate: EditRate,
    /// KAG of the header, index and footer partitions
    pub kag_size: u32,
    /// KAG of the essence partitions
    pub essence_kag_size: u32,
    /// Smallest BER length size used for partition packs, segments and fillers
    pub min_llen: u8,
    /// Edit units per essence partition, 0 for a single essence partition
    pub partition_interval: u32,
    /// Space reserved after the header metadata for its final rendering
    pub reserve_header_bytes: u64,
    pub index_sid: u32,
    pub body_sid: u32,
    pub operational_pattern: UniversalLabel,
    /// How many content packages a track may be ahead of the oldest incomplete one
    pub max_buffered_packages: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            edit_rate: EditRate::fps_25(),
            kag_size: 1,
            essence_kag_size: 1,
            min_llen: 4,
            partition_interval: 0,
            reserve_header_bytes: 8192,
            index_sid: 1,
            body_sid: 2,
            operational_pattern: labels::OP1A_MULTI_TRACK,
            max_buffered_packages: 1,
        }
    }
}

impl WriterConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.edit_rate.is_valid_rate() {
            return Err(MxfError::InvalidConfig(format!("invalid edit rate {}", self.edit_rate)));
        }
        if self.kag_size == 0 || self.essence_kag_size == 0 {
            return Err(MxfError::InvalidConfig("KAG size must be at least 1".into()));
        }
        if self.min_llen == 0 || self.min_llen > MAX_LLEN {
            return Err(MxfError::InvalidConfig(format!(
                "minimum llen {} outside 1..={}",
                self.min_llen, MAX_LLEN
            )));
        }
        if self.index_sid == 0 || self.body_sid == 0 || self.index_sid == self.body_sid {
            return Err(MxfError::InvalidConfig(format!(
                "index SID {} and body SID {} must be distinct and non-zero",
                self.index_sid, self.body_sid
            )));
        }
        if self.max_buffered_packages == 0 {
            return Err(MxfError::InvalidConfig("max_buffered_packages must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Registering,
    Writing,
    Complete,
}

/// Writes an OP1a file with interleaved content packages and an index table
pub struct MxfWriter<W: Write + Seek> {
    writer: W,
    config: WriterConfig,
    logger: Logger,
    state: WriterState,
    tracks: Vec<TrackRegistration>,
    essence_containers: Vec<UniversalLabel>,
    partitions: PartitionList,
    assembler: ContentPackageAssembler,
    index: IndexTableWriter,
    reorders: HashMap<u32, TemporalReorder>,
    metadata: Option<Box<dyn HeaderMetadata>>,
    header_metadata_start: u64,
    header_metadata_end: u64,
    cbe_index_offset: Option<u64>,
    first_write: bool,
    partition_frame_count: u32,
}

impl<W: Write + Seek> MxfWriter<W> {
    pub fn new(writer: W, config: WriterConfig, logger: Logger) -> Result<Self> {
        config.validate()?;
        Ok(MxfWriter {
            assembler: ContentPackageAssembler::new(
                config.essence_kag_size,
                config.min_llen,
                config.max_buffered_packages,
            ),
            index: IndexTableWriter::new(config.index_sid, config.body_sid, config.edit_rate),
            writer,
            config,
            logger,
            state: WriterState::Registering,
            tracks: Vec::new(),
            essence_containers: Vec::new(),
            partitions: PartitionList::new(),
            reorders: HashMap::new(),
            metadata: None,
            header_metadata_start: 0,
            header_metadata_end: 0,
            cbe_index_offset: None,
            first_write: true,
            partition_frame_count: 0,
        })
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Registered tracks in content package order, available after `prepare_write`
    pub fn tracks(&self) -> &[TrackRegistration] {
        &self.tracks
    }

    /// Number of edit units written
    pub fn duration(&self) -> i64 {
        self.index.duration()
    }

    /// Body stream offset of the next content package
    pub fn stream_offset(&self) -> u64 {
        self.index.stream_offset()
    }

    pub fn index_table(&self) -> &IndexTableWriter {
        &self.index
    }

    pub fn partitions(&self) -> &PartitionList {
        &self.partitions
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    pub fn register_track(&mut self, track: TrackRegistration) -> Result<()> {
        if self.state != WriterState::Registering {
            return Err(MxfError::InvalidConfig(format!(
                "track {} registered after writing started",
                track.track_index
            )));
        }
        track.validate()?;
        if self.tracks.iter().any(|t| t.track_index == track.track_index) {
            return Err(MxfError::InvalidConfig(format!(
                "track {} registered twice",
                track.track_index
            )));
        }
        self.tracks.push(track);
        Ok(())
    }

    fn metadata_context(&self, duration: i64) -> MetadataContext<'_> {
        MetadataContext {
            edit_rate: self.config.edit_rate,
            duration,
            operational_pattern: self.config.operational_pattern,
            essence_containers: &self.essence_containers,
            tracks: &self.tracks,
            body_sid: self.config.body_sid,
            index_sid: self.config.index_sid,
        }
    }

    /// Write the header partition, header metadata and reserve.
    ///
    /// `metadata` is rendered again by `complete_write` and must then fit
    /// into the space written here.
    pub fn prepare_write(&mut self, mut metadata: Box<dyn HeaderMetadata>) -> Result<()> {
        if self.state != WriterState::Registering {
            return Err(MxfError::InvalidConfig("prepare_write called twice".into()));
        }
        if self.tracks.is_empty() {
            return Err(MxfError::InvalidConfig("no tracks registered".into()));
        }

        sort_for_emission(&mut self.tracks);
        assign_element_keys(&mut self.tracks)?;
        for track in &self.tracks {
            self.assembler.register(track)?;
            self.index.register_element(
                track.track_index,
                track.kind,
                track.is_fixed_size(),
                track.temporal_reordering,
            )?;
            if track.temporal_reordering {
                self.reorders
                    .insert(track.track_index, TemporalReorder::new(track.track_index, self.logger.clone()));
            }
        }
        self.assembler.prepare()?;
        self.index.prepare()?;

        if self.tracks.len() > 1 {
            self.essence_containers.push(labels::ESSENCE_MULTIPLE_WRAPPINGS);
        }
        for track in &self.tracks {
            if !self.essence_containers.contains(&track.essence_container) {
                self.essence_containers.push(track.essence_container);
            }
        }

        let min_llen = self.config.min_llen;
        let header = self.partitions.create_partition(PartitionKind::Header);
        header.kag_size = self.config.kag_size;
        header.operational_pattern = self.config.operational_pattern;
        header.essence_containers = self.essence_containers.clone();
        header.write(&mut self.writer, min_llen)?;
        header.fill_to_kag(&mut self.writer, min_llen)?;

        let block = metadata.encode(&self.metadata_context(0))?;
        let header = self
            .partitions
            .first_mut()
            .ok_or_else(|| MxfError::Other("header partition missing".into()))?;
        header.mark_header_start(&mut self.writer)?;
        self.header_metadata_start = self.writer.tell()?;
        self.writer.write_all(&block)?;
        header.allocate_space_to_kag(&mut self.writer, self.config.reserve_header_bytes, min_llen)?;
        header.mark_header_end(&mut self.writer)?;
        self.header_metadata_end = self.writer.tell()?;

        log_debug!(
            self.logger,
            tracks = self.tracks.len(),
            metadata_bytes = block.len(),
            header_byte_count = self.header_metadata_end - self.header_metadata_start,
            "header partition written"
        );

        self.metadata = Some(metadata);
        self.state = WriterState::Writing;
        Ok(())
    }

    fn check_writing(&self) -> Result<()> {
        match self.state {
            WriterState::Writing => Ok(()),
            WriterState::Registering => Err(MxfError::InvalidConfig("prepare_write has not been called".into())),
            WriterState::Complete => Err(MxfError::InvalidConfig("writer is complete".into())),
        }
    }

    fn track(&self, track_index: u32) -> Result<&TrackRegistration> {
        self.tracks
            .iter()
            .find(|t| t.track_index == track_index)
            .ok_or(MxfError::InvalidTrack(track_index))
    }

    /// Write one sample. Picture tracks get a random access index entry.
    pub fn write_sample(&mut self, track_index: u32, data: &[u8]) -> Result<()> {
        self.write_samples(track_index, data, 1)
    }

    /// Write `num_samples` samples of equal size
    pub fn write_samples(&mut self, track_index: u32, data: &[u8], num_samples: u32) -> Result<()> {
        self.check_writing()?;
        let track = self.track(track_index)?;
        if track.temporal_reordering {
            return Err(MxfError::OutOfSequence {
                track_index,
                message: "reordered picture tracks are written with write_frame".into(),
            });
        }
        if track.kind == TrackKind::Picture {
            if num_samples != 1 {
                return Err(MxfError::OutOfSequence {
                    track_index,
                    message: format!("{} picture samples in one write", num_samples),
                });
            }
            return self.write_sample_indexed(track_index, data, IndexEntryInfo::random_access());
        }

        self.assembler.write_samples(track_index, data, num_samples)?;
        self.write_content_packages(false)
    }

    /// Write one picture sample with its index entry
    pub fn write_sample_indexed(&mut self, track_index: u32, data: &[u8], info: IndexEntryInfo) -> Result<()> {
        self.check_writing()?;
        self.track(track_index)?;
        let position = self.assembler.next_position(track_index)?;
        // reject before the entry is cached
        self.assembler.check_room(track_index, 1)?;
        self.index.add_index_entry(track_index, position, info, true)?;
        self.assembler.write_sample(track_index, data)?;
        self.write_content_packages(false)
    }

    /// Write one coded frame of a temporally reordered picture track
    pub fn write_frame(&mut self, track_index: u32, data: &[u8], frame: FrameInfo) -> Result<()> {
        self.check_writing()?;
        let position = self.assembler.next_position(track_index)?;
        self.assembler.check_room(track_index, 1)?;

        let reorder = self.reorders.get_mut(&track_index).ok_or_else(|| MxfError::OutOfSequence {
            track_index,
            message: "track is not temporally reordered".into(),
        })?;
        if reorder.position() != position {
            return Err(MxfError::OutOfSequence {
                track_index,
                message: format!("frame {} written for content package {}", reorder.position(), position),
            });
        }
        let output = reorder.process(frame)?;

        for (patch_position, patch) in output.patches {
            self.index.update_index_entry(track_index, patch_position, patch)?;
        }
        self.index
            .add_index_entry(track_index, output.position, output.entry, output.resolved)?;
        self.assembler.write_sample(track_index, data)?;
        self.write_content_packages(false)
    }

    /// Correct an index entry written earlier
    pub fn update_index_entry(&mut self, track_index: u32, position: i64, patch: EntryPatch) -> Result<()> {
        self.check_writing()?;
        self.index.update_index_entry(track_index, position, patch)
    }

    fn write_index_partition(&mut self, final_write: bool) -> Result<()> {
        let min_llen = self.config.min_llen;
        let partition = self.partitions.create_partition(PartitionKind::Body);
        partition.kag_size = self.config.kag_size;
        partition.index_sid = self.config.index_sid;
        partition.body_sid = 0;
        partition.write(&mut self.writer, min_llen)?;
        partition.fill_to_kag(&mut self.writer, min_llen)?;

        if self.index.is_cbe() {
            self.cbe_index_offset = Some(self.writer.tell()?);
        }
        self.index
            .write_segments(&mut self.writer, partition, final_write, min_llen)
            .map_err(|e| e.with_context(format!("index partition at {}", partition.this_partition)))?;
        log_debug!(
            self.logger,
            offset = partition.this_partition,
            index_byte_count = partition.index_byte_count,
            "index partition written"
        );
        Ok(())
    }

    fn write_essence_partition(&mut self, body_offset: u64) -> Result<()> {
        let min_llen = self.config.min_llen;
        let partition = self.partitions.create_partition(PartitionKind::Body);
        partition.kag_size = self.config.essence_kag_size;
        partition.index_sid = 0;
        partition.body_sid = self.config.body_sid;
        partition.body_offset = body_offset;
        partition.write(&mut self.writer, min_llen)?;
        partition.fill_to_kag(&mut self.writer, min_llen)?;
        log_debug!(
            self.logger,
            offset = partition.this_partition,
            body_offset,
            "essence partition started"
        );
        Ok(())
    }

    fn write_content_packages(&mut self, end_of_samples: bool) -> Result<()> {
        while self.assembler.have_complete_package() {
            let mut start_essence_partition = false;
            let body_offset = self.index.stream_offset();

            if self.first_write {
                if self.index.is_cbe() {
                    // edit unit byte count and delta entries come from the first package
                    self.assembler.index_front(&mut self.index)?;
                    self.write_index_partition(false)?;
                }
                start_essence_partition = true;
                self.first_write = false;
            } else if self.config.partition_interval > 0
                && self.partition_frame_count >= self.config.partition_interval
                && self.index.can_start_partition()
            {
                if !self.index.is_cbe() && self.index.have_segments() {
                    self.write_index_partition(true)?;
                }
                start_essence_partition = true;
                self.partition_frame_count = 0;
            }

            if start_essence_partition {
                self.write_essence_partition(body_offset)?;
            }

            let position = self
                .assembler
                .write_front(&mut self.writer, &mut self.index)
                .map_err(|e| e.with_context(format!("content package {}", self.assembler.position())))?;
            if self.config.partition_interval > 0 {
                self.partition_frame_count += 1;
            }
            if end_of_samples {
                log_debug!(self.logger, position, "flushed content package");
            }
        }
        Ok(())
    }

    /// Finish the file: flush packages, resolve trailing reorder entries,
    /// render the header metadata and check it fits its reserved space,
    /// write the footer and RIP, then update the header metadata, the CBE
    /// index segment and every partition pack in place.
    ///
    /// Fails with `HeaderMetadataOverflow` before the footer is written.
    pub fn complete_write(&mut self) -> Result<()> {
        self.check_writing()?;
        let min_llen = self.config.min_llen;

        let mut reorder_tracks: Vec<u32> = self.reorders.keys().copied().collect();
        reorder_tracks.sort_unstable();
        for track_index in reorder_tracks {
            let patches = match self.reorders.get_mut(&track_index) {
                Some(reorder) => reorder.finish(),
                None => continue,
            };
            for (position, patch) in patches {
                self.index.update_index_entry(track_index, position, patch)?;
            }
        }

        self.write_content_packages(true)?;
        let dropped = self.assembler.discard_incomplete();
        if dropped > 0 {
            log_warn!(
                self.logger,
                dropped,
                duration = self.index.duration(),
                "discarding incomplete content packages"
            );
            self.index.discard_pending();
        }
        self.index.check_complete()?;

        // header metadata with the final duration, sized before the footer exists
        let duration = self.index.duration();
        let mut metadata = self
            .metadata
            .take()
            .ok_or_else(|| MxfError::Other("header metadata missing".into()))?;
        let rendered = metadata.encode(&self.metadata_context(duration));
        self.metadata = Some(metadata);
        let block = rendered?;
        let available = self.header_metadata_end - self.header_metadata_start;
        let required = block.len() as u64;
        if required != available && required + KEY_LEN + min_llen as u64 > available {
            return Err(MxfError::HeaderMetadataOverflow { required, available });
        }

        if !self.index.is_cbe() && self.index.have_segments() {
            self.write_index_partition(true)?;
        }

        let footer = self.partitions.create_partition(PartitionKind::Footer);
        footer.kag_size = self.config.kag_size;
        footer.index_sid = 0;
        footer.body_sid = 0;
        footer.close_complete();
        footer.write(&mut self.writer, min_llen)?;
        footer.fill_to_kag(&mut self.writer, min_llen)?;

        RandomIndexPack::from_partitions(&self.partitions).write(&mut self.writer)?;

        self.writer.seek_to(self.header_metadata_start)?;
        self.writer.write_all(&block)?;
        fill_to_position(&mut self.writer, self.header_metadata_end, min_llen)?;

        if let Some(offset) = self.cbe_index_offset {
            self.writer.seek_to(offset)?;
            self.index.rewrite_cbe_segment(&mut self.writer, min_llen)?;
        }

        for partition in self.partitions.iter_mut() {
            partition.close_complete();
        }
        self.partitions.update(&mut self.writer, min_llen)?;
        self.writer.flush()?;

        log_debug!(
            self.logger,
            duration,
            partitions = self.partitions.len(),
            "write complete"
        );
        self.state = WriterState::Complete;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::FrameType;
    use crate::metadata::{MinimalHeaderMetadata, OpaqueHeaderMetadata};
    use crate::types::Rational;
    use std::io::Cursor;

    fn cbe_writer(config: WriterConfig) -> MxfWriter<Cursor<Vec<u8>>> {
        let mut writer = MxfWriter::new(Cursor::new(Vec::new()), config, Logger::silent()).unwrap();
        writer
            .register_track(
                TrackRegistration::picture(0, 0x05, labels::ESSENCE_UNCOMPRESSED_FRAME).with_fixed_size(1000),
            )
            .unwrap();
        writer
            .register_track(TrackRegistration::sound(1, 2, Rational::fps_25(), Rational::hz_48000()).unwrap())
            .unwrap();
        writer
            .prepare_write(Box::new(MinimalHeaderMetadata::default()))
            .unwrap();
        writer
    }

    #[test]
    fn test_config_validation() {
        let config = WriterConfig {
            index_sid: 2,
            body_sid: 2,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(MxfError::InvalidConfig(_))));
        assert!(WriterConfig::default().validate().is_ok());
    }

    #[test]
    fn test_cbe_write() {
        let mut writer = cbe_writer(WriterConfig::default());
        for _ in 0..5 {
            writer.write_sample(0, &[0u8; 1000]).unwrap();
            writer.write_samples(1, &[0u8; 3840], 1920).unwrap();
        }
        writer.complete_write().unwrap();
        assert_eq!(writer.duration(), 5);
        // 1020 byte picture and 3860 byte sound elements
        assert_eq!(writer.index_table().edit_unit_byte_count(), 4880);

        let partitions = writer.partitions().clone();
        assert!(partitions.chain_is_valid());
        assert!(partitions.iter().all(|p| p.is_closed() && p.complete));
        // header, CBE index, essence, footer
        assert_eq!(partitions.len(), 4);
        let footer_offset = partitions.footer().unwrap().this_partition;
        assert!(partitions.iter().all(|p| p.footer_partition == footer_offset));

        let mut cursor = writer.into_inner();
        let rip = RandomIndexPack::read(&mut cursor).unwrap().unwrap();
        assert_eq!(rip.entries.len(), 4);
        assert_eq!(rip.entries[2].body_sid, 2);
    }

    #[test]
    fn test_partition_interval() {
        let config = WriterConfig {
            partition_interval: 2,
            ..Default::default()
        };
        let mut writer = MxfWriter::new(Cursor::new(Vec::new()), config, Logger::silent()).unwrap();
        writer
            .register_track(TrackRegistration::picture(0, 0x05, labels::ESSENCE_MPEG2_FRAME))
            .unwrap();
        writer.prepare_write(Box::new(OpaqueHeaderMetadata::default())).unwrap();
        for i in 0..5u8 {
            writer.write_sample(0, &vec![i; 100 + i as usize]).unwrap();
        }
        writer.complete_write().unwrap();

        let essence: Vec<u64> = writer
            .partitions()
            .iter()
            .filter(|p| p.body_sid == 2)
            .map(|p| p.body_offset)
            .collect();
        assert_eq!(essence, vec![0, 20 + 100 + 20 + 101, 20 * 4 + 100 + 101 + 102 + 103]);
        let index_partitions = writer.partitions().iter().filter(|p| p.index_sid == 1).count();
        assert_eq!(index_partitions, 3);
    }

    #[test]
    fn test_reordered_frames_resolved_at_completion() {
        let mut writer = MxfWriter::new(Cursor::new(Vec::new()), WriterConfig::default(), Logger::silent()).unwrap();
        writer
            .register_track(
                TrackRegistration::picture(0, 0x05, labels::ESSENCE_MPEG2_FRAME).with_temporal_reordering(),
            )
            .unwrap();
        writer.prepare_write(Box::new(OpaqueHeaderMetadata::default())).unwrap();

        writer.write_frame(0, &[0u8; 300], FrameInfo::closed_gop_start()).unwrap();
        writer.write_frame(0, &[0u8; 100], FrameInfo::new(FrameType::P, 2)).unwrap();
        assert_eq!(writer.index_table().unresolved_count(), 1);
        writer.complete_write().unwrap();
        assert_eq!(writer.index_table().unresolved_count(), 0);
        assert_eq!(writer.duration(), 2);
    }

    #[test]
    fn test_reordered_track_rejects_plain_samples() {
        let mut writer = MxfWriter::new(Cursor::new(Vec::new()), WriterConfig::default(), Logger::silent()).unwrap();
        writer
            .register_track(
                TrackRegistration::picture(0, 0x05, labels::ESSENCE_MPEG2_FRAME).with_temporal_reordering(),
            )
            .unwrap();
        writer.prepare_write(Box::new(OpaqueHeaderMetadata::default())).unwrap();
        let err = writer.write_sample(0, &[0u8; 10]).unwrap_err();
        assert!(matches!(err, MxfError::OutOfSequence { track_index: 0, .. }));
        // nothing was buffered
        assert_eq!(writer.duration(), 0);
        writer.write_frame(0, &[0u8; 10], FrameInfo::closed_gop_start()).unwrap();
        assert_eq!(writer.duration(), 1);
    }

    #[test]
    fn test_header_metadata_overflow() {
        struct Growing(usize);
        impl HeaderMetadata for Growing {
            fn encode(&mut self, _context: &MetadataContext<'_>) -> Result<Vec<u8>> {
                self.0 += 200;
                Ok(vec![0u8; self.0])
            }
        }

        let config = WriterConfig {
            reserve_header_bytes: 100,
            ..Default::default()
        };
        let mut writer = MxfWriter::new(Cursor::new(Vec::new()), config, Logger::silent()).unwrap();
        writer
            .register_track(TrackRegistration::picture(0, 0x05, labels::ESSENCE_MPEG2_FRAME))
            .unwrap();
        writer.prepare_write(Box::new(Growing(0))).unwrap();
        writer.write_sample(0, &[0u8; 10]).unwrap();
        let err = writer.complete_write().unwrap_err();
        assert!(matches!(
            err,
            MxfError::HeaderMetadataOverflow { required: 400, available: 300 }
        ));

        // nothing after the essence was written
        assert!(writer.partitions().iter().all(|p| p.kind != PartitionKind::Footer));
        let data = writer.into_inner().into_inner();
        assert!(RandomIndexPack::read(&mut Cursor::new(data)).unwrap().is_none());
    }

    #[test]
    fn test_register_after_prepare_fails() {
        let mut writer = cbe_writer(WriterConfig::default());
        let err = writer
            .register_track(TrackRegistration::data(5, 0x01, labels::ESSENCE_ANC_FRAME))
            .unwrap_err();
        assert!(matches!(err, MxfError::InvalidConfig(_)));
    }
}
