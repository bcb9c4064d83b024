//! MXF demuxer.
//!
//! Opening a file reads the header partition and then recovers the full
//! partition list from the RIP, falling back to the footer's previous
//! partition chain and finally to a forward scan. Content packages are read
//! in the element order of the registered (or discovered) tracks.

use std::io::{Read, Seek};

use crate::error::{MxfError, Result};
use crate::index::{EditUnitLookup, IndexTableReader, IndexTableSegment};
use crate::klv::{self, KlHeader, KlvReader, KEY_LEN};
use crate::log::{log_debug, log_warn, Logger};
use crate::partition::{
    find_footer_partition, read_header_partition_kl, read_partition_at, scan_partitions_forward,
    walk_previous_chain, Partition, PartitionKind, RandomIndexPack, DEFAULT_FOOTER_SEARCH_LIMIT,
    MAX_RUN_IN_LEN,
};
use crate::sequence::samples_in;
use crate::stream::StreamExt;
use crate::track::{assign_element_keys, sort_for_emission, TrackKind, TrackRegistration};
use crate::ul::UniversalLabel;

/// Demuxer configuration
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DemuxerConfig {
    /// Seek by counting content packages when there is no index table
    pub allow_linear_scan: bool,
    /// Longest run-in accepted before the header partition pack
    pub max_run_in: u64,
    /// Bytes searched backward from the end for a footer partition pack
    pub footer_search_limit: u64,
}

impl Default for DemuxerConfig {
    fn default() -> Self {
        DemuxerConfig {
            allow_linear_scan: true,
            max_run_in: MAX_RUN_IN_LEN,
            footer_search_limit: DEFAULT_FOOTER_SEARCH_LIMIT,
        }
    }
}

/// Where the partition list came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionSource {
    /// Random index pack at the end of the file
    Rip,
    /// `previous_partition` links followed back from the footer
    FooterChain,
    /// Every KLV read from the header onwards
    ForwardScan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    /// Position at the requested edit unit
    Exact,
    /// Position at the first edit unit needed to decode the requested one
    Precharge,
}

/// Outcome of a seek
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekResult {
    /// Edit unit the next `read_content_package` returns
    pub position: i64,
    /// Absolute file offset of that content package
    pub file_offset: u64,
    /// Edit units before the requested position needed for decoding (<= 0)
    pub precharge: i64,
    /// Edit units after the requested position needed for decoding (>= 0)
    pub rollout: i64,
    /// The requested position was outside the available essence and was clamped
    pub beyond_available: bool,
}

/// One track's element of a content package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackFrame {
    pub track_index: u32,
    /// Track sample position of the first sample in `data`
    pub first_sample: u64,
    pub num_samples: u32,
    pub data: Vec<u8>,
}

/// All elements of one edit unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentPackage {
    pub position: i64,
    pub file_offset: u64,
    pub frames: Vec<TrackFrame>,
}

impl ContentPackage {
    pub fn frame(&self, track_index: u32) -> Option<&TrackFrame> {
        self.frames.iter().find(|f| f.track_index == track_index)
    }
}

/// Contiguous essence bytes of one body partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EssenceChunk {
    body_offset: u64,
    file_offset: u64,
    size: u64,
}

/// Reads content packages from an OP1a file
pub struct MxfDemuxer<R: Read + Seek> {
    reader: R,
    config: DemuxerConfig,
    logger: Logger,
    run_in: u64,
    partitions: Vec<Partition>,
    source: PartitionSource,
    rip: Option<RandomIndexPack>,
    body_sid: u32,
    chunks: Vec<EssenceChunk>,
    index: Option<IndexTableReader>,
    tracks: Vec<TrackRegistration>,
    tracks_ready: bool,
    sample_positions: Vec<u64>,
    position: i64,
    file_offset: u64,
    // file offsets of packages 0..n found while reading from the start
    package_offsets: Vec<u64>,
}

impl<R: Read + Seek> MxfDemuxer<R> {
    /// Open a file: read the partitions, select the first body stream and
    /// resolve its index table if there is one.
    ///
    /// Fails with `InvalidPartition` when no header partition pack is found.
    pub fn open(mut reader: R, config: DemuxerConfig, logger: Logger) -> Result<Self> {
        let (run_in, kl) = read_header_partition_kl(&mut reader, config.max_run_in)?;
        let header = Partition::read(&mut reader, &kl, &logger).map_err(|e| match e {
            MxfError::InvalidPartition(message) => MxfError::InvalidPartition(format!("header partition: {}", message)),
            other => other.with_context("header partition"),
        })?;
        let (partitions, source, rip) = open_partitions(&mut reader, run_in, header, &config, &logger)?;
        log_debug!(
            logger,
            run_in,
            partitions = partitions.len(),
            source = ?source,
            "opened partitions"
        );

        let mut demuxer = MxfDemuxer {
            reader,
            config,
            logger,
            run_in,
            partitions,
            source,
            rip,
            body_sid: 0,
            chunks: Vec::new(),
            index: None,
            tracks: Vec::new(),
            tracks_ready: false,
            sample_positions: Vec::new(),
            position: 0,
            file_offset: 0,
            package_offsets: Vec::new(),
        };

        let body_sid = demuxer
            .partitions
            .iter()
            .find(|p| p.has_essence())
            .map_or(0, |p| p.body_sid);
        if body_sid != 0 {
            demuxer.select_body_stream(body_sid)?;
            match demuxer.resolve_index(body_sid) {
                Ok(_) => {}
                Err(MxfError::Io(e)) => return Err(MxfError::Io(e)),
                Err(e) => {
                    log_warn!(demuxer.logger, body_sid, error = %e, "index table unusable");
                    demuxer.index = None;
                }
            }
        }
        Ok(demuxer)
    }

    pub fn config(&self) -> &DemuxerConfig {
        &self.config
    }

    /// Bytes before the header partition pack
    pub fn run_in(&self) -> u64 {
        self.run_in
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn partition_source(&self) -> PartitionSource {
        self.source
    }

    pub fn rip(&self) -> Option<&RandomIndexPack> {
        self.rip.as_ref()
    }

    /// Body stream being read, 0 if the file has no essence
    pub fn body_sid(&self) -> u32 {
        self.body_sid
    }

    pub fn index(&self) -> Option<&IndexTableReader> {
        self.index.as_ref()
    }

    /// Indexed duration, if there is an index table
    pub fn duration(&self) -> Option<i64> {
        self.index.as_ref().map(IndexTableReader::duration)
    }

    pub fn tracks(&self) -> &[TrackRegistration] {
        &self.tracks
    }

    /// Position of the next content package
    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Declare a track. Tracks are matched to elements by element key,
    /// assigned the same way the writer assigns them.
    pub fn register_track(&mut self, track: TrackRegistration) -> Result<()> {
        if self.tracks_ready {
            return Err(MxfError::InvalidConfig(format!(
                "track {} registered after reading started",
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

    /// Infer one track per element of the first content package.
    ///
    /// Discovered tracks count one sample per element. Registered tracks are
    /// returned unchanged.
    pub fn discover_tracks(&mut self) -> Result<&[TrackRegistration]> {
        if !self.tracks.is_empty() {
            self.prepare_tracks()?;
            return Ok(&self.tracks);
        }

        let start = match self.chunks.first() {
            Some(chunk) => chunk.file_offset,
            None => {
                self.tracks_ready = true;
                return Ok(&self.tracks);
            }
        };
        self.reader.seek_to(start)?;

        let mut keys: Vec<UniversalLabel> = Vec::new();
        loop {
            let kl = match self.next_element_kl(keys.is_empty())? {
                Some(kl) => kl,
                None => break,
            };
            if !kl.key.is_gc_essence_element() || keys.iter().any(|k| k.eq_mod_regver(&kl.key)) {
                break;
            }
            keys.push(kl.key);
            self.reader.skip(kl.len)?;
        }

        let mut tracks = Vec::with_capacity(keys.len());
        for (i, key) in keys.into_iter().enumerate() {
            let bytes = key.as_bytes();
            let kind = TrackKind::from_item_type(bytes[12]).ok_or_else(|| {
                MxfError::DemuxDesync {
                    position: 0,
                    expected: "essence element".into(),
                    found: key.to_string(),
                }
            })?;
            tracks.push(TrackRegistration {
                track_index: i as u32,
                kind,
                element_type: bytes[14],
                fixed_sample_size: None,
                sample_sequence: vec![1],
                temporal_reordering: false,
                essence_container: UniversalLabel::default(),
                element_key: key,
            });
        }
        log_debug!(self.logger, tracks = tracks.len(), "discovered tracks");

        self.sample_positions = vec![0; tracks.len()];
        self.tracks = tracks;
        self.tracks_ready = true;
        self.set_position(0, start);
        Ok(&self.tracks)
    }

    fn prepare_tracks(&mut self) -> Result<()> {
        if self.tracks_ready {
            return Ok(());
        }
        if self.tracks.is_empty() {
            self.discover_tracks()?;
            return Ok(());
        }
        sort_for_emission(&mut self.tracks);
        assign_element_keys(&mut self.tracks)?;
        self.sample_positions = vec![0; self.tracks.len()];
        self.tracks_ready = true;
        let position = self.position;
        let offset = self.file_offset;
        self.set_position(position, offset);
        Ok(())
    }

    fn set_position(&mut self, position: i64, file_offset: u64) {
        self.position = position;
        self.file_offset = file_offset;
        let units = position.max(0) as u64;
        self.sample_positions = self
            .tracks
            .iter()
            .map(|t| samples_in(&t.sample_sequence, units))
            .collect();
    }

    // Absolute offset of the first byte after a partition pack and its KAG fill
    fn payload_start(&mut self, this_partition: u64, kag_size: u32) -> Result<u64> {
        let pack_start = offset_add(self.run_in, this_partition, "partition offset")?;
        self.reader.seek_to(pack_start)?;
        let kl = klv::read_kl(&mut self.reader)?;
        let mut pos = offset_add(pack_start, kl.total_len(), "partition pack length")?;

        let kag = kag_size.max(1) as u64;
        if kag > 1 && (pos - pack_start) % kag != 0 {
            self.reader.seek_to(pos)?;
            let fill = klv::read_kl(&mut self.reader)?;
            if fill.key.is_filler() {
                pos = offset_add(pos, fill.total_len(), "partition pack filler")?;
            }
        }
        Ok(pos)
    }

    fn essence_chunks(&mut self, body_sid: u32) -> Result<Vec<EssenceChunk>> {
        let size = self.reader.size()?;
        let layout: Vec<(u64, u32, u64, u64, u64, u32)> = self
            .partitions
            .iter()
            .map(|p| {
                (
                    p.this_partition,
                    p.kag_size,
                    p.header_byte_count,
                    p.index_byte_count,
                    p.body_offset,
                    p.body_sid,
                )
            })
            .collect();

        let mut chunks: Vec<EssenceChunk> = Vec::new();
        for (i, &(this_partition, kag_size, header_bytes, index_bytes, body_offset, sid)) in layout.iter().enumerate() {
            if sid != body_sid {
                continue;
            }
            let start = match self
                .payload_start(this_partition, kag_size)?
                .checked_add(header_bytes)
                .and_then(|pos| pos.checked_add(index_bytes))
            {
                Some(start) => start,
                None => {
                    log_warn!(
                        self.logger,
                        partition = this_partition,
                        header_bytes,
                        index_bytes,
                        "partition byte counts overflow, essence skipped"
                    );
                    continue;
                }
            };
            let end = layout
                .get(i + 1)
                .map_or(size, |next| self.run_in.saturating_add(next.0))
                .min(size);
            if let Some(last) = chunks.last() {
                if body_offset < last.body_offset + last.size.min(1) {
                    log_warn!(
                        self.logger,
                        partition = this_partition,
                        body_offset,
                        "body offset goes backwards"
                    );
                }
            }
            chunks.push(EssenceChunk {
                body_offset,
                file_offset: start,
                size: end.saturating_sub(start),
            });
        }
        Ok(chunks)
    }

    fn select_body_stream(&mut self, body_sid: u32) -> Result<()> {
        self.chunks = self.essence_chunks(body_sid)?;
        self.body_sid = body_sid;
        self.package_offsets.clear();
        let start = self.essence_start();
        self.set_position(0, start);
        Ok(())
    }

    fn essence_start(&self) -> u64 {
        self.chunks
            .first()
            .map_or(self.run_in, |c| c.file_offset)
    }

    fn essence_data_size(&self) -> u64 {
        self.chunks.last().map_or(0, |c| c.body_offset + c.size)
    }

    fn stream_to_file(&self, stream_offset: u64) -> Option<u64> {
        let i = self.chunks.partition_point(|c| c.body_offset <= stream_offset);
        let chunk = self.chunks.get(i.checked_sub(1)?)?;
        let rel = stream_offset - chunk.body_offset;
        if rel > chunk.size {
            return None;
        }
        Some(chunk.file_offset + rel)
    }

    /// Read every index table segment of `body_sid` and map body stream
    /// offsets to file offsets.
    ///
    /// Returns `false` when the stream has no index table. Reading restarts
    /// at position 0 of the stream.
    pub fn resolve_index(&mut self, body_sid: u32) -> Result<bool> {
        if body_sid == 0 {
            return Err(MxfError::InvalidConfig("body SID 0 has no essence".into()));
        }
        self.select_body_stream(body_sid)?;
        self.index = None;

        let layout: Vec<(u64, u32, u64, u64)> = self
            .partitions
            .iter()
            .filter(|p| p.index_sid != 0 && p.index_byte_count > 0)
            .map(|p| (p.this_partition, p.kag_size, p.header_byte_count, p.index_byte_count))
            .collect();

        let size = self.reader.size()?;
        let mut segments: Vec<IndexTableSegment> = Vec::new();
        for (this_partition, kag_size, header_bytes, index_bytes) in layout {
            let start = offset_add(self.payload_start(this_partition, kag_size)?, header_bytes, "header byte count")?;
            if offset_add(start, index_bytes, "index byte count")? > size {
                return Err(MxfError::TruncatedStream(format!(
                    "index of partition at {} ends after the stream",
                    this_partition
                )));
            }
            self.reader.seek_to(start)?;
            let mut data = vec![0u8; index_bytes as usize];
            self.reader.read_exact(&mut data)?;

            let mut klvs = KlvReader::new(&data);
            while let Some((kl, value)) = klvs.read_klv()? {
                if !kl.key.is_index_table_segment() {
                    continue;
                }
                let segment = IndexTableSegment::parse(value, &self.logger)
                    .map_err(|e| e.with_context(format!("index segment in partition at {}", this_partition)))?;
                if segment.body_sid == body_sid {
                    segments.push(segment);
                }
            }
        }

        let index_sid = match segments.first() {
            Some(segment) => segment.index_sid,
            None => {
                log_debug!(self.logger, body_sid, "no index table");
                return Ok(false);
            }
        };
        let mut index = IndexTableReader::from_segments(
            index_sid,
            segments.into_iter().filter(|s| s.index_sid == index_sid),
            self.logger.clone(),
        )?;
        index.set_essence_data_size(self.essence_data_size());
        log_debug!(
            self.logger,
            index_sid,
            body_sid,
            cbe = index.is_cbe(),
            duration = index.duration(),
            "resolved index table"
        );
        self.index = Some(index);
        Ok(true)
    }

    // Next KL of an essence element, skipping fillers, index segments,
    // header metadata and partition packs of this body stream. `None` at the
    // end of the essence.
    fn next_element_kl(&mut self, package_start: bool) -> Result<Option<KlHeader>> {
        let size = self.reader.size()?;
        loop {
            let pos = self.reader.tell()?;
            if pos + KEY_LEN >= size {
                return Ok(None);
            }
            let kl = match klv::read_kl(&mut self.reader) {
                Ok(kl) => kl,
                Err(e) if e.is_recoverable() => {
                    log_warn!(self.logger, offset = pos, error = %e, "essence ends in a truncated key");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };

            if kl.key.is_filler() || kl.key.is_index_table_segment() || kl.key.is_header_metadata() {
                self.reader.skip(kl.len)?;
                continue;
            }
            if kl.key.is_random_index_pack() {
                return Ok(None);
            }
            if kl.key.is_partition_pack() {
                if !package_start {
                    return Ok(Some(kl));
                }
                let partition = Partition::read(&mut self.reader, &kl, &self.logger)
                    .map_err(|e| e.with_context(format!("partition at {}", pos - self.run_in)))?;
                if partition.kind == PartitionKind::Footer
                    || (partition.body_sid != 0 && partition.body_sid != self.body_sid)
                {
                    return Ok(None);
                }
                continue;
            }
            return Ok(Some(kl));
        }
    }

    fn desync(&self, expected: &TrackRegistration, found: String) -> MxfError {
        MxfError::DemuxDesync {
            position: self.position,
            expected: format!("track {} element {}", expected.track_index, expected.element_key),
            found,
        }
    }

    fn read_package(&mut self, load_data: bool) -> Result<Option<ContentPackage>> {
        self.prepare_tracks()?;
        if self.tracks.is_empty() {
            return Ok(None);
        }
        let size = self.reader.size()?;
        self.reader.seek_to(self.file_offset)?;

        let mut package_offset = self.file_offset;
        let mut frames = Vec::with_capacity(self.tracks.len());
        for i in 0..self.tracks.len() {
            let kl = match self.next_element_kl(i == 0)? {
                Some(kl) => kl,
                None if i == 0 => return Ok(None),
                None => return Err(self.desync(&self.tracks[i], "end of essence".into())),
            };
            let value_start = self.reader.tell()?;
            if i == 0 {
                package_offset = value_start - kl.header_len();
            }

            let track = &self.tracks[i];
            if !kl.key.eq_mod_regver(&track.element_key) {
                return Err(self.desync(track, kl.key.to_string()));
            }
            if value_start.checked_add(kl.len).map_or(true, |end| end > size) {
                log_warn!(
                    self.logger,
                    position = self.position,
                    track = track.track_index,
                    "content package truncated"
                );
                return Ok(None);
            }

            let data = if load_data {
                let mut data = vec![0u8; kl.len as usize];
                self.reader.read_exact(&mut data)?;
                data
            } else {
                self.reader.skip(kl.len)?;
                Vec::new()
            };

            let num_samples = match (track.kind, track.fixed_sample_size) {
                (TrackKind::Sound, Some(block_align)) => (kl.len / block_align as u64) as u32,
                _ => track.samples_at(self.position.max(0) as u64),
            };
            frames.push(TrackFrame {
                track_index: track.track_index,
                first_sample: self.sample_positions[i],
                num_samples,
                data,
            });
        }

        for (position, frame) in self.sample_positions.iter_mut().zip(&frames) {
            *position += frame.num_samples as u64;
        }
        if self.position >= 0 && self.position as usize == self.package_offsets.len() {
            self.package_offsets.push(package_offset);
        }
        let package = ContentPackage {
            position: self.position,
            file_offset: package_offset,
            frames,
        };
        self.position += 1;
        self.file_offset = self.reader.tell()?;
        Ok(Some(package))
    }

    /// Read the content package at the current position; `None` at the end
    /// of the essence
    pub fn read_content_package(&mut self) -> Result<Option<ContentPackage>> {
        self.read_package(true)
    }

    /// Reposition at edit unit `position`.
    ///
    /// Uses the index table when there is one, otherwise counts content
    /// packages from the nearest known package (if the configuration allows).
    /// A position outside the available essence is clamped and flagged.
    pub fn seek(&mut self, position: i64, mode: SeekMode) -> Result<SeekResult> {
        self.prepare_tracks()?;
        let result = if self.index.as_ref().map_or(false, |i| !i.is_empty()) {
            self.seek_indexed(position, mode)?
        } else if self.config.allow_linear_scan {
            self.seek_linear(position)?
        } else {
            return Err(MxfError::IndexUnavailable { position });
        };
        log_debug!(
            self.logger,
            requested = position,
            position = result.position,
            file_offset = result.file_offset,
            beyond_available = result.beyond_available,
            "seek"
        );
        Ok(result)
    }

    fn seek_indexed(&mut self, position: i64, mode: SeekMode) -> Result<SeekResult> {
        let index = self
            .index
            .as_ref()
            .ok_or(MxfError::IndexUnavailable { position })?;
        let precharge = index.get_precharge(position);
        let rollout = index.get_rollout(position);
        let target = match mode {
            SeekMode::Exact => position,
            SeekMode::Precharge => position + precharge,
        };

        let (found, stream_offset, beyond_available) = match index.get_edit_unit(target) {
            EditUnitLookup::Found(unit) => (target, unit.offset, false),
            EditUnitLookup::Before => {
                let start = index.start_position();
                match index.get_edit_unit(start) {
                    EditUnitLookup::Found(unit) => (start, unit.offset, true),
                    _ => return Err(MxfError::IndexUnavailable { position }),
                }
            }
            EditUnitLookup::After => (index.duration(), self.essence_data_size(), true),
        };

        let file_offset = self
            .stream_to_file(stream_offset)
            .ok_or(MxfError::IndexUnavailable { position: found })?;
        self.set_position(found, file_offset);
        Ok(SeekResult {
            position: found,
            file_offset,
            precharge,
            rollout,
            beyond_available,
        })
    }

    fn seek_linear(&mut self, position: i64) -> Result<SeekResult> {
        let target = position.max(0);
        let (start, offset) = match self.package_offsets.len() {
            0 => (0, self.essence_start()),
            known => {
                let i = (target as usize).min(known - 1);
                (i as i64, self.package_offsets[i])
            }
        };
        self.set_position(start, offset);

        let mut beyond_available = position < 0;
        while self.position < target {
            if self.read_package(false)?.is_none() {
                beyond_available = true;
                break;
            }
        }
        Ok(SeekResult {
            position: self.position,
            file_offset: self.file_offset,
            precharge: 0,
            rollout: 0,
            beyond_available,
        })
    }

    /// Header metadata bytes of the header partition, without leading or
    /// trailing filler
    pub fn header_metadata(&mut self) -> Result<Vec<u8>> {
        let header = self
            .partitions
            .first()
            .ok_or_else(|| MxfError::InvalidPartition("no header partition".into()))?;
        let (this_partition, kag_size, header_bytes) =
            (header.this_partition, header.kag_size, header.header_byte_count);
        if header_bytes == 0 {
            return Ok(Vec::new());
        }

        let start = self.payload_start(this_partition, kag_size)?;
        if offset_add(start, header_bytes, "header byte count")? > self.reader.size()? {
            return Err(MxfError::TruncatedStream(format!(
                "header metadata of {} bytes ends after the stream",
                header_bytes
            )));
        }
        self.reader.seek_to(start)?;
        let mut data = vec![0u8; header_bytes as usize];
        self.reader.read_exact(&mut data)?;

        let mut klvs = KlvReader::new(&data);
        let mut first = None;
        let mut end = 0;
        loop {
            let offset = klvs.position();
            match klvs.read_klv() {
                Ok(Some((kl, _))) => {
                    if !kl.key.is_filler() {
                        first.get_or_insert(offset);
                        end = klvs.position();
                    }
                }
                Ok(None) => break,
                // not KLV coded, hand it back as stored
                Err(_) => return Ok(data),
            }
        }
        Ok(first.map_or_else(Vec::new, |first| data[first..end].to_vec()))
    }
}

fn offset_add(base: u64, len: u64, what: &str) -> Result<u64> {
    base.checked_add(len)
        .ok_or_else(|| MxfError::InvalidPartition(format!("{} {} overflows the stream offset {}", what, len, base)))
}

fn open_partitions<R: Read + Seek>(
    reader: &mut R,
    run_in: u64,
    header: Partition,
    config: &DemuxerConfig,
    logger: &Logger,
) -> Result<(Vec<Partition>, PartitionSource, Option<RandomIndexPack>)> {
    match RandomIndexPack::read(reader) {
        Ok(Some(rip)) => match partitions_from_rip(reader, run_in, &rip, logger) {
            Ok(partitions) => return Ok((partitions, PartitionSource::Rip, Some(rip))),
            Err(e) => log_warn!(logger, error = %e, "random index pack unusable"),
        },
        Ok(None) => log_debug!(logger, "no random index pack"),
        Err(MxfError::Io(e)) => return Err(MxfError::Io(e)),
        Err(e) => log_warn!(logger, error = %e, "random index pack unreadable"),
    }

    let mut footer_candidates = Vec::new();
    if header.footer_partition != 0 {
        footer_candidates.push(header.footer_partition);
    }
    match find_footer_partition(reader, config.footer_search_limit) {
        Ok(Some(offset)) if offset >= run_in => footer_candidates.push(offset - run_in),
        Ok(_) => {}
        Err(MxfError::Io(e)) => return Err(MxfError::Io(e)),
        Err(e) => log_warn!(logger, error = %e, "footer search failed"),
    }
    footer_candidates.dedup();
    for footer in footer_candidates {
        match walk_previous_chain(reader, run_in, footer, logger) {
            Ok(chain) if chain.first().map_or(false, |p| p.kind == PartitionKind::Header) => {
                return Ok((chain, PartitionSource::FooterChain, None));
            }
            Ok(_) => log_warn!(logger, footer, "footer chain does not reach the header"),
            Err(MxfError::Io(e)) => return Err(MxfError::Io(e)),
            Err(e) => log_warn!(logger, footer, error = %e, "footer chain unusable"),
        }
    }

    let mut partitions = scan_partitions_forward(reader, run_in, logger)?;
    if partitions.is_empty() {
        partitions.push(header);
    }
    Ok((partitions, PartitionSource::ForwardScan, None))
}

fn partitions_from_rip<R: Read + Seek>(
    reader: &mut R,
    run_in: u64,
    rip: &RandomIndexPack,
    logger: &Logger,
) -> Result<Vec<Partition>> {
    let mut partitions = Vec::with_capacity(rip.entries.len());
    for entry in &rip.entries {
        let partition = read_partition_at(reader, run_in, entry.this_partition, logger)?;
        if partition.body_sid != entry.body_sid {
            return Err(MxfError::InvalidPartition(format!(
                "RIP lists body SID {} for partition at {} which has {}",
                entry.body_sid, entry.this_partition, partition.body_sid
            )));
        }
        partitions.push(partition);
    }
    match partitions.first() {
        Some(first) if first.kind == PartitionKind::Header => Ok(partitions),
        _ => Err(MxfError::InvalidPartition("RIP does not start with the header partition".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{FrameInfo, FrameType};
    use crate::metadata::OpaqueHeaderMetadata;
    use crate::types::Rational;
    use crate::ul::labels;
    use crate::writer::{MxfWriter, WriterConfig};
    use std::io::Cursor;

    fn picture() -> TrackRegistration {
        TrackRegistration::picture(0, 0x05, labels::ESSENCE_MPEG2_FRAME)
    }

    fn sound() -> TrackRegistration {
        TrackRegistration::sound(1, 2, Rational::fps_25(), Rational::hz_48000()).unwrap()
    }

    fn metadata_block() -> Vec<u8> {
        let mut block = Vec::new();
        klv::write_kl(&mut block, &labels::PREFACE, 3).unwrap();
        block.extend_from_slice(&[1, 2, 3]);
        block
    }

    fn frame_data(i: usize) -> Vec<u8> {
        vec![i as u8; 100 + 10 * i]
    }

    fn write_file(config: WriterConfig, frames: usize) -> Vec<u8> {
        let mut writer = MxfWriter::new(Cursor::new(Vec::new()), config, Logger::silent()).unwrap();
        writer.register_track(picture()).unwrap();
        writer.register_track(sound()).unwrap();
        writer
            .prepare_write(Box::new(OpaqueHeaderMetadata(metadata_block())))
            .unwrap();
        for i in 0..frames {
            writer.write_sample(0, &frame_data(i)).unwrap();
            writer.write_samples(1, &vec![i as u8; 3840], 1920).unwrap();
        }
        writer.complete_write().unwrap();
        writer.into_inner().into_inner()
    }

    fn open(data: Vec<u8>) -> MxfDemuxer<Cursor<Vec<u8>>> {
        let mut demuxer = MxfDemuxer::open(Cursor::new(data), DemuxerConfig::default(), Logger::silent()).unwrap();
        demuxer.register_track(picture()).unwrap();
        demuxer.register_track(sound()).unwrap();
        demuxer
    }

    #[test]
    fn test_read_all_packages() {
        let mut demuxer = open(write_file(WriterConfig::default(), 6));
        assert_eq!(demuxer.partition_source(), PartitionSource::Rip);
        assert_eq!(demuxer.duration(), Some(6));

        for i in 0..6 {
            let package = demuxer.read_content_package().unwrap().unwrap();
            assert_eq!(package.position, i as i64);
            assert_eq!(package.frame(0).unwrap().data, frame_data(i));
            let audio = package.frame(1).unwrap();
            assert_eq!(audio.num_samples, 1920);
            assert_eq!(audio.first_sample, 1920 * i as u64);
        }
        assert!(demuxer.read_content_package().unwrap().is_none());
        assert_eq!(demuxer.header_metadata().unwrap(), metadata_block());
    }

    #[test]
    fn test_seek_with_vbe_index() {
        let config = WriterConfig {
            partition_interval: 2,
            ..Default::default()
        };
        let mut demuxer = open(write_file(config, 7));
        let result = demuxer.seek(5, SeekMode::Exact).unwrap();
        assert_eq!(result.position, 5);
        assert!(!result.beyond_available);

        let package = demuxer.read_content_package().unwrap().unwrap();
        assert_eq!(package.position, 5);
        assert_eq!(package.file_offset, result.file_offset);
        assert_eq!(package.frame(0).unwrap().data, frame_data(5));
        assert_eq!(package.frame(1).unwrap().first_sample, 5 * 1920);
    }

    #[test]
    fn test_seek_beyond_end_is_clamped() {
        let mut demuxer = open(write_file(WriterConfig::default(), 3));
        let result = demuxer.seek(10, SeekMode::Exact).unwrap();
        assert!(result.beyond_available);
        assert_eq!(result.position, 3);
        assert!(demuxer.read_content_package().unwrap().is_none());
    }

    #[test]
    fn test_linear_scan_without_index() {
        let data = write_file(WriterConfig::default(), 5);
        let mut demuxer = open(data.clone());
        demuxer.index = None;
        let result = demuxer.seek(3, SeekMode::Exact).unwrap();
        assert_eq!(result.position, 3);
        let package = demuxer.read_content_package().unwrap().unwrap();
        assert_eq!(package.frame(0).unwrap().data, frame_data(3));

        // earlier packages come from the offsets found on the way
        demuxer.seek(1, SeekMode::Exact).unwrap();
        let package = demuxer.read_content_package().unwrap().unwrap();
        assert_eq!(package.frame(0).unwrap().data, frame_data(1));

        let config = DemuxerConfig {
            allow_linear_scan: false,
            ..Default::default()
        };
        let mut demuxer = MxfDemuxer::open(Cursor::new(data), config, Logger::silent()).unwrap();
        demuxer.index = None;
        let err = demuxer.seek(3, SeekMode::Exact).unwrap_err();
        assert!(matches!(err, MxfError::IndexUnavailable { position: 3 }));
    }

    #[test]
    fn test_footer_chain_without_rip() {
        let mut data = write_file(WriterConfig::default(), 4);
        let rip_len = u32::from_be_bytes(data[data.len() - 4..].try_into().unwrap()) as usize;
        data.truncate(data.len() - rip_len);

        let mut demuxer = open(data);
        assert_eq!(demuxer.partition_source(), PartitionSource::FooterChain);
        assert_eq!(demuxer.duration(), Some(4));
        demuxer.seek(2, SeekMode::Exact).unwrap();
        let package = demuxer.read_content_package().unwrap().unwrap();
        assert_eq!(package.frame(0).unwrap().data, frame_data(2));
    }

    #[test]
    fn test_corrupt_index_byte_count_drops_index() {
        let mut data = write_file(WriterConfig::default(), 4);
        let index_partition = open(data.clone())
            .partitions()
            .iter()
            .find(|p| p.index_byte_count > 0)
            .map(|p| p.this_partition)
            .unwrap();
        let kl = klv::read_kl(&mut Cursor::new(&data[index_partition as usize..])).unwrap();
        // version, KAG, four offsets and the header byte count precede it
        let field = (index_partition + kl.header_len()) as usize + 40;
        data[field..field + 8].copy_from_slice(&(u64::MAX - 10).to_be_bytes());

        let mut demuxer = open(data);
        assert!(demuxer.index().is_none());
        assert_eq!(demuxer.duration(), None);
        for i in 0..4 {
            let package = demuxer.read_content_package().unwrap().unwrap();
            assert_eq!(package.frame(0).unwrap().data, frame_data(i));
        }
        assert!(demuxer.read_content_package().unwrap().is_none());
        assert!(matches!(
            demuxer.resolve_index(demuxer.body_sid()),
            Err(MxfError::InvalidPartition(_))
        ));
    }

    #[test]
    fn test_discover_tracks() {
        let mut demuxer =
            MxfDemuxer::open(Cursor::new(write_file(WriterConfig::default(), 2)), DemuxerConfig::default(), Logger::silent())
                .unwrap();
        let tracks = demuxer.discover_tracks().unwrap();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].kind, TrackKind::Picture);
        assert_eq!(tracks[1].kind, TrackKind::Sound);

        let package = demuxer.read_content_package().unwrap().unwrap();
        assert_eq!(package.frames[1].data.len(), 3840);
        assert!(demuxer.register_track(picture()).is_err());
    }

    #[test]
    fn test_unexpected_element_is_desync() {
        let mut demuxer = MxfDemuxer::open(
            Cursor::new(write_file(WriterConfig::default(), 2)),
            DemuxerConfig::default(),
            Logger::silent(),
        )
        .unwrap();
        demuxer.register_track(picture()).unwrap();
        demuxer.register_track(sound()).unwrap();
        demuxer
            .register_track(TrackRegistration::data(2, 0x01, labels::ESSENCE_ANC_FRAME))
            .unwrap();

        let err = demuxer.read_content_package().unwrap_err();
        assert!(matches!(err, MxfError::DemuxDesync { position: 0, .. }));
    }

    #[test]
    fn test_precharge_seek_on_reordered_stream() {
        let mut writer = MxfWriter::new(Cursor::new(Vec::new()), WriterConfig::default(), Logger::silent()).unwrap();
        writer.register_track(picture().with_temporal_reordering()).unwrap();
        writer.prepare_write(Box::new(OpaqueHeaderMetadata::default())).unwrap();
        // coded order I0 P3 B1 B2 of a closed GOP
        let mut first = FrameInfo::closed_gop_start();
        first.sequence_header = true;
        let frames = [
            first,
            FrameInfo::new(FrameType::P, 3),
            FrameInfo::new(FrameType::B, 1),
            FrameInfo::new(FrameType::B, 2),
        ];
        for (i, frame) in frames.into_iter().enumerate() {
            writer.write_frame(0, &frame_data(i), frame).unwrap();
        }
        writer.complete_write().unwrap();

        let mut demuxer =
            MxfDemuxer::open(Cursor::new(writer.into_inner().into_inner()), DemuxerConfig::default(), Logger::silent())
                .unwrap();
        demuxer.register_track(picture()).unwrap();
        let index = demuxer.index().unwrap();
        assert_eq!(index.get_rollout(1), 1);

        let result = demuxer.seek(3, SeekMode::Precharge).unwrap();
        assert!(result.precharge < 0);
        assert_eq!(result.position, 3 + result.precharge);
    }
}
