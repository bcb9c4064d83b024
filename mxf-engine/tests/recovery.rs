//! Partition recovery and damaged files.

use std::io::{self, Cursor};
use std::sync::{Arc, Mutex};

use mxf_engine::{
    labels, DemuxerConfig, Logger, MxfDemuxer, MxfError, MxfWriter, OpaqueHeaderMetadata, PartitionKind,
    PartitionSource, Rational, SeekMode, TrackRegistration, WriterConfig,
};
use tracing_subscriber::fmt::MakeWriter;

fn tracks() -> Vec<TrackRegistration> {
    vec![
        TrackRegistration::picture(0, 0x05, labels::ESSENCE_MPEG2_FRAME),
        TrackRegistration::sound(1, 2, Rational::fps_25(), Rational::hz_48000()).unwrap(),
    ]
}

fn picture_data(position: usize) -> Vec<u8> {
    vec![position as u8; 300 + position]
}

fn write_file(config: WriterConfig, packages: usize, logger: Logger) -> Vec<u8> {
    let mut writer = MxfWriter::new(Cursor::new(Vec::new()), config, logger).unwrap();
    for track in tracks() {
        writer.register_track(track).unwrap();
    }
    writer.prepare_write(Box::new(OpaqueHeaderMetadata::default())).unwrap();
    for position in 0..packages {
        writer.write_sample(0, &picture_data(position)).unwrap();
        writer.write_samples(1, &vec![0u8; 3840], 1920).unwrap();
    }
    writer.complete_write().unwrap();
    writer.into_inner().into_inner()
}

fn open(data: Vec<u8>) -> MxfDemuxer<Cursor<Vec<u8>>> {
    let mut demuxer = MxfDemuxer::open(Cursor::new(data), DemuxerConfig::default(), Logger::silent()).unwrap();
    for track in tracks() {
        demuxer.register_track(track).unwrap();
    }
    demuxer
}

fn interval_config() -> WriterConfig {
    WriterConfig {
        partition_interval: 3,
        ..Default::default()
    }
}

// =============================================================================
// Partition chain
// =============================================================================

#[test]
fn test_partition_chain_from_footer_matches_rip() {
    let data = write_file(interval_config(), 10, Logger::silent());
    let demuxer = open(data.clone());
    assert_eq!(demuxer.partition_source(), PartitionSource::Rip);

    let partitions = demuxer.partitions();
    assert_eq!(partitions.first().unwrap().kind, PartitionKind::Header);
    assert_eq!(partitions.last().unwrap().kind, PartitionKind::Footer);
    let footer = partitions.last().unwrap().this_partition;
    for pair in partitions.windows(2) {
        assert_eq!(pair[1].previous_partition, pair[0].this_partition);
    }
    assert!(partitions.iter().all(|p| p.footer_partition == footer && p.is_closed() && p.complete));

    let rip = demuxer.rip().unwrap();
    let offsets: Vec<u64> = partitions.iter().map(|p| p.this_partition).collect();
    let rip_offsets: Vec<u64> = rip.entries.iter().map(|e| e.this_partition).collect();
    assert_eq!(offsets, rip_offsets);

    let mut truncated = data;
    let rip_len = u32::from_be_bytes(truncated[truncated.len() - 4..].try_into().unwrap()) as usize;
    truncated.truncate(truncated.len() - rip_len);
    let chained = open(truncated);
    assert_eq!(chained.partition_source(), PartitionSource::FooterChain);
    let chained_offsets: Vec<u64> = chained.partitions().iter().map(|p| p.this_partition).collect();
    assert_eq!(chained_offsets, offsets);
}

#[test]
fn test_run_in_before_header() {
    let mut data = vec![0xAB; 100];
    data.extend(write_file(interval_config(), 7, Logger::silent()));

    let mut demuxer = open(data);
    assert_eq!(demuxer.run_in(), 100);
    assert_eq!(demuxer.partition_source(), PartitionSource::Rip);
    demuxer.seek(4, SeekMode::Exact).unwrap();
    let package = demuxer.read_content_package().unwrap().unwrap();
    assert_eq!(package.frame(0).unwrap().data, picture_data(4));
}

#[test]
fn test_missing_header_is_invalid_partition() {
    let data = vec![0u8; 4096];
    let result = MxfDemuxer::open(Cursor::new(data), DemuxerConfig::default(), Logger::silent());
    assert!(matches!(result, Err(MxfError::InvalidPartition(_))));
}

// =============================================================================
// Truncated files
// =============================================================================

#[test]
fn test_truncated_file_uses_forward_scan() {
    let data = write_file(WriterConfig::default(), 6, Logger::silent());
    let mut demuxer = open(data.clone());
    demuxer.seek(3, SeekMode::Exact).unwrap();
    let cut = demuxer.read_content_package().unwrap().unwrap().file_offset as usize + 30;

    let mut truncated = data;
    truncated.truncate(cut);
    let mut demuxer = open(truncated);
    assert_eq!(demuxer.partition_source(), PartitionSource::ForwardScan);
    // the only VBE index partition was after the cut
    assert!(demuxer.index().is_none());

    for position in 0..3 {
        let package = demuxer.read_content_package().unwrap().unwrap();
        assert_eq!(package.frame(0).unwrap().data, picture_data(position));
    }
    assert!(demuxer.read_content_package().unwrap().is_none());

    let result = demuxer.seek(5, SeekMode::Exact).unwrap();
    assert!(result.beyond_available);
    assert_eq!(result.position, 3);
}

// =============================================================================
// Logging
// =============================================================================

#[derive(Clone, Default)]
struct CapturedLog(Arc<Mutex<Vec<u8>>>);

impl CapturedLog {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for CapturedLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLog {
    type Writer = CapturedLog;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn capturing_logger(log: &CapturedLog) -> Logger {
    let subscriber = tracing_subscriber::fmt()
        .with_writer(log.clone())
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .finish();
    Logger::from_subscriber(subscriber)
}

#[test]
fn test_incomplete_package_is_logged_and_dropped() {
    let log = CapturedLog::default();
    let mut writer = MxfWriter::new(Cursor::new(Vec::new()), WriterConfig::default(), capturing_logger(&log)).unwrap();
    for track in tracks() {
        writer.register_track(track).unwrap();
    }
    writer.prepare_write(Box::new(OpaqueHeaderMetadata::default())).unwrap();
    writer.write_sample(0, &picture_data(0)).unwrap();
    writer.write_samples(1, &vec![0u8; 3840], 1920).unwrap();
    // picture without its sound
    writer.write_sample(0, &picture_data(1)).unwrap();
    writer.complete_write().unwrap();

    assert_eq!(writer.duration(), 1);
    let contents = log.contents();
    assert!(contents.contains("discarding incomplete content packages"), "{}", contents);
    assert!(contents.contains("write complete"));
}

#[test]
fn test_logger_is_explicit() {
    let log = CapturedLog::default();
    let data = write_file(WriterConfig::default(), 2, Logger::silent());
    assert!(log.contents().is_empty());

    let mut demuxer = MxfDemuxer::open(Cursor::new(data), DemuxerConfig::default(), capturing_logger(&log)).unwrap();
    demuxer.seek(1, SeekMode::Exact).unwrap();
    assert!(log.contents().contains("opened partitions"));
}
