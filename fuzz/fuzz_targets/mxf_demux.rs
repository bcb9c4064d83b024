#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use mxf_engine::{DemuxerConfig, Logger, MxfDemuxer, SeekMode};
use std::io::Cursor;

#[derive(Arbitrary, Debug)]
struct DemuxInput {
    data: Vec<u8>,
    seeks: Vec<(i64, bool)>,
}

fuzz_target!(|input: DemuxInput| {
    if input.data.len() > 1024 * 1024 {
        return;
    }

    let cursor = Cursor::new(input.data);
    let mut demuxer = match MxfDemuxer::open(cursor, DemuxerConfig::default(), Logger::silent()) {
        Ok(demuxer) => demuxer,
        Err(_) => return,
    };
    let _ = demuxer.duration();
    let _ = demuxer.header_metadata();
    if demuxer.discover_tracks().is_err() {
        return;
    }

    for _ in 0..8 {
        match demuxer.read_content_package() {
            Ok(Some(_)) => {}
            _ => break,
        }
    }

    for (position, precharge) in input.seeks.into_iter().take(16) {
        let mode = if precharge { SeekMode::Precharge } else { SeekMode::Exact };
        if demuxer.seek(position % 100_000, mode).is_ok() {
            let _ = demuxer.read_content_package();
        }
    }
});
