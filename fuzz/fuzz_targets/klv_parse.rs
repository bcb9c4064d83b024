#![no_main]

//! Fuzz target for KLV coding.
//!
//! Feeds arbitrary bytes to the BER length decoder, the KLV reader, the
//! partition pack parser and the index table segment parser.

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use mxf_engine::index::IndexTableSegment;
use mxf_engine::klv::{self, KlvReader};
use mxf_engine::{Logger, Partition, RandomIndexPack};
use std::io::Cursor;

#[derive(Arbitrary, Debug)]
struct KlvInput {
    data: Vec<u8>,
    operation: KlvOperation,
}

#[derive(Arbitrary, Debug)]
enum KlvOperation {
    /// Decode a BER length
    DecodeBer,
    /// Encode then decode a length with a fixed length-of-length
    FixedBerRoundtrip { length: u64, llen: u8 },
    /// Walk a buffer of KLV triplets
    ReadTriplets,
    /// Parse a partition pack
    ReadPartition,
    /// Parse a random index pack from the end of the buffer
    ReadRip,
    /// Parse an index table segment value
    ParseIndexSegment,
}

fuzz_target!(|input: KlvInput| {
    if input.data.len() > 64 * 1024 {
        return;
    }
    let logger = Logger::silent();

    match input.operation {
        KlvOperation::DecodeBer => {
            let _ = klv::decode_ber_length(&input.data);
        }

        KlvOperation::FixedBerRoundtrip { length, llen } => {
            if let Ok(encoded) = klv::encode_fixed_ber_length(length, llen) {
                let (decoded, used) = klv::decode_ber_length(&encoded).expect("encoded length decodes");
                assert_eq!(decoded, length);
                assert_eq!(used as usize, encoded.len());
            }
        }

        KlvOperation::ReadTriplets => {
            let mut reader = KlvReader::new(&input.data);
            while let Ok(Some(_)) = reader.read_klv() {}
        }

        KlvOperation::ReadPartition => {
            let mut cursor = Cursor::new(&input.data);
            if let Ok(kl) = klv::read_kl(&mut cursor) {
                if kl.key.is_partition_pack() {
                    let _ = Partition::read(&mut cursor, &kl, &logger);
                }
            }
        }

        KlvOperation::ReadRip => {
            let mut cursor = Cursor::new(&input.data);
            let _ = RandomIndexPack::read(&mut cursor);
        }

        KlvOperation::ParseIndexSegment => {
            let _ = IndexTableSegment::parse(&input.data, &logger);
        }
    }
});
