//! Header metadata boundary.
//!
//! The writer treats header metadata as an opaque block rendered by a
//! [`HeaderMetadata`] implementation, once when the header partition is
//! first written and again at completion with the final duration. The
//! second rendering must fit into the space reserved by the first.

use byteorder::{BigEndian, WriteBytesExt};

use crate::error::Result;
use crate::klv::{self, write_local_item};
use crate::track::{TrackKind, TrackRegistration};
use crate::types::{EditRate, InstanceUid, Timestamp, Umid};
use crate::ul::{labels, UniversalLabel};

/// Container state handed to header metadata renderers
#[derive(Debug, Clone, Copy)]
pub struct MetadataContext<'a> {
    pub edit_rate: EditRate,
    /// Duration in edit units, 0 before completion
    pub duration: i64,
    pub operational_pattern: UniversalLabel,
    pub essence_containers: &'a [UniversalLabel],
    /// Registered tracks in content package order
    pub tracks: &'a [TrackRegistration],
    pub body_sid: u32,
    pub index_sid: u32,
}

/// Renders the header metadata block (primer pack and metadata sets)
pub trait HeaderMetadata {
    fn encode(&mut self, context: &MetadataContext<'_>) -> Result<Vec<u8>>;
}

/// Header metadata supplied as ready-made bytes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpaqueHeaderMetadata(pub Vec<u8>);

impl HeaderMetadata for OpaqueHeaderMetadata {
    fn encode(&mut self, _context: &MetadataContext<'_>) -> Result<Vec<u8>> {
        Ok(self.0.clone())
    }
}

mod tag {
    pub const INSTANCE_UID: u16 = 0x3c0a;
    pub const LAST_MODIFIED_DATE: u16 = 0x3b02;
    pub const CONTENT_STORAGE: u16 = 0x3b03;
    pub const VERSION: u16 = 0x3b05;
    pub const OPERATIONAL_PATTERN: u16 = 0x3b09;
    pub const ESSENCE_CONTAINERS: u16 = 0x3b0a;
    pub const DM_SCHEMES: u16 = 0x3b0b;
    pub const PACKAGES: u16 = 0x1901;
    pub const PACKAGE_UID: u16 = 0x4401;
    pub const TRACKS: u16 = 0x4403;
    pub const PACKAGE_MODIFIED_DATE: u16 = 0x4404;
    pub const PACKAGE_CREATION_DATE: u16 = 0x4405;
    pub const TRACK_ID: u16 = 0x4801;
    pub const SEQUENCE: u16 = 0x4803;
    pub const TRACK_NUMBER: u16 = 0x4804;
    pub const EDIT_RATE: u16 = 0x4b01;
    pub const ORIGIN: u16 = 0x4b02;
    pub const DATA_DEFINITION: u16 = 0x0201;
    pub const DURATION: u16 = 0x0202;
}

const fn ul(b: [u8; 12]) -> [u8; 16] {
    [
        0x06, 0x0e, 0x2b, 0x34, b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11],
    ]
}

const PRIMER_ENTRIES: &[(u16, [u8; 16])] = &[
    (tag::INSTANCE_UID, ul([0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x15, 0x02, 0, 0, 0, 0])),
    (tag::LAST_MODIFIED_DATE, ul([0x01, 0x01, 0x01, 0x02, 0x07, 0x02, 0x01, 0x10, 0x02, 0x04, 0, 0])),
    (tag::CONTENT_STORAGE, ul([0x01, 0x01, 0x01, 0x02, 0x06, 0x01, 0x01, 0x04, 0x02, 0x01, 0, 0])),
    (tag::VERSION, ul([0x01, 0x01, 0x01, 0x02, 0x03, 0x01, 0x02, 0x01, 0x05, 0, 0, 0])),
    (tag::OPERATIONAL_PATTERN, ul([0x01, 0x01, 0x01, 0x05, 0x01, 0x02, 0x02, 0x03, 0, 0, 0, 0])),
    (tag::ESSENCE_CONTAINERS, ul([0x01, 0x01, 0x01, 0x05, 0x01, 0x02, 0x02, 0x10, 0x02, 0x01, 0, 0])),
    (tag::DM_SCHEMES, ul([0x01, 0x01, 0x01, 0x05, 0x01, 0x02, 0x02, 0x10, 0x02, 0x02, 0, 0])),
    (tag::PACKAGES, ul([0x01, 0x01, 0x01, 0x02, 0x06, 0x01, 0x01, 0x04, 0x05, 0x01, 0, 0])),
    (tag::PACKAGE_UID, ul([0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x15, 0x10, 0, 0, 0, 0])),
    (tag::TRACKS, ul([0x01, 0x01, 0x01, 0x02, 0x06, 0x01, 0x01, 0x04, 0x06, 0x05, 0, 0])),
    (tag::PACKAGE_MODIFIED_DATE, ul([0x01, 0x01, 0x01, 0x02, 0x07, 0x02, 0x01, 0x10, 0x02, 0x05, 0, 0])),
    (tag::PACKAGE_CREATION_DATE, ul([0x01, 0x01, 0x01, 0x02, 0x07, 0x02, 0x01, 0x10, 0x01, 0x03, 0, 0])),
    (tag::TRACK_ID, ul([0x01, 0x01, 0x01, 0x02, 0x01, 0x07, 0x01, 0x01, 0, 0, 0, 0])),
    (tag::SEQUENCE, ul([0x01, 0x01, 0x01, 0x02, 0x06, 0x01, 0x01, 0x04, 0x02, 0x04, 0, 0])),
    (tag::TRACK_NUMBER, ul([0x01, 0x01, 0x01, 0x02, 0x01, 0x04, 0x01, 0x03, 0, 0, 0, 0])),
    (tag::EDIT_RATE, ul([0x01, 0x01, 0x01, 0x02, 0x05, 0x30, 0x04, 0x05, 0, 0, 0, 0])),
    (tag::ORIGIN, ul([0x01, 0x01, 0x01, 0x02, 0x07, 0x02, 0x01, 0x03, 0x01, 0x03, 0, 0])),
    (tag::DATA_DEFINITION, ul([0x01, 0x01, 0x01, 0x02, 0x04, 0x07, 0x01, 0, 0, 0, 0, 0])),
    (tag::DURATION, ul([0x01, 0x01, 0x01, 0x02, 0x07, 0x02, 0x02, 0x01, 0x01, 0, 0, 0])),
];

// sets are written with a fixed 4 byte length
const SET_LLEN: u8 = 4;

struct SetBuilder {
    value: Vec<u8>,
}

impl SetBuilder {
    fn new(instance_uid: &InstanceUid) -> Result<Self> {
        let mut builder = SetBuilder { value: Vec::new() };
        builder.bytes(tag::INSTANCE_UID, instance_uid.as_bytes())?;
        Ok(builder)
    }

    fn bytes(&mut self, tag: u16, value: &[u8]) -> Result<&mut Self> {
        write_local_item(&mut self.value, tag, value)?;
        Ok(self)
    }

    fn u32(&mut self, tag: u16, value: u32) -> Result<&mut Self> {
        self.bytes(tag, &value.to_be_bytes())
    }

    fn i64(&mut self, tag: u16, value: i64) -> Result<&mut Self> {
        self.bytes(tag, &value.to_be_bytes())
    }

    fn batch<'a, I>(&mut self, tag: u16, item_len: u32, items: I) -> Result<&mut Self>
    where
        I: ExactSizeIterator<Item = &'a [u8]>,
    {
        let mut value = Vec::with_capacity(8 + items.len() * item_len as usize);
        value.write_u32::<BigEndian>(items.len() as u32)?;
        value.write_u32::<BigEndian>(item_len)?;
        for item in items {
            value.extend_from_slice(item);
        }
        self.bytes(tag, &value)
    }

    fn finish(&self, out: &mut Vec<u8>, key: &UniversalLabel) -> Result<()> {
        klv::write_fixed_kl(out, key, SET_LLEN, self.value.len() as u64)?;
        out.extend_from_slice(&self.value);
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct TrackUids {
    material_track: InstanceUid,
    material_sequence: InstanceUid,
    file_track: InstanceUid,
    file_sequence: InstanceUid,
}

impl TrackUids {
    fn generate() -> Self {
        TrackUids {
            material_track: InstanceUid::generate(),
            material_sequence: InstanceUid::generate(),
            file_track: InstanceUid::generate(),
            file_sequence: InstanceUid::generate(),
        }
    }
}

/// Structural metadata for an OP1a file: preface, content storage and a
/// material package referencing one file source package, each with one
/// timeline track per registered track.
///
/// Identifiers are generated once so every rendering has the same size.
#[derive(Debug, Clone)]
pub struct MinimalHeaderMetadata {
    preface_uid: InstanceUid,
    content_storage_uid: InstanceUid,
    material_package_uid: InstanceUid,
    file_package_uid: InstanceUid,
    pub material_package: Umid,
    pub file_package: Umid,
    pub creation_date: Timestamp,
    track_uids: Vec<TrackUids>,
}

impl Default for MinimalHeaderMetadata {
    fn default() -> Self {
        MinimalHeaderMetadata::new(Timestamp::now())
    }
}

impl MinimalHeaderMetadata {
    pub fn new(creation_date: Timestamp) -> Self {
        MinimalHeaderMetadata {
            preface_uid: InstanceUid::generate(),
            content_storage_uid: InstanceUid::generate(),
            material_package_uid: InstanceUid::generate(),
            file_package_uid: InstanceUid::generate(),
            material_package: Umid::generate(),
            file_package: Umid::generate(),
            creation_date,
            track_uids: Vec::new(),
        }
    }

    fn write_primer(out: &mut Vec<u8>) -> Result<()> {
        let len = 8 + PRIMER_ENTRIES.len() * 18;
        klv::write_fixed_kl(out, &labels::PRIMER_PACK, SET_LLEN, len as u64)?;
        out.write_u32::<BigEndian>(PRIMER_ENTRIES.len() as u32)?;
        out.write_u32::<BigEndian>(18)?;
        for (local_tag, ul) in PRIMER_ENTRIES {
            out.write_u16::<BigEndian>(*local_tag)?;
            out.extend_from_slice(ul);
        }
        Ok(())
    }

    fn write_track(
        out: &mut Vec<u8>,
        track_uid: &InstanceUid,
        sequence_uid: &InstanceUid,
        track_id: u32,
        track_number: u32,
        kind: TrackKind,
        context: &MetadataContext<'_>,
    ) -> Result<()> {
        let mut edit_rate = Vec::with_capacity(8);
        context.edit_rate.write(&mut edit_rate)?;
        SetBuilder::new(track_uid)?
            .u32(tag::TRACK_ID, track_id)?
            .u32(tag::TRACK_NUMBER, track_number)?
            .bytes(tag::EDIT_RATE, &edit_rate)?
            .i64(tag::ORIGIN, 0)?
            .bytes(tag::SEQUENCE, sequence_uid.as_bytes())?
            .finish(out, &labels::TIMELINE_TRACK)?;

        let data_definition = match kind {
            TrackKind::Picture => labels::DATA_DEF_PICTURE,
            TrackKind::Sound => labels::DATA_DEF_SOUND,
            TrackKind::Data => labels::DATA_DEF_DATA,
        };
        SetBuilder::new(sequence_uid)?
            .bytes(tag::DATA_DEFINITION, data_definition.as_bytes())?
            .i64(tag::DURATION, context.duration.max(0))?
            .finish(out, &labels::SEQUENCE)
    }
}

impl HeaderMetadata for MinimalHeaderMetadata {
    fn encode(&mut self, context: &MetadataContext<'_>) -> Result<Vec<u8>> {
        while self.track_uids.len() < context.tracks.len() {
            self.track_uids.push(TrackUids::generate());
        }
        let track_uids = &self.track_uids[..context.tracks.len()];
        let date = self.creation_date.to_bytes();

        let mut out = Vec::new();
        Self::write_primer(&mut out)?;

        SetBuilder::new(&self.preface_uid)?
            .bytes(tag::LAST_MODIFIED_DATE, &date)?
            .bytes(tag::VERSION, &[0x01, 0x03])?
            .bytes(tag::CONTENT_STORAGE, self.content_storage_uid.as_bytes())?
            .bytes(tag::OPERATIONAL_PATTERN, context.operational_pattern.as_bytes())?
            .batch(
                tag::ESSENCE_CONTAINERS,
                16,
                context.essence_containers.iter().map(|ec| &ec.as_bytes()[..]),
            )?
            .batch(tag::DM_SCHEMES, 16, std::iter::empty())?
            .finish(&mut out, &labels::PREFACE)?;

        SetBuilder::new(&self.content_storage_uid)?
            .batch(
                tag::PACKAGES,
                16,
                [&self.material_package_uid, &self.file_package_uid]
                    .into_iter()
                    .map(|uid| &uid.as_bytes()[..]),
            )?
            .finish(&mut out, &labels::CONTENT_STORAGE)?;

        let packages = [
            (
                &self.material_package_uid,
                &self.material_package,
                labels::MATERIAL_PACKAGE,
            ),
            (&self.file_package_uid, &self.file_package, labels::SOURCE_PACKAGE),
        ];
        for (index, (package_uid, umid, key)) in packages.into_iter().enumerate() {
            let is_material = index == 0;
            let tracks: Vec<&InstanceUid> = track_uids
                .iter()
                .map(|t| if is_material { &t.material_track } else { &t.file_track })
                .collect();
            SetBuilder::new(package_uid)?
                .bytes(tag::PACKAGE_UID, &umid.0)?
                .bytes(tag::PACKAGE_CREATION_DATE, &date)?
                .bytes(tag::PACKAGE_MODIFIED_DATE, &date)?
                .batch(tag::TRACKS, 16, tracks.iter().map(|uid| &uid.as_bytes()[..]))?
                .finish(&mut out, &key)?;

            for (i, (track, uids)) in context.tracks.iter().zip(track_uids).enumerate() {
                let (track_uid, sequence_uid, track_number) = if is_material {
                    (&uids.material_track, &uids.material_sequence, 0)
                } else {
                    (&uids.file_track, &uids.file_sequence, track.element_key.track_number())
                };
                Self::write_track(
                    &mut out,
                    track_uid,
                    sequence_uid,
                    i as u32 + 1,
                    track_number,
                    track.kind,
                    context,
                )?;
            }
        }

        Ok(out)
    }
}
