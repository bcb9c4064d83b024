//! Content package assembly.
//!
//! Samples arrive per track; a content package is complete once every track
//! has supplied the number of samples its sequence asks for at that
//! position. Complete packages leave in position order.

use std::collections::VecDeque;
use std::io::Write;

use crate::error::{MxfError, Result};
use crate::index::IndexTableWriter;
use crate::klv::{self, KEY_LEN};
use crate::track::{TrackKind, TrackRegistration};
use crate::ul::UniversalLabel;

/// Length of the BER length of every essence element
pub const ELEMENT_LLEN: u8 = 4;

const ELEMENT_HEADER_LEN: u32 = KEY_LEN as u32 + ELEMENT_LLEN as u32;

#[derive(Debug, Clone)]
struct ElementLayout {
    track_index: u32,
    key: UniversalLabel,
    kind: TrackKind,
    sample_size: Option<u32>,
    sequence: Vec<u32>,
    // constant write size for sound elements, 0 otherwise
    fixed_element_size: u32,
}

impl ElementLayout {
    fn samples_at(&self, position: i64) -> u32 {
        self.sequence[(position as u64 % self.sequence.len() as u64) as usize]
    }
}

#[derive(Debug, Clone, Default)]
struct ElementData {
    data: Vec<u8>,
    samples_written: u32,
    samples_expected: u32,
}

impl ElementData {
    fn is_complete(&self) -> bool {
        self.samples_written >= self.samples_expected
    }
}

#[derive(Debug, Clone)]
struct PackageData {
    position: i64,
    elements: Vec<ElementData>,
    indexed: bool,
}

impl PackageData {
    fn is_complete(&self) -> bool {
        self.elements.iter().all(ElementData::is_complete)
    }
}

/// Groups per-track samples into interleaved content packages
#[derive(Debug, Clone)]
pub struct ContentPackageAssembler {
    kag_size: u32,
    min_llen: u8,
    max_buffered: usize,
    elements: Vec<ElementLayout>,
    packages: VecDeque<PackageData>,
    position: i64,
}

impl ContentPackageAssembler {
    pub fn new(kag_size: u32, min_llen: u8, max_buffered: usize) -> Self {
        ContentPackageAssembler {
            kag_size: kag_size.max(1),
            min_llen,
            max_buffered: max_buffered.max(1),
            elements: Vec::new(),
            packages: VecDeque::new(),
            position: 0,
        }
    }

    /// Element size after padding to the KAG; a filler needs room for its key
    /// and length.
    pub fn kag_aligned_size(&self, data_size: u32) -> u32 {
        let rem = data_size % self.kag_size;
        if rem == 0 {
            return data_size;
        }
        let mut fill = self.kag_size - rem;
        while fill < KEY_LEN as u32 + self.min_llen as u32 {
            fill += self.kag_size;
        }
        data_size + fill
    }

    pub fn register(&mut self, track: &TrackRegistration) -> Result<()> {
        if self.elements.iter().any(|e| e.track_index == track.track_index) {
            return Err(MxfError::InvalidConfig(format!(
                "track {} registered twice",
                track.track_index
            )));
        }

        let mut fixed_element_size = 0;
        if let (TrackKind::Sound, Some(block_align)) = (track.kind, track.fixed_sample_size) {
            let sequence = track.sequence();
            let max_count = sequence.max_count();
            fixed_element_size = self.kag_aligned_size(ELEMENT_HEADER_LEN + max_count * block_align);
            if sequence.second_max_count().is_some() {
                // smaller elements need a filler after the data
                let with_fill = self.kag_aligned_size(
                    ELEMENT_HEADER_LEN + max_count * block_align + KEY_LEN as u32 + self.min_llen as u32,
                );
                fixed_element_size = fixed_element_size.max(with_fill);
            }
        }

        self.elements.push(ElementLayout {
            track_index: track.track_index,
            key: track.element_key,
            kind: track.kind,
            sample_size: track.fixed_sample_size,
            sequence: track.sample_sequence.clone(),
            fixed_element_size,
        });
        Ok(())
    }

    /// Order elements for emission and check the sound sequences agree
    pub fn prepare(&mut self) -> Result<()> {
        self.elements.sort_by_key(|e| e.kind.emission_rank());
        let mut sound = self.elements.iter().filter(|e| e.kind == TrackKind::Sound);
        if let Some(first) = sound.next() {
            if let Some(other) = sound.find(|e| e.sequence != first.sequence) {
                return Err(MxfError::InvalidConfig(format!(
                    "sound tracks {} and {} have different sample sequences",
                    first.track_index, other.track_index
                )));
            }
        }
        Ok(())
    }

    /// Position of the oldest package not yet written
    pub fn position(&self) -> i64 {
        self.position
    }

    /// Track indexes in emission order
    pub fn element_order(&self) -> Vec<u32> {
        self.elements.iter().map(|e| e.track_index).collect()
    }

    fn element_index(&self, track_index: u32) -> Result<usize> {
        self.elements
            .iter()
            .position(|e| e.track_index == track_index)
            .ok_or(MxfError::InvalidTrack(track_index))
    }

    fn first_incomplete(&self, element: usize) -> usize {
        self.packages
            .iter()
            .position(|p| !p.elements[element].is_complete())
            .unwrap_or(self.packages.len())
    }

    /// Position of the package the next sample of `track_index` goes into
    pub fn next_position(&self, track_index: u32) -> Result<i64> {
        let element = self.element_index(track_index)?;
        Ok(self.position + self.first_incomplete(element) as i64)
    }

    fn new_package(&self, position: i64) -> PackageData {
        PackageData {
            position,
            elements: self
                .elements
                .iter()
                .map(|e| ElementData {
                    samples_expected: e.samples_at(position),
                    ..Default::default()
                })
                .collect(),
            indexed: false,
        }
    }

    /// Add `num_samples` samples, splitting them across packages following
    /// the track's sample sequence
    pub fn write_samples(&mut self, track_index: u32, data: &[u8], num_samples: u32) -> Result<()> {
        let element = self.element_index(track_index)?;
        if num_samples == 0 {
            return Err(MxfError::OutOfSequence {
                track_index,
                message: "no samples supplied".into(),
            });
        }

        let layout = &self.elements[element];
        let sample_size = match layout.sample_size {
            Some(size) => {
                if data.len() as u64 != size as u64 * num_samples as u64 {
                    return Err(MxfError::SampleSizeMismatch {
                        track_index,
                        expected: size as u64 * num_samples as u64,
                        actual: data.len() as u64,
                    });
                }
                size as usize
            }
            None => {
                if data.len() % num_samples as usize != 0 {
                    return Err(MxfError::SampleSizeMismatch {
                        track_index,
                        expected: (data.len() / num_samples as usize * num_samples as usize) as u64,
                        actual: data.len() as u64,
                    });
                }
                data.len() / num_samples as usize
            }
        };

        let first = self.first_incomplete(element);
        self.check_room_from(element, track_index, first, num_samples)?;

        let mut offset = 0;
        let mut remaining = num_samples;
        let mut index = first;
        while remaining > 0 {
            if index >= self.packages.len() {
                let package = self.new_package(self.position + index as i64);
                self.packages.push_back(package);
            }
            let target = &mut self.packages[index].elements[element];
            let take = (target.samples_expected - target.samples_written).min(remaining);
            let size = take as usize * sample_size;
            target.data.extend_from_slice(&data[offset..offset + size]);
            target.samples_written += take;
            offset += size;
            remaining -= take;
            index += 1;
        }
        Ok(())
    }

    /// Fail with `OutOfSequence` if `num_samples` more samples of the track
    /// would run more than the buffered package limit ahead
    pub fn check_room(&self, track_index: u32, num_samples: u32) -> Result<()> {
        let element = self.element_index(track_index)?;
        self.check_room_from(element, track_index, self.first_incomplete(element), num_samples)
    }

    fn check_room_from(&self, element: usize, track_index: u32, first: usize, num_samples: u32) -> Result<()> {
        let layout = &self.elements[element];
        let mut index = first;
        let mut remaining = num_samples;
        loop {
            let (expected, written) = match self.packages.get(index) {
                Some(p) => (p.elements[element].samples_expected, p.elements[element].samples_written),
                None => (layout.samples_at(self.position + index as i64), 0),
            };
            remaining -= (expected - written).min(remaining);
            if remaining == 0 {
                break;
            }
            index += 1;
        }
        if index >= self.max_buffered {
            return Err(MxfError::OutOfSequence {
                track_index,
                message: format!(
                    "sample for position {} is more than {} content packages ahead of position {}",
                    self.position + index as i64,
                    self.max_buffered,
                    self.position
                ),
            });
        }
        Ok(())
    }

    /// Add a single sample
    pub fn write_sample(&mut self, track_index: u32, data: &[u8]) -> Result<()> {
        self.write_samples(track_index, data, 1)
    }

    /// The oldest package is complete and can be written
    pub fn have_complete_package(&self) -> bool {
        self.packages.front().map_or(false, PackageData::is_complete)
    }

    fn write_size(&self, layout: &ElementLayout, data: &ElementData) -> u32 {
        if layout.fixed_element_size > 0 {
            layout.fixed_element_size
        } else {
            self.kag_aligned_size(ELEMENT_HEADER_LEN + data.data.len() as u32)
        }
    }

    /// Add the oldest package to the index if it has not been indexed yet
    pub fn index_front(&mut self, index: &mut IndexTableWriter) -> Result<()> {
        let package = self
            .packages
            .front()
            .ok_or_else(|| MxfError::Other("no content package to index".into()))?;
        if package.indexed {
            return Ok(());
        }
        if !package.is_complete() {
            return Err(MxfError::Other(format!("content package {} is incomplete", package.position)));
        }

        let sizes = index
            .element_order()
            .iter()
            .map(|&track_index| {
                let element = self.element_index(track_index)?;
                Ok(self.write_size(&self.elements[element], &package.elements[element]))
            })
            .collect::<Result<Vec<u32>>>()?;
        let total: u32 = sizes.iter().sum();
        index.update_index(total, &sizes)?;

        if let Some(package) = self.packages.front_mut() {
            package.indexed = true;
        }
        Ok(())
    }

    /// Index and write the oldest package, returning its position
    pub fn write_front<W: Write>(&mut self, writer: &mut W, index: &mut IndexTableWriter) -> Result<i64> {
        self.index_front(index)?;
        let package = self
            .packages
            .pop_front()
            .ok_or_else(|| MxfError::Other("no content package to write".into()))?;

        for (layout, element) in self.elements.iter().zip(&package.elements) {
            let len = element.data.len() as u32;
            klv::write_fixed_kl(writer, &layout.key, ELEMENT_LLEN, len as u64)?;
            writer.write_all(&element.data)?;
            let write_size = self.write_size(layout, element);
            let used = ELEMENT_HEADER_LEN + len;
            if write_size > used {
                klv::write_fill(writer, (write_size - used) as u64, self.min_llen)?;
            } else if write_size < used {
                return Err(MxfError::SampleSizeMismatch {
                    track_index: layout.track_index,
                    expected: (write_size - ELEMENT_HEADER_LEN) as u64,
                    actual: len as u64,
                });
            }
        }

        self.position += 1;
        Ok(package.position)
    }

    /// Drop every package that was never completed
    pub fn discard_incomplete(&mut self) -> usize {
        let count = self.packages.len();
        self.packages.clear();
        count
    }
}
