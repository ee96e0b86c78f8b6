//! Safe view over the variable-length records returned by `GetLogicalProcessorInformationEx()`.
//!
//! The operating system returns `SYSTEM_LOGICAL_PROCESSOR_INFORMATION_EX` structures concatenated
//! back to back. Each one starts with its relationship kind and its own size in bytes, and the
//! size is the only reliable way to find the next one because the trailing group affinity array
//! has a variable length. Instead of casting pointers into the buffer we read the fields we need
//! from little-endian bytes with bounds checks, so a malformed buffer ends the scan instead of
//! reading out of bounds.

use crate::CoreIndex;
use crate::primitive_types::PROCESSORS_PER_GROUP;

/// `Relationship: u32` + `Size: u32`.
pub(crate) const RECORD_HEADER_LEN: usize = 8;

const RELATIONSHIP_OFFSET: usize = 0;
const SIZE_OFFSET: usize = 4;

// PROCESSOR_RELATIONSHIP, relative to the start of the record.
const FLAGS_OFFSET: usize = RECORD_HEADER_LEN;
const EFFICIENCY_CLASS_OFFSET: usize = RECORD_HEADER_LEN + 1;
const GROUP_COUNT_OFFSET: usize = RECORD_HEADER_LEN + 22;
pub(crate) const GROUP_MASKS_OFFSET: usize = RECORD_HEADER_LEN + 24;

/// `KAFFINITY` is pointer-sized.
const AFFINITY_MASK_LEN: usize = size_of::<usize>();

/// `Mask: KAFFINITY` + `Group: u16` + `Reserved: [u16; 3]`.
pub(crate) const GROUP_AFFINITY_LEN: usize = AFFINITY_MASK_LEN + 8;

fn read_u16(bytes: &[u8], offset: usize) -> Option<u16> {
    let end = offset.checked_add(2)?;
    Some(u16::from_le_bytes(bytes.get(offset..end)?.try_into().ok()?))
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let end = offset.checked_add(4)?;
    Some(u32::from_le_bytes(bytes.get(offset..end)?.try_into().ok()?))
}

fn read_mask(bytes: &[u8], offset: usize) -> Option<usize> {
    let end = offset.checked_add(AFFINITY_MASK_LEN)?;
    Some(usize::from_le_bytes(bytes.get(offset..end)?.try_into().ok()?))
}

/// Bounds-checked cursor over a buffer of concatenated topology records.
#[derive(Debug)]
pub(crate) struct RecordReader<'a> {
    remaining: &'a [u8],
    stopped_early: bool,
}

impl<'a> RecordReader<'a> {
    pub(crate) fn new(buffer: &'a [u8]) -> Self {
        Self {
            remaining: buffer,
            stopped_early: false,
        }
    }

    /// Number of bytes not yet consumed by [`next_record()`][Self::next_record]. After a
    /// malformed record, this includes the malformed record itself.
    pub(crate) fn remaining_len(&self) -> usize {
        self.remaining.len()
    }

    /// Whether the scan ended at a malformed record (zero or out-of-bounds size, truncated
    /// header) instead of at the natural end of the buffer.
    pub(crate) fn stopped_early(&self) -> bool {
        self.stopped_early
    }

    /// Advances past the next record and returns a view of it.
    ///
    /// Returns `None` at the end of the buffer and, permanently, after the first malformed
    /// record. A record that declares a size of zero would otherwise make us loop forever.
    pub(crate) fn next_record(&mut self) -> Option<Record<'a>> {
        if self.stopped_early || self.remaining.is_empty() {
            return None;
        }

        let Some(relationship) = read_u32(self.remaining, RELATIONSHIP_OFFSET) else {
            return self.stop();
        };

        let Some(size) = read_u32(self.remaining, SIZE_OFFSET)
            .and_then(|size| usize::try_from(size).ok())
        else {
            return self.stop();
        };

        if size < RECORD_HEADER_LEN || size > self.remaining.len() {
            return self.stop();
        }

        let (bytes, rest) = self.remaining.split_at(size);
        self.remaining = rest;

        Some(Record {
            relationship,
            bytes,
        })
    }

    fn stop(&mut self) -> Option<Record<'a>> {
        self.stopped_early = true;
        None
    }
}

impl<'a> Iterator for RecordReader<'a> {
    type Item = Record<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record()
    }
}

/// One record of any relationship kind.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Record<'a> {
    relationship: u32,

    // The whole record, header included.
    bytes: &'a [u8],
}

impl<'a> Record<'a> {
    pub(crate) fn relationship(&self) -> u32 {
        self.relationship
    }

    /// Views the record as a `PROCESSOR_RELATIONSHIP` if it is one of the given kind and is long
    /// enough to hold the fixed part of that structure.
    pub(crate) fn as_processor(&self, relationship: u32) -> Option<ProcessorRecord<'a>> {
        if self.relationship() != relationship || self.bytes.len() < GROUP_MASKS_OFFSET {
            return None;
        }

        Some(ProcessorRecord { bytes: self.bytes })
    }
}

/// A `PROCESSOR_RELATIONSHIP` record.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ProcessorRecord<'a> {
    bytes: &'a [u8],
}

impl<'a> ProcessorRecord<'a> {
    pub(crate) fn flags(&self) -> u8 {
        self.bytes.get(FLAGS_OFFSET).copied().unwrap_or_default()
    }

    pub(crate) fn efficiency_class(&self) -> u8 {
        self.bytes
            .get(EFFICIENCY_CLASS_OFFSET)
            .copied()
            .unwrap_or_default()
    }

    pub(crate) fn group_count(&self) -> u16 {
        read_u16(self.bytes, GROUP_COUNT_OFFSET).unwrap_or_default()
    }

    /// The group affinity entries of the record.
    ///
    /// Yields at most `GroupCount` entries and stops early if the record is too short to hold
    /// all of them.
    pub(crate) fn group_affinities(&self) -> impl Iterator<Item = GroupAffinity> + 'a {
        let bytes = self.bytes;

        (0..usize::from(self.group_count()))
            .map_while(move |index| {
                let offset = index
                    .checked_mul(GROUP_AFFINITY_LEN)?
                    .checked_add(GROUP_MASKS_OFFSET)?;

                Some(GroupAffinity {
                    mask: read_mask(bytes, offset)?,
                    group: read_u16(bytes, offset.checked_add(AFFINITY_MASK_LEN)?)?,
                })
            })
    }
}

/// A processor group number plus a mask of processors within that group.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct GroupAffinity {
    pub(crate) mask: usize,
    pub(crate) group: u16,
}

impl GroupAffinity {
    /// Global indexes of the processors whose bits are set, in ascending order.
    pub(crate) fn processor_indexes(&self) -> impl Iterator<Item = CoreIndex> {
        let mask = self.mask;
        let group_start = u32::from(self.group).saturating_mul(PROCESSORS_PER_GROUP);

        (0..usize::BITS)
            .filter(move |bit| mask & (1 << bit) != 0)
            .map(move |bit| group_start.saturating_add(bit))
    }
}

/// Assembles raw topology buffers in the layout the operating system uses.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct TopologyBufferBuilder {
    bytes: Vec<u8>,
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
impl TopologyBufferBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends a processor core record with the given flags and `(group, mask)` entries.
    pub(crate) fn processor_core(self, flags: u8, groups: &[(u16, usize)]) -> Self {
        self.processor_record(crate::pal::RELATION_PROCESSOR_CORE, flags, groups)
    }

    pub(crate) fn processor_record(
        mut self,
        relationship: u32,
        flags: u8,
        groups: &[(u16, usize)],
    ) -> Self {
        // The structure definition always has room for one entry, even if unused.
        let size = GROUP_MASKS_OFFSET + groups.len().max(1) * GROUP_AFFINITY_LEN;

        let mut record = vec![0_u8; size];
        record[RELATIONSHIP_OFFSET..RELATIONSHIP_OFFSET + 4]
            .copy_from_slice(&relationship.to_le_bytes());
        record[SIZE_OFFSET..SIZE_OFFSET + 4]
            .copy_from_slice(&u32::try_from(size).unwrap().to_le_bytes());
        record[FLAGS_OFFSET] = flags;
        record[GROUP_COUNT_OFFSET..GROUP_COUNT_OFFSET + 2]
            .copy_from_slice(&u16::try_from(groups.len()).unwrap().to_le_bytes());

        for (index, (group, mask)) in groups.iter().enumerate() {
            let offset = GROUP_MASKS_OFFSET + index * GROUP_AFFINITY_LEN;
            record[offset..offset + AFFINITY_MASK_LEN].copy_from_slice(&mask.to_le_bytes());
            record[offset + AFFINITY_MASK_LEN..offset + AFFINITY_MASK_LEN + 2]
                .copy_from_slice(&group.to_le_bytes());
        }

        self.bytes.extend_from_slice(&record);
        self
    }

    /// Appends a record header that declares `declared_size` bytes, followed by `padding` zero
    /// bytes, regardless of whether the two agree.
    pub(crate) fn raw_header(
        mut self,
        relationship: u32,
        declared_size: u32,
        padding: usize,
    ) -> Self {
        self.bytes.extend_from_slice(&relationship.to_le_bytes());
        self.bytes.extend_from_slice(&declared_size.to_le_bytes());
        self.bytes.extend(std::iter::repeat_n(0_u8, padding));
        self
    }

    pub(crate) fn build(self) -> Vec<u8> {
        self.bytes
    }
}
