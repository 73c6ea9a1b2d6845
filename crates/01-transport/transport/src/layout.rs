//! Placement of buffers, metadata and flags inside a port's memory.
//!
//! Output memory:
//! ```text
//! data    slot * pitch
//! meta    (slot * destinations + dst) * 16      staged records, one per destination
//! full    one word holding FULL_FLAG            source of every full-flag write
//! empty   (dst * dst_slots + dst_slot) * 8      written by consumers; word 0 of a
//!                                               destination's row is its release count
//! ```
//! Input memory repeats one block per lane (source rank):
//! ```text
//! data    slot * pitch
//! meta    slot * 16
//! full    slot * 8                              written by the producer
//! empty   slot * 8                              source of per-slot doorbells
//! count   one word                              source of count doorbells
//! ```

use xfer::FLAG_SIZE;

use crate::buffer::META_RECORD_SIZE;

pub(crate) const BUFFER_ALIGNMENT: u64 = 64;
pub(crate) const FULL_FLAG: u64 = 1;
pub(crate) const EMPTY_FLAG: u64 = 1;
const ENDPOINT_GRANULE: u64 = 4096;

fn align_up(value: u64, align: u64) -> Option<u64> {
    value.checked_add(align - 1).map(|v| v / align * align)
}

/// Size to request for an endpoint holding `total` bytes.
pub(crate) fn endpoint_size(total: u64) -> Option<u64> {
    align_up(total.max(1), ENDPOINT_GRANULE)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct OutputLayout {
    pub(crate) buffer_count: u32,
    pub(crate) pitch: u64,
    pub(crate) destinations: u32,
    dst_slots: u32,
    meta: u64,
    full: u64,
    empty: u64,
    pub(crate) total: u64,
}

impl OutputLayout {
    /// `dst_slots` is the largest buffer count of any destination.
    pub(crate) fn new(buffer_count: u32, buffer_length: u32, destinations: u32, dst_slots: u32) -> Option<Self> {
        let count = u64::from(buffer_count);
        let pitch = align_up(u64::from(buffer_length), BUFFER_ALIGNMENT)?;
        let meta = count.checked_mul(pitch)?;
        let meta_len = count
            .checked_mul(u64::from(destinations))?
            .checked_mul(META_RECORD_SIZE)?;
        let full = align_up(meta.checked_add(meta_len)?, BUFFER_ALIGNMENT)?;
        let empty = full.checked_add(BUFFER_ALIGNMENT)?;
        let empty_len = u64::from(destinations)
            .checked_mul(u64::from(dst_slots.max(1)))?
            .checked_mul(FLAG_SIZE)?;
        let total = align_up(empty.checked_add(empty_len)?, BUFFER_ALIGNMENT)?;
        Some(Self {
            buffer_count,
            pitch,
            destinations,
            dst_slots: dst_slots.max(1),
            meta,
            full,
            empty,
            total,
        })
    }

    pub(crate) fn data_offset(&self, slot: u32) -> u64 {
        u64::from(slot) * self.pitch
    }

    pub(crate) fn meta_offset(&self, slot: u32, dst: usize) -> u64 {
        self.meta + (u64::from(slot) * u64::from(self.destinations) + dst as u64) * META_RECORD_SIZE
    }

    pub(crate) fn meta_pitch(&self) -> u64 {
        u64::from(self.destinations) * META_RECORD_SIZE
    }

    pub(crate) fn full_value_offset(&self) -> u64 {
        self.full
    }

    pub(crate) fn empty_flag_offset(&self, dst: usize, dst_slot: u32) -> u64 {
        self.empty + (dst as u64 * u64::from(self.dst_slots) + u64::from(dst_slot)) * FLAG_SIZE
    }

    pub(crate) fn release_count_offset(&self, dst: usize) -> u64 {
        self.empty_flag_offset(dst, 0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct InputLayout {
    pub(crate) buffer_count: u32,
    pub(crate) pitch: u64,
    pub(crate) lanes: u32,
    lane_stride: u64,
    meta: u64,
    full: u64,
    empty: u64,
    count: u64,
    pub(crate) total: u64,
}

impl InputLayout {
    pub(crate) fn new(buffer_count: u32, buffer_length: u32, lanes: u32) -> Option<Self> {
        let n = u64::from(buffer_count);
        let pitch = align_up(u64::from(buffer_length), BUFFER_ALIGNMENT)?;
        let meta = n.checked_mul(pitch)?;
        let full = align_up(meta.checked_add(n.checked_mul(META_RECORD_SIZE)?)?, FLAG_SIZE)?;
        let empty = full.checked_add(n.checked_mul(FLAG_SIZE)?)?;
        let count = empty.checked_add(n.checked_mul(FLAG_SIZE)?)?;
        let lane_stride = align_up(count.checked_add(FLAG_SIZE)?, BUFFER_ALIGNMENT)?;
        let total = lane_stride.checked_mul(u64::from(lanes))?;
        Some(Self {
            buffer_count,
            pitch,
            lanes,
            lane_stride,
            meta,
            full,
            empty,
            count,
            total,
        })
    }

    fn lane_base(&self, lane: u32) -> u64 {
        u64::from(lane) * self.lane_stride
    }

    pub(crate) fn data_offset(&self, lane: u32, slot: u32) -> u64 {
        self.lane_base(lane) + u64::from(slot) * self.pitch
    }

    pub(crate) fn meta_offset(&self, lane: u32, slot: u32) -> u64 {
        self.lane_base(lane) + self.meta + u64::from(slot) * META_RECORD_SIZE
    }

    pub(crate) fn full_offset(&self, lane: u32, slot: u32) -> u64 {
        self.lane_base(lane) + self.full + u64::from(slot) * FLAG_SIZE
    }

    pub(crate) fn empty_source_offset(&self, lane: u32, slot: u32) -> u64 {
        self.lane_base(lane) + self.empty + u64::from(slot) * FLAG_SIZE
    }

    pub(crate) fn count_source_offset(&self, lane: u32) -> u64 {
        self.lane_base(lane) + self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_regions_do_not_overlap() {
        let layout = OutputLayout::new(4, 64, 3, 5).expect("layout");
        assert_eq!(layout.pitch, 64);
        assert_eq!(layout.data_offset(3) + 64, layout.meta_offset(0, 0));
        assert_eq!(layout.meta_offset(1, 0), layout.meta_offset(0, 0) + layout.meta_pitch());
        assert!(layout.meta_offset(3, 2) + META_RECORD_SIZE <= layout.full_value_offset());
        assert!(layout.full_value_offset() + FLAG_SIZE <= layout.empty_flag_offset(0, 0));
        assert!(layout.empty_flag_offset(2, 4) + FLAG_SIZE <= layout.total);
        assert_eq!(layout.release_count_offset(1), layout.empty_flag_offset(1, 0));
    }

    #[test]
    fn input_lanes_are_disjoint_and_flags_aligned() {
        let layout = InputLayout::new(3, 100, 2).expect("layout");
        assert_eq!(layout.pitch, 128);
        let lane0_end = layout.count_source_offset(0) + FLAG_SIZE;
        assert!(lane0_end <= layout.data_offset(1, 0));
        for lane in 0..2 {
            for slot in 0..3 {
                assert_eq!(layout.full_offset(lane, slot) % FLAG_SIZE, 0);
                assert_eq!(layout.empty_source_offset(lane, slot) % FLAG_SIZE, 0);
            }
            assert_eq!(layout.count_source_offset(lane) % FLAG_SIZE, 0);
        }
        assert!(layout.count_source_offset(1) + FLAG_SIZE <= layout.total);
    }

    #[test]
    fn oversized_geometry_is_refused() {
        assert!(OutputLayout::new(u32::MAX, u32::MAX, u32::MAX, u32::MAX).is_none());
        assert!(InputLayout::new(u32::MAX, u32::MAX, u32::MAX).is_none());
        assert_eq!(endpoint_size(1), Some(4096));
        assert_eq!(endpoint_size(4097), Some(8192));
    }
}
