//! Data distribution policies.
//!
//! A policy decides, per message, which destination ranks take part and which
//! byte ranges of the source buffer each of them receives. Everything here is
//! a pure function of the message sequence number and the two geometries, so
//! producers on different ranks agree without talking to each other.

use std::fmt;

use smallvec::SmallVec;

use crate::{TransportError, TransportResult};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DataDistribution {
    /// Every destination rank receives the whole message.
    #[default]
    Parallel,
    /// Each message goes whole to exactly one rank of all destination sets.
    Sequential,
    /// The message is cut into one contiguous chunk per rank.
    Block,
    /// Never split; one rank of each destination set receives the message.
    Indivisible,
}

impl fmt::Display for DataDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataDistribution::Parallel => "parallel",
            DataDistribution::Sequential => "sequential",
            DataDistribution::Block => "block",
            DataDistribution::Indivisible => "indivisible",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceGeometry {
    pub rank: u32,
    pub rank_count: u32,
    pub buffer_length: u32,
}

/// Where a destination rank sits, both within its own port set and in the
/// flattened list of every destination rank of the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DestinationGeometry {
    pub rank: u32,
    pub rank_count: u32,
    pub global_rank: u32,
    pub global_rank_count: u32,
    pub buffer_length: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferRange {
    pub src_offset: u32,
    pub dst_offset: u32,
    pub length: u32,
}

impl BufferRange {
    /// Bytes of this range that a `message_length` byte message fills.
    pub fn clamped(&self, message_length: u32) -> u32 {
        self.length
            .min(message_length.saturating_sub(self.src_offset))
    }
}

/// The ranges one destination receives. Empty when the destination does not
/// take part in the message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferInfo {
    ranges: SmallVec<[BufferRange; 2]>,
}

impl BufferInfo {
    pub fn single(range: BufferRange) -> Self {
        let mut ranges = SmallVec::new();
        ranges.push(range);
        Self { ranges }
    }

    pub fn ranges(&self) -> &[BufferRange] {
        &self.ranges
    }

    pub fn is_targeted(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// Bytes delivered for a message of `message_length` bytes.
    pub fn delivered_length(&self, message_length: u32) -> u32 {
        self.ranges
            .iter()
            .map(|range| range.clamped(message_length))
            .sum()
    }
}

impl DataDistribution {
    pub fn calculate_buffer_offsets(
        &self,
        sequence: u64,
        src: &SourceGeometry,
        dst: &DestinationGeometry,
    ) -> BufferInfo {
        if self.targets(sequence, src, dst) {
            self.ranges(src, dst)
        } else {
            BufferInfo::default()
        }
    }

    /// True when message `sequence` from `src` involves `dst` at all.
    pub fn targets(&self, sequence: u64, src: &SourceGeometry, dst: &DestinationGeometry) -> bool {
        match self {
            DataDistribution::Parallel | DataDistribution::Block => dst.rank_count > 0,
            DataDistribution::Sequential => {
                chosen_rank(sequence, src.rank, dst.global_rank_count) == Some(dst.global_rank)
            }
            DataDistribution::Indivisible => {
                chosen_rank(sequence, src.rank, dst.rank_count) == Some(dst.rank)
            }
        }
    }

    /// The ranges `dst` receives whenever it is targeted. They depend only on
    /// geometry, which is what lets them be compiled into templates.
    pub fn ranges(&self, src: &SourceGeometry, dst: &DestinationGeometry) -> BufferInfo {
        if dst.rank_count == 0 {
            return BufferInfo::default();
        }
        match self {
            DataDistribution::Block => {
                let (start, length) = block_range(src.buffer_length, dst.rank, dst.rank_count);
                BufferInfo::single(BufferRange {
                    src_offset: start,
                    dst_offset: 0,
                    length,
                })
            }
            _ => BufferInfo::single(BufferRange {
                src_offset: 0,
                dst_offset: 0,
                length: src.buffer_length,
            }),
        }
    }

    /// True when the set of targeted ranks changes from message to message.
    pub fn is_sequence_dependent(&self) -> bool {
        matches!(
            self,
            DataDistribution::Sequential | DataDistribution::Indivisible
        )
    }

    /// Rejects destinations whose buffers cannot hold what they may receive.
    pub fn validate_geometry(&self, src: &SourceGeometry, dst: &DestinationGeometry) -> TransportResult<()> {
        if src.rank_count == 0 || src.rank >= src.rank_count {
            return Err(TransportError::bad_config(format!(
                "source rank {} outside 0..{}",
                src.rank, src.rank_count
            )));
        }
        if dst.rank_count == 0
            || dst.rank >= dst.rank_count
            || dst.global_rank >= dst.global_rank_count
        {
            return Err(TransportError::bad_config(format!(
                "destination rank {} ({} global) outside its port set",
                dst.rank, dst.global_rank
            )));
        }
        let needed = self
            .ranges(src, dst)
            .ranges()
            .iter()
            .map(|range| range.dst_offset + range.length)
            .max()
            .unwrap_or(0);
        if needed > dst.buffer_length {
            return Err(TransportError::bad_config(format!(
                "{self} distribution needs {needed} byte buffers on rank {}, port has {}",
                dst.rank, dst.buffer_length
            )));
        }
        Ok(())
    }
}

/// `(start, length)` of `rank`'s chunk when `buffer_length` bytes are split
/// over `rank_count` ranks; the last rank also takes the remainder.
pub fn block_range(buffer_length: u32, rank: u32, rank_count: u32) -> (u32, u32) {
    if rank_count == 0 {
        return (0, 0);
    }
    let chunk = buffer_length / rank_count;
    let start = chunk * rank;
    if rank + 1 == rank_count {
        (start, buffer_length - start)
    } else {
        (start, chunk)
    }
}

fn chosen_rank(sequence: u64, src_rank: u32, count: u32) -> Option<u32> {
    if count == 0 {
        return None;
    }
    Some((sequence.wrapping_add(u64::from(src_rank)) % u64::from(count)) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn src(rank: u32, rank_count: u32, buffer_length: u32) -> SourceGeometry {
        SourceGeometry {
            rank,
            rank_count,
            buffer_length,
        }
    }

    /// Flattened destinations of `sets` port sets with the given rank counts.
    fn destinations(sets: &[u32], buffer_length: u32) -> Vec<DestinationGeometry> {
        let total: u32 = sets.iter().sum();
        let mut global = 0;
        let mut out = Vec::new();
        for &count in sets {
            for rank in 0..count {
                out.push(DestinationGeometry {
                    rank,
                    rank_count: count,
                    global_rank: global,
                    global_rank_count: total,
                    buffer_length,
                });
                global += 1;
            }
        }
        out
    }

    #[test]
    fn block_splits_evenly() {
        let dsts = destinations(&[3], 300);
        let ranges: Vec<_> = dsts
            .iter()
            .map(|dst| DataDistribution::Block.calculate_buffer_offsets(0, &src(0, 1, 300), dst))
            .map(|info| info.ranges()[0])
            .collect();
        assert_eq!(
            ranges,
            vec![
                BufferRange { src_offset: 0, dst_offset: 0, length: 100 },
                BufferRange { src_offset: 100, dst_offset: 0, length: 100 },
                BufferRange { src_offset: 200, dst_offset: 0, length: 100 },
            ]
        );
    }

    #[test]
    fn block_remainder_goes_to_last_rank() {
        let dsts = destinations(&[3], 301);
        let last = DataDistribution::Block.calculate_buffer_offsets(7, &src(0, 1, 301), &dsts[2]);
        assert_eq!(
            last.ranges(),
            &[BufferRange { src_offset: 200, dst_offset: 0, length: 101 }]
        );
        assert_eq!(block_range(301, 0, 3), (0, 100));
        assert_eq!(block_range(301, 1, 3), (100, 100));
    }

    #[test]
    fn rank_choice_wraps_at_the_end_of_the_sequence_space() {
        let dsts = destinations(&[4], 64);
        let source = src(3, 4, 64);
        let chosen: Vec<_> = dsts
            .iter()
            .map(|dst| DataDistribution::Sequential.targets(u64::MAX, &source, dst))
            .collect();
        assert_eq!(chosen, vec![false, false, true, false]);
        assert!(DataDistribution::Indivisible.targets(u64::MAX, &source, &dsts[2]));
    }

    #[test]
    fn short_messages_clamp_block_ranges() {
        let dsts = destinations(&[3], 300);
        let info = DataDistribution::Block.calculate_buffer_offsets(0, &src(0, 1, 300), &dsts[1]);
        assert_eq!(info.delivered_length(150), 50);
        assert_eq!(info.delivered_length(90), 0);
        assert_eq!(info.delivered_length(300), 100);
    }

    #[test]
    fn parallel_targets_every_rank_of_every_set() {
        let dsts = destinations(&[2, 3], 64);
        for dst in &dsts {
            let info = DataDistribution::Parallel.calculate_buffer_offsets(5, &src(0, 1, 64), dst);
            assert_eq!(
                info.ranges(),
                &[BufferRange { src_offset: 0, dst_offset: 0, length: 64 }]
            );
        }
    }

    #[test]
    fn sequential_rotates_over_all_sets() {
        let dsts = destinations(&[2, 1], 64);
        let targets: Vec<u32> = (0..6u64)
            .map(|seq| {
                let hits: Vec<u32> = dsts
                    .iter()
                    .filter(|dst| {
                        DataDistribution::Sequential
                            .calculate_buffer_offsets(seq, &src(1, 2, 64), dst)
                            .is_targeted()
                    })
                    .map(|dst| dst.global_rank)
                    .collect();
                assert_eq!(hits.len(), 1);
                hits[0]
            })
            .collect();
        assert_eq!(targets, vec![1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn indivisible_picks_one_rank_per_set() {
        let dsts = destinations(&[2, 3], 64);
        for seq in 0..12u64 {
            let hits: Vec<_> = dsts
                .iter()
                .filter(|dst| {
                    DataDistribution::Indivisible
                        .calculate_buffer_offsets(seq, &src(0, 1, 64), dst)
                        .is_targeted()
                })
                .collect();
            assert_eq!(hits.len(), 2, "one rank in each of the two sets");
            assert_eq!(hits[0].rank, (seq % 2) as u32);
            assert_eq!(hits[1].rank, (seq % 3) as u32);
        }
    }

    #[test]
    fn undersized_destinations_are_rejected() {
        let mut dsts = destinations(&[2], 64);
        for dst in dsts.iter_mut() {
            dst.buffer_length = 32;
        }
        assert!(DataDistribution::Parallel
            .validate_geometry(&src(0, 1, 64), &dsts[0])
            .is_err());
        assert!(DataDistribution::Block
            .validate_geometry(&src(0, 1, 64), &dsts[0])
            .is_ok());
        assert!(DataDistribution::Block
            .validate_geometry(&src(0, 1, 65), &dsts[1])
            .is_err());
    }

    proptest! {
        #[test]
        fn distribution_is_deterministic(
            seq in any::<u64>(),
            src_rank in 0u32..4,
            sets in proptest::collection::vec(1u32..5, 1..4),
            len in 0u32..4096,
        ) {
            let source = src(src_rank, 4, len);
            for policy in [
                DataDistribution::Parallel,
                DataDistribution::Sequential,
                DataDistribution::Block,
                DataDistribution::Indivisible,
            ] {
                for dst in destinations(&sets, len) {
                    prop_assert_eq!(
                        policy.calculate_buffer_offsets(seq, &source, &dst),
                        policy.calculate_buffer_offsets(seq, &source, &dst)
                    );
                }
            }
        }

        #[test]
        fn block_chunks_cover_the_buffer(len in 0u32..100_000, ranks in 1u32..17) {
            let mut next = 0;
            for rank in 0..ranks {
                let (start, length) = block_range(len, rank, ranks);
                prop_assert_eq!(start, next);
                next = start + length;
            }
            prop_assert_eq!(next, len);
        }
    }
}
