//! Ghost-column planning for the distributed product.
//!
//! Each device's ghost columns are kept as a sorted set; the sort order is
//! also the layout of its receive buffer. The union of all ghost columns
//! forms the send set, split into per-owner ranges, so a sender packs one
//! contiguous segment regardless of how many devices read from it.

use std::collections::BTreeSet;
use std::ops::Range;

use spmv_core::{DeviceBuffer, Scalar};

use crate::error::{Error, Result};
use crate::partition::Partition;

/// Columns every device needs from outside its own block, sorted.
pub(crate) fn ghost_columns(
    row_offsets: &[usize],
    cols: &[usize],
    partition: &Partition,
) -> Vec<BTreeSet<usize>> {
    (0..partition.parts())
        .map(|device| {
            let range = partition.range(device);
            let mut ghosts = BTreeSet::new();
            for row in range.clone() {
                for j in row_offsets[row]..row_offsets[row + 1] {
                    let col = cols[j];
                    if !range.contains(&col) {
                        ghosts.insert(col);
                    }
                }
            }
            ghosts
        })
        .collect()
}

/// The union send set and its per-owner split.
pub(crate) struct ExchangePlan {
    /// Sorted union of every device's ghost columns.
    pub send_set: Vec<usize>,
    /// Device `d` owns `send_set[cidx[d]..cidx[d + 1]]`.
    pub cidx: Vec<usize>,
}

pub(crate) fn plan(partition: &Partition, ghosts: &[BTreeSet<usize>]) -> ExchangePlan {
    let mut union = BTreeSet::new();
    for set in ghosts {
        union.extend(set.iter().copied());
    }
    let send_set: Vec<usize> = union.into_iter().collect();
    let cidx = (0..=partition.parts())
        .map(|device| send_set.partition_point(|&col| col < partition.bounds()[device]))
        .collect();
    ExchangePlan { send_set, cidx }
}

/// Send-set position of each ghost column, in receive-slot order.
pub(crate) fn ghost_positions(
    ghosts: &BTreeSet<usize>,
    send_set: &[usize],
) -> Result<Vec<usize>> {
    ghosts
        .iter()
        .map(|col| {
            send_set
                .binary_search(col)
                .map_err(|_| Error::Internal(format!("ghost column {col} missing from send set")))
        })
        .collect()
}

/// A run of ghost slots served by one sending device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RecvSpan {
    pub sender: usize,
    pub slots: Range<usize>,
}

/// Groups ghost slots into per-sender runs. Positions ascend and each
/// sender owns a contiguous position range, so every sender contributes at
/// most one run.
pub(crate) fn recv_spans(positions: &[usize], cidx: &[usize]) -> Vec<RecvSpan> {
    let mut spans: Vec<RecvSpan> = Vec::new();
    for (slot, &position) in positions.iter().enumerate() {
        let sender = cidx.partition_point(|&c| c <= position) - 1;
        match spans.last_mut() {
            Some(span) if span.sender == sender => span.slots.end = slot + 1,
            _ => spans.push(RecvSpan {
                sender,
                slots: slot..slot + 1,
            }),
        }
    }
    spans
}

/// Writes one sender's packed segment into the staging slots it serves.
/// `segment_base` is the sender's first position in the send set.
pub(crate) fn scatter_segment<T: Scalar>(
    staging: &mut [T],
    span: &RecvSpan,
    positions: &[usize],
    segment: &[T],
    segment_base: usize,
) {
    for slot in span.slots.clone() {
        staging[slot] = segment[positions[slot] - segment_base];
    }
}

/// Per-device buffers and layout for the exchange.
pub(crate) struct DeviceExchange<T: Scalar> {
    /// Block-local x positions this device packs for others.
    pub send_idx: DeviceBuffer<u32>,
    /// Packed boundary values, read back after the gather.
    pub send_buf: DeviceBuffer<T>,
    /// Ghost values this device receives, in receive-slot order.
    pub rx_buf: DeviceBuffer<T>,
    /// Send-set position per ghost slot.
    pub positions: Vec<usize>,
    /// Ghost slots grouped by sending device.
    pub spans: Vec<RecvSpan>,
}

impl<T: Scalar> DeviceExchange<T> {
    pub(crate) fn send_count(&self) -> usize {
        self.send_idx.len()
    }

    pub(crate) fn ghost_count(&self) -> usize {
        self.rx_buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn six_by_six() -> (Vec<usize>, Vec<usize>, Partition) {
        // Two 3-row blocks. Row 1 reads column 4; rows 3 and 5 read
        // columns 0 and 2 respectively.
        let row_offsets = vec![0, 1, 3, 4, 6, 7, 9];
        let cols = vec![0, 1, 4, 2, 3, 0, 4, 5, 2];
        let partition = Partition::from_bounds(vec![0, 3, 6]).unwrap();
        (row_offsets, cols, partition)
    }

    #[test]
    fn ghosts_are_the_out_of_block_columns() {
        let (row_offsets, cols, partition) = six_by_six();
        let ghosts = ghost_columns(&row_offsets, &cols, &partition);
        assert_eq!(ghosts[0].iter().copied().collect::<Vec<_>>(), vec![4]);
        assert_eq!(ghosts[1].iter().copied().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn send_set_is_the_sorted_union_split_by_owner() {
        let (row_offsets, cols, partition) = six_by_six();
        let ghosts = ghost_columns(&row_offsets, &cols, &partition);
        let plan = plan(&partition, &ghosts);
        assert_eq!(plan.send_set, vec![0, 2, 4]);
        // Device 0 owns columns 0 and 2, device 1 owns column 4.
        assert_eq!(plan.cidx, vec![0, 2, 3]);
    }

    #[test]
    fn spans_point_each_receiver_at_its_senders() {
        let (row_offsets, cols, partition) = six_by_six();
        let ghosts = ghost_columns(&row_offsets, &cols, &partition);
        let plan = plan(&partition, &ghosts);

        let positions0 = ghost_positions(&ghosts[0], &plan.send_set).unwrap();
        assert_eq!(positions0, vec![2]);
        let spans0 = recv_spans(&positions0, &plan.cidx);
        assert_eq!(
            spans0,
            vec![RecvSpan {
                sender: 1,
                slots: 0..1
            }]
        );

        let positions1 = ghost_positions(&ghosts[1], &plan.send_set).unwrap();
        assert_eq!(positions1, vec![0, 1]);
        let spans1 = recv_spans(&positions1, &plan.cidx);
        assert_eq!(
            spans1,
            vec![RecvSpan {
                sender: 0,
                slots: 0..2
            }]
        );
    }

    #[test]
    fn block_diagonal_needs_no_exchange() {
        let row_offsets = vec![0, 1, 2, 3, 4];
        let cols = vec![0, 1, 2, 3];
        let partition = Partition::from_bounds(vec![0, 2, 4]).unwrap();
        let ghosts = ghost_columns(&row_offsets, &cols, &partition);
        assert!(ghosts.iter().all(|set| set.is_empty()));
        let plan = plan(&partition, &ghosts);
        assert!(plan.send_set.is_empty());
        assert_eq!(plan.cidx, vec![0, 0, 0]);
    }

    #[test]
    fn one_receiver_can_draw_from_two_senders() {
        let partition = Partition::from_bounds(vec![0, 16, 32, 48]).unwrap();
        let mut ghosts = BTreeSet::new();
        ghosts.insert(0);
        ghosts.insert(20);
        let plan = plan(&partition, &[BTreeSet::new(), BTreeSet::new(), ghosts.clone()]);
        assert_eq!(plan.send_set, vec![0, 20]);
        assert_eq!(plan.cidx, vec![0, 1, 2, 2]);

        let positions = ghost_positions(&ghosts, &plan.send_set).unwrap();
        let spans = recv_spans(&positions, &plan.cidx);
        assert_eq!(
            spans,
            vec![
                RecvSpan {
                    sender: 0,
                    slots: 0..1
                },
                RecvSpan {
                    sender: 1,
                    slots: 1..2
                },
            ]
        );
    }

    #[test]
    fn scatter_places_segment_values_by_slot() {
        let positions = vec![3, 4, 7];
        let span = RecvSpan {
            sender: 0,
            slots: 0..2,
        };
        // Sender 0 owns positions 3..5 and packed [30.0, 40.0].
        let mut staging = vec![0.0f64; 3];
        scatter_segment(&mut staging, &span, &positions, &[30.0, 40.0], 3);
        assert_eq!(staging, vec![30.0, 40.0, 0.0]);
    }
}
