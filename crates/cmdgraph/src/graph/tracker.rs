//! Dependency inference from declared memory accesses.
//!
//! For each access of a new operation the history is scanned newest first. Every earlier
//! operation touching still-uncovered bytes with a conflicting mode becomes a predecessor. Bytes
//! are covered once an earlier *writer* is found for them, since that writer is already ordered
//! after everything before it. Earlier readers add edges but never cover.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::memory::{AccessRecord, ByteRange};

use super::operation::{Operation, OperationId};

pub fn track(operation: &Operation, history: &[Arc<Operation>]) -> SmallVec<[OperationId; 4]> {
    let mut predecessors: SmallVec<[OperationId; 4]> = SmallVec::new();
    for access in operation.accesses() {
        track_access(access, history, &mut predecessors);
    }
    predecessors.sort();
    predecessors.dedup();
    predecessors
}

fn track_access(
    access: &AccessRecord,
    history: &[Arc<Operation>],
    predecessors: &mut SmallVec<[OperationId; 4]>,
) {
    if access.range.is_empty() {
        return;
    }
    let mut uncovered: SmallVec<[ByteRange; 4]> = SmallVec::new();
    uncovered.push(access.range);

    for prior in history.iter().rev() {
        if uncovered.is_empty() {
            break;
        }
        for prior_access in prior.accesses() {
            if prior_access.allocation != access.allocation {
                continue;
            }
            let touches = uncovered
                .iter()
                .any(|range| range.overlaps(&prior_access.range));
            if !touches {
                continue;
            }
            if access.mode.writes() || prior_access.mode.writes() {
                predecessors.push(prior.id());
            }
            if prior_access.mode.writes() {
                uncovered = uncovered
                    .iter()
                    .flat_map(|range| range.subtract(&prior_access.range))
                    .collect();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::operation::Payload;
    use crate::memory::{AccessMode, AllocationId, Placement, UsmPtr};
    use crate::runtime::QueueId;

    fn op(id: u64, accesses: &[(u64, u64, u64, AccessMode)]) -> Arc<Operation> {
        let accesses = accesses
            .iter()
            .map(|&(allocation, start, len, mode)| AccessRecord {
                allocation: AllocationId(allocation),
                range: ByteRange::new(start, len),
                mode,
            })
            .collect();
        Arc::new(Operation::new(
            OperationId(id),
            QueueId(0),
            Payload::Fill {
                dst: UsmPtr::from_raw_parts(AllocationId(0), 0, 0, Placement::Device),
                pattern: SmallVec::from_slice(&[0]),
                bytes: 0,
            },
            accesses,
        ))
    }

    use AccessMode::{Read, ReadWrite, Write};

    #[test]
    fn copy_scale_copy_chain() {
        // memcpy(Y, X); Y *= 2; memcpy(Z, Y)
        let copy_in = op(1, &[(1, 0, 4, Read), (2, 0, 4, Write)]);
        let scale = op(2, &[(2, 0, 4, ReadWrite)]);
        let copy_out = op(3, &[(2, 0, 4, Read), (3, 0, 4, Write)]);

        assert!(track(&copy_in, &[]).is_empty());
        assert_eq!(
            track(&scale, &[copy_in.clone()]).as_slice(),
            &[OperationId(1)]
        );
        assert_eq!(
            track(&copy_out, &[copy_in.clone(), scale.clone()]).as_slice(),
            &[OperationId(2)]
        );
    }

    #[test]
    fn disjoint_accesses_stay_independent() {
        let a = op(1, &[(1, 0, 16, Write)]);
        let b = op(2, &[(1, 16, 16, Write)]);
        let c = op(3, &[(2, 0, 16, Write)]);
        assert!(track(&b, &[a.clone()]).is_empty());
        assert!(track(&c, &[a, b]).is_empty());
    }

    #[test]
    fn readers_are_siblings_and_writer_waits_for_all() {
        let w = op(1, &[(1, 0, 8, Write)]);
        let r1 = op(2, &[(1, 0, 8, Read)]);
        let r2 = op(3, &[(1, 0, 8, Read)]);
        let history = vec![w.clone(), r1.clone()];
        assert_eq!(track(&r2, &history).as_slice(), &[OperationId(1)]);

        let w2 = op(4, &[(1, 0, 8, Write)]);
        let history = vec![w, r1, r2];
        assert_eq!(
            track(&w2, &history).as_slice(),
            &[OperationId(1), OperationId(2), OperationId(3)]
        );
    }

    #[test]
    fn later_writer_hides_earlier_writers() {
        let first = op(1, &[(1, 0, 8, Write)]);
        let second = op(2, &[(1, 0, 8, Write)]);
        let reader = op(3, &[(1, 0, 8, Read)]);
        assert_eq!(
            track(&reader, &[first, second]).as_slice(),
            &[OperationId(2)]
        );
    }

    #[test]
    fn partial_cover_keeps_scanning() {
        let wide = op(1, &[(1, 0, 16, Write)]);
        let narrow = op(2, &[(1, 0, 8, Write)]);
        let reader = op(3, &[(1, 0, 16, Read)]);
        assert_eq!(
            track(&reader, &[wide, narrow]).as_slice(),
            &[OperationId(1), OperationId(2)]
        );
    }

    #[test]
    fn empty_ranges_never_depend() {
        let writer = op(1, &[(1, 0, 8, Write)]);
        let empty = op(2, &[(1, 4, 0, ReadWrite)]);
        assert!(track(&empty, &[writer]).is_empty());
    }
}
