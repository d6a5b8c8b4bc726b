use std::collections::HashSet;
use std::fmt;

use crate::graph::OperationId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyError {
    pub missing_predecessor: OperationId,
    pub operation: OperationId,
}

impl fmt::Display for TopologyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "predecessor {} is not recorded before operation {}",
            self.missing_predecessor, self.operation
        )
    }
}

impl std::error::Error for TopologyError {}

/// Checks that every dependency points at an operation recorded earlier in `nodes`.
pub fn validate_graph_topology<'a, I>(nodes: I) -> Result<(), TopologyError>
where
    I: IntoIterator<Item = (OperationId, &'a [OperationId])>,
{
    let mut available = HashSet::new();
    for (operation, predecessors) in nodes {
        for predecessor in predecessors {
            if !available.contains(predecessor) {
                return Err(TopologyError {
                    missing_predecessor: *predecessor,
                    operation,
                });
            }
        }
        available.insert(operation);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_edges_are_rejected() {
        let a = OperationId(1);
        let b = OperationId(2);
        let ok: Vec<(OperationId, &[OperationId])> = vec![(a, &[]), (b, &[OperationId(1)])];
        assert!(validate_graph_topology(ok).is_ok());

        let forward: Vec<(OperationId, &[OperationId])> = vec![(a, &[OperationId(2)]), (b, &[])];
        assert_eq!(
            validate_graph_topology(forward),
            Err(TopologyError {
                missing_predecessor: b,
                operation: a
            })
        );
    }
}
