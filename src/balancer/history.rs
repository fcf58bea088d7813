use super::Balancer;
use crate::error::BalancerError;
use crate::store::NormalizedTarget;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Compact record of one history entry applied to a ring. The sequence of
/// these is the balancer's identity: comparing it against a freshly
/// fetched history decides between no-op, forward replay, and rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayedTarget {
    pub name: String,
    pub port: u16,
    pub weight: u32,
    pub order: String,
}

/// Replays `history[start..]` onto the balancer's ring: a positive weight
/// adds (or re-weights) the host, weight 0 removes it — the delete marker
/// that keeps the history append-only. Every applied entry is recorded in
/// the balancer's replayed history. Any ring failure aborts the replay.
pub fn apply_history(
    balancer: &Balancer,
    history: &[NormalizedTarget],
    start: usize,
) -> Result<(), BalancerError> {
    for entry in &history[start.min(history.len())..] {
        if entry.weight > 0 {
            balancer
                .ring()
                .add_host(&entry.name, entry.port, entry.weight)
                .map_err(|e| BalancerError::Replay(e.to_string()))?;
        } else {
            balancer
                .ring()
                .remove_host(&entry.name, entry.port)
                .map_err(|e| BalancerError::Replay(e.to_string()))?;
        }

        balancer.push_replayed(ReplayedTarget {
            name: entry.name.clone(),
            port: entry.port,
            weight: entry.weight,
            order: entry.order.clone(),
        });
    }

    debug!(
        "balancer: history applied, upstream={}, from={}, total={}",
        balancer.upstream().name,
        start,
        history.len()
    );
    Ok(())
}

/// Length of the longest common prefix of the two histories, compared by
/// `order`. Equal to `old.len()` when the old history is a strict prefix
/// of the new one (forward replay suffices); anything shorter means an
/// entry was edited or reordered and the ring cannot unwind in place.
pub fn last_equal_index(old: &[ReplayedTarget], new: &[NormalizedTarget]) -> usize {
    old.iter()
        .zip(new.iter())
        .take_while(|(o, n)| o.order == n.order)
        .count()
}

/// Fast no-change test: the order key is unique per record, so histories
/// of equal length whose final `order` matches are the same history.
pub fn unchanged(old: &[ReplayedTarget], new: &[NormalizedTarget]) -> bool {
    old.len() == new.len()
        && match (old.last(), new.last()) {
            (Some(o), Some(n)) => o.order == n.order,
            (None, None) => true,
            _ => false,
        }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn normalized(name: &str, weight: u32, order: &str) -> NormalizedTarget {
        NormalizedTarget {
            name: name.to_string(),
            port: 80,
            weight,
            order: order.to_string(),
            created_at: 0,
            id: Uuid::from_u128(0),
        }
    }

    fn replayed(name: &str, weight: u32, order: &str) -> ReplayedTarget {
        ReplayedTarget {
            name: name.to_string(),
            port: 80,
            weight,
            order: order.to_string(),
        }
    }

    #[test]
    fn test_last_equal_index_strict_prefix() {
        let old = vec![replayed("a", 10, "t1:g1"), replayed("b", 20, "t2:g2")];
        let new = vec![
            normalized("a", 10, "t1:g1"),
            normalized("b", 20, "t2:g2"),
            normalized("c", 30, "t3:g3"),
        ];
        assert_eq!(last_equal_index(&old, &new), 2);
    }

    #[test]
    fn test_last_equal_index_divergence() {
        let old = vec![replayed("a", 10, "t1:g1"), replayed("b", 20, "t2:g2")];
        let new = vec![normalized("a", 10, "t1:g1"), normalized("b", 20, "t2:g2-alt")];
        assert_eq!(last_equal_index(&old, &new), 1);
    }

    #[test]
    fn test_last_equal_index_empty_old() {
        let new = vec![normalized("a", 10, "t1:g1")];
        assert_eq!(last_equal_index(&[], &new), 0);
    }

    #[test]
    fn test_unchanged_fast_path() {
        let old = vec![replayed("a", 10, "t1:g1"), replayed("b", 20, "t2:g2")];
        let same = vec![normalized("a", 10, "t1:g1"), normalized("b", 20, "t2:g2")];
        let longer = vec![
            normalized("a", 10, "t1:g1"),
            normalized("b", 20, "t2:g2"),
            normalized("c", 30, "t3:g3"),
        ];
        let edited = vec![normalized("a", 10, "t1:g1"), normalized("b", 20, "t2:gX")];

        assert!(unchanged(&old, &same));
        assert!(!unchanged(&old, &longer));
        assert!(!unchanged(&old, &edited));
        assert!(unchanged(&[], &[]));
    }
}
