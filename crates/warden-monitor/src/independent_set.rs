//! Maximum independent set over small graphs.
//!
//! Graphs are adjacency bitmasks: bit `j` of `adjacency[i]` is set iff `i`
//! and `j` are adjacent. An independent set of `G` is a clique of its
//! complement, so the search runs Bron-Kerbosch with pivoting on the
//! complement. It is seeded with a greedy independent set, which both
//! prunes the search and is the answer when the budget runs out.

use std::time::{Duration, Instant};

/// Largest graph the bitmask representation holds.
pub(crate) const MAX_VERTICES: usize = 128;

pub(crate) type Mask = u128;

/// Result of a budgeted search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SearchOutcome {
    /// Best independent set found.
    pub members: Mask,
    /// True if the budget ran out before the search space was exhausted.
    pub timed_out: bool,
}

pub(crate) fn bit(v: usize) -> Mask {
    1 << v
}

pub(crate) fn full_mask(n: usize) -> Mask {
    assert!(n <= MAX_VERTICES, "graph of {n} vertices exceeds bitmask width");
    if n == MAX_VERTICES {
        Mask::MAX
    } else {
        bit(n) - 1
    }
}

/// Iterates the set bits of `mask` in ascending order.
pub(crate) fn members(mut mask: Mask) -> impl Iterator<Item = usize> {
    std::iter::from_fn(move || {
        if mask == 0 {
            return None;
        }
        let v = mask.trailing_zeros() as usize;
        mask &= mask - 1;
        Some(v)
    })
}

/// Greedy independent set: repeatedly take the vertex with the fewest
/// remaining neighbours (ties by lowest index) and discard its neighbours.
pub(crate) fn greedy_independent_set(adjacency: &[Mask]) -> Mask {
    let mut remaining = full_mask(adjacency.len());
    let mut chosen = 0;
    while remaining != 0 {
        let Some(v) =
            members(remaining).min_by_key(|&v| ((adjacency[v] & remaining).count_ones(), v))
        else {
            break;
        };
        chosen |= bit(v);
        remaining &= !(bit(v) | adjacency[v]);
    }
    chosen
}

/// Finds a maximum independent set within `budget` of wall-clock time.
pub(crate) fn maximum_independent_set(adjacency: &[Mask], budget: Duration) -> SearchOutcome {
    let n = adjacency.len();
    let full = full_mask(n);
    let complement: Vec<Mask> = (0..n)
        .map(|v| full & !adjacency[v] & !bit(v))
        .collect();

    let mut search = Search {
        complement,
        best: greedy_independent_set(adjacency),
        deadline: Instant::now() + budget,
        timed_out: false,
    };
    search.expand(0, full, 0);

    SearchOutcome {
        members: search.best,
        timed_out: search.timed_out,
    }
}

struct Search {
    complement: Vec<Mask>,
    best: Mask,
    deadline: Instant,
    timed_out: bool,
}

impl Search {
    fn expand(&mut self, clique: Mask, mut candidates: Mask, mut excluded: Mask) {
        if self.timed_out {
            return;
        }
        if Instant::now() >= self.deadline {
            self.timed_out = true;
            return;
        }
        if candidates == 0 {
            if excluded == 0 && clique.count_ones() > self.best.count_ones() {
                self.best = clique;
            }
            return;
        }
        if clique.count_ones() + candidates.count_ones() <= self.best.count_ones() {
            return;
        }

        let pivot = members(candidates | excluded)
            .max_by_key(|&u| (candidates & self.complement[u]).count_ones())
            .unwrap_or(0);

        for v in members(candidates & !self.complement[pivot]) {
            self.expand(
                clique | bit(v),
                candidates & self.complement[v],
                excluded & self.complement[v],
            );
            if self.timed_out {
                return;
            }
            candidates &= !bit(v);
            excluded |= bit(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn graph(n: usize, edges: &[(usize, usize)]) -> Vec<Mask> {
        let mut adjacency = vec![0; n];
        for &(u, v) in edges {
            adjacency[u] |= bit(v);
            adjacency[v] |= bit(u);
        }
        adjacency
    }

    fn is_independent(adjacency: &[Mask], set: Mask) -> bool {
        members(set).all(|v| adjacency[v] & set == 0)
    }

    fn brute_force_size(adjacency: &[Mask]) -> u32 {
        let n = adjacency.len();
        (0..(1u128 << n))
            .filter(|&set| is_independent(adjacency, set))
            .map(u128::count_ones)
            .max()
            .unwrap_or(0)
    }

    const GENEROUS: Duration = Duration::from_secs(10);

    #[test]
    fn empty_graph_takes_everything() {
        let adjacency = graph(5, &[]);
        let outcome = maximum_independent_set(&adjacency, GENEROUS);
        assert_eq!(outcome.members, full_mask(5));
        assert!(!outcome.timed_out);
    }

    #[test]
    fn star_beats_greedy_center() {
        // Star centred on 0: the leaves form the maximum set.
        let adjacency = graph(5, &[(0, 1), (0, 2), (0, 3), (0, 4)]);
        let outcome = maximum_independent_set(&adjacency, GENEROUS);
        assert_eq!(outcome.members, 0b11110);
    }

    #[test]
    fn chorded_path_matches_brute_force() {
        let adjacency = graph(6, &[(0, 1), (1, 2), (2, 3), (3, 4), (4, 5), (1, 4)]);
        let outcome = maximum_independent_set(&adjacency, GENEROUS);
        assert!(is_independent(&adjacency, outcome.members));
        assert_eq!(outcome.members.count_ones(), brute_force_size(&adjacency));
    }

    #[test]
    fn zero_budget_returns_greedy_seed() {
        let adjacency = graph(4, &[(0, 1), (2, 3)]);
        let outcome = maximum_independent_set(&adjacency, Duration::ZERO);
        assert!(outcome.timed_out);
        assert_eq!(outcome.members, greedy_independent_set(&adjacency));
        assert!(is_independent(&adjacency, outcome.members));
    }

    #[test]
    fn full_width_mask() {
        assert_eq!(full_mask(MAX_VERTICES), u128::MAX);
        assert_eq!(full_mask(0), 0);
        assert_eq!(members(0b1010_0001).collect::<Vec<_>>(), vec![0, 5, 7]);
    }

    fn arb_graph() -> impl Strategy<Value = Vec<Mask>> {
        (1_usize..=12).prop_flat_map(|n| {
            proptest::collection::vec((0..n, 0..n), 0..(n * 3)).prop_map(move |pairs| {
                let edges: Vec<_> = pairs.into_iter().filter(|(u, v)| u != v).collect();
                graph(n, &edges)
            })
        })
    }

    proptest! {
        /// Property: the greedy seed is always an independent set.
        #[test]
        fn prop_greedy_is_independent(adjacency in arb_graph()) {
            let set = greedy_independent_set(&adjacency);
            prop_assert!(is_independent(&adjacency, set));
        }

        /// Property: with enough budget the search finds a maximum set.
        #[test]
        fn prop_search_is_maximum(adjacency in arb_graph()) {
            let outcome = maximum_independent_set(&adjacency, GENEROUS);
            prop_assert!(!outcome.timed_out);
            prop_assert!(is_independent(&adjacency, outcome.members));
            prop_assert_eq!(outcome.members.count_ones(), brute_force_size(&adjacency));
        }
    }
}
