//! Locality-weighted load rebalancing.
//!
//! The transfer-matrix computation is a pure function of the current
//! per-place sizes and the weight vector, so it is unit-testable without any
//! transport. The collective driver lives on the collection types (see
//! [`ChunkedList::balance`](crate::store::ChunkedList::balance)): rank 0
//! computes the matrix, broadcasts it, and each place drains the counts its
//! row demands into the move manager.

use crate::error::{Error, Result};

/// Computes the `np x np` transfer matrix realizing the weighted target
/// distribution.
///
/// Entry `(i, j)` is the number of elements rank `i` must send to rank `j`.
/// Targets are derived from cumulative rounded shares over the places sorted
/// by ascending weight, so the target vector always sums exactly to the
/// global total. The matching is greedy: the most-overloaded sender drains
/// into the most-underloaded receiver until every deficit is met, which
/// bounds the number of nonzero entries by `O(np)`.
///
/// Weights must be non-negative with a positive sum and one entry per place.
pub fn transfer_matrix(sizes: &[u64], weights: &[f64]) -> Result<Vec<Vec<u64>>> {
    let np = sizes.len();
    validate_weights(np, weights)?;
    let weight_sum: f64 = weights.iter().sum();

    let total: u64 = sizes.iter().sum();
    let targets = targets_for(total, weights, weight_sum);

    let mut matrix = vec![vec![0u64; np]; np];
    let mut surplus: Vec<(usize, u64)> = (0..np)
        .filter(|&i| sizes[i] > targets[i])
        .map(|i| (i, sizes[i] - targets[i]))
        .collect();
    let mut deficit: Vec<(usize, u64)> = (0..np)
        .filter(|&i| sizes[i] < targets[i])
        .map(|i| (i, targets[i] - sizes[i]))
        .collect();

    while !deficit.is_empty() {
        // most overloaded sender, most underloaded receiver; ties go to the
        // lowest rank so every place computes the identical matrix
        let s = max_entry(&surplus);
        let r = max_entry(&deficit);
        let amount = surplus[s].1.min(deficit[r].1);
        matrix[surplus[s].0][deficit[r].0] += amount;
        surplus[s].1 -= amount;
        deficit[r].1 -= amount;
        if surplus[s].1 == 0 {
            surplus.swap_remove(s);
        }
        if deficit[r].1 == 0 {
            deficit.swap_remove(r);
        }
    }
    Ok(matrix)
}

/// Checks that `weights` can define a target distribution for `np` places.
///
/// The balance driver runs this on every place before the coordinator
/// computes the matrix, so a bad vector fails the whole group instead of
/// stranding the non-coordinators in the broadcast.
pub(crate) fn validate_weights(np: usize, weights: &[f64]) -> Result<()> {
    if weights.len() != np {
        return Err(Error::InvalidWeights("one weight per place required"));
    }
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(Error::InvalidWeights(
            "weights must be finite and non-negative",
        ));
    }
    if weights.iter().sum::<f64>() <= 0.0 {
        return Err(Error::InvalidWeights("weights must have a positive sum"));
    }
    Ok(())
}

/// Per-place element targets summing exactly to `total`.
fn targets_for(total: u64, weights: &[f64], weight_sum: f64) -> Vec<u64> {
    let np = weights.len();
    let mut order: Vec<usize> = (0..np).collect();
    order.sort_by(|&a, &b| {
        weights[a]
            .partial_cmp(&weights[b])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });

    let mut targets = vec![0u64; np];
    let mut cumulative_weight = 0.0;
    let mut assigned = 0u64;
    for (pos, &place) in order.iter().enumerate() {
        cumulative_weight += weights[place] / weight_sum;
        let cut = if pos + 1 == np {
            // force exactness at the end regardless of rounding drift
            total
        } else {
            ((total as f64) * cumulative_weight).round().min(total as f64) as u64
        };
        targets[place] = cut - assigned;
        assigned = cut;
    }
    targets
}

fn max_entry(entries: &[(usize, u64)]) -> usize {
    let mut best = 0;
    for (i, e) in entries.iter().enumerate() {
        let b = &entries[best];
        if e.1 > b.1 || (e.1 == b.1 && e.0 < b.0) {
            best = i;
        }
    }
    best
}
