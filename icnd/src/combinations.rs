// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Subset enumeration for multicast rule synthesis.
//!
//! When a switch has n primary edges, one combination rule is synthesized
//! for every subset of size 2..=n, so the enumeration must be exact and
//! duplicate-free.  Enumeration is by an incrementing index array rather
//! than recursion; switch fan-out stays in the tens, but C(n, k) grows
//! quickly enough that the counts still need u128 arithmetic.

use crate::types::IcndError;
use crate::types::IcndResult;

/// C(n, k) via the multiplicative formula.  Factorial-free, so it stays
/// exact for any fan-out a switch can physically have.
pub fn binomial(n: u64, k: u64) -> u128 {
    if k > n {
        return 0;
    }
    let k = k.min(n - k);
    let mut result: u128 = 1;
    for i in 0..k {
        result = result * u128::from(n - i) / u128::from(i + 1);
    }
    result
}

/// All C(n, k) subsets of `items` of size `k`, in lexicographic index order
/// (indices strictly increasing within each subset).
pub fn k_subsets<T: Clone>(items: &[T], k: usize) -> IcndResult<Vec<Vec<T>>> {
    let n = items.len();
    if k == 0 {
        return Err(IcndError::Invalid(
            "subset size must be at least 1".to_string(),
        ));
    }
    if k > n {
        return Err(IcndError::Invalid(format!(
            "subset size {k} exceeds item count {n}"
        )));
    }

    let mut out = Vec::new();
    let mut idx: Vec<usize> = (0..k).collect();
    loop {
        out.push(idx.iter().map(|i| items[*i].clone()).collect());

        // Advance the rightmost index that still has room, then reset
        // everything after it.
        let Some(pos) = (0..k).rev().find(|i| idx[*i] < n - k + *i) else {
            break;
        };
        idx[pos] += 1;
        for i in pos + 1..k {
            idx[i] = idx[i - 1] + 1;
        }
    }
    Ok(out)
}
