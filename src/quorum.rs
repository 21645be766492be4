// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! This module defines arithmetic of quorum sizes and tests that that
//! arithmetic has expected values. It's very small but this is one of the minor
//! bits of fiddly arithmetic that it's easy to mess up in a quorum-based
//! system.

// Batch dissemination only needs one threshold: the number of distinct
// replicas (the sender included) that must acknowledge a batch before its
// sender may consider it "available". We use `ceil(n/2)`, which together with
// the sequencer's own majority means that any batch named by a committed
// commit vector is held by at least one replica any other majority can reach.
//
// Reformulated in terms of number of replicas gives:
//
//  failures     | total     | ack          |
//  tolerated    | replicas  | quorum       |
//  `(n-1)/2`    | `n`       | `ceil(n/2)`  |
//  -------------|-----------|--------------|
//  0            |  1        |  1           |
//  0            |  2        |  1           |
//  1            |  3        |  2           |
//  1            |  4        |  2           |
//  2            |  5        |  3           |
//  2            |  6        |  3           |
//  3            |  7        |  4           |
//  3            |  8        |  4           |
//  4            |  9        |  5           |
//  4            | 10        |  5           |
//

// Returns the usize corresponding to ceil(x/y)
fn ceil_div(x: usize, y: usize) -> usize {
    if x == 0 {
        0
    } else {
        1 + ((x - 1) / y)
    }
}

pub(crate) fn failures_tolerated(replica_count: usize) -> usize {
    if replica_count == 0 {
        0
    } else {
        (replica_count - 1) / 2
    }
}

pub(crate) fn ack_quorum(replica_count: usize) -> usize {
    ceil_div(replica_count, 2)
}

/// Number of local epoch intervals that high-contention mode lasts for:
/// roughly 200ms worth, at least one.
pub(crate) fn high_contention_span(local_interval_ms: u64) -> usize {
    std::cmp::max(1, ceil_div(200, std::cmp::max(1, local_interval_ms) as usize))
}

#[test]
fn test_quorums() {
    assert_eq!(failures_tolerated(1), 0);
    assert_eq!(failures_tolerated(2), 0);
    assert_eq!(failures_tolerated(3), 1);
    assert_eq!(failures_tolerated(4), 1);
    assert_eq!(failures_tolerated(5), 2);
    assert_eq!(failures_tolerated(6), 2);
    assert_eq!(failures_tolerated(7), 3);
    assert_eq!(failures_tolerated(8), 3);
    assert_eq!(failures_tolerated(9), 4);
    assert_eq!(failures_tolerated(10), 4);

    assert_eq!(ack_quorum(1), 1);
    assert_eq!(ack_quorum(2), 1);
    assert_eq!(ack_quorum(3), 2);
    assert_eq!(ack_quorum(4), 2);
    assert_eq!(ack_quorum(5), 3);
    assert_eq!(ack_quorum(6), 3);
    assert_eq!(ack_quorum(7), 4);
    assert_eq!(ack_quorum(8), 4);
    assert_eq!(ack_quorum(9), 5);
    assert_eq!(ack_quorum(10), 5);

    assert_eq!(high_contention_span(40), 5);
    assert_eq!(high_contention_span(30), 7);
    assert_eq!(high_contention_span(500), 1);
    assert_eq!(high_contention_span(0), 200);
}
