// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

pub use tessera::*;

#[cfg(test)]
mod test;

// We have these tests external from the crate for two reasons:
//
//  1. to make sure the public API is usable without accidentally relying on
//     crate-level-visibility stuff.
//
//  2. to use `cargo llvm-lines` in the llvm-lines/ subdirectory, to measure
//     footprint of final codegen when everything's actually instantiated.

#[test]
fn three_replica_kv_test() {
    test::three_replica_kv_test();
}

#[cfg(test)]
proptest::proptest! {
    #![proptest_config(proptest::prelude::ProptestConfig::with_cases(6))]
    #[test]
    fn random_kv_interleavings_converge(
        waves in proptest::collection::vec(
            proptest::collection::vec((0usize..2, 0u8..4, proptest::bool::ANY), 1..12),
            1..4,
        )
    ) {
        test::random_kv_interleaving_test(waves);
    }
}

#[test]
fn hot_key_contention_test() {
    test::hot_key_contention_test();
}

#[test]
fn new_order_convergence_test() {
    test::new_order_convergence_test();
}

#[test]
fn coordinator_handoff_test() {
    test::coordinator_handoff_test();
}

#[test]
fn client_framing_test() {
    test::client_framing_test();
}

pub fn main() {
    println!("please run `cargo test` instead");
}
