pub use tessera::*;

#[path = "../src/test.rs"]
mod test;

// This version of the cluster test is a non-#[cfg(test)] binary so that
// cargo llvm-lines can find it and measure what the fully-instantiated
// replica costs in codegen. See also ../src/main.rs

pub fn main() {
    test::three_replica_kv_test();
}
