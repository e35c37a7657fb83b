//! Randomized remap sweeps: many small fabricated layouts, every byte
//! verified afterwards. The executor re-checks its own invariants
//! after every batch, so a sweep failure points at the offending seed.

use fsh_harness::run_self_test;

#[test]
fn sweep_of_seeded_layouts() {
    for seed in 0..64 {
        let outcome = run_self_test(seed).unwrap();
        assert!(outcome.dev_len >= outcome.bytes_moved);
    }
}

#[test]
fn large_seed_values_behave_the_same() {
    for seed in [u64::MAX, u64::MAX / 2, 0xdead_beef_cafe_f00d] {
        run_self_test(seed).unwrap();
    }
}
