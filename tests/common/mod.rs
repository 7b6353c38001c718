//! Shared helpers for the end-to-end tests

use std::panic::{catch_unwind, UnwindSafe};

/// Run `f` with each seed until one run passes its assertions; panic only
/// if every seed fails. Keeps the statistical scenarios deterministic
/// without hanging them on a single draw.
pub fn retry_seeds<F>(seeds: &[u64], f: F)
where
    F: Fn(u64) + UnwindSafe + Copy + std::panic::RefUnwindSafe,
{
    for &seed in seeds {
        if catch_unwind(|| f(seed)).is_ok() {
            return;
        }
        eprintln!("retry_seeds: seed {:#x} failed, retrying", seed);
    }
    panic!("retry_seeds: all {} seeds failed assertions", seeds.len());
}
