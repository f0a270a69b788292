//! Busy-wait helpers.
//!
//! Nothing here yields to the OS or a scheduler. Callers running inside a
//! cooperative runtime get bounded spinning at worst.

use std::cell::Cell;
use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;

use crossbeam_utils::Backoff;

/// Number of counted xorshift rounds per contended backoff.
const CONTENDED_SPINS: u32 = 1 << 8;

thread_local! {
    static SEED: Cell<u32> = Cell::new(thread_seed());
}

fn thread_seed() -> u32 {
    #[allow(clippy::cast_possible_truncation)]
    let seed = RandomState::new().hash_one(std::thread::current().id()) as u32;
    // xorshift state must never be zero
    seed | 1
}

/// Jittered spin after losing a CAS race on a shared index.
///
/// Each round advances a thread-local xorshift generator and only rounds that
/// land on a non-negative value count, so competing producers wake at
/// different times instead of colliding again in lockstep.
#[cold]
pub(crate) fn contended() {
    SEED.with(|seed| {
        let mut r = seed.get();
        let mut spins = CONTENDED_SPINS;
        while spins > 0 {
            r ^= r << 1;
            r ^= r >> 3;
            r ^= r << 10;
            #[allow(clippy::cast_possible_wrap)]
            let counted = r as i32 >= 0;
            if counted {
                spins -= 1;
            }
            std::hint::spin_loop();
        }
        seed.set(r);
    });
}

/// Spins until `ready` returns `true`.
///
/// Used where another thread has claimed an index and is guaranteed to finish
/// publishing it shortly.
#[inline]
pub(crate) fn spin_until(mut ready: impl FnMut() -> bool) {
    if ready() {
        return;
    }
    let backoff = Backoff::new();
    while !ready() {
        backoff.spin();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn seed_is_never_zero() {
        for _ in 0..16 {
            let seed = thread::spawn(thread_seed).join().unwrap();
            assert_ne!(seed, 0);
        }
    }

    #[test]
    fn contended_advances_seed() {
        let before = SEED.with(Cell::get);
        contended();
        let after = SEED.with(Cell::get);
        assert_ne!(before, after);
        assert_ne!(after, 0);
    }

    #[test]
    fn spin_until_sees_flag_from_other_thread() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = {
            let flag = Arc::clone(&flag);
            thread::spawn(move || flag.store(true, Ordering::Release))
        };

        spin_until(|| flag.load(Ordering::Acquire));
        setter.join().unwrap();
    }
}
