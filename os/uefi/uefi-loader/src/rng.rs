//! # Random Numbers
//!
//! An xorshift64 generator seeded once — from the firmware's RNG protocol
//! when one exists, from the timestamp counter otherwise. Consumers get
//! scrambled values through the finalizing multiplication.

use core::sync::atomic::{AtomicU64, Ordering};
use log::info;
use uefi::boot;
use uefi::proto::rng::Rng;

/// xorshift64* finalizing multiplier.
const FINALIZER: u64 = 0x2545_F491_4F6C_DD1D;

/// Generator state; zero means not yet seeded.
static STATE: AtomicU64 = AtomicU64::new(0);

fn seed() -> u64 {
    // Prefer the firmware's entropy source.
    if let Ok(handle) = boot::get_handle_for_protocol::<Rng>()
        && let Ok(mut rng) = boot::open_protocol_exclusive::<Rng>(handle)
    {
        let mut bytes = [0u8; 8];
        if rng.get_rng(None, &mut bytes).is_ok() {
            let seed = u64::from_le_bytes(bytes);
            if seed != 0 {
                info!("RNG seeded from the firmware entropy source");
                return seed;
            }
        }
    }

    // Fall back to the timestamp counter.
    let tsc: u64;
    // SAFETY: rdtsc is unprivileged.
    unsafe {
        let (lo, hi): (u32, u32);
        core::arch::asm!("rdtsc", out("eax") lo, out("edx") hi, options(nomem, nostack));
        tsc = (u64::from(hi) << 32) | u64::from(lo);
    }
    info!("RNG seeded from the timestamp counter");
    tsc | 1
}

/// The next pseudo-random value.
pub fn get_random_value() -> u64 {
    let mut state = STATE.load(Ordering::Relaxed);
    if state == 0 {
        state = seed();
    }

    // xorshift64 step, then the scrambling multiply.
    state ^= state << 13;
    state ^= state >> 7;
    state ^= state << 17;
    STATE.store(state, Ordering::Relaxed);
    state.wrapping_mul(FINALIZER)
}
