//! Process-unique 64-bit identifiers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// Identifier of a module, field or bus endpoint.
pub type Uid = u64;

/// Receiver uid meaning "everyone". Encoded as `-1` on the wire.
pub const BROADCAST_UID: Uid = u64::MAX;

struct UidSeed {
    base: Instant,
    seed: u64,
}

fn seed() -> &'static UidSeed {
    static SEED: OnceLock<UidSeed> = OnceLock::new();
    SEED.get_or_init(|| UidSeed {
        base: Instant::now(),
        // Keep the top bit clear so uids stay positive as i64.
        seed: rand::random::<u64>() >> 2,
    })
}

/// Generate a uid that is unique within this process.
///
/// A random per-process seed is offset by a monotonic clock reading; the
/// result is forced strictly above the last issued uid, so concurrent
/// callers never collide. [`BROADCAST_UID`] is never returned.
pub fn generate_uid() -> Uid {
    static LAST: AtomicU64 = AtomicU64::new(0);

    let s = seed();
    let elapsed = s.base.elapsed().as_nanos() as u64;
    let candidate = s.seed.wrapping_add(elapsed) & (i64::MAX as u64);

    let mut last = LAST.load(Ordering::Relaxed);
    loop {
        let mut next = if candidate > last {
            candidate
        } else {
            last.wrapping_add(1)
        };
        if next == BROADCAST_UID {
            next = 0;
        }
        match LAST.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(current) => last = current,
        }
    }
}
