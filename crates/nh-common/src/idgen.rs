//! Unique ID generation for messages, tasks, and receipts.
//!
//! Two generators are offered, both monotonic per instance and safe under
//! concurrent use from multiple threads:
//!
//! - [`IdGenerator`]: timestamp-nanos + atomically-incremented counter + 4
//!   cryptographically-random bytes, concatenated into an opaque string.
//! - [`SnowflakeGenerator`]: the classic 41/10/12-bit layout (epoch-delta
//!   millis | machine id | sequence), encoded as a 64-bit integer.
//!
//! Neither generator ever panics or blocks: if the random source is
//! unavailable, [`IdGenerator`] falls back to the counter bytes alone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;

/// Process-wide default generator, used by `Message::builder().build()` to
/// assign an ID when the caller didn't set one explicitly.
pub fn default_generator() -> &'static IdGenerator {
    static GEN: OnceLock<IdGenerator> = OnceLock::new();
    GEN.get_or_init(IdGenerator::new)
}

/// Default ID generator: `<prefix>_<ts>_<seq>_<rand4>`.
///
/// Collision-free across any two calls within a process, regardless of how
/// many threads call `generate` concurrently: the timestamp component can
/// collide, but the atomically-incremented sequence cannot.
#[derive(Debug)]
pub struct IdGenerator {
    counter: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Generate a unique ID with no prefix (`msg` is used as the default tag).
    pub fn generate(&self) -> String {
        self.generate_with_prefix("msg")
    }

    /// Generate a unique ID tagged with `prefix`.
    pub fn generate_with_prefix(&self, prefix: &str) -> String {
        let ts = current_nanos();
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let rand_suffix = random_hex4();
        format!("{prefix}_{ts}_{seq}_{rand_suffix}")
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn current_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos()
}

/// 4 cryptographically-random bytes, hex-encoded. Falls back to zero bytes
/// (never panics, never blocks) if the OS RNG is unavailable — the counter
/// and timestamp components still guarantee uniqueness in that case.
fn random_hex4() -> String {
    let mut buf = [0u8; 4];
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        rand::thread_rng().fill_bytes(&mut buf);
    })) {
        Ok(()) => {}
        Err(_) => buf = [0u8; 4],
    }
    hex_encode(&buf)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Snowflake-style monotonic ID generator: 41 bits epoch-delta-millis |
/// 10 bits machine id (masked) | 12 bits sequence.
#[derive(Debug)]
pub struct SnowflakeGenerator {
    machine_id: u64,
    state: AtomicU64,
    epoch_millis: u64,
}

const SEQUENCE_BITS: u32 = 12;
const MACHINE_ID_BITS: u32 = 10;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const MACHINE_ID_MASK: u64 = (1 << MACHINE_ID_BITS) - 1;

impl SnowflakeGenerator {
    /// `machine_id` is masked to 10 bits.
    pub fn new(machine_id: u64) -> Self {
        Self::with_epoch(machine_id, 1_577_836_800_000) // 2020-01-01T00:00:00Z
    }

    pub fn with_epoch(machine_id: u64, epoch_millis: u64) -> Self {
        Self {
            machine_id: machine_id & MACHINE_ID_MASK,
            state: AtomicU64::new(0),
            epoch_millis,
        }
    }

    /// Generate the next monotonic 64-bit ID.
    ///
    /// If the sequence for the current millisecond is exhausted, spins
    /// forward to the next millisecond rather than blocking on anything
    /// external (never panics).
    pub fn generate(&self) -> u64 {
        loop {
            let now = current_millis().saturating_sub(self.epoch_millis);
            let prev = self.state.load(Ordering::Acquire);
            let prev_ts = prev >> SEQUENCE_BITS;

            let (ts, seq) = if now > prev_ts {
                (now, 0)
            } else {
                let next_seq = (prev & SEQUENCE_MASK) + 1;
                if next_seq > SEQUENCE_MASK {
                    // Sequence exhausted this millisecond: advance and retry.
                    continue;
                }
                (prev_ts, next_seq)
            };

            let next_state = (ts << SEQUENCE_BITS) | seq;
            if self
                .state
                .compare_exchange(prev, next_state, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return (ts << (SEQUENCE_BITS + MACHINE_ID_BITS))
                    | (self.machine_id << SEQUENCE_BITS)
                    | seq;
            }
        }
    }

    pub fn generate_string(&self) -> String {
        self.generate().to_string()
    }
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn generate_is_unique_single_threaded() {
        let gen = IdGenerator::new();
        let ids: HashSet<_> = (0..10_000).map(|_| gen.generate()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn generate_with_prefix_has_expected_shape() {
        let gen = IdGenerator::new();
        let id = gen.generate_with_prefix("task");
        let parts: Vec<_> = id.split('_').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "task");
    }

    #[test]
    fn generate_is_unique_across_threads() {
        let gen = Arc::new(IdGenerator::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let gen = gen.clone();
            handles.push(thread::spawn(move || {
                (0..1000).map(|_| gen.generate()).collect::<Vec<_>>()
            }));
        }
        let mut all = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(all.insert(id), "duplicate id generated under concurrency");
            }
        }
        assert_eq!(all.len(), 16 * 1000);
    }

    #[test]
    fn snowflake_is_monotonic_and_unique() {
        let gen = SnowflakeGenerator::new(7);
        let mut prev = 0u64;
        let mut seen = HashSet::new();
        for _ in 0..5000 {
            let id = gen.generate();
            assert!(id > prev, "snowflake ids must be strictly increasing");
            assert!(seen.insert(id));
            prev = id;
        }
    }

    #[test]
    fn snowflake_masks_machine_id_to_10_bits() {
        let gen = SnowflakeGenerator::new(u64::MAX);
        assert_eq!(gen.machine_id, MACHINE_ID_MASK);
    }

    #[test]
    fn snowflake_unique_across_threads() {
        let gen = Arc::new(SnowflakeGenerator::new(1));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let gen = gen.clone();
            handles.push(thread::spawn(move || {
                (0..2000).map(|_| gen.generate()).collect::<Vec<_>>()
            }));
        }
        let mut all = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(all.insert(id));
            }
        }
        assert_eq!(all.len(), 8 * 2000);
    }
}
