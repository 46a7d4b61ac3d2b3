//! Protocol configuration knobs.

/// Tunable limits and policies for the messaging core.
///
/// The defaults match deployed practice; hosts override fields as
/// needed and pass the same configuration to the key manager and the
/// session manager.
#[derive(Debug, Clone)]
pub struct Config {
    /// Ceiling on chain advance within a single decrypt call
    pub max_skip: u32,

    /// Ceiling on cached skipped-message keys per session; oldest
    /// entries are evicted first
    pub max_cached_keys: usize,

    /// One-time pre-keys generated per replenishment batch
    pub opk_batch_size: u32,

    /// Server-visible count below which the pool should be refilled
    pub opk_refill_threshold: u32,

    /// Signed pre-key age, in days, that triggers rotation
    pub spk_rotation_days: u32,

    /// Application identifier mixed into safety-number derivation
    pub app_id: Vec<u8>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_skip: 1000,
            max_cached_keys: 2000,
            opk_batch_size: 100,
            opk_refill_threshold: 20,
            spk_rotation_days: 30,
            app_id: b"whispercore".to_vec(),
        }
    }
}

impl Config {
    /// Rotation interval in seconds
    #[must_use]
    pub(crate) fn spk_rotation_secs(&self) -> u64 {
        u64::from(self.spk_rotation_days) * 86_400
    }
}
