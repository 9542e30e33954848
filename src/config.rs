//! Tunable knobs for nodes and the scheduler.
//!
//! Plain structs with `Default` impls rather than an external config-file
//! format: runtime tuning is passed through typed config structs at
//! construction, not loaded from a file.

/// Blend weights for an image mixer node: `output = alpha*a + beta*b + gamma`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixerConfig {
    pub alpha: f32,
    pub beta: f32,
    pub gamma: f32,
}

impl Default for MixerConfig {
    fn default() -> Self {
        MixerConfig {
            alpha: 0.5,
            beta: 0.5,
            gamma: 0.0,
        }
    }
}

/// Shared configuration for detector nodes (FAST, Harris).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorConfig {
    /// Minimum corner response accepted as a keypoint.
    pub threshold: u8,
    /// Maximum number of keypoints the detector's output texture can hold.
    pub capacity: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            threshold: 32,
            capacity: 512,
        }
    }
}

/// Maximum number of keypoints a clipper node retains, highest score first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipperConfig {
    pub size: usize,
}

impl Default for ClipperConfig {
    fn default() -> Self {
        ClipperConfig { size: 256 }
    }
}

/// Configuration for a Lucas-Kanade-style tracker node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerConfig {
    pub window: u32,
    pub iterations: u32,
    pub pyramid_depth: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            window: 15,
            iterations: 10,
            pyramid_depth: 3,
        }
    }
}

/// Governs what happens when `Pipeline::run` is called while a previous
/// run's `Execution` has not been retired.
///
/// The primary enforcement of "at most one run in flight" is structural: a
/// live `Execution<'_>` holds `&mut Pipeline`, so the borrow checker already
/// refuses a second `run()` call through the safe API. `SchedulerPolicy` is
/// kept so a future multi-pipeline scheduler built on top of this crate has
/// a place to plug in its own queueing discipline, queued (FIFO) or
/// rejected outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerPolicy {
    #[default]
    Queue,
    RejectBusy,
}

/// Top-level engine configuration: device selection policy plus per-kind
/// node defaults used by the `nodes::*` factories when no explicit config is
/// supplied.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EngineConfig {
    pub scheduler_policy: SchedulerPolicy,
    pub mixer: MixerConfig,
    pub detector: DetectorConfig,
    pub clipper: ClipperConfig,
    pub tracker: TrackerConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixer_default_is_plain_average() {
        let m = MixerConfig::default();
        assert_eq!(m.alpha, 0.5);
        assert_eq!(m.beta, 0.5);
        assert_eq!(m.gamma, 0.0);
    }

    #[test]
    fn engine_config_default_queues_rather_than_rejects() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.scheduler_policy, SchedulerPolicy::Queue);
    }
}
