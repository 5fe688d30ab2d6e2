//! Process-wide configuration: admission limits and naming conventions.
//!
//! Initialized once at startup and never mutated afterwards.

use std::sync::OnceLock;

/// Magic etag accepted only for server-internal refreshes (runner
/// runtime-info patches, descriptor size accounting). External callers
/// must always present the etag they read.
pub const ETAG_ANY: i64 = -1;

#[derive(Debug, Clone)]
pub struct Limits {
    /// Hard cap on jobs in one build, dynamic insertions included.
    pub max_jobs_per_build: usize,
    pub max_steps_per_job: usize,
    /// Maximum accepted build definition size, in bytes.
    pub max_config_bytes: usize,
    /// Upper bound on search page sizes.
    pub max_page_size: usize,
    /// File names probed for a build definition at the repository root,
    /// in priority order.
    pub config_file_names: Vec<String>,
    /// Prefix applied to container names created for jobs.
    pub docker_name_prefix: String,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_jobs_per_build: 250,
            max_steps_per_job: 50,
            max_config_bytes: 1024 * 1024,
            max_page_size: 100,
            config_file_names: vec![
                ".conveyor.kdl".to_string(),
                ".conveyor.json".to_string(),
                ".conveyor.jsont".to_string(),
            ],
            docker_name_prefix: "conveyor".to_string(),
        }
    }
}

static LIMITS: OnceLock<Limits> = OnceLock::new();

/// Install process-wide limits. Returns `Err` with the rejected value when
/// limits were already installed (first caller wins).
pub fn init_limits(limits: Limits) -> std::result::Result<(), Limits> {
    LIMITS.set(limits)
}

/// The active limits; defaults apply if nothing was installed.
pub fn limits() -> &'static Limits {
    LIMITS.get_or_init(Limits::default)
}
