//! Repository configuration

use bon::Builder;

use crate::car::CarMode;

/// Maximum operations in a single commit under sync v1.1
pub const DEFAULT_MAX_OPS_PER_COMMIT: usize = 200;

/// Options for a [`Repository`](crate::Repository)
///
/// ```
/// use atrepo::{RepoConfig, car::CarMode};
///
/// let config = RepoConfig::new().car_mode(CarMode::Lenient).build();
/// assert_eq!(config.max_ops_per_commit, 200);
/// assert!(!config.verify_reads);
/// ```
#[derive(Debug, Clone, Builder)]
#[builder(start_fn = new)]
pub struct RepoConfig {
    /// CAR decode policy for imported archives
    #[builder(default)]
    pub car_mode: CarMode,
    /// Reject writes and diffs with more operations than this
    #[builder(default = DEFAULT_MAX_OPS_PER_COMMIT)]
    pub max_ops_per_commit: usize,
    /// Re-hash blocks returned by the store when loading MST nodes and records
    #[builder(default = false)]
    pub verify_reads: bool,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self::new().build()
    }
}
