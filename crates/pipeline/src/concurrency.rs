//! Concurrency planning module for hls-forge
//!
//! Derives the two nested scheduling limits (jobs, renditions per job) from
//! CPU core count and configuration.

use crate::config::Config;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum number of videos encoding at once
    pub max_parallel_jobs: u32,
    /// Maximum concurrent encoder invocations inside one job
    pub renditions_per_job: u32,
    /// Job admissions allowed per minute
    pub admissions_per_minute: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// - Detects CPU cores via num_cpus if not specified in config
    /// - max_parallel_jobs: 1 unless explicit
    /// - renditions_per_job: 3 for 16+ cores, 2 for 8+, 1 otherwise (unless explicit)
    /// - admissions_per_minute is at least 1
    pub fn derive(cfg: &Config) -> Self {
        let total_cores = cfg
            .concurrency
            .logical_cores
            .unwrap_or_else(|| num_cpus::get() as u32);

        let max_parallel_jobs = if cfg.concurrency.max_parallel_jobs > 0 {
            cfg.concurrency.max_parallel_jobs
        } else {
            1
        };

        let renditions_per_job = if cfg.concurrency.renditions_per_job > 0 {
            cfg.concurrency.renditions_per_job
        } else {
            derive_renditions(total_cores)
        };

        Self {
            total_cores,
            max_parallel_jobs,
            renditions_per_job,
            admissions_per_minute: cfg.concurrency.admissions_per_minute.max(1),
        }
    }
}

/// Derive encoder invocations per job from core count
fn derive_renditions(cores: u32) -> u32 {
    if cores >= 16 {
        3
    } else if cores >= 8 {
        2
    } else {
        1
    }
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}
