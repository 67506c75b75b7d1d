//! This crate provides a compact histogram for recording `u64` measurements
//! (latencies, byte counts, sizes) at high rates and summarizing their
//! distribution offline.
//!
//! Buckets are laid out on a logarithmic grid with `2^sigbits` linear
//! subdivisions per binary decade, which bounds the relative error of any
//! reported value while covering the full 64-bit range with a modest number
//! of buckets. Values below `2^sigbits` are recorded exactly. Counter
//! storage is sparse and allocated lazily, so histograms that only ever see
//! a narrow range of values stay small.
//!
//! * [`Histogram`] - the live histogram, updatable from any number of
//!   threads without locking
//! * [`Snapshot`] - a frozen point-in-time copy used for rank and quantile
//!   queries
//!
//! Recording a value is a single relaxed fetch-add once the containing
//! bucket run has been allocated. Counters read while writers are active do
//! not form a consistent view, so rank and quantile queries are only
//! offered on snapshots.

mod bins;
mod bucket;
mod config;
mod errors;
mod histogram;
mod snapshot;

pub use bucket::Bucket;
pub use errors::BuildError;
pub use histogram::Histogram;
pub use snapshot::Snapshot;

use crate::config::Config;

/// A private trait that allows us to share logic across the live histogram
/// and its snapshots.
trait _Histograms {
    fn config(&self) -> &Config;

    fn count_for_key(&self, key: usize) -> u64;

    fn get_bucket(&self, key: usize) -> Bucket {
        Bucket {
            count: self.count_for_key(key),
            min: self.config().key_to_min(key),
            max: self.config().key_to_max(key),
        }
    }
}

/// Summary reads shared by [`Histogram`] and [`Snapshot`].
pub trait Histograms {
    /// The bucket for `key`: its value range and current count. `None` when
    /// `key` is out of range. On a live histogram the count is a relaxed
    /// read that may trail concurrent writers.
    fn get(&self, key: usize) -> Option<Bucket>;

    /// Mean and biased variance of the recorded distribution, treating
    /// every sample as falling at the midpoint of its bucket. Both are NaN
    /// when no samples have been recorded. Callers wanting the standard
    /// deviation take the square root of the variance.
    fn mean_variance(&self) -> (f64, f64);
}

impl<T: _Histograms> Histograms for T {
    fn get(&self, key: usize) -> Option<Bucket> {
        (key < self.config().total_keys()).then(|| self.get_bucket(key))
    }

    fn mean_variance(&self) -> (f64, f64) {
        let mut population = 0.0;
        let mut mean = 0.0;
        let mut sigma = 0.0;

        for key in 0..self.config().total_keys() {
            let bucket = self.get_bucket(key);
            if bucket.count() == 0 {
                continue;
            }
            let count = bucket.count() as f64;

            let delta = bucket.midpoint() - mean;
            population += count;
            mean += count * delta / population;
            sigma += count * delta * (bucket.midpoint() - mean);
        }

        if population == 0.0 {
            (f64::NAN, f64::NAN)
        } else {
            (mean, sigma / population)
        }
    }
}
