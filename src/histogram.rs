use core::sync::atomic::Ordering;

use crate::bins::BinTable;
use crate::config::Config;
use crate::errors::BuildError;
use crate::snapshot::Snapshot;
use crate::_Histograms;

/// A concurrent histogram that tracks the distribution of occurrences of
/// `u64` values in logarithmically sized buckets.
///
/// Counter storage is sparse: buckets are grouped into runs of
/// `2^sigbits`, and a run's counters are allocated the first time any
/// value lands in it, so a histogram that only sees a narrow range of
/// values stays small.
///
/// Updates are lock-free and callable from any number of threads. Reads
/// may run beside writers but do not observe a consistent cut of the
/// counters; take a [`Snapshot`] before computing ranks or quantiles.
pub struct Histogram {
    pub(crate) config: Config,
    pub(crate) table: BinTable,
}

impl _Histograms for Histogram {
    fn config(&self) -> &Config {
        &self.config
    }

    fn count_for_key(&self, key: usize) -> u64 {
        match self.table.get(self.config.bin_of(key)) {
            Some(counters) => counters[self.config.slot_of(key)].load(Ordering::Relaxed),
            None => 0,
        }
    }
}

impl Histogram {
    /// Construct a new `Histogram`. `sigbits` sets the number of
    /// significant value bits preserved by the bucketing: each binary
    /// decade is split into `2^sigbits` buckets, and values below
    /// `2^sigbits` are recorded exactly.
    ///
    /// # Constraints
    /// * `sigbits` must be in the range `1..=15`
    pub fn new(sigbits: u8) -> Result<Self, BuildError> {
        let config = Config::new(sigbits)?;

        Ok(Self {
            table: BinTable::new(config.binsize()),
            config,
        })
    }

    /// The configured number of significant bits.
    pub fn sigbits(&self) -> u8 {
        self.config.sigbits()
    }

    /// Resident size in bytes: the container plus the counters of every
    /// allocated bucket run.
    pub fn size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.table.installed() * self.config.binsize() * std::mem::size_of::<u64>()
    }

    /// Record one occurrence of `value`.
    pub fn increment(&self, value: u64) {
        self.add(value, 1)
    }

    /// Record `count` occurrences of `value`. A zero `count` is a no-op
    /// and does not allocate.
    pub fn add(&self, value: u64, count: u64) {
        if count == 0 {
            return;
        }
        self.add_to_key(self.config.value_to_key(value), count);
    }

    fn add_to_key(&self, key: usize, count: u64) {
        let counters = self.table.get_or_install(self.config.bin_of(key));
        counters[self.config.slot_of(key)].fetch_add(count, Ordering::Relaxed);
    }

    /// Fold `source` into this histogram, which may be configured with a
    /// different `sigbits`. Each source bucket's count is spread evenly
    /// across the target keys covering the same value range, with the
    /// remainder going to the lowest keys of the span. This handles both
    /// refinement into a finer target and coarsening into a coarser one,
    /// including the asymmetric denormal region.
    ///
    /// Callers must ensure neither histogram is concurrently written.
    pub fn merge(&self, source: &Histogram) {
        for key in 0..source.config.total_keys() {
            let count = source.count_for_key(key);
            if count == 0 {
                continue;
            }

            let lo = self.config.value_to_key(source.config.key_to_min(key));
            let hi = self.config.value_to_key(source.config.key_to_max(key));
            let span = (hi - lo + 1) as u64;
            let share = count / span;
            let rem = (count % span) as usize;

            for (i, target) in (lo..=hi).enumerate() {
                let count = share + u64::from(i < rem);
                if count > 0 {
                    self.add_to_key(target, count);
                }
            }
        }
    }

    /// Take a point-in-time copy of the counters, suitable for rank and
    /// quantile queries while writers continue.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::capture(self)
    }

    /// Asserts the bucketing invariants: total coverage of the `u64`
    /// range, contiguity of neighboring buckets, and key round-trips
    /// through the value mapping. Intended for debug builds and tests;
    /// failures are programmer errors, not recoverable states.
    pub fn validate(&self) {
        let config = &self.config;
        let keys = config.total_keys();

        assert_eq!(config.key_to_min(0), 0);
        assert_eq!(config.key_to_max(keys - 1), u64::MAX);

        for key in 1..keys {
            assert!(config.key_to_max(key - 1) < config.key_to_min(key));
            assert_eq!(config.key_to_max(key - 1) + 1, config.key_to_min(key));
        }

        for key in 0..keys {
            assert_eq!(config.value_to_key(config.key_to_min(key)), key);
            assert_eq!(config.value_to_key(config.key_to_max(key)), key);
        }
    }
}
