use core::sync::atomic::Ordering;

use crate::bucket::Bucket;
use crate::config::Config;
use crate::histogram::Histogram;
use crate::_Histograms;

/// An immutable point-in-time copy of a [`Histogram`]'s counters, carrying
/// per-bin totals and the overall population so rank and quantile queries
/// run without touching the live counters.
///
/// Counters are stored packed: only bins that were installed when the
/// snapshot was taken are present, located through a 64-bit presence
/// bitmap. Each bin's stored total equals the sum of its stored counters,
/// which is what the rank and quantile walks rely on. Bins installed after
/// the bitmap was captured are not part of the snapshot, so under
/// concurrent writes the population is a lower bound on the writes in
/// flight.
pub struct Snapshot {
    config: Config,
    binmap: u64,
    totals: Box<[u64]>,
    counts: Box<[u64]>,
    population: u64,
}

impl _Histograms for Snapshot {
    fn config(&self) -> &Config {
        &self.config
    }

    fn count_for_key(&self, key: usize) -> u64 {
        match self.bin_counts(self.config.bin_of(key)) {
            Some(counters) => counters[self.config.slot_of(key)],
            None => 0,
        }
    }
}

impl Snapshot {
    pub(crate) fn capture(histogram: &Histogram) -> Self {
        let config = histogram.config;

        // capture the set of installed bins once; bins installed while we
        // copy are left out rather than read half-filled
        let bins: Vec<_> = (0..config.bins()).map(|b| histogram.table.get(b)).collect();

        let mut binmap = 0u64;
        for (bin, counters) in bins.iter().enumerate() {
            if counters.is_some() {
                binmap |= 1u64 << bin;
            }
        }

        let present = binmap.count_ones() as usize;
        let mut totals = Vec::with_capacity(present);
        let mut counts = Vec::with_capacity(present * config.binsize());
        let mut population = 0u64;

        for counters in bins.into_iter().flatten() {
            let mut total = 0u64;
            for counter in counters {
                let count = counter.load(Ordering::Relaxed);
                counts.push(count);
                total += count;
            }
            totals.push(total);
            population += total;
        }

        Self {
            config,
            binmap,
            totals: totals.into(),
            counts: counts.into(),
            population,
        }
    }

    /// Total number of recorded samples visible in this snapshot.
    pub fn population(&self) -> u64 {
        self.population
    }

    /// The number of significant bits of the histogram this was taken from.
    pub fn sigbits(&self) -> u8 {
        self.config.sigbits()
    }

    // index of `bin` within the packed storage, if present
    fn packed_index(&self, bin: usize) -> Option<usize> {
        if self.binmap & (1u64 << bin) == 0 {
            None
        } else {
            Some((self.binmap & ((1u64 << bin) - 1)).count_ones() as usize)
        }
    }

    fn bin_total(&self, bin: usize) -> u64 {
        self.packed_index(bin).map_or(0, |index| self.totals[index])
    }

    fn bin_counts(&self, bin: usize) -> Option<&[u64]> {
        let binsize = self.config.binsize();
        self.packed_index(bin)
            .map(|index| &self.counts[index * binsize..(index + 1) * binsize])
    }

    /// The value whose position in sorted sample order is `rank`,
    /// interpolated within its bucket. Ranks at or beyond the population
    /// return `u64::MAX`.
    pub fn value_at_rank(&self, rank: u64) -> u64 {
        let mut rank = rank;

        let mut bin = 0;
        loop {
            if bin >= self.config.bins() {
                return u64::MAX;
            }
            let total = self.bin_total(bin);
            if rank < total {
                break;
            }
            rank -= total;
            bin += 1;
        }

        // a bin with a nonzero total is always present
        let Some(counters) = self.bin_counts(bin) else {
            return u64::MAX;
        };
        for (slot, &count) in counters.iter().enumerate() {
            if rank < count {
                let key = self.config.key_of(bin, slot);
                let min = self.config.key_to_min(key);
                let max = self.config.key_to_max(key);
                return min + interpolate(max - min, rank, count);
            }
            rank -= count;
        }

        u64::MAX
    }

    /// The number of recorded samples sorting below `value`, interpolated
    /// within the bucket containing it.
    pub fn rank_of_value(&self, value: u64) -> u64 {
        let key = self.config.value_to_key(value);
        let bin = self.config.bin_of(key);
        let slot = self.config.slot_of(key);

        let mut rank: u64 = (0..bin).map(|b| self.bin_total(b)).sum();
        if let Some(counters) = self.bin_counts(bin) {
            rank += counters[..slot].iter().sum::<u64>();

            let min = self.config.key_to_min(key);
            let max = self.config.key_to_max(key);
            rank += interpolate(counters[slot], value - min, max - min);
        }
        rank
    }

    /// The value at quantile `q`, with `q` clamped into `[0.0, 1.0]`.
    /// Queries on an empty snapshot return `u64::MAX`.
    pub fn value_at_quantile(&self, quantile: f64) -> u64 {
        let quantile = quantile.clamp(0.0, 1.0);
        self.value_at_rank((quantile * self.population as f64) as u64)
    }

    /// The quantile at which `value` falls, in `[0.0, 1.0]`. NaN on an
    /// empty snapshot.
    pub fn quantile_of_value(&self, value: u64) -> f64 {
        self.rank_of_value(value) as f64 / self.population as f64
    }

    /// Iterates the occupied buckets in value order.
    pub fn buckets(&self) -> impl Iterator<Item = Bucket> + '_ {
        (0..self.config.total_keys()).filter_map(|key| {
            let count = self.count_for_key(key);
            (count != 0).then(|| Bucket {
                count,
                min: self.config.key_to_min(key),
                max: self.config.key_to_max(key),
            })
        })
    }
}

// Linear interpolation across a bucket, evaluated in floating point. A zero
// divisor pins the result to an endpoint: the low end when the numerator is
// also zero, the high end otherwise.
fn interpolate(span: u64, numer: u64, denom: u64) -> u64 {
    if denom == 0 {
        if numer == 0 {
            0
        } else {
            span
        }
    } else {
        (span as f64 * (numer as f64 / denom as f64)) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::sync::Arc;

    #[test]
    fn empty_snapshot_has_no_ranks() {
        let snapshot = Histogram::new(5).unwrap().snapshot();
        assert_eq!(snapshot.population(), 0);
        assert_eq!(snapshot.value_at_rank(0), u64::MAX);
        assert_eq!(snapshot.value_at_quantile(0.5), u64::MAX);
        assert!(snapshot.quantile_of_value(42).is_nan());
    }

    #[test]
    fn single_sample_ranks() {
        let histogram = Histogram::new(5).unwrap();
        histogram.increment(42);

        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.value_at_rank(0), 42);
        assert_eq!(snapshot.value_at_rank(1), u64::MAX);
    }

    #[test]
    fn median_interpolates_within_bucket() {
        let histogram = Histogram::new(5).unwrap();
        for value in 100..200u64 {
            histogram.increment(value);
        }

        let snapshot = histogram.snapshot();
        let median = snapshot.value_at_quantile(0.5);
        assert!((149..=150).contains(&median), "median {median}");

        let rank = snapshot.rank_of_value(150);
        assert!((49..=51).contains(&rank), "rank {rank}");

        let quantile = snapshot.quantile_of_value(150);
        assert!((quantile - 0.5).abs() < 0.03, "quantile {quantile}");
    }

    #[test]
    fn quantile_is_clamped() {
        let histogram = Histogram::new(5).unwrap();
        for value in 0..100u64 {
            histogram.increment(value);
        }

        let snapshot = histogram.snapshot();
        assert_eq!(
            snapshot.value_at_quantile(-0.5),
            snapshot.value_at_quantile(0.0)
        );
        assert_eq!(
            snapshot.value_at_quantile(1.5),
            snapshot.value_at_quantile(1.0)
        );
    }

    #[test]
    fn value_at_rank_is_monotone() {
        let mut rng = rand::thread_rng();
        let histogram = Histogram::new(4).unwrap();
        for _ in 0..10_000 {
            histogram.increment(rng.gen_range(0..1_000_000_000));
        }

        let snapshot = histogram.snapshot();
        let mut previous = 0;
        for rank in 0..snapshot.population() {
            let value = snapshot.value_at_rank(rank);
            assert!(value >= previous, "rank {rank}");
            previous = value;
        }
    }

    #[test]
    fn rank_of_value_is_monotone() {
        let mut rng = rand::thread_rng();
        let histogram = Histogram::new(4).unwrap();
        for _ in 0..10_000 {
            histogram.increment(rng.gen_range(0..1_000_000));
        }

        let snapshot = histogram.snapshot();
        let mut previous = 0;
        for value in (0..2_000_000u64).step_by(1000) {
            let rank = snapshot.rank_of_value(value);
            assert!(rank >= previous, "value {value}");
            previous = rank;
        }
        assert_eq!(snapshot.rank_of_value(u64::MAX), snapshot.population());
    }

    #[test]
    fn rank_inverts_value_at_rank() {
        let mut rng = rand::thread_rng();
        let histogram = Histogram::new(6).unwrap();
        for _ in 0..5_000 {
            histogram.increment(rng.gen_range(0..1_000_000_000));
        }

        let snapshot = histogram.snapshot();
        for rank in (0..snapshot.population()).step_by(37) {
            let recovered = snapshot.rank_of_value(snapshot.value_at_rank(rank));
            assert!(
                recovered.abs_diff(rank) <= 1,
                "rank {rank} recovered {recovered}"
            );
        }
    }

    #[test]
    fn buckets_iterator_accounts_for_population() {
        let mut rng = rand::thread_rng();
        let histogram = Histogram::new(5).unwrap();
        for _ in 0..1000 {
            histogram.increment(rng.gen::<u64>());
        }

        let snapshot = histogram.snapshot();
        let total: u64 = snapshot.buckets().map(|bucket| bucket.count()).sum();
        assert_eq!(total, snapshot.population());
        assert!(snapshot.buckets().all(|bucket| bucket.count() > 0));
    }

    #[test]
    fn concurrent_writers_conserve_counts() {
        const THREADS: u64 = 8;
        const SAMPLES: u64 = 125_000;

        let histogram = Arc::new(Histogram::new(5).unwrap());

        let mut handles = Vec::new();
        for _ in 0..THREADS {
            let histogram = histogram.clone();
            handles.push(std::thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let mut samples = Vec::with_capacity(SAMPLES as usize);
                for _ in 0..SAMPLES {
                    let value = rng.gen_range(0..1_000_000_000u64);
                    histogram.increment(value);
                    samples.push(value);
                }
                samples
            }));
        }

        let mut reference: Vec<u64> = Vec::new();
        for handle in handles {
            reference.extend(handle.join().unwrap());
        }

        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.population(), THREADS * SAMPLES);

        reference.sort_unstable();
        let p90_reference = reference[reference.len() * 9 / 10] as f64;
        let p90 = snapshot.value_at_quantile(0.9) as f64;
        assert!(
            (p90 - p90_reference).abs() / p90_reference < 0.1,
            "p90 {p90} reference {p90_reference}"
        );
    }

    #[test]
    fn interpolate_pins_degenerate_cases() {
        assert_eq!(interpolate(100, 0, 0), 0);
        assert_eq!(interpolate(100, 5, 0), 100);
        assert_eq!(interpolate(100, 1, 2), 50);
        assert_eq!(interpolate(1, 1, 2), 0);
    }
}
