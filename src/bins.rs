use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::ptr;

use crate::config::BINS;

/// Two-level counter storage: a fixed top index of bins, each of which is
/// either unallocated or a dense array of `binsize` counters installed at
/// most once for the table's lifetime.
///
/// Each bin pointer is a one-shot publication cell. Readers acquire-load
/// it; a null pointer means every counter in the bin reads as zero. The
/// first writer to compare-and-swap from null wins, and the loser frees its
/// array and continues with the winner's. The acquire on the load pairs
/// with the release of a successful install, so a non-null pointer always
/// refers to fully zero-initialized counters.
pub(crate) struct BinTable {
    bins: [AtomicPtr<AtomicU64>; BINS],
    binsize: usize,
}

impl BinTable {
    pub fn new(binsize: usize) -> Self {
        Self {
            bins: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            binsize,
        }
    }

    /// The counters for `bin`, if the bin has been installed.
    pub fn get(&self, bin: usize) -> Option<&[AtomicU64]> {
        let counters = self.bins[bin].load(Ordering::Acquire);
        if counters.is_null() {
            None
        } else {
            // a published pointer is never replaced or freed before drop
            Some(unsafe { std::slice::from_raw_parts(counters, self.binsize) })
        }
    }

    /// The counters for `bin`, installing them first if absent.
    pub fn get_or_install(&self, bin: usize) -> &[AtomicU64] {
        match self.get(bin) {
            Some(counters) => counters,
            None => self.install(bin),
        }
    }

    fn install(&self, bin: usize) -> &[AtomicU64] {
        let fresh: Box<[AtomicU64]> = (0..self.binsize).map(|_| AtomicU64::new(0)).collect();
        let fresh = Box::into_raw(fresh) as *mut AtomicU64;

        let counters = match self.bins[bin].compare_exchange(
            ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => fresh,
            Err(winner) => {
                // lost the race: discard our array, use the winner's
                unsafe { drop_counters(fresh, self.binsize) };
                winner
            }
        };

        unsafe { std::slice::from_raw_parts(counters, self.binsize) }
    }

    /// Number of installed bins.
    pub fn installed(&self) -> usize {
        self.bins
            .iter()
            .filter(|bin| !bin.load(Ordering::Relaxed).is_null())
            .count()
    }
}

impl Drop for BinTable {
    fn drop(&mut self) {
        for bin in self.bins.iter() {
            let counters = bin.swap(ptr::null_mut(), Ordering::Relaxed);
            if !counters.is_null() {
                unsafe { drop_counters(counters, self.binsize) };
            }
        }
    }
}

/// # Safety
/// `counters` must have come from `Box::into_raw` on a boxed slice of
/// exactly `binsize` counters, and must not be referenced afterwards.
unsafe fn drop_counters(counters: *mut AtomicU64, binsize: usize) {
    drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
        counters, binsize,
    )));
}
