use core_affinity::{get_core_ids, set_for_current};
use rayon::prelude::*;

use crate::error::Result;

/// A fixed-size pool of worker threads for loop-parallel, read-only scans.
/// Work is split statically: worker `k` of `n` always gets the `k`-th
/// contiguous block of the index range, so results come back in ascending
/// index order when the per-worker buffers are concatenated.
///
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    num_threads: usize,
}

impl WorkerPool {
    /// Create a pool with the given number of threads (at least one).
    ///
    pub fn new(num_threads: usize) -> Result<Self> {
        Self::build(num_threads, false)
    }

    /// Create a pool whose workers are pinned round-robin to the physical
    /// cores reported by the system. If there are fewer cores than threads,
    /// the extra threads are left unpinned.
    ///
    pub fn pinned(num_threads: usize) -> Result<Self> {
        Self::build(num_threads, true)
    }

    fn build(num_threads: usize, pin: bool) -> Result<Self> {
        let num_threads = num_threads.max(1);
        let core_ids = if pin {
            get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|index| format!("granular-worker-{}", index))
            .start_handler(move |index| {
                if let Some(core_id) = core_ids.get(index) {
                    set_for_current(*core_id);
                }
            })
            .build()?;
        Ok(Self { pool, num_threads })
    }

    /// Return the number of worker threads in the pool.
    ///
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Visit every index in `0..len` with `f`, which may push results into
    /// the per-worker buffer it is handed. Returns one buffer per worker, in
    /// worker order. `f` must not mutate shared state.
    ///
    pub fn scan_static<T, F>(&self, len: usize, f: F) -> Vec<Vec<T>>
    where
        T: Send,
        F: Fn(usize, &mut Vec<T>) + Sync,
    {
        let n = self.num_threads;
        let chunk = (len + n - 1) / n;
        let f = &f;

        self.pool.install(|| {
            (0..n)
                .into_par_iter()
                .map(|worker| {
                    let start = (worker * chunk).min(len);
                    let end = ((worker + 1) * chunk).min(len);
                    let mut buffer = Vec::new();
                    for i in start..end {
                        f(i, &mut buffer)
                    }
                    buffer
                })
                .collect()
        })
    }
}

// ============================================================================
#[cfg(test)]
mod test {

    use super::WorkerPool;

    #[test]
    fn static_scan_preserves_index_order() {
        let pool = WorkerPool::new(3).unwrap();
        let buffers = pool.scan_static(10, |i, out| {
            if i % 2 == 0 {
                out.push(i)
            }
        });
        assert_eq!(buffers.len(), 3);
        let all: Vec<_> = buffers.into_iter().flatten().collect();
        assert_eq!(all, vec![0, 2, 4, 6, 8]);
    }

    #[test]
    fn static_scan_handles_empty_range() {
        let pool = WorkerPool::new(4).unwrap();
        let buffers: Vec<Vec<usize>> = pool.scan_static(0, |i, out| out.push(i));
        assert!(buffers.iter().all(Vec::is_empty));
    }
}
