use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use lru::LruCache;

use crate::dataset::{Rect, TileData};
use crate::error::TileComputationError;

type TileResult = Result<Arc<TileData>, TileComputationError>;

/// Identifies one region of one dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TileKey {
    pub dataset: u64,
    pub rect: Rect,
}

/// Counters describing how the cache has been used so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Requests answered directly from the cache.
    pub hits: u64,
    /// Requests which had to wait for, or perform, a computation.
    pub misses: u64,
    /// Tile computations actually performed.
    pub computations: u64,
    /// Tiles dropped to make room for newer ones.
    pub evictions: u64,
}

struct State {
    /// `None` when the capacity is zero.
    tiles: Option<LruCache<TileKey, Arc<TileData>>>,
    /// Computations currently running, shared by every requester of the key.
    in_flight: HashMap<TileKey, Arc<OnceLock<TileResult>>>,
    /// Invalidated datasets. Ids are never reused, so their tiles are never
    /// retained again.
    retired: HashSet<u64>,
    stats: CacheStats,
}

/// Capacity bounded, least-recently-used tile cache shared by every worker.
///
/// The only way to mutate the cache is [`TileCache::get_or_compute`], which
/// coalesces concurrent requests for the same key onto one computation. A
/// capacity of zero disables retention entirely: finished tiles are handed to
/// whoever was waiting for them and then forgotten.
pub struct TileCache {
    capacity: usize,
    state: Mutex<State>,
}

impl TileCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(State {
                tiles: NonZeroUsize::new(capacity).map(LruCache::new),
                in_flight: HashMap::new(),
                retired: HashSet::new(),
                stats: CacheStats::default(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tiles currently retained.
    pub fn len(&self) -> usize {
        self.lock().tiles.as_ref().map_or(0, LruCache::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }

    /// Drops every retained tile. Computations in flight are not affected.
    pub fn clear(&self) {
        if let Some(tiles) = self.lock().tiles.as_mut() {
            tiles.clear();
        }
    }

    /// Drops every retained tile belonging to one dataset. Computations of
    /// that dataset still in flight finish, but their tiles are not retained.
    pub(crate) fn invalidate(&self, dataset: u64) {
        let mut state = self.lock();
        state.retired.insert(dataset);
        if let Some(tiles) = state.tiles.as_mut() {
            let stale: Vec<TileKey> = tiles
                .iter()
                .map(|(key, _)| *key)
                .filter(|key| key.dataset == dataset)
                .collect();

            for key in stale {
                tiles.pop(&key);
            }
        }
    }

    /// Returns the tile for `key`, running `compute` at most once per key for
    /// all requesters that overlap in time. The lock is never held while
    /// `compute` runs, so computations may recursively request other tiles.
    pub(crate) fn get_or_compute<F>(&self, key: TileKey, compute: F) -> TileResult
    where
        F: FnOnce() -> TileResult,
    {
        let cell = {
            let mut state = self.lock();

            let cached = state.tiles.as_mut().and_then(|tiles| tiles.get(&key)).cloned();
            if let Some(tile) = cached {
                state.stats.hits += 1;
                return Ok(tile);
            }

            state.stats.misses += 1;
            state.in_flight.entry(key).or_default().clone()
        };

        let mut computed = false;
        let result = cell
            .get_or_init(|| {
                computed = true;
                compute()
            })
            .clone();

        if computed {
            let mut state = self.lock();
            state.in_flight.remove(&key);
            state.stats.computations += 1;

            if let Ok(tile) = &result
                && !state.retired.contains(&key.dataset)
            {
                let pushed = state
                    .tiles
                    .as_mut()
                    .and_then(|tiles| tiles.push(key, tile.clone()));

                if let Some((evicted, _)) = pushed
                    && evicted != key
                {
                    state.stats.evictions += 1;
                    tracing::trace!(rect = %evicted.rect, "evicted tile");
                }
            }
        }

        result
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for TileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::error::TileErrorKind;

    fn key(dataset: u64, x: u32) -> TileKey {
        TileKey {
            dataset,
            rect: Rect::new(x, 0, 4, 4),
        }
    }

    fn tile(x: u32, value: f64) -> TileResult {
        Ok(Arc::new(TileData::filled(Rect::new(x, 0, 4, 4), 1, value)))
    }

    #[test]
    fn test_concurrent_requests_compute_once() {
        const CALLERS: usize = 16;

        let cache = Arc::new(TileCache::new(8));
        let count = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(CALLERS));

        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let cache = cache.clone();
                let count = count.clone();
                let barrier = barrier.clone();

                thread::spawn(move || {
                    barrier.wait();
                    cache.get_or_compute(key(1, 0), || {
                        count.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(50));
                        tile(0, 7.0)
                    })
                })
            })
            .collect();

        let results: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap().unwrap())
            .collect();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|t| Arc::ptr_eq(t, &results[0])));
        assert_eq!(cache.stats().computations, 1);
    }

    #[test]
    fn test_cached_tile_is_reused() {
        let cache = TileCache::new(4);
        let count = AtomicUsize::new(0);

        for _ in 0..3 {
            cache
                .get_or_compute(key(1, 0), || {
                    count.fetch_add(1, Ordering::SeqCst);
                    tile(0, 1.0)
                })
                .unwrap();
        }

        assert_eq!(count.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_zero_capacity_always_recomputes() {
        let cache = TileCache::new(0);
        let count = AtomicUsize::new(0);

        for _ in 0..3 {
            cache
                .get_or_compute(key(1, 0), || {
                    count.fetch_add(1, Ordering::SeqCst);
                    tile(0, 1.0)
                })
                .unwrap();
        }

        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_eviction() {
        let cache = TileCache::new(2);

        cache.get_or_compute(key(1, 0), || tile(0, 0.0)).unwrap();
        cache.get_or_compute(key(1, 4), || tile(4, 0.0)).unwrap();
        // touch the first one so the second becomes least recently used
        cache.get_or_compute(key(1, 0), || tile(0, 0.0)).unwrap();
        cache.get_or_compute(key(1, 8), || tile(8, 0.0)).unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 1);

        let recomputed = AtomicUsize::new(0);
        cache
            .get_or_compute(key(1, 4), || {
                recomputed.fetch_add(1, Ordering::SeqCst);
                tile(4, 0.0)
            })
            .unwrap();
        assert_eq!(recomputed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failures_are_not_cached() {
        let cache = TileCache::new(4);
        let node: Arc<str> = Arc::from("node");
        let stage: Arc<str> = Arc::from("Stage");

        let err = cache
            .get_or_compute(key(1, 0), || {
                Err(TileComputationError::failed(
                    &node,
                    &stage,
                    Rect::new(0, 0, 4, 4),
                    anyhow::anyhow!("boom"),
                ))
            })
            .unwrap_err();

        assert_eq!(err.kind, TileErrorKind::Failed);
        assert!(cache.is_empty());
        assert!(cache.get_or_compute(key(1, 0), || tile(0, 1.0)).is_ok());
    }

    #[test]
    fn test_invalidate_dataset() {
        let cache = TileCache::new(8);
        cache.get_or_compute(key(1, 0), || tile(0, 0.0)).unwrap();
        cache.get_or_compute(key(1, 4), || tile(4, 0.0)).unwrap();
        cache.get_or_compute(key(2, 0), || tile(0, 0.0)).unwrap();

        cache.invalidate(1);

        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidated_while_computing_is_not_retained() {
        let cache = TileCache::new(8);

        let result = cache.get_or_compute(key(1, 0), || {
            cache.invalidate(1);
            tile(0, 3.0)
        });

        // the requester still gets its tile
        assert_eq!(result.unwrap().sample(0, 0, 0), Some(3.0));
        assert!(cache.is_empty());
        assert_eq!(cache.stats().computations, 1);

        cache.get_or_compute(key(2, 0), || tile(0, 0.0)).unwrap();
        assert_eq!(cache.len(), 1);
    }
}
