//! In-memory forecast cache with request coalescing.
//!
//! Lookups are keyed by a coarse (grid cell, time bucket) pair so nearby
//! requests along a route share one upstream call. The entry map is the
//! only shared mutable state in the pipeline and is never locked across
//! an `.await`: concurrent callers for the same key subscribe to the single
//! in-flight fetch through a `watch` channel, unrelated keys proceed in
//! parallel.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use routecast_core::geo::METERS_PER_DEGREE_LAT;
use routecast_core::{Coordinate, PredictionConfig, WeatherError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::types::ForecastSample;

type FetchOutcome = Result<ForecastSample, WeatherError>;

/// Cache key: quantized latitude row, longitude column and time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub lat_cell: i64,
    pub lon_cell: i64,
    pub bucket: i64,
}

/// Maps coordinates and instants onto cache keys.
#[derive(Debug, Clone, Copy)]
pub struct Quantizer {
    resolution_m: f64,
    bucket_secs: i64,
}

impl Quantizer {
    pub fn new(resolution_m: f64, bucket_secs: i64) -> Self {
        Self {
            resolution_m: resolution_m.max(1.0),
            bucket_secs: bucket_secs.max(1),
        }
    }

    /// Key plus the representative cell centre and bucket instant.
    ///
    /// Cells are roughly square: each latitude row gets its own longitude
    /// step so a cell spans about `resolution_m` in both directions.
    /// Timestamps round to the nearest bucket.
    pub fn quantize(
        &self,
        coordinate: Coordinate,
        at: DateTime<Utc>,
    ) -> (CacheKey, Coordinate, DateTime<Utc>) {
        let lat_step = self.resolution_m / METERS_PER_DEGREE_LAT;
        let lat_cell = (coordinate.latitude() / lat_step).floor() as i64;
        let center_lat = ((lat_cell as f64 + 0.5) * lat_step).clamp(-90.0, 90.0);

        let meters_per_degree_lon = METERS_PER_DEGREE_LAT * center_lat.to_radians().cos().abs();
        let lon_step = (self.resolution_m / meters_per_degree_lon.max(1.0)).min(360.0);
        let lon_cell = ((coordinate.longitude() + 180.0) / lon_step).floor() as i64;
        let center_lon = (-180.0 + (lon_cell as f64 + 0.5) * lon_step).clamp(-180.0, 180.0);

        let secs = at.timestamp();
        let bucket = (secs + self.bucket_secs / 2).div_euclid(self.bucket_secs);
        let bucket_time = DateTime::from_timestamp(bucket * self.bucket_secs, 0).unwrap_or(at);

        let center = Coordinate::new(center_lat, center_lon).unwrap_or(coordinate);
        (
            CacheKey {
                lat_cell,
                lon_cell,
                bucket,
            },
            center,
            bucket_time,
        )
    }
}

/// Tuning for a `DataManager`.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// How long an entry is served without refetching
    pub ttl: Duration,
    /// How long after expiry an entry is kept as a failure fallback
    pub stale_retention: Duration,
    pub grid_resolution_m: f64,
    pub time_bucket_secs: i64,
}

impl From<&PredictionConfig> for CacheSettings {
    fn from(config: &PredictionConfig) -> Self {
        Self {
            ttl: Duration::from_secs(config.cache_ttl_seconds),
            stale_retention: Duration::from_secs(config.stale_retention_seconds),
            grid_resolution_m: config.grid_resolution_meters,
            time_bucket_secs: config.time_bucket_seconds,
        }
    }
}

/// A cached forecast with its freshness bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub sample: ForecastSample,
    /// Wall-clock time of the upstream fetch
    pub fetched_at: DateTime<Utc>,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freshness {
    Fresh,
    /// Expired but still usable as a fallback
    Stale,
    /// Past the stale retention window
    Evictable,
}

impl CacheEntry {
    fn freshness(&self, now: Instant, stale_retention: Duration) -> Freshness {
        if now < self.expires_at {
            Freshness::Fresh
        } else if now < self.expires_at + stale_retention {
            Freshness::Stale
        } else {
            Freshness::Evictable
        }
    }
}

/// Counters exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Fetcher invocations
    pub upstream_fetches: u64,
    /// Failed fetches answered from an expired entry
    pub stale_served: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    in_flight: HashMap<CacheKey, watch::Receiver<Option<FetchOutcome>>>,
    stats: CacheStats,
}

enum Role {
    Leader(watch::Sender<Option<FetchOutcome>>),
    Waiter(watch::Receiver<Option<FetchOutcome>>),
}

/// Forecast cache shared by every prediction run.
#[derive(Debug)]
pub struct DataManager {
    settings: CacheSettings,
    quantizer: Quantizer,
    state: Mutex<CacheState>,
}

/// Clears the in-flight marker if the leading fetch is dropped mid-way.
struct InFlightGuard<'a> {
    manager: &'a DataManager,
    key: CacheKey,
    armed: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!("Leading fetch for {:?} abandoned", self.key);
            self.manager.state.lock().in_flight.remove(&self.key);
        }
    }
}

impl DataManager {
    pub fn new(settings: CacheSettings) -> Self {
        let quantizer = Quantizer::new(settings.grid_resolution_m, settings.time_bucket_secs);
        Self {
            settings,
            quantizer,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Return the cached forecast for the key covering `(coordinate, at)`,
    /// fetching it through `fetcher` when missing or expired.
    ///
    /// `fetcher` receives the cell centre and bucket instant. At most one
    /// fetch per key runs at a time; concurrent callers share its outcome.
    /// When the fetch fails and an expired entry is still retained, that
    /// entry is returned instead of the error.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        coordinate: Coordinate,
        at: DateTime<Utc>,
        fetcher: F,
    ) -> Result<ForecastSample, WeatherError>
    where
        F: FnOnce(Coordinate, DateTime<Utc>) -> Fut,
        Fut: Future<Output = FetchOutcome>,
    {
        let (key, center, bucket_time) = self.quantizer.quantize(coordinate, at);
        let mut fetcher = Some(fetcher);

        loop {
            let role = {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                let now = Instant::now();

                match state
                    .entries
                    .get(&key)
                    .map(|e| e.freshness(now, self.settings.stale_retention))
                {
                    Some(Freshness::Fresh) => {
                        state.stats.hits += 1;
                        if let Some(entry) = state.entries.get(&key) {
                            tracing::debug!("Cache hit for {:?}", key);
                            return Ok(entry.sample.clone());
                        }
                    }
                    Some(Freshness::Evictable) => {
                        state.entries.remove(&key);
                        state.stats.evictions += 1;
                    }
                    Some(Freshness::Stale) | None => {}
                }

                match state.in_flight.get(&key) {
                    Some(rx) => Role::Waiter(rx.clone()),
                    None => {
                        state.stats.misses += 1;
                        let (tx, rx) = watch::channel(None);
                        state.in_flight.insert(key, rx);
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Waiter(mut rx) => {
                    tracing::debug!("Joining in-flight fetch for {:?}", key);
                    let outcome = match rx.wait_for(Option::is_some).await {
                        Ok(value) => (*value).clone(),
                        Err(_) => None,
                    };
                    match outcome {
                        Some(result) => return result,
                        // Leader was cancelled before finishing; take over.
                        None => continue,
                    }
                }
                Role::Leader(tx) => {
                    let mut guard = InFlightGuard {
                        manager: self,
                        key,
                        armed: true,
                    };
                    let Some(fetch) = fetcher.take() else {
                        // Only reachable if a caller led twice, which the loop never does.
                        return Err(WeatherError::Unavailable("fetcher already used".to_string()));
                    };

                    tracing::debug!("Cache miss for {:?}, fetching", key);
                    self.state.lock().stats.upstream_fetches += 1;
                    let result = fetch(center, bucket_time).await;

                    let outcome = self.complete(key, result);
                    guard.armed = false;
                    let _ = tx.send(Some(outcome.clone()));
                    return outcome;
                }
            }
        }
    }

    /// Record a finished fetch and pick what callers receive.
    fn complete(&self, key: CacheKey, result: FetchOutcome) -> FetchOutcome {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.in_flight.remove(&key);

        match result {
            Ok(sample) => {
                let entry = CacheEntry {
                    sample: sample.clone(),
                    fetched_at: Utc::now(),
                    expires_at: Instant::now() + self.settings.ttl,
                };
                state.entries.insert(key, entry);
                Ok(sample)
            }
            Err(e) => match state.entries.get(&key) {
                Some(stale) => {
                    tracing::warn!(
                        "Fetch for {:?} failed ({}), serving forecast fetched at {}",
                        key,
                        e,
                        stale.fetched_at
                    );
                    state.stats.stale_served += 1;
                    Ok(stale.sample.clone())
                }
                None => Err(e),
            },
        }
    }

    /// Drop entries past their stale retention window. Returns how many.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let retention = self.settings.stale_retention;
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let before = state.entries.len();
        state
            .entries
            .retain(|_, e| e.freshness(now, retention) != Freshness::Evictable);
        let evicted = before - state.entries.len();
        state.stats.evictions += evicted as u64;

        if evicted > 0 {
            tracing::debug!("Swept {} expired forecasts", evicted);
        }
        evicted
    }

    /// Run `sweep` every `period` until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Cache sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        manager.sweep();
                    }
                }
            }
        })
    }

    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys with a fetch currently running.
    pub fn pending_fetches(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn settings(ttl_secs: u64, retention_secs: u64) -> CacheSettings {
        CacheSettings {
            ttl: Duration::from_secs(ttl_secs),
            stale_retention: Duration::from_secs(retention_secs),
            grid_resolution_m: 2_000.0,
            time_bucket_secs: 3_600,
        }
    }

    fn coord(lat: f64, lon: f64) -> Coordinate {
        Coordinate::new(lat, lon).unwrap()
    }

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, h, m, 0).unwrap()
    }

    fn sample(c: Coordinate, at: DateTime<Utc>, temp: f64) -> ForecastSample {
        ForecastSample::new(c, at, temp, 10.0, 5.0, 1)
    }

    #[test]
    fn test_nearby_requests_share_a_key() {
        let q = Quantizer::new(2_000.0, 3_600);
        let (a, _, _) = q.quantize(coord(47.3700, 8.5400), ts(10, 10));
        let (b, _, _) = q.quantize(coord(47.3702, 8.5403), ts(10, 20));
        assert_eq!(a, b);

        let (far, _, _) = q.quantize(coord(47.5, 8.54), ts(10, 10));
        assert_ne!(a, far);
    }

    #[test]
    fn test_time_rounds_to_nearest_bucket() {
        let q = Quantizer::new(2_000.0, 3_600);
        let c = coord(0.0, 0.0);
        let (_, _, early) = q.quantize(c, ts(10, 29));
        let (_, _, late) = q.quantize(c, ts(10, 31));
        assert_eq!(early, ts(10, 0));
        assert_eq!(late, ts(11, 0));
    }

    #[test]
    fn test_cell_center_is_close() {
        let q = Quantizer::new(2_000.0, 3_600);
        let c = coord(60.0, 25.0);
        let (_, center, _) = q.quantize(c, ts(0, 0));
        assert!(c.distance_to(&center) < 2_000.0);
    }

    #[test]
    fn test_quantize_handles_poles() {
        let q = Quantizer::new(2_000.0, 3_600);
        let (_, center, _) = q.quantize(coord(90.0, 180.0), ts(0, 0));
        assert!(center.latitude() <= 90.0);
        assert!(center.longitude() <= 180.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_fetch() {
        let cache = DataManager::new(settings(600, 600));
        let calls = AtomicU32::new(0);
        let c = coord(47.37, 8.54);

        let lookups = (0..8).map(|i| {
            let cache = &cache;
            let calls = &calls;
            async move {
                cache
                    .get_or_fetch(c, ts(10, i), |center, at| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(sample(center, at, 20.0))
                    })
                    .await
            }
        });
        let results = futures::future::join_all(lookups).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let first = results[0].as_ref().unwrap();
        for r in &results {
            assert_eq!(r.as_ref().unwrap(), first);
        }
        let stats = cache.stats();
        assert_eq!(stats.upstream_fetches, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(cache.pending_fetches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_reaches_every_waiter() {
        let cache = DataManager::new(settings(600, 600));
        let calls = AtomicU32::new(0);
        let c = coord(10.0, 10.0);

        let lookups = (0..4).map(|_| {
            let cache = &cache;
            let calls = &calls;
            async move {
                cache
                    .get_or_fetch(c, ts(8, 0), |_, _| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err(WeatherError::Unavailable("upstream down".into()))
                    })
                    .await
            }
        });
        let results = futures::future::join_all(lookups).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(WeatherError::Unavailable(_)))));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_unexpired_lookup_is_idempotent() {
        let cache = DataManager::new(settings(600, 600));
        let calls = AtomicU32::new(0);
        let c = coord(51.5, -0.12);

        let fetch = |center: Coordinate, at: DateTime<Utc>| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(sample(center, at, 12.5)) }
        };
        let first = cache.get_or_fetch(c, ts(9, 0), fetch).await.unwrap();
        let second = cache.get_or_fetch(c, ts(9, 5), fetch).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_refetched() {
        let cache = DataManager::new(settings(60, 600));
        let c = coord(51.5, -0.12);

        let first = cache
            .get_or_fetch(c, ts(9, 0), |cc, at| async move { Ok(sample(cc, at, 1.0)) })
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        let second = cache
            .get_or_fetch(c, ts(9, 0), |cc, at| async move { Ok(sample(cc, at, 2.0)) })
            .await
            .unwrap();

        assert_eq!(first.temperature_c, 1.0);
        assert_eq!(second.temperature_c, 2.0);
        assert_eq!(cache.stats().upstream_fetches, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entry_served_when_fetch_fails() {
        let cache = DataManager::new(settings(60, 600));
        let c = coord(40.0, -74.0);

        cache
            .get_or_fetch(c, ts(12, 0), |cc, at| async move { Ok(sample(cc, at, 25.0)) })
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(120)).await;

        let fallback = cache
            .get_or_fetch(c, ts(12, 0), |_, _| async {
                Err(WeatherError::RateLimited { retry_after_secs: None })
            })
            .await
            .unwrap();

        assert_eq!(fallback.temperature_c, 25.0);
        assert_eq!(cache.stats().stale_served, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_past_retention_is_not_a_fallback() {
        let cache = DataManager::new(settings(60, 60));
        let c = coord(40.0, -74.0);

        cache
            .get_or_fetch(c, ts(12, 0), |cc, at| async move { Ok(sample(cc, at, 25.0)) })
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(121)).await;

        let err = cache
            .get_or_fetch(c, ts(12, 0), |_, _| async {
                Err(WeatherError::Unavailable("down".into()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, WeatherError::Unavailable(_)));
        assert_eq!(cache.stats().evictions, 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_takes_over_abandoned_fetch() {
        let cache = Arc::new(DataManager::new(settings(600, 600)));
        let c = coord(35.0, 139.0);

        let leader = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_fetch(c, ts(6, 0), |_, _| std::future::pending::<FetchOutcome>())
                    .await
            })
        };
        while cache.pending_fetches() == 0 {
            tokio::task::yield_now().await;
        }

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_fetch(c, ts(6, 0), |cc, at| async move { Ok(sample(cc, at, 18.0)) })
                    .await
            })
        };
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        leader.abort();
        let result = waiter.await.unwrap().unwrap();

        assert_eq!(result.temperature_c, 18.0);
        assert_eq!(cache.pending_fetches(), 0);
        assert_eq!(cache.stats().upstream_fetches, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrelated_keys_do_not_block_each_other() {
        let cache = DataManager::new(settings(600, 600));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let slow = cache.get_or_fetch(coord(1.0, 1.0), ts(1, 0), |cc, at| async move {
            release_rx.await.ok();
            Ok(sample(cc, at, 1.0))
        });
        let fast = async {
            let r = cache
                .get_or_fetch(coord(-30.0, 150.0), ts(1, 0), |cc, at| async move {
                    Ok(sample(cc, at, 2.0))
                })
                .await;
            release_tx.send(()).ok();
            r
        };

        let (slow, fast) = tokio::join!(slow, fast);
        assert_eq!(slow.unwrap().temperature_c, 1.0);
        assert_eq!(fast.unwrap().temperature_c, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_past_retention() {
        let cache = DataManager::new(settings(10, 20));
        cache
            .get_or_fetch(coord(0.0, 0.0), ts(0, 0), |cc, at| async move {
                Ok(sample(cc, at, 0.0))
            })
            .await
            .unwrap();
        cache
            .get_or_fetch(coord(0.0, 0.0), ts(5, 0), |cc, at| async move {
                Ok(sample(cc, at, 0.0))
            })
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(cache.sweep(), 0, "stale entries are kept as fallback");

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(cache.sweep(), 2);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().evictions, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_runs_until_cancelled() {
        let cache = Arc::new(DataManager::new(settings(1, 1)));
        cache
            .get_or_fetch(coord(0.0, 0.0), ts(0, 0), |cc, at| async move {
                Ok(sample(cc, at, 0.0))
            })
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = cache.spawn_sweeper(Duration::from_secs(5), cancel.clone());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(cache.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }
}
