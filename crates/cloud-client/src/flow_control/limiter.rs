//! Per-operation API limiter.
//!
//! Each limiter combines a token bucket (rate and burst) with a semaphore
//! (maximum parallel requests). A caller waits for both, bounded by the
//! limiter's maximum wait, and reports the outcome through the returned
//! [`LimitedRequest`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::CloudError;

/// Tunables of one limiter
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterParameters {
    /// Sustained requests per second
    pub rate_limit: f64,
    /// Requests allowed back to back before the rate applies
    pub rate_burst: u32,
    /// Requests allowed in flight at once
    pub max_parallel_requests: usize,
    /// Longest a caller may wait for a slot
    pub max_wait_duration: Duration,
    /// Log every request passing through the limiter
    pub log: bool,
}

impl LimiterParameters {
    /// Apply `key:value` pairs of an override entry on top of these parameters
    fn apply_override(&mut self, operation: &str, entry: &str) -> Result<(), CloudError> {
        for pair in entry.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once(':').ok_or_else(|| {
                CloudError::InvalidLimiterConfig(format!(
                    "{operation}: expected key:value, got {pair:?}"
                ))
            })?;
            let invalid = |reason: String| {
                CloudError::InvalidLimiterConfig(format!("{operation}: {key}: {reason}"))
            };
            match key.trim() {
                "rate-limit" => {
                    let value = value
                        .trim()
                        .trim_end_matches("/s")
                        .parse::<f64>()
                        .map_err(|e| invalid(e.to_string()))?;
                    self.rate_limit = value;
                }
                "rate-burst" => {
                    self.rate_burst = value.trim().parse().map_err(|e| invalid(format!("{e}")))?;
                }
                "max-parallel-requests" => {
                    self.max_parallel_requests =
                        value.trim().parse().map_err(|e| invalid(format!("{e}")))?;
                }
                "max-wait-duration" => {
                    self.max_wait_duration =
                        humantime::parse_duration(value.trim()).map_err(|e| invalid(e.to_string()))?;
                }
                "log" => {
                    self.log = value.trim().parse().map_err(|e| invalid(format!("{e}")))?;
                }
                other => {
                    return Err(CloudError::InvalidLimiterConfig(format!(
                        "{operation}: unknown key {other:?}"
                    )));
                }
            }
        }
        self.validate(operation)
    }

    fn validate(&self, operation: &str) -> Result<(), CloudError> {
        if !(self.rate_limit.is_finite() && self.rate_limit > 0.0) {
            return Err(CloudError::InvalidLimiterConfig(format!(
                "{operation}: rate-limit must be positive, got {}",
                self.rate_limit
            )));
        }
        if self.rate_burst == 0 {
            return Err(CloudError::InvalidLimiterConfig(format!(
                "{operation}: rate-burst must be at least 1"
            )));
        }
        if self.max_parallel_requests == 0 {
            return Err(CloudError::InvalidLimiterConfig(format!(
                "{operation}: max-parallel-requests must be at least 1"
            )));
        }
        Ok(())
    }
}

/// Parse an override string of the form
/// `Op1=rate-limit:5,rate-burst:10;Op2=max-parallel-requests:1`.
///
/// The returned map holds only the raw entries; they are applied on top of
/// each operation's defaults when the limiter set is built.
pub fn parse_overrides(raw: &str) -> Result<HashMap<String, String>, CloudError> {
    let mut overrides = HashMap::new();
    for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let (operation, settings) = entry.split_once('=').ok_or_else(|| {
            CloudError::InvalidLimiterConfig(format!("expected Operation=settings, got {entry:?}"))
        })?;
        let operation = operation.trim();
        if operation.is_empty() {
            return Err(CloudError::InvalidLimiterConfig(format!(
                "missing operation name in {entry:?}"
            )));
        }
        overrides.insert(operation.to_string(), settings.to_string());
    }
    Ok(overrides)
}

/// Counters exported for every limiter
#[derive(Debug, Clone)]
pub struct LimiterMetrics {
    requests: IntCounterVec,
    wait_seconds: HistogramVec,
}

impl LimiterMetrics {
    /// Create the collectors and register them
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let requests = IntCounterVec::new(
            Opts::new(
                "cloud_api_limiter_requests_total",
                "Cloud API requests passing through the rate limiter, by outcome",
            ),
            &["operation", "outcome"],
        )?;
        let wait_seconds = HistogramVec::new(
            HistogramOpts::new(
                "cloud_api_limiter_wait_seconds",
                "Time spent waiting for a rate limiter slot",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(wait_seconds.clone()))?;
        Ok(Self {
            requests,
            wait_seconds,
        })
    }

    fn outcome(&self, operation: &str, outcome: &str) {
        self.requests.with_label_values(&[operation, outcome]).inc();
    }

    fn waited(&self, operation: &str, waited: Duration) {
        self.wait_seconds
            .with_label_values(&[operation])
            .observe(waited.as_secs_f64());
    }
}

#[derive(Debug)]
struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: u32, now: Instant) -> Self {
        let burst = f64::from(burst);
        Self {
            rate,
            burst,
            tokens: burst,
            last: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last = now;
    }

    /// Take a token, returning how long the caller must sleep before using it
    fn reserve(&mut self, now: Instant) -> Duration {
        self.refill(now);
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }

    fn cancel(&mut self) {
        self.tokens = (self.tokens + 1.0).min(self.burst);
    }

    /// Throw away accumulated burst so the next callers are paced at the plain rate
    fn drain(&mut self, now: Instant) {
        self.refill(now);
        self.tokens = self.tokens.min(0.0);
    }
}

/// Token taken from a bucket, refunded on drop unless kept
struct ReservedToken<'a> {
    bucket: &'a Mutex<TokenBucket>,
    armed: bool,
}

impl ReservedToken<'_> {
    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for ReservedToken<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(mut bucket) = self.bucket.lock() {
            bucket.cancel();
        }
    }
}

/// Running counters of a limiter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimiterStats {
    pub done: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub throttled: u64,
}

/// Rate and concurrency limiter for one operation
#[derive(Debug)]
pub struct ApiLimiter {
    name: String,
    params: LimiterParameters,
    bucket: Mutex<TokenBucket>,
    slots: Arc<Semaphore>,
    stats: Mutex<LimiterStats>,
    metrics: Option<LimiterMetrics>,
}

impl ApiLimiter {
    /// Create a limiter; parameters must already be validated
    pub fn new(name: impl Into<String>, params: LimiterParameters, metrics: Option<LimiterMetrics>) -> Self {
        Self {
            name: name.into(),
            bucket: Mutex::new(TokenBucket::new(params.rate_limit, params.rate_burst, Instant::now())),
            slots: Arc::new(Semaphore::new(params.max_parallel_requests)),
            params,
            stats: Mutex::new(LimiterStats::default()),
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameters(&self) -> &LimiterParameters {
        &self.params
    }

    pub fn stats(&self) -> LimiterStats {
        self.stats.lock().map(|s| *s).unwrap_or_default()
    }

    fn update_stats(&self, f: impl FnOnce(&mut LimiterStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    fn timeout(&self) -> CloudError {
        self.update_stats(|s| s.timeouts += 1);
        if let Some(metrics) = &self.metrics {
            metrics.outcome(&self.name, "timeout");
        }
        warn!(
            "Rate limiter for {} gave up after {:?}",
            self.name, self.params.max_wait_duration
        );
        CloudError::RateLimitTimeout {
            operation: self.name.clone(),
            waited: self.params.max_wait_duration,
        }
    }

    /// Wait for a token and a free slot.
    ///
    /// Returns [`CloudError::RateLimitTimeout`] if both cannot be obtained
    /// within the limiter's maximum wait. Callers with a tighter deadline
    /// wrap this future in `tokio::time::timeout`. Until the request is
    /// admitted, timing out or dropping the future hands the reserved token
    /// back to the bucket.
    pub async fn wait(self: &Arc<Self>) -> Result<LimitedRequest, CloudError> {
        let started = Instant::now();
        let deadline = started + self.params.max_wait_duration;

        let mut delay = Duration::ZERO;
        let mut token = None;
        if let Ok(mut bucket) = self.bucket.lock() {
            delay = bucket.reserve(started);
            if started + delay > deadline {
                bucket.cancel();
                drop(bucket);
                return Err(self.timeout());
            }
            token = Some(ReservedToken {
                bucket: &self.bucket,
                armed: true,
            });
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let permit = match tokio::time::timeout_at(deadline, Arc::clone(&self.slots).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => return Err(self.timeout()),
        };
        if let Some(token) = token {
            token.keep();
        }

        let waited = started.elapsed();
        if let Some(metrics) = &self.metrics {
            metrics.waited(&self.name, waited);
        }
        if self.params.log {
            info!("Rate limiter admitted {} after {:?}", self.name, waited);
        }

        Ok(LimitedRequest {
            limiter: Arc::clone(self),
            _permit: permit,
            admitted: Instant::now(),
        })
    }
}

/// An admitted request holding a concurrency slot.
///
/// Close it with exactly one of [`done`](Self::done) or
/// [`error`](Self::error); both consume the request and free the slot.
#[derive(Debug)]
pub struct LimitedRequest {
    limiter: Arc<ApiLimiter>,
    _permit: OwnedSemaphorePermit,
    admitted: Instant,
}

impl LimitedRequest {
    /// Report a successful call
    pub fn done(self) {
        let limiter = &self.limiter;
        limiter.update_stats(|s| s.done += 1);
        if let Some(metrics) = &limiter.metrics {
            metrics.outcome(&limiter.name, "done");
        }
        if limiter.params.log {
            debug!("{} finished in {:?}", limiter.name, self.admitted.elapsed());
        }
    }

    /// Report a failed call. Throttling answers from the cloud drain the
    /// bucket so the following requests are paced at the sustained rate.
    pub fn error(self, err: &CloudError) {
        let limiter = &self.limiter;
        if err.is_throttled() {
            limiter.update_stats(|s| {
                s.errors += 1;
                s.throttled += 1;
            });
            if let Ok(mut bucket) = limiter.bucket.lock() {
                bucket.drain(Instant::now());
            }
            warn!("{} throttled by the cloud API: {}", limiter.name, err);
        } else {
            limiter.update_stats(|s| s.errors += 1);
        }
        if let Some(metrics) = &limiter.metrics {
            metrics.outcome(&limiter.name, "error");
        }
        if limiter.params.log {
            debug!("{} failed after {:?}: {}", limiter.name, self.admitted.elapsed(), err);
        }
    }
}

/// All limiters, keyed by operation name
#[derive(Debug)]
pub struct ApiLimiterSet {
    limiters: HashMap<String, Arc<ApiLimiter>>,
    fallback: Arc<ApiLimiter>,
}

impl ApiLimiterSet {
    /// Build the set from defaults, overrides and the fallback parameters.
    ///
    /// Fails if an override entry is malformed or yields invalid parameters.
    pub fn new(
        defaults: HashMap<&'static str, LimiterParameters>,
        overrides: &str,
        fallback: LimiterParameters,
        metrics: Option<LimiterMetrics>,
    ) -> Result<Self, CloudError> {
        fallback.validate("default")?;
        let overrides = parse_overrides(overrides)?;

        let mut resolved: HashMap<String, LimiterParameters> = defaults
            .into_iter()
            .map(|(operation, params)| (operation.to_string(), params))
            .collect();
        for (operation, entry) in &overrides {
            let mut params = resolved
                .remove(operation)
                .unwrap_or_else(|| fallback.clone());
            params.apply_override(operation, entry)?;
            resolved.insert(operation.clone(), params);
        }

        let limiters = resolved
            .into_iter()
            .map(|(operation, params)| {
                let limiter = Arc::new(ApiLimiter::new(operation.clone(), params, metrics.clone()));
                (operation, limiter)
            })
            .collect();

        Ok(Self {
            limiters,
            fallback: Arc::new(ApiLimiter::new("default", fallback, metrics)),
        })
    }

    /// Limiter for an operation, the shared fallback if it has no entry
    pub fn limiter(&self, operation: &str) -> &Arc<ApiLimiter> {
        self.limiters.get(operation).unwrap_or(&self.fallback)
    }

    /// Wait for a slot of the given operation
    pub async fn wait(&self, operation: &str) -> Result<LimitedRequest, CloudError> {
        self.limiter(operation).wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn params(rate: f64, burst: u32, parallel: usize, wait: Duration) -> LimiterParameters {
        LimiterParameters {
            rate_limit: rate,
            rate_burst: burst,
            max_parallel_requests: parallel,
            max_wait_duration: wait,
            log: false,
        }
    }

    #[test]
    fn test_overrides_apply_on_top_of_defaults() {
        let defaults = HashMap::from([("DeleteENI", params(1.0, 1, 1, Duration::from_secs(30)))]);
        let set = ApiLimiterSet::new(
            defaults,
            "DeleteENI=max-parallel-requests:3,max-wait-duration:2s; ListSubnets=rate-limit:2/s",
            params(10.0, 20, 10, Duration::from_secs(30)),
            None,
        )
        .unwrap();

        assert_eq!(
            set.limiter("DeleteENI").parameters(),
            &params(1.0, 1, 3, Duration::from_secs(2))
        );
        // Unknown to the defaults: override lands on the fallback parameters
        assert_eq!(
            set.limiter("ListSubnets").parameters(),
            &params(2.0, 20, 10, Duration::from_secs(30))
        );
        assert_eq!(set.limiter("Whatever").name(), "default");
    }

    #[test]
    fn test_malformed_overrides_fail_construction() {
        let fallback = params(10.0, 20, 10, Duration::from_secs(30));
        for raw in [
            "DeleteENI",
            "=rate-limit:1",
            "DeleteENI=rate-limit",
            "DeleteENI=rate-limit:fast",
            "DeleteENI=colour:blue",
            "DeleteENI=max-parallel-requests:0",
            "DeleteENI=max-wait-duration:soon",
        ] {
            let result = ApiLimiterSet::new(HashMap::new(), raw, fallback.clone(), None);
            assert!(
                matches!(result, Err(CloudError::InvalidLimiterConfig(_))),
                "{raw:?} should be rejected"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_one_serializes_callers() {
        let limiter = Arc::new(ApiLimiter::new(
            "DeleteENI",
            params(1000.0, 10, 1, Duration::from_secs(30)),
            None,
        ));

        let first = limiter.wait().await.unwrap();
        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.wait().await.map(LimitedRequest::done) })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished(), "second caller must wait for the slot");

        first.done();
        waiter.await.unwrap().unwrap();
        assert_eq!(limiter.stats().done, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_past_max_wait_is_a_timeout() {
        let limiter = Arc::new(ApiLimiter::new(
            "ListENIs",
            params(1000.0, 10, 1, Duration::from_secs(2)),
            None,
        ));

        let _held = limiter.wait().await.unwrap();
        let err = limiter.wait().await.unwrap_err();
        assert!(err.is_rate_limit_timeout());
        assert_eq!(limiter.stats().timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_deadline_cancels_the_wait() {
        let limiter = Arc::new(ApiLimiter::new(
            "ListENIs",
            params(1000.0, 10, 1, Duration::from_secs(60)),
            None,
        ));

        let held = limiter.wait().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), limiter.wait()).await;
        assert!(result.is_err(), "caller deadline fires before the limiter's own");

        held.done();
        limiter.wait().await.unwrap().done();
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_wait_refunds_its_token() {
        let limiter = Arc::new(ApiLimiter::new(
            "CreateENI",
            params(1.0, 1, 10, Duration::from_secs(30)),
            None,
        ));

        let start = Instant::now();
        limiter.wait().await.unwrap().done();

        // Dropped while sleeping for the next token
        let abandoned = tokio::time::timeout(Duration::from_millis(100), limiter.wait()).await;
        assert!(abandoned.is_err());

        limiter.wait().await.unwrap().done();
        // Without the refund the third caller would wait until the 2s mark
        assert!(start.elapsed() < Duration::from_millis(1100));
        assert_eq!(limiter.stats().done, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_exhaustion_paces_at_the_rate() {
        let limiter = Arc::new(ApiLimiter::new(
            "StatENI",
            params(1.0, 2, 10, Duration::from_secs(30)),
            None,
        ));

        let start = Instant::now();
        limiter.wait().await.unwrap().done();
        limiter.wait().await.unwrap().done();
        assert!(start.elapsed() < Duration::from_millis(10));

        limiter.wait().await.unwrap().done();
        assert!(start.elapsed() >= Duration::from_millis(990));
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_wait_longer_than_max_wait_fails_fast() {
        let limiter = Arc::new(ApiLimiter::new(
            "DescribeSubnet",
            params(0.1, 1, 10, Duration::from_secs(5)),
            None,
        ));

        limiter.wait().await.unwrap().done();
        let start = Instant::now();
        let err = limiter.wait().await.unwrap_err();
        assert!(err.is_rate_limit_timeout());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_errors_are_counted_and_drain_the_burst() {
        let limiter = Arc::new(ApiLimiter::new(
            "BatchAddPrivateIP",
            params(1.0, 5, 5, Duration::from_secs(30)),
            None,
        ));

        limiter
            .wait()
            .await
            .unwrap()
            .error(&CloudError::Throttled("slow down".into()));

        let start = Instant::now();
        limiter.wait().await.unwrap().done();
        assert!(start.elapsed() >= Duration::from_millis(990));
        assert_eq!(
            limiter.stats(),
            LimiterStats {
                done: 1,
                errors: 1,
                timeouts: 0,
                throttled: 1
            }
        );
    }
}
