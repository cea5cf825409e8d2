//! Rate-limited, retrying, circuit-broken egress client.
//!
//! `deliver` composes the session manager, dataset resolver, and payload
//! mapper into the outbound write. Every aggregated diff that reaches this
//! client ends in exactly one of two places: a 2xx from the historian or a
//! dead-letter row. Settlement is reported back so the CDC checkpoint can
//! advance.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use sync_core::{Error, Result};
use telemetry::{health, metrics};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cdc::{AggregatedDiff, DiffSink};

use crate::config::{CanaryConfig, QueuePolicy};
use crate::dataset::DatasetResolver;
use crate::payload::{PayloadMapper, WriteBatch};
use crate::session::SessionManager;

/// Grace period for draining residue on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Bounded retries for transient dataset-resolution failures.
const RESOLVE_ATTEMPTS: u32 = 3;

/// Terminal outcome of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    DeadLettered,
}

/// Session access used by the client; production wires `SessionManager`.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn ensure_session(&self) -> Result<String>;
    async fn mark_used(&self);
    async fn on_bad_session(&self);
}

#[async_trait]
impl SessionProvider for SessionManager {
    async fn ensure_session(&self) -> Result<String> {
        SessionManager::ensure_session(self).await
    }

    async fn mark_used(&self) {
        SessionManager::mark_used(self).await;
    }

    async fn on_bad_session(&self) {
        SessionManager::on_bad_session(self).await;
    }
}

/// Transport for one mapped batch.
#[async_trait]
pub trait BatchSender: Send + Sync {
    async fn send(&self, batch: &WriteBatch, session_token: &str) -> Result<()>;
}

/// HTTP sender against the historian write endpoint.
pub struct HttpBatchSender {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpBatchSender {
    pub fn new(config: &CanaryConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(config.request_timeout_seconds))
            .build()
            .map_err(|err| Error::internal(format!("egress http client: {err}")))?;
        Ok(Self {
            http,
            endpoint: config.write_endpoint(),
        })
    }
}

#[async_trait]
impl BatchSender for HttpBatchSender {
    async fn send(&self, batch: &WriteBatch, session_token: &str) -> Result<()> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("Idempotency-Key", &batch.idempotency_key)
            .json(&batch.body(session_token))
            .send()
            .await
            .map_err(|err| Error::transient(format!("write request failed: {err}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 401
            || status.as_u16() == 403
            || body.contains("BadSessionToken")
            || body.contains("sessionToken")
        {
            return Err(Error::SessionInvalid(format!("historian returned {status}")));
        }
        let mut message = body;
        message.truncate(512);
        Err(Error::Http {
            status: status.as_u16(),
            message,
        })
    }
}

/// Dead-letter destination; production wires the durable store.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(
        &self,
        payload: &serde_json::Value,
        kind: &str,
        detail: &str,
        attempts: u32,
    ) -> Result<()>;
}

/// Callback invoked once a diff's replication position has settled.
pub type OnSettled = Arc<dyn Fn(u64) + Send + Sync>;

fn dead_letter_kind(err: &Error) -> &'static str {
    match err {
        Error::DatasetNotFound(_) => "DatasetNotFound",
        Error::PayloadTooLarge { .. } => "PayloadTooLarge",
        Error::Validation(_) => "Validation",
        Error::Http { status, .. } if (400..500).contains(status) => "Validation",
        _ => "Unrecoverable",
    }
}

// ------------------------------------------------------------------ limiter

/// Token bucket limiting the steady-state request rate.
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    updated_at: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_second: f64, capacity: f64) -> Self {
        Self {
            rate: rate_per_second.max(f64::MIN_POSITIVE),
            capacity: capacity.max(1.0),
            tokens: capacity.max(1.0),
            updated_at: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.updated_at).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
            self.updated_at = now;
        }
    }

    pub fn consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn time_until_ready(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.rate)
        }
    }
}

// ------------------------------------------------------------------ retry

/// Exponential backoff with full jitter and capped per-attempt delay.
pub struct RetryPolicy {
    retries: u32,
    base: Duration,
    max: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, base: Duration, max: Duration) -> Self {
        Self { retries, base, max }
    }

    /// Total attempts: first try plus retries.
    pub fn max_attempts(&self) -> u32 {
        self.retries + 1
    }

    /// Delay before `attempt` (attempt 1 is immediate).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(30);
        let limit = self
            .base
            .mul_f64(2f64.powi(exponent as i32))
            .min(self.max);
        limit.mul_f64(rand::random::<f64>())
    }
}

// ------------------------------------------------------------------ breaker

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Consecutive-failure circuit breaker with a single half-open probe.
pub struct CircuitBreaker {
    threshold: u32,
    reset_timeout: Duration,
    state: BreakerState,
    failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            reset_timeout,
            state: BreakerState::Closed,
            failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Whether a request may proceed now. Transitions Open → HalfOpen after
    /// the reset timeout; HalfOpen admits exactly one probe.
    pub fn allow(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|at| now.duration_since(at))
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.reset_timeout {
                    self.state = BreakerState::HalfOpen;
                    self.probe_in_flight = true;
                    self.publish_state();
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if self.probe_in_flight {
                    false
                } else {
                    self.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn time_until_allow(&self, now: Instant) -> Duration {
        match (self.state, self.opened_at) {
            (BreakerState::Open, Some(at)) => {
                self.reset_timeout
                    .saturating_sub(now.duration_since(at))
            }
            _ => Duration::ZERO,
        }
    }

    pub fn record_success(&mut self) {
        self.state = BreakerState::Closed;
        self.failures = 0;
        self.opened_at = None;
        self.probe_in_flight = false;
        self.publish_state();
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.failures += 1;
        self.probe_in_flight = false;
        let should_open = matches!(self.state, BreakerState::HalfOpen | BreakerState::Open)
            || self.failures >= self.threshold;
        if should_open {
            if self.state != BreakerState::Open {
                metrics().circuit_opens.inc();
            }
            self.state = BreakerState::Open;
            self.opened_at = Some(now);
        }
        self.publish_state();
    }

    fn publish_state(&self) {
        let value = match self.state {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        };
        metrics().circuit_state.set(value);
        match self.state {
            BreakerState::Closed => health().canary.set_healthy(),
            BreakerState::Open => health().canary.set_unhealthy("circuit open"),
            BreakerState::HalfOpen => {}
        }
    }
}

// ------------------------------------------------------------------ queue

/// Bounded handle feeding the egress client; implements the CDC diff sink.
pub struct EgressQueue {
    tx: mpsc::Sender<AggregatedDiff>,
    policy: QueuePolicy,
    dlq: Option<Arc<dyn DeadLetterSink>>,
    on_settled: Option<OnSettled>,
}

impl EgressQueue {
    pub fn new(
        tx: mpsc::Sender<AggregatedDiff>,
        policy: QueuePolicy,
        dlq: Option<Arc<dyn DeadLetterSink>>,
        on_settled: Option<OnSettled>,
    ) -> Self {
        Self {
            tx,
            policy,
            dlq,
            on_settled,
        }
    }

    fn update_depth(&self) {
        let depth = self.tx.max_capacity() - self.tx.capacity();
        metrics().egress_queue_depth.set(depth as u64);
    }
}

#[async_trait]
impl DiffSink for EgressQueue {
    async fn emit(&self, diff: AggregatedDiff) -> Result<()> {
        match self.policy {
            QueuePolicy::Block => {
                self.tx
                    .send(diff)
                    .await
                    .map_err(|_| Error::QueueFull("egress queue closed".into()))?;
                self.update_depth();
                Ok(())
            }
            QueuePolicy::Drop => match self.tx.try_send(diff) {
                Ok(()) => {
                    self.update_depth();
                    Ok(())
                }
                Err(mpsc::error::TrySendError::Full(diff)) => {
                    // Saturated queue: the overflow goes to the dead-letter
                    // store and its position settles immediately.
                    metrics().egress_queue_dropped.inc();
                    let lsn = diff.max_lsn;
                    if let Some(dlq) = &self.dlq {
                        let payload = serde_json::to_value(&diff)?;
                        if let Err(err) = dlq
                            .record(&payload, "QueueSaturated", "egress queue full", 0)
                            .await
                        {
                            warn!(error = %err, "failed to dead-letter overflow diff");
                        }
                    }
                    if let Some(on_settled) = &self.on_settled {
                        on_settled(lsn);
                    }
                    Ok(())
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    Err(Error::QueueFull("egress queue closed".into()))
                }
            },
        }
    }
}

// ------------------------------------------------------------------ client

/// The egress pipeline worker.
pub struct EgressClient {
    session: Arc<dyn SessionProvider>,
    resolver: Arc<DatasetResolver>,
    mapper: PayloadMapper,
    sender: Arc<dyn BatchSender>,
    dlq: Option<Arc<dyn DeadLetterSink>>,
    on_settled: Option<OnSettled>,
    bucket: Mutex<TokenBucket>,
    breaker: Mutex<CircuitBreaker>,
    retry: RetryPolicy,
    max_batch_tags: usize,
}

impl EgressClient {
    pub fn new(
        config: &CanaryConfig,
        session: Arc<dyn SessionProvider>,
        resolver: Arc<DatasetResolver>,
        sender: Arc<dyn BatchSender>,
        dlq: Option<Arc<dyn DeadLetterSink>>,
        on_settled: Option<OnSettled>,
    ) -> Self {
        Self {
            session,
            resolver,
            mapper: PayloadMapper::new(config.max_batch_tags, config.max_payload_bytes),
            sender,
            dlq,
            on_settled,
            bucket: Mutex::new(TokenBucket::new(
                config.rate_limit_rps as f64,
                config.rate_limit_rps as f64,
            )),
            breaker: Mutex::new(CircuitBreaker::new(
                config.circuit_consecutive_failures,
                Duration::from_secs_f64(config.circuit_reset_seconds),
            )),
            retry: RetryPolicy::new(
                config.retry_attempts,
                Duration::from_secs_f64(config.retry_base_delay),
                Duration::from_secs_f64(config.retry_max_delay),
            ),
            max_batch_tags: config.max_batch_tags.max(1),
        }
    }

    /// Worker loop: pull diffs from the bounded queue and deliver them.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<AggregatedDiff>,
        cancel: CancellationToken,
    ) {
        info!("egress client starting");
        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => break,
                diff = rx.recv() => match diff {
                    Some(diff) => diff,
                    None => break,
                }
            };

            let mut diffs = vec![first];
            while diffs.len() < self.max_batch_tags {
                match rx.try_recv() {
                    Ok(diff) => diffs.push(diff),
                    Err(_) => break,
                }
            }
            metrics().egress_queue_depth.set(rx.len() as u64);
            self.process_diffs(diffs).await;
        }

        // Shutdown: keep delivering residue inside the grace period;
        // whatever remains past it dead-letters.
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while let Ok(diff) = rx.try_recv() {
            if Instant::now() >= deadline {
                self.dead_letter_diff(&diff, &Error::transient("shutdown grace expired"), 0)
                    .await;
                continue;
            }
            self.process_diffs(vec![diff]).await;
        }
        info!("egress client stopped");
    }

    /// Resolve, map, and deliver a set of diffs.
    pub async fn process_diffs(&self, diffs: Vec<AggregatedDiff>) {
        let mut resolved = Vec::with_capacity(diffs.len());
        for diff in diffs {
            match self.resolve_with_retry(&diff.canary_id).await {
                Ok(_dataset) => resolved.push(diff),
                Err(err) => {
                    self.dead_letter_diff(&diff, &err, 0).await;
                }
            }
        }
        if resolved.is_empty() {
            return;
        }

        let (batches, rejected) = self.mapper.build_batches(resolved, chrono::Utc::now());
        for (diff, err) in rejected {
            self.dead_letter_diff(&diff, &err, 0).await;
        }
        for batch in batches {
            self.deliver(batch).await;
        }
    }

    async fn resolve_with_retry(&self, canary_id: &str) -> Result<String> {
        let mut delay = Duration::from_millis(200);
        for attempt in 0..RESOLVE_ATTEMPTS {
            match self.resolver.resolve(canary_id).await {
                Ok(dataset) => return Ok(dataset),
                Err(err) if err.is_retriable() && attempt + 1 < RESOLVE_ATTEMPTS => {
                    warn!(canary_id = %canary_id, error = %err, "dataset resolution retry");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(err) => return Err(err),
            }
        }
        unreachable!("resolve loop returns on final attempt")
    }

    /// Deliver one batch to a terminal outcome.
    pub async fn deliver(&self, batch: WriteBatch) -> Delivery {
        metrics().egress_requests.inc();
        let started = Instant::now();
        let max_attempts = self.retry.max_attempts();
        let mut attempt: u32 = 1;
        let mut free_session_retry = true;

        loop {
            match self.attempt_send(&batch).await {
                Ok(()) => {
                    metrics().egress_success.inc();
                    metrics()
                        .egress_latency_ms
                        .observe(started.elapsed().as_millis() as u64);
                    self.breaker.lock().record_success();
                    self.session.mark_used().await;
                    self.settle(&batch);
                    return Delivery::Delivered;
                }
                Err(Error::SessionInvalid(detail)) => {
                    self.session.on_bad_session().await;
                    if free_session_retry {
                        // One refresh-and-retry that does not count against
                        // the retry budget.
                        free_session_retry = false;
                        continue;
                    }
                    metrics().egress_failures.inc();
                    return self
                        .dead_letter_batch(&batch, &Error::SessionInvalid(detail), attempt)
                        .await;
                }
                Err(err) if err.is_dead_letter() => {
                    // Validation and dataset failures bypass both retry and
                    // the breaker.
                    return self.dead_letter_batch(&batch, &err, attempt).await;
                }
                Err(err) if err.is_retriable() && attempt < max_attempts => {
                    self.breaker.lock().record_failure(Instant::now());
                    metrics().egress_retries.inc();
                    let delay = self.retry.delay_before(attempt + 1);
                    warn!(
                        attempt = attempt,
                        delay_ms = %delay.as_millis(),
                        error = %err,
                        "egress attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    self.breaker.lock().record_failure(Instant::now());
                    metrics().egress_failures.inc();
                    return self.dead_letter_batch(&batch, &err, attempt).await;
                }
            }
        }
    }

    async fn attempt_send(&self, batch: &WriteBatch) -> Result<()> {
        // Breaker first: an open circuit short-circuits before a rate token
        // is consumed, preserving throttle headroom for recovery probes.
        self.wait_for_breaker().await;
        let token = self.session.ensure_session().await?;
        self.acquire_rate_token().await;
        self.sender.send(batch, &token).await
    }

    async fn wait_for_breaker(&self) {
        loop {
            let wait = {
                let mut breaker = self.breaker.lock();
                if breaker.allow(Instant::now()) {
                    return;
                }
                breaker.time_until_allow(Instant::now())
            };
            tokio::time::sleep(wait.clamp(Duration::from_millis(50), Duration::from_secs(1)))
                .await;
        }
    }

    async fn acquire_rate_token(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                if bucket.consume(Instant::now()) {
                    return;
                }
                bucket.time_until_ready(Instant::now())
            };
            metrics().egress_throttled.inc();
            tokio::time::sleep(wait.max(Duration::from_millis(10))).await;
        }
    }

    fn settle(&self, batch: &WriteBatch) {
        if let Some(on_settled) = &self.on_settled {
            for lsn in &batch.lsns {
                on_settled(*lsn);
            }
        }
    }

    async fn dead_letter_batch(&self, batch: &WriteBatch, err: &Error, attempts: u32) -> Delivery {
        let payload = json!({
            "properties": batch.properties,
            "idempotencyKey": batch.idempotency_key,
        });
        self.record_dead_letter(&payload, err, attempts).await;
        self.settle(batch);
        Delivery::DeadLettered
    }

    async fn dead_letter_diff(&self, diff: &AggregatedDiff, err: &Error, attempts: u32) {
        match serde_json::to_value(diff) {
            Ok(payload) => self.record_dead_letter(&payload, err, attempts).await,
            Err(ser_err) => warn!(error = %ser_err, "diff not serializable for dead-letter"),
        }
        if let Some(on_settled) = &self.on_settled {
            on_settled(diff.max_lsn);
        }
    }

    async fn record_dead_letter(&self, payload: &serde_json::Value, err: &Error, attempts: u32) {
        let kind = dead_letter_kind(err);
        warn!(kind = kind, attempts = attempts, error = %err, "dead-lettering egress payload");
        let Some(dlq) = &self.dlq else {
            metrics().dead_letters.inc();
            return;
        };
        if let Err(store_err) = dlq.record(payload, kind, &err.to_string(), attempts).await {
            warn!(error = %store_err, "dead-letter store insert failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{BrowsePage, NamespaceBrowser};
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StaticSession;

    #[async_trait]
    impl SessionProvider for StaticSession {
        async fn ensure_session(&self) -> Result<String> {
            Ok("test-token".into())
        }
        async fn mark_used(&self) {}
        async fn on_bad_session(&self) {}
    }

    /// Sender scripted with a sequence of responses, then success forever.
    struct ScriptedSender {
        script: Mutex<Vec<Result<()>>>,
        calls: AtomicU32,
        tokens: Mutex<Vec<String>>,
    }

    impl ScriptedSender {
        fn new(script: Vec<Result<()>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: AtomicU32::new(0),
                tokens: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BatchSender for ScriptedSender {
        async fn send(&self, _batch: &WriteBatch, session_token: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.tokens.lock().push(session_token.to_string());
            let mut script = self.script.lock();
            if script.is_empty() {
                Ok(())
            } else {
                script.remove(0)
            }
        }
    }

    struct CollectingDlq {
        rows: Mutex<Vec<(serde_json::Value, String)>>,
    }

    #[async_trait]
    impl DeadLetterSink for CollectingDlq {
        async fn record(
            &self,
            payload: &serde_json::Value,
            kind: &str,
            _detail: &str,
            _attempts: u32,
        ) -> Result<()> {
            self.rows.lock().push((payload.clone(), kind.to_string()));
            Ok(())
        }
    }

    struct OpenBrowser;

    #[async_trait]
    impl NamespaceBrowser for OpenBrowser {
        async fn browse(
            &self,
            path: &str,
            _deep: bool,
            _continuation: Option<&str>,
        ) -> Result<BrowsePage> {
            if path.is_empty() {
                Ok(BrowsePage {
                    datasets: vec!["Secil".into()],
                    ..BrowsePage::default()
                })
            } else {
                Ok(BrowsePage {
                    tags: vec!["Secil.EdgeA.DeviceA.Temperature.PV".into()],
                    ..BrowsePage::default()
                })
            }
        }
    }

    fn fast_config() -> CanaryConfig {
        CanaryConfig {
            retry_attempts: 5,
            retry_base_delay: 0.001,
            retry_max_delay: 0.002,
            circuit_consecutive_failures: 20,
            circuit_reset_seconds: 0.05,
            rate_limit_rps: 10_000,
            dataset_prefix: "Secil".into(),
            ..CanaryConfig::default()
        }
    }

    fn diff(canary_id: &str, lsn: u64) -> AggregatedDiff {
        AggregatedDiff {
            metric_key: 1,
            uns_path: canary_id.replace('.', "/"),
            canary_id: canary_id.into(),
            versions: vec![1],
            latest_actor: "uns-metadata-sync".into(),
            changes: [(
                "displayHigh".to_string(),
                cdc::ChangeValue::set(Some("int".into()), serde_json::json!(2000)),
            )]
            .into_iter()
            .collect::<BTreeMap<_, _>>(),
            event_ids: BTreeSet::new(),
            max_lsn: lsn,
            span_seconds: 0.0,
        }
    }

    fn client(
        config: &CanaryConfig,
        sender: Arc<ScriptedSender>,
        dlq: Arc<CollectingDlq>,
        settled: Arc<Mutex<Vec<u64>>>,
    ) -> EgressClient {
        let resolver = Arc::new(DatasetResolver::new(Box::new(OpenBrowser), config));
        let settled_cb: OnSettled = Arc::new(move |lsn| settled.lock().push(lsn));
        EgressClient::new(
            config,
            Arc::new(StaticSession),
            resolver,
            sender,
            Some(dlq),
            Some(settled_cb),
        )
    }

    fn http_err(status: u16) -> Error {
        Error::Http {
            status,
            message: "scripted".into(),
        }
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed_without_dlq() {
        let sender = Arc::new(ScriptedSender::new(vec![
            Err(http_err(503)),
            Err(http_err(503)),
            Err(http_err(503)),
        ]));
        let dlq = Arc::new(CollectingDlq {
            rows: Mutex::new(Vec::new()),
        });
        let settled = Arc::new(Mutex::new(Vec::new()));
        let client = client(&fast_config(), sender.clone(), dlq.clone(), settled.clone());

        client
            .process_diffs(vec![diff("Secil.EdgeA.DeviceA.Temperature.PV", 77)])
            .await;

        assert_eq!(sender.calls.load(Ordering::SeqCst), 4);
        assert!(dlq.rows.lock().is_empty());
        assert_eq!(settled.lock().as_slice(), &[77]);
        assert_eq!(client.breaker.lock().state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn validation_failures_dead_letter_without_retry() {
        let sender = Arc::new(ScriptedSender::new(vec![Err(http_err(400))]));
        let dlq = Arc::new(CollectingDlq {
            rows: Mutex::new(Vec::new()),
        });
        let settled = Arc::new(Mutex::new(Vec::new()));
        let client = client(&fast_config(), sender.clone(), dlq.clone(), settled.clone());

        client
            .process_diffs(vec![diff("Secil.EdgeA.DeviceA.Temperature.PV", 5)])
            .await;

        assert_eq!(sender.calls.load(Ordering::SeqCst), 1);
        let rows = dlq.rows.lock();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1, "Validation");
        // Dead-lettered work still settles its position.
        assert_eq!(settled.lock().as_slice(), &[5]);
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_as_unrecoverable() {
        let mut config = fast_config();
        config.retry_attempts = 2;
        let sender = Arc::new(ScriptedSender::new(vec![
            Err(http_err(503)),
            Err(http_err(503)),
            Err(http_err(503)),
            Err(http_err(503)),
        ]));
        let dlq = Arc::new(CollectingDlq {
            rows: Mutex::new(Vec::new()),
        });
        let settled = Arc::new(Mutex::new(Vec::new()));
        let client = client(&config, sender.clone(), dlq.clone(), settled.clone());

        client
            .process_diffs(vec![diff("Secil.EdgeA.DeviceA.Temperature.PV", 9)])
            .await;

        // First try plus two retries.
        assert_eq!(sender.calls.load(Ordering::SeqCst), 3);
        assert_eq!(dlq.rows.lock()[0].1, "Unrecoverable");
        assert_eq!(settled.lock().as_slice(), &[9]);
    }

    #[tokio::test]
    async fn bad_session_refreshes_and_retries_once_for_free() {
        let mut config = fast_config();
        config.retry_attempts = 0; // no regular retries at all
        let sender = Arc::new(ScriptedSender::new(vec![Err(Error::SessionInvalid(
            "BadSessionToken".into(),
        ))]));
        let dlq = Arc::new(CollectingDlq {
            rows: Mutex::new(Vec::new()),
        });
        let settled = Arc::new(Mutex::new(Vec::new()));
        let client = client(&config, sender.clone(), dlq.clone(), settled.clone());

        client
            .process_diffs(vec![diff("Secil.EdgeA.DeviceA.Temperature.PV", 3)])
            .await;

        // The free retry succeeded; no dead letter.
        assert_eq!(sender.calls.load(Ordering::SeqCst), 2);
        assert!(dlq.rows.lock().is_empty());
    }

    #[tokio::test]
    async fn unresolvable_dataset_dead_letters_the_diff() {
        let sender = Arc::new(ScriptedSender::new(vec![]));
        let dlq = Arc::new(CollectingDlq {
            rows: Mutex::new(Vec::new()),
        });
        let settled = Arc::new(Mutex::new(Vec::new()));
        let client = client(&fast_config(), sender.clone(), dlq.clone(), settled.clone());

        client.process_diffs(vec![diff("Secil.No.Such.Tag", 11)]).await;

        // Never reached the wire.
        assert_eq!(sender.calls.load(Ordering::SeqCst), 0);
        assert_eq!(dlq.rows.lock()[0].1, "DatasetNotFound");
        assert_eq!(settled.lock().as_slice(), &[11]);
    }

    #[test]
    fn token_bucket_caps_one_second_windows() {
        let mut bucket = TokenBucket::new(5.0, 5.0);
        let now = Instant::now();
        let mut granted = 0;
        for _ in 0..50 {
            if bucket.consume(now) {
                granted += 1;
            }
        }
        assert_eq!(granted, 5);
        assert!(bucket.time_until_ready(now) > Duration::ZERO);
    }

    #[test]
    fn retry_delays_are_bounded_by_the_cap() {
        let policy = RetryPolicy::new(6, Duration::from_millis(200), Duration::from_millis(6400));
        assert_eq!(policy.delay_before(1), Duration::ZERO);
        for attempt in 2..=7 {
            let delay = policy.delay_before(attempt);
            assert!(delay <= Duration::from_millis(6400));
        }
        assert_eq!(policy.max_attempts(), 7);
    }

    #[test]
    fn breaker_walks_closed_open_halfopen_closed() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_millis(10));
        let t0 = Instant::now();
        assert!(breaker.allow(t0));

        breaker.record_failure(t0);
        breaker.record_failure(t0);
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure(t0);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow(t0));

        // After the reset timeout one probe is admitted.
        let later = t0 + Duration::from_millis(20);
        assert!(breaker.allow(later));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(!breaker.allow(later));

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);

        // A failed probe re-opens.
        breaker.record_failure(later);
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
