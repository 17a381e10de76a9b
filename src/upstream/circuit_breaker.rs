use crate::config::{CircuitBreakerConfig, GatewayConfig};
use crate::error::GatewayError;
use crate::events::{EventRecord, EventSink, GatewayEvent};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Circuit breaker state machine: Closed → Open → HalfOpen → Closed/Open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one permitted call, reported back through its [`CallPermit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
    Timeout,
}

impl CallOutcome {
    pub fn is_failure(&self) -> bool {
        !matches!(self, CallOutcome::Success)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallOutcome::Success => "success",
            CallOutcome::Failure => "failure",
            CallOutcome::Timeout => "timeout",
        }
    }
}

/// Effective breaker configuration per identifier.
#[derive(Debug, Clone, Default)]
pub struct BreakerPolicy {
    defaults: CircuitBreakerConfig,
    per_id: HashMap<String, CircuitBreakerConfig>,
}

impl BreakerPolicy {
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            defaults,
            per_id: HashMap::new(),
        }
    }

    pub fn with_override(mut self, id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.per_id.insert(id.into(), config);
        self
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            defaults: config.circuit_breaker.clone(),
            per_id: config
                .breakers
                .keys()
                .map(|id| (id.clone(), config.breaker_config(id)))
                .collect(),
        }
    }

    pub fn for_id(&self, id: &str) -> &CircuitBreakerConfig {
        self.per_id.get(id).unwrap_or(&self.defaults)
    }
}

/// Point-in-time view of one breaker, for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub id: String,
    pub state: BreakerState,
    pub buffered_calls: usize,
    pub failed_calls: usize,
    pub failure_rate: f64,
    pub half_open_in_flight: u32,
}

/// All breakers, keyed by identifier. State is keyed by identifier rather
/// than by route, so it survives route table rebuilds and is shared by every
/// route naming the same identifier.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    policy: ArcSwap<BreakerPolicy>,
    events: Arc<dyn EventSink>,
}

impl CircuitBreakerRegistry {
    pub fn new(policy: BreakerPolicy, events: Arc<dyn EventSink>) -> Self {
        Self {
            breakers: DashMap::new(),
            policy: ArcSwap::from_pointee(policy),
            events,
        }
    }

    /// Ask the breaker `id` for permission to make one backend call.
    pub fn try_acquire(&self, id: &str) -> Result<CallPermit, GatewayError> {
        self.get(id).try_acquire()
    }

    pub fn get(&self, id: &str) -> Arc<CircuitBreaker> {
        // Fast path: no allocation when the key exists.
        if let Some(entry) = self.breakers.get(id) {
            return entry.value().clone();
        }
        self.breakers
            .entry(id.to_string())
            .or_insert_with(|| {
                let config = self.policy.load().for_id(id).clone();
                Arc::new(CircuitBreaker::new(id, config, self.events.clone()))
            })
            .clone()
    }

    pub fn state(&self, id: &str) -> Option<BreakerState> {
        self.breakers.get(id).map(|b| b.state())
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut out: Vec<BreakerSnapshot> =
            self.breakers.iter().map(|e| e.value().snapshot()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Swap in a new policy. Existing breakers keep their state and pick up
    /// their new configuration.
    pub fn reconfigure(&self, policy: BreakerPolicy) {
        for entry in self.breakers.iter() {
            entry.value().reconfigure(policy.for_id(entry.key()).clone());
        }
        self.policy.store(Arc::new(policy));
    }

    /// Drop breakers whose identifier is no longer referenced by any route.
    pub fn retain_ids(&self, active_ids: &HashSet<String>) {
        self.breakers.retain(|k, _| active_ids.contains(k));
    }
}

/// One breaker. All state lives behind a single mutex so that permit checks
/// and outcome reports for an identifier are linearized.
pub struct CircuitBreaker {
    id: Arc<str>,
    inner: Mutex<BreakerInner>,
    events: Arc<dyn EventSink>,
}

struct BreakerInner {
    config: CircuitBreakerConfig,
    state: BreakerState,
    /// Most recent outcomes, `true` = failure. Only filled while closed.
    window: VecDeque<bool>,
    failures: usize,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    /// Bumped on every transition; permits from an older generation are stale.
    generation: u64,
}

type Transition = (BreakerState, BreakerState);

impl BreakerInner {
    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.failures as f64 * 100.0 / self.window.len() as f64
        }
    }

    fn push(&mut self, failed: bool) {
        self.window.push_back(failed);
        if failed {
            self.failures += 1;
        }
        self.trim_window();
    }

    fn trim_window(&mut self) {
        while self.window.len() > self.config.sliding_window_size {
            if self.window.pop_front() == Some(true) {
                self.failures -= 1;
            }
        }
    }

    fn transition(&mut self, to: BreakerState) -> Transition {
        let from = self.state;
        self.state = to;
        self.generation += 1;
        self.window.clear();
        self.failures = 0;
        self.half_open_in_flight = 0;
        self.opened_at = match to {
            BreakerState::Open => Some(Instant::now()),
            _ => None,
        };
        (from, to)
    }

    fn open_expired(&self) -> bool {
        self.opened_at
            .map(|at| at.elapsed() >= self.config.open_duration)
            .unwrap_or(true)
    }
}

impl CircuitBreaker {
    pub fn new(id: &str, config: CircuitBreakerConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            id: Arc::from(id),
            inner: Mutex::new(BreakerInner {
                window: VecDeque::with_capacity(config.sliding_window_size),
                config,
                state: BreakerState::Closed,
                failures: 0,
                opened_at: None,
                half_open_in_flight: 0,
                generation: 0,
            }),
            events,
        }
    }

    // State stays consistent across a panicking holder, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stored state. An expired OPEN breaker reports OPEN until the next
    /// permit check moves it to HALF_OPEN.
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn call_timeout(&self) -> Duration {
        self.lock().config.call_timeout
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            id: self.id.to_string(),
            state: inner.state,
            buffered_calls: inner.window.len(),
            failed_calls: inner.failures,
            failure_rate: inner.failure_rate(),
            half_open_in_flight: inner.half_open_in_flight,
        }
    }

    pub fn try_acquire(self: &Arc<Self>) -> Result<CallPermit, GatewayError> {
        let mut inner = self.lock();
        let mut transition = None;

        if inner.state == BreakerState::Open && inner.open_expired() {
            transition = Some(inner.transition(BreakerState::HalfOpen));
        }

        let permit = match inner.state {
            BreakerState::Closed => Some(false),
            BreakerState::HalfOpen
                if inner.half_open_in_flight < inner.config.permitted_calls_in_half_open =>
            {
                inner.half_open_in_flight += 1;
                Some(true)
            }
            _ => None,
        }
        .map(|trial| CallPermit {
            breaker: self.clone(),
            generation: inner.generation,
            trial,
            call_timeout: inner.config.call_timeout,
            done: false,
        });
        drop(inner);

        self.emit(transition);

        permit.ok_or_else(|| {
            metrics::counter!(
                "gateway_circuit_breaker_rejected_total",
                "breaker" => self.id.to_string(),
            )
            .increment(1);
            GatewayError::BreakerOpen(self.id.to_string())
        })
    }

    fn on_outcome(&self, generation: u64, trial: bool, outcome: CallOutcome) {
        let mut inner = self.lock();
        if generation != inner.generation {
            tracing::debug!(
                "circuit_breaker: discarded stale outcome, breaker={}, outcome={}",
                self.id,
                outcome.as_str()
            );
            return;
        }

        let transition = match inner.state {
            BreakerState::Closed => {
                inner.push(outcome.is_failure());
                let tripped = inner.window.len() >= inner.config.minimum_number_of_calls
                    && inner.failure_rate() >= inner.config.failure_rate_threshold;
                if tripped {
                    tracing::warn!(
                        "circuit_breaker: opening, breaker={}, failure_rate={:.1}%, calls={}",
                        self.id,
                        inner.failure_rate(),
                        inner.window.len()
                    );
                    Some(inner.transition(BreakerState::Open))
                } else {
                    None
                }
            }
            BreakerState::HalfOpen if trial => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                if outcome.is_failure() {
                    tracing::warn!(
                        "circuit_breaker: re-opened (trial call {}), breaker={}",
                        outcome.as_str(),
                        self.id
                    );
                    Some(inner.transition(BreakerState::Open))
                } else {
                    tracing::info!(
                        "circuit_breaker: closed (trial call succeeded), breaker={}",
                        self.id
                    );
                    Some(inner.transition(BreakerState::Closed))
                }
            }
            _ => None,
        };
        drop(inner);

        self.emit(transition);
    }

    /// A permit dropped without an outcome frees its trial slot and records nothing.
    fn on_abandon(&self, generation: u64, trial: bool) {
        if !trial {
            return;
        }
        let mut inner = self.lock();
        if generation == inner.generation && inner.state == BreakerState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    fn reconfigure(&self, config: CircuitBreakerConfig) {
        let mut inner = self.lock();
        inner.config = config;
        inner.trim_window();
    }

    fn emit(&self, transition: Option<Transition>) {
        if let Some((from, to)) = transition {
            self.events.emit(EventRecord::now(GatewayEvent::BreakerTransition {
                breaker_id: self.id.to_string(),
                from,
                to,
            }));
        }
    }
}

/// Permission for exactly one backend call. Consumed by [`CallPermit::record`],
/// so an outcome can be reported at most once.
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    trial: bool,
    call_timeout: Duration,
    done: bool,
}

impl CallPermit {
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// `true` when this call is a half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record(mut self, outcome: CallOutcome) {
        self.done = true;
        self.breaker.on_outcome(self.generation, self.trial, outcome);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.done {
            self.breaker.on_abandon(self.generation, self.trial);
        }
    }
}
