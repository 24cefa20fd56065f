use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{info, warn};

use maia_core::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct ServiceState {
    state: State,
    consecutive_failures: u32,
    opened_at: Instant,
    /// Set while the single half-open probe is in flight.
    probe_in_flight: bool,
}

impl ServiceState {
    fn new() -> Self {
        Self {
            state: State::Closed,
            consecutive_failures: 0,
            opened_at: Instant::now(),
            probe_in_flight: false,
        }
    }
}

/// Process-wide circuit breaker, sharded by service name.
///
/// closed → open after `threshold` consecutive failures; open for `cooldown`
/// during which calls fail fast with `CircuitOpen`; then half-open admits a
/// single probe: success closes the circuit, failure re-opens it.
///
/// State is only mutated under the shard's map entry, and every critical
/// section is a handful of memory operations.
pub struct CircuitBreaker {
    shards: DashMap<String, ServiceState>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            shards: DashMap::new(),
            threshold,
            cooldown,
        }
    }

    /// Gate a call. `Ok(())` admits it; `Err(CircuitOpen)` means fail fast.
    pub fn check(&self, service: &str) -> Result<(), ErrorKind> {
        let mut entry = self
            .shards
            .entry(service.to_string())
            .or_insert_with(ServiceState::new);

        match entry.state {
            State::Closed => Ok(()),
            State::Open => {
                if entry.opened_at.elapsed() >= self.cooldown {
                    entry.state = State::HalfOpen;
                    entry.probe_in_flight = true;
                    info!(service, "circuit half-open, admitting probe");
                    Ok(())
                } else {
                    Err(ErrorKind::CircuitOpen {
                        service: service.to_string(),
                    })
                }
            }
            State::HalfOpen => {
                if entry.probe_in_flight {
                    Err(ErrorKind::CircuitOpen {
                        service: service.to_string(),
                    })
                } else {
                    entry.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn on_success(&self, service: &str) {
        if let Some(mut entry) = self.shards.get_mut(service) {
            if entry.state != State::Closed {
                info!(service, "circuit closed");
            }
            entry.state = State::Closed;
            entry.consecutive_failures = 0;
            entry.probe_in_flight = false;
        }
    }

    pub fn on_failure(&self, service: &str) {
        let mut entry = self
            .shards
            .entry(service.to_string())
            .or_insert_with(ServiceState::new);

        match entry.state {
            State::HalfOpen => {
                entry.state = State::Open;
                entry.opened_at = Instant::now();
                entry.probe_in_flight = false;
                warn!(service, "half-open probe failed, circuit re-opened");
            }
            State::Closed => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= self.threshold {
                    entry.state = State::Open;
                    entry.opened_at = Instant::now();
                    warn!(
                        service,
                        failures = entry.consecutive_failures,
                        "circuit opened"
                    );
                }
            }
            State::Open => {}
        }
    }

    /// True when calls to `service` would currently fail fast.
    pub fn is_open(&self, service: &str) -> bool {
        self.shards
            .get(service)
            .map(|e| e.state == State::Open && e.opened_at.elapsed() < self.cooldown)
            .unwrap_or(false)
    }

    /// Snapshot of non-closed circuits for the health endpoint.
    pub fn open_circuits(&self) -> Vec<String> {
        self.shards
            .iter()
            .filter(|e| e.state != State::Closed)
            .map(|e| e.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(30));
        for _ in 0..4 {
            breaker.on_failure("calendar");
        }
        assert!(breaker.check("calendar").is_ok());
        breaker.on_failure("calendar");
        assert!(matches!(
            breaker.check("calendar"),
            Err(ErrorKind::CircuitOpen { .. })
        ));
        assert!(breaker.is_open("calendar"));
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.on_failure("lists");
        breaker.on_failure("lists");
        breaker.on_success("lists");
        breaker.on_failure("lists");
        breaker.on_failure("lists");
        assert!(breaker.check("lists").is_ok());
    }

    #[test]
    fn half_open_admits_single_probe_then_closes_on_success() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.on_failure("journal");
        // Cooldown of zero: next check transitions to half-open.
        assert!(breaker.check("journal").is_ok());
        // Probe in flight: a second caller is rejected.
        assert!(breaker.check("journal").is_err());
        breaker.on_success("journal");
        assert!(breaker.check("journal").is_ok());
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.on_failure("reminders");
        assert!(breaker.check("reminders").is_ok());
        breaker.on_failure("reminders");
        // Re-opened with a fresh cooldown window; zero cooldown means the
        // next check is another probe rather than a fail-fast.
        assert!(breaker.check("reminders").is_ok());
    }

    #[test]
    fn services_are_isolated() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(30));
        breaker.on_failure("calendar");
        assert!(breaker.check("calendar").is_err());
        assert!(breaker.check("lists").is_ok());
    }
}
