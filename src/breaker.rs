use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::metrics::BREAKER_TRIPS;

#[derive(Debug, Default)]
struct BreakerState {
    errors: VecDeque<Instant>,
    cooloff_until: Option<Instant>,
}

/// Sliding-window circuit breaker guarding the prefetch plane.
///
/// Policy-call errors and prefetch-HTTP errors both feed the same breaker;
/// cache errors do not. While tripped, the orchestrator schedules no batches
/// at all, so a dead policy engine or peer costs one timeout per cooloff
/// instead of one per request.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    service: String,
    trip_errors: usize,
    window: Duration,
    cooloff: Duration,
}

impl CircuitBreaker {
    pub fn new(service: &str, trip_errors: usize, window: Duration, cooloff: Duration) -> Self {
        Self {
            state: Mutex::new(BreakerState::default()),
            service: service.to_string(),
            trip_errors: trip_errors.max(1),
            window,
            cooloff,
        }
    }

    /// Whether speculative work may proceed right now.
    pub fn allow(&self) -> bool {
        let state = self.state.lock();
        match state.cooloff_until {
            Some(until) => Instant::now() >= until,
            None => true,
        }
    }

    /// Record one outbound failure. Trips into cooloff when the window fills.
    pub fn report_error(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();

        while let Some(front) = state.errors.front() {
            if now.duration_since(*front) > self.window {
                state.errors.pop_front();
            } else {
                break;
            }
        }
        state.errors.push_back(now);

        if state.errors.len() >= self.trip_errors {
            state.cooloff_until = Some(now + self.cooloff);
            state.errors.clear();
            BREAKER_TRIPS.with_label_values(&[&self.service]).inc();
            tracing::warn!(
                service = %self.service,
                cooloff_secs = self.cooloff.as_secs_f64(),
                "circuit breaker tripped, pausing prefetch"
            );
        }
    }

    /// Error count currently inside the window.
    #[allow(dead_code)]
    pub fn pending_errors(&self) -> usize {
        self.state.lock().errors.len()
    }
}
