//! Liveness for the scheduler loops.
//!
//! Every loop (dispatcher, local pool, the three monitor tickers)
//! owns a `Heartbeat` and stamps it once per tick. The `/health`
//! probe fails as soon as any tracked loop has been silent longer
//! than its allowance, so a wedged scheduler takes the process out of
//! rotation even while the HTTP surface still answers. Silence is the
//! only signal: a loop that ticks but fails its work still beats, and
//! those failures surface in logs, not here.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_derive::Serialize;

/// Stamp held by one scheduler loop. Beating is a single atomic store
/// and safe to hit on every tick.
#[derive(Clone)]
pub struct Heartbeat {
    last_beat_ms: Arc<AtomicI64>,
}

impl Heartbeat {
    pub fn beat(&self) {
        self.last_beat_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

struct TrackedLoop {
    name: &'static str,
    max_silence_ms: i64,
    last_beat_ms: Arc<AtomicI64>,
}

/// Registry of scheduler loops, shared with the `/health` handler.
#[derive(Clone, Default)]
pub struct Liveness {
    loops: Arc<RwLock<Vec<TrackedLoop>>>,
}

#[derive(Debug, Serialize)]
pub struct LoopReport {
    pub name: &'static str,
    pub alive: bool,
    pub silent_for_seconds: i64,
}

#[derive(Debug, Serialize)]
pub struct LivenessReport {
    pub alive: bool,
    pub loops: Vec<LoopReport>,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track one loop under `name`. `max_silence` must comfortably
    /// exceed the loop's tick interval; the clock starts at
    /// registration, so the allowance also covers startup.
    pub fn track(&self, name: &'static str, max_silence: Duration) -> Heartbeat {
        let last_beat_ms = Arc::new(AtomicI64::new(Utc::now().timestamp_millis()));
        self.loops
            .write()
            .expect("poisoned liveness lock")
            .push(TrackedLoop {
                name,
                max_silence_ms: max_silence.as_millis() as i64,
                last_beat_ms: last_beat_ms.clone(),
            });
        Heartbeat { last_beat_ms }
    }

    /// Verdict over every tracked loop. A process that has tracked
    /// nothing yet reports dead; wiring registers all loops before the
    /// listener comes up.
    pub fn report(&self) -> LivenessReport {
        let now_ms = Utc::now().timestamp_millis();
        let loops: Vec<LoopReport> = self
            .loops
            .read()
            .expect("poisoned liveness lock")
            .iter()
            .map(|tracked| {
                let silent_ms = now_ms - tracked.last_beat_ms.load(Ordering::Relaxed);
                LoopReport {
                    name: tracked.name,
                    alive: silent_ms <= tracked.max_silence_ms,
                    silent_for_seconds: silent_ms / 1000,
                }
            })
            .collect();

        LivenessReport {
            alive: !loops.is_empty() && loops.iter().all(|tracked| tracked.alive),
            loops,
        }
    }
}

impl IntoResponse for LivenessReport {
    fn into_response(self) -> Response {
        let status = if self.alive {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        (status, Json(self)).into_response()
    }
}
