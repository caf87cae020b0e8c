use std::{
    sync::atomic::{AtomicU8, AtomicU64, Ordering},
    time::Duration,
};

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HealthState {
    Uninitialized = 0,
    Connecting = 1,
    Connected = 2,
    Failed = 3,
    Closed = 4,
}

impl HealthState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Failed,
            4 => Self::Closed,
            _ => Self::Uninitialized,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }
}

/// Process-wide health of the remote counter backend, read before every
/// store operation to decide routing.
#[derive(Debug)]
pub struct BackendHealth {
    state: AtomicU8,
    epoch: Instant,
    failed_at_ms: AtomicU64,
}

impl BackendHealth {
    pub fn new(initial: HealthState) -> Self {
        Self {
            state: AtomicU8::new(initial as u8),
            epoch: Instant::now(),
            failed_at_ms: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> HealthState {
        HealthState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns true when this call moved the backend out of a non-connected
    /// state.
    pub fn mark_connected(&self) -> bool {
        self.transition(HealthState::Connected, |s| {
            matches!(s, HealthState::Uninitialized | HealthState::Connecting)
        })
    }

    /// Returns true when this call is the one that took the backend down, so
    /// the caller logs the outage once.
    pub fn mark_failed(&self) -> bool {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        let moved = self.transition(HealthState::Failed, |s| {
            matches!(s, HealthState::Connected | HealthState::Connecting)
        });
        if moved || self.state() == HealthState::Failed {
            self.failed_at_ms.store(now_ms, Ordering::Release);
        }
        moved
    }

    pub fn mark_closed(&self) {
        self.state.store(HealthState::Closed as u8, Ordering::Release);
    }

    /// Claims the reconnection probe when `interval` has elapsed since the
    /// last failure. At most one caller wins until the probe resolves.
    pub fn try_begin_probe(&self, interval: Duration) -> bool {
        if self.state() != HealthState::Failed {
            return false;
        }
        let since_failure = (self.epoch.elapsed().as_millis() as u64)
            .saturating_sub(self.failed_at_ms.load(Ordering::Acquire));
        if since_failure < interval.as_millis() as u64 {
            return false;
        }
        self.state
            .compare_exchange(
                HealthState::Failed as u8,
                HealthState::Connecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn transition(&self, to: HealthState, allowed_from: impl Fn(HealthState) -> bool) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !allowed_from(HealthState::from_u8(current)) {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}
