mod memory;
mod postgres;

pub use memory::MemoryAdmissionControl;
pub use postgres::PgAdmissionControl;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Policy {
    pub capacity: usize,
    pub window: Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            capacity: 10,
            window: Duration::seconds(60),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
}

/// Gates expensive work per caller identifier.
///
/// `try_acquire` checks and consumes quota in one atomic step: concurrent
/// callers sharing an identifier never jointly exceed the policy capacity.
#[async_trait]
pub trait AdmissionControl {
    async fn try_acquire(&self, identifier: &str) -> Result<Decision, Error>;
}

pub type DynAdmissionControl = Arc<dyn AdmissionControl + Send + Sync>;

/// Timestamps of admitted calls within the trailing window.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SlidingWindow {
    admitted: Vec<DateTime<Utc>>,
}

impl SlidingWindow {
    pub fn try_admit(&mut self, policy: &Policy, now: DateTime<Utc>) -> bool {
        self.prune(policy, now);

        if self.admitted.len() >= policy.capacity {
            return false;
        }

        self.admitted.push(now);
        true
    }

    pub fn prune(&mut self, policy: &Policy, now: DateTime<Utc>) {
        // a window reaching past the representable range keeps everything
        if let Some(cutoff) = now.checked_sub_signed(policy.window) {
            self.admitted.retain(|at| *at > cutoff);
        }
    }

    /// When the newest admission leaves the window; `None` once nothing is held.
    pub fn expires_at(&self, policy: &Policy) -> Option<DateTime<Utc>> {
        self.admitted.last().map(|at| {
            at.checked_add_signed(policy.window)
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.admitted.is_empty()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.admitted.len()
    }
}

#[test]
fn eleventh_call_in_window_is_rejected() {
    let policy = Policy::default();
    let start = Utc::now();
    let mut window = SlidingWindow::default();

    for i in 0..10 {
        assert!(window.try_admit(&policy, start + Duration::seconds(i)));
    }

    assert!(!window.try_admit(&policy, start + Duration::seconds(30)));
    assert_eq!(window.len(), 10);
}

#[test]
fn window_slides() {
    let policy = Policy {
        capacity: 2,
        window: Duration::seconds(60),
    };
    let start = Utc::now();
    let mut window = SlidingWindow::default();

    assert!(window.try_admit(&policy, start));
    assert!(window.try_admit(&policy, start + Duration::seconds(20)));
    assert!(!window.try_admit(&policy, start + Duration::seconds(59)));

    // first admission leaves the window, the second one still counts
    assert!(window.try_admit(&policy, start + Duration::seconds(61)));
    assert!(!window.try_admit(&policy, start + Duration::seconds(62)));

    assert!(window.try_admit(&policy, start + Duration::seconds(81)));
}

#[test]
fn rejected_calls_consume_nothing() {
    let policy = Policy {
        capacity: 1,
        window: Duration::seconds(10),
    };
    let start = Utc::now();
    let mut window = SlidingWindow::default();

    assert!(window.try_admit(&policy, start));
    for i in 1..10 {
        assert!(!window.try_admit(&policy, start + Duration::seconds(i)));
    }

    assert_eq!(window.len(), 1);
    assert!(window.try_admit(&policy, start + Duration::seconds(11)));
}

#[test]
fn window_state_round_trips_through_json() {
    let policy = Policy::default();
    let mut window = SlidingWindow::default();
    window.try_admit(&policy, Utc::now());

    let stored = serde_json::to_value(&window).unwrap();
    let restored: SlidingWindow = serde_json::from_value(stored).unwrap();

    assert_eq!(restored, window);
}

#[test]
fn oversized_window_keeps_every_admission() {
    let policy = Policy {
        capacity: 2,
        window: Duration::days(1_000_000_000),
    };
    let now = Utc::now();
    let mut window = SlidingWindow::default();

    assert!(window.try_admit(&policy, now));
    assert!(window.try_admit(&policy, now + Duration::seconds(1)));
    assert!(!window.try_admit(&policy, now + Duration::seconds(2)));
    assert_eq!(window.expires_at(&policy), Some(DateTime::<Utc>::MAX_UTC));
}

#[test]
fn expiry_follows_newest_admission() {
    let policy = Policy::default();
    let start = Utc::now();
    let mut window = SlidingWindow::default();
    assert_eq!(window.expires_at(&policy), None);

    window.try_admit(&policy, start);
    window.try_admit(&policy, start + Duration::seconds(10));
    assert_eq!(
        window.expires_at(&policy),
        Some(start + Duration::seconds(70))
    );

    window.prune(&policy, start + Duration::seconds(71));
    assert!(window.is_empty());
    assert_eq!(window.expires_at(&policy), None);
}
