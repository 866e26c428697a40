//! Clocks and the logging session context.
//!
//! Entries of one device must carry strictly increasing `created_on` stamps.
//! [`MonotonicClock`] guarantees that on top of any [`Clock`].

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use driftsync_core::{DeviceId, Timestamp};
use tokio::sync::Mutex;

use crate::error::{DriftError, Result};

/// Polls of the underlying clock before falling back to `last + 1`.
const MAX_POLLS: u32 = 4;
const MAX_POLL_DELAY: Duration = Duration::from_millis(8);

/// A source of millisecond timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall-clock milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Timestamp)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Timestamp) {
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Strictly increasing timestamps.
///
/// When the underlying clock has not moved past the last stamp, it is polled
/// with a doubling delay; if it still has not advanced, the stamp is
/// `last + 1`.
pub struct MonotonicClock {
    clock: Arc<dyn Clock>,
    last: Mutex<Timestamp>,
}

impl MonotonicClock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            last: Mutex::new(Timestamp::MIN),
        }
    }

    /// The underlying clock, unadjusted.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Never hand out stamps at or below `stamp`.
    pub async fn observe(&self, stamp: Timestamp) {
        let mut last = self.last.lock().await;
        *last = (*last).max(stamp);
    }

    /// The next stamp, strictly greater than every earlier one.
    pub async fn next(&self) -> Timestamp {
        let mut last = self.last.lock().await;
        let mut delay = Duration::from_millis(1);

        for _ in 0..MAX_POLLS {
            let now = self.clock.now();
            if now > *last {
                *last = now;
                return now;
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_POLL_DELAY);
        }

        *last += 1;
        tracing::debug!(stamp = *last, "clock did not advance, using last + 1");
        *last
    }
}

#[derive(Debug, Default)]
struct SessionState {
    device_id: Option<DeviceId>,
    enabled: bool,
}

/// Per-session state shared by the change-capture middleware and the
/// orchestrators: the stamping clock, the device id and whether logging is
/// on.
pub struct LoggingContext {
    clock: MonotonicClock,
    state: RwLock<SessionState>,
}

impl LoggingContext {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock: MonotonicClock::new(clock),
            state: RwLock::new(SessionState::default()),
        }
    }

    /// A context stamping from the system clock.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    pub fn clock(&self) -> &MonotonicClock {
        &self.clock
    }

    pub fn device_id(&self) -> Result<Option<DeviceId>> {
        Ok(self.read()?.device_id.clone())
    }

    pub fn set_device_id(&self, device_id: Option<DeviceId>) -> Result<()> {
        self.write()?.device_id = device_id;
        Ok(())
    }

    pub fn is_enabled(&self) -> Result<bool> {
        Ok(self.read()?.enabled)
    }

    /// Turn change logging on. Requires a device id.
    pub fn enable(&self) -> Result<()> {
        let mut state = self.write()?;
        if state.device_id.is_none() {
            return Err(DriftError::MissingDeviceId);
        }
        state.enabled = true;
        Ok(())
    }

    pub fn disable(&self) -> Result<()> {
        self.write()?.enabled = false;
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, SessionState>> {
        self.state
            .read()
            .map_err(|e| DriftError::Poisoned(e.to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, SessionState>> {
        self.state
            .write()
            .map_err(|e| DriftError::Poisoned(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stamps_follow_advancing_clock() {
        let clock = Arc::new(ManualClock::new(100));
        let monotonic = MonotonicClock::new(clock.clone());
        assert_eq!(monotonic.next().await, 100);
        clock.set(250);
        assert_eq!(monotonic.next().await, 250);
    }

    #[tokio::test]
    async fn test_stuck_clock_falls_back_to_increment() {
        let monotonic = MonotonicClock::new(Arc::new(ManualClock::new(7)));
        let stamps = [
            monotonic.next().await,
            monotonic.next().await,
            monotonic.next().await,
        ];
        assert_eq!(stamps, [7, 8, 9]);
    }

    #[tokio::test]
    async fn test_clock_going_backwards_never_repeats() {
        let clock = Arc::new(ManualClock::new(50));
        let monotonic = MonotonicClock::new(clock.clone());
        monotonic.observe(60).await;
        assert_eq!(monotonic.next().await, 61);
        clock.set(10);
        assert_eq!(monotonic.next().await, 62);
    }

    #[test]
    fn test_enable_requires_device_id() {
        let context = LoggingContext::new(Arc::new(ManualClock::new(0)));
        assert!(matches!(context.enable(), Err(DriftError::MissingDeviceId)));
        assert!(!context.is_enabled().unwrap());

        context.set_device_id(Some(DeviceId::new("d1"))).unwrap();
        context.enable().unwrap();
        assert!(context.is_enabled().unwrap());
        context.disable().unwrap();
        assert!(!context.is_enabled().unwrap());
    }
}
