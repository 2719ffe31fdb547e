//! Virtual-time environment.
//!
//! Time only moves when a test calls [`SimEnv::advance`]. Randomness comes
//! from a ChaCha RNG seeded by the test, so room codes, game ids and the
//! question shuffle replay identically for a given seed.
//!
//! Sleepers wait on a watch channel carrying the elapsed virtual time and
//! wake as soon as an `advance` moves it past their target.

#![allow(clippy::disallowed_types, reason = "RNG and clock locks are never held across an await")]

use std::{
    ops::{Add, Sub},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use quizroom_core::Environment;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::watch;

/// Wall-clock millis at virtual time zero.
pub const SIM_EPOCH_MILLIS: u64 = 1_700_000_000_000;

/// A point in virtual time, measured from the start of the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SimInstant(Duration);

impl SimInstant {
    /// Elapsed virtual time since the simulation started.
    pub fn elapsed(self) -> Duration {
        self.0
    }
}

impl Sub for SimInstant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

impl Add<Duration> for SimInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self(self.0.saturating_add(rhs))
    }
}

struct Inner {
    clock: watch::Sender<Duration>,
    rng: Mutex<ChaCha8Rng>,
}

/// Deterministic [`Environment`] with a manually advanced clock.
///
/// Clones share the clock and the RNG.
#[derive(Clone)]
pub struct SimEnv {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SimEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimEnv").field("elapsed", &*self.inner.clock.borrow()).finish_non_exhaustive()
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::with_seed(0)
    }
}

impl SimEnv {
    /// Environment at virtual time zero with RNG seeded from `seed`.
    pub fn with_seed(seed: u64) -> Self {
        let (clock, _) = watch::channel(Duration::ZERO);
        Self { inner: Arc::new(Inner { clock, rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)) }) }
    }

    /// Move virtual time forward, waking any sleeper whose target has passed.
    pub fn advance(&self, by: Duration) {
        self.inner.clock.send_modify(|elapsed| *elapsed = elapsed.saturating_add(by));
    }

    /// Elapsed virtual time.
    pub fn elapsed(&self) -> Duration {
        *self.inner.clock.borrow()
    }
}

impl Environment for SimEnv {
    type Instant = SimInstant;

    fn now(&self) -> SimInstant {
        SimInstant(self.elapsed())
    }

    fn wall_clock_millis(&self) -> u64 {
        SIM_EPOCH_MILLIS + self.elapsed().as_millis() as u64
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        let target = self.elapsed().saturating_add(duration);
        let mut rx = self.inner.clock.subscribe();
        async move {
            if rx.wait_for(|elapsed| *elapsed >= target).await.is_err() {
                tracing::debug!("simulated clock dropped while sleeping");
            }
        }
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.inner.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_moves_only_on_advance() {
        let env = SimEnv::with_seed(1);
        let t0 = env.now();
        assert_eq!(env.now(), t0);

        env.advance(Duration::from_millis(1500));
        assert_eq!(env.now() - t0, Duration::from_millis(1500));
        assert_eq!(env.wall_clock_millis(), SIM_EPOCH_MILLIS + 1500);
    }

    #[test]
    fn same_seed_same_bytes() {
        let a = SimEnv::with_seed(42);
        let b = SimEnv::with_seed(42);
        assert_eq!(a.random_u128(), b.random_u128());
        assert_ne!(a.random_u64(), SimEnv::with_seed(43).random_u64());
    }

    #[test]
    fn instants_saturate() {
        let early = SimInstant::default();
        let late = early + Duration::from_secs(5);
        assert_eq!(early - late, Duration::ZERO);
        assert_eq!(late.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn sleep_wakes_after_advance() {
        let env = SimEnv::with_seed(0);
        let sleeper = {
            let env = env.clone();
            tokio::spawn(async move { env.sleep(Duration::from_secs(3)).await })
        };

        tokio::task::yield_now().await;
        assert!(!sleeper.is_finished());

        env.advance(Duration::from_secs(3));
        assert!(sleeper.await.is_ok());
    }
}
