// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Counting semaphore with timeout.

use crate::SyncError;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::time::Duration;
use std::time::Instant;

/// How long [`Semaphore::wait`] may block.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Timeout {
    /// Block until the units are available.
    Forever,
    /// Block for at most this many milliseconds. Zero polls.
    Millis(u16),
}

impl Timeout {
    /// The engine's encoding of [`Timeout::Forever`].
    pub const FOREVER_SENTINEL: u16 = 0xffff;

    /// Decodes an engine timeout value.
    pub fn from_engine(ms: u16) -> Self {
        if ms == Self::FOREVER_SENTINEL {
            Self::Forever
        } else {
            Self::Millis(ms)
        }
    }
}

#[derive(Debug)]
struct State {
    units: u32,
    // Total units requested by blocked waiters. Wider than `units` since
    // every waiter may ask for up to `max`.
    demand: u64,
}

/// A counting semaphore.
///
/// Signaling a single unit releases exactly one unit. Signaling more than
/// one unit is a broadcast: it releases enough units to satisfy every
/// waiter blocked at that moment, regardless of the count requested.
#[derive(Debug)]
pub struct Semaphore {
    max: u32,
    state: Mutex<State>,
    condvar: Condvar,
}

impl Semaphore {
    /// Creates a semaphore holding `initial` of at most `max` units.
    pub fn new(initial: u32, max: u32) -> Result<Self, SyncError> {
        if max == 0 || initial > max {
            return Err(SyncError::InvalidUnits { initial, max });
        }
        Ok(Self {
            max,
            state: Mutex::new(State {
                units: initial,
                demand: 0,
            }),
            condvar: Condvar::new(),
        })
    }

    /// Takes `units` units, blocking up to `timeout` for them to become
    /// available.
    pub fn wait(&self, units: u32, timeout: Timeout) -> Result<(), SyncError> {
        if units > self.max {
            return Err(SyncError::TooManyUnits {
                units,
                max: self.max,
            });
        }

        let deadline = match timeout {
            Timeout::Forever => None,
            Timeout::Millis(ms) => {
                let bound = Duration::from_millis(ms.into());
                Some((Instant::now() + bound, bound))
            }
        };

        let mut state = self.state.lock();
        while state.units < units {
            state.demand += u64::from(units);
            let expired = match deadline {
                None => {
                    self.condvar.wait(&mut state);
                    None
                }
                Some((at, bound)) => self
                    .condvar
                    .wait_until(&mut state, at)
                    .timed_out()
                    .then_some(bound),
            };
            state.demand -= u64::from(units);

            if let Some(bound) = expired {
                if state.units < units {
                    tracing::trace!(units, ?bound, "semaphore wait timed out");
                    return Err(SyncError::Timeout(bound));
                }
            }
        }
        state.units -= units;
        Ok(())
    }

    /// Releases `units` units, waking waiters.
    pub fn signal(&self, units: u32) -> Result<(), SyncError> {
        let mut state = self.state.lock();
        match units {
            0 => {}
            1 => {
                if state.units >= self.max {
                    return Err(SyncError::Limit { max: self.max });
                }
                state.units += 1;
                self.condvar.notify_one();
            }
            _ => {
                let demand = state.demand;
                state.units = u32::try_from(u64::from(state.units) + demand).unwrap_or(u32::MAX);
                tracing::trace!(requested = units, released = demand, "semaphore broadcast");
                self.condvar.notify_all();
            }
        }
        Ok(())
    }

    /// The number of units currently available.
    pub fn available(&self) -> u32 {
        self.state.lock().units
    }

    /// The maximum number of units.
    pub fn max_units(&self) -> u32 {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osl_test_host::test;
    use std::sync::Arc;

    #[test]
    fn invalid_units() {
        assert!(matches!(
            Semaphore::new(2, 1),
            Err(SyncError::InvalidUnits { initial: 2, max: 1 })
        ));
        assert!(Semaphore::new(0, 0).is_err());
    }

    #[test]
    fn counts_units() {
        let sem = Semaphore::new(2, 2).unwrap();
        sem.wait(1, Timeout::Millis(0)).unwrap();
        sem.wait(1, Timeout::Millis(0)).unwrap();
        assert!(matches!(
            sem.wait(1, Timeout::Millis(0)),
            Err(SyncError::Timeout(_))
        ));
        sem.signal(1).unwrap();
        assert_eq!(sem.available(), 1);
        sem.signal(1).unwrap();
        assert_eq!(sem.signal(1), Err(SyncError::Limit { max: 2 }));
    }

    #[test]
    fn timeout_respects_bound() {
        let sem = Semaphore::new(0, 1).unwrap();
        let start = Instant::now();
        let err = sem.wait(1, Timeout::Millis(50)).unwrap_err();
        let elapsed = start.elapsed();
        assert_eq!(err, SyncError::Timeout(Duration::from_millis(50)));
        assert!(elapsed >= Duration::from_millis(50), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1050), "{elapsed:?}");
    }

    #[test]
    fn forever_wait_is_woken_by_signal() {
        let sem = Arc::new(Semaphore::new(0, 1).unwrap());
        let waiter = std::thread::spawn({
            let sem = sem.clone();
            move || sem.wait(1, Timeout::from_engine(Timeout::FOREVER_SENTINEL))
        });
        std::thread::sleep(Duration::from_millis(20));
        sem.signal(1).unwrap();
        waiter.join().unwrap().unwrap();
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn multi_unit_signal_wakes_all_waiters() {
        let sem = Arc::new(Semaphore::new(0, 1).unwrap());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let sem = sem.clone();
                std::thread::spawn(move || sem.wait(1, Timeout::Millis(5000)))
            })
            .collect();

        // Wait for all three to block.
        let start = Instant::now();
        while sem.state.lock().demand < 3 {
            assert!(start.elapsed() < Duration::from_secs(5));
            std::thread::yield_now();
        }

        sem.signal(2).unwrap();
        for w in waiters {
            w.join().unwrap().unwrap();
        }
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn broadcast_without_waiters_releases_nothing() {
        let sem = Semaphore::new(0, 4).unwrap();
        sem.signal(4).unwrap();
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn engine_timeout_decoding() {
        assert_eq!(Timeout::from_engine(0xffff), Timeout::Forever);
        assert_eq!(Timeout::from_engine(10), Timeout::Millis(10));
    }

    #[test]
    fn full_range_waiters_do_not_overflow_demand() {
        let sem = Arc::new(Semaphore::new(0, u32::MAX).unwrap());
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let sem = sem.clone();
                std::thread::spawn(move || sem.wait(u32::MAX, Timeout::Millis(500)))
            })
            .collect();

        let start = Instant::now();
        while sem.state.lock().demand < 2 * u64::from(u32::MAX) {
            assert!(start.elapsed() < Duration::from_secs(5));
            std::thread::yield_now();
        }

        // The broadcast saturates at the count's range, enough for one waiter.
        sem.signal(2).unwrap();
        let results: Vec<_> = waiters.into_iter().map(|w| w.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| *r == Err(SyncError::Timeout(Duration::from_millis(500)))));
        assert_eq!(sem.state.lock().demand, 0);
        assert_eq!(sem.available(), 0);
    }
}
