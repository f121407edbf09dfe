use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

struct Inner {
    start: Instant,
    coarse: AtomicU64,
    running: AtomicBool,
}

impl Inner {
    fn precise(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }
}

/// Nanoseconds since the agent started. A background thread refreshes
/// the coarse value every tick, readers never take a lock.
pub struct Clock {
    inner: Arc<Inner>,
    ticker: Option<thread::JoinHandle<()>>,
}

impl Clock {
    pub fn spawn(tick: Duration) -> Self {
        let inner = Arc::new(Inner {
            start: Instant::now(),
            coarse: AtomicU64::new(0),
            running: AtomicBool::new(true),
        });
        let ticker = {
            let inner = inner.clone();
            thread::Builder::new()
                .name("trace-clock".to_owned())
                .spawn(move || {
                    while inner.running.load(Ordering::Relaxed) {
                        inner.coarse.store(inner.precise(), Ordering::Relaxed);
                        thread::sleep(tick);
                    }
                })
        };
        let ticker = match ticker {
            Ok(v) => Some(v),
            Err(err) => {
                log::warn!("cannot spawn clock thread {err}, every read will be precise");
                None
            }
        };
        Clock { inner, ticker }
    }

    /// A clock whose coarse value never advances.
    pub fn frozen() -> Self {
        Clock {
            inner: Arc::new(Inner {
                start: Instant::now(),
                coarse: AtomicU64::new(0),
                running: AtomicBool::new(false),
            }),
            ticker: None,
        }
    }

    pub fn coarse(&self) -> u64 {
        if self.ticker.is_none() && self.inner.running.load(Ordering::Relaxed) {
            return self.precise();
        }
        self.inner.coarse.load(Ordering::Relaxed)
    }

    pub fn precise(&self) -> u64 {
        self.inner.precise()
    }
}

impl Drop for Clock {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::Relaxed);
        if let Some(ticker) = self.ticker.take() {
            if ticker.join().is_err() {
                log::error!("clock thread panicked");
            }
        }
    }
}

/// Per-channel view of the clock, strictly increasing.
#[derive(Debug, Default)]
pub struct ClockCursor {
    last: u64,
    same_tick: u32,
}

impl ClockCursor {
    pub fn next(&mut self, clock: &Clock, max_same_tick: u32) -> u64 {
        let mut now = clock.coarse();
        if now <= self.last {
            self.same_tick += 1;
            if self.same_tick >= max_same_tick {
                self.same_tick = 0;
                now = clock.precise();
            }
        } else {
            self.same_tick = 0;
        }
        self.last = now.max(self.last + 1);
        self.last
    }

    pub fn last(&self) -> u64 {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::{Clock, ClockCursor};

    #[test]
    fn cursor_is_strictly_increasing() {
        let clock = Clock::frozen();
        let mut cursor = ClockCursor::default();
        let ts = (0..10).map(|_| cursor.next(&clock, 64)).collect::<Vec<_>>();
        assert_eq!(ts, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn precise_after_many_on_same_tick() {
        let clock = Clock::frozen();
        thread::sleep(Duration::from_millis(2));
        let mut cursor = ClockCursor::default();
        for _ in 0..3 {
            cursor.next(&clock, 4);
        }
        assert_eq!(cursor.last(), 3);
        // the fourth read on the same tick falls back to the precise clock
        let ts = cursor.next(&clock, 4);
        assert!(ts >= 2_000_000, "{ts}");
    }

    #[test]
    fn ticker_advances() {
        let clock = Clock::spawn(Duration::from_micros(100));
        thread::sleep(Duration::from_millis(5));
        assert!(clock.coarse() > 0);
    }
}
