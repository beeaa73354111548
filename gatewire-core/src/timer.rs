//! Periodic tick source with overrun reporting.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};

/// Outcome of waiting for the next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// The timer expired `n` times since the last wait (`n > 1` = overrun).
    Elapsed(u64),
    /// The shutdown channel fired or closed.
    Shutdown,
}

/// Monotonic periodic timer. The deadline advances in fixed steps of the
/// period, so a late waiter observes the number of missed expirations instead
/// of drifting.
pub struct RateTimer {
    period: Duration,
    next: Instant,
}

impl RateTimer {
    /// Create a timer firing `rate` times per second.
    pub fn new(rate: f64) -> Result<Self, TimerError> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(TimerError::InvalidRate(rate));
        }
        let period = Duration::from_secs_f64(1.0 / rate);
        Ok(Self {
            period,
            next: Instant::now() + period,
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Block until the next deadline or until `shutdown` fires.
    pub fn wait(&mut self, shutdown: &Receiver<()>) -> Tick {
        match shutdown.recv_deadline(self.next) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => Tick::Shutdown,
            Err(RecvTimeoutError::Timeout) => {
                let (expirations, next) = expirations_at(Instant::now(), self.next, self.period);
                self.next = next;
                Tick::Elapsed(expirations)
            }
        }
    }
}

/// Given the first missed deadline and the period, compute how many
/// expirations `now` covers and the following deadline. `now` is at or past
/// `deadline` when this is called.
fn expirations_at(now: Instant, deadline: Instant, period: Duration) -> (u64, Instant) {
    let late = now.saturating_duration_since(deadline);
    let missed = (late.as_nanos() / period.as_nanos().max(1)) as u64;
    (1 + missed, deadline + period * (missed as u32 + 1))
}

#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    #[error("invalid rate {0}, must be a positive finite frequency")]
    InvalidRate(f64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn single_expiration_when_on_time() {
        let period = Duration::from_millis(10);
        let deadline = Instant::now();
        let (n, next) = expirations_at(deadline, deadline, period);
        assert_eq!(n, 1);
        assert_eq!(next, deadline + period);
    }

    #[test]
    fn stall_reports_missed_expirations() {
        let period = Duration::from_millis(1);
        let deadline = Instant::now();
        // Three milliseconds late: the deadline tick plus two missed ones.
        let (n, next) = expirations_at(deadline + Duration::from_micros(2_500), deadline, period);
        assert_eq!(n, 3);
        assert_eq!(next, deadline + period * 3);
    }

    #[test]
    fn wait_ticks_and_shutdown() {
        let (tx, rx) = bounded::<()>(1);
        let mut timer = RateTimer::new(200.0).unwrap();
        match timer.wait(&rx) {
            Tick::Elapsed(n) => assert!(n >= 1),
            Tick::Shutdown => panic!("no shutdown was signalled"),
        }
        tx.send(()).unwrap();
        assert_eq!(timer.wait(&rx), Tick::Shutdown);
    }

    #[test]
    fn rejects_nonsense_rates() {
        assert!(RateTimer::new(0.0).is_err());
        assert!(RateTimer::new(-5.0).is_err());
        assert!(RateTimer::new(f64::NAN).is_err());
    }
}
