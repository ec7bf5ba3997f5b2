//! RFC 3261 timer identities, base settings and retransmission policy.
//!
//! The policy functions here are pure: the transaction machines call them to
//! decide delays and the scheduler actually arms the timers. Keeping them
//! free of clock and loop state makes the backoff and absorption rules
//! directly unit-testable.

use std::fmt;
use std::time::Duration;

/// RFC 3261 transaction timers.
///
/// A/E drive request retransmission, G drives response retransmission,
/// B/F/H are the absolute transaction timeouts, and D/I/J/K absorb late
/// retransmissions before teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerType {
    /// INVITE client request retransmission interval.
    A,
    /// INVITE client transaction timeout.
    B,
    /// INVITE client wait time for response retransmissions.
    D,
    /// Non-INVITE client request retransmission interval.
    E,
    /// Non-INVITE client transaction timeout.
    F,
    /// INVITE server response retransmission interval.
    G,
    /// INVITE server wait time for ACK.
    H,
    /// INVITE server wait time for ACK retransmissions.
    I,
    /// Non-INVITE server wait time for request retransmissions.
    J,
    /// Non-INVITE client wait time for response retransmissions.
    K,
}

impl fmt::Display for TimerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerType::A => write!(f, "Timer A"),
            TimerType::B => write!(f, "Timer B"),
            TimerType::D => write!(f, "Timer D"),
            TimerType::E => write!(f, "Timer E"),
            TimerType::F => write!(f, "Timer F"),
            TimerType::G => write!(f, "Timer G"),
            TimerType::H => write!(f, "Timer H"),
            TimerType::I => write!(f, "Timer I"),
            TimerType::J => write!(f, "Timer J"),
            TimerType::K => write!(f, "Timer K"),
        }
    }
}

impl TimerType {
    /// Timers whose expiry means the peer never answered.
    pub fn is_transaction_timeout(&self) -> bool {
        matches!(self, TimerType::B | TimerType::F | TimerType::H)
    }

    /// Timers that only exist to absorb late retransmissions.
    pub fn is_absorption(&self) -> bool {
        matches!(self, TimerType::D | TimerType::I | TimerType::J | TimerType::K)
    }
}

/// Base timer values (RFC 3261 section 17.1.1.1).
///
/// One instance per engine; tests shrink these to keep wall-clock time
/// short when not running under a paused clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSettings {
    /// RTT estimate. Seeds the retransmission backoff and, times 64, the
    /// absolute transaction timeouts.
    pub t1: Duration,
    /// Maximum retransmission interval.
    pub t2: Duration,
    /// Reserved baseline, kept configurable for parity with the classic
    /// timer table. None of the RFC 3261 machines consume it.
    pub t3: Duration,
    /// Maximum lifetime of a message in the network. Bounds the ACK and
    /// response absorption waits (timers I and K).
    pub t4: Duration,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_millis(4000),
            t3: Duration::ZERO,
            t4: Duration::from_millis(5000),
        }
    }
}

impl TimerSettings {
    /// 64×T1, the bound for timers B, F and H.
    pub fn transaction_timeout(&self) -> Duration {
        self.t1 * 64
    }

    /// Initial retransmission interval for timers A, E and G, or `None`
    /// when the transport is reliable and no retransmission is armed.
    pub fn retransmit_start(&self, reliable: bool) -> Option<Duration> {
        if reliable {
            None
        } else {
            Some(self.t1)
        }
    }

    /// Doubles the interval, clamped at T2.
    pub fn next_retransmit_interval(&self, current: Duration) -> Duration {
        (current * 2).min(self.t2)
    }

    /// How long a terminating transaction lingers to absorb late
    /// retransmissions. Zero on reliable transports, where the peer stops
    /// retransmitting as soon as its send succeeds.
    pub fn absorption_delay(&self, timer: TimerType, reliable: bool) -> Duration {
        if reliable {
            return Duration::ZERO;
        }
        match timer {
            TimerType::D => Duration::from_secs(32),
            TimerType::I | TimerType::K => self.t4,
            TimerType::J => self.transaction_timeout(),
            // Not an absorption timer; callers only pass D/I/J/K.
            _ => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_clamps_at_t2() {
        let settings = TimerSettings::default();
        let mut interval = settings.retransmit_start(false).unwrap();
        let mut observed = Vec::new();
        for _ in 0..6 {
            observed.push(interval.as_millis());
            interval = settings.next_retransmit_interval(interval);
        }
        assert_eq!(observed, vec![500, 1000, 2000, 4000, 4000, 4000]);
    }

    #[test]
    fn reliable_transport_never_retransmits() {
        let settings = TimerSettings::default();
        assert_eq!(settings.retransmit_start(true), None);
        assert_eq!(
            settings.absorption_delay(TimerType::D, true),
            Duration::ZERO
        );
        assert_eq!(
            settings.absorption_delay(TimerType::K, true),
            Duration::ZERO
        );
    }

    #[test]
    fn absolute_timeout_is_64_t1() {
        let settings = TimerSettings {
            t1: Duration::from_millis(50),
            ..TimerSettings::default()
        };
        assert_eq!(settings.transaction_timeout(), Duration::from_millis(3200));
    }

    #[test]
    fn absorption_delays_unreliable() {
        let settings = TimerSettings::default();
        assert_eq!(
            settings.absorption_delay(TimerType::D, false),
            Duration::from_secs(32)
        );
        assert_eq!(
            settings.absorption_delay(TimerType::I, false),
            settings.t4
        );
        assert_eq!(
            settings.absorption_delay(TimerType::J, false),
            Duration::from_secs(32)
        );
    }
}
