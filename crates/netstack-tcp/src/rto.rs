//! Jacobson/Karn RTT estimator and RTO backoff.

use std::time::Duration;

const MIN_RTO: Duration = Duration::from_secs(1);
const MAX_RTO: Duration = Duration::from_secs(60);

/// `sa`/`sv` are kept in fractional seconds rather than fixed-point tick units — this is an
/// internal estimator, not a wire value, so there's no bit-exactness requirement to preserve.
#[derive(Debug, Clone, Copy)]
pub struct RttEstimator {
    sa: f64,
    sv: f64,
    initialized: bool,
}

impl RttEstimator {
    pub fn new() -> Self {
        Self {
            sa: 0.0,
            sv: 0.75,
            initialized: false,
        }
    }

    /// Feeds a fresh RTT sample. Callers must only pass samples for segments that were not
    /// themselves retransmitted (Karn's algorithm).
    pub fn sample(&mut self, measured: Duration) {
        let m = measured.as_secs_f64();
        if !self.initialized {
            self.sa = m;
            self.sv = m / 2.0;
            self.initialized = true;
        } else {
            let err = m - self.sa;
            self.sa += err / 8.0;
            self.sv += (err.abs() - self.sv) / 4.0;
        }
    }

    /// `rto = sa + max(1, sv<<2)` clipped to `[1, 60]` seconds.
    pub fn rto(&self) -> Duration {
        let rto = self.sa + (4.0 * self.sv).max(1.0);
        Duration::from_secs_f64(rto.clamp(1.0, 60.0))
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential backoff applied by the retransmit timer on each consecutive firing.
pub fn backoff(rto: Duration) -> Duration {
    (rto * 2).min(MAX_RTO).max(MIN_RTO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_the_estimate() {
        let mut rtt = RttEstimator::new();
        rtt.sample(Duration::from_millis(200));
        assert!(rtt.rto() >= MIN_RTO);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut rto = Duration::from_secs(1);
        rto = backoff(rto);
        assert_eq!(rto, Duration::from_secs(2));
        rto = backoff(rto);
        assert_eq!(rto, Duration::from_secs(4));

        let mut big = Duration::from_secs(50);
        big = backoff(big);
        assert_eq!(big, MAX_RTO);
    }
}
