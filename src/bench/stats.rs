use std::fmt;
use std::time::Duration;

/// Outcome of one receive session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Report {
    pub bytes: u64,
    pub elapsed: Duration,
}

impl Report {
    pub fn new(bytes: u64, elapsed: Duration) -> Self {
        Self { bytes, elapsed }
    }

    /// Throughput in kilobits per second. A zero elapsed time yields
    /// `f64::INFINITY` instead of dividing by zero.
    pub fn kbits_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return f64::INFINITY;
        }
        (self.bytes as f64 / 1e3) * 8.0 / secs
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Received: {} bytes in {:.3} seconds (",
            self.bytes,
            self.elapsed.as_secs_f64()
        )?;
        let rate = self.kbits_per_sec();
        if rate.is_finite() {
            write!(f, "{:.3} Kbits/s)", rate)
        } else {
            write!(f, "+Inf Kbits/s)")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throughput_in_kbits() {
        let report = Report::new(125_000, Duration::from_secs(1));
        assert_eq!(report.kbits_per_sec(), 1000.0);
        assert_eq!(
            report.to_string(),
            "Received: 125000 bytes in 1.000 seconds (1000.000 Kbits/s)"
        );
    }

    #[test]
    fn fractional_seconds() {
        let report = Report::new(1_000_000, Duration::from_millis(2500));
        assert!((report.kbits_per_sec() - 3200.0).abs() < 1e-9);
        assert_eq!(
            report.to_string(),
            "Received: 1000000 bytes in 2.500 seconds (3200.000 Kbits/s)"
        );
    }

    #[test]
    fn zero_elapsed_is_infinite_not_a_fault() {
        let report = Report::new(4096, Duration::ZERO);
        assert!(report.kbits_per_sec().is_infinite());
        assert_eq!(
            report.to_string(),
            "Received: 4096 bytes in 0.000 seconds (+Inf Kbits/s)"
        );

        let empty = Report::new(0, Duration::ZERO);
        assert!(empty.kbits_per_sec().is_infinite());
    }
}
