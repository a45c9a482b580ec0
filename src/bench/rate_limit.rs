use anyhow::{Result, bail};
use tokio::time::{Duration, Instant, sleep};

/// Bytes requested from the bucket before each read.
pub const READ_CHUNK_SIZE: usize = 8 << 10;

/// Payload bytes are only part of what goes on the wire. Scale the requested
/// bit rate up by this factor so payload throughput lands near it.
const FRAMING_OVERHEAD: f64 = 1.25;

const SUFFIXES: [(char, f64); 4] = [('K', 1e3), ('M', 1e6), ('G', 1e9), ('T', 1e12)];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    /// Sustained rate in bytes per second. Infinite means unlimited.
    pub bytes_per_sec: f64,
    /// Bucket capacity in bytes.
    pub burst: usize,
}

impl RateLimit {
    pub const UNLIMITED: RateLimit = RateLimit {
        bytes_per_sec: f64::INFINITY,
        burst: 0,
    };

    fn from_bits_per_sec(bits: f64) -> Self {
        RateLimit {
            bytes_per_sec: FRAMING_OVERHEAD * bits / 8.0,
            burst: READ_CHUNK_SIZE,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.bytes_per_sec.is_infinite()
    }

    /// Parses a bandwidth such as `800000`, `250K` or `1.5G` (bits per
    /// second). An empty string means no limit.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Ok(Self::UNLIMITED);
        }
        if let Ok(bits) = s.parse::<f64>() {
            return Self::checked(s, bits);
        }
        for (suffix, multiplier) in SUFFIXES {
            if let Some(number) = s.strip_suffix(suffix) {
                if let Ok(value) = number.parse::<f64>() {
                    return Self::checked(s, value * multiplier);
                }
            }
        }
        bail!(
            "failed to parse bandwidth limit {:?}: expected a number of bits/sec with an optional K, M, G or T suffix",
            s
        )
    }

    fn checked(s: &str, bits: f64) -> Result<Self> {
        if !bits.is_finite() || bits <= 0.0 {
            bail!("bandwidth limit {:?} must be a positive, finite rate", s);
        }
        let limit = Self::from_bits_per_sec(bits);
        // The bucket has to be able to express the wait for one full read.
        if Duration::try_from_secs_f64(READ_CHUNK_SIZE as f64 / limit.bytes_per_sec).is_err() {
            bail!("bandwidth limit {:?} is too small", s);
        }
        Ok(limit)
    }
}

/// Token bucket over tokio time. Starts full; acquiring more tokens than are
/// available reserves them and sleeps until they have accrued.
#[derive(Debug)]
pub struct TokenBucket {
    limit: RateLimit,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            tokens: limit.burst as f64,
            last: Instant::now(),
        }
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Time to wait before `n` tokens may be used, reserving them.
    pub fn reserve(&mut self, n: usize) -> Duration {
        if self.limit.is_unlimited() {
            return Duration::ZERO;
        }
        let now = Instant::now();
        let accrued = now.duration_since(self.last).as_secs_f64() * self.limit.bytes_per_sec;
        self.tokens = (self.tokens + accrued).min(self.limit.burst as f64);
        self.last = now;

        self.tokens -= n as f64;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-self.tokens / self.limit.bytes_per_sec)
                .unwrap_or(Duration::MAX)
        }
    }

    pub async fn acquire(&mut self, n: usize) {
        let wait = self.reserve(n);
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate(s: &str) -> f64 {
        RateLimit::parse(s).unwrap().bytes_per_sec
    }

    #[test]
    fn test_parse_rate_limit() {
        let test_cases = vec![
            ("8", 1.25),
            ("800", 125.0),
            ("1e3", 156.25),
            ("10K", 1.25 * 1e3 * 10.0 / 8.0),
            ("1M", 1.25 * 1e6 / 8.0),
            ("2.5G", 1.25 * 1e9 * 2.5 / 8.0),
            ("1T", 1.25 * 1e12 / 8.0),
        ];

        for (input, expected) in test_cases {
            assert!((rate(input) - expected).abs() < 1e-6, "{}", input);
            assert_eq!(RateLimit::parse(input).unwrap().burst, READ_CHUNK_SIZE);
        }
    }

    #[test]
    fn parse_is_deterministic() {
        for s in ["", "1M", "123.5K", "42"] {
            assert_eq!(RateLimit::parse(s).unwrap(), RateLimit::parse(s).unwrap());
        }
    }

    #[test]
    fn empty_means_unlimited() {
        let limit = RateLimit::parse("").unwrap();
        assert!(limit.is_unlimited());
        assert_eq!(limit.burst, 0);
    }

    #[test]
    fn malformed_strings_are_rejected() {
        for s in ["not-a-number", "1 M", "M", "10k", "1MB", "-5M", "0", "inf"] {
            assert!(RateLimit::parse(s).is_err(), "{:?} should not parse", s);
        }
    }

    #[test]
    fn vanishing_rates_are_rejected() {
        for s in ["1e-300", "1e-320", "5e-324"] {
            assert!(RateLimit::parse(s).is_err(), "{:?} should not parse", s);
        }
        // Slow but representable: one chunk every ~1.6 years.
        assert!(RateLimit::parse("0.001").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn huge_debt_saturates_wait() {
        let limit = RateLimit {
            bytes_per_sec: 1e-300,
            burst: READ_CHUNK_SIZE,
        };
        let mut bucket = TokenBucket::new(limit);
        assert_eq!(bucket.reserve(READ_CHUNK_SIZE), Duration::ZERO);
        assert_eq!(bucket.reserve(READ_CHUNK_SIZE), Duration::MAX);
        assert_eq!(bucket.reserve(READ_CHUNK_SIZE), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn unlimited_bucket_never_waits() {
        let mut bucket = TokenBucket::new(RateLimit::UNLIMITED);
        for _ in 0..1000 {
            assert_eq!(bucket.reserve(READ_CHUNK_SIZE), Duration::ZERO);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_paces_to_rate() {
        let limit = RateLimit {
            bytes_per_sec: 8192.0,
            burst: 8192,
        };
        let mut bucket = TokenBucket::new(limit);
        let start = Instant::now();

        // The first chunk drains the initial burst.
        bucket.acquire(8192).await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        for _ in 0..4 {
            bucket.acquire(8192).await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(3999), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(4010), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_time_refills_only_up_to_burst() {
        let limit = RateLimit {
            bytes_per_sec: 1000.0,
            burst: 1000,
        };
        let mut bucket = TokenBucket::new(limit);
        tokio::time::advance(Duration::from_secs(60)).await;

        assert_eq!(bucket.reserve(1000), Duration::ZERO);
        let wait = bucket.reserve(500);
        assert!((wait.as_secs_f64() - 0.5).abs() < 1e-3, "{:?}", wait);
    }
}
