use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use crate::policy::RateLimitPolicy;

struct Window {
    window_start: Instant,
    count: u32,
}

/// Per-IP fixed-window limiter. A disabled policy is a no-op allow.
pub struct RateLimiter {
    policy: RateLimitPolicy,
    windows: Mutex<HashMap<IpAddr, Window>>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if the request is allowed.
    pub fn check(&self, ip: IpAddr) -> bool {
        if !self.policy.enabled {
            return true;
        }
        let window_len = Duration::from_millis(self.policy.window_ms);
        let now = Instant::now();
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = windows.entry(ip).or_insert_with(|| Window {
            window_start: now,
            count: 0,
        });

        if now.duration_since(entry.window_start) >= window_len {
            entry.window_start = now;
            entry.count = 1;
            return true;
        }

        if entry.count >= self.policy.max_requests {
            return false;
        }
        entry.count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
    }

    #[test]
    fn allows_up_to_cap_then_denies() {
        let limiter = RateLimiter::new(RateLimitPolicy {
            enabled: true,
            window_ms: 10_000,
            max_requests: 2,
        });
        assert!(limiter.check(ip()));
        assert!(limiter.check(ip()));
        assert!(!limiter.check(ip()));
    }

    #[test]
    fn disabled_never_denies() {
        let limiter = RateLimiter::new(RateLimitPolicy {
            enabled: false,
            window_ms: 1,
            max_requests: 1,
        });
        for _ in 0..10 {
            assert!(limiter.check(ip()));
        }
    }

    #[test]
    fn window_reset_allows_again() {
        let limiter = RateLimiter::new(RateLimitPolicy {
            enabled: true,
            window_ms: 1,
            max_requests: 1,
        });
        assert!(limiter.check(ip()));
        assert!(!limiter.check(ip()));
        std::thread::sleep(Duration::from_millis(5));
        assert!(limiter.check(ip()));
    }

    #[test]
    fn separate_ips_have_independent_windows() {
        let limiter = RateLimiter::new(RateLimitPolicy {
            enabled: true,
            window_ms: 10_000,
            max_requests: 1,
        });
        assert!(limiter.check(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert!(limiter.check(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))));
    }
}
