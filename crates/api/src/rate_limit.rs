use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Fixed-window request limiter keyed by principal. A limit of 0 means
/// the limiter is disabled for that call.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<HashMap<String, Window>>>,
    window: Duration,
    max_keys: usize,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

impl RateLimiter {
    pub fn new(window: Duration, max_keys: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            window,
            max_keys,
        }
    }

    pub fn allow(&self, key: &str, limit: u32) -> bool {
        if limit == 0 {
            return true;
        }

        let now = Instant::now();
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let window = inner.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(window.started) >= self.window {
            window.started = now;
            window.count = 0;
        }
        if window.count >= limit {
            return false;
        }
        window.count += 1;

        if inner.len() > self.max_keys {
            let window_len = self.window;
            inner.retain(|k, w| k.as_str() == key || now.duration_since(w.started) < window_len);
            if inner.len() > self.max_keys {
                let victims = inner
                    .keys()
                    .filter(|k| k.as_str() != key)
                    .cloned()
                    .collect::<Vec<_>>();
                let mut overflow = inner.len() - self.max_keys;
                for k in victims {
                    if overflow == 0 {
                        break;
                    }
                    if inner.remove(&k).is_some() {
                        overflow -= 1;
                    }
                }
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn limiter_rejects_when_window_budget_is_spent() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 16);
        assert!(limiter.allow("u1", 2));
        assert!(limiter.allow("u1", 2));
        assert!(!limiter.allow("u1", 2));
        // Independent key, independent budget.
        assert!(limiter.allow("u2", 2));
    }

    #[test]
    fn limiter_resets_after_the_window_rolls_over() {
        let limiter = RateLimiter::new(Duration::from_millis(5), 16);
        assert!(limiter.allow("u1", 1));
        assert!(!limiter.allow("u1", 1));
        thread::sleep(Duration::from_millis(10));
        assert!(limiter.allow("u1", 1));
    }

    #[test]
    fn zero_limit_disables_the_limiter() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 16);
        for _ in 0..100 {
            assert!(limiter.allow("u1", 0));
        }
    }
}
