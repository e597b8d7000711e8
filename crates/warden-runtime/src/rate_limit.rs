use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::Mutex;
use warden_core::WardenError;

/// Token-bucket limit: `burst` calls at once, refilled at `per_second`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub per_second: u32,
    pub burst: u32,
}

impl RateLimit {
    fn quota(self) -> Result<Quota, WardenError> {
        let per_second = NonZeroU32::new(self.per_second)
            .ok_or_else(|| WardenError::Config("rate limit per_second must be positive".into()))?;
        let burst = NonZeroU32::new(self.burst)
            .ok_or_else(|| WardenError::Config("rate limit burst must be positive".into()))?;
        Ok(Quota::per_second(per_second).allow_burst(burst))
    }
}

struct Limiter {
    limit: RateLimit,
    bucket: Arc<DefaultDirectRateLimiter>,
}

/// One token bucket per component. Components without an override use the
/// default limit.
pub struct RateLimits {
    default: RateLimit,
    limiters: Mutex<HashMap<String, Limiter>>,
}

impl RateLimits {
    pub fn new(default: RateLimit) -> Result<Self, WardenError> {
        default.quota()?;
        Ok(Self {
            default,
            limiters: Mutex::new(HashMap::new()),
        })
    }

    /// Take one token for `component_id`, failing fast when none is left.
    pub async fn check(&self, component_id: &str) -> Result<(), WardenError> {
        let bucket = {
            let mut limiters = self.limiters.lock().await;
            match limiters.get(component_id) {
                Some(l) => Arc::clone(&l.bucket),
                None => {
                    let limiter = build(self.default)?;
                    let bucket = Arc::clone(&limiter.bucket);
                    limiters.insert(component_id.to_string(), limiter);
                    bucket
                }
            }
        };
        bucket.check().map_err(|_| {
            tracing::debug!(component_id, "Rate limit exceeded");
            WardenError::RateLimited(component_id.to_string())
        })
    }

    /// Replace the limit of one component. Its bucket starts full.
    pub async fn set_limit(&self, component_id: &str, limit: RateLimit) -> Result<(), WardenError> {
        let limiter = build(limit)?;
        self.limiters
            .lock()
            .await
            .insert(component_id.to_string(), limiter);
        tracing::info!(
            component_id,
            per_second = limit.per_second,
            burst = limit.burst,
            "Rate limit updated"
        );
        Ok(())
    }

    pub async fn limit(&self, component_id: &str) -> RateLimit {
        self.limiters
            .lock()
            .await
            .get(component_id)
            .map_or(self.default, |l| l.limit)
    }
}

fn build(limit: RateLimit) -> Result<Limiter, WardenError> {
    Ok(Limiter {
        limit,
        bucket: Arc::new(RateLimiter::direct(limit.quota()?)),
    })
}
