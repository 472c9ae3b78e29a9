//! Redis-backed fixed-window rate limiter
//!
//! Each key gets a counter that expires after the window. The limiter fails
//! open: when Redis is not configured or unreachable, requests are allowed and
//! the error is logged by the caller.

use redis::aio::ConnectionManager;
use uuid::Uuid;

/// Limits applied by the API
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Login attempts per identifier (email or IP) per minute
    pub login_per_minute: u32,
    /// Tickets a single user may create per hour
    pub tickets_per_hour: u32,
    /// Inbound webhook calls per channel per minute
    pub webhooks_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            login_per_minute: 10,
            tickets_per_hour: 120,
            webhooks_per_minute: 600,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Outcome of a single rate-limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after_seconds: Option<u64>,
}

impl RateLimitResult {
    /// Result used when no limiter backend is available
    pub fn unlimited() -> Self {
        Self {
            allowed: true,
            remaining: u32::MAX,
            retry_after_seconds: None,
        }
    }

    /// Build a result from the counter value after increment and the key TTL
    pub fn from_count(count: u64, limit: u32, ttl_seconds: i64) -> Self {
        let limit = u64::from(limit);
        if count <= limit {
            Self {
                allowed: true,
                remaining: (limit - count) as u32,
                retry_after_seconds: None,
            }
        } else {
            Self {
                allowed: false,
                remaining: 0,
                retry_after_seconds: Some(ttl_seconds.max(1) as u64),
            }
        }
    }
}

/// Fixed-window rate limiter
#[derive(Clone)]
pub struct RateLimiter {
    conn: Option<ConnectionManager>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Connect to Redis. A failed connection yields a limiter that allows
    /// everything.
    pub async fn connect(redis_url: &str, config: RateLimitConfig) -> Self {
        let conn = match redis::Client::open(redis_url) {
            Ok(client) => match ConnectionManager::new(client).await {
                Ok(conn) => Some(conn),
                Err(e) => {
                    tracing::warn!(error = %e, "Redis unavailable, rate limiting disabled");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Invalid REDIS_URL, rate limiting disabled");
                None
            }
        };

        Self { conn, config }
    }

    /// Limiter without a backend
    pub fn disabled(config: RateLimitConfig) -> Self {
        Self { conn: None, config }
    }

    pub fn is_enabled(&self) -> bool {
        self.conn.is_some()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count one hit against `key` and report whether it is within `limit`
    pub async fn check(
        &self,
        key: &str,
        limit: u32,
        window_seconds: u64,
    ) -> Result<RateLimitResult, RateLimitError> {
        let Some(conn) = &self.conn else {
            return Ok(RateLimitResult::unlimited());
        };
        let mut conn = conn.clone();
        let key = format!("linedesk:ratelimit:{}", key);

        let (count, ttl): (u64, i64) = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(&key)
            .arg(0)
            .arg("EX")
            .arg(window_seconds)
            .arg("NX")
            .ignore()
            .incr(&key, 1)
            .ttl(&key)
            .query_async(&mut conn)
            .await?;

        Ok(RateLimitResult::from_count(count, limit, ttl))
    }

    /// Login attempts per identifier
    pub async fn check_login(&self, identifier: &str) -> Result<RateLimitResult, RateLimitError> {
        self.check(
            &format!("login:{}", identifier.to_lowercase()),
            self.config.login_per_minute,
            60,
        )
        .await
    }

    /// Ticket creation per user
    pub async fn check_ticket_creation(
        &self,
        user_id: Uuid,
    ) -> Result<RateLimitResult, RateLimitError> {
        self.check(
            &format!("tickets:{}", user_id),
            self.config.tickets_per_hour,
            3600,
        )
        .await
    }

    /// Inbound webhook calls per source
    pub async fn check_webhook(&self, source: &str) -> Result<RateLimitResult, RateLimitError> {
        self.check(
            &format!("webhook:{}", source),
            self.config.webhooks_per_minute,
            60,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_count_within_limit() {
        let r = RateLimitResult::from_count(3, 10, 42);
        assert!(r.allowed);
        assert_eq!(r.remaining, 7);
        assert_eq!(r.retry_after_seconds, None);
    }

    #[test]
    fn test_from_count_at_limit_is_allowed() {
        let r = RateLimitResult::from_count(10, 10, 42);
        assert!(r.allowed);
        assert_eq!(r.remaining, 0);
    }

    #[test]
    fn test_from_count_over_limit() {
        let r = RateLimitResult::from_count(11, 10, 42);
        assert!(!r.allowed);
        assert_eq!(r.retry_after_seconds, Some(42));
    }

    #[test]
    fn test_from_count_over_limit_without_ttl() {
        // TTL is -1 when the key has no expiry; never advise 0 seconds
        let r = RateLimitResult::from_count(11, 10, -1);
        assert_eq!(r.retry_after_seconds, Some(1));
    }

    #[tokio::test]
    async fn test_disabled_limiter_allows_everything() {
        let limiter = RateLimiter::disabled(RateLimitConfig::default());
        assert!(!limiter.is_enabled());
        for _ in 0..100 {
            let r = limiter.check_login("someone@example.com").await.unwrap();
            assert!(r.allowed);
        }
    }
}
