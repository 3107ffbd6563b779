use std::env;
use std::time::Duration;

use relay_proto::AcknowledgeMode;

/// Decides which response wins when an interceptor already set one and the
/// request was still force-delivered to a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForcedDeliveryPolicy {
    /// The fresh connector response overwrites the interceptor's.
    PreferConnectorResponse,
    /// The connector is invoked for its side effects only; the
    /// interceptor's response is kept. The default: forced delivery sends
    /// the request and ignores the result.
    KeepInterceptorResponse,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub redis_url: String,
    /// Bodies at or above this many bytes are outsourced to the body store.
    pub inline_body_threshold: u64,
    /// Deadline for one target invocation on the connector side.
    pub target_timeout: Duration,
    /// Overall server-side wait for a connector response.
    pub relay_timeout: Duration,
    /// How often batched connection heartbeats are flushed to the store.
    pub stats_flush_interval: Duration,
    /// A connection counts towards tenant availability only while its
    /// last-seen time is within this window.
    pub availability_window: Duration,
    pub origin_max_age: Duration,
    pub connection_max_age: Duration,
    pub prune_interval: Duration,
    /// TTL for bodies parked in the Redis body store.
    pub body_ttl_seconds: u64,
    pub forced_delivery_policy: ForcedDeliveryPolicy,
    /// Whether connectors must acknowledge receipt before answering.
    pub acknowledge_mode: AcknowledgeMode,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            port: env_parse("BREAKWATER_PORT", defaults.port),
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            inline_body_threshold: env_parse(
                "INLINE_BODY_THRESHOLD",
                defaults.inline_body_threshold,
            ),
            target_timeout: env_secs("TARGET_TIMEOUT_SECS", defaults.target_timeout),
            relay_timeout: env_secs("RELAY_TIMEOUT_SECS", defaults.relay_timeout),
            stats_flush_interval: env_secs("STATS_FLUSH_SECS", defaults.stats_flush_interval),
            availability_window: env_secs(
                "AVAILABILITY_WINDOW_SECS",
                defaults.availability_window,
            ),
            origin_max_age: env_secs("ORIGIN_MAX_AGE_SECS", defaults.origin_max_age),
            connection_max_age: env_secs("CONNECTION_MAX_AGE_SECS", defaults.connection_max_age),
            prune_interval: env_secs("PRUNE_INTERVAL_SECS", defaults.prune_interval),
            body_ttl_seconds: env_parse("BODY_TTL_SECS", defaults.body_ttl_seconds),
            forced_delivery_policy: forced_delivery_from_env(defaults.forced_delivery_policy),
            acknowledge_mode: acknowledge_mode_from_env(defaults.acknowledge_mode),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            redis_url: "redis://localhost:6379".to_string(),
            inline_body_threshold: 64 * 1024,
            target_timeout: Duration::from_secs(30),
            relay_timeout: Duration::from_secs(60),
            stats_flush_interval: Duration::from_secs(10),
            availability_window: Duration::from_secs(120),
            origin_max_age: Duration::from_secs(15 * 60),
            connection_max_age: Duration::from_secs(15 * 60),
            prune_interval: Duration::from_secs(60),
            body_ttl_seconds: 15 * 60,
            forced_delivery_policy: ForcedDeliveryPolicy::KeepInterceptorResponse,
            acknowledge_mode: AcknowledgeMode::ConnectorReceived,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_secs(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn forced_delivery_from_env(default: ForcedDeliveryPolicy) -> ForcedDeliveryPolicy {
    match env::var("FORCED_DELIVERY_POLICY").as_deref() {
        Ok("keep_interceptor") => ForcedDeliveryPolicy::KeepInterceptorResponse,
        Ok("prefer_connector") => ForcedDeliveryPolicy::PreferConnectorResponse,
        _ => default,
    }
}

fn acknowledge_mode_from_env(default: AcknowledgeMode) -> AcknowledgeMode {
    match env::var("ACKNOWLEDGE_MODE").as_deref() {
        Ok("disabled") => AcknowledgeMode::Disabled,
        Ok("connector_received") => AcknowledgeMode::ConnectorReceived,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_delivery_defaults_to_keeping_the_interceptor_response() {
        assert_eq!(
            Config::default().forced_delivery_policy,
            ForcedDeliveryPolicy::KeepInterceptorResponse
        );
    }
}
