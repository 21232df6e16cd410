use std::env;
use std::fmt;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub redis_url: String,
    pub api_key: String,
    pub upstream_base_url: String,
    pub upstream_timeout_secs: u64,
    pub cache_ttl_secs: u64,
    pub monthly_quota: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_recovery_timeout_secs: u64,
    pub breaker_half_open_max_calls: u32,
    pub debug: bool,
}

#[derive(Debug)]
pub enum ConfigError {
    MissingApiKey,
    InvalidPort(String),
    InvalidCacheTtl(String),
    InvalidQuota(String),
    InvalidBreakerSetting(String),
    InvalidTimeout(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingApiKey => {
                write!(f, "AVIATIONSTACK_API_KEY is required")
            }
            ConfigError::InvalidPort(msg) => write!(f, "Invalid port: {}", msg),
            ConfigError::InvalidCacheTtl(msg) => write!(f, "Invalid cache TTL: {}", msg),
            ConfigError::InvalidQuota(msg) => write!(f, "Invalid monthly quota: {}", msg),
            ConfigError::InvalidBreakerSetting(msg) => {
                write!(f, "Invalid circuit breaker setting: {}", msg)
            }
            ConfigError::InvalidTimeout(msg) => write!(f, "Invalid timeout: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_host: "0.0.0.0".to_string(),
            server_port: 8004,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            api_key: String::new(),
            upstream_base_url: "http://api.aviationstack.com/v1".to_string(),
            upstream_timeout_secs: 30,
            cache_ttl_secs: 300,
            monthly_quota: 10_000,
            breaker_failure_threshold: 5,
            breaker_recovery_timeout_secs: 30,
            breaker_half_open_max_calls: 3,
            debug: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(host) = env::var("GATEWAY_HOST") {
            config.server_host = host;
        }

        if let Ok(port_str) = env::var("GATEWAY_PORT") {
            config.server_port = port_str
                .parse()
                .map_err(|_| ConfigError::InvalidPort(port_str))?;
        }

        if let Ok(redis_url) = env::var("REDIS_URL") {
            config.redis_url = redis_url;
        }

        // The provider key is a secret injected per instance; never taken
        // from inbound requests.
        config.api_key = env::var("AVIATIONSTACK_API_KEY").unwrap_or_default();

        if let Ok(base_url) = env::var("AVIATIONSTACK_BASE_URL") {
            config.upstream_base_url = base_url.trim_end_matches('/').to_string();
        }

        if let Ok(timeout_str) = env::var("UPSTREAM_TIMEOUT_SECS") {
            config.upstream_timeout_secs = timeout_str
                .parse()
                .map_err(|_| ConfigError::InvalidTimeout(timeout_str))?;
        }

        if let Ok(ttl_str) = env::var("CACHE_TTL") {
            config.cache_ttl_secs = ttl_str
                .parse()
                .map_err(|_| ConfigError::InvalidCacheTtl(ttl_str))?;
        }

        if let Ok(quota_str) = env::var("MONTHLY_QUOTA") {
            config.monthly_quota = quota_str
                .parse()
                .map_err(|_| ConfigError::InvalidQuota(quota_str))?;
        }

        if let Ok(threshold_str) = env::var("BREAKER_FAILURE_THRESHOLD") {
            config.breaker_failure_threshold = threshold_str
                .parse()
                .map_err(|_| ConfigError::InvalidBreakerSetting(threshold_str))?;
        }

        if let Ok(recovery_str) = env::var("BREAKER_RECOVERY_TIMEOUT") {
            config.breaker_recovery_timeout_secs = recovery_str
                .parse()
                .map_err(|_| ConfigError::InvalidBreakerSetting(recovery_str))?;
        }

        if let Ok(probes_str) = env::var("BREAKER_HALF_OPEN_MAX_CALLS") {
            config.breaker_half_open_max_calls = probes_str
                .parse()
                .map_err(|_| ConfigError::InvalidBreakerSetting(probes_str))?;
        }

        if let Ok(debug_str) = env::var("DEBUG") {
            config.debug = debug_str.to_lowercase() == "true";
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.is_empty() {
            return Err(ConfigError::MissingApiKey);
        }

        if self.server_port == 0 {
            return Err(ConfigError::InvalidPort("Port cannot be 0".to_string()));
        }

        if self.cache_ttl_secs == 0 {
            return Err(ConfigError::InvalidCacheTtl(
                "Cache TTL must be greater than 0".to_string(),
            ));
        }

        if self.monthly_quota == 0 {
            return Err(ConfigError::InvalidQuota(
                "Monthly quota must be greater than 0".to_string(),
            ));
        }

        if self.breaker_failure_threshold == 0 {
            return Err(ConfigError::InvalidBreakerSetting(
                "Failure threshold must be greater than 0".to_string(),
            ));
        }

        if self.breaker_recovery_timeout_secs == 0 {
            return Err(ConfigError::InvalidBreakerSetting(
                "Recovery timeout must be greater than 0".to_string(),
            ));
        }

        if self.breaker_half_open_max_calls == 0 {
            return Err(ConfigError::InvalidBreakerSetting(
                "Half-open max calls must be greater than 0".to_string(),
            ));
        }

        if self.upstream_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout(
                "Upstream timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
