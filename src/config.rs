use once_cell::sync::Lazy;
use std::{env, str::FromStr, time::Duration};

pub static ANTHROPIC_API_URL: Lazy<String> = Lazy::new(|| {
    env::var("ANTHROPIC_API_URL").unwrap_or_else(|_| "https://api.anthropic.com".to_string())
});

pub static COHERE_API_URL: Lazy<String> =
    Lazy::new(|| env::var("COHERE_API_URL").unwrap_or_else(|_| "https://api.cohere.ai".to_string()));

/// Runtime settings read once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub max_concurrent_jobs: usize,
    pub daily_job_limit: u64,
    pub feedback_sample_limit: usize,
    pub prompt_timeout: Option<Duration>,
    pub lease: Duration,
    pub sweep_interval: Duration,
    pub idempotency_ttl_secs: u64,
    pub request_max_bytes: usize,
    pub http: HttpSettings,
}

#[derive(Debug, Clone, Copy)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 8000,
            max_concurrent_jobs: 3,
            daily_job_limit: 10,
            feedback_sample_limit: 100,
            prompt_timeout: Some(Duration::from_secs(120)),
            lease: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            idempotency_ttl_secs: 3600,
            request_max_bytes: 256 * 1024,
            http: HttpSettings::default(),
        }
    }
}

impl Settings {
    /// Loads `.env` (if present) and overlays environment variables on the defaults.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();
        let prompt_timeout = match env_parse::<u64>("PROMPT_TIMEOUT_SECS") {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.prompt_timeout,
        };
        Self {
            port: env_parse("PORT").unwrap_or(defaults.port),
            max_concurrent_jobs: env_positive("MAX_CONCURRENT_JOBS")
                .unwrap_or(defaults.max_concurrent_jobs),
            daily_job_limit: env_positive("DAILY_JOB_LIMIT").unwrap_or(defaults.daily_job_limit),
            feedback_sample_limit: env_positive("FEEDBACK_SAMPLE_LIMIT")
                .unwrap_or(defaults.feedback_sample_limit),
            prompt_timeout,
            lease: env_positive("JOB_LEASE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.lease),
            sweep_interval: env_positive("SWEEP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            idempotency_ttl_secs: env_positive("IDEMPOTENCY_TTL_SECS")
                .unwrap_or(defaults.idempotency_ttl_secs),
            request_max_bytes: env_positive("REQUEST_MAX_BYTES")
                .unwrap_or(defaults.request_max_bytes),
            http: HttpSettings {
                timeout: env_positive("HTTP_TIMEOUT_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.http.timeout),
                connect_timeout: env_positive("HTTP_CONNECT_TIMEOUT_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.http.connect_timeout),
            },
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_positive<T>(key: &str) -> Option<T>
where
    T: FromStr + PartialOrd + Default,
{
    env_parse::<T>(key).filter(|v| *v > T::default())
}
