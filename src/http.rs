use reqwest::Client;
use std::time::Duration;

/// Shared HTTP client for the inference gateway. The request timeout sits above the pipeline's
/// own per-call deadline so the pipeline, not reqwest, decides when a stage has waited too long.
pub fn build_client() -> Client {
    let timeout = env_secs("HTTP_TIMEOUT_SECS", 120);
    let connect = env_secs("HTTP_CONNECT_TIMEOUT_SECS", 5);
    Client::builder()
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
        .build()
        .unwrap_or_else(|_| Client::new())
}

pub fn env_secs(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
