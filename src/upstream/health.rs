use crate::upstream::target::Target;
use std::time::Duration;
use tracing::debug;

const PROBE_PATH: &str = "/healthz";
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Stateless per-call upstream prober.
///
/// One probe is one `GET {scheme}://{authority}/healthz` with a short
/// timeout and connection reuse disabled. Results are never cached; the
/// balancer asks again on every pick that needs one.
#[derive(Clone)]
pub struct HealthProber {
    client: reqwest::Client,
}

impl HealthProber {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            // One-shot connections: a probe must not report healthy off a
            // pooled socket that died since the previous request.
            .pool_max_idle_per_host(0)
            .no_proxy()
            .build()
            .expect("failed to build health probe client");
        Self { client }
    }

    /// Healthy iff the probe completes with a status in [200, 400).
    pub async fn probe(&self, target: &Target) -> bool {
        let url = format!("{}://{}{}", target.scheme(), target.authority(), PROBE_PATH);

        let healthy = match self.client.get(&url).send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                (200..400).contains(&status)
            }
            Err(_) => false,
        };

        metrics::counter!(
            "proxy_health_probe_total",
            "result" => if healthy { "healthy" } else { "unhealthy" },
        )
        .increment(1);

        if !healthy {
            debug!("health: probe failed, target={}", target);
        }
        healthy
    }
}

impl Default for HealthProber {
    fn default() -> Self {
        Self::new()
    }
}
