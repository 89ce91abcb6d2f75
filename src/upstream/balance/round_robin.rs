use super::Reservation;
use crate::upstream::health::HealthProber;
use crate::upstream::target::Target;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Round-robin over the configured target list.
///
/// The counter advances exactly once per committing pick and never on
/// previews. With health checks enabled, a pick scans up to N candidates
/// starting at the indexed position and returns the first healthy one.
pub struct RoundRobinBalancer {
    targets: Vec<Arc<Target>>,
    counter: AtomicU64,
    health_check: bool,
    prober: HealthProber,
}

impl RoundRobinBalancer {
    pub fn new(targets: Vec<Arc<Target>>, health_check: bool, prober: HealthProber) -> Self {
        Self {
            targets,
            counter: AtomicU64::new(0),
            health_check,
            prober,
        }
    }

    pub fn targets(&self) -> Vec<Arc<Target>> {
        self.targets.clone()
    }

    pub async fn preview(&self) -> Option<Arc<Target>> {
        if self.targets.is_empty() {
            return None;
        }
        let idx = (self.counter.load(Ordering::Relaxed) as usize) % self.targets.len();
        if !self.health_check {
            return Some(self.targets[idx].clone());
        }
        self.first_healthy_from(idx).await
    }

    pub async fn pick(&self) -> Option<Reservation> {
        if self.targets.is_empty() {
            return None;
        }
        let idx = (self.counter.fetch_add(1, Ordering::Relaxed) as usize) % self.targets.len();
        let target = if self.health_check {
            self.first_healthy_from(idx).await?
        } else {
            self.targets[idx].clone()
        };
        Some(Reservation::new(target, None))
    }

    async fn first_healthy_from(&self, start: usize) -> Option<Arc<Target>> {
        let n = self.targets.len();
        for i in 0..n {
            let candidate = &self.targets[(start + i) % n];
            if self.prober.probe(candidate).await {
                return Some(candidate.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    fn targets(hosts: &[&str]) -> Vec<Arc<Target>> {
        hosts
            .iter()
            .map(|h| Arc::new(Target::parse(&format!("http://{}", h)).unwrap()))
            .collect()
    }

    /// Minimal loopback origin answering 200 to everything (incl. /healthz).
    async fn spawn_healthy_origin() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(v) => v,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let svc = service_fn(|_req| async {
                        Ok::<_, hyper::Error>(hyper::Response::new(Full::new(
                            bytes::Bytes::from_static(b"ok"),
                        )))
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await;
                });
            }
        });
        addr
    }

    /// An address nothing listens on: bind, note the port, drop the socket.
    async fn dead_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn test_fairness_two_full_rounds() {
        let hosts = ["a", "b", "c"];
        let lb = RoundRobinBalancer::new(targets(&hosts), false, HealthProber::new());

        let mut picked = Vec::new();
        for _ in 0..hosts.len() * 2 {
            picked.push(lb.pick().await.unwrap().target().host().to_string());
        }
        assert_eq!(picked, ["a", "b", "c", "a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_preview_does_not_advance() {
        let lb = RoundRobinBalancer::new(targets(&["a", "b"]), false, HealthProber::new());

        assert_eq!(lb.preview().await.unwrap().host(), "a");
        assert_eq!(lb.preview().await.unwrap().host(), "a");
        assert_eq!(lb.pick().await.unwrap().target().host(), "a");
        assert_eq!(lb.preview().await.unwrap().host(), "b");
    }

    #[tokio::test]
    async fn test_empty_targets() {
        let lb = RoundRobinBalancer::new(Vec::new(), false, HealthProber::new());
        assert!(lb.preview().await.is_none());
        assert!(lb.pick().await.is_none());
    }

    #[tokio::test]
    async fn test_health_filtering_skips_dead_target() {
        let live = spawn_healthy_origin().await;
        let dead = dead_addr().await;

        let lb = RoundRobinBalancer::new(
            targets(&[&dead.to_string(), &live.to_string()]),
            true,
            HealthProber::new(),
        );

        let mut live_picks = 0;
        for _ in 0..4 {
            let res = lb.pick().await.unwrap();
            assert_eq!(res.target().authority(), live.to_string());
            live_picks += 1;
        }
        assert_eq!(live_picks, 4);
    }

    #[tokio::test]
    async fn test_all_unhealthy_returns_none() {
        let dead_a = dead_addr().await;
        let dead_b = dead_addr().await;

        let lb = RoundRobinBalancer::new(
            targets(&[&dead_a.to_string(), &dead_b.to_string()]),
            true,
            HealthProber::new(),
        );
        assert!(lb.pick().await.is_none());
    }
}
