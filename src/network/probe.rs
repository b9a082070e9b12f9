//! TCP connect probing against the curated port catalog

use super::{AccessibilityTest, PortStatus};
use crate::ports::PortCatalog;
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;

/// Probes every catalogued port of one address
#[async_trait]
pub trait Prober: Send + Sync {
    /// One entry per catalogued port, in catalog order
    async fn probe(&self, ip: IpAddr, catalog: &PortCatalog) -> Vec<AccessibilityTest>;
}

/// Full TCP connect prober. Each port gets its own timeout; at most
/// `concurrency` connects are in flight per target.
#[derive(Debug, Clone)]
pub struct TcpProber {
    timeout: Duration,
    concurrency: usize,
}

impl TcpProber {
    pub fn new(timeout: Duration, concurrency: usize) -> Self {
        Self {
            timeout,
            concurrency: concurrency.max(1),
        }
    }

    /// Perform a TCP connect on a single port
    pub async fn probe_port(&self, ip: IpAddr, port: u16) -> PortStatus {
        let addr = SocketAddr::new(ip, port);
        let start = Instant::now();

        let status = match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                drop(stream);
                PortStatus::Open
            }
            Ok(Err(_)) => PortStatus::Closed, // refused or unreachable
            Err(_) => PortStatus::Closed,     // timed out, filtered
        };

        log::debug!("{}:{} {} in {}ms", ip, port, status, start.elapsed().as_millis());
        status
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, ip: IpAddr, catalog: &PortCatalog) -> Vec<AccessibilityTest> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(catalog.len());

        for entry in catalog.entries() {
            let prober = self.clone();
            let semaphore = semaphore.clone();
            let port = entry.port;
            handles.push(tokio::spawn(async move {
                // The semaphore is never closed, so acquire only fails if it were
                let _permit = semaphore.acquire_owned().await.ok();
                prober.probe_port(ip, port).await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (entry, handle) in catalog.entries().iter().zip(handles) {
            let status = handle.await.unwrap_or(PortStatus::Closed);
            results.push(AccessibilityTest::new(entry.port, entry.service.clone(), status));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortEntry;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn listener_port_reports_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        // Bind-and-drop to find a port that is almost certainly closed
        let closed_port = {
            let tmp = TcpListener::bind("127.0.0.1:0").await.unwrap();
            tmp.local_addr().unwrap().port()
        };

        let catalog = PortCatalog::new(vec![
            PortEntry::new(closed_port, "Closed"),
            PortEntry::new(open_port, "Test"),
        ]);
        let prober = TcpProber::new(Duration::from_millis(500), 2);
        let results = prober.probe("127.0.0.1".parse().unwrap(), &catalog).await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].port, closed_port);
        assert_eq!(results[0].status, PortStatus::Closed);
        assert_eq!(results[1].port, open_port);
        assert_eq!(results[1].service, "Test");
        assert!(results[1].is_open());
    }
}
