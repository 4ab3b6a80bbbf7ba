//! HTTP transport: polls each configured radio's REST API once per cycle.
//!
//! Every radio is polled concurrently and each poll routes its own frame, so a
//! slow or dead radio never holds back the others. Transport problems are
//! logged and treated as "no data this cycle"; nothing here returns an error
//! to the loop.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use log::{debug, info, trace, warn};
use reqwest::StatusCode;
use tokio::sync::watch;

use super::RawFrame;
use crate::config::{HttpConfig, RadioConfig};
use crate::relay::{PacketRouter, RouteOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    FromRadio,
    NodeInfo,
}

impl Endpoint {
    pub fn path(self) -> &'static str {
        match self {
            Endpoint::FromRadio => "/api/v1/fromradio",
            Endpoint::NodeInfo => "/api/v1/nodeinfo",
        }
    }
}

pub struct HttpPoller {
    radios: Vec<RadioConfig>,
    cfg: HttpConfig,
    client: reqwest::Client,
    client_built: Instant,
    cycle: u64,
}

impl HttpPoller {
    pub fn new(radios: Vec<RadioConfig>, cfg: HttpConfig) -> reqwest::Result<Self> {
        let client = Self::build_client(&cfg)?;
        Ok(Self {
            radios,
            cfg,
            client,
            client_built: Instant::now(),
            cycle: 0,
        })
    }

    fn build_client(cfg: &HttpConfig) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(cfg.request_timeout())
            .pool_idle_timeout(cfg.client_recycle())
            .build()
    }

    /// Replace the connection pool once it has been alive for the recycle interval.
    pub fn recycle_if_due(&mut self) {
        if self.client_built.elapsed() < self.cfg.client_recycle() {
            return;
        }
        match Self::build_client(&self.cfg) {
            Ok(client) => {
                info!("HTTP client recycled after {:?}", self.client_built.elapsed());
                self.client = client;
                self.client_built = Instant::now();
            }
            Err(e) => warn!("HTTP client rebuild failed, keeping current pool: {}", e),
        }
    }

    pub fn radios(&self) -> &[RadioConfig] {
        &self.radios
    }

    /// Fetch at most one frame from `radio`. Never fails: errors are logged.
    pub async fn poll(&self, radio: &RadioConfig, endpoint: Endpoint) -> Option<RawFrame> {
        let url = format!("{}{}", radio.base_url(), endpoint.path());
        let resp = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                warn!("Timeout from {} ({})", radio.name, radio.host);
                return None;
            }
            Err(e) => {
                warn!("Error polling {} at {}: {}", radio.name, url, e);
                return None;
            }
        };
        match resp.status() {
            StatusCode::OK => {}
            StatusCode::SERVICE_UNAVAILABLE => {
                debug!("{}: no data (503)", radio.name);
                return None;
            }
            other => {
                warn!("HTTP {} from {} ({})", other.as_u16(), radio.name, url);
                return None;
            }
        }
        let body = match resp.bytes().await {
            Ok(b) => b,
            Err(e) => {
                warn!("Error reading body from {}: {}", radio.name, e);
                return None;
            }
        };
        if body.is_empty() {
            trace!("{}: empty {} body", radio.name, endpoint.path());
            return None;
        }
        Some(RawFrame {
            source: radio.name.clone(),
            received_at: Utc::now(),
            bytes: body,
        })
    }

    fn nodeinfo_due(&self) -> bool {
        let every = u64::from(self.cfg.nodeinfo_every_cycles);
        self.cycle == 0 || (every > 0 && self.cycle % every == 0)
    }

    /// Poll every radio once, routing frames as they arrive.
    pub async fn run_cycle(&mut self, router: &PacketRouter) -> Vec<RouteOutcome> {
        let endpoints: &[Endpoint] = if self.nodeinfo_due() {
            &[Endpoint::NodeInfo, Endpoint::FromRadio]
        } else {
            &[Endpoint::FromRadio]
        };
        let this = &*self;
        let polls = this.radios.iter().map(|radio| async move {
            let mut outcomes = Vec::new();
            for endpoint in endpoints {
                if let Some(frame) = this.poll(radio, *endpoint).await {
                    if let Some(outcome) = router.route_frame(&frame).await {
                        outcomes.push(outcome);
                    }
                }
            }
            outcomes
        });
        let outcomes = join_all(polls).await.into_iter().flatten().collect();
        self.cycle = self.cycle.wrapping_add(1);
        outcomes
    }

    /// Poll loop; exits when the shutdown flag flips.
    pub async fn run(mut self, router: Arc<PacketRouter>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "HTTP polling {} radio(s) every {}s",
            self.radios.len(),
            self.cfg.poll_interval_secs
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.recycle_if_due();
            self.run_cycle(&router).await;
            tokio::select! {
                _ = tokio::time::sleep(self.cfg.poll_interval()) => {}
                changed = shutdown.changed() => {
                    // Sender gone: nothing can flip the flag now.
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("HTTP poller stopped");
    }
}
