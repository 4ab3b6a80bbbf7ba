//! Task orchestration for a running relay.
//!
//! Up to three tasks share one [`PacketRouter`]: the HTTP poll loop, the
//! serial ingest task, and the queue drain feeding serial envelopes to the
//! router. A `watch` flag stops them; the store is flushed once all exit.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use log::{error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::PacketRouter;
use crate::config::Config;
use crate::meshtastic::health::ConnectionHealthMonitor;
use crate::meshtastic::http::HttpPoller;
use crate::meshtastic::serial::{forward_queue, LinkOpener, SerialIngest, SerialPortOpener};
use crate::metrics;
use crate::sink::Sink;
use crate::storage::DedupStore;

pub struct RelayService {
    config: Config,
    store: Arc<DedupStore>,
    router: Arc<PacketRouter>,
    opener: Option<Arc<dyn LinkOpener>>,
}

impl RelayService {
    /// Open the store, sweep expired records, and wire the router to `sink`.
    pub fn new(config: Config, sink: Arc<dyn Sink>) -> Result<Self> {
        let db_path = config.storage.db_path();
        let store = Arc::new(
            DedupStore::open(&db_path)
                .map_err(|e| anyhow!("Failed to open store at {}: {}", db_path.display(), e))?,
        );
        match store.purge_older_than(config.storage.retention()) {
            Ok(n) => info!("Retention sweep removed {} record(s)", n),
            Err(e) => warn!("Retention sweep failed: {}", e),
        }
        let router = Arc::new(PacketRouter::new(store.clone(), sink, &config));
        Ok(Self {
            config,
            store,
            router,
            opener: None,
        })
    }

    /// Use a custom serial link opener instead of the system serial port.
    pub fn with_link_opener(mut self, opener: Arc<dyn LinkOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    pub fn router(&self) -> Arc<PacketRouter> {
        self.router.clone()
    }

    /// Run until the shutdown flag is set, then stop every task and flush the store.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let method = self.config.connection.method;
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        if method.uses_http() {
            let poller = HttpPoller::new(self.config.radios.clone(), self.config.http.clone())
                .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;
            tasks.push(("http", tokio::spawn(poller.run(self.router.clone(), shutdown.clone()))));
        }

        if method.uses_serial() {
            let serial = &self.config.serial;
            let (tx, rx) = mpsc::channel(serial.queue_capacity);
            let opener: Arc<dyn LinkOpener> = match &self.opener {
                Some(o) => o.clone(),
                None => Arc::new(SerialPortOpener::from_config(serial)),
            };
            let ingest = SerialIngest::new(
                serial.name.clone(),
                opener,
                ConnectionHealthMonitor::from_config(serial),
                tx,
            );
            info!("Serial ingest on {} as '{}'", serial.port, serial.name);
            tasks.push(("serial", tokio::spawn(ingest.run(shutdown.clone()))));
            tasks.push(("serial-queue", tokio::spawn(forward_queue(rx, self.router.clone()))));
        }

        for (name, handle) in tasks {
            if let Err(e) = handle.await {
                error!("{} task ended abnormally: {}", name, e);
            }
        }

        if let Err(e) = self.store.close() {
            warn!("Store flush failed: {}", e);
        }
        info!("Relay stopped: {}", metrics::snapshot());
        Ok(())
    }
}

/// Flip the shutdown flag on Ctrl-C.
pub fn spawn_ctrl_c(tx: watch::Sender<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => warn!("Ctrl-C handler failed: {}", e),
        }
        let _ = tx.send(true);
    })
}
