//! Serial transport: continuous ingest from a locally attached radio.
//!
//! Reads are blocking with a short timeout and run on the blocking pool; the
//! link is moved into each read and handed back, so shutdown never strands a
//! port inside a cancelled future. Recovered envelopes go into a bounded queue
//! that a separate task drains into the router, keeping byte ingestion
//! independent of sink latency.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use super::health::{ConnectionHealthMonitor, HealthVerdict};
use super::resync::{LineState, SerialFrameResynchronizer};
use super::DecodedEnvelope;
use crate::config::SerialConfig;
use crate::metrics;
use crate::relay::PacketRouter;

const READ_CHUNK: usize = 512;

/// A decoded envelope tagged with its source name.
pub type QueuedEnvelope = (String, DecodedEnvelope);

#[derive(Debug, Error)]
pub enum SerialError {
    #[error("failed to open serial port {port}: {reason}")]
    Open { port: String, reason: String },
    #[error("serial port opener exited without a result")]
    WorkerGone,
    #[error("serial support not compiled in (enable the `serial` feature)")]
    Unsupported,
    #[error("serial io error: {0}")]
    Io(#[from] io::Error),
}

/// A byte source that blocks for at most a short timeout per read.
pub trait SerialLink: Send + 'static {
    /// Returns `Ok(0)` when the read timed out without data.
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Opens links; runs on a dedicated worker thread.
pub trait LinkOpener: Send + Sync + 'static {
    fn open(&self) -> Result<Box<dyn SerialLink>, SerialError>;
    fn describe(&self) -> String;
}

#[cfg(feature = "serial")]
pub struct SerialPortOpener {
    path: String,
    baud_rate: u32,
    read_timeout: Duration,
}

#[cfg(feature = "serial")]
impl SerialPortOpener {
    pub fn from_config(cfg: &SerialConfig) -> Self {
        Self {
            path: cfg.port.clone(),
            baud_rate: cfg.baud_rate,
            read_timeout: Duration::from_millis(cfg.read_timeout_ms),
        }
    }
}

#[cfg(feature = "serial")]
struct PortLink(Box<dyn serialport::SerialPort>);

#[cfg(feature = "serial")]
impl SerialLink for PortLink {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.read(buf) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }
}

#[cfg(feature = "serial")]
impl LinkOpener for SerialPortOpener {
    fn open(&self) -> Result<Box<dyn SerialLink>, SerialError> {
        let mut builder = serialport::new(&self.path, self.baud_rate).timeout(self.read_timeout);
        // Some USB serial adapters need explicit settings
        #[cfg(unix)]
        {
            builder = builder
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None);
        }
        let mut port = builder.open().map_err(|e| SerialError::Open {
            port: self.path.clone(),
            reason: e.to_string(),
        })?;
        // ESP32 boards wake on DTR/RTS.
        let _ = port.write_data_terminal_ready(true);
        let _ = port.write_request_to_send(true);
        Ok(Box::new(PortLink(port)))
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.path, self.baud_rate)
    }
}

/// Opener for builds without serial support; every attempt fails.
#[cfg(not(feature = "serial"))]
pub struct SerialPortOpener {
    path: String,
}

#[cfg(not(feature = "serial"))]
impl SerialPortOpener {
    pub fn from_config(cfg: &SerialConfig) -> Self {
        Self {
            path: cfg.port.clone(),
        }
    }
}

#[cfg(not(feature = "serial"))]
impl LinkOpener for SerialPortOpener {
    fn open(&self) -> Result<Box<dyn SerialLink>, SerialError> {
        Err(SerialError::Unsupported)
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}

/// Open a link on a worker thread and hand it back over a oneshot.
pub async fn open_on_worker(
    opener: Arc<dyn LinkOpener>,
) -> Result<Box<dyn SerialLink>, SerialError> {
    let (tx, rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("serial-open".into())
        .spawn(move || {
            let _ = tx.send(opener.open());
        })?;
    rx.await.map_err(|_| SerialError::WorkerGone)?
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkEnd {
    Shutdown,
    Stalled,
    Failed,
}

pub struct SerialIngest {
    source: String,
    opener: Arc<dyn LinkOpener>,
    monitor: ConnectionHealthMonitor,
    resync: SerialFrameResynchronizer,
    queue: mpsc::Sender<QueuedEnvelope>,
}

impl SerialIngest {
    pub fn new(
        source: impl Into<String>,
        opener: Arc<dyn LinkOpener>,
        monitor: ConnectionHealthMonitor,
        queue: mpsc::Sender<QueuedEnvelope>,
    ) -> Self {
        Self {
            source: source.into(),
            opener,
            monitor,
            resync: SerialFrameResynchronizer::new(),
            queue,
        }
    }

    /// Connect, ingest, and reconnect until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.monitor.begin_connect();
            let link = match open_on_worker(self.opener.clone()).await {
                Ok(link) => link,
                Err(e) => {
                    let delay = self.monitor.connect_failed();
                    warn!(
                        "serial: connect to {} failed (attempt {}): {}; retrying in {:?}",
                        self.opener.describe(),
                        self.monitor.failed_attempts(),
                        e,
                        delay
                    );
                    if wait_or_shutdown(delay, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };
            self.monitor.connected(Instant::now());
            info!("serial: connected to {}", self.opener.describe());

            let end = self.pump(link, &mut shutdown).await;
            self.resync.reset();
            self.monitor.disconnected();
            if end == LinkEnd::Shutdown {
                break;
            }
            metrics::inc_reconnects();
            let delay = self.monitor.reconnect_delay();
            info!("serial: link {:?}; reconnecting in {:?}", end, delay);
            if wait_or_shutdown(delay, &mut shutdown).await {
                break;
            }
        }
        self.resync.reset();
        info!("serial ingest stopped");
    }

    async fn pump(
        &mut self,
        mut link: Box<dyn SerialLink>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> LinkEnd {
        loop {
            if *shutdown.borrow() {
                return LinkEnd::Shutdown;
            }
            let read = tokio::task::spawn_blocking(move || {
                let mut buf = [0u8; READ_CHUNK];
                let result = link.read_chunk(&mut buf).map(|n| buf[..n].to_vec());
                (link, result)
            })
            .await;
            let (returned, result) = match read {
                Ok(pair) => pair,
                Err(e) => {
                    error!("serial: read task failed: {}", e);
                    return LinkEnd::Failed;
                }
            };
            link = returned;
            let line = match result {
                Ok(bytes) if bytes.is_empty() => LineState::Idle,
                Ok(bytes) => {
                    self.resync.push(&bytes);
                    LineState::Receiving
                }
                Err(e) => {
                    warn!("serial: read error: {}", e);
                    return LinkEnd::Failed;
                }
            };

            for env in self.resync.drain(line) {
                self.monitor.record_packet(Instant::now());
                metrics::inc_frames_decoded();
                match self.queue.try_send((self.source.clone(), env)) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        metrics::inc_queue_drops();
                        warn!("serial: envelope queue full, dropping envelope");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return LinkEnd::Shutdown,
                }
            }

            let now = Instant::now();
            if self.monitor.check_due(now) {
                if let HealthVerdict::Stalled { silent_for } = self.monitor.check(now) {
                    warn!("serial: no packets for {:?}, reconnecting", silent_for);
                    return LinkEnd::Stalled;
                }
            }
        }
    }
}

/// Sleep for `delay`; true when shutdown was signalled first.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}

/// Drain the serial queue into the router until every sender is gone.
pub async fn forward_queue(mut rx: mpsc::Receiver<QueuedEnvelope>, router: Arc<PacketRouter>) {
    while let Some((source, env)) = rx.recv().await {
        router.route(&source, env).await;
    }
}
