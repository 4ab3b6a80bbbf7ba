//! Test utilities & fixtures.
//! Protobuf frame builders, a recording sink, and a tiny HTTP radio stand-in.
#![allow(dead_code)] // Each test binary uses a different subset.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use meshcord::config::{Config, RadioConfig};
use meshcord::protobuf::meshtastic_generated as proto;
use meshcord::relay::PacketRouter;
use meshcord::sink::{Sink, SinkError};
use meshcord::storage::DedupStore;

pub fn mesh_packet(from: u32, id: u32, port: proto::PortNum, payload: &[u8]) -> proto::MeshPacket {
    proto::MeshPacket {
        from,
        id,
        rx_time: 1_700_000_000,
        payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
            portnum: port as i32,
            payload: payload.to_vec().into(),
            ..Default::default()
        })),
        ..Default::default()
    }
}

pub fn packet_frame(pkt: proto::MeshPacket) -> Vec<u8> {
    proto::FromRadio {
        id: 1,
        payload_variant: Some(proto::from_radio::PayloadVariant::Packet(pkt)),
    }
    .encode_to_vec()
}

pub fn text_frame(from: u32, id: u32, text: &str) -> Vec<u8> {
    packet_frame(mesh_packet(from, id, proto::PortNum::TextMessageApp, text.as_bytes()))
}

pub fn node_directory_frame(node: u32, short: &str, long: &str) -> Vec<u8> {
    proto::FromRadio {
        id: 2,
        payload_variant: Some(proto::from_radio::PayloadVariant::NodeInfo(proto::NodeInfo {
            num: node,
            user: Some(proto::User {
                id: format!("!{:08x}", node),
                long_name: long.to_string(),
                short_name: short.to_string(),
            }),
            ..Default::default()
        })),
    }
    .encode_to_vec()
}

/// Sink that remembers every message; optionally fails every call.
#[derive(Default)]
pub struct RecordingSink {
    pub sent: Mutex<Vec<String>>,
    pub fail: bool,
}

impl RecordingSink {
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn send(&self, text: &str) -> Result<(), SinkError> {
        self.sent.lock().unwrap().push(text.to_string());
        if self.fail {
            return Err(SinkError::Rejected {
                status: 500,
                body: "scripted".into(),
            });
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

pub fn router_with(
    cfg: &Config,
    dir: &tempfile::TempDir,
    sink: Arc<RecordingSink>,
) -> Arc<PacketRouter> {
    let store = Arc::new(DedupStore::open(dir.path()).expect("store"));
    Arc::new(PacketRouter::new(store, sink, cfg))
}

pub fn radio(name: &str, addr: SocketAddr) -> RadioConfig {
    RadioConfig {
        name: name.to_string(),
        host: addr.ip().to_string(),
        port: addr.port(),
        display_name: None,
    }
}

/// An address nothing listens on: connecting is refused.
pub fn refused_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    addr
}

/// Canned `(status, body)` per request path.
pub type Routes = HashMap<&'static str, (u16, Vec<u8>)>;

/// Minimal HTTP/1.1 responder standing in for a radio's REST API.
/// Unknown paths get 404. Returns the address and a request counter.
pub async fn spawn_radio(routes: Routes) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let hits = Arc::new(AtomicUsize::new(0));
    let routes = Arc::new(routes);
    let counter = hits.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else { break };
            let routes = routes.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match sock.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                counter.fetch_add(1, Ordering::SeqCst);
                let request = String::from_utf8_lossy(&buf);
                let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                let (status, body) = routes
                    .get(path.as_str())
                    .cloned()
                    .unwrap_or((404, Vec::new()));
                let head = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: application/x-protobuf\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status,
                    body.len()
                );
                let _ = sock.write_all(head.as_bytes()).await;
                let _ = sock.write_all(&body).await;
                let _ = sock.shutdown().await;
            });
        }
    });
    (addr, hits)
}
