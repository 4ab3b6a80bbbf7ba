//! # Relay Module - Routing Decoded Envelopes to the Sink
//!
//! [`PacketRouter`] is the single decision point for every decoded envelope,
//! whichever transport produced it:
//!
//! 1. Identity envelopes update the node/radio tables and stop there.
//! 2. Packets without decoded data (still encrypted) are ignored.
//! 3. Packets already recorded for this source are duplicates.
//! 4. NODEINFO payloads refresh the sender's labels, regardless of filters.
//! 5. The packet is classified and recorded (insert-if-absent, so a
//!    concurrent delivery of the same packet loses and becomes a duplicate).
//! 6. Only then does the category filter decide whether the formatted
//!    message is chunked and handed to the sink.
//!
//! Sink failures are logged and counted; they never undo the record.

pub mod chunk;
pub mod classifier;
pub mod service;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info, warn};

use crate::config::{Config, DisplayConfig, FilterConfig};
use crate::logutil::escape_log;
use crate::meshtastic::{self, DecodedEnvelope, MeshPacket, NodeEntry, RadioInfo, RawFrame};
use crate::metrics;
use crate::sink::Sink;
use crate::storage::DedupStore;
use chunk::{chunk_message, MAX_CHUNK_CHARS};
use classifier::{classify, summarize, Category};

/// What the router did with an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Sent to the sink; `delivered` counts chunks the sink accepted.
    Forwarded { chunks: usize, delivered: usize },
    /// Recorded, but the category is switched off.
    Filtered(Category),
    /// Recorded, but there was nothing to say (blank text).
    Silent,
    Duplicate,
    IdentityUpdated,
    Ignored,
}

pub struct PacketRouter {
    store: Arc<DedupStore>,
    sink: Arc<dyn Sink>,
    filters: FilterConfig,
    display: DisplayConfig,
    /// Labels for sources whose radio has not reported its node number yet.
    fallback_labels: HashMap<String, String>,
}

impl PacketRouter {
    pub fn new(store: Arc<DedupStore>, sink: Arc<dyn Sink>, cfg: &Config) -> Self {
        let mut fallback_labels: HashMap<String, String> = cfg
            .radios
            .iter()
            .map(|r| (r.name.clone(), r.fallback_label()))
            .collect();
        if cfg.connection.method.uses_serial() {
            let display = cfg.serial.display_name.as_deref();
            if let Some(display) = display.filter(|d| !d.trim().is_empty()) {
                fallback_labels.insert(
                    cfg.serial.name.clone(),
                    format!("{} ({})", display, cfg.serial.port),
                );
            }
        }
        Self {
            store,
            sink,
            filters: cfg.filters.clone(),
            display: cfg.display.clone(),
            fallback_labels,
        }
    }

    pub fn store(&self) -> &DedupStore {
        &self.store
    }

    /// Decode a transport frame and route it; `None` when it did not decode.
    pub async fn route_frame(&self, frame: &RawFrame) -> Option<RouteOutcome> {
        match meshtastic::decode(frame) {
            Some(env) => {
                metrics::inc_frames_decoded();
                Some(self.route_received(&frame.source, env, frame.received_at).await)
            }
            None => {
                metrics::inc_frames_undecodable();
                None
            }
        }
    }

    pub async fn route(&self, source: &str, envelope: DecodedEnvelope) -> RouteOutcome {
        self.route_received(source, envelope, Utc::now()).await
    }

    /// Route an envelope that arrived at `received_at`.
    pub async fn route_received(
        &self,
        source: &str,
        envelope: DecodedEnvelope,
        received_at: DateTime<Utc>,
    ) -> RouteOutcome {
        match envelope {
            DecodedEnvelope::Packet(pkt) => self.route_packet(source, pkt, received_at).await,
            DecodedEnvelope::NodeDirectory(entry) => self.update_node(&entry),
            DecodedEnvelope::RadioIdentity(info) => self.update_radio(source, info),
            other @ (DecodedEnvelope::Config | DecodedEnvelope::Unrecognized) => {
                debug!("{}: ignoring {} envelope", source, other.kind());
                RouteOutcome::Ignored
            }
        }
    }

    fn update_node(&self, entry: &NodeEntry) -> RouteOutcome {
        if entry.node_id == 0 || !entry.has_label() {
            return RouteOutcome::Ignored;
        }
        match self
            .store
            .upsert_node_identity(entry.node_id, &entry.short_label, &entry.long_label)
        {
            Ok(()) => {
                let label = if entry.short_label.is_empty() {
                    &entry.long_label
                } else {
                    &entry.short_label
                };
                info!("Updated node info: {} ({:08x})", escape_log(label), entry.node_id);
                RouteOutcome::IdentityUpdated
            }
            Err(e) => {
                warn!("node identity update for {:08x} failed: {}", entry.node_id, e);
                RouteOutcome::Ignored
            }
        }
    }

    fn update_radio(&self, source: &str, info: RadioInfo) -> RouteOutcome {
        let label = match self.store.node_identity(info.node_id) {
            Ok(Some(node)) => node.label().map(str::to_string),
            _ => None,
        }
        .unwrap_or_else(|| source.to_string());
        match self.store.upsert_radio_identity(source, info.node_id, &label) {
            Ok(()) => {
                info!("{}: radio is node {:08x}", source, info.node_id);
                RouteOutcome::IdentityUpdated
            }
            Err(e) => {
                warn!("radio identity update for {} failed: {}", source, e);
                RouteOutcome::Ignored
            }
        }
    }

    async fn route_packet(
        &self,
        source: &str,
        pkt: MeshPacket,
        received_at: DateTime<Utc>,
    ) -> RouteOutcome {
        let key = pkt.key();
        let Some(data) = pkt.data.as_ref() else {
            debug!("Skipping encrypted/undecoded packet {} from {}", key, source);
            return RouteOutcome::Ignored;
        };
        metrics::record_source_packet(source);

        match self.store.was_seen(&key, source) {
            Ok(true) => return self.duplicate(&key, source),
            Ok(false) => {}
            Err(e) => {
                warn!("dedup lookup for {} failed, skipping packet: {}", key, e);
                return RouteOutcome::Ignored;
            }
        }

        let category = classify(data.port);
        if category == Category::NodeInfo {
            if let Some(entry) = NodeEntry::from_user_payload(pkt.source_node_id, &data.payload) {
                self.update_node(&entry);
            } else {
                debug!("Could not parse nodeinfo payload from {:08x}", pkt.source_node_id);
            }
        }
        let summary = summarize(category, data.port, &data.payload);

        // The radio's receive time wins over our own clock when it is known.
        let first_seen = match pkt.receive_time {
            0 => received_at,
            rx => Utc
                .timestamp_opt(i64::from(rx), 0)
                .single()
                .unwrap_or(received_at),
        };
        match self.store.record(&key, source, first_seen) {
            Ok(true) => {}
            Ok(false) => return self.duplicate(&key, source),
            Err(e) => {
                warn!("recording {} failed, skipping packet: {}", key, e);
                return RouteOutcome::Ignored;
            }
        }

        let Some(body) = summary else {
            debug!("No message content for {} from {}", key, source);
            return RouteOutcome::Silent;
        };
        if !self.filters.allows(category) {
            debug!("Message type {} filtered out for {}", category.filter_key(), key);
            metrics::inc_filtered();
            return RouteOutcome::Filtered(category);
        }

        let text = self.format(source, &pkt, &body);
        let chunks = chunk_message(&text, MAX_CHUNK_CHARS);
        let mut delivered = 0;
        for piece in &chunks {
            match self.sink.send(piece).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    metrics::inc_sink_failures();
                    warn!("{} sink failed for {}: {}", self.sink.name(), key, e);
                }
            }
        }
        if delivered > 0 {
            metrics::inc_forwarded();
            metrics::record_source_forwarded(source);
            info!(
                "Forwarded {} from {:08x} via {}",
                category.filter_key(),
                pkt.source_node_id,
                source
            );
        } else {
            warn!("No chunk of {} reached the {} sink", key, self.sink.name());
        }
        RouteOutcome::Forwarded {
            chunks: chunks.len(),
            delivered,
        }
    }

    fn duplicate(&self, key: &meshtastic::MessageKey, source: &str) -> RouteOutcome {
        debug!("Skipping duplicate message {} from {}", key, source);
        metrics::inc_duplicates();
        metrics::record_source_duplicate(source);
        RouteOutcome::Duplicate
    }

    /// Label for a transport source: reported identity, configured radio, or raw name.
    pub fn radio_label(&self, source: &str) -> String {
        match self.store.lookup_radio_label(source) {
            Ok(Some(label)) => return label,
            Ok(None) => {}
            Err(e) => debug!("radio label lookup for {} failed: {}", source, e),
        }
        self.fallback_labels
            .get(source)
            .cloned()
            .unwrap_or_else(|| source.to_string())
    }

    fn node_label(&self, node_id: u32) -> String {
        self.store
            .lookup_node_label(node_id)
            .unwrap_or_else(|_| format!("{:08x}", node_id))
    }

    pub fn format(&self, source: &str, pkt: &MeshPacket, body: &str) -> String {
        let time = if pkt.receive_time == 0 {
            "N/A".to_string()
        } else {
            format!("<t:{}:t>", pkt.receive_time)
        };
        let mut out = format!(
            "📻 **{}** | **{}** | {}\n{}",
            self.radio_label(source),
            self.node_label(pkt.source_node_id),
            time,
            body
        );
        if let (true, Some(sig)) = (self.display.show_signal_strength, pkt.signal) {
            out.push_str(&format!("\n📶 SNR: {} | RSSI: {}", sig.snr, sig.rssi));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meshtastic::{PacketData, SignalQuality};
    use crate::sink::SinkError;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    #[async_trait::async_trait]
    impl Sink for Collect {
        async fn send(&self, text: &str) -> Result<(), SinkError> {
            self.0.lock().unwrap().push(text.to_string());
            Ok(())
        }
        fn name(&self) -> &'static str {
            "collect"
        }
    }

    fn router(dir: &TempDir, cfg: &Config) -> (PacketRouter, Arc<Collect>) {
        let store = Arc::new(DedupStore::open(dir.path()).unwrap());
        let sink = Arc::new(Collect::default());
        (PacketRouter::new(store, sink.clone(), cfg), sink)
    }

    fn packet(port: i32, payload: &[u8]) -> MeshPacket {
        MeshPacket {
            source_node_id: 0x12345678,
            sequence_id: 42,
            receive_time: 1_700_000_000,
            signal: Some(SignalQuality { snr: 6.25, rssi: -91 }),
            data: Some(PacketData {
                port,
                payload: payload.to_vec().into(),
            }),
        }
    }

    #[tokio::test]
    async fn formats_header_body_and_signal() {
        let dir = TempDir::new().unwrap();
        let (r, _) = router(&dir, &Config::default());
        let text = r.format("RadioA", &packet(1, b"Hello"), "💬 Hello");
        assert_eq!(
            text,
            "📻 **RadioA** | **12345678** | <t:1700000000:t>\n💬 Hello\n📶 SNR: 6.25 | RSSI: -91"
        );

        let mut cfg = Config::default();
        cfg.display.show_signal_strength = false;
        let dir2 = TempDir::new().unwrap();
        let (r, _) = router(&dir2, &cfg);
        let mut pkt = packet(1, b"x");
        pkt.receive_time = 0;
        assert_eq!(
            r.format("RadioA", &pkt, "💬 x"),
            "📻 **RadioA** | **12345678** | N/A\n💬 x"
        );
    }

    #[tokio::test]
    async fn blank_text_is_recorded_but_silent() {
        let dir = TempDir::new().unwrap();
        let (r, sink) = router(&dir, &Config::default());
        let outcome = r.route("RadioA", DecodedEnvelope::Packet(packet(1, b"  \n"))).await;
        assert_eq!(outcome, RouteOutcome::Silent);
        assert!(sink.0.lock().unwrap().is_empty());
        assert!(r.store().was_seen(&packet(1, b"").key(), "RadioA").unwrap());
    }

    #[tokio::test]
    async fn encrypted_packets_are_not_recorded() {
        let dir = TempDir::new().unwrap();
        let (r, _) = router(&dir, &Config::default());
        let mut pkt = packet(1, b"");
        pkt.data = None;
        let key = pkt.key();
        assert_eq!(r.route("RadioA", DecodedEnvelope::Packet(pkt)).await, RouteOutcome::Ignored);
        assert!(!r.store().was_seen(&key, "RadioA").unwrap());
    }

    #[tokio::test]
    async fn radio_identity_overrides_configured_label() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.radios.push(crate::config::RadioConfig {
            name: "radio1".into(),
            host: "10.0.0.5".into(),
            port: 80,
            display_name: Some("Roof".into()),
        });
        let (r, _) = router(&dir, &cfg);
        assert_eq!(r.radio_label("radio1"), "Roof (10.0.0.5)");
        assert_eq!(r.radio_label("elsewhere"), "elsewhere");

        r.route(
            "radio1",
            DecodedEnvelope::NodeDirectory(NodeEntry {
                node_id: 0xa1,
                short_label: "ROOF".into(),
                ..NodeEntry::default()
            }),
        )
        .await;
        let outcome = r
            .route("radio1", DecodedEnvelope::RadioIdentity(RadioInfo { node_id: 0xa1 }))
            .await;
        assert_eq!(outcome, RouteOutcome::IdentityUpdated);
        assert_eq!(r.radio_label("radio1"), "ROOF (000000a1)");
    }

    #[tokio::test]
    async fn first_seen_prefers_radio_receive_time() {
        let dir = TempDir::new().unwrap();
        let (r, _) = router(&dir, &Config::default());
        let arrived = Utc.timestamp_opt(1_800_000_000, 0).unwrap();

        r.route_received("RadioA", DecodedEnvelope::Packet(packet(1, b"timed")), arrived)
            .await;
        let rec = r.store().message_record(&packet(1, b"").key(), "RadioA").unwrap().unwrap();
        assert_eq!(rec.first_seen, Utc.timestamp_opt(1_700_000_000, 0).unwrap());

        let mut untimed = packet(1, b"untimed");
        untimed.sequence_id = 43;
        untimed.receive_time = 0;
        let key = untimed.key();
        r.route_received("RadioA", DecodedEnvelope::Packet(untimed), arrived)
            .await;
        let rec = r.store().message_record(&key, "RadioA").unwrap().unwrap();
        assert_eq!(rec.first_seen, arrived);
    }

    #[tokio::test]
    async fn long_messages_are_chunked_in_order() {
        let dir = TempDir::new().unwrap();
        let (r, sink) = router(&dir, &Config::default());
        let long = "word ".repeat(600);
        let outcome = r.route("RadioA", DecodedEnvelope::Packet(packet(1, long.as_bytes()))).await;
        let sent = sink.0.lock().unwrap().clone();
        assert_eq!(outcome, RouteOutcome::Forwarded { chunks: sent.len(), delivered: sent.len() });
        assert!(sent.len() >= 2);
        assert!(sent.iter().all(|c| c.chars().count() <= MAX_CHUNK_CHARS));
        assert!(sent.concat().contains(long.trim()));
    }
}
