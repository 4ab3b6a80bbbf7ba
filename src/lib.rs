//! # Meshcord - Meshtastic to Discord Relay
//!
//! Meshcord watches one or more Meshtastic radios and forwards the traffic it
//! hears to a Discord channel, each physical message at most once no matter how
//! many times a transport redelivers it.
//!
//! ## Features
//!
//! - **Two transports**: HTTP polling of any number of network-attached radios,
//!   and a continuous serial stream from a USB-attached radio, alone or together.
//! - **Unframed serial recovery**: envelopes are located in the raw byte stream
//!   by window search, skipping garbage and partial frames.
//! - **Persistent de-duplication**: a sled database remembers every processed
//!   `(node, packet id, source)` for a retention window, across restarts.
//! - **Identity tracking**: node names learned from the mesh label every message.
//! - **Category filters**: forward only the message types you care about.
//! - **Stall recovery**: a silent serial link is closed and reopened with backoff.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshcord::config::Config;
//! use meshcord::relay::service::RelayService;
//! use meshcord::sink::StdoutSink;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let (_stop, rx) = tokio::sync::watch::channel(false);
//!     RelayService::new(config, Arc::new(StdoutSink))?.run(rx).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`meshtastic`] - transports, serial resynchronisation, link health, envelope decoding
//! - [`relay`] - classification, routing, chunking and task orchestration
//! - [`storage`] - de-duplication records and identity tables
//! - [`sink`] - Discord and stdout output
//! - [`config`] - configuration loading and validation
//! - [`protobuf`] - Meshtastic protocol buffer definitions
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐
//! │  HttpPoller  │   │ Serial ingest│ ← transports
//! └──────────────┘   └──────────────┘
//!         │                  │ bounded queue
//!         └───────┬──────────┘
//! ┌─────────────────────────┐
//! │      PacketRouter       │ ← classify, dedup, format
//! └─────────────────────────┘
//!         │            │
//! ┌──────────────┐ ┌──────────┐
//! │  DedupStore  │ │   Sink   │
//! └──────────────┘ └──────────┘
//! ```

pub mod config;
pub mod logutil;
pub mod meshtastic;
pub mod metrics;
pub mod protobuf;
pub mod relay;
pub mod sink;
pub mod storage;
