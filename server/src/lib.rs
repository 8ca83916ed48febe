//! Parley Server - Real-time connection registry and broadcast hub.
//!
//! This crate provides the realtime core of Parley, responsible for:
//! - Authenticating WebSocket handshakes and extracting `(user, device)` identity
//! - Tracking live connections per device slot, with takeover on reconnect
//! - Detecting half-open connections with a ping/pong heartbeat
//! - Fanning out persisted records to every open connection of an audience
//!
//! # Architecture
//!
//! The persistence layer stores records and hands them to the hub; the hub
//! broadcasts them verbatim to connected clients. Nothing is queued for
//! clients that are offline.
//!
//! ```text
//! /ws ─▶ auth ─▶ registry.register ─▶ heartbeat.attach ─▶ read loop
//! /events ─▶ broadcast ─▶ registry snapshot ─▶ connection queues ─▶ sockets
//! ```

pub mod auth;
pub mod broadcast;
pub mod config;
pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod lifecycle;
pub mod registry;
pub mod routes;
pub mod types;
