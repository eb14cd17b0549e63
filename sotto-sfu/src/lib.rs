//! sotto SFU core
//!
//! This crate implements the server-side core of an anonymous voice-chat
//! SFU (Selective Forwarding Unit): rooms, peers, and the per-publisher
//! RTP fan-out engine. The server never decodes media; each publisher's
//! RTP stream is read once and duplicated to every other subscriber in
//! the same room.
//!
//! ## Architecture
//!
//! - [`RoomRegistry`]: room map plus the idle-room reaper and ban list
//! - [`Room`]: peers and forwarders of one ephemeral room
//! - [`Peer`]: one connected participant and its signaling channel
//! - [`TrackForwarder`]: single-reader, multi-writer fan-out for one
//!   publisher's audio track
//!
//! The HTTP/WebSocket surface lives in the `sotto-api` crate; this crate
//! is transport-agnostic apart from the framed signaling message types.

mod ban;
mod config;
mod forwarder;
pub mod logging;
mod message;
mod peer;
mod registry;
mod room;
mod types;

pub use ban::BanList;
pub use config::{SfuConfig, TurnConfig};
pub use forwarder::{TrackForwarder, RTP_MTU};
pub use message::{PeerInfo, SignalMessage};
pub use peer::{NegotiationState, Peer, SignalFrame, SignalSender};
pub use registry::RoomRegistry;
pub use room::Room;
pub use types::{PeerId, RoomId};
