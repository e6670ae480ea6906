//! taskdesk: a small task dashboard backend and its typed client.
//!
//! The server keeps every collection in memory ([`world::World`]), persists
//! each change to a redb save file and fans changes out over a broadcast
//! channel to realtime subscribers. [`client`] talks to it over HTTP and
//! WebSocket and keeps list views in sync.

pub mod auth;
pub mod client;
pub mod config;
pub mod dto;
pub mod entities;
pub mod error;
pub mod expand;
pub mod filter;
pub mod notify;
pub mod oauth;
pub mod persist;
pub mod query;
pub mod realtime;
pub mod records;
pub mod routes;
pub mod state;
pub mod world;
