//! linehub — real-time connection hub.
//!
//! Accepts many concurrent client connections (WebSocket duplex lines and
//! SSE simplex lines), groups them per user and per line, and lets backend
//! code push binary frames to one line, all lines of a user, a subset of
//! users, or every connected client.
//!
//! This crate exposes internal modules for integration testing. The binary
//! entry point is in main.rs.

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod hub;
pub mod packet;
pub mod routes;
pub mod state;
