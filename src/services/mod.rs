//! Domain services used by the websocket transport.
//!
//! ARCHITECTURE
//! ============
//! Service modules own the game protocol and durability concerns so the
//! transport layer can stay focused on frame parsing and dispatch. `game`
//! and `presence` are the two write paths against the shared store;
//! `session` is the per-connection coordinator; `persistence` keeps
//! Postgres in step with the in-memory documents.

pub mod game;
pub mod persistence;
pub mod presence;
pub mod session;
