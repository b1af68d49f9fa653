//! Syncbox: a Dropbox-style file synchronization service.
//!
//! The server (`syncboxd`) holds one canonical file tree per user; any number
//! of client devices upload, download, delete, and subscribe to changes on
//! that tree. Per-file state machines on both sides serialize concurrent
//! operations against the same file while unrelated files proceed in
//! parallel; a text-framed request/reply protocol ties the two together.

pub mod cli;
pub mod client;
pub mod message;
pub mod protocol;
pub mod server;
pub mod transfer;
pub mod watcher;
pub mod wire;
