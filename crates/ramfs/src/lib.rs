#![forbid(unsafe_code)]
//! In-memory 9P2000 file server library for Rust.
//!
//! This crate keeps a hierarchical namespace entirely in memory and serves it
//! to any number of concurrent 9P2000 clients over TCP or Unix domain
//! sockets. The same namespace is reachable from local code through the
//! [`Fs`] facade, and [`Client`] speaks the protocol from the other end.
//!
//! # Getting Started
//!
//! ```no_run
//! use ramfs::{Fs, Result, om};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let fs = Fs::new("glenda");
//!
//!     let mut motd = fs.create("/motd", om::WRITE, 0o644).await?;
//!     motd.write(0, b"hello\n").await?;
//!     motd.clunk().await?;
//!
//!     fs.listen("tcp!0.0.0.0!5640").await
//! }
//! ```
//!
//! # Architecture
//!
//! Each connection decodes requests on its own task and queues them on one
//! work queue. A single dispatcher task owns the [`tree::Namespace`] and
//! executes queued transactions strictly in arrival order, so there is no
//! locking around the tree. A flush removes a request that is still queued;
//! one already taken by the dispatcher runs to completion.
//!
//! ## Fid Management
//!
//! **Important invariants:**
//! - Each fid is unique per connection
//! - A walk binds its new fid only if every name resolves
//! - Removing a file always clunks the fid, even when removal fails
//! - When a connection goes away all of its fids are clunked
//!
//! ## Paths
//!
//! Qid paths come from a bump and reclaim allocator. The path of a removed
//! node is returned for reuse only after the last fid referring to it is
//! clunked.
//!
//! # Startup Namespace
//!
//! ```text
//! d-rwxr-xr-x hostowner adm  /
//! d-rwxrwx--- adm       adm  /adm
//! --rw-rw---- adm       adm  /adm/group
//! ---w--w---- adm       adm  /adm/ctl
//! ```
//!
//! `/adm/group` holds the identity table as `name:leader:member,...` lines;
//! writing lines merges them into the table. `/adm/ctl` takes the commands
//! `uname NAME`, `uname NAME =LEADER`, `uname NAME +MEMBER`,
//! `uname NAME -MEMBER`, `unuser NAME` and `chatty on|off`.
//!
//! # Error Handling
//!
//! Every failure is an [`Error`]; its text is the ename carried by `RError`.
//!
//! # Transport
//!
//! - **TCP**: `"tcp!host!port"` (e.g., `"tcp!0.0.0.0!5640"`)
//! - **Unix Domain Sockets**: `"unix!path!suffix"` (e.g., `"unix!/tmp/ramfs!0"`)
pub mod client;
pub mod error;
pub mod fcall;
pub mod fid;
pub mod fs;
pub mod node;
pub mod path;
pub mod perm;
pub mod serialize;
pub mod srv;
pub mod synthetic;
pub mod tree;
pub mod users;
#[macro_use]
pub mod utils;

pub use crate::client::Client;
pub use crate::error::Error;
pub use crate::fcall::*;
pub use crate::fs::{File, Fs};
pub use crate::perm::Perm;
pub use crate::utils::Result;
