//! Framed request/response protocol for remote workers.
//!
//! Wire frames are newline-delimited JSON objects, one command per line:
//! requests as `{"cmd":"backupFile","param":[...]}`, responses as
//! `{"out":[...]}` on success or `{"err":code,"message":"..."}` on failure.
//! The same contract runs in-process for local storage and across a spawned
//! subprocess (optionally through a secure shell tunnel) for remote hosts.

pub mod client;
pub mod message;
pub mod pool;
pub mod server;

pub use client::ProtocolClient;
pub use message::{Request, Response};
pub use pool::{HostRole, PoolKey, RemoteClientPool};
pub use server::{serve, CommandHandler};
