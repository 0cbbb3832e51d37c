//! # TierKV Remote Client
//!
//! Purpose: Provide a synchronous client for a RESP-speaking key-value store,
//! with pooled connections, automatic re-login and bounded retries.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Sockets and encode buffers are reused through
//!    one generic lock-free `Pool<T>`.
//! 2. **Closed Error Set**: Server, auth, transport and protocol failures are
//!    distinct `ClientError` variants, each with its own recovery.
//! 3. **Minimal Allocation**: Frames are encoded into pooled `BytesMut`
//!    buffers and written in one burst.
//! 4. **Protocol Clarity**: RESP framing is encoded and parsed explicitly.

mod client;
mod config;
mod connection;
mod convert;
mod error;
mod pool;
pub mod resp;

pub use client::Client;
pub use config::{RemoteOptions, DEFAULT_PORT, DEFAULT_SERVER};
pub use connection::{buffer_pool, Connection, ScratchBuffer};
pub use convert::{FromReply, Json, ToArg, DATE_FORMAT};
pub use error::{ClientError, ClientResult};
pub use pool::{default_active_slots, Factory, Lease, Pool, PoolConfig, PoolStats, PoolSweep, Poolable, Pooled};
pub use resp::{Arg, Command, CommandKind, RespValue};
