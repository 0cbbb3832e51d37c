//! # Remote-Store Options
//!
//! Connection, session and pool settings for `Client`. Loadable from JSON
//! using camelCase names (`server`, `port`, `password`, `db`,
//! `connectTimeoutMs`, `sendTimeoutMs`, `receiveTimeoutMs`, `retryCount`).

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ClientError, ClientResult};

pub const DEFAULT_SERVER: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 6379;

/// Options for the remote-store client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RemoteOptions {
    /// Host name or IP address.
    pub server: String,
    /// TCP port; values outside `1..=65535` fall back to 6379.
    pub port: i64,
    /// Password sent with AUTH; empty disables AUTH.
    pub password: String,
    /// Database index selected after login; negative values become 0.
    pub db: i64,
    pub connect_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub receive_timeout_ms: u64,
    /// Extra attempts after the first one for retryable failures.
    pub retry_count: u32,
    /// Idle connections the pool sweep keeps around.
    pub min_idle: usize,
    /// Ceiling on connections lent out at once; 0 means unbounded.
    pub max_connections: usize,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        RemoteOptions {
            server: DEFAULT_SERVER.to_string(),
            port: DEFAULT_PORT as i64,
            password: String::new(),
            db: 0,
            connect_timeout_ms: 5000,
            send_timeout_ms: 3000,
            receive_timeout_ms: 3000,
            retry_count: 3,
            min_idle: 3,
            max_connections: 1000,
        }
    }
}

impl RemoteOptions {
    /// Options for `server:port` with every other field at its default.
    pub fn new(server: impl Into<String>, port: u16) -> Self {
        RemoteOptions {
            server: server.into(),
            port: port as i64,
            ..RemoteOptions::default()
        }
        .normalized()
    }

    /// Parses a JSON document, applying defaults for missing fields.
    pub fn from_json(text: &str) -> ClientResult<Self> {
        let options: RemoteOptions =
            serde_json::from_str(text).map_err(|err| ClientError::Config(err.to_string()))?;
        Ok(options.normalized())
    }

    /// Replaces out-of-range values with their defaults.
    pub fn normalized(mut self) -> Self {
        if self.server.trim().is_empty() {
            self.server = DEFAULT_SERVER.to_string();
        }
        if self.port <= 0 || self.port > u16::MAX as i64 {
            self.port = DEFAULT_PORT as i64;
        }
        if self.db < 0 {
            self.db = 0;
        }
        self
    }

    /// Port as a `u16`, falling back to the default when out of range.
    pub fn port(&self) -> u16 {
        u16::try_from(self.port).ok().filter(|port| *port != 0).unwrap_or(DEFAULT_PORT)
    }

    /// Database index, never negative.
    pub fn db(&self) -> i64 {
        self.db.max(0)
    }

    /// True when a password is configured and AUTH must be sent on login.
    pub fn requires_auth(&self) -> bool {
        !self.password.is_empty()
    }

    /// Total attempts per logical call (initial + retries).
    pub fn attempts(&self) -> usize {
        1 + self.retry_count as usize
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.send_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.receive_timeout_ms)
    }

    /// Resolves the server address; the first resolved address wins.
    pub fn socket_addr(&self) -> ClientResult<SocketAddr> {
        let target = format!("{}:{}", self.server, self.port());
        let mut addrs = (self.server.as_str(), self.port())
            .to_socket_addrs()
            .map_err(|err| ClientError::InvalidAddress(format!("{target}: {err}")))?;
        addrs.next().ok_or(ClientError::InvalidAddress(target))
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}
