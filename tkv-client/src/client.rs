//! # Remote-Store Client
//!
//! Purpose: Run logical commands against the remote store over pooled
//! connections, keeping every socket logged in and retrying the failures a
//! fresh session or socket can fix.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` hides pooling, login and framing.
//! 2. **Session Epochs**: Login state is per socket. A socket is logged in
//!    when its recorded epoch equals the client's; forcing a logout bumps the
//!    epoch so every socket logs in again on next use.
//! 3. **Bounded Retry**: Only `AuthRequired` and `Transport` failures retry,
//!    at most `retry_count` times. Conversion happens after the exchange and
//!    is never retried.
//! 4. **Guaranteed Release**: Connections are held by a `Pooled` guard, so
//!    every exit path returns them to the pool.
//!
//! ## Call Sequence
//!
//! ```text
//! acquire ─► epoch matches? ─no─► close, connect, AUTH?, SELECT? ─┐
//!              │ yes                                              │
//!              └─► drain/reconnect if needed ─────────────────────┤
//!                                                                 ▼
//!                                                 send command, read replies
//! ```

use std::collections::HashMap;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
};

use chrono::{Local, NaiveDateTime};
use parking_lot::Mutex;

use crate::config::RemoteOptions;
use crate::connection::{buffer_pool, Connection, ScratchBuffer};
use crate::convert::{FromReply, ToArg};
use crate::error::{ClientError, ClientResult};
use crate::pool::{Pool, PoolConfig, PoolStats};
use crate::resp::{Arg, Command, RespValue};

/// Blocking client for the remote key-value store.
pub struct Client {
    options: Arc<RemoteOptions>,
    pool: Pool<Connection>,
    buffers: Arc<Pool<ScratchBuffer>>,
    epoch: AtomicU64,
    db: AtomicI64,
    logged_in: AtomicBool,
    login_time: Mutex<Option<NaiveDateTime>>,
}

impl Client {
    /// Creates a client. No socket is opened until the first call.
    pub fn new(options: RemoteOptions) -> Self {
        let options = Arc::new(options.normalized());
        let buffers = buffer_pool("tkv-buffers");
        let pool_config = PoolConfig {
            min_idle: options.min_idle,
            max_count: options.max_connections,
            ..PoolConfig::default()
        };
        let factory_options = Arc::clone(&options);
        let factory_buffers = Arc::clone(&buffers);
        let pool = Pool::new("tkv-connections", pool_config, move || {
            Ok(Connection::new(
                Arc::clone(&factory_options),
                Arc::clone(&factory_buffers),
            ))
        });

        Client {
            db: AtomicI64::new(options.db()),
            options,
            pool,
            buffers,
            epoch: AtomicU64::new(1),
            logged_in: AtomicBool::new(false),
            login_time: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &RemoteOptions {
        &self.options
    }

    /// True after a successful login, until a logout is forced.
    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::Acquire)
    }

    /// Local time of the most recent first login after a logout.
    pub fn login_time(&self) -> Option<NaiveDateTime> {
        *self.login_time.lock()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Sends `PING`; true when the server answers `PONG`.
    pub fn ping(&self) -> ClientResult<bool> {
        self.call(&Command::new("PING"), first::<bool>)
    }

    /// Sends `QUIT` and logs every connection out.
    pub fn quit(&self) -> ClientResult<bool> {
        let result = self.call(&Command::new("QUIT"), first::<bool>);
        self.force_logout("quit");
        result
    }

    /// Switches every connection to database `db`.
    pub fn select(&self, db: i64) -> ClientResult<bool> {
        self.db.store(db.max(0), Ordering::Release);
        self.force_logout("database changed");
        self.call(&Command::single("SELECT", [Arg::from(db.max(0))]), first::<bool>)
    }

    /// Stores a value; `ttl <= 0` means no expiry.
    pub fn set<V: ToArg + ?Sized>(&self, key: &str, value: &V, ttl: i64) -> ClientResult<bool> {
        let command = if ttl > 0 {
            Command::single("SETEX", [Arg::from(key), Arg::from(ttl), value.to_arg()?])
        } else {
            Command::single("SET", [Arg::from(key), value.to_arg()?])
        };
        self.call(&command, first::<bool>)
    }

    /// Stores several values with `MSET`, then sets one `EXPIRE` per key when `ttl > 0`.
    pub fn set_many<K, V, I>(&self, entries: I, ttl: i64) -> ClientResult<bool>
    where
        K: AsRef<str>,
        V: ToArg,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut keys = Vec::new();
        let mut args = Vec::new();
        for (key, value) in entries {
            keys.push(key.as_ref().to_string());
            args.push(Arg::from(key.as_ref()));
            args.push(value.to_arg()?);
        }
        if keys.is_empty() {
            return Ok(true);
        }

        let mset = Command::single("MSET", args);
        let command = if ttl > 0 {
            let expires = keys.into_iter().map(|key| (Arg::from(key), Arg::from(ttl)));
            Command::multiple([mset, Command::batch("EXPIRE", expires)])
        } else {
            mset
        };
        self.call(&command, |values| {
            let mut stored = true;
            for value in values {
                stored &= bool::from_reply(value)?;
            }
            Ok(stored)
        })
    }

    /// Reads a value; `None` when the key is missing.
    pub fn get<T: FromReply>(&self, key: &str) -> ClientResult<Option<T>> {
        self.call(&Command::single("GET", [Arg::from(key)]), first::<Option<T>>)
    }

    /// Reads several values with one `MGET`.
    pub fn get_many<T, K>(&self, keys: &[K]) -> ClientResult<HashMap<String, Option<T>>>
    where
        T: FromReply,
        K: AsRef<str>,
    {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let command = Command::single("MGET", keys.iter().map(|key| Arg::from(key.as_ref())));
        let values: Vec<Option<T>> = self.call(&command, first::<Vec<Option<T>>>)?;
        if values.len() != keys.len() {
            return Err(ClientError::Protocol(format!(
                "MGET returned {} values for {} keys",
                values.len(),
                keys.len()
            )));
        }
        Ok(keys
            .iter()
            .map(|key| key.as_ref().to_string())
            .zip(values)
            .collect())
    }

    /// Sets a TTL in seconds; false when the key does not exist.
    pub fn expire(&self, key: &str, ttl: i64) -> ClientResult<bool> {
        self.call(
            &Command::single("EXPIRE", [Arg::from(key), Arg::from(ttl)]),
            first::<bool>,
        )
    }

    /// Runs any command and returns its raw replies, one per frame.
    pub fn pipeline(&self, command: &Command) -> ClientResult<Vec<RespValue>> {
        self.call(command, Ok)
    }

    /// Closes both pools; later calls fail with `Closed`.
    pub fn close(&self) {
        self.pool.close();
        self.buffers.close();
        self.logged_in.store(false, Ordering::Release);
    }

    fn call<R, F>(&self, command: &Command, convert: F) -> ClientResult<R>
    where
        F: FnOnce(Vec<RespValue>) -> ClientResult<R>,
    {
        let attempts = self.options.attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(command) {
                Ok(values) => return convert(values),
                Err(err) if err.is_retryable() => {
                    if attempt >= attempts {
                        tracing::warn!(
                            command = command.name(),
                            attempts = attempt,
                            error = %err,
                            "remote call failed; giving up"
                        );
                        return Err(ClientError::RetriesExhausted {
                            attempts: attempt,
                            source: Box::new(err),
                        });
                    }
                    tracing::warn!(
                        command = command.name(),
                        attempt,
                        error = %err,
                        "remote call failed; retrying"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn attempt(&self, command: &Command) -> ClientResult<Vec<RespValue>> {
        let mut conn = self.pool.acquire()?;
        let outcome = self.exchange(&mut conn, command);
        if let Err(err) = &outcome {
            self.recover(&mut conn, err);
        }
        outcome
    }

    fn exchange(&self, conn: &mut Connection, command: &Command) -> ClientResult<Vec<RespValue>> {
        let epoch = self.epoch.load(Ordering::Acquire);
        if conn.session_epoch() == Some(epoch) {
            // Drains or reconnects; a reconnect clears the session epoch.
            conn.ensure_connected()?;
        }
        if conn.session_epoch() != Some(epoch) {
            self.login(conn, epoch)?;
        }
        conn.execute(command)
    }

    fn login(&self, conn: &mut Connection, epoch: u64) -> ClientResult<()> {
        conn.close();
        conn.connect()?;
        if self.options.requires_auth() {
            conn.execute(&Command::single("AUTH", [Arg::from(self.options.password.as_str())]))?;
        }
        let db = self.db.load(Ordering::Acquire);
        if db != 0 {
            conn.execute(&Command::single("SELECT", [Arg::from(db)]))?;
        }
        conn.set_session_epoch(Some(epoch));

        if !self.logged_in.swap(true, Ordering::AcqRel) {
            *self.login_time.lock() = Some(Local::now().naive_local());
            tracing::debug!(server = %self.options.server, port = self.options.port(), db, "logged in");
        }
        Ok(())
    }

    fn recover(&self, conn: &mut Connection, err: &ClientError) {
        match err {
            ClientError::AuthRequired(_) => self.force_logout("server requires authentication"),
            ClientError::Transport(_) => {
                if !conn.is_connected() {
                    // The socket's session died with it.
                    conn.close();
                }
            }
            _ => {}
        }
    }

    fn force_logout(&self, reason: &str) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        if self.logged_in.swap(false, Ordering::AcqRel) {
            tracing::debug!(reason, "logged out");
        }
    }
}

fn first<T: FromReply>(values: Vec<RespValue>) -> ClientResult<T> {
    match values.into_iter().next() {
        Some(value) => T::from_reply(value),
        None => Err(ClientError::Protocol("missing reply".into())),
    }
}
