use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::SinkExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::value::RawValue;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{timeout_at, Instant};
use tokio_util::codec::FramedWrite;

use crate::codec::{JsonPushMessage, JsonRpcResponse, LineCodec};
use crate::error::{ErrorReply, SessionError};

/// Write half of a miner connection
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Stable handle for a session, used as the registry key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        SessionId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

// Fallback when `now + timeout` does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One accepted miner connection.
///
/// The reader half is owned by the session handler; everything that writes
/// (direct replies, job pushes) goes through `writer`, whose lock keeps
/// messages from interleaving on the wire. Every write is bounded by the
/// session deadline.
pub struct Session {
    id: SessionId,
    endpoint: usize,
    ip: IpAddr,
    timeout: Duration,
    placeholder_id: bool,
    writer: AsyncMutex<FramedWrite<BoxedWriter, LineCodec>>,
    deadline: Mutex<Instant>,
    login: RwLock<String>,
    worker: RwLock<String>,
}

impl Session {
    pub fn new<W>(endpoint: usize, ip: IpAddr, timeout: Duration, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: BoxedWriter = Box::new(writer);
        Self {
            id: SessionId::next(),
            endpoint,
            ip,
            timeout,
            placeholder_id: true,
            writer: AsyncMutex::new(FramedWrite::new(writer, LineCodec::default())),
            deadline: Mutex::new(deadline_after(timeout)),
            login: RwLock::new(String::new()),
            worker: RwLock::new(String::new()),
        }
    }

    /// Toggle the `"id":0` placeholder on job notifications
    pub fn with_notification_id(mut self, enabled: bool) -> Self {
        self.placeholder_id = enabled;
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn endpoint(&self) -> usize {
        self.endpoint
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Login assigned after a successful `eth_submitLogin`; empty before
    pub fn login(&self) -> String {
        self.login.read().clone()
    }

    pub fn worker(&self) -> String {
        self.worker.read().clone()
    }

    pub fn set_identity(&self, login: &str, worker: &str) {
        *self.login.write() = login.to_string();
        *self.worker.write() = worker.to_string();
    }

    pub fn deadline(&self) -> Instant {
        *self.deadline.lock()
    }

    /// Push the deadline to now + endpoint timeout
    pub fn renew_deadline(&self) {
        *self.deadline.lock() = deadline_after(self.timeout);
    }

    pub async fn send_result<T: Serialize>(
        &self,
        id: Option<&RawValue>,
        result: &T,
    ) -> Result<(), SessionError> {
        self.write(&JsonRpcResponse::result(id, result)).await
    }

    /// Send an error envelope. Only reports whether the write itself succeeded;
    /// whether the session survives is the caller's decision.
    pub async fn send_error(&self, id: Option<&RawValue>, reply: &ErrorReply) -> Result<(), SessionError> {
        self.write(&JsonRpcResponse::error(id, reply)).await
    }

    /// Job notification, used by the broadcaster only
    pub async fn push_notification<T: Serialize>(&self, result: &T) -> Result<(), SessionError> {
        self.write(&JsonPushMessage::new(result, self.placeholder_id)).await
    }

    async fn write<T: Serialize>(&self, message: &T) -> Result<(), SessionError> {
        let mut writer = self.writer.lock().await;
        match timeout_at(self.deadline(), writer.send(message)).await {
            Ok(result) => result.map_err(SessionError::from),
            Err(_) => Err(SessionError::Timeout),
        }
    }

    /// Flush and shut down the write side of the transport
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        // Sink item type is irrelevant for close
        match tokio::time::timeout(self.timeout, SinkExt::<&()>::close(&mut *writer)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::debug!("Error closing session {} from {}: {}", self.id, self.ip, e),
            Err(_) => log::debug!("Timed out closing session {} from {}", self.id, self.ip),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("ip", &self.ip)
            .field("login", &*self.login.read())
            .finish()
    }
}
