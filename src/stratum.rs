//! # Stratum Session Handling
//!
//! Per endpoint, [`ProxyServer::listen_tcp`] admits connections and spawns one
//! task per miner. Each task runs the session state machine:
//!
//! ```text
//! AWAIT_LINE -> DECODE -> DISPATCH -> REPLY -> AWAIT_LINE
//!     |            |          |
//!     |            |          +--> CLOSED_ERROR (rejected login/work/share, write failure)
//!     |            +--> CLOSED_ERROR (malformed JSON or params)
//!     +--> CLOSED_CLEAN (EOF) / CLOSED_ERROR (flood, timeout, socket error)
//! ```

use std::sync::Arc;

use bytes::BytesMut;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use socket2::SockRef;
use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::time::timeout_at;
use tokio_util::codec::FramedRead;

use crate::codec::{LineCodec, StratumRequest, MAX_REQ_SIZE};
use crate::error::SessionError;
use crate::server::ProxyServer;
use crate::session::Session;

/// What the session handler does after a request has been answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The reply was an error the session cannot survive
    Close(String),
}

impl ProxyServer {
    /// Connection admission loop for one endpoint. Runs until the process exits.
    pub async fn listen_tcp(self: Arc<Self>, index: usize, listener: TcpListener) {
        let Some(endpoint) = self.endpoints.get(index) else {
            log::error!("❌ No stratum endpoint with index {}", index);
            return;
        };
        let name = endpoint.config.name.clone();
        let accept = Arc::new(Semaphore::new(endpoint.config.max_conn));

        loop {
            let (socket, peer_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    log::warn!("Accept error on {}: {}", name, e);
                    continue;
                }
            };
            if let Err(e) = SockRef::from(&socket).set_keepalive(true) {
                log::debug!("Failed to enable keep-alive for {}: {}", peer_addr, e);
            }

            let ip = peer_addr.ip();
            if self.policy.is_banned(ip) || !self.policy.apply_limit_policy(ip) {
                drop(socket);
                continue;
            }

            // Blocks the accept loop while the endpoint is at capacity
            let Ok(permit) = Arc::clone(&accept).acquire_owned().await else {
                break;
            };

            let (reader, writer) = socket.into_split();
            let session = match self.new_session(index, ip, writer) {
                Ok(session) => session,
                Err(e) => {
                    log::error!("❌ Failed to create session on {}: {}", name, e);
                    continue;
                }
            };

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                let _permit = permit;
                match server.handle_tcp_client(&session, reader).await {
                    Ok(()) => session.close().await,
                    Err(e) => {
                        log::debug!("Session {} from {} closed: {}", session.id(), session.ip(), e);
                        server.remove_session(&session);
                        session.close().await;
                    }
                }
            });
        }
    }

    /// Read, decode and dispatch request lines until the client goes away.
    ///
    /// `Ok(())` means a clean EOF; the session has already been dropped from
    /// the registry. Any `Err` is fatal to the session.
    pub async fn handle_tcp_client<R>(&self, session: &Arc<Session>, reader: R) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin,
    {
        let name = self.endpoint_name(session);
        let mut lines = FramedRead::new(reader, LineCodec::new(MAX_REQ_SIZE));
        session.renew_deadline();

        loop {
            let line = match read_line(session, &mut lines).await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    log::info!("🔌 Client on {} disconnected: {}", name, session.ip());
                    self.remove_session(session);
                    return Ok(());
                }
                Err(SessionError::Flood { limit }) => {
                    log::warn!("🌊 Socket flood detected on {} from {}", name, session.ip());
                    self.policy.ban_client(session.ip());
                    return Err(SessionError::Flood { limit });
                }
                Err(e) => {
                    log::debug!("Error reading from socket on {}: {}", name, e);
                    return Err(e);
                }
            };

            // Bare newlines and single bytes are keepalives
            if line.len() <= 1 {
                continue;
            }

            let request: StratumRequest = match serde_json::from_slice(&line) {
                Ok(request) => request,
                Err(e) => {
                    self.policy.apply_malformed_policy(session.ip());
                    log::warn!("Malformed stratum request on {} from {}: {}", name, session.ip(), e);
                    return Err(SessionError::Malformed(e.to_string()));
                }
            };

            session.renew_deadline();
            if let Flow::Close(reason) = self.handle_tcp_message(session, &request).await? {
                return Err(SessionError::Rejected(reason));
            }
        }
    }

    /// Dispatch one request and write its reply
    pub async fn handle_tcp_message(&self, session: &Arc<Session>, req: &StratumRequest) -> Result<Flow, SessionError> {
        let id = req.id();

        match req.method.as_str() {
            "eth_submitLogin" | "eth_login" => {
                let params: Vec<String> = self.decode_params(session, req)?;
                match self.handlers.login(session, &params, &req.worker).await {
                    Ok(reply) => {
                        let login = params.first().map(|login| login.to_lowercase()).unwrap_or_default();
                        session.set_identity(&login, &req.worker);
                        self.register_session(session);
                        session.send_result(id, &reply).await?;
                        Ok(Flow::Continue)
                    }
                    Err(reply) => {
                        session.send_error(id, &reply).await?;
                        Ok(Flow::Close(reply.message))
                    }
                }
            }
            "eth_getWork" => match self.handlers.get_work(session).await {
                Ok(reply) => {
                    session.send_result(id, &reply).await?;
                    Ok(Flow::Continue)
                }
                Err(reply) => {
                    session.send_error(id, &reply).await?;
                    Ok(Flow::Close(reply.message))
                }
            },
            "eth_submitWork" => {
                let params: Vec<String> = self.decode_params(session, req)?;
                match self.handlers.submit_work(session, &req.worker, &params).await {
                    Ok(reply) => {
                        session.send_result(id, &reply).await?;
                        Ok(Flow::Continue)
                    }
                    Err(reply) => {
                        session.send_error(id, &reply).await?;
                        Ok(Flow::Close(reply.message))
                    }
                }
            }
            "eth_submitHashrate" => {
                session.send_result(id, &true).await?;
                Ok(Flow::Continue)
            }
            method => {
                let reply = self.handlers.unknown_method(session, method);
                session.send_error(id, &reply).await?;
                if self.config.protocol.close_on_unknown_method {
                    Ok(Flow::Close(reply.message))
                } else {
                    Ok(Flow::Continue)
                }
            }
        }
    }

    fn decode_params<T: DeserializeOwned>(&self, session: &Session, req: &StratumRequest) -> Result<T, SessionError> {
        req.params().map_err(|e| {
            self.policy.apply_malformed_policy(session.ip());
            log::warn!(
                "Malformed stratum request params on {} from {}: {}",
                self.endpoint_name(session),
                session.ip(),
                e
            );
            SessionError::InvalidParams {
                method: req.method.clone(),
                reason: e.to_string(),
            }
        })
    }

    fn endpoint_name(&self, session: &Session) -> &str {
        self.endpoints
            .get(session.endpoint())
            .map(|endpoint| endpoint.config.name.as_str())
            .unwrap_or("unknown")
    }
}

/// Wait for the next line, honouring deadline renewals made by other tasks
async fn read_line<R>(
    session: &Session,
    lines: &mut FramedRead<R, LineCodec>,
) -> Result<Option<BytesMut>, SessionError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let deadline = session.deadline();
        match timeout_at(deadline, lines.next()).await {
            Ok(Some(line)) => return Ok(Some(line?)),
            Ok(None) => return Ok(None),
            Err(_) if session.deadline() > deadline => continue,
            Err(_) => return Err(SessionError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::testing::{test_server, TestCollaborators};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::task::JoinHandle;

    const LOGIN: &str = r#"{"id":1,"method":"eth_submitLogin","params":["0xb85150eb365e7df0941f0cf08235f987ba91506a"],"worker":"rig1"}"#;

    struct Harness {
        client: DuplexStream,
        session: Arc<Session>,
        task: JoinHandle<Result<(), SessionError>>,
    }

    fn connect(server: &Arc<ProxyServer>) -> Harness {
        let (client, io) = tokio::io::duplex(8192);
        let (reader, writer) = tokio::io::split(io);
        let session = server.new_session(0, "10.0.0.7".parse().unwrap(), writer).unwrap();

        let task_server = Arc::clone(server);
        let task_session = Arc::clone(&session);
        let task = tokio::spawn(async move {
            let result = task_server.handle_tcp_client(&task_session, reader).await;
            if result.is_err() {
                task_server.remove_session(&task_session);
            }
            task_session.close().await;
            result
        });
        Harness { client, session, task }
    }

    async fn send(client: &mut DuplexStream, line: &str) {
        client.write_all(line.as_bytes()).await.unwrap();
        client.write_all(b"\n").await.unwrap();
    }

    async fn finish(mut harness: Harness) -> (Result<(), SessionError>, String) {
        harness.client.shutdown().await.unwrap();
        let result = harness.task.await.unwrap();
        let mut out = String::new();
        harness.client.read_to_string(&mut out).await.unwrap();
        (result, out)
    }

    #[tokio::test]
    async fn test_submit_hashrate_reply() {
        let (server, _) = test_server(ProxyConfig::development());
        let mut h = connect(&server);

        send(&mut h.client, r#"{"id":1,"method":"eth_submitHashrate","params":[]}"#).await;
        let (result, out) = finish(h).await;

        assert!(result.is_ok());
        assert_eq!(out, "{\"id\":1,\"jsonrpc\":\"2.0\",\"error\":null,\"result\":true}\n");
    }

    #[tokio::test]
    async fn test_hashrate_is_idempotent() {
        let (server, _) = test_server(ProxyConfig::development());
        let mut h = connect(&server);
        let session = Arc::clone(&h.session);

        for id in 0..3 {
            send(&mut h.client, &format!(r#"{{"id":{},"method":"eth_submitHashrate","params":["0x1","0x2"]}}"#, id)).await;
        }
        let (result, out) = finish(h).await;

        assert!(result.is_ok());
        assert_eq!(out.lines().count(), 3);
        assert!(out.lines().all(|l| l.ends_with("\"result\":true}")));
        assert!(session.login().is_empty());
        assert!(!server.endpoint(0).unwrap().registry.contains(session.id()));
    }

    #[tokio::test]
    async fn test_login_registers_session() {
        let (server, _) = test_server(ProxyConfig::development());
        let mut h = connect(&server);
        let session = Arc::clone(&h.session);

        send(&mut h.client, LOGIN).await;
        let mut buf = vec![0u8; 128];
        let n = h.client.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("{\"id\":1,"));
        assert!(server.endpoint(0).unwrap().registry.contains(session.id()));
        assert_eq!(session.login(), "0xb85150eb365e7df0941f0cf08235f987ba91506a");
        assert_eq!(session.worker(), "rig1");

        // Clean EOF drops the registration
        let (result, _) = finish(h).await;
        assert!(result.is_ok());
        assert!(!server.endpoint(0).unwrap().registry.contains(session.id()));
    }

    #[tokio::test]
    async fn test_login_is_stored_lowercase() {
        let (server, _) = test_server(ProxyConfig::development());
        let mut h = connect(&server);
        let session = Arc::clone(&h.session);

        let mixed_case = LOGIN.replace("0xb85150eb", "0xB85150EB");
        send(&mut h.client, &mixed_case).await;
        let (result, out) = finish(h).await;

        assert!(result.is_ok());
        assert_eq!(out.lines().count(), 1);
        assert_eq!(session.login(), "0xb85150eb365e7df0941f0cf08235f987ba91506a");
    }

    #[tokio::test]
    async fn test_each_request_gets_one_reply_with_its_id() {
        let (server, _) = test_server(ProxyConfig::development());
        let mut h = connect(&server);

        send(&mut h.client, &LOGIN.replace("\"id\":1", "\"id\":\"login-a\"")).await;
        send(&mut h.client, r#"{"id":[7],"method":"eth_getWork"}"#).await;
        send(
            &mut h.client,
            r#"{"id":99,"method":"eth_submitWork","params":["0x01","0x02","0x03"],"worker":"rig1"}"#,
        )
        .await;
        let (result, out) = finish(h).await;

        assert!(result.is_ok());
        let ids: Vec<String> = out
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["id"].to_string())
            .collect();
        assert_eq!(ids, vec!["\"login-a\"", "[7]", "99"]);
    }

    #[tokio::test]
    async fn test_rejected_login_closes_session() {
        let (server, collaborators) = test_server(ProxyConfig::development());
        collaborators.handlers.reject_login.store(true, Ordering::SeqCst);
        let mut h = connect(&server);
        let session = Arc::clone(&h.session);

        send(&mut h.client, LOGIN).await;
        send(&mut h.client, r#"{"id":2,"method":"eth_submitHashrate","params":[]}"#).await;
        let (result, out) = finish(h).await;

        assert!(matches!(result, Err(SessionError::Rejected(ref m)) if m == "Invalid login"));
        assert_eq!(
            out,
            "{\"id\":1,\"jsonrpc\":\"2.0\",\"error\":{\"code\":-1,\"message\":\"Invalid login\"}}\n"
        );
        assert!(!server.endpoint(0).unwrap().registry.contains(session.id()));
    }

    #[tokio::test]
    async fn test_unknown_method_keeps_session_by_default() {
        let (server, _) = test_server(ProxyConfig::development());
        let mut h = connect(&server);

        send(&mut h.client, r#"{"id":1,"method":"mining.subscribe","params":[]}"#).await;
        send(&mut h.client, r#"{"id":2,"method":"eth_submitHashrate","params":[]}"#).await;
        let (result, out) = finish(h).await;

        assert!(result.is_ok());
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"code\":-3"));
        assert!(lines[1].contains("\"result\":true"));
    }

    #[tokio::test]
    async fn test_unknown_method_closes_when_configured() {
        let mut config = ProxyConfig::development();
        config.protocol.close_on_unknown_method = true;
        let (server, _) = test_server(config);
        let mut h = connect(&server);

        send(&mut h.client, r#"{"id":1,"method":"mining.subscribe","params":[]}"#).await;
        send(&mut h.client, r#"{"id":2,"method":"eth_submitHashrate","params":[]}"#).await;
        let (result, out) = finish(h).await;

        assert!(matches!(result, Err(SessionError::Rejected(_))));
        assert_eq!(out.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_json_closes_without_reply() {
        let (server, collaborators) = test_server(ProxyConfig::development());
        let mut h = connect(&server);

        send(&mut h.client, "{not json").await;
        send(&mut h.client, r#"{"id":2,"method":"eth_submitHashrate","params":[]}"#).await;
        let (result, out) = finish(h).await;

        assert!(matches!(result, Err(SessionError::Malformed(_))));
        assert!(out.is_empty());
        assert_eq!(collaborators.policy.malformed_count(), 1);
        assert_eq!(collaborators.policy.ban_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_params_close_without_reply() {
        let (server, collaborators) = test_server(ProxyConfig::development());
        let mut h = connect(&server);

        send(&mut h.client, r#"{"id":1,"method":"eth_submitWork","params":[1,2,3]}"#).await;
        let (result, out) = finish(h).await;

        assert!(matches!(result, Err(SessionError::InvalidParams { ref method, .. }) if method == "eth_submitWork"));
        assert!(out.is_empty());
        assert_eq!(collaborators.policy.malformed_count(), 1);
    }

    #[tokio::test]
    async fn test_flood_bans_and_stops_processing() {
        let (server, collaborators) = test_server(ProxyConfig::development());
        let mut h = connect(&server);

        h.client.write_all(&[b'x'; 2000]).await.unwrap();
        let result = (&mut h.task).await.unwrap();

        assert!(matches!(result, Err(SessionError::Flood { limit: MAX_REQ_SIZE })));
        assert_eq!(collaborators.policy.ban_count(), 1);

        let mut out = Vec::new();
        h.client.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_keepalive_lines_are_ignored() {
        let (server, collaborators) = test_server(ProxyConfig::development());
        let mut h = connect(&server);

        h.client.write_all(b"\n\r\nx\n").await.unwrap();
        send(&mut h.client, r#"{"id":5,"method":"eth_submitHashrate"}"#).await;
        let (result, out) = finish(h).await;

        assert!(result.is_ok());
        assert_eq!(out.lines().count(), 1);
        assert_eq!(collaborators.policy.malformed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_times_out() {
        let mut config = ProxyConfig::development();
        config.stratum[0].timeout_secs = 5;
        let (server, _) = test_server(config);
        let h = connect(&server);

        let result = h.task.await.unwrap();
        assert!(matches!(result, Err(SessionError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewed_deadline_keeps_reader_alive() {
        let mut config = ProxyConfig::development();
        config.stratum[0].timeout_secs = 5;
        let (server, _) = test_server(config);
        let mut h = connect(&server);

        // Renewed from outside, as a job push would
        tokio::time::sleep(Duration::from_secs(4)).await;
        h.session.renew_deadline();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!h.task.is_finished());

        send(&mut h.client, r#"{"id":1,"method":"eth_submitHashrate"}"#).await;
        let (result, out) = finish(h).await;
        assert!(result.is_ok());
        assert_eq!(out.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_admission_rejects_denied_connection() {
        let collaborators = TestCollaborators::default();
        let mut config = ProxyConfig::development();
        config.stratum[0].listen = "127.0.0.1:0".to_string();
        let server = collaborators.build(config).unwrap();
        let listener = server.bind(0).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::clone(&server).listen_tcp(0, listener));

        collaborators.policy.deny.store(true, Ordering::SeqCst);
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut out = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out)).await;
        assert!(read.is_ok(), "denied connection must be closed promptly");
        assert!(out.is_empty());
    }
}
