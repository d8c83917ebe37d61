//! Recording collaborators for unit tests

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::backend::LogStateSink;
use crate::config::ProxyConfig;
use crate::error::{ErrorReply, ProxyError};
use crate::handlers::RpcHandlers;
use crate::policy::PolicyGateway;
use crate::server::ProxyServer;
use crate::session::Session;
use crate::template::TemplateBoard;

#[derive(Debug, Default)]
pub struct RecordingPolicy {
    pub banned: Mutex<Vec<IpAddr>>,
    pub malformed: Mutex<Vec<IpAddr>>,
    pub deny: AtomicBool,
}

impl RecordingPolicy {
    pub fn ban_count(&self) -> usize {
        self.banned.lock().len()
    }

    pub fn malformed_count(&self) -> usize {
        self.malformed.lock().len()
    }
}

impl PolicyGateway for RecordingPolicy {
    fn is_banned(&self, ip: IpAddr) -> bool {
        self.banned.lock().contains(&ip)
    }

    fn apply_limit_policy(&self, _ip: IpAddr) -> bool {
        !self.deny.load(Ordering::SeqCst)
    }

    fn ban_client(&self, ip: IpAddr) {
        self.banned.lock().push(ip);
    }

    fn apply_malformed_policy(&self, ip: IpAddr) {
        self.malformed.lock().push(ip);
    }
}

#[derive(Debug, Default)]
pub struct StubHandlers {
    pub reject_login: AtomicBool,
}

#[async_trait]
impl RpcHandlers for StubHandlers {
    async fn login(&self, _session: &Session, _params: &[String], _worker: &str) -> Result<Value, ErrorReply> {
        if self.reject_login.load(Ordering::SeqCst) {
            return Err(ErrorReply::new(-1, "Invalid login"));
        }
        Ok(json!(true))
    }

    async fn get_work(&self, _session: &Session) -> Result<Value, ErrorReply> {
        Ok(json!(["0xheader", "0xseed", "0xtarget"]))
    }

    async fn submit_work(&self, _session: &Session, _worker: &str, params: &[String]) -> Result<Value, ErrorReply> {
        if params.len() != 3 {
            return Err(ErrorReply::new(-1, "Invalid params"));
        }
        Ok(json!(true))
    }

    fn unknown_method(&self, _session: &Session, _method: &str) -> ErrorReply {
        ErrorReply::new(-3, "Method not found")
    }
}

#[derive(Debug, Clone, Default)]
pub struct TestCollaborators {
    pub policy: Arc<RecordingPolicy>,
    pub handlers: Arc<StubHandlers>,
    pub templates: Arc<TemplateBoard>,
    pub sink: Arc<LogStateSink>,
}

impl TestCollaborators {
    pub fn build(&self, config: ProxyConfig) -> Result<Arc<ProxyServer>, ProxyError> {
        ProxyServer::new(
            config,
            self.policy.clone(),
            self.handlers.clone(),
            self.templates.clone(),
            self.sink.clone(),
        )
        .map(Arc::new)
    }
}

pub fn test_server(config: ProxyConfig) -> (Arc<ProxyServer>, TestCollaborators) {
    let collaborators = TestCollaborators::default();
    let server = collaborators.build(config).expect("valid test config");
    (server, collaborators)
}
