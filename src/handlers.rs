use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::ProxyConfig;
use crate::error::ErrorReply;
use crate::policy::PolicyGateway;
use crate::session::Session;
use crate::template::{target_hex, TemplateSource};

/// Business logic behind the stratum methods.
///
/// An `Err` is sent to the miner as a JSON-RPC error and ends the session.
#[async_trait]
pub trait RpcHandlers: Send + Sync {
    async fn login(&self, session: &Session, params: &[String], worker: &str) -> Result<Value, ErrorReply>;

    async fn get_work(&self, session: &Session) -> Result<Value, ErrorReply>;

    async fn submit_work(&self, session: &Session, worker: &str, params: &[String]) -> Result<Value, ErrorReply>;

    fn unknown_method(&self, session: &Session, method: &str) -> ErrorReply;
}

/// Format-checking handlers used by the standalone proxy.
/// Shares are checked for shape only, never against the target.
pub struct ProxyHandlers {
    templates: Arc<dyn TemplateSource>,
    policy: Arc<dyn PolicyGateway>,
    targets: Vec<String>,
}

impl ProxyHandlers {
    pub fn new(config: &ProxyConfig, templates: Arc<dyn TemplateSource>, policy: Arc<dyn PolicyGateway>) -> Self {
        let targets = config
            .stratum
            .iter()
            .map(|endpoint| target_hex(endpoint.difficulty))
            .collect();
        Self {
            templates,
            policy,
            targets,
        }
    }
}

#[async_trait]
impl RpcHandlers for ProxyHandlers {
    async fn login(&self, session: &Session, params: &[String], worker: &str) -> Result<Value, ErrorReply> {
        let Some(login) = params.first() else {
            return Err(ErrorReply::new(-1, "Invalid params"));
        };
        if !is_valid_address(login) {
            return Err(ErrorReply::new(-1, "Invalid login"));
        }
        log::info!("⛏️ Stratum miner connected {}.{}@{}", login.to_lowercase(), worker, session.ip());
        Ok(json!(true))
    }

    async fn get_work(&self, session: &Session) -> Result<Value, ErrorReply> {
        let template = match self.templates.current_template() {
            Some(t) if !t.header.is_empty() && !self.templates.is_sick() => t,
            _ => return Err(ErrorReply::new(0, "Work not ready")),
        };
        let target = self
            .targets
            .get(session.endpoint())
            .ok_or_else(|| ErrorReply::new(0, "Work not ready"))?;
        Ok(json!([template.header, template.seed, target]))
    }

    async fn submit_work(&self, session: &Session, worker: &str, params: &[String]) -> Result<Value, ErrorReply> {
        if params.len() != 3 {
            self.policy.apply_malformed_policy(session.ip());
            return Err(ErrorReply::new(-1, "Invalid params"));
        }
        if !is_hex_field(&params[0], 8) || !is_hex_field(&params[1], 32) || !is_hex_field(&params[2], 32) {
            self.policy.apply_malformed_policy(session.ip());
            return Err(ErrorReply::new(-1, "Malformed PoW result"));
        }
        log::debug!("Share from {}.{}@{}: nonce {}", session.login(), worker, session.ip(), params[0]);
        Ok(json!(true))
    }

    fn unknown_method(&self, session: &Session, method: &str) -> ErrorReply {
        log::warn!("Unknown stratum method {:?} from {}", method, session.ip());
        ErrorReply::new(-3, "Method not found")
    }
}

/// `0x`-prefixed 20-byte hex address
pub fn is_valid_address(s: &str) -> bool {
    is_hex_field(s, 20)
}

/// `0x` followed by exactly `len` hex-encoded bytes
pub fn is_hex_field(s: &str, len: usize) -> bool {
    match s.strip_prefix("0x") {
        Some(digits) if digits.len() == len * 2 => hex::decode(digits).is_ok(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::policy::PolicyServer;
    use crate::template::{BlockTemplate, TemplateBoard};
    use std::time::Duration;

    const ADDRESS: &str = "0xb85150eb365e7df0941f0cf08235f987ba91506a";

    fn setup() -> (ProxyHandlers, Arc<TemplateBoard>, Arc<PolicyServer>, Session) {
        let config = ProxyConfig::development();
        let board = Arc::new(TemplateBoard::new());
        let policy = Arc::new(PolicyServer::new(PolicyConfig {
            malformed_limit: 1,
            ..PolicyConfig::development()
        }));
        let handlers = ProxyHandlers::new(&config, board.clone(), policy.clone());
        let (_client, server) = tokio::io::duplex(64);
        let session = Session::new(0, "10.1.1.1".parse().unwrap(), Duration::from_secs(5), server);
        (handlers, board, policy, session)
    }

    #[test]
    fn test_hex_fields() {
        assert!(is_valid_address(ADDRESS));
        assert!(!is_valid_address("b85150eb365e7df0941f0cf08235f987ba91506a"));
        assert!(!is_valid_address("0xzz5150eb365e7df0941f0cf08235f987ba91506a"));
        assert!(is_hex_field("0x0000000000000001", 8));
        assert!(!is_hex_field("0x01", 8));
    }

    #[tokio::test]
    async fn test_login_validates_address() {
        let (handlers, _, _, session) = setup();
        assert_eq!(handlers.login(&session, &[ADDRESS.to_string()], "rig").await, Ok(json!(true)));
        assert_eq!(
            handlers.login(&session, &["nope".to_string()], "rig").await,
            Err(ErrorReply::new(-1, "Invalid login"))
        );
        assert!(handlers.login(&session, &[], "rig").await.is_err());
    }

    #[tokio::test]
    async fn test_get_work_requires_healthy_template() {
        let (handlers, board, _, session) = setup();
        assert_eq!(handlers.get_work(&session).await, Err(ErrorReply::new(0, "Work not ready")));

        board.publish(BlockTemplate {
            header: "0xheader".to_string(),
            seed: "0xseed".to_string(),
            height: 10,
        });
        let work = handlers.get_work(&session).await.unwrap();
        assert_eq!(work[0], "0xheader");
        assert_eq!(work[2], json!(target_hex(100)));

        board.set_sick(true);
        assert!(handlers.get_work(&session).await.is_err());
    }

    #[tokio::test]
    async fn test_submit_work_checks_shape() {
        let (handlers, _, policy, session) = setup();
        let good = vec![
            "0x0000000000000001".to_string(),
            format!("0x{}", "ab".repeat(32)),
            format!("0x{}", "cd".repeat(32)),
        ];
        assert_eq!(handlers.submit_work(&session, "rig", &good).await, Ok(json!(true)));
        assert!(!policy.is_banned(session.ip()));

        let bad = vec!["0x01".to_string(), good[1].clone(), good[2].clone()];
        assert_eq!(
            handlers.submit_work(&session, "rig", &bad).await,
            Err(ErrorReply::new(-1, "Malformed PoW result"))
        );
        assert!(policy.is_banned(session.ip()));
    }

    #[test]
    fn test_unknown_method_reply() {
        let (handlers, _, _, session) = setup();
        assert_eq!(handlers.unknown_method(&session, "mining.subscribe").code, -3);
    }
}
