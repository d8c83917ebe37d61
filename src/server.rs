use std::net::IpAddr;
use std::sync::Arc;

use tokio::io::AsyncWrite;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::backend::StateSink;
use crate::config::{EndpointConfig, ProxyConfig};
use crate::error::ProxyError;
use crate::handlers::RpcHandlers;
use crate::policy::PolicyGateway;
use crate::registry::Registry;
use crate::session::Session;
use crate::template::{target_hex, TemplateSource};

/// One configured stratum endpoint and its live sessions
#[derive(Debug)]
pub struct Endpoint {
    pub index: usize,
    pub config: EndpointConfig,
    /// Share target derived from the fixed difficulty
    pub target: String,
    pub registry: Arc<Registry>,
}

/// Stratum proxy: owns the endpoints and the collaborators they share
pub struct ProxyServer {
    pub(crate) config: ProxyConfig,
    pub(crate) endpoints: Vec<Endpoint>,
    pub(crate) policy: Arc<dyn PolicyGateway>,
    pub(crate) handlers: Arc<dyn RpcHandlers>,
    pub(crate) templates: Arc<dyn TemplateSource>,
    pub(crate) sink: Arc<dyn StateSink>,
}

impl ProxyServer {
    pub fn new(
        config: ProxyConfig,
        policy: Arc<dyn PolicyGateway>,
        handlers: Arc<dyn RpcHandlers>,
        templates: Arc<dyn TemplateSource>,
        sink: Arc<dyn StateSink>,
    ) -> Result<Self, ProxyError> {
        config.validate().map_err(ProxyError::Config)?;

        let endpoints = config
            .stratum
            .iter()
            .enumerate()
            .map(|(index, endpoint)| Endpoint {
                index,
                config: endpoint.clone(),
                target: target_hex(endpoint.difficulty),
                registry: Arc::new(Registry::new()),
            })
            .collect();

        Ok(Self {
            config,
            endpoints,
            policy,
            handlers,
            templates,
            sink,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn endpoint(&self, index: usize) -> Result<&Endpoint, ProxyError> {
        self.endpoints.get(index).ok_or(ProxyError::UnknownEndpoint(index))
    }

    /// Build a session for a freshly accepted connection with its deadline armed
    pub fn new_session<W>(&self, index: usize, ip: IpAddr, writer: W) -> Result<Arc<Session>, ProxyError>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let endpoint = self.endpoint(index)?;
        let session = Session::new(index, ip, endpoint.config.timeout(), writer)
            .with_notification_id(self.config.protocol.notification_id_placeholder);
        session.renew_deadline();
        Ok(Arc::new(session))
    }

    pub fn register_session(&self, session: &Arc<Session>) {
        if let Some(endpoint) = self.endpoints.get(session.endpoint()) {
            endpoint.registry.register(Arc::clone(session));
        }
    }

    pub fn remove_session(&self, session: &Session) -> bool {
        self.endpoints
            .get(session.endpoint())
            .map(|endpoint| endpoint.registry.remove(session.id()).is_some())
            .unwrap_or(false)
    }

    /// Bind the listener for one endpoint
    pub async fn bind(&self, index: usize) -> Result<TcpListener, ProxyError> {
        let endpoint = self.endpoint(index)?;
        let listener = TcpListener::bind(&endpoint.config.listen)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: endpoint.config.listen.clone(),
                source,
            })?;
        log::info!(
            "🚀 Stratum {} listening on {} (Difficulty: {})",
            endpoint.config.name,
            endpoint.config.listen,
            endpoint.config.difficulty
        );
        Ok(listener)
    }

    /// Bind every endpoint, then serve them and the job distribution loop.
    /// Bind failures are returned before anything is spawned.
    pub async fn start(self: Arc<Self>) -> Result<(), ProxyError> {
        let mut listeners = Vec::with_capacity(self.endpoints.len());
        for index in 0..self.endpoints.len() {
            listeners.push(self.bind(index).await?);
        }

        let mut tasks = JoinSet::new();
        for (index, listener) in listeners.into_iter().enumerate() {
            tasks.spawn(Arc::clone(&self).listen_tcp(index, listener));
        }
        tasks.spawn(Arc::clone(&self).job_distribution_loop());

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                log::error!("❌ Stratum task failed: {}", e);
            }
        }
        Ok(())
    }

    /// Poll the template source and broadcast whenever the header changes
    pub async fn job_distribution_loop(self: Arc<Self>) {
        let mut refresh = tokio::time::interval(self.config.broadcast.refresh_interval());
        refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_header = String::new();

        loop {
            refresh.tick().await;

            let Some(template) = self.templates.current_template() else {
                continue;
            };
            if template.header.is_empty() || template.header == last_header || self.templates.is_sick() {
                continue;
            }
            last_header = template.header;

            for index in 0..self.endpoints.len() {
                if let Err(e) = self.broadcast_new_jobs(index).await {
                    log::error!("❌ Job broadcast failed: {}", e);
                }
            }
        }
    }
}
