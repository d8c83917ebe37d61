pub mod backend;
pub mod broadcast;
pub mod codec;
pub mod config;
pub mod error;
pub mod handlers;
pub mod policy;
pub mod registry;
pub mod server;
pub mod session;
pub mod stratum;
pub mod template;

#[cfg(test)]
mod testing;

pub use backend::{LogStateSink, StateSink};
pub use broadcast::BroadcastReport;
pub use config::ProxyConfig;
pub use error::{ErrorReply, ProxyError, SessionError};
pub use handlers::{ProxyHandlers, RpcHandlers};
pub use policy::{PolicyGateway, PolicyServer};
pub use registry::Registry;
pub use server::{Endpoint, ProxyServer};
pub use session::{Session, SessionId};
pub use stratum::Flow;
pub use template::{BlockTemplate, TemplateBoard, TemplateSource};

pub type Result<T> = std::result::Result<T, ProxyError>;
