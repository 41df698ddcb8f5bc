use crate::chat::{Request, Response};
use crate::config::{ProviderConfig, ProxyConfig};
use crate::error::ChatError;
use crate::openai::{OpenAiClient, model_max_context_size};
use crate::provider::{ChatProvider, ResponseStream};
use crate::upstream::build_http_client;
use async_trait::async_trait;
use rand_core::{OsRng, RngCore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Chooses which pool member serves the next call.
pub trait Selector: Send + Sync {
    /// Returns an index in `0..len`. Never called with `len == 0`.
    fn pick(&self, len: usize) -> usize;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSelector;

impl Selector for RandomSelector {
    fn pick(&self, len: usize) -> usize {
        (OsRng.next_u64() % len as u64) as usize
    }
}

/// Always picks the same slot, clamped to the pool size.
#[derive(Debug, Clone, Copy)]
pub struct FixedSelector(pub usize);

impl Selector for FixedSelector {
    fn pick(&self, len: usize) -> usize {
        self.0.min(len - 1)
    }
}

#[derive(Clone)]
pub struct ClientPool {
    name: &'static str,
    clients: Arc<[Arc<dyn ChatProvider>]>,
    selector: Arc<dyn Selector>,
}

impl ClientPool {
    pub fn new(
        name: &'static str,
        clients: Vec<Arc<dyn ChatProvider>>,
        selector: Arc<dyn Selector>,
    ) -> Self {
        Self {
            name,
            clients: clients.into(),
            selector,
        }
    }

    /// Builds the pool described by `conf`, or `None` when it is disabled.
    pub fn from_config(
        name: &'static str,
        conf: &ProviderConfig,
        proxy: &ProxyConfig,
        selector: Arc<dyn Selector>,
    ) -> Result<Option<Self>, ChatError> {
        if !conf.enable {
            return Ok(None);
        }
        if conf.servers.is_empty() || conf.keys.is_empty() {
            return Err(ChatError::Config(format!(
                "pool {name} is enabled but has no servers or keys"
            )));
        }

        let proxy = (conf.auto_proxy && proxy.is_configured()).then_some(proxy);
        let http = build_http_client(proxy)?;

        let clients: Vec<Arc<dyn ChatProvider>> = if conf.azure {
            if conf.keys.len() < conf.servers.len() {
                return Err(ChatError::Config(format!(
                    "pool {name}: azure needs one key per server ({} servers, {} keys)",
                    conf.servers.len(),
                    conf.keys.len()
                )));
            }
            conf.servers
                .iter()
                .zip(&conf.keys)
                .map(|(server, key)| {
                    Arc::new(OpenAiClient::azure(
                        http.clone(),
                        server.as_str(),
                        key.as_str(),
                        conf.api_version.as_str(),
                    )) as Arc<dyn ChatProvider>
                })
                .collect()
        } else {
            let organization = Some(conf.organization.clone()).filter(|o| !o.is_empty());
            conf.servers
                .iter()
                .flat_map(|server| conf.keys.iter().map(move |key| (server, key)))
                .map(|(server, key)| {
                    Arc::new(OpenAiClient::new(
                        http.clone(),
                        server.as_str(),
                        key.as_str(),
                        organization.clone(),
                    )) as Arc<dyn ChatProvider>
                })
                .collect()
        };

        tracing::info!(
            pool = name,
            azure = conf.azure,
            proxied = proxy.is_some(),
            clients = clients.len(),
            "client pool ready"
        );
        Ok(Some(Self::new(name, clients, selector)))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn pick(&self) -> Option<Arc<dyn ChatProvider>> {
        if self.clients.is_empty() {
            return None;
        }
        let idx = self.selector.pick(self.clients.len());
        self.clients.get(idx).cloned()
    }
}

/// Primary pool with an optional backup, chosen from configuration alone.
#[derive(Clone, Default)]
pub struct ChatRouter {
    primary: Option<ClientPool>,
    backup: Option<ClientPool>,
}

impl ChatRouter {
    pub fn new(primary: Option<ClientPool>, backup: Option<ClientPool>) -> Self {
        Self { primary, backup }
    }

    pub fn active_pool(&self) -> Option<&ClientPool> {
        self.primary
            .as_ref()
            .filter(|p| !p.is_empty())
            .or_else(|| self.backup.as_ref().filter(|p| !p.is_empty()))
    }

    pub fn route(&self) -> Result<Arc<dyn ChatProvider>, ChatError> {
        let pool = self.active_pool().ok_or(ChatError::NoProviderAvailable)?;
        metrics::counter!("chatgate_provider_calls_total", "pool" => pool.name()).increment(1);
        pool.pick().ok_or(ChatError::NoProviderAvailable)
    }
}

#[async_trait]
impl ChatProvider for ChatRouter {
    async fn complete(&self, req: Request) -> Result<Response, ChatError> {
        self.route()?.complete(req).await
    }

    async fn complete_stream(
        &self,
        req: Request,
        cancel: CancellationToken,
    ) -> Result<ResponseStream, ChatError> {
        self.route()?.complete_stream(req, cancel).await
    }

    fn max_context_length(&self, model: &str) -> i64 {
        self.active_pool()
            .and_then(ClientPool::pick)
            .map(|client| client.max_context_length(model))
            .unwrap_or_else(|| model_max_context_size(model))
    }
}
