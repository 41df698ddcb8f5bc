use crate::error::ChatError;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default)]
    pub openai: ProviderConfig,
    #[serde(default)]
    pub fallback_openai: ProviderConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

impl GatewayConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ChatError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|err| ChatError::Config(format!("{}: {err}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|err| ChatError::Config(format!("{}: {err}", path.display())))
    }
}

/// One backend pool. Azure pools pair `servers[i]` with `keys[i]`; every other
/// pool uses each key against each server.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub azure: bool,
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub organization: String,
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub auto_proxy: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// `http://` or `https://` forward proxy. Takes precedence over `socks5`.
    #[serde(default)]
    pub url: Option<String>,
    /// `host:port` of a SOCKS5 proxy.
    #[serde(default)]
    pub socks5: Option<String>,
}

impl ProxyConfig {
    pub fn is_configured(&self) -> bool {
        self.url.as_deref().is_some_and(|v| !v.trim().is_empty())
            || self.socks5.as_deref().is_some_and(|v| !v.trim().is_empty())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ChatConfig {
    /// Most recent messages kept before token counting; `0` keeps all.
    #[serde(default)]
    pub max_context_messages: usize,
    #[serde(default = "default_max_input_tokens")]
    pub max_input_tokens: i64,
    /// Route short prompts for 16k/32k models to their smaller siblings.
    #[serde(default)]
    pub auto_select_model: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_context_messages: 0,
            max_input_tokens: default_max_input_tokens(),
            auto_select_model: false,
        }
    }
}

fn default_max_input_tokens() -> i64 {
    i64::MAX
}
