use std::{fmt, time::Duration};

use clap::Parser;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_TIMEOUT_MS: u64 = 100_000;
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Label reported to the browser for the upstream API flavour.
pub const API_MODEL: &str = "ChatGPTAPI";

/// A configured credential. `Debug` never prints the value.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Parser)]
#[command(name = "chat-relay", version, about = "Streaming chat relay for OpenAI compatible APIs")]
pub struct Args {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 3002)]
    pub port: u16,

    /// Shared secret required on protected routes; empty disables auth
    #[arg(long, env = "AUTH_SECRET_KEY", default_value = "", hide_env_values = true)]
    pub auth_secret_key: String,

    /// Requests allowed per client per hour on /chat-process; 0 disables the limit
    #[arg(long, env = "MAX_REQUEST_PER_HOUR", default_value_t = 0)]
    pub max_request_per_hour: u32,

    /// Number of trusted reverse proxy hops in front of the relay
    #[arg(long, env = "TRUST_PROXY", default_value_t = 1)]
    pub trust_proxy: usize,

    #[arg(long, env = "OPENAI_API_KEY", default_value = "", hide_env_values = true)]
    pub openai_api_key: String,

    #[arg(long, env = "OPENAI_API_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub openai_api_base_url: String,

    #[arg(long, env = "OPENAI_API_MODEL", default_value = DEFAULT_MODEL)]
    pub openai_api_model: String,

    #[arg(long, env = "TIMEOUT_MS", default_value_t = DEFAULT_TIMEOUT_MS)]
    pub timeout_ms: u64,

    #[arg(long, env = "HTTPS_PROXY")]
    pub https_proxy: Option<String>,

    #[arg(long, env = "SOCKS_PROXY_HOST")]
    pub socks_proxy_host: Option<String>,

    #[arg(long, env = "SOCKS_PROXY_PORT")]
    pub socks_proxy_port: Option<u16>,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: log::LevelFilter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksProxy {
    pub host: String,
    pub port: u16,
}

impl SocksProxy {
    pub fn url(&self) -> String {
        format!("socks5h://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub api_key: Secret,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
    pub https_proxy: Option<String>,
    pub socks_proxy: Option<SocksProxy>,
}

impl UpstreamConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        UpstreamConfig {
            api_key: Secret::new(api_key),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            https_proxy: None,
            socks_proxy: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn is_default_base_url(&self) -> bool {
        self.base_url == DEFAULT_BASE_URL
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub auth_secret_key: Option<Secret>,
    pub max_request_per_hour: u32,
    pub rate_limit_window: Duration,
    pub trust_proxy: usize,
    pub upstream: UpstreamConfig,
    pub log_level: log::LevelFilter,
}

impl RelayConfig {
    pub fn new(upstream: UpstreamConfig) -> Self {
        RelayConfig {
            host: "0.0.0.0".to_string(),
            port: 3002,
            auth_secret_key: None,
            max_request_per_hour: 0,
            rate_limit_window: RATE_LIMIT_WINDOW,
            trust_proxy: 1,
            upstream,
            log_level: log::LevelFilter::Info,
        }
    }

    pub fn with_auth_secret_key(mut self, key: impl Into<String>) -> Self {
        let key = Secret::new(key);
        self.auth_secret_key = (!key.is_empty()).then_some(key);
        self
    }

    pub fn with_rate_limit(mut self, max_requests: u32, window: Duration) -> Self {
        self.max_request_per_hour = max_requests;
        self.rate_limit_window = window;
        self
    }

    pub fn auth_enabled(&self) -> bool {
        self.auth_secret_key.is_some()
    }
}

impl TryFrom<Args> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(args: Args) -> anyhow::Result<Self> {
        if args.openai_api_key.trim().is_empty() {
            anyhow::bail!("Missing OPENAI_API_KEY");
        }
        if args.timeout_ms == 0 {
            anyhow::bail!("TIMEOUT_MS must be greater than zero");
        }
        let socks_proxy = match (args.socks_proxy_host, args.socks_proxy_port) {
            (Some(host), Some(port)) if !host.trim().is_empty() => Some(SocksProxy { host, port }),
            (None, None) => None,
            (Some(host), None) if host.trim().is_empty() => None,
            _ => anyhow::bail!("SOCKS_PROXY_HOST and SOCKS_PROXY_PORT must be set together"),
        };
        let https_proxy = args.https_proxy.filter(|p| !p.trim().is_empty());
        if https_proxy.is_some() && socks_proxy.is_some() {
            anyhow::bail!("Configure either HTTPS_PROXY or a SOCKS proxy, not both");
        }

        let mut upstream = UpstreamConfig::new(args.openai_api_key.trim())
            .with_base_url(args.openai_api_base_url.trim());
        upstream.model = args.openai_api_model;
        upstream.timeout = Duration::from_millis(args.timeout_ms);
        upstream.https_proxy = https_proxy;
        upstream.socks_proxy = socks_proxy;

        let mut config = RelayConfig::new(upstream)
            .with_auth_secret_key(args.auth_secret_key)
            .with_rate_limit(args.max_request_per_hour, RATE_LIMIT_WINDOW);
        config.host = args.host;
        config.port = args.port;
        config.trust_proxy = args.trust_proxy;
        config.log_level = args.log_level;
        Ok(config)
    }
}
