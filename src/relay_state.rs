use std::sync::Arc;

use crate::config::{API_MODEL, RelayConfig};
use crate::io_struct::{ConfigData, SessionData};
use crate::middleware::{AuthGuard, RateLimiter};
use crate::upstream::{ChatUpstream, OpenAiUpstream};

/// Everything a request handler needs, built once at startup and shared
/// through `web::Data`.
#[derive(Clone)]
pub struct RelayState {
    pub config: RelayConfig,
    pub auth: AuthGuard,
    pub limiter: Arc<RateLimiter>,
    pub upstream: Arc<dyn ChatUpstream>,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> anyhow::Result<Self> {
        let upstream = OpenAiUpstream::new(&config.upstream)?;
        Ok(Self::with_upstream(config, Arc::new(upstream)))
    }

    pub fn with_upstream(config: RelayConfig, upstream: Arc<dyn ChatUpstream>) -> Self {
        let auth = AuthGuard::new(config.auth_secret_key.clone());
        let limiter = Arc::new(RateLimiter::new(
            config.max_request_per_hour,
            config.rate_limit_window,
        ));
        RelayState {
            config,
            auth,
            limiter,
            upstream,
        }
    }

    pub fn session(&self) -> SessionData {
        SessionData {
            auth: self.auth.is_enabled(),
            model: self.upstream.model().to_string(),
        }
    }

    pub fn capabilities(&self) -> ConfigData {
        let upstream = &self.config.upstream;
        let reverse_proxy = if upstream.is_default_base_url() {
            "-".to_string()
        } else {
            upstream.base_url.clone()
        };
        ConfigData {
            api_model: API_MODEL.to_string(),
            model: self.upstream.model().to_string(),
            reverse_proxy,
            timeout_ms: upstream.timeout.as_millis() as u64,
            socks_proxy: upstream
                .socks_proxy
                .as_ref()
                .map(|p| format!("{}:{}", p.host, p.port))
                .unwrap_or_else(|| "-".to_string()),
            https_proxy: upstream
                .https_proxy
                .clone()
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

impl std::fmt::Debug for RelayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayState")
            .field("config", &self.config)
            .field("auth", &self.auth)
            .field("model", &self.upstream.model())
            .finish()
    }
}
