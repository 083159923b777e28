//! Connection settings for a Jupyter server.

use std::time::Duration;

/// Default Jupyter server address.
pub const DEFAULT_HOST: &str = "127.0.0.1:8888";

/// Default kernelspec requested when creating kernels.
pub const DEFAULT_KERNEL_NAME: &str = "python3";

/// Where and how to reach the Jupyter server.
///
/// Built once at startup and handed to [`KernelsApi`](crate::KernelsApi);
/// nothing in this crate reads process-wide settings.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// `host:port` of the Jupyter server.
    pub host: String,
    /// Sent as `Authorization: token <token>` when set.
    pub token: Option<String>,
    /// Kernelspec name passed to `POST /api/kernels`.
    pub kernel_name: String,
    /// Use `https`/`wss` instead of `http`/`ws`.
    pub secure: bool,
    /// Give up waiting for an idle status after this long. `None` waits forever.
    pub execute_timeout: Option<Duration>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            token: None,
            kernel_name: DEFAULT_KERNEL_NAME.to_string(),
            secure: false,
            execute_timeout: None,
        }
    }
}

impl KernelConfig {
    /// Create a config for the given host with everything else defaulted.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.token = if token.is_empty() { None } else { Some(token) };
        self
    }

    pub fn with_execute_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.execute_timeout = timeout;
        self
    }

    /// Base URL for REST calls, e.g. `http://127.0.0.1:8888`.
    pub fn http_base(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}", scheme, self.host.trim_end_matches('/'))
    }

    /// Base URL for channel connections, e.g. `ws://127.0.0.1:8888`.
    pub fn ws_base(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}", scheme, self.host.trim_end_matches('/'))
    }

    /// Value for the `Authorization` header, if a token is configured.
    pub fn authorization(&self) -> Option<String> {
        self.token.as_ref().map(|token| format!("token {}", token))
    }
}
