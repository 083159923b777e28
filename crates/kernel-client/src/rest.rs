//! REST and channel endpoints of a Jupyter server.
//!
//! - `POST   /api/kernels`               → `{"id": ...}`
//! - `DELETE /api/kernels/{id}`
//! - `GET    /api/kernels/{id}/channels`  (WebSocket upgrade)

use std::sync::Arc;

use log::{debug, info};
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::KernelConfig;
use crate::error::{KernelError, Result};

pub type ChannelsSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Deserialize)]
struct CreatedKernel {
    id: String,
}

/// Thin client for the kernel endpoints, shared by every session it creates.
#[derive(Clone)]
pub struct KernelsApi {
    http: reqwest::Client,
    config: Arc<KernelConfig>,
}

impl KernelsApi {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.config.authorization() {
            Some(value) => builder.header(AUTHORIZATION, value),
            None => builder,
        }
    }

    /// Start a kernel and return the id the server assigned to it.
    pub async fn create_kernel(&self) -> Result<String> {
        let url = format!("{}/api/kernels", self.config.http_base());
        let body = serde_json::json!({ "name": self.config.kernel_name });

        let response = self
            .authorize(self.http.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| KernelError::Connection(format!("POST {}: {}", url, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| KernelError::Connection(format!("POST {}: {}", url, e)))?;

        if !status.is_success() {
            return Err(KernelError::Connection(format!(
                "POST {} returned {}: {}",
                url, status, text
            )));
        }

        let created: CreatedKernel = serde_json::from_str(&text).map_err(|e| {
            KernelError::Connection(format!("unexpected kernel creation response: {}", e))
        })?;

        info!("[kernel] Created kernel {}", created.id);
        Ok(created.id)
    }

    /// Shut a kernel down on the server.
    pub async fn delete_kernel(&self, kernel_id: &str) -> Result<()> {
        let url = format!("{}/api/kernels/{}", self.config.http_base(), kernel_id);

        let response = self
            .authorize(self.http.delete(&url))
            .send()
            .await
            .map_err(|e| KernelError::Connection(format!("DELETE {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(KernelError::Connection(format!(
                "DELETE {} returned {}",
                url, status
            )));
        }

        debug!("[kernel] Deleted kernel {}", kernel_id);
        Ok(())
    }

    /// Open the multiplexed channels WebSocket for a kernel.
    pub async fn connect_channels(
        &self,
        kernel_id: &str,
        session_id: &str,
    ) -> Result<ChannelsSocket> {
        let url = format!(
            "{}/api/kernels/{}/channels?session_id={}",
            self.config.ws_base(),
            kernel_id,
            session_id
        );

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| KernelError::Protocol(format!("invalid channels url {}: {}", url, e)))?;

        if let Some(value) = self.config.authorization() {
            let value = HeaderValue::from_str(&value)
                .map_err(|e| KernelError::Protocol(format!("invalid token: {}", e)))?;
            request.headers_mut().insert(header::AUTHORIZATION, value);
        }

        match tokio_tungstenite::connect_async(request).await {
            Ok((socket, _response)) => Ok(socket),
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => Err(KernelError::Protocol(
                format!("channels handshake rejected with {}", response.status()),
            )),
            Err(e) => Err(KernelError::Connection(format!(
                "channels connection to {} failed: {}",
                url, e
            ))),
        }
    }
}
