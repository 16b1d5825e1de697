//! WebSocket connector backed by tokio-tungstenite

use crate::transport::traits::{Connector, WsStream};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::Error as WsError;

/// Plain `connect_async` connector
#[derive(Debug, Default, Clone)]
pub struct TungsteniteConnector;

impl TungsteniteConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, request: Request) -> Result<WsStream> {
        match tokio_tungstenite::connect_async(request).await {
            Ok((stream, _response)) => Ok(stream),
            Err(WsError::Http(response)) => {
                let status = response.status();
                let message = match status.as_u16() {
                    401 => "Unauthorized: broker rejected the credentials".to_string(),
                    403 => "Forbidden: broker denied access".to_string(),
                    code => format!("WebSocket HTTP error: {}", code),
                };
                Err(anyhow!(message))
            }
            Err(e) => Err(anyhow!("WebSocket connect failed: {}", e)),
        }
    }

    fn name(&self) -> &'static str {
        "tungstenite"
    }
}
