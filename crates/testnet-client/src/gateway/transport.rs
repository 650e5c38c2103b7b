//! Engine transports.
//!
//! A transport performs exactly one request/reply exchange per call over a
//! connection it opens for that call and releases before returning, on
//! every exit path.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;

use testnet_common::protocol::{Envelope, RpcErrorPayload, ERROR_TYPE, RESULT_TYPE};

use crate::config::EngineConfig;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not connect to engine at {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("connection to engine lost: {0}")]
    Disconnected(String),
    #[error("engine did not reply within {0:?}")]
    Timeout(Duration),
    #[error("malformed engine reply: {0}")]
    Malformed(String),
}

impl TransportError {
    /// Availability failures are worth retrying; a malformed reply means
    /// the engine is up but speaking something we don't understand.
    pub fn is_transient(&self) -> bool {
        !matches!(self, TransportError::Malformed(_))
    }
}

/// Outcome of an exchange the engine actually answered.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcReply {
    Result(serde_json::Value),
    Rejected(String),
}

pub trait EngineTransport: Send + Sync + 'static {
    /// Send `params` to `method` and wait for the engine's reply.
    fn call<'a>(
        &'a self,
        method: &'a str,
        params: &'a serde_json::Value,
    ) -> BoxFuture<'a, Result<RpcReply, TransportError>>;
}

/// JSON envelopes over a WebSocket, one connection per call.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
    attempt_timeout: Duration,
}

impl WsTransport {
    pub fn new(url: impl Into<String>, attempt_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            attempt_timeout,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.url(), config.attempt_timeout)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn exchange(&self, request: Envelope) -> Result<RpcReply, TransportError> {
        let (ws, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;
        let (mut ws_tx, mut ws_rx) = ws.split();

        let json = serde_json::to_string(&request)
            .map_err(|e| TransportError::Malformed(format!("unencodable request: {e}")))?;
        ws_tx
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| TransportError::Disconnected(e.to_string()))?;

        let reply = loop {
            match ws_rx.next().await {
                Some(Ok(Message::Text(text))) => {
                    let envelope: Envelope = serde_json::from_str(&text)
                        .map_err(|e| TransportError::Malformed(e.to_string()))?;
                    if envelope.id != request.id {
                        tracing::trace!(
                            expected = %request.id,
                            got = %envelope.id,
                            "ignoring reply to another request"
                        );
                        continue;
                    }
                    break envelope;
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(TransportError::Disconnected(
                        "engine closed the connection before replying".into(),
                    ));
                }
                Some(Err(e)) => return Err(TransportError::Disconnected(e.to_string())),
                _ => {} // Ping/Pong handled by tungstenite
            }
        };

        // The reply is in hand; a failed close only affects the socket we
        // are about to drop anyway.
        let _ = ws_tx.send(Message::Close(None)).await;

        decode_reply(reply)
    }
}

impl EngineTransport for WsTransport {
    fn call<'a>(
        &'a self,
        method: &'a str,
        params: &'a serde_json::Value,
    ) -> BoxFuture<'a, Result<RpcReply, TransportError>> {
        Box::pin(async move {
            let request = Envelope::request(method, params.clone());
            match tokio::time::timeout(self.attempt_timeout, self.exchange(request)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(self.attempt_timeout)),
            }
        })
    }
}

fn decode_reply(reply: Envelope) -> Result<RpcReply, TransportError> {
    match reply.msg_type.as_str() {
        RESULT_TYPE => Ok(RpcReply::Result(reply.payload)),
        ERROR_TYPE => {
            let err: RpcErrorPayload = reply
                .parse_payload()
                .map_err(|e| TransportError::Malformed(format!("bad error payload: {e}")))?;
            Ok(RpcReply::Rejected(err.message))
        }
        other => Err(TransportError::Malformed(format!(
            "unexpected reply type '{other}'"
        ))),
    }
}
