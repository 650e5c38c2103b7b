//! Gateway against a real WebSocket engine listening on localhost.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use testnet_client::gateway::{Gateway, GatewayError, RetryPolicy, WsTransport};
use testnet_client::ServiceId;
use testnet_common::protocol::{
    methods, Envelope, ExecCommandArgs, RemoveServiceArgs, ERROR_TYPE, RESULT_TYPE,
};

/// Accepts connections forever, answering one request per connection.
async fn spawn_engine() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));

    let counter = connections.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                let Some(Ok(Message::Text(text))) = ws.next().await else {
                    return;
                };
                let request: Envelope = serde_json::from_str(&text).unwrap();

                // a stray reply for some other request comes first
                let stray = Envelope::reply("req_other", RESULT_TYPE, serde_json::json!({}));
                let stray = serde_json::to_string(&stray).unwrap();
                ws.send(Message::Text(stray.into())).await.unwrap();

                let reply = match request.msg_type.as_str() {
                    methods::EXEC_COMMAND => {
                        let args: ExecCommandArgs = request.parse_payload().unwrap();
                        let code = if args.command_args == ["false"] { 1 } else { 7 };
                        Envelope::reply(request.id, RESULT_TYPE, serde_json::json!({ "exit_code": code }))
                    }
                    other => Envelope::reply(
                        request.id,
                        ERROR_TYPE,
                        serde_json::json!({ "message": format!("method '{other}' not supported") }),
                    ),
                };
                let reply = serde_json::to_string(&reply).unwrap();
                ws.send(Message::Text(reply.into())).await.unwrap();

                // drain until the client closes
                while let Some(Ok(msg)) = ws.next().await {
                    if msg.is_close() {
                        break;
                    }
                }
            });
        }
    });

    (format!("ws://{addr}/engine/ws"), connections)
}

fn gateway(url: &str) -> Gateway {
    let policy = RetryPolicy::constant(Duration::from_millis(20), Duration::from_millis(200));
    Gateway::new(
        Arc::new(WsTransport::new(url, Duration::from_secs(2))),
        policy,
        policy,
    )
}

#[tokio::test]
async fn exec_command_over_websocket() {
    let (url, connections) = spawn_engine().await;
    let gw = gateway(&url);

    let code = gw
        .exec_command(&ExecCommandArgs {
            service_id: ServiceId::from("datastore"),
            command_args: vec!["true".into()],
        })
        .await
        .unwrap();
    assert_eq!(code, 7);

    let code = gw
        .exec_command(&ExecCommandArgs {
            service_id: ServiceId::from("datastore"),
            command_args: vec!["false".into()],
        })
        .await
        .unwrap();
    assert_eq!(code, 1);

    // one connection per call
    assert_eq!(connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn engine_error_reply_is_a_rejection() {
    let (url, connections) = spawn_engine().await;
    let gw = gateway(&url);

    let err = gw
        .remove_service(&RemoveServiceArgs {
            service_id: ServiceId::from("datastore"),
            container_stop_timeout_seconds: 0,
        })
        .await
        .unwrap_err();
    match err {
        GatewayError::Rejected { method, message } => {
            assert_eq!(method, methods::REMOVE_SERVICE);
            assert_eq!(message, "method 'service.remove' not supported");
        }
        other => panic!("expected Rejected, got {other:?}"),
    }
    assert_eq!(connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unreachable_engine_is_unavailable() {
    // grab a free port, then close it again
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let gw = gateway(&format!("ws://{addr}/engine/ws"));

    let err = gw
        .exec_command(&ExecCommandArgs {
            service_id: ServiceId::from("datastore"),
            command_args: vec!["true".into()],
        })
        .await
        .unwrap_err();
    assert!(err.is_unavailable(), "{err:?}");
    if let GatewayError::Unavailable { attempts, .. } = err {
        assert!(attempts > 1);
    }
}
