mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossfire::mpsc;
use value_rpc::codec::{MsgReader, MsgWriter};
use value_rpc::proto::{self, MessageType};
use value_rpc::typedef::{self, STRING};
use value_rpc::{ClientConfig, RpcClient, RpcIntErr, RpcServer, ServerConfig, TypeDef, Value};

use common::TestRig;

async fn start_server() -> Arc<RpcServer> {
    let server = Arc::new(
        RpcServer::bind("127.0.0.1:0", ServerConfig::default()).await.expect("server bind"),
    );
    let runner = server.clone();
    tokio::spawn(async move { runner.run().await });
    server
}

/// A cancel that arrives before its request must poison that rid: the
/// request is refused and the handler never runs.
#[test]
fn test_cancel_before_start() {
    let rig = TestRig::new();
    rig.block_on(async {
        let server = start_server().await;
        let called = Arc::new(AtomicBool::new(false));
        {
            let called = called.clone();
            server
                .add_function(
                    "setName",
                    typedef::list([STRING, STRING]),
                    TypeDef::Void,
                    move |_args| {
                        called.store(true, Ordering::SeqCst);
                        async move { Ok(None) }
                    },
                )
                .expect("register");
        }
        let addr = server.local_addr().expect("addr").to_string();

        // drive the wire directly
        let stream = tokio::net::TcpStream::connect(&addr).await.expect("dial");
        let (rd, wr) = stream.into_split();
        let mut reader = MsgReader::new(rd);
        let writer = MsgWriter::new(wr, Duration::from_secs(5));

        writer.send(&proto::handshake_request(7)).await.expect("handshake");
        let resp = reader.read_msg().await.expect("handshake response");
        assert_eq!(proto::msg_type(&resp), Some(MessageType::HandshakeResponse));
        assert!(proto::valid_magic_and_version(&resp));

        writer.send(&proto::cancel_request(42)).await.expect("cancel");
        let args = Value::Array(vec![Value::from("Alex"), Value::from("Shu")]);
        writer
            .send(&proto::function_request(42, "setName", Some(args), 1000))
            .await
            .expect("request");

        let resp = reader.read_msg().await.expect("response");
        assert_eq!(proto::msg_type(&resp), Some(MessageType::ErrorResponse));
        assert_eq!(proto::request_id(&resp), Some(42));
        let err = proto::get_str(&resp, proto::FIELD_ERROR).expect("error text");
        assert!(err.contains("cancel"), "err: {}", err);
        assert!(!called.load(Ordering::SeqCst));

        server.close();
    });
}

/// A slow handler runs into the client timeout; afterwards the connection
/// is still usable.
#[test]
fn test_timeout_on_slow_handler() {
    let rig = TestRig::new();
    rig.block_on(async {
        let server = start_server().await;
        server
            .add_function("slow", TypeDef::Any, TypeDef::Any, |_args| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(Some(Value::from("late")))
            })
            .expect("register");
        let addr = server.local_addr().expect("addr").to_string();
        let client = RpcClient::new(ClientConfig::new(&addr));
        client.connect().await.expect("connect");

        client.set_timeout(50);
        let err = client.call_function("slow", None).await.unwrap_err();
        assert_eq!(err, RpcIntErr::Timeout);

        client.set_timeout(1000);
        let res = client.call_function("slow", None).await.expect("second call");
        assert_eq!(res.as_str(), Some("late"));

        client.close().await;
        server.close();
    });
}

/// The timeout path must put a CancelRequest for the same rid on the
/// wire. Observed with a raw framed server that never answers.
#[test]
fn test_timeout_emits_cancel_frame() {
    let rig = TestRig::new();
    rig.block_on(async {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let (saw_tx, saw_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (rd, wr) = stream.into_split();
            let mut reader = MsgReader::new(rd);
            let writer = MsgWriter::new(wr, Duration::from_secs(5));

            let hs = reader.read_msg().await.expect("handshake");
            assert_eq!(proto::msg_type(&hs), Some(MessageType::HandshakeRequest));
            writer.send(&proto::handshake_response()).await.expect("handshake response");

            let req = reader.read_msg().await.expect("request");
            assert_eq!(proto::msg_type(&req), Some(MessageType::FunctionRequest));
            let req_rid = proto::request_id(&req).expect("rid");

            // no response on purpose, the next frame must be the cancel
            let cancel = reader.read_msg().await.expect("cancel frame");
            let _ = saw_tx.send((
                proto::msg_type(&cancel),
                proto::request_id(&cancel),
                req_rid,
            ));
        });

        let client = RpcClient::new(ClientConfig::new(&addr));
        client.connect().await.expect("connect");
        client.set_timeout(50);
        let err = client.call_function("slow", None).await.unwrap_err();
        assert_eq!(err, RpcIntErr::Timeout);

        let (t, cancel_rid, req_rid) = saw_rx.await.expect("fake server");
        assert_eq!(t, Some(MessageType::CancelRequest));
        assert_eq!(cancel_rid, Some(req_rid));

        client.close().await;
    });
}

/// Throttle frames addressed to a stream are accepted mid-flight and the
/// stream still delivers everything in order.
#[test]
fn test_stream_throttle() {
    let rig = TestRig::new();
    rig.block_on(async {
        let server = start_server().await;
        server
            .add_outgoing_stream("count", TypeDef::Void, |_args| async {
                let (tx, rx) = mpsc::bounded_async(1);
                tokio::spawn(async move {
                    for i in 0..5i64 {
                        if tx.send(Value::from(i)).await.is_err() {
                            break;
                        }
                    }
                });
                Ok(rx)
            })
            .expect("register");
        let addr = server.local_addr().expect("addr").to_string();
        let client = RpcClient::new(ClientConfig::new(&addr));
        client.connect().await.expect("connect");

        let (rx, rid) = client.get_stream("count", None, 1).await.expect("get stream");
        client.throttle_increase(rid).await.expect("throttle up");
        let mut got = Vec::new();
        while let Ok(v) = rx.recv().await {
            got.push(v.as_i64().expect("number"));
            if got.len() == 2 {
                client.throttle_decrease(rid).await.expect("throttle down");
            }
        }
        assert_eq!(got, vec![0, 1, 2, 3, 4]);

        client.close().await;
        server.close();
    });
}

/// Reconnect keeps the client id; outstanding state does not leak across
/// connections.
#[test]
fn test_reconnect_same_identity() {
    let rig = TestRig::new();
    rig.block_on(async {
        let server = start_server().await;
        server
            .add_function("ping", TypeDef::Void, STRING.into(), |_args| async {
                Ok(Some(Value::from("pong")))
            })
            .expect("register");
        let addr = server.local_addr().expect("addr").to_string();
        let mut config = ClientConfig::new(&addr);
        config.client_id = 99;
        let client = RpcClient::new(config);
        client.connect().await.expect("connect");
        assert_eq!(client.client_id(), 99);

        let res = client.call_function("ping", None).await.expect("first call");
        assert_eq!(res.as_str(), Some("pong"));

        client.reconnect().await.expect("reconnect");
        let res = client.call_function("ping", None).await.expect("call after reconnect");
        assert_eq!(res.as_str(), Some("pong"));
        assert_eq!(client.stats().get("requests"), Some(&0));

        client.close().await;
        server.close();
    });
}
