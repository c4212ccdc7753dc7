use async_trait::async_trait;
use callwire_core::{CallId, Credentials, Fault, FaultCode, Headers, Message, Outcome, ServerId, AUTHORIZATION};
use callwire_server::{BasicAuthenticator, PoolConfig, RpcTarget, Server, ServerConfig, WorkerPool};
use callwire_transport::FrameCodec;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::codec::Framed;

struct TestCalculator;

#[async_trait]
impl RpcTarget for TestCalculator {
    async fn call(&self, method: &str, args: Vec<Value>, headers: &Headers) -> Result<Value, Fault> {
        match method {
            "add" => {
                let a = args.first().and_then(Value::as_f64).unwrap_or(0.0);
                let b = args.get(1).and_then(Value::as_f64).unwrap_or(0.0);
                Ok(json!(a + b))
            }
            "trace" => Ok(headers.get("trace").cloned().unwrap_or(Value::Null)),
            _ => Err(Fault::not_found(format!("no method {method}"))),
        }
    }
}

/// Calls `disconnect_sockets` from inside a worker.
struct SelfDisconnect {
    target: OnceLock<(Weak<WorkerPool>, ServerId)>,
}

#[async_trait]
impl RpcTarget for SelfDisconnect {
    async fn call(&self, _method: &str, _args: Vec<Value>, _headers: &Headers) -> Result<Value, Fault> {
        let Some((pool, server)) = self.target.get() else {
            return Err(Fault::internal("not wired"));
        };
        let Some(pool) = pool.upgrade() else {
            return Err(Fault::internal("pool gone"));
        };
        match pool.disconnect_sockets(*server).await {
            Ok(()) => Ok(json!("disconnected")),
            Err(e) => Err(Fault::internal(e.to_string())),
        }
    }
}

struct Running {
    server: Server,
    addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl Running {
    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task.await.unwrap().unwrap();
    }
}

async fn start(server: Server) -> Running {
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn({
        let server = server.clone();
        async move {
            server
                .serve(listener, async {
                    let _ = stopped.await;
                })
                .await
        }
    });
    Running {
        server,
        addr,
        stop: Some(stop),
        task,
    }
}

fn config() -> ServerConfig {
    ServerConfig::default()
        .with_port(0)
        .with_max_workers(2)
        .with_drain_timeout(Duration::from_millis(500))
}

async fn connect(addr: SocketAddr) -> Framed<TcpStream, FrameCodec> {
    let stream = TcpStream::connect(addr).await.unwrap();
    Framed::new(stream, FrameCodec::new())
}

async fn round_trip(framed: &mut Framed<TcpStream, FrameCodec>, request: Message) -> Message {
    framed.send(request).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), framed.next())
        .await
        .expect("reply in time")
        .expect("connection open")
        .expect("valid frame")
}

#[tokio::test]
async fn test_keep_alive_connection_serves_many_requests() {
    let running = start(Server::new(config(), Arc::new(TestCalculator))).await;
    let mut framed = connect(running.addr).await;

    let reply = round_trip(
        &mut framed,
        Message::request(CallId::new(1), "add", vec![json!(5), json!(3)], Headers::new()),
    )
    .await;
    assert_eq!(reply, Message::success(CallId::new(1), json!(8.0)));

    let mut headers = Headers::new();
    headers.insert("Trace", "t-42");
    let reply = round_trip(
        &mut framed,
        Message::request(CallId::new(2), "trace", vec![], headers),
    )
    .await;
    assert_eq!(reply, Message::success(CallId::new(2), json!("t-42")));

    let reply = round_trip(
        &mut framed,
        Message::request(CallId::new(3), "missing", vec![], Headers::new()),
    )
    .await;
    match reply {
        Message::Response {
            id,
            outcome: Outcome::Fault { fault },
            ..
        } => {
            assert_eq!(id, CallId::new(3));
            assert_eq!(fault.code, FaultCode::NotFound);
        }
        other => panic!("expected fault, got {other:?}"),
    }

    assert_eq!(running.server.num_connected_sockets(), 1);
    assert_eq!(running.server.total_connection_count(), 1);
    running.stop().await;
}

#[tokio::test]
async fn test_authentication_challenge() {
    let server = Server::new(config(), Arc::new(TestCalculator));
    server.set_authenticator(Some(Arc::new(BasicAuthenticator::new(
        "calc",
        Credentials::new("alice", "secret"),
    ))));
    let running = start(server).await;
    let mut framed = connect(running.addr).await;

    let reply = round_trip(
        &mut framed,
        Message::request(CallId::new(1), "add", vec![json!(1), json!(2)], Headers::new()),
    )
    .await;
    assert_eq!(
        reply,
        Message::AuthChallenge {
            id: CallId::new(1),
            realm: "calc".to_string(),
        }
    );

    let mut headers = Headers::new();
    headers.insert(AUTHORIZATION, Credentials::new("alice", "secret").to_header_value());
    let reply = round_trip(
        &mut framed,
        Message::request(CallId::new(2), "add", vec![json!(1), json!(2)], headers),
    )
    .await;
    assert_eq!(reply, Message::success(CallId::new(2), json!(3.0)));
    running.stop().await;
}

#[tokio::test]
async fn test_max_connections_rejects_extra_connection() {
    let running = start(Server::new(
        config().with_max_connections(1),
        Arc::new(TestCalculator),
    ))
    .await;

    let mut first = connect(running.addr).await;
    let reply = round_trip(
        &mut first,
        Message::request(CallId::new(1), "add", vec![json!(1), json!(1)], Headers::new()),
    )
    .await;
    assert_eq!(reply, Message::success(CallId::new(1), json!(2.0)));

    let mut second = connect(running.addr).await;
    let closed = tokio::time::timeout(Duration::from_secs(5), second.next())
        .await
        .expect("server should close the connection");
    assert!(closed.is_none() || matches!(closed, Some(Err(_))));
    assert_eq!(running.server.total_connection_count(), 1);
    running.stop().await;
}

#[tokio::test]
async fn test_disconnect_from_worker_context_is_refused() {
    let target = Arc::new(SelfDisconnect {
        target: OnceLock::new(),
    });
    let pool = Arc::new(WorkerPool::new(PoolConfig::default().with_max_workers(1)));
    let server = Server::with_pool(config(), target.clone(), Arc::clone(&pool));
    let _ = target.target.set((Arc::downgrade(&pool), server.id()));

    let running = start(server).await;
    let mut framed = connect(running.addr).await;
    let reply = round_trip(
        &mut framed,
        Message::request(CallId::new(1), "disconnect", vec![], Headers::new()),
    )
    .await;
    match reply {
        Message::Response {
            outcome: Outcome::Fault { fault },
            ..
        } => assert!(fault.message.contains("worker")),
        other => panic!("expected fault, got {other:?}"),
    }
    running.stop().await;
}

#[tokio::test]
async fn test_disconnect_sockets_closes_served_connections() {
    let running = start(Server::new(config(), Arc::new(TestCalculator))).await;
    let mut framed = connect(running.addr).await;
    round_trip(
        &mut framed,
        Message::request(CallId::new(1), "add", vec![], Headers::new()),
    )
    .await;

    running.server.disconnect_sockets().await.unwrap();
    assert_eq!(running.server.num_connected_sockets(), 0);

    let next = tokio::time::timeout(Duration::from_secs(5), framed.next())
        .await
        .expect("connection should be closed");
    assert!(next.is_none() || matches!(next, Some(Err(_))));
    running.stop().await;
}
