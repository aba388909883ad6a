#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

use swarmwatch::common::config::SwarmConfig;

pub const HEARTBEAT: Duration = Duration::from_millis(150);

/// Short timings so a full New -> Alive -> Dead -> pruned cycle fits in a
/// couple of seconds of test time.
pub fn test_config(entry_ip: &str, entry_port: u16) -> SwarmConfig {
    serde_json::from_value(json!({
        "entry_ip": entry_ip,
        "entry_port": entry_port,
        "target_connections": 16,
        "sweep_interval_ms": 50,
        "entry_retry_ms": 200,
        "grace_period_ms": 200,
        "silence_timeout_ms": 1000,
        "removal_linger_ms": 300,
        "poll_interval_ms": 50,
        "coalesce_window_ms": 25
    }))
    .expect("test config")
}

pub async fn wait_for<F>(what: &str, timeout: Duration, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

fn envelope(cmd: &str, data: Value) -> String {
    json!({"cmd": cmd, "data": data}).to_string()
}

/// A stand-in swarm node: accepts connections, pushes its node list on
/// connect, heartbeats its own info, honors `requestAllNodes`, and can go
/// silent, come back, or announce its own departure.
pub struct TestNode {
    pub ip: String,
    pub port: u16,
    pub address: String,
    peers: Vec<Value>,
    alive: Arc<AtomicBool>,
    push_tx: broadcast::Sender<String>,
    token: CancellationToken,
}

impl TestNode {
    pub async fn start(peers: &[&TestNode]) -> TestNode {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        TestNode::from_listener(listener, peers).await
    }

    pub async fn start_on(port: u16, peers: &[&TestNode]) -> TestNode {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.expect("bind");
        TestNode::from_listener(listener, peers).await
    }

    async fn from_listener(listener: TcpListener, peers: &[&TestNode]) -> TestNode {
        let port = listener.local_addr().expect("local addr").port();
        let node = TestNode {
            ip: "127.0.0.1".to_string(),
            port,
            address: format!("127.0.0.1:{port}"),
            peers: peers.iter().map(|peer| peer.info()).collect(),
            alive: Arc::new(AtomicBool::new(true)),
            push_tx: broadcast::channel(16).0,
            token: CancellationToken::new(),
        };

        let me = node.info();
        let peers = node.peers.clone();
        let alive = node.alive.clone();
        let push_tx = node.push_tx.clone();
        let token = node.token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { break };
                        tokio::spawn(serve_connection(
                            stream,
                            me.clone(),
                            peers.clone(),
                            alive.clone(),
                            push_tx.subscribe(),
                            token.child_token(),
                        ));
                    }
                }
            }
        });
        node
    }

    pub fn info(&self) -> Value {
        json!({
            "address": self.address,
            "ip": self.ip,
            "port": self.port,
            "used": 42.0,
            "available": 100.0,
            "isLeader": false
        })
    }

    /// Stop producing traffic while keeping accepted sockets open.
    pub fn die(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn revive(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    /// Announce departure, then close all sockets shortly after, the way a
    /// cleanly leaving node does.
    pub async fn shutdown(&self) {
        self.die();
        let _ = self
            .push_tx
            .send(envelope("removeNodes", json!([self.address])));
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.stop();
    }

    /// Hard stop: close the listener and every accepted socket.
    pub fn stop(&self) {
        self.token.cancel();
    }
}

async fn serve_connection(
    stream: TcpStream,
    me: Value,
    peers: Vec<Value>,
    alive: Arc<AtomicBool>,
    mut push_rx: broadcast::Receiver<String>,
    token: CancellationToken,
) {
    let mut framed = Framed::new(stream, LinesCodec::new());

    let mut all = vec![me.clone()];
    all.extend(peers);
    if alive.load(Ordering::SeqCst)
        && framed
            .send(envelope("updateNodes", Value::Array(all.clone())))
            .await
            .is_err()
    {
        return;
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = heartbeat.tick() => {
                if alive.load(Ordering::SeqCst)
                    && framed.send(envelope("updateNodes", json!([me.clone()]))).await.is_err()
                {
                    break;
                }
            }
            pushed = push_rx.recv() => match pushed {
                Ok(frame) => {
                    if framed.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            inbound = framed.next() => match inbound {
                Some(Ok(line)) => {
                    let value: Value = serde_json::from_str(&line).unwrap_or(Value::Null);
                    if value["cmd"] == "requestAllNodes"
                        && alive.load(Ordering::SeqCst)
                        && framed
                            .send(envelope("updateNodes", Value::Array(all.clone())))
                            .await
                            .is_err()
                    {
                        break;
                    }
                }
                _ => break,
            }
        }
    }
}
