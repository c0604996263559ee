//! WebSocket chain client speaking the Substrate JSON-RPC API.
//!
//! One background task owns the socket. Unlike a long-lived RPC transport
//! this client never reconnects by itself: when the socket drops, the
//! client reads as disconnected, every open subscription stream ends, and
//! the connection registry decides when to reconnect.
//!
//! Every connect starts a new session with its own subscription table, so a
//! session that is still shutting down can only end its own streams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use chainwatch_core::{ChainClient, ClientFactory, PhysicalSubscription, QueryCall, SubscriptionId, WatchError};

use crate::error::WsError;
use crate::rpc::{subscription_id, Incoming, JsonRpcRequest, JsonRpcResponse, RpcId};
use crate::subscriptions::{unique_keys, SubscriptionManager};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingMap = Arc<Mutex<HashMap<u64, Pending>>>;

/// Configuration for the WebSocket client.
#[derive(Debug, Clone)]
pub struct WsClientConfig {
    /// Give up on a connection attempt after this long.
    pub connect_timeout: Duration,
    /// Give up on a request after this long.
    pub request_timeout: Duration,
}

impl Default for WsClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// A request waiting for its response.
enum Pending {
    Call(oneshot::Sender<Result<JsonRpcResponse, WsError>>),
    /// `state_subscribeStorage`; registered with the manager as soon as the
    /// id arrives so no change set can slip past.
    Subscribe {
        slots: Vec<String>,
        tx: oneshot::Sender<Result<PhysicalSubscription, WsError>>,
    },
}

impl Pending {
    fn fail(self, error: WsError) {
        match self {
            Self::Call(tx) => {
                let _ = tx.send(Err(error));
            }
            Self::Subscribe { tx, .. } => {
                let _ = tx.send(Err(error));
            }
        }
    }
}

/// Command sent from callers to the background WS task.
enum WsCommand {
    Send { req: JsonRpcRequest, pending: Pending },
    Close,
}

struct Session {
    cmd_tx: mpsc::UnboundedSender<WsCommand>,
    alive: Arc<AtomicBool>,
    subscriptions: SubscriptionManager,
}

impl Session {
    /// Stop the session: its streams end now, the socket closes in the
    /// background.
    fn close(self) {
        self.alive.store(false, Ordering::Release);
        self.subscriptions.clear();
        let _ = self.cmd_tx.send(WsCommand::Close);
    }
}

/// WebSocket [`ChainClient`] for one chain.
pub struct WsChainClient {
    chain_id: String,
    config: WsClientConfig,
    session: Mutex<Option<Session>>,
    next_id: AtomicU64,
}

impl WsChainClient {
    pub fn new(chain_id: impl Into<String>, config: WsClientConfig) -> Self {
        Self {
            chain_id: chain_id.into(),
            config,
            session: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    fn sender(&self) -> Result<mpsc::UnboundedSender<WsCommand>, WsError> {
        match self.session.lock().unwrap().as_ref() {
            Some(s) if s.alive.load(Ordering::Acquire) => Ok(s.cmd_tx.clone()),
            _ => Err(WsError::NotConnected),
        }
    }

    async fn request<T>(
        &self,
        method: &str,
        params: Vec<Value>,
        pending: impl FnOnce(oneshot::Sender<Result<T, WsError>>) -> Pending,
    ) -> Result<T, WsError> {
        let cmd_tx = self.sender()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        cmd_tx
            .send(WsCommand::Send {
                req: JsonRpcRequest::new(id, method, params),
                pending: pending(tx),
            })
            .map_err(|_| WsError::WebSocket("WS task closed".into()))?;

        match time::timeout(self.config.request_timeout, rx).await {
            Err(_) => Err(WsError::Timeout {
                ms: self.config.request_timeout.as_millis() as u64,
            }),
            Ok(Err(_)) => Err(WsError::WebSocket("WS response dropped".into())),
            Ok(Ok(result)) => result,
        }
    }
}

#[async_trait]
impl ChainClient for WsChainClient {
    async fn connect(&self, endpoint: &str) -> Result<(), WatchError> {
        if self.is_connected() {
            return Ok(());
        }
        tracing::info!(chain_id = %self.chain_id, url = %endpoint, "connecting via WebSocket");

        let socket = match time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(endpoint),
        )
        .await
        {
            Err(_) => {
                return Err(WsError::Timeout {
                    ms: self.config.connect_timeout.as_millis() as u64,
                }
                .into())
            }
            Ok(Err(e)) => return Err(WsError::WebSocket(e.to_string()).into()),
            Ok(Ok((socket, _))) => socket,
        };

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        let subscriptions = SubscriptionManager::new();
        tokio::spawn(ws_task(
            self.chain_id.clone(),
            socket,
            cmd_rx,
            subscriptions.clone(),
            Arc::clone(&alive),
        ));

        let previous = self.session.lock().unwrap().replace(Session {
            cmd_tx,
            alive,
            subscriptions,
        });
        if let Some(previous) = previous {
            previous.close();
        }
        Ok(())
    }

    async fn disconnect(&self) {
        let session = self.session.lock().unwrap().take();
        if let Some(session) = session {
            session.close();
        }
    }

    fn is_connected(&self) -> bool {
        self.session
            .lock()
            .unwrap()
            .as_ref()
            .map_or(false, |s| s.alive.load(Ordering::Acquire))
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, WatchError> {
        let resp = self.request(method, params, Pending::Call).await?;
        Ok(resp.into_result().map_err(WsError::Rpc)?)
    }

    async fn subscribe(&self, calls: Vec<QueryCall>) -> Result<PhysicalSubscription, WatchError> {
        let slots: Vec<String> = calls.into_iter().map(|c| c.key).collect();
        let keys = unique_keys(&slots);
        let slot_count = slots.len();

        let sub = self
            .request("state_subscribeStorage", vec![json!(keys)], |tx| Pending::Subscribe {
                slots,
                tx,
            })
            .await?;
        tracing::debug!(
            chain_id = %self.chain_id,
            subscription = %sub.id,
            slots = slot_count,
            keys = keys.len(),
            "storage subscription opened"
        );
        Ok(sub)
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), WatchError> {
        if let Some(session) = self.session.lock().unwrap().as_ref() {
            session.subscriptions.remove(id);
        }
        self.request("state_unsubscribeStorage", vec![json!(id.0)], Pending::Call)
            .await?
            .into_result()
            .map_err(WsError::Rpc)?;
        Ok(())
    }
}

/// Hands out a [`WsChainClient`] per chain.
#[derive(Debug, Clone, Default)]
pub struct WsClientFactory {
    config: WsClientConfig,
}

impl WsClientFactory {
    pub fn new(config: WsClientConfig) -> Self {
        Self { config }
    }
}

impl ClientFactory for WsClientFactory {
    fn create(&self, chain_id: &str) -> Arc<dyn ChainClient> {
        Arc::new(WsChainClient::new(chain_id, self.config.clone()))
    }
}

/// Background task that owns the WebSocket connection until it closes.
async fn ws_task(
    chain_id: String,
    socket: Socket,
    mut cmd_rx: mpsc::UnboundedReceiver<WsCommand>,
    subscriptions: SubscriptionManager,
    alive: Arc<AtomicBool>,
) {
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    None | Some(WsCommand::Close) => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    Some(WsCommand::Send { req, pending: waiting }) => {
                        let msg = match serde_json::to_string(&req) {
                            Ok(msg) => msg,
                            Err(e) => {
                                waiting.fail(e.into());
                                continue;
                            }
                        };
                        let id = match &req.id { RpcId::Number(n) => *n, _ => 0 };
                        pending.lock().unwrap().insert(id, waiting);
                        if sink.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            msg = stream.next() => {
                match msg {
                    None => break,
                    Some(Err(e)) => {
                        tracing::warn!(chain_id = %chain_id, error = %e, "WS receive error");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        handle_message(text.as_str(), &pending, &subscriptions);
                    }
                    Some(Ok(Message::Close(_))) => break,
                    _ => {}
                }
            }
        }
    }

    alive.store(false, Ordering::Release);
    subscriptions.clear();
    let waiting: Vec<_> = pending.lock().unwrap().drain().map(|(_, p)| p).collect();
    for p in waiting {
        p.fail(WsError::WebSocket("connection closed".into()));
    }
    tracing::warn!(chain_id = %chain_id, "WS disconnected");
}

fn handle_message(text: &str, pending: &PendingMap, subscriptions: &SubscriptionManager) {
    let resp = match Incoming::parse(text) {
        Ok(Incoming::Response(resp)) => resp,
        Ok(Incoming::StorageChange {
            subscription,
            changes,
        }) => {
            subscriptions.dispatch(&SubscriptionId(subscription), changes);
            return;
        }
        Ok(Incoming::Ignored) => return,
        Err(e) => {
            tracing::debug!(error = %e, "unreadable WS frame");
            return;
        }
    };
    let RpcId::Number(id) = resp.id else {
        return;
    };
    let Some(waiting) = pending.lock().unwrap().remove(&id) else {
        return;
    };

    match waiting {
        Pending::Call(tx) => {
            let _ = tx.send(Ok(resp));
        }
        Pending::Subscribe { slots, tx } => {
            let result = match resp.into_result() {
                Err(e) => Err(WsError::Rpc(e)),
                Ok(sid) => match subscription_id(&sid) {
                    Some(sid) => Ok(register(subscriptions, sid, slots)),
                    None => Err(WsError::WebSocket(format!("unexpected subscription id {sid}"))),
                },
            };
            // The caller gave up (timeout); nobody reads this subscription.
            if let Err(Ok(orphan)) = tx.send(result) {
                subscriptions.remove(&orphan.id);
            }
        }
    }
}

fn register(subscriptions: &SubscriptionManager, id: String, slots: Vec<String>) -> PhysicalSubscription {
    let id = SubscriptionId(id);
    let ticks = subscriptions.register(id.clone(), slots);
    PhysicalSubscription { id, ticks }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_map() -> PendingMap {
        Arc::new(Mutex::new(HashMap::new()))
    }

    #[tokio::test]
    async fn subscription_is_registered_before_first_change_set() {
        let pending = pending_map();
        let subs = SubscriptionManager::new();
        let (tx, rx) = oneshot::channel();
        pending.lock().unwrap().insert(
            4,
            Pending::Subscribe {
                slots: vec!["0xaa".into(), "0xbb".into()],
                tx,
            },
        );

        handle_message(r#"{"jsonrpc":"2.0","id":4,"result":"sub-9"}"#, &pending, &subs);
        handle_message(
            r#"{"jsonrpc":"2.0","method":"state_storage","params":{"subscription":"sub-9","result":{"block":"0x01","changes":[["0xbb","0x02"],["0xaa","0x01"]]}}}"#,
            &pending,
            &subs,
        );

        let mut sub = rx.await.unwrap().unwrap();
        assert_eq!(sub.id, SubscriptionId("sub-9".into()));
        assert_eq!(sub.ticks.recv().await.unwrap(), vec![json!("0x01"), json!("0x02")]);
        assert!(pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rpc_error_fails_subscribe() {
        let pending = pending_map();
        let subs = SubscriptionManager::new();
        let (tx, rx) = oneshot::channel();
        pending
            .lock()
            .unwrap()
            .insert(1, Pending::Subscribe { slots: vec!["0xaa".into()], tx });

        handle_message(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32602,"message":"invalid key"}}"#,
            &pending,
            &subs,
        );
        assert!(matches!(rx.await.unwrap(), Err(WsError::Rpc(_))));
        assert!(subs.is_empty());
    }

    #[tokio::test]
    async fn abandoned_subscribe_is_dropped() {
        let pending = pending_map();
        let subs = SubscriptionManager::new();
        let (tx, rx) = oneshot::channel();
        drop(rx);
        pending
            .lock()
            .unwrap()
            .insert(2, Pending::Subscribe { slots: vec!["0xaa".into()], tx });

        handle_message(r#"{"jsonrpc":"2.0","id":2,"result":"sub-1"}"#, &pending, &subs);
        assert!(subs.is_empty());
    }

    #[tokio::test]
    async fn call_response_is_routed_by_id() {
        let pending = pending_map();
        let subs = SubscriptionManager::new();
        let (tx, rx) = oneshot::channel();
        pending.lock().unwrap().insert(7, Pending::Call(tx));

        handle_message(r#"{"jsonrpc":"2.0","id":8,"result":"0x00"}"#, &pending, &subs);
        assert_eq!(pending.lock().unwrap().len(), 1);
        handle_message(r#"{"jsonrpc":"2.0","id":7,"result":"0x2a"}"#, &pending, &subs);

        let resp = rx.await.unwrap().unwrap();
        assert_eq!(resp.into_result().unwrap(), json!("0x2a"));
    }

    #[tokio::test]
    async fn requests_fail_when_not_connected() {
        let client = WsChainClient::new("Polkadot Relay", WsClientConfig::default());
        assert!(!client.is_connected());
        let err = client.call("system_health", vec![]).await.unwrap_err();
        assert!(matches!(err, WatchError::Transport(_)));
        assert!(client.subscribe(vec![QueryCall::storage("0xaa")]).await.is_err());
    }

    /// Local node that answers subscriptions and pushes a change set for
    /// the latest one whenever it sees `dev_emit`.
    async fn spawn_node() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                    let mut opened = 0u64;
                    let mut latest: Option<(String, Value)> = None;
                    while let Some(Ok(msg)) = ws.next().await {
                        let Message::Text(text) = msg else { continue };
                        let req: Value = serde_json::from_str(text.as_str()).unwrap();
                        let result = match req["method"].as_str() {
                            Some("state_subscribeStorage") => {
                                opened += 1;
                                let sid = format!("sub-{opened}");
                                latest = Some((sid.clone(), req["params"][0][0].clone()));
                                json!(sid)
                            }
                            Some("dev_emit") => {
                                if let Some((sid, key)) = &latest {
                                    let note = json!({
                                        "jsonrpc": "2.0",
                                        "method": "state_storage",
                                        "params": {
                                            "subscription": sid,
                                            "result": {"block": "0x01", "changes": [[key, "0x2a"]]}
                                        }
                                    });
                                    ws.send(Message::Text(note.to_string().into())).await.unwrap();
                                }
                                json!(true)
                            }
                            _ => json!(true),
                        };
                        let resp = json!({"jsonrpc": "2.0", "id": req["id"], "result": result});
                        if ws.send(Message::Text(resp.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        format!("ws://{addr}")
    }

    fn session_subscriptions(client: &WsChainClient) -> SubscriptionManager {
        client.session.lock().unwrap().as_ref().unwrap().subscriptions.clone()
    }

    #[tokio::test]
    async fn old_session_teardown_keeps_new_subscriptions() {
        let url = spawn_node().await;
        let client = WsChainClient::new("Polkadot Relay", WsClientConfig::default());

        client.connect(&url).await.unwrap();
        let _first = client.subscribe(vec![QueryCall::storage("0xaa")]).await.unwrap();
        let old = session_subscriptions(&client);

        client.disconnect().await;
        client.connect(&url).await.unwrap();
        let mut second = client.subscribe(vec![QueryCall::storage("0xbb")]).await.unwrap();

        // What the old socket task does on its way out.
        old.clear();
        assert!(!session_subscriptions(&client).is_empty());

        client.call("dev_emit", vec![]).await.unwrap();
        let tick = time::timeout(Duration::from_secs(2), second.ticks.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tick, vec![json!("0x2a")]);
    }

    #[tokio::test]
    async fn disconnect_ends_open_streams() {
        let url = spawn_node().await;
        let client = WsChainClient::new("Polkadot Relay", WsClientConfig::default());
        client.connect(&url).await.unwrap();
        let mut sub = client.subscribe(vec![QueryCall::storage("0xaa")]).await.unwrap();

        client.disconnect().await;
        assert!(!client.is_connected());
        assert!(sub.ticks.recv().await.is_none());
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_fast() {
        let client = WsChainClient::new(
            "Polkadot Relay",
            WsClientConfig {
                connect_timeout: Duration::from_secs(2),
                request_timeout: Duration::from_secs(2),
            },
        );
        assert!(client.connect("ws://127.0.0.1:1").await.is_err());
        assert!(!client.is_connected());
    }
}
