use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Wire frames of the multiplexed channel. Clients send only control frames;
/// publication is server-initiated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Message { topic: String, payload: serde_json::Value },
    SlowSubscriber,
}

/// One attached connection, as the broker sees it: frames from the peer and
/// frames to the peer.
pub struct Transport {
    pub incoming: mpsc::Receiver<Frame>,
    pub outgoing: mpsc::Sender<Frame>,
}

/// Produces a fresh transport per connection attempt. The server side binds
/// this to a WebSocket; tests use in-memory channel pairs.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Transport>;
}

pub const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
pub const RECONNECT_CAP: Duration = Duration::from_secs(10);

/// Default per-connection outbound buffer.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

#[derive(Default)]
struct BrokerState {
    next_id: u64,
    connections: HashMap<u64, mpsc::Sender<Frame>>,
    /// topic → connection ids in subscription order
    topics: HashMap<String, Vec<u64>>,
}

/// Topic router. Each connection gets a bounded outbound buffer; a
/// connection that cannot keep up is sent [`Frame::SlowSubscriber`] and
/// closed rather than stalling the broker.
pub struct Broker {
    state: Mutex<BrokerState>,
    capacity: usize,
}

impl Broker {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BrokerState::default()),
            capacity,
        })
    }

    /// Attach a connection: the caller feeds control frames into `incoming`
    /// and drains the returned receiver to the peer.
    pub fn attach(self: &Arc<Self>, mut incoming: mpsc::Receiver<Frame>) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = {
            let mut state = self.state.lock().expect("broker lock");
            state.next_id += 1;
            let id = state.next_id;
            state.connections.insert(id, tx);
            id
        };

        let broker = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = incoming.recv().await {
                match frame {
                    Frame::Subscribe { topic } => broker.subscribe_connection(id, &topic),
                    Frame::Unsubscribe { topic } => broker.unsubscribe_connection(id, &topic),
                    // Domain frames from clients are ignored by contract
                    _ => {}
                }
            }
            broker.drop_connection(id);
        });
        rx
    }

    fn subscribe_connection(&self, id: u64, topic: &str) {
        let mut state = self.state.lock().expect("broker lock");
        let subscribers = state.topics.entry(topic.to_string()).or_default();
        if !subscribers.contains(&id) {
            subscribers.push(id);
        }
        debug!(connection = id, topic, "subscribed");
    }

    fn unsubscribe_connection(&self, id: u64, topic: &str) {
        let mut state = self.state.lock().expect("broker lock");
        let now_empty = match state.topics.get_mut(topic) {
            Some(subscribers) => {
                subscribers.retain(|&s| s != id);
                subscribers.is_empty()
            }
            None => false,
        };
        if now_empty {
            state.topics.remove(topic);
        }
    }

    fn drop_connection(&self, id: u64) {
        let mut state = self.state.lock().expect("broker lock");
        state.connections.remove(&id);
        state.topics.retain(|_, subscribers| {
            subscribers.retain(|&s| s != id);
            !subscribers.is_empty()
        });
    }

    /// Route a message to every subscriber of `topic`. Subscribers whose
    /// outbound buffer is full are declared slow and disconnected.
    pub fn publish(&self, topic: &str, payload: serde_json::Value) {
        let frame = Frame::Message {
            topic: topic.to_string(),
            payload,
        };
        let mut slow: Vec<(u64, mpsc::Sender<Frame>)> = Vec::new();
        {
            let mut state = self.state.lock().expect("broker lock");
            let Some(subscribers) = state.topics.get(topic).cloned() else {
                return;
            };
            for id in subscribers {
                let Some(tx) = state.connections.get(&id) else {
                    continue;
                };
                match tx.try_send(frame.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(connection = id, topic, "slow subscriber, disconnecting");
                        slow.push((id, tx.clone()));
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        slow.push((id, tx.clone()));
                    }
                }
            }
            for (id, _) in &slow {
                let id = *id;
                state.connections.remove(&id);
                state.topics.retain(|_, subscribers| {
                    subscribers.retain(|&s| s != id);
                    !subscribers.is_empty()
                });
            }
        }
        // Deliver the typed notice once the peer drains, then close
        for (_, tx) in slow {
            tokio::spawn(async move {
                let _ = tx.send(Frame::SlowSubscriber).await;
            });
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .expect("broker lock")
            .topics
            .get(topic)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

enum Command {
    Subscribe {
        topic: String,
        handler: mpsc::UnboundedSender<serde_json::Value>,
    },
    Unsubscribe {
        topic: String,
    },
    Close,
}

/// Client end of the channel.
///
/// Keeps the desired topic set; subscriptions made while disconnected are
/// queued (in request order) and flushed on connect, and every active topic
/// is re-subscribed automatically after a reconnect. Reconnection backs off
/// exponentially from 1 s to a 10 s cap. [`close`](PubSubClient::close)
/// suppresses reconnection.
pub struct PubSubClient {
    commands: mpsc::UnboundedSender<Command>,
}

struct ClientState {
    /// topic → live handler channels
    handlers: HashMap<String, Vec<mpsc::UnboundedSender<serde_json::Value>>>,
    /// topics in first-subscription order, for deterministic (re)subscribes
    order: Vec<String>,
}

impl ClientState {
    fn deliver(&mut self, topic: &str, payload: serde_json::Value) -> bool {
        let Some(handlers) = self.handlers.get_mut(topic) else {
            return false;
        };
        handlers.retain(|tx| tx.send(payload.clone()).is_ok());
        if handlers.is_empty() {
            self.handlers.remove(topic);
            self.order.retain(|t| t != topic);
            return true; // last listener gone
        }
        false
    }

    fn add(&mut self, topic: String, handler: mpsc::UnboundedSender<serde_json::Value>) -> bool {
        let fresh = !self.handlers.contains_key(&topic);
        if fresh {
            self.order.push(topic.clone());
        }
        self.handlers.entry(topic).or_default().push(handler);
        fresh
    }

    fn remove(&mut self, topic: &str) -> bool {
        let had = self.handlers.remove(topic).is_some();
        self.order.retain(|t| t != topic);
        had
    }
}

impl PubSubClient {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_client(connector, command_rx));
        Self { commands }
    }

    /// Register a handler for a topic. Messages arrive in publication order.
    /// Dropping the receiver unregisters the handler lazily; when the last
    /// one goes, the topic is unsubscribed on the wire.
    pub fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<serde_json::Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.commands.send(Command::Subscribe {
            topic: topic.to_string(),
            handler: tx,
        });
        rx
    }

    /// Drop every handler for a topic and send the unsubscribe frame (or
    /// drop the queued subscribe if the topic never reached the wire).
    pub fn unsubscribe(&self, topic: &str) {
        let _ = self.commands.send(Command::Unsubscribe {
            topic: topic.to_string(),
        });
    }

    /// Deliberate close: tears the connection down and suppresses reconnection.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

async fn run_client(connector: Arc<dyn Connector>, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut state = ClientState {
        handlers: HashMap::new(),
        order: Vec::new(),
    };
    let mut backoff = RECONNECT_INITIAL;

    'reconnect: loop {
        let mut transport = match connector.connect().await {
            Ok(transport) => {
                backoff = RECONNECT_INITIAL;
                transport
            }
            Err(e) => {
                debug!(error = %e, "pubsub connect failed, backing off {}s", backoff.as_secs());
                // Commands are still serviced while waiting, so close and
                // subscription changes made during the gap are not lost
                let sleep = tokio::time::sleep(backoff);
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        _ = &mut sleep => break,
                        cmd = commands.recv() => match cmd {
                            Some(Command::Subscribe { topic, handler }) => {
                                state.add(topic, handler);
                            }
                            Some(Command::Unsubscribe { topic }) => {
                                state.remove(&topic);
                            }
                            Some(Command::Close) | None => return,
                        }
                    }
                }
                backoff = (backoff * 2).min(RECONNECT_CAP);
                continue 'reconnect;
            }
        };

        // Flush queued subscriptions / re-subscribe active topics in order
        for topic in state.order.clone() {
            if transport
                .outgoing
                .send(Frame::Subscribe { topic })
                .await
                .is_err()
            {
                continue 'reconnect;
            }
        }

        loop {
            tokio::select! {
                frame = transport.incoming.recv() => match frame {
                    Some(Frame::Message { topic, payload }) => {
                        let last_gone = state.deliver(&topic, payload);
                        if last_gone {
                            let _ = transport
                                .outgoing
                                .send(Frame::Unsubscribe { topic })
                                .await;
                        }
                    }
                    Some(Frame::SlowSubscriber) => {
                        warn!("server declared this client a slow subscriber");
                    }
                    Some(_) => {}
                    None => {
                        debug!("pubsub connection lost, reconnecting");
                        continue 'reconnect;
                    }
                },
                cmd = commands.recv() => match cmd {
                    Some(Command::Subscribe { topic, handler }) => {
                        let fresh = state.add(topic.clone(), handler);
                        if fresh
                            && transport
                                .outgoing
                                .send(Frame::Subscribe { topic })
                                .await
                                .is_err()
                        {
                            continue 'reconnect;
                        }
                    }
                    Some(Command::Unsubscribe { topic }) => {
                        if state.remove(&topic) {
                            let _ = transport
                                .outgoing
                                .send(Frame::Unsubscribe { topic })
                                .await;
                        }
                    }
                    Some(Command::Close) | None => return,
                }
            }
        }
    }
}

/// In-memory transport pair: the broker-facing half and the client-facing half.
pub fn duplex(buffer: usize) -> (Transport, Transport) {
    let (client_tx, server_rx) = mpsc::channel(buffer);
    let (server_tx, client_rx) = mpsc::channel(buffer);
    (
        Transport {
            incoming: server_rx,
            outgoing: server_tx,
        },
        Transport {
            incoming: client_rx,
            outgoing: client_tx,
        },
    )
}
