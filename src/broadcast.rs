//! WebSocket fan-out between the backend and its clients
//!
//! The proxy keeps exactly one upstream connection to the backend's event
//! channel and any number of client (downstream) connections. Upstream
//! messages are broadcast to every client; client messages are merged into
//! the upstream connection.
//!
//! # Data Flow
//! ```text
//!              ┌──────────── hub loop (one per upstream epoch) ───────────┐
//! Backend ───► from_upstream ──► fan-out ──► outbound queue ──► Client A, B, ...
//! Backend ◄─── to_upstream ◄──── fan-in ◄─── inbound (id, msg) ◄── Client A, B, ...
//! ```
//!
//! Connections are bridged to in-memory channels by small pump tasks, so the
//! hub itself never touches a socket and can be driven entirely in tests.

use crate::error::SupervisorError;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Messages buffered per client before it is considered too slow
pub const DOWNSTREAM_QUEUE: usize = 256;

const UPSTREAM_QUEUE: usize = 256;

/// Channel ends of the upstream connection, as seen by the hub
pub struct UpstreamLink {
    pub to_upstream: mpsc::Sender<Message>,
    pub from_upstream: mpsc::Receiver<Message>,
}

/// The backend side of an in-memory [`UpstreamLink`]
pub struct LinkPeer {
    /// Messages the "backend" emits
    pub tx: mpsc::Sender<Message>,
    /// Messages the proxy relayed to the "backend"
    pub rx: mpsc::Receiver<Message>,
}

impl UpstreamLink {
    /// An in-memory link and its far end
    pub fn pair() -> (UpstreamLink, LinkPeer) {
        let (to_upstream, rx) = mpsc::channel(UPSTREAM_QUEUE);
        let (tx, from_upstream) = mpsc::channel(UPSTREAM_QUEUE);
        (
            UpstreamLink {
                to_upstream,
                from_upstream,
            },
            LinkPeer { tx, rx },
        )
    }

    /// Open a WebSocket to `url` and bridge it to a link
    pub async fn connect(url: &str) -> Result<Self, SupervisorError> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| SupervisorError::UpstreamUnavailable(format!("{}: {}", url, e)))?;

        let (mut sink, mut source) = ws.split();
        let (link, peer) = Self::pair();
        let LinkPeer { tx, mut rx } = peer;

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let url = url.to_string();
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(msg @ (Message::Text(_) | Message::Binary(_))) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(url = %url, error = %e, "Upstream socket error");
                        break;
                    }
                }
            }
            debug!(url = %url, "Upstream socket closed");
        });

        Ok(link)
    }
}

struct Attached {
    epoch: u64,
    fan_in: mpsc::Sender<(u64, Message)>,
    // Dropping this stops the hub loop
    _shutdown: oneshot::Sender<()>,
}

#[derive(Default)]
struct Inner {
    attached: Option<Attached>,
    downstream: HashMap<u64, mpsc::Sender<Message>>,
    next_id: u64,
    next_epoch: u64,
}

/// Relays between one upstream connection and many client connections
pub struct Broadcaster {
    inner: Mutex<Inner>,
    connected: watch::Sender<bool>,
}

impl Broadcaster {
    pub fn new() -> Arc<Self> {
        let (connected, _) = watch::channel(false);
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            connected,
        })
    }

    /// Start relaying through `link`, replacing any previous upstream.
    ///
    /// Returns the epoch identifying this upstream.
    pub fn attach_upstream(self: &Arc<Self>, link: UpstreamLink) -> u64 {
        let (fan_in_tx, fan_in_rx) = mpsc::channel(UPSTREAM_QUEUE);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let (epoch, replaced) = {
            let mut inner = self.inner.lock();
            let replaced = inner.attached.take().is_some();
            inner.downstream.clear();
            inner.next_epoch += 1;
            let epoch = inner.next_epoch;
            inner.attached = Some(Attached {
                epoch,
                fan_in: fan_in_tx,
                _shutdown: shutdown_tx,
            });
            (epoch, replaced)
        };
        self.connected.send_replace(true);

        if replaced {
            warn!(epoch, "Replaced an existing upstream connection");
        }
        info!(epoch, "Upstream connection attached");

        tokio::spawn(Arc::clone(self).run_hub(epoch, link, fan_in_rx, shutdown_rx));
        epoch
    }

    /// Register a client connection. Fails while no upstream is attached.
    pub fn attach_downstream(self: &Arc<Self>) -> Result<Downstream, SupervisorError> {
        let mut inner = self.inner.lock();
        let fan_in = inner
            .attached
            .as_ref()
            .map(|a| a.fan_in.clone())
            .ok_or(SupervisorError::Detached)?;

        inner.next_id += 1;
        let id = inner.next_id;
        let (tx, rx) = mpsc::channel(DOWNSTREAM_QUEUE);
        inner.downstream.insert(id, tx);
        debug!(id, clients = inner.downstream.len(), "Client socket registered");

        Ok(Downstream {
            id,
            outbound: rx,
            inbound: fan_in,
            broadcaster: Arc::downgrade(self),
        })
    }

    /// Remove one client. Unknown ids are ignored.
    pub fn detach(&self, id: u64) {
        let removed = self.inner.lock().downstream.remove(&id).is_some();
        if removed {
            debug!(id, "Client socket removed");
        }
    }

    /// Close the upstream and every client connection. Idempotent.
    pub fn detach_all(&self) {
        let (had_upstream, clients) = {
            let mut inner = self.inner.lock();
            let had_upstream = inner.attached.take().is_some();
            let clients = inner.downstream.len();
            inner.downstream.clear();
            (had_upstream, clients)
        };
        self.connected.send_replace(false);

        if had_upstream || clients > 0 {
            info!(clients, "Detached upstream and all client sockets");
        }
    }

    pub fn is_attached(&self) -> bool {
        self.inner.lock().attached.is_some()
    }

    pub fn downstream_count(&self) -> usize {
        self.inner.lock().downstream.len()
    }

    /// Current upstream epoch, if attached
    pub fn epoch(&self) -> Option<u64> {
        self.inner.lock().attached.as_ref().map(|a| a.epoch)
    }

    /// Flips to false whenever the upstream goes away
    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    async fn run_hub(
        self: Arc<Self>,
        epoch: u64,
        link: UpstreamLink,
        mut fan_in: mpsc::Receiver<(u64, Message)>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let UpstreamLink {
            to_upstream,
            mut from_upstream,
        } = link;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!(epoch, "Hub stopped");
                    return;
                }
                msg = from_upstream.recv() => match msg {
                    Some(msg) => self.fan_out(epoch, msg),
                    None => {
                        warn!(epoch, "Upstream connection closed");
                        break;
                    }
                },
                Some((id, msg)) = fan_in.recv() => {
                    if to_upstream.send(msg).await.is_err() {
                        warn!(epoch, id, "Upstream connection closed while relaying");
                        break;
                    }
                }
            }
        }

        self.end_epoch(epoch);
    }

    fn fan_out(&self, epoch: u64, msg: Message) {
        let mut inner = self.inner.lock();
        if inner.attached.as_ref().map(|a| a.epoch) != Some(epoch) {
            return;
        }

        let mut dropped = Vec::new();
        for (id, tx) in inner.downstream.iter() {
            match tx.try_send(msg.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(id, "Client socket is not keeping up, disconnecting");
                    dropped.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(*id),
            }
        }
        for id in dropped {
            inner.downstream.remove(&id);
        }
    }

    fn end_epoch(&self, epoch: u64) {
        let ended = {
            let mut inner = self.inner.lock();
            if inner.attached.as_ref().map(|a| a.epoch) == Some(epoch) {
                inner.attached = None;
                inner.downstream.clear();
                true
            } else {
                false
            }
        };
        if ended {
            self.connected.send_replace(false);
        }
    }
}

/// A registered client connection
pub struct Downstream {
    id: u64,
    outbound: mpsc::Receiver<Message>,
    inbound: mpsc::Sender<(u64, Message)>,
    broadcaster: Weak<Broadcaster>,
}

impl Downstream {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next message broadcast from upstream; `None` once detached
    pub async fn recv(&mut self) -> Option<Message> {
        self.outbound.recv().await
    }

    /// Still part of the broadcaster's client set
    pub fn is_registered(&self) -> bool {
        self.broadcaster
            .upgrade()
            .is_some_and(|b| b.inner.lock().downstream.contains_key(&self.id))
    }

    /// Relay a message to upstream
    pub async fn send(&self, msg: Message) -> Result<(), SupervisorError> {
        if !self.is_registered() {
            return Err(SupervisorError::Detached);
        }
        self.inbound
            .send((self.id, msg))
            .await
            .map_err(|_| SupervisorError::Detached)
    }
}

impl Drop for Downstream {
    fn drop(&mut self) {
        if let Some(broadcaster) = self.broadcaster.upgrade() {
            broadcaster.detach(self.id);
        }
    }
}

/// Pump a client WebSocket through its registration until either side closes
pub async fn serve_downstream<S>(mut downstream: Downstream, ws: WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let id = downstream.id;
    let (mut sink, mut source) = ws.split();

    loop {
        tokio::select! {
            msg = downstream.outbound.recv() => match msg {
                Some(msg) => {
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                }
                None => {
                    debug!(id, "Client detached by proxy");
                    break;
                }
            },
            frame = source.next() => match frame {
                Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                    if downstream.inbound.send((id, msg)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(id, error = %e, "Client socket error");
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
    debug!(id, "Client socket closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn text(s: &str) -> Message {
        Message::text(s)
    }

    #[tokio::test]
    async fn downstream_requires_upstream() {
        let broadcaster = Broadcaster::new();
        assert!(matches!(
            broadcaster.attach_downstream(),
            Err(SupervisorError::Detached)
        ));
        assert!(!broadcaster.is_attached());
    }

    #[tokio::test]
    async fn every_client_receives_every_upstream_message() {
        let broadcaster = Broadcaster::new();
        let (link, peer) = UpstreamLink::pair();
        broadcaster.attach_upstream(link);

        let mut clients: Vec<Downstream> = (0..3)
            .map(|_| broadcaster.attach_downstream().unwrap())
            .collect();
        assert_eq!(broadcaster.downstream_count(), 3);

        for i in 0..5 {
            peer.tx.send(text(&format!("event-{}", i))).await.unwrap();
        }

        for client in clients.iter_mut() {
            for i in 0..5 {
                assert_eq!(client.recv().await, Some(text(&format!("event-{}", i))));
            }
        }
    }

    #[tokio::test]
    async fn client_messages_reach_upstream_in_order() {
        let broadcaster = Broadcaster::new();
        let (link, mut peer) = UpstreamLink::pair();
        broadcaster.attach_upstream(link);

        let a = broadcaster.attach_downstream().unwrap();
        let b = broadcaster.attach_downstream().unwrap();

        for i in 0..10 {
            a.send(text(&format!("a{}", i))).await.unwrap();
            b.send(text(&format!("b{}", i))).await.unwrap();
        }

        let mut from_a = Vec::new();
        let mut from_b = Vec::new();
        for _ in 0..20 {
            let msg = peer.rx.recv().await.unwrap();
            let s = msg.to_text().unwrap().to_string();
            if s.starts_with('a') {
                from_a.push(s);
            } else {
                from_b.push(s);
            }
        }

        let expected_a: Vec<String> = (0..10).map(|i| format!("a{}", i)).collect();
        let expected_b: Vec<String> = (0..10).map(|i| format!("b{}", i)).collect();
        assert_eq!(from_a, expected_a);
        assert_eq!(from_b, expected_b);

        // Nothing is delivered twice
        assert!(
            tokio::time::timeout(Duration::from_millis(50), peer.rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn detach_all_closes_everything() {
        let broadcaster = Broadcaster::new();
        let (link, _peer) = UpstreamLink::pair();
        broadcaster.attach_upstream(link);
        let mut connected = broadcaster.subscribe_connected();
        assert!(*connected.borrow_and_update());

        let mut client = broadcaster.attach_downstream().unwrap();
        broadcaster.detach_all();

        assert!(!broadcaster.is_attached());
        assert_eq!(broadcaster.downstream_count(), 0);
        assert_eq!(client.recv().await, None);
        assert!(client.send(text("late")).await.is_err());
        assert!(!*connected.borrow());

        // Registration after teardown fails cleanly
        assert!(broadcaster.attach_downstream().is_err());

        // Idempotent
        broadcaster.detach_all();
        assert_eq!(broadcaster.downstream_count(), 0);
    }

    #[tokio::test]
    async fn upstream_close_ends_epoch() {
        let broadcaster = Broadcaster::new();
        let (link, peer) = UpstreamLink::pair();
        let epoch = broadcaster.attach_upstream(link);
        assert_eq!(broadcaster.epoch(), Some(epoch));

        let mut client = broadcaster.attach_downstream().unwrap();
        let mut connected = broadcaster.subscribe_connected();

        drop(peer);

        tokio::time::timeout(Duration::from_secs(1), connected.wait_for(|c| !*c))
            .await
            .unwrap()
            .unwrap();
        assert!(!broadcaster.is_attached());
        assert_eq!(client.recv().await, None);
    }

    #[tokio::test]
    async fn dropped_client_is_removed() {
        let broadcaster = Broadcaster::new();
        let (link, _peer) = UpstreamLink::pair();
        broadcaster.attach_upstream(link);

        let a = broadcaster.attach_downstream().unwrap();
        let _b = broadcaster.attach_downstream().unwrap();
        assert_eq!(broadcaster.downstream_count(), 2);

        drop(a);
        assert_eq!(broadcaster.downstream_count(), 1);

        // Removing after a teardown cleared the set is harmless
        let c = broadcaster.attach_downstream().unwrap();
        broadcaster.detach_all();
        drop(c);
        assert_eq!(broadcaster.downstream_count(), 0);
    }

    #[tokio::test]
    async fn slow_client_is_disconnected() {
        let broadcaster = Broadcaster::new();
        let (link, peer) = UpstreamLink::pair();
        broadcaster.attach_upstream(link);

        let mut reader = broadcaster.attach_downstream().unwrap();
        let _stalled = broadcaster.attach_downstream().unwrap();

        for i in 0..=DOWNSTREAM_QUEUE {
            peer.tx.send(text(&i.to_string())).await.unwrap();
            assert_eq!(reader.recv().await, Some(text(&i.to_string())));
        }

        assert_eq!(broadcaster.downstream_count(), 1);
    }

    #[tokio::test]
    async fn reattach_replaces_previous_upstream() {
        let broadcaster = Broadcaster::new();
        let (first, first_peer) = UpstreamLink::pair();
        let first_epoch = broadcaster.attach_upstream(first);
        let mut old_client = broadcaster.attach_downstream().unwrap();

        let (second, second_peer) = UpstreamLink::pair();
        let second_epoch = broadcaster.attach_upstream(second);
        assert!(second_epoch > first_epoch);
        assert_eq!(old_client.recv().await, None);

        // The old peer going away must not tear down the new epoch
        drop(first_peer);
        let mut client = broadcaster.attach_downstream().unwrap();
        second_peer.tx.send(text("hello")).await.unwrap();
        assert_eq!(client.recv().await, Some(text("hello")));
        assert_eq!(broadcaster.epoch(), Some(second_epoch));
    }
}
