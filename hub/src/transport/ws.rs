//! TransportWS — request multiplexer over one CBOR binary WebSocket stream
//! per agent (spec §4.2). The agent is the WS client; the hub owns the
//! upgrade entrypoint and drives the reader/writer loop spawned here.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc, oneshot};

use beszel_core::{Action, RequestEnvelope, ResponseEnvelope};

use super::codec;
use crate::error::TransportError;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const READ_DEADLINE: Duration = Duration::from_secs(70);
const PING_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_GRACE: Duration = Duration::from_secs(5);

type PendingSlot = oneshot::Sender<Result<Vec<u8>, TransportError>>;

pub struct WsTransport {
    next_id: AtomicU32,
    pending: Mutex<HashMap<u32, PendingSlot>>,
    outbound: mpsc::UnboundedSender<Message>,
    connected: AtomicBool,
}

impl WsTransport {
    /// Spawn the reader/writer loop over `socket`. Returns the transport
    /// handle plus a one-shot-ish receiver that fires once the connection is
    /// considered down, after the reconnection grace window.
    pub fn spawn(socket: WebSocket) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (down_tx, down_rx) = mpsc::channel(1);
        let transport = Arc::new(Self {
            next_id: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
            outbound: outbound_tx,
            connected: AtomicBool::new(true),
        });

        let (mut ws_tx, mut ws_rx) = socket.split();
        let reader = Arc::clone(&transport);

        tokio::spawn(async move {
            let mut ping_ticker = tokio::time::interval(PING_INTERVAL);
            loop {
                tokio::select! {
                    _ = ping_ticker.tick() => {
                        if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                            break;
                        }
                    }
                    outbound = outbound_rx.recv() => {
                        match outbound {
                            Some(msg) => {
                                if ws_tx.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    frame = tokio::time::timeout(READ_DEADLINE, ws_rx.next()) => {
                        match frame {
                            Ok(Some(Ok(Message::Binary(bytes)))) => {
                                reader.handle_inbound(&bytes).await;
                            }
                            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Text(_)))) => {}
                            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => break,
                            Err(_) => {
                                tracing::warn!("ws read deadline elapsed, closing connection");
                                break;
                            }
                        }
                    }
                }
            }
            reader.connected.store(false, Ordering::SeqCst);
            reader.cancel_all_pending(TransportError::ConnectionLost).await;
            tokio::time::sleep(RECONNECT_GRACE).await;
            let _ = down_tx.send(()).await;
        });

        (transport, down_rx)
    }

    async fn handle_inbound(&self, bytes: &[u8]) {
        let Ok(envelope) = codec::decode::<ResponseEnvelope>(bytes) else {
            tracing::warn!("dropping undecodable WS frame");
            return;
        };
        let result = match envelope.error.filter(|e| !e.is_empty()) {
            Some(err) => Err(TransportError::AgentError(err)),
            None => Ok(envelope.data),
        };

        let mut pending = self.pending.lock().await;
        match envelope.id {
            Some(id) => {
                if let Some(slot) = pending.remove(&id) {
                    let _ = slot.send(result);
                }
                // Unknown id: drop the frame silently (spec §4.2 step 2).
            }
            None => {
                // Legacy agent with no `id`: route to the oldest pending request.
                if let Some(&oldest) = pending.keys().min() {
                    if let Some(slot) = pending.remove(&oldest) {
                        let _ = slot.send(result);
                    }
                }
            }
        }
    }

    async fn cancel_all_pending(&self, reason: TransportError) {
        let mut pending = self.pending.lock().await;
        for (_, slot) in pending.drain() {
            let _ = slot.send(Err(reason.clone()));
        }
    }

    pub async fn request(&self, action: Action, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let envelope = RequestEnvelope { id: Some(id), action: action as u8, data: payload.to_vec() };
        let frame = codec::encode(&envelope)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.outbound.send(Message::Binary(frame.into())).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(TransportError::NotConnected);
        }

        match tokio::time::timeout(DEFAULT_REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::ConnectionLost),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(TransportError::Timeout)
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.cancel_all_pending(TransportError::ConnectionLost).await;
        let _ = self.outbound.send(Message::Close(None));
    }

    #[cfg(test)]
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Exercises the same correlation-table logic `WsTransport` uses, without
    /// standing up a real `axum::WebSocket` — scenario S5 (request multiplex).
    #[tokio::test]
    async fn out_of_order_responses_reach_the_right_caller() {
        let pending: Mutex<HashMap<u32, PendingSlot>> = Mutex::new(HashMap::new());
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        let (tx3, rx3) = oneshot::channel();
        pending.lock().await.insert(1, tx1);
        pending.lock().await.insert(2, tx2);
        pending.lock().await.insert(3, tx3);

        async fn deliver(pending: &Mutex<HashMap<u32, PendingSlot>>, id: u32, data: Vec<u8>) {
            if let Some(slot) = pending.lock().await.remove(&id) {
                let _ = slot.send(Ok(data));
            }
        }

        deliver(&pending, 3, vec![3]).await;
        deliver(&pending, 1, vec![1]).await;
        deliver(&pending, 2, vec![2]).await;

        assert_eq!(rx1.await.unwrap().unwrap(), vec![1]);
        assert_eq!(rx2.await.unwrap().unwrap(), vec![2]);
        assert_eq!(rx3.await.unwrap().unwrap(), vec![3]);
        assert!(pending.lock().await.is_empty());
    }
}
