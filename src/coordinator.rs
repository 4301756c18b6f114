//! Session coordinator: multiplexes the sensor (a strictly serial resource)
//! across concurrent HTTP requests and long-lived identify subscribers.
//!
//! Every decoded inbound frame is delivered to exactly one sink: the private
//! channel of the finite operation currently holding the sensor, or the
//! shared infinite channel consumed by the identify loop. The routing choice
//! happens in one place ([`Coordinator::route`]) under one lock, so handlers
//! and the identify loop never race over the same queue.
//!
//! Finite operations hold a [`SensorLease`]; dropping it (on success, error
//! or cancellation alike) clears the finite channel and signals
//! `finite_done`, which is what lets the identify loop re-arm.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::fpc_codec::{Fpc2534, Response};

/// Ceiling on any single awaited sensor reply.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport seam: anything that can push an encoded frame towards the
/// sensor. Production uses the MQTT link; tests substitute a recorder.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn publish_frame(&self, frame: Vec<u8>) -> Result<(), GatewayError>;
}

struct Shared {
    finite: Option<mpsc::UnboundedSender<Response>>,
    infinite: mpsc::UnboundedSender<Response>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<Value>>,
    next_subscriber_id: u64,
}

pub struct Coordinator {
    shared: Mutex<Shared>,
    finite_done: Notify,
    subscriber_appeared: Notify,
}

impl Coordinator {
    /// Returns the coordinator plus the receiving end of the infinite
    /// channel, which the identify loop takes ownership of.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Response>) {
        let (infinite_tx, infinite_rx) = mpsc::unbounded_channel();
        let coordinator = Arc::new(Self {
            shared: Mutex::new(Shared {
                finite: None,
                infinite: infinite_tx,
                subscribers: HashMap::new(),
                next_subscriber_id: 0,
            }),
            finite_done: Notify::new(),
            subscriber_appeared: Notify::new(),
        });
        (coordinator, infinite_rx)
    }

    /// Deliver a decoded inbound frame to exactly one sink.
    pub fn route(&self, response: Response) {
        let shared = self.shared.lock().unwrap();
        match &shared.finite {
            Some(tx) => {
                if tx.send(response).is_err() {
                    warn!("finite channel receiver dropped, response lost");
                }
            }
            None => {
                if shared.infinite.send(response).is_err() {
                    warn!("identify loop gone, response lost");
                }
            }
        }
    }

    /// Admit a finite operation, or refuse with `Busy` if one is in flight.
    pub fn acquire(self: &Arc<Self>) -> Result<SensorLease, GatewayError> {
        let mut shared = self.shared.lock().unwrap();
        if shared.finite.is_some() {
            return Err(GatewayError::Busy);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        shared.finite = Some(tx);
        debug!("finite channel installed");
        Ok(SensorLease {
            coordinator: Arc::clone(self),
            rx,
        })
    }

    pub fn finite_active(&self) -> bool {
        self.shared.lock().unwrap().finite.is_some()
    }

    /// Signal fired whenever a finite operation releases the sensor.
    pub fn on_finite_done(&self) -> &Notify {
        &self.finite_done
    }

    /// Suspend until no finite operation holds the sensor.
    pub async fn wait_finite_released(&self) {
        loop {
            let done = self.finite_done.notified();
            if !self.finite_active() {
                return;
            }
            done.await;
        }
    }

    /// Register an identify subscriber queue.
    pub fn subscribe(self: &Arc<Self>) -> Subscriber {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut shared = self.shared.lock().unwrap();
            let id = shared.next_subscriber_id;
            shared.next_subscriber_id += 1;
            shared.subscribers.insert(id, tx);
            id
        };
        self.subscriber_appeared.notify_waiters();
        debug!(id, "identify subscriber registered");
        Subscriber {
            coordinator: Arc::clone(self),
            id,
            rx,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.lock().unwrap().subscribers.len()
    }

    /// Suspend until at least one identify subscriber exists.
    pub async fn wait_for_subscriber(&self) {
        loop {
            let appeared = self.subscriber_appeared.notified();
            if self.subscriber_count() > 0 {
                return;
            }
            appeared.await;
        }
    }

    /// Fan a JSON event out to every subscriber queue. Returns the number of
    /// queues reached.
    pub fn broadcast(&self, value: &Value) -> usize {
        let shared = self.shared.lock().unwrap();
        let mut reached = 0;
        for tx in shared.subscribers.values() {
            if tx.send(value.clone()).is_ok() {
                reached += 1;
            }
        }
        reached
    }

    fn release(&self) {
        self.shared.lock().unwrap().finite = None;
        self.finite_done.notify_waiters();
        debug!("finite channel cleared");
    }

    fn unsubscribe(&self, id: u64) {
        self.shared.lock().unwrap().subscribers.remove(&id);
        debug!(id, "identify subscriber removed");
    }
}

/// Exclusive grip on the sensor for one finite operation. Inbound frames are
/// routed to `rx` for as long as the lease lives; dropping it releases the
/// sensor and raises `finite_done` on every exit path.
pub struct SensorLease {
    coordinator: Arc<Coordinator>,
    rx: mpsc::UnboundedReceiver<Response>,
}

impl SensorLease {
    /// Next reply, bounded by [`REPLY_TIMEOUT`].
    pub async fn recv(&mut self) -> Result<Response, GatewayError> {
        self.recv_within(REPLY_TIMEOUT).await
    }

    /// Next reply with a caller-chosen ceiling (streamed downloads use the
    /// longer idle timeout).
    pub async fn recv_within(&mut self, limit: Duration) -> Result<Response, GatewayError> {
        match tokio::time::timeout(limit, self.rx.recv()).await {
            Err(_) => Err(GatewayError::Timeout),
            Ok(None) => Err(GatewayError::ChannelClosed),
            Ok(Some(response)) => Ok(response),
        }
    }
}

impl Drop for SensorLease {
    fn drop(&mut self) {
        self.coordinator.release();
    }
}

/// One identify WebSocket client. Dropping it deregisters the queue; when
/// the set becomes empty the identify loop idles on its next wait.
pub struct Subscriber {
    coordinator: Arc<Coordinator>,
    id: u64,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl Subscriber {
    pub async fn next_event(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.coordinator.unsubscribe(self.id);
    }
}

/// Shared application state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    codec: Arc<RwLock<Fpc2534>>,
    pub coordinator: Arc<Coordinator>,
    pub sink: Arc<dyn FrameSink>,
}

impl AppState {
    pub fn new(codec: Fpc2534, coordinator: Arc<Coordinator>, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            codec: Arc::new(RwLock::new(codec)),
            coordinator,
            sink,
        }
    }

    /// Encode a request under the current codec.
    pub fn encode<F>(&self, build: F) -> Result<Vec<u8>, GatewayError>
    where
        F: FnOnce(&Fpc2534) -> Result<Vec<u8>, GatewayError>,
    {
        build(&self.codec.read().unwrap())
    }

    /// Decode an inbound wire frame under the current codec.
    pub fn decode(&self, data: &[u8]) -> Result<Response, GatewayError> {
        self.codec.read().unwrap().parse_response(data)
    }

    /// Atomically replace the codec (rekeying after SET_CRYPTO_KEY).
    pub fn swap_codec(&self, codec: Fpc2534) {
        *self.codec.write().unwrap() = codec;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fpc_codec::{AppFailCode, SensorEvent};

    fn status(event: SensorEvent) -> Response {
        Response::Status {
            event,
            states: vec![],
            app_fail_code: AppFailCode(0),
        }
    }

    #[tokio::test]
    async fn routes_to_infinite_without_finite() {
        let (coordinator, mut infinite_rx) = Coordinator::new();
        coordinator.route(status(SensorEvent::Idle));
        let got = infinite_rx.try_recv().unwrap();
        assert!(matches!(
            got,
            Response::Status {
                event: SensorEvent::Idle,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn routes_to_finite_while_lease_held() {
        let (coordinator, mut infinite_rx) = Coordinator::new();
        let mut lease = coordinator.acquire().unwrap();
        coordinator.route(status(SensorEvent::FingerDetect));
        assert!(infinite_rx.try_recv().is_err());
        assert!(lease.recv().await.is_ok());

        drop(lease);
        coordinator.route(status(SensorEvent::FingerLost));
        assert!(infinite_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn second_acquire_is_busy() {
        let (coordinator, _infinite_rx) = Coordinator::new();
        let lease = coordinator.acquire().unwrap();
        assert!(matches!(coordinator.acquire(), Err(GatewayError::Busy)));
        drop(lease);
        assert!(coordinator.acquire().is_ok());
    }

    #[tokio::test]
    async fn drop_signals_finite_done() {
        let (coordinator, _infinite_rx) = Coordinator::new();
        let lease = coordinator.acquire().unwrap();
        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.wait_finite_released().await })
        };
        // give the waiter a chance to park
        tokio::task::yield_now().await;
        drop(lease);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("finite_done never fired")
            .unwrap();
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let (coordinator, _infinite_rx) = Coordinator::new();
        let mut a = coordinator.subscribe();
        let mut b = coordinator.subscribe();
        assert_eq!(coordinator.subscriber_count(), 2);

        let reached = coordinator.broadcast(&serde_json::json!({"event": "x"}));
        assert_eq!(reached, 2);
        assert!(a.next_event().await.is_some());
        assert!(b.next_event().await.is_some());

        drop(a);
        drop(b);
        assert_eq!(coordinator.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn wait_for_subscriber_wakes_on_register() {
        let (coordinator, _infinite_rx) = Coordinator::new();
        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.wait_for_subscriber().await })
        };
        tokio::task::yield_now().await;
        let _sub = coordinator.subscribe();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("subscriber_appeared never fired")
            .unwrap();
    }

    #[tokio::test]
    async fn lease_recv_times_out() {
        tokio::time::pause();
        let (coordinator, _infinite_rx) = Coordinator::new();
        let mut lease = coordinator.acquire().unwrap();
        let result = lease.recv().await;
        assert!(matches!(result, Err(GatewayError::Timeout)));
    }
}
