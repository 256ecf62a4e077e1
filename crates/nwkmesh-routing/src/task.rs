//! Event pump running a [`NwkLayer`] on a tokio task
//!
//! The layer itself is synchronous. [`NwkTask`] serializes every input
//! onto one task: MAC events and upper-layer requests arrive through an
//! [`NwkEventSender`], due timers fire when the earliest deadline passes,
//! and indications are forwarded to an [`IndicationSink`] after each step.

use std::time::Instant;

use nwkmesh_core::{
    Clock, IndicationSink, MacHandle, MacService, MacStatus, NwkError, NwkEvent, NwkRequest,
    NwkResult, ReceivedFrame,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::nwk::NwkLayer;

/// Default depth of the event queue
pub const EVENT_QUEUE_DEPTH: usize = 256;

/// Cloneable handle for feeding events to a running [`NwkTask`]
#[derive(Debug, Clone)]
pub struct NwkEventSender {
    tx: mpsc::Sender<NwkEvent>,
}

impl NwkEventSender {
    pub async fn send(&self, event: NwkEvent) -> NwkResult<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| NwkError::InvalidRequest("network task stopped"))
    }

    pub async fn request(&self, request: NwkRequest) -> NwkResult<()> {
        self.send(NwkEvent::Request(request)).await
    }

    pub async fn frame_received(&self, frame: ReceivedFrame) -> NwkResult<()> {
        self.send(NwkEvent::FrameReceived(frame)).await
    }

    pub async fn send_confirmed(&self, handle: MacHandle, status: MacStatus) -> NwkResult<()> {
        self.send(NwkEvent::SendConfirmed { handle, status }).await
    }

    /// Non-blocking variant for MAC callbacks outside the runtime
    pub fn try_send(&self, event: NwkEvent) -> NwkResult<()> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NwkError::InvalidRequest("event queue full"),
            mpsc::error::TrySendError::Closed(_) => {
                NwkError::InvalidRequest("network task stopped")
            }
        })
    }
}

/// Handles returned by [`NwkTask::spawn`]
pub struct NwkTaskHandle<M: MacService, C: Clock> {
    pub events: NwkEventSender,
    pub shutdown: broadcast::Sender<()>,
    /// Resolves to the layer once the task stops
    pub join: JoinHandle<NwkLayer<M, C>>,
}

/// Single-owner event loop around a [`NwkLayer`]
pub struct NwkTask<M: MacService, C: Clock, S: IndicationSink> {
    layer: NwkLayer<M, C>,
    events: mpsc::Receiver<NwkEvent>,
    sink: S,
    shutdown_rx: broadcast::Receiver<()>,
}

impl<M, C, S> NwkTask<M, C, S>
where
    M: MacService + 'static,
    C: Clock + 'static,
    S: IndicationSink + 'static,
{
    pub fn new(
        layer: NwkLayer<M, C>,
        events: mpsc::Receiver<NwkEvent>,
        sink: S,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            layer,
            events,
            sink,
            shutdown_rx,
        }
    }

    /// Spawn the loop on the current runtime
    pub fn spawn(layer: NwkLayer<M, C>, sink: S) -> NwkTaskHandle<M, C> {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let task = Self::new(layer, rx, sink, shutdown_rx);
        NwkTaskHandle {
            events: NwkEventSender { tx },
            shutdown,
            join: tokio::spawn(task.run()),
        }
    }

    /// Run until shutdown or until every sender is dropped
    pub async fn run(mut self) -> NwkLayer<M, C> {
        info!(ieee = %self.layer.ieee_addr(), "network task started");
        loop {
            self.flush();
            let deadline = self.layer.next_deadline();
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("network task shutting down");
                    break;
                }
                event = self.events.recv() => match event {
                    Some(event) => self.layer.handle_event(event),
                    None => {
                        debug!("event senders dropped, network task stopping");
                        break;
                    }
                },
                _ = sleep_until(deadline) => self.layer.poll_timers(),
            }
        }
        self.flush();
        self.layer
    }

    fn flush(&mut self) {
        for indication in self.layer.drain_indications() {
            self.sink.deliver(indication);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NwkConfig;
    use nwkmesh_core::{ExtAddr, MockMac, NwkIndication, NwkStatus, PanId, SystemClock};
    use std::time::Duration;

    fn coordinator() -> NwkLayer<MockMac, SystemClock> {
        NwkLayer::new(
            NwkConfig::coordinator().with_seed(11),
            ExtAddr(0x00124B0000000001),
            MockMac::new(),
            SystemClock,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_request_produces_indication() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = NwkTask::spawn(coordinator(), tx);

        tokio_test::assert_ok!(
            handle
                .events
                .request(NwkRequest::NetworkFormation {
                    channels: 1 << 11,
                    pan_id: Some(PanId(0x4242)),
                })
                .await
        );

        let indication = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            indication,
            NwkIndication::FormationConfirm {
                status: NwkStatus::Success
            }
        );

        handle.shutdown.send(()).unwrap();
        let layer = handle.join.await.unwrap();
        assert!(layer.is_joined());
        assert_eq!(layer.nib().channel, 11);
    }

    #[tokio::test]
    async fn test_task_stops_when_senders_drop() {
        let handle = NwkTask::spawn(coordinator(), Vec::new());
        drop(handle.events);
        let layer = tokio::time::timeout(Duration::from_secs(1), handle.join)
            .await
            .unwrap()
            .unwrap();
        assert!(!layer.is_joined());
    }

    #[tokio::test]
    async fn test_send_after_stop_fails() {
        let handle = NwkTask::spawn(coordinator(), Vec::new());
        handle.shutdown.send(()).unwrap();
        handle.join.await.unwrap();
        tokio_test::assert_err!(handle.events.request(NwkRequest::StartRouter).await);
    }
}
