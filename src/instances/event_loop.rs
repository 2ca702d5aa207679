//! Per-instance task turning transport events into status transitions.
//!
//! The loop is the single writer of its instance's status. Timers for the
//! reconnect backoff and the forced-ready heuristics run as side tasks that
//! report back through a signal channel, so every transition still happens
//! here, in arrival order.

use super::instance::Instance;
use super::status::{LoadingTracker, ReadySource, ReadyWatchPolicy, StatusTrigger};
use super::types::InstanceStatus;
use super::InboundSink;
use crate::transport::{RawMessage, TransportEvent, STATE_CONNECTED};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const INBOUND_BUFFER: usize = 256;

#[derive(Debug)]
enum Signal {
    /// `auth_epoch` ties the signal to one authentication
    ForceReady { source: ReadySource, auth_epoch: u64 },
    Reinitialize,
    InitializeFailed(String),
}

struct EventLoop {
    instance: Arc<Instance>,
    policy: ReadyWatchPolicy,
    signals: mpsc::UnboundedSender<Signal>,
    inbound: mpsc::Sender<RawMessage>,
    cancel: CancellationToken,
    loading: LoadingTracker,
    auth_epoch: u64,
}

/// Start the event loop and the inbound worker, then initialize the client.
pub(crate) fn spawn(
    instance: Arc<Instance>,
    events: mpsc::Receiver<TransportEvent>,
    sink: InboundSink,
    policy: ReadyWatchPolicy,
) -> JoinHandle<()> {
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
    tokio::spawn(run_inbound(
        instance.identity().to_string(),
        inbound_rx,
        sink,
    ));

    let (signals_tx, signals_rx) = mpsc::unbounded_channel();
    let cancel = instance.cancel_token();
    let event_loop = EventLoop {
        instance,
        policy,
        signals: signals_tx,
        inbound: inbound_tx,
        cancel,
        loading: LoadingTracker::default(),
        auth_epoch: 0,
    };
    tokio::spawn(event_loop.run(events, signals_rx))
}

impl EventLoop {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<TransportEvent>,
        mut signals: mpsc::UnboundedReceiver<Signal>,
    ) {
        let cancel = self.cancel.clone();
        self.spawn_initialize();

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.on_event(event).await,
                    None => {
                        tracing::warn!(
                            "Instance {}: transport event stream closed",
                            self.instance.identity()
                        );
                        self.instance
                            .apply(&StatusTrigger::Disconnected("event stream closed".into()));
                        break;
                    }
                },
                Some(signal) = signals.recv() => self.on_signal(signal),
            }
        }
        tracing::debug!("Instance {}: event loop stopped", self.instance.identity());
    }

    async fn on_event(&mut self, event: TransportEvent) {
        let identity = self.instance.identity().to_string();
        tracing::debug!("Instance {identity}: event {}", event.name());

        match event {
            TransportEvent::Qr(code) => {
                if self.instance.apply(&StatusTrigger::Qr(code)).is_some() {
                    tracing::info!("Instance {identity}: auth challenge received");
                }
            }
            TransportEvent::Authenticated => {
                if self.instance.apply(&StatusTrigger::Authenticated).is_some() {
                    self.loading.reset();
                    self.auth_epoch += 1;
                    self.spawn_ready_poll();
                }
            }
            TransportEvent::Ready => {
                self.instance.apply(&StatusTrigger::Ready);
                self.loading.reset();
            }
            TransportEvent::Disconnected(reason) => {
                tracing::warn!("Instance {identity}: disconnected ({reason})");
                self.loading.reset();
                if self
                    .instance
                    .apply(&StatusTrigger::Disconnected(reason))
                    .is_some()
                {
                    self.spawn_reinitialize();
                }
            }
            TransportEvent::LoadingProgress { percent, message } => {
                self.instance.touch();
                tracing::debug!("Instance {identity}: loading {percent}% {message}");
                if self.loading.observe(
                    self.instance.status(),
                    percent,
                    self.policy.loading_complete_threshold,
                ) {
                    self.spawn_loading_confirm();
                }
            }
            TransportEvent::Message(raw) => {
                self.instance.touch();
                if self.inbound.send(raw).await.is_err() {
                    tracing::debug!("Instance {identity}: inbound worker gone, message dropped");
                }
            }
        }
    }

    fn on_signal(&mut self, signal: Signal) {
        let identity = self.instance.identity().to_string();
        match signal {
            Signal::ForceReady { source, auth_epoch } => {
                if auth_epoch != self.auth_epoch {
                    return;
                }
                if self
                    .instance
                    .apply(&StatusTrigger::ForcedReady(source))
                    .is_some()
                {
                    tracing::warn!(
                        "Instance {identity}: no ready event after authentication, forcing ready ({})",
                        source.as_str()
                    );
                    self.loading.reset();
                }
            }
            Signal::Reinitialize => {
                if self.instance.apply(&StatusTrigger::Reinitializing).is_some() {
                    tracing::info!("Instance {identity}: re-initializing after disconnect");
                    self.spawn_initialize();
                }
            }
            Signal::InitializeFailed(error) => {
                tracing::error!("Instance {identity}: initialize failed: {error}");
                self.instance.apply(&StatusTrigger::InitializeFailed(error));
            }
        }
    }

    fn spawn_initialize(&self) {
        let client = self.instance.client();
        let signals = self.signals.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                () = cancel.cancelled() => return,
                result = client.initialize() => result,
            };
            if let Err(e) = result {
                let _ = signals.send(Signal::InitializeFailed(format!("{e:#}")));
            }
        });
    }

    fn spawn_reinitialize(&self) {
        let backoff = self.policy.disconnect_backoff;
        let signals = self.signals.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(backoff) => {
                    let _ = signals.send(Signal::Reinitialize);
                }
            }
        });
    }

    /// Poll the transport's own state when `ready` is late.
    fn spawn_ready_poll(&self) {
        let instance = self.instance.clone();
        let policy = self.policy.clone();
        let signals = self.signals.clone();
        let cancel = self.cancel.clone();
        let auth_epoch = self.auth_epoch;

        tokio::spawn(async move {
            let poll = async {
                tokio::time::sleep(policy.ready_grace).await;
                for attempt in 1..=policy.poll_attempts {
                    if instance.status() != InstanceStatus::Authenticated {
                        return;
                    }
                    match instance.client().get_state().await {
                        Ok(state) if state == STATE_CONNECTED => {
                            let _ = signals.send(Signal::ForceReady {
                                source: ReadySource::StatePoll,
                                auth_epoch,
                            });
                            return;
                        }
                        Ok(state) => tracing::debug!(
                            "Instance {}: state poll {attempt}/{} reports {state}",
                            instance.identity(),
                            policy.poll_attempts
                        ),
                        Err(e) => tracing::debug!(
                            "Instance {}: state poll {attempt} failed: {e}",
                            instance.identity()
                        ),
                    }
                    if attempt < policy.poll_attempts {
                        tokio::time::sleep(policy.poll_interval).await;
                    }
                }
                if instance.status() == InstanceStatus::Authenticated {
                    tracing::warn!(
                        "Instance {}: still not ready after {} state polls",
                        instance.identity(),
                        policy.poll_attempts
                    );
                }
            };
            tokio::select! {
                () = cancel.cancelled() => {}
                () = poll => {}
            }
        });
    }

    fn spawn_loading_confirm(&self) {
        let delay = self.policy.loading_confirm_delay;
        let signals = self.signals.clone();
        let cancel = self.cancel.clone();
        let auth_epoch = self.auth_epoch;
        tracing::info!(
            "Instance {}: loading reported complete without ready, confirming in {delay:?}",
            self.instance.identity()
        );
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let _ = signals.send(Signal::ForceReady {
                        source: ReadySource::LoadingComplete,
                        auth_epoch,
                    });
                }
            }
        });
    }
}

/// Hands inbound messages to the handler one at a time, in arrival order.
/// Ends once the event loop drops its sender and the queue is drained.
async fn run_inbound(identity: String, mut rx: mpsc::Receiver<RawMessage>, sink: InboundSink) {
    while let Some(raw) = rx.recv().await {
        let handler = sink.read().as_ref().and_then(std::sync::Weak::upgrade);
        match handler {
            Some(handler) => handler.handle_inbound(&identity, raw).await,
            None => tracing::debug!("Instance {identity}: no inbound handler, message dropped"),
        }
    }
}
