//! Connection manager: owns the physical channel and its timers.
//!
//! ```text
//!  ConnectionManager (handle)                 driver task
//!  ─────────────────────────                 ───────────────────────────────
//!  open()/close() ── control (unbounded) ──► select! {
//!  send()         ── frames (bounded) ─────►   control, outbound frames,
//!                                              pending connect, channel events,
//!  status() ◄──────── watch ────────────────   reconnect sleep, heartbeat tick
//!                                            }
//!                                            └─► Lifecycle ─► actions ─► I/O
//! ```
//!
//! The driver task is the only owner of the channel, the reconnect `Sleep`
//! and the heartbeat `Interval`. Dropping them is how they are cancelled.

use std::future::pending;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior, Sleep};
use url::Url;

use crate::commands::Outbox;
use crate::config::CollabConfig;
use crate::lifecycle::{Action, ConnectionStatus, Lifecycle};
use crate::protocol::{Envelope, Heartbeat, Message};
use crate::target::SessionTarget;
use crate::transport::{Channel, ChannelEvent, CloseCode, Connector, TransportError};

/// Receives what arrives on the channel, on the driver task.
pub trait InboundSink: Send + 'static {
    fn on_frame(&mut self, frame: &str);

    /// The channel that carried the current presence is gone.
    fn on_channel_reset(&mut self);
}

enum Control {
    Open,
    Close {
        reason: String,
        ack: Option<oneshot::Sender<()>>,
    },
}

/// An encoded frame tagged with the channel generation it was sent for.
struct Outbound {
    generation: u64,
    frame: String,
}

/// Handle to a connection driver task.
///
/// Dropping the handle closes the channel with a normal closure and ends
/// the task.
pub struct ConnectionManager {
    control: mpsc::UnboundedSender<Control>,
    outbound: mpsc::Sender<Outbound>,
    status: watch::Receiver<ConnectionStatus>,
    generation: Arc<AtomicU64>,
    exhausted: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Start the driver task. No connection is attempted until [`open`](Self::open).
    pub fn spawn<C, S>(connector: C, url: Url, target: SessionTarget, config: &CollabConfig, sink: S) -> Self
    where
        C: Connector,
        S: InboundSink,
    {
        let lifecycle = Lifecycle::new(config.reconnect.clone());
        let (status_tx, status_rx) = watch::channel(lifecycle.status());
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let generation = Arc::new(AtomicU64::new(0));
        let exhausted = Arc::new(AtomicBool::new(false));

        let driver = Driver {
            connector: Arc::new(connector),
            url,
            target,
            lifecycle,
            heartbeat_period: config.heartbeat_interval(),
            sink,
            status: status_tx,
            generation: generation.clone(),
            exhausted: exhausted.clone(),
            current: None,
            channel: None,
            connecting: None,
            reconnect: None,
            heartbeat: None,
        };
        let task = tokio::spawn(driver.run(control_rx, outbound_rx));

        Self {
            control: control_tx,
            outbound: outbound_tx,
            status: status_rx,
            generation,
            exhausted,
            task: Some(task),
        }
    }

    /// Connect unless connected or already connecting.
    pub fn open(&self) {
        if self.control.send(Control::Open).is_err() {
            log::debug!("open() after the connection task ended");
        }
    }

    /// Close with a normal closure and cancel all timers. Resolves once the
    /// driver has acted on it. Idempotent.
    pub async fn close(&self, reason: &str) {
        let (ack_tx, ack_rx) = oneshot::channel();
        let control = Control::Close {
            reason: reason.to_owned(),
            ack: Some(ack_tx),
        };
        if self.control.send(control).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Fire-and-forget variant of [`close`](Self::close), usable from `Drop`.
    pub fn request_close(&self, reason: &str) {
        let _ = self.control.send(Control::Close {
            reason: reason.to_owned(),
            ack: None,
        });
    }

    /// Send one envelope. Returns `true` only if connected and the frame was
    /// handed to the channel writer. Nothing is queued for a later channel.
    pub fn send(&self, mut envelope: Envelope) -> bool {
        if *self.status.borrow() != ConnectionStatus::Connected {
            return false;
        }
        let generation = self.generation.load(Ordering::SeqCst);
        envelope.stamp();
        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Not sending envelope: {}", e);
                return false;
            }
        };
        match self.outbound.try_send(Outbound { generation, frame }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Outbound buffer full, dropping {} envelope", envelope.kind());
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// True while the client has stopped retrying after too many consecutive
    /// failures. Only [`open`](Self::open) starts it again.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    /// Close and wait for the driver task to finish.
    pub async fn shutdown(mut self, reason: &str) {
        self.close(reason).await;
        if let Some(task) = self.task.take() {
            // Dropping self closes the control channel, which ends the loop.
            drop(self);
            if let Err(e) = task.await {
                log::error!("Connection task failed: {}", e);
            }
        }
    }
}

impl Outbox for ConnectionManager {
    fn send(&self, envelope: Envelope) -> bool {
        ConnectionManager::send(self, envelope)
    }
}

// ───────────────────────────────────────────────────────────────────
// Driver
// ───────────────────────────────────────────────────────────────────

struct Driver<C: Connector, S> {
    connector: Arc<C>,
    url: Url,
    target: SessionTarget,
    lifecycle: Lifecycle,
    heartbeat_period: Duration,
    sink: S,
    status: watch::Sender<ConnectionStatus>,
    /// Last generation handed out; shared with `send()`
    generation: Arc<AtomicU64>,
    exhausted: Arc<AtomicBool>,
    /// Generation of the open channel, if any
    current: Option<u64>,
    channel: Option<C::Channel>,
    connecting: Option<BoxFuture<'static, Result<C::Channel, TransportError>>>,
    reconnect: Option<Pin<Box<Sleep>>>,
    heartbeat: Option<Interval>,
}

impl<C: Connector, S: InboundSink> Driver<C, S> {
    async fn run(mut self, mut control: mpsc::UnboundedReceiver<Control>, mut outbound: mpsc::Receiver<Outbound>) {
        loop {
            tokio::select! {
                msg = control.recv() => match msg {
                    Some(Control::Open) => {
                        let actions = self.lifecycle.open();
                        self.apply(actions).await;
                    }
                    Some(Control::Close { reason, ack }) => {
                        let actions = self.lifecycle.close(&reason);
                        if !actions.is_empty() {
                            log::info!("Closing collaboration channel: {}", reason);
                        }
                        self.apply(actions).await;
                        self.publish_status();
                        if let Some(ack) = ack {
                            let _ = ack.send(());
                        }
                    }
                    None => {
                        let actions = self.lifecycle.close("user initiated");
                        self.apply(actions).await;
                        self.publish_status();
                        break;
                    }
                },
                Some(out) = outbound.recv() => self.write_outbound(out).await,
                result = wait_connect(&mut self.connecting), if self.connecting.is_some() => {
                    self.connecting = None;
                    self.on_connect_result(result).await;
                }
                event = wait_event(&mut self.channel), if self.channel.is_some() => {
                    self.on_channel_event(event).await;
                }
                _ = wait_sleep(&mut self.reconnect), if self.reconnect.is_some() => {
                    self.reconnect = None;
                    let actions = self.lifecycle.reconnect_due();
                    self.apply(actions).await;
                }
                _ = wait_tick(&mut self.heartbeat), if self.heartbeat.is_some() => {
                    let actions = self.lifecycle.heartbeat_due();
                    self.apply(actions).await;
                }
            }
            self.publish_status();
        }
        log::debug!("Connection task for {} finished", self.url);
    }

    async fn on_connect_result(&mut self, result: Result<C::Channel, TransportError>) {
        match result {
            Ok(channel) => {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                self.channel = Some(channel);
                self.current = Some(generation);
                log::info!("Connected to {}", self.url);
                let actions = self.lifecycle.channel_opened();
                self.apply(actions).await;
            }
            Err(e) => {
                log::warn!("{}", e);
                self.lifecycle.channel_error();
                let actions = self.lifecycle.channel_closed(CloseCode::ABNORMAL);
                self.apply(actions).await;
            }
        }
    }

    async fn on_channel_event(&mut self, event: Option<ChannelEvent>) {
        match event {
            Some(ChannelEvent::Frame(frame)) => self.sink.on_frame(&frame),
            Some(ChannelEvent::Error(e)) => {
                log::warn!("Channel error: {}", e);
                let actions = self.lifecycle.channel_error();
                self.apply(actions).await;
            }
            Some(ChannelEvent::Closed { code, reason }) => self.on_closed(code, &reason).await,
            None => self.on_closed(CloseCode::ABNORMAL, "channel ended").await,
        }
    }

    async fn on_closed(&mut self, code: CloseCode, reason: &str) {
        self.retire_channel();
        if code.is_normal() {
            log::info!("Channel closed by authority: {}", reason);
        } else {
            log::warn!("Channel closed abnormally ({}): {}", code, reason);
        }
        let actions = self.lifecycle.channel_closed(code);
        self.apply(actions).await;
    }

    async fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Connect => {
                    log::info!("Connecting to {}", self.url);
                    let connector = self.connector.clone();
                    let url = self.url.clone();
                    self.connecting = Some(Box::pin(async move { connector.connect(&url).await }));
                }
                Action::AbortConnect => self.connecting = None,
                Action::ScheduleReconnect(delay) => {
                    log::warn!(
                        "Reconnecting in {} ms (consecutive failures: {})",
                        delay.as_millis(),
                        self.lifecycle.failures()
                    );
                    self.reconnect = Some(Box::pin(sleep(delay)));
                }
                Action::CancelReconnect => self.reconnect = None,
                Action::StartHeartbeat => {
                    let period = self.heartbeat_period;
                    let mut heartbeat = interval_at(Instant::now() + period, period);
                    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    self.heartbeat = Some(heartbeat);
                }
                Action::StopHeartbeat => self.heartbeat = None,
                Action::SendHeartbeat => {
                    self.send_own(Message::Heartbeat(Heartbeat::default())).await;
                }
                Action::RequestSync => {
                    let request = self.target.sync_request();
                    self.send_own(Message::SyncRequest(request)).await;
                }
                Action::CloseChannel { code, reason } => {
                    if let Some(mut channel) = self.channel.take() {
                        if let Err(e) = channel.close(code, reason).await {
                            log::debug!("Error while closing channel: {}", e);
                        }
                    }
                    self.retire_channel();
                }
                Action::ResetPresence => self.sink.on_channel_reset(),
            }
        }
    }

    /// Frames the driver originates itself (heartbeat, sync request).
    async fn send_own(&mut self, message: Message) {
        let Some(channel) = self.channel.as_mut() else {
            return;
        };
        let mut envelope = Envelope::new(self.target.actor_id.clone(), message);
        envelope.stamp();
        match envelope.encode() {
            Ok(frame) => {
                if let Err(e) = channel.send(frame).await {
                    log::warn!("Failed to send {}: {}", envelope.kind(), e);
                }
            }
            Err(e) => log::warn!("{}", e),
        }
    }

    async fn write_outbound(&mut self, out: Outbound) {
        if self.current != Some(out.generation) {
            log::debug!("Dropping frame queued for a previous channel");
            return;
        }
        if let Some(channel) = self.channel.as_mut() {
            if let Err(e) = channel.send(out.frame).await {
                log::warn!("{}", e);
            }
        }
    }

    fn retire_channel(&mut self) {
        self.channel = None;
        if self.current.take().is_some() {
            // Frames tagged for the retired channel can no longer match.
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn publish_status(&mut self) {
        let next = self.lifecycle.status();
        // Stored before the status so a watcher that sees `Error` also sees this.
        self.exhausted.store(self.lifecycle.is_exhausted(), Ordering::SeqCst);
        let changed = self.status.send_if_modified(|status| {
            if *status == next {
                false
            } else {
                *status = next;
                true
            }
        });
        if changed {
            if next == ConnectionStatus::Error && self.lifecycle.is_exhausted() {
                log::error!(
                    "Giving up on {} after {} consecutive failures",
                    self.url,
                    self.lifecycle.failures()
                );
            } else {
                log::debug!("Connection status: {}", next);
            }
        }
    }
}

async fn wait_connect<T>(pending_connect: &mut Option<BoxFuture<'static, T>>) -> T {
    match pending_connect {
        Some(connect) => connect.await,
        None => pending().await,
    }
}

async fn wait_event<Ch: Channel>(channel: &mut Option<Ch>) -> Option<ChannelEvent> {
    match channel {
        Some(channel) => channel.next_event().await,
        None => pending().await,
    }
}

async fn wait_sleep(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => pending().await,
    }
}

async fn wait_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(heartbeat) => {
            heartbeat.tick().await;
        }
        None => pending().await,
    }
}
