//! Sync session
//!
//! Runs the [`SyncController`] against a live [`TransportChannel`] and a
//! [`PlayerAdapter`]. A single task owns the controller and serializes every
//! input: channel frames, player notifications, drift checks and scheduled
//! starts. Player calls are awaited inline, so commands that pile up while
//! the player is busy are drained together and coalesced before the next
//! decision.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::LocalClock;
use crate::command::{self, ClientMessage, ControlCommand};
use crate::config::Config;
use crate::controller::{
    coalesce, DriftSample, PlaybackIntent, Plan, SyncController, SyncSettings, SyncState,
};
use crate::error::PlaybackError;
use crate::player::{PlayerAction, PlayerAdapter, PlayerEvent, PlayerSnapshot};
use crate::transport::{
    spawn_channel, ChannelConfig, ChannelEvent, ChannelSender, ConnectionState, TransportChannel,
};

/// Progress reported to the embedding UI
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Control channel state changed
    Connection { state: ConnectionState },
    /// A connection attempt failed
    ConnectFailed { error: String, retry_in_ms: u64 },
    /// Controller state changed
    StateChanged { state: SyncState },
    /// Target playback changed
    IntentChanged { intent: PlaybackIntent },
    /// Player calls that went through
    Applied { actions: Vec<PlayerAction> },
    /// Result of a drift check
    Drift { sample: DriftSample },
    /// An inbound frame could not be decoded and was dropped
    FrameRejected { reason: String },
    /// The player refused a correction twice
    Degraded { notice: String },
}

/// Handle to a running session
pub struct SessionHandle {
    events: mpsc::Receiver<SessionEvent>,
    state: watch::Receiver<SyncState>,
    client_id: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Next UI event; `None` after shutdown
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state.clone()
    }

    /// Identifier announced to the server in `hello`
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Request shutdown without waiting for it
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Shut down and wait until the session and its channel have stopped
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Session task ended abnormally: {}", e);
        }
    }
}

/// Entry point for running a sync session
pub struct SyncSession;

impl SyncSession {
    /// Connect to `url` and start following the server timeline
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        config: &Config,
        url: impl Into<String>,
        player: Arc<dyn PlayerAdapter>,
        clock: Arc<dyn LocalClock>,
    ) -> SessionHandle {
        let cancel = CancellationToken::new();
        let client_id = format!("cuesync-{}", &uuid::Uuid::new_v4().to_string()[..8]);

        let channel = spawn_channel(ChannelConfig::from_config(url, config), cancel.clone());

        let (player_tx, player_rx) = mpsc::unbounded_channel();
        player.on_state_changed(Box::new(move |event| {
            // Receiver is gone once the session stopped
            let _ = player_tx.send(event);
        }));

        let (event_tx, event_rx) = mpsc::channel(256);
        let (state_tx, state_rx) = watch::channel(SyncState::Idle);

        let controller = SyncController::new(SyncSettings::from_config(config))
            .with_rate_correction(player.supports_rate_correction());

        let period = config.drift_check_interval();
        let mut drift_timer = tokio::time::interval_at(Instant::now() + period, period);
        drift_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let writer = tokio::spawn(write_outbound(outbound_rx, channel.sender(), cancel.clone()));

        let runner = SessionLoop {
            controller,
            player,
            clock,
            outbound: outbound_tx,
            client_id: client_id.clone(),
            events: event_tx,
            state_tx,
            last_intent: None,
            drift_timer,
        };
        let task = tokio::spawn(runner.run(channel, writer, player_rx, cancel.clone()));

        SessionHandle {
            events: event_rx,
            state: state_rx,
            client_id,
            cancel,
            task,
        }
    }
}

struct SessionLoop {
    controller: SyncController,
    player: Arc<dyn PlayerAdapter>,
    clock: Arc<dyn LocalClock>,
    outbound: mpsc::Sender<ClientMessage>,
    client_id: String,
    events: mpsc::Sender<SessionEvent>,
    state_tx: watch::Sender<SyncState>,
    last_intent: Option<PlaybackIntent>,
    drift_timer: Interval,
}

impl SessionLoop {
    async fn run(
        mut self,
        mut channel: TransportChannel,
        writer: JoinHandle<()>,
        mut player_events: mpsc::UnboundedReceiver<PlayerEvent>,
        cancel: CancellationToken,
    ) {
        info!("Session {} started", self.client_id);
        let mut connection = channel.subscribe_state();

        loop {
            let following = self.controller.state() == SyncState::Following;
            let start_in = self.controller.scheduled_start().map(|at| {
                let wait = (at - self.clock.now_ms()).max(0);
                Duration::from_millis(wait as u64)
            });

            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                event = channel.receive() => {
                    let Some(event) = event else { break };
                    let mut batch = vec![event];
                    while let Some(more) = channel.try_receive() {
                        batch.push(more);
                    }
                    self.on_channel_events(batch).await;
                }

                Ok(()) = connection.changed() => {
                    let state = *connection.borrow_and_update();
                    self.emit(SessionEvent::Connection { state });
                }

                Some(event) = player_events.recv() => {
                    self.on_player_event(event).await;
                }

                _ = tokio::time::sleep(start_in.unwrap_or(Duration::ZERO)), if start_in.is_some() => {
                    let (now, snapshot) = self.observe().await;
                    let plan = self.controller.on_scheduled_start(now, &snapshot);
                    self.execute(plan).await;
                }

                _ = self.drift_timer.tick(), if following => {
                    let (now, snapshot) = self.observe().await;
                    let plan = self.controller.on_drift_check(now, &snapshot);
                    self.execute(plan).await;
                }
            }
        }

        self.controller.stop();
        self.publish();
        info!("Session {} stopped", self.client_id);

        cancel.cancel();
        if let Err(e) = writer.await {
            warn!("Outbound writer ended abnormally: {}", e);
        }
        channel.join().await;
    }

    /// Handle one burst of channel events in arrival order
    async fn on_channel_events(&mut self, batch: Vec<ChannelEvent>) {
        let mut commands = Vec::new();

        for event in batch {
            match event {
                ChannelEvent::Frame(frame) => match command::decode(&frame) {
                    Ok(command) => commands.push(command),
                    Err(e) => {
                        warn!("Dropping frame: {}", e);
                        self.emit(SessionEvent::FrameRejected {
                            reason: e.to_string(),
                        });
                    }
                },
                ChannelEvent::Connected { reconnect } => {
                    self.apply_commands(std::mem::take(&mut commands)).await;
                    if let Some(reason) = self.controller.on_connected(reconnect) {
                        self.post(vec![
                            ClientMessage::hello(&self.client_id),
                            ClientMessage::resync(&self.client_id, reason),
                        ]);
                    }
                }
                ChannelEvent::Closed { reason } => {
                    self.apply_commands(std::mem::take(&mut commands)).await;
                    info!("Control channel closed: {}", reason);
                    self.controller.on_disconnected();
                    self.publish();
                }
                ChannelEvent::ConnectFailed { error, retry_in } => {
                    self.emit(SessionEvent::ConnectFailed {
                        error: error.to_string(),
                        retry_in_ms: retry_in.as_millis() as u64,
                    });
                }
            }
        }

        self.apply_commands(commands).await;
    }

    async fn apply_commands(&mut self, commands: Vec<ControlCommand>) {
        if commands.is_empty() {
            return;
        }
        let received = commands.len();
        let commands = coalesce(commands);
        if commands.len() < received {
            debug!("Coalesced {} commands into {}", received, commands.len());
        }

        for command in commands {
            let (now, snapshot) = self.observe().await;
            let plan = self.controller.on_command(command, now, &snapshot);
            self.execute(plan).await;
        }
    }

    async fn on_player_event(&mut self, event: PlayerEvent) {
        match event {
            PlayerEvent::BufferingChanged { buffering } => {
                let (now, snapshot) = self.observe().await;
                let plan = self
                    .controller
                    .on_buffering_changed(buffering, now, &snapshot);
                self.execute(plan).await;
            }
            PlayerEvent::PlaybackChanged { playing } => {
                debug!("Player reports playing={}", playing);
            }
            PlayerEvent::Discontinuity { position_ms } => {
                debug!("Player jumped to {}ms, next drift check will correct", position_ms);
            }
        }
    }

    /// Current local time and player state for one decision
    async fn observe(&self) -> (i64, PlayerSnapshot) {
        let snapshot = PlayerSnapshot::capture(self.player.as_ref()).await;
        (self.clock.now_ms(), snapshot)
    }

    async fn execute(&mut self, plan: Plan) {
        if let Some(sample) = plan.drift {
            let clock = self.controller.clock(sample.sampled_at);
            self.emit(SessionEvent::Drift { sample });
            self.post(vec![ClientMessage::Telemetry {
                client_id: self.client_id.clone(),
                drift_ms: sample.drift_ms,
                offset_ms: clock.offset_ms,
                confidence: clock.confidence,
                state: self.controller.state().as_str().to_string(),
            }]);
        }

        if let Some(reason) = plan.resync {
            self.post(vec![ClientMessage::resync(&self.client_id, reason)]);
        }

        if !plan.actions.is_empty() {
            self.perform(plan.actions).await;
        }

        self.publish();
    }

    /// Run player actions, retrying the whole sequence once
    async fn perform(&mut self, actions: Vec<PlayerAction>) {
        match self.try_actions(&actions).await {
            Ok(()) => {
                self.emit(SessionEvent::Applied { actions });
                return;
            }
            Err(e) => warn!("Player rejected {:?}: {}, retrying once", actions, e),
        }

        match self.try_actions(&actions).await {
            Ok(()) => self.emit(SessionEvent::Applied { actions }),
            Err(e) => {
                error!("Player rejected {:?} again: {}", actions, e);
                self.emit(SessionEvent::Degraded {
                    notice: e.degraded_notice(),
                });
            }
        }
    }

    async fn try_actions(&self, actions: &[PlayerAction]) -> Result<(), PlaybackError> {
        for action in actions {
            action.apply(self.player.as_ref()).await?;
        }
        Ok(())
    }

    /// Queue messages for the server without blocking the loop
    fn post(&self, messages: Vec<ClientMessage>) {
        for message in messages {
            if let Err(e) = self.outbound.try_send(message) {
                debug!("Outbound queue unavailable, dropping message: {}", e);
            }
        }
    }

    /// Report state and intent changes made by the last decision
    fn publish(&mut self) {
        let state = self.controller.state();
        if *self.state_tx.borrow() != state {
            self.state_tx.send_replace(state);
            if state == SyncState::Following {
                self.drift_timer.reset();
            }
            self.emit(SessionEvent::StateChanged { state });
        }

        let intent = self.controller.intent().copied();
        if intent != self.last_intent {
            self.last_intent = intent;
            if let Some(intent) = intent {
                self.emit(SessionEvent::IntentChanged { intent });
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
            debug!("Event queue full, dropping {:?}", event);
        }
    }
}

/// Single writer for server-bound messages
///
/// Sends strictly in queue order and stops as soon as the session shuts down.
async fn write_outbound(
    mut messages: mpsc::Receiver<ClientMessage>,
    sender: ChannelSender,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = messages.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode {:?}: {}", message, e);
                continue;
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = sender.send(bytes) => {
                if let Err(e) = result {
                    debug!("Outbound message dropped: {}", e);
                }
            }
        }
    }
    debug!("Outbound writer stopped");
}
