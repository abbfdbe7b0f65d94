//! Sync controller
//!
//! The state machine that decides what the player should do. It never touches
//! the player or the socket itself: every input comes with the local time and
//! a [`PlayerSnapshot`], and every decision comes back as a [`Plan`] that the
//! session loop executes. That keeps one owner for all sync state and makes
//! every rule testable with plain numbers.
//!
//! ```text
//!   Idle ──command + confident clock──▶ Following ◀──fresh command──┐
//!                                         │                         │
//!                          disconnect / stale clock ──────────▶ Resyncing
//!   (any) ──shutdown──▶ Stopped
//! ```

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::{ClockOffset, EstimatorSettings, TimelineEstimator};
use crate::command::{ControlCommand, ResyncReason};
use crate::config::Config;
use crate::player::{PlayerAction, PlayerSnapshot};

/// Controller lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// No command applied yet
    Idle,
    /// Tracking the server timeline
    Following,
    /// Waiting for fresh server state before touching the player again
    Resyncing,
    /// Shut down; terminal
    Stopped,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Following => "following",
            SyncState::Resyncing => "resyncing",
            SyncState::Stopped => "stopped",
        }
    }
}

/// Where the player should be
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PlaybackIntent {
    pub playing: bool,
    pub rate: f64,
    /// Media position at `anchor_server_ms`
    pub position_ms: i64,
    /// Server time at which `position_ms` holds
    pub anchor_server_ms: i64,
}

impl PlaybackIntent {
    /// Media position the intent implies at a server time
    ///
    /// Before the anchor (a scheduled start) the position holds still.
    pub fn position_at(&self, server_ms: f64) -> i64 {
        if !self.playing {
            return self.position_ms;
        }
        let elapsed = (server_ms - self.anchor_server_ms as f64).max(0.0);
        self.position_ms + (elapsed * self.rate).round() as i64
    }
}

/// Player position versus where it should be, at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DriftSample {
    /// Local time of the sample
    pub sampled_at: i64,
    pub actual_ms: i64,
    pub expected_ms: i64,
    /// `actual - expected`; positive means the player is ahead
    pub drift_ms: i64,
}

impl DriftSample {
    fn new(sampled_at: i64, actual_ms: i64, expected_ms: i64) -> Self {
        Self {
            sampled_at,
            actual_ms,
            expected_ms,
            drift_ms: actual_ms - expected_ms,
        }
    }
}

/// What the session loop should do after one controller input
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    /// Player calls, in order
    pub actions: Vec<PlayerAction>,
    /// Drift measured by a drift check
    pub drift: Option<DriftSample>,
    /// Ask the server for a full state snapshot
    pub resync: Option<ResyncReason>,
}

impl Plan {
    fn actions(actions: Vec<PlayerAction>) -> Self {
        Self {
            actions,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.drift.is_none() && self.resync.is_none()
    }
}

/// Controller tuning
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncSettings {
    /// Drift beyond this is corrected by seeking
    pub drift_tolerance_ms: i64,
    /// Clock confidence needed before acting
    pub min_clock_confidence: f64,
    /// Largest deviation of the playback rate from the intent's rate
    pub max_rate_adjustment: f64,
    /// Drift the rate nudge aims to absorb over this much playback
    pub rate_correction_window_ms: i64,
    pub estimator: EstimatorSettings,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            drift_tolerance_ms: 300,
            min_clock_confidence: 0.5,
            max_rate_adjustment: 0.05,
            rate_correction_window_ms: 8_000,
            estimator: EstimatorSettings::default(),
        }
    }
}

impl SyncSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            drift_tolerance_ms: config.drift_tolerance_ms as i64,
            min_clock_confidence: config.min_clock_confidence,
            max_rate_adjustment: config.max_rate_adjustment,
            rate_correction_window_ms: (config.drift_check_interval_ms as i64 * 4).max(1),
            estimator: EstimatorSettings {
                smoothing_factor: config.smoothing_factor,
                warmup_samples: config.clock_warmup_samples,
                staleness_ms: config.heartbeat_staleness_ms as i64,
            },
        }
    }
}

/// The synchronization state machine
#[derive(Debug, Clone)]
pub struct SyncController {
    settings: SyncSettings,
    state: SyncState,
    estimator: TimelineEstimator,
    intent: Option<PlaybackIntent>,
    /// Reference time of the newest command taken into account
    last_reference: Option<i64>,
    /// Command waiting for clock confidence
    held: Option<ControlCommand>,
    /// Local time at which a future `play` has to start the player
    scheduled_start: Option<i64>,
    /// A drift check hit buffering; correct once it clears
    correction_queued: bool,
    rate_correction: bool,
    connected: bool,
}

impl SyncController {
    pub fn new(settings: SyncSettings) -> Self {
        Self {
            settings,
            state: SyncState::Idle,
            estimator: TimelineEstimator::new(settings.estimator),
            intent: None,
            last_reference: None,
            held: None,
            scheduled_start: None,
            correction_queued: false,
            rate_correction: false,
            connected: false,
        }
    }

    /// Allow fine drift correction through the playback rate
    pub fn with_rate_correction(mut self, enabled: bool) -> Self {
        self.rate_correction = enabled;
        self
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn intent(&self) -> Option<&PlaybackIntent> {
        self.intent.as_ref()
    }

    pub fn clock(&self, now: i64) -> ClockOffset {
        self.estimator.estimate(now)
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Local time at which a pending `play` must start, if any
    pub fn scheduled_start(&self) -> Option<i64> {
        self.scheduled_start
    }

    pub fn has_queued_correction(&self) -> bool {
        self.correction_queued
    }

    /// The channel (re)connected; returns the resync request to send
    pub fn on_connected(&mut self, reconnect: bool) -> Option<ResyncReason> {
        if self.state == SyncState::Stopped {
            return None;
        }
        self.connected = true;
        Some(if reconnect {
            ResyncReason::Reconnected
        } else {
            ResyncReason::Connected
        })
    }

    /// The channel dropped
    pub fn on_disconnected(&mut self) {
        self.connected = false;
        // Anything held was sent against the old connection's state
        self.held = None;
        if self.state == SyncState::Following {
            self.enter_resyncing("control channel dropped");
        }
    }

    /// Feed one decoded command
    pub fn on_command(
        &mut self,
        command: ControlCommand,
        now: i64,
        player: &PlayerSnapshot,
    ) -> Plan {
        if self.state == SyncState::Stopped {
            return Plan::default();
        }

        if let ControlCommand::Heartbeat { reference_time } = command {
            return self.on_heartbeat(reference_time, now, player);
        }

        let reference = command.reference_time();
        let newest = self
            .last_reference
            .max(self.held.map(|held| held.reference_time()));
        if newest.map_or(false, |newest| reference < newest) {
            debug!(
                "Discarding stale {} (reference {} < {:?})",
                command.name(),
                reference,
                newest
            );
            return Plan::default();
        }

        match self.state {
            SyncState::Following => self.apply(command, now, player),
            SyncState::Idle | SyncState::Resyncing => {
                if self.confident(now) {
                    self.transition(SyncState::Following);
                    self.apply(command, now, player)
                } else {
                    debug!(
                        "Holding {} until the clock estimate is trustworthy",
                        command.name()
                    );
                    self.held = Some(match self.held {
                        Some(held) => carry_seek(held, command),
                        None => command,
                    });
                    Plan::default()
                }
            }
            SyncState::Stopped => Plan::default(),
        }
    }

    fn on_heartbeat(&mut self, reference_time: i64, now: i64, player: &PlayerSnapshot) -> Plan {
        let offset = self.estimator.observe(reference_time, now);
        debug!(
            "Heartbeat: offset={:.1}ms jitter={:.1}ms confidence={:.2}",
            offset.offset_ms,
            offset.jitter_ms(),
            offset.confidence
        );

        let promote = matches!(self.state, SyncState::Idle | SyncState::Resyncing)
            && self.held.is_some()
            && offset.is_confident(self.settings.min_clock_confidence);
        if !promote {
            return Plan::default();
        }

        match self.held.take() {
            Some(held) => {
                self.transition(SyncState::Following);
                self.apply(held, now, player)
            }
            None => Plan::default(),
        }
    }

    /// Periodic comparison of the player against the intent
    pub fn on_drift_check(&mut self, now: i64, player: &PlayerSnapshot) -> Plan {
        if self.state != SyncState::Following {
            return Plan::default();
        }

        let offset = match self
            .estimator
            .require_confidence(now, self.settings.min_clock_confidence)
        {
            Ok(offset) => offset,
            Err(stale) => {
                warn!("Suspending correction: {}", stale);
                self.enter_resyncing("clock estimate went stale");
                return Plan {
                    resync: Some(ResyncReason::Clock),
                    ..Plan::default()
                };
            }
        };

        let Some(intent) = self.intent else {
            return Plan::default();
        };
        if self.scheduled_start.is_some() {
            return Plan::default();
        }

        let expected = intent.position_at(offset.server_time_at(now));
        let sample = DriftSample::new(now, player.position_ms, expected);

        if player.buffering {
            if sample.drift_ms.abs() > self.settings.drift_tolerance_ms {
                debug!(
                    "Player buffering, deferring correction of {}ms drift",
                    sample.drift_ms
                );
            }
            self.correction_queued = true;
            return Plan {
                drift: Some(sample),
                ..Plan::default()
            };
        }

        Plan {
            actions: self.correction(&intent, &sample, player),
            drift: Some(sample),
            resync: None,
        }
    }

    /// Buffering state of the player changed
    pub fn on_buffering_changed(
        &mut self,
        buffering: bool,
        now: i64,
        player: &PlayerSnapshot,
    ) -> Plan {
        if buffering || !std::mem::take(&mut self.correction_queued) {
            return Plan::default();
        }
        debug!("Buffering cleared, applying deferred correction");
        self.on_drift_check(now, player)
    }

    /// The scheduled start time of a future `play` has been reached
    pub fn on_scheduled_start(&mut self, now: i64, player: &PlayerSnapshot) -> Plan {
        match self.scheduled_start {
            Some(at) if at <= now && self.state == SyncState::Following => {}
            _ => return Plan::default(),
        }
        self.scheduled_start = None;

        let Some(intent) = self.intent else {
            return Plan::default();
        };
        let offset = self.estimator.estimate(now);
        let target = intent.position_at(offset.server_time_at(now));
        Plan::actions(self.seek_then(target, player, PlayerAction::Play))
    }

    /// Explicit shutdown
    pub fn stop(&mut self) {
        self.transition(SyncState::Stopped);
        self.held = None;
        self.scheduled_start = None;
        self.correction_queued = false;
    }

    fn apply(&mut self, command: ControlCommand, now: i64, player: &PlayerSnapshot) -> Plan {
        let offset = self.estimator.estimate(now);
        let server_now = offset.server_time_at(now);
        self.last_reference = Some(command.reference_time());
        self.held = None;

        let actions = match command {
            ControlCommand::Play {
                position,
                reference_time,
            } => {
                let intent = PlaybackIntent {
                    playing: true,
                    rate: 1.0,
                    position_ms: position,
                    anchor_server_ms: reference_time,
                };
                self.intent = Some(intent);

                if (reference_time as f64) > server_now {
                    // Start lies in the future: park at the position and wait
                    let start_at = offset.local_time_at(reference_time);
                    self.scheduled_start = Some(start_at);
                    info!("Play scheduled at local time {} from {}ms", start_at, position);
                    let mut actions = Vec::new();
                    if (player.position_ms - position).abs() > self.settings.drift_tolerance_ms {
                        actions.push(PlayerAction::Seek(position));
                    }
                    if player.playing {
                        actions.push(PlayerAction::Pause);
                    }
                    actions
                } else {
                    self.scheduled_start = None;
                    let target = intent.position_at(server_now);
                    self.seek_then(target, player, PlayerAction::Play)
                }
            }

            ControlCommand::Pause {
                position,
                reference_time,
            } => {
                let position = position.unwrap_or_else(|| {
                    self.intent
                        .map(|intent| intent.position_at(reference_time as f64))
                        .unwrap_or(player.position_ms)
                });
                self.intent = Some(PlaybackIntent {
                    playing: false,
                    rate: 1.0,
                    position_ms: position,
                    anchor_server_ms: reference_time,
                });
                self.scheduled_start = None;
                self.seek_then(position, player, PlayerAction::Pause)
            }

            ControlCommand::Seek {
                position,
                reference_time,
            } => {
                let playing = self
                    .intent
                    .map(|intent| intent.playing)
                    .unwrap_or(player.playing);
                let rate = self.intent.map(|intent| intent.rate).unwrap_or(1.0);
                let intent = PlaybackIntent {
                    playing,
                    rate,
                    position_ms: position,
                    anchor_server_ms: reference_time,
                };
                self.intent = Some(intent);
                vec![PlayerAction::Seek(intent.position_at(server_now))]
            }

            ControlCommand::Heartbeat { .. } => Vec::new(),
        };

        debug!(
            "Applied {} -> {:?} (intent {:?})",
            command.name(),
            actions,
            self.intent
        );
        Plan::actions(actions)
    }

    /// `[seek(target)?, then]`: seek only when the player is off by more than
    /// the tolerance, or when starting playback from a paused player
    fn seek_then(
        &self,
        target: i64,
        player: &PlayerSnapshot,
        then: PlayerAction,
    ) -> Vec<PlayerAction> {
        let off = (player.position_ms - target).abs() > self.settings.drift_tolerance_ms;
        let starting = then == PlayerAction::Play && !player.playing;
        if off || starting {
            vec![PlayerAction::Seek(target), then]
        } else {
            vec![then]
        }
    }

    /// Soft correction for one drift sample; never changes play/pause state
    fn correction(
        &self,
        intent: &PlaybackIntent,
        sample: &DriftSample,
        player: &PlayerSnapshot,
    ) -> Vec<PlayerAction> {
        let tolerance = self.settings.drift_tolerance_ms;
        let rate_off = (player.rate - intent.rate).abs() > 1e-6;

        if sample.drift_ms.abs() > tolerance {
            info!(
                "Drift {}ms exceeds {}ms, seeking to {}ms",
                sample.drift_ms, tolerance, sample.expected_ms
            );
            let mut actions = vec![PlayerAction::Seek(sample.expected_ms)];
            if self.rate_correction && rate_off {
                actions.push(PlayerAction::SetRate(intent.rate));
            }
            return actions;
        }

        if !self.rate_correction || !intent.playing || !player.playing {
            return Vec::new();
        }

        if sample.drift_ms.abs() <= tolerance / 4 {
            return if rate_off {
                vec![PlayerAction::SetRate(intent.rate)]
            } else {
                Vec::new()
            };
        }

        let max = self.settings.max_rate_adjustment;
        let window = self.settings.rate_correction_window_ms.max(1) as f64;
        let adjustment = (sample.drift_ms as f64 / window).clamp(-max, max);
        vec![PlayerAction::SetRate(intent.rate * (1.0 - adjustment))]
    }

    fn confident(&self, now: i64) -> bool {
        self.estimator
            .estimate(now)
            .is_confident(self.settings.min_clock_confidence)
    }

    fn enter_resyncing(&mut self, why: &str) {
        info!("Resyncing: {}", why);
        self.transition(SyncState::Resyncing);
        self.held = None;
        self.scheduled_start = None;
        self.correction_queued = false;
    }

    fn transition(&mut self, next: SyncState) {
        if self.state != next {
            info!("Sync {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

/// Collapse a burst of commands that arrived while the player was busy
///
/// Heartbeats are all kept, in place. Of the playback commands only the
/// newest by reference time survives (the later arrival wins a tie), at its
/// original position, so nothing is reordered. A surviving seek takes over
/// the play/pause state of the newest play or pause it displaced.
pub fn coalesce(commands: Vec<ControlCommand>) -> Vec<ControlCommand> {
    let newest = newest_index(&commands, |command| !command.is_heartbeat());
    let base = match newest.map(|index| commands[index]) {
        Some(ControlCommand::Seek { .. }) => newest_index(&commands, |command| {
            matches!(
                command,
                ControlCommand::Play { .. } | ControlCommand::Pause { .. }
            )
        }),
        _ => None,
    }
    .map(|index| commands[index]);

    commands
        .into_iter()
        .enumerate()
        .filter(|(index, command)| command.is_heartbeat() || Some(*index) == newest)
        .map(|(_, command)| match base {
            Some(base) if !command.is_heartbeat() => carry_seek(base, command),
            _ => command,
        })
        .collect()
}

fn newest_index(
    commands: &[ControlCommand],
    keep: impl Fn(&ControlCommand) -> bool,
) -> Option<usize> {
    commands
        .iter()
        .enumerate()
        .filter(|(_, command)| keep(command))
        .max_by_key(|(index, command)| (command.reference_time(), *index))
        .map(|(index, _)| index)
}

/// A seek on top of a play or pause, folded into one command
fn carry_seek(base: ControlCommand, next: ControlCommand) -> ControlCommand {
    match (base, next) {
        (
            ControlCommand::Play { .. },
            ControlCommand::Seek {
                position,
                reference_time,
            },
        ) => ControlCommand::Play {
            position,
            reference_time,
        },
        (
            ControlCommand::Pause { .. },
            ControlCommand::Seek {
                position,
                reference_time,
            },
        ) => ControlCommand::Pause {
            position: Some(position),
            reference_time,
        },
        (_, next) => next,
    }
}
