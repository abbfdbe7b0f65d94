//! Player adapter boundary
//!
//! The media engine itself lives outside this crate. [`PlayerAdapter`] is the
//! only surface the sync loop touches; [`VirtualPlayer`] is an in-memory
//! timeline that behaves like a real player for dry runs and tests.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;

use crate::clock::LocalClock;
use crate::error::PlaybackError;

/// State change reported by the player
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlayerEvent {
    PlaybackChanged { playing: bool },
    BufferingChanged { buffering: bool },
    /// Position jumped for a reason other than our own seek (user scrub, track change)
    Discontinuity { position_ms: i64 },
}

/// Listener registered through [`PlayerAdapter::on_state_changed`]
pub type StateCallback = Box<dyn Fn(PlayerEvent) + Send + Sync>;

/// Facade over the platform media player
#[async_trait]
pub trait PlayerAdapter: Send + Sync {
    async fn play(&self) -> Result<(), PlaybackError>;

    async fn pause(&self) -> Result<(), PlaybackError>;

    async fn seek(&self, position_ms: i64) -> Result<(), PlaybackError>;

    async fn current_position(&self) -> i64;

    async fn is_playing(&self) -> bool;

    async fn is_buffering(&self) -> bool;

    async fn playback_rate(&self) -> f64 {
        1.0
    }

    /// Whether small drifts may be absorbed by nudging the playback rate
    fn supports_rate_correction(&self) -> bool {
        false
    }

    async fn set_rate(&self, _rate: f64) -> Result<(), PlaybackError> {
        Err(PlaybackError::Unsupported("rate correction"))
    }

    fn on_state_changed(&self, callback: StateCallback);
}

/// Point-in-time view of the player used for one controller decision
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PlayerSnapshot {
    pub position_ms: i64,
    pub playing: bool,
    pub buffering: bool,
    pub rate: f64,
}

impl PlayerSnapshot {
    pub async fn capture(player: &dyn PlayerAdapter) -> Self {
        Self {
            position_ms: player.current_position().await,
            playing: player.is_playing().await,
            buffering: player.is_buffering().await,
            rate: player.playback_rate().await,
        }
    }
}

/// One call into the player
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "action", content = "value", rename_all = "snake_case")]
pub enum PlayerAction {
    Seek(i64),
    Play,
    Pause,
    SetRate(f64),
}

impl PlayerAction {
    pub async fn apply(self, player: &dyn PlayerAdapter) -> Result<(), PlaybackError> {
        match self {
            PlayerAction::Seek(position) => player.seek(position).await,
            PlayerAction::Play => player.play().await,
            PlayerAction::Pause => player.pause().await,
            PlayerAction::SetRate(rate) => player.set_rate(rate).await,
        }
    }
}

impl fmt::Display for PlayerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayerAction::Seek(position) => write!(f, "seek({}ms)", position),
            PlayerAction::Play => write!(f, "play"),
            PlayerAction::Pause => write!(f, "pause"),
            PlayerAction::SetRate(rate) => write!(f, "rate({:.3})", rate),
        }
    }
}

struct VirtualState {
    playing: bool,
    buffering: bool,
    rate: f64,
    /// Position at `anchor_at`
    anchor_position: i64,
    anchor_at: i64,
    duration_ms: Option<i64>,
    failures_pending: u32,
    history: VecDeque<PlayerAction>,
}

impl VirtualState {
    fn position_at(&self, now: i64) -> i64 {
        let position = if self.playing && !self.buffering {
            let elapsed = (now - self.anchor_at) as f64 * self.rate;
            self.anchor_position + elapsed.round() as i64
        } else {
            self.anchor_position
        };
        match self.duration_ms {
            Some(duration) => position.clamp(0, duration),
            None => position.max(0),
        }
    }

    fn reanchor(&mut self, now: i64) {
        self.anchor_position = self.position_at(now);
        self.anchor_at = now;
    }
}

/// Actions kept by [`VirtualPlayer::history`]; older ones are forgotten
pub const HISTORY_LIMIT: usize = 256;

/// Simulated player whose position advances with a [`LocalClock`]
pub struct VirtualPlayer {
    clock: Arc<dyn LocalClock>,
    state: Mutex<VirtualState>,
    callbacks: Mutex<Vec<StateCallback>>,
    rate_correction: bool,
}

impl VirtualPlayer {
    pub fn new(clock: Arc<dyn LocalClock>) -> Self {
        let now = clock.now_ms();
        Self {
            clock,
            state: Mutex::new(VirtualState {
                playing: false,
                buffering: false,
                rate: 1.0,
                anchor_position: 0,
                anchor_at: now,
                duration_ms: None,
                failures_pending: 0,
                history: VecDeque::new(),
            }),
            callbacks: Mutex::new(Vec::new()),
            rate_correction: false,
        }
    }

    /// Seeks past `duration_ms` are rejected
    pub fn with_duration(self, duration_ms: i64) -> Self {
        self.state.lock().duration_ms = Some(duration_ms);
        self
    }

    pub fn with_rate_correction(mut self) -> Self {
        self.rate_correction = true;
        self
    }

    /// Reject the next `count` control actions
    pub fn fail_next(&self, count: u32) {
        self.state.lock().failures_pending = count;
    }

    /// Enter or leave buffering, notifying listeners on change
    pub fn set_buffering(&self, buffering: bool) {
        let changed = {
            let now = self.clock.now_ms();
            let mut state = self.state.lock();
            if state.buffering == buffering {
                false
            } else {
                state.reanchor(now);
                state.buffering = buffering;
                true
            }
        };
        if changed {
            self.notify(PlayerEvent::BufferingChanged { buffering });
        }
    }

    /// Move the position without going through the sync loop (a user scrub)
    pub fn scrub(&self, position_ms: i64) {
        {
            let now = self.clock.now_ms();
            let mut state = self.state.lock();
            state.anchor_position = position_ms.max(0);
            state.anchor_at = now;
        }
        self.notify(PlayerEvent::Discontinuity { position_ms });
    }

    /// The last [`HISTORY_LIMIT`] actions applied, oldest first
    pub fn history(&self) -> Vec<PlayerAction> {
        self.state.lock().history.iter().copied().collect()
    }

    pub fn clear_history(&self) {
        self.state.lock().history.clear();
    }

    fn notify(&self, event: PlayerEvent) {
        for callback in self.callbacks.lock().iter() {
            callback(event);
        }
    }

    /// Shared bookkeeping for control actions: failure injection and history
    fn begin(&self, state: &mut VirtualState, action: PlayerAction) -> Result<(), PlaybackError> {
        if state.failures_pending > 0 {
            state.failures_pending -= 1;
            return Err(PlaybackError::Rejected {
                action: action.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        if state.history.len() == HISTORY_LIMIT {
            state.history.pop_front();
        }
        state.history.push_back(action);
        Ok(())
    }
}

#[async_trait]
impl PlayerAdapter for VirtualPlayer {
    async fn play(&self) -> Result<(), PlaybackError> {
        let changed = {
            let now = self.clock.now_ms();
            let mut state = self.state.lock();
            self.begin(&mut state, PlayerAction::Play)?;
            state.reanchor(now);
            !std::mem::replace(&mut state.playing, true)
        };
        if changed {
            self.notify(PlayerEvent::PlaybackChanged { playing: true });
        }
        Ok(())
    }

    async fn pause(&self) -> Result<(), PlaybackError> {
        let changed = {
            let now = self.clock.now_ms();
            let mut state = self.state.lock();
            self.begin(&mut state, PlayerAction::Pause)?;
            state.reanchor(now);
            std::mem::replace(&mut state.playing, false)
        };
        if changed {
            self.notify(PlayerEvent::PlaybackChanged { playing: false });
        }
        Ok(())
    }

    async fn seek(&self, position_ms: i64) -> Result<(), PlaybackError> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        let out_of_range = position_ms < 0
            || state
                .duration_ms
                .map_or(false, |duration| position_ms > duration);
        if out_of_range {
            return Err(PlaybackError::Rejected {
                action: PlayerAction::Seek(position_ms).to_string(),
                reason: "position out of range".to_string(),
            });
        }
        self.begin(&mut state, PlayerAction::Seek(position_ms))?;
        state.anchor_position = position_ms;
        state.anchor_at = now;
        Ok(())
    }

    async fn current_position(&self) -> i64 {
        self.state.lock().position_at(self.clock.now_ms())
    }

    async fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    async fn is_buffering(&self) -> bool {
        self.state.lock().buffering
    }

    async fn playback_rate(&self) -> f64 {
        self.state.lock().rate
    }

    fn supports_rate_correction(&self) -> bool {
        self.rate_correction
    }

    async fn set_rate(&self, rate: f64) -> Result<(), PlaybackError> {
        if !self.rate_correction {
            return Err(PlaybackError::Unsupported("rate correction"));
        }
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        self.begin(&mut state, PlayerAction::SetRate(rate))?;
        state.reanchor(now);
        state.rate = rate;
        Ok(())
    }

    fn on_state_changed(&self, callback: StateCallback) {
        self.callbacks.lock().push(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn player() -> (Arc<ManualClock>, VirtualPlayer) {
        let clock = Arc::new(ManualClock::new(10_000));
        let player = VirtualPlayer::new(clock.clone());
        (clock, player)
    }

    #[tokio::test]
    async fn test_position_advances_only_while_playing() {
        let (clock, player) = player();
        clock.advance(500);
        assert_eq!(player.current_position().await, 0);

        player.play().await.unwrap();
        clock.advance(1_500);
        assert_eq!(player.current_position().await, 1_500);

        player.pause().await.unwrap();
        clock.advance(1_000);
        assert_eq!(player.current_position().await, 1_500);
    }

    #[tokio::test]
    async fn test_buffering_freezes_position() {
        let (clock, player) = player();
        player.play().await.unwrap();
        clock.advance(1_000);
        player.set_buffering(true);
        clock.advance(2_000);
        assert_eq!(player.current_position().await, 1_000);

        player.set_buffering(false);
        clock.advance(500);
        assert_eq!(player.current_position().await, 1_500);
    }

    #[tokio::test]
    async fn test_seek_out_of_range_rejected() {
        let (_clock, player) = player();
        let player = player.with_duration(60_000);
        assert!(player.seek(30_000).await.is_ok());
        let err = player.seek(90_000).await.unwrap_err();
        assert!(matches!(err, PlaybackError::Rejected { .. }));
        assert_eq!(player.current_position().await, 30_000);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let (_clock, player) = player();
        player.fail_next(1);
        assert!(player.play().await.is_err());
        assert!(player.play().await.is_ok());
        assert_eq!(player.history(), vec![PlayerAction::Play]);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let (_clock, player) = player();
        for position in 0..(HISTORY_LIMIT as i64 + 10) {
            player.seek(position).await.unwrap();
        }

        let history = player.history();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history.first(), Some(&PlayerAction::Seek(10)));
        assert_eq!(
            history.last(),
            Some(&PlayerAction::Seek(HISTORY_LIMIT as i64 + 9))
        );
    }

    #[tokio::test]
    async fn test_rate_unsupported_by_default() {
        let (_clock, player) = player();
        assert!(!player.supports_rate_correction());
        assert_eq!(
            player.set_rate(1.02).await.unwrap_err(),
            PlaybackError::Unsupported("rate correction")
        );
    }

    #[tokio::test]
    async fn test_callbacks_fire_on_change_only() {
        let (_clock, player) = player();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        player.on_state_changed(Box::new(move |event| sink.lock().push(event)));

        player.play().await.unwrap();
        player.play().await.unwrap();
        player.set_buffering(true);
        player.set_buffering(true);

        assert_eq!(
            *seen.lock(),
            vec![
                PlayerEvent::PlaybackChanged { playing: true },
                PlayerEvent::BufferingChanged { buffering: true },
            ]
        );
    }

    #[tokio::test]
    async fn test_snapshot_capture() {
        let (clock, player) = player();
        let player = player.with_rate_correction();
        player.play().await.unwrap();
        player.set_rate(1.05).await.unwrap();
        clock.advance(1_000);

        let snapshot = PlayerSnapshot::capture(&player).await;
        assert!(snapshot.playing);
        assert!(!snapshot.buffering);
        assert_eq!(snapshot.position_ms, 1_050);
        assert!((snapshot.rate - 1.05).abs() < 1e-9);
    }
}
