//! Playback clock and the frame output loop.
//!
//! [`PlaybackClock`] derives the show position from a monotonic clock:
//! while playing, `current_time = playback_time + (now - anchor)`. Every
//! transition re-anchors, so the position never jumps between sync reports.
//!
//! [`PlaybackLoop`] runs on its own thread, sampling the canvas at the
//! current position and handing the frame to the Art-Net sender at a fixed
//! cadence, whether or not the show is playing.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::artnet::{ArtNetSender, SendOutcome};
use crate::canvas::Canvas;
use crate::dmx_types::{DMX_CHANNELS, DmxFrame};

/// Default drift, in seconds, a sync report may show before the clock seeks.
pub const DEFAULT_DRIFT_TOLERANCE: f64 = 0.1;

#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::Display)]
pub enum TransportState {
    Stopped,
    Playing,
    Paused,
}

/// What a sync report changed.
#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::Display)]
pub enum SyncAction {
    /// Report matched the local clock within tolerance
    InSync,
    Started,
    Paused,
    /// Drift exceeded the tolerance; the clock seeked to the reported time
    Resynced,
}

/// Position and state at one instant.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct PlaybackStatus {
    pub state: TransportState,
    pub current_time: f64,
}

impl PlaybackStatus {
    pub fn is_playing(&self) -> bool {
        self.state == TransportState::Playing
    }
}

#[derive(Clone, Debug)]
pub struct PlaybackClock {
    state: TransportState,
    playback_time: f64,
    anchor: Instant,
    drift_tolerance: f64,
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new(DEFAULT_DRIFT_TOLERANCE)
    }
}

impl PlaybackClock {
    pub fn new(drift_tolerance: f64) -> Self {
        Self {
            state: TransportState::Stopped,
            playback_time: 0.0,
            anchor: Instant::now(),
            drift_tolerance: drift_tolerance.max(0.0),
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state == TransportState::Playing
    }

    pub fn current_time(&self) -> f64 {
        self.current_time_at(Instant::now())
    }

    pub fn current_time_at(&self, now: Instant) -> f64 {
        match self.state {
            TransportState::Playing => {
                self.playback_time + now.saturating_duration_since(self.anchor).as_secs_f64()
            }
            _ => self.playback_time,
        }
    }

    pub fn status_at(&self, now: Instant) -> PlaybackStatus {
        PlaybackStatus {
            state: self.state,
            current_time: self.current_time_at(now),
        }
    }

    pub fn play(&mut self) {
        self.play_at(Instant::now())
    }

    pub fn play_at(&mut self, now: Instant) {
        if self.is_playing() {
            return;
        }
        self.anchor = now;
        self.state = TransportState::Playing;
    }

    pub fn pause(&mut self) {
        self.pause_at(Instant::now())
    }

    /// Freezes the position. Only a playing clock can pause; a stopped one
    /// stays stopped.
    pub fn pause_at(&mut self, now: Instant) {
        if !self.is_playing() {
            return;
        }
        self.playback_time = self.current_time_at(now);
        self.state = TransportState::Paused;
    }

    pub fn stop(&mut self) {
        self.playback_time = 0.0;
        self.state = TransportState::Stopped;
    }

    pub fn seek(&mut self, time: f64) {
        self.seek_at(time, Instant::now())
    }

    /// Moves the position to `time` (negative times clamp to 0) without
    /// changing the transport state.
    pub fn seek_at(&mut self, time: f64, now: Instant) {
        self.playback_time = if time.is_finite() { time.max(0.0) } else { 0.0 };
        self.anchor = now;
    }

    pub fn sync(&mut self, is_playing: bool, reported_time: f64) -> SyncAction {
        self.sync_at(is_playing, reported_time, Instant::now())
    }

    /// Reconciles an externally reported position. A change of the playing
    /// flag adopts the reported time and starts or pauses; otherwise the
    /// clock only seeks when it has drifted past the tolerance.
    pub fn sync_at(&mut self, is_playing: bool, reported_time: f64, now: Instant) -> SyncAction {
        if is_playing != self.is_playing() {
            self.seek_at(reported_time, now);
            if is_playing {
                self.play_at(now);
                return SyncAction::Started;
            }
            self.pause_at(now);
            return SyncAction::Paused;
        }
        let drift = (reported_time - self.current_time_at(now)).abs();
        if drift > self.drift_tolerance {
            tracing::debug!(drift, reported_time, "playback clock resynced");
            self.seek_at(reported_time, now);
            return SyncAction::Resynced;
        }
        SyncAction::InSync
    }
}

/// Shared handle to the clock; cloned into the playback loop, the sync
/// bridge and the console.
#[derive(Clone, Default)]
pub struct PlaybackHandle {
    clock: Arc<Mutex<PlaybackClock>>,
}

impl PlaybackHandle {
    pub fn new(clock: PlaybackClock) -> Self {
        Self {
            clock: Arc::new(Mutex::new(clock)),
        }
    }

    pub fn status(&self) -> PlaybackStatus {
        self.clock.lock().status_at(Instant::now())
    }

    pub fn current_time(&self) -> f64 {
        self.clock.lock().current_time()
    }

    pub fn play(&self) {
        self.clock.lock().play()
    }

    pub fn pause(&self) {
        self.clock.lock().pause()
    }

    pub fn stop(&self) {
        self.clock.lock().stop()
    }

    pub fn seek(&self, time: f64) {
        self.clock.lock().seek(time)
    }

    /// Applies a sync report and returns the reconciled status with it.
    pub fn sync(&self, is_playing: bool, reported_time: f64) -> (SyncAction, PlaybackStatus) {
        let now = Instant::now();
        let mut clock = self.clock.lock();
        let action = clock.sync_at(is_playing, reported_time, now);
        (action, clock.status_at(now))
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlaybackSettings {
    pub frame_interval: Duration,
    pub universe: u16,
    pub blackout_when_stopped: bool,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_secs_f64(1.0 / 44.0),
            universe: 0,
            blackout_when_stopped: false,
        }
    }
}

/// One tick of the output loop.
#[derive(Clone, Debug)]
pub struct FrameEvent {
    pub status: PlaybackStatus,
    pub frame: DmxFrame,
    pub outcome: SendOutcome,
}

/// Background output loop. Dropping it stops the thread.
pub struct PlaybackLoop {
    stopper: Sender<()>,
    handle: Option<JoinHandle<()>>,
    frames: Receiver<FrameEvent>,
}

impl PlaybackLoop {
    pub fn spawn(
        canvas: Arc<Canvas>,
        clock: PlaybackHandle,
        mut sender: ArtNetSender,
        settings: PlaybackSettings,
    ) -> std::io::Result<Self> {
        let (stopper, stop_rx) = bounded::<()>(1);
        let (frame_tx, frames) = bounded(1);
        let stale = frames.clone();
        let handle = std::thread::Builder::new()
            .name(String::from("playback"))
            .spawn(move || {
                tracing::info!(
                    destination = %sender.destination(),
                    universe = settings.universe,
                    interval_ms = settings.frame_interval.as_secs_f64() * 1000.0,
                    "playback loop started"
                );
                loop {
                    let tick = Instant::now();
                    let status = clock.status();
                    let frame = if settings.blackout_when_stopped && !status.is_playing() {
                        [0u8; DMX_CHANNELS]
                    } else {
                        canvas.get_frame(status.current_time)
                    };
                    let outcome = sender.send_frame(settings.universe, &frame);
                    // Replace an undrained event so readers see the newest tick.
                    while stale.try_recv().is_ok() {}
                    let _ = frame_tx.try_send(FrameEvent {
                        status,
                        frame,
                        outcome,
                    });

                    let spent = tick.elapsed();
                    if spent > settings.frame_interval {
                        tracing::debug!(spent_ms = spent.as_secs_f64() * 1000.0, "playback tick overran");
                    }
                    match stop_rx.recv_timeout(settings.frame_interval.saturating_sub(spent)) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::info!("playback loop stopped");
            })?;
        Ok(Self {
            stopper,
            handle: Some(handle),
            frames,
        })
    }

    /// The most recent frame event. Holds at most one event; an undrained
    /// event is replaced by the next tick's.
    pub fn frames(&self) -> &Receiver<FrameEvent> {
        &self.frames
    }

    /// Stops the loop and waits for the thread to exit.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        let _ = self.stopper.try_send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("playback thread panicked");
            }
        }
    }
}

impl Drop for PlaybackLoop {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
