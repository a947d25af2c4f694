use scan_fmt::scan_fmt;
use thiserror::Error;

use crate::canvas::Canvas;
use crate::dmx_types::{DMX_CHANNELS, FixtureMap};
use crate::effects::{EffectError, EffectParams, FixtureEffect};
use crate::playback::PlaybackHandle;
use std::str::FromStr;

#[derive(Error, Debug, PartialEq)]
pub enum ConsoleError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("Invalid channel: {0}. Must be between 1 and {1}")]
    InvalidChannel(usize, usize),
    #[error("Invalid time: {0}. Must not be negative")]
    InvalidTime(f64),
    #[error("Invalid fixture id: {0}")]
    InvalidFixtureId(String),
    #[error(transparent)]
    Effect(#[from] EffectError),
}

#[derive(Clone, PartialEq, Debug, strum::Display)]
pub enum ConsoleCommand {
    #[strum(serialize = "Play")]
    Play,
    #[strum(serialize = "Pause")]
    Pause,
    #[strum(serialize = "Stop")]
    Stop,
    #[strum(serialize = "Seek {time}")]
    Seek { time: f64 },
    #[strum(serialize = "Sync {playing} {time}")]
    Sync { playing: bool, time: f64 },
    #[strum(serialize = "Status")]
    Status,
    #[strum(serialize = "Clear")]
    Clear,
    #[strum(serialize = "Dump {start} {end} {from}-{to}")]
    Dump {
        start: f64,
        end: f64,
        from: usize,
        to: usize,
    },
    #[strum(serialize = "Fx {effect} {fixture_id} at {start} for {duration}")]
    Effect {
        effect: FixtureEffect,
        fixture_id: String,
        start: f64,
        duration: f64,
    },
}

impl TryFrom<String> for ConsoleCommand {
    type Error = ConsoleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let s = value.trim().to_lowercase();
        match s.as_str() {
            "play" | "go" => return Ok(ConsoleCommand::Play),
            "pause" => return Ok(ConsoleCommand::Pause),
            "stop" => return Ok(ConsoleCommand::Stop),
            "status" | "st" => return Ok(ConsoleCommand::Status),
            "clear" | "clr" => return Ok(ConsoleCommand::Clear),
            _ => {}
        }
        if let Ok(time) = scan_fmt!(&s, "seek {}", f64) {
            return Ok(ConsoleCommand::Seek { time });
        }
        if let Ok(time) = scan_fmt!(&s, "sync playing {}", f64) {
            return Ok(ConsoleCommand::Sync {
                playing: true,
                time,
            });
        }
        if let Ok(time) = scan_fmt!(&s, "sync paused {}", f64) {
            return Ok(ConsoleCommand::Sync {
                playing: false,
                time,
            });
        }
        if let Ok((start, end, from, to)) =
            scan_fmt!(&s, "dump {} {} {}-{}", f64, f64, usize, usize)
        {
            return Ok(ConsoleCommand::Dump {
                start,
                end,
                from,
                to,
            });
        }
        if let Ok((effect, fixture_id, start, duration)) =
            scan_fmt!(&s, "fx {} {} at {} for {}", String, String, f64, f64)
        {
            if let Ok(effect) = FixtureEffect::from_str(&effect) {
                return Ok(ConsoleCommand::Effect {
                    effect,
                    fixture_id,
                    start,
                    duration,
                });
            }
        }
        Err(ConsoleError::UnknownCommand(value))
    }
}

impl ConsoleCommand {
    pub fn parse(input: &str) -> Result<ConsoleCommand, ConsoleError> {
        ConsoleCommand::try_from(input.to_string())
    }
}

/// Operator console: parses text commands and runs them against the show.
pub struct Console<'a> {
    pub clock: &'a PlaybackHandle,
    pub canvas: &'a Canvas,
    pub fixtures: &'a FixtureMap,
    pub history: Vec<ConsoleCommand>,
}

impl<'a> Console<'a> {
    pub fn new(clock: &'a PlaybackHandle, canvas: &'a Canvas, fixtures: &'a FixtureMap) -> Self {
        Self {
            clock,
            canvas,
            fixtures,
            history: Vec::new(),
        }
    }

    /// Runs one line of input and returns the text to show the operator.
    pub fn execute(&mut self, input: &str) -> Result<String, ConsoleError> {
        let cmd = ConsoleCommand::parse(input)?;
        let output = match &cmd {
            ConsoleCommand::Play => {
                self.clock.play();
                self.status_line()
            }
            ConsoleCommand::Pause => {
                self.clock.pause();
                self.status_line()
            }
            ConsoleCommand::Stop => {
                self.clock.stop();
                self.status_line()
            }
            ConsoleCommand::Seek { time } => {
                if *time < 0.0 {
                    return Err(ConsoleError::InvalidTime(*time));
                }
                self.clock.seek(*time);
                self.status_line()
            }
            ConsoleCommand::Sync { playing, time } => {
                let (action, _) = self.clock.sync(*playing, *time);
                format!("{action}: {}", self.status_line())
            }
            ConsoleCommand::Status => self.status_line(),
            ConsoleCommand::Clear => {
                self.canvas.clear();
                String::from("Canvas cleared")
            }
            ConsoleCommand::Dump {
                start,
                end,
                from,
                to,
            } => {
                for ch in [*from, *to] {
                    if !(1..=DMX_CHANNELS).contains(&ch) {
                        return Err(ConsoleError::InvalidChannel(ch, DMX_CHANNELS));
                    }
                }
                self.canvas
                    .export_text(*start, *end, (*from - 1)..=(*to - 1))
            }
            ConsoleCommand::Effect {
                effect,
                fixture_id,
                start,
                duration,
            } => {
                let fixture = self
                    .fixtures
                    .iter()
                    .find(|f| f.id.eq_ignore_ascii_case(fixture_id))
                    .ok_or_else(|| ConsoleError::InvalidFixtureId(fixture_id.clone()))?;
                effect.apply(
                    self.canvas,
                    fixture,
                    EffectParams {
                        start: *start,
                        duration: *duration,
                        ..Default::default()
                    },
                )?;
                format!("{effect} painted on {}", fixture.id)
            }
        };
        self.history.push(cmd);
        Ok(output)
    }

    fn status_line(&self) -> String {
        let status = self.clock.status();
        format!("{} at {:.3}s", status.state, status.current_time)
    }
}
