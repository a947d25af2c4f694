//! Live fixture effects painted straight onto the canvas.
//!
//! Effects are a closed set looked up by name. Each one only uses the
//! canvas paint primitives and the fixture's role map.

use std::str::FromStr;
use thiserror::Error;

use crate::canvas::Canvas;
use crate::dmx_types::{Fixture, dmx_slot};

#[derive(Error, Debug, PartialEq)]
pub enum EffectError {
    #[error("Unknown effect: {0}")]
    UnknownEffect(String),
    #[error("Fixture {fixture} has no {role} channel")]
    MissingRole { fixture: String, role: &'static str },
    #[error("Invalid effect duration: {0}")]
    InvalidDuration(f64),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum FixtureEffect {
    /// Dimmer jumps to full and decays linearly to zero
    Flash,
    /// Dimmer alternates between full and off at `rate` Hz
    Strobe,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EffectParams {
    pub start: f64,
    pub duration: f64,
    /// Peak level, 0..1
    pub intensity: f32,
    /// Strobe frequency in Hz
    pub rate: f64,
}

impl Default for EffectParams {
    fn default() -> Self {
        Self {
            start: 0.0,
            duration: 1.0,
            intensity: 1.0,
            rate: 10.0,
        }
    }
}

impl FixtureEffect {
    pub fn apply(
        &self,
        canvas: &Canvas,
        fixture: &Fixture,
        params: EffectParams,
    ) -> Result<(), EffectError> {
        if !(params.duration.is_finite() && params.duration >= 0.0) {
            return Err(EffectError::InvalidDuration(params.duration));
        }
        let slot = fixture
            .address("dim")
            .and_then(dmx_slot)
            .ok_or_else(|| EffectError::MissingRole {
                fixture: fixture.id.clone(),
                role: "dim",
            })?;
        let peak = 255.0 * params.intensity.clamp(0.0, 1.0);

        match self {
            FixtureEffect::Flash => {
                canvas.paint_channel(slot, params.start, params.duration, |p| peak * (1.0 - p));
            }
            FixtureEffect::Strobe => {
                let period = if params.rate > 0.0 { 1.0 / params.rate } else { f64::INFINITY };
                canvas.paint_range(params.start, params.start + params.duration, |t| {
                    let phase = ((t - params.start) / period).fract();
                    [(slot, if phase < 0.5 { peak } else { 0.0 })]
                });
            }
        }
        tracing::debug!(effect = %self, fixture = %fixture.id, start = params.start, "effect painted");
        Ok(())
    }
}

/// Looks up an effect by name and applies it.
pub fn apply_by_name(
    name: &str,
    canvas: &Canvas,
    fixture: &Fixture,
    params: EffectParams,
) -> Result<(), EffectError> {
    FixtureEffect::from_str(name)
        .map_err(|_| EffectError::UnknownEffect(name.to_string()))?
        .apply(canvas, fixture, params)
}
