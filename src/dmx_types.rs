//! DMX Types and Fixture Channel Maps
//!
//! This module defines the addressing types the rest of the crate resolves
//! against:
//!
//! ## Universe
//! - [`DMX_CHANNELS`] - Number of slots in one universe
//! - [`dmx_slot`] - Converts a 1-based DMX address into a 0-based slot index
//! - [`clamp_level`] - Converts an arbitrary level into a DMX value
//!
//! ## Fixtures
//! - [`ChannelType`] - Function of a channel role, derived from its name
//! - [`Fixture`] - A patched device: named channel roles mapped to DMX addresses
//! - [`FixtureMap`] - All patched fixtures, looked up by identifier

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;
use std::str::FromStr;

/// Number of channels in a single DMX universe.
pub const DMX_CHANNELS: usize = 512;

/// One full universe of channel values, index 0 = DMX address 1.
pub type DmxFrame = [u8; DMX_CHANNELS];

/// Converts a 1-based DMX address into a 0-based slot index.
/// Address 0 and addresses above 512 have no slot.
pub fn dmx_slot(address: u16) -> Option<usize> {
    let slot = (address as usize).checked_sub(1)?;
    (slot < DMX_CHANNELS).then_some(slot)
}

/// Rounds and clamps a level into `0..=255`. NaN maps to 0.
pub fn clamp_level(level: f32) -> u8 {
    if level.is_nan() {
        return 0;
    }
    level.round().clamp(0.0, 255.0) as u8
}

/// Channel type definitions for fixture roles.
/// The type is derived from the role name used in the fixture's channel map
/// (`"dim"`, `"red"`, `"pan_msb"`, ...). Only colour channels are affected by
/// brightness scaling during rendering.
#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ChannelType {
    /// Intensity/Dimmer - overall brightness
    #[strum(serialize = "dim", serialize = "dimmer", serialize = "intensity")]
    Dim,
    /// Red color channel
    Red,
    /// Green color channel
    Green,
    /// Blue color channel
    Blue,
    /// White color channel
    White,
    /// Amber color channel
    Amber,
    /// Ultraviolet channel
    Uv,
    /// Pan coarse
    #[strum(serialize = "pan_msb", serialize = "pan")]
    PanMsb,
    /// Pan fine
    #[strum(serialize = "pan_lsb", serialize = "pan_fine")]
    PanLsb,
    /// Tilt coarse
    #[strum(serialize = "tilt_msb", serialize = "tilt")]
    TiltMsb,
    /// Tilt fine
    #[strum(serialize = "tilt_lsb", serialize = "tilt_fine")]
    TiltLsb,
    /// Shutter - blocks light output, often also the strobe control
    Shutter,
    /// Electronic strobe frequency
    Strobe,
    /// Colour wheel position
    ColorWheel,
    /// Gobo wheel position
    Gobo,
    /// Beam angle
    Zoom,
    /// Beam focus
    Focus,
    /// Movement speed
    Speed,
    /// Lamp/reset control
    Control,
    /// Any role the name does not identify
    Other,
}

impl ChannelType {
    /// Resolves a role name, falling back to [`ChannelType::Other`].
    pub fn from_role(role: &str) -> Self {
        ChannelType::from_str(role).unwrap_or(ChannelType::Other)
    }

    pub fn is_color(&self) -> bool {
        matches!(
            self,
            ChannelType::Red
                | ChannelType::Green
                | ChannelType::Blue
                | ChannelType::White
                | ChannelType::Amber
                | ChannelType::Uv
        )
    }
}

fn default_enabled() -> bool {
    true
}

/// A patched fixture.
/// Maps role names to absolute 1-based DMX addresses. Presets reference
/// roles by name, the fixture resolves them to addresses at render time.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Fixture {
    /// Unique identifier cues use to target this fixture
    pub id: String,
    /// Fixture type presets are registered under (e.g. "rgb_par")
    pub fixture_type: String,
    /// Role name -> absolute DMX address (1-512)
    #[serde(default)]
    pub channels: BTreeMap<String, u16>,
    /// Role name -> value held for the whole show while the fixture is enabled
    #[serde(default)]
    pub arm: BTreeMap<String, u8>,
    /// Disabled fixtures are not armed
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Fixture {
    pub fn new(id: impl Into<String>, fixture_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fixture_type: fixture_type.into(),
            channels: BTreeMap::new(),
            arm: BTreeMap::new(),
            enabled: true,
        }
    }

    pub fn with_channel(mut self, role: impl Into<String>, address: u16) -> Self {
        self.channels.insert(role.into(), address);
        self
    }

    pub fn with_arm(mut self, role: impl Into<String>, value: u8) -> Self {
        self.arm.insert(role.into(), value);
        self
    }

    /// DMX address of a role, if mapped.
    pub fn address(&self, role: &str) -> Option<u16> {
        self.channels.get(role).copied()
    }

    /// Lowest through highest address this fixture occupies.
    pub fn span(&self) -> Option<RangeInclusive<u16>> {
        let lo = self.channels.values().min()?;
        let hi = self.channels.values().max()?;
        Some(*lo..=*hi)
    }

    /// Resolves `(address, value)` pairs for the arm roles that are mapped.
    pub fn arm_addresses(&self) -> Vec<(u16, u8)> {
        if !self.enabled {
            return Vec::new();
        }
        self.arm
            .iter()
            .filter_map(|(role, value)| self.address(role).map(|a| (a, *value)))
            .collect()
    }
}

/// All patched fixtures, keyed by identifier.
#[derive(Clone, Default, Debug)]
pub struct FixtureMap {
    fixtures: HashMap<String, Fixture>,
    order: Vec<String>,
}

impl FixtureMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a fixture. Patch order is kept for arming.
    pub fn insert(&mut self, fixture: Fixture) {
        if !self.fixtures.contains_key(&fixture.id) {
            self.order.push(fixture.id.clone());
        }
        self.fixtures.insert(fixture.id.clone(), fixture);
    }

    pub fn get(&self, id: &str) -> Option<&Fixture> {
        self.fixtures.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fixture> {
        self.order.iter().filter_map(|id| self.fixtures.get(id))
    }

    pub fn len(&self) -> usize {
        self.fixtures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixtures.is_empty()
    }
}

impl FromIterator<Fixture> for FixtureMap {
    fn from_iter<T: IntoIterator<Item = Fixture>>(iter: T) -> Self {
        let mut map = FixtureMap::new();
        iter.into_iter().for_each(|f| map.insert(f));
        map
    }
}
