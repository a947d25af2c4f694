//! Show data: cues, presets and the JSON show file.
//!
//! - [`Cue`] - A preset applied to a fixture at a point in the song
//! - [`Preset`] - A reusable step sequence or envelope, registered per fixture type
//! - [`PresetLibrary`] - Presets keyed by (fixture type, name); malformed entries are kept
//!   so the cues referencing them can be reported individually
//! - [`ShowFile`] - On-disk show document

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::config::{ConfigError, ShowConfig};
use crate::dmx_types::Fixture;

/// Unit a cue's `time` is expressed in.
#[derive(Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Debug, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TimeUnit {
    #[default]
    Seconds,
    Beats,
}

/// A scheduled instruction: apply `preset` to `fixture` at `time`.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Cue {
    /// Target fixture identifier
    pub fixture: String,
    /// Preset name, resolved against the fixture's type
    pub preset: String,
    /// Start time, in `unit`
    pub time: f64,
    #[serde(default)]
    pub unit: TimeUnit,
    /// Parameter overrides (`duration`, `brightness`, `loop_beats`, `max_value`, `attack_time`, ...)
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
}

impl Cue {
    pub fn new(fixture: impl Into<String>, preset: impl Into<String>, time: f64) -> Self {
        Self {
            fixture: fixture.into(),
            preset: preset.into(),
            time,
            unit: TimeUnit::Seconds,
            params: BTreeMap::new(),
        }
    }

    pub fn in_beats(mut self) -> Self {
        self.unit = TimeUnit::Beats;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: f64) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn param(&self, key: &str) -> Option<f64> {
        self.params.get(key).copied()
    }
}

/// How a preset's content is expanded.
#[derive(Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Debug, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PresetMode {
    /// Walk the step list once
    #[default]
    Single,
    /// Repeat the step list until the loop length is filled
    Loop,
    /// Attack/decay/sustain/release envelope over a weighted channel map
    Adsr,
}

/// One step of a `single` or `loop` preset. Values are keyed by role name.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresetStep {
    /// Write values instantly
    Set { values: BTreeMap<String, f32> },
    /// Linear ramp to `values` over `duration`; starts from `from` where given,
    /// otherwise from the channel's last written value
    Fade {
        values: BTreeMap<String, f32>,
        #[serde(default)]
        from: BTreeMap<String, f32>,
        duration: f64,
    },
    /// Keep `values` asserted for `duration`
    Hold {
        values: BTreeMap<String, f32>,
        duration: f64,
    },
}

impl PresetStep {
    pub fn duration(&self) -> f64 {
        match self {
            PresetStep::Set { .. } => 0.0,
            PresetStep::Fade { duration, .. } | PresetStep::Hold { duration, .. } => *duration,
        }
    }

    /// Role names the step writes or fades from.
    pub fn roles(&self) -> impl Iterator<Item = &str> {
        let (values, from) = match self {
            PresetStep::Set { values } | PresetStep::Hold { values, .. } => (values, None),
            PresetStep::Fade { values, from, .. } => (values, Some(from)),
        };
        values
            .keys()
            .chain(from.into_iter().flat_map(|f| f.keys()))
            .map(String::as_str)
    }
}

/// Ramp stage: reach level `to` (0..1) over `time` seconds.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct Stage {
    pub to: f32,
    pub time: f64,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct SustainStage {
    /// Sustained level (0..1); the decay target when absent
    #[serde(default)]
    pub value: Option<f32>,
    pub time: f64,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct ReleaseStage {
    pub time: f64,
}

fn full_scale() -> f32 {
    1.0
}

/// Envelope of an `adsr` preset.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct AdsrEnvelope {
    /// Role name -> weight (0..1)
    pub channel_map: BTreeMap<String, f32>,
    /// Global scale applied on top of the weights
    #[serde(default = "full_scale")]
    pub max_value: f32,
    pub attack: Stage,
    pub decay: Stage,
    pub sustain: SustainStage,
    pub release: ReleaseStage,
}

/// A reusable animation recipe for one fixture type.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Preset {
    pub name: String,
    pub fixture_type: String,
    #[serde(default)]
    pub mode: PresetMode,
    #[serde(default)]
    pub steps: Vec<PresetStep>,
    /// Default scale for colour channels when the cue does not override it
    #[serde(default)]
    pub brightness: Option<f32>,
    /// Default loop length in beats for `loop` presets
    #[serde(default)]
    pub loop_beats: Option<f64>,
    #[serde(default)]
    pub adsr: Option<AdsrEnvelope>,
}

impl Preset {
    pub fn single(
        name: impl Into<String>,
        fixture_type: impl Into<String>,
        steps: Vec<PresetStep>,
    ) -> Self {
        Self {
            name: name.into(),
            fixture_type: fixture_type.into(),
            mode: PresetMode::Single,
            steps,
            brightness: None,
            loop_beats: None,
            adsr: None,
        }
    }
}

/// Presets keyed by (fixture type, preset name).
/// Entries that failed to deserialize are stored with the reason so a cue
/// that references one gets a precise diagnostic.
#[derive(Clone, Default, Debug)]
pub struct PresetLibrary {
    presets: HashMap<(String, String), Result<Preset, String>>,
}

impl PresetLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, preset: Preset) {
        self.presets.insert(
            (preset.fixture_type.clone(), preset.name.clone()),
            Ok(preset),
        );
    }

    /// Builds a library from raw JSON entries.
    /// Entries without a readable `name`/`fixture_type` pair cannot be
    /// addressed by any cue and are returned as load issues.
    pub fn from_json(entries: &[serde_json::Value]) -> (Self, Vec<String>) {
        let mut library = PresetLibrary::new();
        let mut issues = Vec::new();
        for (idx, entry) in entries.iter().enumerate() {
            let key = (
                entry.get("fixture_type").and_then(|v| v.as_str()),
                entry.get("name").and_then(|v| v.as_str()),
            );
            match (key, serde_json::from_value::<Preset>(entry.clone())) {
                (_, Ok(preset)) => library.insert(preset),
                ((Some(fixture_type), Some(name)), Err(e)) => {
                    library.presets.insert(
                        (fixture_type.to_string(), name.to_string()),
                        Err(e.to_string()),
                    );
                }
                (_, Err(e)) => issues.push(format!("preset #{idx}: {e}")),
            }
        }
        (library, issues)
    }

    pub fn get(&self, fixture_type: &str, name: &str) -> Option<&Result<Preset, String>> {
        self.presets
            .get(&(fixture_type.to_string(), name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }
}

fn default_bpm() -> f64 {
    120.0
}

/// The on-disk show document.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct ShowFile {
    #[serde(default)]
    pub config: ShowConfig,
    #[serde(default = "default_bpm")]
    pub bpm: f64,
    /// Track length in seconds, when known up front
    #[serde(default)]
    pub duration: Option<f64>,
    /// Audio file the show runs against; probed for its length when `duration` is absent
    #[serde(default)]
    pub audio: Option<PathBuf>,
    #[serde(default)]
    pub fixtures: Vec<Fixture>,
    #[serde(default)]
    pub presets: Vec<serde_json::Value>,
    #[serde(default)]
    pub cues: Vec<serde_json::Value>,
}

impl ShowFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Parses the cue list. Malformed entries are returned as issues and
    /// leave the remaining cues intact.
    pub fn parse_cues(&self) -> (Vec<Cue>, Vec<String>) {
        let mut cues = Vec::with_capacity(self.cues.len());
        let mut issues = Vec::new();
        for (idx, raw) in self.cues.iter().enumerate() {
            match serde_json::from_value::<Cue>(raw.clone()) {
                Ok(cue) => cues.push(cue),
                Err(e) => issues.push(format!("cue #{idx}: {e}")),
            }
        }
        (cues, issues)
    }
}
