//! Render engine: expands cues into concrete channel writes.
//!
//! A cue is resolved against its fixture (role name -> DMX address) and a
//! preset registered for that fixture's type, then expanded into a
//! [`Timeline`] of timestamped writes:
//!
//! - `single` presets walk their steps once
//! - `loop` presets repeat their steps until the loop length (in beats) is filled
//! - `adsr` presets emit a four-stage envelope over a weighted channel map
//!
//! Fades, holds and sustains are stepped at the render rate (default
//! [`DEFAULT_RENDER_RATE`]). Cues that cannot be resolved are reported in the
//! [`RenderReport`] and produce no writes; the remaining cues still render.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;
use tween::Tweener;

use crate::canvas::Canvas;
use crate::dmx_types::{ChannelType, Fixture, FixtureMap, clamp_level, dmx_slot};
use crate::show::{AdsrEnvelope, Cue, Preset, PresetLibrary, PresetMode, PresetStep, TimeUnit};

/// Fade/hold stepping rate, steps per second.
pub const DEFAULT_RENDER_RATE: f64 = 120.0;
/// Longest span a single cue may cover, in seconds.
pub const MAX_CUE_SPAN: f64 = 3600.0;
/// Most step cycles a loop cue may repeat.
pub const MAX_LOOP_CYCLES: f64 = 100_000.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderError {
    #[error("Unknown fixture: {0}")]
    UnknownFixture(String),
    #[error("No preset {preset} for fixture type {fixture_type}")]
    UnknownPreset {
        preset: String,
        fixture_type: String,
    },
    #[error("Malformed preset {preset}: {reason}")]
    MalformedPreset { preset: String, reason: String },
    #[error("Invalid BPM: {0}. Must be greater than 0")]
    InvalidBpm(f64),
    #[error("Invalid duration: {0}. Must not be negative")]
    InvalidDuration(f64),
    #[error("Invalid cue time: {0}")]
    InvalidTime(f64),
    #[error("Fixture {0} has no mapped channels")]
    UnmappedFixture(String),
    #[error("Preset {preset} drives no channel of fixture {fixture}")]
    NoMappedChannels { preset: String, fixture: String },
}

/// `seconds = (60 / bpm) * beats`
pub fn beats_to_seconds(beats: f64, bpm: f64) -> Result<f64, RenderError> {
    if !(bpm > 0.0) {
        return Err(RenderError::InvalidBpm(bpm));
    }
    Ok(60.0 / bpm * beats)
}

pub fn seconds_to_beats(seconds: f64, bpm: f64) -> Result<f64, RenderError> {
    if !(bpm > 0.0) {
        return Err(RenderError::InvalidBpm(bpm));
    }
    Ok(seconds * bpm / 60.0)
}

fn micros(t: f64) -> i64 {
    (t * 1_000_000.0).round() as i64
}

/// One channel write and the cue it came from.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Write {
    source: usize,
    value: u8,
}

/// Rendered output: timestamped writes keyed by DMX address, plus channels
/// held for the whole show.
///
/// Appending at an existing timestamp overwrites the channels it names, so
/// within one timestamp the last append wins. Every write remembers its
/// source (the cue list position); writes appended directly belong to
/// source 0.
#[derive(Clone, Default, Debug, PartialEq)]
pub struct Timeline {
    writes: BTreeMap<i64, BTreeMap<u16, Write>>,
    sustained: BTreeMap<u16, u8>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append<I>(&mut self, timestamp: f64, values: I)
    where
        I: IntoIterator<Item = (u16, u8)>,
    {
        self.append_from(0, timestamp, values);
    }

    pub fn append_from<I>(&mut self, source: usize, timestamp: f64, values: I)
    where
        I: IntoIterator<Item = (u16, u8)>,
    {
        let entry = self.writes.entry(micros(timestamp)).or_default();
        entry.extend(
            values
                .into_iter()
                .map(|(address, value)| (address, Write { source, value })),
        );
    }

    /// Moves every write of `other` into this timeline under `source`.
    pub fn merge(&mut self, source: usize, other: Timeline) {
        for (us, values) in other.writes {
            let entry = self.writes.entry(us).or_default();
            entry.extend(
                values
                    .into_iter()
                    .map(|(address, w)| (address, Write { source, value: w.value })),
            );
        }
        self.sustained.extend(other.sustained);
    }

    /// Holds `address` at `value` for the entire canvas duration.
    pub fn sustain(&mut self, address: u16, value: u8) {
        self.sustained.insert(address, value);
    }

    pub fn sustained(&self) -> &BTreeMap<u16, u8> {
        &self.sustained
    }

    /// Writes at exactly `timestamp`.
    pub fn at(&self, timestamp: f64) -> Option<BTreeMap<u16, u8>> {
        self.writes.get(&micros(timestamp)).map(levels)
    }

    /// Most recent value written to `address` at or before `timestamp`.
    pub fn value_at(&self, address: u16, timestamp: f64) -> Option<u8> {
        self.writes
            .range(..=micros(timestamp))
            .rev()
            .find_map(|(_, values)| values.get(&address).map(|w| w.value))
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, BTreeMap<u16, u8>)> + '_ {
        self.writes
            .iter()
            .map(|(us, values)| (*us as f64 / 1_000_000.0, levels(values)))
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.sustained.is_empty()
    }

    /// Paints the timeline into `canvas`.
    ///
    /// Writes usually outnumber frames. Within one source, each frame takes
    /// per channel the write nearest its own time, equally near writes
    /// resolving to the later one, so fade endpoints land on their frames.
    /// When several sources write a channel in the same frame, the later
    /// source in cue list order wins, as if the cues had been painted one
    /// after another. Sustained channels are painted over every frame
    /// afterwards.
    pub fn paint_onto(&self, canvas: &Canvas) {
        // frame -> slot -> source -> (distance, value)
        let mut nearest: BTreeMap<usize, HashMap<usize, BTreeMap<usize, (f64, u8)>>> =
            BTreeMap::new();
        for (us, values) in &self.writes {
            let t = *us as f64 / 1_000_000.0;
            let idx = canvas.frame_index(t);
            let dist = (t - canvas.frame_time(idx)).abs();
            let frame = nearest.entry(idx).or_default();
            for (address, write) in values {
                let Some(slot) = dmx_slot(*address) else {
                    continue;
                };
                let by_source = frame.entry(slot).or_default();
                match by_source.get(&write.source) {
                    Some((best, _)) if *best < dist => {}
                    _ => {
                        by_source.insert(write.source, (dist, write.value));
                    }
                }
            }
        }
        for (idx, slots) in nearest {
            canvas.paint_frame(
                canvas.frame_time(idx),
                slots.into_iter().filter_map(|(slot, by_source)| {
                    by_source
                        .last_key_value()
                        .map(|(_, (_, value))| (slot, *value as f32))
                }),
            );
        }

        if !self.sustained.is_empty() {
            let held: Vec<(usize, f32)> = self
                .sustained
                .iter()
                .filter_map(|(address, value)| dmx_slot(*address).map(|s| (s, *value as f32)))
                .collect();
            canvas.paint_range(0.0, canvas.duration(), |_| held.iter().copied());
        }
    }
}

fn levels(values: &BTreeMap<u16, Write>) -> BTreeMap<u16, u8> {
    values.iter().map(|(address, w)| (*address, w.value)).collect()
}

/// A cue that rendered.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderedCue {
    /// Position in the cue list
    pub index: usize,
    pub fixture: String,
    pub preset: String,
    /// Start in seconds
    pub start: f64,
    /// Span of the writes, in seconds
    pub duration: f64,
}

#[derive(Clone, Default, Debug, PartialEq)]
pub struct RenderReport {
    pub rendered: Vec<RenderedCue>,
    /// Cue list position and reason of every cue that produced no writes
    pub skipped: Vec<(usize, RenderError)>,
}

impl RenderReport {
    pub fn duration_of(&self, index: usize) -> Option<f64> {
        self.rendered
            .iter()
            .find(|c| c.index == index)
            .map(|c| c.duration)
    }
}

/// Per-cue resolution shared by the step and envelope expanders.
struct CueContext<'a> {
    fixture: &'a Fixture,
    start: f64,
    brightness: f32,
}

impl CueContext<'_> {
    /// Maps role-keyed values to addresses, scaling colour channels by the
    /// cue brightness. Unmapped roles are dropped.
    fn resolve(&self, values: &BTreeMap<String, f32>) -> Vec<(u16, f32)> {
        values
            .iter()
            .filter_map(|(role, value)| {
                let address = self.fixture.address(role)?;
                Some((address, self.scaled(role, *value)))
            })
            .collect()
    }

    fn scaled(&self, role: &str, value: f32) -> f32 {
        if ChannelType::from_role(role).is_color() {
            value * self.brightness
        } else {
            value
        }
    }
}

pub struct RenderEngine<'a> {
    fixtures: &'a FixtureMap,
    presets: &'a PresetLibrary,
    bpm: f64,
    render_rate: f64,
}

impl<'a> RenderEngine<'a> {
    pub fn new(
        fixtures: &'a FixtureMap,
        presets: &'a PresetLibrary,
        bpm: f64,
    ) -> Self {
        Self {
            fixtures,
            presets,
            bpm,
            render_rate: DEFAULT_RENDER_RATE,
        }
    }

    /// Overrides the stepping rate; non-positive rates are ignored.
    pub fn with_render_rate(mut self, render_rate: f64) -> Self {
        if render_rate > 0.0 {
            self.render_rate = render_rate;
        }
        self
    }

    /// Expands `cues` in list order. Writes from later cues overwrite earlier
    /// ones at the same timestamp.
    #[tracing::instrument(skip_all, fields(cues = cues.len(), bpm = self.bpm))]
    pub fn render(&self, cues: &[Cue]) -> (Timeline, RenderReport) {
        let mut timeline = Timeline::new();
        let mut report = RenderReport::default();

        for (index, cue) in cues.iter().enumerate() {
            // Each cue renders into scratch so a failure leaves no partial writes.
            let mut scratch = Timeline::new();
            match self.render_cue(cue, &mut scratch) {
                Ok((start, duration)) => {
                    timeline.merge(index, scratch);
                    report.rendered.push(RenderedCue {
                        index,
                        fixture: cue.fixture.clone(),
                        preset: cue.preset.clone(),
                        start,
                        duration,
                    });
                }
                Err(e) => {
                    tracing::warn!(cue = index, fixture = %cue.fixture, preset = %cue.preset, error = %e, "cue skipped");
                    report.skipped.push((index, e));
                }
            }
        }

        for fixture in self.fixtures.iter() {
            for (address, value) in fixture.arm_addresses() {
                timeline.sustain(address, value);
            }
        }

        tracing::debug!(
            rendered = report.rendered.len(),
            skipped = report.skipped.len(),
            writes = timeline.len(),
            "render finished"
        );
        (timeline, report)
    }

    /// Renders `cues` and paints the result into `canvas`.
    pub fn render_into(&self, cues: &[Cue], canvas: &Canvas) -> RenderReport {
        let (timeline, report) = self.render(cues);
        timeline.paint_onto(canvas);
        report
    }

    /// Returns `(start, duration)` in seconds.
    fn render_cue(&self, cue: &Cue, out: &mut Timeline) -> Result<(f64, f64), RenderError> {
        let fixture = self
            .fixtures
            .get(&cue.fixture)
            .ok_or_else(|| RenderError::UnknownFixture(cue.fixture.clone()))?;
        if fixture.channels.is_empty() {
            return Err(RenderError::UnmappedFixture(fixture.id.clone()));
        }
        let preset = match self.presets.get(&fixture.fixture_type, &cue.preset) {
            Some(Ok(preset)) => preset,
            Some(Err(reason)) => {
                return Err(RenderError::MalformedPreset {
                    preset: cue.preset.clone(),
                    reason: reason.clone(),
                });
            }
            None => {
                return Err(RenderError::UnknownPreset {
                    preset: cue.preset.clone(),
                    fixture_type: fixture.fixture_type.clone(),
                });
            }
        };

        let start = match cue.unit {
            TimeUnit::Seconds => cue.time,
            TimeUnit::Beats => beats_to_seconds(cue.time, self.bpm)?,
        };
        if !(start.is_finite() && start >= 0.0) {
            return Err(RenderError::InvalidTime(start));
        }

        let brightness = cue
            .param("brightness")
            .or_else(|| cue.param("intensity"))
            .map(|b| b as f32)
            .or(preset.brightness)
            .unwrap_or(1.0);
        let ctx = CueContext {
            fixture,
            start,
            brightness,
        };

        let unmapped = || RenderError::NoMappedChannels {
            preset: preset.name.clone(),
            fixture: fixture.id.clone(),
        };
        if preset.mode != PresetMode::Adsr
            && !preset.steps.is_empty()
            && !preset
                .steps
                .iter()
                .flat_map(PresetStep::roles)
                .any(|role| fixture.address(role).is_some())
        {
            return Err(unmapped());
        }

        let duration = match preset.mode {
            PresetMode::Single => {
                let steps = self.scaled_steps(cue, preset)?;
                let mut last = HashMap::new();
                self.render_steps(&ctx, &steps, 0.0, None, &mut last, out)
            }
            PresetMode::Loop => self.render_loop(cue, preset, &ctx, out)?,
            PresetMode::Adsr => self
                .render_adsr(cue, preset, &ctx, out)?
                .ok_or_else(unmapped)?,
        };
        Ok((start, duration))
    }

    /// Validated step list, time-scaled so it spans the cue's `duration`
    /// parameter when one is given.
    fn scaled_steps(&self, cue: &Cue, preset: &Preset) -> Result<Vec<PresetStep>, RenderError> {
        if preset.steps.is_empty() {
            return Err(RenderError::MalformedPreset {
                preset: preset.name.clone(),
                reason: String::from("empty step list"),
            });
        }
        if let Some(bad) = preset
            .steps
            .iter()
            .map(PresetStep::duration)
            .find(|d| !(d.is_finite() && *d >= 0.0))
        {
            return Err(RenderError::InvalidDuration(bad));
        }

        let total: f64 = preset.steps.iter().map(PresetStep::duration).sum();
        let scale = match cue.param("duration") {
            Some(d) if !(d.is_finite() && (0.0..=MAX_CUE_SPAN).contains(&d)) => {
                return Err(RenderError::InvalidDuration(d));
            }
            Some(d) if total > 0.0 => d / total,
            _ if total > MAX_CUE_SPAN => return Err(RenderError::InvalidDuration(total)),
            _ => 1.0,
        };
        Ok(preset
            .steps
            .iter()
            .cloned()
            .map(|mut step| {
                match &mut step {
                    PresetStep::Set { .. } => {}
                    PresetStep::Fade { duration, .. } | PresetStep::Hold { duration, .. } => {
                        *duration *= scale
                    }
                }
                step
            })
            .collect())
    }

    fn step_count(&self, duration: f64) -> usize {
        ((duration * self.render_rate).ceil() as usize).max(1)
    }

    /// Emits `steps` starting at `offset` seconds into the cue and returns the
    /// offset after the last step. Writes past `limit` (absolute) are dropped.
    fn render_steps(
        &self,
        ctx: &CueContext,
        steps: &[PresetStep],
        mut offset: f64,
        limit: Option<f64>,
        last: &mut HashMap<u16, f32>,
        out: &mut Timeline,
    ) -> f64 {
        let emit = |t: f64, values: &[(u16, f32)], out: &mut Timeline| {
            if limit.is_some_and(|l| t > l + 1e-9) {
                return;
            }
            out.append(t, values.iter().map(|(a, v)| (*a, clamp_level(*v))));
        };

        for step in steps {
            let t0 = ctx.start + offset;
            match step {
                PresetStep::Set { values } => {
                    let targets = ctx.resolve(values);
                    emit(t0, &targets, out);
                    last.extend(targets);
                }
                PresetStep::Fade {
                    values,
                    from,
                    duration,
                } => {
                    let targets = ctx.resolve(values);
                    let origins: HashMap<u16, f32> = ctx.resolve(from).into_iter().collect();
                    if *duration == 0.0 {
                        emit(t0, &targets, out);
                    } else {
                        let mut tweens: Vec<_> = targets
                            .iter()
                            .map(|(address, to)| {
                                let from = origins
                                    .get(address)
                                    .or_else(|| last.get(address))
                                    .copied()
                                    .unwrap_or(0.0);
                                (*address, Tweener::linear(from, *to, *duration as f32))
                            })
                            .collect();
                        let n = self.step_count(*duration);
                        let mut frame = Vec::with_capacity(tweens.len());
                        for i in 0..=n {
                            let elapsed = duration * i as f64 / n as f64;
                            frame.clear();
                            frame.extend(
                                tweens
                                    .iter_mut()
                                    .map(|(a, tw)| (*a, tw.move_to(elapsed as f32))),
                            );
                            emit(t0 + elapsed, &frame, out);
                        }
                    }
                    last.extend(targets);
                }
                PresetStep::Hold { values, duration } => {
                    let targets = ctx.resolve(values);
                    let n = self.step_count(*duration);
                    for i in 0..=n {
                        emit(t0 + duration * i as f64 / n as f64, &targets, out);
                    }
                    last.extend(targets);
                }
            }
            offset += step.duration();
        }
        offset
    }

    /// Repeats the step cycle while the elapsed offset is below the loop
    /// length. The recorded duration is the loop length; a cycle that would
    /// run past it is cut at the boundary.
    fn render_loop(
        &self,
        cue: &Cue,
        preset: &Preset,
        ctx: &CueContext,
        out: &mut Timeline,
    ) -> Result<f64, RenderError> {
        let steps = self.scaled_steps(cue, preset)?;
        let beats = cue
            .param("loop_beats")
            .or(preset.loop_beats)
            .ok_or_else(|| RenderError::MalformedPreset {
                preset: preset.name.clone(),
                reason: String::from("loop preset without loop_beats"),
            })?;
        let loop_duration = beats_to_seconds(beats, self.bpm)?;
        if !(loop_duration.is_finite() && loop_duration > 0.0 && loop_duration <= MAX_CUE_SPAN) {
            return Err(RenderError::InvalidDuration(loop_duration));
        }
        let cycle: f64 = steps.iter().map(PresetStep::duration).sum();
        if cycle <= 0.0 {
            return Err(RenderError::MalformedPreset {
                preset: preset.name.clone(),
                reason: String::from("loop cycle has no duration"),
            });
        }
        if loop_duration / cycle > MAX_LOOP_CYCLES {
            return Err(RenderError::MalformedPreset {
                preset: preset.name.clone(),
                reason: format!("loop cycle of {cycle}s is too short for {loop_duration}s"),
            });
        }

        let limit = ctx.start + loop_duration;
        let mut last = HashMap::new();
        let mut offset = 0.0;
        while offset < loop_duration {
            offset = self.render_steps(ctx, &steps, offset, Some(limit), &mut last, out);
        }
        Ok(loop_duration)
    }

    /// Returns the envelope length, or `None` when no role of the channel map
    /// is patched on the fixture.
    fn render_adsr(
        &self,
        cue: &Cue,
        preset: &Preset,
        ctx: &CueContext,
        out: &mut Timeline,
    ) -> Result<Option<f64>, RenderError> {
        let env: &AdsrEnvelope = preset.adsr.as_ref().ok_or_else(|| RenderError::MalformedPreset {
            preset: preset.name.clone(),
            reason: String::from("adsr preset without envelope"),
        })?;
        if env.channel_map.is_empty() {
            return Err(RenderError::MalformedPreset {
                preset: preset.name.clone(),
                reason: String::from("empty channel_map"),
            });
        }

        let attack = cue.param("attack_time").unwrap_or(env.attack.time);
        let decay = cue.param("decay_time").unwrap_or(env.decay.time);
        let sustain = cue.param("sustain_time").unwrap_or(env.sustain.time);
        let release = cue.param("release_time").unwrap_or(env.release.time);
        for time in [attack, decay, sustain, release] {
            if !(time.is_finite() && time >= 0.0) {
                return Err(RenderError::InvalidDuration(time));
            }
        }
        let total = attack + decay + sustain + release;
        if total > MAX_CUE_SPAN {
            return Err(RenderError::InvalidDuration(total));
        }
        let max_value = cue.param("max_value").map(|v| v as f32).unwrap_or(env.max_value);
        let scale = max_value * 255.0;

        let channels: Vec<(u16, f32)> = env
            .channel_map
            .iter()
            .filter_map(|(role, weight)| {
                let address = ctx.fixture.address(role)?;
                Some((address, ctx.scaled(role, weight.clamp(0.0, 1.0) * scale)))
            })
            .collect();
        if channels.is_empty() {
            return Ok(None);
        }

        let attack_level = env.attack.to;
        let decay_level = env.decay.to;
        let sustain_level = env.sustain.value.unwrap_or(decay_level);

        let mut t = ctx.start;
        for (from, to, time) in [
            (0.0, attack_level, attack),
            (attack_level, decay_level, decay),
            (sustain_level, sustain_level, sustain),
            (sustain_level, 0.0, release),
        ] {
            self.envelope_stage(&channels, t, from, to, time, out);
            t += time;
        }
        Ok(Some(total))
    }

    /// Ramps the envelope level from `from` to `to` over `time`, writing
    /// `level * weight` for every channel at each render step.
    fn envelope_stage(
        &self,
        channels: &[(u16, f32)],
        start: f64,
        from: f32,
        to: f32,
        time: f64,
        out: &mut Timeline,
    ) {
        if time == 0.0 {
            out.append(
                start,
                channels.iter().map(|(a, w)| (*a, clamp_level(w * to))),
            );
            return;
        }
        let mut level = Tweener::linear(from, to, time as f32);
        let n = self.step_count(time);
        for i in 0..=n {
            let elapsed = time * i as f64 / n as f64;
            let l = level.move_to(elapsed as f32);
            out.append(
                start + elapsed,
                channels.iter().map(|(a, w)| (*a, clamp_level(w * l))),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::show::{ReleaseStage, Stage, SustainStage};

    fn values(pairs: &[(&str, f32)]) -> BTreeMap<String, f32> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn par() -> Fixture {
        Fixture::new("par1", "par")
            .with_channel("dim", 1)
            .with_channel("red", 2)
            .with_channel("shutter", 5)
    }

    fn setup(presets: Vec<Preset>) -> (FixtureMap, PresetLibrary) {
        let fixtures: FixtureMap = [par()].into_iter().collect();
        let mut library = PresetLibrary::new();
        presets.into_iter().for_each(|p| library.insert(p));
        (fixtures, library)
    }

    #[test]
    fn beat_conversion_rejects_non_positive_bpm() {
        assert_eq!(beats_to_seconds(4.0, 120.0), Ok(2.0));
        assert_eq!(seconds_to_beats(2.0, 120.0), Ok(4.0));
        assert_eq!(beats_to_seconds(4.0, 0.0), Err(RenderError::InvalidBpm(0.0)));
        assert!(beats_to_seconds(4.0, -1.0).is_err());
    }

    #[test]
    fn fade_ramps_linearly_from_last_value() {
        let preset = Preset::single(
            "up",
            "par",
            vec![
                PresetStep::Set {
                    values: values(&[("dim", 100.0)]),
                },
                PresetStep::Fade {
                    values: values(&[("dim", 200.0)]),
                    from: BTreeMap::new(),
                    duration: 1.0,
                },
            ],
        );
        let (fixtures, library) = setup(vec![preset]);
        let (timeline, report) =
            RenderEngine::new(&fixtures, &library, 120.0).render(&[Cue::new("par1", "up", 1.0)]);

        assert!(report.skipped.is_empty());
        assert_eq!(report.duration_of(0), Some(1.0));
        assert_eq!(timeline.value_at(1, 1.0), Some(100));
        assert_eq!(timeline.value_at(1, 1.5), Some(150));
        assert_eq!(timeline.value_at(1, 2.0), Some(200));
        // 120 steps/sec over one second, both ends inclusive.
        assert_eq!(timeline.len(), 121);
    }

    #[test]
    fn brightness_scales_only_colour_channels() {
        let preset = Preset::single(
            "look",
            "par",
            vec![PresetStep::Set {
                values: values(&[("dim", 200.0), ("red", 200.0), ("gobo", 9.0)]),
            }],
        );
        let (fixtures, library) = setup(vec![preset]);
        let cue = Cue::new("par1", "look", 0.0).with_param("brightness", 0.5);
        let (timeline, _) = RenderEngine::new(&fixtures, &library, 120.0).render(&[cue]);
        let at = timeline.at(0.0).unwrap();
        assert_eq!(at.get(&1), Some(&200));
        assert_eq!(at.get(&2), Some(&100));
        assert_eq!(at.len(), 2);
    }

    #[test]
    fn hold_fills_its_span_at_render_rate() {
        let preset = Preset::single(
            "hold",
            "par",
            vec![PresetStep::Hold {
                values: values(&[("dim", 80.0)]),
                duration: 0.5,
            }],
        );
        let (fixtures, library) = setup(vec![preset]);
        let (timeline, _) = RenderEngine::new(&fixtures, &library, 120.0)
            .with_render_rate(10.0)
            .render(&[Cue::new("par1", "hold", 0.0)]);
        assert_eq!(timeline.len(), 6);
        assert!(timeline.iter().all(|(_, v)| v.get(&1) == Some(&80)));
    }

    #[test]
    fn duration_param_rescales_steps() {
        let preset = Preset::single(
            "flash",
            "par",
            vec![PresetStep::Fade {
                values: values(&[("dim", 0.0)]),
                from: values(&[("dim", 255.0)]),
                duration: 2.0,
            }],
        );
        let (fixtures, library) = setup(vec![preset]);
        let cue = Cue::new("par1", "flash", 0.0).with_param("duration", 0.5);
        let (timeline, report) = RenderEngine::new(&fixtures, &library, 120.0).render(&[cue]);
        assert_eq!(report.duration_of(0), Some(0.5));
        assert_eq!(timeline.value_at(1, 0.5), Some(0));
    }

    #[test]
    fn loop_duration_follows_tempo() {
        let mut preset = Preset::single(
            "pulse",
            "par",
            vec![
                PresetStep::Set {
                    values: values(&[("dim", 255.0)]),
                },
                PresetStep::Hold {
                    values: values(&[("dim", 255.0)]),
                    duration: 0.3,
                },
                PresetStep::Fade {
                    values: values(&[("dim", 0.0)]),
                    from: BTreeMap::new(),
                    duration: 0.4,
                },
            ],
        );
        preset.mode = PresetMode::Loop;
        preset.loop_beats = Some(8.0);
        let (fixtures, library) = setup(vec![preset]);
        let cue = Cue::new("par1", "pulse", 1.0);
        let (timeline, report) = RenderEngine::new(&fixtures, &library, 128.0).render(&[cue]);

        let expected = 60.0 / 128.0 * 8.0;
        assert!((report.duration_of(0).unwrap() - expected).abs() < 1e-9);
        let (last_t, _) = timeline.iter().last().unwrap();
        assert!(last_t <= 1.0 + expected + 1e-6);
        // The cycle restarts at 0.7s with a fresh set.
        assert_eq!(timeline.value_at(1, 1.7), Some(255));
    }

    #[test]
    fn loop_beats_override_and_missing_length() {
        let mut preset = Preset::single(
            "pulse",
            "par",
            vec![PresetStep::Hold {
                values: values(&[("dim", 255.0)]),
                duration: 0.25,
            }],
        );
        preset.mode = PresetMode::Loop;
        let (fixtures, library) = setup(vec![preset]);
        let engine = RenderEngine::new(&fixtures, &library, 60.0);

        let (_, report) = engine.render(&[Cue::new("par1", "pulse", 0.0)]);
        assert!(matches!(
            report.skipped[0].1,
            RenderError::MalformedPreset { .. }
        ));

        let (_, report) =
            engine.render(&[Cue::new("par1", "pulse", 0.0).with_param("loop_beats", 3.0)]);
        assert_eq!(report.duration_of(0), Some(3.0));

        let (timeline, report) = RenderEngine::new(&fixtures, &library, 0.0)
            .render(&[Cue::new("par1", "pulse", 0.0).with_param("loop_beats", 3.0)]);
        assert_eq!(report.skipped, vec![(0, RenderError::InvalidBpm(0.0))]);
        assert!(timeline.is_empty());
    }

    #[test]
    fn adsr_envelope_stages() {
        let preset = Preset {
            name: String::from("swell"),
            fixture_type: String::from("par"),
            mode: PresetMode::Adsr,
            steps: Vec::new(),
            brightness: None,
            loop_beats: None,
            adsr: Some(AdsrEnvelope {
                channel_map: values(&[("dim", 1.0), ("red", 0.5)]),
                max_value: 1.0,
                attack: Stage { to: 1.0, time: 0.5 },
                decay: Stage { to: 0.6, time: 0.5 },
                sustain: SustainStage {
                    value: None,
                    time: 1.0,
                },
                release: ReleaseStage { time: 1.0 },
            }),
        };
        let (fixtures, library) = setup(vec![preset]);
        let (timeline, report) = RenderEngine::new(&fixtures, &library, 120.0)
            .render(&[Cue::new("par1", "swell", 0.0)]);

        assert_eq!(report.duration_of(0), Some(3.0));
        assert_eq!(timeline.value_at(1, 0.0), Some(0));
        assert_eq!(timeline.value_at(1, 0.5), Some(255));
        assert_eq!(timeline.value_at(2, 0.5), Some(128));
        assert_eq!(timeline.value_at(1, 1.0), Some(153));
        assert_eq!(timeline.value_at(1, 1.5), Some(153));
        assert_eq!(timeline.value_at(1, 2.5), Some(77));
        assert_eq!(timeline.value_at(1, 3.0), Some(0));
    }

    #[test]
    fn unresolvable_cues_are_reported_and_skipped() {
        let preset = Preset::single(
            "flash",
            "par",
            vec![PresetStep::Set {
                values: values(&[("dim", 255.0)]),
            }],
        );
        let (fixtures, library) = setup(vec![preset]);
        let cues = [
            Cue::new("ghost", "flash", 0.0),
            Cue::new("par1", "missing", 0.0),
            Cue::new("par1", "flash", -1.0),
            Cue::new("par1", "flash", 2.0).in_beats(),
        ];
        let (timeline, report) = RenderEngine::new(&fixtures, &library, 120.0).render(&cues);

        assert_eq!(report.skipped.len(), 3);
        assert_eq!(
            report.skipped[0].1,
            RenderError::UnknownFixture(String::from("ghost"))
        );
        assert!(matches!(report.skipped[1].1, RenderError::UnknownPreset { .. }));
        assert_eq!(report.skipped[2].1, RenderError::InvalidTime(-1.0));
        assert_eq!(report.rendered.len(), 1);
        assert_eq!(report.rendered[0].start, 1.0);
        assert_eq!(timeline.len(), 1);
    }

    #[test]
    fn later_cues_win_at_equal_timestamps() {
        let a = Preset::single(
            "a",
            "par",
            vec![PresetStep::Set {
                values: values(&[("dim", 10.0)]),
            }],
        );
        let b = Preset::single(
            "b",
            "par",
            vec![PresetStep::Set {
                values: values(&[("dim", 20.0)]),
            }],
        );
        let (fixtures, library) = setup(vec![a, b]);
        let engine = RenderEngine::new(&fixtures, &library, 120.0);
        let (timeline, _) =
            engine.render(&[Cue::new("par1", "a", 1.0), Cue::new("par1", "b", 1.0)]);
        assert_eq!(timeline.value_at(1, 1.0), Some(20));
        let (timeline, _) =
            engine.render(&[Cue::new("par1", "b", 1.0), Cue::new("par1", "a", 1.0)]);
        assert_eq!(timeline.value_at(1, 1.0), Some(10));
    }

    #[test]
    fn armed_fixtures_hold_for_the_whole_canvas() {
        let fixtures: FixtureMap = [par().with_arm("shutter", 255)].into_iter().collect();
        let library = PresetLibrary::new();
        let canvas = Canvas::new(10.0, 44.0);
        let report = RenderEngine::new(&fixtures, &library, 120.0).render_into(&[], &canvas);

        assert!(report.rendered.is_empty());
        assert!(canvas.export().iter().all(|(_, f)| f[4] == 255));
    }

    #[test]
    fn painting_prefers_the_nearest_write_within_a_cue() {
        let mut timeline = Timeline::new();
        timeline.append(1.0, [(1, 200)]);
        timeline.append(1.04, [(1, 50)]);
        let canvas = Canvas::new(2.0, 10.0);
        timeline.paint_onto(&canvas);
        assert_eq!(canvas.get_frame(1.0)[0], 200);
    }

    #[test]
    fn later_cue_wins_a_shared_frame() {
        let off = Preset::single(
            "off",
            "par",
            vec![PresetStep::Set {
                values: values(&[("dim", 0.0)]),
            }],
        );
        let on = Preset::single(
            "on",
            "par",
            vec![PresetStep::Set {
                values: values(&[("dim", 255.0)]),
            }],
        );
        let (fixtures, library) = setup(vec![off, on]);
        let engine = RenderEngine::new(&fixtures, &library, 120.0);

        let canvas = Canvas::new(3.0, 44.0);
        let report = engine.render_into(
            &[Cue::new("par1", "off", 1.0), Cue::new("par1", "on", 1.01)],
            &canvas,
        );
        assert_eq!(report.rendered.len(), 2);
        assert_eq!(canvas.get_frame(1.0)[0], 255);

        let canvas = Canvas::new(3.0, 44.0);
        engine.render_into(
            &[Cue::new("par1", "on", 1.01), Cue::new("par1", "off", 1.0)],
            &canvas,
        );
        assert_eq!(canvas.get_frame(1.0)[0], 0);
    }

    #[test]
    fn cues_that_drive_no_channel_are_skipped() {
        let flash = Preset::single(
            "flash",
            "par",
            vec![PresetStep::Set {
                values: values(&[("dim", 255.0)]),
            }],
        );
        let mut glow = Preset::single("glow", "par", Vec::new());
        glow.mode = PresetMode::Adsr;
        glow.adsr = Some(AdsrEnvelope {
            channel_map: values(&[("uv", 1.0)]),
            max_value: 1.0,
            attack: Stage { to: 1.0, time: 0.5 },
            decay: Stage { to: 0.5, time: 0.5 },
            sustain: SustainStage {
                value: None,
                time: 0.5,
            },
            release: ReleaseStage { time: 0.5 },
        });
        let gobo = Preset::single(
            "gobo",
            "par",
            vec![PresetStep::Set {
                values: values(&[("gobo", 30.0)]),
            }],
        );
        let mut library = PresetLibrary::new();
        [flash, glow, gobo].into_iter().for_each(|p| library.insert(p));
        let fixtures: FixtureMap = [par(), Fixture::new("bare", "par")].into_iter().collect();

        let (timeline, report) = RenderEngine::new(&fixtures, &library, 120.0).render(&[
            Cue::new("bare", "flash", 0.0),
            Cue::new("par1", "glow", 0.0),
            Cue::new("par1", "gobo", 0.0),
        ]);
        assert!(report.rendered.is_empty());
        assert!(timeline.is_empty());
        assert_eq!(
            report.skipped[0].1,
            RenderError::UnmappedFixture(String::from("bare"))
        );
        for (_, err) in &report.skipped[1..] {
            assert!(matches!(err, RenderError::NoMappedChannels { .. }));
        }
    }

    #[test]
    fn oversized_spans_are_rejected() {
        let mut pulse = Preset::single(
            "pulse",
            "par",
            vec![
                PresetStep::Set {
                    values: values(&[("dim", 255.0)]),
                },
                PresetStep::Hold {
                    values: values(&[("dim", 255.0)]),
                    duration: 0.000_001,
                },
            ],
        );
        pulse.mode = PresetMode::Loop;
        pulse.loop_beats = Some(8.0);
        let flash = Preset::single(
            "flash",
            "par",
            vec![PresetStep::Fade {
                values: values(&[("dim", 0.0)]),
                from: values(&[("dim", 255.0)]),
                duration: 1.0,
            }],
        );
        let (fixtures, library) = setup(vec![pulse, flash]);
        let (timeline, report) = RenderEngine::new(&fixtures, &library, 120.0).render(&[
            Cue::new("par1", "pulse", 0.0),
            Cue::new("par1", "pulse", 0.0).with_param("loop_beats", 1e9),
            Cue::new("par1", "flash", 0.0).with_param("duration", 1e12),
        ]);
        assert!(timeline.is_empty());
        assert!(matches!(
            report.skipped[0].1,
            RenderError::MalformedPreset { .. }
        ));
        assert!(matches!(report.skipped[1].1, RenderError::InvalidDuration(_)));
        assert_eq!(report.skipped[2].1, RenderError::InvalidDuration(1e12));
    }
}
