use lofty::prelude::*;
use scan_fmt::scan_fmt;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Invalid IP:Port formatting: {0}")]
    InvalidEndpoint(String),
    #[error("Invalid {name}: {value}. Must be greater than 0")]
    NonPositive { name: &'static str, value: f64 },
}

/// Runtime settings of a show.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct ShowConfig {
    /// Canvas quantisation and playback cadence, frames per second
    pub frame_rate: f64,
    /// Stepping rate of fades, holds and sustains in the render engine
    pub render_rate: f64,
    /// Maximum packets per second the sender lets through
    pub max_send_rate: f64,
    /// Art-Net destination, `a.b.c.d:port`
    pub destination: String,
    pub universe: u16,
    /// Seconds a sync report may differ from the local clock before a seek
    pub drift_tolerance: f64,
    /// Send all-zero frames while playback is not running
    pub blackout_when_stopped: bool,
    /// Where external playback reports arrive, `a.b.c.d:port`
    pub sync_listen: String,
    /// Seconds appended to the track length for release tails
    pub duration_pad: f64,
    /// Canvas length when the track length is unknown
    pub default_duration: f64,
}

impl Default for ShowConfig {
    fn default() -> Self {
        Self {
            frame_rate: 44.0,
            render_rate: 120.0,
            max_send_rate: 44.0,
            destination: String::from("127.0.0.1:6454"),
            universe: 0,
            drift_tolerance: 0.1,
            blackout_when_stopped: false,
            sync_listen: String::from("0.0.0.0:9000"),
            duration_pad: 5.0,
            default_duration: 300.0,
        }
    }
}

impl ShowConfig {
    /// Rejects settings nothing downstream can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("frame_rate", self.frame_rate),
            ("render_rate", self.render_rate),
            ("max_send_rate", self.max_send_rate),
            ("default_duration", self.default_duration),
        ];
        for (name, value) in positive {
            if !(value > 0.0) {
                return Err(ConfigError::NonPositive { name, value });
            }
        }
        if !(self.drift_tolerance >= 0.0) {
            return Err(ConfigError::NonPositive {
                name: "drift_tolerance",
                value: self.drift_tolerance,
            });
        }
        parse_endpoint(&self.destination)?;
        parse_endpoint(&self.sync_listen)?;
        Ok(())
    }

    pub fn destination_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_endpoint(&self.destination)
    }

    pub fn sync_listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_endpoint(&self.sync_listen)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate)
    }

    /// Canvas length for a track: its length plus the trailing pad, or the
    /// default window when the length is unknown.
    pub fn canvas_duration(&self, track_length: Option<f64>) -> f64 {
        match track_length {
            Some(len) if len > 0.0 => len + self.duration_pad.max(0.0),
            _ => self.default_duration,
        }
    }
}

/// Parses an `a.b.c.d:port` endpoint.
pub fn parse_endpoint(address: &str) -> Result<SocketAddr, ConfigError> {
    match scan_fmt!(address, "{}.{}.{}.{}:{}", u8, u8, u8, u8, u16) {
        Ok((a, b, c, d, port)) => Ok(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(a, b, c, d)),
            port,
        )),
        Err(_) => Err(ConfigError::InvalidEndpoint(address.to_string())),
    }
}

/// Reads the length of an audio file in seconds, `None` when it cannot be read.
pub fn probe_track_length(path: &Path) -> Option<f64> {
    match lofty::read_from_path(path) {
        Ok(tagged_file) => {
            let secs = tagged_file.properties().duration().as_secs_f64();
            (secs > 0.0).then_some(secs)
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "could not read track length");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_parse_dotted_quads() {
        let addr = parse_endpoint("10.0.0.7:6454").unwrap();
        assert_eq!(addr.port(), 6454);
        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
        assert!(matches!(
            parse_endpoint("localhost:6454"),
            Err(ConfigError::InvalidEndpoint(_))
        ));
        assert!(parse_endpoint("300.0.0.1:1").is_err());
    }

    #[test]
    fn defaults_validate() {
        assert!(ShowConfig::default().validate().is_ok());
    }

    #[test]
    fn non_positive_rates_are_rejected() {
        let config = ShowConfig {
            frame_rate: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NonPositive { name: "frame_rate", .. })
        ));
    }

    #[test]
    fn canvas_duration_pads_known_tracks() {
        let config = ShowConfig::default();
        assert_eq!(config.canvas_duration(Some(180.0)), 185.0);
        assert_eq!(config.canvas_duration(None), 300.0);
        assert_eq!(config.canvas_duration(Some(0.0)), 300.0);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: ShowConfig =
            serde_json::from_str(r#"{"frame_rate": 60.0, "universe": 3}"#).unwrap();
        assert_eq!(config.frame_rate, 60.0);
        assert_eq!(config.universe, 3);
        assert_eq!(config.render_rate, 120.0);
    }
}
