//! Server configuration from environment variables.

use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::SettingsError;

/// Which remuxer joins decrypted shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemuxerKind {
    /// `ffmpeg -f concat -c copy`
    Ffmpeg,
    /// Plain byte concatenation
    Concat,
}

impl FromStr for RemuxerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ffmpeg" => Ok(RemuxerKind::Ffmpeg),
            "concat" => Ok(RemuxerKind::Concat),
            other => Err(format!("expected ffmpeg or concat, got {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerSettings {
    pub port: u16,
    pub bind_addr: IpAddr,
    pub data_dir: PathBuf,
    pub total_shards: usize,
    pub playback_hours: u32,
    pub audit_log_capacity: usize,
    pub max_upload_bytes: usize,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub remuxer: RemuxerKind,
    pub default_theatre_id: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: 5000,
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            data_dir: PathBuf::from("./data"),
            total_shards: 4,
            playback_hours: 3,
            audit_log_capacity: 500,
            max_upload_bytes: 500 * 1024 * 1024,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            remuxer: RemuxerKind::Ffmpeg,
            default_theatre_id: "THEATRE_001".to_string(),
        }
    }
}

impl ServerSettings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Build settings from any variable source; unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SettingsError> {
        let defaults = Self::default();
        Ok(Self {
            port: parse_var(&lookup, "PORT", defaults.port)?,
            bind_addr: parse_var(&lookup, "BIND_ADDR", defaults.bind_addr)?,
            data_dir: lookup("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            total_shards: positive(parse_var(&lookup, "TOTAL_SHARDS", defaults.total_shards)?, "TOTAL_SHARDS")?,
            playback_hours: positive(parse_var(&lookup, "PLAYBACK_HOURS", defaults.playback_hours)?, "PLAYBACK_HOURS")?,
            audit_log_capacity: positive(
                parse_var(&lookup, "AUDIT_LOG_CAPACITY", defaults.audit_log_capacity)?,
                "AUDIT_LOG_CAPACITY",
            )?,
            max_upload_bytes: positive(
                parse_var(&lookup, "MAX_UPLOAD_BYTES", defaults.max_upload_bytes)?,
                "MAX_UPLOAD_BYTES",
            )?,
            ffmpeg_path: lookup("FFMPEG_PATH").map(PathBuf::from).unwrap_or(defaults.ffmpeg_path),
            ffprobe_path: lookup("FFPROBE_PATH").map(PathBuf::from).unwrap_or(defaults.ffprobe_path),
            remuxer: parse_var(&lookup, "REMUXER", defaults.remuxer)?,
            default_theatre_id: lookup("DEFAULT_THEATRE_ID")
                .map(|id| id.trim().to_uppercase())
                .filter(|id| !id.is_empty())
                .unwrap_or(defaults.default_theatre_id),
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    pub fn playback_window(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.playback_hours))
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, var: &str, default: T) -> Result<T, SettingsError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| SettingsError::Invalid {
            var: var.to_string(),
            reason: e.to_string(),
            value,
        }),
    }
}

fn positive<T: PartialEq + Default + ToString>(value: T, var: &str) -> Result<T, SettingsError> {
    if value == T::default() {
        return Err(SettingsError::Invalid {
            var: var.to_string(),
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = ServerSettings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings, ServerSettings::default());
        assert_eq!(settings.listen_addr().to_string(), "0.0.0.0:5000");
        assert_eq!(settings.playback_window(), chrono::Duration::hours(3));
        assert_eq!(settings.max_upload_bytes, 524_288_000);
    }

    #[test]
    fn test_overrides() {
        let settings = ServerSettings::from_lookup(lookup(&[
            ("PORT", "8088"),
            ("BIND_ADDR", "127.0.0.1"),
            ("DATA_DIR", "/var/lib/cinemashield"),
            ("TOTAL_SHARDS", "6"),
            ("PLAYBACK_HOURS", "2"),
            ("REMUXER", "CONCAT"),
            ("DEFAULT_THEATRE_ID", " theatre_777 "),
        ]))
        .unwrap();
        assert_eq!(settings.listen_addr().to_string(), "127.0.0.1:8088");
        assert_eq!(settings.data_dir, PathBuf::from("/var/lib/cinemashield"));
        assert_eq!(settings.total_shards, 6);
        assert_eq!(settings.playback_hours, 2);
        assert_eq!(settings.remuxer, RemuxerKind::Concat);
        assert_eq!(settings.default_theatre_id, "THEATRE_777");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = ServerSettings::from_lookup(lookup(&[("PORT", "eighty")])).unwrap_err();
        assert!(err.to_string().contains("PORT"));

        assert!(ServerSettings::from_lookup(lookup(&[("TOTAL_SHARDS", "0")])).is_err());
        assert!(ServerSettings::from_lookup(lookup(&[("REMUXER", "gstreamer")])).is_err());
    }
}
