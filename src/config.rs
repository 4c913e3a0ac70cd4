//! Environment-driven service configuration.
//!
//! Every knob has a default except the RTMP destination, which is required:
//! either `RTMP_URL` directly, or `STREAM_KEY` from which the Twitch ingest
//! URL is derived. Missing RTMP configuration is a fatal startup error.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Default cap on clip duration, enforced at probe time.
const DEFAULT_MAX_DURATION_SECONDS: f64 = 600.0;

/// Default cap on downloaded file size.
const DEFAULT_MAX_FILE_SIZE_MB: u64 = 500;

/// Configuration errors. All are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Neither `RTMP_URL` nor `STREAM_KEY` is set.
    #[error("no RTMP destination configured: set RTMP_URL or STREAM_KEY")]
    MissingRtmpUrl,

    /// An environment variable holds a value that cannot be parsed.
    #[error("invalid value for {name}: {value:?} ({expected})")]
    Invalid {
        /// Environment variable name.
        name: &'static str,
        /// The offending value.
        value: String,
        /// What was expected.
        expected: &'static str,
    },
}

/// Runtime settings, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Maximum clip duration; longer probes fail with `duration_exceeded`.
    pub max_duration_seconds: f64,
    /// Maximum downloaded file size in megabytes.
    pub max_file_size_mb: u64,
    /// Video bitrate passed to the encoder (e.g. `3000k`).
    pub stream_bitrate_video: String,
    /// Audio bitrate passed to the encoder (e.g. `128k`).
    pub stream_bitrate_audio: String,
    /// x264 preset for the encoder.
    pub stream_preset: String,
    /// Directory holding fetched media files.
    pub media_dir: PathBuf,
    /// SQLite database file.
    pub database_path: PathBuf,
    /// Static image looped while the queue is empty.
    pub idle_image: PathBuf,
    /// Outbound RTMP sink.
    pub rtmp_url: String,
    /// Fallback moderation executable, used when the classifier is unavailable.
    pub content_filter_script: Option<PathBuf>,
    /// Directory holding the classifier artefacts (visual tower + prompt embeddings).
    pub model_dir: Option<PathBuf>,
    /// yt-dlp executable name or path.
    pub ytdlp_bin: String,
    /// ffmpeg executable name or path.
    pub ffmpeg_bin: String,
}

impl Settings {
    /// Loads settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingRtmpUrl`] when no RTMP destination is
    /// configured, or [`ConfigError::Invalid`] when a numeric variable does
    /// not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let rtmp_url = match env::var("RTMP_URL") {
            Ok(url) if !url.trim().is_empty() => url,
            _ => match env::var("STREAM_KEY") {
                Ok(key) if !key.trim().is_empty() => {
                    format!("rtmp://live.twitch.tv/app/{key}")
                }
                _ => return Err(ConfigError::MissingRtmpUrl),
            },
        };

        Ok(Self {
            max_duration_seconds: parse_env(
                "MAX_DURATION_SECONDS",
                DEFAULT_MAX_DURATION_SECONDS,
                "a positive number of seconds",
            )?,
            max_file_size_mb: parse_env(
                "MAX_FILE_SIZE_MB",
                DEFAULT_MAX_FILE_SIZE_MB,
                "a positive integer of megabytes",
            )?,
            stream_bitrate_video: env_or("STREAM_BITRATE_VIDEO", "3000k"),
            stream_bitrate_audio: env_or("STREAM_BITRATE_AUDIO", "128k"),
            stream_preset: env_or("STREAM_PRESET", "veryfast"),
            media_dir: PathBuf::from(env_or("MEDIA_DIR", "./media")),
            database_path: PathBuf::from(env_or("DATABASE_PATH", "./data/queue.db")),
            idle_image: PathBuf::from(env_or("IDLE_IMAGE", "./assets/idle.png")),
            rtmp_url,
            content_filter_script: env::var("CONTENT_FILTER_SCRIPT")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            model_dir: env::var("MODEL_DIR")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            ytdlp_bin: env_or("YTDLP_BIN", "yt-dlp"),
            ffmpeg_bin: env_or("FFMPEG_BIN", "ffmpeg"),
        })
    }

    /// Maximum clip duration as a [`Duration`].
    #[must_use]
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs_f64(self.max_duration_seconds)
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env<T: std::str::FromStr>(
    name: &'static str,
    default: T,
    expected: &'static str,
) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|_| ConfigError::Invalid {
                name,
                value: raw,
                expected,
            })
        }
        _ => Ok(default),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // Environment-variable tests mutate process-global state, so each test
    // uses variables it sets and unsets itself and avoids the shared names.

    #[test]
    fn test_parse_env_uses_default_when_unset() {
        let value: f64 = parse_env("JUKESTREAM_TEST_UNSET_VAR", 600.0, "seconds").unwrap();
        assert!((value - 600.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_env_rejects_garbage() {
        // SAFETY: test-local variable name, no other test reads it.
        unsafe { env::set_var("JUKESTREAM_TEST_GARBAGE", "not-a-number") };
        let result: Result<u64, _> = parse_env("JUKESTREAM_TEST_GARBAGE", 500, "megabytes");
        unsafe { env::remove_var("JUKESTREAM_TEST_GARBAGE") };

        let err = result.unwrap_err();
        assert!(err.to_string().contains("JUKESTREAM_TEST_GARBAGE"));
        assert!(err.to_string().contains("not-a-number"));
    }

    #[test]
    fn test_env_or_prefers_set_value() {
        unsafe { env::set_var("JUKESTREAM_TEST_PRESET", "faster") };
        assert_eq!(env_or("JUKESTREAM_TEST_PRESET", "veryfast"), "faster");
        unsafe { env::remove_var("JUKESTREAM_TEST_PRESET") };
    }

    #[test]
    fn test_env_or_falls_back_on_blank() {
        unsafe { env::set_var("JUKESTREAM_TEST_BLANK", "   ") };
        assert_eq!(env_or("JUKESTREAM_TEST_BLANK", "veryfast"), "veryfast");
        unsafe { env::remove_var("JUKESTREAM_TEST_BLANK") };
    }
}
