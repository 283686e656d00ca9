use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::StreamError;

/// How long an answer the caller asked for; selects the buffer cap.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseDepth {
    /// Short answers.
    Quick,
    /// Regular answers.
    #[default]
    Standard,
    /// Long-form research answers.
    Deep,
}

impl ResponseDepth {
    /// Character cap on the retained buffer for this depth.
    pub fn max_buffer_size(self) -> usize {
        match self {
            Self::Quick => 20_000,
            Self::Standard => 100_000,
            Self::Deep => 500_000,
        }
    }

    /// Next lighter depth, offered as a fallback after a failed stream.
    pub fn lighter(self) -> Option<Self> {
        match self {
            Self::Deep => Some(Self::Standard),
            Self::Standard => Some(Self::Quick),
            Self::Quick => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Standard => "standard",
            Self::Deep => "deep",
        }
    }
}

impl fmt::Display for ResponseDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResponseDepth {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quick" => Ok(Self::Quick),
            "standard" => Ok(Self::Standard),
            "deep" => Ok(Self::Deep),
            other => Err(StreamError::Config(format!(
                "unknown response depth `{other}` (expected quick, standard or deep)"
            ))),
        }
    }
}

/// Tuning for a `StreamController`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    /// Character cap on the retained buffer; oldest content is dropped past it.
    pub max_buffer_size: usize,
    /// Deltas longer than this many characters are split before enqueueing.
    pub chunk_size: usize,
    /// Queued sub-fragments applied per frame tick.
    pub batch_size: usize,
    /// Pace of the drain loop.
    pub frame_interval: Duration,
    /// Fixed response-length guess used for percent and ETA.
    pub estimated_total_tokens: u64,
    /// Longest allowed gap between body reads. `None` waits forever.
    pub idle_timeout: Option<Duration>,
    /// Longest allowed line before a newline arrives.
    pub max_line_bytes: usize,
    /// TCP/TLS connect timeout for the HTTP client.
    pub connect_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::for_depth(ResponseDepth::default())
    }
}

impl StreamConfig {
    /// Defaults with the buffer cap taken from `depth`.
    pub fn for_depth(depth: ResponseDepth) -> Self {
        Self {
            max_buffer_size: depth.max_buffer_size(),
            chunk_size: 150,
            batch_size: 5,
            frame_interval: Duration::from_millis(16),
            estimated_total_tokens: 500,
            idle_timeout: Some(Duration::from_secs(60)),
            max_line_bytes: 1024 * 1024,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Builds a config from environment variables on top of the defaults.
    ///
    /// - `COUNSEL_STREAM_DEPTH`: `quick`, `standard` or `deep`.
    /// - `COUNSEL_STREAM_MAX_BUFFER`: explicit character cap (overrides depth).
    /// - `COUNSEL_STREAM_CHUNK_SIZE`: sub-fragment size.
    /// - `COUNSEL_STREAM_IDLE_TIMEOUT_SECS`: idle timeout, `0` disables it.
    pub fn from_env() -> Result<Self, StreamError> {
        let depth = match read_env("COUNSEL_STREAM_DEPTH") {
            Some(raw) => raw.parse()?,
            None => ResponseDepth::default(),
        };
        let mut config = Self::for_depth(depth);
        if let Some(cap) = parse_env::<usize>("COUNSEL_STREAM_MAX_BUFFER")? {
            config.max_buffer_size = cap;
        }
        if let Some(size) = parse_env::<usize>("COUNSEL_STREAM_CHUNK_SIZE")? {
            config.chunk_size = size;
        }
        if let Some(secs) = parse_env::<u64>("COUNSEL_STREAM_IDLE_TIMEOUT_SECS")? {
            config.idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn max_buffer_size(mut self, chars: usize) -> Self {
        self.max_buffer_size = chars;
        self
    }

    pub fn chunk_size(mut self, chars: usize) -> Self {
        self.chunk_size = chars;
        self
    }

    pub fn batch_size(mut self, fragments: usize) -> Self {
        self.batch_size = fragments;
        self
    }

    pub fn frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn estimated_total_tokens(mut self, tokens: u64) -> Self {
        self.estimated_total_tokens = tokens;
        self
    }

    /// Sets or disables (`None`) the idle timeout.
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn max_line_bytes(mut self, bytes: usize) -> Self {
        self.max_line_bytes = bytes;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Rejects values that would stall or never drain the pipeline.
    pub fn validate(&self) -> Result<(), StreamError> {
        let checks = [
            (self.max_buffer_size == 0, "max_buffer_size must be greater than 0"),
            (self.chunk_size == 0, "chunk_size must be greater than 0"),
            (self.batch_size == 0, "batch_size must be greater than 0"),
            (self.frame_interval.is_zero(), "frame_interval must be greater than 0"),
            (
                self.estimated_total_tokens == 0,
                "estimated_total_tokens must be greater than 0",
            ),
            (self.max_line_bytes == 0, "max_line_bytes must be greater than 0"),
            (
                self.idle_timeout.is_some_and(|t| t.is_zero()),
                "idle_timeout must be greater than 0 when set",
            ),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(StreamError::Config((*message).to_string())),
            None => Ok(()),
        }
    }
}

fn read_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T: FromStr>(key: &str) -> Result<Option<T>, StreamError> {
    match read_env(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| StreamError::Config(format!("invalid value for {key}: `{raw}`"))),
        None => Ok(None),
    }
}
