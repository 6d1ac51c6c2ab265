//! Process configuration
//!
//! Loaded once from a TOML file at startup and read-only thereafter.
//! Every knob has a default matching the engine's built-in constants, so
//! an absent file (or an empty one) yields a fully working
//! configuration. The `[accel]` section is the middle tier of parameter
//! resolution: only keys the operator actually wrote participate in the
//! overlay, which is why every field there is an `Option`.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;

/// Top-level configuration object.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub accel: AccelDefaults,
    pub scheduler: SchedulerConfig,
    pub streaming: StreamingConfig,
    pub registry: RegistryConfig,
    pub transports: TransportsConfig,
}

/// Operator-provided generation parameter defaults. Absent keys leave
/// the accelerator library's own defaults in force.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AccelDefaults {
    pub model_path: Option<String>,
    pub max_context_len: Option<i32>,
    pub max_new_tokens: Option<i32>,
    pub top_k: Option<i32>,
    pub n_keep: Option<i32>,
    pub top_p: Option<f32>,
    pub temperature: Option<f32>,
    pub repeat_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub mirostat: Option<i32>,
    pub mirostat_tau: Option<f32>,
    pub mirostat_eta: Option<f32>,
    pub skip_special_token: Option<bool>,
    pub extend: ExtendDefaults,
}

/// Overlay for the nested extension parameter block.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtendDefaults {
    pub base_domain_id: Option<i32>,
    pub embed_flash: Option<i8>,
    pub enabled_cpus_num: Option<i8>,
    pub enabled_cpus_mask: Option<u32>,
    pub n_batch: Option<u8>,
    pub use_cross_attn: Option<i8>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Bounded task queue capacity; enqueue past this fails fast.
    pub queue_capacity: usize,
    /// Tasks older than this at dequeue time get a Timeout response
    /// without ever reaching the accelerator.
    pub request_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            request_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamingConfig {
    /// Fixed session slot count.
    pub max_sessions: usize,
    /// Per-session token ring buffer capacity in bytes.
    pub ring_capacity: usize,
    /// Bounded FIFO of formatted chunks pending transport delivery.
    pub chunk_queue_depth: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_sessions: 16,
            ring_capacity: 16 * 1024,
            chunk_queue_depth: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Fixed slot table capacity.
    pub capacity: usize,
    /// Entry lifetime from creation.
    pub ttl_secs: u64,
    /// Minimum spacing between expiry sweeps.
    pub sweep_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            ttl_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportsConfig {
    pub tcp: TcpConfig,
    pub udp: UdpConfig,
    pub http: HttpConfig,
    pub ws: WsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TcpConfig {
    pub port: u16,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self { port: 9301 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UdpConfig {
    pub port: u16,
    /// Response datagrams are capped below typical MTU.
    pub max_datagram_bytes: usize,
    /// Optional reliability: resend attempts for failed sends.
    pub max_retries: u32,
    pub retry_timeout_ms: u64,
    /// Chunk-drain poll interval while a stream is paused.
    pub poll_interval_ms: u64,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            port: 9302,
            max_datagram_bytes: 1400,
            max_retries: 3,
            retry_timeout_ms: 250,
            poll_interval_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    pub port: u16,
    pub poll_interval_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 9300,
            poll_interval_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WsConfig {
    pub port: u16,
    pub poll_interval_ms: u64,
    pub keep_alive_interval_ms: u64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            port: 9303,
            poll_interval_ms: 50,
            keep_alive_interval_ms: 30_000,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        toml::from_str(&raw).map_err(|e| {
            Error::Config(format!("cannot parse {}: {e}", path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_engine_constants() {
        let config = Config::default();
        assert_eq!(config.scheduler.queue_capacity, 100);
        assert_eq!(config.scheduler.request_timeout_ms, 30_000);
        assert_eq!(config.streaming.max_sessions, 16);
        assert_eq!(config.streaming.ring_capacity, 16 * 1024);
        assert_eq!(config.streaming.chunk_queue_depth, 64);
        assert_eq!(config.registry.capacity, 100);
        assert_eq!(config.registry.ttl_secs, 300);
        assert_eq!(config.transports.udp.max_datagram_bytes, 1400);
        assert_eq!(config.transports.ws.keep_alive_interval_ms, 30_000);
        assert!(config.accel.model_path.is_none());
    }

    #[test]
    fn partial_file_overrides_only_named_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[accel]
temperature = 0.2
max_new_tokens = 512

[accel.extend]
n_batch = 4

[scheduler]
queue_capacity = 8
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.accel.temperature, Some(0.2));
        assert_eq!(config.accel.max_new_tokens, Some(512));
        assert_eq!(config.accel.extend.n_batch, Some(4));
        assert!(config.accel.top_k.is_none());
        assert_eq!(config.scheduler.queue_capacity, 8);
        // untouched sections keep defaults
        assert_eq!(config.streaming.max_sessions, 16);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[accel]\nbanana = 1\n").unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = Config::load(Path::new("/nonexistent/inferd.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
