use std::ops::RangeInclusive;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{bail, Result};

#[derive(Clone, Debug)]
pub struct Config {
    pub sip_host: String,
    pub sip_port: u16,
    /// SDP / Via / Contact に埋め込む外向きアドレス
    pub server_address: String,
    pub rtp_host: String,
    pub rtp_port: u16,
    pub ext_min: u32,
    pub ext_max: u32,
    pub call_setup_timeout: Duration,
    pub registration_timeout_secs: u64,
    pub cleanup_interval: Duration,
    pub admin_http_addr: String,
}

impl Config {
    /// 環境変数から設定を読む。未設定のキーは既定値に落ちる。
    ///
    /// - SIP_HOST (default "0.0.0.0") / SIP_PORT (default 5060)
    /// - SERVER_ADDRESS (default: SIP_HOST)
    /// - RTP_HOST (default "0.0.0.0") / RTP_PORT (default 10000)
    /// - EXT_MIN (default 100) / EXT_MAX (default 110)
    /// - CALL_SETUP_TIMEOUT_MS (default 30000)
    /// - REGISTRATION_TIMEOUT_SEC (default 3600)
    /// - CLEANUP_INTERVAL_MS (default 60000)
    /// - ADMIN_HTTP_ADDR (default "0.0.0.0:8080")
    pub fn from_env() -> Result<Self> {
        let sip_host = env_string("SIP_HOST", "0.0.0.0");
        let sip_port = env_u16("SIP_PORT", 5060);
        let server_address = std::env::var("SERVER_ADDRESS").unwrap_or_else(|_| sip_host.clone());
        let rtp_host = env_string("RTP_HOST", "0.0.0.0");
        let rtp_port = env_u16("RTP_PORT", 10000);
        let ext_min = env_u32("EXT_MIN", 100);
        let ext_max = env_u32("EXT_MAX", 110);
        if ext_min > ext_max {
            bail!("EXT_MIN={} must not exceed EXT_MAX={}", ext_min, ext_max);
        }

        Ok(Self {
            sip_host,
            sip_port,
            server_address,
            rtp_host,
            rtp_port,
            ext_min,
            ext_max,
            call_setup_timeout: Duration::from_millis(env_u64("CALL_SETUP_TIMEOUT_MS", 30_000)),
            registration_timeout_secs: env_u64("REGISTRATION_TIMEOUT_SEC", 3600),
            cleanup_interval: Duration::from_millis(env_u64("CLEANUP_INTERVAL_MS", 60_000)),
            admin_http_addr: env_string("ADMIN_HTTP_ADDR", "0.0.0.0:8080"),
        })
    }

    pub fn extensions(&self) -> RangeInclusive<u32> {
        self.ext_min..=self.ext_max
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogMode {
    Stdout,
    File,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub mode: LogMode,
    pub dir: Option<String>,
    pub file_name: String,
}

impl LoggingConfig {
    fn from_env() -> Self {
        let format = match env_string("LOG_FORMAT", "text").to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };
        let mode = match env_string("LOG_MODE", "stdout").to_ascii_lowercase().as_str() {
            "file" => LogMode::File,
            _ => LogMode::Stdout,
        };
        Self {
            format,
            mode,
            dir: std::env::var("LOG_DIR").ok(),
            file_name: env_string("LOG_FILE", "mini-pbx.log"),
        }
    }
}

static LOGGING_CONFIG: OnceLock<LoggingConfig> = OnceLock::new();

pub fn logging_config() -> &'static LoggingConfig {
    LOGGING_CONFIG.get_or_init(LoggingConfig::from_env)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u16(key: &str, default: u16) -> u16 {
    env_parse(key, default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env_parse(key, default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_parse(key, default)
}

fn env_parse<T: std::str::FromStr + std::fmt::Display + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                log::warn!("[config] invalid {}={}, fallback to {}", key, raw, default);
                default
            }
        },
        Err(_) => default,
    }
}
