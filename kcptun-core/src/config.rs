//! JSON configuration: load, validate, and reject the legacy flat schema in favor of the
//! sectioned `kcp`/`tcp`/`udp` layout (`kcp_bind`, `kcp_connect`, `udp.{sndbuf,rcvbuf}`,
//! `tcp.{reuseport,keepalive,nodelay,sndbuf,rcvbuf}`, `method`, `password`, `psk`,
//! `linger`, `timeout`, `keepalive`, `time_wait`, `loglevel`, `user`), loaded via
//! `serde_json`.

use crate::crypto::{self, KEY_SIZE};
use crate::error::{Error, Result};
use crate::session::KcpTuning;
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

/// Keys from the legacy flat schema this implementation replaced. A config carrying any
/// of these is rejected outright rather than silently reinterpreted.
const LEGACY_KEYS: &[&str] = &["udp_bind", "udp_connect", "reuseport"];

#[derive(Debug, Deserialize)]
struct KcpSection {
    #[serde(default = "default_mtu")]
    mtu: usize,
    #[serde(default = "default_wnd")]
    sndwnd: u16,
    #[serde(default = "default_wnd")]
    rcvwnd: u16,
    #[serde(default)]
    nodelay: bool,
    #[serde(default = "default_interval")]
    interval: i32,
    #[serde(default = "default_resend")]
    resend: i32,
    #[serde(default)]
    nc: bool,
    #[serde(default = "default_flush")]
    flush: bool,
}

fn default_mtu() -> usize {
    1400
}
fn default_wnd() -> u16 {
    256
}
fn default_interval() -> i32 {
    10
}
fn default_resend() -> i32 {
    2
}
fn default_flush() -> bool {
    true
}

impl Default for KcpSection {
    fn default() -> KcpSection {
        KcpSection {
            mtu: default_mtu(),
            sndwnd: default_wnd(),
            rcvwnd: default_wnd(),
            nodelay: true,
            interval: default_interval(),
            resend: default_resend(),
            nc: true,
            flush: default_flush(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct TcpSection {
    #[serde(default)]
    reuseport: bool,
    #[serde(default)]
    keepalive: bool,
    #[serde(default)]
    nodelay: bool,
    sndbuf: Option<usize>,
    rcvbuf: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct UdpSection {
    sndbuf: Option<usize>,
    rcvbuf: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    listen: Option<String>,
    connect: Option<String>,
    kcp_bind: Option<String>,
    kcp_connect: Option<String>,
    #[serde(default)]
    kcp: KcpSection,
    #[serde(default)]
    tcp: TcpSection,
    #[serde(default)]
    udp: UdpSection,
    #[serde(default = "default_method")]
    method: String,
    password: Option<String>,
    psk: Option<String>,
    #[serde(default = "default_linger")]
    linger: u64,
    #[serde(default = "default_timeout")]
    timeout: u64,
    #[serde(default = "default_keepalive")]
    keepalive: u64,
    #[serde(default = "default_time_wait")]
    time_wait: u64,
    #[serde(default = "default_loglevel")]
    loglevel: String,
    user: Option<String>,
}

fn default_method() -> String {
    "chacha20-poly1305-ietf".to_string()
}
fn default_linger() -> u64 {
    30
}
fn default_timeout() -> u64 {
    600
}
fn default_keepalive() -> u64 {
    10
}
fn default_time_wait() -> u64 {
    60
}
fn default_loglevel() -> String {
    "info".to_string()
}

/// The validated, process-ready configuration. Socket addresses are parsed, the AEAD key
/// is resolved (from `psk` directly, or derived from `password`), and `kcp`/`tcp`/`udp`
/// tuning is carried as typed structs rather than loose JSON.
#[derive(Debug)]
pub struct Config {
    pub listen: Option<SocketAddr>,
    pub connect: Option<SocketAddr>,
    pub kcp_bind: Option<SocketAddr>,
    pub kcp_connect: Option<SocketAddr>,
    pub kcp: KcpTuning,
    pub tcp_reuseport: bool,
    pub tcp_keepalive: bool,
    pub tcp_nodelay: bool,
    pub tcp_sndbuf: Option<usize>,
    pub tcp_rcvbuf: Option<usize>,
    pub udp_sndbuf: Option<usize>,
    pub udp_rcvbuf: Option<usize>,
    pub method: String,
    pub key: [u8; KEY_SIZE],
    pub linger_secs: u64,
    pub timeout_secs: u64,
    pub keepalive_secs: u64,
    pub time_wait_secs: u64,
    pub loglevel: String,
    pub user: Option<String>,
}

/// Loads and validates a config file, rejecting the pre-redesign flat schema outright.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
    let text = fs::read_to_string(path)?;
    parse(&text)
}

pub fn parse(text: &str) -> Result<Config> {
    let raw_value: Value =
        serde_json::from_str(text).map_err(|e| Error::Config(format!("invalid json: {}", e)))?;
    reject_legacy_schema(&raw_value)?;

    let raw: RawConfig =
        serde_json::from_value(raw_value).map_err(|e| Error::Config(format!("{}", e)))?;

    if raw.kcp.mtu < 300 || raw.kcp.mtu > 1400 {
        return Err(Error::Config(format!(
            "kcp.mtu out of range: {} (must be 300..=1400)",
            raw.kcp.mtu
        )));
    }

    let key = resolve_key(&raw)?;

    Ok(Config {
        listen: parse_addr(raw.listen)?,
        connect: parse_addr(raw.connect)?,
        kcp_bind: parse_addr(raw.kcp_bind)?,
        kcp_connect: parse_addr(raw.kcp_connect)?,
        kcp: KcpTuning {
            mtu: raw.kcp.mtu,
            sndwnd: raw.kcp.sndwnd,
            rcvwnd: raw.kcp.rcvwnd,
            nodelay: raw.kcp.nodelay,
            interval: raw.kcp.interval,
            resend: raw.kcp.resend,
            nc: raw.kcp.nc,
            flush: raw.kcp.flush,
        },
        tcp_reuseport: raw.tcp.reuseport,
        tcp_keepalive: raw.tcp.keepalive,
        tcp_nodelay: raw.tcp.nodelay,
        tcp_sndbuf: raw.tcp.sndbuf,
        tcp_rcvbuf: raw.tcp.rcvbuf,
        udp_sndbuf: raw.udp.sndbuf,
        udp_rcvbuf: raw.udp.rcvbuf,
        method: raw.method,
        key,
        linger_secs: raw.linger,
        timeout_secs: raw.timeout,
        keepalive_secs: raw.keepalive,
        time_wait_secs: raw.time_wait,
        loglevel: raw.loglevel,
        user: raw.user,
    })
}

fn reject_legacy_schema(value: &Value) -> Result<()> {
    if let Some(obj) = value.as_object() {
        for legacy_key in LEGACY_KEYS {
            if obj.contains_key(*legacy_key) {
                return Err(Error::Config(format!(
                    "field `{}` belongs to the legacy flat config schema; use the sectioned \
                     kcp/tcp/udp schema instead",
                    legacy_key
                )));
            }
        }
    }
    Ok(())
}

fn resolve_key(raw: &RawConfig) -> Result<[u8; KEY_SIZE]> {
    match (&raw.psk, &raw.password) {
        (Some(psk), _) => crypto::decode_psk(psk).map_err(Error::Config),
        (None, Some(password)) => crypto::derive_key(password).map_err(Error::Crypto),
        (None, None) => Err(Error::Config(
            "config must set either `psk` or `password`".to_string(),
        )),
    }
}

fn parse_addr(s: Option<String>) -> Result<Option<SocketAddr>> {
    match s {
        None => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid address `{}`: {}", s, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_schema_is_rejected() {
        let text = r#"{"udp_bind": "0.0.0.0:8388", "psk": "AAAA"}"#;
        let err = parse(text).unwrap_err();
        match err {
            Error::Config(msg) => assert!(msg.contains("udp_bind")),
            other => panic!("expected Config error, got {:?}", other),
        }
    }

    #[test]
    fn sectioned_schema_loads() {
        let key = crypto::generate_key();
        let psk = crypto::encode_psk(&key);
        let text = format!(
            r#"{{
                "listen": "127.0.0.1:8080",
                "kcp_connect": "127.0.0.1:8388",
                "kcp": {{"mtu": 1350, "sndwnd": 128, "rcvwnd": 128}},
                "psk": "{}"
            }}"#,
            psk
        );
        let cfg = parse(&text).unwrap();
        assert_eq!(cfg.kcp.mtu, 1350);
        assert_eq!(cfg.key, key);
        assert_eq!(cfg.listen.unwrap().port(), 8080);
    }

    #[test]
    fn missing_key_material_is_rejected() {
        let text = r#"{"listen": "127.0.0.1:8080"}"#;
        assert!(parse(text).is_err());
    }

    #[test]
    fn mtu_out_of_range_is_rejected() {
        let key = crypto::generate_key();
        let psk = crypto::encode_psk(&key);
        let text = format!(r#"{{"kcp": {{"mtu": 200}}, "psk": "{}"}}"#, psk);
        let err = parse(&text).unwrap_err();
        match err {
            Error::Config(msg) => assert!(msg.contains("mtu")),
            other => panic!("expected Config error, got {:?}", other),
        }
    }
}
