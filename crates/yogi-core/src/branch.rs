//! Branch identity: the [`Uuid`], [`BranchInfo`]/[`LocalBranchInfo`]
//! records, the advertising-message/Info-message wire format, and the
//! `BranchConfig` builder that feeds a [`LocalBranchInfo`].

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use yogi_transport::error::{YogiError, YogiErrorCode};

/// Bound applied to `tx_queue_size` / `rx_queue_size`.
pub const MIN_TX_QUEUE_SIZE: usize = 35_000;
pub const MAX_TX_QUEUE_SIZE: usize = 10_000_000_000;
pub const MIN_RX_QUEUE_SIZE: usize = 35_000;
pub const MAX_RX_QUEUE_SIZE: usize = 10_000_000_000;

/// The magic prefix every advertising/Info message begins with.
pub const ADV_MAGIC: [u8; 5] = *b"YOGI\0";
pub const VERSION_MAJOR: u8 = 1;
pub const VERSION_MINOR: u8 = 0;
/// Size, in bytes, of the fixed advertising message.
pub const ADV_MESSAGE_SIZE: usize = 25;

/// Identifies a branch for the lifetime of the process. Generated once
/// at local-branch construction and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Uuid([u8; 16]);

impl Uuid {
    /// Generates a new random UUID. Uses `rand` rather than a dedicated
    /// `uuid` crate since the wire format only ever needs 16 opaque
    /// random bytes, not RFC 4122 variant/version semantics.
    pub fn new_random() -> Self {
        let mut bytes = [0u8; 16];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Serialize for Uuid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

/// Nanoseconds since the Unix epoch, or "infinite" for a duration field
/// whose value is `i64::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn now() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        Self(nanos.min(i64::MAX as u128) as i64)
    }

    pub const fn from_nanos_since_epoch(nanos: i64) -> Self {
        Self(nanos)
    }

    pub const fn nanos_since_epoch(&self) -> i64 {
        self.0
    }
}

impl Serialize for Timestamp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i64(self.0)
    }
}

/// A timeout that is either a concrete [`Duration`] or infinite (never
/// expires). Wire-encoded as `i64::MAX` nanoseconds for the infinite case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutDuration {
    Finite(Duration),
    Infinite,
}

impl TimeoutDuration {
    fn to_nanos(self) -> i64 {
        match self {
            Self::Infinite => i64::MAX,
            Self::Finite(d) => d.as_nanos().min(i64::MAX as u128 - 1) as i64,
        }
    }

    fn from_nanos(nanos: i64) -> Self {
        if nanos == i64::MAX {
            Self::Infinite
        } else {
            Self::Finite(Duration::from_nanos(nanos.max(0) as u64))
        }
    }
}

impl Serialize for TimeoutDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Self::Infinite => serializer.serialize_none(),
            Self::Finite(d) => serializer.serialize_f64(d.as_secs_f64()),
        }
    }
}

/// Attributes shared by every branch record (local or remote).
///
/// Derives `Serialize` so `branch_queried`/`connect_finished` events can
/// carry the remote branch's full record as the JSON blob `await_event`
/// callers receive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchInfo {
    pub uuid: Uuid,
    pub name: String,
    pub description: String,
    pub network_name: String,
    pub path: String,
    pub hostname: String,
    pub pid: u32,
    pub start_time: Timestamp,
    pub tcp_endpoint: SocketAddr,
    pub timeout: TimeoutDuration,
    pub advertising_interval: TimeoutDuration,
    pub ghost_mode: bool,
}

/// A [`BranchInfo`] plus the attributes only the owning process needs:
/// which interfaces to advertise on, the advertising endpoint, and the
/// TX/RX queue sizing and transceive byte limit applied to its own
/// Message Transport.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalBranchInfo {
    pub info: BranchInfo,
    pub advertising_interfaces: Vec<String>,
    pub advertising_endpoint: SocketAddr,
    pub tx_queue_size: usize,
    pub rx_queue_size: usize,
    pub transceive_byte_limit: Option<usize>,
    pub network_password: String,
}

impl std::ops::Deref for LocalBranchInfo {
    type Target = BranchInfo;
    fn deref(&self) -> &BranchInfo {
        &self.info
    }
}

/// The in-memory configuration surface this workspace exposes: a plain,
/// `serde`-deserializable struct an embedder's own JSON loader can
/// populate directly, with bounds clamping applied in
/// [`BranchConfig::build`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BranchConfig {
    pub name: String,
    pub description: String,
    pub network_name: String,
    pub network_password: String,
    pub path: String,
    pub advertising_interfaces: Vec<String>,
    pub advertising_address: String,
    pub advertising_port: u16,
    pub advertising_interval_secs: Option<f64>,
    pub timeout_secs: Option<f64>,
    pub tx_queue_size: usize,
    pub rx_queue_size: usize,
    pub ghost_mode: bool,
    pub tcp_bind_address: String,
    pub tcp_bind_port: u16,
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            network_name: String::new(),
            network_password: String::new(),
            path: String::new(),
            advertising_interfaces: vec!["all".to_string()],
            advertising_address: "239.255.0.1".to_string(),
            advertising_port: 13531,
            advertising_interval_secs: Some(1.0),
            timeout_secs: Some(3.0),
            tx_queue_size: 10_000_000,
            rx_queue_size: 10_000_000,
            ghost_mode: false,
            tcp_bind_address: "0.0.0.0".to_string(),
            tcp_bind_port: 0,
        }
    }
}

impl BranchConfig {
    /// Builds a [`LocalBranchInfo`], generating a fresh [`Uuid`], reading
    /// the hostname and pid from the OS, and clamping the queue sizes to
    /// their configured bounds.
    pub fn build(&self, tcp_endpoint: SocketAddr) -> Result<LocalBranchInfo, YogiError> {
        if self.name.is_empty() {
            return Err(YogiError::new(
                YogiErrorCode::DeserializeMsgFailed,
                "branch config is missing a non-empty 'name'",
            ));
        }
        if self.network_name.is_empty() {
            return Err(YogiError::new(
                YogiErrorCode::DeserializeMsgFailed,
                "branch config is missing a non-empty 'network_name'",
            ));
        }

        let path = if self.path.is_empty() {
            format!("/{}", self.name)
        } else {
            self.path.clone()
        };

        let advertising_endpoint: SocketAddr =
            format!("{}:{}", self.advertising_address, self.advertising_port)
                .parse()
                .map_err(|e| {
                    YogiError::with_cause(
                        YogiErrorCode::DeserializeMsgFailed,
                        "invalid advertising_address/advertising_port",
                        std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{e}")),
                    )
                })?;

        let timeout = match self.timeout_secs {
            None => TimeoutDuration::Infinite,
            Some(secs) if secs <= 0.0 => TimeoutDuration::Infinite,
            Some(secs) => TimeoutDuration::Finite(Duration::from_secs_f64(secs)),
        };
        let advertising_interval = match self.advertising_interval_secs {
            None => TimeoutDuration::Infinite,
            Some(secs) if secs <= 0.0 => TimeoutDuration::Infinite,
            Some(secs) => TimeoutDuration::Finite(Duration::from_secs_f64(secs)),
        };

        let hostname = hostname_best_effort();
        let pid = std::process::id();

        Ok(LocalBranchInfo {
            info: BranchInfo {
                uuid: Uuid::new_random(),
                name: self.name.clone(),
                description: self.description.clone(),
                network_name: self.network_name.clone(),
                path,
                hostname,
                pid,
                start_time: Timestamp::now(),
                tcp_endpoint,
                timeout,
                advertising_interval,
                ghost_mode: self.ghost_mode,
            },
            advertising_interfaces: if self.advertising_interfaces.is_empty() {
                vec!["all".to_string()]
            } else {
                self.advertising_interfaces.clone()
            },
            advertising_endpoint,
            tx_queue_size: self.tx_queue_size.clamp(MIN_TX_QUEUE_SIZE, MAX_TX_QUEUE_SIZE),
            rx_queue_size: self.rx_queue_size.clamp(MIN_RX_QUEUE_SIZE, MAX_RX_QUEUE_SIZE),
            transceive_byte_limit: None,
            network_password: self.network_password.clone(),
        })
    }
}

fn hostname_best_effort() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Wire-format field writers/readers shared by the advertising message
/// and the Info message body.
pub mod wire {
    use super::*;

    pub fn write_string(out: &mut Vec<u8>, s: &str) {
        let bytes = s.as_bytes();
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(bytes);
    }

    pub fn read_string(buf: &[u8]) -> Result<(String, usize), YogiError> {
        if buf.len() < 4 {
            return Err(too_short());
        }
        let len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        if buf.len() < 4 + len {
            return Err(too_short());
        }
        let s = String::from_utf8(buf[4..4 + len].to_vec())
            .map_err(|e| YogiError::with_cause(YogiErrorCode::DeserializeMsgFailed, "invalid utf-8 in string field", e))?;
        Ok((s, 4 + len))
    }

    pub fn write_u16(out: &mut Vec<u8>, v: u16) {
        out.extend_from_slice(&v.to_le_bytes());
    }

    pub fn read_u16(buf: &[u8]) -> Result<(u16, usize), YogiError> {
        if buf.len() < 2 {
            return Err(too_short());
        }
        Ok((u16::from_le_bytes(buf[0..2].try_into().unwrap()), 2))
    }

    pub fn write_u32(out: &mut Vec<u8>, v: u32) {
        out.extend_from_slice(&v.to_le_bytes());
    }

    pub fn read_u32(buf: &[u8]) -> Result<(u32, usize), YogiError> {
        if buf.len() < 4 {
            return Err(too_short());
        }
        Ok((u32::from_le_bytes(buf[0..4].try_into().unwrap()), 4))
    }

    pub fn write_uuid(out: &mut Vec<u8>, uuid: &Uuid) {
        out.extend_from_slice(uuid.as_bytes());
    }

    pub fn read_uuid(buf: &[u8]) -> Result<(Uuid, usize), YogiError> {
        if buf.len() < 16 {
            return Err(too_short());
        }
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&buf[0..16]);
        Ok((Uuid::from_bytes(bytes), 16))
    }

    pub fn write_duration(out: &mut Vec<u8>, d: TimeoutDuration) {
        out.extend_from_slice(&d.to_nanos().to_le_bytes());
    }

    pub fn read_duration(buf: &[u8]) -> Result<(TimeoutDuration, usize), YogiError> {
        if buf.len() < 8 {
            return Err(too_short());
        }
        let nanos = i64::from_le_bytes(buf[0..8].try_into().unwrap());
        Ok((TimeoutDuration::from_nanos(nanos), 8))
    }

    pub fn write_timestamp(out: &mut Vec<u8>, ts: Timestamp) {
        out.extend_from_slice(&ts.nanos_since_epoch().to_le_bytes());
    }

    pub fn read_timestamp(buf: &[u8]) -> Result<(Timestamp, usize), YogiError> {
        if buf.len() < 8 {
            return Err(too_short());
        }
        let nanos = i64::from_le_bytes(buf[0..8].try_into().unwrap());
        Ok((Timestamp::from_nanos_since_epoch(nanos), 8))
    }

    pub fn write_bool(out: &mut Vec<u8>, v: bool) {
        out.push(u8::from(v));
    }

    pub fn read_bool(buf: &[u8]) -> Result<(bool, usize), YogiError> {
        if buf.is_empty() {
            return Err(too_short());
        }
        Ok((buf[0] != 0, 1))
    }

    fn too_short() -> YogiError {
        YogiError::new(
            YogiErrorCode::DeserializeMsgFailed,
            "info message body truncated",
        )
    }

    /// Serializes the 25-byte advertising message.
    pub fn encode_adv_message(uuid: &Uuid, tcp_port: u16) -> [u8; ADV_MESSAGE_SIZE] {
        let mut out = [0u8; ADV_MESSAGE_SIZE];
        out[0..5].copy_from_slice(&ADV_MAGIC);
        out[5] = VERSION_MAJOR;
        out[6] = VERSION_MINOR;
        out[7..23].copy_from_slice(uuid.as_bytes());
        out[23..25].copy_from_slice(&tcp_port.to_be_bytes());
        out
    }

    /// Parsed fields of an advertising message.
    pub struct AdvMessage {
        pub uuid: Uuid,
        pub tcp_port: u16,
    }

    /// Parses and validates a 25-byte advertising message.
    pub fn decode_adv_message(buf: &[u8]) -> Result<AdvMessage, YogiError> {
        if buf.len() != ADV_MESSAGE_SIZE {
            return Err(YogiError::new(
                YogiErrorCode::DeserializeMsgFailed,
                "advertising message is not 25 bytes",
            ));
        }
        if buf[0..5] != ADV_MAGIC {
            return Err(YogiError::new(
                YogiErrorCode::InvalidMagicPrefix,
                "advertising message has an invalid magic prefix",
            ));
        }
        if buf[5] != VERSION_MAJOR {
            return Err(YogiError::new(
                YogiErrorCode::IncompatibleVersion,
                format!(
                    "advertising message major version {} is incompatible with {}",
                    buf[5], VERSION_MAJOR
                ),
            ));
        }
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes.copy_from_slice(&buf[7..23]);
        let tcp_port = u16::from_be_bytes([buf[23], buf[24]]);
        Ok(AdvMessage {
            uuid: Uuid::from_bytes(uuid_bytes),
            tcp_port,
        })
    }

    /// Serializes the Info-message body (everything after the 25-byte
    /// adv prefix and the `u32` body length) for `info`.
    pub fn encode_info_body(info: &BranchInfo) -> Vec<u8> {
        let mut out = Vec::new();
        write_string(&mut out, &info.name);
        write_string(&mut out, &info.description);
        write_string(&mut out, &info.network_name);
        write_string(&mut out, &info.path);
        write_string(&mut out, &info.hostname);
        write_u32(&mut out, info.pid);
        write_timestamp(&mut out, info.start_time);
        write_duration(&mut out, info.timeout);
        write_duration(&mut out, info.advertising_interval);
        write_bool(&mut out, info.ghost_mode);
        out
    }

    /// Fields recovered from an Info-message body. The caller already
    /// knows the peer's `uuid` and `tcp_endpoint` from the adv prefix
    /// and the accepted/connected socket, so those aren't re-parsed here.
    pub struct InfoBody {
        pub name: String,
        pub description: String,
        pub network_name: String,
        pub path: String,
        pub hostname: String,
        pub pid: u32,
        pub start_time: Timestamp,
        pub timeout: TimeoutDuration,
        pub advertising_interval: TimeoutDuration,
        pub ghost_mode: bool,
    }

    pub fn decode_info_body(buf: &[u8]) -> Result<InfoBody, YogiError> {
        let mut offset = 0;
        let (name, n) = read_string(&buf[offset..])?;
        offset += n;
        let (description, n) = read_string(&buf[offset..])?;
        offset += n;
        let (network_name, n) = read_string(&buf[offset..])?;
        offset += n;
        let (path, n) = read_string(&buf[offset..])?;
        offset += n;
        let (hostname, n) = read_string(&buf[offset..])?;
        offset += n;
        let (pid, n) = read_u32(&buf[offset..])?;
        offset += n;
        let (start_time, n) = read_timestamp(&buf[offset..])?;
        offset += n;
        let (timeout, n) = read_duration(&buf[offset..])?;
        offset += n;
        let (advertising_interval, n) = read_duration(&buf[offset..])?;
        offset += n;
        let (ghost_mode, _n) = read_bool(&buf[offset..])?;
        Ok(InfoBody {
            name,
            description,
            network_name,
            path,
            hostname,
            pid,
            start_time,
            timeout,
            advertising_interval,
            ghost_mode,
        })
    }
}
