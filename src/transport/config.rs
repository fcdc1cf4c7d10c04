/* Transport configuration schemas (§6): validates a device's opaque connection_config map against
 * the key set for its connection_type before any I/O is attempted. */
use std::collections::HashMap;
use std::time::Duration;

use crate::domain::ConnectionType;
use crate::error::CoreError;

const ALLOWED_BAUD_RATES: &[u32] = &[1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct UsbConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface: u8,
    pub endpoint: u8,
    pub in_endpoint: Option<u8>,
    pub serial_number: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    pub keep_alive: bool,
    pub buffer_size: usize,
    pub timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

#[derive(Debug, Clone)]
pub enum ConnectionConfig {
    Serial(SerialConfig),
    Usb(UsbConfig),
    Tcp(TcpConfig),
}

fn required<'a>(map: &'a HashMap<String, String>, key: &str) -> Result<&'a str, CoreError> {
    map.get(key)
        .map(|s| s.as_str())
        .ok_or_else(|| CoreError::Config(format!("missing required key `{key}`")))
}

fn optional_u32(map: &HashMap<String, String>, key: &str, default: u32) -> Result<u32, CoreError> {
    match map.get(key) {
        Some(v) => v
            .parse()
            .map_err(|_| CoreError::Config(format!("`{key}` must be an integer, got `{v}`"))),
        None => Ok(default),
    }
}

fn optional_bool(map: &HashMap<String, String>, key: &str, default: bool) -> Result<bool, CoreError> {
    match map.get(key) {
        Some(v) => match v.as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => Err(CoreError::Config(format!("`{key}` must be a bool, got `{other}`"))),
        },
        None => Ok(default),
    }
}

fn optional_duration_ms(map: &HashMap<String, String>, key: &str, default_ms: u64) -> Result<Duration, CoreError> {
    match map.get(key) {
        Some(v) => v
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| CoreError::Config(format!("`{key}` must be a duration in ms, got `{v}`"))),
        None => Ok(Duration::from_millis(default_ms)),
    }
}

/// Parse a hex vendor/product id string (`0x1234` or `1234`).
fn parse_hex_id(s: &str, key: &str) -> Result<u16, CoreError> {
    let trimmed = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u16::from_str_radix(trimmed, 16)
        .map_err(|_| CoreError::Config(format!("`{key}` is not a valid hex id: `{s}`")))
}

fn validate_serial(map: &HashMap<String, String>) -> Result<SerialConfig, CoreError> {
    let port = required(map, "port")?.to_string();
    let baud_rate = optional_u32(map, "baud_rate", 9600)?;
    if !ALLOWED_BAUD_RATES.contains(&baud_rate) {
        return Err(CoreError::Config(format!(
            "baud_rate {baud_rate} is not one of {ALLOWED_BAUD_RATES:?}"
        )));
    }
    let data_bits = optional_u32(map, "data_bits", 8)? as u8;
    let stop_bits = optional_u32(map, "stop_bits", 1)? as u8;
    let parity = match map.get("parity").map(|s| s.as_str()).unwrap_or("none") {
        "none" => Parity::None,
        "odd" => Parity::Odd,
        "even" => Parity::Even,
        other => return Err(CoreError::Config(format!("invalid parity `{other}`"))),
    };
    let timeout = optional_duration_ms(map, "timeout", 5000)?;

    Ok(SerialConfig {
        port,
        baud_rate,
        data_bits,
        stop_bits,
        parity,
        timeout,
    })
}

fn validate_usb(map: &HashMap<String, String>) -> Result<UsbConfig, CoreError> {
    let vendor_id = parse_hex_id(required(map, "vendor_id")?, "vendor_id")?;
    let product_id = parse_hex_id(required(map, "product_id")?, "product_id")?;
    let interface = optional_u32(map, "interface", 0)? as u8;
    let endpoint = optional_u32(map, "endpoint", 1)? as u8;
    let in_endpoint = match map.get("in_endpoint") {
        Some(v) => Some(
            v.parse::<u32>()
                .map_err(|_| CoreError::Config(format!("`in_endpoint` must be an integer, got `{v}`")))?
                as u8,
        ),
        None => None,
    };
    let serial_number = map.get("serial_number").cloned();
    let timeout = optional_duration_ms(map, "timeout", 5000)?;

    Ok(UsbConfig {
        vendor_id,
        product_id,
        interface,
        endpoint,
        in_endpoint,
        serial_number,
        timeout,
    })
}

fn validate_tcp(map: &HashMap<String, String>) -> Result<TcpConfig, CoreError> {
    let host = required(map, "host")?.to_string();
    let port = optional_u32(map, "port", 9100)?;
    if port == 0 || port > 65535 {
        return Err(CoreError::Config(format!("port {port} out of range 1..65535")));
    }
    let ssl = optional_bool(map, "ssl", false)?;
    let keep_alive = optional_bool(map, "keep_alive", true)?;
    let buffer_size = optional_u32(map, "buffer_size", 4096)? as usize;
    let timeout = optional_duration_ms(map, "timeout", 5000)?;
    let read_timeout = optional_duration_ms(map, "read_timeout", timeout.as_millis() as u64)?;
    let write_timeout = optional_duration_ms(map, "write_timeout", timeout.as_millis() as u64)?;

    Ok(TcpConfig {
        host,
        port: port as u16,
        ssl,
        keep_alive,
        buffer_size,
        timeout,
        read_timeout,
        write_timeout,
    })
}

/// Validate `connection_config` against the schema for `connection_type`.
///
/// Per the Open Question resolution in DESIGN.md, this is authoritative and
/// MUST be called before `create_protocol` — invalid or missing required
/// keys fail here with `CoreError::Config`, before any I/O is attempted.
pub fn validate_config(
    connection_type: ConnectionType,
    map: &HashMap<String, String>,
) -> Result<ConnectionConfig, CoreError> {
    match connection_type {
        ConnectionType::Serial => validate_serial(map).map(ConnectionConfig::Serial),
        ConnectionType::Usb => validate_usb(map).map(ConnectionConfig::Usb),
        ConnectionType::Tcp | ConnectionType::Bluetooth => validate_tcp(map).map(ConnectionConfig::Tcp),
    }
}
