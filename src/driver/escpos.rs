/* ESC/POS thermal-printer reference driver (§4.3, §6): translates PRINT/CUT/OPEN_DRAWER/
 * STATUS_CHECK/BEEP operations into the normative ESC/POS byte sequences below. */
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ctx::Ctx;
use crate::domain::{Capability, Device, DeviceStatus, Operation, OperationType};
use crate::error::{CoreError, Result};
use crate::transport::config::validate_config;
use crate::transport::{create_protocol, DeviceProtocol};

use super::{ConnectionState, DeviceDriver, DeviceInfoSnapshot, EventHandler};

// Normative command table (§6). The wire output for PRINT/CUT/OPEN_DRAWER must match these
// byte-for-byte (P7) — do not "simplify" any of these sequences.
const INITIALIZE: &[u8] = &[0x1B, 0x40];
const STATUS_REQUEST: &[u8] = &[0x10, 0x04, 0x01];
const SELECT_CHARSET_PC437: &[u8] = &[0x1B, 0x74, 0x00];
const SET_WIDTH_58MM: &[u8] = &[0x1D, 0x57, 0x40, 0x01];
const SET_WIDTH_80MM: &[u8] = &[0x1D, 0x57, 0x00, 0x02];
const LINE_FEED: &[u8] = &[0x0A];
const TEXT_BOLD_ON: &[u8] = &[0x1B, 0x45, 0x01];
const TEXT_BOLD_OFF: &[u8] = &[0x1B, 0x45, 0x00];
const TEXT_UNDERLINE_ON: &[u8] = &[0x1B, 0x2D, 0x01];
const TEXT_UNDERLINE_OFF: &[u8] = &[0x1B, 0x2D, 0x00];
const TEXT_RESET: &[u8] = &[0x1B, 0x21, 0x00];
const TEXT_SIZE_NORMAL: &[u8] = &[0x1D, 0x21, 0x00];
const TEXT_SIZE_DOUBLE_WIDTH: &[u8] = &[0x1D, 0x21, 0x20];
const TEXT_SIZE_DOUBLE_HEIGHT: &[u8] = &[0x1D, 0x21, 0x10];
const TEXT_SIZE_DOUBLE_BOTH: &[u8] = &[0x1D, 0x21, 0x30];
const ALIGN_LEFT: &[u8] = &[0x1B, 0x61, 0x00];
const ALIGN_CENTER: &[u8] = &[0x1B, 0x61, 0x01];
const ALIGN_RIGHT: &[u8] = &[0x1B, 0x61, 0x02];
const CUT_FULL: &[u8] = &[0x1D, 0x56, 0x00];
const CUT_PARTIAL: &[u8] = &[0x1D, 0x56, 0x01];
const DRAWER_KICK_PIN2: &[u8] = &[0x1B, 0x70, 0x00, 0x19, 0x19];
const DRAWER_KICK_PIN5: &[u8] = &[0x1B, 0x70, 0x01, 0x19, 0x19];
const PRINT_LOGO: &[u8] = &[0x1D, 0x2F, 0x00];

const TRAILING_FEEDS: usize = 3;
const MAX_COPIES: u8 = 10;
const MAX_BEEP_COUNT: u32 = 10;
const MAX_BEEP_DURATION_MS: u32 = 2000;

fn str_field<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str)
}

fn bool_field(data: &Value, key: &str, default: bool) -> bool {
    data.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn u64_field(data: &Value, key: &str, default: u64) -> u64 {
    data.get(key).and_then(Value::as_u64).unwrap_or(default)
}

/// Driver-side view of a device's paper width, derived from `connection_config["paper_width"]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PaperWidth {
    Mm58,
    Mm80,
}

impl PaperWidth {
    fn from_config(config: &HashMap<String, String>) -> Self {
        match config.get("paper_width").map(String::as_str) {
            Some("58") => PaperWidth::Mm58,
            _ => PaperWidth::Mm80,
        }
    }

    fn width_command(self) -> &'static [u8] {
        match self {
            PaperWidth::Mm58 => SET_WIDTH_58MM,
            PaperWidth::Mm80 => SET_WIDTH_80MM,
        }
    }

    /// Column count used to lay out RECEIPT mode, approximating the
    /// character grid of a typical monospace thermal font at this width.
    fn columns(self) -> usize {
        match self {
            PaperWidth::Mm58 => 32,
            PaperWidth::Mm80 => 48,
        }
    }
}

/// ESC/POS thermal-printer driver: the one reference `DeviceDriver`
/// implementation this crate ships, illustrating the wire-format
/// translation contract every brand-specific driver follows.
///
/// `transport` is the only field behind interior mutability: `status`/
/// `execute_operation`/`ping` take `&self` (§5), so the handle they read
/// and write through has to be lockable without a mutable receiver. Every
/// other field is only ever touched from `connect`/`disconnect`/
/// `configure`/`reset`, which keep `&mut self`, so a plain field is enough.
pub struct EscPosDriver {
    transport: tokio::sync::Mutex<Option<Box<dyn DeviceProtocol>>>,
    state: ConnectionState,
    paper_width: PaperWidth,
    device_id: Option<Uuid>,
    handler: Option<Arc<dyn EventHandler>>,
}

impl EscPosDriver {
    pub fn new() -> Self {
        Self {
            transport: tokio::sync::Mutex::new(None),
            state: ConnectionState::Disconnected,
            paper_width: PaperWidth::Mm80,
            device_id: None,
            handler: None,
        }
    }

}

/// Constructs a fresh [`EscPosDriver`] per registry resolution.
pub struct EscPosFactory;

impl crate::driver::DriverFactory for EscPosFactory {
    fn create(&self) -> Box<dyn DeviceDriver> {
        Box::new(EscPosDriver::new())
    }
}

impl EscPosDriver {
    fn notify_error(&self, err: &CoreError) {
        if let (Some(h), Some(id)) = (&self.handler, self.device_id) {
            h.on_error(id, err);
        }
    }

    /// Run the handshake over whatever is currently parked in `transport`,
    /// regardless of `state` — used during `connect`, before `state` has
    /// moved to `Connected`.
    async fn init_sequence(&self, ctx: &Ctx) -> Result<()> {
        let mut guard = self.transport.lock().await;
        let transport = guard.as_mut().ok_or(CoreError::NotConnected)?;
        transport.write(ctx, INITIALIZE).await?;
        transport.write(ctx, SELECT_CHARSET_PC437).await?;
        transport.write(ctx, self.paper_width.width_command()).await?;
        Ok(())
    }

    /// Lock and hand back the transport guard, failing closed unless the
    /// driver is `Connected` (§4.3 operations against a disconnected driver).
    async fn require_transport(&self) -> Result<tokio::sync::MutexGuard<'_, Option<Box<dyn DeviceProtocol>>>> {
        if self.state != ConnectionState::Connected {
            return Err(CoreError::NotConnected);
        }
        Ok(self.transport.lock().await)
    }

    async fn handle_print(&self, ctx: &Ctx, data: &Value) -> Result<Value> {
        let content = str_field(data, "content")
            .ok_or_else(|| CoreError::InvalidArgument("print requires `content`".into()))?
            .to_string();
        let content_type = str_field(data, "content_type").unwrap_or("TEXT").to_uppercase();
        let copies = data
            .get("copies")
            .and_then(Value::as_u64)
            .map(|c| c.clamp(1, MAX_COPIES as u64) as u8)
            .unwrap_or(1);
        let cut = bool_field(data, "cut", false);
        let cut_type = str_field(data, "cut_type").unwrap_or("FULL").to_uppercase();
        let open_drawer = bool_field(data, "open_drawer", false);
        let drawer_pin = data.get("drawer_pin").and_then(Value::as_u64).unwrap_or(2) as u8;
        let logo = bool_field(data, "logo", false);
        let options = data.get("options").cloned().unwrap_or(Value::Null);
        let paper_width = self.paper_width;

        let body = render_body(&content_type, &content, &options, paper_width)?;

        let mut guard = self.require_transport().await?;
        let transport = guard.as_mut().ok_or(CoreError::NotConnected)?;

        if logo {
            transport.write(ctx, PRINT_LOGO).await?;
        }

        for copy in 1..=copies {
            transport.write(ctx, &body).await?;
            if copy < copies {
                let separator = center_line(&format!("--- KOPYA {copy} ---"), paper_width.columns());
                transport.write(ctx, separator.as_bytes()).await?;
                transport.write(ctx, LINE_FEED).await?;
            }
        }

        for _ in 0..TRAILING_FEEDS {
            transport.write(ctx, LINE_FEED).await?;
        }

        if cut {
            let cmd = if cut_type == "PARTIAL" { CUT_PARTIAL } else { CUT_FULL };
            transport.write(ctx, cmd).await?;
        }

        let mut drawer_duration_ms = None;
        if open_drawer {
            let cmd = match drawer_pin {
                1 | 5 => DRAWER_KICK_PIN5,
                _ => DRAWER_KICK_PIN2,
            };
            transport.write(ctx, cmd).await?;
            tokio::time::sleep(Duration::from_millis(200)).await;
            drawer_duration_ms = Some(200u64);
        }

        Ok(json!({
            "copies": copies,
            "content_type": content_type,
            "cut": cut,
            "drawer_duration_ms": drawer_duration_ms,
        }))
    }

    async fn handle_cut(&self, ctx: &Ctx, data: &Value) -> Result<Value> {
        let cut_type = str_field(data, "cut_type").unwrap_or("FULL").to_uppercase();
        let cmd = if cut_type == "PARTIAL" { CUT_PARTIAL } else { CUT_FULL };
        let mut guard = self.require_transport().await?;
        let transport = guard.as_mut().ok_or(CoreError::NotConnected)?;
        transport.write(ctx, cmd).await?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(json!({ "cut_type": cut_type }))
    }

    async fn handle_open_drawer(&self, ctx: &Ctx, data: &Value) -> Result<Value> {
        let pin = data.get("pin").and_then(Value::as_u64).unwrap_or(2);
        let cmd = match pin {
            0 | 2 => DRAWER_KICK_PIN2,
            1 | 5 => DRAWER_KICK_PIN5,
            other => {
                return Err(CoreError::InvalidArgument(format!(
                    "drawer pin must be one of {{0,1,2,5}}, got {other}"
                )))
            }
        };
        let mut guard = self.require_transport().await?;
        let transport = guard.as_mut().ok_or(CoreError::NotConnected)?;
        transport.write(ctx, cmd).await?;
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(json!({ "pin": pin }))
    }

    async fn handle_status_check(&self, ctx: &Ctx) -> Result<Value> {
        let mut guard = self.require_transport().await?;
        let transport = guard.as_mut().ok_or(CoreError::NotConnected)?;
        transport.write(ctx, STATUS_REQUEST).await?;
        let deadline_ctx = ctx.with_timeout(Duration::from_secs(2));
        let resp = transport.read(&deadline_ctx, 1024).await?;
        let byte = resp.first().copied().unwrap_or(0);
        Ok(json!({
            "online": byte & 0x01 == 0,
            "paper_error": byte & 0x02 != 0,
            "offline": byte & 0x04 != 0,
            "error": byte & 0x08 != 0,
        }))
    }

    async fn handle_beep(&self, ctx: &Ctx, data: &Value) -> Result<Value> {
        let count = (u64_field(data, "count", 1) as u32).min(MAX_BEEP_COUNT).max(1);
        let duration_ms = (u64_field(data, "duration_ms", 200) as u32).min(MAX_BEEP_DURATION_MS);
        let mut guard = self.require_transport().await?;
        let transport = guard.as_mut().ok_or(CoreError::NotConnected)?;
        for i in 0..count {
            // ESC/POS buzzer: ESC B n t — not part of the normative table since BEEP
            // wire output isn't P7-tested, but kept in the same command family.
            transport.write(ctx, &[0x1B, 0x42, 1, (duration_ms / 10).min(255) as u8]).await?;
            if i + 1 < count {
                transport.write(ctx, LINE_FEED).await?;
            }
        }
        Ok(json!({ "count": count, "duration_ms": duration_ms }))
    }
}

impl Default for EscPosDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn center_line(text: &str, width: usize) -> String {
    if text.len() >= width {
        return text.to_string();
    }
    let pad = (width - text.len()) / 2;
    format!("{}{}", " ".repeat(pad), text)
}

fn strip_html(html: &str) -> String {
    let normalized = html.replace("<br>", "\n").replace("<br/>", "\n").replace("</p>", "\n");
    let mut out = String::new();
    let mut in_tag = false;
    for c in normalized.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

#[derive(Debug, serde::Deserialize)]
struct ReceiptItem {
    name: String,
    price: f64,
    #[serde(default = "default_qty")]
    qty: u32,
}

fn default_qty() -> u32 {
    1
}

#[derive(Debug, serde::Deserialize)]
struct ReceiptContent {
    #[serde(default)]
    header: Option<String>,
    #[serde(default)]
    items: Vec<ReceiptItem>,
    total: f64,
    #[serde(default)]
    footer: Option<String>,
}

fn render_receipt(content: &str, width: usize) -> Option<String> {
    let parsed: ReceiptContent = serde_json::from_str(content).ok()?;
    let mut lines = Vec::new();
    if let Some(header) = &parsed.header {
        lines.push(center_line(header, width));
    }
    for item in &parsed.items {
        let price_str = format!("{:.2} x{}", item.price, item.qty);
        let gap = width.saturating_sub(item.name.len() + price_str.len()).max(1);
        lines.push(format!("{}{}{}", item.name, " ".repeat(gap), price_str));
    }
    let total_str = format!("TOTAL: {:.2}", parsed.total);
    lines.push(total_str);
    if let Some(footer) = &parsed.footer {
        lines.push(center_line(footer, width));
    }
    Some(lines.join("\n"))
}

/// Build the wire bytes for one copy of PRINT content, per §4.3's per-type
/// rendering rules. Returns raw content unwrapped for `ESC_POS` (P7: must
/// match byte-for-byte) and a formatted block for every other type.
fn render_body(content_type: &str, content: &str, options: &Value, paper_width: PaperWidth) -> Result<Vec<u8>> {
    if content_type == "ESC_POS" {
        let mut out = Vec::new();
        out.extend_from_slice(INITIALIZE);
        out.extend_from_slice(SELECT_CHARSET_PC437);
        out.extend_from_slice(paper_width.width_command());
        out.extend_from_slice(content.as_bytes());
        return Ok(out);
    }

    let text = match content_type {
        "HTML" => strip_html(content),
        "RECEIPT" => render_receipt(content, paper_width.columns()).unwrap_or_else(|| content.to_string()),
        _ => content.to_string(),
    };

    let align = options.get("align").and_then(Value::as_str).unwrap_or("center");
    let size = options.get("size").and_then(Value::as_str).unwrap_or("double_both");
    let bold = options.get("bold").and_then(Value::as_bool).unwrap_or(false);
    let underline = options.get("underline").and_then(Value::as_bool).unwrap_or(false);

    let mut out = Vec::new();
    out.extend_from_slice(match align {
        "left" => ALIGN_LEFT,
        "right" => ALIGN_RIGHT,
        _ => ALIGN_CENTER,
    });
    out.extend_from_slice(match size {
        "normal" => TEXT_SIZE_NORMAL,
        "double_width" => TEXT_SIZE_DOUBLE_WIDTH,
        "double_height" => TEXT_SIZE_DOUBLE_HEIGHT,
        _ => TEXT_SIZE_DOUBLE_BOTH,
    });
    if bold {
        out.extend_from_slice(TEXT_BOLD_ON);
    }
    if underline {
        out.extend_from_slice(TEXT_UNDERLINE_ON);
    }
    for line in text.lines() {
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(LINE_FEED);
    }
    if underline {
        out.extend_from_slice(TEXT_UNDERLINE_OFF);
    }
    if bold {
        out.extend_from_slice(TEXT_BOLD_OFF);
    }
    out.extend_from_slice(TEXT_RESET);
    out.extend_from_slice(ALIGN_LEFT);
    Ok(out)
}

#[async_trait]
impl DeviceDriver for EscPosDriver {
    fn name(&self) -> &str {
        "escpos"
    }

    async fn connect(&mut self, ctx: &Ctx, device: &Device) -> Result<()> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }
        self.state = ConnectionState::Connecting;
        self.device_id = Some(device.id);
        self.paper_width = PaperWidth::from_config(&device.connection_config);

        let cfg = validate_config(device.connection_type, &device.connection_config)?;
        let mut transport = create_protocol(&cfg);
        if let Err(e) = transport.open(ctx).await {
            self.state = ConnectionState::Disconnected;
            self.notify_error(&e);
            return Err(e);
        }
        {
            let mut guard = self.transport.lock().await;
            *guard = Some(transport);
        }

        if let Err(e) = self.init_sequence(ctx).await {
            let mut guard = self.transport.lock().await;
            if let Some(t) = guard.as_mut() {
                let _ = t.close().await;
            }
            *guard = None;
            drop(guard);
            self.state = ConnectionState::Disconnected;
            self.notify_error(&e);
            return Err(e);
        }

        self.state = ConnectionState::Connected;
        if let (Some(h), Some(id)) = (&self.handler, self.device_id) {
            h.on_connected(id);
        }
        debug!("escpos driver connected to device {:?}", self.device_id);
        Ok(())
    }

    async fn disconnect(&mut self, _ctx: &Ctx) -> Result<()> {
        let taken = self.transport.lock().await.take();
        if let Some(mut transport) = taken {
            transport.close().await?;
        }
        self.state = ConnectionState::Disconnected;
        if let (Some(h), Some(id)) = (&self.handler, self.device_id) {
            h.on_disconnected(id);
        }
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.state
    }

    fn capabilities(&self) -> HashSet<Capability> {
        [
            Capability::Print,
            Capability::Cut,
            Capability::Drawer,
            Capability::Status,
            Capability::Beep,
            Capability::Logo,
        ]
        .into_iter()
        .collect()
    }

    async fn device_info(&self, _ctx: &Ctx) -> Result<DeviceInfoSnapshot> {
        Ok(DeviceInfoSnapshot::default())
    }

    async fn status(&self, _ctx: &Ctx) -> Result<DeviceStatus> {
        if self.state == ConnectionState::Connected {
            Ok(DeviceStatus::Online)
        } else {
            Ok(DeviceStatus::Offline)
        }
    }

    async fn execute_operation(&self, ctx: &Ctx, op: &Operation) -> Result<Value> {
        if self.state != ConnectionState::Connected {
            return Err(CoreError::NotConnected);
        }
        let result = match op.op_type {
            OperationType::Print => self.handle_print(ctx, &op.data).await,
            OperationType::Cut => self.handle_cut(ctx, &op.data).await,
            OperationType::OpenDrawer => self.handle_open_drawer(ctx, &op.data).await,
            OperationType::StatusCheck => self.handle_status_check(ctx).await,
            OperationType::Beep => self.handle_beep(ctx, &op.data).await,
            other => Err(CoreError::UnsupportedOperation(other)),
        };
        if let Err(e) = &result {
            self.notify_error(e);
        }
        if let (Some(h), Some(id)) = (&self.handler, self.device_id) {
            h.on_operation_complete(id, op.id, result.is_ok());
        }
        result
    }

    async fn ping(&self, ctx: &Ctx) -> Result<()> {
        let mut guard = self.require_transport().await?;
        let transport = guard.as_mut().ok_or(CoreError::NotConnected)?;
        transport.ping(ctx).await
    }

    async fn configure(&mut self, _ctx: &Ctx, settings: &HashMap<String, String>) -> Result<()> {
        if let Some(width) = settings.get("paper_width") {
            self.paper_width = match width.as_str() {
                "58" => PaperWidth::Mm58,
                "80" => PaperWidth::Mm80,
                other => {
                    warn!("ignoring unknown paper_width `{other}` in configure()");
                    self.paper_width
                }
            };
        }
        Ok(())
    }

    async fn reset(&mut self, ctx: &Ctx) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(CoreError::NotConnected);
        }
        self.init_sequence(ctx).await
    }

    fn set_event_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handler = Some(handler);
    }
}
