//! FPC2534 framed protocol codec (encode requests, decode responses/events).
//!
//! Ported from the sensor's BLE wire protocol as observed on the bridge:
//! - 8-byte little-endian envelope header `version | type | flags | length`.
//! - Inner frame `cmd | frame_type | body`, where `frame_type` is 0x0011 on
//!   requests, 0x0012 on responses and 0x0013 on unsolicited events.
//! - Optional AES-GCM-128/256 mode (flags bit 0): 12-byte nonce and 16-byte
//!   tag prepended to the ciphertext, AAD = the 8-byte header. The sensor
//!   puts the tag *before* the ciphertext, so the codec rearranges the
//!   RustCrypto `ciphertext || tag` output to match.
//!
//! The codec is pure: no I/O, no state beyond the optional symmetric key.
//! Rekeying is done by constructing a fresh `Fpc2534` and swapping it in.
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::GatewayError;

pub const CMD_STATUS: u16 = 0x0040;
pub const CMD_VERSION: u16 = 0x0041;
pub const CMD_CAPTURE: u16 = 0x0050;
pub const CMD_ABORT: u16 = 0x0052;
pub const CMD_IMAGE_DATA: u16 = 0x0053;
pub const CMD_ENROLL: u16 = 0x0054;
pub const CMD_IDENTIFY: u16 = 0x0055;
pub const CMD_LIST_TEMPLATES: u16 = 0x0060;
pub const CMD_DELETE_TEMPLATE: u16 = 0x0061;
pub const CMD_GET_TEMPLATE_DATA: u16 = 0x0062;
pub const CMD_PUT_TEMPLATE_DATA: u16 = 0x0063;
pub const CMD_GET_SYSTEM_CONFIG: u16 = 0x006A;
pub const CMD_SET_SYSTEM_CONFIG: u16 = 0x006B;
pub const CMD_RESET: u16 = 0x0072;
pub const CMD_SET_CRYPTO_KEY: u16 = 0x0083;
pub const CMD_DATA_GET: u16 = 0x0101;
pub const CMD_DATA_PUT: u16 = 0x0102;
pub const CMD_NAVIGATION: u16 = 0x0200;

const PROTOCOL_VERSION: u16 = 0x0004;
const ENVELOPE_TYPE: u16 = 0x0011;
const FRAME_REQUEST: u16 = 0x0011;
const FRAME_RESPONSE: u16 = 0x0012;
const FRAME_EVENT: u16 = 0x0013;

const FLAG_SECURE: u16 = 0x0001;
const FLAG_HOST: u16 = 0x0010;

const HEADER_LEN: usize = 8;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
/// Nonce + tag added to the payload length in secure mode.
pub const SECURE_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Largest DATA_GET/DATA_PUT chunk the BLE bridge MTU tolerates.
pub const MAX_CHUNK_SIZE: u32 = 140;
/// Fingerprint templates are fixed-size minutia blobs.
pub const TEMPLATE_SIZE: usize = 18000;

/// Identify result code meaning "a template matched".
const IDENTIFY_MATCH: u16 = 0x61EC;

/// Sensor-side bitflags describing its current mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StateFlag {
    #[serde(rename = "STATE_APP_FW_READY")]
    AppFwReady,
    #[serde(rename = "STATE_SECURE_INTERFACE")]
    SecureInterface,
    #[serde(rename = "STATE_CAPTURE")]
    Capture,
    #[serde(rename = "STATE_IMAGE_AVAILABLE")]
    ImageAvailable,
    #[serde(rename = "STATE_DATA_TRANSFER")]
    DataTransfer,
    #[serde(rename = "STATE_FINGER_DOWN")]
    FingerDown,
    #[serde(rename = "STATE_SYS_ERROR")]
    SysError,
    #[serde(rename = "STATE_ENROLL")]
    Enroll,
    #[serde(rename = "STATE_IDENTIFY")]
    Identify,
    #[serde(rename = "STATE_NAVIGATION")]
    Navigation,
}

const STATE_TABLE: [(u16, StateFlag); 10] = [
    (0x0001, StateFlag::AppFwReady),
    (0x0002, StateFlag::SecureInterface),
    (0x0004, StateFlag::Capture),
    (0x0010, StateFlag::ImageAvailable),
    (0x0040, StateFlag::DataTransfer),
    (0x0080, StateFlag::FingerDown),
    (0x0400, StateFlag::SysError),
    (0x1000, StateFlag::Enroll),
    (0x2000, StateFlag::Identify),
    (0x4000, StateFlag::Navigation),
];

/// Expand a state bitmask into the named flags whose mask bit is set.
pub fn decode_states(mask: u16) -> Vec<StateFlag> {
    STATE_TABLE
        .iter()
        .filter(|(bit, _)| mask & bit != 0)
        .map(|(_, flag)| *flag)
        .collect()
}

/// Spontaneous sensor notifications carried in STATUS frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SensorEvent {
    #[serde(rename = "EVENT_NONE")]
    None,
    #[serde(rename = "EVENT_IDLE")]
    Idle,
    #[serde(rename = "EVENT_FINGER_DETECT")]
    FingerDetect,
    #[serde(rename = "EVENT_FINGER_LOST")]
    FingerLost,
    #[serde(rename = "EVENT_IMAGE_READY")]
    ImageReady,
    #[serde(rename = "EVENT_CMD_FAILED")]
    CmdFailed,
}

impl SensorEvent {
    fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::Idle),
            3 => Some(Self::FingerDetect),
            4 => Some(Self::FingerLost),
            5 => Some(Self::ImageReady),
            6 => Some(Self::CmdFailed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EnrollFeedback {
    #[serde(rename = "ENROLL_FEEDBACK_DONE")]
    Done,
    #[serde(rename = "ENROLL_FEEDBACK_PROGRESS")]
    Progress,
    #[serde(rename = "ENROLL_FEEDBACK_REJECT_LOW_QUALITY")]
    RejectLowQuality,
    #[serde(rename = "ENROLL_FEEDBACK_REJECT_LOW_COVERAGE")]
    RejectLowCoverage,
    #[serde(rename = "ENROLL_FEEDBACK_REJECT_LOW_MOBILITY")]
    RejectLowMobility,
    #[serde(rename = "ENROLL_FEEDBACK_REJECT_OTHER")]
    RejectOther,
    #[serde(rename = "ENROLL_FEEDBACK_PROGRESS_IMMOBILE")]
    ProgressImmobile,
}

impl EnrollFeedback {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Done),
            2 => Some(Self::Progress),
            3 => Some(Self::RejectLowQuality),
            4 => Some(Self::RejectLowCoverage),
            5 => Some(Self::RejectLowMobility),
            6 => Some(Self::RejectOther),
            7 => Some(Self::ProgressImmobile),
            _ => None,
        }
    }

    /// Progress-style feedback that the enroll flow swallows while waiting
    /// for a terminal result.
    pub fn is_progress(self) -> bool {
        matches!(
            self,
            Self::Progress | Self::RejectLowQuality | Self::ProgressImmobile
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NavGesture {
    #[serde(rename = "CMD_NAV_EVENT_NONE")]
    None,
    #[serde(rename = "CMD_NAV_EVENT_UP")]
    Up,
    #[serde(rename = "CMD_NAV_EVENT_DOWN")]
    Down,
    #[serde(rename = "CMD_NAV_EVENT_RIGHT")]
    Right,
    #[serde(rename = "CMD_NAV_EVENT_LEFT")]
    Left,
    #[serde(rename = "CMD_NAV_EVENT_PRESS")]
    Press,
    #[serde(rename = "CMD_NAV_EVENT_LONG_PRESS")]
    LongPress,
}

impl NavGesture {
    fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::Up),
            2 => Some(Self::Down),
            3 => Some(Self::Right),
            4 => Some(Self::Left),
            5 => Some(Self::Press),
            6 => Some(Self::LongPress),
            _ => None,
        }
    }
}

/// Sensor application result code. Known codes serialize as their symbolic
/// name, everything else as the raw number (the HTTP layer compares the raw
/// value for its 404/409/500 mappings).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppFailCode(pub u16);

impl AppFailCode {
    fn name(self) -> Option<&'static str> {
        match self.0 {
            11 => Some("FPC_RESULT_FAILURE"),
            12 => Some("FPC_RESULT_INVALID_PARAM"),
            13 => Some("FPC_RESULT_WRONG_STATE"),
            14 => Some("FPC_RESULT_OUT_OF_MEMORY"),
            15 => Some("FPC_RESULT_TIMEOUT"),
            16 => Some("FPC_RESULT_NOT_SUPPORTED"),
            _ => None,
        }
    }
}

impl Serialize for AppFailCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.name() {
            Some(name) => serializer.serialize_str(name),
            None => serializer.serialize_u16(self.0),
        }
    }
}

fn hex_bytes<S: Serializer>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
}

/// System configuration block, shared between the GET_SYSTEM_CONFIG parser
/// and the SET_SYSTEM_CONFIG encoder. `config_type` only appears on reads;
/// clients echo it back on writes and the encoder strips it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub config_type: Option<u16>,
    pub version: u16,
    pub finger_scan_interval: u16,
    pub event_at_boot: bool,
    pub uart_stop_mode: bool,
    pub irq_before_tx: bool,
    pub allow_factory_reset: bool,
    pub uart_irq_delay: u8,
    pub uart_baudrate: u8,
    pub max_consecutive_fails: u8,
    pub lockout_time: u8,
    pub idle_before_sleep: u16,
    pub enroll_touches: u8,
    pub immobile_touches: u8,
    pub i2c_address: u16,
}

const SYS_FLAG_EVENT_AT_BOOT: u32 = 0x001;
const SYS_FLAG_UART_STOP_MODE: u32 = 0x010;
const SYS_FLAG_IRQ_BEFORE_TX: u32 = 0x020;
const SYS_FLAG_ALLOW_FACTORY_RESET: u32 = 0x100;

impl SystemConfig {
    fn sys_flags(&self) -> u32 {
        let mut flags = 0;
        if self.event_at_boot {
            flags |= SYS_FLAG_EVENT_AT_BOOT;
        }
        if self.uart_stop_mode {
            flags |= SYS_FLAG_UART_STOP_MODE;
        }
        if self.irq_before_tx {
            flags |= SYS_FLAG_IRQ_BEFORE_TX;
        }
        if self.allow_factory_reset {
            flags |= SYS_FLAG_ALLOW_FACTORY_RESET;
        }
        flags
    }
}

/// A decoded response or event frame, dispatched on the command code.
/// Serializes untagged so each variant's fields form the JSON object the
/// HTTP layer returns.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Response {
    Status {
        event: SensorEvent,
        states: Vec<StateFlag>,
        app_fail_code: AppFailCode,
    },
    Version {
        #[serde(serialize_with = "hex_bytes")]
        mcu_id: Vec<u8>,
        fw_id: u8,
        fuse_level: u8,
        version: String,
    },
    ImageData {
        size: u32,
        width: u16,
        height: u16,
        #[serde(rename = "type")]
        image_type: u16,
        max_chunk_size: u16,
    },
    Enroll {
        template_id: u16,
        feedback: EnrollFeedback,
        samples_remaining: u8,
    },
    Identify {
        finger_found: bool,
        template_id: Option<u16>,
        tag: u16,
    },
    TemplateList {
        template_ids: Vec<u16>,
    },
    TemplateInfo {
        template_id: u16,
        max_chunk_size: u16,
        total_size: u16,
    },
    TemplateSlot {
        id: u16,
        chunk_size: u16,
        total_size: u16,
    },
    SystemConfig(SystemConfig),
    DataGet {
        remaining: u32,
        chunk_size: u32,
        #[serde(serialize_with = "hex_bytes")]
        data: Vec<u8>,
    },
    DataPut {
        total_received: u32,
    },
    Navigation {
        gesture: NavGesture,
        samples: Vec<u16>,
    },
}

impl Response {
    /// The app_fail_code of a STATUS reply, if this is one.
    pub fn app_fail_code(&self) -> Option<u16> {
        match self {
            Response::Status { app_fail_code, .. } => Some(app_fail_code.0),
            _ => None,
        }
    }
}

/// Little-endian field reader over a command body. Length errors carry the
/// command code so decode failures are attributable in logs.
struct Reader<'a> {
    cmd: u16,
    body: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(cmd: u16, body: &'a [u8]) -> Self {
        Self { cmd, body, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], GatewayError> {
        let slice = self
            .body
            .get(self.pos..self.pos + n)
            .ok_or(GatewayError::TruncatedBody {
                cmd: self.cmd,
                need: self.pos + n,
                got: self.body.len(),
            })?;
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, GatewayError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, GatewayError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, GatewayError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.body[self.pos..];
        self.pos = self.body.len();
        slice
    }

    /// Reject trailing bytes for fixed-layout bodies.
    fn expect_end(&self) -> Result<(), GatewayError> {
        if self.pos == self.body.len() {
            Ok(())
        } else {
            Err(GatewayError::TrailingBytes {
                cmd: self.cmd,
                expected: self.pos,
                got: self.body.len(),
            })
        }
    }

    fn bad_field(&self, field: &'static str, value: u32) -> GatewayError {
        GatewayError::BadField {
            cmd: self.cmd,
            field,
            value,
        }
    }
}

fn parse_status(r: &mut Reader) -> Result<Response, GatewayError> {
    let event_code = r.u16()?;
    let state_mask = r.u16()?;
    let app_fail = r.u16()?;
    let event = SensorEvent::from_code(event_code)
        .ok_or_else(|| r.bad_field("event", u32::from(event_code)))?;
    Ok(Response::Status {
        event,
        states: decode_states(state_mask),
        app_fail_code: AppFailCode(app_fail),
    })
}

fn parse_version(r: &mut Reader) -> Result<Response, GatewayError> {
    let mcu_id = r.take(12)?.to_vec();
    let fw_id = r.u8()?;
    let fuse_level = r.u8()?;
    // Length word precedes the string; the string is simply the remainder.
    let _version_len = r.u16()?;
    let version = String::from_utf8_lossy(r.rest()).into_owned();
    Ok(Response::Version {
        mcu_id,
        fw_id,
        fuse_level,
        version,
    })
}

fn parse_image_data(r: &mut Reader) -> Result<Response, GatewayError> {
    let size = r.u32()?;
    let width = r.u16()?;
    let height = r.u16()?;
    let image_type = r.u16()?;
    let max_chunk_size = r.u16()?;
    r.expect_end()?;
    Ok(Response::ImageData {
        size,
        width,
        height,
        image_type,
        max_chunk_size,
    })
}

fn parse_enroll(r: &mut Reader) -> Result<Response, GatewayError> {
    let template_id = r.u16()?;
    let feedback_code = r.u8()?;
    let samples_remaining = r.u8()?;
    r.expect_end()?;
    let feedback = EnrollFeedback::from_code(feedback_code)
        .ok_or_else(|| r.bad_field("feedback", u32::from(feedback_code)))?;
    Ok(Response::Enroll {
        template_id,
        feedback,
        samples_remaining,
    })
}

fn parse_identify(r: &mut Reader) -> Result<Response, GatewayError> {
    let identify_result = r.u16()?;
    let _template_type = r.u16()?;
    let template_id = r.u16()?;
    let tag = r.u16()?;
    r.expect_end()?;
    let finger_found = identify_result == IDENTIFY_MATCH;
    Ok(Response::Identify {
        finger_found,
        template_id: finger_found.then_some(template_id),
        tag,
    })
}

fn parse_template_list(r: &mut Reader) -> Result<Response, GatewayError> {
    let count = r.u16()?;
    let mut template_ids = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        template_ids.push(r.u16()?);
    }
    r.expect_end()?;
    Ok(Response::TemplateList { template_ids })
}

fn parse_template_info(r: &mut Reader) -> Result<Response, GatewayError> {
    let template_id = r.u16()?;
    let max_chunk_size = r.u16()?;
    let total_size = r.u16()?;
    r.expect_end()?;
    Ok(Response::TemplateInfo {
        template_id,
        max_chunk_size,
        total_size,
    })
}

fn parse_template_slot(r: &mut Reader) -> Result<Response, GatewayError> {
    let id = r.u16()?;
    let chunk_size = r.u16()?;
    let total_size = r.u16()?;
    r.expect_end()?;
    Ok(Response::TemplateSlot {
        id,
        chunk_size,
        total_size,
    })
}

fn parse_system_config(r: &mut Reader) -> Result<Response, GatewayError> {
    let config_type = r.u16()?;
    let _unknown = r.u16()?;
    let version = r.u16()?;
    let finger_scan_interval = r.u16()?;
    let sys_flags = r.u32()?;
    let uart_irq_delay = r.u8()?;
    let uart_baudrate = r.u8()?;
    let max_consecutive_fails = r.u8()?;
    let lockout_time = r.u8()?;
    let idle_before_sleep = r.u16()?;
    let enroll_touches = r.u8()?;
    let immobile_touches = r.u8()?;
    let i2c_address = r.u16()?;
    let _trailer = r.u16()?;
    r.expect_end()?;
    Ok(Response::SystemConfig(SystemConfig {
        config_type: Some(config_type),
        version,
        finger_scan_interval,
        event_at_boot: sys_flags & SYS_FLAG_EVENT_AT_BOOT != 0,
        uart_stop_mode: sys_flags & SYS_FLAG_UART_STOP_MODE != 0,
        irq_before_tx: sys_flags & SYS_FLAG_IRQ_BEFORE_TX != 0,
        allow_factory_reset: sys_flags & SYS_FLAG_ALLOW_FACTORY_RESET != 0,
        uart_irq_delay,
        uart_baudrate,
        max_consecutive_fails,
        lockout_time,
        idle_before_sleep,
        enroll_touches,
        immobile_touches,
        i2c_address,
    }))
}

fn parse_data_get(r: &mut Reader) -> Result<Response, GatewayError> {
    let remaining = r.u32()?;
    let chunk_size = r.u32()?;
    let data = r.rest().to_vec();
    Ok(Response::DataGet {
        remaining,
        chunk_size,
        data,
    })
}

fn parse_data_put(r: &mut Reader) -> Result<Response, GatewayError> {
    let total_received = r.u32()?;
    r.expect_end()?;
    Ok(Response::DataPut { total_received })
}

fn parse_navigation(r: &mut Reader) -> Result<Response, GatewayError> {
    let gesture_code = r.u16()?;
    let n_samples = r.u16()?;
    let mut samples = Vec::with_capacity(usize::from(n_samples));
    for _ in 0..n_samples {
        samples.push(r.u16()?);
    }
    r.expect_end()?;
    let gesture = NavGesture::from_code(gesture_code)
        .ok_or_else(|| r.bad_field("gesture", u32::from(gesture_code)))?;
    Ok(Response::Navigation { gesture, samples })
}

fn dispatch(cmd: u16, body: &[u8]) -> Result<Response, GatewayError> {
    let mut r = Reader::new(cmd, body);
    match cmd {
        CMD_STATUS => parse_status(&mut r),
        CMD_VERSION => parse_version(&mut r),
        CMD_IMAGE_DATA => parse_image_data(&mut r),
        CMD_ENROLL => parse_enroll(&mut r),
        CMD_IDENTIFY => parse_identify(&mut r),
        CMD_LIST_TEMPLATES => parse_template_list(&mut r),
        CMD_GET_TEMPLATE_DATA => parse_template_info(&mut r),
        CMD_PUT_TEMPLATE_DATA => parse_template_slot(&mut r),
        CMD_GET_SYSTEM_CONFIG => parse_system_config(&mut r),
        CMD_DATA_GET => parse_data_get(&mut r),
        CMD_DATA_PUT => parse_data_put(&mut r),
        CMD_NAVIGATION => parse_navigation(&mut r),
        other => Err(GatewayError::UnknownCommand(other)),
    }
}

enum AeadKey {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
}

impl AeadKey {
    fn seal(&self, nonce: &[u8], aad: &[u8], plain: &[u8]) -> Result<Vec<u8>, GatewayError> {
        let payload = Payload { msg: plain, aad };
        let out = match self {
            AeadKey::Aes128(c) => c.encrypt(nonce.into(), payload),
            AeadKey::Aes256(c) => c.encrypt(nonce.into(), payload),
        };
        out.map_err(|_| GatewayError::CryptoAuthFail)
    }

    fn open(&self, nonce: &[u8], aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, GatewayError> {
        let payload = Payload { msg: sealed, aad };
        let out = match self {
            AeadKey::Aes128(c) => c.decrypt(nonce.into(), payload),
            AeadKey::Aes256(c) => c.decrypt(nonce.into(), payload),
        };
        out.map_err(|_| GatewayError::CryptoAuthFail)
    }
}

/// The sensor codec: carries the (optional) symmetric key and turns commands
/// into wire frames and wire frames into [`Response`] values.
pub struct Fpc2534 {
    key: Option<AeadKey>,
}

impl Fpc2534 {
    /// Build a codec. `key` must be 16 or 32 bytes when present; other
    /// lengths are rejected without touching the sensor.
    pub fn new(key: Option<&[u8]>) -> Result<Self, GatewayError> {
        let key = match key {
            None => None,
            Some(k) if k.len() == 16 => Some(AeadKey::Aes128(Box::new(
                Aes128Gcm::new_from_slice(k).map_err(|_| GatewayError::KeyLength(k.len()))?,
            ))),
            Some(k) if k.len() == 32 => Some(AeadKey::Aes256(Box::new(
                Aes256Gcm::new_from_slice(k).map_err(|_| GatewayError::KeyLength(k.len()))?,
            ))),
            Some(k) => return Err(GatewayError::KeyLength(k.len())),
        };
        Ok(Self { key })
    }

    fn wrap_packet(&self, inner: Vec<u8>) -> Result<Vec<u8>, GatewayError> {
        let mut flags = FLAG_HOST;
        let mut length = inner.len();
        if self.key.is_some() {
            flags |= FLAG_SECURE;
            length += SECURE_OVERHEAD;
        }
        let length = u16::try_from(length).map_err(|_| GatewayError::FrameTooLarge(inner.len()))?;

        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
        header.extend_from_slice(&ENVELOPE_TYPE.to_le_bytes());
        header.extend_from_slice(&flags.to_le_bytes());
        header.extend_from_slice(&length.to_le_bytes());

        match &self.key {
            None => {
                let mut packet = header;
                packet.extend_from_slice(&inner);
                Ok(packet)
            }
            Some(key) => {
                let nonce: [u8; NONCE_LEN] = rand::random();
                let sealed = key.seal(&nonce, &header, &inner)?;
                // RustCrypto emits ciphertext || tag; the wire wants
                // nonce || tag || ciphertext.
                let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);
                let mut packet = header;
                packet.extend_from_slice(&nonce);
                packet.extend_from_slice(tag);
                packet.extend_from_slice(ciphertext);
                Ok(packet)
            }
        }
    }

    /// Encode `cmd` plus its payload into a framed (and, with a key,
    /// encrypted) packet ready for the transport.
    pub fn encode_request(&self, cmd: u16, payload: &[u8]) -> Result<Vec<u8>, GatewayError> {
        let mut inner = Vec::with_capacity(4 + payload.len());
        inner.extend_from_slice(&cmd.to_le_bytes());
        inner.extend_from_slice(&FRAME_REQUEST.to_le_bytes());
        inner.extend_from_slice(payload);
        self.wrap_packet(inner)
    }

    /// Decode an inbound wire frame into a typed [`Response`].
    pub fn parse_response(&self, data: &[u8]) -> Result<Response, GatewayError> {
        if data.len() < HEADER_LEN {
            return Err(GatewayError::ShortFrame {
                need: HEADER_LEN,
                got: data.len(),
            });
        }
        let header = &data[..HEADER_LEN];
        let flags = u16::from_le_bytes([header[4], header[5]]);

        let decrypted;
        let inner: &[u8] = if flags & FLAG_SECURE != 0 {
            let key = self.key.as_ref().ok_or(GatewayError::CryptoMissingKey)?;
            if data.len() < HEADER_LEN + SECURE_OVERHEAD {
                return Err(GatewayError::ShortFrame {
                    need: HEADER_LEN + SECURE_OVERHEAD,
                    got: data.len(),
                });
            }
            let nonce = &data[HEADER_LEN..HEADER_LEN + NONCE_LEN];
            let tag = &data[HEADER_LEN + NONCE_LEN..HEADER_LEN + SECURE_OVERHEAD];
            let ciphertext = &data[HEADER_LEN + SECURE_OVERHEAD..];
            let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
            sealed.extend_from_slice(ciphertext);
            sealed.extend_from_slice(tag);
            decrypted = key.open(nonce, header, &sealed)?;
            &decrypted
        } else {
            &data[HEADER_LEN..]
        };

        if inner.len() < 4 {
            return Err(GatewayError::ShortFrame {
                need: HEADER_LEN + 4,
                got: HEADER_LEN + inner.len(),
            });
        }
        let cmd = u16::from_le_bytes([inner[0], inner[1]]);
        let frame_type = u16::from_le_bytes([inner[2], inner[3]]);
        if frame_type != FRAME_RESPONSE && frame_type != FRAME_EVENT {
            return Err(GatewayError::UnknownFrameType(frame_type));
        }
        dispatch(cmd, &inner[4..])
    }

    // Per-command request builders.

    pub fn status(&self) -> Result<Vec<u8>, GatewayError> {
        self.encode_request(CMD_STATUS, &[])
    }

    pub fn version(&self) -> Result<Vec<u8>, GatewayError> {
        self.encode_request(CMD_VERSION, &[])
    }

    pub fn capture(&self) -> Result<Vec<u8>, GatewayError> {
        self.encode_request(CMD_CAPTURE, &[])
    }

    pub fn abort(&self) -> Result<Vec<u8>, GatewayError> {
        self.encode_request(CMD_ABORT, &[])
    }

    pub fn reset(&self) -> Result<Vec<u8>, GatewayError> {
        self.encode_request(CMD_RESET, &[])
    }

    pub fn list_templates(&self) -> Result<Vec<u8>, GatewayError> {
        self.encode_request(CMD_LIST_TEMPLATES, &[])
    }

    /// Request the image transfer descriptor (type selector 2 = raw).
    pub fn request_image_data(&self) -> Result<Vec<u8>, GatewayError> {
        self.encode_request(CMD_IMAGE_DATA, &2u32.to_le_bytes())
    }

    pub fn enroll_finger(&self, id: Option<u16>) -> Result<Vec<u8>, GatewayError> {
        let id_type: u16 = if id.is_none() { 0x4045 } else { 0x3034 };
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&id_type.to_le_bytes());
        payload.extend_from_slice(&id.unwrap_or(0).to_le_bytes());
        self.encode_request(CMD_ENROLL, &payload)
    }

    pub fn identify_finger(&self, id: Option<u16>) -> Result<Vec<u8>, GatewayError> {
        let id_type: u16 = if id.is_none() { 0x2023 } else { 0x3034 };
        let mut payload = Vec::with_capacity(6);
        payload.extend_from_slice(&id_type.to_le_bytes());
        payload.extend_from_slice(&id.unwrap_or(0).to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());
        self.encode_request(CMD_IDENTIFY, &payload)
    }

    pub fn download_template(&self, id: u16) -> Result<Vec<u8>, GatewayError> {
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&id.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());
        self.encode_request(CMD_GET_TEMPLATE_DATA, &payload)
    }

    pub fn upload_template(&self, id: u16, size: u16) -> Result<Vec<u8>, GatewayError> {
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&id.to_le_bytes());
        payload.extend_from_slice(&size.to_le_bytes());
        self.encode_request(CMD_PUT_TEMPLATE_DATA, &payload)
    }

    pub fn delete_template(&self, id: u16) -> Result<Vec<u8>, GatewayError> {
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&0x3034u16.to_le_bytes());
        payload.extend_from_slice(&id.to_le_bytes());
        self.encode_request(CMD_DELETE_TEMPLATE, &payload)
    }

    pub fn data_get(&self, chunk_size: u32) -> Result<Vec<u8>, GatewayError> {
        self.encode_request(CMD_DATA_GET, &chunk_size.to_le_bytes())
    }

    pub fn data_put(&self, remaining: u32, data: &[u8]) -> Result<Vec<u8>, GatewayError> {
        let mut payload = Vec::with_capacity(8 + data.len());
        payload.extend_from_slice(&remaining.to_le_bytes());
        payload.extend_from_slice(&(data.len() as u32).to_le_bytes());
        payload.extend_from_slice(data);
        self.encode_request(CMD_DATA_PUT, &payload)
    }

    pub fn get_system_config(&self, default: bool) -> Result<Vec<u8>, GatewayError> {
        let selector: u16 = if default { 0 } else { 1 };
        self.encode_request(CMD_GET_SYSTEM_CONFIG, &selector.to_le_bytes())
    }

    pub fn set_system_config(&self, config: &SystemConfig) -> Result<Vec<u8>, GatewayError> {
        let mut payload = Vec::with_capacity(20);
        payload.extend_from_slice(&config.version.to_le_bytes());
        payload.extend_from_slice(&config.finger_scan_interval.to_le_bytes());
        payload.extend_from_slice(&config.sys_flags().to_le_bytes());
        payload.push(config.uart_irq_delay);
        payload.push(config.uart_baudrate);
        payload.push(config.max_consecutive_fails);
        payload.push(config.lockout_time);
        payload.extend_from_slice(&config.idle_before_sleep.to_le_bytes());
        payload.push(config.enroll_touches);
        payload.push(config.immobile_touches);
        payload.extend_from_slice(&config.i2c_address.to_le_bytes());
        payload.extend_from_slice(&1u16.to_le_bytes());
        self.encode_request(CMD_SET_SYSTEM_CONFIG, &payload)
    }

    /// Encode SET_CRYPTO_KEY. Validates the key length before the sensor is
    /// contacted.
    pub fn set_key(&self, key: &[u8]) -> Result<Vec<u8>, GatewayError> {
        if key.len() != 16 && key.len() != 32 {
            return Err(GatewayError::KeyLength(key.len()));
        }
        let mut payload = Vec::with_capacity(1 + key.len());
        payload.push(key.len() as u8);
        payload.extend_from_slice(key);
        self.encode_request(CMD_SET_CRYPTO_KEY, &payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> Fpc2534 {
        Fpc2534::new(None).unwrap()
    }

    fn keyed(key: &[u8]) -> Fpc2534 {
        Fpc2534::new(Some(key)).unwrap()
    }

    /// Wrap a response-direction inner frame so parse_response accepts it.
    fn response_frame(codec: &Fpc2534, cmd: u16, body: &[u8]) -> Vec<u8> {
        let mut inner = Vec::new();
        inner.extend_from_slice(&cmd.to_le_bytes());
        inner.extend_from_slice(&FRAME_RESPONSE.to_le_bytes());
        inner.extend_from_slice(body);
        codec.wrap_packet(inner).unwrap()
    }

    #[test]
    fn status_request_golden_bytes() {
        let frame = plain().status().unwrap();
        assert_eq!(
            frame,
            [0x04, 0x00, 0x11, 0x00, 0x10, 0x00, 0x04, 0x00, 0x40, 0x00, 0x11, 0x00]
        );
    }

    #[test]
    fn status_reply_decodes_event_and_states() {
        let frame = response_frame(&plain(), CMD_STATUS, &[0x01, 0x00, 0x81, 0x00, 0x00, 0x00]);
        match plain().parse_response(&frame).unwrap() {
            Response::Status {
                event,
                states,
                app_fail_code,
            } => {
                assert_eq!(event, SensorEvent::Idle);
                assert_eq!(states, vec![StateFlag::AppFwReady, StateFlag::FingerDown]);
                assert_eq!(app_fail_code, AppFailCode(0));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn state_mask_expands_every_set_bit() {
        assert!(decode_states(0).is_empty());
        let all: u16 = STATE_TABLE.iter().map(|(bit, _)| bit).sum();
        assert_eq!(decode_states(all).len(), STATE_TABLE.len());
        // Unnamed bits contribute nothing.
        assert_eq!(decode_states(0x0008), vec![]);
        assert_eq!(
            decode_states(0x2001),
            vec![StateFlag::AppFwReady, StateFlag::Identify]
        );
    }

    #[test]
    fn identify_no_match_hides_template_id() {
        let body = [0x00, 0x00, 0x34, 0x30, 0x00, 0x00, 0x00, 0x00];
        let frame = response_frame(&plain(), CMD_IDENTIFY, &body);
        match plain().parse_response(&frame).unwrap() {
            Response::Identify {
                finger_found,
                template_id,
                tag,
            } => {
                assert!(!finger_found);
                assert_eq!(template_id, None);
                assert_eq!(tag, 0);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn identify_match_reports_template_id() {
        let body = [0xEC, 0x61, 0x34, 0x30, 0x07, 0x00, 0x00, 0x00];
        let frame = response_frame(&plain(), CMD_IDENTIFY, &body);
        match plain().parse_response(&frame).unwrap() {
            Response::Identify {
                finger_found,
                template_id,
                tag,
            } => {
                assert!(finger_found);
                assert_eq!(template_id, Some(7));
                assert_eq!(tag, 0);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn template_list_reads_count_prefixed_ids() {
        let body = [0x03, 0x00, 0x01, 0x00, 0x05, 0x00, 0x09, 0x00];
        let frame = response_frame(&plain(), CMD_LIST_TEMPLATES, &body);
        match plain().parse_response(&frame).unwrap() {
            Response::TemplateList { template_ids } => assert_eq!(template_ids, vec![1, 5, 9]),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn template_list_rejects_length_mismatch() {
        // count says 3 but only two ids follow
        let body = [0x03, 0x00, 0x01, 0x00, 0x05, 0x00];
        let frame = response_frame(&plain(), CMD_LIST_TEMPLATES, &body);
        assert!(matches!(
            plain().parse_response(&frame),
            Err(GatewayError::TruncatedBody { .. })
        ));
    }

    #[test]
    fn version_reply_skips_length_word() {
        let mut body = vec![0xAA; 12];
        body.push(0x02); // fw_id
        body.push(0x01); // fuse_level
        body.extend_from_slice(&5u16.to_le_bytes());
        body.extend_from_slice(b"1.2.3");
        let frame = response_frame(&plain(), CMD_VERSION, &body);
        match plain().parse_response(&frame).unwrap() {
            Response::Version {
                mcu_id,
                fw_id,
                fuse_level,
                version,
            } => {
                assert_eq!(mcu_id, vec![0xAA; 12]);
                assert_eq!(fw_id, 2);
                assert_eq!(fuse_level, 1);
                assert_eq!(version, "1.2.3");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn navigation_reply_reads_sample_array() {
        let mut body = Vec::new();
        body.extend_from_slice(&2u16.to_le_bytes()); // down
        body.extend_from_slice(&3u16.to_le_bytes());
        for s in [10u16, 20, 30] {
            body.extend_from_slice(&s.to_le_bytes());
        }
        let frame = response_frame(&plain(), CMD_NAVIGATION, &body);
        match plain().parse_response(&frame).unwrap() {
            Response::Navigation { gesture, samples } => {
                assert_eq!(gesture, NavGesture::Down);
                assert_eq!(samples, vec![10, 20, 30]);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn system_config_round_trips_flag_bits() {
        let config = SystemConfig {
            config_type: None,
            version: 2,
            finger_scan_interval: 34,
            event_at_boot: true,
            uart_stop_mode: false,
            irq_before_tx: true,
            allow_factory_reset: true,
            uart_irq_delay: 1,
            uart_baudrate: 5,
            max_consecutive_fails: 5,
            lockout_time: 15,
            idle_before_sleep: 0,
            enroll_touches: 12,
            immobile_touches: 0,
            i2c_address: 36,
        };
        assert_eq!(config.sys_flags(), 0x121);

        let frame = plain().set_system_config(&config).unwrap();
        // inner payload starts after 8-byte header + 4-byte inner header
        let payload = &frame[12..];
        assert_eq!(payload.len(), 22);
        assert_eq!(&payload[0..2], &2u16.to_le_bytes());
        assert_eq!(&payload[4..8], &0x121u32.to_le_bytes());
        assert_eq!(&payload[20..22], &1u16.to_le_bytes());

        // A GET reply carrying the same fields parses back to the config.
        let mut body = Vec::new();
        body.extend_from_slice(&7u16.to_le_bytes()); // type
        body.extend_from_slice(&0u16.to_le_bytes()); // unknown
        body.extend_from_slice(payload);
        let frame = response_frame(&plain(), CMD_GET_SYSTEM_CONFIG, &body);
        match plain().parse_response(&frame).unwrap() {
            Response::SystemConfig(parsed) => {
                assert_eq!(parsed.config_type, Some(7));
                assert_eq!(
                    SystemConfig {
                        config_type: None,
                        ..parsed
                    },
                    config
                );
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn enroll_request_id_type_selection() {
        let anon = plain().enroll_finger(None).unwrap();
        assert_eq!(&anon[12..], &[0x45, 0x40, 0x00, 0x00]);
        let pinned = plain().enroll_finger(Some(3)).unwrap();
        assert_eq!(&pinned[12..], &[0x34, 0x30, 0x03, 0x00]);
    }

    #[test]
    fn identify_request_id_type_selection() {
        let any = plain().identify_finger(None).unwrap();
        assert_eq!(&any[12..], &[0x23, 0x20, 0x00, 0x00, 0x00, 0x00]);
        let pinned = plain().identify_finger(Some(9)).unwrap();
        assert_eq!(&pinned[12..], &[0x34, 0x30, 0x09, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn data_put_request_layout() {
        let frame = plain().data_put(300, &[1, 2, 3]).unwrap();
        let payload = &frame[12..];
        assert_eq!(&payload[0..4], &300u32.to_le_bytes());
        assert_eq!(&payload[4..8], &3u32.to_le_bytes());
        assert_eq!(&payload[8..], &[1, 2, 3]);
    }

    #[test]
    fn set_key_rejects_bad_lengths() {
        assert!(matches!(
            plain().set_key(&[0u8; 17]),
            Err(GatewayError::KeyLength(17))
        ));
        let frame = plain().set_key(&[7u8; 16]).unwrap();
        assert_eq!(frame[12], 16);
        assert_eq!(&frame[13..], &[7u8; 16]);
    }

    #[test]
    fn codec_rejects_bad_key_lengths() {
        assert!(matches!(
            Fpc2534::new(Some(&[0u8; 24])),
            Err(GatewayError::KeyLength(24))
        ));
        assert!(Fpc2534::new(Some(&[0u8; 16])).is_ok());
        assert!(Fpc2534::new(Some(&[0u8; 32])).is_ok());
    }

    #[test]
    fn secure_round_trip_both_key_sizes() {
        for key in [vec![0x11u8; 16], vec![0x22u8; 32]] {
            let codec = keyed(&key);
            let frame = response_frame(&codec, CMD_STATUS, &[0x00, 0x00, 0x01, 0x20, 0x00, 0x00]);
            // secure envelope: header + nonce + tag + ciphertext
            assert_eq!(frame[4] & 0x01, 0x01);
            assert_eq!(frame.len(), 8 + SECURE_OVERHEAD + 10);
            match codec.parse_response(&frame).unwrap() {
                Response::Status { states, .. } => {
                    assert_eq!(
                        states,
                        vec![StateFlag::AppFwReady, StateFlag::Identify]
                    );
                }
                other => panic!("wrong variant: {other:?}"),
            }
        }
    }

    #[test]
    fn secure_length_field_includes_overhead() {
        let codec = keyed(&[1u8; 16]);
        let frame = codec.status().unwrap();
        let length = u16::from_le_bytes([frame[6], frame[7]]);
        assert_eq!(length as usize, 4 + SECURE_OVERHEAD);
    }

    #[test]
    fn tampered_tag_fails_auth() {
        let codec = keyed(&[5u8; 32]);
        let mut frame = response_frame(&codec, CMD_STATUS, &[0x01, 0x00, 0x00, 0x00, 0x00, 0x00]);
        frame[20] ^= 0x01; // first tag byte
        assert!(matches!(
            codec.parse_response(&frame),
            Err(GatewayError::CryptoAuthFail)
        ));
    }

    #[test]
    fn wrong_key_fails_auth() {
        let frame = response_frame(&keyed(&[5u8; 16]), CMD_STATUS, &[0u8; 6]);
        assert!(matches!(
            keyed(&[6u8; 16]).parse_response(&frame),
            Err(GatewayError::CryptoAuthFail)
        ));
    }

    #[test]
    fn secure_frame_without_key_is_rejected() {
        let frame = response_frame(&keyed(&[5u8; 16]), CMD_STATUS, &[0u8; 6]);
        assert!(matches!(
            plain().parse_response(&frame),
            Err(GatewayError::CryptoMissingKey)
        ));
    }

    #[test]
    fn fresh_nonce_per_secure_frame() {
        let codec = keyed(&[9u8; 16]);
        let a = codec.status().unwrap();
        let b = codec.status().unwrap();
        assert_ne!(a[8..20], b[8..20]);
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        // request-direction frame (0x0011) fed back into the decoder
        let frame = plain().status().unwrap();
        assert!(matches!(
            plain().parse_response(&frame),
            Err(GatewayError::UnknownFrameType(0x0011))
        ));
    }

    #[test]
    fn unknown_command_is_rejected() {
        let frame = response_frame(&plain(), 0x0999, &[]);
        assert!(matches!(
            plain().parse_response(&frame),
            Err(GatewayError::UnknownCommand(0x0999))
        ));
    }

    #[test]
    fn short_header_is_rejected() {
        assert!(matches!(
            plain().parse_response(&[0x04, 0x00, 0x11]),
            Err(GatewayError::ShortFrame { .. })
        ));
    }

    #[test]
    fn status_json_shape() {
        let frame = response_frame(&plain(), CMD_STATUS, &[0x04, 0x00, 0x80, 0x00, 0x0B, 0x00]);
        let response = plain().parse_response(&frame).unwrap();
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["event"], "EVENT_FINGER_LOST");
        assert_eq!(value["states"][0], "STATE_FINGER_DOWN");
        assert_eq!(value["app_fail_code"], "FPC_RESULT_FAILURE");

        // unknown app codes stay numeric
        let frame = response_frame(&plain(), CMD_STATUS, &[0x00, 0x00, 0x00, 0x00, 0x15, 0x00]);
        let value = serde_json::to_value(plain().parse_response(&frame).unwrap()).unwrap();
        assert_eq!(value["app_fail_code"], 21);
    }
}
