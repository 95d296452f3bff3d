//! The binary command/response protocol spoken over the USB link.
//!
//! Commands are a closed enum: each variant carries its typed parameters
//! and knows its wire id, body encoding, timeout class and variant gate.
//! Callers never build raw bytes themselves.

use std::fmt;
use std::time::Duration;

use scroll::{BE, Pread, Pwrite};

use crate::constants::{
    CMD_HEADER_LEN, FACTORY_RESET_MAGIC, FORMAT_MAGIC, FRAME_MAGIC, LONG_TIMEOUT, MAX_BODY_LEN,
    RESP_HEADER_LEN, SCHEDULE_TITLE_LEN, SETTINGS_BODY_LEN, SHORT_TIMEOUT, commands, status,
};
use crate::error::{Error, Result};

/// A command understood by the recorder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Identify the device: model code, firmware version, serial.
    GetDeviceInfo,
    /// Read the device RTC as unix seconds.
    GetDeviceTime,
    /// Set the device RTC.
    SetDeviceTime { unix_secs: u64 },
    /// Number of recordings on storage.
    GetFileCount,
    /// Full recording listing with names, sizes and timestamps.
    GetFileList,
    /// One 4 KiB block of a recording. Blocks are requested strictly
    /// sequentially; a short block is the final one.
    GetFileBlock { name: String, index: u32 },
    /// Delete a recording by name.
    DeleteFile { name: String },
    /// Total/free storage bytes and card health.
    GetStorageInfo,
    /// Erase storage. Body carries a fixed magic so a corrupted frame
    /// can never format the card.
    FormatStorage,
    /// Read the settings field block.
    GetSettings,
    /// Write the settings field block.
    SetSettings(DeviceSettings),
    /// Push calendar entries for scheduled recording.
    PushSchedule(Vec<ScheduleEntry>),
    /// Restore factory defaults. Magic-gated like `FormatStorage`.
    FactoryReset,
    /// Announce an upcoming firmware image; the device accepts or
    /// rejects via the response status.
    RequestFirmwareUpgrade {
        version: [u8; 3],
        size: u32,
        crc: u32,
    },
    /// Scan for nearby Bluetooth audio devices. Gated to BT models.
    BtScan,
    /// Pair with a scanned device. Gated to BT models.
    BtConnect { addr: [u8; 6] },
    /// Current Bluetooth link state. Gated to BT models.
    BtStatus,
}

impl Command {
    pub fn id(&self) -> u16 {
        match self {
            Command::GetDeviceInfo => commands::GET_DEVICE_INFO,
            Command::GetDeviceTime => commands::GET_DEVICE_TIME,
            Command::SetDeviceTime { .. } => commands::SET_DEVICE_TIME,
            Command::GetFileCount => commands::GET_FILE_COUNT,
            Command::GetFileList => commands::GET_FILE_LIST,
            Command::GetFileBlock { .. } => commands::GET_FILE_BLOCK,
            Command::DeleteFile { .. } => commands::DELETE_FILE,
            Command::GetStorageInfo => commands::GET_STORAGE_INFO,
            Command::FormatStorage => commands::FORMAT_STORAGE,
            Command::GetSettings => commands::GET_SETTINGS,
            Command::SetSettings(_) => commands::SET_SETTINGS,
            Command::PushSchedule(_) => commands::PUSH_SCHEDULE,
            Command::FactoryReset => commands::FACTORY_RESET,
            Command::RequestFirmwareUpgrade { .. } => commands::REQUEST_FIRMWARE_UPGRADE,
            Command::BtScan => commands::BT_SCAN,
            Command::BtConnect { .. } => commands::BT_CONNECT,
            Command::BtStatus => commands::BT_STATUS,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::GetDeviceInfo => "GET_DEVICE_INFO",
            Command::GetDeviceTime => "GET_DEVICE_TIME",
            Command::SetDeviceTime { .. } => "SET_DEVICE_TIME",
            Command::GetFileCount => "GET_FILE_COUNT",
            Command::GetFileList => "GET_FILE_LIST",
            Command::GetFileBlock { .. } => "GET_FILE_BLOCK",
            Command::DeleteFile { .. } => "DELETE_FILE",
            Command::GetStorageInfo => "GET_STORAGE_INFO",
            Command::FormatStorage => "FORMAT_STORAGE",
            Command::GetSettings => "GET_SETTINGS",
            Command::SetSettings(_) => "SET_SETTINGS",
            Command::PushSchedule(_) => "PUSH_SCHEDULE",
            Command::FactoryReset => "FACTORY_RESET",
            Command::RequestFirmwareUpgrade { .. } => "REQUEST_FIRMWARE_UPGRADE",
            Command::BtScan => "BT_SCAN",
            Command::BtConnect { .. } => "BT_CONNECT",
            Command::BtStatus => "BT_STATUS",
        }
    }

    /// Per-command response deadline. Slow operations (card format,
    /// radio scans, full listings) get the long class.
    pub fn timeout(&self) -> Duration {
        match self {
            Command::GetFileList
            | Command::FormatStorage
            | Command::FactoryReset
            | Command::BtScan
            | Command::BtConnect { .. } => LONG_TIMEOUT,
            _ => SHORT_TIMEOUT,
        }
    }

    /// Variant gate: true for the Bluetooth family, which only the
    /// BT-capable models answer.
    pub fn needs_bluetooth(&self) -> bool {
        matches!(
            self,
            Command::BtScan | Command::BtConnect { .. } | Command::BtStatus
        )
    }

    /// Serialize into a complete command frame with the given sequence id.
    pub fn encode(&self, seq: u32) -> Result<Vec<u8>> {
        let body = self.body()?;
        let mut buf = vec![0u8; CMD_HEADER_LEN + body.len()];
        buf[0..2].copy_from_slice(&FRAME_MAGIC);
        buf.pwrite_with(self.id(), 2, BE)?;
        buf.pwrite_with(seq, 4, BE)?;
        buf.pwrite_with(body.len() as u32, 8, BE)?;
        buf[CMD_HEADER_LEN..].copy_from_slice(&body);
        Ok(buf)
    }

    fn body(&self) -> Result<Vec<u8>> {
        match self {
            Command::GetDeviceInfo
            | Command::GetDeviceTime
            | Command::GetFileCount
            | Command::GetFileList
            | Command::GetStorageInfo
            | Command::GetSettings
            | Command::BtScan
            | Command::BtStatus => Ok(Vec::new()),
            Command::SetDeviceTime { unix_secs } => {
                let mut buf = vec![0u8; 8];
                buf.pwrite_with(*unix_secs, 0, BE)?;
                Ok(buf)
            }
            Command::GetFileBlock { name, index } => {
                let mut buf = vec![0u8; 4];
                buf.pwrite_with(*index, 0, BE)?;
                put_name(&mut buf, name)?;
                Ok(buf)
            }
            Command::DeleteFile { name } => {
                let mut buf = Vec::new();
                put_name(&mut buf, name)?;
                Ok(buf)
            }
            Command::FormatStorage => Ok(FORMAT_MAGIC.to_vec()),
            Command::SetSettings(settings) => Ok(settings.encode().to_vec()),
            Command::PushSchedule(entries) => {
                if entries.len() > u16::MAX as usize {
                    return Err(Error::protocol("too many schedule entries"));
                }
                let mut buf = vec![0u8; 2];
                buf.pwrite_with(entries.len() as u16, 0, BE)?;
                for entry in entries {
                    entry.encode_into(&mut buf)?;
                }
                Ok(buf)
            }
            Command::FactoryReset => Ok(FACTORY_RESET_MAGIC.to_vec()),
            Command::RequestFirmwareUpgrade { version, size, crc } => {
                let mut buf = vec![0u8; 11];
                buf[0..3].copy_from_slice(version);
                buf.pwrite_with(*size, 3, BE)?;
                buf.pwrite_with(*crc, 7, BE)?;
                Ok(buf)
            }
            Command::BtConnect { addr } => Ok(addr.to_vec()),
        }
    }
}

/// A decoded response frame. `command` and `seq` echo the command frame
/// they answer.
#[derive(Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub command: u16,
    pub seq: u32,
    pub status: u8,
    pub body: Vec<u8>,
}

impl fmt::Debug for ResponseFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.status == status::OK {
            write!(
                f,
                "OK[cmd=0x{:04x} seq={} {}]",
                self.command,
                self.seq,
                hex::encode(&self.body)
            )
        } else {
            write!(
                f,
                "ERROR(0x{:02x})[cmd=0x{:04x} seq={}]",
                self.status, self.command, self.seq
            )
        }
    }
}

impl ResponseFrame {
    pub fn is_ok(&self) -> bool {
        self.status == status::OK
    }
}

/// Incremental response decoder. Bulk reads are fed in as they arrive;
/// complete frames come out once the declared body length is buffered.
/// Never reads past what the transport actually returned.
#[derive(Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Try to parse the next complete frame. `Ok(None)` means more bytes
    /// are needed; a malformed header is an error, never silently skipped.
    pub fn next_frame(&mut self) -> Result<Option<ResponseFrame>> {
        if self.buf.len() < RESP_HEADER_LEN {
            return Ok(None);
        }
        if self.buf[0..2] != FRAME_MAGIC {
            return Err(Error::protocol(format!(
                "bad frame magic: {}",
                hex::encode(&self.buf[0..2])
            )));
        }
        let command = self.buf.pread_with::<u16>(2, BE)?;
        let seq = self.buf.pread_with::<u32>(4, BE)?;
        let status = self.buf[8];
        let body_len = self.buf.pread_with::<u32>(9, BE)? as usize;
        if body_len > MAX_BODY_LEN {
            return Err(Error::protocol(format!(
                "declared body length {body_len} exceeds limit"
            )));
        }
        let total = RESP_HEADER_LEN + body_len;
        if self.buf.len() < total {
            return Ok(None);
        }
        let body = self.buf[RESP_HEADER_LEN..total].to_vec();
        self.buf.drain(..total);
        Ok(Some(ResponseFrame {
            command,
            seq,
            status,
            body,
        }))
    }
}

/// Identity reported by `GET_DEVICE_INFO`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub model_code: u16,
    pub firmware: [u8; 3],
    pub serial: String,
}

impl DeviceInfo {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let offset = &mut 0usize;
        let model_code = body.gread_with::<u16>(offset, BE)?;
        let mut firmware = [0u8; 3];
        for b in &mut firmware {
            *b = body.gread_with::<u8>(offset, BE)?;
        }
        let serial = read_name(body, offset)?;
        Ok(DeviceInfo {
            model_code,
            firmware,
            serial,
        })
    }

    pub fn firmware_version(&self) -> String {
        format!(
            "{}.{}.{}",
            self.firmware[0], self.firmware[1], self.firmware[2]
        )
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:04x} fw {} sn {}",
            self.model_code,
            self.firmware_version(),
            self.serial
        )
    }
}

/// One recording in the device listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub size: u32,
    pub created_unix: u64,
    pub duration_secs: u32,
}

pub fn decode_file_list(body: &[u8]) -> Result<Vec<FileEntry>> {
    let offset = &mut 0usize;
    let count = body.gread_with::<u32>(offset, BE)?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = read_name(body, offset)?;
        let size = body.gread_with::<u32>(offset, BE)?;
        let created_unix = body.gread_with::<u64>(offset, BE)?;
        let duration_secs = body.gread_with::<u32>(offset, BE)?;
        entries.push(FileEntry {
            name,
            size,
            created_unix,
            duration_secs,
        });
    }
    if *offset != body.len() {
        return Err(Error::protocol("trailing bytes after file list"));
    }
    Ok(entries)
}

pub fn decode_file_count(body: &[u8]) -> Result<u32> {
    Ok(body.pread_with::<u32>(0, BE)?)
}

pub fn decode_device_time(body: &[u8]) -> Result<u64> {
    Ok(body.pread_with::<u64>(0, BE)?)
}

/// Storage card state reported by `GET_STORAGE_INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageInfo {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub health: u8,
}

impl StorageInfo {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let offset = &mut 0usize;
        let total_bytes = body.gread_with::<u64>(offset, BE)?;
        let free_bytes = body.gread_with::<u64>(offset, BE)?;
        let health = body.gread_with::<u8>(offset, BE)?;
        Ok(StorageInfo {
            total_bytes,
            free_bytes,
            health,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordingQuality {
    Low,
    #[default]
    Standard,
    High,
}

impl RecordingQuality {
    fn as_raw(self) -> u8 {
        match self {
            RecordingQuality::Low => 0,
            RecordingQuality::Standard => 1,
            RecordingQuality::High => 2,
        }
    }

    fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(RecordingQuality::Low),
            1 => Ok(RecordingQuality::Standard),
            2 => Ok(RecordingQuality::High),
            other => Err(Error::protocol(format!(
                "invalid recording quality 0x{other:02x}"
            ))),
        }
    }
}

/// Device settings. On the wire this is one shared 8-byte body with one
/// field per fixed offset; the struct is the only way callers touch it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceSettings {
    pub auto_record: bool,
    pub auto_play: bool,
    pub bluetooth_tone: bool,
    pub notification_sound: bool,
    pub quality: RecordingQuality,
}

impl DeviceSettings {
    pub fn encode(&self) -> [u8; SETTINGS_BODY_LEN] {
        let mut body = [0u8; SETTINGS_BODY_LEN];
        body[0] = self.auto_record as u8;
        body[1] = self.auto_play as u8;
        body[2] = self.bluetooth_tone as u8;
        body[3] = self.notification_sound as u8;
        body[4] = self.quality.as_raw();
        body
    }

    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() != SETTINGS_BODY_LEN {
            return Err(Error::protocol(format!(
                "settings body is {} bytes, expected {}",
                body.len(),
                SETTINGS_BODY_LEN
            )));
        }
        Ok(DeviceSettings {
            auto_record: parse_flag(body[0], "auto_record")?,
            auto_play: parse_flag(body[1], "auto_play")?,
            bluetooth_tone: parse_flag(body[2], "bluetooth_tone")?,
            notification_sound: parse_flag(body[3], "notification_sound")?,
            quality: RecordingQuality::from_raw(body[4])?,
        })
    }
}

fn parse_flag(raw: u8, field: &str) -> Result<bool> {
    match raw {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(Error::protocol(format!(
            "invalid {field} flag 0x{other:02x}"
        ))),
    }
}

/// One calendar entry pushed for scheduled recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub start_unix: u64,
    pub end_unix: u64,
    pub title: String,
}

impl ScheduleEntry {
    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        if self.title.len() > SCHEDULE_TITLE_LEN {
            return Err(Error::protocol(format!(
                "schedule title longer than {SCHEDULE_TITLE_LEN} bytes"
            )));
        }
        let base = buf.len();
        buf.resize(base + 16 + SCHEDULE_TITLE_LEN, 0);
        buf.pwrite_with(self.start_unix, base, BE)?;
        buf.pwrite_with(self.end_unix, base + 8, BE)?;
        buf[base + 16..base + 16 + self.title.len()].copy_from_slice(self.title.as_bytes());
        Ok(())
    }
}

/// A Bluetooth device found by `BT_SCAN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtDevice {
    pub addr: [u8; 6],
    pub name: String,
}

impl BtDevice {
    pub fn addr_string(&self) -> String {
        self.addr
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

pub fn decode_bt_scan(body: &[u8]) -> Result<Vec<BtDevice>> {
    let offset = &mut 0usize;
    let count = body.gread_with::<u8>(offset, BE)?;
    let mut devices = Vec::with_capacity(count as usize);
    for _ in 0..count {
        devices.push(read_bt_device(body, offset)?);
    }
    Ok(devices)
}

/// Bluetooth link state reported by `BT_STATUS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BtLinkStatus {
    Idle,
    Connected(BtDevice),
}

impl BtLinkStatus {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let offset = &mut 0usize;
        match body.gread_with::<u8>(offset, BE)? {
            0 => Ok(BtLinkStatus::Idle),
            1 => Ok(BtLinkStatus::Connected(read_bt_device(body, offset)?)),
            other => Err(Error::protocol(format!("invalid BT state 0x{other:02x}"))),
        }
    }
}

fn read_bt_device(src: &[u8], offset: &mut usize) -> Result<BtDevice> {
    let mut addr = [0u8; 6];
    for b in &mut addr {
        *b = src.gread_with::<u8>(offset, BE)?;
    }
    let name = read_name(src, offset)?;
    Ok(BtDevice { addr, name })
}

fn put_name(buf: &mut Vec<u8>, name: &str) -> Result<()> {
    if name.len() > u8::MAX as usize {
        return Err(Error::protocol("file name longer than 255 bytes"));
    }
    buf.push(name.len() as u8);
    buf.extend_from_slice(name.as_bytes());
    Ok(())
}

fn read_name(src: &[u8], offset: &mut usize) -> Result<String> {
    let len = src.gread_with::<u8>(offset, BE)? as usize;
    let end = offset
        .checked_add(len)
        .filter(|&end| end <= src.len())
        .ok_or_else(|| Error::protocol("string runs past end of body"))?;
    let s = std::str::from_utf8(&src[*offset..end])
        .map_err(|_| Error::protocol("string is not valid UTF-8"))?
        .to_string();
    *offset = end;
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MAX_PACKET_SIZE;

    fn response_bytes(command: u16, seq: u32, status: u8, body: &[u8]) -> Vec<u8> {
        let mut raw = vec![0u8; RESP_HEADER_LEN + body.len()];
        raw[0..2].copy_from_slice(&FRAME_MAGIC);
        raw.pwrite_with(command, 2, BE).unwrap();
        raw.pwrite_with(seq, 4, BE).unwrap();
        raw[8] = status;
        raw.pwrite_with(body.len() as u32, 9, BE).unwrap();
        raw[RESP_HEADER_LEN..].copy_from_slice(body);
        raw
    }

    #[test]
    fn command_frame_layout() {
        let frame = Command::DeleteFile {
            name: "REC001.wav".into(),
        }
        .encode(0x42)
        .unwrap();
        assert_eq!(&frame[0..2], &FRAME_MAGIC);
        assert_eq!(
            frame.pread_with::<u16>(2, BE).unwrap(),
            commands::DELETE_FILE
        );
        assert_eq!(frame.pread_with::<u32>(4, BE).unwrap(), 0x42);
        let body_len = frame.pread_with::<u32>(8, BE).unwrap() as usize;
        assert_eq!(body_len, frame.len() - CMD_HEADER_LEN);
        assert_eq!(frame[CMD_HEADER_LEN] as usize, "REC001.wav".len());
    }

    #[test]
    fn factory_reset_and_format_carry_magic() {
        let reset = Command::FactoryReset.encode(1).unwrap();
        assert_eq!(&reset[CMD_HEADER_LEN..], &FACTORY_RESET_MAGIC);
        let format = Command::FormatStorage.encode(2).unwrap();
        assert_eq!(&format[CMD_HEADER_LEN..], &FORMAT_MAGIC);
    }

    #[test]
    fn settings_round_trip_at_fixed_offsets() {
        let settings = DeviceSettings {
            auto_record: true,
            auto_play: false,
            bluetooth_tone: true,
            notification_sound: true,
            quality: RecordingQuality::High,
        };
        let body = settings.encode();
        assert_eq!(body, [1, 0, 1, 1, 2, 0, 0, 0]);
        assert_eq!(DeviceSettings::parse(&body).unwrap(), settings);
    }

    #[test]
    fn settings_reject_out_of_range_fields() {
        let body = [2u8, 0, 0, 0, 1, 0, 0, 0];
        assert!(matches!(
            DeviceSettings::parse(&body),
            Err(Error::Protocol(_))
        ));
        let body = [0u8, 0, 0, 0, 7, 0, 0, 0];
        assert!(matches!(
            DeviceSettings::parse(&body),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            DeviceSettings::parse(&[0u8; 4]),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn schedule_entries_are_packed_and_padded() {
        let cmd = Command::PushSchedule(vec![
            ScheduleEntry {
                start_unix: 100,
                end_unix: 200,
                title: "standup".into(),
            },
            ScheduleEntry {
                start_unix: 300,
                end_unix: 400,
                title: "review".into(),
            },
        ]);
        let frame = cmd.encode(9).unwrap();
        let body = &frame[CMD_HEADER_LEN..];
        assert_eq!(body.len(), 2 + 2 * (16 + SCHEDULE_TITLE_LEN));
        assert_eq!(body.pread_with::<u16>(0, BE).unwrap(), 2);
        assert_eq!(body.pread_with::<u64>(2, BE).unwrap(), 100);
        assert_eq!(&body[18..25], b"standup");
        // padding after the title is NUL
        assert!(
            body[25..2 + 16 + SCHEDULE_TITLE_LEN]
                .iter()
                .all(|&b| b == 0)
        );
    }

    #[test]
    fn schedule_title_too_long_is_rejected() {
        let cmd = Command::PushSchedule(vec![ScheduleEntry {
            start_unix: 0,
            end_unix: 0,
            title: "x".repeat(SCHEDULE_TITLE_LEN + 1),
        }]);
        assert!(matches!(cmd.encode(1), Err(Error::Protocol(_))));
    }

    #[test]
    fn decoder_reassembles_split_frames() {
        let body = vec![0xabu8; MAX_PACKET_SIZE + 100];
        let raw = response_bytes(commands::GET_FILE_BLOCK, 7, 0, &body);

        let mut decoder = FrameDecoder::new();
        let mut chunks = raw.chunks(MAX_PACKET_SIZE);
        let last = chunks.next_back().unwrap();
        for chunk in chunks {
            decoder.feed(chunk);
            assert!(decoder.next_frame().unwrap().is_none());
        }
        decoder.feed(last);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.command, commands::GET_FILE_BLOCK);
        assert_eq!(frame.seq, 7);
        assert_eq!(frame.body, body);
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn decoder_yields_back_to_back_frames() {
        let mut raw = response_bytes(commands::GET_FILE_COUNT, 1, 0, &[0, 0, 0, 3]);
        raw.extend(response_bytes(commands::GET_FILE_COUNT, 2, 0, &[0, 0, 0, 4]));
        let mut decoder = FrameDecoder::new();
        decoder.feed(&raw);
        assert_eq!(decoder.next_frame().unwrap().unwrap().seq, 1);
        assert_eq!(decoder.next_frame().unwrap().unwrap().seq, 2);
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn decoder_rejects_bad_magic() {
        let mut raw = response_bytes(commands::GET_FILE_COUNT, 1, 0, &[]);
        raw[0] = 0xff;
        let mut decoder = FrameDecoder::new();
        decoder.feed(&raw);
        assert!(matches!(decoder.next_frame(), Err(Error::Protocol(_))));
    }

    #[test]
    fn decoder_rejects_absurd_body_length() {
        let mut raw = response_bytes(commands::GET_FILE_COUNT, 1, 0, &[]);
        raw.pwrite_with((MAX_BODY_LEN + 1) as u32, 9, BE).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.feed(&raw);
        assert!(matches!(decoder.next_frame(), Err(Error::Protocol(_))));
    }

    #[test]
    fn device_info_parses() {
        let mut body = vec![0x00, 0x11, 1, 4, 2];
        body.push(8);
        body.extend_from_slice(b"VP123456");
        let info = DeviceInfo::parse(&body).unwrap();
        assert_eq!(info.model_code, 0x0011);
        assert_eq!(info.firmware_version(), "1.4.2");
        assert_eq!(info.serial, "VP123456");
    }

    #[test]
    fn file_list_parses_and_rejects_trailing_bytes() {
        let mut body = vec![0, 0, 0, 1];
        body.push(7);
        body.extend_from_slice(b"a01.wav");
        body.extend_from_slice(&25_000u32.to_be_bytes());
        body.extend_from_slice(&1_700_000_000u64.to_be_bytes());
        body.extend_from_slice(&90u32.to_be_bytes());
        let entries = decode_file_list(&body).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a01.wav");
        assert_eq!(entries[0].size, 25_000);

        body.push(0);
        assert!(matches!(decode_file_list(&body), Err(Error::Protocol(_))));
    }

    #[test]
    fn bt_payloads_parse() {
        let mut body = vec![1u8];
        body.extend_from_slice(&[0x10, 0x20, 0x30, 0x40, 0x50, 0x60]);
        body.push(4);
        body.extend_from_slice(b"buds");
        let found = decode_bt_scan(&body).unwrap();
        assert_eq!(found[0].addr_string(), "10:20:30:40:50:60");
        assert_eq!(found[0].name, "buds");

        assert_eq!(BtLinkStatus::parse(&[0]).unwrap(), BtLinkStatus::Idle);
        let status = BtLinkStatus::parse(&body).unwrap();
        assert!(matches!(status, BtLinkStatus::Connected(d) if d.name == "buds"));
    }

    #[test]
    fn timeout_classes() {
        assert_eq!(Command::GetDeviceInfo.timeout(), SHORT_TIMEOUT);
        assert_eq!(Command::BtScan.timeout(), LONG_TIMEOUT);
        assert_eq!(Command::FormatStorage.timeout(), LONG_TIMEOUT);
    }
}
