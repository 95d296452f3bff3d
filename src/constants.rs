//! Protocol constants: frame layout, command ids, timeouts.

use std::time::Duration;

/// Largest single bulk transfer the device will produce. A logical
/// response frame may span several of these.
pub const MAX_PACKET_SIZE: usize = 512;

/// Leading bytes of every frame in both directions.
pub const FRAME_MAGIC: [u8; 2] = [0x12, 0x34];

/// Command frame header: magic(2) + command(2) + seq(4) + body_len(4).
pub const CMD_HEADER_LEN: usize = 12;
/// Response frame header: magic(2) + command(2) + seq(4) + status(1) + body_len(4).
pub const RESP_HEADER_LEN: usize = 13;

/// Upper bound on a declared response body. Anything above this is a
/// corrupt length field, not a real payload.
pub const MAX_BODY_LEN: usize = 512 * 1024;

/// Sequence ids live in [0, SEQ_MODULUS) and wrap.
pub const SEQ_MODULUS: u32 = 0x1_0000;

/// File downloads run in fixed 4 KiB blocks; a short block ends the file.
pub const FILE_BLOCK_SIZE: usize = 4096;

/// Settings command body is a fixed 8-byte field block.
pub const SETTINGS_BODY_LEN: usize = 8;

/// Schedule entry titles are NUL-padded to this length on the wire.
pub const SCHEDULE_TITLE_LEN: usize = 48;

/// Body required by FORMAT_STORAGE.
pub const FORMAT_MAGIC: [u8; 2] = [0xf0, 0x0d];
/// Body required by FACTORY_RESET.
pub const FACTORY_RESET_MAGIC: [u8; 4] = [0x5a, 0xa5, 0x13, 0x57];

/// Default timeout for simple query/set commands.
pub const SHORT_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for commands the device services slowly (format, BT scan, ...).
pub const LONG_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval of the fallback liveness check. Deliberately coarse;
/// disconnect detection normally comes from transport events.
pub const LIVENESS_POLL_INTERVAL: Duration = Duration::from_secs(3);

pub mod commands {
    pub const GET_DEVICE_INFO: u16 = 0x0001;
    pub const GET_DEVICE_TIME: u16 = 0x0002;
    pub const SET_DEVICE_TIME: u16 = 0x0003;
    pub const GET_FILE_COUNT: u16 = 0x0004;
    pub const GET_FILE_LIST: u16 = 0x0005;
    pub const GET_FILE_BLOCK: u16 = 0x0006;
    pub const DELETE_FILE: u16 = 0x0007;
    pub const GET_STORAGE_INFO: u16 = 0x0008;
    pub const FORMAT_STORAGE: u16 = 0x0009;
    pub const GET_SETTINGS: u16 = 0x000a;
    pub const SET_SETTINGS: u16 = 0x000b;
    pub const PUSH_SCHEDULE: u16 = 0x000c;
    pub const FACTORY_RESET: u16 = 0x000d;
    pub const REQUEST_FIRMWARE_UPGRADE: u16 = 0x000e;
    pub const BT_SCAN: u16 = 0x0020;
    pub const BT_CONNECT: u16 = 0x0021;
    pub const BT_STATUS: u16 = 0x0022;
}

pub mod status {
    /// Device accepted the command.
    pub const OK: u8 = 0x00;
}
