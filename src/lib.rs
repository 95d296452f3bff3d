//! VoxPen recorder protocol implementation.
//!
//! An async command/response client for the USB voice-recorder line:
//! exclusive single-flight command execution, sequence-correlated
//! responses, chunked file download, and connection-loss supervision.

pub mod constants;
pub mod device;
pub mod download;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;

pub use self::device::Model;
pub use self::error::{Error, Result};
pub use self::protocol::{
    BtDevice, BtLinkStatus, Command, DeviceInfo, DeviceSettings, FileEntry, RecordingQuality,
    ScheduleEntry, StorageInfo,
};
pub use self::session::{ConnectionState, DeviceSession, SessionEvent};
pub use self::transport::Transport;

pub use self::constants::MAX_PACKET_SIZE;
