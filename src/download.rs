//! Chunked file download state.
//!
//! A recording is reconstructed from fixed-size blocks requested
//! strictly sequentially. The session enforces the accumulation
//! invariants; the block loop itself lives in
//! [`DeviceSession::download_file`](crate::DeviceSession::download_file).

use crate::constants::FILE_BLOCK_SIZE;
use crate::error::{Error, Result};

pub struct TransferSession {
    name: String,
    expected_size: u32,
    buf: Vec<u8>,
    next_block: u32,
}

impl TransferSession {
    pub fn new(name: &str, expected_size: u32) -> Self {
        TransferSession {
            name: name.to_string(),
            expected_size,
            buf: Vec::with_capacity(expected_size as usize),
            next_block: 0,
        }
    }

    pub fn next_block(&self) -> u32 {
        self.next_block
    }

    pub fn received(&self) -> u32 {
        self.buf.len() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.received() == self.expected_size
    }

    /// Append one block. A block must be exactly [`FILE_BLOCK_SIZE`]
    /// bytes except for the final one; anything else means the device
    /// and host disagree about the file and the transfer is unsalvageable.
    pub fn push_block(&mut self, block: &[u8]) -> Result<()> {
        if block.len() > FILE_BLOCK_SIZE {
            return Err(Error::protocol(format!(
                "block {} of {} is {} bytes, device block size is {}",
                self.next_block,
                self.name,
                block.len(),
                FILE_BLOCK_SIZE
            )));
        }
        let after = self.received() as u64 + block.len() as u64;
        if after > self.expected_size as u64 {
            return Err(Error::protocol(format!(
                "{} grew past its reported size ({after} > {})",
                self.name, self.expected_size
            )));
        }
        if block.len() < FILE_BLOCK_SIZE && after != self.expected_size as u64 {
            return Err(Error::protocol(format!(
                "short block {} before end of {} ({after} of {} bytes)",
                self.next_block, self.name, self.expected_size
            )));
        }
        self.buf.extend_from_slice(block);
        self.next_block += 1;
        Ok(())
    }

    /// Final size check. Redundant with the per-block invariants, but a
    /// truncated buffer must never be handed out as a complete file.
    pub fn finish(self) -> Result<Vec<u8>> {
        if self.received() != self.expected_size {
            return Err(Error::protocol(format!(
                "{} incomplete: {} of {} bytes",
                self.name,
                self.received(),
                self.expected_size
            )));
        }
        log::info!("downloaded {} ({} bytes)", self.name, self.expected_size);
        Ok(self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_full_and_final_short_blocks() {
        let mut session = TransferSession::new("a.wav", 25_000);
        for i in 0..6 {
            assert_eq!(session.next_block(), i);
            session.push_block(&[0xaa; FILE_BLOCK_SIZE]).unwrap();
        }
        assert!(!session.is_complete());
        session.push_block(&[0xbb; 424]).unwrap();
        assert!(session.is_complete());
        let data = session.finish().unwrap();
        assert_eq!(data.len(), 25_000);
        assert_eq!(data[24_999], 0xbb);
    }

    #[test]
    fn zero_byte_file_needs_no_blocks() {
        let session = TransferSession::new("empty.wav", 0);
        assert!(session.is_complete());
        assert_eq!(session.finish().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn oversized_block_is_a_protocol_error() {
        let mut session = TransferSession::new("a.wav", 10_000);
        assert!(matches!(
            session.push_block(&[0; FILE_BLOCK_SIZE + 1]),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn overrun_is_a_protocol_error() {
        let mut session = TransferSession::new("a.wav", 5_000);
        session.push_block(&[0; FILE_BLOCK_SIZE]).unwrap();
        assert!(matches!(
            session.push_block(&[0; FILE_BLOCK_SIZE]),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn short_block_mid_file_is_a_protocol_error() {
        let mut session = TransferSession::new("a.wav", 10_000);
        assert!(matches!(
            session.push_block(&[0; 100]),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn incomplete_finish_is_rejected() {
        let mut session = TransferSession::new("a.wav", FILE_BLOCK_SIZE as u32 * 2);
        session.push_block(&[0; FILE_BLOCK_SIZE]).unwrap();
        assert!(matches!(session.finish(), Err(Error::Protocol(_))));
    }
}
