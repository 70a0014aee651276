//! Stream-to-frame reassembly.
//!
//! Bytes arrive in arbitrary chunks; frames are handed out once the codec can size them.
//! A handed-out frame stays in the buffer until the next call, so a caller that finds
//! it corrupt can `reject` it and have the search resume one byte past its sync word.
//! A frame that fails sizing costs one exception and one byte the same way.

use crate::codec::{CodecError, FrameLength, ProtocolCodec};
use bytes::{Buf, Bytes, BytesMut};

pub const DEFAULT_BUFFER_SIZE: usize = 65_536;

#[derive(Debug)]
pub struct FrameAssembler {
    buffer: BytesMut,
    /// Length of the frame last handed out, consumed on the next call.
    pending: usize,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        FrameAssembler::new(DEFAULT_BUFFER_SIZE)
    }
}

impl FrameAssembler {
    pub fn new(capacity: usize) -> Self {
        FrameAssembler {
            buffer: BytesMut::with_capacity(capacity),
            pending: 0,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes held while waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.pending = 0;
    }

    /// Gives up on the frame last returned by `next_frame`.
    ///
    /// Only its first byte is dropped, so frames hidden behind a corrupt FRAMESIZE
    /// are found again.
    pub fn reject(&mut self) {
        self.pending = self.pending.min(1);
    }

    /// Returns the next complete frame in the buffer.
    ///
    /// Returns `None` when more bytes are needed, and `Some(Err(_))` once per bad
    /// frame start.
    pub fn next_frame(&mut self, codec: &dyn ProtocolCodec) -> Option<Result<Bytes, CodecError>> {
        let consumed = std::mem::take(&mut self.pending).min(self.buffer.len());
        self.buffer.advance(consumed);

        match codec.find_sync(&self.buffer) {
            Some(start) => self.buffer.advance(start),
            None => {
                self.buffer.clear();
                return None;
            }
        }

        match codec.frame_length(&self.buffer) {
            Ok(FrameLength::Incomplete) => None,
            Ok(FrameLength::Complete(len)) => {
                let len = len.min(self.buffer.len());
                self.pending = len;
                Some(Ok(Bytes::copy_from_slice(&self.buffer[..len])))
            }
            Err(e) => {
                self.buffer.advance(1);
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DeviceCommand;
    use crate::ieee_c37_118::codec::IeeeC37118Codec;
    use crate::ieee_c37_118::common::Version;

    #[test]
    fn test_frames_split_across_reads() {
        let codec = IeeeC37118Codec::new(Version::V2011);
        let frame = codec
            .encode_command_frame(7, &DeviceCommand::EnableRealTimeData, 0)
            .unwrap();

        let mut assembler = FrameAssembler::default();
        assembler.extend(&[0x00, 0x13]);
        assembler.extend(&frame[..5]);
        assert!(assembler.next_frame(&codec).is_none());
        assert_eq!(assembler.buffered(), 5);

        assembler.extend(&frame[5..]);
        assembler.extend(&frame);
        assert_eq!(assembler.next_frame(&codec).unwrap().unwrap(), frame[..]);
        assert_eq!(assembler.next_frame(&codec).unwrap().unwrap(), frame[..]);
        assert!(assembler.next_frame(&codec).is_none());
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn test_corrupt_frame_raises_once_then_resyncs() {
        let codec = IeeeC37118Codec::new(Version::V2011);
        let frame = codec
            .encode_command_frame(7, &DeviceCommand::SendHeaderFrame, 0)
            .unwrap();

        let mut assembler = FrameAssembler::default();
        // A valid SYNC word with an impossible FRAMESIZE.
        assembler.extend(&[0xAA, 0x41, 0x00, 0x02]);
        assembler.extend(&frame);
        assert!(assembler.next_frame(&codec).unwrap().is_err());
        assert_eq!(assembler.next_frame(&codec).unwrap().unwrap(), frame[..]);
    }

    #[test]
    fn test_rejected_frame_gives_back_the_frames_it_swallowed() {
        let codec = IeeeC37118Codec::new(Version::V2011);
        let first = codec
            .encode_command_frame(7, &DeviceCommand::SendHeaderFrame, 0)
            .unwrap();
        let second = codec
            .encode_command_frame(7, &DeviceCommand::EnableRealTimeData, 0)
            .unwrap();

        // FRAMESIZE claims both frames.
        let mut oversized = first.clone();
        let claimed = (first.len() + second.len()) as u16;
        oversized[2..4].copy_from_slice(&claimed.to_be_bytes());

        let mut assembler = FrameAssembler::default();
        assembler.extend(&oversized);
        assembler.extend(&second);
        let swallowed = assembler.next_frame(&codec).unwrap().unwrap();
        assert_eq!(swallowed.len(), first.len() + second.len());

        assembler.reject();
        assert_eq!(assembler.next_frame(&codec).unwrap().unwrap(), second[..]);
        assert!(assembler.next_frame(&codec).is_none());
        assert_eq!(assembler.buffered(), 0);
    }
}
