use bitflags::bitflags;

bitflags! {
    /// Per-frame flags carried in the header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameFlags: u32 {
        /// The header checksum covers a non-empty payload.
        const CHECKSUM = 0x1;
        /// This Data frame is the sender's last message on the stream.
        const END_STREAM = 0x2;
    }
}
