use crate::interp::string::RepPrefix;
use crate::state::Segment;

/// Legacy prefixes seen before the opcode byte.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrefixState {
    pub rep: RepPrefix,
    pub operand_size_override: bool,
    pub address_size_override: bool,
    pub segment_override: Option<Segment>,
}

impl PrefixState {
    /// Fold `byte` into the prefix state. Returns `false` if it is not a prefix.
    pub fn absorb(&mut self, byte: u8) -> bool {
        match byte {
            0xF2 => self.rep = RepPrefix::F2,
            0xF3 => self.rep = RepPrefix::F3,
            0x66 => self.operand_size_override = true,
            0x67 => self.address_size_override = true,
            0x26 => self.segment_override = Some(Segment::Es),
            0x2E => self.segment_override = Some(Segment::Cs),
            0x36 => self.segment_override = Some(Segment::Ss),
            0x3E => self.segment_override = Some(Segment::Ds),
            0x64 => self.segment_override = Some(Segment::Fs),
            0x65 => self.segment_override = Some(Segment::Gs),
            // LOCK is accepted and ignored.
            0xF0 => {}
            _ => return false,
        }
        true
    }
}
