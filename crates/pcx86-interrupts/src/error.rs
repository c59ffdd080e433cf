use thiserror::Error;

/// Errors surfaced by the PIC model.
///
/// Command/data port errors are guest protocol violations: the chip state is
/// left unchanged and the caller is expected to log and carry on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PicError {
    #[error("unsupported OCW2 command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("OCW3 poll command {0:#04x} is not supported")]
    PollModeUnsupported(u8),

    #[error("non-specific EOI with no line in service")]
    EoiWithNothingInService,

    #[error("IRQ line {0} is out of range (0..=15)")]
    LineOutOfRange(u8),

    #[error("port {0:#06x} is not a PIC port")]
    NotAPicPort(u16),
}
