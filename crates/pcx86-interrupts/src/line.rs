use std::fmt;
use std::sync::Arc;

use crate::error::PicError;
use crate::pic8259::DualPic8259;

/// A device's handle on one global IRQ line.
///
/// Owns an `Arc` of the controller pair, so it can be moved into a device
/// thread and outlive the code that created it.
#[derive(Clone)]
pub struct IrqLine {
    pics: Arc<DualPic8259>,
    line: u8,
}

impl IrqLine {
    pub fn new(pics: Arc<DualPic8259>, line: u8) -> Result<Self, PicError> {
        if line > 15 {
            return Err(PicError::LineOutOfRange(line));
        }
        Ok(Self { pics, line })
    }

    pub fn line(&self) -> u8 {
        self.line
    }

    pub fn raise(&self) {
        self.pics.raise_irq(self.line);
    }

    pub fn lower(&self) {
        self.pics.lower_irq(self.line);
    }

    pub fn set_level(&self, level: bool) {
        if level {
            self.raise();
        } else {
            self.lower();
        }
    }
}

impl fmt::Debug for IrqLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrqLine").field("line", &self.line).finish()
    }
}
