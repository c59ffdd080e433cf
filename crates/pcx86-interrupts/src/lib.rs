#![forbid(unsafe_code)]

pub mod error;
pub mod line;
pub mod pic8259;

pub use error::PicError;
pub use line::IrqLine;
pub use pic8259::{DualPic8259, Pic8259, PicId, ResetKind};
