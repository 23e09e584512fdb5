//! PIC24 In-Circuit Serial Programming.

pub mod constants;
pub mod device;
pub mod error;
pub mod flashing;
pub mod format;
pub mod icsp;
pub mod instruction;
pub mod nvm;
pub mod protocol;
pub mod transport;

pub use self::device::{Chip, ChipDB, Family, IcspFamily};
pub use self::error::IcspError;
pub use self::flashing::Flashing;
pub use self::icsp::{DeviceId, Icsp};
pub use self::instruction::{Instruction, Op, Sequence};
pub use self::transport::Transport;
