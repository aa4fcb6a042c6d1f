//! ESP32 family bootloader support.

pub mod loader;
pub mod reset;
pub mod stub;

pub use loader::EspLoader;
pub use reset::{ResetStrategy, hard_reset};
pub use stub::FlashStub;
