//! ADB (Android Debug Bridge) module for device interaction.

mod device;
mod input;
mod screenshot;

pub use device::{AdbDevice, AdbError};
