//! Shared test fixtures: firmware archives, a simulated bootloader and
//! temporary directories.

pub mod fake_ble;
pub mod fixtures;
pub mod temp;
