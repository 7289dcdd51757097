#![cfg_attr(not(any(test, feature = "std")), no_std)]

//! Configuration for isonet
//!
//! Hardware wiring, addressing mode and the persisted JSON address settings.

extern crate alloc;

pub mod error;
pub mod json;
pub mod storage;
pub mod types;

pub use error::ConfigError;
pub use json::{to_json, ConfigUpdate};
#[cfg(feature = "std")]
pub use storage::file::FileStorage;
pub use storage::memory::MemoryStorage;
pub use storage::{load_update, ConfigStorage};
pub use types::{
    parse_dotted_quad, AddressSettings, Addressing, BitOrder, DottedQuad, EthernetConfig,
    HardwareConfig, Ipv4, SpiMode, SpiSettings,
};
