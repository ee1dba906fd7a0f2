//! Cartbridge Core - WASM-4 cartridge host bridge
//!
//! Loads a fantasy-console cartridge (a WebAssembly module) into an embedded
//! engine, gives it one fixed 64 KiB page of linear memory, and routes its
//! `env` imports to a native [`Platform`].
//!
//! ```text
//!   cartridge.wasm ──▶ Runtime ──▶ wasmtime Store ──▶ linear memory (64 KiB)
//!                         │              │
//!                         │              └──▶ env.* shims ──▶ GuestMemory ──▶ Platform
//!                         └──▶ start / update
//! ```
//!
//! - **Fixed memory**: capacity never changes; guest `memory.grow` gets -1
//! - **Checked pointers**: every guest offset is bounds-checked before use
//! - **Recoverable failures**: traps and refusals return [`BridgeError`]

#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::unnecessary_to_owned)]

pub mod accessor;
pub mod config;
pub mod error;
pub mod imports;
pub mod memory;
pub mod platform;
pub mod runtime;

pub use accessor::GuestMemory;
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use imports::IMPORTS;
pub use memory::{MemoryStore, MEMORY_CAPACITY};
pub use platform::{Headless, Platform, DISK_CAPACITY};
pub use runtime::{Phase, Runtime};
