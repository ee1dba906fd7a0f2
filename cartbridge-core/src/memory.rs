//! Memory Backing Store - the cartridge's fixed linear memory.
//!
//! The guest imports exactly one memory, `env.memory`, declared with
//! `initial = maximum = 1` page. The store allocates it zero-filled at full
//! capacity, so no growth request can ever move or extend it.
//!
//! ```text
//! ┌──────────────────────── 64 KiB ────────────────────────┐
//! │ guest statics, stack, framebuffer, ... (cartridge ABI) │
//! └────────────────────────────────────────────────────────┘
//!   ▲ owned by Store<HostState>     ▲ borrowed by accessor/host calls
//! ```
//!
//! The bytes live inside the `wasmtime::Store`; `MemoryStore` is the handle
//! the bridge keeps to them. Releasing drops the handle, and the runtime
//! drops the store right after, which frees the buffer.

use tracing::{debug, warn};
use wasmtime::{
    AsContext, AsContextMut, Memory, MemoryType, ResourceLimiter, StoreContext, StoreContextMut,
};

use crate::error::{BridgeError, Result};

/// Size of one wasm page.
pub const WASM_PAGE_SIZE: usize = 64 * 1024;

/// Hard ceiling for cartridge memory (one page).
pub const MEMORY_CAPACITY: usize = WASM_PAGE_SIZE;

/// Table growth limit for the store limiter.
const MAX_TABLE_ELEMENTS: usize = 10_000;

// ============================================================================
// Backing Store
// ============================================================================

/// Handle to the cartridge's linear memory.
#[derive(Debug, Clone, Copy)]
pub struct MemoryStore {
    memory: Option<Memory>,
    capacity: usize,
}

impl MemoryStore {
    /// A store with nothing allocated yet.
    pub fn unallocated(capacity: usize) -> Self {
        Self {
            memory: None,
            capacity,
        }
    }

    /// Allocate a zero-filled memory of exactly `capacity` bytes.
    pub fn allocate(mut store: impl AsContextMut, capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity % WASM_PAGE_SIZE != 0 || capacity > MEMORY_CAPACITY {
            return Err(BridgeError::AllocationFailed(format!(
                "capacity {} is not between one page and {} bytes",
                capacity, MEMORY_CAPACITY
            )));
        }

        let pages = (capacity / WASM_PAGE_SIZE) as u32;
        let memory = Memory::new(&mut store, MemoryType::new(pages, Some(pages)))
            .map_err(|e| BridgeError::AllocationFailed(e.to_string()))?;

        debug!(capacity = capacity, pages = pages, "Allocated cartridge memory");

        Ok(Self {
            memory: Some(memory),
            capacity,
        })
    }

    /// Maximum size in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn is_allocated(&self) -> bool {
        self.memory.is_some()
    }

    /// The engine handle, for binding as the guest's import.
    pub fn handle(&self) -> Result<Memory> {
        self.memory
            .ok_or_else(|| BridgeError::AllocationFailed("memory has been released".into()))
    }

    /// Ensure the memory is at least `new_size` bytes.
    ///
    /// Succeeds iff `new_size <= capacity`. Contents are never touched.
    pub fn grow_to(&self, mut store: impl AsContextMut, new_size: usize) -> Result<()> {
        if new_size > self.capacity {
            warn!(
                requested = new_size,
                capacity = self.capacity,
                "Memory growth refused"
            );
            return Err(BridgeError::CapacityExceeded {
                requested: new_size,
                capacity: self.capacity,
            });
        }

        let memory = self.handle()?;
        let current = memory.data_size(&store);
        if new_size <= current {
            return Ok(());
        }

        let delta = (new_size - current).div_ceil(WASM_PAGE_SIZE) as u64;
        memory
            .grow(&mut store, delta)
            .map(|_| ())
            .map_err(|_| BridgeError::CapacityExceeded {
                requested: new_size,
                capacity: self.capacity,
            })
    }

    /// Drop the handle. Idempotent.
    pub fn release(&mut self) {
        if self.memory.take().is_some() {
            debug!(capacity = self.capacity, "Released cartridge memory");
        }
    }

    /// Current size in bytes, zero once released.
    pub fn size(&self, store: impl AsContext) -> usize {
        self.memory.map_or(0, |m| m.data_size(&store))
    }

    pub fn data<'a, T: 'a>(&self, store: impl Into<StoreContext<'a, T>>) -> Result<&'a [u8]> {
        Ok(self.handle()?.data(store))
    }

    pub fn data_mut<'a, T: 'a>(
        &self,
        store: impl Into<StoreContextMut<'a, T>>,
    ) -> Result<&'a mut [u8]> {
        Ok(self.handle()?.data_mut(store))
    }
}

// ============================================================================
// Store Limiter
// ============================================================================

/// Refuses guest `memory.grow` past the ceiling.
#[derive(Debug, Clone, Copy)]
pub struct MemoryLimiter {
    ceiling: usize,
}

impl MemoryLimiter {
    pub fn new(ceiling: usize) -> Self {
        Self { ceiling }
    }
}

impl Default for MemoryLimiter {
    fn default() -> Self {
        Self::new(MEMORY_CAPACITY)
    }
}

impl ResourceLimiter for MemoryLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        if desired > self.ceiling {
            warn!(
                current_bytes = current,
                desired_bytes = desired,
                limit_bytes = self.ceiling,
                "Guest memory grow rejected: exceeds ceiling"
            );
            Ok(false)
        } else {
            Ok(true)
        }
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        Ok(desired <= MAX_TABLE_ELEMENTS)
    }
}

// ============================================================================
// Tests
// ============================================================================
