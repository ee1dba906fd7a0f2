//! Engine configuration for cartridge runtimes.

use wasmtime::{Config, OptLevel};

/// Configuration for a cartridge [`Runtime`](crate::Runtime).
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Name used in logs for the loaded cartridge (default: "cart")
    pub debug_name: String,
    /// Maximum native stack a guest call may use, in bytes (default: 512KB)
    pub max_wasm_stack: usize,
    /// Cranelift optimization level (default: Speed)
    pub opt_level: OptLevel,
    /// Compile functions on multiple threads (default: true)
    pub parallel_compilation: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            debug_name: "cart".to_string(),
            max_wasm_stack: 512 * 1024, // 512KB
            opt_level: OptLevel::Speed,
            parallel_compilation: true,
        }
    }
}

impl BridgeConfig {
    /// Translate into a wasmtime engine configuration.
    pub(crate) fn engine_config(&self) -> Config {
        let mut config = Config::new();
        config.cranelift_opt_level(self.opt_level);
        config.parallel_compilation(self.parallel_compilation);
        config.max_wasm_stack(self.max_wasm_stack);
        config
    }
}
