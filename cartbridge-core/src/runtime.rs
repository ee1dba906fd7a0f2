//! Module Lifecycle Manager - one cartridge, one store, one memory.
//!
//! # Lifecycle
//!
//! ```text
//!  Unloaded ──define──▶ Defined ──instantiate──▶ Instantiated ──call_*──▶ Running
//!     │                    ▲                          │                     │
//!     │                    └──────── define (reload: tears down first) ◀────┤
//!     └──────────────────────────── destroy ──────────▶ Destroyed ◀─────────┘
//! ```
//!
//! - **define**: decode and compile the cartridge bytes.
//! - **instantiate**: bind the `env` imports and the backing store, then run
//!   `_start` and `_initialize` if the cartridge exports them.
//! - **call_start / call_update**: optional `start` (once) and `update` (per
//!   frame). Absent exports are no-ops.
//! - **destroy**: drop instance, definition and memory, in that order. The
//!   [`Platform`] survives and is moved into a fresh, empty store.
//!
//! Every engine failure comes back as a [`BridgeError`]; nothing here exits
//! the process.

use tracing::{debug, error, info, trace, warn};
use wasmtime::{Engine, Instance, Linker, Module, Store, TypedFunc};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::imports::{self, HostState, MEMORY_IMPORT, NAMESPACE};
use crate::memory::{MemoryStore, MEMORY_CAPACITY};
use crate::platform::Platform;

/// Run-once bootstrap exports, in invocation order.
const INITIALIZERS: [&str; 2] = ["_start", "_initialize"];

const START: &str = "start";
const UPDATE: &str = "update";

type EntryPoint = TypedFunc<(), ()>;

/// Where a runtime is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unloaded,
    Defined,
    Instantiated,
    Running,
    Destroyed,
}

/// Function handles resolved at instantiation.
#[derive(Default)]
struct EntryPoints {
    start: Option<EntryPoint>,
    update: Option<EntryPoint>,
    started: bool,
}

fn new_store<P: Platform>(engine: &Engine, platform: P) -> Store<HostState<P>> {
    let mut store = Store::new(engine, HostState::new(platform));
    store.limiter(|state| &mut state.limiter);
    store
}

/// Resolve an optional `() -> ()` export.
fn entry_point<P: Platform>(
    instance: &Instance,
    store: &mut Store<HostState<P>>,
    name: &str,
) -> Result<Option<EntryPoint>> {
    match instance.get_func(&mut *store, name) {
        None => Ok(None),
        Some(func) => func.typed::<(), ()>(&*store).map(Some).map_err(|e| {
            BridgeError::Instantiation(format!("export `{}` must have type () -> (): {}", name, e))
        }),
    }
}

/// Recover a host-call refusal from a trap, or wrap the trap.
fn invocation_error(entry: &'static str, err: anyhow::Error) -> BridgeError {
    match err.downcast::<BridgeError>() {
        Ok(refusal) => {
            warn!(entry = entry, error = %refusal, "Host call refused, guest call aborted");
            refusal
        }
        Err(err) => {
            error!(entry = entry, error = %err, "Cartridge trapped");
            BridgeError::Invocation {
                entry,
                message: format!("{:#}", err),
            }
        }
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// Host for a single cartridge.
///
/// Owns the engine, the store (and through it the linear memory), the module
/// definition and the live instance. Several runtimes may coexist; each one
/// hosts at most one instance.
pub struct Runtime<P: Platform> {
    engine: Engine,
    linker: Linker<HostState<P>>,
    /// Only vacated for the duration of `destroy`.
    store: Option<Store<HostState<P>>>,
    config: BridgeConfig,
    definition: Option<Module>,
    instance: Option<Instance>,
    entry_points: EntryPoints,
    phase: Phase,
}

impl<P: Platform> Runtime<P> {
    /// Build the engine, register the host table and allocate the backing store.
    ///
    /// The returned runtime's [`memory`](Self::memory) is zero-filled and may
    /// be written by the embedder before a cartridge is loaded.
    pub fn new(config: BridgeConfig, platform: P) -> Result<Self> {
        let engine = Engine::new(&config.engine_config())
            .map_err(|e| BridgeError::Engine(e.to_string()))?;

        let mut linker = Linker::new(&engine);
        imports::register(&mut linker)?;

        let mut store = new_store(&engine, platform);
        let memory = MemoryStore::allocate(&mut store, MEMORY_CAPACITY)?;
        store.data_mut().memory = memory;

        info!(
            cart = %config.debug_name,
            capacity = MEMORY_CAPACITY,
            "Initialized cartridge runtime"
        );

        Ok(Self {
            engine,
            linker,
            store: Some(store),
            config,
            definition: None,
            instance: None,
            entry_points: EntryPoints::default(),
            phase: Phase::Unloaded,
        })
    }

    fn store(&self) -> &Store<HostState<P>> {
        self.store
            .as_ref()
            .expect("store is only vacated during teardown")
    }

    fn store_mut(&mut self) -> &mut Store<HostState<P>> {
        self.store
            .as_mut()
            .expect("store is only vacated during teardown")
    }

    fn ensure_memory(&mut self) -> Result<()> {
        let store = self.store_mut();
        if !store.data().memory.is_allocated() {
            let memory = MemoryStore::allocate(&mut *store, MEMORY_CAPACITY)?;
            store.data_mut().memory = memory;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Decode, instantiate and initialize a cartridge.
    ///
    /// Any previously loaded cartridge and its memory are released first.
    pub fn load_module(&mut self, bytes: &[u8]) -> Result<()> {
        self.define(bytes)?;
        self.instantiate()
    }

    /// Decode and compile a cartridge without instantiating it.
    pub fn define(&mut self, bytes: &[u8]) -> Result<()> {
        if self.definition.is_some() || self.instance.is_some() {
            self.destroy();
        }

        let module = Module::new(&self.engine, bytes).map_err(|e| {
            error!(
                cart = %self.config.debug_name,
                module_size = bytes.len(),
                error = %e,
                "Cartridge decode failed"
            );
            BridgeError::Decode(format!("{:#}", e))
        })?;

        self.ensure_memory()?;

        info!(
            cart = %self.config.debug_name,
            module_size = bytes.len(),
            imports = module.imports().len(),
            "Cartridge defined"
        );

        self.definition = Some(module);
        self.phase = Phase::Defined;
        Ok(())
    }

    /// Bind imports and memory, run initializers, resolve `start`/`update`.
    ///
    /// Any failure once linking has started, including an initializer trap,
    /// tears the cartridge down before returning.
    pub fn instantiate(&mut self) -> Result<()> {
        let module = self.definition.clone().ok_or(BridgeError::NotDefined)?;
        if self.instance.is_some() {
            return Err(BridgeError::Instantiation(
                "cartridge is already instantiated".into(),
            ));
        }

        if let Err(e) = imports::check_imports(&module) {
            error!(cart = %self.config.debug_name, error = %e, "Cartridge imports rejected");
            return Err(e);
        }

        let (instance, entry_points, initializers) = match self.bind(&module) {
            Ok(bound) => bound,
            Err(e) => {
                error!(
                    cart = %self.config.debug_name,
                    error = %e,
                    "Cartridge instantiation failed"
                );
                // Data segments may already be in memory.
                self.destroy();
                return Err(e);
            }
        };
        let (has_start, has_update) = (
            entry_points.start.is_some(),
            entry_points.update.is_some(),
        );

        self.instance = Some(instance);
        self.phase = Phase::Instantiated;

        for (name, init) in initializers {
            debug!(entry = name, "Running cartridge initializer");
            if let Err(e) = init.call(self.store_mut(), ()) {
                let err = invocation_error(name, e);
                self.destroy();
                return Err(err);
            }
        }

        info!(
            cart = %self.config.debug_name,
            has_start = has_start,
            has_update = has_update,
            "Cartridge instantiated"
        );

        self.entry_points = entry_points;
        Ok(())
    }

    /// Link memory and imports, create the instance, resolve its exports.
    fn bind(
        &mut self,
        module: &Module,
    ) -> Result<(Instance, EntryPoints, Vec<(&'static str, EntryPoint)>)> {
        let mut linker = self.linker.clone();
        let store = self.store_mut();
        let memory = store.data().memory.handle()?;

        let instance = linker
            .define(&*store, NAMESPACE, MEMORY_IMPORT, memory)
            .and_then(|linker| linker.instantiate(&mut *store, module))
            .map_err(|e| BridgeError::Instantiation(format!("{:#}", e)))?;

        let mut initializers = Vec::with_capacity(INITIALIZERS.len());
        for name in INITIALIZERS {
            if let Some(func) = entry_point(&instance, store, name)? {
                initializers.push((name, func));
            }
        }
        let entry_points = EntryPoints {
            start: entry_point(&instance, store, START)?,
            update: entry_point(&instance, store, UPDATE)?,
            started: false,
        };

        Ok((instance, entry_points, initializers))
    }

    /// Run the cartridge's `start` export, at most once per load.
    pub fn call_start(&mut self) -> Result<()> {
        if self.entry_points.started {
            debug!("start already ran, skipping");
            return Ok(());
        }
        let Some(start) = self.entry_points.start.clone() else {
            return Ok(());
        };
        self.entry_points.started = true;
        self.invoke(START, &start)
    }

    /// Run the cartridge's `update` export. Call once per frame.
    pub fn call_update(&mut self) -> Result<()> {
        let Some(update) = self.entry_points.update.clone() else {
            return Ok(());
        };
        self.invoke(UPDATE, &update)
    }

    fn invoke(&mut self, entry: &'static str, func: &EntryPoint) -> Result<()> {
        trace!(entry = entry, "Invoking cartridge entry point");
        self.phase = Phase::Running;
        func.call(self.store_mut(), ())
            .map_err(|e| invocation_error(entry, e))
    }

    /// Release instance, definition and memory. Safe in any state.
    pub fn destroy(&mut self) {
        let had_instance = self.instance.take().is_some();
        let had_definition = self.definition.take().is_some();
        self.entry_points = EntryPoints::default();

        if let Some(mut store) = self.store.take() {
            store.data_mut().memory.release();
            let state = store.into_data();
            self.store = Some(new_store(&self.engine, state.platform));
        }

        self.phase = Phase::Destroyed;
        info!(
            cart = %self.config.debug_name,
            had_instance = had_instance,
            had_definition = had_definition,
            "Cartridge torn down"
        );
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_instantiated(&self) -> bool {
        self.instance.is_some()
    }

    pub fn has_start(&self) -> bool {
        self.entry_points.start.is_some()
    }

    pub fn has_update(&self) -> bool {
        self.entry_points.update.is_some()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// The cartridge's linear memory.
    ///
    /// Fails with `AllocationFailed` between `destroy` and the next load.
    pub fn memory(&self) -> Result<&[u8]> {
        let store = self.store();
        store.data().memory.data(store)
    }

    pub fn memory_mut(&mut self) -> Result<&mut [u8]> {
        let store = self.store_mut();
        let memory = store.data().memory;
        memory.data_mut(store)
    }

    /// Ask the backing store to grow to `new_size` bytes.
    pub fn grow_memory(&mut self, new_size: usize) -> Result<()> {
        let store = self.store_mut();
        let memory = store.data().memory;
        memory.grow_to(store, new_size)
    }

    pub fn platform(&self) -> &P {
        &self.store().data().platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.store_mut().data_mut().platform
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every call the cartridge makes.
    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
        traces: Vec<String>,
        sprites: Vec<usize>,
        disk: Vec<u8>,
        disk_writes: usize,
    }

    impl Platform for Recorder {
        fn blit(&mut self, sprite: &[u8], x: i32, y: i32, width: u32, height: u32, flags: u32) {
            self.sprites.push(sprite.len());
            self.calls
                .push(format!("blit {} {} {} {} {}", x, y, width, height, flags));
        }

        fn blit_sub(
            &mut self,
            sprite: &[u8],
            x: i32,
            y: i32,
            width: u32,
            height: u32,
            src_x: u32,
            src_y: u32,
            stride: u32,
            flags: u32,
        ) {
            self.sprites.push(sprite.len());
            self.calls.push(format!(
                "blitSub {} {} {} {} {} {} {} {}",
                x, y, width, height, src_x, src_y, stride, flags
            ));
        }

        fn line(&mut self, x1: i32, y1: i32, x2: i32, y2: i32) {
            self.calls.push(format!("line {} {} {} {}", x1, y1, x2, y2));
        }

        fn hline(&mut self, x: i32, y: i32, len: u32) {
            self.calls.push(format!("hline {} {} {}", x, y, len));
        }

        fn vline(&mut self, x: i32, y: i32, len: u32) {
            self.calls.push(format!("vline {} {} {}", x, y, len));
        }

        fn oval(&mut self, x: i32, y: i32, width: u32, height: u32) {
            self.calls.push(format!("oval {} {} {} {}", x, y, width, height));
        }

        fn rect(&mut self, x: i32, y: i32, width: u32, height: u32) {
            self.calls.push(format!("rect {} {} {} {}", x, y, width, height));
        }

        fn text(&mut self, text: &[u8], x: i32, y: i32) {
            self.calls
                .push(format!("text {} {} {}", String::from_utf8_lossy(text), x, y));
        }

        fn text_utf8(&mut self, text: &str, x: i32, y: i32) {
            self.calls.push(format!("textUtf8 {} {} {}", text, x, y));
        }

        fn text_utf16(&mut self, text: &[u16], x: i32, y: i32) {
            self.calls.push(format!(
                "textUtf16 {} {} {}",
                String::from_utf16_lossy(text),
                x,
                y
            ));
        }

        fn tone(&mut self, frequency: u32, duration: u32, volume: u32, flags: u32) {
            self.calls
                .push(format!("tone {} {} {} {}", frequency, duration, volume, flags));
        }

        fn disk_read(&mut self, dest: &mut [u8]) -> u32 {
            let n = dest.len().min(self.disk.len());
            dest[..n].copy_from_slice(&self.disk[..n]);
            n as u32
        }

        fn disk_write(&mut self, src: &[u8]) -> u32 {
            self.disk_writes += 1;
            self.disk = src.to_vec();
            src.len() as u32
        }

        fn trace(&mut self, message: &str) {
            self.traces.push(message.to_string());
        }
    }

    fn runtime() -> Runtime<Recorder> {
        let config = BridgeConfig {
            parallel_compilation: false,
            ..Default::default()
        };
        Runtime::new(config, Recorder::default()).expect("runtime should build")
    }

    fn loaded(wat: &str) -> Runtime<Recorder> {
        let mut rt = runtime();
        rt.load_module(wat.as_bytes()).expect("cartridge should load");
        rt
    }

    const EMPTY_CART: &str = r#"(module (import "env" "memory" (memory 1 1)))"#;

    #[test]
    fn test_malformed_bytes_decode_error() {
        let mut rt = runtime();

        let err = rt.load_module(b"\0asm\x01\0\0\0\xff\xff").unwrap_err();
        assert!(matches!(err, BridgeError::Decode(_)));
        assert!(err.is_guest_fault());
        assert!(!rt.is_instantiated());
        assert_eq!(rt.phase(), Phase::Unloaded);

        let err = rt.load_module(b"not a cartridge").unwrap_err();
        assert!(matches!(err, BridgeError::Decode(_)));
    }

    #[test]
    fn test_entry_points_before_load_are_noops() {
        let mut rt = runtime();
        rt.call_start().expect("start before load");
        rt.call_update().expect("update before load");
        assert_eq!(rt.phase(), Phase::Unloaded);
        assert!(rt.platform().calls.is_empty());
    }

    #[test]
    fn test_instantiate_without_definition() {
        let mut rt = runtime();
        assert!(matches!(rt.instantiate(), Err(BridgeError::NotDefined)));
    }

    #[test]
    fn test_missing_update_is_noop() {
        let mut rt = loaded(EMPTY_CART);
        assert!(!rt.has_start());
        assert!(!rt.has_update());

        for _ in 0..3 {
            rt.call_update().expect("absent update is a no-op");
        }
        rt.call_start().expect("absent start is a no-op");
        assert_eq!(rt.phase(), Phase::Instantiated);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let mut rt = runtime();
        rt.destroy();
        rt.destroy();

        assert_eq!(rt.phase(), Phase::Destroyed);
        assert!(matches!(rt.memory(), Err(BridgeError::AllocationFailed(_))));

        rt.load_module(EMPTY_CART.as_bytes()).expect("load after destroy");
        assert_eq!(rt.memory().unwrap().len(), MEMORY_CAPACITY);
        rt.destroy();
        rt.destroy();
        assert!(!rt.is_instantiated());
    }

    #[test]
    fn test_initializers_run_before_entry_points() {
        let mut rt = loaded(
            r#"(module
                (import "env" "memory" (memory 1 1))
                (import "env" "trace" (func $trace (param i32)))
                (data (i32.const 16) "_start\00")
                (data (i32.const 32) "_initialize\00")
                (data (i32.const 48) "start\00")
                (data (i32.const 64) "update\00")
                (func (export "_start") (call $trace (i32.const 16)))
                (func (export "_initialize") (call $trace (i32.const 32)))
                (func (export "start") (call $trace (i32.const 48)))
                (func (export "update") (call $trace (i32.const 64))))"#,
        );
        assert_eq!(rt.platform().traces, ["_start", "_initialize"]);

        rt.call_start().unwrap();
        rt.call_start().unwrap();
        rt.call_update().unwrap();
        rt.call_update().unwrap();

        assert_eq!(
            rt.platform().traces,
            ["_start", "_initialize", "start", "update", "update"]
        );
        assert_eq!(rt.phase(), Phase::Running);
    }

    #[test]
    fn test_initializer_trap_tears_down() {
        let mut rt = runtime();
        let err = rt
            .load_module(
                br#"(module
                    (import "env" "memory" (memory 1 1))
                    (func (export "_initialize") unreachable)
                    (func (export "update")))"#,
            )
            .unwrap_err();

        assert!(matches!(err, BridgeError::Invocation { entry: "_initialize", .. }));
        assert!(!rt.is_instantiated());
        assert!(!rt.has_update());
        assert_eq!(rt.phase(), Phase::Destroyed);
    }

    #[test]
    fn test_blit_past_end_is_out_of_bounds() {
        let mut rt = loaded(
            r#"(module
                (import "env" "memory" (memory 1 1))
                (import "env" "blit" (func $blit (param i32 i32 i32 i32 i32 i32)))
                (func (export "start")
                    (call $blit (i32.const 65528) (i32.const 0) (i32.const 0)
                                (i32.const 8) (i32.const 8) (i32.const 0)))
                (func (export "update")
                    (call $blit (i32.const 65535) (i32.const 0) (i32.const 0)
                                (i32.const 8) (i32.const 8) (i32.const 0))))"#,
        );

        rt.call_start().expect("last 8 bytes are a valid sprite");
        assert_eq!(rt.platform().sprites, [8]);

        let err = rt.call_update().unwrap_err();
        assert!(matches!(
            err,
            BridgeError::OutOfBounds {
                offset: 65535,
                length: 8,
                capacity: MEMORY_CAPACITY,
            }
        ));
        assert_eq!(rt.platform().sprites, [8]);
    }

    #[test]
    fn test_blit_sub_resolves_window() {
        let mut rt = loaded(
            r#"(module
                (import "env" "memory" (memory 1 1))
                (import "env" "blitSub"
                    (func $blitSub (param i32 i32 i32 i32 i32 i32 i32 i32 i32)))
                (func (export "update")
                    (call $blitSub (i32.const 1024) (i32.const 10) (i32.const 20)
                                   (i32.const 4) (i32.const 4) (i32.const 8) (i32.const 8)
                                   (i32.const 16) (i32.const 1))))"#,
        );

        rt.call_update().unwrap();
        assert_eq!(rt.platform().sprites, [(11 * 16 + 12) * 2 / 8]);
        assert_eq!(rt.platform().calls, ["blitSub 10 20 4 4 8 8 16 1"]);
    }

    #[test]
    fn test_diskw_zero_size() {
        let mut rt = loaded(
            r#"(module
                (import "env" "memory" (memory 1 1))
                (import "env" "diskw" (func $diskw (param i32 i32) (result i32)))
                (func (export "update")
                    (i32.store (i32.const 200) (call $diskw (i32.const -5) (i32.const 0)))))"#,
        );
        rt.memory_mut().unwrap()[200..204].fill(0xff);

        rt.call_update().unwrap();

        assert_eq!(&rt.memory().unwrap()[200..204], &[0, 0, 0, 0]);
        assert_eq!(rt.platform().disk_writes, 0);
    }

    #[test]
    fn test_disk_roundtrip() {
        let mut rt = loaded(
            r#"(module
                (import "env" "memory" (memory 1 1))
                (import "env" "diskr" (func $diskr (param i32 i32) (result i32)))
                (import "env" "diskw" (func $diskw (param i32 i32) (result i32)))
                (data (i32.const 100) "save")
                (func (export "update")
                    (i32.store (i32.const 200) (call $diskw (i32.const 100) (i32.const 4)))
                    (i32.store (i32.const 204) (call $diskr (i32.const 300) (i32.const 16)))))"#,
        );

        rt.call_update().unwrap();

        let mem = rt.memory().unwrap();
        assert_eq!(&mem[200..204], &4i32.to_le_bytes());
        assert_eq!(&mem[204..208], &4i32.to_le_bytes());
        assert_eq!(&mem[300..304], b"save");
        assert_eq!(rt.platform().disk, b"save");
    }

    #[test]
    fn test_diskr_refuses_short_buffer() {
        let mut rt = loaded(
            r#"(module
                (import "env" "memory" (memory 1 1))
                (import "env" "diskr" (func $diskr (param i32 i32) (result i32)))
                (func (export "update")
                    (drop (call $diskr (i32.const 65530) (i32.const 16)))))"#,
        );
        rt.platform_mut().disk = vec![1; 16];

        let err = rt.call_update().unwrap_err();
        assert!(matches!(err, BridgeError::OutOfBounds { offset: 65530, length: 16, .. }));
        assert!(rt.memory().unwrap()[65530..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_text_and_trace_encodings() {
        let mut rt = loaded(
            r#"(module
                (import "env" "memory" (memory 1 1))
                (import "env" "text" (func $text (param i32 i32 i32)))
                (import "env" "textUtf8" (func $textUtf8 (param i32 i32 i32 i32)))
                (import "env" "textUtf16" (func $textUtf16 (param i32 i32 i32 i32)))
                (import "env" "trace" (func $trace (param i32)))
                (import "env" "traceUtf8" (func $traceUtf8 (param i32 i32)))
                (import "env" "traceUtf16" (func $traceUtf16 (param i32 i32)))
                (import "env" "tracef" (func $tracef (param i32 i32)))
                (data (i32.const 16) "hi\00")
                (data (i32.const 32) "h\c3\a9llo")
                (data (i32.const 48) "h\00i\00")
                (data (i32.const 64) "%d!\00")
                (data (i32.const 80) "\07\00\00\00")
                (func (export "update")
                    (call $text (i32.const 16) (i32.const 1) (i32.const 2))
                    (call $textUtf8 (i32.const 32) (i32.const 6) (i32.const 3) (i32.const 4))
                    (call $textUtf16 (i32.const 48) (i32.const 4) (i32.const 5) (i32.const 6))
                    (call $trace (i32.const 16))
                    (call $traceUtf8 (i32.const 32) (i32.const 6))
                    (call $traceUtf16 (i32.const 48) (i32.const 4))
                    (call $tracef (i32.const 64) (i32.const 80))))"#,
        );

        rt.call_update().unwrap();

        assert_eq!(
            rt.platform().calls,
            ["text hi 1 2", "textUtf8 héllo 3 4", "textUtf16 hi 5 6"]
        );
        assert_eq!(rt.platform().traces, ["hi", "héllo", "hi", "7!"]);
    }

    #[test]
    fn test_trace_length_is_checked() {
        let mut rt = loaded(
            r#"(module
                (import "env" "memory" (memory 1 1))
                (import "env" "traceUtf8" (func $traceUtf8 (param i32 i32)))
                (func (export "update")
                    (call $traceUtf8 (i32.const 65000) (i32.const 1000))))"#,
        );

        let err = rt.call_update().unwrap_err();
        assert!(err.is_refusal());
        assert!(rt.platform().traces.is_empty());
    }

    #[test]
    fn test_primitives_pass_through() {
        let mut rt = loaded(
            r#"(module
                (import "env" "memory" (memory 1 1))
                (import "env" "line" (func $line (param i32 i32 i32 i32)))
                (import "env" "hline" (func $hline (param i32 i32 i32)))
                (import "env" "vline" (func $vline (param i32 i32 i32)))
                (import "env" "oval" (func $oval (param i32 i32 i32 i32)))
                (import "env" "rect" (func $rect (param i32 i32 i32 i32)))
                (import "env" "tone" (func $tone (param i32 i32 i32 i32)))
                (func (export "update")
                    (call $line (i32.const -1) (i32.const 2) (i32.const 3) (i32.const 4))
                    (call $hline (i32.const 5) (i32.const 6) (i32.const 7))
                    (call $vline (i32.const 8) (i32.const 9) (i32.const 10))
                    (call $oval (i32.const 0) (i32.const 0) (i32.const 16) (i32.const 8))
                    (call $rect (i32.const 1) (i32.const 2) (i32.const -1) (i32.const 8))
                    (call $tone (i32.const 262) (i32.const 60) (i32.const 100) (i32.const 0))))"#,
        );

        rt.call_update().unwrap();

        assert_eq!(
            rt.platform().calls,
            [
                "line -1 2 3 4",
                "hline 5 6 7",
                "vline 8 9 10",
                "oval 0 0 16 8",
                "rect 1 2 4294967295 8",
                "tone 262 60 100 0",
            ]
        );
    }

    #[test]
    fn test_reload_releases_previous_cartridge() {
        let mut rt = loaded(
            r#"(module
                (import "env" "memory" (memory 1 1))
                (import "env" "trace" (func $trace (param i32)))
                (data (i32.const 16) "first\00")
                (func (export "start")
                    (i32.store8 (i32.const 1000) (i32.const 7))
                    (call $trace (i32.const 16)))
                (func (export "update")))"#,
        );
        rt.call_start().unwrap();
        assert_eq!(rt.memory().unwrap()[1000], 7);

        rt.load_module(EMPTY_CART.as_bytes()).expect("second load");

        assert_eq!(rt.phase(), Phase::Instantiated);
        assert!(!rt.has_start());
        assert!(!rt.has_update());
        assert!(rt.memory().unwrap().iter().all(|&b| b == 0));
        // The platform outlives the cartridge.
        assert_eq!(rt.platform().traces, ["first"]);
    }

    #[test]
    fn test_guest_memory_grow_refused() {
        let mut rt = loaded(
            r#"(module
                (import "env" "memory" (memory 1 1))
                (func (export "update")
                    (i32.store (i32.const 0) (memory.grow (i32.const 1)))))"#,
        );

        rt.call_update().unwrap();
        assert_eq!(&rt.memory().unwrap()[0..4], &(-1i32).to_le_bytes());

        rt.grow_memory(MEMORY_CAPACITY).expect("within capacity");
        assert!(matches!(
            rt.grow_memory(MEMORY_CAPACITY + 1),
            Err(BridgeError::CapacityExceeded { .. })
        ));
        assert_eq!(rt.memory().unwrap().len(), MEMORY_CAPACITY);
    }

    #[test]
    fn test_trap_is_invocation_error() {
        let mut rt = loaded(
            r#"(module
                (import "env" "memory" (memory 1 1))
                (func (export "update") unreachable))"#,
        );

        let err = rt.call_update().unwrap_err();
        assert!(matches!(err, BridgeError::Invocation { entry: "update", .. }));
        assert!(!err.is_refusal());
    }

    #[test]
    fn test_foreign_imports_rejected() {
        for wat in [
            r#"(module (import "env" "fire" (func (param i32))))"#,
            r#"(module (import "wasi_snapshot_preview1" "fd_write"
                    (func (param i32 i32 i32 i32) (result i32))))"#,
            r#"(module (import "env" "trace" (func (param i64))))"#,
        ] {
            let mut rt = runtime();
            let err = rt.load_module(wat.as_bytes()).unwrap_err();
            assert!(matches!(err, BridgeError::Instantiation(_)), "{wat}");
            assert!(!rt.is_instantiated());
        }
    }

    #[test]
    fn test_memory_mismatch_rejected() {
        let mut rt = runtime();
        let err = rt
            .load_module(br#"(module (import "env" "memory" (memory 2)))"#)
            .unwrap_err();
        assert!(matches!(err, BridgeError::Instantiation(_)));
    }

    #[test]
    fn test_bad_entry_signature_rejected() {
        let mut rt = runtime();
        let err = rt
            .load_module(
                br#"(module
                    (import "env" "memory" (memory 1 1))
                    (data (i32.const 10) "\2a")
                    (func (export "update") (param i32)))"#,
            )
            .unwrap_err();
        assert!(matches!(err, BridgeError::Instantiation(_)));

        // The half-built instance and its data segments are gone.
        assert_eq!(rt.phase(), Phase::Destroyed);
        assert!(!rt.is_instantiated());
        assert!(matches!(rt.instantiate(), Err(BridgeError::NotDefined)));
        assert!(matches!(rt.memory(), Err(BridgeError::AllocationFailed(_))));

        rt.load_module(EMPTY_CART.as_bytes()).expect("load after failure");
        assert!(rt.memory().unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_start_section_trap_tears_down() {
        let mut rt = runtime();
        let err = rt
            .load_module(
                br#"(module
                    (import "env" "memory" (memory 1 1))
                    (data (i32.const 10) "\2a")
                    (func $boot unreachable)
                    (start $boot))"#,
            )
            .unwrap_err();

        assert!(matches!(err, BridgeError::Instantiation(_)));
        assert_eq!(rt.phase(), Phase::Destroyed);
        assert!(matches!(rt.memory(), Err(BridgeError::AllocationFailed(_))));
    }

    #[test]
    fn test_private_memory_rejected() {
        let mut rt = runtime();
        rt.memory_mut().unwrap()[16..20].copy_from_slice(b"HOST");

        let err = rt
            .load_module(
                br#"(module
                    (import "env" "traceUtf8" (func $traceUtf8 (param i32 i32)))
                    (memory 1)
                    (data (i32.const 16) "cart")
                    (func (export "update")
                        (call $traceUtf8 (i32.const 16) (i32.const 4))))"#,
            )
            .unwrap_err();

        assert!(matches!(err, BridgeError::Instantiation(_)));
        assert!(!rt.is_instantiated());
        rt.call_update().unwrap();
        assert!(rt.platform().traces.is_empty());
    }

    #[test]
    fn test_blit_sub_past_end_is_out_of_bounds() {
        let mut rt = loaded(
            r#"(module
                (import "env" "memory" (memory 1 1))
                (import "env" "blitSub"
                    (func $blitSub (param i32 i32 i32 i32 i32 i32 i32 i32 i32)))
                (func (export "update")
                    (call $blitSub (i32.const 65000) (i32.const 0) (i32.const 0)
                                   (i32.const 4) (i32.const 4) (i32.const 0) (i32.const 0)
                                   (i32.const 4096) (i32.const 0))))"#,
        );

        let err = rt.call_update().unwrap_err();
        assert!(matches!(
            err,
            BridgeError::OutOfBounds {
                offset: 65000,
                length: 1537,
                ..
            }
        ));
        assert!(rt.platform().sprites.is_empty());
        assert!(rt.platform().calls.is_empty());
    }

    #[test]
    fn test_negative_sprite_size_draws_nothing() {
        let mut rt = loaded(
            r#"(module
                (import "env" "memory" (memory 1 1))
                (import "env" "blit" (func $blit (param i32 i32 i32 i32 i32 i32)))
                (import "env" "blitSub"
                    (func $blitSub (param i32 i32 i32 i32 i32 i32 i32 i32 i32)))
                (func (export "update")
                    (call $blit (i32.const 0) (i32.const 0) (i32.const 0)
                                (i32.const -8) (i32.const 8) (i32.const 1))
                    (call $blitSub (i32.const 0) (i32.const 0) (i32.const 0)
                                   (i32.const 4) (i32.const -1) (i32.const 0) (i32.const 0)
                                   (i32.const 16) (i32.const 0))))"#,
        );

        rt.call_update().expect("negative sizes are empty draws");
        assert!(rt.platform().calls.is_empty());
    }

    #[test]
    fn test_utf16_past_end_is_out_of_bounds() {
        for call in [
            "(call $textUtf16 (i32.const 65534) (i32.const 4) (i32.const 0) (i32.const 0))",
            "(call $traceUtf16 (i32.const 65534) (i32.const 4))",
        ] {
            let wat = format!(
                r#"(module
                    (import "env" "memory" (memory 1 1))
                    (import "env" "textUtf16" (func $textUtf16 (param i32 i32 i32 i32)))
                    (import "env" "traceUtf16" (func $traceUtf16 (param i32 i32)))
                    (func (export "update") {call}))"#
            );
            let mut rt = loaded(&wat);

            let err = rt.call_update().unwrap_err();
            assert!(
                matches!(err, BridgeError::OutOfBounds { offset: 65534, length: 4, .. }),
                "{call}"
            );
            assert!(rt.platform().calls.is_empty());
            assert!(rt.platform().traces.is_empty());
        }
    }

    #[test]
    fn test_tracef_args_past_end_is_out_of_bounds() {
        let mut rt = loaded(
            r#"(module
                (import "env" "memory" (memory 1 1))
                (import "env" "tracef" (func $tracef (param i32 i32)))
                (data (i32.const 16) "%f\00")
                (func (export "update")
                    (call $tracef (i32.const 16) (i32.const 65532))))"#,
        );

        let err = rt.call_update().unwrap_err();
        assert!(matches!(
            err,
            BridgeError::OutOfBounds {
                offset: 65532,
                length: 8,
                ..
            }
        ));
        assert!(rt.platform().traces.is_empty());
    }

    #[test]
    fn test_embedder_writes_before_load_are_visible() {
        let mut rt = runtime();
        rt.memory_mut().unwrap()[4] = 0x2a;

        rt.load_module(
            br#"(module
                (import "env" "memory" (memory 1 1))
                (func (export "update")
                    (i32.store8 (i32.const 5) (i32.load8_u (i32.const 4)))))"#,
        )
        .unwrap();
        rt.call_update().unwrap();

        assert_eq!(rt.memory().unwrap()[5], 0x2a);
    }
}
