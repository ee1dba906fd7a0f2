//! Host Function Table - the `env` namespace a cartridge imports.
//!
//! ```text
//!   guest call  env.blit(ptr, x, y, w, h, flags)
//!        │
//!        ▼
//!   shim (this module)  ── sprite_len(w, h, flags) ──▶ accessor::resolve
//!        │                                                │ OutOfBounds → trap
//!        ▼                                                ▼
//!   Platform::blit(&memory[range], x, y, w, h, flags)
//! ```
//!
//! The catalog is fixed at build time. Every shim receives the owning
//! [`HostState`] through the `Caller`, resolves each guest pointer with the
//! full length it will touch, then hands plain values to the [`Platform`].
//! A refusal becomes a trap that carries the [`BridgeError`], so the
//! runtime can surface it unchanged.

use tracing::debug;
use wasmtime::{Caller, ExternType, Linker, Module, ValType};

use crate::accessor::{resolve, GuestMemory};
use crate::error::{BridgeError, Result};
use crate::memory::{MemoryLimiter, MemoryStore, MEMORY_CAPACITY};
use crate::platform::Platform;

/// The only import namespace.
pub const NAMESPACE: &str = "env";

/// Name of the memory import.
pub const MEMORY_IMPORT: &str = "memory";

/// `blit` flag: sprite uses 2 bits per pixel.
pub const BLIT_2BPP: u32 = 1;

// ============================================================================
// Catalog
// ============================================================================

/// Signature of a host import. All values are `i32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportSpec {
    pub name: &'static str,
    pub params: usize,
    pub results: usize,
}

const fn spec(name: &'static str, params: usize, results: usize) -> ImportSpec {
    ImportSpec {
        name,
        params,
        results,
    }
}

/// Every function in the `env` namespace.
pub const IMPORTS: [ImportSpec; 17] = [
    spec("blit", 6, 0),
    spec("blitSub", 9, 0),
    spec("line", 4, 0),
    spec("hline", 3, 0),
    spec("vline", 3, 0),
    spec("oval", 4, 0),
    spec("rect", 4, 0),
    spec("text", 3, 0),
    spec("textUtf8", 4, 0),
    spec("textUtf16", 4, 0),
    spec("tone", 4, 0),
    spec("diskr", 2, 1),
    spec("diskw", 2, 1),
    spec("trace", 1, 0),
    spec("traceUtf8", 2, 0),
    spec("traceUtf16", 2, 0),
    spec("tracef", 2, 0),
];

/// Look up a catalog entry by name.
pub fn lookup(name: &str) -> Option<&'static ImportSpec> {
    IMPORTS.iter().find(|spec| spec.name == name)
}

/// Reject modules that import anything outside the catalog, or that do not
/// import `env.memory`.
///
/// Shims resolve every pointer against the imported memory, so a cartridge
/// must not bring its own. The linker would refuse unknown names too; this
/// gives the embedder a precise message before instantiation is attempted.
pub fn check_imports(module: &Module) -> Result<()> {
    let mut imports_memory = false;

    for import in module.imports() {
        let (namespace, name) = (import.module(), import.name());
        if namespace != NAMESPACE {
            return Err(BridgeError::Instantiation(format!(
                "unknown import namespace `{}` (for `{}`)",
                namespace, name
            )));
        }

        match import.ty() {
            ExternType::Memory(_) if name == MEMORY_IMPORT => imports_memory = true,
            ExternType::Func(ty) => {
                let spec = lookup(name).ok_or_else(|| {
                    BridgeError::Instantiation(format!("unknown import `{}::{}`", namespace, name))
                })?;
                let all_i32 = ty
                    .params()
                    .chain(ty.results())
                    .all(|t| matches!(t, ValType::I32));
                let arity_matches =
                    ty.params().len() == spec.params && ty.results().len() == spec.results;
                if !arity_matches || !all_i32 {
                    return Err(BridgeError::Instantiation(format!(
                        "import `{}::{}` expects {} i32 params and {} i32 results",
                        namespace, name, spec.params, spec.results
                    )));
                }
            }
            _ => {
                return Err(BridgeError::Instantiation(format!(
                    "unsupported import `{}::{}`",
                    namespace, name
                )))
            }
        }
    }

    if !imports_memory {
        return Err(BridgeError::Instantiation(format!(
            "cartridge must import `{}::{}`",
            NAMESPACE, MEMORY_IMPORT
        )));
    }
    Ok(())
}

// ============================================================================
// Host State
// ============================================================================

/// Per-store context every shim receives.
pub struct HostState<P> {
    pub(crate) platform: P,
    pub(crate) memory: MemoryStore,
    pub(crate) limiter: MemoryLimiter,
}

impl<P> HostState<P> {
    pub(crate) fn new(platform: P) -> Self {
        Self {
            platform,
            memory: MemoryStore::unallocated(MEMORY_CAPACITY),
            limiter: MemoryLimiter::new(MEMORY_CAPACITY),
        }
    }
}

/// Linear memory and host state, borrowed together.
fn guest_view<'a, P: 'static>(
    caller: &'a mut Caller<'_, HostState<P>>,
) -> Result<(&'a mut [u8], &'a mut HostState<P>)> {
    let memory = caller.data().memory.handle()?;
    Ok(memory.data_and_store_mut(caller))
}

// ============================================================================
// Marshalling Helpers
// ============================================================================

/// Bytes a full sprite occupies.
pub fn sprite_len(width: u32, height: u32, flags: u32) -> i64 {
    let pixels = u64::from(width).saturating_mul(u64::from(height));
    packed_len(pixels, flags)
}

/// Bytes a `blitSub` can touch: up to the last pixel of the last source row.
pub fn sub_sprite_len(
    width: u32,
    height: u32,
    src_x: u32,
    src_y: u32,
    stride: u32,
    flags: u32,
) -> i64 {
    if width == 0 || height == 0 {
        return 0;
    }
    let last_row = u64::from(src_y) + u64::from(height) - 1;
    let pixels = last_row
        .saturating_mul(u64::from(stride))
        .saturating_add(u64::from(src_x))
        .saturating_add(u64::from(width));
    packed_len(pixels, flags)
}

/// A negative guest dimension covers no pixels.
#[inline]
fn dimension(value: i32) -> u32 {
    value.max(0) as u32
}

fn packed_len(pixels: u64, flags: u32) -> i64 {
    let bpp = if flags & BLIT_2BPP != 0 { 2 } else { 1 };
    let bytes = pixels.saturating_mul(bpp).div_ceil(8);
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

/// Render a `tracef` format string against guest-resident arguments.
///
/// `%c %d %x %s` consume 4 bytes, `%f` consumes 8; every argument read is
/// bounds-checked. Unknown directives are echoed.
pub fn format_tracef(memory: GuestMemory<'_>, format: i32, args: i32) -> Result<String> {
    let format = memory.c_str(format)?;
    let mut out: Vec<u8> = Vec::with_capacity(format.len());
    let mut cursor = args;
    let mut bytes = format.iter().copied();

    while let Some(b) = bytes.next() {
        if b != b'%' {
            out.push(b);
            continue;
        }
        match bytes.next() {
            None => break,
            Some(b'%') => out.push(b'%'),
            Some(b'c') => {
                out.push(memory.read_u32(cursor)? as u8);
                cursor = cursor.saturating_add(4);
            }
            Some(b'd') => {
                let v = memory.read_i32(cursor)?;
                cursor = cursor.saturating_add(4);
                out.extend_from_slice(v.to_string().as_bytes());
            }
            Some(b'x') => {
                let v = memory.read_u32(cursor)?;
                cursor = cursor.saturating_add(4);
                out.extend_from_slice(format!("{:x}", v).as_bytes());
            }
            Some(b's') => {
                let ptr = memory.read_i32(cursor)?;
                cursor = cursor.saturating_add(4);
                out.extend_from_slice(memory.c_str(ptr)?);
            }
            Some(b'f') => {
                let v = memory.read_f64(cursor)?;
                cursor = cursor.saturating_add(8);
                out.extend_from_slice(v.to_string().as_bytes());
            }
            Some(other) => out.extend_from_slice(&[b'%', other]),
        }
    }

    Ok(String::from_utf8_lossy(&out).into_owned())
}

// ============================================================================
// Registration
// ============================================================================

fn define_error(e: anyhow::Error) -> BridgeError {
    BridgeError::Instantiation(e.to_string())
}

/// Register every catalog entry on `linker`.
///
/// The memory import is store-specific and is defined per instantiation.
pub fn register<P: Platform>(linker: &mut Linker<HostState<P>>) -> Result<()> {
    register_drawing(linker).map_err(define_error)?;
    register_text(linker).map_err(define_error)?;
    register_audio_and_disk(linker).map_err(define_error)?;
    register_trace(linker).map_err(define_error)?;
    debug!(functions = IMPORTS.len(), namespace = NAMESPACE, "Registered host imports");
    Ok(())
}

fn register_drawing<P: Platform>(linker: &mut Linker<HostState<P>>) -> anyhow::Result<()> {
    linker.func_wrap(
        NAMESPACE,
        "blit",
        |mut caller: Caller<'_, HostState<P>>,
         sprite: i32,
         x: i32,
         y: i32,
         width: i32,
         height: i32,
         flags: i32|
         -> anyhow::Result<()> {
            let (width, height, flags) = (dimension(width), dimension(height), flags as u32);
            if width == 0 || height == 0 {
                return Ok(());
            }
            let (mem, state) = guest_view(&mut caller)?;
            let bytes = GuestMemory::new(mem).slice(sprite, sprite_len(width, height, flags))?;
            state.platform.blit(bytes, x, y, width, height, flags);
            Ok(())
        },
    )?;

    linker.func_wrap(
        NAMESPACE,
        "blitSub",
        |mut caller: Caller<'_, HostState<P>>,
         sprite: i32,
         x: i32,
         y: i32,
         width: i32,
         height: i32,
         src_x: i32,
         src_y: i32,
         stride: i32,
         flags: i32|
         -> anyhow::Result<()> {
            let (width, height, flags) = (dimension(width), dimension(height), flags as u32);
            if width == 0 || height == 0 {
                return Ok(());
            }
            let (src_x, src_y, stride) = (src_x as u32, src_y as u32, stride as u32);
            let len = sub_sprite_len(width, height, src_x, src_y, stride, flags);
            let (mem, state) = guest_view(&mut caller)?;
            let bytes = GuestMemory::new(mem).slice(sprite, len)?;
            state
                .platform
                .blit_sub(bytes, x, y, width, height, src_x, src_y, stride, flags);
            Ok(())
        },
    )?;

    linker.func_wrap(
        NAMESPACE,
        "line",
        |mut caller: Caller<'_, HostState<P>>, x1: i32, y1: i32, x2: i32, y2: i32| {
            caller.data_mut().platform.line(x1, y1, x2, y2);
        },
    )?;

    linker.func_wrap(
        NAMESPACE,
        "hline",
        |mut caller: Caller<'_, HostState<P>>, x: i32, y: i32, len: i32| {
            caller.data_mut().platform.hline(x, y, len as u32);
        },
    )?;

    linker.func_wrap(
        NAMESPACE,
        "vline",
        |mut caller: Caller<'_, HostState<P>>, x: i32, y: i32, len: i32| {
            caller.data_mut().platform.vline(x, y, len as u32);
        },
    )?;

    linker.func_wrap(
        NAMESPACE,
        "oval",
        |mut caller: Caller<'_, HostState<P>>, x: i32, y: i32, width: i32, height: i32| {
            caller
                .data_mut()
                .platform
                .oval(x, y, width as u32, height as u32);
        },
    )?;

    linker.func_wrap(
        NAMESPACE,
        "rect",
        |mut caller: Caller<'_, HostState<P>>, x: i32, y: i32, width: i32, height: i32| {
            caller
                .data_mut()
                .platform
                .rect(x, y, width as u32, height as u32);
        },
    )?;

    Ok(())
}

fn register_text<P: Platform>(linker: &mut Linker<HostState<P>>) -> anyhow::Result<()> {
    linker.func_wrap(
        NAMESPACE,
        "text",
        |mut caller: Caller<'_, HostState<P>>, ptr: i32, x: i32, y: i32| -> anyhow::Result<()> {
            let (mem, state) = guest_view(&mut caller)?;
            let text = GuestMemory::new(mem).c_str(ptr)?;
            state.platform.text(text, x, y);
            Ok(())
        },
    )?;

    linker.func_wrap(
        NAMESPACE,
        "textUtf8",
        |mut caller: Caller<'_, HostState<P>>,
         ptr: i32,
         byte_length: i32,
         x: i32,
         y: i32|
         -> anyhow::Result<()> {
            let (mem, state) = guest_view(&mut caller)?;
            let bytes = GuestMemory::new(mem).slice(ptr, i64::from(byte_length))?;
            state
                .platform
                .text_utf8(&String::from_utf8_lossy(bytes), x, y);
            Ok(())
        },
    )?;

    linker.func_wrap(
        NAMESPACE,
        "textUtf16",
        |mut caller: Caller<'_, HostState<P>>,
         ptr: i32,
         byte_length: i32,
         x: i32,
         y: i32|
         -> anyhow::Result<()> {
            let (mem, state) = guest_view(&mut caller)?;
            let units = GuestMemory::new(mem).utf16_units(ptr, i64::from(byte_length))?;
            state.platform.text_utf16(&units, x, y);
            Ok(())
        },
    )?;

    Ok(())
}

fn register_audio_and_disk<P: Platform>(linker: &mut Linker<HostState<P>>) -> anyhow::Result<()> {
    linker.func_wrap(
        NAMESPACE,
        "tone",
        |mut caller: Caller<'_, HostState<P>>,
         frequency: i32,
         duration: i32,
         volume: i32,
         flags: i32| {
            caller.data_mut().platform.tone(
                frequency as u32,
                duration as u32,
                volume as u32,
                flags as u32,
            );
        },
    )?;

    linker.func_wrap(
        NAMESPACE,
        "diskr",
        |mut caller: Caller<'_, HostState<P>>, dest: i32, size: i32| -> anyhow::Result<i32> {
            if size == 0 {
                return Ok(0);
            }
            let (mem, state) = guest_view(&mut caller)?;
            let range = resolve(mem.len(), dest, i64::from(size))?;
            let read = state.platform.disk_read(&mut mem[range]);
            Ok(read.min(size as u32) as i32)
        },
    )?;

    linker.func_wrap(
        NAMESPACE,
        "diskw",
        |mut caller: Caller<'_, HostState<P>>, src: i32, size: i32| -> anyhow::Result<i32> {
            if size == 0 {
                return Ok(0);
            }
            let (mem, state) = guest_view(&mut caller)?;
            let bytes = GuestMemory::new(mem).slice(src, i64::from(size))?;
            let written = state.platform.disk_write(bytes);
            Ok(written.min(size as u32) as i32)
        },
    )?;

    Ok(())
}

fn register_trace<P: Platform>(linker: &mut Linker<HostState<P>>) -> anyhow::Result<()> {
    linker.func_wrap(
        NAMESPACE,
        "trace",
        |mut caller: Caller<'_, HostState<P>>, ptr: i32| -> anyhow::Result<()> {
            let (mem, state) = guest_view(&mut caller)?;
            let text = GuestMemory::new(mem).c_str(ptr)?;
            state.platform.trace(&String::from_utf8_lossy(text));
            Ok(())
        },
    )?;

    linker.func_wrap(
        NAMESPACE,
        "traceUtf8",
        |mut caller: Caller<'_, HostState<P>>, ptr: i32, byte_length: i32| -> anyhow::Result<()> {
            let (mem, state) = guest_view(&mut caller)?;
            let bytes = GuestMemory::new(mem).slice(ptr, i64::from(byte_length))?;
            state.platform.trace(&String::from_utf8_lossy(bytes));
            Ok(())
        },
    )?;

    linker.func_wrap(
        NAMESPACE,
        "traceUtf16",
        |mut caller: Caller<'_, HostState<P>>, ptr: i32, byte_length: i32| -> anyhow::Result<()> {
            let (mem, state) = guest_view(&mut caller)?;
            let units = GuestMemory::new(mem).utf16_units(ptr, i64::from(byte_length))?;
            state.platform.trace(&String::from_utf16_lossy(&units));
            Ok(())
        },
    )?;

    linker.func_wrap(
        NAMESPACE,
        "tracef",
        |mut caller: Caller<'_, HostState<P>>, format: i32, args: i32| -> anyhow::Result<()> {
            let (mem, state) = guest_view(&mut caller)?;
            let message = format_tracef(GuestMemory::new(mem), format, args)?;
            state.platform.trace(&message);
            Ok(())
        },
    )?;

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
