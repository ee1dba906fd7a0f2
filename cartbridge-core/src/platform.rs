//! Native capabilities the cartridge can reach.
//!
//! The bridge never renders, mixes audio or persists anything itself. After
//! marshalling and bounds-checking a guest call it hands plain Rust values to
//! a [`Platform`]. Every slice a platform receives has already been resolved
//! against linear memory.

use tracing::{debug, info};

/// Persistent storage available to a cartridge, in bytes.
pub const DISK_CAPACITY: usize = 1024;

/// Host side of the `env` import namespace.
pub trait Platform: 'static {
    /// Draw a whole sprite. `sprite` covers exactly the bytes it needs.
    fn blit(&mut self, sprite: &[u8], x: i32, y: i32, width: u32, height: u32, flags: u32);

    /// Draw the `width` x `height` region at (`src_x`, `src_y`) of a sprite
    /// whose rows are `stride` pixels wide.
    #[allow(clippy::too_many_arguments)]
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
    );

    fn line(&mut self, x1: i32, y1: i32, x2: i32, y2: i32);
    fn hline(&mut self, x: i32, y: i32, len: u32);
    fn vline(&mut self, x: i32, y: i32, len: u32);
    fn oval(&mut self, x: i32, y: i32, width: u32, height: u32);
    fn rect(&mut self, x: i32, y: i32, width: u32, height: u32);

    /// Raw glyph codes, one byte per glyph.
    fn text(&mut self, text: &[u8], x: i32, y: i32);
    fn text_utf8(&mut self, text: &str, x: i32, y: i32);
    fn text_utf16(&mut self, text: &[u16], x: i32, y: i32);

    fn tone(&mut self, frequency: u32, duration: u32, volume: u32, flags: u32);

    /// Fill `dest` from storage; returns the number of bytes copied.
    fn disk_read(&mut self, dest: &mut [u8]) -> u32;

    /// Replace storage with `src`; returns the number of bytes kept.
    fn disk_write(&mut self, src: &[u8]) -> u32;

    /// A diagnostic line from the cartridge.
    fn trace(&mut self, message: &str);
}

// ============================================================================
// Headless Platform
// ============================================================================

/// Platform with no display or audio device.
///
/// Counts draw calls and tones, keeps the disk in memory, and forwards
/// cartridge diagnostics to `tracing` under the `cart` target.
#[derive(Debug, Default)]
pub struct Headless {
    pub draw_calls: u64,
    pub tones: u64,
    pub traces: u64,
    disk: Vec<u8>,
}

impl Headless {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with existing save data (truncated to [`DISK_CAPACITY`]).
    pub fn with_disk(disk: &[u8]) -> Self {
        Self {
            disk: disk[..disk.len().min(DISK_CAPACITY)].to_vec(),
            ..Self::default()
        }
    }

    /// Current save data.
    pub fn disk(&self) -> &[u8] {
        &self.disk
    }
}

impl Platform for Headless {
    fn blit(&mut self, _sprite: &[u8], _x: i32, _y: i32, _width: u32, _height: u32, _flags: u32) {
        self.draw_calls += 1;
    }

    fn blit_sub(
        &mut self,
        _sprite: &[u8],
        _x: i32,
        _y: i32,
        _width: u32,
        _height: u32,
        _src_x: u32,
        _src_y: u32,
        _stride: u32,
        _flags: u32,
    ) {
        self.draw_calls += 1;
    }

    fn line(&mut self, _x1: i32, _y1: i32, _x2: i32, _y2: i32) {
        self.draw_calls += 1;
    }

    fn hline(&mut self, _x: i32, _y: i32, _len: u32) {
        self.draw_calls += 1;
    }

    fn vline(&mut self, _x: i32, _y: i32, _len: u32) {
        self.draw_calls += 1;
    }

    fn oval(&mut self, _x: i32, _y: i32, _width: u32, _height: u32) {
        self.draw_calls += 1;
    }

    fn rect(&mut self, _x: i32, _y: i32, _width: u32, _height: u32) {
        self.draw_calls += 1;
    }

    fn text(&mut self, _text: &[u8], _x: i32, _y: i32) {
        self.draw_calls += 1;
    }

    fn text_utf8(&mut self, _text: &str, _x: i32, _y: i32) {
        self.draw_calls += 1;
    }

    fn text_utf16(&mut self, _text: &[u16], _x: i32, _y: i32) {
        self.draw_calls += 1;
    }

    fn tone(&mut self, frequency: u32, duration: u32, volume: u32, flags: u32) {
        self.tones += 1;
        debug!(
            frequency = frequency,
            duration = duration,
            volume = volume,
            flags = flags,
            "tone"
        );
    }

    fn disk_read(&mut self, dest: &mut [u8]) -> u32 {
        let n = dest.len().min(self.disk.len());
        dest[..n].copy_from_slice(&self.disk[..n]);
        n as u32
    }

    fn disk_write(&mut self, src: &[u8]) -> u32 {
        let n = src.len().min(DISK_CAPACITY);
        self.disk.clear();
        self.disk.extend_from_slice(&src[..n]);
        debug!(bytes = n, "Disk written");
        n as u32
    }

    fn trace(&mut self, message: &str) {
        self.traces += 1;
        info!(target: "cart", "{}", message);
    }
}
