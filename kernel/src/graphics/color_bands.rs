//! Vertical color-band test pattern.
//!
//! Splits the screen into equal-width bands, one per palette color. Band
//! width is `width / colors` rounded down; the `width % colors` rightmost
//! columns are left as they were.

use crate::drivers::virtio_gpu::Framebuffer;

pub const GREY: u32 = 0x0080_8080;
pub const YELLOW: u32 = 0x00ff_ff00;
pub const CYAN: u32 = 0x0000_ffff;
pub const GREEN: u32 = 0x0000_ff00;
pub const MAGENTA: u32 = 0x00ff_00ff;
pub const RED: u32 = 0x00ff_0000;
pub const BLUE: u32 = 0x0000_00ff;

/// Boot test pattern, left to right.
pub const TEST_PATTERN: [u32; 7] = [GREY, YELLOW, CYAN, GREEN, MAGENTA, RED, BLUE];

/// Width in pixels of each band when `width` is split across `colors` bands.
pub fn band_width(width: u32, colors: usize) -> u32 {
    if colors == 0 {
        return 0;
    }
    width / colors as u32
}

/// Paint one vertical band per `palette` entry into a row-major buffer of
/// `width * height` pixels.
pub fn paint_color_bands(pixels: &mut [u32], width: u32, height: u32, palette: &[u32]) {
    let band = band_width(width, palette.len()) as usize;
    if band == 0 {
        return;
    }
    let width = width as usize;
    debug_assert!(pixels.len() >= width * height as usize);

    for row in pixels.chunks_exact_mut(width).take(height as usize) {
        for (i, &color) in palette.iter().enumerate() {
            row[i * band..(i + 1) * band].fill(color);
        }
    }
}

/// Paint [`TEST_PATTERN`] across the whole framebuffer.
pub fn paint_test_pattern(fb: &mut Framebuffer) {
    let (width, height) = (fb.width(), fb.height());
    paint_color_bands(fb.pixels_mut(), width, height, &TEST_PATTERN);
}
