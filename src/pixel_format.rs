use serde::{Deserialize, Serialize};

use crate::frame::Rgb;

/// Byte order (and white channel handling) expected by an LED controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    #[default]
    Rgb,
    Grb,
    Bgr,
    Brg,
    Rgbw,
    Grbw,
}

impl PixelFormat {
    /// Bytes per pixel on the wire.
    pub fn stride(self) -> usize {
        match self {
            PixelFormat::Rgbw | PixelFormat::Grbw => 4,
            _ => 3,
        }
    }

    /// Append `pixels` to `out` in this format.
    pub fn write_pixels(self, pixels: &[Rgb], out: &mut Vec<u8>) {
        out.reserve(pixels.len() * self.stride());
        for &[r, g, b] in pixels {
            match self {
                PixelFormat::Rgb => out.extend_from_slice(&[r, g, b]),
                PixelFormat::Grb => out.extend_from_slice(&[g, r, b]),
                PixelFormat::Bgr => out.extend_from_slice(&[b, g, r]),
                PixelFormat::Brg => out.extend_from_slice(&[b, r, g]),
                PixelFormat::Rgbw => {
                    // White is the common part of all three channels
                    let w = r.min(g).min(b);
                    out.extend_from_slice(&[r - w, g - w, b - w, w]);
                }
                PixelFormat::Grbw => {
                    let w = r.min(g).min(b);
                    out.extend_from_slice(&[g - w, r - w, b - w, w]);
                }
            }
        }
    }
}
