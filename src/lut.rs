//! Per-channel gamma and white-balance lookup tables.
//!
//! Each table maps the high byte of a 16-bit channel value to a corrected
//! 16-bit value. The 257th entry lets [`GammaTable::correct`] interpolate
//! between neighbouring entries for every index up to 0xFF.

use crate::config::RenderConfig;

pub const LUT_SIZE: usize = 257;

#[derive(Debug, Clone, PartialEq)]
pub struct GammaTable {
    channels: [[u16; LUT_SIZE]; 3],
}

impl GammaTable {
    /// Build tables for the given white balance (red, green, blue) and gamma exponent.
    pub fn build(white_point: [f32; 3], lum_power: f32) -> Self {
        let mut channels = [[0u16; LUT_SIZE]; 3];

        for (table, &balance) in channels.iter_mut().zip(white_point.iter()) {
            for (level, entry) in table.iter_mut().enumerate() {
                let normal = level as f64 / 256.0 * f64::from(balance);
                let output = normal.powf(f64::from(lum_power));
                let rounded = (output * 65535.0 + 0.5) as i64;
                *entry = rounded.clamp(0, 0xFFFF) as u16;
            }
        }

        GammaTable { channels }
    }

    pub fn from_config(render: &RenderConfig) -> Self {
        Self::build(render.white_point.as_array(), render.lum_power)
    }

    #[cfg(test)]
    pub fn channel(&self, channel: usize) -> &[u16; LUT_SIZE] {
        &self.channels[channel]
    }

    /// Corrected value for a 16-bit input on one channel.
    #[inline]
    pub fn correct(&self, channel: usize, value: u16) -> u16 {
        let table = &self.channels[channel];
        let index = usize::from(value >> 8);
        let alpha = u32::from(value & 0xFF);
        let inv_alpha = 0x100 - alpha;

        ((u32::from(table[index]) * inv_alpha + u32::from(table[index + 1]) * alpha) >> 8) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_table_matches_rounded_scale() {
        let table = GammaTable::build([1.0, 1.0, 1.0], 1.0);
        for c in 0..3 {
            for i in 0..LUT_SIZE {
                let expected = (i as f64 / 256.0 * 65535.0).round() as u16;
                assert_eq!(table.channel(c)[i], expected, "channel {} level {}", c, i);
            }
        }
    }

    #[test]
    fn test_gamma_two_is_darker_in_the_middle() {
        let table = GammaTable::build([1.0, 1.0, 1.0], 2.0);
        // (128/256)^2 = 0.25
        assert_eq!(table.channel(0)[128], 16384);
        assert_eq!(table.channel(0)[0], 0);
        assert_eq!(table.channel(0)[256], 0xFFFF);
    }

    #[test]
    fn test_white_balance_scales_channel() {
        let table = GammaTable::build([0.5, 1.0, 1.0], 1.0);
        assert_eq!(table.channel(0)[256], 32768);
        assert_eq!(table.channel(1)[256], 0xFFFF);
    }

    #[test]
    fn test_overdriven_balance_is_clamped() {
        let table = GammaTable::build([2.0, 1.0, 1.0], 1.0);
        assert_eq!(table.channel(0)[200], 0xFFFF);
        assert_eq!(table.channel(0)[256], 0xFFFF);
    }

    #[test]
    fn test_correct_interpolates_between_entries() {
        let table = GammaTable::build([1.0, 1.0, 1.0], 1.0);
        let low = u32::from(table.channel(2)[10]);
        let high = u32::from(table.channel(2)[11]);

        assert_eq!(u32::from(table.correct(2, 10 << 8)), low);
        assert_eq!(u32::from(table.correct(2, (10 << 8) | 0x80)), (low + high) / 2);
    }

    #[test]
    fn test_correct_top_of_range_uses_lookahead_entry() {
        let table = GammaTable::build([1.0, 1.0, 1.0], 2.2);
        let top = table.correct(1, 0xFFFF);
        assert!(top > table.channel(1)[255]);
        assert!(top <= table.channel(1)[256]);
    }
}
