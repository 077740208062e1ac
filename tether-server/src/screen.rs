//! Screen capture seam.
//!
//! The screenshot call asks a [`ScreenSource`] for one encoded image and
//! streams it back with the chunk codec. Real capture engines live outside
//! this crate; [`SyntheticScreen`] renders a deterministic test pattern.

use async_trait::async_trait;

use tether_core::TetherError;

#[async_trait]
pub trait ScreenSource: Send + Sync {
    fn monitor_count(&self) -> u32;

    /// Capture monitor `monitor_index` (0 = primary) as an encoded image.
    async fn capture(&self, monitor_index: u32) -> Result<Vec<u8>, TetherError>;
}

/// Renders a 24-bit BMP gradient per monitor.
#[derive(Debug, Clone)]
pub struct SyntheticScreen {
    width: u32,
    height: u32,
    monitors: u32,
}

impl Default for SyntheticScreen {
    fn default() -> Self {
        Self::new(320, 200, 1)
    }
}

const FILE_HEADER_LEN: u32 = 14;
const INFO_HEADER_LEN: u32 = 40;

impl SyntheticScreen {
    pub fn new(width: u32, height: u32, monitors: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            monitors: monitors.max(1),
        }
    }

    fn render(&self, monitor_index: u32) -> Vec<u8> {
        // Rows are padded to a multiple of four bytes.
        let row_len = (self.width * 3).div_ceil(4) * 4;
        let pixels_len = row_len * self.height;
        let offset = FILE_HEADER_LEN + INFO_HEADER_LEN;

        let mut out = Vec::with_capacity((offset + pixels_len) as usize);
        out.extend_from_slice(b"BM");
        out.extend_from_slice(&(offset + pixels_len).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&offset.to_le_bytes());

        out.extend_from_slice(&INFO_HEADER_LEN.to_le_bytes());
        out.extend_from_slice(&(self.width as i32).to_le_bytes());
        out.extend_from_slice(&(self.height as i32).to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&24u16.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // BI_RGB
        out.extend_from_slice(&pixels_len.to_le_bytes());
        out.extend_from_slice(&2835i32.to_le_bytes());
        out.extend_from_slice(&2835i32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());

        let tint = (monitor_index.wrapping_mul(67) % 256) as u8;
        let padding = (row_len - self.width * 3) as usize;
        for y in 0..self.height {
            for x in 0..self.width {
                let r = (x * 255 / self.width) as u8;
                let g = (y * 255 / self.height) as u8;
                out.extend_from_slice(&[tint, g, r]);
            }
            out.extend(std::iter::repeat_n(0u8, padding));
        }
        out
    }
}

#[async_trait]
impl ScreenSource for SyntheticScreen {
    fn monitor_count(&self) -> u32 {
        self.monitors
    }

    async fn capture(&self, monitor_index: u32) -> Result<Vec<u8>, TetherError> {
        if monitor_index >= self.monitors {
            return Err(TetherError::Other(format!(
                "monitor {monitor_index} does not exist ({} available)",
                self.monitors
            )));
        }
        Ok(self.render(monitor_index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn renders_a_valid_bmp() {
        let screen = SyntheticScreen::new(5, 3, 1);
        let image = screen.capture(0).await.unwrap();
        assert_eq!(&image[..2], b"BM");
        // 5 px * 3 B = 15, padded to 16 per row.
        assert_eq!(image.len(), 54 + 16 * 3);
        let declared = u32::from_le_bytes(image[2..6].try_into().unwrap());
        assert_eq!(declared as usize, image.len());
    }

    #[tokio::test]
    async fn monitors_differ_and_out_of_range_fails() {
        let screen = SyntheticScreen::new(8, 8, 2);
        assert_ne!(screen.capture(0).await.unwrap(), screen.capture(1).await.unwrap());
        assert!(screen.capture(2).await.is_err());
    }
}
