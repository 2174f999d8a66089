// SPDX-FileCopyrightText: 2025 gsrx contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::types::DEFAULT_VRAM_SIZE;

/// Super-sampling rate for the rasterizer backend.
///
/// Rates map to per-axis log2 factors; odd rates sample more densely in Y.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuperSampling {
    X1,
    X2,
    X4,
    X8,
    X16,
}

impl SuperSampling {
    /// `(sampling_rate_x_log2, sampling_rate_y_log2)` for this rate.
    pub fn rate_log2(self) -> (u32, u32) {
        match self {
            SuperSampling::X1 => (0, 0),
            SuperSampling::X2 => (0, 1),
            SuperSampling::X4 => (1, 1),
            SuperSampling::X8 => (1, 2),
            SuperSampling::X16 => (2, 2),
        }
    }
}

impl Default for SuperSampling {
    fn default() -> Self {
        SuperSampling::X1
    }
}

/// Options handed to the translator at init.
#[derive(Debug, Clone)]
pub struct GsOptions {
    /// VRAM size in bytes. Must be a power of two.
    pub vram_size: u32,
    pub super_sampling: SuperSampling,
}

impl Default for GsOptions {
    fn default() -> Self {
        Self {
            vram_size: DEFAULT_VRAM_SIZE,
            super_sampling: SuperSampling::default(),
        }
    }
}

/// Per-draw debug capture granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrawDebugMode {
    #[default]
    None,
    /// Capture every 16th primitive; keeps captures steppable on long passes.
    Strided,
    Full,
}

/// Debug switches threaded through to the backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugMode {
    pub draw_mode: DrawDebugMode,
    /// Feed rendered targets back as debug output.
    pub feedback_render_target: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_log2_mapping() {
        assert_eq!(SuperSampling::X1.rate_log2(), (0, 0));
        assert_eq!(SuperSampling::X2.rate_log2(), (0, 1));
        assert_eq!(SuperSampling::X4.rate_log2(), (1, 1));
        assert_eq!(SuperSampling::X8.rate_log2(), (1, 2));
        assert_eq!(SuperSampling::X16.rate_log2(), (2, 2));
    }

    #[test]
    fn test_default_options() {
        let options = GsOptions::default();
        assert_eq!(options.vram_size, DEFAULT_VRAM_SIZE);
        assert!(options.vram_size.is_power_of_two());
        assert_eq!(options.super_sampling, SuperSampling::X1);
    }
}
