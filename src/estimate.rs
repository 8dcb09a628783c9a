//! Pre-submission cost estimation.
//!
//! Vision inputs are billed in tiles: the image is first scaled down to fit
//! within a square, then its shortest side is scaled to a fixed size, and the
//! result is covered by fixed-size tiles. Text inputs are approximated at
//! four characters per unit. These are provider billing rules expressed as
//! configuration so they can track pricing changes without a code change.

use serde::{Deserialize, Serialize};

/// Billing constants for the estimator. Defaults match the provider's
/// published vision and token pricing at the time of writing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostConfig {
    /// Fixed prompt-template overhead added per item.
    pub template_overhead_units: u64,
    /// Base unit cost for any image input.
    pub vision_base_units: u64,
    /// Unit cost per image tile.
    pub per_tile_units: u64,
    /// Tile edge length in pixels.
    pub tile_px: u32,
    /// Initial fit: longest side is scaled down to at most this.
    pub fit_px: u32,
    /// Second pass: shortest side is scaled to exactly this.
    pub shortest_side_px: u32,
    /// Expected output units per item.
    pub output_units_per_item: u64,
    pub input_cost_per_million: f64,
    pub output_cost_per_million: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            template_overhead_units: 60,
            vision_base_units: 85,
            per_tile_units: 170,
            tile_px: 512,
            fit_px: 2048,
            shortest_side_px: 768,
            output_units_per_item: 150,
            input_cost_per_million: 1.25,
            output_cost_per_million: 5.0,
        }
    }
}

/// Per-item inputs to the estimator.
#[derive(Debug, Clone)]
pub struct EstimateItem {
    pub description_chars: usize,
    pub image_dims: Option<(u32, u32)>,
}

/// Aggregate estimate for one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct CostEstimate {
    pub input_units: u64,
    pub output_units: u64,
    pub cost: f64,
}

/// Batch cost estimator.
#[derive(Debug, Clone, Default)]
pub struct CostEstimator {
    config: CostConfig,
}

impl CostEstimator {
    pub fn new(config: CostConfig) -> Self {
        Self { config }
    }

    /// Estimate the cost of submitting the given items as one batch.
    pub fn estimate(&self, items: &[EstimateItem]) -> CostEstimate {
        let mut input_units = 0u64;
        for item in items {
            input_units += self.config.template_overhead_units;
            input_units += text_units(item.description_chars);
            if let Some((w, h)) = item.image_dims {
                input_units += self.vision_units(w, h);
            }
        }
        let output_units = self.config.output_units_per_item * items.len() as u64;
        CostEstimate {
            input_units,
            output_units,
            cost: self.cost_for(input_units, output_units),
        }
    }

    /// Dollar cost of a unit count at the configured rates. Also used to
    /// price provider-reported usage after completion.
    pub fn cost_for(&self, input_units: u64, output_units: u64) -> f64 {
        input_units as f64 * self.config.input_cost_per_million / 1e6
            + output_units as f64 * self.config.output_cost_per_million / 1e6
    }

    /// Unit cost for one image at the given pixel dimensions.
    ///
    /// Scaling pipeline: fit the longest side within `fit_px` (downscale
    /// only), then scale the shortest side to `shortest_side_px` (either
    /// direction), then count `tile_px` tiles over the result.
    pub fn vision_units(&self, width: u32, height: u32) -> u64 {
        if width == 0 || height == 0 {
            return self.config.vision_base_units;
        }
        let cfg = &self.config;
        let fit = cfg.fit_px as f64;
        let scale = (fit / width as f64).min(fit / height as f64).min(1.0);
        let (mut w, mut h) = (width as f64 * scale, height as f64 * scale);

        let shortest = w.min(h);
        let rescale = cfg.shortest_side_px as f64 / shortest;
        w *= rescale;
        h *= rescale;

        let tiles = (w / cfg.tile_px as f64).ceil() as u64 * (h / cfg.tile_px as f64).ceil() as u64;
        cfg.vision_base_units + tiles * cfg.per_tile_units
    }
}

fn text_units(chars: usize) -> u64 {
    (chars as u64).div_ceil(4).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn square_image_scales_to_four_tiles() {
        // 1024x1024: fits in 2048, shortest side scaled up to 768 so the
        // result is 768x768, covered by a 2x2 grid of 512px tiles.
        let estimator = CostEstimator::default();
        assert_eq!(estimator.vision_units(1024, 1024), 85 + 4 * 170);
    }

    #[test]
    fn oversized_image_is_fit_first() {
        // 4096x2048 fits to 2048x1024, shortest side to 768 giving 1536x768,
        // which is 3x2 tiles wide by tall.
        let estimator = CostEstimator::default();
        assert_eq!(estimator.vision_units(4096, 2048), 85 + 6 * 170);
    }

    #[test]
    fn degenerate_dimensions_fall_back_to_base() {
        let estimator = CostEstimator::default();
        assert_eq!(estimator.vision_units(0, 100), 85);
    }

    #[test]
    fn text_units_round_up_with_floor_of_one() {
        assert_eq!(text_units(0), 1);
        assert_eq!(text_units(3), 1);
        assert_eq!(text_units(4), 1);
        assert_eq!(text_units(5), 2);
        assert_eq!(text_units(400), 100);
    }

    #[test]
    fn batch_estimate_sums_inputs_and_outputs() {
        let estimator = CostEstimator::default();
        let items = vec![
            EstimateItem {
                description_chars: 400,
                image_dims: Some((1024, 1024)),
            },
            EstimateItem {
                description_chars: 80,
                image_dims: None,
            },
        ];
        let estimate = estimator.estimate(&items);
        assert_eq!(
            estimate.input_units,
            (60 + 100 + 765) + (60 + 20)
        );
        assert_eq!(estimate.output_units, 300);
        assert!(estimate.cost > 0.0);
    }
}
