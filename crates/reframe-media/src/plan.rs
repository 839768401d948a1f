//! Filter planning: probe + target parameters to an ordered filter chain.
//!
//! The chain always has the same shape:
//!
//! ```text
//! [rotate] -> [crop] -> scale (cover | contain [+ pad]) -> force aspect
//! ```
//!
//! Rotation runs first so every later step reasons about the displayed
//! frame. A letterbox crop runs before scaling and its own dimensions decide
//! the orientation.

use std::collections::HashMap;
use std::fmt;

use reframe_models::{AspectRatio, FitMode, Orientation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PlannerConfig;
use crate::cropdetect::CropCandidate;
use crate::probe::MediaProbe;

/// One step of the filter chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FilterOp {
    /// Clockwise quarter turns: 90, 180 or 270
    Rotate { degrees: u16 },
    Crop(CropCandidate),
    /// Fill the box, cropping the overflow to exactly `width`x`height`
    ScaleCover { width: u32, height: u32 },
    /// Fit inside the box keeping aspect, dimensions rounded down to even
    ScaleContain { width: u32, height: u32 },
    /// Centre on a black canvas of exactly `width`x`height`
    Pad { width: u32, height: u32 },
    /// Square pixels and an explicit display aspect
    ForceAspect { dar: AspectRatio },
    /// Square pixels only
    ResetSar,
}

impl FilterOp {
    /// FFmpeg filter expression for this step.
    pub fn to_filter(&self) -> String {
        match self {
            FilterOp::Rotate { degrees: 90 } => "transpose=1".to_string(),
            FilterOp::Rotate { degrees: 270 } => "transpose=2".to_string(),
            FilterOp::Rotate { .. } => "hflip,vflip".to_string(),
            FilterOp::Crop(rect) => rect.to_filter(),
            FilterOp::ScaleCover { width, height } => format!(
                "scale={w}:{h}:force_original_aspect_ratio=increase,crop={w}:{h}",
                w = width,
                h = height
            ),
            FilterOp::ScaleContain { width, height } => format!(
                "scale=w=trunc(iw*min({w}/iw\\,{h}/ih)/2)*2:h=trunc(ih*min({w}/iw\\,{h}/ih)/2)*2",
                w = width,
                h = height
            ),
            FilterOp::Pad { width, height } => {
                format!("pad={}:{}:(ow-iw)/2:(oh-ih)/2:black", width, height)
            }
            FilterOp::ForceAspect { dar } => {
                format!("setsar=1,setdar={}/{}", dar.width, dar.height)
            }
            FilterOp::ResetSar => "setsar=1".to_string(),
        }
    }
}

/// Ordered transform chain for one conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterPlan {
    /// Even output width
    pub target_width: u32,
    /// Even output height
    pub target_height: u32,
    pub orientation: Orientation,
    /// Fit after resolving `cover-auto`
    pub fit: FitMode,
    pub ops: Vec<FilterOp>,
}

impl FilterPlan {
    /// Comma-joined `-vf` argument.
    pub fn filter_chain(&self) -> String {
        self.ops
            .iter()
            .map(FilterOp::to_filter)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// The chain rotates explicitly, so the engine must not auto-rotate.
    pub fn has_rotation(&self) -> bool {
        self.ops.iter().any(|op| matches!(op, FilterOp::Rotate { .. }))
    }

    pub fn crop(&self) -> Option<&CropCandidate> {
        self.ops.iter().find_map(|op| match op {
            FilterOp::Crop(rect) => Some(rect),
            _ => None,
        })
    }

    /// Cover fits must hit the exact target rectangle, which a stream copy
    /// cannot guarantee.
    pub fn requires_exact_geometry(&self) -> bool {
        self.fit.is_cover()
    }

    /// Safest fallback chain: contain-scale into this plan's target box with
    /// no crop and no explicit rotation (the engine auto-rotates instead).
    pub fn conservative(&self) -> FilterPlan {
        FilterPlan {
            target_width: self.target_width,
            target_height: self.target_height,
            orientation: self.orientation,
            fit: FitMode::Contain,
            ops: vec![
                FilterOp::ScaleContain {
                    width: self.target_width,
                    height: self.target_height,
                },
                FilterOp::ResetSar,
            ],
        }
    }
}

impl fmt::Display for FilterPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} {} {} [{}]",
            self.target_width,
            self.target_height,
            self.orientation,
            self.fit,
            self.filter_chain()
        )
    }
}

/// Builds [`FilterPlan`]s.
#[derive(Debug, Clone, Default)]
pub struct FilterPlanner {
    config: PlannerConfig,
}

impl FilterPlanner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    pub fn plan(
        &self,
        probe: &MediaProbe,
        target_height: u32,
        fit: FitMode,
        candidates: &[CropCandidate],
    ) -> FilterPlan {
        let frame_w = probe.effective_width();
        let frame_h = probe.effective_height();

        let crop = majority_vote(candidates)
            .filter(|rect| self.accepts_crop(rect, frame_w, frame_h));

        let (src_w, src_h) = crop
            .map(|rect| (rect.width, rect.height))
            .unwrap_or((frame_w, frame_h));

        let orientation = Orientation::classify(src_w, src_h, self.config.orientation_band);
        let fit = fit.resolve(orientation);
        let height = even_floor(target_height);

        let mut ops = Vec::new();
        if matches!(probe.rotation, 90 | 180 | 270) {
            ops.push(FilterOp::Rotate {
                degrees: probe.rotation,
            });
        }
        if let Some(rect) = crop {
            ops.push(FilterOp::Crop(rect));
        }

        let (target_width, target_height) = match fit {
            FitMode::Cover9x16 | FitMode::Cover16x9 | FitMode::CoverAuto => {
                let aspect = if fit == FitMode::Cover16x9 {
                    AspectRatio::LANDSCAPE
                } else {
                    AspectRatio::PORTRAIT
                };
                let width = width_for(height, aspect);
                ops.push(FilterOp::ScaleCover { width, height });
                (width, height)
            }
            FitMode::Contain => {
                let (box_w, box_h) = contain_box(height, orientation);
                ops.push(FilterOp::ScaleContain {
                    width: box_w,
                    height: box_h,
                });
                if self.config.pad_contain {
                    ops.push(FilterOp::Pad {
                        width: box_w,
                        height: box_h,
                    });
                    (box_w, box_h)
                } else {
                    fit_inside(src_w, src_h, box_w, box_h)
                }
            }
        };

        ops.push(FilterOp::ForceAspect {
            dar: AspectRatio::reduced(target_width, target_height),
        });

        let plan = FilterPlan {
            target_width,
            target_height,
            orientation,
            fit,
            ops,
        };
        debug!(plan = %plan, degraded_probe = probe.degraded, "Planned filter chain");
        plan
    }

    fn accepts_crop(&self, rect: &CropCandidate, frame_w: u32, frame_h: u32) -> bool {
        let big_enough =
            rect.width >= self.config.min_crop_width && rect.height >= self.config.min_crop_height;
        let inside = rect.x + rect.width <= frame_w && rect.y + rect.height <= frame_h;
        let full_frame = rect.width == frame_w && rect.height == frame_h;
        big_enough && inside && !full_frame
    }
}

/// Most frequent rectangle; ties go to the one seen first.
pub fn majority_vote(candidates: &[CropCandidate]) -> Option<CropCandidate> {
    let mut counts: HashMap<CropCandidate, (usize, usize)> = HashMap::new();
    for (index, candidate) in candidates.iter().enumerate() {
        counts.entry(*candidate).or_insert((0, index)).0 += 1;
    }

    counts
        .into_iter()
        .max_by(|(_, (count_a, first_a)), (_, (count_b, first_b))| {
            count_a.cmp(count_b).then(first_b.cmp(first_a))
        })
        .map(|(rect, _)| rect)
}

/// Round down to even, never below 2.
pub fn even_floor(value: u32) -> u32 {
    (value & !1).max(2)
}

/// Width for `height` at `aspect`: rounded to nearest, then down to even.
fn width_for(height: u32, aspect: AspectRatio) -> u32 {
    let exact = height as f64 * aspect.width as f64 / aspect.height as f64;
    even_floor(exact.round() as u32)
}

fn contain_box(height: u32, orientation: Orientation) -> (u32, u32) {
    match orientation {
        Orientation::Portrait => (width_for(height, AspectRatio::PORTRAIT), height),
        Orientation::Landscape => (width_for(height, AspectRatio::LANDSCAPE), height),
        Orientation::Square => (height, height),
    }
}

/// Dimensions of `src` scaled to fit inside the box, each rounded down to even.
fn fit_inside(src_w: u32, src_h: u32, box_w: u32, box_h: u32) -> (u32, u32) {
    let (sw, sh) = (src_w.max(1) as u64, src_h.max(1) as u64);
    let (bw, bh) = (box_w as u64, box_h as u64);
    let (w, h) = if sw * bh <= bw * sh {
        // height-bound
        (sw * bh / sh, bh)
    } else {
        (bw, sh * bw / sw)
    };
    (even_floor(w as u32), even_floor(h as u32))
}
