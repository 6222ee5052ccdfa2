//! Orchestration of inference, caching, filtering and rendering.
//!
//! Inference is by far the most expensive step, so its converted output
//! and the source image are cached in memory on the first count call and
//! reused for every later call on the same image; only the confidence and
//! size filters are re-applied when thresholds change.

use anyhow::{bail, Result};
use image::DynamicImage;
use log::{debug, info};
use std::path::{Path, PathBuf};

use crate::config::{CountOptions, SizePolicy, SET_SIZE_EVENT};
use crate::convert;
use crate::detection::DetectionTable;
use crate::engine::InferenceEngine;
use crate::filter;
use crate::overlay;

/// Detections and image held after a fresh inference.
#[derive(Debug)]
pub struct Scene {
    pub source: PathBuf,
    pub table: DetectionTable,
    pub image: DynamicImage,
}

/// Explicit cache state. `Empty` means no inference has run since
/// construction or the last `reset`; `Cached` holds the converted table
/// and the original image for one source path.
#[derive(Debug, Default)]
pub enum SessionState {
    #[default]
    Empty,
    Cached(Scene),
}

/// Counts and outlines objects in one microscopy image, caching raw
/// model output across repeated filter calls.
pub struct Segmenter<E> {
    engine: E,
    policy: SizePolicy,
    state: SessionState,
}

impl<E: InferenceEngine> Segmenter<E> {
    pub fn new(engine: E, policy: SizePolicy) -> Self {
        Self {
            engine,
            policy,
            state: SessionState::Empty,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_cached(&self) -> bool {
        matches!(self.state, SessionState::Cached(_))
    }

    /// Drop the cached detections and image. Must be called before
    /// counting a different image with the same segmenter.
    pub fn reset(&mut self) {
        if self.is_cached() {
            debug!("Dropping cached detections");
        }
        self.state = SessionState::Empty;
    }

    /// Adjust the size policy between calls (e.g. after the host's size
    /// controls move).
    pub fn policy_mut(&mut self) -> &mut SizePolicy {
        &mut self.policy
    }

    /// Count objects in the image at `image_path`.
    ///
    /// The first call for an image runs inference and caches the result;
    /// subsequent calls reuse the cache and only re-filter and re-render.
    /// Returns `None` when no detection survives the confidence and size
    /// filters, in which case no overlay file exists at the output path.
    pub fn count(
        &mut self,
        image_path: &Path,
        options: &CountOptions,
    ) -> Result<Option<DetectionTable>> {
        overlay::remove_stale_overlay(&options.overlay_path)?;

        self.ensure_cached(image_path, options)?;
        let scene = match &self.state {
            SessionState::Cached(scene) => scene,
            // ensure_cached either populated the cache or returned an error
            SessionState::Empty => bail!("inference produced no cached scene"),
        };

        let min_score = options
            .min_score
            .unwrap_or_else(|| self.engine.default_min_score());

        let confident = filter::by_confidence(&scene.table, min_score);
        let filtered = filter::by_size(&confident, self.policy.min_size, self.policy.max_size);
        debug!(
            "{} of {} detection(s) kept (min_score {min_score}, size [{}, {}])",
            filtered.len(),
            scene.table.len(),
            self.policy.min_size,
            self.policy.max_size
        );

        let Some(render_scene) = convert::table_to_overlay(&filtered, &scene.image) else {
            return Ok(None);
        };

        if options.render {
            overlay::render_overlay(
                &render_scene,
                self.policy.color_map,
                options.alpha,
                &options.overlay_path,
            )?;
        }

        Ok(Some(filtered))
    }

    fn ensure_cached(&mut self, image_path: &Path, options: &CountOptions) -> Result<()> {
        match &self.state {
            SessionState::Cached(scene) => {
                if scene.source != image_path {
                    bail!(
                        "cached detections belong to {}; call reset() before counting {}",
                        scene.source.display(),
                        image_path.display()
                    );
                }
                debug!("Reusing cached detections for {}", image_path.display());
                Ok(())
            }
            SessionState::Empty => {
                info!("Running inference on {}", image_path.display());
                let raw = self.engine.infer(image_path)?;
                let (table, image) = convert::raw_to_table(raw, options.store_bin_mask);

                // Full unfiltered box set, so the host can calibrate its
                // size-range controls.
                self.policy.emit(SET_SIZE_EVENT, &table.boxes());

                self.state = SessionState::Cached(Scene {
                    source: image_path.to_path_buf(),
                    table,
                    image,
                });
                Ok(())
            }
        }
    }
}
