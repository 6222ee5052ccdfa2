//! Pure row filters over detection tables.
//!
//! Both filters return a new table and never mutate their input; an empty
//! input yields an empty output. Thresholds are inclusive on both ends.

use crate::detection::DetectionTable;

/// Retain rows whose confidence is at least `min_score`.
pub fn by_confidence(table: &DetectionTable, min_score: f32) -> DetectionTable {
    DetectionTable {
        rows: table
            .rows
            .iter()
            .filter(|d| d.confidence >= min_score)
            .cloned()
            .collect(),
        image_width: table.image_width,
        image_height: table.image_height,
    }
}

/// Retain rows whose box extent lies within `[min_size, max_size]`.
pub fn by_size(table: &DetectionTable, min_size: f32, max_size: f32) -> DetectionTable {
    DetectionTable {
        rows: table
            .rows
            .iter()
            .filter(|d| {
                let size = d.bbox.extent();
                min_size <= size && size <= max_size
            })
            .cloned()
            .collect(),
        image_width: table.image_width,
        image_height: table.image_height,
    }
}
