//! Built-in insulin model presets.
//!
//! Maps each decay curve to its default peak offset and DIA. Used when the
//! caller's clinical parameters leave `insulin_peak_minutes` unset.

use crate::InsulinModel;
use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Default curve parameters for one insulin model
#[derive(Clone, Copy, Debug)]
pub struct ModelPreset {
    /// Activity peak offset in minutes; None for non-peaked curves
    pub peak_minutes: Option<f64>,
    /// Default duration of insulin action in minutes
    pub default_dia_minutes: f64,
}

static PRESETS: Lazy<HashMap<InsulinModel, ModelPreset>> = Lazy::new(|| {
    let mut map = HashMap::new();

    map.insert(
        InsulinModel::Linear,
        ModelPreset {
            peak_minutes: None,
            default_dia_minutes: 240.0,
        },
    );

    map.insert(
        InsulinModel::Bilinear,
        ModelPreset {
            peak_minutes: Some(75.0),
            default_dia_minutes: 240.0,
        },
    );

    // Rapid-acting exponential curve peaks earlier
    map.insert(
        InsulinModel::Exponential,
        ModelPreset {
            peak_minutes: Some(55.0),
            default_dia_minutes: 240.0,
        },
    );

    map
});

/// Look up the preset for a model
pub fn preset(model: InsulinModel) -> ModelPreset {
    // Every variant is inserted above
    PRESETS[&model]
}

/// Default peak offset for a model, when the caller supplied none
pub fn default_peak_minutes(model: InsulinModel) -> Option<f64> {
    preset(model).peak_minutes
}
