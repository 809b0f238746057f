//! Configuration file support for the bolus advisor.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/bolus/config.toml`.
//! This is the single normalization point for clinical parameters: slot
//! overrides and defaults are resolved here into one canonical
//! [`ClinicalParameters`] value, so the core never does ad-hoc lookups.

use crate::{ClinicalParameters, Error, InsulinModel, MealSlot, Result, SimulationParams};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub therapy: TherapyConfig,

    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Base clinical parameters plus per-meal-slot overrides
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TherapyConfig {
    #[serde(default = "default_cr")]
    pub cr_g_per_u: f64,

    #[serde(default = "default_isf")]
    pub isf_mgdl_per_u: f64,

    #[serde(default = "default_target")]
    pub target_mgdl: f64,

    #[serde(default = "default_dia_hours")]
    pub dia_hours: f64,

    #[serde(default = "default_round_step")]
    pub round_step_u: f64,

    #[serde(default = "default_max_bolus")]
    pub max_bolus_u: f64,

    #[serde(default = "default_insulin_model")]
    pub insulin_model: String,

    #[serde(default)]
    pub insulin_peak_minutes: Option<f64>,

    #[serde(default = "crate::types::default_warsaw_trigger_kcal")]
    pub warsaw_trigger_threshold_kcal: f64,

    #[serde(default = "crate::types::default_warsaw_factor")]
    pub warsaw_safety_factor: f64,

    #[serde(default = "crate::types::default_warsaw_factor_dual")]
    pub warsaw_safety_factor_dual: f64,

    /// Per-slot overrides keyed by slot name (breakfast, lunch, ...)
    #[serde(default)]
    pub slots: HashMap<String, SlotOverride>,
}

/// Slot-specific overrides of the base therapy values
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct SlotOverride {
    pub cr_g_per_u: Option<f64>,
    pub isf_mgdl_per_u: Option<f64>,
    pub target_mgdl: Option<f64>,
}

impl Default for TherapyConfig {
    fn default() -> Self {
        Self {
            cr_g_per_u: default_cr(),
            isf_mgdl_per_u: default_isf(),
            target_mgdl: default_target(),
            dia_hours: default_dia_hours(),
            round_step_u: default_round_step(),
            max_bolus_u: default_max_bolus(),
            insulin_model: default_insulin_model(),
            insulin_peak_minutes: None,
            warsaw_trigger_threshold_kcal: crate::types::default_warsaw_trigger_kcal(),
            warsaw_safety_factor: crate::types::default_warsaw_factor(),
            warsaw_safety_factor_dual: crate::types::default_warsaw_factor_dual(),
            slots: HashMap::new(),
        }
    }
}

/// Forecast defaults
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_horizon_minutes")]
    pub horizon_minutes: f64,

    #[serde(default = "default_carb_absorption_minutes")]
    pub carb_absorption_minutes: f64,

    #[serde(default = "crate::types::default_bg_floor")]
    pub bg_floor_mgdl: f64,

    #[serde(default)]
    pub basal_deficit_u_per_hr: Option<f64>,

    #[serde(default = "default_snapshot_max_age")]
    pub snapshot_max_age_minutes: i64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            horizon_minutes: default_horizon_minutes(),
            carb_absorption_minutes: default_carb_absorption_minutes(),
            bg_floor_mgdl: crate::types::default_bg_floor(),
            basal_deficit_u_per_hr: None,
            snapshot_max_age_minutes: default_snapshot_max_age(),
        }
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| {
        let home = std::env::var("HOME").expect("HOME environment variable not set");
        PathBuf::from(home).join(".local/share")
    });
    base.join("bolus")
}

fn default_cr() -> f64 {
    10.0
}

fn default_isf() -> f64 {
    50.0
}

fn default_target() -> f64 {
    100.0
}

fn default_dia_hours() -> f64 {
    4.0
}

fn default_round_step() -> f64 {
    0.5
}

fn default_max_bolus() -> f64 {
    10.0
}

fn default_insulin_model() -> String {
    "linear".into()
}

fn default_horizon_minutes() -> f64 {
    240.0
}

fn default_carb_absorption_minutes() -> f64 {
    180.0
}

fn default_snapshot_max_age() -> i64 {
    15
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| {
            let home = std::env::var("HOME").expect("HOME environment variable not set");
            PathBuf::from(home).join(".config")
        });
        base.join("bolus").join("config.toml")
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Reject configurations a dose calculation could not safely use
    pub fn validate(&self) -> Result<()> {
        let t = &self.therapy;
        for (name, value) in [
            ("cr_g_per_u", t.cr_g_per_u),
            ("isf_mgdl_per_u", t.isf_mgdl_per_u),
            ("target_mgdl", t.target_mgdl),
            ("dia_hours", t.dia_hours),
            ("round_step_u", t.round_step_u),
            ("max_bolus_u", t.max_bolus_u),
        ] {
            if value <= 0.0 || !value.is_finite() {
                return Err(Error::Config(format!(
                    "therapy.{} must be positive, got {}",
                    name, value
                )));
            }
        }
        for (slot, over) in &t.slots {
            for (name, value) in [
                ("cr_g_per_u", over.cr_g_per_u),
                ("isf_mgdl_per_u", over.isf_mgdl_per_u),
                ("target_mgdl", over.target_mgdl),
            ] {
                if let Some(v) = value {
                    if v <= 0.0 || !v.is_finite() {
                        return Err(Error::Config(format!(
                            "slots.{}.{} must be positive, got {}",
                            slot, name, v
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolve the canonical clinical parameters for a meal slot.
    ///
    /// Slot overrides win over base values; everything downstream works from
    /// the returned struct only.
    pub fn params_for_slot(&self, slot: Option<MealSlot>) -> ClinicalParameters {
        let t = &self.therapy;
        let over = slot
            .and_then(|s| t.slots.get(s.as_str()))
            .cloned()
            .unwrap_or_default();

        ClinicalParameters {
            cr_g_per_u: over.cr_g_per_u.unwrap_or(t.cr_g_per_u),
            isf_mgdl_per_u: over.isf_mgdl_per_u.unwrap_or(t.isf_mgdl_per_u),
            target_mgdl: over.target_mgdl.unwrap_or(t.target_mgdl),
            dia_hours: t.dia_hours,
            round_step_u: t.round_step_u,
            max_bolus_u: t.max_bolus_u,
            insulin_model: Some(InsulinModel::from_tag(&t.insulin_model)),
            insulin_peak_minutes: t.insulin_peak_minutes,
            warsaw_trigger_threshold_kcal: t.warsaw_trigger_threshold_kcal,
            warsaw_safety_factor: t.warsaw_safety_factor,
            warsaw_safety_factor_dual: t.warsaw_safety_factor_dual,
        }
    }

    /// Build simulation parameters from resolved clinical parameters
    pub fn simulation_params(&self, params: &ClinicalParameters) -> SimulationParams {
        SimulationParams {
            isf_mgdl_per_u: params.isf_mgdl_per_u,
            cr_g_per_u: params.cr_g_per_u,
            dia_minutes: params.dia_minutes(),
            insulin_peak_minutes: params.insulin_peak_minutes,
            insulin_model: params.insulin_model.unwrap_or_default(),
            carb_absorption_minutes: self.simulation.carb_absorption_minutes,
            target_bg_mgdl: params.target_mgdl,
            bg_floor_mgdl: self.simulation.bg_floor_mgdl,
            basal_deficit_u_per_hr: self.simulation.basal_deficit_u_per_hr,
            stability: None,
        }
    }
}
