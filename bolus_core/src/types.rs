//! Core domain types for the bolus advisor.
//!
//! This module defines the fundamental types used throughout the system:
//! - Clinical parameters (ISF, carb ratio, DIA, safety limits)
//! - Bolus calculation request/result DTOs
//! - IOB/COB snapshot read from the upstream data source
//! - Simulation events, parameters and results
//! - The persisted dual-bolus plan

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Clinical Parameters
// ============================================================================

/// Clinical dosing parameters in effect for one calculation.
///
/// Owned by the caller and passed by value; the core never mutates the
/// caller's copy. `BolusResult::used_params` carries the values actually
/// applied (post-autosens).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClinicalParameters {
    /// Grams of carbohydrate offset by one unit of insulin (ICR)
    pub cr_g_per_u: f64,
    /// mg/dL drop per unit of insulin (ISF)
    pub isf_mgdl_per_u: f64,
    /// Correction target in mg/dL
    pub target_mgdl: f64,
    /// Duration of insulin action in hours
    pub dia_hours: f64,
    /// Dose rounding step in units
    pub round_step_u: f64,
    /// Hard cap for a single recommendation in units
    pub max_bolus_u: f64,
    /// Insulin decay curve selection; defaults to linear when absent
    #[serde(default)]
    pub insulin_model: Option<InsulinModel>,
    /// Activity peak offset in minutes for peaked models
    #[serde(default)]
    pub insulin_peak_minutes: Option<f64>,
    /// Fat/protein caloric load above which the Warsaw adjustment triggers
    #[serde(default = "default_warsaw_trigger_kcal")]
    pub warsaw_trigger_threshold_kcal: f64,
    /// Warsaw safety factor for single-wave delivery
    #[serde(default = "default_warsaw_factor")]
    pub warsaw_safety_factor: f64,
    /// Warsaw safety factor for dual-wave delivery
    #[serde(default = "default_warsaw_factor_dual")]
    pub warsaw_safety_factor_dual: f64,
}

pub(crate) fn default_warsaw_trigger_kcal() -> f64 {
    100.0
}

pub(crate) fn default_warsaw_factor() -> f64 {
    0.5
}

pub(crate) fn default_warsaw_factor_dual() -> f64 {
    0.6
}

impl ClinicalParameters {
    /// DIA expressed in minutes
    pub fn dia_minutes(&self) -> f64 {
        self.dia_hours * 60.0
    }
}

/// Insulin decay curve selection
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InsulinModel {
    /// Straight-line IOB decay over DIA
    Linear,
    /// Triangular activity: ramp to peak, then linear decline
    Bilinear,
    /// Two-parameter exponential rapid-acting curve (fiasp-like)
    Exponential,
}

impl InsulinModel {
    /// Parse a model tag; unknown tags fall back to the linear curve
    pub fn from_tag(tag: &str) -> Self {
        match tag.to_lowercase().as_str() {
            "linear" => InsulinModel::Linear,
            "bilinear" => InsulinModel::Bilinear,
            "exponential" | "rapid" | "fiasp" => InsulinModel::Exponential,
            other => {
                tracing::warn!("Unknown insulin model tag '{}', falling back to linear", other);
                InsulinModel::Linear
            }
        }
    }
}

impl Default for InsulinModel {
    fn default() -> Self {
        InsulinModel::Linear
    }
}

// ============================================================================
// Bolus Request
// ============================================================================

/// Meal slot the calculation belongs to (selects slot-specific parameters)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MealSlot {
    Breakfast,
    Lunch,
    Dinner,
    Snack,
}

impl MealSlot {
    pub fn as_str(&self) -> &'static str {
        match self {
            MealSlot::Breakfast => "breakfast",
            MealSlot::Lunch => "lunch",
            MealSlot::Dinner => "dinner",
            MealSlot::Snack => "snack",
        }
    }
}

/// Planned exercise intensity
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExerciseIntensity {
    Low,
    Moderate,
    High,
}

/// Planned exercise descriptor
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExercisePlan {
    pub planned: bool,
    pub minutes: f64,
    pub intensity: ExerciseIntensity,
}

/// Explicit autosens adjustment requested by the caller
///
/// Never applied silently: the ratio only takes effect when this value is
/// present on the request, and the applied factor is echoed back as a
/// structured [`Suggestion`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AutosensRequest {
    /// Multiplicative sensitivity adjustment applied to ISF and ICR
    pub autosens_ratio: f64,
    pub autosens_reason: String,
}

/// Dual-wave split settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SplitSettings {
    pub enabled: bool,
    /// Percentage of the total delivered immediately (0-100)
    pub percent_now: f64,
    /// Length of the delayed wave in minutes
    pub duration_min: f64,
    /// Reminder anchor: minutes after the upfront dose to revisit the plan
    pub later_after_min: f64,
}

/// One dose calculation attempt. Ephemeral: built fresh per attempt, and the
/// confirmation flags it carries apply to exactly that attempt.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct BolusRequest {
    pub carbs_g: f64,
    pub bg_mgdl: Option<f64>,
    #[serde(default)]
    pub fat_g: f64,
    #[serde(default)]
    pub protein_g: f64,
    #[serde(default)]
    pub fiber_g: f64,
    pub meal_slot: Option<MealSlot>,
    /// Skip IOB subtraction for the meal term (micro-bolus corrections where
    /// active insulin belongs to an earlier, separate meal)
    #[serde(default)]
    pub ignore_iob: bool,
    #[serde(default)]
    pub alcohol: bool,
    pub exercise: Option<ExercisePlan>,
    pub autosens: Option<AutosensRequest>,
    pub split: Option<SplitSettings>,
    /// One-shot confirmations for degraded upstream data
    #[serde(default)]
    pub confirm_iob_stale: bool,
    #[serde(default)]
    pub confirm_iob_unknown: bool,
    #[serde(default)]
    pub confirm_cob_stale: bool,
    #[serde(default)]
    pub confirm_cob_unknown: bool,
}

// ============================================================================
// IOB/COB Snapshot
// ============================================================================

/// Freshness status of one upstream signal
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    Ok,
    Stale,
    Unavailable,
}

/// One still-active bolus reconstructed from treatment history, used to
/// rebuild individual insulin curves for simulation
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BolusBreakdownEntry {
    pub at: DateTime<Utc>,
    pub units: f64,
    /// Square-wave duration in minutes, if the bolus was extended
    pub duration_min: Option<f64>,
}

/// Point-in-time view of active insulin and carbs.
///
/// Fetched fresh per request and never cached beyond one computation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IOBCOBSnapshot {
    pub iob_u: f64,
    pub cob_g: f64,
    pub iob_status: SignalStatus,
    pub cob_status: SignalStatus,
    #[serde(default)]
    pub breakdown: Vec<BolusBreakdownEntry>,
    pub as_of: Option<DateTime<Utc>>,
}

impl IOBCOBSnapshot {
    /// Snapshot representing a source that could not be reached
    pub fn unavailable() -> Self {
        Self {
            iob_u: 0.0,
            cob_g: 0.0,
            iob_status: SignalStatus::Unavailable,
            cob_status: SignalStatus::Unavailable,
            breakdown: Vec::new(),
            as_of: None,
        }
    }
}

// ============================================================================
// Bolus Result
// ============================================================================

/// Delivery shape of the recommendation
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BolusKind {
    Normal,
    Dual,
}

/// Warning severity: advisory annotates the result, fatal blocks it
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Advisory,
    Fatal,
}

/// A safety-relevant deviation surfaced alongside the result
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Warning {
    pub severity: Severity,
    pub message: String,
}

impl Warning {
    pub fn advisory(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Advisory,
            message: message.into(),
        }
    }
}

/// Structured parameter-change suggestion emitted alongside `explain`,
/// never re-parsed from the human-readable text
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Suggestion {
    pub parameter: String,
    pub factor: f64,
    pub reason: String,
}

/// Outcome of a dose calculation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BolusResult {
    pub kind: BolusKind,
    pub upfront_u: f64,
    pub later_u: f64,
    /// Delayed-wave length in minutes (dual only)
    pub duration_min: Option<f64>,
    /// Reminder anchor for the delayed wave (dual only)
    pub later_after_min: Option<f64>,
    pub total_u: f64,
    /// One human-readable line per arithmetic step
    pub explain: Vec<String>,
    pub warnings: Vec<Warning>,
    /// Parameters actually applied (post-autosens)
    pub used_params: ClinicalParameters,
    pub suggestion: Option<Suggestion>,
}

// ============================================================================
// Simulation Types
// ============================================================================

/// Carbohydrate absorption speed class
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AbsorptionProfile {
    Fast,
    Medium,
    Slow,
}

/// Confidence in the chosen absorption profile
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AbsorptionConfidence {
    Low,
    Medium,
    High,
}

/// An insulin or carb event fed to the simulator.
///
/// Negative `time_offset_min` places the event in the past (still-active
/// history); zero or positive offsets are hypothetical future actions.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SimulationEvent {
    Bolus {
        time_offset_min: f64,
        units: f64,
        /// Square-wave delivery window; None for an instant bolus
        duration_min: Option<f64>,
    },
    Carb {
        time_offset_min: f64,
        grams: f64,
        profile: Option<AbsorptionProfile>,
        #[serde(default)]
        fat_g: f64,
        #[serde(default)]
        protein_g: f64,
        #[serde(default)]
        fiber_g: f64,
    },
}

/// BG trend direction reported by the glucose source
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Rising,
    Flat,
    Falling,
}

/// Caller-observed stability preconditions for basal-deficit neutrality.
/// Re-evaluated per simulation run, never a sticky global.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StabilityContext {
    pub bg_mgdl: f64,
    pub trend: TrendDirection,
    pub recent_insulin_u: f64,
    pub recent_carbs_g: f64,
    pub reference_basal_u_per_hr: f64,
}

/// Parameters for one simulation run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulationParams {
    pub isf_mgdl_per_u: f64,
    pub cr_g_per_u: f64,
    pub dia_minutes: f64,
    pub insulin_peak_minutes: Option<f64>,
    #[serde(default)]
    pub insulin_model: InsulinModel,
    pub carb_absorption_minutes: f64,
    pub target_bg_mgdl: f64,
    /// Physiological floor for the simulated trajectory
    #[serde(default = "default_bg_floor")]
    pub bg_floor_mgdl: f64,
    /// Background drift from under-delivered basal, in missing units/hour
    #[serde(default)]
    pub basal_deficit_u_per_hr: Option<f64>,
    /// Stability preconditions for suppressing the basal-deficit drift
    #[serde(default)]
    pub stability: Option<StabilityContext>,
}

pub(crate) fn default_bg_floor() -> f64 {
    20.0
}

/// One point of a simulated trajectory
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct SimPoint {
    pub t_min: f64,
    pub bg_mgdl: f64,
}

/// Per-step BG deltas from start, decomposed by source
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct SimComponents {
    pub t_min: f64,
    pub carb_delta_mgdl: f64,
    pub insulin_delta_mgdl: f64,
}

/// Reductions over the primary series
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct SimSummary {
    pub min_bg: f64,
    pub max_bg: f64,
    pub ending_bg: f64,
    pub time_to_min_minutes: f64,
}

/// Output of one simulation run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulationResult {
    pub series: Vec<SimPoint>,
    /// Same horizon with all not-yet-administered events removed
    pub baseline_series: Vec<SimPoint>,
    pub components: Vec<SimComponents>,
    pub summary: SimSummary,
    pub absorption_profile_used: Option<AbsorptionProfile>,
    pub absorption_confidence: Option<AbsorptionConfidence>,
    pub slow_absorption_active: bool,
    /// Whether the basal-deficit drift was suppressed this run
    pub basal_neutrality_applied: bool,
}

// ============================================================================
// Dual-Bolus Plan
// ============================================================================

/// The pending second wave of a confirmed dual bolus.
///
/// The only durable shared state in the system; persisted with single-writer
/// read-modify-write atomicity (see `dualwave`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DualBolusPlan {
    pub id: Uuid,
    pub later_u_planned: f64,
    pub duration_min: f64,
    pub later_after_min: f64,
    pub slot: Option<MealSlot>,
    pub created_at: DateTime<Utc>,
    pub administered: bool,
}

// ============================================================================
// Treatment Log
// ============================================================================

/// What a logged treatment delivered
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TreatmentKind {
    Normal,
    DualUpfront,
    DualLater,
}

/// One delivered insulin treatment, appended to the JSONL log
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TreatmentRecord {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub units_u: f64,
    pub kind: TreatmentKind,
    pub carbs_g: f64,
    pub note: Option<String>,
}
