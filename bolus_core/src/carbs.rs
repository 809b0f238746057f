//! Carbohydrate absorption model.
//!
//! Classifies a carb event into a fast/medium/slow absorption profile from
//! its macronutrient load, then releases glucose-equivalent mass along a
//! smooth rise-then-decay curve over a profile-stretched window. Fiber is
//! subtracted from the absorbed mass up front (net-carb convention).

use crate::{AbsorptionConfidence, AbsorptionProfile, Error, Result};

/// Carbs above this are treated as a slow, extended meal regardless of
/// macronutrients
const SLOW_CARBS_THRESHOLD_G: f64 = 60.0;
/// Below this fat/protein load (and below the carb bound) a meal absorbs fast
const FAST_KCAL_THRESHOLD: f64 = 30.0;
const FAST_CARBS_THRESHOLD_G: f64 = 30.0;

/// Absorption window stretch per profile
const SLOW_STRETCH: f64 = 1.5;
const FAST_STRETCH: f64 = 0.75;

/// Instantaneous absorption state for one carb event
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CarbAbsorption {
    /// Net grams not yet absorbed
    pub remaining_g: f64,
    /// Instantaneous glucose-equivalent release rate in grams/minute
    pub release_rate_g_per_min: f64,
    pub profile: AbsorptionProfile,
    pub confidence: AbsorptionConfidence,
}

/// Classify an absorption profile from grams and macronutrient load.
///
/// Returns the profile together with the confidence of the classification:
/// explicit profiles are High, classification with macronutrient data is
/// Medium, classification without any is Low.
pub fn classify(
    grams: f64,
    fat_g: f64,
    protein_g: f64,
    trigger_threshold_kcal: f64,
    explicit_profile: Option<AbsorptionProfile>,
) -> (AbsorptionProfile, AbsorptionConfidence) {
    if let Some(profile) = explicit_profile {
        return (profile, AbsorptionConfidence::High);
    }

    let kcal = fat_protein_kcal(fat_g, protein_g);
    let confidence = if fat_g > 0.0 || protein_g > 0.0 {
        AbsorptionConfidence::Medium
    } else {
        AbsorptionConfidence::Low
    };

    let profile = if kcal > trigger_threshold_kcal || grams >= SLOW_CARBS_THRESHOLD_G {
        AbsorptionProfile::Slow
    } else if kcal < FAST_KCAL_THRESHOLD && grams < FAST_CARBS_THRESHOLD_G {
        AbsorptionProfile::Fast
    } else {
        AbsorptionProfile::Medium
    };

    tracing::debug!(
        "Classified carb event: {}g carbs, {:.0} kcal fat/protein -> {:?} ({:?})",
        grams,
        kcal,
        profile,
        confidence
    );

    (profile, confidence)
}

/// Caloric load of the fat/protein portion of a meal
pub fn fat_protein_kcal(fat_g: f64, protein_g: f64) -> f64 {
    fat_g * 9.0 + protein_g * 4.0
}

/// Absorption window in minutes for a profile
pub fn stretched_window(base_absorption_minutes: f64, profile: AbsorptionProfile) -> f64 {
    match profile {
        AbsorptionProfile::Slow => base_absorption_minutes * SLOW_STRETCH,
        AbsorptionProfile::Medium => base_absorption_minutes,
        AbsorptionProfile::Fast => base_absorption_minutes * FAST_STRETCH,
    }
}

/// Evaluate one carb event at `minutes_elapsed` since it was eaten.
///
/// The release rate follows a parabolic rise-then-decay shape over the
/// stretched window `W`: rate(t) = 6·net·t·(W−t)/W³, which releases exactly
/// the net grams over [0, W]. Before the event nothing has been released;
/// past the window the event is exhausted.
pub fn absorb(
    grams: f64,
    fat_g: f64,
    protein_g: f64,
    fiber_g: f64,
    minutes_elapsed: f64,
    base_absorption_minutes: f64,
    trigger_threshold_kcal: f64,
    explicit_profile: Option<AbsorptionProfile>,
) -> Result<CarbAbsorption> {
    if !base_absorption_minutes.is_finite() || base_absorption_minutes <= 0.0 {
        return Err(Error::ComputationGuard(format!(
            "carb_absorption_minutes must be positive, got {}",
            base_absorption_minutes
        )));
    }
    if grams < 0.0 || fat_g < 0.0 || protein_g < 0.0 || fiber_g < 0.0 {
        return Err(Error::Validation(
            "carb event grams must be non-negative".into(),
        ));
    }

    let (profile, confidence) = classify(
        grams,
        fat_g,
        protein_g,
        trigger_threshold_kcal,
        explicit_profile,
    );

    // Fiber is not absorbed; never produces negative mass
    let net_g = (grams - fiber_g).max(0.0);
    let window = stretched_window(base_absorption_minutes, profile);
    let t = minutes_elapsed;

    let (remaining_g, release_rate_g_per_min) = if t < 0.0 {
        (net_g, 0.0)
    } else if t >= window {
        (0.0, 0.0)
    } else {
        let rate = 6.0 * net_g * t * (window - t) / (window * window * window);
        let released = net_g * (3.0 * t * t * window - 2.0 * t * t * t)
            / (window * window * window);
        ((net_g - released).max(0.0), rate)
    };

    Ok(CarbAbsorption {
        remaining_g,
        release_rate_g_per_min,
        profile,
        confidence,
    })
}
