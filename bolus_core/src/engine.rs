//! Dose calculator.
//!
//! Combines the correction term, meal term, fat/protein (Warsaw)
//! adjustment, active-insulin subtraction, exercise reduction, safety
//! rounding/capping and the dual-wave split decision into one auditable
//! recommendation. Every arithmetic step appends a line to `explain`.

use crate::{
    carbs, gate, AutosensRequest, BolusKind, BolusRequest, BolusResult, ClinicalParameters,
    Error, ExerciseIntensity, IOBCOBSnapshot, Result, SignalStatus, Suggestion, Warning,
};

/// Dose reduction per 30 minutes of planned exercise, by intensity
fn exercise_reduction_per_30min(intensity: ExerciseIntensity) -> f64 {
    match intensity {
        ExerciseIntensity::Low => 0.05,
        ExerciseIntensity::Moderate => 0.10,
        ExerciseIntensity::High => 0.15,
    }
}

/// Total exercise reduction is capped here
const EXERCISE_REDUCTION_CAP: f64 = 0.5;

/// Alcohol with a dual split pushes the reminder anchor out at least this far
const ALCOHOL_MIN_LATER_AFTER_MIN: f64 = 180.0;

/// One FPU is 100 kcal of fat/protein, dosed like this many grams of carbs
const FPU_KCAL: f64 = 100.0;
const FPU_CARB_EQUIVALENT_G: f64 = 10.0;

/// Calculate a bolus recommendation.
///
/// The snapshot must have passed the data quality gate, which this function
/// invokes first; a degraded unconfirmed signal surfaces as
/// [`Error::ConfirmRequired`] and no dose is computed.
pub fn calculate(
    request: &BolusRequest,
    params: &ClinicalParameters,
    snapshot: &IOBCOBSnapshot,
) -> Result<BolusResult> {
    validate_inputs(request, params)?;

    // Gate first: a blocked state never reaches the arithmetic below
    let gate_outcome = gate::evaluate(request, snapshot)?;

    let mut explain: Vec<String> = Vec::new();
    let mut warnings: Vec<Warning> = gate_outcome.warnings;
    let mut suggestion: Option<Suggestion> = None;

    // Autosens is only ever applied on explicit request
    let mut used = params.clone();
    if let Some(autosens) = &request.autosens {
        apply_autosens(autosens, &mut used, &mut explain, &mut suggestion)?;
    }

    // Step 1: correction term
    let correction_u = match request.bg_mgdl {
        Some(bg) => {
            let correction = ((bg - used.target_mgdl) / used.isf_mgdl_per_u).max(0.0);
            explain.push(format!(
                "Correction: max(0, ({:.0} - {:.0}) / {:.1}) = {:.2} U",
                bg, used.target_mgdl, used.isf_mgdl_per_u, correction
            ));
            correction
        }
        None => {
            if request.carbs_g <= 0.0 {
                return Err(Error::Validation(
                    "correction-only request requires a BG reading".into(),
                ));
            }
            explain.push("Correction: no BG reading, 0.00 U".into());
            0.0
        }
    };

    // Step 2: meal term
    let meal_u = request.carbs_g / used.cr_g_per_u;
    if request.carbs_g > 0.0 {
        explain.push(format!(
            "Meal: {:.0} g / {:.1} g/U = {:.2} U",
            request.carbs_g, used.cr_g_per_u, meal_u
        ));
    }

    // Step 3: fat/protein (Warsaw) adjustment
    let dual_requested = request
        .split
        .as_ref()
        .map(|s| s.enabled)
        .unwrap_or(false)
        && request.carbs_g > 0.0;

    let kcal = carbs::fat_protein_kcal(request.fat_g, request.protein_g);
    let warsaw_u = if kcal > used.warsaw_trigger_threshold_kcal {
        let factor = if dual_requested {
            used.warsaw_safety_factor_dual
        } else {
            used.warsaw_safety_factor
        };
        let fpu = kcal / FPU_KCAL;
        let extra = fpu * FPU_CARB_EQUIVALENT_G / used.cr_g_per_u * factor;
        explain.push(format!(
            "Fat/protein: {:.0} kcal = {:.1} FPU x {:.1} g/FPU / {:.1} g/U x {:.2} = {:.2} U",
            kcal, fpu, FPU_CARB_EQUIVALENT_G, used.cr_g_per_u, factor, extra
        ));
        warnings.push(Warning::advisory(format!(
            "High fat/protein load ({:.0} kcal): expect a delayed glucose rise",
            kcal
        )));
        extra
    } else {
        0.0
    };
    let meal_total_u = meal_u + warsaw_u;

    // Step 4: gross
    let gross_u = correction_u + meal_total_u;
    explain.push(format!("Gross: {:.2} U", gross_u));

    // Step 5: active insulin subtraction
    let iob_u = match snapshot.iob_status {
        SignalStatus::Unavailable => 0.0,
        _ => snapshot.iob_u,
    };
    let mut net_u = if request.ignore_iob {
        // Meal term is exempt; IOB still offsets any pure correction
        let correction_net = (correction_u - iob_u).max(0.0);
        explain.push(format!(
            "IOB {:.2} U ignored for meal term; correction reduced to {:.2} U",
            iob_u, correction_net
        ));
        meal_total_u + correction_net
    } else {
        let net = gross_u - iob_u;
        explain.push(format!(
            "Net after IOB: {:.2} - {:.2} = {:.2} U",
            gross_u, iob_u, net
        ));
        if net < 0.0 {
            warnings.push(Warning::advisory(
                "Active insulin exceeds the computed need; no dose recommended",
            ));
        }
        net
    };

    // Step 6: exercise reduction
    if let Some(exercise) = &request.exercise {
        if exercise.planned && exercise.minutes > 0.0 {
            let reduction = (exercise_reduction_per_30min(exercise.intensity)
                * exercise.minutes
                / 30.0)
                .min(EXERCISE_REDUCTION_CAP);
            let before = net_u;
            net_u *= 1.0 - reduction;
            explain.push(format!(
                "Exercise ({:?}, {:.0} min): -{:.0}%, {:.2} -> {:.2} U",
                exercise.intensity,
                exercise.minutes,
                reduction * 100.0,
                before,
                net_u
            ));
            warnings.push(Warning::advisory(
                "Dose reduced for planned exercise; monitor for lows during activity",
            ));
        }
    }

    // Step 7: clamp and round
    let clamped_u = net_u.clamp(0.0, used.max_bolus_u);
    if net_u > used.max_bolus_u {
        warnings.push(Warning::advisory(format!(
            "Computed dose {:.2} U capped at the {:.1} U maximum",
            net_u, used.max_bolus_u
        )));
    }
    let mut total_u = round_to_step(clamped_u, used.round_step_u);
    if total_u > used.max_bolus_u {
        total_u -= used.round_step_u;
    }
    explain.push(format!(
        "Final: clamp to [0, {:.1}] and round to {:.2} U steps = {:.2} U",
        used.max_bolus_u, used.round_step_u, total_u
    ));

    // Step 8: dual-wave split
    let mut kind = BolusKind::Normal;
    let mut upfront_u = total_u;
    let mut later_u = 0.0;
    let mut duration_min = None;
    let mut later_after_min = None;

    if dual_requested && total_u > 0.0 {
        let split = request.split.as_ref().unwrap();
        kind = BolusKind::Dual;
        upfront_u = round_to_step(total_u * split.percent_now / 100.0, used.round_step_u);
        later_u = total_u - upfront_u;
        duration_min = Some(split.duration_min);

        let mut anchor = split.later_after_min;
        if request.alcohol && anchor < ALCOHOL_MIN_LATER_AFTER_MIN {
            anchor = ALCOHOL_MIN_LATER_AFTER_MIN;
            warnings.push(Warning::advisory(format!(
                "Alcohol reported: second wave deferred to {:.0} min to cover delayed lows",
                anchor
            )));
        }
        later_after_min = Some(anchor);

        explain.push(format!(
            "Dual split {:.0}/{:.0}: {:.2} U now, {:.2} U over {:.0} min",
            split.percent_now,
            100.0 - split.percent_now,
            upfront_u,
            later_u,
            split.duration_min
        ));
    } else if request.alcohol {
        warnings.push(Warning::advisory(
            "Alcohol reported: watch for delayed hypoglycemia overnight",
        ));
    }

    tracing::info!(
        "Calculated bolus: {:?} total {:.2} U ({:.2} now / {:.2} later)",
        kind,
        total_u,
        upfront_u,
        later_u
    );

    Ok(BolusResult {
        kind,
        upfront_u,
        later_u,
        duration_min,
        later_after_min,
        total_u,
        explain,
        warnings,
        used_params: used,
        suggestion,
    })
}

fn validate_inputs(request: &BolusRequest, params: &ClinicalParameters) -> Result<()> {
    if params.cr_g_per_u <= 0.0 || !params.cr_g_per_u.is_finite() {
        return Err(Error::Validation(format!(
            "cr_g_per_u must be positive, got {}",
            params.cr_g_per_u
        )));
    }
    if params.isf_mgdl_per_u <= 0.0 || !params.isf_mgdl_per_u.is_finite() {
        return Err(Error::Validation(format!(
            "isf_mgdl_per_u must be positive, got {}",
            params.isf_mgdl_per_u
        )));
    }
    if params.round_step_u <= 0.0 {
        return Err(Error::Validation("round_step_u must be positive".into()));
    }
    if params.max_bolus_u <= 0.0 {
        return Err(Error::Validation("max_bolus_u must be positive".into()));
    }
    if params.dia_hours <= 0.0 {
        return Err(Error::Validation("dia_hours must be positive".into()));
    }
    if request.carbs_g < 0.0
        || request.fat_g < 0.0
        || request.protein_g < 0.0
        || request.fiber_g < 0.0
    {
        return Err(Error::Validation("macronutrients must be non-negative".into()));
    }
    if let Some(bg) = request.bg_mgdl {
        if bg <= 0.0 || !bg.is_finite() {
            return Err(Error::Validation(format!("bg_mgdl must be positive, got {}", bg)));
        }
    }
    if let Some(split) = &request.split {
        if split.enabled && !(0.0..=100.0).contains(&split.percent_now) {
            return Err(Error::Validation(format!(
                "split percent_now must be in [0, 100], got {}",
                split.percent_now
            )));
        }
    }
    Ok(())
}

fn apply_autosens(
    autosens: &AutosensRequest,
    used: &mut ClinicalParameters,
    explain: &mut Vec<String>,
    suggestion: &mut Option<Suggestion>,
) -> Result<()> {
    let ratio = autosens.autosens_ratio;
    if ratio <= 0.0 || !ratio.is_finite() {
        return Err(Error::Validation(format!(
            "autosens_ratio must be positive, got {}",
            ratio
        )));
    }

    used.isf_mgdl_per_u *= ratio;
    used.cr_g_per_u *= ratio;
    explain.push(format!(
        "Autosens x{:.2} ({}): ISF -> {:.1}, CR -> {:.1}",
        ratio, autosens.autosens_reason, used.isf_mgdl_per_u, used.cr_g_per_u
    ));
    *suggestion = Some(Suggestion {
        parameter: "sensitivity_ratio".into(),
        factor: ratio,
        reason: autosens.autosens_reason.clone(),
    });
    Ok(())
}

/// Round to the nearest multiple of `step`
fn round_to_step(value: f64, step: f64) -> f64 {
    (value / step).round() * step
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExercisePlan, SplitSettings};

    fn default_params() -> ClinicalParameters {
        ClinicalParameters {
            cr_g_per_u: 10.0,
            isf_mgdl_per_u: 50.0,
            target_mgdl: 100.0,
            dia_hours: 4.0,
            round_step_u: 0.5,
            max_bolus_u: 15.0,
            insulin_model: None,
            insulin_peak_minutes: None,
            warsaw_trigger_threshold_kcal: 100.0,
            warsaw_safety_factor: 0.5,
            warsaw_safety_factor_dual: 0.6,
        }
    }

    fn fresh_snapshot(iob_u: f64, cob_g: f64) -> IOBCOBSnapshot {
        IOBCOBSnapshot {
            iob_u,
            cob_g,
            iob_status: SignalStatus::Ok,
            cob_status: SignalStatus::Ok,
            breakdown: vec![],
            as_of: None,
        }
    }

    #[test]
    fn test_scenario_a_meal_plus_correction() {
        // BG=180, target=100, ISF=50, carbs=60, CR=10, IOB=0
        let request = BolusRequest {
            carbs_g: 60.0,
            bg_mgdl: Some(180.0),
            ..Default::default()
        };
        let result = calculate(&request, &default_params(), &fresh_snapshot(0.0, 0.0)).unwrap();

        // correction 1.6 + meal 6.0 = 7.6, rounded to 7.5
        assert_eq!(result.kind, BolusKind::Normal);
        assert!((result.total_u - 7.5).abs() < 1e-9);
        assert!((result.upfront_u - 7.5).abs() < 1e-9);
        assert_eq!(result.later_u, 0.0);
        assert!(!result.explain.is_empty());
    }

    #[test]
    fn test_scenario_b_iob_subtraction() {
        let request = BolusRequest {
            carbs_g: 60.0,
            bg_mgdl: Some(180.0),
            ..Default::default()
        };
        let result = calculate(&request, &default_params(), &fresh_snapshot(1.5, 0.0)).unwrap();

        // net 7.6 - 1.5 = 6.1, rounds to 6.0
        assert!((result.total_u - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_scenario_c_dual_split_with_fat_protein() {
        // carbs=80, fat=40, protein=30 -> 480 kcal, above threshold
        let request = BolusRequest {
            carbs_g: 80.0,
            bg_mgdl: Some(120.0),
            fat_g: 40.0,
            protein_g: 30.0,
            split: Some(SplitSettings {
                enabled: true,
                percent_now: 60.0,
                duration_min: 120.0,
                later_after_min: 90.0,
            }),
            ..Default::default()
        };
        let result = calculate(&request, &default_params(), &fresh_snapshot(0.0, 0.0)).unwrap();

        assert_eq!(result.kind, BolusKind::Dual);
        assert_eq!(result.duration_min, Some(120.0));
        // upfront ~60% of total, later the remainder, sum exact
        assert!((result.upfront_u + result.later_u - result.total_u).abs() < 1e-9);
        assert!((result.upfront_u / result.total_u - 0.6).abs() < 0.1);
        // Warsaw adjustment applied: meal term exceeds plain carbs/CR
        assert!(result.total_u > 80.0 / 10.0);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.message.contains("fat/protein")));
    }

    #[test]
    fn test_scenario_d_unavailable_iob_blocks() {
        let request = BolusRequest {
            carbs_g: 30.0,
            bg_mgdl: Some(140.0),
            ..Default::default()
        };
        let mut snapshot = fresh_snapshot(0.0, 0.0);
        snapshot.iob_status = SignalStatus::Unavailable;

        let err = calculate(&request, &default_params(), &snapshot).unwrap_err();
        assert_eq!(err.required_flag(), Some("confirm_iob_unknown"));
    }

    #[test]
    fn test_total_bounded_and_on_rounding_grid() {
        let params = default_params();
        for (carbs, bg, iob) in [
            (0.0, Some(400.0), 0.0),
            (150.0, Some(300.0), 0.5),
            (20.0, Some(80.0), 3.0),
            (45.0, None, 1.0),
        ] {
            let request = BolusRequest {
                carbs_g: carbs,
                bg_mgdl: bg,
                ..Default::default()
            };
            let result = calculate(&request, &params, &fresh_snapshot(iob, 0.0)).unwrap();
            assert!(result.total_u >= 0.0);
            assert!(result.total_u <= params.max_bolus_u + 1e-9);
            let steps = result.total_u / params.round_step_u;
            assert!(
                (steps - steps.round()).abs() < 1e-6,
                "total {} not on {} grid",
                result.total_u,
                params.round_step_u
            );
        }
    }

    #[test]
    fn test_iob_in_excess_yields_zero_dose() {
        let request = BolusRequest {
            carbs_g: 10.0,
            bg_mgdl: Some(110.0),
            ..Default::default()
        };
        let result = calculate(&request, &default_params(), &fresh_snapshot(8.0, 0.0)).unwrap();
        assert_eq!(result.total_u, 0.0);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.message.contains("Active insulin exceeds")));
    }

    #[test]
    fn test_ignore_iob_exempts_meal_term() {
        let request = BolusRequest {
            carbs_g: 30.0,
            bg_mgdl: Some(100.0),
            ignore_iob: true,
            ..Default::default()
        };
        let result = calculate(&request, &default_params(), &fresh_snapshot(2.0, 0.0)).unwrap();
        // Meal term 3.0 U untouched; correction is 0 so IOB has nothing to offset
        assert!((result.total_u - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_ignore_iob_still_offsets_correction() {
        let request = BolusRequest {
            carbs_g: 30.0,
            bg_mgdl: Some(200.0),
            ignore_iob: true,
            ..Default::default()
        };
        let result = calculate(&request, &default_params(), &fresh_snapshot(1.0, 0.0)).unwrap();
        // correction 2.0 - 1.0 IOB = 1.0, meal 3.0 -> 4.0
        assert!((result.total_u - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_correction_only_without_bg_is_validation_error() {
        let request = BolusRequest::default();
        let err = calculate(&request, &default_params(), &fresh_snapshot(0.0, 0.0)).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_zero_isf_is_validation_error() {
        let mut params = default_params();
        params.isf_mgdl_per_u = 0.0;
        let request = BolusRequest {
            carbs_g: 30.0,
            bg_mgdl: Some(150.0),
            ..Default::default()
        };
        let err = calculate(&request, &params, &fresh_snapshot(0.0, 0.0)).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_exercise_reduces_dose() {
        let base = BolusRequest {
            carbs_g: 60.0,
            bg_mgdl: Some(180.0),
            ..Default::default()
        };
        let with_exercise = BolusRequest {
            exercise: Some(ExercisePlan {
                planned: true,
                minutes: 60.0,
                intensity: ExerciseIntensity::Moderate,
            }),
            ..base.clone()
        };
        let plain = calculate(&base, &default_params(), &fresh_snapshot(0.0, 0.0)).unwrap();
        let reduced =
            calculate(&with_exercise, &default_params(), &fresh_snapshot(0.0, 0.0)).unwrap();
        assert!(reduced.total_u < plain.total_u);
    }

    #[test]
    fn test_exercise_reduction_capped() {
        // 10 hours of high intensity would exceed the cap; reduction stops at 50%
        let request = BolusRequest {
            carbs_g: 60.0,
            bg_mgdl: Some(180.0),
            exercise: Some(ExercisePlan {
                planned: true,
                minutes: 600.0,
                intensity: ExerciseIntensity::High,
            }),
            ..Default::default()
        };
        let result = calculate(&request, &default_params(), &fresh_snapshot(0.0, 0.0)).unwrap();
        // 7.6 * 0.5 = 3.8 -> rounds to 4.0
        assert!((result.total_u - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_autosens_emits_structured_suggestion() {
        let request = BolusRequest {
            carbs_g: 60.0,
            bg_mgdl: Some(180.0),
            autosens: Some(AutosensRequest {
                autosens_ratio: 1.2,
                autosens_reason: "overnight sensitivity trend".into(),
            }),
            ..Default::default()
        };
        let result = calculate(&request, &default_params(), &fresh_snapshot(0.0, 0.0)).unwrap();

        let suggestion = result.suggestion.expect("autosens should emit a suggestion");
        assert_eq!(suggestion.parameter, "sensitivity_ratio");
        assert!((suggestion.factor - 1.2).abs() < 1e-9);
        // Effective params echoed back post-adjustment
        assert!((result.used_params.isf_mgdl_per_u - 60.0).abs() < 1e-9);
        assert!((result.used_params.cr_g_per_u - 12.0).abs() < 1e-9);
        // More sensitive -> smaller dose than baseline 7.5
        assert!(result.total_u < 7.5);
    }

    #[test]
    fn test_autosens_never_applied_silently() {
        let request = BolusRequest {
            carbs_g: 60.0,
            bg_mgdl: Some(180.0),
            ..Default::default()
        };
        let result = calculate(&request, &default_params(), &fresh_snapshot(0.0, 0.0)).unwrap();
        assert!(result.suggestion.is_none());
        assert_eq!(result.used_params, default_params());
    }

    #[test]
    fn test_alcohol_with_dual_forces_later_anchor() {
        let request = BolusRequest {
            carbs_g: 60.0,
            bg_mgdl: Some(140.0),
            alcohol: true,
            split: Some(SplitSettings {
                enabled: true,
                percent_now: 50.0,
                duration_min: 120.0,
                later_after_min: 60.0,
            }),
            ..Default::default()
        };
        let result = calculate(&request, &default_params(), &fresh_snapshot(0.0, 0.0)).unwrap();
        assert_eq!(result.later_after_min, Some(180.0));
        assert!(result.warnings.iter().any(|w| w.message.contains("Alcohol")));
    }

    #[test]
    fn test_dual_needs_carbs() {
        // A pure correction never splits, even with split settings enabled
        let request = BolusRequest {
            carbs_g: 0.0,
            bg_mgdl: Some(250.0),
            split: Some(SplitSettings {
                enabled: true,
                percent_now: 50.0,
                duration_min: 120.0,
                later_after_min: 60.0,
            }),
            ..Default::default()
        };
        let result = calculate(&request, &default_params(), &fresh_snapshot(0.0, 0.0)).unwrap();
        assert_eq!(result.kind, BolusKind::Normal);
        assert_eq!(result.later_u, 0.0);
    }

    #[test]
    fn test_capped_at_max_bolus_with_warning() {
        let request = BolusRequest {
            carbs_g: 300.0,
            bg_mgdl: Some(300.0),
            ..Default::default()
        };
        let result = calculate(&request, &default_params(), &fresh_snapshot(0.0, 0.0)).unwrap();
        assert!((result.total_u - 15.0).abs() < 1e-9);
        assert!(result.warnings.iter().any(|w| w.message.contains("capped")));
    }
}
