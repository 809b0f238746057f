//! Forecast simulation engine.
//!
//! Time-steps a BG trajectory from a starting value plus historical and
//! hypothetical insulin/carb events. Produces the primary series, a
//! baseline series with future-dated events removed ("do nothing more"),
//! per-source component curves and summary statistics.

use crate::{
    carbs, insulin, types::default_warsaw_trigger_kcal, AbsorptionConfidence, AbsorptionProfile,
    Error, Result, SimComponents, SimPoint, SimSummary, SimulationEvent, SimulationParams,
    SimulationResult, StabilityContext, TrendDirection,
};

/// Fixed simulation step
pub const STEP_MINUTES: f64 = 5.0;

/// Stability band for basal-deficit neutrality
const NEUTRALITY_BG_MIN: f64 = 80.0;
const NEUTRALITY_BG_MAX: f64 = 180.0;
const NEUTRALITY_MAX_RECENT_INSULIN_U: f64 = 0.5;
const NEUTRALITY_MAX_RECENT_CARBS_G: f64 = 10.0;
const NEUTRALITY_MIN_REFERENCE_BASAL: f64 = 0.1;

/// One even slice of a (possibly square-wave) bolus
#[derive(Clone, Copy, Debug)]
struct BolusSlice {
    offset_min: f64,
    units: f64,
}

/// Run one forecast over `[0, horizon_minutes]`.
///
/// Deterministic: identical inputs always yield identical series.
pub fn simulate(
    start_bg: f64,
    horizon_minutes: f64,
    params: &SimulationParams,
    events: &[SimulationEvent],
) -> Result<SimulationResult> {
    validate(start_bg, horizon_minutes, params)?;

    let neutrality_applied = basal_neutrality_applies(params);
    let drift_mgdl_per_min = if neutrality_applied {
        0.0
    } else {
        params.basal_deficit_u_per_hr.unwrap_or(0.0) / 60.0 * params.isf_mgdl_per_u
    };

    let (series, components) =
        run_pass(start_bg, horizon_minutes, params, events, drift_mgdl_per_min)?;

    // Baseline: drop everything not yet administered
    let past_events: Vec<SimulationEvent> = events
        .iter()
        .filter(|e| event_offset(e) < 0.0)
        .cloned()
        .collect();
    let (baseline_series, _) = run_pass(
        start_bg,
        horizon_minutes,
        params,
        &past_events,
        drift_mgdl_per_min,
    )?;

    let summary = summarize(&series);
    let (absorption_profile_used, absorption_confidence) = dominant_profile(events);
    let slow_absorption_active = absorption_profile_used == Some(AbsorptionProfile::Slow);

    tracing::debug!(
        "Simulated {:.0} min horizon: min {:.0}, max {:.0}, ending {:.0} mg/dL",
        horizon_minutes,
        summary.min_bg,
        summary.max_bg,
        summary.ending_bg
    );

    Ok(SimulationResult {
        series,
        baseline_series,
        components,
        summary,
        absorption_profile_used,
        absorption_confidence,
        slow_absorption_active,
        basal_neutrality_applied: neutrality_applied,
    })
}

fn validate(start_bg: f64, horizon_minutes: f64, params: &SimulationParams) -> Result<()> {
    if start_bg <= 0.0 || !start_bg.is_finite() {
        return Err(Error::Validation(format!(
            "start_bg must be positive, got {}",
            start_bg
        )));
    }
    if horizon_minutes <= 0.0 || !horizon_minutes.is_finite() {
        return Err(Error::Validation(format!(
            "horizon_minutes must be positive, got {}",
            horizon_minutes
        )));
    }
    if params.isf_mgdl_per_u <= 0.0 {
        return Err(Error::ComputationGuard("isf must be positive".into()));
    }
    if params.cr_g_per_u <= 0.0 {
        return Err(Error::ComputationGuard("icr must be positive".into()));
    }
    if params.dia_minutes <= 0.0 {
        return Err(Error::ComputationGuard("dia_minutes must be positive".into()));
    }
    if params.carb_absorption_minutes <= 0.0 {
        return Err(Error::ComputationGuard(
            "carb_absorption_minutes must be positive".into(),
        ));
    }
    Ok(())
}

/// Whether the configured basal-deficit drift is suppressed for this run.
///
/// All preconditions must hold on the caller-supplied stability context:
/// BG inside a safe band, flat or falling trend, negligible recent insulin
/// and carbs, and a non-trivial reference basal rate. Evaluated per run.
pub fn basal_neutrality_applies(params: &SimulationParams) -> bool {
    let deficit = params.basal_deficit_u_per_hr.unwrap_or(0.0);
    if deficit == 0.0 {
        return false;
    }
    let Some(ctx) = &params.stability else {
        return false;
    };

    let stable = stability_holds(ctx);
    if stable {
        tracing::info!("Stable patient: suppressing basal-deficit drift for this run");
    }
    stable
}

fn stability_holds(ctx: &StabilityContext) -> bool {
    (NEUTRALITY_BG_MIN..=NEUTRALITY_BG_MAX).contains(&ctx.bg_mgdl)
        && ctx.trend != TrendDirection::Rising
        && ctx.recent_insulin_u < NEUTRALITY_MAX_RECENT_INSULIN_U
        && ctx.recent_carbs_g < NEUTRALITY_MAX_RECENT_CARBS_G
        && ctx.reference_basal_u_per_hr > NEUTRALITY_MIN_REFERENCE_BASAL
}

fn event_offset(event: &SimulationEvent) -> f64 {
    match event {
        SimulationEvent::Bolus { time_offset_min, .. } => *time_offset_min,
        SimulationEvent::Carb { time_offset_min, .. } => *time_offset_min,
    }
}

/// Square-wave boluses are split into even per-step slices before the
/// per-unit curve is applied to each slice
fn expand_bolus_slices(events: &[SimulationEvent]) -> Vec<BolusSlice> {
    let mut slices = Vec::new();
    for event in events {
        if let SimulationEvent::Bolus {
            time_offset_min,
            units,
            duration_min,
        } = event
        {
            match duration_min {
                Some(duration) if *duration > STEP_MINUTES => {
                    let n = (duration / STEP_MINUTES).ceil() as usize;
                    let per_slice = units / n as f64;
                    for i in 0..n {
                        slices.push(BolusSlice {
                            offset_min: time_offset_min + i as f64 * STEP_MINUTES,
                            units: per_slice,
                        });
                    }
                }
                _ => slices.push(BolusSlice {
                    offset_min: *time_offset_min,
                    units: *units,
                }),
            }
        }
    }
    slices
}

fn run_pass(
    start_bg: f64,
    horizon_minutes: f64,
    params: &SimulationParams,
    events: &[SimulationEvent],
    drift_mgdl_per_min: f64,
) -> Result<(Vec<SimPoint>, Vec<SimComponents>)> {
    let slices = expand_bolus_slices(events);
    let steps = (horizon_minutes / STEP_MINUTES).ceil() as usize;

    let mut series = Vec::with_capacity(steps + 1);
    let mut components = Vec::with_capacity(steps + 1);

    let mut bg = start_bg;
    let mut carb_delta = 0.0;
    let mut insulin_delta = 0.0;

    series.push(SimPoint {
        t_min: 0.0,
        bg_mgdl: bg,
    });
    components.push(SimComponents {
        t_min: 0.0,
        carb_delta_mgdl: 0.0,
        insulin_delta_mgdl: 0.0,
    });

    for k in 0..steps {
        let t = k as f64 * STEP_MINUTES;

        let mut insulin_rate_u_per_min = 0.0;
        for slice in &slices {
            let a = insulin::activity(
                slice.units,
                t - slice.offset_min,
                params.dia_minutes,
                params.insulin_peak_minutes,
                params.insulin_model,
            )?;
            insulin_rate_u_per_min += a.effect_rate_u_per_min;
        }

        let mut carb_rate_g_per_min = 0.0;
        for event in events {
            if let SimulationEvent::Carb {
                time_offset_min,
                grams,
                profile,
                fat_g,
                protein_g,
                fiber_g,
            } = event
            {
                let a = carbs::absorb(
                    *grams,
                    *fat_g,
                    *protein_g,
                    *fiber_g,
                    t - time_offset_min,
                    params.carb_absorption_minutes,
                    default_warsaw_trigger_kcal(),
                    *profile,
                )?;
                carb_rate_g_per_min += a.release_rate_g_per_min;
            }
        }

        // Carb grams convert to BG through ISF/ICR glucose equivalence
        let carb_step =
            carb_rate_g_per_min * params.isf_mgdl_per_u / params.cr_g_per_u * STEP_MINUTES;
        let insulin_step = -insulin_rate_u_per_min * params.isf_mgdl_per_u * STEP_MINUTES;
        let drift_step = drift_mgdl_per_min * STEP_MINUTES;

        carb_delta += carb_step;
        insulin_delta += insulin_step;
        bg = (bg + carb_step + insulin_step + drift_step).max(params.bg_floor_mgdl);

        let t_next = (k + 1) as f64 * STEP_MINUTES;
        series.push(SimPoint {
            t_min: t_next,
            bg_mgdl: bg,
        });
        components.push(SimComponents {
            t_min: t_next,
            carb_delta_mgdl: carb_delta,
            insulin_delta_mgdl: insulin_delta,
        });
    }

    Ok((series, components))
}

fn summarize(series: &[SimPoint]) -> SimSummary {
    let mut min_bg = f64::INFINITY;
    let mut max_bg = f64::NEG_INFINITY;
    let mut time_to_min = 0.0;
    for point in series {
        if point.bg_mgdl < min_bg {
            min_bg = point.bg_mgdl;
            time_to_min = point.t_min;
        }
        if point.bg_mgdl > max_bg {
            max_bg = point.bg_mgdl;
        }
    }
    SimSummary {
        min_bg,
        max_bg,
        ending_bg: series.last().map(|p| p.bg_mgdl).unwrap_or(0.0),
        time_to_min_minutes: time_to_min,
    }
}

/// Profile of the largest carb event drives the reported absorption class
fn dominant_profile(
    events: &[SimulationEvent],
) -> (Option<AbsorptionProfile>, Option<AbsorptionConfidence>) {
    let mut best: Option<(f64, AbsorptionProfile, AbsorptionConfidence)> = None;
    for event in events {
        if let SimulationEvent::Carb {
            grams,
            profile,
            fat_g,
            protein_g,
            ..
        } = event
        {
            let (p, c) = carbs::classify(
                *grams,
                *fat_g,
                *protein_g,
                default_warsaw_trigger_kcal(),
                *profile,
            );
            if best.map(|(g, _, _)| *grams > g).unwrap_or(true) {
                best = Some((*grams, p, c));
            }
        }
    }
    match best {
        Some((_, p, c)) => (Some(p), Some(c)),
        None => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InsulinModel;

    fn default_sim_params() -> SimulationParams {
        SimulationParams {
            isf_mgdl_per_u: 50.0,
            cr_g_per_u: 10.0,
            dia_minutes: 240.0,
            insulin_peak_minutes: None,
            insulin_model: InsulinModel::Linear,
            carb_absorption_minutes: 180.0,
            target_bg_mgdl: 100.0,
            bg_floor_mgdl: 20.0,
            basal_deficit_u_per_hr: None,
            stability: None,
        }
    }

    #[test]
    fn test_empty_events_hold_flat() {
        let result = simulate(120.0, 120.0, &default_sim_params(), &[]).unwrap();
        assert_eq!(result.series.len(), 25);
        for point in &result.series {
            assert!((point.bg_mgdl - 120.0).abs() < 1e-9);
        }
        assert!(result.absorption_profile_used.is_none());
    }

    #[test]
    fn test_deterministic() {
        let events = vec![
            SimulationEvent::Bolus {
                time_offset_min: 0.0,
                units: 3.0,
                duration_min: None,
            },
            SimulationEvent::Carb {
                time_offset_min: 0.0,
                grams: 45.0,
                profile: None,
                fat_g: 10.0,
                protein_g: 5.0,
                fiber_g: 0.0,
            },
        ];
        let a = simulate(130.0, 240.0, &default_sim_params(), &events).unwrap();
        let b = simulate(130.0, 240.0, &default_sim_params(), &events).unwrap();
        assert_eq!(a.series, b.series);
        assert_eq!(a.baseline_series, b.baseline_series);
        assert_eq!(a.components, b.components);
    }

    #[test]
    fn test_scenario_e_past_bolus_partial_action() {
        // 4U given 60 min ago, DIA 240: 75% remains on the linear curve.
        // The trajectory should fall by that remaining effect, no more.
        let events = vec![SimulationEvent::Bolus {
            time_offset_min: -60.0,
            units: 4.0,
            duration_min: None,
        }];
        let params = default_sim_params();
        let result = simulate(200.0, 240.0, &params, &events).unwrap();

        let full_drop = 4.0 * params.isf_mgdl_per_u;
        let expected_drop = 0.75 * full_drop;
        let actual_drop = 200.0 - result.summary.ending_bg;

        assert!(actual_drop > 0.0, "past bolus must still act");
        assert!(
            actual_drop < full_drop,
            "only the remaining fraction should act"
        );
        assert!(
            (actual_drop - expected_drop).abs() < 5.0,
            "drop {} should be near {}",
            actual_drop,
            expected_drop
        );
    }

    #[test]
    fn test_baseline_excludes_future_events() {
        let events = vec![
            SimulationEvent::Bolus {
                time_offset_min: -30.0,
                units: 1.0,
                duration_min: None,
            },
            SimulationEvent::Bolus {
                time_offset_min: 0.0,
                units: 5.0,
                duration_min: None,
            },
        ];
        let result = simulate(180.0, 240.0, &default_sim_params(), &events).unwrap();

        let primary_end = result.summary.ending_bg;
        let baseline_end = result.baseline_series.last().unwrap().bg_mgdl;
        // Without the hypothetical 5U the baseline ends much higher
        assert!(baseline_end > primary_end + 100.0);
    }

    #[test]
    fn test_components_decompose_the_series() {
        let events = vec![
            SimulationEvent::Bolus {
                time_offset_min: 0.0,
                units: 2.0,
                duration_min: None,
            },
            SimulationEvent::Carb {
                time_offset_min: 0.0,
                grams: 30.0,
                profile: Some(AbsorptionProfile::Medium),
                fat_g: 0.0,
                protein_g: 0.0,
                fiber_g: 0.0,
            },
        ];
        let result = simulate(150.0, 240.0, &default_sim_params(), &events).unwrap();

        // Away from the floor, bg(t) = start + carb_delta(t) + insulin_delta(t)
        for (point, comp) in result.series.iter().zip(result.components.iter()) {
            let reconstructed = 150.0 + comp.carb_delta_mgdl + comp.insulin_delta_mgdl;
            assert!(
                (point.bg_mgdl - reconstructed).abs() < 1e-6,
                "decomposition broke at t={}",
                point.t_min
            );
        }
    }

    #[test]
    fn test_square_wave_spreads_insulin_effect() {
        let instant = vec![SimulationEvent::Bolus {
            time_offset_min: 0.0,
            units: 4.0,
            duration_min: None,
        }];
        let square = vec![SimulationEvent::Bolus {
            time_offset_min: 0.0,
            units: 4.0,
            duration_min: Some(120.0),
        }];
        let params = default_sim_params();
        let a = simulate(200.0, 120.0, &params, &instant).unwrap();
        let b = simulate(200.0, 120.0, &params, &square).unwrap();

        // Early on the square wave has delivered less effect
        let mid = a.series.len() / 2;
        assert!(b.series[mid].bg_mgdl > a.series[mid].bg_mgdl);
    }

    #[test]
    fn test_physiological_floor() {
        let events = vec![SimulationEvent::Bolus {
            time_offset_min: 0.0,
            units: 20.0,
            duration_min: None,
        }];
        let result = simulate(80.0, 300.0, &default_sim_params(), &events).unwrap();
        for point in &result.series {
            assert!(point.bg_mgdl >= 20.0);
        }
        assert_eq!(result.summary.min_bg, 20.0);
    }

    #[test]
    fn test_summary_reductions() {
        let events = vec![SimulationEvent::Bolus {
            time_offset_min: 0.0,
            units: 2.0,
            duration_min: None,
        }];
        let result = simulate(180.0, 240.0, &default_sim_params(), &events).unwrap();
        assert_eq!(result.summary.max_bg, 180.0);
        assert!((result.summary.min_bg - 80.0).abs() < 1.0);
        assert_eq!(result.summary.ending_bg, result.series.last().unwrap().bg_mgdl);
        assert!(result.summary.time_to_min_minutes >= 235.0);
    }

    fn stable_ctx() -> StabilityContext {
        StabilityContext {
            bg_mgdl: 110.0,
            trend: TrendDirection::Flat,
            recent_insulin_u: 0.0,
            recent_carbs_g: 0.0,
            reference_basal_u_per_hr: 0.8,
        }
    }

    #[test]
    fn test_basal_neutrality_suppresses_drift_when_stable() {
        let mut params = default_sim_params();
        params.basal_deficit_u_per_hr = Some(0.5);
        params.stability = Some(stable_ctx());

        let result = simulate(110.0, 120.0, &params, &[]).unwrap();
        assert!(result.basal_neutrality_applied);
        // No artificial upward drift in a stable patient
        assert!((result.summary.ending_bg - 110.0).abs() < 1e-9);
    }

    #[test]
    fn test_basal_deficit_drifts_upward_when_not_stable() {
        let mut params = default_sim_params();
        params.basal_deficit_u_per_hr = Some(0.5);
        params.stability = Some(StabilityContext {
            trend: TrendDirection::Rising,
            ..stable_ctx()
        });

        let result = simulate(110.0, 120.0, &params, &[]).unwrap();
        assert!(!result.basal_neutrality_applied);
        // 0.5 U/h missing basal for 2 h at ISF 50 -> +50 mg/dL
        assert!((result.summary.ending_bg - 160.0).abs() < 1e-6);
    }

    #[test]
    fn test_neutrality_requires_reference_basal() {
        let mut params = default_sim_params();
        params.basal_deficit_u_per_hr = Some(0.5);
        params.stability = Some(StabilityContext {
            reference_basal_u_per_hr: 0.0,
            ..stable_ctx()
        });
        let result = simulate(110.0, 60.0, &params, &[]).unwrap();
        assert!(!result.basal_neutrality_applied);
    }

    #[test]
    fn test_slow_absorption_flag() {
        let events = vec![SimulationEvent::Carb {
            time_offset_min: 0.0,
            grams: 80.0,
            profile: None,
            fat_g: 30.0,
            protein_g: 20.0,
            fiber_g: 0.0,
        }];
        let result = simulate(120.0, 240.0, &default_sim_params(), &events).unwrap();
        assert_eq!(result.absorption_profile_used, Some(AbsorptionProfile::Slow));
        assert!(result.slow_absorption_active);
    }

    #[test]
    fn test_invalid_horizon_rejected() {
        let err = simulate(120.0, 0.0, &default_sim_params(), &[]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
