//! Insulin action model.
//!
//! Given a past or hypothetical bolus, computes the remaining active
//! fraction and the instantaneous delivered-effect rate at any offset.
//! Three curves are supported:
//! - `linear`: straight-line IOB decay over DIA (default fallback)
//! - `bilinear`: triangular activity ramping to a peak, then declining
//! - `exponential`: two-parameter rapid-acting curve (peak + DIA)

use crate::{presets, Error, InsulinModel, Result};

/// Remaining fraction and effect rate for one bolus at one offset
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InsulinActivity {
    /// Fraction of the dose still active, in [0, 1]
    pub remaining_fraction: f64,
    /// Instantaneous delivered-effect rate in units/minute
    pub effect_rate_u_per_min: f64,
}

/// Evaluate one bolus at `minutes_since_delivery`.
///
/// Offsets before delivery (`minutes_since_delivery < 0`) mean the bolus has
/// not yet begun: the full dose remains and nothing is acting. At or beyond
/// DIA the dose is exhausted.
///
/// A non-positive `dia_minutes`, or a peak offset incompatible with the
/// selected curve, is a caller validation failure and returns a
/// `ComputationGuard` error rather than a silent zero.
pub fn activity(
    units: f64,
    minutes_since_delivery: f64,
    dia_minutes: f64,
    peak_minutes: Option<f64>,
    model: InsulinModel,
) -> Result<InsulinActivity> {
    if !dia_minutes.is_finite() || dia_minutes <= 0.0 {
        return Err(Error::ComputationGuard(format!(
            "dia_minutes must be positive, got {}",
            dia_minutes
        )));
    }
    if units < 0.0 {
        return Err(Error::ComputationGuard(format!(
            "bolus units must be non-negative, got {}",
            units
        )));
    }

    let t = minutes_since_delivery;

    // Not yet begun
    if t < 0.0 {
        return Ok(InsulinActivity {
            remaining_fraction: 1.0,
            effect_rate_u_per_min: 0.0,
        });
    }

    // Fully exhausted
    if t >= dia_minutes {
        return Ok(InsulinActivity {
            remaining_fraction: 0.0,
            effect_rate_u_per_min: 0.0,
        });
    }

    let (fraction, rate_per_unit) = match model {
        InsulinModel::Linear => linear_curve(t, dia_minutes),
        InsulinModel::Bilinear => {
            let peak = resolve_peak(model, peak_minutes, dia_minutes)?;
            bilinear_curve(t, dia_minutes, peak)
        }
        InsulinModel::Exponential => {
            let peak = resolve_peak(model, peak_minutes, dia_minutes)?;
            exponential_curve(t, dia_minutes, peak)
        }
    };

    Ok(InsulinActivity {
        remaining_fraction: fraction.clamp(0.0, 1.0),
        effect_rate_u_per_min: (rate_per_unit * units).max(0.0),
    })
}

/// Peak offset for peaked models, defaulting from the preset table
fn resolve_peak(model: InsulinModel, peak_minutes: Option<f64>, dia_minutes: f64) -> Result<f64> {
    let peak = peak_minutes
        .or_else(|| presets::default_peak_minutes(model))
        .ok_or_else(|| {
            Error::ComputationGuard(format!("model {:?} requires a peak offset", model))
        })?;

    if peak <= 0.0 || peak >= dia_minutes {
        return Err(Error::ComputationGuard(format!(
            "insulin_peak_minutes {} must lie inside (0, dia {})",
            peak, dia_minutes
        )));
    }
    // The exponential curve's time constant diverges as the peak approaches
    // half of DIA
    if model == InsulinModel::Exponential && peak >= dia_minutes / 2.0 {
        return Err(Error::ComputationGuard(format!(
            "exponential model requires insulin_peak_minutes {} < dia/2 ({})",
            peak,
            dia_minutes / 2.0
        )));
    }

    Ok(peak)
}

/// Straight-line decay: constant activity over DIA
fn linear_curve(t: f64, dia: f64) -> (f64, f64) {
    (1.0 - t / dia, 1.0 / dia)
}

/// Triangular activity: linear ramp to the peak, linear decline to DIA.
/// Area under the rate curve is normalised to one unit.
fn bilinear_curve(t: f64, dia: f64, peak: f64) -> (f64, f64) {
    let height = 2.0 / dia;
    if t <= peak {
        let rate = height * t / peak;
        let delivered = t * t / (dia * peak);
        (1.0 - delivered, rate)
    } else {
        let rate = height * (dia - t) / (dia - peak);
        let delivered = 1.0 - (dia - t) * (dia - t) / (dia * (dia - peak));
        (1.0 - delivered, rate)
    }
}

/// Two-parameter exponential rapid-acting curve.
///
/// tau = peak * (1 - peak/dia) / (1 - 2*peak/dia)
/// a   = 2 * tau / dia
/// S   = 1 / (1 - a + (1 + a) * exp(-dia/tau))
/// rate(t) = (S / tau^2) * t * (1 - t/dia) * exp(-t/tau)
fn exponential_curve(t: f64, dia: f64, peak: f64) -> (f64, f64) {
    let tau = peak * (1.0 - peak / dia) / (1.0 - 2.0 * peak / dia);
    let a = 2.0 * tau / dia;
    let s = 1.0 / (1.0 - a + (1.0 + a) * (-dia / tau).exp());

    let rate = (s / (tau * tau)) * t * (1.0 - t / dia) * (-t / tau).exp();

    let fraction = 1.0
        - s * (1.0 - a)
            * ((t * t / (tau * dia * (1.0 - a)) - t / tau - 1.0) * (-t / tau).exp() + 1.0);

    (fraction, rate)
}
