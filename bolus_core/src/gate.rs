//! Data quality gate for IOB/COB inputs.
//!
//! Blocks a calculation when an upstream signal is stale or unavailable and
//! the caller has not explicitly confirmed degraded-data use. Confirmations
//! live on the ephemeral request, so they apply to exactly one attempt.

use crate::{BolusRequest, Error, IOBCOBSnapshot, Result, SignalStatus, Warning};

/// Outcome of a passed gate: advisory annotations for any signal the caller
/// confirmed through in a degraded state
#[derive(Clone, Debug, Default)]
pub struct GateOutcome {
    pub warnings: Vec<Warning>,
}

/// Evaluate snapshot freshness against the request's confirmation flags.
///
/// Returns `Error::ConfirmRequired` naming the exact flag to set when a
/// degraded signal is unconfirmed; otherwise returns advisory warnings for
/// each degraded-but-confirmed signal.
pub fn evaluate(request: &BolusRequest, snapshot: &IOBCOBSnapshot) -> Result<GateOutcome> {
    let mut outcome = GateOutcome::default();

    check_signal(
        "IOB",
        snapshot.iob_status,
        request.confirm_iob_stale,
        request.confirm_iob_unknown,
        "confirm_iob_stale",
        "confirm_iob_unknown",
        &mut outcome,
    )?;

    check_signal(
        "COB",
        snapshot.cob_status,
        request.confirm_cob_stale,
        request.confirm_cob_unknown,
        "confirm_cob_stale",
        "confirm_cob_unknown",
        &mut outcome,
    )?;

    Ok(outcome)
}

fn check_signal(
    name: &str,
    status: SignalStatus,
    confirmed_stale: bool,
    confirmed_unknown: bool,
    stale_flag: &'static str,
    unknown_flag: &'static str,
    outcome: &mut GateOutcome,
) -> Result<()> {
    match status {
        SignalStatus::Ok => Ok(()),
        SignalStatus::Stale => {
            if !confirmed_stale {
                tracing::info!("{} signal is stale and unconfirmed, blocking", name);
                return Err(Error::ConfirmRequired {
                    required_flag: stale_flag,
                });
            }
            outcome.warnings.push(Warning::advisory(format!(
                "{} data is stale; proceeding on caller confirmation",
                name
            )));
            Ok(())
        }
        SignalStatus::Unavailable => {
            if !confirmed_unknown {
                tracing::info!("{} signal is unavailable and unconfirmed, blocking", name);
                return Err(Error::ConfirmRequired {
                    required_flag: unknown_flag,
                });
            }
            outcome.warnings.push(Warning::advisory(format!(
                "{} data is unavailable; treating active {} as zero on caller confirmation",
                name,
                name.to_lowercase()
            )));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(iob: SignalStatus, cob: SignalStatus) -> IOBCOBSnapshot {
        IOBCOBSnapshot {
            iob_u: 1.0,
            cob_g: 10.0,
            iob_status: iob,
            cob_status: cob,
            breakdown: vec![],
            as_of: None,
        }
    }

    #[test]
    fn test_fresh_signals_pass() {
        let req = BolusRequest::default();
        let outcome = evaluate(&req, &snapshot(SignalStatus::Ok, SignalStatus::Ok)).unwrap();
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn test_unavailable_iob_names_unknown_flag() {
        let req = BolusRequest::default();
        let err = evaluate(&req, &snapshot(SignalStatus::Unavailable, SignalStatus::Ok))
            .unwrap_err();
        assert_eq!(err.required_flag(), Some("confirm_iob_unknown"));
    }

    #[test]
    fn test_stale_iob_names_stale_flag() {
        let req = BolusRequest::default();
        let err =
            evaluate(&req, &snapshot(SignalStatus::Stale, SignalStatus::Ok)).unwrap_err();
        assert_eq!(err.required_flag(), Some("confirm_iob_stale"));
    }

    #[test]
    fn test_stale_cob_names_cob_flag() {
        let req = BolusRequest::default();
        let err =
            evaluate(&req, &snapshot(SignalStatus::Ok, SignalStatus::Stale)).unwrap_err();
        assert_eq!(err.required_flag(), Some("confirm_cob_stale"));
    }

    #[test]
    fn test_confirmation_unblocks_with_advisory_warning() {
        let req = BolusRequest {
            confirm_iob_unknown: true,
            ..Default::default()
        };
        let outcome = evaluate(&req, &snapshot(SignalStatus::Unavailable, SignalStatus::Ok))
            .unwrap();
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.warnings[0].severity, crate::Severity::Advisory);
    }

    #[test]
    fn test_wrong_confirmation_still_blocks() {
        // Confirming staleness does not cover an unavailable signal
        let req = BolusRequest {
            confirm_iob_stale: true,
            ..Default::default()
        };
        let err = evaluate(&req, &snapshot(SignalStatus::Unavailable, SignalStatus::Ok))
            .unwrap_err();
        assert_eq!(err.required_flag(), Some("confirm_iob_unknown"));
    }

    #[test]
    fn test_iob_checked_before_cob() {
        let req = BolusRequest::default();
        let err = evaluate(
            &req,
            &snapshot(SignalStatus::Unavailable, SignalStatus::Unavailable),
        )
        .unwrap_err();
        assert_eq!(err.required_flag(), Some("confirm_iob_unknown"));
    }
}
