//! Dual-bolus session tracker.
//!
//! Persists the pending second-dose plan of a confirmed dual bolus, tracks
//! elapsed time, recomputes the remaining recommendation against new
//! information, and settles the plan (administer or cancel).
//!
//! The plan file is the only durable shared state in the system: it is read
//! by both the dual-wave page and the overview surface, so writes go through
//! file locking plus an atomic temp-file rename, and mutation happens only
//! via the read-modify-write [`PlanStore::update`] helper.

use crate::{
    treatments::TreatmentSink, BolusKind, BolusResult, ClinicalParameters, DualBolusPlan, Error,
    MealSlot, Result, TreatmentKind, TreatmentRecord,
};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use uuid::Uuid;

/// File-backed store for the (at most one) active dual-bolus plan
pub struct PlanStore {
    path: PathBuf,
}

impl PlanStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the active plan with shared locking.
    ///
    /// Returns None when no plan is pending. A corrupt plan file is treated
    /// as no plan, with a warning.
    pub fn load(&self) -> Result<Option<DualBolusPlan>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let file = File::open(&self.path)?;
        file.lock_shared()?;

        let mut contents = String::new();
        let mut reader = std::io::BufReader::new(&file);
        let read_result = reader.read_to_string(&mut contents);
        file.unlock()?;
        read_result?;

        match serde_json::from_str::<DualBolusPlan>(&contents) {
            Ok(plan) => Ok(Some(plan)),
            Err(e) => {
                tracing::warn!(
                    "Failed to parse plan file {:?}: {}. Treating as no active plan.",
                    self.path,
                    e
                );
                Ok(None)
            }
        }
    }

    /// Save a plan with exclusive locking and atomic rename
    pub fn save(&self, plan: &DualBolusPlan) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let temp = NamedTempFile::new_in(self.path.parent().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "plan path missing parent")
        })?)?;

        temp.as_file().lock_exclusive()?;

        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            let contents = serde_json::to_string(plan)?;
            writer.write_all(contents.as_bytes())?;
            writer.flush()?;
        }

        temp.as_file().sync_all()?;
        temp.as_file().unlock()?;

        temp.persist(&self.path).map_err(|e| Error::Io(e.error))?;

        tracing::debug!("Saved dual-bolus plan {} to {:?}", plan.id, self.path);
        Ok(())
    }

    /// Remove the plan file, returning the plan that was active
    pub fn clear(&self) -> Result<Option<DualBolusPlan>> {
        let plan = self.load()?;
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(plan)
    }

    /// Load the active plan, modify it, and save it back atomically
    pub fn update<F>(&self, f: F) -> Result<DualBolusPlan>
    where
        F: FnOnce(&mut DualBolusPlan) -> Result<()>,
    {
        let mut plan = self
            .load()?
            .ok_or_else(|| Error::State("no active dual-bolus plan".into()))?;
        f(&mut plan)?;
        self.save(&plan)?;
        Ok(plan)
    }
}

/// Build a plan from a confirmed dual calculation result.
///
/// Returns None for a normal (single-wave) result or one with no remainder.
pub fn plan_from_result(
    result: &BolusResult,
    slot: Option<MealSlot>,
    now: DateTime<Utc>,
) -> Option<DualBolusPlan> {
    if result.kind != BolusKind::Dual || result.later_u <= 0.0 {
        return None;
    }
    Some(DualBolusPlan {
        id: Uuid::new_v4(),
        later_u_planned: result.later_u,
        duration_min: result.duration_min.unwrap_or(0.0),
        later_after_min: result.later_after_min.unwrap_or(0.0),
        slot,
        created_at: now,
        administered: false,
    })
}

/// Outcome of re-checking a pending plan against new information
#[derive(Clone, Debug)]
pub struct DualRecalc {
    pub recommended_u: f64,
    pub elapsed_min: i64,
    pub due: bool,
    pub explain: Vec<String>,
}

/// Recompute the remaining recommended amount as if it were decided now.
///
/// A fresh correction (from `current_bg`) plus a meal term for any newly
/// reported carbs are added to the originally planned remainder, then
/// clamped and rounded with the usual safety rules. IOB is not re-subtracted
/// here: the upfront wave is the plan's own known insulin, accounted for at
/// plan creation.
pub fn recalc(
    plan: &DualBolusPlan,
    extra_carbs_g: f64,
    current_bg: Option<f64>,
    params: &ClinicalParameters,
    now: DateTime<Utc>,
) -> Result<DualRecalc> {
    if plan.administered {
        return Err(Error::State("plan has already been administered".into()));
    }
    if params.cr_g_per_u <= 0.0 || params.isf_mgdl_per_u <= 0.0 {
        return Err(Error::Validation("ISF and CR must be positive".into()));
    }
    if extra_carbs_g < 0.0 {
        return Err(Error::Validation("extra carbs must be non-negative".into()));
    }

    let elapsed_min = (now - plan.created_at).num_minutes();
    let mut explain = Vec::new();
    explain.push(format!(
        "Planned second wave: {:.2} U ({} min since the upfront dose)",
        plan.later_u_planned, elapsed_min
    ));

    let meal_u = extra_carbs_g / params.cr_g_per_u;
    if extra_carbs_g > 0.0 {
        explain.push(format!(
            "Extra carbs: {:.0} g / {:.1} g/U = {:.2} U",
            extra_carbs_g, params.cr_g_per_u, meal_u
        ));
    }

    let correction_u = match current_bg {
        Some(bg) => {
            let c = ((bg - params.target_mgdl) / params.isf_mgdl_per_u).max(0.0);
            explain.push(format!(
                "Correction at {:.0} mg/dL: {:.2} U",
                bg, c
            ));
            c
        }
        None => 0.0,
    };

    let raw = plan.later_u_planned + meal_u + correction_u;
    let clamped = raw.clamp(0.0, params.max_bolus_u);
    let recommended_u = (clamped / params.round_step_u).round() * params.round_step_u;
    explain.push(format!(
        "Recommended now: {:.2} U (clamped to [0, {:.1}], {:.2} U steps)",
        recommended_u, params.max_bolus_u, params.round_step_u
    ));

    let due = elapsed_min as f64 >= plan.later_after_min;

    Ok(DualRecalc {
        recommended_u,
        elapsed_min,
        due,
        explain,
    })
}

/// Finalize the plan: append exactly one treatment record and remove the
/// plan from active state.
pub fn administer(
    store: &PlanStore,
    sink: &mut dyn TreatmentSink,
    amount_u: f64,
    now: DateTime<Utc>,
) -> Result<TreatmentRecord> {
    if amount_u < 0.0 {
        return Err(Error::Validation("administered amount must be non-negative".into()));
    }

    let plan = store
        .load()?
        .ok_or_else(|| Error::State("no active dual-bolus plan".into()))?;
    if plan.administered {
        return Err(Error::State("plan has already been administered".into()));
    }

    let record = TreatmentRecord {
        id: Uuid::new_v4(),
        at: now,
        units_u: amount_u,
        kind: TreatmentKind::DualLater,
        carbs_g: 0.0,
        note: Some(format!("second wave of dual bolus {}", plan.id)),
    };
    sink.append(&record)?;
    store.clear()?;

    tracing::info!(
        "Administered second wave {:.2} U for plan {}",
        amount_u,
        plan.id
    );
    Ok(record)
}

/// Discard the plan with no side effects beyond removal
pub fn cancel(store: &PlanStore) -> Result<Option<DualBolusPlan>> {
    let plan = store.clear()?;
    if let Some(plan) = &plan {
        tracing::info!("Cancelled dual-bolus plan {}", plan.id);
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::treatments::{read_treatments, JsonlTreatmentSink};
    use chrono::Duration;

    fn test_params() -> ClinicalParameters {
        ClinicalParameters {
            cr_g_per_u: 10.0,
            isf_mgdl_per_u: 50.0,
            target_mgdl: 100.0,
            dia_hours: 4.0,
            round_step_u: 0.5,
            max_bolus_u: 10.0,
            insulin_model: None,
            insulin_peak_minutes: None,
            warsaw_trigger_threshold_kcal: 100.0,
            warsaw_safety_factor: 0.5,
            warsaw_safety_factor_dual: 0.6,
        }
    }

    fn test_plan(now: DateTime<Utc>) -> DualBolusPlan {
        DualBolusPlan {
            id: Uuid::new_v4(),
            later_u_planned: 3.0,
            duration_min: 120.0,
            later_after_min: 90.0,
            slot: Some(MealSlot::Dinner),
            created_at: now,
            administered: false,
        }
    }

    #[test]
    fn test_store_roundtrip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = PlanStore::new(temp_dir.path().join("dual_plan.json"));

        assert!(store.load().unwrap().is_none());

        let plan = test_plan(Utc::now());
        store.save(&plan).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, plan);
    }

    #[test]
    fn test_corrupt_plan_treated_as_none() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("dual_plan.json");
        std::fs::write(&path, "{ invalid json }").unwrap();

        let store = PlanStore::new(&path);
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_update_read_modify_write() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = PlanStore::new(temp_dir.path().join("dual_plan.json"));
        store.save(&test_plan(Utc::now())).unwrap();

        let updated = store
            .update(|plan| {
                plan.later_u_planned = 2.5;
                Ok(())
            })
            .unwrap();
        assert_eq!(updated.later_u_planned, 2.5);
        assert_eq!(store.load().unwrap().unwrap().later_u_planned, 2.5);
    }

    #[test]
    fn test_plan_from_dual_result() {
        let result = BolusResult {
            kind: BolusKind::Dual,
            upfront_u: 4.0,
            later_u: 2.5,
            duration_min: Some(120.0),
            later_after_min: Some(90.0),
            total_u: 6.5,
            explain: vec![],
            warnings: vec![],
            used_params: test_params(),
            suggestion: None,
        };
        let plan = plan_from_result(&result, Some(MealSlot::Lunch), Utc::now()).unwrap();
        assert_eq!(plan.later_u_planned, 2.5);
        assert!(!plan.administered);

        let normal = BolusResult {
            kind: BolusKind::Normal,
            later_u: 0.0,
            ..result
        };
        assert!(plan_from_result(&normal, None, Utc::now()).is_none());
    }

    #[test]
    fn test_recalc_plain_elapsed() {
        let created = Utc::now() - Duration::minutes(95);
        let plan = test_plan(created);

        let out = recalc(&plan, 0.0, None, &test_params(), Utc::now()).unwrap();
        assert_eq!(out.recommended_u, 3.0);
        assert!(out.elapsed_min >= 95);
        assert!(out.due);
    }

    #[test]
    fn test_recalc_with_extra_carbs_and_bg() {
        let created = Utc::now() - Duration::minutes(30);
        let plan = test_plan(created);

        // 3.0 planned + 20g/10 = 2.0 + correction (150-100)/50 = 1.0 -> 6.0
        let out = recalc(&plan, 20.0, Some(150.0), &test_params(), Utc::now()).unwrap();
        assert!((out.recommended_u - 6.0).abs() < 1e-9);
        assert!(!out.due);
        assert!(out.explain.len() >= 3);
    }

    #[test]
    fn test_recalc_clamps_to_max() {
        let plan = DualBolusPlan {
            later_u_planned: 8.0,
            ..test_plan(Utc::now())
        };
        let out = recalc(&plan, 60.0, Some(300.0), &test_params(), Utc::now()).unwrap();
        assert_eq!(out.recommended_u, 10.0);
    }

    #[test]
    fn test_administer_logs_exactly_one_record_and_clears() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = PlanStore::new(temp_dir.path().join("dual_plan.json"));
        let log_path = temp_dir.path().join("treatments.jsonl");
        let mut sink = JsonlTreatmentSink::new(&log_path);

        store.save(&test_plan(Utc::now())).unwrap();

        let record = administer(&store, &mut sink, 3.0, Utc::now()).unwrap();
        assert_eq!(record.kind, TreatmentKind::DualLater);
        assert_eq!(record.units_u, 3.0);

        // Exactly one record, and the plan is gone
        assert_eq!(read_treatments(&log_path).unwrap().len(), 1);
        assert!(store.load().unwrap().is_none());

        // A second administration has nothing to settle
        let err = administer(&store, &mut sink, 1.0, Utc::now()).unwrap_err();
        assert!(matches!(err, Error::State(_)));
        assert_eq!(read_treatments(&log_path).unwrap().len(), 1);
    }

    #[test]
    fn test_cancel_removes_without_logging() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = PlanStore::new(temp_dir.path().join("dual_plan.json"));
        let log_path = temp_dir.path().join("treatments.jsonl");

        store.save(&test_plan(Utc::now())).unwrap();
        let cancelled = cancel(&store).unwrap();
        assert!(cancelled.is_some());
        assert!(store.load().unwrap().is_none());
        assert!(read_treatments(&log_path).unwrap().is_empty());
    }
}
