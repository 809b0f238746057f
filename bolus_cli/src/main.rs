use bolus_core::*;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "bolus")]
#[command(about = "Insulin bolus advisor and glucose forecast", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Override config file path
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Calculate a bolus recommendation
    Calc {
        /// Carbohydrates in grams
        #[arg(long, default_value_t = 0.0)]
        carbs: f64,

        /// Current blood glucose in mg/dL (read from the CGM file if omitted)
        #[arg(long)]
        bg: Option<f64>,

        #[arg(long, default_value_t = 0.0)]
        fat: f64,

        #[arg(long, default_value_t = 0.0)]
        protein: f64,

        #[arg(long, default_value_t = 0.0)]
        fiber: f64,

        /// Meal slot (breakfast, lunch, dinner, snack)
        #[arg(long)]
        slot: Option<String>,

        /// Split the dose into a dual wave
        #[arg(long)]
        split: bool,

        /// Percentage delivered immediately when splitting
        #[arg(long, default_value_t = 60.0)]
        percent_now: f64,

        /// Delayed-wave length in minutes when splitting
        #[arg(long, default_value_t = 120.0)]
        duration: f64,

        /// Minutes after the upfront dose to revisit the second wave
        #[arg(long, default_value_t = 90.0)]
        later_after: f64,

        /// Skip IOB subtraction for the meal term
        #[arg(long)]
        ignore_iob: bool,

        /// Alcohol with this meal
        #[arg(long)]
        alcohol: bool,

        /// Planned exercise duration in minutes
        #[arg(long)]
        exercise_minutes: Option<f64>,

        /// Planned exercise intensity (low, moderate, high)
        #[arg(long, default_value = "moderate")]
        exercise_intensity: String,

        /// Explicit autosens sensitivity ratio
        #[arg(long)]
        autosens_ratio: Option<f64>,

        /// Reason for the autosens adjustment
        #[arg(long, default_value = "manual adjustment")]
        autosens_reason: String,

        /// Proceed although IOB data is stale
        #[arg(long)]
        confirm_iob_stale: bool,

        /// Proceed although IOB data is unavailable
        #[arg(long)]
        confirm_iob_unknown: bool,

        /// Proceed although COB data is stale
        #[arg(long)]
        confirm_cob_stale: bool,

        /// Proceed although COB data is unavailable
        #[arg(long)]
        confirm_cob_unknown: bool,

        /// Record the recommendation as delivered (logs a treatment and,
        /// for a dual result, creates the second-wave plan)
        #[arg(long)]
        log: bool,
    },

    /// Simulate the BG trajectory for a set of events
    Simulate {
        /// Starting blood glucose in mg/dL
        #[arg(long)]
        start_bg: f64,

        /// Horizon in minutes
        #[arg(long, default_value_t = 240.0)]
        horizon: f64,

        /// JSON file with a list of simulation events
        #[arg(long)]
        events: Option<PathBuf>,

        /// Shortcut: one bolus of this many units at t=0
        #[arg(long)]
        bolus: Option<f64>,

        /// Shortcut: one carb intake of this many grams at t=0
        #[arg(long)]
        carbs: Option<f64>,
    },

    /// Manage the pending dual-bolus second wave
    Dual {
        #[command(subcommand)]
        action: DualAction,
    },

    /// Export the treatment log to CSV
    Export {
        /// Output path (defaults to treatments.csv in the data directory)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum DualAction {
    /// Show the pending plan
    Status,
    /// Recompute the remaining recommendation
    Recalc {
        /// Newly reported carbs in grams
        #[arg(long, default_value_t = 0.0)]
        extra_carbs: f64,

        /// Current blood glucose in mg/dL
        #[arg(long)]
        bg: Option<f64>,
    },
    /// Record the second wave as delivered and close the plan
    Administer {
        /// Units actually delivered
        #[arg(long)]
        amount: f64,
    },
    /// Discard the pending plan
    Cancel,
}

struct Paths {
    snapshot: PathBuf,
    bg: PathBuf,
    plan: PathBuf,
    treatments: PathBuf,
}

impl Paths {
    fn new(data_dir: &PathBuf) -> Self {
        Self {
            snapshot: data_dir.join("snapshot.json"),
            bg: data_dir.join("bg.json"),
            plan: data_dir.join("dual_plan.json"),
            treatments: data_dir.join("treatments.jsonl"),
        }
    }
}

fn main() -> Result<()> {
    bolus_core::logging::init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let data_dir = cli.data_dir.unwrap_or_else(|| config.data.data_dir.clone());
    std::fs::create_dir_all(&data_dir)?;
    let paths = Paths::new(&data_dir);

    match cli.command {
        Commands::Calc {
            carbs,
            bg,
            fat,
            protein,
            fiber,
            slot,
            split,
            percent_now,
            duration,
            later_after,
            ignore_iob,
            alcohol,
            exercise_minutes,
            exercise_intensity,
            autosens_ratio,
            autosens_reason,
            confirm_iob_stale,
            confirm_iob_unknown,
            confirm_cob_stale,
            confirm_cob_unknown,
            log,
        } => {
            let meal_slot = slot.as_deref().map(parse_slot).transpose()?;

            let bg_mgdl = match bg {
                Some(value) => Some(value),
                None => load_bg_reading(
                    &paths.bg,
                    Utc::now(),
                    config.simulation.snapshot_max_age_minutes,
                )?
                .map(|r| r.bg_mgdl),
            };

            let exercise = exercise_minutes.map(|minutes| -> Result<ExercisePlan> {
                Ok(ExercisePlan {
                    planned: true,
                    minutes,
                    intensity: parse_intensity(&exercise_intensity)?,
                })
            });
            let exercise = exercise.transpose()?;

            let request = BolusRequest {
                carbs_g: carbs,
                bg_mgdl,
                fat_g: fat,
                protein_g: protein,
                fiber_g: fiber,
                meal_slot,
                ignore_iob,
                alcohol,
                exercise,
                autosens: autosens_ratio.map(|ratio| AutosensRequest {
                    autosens_ratio: ratio,
                    autosens_reason: autosens_reason.clone(),
                }),
                split: split.then_some(SplitSettings {
                    enabled: true,
                    percent_now,
                    duration_min: duration,
                    later_after_min: later_after,
                }),
                confirm_iob_stale,
                confirm_iob_unknown,
                confirm_cob_stale,
                confirm_cob_unknown,
            };

            cmd_calc(&config, &paths, &request, log)
        }

        Commands::Simulate {
            start_bg,
            horizon,
            events,
            bolus,
            carbs,
        } => cmd_simulate(&config, start_bg, horizon, events, bolus, carbs),

        Commands::Dual { action } => cmd_dual(&config, &paths, action),

        Commands::Export { out } => {
            let out = out.unwrap_or_else(|| data_dir.join("treatments.csv"));
            let count = treatments::export_csv(&paths.treatments, &out)?;
            println!("✓ Exported {} treatments to {}", count, out.display());
            Ok(())
        }
    }
}

fn cmd_calc(config: &Config, paths: &Paths, request: &BolusRequest, log: bool) -> Result<()> {
    let params = config.params_for_slot(request.meal_slot);
    let snapshot = load_snapshot(
        &paths.snapshot,
        Utc::now(),
        config.simulation.snapshot_max_age_minutes,
    );

    let result = match calculate(request, &params, &snapshot) {
        Ok(result) => result,
        Err(err) => {
            if let Some(required_flag) = err.required_flag() {
                eprintln!("CONFIRM_REQUIRED: upstream data is degraded.");
                eprintln!(
                    "  Re-run with --{} to proceed.",
                    required_flag.replace('_', "-")
                );
            }
            return Err(err);
        }
    };

    display_result(&result);

    if !log {
        println!("\n[Recommendation only - use --log to record delivery]");
        return Ok(());
    }

    let now = Utc::now();
    let mut sink = JsonlTreatmentSink::new(&paths.treatments);

    let kind = match result.kind {
        BolusKind::Dual => TreatmentKind::DualUpfront,
        BolusKind::Normal => TreatmentKind::Normal,
    };
    sink.append(&TreatmentRecord {
        id: uuid::Uuid::new_v4(),
        at: now,
        units_u: result.upfront_u,
        kind,
        carbs_g: request.carbs_g,
        note: None,
    })?;
    println!("✓ Treatment logged ({:.2} U)", result.upfront_u);

    if let Some(plan) = plan_from_result(&result, request.meal_slot, now) {
        let store = PlanStore::new(&paths.plan);
        store.save(&plan)?;
        println!(
            "✓ Second wave planned: {:.2} U, revisit in {:.0} min",
            plan.later_u_planned, plan.later_after_min
        );
    }

    Ok(())
}

fn cmd_simulate(
    config: &Config,
    start_bg: f64,
    horizon: f64,
    events_file: Option<PathBuf>,
    bolus: Option<f64>,
    carbs: Option<f64>,
) -> Result<()> {
    let mut events: Vec<SimulationEvent> = match events_file {
        Some(path) => {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents)?
        }
        None => Vec::new(),
    };
    if let Some(units) = bolus {
        events.push(SimulationEvent::Bolus {
            time_offset_min: 0.0,
            units,
            duration_min: None,
        });
    }
    if let Some(grams) = carbs {
        events.push(SimulationEvent::Carb {
            time_offset_min: 0.0,
            grams,
            profile: None,
            fat_g: 0.0,
            protein_g: 0.0,
            fiber_g: 0.0,
        });
    }

    let params = config.params_for_slot(None);
    let sim_params = config.simulation_params(&params);
    let result = simulate(start_bg, horizon, &sim_params, &events)?;

    println!("\n╭─────────────────────────────────────────╮");
    println!("│  GLUCOSE FORECAST");
    println!("╰─────────────────────────────────────────╯");
    println!();
    println!("  {:>6}  {:>9}  {:>9}", "t_min", "forecast", "baseline");
    for (point, base) in result.series.iter().zip(result.baseline_series.iter()) {
        if point.t_min as i64 % 30 == 0 {
            println!(
                "  {:>6.0}  {:>9.0}  {:>9.0}",
                point.t_min, point.bg_mgdl, base.bg_mgdl
            );
        }
    }
    println!();
    println!(
        "  Min {:.0} mg/dL at {:.0} min, max {:.0}, ending {:.0}",
        result.summary.min_bg,
        result.summary.time_to_min_minutes,
        result.summary.max_bg,
        result.summary.ending_bg
    );
    if let Some(profile) = result.absorption_profile_used {
        println!(
            "  Absorption: {:?} (confidence {:?})",
            profile,
            result.absorption_confidence.unwrap_or(AbsorptionConfidence::Low)
        );
    }
    if result.basal_neutrality_applied {
        println!("  Basal-deficit drift suppressed (stable)");
    }
    println!();

    Ok(())
}

fn cmd_dual(config: &Config, paths: &Paths, action: DualAction) -> Result<()> {
    let store = PlanStore::new(&paths.plan);

    match action {
        DualAction::Status => match store.load()? {
            Some(plan) => {
                let elapsed = (Utc::now() - plan.created_at).num_minutes();
                println!("Pending second wave: {:.2} U", plan.later_u_planned);
                println!("  Created {} min ago, revisit after {:.0} min", elapsed, plan.later_after_min);
                Ok(())
            }
            None => {
                println!("No pending dual-bolus plan.");
                Ok(())
            }
        },

        DualAction::Recalc { extra_carbs, bg } => {
            let plan = store
                .load()?
                .ok_or_else(|| Error::State("no active dual-bolus plan".into()))?;

            let bg_mgdl = match bg {
                Some(value) => Some(value),
                None => load_bg_reading(
                    &paths.bg,
                    Utc::now(),
                    config.simulation.snapshot_max_age_minutes,
                )?
                .map(|r| r.bg_mgdl),
            };

            let params = config.params_for_slot(plan.slot);
            let out = recalc(&plan, extra_carbs, bg_mgdl, &params, Utc::now())?;

            for line in &out.explain {
                println!("  {}", line);
            }
            println!();
            if out.due {
                println!("Second wave is due: {:.2} U recommended", out.recommended_u);
            } else {
                println!(
                    "Second wave not yet due ({} of {:.0} min): {:.2} U if given now",
                    out.elapsed_min, plan.later_after_min, out.recommended_u
                );
            }
            Ok(())
        }

        DualAction::Administer { amount } => {
            let mut sink = JsonlTreatmentSink::new(&paths.treatments);
            let record = administer(&store, &mut sink, amount, Utc::now())?;
            println!("✓ Second wave recorded: {:.2} U", record.units_u);
            Ok(())
        }

        DualAction::Cancel => match cancel(&store)? {
            Some(plan) => {
                println!("✓ Cancelled plan ({:.2} U remaining)", plan.later_u_planned);
                Ok(())
            }
            None => {
                println!("No pending dual-bolus plan.");
                Ok(())
            }
        },
    }
}

fn display_result(result: &BolusResult) {
    println!("\n╭─────────────────────────────────────────╮");
    match result.kind {
        BolusKind::Normal => println!("│  BOLUS RECOMMENDATION"),
        BolusKind::Dual => println!("│  DUAL-WAVE BOLUS RECOMMENDATION"),
    }
    println!("╰─────────────────────────────────────────╯");
    println!();
    println!("  Total: {:.2} U", result.total_u);
    if result.kind == BolusKind::Dual {
        println!("  → Now: {:.2} U", result.upfront_u);
        println!(
            "  → Later: {:.2} U over {:.0} min",
            result.later_u,
            result.duration_min.unwrap_or(0.0)
        );
    }
    println!();
    for line in &result.explain {
        println!("  {}", line);
    }
    if let Some(suggestion) = &result.suggestion {
        println!();
        println!(
            "  ℹ Applied {} x{:.2} ({})",
            suggestion.parameter, suggestion.factor, suggestion.reason
        );
    }
    if !result.warnings.is_empty() {
        println!();
        for warning in &result.warnings {
            let marker = match warning.severity {
                Severity::Advisory => "⚠",
                Severity::Fatal => "✗",
            };
            println!("  {} {}", marker, warning.message);
        }
    }
}

fn parse_slot(s: &str) -> Result<MealSlot> {
    match s.to_lowercase().as_str() {
        "breakfast" => Ok(MealSlot::Breakfast),
        "lunch" => Ok(MealSlot::Lunch),
        "dinner" => Ok(MealSlot::Dinner),
        "snack" => Ok(MealSlot::Snack),
        other => Err(Error::Validation(format!("unknown meal slot: {}", other))),
    }
}

fn parse_intensity(s: &str) -> Result<ExerciseIntensity> {
    match s.to_lowercase().as_str() {
        "low" => Ok(ExerciseIntensity::Low),
        "moderate" => Ok(ExerciseIntensity::Moderate),
        "high" => Ok(ExerciseIntensity::High),
        other => Err(Error::Validation(format!(
            "unknown exercise intensity: {}",
            other
        ))),
    }
}
