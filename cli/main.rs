#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use env_logger::Env;
use std::path::PathBuf;
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

use rlt_stack::history::{DEFAULT_HISTORY_PATH, HISTORY_PATH_ENV};
use rlt_stack::schema::{PELVIS_INVASION_FEATURE, PELVIS_INVASION_MAX};
use rlt_stack::{
    FeatureGroup, FeatureMapping, HistoryStore, ModelProvider, ModelVariant, Outcome,
    ProvisioningConfig, TsvHistory, predict_and_record,
};

#[derive(Clone, Copy, ValueEnum)]
pub enum VariantCli {
    StandIn,
    Trained,
}

impl From<VariantCli> for ModelVariant {
    fn from(variant: VariantCli) -> Self {
        match variant {
            VariantCli::StandIn => ModelVariant::StandIn,
            VariantCli::Trained => ModelVariant::Trained,
        }
    }
}

#[derive(Args)]
pub struct GlobalArgs {
    /// Directory holding one model artifact per variant [default: $RLT_MODEL_DIR or "models"]
    #[arg(long, global = true, value_name = "DIR")]
    pub model_dir: Option<PathBuf>,

    /// Prediction history file [default: $RLT_HISTORY_PATH or "prediction_history.tsv"]
    #[arg(long, global = true, value_name = "PATH")]
    pub history: Option<PathBuf>,
}

impl GlobalArgs {
    fn provider(&self) -> ModelProvider {
        let config = match &self.model_dir {
            Some(dir) => ProvisioningConfig::with_model_dir(dir),
            None => ProvisioningConfig::from_env(),
        };
        ModelProvider::new(config)
    }

    fn history_store(&self) -> TsvHistory {
        let path = self.history.clone().unwrap_or_else(|| {
            std::env::var(HISTORY_PATH_ENV)
                .ok()
                .filter(|path| !path.trim().is_empty())
                .map_or_else(|| PathBuf::from(DEFAULT_HISTORY_PATH), PathBuf::from)
        });
        TsvHistory::new(path)
    }
}

#[derive(Args)]
pub struct PredictArgs {
    /// TOML file mapping every feature name to its value (see `rlt-stack schema`)
    #[arg(value_name = "FEATURES_TOML")]
    pub features: PathBuf,

    #[arg(long, value_enum, default_value_t = VariantCli::StandIn)]
    pub variant: VariantCli,

    /// Identifier stored with the history record
    #[arg(long)]
    pub patient_id: String,

    /// Clinician name stored with the history record
    #[arg(long, default_value = "")]
    pub username: String,
}

#[derive(Parser)]
#[command(
    name = "rlt-stack",
    about = "Stacked-ensemble benefit prediction for radioligand therapy",
    long_about = "Predicts whether a patient is expected to fully benefit from radioligand \
                 therapy from 14 clinical features, and keeps a history of past predictions."
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load or synthesize the model set of a variant
    #[command(about = "Provision a model variant (outputs: <model_dir>/<variant>.toml)")]
    Provision {
        #[arg(long, value_enum, default_value_t = VariantCli::StandIn)]
        variant: VariantCli,
    },

    /// Predict the outcome for one patient and record it
    #[command(about = "Predict benefit from a feature file and save it to the history")]
    Predict(PredictArgs),

    /// List past predictions, most recent first
    #[command(about = "List prediction history")]
    History {
        /// Only show predictions made by this user
        #[arg(long)]
        username: Option<String>,
    },

    /// Print one history record with its features
    #[command(about = "Show a single prediction record")]
    Show {
        #[arg(value_name = "ID")]
        id: u64,
    },

    /// Print a feature file template listing every feature
    #[command(about = "Print the feature catalog as a TOML template")]
    Schema,

    /// Display version and build information
    #[command(about = "Display version and build information")]
    Version,
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let Cli { global, command } = Cli::parse();

    let result = match command {
        Some(Commands::Provision { variant }) => run_provision(&global, variant.into()),
        Some(Commands::Predict(args)) => run_predict(&global, args),
        Some(Commands::History { username }) => run_history(&global, username.as_deref()),
        Some(Commands::Show { id }) => run_show(&global, id),
        Some(Commands::Schema) => {
            print_schema_template();
            Ok(())
        }
        Some(Commands::Version) => {
            print_version_info();
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error>),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run_provision(global: &GlobalArgs, variant: ModelVariant) -> Result<(), Box<dyn std::error::Error>> {
    let provider = global.provider();
    let models = provider.acquire(variant)?;

    println!(
        "Model set '{variant}' ready at {}",
        provider.config().artifact_path(variant).display()
    );
    for group in FeatureGroup::ALL {
        let learner = models.base_learner(group);
        println!(
            "  {:<12} {} ({} features)",
            group.label(),
            learner.name(),
            learner.n_features()
        );
    }
    println!("  {:<12} {}", "meta", models.meta().name());
    Ok(())
}

fn run_predict(global: &GlobalArgs, args: PredictArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("Loading features from: {}", args.features.display());
    let text = std::fs::read_to_string(&args.features)?;
    let mapping: FeatureMapping = toml::from_str(&text)?;

    let provider = global.provider();
    let models = provider.acquire(args.variant.into())?;
    let history = global.history_store();

    let recorded = predict_and_record(
        &mapping,
        &models,
        &history,
        &args.patient_id,
        &args.username,
    )?;
    let prediction = recorded.prediction;

    println!("Model variant: {}", prediction.variant);
    println!("Base probabilities of {}:", Outcome::POSITIVE);
    for group in FeatureGroup::ALL {
        println!("  {:<12} {:.4}", group.label(), prediction.base.get(group));
    }
    println!(
        "Prediction: {} (probability {:.1}%)",
        prediction.label,
        prediction.displayed_probability() * 100.0
    );

    match recorded.record {
        Ok(id) => println!("Saved to {} as record {id}", history.path().display()),
        Err(e) => eprintln!("Warning: the prediction was not saved to history: {e}"),
    }
    Ok(())
}

fn run_history(global: &GlobalArgs, username: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let history = global.history_store();
    let summaries = match username {
        Some(name) => history.list_by_user(name)?,
        None => history.list_all()?,
    };

    if summaries.is_empty() {
        println!("No predictions recorded in {}", history.path().display());
        return Ok(());
    }

    let now = unix_now();
    println!(
        "{:>5}  {:<20}  {:<16}  {:<16}  {:<22}  {:>9}  {}",
        "id", "recorded", "patient", "user", "result", "p(FBTP)", "model"
    );
    for summary in summaries {
        println!(
            "{:>5}  {:<20}  {:<16}  {:<16}  {:<22}  {:>9.4}  {}",
            summary.id,
            format_duration_ago(now.saturating_sub(summary.timestamp)),
            summary.patient_id,
            summary.username,
            summary.label,
            summary.probability,
            summary.variant
        );
    }
    Ok(())
}

fn run_show(global: &GlobalArgs, id: u64) -> Result<(), Box<dyn std::error::Error>> {
    let history = global.history_store();
    let record = history
        .get(rlt_stack::RecordId(id))?
        .ok_or_else(|| format!("No prediction with id {id} in {}", history.path().display()))?;

    println!("Record {}", record.id);
    println!("  Patient:     {}", record.patient_id);
    println!("  User:        {}", record.username);
    println!(
        "  Recorded:    {} (unix {})",
        format_duration_ago(unix_now().saturating_sub(record.timestamp)),
        record.timestamp
    );
    println!("  Model:       {}", record.variant);
    println!("  Result:      {}", record.label);
    println!("  p(FBTP):     {:.4}", record.probability);
    for group in FeatureGroup::ALL {
        println!("  {} features:", group.label());
        for name in group.names() {
            match record.features.get(*name) {
                Some(value) => println!("    {name:<40} {value}"),
                None => println!("    {name:<40} -"),
            }
        }
    }
    Ok(())
}

fn print_schema_template() {
    println!("# Feature file template: every feature is required.");
    for group in FeatureGroup::ALL {
        println!();
        let hint = match group {
            FeatureGroup::Continuous => "non-negative numbers",
            FeatureGroup::Discrete => "non-negative whole numbers",
            FeatureGroup::Binary => "0 or 1",
        };
        println!("# {} features ({hint})", group.label());
        for name in group.names() {
            let placeholder = match group {
                FeatureGroup::Continuous => "0.0",
                FeatureGroup::Discrete | FeatureGroup::Binary => "0",
            };
            if *name == PELVIS_INVASION_FEATURE {
                println!("{name:?} = {placeholder}  # at most {PELVIS_INVASION_MAX}");
            } else {
                println!("{name:?} = {placeholder}");
            }
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Format seconds into a human-readable duration like "2.4 hours ago"
fn format_duration_ago(seconds: u64) -> String {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;
    const WEEK: u64 = 7 * DAY;
    const MONTH: u64 = 30 * DAY;
    const YEAR: u64 = 365 * DAY;

    let scaled = |unit: u64, name: &str| format!("{:.1} {name} ago", seconds as f64 / unit as f64);
    if seconds < MINUTE {
        format!("{seconds} seconds ago")
    } else if seconds < HOUR {
        scaled(MINUTE, "minutes")
    } else if seconds < DAY {
        scaled(HOUR, "hours")
    } else if seconds < WEEK {
        scaled(DAY, "days")
    } else if seconds < MONTH {
        scaled(WEEK, "weeks")
    } else if seconds < YEAR {
        scaled(MONTH, "months")
    } else {
        scaled(YEAR, "years")
    }
}

fn print_version_info() {
    let version = env!("CARGO_PKG_VERSION");
    let build_timestamp: u64 = env!("RLT_BUILD_TIMESTAMP").parse().unwrap_or(0);

    println!("rlt-stack {version}");
    if build_timestamp > 0 {
        let now = unix_now();
        if now > build_timestamp {
            println!("Built: {}", format_duration_ago(now - build_timestamp));
        } else {
            println!("Built: just now");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration_ago_picks_unit() {
        assert_eq!(format_duration_ago(5), "5 seconds ago");
        assert_eq!(format_duration_ago(90), "1.5 minutes ago");
        assert_eq!(format_duration_ago(2 * 3600), "2.0 hours ago");
        assert_eq!(format_duration_ago(3 * 86_400), "3.0 days ago");
    }

    #[test]
    fn test_cli_parses_predict_invocation() {
        let cli = Cli::try_parse_from([
            "rlt-stack",
            "--model-dir",
            "/tmp/models",
            "predict",
            "patient.toml",
            "--variant",
            "trained",
            "--patient-id",
            "P-001",
        ])
        .unwrap();
        assert_eq!(cli.global.model_dir, Some(PathBuf::from("/tmp/models")));
        match cli.command {
            Some(Commands::Predict(args)) => {
                assert!(matches!(args.variant, VariantCli::Trained));
                assert_eq!(args.patient_id, "P-001");
                assert_eq!(args.username, "");
            }
            _ => panic!("expected predict subcommand"),
        }
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
