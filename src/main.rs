// ========================================================================================
//
//                      THE COMMAND-LINE FRONT END: GSC
//
// ========================================================================================
//
// Loads a long-format panel from CSV/TSV, runs the alternating synthetic-control
// estimator, and optionally tests a linear restriction with the sign-flip
// bootstrap. A `simulate` subcommand writes factor-model panels for experiments.

#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use ndarray::Array1;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process;

use gsc::fixed_effects::two_way_fixed_effects;
use gsc::inference::bootstrap::FlipScheme;
use gsc::inference::{WaldConfig, wald_test};
use gsc::panel::load_panel;
use gsc::simulate::FactorModelDesign;
use gsc::{
    EstimationMethod, Estimator, EstimatorConfig, EstimatorResult, Panel, PanelSpec, Restriction,
    WeightConstraint,
};

#[derive(Clone, Copy, ValueEnum)]
enum MethodCli {
    #[value(name = "onestep")]
    OneStep,
    #[value(name = "twostep.aggte")]
    TwoStepAggregate,
    #[value(name = "twostep.indiv")]
    TwoStepIndividual,
}

impl From<MethodCli> for EstimationMethod {
    fn from(method: MethodCli) -> Self {
        match method {
            MethodCli::OneStep => EstimationMethod::OneStep,
            MethodCli::TwoStepAggregate => EstimationMethod::TwoStepAggregate,
            MethodCli::TwoStepIndividual => EstimationMethod::TwoStepIndividual,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum SchemeCli {
    Unit,
    Observation,
}

impl From<SchemeCli> for FlipScheme {
    fn from(scheme: SchemeCli) -> Self {
        match scheme {
            SchemeCli::Unit => FlipScheme::Unit,
            SchemeCli::Observation => FlipScheme::Observation,
        }
    }
}

#[derive(Args)]
struct PanelArgs {
    /// Long-format panel (CSV, or TSV when the file ends in .tsv)
    #[arg(value_name = "DATA")]
    data: PathBuf,

    /// Unit identifier column
    #[arg(long, default_value = "unit")]
    unit: String,

    /// Time identifier column
    #[arg(long, default_value = "time")]
    time: String,

    /// Outcome column
    #[arg(long, default_value = "y")]
    outcome: String,

    /// Comma-separated treatment columns
    #[arg(long, value_delimiter = ',', required = true)]
    treatments: Vec<String>,

    /// Comma-separated covariate columns
    #[arg(long, value_delimiter = ',')]
    covariates: Vec<String>,
}

#[derive(Args)]
struct EstimationArgs {
    /// Estimator variant
    #[arg(long, value_enum, default_value_t = MethodCli::OneStep)]
    method: MethodCli,

    /// TOML file with estimator settings; flags below override it
    #[arg(long, value_name = "PATH")]
    config: Option<String>,

    /// Convergence tolerance on the largest change in b and W
    #[arg(long)]
    tolerance: Option<f64>,

    /// Maximum number of alternating iterations
    #[arg(long)]
    max_iterations: Option<usize>,

    /// Constrain weights to be nonnegative
    #[arg(long)]
    nonnegative: bool,

    /// Treat optimizer non-convergence as an error
    #[arg(long)]
    fatal_divergence: bool,

    /// Comma-separated starting coefficients (default: two-way fixed effects)
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    b_init: Option<Vec<f64>>,
}

#[derive(Parser)]
#[command(
    name = "gsc",
    about = "Generalized synthetic control estimation for panel data",
    long_about = "Estimates treatment coefficients jointly with per-unit synthetic control \
                 weights, and tests restrictions on them with a sign-flip bootstrap Wald test."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Estimate treatment coefficients and synthetic weights
    #[command(about = "Run the alternating estimator (outputs: report TOML)")]
    Estimate {
        #[command(flatten)]
        panel: PanelArgs,

        #[command(flatten)]
        estimation: EstimationArgs,

        /// Linear restriction "a1,a2,...=c" imposed on the coefficients
        #[arg(long, allow_hyphen_values = true)]
        restriction: Option<String>,

        /// Where to write the TOML report
        #[arg(long, default_value = "estimate.toml")]
        output: String,

        /// Optional CSV file for the dense weight matrix
        #[arg(long, value_name = "PATH")]
        weights_csv: Option<PathBuf>,
    },

    /// Bootstrap Wald test of a linear restriction
    #[command(about = "Test a linear restriction with the sign-flip bootstrap")]
    Wald {
        #[command(flatten)]
        panel: PanelArgs,

        #[command(flatten)]
        estimation: EstimationArgs,

        /// Linear restriction "a1,a2,...=c" under the null
        #[arg(long, allow_hyphen_values = true)]
        restriction: String,

        /// Number of bootstrap replicates
        #[arg(long, default_value = "999")]
        n_boot: usize,

        /// What each sign flip applies to
        #[arg(long, value_enum, default_value_t = SchemeCli::Unit)]
        scheme: SchemeCli,

        /// Seed of the bootstrap generator
        #[arg(long, default_value = "1")]
        seed: u64,

        /// Bins of the printed replicate histogram (0 disables it)
        #[arg(long, default_value = "20")]
        histogram_bins: usize,
    },

    /// Write a panel drawn from the factor model
    #[command(about = "Simulate a factor-model panel (outputs: CSV)")]
    Simulate {
        #[arg(long, default_value = "15")]
        units: usize,

        #[arg(long, default_value = "50")]
        periods: usize,

        /// Comma-separated true treatment coefficients
        #[arg(long, value_delimiter = ',', default_value = "1,2", allow_hyphen_values = true)]
        coefficients: Vec<f64>,

        #[arg(long, default_value = "1")]
        factors: usize,

        #[arg(long, default_value = "1.0")]
        noise: f64,

        /// Ratio of the last unit's noise scale to the first's
        #[arg(long, default_value = "1.0")]
        heteroskedasticity: f64,

        /// Set every factor loading to zero
        #[arg(long)]
        no_factors: bool,

        #[arg(long, default_value = "1")]
        seed: u64,

        #[arg(long, default_value = "panel.csv")]
        output: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Estimate {
            panel,
            estimation,
            restriction,
            output,
            weights_csv,
        }) => run_estimate(panel, estimation, restriction, output, weights_csv),
        Some(Commands::Wald {
            panel,
            estimation,
            restriction,
            n_boot,
            scheme,
            seed,
            histogram_bins,
        }) => run_wald(
            panel,
            estimation,
            restriction,
            WaldConfig {
                n_boot,
                scheme: scheme.into(),
            },
            seed,
            histogram_bins,
        ),
        Some(Commands::Simulate {
            units,
            periods,
            coefficients,
            factors,
            noise,
            heteroskedasticity,
            no_factors,
            seed,
            output,
        }) => {
            let mut design = FactorModelDesign {
                num_units: units,
                num_periods: periods,
                coefficients,
                num_factors: factors,
                noise_scale: noise,
                heteroskedasticity,
                ..FactorModelDesign::default()
            };
            if no_factors {
                design = design.without_factors();
            }
            run_simulate(&design, seed, &output)
        }
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn load(args: &PanelArgs) -> Result<Panel, Box<dyn Error>> {
    let spec = PanelSpec::new(&args.unit, &args.time, &args.outcome)
        .with_treatments(args.treatments.iter().cloned())
        .with_covariates(args.covariates.iter().cloned());
    let panel = load_panel(&args.data, &spec)?;
    println!(
        "Loaded {} units x {} periods: outcome '{}' on {} independent variable(s)",
        panel.num_units(),
        panel.num_periods(),
        panel.outcome_name(),
        panel.num_regressors()
    );
    Ok(panel)
}

fn build_config(args: &EstimationArgs) -> Result<EstimatorConfig, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => EstimatorConfig::load(path)?,
        None => EstimatorConfig::default(),
    };
    config.method = args.method.into();
    if let Some(tolerance) = args.tolerance {
        config.tolerance = tolerance;
    }
    if let Some(max_iterations) = args.max_iterations {
        config.max_iterations = max_iterations;
    }
    if args.nonnegative {
        config.weight_constraint = WeightConstraint::Nonnegative;
    }
    if args.fatal_divergence {
        config.fatal_divergence = true;
    }
    Ok(config)
}

fn initial_coefficients(panel: &Panel, args: &EstimationArgs) -> Result<Array1<f64>, Box<dyn Error>> {
    match &args.b_init {
        Some(values) => Ok(Array1::from_vec(values.clone())),
        None => {
            let fit = two_way_fixed_effects(panel)?;
            println!(
                "Starting from two-way fixed-effects estimates (within R^2 {:.4})",
                fit.r_squared_within
            );
            for (name, b) in fit.coefficient_names.iter().zip(fit.coefficients.iter()) {
                println!("  {name:<20} {b:>14.6}");
            }
            Ok(fit.coefficients)
        }
    }
}

/// Parses `"a1,a2,...=c"` into the restriction `a'b = c`.
fn parse_linear_restriction(text: &str, num_coefficients: usize) -> Result<Restriction, String> {
    let (lhs, rhs) = text
        .split_once('=')
        .ok_or_else(|| format!("restriction '{text}' must look like 'a1,a2,...=c'"))?;
    let coefficients = lhs
        .split(',')
        .map(|a| a.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("restriction coefficients in '{text}' are not numbers: {e}"))?;
    let value = rhs
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("restriction value in '{text}' is not a number: {e}"))?;
    if coefficients.len() != num_coefficients {
        return Err(format!(
            "restriction has {} coefficients but the model has {}",
            coefficients.len(),
            num_coefficients
        ));
    }
    if coefficients.iter().all(|a| *a == 0.0) {
        return Err("restriction coefficients cannot all be zero".to_string());
    }
    Ok(Restriction::linear(Array1::from_vec(coefficients), value))
}

fn fit(
    panel: &Panel,
    config: &EstimatorConfig,
    b_init: &Array1<f64>,
    restriction: Option<Restriction>,
) -> Result<EstimatorResult, Box<dyn Error>> {
    let mut estimator = Estimator::new(panel, config.clone());
    if let Some(restriction) = restriction {
        estimator = estimator.with_restriction(restriction);
    }
    let result = estimator.run(b_init.view())?;
    if !result.converged {
        eprintln!(
            "Warning: the estimator did not converge; inspect the diagnostics before trusting the estimate."
        );
    }
    Ok(result)
}

fn write_weights_csv(result: &EstimatorResult, path: &Path) -> Result<(), Box<dyn Error>> {
    let mut writer = csv::Writer::from_path(path)?;
    let mut header = vec!["unit".to_string()];
    header.extend(result.units.iter().cloned());
    writer.write_record(&header)?;
    for (unit, row) in result.units.iter().zip(result.weights.to_dense().outer_iter()) {
        let mut record = vec![unit.clone()];
        record.extend(row.iter().map(|w| w.to_string()));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

fn run_estimate(
    panel_args: PanelArgs,
    estimation: EstimationArgs,
    restriction: Option<String>,
    output: String,
    weights_csv: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    let panel = load(&panel_args)?;
    let config = build_config(&estimation)?;
    let b_init = initial_coefficients(&panel, &estimation)?;
    let restriction = restriction
        .map(|text| parse_linear_restriction(&text, panel.num_regressors()))
        .transpose()?;

    let result = fit(&panel, &config, &b_init, restriction)?;
    println!("{result}");

    result.report().save(&output)?;
    println!("Report saved to: {output}");
    if let Some(path) = weights_csv {
        write_weights_csv(&result, &path)?;
        println!("Weights saved to: {}", path.display());
    }
    Ok(())
}

fn run_wald(
    panel_args: PanelArgs,
    estimation: EstimationArgs,
    restriction: String,
    wald_config: WaldConfig,
    seed: u64,
    histogram_bins: usize,
) -> Result<(), Box<dyn Error>> {
    let panel = load(&panel_args)?;
    let config = build_config(&estimation)?;
    let b_init = initial_coefficients(&panel, &estimation)?;
    let restriction = parse_linear_restriction(&restriction, panel.num_regressors())?;

    let unrestricted = fit(&panel, &config, &b_init, None)?;
    println!("{unrestricted}");
    let restricted = fit(
        &panel,
        &config,
        &unrestricted.coefficients,
        Some(restriction),
    )?;
    println!("{restricted}");

    let mut rng = StdRng::seed_from_u64(seed);
    let test = wald_test(
        &panel,
        &restricted,
        Some(&unrestricted),
        &wald_config,
        &mut rng,
    )?;
    println!("{test}");
    if histogram_bins > 0 {
        println!("Bootstrap distribution of the Wald statistic:");
        print!("{}", test.histogram(histogram_bins));
    }
    Ok(())
}

fn run_simulate(design: &FactorModelDesign, seed: u64, output: &Path) -> Result<(), Box<dyn Error>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let simulated = design.simulate(&mut rng)?;
    let mut writer = csv::Writer::from_path(output)?;
    let mut header = vec!["unit".to_string(), "time".to_string(), "y".to_string()];
    header.extend(design.treatment_names());
    writer.write_record(&header)?;
    for obs in simulated.panel.observations() {
        let mut record = vec![obs.unit, obs.time, obs.outcome.to_string()];
        record.extend(obs.treatments.iter().map(|d| d.to_string()));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    println!(
        "Wrote a {} x {} panel to {} (true coefficients: {})",
        design.num_units,
        design.num_periods,
        output.display(),
        design
            .coefficients
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(())
}
