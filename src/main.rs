#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use ndarray::{Array2, Array3, ArrayView2, Axis};
use polars::prelude::*;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;

use polyconnectome::catalog::{
    CssSource, DiseaseMapCatalog, LabeledCss, MapKey, load_matrix_csv, read_map, write_map,
};
use polyconnectome::meta::MetaOptions;
use polyconnectome::model::PcsModel;
use polyconnectome::threshold::threshold_by_p_value;

#[derive(Parser)]
#[command(
    name = "polyconnectome",
    version,
    about = "Connectome summary statistics and PolyConnectomic scores",
    long_about = "Builds disease-specific connectome summary statistics from published \
                 disease maps or from raw cohort data, and scores subject connectivity \
                 matrices against them."
)]
struct Cli {
    /// Log per-step details
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Selects one family of disease maps.
#[derive(Args, Debug)]
struct MapArgs {
    /// Root directory of the disease-map collection
    #[arg(long)]
    root: PathBuf,

    /// Diagnosis, e.g. schizophrenia
    #[arg(long)]
    disease: String,

    /// functional-connectivity, structural-connectivity or morphology
    #[arg(long)]
    modality: String,

    /// Metric of the modality, e.g. thickness or mean_fa
    #[arg(long)]
    metric: String,

    /// aparc+aseg or aparc
    #[arg(long, default_value = "aparc+aseg")]
    atlas: String,
}

impl MapArgs {
    fn key(&self) -> Result<MapKey, Box<dyn std::error::Error>> {
        Ok(MapKey::parse(
            &self.disease,
            &self.modality,
            &self.metric,
            &self.atlas,
        )?)
    }
}

#[derive(Args, Debug)]
struct EvaluateArgs {
    /// Subject connectivity matrices, one plain CSV file per subject
    #[arg(value_name = "CONNECTIVITY", required = true)]
    connectivity: Vec<PathBuf>,

    /// A model saved by `fit` or `aggregate`
    #[arg(long, conflicts_with_all = ["root", "disease", "modality", "metric"])]
    model: Option<PathBuf>,

    #[arg(long)]
    root: Option<PathBuf>,

    #[arg(long)]
    disease: Option<String>,

    #[arg(long)]
    modality: Option<String>,

    #[arg(long)]
    metric: Option<String>,

    #[arg(long, default_value = "aparc+aseg")]
    atlas: String,

    /// mega_analysis, all_studies, or a comma-separated list of studies
    #[arg(long, default_value = "mega_analysis")]
    source: String,

    /// Labeled p-value map used to zero non-significant region pairs before scoring
    #[arg(long)]
    p_values: Option<PathBuf>,

    /// Significance level for --p-values
    #[arg(long, default_value = "0.05")]
    alpha: f64,

    /// Output TSV with one score per subject
    #[arg(long, default_value = "pcs_scores.tsv")]
    output: PathBuf,
}

#[derive(Args, Debug)]
struct FitArgs {
    /// Tab-separated demographics table with a header, one row per subject
    demographics: PathBuf,

    /// Subject connectivity matrices, in the row order of the demographics table
    #[arg(value_name = "CONNECTIVITY", required = true)]
    connectivity: Vec<PathBuf>,

    /// Binary column holding the case/control label
    #[arg(long)]
    variable_of_interest: String,

    /// Value of the variable of interest that marks controls
    #[arg(long)]
    baseline: String,

    /// Comma-separated numeric confounder columns
    #[arg(long, value_delimiter = ',')]
    continuous: Vec<String>,

    /// Comma-separated categorical confounder columns
    #[arg(long, value_delimiter = ',')]
    categorical: Vec<String>,

    #[arg(long, default_value = "pcs_model.toml")]
    output: PathBuf,
}

#[derive(Args, Debug)]
struct AggregateArgs {
    #[command(flatten)]
    map: MapArgs,

    /// all_studies, or a comma-separated list of studies
    #[arg(long, default_value = "all_studies")]
    studies: String,

    /// Iteration budget of the between-study variance estimate
    #[arg(long, default_value = "50")]
    max_iterations: usize,

    /// Convergence tolerance of the between-study variance estimate
    #[arg(long, default_value = "1e-5")]
    tolerance: f64,

    /// Labeled CSV receiving the summary statistic
    #[arg(long, default_value = "css.csv")]
    output: PathBuf,

    /// Labeled CSV receiving the per-pair between-study variance
    #[arg(long)]
    heterogeneity: Option<PathBuf>,

    /// Also save the summary statistic as a scoring model
    #[arg(long)]
    model: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Score subject connectivity matrices
    Evaluate(EvaluateArgs),

    /// Fit a summary statistic by regression on a cohort
    Fit(FitArgs),

    /// Aggregate stored studies into a summary statistic
    Aggregate(AggregateArgs),

    /// List the studies stored for a disease map
    Studies(MapArgs),
}

fn main() {
    let Cli { verbose, command } = Cli::parse();
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .init();

    let result = match command {
        Some(Commands::Evaluate(args)) => evaluate(args),
        Some(Commands::Fit(args)) => fit(args),
        Some(Commands::Aggregate(args)) => aggregate(args),
        Some(Commands::Studies(args)) => studies(args),
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

/// Loads plain CSV matrices into an `(N, N, subjects)` stack.
fn load_stack(paths: &[PathBuf]) -> Result<Array3<f64>, Box<dyn std::error::Error>> {
    let matrices: Vec<Array2<f64>> = paths
        .iter()
        .map(|path| load_matrix_csv(path))
        .collect::<Result<Vec<_>, _>>()?;
    if let Some((path, m)) = paths
        .iter()
        .zip(&matrices)
        .find(|(_, m)| m.dim() != matrices[0].dim())
    {
        return Err(format!(
            "{} holds a {:?} matrix but {} holds a {:?} matrix.",
            path.display(),
            m.dim(),
            paths[0].display(),
            matrices[0].dim()
        )
        .into());
    }
    let views: Vec<ArrayView2<f64>> = matrices.iter().map(|m| m.view()).collect();
    log::info!("Loaded {} connectivity matrices.", views.len());
    Ok(ndarray::stack(Axis(2), &views)?)
}

fn subject_id(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn write_scores(
    output: &Path,
    subjects: &[PathBuf],
    scores: &ndarray::Array1<f64>,
) -> Result<(), std::io::Error> {
    let mut file = BufWriter::new(File::create(output)?);
    writeln!(file, "subject_id\tpcs")?;
    let mut buffer = ryu::Buffer::new();
    for (path, &score) in subjects.iter().zip(scores) {
        writeln!(file, "{}\t{}", subject_id(path), buffer.format(score))?;
    }
    file.flush()
}

fn evaluate(args: EvaluateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut model = match &args.model {
        Some(path) => {
            println!("Loading model from: {}", path.display());
            PcsModel::load(path)?
        }
        None => {
            let (Some(root), Some(disease), Some(modality), Some(metric)) =
                (&args.root, &args.disease, &args.modality, &args.metric)
            else {
                return Err(
                    "Either --model or all of --root, --disease, --modality and --metric are required."
                        .into(),
                );
            };
            let key = MapKey::parse(disease, modality, metric, &args.atlas)?;
            let source: CssSource = args.source.parse()?;
            DiseaseMapCatalog::new(root).model(&key, &source)?
        }
    };

    if let Some(path) = &args.p_values {
        let css = model.css().ok_or("The model holds no summary statistic to threshold.")?;
        let p_values = read_map(path)?;
        let filtered = threshold_by_p_value(css, p_values.matrix.view(), args.alpha)?;
        model = PcsModel::with_css(model.provenance().clone(), filtered);
    }

    let stack = load_stack(&args.connectivity)?;
    let scores = model.evaluate_stack(stack.view())?;
    write_scores(&args.output, &args.connectivity, &scores)?;
    println!(
        "Wrote {} scores to {}",
        scores.len(),
        args.output.display()
    );
    Ok(())
}

fn fit(args: FitArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("Loading demographics from: {}", args.demographics.display());
    let demographics = CsvReader::new(File::open(&args.demographics)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
        )
        .finish()?;

    let stack = load_stack(&args.connectivity)?;
    let continuous: Vec<&str> = args.continuous.iter().map(String::as_str).collect();
    let categorical: Vec<&str> = args.categorical.iter().map(String::as_str).collect();

    let mut model = PcsModel::unfitted();
    model.fit(
        &demographics,
        stack.view(),
        &args.variable_of_interest,
        &args.baseline,
        &continuous,
        &categorical,
    )?;
    model.save(&args.output)?;
    println!("Model saved to: {}", args.output.display());
    Ok(())
}

fn aggregate(args: AggregateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let key = args.map.key()?;
    let options = MetaOptions {
        max_iterations: args.max_iterations,
        tolerance: args.tolerance,
    };
    let catalog = DiseaseMapCatalog::new(&args.map.root).with_options(options);
    let source = match args.studies.parse::<CssSource>()? {
        CssSource::MegaAnalysis => {
            return Err("aggregate combines stored studies; use `all_studies` or a study list.".into());
        }
        source => source,
    };

    let studies = catalog.studies_for(&key, &source)?;
    let computed = catalog.compute_css(&key, &studies)?;
    write_map(&args.output, &computed.regions, computed.aggregate.css.view())?;
    println!("Summary statistic written to: {}", args.output.display());

    if let Some(path) = &args.heterogeneity {
        write_map(path, &computed.regions, computed.aggregate.heterogeneity.view())?;
        println!("Between-study variance written to: {}", path.display());
    }
    if let Some(path) = &args.model {
        let labeled = LabeledCss::from(computed);
        PcsModel::from_disease_map(key, source, labeled.css).save(path)?;
        println!("Model saved to: {}", path.display());
    }
    Ok(())
}

fn studies(args: MapArgs) -> Result<(), Box<dyn std::error::Error>> {
    let key = args.key()?;
    for study in DiseaseMapCatalog::new(&args.root).list_studies(&key)? {
        println!("{study}");
    }
    Ok(())
}
