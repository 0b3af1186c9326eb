//! Command-line surface for the seasonal habitat-modeling workflow:
//! fit a GLM/GAM to survey observations, project it onto seasonal grids,
//! and render the survey and probability maps.

use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use itertools::Itertools;
use std::path::{Path, PathBuf};
use std::process;

use phocoena::atlas::context::{
    bathymetry_from_file, coastline_from_file, BathymetryProvider, CoastlineLayer,
    CoastlineProvider, GeoBoundingBox,
};
use phocoena::atlas::contour::ScalarGrid;
use phocoena::atlas::render::{render_season_maps, render_survey_map};
use phocoena::data::{
    load_grid, load_observations, write_augmented_grid, GridData, ObservationData, Season,
    COVARIATE_COLUMNS,
};
use phocoena::estimate::{train_model, FitOptions, SelectionPolicy};
use phocoena::model::{FittedModel, ModelFamily, TermDetail};
use phocoena::pirls::PirlsOptions;

#[derive(Parser)]
#[command(
    name = "phocoena",
    about = "Seasonal habitat modeling for harbour porpoise presence/absence surveys",
    long_about = "Fits binomial GLM/GAM habitat models to presence/absence survey data, \
                  projects the fitted model onto seasonal prediction grids, and renders \
                  survey and probability maps."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FamilyArg {
    /// Linear-predictor logistic regression.
    Glm,
    /// Smooth-term additive model.
    Gam,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a habitat model and save the artifact (outputs: model TOML)
    Fit {
        /// Path to the observation CSV
        observations: String,

        /// Model family
        #[arg(long, value_enum, default_value = "gam")]
        family: FamilyArg,

        /// Comma-separated covariate subset (default: the full survey set)
        #[arg(long)]
        covariates: Option<String>,

        /// Maximum flexibility per smooth term (basis dimension)
        #[arg(long, default_value = "10")]
        basis_dim: usize,

        /// Polynomial degree of the spline basis
        #[arg(long, default_value = "3")]
        degree: usize,

        /// Order of the difference penalty
        #[arg(long, default_value = "2")]
        penalty_order: usize,

        /// Maximum IRLS iterations
        #[arg(long, default_value = "50")]
        max_iter: usize,

        /// IRLS deviance-change tolerance
        #[arg(long, default_value = "1e-8")]
        tolerance: f64,

        /// Significance threshold for removal candidates
        #[arg(long, default_value = "0.05")]
        alpha: f64,

        /// AIC gap treated as a meaningful improvement
        #[arg(long, default_value = "2.0")]
        aic_drop: f64,

        /// Output path for the fitted-model artifact
        #[arg(long, default_value = "model.toml")]
        out: String,
    },

    /// Apply a fitted model to one prediction grid (outputs: augmented CSV)
    Predict {
        /// Path to the prediction-grid CSV
        grid: String,

        /// Path to the fitted-model artifact
        #[arg(long)]
        model: String,

        /// Output path (default: '<grid>_predicted.csv')
        #[arg(long)]
        out: Option<String>,
    },

    /// Render the survey overview map (observations over coastline and
    /// bathymetry)
    SurveyMap {
        /// Path to the observation CSV
        observations: String,

        /// Coastline source: a local GeoJSON file or a provider base URL
        #[arg(long, default_value = CoastlineProvider::DEFAULT_BASE_URL)]
        coastline: String,

        /// ISO country codes for the coastline provider
        #[arg(long, default_value = "DNK,DEU")]
        countries: String,

        /// Administrative level for the coastline provider
        #[arg(long, default_value = "0")]
        admin_level: u8,

        /// Bathymetry source: a local lon,lat,depth file or a provider URL
        #[arg(long)]
        bathymetry: Option<String>,

        /// Bathymetry resolution in arc-minutes
        #[arg(long, default_value = "1")]
        resolution: u32,

        /// UTM zone of the projected survey coordinates
        #[arg(long, default_value = "32")]
        utm_zone: u8,

        /// Map width in pixels
        #[arg(long, default_value = "1000")]
        width: u32,

        /// Output PNG path
        #[arg(long, default_value = "survey_map.png")]
        out: String,
    },

    /// Predict all four seasonal grids and render the probability maps
    SeasonMaps {
        /// Path to the fitted-model artifact
        #[arg(long)]
        model: String,

        /// Seasonal prediction-grid CSVs
        #[arg(long)]
        winter: String,
        #[arg(long)]
        spring: String,
        #[arg(long)]
        summer: String,
        #[arg(long)]
        autumn: String,

        /// Coastline source: a local GeoJSON file or a provider base URL
        #[arg(long, default_value = CoastlineProvider::DEFAULT_BASE_URL)]
        coastline: String,

        /// ISO country codes for the coastline provider
        #[arg(long, default_value = "DNK,DEU")]
        countries: String,

        /// Administrative level for the coastline provider
        #[arg(long, default_value = "0")]
        admin_level: u8,

        /// UTM zone of the projected grid coordinates
        #[arg(long, default_value = "32")]
        utm_zone: u8,

        /// Map width in pixels
        #[arg(long, default_value = "1000")]
        width: u32,

        /// Directory for the maps and augmented grids
        #[arg(long, default_value = "maps")]
        out_dir: String,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Fit {
            observations,
            family,
            covariates,
            basis_dim,
            degree,
            penalty_order,
            max_iter,
            tolerance,
            alpha,
            aic_drop,
            out,
        } => fit_command(
            &observations,
            family,
            covariates.as_deref(),
            basis_dim,
            degree,
            penalty_order,
            max_iter,
            tolerance,
            SelectionPolicy { alpha, aic_drop },
            &out,
        ),
        Commands::Predict { grid, model, out } => predict_command(&grid, &model, out.as_deref()),
        Commands::SurveyMap {
            observations,
            coastline,
            countries,
            admin_level,
            bathymetry,
            resolution,
            utm_zone,
            width,
            out,
        } => survey_map_command(
            &observations,
            &coastline,
            &countries,
            admin_level,
            bathymetry.as_deref(),
            resolution,
            utm_zone,
            width,
            &out,
        ),
        Commands::SeasonMaps {
            model,
            winter,
            spring,
            summer,
            autumn,
            coastline,
            countries,
            admin_level,
            utm_zone,
            width,
            out_dir,
        } => season_maps_command(
            &model,
            [&winter, &spring, &summer, &autumn],
            &coastline,
            &countries,
            admin_level,
            utm_zone,
            width,
            &out_dir,
        ),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn parse_covariates(argument: Option<&str>) -> Vec<String> {
    match argument {
        Some(list) => list
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        None => COVARIATE_COLUMNS.iter().map(|s| s.to_string()).collect(),
    }
}

#[allow(clippy::too_many_arguments)]
fn fit_command(
    observations_path: &str,
    family: FamilyArg,
    covariates: Option<&str>,
    basis_dim: usize,
    degree: usize,
    penalty_order: usize,
    max_iter: usize,
    tolerance: f64,
    policy: SelectionPolicy,
    out_path: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let covariate_names = parse_covariates(covariates);
    let data = load_observations(observations_path, &covariate_names)?;
    println!(
        "Loaded {} observations ({} dropped as incomplete), prevalence {:.3}",
        data.presence.len(),
        data.dropped_rows,
        data.presence.mean().unwrap_or(0.0)
    );

    let options = FitOptions {
        family: match family {
            FamilyArg::Glm => ModelFamily::Linear,
            FamilyArg::Gam => ModelFamily::Smooth,
        },
        basis_dim,
        degree,
        penalty_order,
        pirls: PirlsOptions {
            max_iterations: max_iter,
            tolerance,
        },
        ..FitOptions::default()
    };

    let model = train_model(&data, &options)?;
    print_summary(&model, &policy);

    model.save(out_path)?;
    println!("Model saved to: {out_path}");
    Ok(())
}

fn print_summary(model: &FittedModel, policy: &SelectionPolicy) {
    let summary = &model.summary;
    println!();
    match model.spec.family {
        ModelFamily::Linear => {
            println!("Family: binomial GLM (logit link)");
            println!();
            println!(
                "{:<16} {:>10} {:>10} {:>8} {:>10}",
                "term", "estimate", "std.error", "z", "p-value"
            );
            println!(
                "{:<16} {:>10.4} {:>10.4} {:>8.2} {:>10}",
                "(intercept)",
                summary.intercept,
                summary.intercept_std_error,
                summary.intercept / summary.intercept_std_error,
                ""
            );
            for term in &summary.terms {
                if let TermDetail::Linear {
                    estimate,
                    std_error,
                } = term.detail
                {
                    println!(
                        "{:<16} {:>10.4} {:>10.4} {:>8.2} {:>10}",
                        term.name,
                        estimate,
                        std_error,
                        term.statistic,
                        format_p(term.p_value)
                    );
                }
            }
        }
        ModelFamily::Smooth => {
            println!("Family: binomial GAM (logit link, one smooth per covariate)");
            println!();
            println!(
                "{:<16} {:>8} {:>10} {:>10} {:>10}",
                "term", "edf", "lambda", "chi.sq", "p-value"
            );
            for term in &summary.terms {
                if let TermDetail::Smooth { edf, lambda } = term.detail {
                    println!(
                        "{:<16} {:>8.2} {:>10.3e} {:>10.2} {:>10}",
                        format!("s({})", term.name),
                        edf,
                        lambda,
                        term.statistic,
                        format_p(term.p_value)
                    );
                }
            }
        }
    }
    println!();
    println!(
        "Null deviance {:.2}, residual deviance {:.2} ({:.1}% explained)",
        summary.null_deviance,
        summary.deviance,
        100.0 * summary.explained_deviance()
    );
    println!(
        "Effective degrees of freedom {:.2}, AIC {:.2}",
        summary.edf, summary.aic
    );

    let candidates = policy.removal_candidates(summary);
    if candidates.is_empty() {
        println!(
            "All covariates significant at alpha = {} (AIC gap threshold {}).",
            policy.alpha, policy.aic_drop
        );
    } else {
        println!(
            "Removal candidates (p > {}): {}",
            policy.alpha,
            candidates.iter().join(", ")
        );
    }
}

fn format_p(p: f64) -> String {
    if p < 0.001 {
        "<0.001".to_string()
    } else {
        format!("{p:.4}")
    }
}

fn predict_command(
    grid_path: &str,
    model_path: &str,
    out_path: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let model = FittedModel::load(model_path)?;
    println!(
        "Loaded {:?} model on covariates: {}",
        model.spec.family,
        model.spec.covariate_names.iter().join(", ")
    );

    let grid = load_grid(grid_path, &model.spec.covariate_names)?;
    let probabilities = model.predict_grid(&grid)?;
    let missing = probabilities.iter().filter(|p| !p.is_finite()).count();
    if missing > 0 {
        println!("{missing} grid cells have missing covariates; their prediction is empty");
    }

    let out = match out_path {
        Some(path) => path.to_string(),
        None => default_augmented_path(grid_path),
    };
    write_augmented_grid(&grid, &probabilities, &out)?;
    println!("Augmented grid saved to: {out}");
    Ok(())
}

fn default_augmented_path(grid_path: &str) -> String {
    let path = Path::new(grid_path);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("grid");
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    parent
        .join(format!("{stem}_predicted.csv"))
        .to_string_lossy()
        .into_owned()
}

/// Resolves a coastline argument: an existing local file is loaded directly,
/// anything else is treated as a provider base URL. A failure here aborts
/// only the map being rendered, never the modeling path.
fn resolve_coastline(
    source: &str,
    countries: &str,
    admin_level: u8,
) -> Result<CoastlineLayer, Box<dyn std::error::Error>> {
    if Path::new(source).exists() {
        return Ok(coastline_from_file(Path::new(source))?);
    }
    let provider = CoastlineProvider::new(source);
    let mut rings = Vec::new();
    for iso in countries.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let layer = provider.fetch(iso, admin_level)?;
        rings.extend(layer.rings);
    }
    Ok(CoastlineLayer { rings })
}

fn resolve_bathymetry(
    source: &str,
    observations: &ObservationData,
    resolution: u32,
) -> Result<ScalarGrid, Box<dyn std::error::Error>> {
    if Path::new(source).exists() {
        return Ok(bathymetry_from_file(Path::new(source))?);
    }
    // Bounding box: the surveyed area plus a margin.
    let margin = 0.25;
    let west = observations.lon.iter().copied().fold(f64::INFINITY, f64::min) - margin;
    let east = observations.lon.iter().copied().fold(f64::NEG_INFINITY, f64::max) + margin;
    let south = observations.lat.iter().copied().fold(f64::INFINITY, f64::min) - margin;
    let north = observations.lat.iter().copied().fold(f64::NEG_INFINITY, f64::max) + margin;
    let provider = BathymetryProvider::new(source);
    Ok(provider.fetch(GeoBoundingBox::new(west, south, east, north), resolution)?)
}

#[allow(clippy::too_many_arguments)]
fn survey_map_command(
    observations_path: &str,
    coastline_source: &str,
    countries: &str,
    admin_level: u8,
    bathymetry_source: Option<&str>,
    resolution: u32,
    utm_zone: u8,
    width: u32,
    out_path: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    // Mapping needs positions and labels only; no covariate columns.
    let observations = load_observations(observations_path, &[])?;

    let coastline = match resolve_coastline(coastline_source, countries, admin_level) {
        Ok(layer) => Some(layer),
        Err(e) => {
            eprintln!("Warning: coastline layer unavailable ({e}); drawing without it");
            None
        }
    };
    let bathymetry = match bathymetry_source {
        Some(source) => match resolve_bathymetry(source, &observations, resolution) {
            Ok(grid) => Some(grid),
            Err(e) => {
                eprintln!("Warning: bathymetry layer unavailable ({e}); drawing without it");
                None
            }
        },
        None => None,
    };

    render_survey_map(
        &observations,
        coastline.as_ref(),
        bathymetry.as_ref(),
        utm_zone,
        width,
        Path::new(out_path),
    )?;
    println!("Survey map saved to: {out_path}");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn season_maps_command(
    model_path: &str,
    grid_paths: [&String; 4],
    coastline_source: &str,
    countries: &str,
    admin_level: u8,
    utm_zone: u8,
    width: u32,
    out_dir: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let model = FittedModel::load(model_path)?;
    let out_dir = PathBuf::from(out_dir);
    std::fs::create_dir_all(&out_dir)?;

    let progress = ProgressBar::new(Season::ALL.len() as u64);
    progress.set_style(
        ProgressStyle::with_template("{msg:<24} [{bar:30}] {pos}/{len}")
            .expect("static progress template")
            .progress_chars("=> "),
    );

    let mut grids: Vec<(Season, GridData, ndarray::Array1<f64>)> = Vec::with_capacity(4);
    for (&season, path) in Season::ALL.iter().zip(grid_paths.iter()) {
        progress.set_message(format!("predicting {season}"));
        let grid = load_grid(path, &model.spec.covariate_names)?;
        let probabilities = model.predict_grid(&grid)?;
        let augmented = out_dir.join(format!("{season}_predicted.csv"));
        write_augmented_grid(&grid, &probabilities, augmented.to_string_lossy().as_ref())?;
        grids.push((season, grid, probabilities));
        progress.inc(1);
    }
    progress.finish_with_message("predictions done");

    let coastline = match resolve_coastline(coastline_source, countries, admin_level) {
        Ok(layer) => Some(layer),
        Err(e) => {
            eprintln!("Warning: coastline layer unavailable ({e}); drawing without it");
            None
        }
    };

    let season_refs: Vec<(Season, &GridData, &ndarray::Array1<f64>)> = grids
        .iter()
        .map(|(season, grid, probabilities)| (*season, grid, probabilities))
        .collect();
    let written = render_season_maps(
        &season_refs,
        coastline.as_ref(),
        utm_zone,
        width,
        &out_dir,
    )?;
    for path in written {
        println!("Wrote {}", path.display());
    }
    Ok(())
}
