//! End-to-end pipeline tests over real files: synthetic survey CSV in,
//! fitted artifact, augmented seasonal grids, and rendered maps out.

use ndarray::Array1;
use phocoena::atlas::render::render_season_maps;
use phocoena::data::{load_grid, load_observations, write_augmented_grid, Season};
use phocoena::estimate::{train_model, FitOptions, SelectionPolicy};
use phocoena::model::{FittedModel, ModelFamily, TermDetail};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

const OBS_HEADER: &str = "id,day,month,year,lat,lon,x,y,presence,depth,sst_day";

/// Writes a synthetic observation file with a strong known relationship:
/// presence odds rise with shallower water and warmer surface temperature.
fn write_observation_csv(path: &Path, n: usize, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut text = String::from(OBS_HEADER);
    text.push('\n');
    for i in 0..n {
        let depth = -45.0 + 40.0 * rng.gen::<f64>();
        let sst = 5.0 + 9.0 * rng.gen::<f64>();
        let eta = 0.12 * (depth + 25.0) + 0.5 * (sst - 9.5) - 0.2;
        let p = 1.0 / (1.0 + (-eta).exp());
        let presence = u8::from(rng.gen::<f64>() < p);
        let lat = 54.0 + 0.5 * rng.gen::<f64>();
        let lon = 7.8 + 0.9 * rng.gen::<f64>();
        writeln!(
            text,
            "{},{},{},{},{:.5},{:.5},{:.1},{:.1},{},{:.3},{:.3}",
            i + 1,
            (i % 28) + 1,
            (i % 12) + 1,
            2006,
            lat,
            lon,
            420_000.0 + 60_000.0 * (lon - 7.8) / 0.9,
            5_985_000.0 + 56_000.0 * (lat - 54.0) / 0.5,
            presence,
            depth,
            sst
        )
        .unwrap();
    }
    fs::write(path, text).unwrap();
}

/// Writes one regular 6x5 prediction grid; one cell is missing its depth.
fn write_grid_csv(path: &Path, offset: f64, with_gap: bool) {
    let mut text = String::from("x,y,depth,sst_day\n");
    for row in 0..5 {
        for col in 0..6 {
            let x = 420_000.0 + col as f64 * 10_000.0;
            let y = 5_985_000.0 + row as f64 * 10_000.0;
            let depth = -40.0 + 5.0 * col as f64 + offset;
            let sst = 6.0 + 1.2 * row as f64 + offset / 10.0;
            if with_gap && row == 2 && col == 3 {
                writeln!(text, "{x},{y},,{sst:.2}").unwrap();
            } else {
                writeln!(text, "{x},{y},{depth:.2},{sst:.2}").unwrap();
            }
        }
    }
    fs::write(path, text).unwrap();
}

fn covariates() -> Vec<String> {
    vec!["depth".to_string(), "sst_day".to_string()]
}

#[test]
fn glm_pipeline_fit_save_predict_export() {
    let dir = tempfile::tempdir().unwrap();
    let obs_path = dir.path().join("observations.csv");
    write_observation_csv(&obs_path, 600, 4242);

    let data = load_observations(obs_path.to_str().unwrap(), &covariates()).unwrap();
    let options = FitOptions {
        family: ModelFamily::Linear,
        ..FitOptions::default()
    };
    let model = train_model(&data, &options).unwrap();

    // Both engineered effects are strong; they must come out significant
    // with the right signs.
    let policy = SelectionPolicy::default();
    assert!(policy.removal_candidates(&model.summary).is_empty());
    for term in &model.summary.terms {
        if let TermDetail::Linear { estimate, .. } = term.detail {
            assert!(estimate > 0.0, "{} estimate {estimate}", term.name);
        }
        assert!(term.p_value < 0.05);
    }

    // Round-trip the artifact and check predictions survive it exactly.
    let model_path = dir.path().join("model.toml");
    model.save(model_path.to_str().unwrap()).unwrap();
    let reloaded = FittedModel::load(model_path.to_str().unwrap()).unwrap();

    let grid_path = dir.path().join("winter.csv");
    write_grid_csv(&grid_path, 0.0, true);
    let grid = load_grid(grid_path.to_str().unwrap(), &covariates()).unwrap();

    let before = model.predict_grid(&grid).unwrap();
    let after = reloaded.predict_grid(&grid).unwrap();
    assert_eq!(before.len(), 30);
    let mut missing = 0;
    for (a, b) in before.iter().zip(after.iter()) {
        if a.is_nan() {
            assert!(b.is_nan());
            missing += 1;
        } else {
            assert!((a - b).abs() < 1e-12);
            assert!((0.0..=1.0).contains(a));
        }
    }
    assert_eq!(missing, 1, "exactly the gap cell degrades to NaN");

    // Export keeps the grid's shape plus the probability column.
    let out_path = dir.path().join("winter_predicted.csv");
    write_augmented_grid(&grid, &before, out_path.to_str().unwrap()).unwrap();
    let exported = fs::read_to_string(&out_path).unwrap();
    let mut lines = exported.lines();
    assert_eq!(lines.next().unwrap(), "x,y,depth,sst_day,presence_prob");
    assert_eq!(lines.count(), 30);

    // In-sample mean probability reproduces the empirical prevalence.
    let in_sample = model
        .predict(&data.covariate_names, data.covariates.view())
        .unwrap();
    let prevalence = data.presence.mean().unwrap();
    assert!((in_sample.mean().unwrap() - prevalence).abs() < 1e-6);
}

#[test]
fn gam_pipeline_predicts_and_renders_four_seasons() {
    let dir = tempfile::tempdir().unwrap();
    let obs_path = dir.path().join("observations.csv");
    write_observation_csv(&obs_path, 500, 99);

    let data = load_observations(obs_path.to_str().unwrap(), &covariates()).unwrap();
    let options = FitOptions {
        family: ModelFamily::Smooth,
        basis_dim: 8,
        ..FitOptions::default()
    };
    let model = train_model(&data, &options).unwrap();
    for term in &model.summary.terms {
        match term.detail {
            TermDetail::Smooth { edf, lambda } => {
                assert!(edf > 0.0 && edf <= 7.0 + 1e-6);
                assert!(lambda > 0.0);
            }
            _ => panic!("expected smooth terms"),
        }
    }

    let mut season_grids = Vec::new();
    for (i, season) in Season::ALL.iter().enumerate() {
        let path = dir.path().join(format!("{season}.csv"));
        write_grid_csv(&path, i as f64 * 2.0, false);
        let grid = load_grid(path.to_str().unwrap(), &covariates()).unwrap();
        let probabilities = model.predict_grid(&grid).unwrap();
        for &p in probabilities.iter() {
            assert!((0.0..=1.0).contains(&p));
        }
        season_grids.push((*season, grid, probabilities));
    }

    let refs: Vec<(Season, &phocoena::data::GridData, &Array1<f64>)> = season_grids
        .iter()
        .map(|(season, grid, probabilities)| (*season, grid, probabilities))
        .collect();
    let maps_dir = dir.path().join("maps");
    let written = render_season_maps(&refs, None, 32, 200, &maps_dir).unwrap();
    assert_eq!(written.len(), 4);
    for path in &written {
        assert!(image::open(path).is_ok(), "unreadable map {path:?}");
    }
}
