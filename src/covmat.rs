//! Initial proposal covariance: loading, validation and assembly

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::info;
use nalgebra::DMatrix;

use crate::error::{Error, Result};
use crate::parameter::Parameterization;
use crate::prior::Prior;

/// Where the user-supplied proposal covariance comes from
#[derive(Clone, Debug)]
pub enum CovmatSource {
    /// Text file: a `#`-prefixed header of parameter names, then the matrix
    Path(PathBuf),
    /// Matrix already in memory, with the names of its rows/columns
    InMemory {
        /// Parameter names, one per matrix row
        params: Vec<String>,
        /// Square covariance matrix
        matrix: DMatrix<f64>,
    },
}

/// Covariance assembled from all sources, plus whether any diagonal entry
/// had to come from somewhere other than the supplied matrix (in which case
/// proposal learning should start earlier).
#[derive(Clone, Debug)]
pub struct AssembledCovmat {
    /// Full proposal covariance over the sampled parameters
    pub matrix: DMatrix<f64>,
    /// True when the supplied covariance did not cover every parameter
    pub incomplete: bool,
}

/// Read a covariance file: header `# name1 name2 ...`, then one row per line
pub fn load_covmat(path: &Path) -> Result<(Vec<String>, DMatrix<f64>)> {
    let text = fs::read_to_string(path).map_err(|source| Error::CovmatIo {
        path: path.to_owned(),
        source,
    })?;
    let mut lines = text.lines();
    let header = lines.next().unwrap_or("");
    if !header.starts_with('#') {
        return Err(Error::CovmatFormat(format!(
            "the first line of '{}' must be a list of parameter names \
             starting with '#'",
            path.display()
        )));
    }
    let names: Vec<String> = header
        .trim_start_matches('#')
        .split_whitespace()
        .map(str::to_owned)
        .collect();

    let mut rows: Vec<Vec<f64>> = Vec::new();
    for line in lines.filter(|l| !l.trim().is_empty()) {
        let row: std::result::Result<Vec<f64>, _> =
            line.split_whitespace().map(str::parse::<f64>).collect();
        match row {
            Ok(r) => rows.push(r),
            Err(_) => {
                return Err(Error::CovmatFormat(format!(
                    "non-numeric entry in '{}'",
                    path.display()
                )))
            }
        }
    }
    let n = rows.len();
    if n == 0 || rows.iter().any(|r| r.len() != n) {
        return Err(Error::CovmatFormat(format!(
            "'{}' must contain a square matrix, one row per line",
            path.display()
        )));
    }
    let matrix = DMatrix::from_fn(n, n, |i, j| rows[i][j]);
    Ok((names, matrix))
}

/// Write a covariance in the same format `load_covmat` reads. Entries are
/// printed with full float precision, so a load of the written file
/// reproduces the matrix exactly.
pub fn save_covmat(path: &Path, names: &[String], matrix: &DMatrix<f64>) -> Result<()> {
    let mut out = String::from("#");
    for name in names {
        out.push(' ');
        out.push_str(name);
    }
    out.push('\n');
    for i in 0..matrix.nrows() {
        let mut row = String::new();
        for j in 0..matrix.ncols() {
            if j > 0 {
                row.push(' ');
            }
            row.push_str(&format!("{:.17e}", matrix[(i, j)]));
        }
        out.push_str(&row);
        out.push('\n');
    }
    let mut file = fs::File::create(path).map_err(|source| Error::CovmatIo {
        path: path.to_owned(),
        source,
    })?;
    file.write_all(out.as_bytes())
        .map_err(|source| Error::CovmatIo {
            path: path.to_owned(),
            source,
        })
}

fn validate_loaded(names: &[String], matrix: &DMatrix<f64>) -> Result<()> {
    for (i, n) in names.iter().enumerate() {
        if names[..i].contains(n) {
            return Err(Error::DuplicateCovmatParams);
        }
    }
    if names.len() != matrix.nrows() || matrix.nrows() != matrix.ncols() {
        return Err(Error::CovmatFormat(
            "the number of parameters in the header and the dimensions of \
             the matrix do not coincide"
                .into(),
        ));
    }
    let symmetric = matrix.relative_eq(&matrix.transpose(), 1e-8, 1e-8);
    let positive = matrix
        .clone()
        .symmetric_eigen()
        .eigenvalues
        .iter()
        .all(|&l| l > 0.0);
    if !(symmetric && positive) {
        return Err(Error::CovmatNotPosDef);
    }
    Ok(())
}

/// Build the initial proposal covariance from the available sources, in
/// descending order of priority:
///
/// 1. the supplied covariance (file or in-memory), mapped by name;
/// 2. the square of each parameter's `proposal` width;
/// 3. the reference pdf variance, falling back to the prior variance.
///
/// Covariances between parameters both present in the supplied matrix are
/// preserved; all others are zero.
pub fn initial_proposal_covmat(
    source: Option<&CovmatSource>,
    params: &Parameterization,
    prior: &Prior,
) -> Result<AssembledCovmat> {
    let d = params.d();
    let mut covmat = DMatrix::from_diagonal(&nalgebra::DVector::repeat(d, f64::NAN));

    if let Some(source) = source {
        let (loaded_params, loaded) = match source {
            CovmatSource::Path(path) => load_covmat(path)?,
            CovmatSource::InMemory { params, matrix } => {
                if params.is_empty() {
                    return Err(Error::MissingCovmatParams);
                }
                (params.clone(), matrix.clone())
            }
        };
        validate_loaded(&loaded_params, &loaded)?;

        // Indices of the shared parameters in both orderings
        let shared: Vec<(usize, usize)> = loaded_params
            .iter()
            .enumerate()
            .filter_map(|(i, name)| params.index_of(name).map(|j| (i, j)))
            .collect();
        if shared.is_empty() {
            return Err(Error::DisjointCovmatParams);
        }
        for &(li, si) in &shared {
            for &(lj, sj) in &shared {
                covmat[(si, sj)] = loaded[(li, lj)];
            }
        }
        info!(
            "Covariance matrix loaded for params {:?}",
            shared
                .iter()
                .map(|&(_, j)| params.names()[j])
                .collect::<Vec<_>>()
        );
        let missing: Vec<&str> = params
            .names()
            .into_iter()
            .filter(|n| !loaded_params.iter().any(|l| l == n))
            .collect();
        if missing.is_empty() {
            info!("All parameters' covariance loaded from the given covmat.");
        } else {
            info!("Missing proposal covariance for params {:?}", missing);
        }
    }

    let incomplete = (0..d).any(|i| covmat[(i, i)].is_nan());
    if incomplete {
        for (i, p) in params.params().iter().enumerate() {
            if covmat[(i, i)].is_nan() {
                if let Some(width) = p.proposal {
                    covmat[(i, i)] = width * width;
                }
            }
        }
        let refcov = prior.reference_covmat();
        for i in 0..d {
            if covmat[(i, i)].is_nan() {
                covmat[(i, i)] = refcov[(i, i)];
            }
        }
    }

    for (i, p) in params.params().iter().enumerate() {
        if !(covmat[(i, i)] > 0.0) {
            return Err(Error::MissingWidth(p.name.clone()));
        }
    }
    Ok(AssembledCovmat {
        matrix: covmat,
        incomplete,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::SampledParam;
    use rv::dist::Gaussian;

    fn pz_abc() -> Parameterization {
        Parameterization::new(vec![
            SampledParam::new("a", Box::new(Gaussian::standard())),
            SampledParam::new("b", Box::new(Gaussian::standard())),
            SampledParam::new("c", Box::new(Gaussian::standard())).with_proposal(0.2),
        ])
        .unwrap()
    }

    #[test]
    fn priority_covmat_then_proposal_then_reference() {
        let pz = pz_abc();
        let prior = Prior::new(&pz);
        let source = CovmatSource::InMemory {
            params: vec!["a".into(), "b".into()],
            matrix: DMatrix::from_row_slice(2, 2, &[0.1, 0.01, 0.01, 0.2]),
        };
        let assembled = initial_proposal_covmat(Some(&source), &pz, &prior).unwrap();
        let expected = DMatrix::from_row_slice(
            3,
            3,
            &[0.1, 0.01, 0.0, 0.01, 0.2, 0.0, 0.0, 0.0, 0.04],
        );
        assert!(assembled.matrix.relative_eq(&expected, 1e-12, 1e-12));
        assert!(assembled.incomplete);
    }

    #[test]
    fn complete_covmat_is_not_flagged_incomplete() {
        let pz = Parameterization::new(vec![
            SampledParam::new("a", Box::new(Gaussian::standard())),
            SampledParam::new("b", Box::new(Gaussian::standard())),
        ])
        .unwrap();
        let prior = Prior::new(&pz);
        let source = CovmatSource::InMemory {
            params: vec!["b".into(), "a".into()],
            matrix: DMatrix::from_row_slice(2, 2, &[2.0, 0.5, 0.5, 1.0]),
        };
        let assembled = initial_proposal_covmat(Some(&source), &pz, &prior).unwrap();
        assert!(!assembled.incomplete);
        // Name mapping transposes the loaded ordering
        assert!((assembled.matrix[(0, 0)] - 1.0).abs() < 1e-12);
        assert!((assembled.matrix[(1, 1)] - 2.0).abs() < 1e-12);
        assert!((assembled.matrix[(0, 1)] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn fallback_is_reference_variance() {
        let pz = Parameterization::new(vec![SampledParam::new(
            "a",
            Box::new(Gaussian::new(0.0, 3.0).unwrap()),
        )])
        .unwrap();
        let prior = Prior::new(&pz);
        let assembled = initial_proposal_covmat(None, &pz, &prior).unwrap();
        assert!((assembled.matrix[(0, 0)] - 9.0).abs() < 1e-12);
        assert!(assembled.incomplete);
    }

    #[test]
    fn rejects_non_spd() {
        let pz = pz_abc();
        let prior = Prior::new(&pz);
        let source = CovmatSource::InMemory {
            params: vec!["a".into(), "b".into()],
            matrix: DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]),
        };
        assert!(matches!(
            initial_proposal_covmat(Some(&source), &pz, &prior),
            Err(Error::CovmatNotPosDef)
        ));
    }

    #[test]
    fn rejects_duplicate_and_disjoint_names() {
        let pz = pz_abc();
        let prior = Prior::new(&pz);
        let dup = CovmatSource::InMemory {
            params: vec!["a".into(), "a".into()],
            matrix: DMatrix::identity(2, 2),
        };
        assert!(matches!(
            initial_proposal_covmat(Some(&dup), &pz, &prior),
            Err(Error::DuplicateCovmatParams)
        ));
        let disjoint = CovmatSource::InMemory {
            params: vec!["x".into(), "y".into()],
            matrix: DMatrix::identity(2, 2),
        };
        assert!(matches!(
            initial_proposal_covmat(Some(&disjoint), &pz, &prior),
            Err(Error::DisjointCovmatParams)
        ));
    }

    #[test]
    fn file_round_trip_is_exact() {
        let names = vec!["a".to_string(), "b".to_string()];
        let matrix =
            DMatrix::from_row_slice(2, 2, &[1.0 / 3.0, 0.017, 0.017, 2.0 / 7.0]);
        let path = std::env::temp_dir().join(format!(
            "fastslow_covmat_{}.txt",
            std::process::id()
        ));
        save_covmat(&path, &names, &matrix).unwrap();
        let (loaded_names, loaded) = load_covmat(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded_names, names);
        assert_eq!(loaded, matrix);
    }

    #[test]
    fn rejects_missing_header() {
        let path = std::env::temp_dir().join(format!(
            "fastslow_badcov_{}.txt",
            std::process::id()
        ));
        std::fs::write(&path, "1.0 0.0\n0.0 1.0\n").unwrap();
        let res = load_covmat(&path);
        std::fs::remove_file(&path).ok();
        assert!(matches!(res, Err(Error::CovmatFormat(_))));
    }
}
