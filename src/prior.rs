//! Joint prior view over the sampled parameters

use nalgebra::{DMatrix, DVector};
use rand::Rng;

use crate::parameter::Parameterization;

/// Read-only facet of the parameterization used to seed and scale chains:
/// reference draws for starting points and a diagonal reference covariance.
pub struct Prior<'a> {
    params: &'a Parameterization,
}

impl<'a> Prior<'a> {
    /// Wrap a parameterization
    pub fn new(params: &'a Parameterization) -> Self {
        Prior { params }
    }

    /// Dimensionality of the sampled space
    pub fn d(&self) -> usize {
        self.params.d()
    }

    /// Draw one point from the reference pdfs (prior where no reference is set)
    pub fn reference<R: Rng>(&self, rng: &mut R) -> DVector<f64> {
        DVector::from_iterator(
            self.params.d(),
            self.params.params().iter().map(|p| p.draw_reference(rng)),
        )
    }

    /// Diagonal covariance built from reference pdf variances, falling back
    /// to prior variances. Entries with no defined variance are NaN and must
    /// be supplied through another source before sampling.
    pub fn reference_covmat(&self) -> DMatrix<f64> {
        let diag = DVector::from_iterator(
            self.params.d(),
            self.params
                .params()
                .iter()
                .map(|p| p.reference_variance().unwrap_or(f64::NAN)),
        );
        DMatrix::from_diagonal(&diag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::SampledParam;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rv::dist::{Gaussian, Uniform};

    fn pz() -> Parameterization {
        Parameterization::new(vec![
            SampledParam::new("a", Box::new(Gaussian::new(1.0, 2.0).unwrap())),
            SampledParam::new("b", Box::new(Uniform::new(0.0, 1.0).unwrap()))
                .with_ref(Box::new(Gaussian::new(0.5, 0.1).unwrap())),
        ])
        .unwrap()
    }

    #[test]
    fn reference_covmat_diagonal() {
        let pz = pz();
        let prior = Prior::new(&pz);
        let cov = prior.reference_covmat();
        assert_eq!(cov.nrows(), 2);
        assert!((cov[(0, 0)] - 4.0).abs() < 1e-12);
        assert!((cov[(1, 1)] - 0.01).abs() < 1e-12);
        assert_eq!(cov[(0, 1)], 0.0);
    }

    #[test]
    fn reference_draw_has_right_dimension() {
        let pz = pz();
        let prior = Prior::new(&pz);
        let mut rng = StdRng::seed_from_u64(42);
        let x = prior.reference(&mut rng);
        assert_eq!(x.len(), 2);
    }
}
