//! Sampled parameters and their one-dimensional densities

use std::fmt;

use rand::RngCore;
use rv::traits::{Mean, Rv, Variance};

use crate::error::{Error, Result};

/// Object-safe view of a one-dimensional probability density.
///
/// Blanket-implemented for every `rv` distribution with a mean and a
/// variance, so priors and reference pdfs can be boxed side by side.
pub trait ScalarDist: Send + Sync {
    /// Draw one value
    fn draw(&self, rng: &mut dyn RngCore) -> f64;
    /// Mean of the density, if defined
    fn mean(&self) -> Option<f64>;
    /// Variance of the density, if defined
    fn variance(&self) -> Option<f64>;
}

impl<D> ScalarDist for D
where
    D: Rv<f64> + Mean<f64> + Variance<f64> + Send + Sync,
{
    fn draw(&self, mut rng: &mut dyn RngCore) -> f64 {
        Rv::draw(self, &mut rng)
    }

    fn mean(&self) -> Option<f64> {
        Mean::mean(self)
    }

    fn variance(&self) -> Option<f64> {
        Variance::variance(self)
    }
}

/// One sampled parameter: its prior, and optionally a reference pdf used to
/// draw starting points and an explicit proposal width.
pub struct SampledParam {
    /// Name of the parameter (must be unique)
    pub name: String,
    /// Prior density over the sampled domain
    pub prior: Box<dyn ScalarDist>,
    /// Reference pdf for the chain's starting point; the prior is used if absent
    pub ref_dist: Option<Box<dyn ScalarDist>>,
    /// Proposal standard deviation, overriding the reference/prior width
    pub proposal: Option<f64>,
}

impl fmt::Debug for SampledParam {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SampledParam {{ name: {} }}", self.name)
    }
}

impl SampledParam {
    /// Create a parameter with the given prior and no reference pdf
    pub fn new<S: Into<String>>(name: S, prior: Box<dyn ScalarDist>) -> Self {
        SampledParam {
            name: name.into(),
            prior,
            ref_dist: None,
            proposal: None,
        }
    }

    /// Attach a reference pdf for the initial point
    pub fn with_ref(mut self, ref_dist: Box<dyn ScalarDist>) -> Self {
        self.ref_dist = Some(ref_dist);
        self
    }

    /// Set an explicit proposal standard deviation
    pub fn with_proposal(mut self, width: f64) -> Self {
        self.proposal = Some(width);
        self
    }

    /// Draw one value from the reference pdf, falling back to the prior
    pub fn draw_reference(&self, rng: &mut dyn RngCore) -> f64 {
        match &self.ref_dist {
            Some(r) => r.draw(rng),
            None => self.prior.draw(rng),
        }
    }

    /// Variance of the reference pdf if defined, otherwise of the prior
    pub fn reference_variance(&self) -> Option<f64> {
        self.ref_dist
            .as_ref()
            .and_then(|r| r.variance())
            .or_else(|| self.prior.variance())
    }
}

/// Ordered list of the sampled parameters
pub struct Parameterization {
    params: Vec<SampledParam>,
}

impl Parameterization {
    /// Build a parameterization, checking that names are unique
    pub fn new(params: Vec<SampledParam>) -> Result<Self> {
        for (i, p) in params.iter().enumerate() {
            if params[..i].iter().any(|q| q.name == p.name) {
                return Err(Error::DuplicateParam(p.name.clone()));
            }
        }
        Ok(Parameterization { params })
    }

    /// Number of sampled parameters
    pub fn d(&self) -> usize {
        self.params.len()
    }

    /// The parameters, in sampling order
    pub fn params(&self) -> &[SampledParam] {
        &self.params
    }

    /// Parameter names in sampling order
    pub fn names(&self) -> Vec<&str> {
        self.params.iter().map(|p| p.name.as_str()).collect()
    }

    /// Position of a parameter by name
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name == name)
    }
}

impl fmt::Debug for Parameterization {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Parameterization {{ d: {} }}", self.d())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rv::dist::{Gaussian, Uniform};

    #[test]
    fn unique_names_enforced() {
        let params = vec![
            SampledParam::new("a", Box::new(Gaussian::standard())),
            SampledParam::new("a", Box::new(Gaussian::standard())),
        ];
        assert!(Parameterization::new(params).is_err());
    }

    #[test]
    fn reference_falls_back_to_prior() {
        let mut rng = StdRng::seed_from_u64(0x5EED);
        let p = SampledParam::new("x", Box::new(Uniform::new(2.0, 3.0).unwrap()));
        for _ in 0..32 {
            let x = p.draw_reference(&mut rng);
            assert!((2.0..3.0).contains(&x));
        }
    }

    #[test]
    fn reference_variance_prefers_ref_pdf() {
        let p = SampledParam::new("x", Box::new(Gaussian::standard()))
            .with_ref(Box::new(Gaussian::new(0.0, 0.2).unwrap()));
        let var = p.reference_variance().unwrap();
        assert!((var - 0.04).abs() < 1e-12);
    }

    #[test]
    fn index_lookup() {
        let pz = Parameterization::new(vec![
            SampledParam::new("a", Box::new(Gaussian::standard())),
            SampledParam::new("b", Box::new(Gaussian::standard())),
        ])
        .unwrap();
        assert_eq!(pz.index_of("b"), Some(1));
        assert_eq!(pz.index_of("c"), None);
        assert_eq!(pz.names(), vec!["a", "b"]);
    }
}
