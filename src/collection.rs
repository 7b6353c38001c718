//! Weighted sample storage

use std::io::{self, Write};

use itertools::Itertools;
use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::error::Result;
use crate::posterior::Evaluation;

/// One chain state: sampled values, cached posterior components and the
/// number of consecutive proposals it survived (its weight).
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde_support", derive(serde::Serialize, serde::Deserialize))]
pub struct OnePoint {
    /// Sampled parameter values
    pub values: DVector<f64>,
    /// Log-posterior at `values`
    pub logpost: f64,
    /// Log-prior at `values`
    pub logprior: f64,
    /// Per-likelihood log-likelihoods
    pub logliks: Vec<f64>,
    /// Derived parameter values
    pub derived: Vec<f64>,
    /// Rejections survived, counted inclusively (a fresh point weighs 1)
    pub weight: u64,
}

impl OnePoint {
    /// Seat an evaluation as a fresh point with weight one
    pub fn new(values: DVector<f64>, eval: Evaluation) -> Self {
        OnePoint {
            values,
            logpost: eval.logpost,
            logprior: eval.logprior,
            logliks: eval.logliks,
            derived: eval.derived,
            weight: 1,
        }
    }

    /// Account for `k` more rejected proposals
    pub fn increase_weight(&mut self, k: u64) {
        self.weight += k;
    }
}

/// Sink for accepted samples, flushed in batches by the chain driver
pub trait SampleWriter: Send {
    /// Persist a batch of points, in chain order
    fn write_points(&mut self, points: &[OnePoint]) -> io::Result<()>;
}

/// Plain-text writer: one `weight logpost values... derived...` row per point
pub struct TextWriter<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> TextWriter<W> {
    /// Wrap an output stream
    pub fn new(out: W) -> Self {
        TextWriter { out }
    }
}

impl<W: Write + Send> SampleWriter for TextWriter<W> {
    fn write_points(&mut self, points: &[OnePoint]) -> io::Result<()> {
        for p in points {
            write!(self.out, "{} {:.10e}", p.weight, p.logpost)?;
            for v in p.values.iter() {
                write!(self.out, " {:.10e}", v)?;
            }
            for v in &p.derived {
                write!(self.out, " {:.10e}", v)?;
            }
            writeln!(self.out)?;
        }
        self.out.flush()
    }
}

/// Append-only, single-writer store of the accepted chain points
#[derive(Default)]
pub struct Collection {
    points: Vec<OnePoint>,
    n_written: usize,
    writer: Option<Box<dyn SampleWriter>>,
}

impl Collection {
    /// Empty collection with no output sink
    pub fn new() -> Self {
        Collection {
            points: Vec::new(),
            n_written: 0,
            writer: None,
        }
    }

    /// Empty collection flushing through `writer`
    pub fn with_writer(writer: Box<dyn SampleWriter>) -> Self {
        Collection {
            points: Vec::new(),
            n_written: 0,
            writer: Some(writer),
        }
    }

    /// Number of stored points (not the sum of their weights)
    pub fn n(&self) -> usize {
        self.points.len()
    }

    /// All stored points in chain order
    pub fn points(&self) -> &[OnePoint] {
        &self.points
    }

    /// Append an accepted point
    pub fn add(&mut self, point: OnePoint) {
        self.points.push(point);
    }

    /// Total weight stored
    pub fn sum_weights(&self) -> u64 {
        self.points.iter().map(|p| p.weight).sum()
    }

    /// Weight-averaged mean over points `first..`
    pub fn mean(&self, first: usize) -> DVector<f64> {
        let pts = &self.points[first..];
        let d = pts[0].values.len();
        let w_tot: f64 = pts.iter().map(|p| p.weight as f64).sum();
        let mut mean = DVector::zeros(d);
        for p in pts {
            mean += &p.values * (p.weight as f64);
        }
        mean / w_tot
    }

    /// Weighted sample covariance over points `first..`, with the usual
    /// `sum(w) - 1` normalization for frequency weights
    pub fn cov(&self, first: usize) -> DMatrix<f64> {
        let pts = &self.points[first..];
        let d = pts[0].values.len();
        let mean = self.mean(first);
        let w_tot: f64 = pts.iter().map(|p| p.weight as f64).sum();
        let mut cov = DMatrix::zeros(d, d);
        for p in pts {
            let delta = &p.values - &mean;
            cov += (&delta * delta.transpose()) * (p.weight as f64);
        }
        cov / (w_tot - 1.0)
    }

    /// Weighted marginal quantile bound for parameter `index` over points
    /// `first..`: the lower bound when `upper` is false, at tail mass
    /// `limfrac`; linearly interpolated between sample values.
    pub fn confidence(&self, first: usize, index: usize, limfrac: f64, upper: bool) -> f64 {
        let pts = &self.points[first..];
        let pairs: Vec<(f64, f64)> = pts
            .iter()
            .map(|p| (p.values[index], p.weight as f64))
            .sorted_by(|a, b| a.0.partial_cmp(&b.0).expect("non-finite sample value"))
            .collect();
        let w_tot: f64 = pairs.iter().map(|(_, w)| w).sum();
        let target = if upper {
            (1.0 - limfrac) * w_tot
        } else {
            limfrac * w_tot
        };

        let mut cum = 0.0;
        for (i, &(x, w)) in pairs.iter().enumerate() {
            let next = cum + w;
            if next >= target {
                if i == 0 {
                    return x;
                }
                let (x_prev, _) = pairs[i - 1];
                let frac = (target - cum) / w;
                return x_prev + frac * (x - x_prev);
            }
            cum = next;
        }
        pairs.last().map(|&(x, _)| x).unwrap_or(f64::NAN)
    }

    /// Flush points not yet written through the output sink, if any
    pub fn out_update(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            let fresh = &self.points[self.n_written..];
            if !fresh.is_empty() {
                debug!("Flushing {} samples to output.", fresh.len());
                writer.write_points(fresh)?;
            }
        }
        self.n_written = self.points.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(values: Vec<f64>, weight: u64) -> OnePoint {
        let mut p = OnePoint::new(
            DVector::from_vec(values),
            Evaluation::from_logpost(0.0),
        );
        p.weight = weight;
        p
    }

    fn sample() -> Collection {
        let mut c = Collection::new();
        c.add(point(vec![1.0, 0.0], 1));
        c.add(point(vec![2.0, 1.0], 2));
        c.add(point(vec![4.0, -1.0], 1));
        c
    }

    #[test]
    fn weighted_mean() {
        let c = sample();
        let mean = c.mean(0);
        // (1 + 2*2 + 4) / 4, (0 + 2*1 - 1) / 4
        assert!((mean[0] - 2.25).abs() < 1e-12);
        assert!((mean[1] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn weighted_cov_matches_expanded_sample() {
        let c = sample();
        // Expanding weights into repeated rows must give the same covariance
        let mut expanded = Collection::new();
        expanded.add(point(vec![1.0, 0.0], 1));
        expanded.add(point(vec![2.0, 1.0], 1));
        expanded.add(point(vec![2.0, 1.0], 1));
        expanded.add(point(vec![4.0, -1.0], 1));
        let a = c.cov(0);
        let b = expanded.cov(0);
        assert!(a.relative_eq(&b, 1e-12, 1e-12));
    }

    #[test]
    fn confidence_bounds_bracket_the_median_mass() {
        let mut c = Collection::new();
        for i in 0..100 {
            c.add(point(vec![i as f64], 1));
        }
        let lo = c.confidence(0, 0, 0.025, false);
        let hi = c.confidence(0, 0, 0.025, true);
        assert!(lo < 5.0, "lo = {}", lo);
        assert!(hi > 94.0, "hi = {}", hi);
        assert!(lo < hi);
    }

    #[test]
    fn out_update_writes_each_point_once() {
        use std::sync::{Arc, Mutex};

        #[derive(Clone)]
        struct CountingWriter(Arc<Mutex<usize>>);
        impl SampleWriter for CountingWriter {
            fn write_points(&mut self, points: &[OnePoint]) -> io::Result<()> {
                *self.0.lock().unwrap() += points.len();
                Ok(())
            }
        }

        let count = Arc::new(Mutex::new(0));
        let mut c = Collection::with_writer(Box::new(CountingWriter(count.clone())));
        c.add(point(vec![0.0], 1));
        c.add(point(vec![1.0], 1));
        c.out_update().unwrap();
        c.add(point(vec![2.0], 1));
        c.out_update().unwrap();
        c.out_update().unwrap();
        assert_eq!(*count.lock().unwrap(), 3);
    }
}
