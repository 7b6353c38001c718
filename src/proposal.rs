//! Blocked proposal distribution
//!
//! Trial moves perturb one speed block at a time. Within a block, a
//! direction is taken from a per-cycle random rotation and a step length
//! from a Gaussian/exponential mixture, which keeps the proposal robust to a
//! misestimated scale. A perturbation of a slow block drags every faster
//! block along its conditional expectation, so the joint covariance
//! structure across blocks is preserved.

use log::debug;
use nalgebra::{Cholesky, DMatrix, DVector};
use rand::seq::SliceRandom;
use rand::Rng;
use rv::dist::{Exponential, Gaussian};
use rv::traits::Rv;

use crate::error::{Error, Result};

/// Probability of drawing the step length from the exponential tail of the
/// mixture rather than from a half-Gaussian.
const EXPONENTIAL_FRACTION: f64 = 1.0 / 3.0;

/// Cycles through a fixed multiset of indices, reshuffling at the start of
/// every cycle.
pub struct CyclicIndexRandomizer {
    indices: Vec<usize>,
    loop_index: usize,
}

impl CyclicIndexRandomizer {
    /// Cycle over an explicit multiset of indices
    pub fn new(indices: Vec<usize>) -> Self {
        assert!(!indices.is_empty(), "cannot cycle over an empty index set");
        let loop_index = indices.len();
        CyclicIndexRandomizer {
            indices,
            loop_index,
        }
    }

    /// Next index, starting a freshly shuffled cycle when the last is spent
    pub fn next<R: Rng>(&mut self, rng: &mut R) -> usize {
        self.loop_index += 1;
        if self.loop_index >= self.indices.len() {
            self.indices.shuffle(rng);
            self.loop_index = 0;
        }
        self.indices[self.loop_index]
    }
}

/// Step length of the mixture proposal: half-Gaussian most of the time, an
/// exponential with unit mean otherwise.
fn propose_r<R: Rng>(rng: &mut R) -> f64 {
    if rng.gen::<f64>() < EXPONENTIAL_FRACTION {
        let exp: f64 = Exponential::new(1.0).unwrap().draw(rng);
        exp
    } else {
        let gauss: f64 = Gaussian::standard().draw(rng);
        gauss.abs()
    }
}

/// Haar-random rotation: QR of a Gaussian matrix with the sign ambiguity
/// fixed from the diagonal of R.
fn random_rotation<R: Rng>(n: usize, rng: &mut R) -> DMatrix<f64> {
    let standard = Gaussian::standard();
    let a = DMatrix::from_fn(n, n, |_, _| {
        let x: f64 = standard.draw(rng);
        x
    });
    let qr = a.qr();
    let signs = qr
        .r()
        .diagonal()
        .map(|x| if x < 0.0 { -1.0 } else { 1.0 });
    qr.q() * DMatrix::from_diagonal(&signs)
}

/// Per-block direction sampler: directions are the columns of a random
/// rotation, consumed one per proposal and redrawn every full cycle so that
/// consecutive steps in a block stay orthogonal.
struct RandDirectionProposer {
    n: usize,
    rotation: DMatrix<f64>,
    loop_index: usize,
}

impl RandDirectionProposer {
    fn new(n: usize) -> Self {
        RandDirectionProposer {
            n,
            rotation: DMatrix::identity(n, n),
            loop_index: n,
        }
    }

    /// Direction times mixture step length times `scale`, in the block's
    /// transformed frame
    fn propose_vec<R: Rng>(&mut self, scale: f64, rng: &mut R) -> DVector<f64> {
        self.loop_index += 1;
        if self.loop_index >= self.n {
            self.rotation = random_rotation(self.n, rng);
            self.loop_index = 0;
        }
        self.rotation.column(self.loop_index) * (propose_r(rng) * scale)
    }
}

/// Covariance-dependent state, rebuilt as one unit on `set_covariance`
struct Prepared {
    /// Lower Cholesky factor of each block's sub-covariance
    chol: Vec<DMatrix<f64>>,
    /// `shifts[i][j]`: conditional-mean response of block `i + 1 + j` to a
    /// perturbation of block `i`
    shifts: Vec<Vec<DMatrix<f64>>>,
}

/// Proposal density over speed-ordered parameter blocks
pub struct BlockedProposer {
    blocks: Vec<Vec<usize>>,
    i_last_slow_block: Option<usize>,
    propose_scale: f64,
    d: usize,
    block_cycler: CyclicIndexRandomizer,
    slow_cycler: Option<CyclicIndexRandomizer>,
    fast_cycler: Option<CyclicIndexRandomizer>,
    directions: Vec<RandDirectionProposer>,
    prepared: Option<Prepared>,
}

impl BlockedProposer {
    /// Create a proposer over `blocks` of sampled-parameter indices, ordered
    /// slowest block first. `oversampling_factors` weight how often each
    /// block is picked; `i_last_slow_block` marks the end of the slow prefix
    /// used by the split slow/fast proposals.
    ///
    /// `set_covariance` must be called before the first proposal.
    pub fn new(
        blocks: Vec<Vec<usize>>,
        oversampling_factors: Option<&[usize]>,
        i_last_slow_block: Option<usize>,
        propose_scale: f64,
    ) -> Result<Self> {
        assert!(propose_scale > 0.0, "cannot propose with scale <= 0");
        let d: usize = blocks.iter().map(Vec::len).sum();
        let mut seen = vec![false; d];
        for &i in blocks.iter().flatten() {
            if i >= d || seen[i] {
                return Err(Error::BadBlocks);
            }
            seen[i] = true;
        }
        if d == 0 || blocks.iter().any(Vec::is_empty) {
            return Err(Error::BadBlocks);
        }
        let factors: Vec<usize> = match oversampling_factors {
            Some(f) => {
                if f.len() != blocks.len() || f.iter().any(|&x| x == 0) {
                    return Err(Error::BadBlocks);
                }
                f.to_vec()
            }
            None => vec![1; blocks.len()],
        };
        if let Some(i_last) = i_last_slow_block {
            if i_last + 1 >= blocks.len() {
                return Err(Error::BadBlocks);
            }
        }

        // Block j shows up |b_j| * f_j times per cycle, so at unit factors
        // every parameter is proposed equally often
        let schedule: Vec<usize> = blocks
            .iter()
            .enumerate()
            .flat_map(|(j, b)| std::iter::repeat(j).take(b.len() * factors[j]))
            .collect();
        let slow_cycler = i_last_slow_block.map(|i_last| {
            CyclicIndexRandomizer::new(
                blocks[..=i_last]
                    .iter()
                    .enumerate()
                    .flat_map(|(j, b)| std::iter::repeat(j).take(b.len()))
                    .collect(),
            )
        });
        let fast_cycler = i_last_slow_block.map(|i_last| {
            CyclicIndexRandomizer::new(
                blocks
                    .iter()
                    .enumerate()
                    .skip(i_last + 1)
                    .flat_map(|(j, b)| std::iter::repeat(j).take(b.len()))
                    .collect(),
            )
        });
        let directions = blocks
            .iter()
            .map(|b| RandDirectionProposer::new(b.len()))
            .collect();

        Ok(BlockedProposer {
            block_cycler: CyclicIndexRandomizer::new(schedule),
            slow_cycler,
            fast_cycler,
            directions,
            prepared: None,
            d,
            i_last_slow_block,
            propose_scale,
            blocks,
        })
    }

    /// Dimension of the sampled space
    pub fn d(&self) -> usize {
        self.d
    }

    /// Install a new proposal covariance.
    ///
    /// Factors every block's sub-covariance and precomputes the
    /// conditional-mean responses of later blocks. The previous state is
    /// kept untouched if the matrix is not positive-definite.
    pub fn set_covariance(&mut self, covmat: &DMatrix<f64>) -> Result<()> {
        if covmat.nrows() != self.d || covmat.ncols() != self.d {
            return Err(Error::CovmatFormat(format!(
                "proposal covariance must be {0}x{0}",
                self.d
            )));
        }
        let mut chol = Vec::with_capacity(self.blocks.len());
        let mut shifts = Vec::with_capacity(self.blocks.len());
        for (i, block) in self.blocks.iter().enumerate() {
            let sub = DMatrix::from_fn(block.len(), block.len(), |r, c| {
                covmat[(block[r], block[c])]
            });
            let factor = Cholesky::new(sub).ok_or(Error::CovmatNotPosDef)?;
            let inv = factor.inverse();
            let mut block_shifts = Vec::new();
            for later in &self.blocks[i + 1..] {
                let cross = DMatrix::from_fn(later.len(), block.len(), |r, c| {
                    covmat[(later[r], block[c])]
                });
                block_shifts.push(cross * &inv);
            }
            chol.push(factor.l());
            shifts.push(block_shifts);
        }
        self.prepared = Some(Prepared { chol, shifts });
        debug!("Proposal covariance set ({} blocks).", self.blocks.len());
        Ok(())
    }

    fn perturb_block<R: Rng>(&mut self, i: usize, x: &mut DVector<f64>, rng: &mut R) {
        let prepared = self
            .prepared
            .as_ref()
            .expect("set_covariance must be called before proposing");
        let step = self.directions[i].propose_vec(self.propose_scale, rng);
        let delta = &prepared.chol[i] * step;
        for (k, &pi) in self.blocks[i].iter().enumerate() {
            x[pi] += delta[k];
        }
        for (j, shift) in prepared.shifts[i].iter().enumerate() {
            let dragged = shift * &delta;
            for (k, &pi) in self.blocks[i + 1 + j].iter().enumerate() {
                x[pi] += dragged[k];
            }
        }
    }

    /// Perturb one block of `x` in place, chosen from the oversampling-
    /// weighted cyclic schedule, with conditional shifts in later blocks
    pub fn get_proposal<R: Rng>(&mut self, x: &mut DVector<f64>, rng: &mut R) {
        let i = self.block_cycler.next(rng);
        self.perturb_block(i, x, rng);
    }

    /// Perturb one slow block of `x` in place; faster blocks move along
    /// their conditional expectations
    pub fn get_proposal_slow<R: Rng>(&mut self, x: &mut DVector<f64>, rng: &mut R) {
        let i = self
            .slow_cycler
            .as_mut()
            .expect("no slow/fast split configured")
            .next(rng);
        self.perturb_block(i, x, rng);
    }

    /// Write a fast-subspace perturbation into `delta` (usually zeroed by
    /// the caller); slow entries are never touched
    pub fn get_proposal_fast<R: Rng>(&mut self, delta: &mut DVector<f64>, rng: &mut R) {
        let i = self
            .fast_cycler
            .as_mut()
            .expect("no slow/fast split configured")
            .next(rng);
        self.perturb_block(i, delta, rng);
    }

    /// Index of the last slow block, when a slow/fast split is configured
    pub fn i_last_slow_block(&self) -> Option<usize> {
        self.i_last_slow_block
    }
}
