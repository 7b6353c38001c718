//! Crate-wide error type

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Alias for results produced by this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised during configuration, initialization or sampling
#[derive(Debug, Error)]
pub enum Error {
    /// Oversampling and fast-dragging are mutually exclusive schemes
    #[error("choose either oversampling or fast-dragging, not both")]
    ConflictingSchemes,

    /// `drag_nfast_times` and `drag_interp_steps` are mutually exclusive
    #[error(
        "to specify the number of dragging interpolating steps, use either \
         `drag_nfast_times` or `drag_interp_steps`, not both"
    )]
    ConflictingDragOptions,

    /// A speed hierarchy is required but all block speeds coincide
    #[error("all likelihood speeds are equal: no {0} possible")]
    UniformSpeeds(&'static str),

    /// `max_speed_slow` does not split the speed ordering
    #[error("`max_speed_slow` must be {min} <= max_speed_slow < {max}, and is {got}")]
    BadMaxSpeedSlow {
        /// Smallest block speed
        min: f64,
        /// Largest block speed
        max: f64,
        /// The offending configured value
        got: f64,
    },

    /// Parameter blocks must partition the sampled parameters
    #[error("parameter blocks must cover every sampled parameter exactly once")]
    BadBlocks,

    /// A speed block names a parameter that is not sampled
    #[error("unknown parameter '{0}' in speed blocks")]
    UnknownParam(String),

    /// Sampled parameter names must be unique
    #[error("duplicated sampled parameter name '{0}'")]
    DuplicateParam(String),

    /// The covariance file could not be read
    #[error("can't open covmat file '{path}': {source}")]
    CovmatIo {
        /// Path of the offending file
        path: PathBuf,
        /// Underlying I/O failure
        source: io::Error,
    },

    /// The covariance file or matrix has an invalid layout
    #[error("malformed covmat: {0}")]
    CovmatFormat(String),

    /// The supplied covariance is not symmetric positive-definite
    #[error("the covmat is not a positive-definite, symmetric square matrix")]
    CovmatNotPosDef,

    /// The covariance header repeats a parameter name
    #[error("there are duplicated parameters in the covmat header")]
    DuplicateCovmatParams,

    /// None of the covariance's parameters are sampled here
    #[error(
        "a proposal covariance matrix has been loaded, but none of its \
         parameters are actually sampled here; maybe a mismatch between \
         parameter names in the covariance matrix and the input?"
    )]
    DisjointCovmatParams,

    /// An in-memory covariance was passed without its parameter names
    #[error(
        "if a covariance matrix is passed in memory, you also need to pass \
         the parameters it corresponds to via `covmat_params`"
    )]
    MissingCovmatParams,

    /// No proposal width could be derived for a parameter
    #[error(
        "no proposal width for parameter '{0}': provide a covmat entry, a \
         proposal width, or a reference/prior with finite variance"
    )]
    MissingWidth(String),

    /// The reference distribution never produced a finite posterior
    #[error(
        "could not find a starting point with finite posterior after {tries} \
         tries; try improving your reference point/distribution"
    )]
    InitialPointFailed {
        /// Number of reference draws attempted
        tries: u64,
    },

    /// The chain rejected more consecutive proposals than `max_tries`
    #[error(
        "the chain has been stuck for {tries} attempts; stopping sampling. \
         If this has happened often, try improving your reference \
         point/distribution"
    )]
    StuckChain {
        /// The configured `max_tries` threshold that was exceeded
        tries: u64,
    },

    /// A sample writer failed
    #[error("sample output failed: {0}")]
    Output(#[from] io::Error),
}
