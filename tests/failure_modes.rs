//! Failure handling and output plumbing

use std::fs::File;
use std::io::{BufRead, BufReader};

use fastslow::{
    CovmatSource, Error, FnPosterior, McmcOptions, Parameterization, Runner,
    SampledParam, SampleWriter, TextWriter,
};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rv::dist::Gaussian;

#[test]
fn stuck_chain_aborts_with_a_clear_error() {
    let _ = env_logger::builder().is_test(true).try_init();

    // Point mass at the origin: the posterior is finite only in a sliver
    // the proposal always jumps out of
    let posterior = FnPosterior::new(vec!["x"], |v: &DVector<f64>| {
        if v[0].abs() < 1e-9 {
            0.0
        } else {
            f64::NEG_INFINITY
        }
    });
    let params = Parameterization::new(vec![SampledParam::new(
        "x",
        Box::new(Gaussian::new(0.0, 1e-12).unwrap()),
    )])
    .unwrap();

    let mut rng = StdRng::seed_from_u64(0xBAD);
    let result = Runner::new(&params, &posterior)
        .options(
            McmcOptions::new()
                .max_samples(10_000)
                .max_tries(100)
                .learn_proposal(false),
        )
        .covmat(CovmatSource::InMemory {
            params: vec!["x".into()],
            matrix: DMatrix::identity(1, 1),
        })
        .run(&mut rng);

    match result {
        Err(Error::StuckChain { tries: 100 }) => {}
        other => panic!(
            "expected a stuck-chain error, got {:?}",
            other.map(|cs| cs.len())
        ),
    }
}

#[test]
fn text_writer_receives_every_stored_sample() {
    let path = std::env::temp_dir().join(format!(
        "fastslow_chain_out_{}.txt",
        std::process::id()
    ));
    {
        let posterior =
            FnPosterior::new(vec!["x"], |v: &DVector<f64>| -0.5 * v[0] * v[0]);
        let params = Parameterization::new(vec![SampledParam::new(
            "x",
            Box::new(Gaussian::standard()),
        )])
        .unwrap();

        let path_for_writer = path.clone();
        let writers = move |_rank: usize| -> Box<dyn SampleWriter> {
            Box::new(TextWriter::new(File::create(&path_for_writer).unwrap()))
        };
        let mut rng = StdRng::seed_from_u64(0x0D0);
        let collections = Runner::new(&params, &posterior)
            .options(
                McmcOptions::new()
                    .max_samples(500)
                    .output_every(64)
                    .learn_proposal(false),
            )
            .writers(&writers)
            .run(&mut rng)
            .unwrap();
        assert_eq!(collections[0].n(), 500);
    }

    let rows = BufReader::new(File::open(&path).unwrap())
        .lines()
        .filter(|l| l.as_ref().map(|s| !s.is_empty()).unwrap_or(false))
        .count();
    std::fs::remove_file(&path).ok();
    assert_eq!(rows, 500);
}
