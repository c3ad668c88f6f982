//! Prefix probability mass over a byte-level token vocabulary.
//!
//! A [`Trie`] is built once from the vocabulary. An [`Aggregate`] turns a
//! next-token distribution into one mass per trie node: the total
//! probability of every token whose bytes start with that node's prefix.
//! The [`Scheduler`] coalesces concurrent single-distribution requests into
//! batched aggregator calls.

use std::str::FromStr;
use std::sync::Arc;

pub mod parallel;
pub mod sched;
pub mod sequential;
pub mod trie;

pub use parallel::{Parallel, Placement};
pub use sched::{SchedParams, Scheduler};
pub use sequential::Sequential;
pub use trie::Trie;

/// Position of an entry in the vocabulary.
pub type TokenId = u32;

/// Dense trie node id, `0..node_count`. The root is always `0`.
pub type NodeId = usize;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("invalid vocabulary: tokens {first} and {second} share the byte string {prefix:?}")]
    InvalidVocabulary {
        first: TokenId,
        second: TokenId,
        prefix: Vec<u8>,
    },

    #[error("invalid vocabulary: {0} entries do not fit a token id")]
    VocabularyTooLarge(usize),

    #[error("distribution has {got} entries, vocabulary has {want}")]
    Dimension { want: usize, got: usize },

    #[error("dispatch of a batch of {size} failed: {source}")]
    Dispatch {
        size: usize,
        #[source]
        source: Arc<Error>,
    },

    #[error("array backend: {0}")]
    Backend(Arc<candle_core::Error>),

    #[error("aggregator returned {got} rows for a batch of {want}")]
    RowCount { want: usize, got: usize },

    #[error("aggregator panicked: {0}")]
    Panic(String),

    #[error("scheduler is shut down")]
    Shutdown,

    #[error("parse error: {0}")]
    Parse(String),
}

impl From<candle_core::Error> for Error {
    fn from(e: candle_core::Error) -> Self {
        Self::Backend(Arc::new(e))
    }
}

impl Error {
    /// Whether this error stems from a malformed vocabulary.
    pub fn is_vocabulary(&self) -> bool {
        matches!(self, Self::InvalidVocabulary { .. } | Self::VocabularyTooLarge(_))
    }
}

/// Batched prefix mass aggregation over a shared trie.
pub trait Aggregate: Send + Sync + 'static {
    fn trie(&self) -> &Trie;

    /// One mass vector per distribution, in input order. An empty batch
    /// yields an empty result.
    fn batch_mass_sum(&self, batch: &[Vec<f64>]) -> Result<Vec<Vec<f64>>>;

    fn mass_sum(&self, dist: &[f64]) -> Result<Vec<f64>> {
        let mut out = self.batch_mass_sum(&[dist.to_vec()])?;
        Ok(out.pop().unwrap_or_default())
    }
}

/// Which aggregator serves a scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Backend {
    #[default]
    Sequential,
    Parallel(Placement),
}

impl Backend {
    pub fn aggregator(self, trie: Arc<Trie>) -> Result<Arc<dyn Aggregate>> {
        let agg: Arc<dyn Aggregate> = match self {
            Backend::Sequential => Arc::new(Sequential::new(trie)),
            Backend::Parallel(p) => Arc::new(Parallel::new(trie, p)?),
        };

        Ok(agg)
    }
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            None if s == "sequential" => Ok(Backend::Sequential),
            None if s == "parallel" => Ok(Backend::Parallel(Placement::default())),
            Some(("parallel", device)) => device.parse().map(Backend::Parallel),

            _ => Err(Error::Parse(format!(
                "expected 'sequential' | 'parallel[:device]', got {s:?}"
            ))),
        }
    }
}

/// Largest relative error between two equally shaped mass vectors.
///
/// Entries where both sides are zero count as exact.
///
/// # Panics
///
/// If `have` and `want` differ in length.
pub fn max_rel_err(have: &[f64], want: &[f64]) -> f64 {
    assert_eq!(have.len(), want.len(), "mass vectors differ in length");

    std::iter::zip(have, want)
        .map(|(&h, &w)| {
            let scale = h.abs().max(w.abs());
            if scale == 0. {
                0.
            } else {
                (h - w).abs() / scale
            }
        })
        .fold(0., f64::max)
}

#[test]
fn test_backend_from_str() {
    assert_eq!("sequential".parse::<Backend>().unwrap(), Backend::Sequential);
    assert_eq!(
        "parallel".parse::<Backend>().unwrap(),
        Backend::Parallel(Placement::Cpu)
    );
    assert_eq!(
        "parallel:cuda:1".parse::<Backend>().unwrap(),
        Backend::Parallel(Placement::Cuda(1))
    );
    assert!("parallel:tpu".parse::<Backend>().is_err());
    assert!("fast".parse::<Backend>().is_err());
}

#[test]
fn test_max_rel_err() {
    assert_eq!(max_rel_err(&[], &[]), 0.);
    assert_eq!(max_rel_err(&[0., 1.], &[0., 1.]), 0.);
    assert!((max_rel_err(&[1., 2.], &[1., 1.]) - 0.5).abs() < 1e-12);
}

#[test]
#[should_panic(expected = "mass vectors differ in length")]
fn test_max_rel_err_length_mismatch() {
    max_rel_err(&[1.], &[1., 0.]);
}

#[test]
fn test_vocabulary_errors() {
    assert!(Error::VocabularyTooLarge(1 << 33).is_vocabulary());
    assert!(!Error::RowCount { want: 2, got: 1 }.is_vocabulary());
    assert!(!Error::Panic("boom".into()).is_vocabulary());
}
