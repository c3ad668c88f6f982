use std::str::FromStr;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use super::trie::Trie;
use super::{Aggregate, Error, Result};

/// Device holding the parallel aggregator's arrays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Placement {
    #[default]
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl Placement {
    pub fn device(self) -> Result<Device> {
        Ok(match self {
            Placement::Cpu => Device::Cpu,
            Placement::Cuda(ordinal) => Device::new_cuda(ordinal)?,
            Placement::Metal(ordinal) => Device::new_metal(ordinal)?,
        })
    }

    /// Working float type. Metal kernels have no f64.
    pub fn dtype(self) -> DType {
        match self {
            Placement::Metal(_) => DType::F32,
            _ => DType::F64,
        }
    }
}

impl FromStr for Placement {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ordinal = |n: &str| {
            n.parse()
                .map_err(|_| Error::Parse(format!("bad device ordinal {n:?}")))
        };

        match s.split_once(':') {
            None if s == "cpu" => Ok(Placement::Cpu),
            None if s == "cuda" => Ok(Placement::Cuda(0)),
            None if s == "metal" => Ok(Placement::Metal(0)),
            Some(("cuda", n)) => ordinal(n).map(Placement::Cuda),
            Some(("metal", n)) => ordinal(n).map(Placement::Metal),

            _ => Err(Error::Parse(format!(
                "expected 'cpu' | 'cuda[:N]' | 'metal[:N]', got {s:?}"
            ))),
        }
    }
}

/// Batched aggregator over dense arrays.
///
/// The trie recurrence is flattened into one scatter-add per depth level:
/// every node at that level adds its (already final) mass into its parent's
/// column, for all distributions in the batch at once.
pub struct Parallel {
    trie: Arc<Trie>,
    device: Device,
    dtype: DType,
    token_nodes: Option<Tensor>,   // [vocab] owning node per token
    levels: Vec<(Tensor, Tensor)>, // ([nodes], [parents]) per depth, deepest first
}

impl Parallel {
    pub fn new(trie: Arc<Trie>, placement: Placement) -> Result<Self> {
        let device = placement.device()?;
        let index = |ids: Vec<u32>| {
            let n = ids.len();
            Tensor::from_vec(ids, n, &device)
        };

        let tokens: Vec<u32> = trie.leaf_nodes().map(|n| n as u32).collect();
        let token_nodes = if tokens.is_empty() {
            None
        } else {
            Some(index(tokens)?)
        };

        let mut levels = vec![];

        for level in trie.levels().into_iter().skip(1).rev() {
            let parents = level
                .iter()
                .map(|&n| trie.parent(n).unwrap_or(trie.root()) as u32)
                .collect();

            let nodes = level.into_iter().map(|n| n as u32).collect();

            levels.push((index(nodes)?, index(parents)?));
        }

        debug!(?placement, levels = levels.len(), "prepared parallel sweep");

        Ok(Self {
            dtype: placement.dtype(),
            trie,
            device,
            token_nodes,
            levels,
        })
    }

    /// Stack `batch` into a `[batch, vocab]` array in the working dtype.
    fn stack(&self, batch: &[Vec<f64>]) -> Result<Tensor> {
        let shape = (batch.len(), self.trie.vocab_size());

        let p = match self.dtype {
            DType::F32 => {
                let flat: Vec<f32> = batch.iter().flatten().map(|&p| p as f32).collect();
                Tensor::from_vec(flat, shape, &self.device)?
            }

            _ => Tensor::from_vec(batch.concat(), shape, &self.device)?.to_dtype(self.dtype)?,
        };

        Ok(p)
    }

    pub fn batch_mass_sum(&self, batch: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        if batch.is_empty() {
            return Ok(vec![]);
        }

        let want = self.trie.vocab_size();

        if let Some(d) = batch.iter().find(|d| d.len() != want) {
            return Err(Error::Dimension { want, got: d.len() });
        }

        let shape = (batch.len(), self.trie.node_count());
        let mut mass = Tensor::zeros(shape, self.dtype, &self.device)?;

        if let Some(ix) = &self.token_nodes {
            mass = mass.index_add(ix, &self.stack(batch)?, 1)?;
        }

        for (nodes, parents) in self.levels.iter() {
            let child = mass.index_select(nodes, 1)?;
            mass = mass.index_add(parents, &child, 1)?;
        }

        let mass = mass.to_device(&Device::Cpu)?.to_dtype(DType::F64)?;

        Ok(mass.to_vec2::<f64>()?)
    }
}

impl Aggregate for Parallel {
    fn trie(&self) -> &Trie {
        &self.trie
    }

    fn batch_mass_sum(&self, batch: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        Parallel::batch_mass_sum(self, batch)
    }
}

#[test]
fn test_placement_from_str() {
    assert_eq!("cpu".parse::<Placement>().unwrap(), Placement::Cpu);
    assert_eq!("cuda".parse::<Placement>().unwrap(), Placement::Cuda(0));
    assert_eq!("cuda:3".parse::<Placement>().unwrap(), Placement::Cuda(3));
    assert_eq!("metal:1".parse::<Placement>().unwrap(), Placement::Metal(1));
    assert!("cuda:x".parse::<Placement>().is_err());
    assert!("gpu".parse::<Placement>().is_err());
}

#[test]
fn test_example_on_cpu() {
    let trie = Arc::new(Trie::build(["a", "b", "ab", "<eos>"]).unwrap());
    let agg = Parallel::new(trie.clone(), Placement::Cpu).unwrap();

    let out = agg
        .batch_mass_sum(&[vec![0.1, 0.2, 0.2, 0.5], vec![0.99, 0.01, 0., 0.]])
        .unwrap();

    assert_eq!(out.len(), 2);
    assert_eq!(out[0].len(), trie.node_count());

    let at = |row: &[f64], p: &str| row[trie.lookup(p.as_bytes()).unwrap()];

    assert!((at(&out[0], "") - 1.0).abs() < 1e-9);
    assert!((at(&out[0], "a") - 0.3).abs() < 1e-9);
    assert!((at(&out[0], "<eo") - 0.5).abs() < 1e-9);
    assert!((at(&out[1], "a") - 0.99).abs() < 1e-9);
    assert!(at(&out[1], "<").abs() < 1e-12);
}

#[test]
fn test_dimension_and_empty() {
    let trie = Arc::new(Trie::build(["x", "xy"]).unwrap());
    let agg = Parallel::new(trie, Placement::Cpu).unwrap();

    assert!(agg.batch_mass_sum(&[]).unwrap().is_empty());
    assert!(matches!(
        agg.batch_mass_sum(&[vec![0.5, 0.5], vec![1.]]),
        Err(Error::Dimension { want: 2, got: 1 })
    ));
    assert_eq!(agg.batch_mass_sum(&[vec![0.5, 0.5]]).unwrap().len(), 1);
}

#[test]
fn test_empty_vocabulary() {
    let trie = Arc::new(Trie::build(Vec::<Vec<u8>>::new()).unwrap());
    let agg = Parallel::new(trie, Placement::Cpu).unwrap();

    assert_eq!(agg.batch_mass_sum(&[vec![]]).unwrap(), [vec![0.]]);
}
