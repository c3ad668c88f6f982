use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::executor::block_on;
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tokentrie::{
    max_rel_err, Aggregate, Backend, Error, Parallel, Placement, SchedParams, Scheduler,
    Sequential, Trie,
};

fn example() -> Arc<Trie> {
    Arc::new(Trie::build(["a", "b", "ab", "<eos>"]).unwrap())
}

/// Every single byte plus a few hundred distinct multi-byte words, many of
/// which are prefixes of one another.
fn byte_vocab(rng: &mut StdRng) -> Vec<Vec<u8>> {
    let mut seen = HashSet::new();
    let mut vocab: Vec<Vec<u8>> = (0..=255u8).map(|b| vec![b]).collect();

    seen.extend(vocab.iter().cloned());

    while vocab.len() < 1024 {
        let len = rng.gen_range(2..8);
        let word: Vec<u8> = (0..len).map(|_| rng.gen_range(b'a'..=b'f')).collect();

        if seen.insert(word.clone()) {
            vocab.push(word);
        }
    }

    vocab
}

fn distribution(rng: &mut StdRng, n: usize) -> Vec<f64> {
    let raw: Vec<f64> = (0..n).map(|_| rng.gen::<f64>().powi(4)).collect();
    let z: f64 = raw.iter().sum();
    raw.into_iter().map(|p| p / z).collect()
}

#[test]
fn concrete_example() {
    let trie = example();
    let mass = Sequential::new(trie.clone())
        .mass_sum(&[0.1, 0.2, 0.2, 0.5])
        .unwrap();

    let want = [
        ("", 1.0),
        ("a", 0.3),
        ("b", 0.2),
        ("ab", 0.2),
        ("<", 0.5),
        ("<e", 0.5),
        ("<eo", 0.5),
        ("<eos", 0.5),
        ("<eos>", 0.5),
    ];

    assert_eq!(mass.len(), trie.node_count());

    for (prefix, want) in want {
        let n = trie.lookup(prefix.as_bytes()).unwrap();
        assert!((mass[n] - want).abs() <= 1e-8 + 1e-5 * want, "{prefix:?}");
    }
}

#[test]
fn mass_conservation() {
    let mut rng = StdRng::seed_from_u64(7);
    let trie = Arc::new(Trie::build(byte_vocab(&mut rng)).unwrap());
    let agg = Sequential::new(trie.clone());

    for _ in 0..8 {
        let p = distribution(&mut rng, trie.vocab_size());
        let mass = agg.mass_sum(&p).unwrap();

        assert!((mass[trie.root()] - 1.).abs() < 1e-8);
    }
}

#[test]
fn leaves_and_terminals_with_children() {
    let mut rng = StdRng::seed_from_u64(11);
    let trie = Arc::new(Trie::build(byte_vocab(&mut rng)).unwrap());
    let p = distribution(&mut rng, trie.vocab_size());
    let mass = Sequential::new(trie.clone()).mass_sum(&p).unwrap();

    let mut n_inner = 0;

    for node in trie.leaf_nodes() {
        let t = trie.terminal_token(node).unwrap() as usize;
        let children = trie.children(node);

        if children.is_empty() {
            assert!((mass[node] - p[t]).abs() < 1e-12);
        } else {
            let below: f64 = children.iter().map(|&c| mass[c]).sum();
            assert!((mass[node] - (p[t] + below)).abs() < 1e-12);
            n_inner += 1;
        }
    }

    // single bytes a..f prefix plenty of longer words
    assert!(n_inner >= 6);
}

#[test]
fn sequential_parallel_agreement() {
    let trie = example();
    let batch = vec![
        vec![0.1, 0.2, 0.2, 0.5],
        vec![0., 0.3, 0.6, 0.1],
        vec![0.99, 0.01, 0., 0.],
    ];

    let want = Sequential::new(trie.clone()).batch_mass_sum(&batch).unwrap();
    let have = Parallel::new(trie, Placement::Cpu)
        .unwrap()
        .batch_mass_sum(&batch)
        .unwrap();

    assert_eq!(have.len(), want.len());

    for (h, w) in have.iter().zip(&want) {
        assert!(max_rel_err(h, w) <= 1e-3);
    }
}

#[test]
fn sequential_parallel_agreement_large() {
    let mut rng = StdRng::seed_from_u64(3);
    let trie = Arc::new(Trie::build(byte_vocab(&mut rng)).unwrap());
    let batch: Vec<_> = (0..16)
        .map(|_| distribution(&mut rng, trie.vocab_size()))
        .collect();

    let want = Sequential::new(trie.clone()).batch_mass_sum(&batch).unwrap();
    let have = Parallel::new(trie, Placement::Cpu)
        .unwrap()
        .batch_mass_sum(&batch)
        .unwrap();

    for (h, w) in have.iter().zip(&want) {
        assert!(max_rel_err(h, w) <= 1e-3);
    }
}

#[test]
fn order_preservation() {
    let trie = example();
    let aggs: Vec<Box<dyn Aggregate>> = vec![
        Box::new(Sequential::new(trie.clone())),
        Box::new(Parallel::new(trie.clone(), Placement::Cpu).unwrap()),
    ];

    for agg in aggs {
        assert!(agg.batch_mass_sum(&[]).unwrap().is_empty());

        for n in 1..6 {
            let batch: Vec<_> = (0..n)
                .map(|i| {
                    let mut p = vec![0.; 4];
                    p[i % 4] = 1.;
                    p
                })
                .collect();

            let out = agg.batch_mass_sum(&batch).unwrap();
            assert_eq!(out.len(), n);

            for (i, mass) in out.iter().enumerate() {
                let leaf = trie.token_node((i % 4) as u32).unwrap();
                assert!((mass[leaf] - 1.).abs() < 1e-9);
            }
        }
    }
}

#[test]
fn dimension_mismatch() {
    let trie = example();
    let seq = Sequential::new(trie.clone());
    let par = Parallel::new(trie, Placement::Cpu).unwrap();

    let short = vec![vec![0.5, 0.5]];

    assert!(matches!(
        seq.batch_mass_sum(&short),
        Err(Error::Dimension { want: 4, got: 2 })
    ));
    assert!(matches!(
        par.batch_mass_sum(&short),
        Err(Error::Dimension { want: 4, got: 2 })
    ));

    let ok = vec![vec![0.25; 4]];
    assert!(seq.batch_mass_sum(&ok).is_ok());
    assert!(par.batch_mass_sum(&ok).is_ok());
}

fn scheduler_agreement(backend: Backend) {
    let mut rng = StdRng::seed_from_u64(19);
    let vocab = byte_vocab(&mut rng);
    let params = SchedParams::default().linger(Duration::from_millis(20));
    let sched = Scheduler::from_vocabulary(&vocab, backend, params).unwrap();

    let batch: Vec<_> = (0..3)
        .map(|_| distribution(&mut rng, vocab.len()))
        .collect();

    let haves = block_on(join_all(batch.iter().map(|p| sched.mass_sum(p.clone()))));

    let trie = Arc::new(Trie::build(&vocab).unwrap());
    let wants = backend.aggregator(trie).unwrap().batch_mass_sum(&batch).unwrap();

    assert_eq!(haves.len(), wants.len());

    for (have, want) in haves.into_iter().zip(&wants) {
        assert!(max_rel_err(&have.unwrap(), want) <= 1e-3);
    }
}

#[test]
fn scheduler_sequential() {
    scheduler_agreement(Backend::Sequential);
}

#[test]
fn scheduler_parallel() {
    scheduler_agreement(Backend::Parallel(Placement::Cpu));
}

#[test]
fn scheduler_survives_bad_request() {
    let sched = Scheduler::from_vocabulary(
        ["a", "b", "ab", "<eos>"],
        Backend::Sequential,
        SchedParams::default(),
    )
    .unwrap();

    let bad = block_on(sched.mass_sum(vec![1.]));
    assert!(matches!(bad, Err(Error::Dimension { want: 4, got: 1 })));

    let good = block_on(sched.mass_sum(vec![0.1, 0.2, 0.2, 0.5])).unwrap();
    let a = sched.trie().lookup(b"a").unwrap();
    assert!((good[a] - 0.3).abs() < 1e-12);
}

#[test]
fn duplicate_vocabulary_rejected() {
    let err = Scheduler::from_vocabulary(["a", "a"], Backend::Sequential, SchedParams::default())
        .err()
        .unwrap();

    assert!(err.is_vocabulary());
}
