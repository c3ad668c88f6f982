use std::borrow::Cow;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokentrie::{NodeId, TokenId, Trie};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("malformed json in {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to write report: {0}")]
    Write(#[from] io::Error),

    #[error("failed to encode report: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Mass(#[from] tokentrie::Error),
}

/// A vocabulary entry: text is taken as its utf-8 bytes.
#[derive(Deserialize)]
#[serde(untagged)]
enum Entry {
    Text(String),

    Bytes(Vec<u8>),
}

impl Entry {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            Entry::Text(s) => s.into_bytes(),
            Entry::Bytes(b) => b,
        }
    }
}

fn read(path: &Path) -> Result<String, Error> {
    fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_owned(),
        source,
    })
}

fn parse_vocab(text: &str) -> serde_json::Result<Vec<Vec<u8>>> {
    let entries: Vec<Entry> = serde_json::from_str(text)?;
    Ok(entries.into_iter().map(Entry::into_bytes).collect())
}

pub fn load_vocab(path: &Path) -> Result<Vec<Vec<u8>>, Error> {
    parse_vocab(&read(path)?).map_err(|source| Error::Parse {
        path: path.to_owned(),
        source,
    })
}

pub fn load_dists(path: &Path) -> Result<Vec<Vec<f64>>, Error> {
    serde_json::from_str(&read(path)?).map_err(|source| Error::Parse {
        path: path.to_owned(),
        source,
    })
}

#[derive(Serialize)]
struct Report<'a> {
    index: usize,
    masses: Vec<NodeMass<'a>>,
}

#[derive(Serialize)]
struct NodeMass<'a> {
    node: Option<NodeId>,
    prefix: Cow<'a, str>,
    bytes: &'a [u8],
    token: Option<TokenId>,
    mass: f64,
}

/// Write one json line per mass vector. With no `prefixes`, every node is
/// reported; a prefix absent from the trie has no node and zero mass.
pub fn report<W: Write>(
    mut w: W,
    trie: &Trie,
    masses: &[Vec<f64>],
    prefixes: &[&[u8]],
) -> Result<(), Error> {
    let rows: Vec<(Option<NodeId>, &[u8])> = if prefixes.is_empty() {
        trie.nodes().map(|(n, node)| (Some(n), node.prefix())).collect()
    } else {
        prefixes.iter().map(|&p| (trie.lookup(p), p)).collect()
    };

    for (index, mass) in masses.iter().enumerate() {
        let masses = rows
            .iter()
            .map(|&(node, bytes)| NodeMass {
                node,
                prefix: String::from_utf8_lossy(bytes),
                bytes,
                token: node.and_then(|n| trie.terminal_token(n)),
                mass: node.map_or(0., |n| mass[n]),
            })
            .collect();

        serde_json::to_writer(&mut w, &Report { index, masses })?;
        writeln!(w)?;
    }

    Ok(())
}

#[test]
fn test_parse_vocab() {
    let vocab = parse_vocab(r#"["a", [0, 255], "<eos>", ""]"#).unwrap();

    assert_eq!(vocab, [b"a".to_vec(), vec![0, 255], b"<eos>".to_vec(), vec![]]);
    assert!(parse_vocab(r#"[1.5]"#).is_err());
}

#[test]
fn test_report() {
    let trie = Trie::build(["a", "ab"]).unwrap();
    let masses = vec![vec![1., 1., 0.25]];
    let mut out = vec![];

    report(&mut out, &trie, &masses, &[&b"a"[..], &b"zz"[..]]).unwrap();

    let line: serde_json::Value = serde_json::from_slice(&out).unwrap();
    let rows = line["masses"].as_array().unwrap();

    assert_eq!(line["index"], 0);
    assert_eq!(rows[0]["prefix"], "a");
    assert_eq!(rows[0]["token"], 0);
    assert_eq!(rows[0]["mass"], 1.);
    assert!(rows[1]["node"].is_null());
    assert_eq!(rows[1]["mass"], 0.);
}
