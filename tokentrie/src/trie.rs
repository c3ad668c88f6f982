use std::collections::HashMap;
use std::ops::Index;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use tracing::debug;

use super::{Error, NodeId, Result, TokenId};

/// Byte-level prefix trie over a fixed vocabulary.
///
/// Every prefix of every vocabulary entry (the empty one included) has
/// exactly one node. Node ids are handed out in first-use order and the
/// trie is never mutated after [`Trie::build`].
#[derive(Debug)]
pub struct Trie {
    g: DiGraph<Node, u8>,
    tokens: Vec<NodeIndex>, // token id -> terminal node
    max_depth: usize,
}

#[derive(Debug)]
pub struct Node {
    prefix: Box<[u8]>,
    depth: usize,
    token: Option<TokenId>,
}

impl Node {
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The token whose bytes equal this node's prefix, if any.
    pub fn token(&self) -> Option<TokenId> {
        self.token
    }
}

impl Index<NodeId> for Trie {
    type Output = Node;

    fn index(&self, i: NodeId) -> &Self::Output {
        &self.g[NodeIndex::new(i)]
    }
}

impl Trie {
    /// Build the trie for `vocab`, where token ids are positions.
    ///
    /// An empty entry marks the root as terminal. Two tokens with the same
    /// bytes are rejected, as they would compete for one terminal mark.
    pub fn build<I, B>(vocab: I) -> Result<Self>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let mut g = DiGraph::new();
        let root = g.add_node(Node {
            prefix: Box::default(),
            depth: 0,
            token: None,
        });

        let mut edges: HashMap<(NodeIndex, u8), NodeIndex> = HashMap::new();
        let mut tokens = vec![];
        let mut max_depth = 0;

        for (n, word) in vocab.into_iter().enumerate() {
            let t = TokenId::try_from(n).map_err(|_| Error::VocabularyTooLarge(n + 1))?;
            let word = word.as_ref();
            let mut i = root;

            for (k, &b) in word.iter().enumerate() {
                let p = i;

                i = *edges.entry((p, b)).or_insert_with(|| {
                    let j = g.add_node(Node {
                        prefix: word[..=k].into(),
                        depth: k + 1,
                        token: None,
                    });
                    g.add_edge(p, j, b);
                    j
                });
            }

            if let Some(first) = g[i].token {
                return Err(Error::InvalidVocabulary {
                    first,
                    second: t,
                    prefix: word.to_vec(),
                });
            }

            g[i].token = Some(t);
            tokens.push(i);
            max_depth = max_depth.max(word.len());
        }

        debug!(
            vocab = tokens.len(),
            nodes = g.node_count(),
            max_depth,
            "built token trie"
        );

        Ok(Self { g, tokens, max_depth })
    }

    pub fn root(&self) -> NodeId {
        0
    }

    pub fn node_count(&self) -> usize {
        self.g.node_count()
    }

    pub fn vocab_size(&self) -> usize {
        self.tokens.len()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.g.node_indices().map(|i| (i.index(), &self.g[i]))
    }

    pub fn prefix(&self, node: NodeId) -> &[u8] {
        self[node].prefix()
    }

    pub fn depth(&self, node: NodeId) -> usize {
        self[node].depth()
    }

    pub fn terminal_token(&self, node: NodeId) -> Option<TokenId> {
        self[node].token()
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.g
            .neighbors_directed(NodeIndex::new(node), Direction::Incoming)
            .next()
            .map(|i| i.index())
    }

    /// Children of `node`, ordered by their edge byte.
    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        let mut it: Vec<_> = self
            .g
            .edges(NodeIndex::new(node))
            .map(|e| (*e.weight(), e.target().index()))
            .collect();

        it.sort_unstable();
        it.into_iter().map(|(_, c)| c).collect()
    }

    pub fn child(&self, node: NodeId, byte: u8) -> Option<NodeId> {
        self.g
            .edges(NodeIndex::new(node))
            .find(|e| *e.weight() == byte)
            .map(|e| e.target().index())
    }

    /// Terminal node owning `token`.
    pub fn token_node(&self, token: TokenId) -> Option<NodeId> {
        self.tokens.get(token as usize).map(|i| i.index())
    }

    /// Nodes carrying a terminal mark, in token id order.
    pub fn leaf_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.tokens.iter().map(|i| i.index())
    }

    /// Node ids grouped by depth, root level first.
    pub fn levels(&self) -> Vec<Vec<NodeId>> {
        let mut levels = vec![vec![]; self.max_depth + 1];

        for i in self.g.node_indices() {
            levels[self.g[i].depth()].push(i.index());
        }

        levels
    }

    /// Follow `bytes` down from `node`.
    pub fn walk(&self, node: NodeId, bytes: &[u8]) -> Option<NodeId> {
        bytes.iter().try_fold(node, |i, &b| self.child(i, b))
    }

    /// Node whose prefix is exactly `prefix`.
    pub fn lookup(&self, prefix: &[u8]) -> Option<NodeId> {
        self.walk(self.root(), prefix)
    }
}

#[test]
fn test_build_structure() {
    let trie = Trie::build(["a", "b", "ab", "<eos>"]).unwrap();

    // root, a, b, ab, <, <e, <eo, <eos, <eos>
    assert_eq!(trie.node_count(), 9);
    assert_eq!(trie.vocab_size(), 4);
    assert_eq!(trie.max_depth(), 5);

    let a = trie.lookup(b"a").unwrap();
    let ab = trie.lookup(b"ab").unwrap();

    assert_eq!(trie.terminal_token(a), Some(0));
    assert_eq!(trie.terminal_token(ab), Some(2));
    assert_eq!(trie.children(a), [ab]);
    assert_eq!(trie.parent(ab), Some(a));
    assert_eq!(trie.parent(trie.root()), None);
    assert_eq!(trie.prefix(ab), b"ab");
    assert_eq!(trie.depth(ab), 2);

    let eo = trie.lookup(b"<eo").unwrap();
    assert_eq!(trie.terminal_token(eo), None);
    assert_eq!(trie.walk(eo, b"s>"), trie.token_node(3));

    assert_eq!(trie.lookup(b"ba"), None);
    assert_eq!(trie.lookup(b""), Some(trie.root()));
}

#[test]
fn test_node_views() {
    let trie = Trie::build(["ab", "a", "c"]).unwrap();

    for (n, node) in trie.nodes() {
        assert_eq!(node.depth(), node.prefix().len());
        assert_eq!(node.depth(), trie.depth(n));
        assert_eq!(node.token(), trie.terminal_token(n));
    }

    let a = trie.lookup(b"a").unwrap();
    assert_eq!(trie.nodes().nth(a).map(|(_, node)| node.token()), Some(Some(1)));
}

#[test]
fn test_children_ordered_by_byte() {
    let trie = Trie::build(["z", "m", "a"]).unwrap();
    let want: Vec<_> = [b"a", b"m", b"z"]
        .iter()
        .map(|p| trie.lookup(&p[..]).unwrap())
        .collect();

    assert_eq!(trie.children(trie.root()), want);
}

#[test]
fn test_ids_are_first_use_order() {
    let trie = Trie::build(["ab", "c"]).unwrap();

    assert_eq!(trie.lookup(b"a"), Some(1));
    assert_eq!(trie.lookup(b"ab"), Some(2));
    assert_eq!(trie.lookup(b"c"), Some(3));
}

#[test]
fn test_levels() {
    let trie = Trie::build(["ab", "a", "b"]).unwrap();
    let levels = trie.levels();

    assert_eq!(levels.len(), 3);
    assert_eq!(levels[0], [trie.root()]);
    assert_eq!(levels[1].len(), 2);
    assert_eq!(levels[2], [trie.lookup(b"ab").unwrap()]);
}

#[test]
fn test_leaf_nodes_follow_token_order() {
    let trie = Trie::build(["b", "a", "ba"]).unwrap();
    let leaves: Vec<_> = trie.leaf_nodes().map(|n| trie.prefix(n).to_vec()).collect();

    assert_eq!(leaves, [b"b".to_vec(), b"a".to_vec(), b"ba".to_vec()]);
}

#[test]
fn test_duplicate_rejected() {
    let err = Trie::build(["x", "y", "x"]).unwrap_err();

    assert!(err.is_vocabulary());
    assert!(matches!(
        err,
        Error::InvalidVocabulary { first: 0, second: 2, ref prefix } if prefix == b"x"
    ));
}

#[test]
fn test_empty_entry_marks_root() {
    let trie = Trie::build(["q", ""]).unwrap();

    assert_eq!(trie.terminal_token(trie.root()), Some(1));
    assert_eq!(trie.token_node(1), Some(trie.root()));

    assert!(Trie::build(["", ""]).is_err());
}

#[test]
fn test_empty_vocabulary() {
    let trie = Trie::build(Vec::<Vec<u8>>::new()).unwrap();

    assert_eq!(trie.node_count(), 1);
    assert_eq!(trie.vocab_size(), 0);
    assert_eq!(trie.levels(), [vec![0]]);
}
