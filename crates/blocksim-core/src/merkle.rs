//! Binary Merkle tree over an ordered list of leaves, with inclusion proofs.
//!
//! Leaves are hashed with SHA-256; each parent is `sha256(left.hash + right.hash)`
//! over the hex strings. An odd node at the end of a level is paired with a
//! copy of itself.

use crate::{sha256_hex, Hash, SimError};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleNode {
    pub hash: Hash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<Box<MerkleNode>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<Box<MerkleNode>>,
    /// Original leaf content; set on leaves only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl MerkleNode {
    fn leaf(data: &str) -> Self {
        Self {
            hash: sha256_hex(data),
            left: None,
            right: None,
            data: Some(data.to_string()),
        }
    }

    fn parent(left: MerkleNode, right: MerkleNode) -> Self {
        Self {
            hash: sha256_hex(format!("{}{}", left.hash, right.hash)),
            left: Some(Box::new(left)),
            right: Some(Box::new(right)),
            data: None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }
}

/// Side of the sibling relative to the node on the path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Left,
    Right,
}

impl Direction {
    pub fn flip(self) -> Self {
        match self {
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub hash: Hash,
    pub direction: Direction,
}

/// Digest of a single leaf's content, as stored in the tree.
pub fn leaf_hash(content: &str) -> Hash {
    sha256_hex(content)
}

pub fn build_merkle_tree<S: AsRef<str> + Sync>(leaves: &[S]) -> Result<MerkleNode, SimError> {
    if leaves.is_empty() {
        return Err(SimError::EmptyMerkleTree);
    }

    let mut level: Vec<MerkleNode> = leaves
        .par_iter()
        .map(|l| MerkleNode::leaf(l.as_ref()))
        .collect();

    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        let mut nodes = level.into_iter();
        while let Some(left) = nodes.next() {
            let right = match nodes.next() {
                Some(right) => right,
                None => left.clone(),
            };
            next.push(MerkleNode::parent(left, right));
        }
        level = next;
    }

    Ok(level.remove(0))
}

pub fn get_merkle_root(tree: &MerkleNode) -> &str {
    &tree.hash
}

/// Sibling hashes from the leaf up to (but excluding) the root.
pub fn get_merkle_proof(
    tree: &MerkleNode,
    leaf_index: usize,
    total_leaves: usize,
) -> Result<Vec<ProofStep>, SimError> {
    if leaf_index >= total_leaves {
        return Err(SimError::LeafIndexOutOfBounds {
            index: leaf_index,
            total: total_leaves,
        });
    }

    // Index of the path node on every level, leaf first.
    let mut path = vec![leaf_index];
    let (mut idx, mut width) = (leaf_index, total_leaves);
    while width > 1 {
        idx /= 2;
        width = width.div_ceil(2);
        path.push(idx);
    }
    path.reverse();

    let mut proof = Vec::with_capacity(path.len().saturating_sub(1));
    let mut node = tree;
    for pair in path.windows(2) {
        let (left, right) = match (node.left.as_deref(), node.right.as_deref()) {
            (Some(l), Some(r)) => (l, r),
            _ => return Err(SimError::TreeShapeMismatch(total_leaves)),
        };
        if pair[1] == pair[0] * 2 {
            proof.push(ProofStep {
                hash: right.hash.clone(),
                direction: Direction::Right,
            });
            node = left;
        } else {
            proof.push(ProofStep {
                hash: left.hash.clone(),
                direction: Direction::Left,
            });
            node = right;
        }
    }
    if !node.is_leaf() {
        return Err(SimError::TreeShapeMismatch(total_leaves));
    }

    proof.reverse();
    Ok(proof)
}

pub fn verify_merkle_proof(proof: &[ProofStep], leaf_hash: &str, root: &str) -> bool {
    let computed = proof.iter().fold(leaf_hash.to_string(), |current, step| {
        match step.direction {
            Direction::Left => sha256_hex(format!("{}{}", step.hash, current)),
            Direction::Right => sha256_hex(format!("{}{}", current, step.hash)),
        }
    });
    computed == root
}
