//! Merkle allow-list commitments
//!
//! This module provides the tree used to commit to an allow-list of
//! `(participant, entitlement)` pairs, proof generation for producers of the
//! list, and the verification rule applied by the distributor.
//!
//! # Design
//!
//! - Binary Merkle tree with SHA-256 hashing
//! - Interior nodes hash their children in sorted order ([`hash_pair`]), so a
//!   proof is a plain list of sibling hashes
//! - An odd node at the end of a level is paired with itself
//! - Proof generation O(log n) after an O(n) build

use crate::crypto::{hash_pair, leaf_hash};
use crate::types::{Entitlement, Hash, ParticipantId};
use std::collections::HashMap;

/// Fold a leaf up through its siblings
pub fn compute_root(leaf: Hash, proof: &[Hash]) -> Hash {
    proof
        .iter()
        .fold(leaf, |current, sibling| hash_pair(&current, sibling))
}

/// Verify that `leaf` is committed under `root`
pub fn verify_proof(root: &Hash, leaf: Hash, proof: &[Hash]) -> bool {
    &compute_root(leaf, proof) == root
}

/// Merkle proof (siblings from leaf to root)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    /// Leaf hash being proven
    pub leaf: Hash,
    /// Sibling hashes along the path to root
    pub siblings: Vec<Hash>,
}

impl MerkleProof {
    /// Verify proof against a root hash
    pub fn verify(&self, root: &Hash) -> bool {
        verify_proof(root, self.leaf, &self.siblings)
    }
}

/// Allow-list tree
#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// Levels from leaves (index 0) up to the root
    levels: Vec<Vec<Hash>>,
    /// Leaf position by participant
    positions: HashMap<ParticipantId, usize>,
}

impl MerkleTree {
    /// Create tree from raw leaf hashes
    pub fn from_leaves(leaves: Vec<Hash>) -> Self {
        let mut levels = vec![leaves];

        while levels.last().map_or(false, |level| level.len() > 1) {
            let current = &levels[levels.len() - 1];
            let mut next = Vec::with_capacity((current.len() + 1) / 2);

            for i in (0..current.len()).step_by(2) {
                let left = current[i];
                let right = if i + 1 < current.len() {
                    current[i + 1]
                } else {
                    // Pair the odd node with itself
                    current[i]
                };
                next.push(hash_pair(&left, &right));
            }

            levels.push(next);
        }

        Self {
            levels,
            positions: HashMap::new(),
        }
    }

    /// Build the allow-list tree for `(participant, entitlement)` pairs
    ///
    /// A participant listed twice keeps the position of its last entry for
    /// [`MerkleTree::proof_for`]; both leaves are still committed.
    pub fn from_allocations(allocations: &[(ParticipantId, Entitlement)]) -> Self {
        let leaves = allocations
            .iter()
            .map(|(participant, amount)| leaf_hash(participant, *amount))
            .collect();

        let mut tree = Self::from_leaves(leaves);
        tree.positions = allocations
            .iter()
            .enumerate()
            .map(|(index, (participant, _))| (*participant, index))
            .collect();
        tree
    }

    /// Get number of leaves
    pub fn len(&self) -> usize {
        self.levels[0].len()
    }

    /// Check if tree is empty
    pub fn is_empty(&self) -> bool {
        self.levels[0].is_empty()
    }

    /// Merkle root (all zeroes for an empty tree)
    pub fn root(&self) -> Hash {
        match self.levels.last() {
            Some(top) if top.len() == 1 => top[0],
            _ => [0u8; 32],
        }
    }

    /// Leaf hash at position
    pub fn leaf(&self, index: usize) -> Option<Hash> {
        self.levels[0].get(index).copied()
    }

    /// Generate proof for the leaf at `index`
    pub fn proof(&self, index: usize) -> Option<MerkleProof> {
        let leaf = self.leaf(index)?;
        let mut siblings = Vec::with_capacity(self.levels.len().saturating_sub(1));
        let mut position = index;

        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = if position % 2 == 0 {
                level.get(position + 1).copied().unwrap_or(level[position])
            } else {
                level[position - 1]
            };
            siblings.push(sibling);
            position /= 2;
        }

        Some(MerkleProof { leaf, siblings })
    }

    /// Generate proof for a participant built with [`MerkleTree::from_allocations`]
    pub fn proof_for(&self, participant: &ParticipantId) -> Option<MerkleProof> {
        let index = *self.positions.get(participant)?;
        self.proof(index)
    }
}
