//! Hash-keyed index of every header seen, with cumulative work, validation
//! status and first-seen ordering.

use crate::block::{median_time_past, HeaderContext};
use crate::constants::MEDIAN_TIME_SPAN;
use crate::error::{ConsensusError, Result};
use crate::params::ChainParams;
use crate::pow::{block_work, calculate_next_work_required, U256};
use crate::serialization::{block_hash, hash_to_hex};
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockStatus {
    /// Header accepted, body not yet validated
    HeaderOnly,
    FullyValidated,
    /// Failed validation, or descends from a block that did
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainNode {
    pub hash: Hash,
    pub header: BlockHeader,
    pub height: Height,
    pub chain_work: U256,
    pub status: BlockStatus,
    /// `None` only for the genesis node
    pub parent: Option<Hash>,
    /// Order in which the header was first seen
    pub sequence: u64,
}

impl ChainNode {
    pub fn is_valid(&self) -> bool {
        self.status == BlockStatus::FullyValidated
    }
}

#[derive(Debug, Clone)]
pub struct ChainIndex {
    nodes: HashMap<Hash, ChainNode>,
    children: HashMap<Hash, Vec<Hash>>,
    genesis: Hash,
    next_sequence: u64,
}

impl ChainIndex {
    /// Index rooted at a trusted genesis header.
    pub fn new(genesis: &BlockHeader) -> Self {
        let hash = block_hash(genesis);
        let node = ChainNode {
            hash,
            header: genesis.clone(),
            height: 0,
            chain_work: block_work(genesis.bits),
            status: BlockStatus::FullyValidated,
            parent: None,
            sequence: 0,
        };
        let mut nodes = HashMap::new();
        nodes.insert(hash, node);
        ChainIndex { nodes, children: HashMap::new(), genesis: hash, next_sequence: 1 }
    }

    /// Rebuild from persisted nodes. Exactly one node must be parentless.
    pub fn from_nodes(nodes: impl IntoIterator<Item = ChainNode>) -> Result<Self> {
        let mut map = HashMap::new();
        let mut children: HashMap<Hash, Vec<Hash>> = HashMap::new();
        let mut genesis = None;
        let mut next_sequence = 0;

        for node in nodes {
            next_sequence = next_sequence.max(node.sequence + 1);
            match node.parent {
                Some(parent) => children.entry(parent).or_default().push(node.hash),
                None => {
                    if genesis.replace(node.hash).is_some() {
                        return Err(ConsensusError::Corruption("index has two root nodes".to_string()));
                    }
                }
            }
            map.insert(node.hash, node);
        }

        let genesis = genesis.ok_or_else(|| ConsensusError::Corruption("index has no root node".to_string()))?;
        for (parent, kids) in children.iter_mut() {
            if !map.contains_key(parent) {
                return Err(ConsensusError::Corruption(format!(
                    "index node {} has no parent entry",
                    hash_to_hex(&kids[0])
                )));
            }
            kids.sort_by_key(|h| map.get(h).map(|n| n.sequence));
        }
        Ok(ChainIndex { nodes: map, children, genesis, next_sequence })
    }

    pub fn genesis_hash(&self) -> Hash {
        self.genesis
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, hash: &Hash) -> Option<&ChainNode> {
        self.nodes.get(hash)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.nodes.contains_key(hash)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ChainNode> {
        self.nodes.values()
    }

    pub fn children(&self, hash: &Hash) -> &[Hash] {
        self.children.get(hash).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Add a header whose parent is already indexed. Re-inserting a known
    /// header returns the existing node untouched.
    pub fn insert_header(&mut self, header: &BlockHeader) -> Result<&ChainNode> {
        let hash = block_hash(header);
        if self.nodes.contains_key(&hash) {
            return self.nodes.get(&hash).ok_or_else(|| ConsensusError::Corruption("index lookup".to_string()));
        }

        let parent = self.nodes.get(&header.prev_block_hash).ok_or_else(|| {
            ConsensusError::Orphan(format!("parent {} unknown", hash_to_hex(&header.prev_block_hash)))
        })?;
        if parent.status == BlockStatus::Invalid {
            return Err(ConsensusError::ConsensusInvalid(format!(
                "parent {} is invalid",
                hash_to_hex(&parent.hash)
            )));
        }

        let node = ChainNode {
            hash,
            header: header.clone(),
            height: parent.height + 1,
            chain_work: parent.chain_work.saturating_add(&block_work(header.bits)),
            status: BlockStatus::HeaderOnly,
            parent: Some(parent.hash),
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        self.children.entry(header.prev_block_hash).or_default().push(hash);
        self.nodes.insert(hash, node);
        self.nodes.get(&hash).ok_or_else(|| ConsensusError::Corruption("index lookup".to_string()))
    }

    pub fn set_status(&mut self, hash: &Hash, status: BlockStatus) -> Result<()> {
        let node = self
            .nodes
            .get_mut(hash)
            .ok_or_else(|| ConsensusError::Corruption(format!("unknown block {}", hash_to_hex(hash))))?;
        node.status = status;
        Ok(())
    }

    /// Mark `hash` and every descendant invalid; returns the affected hashes.
    pub fn mark_invalid_subtree(&mut self, hash: &Hash) -> Vec<Hash> {
        let mut marked = Vec::new();
        let mut queue = VecDeque::from([*hash]);
        while let Some(next) = queue.pop_front() {
            if let Some(node) = self.nodes.get_mut(&next) {
                node.status = BlockStatus::Invalid;
                marked.push(next);
            }
            if let Some(kids) = self.children.get(&next) {
                queue.extend(kids.iter().copied());
            }
        }
        marked
    }

    /// Ancestor of `hash` at `height`, walking parent links.
    pub fn ancestor(&self, hash: &Hash, height: Height) -> Option<&ChainNode> {
        let mut node = self.nodes.get(hash)?;
        if height > node.height {
            return None;
        }
        while node.height > height {
            node = self.nodes.get(&node.parent?)?;
        }
        Some(node)
    }

    /// Last common ancestor of two indexed blocks.
    pub fn find_fork(&self, a: &Hash, b: &Hash) -> Option<&ChainNode> {
        let mut left = self.nodes.get(a)?;
        let mut right = self.nodes.get(b)?;
        if left.height > right.height {
            left = self.ancestor(&left.hash, right.height)?;
        } else if right.height > left.height {
            right = self.ancestor(&right.hash, left.height)?;
        }
        while left.hash != right.hash {
            left = self.nodes.get(&left.parent?)?;
            right = self.nodes.get(&right.parent?)?;
        }
        Some(left)
    }

    /// Fully-validated node with the most work; equal work goes to the
    /// node seen first.
    pub fn best_candidate(&self) -> Option<&ChainNode> {
        self.nodes
            .values()
            .filter(|n| n.is_valid())
            .max_by_key(|n| (n.chain_work, Reverse(n.sequence)))
    }

    /// Timestamps of `hash` and up to ten of its ancestors, newest first.
    pub fn recent_timestamps(&self, hash: &Hash) -> Vec<u32> {
        let mut out = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut cursor = self.nodes.get(hash);
        while let Some(node) = cursor {
            out.push(node.header.timestamp);
            if out.len() == MEDIAN_TIME_SPAN {
                break;
            }
            cursor = node.parent.and_then(|p| self.nodes.get(&p));
        }
        out
    }

    pub fn median_time_past(&self, hash: &Hash) -> u32 {
        median_time_past(&self.recent_timestamps(hash))
    }

    /// Compact target required of a child of `parent`.
    pub fn next_work_required(&self, parent: &ChainNode, params: &ChainParams) -> Result<u32> {
        let height = parent.height + 1;
        if params.pow_no_retargeting || height % params.retarget_interval != 0 {
            return Ok(parent.header.bits);
        }
        let first_height = height - params.retarget_interval;
        let first = self.ancestor(&parent.hash, first_height).ok_or_else(|| {
            ConsensusError::Corruption(format!("missing ancestor at height {}", first_height))
        })?;
        Ok(calculate_next_work_required(
            parent.header.bits,
            first.header.timestamp,
            parent.header.timestamp,
            params,
        ))
    }

    /// Everything the contextual header check needs about a child of `parent`.
    pub fn header_context(&self, parent: &Hash, params: &ChainParams) -> Result<HeaderContext> {
        let node = self
            .nodes
            .get(parent)
            .ok_or_else(|| ConsensusError::Orphan(format!("parent {} unknown", hash_to_hex(parent))))?;
        Ok(HeaderContext {
            height: node.height + 1,
            expected_bits: self.next_work_required(node, params)?,
            median_time_past: self.median_time_past(parent),
        })
    }
}

/// Hashes of the active chain, indexed by height.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveChain {
    hashes: Vec<Hash>,
}

impl ActiveChain {
    /// Active chain ending at `tip`, built by walking parent links.
    pub fn from_tip(index: &ChainIndex, tip: &Hash) -> Result<Self> {
        let mut hashes = Vec::new();
        let mut cursor = index.get(tip);
        while let Some(node) = cursor {
            hashes.push(node.hash);
            cursor = node.parent.and_then(|p| index.get(&p));
        }
        if hashes.last() != Some(&index.genesis_hash()) {
            return Err(ConsensusError::Corruption(format!(
                "tip {} does not descend from genesis",
                hash_to_hex(tip)
            )));
        }
        hashes.reverse();
        Ok(ActiveChain { hashes })
    }

    pub fn tip(&self) -> Option<&Hash> {
        self.hashes.last()
    }

    pub fn height(&self) -> Height {
        self.hashes.len().saturating_sub(1) as Height
    }

    pub fn at(&self, height: Height) -> Option<&Hash> {
        self.hashes.get(height as usize)
    }

    pub fn contains(&self, node: &ChainNode) -> bool {
        self.at(node.height) == Some(&node.hash)
    }

    pub fn push(&mut self, hash: Hash) {
        self.hashes.push(hash);
    }

    pub fn pop(&mut self) -> Option<Hash> {
        self.hashes.pop()
    }
}
