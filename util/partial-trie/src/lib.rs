// Copyright 2015-2019 Parity Technologies (UK) Ltd.
// This file is part of Parity Ethereum.

// Parity Ethereum is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Parity Ethereum is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Parity Ethereum.  If not, see <http://www.gnu.org/licenses/>.

//! Partially resolved hex Merkle-Patricia trie with node-level pruning,
//! batch resolution from a bucket backend and block witness extraction.
//!
//! The trie holds only the subtries a block actually touched; everything
//! else stands behind 32-byte digests. The [`Resolver`] loads missing parts
//! on demand, [`TriePruning`] collapses stale parts back into digests, and
//! the [`WitnessBuilder`] serializes the touched fraction for stateless
//! re-execution.

pub mod hex;
mod hasher;
mod node;
mod pruning;
mod resolve_set;
mod resolver;
mod trie;
mod witness;

pub use hasher::{hash_node, hash_with_modifications, node_rlp};
pub use node::{AccountLeaf, LeafValue, Node, Path};
pub use pruning::{TriePruning, MAX_TRIE_CACHE_GEN};
pub use resolve_set::ResolveSet;
pub use resolver::{ResolveRequest, Resolver};
pub use trie::{Trie, TouchFn};
pub use witness::{
	hex_to_bin, witness_to_trie, witness_to_trie_bin, ProofGenerator, WitnessBuilder,
	WitnessError, WitnessStats,
};

/// Root hash of an empty trie.
pub use keccak_hash::KECCAK_NULL_RLP as EMPTY_ROOT;
