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

//! Generation-based node eviction: structural nodes untouched for a whole
//! window of blocks collapse into bare hash stand-ins.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write;

use log::trace;

use crate::trie::Trie;

/// Trie cache generation limit after which resident nodes are evicted.
pub const MAX_TRIE_CACHE_GEN: u64 = 1 << 20;

/// Tracks the last-touch generation of every structural trie node, by hex
/// path. Subscribed to the trie's touch events.
#[derive(Default)]
pub struct TriePruning {
	generations: BTreeMap<u64, HashSet<Vec<u8>>>,
	gen_of: HashMap<Vec<u8>, u64>,
	block_nr: u64,
}

impl TriePruning {
	pub fn new(block_nr: u64) -> TriePruning {
		TriePruning {
			generations: BTreeMap::new(),
			gen_of: HashMap::new(),
			block_nr,
		}
	}

	/// Note a touched node. Deleted nodes drop out of the accounting;
	/// touched ones move to the current generation.
	pub fn touch(&mut self, hex: &[u8], del: bool) {
		if del {
			if let Some(generation) = self.gen_of.remove(hex) {
				if let Some(set) = self.generations.get_mut(&generation) {
					set.remove(hex);
					if set.is_empty() {
						self.generations.remove(&generation);
					}
				}
			}
			return;
		}
		let path = hex.to_vec();
		if let Some(previous) = self.gen_of.insert(path.clone(), self.block_nr) {
			if previous == self.block_nr {
				return;
			}
			if let Some(set) = self.generations.get_mut(&previous) {
				set.remove(&path);
				if set.is_empty() {
					self.generations.remove(&previous);
				}
			}
		}
		self.generations.entry(self.block_nr).or_insert_with(HashSet::new).insert(path);
	}

	/// Roll the current generation.
	pub fn set_block_nr(&mut self, block_nr: u64) {
		self.block_nr = block_nr;
	}

	pub fn block_nr(&self) -> u64 {
		self.block_nr
	}

	/// Accounted live structural nodes.
	pub fn node_count(&self) -> usize {
		self.gen_of.len()
	}

	/// Collapse every node whose generation lags the watermark
	/// `block_nr - window` into a bare hash stand-in. Descendants of a
	/// collapsed node vanish with it. Returns the number of collapsed
	/// subtree roots.
	pub fn prune_to(&mut self, trie: &mut Trie, window: u64) -> usize {
		let watermark = self.block_nr.saturating_sub(window);
		let mut stale: Vec<Vec<u8>> = Vec::new();
		for (_, paths) in self.generations.range(..watermark) {
			stale.extend(paths.iter().cloned());
		}
		if stale.is_empty() {
			return 0;
		}
		// shallowest first, so descendants are collapsed along with their root
		stale.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));

		let mut collapsed: Vec<Vec<u8>> = Vec::new();
		for path in stale {
			if collapsed.iter().any(|root| path.starts_with(root)) {
				continue;
			}
			if trie.collapse_to_hash(&path) {
				collapsed.push(path);
			} else {
				// gone already, or too small to stand behind a digest
				self.forget(&path);
			}
		}

		let mut pruned_paths: Vec<Vec<u8>> = Vec::new();
		for (path, _) in &self.gen_of {
			if collapsed.iter().any(|root| path.starts_with(&root[..])) {
				pruned_paths.push(path.clone());
			}
		}
		for path in &pruned_paths {
			self.forget(path);
		}
		trace!(target: "trie", "pruned {} subtrees ({} nodes) below generation {}",
			collapsed.len(), pruned_paths.len(), watermark);
		collapsed.len()
	}

	fn forget(&mut self, path: &[u8]) {
		if let Some(generation) = self.gen_of.remove(path) {
			if let Some(set) = self.generations.get_mut(&generation) {
				set.remove(path);
				if set.is_empty() {
					self.generations.remove(&generation);
				}
			}
		}
	}

	/// Per-generation population, for diagnostics.
	pub fn debug_dump(&self) -> String {
		let mut out = String::new();
		for (generation, paths) in &self.generations {
			let _ = writeln!(out, "generation {}: {} nodes", generation, paths.len());
		}
		out
	}
}
