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

//! Set of keys a witness has to cover, with prefix-containment queries
//! deciding which subtries serialize in full and which collapse to digests.

use crate::hex::{hex_to_bits, keybytes_to_hex};

/// Sorted key set over hex (or single-bit, for the binary trie) nibble
/// paths. Prefixes shorter than `min_length` always count as contained, so
/// the top levels of the trie are never hashed out.
pub struct ResolveSet {
	hexes: Vec<Vec<u8>>,
	binary: bool,
	min_length: usize,
}

impl ResolveSet {
	/// Hex-nibble resolve set.
	pub fn new(min_length: usize) -> ResolveSet {
		ResolveSet { hexes: Vec::new(), binary: false, min_length }
	}

	/// Bit-nibble resolve set, for tries transformed with `hex_to_bin`.
	pub fn new_binary(min_length: usize) -> ResolveSet {
		ResolveSet { hexes: Vec::new(), binary: true, min_length }
	}

	/// Add a byte key; it is expanded to the set's nibble alphabet.
	pub fn add_key(&mut self, key: &[u8]) {
		let hex = keybytes_to_hex(key);
		let path = if self.binary { hex_to_bits(&hex) } else { hex };
		match self.hexes.binary_search(&path) {
			Ok(_) => {}
			Err(at) => self.hexes.insert(at, path),
		}
	}

	/// Whether the subtrie anchored at `prefix` lies on the way to any key
	/// in the set.
	pub fn contains(&self, prefix: &[u8]) -> bool {
		if prefix.len() <= self.min_length {
			return true;
		}
		// the first key >= prefix is the only candidate to start with it
		let at = self.hexes.partition_point(|key| key[..] < *prefix);
		self.hexes.get(at).map_or(false, |key| key.starts_with(prefix))
	}

	pub fn is_empty(&self) -> bool {
		self.hexes.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn contains_prefixes_of_added_keys() {
		let mut rs = ResolveSet::new(0);
		rs.add_key(&[0x12, 0x34]);
		assert!(rs.contains(&[]));
		assert!(rs.contains(&[1]));
		assert!(rs.contains(&[1, 2, 3]));
		assert!(rs.contains(&[1, 2, 3, 4]));
		assert!(!rs.contains(&[1, 3]));
		assert!(!rs.contains(&[2]));
		// longer than the key itself: not on the way anymore
		assert!(!rs.contains(&[1, 2, 3, 4, 5]));
	}

	#[test]
	fn min_length_always_resolves_top_levels() {
		let rs = ResolveSet::new(2);
		assert!(rs.contains(&[7]));
		assert!(rs.contains(&[7, 7]));
		assert!(!rs.contains(&[7, 7, 7]));
	}

	#[test]
	fn binary_set_expands_to_bits() {
		let mut rs = ResolveSet::new(0);
		let mut bin = ResolveSet::new_binary(0);
		rs.add_key(&[0x90]);
		bin.add_key(&[0x90]);
		// 0x9 = 1001
		assert!(bin.contains(&[1, 0, 0, 1]));
		assert!(!bin.contains(&[1, 1]));
		assert!(rs.contains(&[9]));
	}
}
