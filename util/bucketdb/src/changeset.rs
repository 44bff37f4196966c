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

//! Per-block change set: the previous values of every key a block modified.

use parity_bytes::Bytes;
use rlp::{DecoderError, Rlp, RlpStream};

/// One recorded change: a key and the value it held before the block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
	/// Modified key.
	pub key: Bytes,
	/// Previous value; empty when the key did not exist.
	pub value: Bytes,
}

/// Ordered set of changes for one (block, bucket) pair. Insertion order is
/// preserved; the first entry for a key carries the true pre-block value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
	changes: Vec<Change>,
}

impl ChangeSet {
	pub fn new() -> ChangeSet {
		ChangeSet::default()
	}

	pub fn len(&self) -> usize {
		self.changes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.changes.is_empty()
	}

	/// Whether a previous value for `key` is already recorded.
	pub fn contains(&self, key: &[u8]) -> bool {
		self.changes.iter().any(|c| c.key[..] == *key)
	}

	/// Record a previous value. Later duplicates of a key are kept but never
	/// win during rewind.
	pub fn add(&mut self, key: &[u8], value: &[u8]) {
		self.changes.push(Change { key: key.to_vec(), value: value.to_vec() });
	}

	/// Visit the changes in insertion order; the walker may stop the walk by
	/// returning an error.
	pub fn walk<E, F>(&self, mut f: F) -> Result<(), E>
	where
		F: FnMut(&[u8], &[u8]) -> Result<(), E>,
	{
		for change in &self.changes {
			f(&change.key, &change.value)?;
		}
		Ok(())
	}

	/// RLP list of `[key, previous-value]` pairs.
	pub fn encode(&self) -> Bytes {
		let mut stream = RlpStream::new_list(self.changes.len());
		for change in &self.changes {
			stream.begin_list(2);
			stream.append(&change.key);
			stream.append(&change.value);
		}
		stream.out()
	}

	pub fn decode(data: &[u8]) -> Result<ChangeSet, DecoderError> {
		let rlp = Rlp::new(data);
		let mut changes = Vec::with_capacity(rlp.item_count()?);
		for pair in rlp.iter() {
			if pair.item_count()? != 2 {
				return Err(DecoderError::RlpIncorrectListLen);
			}
			changes.push(Change {
				key: pair.at(0)?.data()?.to_vec(),
				value: pair.at(1)?.data()?.to_vec(),
			});
		}
		Ok(ChangeSet { changes })
	}
}
