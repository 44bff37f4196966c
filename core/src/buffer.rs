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

//! Mutation log of one change period (a transaction within a block, or a
//! block within a group of blocks).

use std::collections::{HashMap, HashSet};

use ethereum_types::H256;
use parity_bytes::Bytes;
use state_types::Account;

/// Updates, deletes and reads registered within one change period. Buffers
/// hold their accounts by value, so freezing one when the next period
/// starts needs no explicit detaching.
#[derive(Debug, Default, Clone)]
pub struct Buffer {
	/// Storage writes per hashed address; an empty value is a delete marker.
	pub storage_updates: HashMap<H256, HashMap<H256, Bytes>>,
	/// Storage slots read, for the witness.
	pub storage_reads: HashMap<H256, HashSet<H256>>,
	/// Account writes; `None` is a delete marker.
	pub account_updates: HashMap<H256, Option<Account>>,
	/// Accounts read, for the witness; shadowed by updates at touch-build
	/// time rather than here.
	pub account_reads: HashSet<H256>,
	/// Accounts deleted in this period.
	pub deleted: HashSet<H256>,
	/// Contracts created in this period; triggers a storage wipe.
	pub created: HashSet<H256>,
}

impl Buffer {
	pub fn new() -> Buffer {
		Buffer::default()
	}

	pub fn is_empty(&self) -> bool {
		self.storage_updates.is_empty()
			&& self.storage_reads.is_empty()
			&& self.account_updates.is_empty()
			&& self.account_reads.is_empty()
			&& self.deleted.is_empty()
			&& self.created.is_empty()
	}

	/// Fold another buffer into this one. Later updates overwrite earlier
	/// ones; the read, delete and create sets take the union. Associative
	/// but not commutative.
	pub fn merge(&mut self, other: &Buffer) {
		for (addr_hash, updates) in &other.storage_updates {
			let entry = self.storage_updates.entry(*addr_hash).or_insert_with(HashMap::new);
			for (key_hash, value) in updates {
				entry.insert(*key_hash, value.clone());
			}
		}
		for (addr_hash, reads) in &other.storage_reads {
			let entry = self.storage_reads.entry(*addr_hash).or_insert_with(HashSet::new);
			for key_hash in reads {
				entry.insert(*key_hash);
			}
		}
		for (addr_hash, account) in &other.account_updates {
			self.account_updates.insert(*addr_hash, account.clone());
		}
		for addr_hash in &other.account_reads {
			self.account_reads.insert(*addr_hash);
		}
		for addr_hash in &other.deleted {
			self.deleted.insert(*addr_hash);
		}
		for addr_hash in &other.created {
			self.created.insert(*addr_hash);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn account(nonce: u64) -> Option<Account> {
		let mut account = Account::new();
		account.initialised = true;
		account.nonce = nonce;
		Some(account)
	}

	#[test]
	fn later_writes_win() {
		let a = H256::repeat_byte(0x11);
		let k = H256::repeat_byte(0x22);

		let mut first = Buffer::new();
		first.account_updates.insert(a, account(1));
		first.storage_updates.entry(a).or_insert_with(HashMap::new).insert(k, b"old".to_vec());

		let mut second = Buffer::new();
		second.account_updates.insert(a, account(2));
		second.storage_updates.entry(a).or_insert_with(HashMap::new).insert(k, b"new".to_vec());

		let mut aggregate = Buffer::new();
		aggregate.merge(&first);
		aggregate.merge(&second);

		assert_eq!(aggregate.account_updates[&a].as_ref().unwrap().nonce, 2);
		assert_eq!(aggregate.storage_updates[&a][&k], b"new".to_vec());
	}

	#[test]
	fn sets_take_the_union() {
		let a = H256::repeat_byte(0x11);
		let b = H256::repeat_byte(0x22);

		let mut first = Buffer::new();
		first.deleted.insert(a);
		first.account_reads.insert(a);

		let mut second = Buffer::new();
		second.created.insert(a);
		second.deleted.insert(b);

		let mut aggregate = Buffer::new();
		aggregate.merge(&first);
		aggregate.merge(&second);

		assert!(aggregate.deleted.contains(&a) && aggregate.deleted.contains(&b));
		assert!(aggregate.created.contains(&a));
		assert!(aggregate.account_reads.contains(&a));
	}

	#[test]
	fn delete_markers_survive_merging() {
		let a = H256::repeat_byte(0x11);
		let mut first = Buffer::new();
		first.account_updates.insert(a, account(1));
		let mut second = Buffer::new();
		second.account_updates.insert(a, None);

		let mut aggregate = Buffer::new();
		aggregate.merge(&first);
		aggregate.merge(&second);
		assert!(aggregate.account_updates[&a].is_none());
	}
}
