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

//! Batch loading of missing subtries from the backend.
//!
//! One resolver instance collects every request a `resolve_state_trie` pass
//! produced, sorts them, range-scans the accounts or storage bucket (through
//! the as-of walkers when historical), rebuilds each subtrie, verifies it
//! against the bare hash stand-in and splices it into the live trie.

use std::io;

use ethereum_types::H256;
use log::trace;
use state_types::Account;

use bucketdb::dbutils::{
	self, ACCOUNTS_BUCKET, ACCOUNTS_HISTORY_BUCKET, HASH_LENGTH, INCARNATION_LENGTH,
	MAX_TIMESTAMP_LENGTH, STORAGE_BUCKET, STORAGE_HISTORY_BUCKET,
};
use bucketdb::Database;

use crate::hasher::hash_node;
use crate::hex::{hex_to_keybytes, keybytes_to_hex};
use crate::node::{AccountLeaf, LeafValue};
use crate::trie::Trie;

/// Nibble depth of the account layer; storage paths continue below it.
const ACCOUNT_DEPTH: usize = 2 * HASH_LENGTH;

/// Opaque descriptor of a missing subtrie, emitted by
/// [`Trie::need_resolution`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResolveRequest {
	/// Hashed address owning the subtrie, for storage keys.
	pub contract: Option<Vec<u8>>,
	/// Full hex path of the probed key.
	pub resolve_hex: Vec<u8>,
	/// Nibble depth of the bare hash node to replace.
	pub resolve_pos: usize,
	/// Digest the loaded subtrie must reproduce.
	pub resolve_hash: H256,
}

/// Batches resolution requests of one kind (accounts or storage).
pub struct Resolver {
	top_levels: usize,
	is_account: bool,
	block_nr: u64,
	historical: bool,
	requests: Vec<ResolveRequest>,
}

impl Resolver {
	pub fn new(top_levels: usize, is_account: bool, block_nr: u64) -> Resolver {
		Resolver {
			top_levels,
			is_account,
			block_nr,
			historical: false,
			requests: Vec::new(),
		}
	}

	/// Switch range scans to the as-of read path.
	pub fn set_historical(&mut self, historical: bool) {
		self.historical = historical;
	}

	pub fn add_request(&mut self, request: ResolveRequest) {
		self.requests.push(request);
	}

	pub fn request_count(&self) -> usize {
		self.requests.len()
	}

	/// Load every requested subtrie and splice it into `trie`.
	pub fn resolve_with_db(&mut self, trie: &mut Trie, db: &dyn Database, block_nr: u64) -> io::Result<()> {
		self.block_nr = block_nr;
		trace!(target: "resolver", "resolving {} request(s), accounts={}, top levels {}, block {}",
			self.requests.len(), self.is_account, self.top_levels, self.block_nr);
		self.requests.sort_by(|a, b| {
			a.resolve_hex[..a.resolve_pos].cmp(&b.resolve_hex[..b.resolve_pos])
		});
		let mut done: Vec<Vec<u8>> = Vec::new();
		let requests = std::mem::replace(&mut self.requests, Vec::new());
		for request in requests {
			let prefix = request.resolve_hex[..request.resolve_pos].to_vec();
			if done.iter().any(|p| prefix.starts_with(p)) {
				continue;
			}
			if request.resolve_pos < ACCOUNT_DEPTH {
				// the gap is still in the account layer
				self.load_account_range(trie, db, &prefix, request.resolve_hash)?;
				done.push(prefix);
				if request.contract.is_some() {
					// re-probe: the storage part may still be unresolved
					let key = hex_to_keybytes(&request.resolve_hex);
					if let Some(deeper) = trie.need_resolution(request.contract.as_deref(), &key) {
						if deeper.resolve_pos < ACCOUNT_DEPTH {
							return Err(corrupt("account resolution did not converge"));
						}
						self.load_storage_subtrie(trie, db, &deeper)?;
						done.push(deeper.resolve_hex[..deeper.resolve_pos].to_vec());
					}
				}
			} else {
				self.load_storage_subtrie(trie, db, &request)?;
				done.push(prefix);
			}
		}
		Ok(())
	}

	fn load_account_range(&self, trie: &mut Trie, db: &dyn Database, prefix: &[u8], expected: H256) -> io::Result<()> {
		let fixed_bits = 4 * prefix.len() as u32;
		let start = nibbles_to_start_key(prefix, HASH_LENGTH);
		let mut sub = Trie::new(H256::zero());
		let mut load = |key: &[u8], value: &[u8]| -> io::Result<bool> {
			let account = Account::decode_for_storage(value).map_err(|_| corrupt("malformed account record"))?;
			let hex = keybytes_to_hex(key);
			debug_assert!(hex.starts_with(prefix), "walker honours the fixed bits");
			let leaf = AccountLeaf::from_stored(account);
			sub.insert_hex(&hex[prefix.len()..], LeafValue::Account(Box::new(leaf)));
			Ok(true)
		};
		if self.historical {
			let mut start = start;
			start.extend_from_slice(&[0u8; MAX_TIMESTAMP_LENGTH]);
			db.walk_as_of(ACCOUNTS_BUCKET, ACCOUNTS_HISTORY_BUCKET, &start, fixed_bits, self.block_nr + 1, &mut load)?;
		} else {
			db.walk(ACCOUNTS_BUCKET, &start, fixed_bits, &mut load)?;
		}
		self.splice_verified(trie, prefix, sub, expected)
	}

	fn load_storage_subtrie(&self, trie: &mut Trie, db: &dyn Database, request: &ResolveRequest) -> io::Result<()> {
		let prefix = &request.resolve_hex[..request.resolve_pos];
		let addr_hex = &request.resolve_hex[..ACCOUNT_DEPTH];
		let addr_hash = hex_to_keybytes(addr_hex);
		let incarnation = self.incarnation_of(trie, db, &addr_hash)?;

		let storage_prefix_hex = &prefix[ACCOUNT_DEPTH..];
		let mut start = dbutils::storage_prefix(&H256::from_slice(&addr_hash), incarnation);
		start.extend_from_slice(&nibbles_to_start_key(storage_prefix_hex, HASH_LENGTH));
		let fixed_bits = (8 * (HASH_LENGTH + INCARNATION_LENGTH)) as u32 + 4 * storage_prefix_hex.len() as u32;

		let mut sub = Trie::new(H256::zero());
		let mut load = |key: &[u8], value: &[u8]| -> io::Result<bool> {
			// strip the incarnation: trie paths are addr_hash ‖ key_hash
			let key_hex = keybytes_to_hex(&key[HASH_LENGTH + INCARNATION_LENGTH..]);
			debug_assert!(key_hex.starts_with(storage_prefix_hex), "walker honours the fixed bits");
			sub.insert_hex(&key_hex[storage_prefix_hex.len()..], LeafValue::Storage(value.to_vec()));
			Ok(true)
		};
		if self.historical {
			let mut start = start;
			start.extend_from_slice(&[0u8; MAX_TIMESTAMP_LENGTH]);
			db.walk_as_of(STORAGE_BUCKET, STORAGE_HISTORY_BUCKET, &start, fixed_bits, self.block_nr, &mut load)?;
		} else {
			db.walk(STORAGE_BUCKET, &start, fixed_bits, &mut load)?;
		}
		self.splice_verified(trie, prefix, sub, request.resolve_hash)
	}

	/// Incarnation of the account owning a storage subtrie; preferably from
	/// the already resolved account leaf, else from the backend.
	fn incarnation_of(&self, trie: &Trie, db: &dyn Database, addr_hash: &[u8]) -> io::Result<u64> {
		if let (Some(account), true) = trie.get_account(addr_hash) {
			return Ok(account.incarnation);
		}
		let raw = if self.historical {
			db.get_as_of(ACCOUNTS_BUCKET, ACCOUNTS_HISTORY_BUCKET, addr_hash, self.block_nr + 1)?
		} else {
			db.get(ACCOUNTS_BUCKET, addr_hash)?
		};
		let raw = raw.ok_or_else(|| corrupt("storage subtrie requested for an unknown account"))?;
		let account = Account::decode_for_storage(&raw).map_err(|_| corrupt("malformed account record"))?;
		Ok(account.incarnation)
	}

	fn splice_verified(&self, trie: &mut Trie, prefix: &[u8], sub: Trie, expected: H256) -> io::Result<()> {
		let loaded = hash_node(sub.root_node());
		if loaded != expected {
			return Err(corrupt("resolved subtrie does not match its digest"));
		}
		if !trie.splice_subtree(prefix, sub.into_root()) {
			return Err(corrupt("resolution target is no longer a bare hash node"));
		}
		Ok(())
	}
}

fn corrupt(what: &'static str) -> io::Error {
	io::Error::new(io::ErrorKind::InvalidData, what)
}

/// Left-align a nibble prefix into a zero-padded byte key of `width` bytes.
fn nibbles_to_start_key(prefix: &[u8], width: usize) -> Vec<u8> {
	let mut padded = prefix.to_vec();
	if padded.len() % 2 == 1 {
		padded.push(0);
	}
	let mut key = hex_to_keybytes(&padded);
	key.resize(width, 0);
	key
}

#[cfg(test)]
mod tests {
	use super::*;
	use ethereum_types::U256;

	fn stored_account(nonce: u64, incarnation: u64, root: H256) -> Account {
		let mut account = Account::new();
		account.initialised = true;
		account.nonce = nonce;
		account.balance = U256::from(nonce) * U256::from(10u64);
		account.incarnation = incarnation;
		account.root = root;
		account
	}

	fn flush_accounts(db: &dyn Database, trie: &Trie, keys: &[[u8; 32]]) {
		for key in keys {
			let (account, ok) = trie.get_account(&key[..]);
			assert!(ok);
			let mut account = account.expect("account was inserted").clone();
			let (_, root) = trie.deep_hash(&key[..]);
			account.root = root;
			db.put(ACCOUNTS_BUCKET, &key[..], &account.encode_for_storage(false)).unwrap();
		}
	}

	#[test]
	fn resolves_account_range_from_backend() {
		let db = bucketdb::MemoryDatabase::new();
		let keys = [[0x11u8; 32], [0x12; 32], [0x21; 32]];

		// build the reference trie and flush it to the backend
		let mut source = Trie::new(H256::zero());
		for (i, key) in keys.iter().enumerate() {
			source.update_account(&key[..], &stored_account(i as u64 + 1, 0, keccak_hash::KECCAK_NULL_RLP));
		}
		let root = source.hash();
		flush_accounts(&db, &source, &keys);

		// a fresh trie knows only the root digest
		let mut trie = Trie::new(root);
		let request = trie.need_resolution(None, &keys[0][..]).expect("root is a bare hash");
		let mut resolver = Resolver::new(0, true, 1);
		resolver.add_request(request);
		resolver.resolve_with_db(&mut trie, &db, 1).unwrap();

		assert_eq!(trie.hash(), root);
		for (i, key) in keys.iter().enumerate() {
			let (account, ok) = trie.get_account(&key[..]);
			assert!(ok);
			assert_eq!(account.unwrap().nonce, i as u64 + 1);
		}
	}

	#[test]
	fn resolves_storage_below_a_loaded_account() {
		let db = bucketdb::MemoryDatabase::new();
		let addr = [0x11u8; 32];
		let slot_a = [0x22u8; 32];
		let slot_b = [0x33u8; 32];

		let mut source = Trie::new(H256::zero());
		source.update_account(&addr, &stored_account(1, 1, keccak_hash::KECCAK_NULL_RLP));
		for (slot, value) in &[(slot_a, &b"val"[..]), (slot_b, &b"lav"[..])] {
			let mut composite = addr.to_vec();
			composite.extend_from_slice(&slot[..]);
			source.update(&composite, value, 0);
			let db_key = dbutils::composite_storage_key(&H256::from_slice(&addr), 1, &H256::from_slice(&slot[..]));
			db.put(STORAGE_BUCKET, &db_key, value).unwrap();
		}
		let root = source.hash();
		flush_accounts(&db, &source, &[addr]);

		// resolve from scratch: account layer first, then its storage
		let mut trie = Trie::new(root);
		let mut composite = addr.to_vec();
		composite.extend_from_slice(&slot_a);
		let request = trie.need_resolution(Some(&addr), &composite).expect("needs resolution");
		let mut resolver = Resolver::new(0, false, 1);
		resolver.add_request(request);
		resolver.resolve_with_db(&mut trie, &db, 1).unwrap();

		assert_eq!(trie.hash(), root);
		let (value, ok) = trie.get(&composite);
		assert!(ok);
		assert_eq!(value.unwrap(), b"val");
	}

	#[test]
	fn mismatched_data_is_rejected() {
		let db = bucketdb::MemoryDatabase::new();
		let addr = [0x11u8; 32];
		db.put(
			ACCOUNTS_BUCKET,
			&addr,
			&stored_account(1, 0, keccak_hash::KECCAK_NULL_RLP).encode_for_storage(false),
		)
		.unwrap();

		// claim a different root than the data reproduces
		let mut trie = Trie::new(H256::repeat_byte(0xde));
		let request = trie.need_resolution(None, &addr).expect("bare hash root");
		let mut resolver = Resolver::new(0, true, 1);
		resolver.add_request(request);
		assert!(resolver.resolve_with_db(&mut trie, &db, 1).is_err());
	}
}
