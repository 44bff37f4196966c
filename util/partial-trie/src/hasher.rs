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

//! Node hashing: RLP node forms with hex-prefix-encoded paths, children of
//! 32 bytes and more referenced by keccak digest.

use ethereum_types::H256;
use keccak_hash::{keccak, KECCAK_NULL_RLP};
use log::debug;
use parity_bytes::Bytes;
use rlp::RlpStream;
use state_types::Account;

use crate::hex::compact_encode;
use crate::node::{AccountLeaf, LeafValue, Node};
use crate::trie::Trie;

/// Digest a node the way its parent-by-hash would reference it. The empty
/// node digests to the empty-trie root; a bare hash node reports its
/// stand-in digest.
pub fn hash_node(node: &Node) -> H256 {
	match node {
		Node::Empty => KECCAK_NULL_RLP,
		Node::Hash(h) => *h,
		_ => keccak(&node_rlp(node)),
	}
}

/// Root of the storage subtrie embedded in an account leaf.
pub fn storage_root(storage: &Node) -> H256 {
	hash_node(storage)
}

/// RLP form of a resolved node. Bare hash nodes carry no data and cannot be
/// re-encoded; callers reference them through `hash_node`.
pub fn node_rlp(node: &Node) -> Vec<u8> {
	let mut stream = RlpStream::new();
	append_node(&mut stream, node);
	stream.out()
}

fn append_node(stream: &mut RlpStream, node: &Node) {
	match node {
		Node::Empty => {
			stream.append_empty_data();
		}
		Node::Hash(_) => {
			unreachable!("bare hash nodes are referenced by digest, never re-encoded; qed")
		}
		Node::Leaf(path, value) => {
			stream.begin_list(2);
			stream.append(&compact_encode(path, true));
			match value {
				LeafValue::Storage(bytes) => {
					stream.append(bytes);
				}
				LeafValue::Account(leaf) => {
					stream.append(&account_body_rlp(leaf));
				}
			}
		}
		Node::Extension(path, child) => {
			stream.begin_list(2);
			stream.append(&compact_encode(path, false));
			append_child(stream, child);
		}
		Node::Branch(children) => {
			stream.begin_list(17);
			for child in children.iter() {
				append_child(stream, child);
			}
			stream.append_empty_data();
		}
	}
}

/// The 4-field account RLP carried by an account leaf. The storage root is
/// taken from the live subtrie, not from the stored field, so it is always
/// consistent with what hangs below the leaf.
pub fn account_body_rlp(leaf: &AccountLeaf) -> Vec<u8> {
	let mut account = leaf.account.clone();
	account.root = storage_root(&leaf.storage);
	account.rlp()
}

/// Pure root computation: apply sorted account and storage modifications to
/// a shadow of `t` and hash it, leaving the resident trie untouched. A
/// `None` account value removes the account and its storage; an empty
/// storage value removes the slot. Duplicate account keys act as a wipe
/// followed by a re-registration.
pub fn hash_with_modifications(
	t: &Trie,
	account_keys: &[H256],
	account_values: &[Option<Account>],
	storage_keys: &[Vec<u8>],
	storage_values: &[Bytes],
	trace: bool,
) -> H256 {
	debug_assert_eq!(account_keys.len(), account_values.len());
	debug_assert_eq!(storage_keys.len(), storage_values.len());
	if trace {
		debug!(target: "trie", "hashing {} account and {} storage modifications",
			account_keys.len(), storage_keys.len());
	}
	let mut shadow = t.clone();
	for (key, value) in account_keys.iter().zip(account_values.iter()) {
		match value {
			Some(account) => shadow.update_account(key.as_bytes(), account),
			None => shadow.delete(key.as_bytes(), 0),
		}
	}
	for (key, value) in storage_keys.iter().zip(storage_values.iter()) {
		if value.is_empty() {
			shadow.delete(key, 0);
		} else {
			shadow.update(key, value, 0);
		}
	}
	shadow.hash()
}

fn append_child(stream: &mut RlpStream, child: &Node) {
	match child {
		Node::Empty => {
			stream.append_empty_data();
		}
		Node::Hash(h) => {
			stream.append(h);
		}
		_ => {
			let rlp = node_rlp(child);
			if rlp.len() < 32 {
				stream.append_raw(&rlp, 1);
			} else {
				stream.append(&keccak(&rlp));
			}
		}
	}
}
