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

//! Partially resolved hex Merkle-Patricia trie.
//!
//! Account leaves sit at the 64-nibble boundary and embed their storage
//! subtrie, so a 64-byte composite key walks through the account leaf into
//! its storage. Unresolved subtries are represented by bare [`Node::Hash`]
//! stand-ins; mutating operations skip them silently (the engine resolves
//! ahead of updates and probes with [`Trie::get`] during rewind), read
//! operations report them as "needs resolution".

use std::io;
use std::mem;

use ethereum_types::H256;
use keccak_hash::KECCAK_NULL_RLP;
use log::trace;
use state_types::Account;

use bucketdb::dbutils::ACCOUNTS_BUCKET;
use bucketdb::Database;

use crate::hasher::{hash_node, node_rlp, storage_root};
use crate::hex::{common_prefix_len, keybytes_to_hex};
use crate::node::{AccountLeaf, LeafValue, Node, Path};
use crate::resolver::ResolveRequest;

/// Callback invoked with the hex path of every structural node a mutation
/// touches, and whether the node was removed.
pub type TouchFn = Box<dyn FnMut(&[u8], bool) + Send>;

/// Partially resolved state trie. A `binary` trie (the `hex_to_bin`
/// transform) keys its paths by single bits instead of hex nibbles; byte
/// keys passed to the public operations are expanded accordingly.
pub struct Trie {
	root: Node,
	touch: Option<TouchFn>,
	binary: bool,
}

impl Clone for Trie {
	/// Deep copy of the node tree; the touch subscription is not carried
	/// over, the copy never observes later mutations of the original.
	fn clone(&self) -> Self {
		Trie { root: self.root.clone(), touch: None, binary: self.binary }
	}
}

impl std::fmt::Debug for Trie {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("Trie")
			.field("binary", &self.binary)
			.field("root", &self.root)
			.finish()
	}
}

impl Trie {
	/// Trie standing for the given root: empty when the root is the empty
	/// root, otherwise a single bare hash node to be resolved on demand.
	pub fn new(root: H256) -> Trie {
		let node = if root == KECCAK_NULL_RLP || root == H256::zero() {
			Node::Empty
		} else {
			Node::Hash(root)
		};
		Trie { root: node, touch: None, binary: false }
	}

	pub(crate) fn from_root(root: Node) -> Trie {
		Trie { root, touch: None, binary: false }
	}

	pub(crate) fn from_root_binary(root: Node) -> Trie {
		Trie { root, touch: None, binary: true }
	}

	fn key_to_path(&self, key: &[u8]) -> Vec<u8> {
		let hex = keybytes_to_hex(key);
		if self.binary {
			crate::hex::hex_to_bits(&hex)
		} else {
			hex
		}
	}

	pub(crate) fn root_node(&self) -> &Node {
		&self.root
	}

	pub(crate) fn into_root(self) -> Node {
		self.root
	}

	/// Subscribe to touch events; the pruner hooks in here.
	pub fn set_touch_func(&mut self, f: TouchFn) {
		self.touch = Some(f);
	}

	/// Multi-line rendering of the resident node structure, for diagnostics.
	pub fn debug_dump(&self) -> String {
		format!("{:#?}", self.root)
	}

	/// Root over the entire trie.
	pub fn hash(&self) -> H256 {
		hash_node(&self.root)
	}

	/// Storage slot lookup by 64-byte composite key (or any byte key).
	/// The boolean is `false` iff the walk hit a bare hash node, i.e. the
	/// answer needs resolution first.
	pub fn get(&self, key: &[u8]) -> (Option<&[u8]>, bool) {
		let hex = self.key_to_path(key);
		match get_node(&self.root, &hex) {
			(Some(LeafValue::Storage(bytes)), true) => (Some(&bytes[..]), true),
			(_, resolved) => (None, resolved),
		}
	}

	/// Account lookup by 32-byte hashed address.
	pub fn get_account(&self, key: &[u8]) -> (Option<&Account>, bool) {
		let hex = self.key_to_path(key);
		match get_node(&self.root, &hex) {
			(Some(LeafValue::Account(leaf)), true) => (Some(&leaf.account), true),
			(_, resolved) => (None, resolved),
		}
	}

	/// Insert or overwrite a storage slot.
	pub fn update(&mut self, key: &[u8], value: &[u8], _block_nr: u64) {
		let hex = self.key_to_path(key);
		let Trie { ref mut root, ref mut touch, .. } = *self;
		let mut prefix = Vec::with_capacity(hex.len());
		insert_into(root, &hex, &mut prefix, LeafValue::Storage(value.to_vec()), touch);
	}

	/// Insert or overwrite an account leaf. An existing leaf keeps its
	/// storage subtrie; a fresh leaf represents a non-empty storage root as
	/// a bare hash stand-in, so rewinding across a self-destruct hashes
	/// correctly without the storage contents being replayable.
	pub fn update_account(&mut self, key: &[u8], account: &Account) {
		let hex = self.key_to_path(key);
		let Trie { ref mut root, ref mut touch, .. } = *self;
		let mut prefix = Vec::with_capacity(hex.len());
		let leaf = AccountLeaf::from_stored(account.clone());
		insert_into(root, &hex, &mut prefix, LeafValue::Account(Box::new(leaf)), touch);
	}

	/// Overwrite the stored root field of an account leaf, once the engine
	/// has recomputed it. No structural change.
	pub fn update_account_root(&mut self, key: &[u8], root: H256) {
		let hex = self.key_to_path(key);
		if let (Some(leaf), true) = get_node_mut(&mut self.root, &hex) {
			if let LeafValue::Account(acc) = leaf {
				acc.account.root = root;
			}
		}
	}

	/// Remove a storage slot (64-byte key) or a whole account with its
	/// storage (32-byte key).
	pub fn delete(&mut self, key: &[u8], _block_nr: u64) {
		let hex = self.key_to_path(key);
		let Trie { ref mut root, ref mut touch, .. } = *self;
		let mut prefix = Vec::with_capacity(hex.len());
		delete_from(root, &hex, &mut prefix, touch);
	}

	/// Wipe the storage subtrie beneath an account, keeping the account
	/// leaf itself.
	pub fn delete_subtree(&mut self, key: &[u8], _block_nr: u64) {
		let hex = self.key_to_path(key);
		let Trie { ref mut root, ref mut touch, .. } = *self;
		let mut prefix = Vec::with_capacity(hex.len());
		wipe_storage(root, &hex, &mut prefix, touch);
	}

	/// Merkle root of the storage subtrie anchored at an account. `false`
	/// when the account leaf is absent or unreachable without resolution.
	pub fn deep_hash(&self, key: &[u8]) -> (bool, H256) {
		let hex = self.key_to_path(key);
		match get_node(&self.root, &hex) {
			(Some(LeafValue::Account(leaf)), true) => (true, storage_root(&leaf.storage)),
			_ => (false, KECCAK_NULL_RLP),
		}
	}

	/// Decide whether operating on `key` requires loading a subtrie from
	/// the backend first. `contract` carries the hashed address for storage
	/// keys. Emits an opaque request for the resolver.
	pub fn need_resolution(&self, contract: Option<&[u8]>, key: &[u8]) -> Option<ResolveRequest> {
		let hex = self.key_to_path(key);
		let mut node = &self.root;
		let mut pos = 0usize;
		loop {
			match node {
				Node::Empty => return None,
				Node::Hash(h) => {
					return Some(ResolveRequest {
						contract: contract.map(|c| c.to_vec()),
						resolve_hex: hex,
						resolve_pos: pos,
						resolve_hash: *h,
					});
				}
				Node::Leaf(path, value) => {
					let rest = &hex[pos..];
					if rest.len() > path.len() && rest.starts_with(path) {
						match value {
							LeafValue::Account(leaf) => {
								pos += path.len();
								node = &leaf.storage;
							}
							LeafValue::Storage(_) => return None,
						}
					} else {
						return None;
					}
				}
				Node::Extension(path, child) => {
					let rest = &hex[pos..];
					if rest.len() >= path.len() && rest.starts_with(path) {
						pos += path.len();
						node = child;
					} else {
						return None;
					}
				}
				Node::Branch(children) => {
					if pos >= hex.len() {
						return None;
					}
					node = &children[hex[pos] as usize];
					pos += 1;
				}
			}
		}
	}

	/// Number of resident structural (branch and extension) nodes; the
	/// pruner's accounting must track this within a small delta.
	pub fn count_prunable_nodes(&self) -> usize {
		count_structural(&self.root)
	}

	/// Collapse the structural node at `path` into a bare hash stand-in.
	/// Nodes whose RLP is inlined into the parent (under 32 bytes) are left
	/// alone, as a digest cannot stand in for them.
	pub fn collapse_to_hash(&mut self, path: &[u8]) -> bool {
		let node = match navigate_mut(&mut self.root, path) {
			Some(node) => node,
			None => return false,
		};
		match node {
			Node::Branch(_) | Node::Extension(_, _) => {
				let rlp = node_rlp(node);
				if rlp.len() < 32 {
					return false;
				}
				*node = Node::Hash(keccak_hash::keccak(&rlp));
				true
			}
			_ => false,
		}
	}

	/// Replace the bare hash node at `path` with a freshly loaded subtrie
	/// and register its structural nodes with the touch subscriber.
	pub(crate) fn splice_subtree(&mut self, path: &[u8], sub: Node) -> bool {
		let Trie { ref mut root, ref mut touch, .. } = *self;
		let target = if path.is_empty() {
			Some(root)
		} else {
			navigate_mut(root, path)
		};
		match target {
			Some(node) => match node {
				Node::Hash(_) | Node::Empty => {
					*node = sub;
					let mut prefix = path.to_vec();
					track_subtree(node, &mut prefix, touch);
					true
				}
				_ => false,
			},
			None => false,
		}
	}

	/// Insert a leaf value at a raw hex path; resolver subtrie building.
	pub(crate) fn insert_hex(&mut self, hex: &[u8], value: LeafValue) {
		let Trie { ref mut root, ref mut touch, .. } = *self;
		let mut prefix = Vec::with_capacity(hex.len());
		insert_into(root, hex, &mut prefix, value, touch);
	}

	/// Drop everything resident and reload the account layer from the
	/// backend. Storage subtries reload lazily through resolution.
	pub fn rebuild(&mut self, db: &dyn Database, _block_nr: u64) -> io::Result<()> {
		self.root = Node::Empty;
		let mut accounts = 0usize;
		let Trie { ref mut root, ref mut touch, .. } = *self;
		db.walk(ACCOUNTS_BUCKET, &[], 0, &mut |key, value| {
			let account = Account::decode_for_storage(value)
				.map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed account record"))?;
			let hex = keybytes_to_hex(key);
			let mut prefix = Vec::with_capacity(hex.len());
			let leaf = AccountLeaf::from_stored(account);
			insert_into(root, &hex, &mut prefix, LeafValue::Account(Box::new(leaf)), touch);
			accounts += 1;
			Ok(true)
		})?;
		trace!(target: "trie", "rebuilt account layer: {} accounts, {} structural nodes", accounts, count_structural(root));
		Ok(())
	}
}

fn emit(touch: &mut Option<TouchFn>, path: &[u8], del: bool) {
	if let Some(f) = touch.as_mut() {
		f(path, del);
	}
}

fn get_node<'a>(node: &'a Node, hex: &[u8]) -> (Option<&'a LeafValue>, bool) {
	match node {
		Node::Empty => (None, true),
		Node::Hash(_) => (None, false),
		Node::Leaf(path, value) => {
			if hex == &path[..] {
				(Some(value), true)
			} else if hex.len() > path.len() && hex.starts_with(path) {
				match value {
					LeafValue::Account(leaf) => get_node(&leaf.storage, &hex[path.len()..]),
					LeafValue::Storage(_) => (None, true),
				}
			} else {
				(None, true)
			}
		}
		Node::Extension(path, child) => {
			if hex.len() >= path.len() && hex.starts_with(path) {
				get_node(child, &hex[path.len()..])
			} else {
				(None, true)
			}
		}
		Node::Branch(children) => {
			if hex.is_empty() {
				(None, true)
			} else {
				get_node(&children[hex[0] as usize], &hex[1..])
			}
		}
	}
}

fn get_node_mut<'a>(node: &'a mut Node, hex: &[u8]) -> (Option<&'a mut LeafValue>, bool) {
	match node {
		Node::Empty => (None, true),
		Node::Hash(_) => (None, false),
		Node::Leaf(path, value) => {
			if hex == &path[..] {
				(Some(value), true)
			} else if hex.len() > path.len() && hex.starts_with(&path[..]) {
				let path_len = path.len();
				match value {
					LeafValue::Account(leaf) => get_node_mut(&mut leaf.storage, &hex[path_len..]),
					LeafValue::Storage(_) => (None, true),
				}
			} else {
				(None, true)
			}
		}
		Node::Extension(path, child) => {
			if hex.len() >= path.len() && hex.starts_with(&path[..]) {
				let path_len = path.len();
				get_node_mut(child, &hex[path_len..])
			} else {
				(None, true)
			}
		}
		Node::Branch(children) => {
			if hex.is_empty() {
				(None, true)
			} else {
				get_node_mut(&mut children[hex[0] as usize], &hex[1..])
			}
		}
	}
}

/// Walk `path` down to a node, crossing account leaves into their storage
/// subtries. Returns the node anchored exactly at `path`.
fn navigate_mut<'a>(node: &'a mut Node, path: &[u8]) -> Option<&'a mut Node> {
	if path.is_empty() {
		return Some(node);
	}
	match node {
		Node::Extension(p, child) => {
			if path.len() >= p.len() && path.starts_with(&p[..]) {
				let p_len = p.len();
				navigate_mut(child, &path[p_len..])
			} else {
				None
			}
		}
		Node::Branch(children) => navigate_mut(&mut children[path[0] as usize], &path[1..]),
		Node::Leaf(p, LeafValue::Account(leaf)) => {
			// a path ending right behind the leaf addresses its storage anchor
			if path.len() >= p.len() && path.starts_with(&p[..]) {
				let p_len = p.len();
				navigate_mut(&mut leaf.storage, &path[p_len..])
			} else {
				None
			}
		}
		_ => None,
	}
}

fn insert_into(node: &mut Node, key: &[u8], prefix: &mut Vec<u8>, value: LeafValue, touch: &mut Option<TouchFn>) {
	match node {
		Node::Empty => {
			*node = Node::Leaf(Path::from_slice(key), value);
			return;
		}
		Node::Hash(_) => {
			trace!(target: "trie", "skipping update below unresolved node at depth {}", prefix.len());
			return;
		}
		Node::Branch(children) => {
			if key.is_empty() {
				debug_assert!(false, "key exhausted at a branch");
				return;
			}
			emit(touch, prefix, false);
			let nibble = key[0] as usize;
			let saved = prefix.len();
			prefix.push(key[0]);
			insert_into(&mut children[nibble], &key[1..], prefix, value, touch);
			prefix.truncate(saved);
			return;
		}
		_ => {}
	}
	let current = mem::replace(node, Node::Empty);
	*node = match current {
		Node::Leaf(path, leaf_value) => insert_at_leaf(path, leaf_value, key, prefix, value, touch),
		Node::Extension(path, child) => insert_at_extension(path, child, key, prefix, value, touch),
		_ => unreachable!("other variants handled above; qed"),
	};
}

fn insert_at_leaf(
	path: Path,
	mut leaf_value: LeafValue,
	key: &[u8],
	prefix: &mut Vec<u8>,
	value: LeafValue,
	touch: &mut Option<TouchFn>,
) -> Node {
	let cp = common_prefix_len(&path, key);
	if cp == path.len() && key.len() == path.len() {
		match (&mut leaf_value, value) {
			// an account overwrite keeps the resident storage subtrie
			(LeafValue::Account(existing), LeafValue::Account(new)) => {
				existing.account = new.account;
			}
			(slot, new) => *slot = new,
		}
		return Node::Leaf(path, leaf_value);
	}
	if cp == path.len() && key.len() > path.len() {
		// the key continues below the account leaf, into its storage
		if let LeafValue::Account(ref mut leaf) = leaf_value {
			let saved = prefix.len();
			prefix.extend_from_slice(&path);
			insert_into(&mut leaf.storage, &key[cp..], prefix, value, touch);
			prefix.truncate(saved);
		} else {
			debug_assert!(false, "storage key descends through a value leaf");
		}
		return Node::Leaf(path, leaf_value);
	}
	if cp == key.len() {
		debug_assert!(false, "key exhausted inside a leaf path");
		return Node::Leaf(path, leaf_value);
	}
	// paths diverge: branch at the fork, with an extension above when the
	// shared segment is not empty
	let mut children: Box<[Node; 16]> = Box::new(Default::default());
	children[path[cp] as usize] = Node::Leaf(Path::from_slice(&path[cp + 1..]), leaf_value);
	children[key[cp] as usize] = Node::Leaf(Path::from_slice(&key[cp + 1..]), value);
	let branch = Node::Branch(children);
	let saved = prefix.len();
	prefix.extend_from_slice(&key[..cp]);
	emit(touch, prefix, false);
	prefix.truncate(saved);
	if cp > 0 {
		emit(touch, prefix, false);
		Node::Extension(Path::from_slice(&key[..cp]), Box::new(branch))
	} else {
		branch
	}
}

fn insert_at_extension(
	path: Path,
	mut child: Box<Node>,
	key: &[u8],
	prefix: &mut Vec<u8>,
	value: LeafValue,
	touch: &mut Option<TouchFn>,
) -> Node {
	let cp = common_prefix_len(&path, key);
	if cp == path.len() {
		emit(touch, prefix, false);
		let saved = prefix.len();
		prefix.extend_from_slice(&path);
		insert_into(&mut child, &key[cp..], prefix, value, touch);
		prefix.truncate(saved);
		return Node::Extension(path, child);
	}
	if cp == key.len() {
		debug_assert!(false, "key exhausted inside an extension path");
		return Node::Extension(path, child);
	}
	let mut children: Box<[Node; 16]> = Box::new(Default::default());
	children[path[cp] as usize] = if cp + 1 == path.len() {
		*child
	} else {
		Node::Extension(Path::from_slice(&path[cp + 1..]), child)
	};
	children[key[cp] as usize] = Node::Leaf(Path::from_slice(&key[cp + 1..]), value);
	let branch = Node::Branch(children);
	let saved = prefix.len();
	prefix.extend_from_slice(&key[..cp]);
	emit(touch, prefix, false);
	prefix.truncate(saved);
	if cp > 0 {
		emit(touch, prefix, false);
		Node::Extension(Path::from_slice(&key[..cp]), Box::new(branch))
	} else {
		branch
	}
}

fn delete_from(node: &mut Node, key: &[u8], prefix: &mut Vec<u8>, touch: &mut Option<TouchFn>) {
	match node {
		Node::Empty => {}
		Node::Hash(_) => {
			trace!(target: "trie", "skipping delete below unresolved node at depth {}", prefix.len());
		}
		Node::Leaf(path, value) => {
			if key == &path[..] {
				// removing an account removes its storage with it
				if let LeafValue::Account(leaf) = value {
					let saved = prefix.len();
					prefix.extend_from_slice(&path[..]);
					untrack_subtree(&leaf.storage, prefix, touch);
					prefix.truncate(saved);
				}
				*node = Node::Empty;
			} else if key.len() > path.len() && key.starts_with(&path[..]) {
				if let LeafValue::Account(leaf) = value {
					let path_len = path.len();
					let saved = prefix.len();
					prefix.extend_from_slice(&path[..]);
					delete_from(&mut leaf.storage, &key[path_len..], prefix, touch);
					prefix.truncate(saved);
				}
			}
		}
		Node::Extension(path, child) => {
			if key.len() > path.len() && key.starts_with(&path[..]) {
				emit(touch, prefix, false);
				let path_len = path.len();
				let saved = prefix.len();
				prefix.extend_from_slice(&path[..]);
				delete_from(child, &key[path_len..], prefix, touch);
				prefix.truncate(saved);
				fixup_extension(node, prefix, touch);
			}
		}
		Node::Branch(children) => {
			if key.is_empty() {
				debug_assert!(false, "key exhausted at a branch");
				return;
			}
			emit(touch, prefix, false);
			let nibble = key[0] as usize;
			let saved = prefix.len();
			prefix.push(key[0]);
			delete_from(&mut children[nibble], &key[1..], prefix, touch);
			prefix.truncate(saved);
			fixup_branch(node, prefix, touch);
		}
	}
}

/// After a delete below a branch, collapse it when at most one child is
/// left. A lone bare hash child cannot be merged without resolving it, so
/// the branch is kept in that case.
fn fixup_branch(node: &mut Node, prefix: &mut Vec<u8>, touch: &mut Option<TouchFn>) {
	let (count, last_index) = match node {
		Node::Branch(children) => {
			let mut count = 0;
			let mut last = 0;
			for (i, child) in children.iter().enumerate() {
				if !child.is_empty() {
					count += 1;
					last = i;
				}
			}
			(count, last)
		}
		_ => return,
	};
	if count > 1 {
		return;
	}
	if count == 0 {
		emit(touch, prefix, true);
		*node = Node::Empty;
		return;
	}
	let child = match node {
		Node::Branch(children) => mem::replace(&mut children[last_index], Node::Empty),
		_ => unreachable!("matched above; qed"),
	};
	let nibble = last_index as u8;
	let replacement = match child {
		Node::Leaf(path, value) => {
			let mut merged = Path::new();
			merged.push(nibble);
			merged.append_slice(&path);
			Node::Leaf(merged, value)
		}
		Node::Extension(path, inner) => {
			let mut merged = Path::new();
			merged.push(nibble);
			merged.append_slice(&path);
			// the swallowed extension was tracked one nibble deeper
			let saved = prefix.len();
			prefix.push(nibble);
			emit(touch, prefix, true);
			prefix.truncate(saved);
			Node::Extension(merged, inner)
		}
		branch @ Node::Branch(_) => {
			let mut path = Path::new();
			path.push(nibble);
			Node::Extension(path, Box::new(branch))
		}
		hash @ Node::Hash(_) => {
			// cannot look inside: keep the branch with its lone child
			match node {
				Node::Branch(children) => {
					children[last_index] = hash;
				}
				_ => unreachable!("matched above; qed"),
			}
			return;
		}
		Node::Empty => unreachable!("counted as non-empty above; qed"),
	};
	emit(touch, prefix, true);
	match &replacement {
		Node::Extension(_, _) => emit(touch, prefix, false),
		_ => {}
	}
	*node = replacement;
}

/// After a delete below an extension, absorb a shortened child or vanish
/// with an emptied one.
fn fixup_extension(node: &mut Node, prefix: &mut Vec<u8>, touch: &mut Option<TouchFn>) {
	let needs_fixup = match node {
		Node::Extension(_, child) => matches!(
			&**child,
			Node::Empty | Node::Leaf(_, _) | Node::Extension(_, _)
		),
		_ => false,
	};
	if !needs_fixup {
		return;
	}
	let (path, child) = match mem::replace(node, Node::Empty) {
		Node::Extension(path, child) => (path, child),
		_ => unreachable!("matched above; qed"),
	};
	match *child {
		Node::Empty => {
			emit(touch, prefix, true);
			*node = Node::Empty;
		}
		Node::Leaf(leaf_path, value) => {
			emit(touch, prefix, true);
			let mut merged = Path::from_slice(&path);
			merged.append_slice(&leaf_path);
			*node = Node::Leaf(merged, value);
		}
		Node::Extension(inner_path, inner_child) => {
			// the two extensions fuse; the deeper one goes away
			let saved = prefix.len();
			prefix.extend_from_slice(&path);
			emit(touch, prefix, true);
			prefix.truncate(saved);
			let mut merged = Path::from_slice(&path);
			merged.append_slice(&inner_path);
			*node = Node::Extension(merged, inner_child);
		}
		other => {
			*node = Node::Extension(path, Box::new(other));
		}
	}
}

fn wipe_storage(node: &mut Node, key: &[u8], prefix: &mut Vec<u8>, touch: &mut Option<TouchFn>) {
	match node {
		Node::Empty => {}
		Node::Hash(_) => {
			trace!(target: "trie", "skipping subtree delete below unresolved node at depth {}", prefix.len());
		}
		Node::Leaf(path, value) => {
			if key == &path[..] {
				if let LeafValue::Account(leaf) = value {
					let saved = prefix.len();
					prefix.extend_from_slice(&path[..]);
					untrack_subtree(&leaf.storage, prefix, touch);
					prefix.truncate(saved);
					leaf.storage = Node::Empty;
				}
			}
		}
		Node::Extension(path, child) => {
			if key.len() > path.len() && key.starts_with(&path[..]) {
				emit(touch, prefix, false);
				let path_len = path.len();
				let saved = prefix.len();
				prefix.extend_from_slice(&path[..]);
				wipe_storage(child, &key[path_len..], prefix, touch);
				prefix.truncate(saved);
			}
		}
		Node::Branch(children) => {
			if key.is_empty() {
				return;
			}
			emit(touch, prefix, false);
			let nibble = key[0] as usize;
			let saved = prefix.len();
			prefix.push(key[0]);
			wipe_storage(&mut children[nibble], &key[1..], prefix, touch);
			prefix.truncate(saved);
		}
	}
}

/// Deregister every structural node of a subtree that is about to go away.
fn untrack_subtree(node: &Node, prefix: &mut Vec<u8>, touch: &mut Option<TouchFn>) {
	match node {
		Node::Empty | Node::Hash(_) | Node::Leaf(_, LeafValue::Storage(_)) => {}
		Node::Leaf(path, LeafValue::Account(leaf)) => {
			let saved = prefix.len();
			prefix.extend_from_slice(&path[..]);
			untrack_subtree(&leaf.storage, prefix, touch);
			prefix.truncate(saved);
		}
		Node::Extension(path, child) => {
			emit(touch, prefix, true);
			let saved = prefix.len();
			prefix.extend_from_slice(&path[..]);
			untrack_subtree(child, prefix, touch);
			prefix.truncate(saved);
		}
		Node::Branch(children) => {
			emit(touch, prefix, true);
			for (i, child) in children.iter().enumerate() {
				let saved = prefix.len();
				prefix.push(i as u8);
				untrack_subtree(child, prefix, touch);
				prefix.truncate(saved);
			}
		}
	}
}

/// Register every structural node of a freshly spliced subtree.
fn track_subtree(node: &Node, prefix: &mut Vec<u8>, touch: &mut Option<TouchFn>) {
	match node {
		Node::Empty | Node::Hash(_) | Node::Leaf(_, LeafValue::Storage(_)) => {}
		Node::Leaf(path, LeafValue::Account(leaf)) => {
			let saved = prefix.len();
			prefix.extend_from_slice(&path[..]);
			track_subtree(&leaf.storage, prefix, touch);
			prefix.truncate(saved);
		}
		Node::Extension(path, child) => {
			emit(touch, prefix, false);
			let saved = prefix.len();
			prefix.extend_from_slice(&path[..]);
			track_subtree(child, prefix, touch);
			prefix.truncate(saved);
		}
		Node::Branch(children) => {
			emit(touch, prefix, false);
			for (i, child) in children.iter().enumerate() {
				let saved = prefix.len();
				prefix.push(i as u8);
				track_subtree(child, prefix, touch);
				prefix.truncate(saved);
			}
		}
	}
}

fn count_structural(node: &Node) -> usize {
	match node {
		Node::Empty | Node::Hash(_) | Node::Leaf(_, LeafValue::Storage(_)) => 0,
		Node::Leaf(_, LeafValue::Account(leaf)) => count_structural(&leaf.storage),
		Node::Extension(_, child) => 1 + count_structural(child),
		Node::Branch(children) => 1 + children.iter().map(count_structural).sum::<usize>(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use ethereum_types::U256;

	fn key(fill: u8) -> Vec<u8> {
		vec![fill; 32]
	}

	fn composite(addr_fill: u8, slot_fill: u8) -> Vec<u8> {
		let mut k = key(addr_fill);
		k.extend_from_slice(&key(slot_fill));
		k
	}

	fn account(nonce: u64) -> Account {
		let mut account = Account::new();
		account.initialised = true;
		account.nonce = nonce;
		account
	}

	#[test]
	fn empty_trie_hashes_to_empty_root() {
		assert_eq!(Trie::new(H256::zero()).hash(), KECCAK_NULL_RLP);
	}

	#[test]
	fn get_after_update() {
		let mut t = Trie::new(H256::zero());
		t.update_account(&key(0x11), &account(1));
		t.update(&composite(0x11, 0x22), b"val", 0);

		let (value, resolved) = t.get(&composite(0x11, 0x22));
		assert!(resolved);
		assert_eq!(value.unwrap(), b"val");

		let (acc, resolved) = t.get_account(&key(0x11));
		assert!(resolved);
		assert_eq!(acc.unwrap().nonce, 1);

		let (missing, resolved) = t.get(&composite(0x11, 0x33));
		assert!(resolved);
		assert!(missing.is_none());
	}

	#[test]
	fn sibling_keys_split_and_remerge() {
		let mut t = Trie::new(H256::zero());
		let mut a = key(0x11);
		let mut b = key(0x11);
		a[31] = 0x01;
		b[31] = 0x02;
		t.update_account(&a, &account(1));
		t.update_account(&b, &account(2));
		let split_hash = t.hash();

		t.delete(&b, 0);
		let (got, _) = t.get_account(&a);
		assert_eq!(got.unwrap().nonce, 1);
		assert!(t.get_account(&b).0.is_none());

		// deleting and re-adding returns to the same root
		t.update_account(&b, &account(2));
		assert_eq!(t.hash(), split_hash);
	}

	#[test]
	fn update_overwrites_and_zero_delete_removes() {
		let mut t = Trie::new(H256::zero());
		t.update_account(&key(0x11), &account(1));
		t.update(&composite(0x11, 0x22), b"old", 0);
		t.update(&composite(0x11, 0x22), b"new", 0);
		assert_eq!(t.get(&composite(0x11, 0x22)).0.unwrap(), b"new");

		t.delete(&composite(0x11, 0x22), 0);
		assert!(t.get(&composite(0x11, 0x22)).0.is_none());
		let (ok, root) = t.deep_hash(&key(0x11));
		assert!(ok);
		assert_eq!(root, KECCAK_NULL_RLP);
	}

	#[test]
	fn account_overwrite_keeps_storage() {
		let mut t = Trie::new(H256::zero());
		t.update_account(&key(0x11), &account(1));
		t.update(&composite(0x11, 0x22), b"val", 0);
		let (_, before) = t.deep_hash(&key(0x11));

		t.update_account(&key(0x11), &account(2));
		let (ok, after) = t.deep_hash(&key(0x11));
		assert!(ok);
		assert_eq!(before, after);
		assert_eq!(t.get(&composite(0x11, 0x22)).0.unwrap(), b"val");
	}

	#[test]
	fn delete_subtree_keeps_the_account() {
		let mut t = Trie::new(H256::zero());
		t.update_account(&key(0x11), &account(1));
		t.update(&composite(0x11, 0x22), b"val", 0);
		t.update(&composite(0x11, 0x33), b"lav", 0);

		t.delete_subtree(&key(0x11), 0);
		assert!(t.get(&composite(0x11, 0x22)).0.is_none());
		let (acc, _) = t.get_account(&key(0x11));
		assert_eq!(acc.unwrap().nonce, 1);
		assert_eq!(t.deep_hash(&key(0x11)), (true, KECCAK_NULL_RLP));
	}

	#[test]
	fn deep_hash_tracks_storage_contents() {
		let mut t = Trie::new(H256::zero());
		t.update_account(&key(0x11), &account(1));
		assert_eq!(t.deep_hash(&key(0x11)), (true, KECCAK_NULL_RLP));

		t.update(&composite(0x11, 0x22), b"val", 0);
		let (ok, with_one) = t.deep_hash(&key(0x11));
		assert!(ok);
		assert_ne!(with_one, KECCAK_NULL_RLP);

		// the deep hash only depends on storage, not on account fields
		t.update_account(&key(0x11), &account(9));
		assert_eq!(t.deep_hash(&key(0x11)), (true, with_one));

		assert_eq!(t.deep_hash(&key(0x77)), (false, KECCAK_NULL_RLP));
	}

	#[test]
	fn unresolved_nodes_report_resolution() {
		let stub = H256::repeat_byte(0xaa);
		let t = Trie::new(stub);
		let (value, resolved) = t.get_account(&key(0x11));
		assert!(value.is_none());
		assert!(!resolved);

		let req = t.need_resolution(None, &key(0x11)).expect("hash root needs resolution");
		assert_eq!(req.resolve_pos, 0);
		assert_eq!(req.resolve_hash, stub);

		let mut resolved_trie = Trie::new(H256::zero());
		resolved_trie.update_account(&key(0x11), &account(1));
		assert!(resolved_trie.need_resolution(None, &key(0x11)).is_none());
	}

	#[test]
	fn need_resolution_descends_into_storage() {
		let mut t = Trie::new(H256::zero());
		let mut acc = account(1);
		acc.root = H256::repeat_byte(0xbb);
		// loaded-from-backend shape: storage present as a bare hash
		t.insert_hex(
			&keybytes_to_hex(&key(0x11)),
			LeafValue::Account(Box::new(AccountLeaf::from_stored(acc))),
		);
		let full = composite(0x11, 0x22);
		let req = t
			.need_resolution(Some(&key(0x11)), &full)
			.expect("storage is a bare hash");
		assert_eq!(req.resolve_pos, 64);
		assert_eq!(req.resolve_hash, H256::repeat_byte(0xbb));
		assert_eq!(req.contract.as_deref(), Some(&key(0x11)[..]));
	}

	#[test]
	fn collapse_and_resplice_round_trips_the_root() {
		let mut t = Trie::new(H256::zero());
		for fill in &[0x11u8, 0x12, 0x21] {
			t.update_account(&key(*fill), &account(*fill as u64));
		}
		let root = t.hash();
		let structural_before = t.count_prunable_nodes();
		assert!(structural_before > 0);

		// collapse the whole trie to its root digest
		let sub = t.root_node().clone();
		assert!(t.collapse_to_hash(&[]));
		assert_eq!(t.hash(), root, "digest stand-in preserves the root");
		assert_eq!(t.count_prunable_nodes(), 0);
		let (_, resolved) = t.get_account(&key(0x11));
		assert!(!resolved);

		// resolution splices the data back
		assert!(t.splice_subtree(&[], sub));
		assert_eq!(t.hash(), root);
		assert_eq!(t.count_prunable_nodes(), structural_before);
		assert_eq!(t.get_account(&key(0x11)).0.unwrap().nonce, 0x11);
	}

	#[test]
	fn touch_events_balance_out() {
		use std::collections::HashSet;
		use std::sync::{Arc, Mutex};

		let tracked: Arc<Mutex<HashSet<Vec<u8>>>> = Arc::new(Mutex::new(HashSet::new()));
		let sink = tracked.clone();
		let mut t = Trie::new(H256::zero());
		t.set_touch_func(Box::new(move |hex, del| {
			let mut set = sink.lock().unwrap();
			if del {
				set.remove(hex);
			} else {
				set.insert(hex.to_vec());
			}
		}));

		for fill in 0x10u8..0x30 {
			t.update_account(&key(fill), &account(fill as u64));
		}
		t.update(&composite(0x11, 0x22), b"val", 0);
		assert_eq!(tracked.lock().unwrap().len(), t.count_prunable_nodes());

		for fill in 0x18u8..0x30 {
			t.delete(&key(fill), 0);
		}
		assert_eq!(tracked.lock().unwrap().len(), t.count_prunable_nodes());
	}

	#[test]
	fn hash_changes_with_account_content() {
		let mut t = Trie::new(H256::zero());
		t.update_account(&key(0x11), &account(1));
		let h1 = t.hash();
		let mut richer = account(1);
		richer.balance = U256::from(1000u64);
		t.update_account(&key(0x11), &richer);
		assert_ne!(t.hash(), h1);
	}
}
