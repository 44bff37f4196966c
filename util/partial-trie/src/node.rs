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

//! Owned trie node representation with bare hash stand-ins for unresolved
//! subtries.

use elastic_array::ElasticArray128;
use ethereum_types::H256;
use parity_bytes::Bytes;
use state_types::Account;

/// Remaining nibble path stored inside leaf and extension nodes.
pub type Path = ElasticArray128<u8>;

/// Type of node in the trie and essential information thereof.
///
/// A `Hash` node carries only the digest of an unresolved subtrie: it cannot
/// be walked, and operations that reach one either signal "needs resolution"
/// (`get`, `need_resolution`) or skip silently (rewind updates).
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
	/// Null node; an empty trie or an absent branch entry.
	Empty,
	/// The digest of a subtrie whose data is not resident.
	Hash(H256),
	/// Leaf node; remaining path and payload.
	Leaf(Path, LeafValue),
	/// Extension node; shared path segment and a single child.
	Extension(Path, Box<Node>),
	/// Branch node; sixteen children, possibly absent.
	Branch(Box<[Node; 16]>),
}

/// Payload of a leaf: either a raw storage slot or an account together with
/// its embedded storage subtrie.
#[derive(Debug, Clone, PartialEq)]
pub enum LeafValue {
	/// Storage slot bytes, left-trimmed by the writer.
	Storage(Bytes),
	/// Account leaf; the storage subtrie hangs beneath it.
	Account(Box<AccountLeaf>),
}

/// Account leaf body. `storage` is `Empty` for accounts without storage and
/// `Hash` while the storage subtrie is not resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountLeaf {
	pub account: Account,
	pub storage: Node,
}

impl Default for Node {
	fn default() -> Self {
		Node::Empty
	}
}

impl Node {
	/// Fresh branch with all sixteen entries absent.
	pub fn empty_branch() -> Node {
		Node::Branch(Box::new(Default::default()))
	}

	pub fn is_empty(&self) -> bool {
		matches!(self, Node::Empty)
	}
}

impl AccountLeaf {
	/// Leaf for an account loaded from the backend: a non-empty storage root
	/// starts out as a bare hash stand-in, so `Empty` always means "no
	/// storage" rather than "not loaded".
	pub fn from_stored(account: Account) -> AccountLeaf {
		let storage = if account.root == keccak_hash::KECCAK_NULL_RLP || account.root == H256::zero() {
			Node::Empty
		} else {
			Node::Hash(account.root)
		};
		AccountLeaf { account, storage }
	}
}
