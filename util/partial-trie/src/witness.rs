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

//! Block witness: a serialized pruned trie sufficient for stateless
//! re-execution.
//!
//! The trie restricted to a resolve set is written as a post-order operator
//! stream (leaf, account leaf, extension, branch mask, bare hash, code);
//! subtries off the resolved paths collapse into their digests. Decoding
//! replays the operators through a stack machine and reproduces a trie with
//! the same root as the source.

use std::collections::HashMap;
use std::fmt;

use ethereum_types::H256;
use keccak_hash::keccak;
use log::debug;
use parity_bytes::Bytes;
use rlp::{DecoderError, Rlp, RlpStream};
use state_types::Account;

use crate::hasher::{hash_node, storage_root};
use crate::hex::{compact_decode, compact_encode, hex_to_bits};
use crate::node::{AccountLeaf, LeafValue, Node, Path};
use crate::resolve_set::ResolveSet;
use crate::trie::Trie;

const OP_LEAF: u8 = 0;
const OP_EXTENSION: u8 = 1;
const OP_BRANCH: u8 = 2;
const OP_HASH: u8 = 3;
const OP_ACCOUNT_LEAF: u8 = 4;
const OP_CODE: u8 = 5;
const OP_EMPTY_ROOT: u8 = 6;

const FLAG_HAS_CODE: u8 = 0b0000_0001;
const FLAG_HAS_CODE_HASH: u8 = 0b0000_0010;
const FLAG_HAS_STORAGE: u8 = 0b0000_0100;

/// Witness production or consumption failure.
#[derive(Debug, PartialEq)]
pub enum WitnessError {
	/// The trie holds a bare hash node where resolved data is required.
	Unresolved,
	/// Underlying RLP problem.
	Decoder(DecoderError),
	/// The operator stream violates the stack discipline.
	Malformed(&'static str),
}

impl fmt::Display for WitnessError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			WitnessError::Unresolved => write!(f, "witness requires a fully resolved subtrie"),
			WitnessError::Decoder(e) => write!(f, "witness decoding failed: {}", e),
			WitnessError::Malformed(what) => write!(f, "malformed witness: {}", what),
		}
	}
}

impl From<DecoderError> for WitnessError {
	fn from(e: DecoderError) -> Self {
		WitnessError::Decoder(e)
	}
}

/// Per-section byte accounting of a serialized witness.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct WitnessStats {
	pub leaf_bytes: usize,
	pub extension_bytes: usize,
	pub branch_bytes: usize,
	pub hash_bytes: usize,
	pub account_bytes: usize,
	pub code_bytes: usize,
	pub operator_count: usize,
}

impl WitnessStats {
	pub fn total(&self) -> usize {
		self.leaf_bytes
			+ self.extension_bytes
			+ self.branch_bytes
			+ self.hash_bytes
			+ self.account_bytes
			+ self.code_bytes
	}
}

enum Op {
	Leaf { path: Vec<u8>, value: Bytes },
	Extension { path: Vec<u8> },
	Branch { mask: u16 },
	Hash { hash: H256 },
	AccountLeaf { path: Vec<u8>, account: Account, flags: u8 },
	Code { code: Bytes },
	EmptyRoot,
}

impl Op {
	fn encode(&self) -> Vec<u8> {
		let mut stream = RlpStream::new();
		match self {
			Op::Leaf { path, value } => {
				stream.begin_list(3);
				stream.append(&OP_LEAF);
				stream.append(&compact_encode(path, true));
				stream.append(value);
			}
			Op::Extension { path } => {
				stream.begin_list(2);
				stream.append(&OP_EXTENSION);
				stream.append(&compact_encode(path, false));
			}
			Op::Branch { mask } => {
				stream.begin_list(2);
				stream.append(&OP_BRANCH);
				stream.append(&(*mask as u64));
			}
			Op::Hash { hash } => {
				stream.begin_list(2);
				stream.append(&OP_HASH);
				stream.append(hash);
			}
			Op::AccountLeaf { path, account, flags } => {
				let carry_hash = flags & FLAG_HAS_CODE_HASH != 0;
				stream.begin_list(if carry_hash { 7 } else { 6 });
				stream.append(&OP_ACCOUNT_LEAF);
				stream.append(&compact_encode(path, true));
				stream.append(&account.nonce);
				stream.append(&account.balance);
				stream.append(&account.incarnation);
				stream.append(flags);
				if carry_hash {
					stream.append(&account.code_hash);
				}
			}
			Op::Code { code } => {
				stream.begin_list(2);
				stream.append(&OP_CODE);
				stream.append(code);
			}
			Op::EmptyRoot => {
				stream.begin_list(1);
				stream.append(&OP_EMPTY_ROOT);
			}
		}
		stream.out()
	}
}

/// Builds the operator stream for one block.
pub struct WitnessBuilder {
	trace: bool,
	ops: Vec<Op>,
}

impl WitnessBuilder {
	pub fn new(trace: bool) -> WitnessBuilder {
		WitnessBuilder { trace, ops: Vec::new() }
	}

	/// Serialize `trie` restricted to `resolve_set`, carrying the code map
	/// along.
	pub fn make_witness(
		&mut self,
		trie: &Trie,
		resolve_set: &ResolveSet,
		code_map: &HashMap<H256, Bytes>,
	) -> Result<(), WitnessError> {
		let mut prefix = Vec::new();
		self.emit(trie.root_node(), &mut prefix, resolve_set, code_map)?;
		if self.trace {
			debug!(target: "witness", "built witness of {} operators", self.ops.len());
		}
		Ok(())
	}

	fn emit(
		&mut self,
		node: &Node,
		prefix: &mut Vec<u8>,
		resolve_set: &ResolveSet,
		code_map: &HashMap<H256, Bytes>,
	) -> Result<(), WitnessError> {
		if node.is_empty() {
			self.ops.push(Op::EmptyRoot);
			return Ok(());
		}
		if !resolve_set.contains(prefix) {
			// nodes small enough to be inlined in their parent have no
			// digest stand-in and must travel in full
			let standalone = match node {
				Node::Hash(_) => true,
				_ => crate::hasher::node_rlp(node).len() >= 32,
			};
			if standalone {
				self.ops.push(Op::Hash { hash: hash_node(node) });
				return Ok(());
			}
		}
		match node {
			Node::Empty => unreachable!("handled above; qed"),
			Node::Hash(h) => {
				self.ops.push(Op::Hash { hash: *h });
			}
			Node::Leaf(path, LeafValue::Storage(value)) => {
				self.ops.push(Op::Leaf { path: path.to_vec(), value: value.clone() });
			}
			Node::Leaf(path, LeafValue::Account(leaf)) => {
				let mut flags = 0u8;
				if !leaf.storage.is_empty() {
					flags |= FLAG_HAS_STORAGE;
					let saved = prefix.len();
					prefix.extend_from_slice(path);
					self.emit(&leaf.storage, prefix, resolve_set, code_map)?;
					prefix.truncate(saved);
				}
				if let Some(code) = code_map.get(&leaf.account.code_hash) {
					flags |= FLAG_HAS_CODE;
					self.ops.push(Op::Code { code: code.clone() });
				} else if !leaf.account.is_empty_code_hash() {
					flags |= FLAG_HAS_CODE_HASH;
				}
				self.ops.push(Op::AccountLeaf {
					path: path.to_vec(),
					account: leaf.account.clone(),
					flags,
				});
			}
			Node::Extension(path, child) => {
				let saved = prefix.len();
				prefix.extend_from_slice(path);
				self.emit(child, prefix, resolve_set, code_map)?;
				prefix.truncate(saved);
				self.ops.push(Op::Extension { path: path.to_vec() });
			}
			Node::Branch(children) => {
				let mut mask = 0u16;
				for (i, child) in children.iter().enumerate() {
					if child.is_empty() {
						continue;
					}
					mask |= 1 << i;
					let saved = prefix.len();
					prefix.push(i as u8);
					self.emit(child, prefix, resolve_set, code_map)?;
					prefix.truncate(saved);
				}
				self.ops.push(Op::Branch { mask });
			}
		}
		Ok(())
	}

	/// Frame the operator stream into `out` and account the sections.
	pub fn write_to(&self, out: &mut Vec<u8>) -> WitnessStats {
		let mut stats = WitnessStats::default();
		let mut stream = RlpStream::new_list(self.ops.len());
		for op in &self.ops {
			let encoded = op.encode();
			match op {
				Op::Leaf { .. } => stats.leaf_bytes += encoded.len(),
				Op::Extension { .. } => stats.extension_bytes += encoded.len(),
				Op::Branch { .. } => stats.branch_bytes += encoded.len(),
				Op::Hash { .. } => stats.hash_bytes += encoded.len(),
				Op::AccountLeaf { .. } => stats.account_bytes += encoded.len(),
				Op::Code { .. } => stats.code_bytes += encoded.len(),
				Op::EmptyRoot => stats.branch_bytes += encoded.len(),
			}
			stats.operator_count += 1;
			stream.append_raw(&encoded, 1);
		}
		out.extend_from_slice(&stream.out());
		stats
	}
}

/// Replay a serialized witness back into a hex trie and its code map.
pub fn witness_to_trie(data: &[u8], trace: bool) -> Result<(Trie, HashMap<H256, Bytes>), WitnessError> {
	replay_witness(data, trace, false)
}

/// Replay a witness produced from a `hex_to_bin` transformed trie.
pub fn witness_to_trie_bin(data: &[u8], trace: bool) -> Result<(Trie, HashMap<H256, Bytes>), WitnessError> {
	replay_witness(data, trace, true)
}

fn replay_witness(data: &[u8], trace: bool, binary: bool) -> Result<(Trie, HashMap<H256, Bytes>), WitnessError> {
	let outer = Rlp::new(data);
	if !outer.is_list() {
		return Err(WitnessError::Malformed("outer frame must be a list"));
	}
	let mut nodes: Vec<Node> = Vec::new();
	let mut codes: Vec<Bytes> = Vec::new();
	let mut code_map: HashMap<H256, Bytes> = HashMap::new();
	let mut operators = 0usize;

	for item in outer.iter() {
		operators += 1;
		let opcode: u8 = item.val_at(0)?;
		match opcode {
			OP_LEAF => {
				let (path, _) = decode_path(&item, 1)?;
				let value: Vec<u8> = item.at(2)?.data()?.to_vec();
				nodes.push(Node::Leaf(Path::from_slice(&path), LeafValue::Storage(value)));
			}
			OP_EXTENSION => {
				let (path, _) = decode_path(&item, 1)?;
				let child = nodes.pop().ok_or(WitnessError::Malformed("extension without a child"))?;
				nodes.push(Node::Extension(Path::from_slice(&path), Box::new(child)));
			}
			OP_BRANCH => {
				let mask: u64 = item.val_at(1)?;
				if mask == 0 || mask > u64::from(u16::max_value()) {
					return Err(WitnessError::Malformed("branch mask out of range"));
				}
				let mut children: Box<[Node; 16]> = Box::new(Default::default());
				for i in (0..16usize).rev() {
					if mask & (1 << i) != 0 {
						children[i] = nodes.pop().ok_or(WitnessError::Malformed("branch is short of children"))?;
					}
				}
				nodes.push(Node::Branch(children));
			}
			OP_HASH => {
				let hash: H256 = item.val_at(1)?;
				nodes.push(Node::Hash(hash));
			}
			OP_ACCOUNT_LEAF => {
				let (path, _) = decode_path(&item, 1)?;
				let mut account = Account::new();
				account.initialised = true;
				account.nonce = item.val_at(2)?;
				account.balance = item.val_at(3)?;
				account.incarnation = item.val_at(4)?;
				let flags: u8 = item.val_at(5)?;
				if flags & FLAG_HAS_CODE_HASH != 0 {
					account.code_hash = item.val_at(6)?;
				}
				if flags & FLAG_HAS_CODE != 0 {
					let code = codes.pop().ok_or(WitnessError::Malformed("account refers to a missing code blob"))?;
					account.code_hash = keccak(&code);
				}
				let storage = if flags & FLAG_HAS_STORAGE != 0 {
					nodes.pop().ok_or(WitnessError::Malformed("account is short of its storage subtrie"))?
				} else {
					Node::Empty
				};
				account.root = storage_root(&storage);
				nodes.push(Node::Leaf(
					Path::from_slice(&path),
					LeafValue::Account(Box::new(AccountLeaf { account, storage })),
				));
			}
			OP_CODE => {
				let code: Vec<u8> = item.at(1)?.data()?.to_vec();
				code_map.insert(keccak(&code), code.clone());
				codes.push(code);
			}
			OP_EMPTY_ROOT => {
				nodes.push(Node::Empty);
			}
			_ => return Err(WitnessError::Malformed("unknown operator")),
		}
	}

	if nodes.len() != 1 {
		return Err(WitnessError::Malformed("operator stream does not reduce to a single root"));
	}
	if trace {
		debug!(target: "witness", "replayed {} operators, {} code blobs", operators, code_map.len());
	}
	let root = nodes.pop().expect("length checked above; qed");
	let trie = if binary { Trie::from_root_binary(root) } else { Trie::from_root(root) };
	Ok((trie, code_map))
}

fn decode_path(item: &Rlp, index: usize) -> Result<(Vec<u8>, bool), WitnessError> {
	let raw = item.at(index)?.data()?;
	compact_decode(raw).ok_or(WitnessError::Malformed("undecodable path"))
}

/// Re-express a fully resolved hex trie over single-bit nibbles, for the
/// binary witness mode. Fails on bare hash nodes: a hex digest has no
/// binary counterpart.
pub fn hex_to_bin(trie: &Trie) -> Result<Trie, WitnessError> {
	let mut bin = Trie::from_root_binary(Node::Empty);
	let mut bit_prefix = Vec::new();
	expand_bits(trie.root_node(), &mut bit_prefix, &mut bin)?;
	Ok(bin)
}

fn expand_bits(node: &Node, bit_prefix: &mut Vec<u8>, bin: &mut Trie) -> Result<(), WitnessError> {
	match node {
		Node::Empty => Ok(()),
		Node::Hash(_) => Err(WitnessError::Unresolved),
		Node::Leaf(path, LeafValue::Storage(value)) => {
			let saved = bit_prefix.len();
			bit_prefix.extend_from_slice(&hex_to_bits(path));
			bin.insert_hex(bit_prefix, LeafValue::Storage(value.clone()));
			bit_prefix.truncate(saved);
			Ok(())
		}
		Node::Leaf(path, LeafValue::Account(leaf)) => {
			let saved = bit_prefix.len();
			bit_prefix.extend_from_slice(&hex_to_bits(path));
			bin.insert_hex(
				bit_prefix,
				LeafValue::Account(Box::new(AccountLeaf {
					account: leaf.account.clone(),
					storage: Node::Empty,
				})),
			);
			expand_bits(&leaf.storage, bit_prefix, bin)?;
			bit_prefix.truncate(saved);
			Ok(())
		}
		Node::Extension(path, child) => {
			let saved = bit_prefix.len();
			bit_prefix.extend_from_slice(&hex_to_bits(path));
			expand_bits(child, bit_prefix, bin)?;
			bit_prefix.truncate(saved);
			Ok(())
		}
		Node::Branch(children) => {
			for (i, child) in children.iter().enumerate() {
				if child.is_empty() {
					continue;
				}
				let saved = bit_prefix.len();
				bit_prefix.extend_from_slice(&hex_to_bits(&[i as u8]));
				expand_bits(child, bit_prefix, bin)?;
				bit_prefix.truncate(saved);
			}
			Ok(())
		}
	}
}

/// Accumulates the keys and code a block touched; drained into the witness.
#[derive(Default)]
pub struct ProofGenerator {
	account_touches: std::collections::BTreeSet<Vec<u8>>,
	storage_touches: std::collections::BTreeSet<Vec<u8>>,
	codes: HashMap<H256, Bytes>,
}

impl ProofGenerator {
	pub fn new() -> ProofGenerator {
		ProofGenerator::default()
	}

	/// Record an account read or write, by hashed address.
	pub fn add_touch(&mut self, key: &[u8]) {
		self.account_touches.insert(key.to_vec());
	}

	/// Record a storage access, by 64-byte composite trie key.
	pub fn add_storage_touch(&mut self, key: &[u8]) {
		self.storage_touches.insert(key.to_vec());
	}

	/// Record code read during execution.
	pub fn read_code(&mut self, code_hash: H256, code: &[u8]) {
		self.codes.entry(code_hash).or_insert_with(|| code.to_vec());
	}

	/// Record code created during execution.
	pub fn create_code(&mut self, code_hash: H256, code: &[u8]) {
		self.codes.insert(code_hash, code.to_vec());
	}

	/// Keys touched since the last extraction; clears the accumulator.
	pub fn extract_touches(&mut self) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
		let accounts = std::mem::take(&mut self.account_touches).into_iter().collect();
		let storage = std::mem::take(&mut self.storage_touches).into_iter().collect();
		(accounts, storage)
	}

	/// Code blobs recorded since the last extraction; clears the map.
	pub fn extract_code_map(&mut self) -> HashMap<H256, Bytes> {
		std::mem::take(&mut self.codes)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use ethereum_types::U256;
	use keccak_hash::KECCAK_NULL_RLP;

	fn key(fill: u8) -> Vec<u8> {
		vec![fill; 32]
	}

	fn account(nonce: u64) -> Account {
		let mut account = Account::new();
		account.initialised = true;
		account.nonce = nonce;
		account.balance = U256::from(1_000_000u64);
		account
	}

	fn build_trie() -> Trie {
		let mut t = Trie::new(H256::zero());
		for fill in &[0x11u8, 0x12, 0x21] {
			t.update_account(&key(*fill), &account(*fill as u64));
		}
		let mut composite = key(0x11);
		composite.extend_from_slice(&key(0x22));
		t.update(&composite, b"val", 0);
		t
	}

	#[test]
	fn witness_round_trips_the_full_trie() {
		let t = build_trie();
		let mut rs = ResolveSet::new(0);
		for fill in &[0x11u8, 0x12, 0x21] {
			rs.add_key(&key(*fill));
		}
		let mut composite = key(0x11);
		composite.extend_from_slice(&key(0x22));
		rs.add_key(&composite);

		let mut builder = WitnessBuilder::new(false);
		builder.make_witness(&t, &rs, &HashMap::new()).unwrap();
		let mut bytes = Vec::new();
		let stats = builder.write_to(&mut bytes);
		assert!(stats.operator_count > 0);
		assert!(stats.account_bytes > 0);

		let (restored, codes) = witness_to_trie(&bytes, false).unwrap();
		assert!(codes.is_empty());
		assert_eq!(restored.hash(), t.hash());
		assert_eq!(restored.get(&composite).0.unwrap(), b"val");
		assert_eq!(restored.get_account(&key(0x12)).0.unwrap().nonce, 0x12);
	}

	#[test]
	fn untouched_subtries_come_back_as_digests() {
		let t = build_trie();
		let mut rs = ResolveSet::new(0);
		rs.add_key(&key(0x11));

		let mut builder = WitnessBuilder::new(false);
		builder.make_witness(&t, &rs, &HashMap::new()).unwrap();
		let mut bytes = Vec::new();
		builder.write_to(&mut bytes);

		let (restored, _) = witness_to_trie(&bytes, false).unwrap();
		assert_eq!(restored.hash(), t.hash());
		// the touched account is present in full
		let (acc, ok) = restored.get_account(&key(0x11));
		assert!(ok);
		assert_eq!(acc.unwrap().nonce, 0x11);
		// an untouched sibling is only there as a digest
		let (_, resolved) = restored.get_account(&key(0x21));
		assert!(!resolved);
	}

	#[test]
	fn code_travels_with_the_witness() {
		let code = b"\x60\x00\x60\x00".to_vec();
		let code_hash = keccak(&code);
		let mut t = Trie::new(H256::zero());
		let mut acc = account(1);
		acc.code_hash = code_hash;
		t.update_account(&key(0x11), &acc);

		let mut rs = ResolveSet::new(0);
		rs.add_key(&key(0x11));
		let mut code_map = HashMap::new();
		code_map.insert(code_hash, code.clone());

		let mut builder = WitnessBuilder::new(false);
		builder.make_witness(&t, &rs, &code_map).unwrap();
		let mut bytes = Vec::new();
		let stats = builder.write_to(&mut bytes);
		assert!(stats.code_bytes > 0);

		let (restored, codes) = witness_to_trie(&bytes, false).unwrap();
		assert_eq!(restored.hash(), t.hash());
		assert_eq!(codes.get(&code_hash).unwrap(), &code);
	}

	#[test]
	fn binary_witness_round_trips() {
		let mut t = Trie::new(H256::zero());
		t.update(b"ABCD0001", b"val1", 0);
		t.update(b"ABCE0002", b"val2", 0);

		let t_bin = hex_to_bin(&t).unwrap();

		let mut rs = ResolveSet::new_binary(2);
		rs.add_key(b"ABCD0001");
		let mut builder = WitnessBuilder::new(false);
		builder.make_witness(&t_bin, &rs, &HashMap::new()).unwrap();
		let mut bytes = Vec::new();
		builder.write_to(&mut bytes);

		let (restored, _) = witness_to_trie_bin(&bytes, false).unwrap();
		assert_eq!(restored.hash(), t_bin.hash());
		assert_eq!(restored.get(b"ABCD0001").0.unwrap(), b"val1");
	}

	#[test]
	fn binary_witness_round_trips_an_account() {
		let mut t = Trie::new(H256::zero());
		let account = account(0);
		t.update_account(b"ABCD0001", &account);

		let t_bin = hex_to_bin(&t).unwrap();

		let mut rs = ResolveSet::new_binary(2);
		rs.add_key(b"ABCD0001");
		let mut builder = WitnessBuilder::new(false);
		builder.make_witness(&t_bin, &rs, &HashMap::new()).unwrap();
		let mut bytes = Vec::new();
		builder.write_to(&mut bytes);

		let (restored, _) = witness_to_trie_bin(&bytes, false).unwrap();
		assert_eq!(restored.hash(), t_bin.hash());
		let (got, ok) = restored.get_account(b"ABCD0001");
		assert!(ok);
		assert!(got.unwrap().equals(&account));
	}

	#[test]
	fn hex_to_bin_requires_resolution() {
		let t = Trie::new(H256::repeat_byte(0x77));
		assert_eq!(hex_to_bin(&t).unwrap_err(), WitnessError::Unresolved);
	}

	#[test]
	fn proof_generator_drains_on_extraction() {
		let mut pg = ProofGenerator::new();
		pg.add_touch(&key(0x11));
		pg.add_touch(&key(0x11));
		pg.add_storage_touch(&key(0x22));
		pg.read_code(keccak(b"c"), b"c");

		let (accounts, storage) = pg.extract_touches();
		assert_eq!(accounts.len(), 1);
		assert_eq!(storage.len(), 1);
		assert_eq!(pg.extract_code_map().len(), 1);

		let (accounts, storage) = pg.extract_touches();
		assert!(accounts.is_empty() && storage.is_empty());
	}

	#[test]
	fn malformed_streams_are_rejected() {
		assert!(witness_to_trie(&[0x80], false).is_err());
		// an extension operator with nothing on the stack
		let mut stream = RlpStream::new_list(1);
		stream.append_raw(&Op::Extension { path: vec![1] }.encode(), 1);
		assert_eq!(
			witness_to_trie(&stream.out(), false).unwrap_err(),
			WitnessError::Malformed("extension without a child")
		);
	}

	#[test]
	fn empty_trie_serializes_as_empty_root() {
		let t = Trie::new(H256::zero());
		let mut builder = WitnessBuilder::new(false);
		builder.make_witness(&t, &ResolveSet::new(0), &HashMap::new()).unwrap();
		let mut bytes = Vec::new();
		builder.write_to(&mut bytes);
		let (restored, _) = witness_to_trie(&bytes, false).unwrap();
		assert_eq!(restored.hash(), KECCAK_NULL_RLP);
	}
}
