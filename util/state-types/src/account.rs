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

//! Fixed-shape account record, its compact bucket codec and its trie RLP form.

use ethereum_types::{H256, U256};
use keccak_hash::{KECCAK_EMPTY, KECCAK_NULL_RLP};
use rlp::{DecoderError, Rlp, RlpStream};

/// Incarnation carried by accounts that never held contract storage.
pub const NON_CONTRACT_INCARNATION: u64 = 0;
/// Incarnation assigned to a contract when it is first created.
pub const FIRST_CONTRACT_INCARNATION: u64 = 1;

const FLAG_NONCE: u8 = 0b0000_0001;
const FLAG_BALANCE: u8 = 0b0000_0010;
const FLAG_INCARNATION: u8 = 0b0000_0100;
const FLAG_ROOT: u8 = 0b0000_1000;
const FLAG_CODE_HASH: u8 = 0b0001_0000;

/// Single account of the ledger.
///
/// `root` is the storage trie root, `code_hash` the hash of the (opaque)
/// contract code, `incarnation` the storage epoch counter distinguishing
/// re-created contracts. `initialised` marks whether the balance field
/// carries meaning yet; equality ignores uninitialised balances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
	/// Balance carries meaning only once this is set.
	pub initialised: bool,
	/// Nonce of the account.
	pub nonce: u64,
	/// Balance of the account.
	pub balance: U256,
	/// Storage trie root.
	pub root: H256,
	/// Code hash; `KECCAK_EMPTY` for accounts without code.
	pub code_hash: H256,
	/// Storage epoch counter.
	pub incarnation: u64,
}

impl Default for Account {
	fn default() -> Self {
		Account::new()
	}
}

impl Account {
	/// Fresh uninitialised account with empty storage and no code.
	pub fn new() -> Account {
		Account {
			initialised: false,
			nonce: 0,
			balance: U256::zero(),
			root: KECCAK_NULL_RLP,
			code_hash: KECCAK_EMPTY,
			incarnation: NON_CONTRACT_INCARNATION,
		}
	}

	/// Detached copy, used when a mutation buffer is frozen.
	pub fn self_copy(&self) -> Account {
		self.clone()
	}

	/// True when the account carries no code hash worth preserving.
	pub fn is_empty_code_hash(&self) -> bool {
		self.code_hash == KECCAK_EMPTY || self.code_hash == H256::zero()
	}

	pub fn set_incarnation(&mut self, incarnation: u64) {
		self.incarnation = incarnation;
	}

	/// Equality as used by the state engine: balances only compare once both
	/// sides are initialised, and zero code hashes only match each other.
	pub fn equals(&self, other: &Account) -> bool {
		if self.nonce != other.nonce {
			return false;
		}
		if self.initialised != other.initialised {
			return false;
		}
		if self.initialised && self.balance != other.balance {
			return false;
		}
		if self.root != other.root {
			return false;
		}
		if (self.code_hash == H256::zero()) != (other.code_hash == H256::zero()) {
			return false;
		}
		self.code_hash == other.code_hash
	}

	/// Compact bucket form: a field-set byte, then every present field as
	/// `len u8 ‖ minimal big-endian bytes`. Zero fields are omitted. With
	/// `omit_code_hash` the code hash is left out (thin history mode); the
	/// reader recovers it from the contract-code bucket.
	pub fn encode_for_storage(&self, omit_code_hash: bool) -> Vec<u8> {
		let mut field_set = 0u8;
		let mut out = vec![0u8];
		if self.nonce != 0 {
			field_set |= FLAG_NONCE;
			append_u64(&mut out, self.nonce);
		}
		if !self.balance.is_zero() {
			field_set |= FLAG_BALANCE;
			append_u256(&mut out, &self.balance);
		}
		if self.incarnation != NON_CONTRACT_INCARNATION {
			field_set |= FLAG_INCARNATION;
			append_u64(&mut out, self.incarnation);
		}
		if self.root != KECCAK_NULL_RLP && self.root != H256::zero() {
			field_set |= FLAG_ROOT;
			out.push(32);
			out.extend_from_slice(self.root.as_bytes());
		}
		if !omit_code_hash && !self.is_empty_code_hash() {
			field_set |= FLAG_CODE_HASH;
			out.push(32);
			out.extend_from_slice(self.code_hash.as_bytes());
		}
		out[0] = field_set;
		out
	}

	/// Decode the compact bucket form. Absent fields take their empty
	/// defaults; the result is always marked initialised.
	pub fn decode_for_storage(data: &[u8]) -> Result<Account, DecoderError> {
		if data.is_empty() {
			return Err(DecoderError::Custom("empty account payload"));
		}
		let field_set = data[0];
		let mut pos = 1;
		let mut account = Account::new();
		account.initialised = true;
		if field_set & FLAG_NONCE != 0 {
			account.nonce = read_u64(data, &mut pos)?;
		}
		if field_set & FLAG_BALANCE != 0 {
			account.balance = read_u256(data, &mut pos)?;
		}
		if field_set & FLAG_INCARNATION != 0 {
			account.incarnation = read_u64(data, &mut pos)?;
		}
		if field_set & FLAG_ROOT != 0 {
			account.root = read_h256(data, &mut pos)?;
		}
		if field_set & FLAG_CODE_HASH != 0 {
			account.code_hash = read_h256(data, &mut pos)?;
		}
		if pos != data.len() {
			return Err(DecoderError::Custom("trailing bytes in account payload"));
		}
		Ok(account)
	}

	/// The classic 4-field RLP used for trie leaves.
	pub fn rlp_append(&self, stream: &mut RlpStream) {
		stream.begin_list(4);
		stream.append(&self.nonce);
		stream.append(&self.balance);
		stream.append(&self.root);
		stream.append(&self.code_hash);
	}

	/// Trie leaf payload.
	pub fn rlp(&self) -> Vec<u8> {
		let mut stream = RlpStream::new();
		self.rlp_append(&mut stream);
		stream.out()
	}

	/// Decode the 4-field trie leaf payload.
	pub fn from_rlp(data: &[u8]) -> Result<Account, DecoderError> {
		let rlp = Rlp::new(data);
		if rlp.item_count()? != 4 {
			return Err(DecoderError::RlpIncorrectListLen);
		}
		Ok(Account {
			initialised: true,
			nonce: rlp.val_at(0)?,
			balance: rlp.val_at(1)?,
			root: rlp.val_at(2)?,
			code_hash: rlp.val_at(3)?,
			incarnation: NON_CONTRACT_INCARNATION,
		})
	}
}

fn append_u64(out: &mut Vec<u8>, value: u64) {
	let bytes = value.to_be_bytes();
	let skip = bytes.iter().take_while(|b| **b == 0).count();
	out.push((8 - skip) as u8);
	out.extend_from_slice(&bytes[skip..]);
}

fn append_u256(out: &mut Vec<u8>, value: &U256) {
	let mut bytes = [0u8; 32];
	value.to_big_endian(&mut bytes);
	let skip = bytes.iter().take_while(|b| **b == 0).count();
	out.push((32 - skip) as u8);
	out.extend_from_slice(&bytes[skip..]);
}

fn read_field<'a>(data: &'a [u8], pos: &mut usize) -> Result<&'a [u8], DecoderError> {
	if *pos >= data.len() {
		return Err(DecoderError::Custom("account payload too short"));
	}
	let len = data[*pos] as usize;
	*pos += 1;
	if *pos + len > data.len() {
		return Err(DecoderError::Custom("account field overruns payload"));
	}
	let field = &data[*pos..*pos + len];
	*pos += len;
	Ok(field)
}

fn read_u64(data: &[u8], pos: &mut usize) -> Result<u64, DecoderError> {
	let field = read_field(data, pos)?;
	if field.len() > 8 {
		return Err(DecoderError::Custom("u64 field too long"));
	}
	let mut bytes = [0u8; 8];
	bytes[8 - field.len()..].copy_from_slice(field);
	Ok(u64::from_be_bytes(bytes))
}

fn read_u256(data: &[u8], pos: &mut usize) -> Result<U256, DecoderError> {
	let field = read_field(data, pos)?;
	if field.len() > 32 {
		return Err(DecoderError::Custom("u256 field too long"));
	}
	Ok(U256::from_big_endian(field))
}

fn read_h256(data: &[u8], pos: &mut usize) -> Result<H256, DecoderError> {
	let field = read_field(data, pos)?;
	if field.len() != 32 {
		return Err(DecoderError::Custom("hash field must be 32 bytes"));
	}
	Ok(H256::from_slice(field))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn storage_codec_round_trip() {
		let mut account = Account::new();
		account.initialised = true;
		account.nonce = 2;
		account.balance = U256::from(1_000_000u64);
		account.incarnation = 3;
		account.root = H256::repeat_byte(0xab);
		account.code_hash = keccak_hash::keccak(b"code");

		let encoded = account.encode_for_storage(false);
		let decoded = Account::decode_for_storage(&encoded).unwrap();
		assert_eq!(account, decoded);
	}

	#[test]
	fn empty_account_encodes_to_field_set_only() {
		let mut account = Account::new();
		account.initialised = true;
		let encoded = account.encode_for_storage(false);
		assert_eq!(encoded, vec![0u8]);

		let decoded = Account::decode_for_storage(&encoded).unwrap();
		assert!(decoded.equals(&account));
	}

	#[test]
	fn thin_encoding_drops_code_hash() {
		let mut account = Account::new();
		account.initialised = true;
		account.incarnation = 1;
		account.code_hash = keccak_hash::keccak(b"contract");

		let thin = Account::decode_for_storage(&account.encode_for_storage(true)).unwrap();
		assert!(thin.is_empty_code_hash());
		assert_eq!(thin.incarnation, 1);
	}

	#[test]
	fn equality_ignores_uninitialised_balance() {
		let mut a = Account::new();
		let mut b = Account::new();
		a.balance = U256::from(7u64);
		assert!(a.equals(&b));

		a.initialised = true;
		b.initialised = true;
		b.balance = U256::zero();
		assert!(!a.equals(&b));
	}

	#[test]
	fn trie_rlp_round_trip() {
		let mut account = Account::new();
		account.initialised = true;
		account.nonce = 9;
		account.balance = U256::from(42u64);
		let decoded = Account::from_rlp(&account.rlp()).unwrap();
		assert_eq!(decoded.nonce, 9);
		assert_eq!(decoded.balance, U256::from(42u64));
		assert_eq!(decoded.root, KECCAK_NULL_RLP);
		assert_eq!(decoded.code_hash, KECCAK_EMPTY);
	}

	#[test]
	fn malformed_payload_is_rejected() {
		assert!(Account::decode_for_storage(&[]).is_err());
		// field set says nonce present but payload ends
		assert!(Account::decode_for_storage(&[FLAG_NONCE]).is_err());
		// hash field of wrong width
		let mut bad = vec![FLAG_ROOT, 31];
		bad.extend_from_slice(&[0u8; 31]);
		assert!(Account::decode_for_storage(&bad).is_err());
	}
}
