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

//! Writer facades over the state engine: buffering writes for root
//! computation, mirroring them into the backend with history, or ignoring
//! them altogether.

use ethereum_types::{Address, H256};
use parity_bytes::Bytes;

use bucketdb::dbutils::{
	composite_storage_key, storage_prefix, ACCOUNTS_BUCKET, ACCOUNTS_HISTORY_BUCKET, CODE_BUCKET,
	CONTRACT_CODE_BUCKET, STORAGE_BUCKET, STORAGE_HISTORY_BUCKET,
};
use bucketdb::Database;
use state_types::Account;

use crate::error::Error;
use crate::state::TrieDbState;

/// Write access to the state, per change period.
pub trait StateWriter {
	fn update_account_data(
		&mut self,
		address: &Address,
		original: Option<&Account>,
		account: &Account,
	) -> Result<(), Error>;
	fn update_account_code(
		&mut self,
		addr_hash: H256,
		incarnation: u64,
		code_hash: H256,
		code: &[u8],
	) -> Result<(), Error>;
	fn delete_account(&mut self, address: &Address, original: Option<&Account>) -> Result<(), Error>;
	fn write_account_storage(
		&mut self,
		address: &Address,
		incarnation: u64,
		key: &H256,
		original: &H256,
		value: &H256,
	) -> Result<(), Error>;
	fn create_contract(&mut self, address: &Address) -> Result<(), Error>;
}

/// A writer that ignores everything; for side-effect-free execution.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWriter;

impl NoopWriter {
	pub fn new() -> NoopWriter {
		NoopWriter
	}
}

impl StateWriter for NoopWriter {
	fn update_account_data(&mut self, _: &Address, _: Option<&Account>, _: &Account) -> Result<(), Error> {
		Ok(())
	}

	fn update_account_code(&mut self, _: H256, _: u64, _: H256, _: &[u8]) -> Result<(), Error> {
		Ok(())
	}

	fn delete_account(&mut self, _: &Address, _: Option<&Account>) -> Result<(), Error> {
		Ok(())
	}

	fn write_account_storage(&mut self, _: &Address, _: u64, _: &H256, _: &H256, _: &H256) -> Result<(), Error> {
		Ok(())
	}

	fn create_contract(&mut self, _: &Address) -> Result<(), Error> {
		Ok(())
	}
}

/// Registers writes in the engine's current buffer; the trie and the roots
/// only change once `compute_trie_roots` runs.
pub struct TrieStateWriter<'a> {
	tds: &'a mut TrieDbState,
}

impl TrieDbState {
	pub fn trie_state_writer(&mut self) -> TrieStateWriter {
		TrieStateWriter { tds: self }
	}

	pub fn db_state_writer(&mut self) -> DbStateWriter {
		DbStateWriter { tds: self }
	}
}

impl<'a> StateWriter for TrieStateWriter<'a> {
	fn update_account_data(
		&mut self,
		address: &Address,
		_original: Option<&Account>,
		account: &Account,
	) -> Result<(), Error> {
		let addr_hash = self.tds.hash_address(address, false)?;
		self.tds.current_buffer_mut().account_updates.insert(addr_hash, Some(account.clone()));
		Ok(())
	}

	fn update_account_code(
		&mut self,
		_addr_hash: H256,
		_incarnation: u64,
		code_hash: H256,
		code: &[u8],
	) -> Result<(), Error> {
		if self.tds.resolve_reads {
			self.tds.pg.lock().create_code(code_hash, code);
		}
		Ok(())
	}

	fn delete_account(&mut self, address: &Address, _original: Option<&Account>) -> Result<(), Error> {
		let addr_hash = self.tds.hash_address(address, false)?;
		let buffer = self.tds.current_buffer_mut();
		buffer.account_updates.insert(addr_hash, None);
		buffer.storage_updates.remove(&addr_hash);
		buffer.deleted.insert(addr_hash);
		Ok(())
	}

	fn write_account_storage(
		&mut self,
		address: &Address,
		_incarnation: u64,
		key: &H256,
		_original: &H256,
		value: &H256,
	) -> Result<(), Error> {
		let addr_hash = self.tds.hash_address(address, false)?;
		let key_hash = self.tds.hash_key(key, false)?;
		let trimmed = trim_value(value);
		self.tds
			.current_buffer_mut()
			.storage_updates
			.entry(addr_hash)
			.or_insert_with(Default::default)
			.insert(key_hash, trimmed);
		Ok(())
	}

	fn create_contract(&mut self, address: &Address) -> Result<(), Error> {
		let addr_hash = self.tds.hash_address(address, true)?;
		let incarnation = self.tds.next_incarnation(addr_hash)?;
		let buffer = self.tds.current_buffer_mut();
		buffer.created.insert(addr_hash);
		if let Some(Some(account)) = buffer.account_updates.get_mut(&addr_hash) {
			account.set_incarnation(incarnation);
		}
		Ok(())
	}
}

/// Mirrors writes straight into the backend, journalling the previous
/// values into the history buckets and change sets that drive rewind.
pub struct DbStateWriter<'a> {
	tds: &'a mut TrieDbState,
}

impl<'a> StateWriter for DbStateWriter<'a> {
	fn update_account_data(
		&mut self,
		address: &Address,
		original: Option<&Account>,
		account: &Account,
	) -> Result<(), Error> {
		let addr_hash = self.tds.hash_address(address, false)?;
		let db = self.tds.database();
		db.put(ACCOUNTS_BUCKET, addr_hash.as_bytes(), &account.encode_for_storage(false))?;
		if !self.tds.no_history {
			let previous = original
				.map(|a| a.encode_for_storage(self.tds.thin_history))
				.unwrap_or_default();
			db.put_s(ACCOUNTS_HISTORY_BUCKET, addr_hash.as_bytes(), &previous, self.tds.get_block_nr(), false)?;
		}
		Ok(())
	}

	fn update_account_code(
		&mut self,
		addr_hash: H256,
		incarnation: u64,
		code_hash: H256,
		code: &[u8],
	) -> Result<(), Error> {
		let db = self.tds.database();
		db.put(CODE_BUCKET, code_hash.as_bytes(), code)?;
		// lets thin history reconstruct code hashes it dropped
		db.put(CONTRACT_CODE_BUCKET, &storage_prefix(&addr_hash, incarnation), code_hash.as_bytes())?;
		Ok(())
	}

	fn delete_account(&mut self, address: &Address, original: Option<&Account>) -> Result<(), Error> {
		let addr_hash = self.tds.hash_address(address, false)?;
		let db = self.tds.database();
		db.delete(ACCOUNTS_BUCKET, addr_hash.as_bytes())?;
		if !self.tds.no_history {
			let previous = original
				.map(|a| a.encode_for_storage(self.tds.thin_history))
				.unwrap_or_default();
			db.put_s(ACCOUNTS_HISTORY_BUCKET, addr_hash.as_bytes(), &previous, self.tds.get_block_nr(), false)?;
		}
		Ok(())
	}

	fn write_account_storage(
		&mut self,
		address: &Address,
		incarnation: u64,
		key: &H256,
		original: &H256,
		value: &H256,
	) -> Result<(), Error> {
		if original == value {
			return Ok(());
		}
		let addr_hash = self.tds.hash_address(address, false)?;
		let key_hash = self.tds.hash_key(key, false)?;
		let composite = composite_storage_key(&addr_hash, incarnation, &key_hash);
		let trimmed = trim_value(value);
		let db = self.tds.database();
		if trimmed.is_empty() {
			db.delete(STORAGE_BUCKET, &composite)?;
		} else {
			db.put(STORAGE_BUCKET, &composite, &trimmed)?;
		}
		if !self.tds.no_history {
			db.put_s(STORAGE_HISTORY_BUCKET, &composite, &trim_value(original), self.tds.get_block_nr(), false)?;
		}
		Ok(())
	}

	fn create_contract(&mut self, address: &Address) -> Result<(), Error> {
		self.tds.hash_address(address, true)?;
		Ok(())
	}
}

/// Storage values are stored left-trimmed; the empty result doubles as the
/// delete marker.
fn trim_value(value: &H256) -> Bytes {
	let bytes = value.as_bytes();
	let skip = bytes.iter().take_while(|b| **b == 0).count();
	bytes[skip..].to_vec()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn zero_values_trim_to_delete_markers() {
		assert!(trim_value(&H256::zero()).is_empty());
		assert_eq!(trim_value(&H256::from_low_u64_be(0x1234)), vec![0x12, 0x34]);
	}
}
