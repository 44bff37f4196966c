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

//! End-to-end tests of the state engine: block computation, rewind,
//! historical views and witness extraction against the in-memory backend.

use std::sync::Arc;

use ethereum_types::{Address, H256, U256};
use keccak_hash::KECCAK_NULL_RLP;

use bucketdb::dbutils::{ACCOUNTS_HISTORY_BUCKET, PREIMAGE_BUCKET};
use bucketdb::{modified_accounts, Database, MemoryDatabase};
use partial_trie::{witness_to_trie, Trie};
use state_types::Account;
use trie_state::{hash_data, StateReader, StateWriter, TrieDbState};

fn fresh_engine() -> (TrieDbState, Arc<MemoryDatabase>) {
	let db = Arc::new(MemoryDatabase::new());
	(TrieDbState::new(KECCAK_NULL_RLP, db.clone(), 0), db)
}

fn account(nonce: u64, balance: u64) -> Account {
	let mut account = Account::new();
	account.initialised = true;
	account.nonce = nonce;
	account.balance = U256::from(balance);
	account
}

fn value(text: &[u8]) -> H256 {
	let mut v = H256::zero();
	v.0[32 - text.len()..].copy_from_slice(text);
	v
}

#[test]
fn single_slot_write_and_root() {
	let (mut tds, _db) = fresh_engine();
	tds.set_block_nr(1);
	tds.start_new_buffer();

	let addr = Address::repeat_byte(0x11);
	let slot = H256::repeat_byte(0x22);
	{
		let mut writer = tds.trie_state_writer();
		writer.update_account_data(&addr, None, &account(1, 0)).unwrap();
		writer
			.write_account_storage(&addr, 0, &slot, &H256::zero(), &value(b"val"))
			.unwrap();
	}
	let roots = tds.compute_trie_roots().unwrap();
	assert_eq!(roots.len(), 1);
	assert_eq!(roots[0], tds.last_root());

	// the stored root is the hash of a single-leaf storage trie
	let key_hash = hash_data(slot.as_bytes());
	let mut single_leaf = Trie::new(H256::zero());
	single_leaf.update(key_hash.as_bytes(), b"val", 0);
	let expected = single_leaf.hash();

	let stored = tds.read_account_data(&addr).unwrap().expect("account was written");
	assert_eq!(stored.root, expected);
	assert_ne!(stored.root, KECCAK_NULL_RLP);
}

#[test]
fn self_destruct_and_recreate_in_one_block() {
	let (mut tds, _db) = fresh_engine();

	// pre-state: contract with one slot
	tds.set_block_nr(1);
	tds.start_new_buffer();
	let addr = Address::repeat_byte(0xc0);
	let old_slot = H256::repeat_byte(0x22);
	let mut created = account(1, 0);
	created.incarnation = 1;
	{
		let mut writer = tds.trie_state_writer();
		writer.update_account_data(&addr, None, &created).unwrap();
		writer
			.write_account_storage(&addr, 1, &old_slot, &H256::zero(), &value(b"old"))
			.unwrap();
	}
	tds.compute_trie_roots().unwrap();
	let pre = tds.read_account_data(&addr).unwrap().expect("pre-state contract");
	{
		// mirror to the backend so the next incarnation can be derived
		let mut writer = tds.db_state_writer();
		writer.update_account_data(&addr, None, &pre).unwrap();
		writer
			.write_account_storage(&addr, 1, &old_slot, &H256::zero(), &value(b"old"))
			.unwrap();
	}

	// one block: self-destruct, re-create, write a fresh slot
	tds.set_block_nr(2);
	tds.start_new_buffer();
	let new_slot = H256::repeat_byte(0x33);
	{
		let mut writer = tds.trie_state_writer();
		writer.delete_account(&addr, Some(&pre)).unwrap();
		writer.update_account_data(&addr, None, &account(1, 0)).unwrap();
		writer.create_contract(&addr).unwrap();
		writer
			.write_account_storage(&addr, 2, &new_slot, &H256::zero(), &value(b"new"))
			.unwrap();
	}
	tds.compute_trie_roots().unwrap();

	let reborn = tds.read_account_data(&addr).unwrap().expect("account survives the carve-out");
	assert_eq!(reborn.incarnation, pre.incarnation + 1);
	assert!(tds.read_account_storage(&addr, 2, &old_slot).unwrap().is_none());
	assert_eq!(
		tds.read_account_storage(&addr, 2, &new_slot).unwrap().unwrap(),
		b"new".to_vec()
	);
}

#[test]
fn sub_buffers_produce_independent_roots() {
	let (mut tds, _db) = fresh_engine();
	tds.set_block_nr(1);
	let addr = Address::repeat_byte(0x11);

	tds.start_new_buffer();
	tds.trie_state_writer().update_account_data(&addr, None, &account(1, 0)).unwrap();
	tds.start_new_buffer();
	tds.trie_state_writer()
		.update_account_data(&addr, Some(&account(1, 0)), &account(2, 0))
		.unwrap();
	let roots = tds.compute_trie_roots().unwrap();
	assert_eq!(roots.len(), 2);
	assert_ne!(roots[0], roots[1]);
	assert_eq!(roots[1], tds.last_root());

	// each intermediate root matches a one-shot engine at that state
	let (mut nonce1, _db1) = fresh_engine();
	nonce1.set_block_nr(1);
	nonce1.start_new_buffer();
	nonce1.trie_state_writer().update_account_data(&addr, None, &account(1, 0)).unwrap();
	assert_eq!(nonce1.compute_trie_roots().unwrap()[0], roots[0]);

	let (mut nonce2, _db2) = fresh_engine();
	nonce2.set_block_nr(1);
	nonce2.start_new_buffer();
	nonce2.trie_state_writer().update_account_data(&addr, None, &account(2, 0)).unwrap();
	assert_eq!(nonce2.compute_trie_roots().unwrap()[0], roots[1]);
}

#[test]
fn unwind_returns_to_the_previous_root() {
	let (mut tds, _db) = fresh_engine();
	let addr = Address::repeat_byte(0x11);
	let slot = H256::repeat_byte(0x44);

	// block 1: plain balance
	tds.set_block_nr(1);
	tds.start_new_buffer();
	tds.trie_state_writer().update_account_data(&addr, None, &account(1, 50)).unwrap();
	let r0 = *tds.compute_trie_roots().unwrap().last().unwrap();
	let at_block_1 = tds.read_account_data(&addr).unwrap().expect("written in block 1");
	tds.db_state_writer().update_account_data(&addr, None, &at_block_1).unwrap();

	// block 2: balance change plus a fresh storage slot
	tds.set_block_nr(2);
	tds.start_new_buffer();
	{
		let mut writer = tds.trie_state_writer();
		writer
			.update_account_data(&addr, Some(&at_block_1), &account(1, 100))
			.unwrap();
		writer
			.write_account_storage(&addr, 0, &slot, &H256::zero(), &value(b"v"))
			.unwrap();
	}
	let r1 = *tds.compute_trie_roots().unwrap().last().unwrap();
	assert_ne!(r0, r1);
	let at_block_2 = tds.read_account_data(&addr).unwrap().expect("updated in block 2");
	{
		let mut writer = tds.db_state_writer();
		writer
			.update_account_data(&addr, Some(&at_block_1), &at_block_2)
			.unwrap();
		writer
			.write_account_storage(&addr, 0, &slot, &H256::zero(), &value(b"v"))
			.unwrap();
	}

	tds.unwind_to(1).unwrap();
	assert_eq!(tds.last_root(), r0);
	assert_eq!(tds.get_block_nr(), 1);
	let rewound = tds.read_account_data(&addr).unwrap().expect("account exists at block 1");
	assert_eq!(rewound.balance, U256::from(50u64));
	assert!(tds.read_account_storage(&addr, 0, &slot).unwrap().is_none());
}

#[test]
fn historical_reads_see_the_as_of_view() {
	let db = Arc::new(MemoryDatabase::new());
	let addr = Address::repeat_byte(0x11);
	let addr_hash = hash_data(addr.as_bytes());

	// the account changed at block 5: before that it held nonce 1
	let old = account(1, 10);
	let new = account(2, 20);
	db.put(
		bucketdb::dbutils::ACCOUNTS_BUCKET,
		addr_hash.as_bytes(),
		&new.encode_for_storage(false),
	)
	.unwrap();
	db.put_s(
		ACCOUNTS_HISTORY_BUCKET,
		addr_hash.as_bytes(),
		&old.encode_for_storage(false),
		5,
		false,
	)
	.unwrap();

	// as of block 3 the old value is visible, not the latest
	let mut tds = TrieDbState::new(H256::repeat_byte(0xab), db.clone(), 3);
	tds.set_historical(true);
	let seen = tds.read_account_data(&addr).unwrap().expect("account existed at block 3");
	assert_eq!(seen.nonce, 1);

	// past the change the live record wins
	let mut tds = TrieDbState::new(H256::repeat_byte(0xab), db, 10);
	tds.set_historical(true);
	let seen = tds.read_account_data(&addr).unwrap().expect("account exists at block 10");
	assert_eq!(seen.nonce, 2);
}

#[test]
fn witness_covers_touched_accounts_only() {
	let (mut tds, _db) = fresh_engine();
	let touched = Address::repeat_byte(0xaa);
	let dormant_1 = Address::repeat_byte(0xbb);
	let dormant_2 = Address::repeat_byte(0xcc);

	// pre-state: three accounts, no read recording yet
	tds.set_block_nr(1);
	tds.start_new_buffer();
	{
		let mut writer = tds.trie_state_writer();
		for (i, addr) in [touched, dormant_1, dormant_2].iter().enumerate() {
			writer.update_account_data(addr, None, &account(i as u64 + 1, 0)).unwrap();
		}
	}
	tds.compute_trie_roots().unwrap();

	// the block under witness touches one account
	tds.set_resolve_reads(true);
	tds.set_block_nr(2);
	tds.start_new_buffer();
	tds.trie_state_writer()
		.update_account_data(&touched, Some(&account(1, 0)), &account(7, 0))
		.unwrap();
	tds.compute_trie_roots().unwrap();

	let (bytes, stats) = tds.extract_witness(false, false).unwrap();
	assert_eq!(stats.block_number(), 2);
	assert_eq!(stats.witness_size(), bytes.len() as u64);
	assert!(stats.sections().hash_bytes > 0, "dormant accounts ride along as digests");

	let (restored, _codes) = witness_to_trie(&bytes, false).unwrap();
	assert_eq!(restored.hash(), tds.last_root());

	let touched_hash = hash_data(touched.as_bytes());
	let (acc, resolved) = restored.get_account(touched_hash.as_bytes());
	assert!(resolved);
	assert_eq!(acc.expect("touched account is in the witness").nonce, 7);

	let dormant_hash = hash_data(dormant_1.as_bytes());
	let (_, resolved) = restored.get_account(dormant_hash.as_bytes());
	assert!(!resolved, "untouched accounts need resolution");
}

#[test]
fn identical_write_sequences_agree_on_the_root() {
	let build = || {
		let (mut tds, _db) = fresh_engine();
		tds.set_block_nr(1);
		tds.start_new_buffer();
		{
			let mut writer = tds.trie_state_writer();
			for fill in 1u8..20 {
				let addr = Address::repeat_byte(fill);
				writer.update_account_data(&addr, None, &account(fill as u64, 1000)).unwrap();
				if fill % 3 == 0 {
					writer
						.write_account_storage(
							&addr,
							0,
							&H256::repeat_byte(fill),
							&H256::zero(),
							&value(&[fill]),
						)
						.unwrap();
				}
			}
		}
		*tds.compute_trie_roots().unwrap().last().unwrap()
	};
	assert_eq!(build(), build());
}

#[test]
fn buffer_division_does_not_change_the_final_root() {
	let writes: Vec<(Address, Account)> = (1u8..10)
		.map(|fill| (Address::repeat_byte(fill), account(fill as u64, 5)))
		.collect();

	let run = |buffer_every: usize| {
		let (mut tds, _db) = fresh_engine();
		tds.set_block_nr(1);
		tds.start_new_buffer();
		for (i, (addr, acc)) in writes.iter().enumerate() {
			if i > 0 && i % buffer_every == 0 {
				tds.start_new_buffer();
			}
			tds.trie_state_writer().update_account_data(addr, None, acc).unwrap();
		}
		*tds.compute_trie_roots().unwrap().last().unwrap()
	};

	let whole = run(usize::max_value());
	assert_eq!(run(2), whole);
	assert_eq!(run(3), whole);
}

#[test]
fn empty_aggregate_is_a_clean_no_op() {
	let (mut tds, _db) = fresh_engine();
	let roots = tds.compute_trie_roots().unwrap();
	assert!(roots.is_empty());
	assert_eq!(tds.last_root(), KECCAK_NULL_RLP);
}

#[test]
fn writing_zero_deletes_the_slot() {
	let (mut tds, _db) = fresh_engine();
	tds.set_block_nr(1);
	tds.start_new_buffer();
	let addr = Address::repeat_byte(0x11);
	let slot = H256::repeat_byte(0x22);
	tds.trie_state_writer().update_account_data(&addr, None, &account(1, 0)).unwrap();
	let bare = *tds.compute_trie_roots().unwrap().last().unwrap();

	tds.set_block_nr(2);
	tds.start_new_buffer();
	{
		let mut writer = tds.trie_state_writer();
		writer.update_account_data(&addr, None, &account(1, 0)).unwrap();
		writer
			.write_account_storage(&addr, 0, &slot, &H256::zero(), &value(b"x"))
			.unwrap();
	}
	let with_slot = *tds.compute_trie_roots().unwrap().last().unwrap();
	assert_ne!(bare, with_slot);

	tds.set_block_nr(3);
	tds.start_new_buffer();
	{
		let mut writer = tds.trie_state_writer();
		writer.update_account_data(&addr, None, &account(1, 0)).unwrap();
		writer
			.write_account_storage(&addr, 0, &slot, &value(b"x"), &H256::zero())
			.unwrap();
	}
	assert_eq!(*tds.compute_trie_roots().unwrap().last().unwrap(), bare);
	assert!(tds.read_account_storage(&addr, 0, &slot).unwrap().is_none());
}

#[test]
fn reads_land_in_the_extracted_touches() {
	let (mut tds, _db) = fresh_engine();
	tds.set_block_nr(1);
	tds.start_new_buffer();
	let addr = Address::repeat_byte(0x11);
	tds.trie_state_writer().update_account_data(&addr, None, &account(1, 0)).unwrap();
	tds.compute_trie_roots().unwrap();

	tds.set_resolve_reads(true);
	tds.set_block_nr(2);
	tds.start_new_buffer();
	let seen = tds.read_account_data(&addr).unwrap();
	assert!(seen.is_some());
	tds.compute_trie_roots().unwrap();

	let (account_touches, _storage_touches) = tds.extract_touches();
	let addr_hash = hash_data(addr.as_bytes());
	assert!(account_touches.iter().any(|t| t[..] == addr_hash.as_bytes()[..]));
}

#[test]
fn calc_trie_roots_leaves_the_trie_alone() {
	let (mut tds, _db) = fresh_engine();
	tds.set_block_nr(1);
	tds.start_new_buffer();
	let addr = Address::repeat_byte(0x11);
	tds.trie_state_writer().update_account_data(&addr, None, &account(1, 0)).unwrap();

	tds.resolve_state_trie().unwrap();
	let before = tds.last_root();
	let predicted = tds.calc_trie_roots(false).unwrap();
	assert_eq!(tds.last_root(), before, "prediction must not mutate the trie");
	assert_ne!(predicted, before);

	let actual = *tds.compute_trie_roots().unwrap().last().unwrap();
	assert_eq!(actual, predicted);
}

#[test]
fn modified_accounts_resolve_through_preimages() {
	let (mut tds, db) = fresh_engine();
	let addr = Address::repeat_byte(0x11);
	// the preimage is what maps the hashed key back to an address
	db.put(PREIMAGE_BUCKET, hash_data(addr.as_bytes()).as_bytes(), addr.as_bytes()).unwrap();

	tds.set_block_nr(4);
	tds.start_new_buffer();
	tds.trie_state_writer().update_account_data(&addr, None, &account(1, 0)).unwrap();
	tds.compute_trie_roots().unwrap();
	tds.db_state_writer().update_account_data(&addr, None, &account(1, 0)).unwrap();

	let modified = modified_accounts(&*db, 4, 4).unwrap();
	assert_eq!(modified, vec![addr]);
	assert!(modified_accounts(&*db, 5, 9).unwrap().is_empty());
}

#[test]
fn copies_do_not_observe_later_mutations() {
	let (mut tds, _db) = fresh_engine();
	tds.set_block_nr(1);
	tds.start_new_buffer();
	let addr = Address::repeat_byte(0x11);
	tds.trie_state_writer().update_account_data(&addr, None, &account(1, 0)).unwrap();
	tds.compute_trie_roots().unwrap();
	let frozen = tds.copy();
	let root_at_copy = frozen.last_root();

	tds.set_block_nr(2);
	tds.start_new_buffer();
	tds.trie_state_writer().update_account_data(&addr, None, &account(9, 9)).unwrap();
	tds.compute_trie_roots().unwrap();

	assert_eq!(frozen.last_root(), root_at_copy);
	assert_ne!(tds.last_root(), root_at_copy);
}
