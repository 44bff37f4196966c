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

//! The state engine: a partial trie acting as a cache over the bucket
//! backend, a stack of per-period mutation buffers, and the two-phase
//! resolve-then-update root computation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ethereum_types::{Address, H256};
use keccak_hash::{keccak, KECCAK_EMPTY};
use log::{error, info, warn};
use lru_cache::LruCache;
use parity_bytes::Bytes;
use parking_lot::Mutex;

use bucketdb::dbutils::{
	composite_storage_key, composite_trie_key, decode_incarnation, storage_prefix,
	ACCOUNTS_BUCKET, ACCOUNTS_HISTORY_BUCKET, CODE_BUCKET, CONTRACT_CODE_BUCKET, HASH_LENGTH,
	INCARNATION_LENGTH, MAX_TIMESTAMP_LENGTH, PREIMAGE_BUCKET, STORAGE_BUCKET,
	STORAGE_HISTORY_BUCKET,
};
use bucketdb::Database;
use partial_trie::{
	hash_with_modifications, hex_to_bin, ProofGenerator, ResolveSet, Resolver, Trie, TriePruning,
	WitnessBuilder, EMPTY_ROOT, MAX_TRIE_CACHE_GEN,
};
use state_types::{Account, FIRST_CONTRACT_INCARNATION};

use crate::buffer::Buffer;
use crate::error::Error;
use crate::stats::BlockWitnessStats;

const CODE_CACHE_ITEMS: usize = 10_000;
const CODE_SIZE_CACHE_ITEMS: usize = 100_000;

/// Keccak-256 of arbitrary data; the key-hashing function of the ledger.
pub fn hash_data(data: &[u8]) -> H256 {
	keccak(data)
}

/// Read access to the latest (or, in historical mode, an as-of-block) state.
pub trait StateReader {
	fn read_account_data(&mut self, address: &Address) -> Result<Option<Account>, Error>;
	fn read_account_storage(
		&mut self,
		address: &Address,
		incarnation: u64,
		key: &H256,
	) -> Result<Option<Bytes>, Error>;
	fn read_account_code(&mut self, address: &Address, code_hash: H256) -> Result<Bytes, Error>;
	fn read_account_code_size(&mut self, address: &Address, code_hash: H256) -> Result<usize, Error>;
}

/// The state engine: wraps a partial trie and a bucket backend, buffering
/// per-period mutations and computing one authenticated root per buffer.
pub struct TrieDbState {
	pub(crate) t: Arc<Mutex<Trie>>,
	pub(crate) tp: Arc<Mutex<TriePruning>>,
	pub(crate) db: Arc<dyn Database>,
	block_nr: AtomicU64,
	pub(crate) buffers: Vec<Buffer>,
	pub(crate) aggregate_buffer: Option<Buffer>,
	code_cache: Arc<Mutex<LruCache<H256, Bytes>>>,
	code_size_cache: Arc<Mutex<LruCache<H256, usize>>>,
	pub(crate) pg: Arc<Mutex<ProofGenerator>>,
	pub(crate) historical: bool,
	pub(crate) no_history: bool,
	pub(crate) resolve_reads: bool,
	pub(crate) save_preimages: bool,
	pub(crate) thin_history: bool,
	cancel: Arc<AtomicBool>,
}

impl TrieDbState {
	/// Engine over `db` rooted at `root` as of block `block_nr`. The trie
	/// starts as a single stand-in digest and resolves on demand.
	pub fn new(root: H256, db: Arc<dyn Database>, block_nr: u64) -> TrieDbState {
		let tp = Arc::new(Mutex::new(TriePruning::new(block_nr)));
		let mut t = Trie::new(root);
		let touch_sink = tp.clone();
		t.set_touch_func(Box::new(move |hex, del| touch_sink.lock().touch(hex, del)));

		TrieDbState {
			t: Arc::new(Mutex::new(t)),
			tp,
			db,
			block_nr: AtomicU64::new(block_nr),
			buffers: Vec::new(),
			aggregate_buffer: None,
			code_cache: Arc::new(Mutex::new(LruCache::new(CODE_CACHE_ITEMS))),
			code_size_cache: Arc::new(Mutex::new(LruCache::new(CODE_SIZE_CACHE_ITEMS))),
			pg: Arc::new(Mutex::new(ProofGenerator::new())),
			historical: false,
			no_history: false,
			resolve_reads: false,
			save_preimages: true,
			thin_history: false,
			cancel: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn set_historical(&mut self, historical: bool) {
		self.historical = historical;
	}

	pub fn set_resolve_reads(&mut self, resolve_reads: bool) {
		self.resolve_reads = resolve_reads;
	}

	pub fn set_no_history(&mut self, no_history: bool) {
		self.no_history = no_history;
	}

	pub fn set_thin_history(&mut self, thin_history: bool) {
		self.thin_history = thin_history;
	}

	pub fn enable_preimages(&mut self, enable: bool) {
		self.save_preimages = enable;
	}

	/// Ambient cancellation handle; honoured at I/O boundaries and between
	/// buffers during root updates.
	pub fn cancellation(&self) -> Arc<AtomicBool> {
		self.cancel.clone()
	}

	fn cancelled(&self) -> bool {
		self.cancel.load(Ordering::Relaxed)
	}

	pub fn database(&self) -> Arc<dyn Database> {
		self.db.clone()
	}

	/// Isolated deep copy sharing only the backend: the copy never observes
	/// later mutations of this engine.
	pub fn copy(&self) -> TrieDbState {
		let block_nr = self.get_block_nr();
		let tp = Arc::new(Mutex::new(TriePruning::new(block_nr)));
		let mut t = self.t.lock().clone();
		let touch_sink = tp.clone();
		t.set_touch_func(Box::new(move |hex, del| touch_sink.lock().touch(hex, del)));

		TrieDbState {
			t: Arc::new(Mutex::new(t)),
			tp,
			db: self.db.clone(),
			block_nr: AtomicU64::new(block_nr),
			buffers: Vec::new(),
			aggregate_buffer: None,
			code_cache: Arc::new(Mutex::new(LruCache::new(CODE_CACHE_ITEMS))),
			code_size_cache: Arc::new(Mutex::new(LruCache::new(CODE_SIZE_CACHE_ITEMS))),
			pg: Arc::new(Mutex::new(ProofGenerator::new())),
			historical: false,
			no_history: false,
			resolve_reads: false,
			save_preimages: false,
			thin_history: self.thin_history,
			cancel: Arc::new(AtomicBool::new(false)),
		}
	}

	/// Cheap handle sharing the trie, pruner, caches and witness
	/// accumulator, with its own fresh buffer stack.
	pub fn with_new_buffer(&self) -> TrieDbState {
		TrieDbState {
			t: self.t.clone(),
			tp: self.tp.clone(),
			db: self.db.clone(),
			block_nr: AtomicU64::new(self.get_block_nr()),
			buffers: vec![Buffer::new()],
			aggregate_buffer: Some(Buffer::new()),
			code_cache: self.code_cache.clone(),
			code_size_cache: self.code_size_cache.clone(),
			pg: self.pg.clone(),
			historical: self.historical,
			no_history: self.no_history,
			resolve_reads: self.resolve_reads,
			save_preimages: false,
			thin_history: self.thin_history,
			cancel: self.cancel.clone(),
		}
	}

	pub fn get_block_nr(&self) -> u64 {
		self.block_nr.load(Ordering::SeqCst)
	}

	/// Advance the engine and roll the pruner generation.
	pub fn set_block_nr(&mut self, block_nr: u64) {
		self.block_nr.store(block_nr, Ordering::SeqCst);
		self.tp.lock().set_block_nr(block_nr);
	}

	/// Root over the resident trie.
	pub fn last_root(&self) -> H256 {
		self.t.lock().hash()
	}

	/// Freeze the current buffer into the aggregate and open a fresh one.
	pub fn start_new_buffer(&mut self) {
		if let Some(last) = self.buffers.last() {
			self.aggregate_buffer.get_or_insert_with(Buffer::new).merge(last);
		}
		self.buffers.push(Buffer::new());
	}

	pub(crate) fn current_buffer_mut(&mut self) -> &mut Buffer {
		if self.buffers.is_empty() {
			self.buffers.push(Buffer::new());
		}
		self.buffers.last_mut().expect("pushed above when empty; qed")
	}

	/// `resolve_state_trie` followed by `update_state_trie`: one root per
	/// buffer.
	pub fn compute_trie_roots(&mut self) -> Result<Vec<H256>, Error> {
		self.resolve_state_trie()?;
		self.update_state_trie()
	}

	/// Load whatever parts of the trie the aggregated updates (and, with
	/// `resolve_reads`, the recorded reads) will need, so the update phase
	/// runs without touching the backend.
	pub fn resolve_state_trie(&mut self) -> Result<(), Error> {
		if !self.buffers.is_empty() {
			let aggregate = self.aggregate_buffer.get_or_insert_with(Buffer::new);
			let last = self.buffers.last().expect("checked non-empty; qed");
			aggregate.merge(last);
		}
		if self.aggregate_buffer.is_none() {
			return Ok(());
		}

		let t = self.t.clone();
		let mut t = t.lock();

		let (storage_touches, _) = self.build_storage_touches(self.resolve_reads, false);
		let (account_touches, _) = self.build_account_touches(self.resolve_reads, false);

		self.resolve_account_touches(&mut t, &account_touches)?;
		if self.resolve_reads {
			let mut pg = self.pg.lock();
			for touch in &account_touches {
				pg.add_touch(touch.as_bytes());
			}
		}
		self.resolve_storage_touches(&mut t, &storage_touches)?;
		if self.resolve_reads {
			let mut pg = self.pg.lock();
			for touch in &storage_touches {
				pg.add_storage_touch(touch);
			}
		}
		Ok(())
	}

	/// Apply the buffered updates to the (already resolved) trie and
	/// compute one root per buffer. Consumes the buffers.
	pub fn update_state_trie(&mut self) -> Result<Vec<H256>, Error> {
		let t = self.t.clone();
		let mut t = t.lock();
		let result = self.update_trie_roots_locked(&mut t, true);
		self.clear_updates();
		result
	}

	fn update_trie_roots_locked(&mut self, t: &mut Trie, forward: bool) -> Result<Vec<H256>, Error> {
		let block_nr = self.get_block_nr();
		let thin_history = self.thin_history;
		let aggregate = self.aggregate_buffer.get_or_insert_with(Buffer::new);
		update_trie_roots(
			t,
			&mut self.buffers,
			aggregate,
			block_nr,
			forward,
			thin_history,
			&self.cancel,
		)
	}

	pub(crate) fn clear_updates(&mut self) {
		self.buffers.clear();
		self.aggregate_buffer = None;
	}

	/// Side-effect-free root of the aggregated updates: the modifications
	/// are hashed against a shadow of the resident trie.
	pub fn calc_trie_roots(&mut self, trace: bool) -> Result<H256, Error> {
		let (storage_keys, storage_values) = self.build_storage_touches(false, true);
		let (account_keys, account_values) = self.build_account_touches(false, true);
		let t = self.t.lock();
		Ok(hash_with_modifications(
			&t,
			&account_keys,
			&account_values,
			&storage_keys,
			&storage_values,
			trace,
		))
	}

	/// Sorted composite touches of the aggregate's storage writes, plus the
	/// recorded reads not shadowed by writes. With `with_values`, the write
	/// payloads ride along and deleted addresses are skipped.
	fn build_storage_touches(&self, with_reads: bool, with_values: bool) -> (Vec<Vec<u8>>, Vec<Bytes>) {
		let aggregate = match &self.aggregate_buffer {
			Some(aggregate) => aggregate,
			None => return (Vec::new(), Vec::new()),
		};
		let mut touches = Vec::new();
		for (addr_hash, updates) in &aggregate.storage_updates {
			if with_values && aggregate.deleted.contains(addr_hash) {
				continue;
			}
			for key_hash in updates.keys() {
				touches.push(composite_trie_key(addr_hash, key_hash));
			}
		}
		if with_reads {
			for (addr_hash, reads) in &aggregate.storage_reads {
				let written = aggregate.storage_updates.get(addr_hash);
				for key_hash in reads {
					// avoid repeating keys that are both read and updated
					if written.map_or(false, |m| m.contains_key(key_hash)) {
						continue;
					}
					touches.push(composite_trie_key(addr_hash, key_hash));
				}
			}
		}
		touches.sort();
		let mut values = Vec::new();
		if with_values {
			for touch in &touches {
				let addr_hash = H256::from_slice(&touch[..HASH_LENGTH]);
				let key_hash = H256::from_slice(&touch[HASH_LENGTH..]);
				let value = aggregate
					.storage_updates
					.get(&addr_hash)
					.and_then(|m| m.get(&key_hash))
					.cloned()
					.unwrap_or_default();
				values.push(value);
			}
		}
		(touches, values)
	}

	/// Sorted hashed addresses the aggregate touched. An account that is
	/// both updated and deleted contributes a duplicate entry whose first
	/// occurrence forces a storage wipe.
	fn build_account_touches(&self, with_reads: bool, with_values: bool) -> (Vec<H256>, Vec<Option<Account>>) {
		let aggregate = match &self.aggregate_buffer {
			Some(aggregate) => aggregate,
			None => return (Vec::new(), Vec::new()),
		};
		let mut touches = Vec::new();
		for (addr_hash, value) in &aggregate.account_updates {
			if value.is_some() && aggregate.deleted.contains(addr_hash) {
				touches.push(*addr_hash);
			}
			touches.push(*addr_hash);
		}
		if with_reads {
			for addr_hash in &aggregate.account_reads {
				if !aggregate.account_updates.contains_key(addr_hash) {
					touches.push(*addr_hash);
				}
			}
		}
		touches.sort();
		let mut values = Vec::new();
		if with_values {
			values.reserve(touches.len());
			for (i, addr_hash) in touches.iter().enumerate() {
				if i + 1 < touches.len() && *addr_hash == touches[i + 1] {
					// wipe slot preceding the re-registration
					values.push(None);
				} else {
					values.push(aggregate.account_updates.get(addr_hash).cloned().flatten());
				}
			}
		}
		(touches, values)
	}

	fn resolve_account_touches(&self, t: &mut Trie, touches: &[H256]) -> Result<(), Error> {
		let mut resolver: Option<Resolver> = None;
		for addr_hash in touches {
			if let Some(request) = t.need_resolution(None, addr_hash.as_bytes()) {
				resolver
					.get_or_insert_with(|| {
						let mut r = Resolver::new(0, true, self.get_block_nr());
						r.set_historical(self.historical);
						r
					})
					.add_request(request);
			}
		}
		if let Some(mut resolver) = resolver {
			if self.cancelled() {
				return Err(Error::Interrupted);
			}
			resolver.resolve_with_db(t, &*self.db, self.get_block_nr())?;
		}
		Ok(())
	}

	fn resolve_storage_touches(&self, t: &mut Trie, touches: &[Vec<u8>]) -> Result<(), Error> {
		let mut resolver: Option<Resolver> = None;
		for touch in touches {
			if let Some(request) = t.need_resolution(Some(&touch[..HASH_LENGTH]), touch) {
				resolver
					.get_or_insert_with(|| {
						let mut r = Resolver::new(0, false, self.get_block_nr());
						r.set_historical(self.historical);
						r
					})
					.add_request(request);
			}
		}
		if let Some(mut resolver) = resolver {
			if self.cancelled() {
				return Err(Error::Interrupted);
			}
			resolver.resolve_with_db(t, &*self.db, self.get_block_nr())?;
		}
		Ok(())
	}

	/// Keys touched since the last extraction, account and storage lists.
	pub fn extract_touches(&self) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
		self.pg.lock().extract_touches()
	}

	/// Serialize the witness of the block just computed: the trie restricted
	/// to the touches accumulated by the reads and `resolve_state_trie`,
	/// plus the code map.
	pub fn extract_witness(&mut self, trace: bool, bin: bool) -> Result<(Vec<u8>, BlockWitnessStats), Error> {
		let (account_touches, storage_touches) = self.pg.lock().extract_touches();
		let code_map = self.pg.lock().extract_code_map();

		let mut resolve_set = if bin { ResolveSet::new_binary(0) } else { ResolveSet::new(0) };
		for touch in &account_touches {
			resolve_set.add_key(touch);
		}
		for touch in &storage_touches {
			resolve_set.add_key(touch);
		}

		let mut builder = WitnessBuilder::new(trace);
		{
			let t = self.t.lock();
			if bin {
				let t_bin = hex_to_bin(&t)?;
				builder.make_witness(&t_bin, &resolve_set, &code_map)?;
			} else {
				builder.make_witness(&t, &resolve_set, &code_map)?;
			}
		}

		let mut bytes = Vec::new();
		let stats = builder.write_to(&mut bytes);
		let size = bytes.len() as u64;
		Ok((bytes, BlockWitnessStats::new(self.get_block_nr(), size, stats)))
	}

	/// Evict trie nodes that have not been touched for a whole cache
	/// window.
	pub fn prune_tries(&self, print: bool) {
		let t = self.t.clone();
		let mut t = t.lock();
		let mut tp = self.tp.lock();
		if print {
			info!(target: "state", "before pruning: {} resident, {} accounted nodes",
				t.count_prunable_nodes(), tp.node_count());
		}
		tp.prune_to(&mut t, MAX_TRIE_CACHE_GEN);
		info!(target: "state", "pruned tries: {} accounted nodes", tp.node_count());
		if print {
			info!(target: "state", "after pruning: {} resident nodes", t.count_prunable_nodes());
		}
	}

	pub fn pruning_debug_dump(&self) -> String {
		self.tp.lock().debug_dump()
	}

	/// Textual dump of the resident trie, for diagnostics.
	pub fn print_trie(&self) -> String {
		self.t.lock().debug_dump()
	}

	/// Drop the resident trie and reload the account layer from the
	/// backend.
	pub fn rebuild(&mut self) -> Result<(), Error> {
		let block_nr = self.get_block_nr();
		let t = self.t.clone();
		let mut t = t.lock();
		t.rebuild(&*self.db, block_nr)?;
		info!(target: "state", "rebuilt state trie: {} resident nodes", t.count_prunable_nodes());
		Ok(())
	}

	/// Replay the change sets backwards to `block_nr`, re-run the update
	/// path in rewind mode and drop the undone history.
	pub fn unwind_to(&mut self, block_nr: u64) -> Result<(), Error> {
		let current = self.get_block_nr();
		self.start_new_buffer();

		let db = self.db.clone();
		let mut tuples: Vec<(Vec<u8>, Vec<u8>, Vec<u8>)> = Vec::new();
		db.rewind_data(current, block_nr, &mut |bucket, key, value| {
			tuples.push((bucket.to_vec(), key.to_vec(), value.to_vec()));
			Ok(())
		})?;

		for (bucket, key, value) in tuples {
			if bucket == ACCOUNTS_HISTORY_BUCKET {
				let addr_hash = H256::from_slice(&key[..HASH_LENGTH]);
				if !value.is_empty() {
					let mut account = Account::decode_for_storage(&value)?;
					if account.incarnation > 0 && self.thin_history && account.is_empty_code_hash() {
						match db.get(CONTRACT_CODE_BUCKET, &storage_prefix(&addr_hash, account.incarnation))? {
							Some(code_hash) if code_hash.len() == HASH_LENGTH => {
								account.code_hash = H256::from_slice(&code_hash);
							}
							_ => error!(target: "state", "no code hash for rewound account {:?}", addr_hash),
						}
					}
					self.current_buffer_mut().account_updates.insert(addr_hash, Some(account));
					db.put(ACCOUNTS_BUCKET, addr_hash.as_bytes(), &value)?;
				} else {
					self.current_buffer_mut().account_updates.insert(addr_hash, None);
					db.delete(ACCOUNTS_BUCKET, addr_hash.as_bytes())?;
				}
			} else if bucket == STORAGE_HISTORY_BUCKET {
				let addr_hash = H256::from_slice(&key[..HASH_LENGTH]);
				let key_hash = H256::from_slice(&key[HASH_LENGTH + INCARNATION_LENGTH..]);
				self.current_buffer_mut()
					.storage_updates
					.entry(addr_hash)
					.or_insert_with(Default::default)
					.insert(key_hash, value.clone());
				if !value.is_empty() {
					db.put(STORAGE_BUCKET, &key, &value)?;
				} else {
					db.delete(STORAGE_BUCKET, &key)?;
				}
			}
		}

		self.resolve_state_trie()?;
		{
			let t = self.t.clone();
			let mut t = t.lock();
			self.update_trie_roots_locked(&mut t, false)?;
		}
		for timestamp in ((block_nr + 1)..=current).rev() {
			db.delete_timestamp(timestamp)?;
		}
		self.clear_updates();
		self.set_block_nr(block_nr);
		Ok(())
	}

	/// Account lookup by hashed address: resident trie first, then the
	/// backend (as-of view in historical mode).
	pub fn read_account_data_by_hash(&self, addr_hash: H256) -> Result<Option<Account>, Error> {
		{
			let t = self.t.lock();
			let (account, resolved) = t.get_account(addr_hash.as_bytes());
			if resolved {
				return Ok(account.cloned());
			}
		}
		let enc = if self.historical {
			self.db.get_as_of(
				ACCOUNTS_BUCKET,
				ACCOUNTS_HISTORY_BUCKET,
				addr_hash.as_bytes(),
				self.get_block_nr() + 1,
			)?
		} else {
			self.db.get(ACCOUNTS_BUCKET, addr_hash.as_bytes())?
		};
		let enc = match enc {
			Some(enc) if !enc.is_empty() => enc,
			_ => return Ok(None),
		};
		let mut account = Account::decode_for_storage(&enc)?;
		if self.historical && self.thin_history && account.is_empty_code_hash() && account.incarnation > 0 {
			match self.db.get(CONTRACT_CODE_BUCKET, &storage_prefix(&addr_hash, account.incarnation))? {
				Some(code_hash) if code_hash.len() == HASH_LENGTH => {
					account.code_hash = H256::from_slice(&code_hash);
				}
				_ => error!(target: "state", "missing code hash for account {:?}", addr_hash),
			}
		}
		Ok(Some(account))
	}

	/// Hash an address, saving the preimage when asked and enabled.
	pub fn hash_address(&self, address: &Address, save: bool) -> Result<H256, Error> {
		let addr_hash = hash_data(address.as_bytes());
		self.save_preimage(save, addr_hash.as_bytes(), address.as_bytes())?;
		Ok(addr_hash)
	}

	/// Hash a storage key, saving the preimage when asked and enabled.
	pub fn hash_key(&self, key: &H256, save: bool) -> Result<H256, Error> {
		let key_hash = hash_data(key.as_bytes());
		self.save_preimage(save, key_hash.as_bytes(), key.as_bytes())?;
		Ok(key_hash)
	}

	pub(crate) fn save_preimage(&self, save: bool, hash: &[u8], preimage: &[u8]) -> Result<(), Error> {
		if !save || !self.save_preimages {
			return Ok(());
		}
		// skip rewriting an identical preimage
		if self.db.get(PREIMAGE_BUCKET, hash)?.is_some() {
			return Ok(());
		}
		self.db.put(PREIMAGE_BUCKET, hash, preimage)?;
		Ok(())
	}

	/// Reverse lookup of a saved preimage.
	pub fn get_key(&self, hashed: &[u8]) -> Option<Bytes> {
		self.db.get(PREIMAGE_BUCKET, hashed).ok().flatten()
	}

	/// Incarnation the next contract created at this address receives: one
	/// past the newest incarnation found in the storage bucket, which sorts
	/// first under the address prefix.
	pub(crate) fn next_incarnation(&self, addr_hash: H256) -> Result<u64, Error> {
		let fixed_bits = (8 * HASH_LENGTH) as u32;
		let mut newest: Option<u64> = None;
		let mut walker = |key: &[u8], _: &[u8]| -> std::io::Result<bool> {
			newest = Some(decode_incarnation(&key[HASH_LENGTH..HASH_LENGTH + INCARNATION_LENGTH]));
			Ok(false)
		};
		if self.historical {
			let mut start = vec![0u8; 2 * HASH_LENGTH + INCARNATION_LENGTH + MAX_TIMESTAMP_LENGTH];
			start[..HASH_LENGTH].copy_from_slice(addr_hash.as_bytes());
			self.db.walk_as_of(
				STORAGE_BUCKET,
				STORAGE_HISTORY_BUCKET,
				&start,
				fixed_bits,
				self.get_block_nr(),
				&mut walker,
			)?;
		} else {
			let mut start = vec![0u8; 2 * HASH_LENGTH + INCARNATION_LENGTH];
			start[..HASH_LENGTH].copy_from_slice(addr_hash.as_bytes());
			self.db.walk(STORAGE_BUCKET, &start, fixed_bits, &mut walker)?;
		}
		Ok(match newest {
			Some(incarnation) => incarnation + 1,
			None => FIRST_CONTRACT_INCARNATION,
		})
	}

	pub(crate) fn record_account_read(&mut self, addr_hash: H256) {
		let buffer = self.current_buffer_mut();
		if !buffer.account_updates.contains_key(&addr_hash) {
			buffer.account_reads.insert(addr_hash);
		}
	}
}

impl StateReader for TrieDbState {
	fn read_account_data(&mut self, address: &Address) -> Result<Option<Account>, Error> {
		let addr_hash = self.hash_address(address, false)?;
		if self.resolve_reads {
			self.record_account_read(addr_hash);
		}
		self.read_account_data_by_hash(addr_hash)
	}

	fn read_account_storage(
		&mut self,
		address: &Address,
		incarnation: u64,
		key: &H256,
	) -> Result<Option<Bytes>, Error> {
		let addr_hash = self.hash_address(address, false)?;
		if let Some(buffer) = self.buffers.last() {
			if buffer.deleted.contains(&addr_hash) {
				return Ok(None);
			}
		}
		if let Some(aggregate) = &self.aggregate_buffer {
			if aggregate.deleted.contains(&addr_hash) {
				return Ok(None);
			}
		}
		let key_hash = self.hash_key(key, false)?;

		if self.resolve_reads {
			let buffer = self.current_buffer_mut();
			let written = buffer
				.storage_updates
				.get(&addr_hash)
				.map_or(false, |m| m.contains_key(&key_hash));
			if !written {
				buffer.storage_reads.entry(addr_hash).or_insert_with(Default::default).insert(key_hash);
			}
		}

		let resident = {
			let t = self.t.lock();
			let (value, resolved) = t.get(&composite_trie_key(&addr_hash, &key_hash));
			if resolved {
				Some(value.map(|v| v.to_vec()))
			} else {
				None
			}
		};
		let value = match resident {
			Some(value) => value,
			None => {
				if self.historical {
					self.db.get_as_of(
						STORAGE_BUCKET,
						STORAGE_HISTORY_BUCKET,
						&composite_storage_key(&addr_hash, incarnation, &key_hash),
						self.get_block_nr(),
					)?
				} else {
					self.db.get(STORAGE_BUCKET, &composite_storage_key(&addr_hash, incarnation, &key_hash))?
				}
			}
		};
		Ok(value.filter(|v| !v.is_empty()))
	}

	fn read_account_code(&mut self, address: &Address, code_hash: H256) -> Result<Bytes, Error> {
		if code_hash == KECCAK_EMPTY || code_hash == H256::zero() {
			return Ok(Bytes::new());
		}
		let cached = self.code_cache.lock().get_mut(&code_hash).cloned();
		let code = match cached {
			Some(code) => code,
			None => {
				let code = match self.db.get(CODE_BUCKET, code_hash.as_bytes())? {
					Some(code) => code,
					None => {
						warn!(target: "state", "no code under hash {:?}", code_hash);
						Bytes::new()
					}
				};
				self.code_size_cache.lock().insert(code_hash, code.len());
				self.code_cache.lock().insert(code_hash, code.clone());
				code
			}
		};
		if self.resolve_reads {
			let addr_hash = hash_data(address.as_bytes());
			self.record_account_read(addr_hash);
			self.pg.lock().read_code(code_hash, &code);
		}
		Ok(code)
	}

	fn read_account_code_size(&mut self, address: &Address, code_hash: H256) -> Result<usize, Error> {
		let cached = self.code_size_cache.lock().get_mut(&code_hash).copied();
		match cached {
			Some(size) => {
				if self.resolve_reads {
					// the witness needs the code itself, not just its length
					let code = self.read_account_code(address, code_hash)?;
					debug_assert_eq!(code.len(), size, "code and code-size caches agree");
				}
				Ok(size)
			}
			None => {
				let code = self.read_account_code(address, code_hash)?;
				Ok(code.len())
			}
		}
	}
}

/// The actual trie mutation pass: one iteration per buffer, in order.
/// `forward` distinguishes block progression from rewind; during rewind
/// storage updates are probed first, as the pre-image may concern an
/// account whose subtrie is a bare hash at the target.
fn update_trie_roots(
	t: &mut Trie,
	buffers: &mut [Buffer],
	aggregate: &mut Buffer,
	block_nr: u64,
	forward: bool,
	thin_history: bool,
	cancel: &AtomicBool,
) -> Result<Vec<H256>, Error> {
	let mut roots = Vec::with_capacity(buffers.len());
	// prevents repeated storage clearouts across buffers of one block
	let mut already_created: HashSet<H256> = HashSet::new();

	for buffer in buffers.iter_mut() {
		if cancel.load(Ordering::Relaxed) {
			return Err(Error::Interrupted);
		}

		// new contracts wipe whatever storage remains at their address
		let mut created: Vec<H256> = buffer.created.iter().cloned().collect();
		created.sort();
		for addr_hash in created {
			if !already_created.insert(addr_hash) {
				continue;
			}
			if let Some(Some(account)) = buffer.account_updates.get_mut(&addr_hash) {
				account.root = EMPTY_ROOT;
			}
			if let Some(Some(account)) = aggregate.account_updates.get_mut(&addr_hash) {
				account.root = EMPTY_ROOT;
			}
			t.update_account_root(addr_hash.as_bytes(), EMPTY_ROOT);
			t.delete_subtree(addr_hash.as_bytes(), block_nr);
		}

		for (addr_hash, account) in &buffer.account_updates {
			match account {
				Some(account) => t.update_account(addr_hash.as_bytes(), account),
				None => t.delete(addr_hash.as_bytes(), block_nr),
			}
		}

		let mut touched_storage: Vec<H256> = buffer.storage_updates.keys().cloned().collect();
		touched_storage.sort();
		for addr_hash in touched_storage {
			let updates = &buffer.storage_updates[&addr_hash];
			for (key_hash, value) in updates {
				let composite = composite_trie_key(&addr_hash, key_hash);
				if !value.is_empty() {
					if forward || t.get(&composite).1 {
						t.update(&composite, value, block_nr);
					}
				} else if forward || t.get(&composite).1 {
					t.delete(&composite, block_nr);
				}
			}

			if forward || thin_history {
				let (resolved, root) = t.deep_hash(addr_hash.as_bytes());
				let root = if resolved { root } else { EMPTY_ROOT };
				if let Some(Some(account)) = buffer.account_updates.get_mut(&addr_hash) {
					account.root = root;
				}
				if let Some(Some(account)) = aggregate.account_updates.get_mut(&addr_hash) {
					account.root = root;
				}
				t.update_account_root(addr_hash.as_bytes(), root);
			} else {
				// full-history rewind re-derives what the stored roots claim
				let (resolved, got) = t.deep_hash(addr_hash.as_bytes());
				let got = if resolved { got } else { EMPTY_ROOT };
				let stored = buffer
					.account_updates
					.get(&addr_hash)
					.into_iter()
					.chain(aggregate.account_updates.get(&addr_hash))
					.filter_map(|a| a.as_ref())
					.map(|a| a.root)
					.next();
				if let Some(expected) = stored {
					if expected != got {
						return Err(Error::StorageRootMismatch { address_hash: addr_hash, expected, got });
					}
				}
			}
		}

		let mut deleted: Vec<H256> = buffer
			.deleted
			.iter()
			.filter(|addr_hash| !buffer.created.contains(addr_hash))
			.cloned()
			.collect();
		deleted.sort();
		for addr_hash in deleted {
			if let Some(Some(account)) = buffer.account_updates.get_mut(&addr_hash) {
				account.root = EMPTY_ROOT;
			}
			if let Some(Some(account)) = aggregate.account_updates.get_mut(&addr_hash) {
				account.root = EMPTY_ROOT;
			}
			t.update_account_root(addr_hash.as_bytes(), EMPTY_ROOT);
			t.delete_subtree(addr_hash.as_bytes(), block_nr);
		}

		roots.push(t.hash());
	}
	Ok(roots)
}
