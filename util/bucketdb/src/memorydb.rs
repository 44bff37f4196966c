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

//! In-memory reference backend. Complete enough to stand in for a real
//! store in tests and single-process tools.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use log::trace;
use parity_bytes::Bytes;
use parking_lot::RwLock;

use crate::changeset::ChangeSet;
use crate::dbutils::{
	change_set_key, decode_timestamp, encode_timestamp, history_key, matches_fixed_bits,
	CHANGE_SET_BUCKET, MAX_TIMESTAMP_LENGTH,
};
use crate::{decode_error, Database, Walker};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

type Bucket = BTreeMap<Vec<u8>, Vec<u8>>;

/// Sorted-map backend guarded by a single reader/writer lock.
pub struct MemoryDatabase {
	buckets: RwLock<HashMap<Vec<u8>, Bucket>>,
	id: u64,
}

impl Default for MemoryDatabase {
	fn default() -> Self {
		MemoryDatabase::new()
	}
}

impl MemoryDatabase {
	pub fn new() -> MemoryDatabase {
		MemoryDatabase {
			buckets: RwLock::new(HashMap::new()),
			id: NEXT_ID.fetch_add(1, Ordering::SeqCst),
		}
	}

	/// Number of live entries across all buckets, for diagnostics.
	pub fn len(&self) -> usize {
		self.buckets.read().values().map(|b| b.len()).sum()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// The earliest history entry for `key` with a timestamp `>= timestamp`,
	/// decoded from the `key ‖ enc(ts)` layout.
	fn history_seek(bucket: &Bucket, key: &[u8], timestamp: u64) -> Option<(u64, Bytes)> {
		let from = history_key(key, timestamp);
		for (entry_key, value) in bucket.range(from..) {
			if entry_key.len() <= key.len() || &entry_key[..key.len()] != key {
				break;
			}
			if let Some((ts, rest)) = decode_timestamp(&entry_key[key.len()..]) {
				if rest.is_empty() && ts >= timestamp {
					return Some((ts, value.clone()));
				}
			}
		}
		None
	}
}

impl Database for MemoryDatabase {
	fn get(&self, bucket: &[u8], key: &[u8]) -> io::Result<Option<Bytes>> {
		Ok(self.buckets.read().get(bucket).and_then(|b| b.get(key).cloned()))
	}

	fn put(&self, bucket: &[u8], key: &[u8], value: &[u8]) -> io::Result<()> {
		self.buckets
			.write()
			.entry(bucket.to_vec())
			.or_insert_with(BTreeMap::new)
			.insert(key.to_vec(), value.to_vec());
		Ok(())
	}

	fn put_s(&self, hbucket: &[u8], key: &[u8], value: &[u8], timestamp: u64, changeset_only: bool) -> io::Result<()> {
		let mut buckets = self.buckets.write();
		if !changeset_only {
			buckets
				.entry(hbucket.to_vec())
				.or_insert_with(BTreeMap::new)
				.insert(history_key(key, timestamp), value.to_vec());
		}
		let cs_bucket = buckets.entry(CHANGE_SET_BUCKET.to_vec()).or_insert_with(BTreeMap::new);
		let cs_key = change_set_key(timestamp, hbucket);
		let mut changes = match cs_bucket.get(&cs_key) {
			Some(raw) => ChangeSet::decode(raw).map_err(|_| decode_error("malformed change set payload"))?,
			None => ChangeSet::new(),
		};
		// only the first write of a key within a block is its pre-image
		if !changes.contains(key) {
			changes.add(key, value);
			cs_bucket.insert(cs_key, changes.encode());
		}
		Ok(())
	}

	fn delete(&self, bucket: &[u8], key: &[u8]) -> io::Result<()> {
		if let Some(b) = self.buckets.write().get_mut(bucket) {
			b.remove(key);
		}
		Ok(())
	}

	fn delete_timestamp(&self, timestamp: u64) -> io::Result<()> {
		let mut buckets = self.buckets.write();
		let prefix = encode_timestamp(timestamp);
		let mut change_sets: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
		if let Some(cs_bucket) = buckets.get(CHANGE_SET_BUCKET) {
			for (key, value) in cs_bucket.range(prefix.clone()..) {
				if !key.starts_with(&prefix) {
					break;
				}
				change_sets.push((key.clone(), value.clone()));
			}
		}
		trace!(target: "bucketdb", "dropping {} change set(s) of block {}", change_sets.len(), timestamp);
		for (cs_key, raw) in change_sets {
			let hbucket = match decode_timestamp(&cs_key) {
				Some((_, rest)) => rest.to_vec(),
				None => return Err(decode_error("malformed change set key")),
			};
			let changes = ChangeSet::decode(&raw).map_err(|_| decode_error("malformed change set payload"))?;
			if let Some(hist) = buckets.get_mut(hbucket.as_slice()) {
				changes.walk::<io::Error, _>(|key, _| {
					hist.remove(&history_key(key, timestamp));
					Ok(())
				})?;
			}
			if let Some(cs_bucket) = buckets.get_mut(CHANGE_SET_BUCKET) {
				cs_bucket.remove(&cs_key);
			}
		}
		Ok(())
	}

	fn get_as_of(&self, bucket: &[u8], hbucket: &[u8], key: &[u8], timestamp: u64) -> io::Result<Option<Bytes>> {
		let buckets = self.buckets.read();
		if let Some(hist) = buckets.get(hbucket) {
			if let Some((_, value)) = Self::history_seek(hist, key, timestamp) {
				if value.is_empty() {
					return Ok(None);
				}
				return Ok(Some(value));
			}
		}
		Ok(buckets.get(bucket).and_then(|b| b.get(key).cloned()))
	}

	fn walk(&self, bucket: &[u8], start_key: &[u8], fixed_bits: u32, walker: &mut Walker) -> io::Result<()> {
		// snapshot the range so the walker may re-enter the database
		let entries: Vec<(Vec<u8>, Vec<u8>)> = {
			let buckets = self.buckets.read();
			match buckets.get(bucket) {
				Some(b) => b
					.range(start_key.to_vec()..)
					.take_while(|(k, _)| matches_fixed_bits(k, start_key, fixed_bits))
					.map(|(k, v)| (k.clone(), v.clone()))
					.collect(),
				None => return Ok(()),
			}
		};
		for (key, value) in entries {
			if !walker(&key, &value)? {
				break;
			}
		}
		Ok(())
	}

	fn walk_as_of(
		&self,
		bucket: &[u8],
		hbucket: &[u8],
		start_key: &[u8],
		fixed_bits: u32,
		timestamp: u64,
		walker: &mut Walker,
	) -> io::Result<()> {
		if start_key.len() < MAX_TIMESTAMP_LENGTH {
			return Err(decode_error("as-of start key must reserve timestamp bytes"));
		}
		let base_len = start_key.len() - MAX_TIMESTAMP_LENGTH;
		let base_start = &start_key[..base_len];

		// merged view: every base key present either live or in history
		let entries: Vec<(Vec<u8>, Bytes)> = {
			let buckets = self.buckets.read();
			let mut keys: BTreeMap<Vec<u8>, ()> = BTreeMap::new();
			if let Some(live) = buckets.get(bucket) {
				for (k, _) in live.range(base_start.to_vec()..) {
					if !matches_fixed_bits(k, base_start, fixed_bits) {
						break;
					}
					keys.insert(k.clone(), ());
				}
			}
			if let Some(hist) = buckets.get(hbucket) {
				for (k, _) in hist.range(base_start.to_vec()..) {
					if k.len() <= base_len {
						continue;
					}
					let base = &k[..base_len];
					if !matches_fixed_bits(base, base_start, fixed_bits) {
						if base > base_start {
							break;
						}
						continue;
					}
					if base >= base_start {
						if let Some((_, rest)) = decode_timestamp(&k[base_len..]) {
							if rest.is_empty() {
								keys.insert(base.to_vec(), ());
							}
						}
					}
				}
			}
			let mut merged = Vec::with_capacity(keys.len());
			for (key, _) in keys {
				let value = match buckets.get(hbucket).and_then(|h| Self::history_seek(h, &key, timestamp)) {
					Some((_, v)) => {
						if v.is_empty() {
							continue; // did not exist as of `timestamp`
						}
						v
					}
					None => match buckets.get(bucket).and_then(|b| b.get(&key).cloned()) {
						Some(v) => v,
						None => continue,
					},
				};
				merged.push((key, value));
			}
			merged
		};

		for (key, value) in entries {
			if !walker(&key, &value)? {
				break;
			}
		}
		Ok(())
	}

	fn id(&self) -> u64 {
		self.id
	}
}
