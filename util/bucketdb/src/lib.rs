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

//! Bucket-oriented key/value backend contract with historical views,
//! per-block change sets and rewind support.
//!
//! Buckets hold plain byte keys and values. Every mutation of a tracked
//! bucket can additionally be journalled through [`Database::put_s`], which
//! records the *previous* value of the key both in the matching history
//! bucket (suffixed by a sort-correct timestamp) and in the block's change
//! set. Those two records drive the as-of read views and
//! [`Database::rewind_data`].

pub mod changeset;
pub mod dbutils;
mod memorydb;
mod walk;

use std::io;

use parity_bytes::Bytes;

pub use changeset::ChangeSet;
pub use memorydb::MemoryDatabase;
pub use walk::modified_accounts;

/// Walker over `(key, value)` pairs; returning `Ok(false)` stops the walk.
pub type Walker<'a> = dyn FnMut(&[u8], &[u8]) -> io::Result<bool> + 'a;

/// Walker for multi-range walks; the first argument is the range index.
pub type MultiWalker<'a> = dyn FnMut(usize, &[u8], &[u8]) -> io::Result<()> + 'a;

/// Walker over `(bucket, key, previous_value)` rewind tuples.
pub type RewindWalker<'a> = dyn FnMut(&[u8], &[u8], &[u8]) -> io::Result<()> + 'a;

/// Minimal backend surface the state engine consumes. All methods are safe
/// for cooperative concurrent use; genuine I/O failures surface as
/// `io::Error`, absent keys as `Ok(None)`.
pub trait Database: Send + Sync {
	/// Value under `key`, if present.
	fn get(&self, bucket: &[u8], key: &[u8]) -> io::Result<Option<Bytes>>;

	/// Whether `key` exists.
	fn has(&self, bucket: &[u8], key: &[u8]) -> io::Result<bool> {
		Ok(self.get(bucket, key)?.is_some())
	}

	/// Insert or update a single entry.
	fn put(&self, bucket: &[u8], key: &[u8], value: &[u8]) -> io::Result<()>;

	/// Record a historical previous value of `key` under the block number
	/// `timestamp`: appended to the block's change set for `hbucket` and,
	/// unless `changeset_only`, written to `hbucket` itself.
	fn put_s(&self, hbucket: &[u8], key: &[u8], value: &[u8], timestamp: u64, changeset_only: bool) -> io::Result<()>;

	/// Insert or update several entries at once.
	fn multi_put(&self, tuples: &[(&[u8], &[u8], &[u8])]) -> io::Result<()> {
		for (bucket, key, value) in tuples {
			self.put(bucket, key, value)?;
		}
		Ok(())
	}

	/// Remove a single entry.
	fn delete(&self, bucket: &[u8], key: &[u8]) -> io::Result<()>;

	/// Drop the change set of `timestamp` and every history entry it indexes.
	fn delete_timestamp(&self, timestamp: u64) -> io::Result<()>;

	/// Value of `key` at the start of block `timestamp`: the earliest
	/// history entry with a suffix `>= timestamp` wins, otherwise the live
	/// bucket. An empty history value means the key did not exist then.
	fn get_as_of(&self, bucket: &[u8], hbucket: &[u8], key: &[u8], timestamp: u64) -> io::Result<Option<Bytes>>;

	/// Enumerate entries with keys `>= start_key` whose top `fixed_bits`
	/// bits equal those of `start_key`, in ascending key order.
	fn walk(&self, bucket: &[u8], start_key: &[u8], fixed_bits: u32, walker: &mut Walker) -> io::Result<()>;

	/// Several `walk` ranges folded into one pass.
	fn multi_walk(
		&self,
		bucket: &[u8],
		start_keys: &[Vec<u8>],
		fixed_bits: &[u32],
		walker: &mut MultiWalker,
	) -> io::Result<()> {
		for (index, (start_key, bits)) in start_keys.iter().zip(fixed_bits.iter()).enumerate() {
			self.walk(bucket, start_key, *bits, &mut |key, value| {
				walker(index, key, value)?;
				Ok(true)
			})?;
		}
		Ok(())
	}

	/// `walk` against the historical view at `timestamp`. The start key
	/// reserves `dbutils::MAX_TIMESTAMP_LENGTH` trailing bytes on top of the
	/// bucket's key width, so the base key length is
	/// `start_key.len() - MAX_TIMESTAMP_LENGTH`.
	fn walk_as_of(
		&self,
		bucket: &[u8],
		hbucket: &[u8],
		start_key: &[u8],
		fixed_bits: u32,
		timestamp: u64,
		walker: &mut Walker,
	) -> io::Result<()>;

	/// Several `walk_as_of` ranges folded into one pass.
	fn multi_walk_as_of(
		&self,
		bucket: &[u8],
		hbucket: &[u8],
		start_keys: &[Vec<u8>],
		fixed_bits: &[u32],
		timestamp: u64,
		walker: &mut MultiWalker,
	) -> io::Result<()> {
		for (index, (start_key, bits)) in start_keys.iter().zip(fixed_bits.iter()).enumerate() {
			self.walk_as_of(bucket, hbucket, start_key, *bits, timestamp, &mut |key, value| {
				walker(index, key, value)?;
				Ok(true)
			})?;
		}
		Ok(())
	}

	/// Yield, for every key modified in `(timestamp_dst, timestamp_src]`,
	/// the value it held at `timestamp_dst`. The change-set walk runs in
	/// ascending block order and the first write per (bucket, key) wins.
	fn rewind_data(&self, timestamp_src: u64, timestamp_dst: u64, walker: &mut RewindWalker) -> io::Result<()> {
		walk::rewind_data(self, timestamp_src, timestamp_dst, walker)
	}

	/// Identity of the backend, for the process-wide engine registry.
	fn id(&self) -> u64;

	/// Preferred batch payload size for collaborators that batch writes.
	fn ideal_batch_size(&self) -> usize {
		100 * 1024
	}
}

pub(crate) fn decode_error(what: &'static str) -> io::Error {
	io::Error::new(io::ErrorKind::InvalidData, what)
}
