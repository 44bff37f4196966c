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

//! Change-set driven walks: rewind tuples and modified-account queries.

use std::collections::BTreeMap;
use std::io;

use ethereum_types::Address;
use log::trace;

use crate::changeset::ChangeSet;
use crate::dbutils;
use crate::{decode_error, Database, RewindWalker};

/// Collect the value every modified key held at `timestamp_dst` by folding
/// the change sets of `(timestamp_dst, timestamp_src]` in ascending block
/// order; the first write per (bucket, key) is the pre-image at the target.
pub(crate) fn rewind_data<D: Database + ?Sized>(
	db: &D,
	timestamp_src: u64,
	timestamp_dst: u64,
	walker: &mut RewindWalker,
) -> io::Result<()> {
	let mut pre_images: BTreeMap<Vec<u8>, BTreeMap<Vec<u8>, Vec<u8>>> = BTreeMap::new();
	let start = dbutils::encode_timestamp(timestamp_dst + 1);
	db.walk(dbutils::CHANGE_SET_BUCKET, &start, 0, &mut |key, value| {
		let (timestamp, bucket) =
			dbutils::decode_timestamp(key).ok_or_else(|| decode_error("malformed change set key"))?;
		if timestamp > timestamp_src {
			return Ok(false);
		}
		let changes = ChangeSet::decode(value).map_err(|_| decode_error("malformed change set payload"))?;
		if !changes.is_empty() {
			let entries = pre_images.entry(bucket.to_vec()).or_insert_with(BTreeMap::new);
			changes.walk::<io::Error, _>(|k, v| {
				entries.entry(k.to_vec()).or_insert_with(|| v.to_vec());
				Ok(())
			})?;
		}
		Ok(true)
	})?;

	let keys: usize = pre_images.values().map(|entries| entries.len()).sum();
	trace!(target: "bucketdb", "rewinding {} key(s) across {} bucket(s) from block {} to {}",
		keys, pre_images.len(), timestamp_src, timestamp_dst);
	for (bucket, entries) in &pre_images {
		for (key, value) in entries {
			walker(bucket, key, value)?;
		}
	}
	Ok(())
}

/// Addresses of all accounts changed in blocks `[start, end]`, resolved from
/// hashed keys through the preimage bucket.
pub fn modified_accounts<D: Database + ?Sized>(db: &D, start: u64, end: u64) -> io::Result<Vec<Address>> {
	let mut keys = Vec::new();
	let start_key = dbutils::encode_timestamp(start);
	db.walk(dbutils::CHANGE_SET_BUCKET, &start_key, 0, &mut |key, value| {
		let (timestamp, bucket) =
			dbutils::decode_timestamp(key).ok_or_else(|| decode_error("malformed change set key"))?;
		if timestamp > end {
			return Ok(false);
		}
		if bucket != dbutils::ACCOUNTS_HISTORY_BUCKET {
			return Ok(true);
		}
		let changes = ChangeSet::decode(value).map_err(|_| decode_error("malformed change set payload"))?;
		changes.walk::<io::Error, _>(|k, _| {
			keys.push(k.to_vec());
			Ok(())
		})?;
		Ok(true)
	})?;

	trace!(target: "bucketdb", "{} account change(s) in blocks [{}, {}]", keys.len(), start, end);
	let mut accounts = Vec::with_capacity(keys.len());
	for key in keys {
		let preimage = db
			.get(dbutils::PREIMAGE_BUCKET, &key)?
			.ok_or_else(|| decode_error("no preimage for modified account"))?;
		if preimage.len() != 20 {
			return Err(decode_error("account preimage is not an address"));
		}
		accounts.push(Address::from_slice(&preimage));
	}
	Ok(accounts)
}
