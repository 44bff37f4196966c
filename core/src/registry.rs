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

//! Process-wide index of live state engines, keyed by backend identity.

use std::collections::HashMap;
use std::sync::Arc;

use ethereum_types::H256;
use parking_lot::{Mutex, RwLock};

use bucketdb::Database;

use crate::state::TrieDbState;

/// Owning registry of state engines, one per backend id. Replacing a stale
/// entry is best effort: a racing caller may briefly build a duplicate
/// engine, which is harmless.
#[derive(Default)]
pub struct StateRegistry {
	engines: RwLock<HashMap<u64, Arc<Mutex<TrieDbState>>>>,
}

impl StateRegistry {
	pub fn new() -> StateRegistry {
		StateRegistry::default()
	}

	/// The cached engine for this backend when it still matches both the
	/// block number and the trie root; otherwise a freshly built one, which
	/// replaces the cache entry.
	pub fn get_or_create(&self, root: H256, db: Arc<dyn Database>, block_nr: u64) -> Arc<Mutex<TrieDbState>> {
		let id = db.id();
		if let Some(existing) = self.engines.read().get(&id).cloned() {
			let matches = {
				let engine = existing.lock();
				engine.get_block_nr() == block_nr && engine.last_root() == root
			};
			if matches {
				return existing;
			}
		}
		let fresh = Arc::new(Mutex::new(TrieDbState::new(root, db, block_nr)));
		self.engines.write().insert(id, fresh.clone());
		fresh
	}

	pub fn len(&self) -> usize {
		self.engines.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
