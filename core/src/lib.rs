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

//! Block-oriented authenticated state engine.
//!
//! [`TrieDbState`] maintains the hashed account/storage ledger over a
//! bucket backend: writers buffer per-period mutations, `resolve` loads the
//! trie parts a block touches, `update` applies them and yields one Merkle
//! root per buffer, and the change-set log drives [`TrieDbState::unwind_to`]
//! back to an earlier block. With read resolution enabled the engine also
//! accumulates everything needed to emit a block witness.

mod buffer;
mod error;
mod registry;
mod state;
mod stats;
mod writer;

pub use buffer::Buffer;
pub use error::Error;
pub use registry::StateRegistry;
pub use state::{hash_data, StateReader, TrieDbState};
pub use stats::BlockWitnessStats;
pub use writer::{DbStateWriter, NoopWriter, StateWriter, TrieStateWriter};
