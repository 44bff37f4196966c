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

//! State engine error kinds.

use std::fmt;
use std::io;

use ethereum_types::H256;
use partial_trie::WitnessError;
use rlp::DecoderError;

/// Failure of a state engine operation. Read misses are not errors; they
/// surface as absent values.
#[derive(Debug)]
pub enum Error {
	/// Backend I/O failed; the current block computation is aborted.
	Backend(io::Error),
	/// Stored bytes do not decode; indicates corruption.
	Decode(DecoderError),
	/// A recomputed storage root disagrees with the account's stored root
	/// during a full-history rewind; the block is rejected.
	StorageRootMismatch {
		address_hash: H256,
		expected: H256,
		got: H256,
	},
	/// Witness serialization or replay failed.
	Witness(WitnessError),
	/// The ambient cancellation handle was triggered.
	Interrupted,
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Error::Backend(e) => write!(f, "backend failure: {}", e),
			Error::Decode(e) => write!(f, "undecodable state data: {}", e),
			Error::StorageRootMismatch { address_hash, expected, got } => write!(
				f,
				"mismatched storage root for {:?}: expected {:?}, got {:?}",
				address_hash, expected, got
			),
			Error::Witness(e) => write!(f, "witness failure: {}", e),
			Error::Interrupted => write!(f, "interrupted"),
		}
	}
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
	fn from(e: io::Error) -> Self {
		Error::Backend(e)
	}
}

impl From<DecoderError> for Error {
	fn from(e: DecoderError) -> Self {
		Error::Decode(e)
	}
}

impl From<WitnessError> for Error {
	fn from(e: WitnessError) -> Self {
		Error::Witness(e)
	}
}
