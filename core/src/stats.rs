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

//! Size accounting of an extracted block witness.

use partial_trie::WitnessStats;

/// Per-block witness statistics: block, total size and section sizes.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockWitnessStats {
	block_number: u64,
	witness_size: u64,
	sections: WitnessStats,
}

impl BlockWitnessStats {
	pub fn new(block_number: u64, witness_size: u64, sections: WitnessStats) -> BlockWitnessStats {
		BlockWitnessStats { block_number, witness_size, sections }
	}

	pub fn block_number(&self) -> u64 {
		self.block_number
	}

	pub fn witness_size(&self) -> u64 {
		self.witness_size
	}

	pub fn sections(&self) -> &WitnessStats {
		&self.sections
	}
}
