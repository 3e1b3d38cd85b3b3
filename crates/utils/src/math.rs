// This file is part of Quay.
//
// Quay is free software: you can redistribute it and/or modify it under the
// terms of the GNU Lesser General Public License as published by the Free Software
// Foundation, either version 3 of the License, or (at your option) any later version.
//
// Quay is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY;
// without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with Quay.
// If not, see https://www.gnu.org/licenses/.

//! Math utilities

use alloy_primitives::Uint;

/// Increases a uint by a percentage, rounding down
pub fn uint_increase_by_percent<const BITS: usize, const LIMBS: usize>(
    n: Uint<BITS, LIMBS>,
    percent: u32,
) -> Uint<BITS, LIMBS> {
    n.saturating_mul(Uint::from(100u64 + u64::from(percent))) / Uint::from(100)
}

#[cfg(test)]
mod tests {
    use alloy_primitives::U256;

    use super::*;

    #[test]
    fn test_increase_by_percent() {
        assert_eq!(uint_increase_by_percent(U256::from(100), 10), U256::from(110));
        assert_eq!(uint_increase_by_percent(U256::from(3), 10), U256::from(3));
        assert_eq!(uint_increase_by_percent(U256::MAX, 10), U256::MAX / U256::from(100));
    }
}
