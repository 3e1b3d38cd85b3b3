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

use std::fmt;

use alloy_primitives::Address;
use parse_display::Display;
use strum::EnumIter;

/// Role an address plays in a user operation
#[derive(Display, Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, EnumIter)]
#[display(style = "camelCase")]
pub enum EntityType {
    /// The sender account
    Account,
    /// Paymaster named in `paymasterAndData`
    Paymaster,
    /// Signature aggregator attributed from the signature
    Aggregator,
    /// Factory named in `initCode`
    Factory,
}

/// An address in the role it plays, the unit reputation is tracked against
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Entity {
    /// Role
    pub kind: EntityType,
    /// Address
    pub address: Address,
}

impl Entity {
    /// An entity of `kind` at `address`
    pub fn new(kind: EntityType, address: Address) -> Self {
        Self { kind, address }
    }

    /// The sender account
    pub fn account(address: Address) -> Self {
        Self::new(EntityType::Account, address)
    }

    /// A paymaster
    pub fn paymaster(address: Address) -> Self {
        Self::new(EntityType::Paymaster, address)
    }

    /// An aggregator
    pub fn aggregator(address: Address) -> Self {
        Self::new(EntityType::Aggregator, address)
    }

    /// A factory
    pub fn factory(address: Address) -> Self {
        Self::new(EntityType::Factory, address)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.address.to_checksum(None))
    }
}
