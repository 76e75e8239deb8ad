use std::fmt;
use std::str::FromStr;

use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

pub type Amount = u64;

pub const ADDRESS_LEN: usize = 20;

/// A 20-byte account identity, displayed as `0x`-prefixed hex.
///
/// Addresses are derived from ed25519 verifying keys (first 20 bytes of the
/// SHA-256 of the key bytes); contract addresses are derived from the
/// deployer address and a deployment nonce the same way.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    pub const ZERO: Address = Address([0u8; ADDRESS_LEN]);

    pub fn from_bytes(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_verifying_key(key: &ed25519_dalek::VerifyingKey) -> Self {
        let digest: [u8; 32] = Sha256::digest(key.as_bytes()).into();
        let mut out = [0u8; ADDRESS_LEN];
        out.copy_from_slice(&digest[..ADDRESS_LEN]);
        Self(out)
    }

    pub fn derive_contract(deployer: &Address, nonce: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"atm-contract-v1");
        hasher.update(deployer.as_bytes());
        hasher.update(nonce.to_le_bytes());
        let digest: [u8; 32] = hasher.finalize().into();
        let mut out = [0u8; ADDRESS_LEN];
        out.copy_from_slice(&digest[..ADDRESS_LEN]);
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(stripped).map_err(|_| LedgerError::InvalidAddress {
            address: s.to_string(),
        })?;
        if bytes.len() != ADDRESS_LEN {
            return Err(LedgerError::InvalidAddress {
                address: s.to_string(),
            });
        }
        let mut out = [0u8; ADDRESS_LEN];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        encoded.parse().map_err(D::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerError {
    #[error("invalid amount {amount}")]
    InvalidAmount { amount: Amount },
    #[error("insufficient funds: requested {requested}, balance {balance}")]
    InsufficientFunds { requested: Amount, balance: Amount },
    #[error("caller {caller} is not the owner")]
    Unauthorized { caller: Address },
    #[error("invalid address {address}")]
    InvalidAddress { address: String },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    Deposit {
        from: Address,
        amount: Amount,
    },
    Withdraw {
        to: Address,
        amount: Amount,
    },
    OwnershipTransferred {
        previous: Address,
        new: Address,
    },
}

/// The custodial account record: one balance, one owner.
///
/// Every mutation either applies completely or leaves the record untouched.
/// Deposits are open to any caller; withdrawals are limited only by the
/// current balance; reassigning the owner requires the current owner.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AtmLedger {
    balance: Amount,
    owner: Address,
}

impl AtmLedger {
    pub fn new(initial_balance: Amount, owner: Address) -> Self {
        Self {
            balance: initial_balance,
            owner,
        }
    }

    pub fn balance(&self) -> Amount {
        self.balance
    }

    pub fn owner(&self) -> Address {
        self.owner
    }

    pub fn deposit(&mut self, from: Address, amount: Amount) -> Result<LedgerEvent, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount { amount });
        }
        let next = self
            .balance
            .checked_add(amount)
            .ok_or(LedgerError::InvalidAmount { amount })?;
        self.balance = next;
        Ok(LedgerEvent::Deposit { from, amount })
    }

    pub fn withdraw(&mut self, to: Address, amount: Amount) -> Result<LedgerEvent, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount { amount });
        }
        if amount > self.balance {
            return Err(LedgerError::InsufficientFunds {
                requested: amount,
                balance: self.balance,
            });
        }
        self.balance -= amount;
        Ok(LedgerEvent::Withdraw { to, amount })
    }

    pub fn transfer_ownership(
        &mut self,
        caller: Address,
        new_owner: Address,
    ) -> Result<LedgerEvent, LedgerError> {
        if caller != self.owner {
            return Err(LedgerError::Unauthorized { caller });
        }
        if new_owner.is_zero() {
            return Err(LedgerError::InvalidAddress {
                address: new_owner.to_string(),
            });
        }
        let previous = self.owner;
        self.owner = new_owner;
        Ok(LedgerEvent::OwnershipTransferred {
            previous,
            new: new_owner,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(tag: u8) -> Address {
        Address::from_bytes([tag; ADDRESS_LEN])
    }

    #[test]
    fn deposits_accumulate() {
        let mut atm = AtmLedger::new(7, addr(1));
        for amount in [1u64, 2, 5, 10] {
            atm.deposit(addr(2), amount).unwrap();
        }
        assert_eq!(atm.balance(), 7 + 18);
    }

    #[test]
    fn withdraw_decreases_by_exact_amount() {
        let mut atm = AtmLedger::new(10, addr(1));
        atm.withdraw(addr(2), 4).unwrap();
        assert_eq!(atm.balance(), 6);
    }

    #[test]
    fn overdraw_fails_and_leaves_balance() {
        let mut atm = AtmLedger::new(5, addr(1));
        let err = atm.withdraw(addr(2), 10).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientFunds {
                requested: 10,
                balance: 5
            }
        ));
        assert_eq!(atm.balance(), 5);
    }

    #[test]
    fn zero_amounts_are_rejected() {
        let mut atm = AtmLedger::new(5, addr(1));
        assert!(matches!(
            atm.deposit(addr(2), 0),
            Err(LedgerError::InvalidAmount { amount: 0 })
        ));
        assert!(matches!(
            atm.withdraw(addr(2), 0),
            Err(LedgerError::InvalidAmount { amount: 0 })
        ));
        assert_eq!(atm.balance(), 5);
    }

    #[test]
    fn deposit_overflow_is_rejected() {
        let mut atm = AtmLedger::new(Amount::MAX - 1, addr(1));
        let err = atm.deposit(addr(2), 2).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount { amount: 2 }));
        assert_eq!(atm.balance(), Amount::MAX - 1);
    }

    #[test]
    fn only_owner_transfers_ownership() {
        let mut atm = AtmLedger::new(0, addr(1));
        let err = atm.transfer_ownership(addr(2), addr(3)).unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized { .. }));
        assert_eq!(atm.owner(), addr(1));
    }

    #[test]
    fn former_owner_loses_privileges() {
        let mut atm = AtmLedger::new(0, addr(1));
        atm.transfer_ownership(addr(1), addr(2)).unwrap();
        assert_eq!(atm.owner(), addr(2));
        let err = atm.transfer_ownership(addr(1), addr(3)).unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized { .. }));
        assert_eq!(atm.owner(), addr(2));
    }

    #[test]
    fn zero_address_is_not_a_valid_owner() {
        let mut atm = AtmLedger::new(0, addr(1));
        let err = atm.transfer_ownership(addr(1), Address::ZERO).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAddress { .. }));
        assert_eq!(atm.owner(), addr(1));
    }

    #[test]
    fn reads_are_idempotent() {
        let atm = AtmLedger::new(9, addr(1));
        assert_eq!(atm.balance(), atm.balance());
        assert_eq!(atm.owner(), atm.owner());
    }

    // Initial balance 0, owner A: deposit 5, failed overdraw, withdraw 5 by
    // another caller, owner handoff, then a stale transfer by the old owner.
    #[test]
    fn full_account_lifecycle() {
        let a = addr(0xa);
        let b = addr(0xb);
        let c = addr(0xc);
        let mut atm = AtmLedger::new(0, a);

        atm.deposit(a, 5).unwrap();
        assert_eq!(atm.balance(), 5);

        assert!(atm.withdraw(b, 10).is_err());
        assert_eq!(atm.balance(), 5);

        atm.withdraw(b, 5).unwrap();
        assert_eq!(atm.balance(), 0);

        atm.transfer_ownership(a, b).unwrap();
        assert_eq!(atm.owner(), b);

        let err = atm.transfer_ownership(a, c).unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized { .. }));
        assert_eq!(atm.owner(), b);
    }

    #[test]
    fn address_hex_round_trip() {
        let original = addr(0x5f);
        let parsed: Address = original.to_string().parse().unwrap();
        assert_eq!(parsed, original);

        assert!("0x1234".parse::<Address>().is_err());
        assert!("not-hex".parse::<Address>().is_err());
    }

    #[test]
    fn contract_address_depends_on_deployer_and_nonce() {
        let a = Address::derive_contract(&addr(1), 0);
        let b = Address::derive_contract(&addr(1), 1);
        let c = Address::derive_contract(&addr(2), 0);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert!(!a.is_zero());
    }
}
