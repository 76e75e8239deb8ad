use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::chain::{CallRequest, ContractCall, Node};
use crate::ledger::{Address, Amount};

#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("no wallet provider detected")]
    WalletUnavailable,
    #[error("user rejected the request")]
    UserRejected,
    #[error("account {address} is not held by this wallet")]
    UnknownAccount { address: Address },
    #[error("malformed key file {path}")]
    BadKey { path: PathBuf },
    #[error("keystore error: {0}")]
    Keystore(#[from] io::Error),
}

/// Capability interface of a wallet provider: list already-exposed accounts,
/// request access (which may prompt and be declined), and obtain a signer
/// for one held identity. The session controller depends only on this trait.
pub trait WalletProvider {
    fn accounts(&self) -> Vec<Address>;
    fn request_access(&mut self) -> Result<Vec<Address>, WalletError>;
    fn signer(&self, address: &Address) -> Result<WalletSigner, WalletError>;
}

/// A signing capability for one identity: signs call envelopes and reads the
/// identity's own native balance from the chain.
pub struct WalletSigner {
    key: SigningKey,
    address: Address,
    node: Node,
}

impl WalletSigner {
    pub fn new(key: SigningKey, node: Node) -> Self {
        let address = Address::from_verifying_key(&key.verifying_key());
        Self { key, address, node }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn native_balance(&self) -> Amount {
        self.node.native_balance(&self.address)
    }

    pub fn sign_call(
        &self,
        contract: Address,
        interface_id: [u8; 32],
        call: ContractCall,
    ) -> CallRequest {
        let nonce = OsRng.next_u64();
        CallRequest::new_signed(&self.key, contract, interface_id, call, nonce)
    }
}

/// Directory-of-hex-keys provider. One `<address>.sk.hex` file per identity;
/// access requests are always approved. Tests exercise the declining path
/// through their own [`WalletProvider`] implementations.
pub struct KeystoreWallet {
    dir: PathBuf,
    node: Node,
    preferred: Option<Address>,
    exposed: Vec<Address>,
}

impl KeystoreWallet {
    pub fn new(dir: PathBuf, node: Node) -> Self {
        Self {
            dir,
            node,
            preferred: None,
            exposed: Vec::new(),
        }
    }

    /// Put one held identity first in the access list (the "active account").
    pub fn with_preferred(mut self, address: Address) -> Self {
        self.preferred = Some(address);
        self
    }

    /// Generate a fresh identity into `dir` and return its address.
    pub fn keygen(dir: &Path) -> Result<Address, WalletError> {
        fs::create_dir_all(dir)?;
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        let key = SigningKey::from_bytes(&secret);
        let public = key.verifying_key();
        let address = Address::from_verifying_key(&public);
        let stem = hex::encode(address.as_bytes());
        fs::write(dir.join(format!("{stem}.sk.hex")), hex::encode(secret))?;
        fs::write(
            dir.join(format!("{stem}.pk.hex")),
            hex::encode(public.as_bytes()),
        )?;
        Ok(address)
    }

    fn scan(&self) -> Result<Vec<(Address, PathBuf)>, WalletError> {
        held_identities(&self.dir)
    }
}

/// List the identities held in a keystore directory, sorted by address.
pub fn held_identities(dir: &Path) -> Result<Vec<(Address, PathBuf)>, WalletError> {
    let mut held = Vec::new();
    if !dir.exists() {
        return Ok(held);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with(".sk.hex") {
            continue;
        }
        let key = load_signing_key(&path)?;
        held.push((Address::from_verifying_key(&key.verifying_key()), path));
    }
    held.sort_by_key(|(address, _)| *address);
    Ok(held)
}

impl WalletProvider for KeystoreWallet {
    fn accounts(&self) -> Vec<Address> {
        self.exposed.clone()
    }

    fn request_access(&mut self) -> Result<Vec<Address>, WalletError> {
        let mut addresses: Vec<Address> = self.scan()?.into_iter().map(|(a, _)| a).collect();
        if let Some(preferred) = self.preferred {
            if let Some(pos) = addresses.iter().position(|a| *a == preferred) {
                addresses.swap(0, pos);
            }
        }
        self.exposed = addresses.clone();
        Ok(addresses)
    }

    fn signer(&self, address: &Address) -> Result<WalletSigner, WalletError> {
        let held = self.scan()?;
        let (_, path) = held
            .into_iter()
            .find(|(held_address, _)| held_address == address)
            .ok_or(WalletError::UnknownAccount { address: *address })?;
        let key = load_signing_key(&path)?;
        Ok(WalletSigner::new(key, self.node.clone()))
    }
}

fn load_signing_key(path: &Path) -> Result<SigningKey, WalletError> {
    let encoded = fs::read_to_string(path)?;
    let bytes = hex::decode(encoded.trim()).map_err(|_| WalletError::BadKey {
        path: path.to_path_buf(),
    })?;
    let secret: [u8; 32] = bytes.try_into().map_err(|_| WalletError::BadKey {
        path: path.to_path_buf(),
    })?;
    Ok(SigningKey::from_bytes(&secret))
}

/// Parse a `pk.hex` style verifying key file.
pub fn load_verifying_key(path: &Path) -> Result<VerifyingKey, WalletError> {
    let encoded = fs::read_to_string(path)?;
    let bytes = hex::decode(encoded.trim()).map_err(|_| WalletError::BadKey {
        path: path.to_path_buf(),
    })?;
    let public: [u8; 32] = bytes.try_into().map_err(|_| WalletError::BadKey {
        path: path.to_path_buf(),
    })?;
    VerifyingKey::from_bytes(&public).map_err(|_| WalletError::BadKey {
        path: path.to_path_buf(),
    })
}
