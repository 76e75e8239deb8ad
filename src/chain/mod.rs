use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::NodeConfig;
use crate::ledger::{Address, Amount, AtmLedger, LedgerError, LedgerEvent};

/// Ordered operation signatures of the custodial account contract. The
/// interface id is a digest over this list; client and node must agree on it
/// exactly or every call fails before touching state.
pub const ATM_INTERFACE: &[&str] = &[
    "balance() -> amount",
    "owner() -> address",
    "deposit(amount)",
    "withdraw(amount)",
    "transfer_ownership(address)",
];

pub fn atm_interface_id() -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"atm-interface-v1");
    for op in ATM_INTERFACE {
        hasher.update(op.as_bytes());
        hasher.update([0u8]);
    }
    hasher.finalize().into()
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContractCall {
    Deposit { amount: Amount },
    Withdraw { amount: Amount },
    TransferOwnership { new_owner: Address },
}

/// A signed request against the deployed contract. The envelope carries the
/// caller's verifying key; the node recomputes the caller address from it and
/// checks the signature over [`CallRequest::digest`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallRequest {
    pub caller: Address,
    pub contract: Address,
    #[serde(with = "serde_hex32")]
    pub interface_id: [u8; 32],
    pub call: ContractCall,
    pub nonce: u64,
    #[serde(with = "serde_hex")]
    pub public_key: Vec<u8>,
    #[serde(with = "serde_hex")]
    pub signature: Vec<u8>,
}

impl CallRequest {
    pub fn new_signed(
        key: &SigningKey,
        contract: Address,
        interface_id: [u8; 32],
        call: ContractCall,
        nonce: u64,
    ) -> Self {
        let public_key = key.verifying_key();
        let caller = Address::from_verifying_key(&public_key);
        let mut request = Self {
            caller,
            contract,
            interface_id,
            call,
            nonce,
            public_key: public_key.as_bytes().to_vec(),
            signature: Vec::new(),
        };
        let signature = key.sign(&request.digest());
        request.signature = signature.to_bytes().to_vec();
        request
    }

    /// Deterministic encoding of the fields in a strict order.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"atm-call-v1");
        hasher.update(self.caller.as_bytes());
        hasher.update(self.contract.as_bytes());
        hasher.update(self.interface_id);
        match &self.call {
            ContractCall::Deposit { amount } => {
                hasher.update(b"deposit");
                hasher.update(amount.to_le_bytes());
            }
            ContractCall::Withdraw { amount } => {
                hasher.update(b"withdraw");
                hasher.update(amount.to_le_bytes());
            }
            ContractCall::TransferOwnership { new_owner } => {
                hasher.update(b"transfer_ownership");
                hasher.update(new_owner.as_bytes());
            }
        }
        hasher.update(self.nonce.to_le_bytes());
        hasher.finalize().into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// Ledger-side rejection, carried unmodified.
    #[error("{error}")]
    Ledger { error: LedgerError },
    /// The caller's native balance cannot fund the deposit value.
    #[error("insufficient value in {account}: requested {requested}, available {available}")]
    InsufficientValue {
        account: Address,
        requested: Amount,
        available: Amount,
    },
    /// A call with an identical digest was already applied.
    #[error("duplicate call")]
    DuplicateCall,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReceiptOutcome {
    Accepted { events: Vec<LedgerEvent> },
    Rejected { reason: RejectReason },
}

impl ReceiptOutcome {
    pub fn commitment(&self) -> Vec<u8> {
        match self {
            ReceiptOutcome::Accepted { events } => {
                let mut buf = Vec::new();
                buf.extend_from_slice(b"accepted");
                buf.extend_from_slice(&(events.len() as u64).to_le_bytes());
                for event in events {
                    buf.extend(serde_json::to_vec(event).expect("event encode"));
                }
                buf
            }
            ReceiptOutcome::Rejected { reason } => {
                let mut buf = Vec::new();
                buf.extend_from_slice(b"rejected");
                buf.extend(serde_json::to_vec(reason).expect("reason encode"));
                buf
            }
        }
    }
}

/// The durable confirmation for a submitted call.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReceiptCore {
    pub height: u64,
    #[serde(with = "serde_hex32")]
    pub call_digest: [u8; 32],
    pub caller: Address,
    pub contract: Address,
    pub outcome: ReceiptOutcome,
}

impl ReceiptCore {
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"atm-receipt-v1");
        hasher.update(self.height.to_le_bytes());
        hasher.update(self.call_digest);
        hasher.update(self.caller.as_bytes());
        hasher.update(self.contract.as_bytes());
        hasher.update(self.outcome.commitment().as_slice());
        hasher.finalize().into()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedReceipt {
    pub core: ReceiptCore,
    #[serde(with = "serde_hex")]
    pub signature: Vec<u8>,
}

impl SignedReceipt {
    pub fn verify(&self, node_key: &VerifyingKey) -> bool {
        let Ok(signature) = Signature::from_slice(&self.signature) else {
            return false;
        };
        node_key
            .verify_strict(&self.core.digest(), &signature)
            .is_ok()
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self.core.outcome, ReceiptOutcome::Accepted { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("no contract deployed at {address}")]
    UnknownContract { address: Address },
    #[error("interface description does not match contract {contract}")]
    InterfaceMismatch { contract: Address },
    #[error("signature check failed for caller {caller}")]
    BadSignature { caller: Address },
    #[error("node executor is not accepting submissions")]
    SubmissionFailed,
    #[error("no confirmation within {waited:?}")]
    ConfirmationFailure { waited: Duration },
    #[error("call rejected: {0}")]
    Rejected(RejectReason),
    #[error("chain state missing at {path}")]
    MissingState { path: PathBuf },
    #[error("malformed node key at {path}")]
    BadNodeKey { path: PathBuf },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ChainError>;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeployedAtm {
    pub address: Address,
    #[serde(with = "serde_hex32")]
    pub interface_id: [u8; 32],
    pub ledger: AtmLedger,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainState {
    pub height: u64,
    pub accounts: BTreeMap<Address, Amount>,
    pub contract: DeployedAtm,
    applied: BTreeSet<String>,
}

impl ChainState {
    fn genesis(deployer: Address, faucet_grant: Amount, initial_balance: Amount) -> Self {
        let contract_address = Address::derive_contract(&deployer, 0);
        let mut accounts = BTreeMap::new();
        accounts.insert(deployer, faucet_grant);
        // The contract's native holdings start in lockstep with the ledger
        // balance; deposits and withdrawals keep them there.
        accounts.insert(contract_address, initial_balance);
        Self {
            height: 0,
            accounts,
            contract: DeployedAtm {
                address: contract_address,
                interface_id: atm_interface_id(),
                ledger: AtmLedger::new(initial_balance, deployer),
            },
            applied: BTreeSet::new(),
        }
    }

    fn native_balance(&self, address: &Address) -> Amount {
        self.accounts.get(address).copied().unwrap_or(0)
    }

    fn credit(&mut self, address: Address, amount: Amount) {
        let entry = self.accounts.entry(address).or_insert(0);
        *entry = entry.saturating_add(amount);
    }

    fn debit(&mut self, address: &Address, amount: Amount) -> std::result::Result<(), RejectReason> {
        let available = self.native_balance(address);
        if available < amount {
            return Err(RejectReason::InsufficientValue {
                account: *address,
                requested: amount,
                available,
            });
        }
        self.accounts.insert(*address, available - amount);
        Ok(())
    }

    fn check_binding(&self, contract: &Address, interface_id: &[u8; 32]) -> Result<()> {
        if self.contract.address != *contract {
            return Err(ChainError::UnknownContract { address: *contract });
        }
        if self.contract.interface_id != *interface_id {
            return Err(ChainError::InterfaceMismatch {
                contract: *contract,
            });
        }
        Ok(())
    }

    fn execute(&mut self, request: &CallRequest) -> ReceiptOutcome {
        let caller = request.caller;
        let contract_address = self.contract.address;
        let result = match request.call {
            ContractCall::Deposit { amount } => {
                let available = self.native_balance(&caller);
                if available < amount {
                    Err(RejectReason::InsufficientValue {
                        account: caller,
                        requested: amount,
                        available,
                    })
                } else {
                    match self.contract.ledger.deposit(caller, amount) {
                        Ok(event) => {
                            self.debit(&caller, amount).expect("checked above");
                            self.credit(contract_address, amount);
                            Ok(vec![event])
                        }
                        Err(error) => Err(RejectReason::Ledger { error }),
                    }
                }
            }
            ContractCall::Withdraw { amount } => {
                match self.contract.ledger.withdraw(caller, amount) {
                    Ok(event) => {
                        // Holdings track the ledger balance, so the debit
                        // cannot come up short once the ledger accepted.
                        self.debit(&contract_address, amount)
                            .expect("contract holdings cover the ledger balance");
                        self.credit(caller, amount);
                        Ok(vec![event])
                    }
                    Err(error) => Err(RejectReason::Ledger { error }),
                }
            }
            ContractCall::TransferOwnership { new_owner } => {
                match self.contract.ledger.transfer_ownership(caller, new_owner) {
                    Ok(event) => Ok(vec![event]),
                    Err(error) => Err(RejectReason::Ledger { error }),
                }
            }
        };
        match result {
            Ok(events) => ReceiptOutcome::Accepted { events },
            Err(reason) => ReceiptOutcome::Rejected { reason },
        }
    }
}

struct ChainStore {
    path: PathBuf,
}

impl ChainStore {
    fn load(&self) -> Result<ChainState> {
        if !self.path.exists() {
            return Err(ChainError::MissingState {
                path: self.path.clone(),
            });
        }
        let bytes = fs::read(&self.path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn save(&self, state: &ChainState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        fs::write(&self.path, bytes)?;
        Ok(())
    }
}

struct Submission {
    request: CallRequest,
    reply: Sender<SignedReceipt>,
}

struct NodeShared {
    state: RwLock<ChainState>,
    store: ChainStore,
    key: SigningKey,
}

/// Handle to the single-node execution environment. Cheap to clone; all
/// clones feed the same executor thread, which serializes every mutating
/// call globally and persists state before releasing a confirmation.
#[derive(Clone)]
pub struct Node {
    shared: Arc<NodeShared>,
    queue: Sender<Submission>,
}

impl Node {
    /// Create a fresh chain under `config.state_dir` and deploy the ATM with
    /// `initial_balance`, owned by `deployer`.
    pub fn create(config: &NodeConfig, deployer: Address, initial_balance: Amount) -> Result<Self> {
        config.ensure_dirs()?;
        let key_path = config.node_key_path();
        let mut secret = [0u8; 32];
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(&mut secret);
        let key = SigningKey::from_bytes(&secret);
        fs::write(&key_path, hex::encode(secret))?;
        fs::write(
            config.node_pubkey_path(),
            hex::encode(key.verifying_key().as_bytes()),
        )?;

        let store = ChainStore {
            path: config.chain_path(),
        };
        let state = ChainState::genesis(deployer, config.faucet_grant, initial_balance);
        store.save(&state)?;
        tracing::info!(
            contract = %state.contract.address,
            owner = %deployer,
            initial_balance,
            "chain initialized"
        );
        Ok(Self::start(state, store, key))
    }

    /// Open an existing chain from `config.state_dir`.
    pub fn open(config: &NodeConfig) -> Result<Self> {
        let store = ChainStore {
            path: config.chain_path(),
        };
        let state = store.load()?;
        let key_path = config.node_key_path();
        let encoded = fs::read_to_string(&key_path).map_err(|_| ChainError::BadNodeKey {
            path: key_path.clone(),
        })?;
        let bytes = hex::decode(encoded.trim()).map_err(|_| ChainError::BadNodeKey {
            path: key_path.clone(),
        })?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ChainError::BadNodeKey { path: key_path })?;
        Ok(Self::start(state, store, SigningKey::from_bytes(&secret)))
    }

    fn start(state: ChainState, store: ChainStore, key: SigningKey) -> Self {
        let shared = Arc::new(NodeShared {
            state: RwLock::new(state),
            store,
            key,
        });
        let (queue, submissions) = mpsc::channel::<Submission>();
        let executor_shared = Arc::clone(&shared);
        thread::spawn(move || run_executor(executor_shared, submissions));
        Self { shared, queue }
    }

    pub fn contract_address(&self) -> Address {
        self.shared.state.read().contract.address
    }

    pub fn interface_id(&self) -> [u8; 32] {
        self.shared.state.read().contract.interface_id
    }

    pub fn height(&self) -> u64 {
        self.shared.state.read().height
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.shared.key.verifying_key()
    }

    pub fn native_balance(&self, address: &Address) -> Amount {
        self.shared.state.read().native_balance(address)
    }

    pub fn atm_balance(&self, contract: &Address, interface_id: &[u8; 32]) -> Result<Amount> {
        let state = self.shared.state.read();
        state.check_binding(contract, interface_id)?;
        Ok(state.contract.ledger.balance())
    }

    pub fn atm_owner(&self, contract: &Address, interface_id: &[u8; 32]) -> Result<Address> {
        let state = self.shared.state.read();
        state.check_binding(contract, interface_id)?;
        Ok(state.contract.ledger.owner())
    }

    /// Phase one of a mutating call: validate the binding and signature, then
    /// hand the request to the executor. The returned [`PendingCall`] is
    /// phase two — waiting for the durable confirmation.
    pub fn submit(&self, request: CallRequest) -> Result<PendingCall> {
        {
            let state = self.shared.state.read();
            state.check_binding(&request.contract, &request.interface_id)?;
        }
        verify_request(&request)?;
        let (reply, confirmations) = mpsc::channel();
        self.queue
            .send(Submission { request, reply })
            .map_err(|_| ChainError::SubmissionFailed)?;
        Ok(PendingCall { rx: confirmations })
    }
}

fn verify_request(request: &CallRequest) -> Result<()> {
    let bad = || ChainError::BadSignature {
        caller: request.caller,
    };
    let key_bytes: [u8; 32] = request.public_key.as_slice().try_into().map_err(|_| bad())?;
    let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| bad())?;
    if Address::from_verifying_key(&key) != request.caller {
        return Err(bad());
    }
    let signature = Signature::from_slice(&request.signature).map_err(|_| bad())?;
    key.verify_strict(&request.digest(), &signature)
        .map_err(|_| bad())
}

fn run_executor(shared: Arc<NodeShared>, submissions: Receiver<Submission>) {
    while let Ok(Submission { request, reply }) = submissions.recv() {
        let receipt = apply(&shared, &request);
        // The submitter may have given up waiting; that is its problem.
        let _ = reply.send(receipt);
    }
}

fn apply(shared: &NodeShared, request: &CallRequest) -> SignedReceipt {
    let call_digest = request.digest();
    let digest_hex = hex::encode(call_digest);
    let mut state = shared.state.write();

    let outcome = if state.applied.contains(&digest_hex) {
        ReceiptOutcome::Rejected {
            reason: RejectReason::DuplicateCall,
        }
    } else {
        state.execute(request)
    };

    if let ReceiptOutcome::Accepted { ref events } = outcome {
        state.height += 1;
        state.applied.insert(digest_hex);
        // The confirmation must not be released before the state is durable.
        shared.store.save(&state).expect("persist chain state");
        tracing::info!(
            height = state.height,
            caller = %request.caller,
            events = events.len(),
            "call applied"
        );
    } else {
        tracing::warn!(caller = %request.caller, "call rejected");
    }

    let core = ReceiptCore {
        height: state.height,
        call_digest,
        caller: request.caller,
        contract: request.contract,
        outcome,
    };
    let signature = shared.key.sign(&core.digest());
    SignedReceipt {
        core,
        signature: signature.to_bytes().to_vec(),
    }
}

/// Phase two of a submitted call: block until the executor releases the
/// signed receipt, or give up after `timeout`.
pub struct PendingCall {
    rx: Receiver<SignedReceipt>,
}

impl PendingCall {
    pub fn wait(self, timeout: Duration) -> Result<SignedReceipt> {
        match self.rx.recv_timeout(timeout) {
            Ok(receipt) => Ok(receipt),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                Err(ChainError::ConfirmationFailure { waited: timeout })
            }
        }
    }
}

/// A client-side binding to the deployed contract: fixed address plus fixed
/// interface description.
#[derive(Clone)]
pub struct AtmHandle {
    node: Node,
    contract: Address,
    interface_id: [u8; 32],
}

impl AtmHandle {
    pub fn bind(node: Node, contract: Address, interface_id: [u8; 32]) -> Self {
        Self {
            node,
            contract,
            interface_id,
        }
    }

    pub fn contract(&self) -> Address {
        self.contract
    }

    pub fn interface_id(&self) -> [u8; 32] {
        self.interface_id
    }

    pub fn balance(&self) -> Result<Amount> {
        self.node.atm_balance(&self.contract, &self.interface_id)
    }

    pub fn owner(&self) -> Result<Address> {
        self.node.atm_owner(&self.contract, &self.interface_id)
    }

    pub fn submit(&self, request: CallRequest) -> Result<PendingCall> {
        self.node.submit(request)
    }
}

pub(crate) mod serde_hex {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(&encoded).map_err(D::Error::custom)
    }
}

pub(crate) mod serde_hex32 {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| D::Error::custom("expected 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::rngs::OsRng;
    use tempfile::tempdir;

    fn node_config(dir: &std::path::Path) -> NodeConfig {
        NodeConfig::new(dir.to_path_buf())
    }

    fn keypair() -> (SigningKey, Address) {
        let key = SigningKey::generate(&mut OsRng);
        let address = Address::from_verifying_key(&key.verifying_key());
        (key, address)
    }

    fn signed(node: &Node, key: &SigningKey, call: ContractCall, nonce: u64) -> CallRequest {
        CallRequest::new_signed(key, node.contract_address(), node.interface_id(), call, nonce)
    }

    fn wait(node: &Node, request: CallRequest) -> SignedReceipt {
        node.submit(request)
            .unwrap()
            .wait(Duration::from_secs(5))
            .unwrap()
    }

    #[test]
    fn genesis_seeds_contract_and_deployer() {
        let dir = tempdir().unwrap();
        let (_, deployer) = keypair();
        let node = Node::create(&node_config(dir.path()), deployer, 25).unwrap();

        assert_eq!(node.height(), 0);
        assert_eq!(node.native_balance(&deployer), 1_000);
        let contract = node.contract_address();
        assert_eq!(node.native_balance(&contract), 25);
        assert_eq!(node.atm_balance(&contract, &node.interface_id()).unwrap(), 25);
        assert_eq!(node.atm_owner(&contract, &node.interface_id()).unwrap(), deployer);
    }

    #[test]
    fn deposit_moves_native_value_into_the_contract() {
        let dir = tempdir().unwrap();
        let (key, deployer) = keypair();
        let node = Node::create(&node_config(dir.path()), deployer, 0).unwrap();
        let contract = node.contract_address();

        let receipt = wait(&node, signed(&node, &key, ContractCall::Deposit { amount: 5 }, 1));
        assert!(receipt.is_accepted());
        assert!(receipt.verify(&node.verifying_key()));
        assert_eq!(receipt.core.height, 1);

        assert_eq!(node.atm_balance(&contract, &node.interface_id()).unwrap(), 5);
        assert_eq!(node.native_balance(&deployer), 995);
        assert_eq!(node.native_balance(&contract), 5);
    }

    #[test]
    fn withdraw_moves_native_value_back() {
        let dir = tempdir().unwrap();
        let (key, deployer) = keypair();
        let node = Node::create(&node_config(dir.path()), deployer, 10).unwrap();
        let contract = node.contract_address();

        let receipt = wait(&node, signed(&node, &key, ContractCall::Withdraw { amount: 4 }, 1));
        assert!(receipt.is_accepted());
        assert_eq!(node.atm_balance(&contract, &node.interface_id()).unwrap(), 6);
        assert_eq!(node.native_balance(&deployer), 1_004);
        assert_eq!(node.native_balance(&contract), 6);
    }

    #[test]
    fn unfunded_deposit_is_rejected_with_insufficient_value() {
        let dir = tempdir().unwrap();
        let (_, deployer) = keypair();
        let node = Node::create(&node_config(dir.path()), deployer, 0).unwrap();

        let (stranger_key, stranger) = keypair();
        let receipt = wait(
            &node,
            signed(&node, &stranger_key, ContractCall::Deposit { amount: 5 }, 1),
        );
        match &receipt.core.outcome {
            ReceiptOutcome::Rejected {
                reason: RejectReason::InsufficientValue { account, .. },
            } => assert_eq!(*account, stranger),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(node.height(), 0);
    }

    #[test]
    fn ledger_rejections_are_carried_unmodified() {
        let dir = tempdir().unwrap();
        let (key, deployer) = keypair();
        let node = Node::create(&node_config(dir.path()), deployer, 3).unwrap();

        let receipt = wait(&node, signed(&node, &key, ContractCall::Withdraw { amount: 9 }, 1));
        match &receipt.core.outcome {
            ReceiptOutcome::Rejected {
                reason: RejectReason::Ledger { error },
            } => assert_eq!(
                *error,
                LedgerError::InsufficientFunds {
                    requested: 9,
                    balance: 3
                }
            ),
            other => panic!("unexpected outcome {other:?}"),
        }

        let receipt = wait(&node, signed(&node, &key, ContractCall::Deposit { amount: 0 }, 2));
        match &receipt.core.outcome {
            ReceiptOutcome::Rejected {
                reason: RejectReason::Ledger { error },
            } => assert_eq!(*error, LedgerError::InvalidAmount { amount: 0 }),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn non_owner_transfer_is_rejected_and_owner_kept() {
        let dir = tempdir().unwrap();
        let (_, deployer) = keypair();
        let node = Node::create(&node_config(dir.path()), deployer, 0).unwrap();
        let contract = node.contract_address();

        let (stranger_key, _) = keypair();
        let (_, target) = keypair();
        let receipt = wait(
            &node,
            signed(
                &node,
                &stranger_key,
                ContractCall::TransferOwnership { new_owner: target },
                1,
            ),
        );
        match &receipt.core.outcome {
            ReceiptOutcome::Rejected {
                reason: RejectReason::Ledger { error },
            } => assert!(matches!(error, LedgerError::Unauthorized { .. })),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(node.atm_owner(&contract, &node.interface_id()).unwrap(), deployer);
    }

    #[test]
    fn binding_must_match_exactly() {
        let dir = tempdir().unwrap();
        let (key, deployer) = keypair();
        let node = Node::create(&node_config(dir.path()), deployer, 0).unwrap();

        let wrong_contract = Address::derive_contract(&deployer, 7);
        let request = CallRequest::new_signed(
            &key,
            wrong_contract,
            node.interface_id(),
            ContractCall::Deposit { amount: 1 },
            1,
        );
        assert!(matches!(
            node.submit(request),
            Err(ChainError::UnknownContract { .. })
        ));

        let request = CallRequest::new_signed(
            &key,
            node.contract_address(),
            [9u8; 32],
            ContractCall::Deposit { amount: 1 },
            1,
        );
        assert!(matches!(
            node.submit(request),
            Err(ChainError::InterfaceMismatch { .. })
        ));
    }

    #[test]
    fn tampered_signatures_are_refused() {
        let dir = tempdir().unwrap();
        let (key, deployer) = keypair();
        let node = Node::create(&node_config(dir.path()), deployer, 0).unwrap();

        let mut request = signed(&node, &key, ContractCall::Deposit { amount: 5 }, 1);
        request.call = ContractCall::Deposit { amount: 500 };
        assert!(matches!(
            node.submit(request),
            Err(ChainError::BadSignature { .. })
        ));
    }

    #[test]
    fn replayed_calls_are_rejected_as_duplicates() {
        let dir = tempdir().unwrap();
        let (key, deployer) = keypair();
        let node = Node::create(&node_config(dir.path()), deployer, 0).unwrap();
        let contract = node.contract_address();

        let request = signed(&node, &key, ContractCall::Deposit { amount: 2 }, 1);
        assert!(wait(&node, request.clone()).is_accepted());
        let replay = wait(&node, request);
        match &replay.core.outcome {
            ReceiptOutcome::Rejected { reason } => {
                assert_eq!(*reason, RejectReason::DuplicateCall)
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(node.atm_balance(&contract, &node.interface_id()).unwrap(), 2);
    }

    #[test]
    fn receipts_fail_verification_when_tampered() {
        let dir = tempdir().unwrap();
        let (key, deployer) = keypair();
        let node = Node::create(&node_config(dir.path()), deployer, 0).unwrap();

        let mut receipt = wait(&node, signed(&node, &key, ContractCall::Deposit { amount: 5 }, 1));
        assert!(receipt.verify(&node.verifying_key()));
        receipt.core.caller = Address::from_bytes([7u8; 20]);
        assert!(!receipt.verify(&node.verifying_key()));
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        let config = node_config(dir.path());
        let (key, deployer) = keypair();
        {
            let node = Node::create(&config, deployer, 0).unwrap();
            assert!(wait(&node, signed(&node, &key, ContractCall::Deposit { amount: 8 }, 1))
                .is_accepted());
        }
        let node = Node::open(&config).unwrap();
        let contract = node.contract_address();
        assert_eq!(node.height(), 1);
        assert_eq!(node.atm_balance(&contract, &node.interface_id()).unwrap(), 8);
        assert_eq!(node.native_balance(&deployer), 992);
    }

    #[test]
    fn waiting_on_a_dead_executor_is_a_confirmation_failure() {
        let (_, rx) = mpsc::channel::<SignedReceipt>();
        let pending = PendingCall { rx };
        let err = pending.wait(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, ChainError::ConfirmationFailure { .. }));
    }

    #[test]
    fn interface_id_is_stable_and_order_sensitive() {
        assert_eq!(atm_interface_id(), atm_interface_id());

        let mut hasher = Sha256::new();
        hasher.update(b"atm-interface-v1");
        for op in ATM_INTERFACE.iter().rev() {
            hasher.update(op.as_bytes());
            hasher.update([0u8]);
        }
        let reversed: [u8; 32] = hasher.finalize().into();
        assert_ne!(atm_interface_id(), reversed);
    }
}
