use std::time::{Duration, Instant};

use crate::chain::{
    AtmHandle, ChainError, ContractCall, Node, ReceiptOutcome, SignedReceipt,
};
use crate::config::OWNER_ERROR_TTL;
use crate::ledger::{Address, Amount};
use crate::wallet::{WalletError, WalletProvider, WalletSigner};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is not connected")]
    NotConnected,
    #[error("another request is already in flight")]
    RequestInFlight,
    #[error(transparent)]
    Wallet(#[from] WalletError),
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Client-side view over the deployed contract. Ephemeral: created around a
/// wallet connection, discarded on disconnect. The cached balances are never
/// authoritative — they are re-read after every confirmed mutation.
///
/// Mutating requests are serialized: a second request while one is in flight
/// is refused rather than interleaved.
pub struct Session<P: WalletProvider> {
    node: Node,
    contract: Address,
    interface_id: [u8; 32],
    confirm_timeout: Duration,
    provider: Option<P>,
    account: Option<Address>,
    signer: Option<WalletSigner>,
    atm: Option<AtmHandle>,
    atm_balance: Option<Amount>,
    wallet_balance: Option<Amount>,
    in_flight: bool,
    owner_error_until: Option<Instant>,
    owner_error_ttl: Duration,
}

impl<P: WalletProvider> Session<P> {
    /// A session bound to a pre-known contract address and interface
    /// description; no wallet is attached until [`Session::discover_wallet`].
    pub fn new(
        node: Node,
        contract: Address,
        interface_id: [u8; 32],
        confirm_timeout: Duration,
    ) -> Self {
        Self {
            node,
            contract,
            interface_id,
            confirm_timeout,
            provider: None,
            account: None,
            signer: None,
            atm: None,
            atm_balance: None,
            wallet_balance: None,
            in_flight: false,
            owner_error_until: None,
            owner_error_ttl: OWNER_ERROR_TTL,
        }
    }

    /// Record the wallet provider found in the environment, if any. Absence
    /// is not an error; the session stays in its prompt-to-install state.
    pub fn discover_wallet(&mut self, provider: Option<P>) {
        self.provider = provider;
    }

    pub fn wallet_available(&self) -> bool {
        self.provider.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.atm.is_some()
    }

    pub fn account(&self) -> Option<Address> {
        self.account
    }

    pub fn atm_balance(&self) -> Option<Amount> {
        self.atm_balance
    }

    pub fn wallet_balance(&self) -> Option<Amount> {
        self.wallet_balance
    }

    /// Request account access and bind the contract handle. Returns `false`
    /// without crashing when the user declines or no account is exposed.
    pub fn connect(&mut self) -> Result<bool, SessionError> {
        let provider = self
            .provider
            .as_mut()
            .ok_or(WalletError::WalletUnavailable)?;
        let accounts = match provider.request_access() {
            Ok(accounts) => accounts,
            Err(WalletError::UserRejected) => {
                tracing::info!("wallet access declined; staying unconnected");
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        };
        let Some(active) = accounts.first().copied() else {
            tracing::info!("no account exposed by the wallet");
            return Ok(false);
        };
        let signer = provider.signer(&active)?;
        tracing::info!(account = %active, contract = %self.contract, "session connected");
        self.account = Some(active);
        self.signer = Some(signer);
        self.atm = Some(AtmHandle::bind(
            self.node.clone(),
            self.contract,
            self.interface_id,
        ));
        self.refresh()?;
        Ok(true)
    }

    /// Re-read the contract balance and, when connected, the active
    /// identity's own native balance. A no-op before the handle is bound.
    pub fn refresh(&mut self) -> Result<(), SessionError> {
        let Some(atm) = &self.atm else {
            return Ok(());
        };
        self.atm_balance = Some(atm.balance()?);
        if let Some(signer) = &self.signer {
            self.wallet_balance = Some(signer.native_balance());
        }
        Ok(())
    }

    pub fn deposit(&mut self, amount: Amount) -> Result<SignedReceipt, SessionError> {
        self.begin()?;
        let result = self.mutate(ContractCall::Deposit { amount });
        self.in_flight = false;
        result
    }

    pub fn withdraw(&mut self, amount: Amount) -> Result<SignedReceipt, SessionError> {
        self.begin()?;
        let result = self.mutate(ContractCall::Withdraw { amount });
        self.in_flight = false;
        result
    }

    /// Reassign the contract owner. Unlike deposits and withdrawals, call
    /// failures are absorbed here: a malformed target or a ledger rejection
    /// sets a transient error flag instead of surfacing, and `None` is
    /// returned. The flag clears itself after its TTL or on disconnect.
    pub fn transfer_ownership(
        &mut self,
        new_owner: &str,
    ) -> Result<Option<SignedReceipt>, SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        self.begin()?;
        let target = match new_owner.parse::<Address>() {
            Ok(target) => target,
            Err(err) => {
                self.in_flight = false;
                tracing::warn!(error = %err, "ownership transfer target rejected");
                self.owner_error_until = Some(Instant::now() + self.owner_error_ttl);
                return Ok(None);
            }
        };
        let result = self.mutate(ContractCall::TransferOwnership { new_owner: target });
        self.in_flight = false;
        match result {
            Ok(receipt) => {
                self.owner_error_until = None;
                Ok(Some(receipt))
            }
            Err(err) => {
                tracing::warn!(error = %err, "ownership transfer failed");
                self.owner_error_until = Some(Instant::now() + self.owner_error_ttl);
                Ok(None)
            }
        }
    }

    /// Whether a recent ownership transfer failed. Reads as set until the
    /// TTL elapses; cleared by a later success or by [`Session::disconnect`].
    pub fn owner_error(&self) -> bool {
        self.owner_error_until
            .is_some_and(|until| Instant::now() < until)
    }

    pub fn disconnect(&mut self) {
        self.account = None;
        self.signer = None;
        self.atm = None;
        self.atm_balance = None;
        self.wallet_balance = None;
        self.in_flight = false;
        self.owner_error_until = None;
    }

    fn begin(&mut self) -> Result<(), SessionError> {
        if self.in_flight {
            return Err(SessionError::RequestInFlight);
        }
        self.in_flight = true;
        Ok(())
    }

    fn mutate(&mut self, call: ContractCall) -> Result<SignedReceipt, SessionError> {
        let (Some(atm), Some(signer)) = (&self.atm, &self.signer) else {
            return Err(SessionError::NotConnected);
        };
        let request = signer.sign_call(atm.contract(), atm.interface_id(), call);
        let pending = atm.submit(request)?;
        let receipt = pending.wait(self.confirm_timeout)?;
        match receipt.core.outcome {
            ReceiptOutcome::Accepted { .. } => {
                self.refresh()?;
                Ok(receipt)
            }
            ReceiptOutcome::Rejected { ref reason } => {
                Err(ChainError::Rejected(reason.clone()).into())
            }
        }
    }
}
