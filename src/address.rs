//! Deposit and hot-wallet address provisioning.
//!
//! Issuance is serialized through a process-local generation lock so
//! derivation indices stay strictly monotonic: the next index is one past
//! the highest index in storage, and the database's uniqueness constraints
//! on address and path are the backstop against races with other
//! instances. A constraint rejection bumps the index and retries, up to
//! three times.
//!
//! Callers wait at most 10 s for the lock; the critical section itself is
//! bounded by a 30 s watchdog so a wedged holder cannot starve issuance.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::instrument;
use uuid::Uuid;

use crate::store::{NewAddress, Store, StoreError};
use crate::types::{AddressKind, PaymentAddress};
use crate::vault::{KeyVault, VaultError};

/// How long a caller waits for the generation lock.
const LOCK_WAIT: Duration = Duration::from_secs(10);
/// Upper bound on the locked section; the watchdog abandons the attempt
/// past this, which releases the lock.
const LOCK_WATCHDOG: Duration = Duration::from_secs(30);
/// Uniqueness-conflict retries before giving up.
const MAX_CONFLICT_RETRIES: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    /// Another issuance held the lock past the caller's patience.
    #[error("address generation lock busy")]
    LockBusy,
    /// The locked section hit the watchdog bound.
    #[error("address generation timed out")]
    WatchdogExpired,
    /// Exhausted conflict retries; concurrent instances are racing hard.
    #[error("could not find a free derivation index after {MAX_CONFLICT_RETRIES} attempts")]
    IndexContention,
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Parameters for a merchant deposit address.
#[derive(Debug, Clone)]
pub struct DepositRequest {
    pub merchant_id: Uuid,
    pub expected_amount: Option<Decimal>,
    /// Overrides the configured default lifetime when set.
    pub expires_in: Option<Duration>,
}

/// Issues addresses derived from the wallet seed. One per process.
pub struct AddressService {
    store: Store,
    vault: Arc<KeyVault>,
    currency: String,
    default_lifetime: Duration,
    generation_lock: Mutex<()>,
    /// Freshly issued addresses flow to the observer's watch list.
    issued: mpsc::Sender<PaymentAddress>,
}

impl AddressService {
    pub fn new(
        store: Store,
        vault: Arc<KeyVault>,
        currency: String,
        default_lifetime: Duration,
        issued: mpsc::Sender<PaymentAddress>,
    ) -> Self {
        Self {
            store,
            vault,
            currency,
            default_lifetime,
            generation_lock: Mutex::new(()),
            issued,
        }
    }

    /// Issue a single-use deposit address for a merchant payment.
    ///
    /// The address is monitored from the moment this returns.
    #[instrument(skip_all, err, fields(merchant = %request.merchant_id))]
    pub async fn issue_deposit_address(
        &self,
        request: DepositRequest,
    ) -> Result<PaymentAddress, AddressError> {
        let lifetime = request.expires_in.unwrap_or(self.default_lifetime);
        let expires_at = Utc::now()
            + ChronoDuration::from_std(lifetime).unwrap_or_else(|_| ChronoDuration::hours(1));
        let address = self
            .issue(
                AddressKind::MerchantPayment,
                Some(request.merchant_id),
                request.expected_amount,
                Some(expires_at),
            )
            .await?;
        // Best-effort: the observer also reloads the watch list on startup,
        // so a dropped notification only delays monitoring, never loses it.
        if self.issued.send(address.clone()).await.is_err() {
            tracing::warn!("observer channel closed; address will be picked up on reload");
        }
        Ok(address)
    }

    /// Issue (or reuse on the caller's side) an operational hot wallet.
    #[instrument(skip_all, err)]
    pub async fn issue_hot_wallet(&self) -> Result<PaymentAddress, AddressError> {
        self.issue(AddressKind::HotWallet, None, None, None).await
    }

    async fn issue(
        &self,
        kind: AddressKind,
        merchant_id: Option<Uuid>,
        expected_amount: Option<Decimal>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<PaymentAddress, AddressError> {
        let _guard = tokio::time::timeout(LOCK_WAIT, self.generation_lock.lock())
            .await
            .map_err(|_| AddressError::LockBusy)?;
        tokio::time::timeout(
            LOCK_WATCHDOG,
            self.issue_locked(kind, merchant_id, expected_amount, expires_at),
        )
        .await
        .map_err(|_| AddressError::WatchdogExpired)?
    }

    async fn issue_locked(
        &self,
        kind: AddressKind,
        merchant_id: Option<Uuid>,
        expected_amount: Option<Decimal>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<PaymentAddress, AddressError> {
        let base_index = match self.store.max_hd_index().await? {
            Some(max) => max + 1,
            None => 0,
        };
        for attempt in 0..MAX_CONFLICT_RETRIES {
            let index = base_index + attempt as i32;
            let index_u32 =
                u32::try_from(index).map_err(|_| AddressError::IndexContention)?;
            let derived = self.vault.derive(index_u32)?;
            let encrypted_key = self.vault.encrypt_signer(&derived.signer);
            let new = NewAddress {
                address: derived.address.to_string(),
                hd_path: derived.path.clone(),
                hd_index: index,
                encrypted_key,
                kind,
                merchant_id,
                currency: self.currency.clone(),
                expected_amount,
                expires_at,
            };
            match self.store.insert_address(new).await {
                Ok(row) => {
                    tracing::info!(address = %row.address, index, "address issued");
                    return Ok(row);
                }
                Err(e) if e.is_conflict() => {
                    // Another instance took this index; move past it.
                    tracing::warn!(index, "derivation index already taken, retrying");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AddressError::IndexContention)
    }

}

impl std::fmt::Debug for AddressService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressService")
            .field("currency", &self.currency)
            .field("default_lifetime", &self.default_lifetime)
            .finish_non_exhaustive()
    }
}
