//! Domain types shared across the gateway.
//!
//! The key objects are [`PaymentAddress`], [`Transaction`], and
//! [`WebhookEndpoint`], which mirror the persisted tables, plus the tagged
//! enums driving the confirmation state machine and the webhook event set.
//!
//! Monetary amounts are [`rust_decimal::Decimal`] everywhere off-chain and
//! `U256` atomic units at the chain boundary; [`TokenQuantity`] converts
//! between the two using the token's on-chain `decimals()`.

use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;
use uuid::Uuid;

/// Kind of a derived address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(type_name = "address_kind", rename_all = "kebab-case")]
pub enum AddressKind {
    /// Single-use deposit address issued to a merchant for one expected payment.
    MerchantPayment,
    /// Operational address that receives swept funds.
    HotWallet,
}

/// Lifecycle status of a derived address.
///
/// `Used` addresses are retained forever; they anchor the audit trail of the
/// payment they received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(type_name = "address_status", rename_all = "kebab-case")]
pub enum AddressStatus {
    Active,
    Used,
    Expired,
    Disabled,
}

/// Kind of an on-chain transfer tracked by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(type_name = "transaction_kind", rename_all = "kebab-case")]
pub enum TransactionKind {
    /// Inbound merchant payment observed on a deposit address.
    Payment,
    /// Sweep of a confirmed payment into a hot wallet.
    SettlementTransfer,
    /// Hot wallet balance moved to cold storage.
    ColdStorageTransfer,
    /// Tokens returned to the original sender.
    Refund,
    /// Outbound merchant payout.
    Payout,
}

/// Status of a tracked transaction.
///
/// Inbound payments run `pending → confirming → confirmed → settled`, or end
/// in `underpaid` / `expired`. Emitted transfers (settlement, refund, payout,
/// cold-storage) run `pending → confirming → confirmed → completed`. `failed`
/// is terminal for both families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(type_name = "transaction_status", rename_all = "kebab-case")]
pub enum TransactionStatus {
    Pending,
    Confirming,
    Confirmed,
    Settled,
    Underpaid,
    Expired,
    Failed,
    Completed,
}

impl TransactionStatus {
    /// Whether the state machine accepts the `self → to` edge.
    ///
    /// The only backward edge is `confirming → pending`, taken once when a
    /// re-org invalidates the previously observed inclusion.
    pub fn can_transition_to(self, to: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, to),
            (Pending, Confirming)
                | (Pending, Failed)
                | (Confirming, Confirmed)
                | (Confirming, Underpaid)
                | (Confirming, Pending)
                | (Confirming, Failed)
                | (Confirmed, Settled)
                | (Confirmed, Completed)
                | (Confirmed, Failed)
        )
    }

    /// Terminal states never leave the row again.
    pub fn is_terminal(self) -> bool {
        use TransactionStatus::*;
        matches!(self, Settled | Underpaid | Expired | Failed | Completed)
    }
}

impl Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Confirming => "confirming",
            TransactionStatus::Confirmed => "confirmed",
            TransactionStatus::Settled => "settled",
            TransactionStatus::Underpaid => "underpaid",
            TransactionStatus::Expired => "expired",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

/// Delivery status of a merchant webhook endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(type_name = "endpoint_status", rename_all = "kebab-case")]
pub enum EndpointStatus {
    Active,
    Failed,
    Disabled,
}

/// Events the gateway notifies merchants about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WebhookEvent {
    PaymentReceived,
    PaymentConfirmed,
    PaymentCompleted,
    PaymentUnderpaid,
    PaymentFailed,
    AddressCreated,
    AddressExpired,
    TransactionSettled,
    RefundInitiated,
    RefundCompleted,
    RefundFailed,
    PayoutProcessing,
    PayoutCompleted,
    PayoutFailed,
    SettlementCompleted,
}

impl WebhookEvent {
    /// Events that publish at high queue priority and are retried through an
    /// open circuit breaker once it resets.
    pub fn is_critical(self) -> bool {
        use WebhookEvent::*;
        matches!(
            self,
            PaymentReceived
                | PaymentConfirmed
                | PaymentCompleted
                | PayoutCompleted
                | PayoutFailed
                | RefundCompleted
                | RefundFailed
                | SettlementCompleted
        )
    }

    pub fn as_str(self) -> &'static str {
        use WebhookEvent::*;
        match self {
            PaymentReceived => "payment-received",
            PaymentConfirmed => "payment-confirmed",
            PaymentCompleted => "payment-completed",
            PaymentUnderpaid => "payment-underpaid",
            PaymentFailed => "payment-failed",
            AddressCreated => "address-created",
            AddressExpired => "address-expired",
            TransactionSettled => "transaction-settled",
            RefundInitiated => "refund-initiated",
            RefundCompleted => "refund-completed",
            RefundFailed => "refund-failed",
            PayoutProcessing => "payout-processing",
            PayoutCompleted => "payout-completed",
            PayoutFailed => "payout-failed",
            SettlementCompleted => "settlement-completed",
        }
    }
}

impl Display for WebhookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown webhook event: {0}")]
pub struct UnknownWebhookEvent(pub String);

impl FromStr for WebhookEvent {
    type Err = UnknownWebhookEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use WebhookEvent::*;
        let event = match s {
            "payment-received" => PaymentReceived,
            "payment-confirmed" => PaymentConfirmed,
            "payment-completed" => PaymentCompleted,
            "payment-underpaid" => PaymentUnderpaid,
            "payment-failed" => PaymentFailed,
            "address-created" => AddressCreated,
            "address-expired" => AddressExpired,
            "transaction-settled" => TransactionSettled,
            "refund-initiated" => RefundInitiated,
            "refund-completed" => RefundCompleted,
            "refund-failed" => RefundFailed,
            "payout-processing" => PayoutProcessing,
            "payout-completed" => PayoutCompleted,
            "payout-failed" => PayoutFailed,
            "settlement-completed" => SettlementCompleted,
            other => return Err(UnknownWebhookEvent(other.to_string())),
        };
        Ok(event)
    }
}

/// Append-only audit trail action.
///
/// This is the union of the actions recorded by every engine; the stored
/// column is TEXT, so extending the set is a code change only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditAction {
    AddressGenerated,
    AddressUsed,
    AddressExpired,
    AddressDisabled,
    TransactionObserved,
    TransactionConfirming,
    TransactionConfirmed,
    TransactionSettled,
    TransactionUnderpaid,
    TransactionExpired,
    TransactionFailed,
    TransactionCompleted,
    TransactionReorged,
    RefundInitiated,
    RefundCompleted,
    RefundFailed,
    PayoutInitiated,
    PayoutCompleted,
    PayoutFailed,
    SettlementStarted,
    SettlementCompleted,
    ColdStorageTransfer,
    WebhookEndpointCreated,
    WebhookEndpointDisabled,
    WebhookEndpointFailed,
    SystemError,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        use AuditAction::*;
        match self {
            AddressGenerated => "address-generated",
            AddressUsed => "address-used",
            AddressExpired => "address-expired",
            AddressDisabled => "address-disabled",
            TransactionObserved => "transaction-observed",
            TransactionConfirming => "transaction-confirming",
            TransactionConfirmed => "transaction-confirmed",
            TransactionSettled => "transaction-settled",
            TransactionUnderpaid => "transaction-underpaid",
            TransactionExpired => "transaction-expired",
            TransactionFailed => "transaction-failed",
            TransactionCompleted => "transaction-completed",
            TransactionReorged => "transaction-reorged",
            RefundInitiated => "refund-initiated",
            RefundCompleted => "refund-completed",
            RefundFailed => "refund-failed",
            PayoutInitiated => "payout-initiated",
            PayoutCompleted => "payout-completed",
            PayoutFailed => "payout-failed",
            SettlementStarted => "settlement-started",
            SettlementCompleted => "settlement-completed",
            ColdStorageTransfer => "cold-storage-transfer",
            WebhookEndpointCreated => "webhook-endpoint-created",
            WebhookEndpointDisabled => "webhook-endpoint-disabled",
            WebhookEndpointFailed => "webhook-endpoint-failed",
            SystemError => "system-error",
        }
    }
}

impl Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Entity families referenced from the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    Merchant,
    PaymentAddress,
    Transaction,
    WebhookEndpoint,
    System,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Merchant => "merchant",
            EntityKind::PaymentAddress => "payment-address",
            EntityKind::Transaction => "transaction",
            EntityKind::WebhookEndpoint => "webhook-endpoint",
            EntityKind::System => "system",
        }
    }
}

/// A 32-byte transaction hash, 0x-prefixed hex on the wire and in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxHash(pub [u8; 32]);

static TX_HASH_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{64}$").expect("invalid tx hash regex"));

#[derive(Debug, thiserror::Error)]
#[error("invalid transaction hash: {0}")]
pub struct TxHashError(pub String);

impl FromStr for TxHash {
    type Err = TxHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !TX_HASH_REGEX.is_match(s) {
            return Err(TxHashError(s.to_string()));
        }
        let bytes =
            hex::decode(s.trim_start_matches("0x")).map_err(|_| TxHashError(s.to_string()))?;
        let array: [u8; 32] = bytes.try_into().map_err(|_| TxHashError(s.to_string()))?;
        Ok(TxHash(array))
    }
}

impl Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl From<B256> for TxHash {
    fn from(value: B256) -> Self {
        TxHash(value.0)
    }
}

impl From<TxHash> for B256 {
    fn from(value: TxHash) -> Self {
        B256::new(value.0)
    }
}

impl Serialize for TxHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TxHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid EVM address: {0}")]
pub struct AddressParseError(pub String);

/// Parse a 0x-prefixed EVM address, accepting any capitalization.
///
/// # Errors
/// Returns [`AddressParseError`] when the input is not 20 hex-encoded bytes.
pub fn parse_evm_address(s: &str) -> Result<Address, AddressParseError> {
    static ADDRESS_REGEX: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("invalid address regex"));
    if !ADDRESS_REGEX.is_match(s) {
        return Err(AddressParseError(s.to_string()));
    }
    Address::from_str(s).map_err(|_| AddressParseError(s.to_string()))
}

/// Converts between human-denominated [`Decimal`] amounts and on-chain atomic
/// units for a token with a fixed number of decimals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenQuantity {
    pub decimals: u8,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenQuantityError {
    /// The amount does not fit the token's atomic representation.
    #[error("amount {0} not representable with {1} decimals")]
    NotRepresentable(Decimal, u8),
    /// The atomic value exceeds what a decimal amount can carry.
    #[error("atomic value {0} overflows decimal range")]
    Overflow(U256),
}

impl TokenQuantity {
    pub fn new(decimals: u8) -> Self {
        Self { decimals }
    }

    /// Human amount → atomic units.
    pub fn to_atomic(&self, amount: Decimal) -> Result<U256, TokenQuantityError> {
        if amount.is_sign_negative() {
            return Err(TokenQuantityError::NotRepresentable(amount, self.decimals));
        }
        let mut scaled = amount;
        scaled.rescale(self.decimals as u32);
        // rescale truncates silently past the token's precision; reject that.
        if scaled.normalize() != amount.normalize() {
            return Err(TokenQuantityError::NotRepresentable(amount, self.decimals));
        }
        let mantissa = scaled.mantissa();
        if mantissa < 0 {
            return Err(TokenQuantityError::NotRepresentable(amount, self.decimals));
        }
        Ok(U256::from(mantissa as u128))
    }

    /// Atomic units → human amount.
    pub fn to_amount(&self, atomic: U256) -> Result<Decimal, TokenQuantityError> {
        let units: u128 = atomic
            .try_into()
            .map_err(|_| TokenQuantityError::Overflow(atomic))?;
        let units: i128 = units
            .try_into()
            .map_err(|_| TokenQuantityError::Overflow(atomic))?;
        Decimal::try_from_i128_with_scale(units, self.decimals as u32)
            .map_err(|_| TokenQuantityError::Overflow(atomic))
    }
}

/// A merchant account. Owned by the account-management surface; the engines
/// read it for fee schedules and cold-wallet hints only.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Merchant {
    pub id: Uuid,
    pub name: String,
    pub api_key: String,
    #[serde(skip_serializing)]
    pub api_secret: String,
    pub fee_percent: Decimal,
    pub cold_wallet_address: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// A single-use address derived from the wallet seed.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAddress {
    pub id: Uuid,
    /// 0x-prefixed, checksummed. Globally unique.
    pub address: String,
    /// Full derivation path, e.g. `m/44'/60'/0'/0/17`. Globally unique.
    pub hd_path: String,
    /// Versioned ciphertext of the child private key. Never serialized.
    #[serde(skip_serializing)]
    pub encrypted_key: String,
    pub kind: AddressKind,
    pub status: AddressStatus,
    /// Null for hot wallets.
    pub merchant_id: Option<Uuid>,
    pub currency: String,
    pub expected_amount: Option<Decimal>,
    /// Non-null and in the future while a merchant-payment address is active.
    pub expires_at: Option<DateTime<Utc>>,
    pub monitored: bool,
    pub created_at: DateTime<Utc>,
}

impl PaymentAddress {
    /// The derivation index is the final path segment.
    pub fn derivation_index(&self) -> Option<u32> {
        self.hd_path.rsplit('/').next()?.parse().ok()
    }
}

/// A tracked on-chain token transfer, inbound or emitted.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: Uuid,
    /// Null until the transfer is observed or broadcast.
    pub tx_hash: Option<String>,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub currency: String,
    pub amount: Decimal,
    pub from_address: Option<String>,
    pub to_address: String,
    pub confirmations: i32,
    pub block_number: Option<i64>,
    pub block_hash: Option<String>,
    pub block_timestamp: Option<DateTime<Utc>>,
    pub payment_address_id: Option<Uuid>,
    pub merchant_id: Option<Uuid>,
    pub fee_amount: Decimal,
    /// Set exactly when the status is `settled`.
    pub settlement_tx_hash: Option<String>,
    /// How many retrograde (re-org) transitions this row has taken.
    pub reorg_count: i32,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A merchant-owned webhook delivery target.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEndpoint {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub url: String,
    /// Kebab-case event names this endpoint subscribes to.
    pub events: Vec<String>,
    #[serde(skip_serializing)]
    pub secret: String,
    pub status: EndpointStatus,
    pub consecutive_failures: i32,
    pub last_failure_reason: Option<String>,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
}

/// One appended audit record.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: i64,
    pub action: String,
    pub entity_kind: String,
    pub entity_id: Option<String>,
    pub previous_state: Option<String>,
    pub new_state: Option<String>,
    pub actor: String,
    pub created_at: DateTime<Utc>,
}

/// A token `Transfer` log as observed on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub tx_hash: TxHash,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub block_number: Option<u64>,
}

/// What the chain client can currently deliver.
///
/// `PullOnly` is raised after repeated push-stream failures and tells the
/// observer to drive ingestion from balance polling instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainCapability {
    Push,
    PullOnly,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn payment_status_edges() {
        use TransactionStatus::*;
        assert!(Pending.can_transition_to(Confirming));
        assert!(Confirming.can_transition_to(Confirmed));
        assert!(Confirming.can_transition_to(Underpaid));
        assert!(Confirmed.can_transition_to(Settled));
        assert!(Confirmed.can_transition_to(Completed));
        // The single permitted backward edge.
        assert!(Confirming.can_transition_to(Pending));
        // No skipping or late-backward edges.
        assert!(!Confirmed.can_transition_to(Confirming));
        assert!(!Settled.can_transition_to(Confirmed));
        assert!(!Pending.can_transition_to(Confirmed));
        assert!(!Underpaid.can_transition_to(Confirmed));
    }

    #[test]
    fn terminal_states() {
        use TransactionStatus::*;
        for s in [Settled, Underpaid, Expired, Failed, Completed] {
            assert!(s.is_terminal(), "{s} should be terminal");
        }
        for s in [Pending, Confirming, Confirmed] {
            assert!(!s.is_terminal(), "{s} should not be terminal");
        }
    }

    #[test]
    fn critical_events() {
        assert!(WebhookEvent::PaymentReceived.is_critical());
        assert!(WebhookEvent::SettlementCompleted.is_critical());
        assert!(!WebhookEvent::AddressCreated.is_critical());
        assert!(!WebhookEvent::PaymentUnderpaid.is_critical());
    }

    #[test]
    fn webhook_event_round_trip() {
        for event in [
            WebhookEvent::PaymentReceived,
            WebhookEvent::TransactionSettled,
            WebhookEvent::RefundCompleted,
            WebhookEvent::PayoutProcessing,
        ] {
            let parsed: WebhookEvent = event.as_str().parse().unwrap();
            assert_eq!(parsed, event);
        }
        assert!("payment-vanished".parse::<WebhookEvent>().is_err());
    }

    #[test]
    fn tx_hash_parse_and_display() {
        let s = "0x3e1b4c2a9f0d8e7c6b5a4938271605f4e3d2c1b0a9f8e7d6c5b4a39281706f5e";
        let hash: TxHash = s.parse().unwrap();
        assert_eq!(hash.to_string(), s);
        assert!("0xdeadbeef".parse::<TxHash>().is_err());
        assert!("not-a-hash".parse::<TxHash>().is_err());
    }

    #[test]
    fn token_quantity_round_trip() {
        let q = TokenQuantity::new(18);
        let amount = dec("100.5");
        let atomic = q.to_atomic(amount).unwrap();
        assert_eq!(atomic, U256::from(100_500_000_000_000_000_000u128));
        assert_eq!(q.to_amount(atomic).unwrap().normalize(), amount.normalize());
    }

    #[test]
    fn token_quantity_rejects_excess_precision() {
        let q = TokenQuantity::new(2);
        assert!(q.to_atomic(dec("1.005")).is_err());
        assert_eq!(q.to_atomic(dec("1.05")).unwrap(), U256::from(105u64));
    }

    #[test]
    fn token_quantity_rejects_negative() {
        let q = TokenQuantity::new(6);
        assert!(q.to_atomic(dec("-1")).is_err());
    }

    #[test]
    fn derivation_index_from_path() {
        let addr = PaymentAddress {
            id: Uuid::nil(),
            address: "0x0000000000000000000000000000000000000001".to_string(),
            hd_path: "m/44'/60'/0'/0/17".to_string(),
            encrypted_key: String::new(),
            kind: AddressKind::MerchantPayment,
            status: AddressStatus::Active,
            merchant_id: None,
            currency: "USDT".to_string(),
            expected_amount: None,
            expires_at: None,
            monitored: true,
            created_at: Utc::now(),
        };
        assert_eq!(addr.derivation_index(), Some(17));
    }
}
