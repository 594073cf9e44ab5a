//! Persistence layer over PostgreSQL.
//!
//! Every stateful component talks to the database through [`Store`]. Three
//! rules hold throughout:
//!
//! 1. Status changes are compare-and-update: the `UPDATE` carries the
//!    expected current status in its `WHERE` clause and reports whether the
//!    row moved. A handler that loses the race re-reads and re-enqueues.
//! 2. Every state change appends an audit row inside the same database
//!    transaction.
//! 3. All calls pass through the database circuit breaker: open after 5
//!    consecutive failures, half-open probe after 30 s.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{PgExecutor, Row};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::types::{
    AddressKind, AddressStatus, AuditAction, AuditEntry, EntityKind, Merchant, PaymentAddress,
    Transaction, TransactionKind, TransactionStatus, WebhookEndpoint, WebhookEvent,
};
use crate::util::breaker::CircuitBreaker;

const BREAKER_THRESHOLD: u32 = 5;
const BREAKER_RESET: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The database breaker is open; retry after the embedded delay.
    #[error("database unavailable, retry in {0:?}")]
    CircuitOpen(Duration),
    /// A uniqueness constraint rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    /// Conflicts are duplicate work, not infrastructure trouble.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|d| d.code())
        .is_some_and(|code| code == "23505")
}

/// Input for a freshly derived address row.
#[derive(Debug, Clone)]
pub struct NewAddress {
    pub address: String,
    pub hd_path: String,
    pub hd_index: i32,
    pub encrypted_key: String,
    pub kind: AddressKind,
    pub merchant_id: Option<Uuid>,
    pub currency: String,
    pub expected_amount: Option<Decimal>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Input for a new tracked transfer.
#[derive(Debug, Clone)]
pub struct NewTransaction {
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
    pub metadata: Option<serde_json::Value>,
}

/// A queue message parked after exhausting its retries.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FailedMessage {
    pub id: i64,
    pub queue: String,
    pub payload: serde_json::Value,
    pub error: String,
    pub retry_count: i32,
    pub replayed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    breaker: Arc<CircuitBreaker>,
}

impl Store {
    /// Connect the pool and run pending migrations.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            breaker: Arc::new(CircuitBreaker::new(
                BREAKER_THRESHOLD,
                BREAKER_RESET,
                BREAKER_RESET,
            )),
        }
    }

    pub fn breaker_open(&self) -> bool {
        self.breaker.is_open()
    }

    fn admit(&self) -> Result<(), StoreError> {
        self.breaker
            .acquire()
            .map_err(|open| StoreError::CircuitOpen(open.retry_in))
    }

    fn note<T>(&self, result: Result<T, sqlx::Error>) -> Result<T, StoreError> {
        match result {
            Ok(value) => {
                self.breaker.record_success();
                Ok(value)
            }
            Err(e) if is_unique_violation(&e) => {
                // A constraint rejection is the database working as intended.
                self.breaker.record_success();
                Err(StoreError::Conflict(e.to_string()))
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(StoreError::Database(e))
            }
        }
    }

    // ------------------------------------------------------------------
    // Audit
    // ------------------------------------------------------------------

    /// Append an audit record on the given executor, which may be a live
    /// transaction so the entry commits or rolls back with the state change.
    pub async fn record_audit<'e, E>(
        executor: E,
        action: AuditAction,
        entity_kind: EntityKind,
        entity_id: Option<&str>,
        previous_state: Option<&str>,
        new_state: Option<&str>,
        actor: &str,
    ) -> Result<(), sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query(
            "INSERT INTO audit_log (action, entity_kind, entity_id, previous_state, new_state, actor)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(action.as_str())
        .bind(entity_kind.as_str())
        .bind(entity_id)
        .bind(previous_state)
        .bind(new_state)
        .bind(actor)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Operator-facing record of a configuration or contract violation.
    pub async fn audit_system_error(&self, detail: &str, actor: &str) -> Result<(), StoreError> {
        self.admit()?;
        let result = Self::record_audit(
            &self.pool,
            AuditAction::SystemError,
            EntityKind::System,
            None,
            None,
            Some(detail),
            actor,
        )
        .await;
        self.note(result)
    }

    pub async fn audit_entries_for(
        &self,
        entity_kind: EntityKind,
        entity_id: &str,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        self.admit()?;
        let result = sqlx::query_as::<_, AuditEntry>(
            "SELECT * FROM audit_log WHERE entity_kind = $1 AND entity_id = $2 ORDER BY id",
        )
        .bind(entity_kind.as_str())
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await;
        self.note(result)
    }

    // ------------------------------------------------------------------
    // Addresses
    // ------------------------------------------------------------------

    /// Highest derivation index ever issued. All kinds share one index
    /// space because they derive under one base path.
    pub async fn max_hd_index(&self) -> Result<Option<i32>, StoreError> {
        self.admit()?;
        let result = sqlx::query(
            "SELECT hd_index FROM payment_addresses ORDER BY hd_index DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map(|row| row.map(|r| r.get::<i32, _>("hd_index")));
        self.note(result)
    }

    /// Insert a derived address and its `address-generated` audit entry.
    ///
    /// # Errors
    /// [`StoreError::Conflict`] when the address or path already exists;
    /// the caller retries with the next index.
    pub async fn insert_address(&self, new: NewAddress) -> Result<PaymentAddress, StoreError> {
        self.admit()?;
        let id = Uuid::new_v4();
        let result: Result<PaymentAddress, sqlx::Error> = async {
            let mut tx = self.pool.begin().await?;
            let row = sqlx::query_as::<_, PaymentAddress>(
                "INSERT INTO payment_addresses
                   (id, address, hd_path, hd_index, encrypted_key, kind, merchant_id,
                    currency, expected_amount, expires_at, monitored)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, TRUE)
                 RETURNING *",
            )
            .bind(id)
            .bind(&new.address)
            .bind(&new.hd_path)
            .bind(new.hd_index)
            .bind(&new.encrypted_key)
            .bind(new.kind)
            .bind(new.merchant_id)
            .bind(&new.currency)
            .bind(new.expected_amount)
            .bind(new.expires_at)
            .fetch_one(&mut *tx)
            .await?;
            Self::record_audit(
                &mut *tx,
                AuditAction::AddressGenerated,
                EntityKind::PaymentAddress,
                Some(&id.to_string()),
                None,
                Some("active"),
                "address-service",
            )
            .await?;
            tx.commit().await?;
            Ok(row)
        }
        .await;
        self.note(result)
    }

    pub async fn address_by_id(&self, id: Uuid) -> Result<Option<PaymentAddress>, StoreError> {
        self.admit()?;
        let result = sqlx::query_as::<_, PaymentAddress>(
            "SELECT * FROM payment_addresses WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await;
        self.note(result)
    }

    pub async fn address_by_value(
        &self,
        address: &str,
    ) -> Result<Option<PaymentAddress>, StoreError> {
        self.admit()?;
        let result = sqlx::query_as::<_, PaymentAddress>(
            "SELECT * FROM payment_addresses WHERE lower(address) = lower($1)",
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await;
        self.note(result)
    }

    /// The watch list: every active, monitored address.
    pub async fn monitored_addresses(&self) -> Result<Vec<PaymentAddress>, StoreError> {
        self.admit()?;
        let result = sqlx::query_as::<_, PaymentAddress>(
            "SELECT * FROM payment_addresses WHERE status = 'active' AND monitored",
        )
        .fetch_all(&self.pool)
        .await;
        self.note(result)
    }

    pub async fn active_hot_wallets(&self) -> Result<Vec<PaymentAddress>, StoreError> {
        self.admit()?;
        let result = sqlx::query_as::<_, PaymentAddress>(
            "SELECT * FROM payment_addresses WHERE kind = 'hot-wallet' AND status = 'active'
             ORDER BY hd_index",
        )
        .fetch_all(&self.pool)
        .await;
        self.note(result)
    }

    /// Flip an address `active → used` on first inbound payment.
    pub async fn mark_address_used(&self, id: Uuid) -> Result<bool, StoreError> {
        self.cas_address_status(id, AddressStatus::Active, AddressStatus::Used, AuditAction::AddressUsed)
            .await
    }

    async fn cas_address_status(
        &self,
        id: Uuid,
        from: AddressStatus,
        to: AddressStatus,
        action: AuditAction,
    ) -> Result<bool, StoreError> {
        self.admit()?;
        let result: Result<bool, sqlx::Error> = async {
            let mut tx = self.pool.begin().await?;
            let updated = sqlx::query(
                "UPDATE payment_addresses SET status = $1 WHERE id = $2 AND status = $3",
            )
            .bind(to)
            .bind(id)
            .bind(from)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if updated == 0 {
                tx.rollback().await?;
                return Ok(false);
            }
            Self::record_audit(
                &mut *tx,
                action,
                EntityKind::PaymentAddress,
                Some(&id.to_string()),
                Some(status_str(from)),
                Some(status_str(to)),
                "observer",
            )
            .await?;
            tx.commit().await?;
            Ok(true)
        }
        .await;
        self.note(result)
    }

    /// Expire every overdue active merchant-payment address, auditing each,
    /// and return the rows so the observer can drop them from its watch list.
    pub async fn expire_overdue_addresses(&self) -> Result<Vec<PaymentAddress>, StoreError> {
        self.admit()?;
        let result: Result<Vec<PaymentAddress>, sqlx::Error> = async {
            let mut tx = self.pool.begin().await?;
            let rows = sqlx::query_as::<_, PaymentAddress>(
                "UPDATE payment_addresses
                 SET status = 'expired', monitored = FALSE
                 WHERE kind = 'merchant-payment' AND status = 'active'
                   AND expires_at IS NOT NULL AND expires_at < now()
                 RETURNING *",
            )
            .fetch_all(&mut *tx)
            .await?;
            for row in &rows {
                Self::record_audit(
                    &mut *tx,
                    AuditAction::AddressExpired,
                    EntityKind::PaymentAddress,
                    Some(&row.id.to_string()),
                    Some("active"),
                    Some("expired"),
                    "observer",
                )
                .await?;
            }
            tx.commit().await?;
            Ok(rows)
        }
        .await;
        self.note(result)
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Insert a tracked transfer and its audit entry in one transaction.
    ///
    /// # Errors
    /// [`StoreError::Conflict`] when `tx_hash` is already recorded; callers
    /// treat that as a duplicate observation and do nothing.
    pub async fn insert_transaction(
        &self,
        new: NewTransaction,
        action: AuditAction,
        actor: &str,
    ) -> Result<Transaction, StoreError> {
        self.admit()?;
        let id = Uuid::new_v4();
        let status = new.status;
        let result: Result<Transaction, sqlx::Error> = async {
            let mut tx = self.pool.begin().await?;
            let row = sqlx::query_as::<_, Transaction>(
                "INSERT INTO transactions
                   (id, tx_hash, kind, status, currency, amount, from_address, to_address,
                    confirmations, block_number, block_hash, block_timestamp,
                    payment_address_id, merchant_id, fee_amount, metadata)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                 RETURNING *",
            )
            .bind(id)
            .bind(&new.tx_hash)
            .bind(new.kind)
            .bind(new.status)
            .bind(&new.currency)
            .bind(new.amount)
            .bind(&new.from_address)
            .bind(&new.to_address)
            .bind(new.confirmations)
            .bind(new.block_number)
            .bind(&new.block_hash)
            .bind(new.block_timestamp)
            .bind(new.payment_address_id)
            .bind(new.merchant_id)
            .bind(new.fee_amount)
            .bind(&new.metadata)
            .fetch_one(&mut *tx)
            .await?;
            Self::record_audit(
                &mut *tx,
                action,
                EntityKind::Transaction,
                Some(&id.to_string()),
                None,
                Some(&status.to_string()),
                actor,
            )
            .await?;
            tx.commit().await?;
            Ok(row)
        }
        .await;
        self.note(result)
    }

    pub async fn transaction_by_id(&self, id: Uuid) -> Result<Option<Transaction>, StoreError> {
        self.admit()?;
        let result =
            sqlx::query_as::<_, Transaction>("SELECT * FROM transactions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await;
        self.note(result)
    }

    pub async fn transaction_by_hash(
        &self,
        tx_hash: &str,
    ) -> Result<Option<Transaction>, StoreError> {
        self.admit()?;
        let result = sqlx::query_as::<_, Transaction>(
            "SELECT * FROM transactions WHERE lower(tx_hash) = lower($1)",
        )
        .bind(tx_hash)
        .fetch_optional(&self.pool)
        .await;
        self.note(result)
    }

    pub async fn transactions_for_merchant(
        &self,
        merchant_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Transaction>, StoreError> {
        self.admit()?;
        let result = sqlx::query_as::<_, Transaction>(
            "SELECT * FROM transactions WHERE merchant_id = $1
             ORDER BY created_at DESC LIMIT $2 OFFSET $3",
        )
        .bind(merchant_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await;
        self.note(result)
    }

    /// Compare-and-update the status, bumping confirmations, with the audit
    /// entry in the same transaction. Returns whether the row moved.
    pub async fn advance_transaction_status(
        &self,
        id: Uuid,
        from: TransactionStatus,
        to: TransactionStatus,
        confirmations: i32,
        action: AuditAction,
        actor: &str,
    ) -> Result<bool, StoreError> {
        self.admit()?;
        let result: Result<bool, sqlx::Error> = async {
            let mut tx = self.pool.begin().await?;
            let updated = sqlx::query(
                "UPDATE transactions
                 SET status = $1, confirmations = $2, updated_at = now()
                 WHERE id = $3 AND status = $4",
            )
            .bind(to)
            .bind(confirmations)
            .bind(id)
            .bind(from)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if updated == 0 {
                tx.rollback().await?;
                return Ok(false);
            }
            Self::record_audit(
                &mut *tx,
                action,
                EntityKind::Transaction,
                Some(&id.to_string()),
                Some(&from.to_string()),
                Some(&to.to_string()),
                actor,
            )
            .await?;
            tx.commit().await?;
            Ok(true)
        }
        .await;
        self.note(result)
    }

    /// Refresh the confirmation count without touching the status.
    pub async fn set_confirmations(&self, id: Uuid, confirmations: i32) -> Result<(), StoreError> {
        self.admit()?;
        let result = sqlx::query(
            "UPDATE transactions SET confirmations = $1, updated_at = now() WHERE id = $2",
        )
        .bind(confirmations)
        .bind(id)
        .execute(&self.pool)
        .await
        .map(|_| ());
        self.note(result)
    }

    /// Record inclusion details once a receipt is available.
    pub async fn set_block_fields(
        &self,
        id: Uuid,
        block_number: i64,
        block_hash: &str,
        block_timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.admit()?;
        let result = sqlx::query(
            "UPDATE transactions
             SET block_number = $1, block_hash = $2, block_timestamp = $3, updated_at = now()
             WHERE id = $4",
        )
        .bind(block_number)
        .bind(block_hash)
        .bind(block_timestamp)
        .bind(id)
        .execute(&self.pool)
        .await
        .map(|_| ());
        self.note(result)
    }

    /// Attach the broadcast hash to an emitted transfer.
    pub async fn set_transaction_hash(&self, id: Uuid, tx_hash: &str) -> Result<(), StoreError> {
        self.admit()?;
        let result = sqlx::query(
            "UPDATE transactions SET tx_hash = $1, updated_at = now() WHERE id = $2",
        )
        .bind(tx_hash)
        .bind(id)
        .execute(&self.pool)
        .await
        .map(|_| ());
        self.note(result)
    }

    /// Take the single permitted retrograde edge after a re-org: back to
    /// `pending`, block fields cleared, retrograde counter incremented.
    pub async fn revert_transaction_to_pending(&self, id: Uuid) -> Result<bool, StoreError> {
        self.admit()?;
        let result: Result<bool, sqlx::Error> = async {
            let mut tx = self.pool.begin().await?;
            let updated = sqlx::query(
                "UPDATE transactions
                 SET status = 'pending', block_number = NULL, block_hash = NULL,
                     block_timestamp = NULL, confirmations = 0,
                     reorg_count = reorg_count + 1, updated_at = now()
                 WHERE id = $1 AND status = 'confirming'",
            )
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if updated == 0 {
                tx.rollback().await?;
                return Ok(false);
            }
            Self::record_audit(
                &mut *tx,
                AuditAction::TransactionReorged,
                EntityKind::Transaction,
                Some(&id.to_string()),
                Some("confirming"),
                Some("pending"),
                "confirmation-engine",
            )
            .await?;
            tx.commit().await?;
            Ok(true)
        }
        .await;
        self.note(result)
    }

    /// `confirmed → settled` with the sweep hash, CAS-guarded.
    pub async fn mark_transaction_settled(
        &self,
        id: Uuid,
        settlement_tx_hash: &str,
    ) -> Result<bool, StoreError> {
        self.admit()?;
        let result: Result<bool, sqlx::Error> = async {
            let mut tx = self.pool.begin().await?;
            let updated = sqlx::query(
                "UPDATE transactions
                 SET status = 'settled', settlement_tx_hash = $1, updated_at = now()
                 WHERE id = $2 AND status = 'confirmed'",
            )
            .bind(settlement_tx_hash)
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if updated == 0 {
                tx.rollback().await?;
                return Ok(false);
            }
            Self::record_audit(
                &mut *tx,
                AuditAction::TransactionSettled,
                EntityKind::Transaction,
                Some(&id.to_string()),
                Some("confirmed"),
                Some("settled"),
                "settlement-engine",
            )
            .await?;
            tx.commit().await?;
            Ok(true)
        }
        .await;
        self.note(result)
    }

    /// Non-terminal transactions nothing has touched lately. The periodic
    /// monitor sweep re-enqueues checks for these, so confirmation keeps
    /// advancing even when a queued re-check was lost with the broker.
    pub async fn stale_active_transactions(
        &self,
        idle_for: Duration,
        limit: i64,
    ) -> Result<Vec<Transaction>, StoreError> {
        self.admit()?;
        let cutoff = Utc::now()
            - ChronoDuration::from_std(idle_for).unwrap_or_else(|_| ChronoDuration::minutes(5));
        let result = sqlx::query_as::<_, Transaction>(
            "SELECT * FROM transactions
             WHERE status IN ('pending', 'confirming') AND updated_at < $1
             ORDER BY updated_at
             LIMIT $2",
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await;
        self.note(result)
    }

    /// Whether a live sweep already carries this payment, so a redelivered
    /// settlement task does not double-spend the deposit address.
    pub async fn sweep_in_flight(&self, payment_id: Uuid) -> Result<bool, StoreError> {
        self.admit()?;
        let result = sqlx::query(
            "SELECT EXISTS (
                 SELECT 1 FROM transactions
                 WHERE kind = 'settlement-transfer'
                   AND status IN ('pending', 'confirming', 'confirmed')
                   AND metadata -> 'paymentIds' ? $1
             ) AS in_flight",
        )
        .bind(payment_id.to_string())
        .fetch_one(&self.pool)
        .await
        .map(|row| row.get::<bool, _>("in_flight"));
        self.note(result)
    }

    /// Confirmed, unswept inbound payments, oldest first.
    pub async fn confirmed_unsettled_payments(&self) -> Result<Vec<Transaction>, StoreError> {
        self.admit()?;
        let result = sqlx::query_as::<_, Transaction>(
            "SELECT * FROM transactions
             WHERE status = 'confirmed' AND kind = 'payment' AND settlement_tx_hash IS NULL
             ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await;
        self.note(result)
    }

    // ------------------------------------------------------------------
    // Merchants
    // ------------------------------------------------------------------

    pub async fn merchant_by_api_key(&self, api_key: &str) -> Result<Option<Merchant>, StoreError> {
        self.admit()?;
        let result = sqlx::query_as::<_, Merchant>(
            "SELECT * FROM merchants WHERE api_key = $1 AND active",
        )
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await;
        self.note(result)
    }

    // ------------------------------------------------------------------
    // Webhook endpoints
    // ------------------------------------------------------------------

    pub async fn insert_webhook_endpoint(
        &self,
        merchant_id: Uuid,
        url: &str,
        events: &[String],
        secret: &str,
        max_retries: i32,
    ) -> Result<WebhookEndpoint, StoreError> {
        self.admit()?;
        let id = Uuid::new_v4();
        let result: Result<WebhookEndpoint, sqlx::Error> = async {
            let mut tx = self.pool.begin().await?;
            let row = sqlx::query_as::<_, WebhookEndpoint>(
                "INSERT INTO webhook_endpoints (id, merchant_id, url, events, secret, max_retries)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 RETURNING *",
            )
            .bind(id)
            .bind(merchant_id)
            .bind(url)
            .bind(events)
            .bind(secret)
            .bind(max_retries)
            .fetch_one(&mut *tx)
            .await?;
            Self::record_audit(
                &mut *tx,
                AuditAction::WebhookEndpointCreated,
                EntityKind::WebhookEndpoint,
                Some(&id.to_string()),
                None,
                Some("active"),
                "merchant-api",
            )
            .await?;
            tx.commit().await?;
            Ok(row)
        }
        .await;
        self.note(result)
    }

    pub async fn webhook_endpoints_for_merchant(
        &self,
        merchant_id: Uuid,
    ) -> Result<Vec<WebhookEndpoint>, StoreError> {
        self.admit()?;
        let result = sqlx::query_as::<_, WebhookEndpoint>(
            "SELECT * FROM webhook_endpoints WHERE merchant_id = $1 ORDER BY created_at",
        )
        .bind(merchant_id)
        .fetch_all(&self.pool)
        .await;
        self.note(result)
    }

    /// Active endpoints of this merchant subscribed to `event`.
    pub async fn endpoints_for_event(
        &self,
        merchant_id: Uuid,
        event: WebhookEvent,
    ) -> Result<Vec<WebhookEndpoint>, StoreError> {
        self.admit()?;
        let result = sqlx::query_as::<_, WebhookEndpoint>(
            "SELECT * FROM webhook_endpoints
             WHERE merchant_id = $1 AND status = 'active' AND $2 = ANY(events)",
        )
        .bind(merchant_id)
        .bind(event.as_str())
        .fetch_all(&self.pool)
        .await;
        self.note(result)
    }

    /// Any delivered 2xx wipes the consecutive-failure count.
    pub async fn record_endpoint_success(&self, id: Uuid) -> Result<(), StoreError> {
        self.admit()?;
        let result = sqlx::query(
            "UPDATE webhook_endpoints
             SET consecutive_failures = 0, last_failure_reason = NULL
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map(|_| ());
        self.note(result)
    }

    /// Bump the failure counter and return its new value.
    pub async fn record_endpoint_failure(
        &self,
        id: Uuid,
        reason: &str,
    ) -> Result<i32, StoreError> {
        self.admit()?;
        let result = sqlx::query(
            "UPDATE webhook_endpoints
             SET consecutive_failures = consecutive_failures + 1, last_failure_reason = $1
             WHERE id = $2
             RETURNING consecutive_failures",
        )
        .bind(reason)
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map(|row| row.get::<i32, _>("consecutive_failures"));
        self.note(result)
    }

    /// Stop delivering to an endpoint that exhausted its retries.
    pub async fn mark_endpoint_failed(&self, id: Uuid) -> Result<(), StoreError> {
        self.admit()?;
        let result: Result<(), sqlx::Error> = async {
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                "UPDATE webhook_endpoints SET status = 'failed' WHERE id = $1 AND status = 'active'",
            )
            .bind(id)
            .execute(&mut *tx)
            .await?;
            Self::record_audit(
                &mut *tx,
                AuditAction::WebhookEndpointFailed,
                EntityKind::WebhookEndpoint,
                Some(&id.to_string()),
                Some("active"),
                Some("failed"),
                "webhook-dispatcher",
            )
            .await?;
            tx.commit().await?;
            Ok(())
        }
        .await;
        self.note(result)
    }

    pub async fn disable_endpoint(&self, id: Uuid, merchant_id: Uuid) -> Result<bool, StoreError> {
        self.admit()?;
        let result: Result<bool, sqlx::Error> = async {
            let mut tx = self.pool.begin().await?;
            let updated = sqlx::query(
                "UPDATE webhook_endpoints SET status = 'disabled'
                 WHERE id = $1 AND merchant_id = $2 AND status <> 'disabled'",
            )
            .bind(id)
            .bind(merchant_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if updated == 0 {
                tx.rollback().await?;
                return Ok(false);
            }
            Self::record_audit(
                &mut *tx,
                AuditAction::WebhookEndpointDisabled,
                EntityKind::WebhookEndpoint,
                Some(&id.to_string()),
                None,
                Some("disabled"),
                "merchant-api",
            )
            .await?;
            tx.commit().await?;
            Ok(true)
        }
        .await;
        self.note(result)
    }

    // ------------------------------------------------------------------
    // Idempotency keys
    // ------------------------------------------------------------------

    pub async fn idempotent_response(
        &self,
        merchant_id: Uuid,
        key: &str,
    ) -> Result<Option<(i32, serde_json::Value)>, StoreError> {
        self.admit()?;
        let result = sqlx::query(
            "SELECT response_status, response_body FROM idempotency_keys
             WHERE merchant_id = $1 AND idem_key = $2 AND expires_at > now()",
        )
        .bind(merchant_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map(|row| {
            row.map(|r| {
                (
                    r.get::<i32, _>("response_status"),
                    r.get::<serde_json::Value, _>("response_body"),
                )
            })
        });
        self.note(result)
    }

    pub async fn store_idempotent_response(
        &self,
        merchant_id: Uuid,
        key: &str,
        status: i32,
        body: &serde_json::Value,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.admit()?;
        let expires_at = Utc::now()
            + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::hours(24));
        let result = sqlx::query(
            "INSERT INTO idempotency_keys (merchant_id, idem_key, response_status, response_body, expires_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (merchant_id, idem_key) DO NOTHING",
        )
        .bind(merchant_id)
        .bind(key)
        .bind(status)
        .bind(body)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map(|_| ());
        self.note(result)
    }

    // ------------------------------------------------------------------
    // Failed queue messages
    // ------------------------------------------------------------------

    pub async fn store_failed_message(
        &self,
        queue: &str,
        payload: &serde_json::Value,
        error: &str,
        retry_count: i32,
    ) -> Result<(), StoreError> {
        self.admit()?;
        let result = sqlx::query(
            "INSERT INTO failed_messages (queue, payload, error, retry_count)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(queue)
        .bind(payload)
        .bind(error)
        .bind(retry_count)
        .execute(&self.pool)
        .await
        .map(|_| ());
        self.note(result)
    }

    /// Atomically claim up to `limit` parked messages for replay.
    pub async fn claim_failed_messages(
        &self,
        limit: i64,
    ) -> Result<Vec<FailedMessage>, StoreError> {
        self.admit()?;
        let result = sqlx::query_as::<_, FailedMessage>(
            "UPDATE failed_messages SET replayed = TRUE
             WHERE id IN (
                 SELECT id FROM failed_messages WHERE NOT replayed ORDER BY id LIMIT $1
             )
             RETURNING *",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await;
        self.note(result)
    }
}

fn status_str(status: AddressStatus) -> &'static str {
    match status {
        AddressStatus::Active => "active",
        AddressStatus::Used => "used",
        AddressStatus::Expired => "expired",
        AddressStatus::Disabled => "disabled",
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_classification() {
        // Plain infrastructure errors are not conflicts.
        let err = StoreError::Database(sqlx::Error::RowNotFound);
        assert!(!err.is_conflict());
        let conflict = StoreError::Conflict("duplicate key".to_string());
        assert!(conflict.is_conflict());
    }

    #[test]
    fn address_status_strings() {
        assert_eq!(status_str(AddressStatus::Active), "active");
        assert_eq!(status_str(AddressStatus::Used), "used");
        assert_eq!(status_str(AddressStatus::Expired), "expired");
        assert_eq!(status_str(AddressStatus::Disabled), "disabled");
    }
}
