//! Balance engine.
//!
//! Every mutation follows the same cycle: read a snapshot, plan the new
//! balance against it, and commit with compare-and-set using the snapshot as
//! the expected value. A conflict means another writer got there first; the
//! cycle is repeated from a fresh read, up to `max_conflict_retries` times.
//!
//! Records are appended only after the balances moved. If the append fails,
//! the applied balance changes are compensated in reverse order before the
//! error is returned, so a failed operation leaves no trace.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use pocketbank_common::{
    max_balance, now, zero_balance, AccountId, Amount, DurationExt, LedgerError, NewRecord, Result,
    TransactionRecord,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::account::Account;
use crate::balance::BalanceChange;
use crate::config::EngineConfig;
use crate::integrity::IntegrityReport;
use crate::memory::{MemoryAccountStore, MemoryLedgerStore};
use crate::store::{AccountStore, CasOutcome, LedgerStore};

/// Cap on the backoff multiplier between attempts.
const MAX_BACKOFF_STEPS: u32 = 16;

/// Both records written by a committed transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecords {
    /// Debit on the sender.
    pub outgoing: TransactionRecord,
    /// Credit on the recipient.
    pub incoming: TransactionRecord,
}

/// Outcome of one read-plan-commit cycle.
enum Cycle<T> {
    /// Balances were written.
    Committed(T),
    /// A compare-and-set on this account lost a race; nothing remains
    /// applied.
    Conflict(AccountId),
    /// A read failed transiently before anything was written.
    ReadFailed(LedgerError),
}

/// Applies cash-ins, cash-outs and transfers against the account and ledger
/// stores.
#[derive(Clone)]
pub struct BalanceEngine {
    accounts: Arc<dyn AccountStore>,
    ledger: Arc<dyn LedgerStore>,
    config: EngineConfig,
}

impl BalanceEngine {
    /// Create an engine over the given stores.
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        ledger: Arc<dyn LedgerStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            accounts,
            ledger,
            config,
        }
    }

    /// Create an engine over fresh in-memory stores.
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(
            Arc::new(MemoryAccountStore::new()),
            Arc::new(MemoryLedgerStore::new()),
            config,
        )
    }

    /// Copy of this engine sharing the same stores but with another storage
    /// timeout.
    pub fn with_storage_timeout(&self, timeout: Duration) -> Self {
        let mut engine = self.clone();
        engine.config.storage_timeout = timeout;
        engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Open a new account with a zero balance.
    #[instrument(skip(self))]
    pub async fn open_account(&self, account_id: &AccountId) -> Result<Account> {
        if !account_id.is_valid() {
            return Err(LedgerError::InvalidRequest {
                message: format!("malformed account id {:?}", account_id.as_str()),
                field: Some("account_id".to_string()),
            });
        }

        let account = self
            .timed(self.accounts.create(account_id, zero_balance()))
            .await?;

        info!(account = %account_id, "Account opened");
        Ok(account)
    }

    /// Get the current balance of an account.
    #[instrument(skip(self))]
    pub async fn get_balance(&self, account_id: &AccountId) -> Result<Decimal> {
        Ok(self.load(account_id).await?.balance)
    }

    /// List an account's records, newest first.
    #[instrument(skip(self))]
    pub async fn list_transactions(&self, account_id: &AccountId) -> Result<Vec<TransactionRecord>> {
        self.load(account_id).await?;
        self.timed(self.ledger.list_for_account(account_id)).await
    }

    /// Deposit money into an account.
    #[instrument(skip(self))]
    pub async fn cash_in(&self, account_id: &AccountId, amount: Decimal) -> Result<TransactionRecord> {
        let amount = Amount::new(amount)?;

        let change = self
            .with_retries(account_id, || {
                self.single_cycle(account_id, amount.as_credit())
            })
            .await?;

        let record = self
            .append_or_rollback(NewRecord::cash_in(account_id.clone(), amount, now()), &[&change])
            .await?;

        info!(
            account = %account_id,
            amount = %amount,
            balance = %change.balance_after,
            record_id = %record.id,
            "Cash-in committed"
        );
        Ok(record)
    }

    /// Withdraw money from an account.
    #[instrument(skip(self))]
    pub async fn cash_out(&self, account_id: &AccountId, amount: Decimal) -> Result<TransactionRecord> {
        let amount = Amount::new(amount)?;

        let change = self
            .with_retries(account_id, || {
                self.single_cycle(account_id, amount.as_debit())
            })
            .await?;

        let record = self
            .append_or_rollback(NewRecord::cash_out(account_id.clone(), amount, now()), &[&change])
            .await?;

        info!(
            account = %account_id,
            amount = %amount,
            balance = %change.balance_after,
            record_id = %record.id,
            "Cash-out committed"
        );
        Ok(record)
    }

    /// Move money from one account to another.
    ///
    /// Checks run in a fixed order before anything is written: amount,
    /// recipient identity, sender existence, recipient existence, then funds.
    /// The two balance writes are applied in ascending account id order
    /// regardless of direction. Once the first write lands, a conflict on the
    /// second retries only the second.
    #[instrument(skip(self))]
    pub async fn transfer(
        &self,
        sender: &AccountId,
        recipient: &AccountId,
        amount: Decimal,
    ) -> Result<TransferRecords> {
        let amount = Amount::new(amount)?;

        if sender == recipient {
            return Err(LedgerError::InvalidRecipient(
                "cannot transfer to the sending account".to_string(),
            ));
        }
        if !recipient.is_valid() {
            return Err(LedgerError::InvalidRecipient(format!(
                "malformed recipient id {:?}",
                recipient.as_str()
            )));
        }

        let (first, second) = self
            .with_retries(sender, || self.transfer_cycle(sender, recipient, amount))
            .await?;

        let batch = NewRecord::transfer_pair(sender.clone(), recipient.clone(), amount, now());
        let ids = match self.ledger.append_batch(batch.clone()).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(
                    sender = %sender,
                    recipient = %recipient,
                    error = %e,
                    "Ledger append failed, rolling back transfer"
                );
                self.rollback(&[&first, &second]).await;
                return Err(e);
            }
        };

        let mut committed = batch
            .records
            .into_iter()
            .zip(ids)
            .map(|(record, id)| record.into_record(id));

        let (outgoing, incoming) = match (committed.next(), committed.next()) {
            (Some(outgoing), Some(incoming)) => (outgoing, incoming),
            _ => {
                return Err(LedgerError::StorageUnavailable(
                    "ledger did not return an id for every transfer record".to_string(),
                ))
            }
        };

        info!(
            sender = %sender,
            recipient = %recipient,
            amount = %amount,
            outgoing_id = %outgoing.id,
            incoming_id = %incoming.id,
            "Transfer committed"
        );
        Ok(TransferRecords { outgoing, incoming })
    }

    /// Compare every balance with the sum of its account's records.
    #[instrument(skip(self))]
    pub async fn verify_integrity(&self) -> Result<IntegrityReport> {
        let accounts = self.timed(self.accounts.list_accounts()).await?;
        let records = self.timed(self.ledger.list_all()).await?;
        let report = IntegrityReport::build(&accounts, &records);

        if report.is_consistent() {
            info!(
                accounts = report.accounts_checked,
                records = report.records_checked,
                total_balance = %report.total_balance,
                "Ledger consistent"
            );
        } else {
            warn!(
                discrepancies = report.discrepancies.len(),
                transfer_imbalance = %report.transfer_imbalance,
                "Ledger inconsistent"
            );
        }

        Ok(report)
    }

    async fn timed<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.config.storage_timeout, call)
            .await
            .map_err(|_| {
                LedgerError::StorageUnavailable(format!(
                    "storage call timed out after {} ms",
                    self.config.storage_timeout.as_millis_u64()
                ))
            })?
    }

    async fn load(&self, account_id: &AccountId) -> Result<Account> {
        self.timed(self.accounts.get(account_id)).await
    }

    async fn backoff(&self, attempt: u32) {
        tokio::task::yield_now().await;
        let delay = self.config.retry_backoff * attempt.min(MAX_BACKOFF_STEPS);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Run `cycle` until it commits, fails permanently, or the retry budget
    /// runs out.
    async fn with_retries<T, F, Fut>(&self, account_id: &AccountId, mut cycle: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Cycle<T>>>,
    {
        let attempts = self.config.max_conflict_retries;
        let mut last_error = None;
        let mut contended = account_id.clone();

        for attempt in 1..=attempts {
            match cycle().await? {
                Cycle::Committed(value) => return Ok(value),
                Cycle::Conflict(account) => {
                    debug!(account = %account, attempt, "Balance changed concurrently, retrying");
                    contended = account;
                    last_error = None;
                }
                Cycle::ReadFailed(e) => {
                    debug!(account = %account_id, attempt, error = %e, "Read failed, retrying");
                    last_error = Some(e);
                }
            }
            if attempt < attempts {
                self.backoff(attempt).await;
            }
        }

        Err(last_error.unwrap_or(LedgerError::TooManyConflicts {
            account: contended,
            attempts,
        }))
    }

    async fn single_cycle(&self, account_id: &AccountId, delta: Decimal) -> Result<Cycle<BalanceChange>> {
        let account = match self.load(account_id).await {
            Ok(account) => account,
            Err(e) if e.is_retryable() => return Ok(Cycle::ReadFailed(e)),
            Err(e) => return Err(e),
        };

        let change = BalanceChange::plan(account_id, account.balance, delta)?;

        match self.apply(&change).await? {
            CasOutcome::Applied => Ok(Cycle::Committed(change)),
            CasOutcome::Conflict => Ok(Cycle::Conflict(account_id.clone())),
        }
    }

    async fn transfer_cycle(
        &self,
        sender: &AccountId,
        recipient: &AccountId,
        amount: Amount,
    ) -> Result<Cycle<(BalanceChange, BalanceChange)>> {
        let sender_account = match self.load(sender).await {
            Ok(account) => account,
            Err(e) if e.is_retryable() => return Ok(Cycle::ReadFailed(e)),
            Err(e) => return Err(e),
        };
        let recipient_account = match self.load(recipient).await {
            Ok(account) => account,
            Err(LedgerError::AccountNotFound(id)) => return Err(LedgerError::RecipientNotFound(id)),
            Err(e) if e.is_retryable() => return Ok(Cycle::ReadFailed(e)),
            Err(e) => return Err(e),
        };

        let debit = BalanceChange::plan(sender, sender_account.balance, amount.as_debit())?;
        let credit = BalanceChange::plan(recipient, recipient_account.balance, amount.as_credit())?;

        let (first, second) = if sender < recipient {
            (debit, credit)
        } else {
            (credit, debit)
        };

        if self.apply(&first).await? == CasOutcome::Conflict {
            return Ok(Cycle::Conflict(first.account_id));
        }

        let second = self.settle_second_leg(&first, second).await?;
        Ok(Cycle::Committed((first, second)))
    }

    /// Apply the second leg of a transfer while the first stays applied.
    ///
    /// A conflict re-reads only this account and re-plans the same delta, so
    /// funds already credited by the first leg are never taken back because
    /// of an unrelated write. The first leg is compensated only when the
    /// second cannot be applied at all: the sender is short on the fresh
    /// snapshot, the store fails, or the retry budget runs out.
    async fn settle_second_leg(
        &self,
        first: &BalanceChange,
        mut second: BalanceChange,
    ) -> Result<BalanceChange> {
        let attempts = self.config.max_conflict_retries;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.apply(&second).await {
                Ok(CasOutcome::Applied) => return Ok(second),
                Ok(CasOutcome::Conflict) => {
                    debug!(
                        account = %second.account_id,
                        debit = second.is_debit(),
                        attempt,
                        "Second transfer leg conflicted, retrying"
                    );
                    last_error = None;
                }
                Err(e) => {
                    self.rollback(&[first]).await;
                    return Err(e);
                }
            }
            if attempt == attempts {
                break;
            }

            self.backoff(attempt).await;
            match self.load(&second.account_id).await {
                Ok(account) => {
                    match BalanceChange::plan(&second.account_id, account.balance, second.delta) {
                        Ok(change) => second = change,
                        Err(e) => {
                            self.rollback(&[first]).await;
                            return Err(e);
                        }
                    }
                }
                Err(e) if e.is_retryable() => last_error = Some(e),
                Err(e) => {
                    self.rollback(&[first]).await;
                    return Err(e);
                }
            }
        }

        self.rollback(&[first]).await;
        Err(last_error.unwrap_or(LedgerError::TooManyConflicts {
            account: second.account_id,
            attempts,
        }))
    }

    async fn apply(&self, change: &BalanceChange) -> Result<CasOutcome> {
        self.accounts
            .compare_and_set(&change.account_id, change.balance_before, change.balance_after)
            .await
    }

    async fn append_or_rollback(
        &self,
        record: NewRecord,
        changes: &[&BalanceChange],
    ) -> Result<TransactionRecord> {
        match self.ledger.append(record.clone()).await {
            Ok(id) => Ok(record.into_record(id)),
            Err(e) => {
                warn!(
                    account = %record.account_id,
                    kind = record.kind.as_str(),
                    error = %e,
                    "Ledger append failed, rolling back balance"
                );
                self.rollback(changes).await;
                Err(e)
            }
        }
    }

    /// Undo applied changes, last applied first.
    async fn rollback(&self, changes: &[&BalanceChange]) {
        for change in changes.iter().rev() {
            // Failures are logged inside; keep undoing the rest.
            let _ = self.compensate(change).await;
        }
    }

    /// Subtract an applied delta again.
    ///
    /// Other writers may have moved the balance since, so the undo is itself a
    /// compare-and-set loop over fresh reads. A store error is not retried
    /// because the write may have landed.
    async fn compensate(&self, change: &BalanceChange) -> Result<()> {
        let account_id = &change.account_id;
        let mut current = change.balance_after;

        for attempt in 1..=self.config.max_compensation_retries {
            let restored = current
                .checked_sub(change.delta)
                .filter(|balance| *balance >= Decimal::ZERO && *balance <= max_balance());
            let Some(restored) = restored else {
                error!(
                    account = %account_id,
                    delta = %change.delta,
                    balance = %current,
                    "Cannot compensate, balance moved out of range"
                );
                return Err(LedgerError::StorageUnavailable(format!(
                    "could not undo change of {} on {}",
                    change.delta, account_id
                )));
            };

            match self.accounts.compare_and_set(account_id, current, restored).await {
                Ok(CasOutcome::Applied) => {
                    warn!(account = %account_id, delta = %change.delta, attempt, "Balance change compensated");
                    return Ok(());
                }
                Ok(CasOutcome::Conflict) => {}
                Err(e) => {
                    error!(account = %account_id, delta = %change.delta, error = %e, "Compensation failed");
                    return Err(e);
                }
            }

            self.backoff(attempt).await;
            match self.load(account_id).await {
                Ok(account) => current = account.balance,
                Err(e) if e.is_retryable() => {}
                Err(e) => {
                    error!(account = %account_id, delta = %change.delta, error = %e, "Compensation failed");
                    return Err(e);
                }
            }
        }

        error!(
            account = %account_id,
            delta = %change.delta,
            attempts = self.config.max_compensation_retries,
            "Compensation retries exhausted"
        );
        Err(LedgerError::TooManyConflicts {
            account: account_id.clone(),
            attempts: self.config.max_compensation_retries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pocketbank_common::{RecordBatch, RecordId, TransactionKind};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::sync::Notify;
    use tokio_test::assert_ok;

    fn id(name: &str) -> AccountId {
        AccountId::new(name)
    }

    async fn engine_with(accounts: &[(&str, Decimal)]) -> BalanceEngine {
        let engine = BalanceEngine::in_memory(EngineConfig::default());
        for (name, balance) in accounts {
            engine.open_account(&id(name)).await.unwrap();
            if *balance > Decimal::ZERO {
                engine.cash_in(&id(name), *balance).await.unwrap();
            }
        }
        engine
    }

    async fn assert_consistent(engine: &BalanceEngine) {
        let report = engine.verify_integrity().await.unwrap();
        assert!(report.is_consistent(), "inconsistent ledger: {:?}", report);
    }

    /// Ledger whose appends always fail.
    struct FailingLedger {
        inner: MemoryLedgerStore,
    }

    #[async_trait]
    impl LedgerStore for FailingLedger {
        async fn append(&self, _record: NewRecord) -> Result<RecordId> {
            Err(LedgerError::StorageUnavailable("disk full".to_string()))
        }

        async fn append_batch(&self, _batch: RecordBatch) -> Result<Vec<RecordId>> {
            Err(LedgerError::StorageUnavailable("disk full".to_string()))
        }

        async fn list_for_account(&self, id: &AccountId) -> Result<Vec<TransactionRecord>> {
            self.inner.list_for_account(id).await
        }

        async fn list_all(&self) -> Result<Vec<TransactionRecord>> {
            self.inner.list_all().await
        }
    }

    /// Account store that reports conflicts on one account a fixed number of
    /// times, and can delay reads.
    struct ContendedStore {
        inner: MemoryAccountStore,
        contended: AccountId,
        conflicts_left: AtomicU32,
        read_delay: Duration,
    }

    impl ContendedStore {
        fn new(contended: &str, conflicts: u32) -> Self {
            Self {
                inner: MemoryAccountStore::new(),
                contended: id(contended),
                conflicts_left: AtomicU32::new(conflicts),
                read_delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl AccountStore for ContendedStore {
        async fn get(&self, id: &AccountId) -> Result<Account> {
            if !self.read_delay.is_zero() {
                tokio::time::sleep(self.read_delay).await;
            }
            self.inner.get(id).await
        }

        async fn compare_and_set(
            &self,
            id: &AccountId,
            expected: Decimal,
            new_balance: Decimal,
        ) -> Result<CasOutcome> {
            if id == &self.contended
                && self
                    .conflicts_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Ok(CasOutcome::Conflict);
            }
            self.inner.compare_and_set(id, expected, new_balance).await
        }

        async fn create(&self, id: &AccountId, initial_balance: Decimal) -> Result<Account> {
            self.inner.create(id, initial_balance).await
        }

        async fn list_accounts(&self) -> Result<Vec<Account>> {
            self.inner.list_accounts().await
        }
    }

    /// Account store that parks the next compare-and-set on one account
    /// until released.
    struct GatedStore {
        inner: MemoryAccountStore,
        gated: AccountId,
        armed: AtomicBool,
        reached: Notify,
        release: Notify,
    }

    impl GatedStore {
        fn new(gated: &str) -> Self {
            Self {
                inner: MemoryAccountStore::new(),
                gated: id(gated),
                armed: AtomicBool::new(false),
                reached: Notify::new(),
                release: Notify::new(),
            }
        }

        fn arm(&self) {
            self.armed.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl AccountStore for GatedStore {
        async fn get(&self, id: &AccountId) -> Result<Account> {
            self.inner.get(id).await
        }

        async fn compare_and_set(
            &self,
            id: &AccountId,
            expected: Decimal,
            new_balance: Decimal,
        ) -> Result<CasOutcome> {
            if id == &self.gated && self.armed.swap(false, Ordering::SeqCst) {
                self.reached.notify_one();
                self.release.notified().await;
            }
            self.inner.compare_and_set(id, expected, new_balance).await
        }

        async fn create(&self, id: &AccountId, initial_balance: Decimal) -> Result<Account> {
            self.inner.create(id, initial_balance).await
        }

        async fn list_accounts(&self) -> Result<Vec<Account>> {
            self.inner.list_accounts().await
        }
    }

    async fn gated_engine(gated: &str) -> (Arc<GatedStore>, BalanceEngine) {
        let store = Arc::new(GatedStore::new(gated));
        let engine = BalanceEngine::new(
            store.clone(),
            Arc::new(MemoryLedgerStore::new()),
            EngineConfig::default(),
        );
        for name in ["alice", "bob"] {
            engine.open_account(&id(name)).await.unwrap();
        }
        (store, engine)
    }

    #[tokio::test]
    async fn test_walkthrough() {
        let engine = engine_with(&[("alice", dec!(100.00)), ("bob", dec!(0))]).await;
        let alice = id("alice");
        let bob = id("bob");

        let record = engine.cash_in(&alice, dec!(50.00)).await.unwrap();
        assert_eq!(record.kind, TransactionKind::CashIn);
        assert_eq!(record.amount, dec!(50.00));
        assert_eq!(engine.get_balance(&alice).await.unwrap(), dec!(150.00));
        assert_eq!(engine.list_transactions(&alice).await.unwrap().len(), 2);

        let transfer = engine.transfer(&alice, &bob, dec!(150.00)).await.unwrap();
        assert_eq!(transfer.outgoing.amount, dec!(-150.00));
        assert_eq!(transfer.outgoing.counterparty_id, Some(bob.clone()));
        assert_eq!(transfer.incoming.amount, dec!(150.00));
        assert_eq!(transfer.incoming.account_id, bob);
        assert_eq!(engine.get_balance(&alice).await.unwrap().to_string(), "0.00");
        assert_eq!(engine.get_balance(&bob).await.unwrap(), dec!(150.00));

        let err = engine.cash_out(&alice, dec!(0.01)).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert_eq!(engine.get_balance(&alice).await.unwrap(), dec!(0.00));

        let history = engine.list_transactions(&alice).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].kind, TransactionKind::TransferOut);
        assert_consistent(&engine).await;
    }

    #[tokio::test]
    async fn test_cash_out_exact_balance_boundary() {
        let engine = engine_with(&[("alice", dec!(25.00))]).await;
        let alice = id("alice");

        let err = engine.cash_out(&alice, dec!(25.01)).await.unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientFunds {
                required: "25.01".to_string(),
                available: "25.00".to_string(),
            }
        );

        assert_ok!(engine.cash_out(&alice, dec!(25.00)).await);
        assert_eq!(engine.get_balance(&alice).await.unwrap(), Decimal::ZERO);
        assert_consistent(&engine).await;
    }

    #[tokio::test]
    async fn test_invalid_amounts_touch_nothing() {
        let engine = engine_with(&[("alice", dec!(10)), ("bob", dec!(0))]).await;

        for amount in [dec!(-5.00), dec!(0), dec!(0.001)] {
            let err = engine.transfer(&id("alice"), &id("bob"), amount).await.unwrap_err();
            assert!(matches!(err, LedgerError::InvalidAmount(_)));
            let err = engine.cash_in(&id("alice"), amount).await.unwrap_err();
            assert!(matches!(err, LedgerError::InvalidAmount(_)));
        }

        // Amount is checked before the accounts are looked up.
        let err = engine.cash_out(&id("nobody"), dec!(0)).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));

        assert_eq!(engine.get_balance(&id("alice")).await.unwrap(), dec!(10));
        assert_eq!(engine.list_transactions(&id("alice")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transfer_validation_order() {
        let engine = engine_with(&[("alice", dec!(10))]).await;

        let err = engine.transfer(&id("alice"), &id("alice"), dec!(1)).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidRecipient(_)));

        let err = engine.transfer(&id("alice"), &id("bad id!"), dec!(1)).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidRecipient(_)));

        let err = engine.transfer(&id("alice"), &id("carol"), dec!(1)).await.unwrap_err();
        assert_eq!(err, LedgerError::RecipientNotFound(id("carol")));

        // Sender existence is checked before recipient existence.
        let err = engine.transfer(&id("dave"), &id("carol"), dec!(1)).await.unwrap_err();
        assert_eq!(err, LedgerError::AccountNotFound(id("dave")));

        assert_eq!(engine.get_balance(&id("alice")).await.unwrap(), dec!(10));
    }

    #[tokio::test]
    async fn test_missing_account_errors() {
        let engine = BalanceEngine::in_memory(EngineConfig::default());
        let ghost = id("ghost");

        assert_eq!(
            engine.cash_in(&ghost, dec!(1)).await.unwrap_err(),
            LedgerError::AccountNotFound(ghost.clone())
        );
        assert_eq!(
            engine.get_balance(&ghost).await.unwrap_err(),
            LedgerError::AccountNotFound(ghost.clone())
        );
        assert_eq!(
            engine.list_transactions(&ghost).await.unwrap_err(),
            LedgerError::AccountNotFound(ghost.clone())
        );
    }

    #[tokio::test]
    async fn test_open_account() {
        let engine = BalanceEngine::in_memory(EngineConfig::default());

        let account = engine.open_account(&id("alice")).await.unwrap();
        assert_eq!(account.balance.to_string(), "0.00");

        assert_eq!(
            engine.open_account(&id("alice")).await.unwrap_err(),
            LedgerError::AccountAlreadyExists(id("alice"))
        );
        assert!(matches!(
            engine.open_account(&id("")).await.unwrap_err(),
            LedgerError::InvalidRequest { .. }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_cash_outs_never_overdraw() {
        let engine = engine_with(&[("alice", dec!(50.00))]).await;

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.cash_out(&id("alice"), dec!(5.00)).await })
            })
            .collect();

        let results: Vec<_> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let successes = results.iter().filter(|r| r.is_ok()).count();
        let insufficient = results
            .iter()
            .filter(|r| matches!(r, Err(LedgerError::InsufficientFunds { .. })))
            .count();

        assert_eq!(successes, 10);
        assert_eq!(insufficient, 10);
        assert_eq!(engine.get_balance(&id("alice")).await.unwrap(), Decimal::ZERO);
        assert_consistent(&engine).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_opposite_transfers_conserve_money() {
        let config = EngineConfig {
            max_conflict_retries: 1_000,
            max_compensation_retries: 1_000,
            ..EngineConfig::default()
        };
        let engine = BalanceEngine::in_memory(config);
        for name in ["alice", "bob"] {
            engine.open_account(&id(name)).await.unwrap();
            engine.cash_in(&id(name), dec!(1000.00)).await.unwrap();
        }

        let tasks: Vec<_> = (0..100)
            .map(|i| {
                let engine = engine.clone();
                let (from, to) = if i % 2 == 0 { ("alice", "bob") } else { ("bob", "alice") };
                tokio::spawn(async move { engine.transfer(&id(from), &id(to), dec!(1.00)).await })
            })
            .collect();

        for joined in futures::future::join_all(tasks).await {
            assert_ok!(joined.unwrap());
        }

        let alice = engine.get_balance(&id("alice")).await.unwrap();
        let bob = engine.get_balance(&id("bob")).await.unwrap();
        assert_eq!(alice, dec!(1000.00));
        assert_eq!(bob, dec!(1000.00));
        assert_consistent(&engine).await;
    }

    #[tokio::test]
    async fn test_failed_append_rolls_back_balance() {
        let engine = BalanceEngine::new(
            Arc::new(MemoryAccountStore::new()),
            Arc::new(FailingLedger {
                inner: MemoryLedgerStore::new(),
            }),
            EngineConfig::default(),
        );
        engine.open_account(&id("alice")).await.unwrap();
        engine.open_account(&id("bob")).await.unwrap();

        let err = engine.cash_in(&id("alice"), dec!(10)).await.unwrap_err();
        assert!(matches!(err, LedgerError::StorageUnavailable(_)));
        assert_eq!(engine.get_balance(&id("alice")).await.unwrap(), Decimal::ZERO);
        assert_consistent(&engine).await;
    }

    #[tokio::test]
    async fn test_failed_transfer_append_rolls_back_both_sides() {
        let accounts = Arc::new(MemoryAccountStore::new());
        accounts.create(&id("alice"), dec!(40.00)).await.unwrap();
        accounts.create(&id("bob"), dec!(5.00)).await.unwrap();

        let engine = BalanceEngine::new(
            accounts,
            Arc::new(FailingLedger {
                inner: MemoryLedgerStore::new(),
            }),
            EngineConfig::default(),
        );

        // bob sorts after alice, so the credit on alice is applied first.
        let err = engine.transfer(&id("bob"), &id("alice"), dec!(5.00)).await.unwrap_err();
        assert!(matches!(err, LedgerError::StorageUnavailable(_)));
        assert_eq!(engine.get_balance(&id("alice")).await.unwrap(), dec!(40.00));
        assert_eq!(engine.get_balance(&id("bob")).await.unwrap(), dec!(5.00));
    }

    #[tokio::test]
    async fn test_second_leg_conflict_retries_that_leg() {
        let store = Arc::new(ContendedStore::new("bob", 2));
        let engine = BalanceEngine::new(
            store.clone(),
            Arc::new(MemoryLedgerStore::new()),
            EngineConfig::default(),
        );
        engine.open_account(&id("alice")).await.unwrap();
        engine.open_account(&id("bob")).await.unwrap();
        engine.cash_in(&id("alice"), dec!(30)).await.unwrap();

        engine.transfer(&id("alice"), &id("bob"), dec!(30)).await.unwrap();

        assert_eq!(store.conflicts_left.load(Ordering::SeqCst), 0);
        assert_eq!(engine.get_balance(&id("alice")).await.unwrap(), Decimal::ZERO);
        assert_eq!(engine.get_balance(&id("bob")).await.unwrap(), dec!(30));
        assert_consistent(&engine).await;
    }

    #[tokio::test]
    async fn test_spent_credit_survives_sender_conflict() {
        let (store, engine) = gated_engine("bob").await;
        engine.cash_in(&id("bob"), dec!(5.00)).await.unwrap();
        store.arm();

        // alice sorts first, so she is credited before bob is debited.
        let transfer = tokio::spawn({
            let engine = engine.clone();
            async move { engine.transfer(&id("bob"), &id("alice"), dec!(5.00)).await }
        });
        store.reached.notified().await;

        assert_eq!(engine.get_balance(&id("alice")).await.unwrap(), dec!(5.00));
        assert_ok!(engine.cash_out(&id("alice"), dec!(5.00)).await);
        assert_ok!(engine.cash_in(&id("bob"), dec!(1.00)).await);
        store.release.notify_one();

        assert_ok!(transfer.await.unwrap());
        assert_eq!(engine.get_balance(&id("alice")).await.unwrap(), Decimal::ZERO);
        assert_eq!(engine.get_balance(&id("bob")).await.unwrap(), dec!(1.00));
        assert_consistent(&engine).await;
    }

    #[tokio::test]
    async fn test_sender_drained_mid_transfer_undoes_credit() {
        let (store, engine) = gated_engine("bob").await;
        engine.cash_in(&id("bob"), dec!(5.00)).await.unwrap();
        store.arm();

        let transfer = tokio::spawn({
            let engine = engine.clone();
            async move { engine.transfer(&id("bob"), &id("alice"), dec!(5.00)).await }
        });
        store.reached.notified().await;

        assert_ok!(engine.cash_out(&id("bob"), dec!(5.00)).await);
        store.release.notify_one();

        let err = transfer.await.unwrap().unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert_eq!(engine.get_balance(&id("alice")).await.unwrap(), Decimal::ZERO);
        assert_eq!(engine.get_balance(&id("bob")).await.unwrap(), Decimal::ZERO);
        assert!(engine.list_transactions(&id("alice")).await.unwrap().is_empty());
        assert_consistent(&engine).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_recipient_spending_incoming_transfers_stays_consistent() {
        let config = EngineConfig {
            max_conflict_retries: 1_000,
            max_compensation_retries: 1_000,
            ..EngineConfig::default()
        };
        let engine = BalanceEngine::in_memory(config);
        engine.open_account(&id("alice")).await.unwrap();
        let senders = ["bob", "carol", "dave"];
        for name in senders {
            engine.open_account(&id(name)).await.unwrap();
            engine.cash_in(&id(name), dec!(100.00)).await.unwrap();
        }

        // alice sorts before every sender, so each transfer credits her first.
        let transfers: Vec<_> = (0..60)
            .map(|i| {
                let engine = engine.clone();
                let from = senders[i % senders.len()];
                tokio::spawn(async move { engine.transfer(&id(from), &id("alice"), dec!(1.00)).await })
            })
            .collect();
        let cash_outs: Vec<_> = (0..60)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.cash_out(&id("alice"), dec!(1.00)).await })
            })
            .collect();

        for joined in futures::future::join_all(transfers).await {
            assert_ok!(joined.unwrap());
        }
        let withdrawn = futures::future::join_all(cash_outs)
            .await
            .into_iter()
            .filter(|joined| matches!(joined, Ok(Ok(_))))
            .count();

        let remaining = engine.get_balance(&id("alice")).await.unwrap();
        assert_eq!(remaining + Decimal::from(withdrawn as u64), dec!(60.00));
        if remaining > Decimal::ZERO {
            assert_ok!(engine.cash_out(&id("alice"), remaining).await);
        }
        assert_eq!(engine.get_balance(&id("alice")).await.unwrap(), Decimal::ZERO);

        let mut senders_total = Decimal::ZERO;
        for name in senders {
            senders_total += engine.get_balance(&id(name)).await.unwrap();
        }
        assert_eq!(senders_total, dec!(240.00));
        assert_consistent(&engine).await;
    }

    #[tokio::test]
    async fn test_recipient_conflicts_are_reported_on_recipient() {
        let config = EngineConfig {
            max_conflict_retries: 3,
            retry_backoff: Duration::ZERO,
            ..EngineConfig::default()
        };
        let engine = BalanceEngine::new(
            Arc::new(ContendedStore::new("bob", u32::MAX)),
            Arc::new(MemoryLedgerStore::new()),
            config,
        );
        engine.open_account(&id("alice")).await.unwrap();
        engine.open_account(&id("bob")).await.unwrap();
        engine.cash_in(&id("alice"), dec!(10)).await.unwrap();

        let err = engine.transfer(&id("alice"), &id("bob"), dec!(4)).await.unwrap_err();
        assert_eq!(
            err,
            LedgerError::TooManyConflicts {
                account: id("bob"),
                attempts: 3,
            }
        );
        assert_eq!(engine.get_balance(&id("alice")).await.unwrap(), dec!(10));
        assert_eq!(engine.get_balance(&id("bob")).await.unwrap(), Decimal::ZERO);
        assert_consistent(&engine).await;
    }

    #[tokio::test]
    async fn test_amounts_beyond_storage_range_are_rejected() {
        let engine = engine_with(&[("alice", dec!(0))]).await;

        let err = engine.cash_in(&id("alice"), Decimal::MAX).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));

        assert_ok!(engine.cash_in(&id("alice"), max_balance()).await);
        let err = engine.cash_in(&id("alice"), dec!(0.01)).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));

        assert_eq!(engine.get_balance(&id("alice")).await.unwrap(), max_balance());
        assert_eq!(engine.list_transactions(&id("alice")).await.unwrap().len(), 1);
        assert_consistent(&engine).await;
    }

    #[tokio::test]
    async fn test_conflict_budget_exhausted() {
        let config = EngineConfig {
            max_conflict_retries: 3,
            retry_backoff: Duration::ZERO,
            ..EngineConfig::default()
        };
        let engine = BalanceEngine::new(
            Arc::new(ContendedStore::new("alice", u32::MAX)),
            Arc::new(MemoryLedgerStore::new()),
            config,
        );
        engine.open_account(&id("alice")).await.unwrap();

        let err = engine.cash_in(&id("alice"), dec!(1)).await.unwrap_err();
        assert_eq!(
            err,
            LedgerError::TooManyConflicts {
                account: id("alice"),
                attempts: 3,
            }
        );
        assert!(err.is_retryable());
        assert_consistent(&engine).await;
    }

    #[tokio::test]
    async fn test_slow_reads_time_out() {
        let mut store = ContendedStore::new("nobody", 0);
        store.read_delay = Duration::from_millis(200);
        let store = Arc::new(store);
        store.create(&id("alice"), dec!(10)).await.unwrap();

        let config = EngineConfig {
            max_conflict_retries: 2,
            ..EngineConfig::default()
        };
        let engine = BalanceEngine::new(store, Arc::new(MemoryLedgerStore::new()), config)
            .with_storage_timeout(Duration::from_millis(20));
        assert_eq!(engine.config().storage_timeout, Duration::from_millis(20));

        let err = engine.get_balance(&id("alice")).await.unwrap_err();
        assert!(matches!(err, LedgerError::StorageUnavailable(_)));

        let err = engine.cash_out(&id("alice"), dec!(1)).await.unwrap_err();
        assert!(matches!(err, LedgerError::StorageUnavailable(_)));
    }

    #[derive(Debug, Clone)]
    enum Op {
        CashIn(usize, i64),
        CashOut(usize, i64),
        Transfer(usize, usize, i64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..3usize, 1..20_000i64).prop_map(|(a, cents)| Op::CashIn(a, cents)),
            (0..3usize, 1..20_000i64).prop_map(|(a, cents)| Op::CashOut(a, cents)),
            (0..3usize, 0..3usize, 1..20_000i64).prop_map(|(a, b, cents)| Op::Transfer(a, b, cents)),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_balances_track_ledger(ops in proptest::collection::vec(op_strategy(), 1..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async move {
                let names = ["acct-a", "acct-b", "acct-c"];
                let engine = BalanceEngine::in_memory(EngineConfig::default());
                let mut model: HashMap<usize, Decimal> = HashMap::new();
                for (i, name) in names.iter().enumerate() {
                    engine.open_account(&id(name)).await.unwrap();
                    model.insert(i, Decimal::ZERO);
                }

                for op in ops {
                    match op {
                        Op::CashIn(a, cents) => {
                            let amount = Decimal::new(cents, 2);
                            prop_assert!(engine.cash_in(&id(names[a]), amount).await.is_ok());
                            *model.entry(a).or_default() += amount;
                        }
                        Op::CashOut(a, cents) => {
                            let amount = Decimal::new(cents, 2);
                            let result = engine.cash_out(&id(names[a]), amount).await;
                            prop_assert_eq!(result.is_ok(), model[&a] >= amount);
                            if result.is_ok() {
                                *model.entry(a).or_default() -= amount;
                            }
                        }
                        Op::Transfer(a, b, cents) => {
                            let amount = Decimal::new(cents, 2);
                            let result = engine.transfer(&id(names[a]), &id(names[b]), amount).await;
                            if a == b {
                                prop_assert!(matches!(result, Err(LedgerError::InvalidRecipient(_))));
                            } else {
                                prop_assert_eq!(result.is_ok(), model[&a] >= amount);
                                if result.is_ok() {
                                    *model.entry(a).or_default() -= amount;
                                    *model.entry(b).or_default() += amount;
                                }
                            }
                        }
                    }
                }

                for (i, name) in names.iter().enumerate() {
                    let balance = engine.get_balance(&id(name)).await.unwrap();
                    prop_assert!(balance >= Decimal::ZERO);
                    prop_assert_eq!(balance, model[&i]);
                }
                let report = engine.verify_integrity().await.unwrap();
                prop_assert!(report.is_consistent());
                Ok(())
            })?;
        }
    }
}
