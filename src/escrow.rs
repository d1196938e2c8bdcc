//! Escrow gateway capability.
//!
//! The on-chain escrow is opaque to this crate. Sessions lock a passenger's
//! fare against a booking and release it to the driver once the ride is
//! completed; [`LedgerGateway`] simulates the contract in-process.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::amount::MicroAlgos;
use crate::model::{BookingId, PartyRole, TxnId, WalletAddress};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("escrow for booking {0} is not locked")]
    NotLocked(BookingId),
    #[error("escrow for booking {0} is already locked")]
    AlreadyLocked(BookingId),
    #[error("booking {0} has no {1} wallet")]
    MissingWallet(BookingId, PartyRole),
    #[error("gateway call timed out after {0:?}")]
    Timeout(Duration),
    #[error("gateway rejected the call: {0}")]
    Rejected(String),
}

impl GatewayError {
    /// Whether funds may be held for the booking even though the lock call
    /// failed: the reply was lost, or another lock already holds the booking.
    pub fn may_hold_funds(&self) -> bool {
        matches!(self, GatewayError::Timeout(_) | GatewayError::AlreadyLocked(_))
    }
}

/// Lock and release funds against a booking.
///
/// Calls are fallible and may be retried; the booking id is passed as an
/// idempotency hint. Repeating a lock with the same payer, payee and amount
/// returns the original transaction.
pub trait EscrowGateway: Send + Sync + 'static {
    fn lock(
        &self,
        booking: BookingId,
        payer: &WalletAddress,
        payee: &WalletAddress,
        amount: MicroAlgos,
    ) -> impl Future<Output = Result<TxnId, GatewayError>> + Send;

    fn release(
        &self,
        payee: &WalletAddress,
        booking: BookingId,
    ) -> impl Future<Output = Result<TxnId, GatewayError>> + Send;
}

#[derive(Debug, Clone)]
struct Hold {
    lock_txn: TxnId,
    payer: WalletAddress,
    payee: WalletAddress,
    amount: MicroAlgos,
    release_txn: Option<TxnId>,
}

#[derive(Debug, Default)]
struct Ledger {
    holds: HashMap<BookingId, Hold>,
    next_txn: u64,
}

impl Ledger {
    fn next_txn(&mut self, prefix: &str) -> TxnId {
        self.next_txn += 1;
        TxnId::new(format!("{prefix}-{:06}", self.next_txn))
    }
}

/// In-process stand-in for the escrow contract.
#[derive(Debug, Default)]
pub struct LedgerGateway {
    ledger: Mutex<Ledger>,
    release_calls: AtomicUsize,
    failing_releases: AtomicUsize,
    lost_lock_replies: AtomicUsize,
    release_delay: Option<Duration>,
}

impl LedgerGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every release call, simulating a slow network.
    pub fn with_release_delay(mut self, delay: Duration) -> Self {
        self.release_delay = Some(delay);
        self
    }

    /// Make the next `count` release calls fail.
    pub fn fail_next_releases(&self, count: usize) {
        self.failing_releases.store(count, Ordering::SeqCst);
    }

    /// Apply the next `count` locks but never answer them, as if the reply
    /// was lost on the way back.
    pub fn lose_next_lock_replies(&self, count: usize) {
        self.lost_lock_replies.store(count, Ordering::SeqCst);
    }

    /// Number of release calls received, successful or not.
    pub fn release_calls(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }

    pub async fn locked_amount(&self, booking: BookingId) -> Option<MicroAlgos> {
        let ledger = self.ledger.lock().await;
        ledger
            .holds
            .get(&booking)
            .filter(|h| h.release_txn.is_none())
            .map(|h| h.amount)
    }

    /// Total amount paid out to `payee` so far.
    pub async fn released_to(&self, payee: &WalletAddress) -> MicroAlgos {
        let ledger = self.ledger.lock().await;
        ledger
            .holds
            .values()
            .filter(|h| &h.payee == payee && h.release_txn.is_some())
            .fold(MicroAlgos::default(), |acc, h| acc + h.amount)
    }
}

impl EscrowGateway for LedgerGateway {
    async fn lock(
        &self,
        booking: BookingId,
        payer: &WalletAddress,
        payee: &WalletAddress,
        amount: MicroAlgos,
    ) -> Result<TxnId, GatewayError> {
        let mut ledger = self.ledger.lock().await;
        if let Some(hold) = ledger.holds.get(&booking) {
            if &hold.payer == payer && &hold.payee == payee && hold.amount == amount {
                debug!(booking = %booking, txn = %hold.lock_txn, "escrow already locked");
                return Ok(hold.lock_txn.clone());
            }
            return Err(GatewayError::AlreadyLocked(booking));
        }
        if amount < MicroAlgos::MIN_ESCROW {
            return Err(GatewayError::Rejected(format!(
                "amount {amount} below minimum {}",
                MicroAlgos::MIN_ESCROW
            )));
        }

        let txn = ledger.next_txn("LOCK");
        ledger.holds.insert(
            booking,
            Hold {
                lock_txn: txn.clone(),
                payer: payer.clone(),
                payee: payee.clone(),
                amount,
                release_txn: None,
            },
        );
        drop(ledger);
        info!(booking = %booking, payer = %payer, amount = %amount, txn = %txn, "escrow locked");

        let lost = self
            .lost_lock_replies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if lost.is_ok() {
            std::future::pending::<()>().await;
        }
        Ok(txn)
    }

    async fn release(
        &self,
        payee: &WalletAddress,
        booking: BookingId,
    ) -> Result<TxnId, GatewayError> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.release_delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failing_releases
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(GatewayError::Rejected("network unreachable".to_string()));
        }

        let mut ledger = self.ledger.lock().await;
        let Some(hold) = ledger.holds.get(&booking).cloned() else {
            return Err(GatewayError::NotLocked(booking));
        };
        if &hold.payee != payee {
            return Err(GatewayError::Rejected(format!(
                "payee {payee} does not match escrow payee {}",
                hold.payee
            )));
        }
        if let Some(txn) = hold.release_txn {
            debug!(booking = %booking, txn = %txn, "escrow already released");
            return Ok(txn);
        }

        let txn = ledger.next_txn("RELEASE");
        if let Some(entry) = ledger.holds.get_mut(&booking) {
            entry.release_txn = Some(txn.clone());
        }
        info!(
            booking = %booking,
            payer = %hold.payer,
            payee = %payee,
            amount = %hold.amount,
            txn = %txn,
            "escrow released"
        );
        Ok(txn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallets() -> (WalletAddress, WalletAddress) {
        (WalletAddress::new("PASSENGER"), WalletAddress::new("DRIVER"))
    }

    #[tokio::test]
    async fn lock_then_release_pays_driver() {
        let gateway = LedgerGateway::new();
        let (payer, payee) = wallets();
        let booking = BookingId::new();

        gateway
            .lock(booking, &payer, &payee, MicroAlgos::from_micro(50_000))
            .await
            .unwrap();
        assert_eq!(
            gateway.locked_amount(booking).await,
            Some(MicroAlgos::from_micro(50_000))
        );

        gateway.release(&payee, booking).await.unwrap();
        assert_eq!(gateway.locked_amount(booking).await, None);
        assert_eq!(gateway.released_to(&payee).await, MicroAlgos::from_micro(50_000));
    }

    #[tokio::test]
    async fn release_without_lock_fails() {
        let gateway = LedgerGateway::new();
        let booking = BookingId::new();
        let result = gateway.release(&WalletAddress::new("DRIVER"), booking).await;
        assert_eq!(result, Err(GatewayError::NotLocked(booking)));
    }

    #[tokio::test]
    async fn repeated_lock_returns_original_txn() {
        let gateway = LedgerGateway::new();
        let (payer, payee) = wallets();
        let booking = BookingId::new();
        let amount = MicroAlgos::from_micro(5_000);

        let first = gateway.lock(booking, &payer, &payee, amount).await.unwrap();
        let second = gateway.lock(booking, &payer, &payee, amount).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(gateway.locked_amount(booking).await, Some(amount));
    }

    #[tokio::test]
    async fn different_lock_on_held_booking_is_rejected() {
        let gateway = LedgerGateway::new();
        let (payer, payee) = wallets();
        let booking = BookingId::new();

        gateway
            .lock(booking, &payer, &payee, MicroAlgos::from_micro(5_000))
            .await
            .unwrap();
        let result = gateway
            .lock(booking, &payer, &payee, MicroAlgos::from_micro(9_000))
            .await;
        assert_eq!(result, Err(GatewayError::AlreadyLocked(booking)));
    }

    #[tokio::test]
    async fn lost_lock_reply_still_holds_funds() {
        let gateway = LedgerGateway::new();
        let (payer, payee) = wallets();
        let booking = BookingId::new();
        let amount = MicroAlgos::from_micro(5_000);

        gateway.lose_next_lock_replies(1);
        let call = gateway.lock(booking, &payer, &payee, amount);
        let result = tokio::time::timeout(Duration::from_millis(20), call).await;
        assert!(result.is_err());
        assert_eq!(gateway.locked_amount(booking).await, Some(amount));

        // the retry is answered
        assert!(gateway.lock(booking, &payer, &payee, amount).await.is_ok());
    }

    #[test]
    fn refusals_do_not_hold_funds() {
        let booking = BookingId::new();
        assert!(GatewayError::Timeout(Duration::from_secs(1)).may_hold_funds());
        assert!(GatewayError::AlreadyLocked(booking).may_hold_funds());
        assert!(!GatewayError::Rejected("no".into()).may_hold_funds());
        assert!(!GatewayError::MissingWallet(booking, PartyRole::Driver).may_hold_funds());
    }

    #[tokio::test]
    async fn repeated_release_does_not_pay_twice() {
        let gateway = LedgerGateway::new();
        let (payer, payee) = wallets();
        let booking = BookingId::new();
        gateway
            .lock(booking, &payer, &payee, MicroAlgos::from_micro(7_000))
            .await
            .unwrap();

        let first = gateway.release(&payee, booking).await.unwrap();
        let second = gateway.release(&payee, booking).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(gateway.released_to(&payee).await, MicroAlgos::from_micro(7_000));
        assert_eq!(gateway.release_calls(), 2);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let gateway = LedgerGateway::new();
        let (payer, payee) = wallets();
        let booking = BookingId::new();
        gateway
            .lock(booking, &payer, &payee, MicroAlgos::from_micro(7_000))
            .await
            .unwrap();

        gateway.fail_next_releases(1);
        assert!(matches!(
            gateway.release(&payee, booking).await,
            Err(GatewayError::Rejected(_))
        ));
        assert!(gateway.release(&payee, booking).await.is_ok());
    }

    #[tokio::test]
    async fn wrong_payee_is_rejected() {
        let gateway = LedgerGateway::new();
        let (payer, payee) = wallets();
        let booking = BookingId::new();
        gateway
            .lock(booking, &payer, &payee, MicroAlgos::from_micro(7_000))
            .await
            .unwrap();

        let result = gateway.release(&WalletAddress::new("MALLORY"), booking).await;
        assert!(matches!(result, Err(GatewayError::Rejected(_))));
    }
}
