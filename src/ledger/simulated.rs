use alloy_primitives::{Address, U256};
use flowpay_types::proof::{StreamId, TxHash};
use flowpay_types::timestamp::UnixTimestamp;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{
    CancelledStream, LedgerError, OpenedStream, PaymentLedger, StreamRequest, TransferRequest,
};
use crate::clock::Clock;

/// In-memory ledger for dry runs.
///
/// Streams get ids of the form `mock-stream-{unix}-{n}` and every write
/// returns a random 32-byte transaction hash. Balances move exactly as they
/// would on chain: deposits are debited up front, cancellation splits the
/// deposit between recipient (accrued) and sender (refund).
#[derive(Debug)]
pub struct SimulatedLedger {
    address: Address,
    clock: Arc<dyn Clock>,
    state: Mutex<SimulatedState>,
    writes: AtomicU64,
}

#[derive(Debug, Default)]
struct SimulatedState {
    balances: HashMap<Address, U256>,
    streams: HashMap<StreamId, SimulatedStream>,
    next_stream: u64,
}

#[derive(Debug, Clone)]
struct SimulatedStream {
    sender: Address,
    recipient: Address,
    deposit: U256,
    start: UnixTimestamp,
    stop: UnixTimestamp,
    active: bool,
}

impl SimulatedStream {
    fn accrued(&self, now: UnixTimestamp) -> U256 {
        let duration = self.stop.seconds_since(self.start);
        if duration == 0 {
            return self.deposit;
        }
        let elapsed = now.seconds_since(self.start).min(duration);
        self.deposit * U256::from(elapsed) / U256::from(duration)
    }
}

impl SimulatedLedger {
    pub fn new(address: Address, initial_balance: U256, clock: Arc<dyn Clock>) -> Self {
        let mut state = SimulatedState::default();
        state.balances.insert(address, initial_balance);
        Self {
            address,
            clock,
            state: Mutex::new(state),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of state-changing calls that went through.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn balance_of(&self, address: Address) -> U256 {
        self.state()
            .balances
            .get(&address)
            .copied()
            .unwrap_or_default()
    }

    fn state(&self) -> MutexGuard<'_, SimulatedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn debit(state: &mut SimulatedState, from: Address, amount: U256) -> Result<(), LedgerError> {
        let balance = state.balances.entry(from).or_default();
        if *balance < amount {
            return Err(LedgerError::Rejected(format!(
                "insufficient funds: balance {balance}, needed {amount}"
            )));
        }
        *balance -= amount;
        Ok(())
    }

    fn credit(state: &mut SimulatedState, to: Address, amount: U256) {
        *state.balances.entry(to).or_default() += amount;
    }

    fn tx_hash(&self) -> TxHash {
        self.writes.fetch_add(1, Ordering::SeqCst);
        TxHash::new(format!("0x{}", hex::encode(rand::random::<[u8; 32]>())))
    }
}

#[async_trait::async_trait]
impl PaymentLedger for SimulatedLedger {
    fn address(&self) -> Address {
        self.address
    }

    async fn create_stream(&self, request: StreamRequest) -> Result<OpenedStream, LedgerError> {
        if request.deposit.is_zero() {
            return Err(LedgerError::Rejected("deposit must be positive".into()));
        }
        if request.duration_secs == 0 {
            return Err(LedgerError::Rejected("duration must be positive".into()));
        }
        let now = self.clock.now();
        let stream_id = {
            let mut state = self.state();
            Self::debit(&mut state, self.address, request.deposit)?;
            state.next_stream += 1;
            let stream_id = StreamId::new(format!("mock-stream-{}-{}", now, state.next_stream));
            state.streams.insert(
                stream_id.clone(),
                SimulatedStream {
                    sender: self.address,
                    recipient: request.recipient,
                    deposit: request.deposit,
                    start: now,
                    stop: now + request.duration_secs,
                    active: true,
                },
            );
            stream_id
        };
        tracing::debug!(%stream_id, deposit = %request.deposit, "Simulated stream opened");
        Ok(OpenedStream {
            stream_id,
            start_time: now,
            tx_hash: self.tx_hash(),
        })
    }

    async fn cancel_stream(&self, stream_id: &StreamId) -> Result<CancelledStream, LedgerError> {
        let now = self.clock.now();
        let refund_amount = {
            let mut state = self.state();
            let stream = state
                .streams
                .get_mut(stream_id)
                .ok_or_else(|| LedgerError::StreamNotFound(stream_id.clone()))?;
            if !stream.active {
                return Err(LedgerError::StreamInactive(stream_id.clone()));
            }
            stream.active = false;
            let stream = stream.clone();
            let accrued = stream.accrued(now);
            let refund = stream.deposit - accrued;
            Self::credit(&mut state, stream.recipient, accrued);
            Self::credit(&mut state, stream.sender, refund);
            refund
        };
        Ok(CancelledStream {
            refund_amount,
            tx_hash: self.tx_hash(),
        })
    }

    async fn is_stream_active(&self, stream_id: &StreamId) -> Result<bool, LedgerError> {
        let now = self.clock.now();
        Ok(self
            .state()
            .streams
            .get(stream_id)
            .is_some_and(|s| s.active && now < s.stop))
    }

    async fn transfer(&self, request: TransferRequest) -> Result<TxHash, LedgerError> {
        if request.amount.is_zero() {
            return Err(LedgerError::Rejected("amount must be positive".into()));
        }
        {
            let mut state = self.state();
            Self::debit(&mut state, self.address, request.amount)?;
            Self::credit(&mut state, request.recipient, request.amount);
        }
        Ok(self.tx_hash())
    }

    async fn get_balance(&self, address: Address) -> Result<U256, LedgerError> {
        Ok(self.balance_of(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ledger::StreamMetadata;
    use alloy_primitives::address;
    use flowpay_types::requirement::TokenKind;

    const AGENT: Address = address!("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
    const SERVER: Address = address!("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");

    fn ledger() -> (Arc<ManualClock>, SimulatedLedger) {
        let clock = Arc::new(ManualClock::new(UnixTimestamp::from_secs(1_700_000_000)));
        let ledger = SimulatedLedger::new(AGENT, U256::from(10_000u64), clock.clone());
        (clock, ledger)
    }

    fn stream_request(deposit: u64, duration_secs: u64) -> StreamRequest {
        StreamRequest {
            recipient: SERVER,
            contract: Address::repeat_byte(0xcc),
            token: TokenKind::Native,
            duration_secs,
            deposit: U256::from(deposit),
            metadata: StreamMetadata {
                agent_id: "test-agent".into(),
                timestamp: UnixTimestamp::from_secs(1_700_000_000),
                service_url: "http://localhost/api".into(),
                purpose: "test".into(),
            },
        }
    }

    #[tokio::test]
    async fn test_stream_lifecycle_moves_balances() {
        let (clock, ledger) = ledger();
        let opened = ledger.create_stream(stream_request(3_600, 3_600)).await.unwrap();
        assert!(opened.stream_id.as_str().starts_with("mock-stream-1700000000-"));
        assert!(opened.tx_hash.is_well_formed());
        assert_eq!(ledger.balance_of(AGENT), U256::from(6_400u64));
        assert!(ledger.is_stream_active(&opened.stream_id).await.unwrap());

        clock.advance(600);
        let cancelled = ledger.cancel_stream(&opened.stream_id).await.unwrap();
        assert_eq!(cancelled.refund_amount, U256::from(3_000u64));
        assert_eq!(ledger.balance_of(AGENT), U256::from(9_400u64));
        assert_eq!(ledger.balance_of(SERVER), U256::from(600u64));
        assert!(!ledger.is_stream_active(&opened.stream_id).await.unwrap());
        assert_eq!(ledger.writes(), 2);
    }

    #[tokio::test]
    async fn test_cancel_twice_reports_inactive() {
        let (_clock, ledger) = ledger();
        let opened = ledger.create_stream(stream_request(100, 60)).await.unwrap();
        ledger.cancel_stream(&opened.stream_id).await.unwrap();
        assert_eq!(
            ledger.cancel_stream(&opened.stream_id).await,
            Err(LedgerError::StreamInactive(opened.stream_id.clone()))
        );
        let unknown = StreamId::new("nope");
        assert_eq!(
            ledger.cancel_stream(&unknown).await,
            Err(LedgerError::StreamNotFound(unknown.clone()))
        );
    }

    #[tokio::test]
    async fn test_stream_stops_being_active_at_end() {
        let (clock, ledger) = ledger();
        let opened = ledger.create_stream(stream_request(100, 60)).await.unwrap();
        clock.advance(60);
        assert!(!ledger.is_stream_active(&opened.stream_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_transfer_requires_funds() {
        let (_clock, ledger) = ledger();
        let request = TransferRequest {
            recipient: SERVER,
            contract: Address::repeat_byte(0xcc),
            token: TokenKind::Native,
            amount: U256::from(20_000u64),
        };
        assert!(matches!(
            ledger.transfer(request.clone()).await,
            Err(LedgerError::Rejected(_))
        ));
        let ok = TransferRequest {
            amount: U256::from(250u64),
            ..request
        };
        let hash = ledger.transfer(ok).await.unwrap();
        assert!(hash.is_well_formed());
        assert_eq!(ledger.get_balance(SERVER).await.unwrap(), U256::from(250u64));
        assert_eq!(ledger.writes(), 1);
    }
}
