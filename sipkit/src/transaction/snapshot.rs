//! Persistent transaction snapshots.
//!
//! A snapshot is a serializable projection of a live transaction
//! sufficient to resume it after a restart: key, variant, state, the
//! raw original and last messages, addressing, and `(elapsed, budget)`
//! for every armed timer. Timer handles are never persisted; restore
//! recomputes the remaining sleep from the captured elapsed times.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    endpoint::Endpoint,
    error::{Error, Result},
    headers::CSeq,
    message::{Method, SipMsg, StatusCode, TransportKind},
    parser,
    timer::TimerId,
    transaction::{
        client::{ClientTransaction, RetransBudgets},
        inv_client::{InvClientTransaction, OriginalRequest},
        inv_server::InvServerTransaction,
        server::ServerTransaction,
        ClientTsx, ServerTsx, State, TransactionInner, TsxKey, TsxKind, TsxTermination,
    },
    transport::Transport,
};

use std::sync::Arc;

/// Schema version stamped into every snapshot. Restore refuses any
/// other value.
pub const SNAPSHOT_VERSION: u32 = 1;

/// One armed timer at capture time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerSnapshot {
    /// Which timer was armed.
    pub id: TimerId,
    /// Time already spent against the budget, in milliseconds.
    pub elapsed_ms: u64,
    /// The timer's total budget, in milliseconds.
    pub budget_ms: u64,
}

impl TimerSnapshot {
    fn remaining(&self) -> Duration {
        Duration::from_millis(self.budget_ms.saturating_sub(self.elapsed_ms))
    }

    fn is_exhausted(&self) -> bool {
        self.elapsed_ms >= self.budget_ms
    }

    /// Retransmit-interval timers may legitimately be overdue at
    /// capture; only budget timers kill the transaction when spent.
    fn is_deadline(&self) -> bool {
        !matches!(self.id, TimerId::A | TimerId::E | TimerId::G | TimerId::Trying100)
    }
}

/// A serializable projection of a transaction, RFC state plus enough
/// raw material to resume it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TsxSnapshot {
    /// Schema version, [`SNAPSHOT_VERSION`] at capture.
    pub version: u32,
    /// Which of the four machines this was.
    pub kind: TsxKind,
    /// The store key.
    pub key: TsxKey,
    /// The RFC state at capture.
    pub state: State,
    /// CSeq of the original request.
    pub cseq: u32,
    /// Method of the original request.
    pub method: Method,
    /// Call-ID of the enclosing call.
    pub call_id: String,
    /// Local address of the transport under the transaction.
    pub local_addr: SocketAddr,
    /// The remote peer.
    pub remote_addr: SocketAddr,
    /// Transport kind at capture; restore may substitute another.
    pub transport: TransportKind,
    /// The serialized original request.
    pub original_msg: Option<Vec<u8>>,
    /// The last message sent by the transaction.
    pub last_msg: Option<Vec<u8>>,
    /// The last status code sent or received.
    pub last_status: Option<StatusCode>,
    /// Every armed timer with its spent and total budget.
    pub timers: Vec<TimerSnapshot>,
    /// Host-application opaque correlation id.
    pub correlation: Option<String>,
}

impl TsxSnapshot {
    /// Captures the transaction's current state.
    pub(crate) async fn capture(tsx: &TransactionInner) -> TsxSnapshot {
        let timers = tsx
            .armed_timers()
            .into_iter()
            .map(|(id, elapsed, budget)| TimerSnapshot {
                id,
                elapsed_ms: elapsed.as_millis() as u64,
                budget_ms: budget.as_millis() as u64,
            })
            .collect();

        TsxSnapshot {
            version: SNAPSHOT_VERSION,
            kind: tsx.kind(),
            key: tsx.key().clone(),
            state: tsx.get_state(),
            cseq: tsx.cseq().cseq(),
            method: tsx.cseq().method().clone(),
            call_id: tsx.call_id().id().to_string(),
            local_addr: tsx.transport().local_addr(),
            remote_addr: tsx.addr(),
            transport: tsx.transport().kind(),
            original_msg: tsx.original_msg().map(|b| b.to_vec()),
            last_msg: tsx.last_msg().await.map(|b| b.to_vec()),
            last_status: tsx.last_status_code(),
            timers,
            correlation: tsx.correlation().map(|c| c.to_string()),
        }
    }

    /// Serializes the snapshot.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserializes a snapshot, refusing unknown schema versions.
    pub fn from_json(bytes: &[u8]) -> Result<TsxSnapshot> {
        let snapshot: TsxSnapshot = serde_json::from_slice(bytes)?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::SnapshotVersion(snapshot.version));
        }

        Ok(snapshot)
    }

    fn timer(&self, id: TimerId) -> Option<&TimerSnapshot> {
        self.timers.iter().find(|t| t.id == id)
    }

    fn remaining_or(&self, id: TimerId, fallback: Duration) -> Duration {
        self.timer(id).map(|t| t.remaining()).unwrap_or(fallback)
    }
}

/// A restored transaction, client or server side.
pub enum TsxHandle {
    /// A restored client transaction.
    Client(ClientTsx),
    /// A restored server transaction.
    Server(ServerTsx),
}

impl TsxHandle {
    /// The shared transaction runtime.
    pub fn inner(&self) -> &TransactionInner {
        match self {
            TsxHandle::Client(tsx) => tsx.inner(),
            TsxHandle::Server(tsx) => tsx.inner(),
        }
    }

    /// The current state.
    pub fn get_state(&self) -> State {
        self.inner().get_state()
    }
}

/// Rebuilds a transaction from a snapshot onto the given transport.
///
/// Remaining timer durations are recomputed from the captured elapsed
/// times; a deadline budget that is already spent terminates the
/// restored transaction immediately with a timeout error.
pub(crate) async fn restore(
    endpoint: &Endpoint,
    snapshot: TsxSnapshot,
    transport: Arc<dyn Transport>,
) -> Result<TsxHandle> {
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(Error::SnapshotVersion(snapshot.version));
    }

    let mut builder = TransactionInner::builder();
    builder.kind(snapshot.kind);
    builder.endpoint(endpoint.clone());
    builder.key(snapshot.key.clone());
    builder.call_id(crate::headers::CallId::new(&snapshot.call_id));
    builder.cseq(CSeq::new(snapshot.cseq, snapshot.method.clone()));
    builder.transport(transport);
    builder.addr(snapshot.remote_addr);
    builder.state(snapshot.state);
    builder.status_code(snapshot.last_status);
    if let Some(original) = &snapshot.original_msg {
        builder.original(original);
    }

    let core = builder.build();

    if let Some(last) = &snapshot.last_msg {
        core.set_last_msg(bytes::Bytes::copy_from_slice(last)).await;
    }
    if let Some(correlation) = &snapshot.correlation {
        core.set_correlation(correlation);
    }

    for timer in &snapshot.timers {
        core.arm_timer_with_elapsed(
            timer.id,
            Duration::from_millis(timer.budget_ms),
            Duration::from_millis(timer.elapsed_ms),
        );
    }

    let handle = build_variant(endpoint, &snapshot, core.clone())?;

    register(endpoint, &handle)?;

    if snapshot.timers.iter().any(|t| t.is_deadline() && t.is_exhausted()) {
        core.terminate_with(TsxTermination::Timeout);
        return Ok(handle);
    }

    respawn(endpoint, &snapshot, &handle);

    Ok(handle)
}

fn build_variant(_endpoint: &Endpoint, snapshot: &TsxSnapshot, core: TransactionInner) -> Result<TsxHandle> {
    let handle = match snapshot.kind {
        TsxKind::NonInviteClient => TsxHandle::Client(ClientTsx::NonInvite(ClientTransaction::from_core(core))),
        TsxKind::InviteClient => {
            let original = snapshot
                .original_msg
                .as_deref()
                .ok_or_else(|| Error::Malformed("Snapshot without original INVITE".into()))?;
            let SipMsg::Request(request) = parser::parse_datagram(original)? else {
                return Err(Error::Malformed("Snapshot original is not a request".into()));
            };

            TsxHandle::Client(ClientTsx::Invite(InvClientTransaction::with_parts(
                core,
                OriginalRequest::from_request(&request),
            )))
        }
        TsxKind::NonInviteServer => TsxHandle::Server(ServerTsx::NonInvite(ServerTransaction::from_core(core))),
        TsxKind::InviteServer => TsxHandle::Server(ServerTsx::Invite(InvServerTransaction::from_core(core))),
    };

    Ok(handle)
}

fn register(endpoint: &Endpoint, handle: &TsxHandle) -> Result<()> {
    match handle {
        TsxHandle::Client(tsx) => endpoint.transactions().add_client_tsx(tsx.clone()),
        TsxHandle::Server(tsx) => endpoint.transactions().add_server_tsx(tsx.clone()),
    }
}

fn respawn(endpoint: &Endpoint, snapshot: &TsxSnapshot, handle: &TsxHandle) {
    let settings = endpoint.settings().clone();
    let timeout = settings.timeout();
    let core = handle.inner();

    match (handle, snapshot.state) {
        (TsxHandle::Client(ClientTsx::Invite(tsx)), State::Calling | State::Proceeding) => {
            tsx.spawn_retrans_task(RetransBudgets {
                retrans: snapshot.remaining_or(TimerId::A, settings.t1),
                timeout: snapshot.remaining_or(TimerId::B, timeout),
            });
        }
        (TsxHandle::Client(ClientTsx::Invite(_)), State::Completed) => {
            core.schedule_termination(snapshot.remaining_or(TimerId::D, Duration::ZERO), TsxTermination::Normal);
        }
        (TsxHandle::Client(ClientTsx::Invite(_)), State::Accepted) => {
            core.schedule_termination(snapshot.remaining_or(TimerId::M, timeout), TsxTermination::Normal);
        }
        (TsxHandle::Client(ClientTsx::NonInvite(tsx)), State::Trying | State::Proceeding) => {
            tsx.spawn_retrans_task(RetransBudgets {
                retrans: snapshot.remaining_or(TimerId::E, settings.t1),
                timeout: snapshot.remaining_or(TimerId::F, timeout),
            });
        }
        (TsxHandle::Client(ClientTsx::NonInvite(_)), State::Completed) => {
            core.schedule_termination(snapshot.remaining_or(TimerId::K, Duration::ZERO), TsxTermination::Normal);
        }
        (TsxHandle::Server(ServerTsx::Invite(tsx)), State::Completed) => {
            tsx.spawn_completed_loop(RetransBudgets {
                retrans: snapshot.remaining_or(TimerId::G, settings.t1),
                timeout: snapshot.remaining_or(TimerId::H, timeout),
            });
        }
        (TsxHandle::Server(ServerTsx::Invite(_)), State::Confirmed) => {
            core.schedule_termination(snapshot.remaining_or(TimerId::I, Duration::ZERO), TsxTermination::Normal);
        }
        (TsxHandle::Server(ServerTsx::Invite(_)), State::Accepted) => {
            core.schedule_termination(snapshot.remaining_or(TimerId::L, timeout), TsxTermination::Normal);
        }
        (TsxHandle::Server(ServerTsx::NonInvite(_)), State::Completed) => {
            core.schedule_termination(snapshot.remaining_or(TimerId::J, Duration::ZERO), TsxTermination::Normal);
        }
        // Proceeding/Trying servers wait on the TU; no timers to
        // re-arm.
        _ => (),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::StatusCode;
    use crate::transaction::mock;
    use crate::transport::udp::mock::MockUdpTransport;
    use tokio::time::{self, Duration as TokioDuration};

    #[tokio::test(start_paused = true)]
    async fn test_capture_roundtrip() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(Method::Invite);

        let uac_inv = InvClientTransaction::send(request, &endpoint).await.unwrap();
        uac_inv.set_correlation("call-42");

        time::sleep(TokioDuration::from_millis(250)).await;

        let snapshot = TsxSnapshot::capture(&uac_inv).await;
        let decoded = TsxSnapshot::from_json(&snapshot.to_json().unwrap()).unwrap();

        assert_eq!(decoded.version, SNAPSHOT_VERSION);
        assert_eq!(decoded.kind, TsxKind::InviteClient);
        assert_eq!(decoded.state, State::Calling);
        assert_eq!(decoded.correlation.as_deref(), Some("call-42"));

        let timer_b = decoded.timer(TimerId::B).unwrap();
        assert_eq!(timer_b.elapsed_ms, 250);
        assert_eq!(timer_b.budget_ms, 32_000);
    }

    #[tokio::test]
    async fn test_unknown_version_refused() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(Method::Invite);

        let uac_inv = InvClientTransaction::send(request, &endpoint).await.unwrap();
        let mut snapshot = TsxSnapshot::capture(&uac_inv).await;
        snapshot.version = 99;

        let json = serde_json::to_vec(&snapshot).unwrap();
        assert_matches!(TsxSnapshot::from_json(&json), Err(Error::SnapshotVersion(99)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_preserves_remaining_budget() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(Method::Invite);

        let uac_inv = InvClientTransaction::send(request, &endpoint).await.unwrap();
        time::sleep(TokioDuration::from_millis(250)).await;

        let snapshot = TsxSnapshot::capture(&uac_inv).await;
        uac_inv.terminate_with(TsxTermination::Aborted);

        let restored = restore(&endpoint, snapshot, Arc::new(MockUdpTransport)).await.unwrap();
        assert_eq!(restored.get_state(), State::Calling);

        // 250 ms of the 64*T1 budget were already spent; Timer B must
        // fire 32 s - 250 ms from now.
        time::sleep(TokioDuration::from_millis(31_749)).await;
        assert_ne!(restored.get_state(), State::Terminated);

        time::sleep(TokioDuration::from_millis(2)).await;
        assert_eq!(restored.get_state(), State::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_completes_normally_on_response() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(Method::Invite);

        let uac_inv = InvClientTransaction::send(request, &endpoint).await.unwrap();
        time::sleep(TokioDuration::from_millis(250)).await;

        let snapshot = TsxSnapshot::capture(&uac_inv).await;
        uac_inv.terminate_with(TsxTermination::Aborted);

        let restored = restore(&endpoint, snapshot, Arc::new(MockUdpTransport)).await.unwrap();
        let TsxHandle::Client(ClientTsx::Invite(tsx)) = &restored else {
            panic!("Expected an INVITE client transaction");
        };

        let mut response = Some(mock::incoming_response_with(
            StatusCode::OK,
            CSeq::new(1, Method::Invite),
        ));
        tsx.receive(&mut response).await.unwrap();

        assert_eq!(restored.get_state(), State::Accepted);
    }

    #[tokio::test]
    async fn test_exhausted_budget_terminates_immediately() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(Method::Invite);

        let uac_inv = InvClientTransaction::send(request, &endpoint).await.unwrap();
        let mut snapshot = TsxSnapshot::capture(&uac_inv).await;
        uac_inv.terminate_with(TsxTermination::Aborted);

        for timer in snapshot.timers.iter_mut() {
            if timer.id == TimerId::B {
                timer.elapsed_ms = timer.budget_ms + 1;
            }
        }

        let restored = restore(&endpoint, snapshot, Arc::new(MockUdpTransport)).await.unwrap();

        assert_eq!(restored.get_state(), State::Terminated);
    }
}
