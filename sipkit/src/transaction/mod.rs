#![deny(missing_docs)]
//! SIP Transaction Layer.
//!
//! Four state machines (RFC 3261 section 17, with the RFC 6026
//! Accepted states) share one runtime: the [`TransactionInner`] carries
//! the key, transport, state, last message, retransmit accounting and
//! the timer table; each variant contributes only its transition logic
//! and timer schedule. The [`TransactionLayer`] is the store that
//! resolves incoming messages to live transactions.

use bytes::Bytes;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use util::ArcStr;

use crate::{
    config::Settings,
    endpoint::Endpoint,
    error::{Error, Result},
    headers::{CSeq, CallId},
    message::{Method, StatusCode},
    timer::{self, TimerId, TimerTable},
    transport::{
        IncomingRequest, IncomingResponse, OutgoingRequest, OutgoingResponse, ToBytes, Transport, TransportKey,
    },
};

use std::{
    cmp,
    collections::{HashMap, HashSet},
    mem,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

pub mod key;
pub mod snapshot;

pub(crate) mod client;
pub(crate) mod inv_client;
pub(crate) mod inv_server;
pub(crate) mod server;

pub use client::ClientTransaction;
pub use inv_client::InvClientTransaction;
pub use inv_server::InvServerTransaction;
pub use key::TsxKey;
pub use server::ServerTransaction;
pub use snapshot::{TsxHandle, TsxSnapshot};

type LastMsg = tokio::sync::RwLock<Option<Bytes>>;
type LastStatusCode = RwLock<Option<StatusCode>>;

/// A trait for managing the behavior of a SIP transaction.
pub trait Transaction: Sync + Send + 'static {
    /// Terminate the SIP Transaction.
    fn terminate(&self);
}

/// The four transaction variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TsxKind {
    /// INVITE client transaction (17.1.1).
    InviteClient,
    /// Non-INVITE client transaction (17.1.2).
    NonInviteClient,
    /// INVITE server transaction (17.2.1).
    InviteServer,
    /// Non-INVITE server transaction (17.2.2).
    NonInviteServer,
}

/// The possible roles of a SIP Transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// (User Agent Client): The entity that initiates the
    /// request.
    UAC,
    /// (User Agent Server): The entity that responds to the
    /// request.
    UAS,
}

impl TsxKind {
    /// The role of the variant.
    pub fn role(&self) -> Role {
        match self {
            TsxKind::InviteClient | TsxKind::NonInviteClient => Role::UAC,
            TsxKind::InviteServer | TsxKind::NonInviteServer => Role::UAS,
        }
    }
}

/// Defines the possible states of a SIP Transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum State {
    #[default]
    /// Initial state
    Initial,
    /// Calling state
    Calling,
    /// Trying state
    Trying,
    /// Proceeding state
    Proceeding,
    /// Completed state
    Completed,
    /// Confirmed state
    Confirmed,
    /// Accepted state (RFC 6026)
    Accepted,
    /// Terminated state
    Terminated,
}

/// Why a transaction terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TsxTermination {
    /// The transaction ran to completion.
    Normal,
    /// Timer B, F or H fired first.
    Timeout,
    /// The transport under the transaction failed.
    Transport(String),
    /// The enclosing layer was shut down.
    Aborted,
}

impl TsxTermination {
    /// Converts the termination reason into the error it surfaces, if
    /// any.
    pub fn into_error(self) -> Option<Error> {
        match self {
            TsxTermination::Normal => None,
            TsxTermination::Timeout => Some(Error::TransactionTimeout),
            TsxTermination::Transport(cause) => Some(Error::Transport(cause)),
            TsxTermination::Aborted => Some(Error::Aborted),
        }
    }
}

/// Upward events delivered to the transaction subscriber.
#[derive(Debug)]
pub enum TsxEvent {
    /// A response was received by a client transaction.
    Response(IncomingResponse),
    /// An ACK reached an INVITE server transaction in Accepted state.
    AckReceived(IncomingRequest),
    /// A server transaction absorbed a request retransmission and
    /// replayed its latest response.
    RequestRetransmit,
    /// `cancel()` was called; the TU should now send a CANCEL request.
    CancelRequested,
    /// Delivered exactly once per transaction.
    Terminated(TsxTermination),
}

impl std::fmt::Debug for IncomingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingResponse")
            .field("code", &self.response.code())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for IncomingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingRequest")
            .field("method", self.method())
            .finish_non_exhaustive()
    }
}

/// Exponential retransmit backoff: base doubled per attempt, capped.
pub(crate) fn backoff(base: Duration, cap: Duration, retrans: u32) -> Duration {
    cmp::min(base * (1u32 << retrans.min(16)), cap)
}

struct Inner {
    /// The role of the transaction (UAC or UAS).
    role: Role,
    /// The variant of the transaction.
    kind: TsxKind,
    /// The endpoint associated with the transaction.
    endpoint: Endpoint,
    /// The key used to identify the transaction.
    key: TsxKey,
    /// The Call-ID of the enclosing call, kept for the secondary index.
    call_id: CallId,
    /// The CSeq of the original request.
    cseq: CSeq,
    /// The transport layer used for communication. Replaceable when
    /// the TU fails over to a new peer.
    transport: RwLock<Arc<dyn Transport>>,
    /// The address of the remote endpoint.
    addr: Mutex<SocketAddr>,
    /// The current state of the transaction.
    state: Mutex<State>,
    /// The last status code sent or received in the transaction.
    status_code: LastStatusCode,
    /// The retransmission count for the transaction.
    retransmit_count: AtomicUsize,
    /// The last message sent in the transaction.
    last_msg: LastMsg,
    /// The serialized original request, for ACK construction,
    /// retransmission and snapshots.
    original_msg: Mutex<Option<Bytes>>,
    /// Book-keeping for armed timers, read by snapshots.
    timers: Mutex<TimerTable>,
    /// Upward event subscriber, if any.
    events: Mutex<Option<mpsc::UnboundedSender<TsxEvent>>>,
    /// Exactly-once termination latch.
    terminated: AtomicBool,
    /// Cancelled at termination; event loops observe it and exit.
    done: CancellationToken,
    /// Host-application opaque correlation id, carried by snapshots.
    correlation: Mutex<Option<ArcStr>>,
}

/// Represents a SIP Transaction.
///
/// A SIP Transaction consists of a set of messages exchanged
/// between a client (`UAC`) and a server (`UAS`) to complete
/// a certain action, such as establishing or terminating a call.
#[derive(Clone)]
pub struct TransactionInner(Arc<Inner>);

impl std::fmt::Debug for TransactionInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionInner").field("key", self.key()).field("kind", &self.kind()).finish()
    }
}

impl TransactionInner {
    fn builder() -> Builder {
        Default::default()
    }

    pub(crate) fn new_tsx_uac(request: &OutgoingRequest, endpoint: &Endpoint, kind: TsxKind, state: State) -> Self {
        let mut builder = Self::builder();

        let call_id = request.msg.headers.call_id().expect("Outbound request carries a Call-ID");
        let cseq = request.msg.headers.cseq().expect("Outbound request carries a CSeq");

        builder.key(TsxKey::create_client(request));
        builder.kind(kind);
        builder.endpoint(endpoint.clone());
        builder.transport(request.transport.clone());
        builder.addr(request.addr);
        builder.state(state);
        builder.call_id(call_id.clone());
        builder.cseq(cseq.clone());

        let tsx = builder.build();

        log::trace!("Transaction Created [{:?}] ({:p})", tsx.0.kind, tsx.0);

        tsx
    }

    pub(crate) fn new_tsx_uas(request: &IncomingRequest, endpoint: &Endpoint, kind: TsxKind, state: State) -> Self {
        let mut builder = Self::builder();

        builder.key(TsxKey::create_server(request));
        builder.kind(kind);
        builder.endpoint(endpoint.clone());
        builder.transport(request.transport.clone());
        builder.addr(request.packet.addr);
        builder.state(state);
        builder.call_id(request.call_id().clone());
        builder.cseq(request.cseq().clone());
        builder.original(request.packet.payload.buf());

        let tsx = builder.build();

        log::trace!("Transaction Created [{:?}] ({:p})", tsx.0.kind, tsx.0);

        tsx
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        self.0.transport.read().expect("Lock failed").clone()
    }

    pub(crate) fn transport_key(&self) -> TransportKey {
        self.transport().key()
    }

    /// Moves the transaction onto a different connection, used when
    /// the TU retargets after a stream drop.
    pub fn set_transport(&self, transport: Arc<dyn Transport>, addr: SocketAddr) {
        *self.0.transport.write().expect("Lock failed") = transport;
        *self.0.addr.lock().expect("Lock failed") = addr;
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        *self.0.addr.lock().expect("Lock failed")
    }

    pub(crate) fn key(&self) -> &TsxKey {
        &self.0.key
    }

    pub(crate) fn kind(&self) -> TsxKind {
        self.0.kind
    }

    pub(crate) fn call_id(&self) -> &CallId {
        &self.0.call_id
    }

    pub(crate) fn cseq(&self) -> &CSeq {
        &self.0.cseq
    }

    pub(crate) fn settings(&self) -> Settings {
        self.0.endpoint.settings().clone()
    }

    /// The cancellation signal event loops wait on.
    pub(crate) fn done(&self) -> CancellationToken {
        self.0.done.clone()
    }

    /// Subscribes to upward events. The previous subscriber, if any,
    /// stops receiving.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TsxEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.0.events.lock().expect("Lock failed") = Some(tx);
        rx
    }

    /// Sends an event to the subscriber. Returns `false` when nobody
    /// listens.
    pub(crate) fn emit(&self, event: TsxEvent) -> bool {
        self.try_emit(event).is_none()
    }

    /// Sends an event to the subscriber, handing it back when there is
    /// none so the caller can route it to the services instead.
    pub(crate) fn try_emit(&self, event: TsxEvent) -> Option<TsxEvent> {
        let guard = self.0.events.lock().expect("Lock failed");
        match guard.as_ref() {
            Some(tx) => tx.send(event).err().map(|err| err.0),
            None => Some(event),
        }
    }

    /// Captures the transaction's serializable state.
    pub async fn snapshot(&self) -> TsxSnapshot {
        TsxSnapshot::capture(self).await
    }

    /// Attaches an opaque correlation id carried into snapshots.
    pub fn set_correlation(&self, correlation: &str) {
        *self.0.correlation.lock().expect("Lock failed") = Some(correlation.into());
    }

    pub(crate) fn correlation(&self) -> Option<ArcStr> {
        self.0.correlation.lock().expect("Lock failed").clone()
    }

    #[inline]
    /// Checks if the transport is reliable.
    pub fn reliable(&self) -> bool {
        self.transport().reliable()
    }

    #[inline]
    /// Retrieves the current state of the Transaction.
    pub fn get_state(&self) -> State {
        *self.0.state.lock().expect("Lock failed")
    }

    #[inline]
    /// Gets the count of retransmissions.
    pub fn retrans_count(&self) -> u32 {
        self.0.retransmit_count.load(Ordering::SeqCst) as u32
    }

    #[inline]
    pub(crate) fn add_retrans_count(&self) -> u32 {
        self.0.retransmit_count.fetch_add(1, Ordering::SeqCst) as u32 + 1
    }

    #[inline]
    /// Retrieves the last status code sent.
    pub fn last_status_code(&self) -> Option<StatusCode> {
        *self.0.status_code.read().expect("Lock failed")
    }

    #[inline]
    /// Retrieves the last msg sent if any.
    pub(crate) async fn last_msg(&self) -> Option<Bytes> {
        self.0.last_msg.read().await.clone()
    }

    pub(crate) fn original_msg(&self) -> Option<Bytes> {
        self.0.original_msg.lock().expect("Lock failed").clone()
    }

    pub(crate) fn arm_timer(&self, id: TimerId, budget: Duration) {
        self.0.timers.lock().expect("Lock failed").arm(id, budget);
    }

    pub(crate) fn arm_timer_with_elapsed(&self, id: TimerId, budget: Duration, elapsed: Duration) {
        self.0
            .timers
            .lock()
            .expect("Lock failed")
            .arm_with_elapsed(id, budget, elapsed);
    }

    pub(crate) fn disarm_timer(&self, id: TimerId) {
        self.0.timers.lock().expect("Lock failed").disarm(id);
    }

    pub(crate) fn armed_timers(&self) -> Vec<(TimerId, Duration, Duration)> {
        self.0
            .timers
            .lock()
            .expect("Lock failed")
            .iter()
            .map(|(id, arming)| (id, arming.elapsed(), arming.budget()))
            .collect()
    }

    /// Terminates after `delay`, unless the transaction terminated
    /// first for another reason. A zero delay terminates immediately.
    pub(crate) fn schedule_termination(&self, delay: Duration, reason: TsxTermination) {
        if delay.is_zero() {
            self.terminate_with(reason);
            return;
        }

        let tsx = self.clone();
        let (timer, fired) = timer::Timer::new(delay);
        tokio::spawn(async move {
            tokio::select! {
                result = fired => {
                    if result.is_ok() {
                        tsx.terminate_with(reason);
                    }
                }
                _ = tsx.0.done.cancelled() => timer.stop(),
            }
        });
    }

    /// Exactly-once terminal transition: flips the state, stops all
    /// timers, unregisters from the store and informs the subscriber.
    pub(crate) fn terminate_with(&self, reason: TsxTermination) {
        if self.0.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        self.change_state_to(State::Terminated);
        self.0.done.cancel();

        {
            let mut timers = self.0.timers.lock().expect("Lock failed");
            *timers = TimerTable::default();
        }

        let layer = self.0.endpoint.transactions();
        match self.0.role {
            Role::UAC => {
                layer.remove_client_tsx(&self.0.key);
            }
            Role::UAS => {
                layer.remove_server_tsx(&self.0.key);
            }
        };

        if let Some(err) = reason.clone().into_error() {
            log::debug!("Transaction terminated [{:?}]: {}", self.0.kind, err);
        }

        self.emit(TsxEvent::Terminated(reason));
    }

    pub(crate) fn on_terminated(&self) {
        self.terminate_with(TsxTermination::Normal);
    }

    pub(crate) fn change_state_to(&self, state: State) {
        let old = {
            let mut guard = self.0.state.lock().expect("Lock failed");
            mem::replace(&mut *guard, state)
        };
        log::trace!("State Changed [{old:?} -> {state:?}] ({:p})", self.0);
    }

    #[inline]
    pub(crate) fn set_last_status_code(&self, code: StatusCode) {
        let mut guard = self.0.status_code.write().expect("Lock failed");
        *guard = Some(code);
    }

    pub(crate) async fn set_last_msg(&self, msg: Bytes) {
        let mut guard = self.0.last_msg.write().await;
        *guard = Some(msg);
    }

    pub(crate) fn is_calling(&self) -> bool {
        self.get_state() == State::Calling
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.get_state() == State::Terminated
    }

    pub(crate) async fn retransmit(&self) -> Result<u32> {
        let retransmited = {
            let lock = self.0.last_msg.read().await;
            if let Some(msg) = lock.as_ref() {
                self.transport().send(msg, &self.addr()).await?;
                true
            } else {
                false
            }
        };

        if retransmited {
            Ok(self.add_retrans_count())
        } else {
            Err(Error::Transport("No message to retransmit".into()))
        }
    }

    pub(crate) async fn tsx_send_request(&self, msg: &mut OutgoingRequest) -> Result<()> {
        log::debug!("<= Request {} to /{}", msg.msg.req_line.method, msg.addr);
        let buf = match msg.buf.take() {
            Some(buf) => buf,
            None => msg.to_bytes()?,
        };
        self.transport().send(&buf, &self.addr()).await?;
        {
            let mut original = self.0.original_msg.lock().expect("Lock failed");
            if original.is_none() {
                *original = Some(buf.clone());
            }
        }
        self.set_last_msg(buf).await;
        Ok(())
    }

    pub(crate) async fn tsx_send_response(&self, msg: &mut OutgoingResponse) -> Result<()> {
        let code = msg.status_code();
        let (buf, transport, addr) = self.0.endpoint.dispatch_response(msg).await?;

        self.set_transport(transport, addr);
        self.set_last_status_code(code);
        self.set_last_msg(buf).await;
        Ok(())
    }
}

#[derive(Default)]
/// Builder for creating a new SIP `Transaction`.
pub struct Builder {
    kind: Option<TsxKind>,
    endpoint: Option<Endpoint>,
    key: Option<TsxKey>,
    call_id: Option<CallId>,
    cseq: Option<CSeq>,
    transport: Option<Arc<dyn Transport>>,
    addr: Option<SocketAddr>,
    state: Option<Mutex<State>>,
    status_code: Option<LastStatusCode>,
    last_msg: Option<LastMsg>,
    original_msg: Option<Bytes>,
    retransmit_count: Option<AtomicUsize>,
}

impl Builder {
    /// Sets the transaction variant.
    pub fn kind(&mut self, kind: TsxKind) -> &mut Self {
        self.kind = Some(kind);
        self
    }

    /// Sets the endpoint associated with the transaction.
    pub fn endpoint(&mut self, endpoint: Endpoint) -> &mut Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Sets the key used to identify the transaction.
    pub fn key(&mut self, key: TsxKey) -> &mut Self {
        self.key = Some(key);
        self
    }

    /// Sets the Call-ID the transaction belongs to.
    pub fn call_id(&mut self, call_id: CallId) -> &mut Self {
        self.call_id = Some(call_id);
        self
    }

    /// Sets the CSeq of the original request.
    pub fn cseq(&mut self, cseq: CSeq) -> &mut Self {
        self.cseq = Some(cseq);
        self
    }

    /// Sets the transport associated with the transaction.
    pub fn transport(&mut self, transport: Arc<dyn Transport>) -> &mut Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the address associated with the transaction.
    pub fn addr(&mut self, addr: SocketAddr) -> &mut Self {
        self.addr = Some(addr);
        self
    }

    /// Sets the transaction state.
    pub fn state(&mut self, state: State) -> &mut Self {
        self.state = Some(Mutex::new(state));
        self
    }

    /// Set the status code.
    pub fn status_code(&mut self, status_code: Option<StatusCode>) -> &mut Self {
        self.status_code = Some(RwLock::new(status_code));
        self
    }

    /// Keeps the serialized original message for retransmission and
    /// snapshots.
    pub fn original(&mut self, msg: &[u8]) -> &mut Self {
        self.original_msg = Some(Bytes::copy_from_slice(msg));
        self
    }

    /// Set the retransmission count.
    pub fn retransmit_count(&mut self, retransmit_count: usize) -> &mut Self {
        self.retransmit_count = Some(AtomicUsize::new(retransmit_count));
        self
    }

    /// Finalize the builder into a `Transaction`.
    pub fn build(self) -> TransactionInner {
        let kind = self.kind.expect("Kind is required");
        let inner = Inner {
            role: kind.role(),
            kind,
            endpoint: self.endpoint.expect("Endpoint is required"),
            key: self.key.expect("Key is required"),
            call_id: self.call_id.expect("Call-ID is required"),
            cseq: self.cseq.expect("CSeq is required"),
            transport: RwLock::new(self.transport.expect("Arc<dyn Transport> is required")),
            addr: Mutex::new(self.addr.expect("Address is required")),
            state: self.state.expect("State is required"),
            status_code: self.status_code.unwrap_or_default(),
            last_msg: self.last_msg.unwrap_or_default(),
            original_msg: Mutex::new(self.original_msg),
            retransmit_count: self.retransmit_count.unwrap_or_default(),
            timers: Mutex::new(TimerTable::default()),
            events: Mutex::new(None),
            terminated: AtomicBool::new(false),
            done: CancellationToken::new(),
            correlation: Mutex::new(None),
        };

        TransactionInner(Arc::new(inner))
    }
}

#[derive(Clone)]
/// An Server Transaction, either Invite or NonInvite.
pub enum ServerTsx {
    /// An NonInvite Server Transaction.
    NonInvite(ServerTransaction),
    /// An Invite Server Transaction.
    Invite(InvServerTransaction),
}

impl ServerTsx {
    /// Retrieves the last status code sent by transaction.
    pub fn last_status_code(&self) -> Option<StatusCode> {
        self.inner().last_status_code()
    }

    /// The current transaction state.
    pub fn get_state(&self) -> State {
        self.inner().get_state()
    }

    pub(crate) fn key(&self) -> &TsxKey {
        self.inner().key()
    }

    pub(crate) fn inner(&self) -> &TransactionInner {
        match self {
            ServerTsx::NonInvite(uas) => uas,
            ServerTsx::Invite(uas_inv) => uas_inv,
        }
    }

    /// Subscribes to upward events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TsxEvent> {
        self.inner().subscribe()
    }

    pub(crate) async fn receive_request(&self, request: &mut Option<IncomingRequest>) -> Result<bool> {
        match self {
            ServerTsx::NonInvite(uas) => uas.receive_request(request).await,
            ServerTsx::Invite(uas_inv) => uas_inv.receive_request(request).await,
        }
    }
}

impl From<ServerTransaction> for ServerTsx {
    fn from(tsx: ServerTransaction) -> Self {
        ServerTsx::NonInvite(tsx)
    }
}

impl From<InvServerTransaction> for ServerTsx {
    fn from(tsx: InvServerTransaction) -> Self {
        ServerTsx::Invite(tsx)
    }
}

#[derive(Clone)]
/// An Client Transaction, either Invite or NonInvite.
pub enum ClientTsx {
    /// An NonInvite Client Transaction.
    NonInvite(ClientTransaction),
    /// An Invite Client Transaction.
    Invite(InvClientTransaction),
}

impl ClientTsx {
    pub(crate) fn inner(&self) -> &TransactionInner {
        match self {
            ClientTsx::NonInvite(tsx) => tsx,
            ClientTsx::Invite(tsx_inv) => tsx_inv,
        }
    }

    /// The current transaction state.
    pub fn get_state(&self) -> State {
        self.inner().get_state()
    }

    /// Subscribes to upward events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TsxEvent> {
        self.inner().subscribe()
    }
}

/// Represents the transaction layer of the SIP protocol.
///
/// This type holds all server and client transactions created
/// by the TU (Transaction User), plus a secondary index from Call-ID
/// to server transactions used to route ACKs for 2xx responses.
#[derive(Default)]
pub struct TransactionLayer {
    client_transactions: Mutex<HashMap<TsxKey, ClientTsx>>,
    server_transactions: Mutex<HashMap<TsxKey, ServerTsx>>,
    by_call_id: Mutex<HashMap<ArcStr, HashSet<TsxKey>>>,
}

impl TransactionLayer {
    /// Remove an server transaction in the collection.
    pub fn remove_server_tsx(&self, key: &TsxKey) -> Option<ServerTsx> {
        let removed = {
            let mut map = self.server_transactions.lock().expect("Lock failed");
            map.remove(key)
        };

        if let Some(tsx) = &removed {
            let call_id = tsx.inner().call_id().id().clone();
            let mut index = self.by_call_id.lock().expect("Lock failed");
            if let Some(keys) = index.get_mut(&call_id) {
                keys.remove(key);
                if keys.is_empty() {
                    index.remove(&call_id);
                }
            }
        }

        removed
    }

    /// Remove an client transaction in the collection.
    #[inline]
    pub fn remove_client_tsx(&self, key: &TsxKey) -> Option<ClientTsx> {
        let mut map = self.client_transactions.lock().expect("Lock failed");
        map.remove(key)
    }

    pub(crate) fn add_server_tsx(&self, tsx: ServerTsx) -> Result<()> {
        let key = tsx.key().clone();
        let call_id = tsx.inner().call_id().id().clone();

        {
            let mut map = self.server_transactions.lock().expect("Lock failed");
            if map.get(&key).is_some_and(|live| !live.inner().is_terminated()) {
                return Err(Error::Unexpected(format!("Duplicate server transaction key {:?}", key)));
            }
            map.insert(key.clone(), tsx);
        }

        self.by_call_id
            .lock()
            .expect("Lock failed")
            .entry(call_id)
            .or_default()
            .insert(key);

        Ok(())
    }

    pub(crate) fn add_client_tsx(&self, tsx: ClientTsx) -> Result<()> {
        let key = tsx.inner().key().clone();
        let mut map = self.client_transactions.lock().expect("Lock failed");

        if map.get(&key).is_some_and(|live| !live.inner().is_terminated()) {
            return Err(Error::Unexpected(format!("Duplicate client transaction key {:?}", key)));
        }
        map.insert(key, tsx);

        Ok(())
    }

    pub(crate) fn find_server_tsx(&self, key: &TsxKey) -> Option<ServerTsx> {
        self.server_transactions.lock().expect("Lock failed").get(key).cloned()
    }

    pub(crate) fn find_client_tsx(&self, key: &TsxKey) -> Option<ClientTsx> {
        self.client_transactions.lock().expect("Lock failed").get(key).cloned()
    }

    pub(crate) fn client_count(&self) -> usize {
        self.client_transactions.lock().expect("Lock failed").len()
    }

    pub(crate) fn server_count(&self) -> usize {
        self.server_transactions.lock().expect("Lock failed").len()
    }

    /// Routes a response to the client transaction its top Via branch
    /// and CSeq method name. Returns `false` when no transaction
    /// matched and the response belongs to the TU.
    pub(crate) async fn handle_response(&self, response: &mut Option<IncomingResponse>) -> Result<bool> {
        let key = {
            let msg = response.as_ref().expect("Response is present");
            let cseq_method = msg.request_headers.cseq.method();
            let Some(via_branch) = msg.request_headers.via.branch() else {
                return Ok(false);
            };
            TsxKey::create_client_with(cseq_method, via_branch)
        };

        let client_tsx = match self.find_client_tsx(&key) {
            Some(tsx) => tsx,
            None => return Ok(false),
        };

        let handled = match client_tsx {
            ClientTsx::NonInvite(tsx) => tsx.receive(response).await?,
            ClientTsx::Invite(tsx_inv) => tsx_inv.receive(response).await?,
        };

        Ok(handled)
    }

    /// Routes a request to an existing server transaction. Returns
    /// `false` when no transaction matched: for ACK that means a 2xx
    /// acknowledgment that belongs to the TU, for anything else the
    /// endpoint creates a fresh server transaction.
    pub(crate) async fn handle_request(&self, request: &mut Option<IncomingRequest>) -> Result<bool> {
        let (key, is_ack) = {
            let msg = request.as_ref().expect("Request is present");
            (TsxKey::create_server(msg), msg.is_method(&Method::Ack))
        };

        if let Some(server_tsx) = self.find_server_tsx(&key) {
            return server_tsx.receive_request(request).await;
        }

        if is_ack {
            return self.match_unkeyed_ack(request).await;
        }

        Ok(false)
    }

    /// An ACK whose branch matches no INVITE server transaction: route
    /// by Call-ID to a transaction in Accepted state (2xx ACK, passed
    /// to the TU); anything else is a stray non-2xx ACK and is
    /// dropped.
    async fn match_unkeyed_ack(&self, request: &mut Option<IncomingRequest>) -> Result<bool> {
        let accepted = {
            let msg = request.as_ref().expect("Request is present");
            let call_id = msg.call_id().id().clone();
            let cseq = msg.cseq().cseq();

            let keys = {
                let index = self.by_call_id.lock().expect("Lock failed");
                index.get(&call_id).cloned().unwrap_or_default()
            };

            keys.into_iter()
                .filter_map(|key| self.find_server_tsx(&key))
                .find(|tsx| {
                    matches!(tsx, ServerTsx::Invite(_))
                        && tsx.get_state() == State::Accepted
                        && tsx.inner().cseq().cseq() == cseq
                })
        };

        match accepted {
            Some(tsx) => tsx.receive_request(request).await,
            None => {
                let msg = request.take().expect("Request is present");
                log::debug!(
                    "Dropping ACK from /{} matching no transaction (Call-ID {})",
                    msg.addr(),
                    msg.call_id().id(),
                );
                Ok(true)
            }
        }
    }

    /// Fails every client transaction still awaiting responses over
    /// the closed connection. Server transactions keep their timers
    /// running: the TU may retarget them onto a new connection with
    /// `set_transport`, and Timer H/J bound the wait either way.
    pub(crate) fn on_transport_closed(&self, key: TransportKey) {
        let clients: Vec<ClientTsx> = {
            let map = self.client_transactions.lock().expect("Lock failed");
            map.values().cloned().collect()
        };
        for tsx in clients {
            if tsx.inner().transport_key() == key {
                tsx.inner()
                    .terminate_with(TsxTermination::Transport("Connection closed".into()));
            }
        }
    }

    /// Terminates every live transaction with an abort error.
    pub(crate) fn shutdown(&self) {
        let clients: Vec<ClientTsx> = {
            let map = self.client_transactions.lock().expect("Lock failed");
            map.values().cloned().collect()
        };
        for tsx in clients {
            tsx.inner().terminate_with(TsxTermination::Aborted);
        }

        let servers: Vec<ServerTsx> = {
            let map = self.server_transactions.lock().expect("Lock failed");
            map.values().cloned().collect()
        };
        for tsx in servers {
            tsx.inner().terminate_with(TsxTermination::Aborted);
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::headers::{From as FromHdr, Header, Headers, SipHeaderParse, To, Via};
    use crate::message::{Request, RequestLine, Response, SipUri, StatusLine};
    use crate::transport::{udp::mock::MockUdpTransport, OutgoingAddr, Packet, Payload, RequestHeaders};

    use std::time::SystemTime;

    pub fn response(c: StatusCode) -> OutgoingResponse {
        response_with_cseq(c, CSeq::new(1, Method::Options))
    }

    pub fn response_with_cseq(c: StatusCode, cseq: CSeq) -> OutgoingResponse {
        let from = FromHdr::parse("sip:alice@127.0.0.1:5060").unwrap();
        let to = To::parse("sip:bob@127.0.0.1:5060").unwrap();
        let via = Via::parse("SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK3060200;received=127.0.0.1").unwrap();

        let mut headers = Headers::new();

        headers.push(Header::Via(via));
        headers.push(Header::From(from));
        headers.push(Header::To(to));
        headers.push(Header::CallId(crate::headers::CallId::new("bs9ki9iqbee8k5kal8mpqb")));
        headers.push(Header::CSeq(cseq));

        let transport = Arc::new(MockUdpTransport);
        let addr = OutgoingAddr::Addr {
            addr: transport.local_addr(),
            transport,
        };
        let mut response = Response::new(StatusLine::new(c, c.reason()));

        response.headers = headers;

        OutgoingResponse {
            response,
            addr,
            buf: None,
        }
    }

    pub fn request(m: Method) -> IncomingRequest {
        request_with_branch(m, "z9hG4bK3060200")
    }

    pub fn request_with_branch(m: Method, branch: &str) -> IncomingRequest {
        let from = FromHdr::parse("sip:alice@127.0.0.1:5060;tag=88sja8x").unwrap();
        let to = To::parse("sip:bob@127.0.0.1:5060").unwrap();
        let via = Via::parse(&format!("SIP/2.0/UDP 127.0.0.1:5060;branch={branch};received=127.0.0.1")).unwrap();
        let uri = SipUri::parse("sip:bob@127.0.0.1:5060").unwrap();
        let cseq = CSeq::new(1, m.clone());
        let call_id = CallId::new("bs9ki9iqbee8k5kal8mpqb");
        let transport = Arc::new(MockUdpTransport);
        let packet = Packet {
            payload: Payload::new(Bytes::new()),
            addr: transport.local_addr(),
            time: SystemTime::now(),
        };

        let mut headers = Headers::with_capacity(5);
        headers.push(Header::Via(via.clone()));
        headers.push(Header::From(from.clone()));
        headers.push(Header::To(to.clone()));
        headers.push(Header::CallId(call_id.clone()));
        headers.push(Header::CSeq(cseq.clone()));

        let req = Request {
            req_line: RequestLine { method: m, uri },
            headers,
            body: None,
        };

        IncomingRequest {
            request: req,
            transport,
            packet,
            transaction: None,
            request_headers: RequestHeaders {
                to,
                cseq,
                via,
                call_id,
                from,
            },
        }
    }

    pub fn outgoing_request(m: Method) -> OutgoingRequest {
        let from = FromHdr::parse("sip:alice@127.0.0.1:5060;tag=88sja8x").unwrap();
        let to = To::parse("sip:bob@127.0.0.1:5060").unwrap();
        let via = Via::parse("SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK3060200").unwrap();
        let uri = SipUri::parse("sip:bob@127.0.0.1:5060").unwrap();
        let cseq = CSeq::new(1, m.clone());
        let call_id = CallId::new("bs9ki9iqbee8k5kal8mpqb");
        let transport = Arc::new(MockUdpTransport);

        let mut headers = Headers::with_capacity(5);

        headers.push(Header::Via(via));
        headers.push(Header::From(from));
        headers.push(Header::To(to));
        headers.push(Header::CSeq(cseq));
        headers.push(Header::CallId(call_id));

        let req = Request {
            req_line: RequestLine { method: m, uri },
            headers,
            body: None,
        };

        OutgoingRequest {
            msg: req,
            addr: transport.local_addr(),
            buf: None,
            transport,
        }
    }

    pub fn incoming_response(c: StatusCode) -> IncomingResponse {
        incoming_response_with(c, CSeq::new(1, Method::Options))
    }

    pub fn incoming_response_with(c: StatusCode, cseq: CSeq) -> IncomingResponse {
        let from = FromHdr::parse("sip:alice@127.0.0.1:5060;tag=88sja8x").unwrap();
        let to = To::parse("sip:bob@127.0.0.1:5060;tag=a6c85cf").unwrap();
        let via = Via::parse("SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK3060200;received=127.0.0.1").unwrap();
        let call_id = CallId::new("bs9ki9iqbee8k5kal8mpqb");

        let mut headers = Headers::new();

        headers.push(Header::Via(via.clone()));
        headers.push(Header::From(from.clone()));
        headers.push(Header::To(to.clone()));
        headers.push(Header::CallId(call_id.clone()));
        headers.push(Header::CSeq(cseq.clone()));

        let transport = Arc::new(MockUdpTransport);
        let addr = transport.local_addr();
        let mut response = Response::new(StatusLine::new(c, c.reason()));
        response.headers = headers;

        IncomingResponse {
            response,
            transport,
            packet: Packet {
                payload: Payload::new(Bytes::new()),
                addr,
                time: SystemTime::now(),
            },
            transaction: None,
            request_headers: RequestHeaders {
                to,
                via,
                cseq,
                call_id,
                from,
            },
        }
    }

    pub async fn default_endpoint() -> Endpoint {
        crate::endpoint::Builder::new().build().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_non_invite_server_tsx() {
        let endpoint = mock::default_endpoint().await;
        let mut req = mock::request(Method::Register);

        let tsx = endpoint.new_uas_tsx(&mut req).unwrap();

        let transactions = endpoint.transactions();
        let key = tsx.key().clone();

        assert_matches!(transactions.find_server_tsx(&key), Some(ServerTsx::NonInvite(_)));

        tsx.on_terminated();

        assert!(transactions.find_server_tsx(&key).is_none());
    }

    #[tokio::test]
    async fn test_invite_server_tsx() {
        let endpoint = mock::default_endpoint().await;
        let mut req = mock::request(Method::Invite);

        let tsx = endpoint.new_uas_inv_tsx(&mut req).unwrap();

        let transactions = endpoint.transactions();
        let key = tsx.key().clone();

        assert_matches!(transactions.find_server_tsx(&key), Some(ServerTsx::Invite(_)));

        tsx.on_terminated();

        assert!(transactions.find_server_tsx(&key).is_none());
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected() {
        let endpoint = mock::default_endpoint().await;
        let mut req = mock::request(Method::Register);

        endpoint.new_uas_tsx(&mut req).unwrap();

        let mut dup = mock::request(Method::Register);
        assert_matches!(endpoint.new_uas_tsx(&mut dup), Err(Error::Unexpected(_)));
    }

    #[tokio::test]
    async fn test_terminated_event_fires_once() {
        let endpoint = mock::default_endpoint().await;
        let mut req = mock::request(Method::Register);

        let tsx = endpoint.new_uas_tsx(&mut req).unwrap();
        let mut events = tsx.subscribe();

        tsx.on_terminated();
        tsx.terminate_with(TsxTermination::Timeout);

        assert_matches!(events.recv().await, Some(TsxEvent::Terminated(TsxTermination::Normal)));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_call_id_index_cleaned_up() {
        let endpoint = mock::default_endpoint().await;
        let mut req = mock::request(Method::Invite);

        let tsx = endpoint.new_uas_inv_tsx(&mut req).unwrap();
        tsx.on_terminated();

        let index = endpoint.transactions().by_call_id.lock().unwrap();
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_aborts_live_transactions() {
        let endpoint = mock::default_endpoint().await;
        let mut req = mock::request(Method::Register);

        let tsx = endpoint.new_uas_tsx(&mut req).unwrap();
        let mut events = tsx.subscribe();

        endpoint.transactions().shutdown();

        assert_matches!(events.recv().await, Some(TsxEvent::Terminated(TsxTermination::Aborted)));
        assert_eq!(tsx.get_state(), State::Terminated);
    }

    #[test]
    fn test_backoff_caps() {
        let t1 = Duration::from_millis(500);
        let t2 = Duration::from_secs(4);

        assert_eq!(backoff(t1, t2, 0), Duration::from_millis(500));
        assert_eq!(backoff(t1, t2, 1), Duration::from_secs(1));
        assert_eq!(backoff(t1, t2, 2), Duration::from_secs(2));
        assert_eq!(backoff(t1, t2, 3), Duration::from_secs(4));
        assert_eq!(backoff(t1, t2, 10), Duration::from_secs(4));
    }
}
