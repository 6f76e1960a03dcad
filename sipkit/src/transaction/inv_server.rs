//! INVITE server transaction, RFC 3261 17.2.1 and RFC 6026.

use std::{
    ops::Deref,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures_util::future::{self, Either};
use tokio::{pin, sync::oneshot, time};

use crate::{
    endpoint::Endpoint,
    error::{Error, Result},
    message::{CodeClass, Method, StatusCode},
    timer::{self, TimerId},
    transaction::{
        client::RetransBudgets, ServerTsx, State, Transaction, TransactionInner, TsxEvent, TsxKind, TsxTermination,
    },
    transport::{IncomingRequest, OutgoingResponse},
};

// A provisional must leave the server within 200 ms, otherwise the
// transaction answers with 100 Trying itself (17.2.1).
const TRYING_DELAY: Duration = Duration::from_millis(200);

type TxConfirmed = Arc<Mutex<Option<oneshot::Sender<()>>>>;
type RxConfirmed = oneshot::Receiver<()>;

/// Represents a Server INVITE transaction.
///
/// Proceeding -> Completed -> Confirmed -> Terminated for non-2xx
/// finals, Proceeding -> Accepted -> Terminated for 2xx (RFC 6026).
#[derive(Clone)]
pub struct InvServerTransaction {
    transaction: TransactionInner,
    confirmed_tx: TxConfirmed,
    auto_trying: Arc<timer::Timer>,
}

impl InvServerTransaction {
    pub(crate) fn new(endpoint: &Endpoint, request: &mut IncomingRequest) -> Result<Self> {
        let method = request.method();

        assert!(
            matches!(method, Method::Invite),
            "Expected INVITE for server INVITE transaction, but got: {}",
            method
        );

        let transaction = TransactionInner::new_tsx_uas(request, endpoint, TsxKind::InviteServer, State::Proceeding);

        let (trying_timer, trying_fired) = timer::Timer::new(TRYING_DELAY);
        let uas_inv = Self {
            transaction,
            confirmed_tx: Default::default(),
            auto_trying: Arc::new(trying_timer),
        };

        endpoint.transactions().add_server_tsx(ServerTsx::Invite(uas_inv.clone()))?;
        request.set_tsx(ServerTsx::Invite(uas_inv.clone()));

        uas_inv.arm_timer(TimerId::Trying100, TRYING_DELAY);
        uas_inv.spawn_auto_trying(endpoint.new_response(request, StatusCode::TRYING), trying_fired);

        Ok(uas_inv)
    }

    pub(crate) fn from_core(transaction: TransactionInner) -> Self {
        let (trying_timer, _) = timer::Timer::new(TRYING_DELAY);
        trying_timer.stop();

        Self {
            transaction,
            confirmed_tx: Default::default(),
            auto_trying: Arc::new(trying_timer),
        }
    }

    // Answers with 100 Trying when the TU stays silent past the
    // deferral window.
    fn spawn_auto_trying(&self, mut trying: OutgoingResponse, fired: RxConfirmed) {
        let uas = self.clone();

        tokio::spawn(async move {
            let done = uas.done();

            tokio::select! {
                result = fired => {
                    if result.is_err() {
                        return;
                    }
                }
                _ = done.cancelled() => return,
            }

            if uas.get_state() != State::Proceeding || uas.last_status_code().is_some() {
                return;
            }

            uas.disarm_timer(TimerId::Trying100);
            if let Err(err) = uas.tsx_send_response(&mut trying).await {
                log::warn!("Failed to send automatic 100 Trying: {}", err);
            }
        });
    }

    /// Sends a response for the transaction.
    ///
    /// Provisionals keep the transaction in Proceeding, a 2xx moves it
    /// to Accepted (Timer L), any other final to Completed with the
    /// retransmit schedule of Timers G and H.
    pub async fn respond(&self, mut response: OutgoingResponse) -> Result<()> {
        let state = self.get_state();
        let class = response.status_code().class();

        match (state, class) {
            (State::Proceeding, CodeClass::Provisional) => {
                self.auto_trying.stop();
                self.disarm_timer(TimerId::Trying100);
                self.tsx_send_response(&mut response).await?;
                Ok(())
            }
            (State::Proceeding, CodeClass::Success) => {
                self.auto_trying.stop();
                self.disarm_timer(TimerId::Trying100);
                self.tsx_send_response(&mut response).await?;
                self.change_state_to(State::Accepted);

                let timeout = self.settings().timeout();
                self.arm_timer(TimerId::L, timeout);
                self.schedule_termination(timeout, TsxTermination::Normal);
                Ok(())
            }
            (State::Accepted, CodeClass::Success) => {
                // RFC 6026: the TU retransmits its 2xx through the
                // transaction while Accepted.
                self.tsx_send_response(&mut response).await?;
                Ok(())
            }
            (State::Proceeding, _) => {
                self.auto_trying.stop();
                self.disarm_timer(TimerId::Trying100);
                self.tsx_send_response(&mut response).await?;
                self.change_state_to(State::Completed);

                let settings = self.settings();
                self.spawn_completed_loop(RetransBudgets {
                    retrans: settings.t1,
                    timeout: settings.timeout(),
                });
                Ok(())
            }
            (state, _) => Err(Error::StateViolation {
                state,
                op: "send_response",
            }),
        }
    }

    pub(crate) fn spawn_completed_loop(&self, budgets: RetransBudgets) {
        self.arm_timer(TimerId::H, budgets.timeout);
        if !self.reliable() {
            self.arm_timer(TimerId::G, budgets.retrans);
        }

        let (tx, rx) = oneshot::channel();
        self.confirmed_tx.lock().expect("Lock failed").replace(tx);

        tokio::spawn(self.clone().completed_retrans_task(budgets, rx));
    }

    async fn completed_retrans_task(self, budgets: RetransBudgets, mut confirmed: RxConfirmed) -> Result<()> {
        let settings = self.settings();
        let done = self.done();

        pin! {
            let timer_h = time::sleep(budgets.timeout);
            let timer_g = if !self.reliable() {
                Either::Left(time::sleep(budgets.retrans))
            } else {
                Either::Right(future::pending::<()>())
            };
        }

        'retrans: loop {
            tokio::select! {
                _ = &mut timer_g, if self.get_state() == State::Completed => {
                    match self.retransmit().await {
                        Ok(retrans) => {
                            let interval = super::backoff(settings.t1, settings.t2, retrans);
                            self.arm_timer(TimerId::G, interval);
                            timer_g.set(Either::Left(time::sleep(interval)));
                        }
                        Err(err) => {
                            // The response cannot reach the peer right
                            // now; keep Timer H running, the TU may
                            // retarget the transaction.
                            log::info!("Failed to retransmit: {}", err);
                            timer_g.set(Either::Left(time::sleep(settings.t2)));
                        }
                    }
                }
                _ = &mut timer_h, if self.get_state() == State::Completed => {
                    // No ACK before Timer H: the transaction failed.
                    self.terminate_with(TsxTermination::Timeout);
                    break 'retrans Ok(());
                }
                _ = &mut confirmed => {
                    // ACK received.
                    break 'retrans Ok(());
                }
                _ = done.cancelled() => break 'retrans Ok(()),
            }
        }
    }

    pub(crate) async fn receive_request(&self, request: &mut Option<IncomingRequest>) -> Result<bool> {
        let is_ack = {
            let msg = request.as_ref().expect("Request is present");
            msg.is_method(&Method::Ack)
        };

        match (self.get_state(), is_ack) {
            (State::Completed, true) => {
                request.take();
                self.change_state_to(State::Confirmed);
                self.disarm_timer(TimerId::G);
                self.disarm_timer(TimerId::H);

                if let Some(sender) = self.confirmed_tx.lock().expect("Lock failed").take() {
                    let _ = sender.send(());
                }

                self.terminate();
                Ok(true)
            }
            (State::Confirmed, true) => {
                // Absorbed, no further processing.
                request.take();
                Ok(true)
            }
            (State::Accepted, true) => {
                // RFC 6026: the ACK for a 2xx belongs to the TU.
                let Some(mut msg) = request.take() else {
                    return Ok(true);
                };
                msg.set_tsx(ServerTsx::Invite(self.clone()));

                match self.try_emit(TsxEvent::AckReceived(msg)) {
                    None => Ok(true),
                    Some(TsxEvent::AckReceived(msg)) => {
                        *request = Some(msg);
                        Ok(false)
                    }
                    Some(_) => unreachable!(),
                }
            }
            (State::Proceeding | State::Completed, false) => {
                // INVITE retransmission: replay the latest response,
                // if one was sent.
                request.take();
                if self.last_msg().await.is_some() {
                    self.retransmit().await?;
                    self.emit(TsxEvent::RequestRetransmit);
                }
                Ok(true)
            }
            (State::Accepted, false) => {
                // RFC 6026: INVITE retransmissions in Accepted are
                // absorbed; 2xx retransmissions come from the TU.
                request.take();
                Ok(true)
            }
            _ => {
                request.take();
                Ok(true)
            }
        }
    }
}

impl Transaction for InvServerTransaction {
    /// Enters the Timer I linger: immediate on reliable transports, T4
    /// on unreliable ones.
    fn terminate(&self) {
        if self.reliable() {
            self.on_terminated();
        } else {
            let t4 = self.settings().t4;
            self.arm_timer(TimerId::I, t4);
            self.schedule_termination(t4, TsxTermination::Normal);
        }
    }
}

impl Deref for InvServerTransaction {
    type Target = TransactionInner;

    fn deref(&self) -> &Self::Target {
        &self.transaction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::mock;
    use tokio::time::Duration;

    async fn tsx_uas_params() -> (Endpoint, IncomingRequest) {
        let endpoint = mock::default_endpoint().await;
        let request = mock::request(Method::Invite);

        (endpoint, request)
    }

    fn inv_response(c: StatusCode) -> OutgoingResponse {
        mock::response_with_cseq(c, crate::headers::CSeq::new(1, Method::Invite))
    }

    #[tokio::test]
    async fn test_receives_100_trying() {
        let (endpoint, mut request) = tsx_uas_params().await;
        let tsx = InvServerTransaction::new(&endpoint, &mut request).unwrap();

        tsx.respond(inv_response(StatusCode::TRYING)).await.unwrap();

        assert!(tsx.get_state() == State::Proceeding);
    }

    #[tokio::test]
    async fn test_receives_180_ringing() {
        let (endpoint, mut request) = tsx_uas_params().await;
        let tsx = InvServerTransaction::new(&endpoint, &mut request).unwrap();

        tsx.respond(inv_response(StatusCode::TRYING)).await.unwrap();
        tsx.respond(inv_response(StatusCode::RINGING)).await.unwrap();

        assert!(tsx.get_state() == State::Proceeding);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_trying_after_200ms() {
        let (endpoint, mut request) = tsx_uas_params().await;
        let tsx = InvServerTransaction::new(&endpoint, &mut request).unwrap();

        assert_eq!(tsx.last_status_code(), None);

        time::sleep(TRYING_DELAY + Duration::from_millis(10)).await;
        tokio::task::yield_now().await;

        assert_eq!(tsx.last_status_code(), Some(StatusCode::TRYING));
        assert_eq!(tsx.get_state(), State::Proceeding);
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_provisional_suppresses_auto_trying() {
        let (endpoint, mut request) = tsx_uas_params().await;
        let tsx = InvServerTransaction::new(&endpoint, &mut request).unwrap();

        tsx.respond(inv_response(StatusCode::RINGING)).await.unwrap();

        time::sleep(TRYING_DELAY + Duration::from_millis(10)).await;
        tokio::task::yield_now().await;

        assert_eq!(tsx.last_status_code(), Some(StatusCode::RINGING));
    }

    #[tokio::test]
    async fn test_2xx_moves_to_accepted() {
        let (endpoint, mut request) = tsx_uas_params().await;
        let tsx = InvServerTransaction::new(&endpoint, &mut request).unwrap();

        tsx.respond(inv_response(StatusCode::OK)).await.unwrap();

        assert_eq!(tsx.get_state(), State::Accepted);
    }

    #[tokio::test]
    async fn test_ack_in_completed_confirms() {
        let (endpoint, mut request) = tsx_uas_params().await;
        let tsx = InvServerTransaction::new(&endpoint, &mut request).unwrap();

        tsx.respond(inv_response(StatusCode::BUSY_HERE)).await.unwrap();
        assert_eq!(tsx.get_state(), State::Completed);

        let mut ack = Some(mock::request(Method::Ack));
        let handled = tsx.receive_request(&mut ack).await.unwrap();

        assert!(handled);
        assert_eq!(tsx.get_state(), State::Confirmed);
    }

    #[tokio::test]
    async fn test_ack_in_confirmed_absorbed() {
        let (endpoint, mut request) = tsx_uas_params().await;
        let tsx = InvServerTransaction::new(&endpoint, &mut request).unwrap();

        tsx.respond(inv_response(StatusCode::BUSY_HERE)).await.unwrap();

        let mut ack = Some(mock::request(Method::Ack));
        tsx.receive_request(&mut ack).await.unwrap();

        let count = tsx.retrans_count();
        let mut second_ack = Some(mock::request(Method::Ack));
        let handled = tsx.receive_request(&mut second_ack).await.unwrap();

        assert!(handled);
        assert!(second_ack.is_none());
        assert_eq!(tsx.retrans_count(), count);
    }

    #[tokio::test]
    async fn test_second_final_is_state_violation() {
        let (endpoint, mut request) = tsx_uas_params().await;
        let tsx = InvServerTransaction::new(&endpoint, &mut request).unwrap();

        tsx.respond(inv_response(StatusCode::BUSY_HERE)).await.unwrap();

        let err = tsx.respond(inv_response(StatusCode::NOT_FOUND)).await.unwrap_err();
        assert_matches!(err, Error::StateViolation { .. });
    }

    #[tokio::test(start_paused = true)]
    async fn test_invite_timer_g_retransmission() {
        let (endpoint, mut request) = tsx_uas_params().await;
        let tsx = InvServerTransaction::new(&endpoint, &mut request).unwrap();

        tsx.respond(inv_response(StatusCode::BUSY_HERE)).await.unwrap();

        time::sleep(Duration::from_millis(500) + Duration::from_millis(1)).await;
        assert!(tsx.retrans_count() == 1);

        time::sleep(Duration::from_secs(1) + Duration::from_millis(1)).await;
        assert!(tsx.retrans_count() == 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_h_expiration() {
        let (endpoint, mut request) = tsx_uas_params().await;
        let tsx = InvServerTransaction::new(&endpoint, &mut request).unwrap();
        let mut events = tsx.subscribe();

        tsx.respond(inv_response(StatusCode::BUSY_HERE)).await.unwrap();

        time::sleep(Duration::from_millis(500) * 64 + Duration::from_millis(1)).await;

        assert!(tsx.get_state() == State::Terminated);
        assert_matches!(events.recv().await, Some(TsxEvent::Terminated(TsxTermination::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_i_after_ack() {
        let (endpoint, mut request) = tsx_uas_params().await;
        let tsx = InvServerTransaction::new(&endpoint, &mut request).unwrap();

        tsx.respond(inv_response(StatusCode::BUSY_HERE)).await.unwrap();

        let mut ack = Some(mock::request(Method::Ack));
        tsx.receive_request(&mut ack).await.unwrap();
        assert_eq!(tsx.get_state(), State::Confirmed);

        time::sleep(Duration::from_secs(5) + Duration::from_millis(1)).await;
        assert_eq!(tsx.get_state(), State::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_l_in_accepted() {
        let (endpoint, mut request) = tsx_uas_params().await;
        let tsx = InvServerTransaction::new(&endpoint, &mut request).unwrap();

        tsx.respond(inv_response(StatusCode::OK)).await.unwrap();
        assert_eq!(tsx.get_state(), State::Accepted);

        time::sleep(Duration::from_millis(500) * 64 + Duration::from_millis(1)).await;
        assert_eq!(tsx.get_state(), State::Terminated);
    }

    #[tokio::test]
    async fn test_ack_in_accepted_passes_up() {
        let (endpoint, mut request) = tsx_uas_params().await;
        let tsx = InvServerTransaction::new(&endpoint, &mut request).unwrap();
        let mut events = tsx.subscribe();

        tsx.respond(inv_response(StatusCode::OK)).await.unwrap();

        let mut ack = Some(mock::request(Method::Ack));
        let handled = tsx.receive_request(&mut ack).await.unwrap();

        assert!(handled);
        assert_matches!(events.try_recv(), Ok(TsxEvent::AckReceived(_)));
    }
}
