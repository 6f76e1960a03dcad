//! INVITE client transaction, RFC 3261 17.1.1 and RFC 6026.

use std::{
    ops::Deref,
    sync::Arc,
    time::Duration,
};

use futures_util::future::{self, Either};
use tokio::{pin, time};

use crate::{
    endpoint::Endpoint,
    error::{Error, Result},
    headers::{self, CSeq, Header, Headers},
    message::{Method, Request, RequestLine, SipUri},
    timer::TimerId,
    transaction::{
        client::RetransBudgets, ClientTsx, State, Transaction, TransactionInner, TsxEvent, TsxKind, TsxTermination,
    },
    transport::{IncomingResponse, OutgoingRequest},
};

const TIMER_D: Duration = Duration::from_secs(32);

pub(crate) struct OriginalRequest {
    uri: SipUri,
    via: headers::Via,
    from: headers::From,
    cseq: CSeq,
    call_id: headers::CallId,
}

impl OriginalRequest {
    pub(crate) fn from_request(request: &Request) -> Self {
        let headers = &request.headers;

        Self {
            uri: request.req_line.uri.clone(),
            via: headers.via().expect("INVITE carries a Via").clone(),
            from: headers.from_hdr().expect("INVITE carries a From").clone(),
            cseq: headers.cseq().expect("INVITE carries a CSeq").clone(),
            call_id: headers.call_id().expect("INVITE carries a Call-ID").clone(),
        }
    }
}

/// Represents a Client INVITE transaction.
///
/// Calling -> Proceeding -> Completed/Accepted -> Terminated. The
/// transaction owns the automatic ACK for non-2xx final responses; the
/// ACK for a 2xx is the TU's, sent outside any transaction.
#[derive(Clone)]
pub struct InvClientTransaction {
    transaction: TransactionInner,
    request: Arc<OriginalRequest>,
}

impl InvClientTransaction {
    /// Sends the INVITE and registers the new transaction.
    pub async fn send(mut request: OutgoingRequest, endpoint: &Endpoint) -> Result<InvClientTransaction> {
        let method = request.msg.method();

        assert!(
            matches!(method, Method::Invite),
            "Invalid method for client INVITE transaction: expected INVITE, got: {}",
            method
        );

        let transaction = TransactionInner::new_tsx_uac(&request, endpoint, TsxKind::InviteClient, State::Calling);
        transaction.tsx_send_request(&mut request).await?;

        let original = Arc::new(OriginalRequest::from_request(&request.msg));
        let uac_inv = InvClientTransaction {
            transaction,
            request: original,
        };

        endpoint
            .transactions()
            .add_client_tsx(ClientTsx::Invite(uac_inv.clone()))?;

        let settings = uac_inv.settings();
        uac_inv.spawn_retrans_task(RetransBudgets {
            retrans: settings.t1,
            timeout: settings.timeout(),
        });

        Ok(uac_inv)
    }

    pub(crate) fn with_parts(transaction: TransactionInner, original: OriginalRequest) -> Self {
        Self {
            transaction,
            request: Arc::new(original),
        }
    }

    pub(crate) fn spawn_retrans_task(&self, budgets: RetransBudgets) {
        self.arm_timer(TimerId::B, budgets.timeout);
        if !self.reliable() {
            self.arm_timer(TimerId::A, budgets.retrans);
        }

        tokio::spawn(self.clone().tsx_retrans_task(budgets));
    }

    async fn tsx_retrans_task(self, budgets: RetransBudgets) -> Result<()> {
        let settings = self.settings();
        let done = self.done();

        pin! {
            let timer_b = time::sleep(budgets.timeout);
            let timer_a = if !self.reliable() {
                Either::Left(time::sleep(budgets.retrans))
            } else {
                Either::Right(future::pending::<()>())
            };
        }

        'retrans: loop {
            let awaiting_final = matches!(self.get_state(), State::Calling | State::Proceeding);

            tokio::select! {
                _ = &mut timer_a, if self.is_calling() => {
                    match self.retransmit().await {
                        Ok(retrans) => {
                            // Timer A doubles without a cap; 64*T1
                            // total is bounded by Timer B.
                            let interval = settings.t1 * (1u32 << retrans.min(16));
                            self.arm_timer(TimerId::A, interval);
                            timer_a.set(Either::Left(time::sleep(interval)));
                        }
                        Err(err) => {
                            log::info!("Failed to retransmit: {}", err);
                            self.terminate_with(TsxTermination::Transport(err.to_string()));
                            break 'retrans Ok(());
                        }
                    }
                }
                _ = &mut timer_b, if awaiting_final => {
                    // Timeout
                    self.terminate_with(TsxTermination::Timeout);
                    break 'retrans Ok(());
                }
                _ = done.cancelled() => break 'retrans Ok(()),
            }
        }
    }

    pub(crate) async fn receive(&self, response: &mut Option<IncomingResponse>) -> Result<bool> {
        let code = {
            let msg = response.as_ref().expect("Response is present");
            msg.code()
        };
        self.set_last_status_code(code);

        match self.get_state() {
            State::Calling | State::Proceeding if code.is_provisional() => {
                self.disarm_timer(TimerId::A);
                self.change_state_to(State::Proceeding);
                Ok(self.pass_up(response))
            }
            State::Calling | State::Proceeding if matches!(code.code(), 300..=699) => {
                self.change_state_to(State::Completed);
                self.disarm_timer(TimerId::A);
                self.disarm_timer(TimerId::B);

                let ack = {
                    let msg = response.as_ref().expect("Response is present");
                    self.create_ack(msg)
                };
                let mut ack = ack;
                self.tsx_send_request(&mut ack).await?;
                self.terminate();

                Ok(self.pass_up(response))
            }
            State::Calling | State::Proceeding if code.is_success() => {
                // RFC 6026: 2xx moves the transaction to Accepted; the
                // ACK is the TU's business.
                self.change_state_to(State::Accepted);
                self.disarm_timer(TimerId::A);
                self.disarm_timer(TimerId::B);

                let timeout = self.settings().timeout();
                self.arm_timer(TimerId::M, timeout);
                self.schedule_termination(timeout, TsxTermination::Normal);

                Ok(self.pass_up(response))
            }
            State::Accepted if code.is_success() => {
                // Retransmitted or forked 2xx, passed up per RFC 6026.
                Ok(self.pass_up(response))
            }
            State::Completed => {
                // 17.1.1.2: retransmitted final responses trigger an
                // ACK retransmit but are not passed up.
                self.retransmit().await?;
                response.take();

                Ok(true)
            }
            _ => {
                response.take();
                Ok(true)
            }
        }
    }

    /// Instructs the TU to send a CANCEL for this INVITE. The
    /// transaction itself continues until a 487 final response or a
    /// timeout.
    pub fn cancel(&self) -> Result<()> {
        match self.get_state() {
            State::Calling | State::Proceeding => {
                self.emit(TsxEvent::CancelRequested);
                Ok(())
            }
            state => Err(Error::StateViolation { state, op: "cancel" }),
        }
    }

    fn pass_up(&self, response: &mut Option<IncomingResponse>) -> bool {
        let Some(mut msg) = response.take() else {
            return true;
        };
        msg.transaction = Some(ClientTsx::Invite(self.clone()));

        match self.try_emit(TsxEvent::Response(msg)) {
            None => true,
            Some(TsxEvent::Response(msg)) => {
                *response = Some(msg);
                false
            }
            Some(_) => unreachable!(),
        }
    }

    /// Builds the ACK for a non-2xx final response (17.1.1.3): the
    /// original Request-URI, Via (same branch), From, Call-ID and CSeq
    /// number, with the To taken from the response so its tag matches.
    fn create_ack(&self, response: &IncomingResponse) -> OutgoingRequest {
        let to = response.to().clone();
        let cseq = self.request.cseq.with_method(Method::Ack);

        let original = &self.request;
        let mut ack_hdrs = Headers::with_capacity(5);

        ack_hdrs.push(Header::Via(original.via.clone()));
        ack_hdrs.push(Header::From(original.from.clone()));
        ack_hdrs.push(Header::To(to));
        ack_hdrs.push(Header::CallId(original.call_id.clone()));
        ack_hdrs.push(Header::CSeq(cseq));

        OutgoingRequest {
            msg: Request {
                req_line: RequestLine {
                    method: Method::Ack,
                    uri: original.uri.clone(),
                },
                headers: ack_hdrs,
                body: None,
            },
            addr: self.addr(),
            buf: None,
            transport: self.transport(),
        }
    }
}

impl Transaction for InvClientTransaction {
    /// Enters the Timer D linger: immediate on reliable transports,
    /// 32 seconds on unreliable ones.
    fn terminate(&self) {
        if self.reliable() {
            self.on_terminated();
        } else {
            // Start timer D
            self.arm_timer(TimerId::D, TIMER_D);
            self.schedule_termination(TIMER_D, TsxTermination::Normal);
        }
    }
}

impl Deref for InvClientTransaction {
    type Target = TransactionInner;

    fn deref(&self) -> &Self::Target {
        &self.transaction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{message::StatusCode, transaction::mock};
    use tokio::time::{self, Duration};

    #[tokio::test]
    async fn test_state_calling() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(Method::Invite);

        let uac_inv = InvClientTransaction::send(request, &endpoint).await.unwrap();

        assert_eq!(uac_inv.get_state(), State::Calling);
    }

    #[tokio::test]
    async fn test_state_proceeding() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(Method::Invite);
        let mut response = Some(mock::incoming_response_with(
            StatusCode::TRYING,
            CSeq::new(1, Method::Invite),
        ));

        let uac_inv = InvClientTransaction::send(request, &endpoint).await.unwrap();

        uac_inv.receive(&mut response).await.unwrap();

        assert_eq!(uac_inv.get_state(), State::Proceeding);
    }

    #[tokio::test]
    async fn test_state_completed_sends_ack() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(Method::Invite);
        let mut response = Some(mock::incoming_response_with(
            StatusCode::BUSY_HERE,
            CSeq::new(1, Method::Invite),
        ));

        let uac_inv = InvClientTransaction::send(request, &endpoint).await.unwrap();

        uac_inv.receive(&mut response).await.unwrap();

        assert_eq!(uac_inv.last_status_code(), Some(StatusCode::BUSY_HERE));
        assert_eq!(uac_inv.get_state(), State::Completed);

        // The last message sent is now the ACK, carrying the
        // response's To tag.
        let ack = uac_inv.last_msg().await.unwrap();
        let text = std::str::from_utf8(&ack).unwrap();
        assert!(text.starts_with("ACK sip:bob@127.0.0.1:5060 SIP/2.0\r\n"));
        assert!(text.contains("CSeq: 1 ACK"));
        assert!(text.contains("tag=a6c85cf"));
    }

    #[tokio::test]
    async fn test_2xx_moves_to_accepted() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(Method::Invite);
        let mut response = Some(mock::incoming_response_with(
            StatusCode::OK,
            CSeq::new(1, Method::Invite),
        ));

        let uac_inv = InvClientTransaction::send(request, &endpoint).await.unwrap();

        uac_inv.receive(&mut response).await.unwrap();

        assert_eq!(uac_inv.get_state(), State::Accepted);
    }

    #[tokio::test]
    async fn test_retransmitted_final_triggers_second_ack() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(Method::Invite);

        let uac_inv = InvClientTransaction::send(request, &endpoint).await.unwrap();

        let mut first = Some(mock::incoming_response_with(
            StatusCode::BUSY_HERE,
            CSeq::new(1, Method::Invite),
        ));
        uac_inv.receive(&mut first).await.unwrap();

        let count = uac_inv.retrans_count();
        let mut retrans = Some(mock::incoming_response_with(
            StatusCode::BUSY_HERE,
            CSeq::new(1, Method::Invite),
        ));
        let handled = uac_inv.receive(&mut retrans).await.unwrap();

        assert!(handled);
        assert_eq!(uac_inv.retrans_count(), count + 1);
    }

    #[tokio::test]
    async fn test_cancel_emits_event() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(Method::Invite);

        let uac_inv = InvClientTransaction::send(request, &endpoint).await.unwrap();
        let mut events = uac_inv.subscribe();

        uac_inv.cancel().unwrap();

        assert_matches!(events.recv().await, Some(TsxEvent::CancelRequested));
    }

    #[tokio::test]
    async fn test_cancel_rejected_after_final() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(Method::Invite);
        let mut response = Some(mock::incoming_response_with(
            StatusCode::BUSY_HERE,
            CSeq::new(1, Method::Invite),
        ));

        let uac_inv = InvClientTransaction::send(request, &endpoint).await.unwrap();
        uac_inv.receive(&mut response).await.unwrap();

        assert_matches!(uac_inv.cancel(), Err(Error::StateViolation { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_a() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(Method::Invite);

        let uac_inv = InvClientTransaction::send(request, &endpoint).await.unwrap();

        assert!(uac_inv.retrans_count() == 0);
        assert_eq!(uac_inv.get_state(), State::Calling);

        time::sleep(Duration::from_millis(500 + 1)).await;
        assert!(uac_inv.retrans_count() == 1);

        time::sleep(Duration::from_secs(1) + Duration::from_millis(1)).await;
        assert!(uac_inv.retrans_count() == 2);

        time::sleep(Duration::from_secs(2) + Duration::from_millis(1)).await;
        assert!(uac_inv.retrans_count() == 3);

        time::sleep(Duration::from_secs(4) + Duration::from_millis(1)).await;
        assert!(uac_inv.retrans_count() == 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_b() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(Method::Invite);

        let uac_inv = InvClientTransaction::send(request, &endpoint).await.unwrap();

        assert_eq!(uac_inv.get_state(), State::Calling);

        time::sleep(Duration::from_millis(500) * 64 + Duration::from_millis(1)).await;

        assert!(uac_inv.get_state() == State::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_d() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(Method::Invite);
        let mut response = Some(mock::incoming_response_with(
            StatusCode::BUSY_HERE,
            CSeq::new(1, Method::Invite),
        ));

        let uac_inv = InvClientTransaction::send(request, &endpoint).await.unwrap();

        uac_inv.receive(&mut response).await.unwrap();

        assert_eq!(uac_inv.get_state(), State::Completed);

        time::sleep(TIMER_D + Duration::from_millis(1)).await;

        assert!(uac_inv.get_state() == State::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_m() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(Method::Invite);
        let mut response = Some(mock::incoming_response_with(
            StatusCode::OK,
            CSeq::new(1, Method::Invite),
        ));

        let uac_inv = InvClientTransaction::send(request, &endpoint).await.unwrap();
        uac_inv.receive(&mut response).await.unwrap();

        assert_eq!(uac_inv.get_state(), State::Accepted);

        time::sleep(Duration::from_millis(500) * 64 + Duration::from_millis(1)).await;

        assert_eq!(uac_inv.get_state(), State::Terminated);
    }
}
