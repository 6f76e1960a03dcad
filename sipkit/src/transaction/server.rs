//! Non-INVITE server transaction, RFC 3261 17.2.2.

use std::ops::Deref;

use crate::{
    endpoint::Endpoint,
    error::{Error, Result},
    message::{CodeClass, Method},
    timer::TimerId,
    transaction::{ServerTsx, State, Transaction, TransactionInner, TsxKind, TsxTermination},
    transport::{IncomingRequest, OutgoingResponse},
};

/// Represents a Server non-INVITE transaction.
///
/// Trying -> Proceeding -> Completed -> Terminated. Request
/// retransmissions replay the last provisional or final response;
/// Timer J bounds the Completed linger on unreliable transports.
#[derive(Clone, Debug)]
pub struct ServerTransaction {
    transaction: TransactionInner,
}

impl ServerTransaction {
    pub(crate) fn new(endpoint: &Endpoint, request: &mut IncomingRequest) -> Result<Self> {
        let method = request.method();

        assert!(
            !matches!(method, Method::Invite | Method::Ack),
            "Invalid method for non-INVITE server transaction: {}",
            method
        );

        let transaction = TransactionInner::new_tsx_uas(request, endpoint, TsxKind::NonInviteServer, State::Trying);
        let uas = Self { transaction };

        endpoint.transactions().add_server_tsx(ServerTsx::NonInvite(uas.clone()))?;
        request.set_tsx(ServerTsx::NonInvite(uas.clone()));

        Ok(uas)
    }

    pub(crate) fn from_core(transaction: TransactionInner) -> Self {
        Self { transaction }
    }

    /// Sends a response for the transaction.
    ///
    /// A provisional moves Trying to Proceeding; a final moves to
    /// Completed and arms Timer J. A second final is a state
    /// violation and leaves the transaction untouched.
    pub async fn respond(&self, mut response: OutgoingResponse) -> Result<()> {
        let state = self.get_state();
        let class = response.status_code().class();

        match (state, class) {
            (State::Trying | State::Proceeding, CodeClass::Provisional) => {
                self.tsx_send_response(&mut response).await?;
                self.change_state_to(State::Proceeding);
                Ok(())
            }
            (State::Trying | State::Proceeding, _) => {
                self.tsx_send_response(&mut response).await?;
                self.change_state_to(State::Completed);
                self.terminate();
                Ok(())
            }
            (state, _) => Err(Error::StateViolation {
                state,
                op: "send_response",
            }),
        }
    }

    pub(crate) async fn receive_request(&self, request: &mut Option<IncomingRequest>) -> Result<bool> {
        request.take();

        match self.get_state() {
            State::Proceeding | State::Completed => {
                // 17.2.2: a request retransmission replays the most
                // recent response.
                self.retransmit().await?;
                self.emit(crate::transaction::TsxEvent::RequestRetransmit);
                Ok(true)
            }
            _ => Ok(true),
        }
    }
}

impl Transaction for ServerTransaction {
    /// Enters the Timer J linger: immediate on reliable transports,
    /// 64*T1 on unreliable ones.
    fn terminate(&self) {
        if self.reliable() {
            self.on_terminated();
        } else {
            let timeout = self.settings().timeout();
            self.arm_timer(TimerId::J, timeout);
            self.schedule_termination(timeout, TsxTermination::Normal);
        }
    }
}

impl Deref for ServerTransaction {
    type Target = TransactionInner;

    fn deref(&self) -> &Self::Target {
        &self.transaction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::StatusCode;
    use crate::transaction::mock;
    use tokio::time::{self, Duration};

    #[tokio::test]
    async fn test_trying_to_proceeding() {
        let endpoint = mock::default_endpoint().await;
        let mut request = mock::request(Method::Register);

        let uas = ServerTransaction::new(&endpoint, &mut request).unwrap();
        assert_eq!(uas.get_state(), State::Trying);

        uas.respond(mock::response(StatusCode::TRYING)).await.unwrap();
        assert_eq!(uas.get_state(), State::Proceeding);
    }

    #[tokio::test]
    async fn test_final_completes() {
        let endpoint = mock::default_endpoint().await;
        let mut request = mock::request(Method::Register);

        let uas = ServerTransaction::new(&endpoint, &mut request).unwrap();
        uas.respond(mock::response(StatusCode::OK)).await.unwrap();

        assert_eq!(uas.get_state(), State::Completed);
        assert_eq!(uas.last_status_code(), Some(StatusCode::OK));
    }

    #[tokio::test]
    async fn test_second_final_is_state_violation() {
        let endpoint = mock::default_endpoint().await;
        let mut request = mock::request(Method::Register);

        let uas = ServerTransaction::new(&endpoint, &mut request).unwrap();
        uas.respond(mock::response(StatusCode::OK)).await.unwrap();

        let err = uas.respond(mock::response(StatusCode::NOT_FOUND)).await.unwrap_err();

        assert_matches!(
            err,
            Error::StateViolation {
                state: State::Completed,
                ..
            }
        );
        // The violation left the transaction untouched.
        assert_eq!(uas.last_status_code(), Some(StatusCode::OK));
    }

    #[tokio::test]
    async fn test_retransmit_replays_last_response() {
        let endpoint = mock::default_endpoint().await;
        let mut request = mock::request(Method::Register);

        let uas = ServerTransaction::new(&endpoint, &mut request).unwrap();
        uas.respond(mock::response(StatusCode::OK)).await.unwrap();

        let mut retrans = Some(mock::request(Method::Register));
        let handled = uas.receive_request(&mut retrans).await.unwrap();

        assert!(handled);
        assert_eq!(uas.retrans_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_j_on_udp() {
        let endpoint = mock::default_endpoint().await;
        let mut request = mock::request(Method::Register);

        let uas = ServerTransaction::new(&endpoint, &mut request).unwrap();
        uas.respond(mock::response(StatusCode::OK)).await.unwrap();

        assert_eq!(uas.get_state(), State::Completed);

        time::sleep(Duration::from_millis(500) * 64 + Duration::from_millis(1)).await;

        assert_eq!(uas.get_state(), State::Terminated);
    }
}
