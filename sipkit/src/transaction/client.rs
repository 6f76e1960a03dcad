//! Non-INVITE client transaction, RFC 3261 17.1.2.

use std::ops::Deref;
use std::time::Duration;

use futures_util::future::{self, Either};
use tokio::{pin, time};

use crate::{
    endpoint::Endpoint,
    error::Result,
    message::Method,
    timer::TimerId,
    transaction::{ClientTsx, State, Transaction, TransactionInner, TsxEvent, TsxKind, TsxTermination},
    transport::{IncomingResponse, OutgoingRequest},
};

/// Initial budgets for the retransmit and timeout timers, full on a
/// fresh transaction, partially spent after a snapshot restore.
pub(crate) struct RetransBudgets {
    /// Next retransmit interval (Timer E/A/G family).
    pub retrans: Duration,
    /// Remaining transaction timeout (Timer F/B/H family).
    pub timeout: Duration,
}

/// Represents a Client non-INVITE transaction.
///
/// Sends the request, retransmits on unreliable transports with Timer
/// E backoff, gives up when Timer F fires and lingers in Completed for
/// Timer K to absorb response retransmissions.
#[derive(Clone)]
pub struct ClientTransaction {
    transaction: TransactionInner,
}

impl ClientTransaction {
    /// Sends the request and registers the new transaction.
    pub async fn send(mut request: OutgoingRequest, endpoint: &Endpoint) -> Result<ClientTransaction> {
        let method = request.msg.method();

        assert!(
            !matches!(method, Method::Invite | Method::Ack),
            "Invalid method for non-INVITE client transaction: {}",
            method
        );

        let transaction = TransactionInner::new_tsx_uac(&request, endpoint, TsxKind::NonInviteClient, State::Trying);
        transaction.tsx_send_request(&mut request).await?;

        let uac = ClientTransaction { transaction };

        endpoint.transactions().add_client_tsx(ClientTsx::NonInvite(uac.clone()))?;

        let settings = uac.settings();
        uac.spawn_retrans_task(RetransBudgets {
            retrans: settings.t1,
            timeout: settings.timeout(),
        });

        Ok(uac)
    }

    pub(crate) fn from_core(transaction: TransactionInner) -> Self {
        Self { transaction }
    }

    pub(crate) fn spawn_retrans_task(&self, budgets: RetransBudgets) {
        self.arm_timer(TimerId::F, budgets.timeout);
        if !self.reliable() {
            self.arm_timer(TimerId::E, budgets.retrans);
        }

        tokio::spawn(self.clone().tsx_retrans_task(budgets));
    }

    async fn tsx_retrans_task(self, budgets: RetransBudgets) -> Result<()> {
        let settings = self.settings();
        let done = self.done();

        pin! {
            let timer_f = time::sleep(budgets.timeout);
            let timer_e = if !self.reliable() {
                Either::Left(time::sleep(budgets.retrans))
            } else {
                Either::Right(future::pending::<()>())
            };
        }

        'retrans: loop {
            let active = matches!(self.get_state(), State::Trying | State::Proceeding);

            tokio::select! {
                _ = &mut timer_e, if active => {
                    match self.retransmit().await {
                        Ok(retrans) => {
                            // Once Proceeding, retransmissions continue
                            // at T2 (17.1.2.2).
                            let interval = if self.get_state() == State::Proceeding {
                                settings.t2
                            } else {
                                super::backoff(settings.t1, settings.t2, retrans)
                            };
                            self.arm_timer(TimerId::E, interval);
                            timer_e.set(Either::Left(time::sleep(interval)));
                        }
                        Err(err) => {
                            log::info!("Failed to retransmit: {}", err);
                            self.terminate_with(TsxTermination::Transport(err.to_string()));
                            break 'retrans Ok(());
                        }
                    }
                }
                _ = &mut timer_f, if active => {
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
            State::Trying if code.is_provisional() => {
                self.change_state_to(State::Proceeding);
                Ok(self.pass_up(response))
            }
            State::Proceeding if code.is_provisional() => Ok(self.pass_up(response)),
            State::Trying | State::Proceeding if code.is_final() => {
                self.change_state_to(State::Completed);
                self.disarm_timer(TimerId::E);
                self.disarm_timer(TimerId::F);
                self.terminate();

                Ok(self.pass_up(response))
            }
            State::Completed => {
                // 17.1.2.2: retransmitted final responses in Completed
                // are absorbed.
                response.take();
                Ok(true)
            }
            _ => {
                response.take();
                Ok(true)
            }
        }
    }

    fn pass_up(&self, response: &mut Option<IncomingResponse>) -> bool {
        let Some(mut msg) = response.take() else {
            return true;
        };
        msg.transaction = Some(ClientTsx::NonInvite(self.clone()));

        match self.try_emit(TsxEvent::Response(msg)) {
            None => true,
            Some(TsxEvent::Response(msg)) => {
                // No subscriber; hand the response to the services.
                *response = Some(msg);
                false
            }
            Some(_) => unreachable!(),
        }
    }
}

impl Transaction for ClientTransaction {
    /// Enters the Timer K linger: immediate on reliable transports, T4
    /// on unreliable ones.
    fn terminate(&self) {
        if self.reliable() {
            self.on_terminated();
        } else {
            let t4 = self.settings().t4;
            self.arm_timer(TimerId::K, t4);
            self.schedule_termination(t4, TsxTermination::Normal);
        }
    }
}

impl Deref for ClientTransaction {
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
    async fn test_state_trying() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(Method::Register);

        let uac = ClientTransaction::send(request, &endpoint).await.unwrap();

        assert_eq!(uac.get_state(), State::Trying);
    }

    #[tokio::test]
    async fn test_provisional_moves_to_proceeding() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(Method::Register);
        let mut response = Some(mock::incoming_response(StatusCode::TRYING));

        let uac = ClientTransaction::send(request, &endpoint).await.unwrap();
        uac.receive(&mut response).await.unwrap();

        assert_eq!(uac.get_state(), State::Proceeding);
    }

    #[tokio::test]
    async fn test_final_completes_and_reports() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(Method::Register);
        let mut response = Some(mock::incoming_response(StatusCode::OK));

        let uac = ClientTransaction::send(request, &endpoint).await.unwrap();
        let mut events = uac.subscribe();

        uac.receive(&mut response).await.unwrap();

        assert_eq!(uac.get_state(), State::Completed);
        assert_eq!(uac.last_status_code(), Some(StatusCode::OK));
        assert_matches!(events.recv().await, Some(TsxEvent::Response(_)));
    }

    #[tokio::test]
    async fn test_retransmitted_final_absorbed() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(Method::Register);

        let uac = ClientTransaction::send(request, &endpoint).await.unwrap();

        let mut first = Some(mock::incoming_response(StatusCode::OK));
        uac.receive(&mut first).await.unwrap();

        let mut retrans = Some(mock::incoming_response(StatusCode::OK));
        let handled = uac.receive(&mut retrans).await.unwrap();

        assert!(handled);
        assert!(retrans.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_e_backoff_caps_at_t2() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(Method::Register);

        let uac = ClientTransaction::send(request, &endpoint).await.unwrap();

        assert!(uac.retrans_count() == 0);

        time::sleep(Duration::from_millis(500 + 1)).await;
        assert!(uac.retrans_count() == 1);

        time::sleep(Duration::from_secs(1) + Duration::from_millis(1)).await;
        assert!(uac.retrans_count() == 2);

        time::sleep(Duration::from_secs(2) + Duration::from_millis(1)).await;
        assert!(uac.retrans_count() == 3);

        time::sleep(Duration::from_secs(4) + Duration::from_millis(1)).await;
        assert!(uac.retrans_count() == 4);

        time::sleep(Duration::from_secs(4) + Duration::from_millis(1)).await;
        assert!(uac.retrans_count() == 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_f_times_out() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(Method::Register);

        let uac = ClientTransaction::send(request, &endpoint).await.unwrap();
        let mut events = uac.subscribe();

        time::sleep(Duration::from_millis(500) * 64 + Duration::from_millis(1)).await;

        assert_eq!(uac.get_state(), State::Terminated);
        assert_matches!(events.recv().await, Some(TsxEvent::Terminated(TsxTermination::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_k_lingers_then_terminates() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(Method::Register);
        let mut response = Some(mock::incoming_response(StatusCode::OK));

        let uac = ClientTransaction::send(request, &endpoint).await.unwrap();
        uac.receive(&mut response).await.unwrap();

        assert_eq!(uac.get_state(), State::Completed);

        time::sleep(Duration::from_secs(5) + Duration::from_millis(1)).await;
        assert_eq!(uac.get_state(), State::Terminated);
    }
}
