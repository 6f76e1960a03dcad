use crate::{
    transport::{IncomingRequest, IncomingResponse},
    Endpoint, Result,
};

/// A trait which provides a way to extend the SIP endpoint functionalities.
///
/// Services see inbound messages the transaction layer did not absorb,
/// in registration order. A service takes ownership of a message by
/// `take()`-ing it out of the `Option`; later services then no longer
/// see it.
#[async_trait::async_trait]
#[allow(unused_variables)]
pub trait SipService: Sync + Send + 'static {
    /// Returns the service name.
    fn name(&self) -> &str;

    /// Called when an inbound SIP request is received.
    async fn on_incoming_request(&self, endpoint: &Endpoint, request: &mut Option<IncomingRequest>) -> Result<()> {
        Ok(())
    }

    /// Called when an inbound SIP response is received.
    async fn on_incoming_response(&self, endpoint: &Endpoint, response: &mut Option<IncomingResponse>) -> Result<()> {
        Ok(())
    }
}
