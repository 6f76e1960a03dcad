//! Endpoint configuration.

use std::time::Duration;

/// Tunable parameters recognized by the endpoint.
///
/// All timer arithmetic in the transaction layer derives from `t1`,
/// `t2` and `t4`; the remaining fields control transport selection and
/// message autofill.
///
/// # Examples
///
/// ```
/// # use sipkit::Settings;
/// # use std::time::Duration;
/// let settings = Settings {
///     t1: Duration::from_millis(100),
///     ..Default::default()
/// };
/// assert_eq!(settings.timeout(), Duration::from_millis(6400));
/// ```
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base retransmit interval, RFC 3261 T1.
    pub t1: Duration,
    /// Max retransmit interval for non-INVITE requests and INVITE
    /// responses, RFC 3261 T2.
    pub t2: Duration,
    /// Max duration a message remains in the network, RFC 3261 T4.
    pub t4: Duration,
    /// Default `Max-Forwards` for requests lacking the header.
    pub max_forwards: u32,
    /// `User-Agent` inserted on requests when missing. `None` disables
    /// the autofill.
    pub user_agent: Option<String>,
    /// `Server` inserted on responses when missing. `None` disables the
    /// autofill.
    pub server: Option<String>,
    /// Serialized size beyond which a UDP request is upgraded to a
    /// reliable transport, RFC 3261 18.1.1.
    pub udp_mtu_threshold: usize,
    /// Idle timeout for pooled stream connections. `None` keeps
    /// connections until the peer closes them.
    pub connection_ttl: Option<Duration>,
}

impl Settings {
    /// The 64*T1 transaction timeout budget used by Timers B, F, H, J,
    /// L and M.
    pub fn timeout(&self) -> Duration {
        self.t1 * 64
    }
}

impl Default for Settings {
    fn default() -> Self {
        let t1 = Duration::from_millis(500);

        Settings {
            t1,
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            max_forwards: 70,
            user_agent: Some(concat!("sipkit/", env!("CARGO_PKG_VERSION")).to_string()),
            server: Some(concat!("sipkit/", env!("CARGO_PKG_VERSION")).to_string()),
            udp_mtu_threshold: 1300,
            connection_ttl: Some(t1 * 64),
        }
    }
}
