//! Endpoint configuration.

use std::time::Duration;

/// Recognized options of an endpoint. Field defaults match the documented
/// defaults; unknown keys in [`Config::apply`] are reported, not ignored.
#[derive(Clone, Debug)]
pub struct Config {
    /// Use plaintext framing instead of a TLS transport.
    pub disable_ssl: bool,
    /// Verification anchors for the TLS transport.
    pub openssl_cafile: Option<String>,
    pub openssl_capath: Option<String>,
    /// Local TLS identity.
    pub openssl_certificate: Option<String>,
    pub openssl_key: Option<String>,
    pub openssl_passphrase: Option<String>,
    /// When false, this endpoint only originates and terminates messages.
    pub forward: bool,
    /// Default backlog of a subscriber queue.
    pub subscriber_queue_size: usize,
    /// Default bound for `await_peer`.
    pub await_peer_timeout: Duration,
    /// Idle interval between keepalive pings on a peering.
    pub keepalive_interval: Duration,
    /// Bound for the hello exchange on a fresh connection.
    pub handshake_timeout: Duration,
    /// Age at which recorded path revocations are dropped.
    pub blacklist_max_age: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            disable_ssl: false,
            openssl_cafile: None,
            openssl_capath: None,
            openssl_certificate: None,
            openssl_key: None,
            openssl_passphrase: None,
            forward: true,
            subscriber_queue_size: 20,
            await_peer_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(20),
            handshake_timeout: Duration::from_secs(10),
            blacklist_max_age: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Applies one `key = value` pair from an external source. Returns an
    /// error naming the key for unknown options or unparsable values.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), String> {
        fn parse_bool(key: &str, value: &str) -> Result<bool, String> {
            value
                .parse()
                .map_err(|_| format!("{key}: expected a boolean, got {value:?}"))
        }
        fn parse_secs(key: &str, value: &str) -> Result<Duration, String> {
            value
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| format!("{key}: expected seconds, got {value:?}"))
        }

        match key {
            "disable_ssl" => self.disable_ssl = parse_bool(key, value)?,
            "openssl_cafile" => self.openssl_cafile = Some(value.to_string()),
            "openssl_capath" => self.openssl_capath = Some(value.to_string()),
            "openssl_certificate" => self.openssl_certificate = Some(value.to_string()),
            "openssl_key" => self.openssl_key = Some(value.to_string()),
            "openssl_passphrase" => self.openssl_passphrase = Some(value.to_string()),
            "forward" => self.forward = parse_bool(key, value)?,
            "subscriber.queue_size" => {
                self.subscriber_queue_size = value
                    .parse()
                    .map_err(|_| format!("{key}: expected an integer, got {value:?}"))?
            }
            "await_peer_timeout" => self.await_peer_timeout = parse_secs(key, value)?,
            other => return Err(format!("unrecognized option {other:?}")),
        }
        Ok(())
    }
}
