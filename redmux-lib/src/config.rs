use std::time::Duration;

/// Parameters governing one [`Connection`](crate::Connection).
///
/// The defaults suit a local server; long haul links usually want a larger
/// `ping_interval`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Username passed to `HELLO`. Sent only together with `password`.
    pub username: Option<String>,

    /// Password passed to `HELLO`.
    pub password: Option<String>,

    /// Client name passed to `HELLO` via `SETNAME`.
    pub clientname: Option<String>,

    /// Argument sent with the health check ping.
    pub health_check_id: String,

    /// Deadline for name resolution.
    pub resolve_timeout: Duration,

    /// Deadline for the TCP connect.
    pub connect_timeout: Duration,

    /// Deadline for the TLS handshake, when the transport uses one.
    pub ssl_handshake_timeout: Duration,

    /// Period of health pings. The idle watchdog fails the connection when no
    /// bytes arrive for twice this interval.
    pub ping_interval: Duration,

    /// Advisory pause between `run` invocations; enforced by the caller that
    /// drives reconnection.
    pub reconnect_wait_interval: Duration,

    /// Hard ceiling on read buffer growth. A single response that does not
    /// fit is fatal.
    pub max_read_size: usize,

    /// Maximum aggregate nesting depth accepted from the server.
    pub max_nesting: usize,

    /// Merge queued requests into one socket write. Disabling this sends one
    /// request per write.
    pub coalesce_requests: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            username: None,
            password: None,
            clientname: None,
            health_check_id: String::from("redmux"),
            resolve_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            ssl_handshake_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(2),
            reconnect_wait_interval: Duration::from_secs(1),
            max_read_size: 64 * 1024 * 1024,
            max_nesting: 16,
            coalesce_requests: true,
        }
    }
}
