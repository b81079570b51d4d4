//! # Error Types
//!
//! Every fallible operation in the gateway returns [`GatewayError`]. The
//! variants follow the failure classes of the firmware: initialization
//! failures abort the boot, transport-side failures are recovered by
//! reconnecting, and the rest are reported and otherwise ignored.

use core::fmt;

use crate::supervisor::BootStage;

/// Convenience alias used throughout the crate.
pub type Result<T> = core::result::Result<T, GatewayError>;

/// The primary error enum of the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayError {
    /// A collaborator failed to come up during boot. Always fatal.
    InitializationFailure(BootStage),
    /// The transport layer below the publish client reported an error.
    Transport { code: i32 },
    /// The secure channel (TLS stack) reported an error.
    SecureChannel { code: i32 },
    /// The socket layer reported an errno.
    Socket { errno: i32 },
    /// The broker refused the session. The enclosed value is the reason code.
    ConnectionRefused { reason: u8 },
    /// The broker sent something the client could not make sense of.
    Protocol,
    /// The WiFi retry budget is spent; no automatic reconnect follows.
    ConnectivityExhausted { attempts: u8 },
    /// A GPIO event was dropped because the event queue was full.
    QueueSaturation,
    /// The radio reported a packet longer than the frame can hold.
    RadioReadOverrun { len: usize, capacity: usize },
    /// The radio driver failed an operation.
    Radio,
    /// The publish outbox is full; the request was not queued.
    OutboxFull,
    /// The publish bridge has not been installed yet.
    BridgeUnavailable,
    /// A topic or payload does not fit the request buffers.
    PayloadTooLarge { len: usize, capacity: usize },
    /// A configuration value could not be used.
    InvalidConfig(&'static str),
}

impl GatewayError {
    /// Errors that must abort the process.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::InitializationFailure(_))
    }

    /// Errors the publish bridge recovers from by opening a new session.
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::SecureChannel { .. }
                | Self::Socket { .. }
                | Self::ConnectionRefused { .. }
                | Self::Protocol
        )
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitializationFailure(stage) => write!(f, "{stage} failed to initialize"),
            Self::Transport { code } => write!(f, "transport error 0x{code:x}"),
            Self::SecureChannel { code } => write!(f, "secure channel error 0x{code:x}"),
            Self::Socket { errno } => {
                write!(f, "socket errno {errno} ({})", errno_name(*errno))
            }
            Self::ConnectionRefused { reason } => {
                write!(f, "broker refused connection (reason {reason})")
            }
            Self::Protocol => f.write_str("malformed broker response"),
            Self::ConnectivityExhausted { attempts } => {
                write!(f, "gave up on the access point after {attempts} attempts")
            }
            Self::QueueSaturation => f.write_str("GPIO event queue saturated"),
            Self::RadioReadOverrun { len, capacity } => {
                write!(f, "radio packet of {len} bytes overruns {capacity}-byte frame")
            }
            Self::Radio => f.write_str("radio driver error"),
            Self::OutboxFull => f.write_str("publish outbox full"),
            Self::BridgeUnavailable => f.write_str("publish bridge not initialized"),
            Self::PayloadTooLarge { len, capacity } => {
                write!(f, "{len} bytes do not fit in {capacity}")
            }
            Self::InvalidConfig(what) => write!(f, "invalid configuration: {what}"),
        }
    }
}

/// Short names for the errno values lwIP and embassy-net report.
pub fn errno_name(errno: i32) -> &'static str {
    match errno {
        0 => "no error",
        5 => "EIO",
        11 => "EAGAIN",
        12 => "ENOMEM",
        22 => "EINVAL",
        104 => "ECONNRESET",
        105 => "ENOBUFS",
        107 => "ENOTCONN",
        110 => "ETIMEDOUT",
        111 => "ECONNREFUSED",
        113 => "EHOSTUNREACH",
        _ => "unknown",
    }
}

/// Layer a client error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrorKind {
    /// Failure somewhere in the TCP / TLS / socket stack.
    Transport,
    /// The broker answered `CONNACK` with a refusal.
    ConnectionRefused(u8),
    /// The broker answered with something unexpected.
    Protocol,
}

/// Error report handed over by the publish client collaborator.
///
/// Transport failures carry up to three codes, one per layer. Each non-zero
/// code is a separate cause and is surfaced on its own by [`ClientError::causes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientError {
    pub kind: ClientErrorKind,
    /// Error reported by the transport (esp-tls style) layer.
    pub transport_code: i32,
    /// Error reported by the TLS stack.
    pub tls_stack_code: i32,
    /// Errno captured on the socket.
    pub socket_errno: i32,
}

impl ClientError {
    pub const fn transport(code: i32) -> Self {
        Self {
            kind: ClientErrorKind::Transport,
            transport_code: code,
            tls_stack_code: 0,
            socket_errno: 0,
        }
    }

    pub const fn secure_channel(code: i32) -> Self {
        Self {
            kind: ClientErrorKind::Transport,
            transport_code: 0,
            tls_stack_code: code,
            socket_errno: 0,
        }
    }

    pub const fn socket(errno: i32) -> Self {
        Self {
            kind: ClientErrorKind::Transport,
            transport_code: 0,
            tls_stack_code: 0,
            socket_errno: errno,
        }
    }

    pub const fn refused(reason: u8) -> Self {
        Self {
            kind: ClientErrorKind::ConnectionRefused(reason),
            transport_code: 0,
            tls_stack_code: 0,
            socket_errno: 0,
        }
    }

    pub const fn protocol() -> Self {
        Self {
            kind: ClientErrorKind::Protocol,
            transport_code: 0,
            tls_stack_code: 0,
            socket_errno: 0,
        }
    }

    /// Splits the report into one [`GatewayError`] per layer that failed.
    ///
    /// A transport report with every code at zero still yields a single
    /// `Transport { code: 0 }` so the failure is never swallowed.
    pub fn causes(&self) -> heapless::Vec<GatewayError, 3> {
        let mut causes = heapless::Vec::new();
        match self.kind {
            ClientErrorKind::ConnectionRefused(reason) => {
                let _ = causes.push(GatewayError::ConnectionRefused { reason });
            }
            ClientErrorKind::Protocol => {
                let _ = causes.push(GatewayError::Protocol);
            }
            ClientErrorKind::Transport => {
                if self.transport_code != 0 {
                    let _ = causes.push(GatewayError::Transport {
                        code: self.transport_code,
                    });
                }
                if self.tls_stack_code != 0 {
                    let _ = causes.push(GatewayError::SecureChannel {
                        code: self.tls_stack_code,
                    });
                }
                if self.socket_errno != 0 {
                    let _ = causes.push(GatewayError::Socket {
                        errno: self.socket_errno,
                    });
                }
                if causes.is_empty() {
                    let _ = causes.push(GatewayError::Transport { code: 0 });
                }
            }
        }
        causes
    }
}
