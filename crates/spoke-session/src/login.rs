//! The login handshake.
//!
//! Every freshly accepted socket is "quarantined": before it may route a
//! single envelope, the peer has to log in. The conversation is short and
//! strictly alternating:
//!
//! ```text
//!   client                                server
//!     │ ── Hello { name, hardware_address } ► │
//!     │ ◄───────────────── Challenge(props) ─ │   LoginValidator::challenge
//!     │                                       │
//!     │   (challenge empty? skip the next step)
//!     │                                       │
//!     │ ── Response(props) ─────────────────► │   CredentialProvider::respond
//!     │ ◄──── Accepted { name } | Rejected ── │   LoginValidator::verify + admission
//! ```
//!
//! [`ClientLogin`] and [`ServerLogin`] are the two halves of that state
//! machine. Both talk through a [`FramedConnection`] that is later handed
//! to [`spoke_transport::Connection::establish`].

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use spoke_protocol::Codec;
use spoke_transport::FramedConnection;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::SessionError;

/// String key/value pairs exchanged during login.
pub type Properties = BTreeMap<String, String>;

/// Response key under which a client reports its hardware address.
pub const HARDWARE_ADDRESS_KEY: &str = "hardware_address";

/// One step of the login conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoginFrame {
    /// Client → server: the display name the client would like, and the
    /// machine's hardware address if it reports one.
    Hello {
        name: String,
        #[serde(default)]
        hardware_address: Option<String>,
    },
    /// Server → client: what the client must answer. Empty means no
    /// authentication is required.
    Challenge(Properties),
    /// Client → server: the answer to a non-empty challenge.
    Response(Properties),
    /// Server → client: welcome, under this (possibly adjusted) name.
    Accepted { name: String },
    /// Server → client: go away.
    Rejected { reason: String },
}

impl LoginFrame {
    fn kind(&self) -> &'static str {
        match self {
            LoginFrame::Hello { .. } => "Hello",
            LoginFrame::Challenge(_) => "Challenge",
            LoginFrame::Response(_) => "Response",
            LoginFrame::Accepted { .. } => "Accepted",
            LoginFrame::Rejected { .. } => "Rejected",
        }
    }
}

// ---------------------------------------------------------------------------
// Pluggable policies
// ---------------------------------------------------------------------------

/// Server-side authentication policy.
///
/// spoke doesn't decide who may join; an installed validator does. With
/// no validator the server issues an empty challenge and every name is
/// accepted (subject to moderation and name uniqueness).
///
/// # Example
///
/// ```rust
/// use std::net::SocketAddr;
/// use spoke_session::{LoginValidator, Properties};
///
/// /// Only lets in peers from the local machine.
/// struct LocalOnly;
///
/// impl LoginValidator for LocalOnly {
///     fn challenge(&self, _username: &str, _remote: SocketAddr) -> Properties {
///         Properties::new()
///     }
///
///     fn verify(
///         &self,
///         _challenge: &Properties,
///         _response: &Properties,
///         _username: &str,
///         _hardware_address: Option<&str>,
///         remote: SocketAddr,
///     ) -> Result<(), String> {
///         if remote.ip().is_loopback() {
///             Ok(())
///         } else {
///             Err("local players only".into())
///         }
///     }
/// }
/// ```
pub trait LoginValidator: Send + Sync + 'static {
    /// Builds the challenge for a login attempt.
    fn challenge(&self, username: &str, remote: SocketAddr) -> Properties;

    /// Checks a login attempt. `Err` carries the reason shown to the user.
    ///
    /// Called for every attempt, including ones whose challenge was empty
    /// (then `response` is empty too).
    fn verify(
        &self,
        challenge: &Properties,
        response: &Properties,
        username: &str,
        hardware_address: Option<&str>,
        remote: SocketAddr,
    ) -> Result<(), String>;
}

/// Client-side answer to a server challenge.
pub trait CredentialProvider: Send + Sync + 'static {
    /// Answers `challenge`. `None` cancels the login.
    fn respond(&self, challenge: &Properties) -> Option<Properties>;
}

// ---------------------------------------------------------------------------
// Frame helpers
// ---------------------------------------------------------------------------

async fn read_frame<IO, C>(
    framed: &mut FramedConnection<IO>,
    codec: &C,
    timeout: Duration,
) -> Result<LoginFrame, SessionError>
where
    IO: AsyncRead + AsyncWrite,
    C: Codec,
{
    tokio::time::timeout(timeout, framed.read_value::<C, LoginFrame>(codec))
        .await
        .map_err(|_| SessionError::Timeout)??
        .ok_or(SessionError::Disconnected)
}

fn unexpected(expected: &'static str, got: &LoginFrame) -> SessionError {
    SessionError::UnexpectedFrame {
        expected,
        got: got.kind(),
    }
}

// ---------------------------------------------------------------------------
// Client half
// ---------------------------------------------------------------------------

/// The client side of the login conversation.
pub struct ClientLogin<'a> {
    /// The display name to ask for.
    pub name: &'a str,
    /// Answers challenges. Without one, any non-empty challenge cancels
    /// the login.
    pub credentials: Option<&'a dyn CredentialProvider>,
    /// Reported to the server in `Hello`, and again in the challenge
    /// response where the validator can check it.
    pub hardware_address: Option<&'a str>,
    /// Bound on each wait for the server.
    pub timeout: Duration,
}

impl ClientLogin<'_> {
    /// Runs the conversation and returns the name the server assigned.
    ///
    /// # Errors
    /// [`SessionError::LoginRejected`] when the server refuses, or a
    /// handshake failure.
    pub async fn run<IO, C>(
        self,
        framed: &mut FramedConnection<IO>,
        codec: &C,
    ) -> Result<String, SessionError>
    where
        IO: AsyncRead + AsyncWrite,
        C: Codec,
    {
        framed
            .write_value(
                codec,
                &LoginFrame::Hello {
                    name: self.name.to_string(),
                    hardware_address: self.hardware_address.map(str::to_string),
                },
            )
            .await?;

        let challenge = match read_frame(framed, codec, self.timeout).await? {
            LoginFrame::Challenge(props) => props,
            LoginFrame::Rejected { reason } => return Err(SessionError::LoginRejected(reason)),
            other => return Err(unexpected("Challenge", &other)),
        };

        if !challenge.is_empty() {
            let Some(mut response) = self.credentials.and_then(|c| c.respond(&challenge)) else {
                let _ = framed.close().await;
                return Err(SessionError::LoginCancelled);
            };
            if let Some(hardware) = self.hardware_address {
                response.insert(HARDWARE_ADDRESS_KEY.to_string(), hardware.to_string());
            }
            framed
                .write_value(codec, &LoginFrame::Response(response))
                .await?;
        }

        match read_frame(framed, codec, self.timeout).await? {
            LoginFrame::Accepted { name } => {
                tracing::debug!(requested = self.name, assigned = %name, "login accepted");
                Ok(name)
            }
            LoginFrame::Rejected { reason } => Err(SessionError::LoginRejected(reason)),
            other => Err(unexpected("Accepted or Rejected", &other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Server half
// ---------------------------------------------------------------------------

/// What the server learned about a login attempt.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    /// The name the client asked for, before uniqueness adjustments.
    pub requested_name: String,
    /// Reported by the client in its challenge response, if any.
    pub hardware_address: Option<String>,
    /// The socket's remote address.
    pub remote: SocketAddr,
}

/// A login that made it through validation and admission.
#[derive(Debug)]
pub struct Admitted<T> {
    pub request: LoginRequest,
    /// The name sent back in `Accepted`.
    pub name: String,
    /// Whatever the admission step handed out (e.g. a name reservation).
    pub ticket: T,
}

/// The server side of the login conversation.
pub struct ServerLogin<'a> {
    /// Authentication policy; `None` means anonymous logins.
    pub validator: Option<&'a dyn LoginValidator>,
    /// The quarantined socket's remote address.
    pub remote: SocketAddr,
    /// Bound on each wait for the client.
    pub timeout: Duration,
}

impl ServerLogin<'_> {
    /// Runs the conversation.
    ///
    /// After the validator approves, `admit` gets the final say: it
    /// returns the name to accept the client under (plus a ticket kept
    /// alive by the caller), or a rejection reason. Rejections are sent to
    /// the client before this returns.
    pub async fn run<IO, C, T, F>(
        self,
        framed: &mut FramedConnection<IO>,
        codec: &C,
        admit: F,
    ) -> Result<Admitted<T>, SessionError>
    where
        IO: AsyncRead + AsyncWrite,
        C: Codec,
        F: FnOnce(&LoginRequest) -> Result<(String, T), String>,
    {
        let (requested_name, announced_hardware) = match read_frame(framed, codec, self.timeout).await? {
            LoginFrame::Hello {
                name,
                hardware_address,
            } => (name, hardware_address),
            other => return Err(unexpected("Hello", &other)),
        };

        let challenge = self
            .validator
            .map(|v| v.challenge(&requested_name, self.remote))
            .unwrap_or_default();
        framed
            .write_value(codec, &LoginFrame::Challenge(challenge.clone()))
            .await?;

        let response = if challenge.is_empty() {
            Properties::new()
        } else {
            match read_frame(framed, codec, self.timeout).await? {
                LoginFrame::Response(props) => props,
                other => return Err(unexpected("Response", &other)),
            }
        };
        // The response copy wins: it is the one the validator gets to check.
        let hardware_address = response
            .get(HARDWARE_ADDRESS_KEY)
            .cloned()
            .or(announced_hardware);

        if let Some(validator) = self.validator {
            if let Err(reason) = validator.verify(
                &challenge,
                &response,
                &requested_name,
                hardware_address.as_deref(),
                self.remote,
            ) {
                return Err(reject(framed, codec, reason).await);
            }
        }

        let request = LoginRequest {
            requested_name,
            hardware_address,
            remote: self.remote,
        };
        let (name, ticket) = match admit(&request) {
            Ok(admitted) => admitted,
            Err(reason) => return Err(reject(framed, codec, reason).await),
        };

        framed
            .write_value(codec, &LoginFrame::Accepted { name: name.clone() })
            .await?;

        Ok(Admitted {
            request,
            name,
            ticket,
        })
    }
}

async fn reject<IO, C>(framed: &mut FramedConnection<IO>, codec: &C, reason: String) -> SessionError
where
    IO: AsyncRead + AsyncWrite,
    C: Codec,
{
    let frame = LoginFrame::Rejected {
        reason: reason.clone(),
    };
    if let Err(e) = framed.write_value(codec, &frame).await {
        tracing::debug!(error = %e, "could not deliver login rejection");
    }
    let _ = framed.close().await;
    SessionError::LoginRejected(reason)
}
