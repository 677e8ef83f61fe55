//! Authentication: negotiation, ticket protocols and channel keying.
//!
//! Handlers are sans-IO state machines: [`Handler::write`] yields the next
//! message to send (or `None` when waiting for the peer) and
//! [`Handler::read`] consumes one received message. A [`Conversation`] runs a
//! chain of handlers, following the delegation p9any ends with, and frames
//! every message with [`keyring`]. The same conversation backs both
//! authentication at connection start ([`authenticate`]) and authentication
//! through an auth fid.

pub mod des;
pub mod dh;
pub mod keyring;
pub mod p9any;
pub mod ticket;

use std::sync::Arc;

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    channel::{Channel, Framing, secure::SecureLayer},
    config::AuthConfig,
    error::{AuthFailure, Error},
    registry::Registry,
    utils::Result,
};

pub use self::p9any::P9any;
pub use self::ticket::TicketAuth;

/// Which end of the exchange a handler plays.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Protocol and domain agreed by negotiation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selection {
    pub proto: String,
    pub dom: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Status {
    Continue,
    Done(Credential),
    /// Negotiation finished; continue with the selected protocol.
    Delegated(Selection),
}

/// Identity a session acts as.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Credential {
    user: String,
    groups: Vec<String>,
    authenticated: bool,
    secret: Vec<u8>,
    security: Option<String>,
    delegated: bool,
}

impl Credential {
    /// Unauthenticated credential for `user`.
    pub fn new(user: &str) -> Credential {
        Credential {
            user: user.to_owned(),
            ..Default::default()
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn set_groups(&mut self, groups: Vec<String>) {
        self.groups = groups;
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Shared secret established by authentication.
    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    /// Channel algorithm agreed during authentication.
    pub fn security(&self) -> Option<&str> {
        self.security.as_deref()
    }

    /// Whether `user` is this credential's user or one of its groups.
    pub fn is_member(&self, name: &str) -> bool {
        self.user == name || self.groups.iter().any(|g| g == name)
    }

    /// Mark the credential authenticated. Allowed once.
    pub fn authenticate(
        &mut self,
        user: &str,
        secret: Vec<u8>,
        security: Option<String>,
    ) -> Result<()> {
        if self.authenticated {
            return Err(AuthFailure::Negotiation("already authenticated".into()).into());
        }
        self.user = user.to_owned();
        self.secret = secret;
        self.security = security;
        self.authenticated = true;
        Ok(())
    }

    /// Take over the identity proven on an auth fid. Allowed once.
    pub fn delegate(&mut self, from: &Credential) -> Result<()> {
        if self.delegated {
            return Err(AuthFailure::Negotiation("already delegated".into()).into());
        }
        if !from.authenticated {
            return Err(AuthFailure::Negotiation("delegating an unauthenticated credential".into()).into());
        }
        self.user = from.user.clone();
        self.groups = from.groups.clone();
        self.secret = from.secret.clone();
        self.security = from.security.clone();
        self.authenticated = true;
        self.delegated = true;
        Ok(())
    }
}

/// One authentication protocol, one end.
pub trait Handler {
    /// Next message to send, `None` while waiting for the peer.
    fn write(&mut self) -> Result<Option<Vec<u8>>>;

    /// Consume one message from the peer.
    fn read(&mut self, msg: &[u8]) -> Result<()>;

    fn status(&self) -> Status;

    /// Why the exchange failed, once it has.
    fn diagnostic(&self) -> Option<&str>;
}

/// The handlers this crate provides.
#[derive(Debug)]
pub enum AuthHandler {
    P9any(P9any),
    Ticket(TicketAuth),
}

impl Handler for AuthHandler {
    fn write(&mut self) -> Result<Option<Vec<u8>>> {
        match self {
            AuthHandler::P9any(h) => h.write(),
            AuthHandler::Ticket(h) => h.write(),
        }
    }

    fn read(&mut self, msg: &[u8]) -> Result<()> {
        match self {
            AuthHandler::P9any(h) => h.read(msg),
            AuthHandler::Ticket(h) => h.read(msg),
        }
    }

    fn status(&self) -> Status {
        match self {
            AuthHandler::P9any(h) => h.status(),
            AuthHandler::Ticket(h) => h.status(),
        }
    }

    fn diagnostic(&self) -> Option<&str> {
        match self {
            AuthHandler::P9any(h) => h.diagnostic(),
            AuthHandler::Ticket(h) => h.diagnostic(),
        }
    }
}

pub type HandlerFactory = fn(Role, &AuthConfig) -> Result<AuthHandler>;

/// Handlers known to the server, keyed by protocol name.
pub fn registry() -> Registry<HandlerFactory> {
    let mut reg: Registry<HandlerFactory> = Registry::new("authentication protocol");
    reg.register(p9any::NAME, |role, cfg| {
        P9any::new(role, cfg).map(AuthHandler::P9any)
    })
    .register(ticket::Variant::P9sk1.name(), |role, cfg| {
        TicketAuth::new(ticket::Variant::P9sk1, role, cfg).map(AuthHandler::Ticket)
    })
    .register(ticket::Variant::P9sk2.name(), |role, cfg| {
        TicketAuth::new(ticket::Variant::P9sk2, role, cfg).map(AuthHandler::Ticket)
    });
    reg
}

/// A chain of handlers starting at p9any, speaking keyring-framed messages.
#[derive(Debug)]
pub struct Conversation {
    role: Role,
    config: Arc<AuthConfig>,
    registry: Arc<Registry<HandlerFactory>>,
    handler: AuthHandler,
    delegated: bool,
    credential: Option<Credential>,
    failure: Option<String>,
}

impl Conversation {
    pub fn start(
        role: Role,
        config: Arc<AuthConfig>,
        registry: Arc<Registry<HandlerFactory>>,
    ) -> Result<Conversation> {
        let handler = (registry.get(p9any::NAME)?)(role, &config)?;
        Ok(Conversation {
            role,
            config,
            registry,
            handler,
            delegated: false,
            credential: None,
            failure: None,
        })
    }

    fn fail(&mut self, e: Error) -> Error {
        let diag = self
            .handler
            .diagnostic()
            .map(str::to_owned)
            .unwrap_or_else(|| e.to_string());
        warn!("auth failed: {}", diag);
        self.failure = Some(diag);
        e
    }

    fn check(&self) -> Result<()> {
        match &self.failure {
            Some(f) => Err(AuthFailure::Negotiation(f.clone()).into()),
            None => Ok(()),
        }
    }

    /// Follow a delegation or pick up the finished credential.
    fn advance(&mut self) -> Result<()> {
        match self.handler.status() {
            Status::Continue => Ok(()),
            Status::Done(mut cred) => {
                if self.role == Role::Server {
                    cred.set_groups(self.config.groups_of(cred.user()));
                }
                self.credential = Some(cred);
                Ok(())
            }
            Status::Delegated(_) if self.delegated => {
                Err(AuthFailure::Negotiation("nested negotiation".into()).into())
            }
            Status::Delegated(sel) => {
                debug!("auth: delegating to {}", sel.proto);
                let factory = self
                    .registry
                    .get(&sel.proto)
                    .map_err(|_| AuthFailure::Unsupported(sel.proto.clone()))?;
                self.handler = factory(self.role, &self.config)?;
                self.delegated = true;
                Ok(())
            }
        }
    }

    /// Next framed message to send, if it is our turn.
    pub fn outgoing(&mut self) -> Result<Option<Vec<u8>>> {
        self.check()?;
        if self.credential.is_some() {
            return Ok(None);
        }
        let res = self.handler.write().and_then(|out| {
            self.advance()?;
            out.map(|m| keyring::encode_data(&m)).transpose()
        });
        res.map_err(|e| self.fail(e))
    }

    /// Consume one framed message.
    pub fn incoming(&mut self, frame: &[u8]) -> Result<()> {
        self.check()?;
        let res = keyring::parse(frame).and_then(|msg| {
            self.handler.read(&msg)?;
            self.advance()
        });
        res.map_err(|e| self.fail(e))
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    pub fn is_done(&self) -> bool {
        self.credential.is_some()
    }

    pub fn diagnostic(&self) -> Option<&str> {
        self.failure.as_deref()
    }
}

/// Run a conversation over `channel`, before any layer is pushed.
///
/// The client speaks first with a frame naming `p9any`; from then on the
/// negotiation has the server offer.
///
/// On success the agreed channel algorithm, if any, is pushed onto the
/// channel as a [`SecureLayer`]. On failure the peer is sent the diagnostic.
pub async fn authenticate<R, W>(
    channel: &mut Channel<R, W>,
    role: Role,
    config: Arc<AuthConfig>,
    registry: Arc<Registry<HandlerFactory>>,
) -> Result<Credential>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut conv = Conversation::start(role, config, registry)?;
    let framing = || Framing::Keyring(keyring::KeyringCodec);

    let res = async {
        // The client opens by naming the negotiation it wants to run.
        match role {
            Role::Client => {
                let hello = keyring::encode_data(p9any::NAME.as_bytes())?;
                channel.write_raw(&hello).await?;
            }
            Role::Server => {
                let frame = channel
                    .read_frame_raw(framing())
                    .await?
                    .ok_or_else(|| AuthFailure::Negotiation("connection closed".into()))?;
                let hello = keyring::parse(&frame)?;
                if hello != p9any::NAME.as_bytes() {
                    let name = String::from_utf8_lossy(&hello).into_owned();
                    return Err(AuthFailure::Unsupported(name).into());
                }
            }
        }

        while !conv.is_done() {
            match conv.outgoing()? {
                Some(frame) => channel.write_raw(&frame).await?,
                None => {
                    let frame = channel
                        .read_frame_raw(framing())
                        .await?
                        .ok_or_else(|| AuthFailure::Negotiation("connection closed".into()))?;
                    conv.incoming(&frame)?;
                }
            }
        }
        Ok::<_, Error>(())
    }
    .await;

    if let Err(e) = res {
        if !matches!(e, Error::Auth(AuthFailure::Remote(_)) | Error::Io(_)) {
            let diag = conv.diagnostic().map(str::to_owned).unwrap_or_else(|| e.to_string());
            let _ = channel.write_raw(&keyring::encode_error(&diag)).await;
        }
        return Err(e);
    }

    let cred = conv
        .credential()
        .cloned()
        .ok_or_else(|| AuthFailure::Negotiation("no credential".into()))?;
    if let Some(alg) = cred.security() {
        channel.push(Arc::new(SecureLayer::new(alg, cred.secret())?));
    }
    Ok(cred)
}
