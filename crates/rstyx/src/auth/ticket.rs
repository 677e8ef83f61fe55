//! p9sk1 and p9sk2 ticket authentication.
//!
//! The server sends a ticket request carrying its challenge. The client
//! answers with a ticket sealed under the server's key and an authenticator
//! sealed under the ticket key; the server answers with its own
//! authenticator. p9sk1 first has the client send a challenge of its own,
//! p9sk2 reuses the server's.
//!
//! Without a separate authentication server the client mints the ticket
//! itself from the password both ends share. When a channel algorithm is
//! configured the ticket key is then combined with a Diffie-Hellman value to
//! key the secure layer.

use log::debug;

use super::{
    Credential, Handler, Role, Status,
    des::{self, ANAMELEN, DESKEYLEN, Key},
    dh::{self, DhParams, Exchange},
};
use crate::{
    buffer::{Buffer, Endian},
    channel::secure::Algorithm,
    config::AuthConfig,
    error::{AuthFailure, Error},
    utils::Result,
};

/// Width of the authentication domain
pub const DOMLEN: usize = 48;
/// Length of a challenge
pub const CHALLEN: usize = 8;
pub const TICKREQLEN: usize = 1 + ANAMELEN + DOMLEN + CHALLEN + 2 * ANAMELEN;
pub const TICKETLEN: usize = 1 + CHALLEN + 2 * ANAMELEN + DESKEYLEN;
pub const AUTHENTLEN: usize = 1 + CHALLEN + 4;

/// Record type codes
pub const AUTH_TREQ: u8 = 1;
pub const AUTH_TS: u8 = 64;
pub const AUTH_TC: u8 = 65;
pub const AUTH_AS: u8 = 66;
pub const AUTH_AC: u8 = 67;

pub type Challenge = [u8; CHALLEN];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Variant {
    P9sk1,
    P9sk2,
}

impl Variant {
    pub fn name(self) -> &'static str {
        match self {
            Variant::P9sk1 => "p9sk1",
            Variant::P9sk2 => "p9sk2",
        }
    }
}

fn malformed() -> Error {
    AuthFailure::Negotiation("malformed message".into()).into()
}

fn challenge(b: &[u8]) -> Challenge {
    let mut c = [0u8; CHALLEN];
    c.copy_from_slice(&b[..CHALLEN]);
    c
}

/// Ticket request
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TicketReq {
    pub typ: u8,
    pub authid: String,
    pub authdom: String,
    pub chal: Challenge,
    pub hostid: String,
    pub uid: String,
}

impl TicketReq {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Buffer::fixed(TICKREQLEN);
        buf.put_u8(self.typ);
        buf.put_fixed_str(&self.authid, ANAMELEN);
        buf.put_fixed_str(&self.authdom, DOMLEN);
        buf.put_bytes(&self.chal);
        buf.put_fixed_str(&self.hostid, ANAMELEN);
        buf.put_fixed_str(&self.uid, ANAMELEN);
        buf.into_inner()
    }

    pub fn decode(b: &[u8]) -> Result<TicketReq> {
        if b.len() != TICKREQLEN {
            return Err(malformed());
        }
        let mut buf = Buffer::wrap(b.to_vec());
        let decoded = (|| {
            Some(TicketReq {
                typ: buf.get_u8()?,
                authid: buf.get_fixed_str(ANAMELEN)?,
                authdom: buf.get_fixed_str(DOMLEN)?,
                chal: challenge(&buf.get_bytes(CHALLEN)?),
                hostid: buf.get_fixed_str(ANAMELEN)?,
                uid: buf.get_fixed_str(ANAMELEN)?,
            })
        })();
        decoded.ok_or_else(malformed)
    }
}

/// Ticket, sealed under the server's key
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ticket {
    pub num: u8,
    pub chal: Challenge,
    pub cuid: String,
    pub suid: String,
    pub key: Key,
}

impl Ticket {
    pub fn seal(&self, key: &Key) -> Result<Vec<u8>> {
        let mut buf = Buffer::fixed(TICKETLEN);
        buf.put_u8(self.num);
        buf.put_bytes(&self.chal);
        buf.put_fixed_str(&self.cuid, ANAMELEN);
        buf.put_fixed_str(&self.suid, ANAMELEN);
        buf.put_bytes(&self.key);
        let mut out = buf.into_inner();
        des::encrypt(key, &mut out)?;
        Ok(out)
    }

    pub fn open(key: &Key, b: &[u8]) -> Result<Ticket> {
        if b.len() != TICKETLEN {
            return Err(malformed());
        }
        let mut plain = b.to_vec();
        des::decrypt(key, &mut plain)?;
        let mut buf = Buffer::wrap(plain);
        let opened = (|| {
            let num = buf.get_u8()?;
            let chal = challenge(&buf.get_bytes(CHALLEN)?);
            let cuid = buf.get_fixed_str(ANAMELEN)?;
            let suid = buf.get_fixed_str(ANAMELEN)?;
            let mut key = [0u8; DESKEYLEN];
            key.copy_from_slice(&buf.get_bytes(DESKEYLEN)?);
            Some(Ticket {
                num,
                chal,
                cuid,
                suid,
                key,
            })
        })();
        opened.ok_or_else(malformed)
    }
}

/// Authenticator, sealed under the ticket key
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Authenticator {
    pub num: u8,
    pub chal: Challenge,
    pub id: u32,
}

impl Authenticator {
    pub fn seal(&self, key: &Key) -> Result<Vec<u8>> {
        let mut buf = Buffer::fixed(AUTHENTLEN);
        buf.put_u8(self.num);
        buf.put_bytes(&self.chal);
        buf.put_u32(self.id, Endian::Little);
        let mut out = buf.into_inner();
        des::encrypt(key, &mut out)?;
        Ok(out)
    }

    pub fn open(key: &Key, b: &[u8]) -> Result<Authenticator> {
        if b.len() != AUTHENTLEN {
            return Err(malformed());
        }
        let mut plain = b.to_vec();
        des::decrypt(key, &mut plain)?;
        let mut buf = Buffer::wrap(plain);
        let opened = (|| {
            Some(Authenticator {
                num: buf.get_u8()?,
                chal: challenge(&buf.get_bytes(CHALLEN)?),
                id: buf.get_u32(Endian::Little)?,
            })
        })();
        opened.ok_or_else(malformed)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Step {
    /// p9sk1 client challenge
    Chal,
    TicketReq,
    Ticket,
    Authenticator,
    Algorithm,
    ServerPublic,
    ClientPublic,
    Done,
    Failed,
}

/// One end of a p9sk1/p9sk2 exchange.
#[derive(Debug)]
pub struct TicketAuth {
    variant: Variant,
    role: Role,
    id: String,
    domain: String,
    key: Key,
    security: String,
    dh: DhParams,
    step: Step,
    chal_c: Challenge,
    chal_s: Challenge,
    ticket: Option<Ticket>,
    exchange: Option<Exchange>,
    peer_public: Option<Vec<u8>>,
    credential: Option<Credential>,
    diagnostic: Option<String>,
}

impl TicketAuth {
    pub fn new(variant: Variant, role: Role, config: &AuthConfig) -> Result<TicketAuth> {
        let key = config
            .key
            .ok_or_else(|| AuthFailure::Negotiation("no key configured".into()))?;
        let security = match role {
            Role::Server => config.security.clone().unwrap_or_else(|| "none".to_owned()),
            Role::Client => String::new(),
        };
        let step = match variant {
            Variant::P9sk1 => Step::Chal,
            Variant::P9sk2 => Step::TicketReq,
        };
        Ok(TicketAuth {
            variant,
            role,
            id: config.id.clone(),
            domain: config.domain.clone(),
            key,
            security,
            dh: config.dh.clone(),
            step,
            chal_c: [0; CHALLEN],
            chal_s: [0; CHALLEN],
            ticket: None,
            exchange: None,
            peer_public: None,
            credential: None,
            diagnostic: None,
        })
    }

    /// Whether it is our turn to speak.
    fn writes(&self) -> bool {
        use self::Step::*;
        match self.role {
            Role::Server => matches!(self.step, TicketReq | Authenticator | Algorithm | ServerPublic),
            Role::Client => matches!(self.step, Chal | Ticket | ClientPublic),
        }
    }

    fn ticket_key(&self) -> Result<Key> {
        self.ticket
            .as_ref()
            .map(|t| t.key)
            .ok_or_else(|| AuthFailure::Negotiation("no ticket".into()).into())
    }

    fn finish(&mut self, secret: Vec<u8>, security: Option<String>) -> Result<()> {
        let ticket = self
            .ticket
            .as_ref()
            .ok_or_else(|| AuthFailure::Negotiation("no ticket".into()))?;
        let user = match self.role {
            Role::Server => ticket.suid.clone(),
            Role::Client => self.id.clone(),
        };
        let mut cred = Credential::new(&user);
        cred.authenticate(&user, secret, security)?;
        debug!("{}: authenticated {}", self.variant.name(), user);
        self.credential = Some(cred);
        self.step = Step::Done;
        Ok(())
    }

    fn server_write(&mut self) -> Result<Option<Vec<u8>>> {
        match self.step {
            Step::TicketReq => {
                self.chal_s = rand::random();
                if self.variant == Variant::P9sk2 {
                    self.chal_c = self.chal_s;
                }
                let req = TicketReq {
                    typ: AUTH_TREQ,
                    authid: self.id.clone(),
                    authdom: self.domain.clone(),
                    chal: self.chal_s,
                    hostid: self.id.clone(),
                    uid: String::new(),
                };
                self.step = Step::Ticket;
                Ok(Some(req.encode()))
            }
            Step::Authenticator => {
                let auth = Authenticator {
                    num: AUTH_AS,
                    chal: self.chal_c,
                    id: 0,
                };
                let out = auth.seal(&self.ticket_key()?)?;
                self.step = Step::Algorithm;
                Ok(Some(out))
            }
            Step::Algorithm => {
                let alg = Algorithm::parse(&self.security)?;
                let out = self.security.clone().into_bytes();
                if alg.is_none() {
                    let secret = self.ticket_key()?.to_vec();
                    self.finish(secret, None)?;
                } else {
                    self.step = Step::ServerPublic;
                }
                Ok(Some(out))
            }
            Step::ServerPublic => {
                let exchange = self.dh.exchange();
                let out = exchange.public();
                self.exchange = Some(exchange);
                self.step = Step::ClientPublic;
                Ok(Some(out))
            }
            _ => Ok(None),
        }
    }

    fn server_read(&mut self, msg: &[u8]) -> Result<()> {
        match self.step {
            Step::Chal => {
                if msg.len() != CHALLEN {
                    return Err(malformed());
                }
                self.chal_c = challenge(msg);
                self.step = Step::TicketReq;
                Ok(())
            }
            Step::Ticket => {
                if msg.len() != TICKETLEN + AUTHENTLEN {
                    return Err(malformed());
                }
                let ticket = Ticket::open(&self.key, &msg[..TICKETLEN])?;
                if ticket.num != AUTH_TS {
                    return Err(AuthFailure::Decrypt.into());
                }
                if ticket.chal != self.chal_s {
                    return Err(AuthFailure::ChallengeMismatch.into());
                }
                let auth = Authenticator::open(&ticket.key, &msg[TICKETLEN..])?;
                if auth.num != AUTH_AC || auth.chal != self.chal_s || auth.id != 0 {
                    return Err(AuthFailure::Replay.into());
                }
                self.ticket = Some(ticket);
                self.step = Step::Authenticator;
                Ok(())
            }
            Step::ClientPublic => {
                let shared = self
                    .exchange
                    .as_mut()
                    .ok_or_else(|| AuthFailure::Negotiation("no key agreement".into()))?
                    .agree(msg)?;
                let secret = dh::derive_secret(&self.ticket_key()?, &shared);
                let security = Some(self.security.clone());
                self.finish(secret, security)
            }
            _ => Err(AuthFailure::Negotiation("unexpected message".into()).into()),
        }
    }

    fn client_write(&mut self) -> Result<Option<Vec<u8>>> {
        match self.step {
            Step::Chal => {
                self.chal_c = rand::random();
                self.step = Step::TicketReq;
                Ok(Some(self.chal_c.to_vec()))
            }
            Step::Ticket => {
                let ticket = Ticket {
                    num: AUTH_TS,
                    chal: self.chal_s,
                    cuid: self.id.clone(),
                    suid: self.id.clone(),
                    key: rand::random(),
                };
                let auth = Authenticator {
                    num: AUTH_AC,
                    chal: self.chal_s,
                    id: 0,
                };
                let mut out = ticket.seal(&self.key)?;
                out.extend(auth.seal(&ticket.key)?);
                self.ticket = Some(ticket);
                self.step = Step::Authenticator;
                Ok(Some(out))
            }
            Step::ClientPublic => {
                let peer = self
                    .peer_public
                    .take()
                    .ok_or_else(|| AuthFailure::Negotiation("no key agreement".into()))?;
                let mut exchange = self.dh.exchange();
                let out = exchange.public();
                let shared = exchange.agree(&peer)?;
                let secret = dh::derive_secret(&self.ticket_key()?, &shared);
                let security = Some(self.security.clone());
                self.finish(secret, security)?;
                Ok(Some(out))
            }
            _ => Ok(None),
        }
    }

    fn client_read(&mut self, msg: &[u8]) -> Result<()> {
        match self.step {
            Step::TicketReq => {
                let req = TicketReq::decode(msg)?;
                if req.typ != AUTH_TREQ {
                    return Err(malformed());
                }
                if !self.domain.is_empty() && req.authdom != self.domain {
                    return Err(AuthFailure::Negotiation(format!("unknown domain {}", req.authdom)).into());
                }
                self.chal_s = req.chal;
                if self.variant == Variant::P9sk2 {
                    self.chal_c = req.chal;
                }
                self.step = Step::Ticket;
                Ok(())
            }
            Step::Authenticator => {
                let auth = Authenticator::open(&self.ticket_key()?, msg)?;
                if auth.num != AUTH_AS || auth.id != 0 {
                    return Err(AuthFailure::Replay.into());
                }
                if auth.chal != self.chal_c {
                    return Err(AuthFailure::ChallengeMismatch.into());
                }
                self.step = Step::Algorithm;
                Ok(())
            }
            Step::Algorithm => {
                let alg_name = String::from_utf8_lossy(msg).into_owned();
                let alg = Algorithm::parse(&alg_name)
                    .map_err(|_| AuthFailure::Unsupported(alg_name.clone()))?;
                self.security = alg_name;
                if alg.is_none() {
                    let secret = self.ticket_key()?.to_vec();
                    self.finish(secret, None)
                } else {
                    self.step = Step::ServerPublic;
                    Ok(())
                }
            }
            Step::ServerPublic => {
                self.peer_public = Some(msg.to_vec());
                self.step = Step::ClientPublic;
                Ok(())
            }
            _ => Err(AuthFailure::Negotiation("unexpected message".into()).into()),
        }
    }

    fn fail(&mut self, e: Error) -> Error {
        debug!("{}: {}", self.variant.name(), e);
        self.diagnostic = Some(e.to_string());
        self.step = Step::Failed;
        e
    }
}

impl Handler for TicketAuth {
    fn write(&mut self) -> Result<Option<Vec<u8>>> {
        if !self.writes() {
            return Ok(None);
        }
        let res = match self.role {
            Role::Server => self.server_write(),
            Role::Client => self.client_write(),
        };
        res.map_err(|e| self.fail(e))
    }

    fn read(&mut self, msg: &[u8]) -> Result<()> {
        if self.step == Step::Failed || self.step == Step::Done || self.writes() {
            return Err(self.fail(AuthFailure::Negotiation("unexpected message".into()).into()));
        }
        let res = match self.role {
            Role::Server => self.server_read(msg),
            Role::Client => self.client_read(msg),
        };
        res.map_err(|e| self.fail(e))
    }

    fn status(&self) -> Status {
        match &self.credential {
            Some(cred) => Status::Done(cred.clone()),
            None => Status::Continue,
        }
    }

    fn diagnostic(&self) -> Option<&str> {
        self.diagnostic.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(id: &str, password: &str, security: Option<&str>) -> AuthConfig {
        AuthConfig::default()
            .with_id(id)
            .with_domain("plan9")
            .with_password(password)
            .with_security(security)
    }

    fn credential(h: &TicketAuth) -> Option<Credential> {
        match h.status() {
            Status::Done(cred) => Some(cred),
            _ => None,
        }
    }

    /// Shuttle messages until both ends hold a credential.
    fn exchange(srv: &mut TicketAuth, cli: &mut TicketAuth) -> Result<(Credential, Credential)> {
        for _ in 0..16 {
            if let (Some(s), Some(c)) = (credential(srv), credential(cli)) {
                return Ok((s, c));
            }
            if let Some(msg) = srv.write()? {
                cli.read(&msg)?;
            }
            if let Some(msg) = cli.write()? {
                srv.read(&msg)?;
            }
        }
        Err(Error::Msg("exchange did not finish".into()))
    }

    fn ticket_req(chal: Challenge) -> TicketReq {
        TicketReq {
            typ: AUTH_TREQ,
            authid: "fs".into(),
            authdom: "plan9".into(),
            chal,
            hostid: "fs".into(),
            uid: String::new(),
        }
    }

    /// p9sk2 client that has sent its ticket and waits for `AuthAs`.
    fn awaiting_authenticator(chal: Challenge) -> (TicketAuth, Key) {
        let cfg = config("glenda", "sesame", None);
        let mut cli = TicketAuth::new(Variant::P9sk2, Role::Client, &cfg).unwrap();
        cli.read(&ticket_req(chal).encode()).unwrap();
        let out = cli.write().unwrap().unwrap();
        assert_eq!(out.len(), TICKETLEN + AUTHENTLEN);
        let key = cli.ticket.as_ref().unwrap().key;
        (cli, key)
    }

    #[test]
    fn record_lengths() {
        assert_eq!(TICKREQLEN, 141);
        assert_eq!(TICKETLEN, 72);
        assert_eq!(AUTHENTLEN, 13);
    }

    #[test]
    fn records_survive_sealing() {
        let req = ticket_req([1, 2, 3, 4, 5, 6, 7, 8]);
        let b = req.encode();
        assert_eq!(b.len(), TICKREQLEN);
        assert_eq!(TicketReq::decode(&b).unwrap(), req);
        assert!(TicketReq::decode(&b[1..]).is_err());

        let key = des::passtokey("sesame");
        let ticket = Ticket {
            num: AUTH_TS,
            chal: [9; CHALLEN],
            cuid: "glenda".into(),
            suid: "glenda".into(),
            key: [1, 2, 3, 4, 5, 6, 7],
        };
        let sealed = ticket.seal(&key).unwrap();
        assert_eq!(sealed.len(), TICKETLEN);
        assert_eq!(Ticket::open(&key, &sealed).unwrap(), ticket);

        let auth = Authenticator {
            num: AUTH_AC,
            chal: [3; CHALLEN],
            id: 0,
        };
        let sealed = auth.seal(&ticket.key).unwrap();
        assert_eq!(sealed.len(), AUTHENTLEN);
        assert_eq!(Authenticator::open(&ticket.key, &sealed).unwrap(), auth);
    }

    #[test]
    fn both_variants_agree() {
        for variant in [Variant::P9sk1, Variant::P9sk2] {
            for security in [None, Some("sha1/des_cbc")] {
                let scfg = config("fs", "sesame", security);
                let ccfg = config("glenda", "sesame", None);
                let mut srv = TicketAuth::new(variant, Role::Server, &scfg).unwrap();
                let mut cli = TicketAuth::new(variant, Role::Client, &ccfg).unwrap();

                let (s, c) = exchange(&mut srv, &mut cli).unwrap();
                assert_eq!(s.user(), "glenda");
                assert_eq!(c.user(), "glenda");
                assert!(s.is_authenticated() && c.is_authenticated());
                assert_eq!(s.secret(), c.secret());
                assert_eq!(s.security(), c.security());
            }
        }
    }

    #[test]
    fn p9sk2_skips_the_client_challenge() {
        let scfg = config("fs", "sesame", None);
        let ccfg = config("glenda", "sesame", None);
        let mut srv = TicketAuth::new(Variant::P9sk2, Role::Server, &scfg).unwrap();
        let mut cli = TicketAuth::new(Variant::P9sk2, Role::Client, &ccfg).unwrap();

        assert!(cli.write().unwrap().is_none());
        let req = TicketReq::decode(&srv.write().unwrap().unwrap()).unwrap();
        cli.read(&req.encode()).unwrap();
        assert_eq!(cli.chal_c, req.chal);
    }

    #[test]
    fn wrong_password_is_refused() {
        let scfg = config("fs", "sesame", None);
        let ccfg = config("glenda", "open sesame", None);
        let mut srv = TicketAuth::new(Variant::P9sk1, Role::Server, &scfg).unwrap();
        let mut cli = TicketAuth::new(Variant::P9sk1, Role::Client, &ccfg).unwrap();

        assert!(exchange(&mut srv, &mut cli).is_err());
        assert!(srv.diagnostic().is_some());
        assert!(credential(&srv).is_none());
    }

    #[test]
    fn server_authenticator_is_accepted() {
        let chal = [5; CHALLEN];
        let (mut cli, key) = awaiting_authenticator(chal);
        let auth = Authenticator {
            num: AUTH_AS,
            chal,
            id: 0,
        };
        cli.read(&auth.seal(&key).unwrap()).unwrap();
        assert!(cli.diagnostic().is_none());
    }

    #[test]
    fn flipped_challenge_byte_is_a_mismatch() {
        let chal = [5; CHALLEN];
        for i in 0..CHALLEN {
            let (mut cli, key) = awaiting_authenticator(chal);
            let mut bad = chal;
            bad[i] ^= 1;
            let auth = Authenticator {
                num: AUTH_AS,
                chal: bad,
                id: 0,
            };
            let err = cli.read(&auth.seal(&key).unwrap()).unwrap_err();
            assert!(matches!(err, Error::Auth(AuthFailure::ChallengeMismatch)));
            assert_eq!(cli.diagnostic(), Some("challenge mismatch"));
            assert!(credential(&cli).is_none());
        }
    }

    #[test]
    fn nonzero_counter_is_a_replay() {
        let chal = [5; CHALLEN];
        let (mut cli, key) = awaiting_authenticator(chal);
        let auth = Authenticator {
            num: AUTH_AS,
            chal,
            id: 1,
        };
        let err = cli.read(&auth.seal(&key).unwrap()).unwrap_err();
        assert!(matches!(err, Error::Auth(AuthFailure::Replay)));
        assert_eq!(cli.diagnostic(), Some("possible replay attack"));
    }

    #[test]
    fn server_checks_ticket_and_authenticator() {
        let cfg = config("fs", "sesame", None);
        let key = des::passtokey("sesame");

        for (ticket_chal_flip, id, want) in [
            (true, 0, AuthFailure::ChallengeMismatch),
            (false, 7, AuthFailure::Replay),
        ] {
            let mut srv = TicketAuth::new(Variant::P9sk2, Role::Server, &cfg).unwrap();
            let req = TicketReq::decode(&srv.write().unwrap().unwrap()).unwrap();

            let mut chal = req.chal;
            if ticket_chal_flip {
                chal[0] ^= 0x80;
            }
            let ticket = Ticket {
                num: AUTH_TS,
                chal,
                cuid: "glenda".into(),
                suid: "glenda".into(),
                key: [7; DESKEYLEN],
            };
            let auth = Authenticator {
                num: AUTH_AC,
                chal: req.chal,
                id,
            };
            let mut msg = ticket.seal(&key).unwrap();
            msg.extend(auth.seal(&ticket.key).unwrap());

            let err = srv.read(&msg).unwrap_err();
            assert!(matches!(err, Error::Auth(ref f) if *f == want), "{:?}", err);
            assert_eq!(srv.diagnostic(), Some(want.to_string().as_str()));
        }
    }
}
