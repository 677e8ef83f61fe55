//! p9any: agree on a concrete protocol and domain, then hand over.
//!
//! The server offers `v.2 proto@dom ...`, the client picks one and answers
//! `proto dom`, the server confirms with `OK`. Both ends then report
//! [`Status::Delegated`] and the driver continues with the chosen handler.

use log::debug;

use super::{Handler, Role, Selection, Status};
use crate::{
    config::AuthConfig,
    error::{AuthFailure, Error},
    utils::Result,
};

/// Registry key
pub const NAME: &str = "p9any";

/// State of one direction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Initial,
    Select,
    Ack,
    Done,
}

#[derive(Debug)]
pub struct P9any {
    role: Role,
    domain: String,
    protocols: Vec<String>,
    reading: Phase,
    writing: Phase,
    selection: Option<Selection>,
    diagnostic: Option<String>,
}

impl P9any {
    pub fn new(role: Role, config: &AuthConfig) -> Result<P9any> {
        let protocols: Vec<String> = config
            .protocols
            .iter()
            .filter(|p| p.as_str() != NAME)
            .cloned()
            .collect();
        if protocols.is_empty() {
            return Err(AuthFailure::Negotiation("no protocols configured".into()).into());
        }
        let (reading, writing) = match role {
            Role::Server => (Phase::Select, Phase::Initial),
            Role::Client => (Phase::Initial, Phase::Select),
        };
        Ok(P9any {
            role,
            domain: config.domain.clone(),
            protocols,
            reading,
            writing,
            selection: None,
            diagnostic: None,
        })
    }

    fn offer(&self) -> String {
        let mut s = String::from("v.2");
        for p in &self.protocols {
            s.push(' ');
            s.push_str(p);
            s.push('@');
            s.push_str(&self.domain);
        }
        s
    }

    /// Server: the client's `proto dom` answer.
    fn accept(&self, msg: &str) -> Result<Selection> {
        let mut words = msg.split_whitespace();
        let (Some(proto), Some(dom), None) = (words.next(), words.next(), words.next()) else {
            return Err(AuthFailure::Negotiation(format!("bad selection: {}", msg)).into());
        };
        if !self.protocols.iter().any(|p| p == proto) {
            return Err(AuthFailure::Unsupported(proto.to_owned()).into());
        }
        if dom != self.domain {
            return Err(AuthFailure::Negotiation(format!("unknown domain {}", dom)).into());
        }
        Ok(Selection {
            proto: proto.to_owned(),
            dom: dom.to_owned(),
        })
    }

    /// Client: first offered protocol we also speak, in our preference order.
    fn choose(&self, msg: &str) -> Result<Selection> {
        let offered: Vec<(&str, &str)> = msg
            .split_whitespace()
            .filter(|w| !w.starts_with("v."))
            .filter_map(|w| w.split_once('@'))
            .collect();
        for want in &self.protocols {
            for &(proto, dom) in &offered {
                if proto == want && (self.domain.is_empty() || dom == self.domain) {
                    return Ok(Selection {
                        proto: proto.to_owned(),
                        dom: dom.to_owned(),
                    });
                }
            }
        }
        Err(AuthFailure::Negotiation(format!("no common protocol in: {}", msg)).into())
    }

    fn fail(&mut self, e: Error) -> Error {
        debug!("p9any: {}", e);
        self.diagnostic = Some(e.to_string());
        self.reading = Phase::Done;
        self.writing = Phase::Done;
        e
    }
}

impl Handler for P9any {
    fn write(&mut self) -> Result<Option<Vec<u8>>> {
        let out = match (self.role, self.writing, self.reading) {
            (Role::Server, Phase::Initial, _) => {
                self.writing = Phase::Ack;
                self.offer()
            }
            (Role::Server, Phase::Ack, Phase::Done) if self.selection.is_some() => {
                self.writing = Phase::Done;
                "OK".to_owned()
            }
            (Role::Client, Phase::Select, Phase::Ack) => match &self.selection {
                Some(sel) => {
                    self.writing = Phase::Done;
                    format!("{} {}", sel.proto, sel.dom)
                }
                None => return Ok(None),
            },
            _ => return Ok(None),
        };
        Ok(Some(out.into_bytes()))
    }

    fn read(&mut self, msg: &[u8]) -> Result<()> {
        let text = String::from_utf8_lossy(msg).into_owned();
        let res = match (self.role, self.reading) {
            (Role::Server, Phase::Select) if self.writing == Phase::Ack => {
                self.accept(&text).map(|sel| {
                    self.selection = Some(sel);
                    self.reading = Phase::Done;
                })
            }
            (Role::Client, Phase::Initial) => self.choose(&text).map(|sel| {
                self.selection = Some(sel);
                self.reading = Phase::Ack;
            }),
            (Role::Client, Phase::Ack) if self.writing == Phase::Done => {
                if text == "OK" {
                    self.reading = Phase::Done;
                    Ok(())
                } else {
                    Err(AuthFailure::Negotiation(format!("expected OK, got {}", text)).into())
                }
            }
            _ => Err(AuthFailure::Negotiation("unexpected message".into()).into()),
        };
        res.map_err(|e| self.fail(e))
    }

    fn status(&self) -> Status {
        if self.diagnostic.is_some() {
            return Status::Continue;
        }
        match (&self.selection, self.reading, self.writing) {
            (Some(sel), Phase::Done, Phase::Done) => Status::Delegated(sel.clone()),
            _ => Status::Continue,
        }
    }

    fn diagnostic(&self) -> Option<&str> {
        self.diagnostic.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(domain: &str, protocols: &[&str]) -> AuthConfig {
        AuthConfig {
            domain: domain.to_owned(),
            protocols: protocols.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn server_and_client_agree() {
        let mut srv = P9any::new(Role::Server, &config("plan9", &["p9sk1", "p9sk2"])).unwrap();
        let mut cli = P9any::new(Role::Client, &config("", &["p9sk2", "p9sk1"])).unwrap();

        assert_eq!(cli.write().unwrap(), None);
        let offer = srv.write().unwrap().unwrap();
        assert_eq!(offer, b"v.2 p9sk1@plan9 p9sk2@plan9");
        assert_eq!(srv.write().unwrap(), None);

        cli.read(&offer).unwrap();
        let sel = cli.write().unwrap().unwrap();
        assert_eq!(sel, b"p9sk2 plan9");

        srv.read(&sel).unwrap();
        let ok = srv.write().unwrap().unwrap();
        assert_eq!(ok, b"OK");
        cli.read(&ok).unwrap();

        let want = Selection {
            proto: "p9sk2".into(),
            dom: "plan9".into(),
        };
        assert_eq!(srv.status(), Status::Delegated(want.clone()));
        assert_eq!(cli.status(), Status::Delegated(want));
    }

    #[test]
    fn unknown_protocol_or_domain_fails() {
        let cfg = config("plan9", &["p9sk1"]);

        let mut srv = P9any::new(Role::Server, &cfg).unwrap();
        srv.write().unwrap();
        assert!(srv.read(b"p9sk2 plan9").is_err());
        assert!(srv.diagnostic().unwrap().contains("p9sk2"));
        assert_eq!(srv.status(), Status::Continue);

        let mut srv = P9any::new(Role::Server, &cfg).unwrap();
        srv.write().unwrap();
        assert!(srv.read(b"p9sk1 inferno").is_err());

        let mut srv = P9any::new(Role::Server, &cfg).unwrap();
        srv.write().unwrap();
        assert!(srv.read(b"p9sk1").is_err());

        let mut cli = P9any::new(Role::Client, &config("", &["p9sk2"])).unwrap();
        assert!(cli.read(b"v.2 p9sk1@plan9").is_err());
    }

    #[test]
    fn out_of_order_read_fails() {
        let mut srv = P9any::new(Role::Server, &config("plan9", &["p9sk1"])).unwrap();
        assert!(srv.read(b"p9sk1 plan9").is_err());
    }
}
