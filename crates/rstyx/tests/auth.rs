mod common;

use std::sync::Arc;

use bytes::BytesMut;
use common::*;
use rstyx::{
    Data, FCall, NOFID,
    auth::{self, Conversation, Role, keyring::KeyringCodec},
    channel::Channel,
    config::{AuthConfig, Config},
    errstr::*,
    om,
};
use tokio_util::codec::Decoder;

fn server_auth() -> AuthConfig {
    AuthConfig::default()
        .with_id("fs")
        .with_domain("plan9")
        .with_password("sesame")
        .with_required(true)
}

fn client_auth(password: &str, proto: &str) -> Arc<AuthConfig> {
    Arc::new(
        AuthConfig::default()
            .with_id("glenda")
            .with_password(password)
            .with_protocols(&[proto]),
    )
}

async fn read_readme(c: &mut Client) -> FCall {
    c.walk(0, 1, &["README"]).await;
    c.rpc(3, FCall::TOpen { fid: 1, mode: om::READ }).await;
    c.rpc(
        3,
        FCall::TRead {
            fid: 1,
            offset: 0,
            count: 100,
        },
    )
    .await
}

async fn secured_session(proto: &str) {
    let config = Config::default()
        .with_auth(server_auth().with_security(Some("sha1/des_cbc")));
    let (stream, _) = serve(config);

    let mut chan = Channel::from_stream(stream);
    let cred = auth::authenticate(
        &mut chan,
        Role::Client,
        client_auth("sesame", proto),
        Arc::new(auth::registry()),
    )
    .await
    .unwrap();
    assert!(cred.is_authenticated());
    assert_eq!(cred.security(), Some("sha1/des_cbc"));

    let mut c = Client::over(chan, "9P2000");
    c.version().await;
    assert_eq!(c.attach(0, NOFID, "bootes").await, rerror(EPERM));
    assert!(matches!(c.attach(0, NOFID, "glenda").await, FCall::RAttach { .. }));
    assert_eq!(
        read_readme(&mut c).await,
        FCall::RRead {
            data: Data(README.to_vec())
        }
    );
}

#[tokio::test]
async fn p9sk1_secured_session() {
    secured_session("p9sk1").await;
}

#[tokio::test]
async fn p9sk2_secured_session() {
    secured_session("p9sk2").await;
}

async fn wrong_password_fails_both_ends(proto: &str) {
    let (stream, server) = serve(Config::default().with_auth(server_auth()));

    let mut chan = Channel::from_stream(stream);
    let res = auth::authenticate(
        &mut chan,
        Role::Client,
        client_auth("open sesame", proto),
        Arc::new(auth::registry()),
    )
    .await;
    assert!(res.is_err());
    assert!(server.await.unwrap().is_err());
}

#[tokio::test]
async fn p9sk1_wrong_password_fails_both_ends() {
    wrong_password_fails_both_ends("p9sk1").await;
}

#[tokio::test]
async fn p9sk2_wrong_password_fails_both_ends() {
    wrong_password_fails_both_ends("p9sk2").await;
}

#[tokio::test]
async fn connection_auth_without_configuration_is_refused() {
    let (stream, server) = serve(Config::default());

    let mut chan = Channel::from_stream(stream);
    let res = auth::authenticate(
        &mut chan,
        Role::Client,
        client_auth("sesame", "p9sk2"),
        Arc::new(auth::registry()),
    )
    .await;
    assert!(res.is_err());
    assert!(server.await.unwrap().is_err());
}

/// Run the client half of a conversation through reads and writes on `afid`.
async fn auth_through_fid(c: &mut Client, afid: u32, proto: &str) {
    let mut conv = Conversation::start(
        Role::Client,
        client_auth("sesame", proto),
        Arc::new(auth::registry()),
    )
    .unwrap();
    let mut pending = BytesMut::new();

    for _ in 0..32 {
        if conv.is_done() {
            return;
        }
        if let Some(frame) = conv.outgoing().unwrap() {
            let r = c
                .rpc(
                    6,
                    FCall::TWrite {
                        fid: afid,
                        offset: 0,
                        data: Data(frame.clone()),
                    },
                )
                .await;
            assert_eq!(
                r,
                FCall::RWrite {
                    count: frame.len() as u32
                }
            );
            continue;
        }

        let FCall::RRead { data } = c
            .rpc(
                6,
                FCall::TRead {
                    fid: afid,
                    offset: 0,
                    count: 8000,
                },
            )
            .await
        else {
            panic!("auth read failed");
        };
        pending.extend_from_slice(&data.0);
        while let Some(frame) = KeyringCodec.decode(&mut pending).unwrap() {
            conv.incoming(&frame).unwrap();
        }
    }
    panic!("authentication did not finish");
}

async fn auth_fid_then_attach(proto: &str) {
    let (stream, _) = serve(Config::default().with_auth(server_auth()));
    let mut c = Client::new(stream, "9P2000");
    c.version().await;

    // Nothing is proven yet.
    assert_eq!(c.attach(0, NOFID, "glenda").await, rerror(ENOAUTH));

    let r = c
        .rpc(
            5,
            FCall::TAuth {
                afid: 100,
                uname: "glenda".into(),
                aname: "".into(),
            },
        )
        .await;
    assert!(matches!(r, FCall::RAuth { aqid } if aqid.typ == rstyx::QIdType::AUTH), "{:?}", r);

    // An unfinished exchange does not admit anybody.
    assert_eq!(c.attach(0, 100, "glenda").await, rerror(EAUTHINCOMPLETE));

    auth_through_fid(&mut c, 100, proto).await;

    assert_eq!(c.walk(100, 101, &[]).await, rerror(EAUTHFID));
    assert_eq!(c.attach(0, 100, "bootes").await, rerror(EPERM));
    assert!(matches!(c.attach(0, 100, "glenda").await, FCall::RAttach { .. }));
    assert_eq!(
        read_readme(&mut c).await,
        FCall::RRead {
            data: Data(README.to_vec())
        }
    );
}

#[tokio::test]
async fn p9sk1_auth_fid_then_attach() {
    auth_fid_then_attach("p9sk1").await;
}

#[tokio::test]
async fn p9sk2_auth_fid_then_attach() {
    auth_fid_then_attach("p9sk2").await;
}
