#![allow(dead_code)]

use std::{sync::Arc, sync::Mutex, time::Duration};

use async_trait::async_trait;
use rstyx::{
    Error, FCall, Msg, QId, QIdType, Result, Stat, auth::Credential, channel::Channel,
    config::Config, dialect, dialect::Dialect, dm, errstr::*, om, srv::Namespace,
};
use tokio::{
    io::{DuplexStream, ReadHalf, WriteHalf},
    task::JoinHandle,
};

pub const README: &[u8] = b"hello styx\n";

pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Clone, Debug)]
struct Node {
    name: String,
    parent: usize,
    mode: u32,
    uid: String,
    version: u32,
    data: Vec<u8>,
    children: Vec<usize>,
    removed: bool,
}

/// Small tree kept in memory:
///
/// ```text
/// /          sys 0775
/// /README    sys 0644
/// /secret    sys 0700
/// /secret/key
/// /slow      sys 0666, writes never finish
/// /lazy      sys 0666, writes take 200ms
/// /tmp       sys 0777
/// ```
pub struct MemFs {
    nodes: Mutex<Vec<Node>>,
}

impl MemFs {
    pub fn new() -> MemFs {
        let fs = MemFs {
            nodes: Mutex::new(Vec::new()),
        };
        let root = fs.add(0, "/", dm::DIR | 0o775, b"");
        fs.add(root, "README", 0o644, README);
        let secret = fs.add(root, "secret", dm::DIR | 0o700, b"");
        fs.add(secret, "key", 0o600, b"sesame");
        fs.add(root, "slow", 0o666, b"");
        fs.add(root, "lazy", 0o666, b"");
        fs.add(root, "tmp", dm::DIR | 0o777, b"");
        fs
    }

    fn add(&self, parent: usize, name: &str, mode: u32, data: &[u8]) -> usize {
        let mut nodes = self.nodes.lock().unwrap();
        let id = nodes.len();
        nodes.push(Node {
            name: name.to_owned(),
            parent,
            mode,
            uid: "sys".to_owned(),
            version: 0,
            data: data.to_vec(),
            children: Vec::new(),
            removed: false,
        });
        if id != parent {
            nodes[parent].children.push(id);
        }
        id
    }
}

/// Owner bits for the owner, other bits for everybody else.
fn allowed(cred: &Credential, node: &Node, bit: u32) -> bool {
    let shift = if cred.is_member(&node.uid) { 6 } else { 0 };
    (node.mode >> shift) & bit != 0
}

#[async_trait]
impl Namespace for MemFs {
    type Entry = usize;
    type Handle = usize;

    async fn root(&self, _: &Credential, aname: &str) -> Result<Option<usize>> {
        Ok(match aname {
            "" | "/" => Some(0),
            _ => None,
        })
    }

    async fn stat(&self, entry: &usize) -> Result<Stat> {
        let nodes = self.nodes.lock().unwrap();
        let n = nodes.get(*entry).filter(|n| !n.removed).ok_or(Error::No(ENOENT))?;
        Ok(Stat {
            qid: QId {
                typ: QIdType::from_mode(n.mode),
                version: n.version,
                path: *entry as u64,
            },
            mode: n.mode,
            length: if n.mode & dm::DIR != 0 { 0 } else { n.data.len() as u64 },
            name: n.name.clone(),
            uid: n.uid.clone(),
            gid: n.uid.clone(),
            muid: n.uid.clone(),
            ..Default::default()
        })
    }

    async fn walk_child(&self, cred: &Credential, dir: &usize, name: &str) -> Result<Option<usize>> {
        let nodes = self.nodes.lock().unwrap();
        let d = &nodes[*dir];
        if name == ".." {
            return Ok(Some(d.parent));
        }
        if !allowed(cred, d, dm::EXEC) {
            return Err(Error::No(EPERM));
        }
        Ok(d.children
            .iter()
            .copied()
            .find(|&c| nodes[c].name == name && !nodes[c].removed))
    }

    async fn children(&self, _: &Credential, dir: &usize) -> Result<Vec<usize>> {
        let nodes = self.nodes.lock().unwrap();
        Ok(nodes[*dir]
            .children
            .iter()
            .copied()
            .filter(|&c| !nodes[c].removed)
            .collect())
    }

    async fn open(&self, cred: &Credential, entry: &usize, mode: u8) -> Result<usize> {
        let mut nodes = self.nodes.lock().unwrap();
        let n = &mut nodes[*entry];
        if (om::readable(mode) && !allowed(cred, n, dm::READ))
            || (om::writable(mode) && !allowed(cred, n, dm::WRITE))
        {
            return Err(Error::No(EPERM));
        }
        if mode & om::TRUNC != 0 {
            n.data.clear();
        }
        Ok(*entry)
    }

    async fn create(
        &self,
        cred: &Credential,
        dir: &usize,
        name: &str,
        perm: u32,
        _mode: u8,
    ) -> Result<(usize, usize)> {
        {
            let nodes = self.nodes.lock().unwrap();
            let d = &nodes[*dir];
            if !allowed(cred, d, dm::WRITE) {
                return Err(Error::No(EPERM));
            }
            if d.children.iter().any(|&c| nodes[c].name == name && !nodes[c].removed) {
                return Err(Error::Msg("file exists".into()));
            }
        }
        let id = self.add(*dir, name, perm, b"");
        self.nodes.lock().unwrap()[id].uid = cred.user().to_owned();
        Ok((id, id))
    }

    async fn read(&self, handle: &usize, offset: u64, count: u32) -> Result<Vec<u8>> {
        let nodes = self.nodes.lock().unwrap();
        let data = &nodes[*handle].data;
        let start = (offset as usize).min(data.len());
        let end = (start + count as usize).min(data.len());
        Ok(data[start..end].to_vec())
    }

    async fn write(&self, handle: &usize, offset: u64, data: &[u8]) -> Result<u32> {
        let name = self.nodes.lock().unwrap()[*handle].name.clone();
        match name.as_str() {
            "slow" => tokio::time::sleep(Duration::from_secs(3600)).await,
            "lazy" => tokio::time::sleep(Duration::from_millis(200)).await,
            _ => {}
        }
        let mut nodes = self.nodes.lock().unwrap();
        let n = &mut nodes[*handle];
        let end = offset as usize + data.len();
        if n.data.len() < end {
            n.data.resize(end, 0);
        }
        n.data[offset as usize..end].copy_from_slice(data);
        n.version += 1;
        Ok(data.len() as u32)
    }

    async fn wstat(&self, cred: &Credential, entry: &usize, stat: &Stat) -> Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        let n = &mut nodes[*entry];
        if !cred.is_member(&n.uid) {
            return Err(Error::No(EPERM));
        }
        if !stat.name.is_empty() {
            n.name = stat.name.clone();
        }
        Ok(())
    }

    async fn remove(&self, cred: &Credential, entry: &usize) -> Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        if *entry == 0 {
            return Err(Error::No(EPERM));
        }
        let parent = nodes[*entry].parent;
        if !allowed(cred, &nodes[parent], dm::WRITE) {
            return Err(Error::No(EPERM));
        }
        if nodes[*entry].children.iter().any(|&c| !nodes[c].removed) {
            return Err(Error::Msg("directory not empty".into()));
        }
        nodes[*entry].removed = true;
        Ok(())
    }
}

/// Serve one in-memory session over a duplex pipe; returns the client end.
pub fn serve(config: Config) -> (DuplexStream, JoinHandle<Result<()>>) {
    init_log();
    let (client, server) = tokio::io::duplex(64 * 1024);
    let handle = tokio::spawn(rstyx::srv::serve_stream(
        Arc::new(MemFs::new()),
        Arc::new(config),
        server,
    ));
    (client, handle)
}

pub type ClientChannel = Channel<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

/// Minimal client speaking one dialect.
pub struct Client {
    pub chan: ClientChannel,
    pub dialect: Arc<dyn Dialect>,
}

impl Client {
    pub fn new(stream: DuplexStream, dialect: &str) -> Client {
        Client::over(Channel::from_stream(stream), dialect)
    }

    /// Continue on a channel that may already carry layers.
    pub fn over(mut chan: ClientChannel, dialect: &str) -> Client {
        let dialect = (dialect::registry().get(dialect).unwrap())();
        chan.set_framing(dialect.framing());
        Client { chan, dialect }
    }

    pub async fn send(&mut self, tag: u16, body: FCall) {
        let frame = self.dialect.encode(&Msg { tag, body }, None).unwrap();
        self.chan.send(&frame).await.unwrap();
    }

    pub async fn recv(&mut self) -> Msg {
        let frame = tokio::time::timeout(Duration::from_secs(5), self.chan.next())
            .await
            .expect("no reply")
            .unwrap()
            .expect("connection closed");
        self.dialect.decode(&frame).unwrap()
    }

    pub async fn rpc(&mut self, tag: u16, body: FCall) -> FCall {
        self.send(tag, body).await;
        let reply = self.recv().await;
        assert_eq!(reply.tag, tag);
        reply.body
    }

    pub async fn version(&mut self) {
        let r = self
            .rpc(
                rstyx::NOTAG,
                FCall::TVersion {
                    msize: 8192,
                    version: rstyx::P92000.into(),
                },
            )
            .await;
        assert!(matches!(r, FCall::RVersion { .. }), "{:?}", r);
    }

    pub async fn attach(&mut self, fid: u32, afid: u32, uname: &str) -> FCall {
        self.rpc(
            1,
            FCall::TAttach {
                fid,
                afid,
                uname: uname.into(),
                aname: "".into(),
            },
        )
        .await
    }

    pub async fn walk(&mut self, fid: u32, newfid: u32, names: &[&str]) -> FCall {
        self.rpc(
            2,
            FCall::TWalk {
                fid,
                newfid,
                wnames: names.iter().map(|s| s.to_string()).collect(),
            },
        )
        .await
    }
}

pub fn rerror(ename: &str) -> FCall {
    FCall::RError {
        ename: ename.to_owned(),
    }
}
