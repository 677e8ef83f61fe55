//! Per-session protocol state: the fid table and the operations behind each
//! request, identical for both dialects.

use {
    super::Namespace,
    crate::{
        auth::{Conversation, Credential, HandlerFactory, Role, keyring::KeyringCodec},
        config::{AuthConfig, Config},
        dialect::Dialect,
        error::{Error, string::*},
        fcall::*,
        registry::Registry,
        utils::Result,
    },
    bytes::BytesMut,
    log::{debug, warn},
    std::{
        collections::{HashMap, VecDeque},
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicU32, Ordering},
        },
    },
    tokio::sync::{Mutex, RwLock},
    tokio_util::codec::Decoder,
};

/// Auth fid qids live above every namespace path.
const AUTH_QID_BASE: u64 = 1 << 63;

/// Encoded stat records of one directory listing still to be returned.
#[derive(Debug, Default)]
struct DirCursor {
    offset: u64,
    pending: VecDeque<Vec<u8>>,
}

/// State of an opened fid.
struct Open<H> {
    handle: H,
    mode: u8,
    last_read: u64,
    last_write: u64,
    dir: Option<DirCursor>,
}

impl<H> Open<H> {
    fn new(handle: H, mode: u8, is_dir: bool) -> Open<H> {
        Open {
            handle,
            mode,
            last_read: 0,
            last_write: 0,
            dir: is_dir.then(DirCursor::default),
        }
    }
}

/// Server end of an authentication run through an auth fid.
///
/// Reads and writes on the fid carry keyring-framed messages as a byte
/// stream; partial frames are buffered on both sides.
struct AuthFile {
    conv: Conversation,
    outgoing: Vec<u8>,
    incoming: BytesMut,
}

impl AuthFile {
    fn read(&mut self, count: usize) -> Result<Vec<u8>> {
        if self.outgoing.is_empty() {
            if let Some(frame) = self.conv.outgoing()? {
                self.outgoing = frame;
            }
        }
        let n = count.min(self.outgoing.len());
        Ok(self.outgoing.drain(..n).collect())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.incoming.extend_from_slice(data);
        while let Some(frame) = KeyringCodec.decode(&mut self.incoming)? {
            self.conv.incoming(&frame)?;
        }
        Ok(())
    }
}

enum Node<N: Namespace> {
    Auth(AuthFile),
    File {
        entry: N::Entry,
        open: Option<Open<N::Handle>>,
    },
}

/// One entry of the fid table.
struct Fid<N: Namespace> {
    cred: Arc<Credential>,
    node: Mutex<Node<N>>,
}

impl<N: Namespace> Fid<N> {
    fn file(cred: Arc<Credential>, entry: N::Entry) -> Fid<N> {
        Fid {
            cred,
            node: Mutex::new(Node::File { entry, open: None }),
        }
    }
}

/// Permissions of a new file given the parent directory's mode.
///
/// Files inherit at most the parent's rw bits, directories its rwx bits.
pub fn inherit_perm(perm: u32, parent: u32) -> u32 {
    if perm & dm::DIR != 0 {
        perm & (!0o777 | (parent & 0o777))
    } else {
        perm & (!0o666 | (parent & 0o666))
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name.contains('/') {
        return Err(Error::No(EBADNAME));
    }
    Ok(())
}

pub struct Engine<N: Namespace> {
    ns: Arc<N>,
    config: Arc<Config>,
    /// Settings for auth fids: no channel algorithm can be pushed there.
    afid_auth: Arc<AuthConfig>,
    auth_handlers: Arc<Registry<HandlerFactory>>,
    dialect: Arc<dyn Dialect>,
    /// Credential proven at connection start, or an anonymous one.
    cred: Credential,
    fids: RwLock<HashMap<u32, Arc<Fid<N>>>>,
    msize: AtomicU32,
    negotiated: AtomicBool,
}

impl<N: Namespace> Engine<N> {
    pub fn new(
        ns: Arc<N>,
        config: Arc<Config>,
        auth_handlers: Arc<Registry<HandlerFactory>>,
        dialect: Arc<dyn Dialect>,
        cred: Credential,
    ) -> Engine<N> {
        let msize = dialect
            .max_msize()
            .map_or(config.msize, |max| max.min(config.msize));
        let afid_auth = Arc::new(config.auth.clone().with_security(None));
        Engine {
            ns,
            negotiated: AtomicBool::new(!dialect.needs_version()),
            config,
            afid_auth,
            auth_handlers,
            dialect,
            cred,
            fids: RwLock::new(HashMap::new()),
            msize: AtomicU32::new(msize),
        }
    }

    pub fn dialect(&self) -> &Arc<dyn Dialect> {
        &self.dialect
    }

    pub fn msize(&self) -> u32 {
        self.msize.load(Ordering::SeqCst)
    }

    fn iounit(&self) -> u32 {
        self.msize().saturating_sub(IOHDRSZ)
    }

    async fn fid(&self, fid: u32) -> Result<Arc<Fid<N>>> {
        self.fids
            .read()
            .await
            .get(&fid)
            .cloned()
            .ok_or(Error::No(EBADFID))
    }

    async fn bind(&self, fid: u32, entry: Fid<N>) -> Result<()> {
        let mut fids = self.fids.write().await;
        if fids.contains_key(&fid) {
            return Err(Error::No(EFIDINUSE));
        }
        fids.insert(fid, Arc::new(entry));
        Ok(())
    }

    async fn in_use(&self, fid: u32) -> bool {
        self.fids.read().await.contains_key(&fid)
    }

    /// Execute one request other than `Tversion`.
    #[rustfmt::skip]
    pub async fn dispatch(&self, msg: &Msg) -> Result<FCall> {
        use crate::FCall::*;

        if !self.negotiated.load(Ordering::SeqCst) {
            return Err(Error::No(ENEGOTIATE));
        }

        match msg.body {
            TAuth { afid, ref uname, ref aname }          => self.auth(afid, uname, aname).await,
            TAttach { fid, afid, ref uname, ref aname }   => self.attach(fid, afid, uname, aname).await,
            TFlush { .. }                                 => Ok(RFlush),
            TWalk { fid, newfid, ref wnames }             => self.walk(fid, newfid, wnames).await,
            TOpen { fid, mode }                           => self.open(fid, mode).await,
            TCreate { fid, ref name, perm, mode }         => self.create(fid, name, perm, mode).await,
            TRead { fid, offset, count }                  => self.read(fid, offset, count).await,
            TWrite { fid, offset, ref data }              => self.write(fid, offset, &data.0).await,
            TClunk { fid }                                => self.clunk(fid).await,
            TRemove { fid }                               => self.remove(fid).await,
            TStat { fid }                                 => self.stat(fid).await,
            TWStat { fid, ref stat }                      => self.wstat(fid, stat).await,
            TNop                                          => Ok(RNop),
            _                                             => Err(Error::No(EBADTYPE)),
        }
    }

    /// Whether a `Tversion` may reset the session. A rejected one leaves
    /// fids and outstanding requests alone.
    pub fn check_version(&self, tag: u16, msize: u32) -> Result<()> {
        if tag != NOTAG {
            return Err(Error::No(ENOTAG));
        }
        if msize < MIN_MSIZE {
            return Err(Error::No(EMSIZE));
        }
        Ok(())
    }

    /// Reset the session and agree on a message size and version.
    ///
    /// The caller cancels outstanding operations first.
    pub async fn version(&self, tag: u16, msize: u32, version: &str) -> Result<FCall> {
        self.check_version(tag, msize)?;
        self.clunk_all().await;

        let max = self
            .dialect
            .max_msize()
            .map_or(self.config.msize, |m| m.min(self.config.msize));
        let msize = msize.min(max);
        self.msize.store(msize, Ordering::SeqCst);

        let known = version == P92000 || version.starts_with("9P2000.");
        self.negotiated.store(known, Ordering::SeqCst);
        if !known {
            debug!("version: unknown {:?}", version);
        }

        Ok(FCall::RVersion {
            msize,
            version: if known { P92000 } else { VERSION_UNKNOWN }.to_owned(),
        })
    }

    async fn auth(&self, afid: u32, uname: &str, _aname: &str) -> Result<FCall> {
        if !self.config.auth.is_enabled() {
            return Err(Error::No(EAUTHNONE));
        }
        if afid == NOFID {
            return Err(Error::No(EBADFID));
        }

        let conv = Conversation::start(
            Role::Server,
            self.afid_auth.clone(),
            self.auth_handlers.clone(),
        )?;
        let file = AuthFile {
            conv,
            outgoing: Vec::new(),
            incoming: BytesMut::new(),
        };
        self.bind(
            afid,
            Fid {
                cred: Arc::new(Credential::new(uname)),
                node: Mutex::new(Node::Auth(file)),
            },
        )
        .await?;

        Ok(FCall::RAuth {
            aqid: auth_qid(afid),
        })
    }

    async fn attach(&self, fid: u32, afid: u32, uname: &str, aname: &str) -> Result<FCall> {
        if self.in_use(fid).await {
            return Err(Error::No(EFIDINUSE));
        }

        let mut cred = self.cred.clone();
        if !cred.is_authenticated() {
            cred = Credential::new(uname);
            cred.set_groups(self.config.auth.groups_of(uname));
        } else if cred.user() != uname {
            return Err(Error::No(EPERM));
        }

        if afid != NOFID {
            let auth = self.fid(afid).await?;
            let node = auth.node.lock().await;
            let Node::Auth(file) = &*node else {
                return Err(Error::No(EBADFID));
            };
            let proven = file.conv.credential().ok_or(Error::No(EAUTHINCOMPLETE))?;
            if proven.user() != uname {
                return Err(Error::No(EPERM));
            }
            cred.delegate(proven)?;
        }

        if self.config.auth.required && !cred.is_authenticated() {
            return Err(Error::No(ENOAUTH));
        }

        let root = self
            .ns
            .root(&cred, aname)
            .await?
            .ok_or(Error::No(ENONS))?;
        let qid = self.ns.stat(&root).await?.qid;
        self.bind(fid, Fid::file(Arc::new(cred), root)).await?;

        Ok(FCall::RAttach { qid })
    }

    async fn walk(&self, fid: u32, newfid: u32, wnames: &[String]) -> Result<FCall> {
        if wnames.len() > MAXWELEM {
            return Err(Error::No(ETOOMANY));
        }
        let src = self.fid(fid).await?;
        if newfid != fid && self.in_use(newfid).await {
            return Err(Error::No(EFIDINUSE));
        }

        let mut cur = match &*src.node.lock().await {
            Node::File { open: Some(_), .. } => return Err(Error::No(EOPENED)),
            Node::File { entry, .. } => entry.clone(),
            Node::Auth(_) => return Err(Error::No(EAUTHFID)),
        };

        let mut wqids = Vec::with_capacity(wnames.len());
        for name in wnames {
            let step = async {
                check_name(name)?;
                if !self.ns.stat(&cur).await?.is_dir() {
                    return Err(Error::No(ENOTDIR));
                }
                self.ns
                    .walk_child(&src.cred, &cur, name)
                    .await?
                    .ok_or(Error::No(ENOENT))
            };
            let res = step.await;
            match res {
                Ok(next) => {
                    wqids.push(self.ns.stat(&next).await?.qid);
                    cur = next;
                }
                Err(e) if wqids.is_empty() => return Err(e),
                Err(e) => {
                    debug!("walk: stopped at {:?}: {}", name, e);
                    break;
                }
            }
        }

        // A partial walk binds nothing.
        if wqids.len() < wnames.len() {
            return Ok(FCall::RWalk { wqids });
        }

        if newfid == fid {
            match &mut *src.node.lock().await {
                Node::File { open: Some(_), .. } => return Err(Error::No(EOPENED)),
                Node::File { entry, .. } => *entry = cur,
                Node::Auth(_) => return Err(Error::No(EAUTHFID)),
            }
        } else {
            self.bind(newfid, Fid::file(src.cred.clone(), cur)).await?;
        }

        Ok(FCall::RWalk { wqids })
    }

    async fn open(&self, fid: u32, mode: u8) -> Result<FCall> {
        let f = self.fid(fid).await?;
        let mut node = f.node.lock().await;
        let (entry, open) = match &mut *node {
            Node::Auth(_) => {
                return Ok(FCall::ROpen {
                    qid: auth_qid(fid),
                    iounit: self.iounit(),
                });
            }
            Node::File { entry, open } => (entry, open),
        };
        if open.is_some() {
            return Err(Error::No(EOPENED));
        }

        let stat = self.ns.stat(entry).await?;
        if stat.is_dir() && (om::writable(mode) || mode & om::TRUNC != 0) {
            return Err(Error::No(EISDIR));
        }
        let handle = self.ns.open(&f.cred, entry, mode).await?;
        *open = Some(Open::new(handle, mode, stat.is_dir()));

        Ok(FCall::ROpen {
            qid: stat.qid,
            iounit: self.iounit(),
        })
    }

    async fn create(&self, fid: u32, name: &str, perm: u32, mode: u8) -> Result<FCall> {
        if name == ".." {
            return Err(Error::No(EBADNAME));
        }
        check_name(name)?;

        let f = self.fid(fid).await?;
        let mut node = f.node.lock().await;
        let Node::File { entry, open } = &mut *node else {
            return Err(Error::No(EAUTHFID));
        };
        if open.is_some() {
            return Err(Error::No(EOPENED));
        }

        let parent = self.ns.stat(entry).await?;
        if !parent.is_dir() {
            return Err(Error::No(ENOTDIR));
        }
        let perm = inherit_perm(perm, parent.mode);
        if perm & dm::DIR != 0 && (om::writable(mode) || mode & om::TRUNC != 0) {
            return Err(Error::No(EACCESSMODE));
        }

        let (child, handle) = self.ns.create(&f.cred, entry, name, perm, mode).await?;
        let stat = self.ns.stat(&child).await?;
        *entry = child;
        *open = Some(Open::new(handle, mode, stat.is_dir()));

        Ok(FCall::RCreate {
            qid: stat.qid,
            iounit: self.iounit(),
        })
    }

    async fn read(&self, fid: u32, offset: u64, count: u32) -> Result<FCall> {
        let count = count.min(self.iounit());
        let f = self.fid(fid).await?;
        let mut node = f.node.lock().await;

        let data = match &mut *node {
            Node::Auth(file) => file.read(count as usize)?,
            Node::File { entry, open } => {
                let open = open.as_mut().ok_or(Error::No(ENOTOPEN))?;
                if !om::readable(open.mode) {
                    return Err(Error::No(EACCESSMODE));
                }
                match open.dir.as_mut() {
                    Some(cursor) => self.read_dir(&f.cred, entry, cursor, offset, count).await?,
                    None => {
                        let mut data = self.ns.read(&open.handle, offset, count).await?;
                        data.truncate(count as usize);
                        open.last_read = offset.saturating_add(data.len() as u64);
                        data
                    }
                }
            }
        };

        Ok(FCall::RRead { data: Data(data) })
    }

    /// Whole stat records that fit in `count`, continuing the listing at
    /// `offset` or starting over at 0.
    async fn read_dir(
        &self,
        cred: &Credential,
        dir: &N::Entry,
        cursor: &mut DirCursor,
        offset: u64,
        count: u32,
    ) -> Result<Vec<u8>> {
        if offset == 0 {
            let mut pending = VecDeque::new();
            for child in self.ns.children(cred, dir).await? {
                pending.push_back(self.dialect.encode_stat(&self.ns.stat(&child).await?));
            }
            *cursor = DirCursor { offset: 0, pending };
        } else if offset != cursor.offset {
            return Err(Error::No(EBADOFFSET));
        }

        let mut out = Vec::new();
        while let Some(next) = cursor.pending.front() {
            if out.len() + next.len() > count as usize {
                break;
            }
            out.extend_from_slice(next);
            cursor.pending.pop_front();
        }
        if out.is_empty() && !cursor.pending.is_empty() {
            return Err(Error::No(EMSIZE));
        }
        cursor.offset += out.len() as u64;
        Ok(out)
    }

    async fn write(&self, fid: u32, offset: u64, data: &[u8]) -> Result<FCall> {
        if data.len() > self.iounit() as usize {
            return Err(Error::No(EMSIZE));
        }
        let f = self.fid(fid).await?;
        let mut node = f.node.lock().await;

        let count = match &mut *node {
            Node::Auth(file) => {
                file.write(data)?;
                data.len() as u32
            }
            Node::File { open, .. } => {
                let open = open.as_mut().ok_or(Error::No(ENOTOPEN))?;
                if open.dir.is_some() {
                    return Err(Error::No(EISDIR));
                }
                if !om::writable(open.mode) {
                    return Err(Error::No(EACCESSMODE));
                }
                let n = self.ns.write(&open.handle, offset, data).await?;
                open.last_write = offset.saturating_add(n as u64);
                n
            }
        };

        Ok(FCall::RWrite { count })
    }

    async fn clunk(&self, fid: u32) -> Result<FCall> {
        let f = self
            .fids
            .write()
            .await
            .remove(&fid)
            .ok_or(Error::No(EBADFID))?;
        self.release(&f).await?;
        Ok(FCall::RClunk)
    }

    /// Close an unbound fid, removing the file if it was opened with `RCLOSE`.
    async fn release(&self, f: &Fid<N>) -> Result<()> {
        let mut node = f.node.lock().await;
        if let Node::File { entry, open } = &mut *node {
            if let Some(o) = open.take() {
                debug!(
                    "release: mode {:#x}, last read {}, last write {}",
                    o.mode, o.last_read, o.last_write
                );
                let rclose = o.mode & om::RCLOSE != 0;
                self.ns.clunk(o.handle).await;
                if rclose {
                    self.ns.remove(&f.cred, entry).await?;
                }
            }
        }
        Ok(())
    }

    async fn remove(&self, fid: u32) -> Result<FCall> {
        // The fid goes away whether or not the remove succeeds.
        let f = self
            .fids
            .write()
            .await
            .remove(&fid)
            .ok_or(Error::No(EBADFID))?;
        let mut node = f.node.lock().await;
        let Node::File { entry, open } = &mut *node else {
            return Err(Error::No(EAUTHFID));
        };
        if let Some(o) = open.take() {
            self.ns.clunk(o.handle).await;
        }
        self.ns.remove(&f.cred, entry).await?;
        Ok(FCall::RRemove)
    }

    async fn stat(&self, fid: u32) -> Result<FCall> {
        let f = self.fid(fid).await?;
        let node = f.node.lock().await;
        let stat = match &*node {
            Node::File { entry, .. } => self.ns.stat(entry).await?,
            Node::Auth(_) => Stat {
                qid: auth_qid(fid),
                mode: dm::AUTH | 0o600,
                name: "auth".to_owned(),
                uid: f.cred.user().to_owned(),
                gid: f.cred.user().to_owned(),
                muid: f.cred.user().to_owned(),
                ..Default::default()
            },
        };
        Ok(FCall::RStat { stat })
    }

    async fn wstat(&self, fid: u32, stat: &Stat) -> Result<FCall> {
        let f = self.fid(fid).await?;
        let node = f.node.lock().await;
        let Node::File { entry, .. } = &*node else {
            return Err(Error::No(EPERM));
        };
        self.ns.wstat(&f.cred, entry, stat).await?;
        Ok(FCall::RWStat)
    }

    /// Release every fid, as on teardown or a new `Tversion`.
    pub async fn clunk_all(&self) {
        let fids: Vec<_> = self.fids.write().await.drain().map(|(_, f)| f).collect();
        for f in fids {
            if let Err(e) = self.release(&f).await {
                warn!("clunk on reset: {}", e);
            }
        }
    }

    #[cfg(test)]
    async fn fid_count(&self) -> usize {
        self.fids.read().await.len()
    }
}

fn auth_qid(afid: u32) -> QId {
    QId {
        typ: QIdType::AUTH,
        version: 0,
        path: AUTH_QID_BASE | afid as u64,
    }
}
