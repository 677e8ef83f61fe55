//! Asynchronous server side of 9P2000 and Styx.
//!
//! A server is a [`Namespace`] plus a [`Config`]. Each accepted connection
//! first peeks at the incoming bytes: a keyring frame starts authentication
//! at connection start, which may end by pushing a secure layer onto the
//! channel. The dialect is then fixed, from the configuration or from the
//! first message, and the session loop takes over.

mod engine;
mod session;

pub use self::engine::inherit_perm;

use {
    self::engine::Engine,
    crate::{
        auth::{self, Credential, Role, keyring},
        channel::Channel,
        config::Config,
        dialect::{self, Dialect},
        error::{Error, string::*},
        fcall::*,
        io_err, res,
        utils::{self, Result},
    },
    async_trait::async_trait,
    bytes::BytesMut,
    log::{error, info, warn},
    std::{
        path::{Path, PathBuf},
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        time::Duration,
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpListener, UnixListener},
        sync::{OwnedSemaphorePermit, Semaphore},
    },
};

/// The file tree a server exports.
///
/// The engine owns the protocol: fids, open modes, directory listings and
/// permission inheritance on create. A namespace only resolves names and
/// moves bytes, and decides what each credential may do.
///
/// Errors are sent to the client as strings; use [`Error::No`] with one of
/// the constants in [`crate::errstr`] or [`Error::Msg`].
///
/// # Example
/// ```no_run
/// use rstyx::{Error, Result, Stat, errstr::*, auth::Credential, srv::Namespace};
/// use async_trait::async_trait;
///
/// struct Empty;
///
/// #[async_trait]
/// impl Namespace for Empty {
///     type Entry = ();
///     type Handle = ();
///
///     async fn root(&self, _: &Credential, _: &str) -> Result<Option<()>> { Ok(Some(())) }
///     async fn stat(&self, _: &()) -> Result<Stat> { Ok(Stat::default()) }
///     async fn walk_child(&self, _: &Credential, _: &(), _: &str) -> Result<Option<()>> { Ok(None) }
///     async fn children(&self, _: &Credential, _: &()) -> Result<Vec<()>> { Ok(vec![]) }
///     async fn open(&self, _: &Credential, _: &(), _: u8) -> Result<()> { Ok(()) }
///     async fn create(&self, _: &Credential, _: &(), _: &str, _: u32, _: u8) -> Result<((), ())> {
///         Err(Error::No(EPERM))
///     }
///     async fn read(&self, _: &(), _: u64, _: u32) -> Result<Vec<u8>> { Ok(vec![]) }
///     async fn write(&self, _: &(), _: u64, _: &[u8]) -> Result<u32> { Err(Error::No(EPERM)) }
///     async fn remove(&self, _: &Credential, _: &()) -> Result<()> { Err(Error::No(EPERM)) }
/// }
/// ```
#[async_trait]
pub trait Namespace: Send + Sync + 'static {
    /// A node of the tree, cheap to clone.
    type Entry: Clone + Send + Sync + 'static;

    /// State of an opened node.
    type Handle: Send + Sync + 'static;

    /// Root for `aname`, or `None` if there is no such tree.
    async fn root(&self, cred: &Credential, aname: &str) -> Result<Option<Self::Entry>>;

    async fn stat(&self, entry: &Self::Entry) -> Result<Stat>;

    /// Child `name` of the directory `dir`, `None` if it does not exist.
    ///
    /// Return an error rather than `None` when the child exists but may not
    /// be looked up.
    async fn walk_child(
        &self,
        cred: &Credential,
        dir: &Self::Entry,
        name: &str,
    ) -> Result<Option<Self::Entry>>;

    /// Directory contents, in listing order.
    async fn children(&self, cred: &Credential, dir: &Self::Entry) -> Result<Vec<Self::Entry>>;

    async fn open(&self, cred: &Credential, entry: &Self::Entry, mode: u8)
    -> Result<Self::Handle>;

    /// Create `name` in `dir` and open it with `mode`.
    ///
    /// `perm` already has the parent's permissions applied.
    async fn create(
        &self,
        cred: &Credential,
        dir: &Self::Entry,
        name: &str,
        perm: u32,
        mode: u8,
    ) -> Result<(Self::Entry, Self::Handle)>;

    /// Up to `count` bytes at `offset`. A short read is not an error.
    async fn read(&self, handle: &Self::Handle, offset: u64, count: u32) -> Result<Vec<u8>>;

    /// Returns the number of bytes written.
    async fn write(&self, handle: &Self::Handle, offset: u64, data: &[u8]) -> Result<u32>;

    async fn wstat(&self, _cred: &Credential, _entry: &Self::Entry, _stat: &Stat) -> Result<()> {
        Err(Error::No(EPERM))
    }

    async fn remove(&self, cred: &Credential, entry: &Self::Entry) -> Result<()>;

    /// Called once for every handle when its fid is released.
    async fn clunk(&self, _handle: Self::Handle) {}
}

/// How long a leading zero byte waits for the rest of a 9P2000 header.
const HEAD_WAIT: Duration = Duration::from_millis(50);

/// Enough leading bytes to tell keyring frames and both dialects apart.
async fn peek_head<R, W>(channel: &mut Channel<R, W>) -> Result<BytesMut>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let first = channel.peek_bytes(1).await?;
    match first.first() {
        None => Ok(first),
        Some(&t) if t != dialect::v1::MsgType::TNop as u8 => channel.peek_bytes(5).await,
        // A lone Tnop is three bytes and waits for its reply, while a
        // 9P2000 length may also start with a zero byte.
        Some(_) => {
            let nop = channel.peek_bytes(3).await?;
            Ok(channel.peek_bytes_within(5, HEAD_WAIT).await?.unwrap_or(nop))
        }
    }
}

/// Dialect fixed by configuration, or recognised from the first message.
fn select_dialect(config: &Config, head: &[u8]) -> Result<Arc<dyn Dialect>> {
    let dialects = dialect::registry();
    let name = match &config.dialect {
        Some(name) => name.clone(),
        None => dialect::detect(head).ok_or(Error::No(EBADTYPE))?.to_owned(),
    };
    Ok((dialects.get(&name)?)())
}

/// Serve one connection over any byte stream.
pub async fn serve_stream<N, S>(namespace: Arc<N>, config: Arc<Config>, stream: S) -> Result<()>
where
    N: Namespace,
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut channel = Channel::from_stream(stream);
    let handlers = Arc::new(auth::registry());

    let mut head = peek_head(&mut channel).await?;
    if head.is_empty() {
        return Ok(());
    }

    let cred = if keyring::is_keyring(&head) {
        if !config.auth.is_enabled() {
            channel
                .write_raw(&keyring::encode_error(EAUTHNONE))
                .await?;
            return Err(Error::No(EAUTHNONE));
        }
        let auth = Arc::new(config.auth.clone());
        let cred = auth::authenticate(&mut channel, Role::Server, auth, handlers.clone()).await?;
        info!("authenticated: {}", cred.user());

        head = peek_head(&mut channel).await?;
        if head.is_empty() {
            return Ok(());
        }
        cred
    } else {
        Credential::new("none")
    };

    let dialect = select_dialect(&config, &head)?;
    channel.set_framing(dialect.framing());
    info!("dialect: {}", dialect.name());

    let engine = Arc::new(Engine::new(namespace, config, handlers, dialect, cred));
    let (reader, writer) = channel.split();
    session::run(engine, reader, writer).await
}

fn spawn_session<N, S>(
    namespace: &Arc<N>,
    config: &Arc<Config>,
    stream: S,
    permit: OwnedSemaphorePermit,
) where
    N: Namespace,
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (namespace, config) = (namespace.clone(), config.clone());
    tokio::spawn(async move {
        if let Err(e) = serve_stream(namespace, config, stream).await {
            error!("Error: {}: {:?}", e, e);
        }
        drop(permit);
    });
}

pub async fn srv_async_tcp<N: Namespace>(
    namespace: Arc<N>,
    config: Arc<Config>,
    addr: &str,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    let sessions = Arc::new(Semaphore::new(config.max_sessions));

    loop {
        let permit = sessions
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| io_err!(Other, "session limit closed"))?;
        let (stream, peer) = listener.accept().await?;
        info!("accepted: {:?}", peer);

        spawn_session(&namespace, &config, stream, permit);
    }
}

struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove socket file {:?}: {}", self.path, e);
        }
    }
}

pub async fn srv_async_unix<N: Namespace>(
    namespace: Arc<N>,
    config: Arc<Config>,
    addr: impl AsRef<Path>,
) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let listener = DeleteOnDrop::bind(addr)?;
    let sessions = Arc::new(Semaphore::new(config.max_sessions));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let running = Arc::new(AtomicBool::new(true));

    {
        let running = running.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                }
            }
            running.store(false, Ordering::SeqCst);
        });
    }

    while running.load(Ordering::SeqCst) {
        let permit = tokio::select! {
            permit = sessions.clone().acquire_owned() => {
                permit.map_err(|_| io_err!(Other, "session limit closed"))?
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => continue,
        };

        tokio::select! {
            result = listener.accept() => {
                let (stream, peer) = result?;
                info!("accepted: {:?}", peer);
                spawn_session(&namespace, &config, stream, permit);
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {
                // Allow the server to check the running flag
            }
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Listen on `addr` (`"tcp!host!port"` or `"unix!path!suffix"`) and serve
/// every connection with `namespace`.
pub async fn srv_async<N: Namespace>(namespace: N, config: Config, addr: &str) -> Result<()> {
    let (proto, listen_addr) = utils::parse_proto(addr)
        .ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;
    let (namespace, config) = (Arc::new(namespace), Arc::new(config));

    match proto {
        "tcp" => srv_async_tcp(namespace, config, &listen_addr).await,
        "unix" => srv_async_unix(namespace, config, &listen_addr).await,
        _ => res!(io_err!(InvalidInput, "Protocol not supported")),
    }
}
