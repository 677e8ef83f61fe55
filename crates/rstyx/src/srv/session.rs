//! Receive loop of one connection and the per-request reply tasks.

use {
    super::{Namespace, engine::Engine},
    crate::{
        channel::{ChannelReader, ChannelWriter},
        dialect::Dialect,
        error::{Error, string::EMSIZE},
        fcall::*,
        utils::Result,
    },
    bytes::BytesMut,
    log::{debug, error, info, warn},
    std::{
        collections::HashMap,
        sync::{
            Arc, Mutex as StdMutex, MutexGuard,
            atomic::{AtomicU64, Ordering},
        },
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        sync::Mutex,
    },
    tokio_util::sync::CancellationToken,
};

/// Outstanding requests by tag.
///
/// Each registration carries an id so a task can tell its own entry from a
/// later request reusing the tag.
#[derive(Debug, Default)]
struct Tags {
    seq: AtomicU64,
    map: StdMutex<HashMap<u16, (u64, CancellationToken)>>,
}

impl Tags {
    fn lock(&self) -> MutexGuard<'_, HashMap<u16, (u64, CancellationToken)>> {
        self.map.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new request; a duplicate tag replaces the older request.
    fn register(&self, tag: u16) -> (u64, CancellationToken) {
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        if let Some((_, older)) = self.lock().insert(tag, (id, token.clone())) {
            warn!("tag {} reused while outstanding", tag);
            older.cancel();
        }
        (id, token)
    }

    /// Remove and cancel the request under `tag`, if any.
    fn flush(&self, tag: u16) -> bool {
        match self.lock().remove(&tag) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove registration `id` of `tag`; false if it was flushed or replaced.
    fn finish(&self, tag: u16, id: u64) -> bool {
        let mut map = self.lock();
        match map.get(&tag) {
            Some((current, _)) if *current == id => {
                map.remove(&tag);
                true
            }
            _ => false,
        }
    }

    fn cancel_all(&self) {
        for (_, (_, token)) in self.lock().drain() {
            token.cancel();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type Writer<W> = Arc<Mutex<ChannelWriter<W>>>;

/// Encode a reply, falling back to an error reply the dialect can carry.
fn encode_reply(dialect: &dyn Dialect, request: Option<&FCall>, msg: &Msg) -> Option<BytesMut> {
    match dialect.encode(msg, request) {
        Ok(frame) => Some(frame),
        Err(e) => {
            error!("Failed to serialize response for tag {}: {:?}", msg.tag, e);
            let fallback = Msg {
                tag: msg.tag,
                body: FCall::RError {
                    ename: e.ename().into_owned(),
                },
            };
            dialect.encode(&fallback, request).ok()
        }
    }
}

/// Write `msg` unless the request was flushed meanwhile.
///
/// The registration is removed under the writer lock, so a flush either
/// suppresses this reply or is answered after it.
async fn reply<W>(
    writer: &Writer<W>,
    registration: Option<(&Tags, u64)>,
    dialect: &dyn Dialect,
    request: Option<&FCall>,
    msg: Msg,
) where
    W: AsyncWrite + Unpin,
{
    let frame = encode_reply(dialect, request, &msg);
    {
        let mut writer = writer.lock().await;
        if let Some((tags, id)) = registration {
            if !tags.finish(msg.tag, id) {
                debug!("tag {} flushed, reply dropped", msg.tag);
                return;
            }
        }
        let Some(frame) = frame else {
            return;
        };
        if let Err(e) = writer.send(&frame).await {
            error!("Failed to send response for tag {}: {:?}", msg.tag, e);
            return;
        }
    }
    info!("\t→ {:?}", msg);
}

fn error_reply(tag: u16, e: &Error) -> Msg {
    Msg {
        tag,
        body: FCall::RError {
            ename: e.ename().into_owned(),
        },
    }
}

/// Serve requests until the peer goes away, then tear the session down.
pub async fn run<N, R, W>(
    engine: Arc<Engine<N>>,
    reader: ChannelReader<R>,
    writer: ChannelWriter<W>,
) -> Result<()>
where
    N: Namespace,
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer = Arc::new(Mutex::new(writer));
    let tags = Arc::new(Tags::default());

    let res = receive(&engine, reader, &writer, &tags).await;

    tags.cancel_all();
    engine.clunk_all().await;
    if let Err(e) = writer.lock().await.close().await {
        debug!("close: {}", e);
    }
    res
}

async fn receive<N, R, W>(
    engine: &Arc<Engine<N>>,
    mut reader: ChannelReader<R>,
    writer: &Writer<W>,
    tags: &Arc<Tags>,
) -> Result<()>
where
    N: Namespace,
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let dialect = engine.dialect().clone();

    loop {
        let frame = match reader.next().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                error!("no message boundary to resume from, closing: {}", e);
                return Err(e);
            }
        };

        let msize = engine.msize() as usize;
        if dialect.needs_version() && frame.len() > msize {
            warn!("{} byte message exceeds msize {}", frame.len(), msize);
            if let Some(tag) = dialect.tag_of(&frame) {
                let e = Error::No(EMSIZE);
                reply(writer, None, dialect.as_ref(), None, error_reply(tag, &e)).await;
            }
            continue;
        }

        let msg = match dialect.decode(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("undecodable message: {}", e);
                if let Some(tag) = dialect.tag_of(&frame) {
                    reply(writer, None, dialect.as_ref(), None, error_reply(tag, &e)).await;
                }
                continue;
            }
        };
        info!("\t← {:?}", msg);

        match msg.body {
            FCall::TVersion { msize, ref version } => {
                let res = match engine.check_version(msg.tag, msize) {
                    Ok(()) => {
                        tags.cancel_all();
                        engine.version(msg.tag, msize, version).await
                    }
                    Err(e) => Err(e),
                };
                let body = res.unwrap_or_else(|e| error_reply(msg.tag, &e).body);
                let response = Msg { tag: msg.tag, body };
                reply(writer, None, dialect.as_ref(), Some(&msg.body), response).await;
                continue;
            }
            FCall::TFlush { oldtag } => {
                if tags.flush(oldtag) {
                    debug!("flushed tag {}", oldtag);
                }
            }
            _ => {}
        }

        let (id, token) = tags.register(msg.tag);
        let engine = engine.clone();
        let writer = writer.clone();
        let tags = tags.clone();

        tokio::spawn(async move {
            let body = tokio::select! {
                _ = token.cancelled() => {
                    debug!("tag {} cancelled", msg.tag);
                    return;
                }
                res = engine.dispatch(&msg) => res.unwrap_or_else(|e| {
                    error!("{:?}: Error: \"{}\": {:?}", MsgKind(&msg.body), e, e);
                    error_reply(msg.tag, &e).body
                }),
            };

            let response = Msg { tag: msg.tag, body };
            let dialect = engine.dialect().clone();
            reply(
                &writer,
                Some((&tags, id)),
                dialect.as_ref(),
                Some(&msg.body),
                response,
            )
            .await;
        });
    }

    Ok(())
}

/// Message name without its payload, for error logs.
struct MsgKind<'a>(&'a FCall);

impl std::fmt::Debug for MsgKind<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = format!("{:?}", self.0);
        let end = s.find([' ', '{']).unwrap_or(s.len());
        f.write_str(&s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flushed_registration_cannot_reply() {
        let tags = Tags::default();
        let (id, token) = tags.register(3);
        assert_eq!(tags.len(), 1);
        assert!(tags.flush(3));
        assert!(token.is_cancelled());
        assert!(!tags.finish(3, id));
        assert!(!tags.flush(3));
        assert!(tags.is_empty());
    }

    #[test]
    fn newer_request_replaces_duplicate_tag() {
        let tags = Tags::default();
        let (old, old_token) = tags.register(9);
        let (new, new_token) = tags.register(9);
        assert!(old_token.is_cancelled());
        assert!(!new_token.is_cancelled());
        assert!(!tags.finish(9, old));
        assert!(tags.finish(9, new));
        assert!(tags.is_empty());
    }

    #[test]
    fn cancel_all_clears_registry() {
        let tags = Tags::default();
        let tokens: Vec<_> = (0..4).map(|t| tags.register(t).1).collect();
        tags.cancel_all();
        assert!(tags.is_empty());
        assert!(tokens.iter().all(|t| t.is_cancelled()));
    }

    #[test]
    fn message_kind() {
        assert_eq!(format!("{:?}", MsgKind(&FCall::TClunk { fid: 1 })), "TClunk");
        assert_eq!(format!("{:?}", MsgKind(&FCall::RFlush)), "RFlush");
    }
}
