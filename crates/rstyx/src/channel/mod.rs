//! Byte transport with a stack of record layers.
//!
//! A [`Channel`] moves whole messages over a byte stream. Layers pushed onto
//! it transform the bytes between the application and the wire: the first
//! layer pushed sits next to the wire and cuts records out of the stream,
//! the last one pushed is outermost. Until a layer is pushed the raw bytes
//! can be inspected directly, which is how a session decides between
//! authentication and plain protocol traffic.

pub mod secure;

use std::{fmt, mem, sync::Arc, time::Duration};

use bytes::BytesMut;
use futures::sink::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_stream::StreamExt;
use tokio_util::codec::{BytesCodec, Decoder, FramedRead, FramedWrite};

use crate::{
    auth::keyring::KeyringCodec,
    dialect::MessageCodec,
    error::{Error, string::*},
    utils::Result,
};

/// One transform in the channel stack.
pub trait Layer: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Cut the next complete record out of `src`.
    fn split_record(&self, src: &mut BytesMut) -> Result<Option<BytesMut>>;

    /// Turn a record received from the wire side into payload.
    fn inbound(&self, record: BytesMut) -> Result<BytesMut>;

    /// Turn payload from the application side into records.
    fn outbound(&self, payload: BytesMut) -> Result<BytesMut>;
}

/// How complete messages are recognised once layers are removed.
#[derive(Debug)]
pub enum Framing {
    Keyring(KeyringCodec),
    Message(MessageCodec),
}

#[derive(Debug)]
enum Mode {
    Unset,
    /// First `n` bytes, left in the buffer.
    Peek(usize),
    Frame(Framing),
}

/// Decoder behind the reading half: runs records through the layers and
/// frames the result.
#[derive(Debug)]
pub struct Framer {
    mode: Mode,
    layers: Vec<Arc<dyn Layer>>,
    /// Bytes waiting to form a record, one buffer per layer.
    stages: Vec<BytesMut>,
    plain: BytesMut,
}

impl Framer {
    fn new() -> Framer {
        Framer {
            mode: Mode::Unset,
            layers: Vec::new(),
            stages: Vec::new(),
            plain: BytesMut::new(),
        }
    }

    fn unwrap_records(&mut self, src: &mut BytesMut) -> Result<()> {
        let mut carry = src.split();
        for (layer, pending) in self.layers.iter().zip(self.stages.iter_mut()) {
            pending.unsplit(carry);
            carry = BytesMut::new();
            while let Some(record) = layer.split_record(pending)? {
                carry.unsplit(layer.inbound(record)?);
            }
        }
        self.plain.unsplit(carry);
        Ok(())
    }
}

impl Decoder for Framer {
    type Item = BytesMut;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        let buf = if self.layers.is_empty() {
            src
        } else {
            self.unwrap_records(src)?;
            &mut self.plain
        };

        match &mut self.mode {
            Mode::Unset => Err(Error::No(ENOFRAMING)),
            Mode::Peek(n) => {
                if buf.len() >= *n {
                    Ok(Some(BytesMut::from(&buf[..*n])))
                } else {
                    buf.reserve(*n - buf.len());
                    Ok(None)
                }
            }
            Mode::Frame(Framing::Keyring(codec)) => codec.decode(buf),
            Mode::Frame(Framing::Message(codec)) => codec.decode(buf),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        // A short peek still reports what arrived; a partial message is dropped.
        match self.mode {
            Mode::Peek(_) if self.layers.is_empty() && !src.is_empty() => Ok(Some(src.clone())),
            _ => Ok(None),
        }
    }
}

/// Receiving half of a channel.
#[derive(Debug)]
pub struct ChannelReader<R> {
    inner: FramedRead<R, Framer>,
    peeked: Option<BytesMut>,
}

impl<R: AsyncRead + Unpin> ChannelReader<R> {
    fn new(reader: R) -> ChannelReader<R> {
        ChannelReader {
            inner: FramedRead::new(reader, Framer::new()),
            peeked: None,
        }
    }

    pub fn set_framing(&mut self, codec: MessageCodec) {
        self.inner.decoder_mut().mode = Mode::Frame(Framing::Message(codec));
    }

    fn is_layered(&self) -> bool {
        !self.inner.decoder().layers.is_empty()
    }

    async fn frame(&mut self) -> Result<Option<BytesMut>> {
        self.inner.next().await.transpose()
    }

    /// Next message, `None` once the peer has closed the stream.
    pub async fn next(&mut self) -> Result<Option<BytesMut>> {
        if let Some(msg) = self.peeked.take() {
            return Ok(Some(msg));
        }
        self.frame().await
    }

    /// The message `next` will return, without consuming it.
    pub async fn peek(&mut self) -> Result<Option<&BytesMut>> {
        if self.peeked.is_none() {
            self.peeked = self.frame().await?;
        }
        Ok(self.peeked.as_ref())
    }

    /// Up to `n` raw bytes from the stream, left in place.
    pub async fn peek_raw(&mut self, n: usize) -> Result<BytesMut> {
        if self.is_layered() {
            return Err(Error::No(ERAW));
        }
        self.peek_bytes(n).await
    }

    /// Up to `n` bytes as seen above the layers, left in place.
    pub async fn peek_bytes(&mut self, n: usize) -> Result<BytesMut> {
        let prev = mem::replace(&mut self.inner.decoder_mut().mode, Mode::Peek(n));
        let res = self.frame().await;
        self.inner.decoder_mut().mode = prev;
        Ok(res?.unwrap_or_default())
    }

    /// The first `n` bytes if they arrive within `wait`, left in place.
    pub async fn peek_bytes_within(&mut self, n: usize, wait: Duration) -> Result<Option<BytesMut>> {
        let prev = mem::replace(&mut self.inner.decoder_mut().mode, Mode::Peek(n));
        let res = tokio::time::timeout(wait, self.frame()).await;
        self.inner.decoder_mut().mode = prev;
        match res {
            Ok(frame) => Ok(frame?),
            Err(_) => Ok(None),
        }
    }

    /// One raw frame cut with `framing`, header included.
    pub async fn read_frame_raw(&mut self, framing: Framing) -> Result<Option<BytesMut>> {
        if self.is_layered() {
            return Err(Error::No(ERAW));
        }
        let prev = mem::replace(&mut self.inner.decoder_mut().mode, Mode::Frame(framing));
        let res = self.frame().await;
        self.inner.decoder_mut().mode = prev;
        res
    }

    fn push(&mut self, layer: Arc<dyn Layer>) {
        let framer = self.inner.decoder_mut();
        framer.layers.push(layer);
        framer.stages.push(BytesMut::new());
    }

    fn pop(&mut self) {
        let framer = self.inner.decoder_mut();
        framer.layers.pop();
        framer.stages.pop();
        if framer.layers.is_empty() && !framer.plain.is_empty() {
            let mut rest = mem::take(&mut framer.plain);
            let buf = self.inner.read_buffer_mut();
            rest.unsplit(buf.split());
            *buf = rest;
        }
    }
}

/// Sending half of a channel, shared by reply tasks behind a lock.
#[derive(Debug)]
pub struct ChannelWriter<W> {
    inner: FramedWrite<W, BytesCodec>,
    layers: Vec<Arc<dyn Layer>>,
}

impl<W: AsyncWrite + Unpin> ChannelWriter<W> {
    fn new(writer: W) -> ChannelWriter<W> {
        ChannelWriter {
            inner: FramedWrite::new(writer, BytesCodec::new()),
            layers: Vec::new(),
        }
    }

    /// Send one message through every layer, outermost first.
    pub async fn send(&mut self, msg: &[u8]) -> Result<()> {
        let mut data = BytesMut::from(msg);
        for layer in self.layers.iter().rev() {
            data = layer.outbound(data)?;
        }
        self.inner.send(data.freeze()).await?;
        Ok(())
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.layers.is_empty() {
            return Err(Error::No(ERAW));
        }
        self.inner.send(BytesMut::from(bytes).freeze()).await?;
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        SinkExt::<bytes::Bytes>::close(&mut self.inner).await?;
        Ok(())
    }
}

/// Both halves of a connection plus the shared layer stack.
#[derive(Debug)]
pub struct Channel<R, W> {
    reader: ChannelReader<R>,
    writer: ChannelWriter<W>,
}

impl<S: AsyncRead + AsyncWrite> Channel<ReadHalf<S>, WriteHalf<S>> {
    pub fn from_stream(stream: S) -> Self {
        let (readhalf, writehalf) = tokio::io::split(stream);
        Channel::new(readhalf, writehalf)
    }
}

impl<R, W> Channel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Channel {
            reader: ChannelReader::new(reader),
            writer: ChannelWriter::new(writer),
        }
    }

    /// Make `layer` the outermost transform in both directions.
    pub fn push(&mut self, layer: Arc<dyn Layer>) {
        log::debug!("channel: push {}", layer.name());
        self.reader.push(layer.clone());
        self.writer.layers.push(layer);
    }

    /// Remove the outermost layer.
    pub fn pop(&mut self) -> Option<Arc<dyn Layer>> {
        let layer = self.writer.layers.pop()?;
        self.reader.pop();
        log::debug!("channel: pop {}", layer.name());
        Some(layer)
    }

    pub fn layers(&self) -> impl Iterator<Item = &str> {
        self.writer.layers.iter().map(|l| l.name())
    }

    pub fn set_framing(&mut self, codec: MessageCodec) {
        self.reader.set_framing(codec);
    }

    pub async fn next(&mut self) -> Result<Option<BytesMut>> {
        self.reader.next().await
    }

    pub async fn peek(&mut self) -> Result<Option<&BytesMut>> {
        self.reader.peek().await
    }

    pub async fn send(&mut self, msg: &[u8]) -> Result<()> {
        self.writer.send(msg).await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.writer.close().await
    }

    pub async fn peek_raw(&mut self, n: usize) -> Result<BytesMut> {
        self.reader.peek_raw(n).await
    }

    pub async fn peek_bytes(&mut self, n: usize) -> Result<BytesMut> {
        self.reader.peek_bytes(n).await
    }

    pub async fn peek_bytes_within(&mut self, n: usize, wait: Duration) -> Result<Option<BytesMut>> {
        self.reader.peek_bytes_within(n, wait).await
    }

    pub async fn read_frame_raw(&mut self, framing: Framing) -> Result<Option<BytesMut>> {
        self.reader.read_frame_raw(framing).await
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_raw(bytes).await
    }

    /// Hand the halves to the receive loop and the reply tasks.
    pub fn split(self) -> (ChannelReader<R>, ChannelWriter<W>) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::keyring;

    /// One-byte length header, payload xored with a constant.
    #[derive(Debug)]
    struct Xor(u8);

    impl Layer for Xor {
        fn name(&self) -> &str {
            "xor"
        }

        fn split_record(&self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
            match src.first() {
                Some(&n) if src.len() > n as usize => {
                    let mut rec = src.split_to(n as usize + 1);
                    let _ = rec.split_to(1);
                    Ok(Some(rec))
                }
                _ => Ok(None),
            }
        }

        fn inbound(&self, record: BytesMut) -> Result<BytesMut> {
            Ok(record.iter().map(|b| b ^ self.0).collect::<Vec<_>>()[..].into())
        }

        fn outbound(&self, payload: BytesMut) -> Result<BytesMut> {
            let mut out = BytesMut::from(&[payload.len() as u8][..]);
            out.extend(payload.iter().map(|b| b ^ self.0));
            Ok(out)
        }
    }

    fn pair() -> (
        Channel<ReadHalf<tokio::io::DuplexStream>, WriteHalf<tokio::io::DuplexStream>>,
        Channel<ReadHalf<tokio::io::DuplexStream>, WriteHalf<tokio::io::DuplexStream>>,
    ) {
        let (a, b) = tokio::io::duplex(4096);
        let mut a = Channel::from_stream(a);
        let mut b = Channel::from_stream(b);
        a.set_framing(MessageCodec::length_prefixed());
        b.set_framing(MessageCodec::length_prefixed());
        (a, b)
    }

    const MSG: [u8; 7] = [7, 0, 0, 0, 108, 1, 0];

    #[tokio::test]
    async fn raw_peek_leaves_bytes() {
        let (mut a, mut b) = pair();
        a.write_raw(&MSG).await.unwrap();
        assert_eq!(&b.peek_raw(5).await.unwrap()[..], &MSG[..5]);
        assert_eq!(&b.peek_raw(5).await.unwrap()[..], &MSG[..5]);
        assert_eq!(&b.peek().await.unwrap().unwrap()[..], &MSG[..]);
        assert_eq!(&b.next().await.unwrap().unwrap()[..], &MSG[..]);
    }

    #[tokio::test]
    async fn keyring_frames_then_messages() {
        let (mut a, mut b) = pair();
        a.write_raw(&keyring::encode_data(b"OK").unwrap()).await.unwrap();
        a.write_raw(&MSG).await.unwrap();
        let frame = b
            .read_frame_raw(Framing::Keyring(KeyringCodec))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(keyring::parse(&frame).unwrap(), b"OK");
        assert_eq!(&b.next().await.unwrap().unwrap()[..], &MSG[..]);
    }

    #[tokio::test]
    async fn layers_apply_in_both_directions() {
        let (mut a, mut b) = pair();
        a.push(Arc::new(Xor(0x5a)));
        b.push(Arc::new(Xor(0x5a)));
        a.push(Arc::new(Xor(0x0f)));
        b.push(Arc::new(Xor(0x0f)));
        assert_eq!(a.layers().collect::<Vec<_>>(), vec!["xor", "xor"]);

        a.send(&MSG).await.unwrap();
        a.send(&MSG).await.unwrap();
        assert_eq!(&b.next().await.unwrap().unwrap()[..], &MSG[..]);
        assert_eq!(&b.peek().await.unwrap().unwrap()[..], &MSG[..]);
        assert_eq!(&b.next().await.unwrap().unwrap()[..], &MSG[..]);

        assert!(b.peek_raw(1).await.is_err());
        assert!(a.write_raw(&MSG).await.is_err());

        assert!(a.pop().is_some());
        assert!(a.pop().is_some());
        assert!(a.pop().is_none());
        a.write_raw(&MSG).await.unwrap();
        assert!(b.pop().is_some());
        b.pop();
        assert_eq!(&b.next().await.unwrap().unwrap()[..], &MSG[..]);
    }

    #[tokio::test]
    async fn eof_ends_the_stream() {
        let (a, mut b) = pair();
        drop(a);
        assert!(b.next().await.unwrap().is_none());
        assert!(b.peek_raw(5).await.unwrap().is_empty());
    }
}
