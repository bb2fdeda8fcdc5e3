//! Byte-transparent codec for proxied streams
//!
//! The relay never knows the schemas of the messages it forwards, so its codec
//! treats every message as an opaque byte frame: encoding writes the bytes
//! back out verbatim and decoding captures them verbatim. For streams the
//! surrounding process owns itself (locally implemented services, control
//! messages) the codec delegates to a conventional parent codec instead, so a
//! single server instance can serve some methods natively and proxy the rest.
//!
//! The wire protocol is unchanged either way: frames ride the standard gRPC
//! message framing under the standard `application/grpc` content type.

use bytes::{Buf, BufMut, Bytes};
use tonic::Status;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder, ProstCodec};

/// One opaque message transiting the relay.
///
/// A frame round-trips byte-exactly: encoding a frame emits exactly the bytes
/// that were decoded into it, and re-decoding fully replaces prior contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    payload: Bytes,
}

impl Frame {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_bytes(self) -> Bytes {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Install `src` as the frame's contents, discarding anything held before.
    fn replace(&mut self, src: &mut impl Buf) {
        self.payload = src.copy_to_bytes(src.remaining());
    }

    fn encode_into(&self, dst: &mut impl BufMut) {
        dst.put(self.payload.clone());
    }
}

impl From<Bytes> for Frame {
    fn from(payload: Bytes) -> Self {
        Self { payload }
    }
}

impl From<Vec<u8>> for Frame {
    fn from(payload: Vec<u8>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

/// A value moved through the relay codec: an opaque [`Frame`], or a typed
/// message owned by the surrounding framework and handled by the parent codec.
#[derive(Debug, Clone)]
pub enum Payload<M> {
    Frame(Frame),
    Message(M),
}

impl<M> Payload<M> {
    /// Build an opaque frame payload from raw bytes.
    pub fn frame(bytes: impl Into<Bytes>) -> Self {
        Payload::Frame(Frame::new(bytes))
    }

    pub fn as_frame(&self) -> Option<&Frame> {
        match self {
            Payload::Frame(frame) => Some(frame),
            Payload::Message(_) => None,
        }
    }

    pub fn into_frame(self) -> Option<Frame> {
        match self {
            Payload::Frame(frame) => Some(frame),
            Payload::Message(_) => None,
        }
    }
}

/// Proxying codec with a conventional parent codec as fallback.
///
/// Frames are encoded verbatim; `Payload::Message` values go through the
/// parent. The decode direction cannot inspect the destination type the way
/// the encode direction inspects the value, so it is fixed per instance:
/// an *opaque* codec (the proxied-stream case) decodes every message into a
/// frame, a *delegating* codec decodes through the parent.
#[derive(Debug, Clone)]
pub struct RawCodec<C = ProstCodec<Bytes, Bytes>> {
    parent: C,
    opaque: bool,
}

impl<C: Codec> RawCodec<C> {
    /// Opaque codec with a user-provided parent for the encode-side fallback.
    pub fn with_parent(parent: C) -> Self {
        Self {
            parent,
            opaque: true,
        }
    }

    /// Codec that decodes through the parent; only encoded frames bypass it.
    pub fn delegating(parent: C) -> Self {
        Self {
            parent,
            opaque: false,
        }
    }
}

impl<C: Default> Default for RawCodec<C> {
    fn default() -> Self {
        Self {
            parent: C::default(),
            opaque: true,
        }
    }
}

/// Codec instantiation used on every proxied stream.
pub type ProxyCodec = RawCodec<ProstCodec<Bytes, Bytes>>;

/// Item type moved by the forwarding pumps.
pub type ProxyPayload = Payload<Bytes>;

impl<C> Codec for RawCodec<C>
where
    C: Codec,
{
    type Encode = Payload<C::Encode>;
    type Decode = Payload<C::Decode>;
    type Encoder = RawEncoder<C::Encoder>;
    type Decoder = RawDecoder<C::Decoder>;

    fn encoder(&mut self) -> Self::Encoder {
        RawEncoder {
            parent: self.parent.encoder(),
        }
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawDecoder {
            parent: self.parent.decoder(),
            opaque: self.opaque,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RawEncoder<E> {
    parent: E,
}

impl<E> Encoder for RawEncoder<E>
where
    E: Encoder<Error = Status>,
{
    type Item = Payload<E::Item>;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        match item {
            Payload::Frame(frame) => {
                frame.encode_into(dst);
                Ok(())
            }
            Payload::Message(msg) => self.parent.encode(msg, dst),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RawDecoder<D> {
    parent: D,
    opaque: bool,
}

impl<D> Decoder for RawDecoder<D>
where
    D: Decoder<Error = Status>,
{
    type Item = Payload<D::Item>;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        if self.opaque {
            let mut frame = Frame::default();
            frame.replace(src);
            return Ok(Some(Payload::Frame(frame)));
        }
        Ok(self.parent.decode(src)?.map(Payload::Message))
    }
}
