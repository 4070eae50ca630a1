//! Message kinds of the broker protocol and their frame layouts.

use std::fmt;

use tokio_util::bytes::Bytes;

use crate::error::{ProtocolError, ProtocolResult};
use crate::{ACK, CLIENT, EZ_ERR, HEARTBEAT, REPLY, WORKER};

/// An ordered multipart message: one opaque byte string per frame.
pub type Frames = Vec<Bytes>;

/// Correlation id pairing a request with its ACK and REPLY.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(Bytes);

impl RequestId {
    /// Width in bytes of generated ids.
    pub const WIDTH: usize = 4;

    /// Wraps raw id bytes received from the wire.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Wraps a static byte string.
    pub const fn from_static(bytes: &'static [u8]) -> Self {
        Self(Bytes::from_static(bytes))
    }

    /// Draws a random [`RequestId::WIDTH`]-byte id.
    ///
    /// Uniqueness among in-flight requests is the caller's job; the random
    /// source only makes collisions unlikely.
    pub fn random() -> Self {
        let raw: [u8; Self::WIDTH] = rand::random();
        Self(Bytes::copy_from_slice(&raw))
    }

    /// Returns the raw id bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the id as a frame.
    pub fn to_frame(&self) -> Bytes {
        self.0.clone()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Name of the service a request is routed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceName(Bytes);

impl ServiceName {
    /// Wraps raw service name bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Returns the raw name bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the name as a frame.
    pub fn to_frame(&self) -> Bytes {
        self.0.clone()
    }
}

impl From<&str> for ServiceName {
    fn from(name: &str) -> Self {
        Self(Bytes::copy_from_slice(name.as_bytes()))
    }
}

impl From<String> for ServiceName {
    fn from(name: String) -> Self {
        Self(Bytes::from(name))
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// Address of one connection endpoint, fixed for the connection's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(Bytes);

impl Identity {
    /// Wraps raw identity bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Wraps a static byte string.
    pub const fn from_static(bytes: &'static [u8]) -> Self {
        Self(Bytes::from_static(bytes))
    }

    /// Generates a process-unique identity of the form `<prefix>-<uuid>`.
    pub fn random(prefix: &str) -> Self {
        let id = format!("{}-{}", prefix, uuid::Uuid::new_v4().simple());
        Self(Bytes::from(id))
    }

    /// Identity for a client connection.
    pub fn client() -> Self {
        Self::random("client")
    }

    /// Identity for a worker, namespaced by the service it serves.
    pub fn worker(service: &ServiceName) -> Self {
        Self::random(&service.to_string())
    }

    /// Returns the raw identity bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the identity as a frame.
    pub fn to_frame(&self) -> Bytes {
        self.0.clone()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// Heartbeat announcing that a worker serves `service`.
pub fn encode_heartbeat(service: &ServiceName) -> Frames {
    vec![
        Bytes::new(),
        Bytes::from_static(&[WORKER]),
        Bytes::from_static(&[HEARTBEAT]),
        service.to_frame(),
    ]
}

/// Acknowledgment that a worker accepted `request_id`.
pub fn encode_ack(request_id: &RequestId) -> Frames {
    vec![
        Bytes::new(),
        Bytes::from_static(&[WORKER]),
        Bytes::from_static(&[ACK]),
        request_id.to_frame(),
    ]
}

/// Result of `request_id`, followed by zero or more body frames.
pub fn encode_reply(request_id: &RequestId, body: Frames) -> Frames {
    let mut frames = Vec::with_capacity(4 + body.len());
    frames.push(Bytes::new());
    frames.push(Bytes::from_static(&[WORKER]));
    frames.push(Bytes::from_static(&[REPLY]));
    frames.push(request_id.to_frame());
    frames.extend(body);
    frames
}

/// Client request envelope for `service`, followed by the body frames.
pub fn encode_request(request_id: &RequestId, service: &ServiceName, body: Frames) -> Frames {
    let mut frames = Vec::with_capacity(4 + body.len());
    frames.push(Bytes::new());
    frames.push(Bytes::from_static(&[CLIENT]));
    frames.push(request_id.to_frame());
    frames.push(service.to_frame());
    frames.extend(body);
    frames
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Worker liveness announcement.
    Heartbeat { service: ServiceName },
    /// Worker accepted a request.
    Ack { request_id: RequestId },
    /// Worker finished a request.
    Reply { request_id: RequestId, body: Frames },
    /// Client request for a service.
    Request {
        request_id: RequestId,
        service: ServiceName,
        body: Frames,
    },
}

impl Message {
    /// Encodes the message into its frame layout.
    pub fn encode(self) -> Frames {
        match self {
            Self::Heartbeat { service } => encode_heartbeat(&service),
            Self::Ack { request_id } => encode_ack(&request_id),
            Self::Reply { request_id, body } => encode_reply(&request_id, body),
            Self::Request {
                request_id,
                service,
                body,
            } => encode_request(&request_id, &service, body),
        }
    }

    /// Decodes a frame sequence, stripping the delimiter and tag bytes.
    pub fn decode(frames: Frames) -> ProtocolResult<Self> {
        let mut frames = frames.into_iter();

        let delimiter = frames.next().ok_or(ProtocolError::EmptyMessage)?;
        if !delimiter.is_empty() {
            return Err(ProtocolError::malformed("first frame is not an empty delimiter"));
        }

        match tag_byte(frames.next(), "message")? {
            WORKER => match tag_byte(frames.next(), "worker")? {
                HEARTBEAT => {
                    let service = ServiceName::new(required(frames.next(), "service name")?);
                    expect_end(frames, "heartbeat")?;
                    Ok(Self::Heartbeat { service })
                }
                ACK => {
                    let request_id = RequestId::new(required(frames.next(), "request id")?);
                    expect_end(frames, "ack")?;
                    Ok(Self::Ack { request_id })
                }
                REPLY => {
                    let request_id = RequestId::new(required(frames.next(), "request id")?);
                    Ok(Self::Reply {
                        request_id,
                        body: frames.collect(),
                    })
                }
                tag => Err(ProtocolError::UnknownTag {
                    position: "worker",
                    tag,
                }),
            },
            CLIENT => {
                let request_id = RequestId::new(required(frames.next(), "request id")?);
                let service = ServiceName::new(required(frames.next(), "service name")?);
                Ok(Self::Request {
                    request_id,
                    service,
                    body: frames.collect(),
                })
            }
            tag => Err(ProtocolError::UnknownTag {
                position: "message",
                tag,
            }),
        }
    }

    /// Correlation id carried by the message, if any.
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Self::Heartbeat { .. } => None,
            Self::Ack { request_id }
            | Self::Reply { request_id, .. }
            | Self::Request { request_id, .. } => Some(request_id),
        }
    }

    /// Short name of the message kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Heartbeat { .. } => "heartbeat",
            Self::Ack { .. } => "ack",
            Self::Reply { .. } => "reply",
            Self::Request { .. } => "request",
        }
    }
}

fn tag_byte(frame: Option<Bytes>, position: &'static str) -> ProtocolResult<u8> {
    let frame = frame.ok_or_else(|| ProtocolError::malformed(format!("missing {} tag", position)))?;
    match &frame[..] {
        [tag] => Ok(*tag),
        _ => Err(ProtocolError::malformed(format!(
            "{} tag must be one byte, got {}",
            position,
            frame.len()
        ))),
    }
}

fn required(frame: Option<Bytes>, what: &str) -> ProtocolResult<Bytes> {
    match frame {
        Some(frame) if !frame.is_empty() => Ok(frame),
        Some(_) => Err(ProtocolError::malformed(format!("empty {}", what))),
        None => Err(ProtocolError::malformed(format!("missing {}", what))),
    }
}

fn expect_end(mut frames: impl Iterator<Item = Bytes>, kind: &str) -> ProtocolResult<()> {
    match frames.next() {
        None => Ok(()),
        Some(_) => Err(ProtocolError::malformed(format!(
            "trailing frames after {}",
            kind
        ))),
    }
}

/// Typed view of a reply body starting with `EZ_ERR`.
///
/// Error replies are ordinary reply bodies, so callers check results instead
/// of catching errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorReply {
    /// The client gave up waiting (`EZ_ERR TIMEOUT`).
    Timeout,
    /// The broker had no live worker for the service (`EZ_ERR NO_WORKERS`).
    NoWorkers,
    /// Every live worker for the service had a full send queue
    /// (`EZ_ERR BUSY`).
    Busy,
    /// The worker's handler failed (`EZ_ERR HANDLER_ERROR <message>`).
    HandlerError { message: String },
    /// Any other error code.
    Other { code: String },
}

impl ErrorReply {
    const TIMEOUT: &'static [u8] = b"TIMEOUT";
    const NO_WORKERS: &'static [u8] = b"NO_WORKERS";
    const BUSY: &'static [u8] = b"BUSY";
    const HANDLER_ERROR: &'static [u8] = b"HANDLER_ERROR";

    /// Builds the reply body frames.
    pub fn to_frames(&self) -> Frames {
        let marker = Bytes::from_static(EZ_ERR);
        match self {
            Self::Timeout => vec![marker, Bytes::from_static(Self::TIMEOUT)],
            Self::NoWorkers => vec![marker, Bytes::from_static(Self::NO_WORKERS)],
            Self::Busy => vec![marker, Bytes::from_static(Self::BUSY)],
            Self::HandlerError { message } => vec![
                marker,
                Bytes::from_static(Self::HANDLER_ERROR),
                Bytes::from(message.clone()),
            ],
            Self::Other { code } => vec![marker, Bytes::from(code.clone())],
        }
    }

    /// Parses a reply body; `None` if it is not an error reply.
    pub fn from_frames(frames: &[Bytes]) -> Option<Self> {
        let (marker, rest) = frames.split_first()?;
        if &marker[..] != EZ_ERR {
            return None;
        }

        let code: &[u8] = rest.first().map(|code| &code[..]).unwrap_or_default();
        let parsed = match code {
            Self::TIMEOUT => Self::Timeout,
            Self::NO_WORKERS => Self::NoWorkers,
            Self::BUSY => Self::Busy,
            Self::HANDLER_ERROR => Self::HandlerError {
                message: rest
                    .get(1)
                    .map(|message| String::from_utf8_lossy(message).into_owned())
                    .unwrap_or_default(),
            },
            other => Self::Other {
                code: String::from_utf8_lossy(other).into_owned(),
            },
        };
        Some(parsed)
    }
}

impl fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "request timed out"),
            Self::NoWorkers => write!(f, "no worker available for service"),
            Self::Busy => write!(f, "all workers for service are busy"),
            Self::HandlerError { message } => write!(f, "handler failed: {}", message),
            Self::Other { code } => write!(f, "error reply: {}", code),
        }
    }
}
