//! Frame transport between host and guest
//!
//! A [`Link`] is one end of a duplex pipe carrying frame bodies. The bridge
//! only needs fire-and-forget [`send`](LinkSender::send) and an inbound
//! [`recv`](LinkReceiver::recv); how the bytes move is up to the transport.
//! [`Link::pair`] connects two ends in memory, [`unix`] pumps a Unix domain
//! socket into a link.

#[cfg(unix)]
pub mod unix;

use smol::channel::{self, Receiver, Sender};
use thiserror::Error;

use crate::config::DEFAULT_MAX_FRAME_LEN;
use crate::protocol::{Frame, ProtocolError};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("link closed")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// One end of a duplex frame pipe
#[derive(Debug)]
pub struct Link {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    peer: Option<String>,
    max_frame_len: usize,
}

impl Link {
    /// Two connected in-memory ends
    pub fn pair() -> (Link, Link) {
        let (a_tx, b_rx) = channel::unbounded();
        let (b_tx, a_rx) = channel::unbounded();
        (
            Link::from_channels(a_tx, a_rx),
            Link::from_channels(b_tx, b_rx),
        )
    }

    /// Wrap a pair of channels carrying encoded frame bodies
    pub fn from_channels(tx: Sender<Vec<u8>>, rx: Receiver<Vec<u8>>) -> Self {
        Self {
            tx,
            rx,
            peer: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Label the remote end, e.g. with a socket path; shown in logs and call contexts
    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = Some(peer.into());
        self
    }

    /// Largest frame body this end will send; larger frames fail locally
    pub fn with_max_frame_len(mut self, bytes: usize) -> Self {
        self.max_frame_len = bytes;
        self
    }

    /// Label of the remote end, if any
    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    /// Separate the sending and receiving halves
    pub fn split(self) -> (LinkSender, LinkReceiver) {
        (
            LinkSender {
                tx: self.tx,
                max_frame_len: self.max_frame_len,
            },
            LinkReceiver {
                rx: self.rx,
                peer: self.peer,
            },
        )
    }
}

/// Sending half of a [`Link`]; cheap to clone
#[derive(Debug, Clone)]
pub struct LinkSender {
    tx: Sender<Vec<u8>>,
    max_frame_len: usize,
}

impl LinkSender {
    /// Encode and queue a frame without waiting for delivery
    ///
    /// A frame over the size limit is refused here, before it reaches the
    /// peer; the link stays usable.
    pub fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        let body = frame.encode()?;
        if body.len() > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                len: body.len(),
                max: self.max_frame_len,
            }
            .into());
        }
        self.tx.try_send(body).map_err(|_| TransportError::Closed)
    }

    /// Close the link for writing; the remote receiver sees end of stream
    pub fn close(&self) {
        self.tx.close();
    }

    /// Whether the remote end is gone or the link was closed
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of a [`Link`]
#[derive(Debug)]
pub struct LinkReceiver {
    rx: Receiver<Vec<u8>>,
    peer: Option<String>,
}

impl LinkReceiver {
    /// Next frame body, or `None` once the remote end is gone
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.rx.recv().await.ok()
    }

    /// Label of the remote end, if any
    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Reply;
    use crate::marshal::Value;

    #[test]
    fn pair_delivers_in_order() {
        smol::block_on(async {
            let (a, b) = Link::pair();
            let (a_tx, _a_rx) = a.split();
            let (_b_tx, b_rx) = b.split();

            a_tx.send(&Frame::Reply(Reply::success(1, Value::Int(1)))).unwrap();
            a_tx.send(&Frame::Reply(Reply::success(2, Value::Int(2)))).unwrap();

            let first = Frame::decode(&b_rx.recv().await.unwrap()).unwrap();
            let second = Frame::decode(&b_rx.recv().await.unwrap()).unwrap();
            assert_eq!(first, Frame::Reply(Reply::success(1, Value::Int(1))));
            assert_eq!(second, Frame::Reply(Reply::success(2, Value::Int(2))));
        });
    }

    #[test]
    fn closing_one_end_ends_the_other() {
        smol::block_on(async {
            let (a, b) = Link::pair();
            let (_b_tx, b_rx) = b.split();
            drop(a);
            assert!(b_rx.recv().await.is_none());
        });
    }

    #[test]
    fn send_after_close_fails() {
        let (a, b) = Link::pair();
        let (a_tx, _a_rx) = a.split();
        drop(b);
        let err = a_tx
            .send(&Frame::Reply(Reply::success(1, Value::Unit)))
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[test]
    fn oversized_frame_is_refused_locally() {
        let (a, b) = Link::pair();
        let (a_tx, _a_rx) = a.with_max_frame_len(64).split();
        let (_b_tx, b_rx) = b.split();

        let big = Frame::Reply(Reply::success(1, Value::Str("x".repeat(100))));
        let err = a_tx.send(&big).unwrap_err();
        assert!(matches!(
            err,
            TransportError::Protocol(ProtocolError::FrameTooLarge { max: 64, .. })
        ));

        a_tx.send(&Frame::Reply(Reply::success(2, Value::Unit))).unwrap();
        let next = smol::block_on(b_rx.recv()).unwrap();
        assert_eq!(
            Frame::decode(&next).unwrap(),
            Frame::Reply(Reply::success(2, Value::Unit))
        );
    }
}
