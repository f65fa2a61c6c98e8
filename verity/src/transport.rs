//! Opaque byte transports.
//!
//! The scheduler does not care what carries its frames; a connection is a
//! pair of byte channels. `ByteLink::pair()` builds the in-process duplex
//! used by tests and embedders; anything that shovels `Bytes` both ways
//! (a TCP pump, a relay) can produce the same shape.

use bytes::Bytes;
use flume::{Receiver, Sender};

/// One endpoint of a duplex byte connection.
#[derive(Debug)]
pub struct ByteLink {
    pub tx: Sender<Bytes>,
    pub rx: Receiver<Bytes>,
}

impl ByteLink {
    /// Build two connected endpoints.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = flume::unbounded();
        let (b_tx, a_rx) = flume::unbounded();
        (Self { tx: a_tx, rx: a_rx }, Self { tx: b_tx, rx: b_rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_is_crossed() {
        let (a, b) = ByteLink::pair();

        a.tx.send(Bytes::from_static(b"ping")).unwrap();
        assert_eq!(b.rx.try_recv().unwrap().as_ref(), b"ping");

        b.tx.send(Bytes::from_static(b"pong")).unwrap();
        assert_eq!(a.rx.try_recv().unwrap().as_ref(), b"pong");
    }

    #[test]
    fn drop_closes_the_other_end() {
        let (a, b) = ByteLink::pair();
        drop(b);
        assert!(a.tx.send(Bytes::from_static(b"x")).is_err());
        assert!(a.rx.try_recv().is_err());
    }
}
