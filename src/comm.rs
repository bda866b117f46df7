//! Fixed-frame message exchange with the macro daemon.
//!
//! Both daemons live on one host, so frames are native byte order: one
//! `done` byte, alignment padding, then the raw `input_event` fields.

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::{info, warn};
use thiserror::Error;

use crate::oskbd::KeyEvent;

/// One frame: done(1) + pad(7) + sec(8) + usec(8) + type(2) + code(2) + value(4).
pub const MSG_SIZE: usize = 32;

const RECONNECT_ATTEMPTS: u32 = 8;
const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(100);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("macro daemon hung up")]
    PeerGone,
    #[error("timed out waiting for the macro daemon")]
    Timeout,
    #[error("socket i/o failed: {0}")]
    Io(#[from] io::Error),
}

/// The framing unit. `done` terminates one request's reply stream; the
/// event is meaningless on the terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionMessage {
    pub done: bool,
    pub event: KeyEvent,
}

impl ActionMessage {
    pub fn encode(&self) -> [u8; MSG_SIZE] {
        let mut buf = [0u8; MSG_SIZE];
        buf[0] = self.done as u8;
        buf[8..16].copy_from_slice(&self.event.time_sec.to_ne_bytes());
        buf[16..24].copy_from_slice(&self.event.time_usec.to_ne_bytes());
        buf[24..26].copy_from_slice(&self.event.kind.to_ne_bytes());
        buf[26..28].copy_from_slice(&self.event.code.to_ne_bytes());
        buf[28..32].copy_from_slice(&self.event.value.to_ne_bytes());
        buf
    }

    pub fn decode(buf: &[u8; MSG_SIZE]) -> Self {
        Self {
            done: buf[0] != 0,
            event: KeyEvent {
                time_sec: i64::from_ne_bytes(buf[8..16].try_into().unwrap()),
                time_usec: i64::from_ne_bytes(buf[16..24].try_into().unwrap()),
                kind: u16::from_ne_bytes(buf[24..26].try_into().unwrap()),
                code: u16::from_ne_bytes(buf[26..28].try_into().unwrap()),
                value: i32::from_ne_bytes(buf[28..32].try_into().unwrap()),
            },
        }
    }
}

/// Stream connection to the macro daemon socket.
pub struct PeerChannel {
    path: PathBuf,
    stream: UnixStream,
}

impl PeerChannel {
    pub fn connect(path: &Path) -> Result<Self, SocketError> {
        let stream = connect_with_backoff(path)?;
        Ok(Self {
            path: path.to_owned(),
            stream,
        })
    }

    #[cfg(test)]
    fn from_stream(stream: UnixStream) -> Self {
        Self {
            path: PathBuf::new(),
            stream,
        }
    }

    pub fn send(&mut self, msg: &ActionMessage) -> Result<(), SocketError> {
        self.stream.write_all(&msg.encode()).map_err(map_io)
    }

    pub fn recv(&mut self, timeout: Duration) -> Result<ActionMessage, SocketError> {
        self.stream.set_read_timeout(Some(timeout))?;
        let mut buf = [0u8; MSG_SIZE];
        match self.stream.read_exact(&mut buf) {
            Ok(()) => Ok(ActionMessage::decode(&buf)),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Err(SocketError::Timeout)
            }
            Err(e) => Err(map_io(e)),
        }
    }

    /// Runs one full request cycle: send the event, then collect replies
    /// until the terminator. An empty reply list means the macro daemon
    /// consumed the event on purpose and nothing should be emitted for it.
    pub fn exchange(
        &mut self,
        event: KeyEvent,
        timeout: Duration,
    ) -> Result<Vec<KeyEvent>, SocketError> {
        self.send(&ActionMessage { done: false, event })?;
        let mut replies = Vec::new();
        loop {
            let msg = self.recv(timeout)?;
            if msg.done {
                break;
            }
            replies.push(msg.event);
        }
        Ok(replies)
    }

    /// Drops the broken stream and dials the socket again with exponential
    /// backoff. Blocks the caller; gives up after a bounded number of
    /// attempts.
    pub fn reconnect(&mut self) -> Result<(), SocketError> {
        let _ = self.stream.shutdown(Shutdown::Both);
        self.stream = connect_with_backoff(&self.path)?;
        Ok(())
    }
}

fn map_io(e: io::Error) -> SocketError {
    match e.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof => SocketError::PeerGone,
        _ => SocketError::Io(e),
    }
}

fn connect_with_backoff(path: &Path) -> Result<UnixStream, SocketError> {
    let mut delay = RECONNECT_BASE_DELAY;
    for attempt in 1..=RECONNECT_ATTEMPTS {
        match UnixStream::connect(path) {
            Ok(stream) => {
                if attempt > 1 {
                    info!("connected to the macro daemon after {attempt} attempts");
                }
                return Ok(stream);
            }
            Err(e) => warn!(
                "connecting to {} failed (attempt {attempt}/{RECONNECT_ATTEMPTS}): {e}",
                path.display()
            ),
        }
        thread::sleep(delay);
        delay = (delay * 2).min(RECONNECT_MAX_DELAY);
    }
    Err(SocketError::PeerGone)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: u16, value: i32) -> KeyEvent {
        KeyEvent::key(code, value)
    }

    const REPLY_TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn frame_layout_matches_the_wire_contract() {
        let msg = ActionMessage {
            done: true,
            event: KeyEvent {
                time_sec: 0x0102030405060708,
                time_usec: -1,
                kind: 1,
                code: 30,
                value: 2,
            },
        };
        let buf = msg.encode();
        assert_eq!(buf.len(), MSG_SIZE);
        assert_eq!(buf[0], 1);
        assert_eq!(&buf[1..8], &[0u8; 7]);
        assert_eq!(&buf[8..16], &0x0102030405060708i64.to_ne_bytes());
        assert_eq!(&buf[16..24], &(-1i64).to_ne_bytes());
        assert_eq!(&buf[24..26], &1u16.to_ne_bytes());
        assert_eq!(&buf[26..28], &30u16.to_ne_bytes());
        assert_eq!(&buf[28..32], &2i32.to_ne_bytes());
    }

    #[test]
    fn decode_inverts_encode() {
        let msg = ActionMessage {
            done: false,
            event: KeyEvent {
                time_sec: 1234,
                time_usec: 567890,
                kind: 1,
                code: 57,
                value: 1,
            },
        };
        assert_eq!(ActionMessage::decode(&msg.encode()), msg);
    }

    #[test]
    fn exchange_returns_replies_in_order() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let mut chan = PeerChannel::from_stream(ours);

        let peer = thread::spawn(move || {
            let mut theirs = theirs;
            let mut buf = [0u8; MSG_SIZE];
            theirs.read_exact(&mut buf).unwrap();
            let request = ActionMessage::decode(&buf);
            assert!(!request.done);
            assert_eq!(request.event.code, 30);

            for event in [key(57, 1), KeyEvent::syn_report()] {
                theirs
                    .write_all(&ActionMessage { done: false, event }.encode())
                    .unwrap();
            }
            theirs
                .write_all(
                    &ActionMessage {
                        done: true,
                        event: key(0, 0),
                    }
                    .encode(),
                )
                .unwrap();
        });

        let replies = chan.exchange(key(30, 1), REPLY_TIMEOUT).unwrap();
        assert_eq!(replies, vec![key(57, 1), KeyEvent::syn_report()]);
        peer.join().unwrap();
    }

    #[test]
    fn an_immediate_terminator_means_the_event_was_swallowed() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let mut chan = PeerChannel::from_stream(ours);

        let peer = thread::spawn(move || {
            let mut theirs = theirs;
            let mut buf = [0u8; MSG_SIZE];
            theirs.read_exact(&mut buf).unwrap();
            theirs
                .write_all(
                    &ActionMessage {
                        done: true,
                        event: key(0, 0),
                    }
                    .encode(),
                )
                .unwrap();
        });

        let replies = chan.exchange(key(30, 1), REPLY_TIMEOUT).unwrap();
        assert!(replies.is_empty());
        peer.join().unwrap();
    }

    #[test]
    fn recv_times_out_without_data() {
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let mut chan = PeerChannel::from_stream(ours);
        match chan.recv(Duration::from_millis(50)) {
            Err(SocketError::Timeout) => {}
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[test]
    fn recv_reports_a_hung_up_peer() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        drop(theirs);
        let mut chan = PeerChannel::from_stream(ours);
        match chan.recv(REPLY_TIMEOUT) {
            Err(SocketError::PeerGone) => {}
            other => panic!("expected PeerGone, got {other:?}"),
        }
    }

    #[test]
    fn exchange_surfaces_a_mid_reply_hangup() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let mut chan = PeerChannel::from_stream(ours);

        let peer = thread::spawn(move || {
            let mut theirs = theirs;
            let mut buf = [0u8; MSG_SIZE];
            theirs.read_exact(&mut buf).unwrap();
            theirs
                .write_all(
                    &ActionMessage {
                        done: false,
                        event: key(57, 1),
                    }
                    .encode(),
                )
                .unwrap();
            // Hang up without ever sending the terminator.
        });

        match chan.exchange(key(30, 1), REPLY_TIMEOUT) {
            Err(SocketError::PeerGone) => {}
            other => panic!("expected PeerGone, got {other:?}"),
        }
        peer.join().unwrap();
    }
}
