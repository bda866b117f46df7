//! Readiness multiplexing over the grabbed keyboards.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

pub struct Multiplexer {
    poll: Poll,
    events: Events,
    next: usize,
}

impl Multiplexer {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(32),
            next: 0,
        })
    }

    /// Blocks until one of `fds` is readable or the timeout elapses, and
    /// returns the index of a ready descriptor. Ready descriptors are picked
    /// round-robin so a chattering keyboard cannot starve the others.
    pub fn wait(&mut self, fds: &[RawFd], timeout: Duration) -> io::Result<Option<usize>> {
        if fds.is_empty() {
            std::thread::sleep(timeout);
            return Ok(None);
        }
        let mut registered = 0;
        let mut reg_err = None;
        for (i, fd) in fds.iter().enumerate() {
            match self
                .poll
                .registry()
                .register(&mut SourceFd(fd), Token(i), Interest::READABLE)
            {
                Ok(()) => registered += 1,
                Err(e) => {
                    reg_err = Some(e);
                    break;
                }
            }
        }
        let res = match reg_err {
            None => self.poll.poll(&mut self.events, Some(timeout)),
            Some(e) => Err(e),
        };
        for fd in &fds[..registered] {
            let _ = self.poll.registry().deregister(&mut SourceFd(fd));
        }
        match res {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(None),
            Err(e) => return Err(e),
        }

        let mut ready = vec![false; fds.len()];
        for event in &self.events {
            let Token(i) = event.token();
            if i < ready.len() {
                ready[i] = true;
            }
        }
        for step in 0..fds.len() {
            let i = (self.next + step) % fds.len();
            if ready[i] {
                self.next = i + 1;
                return Ok(Some(i));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    const SHORT: Duration = Duration::from_millis(50);

    #[test]
    fn reports_the_ready_descriptor() {
        let (mut w, r) = UnixStream::pair().unwrap();
        let (_w2, r2) = UnixStream::pair().unwrap();
        w.write_all(b"x").unwrap();

        let mut mux = Multiplexer::new().unwrap();
        let got = mux
            .wait(&[r2.as_raw_fd(), r.as_raw_fd()], Duration::from_secs(1))
            .unwrap();
        assert_eq!(got, Some(1));
    }

    #[test]
    fn times_out_when_nothing_is_ready() {
        let (_w, r) = UnixStream::pair().unwrap();
        let mut mux = Multiplexer::new().unwrap();
        assert_eq!(mux.wait(&[r.as_raw_fd()], SHORT).unwrap(), None);
    }

    #[test]
    fn alternates_between_busy_descriptors() {
        let (mut w1, r1) = UnixStream::pair().unwrap();
        let (mut w2, r2) = UnixStream::pair().unwrap();
        w1.write_all(b"x").unwrap();
        w2.write_all(b"x").unwrap();

        let fds = [r1.as_raw_fd(), r2.as_raw_fd()];
        let mut mux = Multiplexer::new().unwrap();
        let first = mux.wait(&fds, SHORT).unwrap().unwrap();
        let second = mux.wait(&fds, SHORT).unwrap().unwrap();
        assert_ne!(first, second);
    }
}
