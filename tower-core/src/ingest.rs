//! Upstream PCM ingest: a single always-on TCP listener accepting a raw,
//! unframed byte stream of canonical PCM frames.
//!
//! No authentication, no wire framing beyond the fixed frame size. Exactly
//! one active producer at a time; a new connection replaces whatever
//! producer is currently active (see DESIGN.md's Open Question decision).

use std::io::Read;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{TowerError, TowerResult};
use crate::protocol_constants::CANONICAL_FRAME_BYTES;
use crate::ring::FrameRing;

pub struct IngestFramer {
    ring: Arc<FrameRing>,
    stop_flag: Arc<AtomicBool>,
    active_stream: Arc<Mutex<Option<TcpStream>>>,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
}

impl IngestFramer {
    pub fn new(ring: Arc<FrameRing>) -> Self {
        Self {
            ring,
            stop_flag: Arc::new(AtomicBool::new(true)),
            active_stream: Arc::new(Mutex::new(None)),
            accept_handle: Mutex::new(None),
        }
    }

    pub fn start(&self, addr: SocketAddr) -> TowerResult<()> {
        let listener = TcpListener::bind(addr).map_err(|e| TowerError::Bind(e.to_string()))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| TowerError::Bind(e.to_string()))?;

        self.stop_flag.store(false, Ordering::Release);
        let ring = Arc::clone(&self.ring);
        let stop_flag = Arc::clone(&self.stop_flag);
        let active_stream = Arc::clone(&self.active_stream);
        let handle = std::thread::spawn(move || accept_loop(listener, ring, stop_flag, active_stream));
        *self.accept_handle.lock() = Some(handle);
        Ok(())
    }

    /// Shuts down the active producer connection (if any) and the accept
    /// thread. Per-connection reader threads are not joined — they exit on
    /// their own once their socket is shut down or closed.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(stream) = self.active_stream.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(handle) = self.accept_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn accept_loop(
    listener: TcpListener,
    ring: Arc<FrameRing>,
    stop_flag: Arc<AtomicBool>,
    active_stream: Arc<Mutex<Option<TcpStream>>>,
) {
    loop {
        if stop_flag.load(Ordering::Acquire) {
            return;
        }

        match listener.accept() {
            Ok((stream, _addr)) => {
                // Replace policy: the incoming producer takes over
                // immediately; the previous one (if any) is shut down.
                if let Some(old) = active_stream.lock().take() {
                    let _ = old.shutdown(Shutdown::Both);
                }
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let reader_stream = match stream.try_clone() {
                    Ok(s) => s,
                    Err(_) => continue,
                };
                *active_stream.lock() = Some(stream);

                let ring = Arc::clone(&ring);
                let stop_flag = Arc::clone(&stop_flag);
                std::thread::spawn(move || read_loop(reader_stream, ring, stop_flag));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(_) => {
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn read_loop(mut stream: TcpStream, ring: Arc<FrameRing>, stop_flag: Arc<AtomicBool>) {
    let mut buf = vec![0u8; CANONICAL_FRAME_BYTES];
    loop {
        if stop_flag.load(Ordering::Acquire) {
            return;
        }
        match fill_one_frame(&mut stream, &mut buf) {
            Ok(true) => {
                ring.push(Bytes::copy_from_slice(&buf));
            }
            Ok(false) => return, // disconnect; any in-flight partial frame is dropped with `buf`
            Err(_) => return,
        }
    }
}

/// Fills `buf` completely from `stream`, or returns `Ok(false)` on a clean
/// disconnect partway through (the partial bytes already read are
/// discarded along with `buf` itself).
fn fill_one_frame(stream: &mut TcpStream, buf: &mut [u8]) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpStream as ClientStream;

    use crate::ring::OverflowPolicy;

    fn free_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    #[test]
    fn accepts_connection_and_frames_pcm_into_ring() {
        let ring = Arc::new(FrameRing::new(8, CANONICAL_FRAME_BYTES, OverflowPolicy::DropNewest));
        let framer = IngestFramer::new(Arc::clone(&ring));
        let addr = free_addr();
        framer.start(addr).unwrap();

        std::thread::sleep(Duration::from_millis(50));
        let mut client = ClientStream::connect(addr).unwrap();
        client.write_all(&vec![7u8; CANONICAL_FRAME_BYTES]).unwrap();
        client.write_all(&vec![9u8; CANONICAL_FRAME_BYTES]).unwrap();

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(ring.stats().count, 2);

        framer.stop();
    }

    #[test]
    fn new_connection_replaces_previous_producer() {
        let ring = Arc::new(FrameRing::new(8, CANONICAL_FRAME_BYTES, OverflowPolicy::DropNewest));
        let framer = IngestFramer::new(Arc::clone(&ring));
        let addr = free_addr();
        framer.start(addr).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let mut first = ClientStream::connect(addr).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let mut second = ClientStream::connect(addr).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        // The first connection should have been shut down by the replace
        // policy; writing to it either errors or is simply ignored
        // downstream. The second connection is the live producer.
        let _ = first.write_all(&[0u8; 4]);
        second
            .write_all(&vec![5u8; CANONICAL_FRAME_BYTES])
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(ring.stats().count >= 1);

        framer.stop();
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let ring = Arc::new(FrameRing::new(8, CANONICAL_FRAME_BYTES, OverflowPolicy::DropNewest));
        let framer = IngestFramer::new(ring);
        framer.stop();
    }
}
