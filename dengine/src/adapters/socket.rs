use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A connected, bidirectional byte stream.
///
/// The engine drives all peer traffic through this trait so hosts can swap
/// the transport (plain TCP, an MSE-wrapping stream, an in-memory pair in
/// tests).
pub trait Socket: Read + Write + Send {
    /// Address of the remote end.
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Sets read and write timeouts. `None` blocks forever.
    fn set_timeouts(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Closes both directions.
    fn shutdown(&self);

    /// Whether the stream is an MSE/PE-wrapped transport. Hosts providing
    /// encrypted sockets override this; the engine drops plaintext sessions
    /// when the policy requires encryption.
    fn is_encrypted(&self) -> bool {
        false
    }
}

/// A listening socket producing inbound `Socket`s.
pub trait ServerSocket: Send {
    fn accept(&self) -> io::Result<Box<dyn Socket>>;
    fn local_port(&self) -> io::Result<u16>;
}

/// A bound datagram socket, used by the DHT.
pub trait DatagramSocket: Send + Sync {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    fn local_port(&self) -> io::Result<u16>;
}

/// Factory the host provides for all engine networking.
pub trait SocketFactory: Send + Sync {
    fn connect(&self, addr: SocketAddr, timeout: Duration) -> io::Result<Box<dyn Socket>>;
    fn listen(&self, port: u16) -> io::Result<Box<dyn ServerSocket>>;
    fn bind_udp(&self, port: u16) -> io::Result<Box<dyn DatagramSocket>>;
}

// ------------------------------------------------------------------------------------------------
// Native std::net implementations

pub struct NativeSocket {
    stream: TcpStream,
}

impl Read for NativeSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for NativeSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Socket for NativeSocket {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    fn set_timeouts(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)?;
        self.stream.set_write_timeout(timeout)
    }

    fn shutdown(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

pub struct NativeServerSocket {
    listener: TcpListener,
}

impl ServerSocket for NativeServerSocket {
    fn accept(&self) -> io::Result<Box<dyn Socket>> {
        let (stream, _) = self.listener.accept()?;
        Ok(Box::new(NativeSocket { stream }))
    }

    fn local_port(&self) -> io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }
}

pub struct NativeDatagramSocket {
    socket: UdpSocket,
}

impl DatagramSocket for NativeDatagramSocket {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, addr)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.set_read_timeout(timeout)
    }

    fn local_port(&self) -> io::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }
}

/// Default factory backed by `std::net`.
pub struct NativeSocketFactory;

impl SocketFactory for NativeSocketFactory {
    fn connect(&self, addr: SocketAddr, timeout: Duration) -> io::Result<Box<dyn Socket>> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        Ok(Box::new(NativeSocket { stream }))
    }

    fn listen(&self, port: u16) -> io::Result<Box<dyn ServerSocket>> {
        let listener = TcpListener::bind(format!("0.0.0.0:{}", port))?;
        Ok(Box::new(NativeServerSocket { listener }))
    }

    fn bind_udp(&self, port: u16) -> io::Result<Box<dyn DatagramSocket>> {
        let socket = UdpSocket::bind(format!("0.0.0.0:{}", port))?;
        Ok(Box::new(NativeDatagramSocket { socket }))
    }
}

// ------------------------------------------------------------------------------------------------
// In-memory socket pair

#[derive(Default)]
struct PipeState {
    buffer: VecDeque<u8>,
    closed: bool,
}

#[derive(Default)]
struct Pipe {
    state: Mutex<PipeState>,
    readable: Condvar,
}

impl Pipe {
    fn push(&self, bytes: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        state.buffer.extend(bytes);
        self.readable.notify_all();
        Ok(bytes.len())
    }

    fn pull(&self, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        loop {
            if !state.buffer.is_empty() {
                let mut n = 0;
                while n < buf.len() {
                    match state.buffer.pop_front() {
                        Some(byte) => {
                            buf[n] = byte;
                            n += 1;
                        }
                        None => break,
                    }
                }
                return Ok(n);
            }
            if state.closed {
                return Ok(0);
            }
            match timeout {
                Some(timeout) => {
                    let (next, result) = self.readable.wait_timeout(state, timeout).unwrap();
                    state = next;
                    if result.timed_out() && state.buffer.is_empty() && !state.closed {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
                    }
                }
                None => state = self.readable.wait(state).unwrap(),
            }
        }
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.readable.notify_all();
    }
}

/// One end of an in-memory socket pair. Used by tests and by hosts that feed
/// the engine from a transport of their own.
pub struct MemorySocket {
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
    remote: SocketAddr,
    timeout: Mutex<Option<Duration>>,
}

/// Creates two connected `MemorySocket`s; bytes written to one are read from
/// the other.
pub fn memory_socket_pair() -> (MemorySocket, MemorySocket) {
    let a_to_b = Arc::new(Pipe::default());
    let b_to_a = Arc::new(Pipe::default());
    let a = MemorySocket {
        rx: b_to_a.clone(),
        tx: a_to_b.clone(),
        remote: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 6881),
        timeout: Mutex::new(None),
    };
    let b = MemorySocket {
        rx: a_to_b,
        tx: b_to_a,
        remote: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 6881),
        timeout: Mutex::new(None),
    };
    (a, b)
}

impl Read for MemorySocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let timeout = *self.timeout.lock().unwrap();
        self.rx.pull(buf, timeout)
    }
}

impl Write for MemorySocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx.push(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Socket for MemorySocket {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.remote)
    }

    fn set_timeouts(&self, timeout: Option<Duration>) -> io::Result<()> {
        *self.timeout.lock().unwrap() = timeout;
        Ok(())
    }

    fn shutdown(&self) {
        self.rx.close();
        self.tx.close();
    }
}
