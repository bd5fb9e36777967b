//! Request/response framing over a raw TCP connection.
//!
//! A request is read in chunks and its end is inferred rather than declared:
//! a short read, a full chunk whose final byte is NUL, or an empty kernel
//! receive buffer all terminate the message. A slow-arriving continuation
//! can therefore be mistaken for end of message; `Framer` is a trait so a
//! length-prefixed implementation can be substituted without touching the
//! worker loop.

use bytes::BytesMut;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;

/// Strategy for reading one request and writing one response.
pub trait Framer {
    /// Read a complete request off the connection.
    fn read_request(&self, stream: &mut TcpStream) -> io::Result<Vec<u8>>;

    /// Write a response payload to the connection.
    fn write_response(&self, stream: &mut TcpStream, payload: &[u8]) -> io::Result<()>;
}

/// The default framer: chunked reads with an end-of-message heuristic and
/// an optional NUL terminator on writes.
#[derive(Debug, Clone)]
pub struct ChunkedFramer {
    chunk_size: usize,
    auto_append: bool,
}

impl ChunkedFramer {
    /// Create a framer reading up to `chunk_size` bytes per I/O call.
    pub fn new(chunk_size: usize, auto_append: bool) -> Self {
        Self {
            chunk_size,
            auto_append,
        }
    }
}

impl Framer for ChunkedFramer {
    fn read_request(&self, stream: &mut TcpStream) -> io::Result<Vec<u8>> {
        let mut message = BytesMut::new();
        let mut chunk = vec![0u8; self.chunk_size];

        loop {
            let n = stream.read(&mut chunk)?;
            if n == 0 {
                // End of stream
                break;
            }

            message.extend_from_slice(&chunk[..n]);

            // A short read means no more data was immediately available;
            // treat the message as complete.
            if n < self.chunk_size {
                break;
            }

            // Boundary condition: a full chunk whose final byte is NUL is an
            // explicit end-of-message sentinel.
            if chunk[self.chunk_size - 1] == 0 {
                break;
            }

            // Only read again if the kernel already holds more bytes;
            // otherwise we would block on a message that may be complete.
            if bytes_buffered(stream)? == 0 {
                break;
            }
        }

        Ok(message.to_vec())
    }

    fn write_response(&self, stream: &mut TcpStream, payload: &[u8]) -> io::Result<()> {
        stream.write_all(payload)?;
        if self.auto_append {
            stream.write_all(&[0])?;
        }
        Ok(())
    }
}

/// Number of bytes currently sitting in the socket's receive buffer.
fn bytes_buffered(stream: &TcpStream) -> io::Result<usize> {
    let mut count: libc::c_int = 0;
    // SAFETY: FIONREAD writes one c_int for a valid socket fd, which the
    // borrowed TcpStream guarantees.
    let rc = unsafe { libc::ioctl(stream.as_raw_fd(), libc::FIONREAD as _, &mut count) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(count as usize)
}
