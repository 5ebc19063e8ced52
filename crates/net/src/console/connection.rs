use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};

use crate::error::{NetError, Result};
use crate::protocol::{MAX_PACKET_SIZE, sanitize_cc};

const BUFFER_SIZE: usize = MAX_PACKET_SIZE;
/// Longest line `send` writes before the line ending.
const MAX_SEND_LINE: usize = 1021;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleState {
    Offline,
    Online,
    Error,
}

/// Line-oriented TCP connection of one remote console client.
#[derive(Debug)]
pub struct ConsoleConnection {
    state: ConsoleState,
    stream: Option<TcpStream>,
    peer_addr: Option<SocketAddr>,
    buffer: Vec<u8>,
    line_ending: Vec<u8>,
    line_ending_detected: bool,
    error: String,
}

impl Default for ConsoleConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleConnection {
    pub fn new() -> Self {
        Self {
            state: ConsoleState::Offline,
            stream: None,
            peer_addr: None,
            buffer: Vec::with_capacity(BUFFER_SIZE),
            line_ending: b"\n".to_vec(),
            line_ending_detected: false,
            error: String::new(),
        }
    }

    pub fn state(&self) -> ConsoleState {
        self.state
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn error_string(&self) -> &str {
        &self.error
    }

    /// Line ending used for replies, as detected from the client.
    pub fn line_ending(&self) -> &[u8] {
        &self.line_ending
    }

    pub fn reset(&mut self) {
        self.state = ConsoleState::Offline;
        self.stream = None;
        self.peer_addr = None;
        self.buffer.clear();
        self.line_ending = b"\n".to_vec();
        self.line_ending_detected = false;
        self.error.clear();
    }

    pub fn init(&mut self, stream: TcpStream, addr: SocketAddr) -> io::Result<()> {
        stream.set_nonblocking(true)?;
        self.reset();
        self.stream = Some(stream);
        self.peer_addr = Some(addr);
        self.state = ConsoleState::Online;
        Ok(())
    }

    /// Sends `reason` if there is one, then closes the socket.
    pub fn disconnect(&mut self, reason: &str) {
        if self.state == ConsoleState::Offline {
            return;
        }

        if !reason.is_empty() {
            if let Err(e) = self.send(reason) {
                log::debug!("Could not deliver disconnect reason to {:?}: {}", self.peer_addr, e);
            }
        }
        if let Some(stream) = &self.stream {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.reset();
    }

    /// Pulls pending bytes off the socket.
    pub fn update(&mut self) {
        if self.state != ConsoleState::Online {
            return;
        }
        if self.buffer.len() >= BUFFER_SIZE {
            self.fail("too weak connection (out of buffer)");
            return;
        }
        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        let mut chunk = [0u8; BUFFER_SIZE];
        let room = BUFFER_SIZE - self.buffer.len();
        match stream.read(&mut chunk[..room]) {
            Ok(0) => self.fail("remote end closed the connection"),
            Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                log::debug!("Console read from {:?} failed: {}", self.peer_addr, e);
                self.fail("connection failure");
            }
        }
    }

    /// Next complete line of at most `max_length` bytes. Longer lines stay
    /// buffered; lines that are not valid UTF-8 are discarded.
    pub fn recv(&mut self, max_length: usize) -> Option<String> {
        while self.state == ConsoleState::Online && !self.buffer.is_empty() {
            let start = self.skip_line_breaks()?;

            let Some(len) = self.buffer[start..]
                .iter()
                .position(|&b| b == b'\r' || b == b'\n')
            else {
                self.buffer.drain(..start);
                return None;
            };
            if len > max_length {
                self.buffer.drain(..start);
                return None;
            }

            let end = start + len;
            let line = std::str::from_utf8(&self.buffer[start..end]).map(sanitize_cc);
            self.buffer.drain(..end);
            match line {
                Ok(line) => return Some(line),
                Err(_) => log::debug!("Dropping non UTF-8 console line from {:?}", self.peer_addr),
            }
        }
        None
    }

    /// Writes `line` followed by the client's line ending.
    pub fn send(&mut self, line: &str) -> Result<()> {
        if self.state != ConsoleState::Online {
            return Err(NetError::NotConnected);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(NetError::NotConnected);
        };

        let mut end = line.len().min(MAX_SEND_LINE);
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        let mut data = Vec::with_capacity(end + self.line_ending.len());
        data.extend_from_slice(&line.as_bytes()[..end]);
        data.extend_from_slice(&self.line_ending);

        if let Err(e) = stream.write_all(&data) {
            self.fail("failed to send packet");
            return Err(NetError::Io(e));
        }
        Ok(())
    }

    fn fail(&mut self, reason: &str) {
        self.state = ConsoleState::Error;
        self.error = reason.to_string();
    }

    /// Skips leading line breaks, learning the client's line ending from the
    /// first one. Returns the offset of the next line, or `None` when the
    /// buffer held nothing else.
    fn skip_line_breaks(&mut self) -> Option<usize> {
        let mut start = 0;
        while start < self.buffer.len() && is_line_break(self.buffer[start]) {
            if !self.line_ending_detected {
                let first = self.buffer[start];
                self.line_ending = vec![first];
                if let Some(&second) = self.buffer.get(start + 1) {
                    if is_line_break(second) && second != first {
                        self.line_ending.push(second);
                    }
                }
                self.line_ending_detected = true;
            }
            start += 1;
        }

        if start >= self.buffer.len() {
            self.buffer.clear();
            return None;
        }
        Some(start)
    }
}

fn is_line_break(byte: u8) -> bool {
    byte == b'\r' || byte == b'\n'
}
