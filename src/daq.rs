//! DAQ reader — smoothed DUT voltages from the acquisition server.
//!
//! Connects over TCP to the acquisition board's server, which streams
//! newline-terminated records of four comma-separated voltages. A
//! background listener appends each record to per-channel ring buffers;
//! [`DaqReader::read`] returns the buffer mean, giving an
//! eventually-consistent smoothed value with roughly five samples of
//! latency.
//!
//! Commands in the client → server direction are line-oriented:
//! `CH:<1..3>` selects the multiplexer channel for the reference standard,
//! `R:<1|0.1|0.01>` selects the signal-conditioner gain.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{info, warn};

use crate::control::history::History;

/// Samples retained per channel for smoothing.
const SMOOTHING_DEPTH: usize = 5;

/// Number of DAQ channels.
pub const CHANNEL_COUNT: usize = 4;

/// Signal-conditioner gain settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GainRange {
    X1,
    X0_1,
    X0_01,
}

impl GainRange {
    fn wire(self) -> &'static str {
        match self {
            Self::X1 => "1",
            Self::X0_1 => "0.1",
            Self::X0_01 => "0.01",
        }
    }
}

/// Sampler port: the sequencer reads smoothed DUT voltages through this.
pub trait DutSampler {
    /// Smoothed voltage for `channel`, or 0.0 while the buffer is empty.
    fn read(&self, channel: usize) -> f64;

    /// Whether the acquisition link is still alive. The sequencer halts at
    /// its next check when this goes false.
    fn link_ok(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Frame parsing (pure)
// ---------------------------------------------------------------------------

/// Parse one streamed record of four comma-separated voltages.
pub fn parse_frame(line: &str) -> Option<[f64; CHANNEL_COUNT]> {
    let mut voltages = [0.0; CHANNEL_COUNT];
    let mut n = 0;
    for field in line.trim().split(',') {
        let field = field.trim();
        if field.is_empty() {
            continue;
        }
        if n == CHANNEL_COUNT {
            return None;
        }
        voltages[n] = field.parse().ok()?;
        n += 1;
    }
    (n == CHANNEL_COUNT).then_some(voltages)
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

struct DaqShared {
    channels: Mutex<[History<SMOOTHING_DEPTH>; CHANNEL_COUNT]>,
    connected: AtomicBool,
    stop: AtomicBool,
}

/// TCP-backed DAQ reader with a background listener thread.
pub struct DaqReader {
    shared: Arc<DaqShared>,
    command_stream: Mutex<TcpStream>,
    handle: Option<JoinHandle<()>>,
}

impl DaqReader {
    /// Connect to the acquisition server and start the listener.
    pub fn connect(host: &str, port: u16) -> std::io::Result<Self> {
        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true).ok();
        let listener_stream = stream.try_clone()?;

        let shared = Arc::new(DaqShared {
            channels: Mutex::new(std::array::from_fn(|_| History::new())),
            connected: AtomicBool::new(true),
            stop: AtomicBool::new(false),
        });

        let listener_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("daq-listen".to_string())
            .spawn(move || listen_loop(&listener_shared, listener_stream))
            .expect("spawn DAQ listener");

        info!("DAQ reader connected to {host}:{port}");
        Ok(Self {
            shared,
            command_stream: Mutex::new(stream),
            handle: Some(handle),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    /// Select the multiplexer channel routed to the reference standard.
    pub fn select_channel(&self, channel: u8) {
        self.send_command(&format!("CH:{channel}"));
    }

    /// Select the signal-conditioner gain.
    pub fn set_range(&self, range: GainRange) {
        self.send_command(&format!("R:{}", range.wire()));
    }

    fn send_command(&self, command: &str) {
        let mut stream = self.command_stream.lock().expect("DAQ stream lock poisoned");
        if stream.write_all(format!("{command}\n").as_bytes()).is_err() {
            warn!("DAQ command '{command}' failed to send");
            self.shared.connected.store(false, Ordering::Relaxed);
        }
    }

    /// Signal the listener and release the socket.
    pub fn close(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Ok(stream) = self.command_stream.lock() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.shared.connected.store(false, Ordering::Relaxed);
    }
}

impl DutSampler for DaqReader {
    fn read(&self, channel: usize) -> f64 {
        let channels = self.shared.channels.lock().expect("DAQ channel lock poisoned");
        match channels.get(channel) {
            Some(history) => history.mean().unwrap_or(0.0),
            None => {
                warn!("DAQ read on invalid channel {channel}");
                0.0
            }
        }
    }

    fn link_ok(&self) -> bool {
        self.is_connected()
    }
}

impl Drop for DaqReader {
    fn drop(&mut self) {
        self.close();
    }
}

fn listen_loop(shared: &DaqShared, stream: TcpStream) {
    stream
        .set_read_timeout(Some(Duration::from_millis(500)))
        .ok();
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    while !shared.stop.load(Ordering::Relaxed) {
        match reader.read_line(&mut line) {
            Ok(0) => {
                warn!("DAQ connection closed by server");
                shared.connected.store(false, Ordering::Relaxed);
                break;
            }
            Ok(_) => {
                if !line.trim().is_empty() {
                    match parse_frame(&line) {
                        Some(voltages) => {
                            let mut channels =
                                shared.channels.lock().expect("DAQ channel lock poisoned");
                            for (history, voltage) in channels.iter_mut().zip(voltages) {
                                history.push(voltage);
                            }
                        }
                        None => warn!("DAQ received malformed record: {}", line.trim()),
                    }
                }
                line.clear();
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                // Idle link; a partial line stays buffered for the next
                // pass while the stop flag is re-checked.
            }
            Err(_) => {
                warn!("DAQ socket error, disconnecting");
                shared.connected.store(false, Ordering::Relaxed);
                break;
            }
        }
    }
}
