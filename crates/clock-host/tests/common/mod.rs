//! Reusable test harness for clock-host integration tests.
//!
//! Provides helpers for spawning the binary on an ephemeral port,
//! connecting over TCP, and sending/receiving the length-prefixed binary
//! protocol frames.

use std::fs;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::{Duration, Instant};

use chrono::Timelike;

// ── MSG constants (must match the clock-host binary) ────────────────

pub const MSG_HELLO: u8 = 0x00;
pub const MSG_RESIZE: u8 = 0x01;
pub const MSG_KEY: u8 = 0x02;
pub const MSG_FRAME: u8 = 0x10;
pub const MSG_BYE: u8 = 0x11;

pub const KEY_QUIT: u8 = b'q';
pub const KEY_CTRL_C: u8 = 0x03;

// ── Frame encoding/decoding ─────────────────────────────────────────

pub fn encode_frame(msg_type: u8, data: &[u8]) -> Vec<u8> {
    let len = (data.len() + 1) as u32;
    let mut frame = Vec::with_capacity(5 + data.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.push(msg_type);
    frame.extend_from_slice(data);
    frame
}

/// Decoded frame: (message_type, payload_after_type_byte)
pub struct Frame {
    pub msg_type: u8,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).to_string()
    }
}

// ── ClockHostHandle ─────────────────────────────────────────────────

/// Handle to a running clock-host process. Cleans up on drop.
pub struct ClockHostHandle {
    pub child: Child,
    pub addr: SocketAddr,
    pub art_dir: PathBuf,
    _scratch: tempfile::TempDir,
}

impl Drop for ClockHostHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl ClockHostHandle {
    /// Wait for the child to exit on its own, without killing it.
    pub fn wait_for_exit(&mut self, timeout: Duration) -> Option<std::process::ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Some(status);
            }
            if Instant::now() > deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

// ── SocketClient ────────────────────────────────────────────────────

/// Client wrapper for a connected TCP stream with frame-level read/write.
pub struct SocketClient {
    stream: TcpStream,
    read_buf: Vec<u8>,
}

impl SocketClient {
    pub fn new(stream: TcpStream) -> Self {
        stream.set_read_timeout(Some(Duration::from_secs(5))).ok();
        Self {
            stream,
            read_buf: Vec::new(),
        }
    }

    /// Send a typed frame: [4B len][msg_type][data]
    pub fn send_frame(&mut self, msg_type: u8, data: &[u8]) -> io::Result<()> {
        use std::io::Write;
        self.stream.write_all(&encode_frame(msg_type, data))
    }

    /// Send the HELLO frame announcing the initial viewport.
    pub fn send_hello(&mut self, cols: u16, rows: u16) -> io::Result<()> {
        let mut data = Vec::with_capacity(4);
        data.extend_from_slice(&cols.to_be_bytes());
        data.extend_from_slice(&rows.to_be_bytes());
        self.send_frame(MSG_HELLO, &data)
    }

    /// Send a RESIZE frame.
    pub fn send_resize(&mut self, cols: u16, rows: u16) -> io::Result<()> {
        let mut data = Vec::with_capacity(4);
        data.extend_from_slice(&cols.to_be_bytes());
        data.extend_from_slice(&rows.to_be_bytes());
        self.send_frame(MSG_RESIZE, &data)
    }

    /// Send a single key press.
    pub fn send_key(&mut self, key: u8) -> io::Result<()> {
        self.send_frame(MSG_KEY, &[key])
    }

    /// Read the next frame. Returns None on timeout or disconnect.
    pub fn recv_frame(&mut self) -> Option<Frame> {
        use std::io::Read;

        let deadline = Instant::now() + Duration::from_secs(5);

        loop {
            if self.read_buf.len() >= 4 {
                let msg_len = u32::from_be_bytes([
                    self.read_buf[0],
                    self.read_buf[1],
                    self.read_buf[2],
                    self.read_buf[3],
                ]) as usize;
                if self.read_buf.len() >= 4 + msg_len && msg_len > 0 {
                    let payload: Vec<u8> = self.read_buf[4..4 + msg_len].to_vec();
                    self.read_buf = self.read_buf[4 + msg_len..].to_vec();
                    return Some(Frame {
                        msg_type: payload[0],
                        data: payload[1..].to_vec(),
                    });
                }
            }

            if Instant::now() > deadline {
                return None;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            self.stream
                .set_read_timeout(Some(remaining.max(Duration::from_millis(50))))
                .ok();

            let mut buf = [0u8; 65536];
            match self.stream.read(&mut buf) {
                Ok(0) => return None, // disconnected
                Ok(n) => self.read_buf.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(_) => return None,
            }
        }
    }

    /// Wait for a specific message type, discarding others.
    pub fn wait_for_message(&mut self, target_type: u8, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            if Instant::now() > deadline {
                return None;
            }
            match self.recv_frame() {
                Some(frame) if frame.msg_type == target_type => return Some(frame),
                Some(_) => continue,
                None => return None,
            }
        }
    }

    /// Collect all frames that arrive within a timeout.
    pub fn collect_frames(&mut self, timeout: Duration) -> Vec<Frame> {
        let deadline = Instant::now() + timeout;
        let mut frames = Vec::new();
        loop {
            if Instant::now() > deadline {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.stream
                .set_read_timeout(Some(remaining.max(Duration::from_millis(50))))
                .ok();
            match self.recv_frame() {
                Some(frame) => frames.push(frame),
                None => break,
            }
        }
        frames
    }
}

// ── Spawn helpers ───────────────────────────────────────────────────

/// Find the compiled clock-host binary.
fn binary_path() -> PathBuf {
    // Workspace target dir first (cargo test builds debug by default).
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.pop(); // crates/
    path.pop(); // workspace root
    path.push("target");
    path.push("debug");
    path.push("clock-host");

    if !path.exists() {
        // Crate-local target dir fallback.
        path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        path.push("target");
        path.push("debug");
        path.push("clock-host");
    }

    path
}

/// Grab an ephemeral port from the kernel, then release it for the child.
fn reserve_port() -> io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Spawn a clock-host process serving the given art files out of a scratch
/// directory. CLOCK_TZ defaults to UTC so no session ever performs a real
/// timezone lookup; `env_vars` may override it.
pub fn spawn_clock_host(
    art_files: &[(&str, &str)],
    env_vars: &[(&str, &str)],
) -> io::Result<ClockHostHandle> {
    let bin = binary_path();
    if !bin.exists() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("Binary not found at {:?}. Run `cargo build` first.", bin),
        ));
    }

    let scratch = tempfile::tempdir()?;
    let art_dir = scratch.path().join("art");
    fs::create_dir_all(&art_dir)?;
    for (name, content) in art_files {
        fs::write(art_dir.join(name), content)?;
    }

    let port = reserve_port()?;
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

    let mut cmd = Command::new(&bin);
    cmd.env("CLOCK_HOST", "127.0.0.1")
        .env("CLOCK_PORT", port.to_string())
        .env("CLOCK_ART_DIR", &art_dir)
        .env("CLOCK_TZ", "UTC");
    for (k, v) in env_vars {
        cmd.env(k, v);
    }

    let child = cmd.spawn()?;

    // Wait for the listener to come up.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(addr) {
            Ok(_) => break, // probe connection; the server drops it quietly
            Err(_) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(err) => return Err(err),
        }
    }

    Ok(ClockHostHandle {
        child,
        addr,
        art_dir,
        _scratch: scratch,
    })
}

/// Connect to a running clock-host.
pub fn connect(addr: SocketAddr) -> io::Result<SocketClient> {
    let stream = TcpStream::connect(addr)?;
    Ok(SocketClient::new(stream))
}

/// Pick a timezone whose local clock is nowhere near the 11:11 reveal
/// window right now, so placeholder assertions can't race the real time.
/// The candidates are offset from each other by fractional hours; at least
/// one is always clear of the window.
pub fn safe_timezone() -> &'static str {
    const CANDIDATES: [&str; 3] = ["UTC", "Asia/Kolkata", "Asia/Kathmandu"];
    const REVEAL_MINUTE: i64 = 11 * 60 + 11; // on a 12-hour dial

    let now = chrono::Utc::now();
    for name in CANDIDATES {
        let tz: chrono_tz::Tz = name.parse().unwrap();
        let local = now.with_timezone(&tz);
        let minute = i64::from(local.hour() % 12) * 60 + i64::from(local.minute());
        let diff = (minute - REVEAL_MINUTE).abs().min(720 - (minute - REVEAL_MINUTE).abs());
        if diff >= 3 {
            return name;
        }
    }
    unreachable!("candidate zones are mutually offset; one must be clear of 11:11");
}
