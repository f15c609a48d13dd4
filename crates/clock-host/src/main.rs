//! Terminal clock server that reveals a randomly chosen piece of ASCII art
//! at 11:11. One session per connection, each with its own timezone, tick
//! timer, and viewport.
//!
//! The secure transport gateway in front of this process owns auth and
//! encryption; it relays the client's pty size, resize events, and key
//! presses to us, and our rendered frames back, over the length-prefixed
//! frame protocol below, one stream per client.
//!
//! Usage: clock-host (configured via CLOCK_* environment variables)

use std::env;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, error, info, warn};
use unicode_width::UnicodeWidthStr;

// ── MSG constants (must match the transport gateway) ─────────────────

const MSG_HELLO: u8 = 0x00;
const MSG_RESIZE: u8 = 0x01;
const MSG_KEY: u8 = 0x02;
const MSG_FRAME: u8 = 0x10;
const MSG_BYE: u8 = 0x11;

// ── Constants ────────────────────────────────────────────────────────

const TICK_INTERVAL_MS: u64 = 250;
const HELLO_TIMEOUT_MS: u64 = 10_000;
const LOOKUP_TIMEOUT_MS: u64 = 5_000;
const SHUTDOWN_GRACE_SECS: u64 = 30;

const REVEAL_CLOCK: &str = "11:11";

const KEY_QUIT: u8 = b'q';
const KEY_CTRL_C: u8 = 0x03;

// ── Configuration ────────────────────────────────────────────────────

struct Config {
    host: String,
    port: u16,
    art_dir: PathBuf,
    ipinfo_token: Option<String>,
    forced_timezone: Option<Tz>,
    always_reveal: bool,
}

impl Config {
    fn from_env() -> anyhow::Result<Self> {
        let host = env::var("CLOCK_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = match env::var("CLOCK_PORT") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("invalid CLOCK_PORT {raw:?}"))?,
            Err(_) => 23234,
        };
        let art_dir =
            PathBuf::from(env::var("CLOCK_ART_DIR").unwrap_or_else(|_| "art".to_string()));
        let ipinfo_token = env::var("IPINFO_TOKEN").ok().filter(|t| !t.is_empty());
        let forced_timezone = match env::var("CLOCK_TZ") {
            Ok(raw) => Some(
                raw.parse()
                    .map_err(|err| anyhow::anyhow!("invalid CLOCK_TZ {raw:?}: {err}"))?,
            ),
            Err(_) => None,
        };
        let always_reveal = env::var("ALWAYS_REVEAL").map(|v| v == "1").unwrap_or(false);

        Ok(Self {
            host,
            port,
            art_dir,
            ipinfo_token,
            forced_timezone,
            always_reveal,
        })
    }
}

// ── Asset pool ───────────────────────────────────────────────────────

/// Raw art blobs, one per file, loaded once at startup and shared
/// read-only across all sessions.
struct AssetPool {
    assets: Vec<String>,
}

impl AssetPool {
    /// Load every regular file in `dir`, sorted by file name so pool order
    /// is stable across runs. Unreadable entries are skipped, a missing
    /// directory yields an empty pool; neither is fatal.
    fn load(dir: &Path) -> Self {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %dir.display(), %err, "cannot read art directory");
                return Self { assets: Vec::new() };
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        paths.sort();

        let mut assets = Vec::with_capacity(paths.len());
        for path in paths {
            match fs::read_to_string(&path) {
                Ok(raw) => assets.push(raw),
                Err(err) => warn!(path = %path.display(), %err, "skipping unreadable asset"),
            }
        }

        Self { assets }
    }

    fn len(&self) -> usize {
        self.assets.len()
    }

    fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

// ── Asset selector ───────────────────────────────────────────────────

/// One art asset fitted to a viewport: split into lines and de-indented so
/// the leftmost non-blank character sits at column zero.
#[derive(Clone, Debug, PartialEq, Eq)]
struct NormalizedAsset {
    lines: Vec<String>,
    line_count: usize,
    max_line_width: usize,
}

fn display_width(line: &str) -> usize {
    UnicodeWidthStr::width(line)
}

/// A blank line is empty or consists entirely of spaces; blank lines don't
/// participate in the common-indent computation.
fn is_blank(line: &str) -> bool {
    line.chars().all(|c| c == ' ')
}

fn leading_spaces(line: &str) -> usize {
    line.chars().take_while(|&c| c == ' ').count()
}

/// Split one raw blob, strip the minimum common leading-space count over
/// its non-blank lines, and measure the result. Also returns the pre-strip
/// width of the longest line (in display columns), which is what the fit
/// check compares against the viewport.
fn normalize_asset(raw: &str) -> (NormalizedAsset, usize) {
    let lines: Vec<&str> = raw.split('\n').collect();

    let raw_width = lines.iter().map(|line| display_width(line)).max().unwrap_or(0);

    let strip = lines
        .iter()
        .filter(|line| !is_blank(line))
        .map(|line| leading_spaces(line))
        .min()
        .unwrap_or(0);

    let stripped: Vec<String> = lines
        .iter()
        .map(|line| {
            // Lines shorter than the strip count become empty. The first
            // `strip` chars of every longer line are spaces, so skipping
            // chars never splits a grapheme.
            if line.chars().count() > strip {
                line.chars().skip(strip).collect()
            } else {
                String::new()
            }
        })
        .collect();

    let line_count = stripped.len();
    let max_line_width = stripped
        .iter()
        .map(|line| display_width(line))
        .max()
        .unwrap_or(0);

    (
        NormalizedAsset {
            lines: stripped,
            line_count,
            max_line_width,
        },
        raw_width,
    )
}

/// Pick one asset at random that fits inside the viewport, de-indented.
/// Pool order is visited in a fresh random permutation on every call so a
/// session doesn't always land on the same asset. `None` means nothing in
/// the pool fits; callers render an empty art region in that case.
fn select_fitting_asset<R: Rng>(
    pool: &AssetPool,
    max_width: usize,
    max_height: usize,
    rng: &mut R,
) -> Option<NormalizedAsset> {
    let mut order: Vec<usize> = (0..pool.assets.len()).collect();
    order.shuffle(rng);

    for idx in order {
        let (asset, raw_width) = normalize_asset(&pool.assets[idx]);
        // Strict comparison keeps at least one free row and column between
        // the art and the terminal edges.
        if asset.line_count < max_height && raw_width < max_width {
            return Some(asset);
        }
    }

    None
}

// ── Timezone resolver ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct IpInfoResponse {
    timezone: Option<String>,
}

/// Maps a client address to its display timezone via the ipinfo.io API.
/// `forced` short-circuits the lookup with a fixed zone for every session
/// (local testing, demos behind NAT).
struct TimezoneResolver {
    client: reqwest::Client,
    token: Option<String>,
    forced: Option<Tz>,
}

impl TimezoneResolver {
    fn new(token: Option<String>, forced: Option<Tz>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(LOOKUP_TIMEOUT_MS))
            .build()
            .context("building ipinfo http client")?;
        Ok(Self {
            client,
            token,
            forced,
        })
    }

    /// One lookup per new connection. Any failure is fatal for that session
    /// only; the caller closes the connection without retrying and without
    /// falling back to a default zone.
    async fn resolve(&self, ip: IpAddr) -> anyhow::Result<Tz> {
        if let Some(tz) = self.forced {
            return Ok(tz);
        }

        let mut request = self.client.get(format!("https://ipinfo.io/{ip}/json"));
        if let Some(token) = &self.token {
            request = request.query(&[("token", token.as_str())]);
        }

        let body = request
            .send()
            .await
            .with_context(|| format!("timezone lookup for {ip}"))?
            .error_for_status()
            .context("timezone lookup rejected")?
            .text()
            .await
            .context("reading timezone lookup response")?;
        let info: IpInfoResponse =
            serde_json::from_str(&body).context("decoding timezone lookup response")?;

        timezone_from_response(ip, info)
    }
}

fn timezone_from_response(ip: IpAddr, info: IpInfoResponse) -> anyhow::Result<Tz> {
    let name = info
        .timezone
        .filter(|name| !name.is_empty())
        .with_context(|| format!("no timezone reported for {ip}"))?;
    name.parse()
        .map_err(|err| anyhow::anyhow!("unknown timezone {name:?} for {ip}: {err}"))
}

// ── Session model ────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Viewport {
    cols: u16,
    rows: u16,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Phase {
    Running,
    Quitting,
}

/// Everything a session reacts to. The event loop feeds these to
/// [`SessionState::apply`] one at a time, so each rendered frame reflects
/// exactly one event's effect.
#[derive(Clone, Copy, Debug)]
enum SessionEvent {
    Tick(DateTime<Utc>),
    Resize(u16, u16),
    QuitRequested,
}

struct SessionState {
    now: DateTime<Utc>,
    timezone: Tz,
    asset: Option<NormalizedAsset>,
    viewport: Viewport,
    reveal_override: bool,
    phase: Phase,
}

impl SessionState {
    fn new(
        now: DateTime<Utc>,
        timezone: Tz,
        asset: Option<NormalizedAsset>,
        viewport: Viewport,
        reveal_override: bool,
    ) -> Self {
        Self {
            now,
            timezone,
            asset,
            viewport,
            reveal_override,
            phase: Phase::Running,
        }
    }

    fn apply(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Tick(now) => self.now = now,
            // The asset chosen at session start is kept even if the new
            // viewport no longer holds it; the display may overflow.
            SessionEvent::Resize(cols, rows) => self.viewport = Viewport { cols, rows },
            SessionEvent::QuitRequested => self.phase = Phase::Quitting,
        }
    }

    /// Render the full display for the current state. Never fails: a
    /// missing asset shows as an empty art region.
    fn render(&self) -> String {
        let local = self.now.with_timezone(&self.timezone);

        let mut block: Vec<String> = Vec::new();
        block.push(format!("The time is {}", local.format("%H:%M:%S")));
        block.push(String::new());

        // 12-hour comparison: the art shows at 11:11 in the morning and
        // again at 23:11.
        let revealed = local.format("%I:%M").to_string() == REVEAL_CLOCK || self.reveal_override;
        if revealed {
            if let Some(asset) = &self.asset {
                block.extend(asset.lines.iter().cloned());
            }
        } else {
            block.push(format!("Come back at {REVEAL_CLOCK}"));
        }

        block.push(String::new());
        block.push("Press 'q' to quit".to_string());

        center_block(&block, self.viewport)
    }
}

/// Center a block of lines inside the viewport. Lines keep their relative
/// (left) alignment; the block as a whole gets equal margins, rounding
/// toward the top-left. The output has exactly `rows` lines unless the
/// block is taller, in which case it overflows rather than clips.
fn center_block(block: &[String], viewport: Viewport) -> String {
    let cols = viewport.cols as usize;
    let rows = viewport.rows as usize;

    let block_width = block.iter().map(|line| display_width(line)).max().unwrap_or(0);
    let margin = " ".repeat(cols.saturating_sub(block_width) / 2);
    let top = rows.saturating_sub(block.len()) / 2;

    let mut out: Vec<String> = Vec::with_capacity(rows.max(block.len()));
    out.resize(top, String::new());
    for line in block {
        if line.is_empty() {
            out.push(String::new());
        } else {
            out.push(format!("{margin}{line}"));
        }
    }
    while out.len() < rows {
        out.push(String::new());
    }

    out.join("\n")
}

// ── Frame codec ──────────────────────────────────────────────────────

fn encode_frame(msg_type: u8, payload: &[u8]) -> Vec<u8> {
    let len = (payload.len() + 1) as u32;
    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.push(msg_type);
    frame.extend_from_slice(payload);
    frame
}

/// Pop the next complete `(msg_type, data)` message off the front of a
/// receive buffer, or `None` if the buffer doesn't hold one yet. Empty
/// payloads are discarded.
fn parse_message(pending: &mut Vec<u8>) -> Option<(u8, Vec<u8>)> {
    loop {
        if pending.len() < 4 {
            return None;
        }
        let msg_len =
            u32::from_be_bytes([pending[0], pending[1], pending[2], pending[3]]) as usize;
        if pending.len() < 4 + msg_len {
            return None;
        }
        let payload: Vec<u8> = pending[4..4 + msg_len].to_vec();
        pending.drain(..4 + msg_len);
        if payload.is_empty() {
            continue;
        }
        return Some((payload[0], payload[1..].to_vec()));
    }
}

/// Buffered reader for the message stream coming from the transport
/// gateway.
struct MessageReader {
    reader: OwnedReadHalf,
    pending: Vec<u8>,
}

impl MessageReader {
    fn new(reader: OwnedReadHalf) -> Self {
        Self {
            reader,
            pending: Vec::new(),
        }
    }

    /// Next complete message, or `None` once the peer disconnects.
    async fn next(&mut self) -> Option<(u8, Vec<u8>)> {
        let mut buf = vec![0u8; 4096];
        loop {
            if let Some(message) = parse_message(&mut self.pending) {
                return Some(message);
            }
            let n = match self.reader.read(&mut buf).await {
                Ok(0) => return None,
                Ok(n) => n,
                Err(_) => return None,
            };
            self.pending.extend_from_slice(&buf[..n]);
        }
    }
}

async fn send_message(
    writer: &mut OwnedWriteHalf,
    msg_type: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    writer.write_all(&encode_frame(msg_type, payload)).await
}

// ── Session loop ─────────────────────────────────────────────────────

/// Process-wide read-only handles shared by every session.
struct SessionContext {
    pool: Arc<AssetPool>,
    resolver: TimezoneResolver,
    always_reveal: bool,
}

async fn run_session(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<SessionContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (read_half, mut writer) = stream.into_split();
    let mut messages = MessageReader::new(read_half);

    // The transport gateway announces the pty size before anything else.
    let viewport = match time::timeout(
        Duration::from_millis(HELLO_TIMEOUT_MS),
        messages.next(),
    )
    .await
    {
        Ok(Some((MSG_HELLO, data))) if data.len() >= 4 => Viewport {
            cols: u16::from_be_bytes([data[0], data[1]]),
            rows: u16::from_be_bytes([data[2], data[3]]),
        },
        Ok(Some((msg_type, _))) => {
            warn!(%addr, msg_type, "expected HELLO as first message, closing");
            return;
        }
        Ok(None) => return,
        Err(_) => {
            warn!(%addr, "no HELLO within handshake timeout, closing");
            return;
        }
    };

    // Setup-fatal for this session only: no fallback zone, no retry.
    let timezone = match ctx.resolver.resolve(addr.ip()).await {
        Ok(tz) => tz,
        Err(err) => {
            warn!(%addr, %err, "timezone resolution failed, closing session");
            return;
        }
    };

    let asset = select_fitting_asset(
        &ctx.pool,
        viewport.cols as usize,
        viewport.rows as usize,
        &mut rand::thread_rng(),
    );
    match &asset {
        Some(asset) => debug!(
            %addr,
            lines = asset.line_count,
            width = asset.max_line_width,
            "selected art"
        ),
        None => info!(%addr, cols = viewport.cols, rows = viewport.rows, "no art fits this viewport"),
    }

    let mut state = SessionState::new(
        Utc::now(),
        timezone,
        asset,
        viewport,
        ctx.always_reveal,
    );
    info!(%addr, tz = %timezone, cols = viewport.cols, rows = viewport.rows, "session started");

    if send_message(&mut writer, MSG_FRAME, state.render().as_bytes())
        .await
        .is_err()
    {
        return;
    }

    let mut ticks = time::interval(Duration::from_millis(TICK_INTERVAL_MS));

    loop {
        let event = tokio::select! {
            _ = ticks.tick() => SessionEvent::Tick(Utc::now()),
            msg = messages.next() => match msg {
                Some((MSG_RESIZE, data)) if data.len() >= 4 => SessionEvent::Resize(
                    u16::from_be_bytes([data[0], data[1]]),
                    u16::from_be_bytes([data[2], data[3]]),
                ),
                Some((MSG_KEY, data))
                    if matches!(data.first(), Some(&KEY_QUIT) | Some(&KEY_CTRL_C)) =>
                {
                    SessionEvent::QuitRequested
                }
                // Unknown types and malformed payloads are ignored.
                Some(_) => continue,
                // Peer disconnected.
                None => break,
            },
            _ = shutdown.changed() => SessionEvent::QuitRequested,
        };

        state.apply(event);

        if state.phase == Phase::Quitting {
            let _ = send_message(&mut writer, MSG_BYE, &[]).await;
            break;
        }
        if send_message(&mut writer, MSG_FRAME, state.render().as_bytes())
            .await
            .is_err()
        {
            break;
        }
    }

    info!(%addr, "session closed");
}

// ── Main ─────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_env()?;

    let pool = Arc::new(AssetPool::load(&config.art_dir));
    if pool.is_empty() {
        warn!(dir = %config.art_dir.display(), "art pool is empty, sessions render without art");
    } else {
        info!(assets = pool.len(), dir = %config.art_dir.display(), "art pool loaded");
    }

    let resolver = TimezoneResolver::new(config.ipinfo_token.clone(), config.forced_timezone)?;
    let ctx = Arc::new(SessionContext {
        pool,
        resolver,
        always_reveal: config.always_reveal,
    });

    // Bind failures are the one startup error that aborts the process.
    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("binding {}:{}", config.host, config.port))?;
    let local_addr = listener.local_addr().context("reading listener address")?;
    info!(%local_addr, "listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sessions: JoinSet<()> = JoinSet::new();

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    sessions.spawn(run_session(
                        stream,
                        addr,
                        Arc::clone(&ctx),
                        shutdown_rx.clone(),
                    ));
                }
                Err(err) => warn!(%err, "accept failed"),
            },
            // Reap finished sessions so the set doesn't grow unbounded.
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            _ = &mut shutdown => break,
        }
    }

    // Stop admitting connections, then give in-flight sessions a bounded
    // grace period before force-terminating the stragglers.
    drop(listener);
    let _ = shutdown_tx.send(true);
    info!(
        active = sessions.len(),
        grace_secs = SHUTDOWN_GRACE_SECS,
        "stopping, draining sessions"
    );

    let drained = time::timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), async {
        while sessions.join_next().await.is_some() {}
    })
    .await;

    match drained {
        Ok(()) => info!("all sessions closed, bye"),
        Err(_) => {
            warn!(remaining = sessions.len(), "grace period expired, aborting sessions");
            sessions.shutdown().await;
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut terminate =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                error!(%err, "cannot install SIGTERM handler");
                let _ = ctrl_c.await;
                return;
            }
        };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate.recv() => {}
    }
}

// ── Unit tests ───────────────────────────────────────────────────────
