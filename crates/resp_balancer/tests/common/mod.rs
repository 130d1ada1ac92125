//! Shared helpers for integration tests.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Timeout for balancer startup and command round-trips.
pub const IO_TIMEOUT: Duration = Duration::from_secs(20);
/// Timeout for individual RESP read/write operations.
pub const RESP_TIMEOUT: Duration = Duration::from_secs(5);

/// Simple wrapper around a spawned balancer process and its log paths.
pub struct BalancerProcess {
    pub child: Child,
    stderr_path: PathBuf,
}

impl BalancerProcess {
    /// Best-effort read of the captured stderr log.
    pub fn read_stderr(&self) -> String {
        std::fs::read_to_string(&self.stderr_path).unwrap_or_default()
    }

    /// Panic if the process has already exited.
    pub fn assert_running(&mut self, context: &str) {
        if let Ok(Some(status)) = self.child.try_wait() {
            let stderr = self.read_stderr();
            panic!("resp-balancer exited early ({context}) with status {status}\nstderr:\n{stderr}");
        }
    }
}

impl Drop for BalancerProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

/// Spawn a balancer process against the given config body and capture its
/// stderr to a log file.
pub fn spawn_balancer(dir: &Path, listen: SocketAddr, config_body: &str) -> BalancerProcess {
    let _ = std::fs::create_dir_all(dir);
    let config_path = dir.join("balancer.toml");
    std::fs::write(&config_path, config_body).expect("write test config");

    let stderr_path = dir.join("resp-balancer.err.log");
    let stderr_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&stderr_path)
        .expect("open stderr log");

    let child = Command::new(balancer_bin())
        .arg("-l")
        .arg(listen.to_string())
        .arg("-c")
        .arg(&config_path)
        .arg("-L")
        .arg("debug")
        .stdout(Stdio::null())
        .stderr(Stdio::from(stderr_file))
        .spawn()
        .expect("failed to spawn resp-balancer");

    BalancerProcess { child, stderr_path }
}

/// Locate the resp-balancer binary built by cargo.
pub fn balancer_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_resp-balancer"))
}

/// Wait for a TCP port to accept connections.
pub fn wait_for_port(addr: SocketAddr, timeout: Duration) {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(addr).is_ok() {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    panic!("port {addr} did not open in time");
}

/// Pick an available local port by binding to port 0.
pub fn pick_free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind port 0");
    listener.local_addr().expect("local addr")
}

/// Build a per-test directory under the target temp folder.
pub fn test_dir(name: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let pid = std::process::id();
    std::env::temp_dir().join(format!("resp-balancer-{name}-{pid}-{ts}"))
}

/// Best-effort cleanup of a test directory.
pub fn cleanup_dir(path: &Path) {
    let _ = std::fs::remove_dir_all(path);
}

// --------------------------------------------------------------------
// Raw RESP client

/// RESP connection wrapper that preserves buffered reads between commands.
pub struct RespConn {
    reader: BufReader<TcpStream>,
}

impl RespConn {
    /// Connect with read/write timeouts.
    pub fn connect(addr: SocketAddr) -> RespConn {
        let stream = TcpStream::connect(addr).expect("connect balancer");
        stream.set_read_timeout(Some(RESP_TIMEOUT)).ok();
        stream.set_write_timeout(Some(RESP_TIMEOUT)).ok();
        stream.set_nodelay(true).ok();
        RespConn {
            reader: BufReader::new(stream),
        }
    }

    /// Send one RESP command built from bulk string arguments.
    pub fn write_command(&mut self, parts: &[&str]) -> std::io::Result<()> {
        let buf = encode_command(parts);
        let stream = self.reader.get_mut();
        stream.write_all(&buf)?;
        stream.flush()
    }

    /// Send several commands in a single write so they arrive pipelined.
    pub fn write_pipeline(&mut self, commands: &[&[&str]]) -> std::io::Result<()> {
        let mut buf = Vec::new();
        for parts in commands {
            buf.extend_from_slice(&encode_command(parts));
        }
        let stream = self.reader.get_mut();
        stream.write_all(&buf)?;
        stream.flush()
    }

    /// Send a command and return its raw reply.
    pub fn send_command(&mut self, parts: &[&str]) -> std::io::Result<Vec<u8>> {
        self.write_command(parts)?;
        self.read_reply()
    }

    /// Read one raw RESP reply.
    pub fn read_reply(&mut self) -> std::io::Result<Vec<u8>> {
        read_resp(&mut self.reader)
    }
}

fn encode_command(parts: &[&str]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(format!("*{}\r\n", parts.len()).as_bytes());
    for part in parts {
        buf.extend_from_slice(format!("${}\r\n", part.len()).as_bytes());
        buf.extend_from_slice(part.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf
}

/// Parse a RESP reply into raw bytes, arrays included.
fn read_resp(reader: &mut BufReader<TcpStream>) -> std::io::Result<Vec<u8>> {
    let mut first = [0u8; 1];
    read_exact_with_timeout(reader, &mut first)?;
    match first[0] {
        b'+' | b'-' | b':' => {
            let mut line = Vec::new();
            read_until_with_timeout(reader, &mut line)?;
            let mut out = vec![first[0]];
            out.extend_from_slice(&line);
            Ok(out)
        }
        b'$' => {
            let mut line = Vec::new();
            read_until_with_timeout(reader, &mut line)?;
            let len = parse_prefix_len(&line);
            let mut out = vec![first[0]];
            out.extend_from_slice(&line);
            if len >= 0 {
                let mut data = vec![0u8; len as usize + 2];
                read_exact_with_timeout(reader, &mut data)?;
                out.extend_from_slice(&data);
            }
            Ok(out)
        }
        b'*' => {
            let mut line = Vec::new();
            read_until_with_timeout(reader, &mut line)?;
            let len = parse_prefix_len(&line);
            let mut out = vec![first[0]];
            out.extend_from_slice(&line);
            for _ in 0..len.max(0) {
                out.extend_from_slice(&read_resp(reader)?);
            }
            Ok(out)
        }
        other => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected resp prefix {other}"),
        )),
    }
}

/// Extract the payload of a raw bulk string reply.
pub fn parse_bulk(raw: &[u8]) -> Option<Vec<u8>> {
    if raw.first() != Some(&b'$') {
        return None;
    }
    let header_end = raw.windows(2).position(|w| w == b"\r\n")?;
    let len: i64 = std::str::from_utf8(&raw[1..header_end]).ok()?.parse().ok()?;
    if len < 0 {
        return None;
    }
    let start = header_end + 2;
    raw.get(start..start + len as usize).map(|b| b.to_vec())
}

/// Parse the length line of a bulk or array header.
fn parse_prefix_len(line: &[u8]) -> i64 {
    let text = std::str::from_utf8(line).expect("resp len utf8");
    text.trim().parse::<i64>().expect("parse resp len")
}

fn read_exact_with_timeout(
    reader: &mut BufReader<TcpStream>,
    buf: &mut [u8],
) -> std::io::Result<()> {
    let start = std::time::Instant::now();
    let mut offset = 0usize;
    while offset < buf.len() {
        match reader.read(&mut buf[offset..]) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream closed",
                ));
            }
            Ok(n) => offset += n,
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                if start.elapsed() >= RESP_TIMEOUT {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "resp read timed out",
                    ));
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn read_until_with_timeout(
    reader: &mut BufReader<TcpStream>,
    line: &mut Vec<u8>,
) -> std::io::Result<()> {
    let start = std::time::Instant::now();
    loop {
        match reader.read_until(b'\n', line) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream closed",
                ));
            }
            Ok(_) if line.ends_with(b"\n") => return Ok(()),
            Ok(_) => {}
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                if start.elapsed() >= RESP_TIMEOUT {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "resp read timed out",
                    ));
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(err) => return Err(err),
        }
    }
}

// --------------------------------------------------------------------
// Fake upstream node

/// Minimal RESP server standing in for one store node. Replies to the
/// balancer's probe with a configurable leader address and records every
/// command it receives.
pub struct FakeUpstream {
    pub addr: SocketAddr,
    commands: Arc<Mutex<Vec<Vec<String>>>>,
    leader_addr: Arc<Mutex<String>>,
}

impl FakeUpstream {
    /// Bind a listener and serve connections on background threads.
    pub fn start() -> FakeUpstream {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake upstream");
        let addr = listener.local_addr().expect("local addr");
        let commands: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let leader_addr = Arc::new(Mutex::new(String::new()));

        let conn_commands = Arc::clone(&commands);
        let conn_leader = Arc::clone(&leader_addr);
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else {
                    return;
                };
                let commands = Arc::clone(&conn_commands);
                let leader = Arc::clone(&conn_leader);
                std::thread::spawn(move || serve_upstream_conn(stream, commands, leader));
            }
        });

        FakeUpstream {
            addr,
            commands,
            leader_addr,
        }
    }

    pub fn addr_string(&self) -> String {
        self.addr.to_string()
    }

    /// Address returned by RAFTLEADER probes from now on.
    pub fn set_leader(&self, addr: &str) {
        if let Ok(mut leader) = self.leader_addr.lock() {
            *leader = addr.to_string();
        }
    }

    /// Commands received so far, in arrival order.
    pub fn received(&self) -> Vec<Vec<String>> {
        self.commands
            .lock()
            .map(|commands| commands.clone())
            .unwrap_or_default()
    }

    /// Wait until a received command satisfies the predicate.
    pub fn wait_for_command(
        &self,
        timeout: Duration,
        predicate: impl Fn(&[String]) -> bool,
    ) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if self.received().iter().any(|cmd| predicate(cmd)) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }
}

fn serve_upstream_conn(
    stream: TcpStream,
    commands: Arc<Mutex<Vec<Vec<String>>>>,
    leader: Arc<Mutex<String>>,
) {
    stream.set_nodelay(true).ok();
    let mut reader = BufReader::new(stream);
    loop {
        let cmd = match read_command(&mut reader) {
            Ok(Some(cmd)) => cmd,
            Ok(None) | Err(_) => return,
        };
        let parts: Vec<String> = cmd
            .iter()
            .map(|arg| String::from_utf8_lossy(arg).to_string())
            .collect();
        let verb = parts
            .first()
            .map(|v| v.to_ascii_uppercase())
            .unwrap_or_default();

        // Probes are not interesting to assertions; record the rest.
        if verb != "RAFTLEADER" && verb != "PING" {
            if let Ok(mut recorded) = commands.lock() {
                recorded.push(parts.clone());
            }
        }

        let reply: Vec<u8> = match verb.as_str() {
            "RAFTLEADER" => {
                let leader = leader.lock().map(|l| l.clone()).unwrap_or_default();
                bulk_reply(leader.as_bytes())
            }
            "PING" => b"+PONG\r\n".to_vec(),
            "GET" => bulk_reply(format!("v:{}", parts.get(1).cloned().unwrap_or_default()).as_bytes()),
            "SET" | "MSET" | "JSET" => b"+OK\r\n".to_vec(),
            "MGET" => {
                let mut out = format!("*{}\r\n", parts.len().saturating_sub(1)).into_bytes();
                for key in &parts[1..] {
                    out.extend_from_slice(&bulk_reply(format!("v:{key}").as_bytes()));
                }
                out
            }
            _ => b"-ERR unknown command\r\n".to_vec(),
        };

        let stream = reader.get_mut();
        if stream.write_all(&reply).is_err() {
            return;
        }
        stream.flush().ok();
    }
}

fn bulk_reply(payload: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", payload.len()).into_bytes();
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\r\n");
    out
}

/// Read one RESP array command; `None` on a clean EOF.
fn read_command(reader: &mut BufReader<TcpStream>) -> std::io::Result<Option<Vec<Vec<u8>>>> {
    let mut first = [0u8; 1];
    match reader.read_exact(&mut first) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    if first[0] != b'*' {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "expected array command",
        ));
    }

    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line)?;
    let count = parse_prefix_len(&line).max(0) as usize;

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let mut header = [0u8; 1];
        reader.read_exact(&mut header)?;
        if header[0] != b'$' {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "expected bulk argument",
            ));
        }
        let mut line = Vec::new();
        reader.read_until(b'\n', &mut line)?;
        let len = parse_prefix_len(&line).max(0) as usize;
        let mut payload = vec![0u8; len + 2];
        reader.read_exact(&mut payload)?;
        payload.truncate(len);
        args.push(payload);
    }
    Ok(Some(args))
}
