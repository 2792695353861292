//! A minimal client for the VistA RPC broker ("XWB" new-style framing).
//!
//! Only what FMQL needs is implemented: connect, sign on with access/verify codes, create the
//! FMQL application context, and invoke RPCs that take literal parameters.

use crate::error::{CacheError, Result};
use crate::pool::{RpcConnector, RpcSession};
use std::fmt;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const PROTOCOL_PREFIX: &[u8] = b"[XWB]1130";
const END_OF_TRANSMISSION: u8 = 0x04;
const MAX_REPLY_BYTES: usize = 256 * 1024 * 1024;

/// Application context granting access to the FMQL RPC.
pub const DEFAULT_CONTEXT: &str = "CG FMQL QP USER";

/// The site's substitution table used to obscure sign-on strings on the wire.
///
/// The table is site configuration (20 rows of printable characters in a stock VistA), so it is
/// loaded from a file rather than compiled in.
#[derive(Clone, PartialEq, Eq)]
pub struct CipherPad {
    rows: Vec<Vec<char>>,
}

impl fmt::Debug for CipherPad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherPad")
            .field("rows", &self.rows.len())
            .finish_non_exhaustive()
    }
}

impl CipherPad {
    pub fn from_rows<I, S>(rows: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let rows: Vec<Vec<char>> = rows
            .into_iter()
            .map(|row| row.as_ref().chars().collect::<Vec<_>>())
            .filter(|row| !row.is_empty())
            .collect();
        if rows.len() < 2 || rows.len() > 94 {
            return Err(CacheError::transport(format!(
                "cipher pad needs between 2 and 94 rows, found {}",
                rows.len()
            )));
        }
        Ok(Self { rows })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text =
            std::fs::read_to_string(path).map_err(|err| CacheError::storage(path, err))?;
        Self::from_rows(text.lines())
    }

    /// Encrypt with two distinct randomly chosen rows.
    pub fn encrypt(&self, plain: &str) -> Result<String> {
        let mut seed = [0u8; 2];
        getrandom::getrandom(&mut seed)
            .map_err(|err| CacheError::transport(format!("no randomness for cipher: {err}")))?;
        let n = self.rows.len();
        let a = seed[0] as usize % n;
        let b = (a + 1 + seed[1] as usize % (n - 1)) % n;
        Ok(self.encrypt_with_rows(plain, a, b))
    }

    fn encrypt_with_rows(&self, plain: &str, a: usize, b: usize) -> String {
        let mut out = String::with_capacity(plain.len() + 2);
        out.push(row_marker(a));
        out.extend(plain.chars().map(|c| substitute(&self.rows[a], &self.rows[b], c)));
        out.push(row_marker(b));
        out
    }

    /// Inverse of [`CipherPad::encrypt`]; `None` if the row markers are not valid for this pad.
    pub fn decrypt(&self, cipher: &str) -> Option<String> {
        let chars: Vec<char> = cipher.chars().collect();
        let (&first, rest) = chars.split_first()?;
        let (&last, body) = rest.split_last()?;
        let a = row_index(first).filter(|&a| a < self.rows.len())?;
        let b = row_index(last).filter(|&b| b < self.rows.len())?;
        Some(
            body.iter()
                .map(|&c| substitute(&self.rows[b], &self.rows[a], c))
                .collect(),
        )
    }
}

fn row_marker(row: usize) -> char {
    char::from(b' ' + row as u8)
}

fn row_index(marker: char) -> Option<usize> {
    (marker as u32).checked_sub(' ' as u32).map(|i| i as usize)
}

fn substitute(from: &[char], to: &[char], c: char) -> char {
    from.iter()
        .position(|&x| x == c)
        .and_then(|i| to.get(i).copied())
        .unwrap_or(c)
}

/// Access and verify codes. Never printed.
#[derive(Clone)]
pub struct BrokerCredentials {
    pub access: String,
    pub verify: String,
}

impl fmt::Debug for BrokerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BrokerCredentials(<redacted>)")
    }
}

/// Opens signed-on broker sessions for a [`crate::ConnectionPool`].
#[derive(Clone, Debug)]
pub struct BrokerConnector {
    host: String,
    port: u16,
    credentials: BrokerCredentials,
    context: String,
    cipher: Arc<CipherPad>,
    timeout: Duration,
}

impl BrokerConnector {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        credentials: BrokerCredentials,
        cipher: CipherPad,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            credentials,
            context: DEFAULT_CONTEXT.to_owned(),
            cipher: Arc::new(cipher),
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// Connect timeout and per-read/per-write socket timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn open_stream(&self) -> Result<TcpStream> {
        let target = self.describe();
        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|err| CacheError::transport(format!("cannot resolve {target}: {err}")))?;
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    let configure = stream
                        .set_read_timeout(Some(self.timeout))
                        .and_then(|()| stream.set_write_timeout(Some(self.timeout)))
                        .and_then(|()| stream.set_nodelay(true));
                    configure.map_err(|err| {
                        CacheError::transport(format!("cannot configure socket to {target}: {err}"))
                    })?;
                    return Ok(stream);
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(CacheError::transport(match last_err {
            Some(err) => format!("cannot connect to {target}: {err}"),
            None => format!("{target} resolved to no addresses"),
        }))
    }
}

impl RpcConnector for BrokerConnector {
    fn connect(&self) -> Result<Box<dyn RpcSession>> {
        let stream = self.open_stream()?;
        let mut session = BrokerSession {
            stream,
            target: self.describe(),
            signed_on: false,
        };
        session.sign_on(&self.credentials, &self.context, &self.cipher)?;
        Ok(Box::new(session))
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One TCP connection to the broker, signed on and in the FMQL context.
#[derive(Debug)]
pub struct BrokerSession {
    stream: TcpStream,
    target: String,
    signed_on: bool,
}

impl BrokerSession {
    fn sign_on(
        &mut self,
        credentials: &BrokerCredentials,
        context: &str,
        cipher: &CipherPad,
    ) -> Result<()> {
        let local = self
            .stream
            .local_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|_| "127.0.0.1".to_owned());
        let accept = self.call(
            "TCPConnect",
            &[local, "0".to_owned(), "vdm".to_owned()],
            true,
        )?;
        if !String::from_utf8_lossy(&accept).contains("accept") {
            return Err(CacheError::transport(format!(
                "{} refused the connection handshake",
                self.target
            )));
        }

        self.call("XUS SIGNON SETUP", &[], false)?;

        let av = cipher.encrypt(&format!("{};{}", credentials.access, credentials.verify))?;
        let reply = self.call("XUS AV CODE", &[av], false)?;
        let reply = String::from_utf8_lossy(&reply);
        let mut lines = reply.split(['\r', '\n']).filter(|line| !line.is_empty());
        let duz = lines.next().unwrap_or("0").trim();
        if duz == "0" || duz.is_empty() {
            // The broker's own explanation is the fourth line of the reply.
            let reason = lines.nth(2).unwrap_or("sign-on rejected").trim().to_owned();
            return Err(CacheError::transport(format!(
                "sign-on to {} failed: {reason}",
                self.target
            )));
        }

        let reply = self.call("XWB CREATE CONTEXT", &[cipher.encrypt(context)?], false)?;
        if String::from_utf8_lossy(&reply).trim() != "1" {
            return Err(CacheError::transport(format!(
                "{} refused application context {context:?}",
                self.target
            )));
        }

        self.signed_on = true;
        tracing::debug!(target = "vdm.cache", broker = %self.target, "signed on to broker");
        Ok(())
    }

    fn call(&mut self, name: &str, params: &[String], command: bool) -> Result<Vec<u8>> {
        let request = encode_request(name, params, command)?;
        self.stream
            .write_all(&request)
            .map_err(|err| CacheError::transport(format!("write to {}: {err}", self.target)))?;
        let raw = read_until_eot(&mut self.stream)
            .map_err(|err| CacheError::transport(format!("read from {}: {err}", self.target)))?;
        decode_reply(&raw)
    }
}

impl RpcSession for BrokerSession {
    fn invoke(&mut self, rpc: &str, params: &[String]) -> Result<Vec<u8>> {
        self.call(rpc, params, false)
    }
}

impl Drop for BrokerSession {
    fn drop(&mut self) {
        if self.signed_on {
            if let Ok(request) = encode_request("#BYE#", &[], true) {
                let _ = self.stream.write_all(&request);
            }
        }
    }
}

/// Frame one broker request.
pub fn encode_request(name: &str, params: &[String], command: bool) -> Result<Vec<u8>> {
    let name_len = u8::try_from(name.len())
        .map_err(|_| CacheError::transport(format!("RPC name too long: {} bytes", name.len())))?;

    let params_len: usize = params.iter().map(String::len).sum();
    let mut out = Vec::with_capacity(32 + name.len() + params_len);
    out.extend_from_slice(PROTOCOL_PREFIX);
    if command {
        out.push(b'4');
    } else {
        out.extend_from_slice(b"2\x011");
    }
    out.push(name_len);
    out.extend_from_slice(name.as_bytes());

    out.push(b'5');
    if params.is_empty() {
        out.extend_from_slice(b"4f");
    }
    for param in params {
        if param.len() > 999 {
            return Err(CacheError::transport(format!(
                "literal parameter of {name} too long: {} bytes",
                param.len()
            )));
        }
        out.push(b'0');
        out.extend_from_slice(format!("{:03}", param.len()).as_bytes());
        out.extend_from_slice(param.as_bytes());
        out.push(b'f');
    }
    out.push(END_OF_TRANSMISSION);
    Ok(out)
}

/// Split a reply (without its terminator) into its status segments and body.
pub fn decode_reply(raw: &[u8]) -> Result<Vec<u8>> {
    let (security, rest) = take_segment(raw)?;
    let (error, body) = take_segment(rest)?;
    if !security.is_empty() || !error.is_empty() {
        let mut message = String::from_utf8_lossy(security).into_owned();
        if !error.is_empty() {
            if !message.is_empty() {
                message.push_str("; ");
            }
            message.push_str(&String::from_utf8_lossy(error));
        }
        return Err(CacheError::transport(format!("broker error: {message}")));
    }
    if body.starts_with(b"M  ERROR") {
        return Err(CacheError::transport(format!(
            "broker M error: {}",
            String::from_utf8_lossy(body).trim()
        )));
    }
    Ok(body.to_vec())
}

fn take_segment(bytes: &[u8]) -> Result<(&[u8], &[u8])> {
    let (&len, rest) = bytes
        .split_first()
        .ok_or_else(|| CacheError::transport("truncated broker reply"))?;
    let len = len as usize;
    if rest.len() < len {
        return Err(CacheError::transport("truncated broker reply"));
    }
    Ok(rest.split_at(len))
}

fn read_until_eot(stream: &mut impl Read) -> std::io::Result<Vec<u8>> {
    let mut reply = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "broker closed the connection mid-reply",
            ));
        }
        if let Some(end) = chunk[..n].iter().position(|&b| b == END_OF_TRANSMISSION) {
            reply.extend_from_slice(&chunk[..end]);
            return Ok(reply);
        }
        reply.extend_from_slice(&chunk[..n]);
        if reply.len() > MAX_REPLY_BYTES {
            return Err(std::io::Error::other("broker reply exceeds size limit"));
        }
    }
}
