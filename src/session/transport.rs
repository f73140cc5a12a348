use super::*;

use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::PoisonError;

use async_ssh2_tokio::client::{AuthMethod, Client};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;

/// Uniform byte stream over whichever connection backs a session.
///
/// `read` returning `Ok(0)` means the peer closed the stream.
#[async_trait]
pub trait Transport: Send {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ConnectError>;

    async fn write(&mut self, data: &[u8]) -> Result<usize, ConnectError>;

    async fn close(&mut self) -> Result<(), ConnectError>;
}

/// Reader and writer of an interactive SSH shell.
///
/// Produced by [`Operator::init_ssh`]; vendors needing a special shell
/// invocation build one with [`SshShell::new`].
pub struct SshShell {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl SshShell {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Wraps a channel on which a shell has already been requested.
    pub fn from_channel(channel: russh::Channel<russh::client::Msg>) -> Self {
        let (reader, writer) = tokio::io::split(channel.into_stream());
        Self::new(reader, writer)
    }
}

/// Interactive shell over an authenticated SSH client.
pub struct SshTransport {
    client: Client,
    shell: SshShell,
}

impl SshTransport {
    /// Dials, authenticates with a password, and lets the operator open the shell.
    pub async fn dial(
        request: &CliRequest,
        operator: &dyn Operator,
        options: &DialOptions,
    ) -> Result<SshTransport, ConnectError> {
        let (host, port) = split_address(&request.address)?;
        let config = async_ssh2_tokio::Config {
            preferred: options.preferred(),
            ..Default::default()
        };

        let connect = Client::connect_with_config(
            (host, port),
            &request.credentials.username,
            AuthMethod::with_password(&request.credentials.password),
            options.server_check.clone(),
            config,
        );
        let client = match tokio::time::timeout(options.connect_timeout, connect).await {
            Ok(Ok(client)) => client,
            Ok(Err(err)) => {
                error!("{} dial {} error {}", request.log_prefix, request.address, err);
                return Err(ConnectError::DialFailure {
                    addr: request.address.clone(),
                    reason: err.to_string(),
                });
            }
            Err(_) => return Err(ConnectError::DialTimeout(request.address.clone())),
        };
        debug!("{} {} TCP connection successful", request.log_prefix, request.address);

        let shell = match operator.init_ssh(&client).await {
            Ok(shell) => shell,
            Err(err) => {
                let _ = client.disconnect().await;
                return Err(ConnectError::DialFailure {
                    addr: request.address.clone(),
                    reason: format!("shell init failed, {err}"),
                });
            }
        };
        debug!("{} {} Shell request successful", request.log_prefix, request.address);

        Ok(Self { client, shell })
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ConnectError> {
        self.shell
            .reader
            .read(buf)
            .await
            .map_err(|e| ConnectError::ReadFailure(e.to_string()))
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize, ConnectError> {
        self.shell
            .writer
            .write_all(data)
            .await
            .map_err(|e| ConnectError::WriteFailure(e.to_string()))?;
        self.shell
            .writer
            .flush()
            .await
            .map_err(|e| ConnectError::WriteFailure(e.to_string()))?;
        Ok(data.len())
    }

    async fn close(&mut self) -> Result<(), ConnectError> {
        if let Err(e) = self.shell.writer.shutdown().await {
            debug!("Failed to send eof to shell: {:?}", e);
        }
        if self.client.is_closed() {
            warn!("ssh conn already closed when close");
            return Ok(());
        }
        self.client.disconnect().await?;
        Ok(())
    }
}

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TelnetState {
    Data,
    Iac,
    Option(u8),
    Sub,
    SubIac,
}

/// Strips Telnet commands from inbound bytes and refuses every option.
#[derive(Debug)]
struct TelnetParser {
    state: TelnetState,
}

impl TelnetParser {
    fn new() -> Self {
        Self {
            state: TelnetState::Data,
        }
    }

    /// Appends payload bytes of `input` to `data` and negotiation answers to `replies`.
    ///
    /// Parser state carries over, so a command split across reads is handled.
    fn feed(&mut self, input: &[u8], data: &mut Vec<u8>, replies: &mut Vec<u8>) {
        for &b in input {
            self.state = match (self.state, b) {
                (TelnetState::Data, IAC) => TelnetState::Iac,
                (TelnetState::Data, _) => {
                    data.push(b);
                    TelnetState::Data
                }
                (TelnetState::Iac, IAC) => {
                    data.push(IAC);
                    TelnetState::Data
                }
                (TelnetState::Iac, DO | DONT | WILL | WONT) => TelnetState::Option(b),
                (TelnetState::Iac, SB) => TelnetState::Sub,
                (TelnetState::Iac, _) => TelnetState::Data,
                (TelnetState::Option(cmd), opt) => {
                    match cmd {
                        DO => replies.extend_from_slice(&[IAC, WONT, opt]),
                        WILL => replies.extend_from_slice(&[IAC, DONT, opt]),
                        _ => {}
                    }
                    TelnetState::Data
                }
                (TelnetState::Sub, IAC) => TelnetState::SubIac,
                (TelnetState::Sub, _) => TelnetState::Sub,
                (TelnetState::SubIac, SE) => TelnetState::Data,
                (TelnetState::SubIac, _) => TelnetState::Sub,
            };
        }
    }
}

fn escape_iac(data: &[u8]) -> Cow<'_, [u8]> {
    if !data.contains(&IAC) {
        return Cow::Borrowed(data);
    }
    let mut out = Vec::with_capacity(data.len() + 1);
    for &b in data {
        out.push(b);
        if b == IAC {
            out.push(IAC);
        }
    }
    Cow::Owned(out)
}

/// Raw Telnet byte stream over TCP.
pub struct TelnetTransport {
    stream: TcpStream,
    parser: TelnetParser,
    raw: Vec<u8>,
    closed: bool,
}

impl TelnetTransport {
    pub async fn dial(request: &CliRequest, options: &DialOptions) -> Result<Self, ConnectError> {
        let (host, port) = split_address(&request.address)?;
        let stream =
            match tokio::time::timeout(options.connect_timeout, TcpStream::connect((host, port)))
                .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    return Err(ConnectError::DialFailure {
                        addr: request.address.clone(),
                        reason: err.to_string(),
                    });
                }
                Err(_) => return Err(ConnectError::DialTimeout(request.address.clone())),
            };
        debug!("{} {} telnet connected", request.log_prefix, request.address);
        Ok(Self {
            stream,
            parser: TelnetParser::new(),
            raw: Vec::new(),
            closed: false,
        })
    }
}

#[async_trait]
impl Transport for TelnetTransport {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ConnectError> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.raw.resize(buf.len(), 0);
        loop {
            let n = self
                .stream
                .read(&mut self.raw)
                .await
                .map_err(|e| ConnectError::ReadFailure(e.to_string()))?;
            if n == 0 {
                return Ok(0);
            }
            let mut data = Vec::with_capacity(n);
            let mut replies = Vec::new();
            self.parser.feed(&self.raw[..n], &mut data, &mut replies);
            if !replies.is_empty() {
                trace!("telnet negotiation reply {:?}", replies);
                self.stream
                    .write_all(&replies)
                    .await
                    .map_err(|e| ConnectError::WriteFailure(e.to_string()))?;
            }
            // Filtered output never exceeds the raw read.
            if !data.is_empty() {
                buf[..data.len()].copy_from_slice(&data);
                return Ok(data.len());
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize, ConnectError> {
        self.stream
            .write_all(&escape_iac(data))
            .await
            .map_err(|e| ConnectError::WriteFailure(e.to_string()))?;
        Ok(data.len())
    }

    async fn close(&mut self) -> Result<(), ConnectError> {
        if self.closed {
            warn!("telnet conn already closed when close");
            return Ok(());
        }
        self.closed = true;
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Splits `host:port`, accepting bracketed IPv6 hosts.
fn split_address(address: &str) -> Result<(String, u16), ConnectError> {
    let malformed = || ConnectError::DialFailure {
        addr: address.to_string(),
        reason: "malformed address, expected host:port".to_string(),
    };
    let (host, port) = address.rsplit_once(':').ok_or_else(malformed)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(malformed());
    }
    let port = port.parse::<u16>().map_err(|_| malformed())?;
    Ok((host.to_string(), port))
}

/// Opens transports for the registry.
///
/// The registry dials through this seam so tests and embedders can supply
/// their own byte streams.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        request: &CliRequest,
        operator: &dyn Operator,
        options: &DialOptions,
    ) -> Result<Box<dyn Transport>, ConnectError>;
}

/// Dials real SSH and Telnet connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkConnector;

#[async_trait]
impl Connector for NetworkConnector {
    async fn connect(
        &self,
        request: &CliRequest,
        operator: &dyn Operator,
        options: &DialOptions,
    ) -> Result<Box<dyn Transport>, ConnectError> {
        match request.protocol()? {
            Protocol::Ssh => Ok(Box::new(
                SshTransport::dial(request, operator, options).await?,
            )),
            Protocol::Telnet => Ok(Box::new(TelnetTransport::dial(request, options).await?)),
        }
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    readable: VecDeque<Vec<u8>>,
    replies: VecDeque<Vec<Vec<u8>>>,
    default_reply: Option<Vec<Vec<u8>>>,
    written: Vec<Vec<u8>>,
    read_error: Option<String>,
    write_error: Option<String>,
    eof: bool,
    closed: bool,
    overlapping_writes: usize,
}

/// In-memory transport that answers writes with scripted output.
///
/// Each write releases the next queued reply (or the default reply once the
/// queue is empty); each reply chunk is delivered by a separate read. With
/// nothing readable and no error configured, reads wait forever, which is
/// how an unresponsive device behaves. Clones share state, so a test can
/// keep one handle while the session owns another.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    state: Arc<std::sync::Mutex<ScriptState>>,
    notify: Arc<Notify>,
}

fn to_chunks<I, S>(chunks: I) -> Vec<Vec<u8>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    chunks.into_iter().map(|c| c.as_ref().to_vec()).collect()
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Output readable before anything is written (banner, login prompt).
    pub fn with_greeting<I, S>(self, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        self.lock().readable.extend(to_chunks(chunks));
        self
    }

    /// Queues the output released by the next unanswered write.
    pub fn with_reply<I, S>(self, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        self.lock().replies.push_back(to_chunks(chunks));
        self
    }

    /// Output released by writes once the reply queue is empty.
    pub fn with_default_reply<I, S>(self, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        self.lock().default_reply = Some(to_chunks(chunks));
        self
    }

    /// Reads fail with `message` once readable output is drained.
    pub fn with_read_error(self, message: impl Into<String>) -> Self {
        self.lock().read_error = Some(message.into());
        self
    }

    /// Reads return end-of-stream once readable output is drained.
    pub fn with_eof(self) -> Self {
        self.lock().eof = true;
        self
    }

    /// Makes every following write fail (or succeed again with `None`).
    pub fn set_write_error(&self, message: Option<String>) {
        self.lock().write_error = message;
        self.notify.notify_one();
    }

    /// Makes reads fail once readable output is drained.
    pub fn set_read_error(&self, message: Option<String>) {
        self.lock().read_error = message;
        self.notify.notify_one();
    }

    /// Everything written so far, one entry per write.
    pub fn written(&self) -> Vec<String> {
        self.lock()
            .written
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Writes issued while output of an earlier write was still unread.
    pub fn overlapping_writes(&self) -> usize {
        self.lock().overlapping_writes
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ConnectError> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if state.closed {
                    return Err(ConnectError::ReadFailure("use of closed transport".to_string()));
                }
                if let Some(mut chunk) = state.readable.pop_front() {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        chunk.drain(..n);
                        state.readable.push_front(chunk);
                    }
                    return Ok(n);
                }
                if let Some(message) = state.read_error.clone() {
                    return Err(ConnectError::ReadFailure(message));
                }
                if state.eof {
                    return Ok(0);
                }
            }
            notified.await;
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize, ConnectError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(ConnectError::WriteFailure("use of closed transport".to_string()));
            }
            if let Some(message) = state.write_error.clone() {
                return Err(ConnectError::WriteFailure(message));
            }
            if !state.readable.is_empty() {
                state.overlapping_writes += 1;
            }
            state.written.push(data.to_vec());
            let reply = match state.replies.pop_front() {
                Some(reply) => Some(reply),
                None => state.default_reply.clone(),
            };
            if let Some(reply) = reply {
                state.readable.extend(reply);
            }
        }
        self.notify.notify_one();
        Ok(data.len())
    }

    async fn close(&mut self) -> Result<(), ConnectError> {
        self.lock().closed = true;
        self.notify.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut TelnetParser, input: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut data = Vec::new();
        let mut replies = Vec::new();
        parser.feed(input, &mut data, &mut replies);
        (data, replies)
    }

    #[test]
    fn telnet_parser_refuses_options() {
        let mut parser = TelnetParser::new();
        let (data, replies) = feed(&mut parser, &[IAC, DO, 24, b'o', b'k', IAC, WILL, 1]);
        assert_eq!(data, b"ok");
        assert_eq!(replies, vec![IAC, WONT, 24, IAC, DONT, 1]);
    }

    #[test]
    fn telnet_parser_handles_split_commands_and_escaped_iac() {
        let mut parser = TelnetParser::new();
        let (data, replies) = feed(&mut parser, &[b'a', IAC]);
        assert_eq!(data, b"a");
        assert!(replies.is_empty());
        let (data, replies) = feed(&mut parser, &[IAC, b'b', IAC, DONT, 3]);
        assert_eq!(data, vec![IAC, b'b']);
        assert!(replies.is_empty());
    }

    #[test]
    fn telnet_parser_skips_subnegotiation() {
        let mut parser = TelnetParser::new();
        let (data, _) = feed(&mut parser, &[IAC, SB, 24, 1, IAC, SE, b'x']);
        assert_eq!(data, b"x");
    }

    #[test]
    fn escape_iac_doubles_iac_bytes() {
        assert_eq!(escape_iac(b"plain").as_ref(), b"plain");
        assert_eq!(escape_iac(&[1, IAC, 2]).as_ref(), &[1, IAC, IAC, 2]);
    }

    #[test]
    fn split_address_parses_host_and_port() {
        assert_eq!(
            split_address("10.0.0.1:22").unwrap(),
            ("10.0.0.1".to_string(), 22)
        );
        assert_eq!(split_address("[::1]:23").unwrap(), ("::1".to_string(), 23));
        assert!(matches!(
            split_address("10.0.0.1"),
            Err(ConnectError::DialFailure { .. })
        ));
        assert!(split_address("host:notaport").is_err());
    }

    #[tokio::test]
    async fn scripted_transport_releases_reply_on_write() {
        let mut transport = ScriptedTransport::new()
            .with_greeting(["Router> "])
            .with_reply(["show clock\r\n", "12:00\r\nRouter> "]);
        let handle = transport.clone();
        let mut buf = [0u8; 64];

        let n = transport.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"Router> ");

        transport.write(b"show clock\n").await.unwrap();
        let n = transport.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"show clock\r\n");
        assert_eq!(handle.written(), vec!["show clock\n"]);
        assert_eq!(handle.overlapping_writes(), 0);
    }

    #[tokio::test]
    async fn scripted_transport_counts_overlapping_writes() {
        let mut transport = ScriptedTransport::new().with_default_reply(["Router> "]);
        let handle = transport.clone();
        transport.write(b"\n").await.unwrap();
        transport.write(b"\n").await.unwrap();
        assert_eq!(handle.overlapping_writes(), 1);
    }

    #[tokio::test]
    async fn scripted_transport_fails_after_close() {
        let mut transport = ScriptedTransport::new();
        transport.close().await.unwrap();
        assert!(transport.is_closed());
        assert!(matches!(
            transport.write(b"x").await,
            Err(ConnectError::WriteFailure(_))
        ));
    }
}
