use super::*;

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Mode every session starts in.
pub const INITIAL_MODE: &str = "login";

/// One live device connection.
///
/// A session is a physical-connection cache: the request and operator it
/// serves are rebound on every acquisition, while the transport and the
/// confirmed CLI mode persist between requests.
pub struct Session {
    id: u64,
    address: String,
    protocol: Protocol,
    transport: Box<dyn Transport>,
    /// Last mode confirmed by a completed transition.
    mode: String,
    request: CliRequest,
    operator: Arc<dyn Operator>,
    read_chunk_size: usize,
    default_timeout: Duration,
    stop: CancellationToken,
    closed: bool,
}

/// Length of a truncated UTF-8 sequence at the end of `bytes`, if any.
fn incomplete_tail_len(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let tail = &bytes[bytes.len() - back..];
        if let Err(e) = std::str::from_utf8(tail)
            && e.valid_up_to() == 0
            && e.error_len().is_none()
        {
            return back;
        }
    }
    0
}

/// Decodes `chunk` after any incomplete UTF-8 tail left by the previous read.
fn decode_chunk(pending: &mut Vec<u8>, chunk: &[u8]) -> String {
    pending.extend_from_slice(chunk);
    let valid = match std::str::from_utf8(&pending[..]) {
        Ok(_) => pending.len(),
        // An incomplete sequence at the very end waits for the next chunk.
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => pending.len() - incomplete_tail_len(&pending[..]),
    };
    let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
    pending.drain(..valid);
    text
}

impl Session {
    /// Wraps a freshly dialed transport.
    ///
    /// SSH shells print a banner and the login prompt before accepting
    /// input, so one read cycle consumes them here. If that read fails the
    /// transport is closed and the failure is reported as a dial failure.
    pub async fn open(
        request: CliRequest,
        operator: Arc<dyn Operator>,
        transport: Box<dyn Transport>,
        config: &EngineConfig,
    ) -> Result<Session, ConnectError> {
        let protocol = request.protocol()?;
        debug!("{} creating cli conn...", request.log_prefix);
        let mut session = Session {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            address: request.address.clone(),
            protocol,
            transport,
            mode: INITIAL_MODE.to_string(),
            request,
            operator,
            read_chunk_size: config.read_chunk_size.max(1),
            default_timeout: config.default_timeout(),
            stop: CancellationToken::new(),
            closed: false,
        };

        if protocol == Protocol::Ssh
            && let Err(err) = session.read_buff().await
        {
            if let Err(close_err) = session.close().await {
                warn!(
                    "{} close after failed login read: {}",
                    session.request.log_prefix, close_err
                );
            }
            return Err(ConnectError::DialFailure {
                addr: session.address.clone(),
                reason: format!("read after login failed, {err}"),
            });
        }
        Ok(session)
    }

    /// Process-unique identity of this connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Last CLI mode confirmed on the device.
    pub fn mode(&self) -> &str {
        &self.mode
    }

    /// The request this session currently serves.
    pub fn request(&self) -> &CliRequest {
        &self.request
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(super) fn log_prefix(&self) -> &str {
        &self.request.log_prefix
    }

    pub(super) fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Rebinds the session to a new caller's request and operator.
    pub(super) fn bind(&mut self, request: CliRequest, operator: Arc<dyn Operator>) {
        self.request = request;
        self.operator = operator;
    }

    /// Writes `command` followed by the operator's line break.
    pub async fn write_buff(&mut self, command: &str) -> Result<usize, ConnectError> {
        if self.closed {
            return Err(ConnectError::SessionClosed(self.address.clone()));
        }
        let line = format!("{}{}", command, self.operator.line_break());
        self.transport.write(line.as_bytes()).await
    }

    /// Reads until a prompt of `mode` ends the last line.
    ///
    /// Never returns on its own unless a prompt matches or the transport
    /// fails; callers bound it with a deadline.
    async fn read_lines(&mut self, mode: &str) -> Result<ReadOutput, ConnectError> {
        let operator = Arc::clone(&self.operator);
        let prompts = operator.prompts(mode);
        let mut buf = vec![0u8; self.read_chunk_size];
        let mut pending = Vec::new();
        let mut waiting = String::new();

        loop {
            let n = match self.transport.read(&mut buf).await {
                Ok(0) => {
                    error!("{} read eof while waiting for prompt", self.request.log_prefix);
                    return Err(ConnectError::ChannelDisconnectError);
                }
                Ok(n) => n,
                Err(err) => {
                    error!("{} transport read error, {}", self.request.log_prefix, err);
                    return Err(err);
                }
            };
            let current = decode_chunk(&mut pending, &buf[..n]);
            trace!("{} ({}) {:?}", self.request.log_prefix, n, current);
            waiting.push_str(&current);

            let line = normalize_prompt_line(last_line(&waiting));
            trace!("lastline: {:?}", line);
            if let Some(matched) = any_pattern_matches(line, prompts) {
                info!(
                    "{} [prompt matched] {:?}",
                    self.request.log_prefix, matched.text
                );
                let body = waiting.strip_suffix(matched.text.as_str()).unwrap_or(&waiting);
                return Ok(ReadOutput {
                    output: body.trim_end_matches(['\r', '\n']).to_string(),
                    prompt: matched.text,
                });
            }
        }
    }

    /// Runs one read cycle for `mode` under the request deadline, then
    /// rejects output containing a device error line.
    async fn read_buff_in(&mut self, mode: &str) -> Result<ReadOutput, ConnectError> {
        if self.closed {
            return Err(ConnectError::SessionClosed(self.address.clone()));
        }
        let timeout = self.request.timeout_or(self.default_timeout);
        // Dropping the loop on deadline cancels its pending transport read.
        let result = match tokio::time::timeout(timeout, self.read_lines(mode)).await {
            Ok(result) => result?,
            Err(_) => {
                error!(
                    "{} read stdout timeout after {:?}",
                    self.request.log_prefix, timeout
                );
                return Err(ConnectError::ReadTimeout(timeout));
            }
        };

        for line in result.output.lines() {
            if let Some(matched) = any_pattern_matches(line, self.operator.error_patterns()) {
                error!(
                    "{} err pattern matched, {:?}",
                    self.request.log_prefix, matched.text
                );
                return Err(ConnectError::DeviceErrorPattern(line.to_string()));
            }
        }
        Ok(result)
    }

    /// Runs one read cycle with the prompts of the current mode.
    pub async fn read_buff(&mut self) -> Result<ReadOutput, ConnectError> {
        let mode = self.mode.clone();
        self.read_buff_in(&mode).await
    }

    /// Moves the CLI to `target` using the operator's transition steps.
    ///
    /// Each step is confirmed by a prompt of the mode it leads to before the
    /// next is sent. The cached mode changes only once every step
    /// succeeded; a failed step leaves it at the last confirmed mode.
    pub async fn transit(&mut self, target: &str) -> Result<(), ConnectError> {
        let from = self.mode.clone();
        let steps = self.operator.transitions(&from, target);
        if steps.is_empty() {
            warn!(
                "{} no transition commands from {} to {}",
                self.request.log_prefix, from, target
            );
        }
        let total = steps.len();
        for (index, step) in steps.into_iter().enumerate() {
            debug!(
                "{} transit {} -> {} step {}/{} (expect {})",
                self.request.log_prefix,
                from,
                target,
                index + 1,
                total,
                step.expect_mode
            );
            let outcome = match self.write_buff(&step.command).await {
                Ok(_) => self.read_buff_in(&step.expect_mode).await.map(|_| ()),
                Err(err) => Err(err),
            };
            if let Err(err) = outcome {
                error!("{} transit failed, {}", self.request.log_prefix, err);
                return Err(ConnectError::TransitionFailure {
                    from,
                    to: target.to_string(),
                    command: step.command,
                    source: Box::new(err),
                });
            }
        }
        self.mode = target.to_string();
        Ok(())
    }

    /// Executes the bound request: switch mode if needed, then run every
    /// command in order.
    ///
    /// On failure the outputs captured before the failing command are
    /// returned inside the error.
    pub async fn exec(&mut self) -> Result<CommandResults, ExecError> {
        let target = self.request.mode.clone();
        if !target.is_empty()
            && !target.eq_ignore_ascii_case(&self.mode)
            && let Err(err) = self.transit(&target).await
        {
            return Err(ExecError::new(CommandResults::new(), err));
        }

        let mut results = CommandResults::new();
        let commands = self.request.commands.clone();
        for command in commands {
            if let Err(err) = self.write_buff(&command).await {
                error!("{} write buff failed, {}", self.request.log_prefix, err);
                return Err(ExecError::new(results, err));
            }
            match self.read_buff().await {
                Ok(read) => results.insert(command, read.output),
                Err(err) => {
                    error!("{} readBuff failed, {}", self.request.log_prefix, err);
                    return Err(ExecError::new(results, err));
                }
            }
        }
        Ok(results)
    }

    /// Liveness probe: an empty command must come back with a prompt.
    pub(super) async fn probe(&mut self) -> Result<(), ConnectError> {
        self.write_buff("").await?;
        self.read_buff().await?;
        Ok(())
    }

    /// Stops the heartbeat and closes the transport.
    pub async fn close(&mut self) -> Result<(), ConnectError> {
        self.stop.cancel();
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        debug!("{} closing session {}", self.request.log_prefix, self.address);
        self.transport.close().await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
