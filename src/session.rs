//! The session channel handler: shell and exec with or without a pty,
//! window-change and signal propagation, and exit-status delivery.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use nix::{sys::signal, unistd::Pid};
use pty_process::OwnedWritePty;
use russh::{server::Msg, Channel, ChannelMsg, ChannelWriteHalf, Sig};
use tokio::{
    io::AsyncWriteExt,
    process::Child,
    sync::{mpsc, Mutex},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    context::ConnectionContext,
    copy::{copy_with_cancel, CopyError},
    error::ServerError,
    pty::{self, PtySize},
    router::{ChannelHandler, ChannelOpen},
    user::{valid_username, User},
    wire::{self, PtyRequest, WindowChange},
};

/// How a session request was handled, as seen by the log callback.
pub trait RequestLogCallback: Send + Sync {
    fn on_request(
        &self,
        error: Option<&str>,
        request_type: &str,
        want_reply: bool,
        ctx: &ConnectionContext,
    );
}

/// The program a session runs, before env/cwd/credentials are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

/// Resolves `shell` and `exec` requests to commands. The default invokes
/// the platform login program for shells; embedders override this to drop
/// privileges differently or to constrain commands.
pub trait CommandResolver: Send + Sync {
    fn shell_command(&self, user: &User) -> Result<CommandSpec, ServerError>;
    fn exec_command(&self, user: &User, words: Vec<String>) -> Result<CommandSpec, ServerError>;
}

/// `login -f <user>` for shells, the parsed words for exec. Usernames
/// are validated before reaching `login`, which treats leading dashes as
/// options.
pub struct LoginCommandResolver;

impl CommandResolver for LoginCommandResolver {
    fn shell_command(&self, user: &User) -> Result<CommandSpec, ServerError> {
        if !valid_username(&user.username) {
            return Err(ServerError::PermissionDenied(format!(
                "unsafe username '{}'",
                user.username
            )));
        }
        Ok(CommandSpec {
            program: "login".into(),
            args: vec!["-f".into(), user.username.clone()],
        })
    }

    fn exec_command(&self, _user: &User, mut words: Vec<String>) -> Result<CommandSpec, ServerError> {
        if words.is_empty() {
            return Err(ServerError::ProtocolViolation("empty command".into()));
        }
        let program = words.remove(0);
        Ok(CommandSpec {
            program,
            args: words,
        })
    }
}

/// Channel handler for `session` channels. One task per channel consumes
/// the channel's message stream; the pty, window-change, and signal
/// requests land in bounded queues drained by the process that the
/// session eventually starts.
pub struct SessionHandler {
    queue_capacity: usize,
    buffer_size: usize,
    resolver: Arc<dyn CommandResolver>,
    request_log: Option<Arc<dyn RequestLogCallback>>,
}

impl SessionHandler {
    pub fn new(queue_capacity: usize, buffer_size: usize) -> Self {
        SessionHandler {
            queue_capacity: queue_capacity.max(1),
            buffer_size,
            resolver: Arc::new(LoginCommandResolver),
            request_log: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn CommandResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_request_log(mut self, callback: Arc<dyn RequestLogCallback>) -> Self {
        self.request_log = Some(callback);
        self
    }
}

#[async_trait]
impl ChannelHandler for SessionHandler {
    async fn on_open(
        &self,
        ctx: Arc<ConnectionContext>,
        channel: Channel<Msg>,
        open: ChannelOpen,
    ) -> color_eyre::Result<bool> {
        if !matches!(open, ChannelOpen::Session) {
            return Ok(false);
        }
        let (pty_tx, pty_rx) = mpsc::channel(self.queue_capacity);
        let (winch_tx, winch_rx) = mpsc::channel(self.queue_capacity);
        let (signal_tx, signal_rx) = mpsc::channel(self.queue_capacity);
        let (stdin_tx, stdin_rx) = mpsc::channel(self.queue_capacity);
        let session = SessionChannel {
            ctx,
            buffer_size: self.buffer_size,
            resolver: Arc::clone(&self.resolver),
            request_log: self.request_log.clone(),
            env: Vec::new(),
            pty_tx,
            winch_tx,
            signal_tx,
            stdin_tx: Some(stdin_tx),
            process: Some(ProcessResources {
                pty_rx,
                winch_rx,
                signal_rx,
                stdin_rx,
                write_half: None,
            }),
        };
        tokio::spawn(session.run(channel));
        Ok(true)
    }
}

// Everything the spawned process borrows from the session: the queue
// consumers, the stdin stream, and the channel's write side. Taken
// exactly once; a second shell/exec on the same channel is refused.
struct ProcessResources {
    pty_rx: mpsc::Receiver<PtyRequest>,
    winch_rx: mpsc::Receiver<WindowChange>,
    signal_rx: mpsc::Receiver<Sig>,
    stdin_rx: mpsc::Receiver<Vec<u8>>,
    write_half: Option<ChannelWriteHalf<Msg>>,
}

// How long a finished process's output copiers get to deliver their
// tail before the session stops them.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(5);

// The stdin pump, winch drain, signal drain, and cancellation observer
// hold the pty writer and the session queues. Aborting them when the
// process epilogue unwinds is what releases the pty on every exit path
// and lets the queue senders fail fast once the session is gone.
struct AuxTask(tokio::task::JoinHandle<()>);

impl Drop for AuxTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

enum Target {
    Shell,
    Exec(Vec<String>),
}

struct SessionChannel {
    ctx: Arc<ConnectionContext>,
    buffer_size: usize,
    resolver: Arc<dyn CommandResolver>,
    request_log: Option<Arc<dyn RequestLogCallback>>,
    env: Vec<String>,
    pty_tx: mpsc::Sender<PtyRequest>,
    winch_tx: mpsc::Sender<WindowChange>,
    signal_tx: mpsc::Sender<Sig>,
    stdin_tx: Option<mpsc::Sender<Vec<u8>>>,
    process: Option<ProcessResources>,
}

impl SessionChannel {
    async fn run(mut self, channel: Channel<Msg>) {
        let (mut read_half, write_half) = channel.split();
        if let Some(ref mut resources) = self.process {
            resources.write_half = Some(write_half);
        }
        loop {
            tokio::select! {
                _ = self.ctx.cancelled() => {
                    debug!("Session interrupted by context cancellation.");
                    break;
                }
                msg = read_half.wait() => {
                    let Some(msg) = msg else { break };
                    if !self.dispatch(msg).await {
                        break;
                    }
                }
            }
        }
        // A running process owns the write half and closes the channel in
        // its epilogue; otherwise the session does it here.
        if let Some(resources) = self.process.take() {
            if let Some(write_half) = resources.write_half {
                let _ = write_half.close().await;
            }
        }
    }

    fn log_request(&self, error: Option<&str>, request_type: &str, want_reply: bool) {
        if let Some(ref log) = self.request_log {
            log.on_request(error, request_type, want_reply, &self.ctx);
        }
    }

    /// Returns false once the channel should be torn down.
    async fn dispatch(&mut self, msg: ChannelMsg) -> bool {
        match msg {
            ChannelMsg::RequestPty {
                want_reply,
                term,
                col_width,
                row_height,
                pix_width,
                pix_height,
                terminal_modes,
            } => {
                let request = PtyRequest {
                    term,
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                    modes: terminal_modes,
                };
                let result = self.pty_tx.send(request).await;
                self.log_request(
                    result.as_ref().err().map(|_| "session ended"),
                    wire::REQUEST_PTY,
                    want_reply,
                );
            }
            ChannelMsg::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            } => {
                let change = WindowChange {
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                };
                let result = self.winch_tx.send(change).await;
                self.log_request(
                    result.as_ref().err().map(|_| "session ended"),
                    wire::REQUEST_WINDOW_CHANGE,
                    false,
                );
            }
            ChannelMsg::SetEnv {
                want_reply,
                variable_name,
                variable_value,
            } => {
                self.env.push(format!("{variable_name}={variable_value}"));
                self.log_request(None, wire::REQUEST_ENV, want_reply);
            }
            ChannelMsg::Signal { signal } => {
                let result = self.signal_tx.send(signal).await;
                self.log_request(
                    result.as_ref().err().map(|_| "session ended"),
                    wire::REQUEST_SIGNAL,
                    false,
                );
            }
            ChannelMsg::RequestShell { want_reply } => {
                let result = self.start_process(Target::Shell);
                self.log_request(result.err().as_deref(), wire::REQUEST_SHELL, want_reply);
            }
            ChannelMsg::Exec {
                want_reply,
                command,
            } => {
                let result = match parse_command(&command) {
                    Ok(words) => self.start_process(Target::Exec(words)),
                    Err(error) => Err(error.to_string()),
                };
                self.log_request(result.err().as_deref(), wire::REQUEST_EXEC, want_reply);
            }
            ChannelMsg::RequestSubsystem { want_reply, name } => {
                debug!(%name, "Refusing subsystem request.");
                self.log_request(Some("not implemented"), wire::REQUEST_SUBSYSTEM, want_reply);
            }
            ChannelMsg::Data { data } => {
                if let Some(ref stdin) = self.stdin_tx {
                    if stdin.send(data.to_vec()).await.is_err() {
                        self.stdin_tx = None;
                    }
                }
            }
            ChannelMsg::ExtendedData { .. } => {}
            ChannelMsg::Eof => {
                // No more client input; the stdin pump closes the child's
                // stdin once drained.
                self.stdin_tx = None;
            }
            ChannelMsg::Close => return false,
            _ => {}
        }
        true
    }

    fn start_process(&mut self, target: Target) -> Result<(), String> {
        let Some(resources) = self.process.take() else {
            return Err("session already started a process".into());
        };
        let Some(user) = self.ctx.user() else {
            self.process = Some(resources);
            return Err("no user on connection".into());
        };
        let spec = match &target {
            Target::Shell => self.resolver.shell_command(&user),
            Target::Exec(words) => self.resolver.exec_command(&user, words.clone()),
        };
        let spec = match spec {
            Ok(spec) => spec,
            Err(error) => {
                self.process = Some(resources);
                return Err(error.to_string());
            }
        };
        let task = ProcessTask {
            ctx: Arc::clone(&self.ctx),
            buffer_size: self.buffer_size,
            env: self.env.clone(),
            user,
            spec,
            resources,
        };
        tokio::spawn(task.run(matches!(target, Target::Shell)));
        Ok(())
    }
}

fn parse_command(raw: &[u8]) -> Result<Vec<String>, ServerError> {
    let command = String::from_utf8_lossy(raw);
    let words = shell_words::split(&command)
        .map_err(|error| ServerError::ProtocolViolation(error.to_string()))?;
    if words.is_empty() {
        return Err(ServerError::ProtocolViolation("empty command".into()));
    }
    Ok(words)
}

struct ProcessTask {
    ctx: Arc<ConnectionContext>,
    buffer_size: usize,
    env: Vec<String>,
    user: Arc<User>,
    spec: CommandSpec,
    resources: ProcessResources,
}

impl ProcessTask {
    async fn run(mut self, needs_pty: bool) {
        let write_half = match self.resources.write_half.take() {
            Some(write_half) => write_half,
            None => return,
        };
        // The shell branch requires a pty and blocks until the client's
        // pty-req is queued. Exec takes one only if it already arrived.
        let pty_request = if needs_pty {
            tokio::select! {
                _ = self.ctx.cancelled() => None,
                msg = self.resources.pty_rx.recv() => msg,
            }
        } else {
            self.resources.pty_rx.try_recv().ok()
        };
        if needs_pty && pty_request.is_none() {
            let _ = write_half.close().await;
            return;
        }
        let credentials = match self.user.credentials() {
            Ok(credentials) => credentials,
            Err(error) => {
                warn!(%error, user = %self.user.username, "Refusing to spawn process.");
                let _ = write_half.close().await;
                return;
            }
        };
        let result = match pty_request {
            Some(request) => {
                self.run_with_pty(&write_half, request, credentials).await
            }
            None => self.run_with_pipes(&write_half, credentials).await,
        };
        match result {
            Ok(code) => {
                // Exit status goes out before close, and the channel is
                // closed even if the status could not be sent.
                let _ = write_half.exit_status(code).await;
                let _ = write_half.eof().await;
                let _ = write_half.close().await;
            }
            Err(error) => {
                info!(%error, program = %self.spec.program, "Session process failed.");
                let _ = write_half.close().await;
            }
        }
    }

    async fn run_with_pty(
        &mut self,
        write_half: &ChannelWriteHalf<Msg>,
        request: PtyRequest,
        (uid, gid): (u32, u32),
    ) -> Result<u32, ServerError> {
        let size = PtySize::from(&request);
        let mut command = pty_process::Command::new(&self.spec.program);
        command = command.args(&self.spec.args);
        command = command.env("TERM", &request.term);
        for (name, value) in self.env.iter().filter_map(|entry| entry.split_once('=')) {
            command = command.env(name, value);
        }
        if !self.user.home_dir.is_empty() {
            command = command.current_dir(&self.user.home_dir);
        }
        command = command.uid(uid);
        command = command.gid(gid);
        let (master, mut child) = pty::spawn_with_pty(&mut command, size)?;
        let pid = child.id().map(|id| Pid::from_raw(id as i32));

        let child_token = self.ctx.child_token();
        let (pty_reader, pty_writer) = master.into_split();
        let pty_writer = Arc::new(Mutex::new(pty_writer));

        // Channel → pty (stdin) and pty → channel (stdout and stderr are
        // one stream on a pty).
        let stdin_rx = std::mem::replace(&mut self.resources.stdin_rx, mpsc::channel(1).1);
        let _stdin_pump = AuxTask(tokio::spawn(pump_stdin_to_pty(
            stdin_rx,
            Arc::clone(&pty_writer),
            child_token.clone(),
        )));
        let mut output = pty_reader;
        let mut channel_writer = Box::pin(write_half.make_writer());
        let buffer_size = self.buffer_size;
        let output_token = child_token.clone();
        let mut output_task = tokio::spawn(async move {
            match copy_with_cancel(&mut output, &mut channel_writer, buffer_size, &output_token)
                .await
            {
                Ok(_) | Err(CopyError::Interrupted) => {}
                // EIO when the last slave handle closes is the normal end
                // of a pty stream.
                Err(CopyError::Io(error)) => {
                    debug!(%error, "Pty output stream ended.");
                }
            }
        });

        let winch_rx = std::mem::replace(&mut self.resources.winch_rx, mpsc::channel(1).1);
        let _winch_drain = AuxTask(tokio::spawn(drain_window_changes(
            winch_rx,
            Arc::clone(&pty_writer),
            child_token.clone(),
        )));
        let signal_rx = std::mem::replace(&mut self.resources.signal_rx, mpsc::channel(1).1);
        let _signal_drain = AuxTask(tokio::spawn(drain_signals(
            signal_rx,
            pid,
            child_token.clone(),
        )));
        let _observer = AuxTask(tokio::spawn(observe_cancellation(
            self.ctx.clone(),
            child_token.clone(),
            pid,
        )));

        let status = wait_child(&mut child).await?;
        // The slave side is gone with the child, so the output copier
        // ends on its own; give it time to flush the tail before the
        // drains are stopped.
        let _ = tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut output_task).await;
        child_token.cancel();
        Ok(status)
    }

    async fn run_with_pipes(
        &mut self,
        write_half: &ChannelWriteHalf<Msg>,
        (uid, gid): (u32, u32),
    ) -> Result<u32, ServerError> {
        let mut command = tokio::process::Command::new(&self.spec.program);
        command.args(&self.spec.args);
        for (name, value) in self.env.iter().filter_map(|entry| entry.split_once('=')) {
            command.env(name, value);
        }
        if !self.user.home_dir.is_empty() {
            command.current_dir(&self.user.home_dir);
        }
        command.uid(uid);
        command.gid(gid);
        command.stdin(std::process::Stdio::piped());
        command.stdout(std::process::Stdio::piped());
        command.stderr(std::process::Stdio::piped());
        let mut child = command
            .spawn()
            .map_err(|error| ServerError::Resource(error.to_string()))?;
        let pid = child.id().map(|id| Pid::from_raw(id as i32));

        let child_token = self.ctx.child_token();
        let mut stdin = child.stdin.take();
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ServerError::Resource("no stdout pipe".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ServerError::Resource("no stderr pipe".into()))?;

        let mut stdin_rx = std::mem::replace(&mut self.resources.stdin_rx, mpsc::channel(1).1);
        let stdin_token = child_token.clone();
        let _stdin_pump = AuxTask(tokio::spawn(async move {
            loop {
                let chunk = tokio::select! {
                    _ = stdin_token.cancelled() => break,
                    chunk = stdin_rx.recv() => chunk,
                };
                let Some(chunk) = chunk else { break };
                let Some(ref mut pipe) = stdin else { break };
                if pipe.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            // Dropping stdin delivers EOF to the child.
            drop(stdin);
        }));

        let mut stdout_writer = Box::pin(write_half.make_writer());
        let buffer_size = self.buffer_size;
        let stdout_token = child_token.clone();
        let mut stdout_task = tokio::spawn(async move {
            let _ =
                copy_with_cancel(&mut stdout, &mut stdout_writer, buffer_size, &stdout_token).await;
        });
        // Stderr rides the extended-data stream, code 1.
        let mut stderr_writer = Box::pin(write_half.make_writer_ext(Some(1)));
        let stderr_token = child_token.clone();
        let mut stderr_task = tokio::spawn(async move {
            let _ =
                copy_with_cancel(&mut stderr, &mut stderr_writer, buffer_size, &stderr_token).await;
        });

        let signal_rx = std::mem::replace(&mut self.resources.signal_rx, mpsc::channel(1).1);
        let _signal_drain = AuxTask(tokio::spawn(drain_signals(
            signal_rx,
            pid,
            child_token.clone(),
        )));
        let _observer = AuxTask(tokio::spawn(observe_cancellation(
            self.ctx.clone(),
            child_token.clone(),
            pid,
        )));

        let status = wait_child(&mut child).await?;
        let _ = tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut stdout_task).await;
        let _ = tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut stderr_task).await;
        child_token.cancel();
        Ok(status)
    }
}

async fn wait_child(child: &mut Child) -> Result<u32, ServerError> {
    let status = child
        .wait()
        .await
        .map_err(|error| ServerError::Resource(error.to_string()))?;
    Ok(exit_code(status))
}

// A signalled child reports 128 + signal number, shell-style.
fn exit_code(status: std::process::ExitStatus) -> u32 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code as u32,
        None => 128 + status.signal().unwrap_or(0) as u32,
    }
}

async fn pump_stdin_to_pty(
    mut stdin_rx: mpsc::Receiver<Vec<u8>>,
    pty_writer: Arc<Mutex<OwnedWritePty>>,
    token: CancellationToken,
) {
    loop {
        let chunk = tokio::select! {
            _ = token.cancelled() => break,
            chunk = stdin_rx.recv() => chunk,
        };
        let Some(chunk) = chunk else { break };
        if pty_writer.lock().await.write_all(&chunk).await.is_err() {
            break;
        }
    }
}

async fn drain_window_changes(
    mut winch_rx: mpsc::Receiver<WindowChange>,
    pty_writer: Arc<Mutex<OwnedWritePty>>,
    token: CancellationToken,
) {
    loop {
        let change = tokio::select! {
            _ = token.cancelled() => break,
            change = winch_rx.recv() => change,
        };
        let Some(change) = change else { break };
        let size = PtySize::from(&change);
        if let Err(error) = pty::set_size(&*pty_writer.lock().await, size) {
            warn!(%error, "Failed to resize pty.");
        }
    }
}

async fn drain_signals(
    mut signal_rx: mpsc::Receiver<Sig>,
    pid: Option<Pid>,
    token: CancellationToken,
) {
    loop {
        let sig = tokio::select! {
            _ = token.cancelled() => break,
            sig = signal_rx.recv() => sig,
        };
        let Some(sig) = sig else { break };
        let Some(pid) = pid else { continue };
        match wire::os_signal(&sig) {
            Some(os_sig) => {
                if let Err(error) = signal::kill(pid, os_sig) {
                    debug!(%error, signal = ?os_sig, "Failed to deliver signal.");
                }
            }
            None => debug!(signal = ?sig, "Ignoring signal with no local equivalent."),
        }
    }
}

// On context cancellation the drains observe the child token first, then
// the child itself is killed so its wait() completes.
async fn observe_cancellation(
    ctx: Arc<ConnectionContext>,
    child_token: CancellationToken,
    pid: Option<Pid>,
) {
    tokio::select! {
        _ = ctx.cancelled() => {
            child_token.cancel();
            if let Some(pid) = pid {
                let _ = signal::kill(pid, signal::Signal::SIGKILL);
            }
        }
        _ = child_token.cancelled() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::{exit_code, parse_command, CommandResolver, LoginCommandResolver};
    use crate::{error::ServerError, user::User};

    fn user(name: &str) -> User {
        User {
            username: name.into(),
            uid: "1000".into(),
            gid: "1000".into(),
            ..Default::default()
        }
    }

    #[test]
    fn exec_commands_split_with_posix_rules() {
        let words = parse_command(b"echo 'hello world' \"a b\" c\\ d").unwrap();
        assert_eq!(words, ["echo", "hello world", "a b", "c d"]);
    }

    #[test]
    fn empty_and_malformed_commands_are_refused() {
        assert!(matches!(
            parse_command(b""),
            Err(ServerError::ProtocolViolation(_))
        ));
        assert!(matches!(
            parse_command(b"   "),
            Err(ServerError::ProtocolViolation(_))
        ));
        assert!(parse_command(b"echo 'unterminated").is_err());
    }

    #[test]
    fn shell_resolves_to_login() {
        let spec = LoginCommandResolver.shell_command(&user("alice")).unwrap();
        assert_eq!(spec.program, "login");
        assert_eq!(spec.args, ["-f", "alice"]);
    }

    #[test]
    fn shell_refuses_unsafe_usernames() {
        let result = LoginCommandResolver.shell_command(&user("-froot"));
        assert!(matches!(result, Err(ServerError::PermissionDenied(_))));
        let result = LoginCommandResolver.shell_command(&user("a;b"));
        assert!(matches!(result, Err(ServerError::PermissionDenied(_))));
    }

    #[test]
    fn exec_resolves_program_and_args() {
        let spec = LoginCommandResolver
            .exec_command(&user("alice"), vec!["ls".into(), "-la".into()])
            .unwrap();
        assert_eq!(spec.program, "ls");
        assert_eq!(spec.args, ["-la"]);
    }

    #[test]
    fn signalled_children_report_128_plus_signal() {
        use std::os::unix::process::ExitStatusExt;
        let status = std::process::ExitStatus::from_raw(2); // killed by SIGINT
        assert_eq!(exit_code(status), 130);
        let status = std::process::ExitStatus::from_raw(0x100); // exit(1)
        assert_eq!(exit_code(status), 1);
    }
}
