//! RFC 4254 vocabulary shared by the routers and handlers.
//!
//! The transport owns the wire codecs; everything here is the parsed form
//! of a payload, plus the type-name strings used as registry keys.

use nix::sys::signal::Signal;
use russh::Sig;

// Channel types. RFC 4254 6.1, 6.3.2, 7.2.
pub const CHANNEL_TYPE_SESSION: &str = "session";
pub const CHANNEL_TYPE_DIRECT_TCPIP: &str = "direct-tcpip";
pub const CHANNEL_TYPE_FORWARDED_TCPIP: &str = "forwarded-tcpip";
pub const CHANNEL_TYPE_X11: &str = "x11";

// Session channel request types. RFC 4254 6.2-6.10.
pub const REQUEST_PTY: &str = "pty-req";
pub const REQUEST_SHELL: &str = "shell";
pub const REQUEST_EXEC: &str = "exec";
pub const REQUEST_ENV: &str = "env";
pub const REQUEST_WINDOW_CHANGE: &str = "window-change";
pub const REQUEST_SIGNAL: &str = "signal";
pub const REQUEST_SUBSYSTEM: &str = "subsystem";
pub const REQUEST_EXIT: &str = "exit";
pub const REQUEST_EXIT_STATUS: &str = "exit-status";

// Global request types. RFC 4254 7.1.
pub const GLOBAL_REQUEST_TCPIP_FORWARD: &str = "tcpip-forward";
pub const GLOBAL_REQUEST_CANCEL_TCPIP_FORWARD: &str = "cancel-tcpip-forward";

/// Reason codes for refusing a channel open. RFC 4254 5.1.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum RejectionReason {
    Prohibited = 1,
    ConnectionFailed = 2,
    UnknownChannelType = 3,
    ResourceShortage = 4,
}

impl From<RejectionReason> for u32 {
    fn from(reason: RejectionReason) -> u32 {
        reason as u32
    }
}

/// A parsed `pty-req` payload. The terminal modes are passed through
/// opaquely to the pty (RFC 4254 8 encoding is not interpreted here).
#[derive(Debug, Clone)]
pub struct PtyRequest {
    pub term: String,
    pub col_width: u32,
    pub row_height: u32,
    pub pix_width: u32,
    pub pix_height: u32,
    pub modes: Vec<(russh::Pty, u32)>,
}

/// A parsed `window-change` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowChange {
    pub col_width: u32,
    pub row_height: u32,
    pub pix_width: u32,
    pub pix_height: u32,
}

/// Extra data of a `direct-tcpip` channel open. RFC 4254 7.2.
#[derive(Debug, Clone)]
pub struct DirectTcpIpParams {
    pub dest_host: String,
    pub dest_port: u32,
    pub orig_host: String,
    pub orig_port: u32,
}

/// Payload of `tcpip-forward` and `cancel-tcpip-forward`. RFC 4254 7.1.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub bind_addr: String,
    pub bind_port: u32,
}

/// Extra data of a `forwarded-tcpip` channel open, sent back to the
/// client for each accepted connection on a bound listener.
#[derive(Debug, Clone)]
pub struct ForwardedTcpIpParams {
    pub dest_addr: String,
    pub dest_port: u32,
    pub orig_addr: String,
    pub orig_port: u32,
}

/// Map an SSH signal name (no `SIG` prefix, RFC 4254 6.10) onto the local
/// process signal. Names without a local equivalent return `None` and are
/// ignored by the caller.
pub fn os_signal(sig: &Sig) -> Option<Signal> {
    match sig {
        Sig::ABRT => Some(Signal::SIGABRT),
        Sig::ALRM => Some(Signal::SIGALRM),
        Sig::FPE => Some(Signal::SIGFPE),
        Sig::HUP => Some(Signal::SIGHUP),
        Sig::ILL => Some(Signal::SIGILL),
        Sig::INT => Some(Signal::SIGINT),
        Sig::KILL => Some(Signal::SIGKILL),
        Sig::PIPE => Some(Signal::SIGPIPE),
        Sig::QUIT => Some(Signal::SIGQUIT),
        Sig::SEGV => Some(Signal::SIGSEGV),
        Sig::TERM => Some(Signal::SIGTERM),
        Sig::USR1 => Some(Signal::SIGUSR1),
        // USR2 has no dedicated russh variant; it and any other real
        // signal name arrive as Custom and are forwarded opaquely.
        Sig::Custom(name) => custom_signal(name),
    }
}

fn custom_signal(name: &str) -> Option<Signal> {
    match name {
        "USR2" => Some(Signal::SIGUSR2),
        "CHLD" => Some(Signal::SIGCHLD),
        "CONT" => Some(Signal::SIGCONT),
        "STOP" => Some(Signal::SIGSTOP),
        "TSTP" => Some(Signal::SIGTSTP),
        "TTIN" => Some(Signal::SIGTTIN),
        "TTOU" => Some(Signal::SIGTTOU),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_reasons_match_rfc_codes() {
        assert_eq!(u32::from(RejectionReason::Prohibited), 1);
        assert_eq!(u32::from(RejectionReason::ConnectionFailed), 2);
        assert_eq!(u32::from(RejectionReason::UnknownChannelType), 3);
        assert_eq!(u32::from(RejectionReason::ResourceShortage), 4);
    }

    #[test]
    fn named_signals_resolve() {
        assert_eq!(os_signal(&Sig::INT), Some(Signal::SIGINT));
        assert_eq!(os_signal(&Sig::KILL), Some(Signal::SIGKILL));
        assert_eq!(os_signal(&Sig::TERM), Some(Signal::SIGTERM));
        assert_eq!(os_signal(&Sig::USR1), Some(Signal::SIGUSR1));
    }

    #[test]
    fn usr2_is_forwarded_opaquely() {
        assert_eq!(
            os_signal(&Sig::Custom("USR2".into())),
            Some(Signal::SIGUSR2)
        );
    }

    #[test]
    fn unmapped_names_are_ignored() {
        assert_eq!(os_signal(&Sig::Custom("NOSUCHSIG".into())), None);
        assert_eq!(os_signal(&Sig::Custom(String::new())), None);
    }
}
