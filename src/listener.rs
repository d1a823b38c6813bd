use std::{io, net::ToSocketAddrs};

use socket2::{Domain, Socket, Type};
use tokio::net::TcpListener;

// Create an async TCP listener with Nagle's algorithm disabled and any
// necessary configuration for dualstack. Used for the acceptor socket and
// for remote-forwarding bindings alike.
pub(crate) fn bind_tcp_listener<A: ToSocketAddrs>(addr: A) -> io::Result<TcpListener> {
    let addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "could not resolve to any address",
        )
    })?;
    let is_ipv6 = addr.is_ipv6();

    let socket = Socket::new(
        if is_ipv6 { Domain::IPV6 } else { Domain::IPV4 },
        Type::STREAM,
        None,
    )?;

    socket.set_nonblocking(true)?;
    socket.set_tcp_nodelay(true)?;
    if is_ipv6 {
        socket.set_only_v6(false)?;
    }

    // A cancelled forwarding may be re-requested on the same
    // bind-addr:port right away; without address reuse the rebind would
    // fail until the old socket leaves TIME_WAIT. Windows gives
    // SO_REUSEADDR steal-a-live-port semantics, so it stays off there
    // and a quick rebind may transiently fail.
    #[cfg(not(windows))]
    socket.set_reuse_address(true)?;

    socket.bind(&addr.into())?;
    // Both users of this listener (the SSH acceptor and forward
    // bindings) drain accepts in a tight loop, so a modest fixed backlog
    // is enough on every platform.
    socket.listen(128)?;

    TcpListener::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::bind_tcp_listener;

    #[tokio::test]
    async fn binds_and_reports_assigned_port() {
        let listener = bind_tcp_listener(("127.0.0.1", 0)).expect("bind failed");
        let port = listener.local_addr().unwrap().port();
        assert!(port >= 1024);
    }

    #[tokio::test]
    async fn double_bind_of_live_port_fails() {
        let listener = bind_tcp_listener(("127.0.0.1", 0)).expect("bind failed");
        let port = listener.local_addr().unwrap().port();
        assert!(bind_tcp_listener(("127.0.0.1", port)).is_err());
    }
}
