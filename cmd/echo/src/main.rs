//! TCP echo server on dfiber
//!
//! One fiber accepts, one fiber per connection echoes. Every socket is
//! non-blocking; a fiber that would block parks itself on the reactor with
//! `dfiber::wait` until the fd is ready.
//!
//! Usage:
//!     cargo build --release -p dfiber-echo
//!     DFIBER_THREADS=4 ./target/release/echo [port]
//!
//! Test with:
//!     echo "hello" | nc localhost 9999

use dfiber::{spawn, wait, Event, Runtime, RuntimeConfig};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const BUF_SIZE: usize = 4096;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(9999);

    let listener = match bind(port) {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("cannot listen on port {port}: {e}");
            std::process::exit(1);
        }
    };
    info!(port, "echo server listening");

    let mut runtime = match Runtime::new(RuntimeConfig::from_env().name("echo")) {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("cannot start runtime: {e}");
            std::process::exit(1);
        }
    };

    // Serves until killed: the acceptor keeps a READ registration pending,
    // so shutdown never finds the reactor idle.
    let iom = runtime.io().clone();
    runtime.block_on(move || {
        iom.schedule_fn(move || accept_loop(listener));
    });
}

fn bind(port: u16) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn accept_loop(listener: TcpListener) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted");
                if let Err(e) = stream.set_nonblocking(true) {
                    warn!(%peer, error = %e, "set_nonblocking failed");
                    continue;
                }
                if let Err(e) = spawn(move || serve(stream)) {
                    error!(%peer, error = %e, "cannot spawn connection fiber");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if let Err(e) = wait(listener.as_raw_fd(), Event::READ) {
                    error!(error = %e, "cannot wait for connections");
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
            }
        }
    }
}

fn serve(mut stream: TcpStream) {
    let fd = stream.as_raw_fd();
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if wait(fd, Event::READ).is_err() {
                    break;
                }
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(fd, error = %e, "read failed");
                break;
            }
        };
        if let Err(e) = write_all(&mut stream, &buf[..n]) {
            debug!(fd, error = %e, "write failed");
            break;
        }
    }
    debug!(fd, "connection closed");
}

fn write_all(stream: &mut TcpStream, mut data: &[u8]) -> io::Result<()> {
    let fd = stream.as_raw_fd();
    while !data.is_empty() {
        match stream.write(data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                wait(fd, Event::WRITE).map_err(io::Error::other)?;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
