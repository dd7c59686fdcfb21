use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

mod cli;
mod supervisor;
mod worker;

use cli::Cli;

fn main() -> ExitCode {
    let cli = Cli::parse();
    tollgate_common::logging::init(cli.debug);
    sanitize_env();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let smtp_addr = SocketAddr::new(cli.listen_address, cli.port);
    let smtp_listener = bind_listener(smtp_addr)
        .with_context(|| format!("failed to bind SMTP listener on {smtp_addr}"))?;
    tracing::info!(%smtp_addr, "smtp listener bound");

    let control_addr: SocketAddr = cli
        .control_address
        .parse()
        .with_context(|| format!("invalid control address {}", cli.control_address))?;
    let control_listener = bind_listener(control_addr)
        .with_context(|| format!("failed to bind control listener on {control_addr}"))?;

    if let Some(user) = &cli.user {
        drop_privileges(user).with_context(|| format!("failed to drop privileges to {user}"))?;
        tracing::info!(user, "privileges dropped");
    }

    if cli.procs > 1 {
        supervisor::run(&cli, smtp_listener, control_listener)
    } else {
        worker::run(&cli, smtp_listener, Some(control_listener))
    }
}

/// Scrub the inherited environment before anything consults it.
fn sanitize_env() {
    std::env::set_var("PATH", "/bin:/usr/bin:/usr/local/bin");
    std::env::remove_var("ENV");
    std::env::remove_var("BASH_ENV");
}

/// Bind a non-blocking listener with `SO_REUSEADDR` and the system maximum
/// backlog. Plain std sockets: workers inherit this fd across fork and wrap
/// it in their own runtimes.
fn bind_listener(addr: SocketAddr) -> anyhow::Result<std::net::TcpListener> {
    use nix::sys::socket::{
        bind, listen, setsockopt, socket, sockopt, AddressFamily, Backlog, SockFlag,
        SockType, SockaddrStorage,
    };

    let family = if addr.is_ipv6() {
        AddressFamily::Inet6
    } else {
        AddressFamily::Inet
    };
    let fd = socket(family, SockType::Stream, SockFlag::empty(), None)?;
    setsockopt(&fd, sockopt::ReuseAddr, &true)?;
    bind(fd.as_raw_fd(), &SockaddrStorage::from(addr))?;
    listen(&fd, Backlog::MAXCONN)?;

    let listener = std::net::TcpListener::from(fd);
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn drop_privileges(user: &str) -> anyhow::Result<()> {
    let entry = nix::unistd::User::from_name(user)?
        .ok_or_else(|| anyhow::anyhow!("unknown user {user}"))?;
    nix::unistd::setgid(entry.gid)?;
    nix::unistd::setuid(entry.uid)?;
    Ok(())
}
