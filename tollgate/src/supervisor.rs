//! The prefork supervisor. Forks happen before any async runtime exists;
//! each worker builds its own. The parent only reaps and respawns: one
//! replacement per death, no backoff. SIGINT/SIGTERM on the parent
//! broadcasts SIGINT to the workers and exits once they are reaped.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::sys::signal::{kill, signal, SigHandler, Signal as NixSignal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::cli::Cli;
use crate::worker;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

pub fn run(
    cli: &Cli,
    smtp_listener: std::net::TcpListener,
    control_listener: std::net::TcpListener,
) -> anyhow::Result<()> {
    unsafe {
        signal(NixSignal::SIGINT, SigHandler::Handler(on_terminate))?;
        signal(NixSignal::SIGTERM, SigHandler::Handler(on_terminate))?;
    }

    let mut workers: Vec<Pid> = Vec::with_capacity(cli.procs);
    for _ in 0..cli.procs {
        workers.push(spawn_worker(cli, &smtp_listener, &control_listener)?);
    }
    tracing::info!(procs = workers.len(), "prefork supervisor running");

    loop {
        if SHUTDOWN.load(Ordering::SeqCst) {
            break;
        }

        match waitpid(None, None) {
            Ok(WaitStatus::Exited(pid, code)) => {
                tracing::warn!(%pid, code, "worker exited");
                replace_worker(cli, &mut workers, pid, &smtp_listener, &control_listener)?;
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                tracing::warn!(%pid, signal = %sig, "worker killed");
                replace_worker(cli, &mut workers, pid, &smtp_listener, &control_listener)?;
            }
            Ok(_) => {}
            Err(Errno::EINTR) => {}
            Err(Errno::ECHILD) => break,
            Err(err) => return Err(err.into()),
        }
    }

    tracing::info!("supervisor shutting down workers");
    for pid in &workers {
        let _ = kill(*pid, NixSignal::SIGINT);
    }
    loop {
        match waitpid(None, None) {
            Ok(_) => {}
            Err(Errno::EINTR) => {}
            Err(_) => break,
        }
    }

    Ok(())
}

fn replace_worker(
    cli: &Cli,
    workers: &mut Vec<Pid>,
    died: Pid,
    smtp_listener: &std::net::TcpListener,
    control_listener: &std::net::TcpListener,
) -> anyhow::Result<()> {
    workers.retain(|pid| *pid != died);
    if !SHUTDOWN.load(Ordering::SeqCst) {
        workers.push(spawn_worker(cli, smtp_listener, control_listener)?);
    }
    Ok(())
}

fn spawn_worker(
    cli: &Cli,
    smtp_listener: &std::net::TcpListener,
    control_listener: &std::net::TcpListener,
) -> anyhow::Result<Pid> {
    let smtp_fd = smtp_listener.try_clone()?;
    let control_fd = control_listener.try_clone()?;

    match unsafe { fork() }? {
        ForkResult::Parent { child } => {
            tracing::info!(pid = %child, "worker forked");
            Ok(child)
        }
        ForkResult::Child => {
            // Back to default dispositions; the worker runtime installs its
            // own handlers.
            unsafe {
                let _ = signal(NixSignal::SIGINT, SigHandler::SigDfl);
                let _ = signal(NixSignal::SIGTERM, SigHandler::SigDfl);
                let _ = signal(NixSignal::SIGCHLD, SigHandler::SigDfl);
            }

            let code = match worker::run(cli, smtp_fd, Some(control_fd)) {
                Ok(()) => 0,
                Err(err) => {
                    tracing::error!(%err, "worker failed");
                    1
                }
            };
            std::process::exit(code);
        }
    }
}
