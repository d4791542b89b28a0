use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::{ExitCode, Stdio};
use std::sync::Arc;

use clap::Parser;
use log::*;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::signal::unix::{signal, SignalKind};

use crate::cache::Cache;
use crate::cli::Cli;
use crate::error::ShellError;
use crate::index::{LoadingIndex, RuntimeIndex};
use crate::reporter::{NullReporter, Reporter, TerminalReporter};

mod archive;
mod artifact;
mod cache;
mod cli;
mod digest;
mod error;
mod index;
mod mount;
mod reporter;
mod util;
mod vfs;

fn main() -> ExitCode {
    util::setup_logger();
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to start the async runtime");

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> ExitCode {
    if let Some(path) = cli.unmount.clone() {
        return match unmount_only(&path) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{e}");
                ExitCode::FAILURE
            }
        };
    }

    let argv0 = std::env::args().next().unwrap_or_default();
    let Some(host_tool) = cli.resolve_host_tool(&argv0) else {
        error!("no host tool name given: pass --host-tool or name the binary 'para-<host-tool>'");
        return ExitCode::FAILURE;
    };

    match run(&cli, &host_tool).await {
        Ok(code) => code,
        Err(e) => {
            let report = miette::Report::new(e);
            eprintln!("{report:?}");
            ExitCode::FAILURE
        }
    }
}

/// `--unmount <PATH>` short-circuits the rest of the startup sequence.
fn unmount_only(path: &Path) -> Result<(), ShellError> {
    let _ = mount::unmount(path);
    let lock_path = path.parent().unwrap_or(path).join("para.pid");
    if lock_path.is_file() {
        std::fs::remove_file(&lock_path).map_err(ShellError::Io)?;
    }
    Ok(())
}

async fn run(cli: &Cli, host_tool: &str) -> Result<ExitCode, ShellError> {
    let mount_point = mount::discover_mount_point(host_tool)?;
    info!("mount point: {}", util::simplify_path(&mount_point));

    let lock = mount::LockFile::acquire(&mount_point)?;

    let outcome = run_mounted(cli, host_tool, &mount_point).await;
    let lock_result = lock.remove();

    match (outcome, lock_result) {
        (Ok(code), Ok(())) => Ok(code),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), _) => Err(e),
    }
}

async fn run_mounted(cli: &Cli, host_tool: &str, mount_point: &PathBuf) -> Result<ExitCode, ShellError> {
    let refresh = chrono::Duration::from_std(cli.refresh).unwrap_or(chrono::Duration::hours(1));

    let cache = Cache::discover(cli.cache.clone())?;
    info!("cache root: {}", util::simplify_path(cache.root()));

    let mut loading = LoadingIndex::discover(&cli.index, &cache, refresh)?;
    loading.apply_extensions(&cli.extensions, &cache, refresh);
    info!("loaded primary index from {}", loading.source);

    let reporter: Arc<dyn Reporter> = if std::io::stdout().is_terminal() {
        Arc::new(TerminalReporter::new(std::io::stdout()))
    } else {
        Arc::new(NullReporter)
    };

    let runtime_index = Arc::new(RuntimeIndex::build(
        &loading,
        host_tool,
        cache,
        refresh,
        reporter,
    )?);

    let session = vfs::spawn(Arc::clone(&runtime_index), host_tool.to_owned(), mount_point)
        .map_err(|e| ShellError::Mount(mount_point.clone(), e))?;

    let exit_code = supervise_child(cli).await?;

    drop(session);

    Ok(exit_code)
}

async fn supervise_child(cli: &Cli) -> Result<ExitCode, ShellError> {
    if cli.command.is_empty() {
        return Err(ShellError::Spawn(
            String::new(),
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "no sub-process command given"),
        ));
    }

    let mut command = tokio::process::Command::new(&cli.command[0]);
    command
        .args(&cli.command[1..])
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    let mut child = command
        .spawn()
        .map_err(|e| ShellError::Spawn(cli.command.join(" "), e))?;

    let child_pid = child.id().map(|id| id as i32);
    let forwarder = tokio::spawn(forward_signals(child_pid));

    let status = child
        .wait()
        .await
        .map_err(|e| ShellError::Spawn(cli.command.join(" "), e))?;

    forwarder.abort();

    Ok(ExitCode::from(status.code().unwrap_or(1).clamp(0, 255) as u8))
}

async fn forward_signals(child_pid: Option<i32>) {
    let Ok(mut sigint) = signal(SignalKind::interrupt()) else {
        return;
    };
    let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
        return;
    };

    loop {
        let sig = tokio::select! {
            _ = sigint.recv() => Signal::SIGINT,
            _ = sigterm.recv() => Signal::SIGTERM,
        };

        if let Some(pid) = child_pid {
            let _ = nix::sys::signal::kill(Pid::from_raw(pid), sig);
        }
    }
}
