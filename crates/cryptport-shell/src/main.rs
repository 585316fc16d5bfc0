// SPDX-License-Identifier: AGPL-3.0
// CryptPort Shell - Line-oriented frontend

mod commands;

use async_channel::Receiver;
use commands::{ShellCommand, HELP};
use cryptport_core::{
    Endpoint, Session, SessionEvent, SessionResult, SettingsStore, TransferJob,
};
use std::process::ExitCode;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cryptport_shell=info".parse().unwrap())
                .add_directive("cryptport_core=info".parse().unwrap()),
        )
        .init();

    tracing::info!("Starting CryptPort Shell v{}", env!("CARGO_PKG_VERSION"));

    let store = match SettingsStore::new() {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("Failed to load settings: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let (session, events) = match Session::new(store.get()) {
        Ok(created) => created,
        Err(e) => {
            tracing::error!("Settings at {:?} are unusable: {}", store.path(), e);
            return ExitCode::FAILURE;
        }
    };

    let printer = tokio::spawn(print_events(events));

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!("Failed to read stdin: {}", e);
                break;
            }
        };

        let command = match ShellCommand::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };
        if command == ShellCommand::Quit {
            break;
        }
        if let Err(e) = run(&session, &store, command).await {
            println!("error: {}", e);
        }
    }

    session.logout().await;
    printer.abort();
    ExitCode::SUCCESS
}

async fn run(session: &Session, store: &SettingsStore, command: ShellCommand) -> SessionResult<()> {
    match command {
        ShellCommand::Help => println!("{}", HELP),
        ShellCommand::Login { email, password } => {
            session.login(&email, &password).await?;
            println!("token: {}", session.auth().display_token());
        }
        ShellCommand::Register(form) => {
            form.validate()?;
            println!("Registration details for {} look valid", form.username.trim());
        }
        ShellCommand::Logout => session.logout().await,
        ShellCommand::Connect(endpoint) => {
            let endpoint = endpoint.unwrap_or_else(|| session.settings().endpoint());
            session.connect(&endpoint.host, endpoint.port).await?;
            remember(store, &endpoint);
        }
        ShellCommand::Authenticate => {
            let token = session.auth().get_token();
            session.authenticate(&token).await?;
        }
        ShellCommand::Open(endpoint) => {
            let endpoint = endpoint.unwrap_or_else(|| session.settings().endpoint());
            session.open(&endpoint.host, endpoint.port).await?;
            remember(store, &endpoint);
        }
        ShellCommand::Disconnect => session.disconnect().await,
        // Entries are printed by the event task
        ShellCommand::List => {
            session.list_files().await?;
        }
        ShellCommand::Upload { path } => {
            let id = session.start_upload(&path)?;
            println!("upload {} started", id);
        }
        ShellCommand::Download { name, path } => {
            let id = session.start_download(&name, &path)?;
            println!("download {} started", id);
        }
        ShellCommand::Delete { name } => println!("{}", session.delete_file(&name).await?),
        ShellCommand::Cancel { id } => session.cancel_transfer(id)?,
        ShellCommand::Jobs => {
            let jobs = session.active_jobs();
            if jobs.is_empty() {
                println!("no active transfers");
            }
            jobs.iter().for_each(print_job);
        }
        ShellCommand::History => session.history().list().iter().for_each(print_job),
        ShellCommand::Status => {
            let state = session.state();
            println!(
                "state: {} ({})",
                state,
                if state.is_connected() { "online" } else { "offline" }
            );
            if let Some(info) = session.connection_info() {
                println!(
                    "server: {}:{} since {}",
                    info.host,
                    info.port,
                    info.connected_at.to_rfc3339()
                );
            }
            match session.auth().email() {
                Some(email) => println!("logged in as {}", email),
                None => println!("not logged in"),
            }
        }
        ShellCommand::Quit => {}
    }
    Ok(())
}

fn remember(store: &SettingsStore, endpoint: &Endpoint) {
    if let Err(e) = store.remember_endpoint(endpoint) {
        tracing::warn!("Failed to remember server {}: {}", endpoint, e);
    }
}

fn print_job(job: &TransferJob) {
    println!(
        "{} {:?} {} {:?} {}/{} ({:.0}%){}",
        job.id,
        job.direction,
        job.remote_name,
        job.status,
        job.transferred_bytes,
        job.total_bytes,
        job.percentage(),
        job.message
            .as_deref()
            .map(|m| format!(" - {}", m))
            .unwrap_or_default()
    );
}

async fn print_events(events: Receiver<SessionEvent>) {
    while let Ok(event) = events.recv().await {
        match event {
            SessionEvent::AuthResult { success, message } => {
                println!("[auth] {} {}", if success { "ok" } else { "failed:" }, message)
            }
            SessionEvent::ConnectionChanged { connected, reason } => {
                println!(
                    "[connection] {} ({})",
                    if connected { "connected" } else { "disconnected" },
                    reason
                )
            }
            SessionEvent::StateChanged { state } => println!("[state] {}", state),
            SessionEvent::TransferProgress {
                job_id,
                transferred_bytes,
                total_bytes,
            } => println!("[{}] {}/{} bytes", job_id, transferred_bytes, total_bytes),
            SessionEvent::TransferFinished {
                job_id,
                status,
                message,
                ..
            } => println!("[{}] {:?}: {}", job_id, status, message),
            SessionEvent::FileList {
                success,
                entries,
                message,
            } => {
                if !success {
                    println!("[list] failed: {}", message);
                    continue;
                }
                println!("[list] {} file(s)", entries.len());
                for entry in entries {
                    println!(
                        "  {:>12}  {}  {}",
                        entry.size,
                        entry.modified_at.format("%Y-%m-%d %H:%M"),
                        entry.name
                    );
                }
            }
        }
    }
}
