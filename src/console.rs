//! Admin console (SPEC_FULL §4.9 / C12): a line-oriented dispatcher over
//! stdin for the verbs in spec §6. Grounded on `EDMOBackend.console`'s
//! `match` over `aioconsole.ainput()` — operates on whichever session
//! happens to be first in the registry, exactly like the original (this
//! deployment model is single-robot-at-a-time from the console's
//! perspective; multiple simultaneous sessions are still served by the
//! tick loop, just not individually addressable here).

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::backend::Backend;

/// Reads lines from stdin until EOF or `shutdown_tx` is flipped elsewhere,
/// dispatching each to the session dispatch table. A parse error or
/// unknown command prints and the loop continues — never fatal, per
/// spec §7.
pub async fn run(backend: Arc<Backend>, shutdown_tx: watch::Sender<bool>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        let line = tokio::select! {
            result = lines.next_line() => result,
            _ = shutdown_rx.changed() => return,
        };

        let Ok(Some(line)) = line else {
            return;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Err(err) = dispatch(&backend, &shutdown_tx, line).await {
            warn!(command = %line, error = %err, "admin command failed");
        }
    }
}

async fn dispatch(backend: &Arc<Backend>, shutdown_tx: &watch::Sender<bool>, line: &str) -> anyhow::Result<()> {
    let mut parts = line.split_whitespace();
    let Some(verb) = parts.next() else {
        return Ok(());
    };

    match verb {
        "sessions" => {
            let sessions = backend.sessions_snapshot().await;
            for session in sessions {
                println!("{}", session.identity());
            }
        }

        "getHz" => println!("{}", backend.tick_hz()),

        "kill" => {
            info!("kill received, shutting down");
            let _ = shutdown_tx.send(true);
        }

        "startlog" => {
            if let Some(session) = first_session(backend).await {
                session.start_log().await?;
            }
        }

        "stoplog" => {
            if let Some(session) = first_session(backend).await {
                session.stop_log().await?;
            }
        }

        "start" => {
            let Some(session) = first_session(backend).await else {
                return Ok(());
            };
            let tag = parts.next().unwrap_or("");
            let repeats: usize = parts.next().unwrap_or("1").parse().unwrap_or(1);
            backend.run_program(session.identity(), tag, repeats).await?;
        }

        "run" => {
            let Some(session) = first_session(backend).await else {
                return Ok(());
            };
            if let Some(motor_id) = parts.next().and_then(|s| s.parse::<u8>().ok()) {
                crate::session::sweep::run_motor_sweep(&session, motor_id, 0.05, 90.0).await?;
            }
        }

        "stop" => {
            if let Some(session) = first_session(backend).await {
                session.stop_all_motors().await;
            }
        }

        "reset" => {
            if let Some(session) = first_session(backend).await {
                session.reset_all_motors().await;
            }
        }

        "freq" | "off" | "amp" | "phb" | "rev" | "ord" => {
            let Some(session) = first_session(backend).await else {
                return Ok(());
            };
            let value = parts.next().unwrap_or("0");
            let motor_id: u8 = parts.next().unwrap_or("0").parse().unwrap_or(0);
            session.admin_set_motor(motor_id, verb, value).await;
        }

        other => println!("{other} is not a command"),
    }

    Ok(())
}

async fn first_session(backend: &Arc<Backend>) -> Option<Arc<crate::session::Session>> {
    backend.sessions_snapshot().await.into_iter().next()
}
