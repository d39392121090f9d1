use anyhow::Result;
use clap::Parser;
use runwatch_client::{
    channel::{ChannelError, ChannelState},
    config::{load_config, Args},
    console::ConsoleProjector,
    input::{read_commands, USAGE},
    logging::init_logging,
    session::{Session, SessionCommand, SessionConfig, SessionEnd},
};
use runwatch_core::{Snapshot, ViewProjector};
use std::{io, time::Duration};
use tokio::sync::mpsc;
use tracing::{error, info};

const COMMAND_QUEUE_CAPACITY: usize = 64;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args)?;
    let _log_guard = init_logging(&config);
    info!(
        event = "runwatch_start",
        endpoint = %config.endpoint,
        auto_run = config.auto_run,
        reconnect = config.reconnect
    );

    let (tx, mut rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    tokio::spawn(read_commands(tokio::io::stdin(), tx));
    eprintln!("{USAGE}");

    let session_config = SessionConfig {
        auto_run: config.auto_run,
    };
    let mut projector = ConsoleProjector::new(io::stdout());
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let mut session = Session::new(projector, session_config.clone())?;
        let end = match session.connect(&config.endpoint).await {
            Ok(()) => {
                backoff = INITIAL_BACKOFF;
                session.run(&mut rx).await
            }
            Err(err) if !config.reconnect => {
                error!(event = "connect_failed", error = %err);
                return Err(err.into());
            }
            Err(_) => SessionEnd::Closed,
        };
        projector = session.into_projector();

        if end == SessionEnd::Quit || !config.reconnect {
            break;
        }
        info!(event = "reconnect_scheduled", delay_ms = backoff.as_millis() as u64);
        if !wait_for_reconnect(&mut projector, &mut rx, backoff).await {
            break;
        }
        backoff = next_backoff(backoff);
    }
    info!(event = "runwatch_stop");
    Ok(())
}

/// Sits out the backoff delay. Commands arriving meanwhile are rejected since
/// there is no channel to carry them. Returns `false` when the user quit.
async fn wait_for_reconnect<P: ViewProjector>(
    projector: &mut P,
    commands: &mut mpsc::Receiver<SessionCommand>,
    delay: Duration,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            command = commands.recv() => match command {
                Some(SessionCommand::Issue(command)) => {
                    let err = ChannelError::ChannelUnavailable(ChannelState::Closed);
                    projector.on_command_rejected(&command, &err.to_string());
                }
                Some(SessionCommand::Summary) => projector.on_summary(&Snapshot::default()),
                Some(SessionCommand::Quit) => return false,
                None => {
                    (&mut sleep).await;
                    return true;
                }
            },
        }
    }
}

fn next_backoff(current: Duration) -> Duration {
    let next = current + current;
    if next > MAX_BACKOFF {
        MAX_BACKOFF
    } else {
        next
    }
}
