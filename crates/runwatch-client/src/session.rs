use crate::channel::{ChannelError, ChannelEvent, ChannelState, CommandChannel};
use runwatch_core::{Command, ConnectionStatus, Dispatch, Engine, Snapshot, Update, ViewProjector};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use url::Url;

const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub auto_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Issue(Command),
    Summary,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Closed,
    Quit,
}

/// One connection's worth of client state. The registry lives and dies with
/// the session.
pub struct Session<P> {
    engine: Engine<P>,
    channel: CommandChannel,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    config: SessionConfig,
}

impl<P: ViewProjector> Session<P> {
    pub fn new(projector: P, config: SessionConfig) -> Result<Self, ChannelError> {
        let mut channel = CommandChannel::new();
        let events = channel.take_events()?;
        Ok(Self {
            engine: Engine::new(projector),
            channel,
            events,
            config,
        })
    }

    pub async fn connect(&mut self, endpoint: &Url) -> Result<(), ChannelError> {
        let result = self.channel.connect(endpoint).await;
        if result.is_err() {
            self.drain_ready();
        }
        result
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.engine.snapshot()
    }

    pub fn into_projector(self) -> P {
        self.engine.into_projector()
    }

    /// Sends a command and, once the channel has accepted it, marks its targets
    /// pending. Rejections are reported to the projector and returned.
    pub fn issue(&mut self, command: Command) -> Result<(), ChannelError> {
        match self.channel.send(&command) {
            Ok(()) => {
                self.engine.command_issued(&command);
                Ok(())
            }
            Err(err) => {
                warn!(event = "command_rejected", command = %command, error = %err);
                self.engine.command_rejected(&command, &err.to_string());
                Err(err)
            }
        }
    }

    /// Applies one channel event completely. Returns `false` once the channel
    /// has closed.
    pub fn handle_event(&mut self, event: ChannelEvent) -> bool {
        match event {
            ChannelEvent::Opened { endpoint } => {
                info!(event = "session_opened", endpoint = %endpoint);
                self.engine
                    .connection(&ConnectionStatus::Opened { endpoint });
                true
            }
            ChannelEvent::Update(update) => {
                let full_discovery = matches!(update, Update::TestSetDiscovered(_));
                let dispatch = self.engine.dispatch(update);
                if full_discovery && self.config.auto_run && matches!(dispatch, Dispatch::Applied(_)) {
                    let _ = self.issue(Command::RunAll);
                }
                true
            }
            ChannelEvent::Errored(message) => {
                warn!(event = "session_transport_error", error = %message);
                self.engine
                    .connection(&ConnectionStatus::Errored { message });
                true
            }
            ChannelEvent::Closed { reason } => {
                info!(event = "session_closed", reason = reason.as_deref().unwrap_or(""));
                self.engine.connection(&ConnectionStatus::Closed { reason });
                false
            }
        }
    }

    pub async fn run(&mut self, commands: &mut mpsc::Receiver<SessionCommand>) -> SessionEnd {
        let mut commands_open = true;
        loop {
            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else {
                        return SessionEnd::Closed;
                    };
                    if !self.handle_event(event) {
                        return SessionEnd::Closed;
                    }
                }
                command = commands.recv(), if commands_open => match command {
                    Some(SessionCommand::Issue(command)) => {
                        let _ = self.issue(command);
                    }
                    Some(SessionCommand::Summary) => self.engine.report_summary(),
                    Some(SessionCommand::Quit) => {
                        self.shutdown().await;
                        return SessionEnd::Quit;
                    }
                    None => commands_open = false,
                },
            }
        }
    }

    async fn shutdown(&mut self) {
        self.channel.close();
        let drain = async {
            while let Some(event) = self.events.recv().await {
                if !self.handle_event(event) {
                    break;
                }
            }
        };
        if tokio::time::timeout(CLOSE_GRACE, drain).await.is_err() {
            warn!(event = "session_close_timeout");
        }
    }

    fn drain_ready(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            if !self.handle_event(event) {
                break;
            }
        }
    }
}
