use futures_util::{SinkExt, StreamExt};
use runwatch_core::protocol::{decode_update, encode_command, Command, ProtocolError, Update};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    Closed,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Idle => "idle",
            ChannelState::Connecting => "connecting",
            ChannelState::Open => "open",
            ChannelState::Closed => "closed",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened { endpoint: String },
    Update(Update),
    Errored(String),
    Closed { reason: Option<String> },
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("command channel unavailable (state: {0})")]
    ChannelUnavailable(ChannelState),
    #[error("command channel already started (state: {0})")]
    AlreadyStarted(ChannelState),
    #[error("connect to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("command channel already has an event handler")]
    HandlerAlreadyRegistered,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Point-to-point command channel over a websocket.
///
/// The state only moves forward: `Idle -> Connecting -> Open -> Closed`. Closing
/// is final; reconnecting means building a new channel.
pub struct CommandChannel {
    state: Arc<watch::Sender<ChannelState>>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

impl Default for CommandChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandChannel {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ChannelState::Idle);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(state),
            events_tx,
            events_rx: Some(events_rx),
            outbound: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Hands out the inbound event stream. There is exactly one consumer; a
    /// second call fails.
    pub fn take_events(&mut self) -> Result<mpsc::UnboundedReceiver<ChannelEvent>, ChannelError> {
        self.events_rx
            .take()
            .ok_or(ChannelError::HandlerAlreadyRegistered)
    }

    pub async fn connect(&mut self, endpoint: &Url) -> Result<(), ChannelError> {
        self.begin()?;
        match connect_async(endpoint.as_str()).await {
            Ok((ws, _)) => {
                self.open(endpoint.as_str(), ws);
                Ok(())
            }
            Err(err) => {
                let reason = err.to_string();
                warn!(event = "channel_connect_error", endpoint = %endpoint, error = %reason);
                self.state.send_replace(ChannelState::Closed);
                let _ = self.events_tx.send(ChannelEvent::Errored(reason.clone()));
                let _ = self.events_tx.send(ChannelEvent::Closed {
                    reason: Some(reason.clone()),
                });
                Err(ChannelError::Connect {
                    endpoint: endpoint.to_string(),
                    reason,
                })
            }
        }
    }

    /// Runs the channel over an already established websocket.
    pub fn attach<S>(&mut self, endpoint: &str, ws: WebSocketStream<S>) -> Result<(), ChannelError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.begin()?;
        self.open(endpoint, ws);
        Ok(())
    }

    pub fn send(&self, command: &Command) -> Result<(), ChannelError> {
        let state = self.state();
        let outbound = match (&self.outbound, state) {
            (Some(outbound), ChannelState::Open) => outbound,
            _ => return Err(ChannelError::ChannelUnavailable(state)),
        };
        let text = encode_command(command)?;
        outbound
            .send(text)
            .map_err(|_| ChannelError::ChannelUnavailable(ChannelState::Closed))?;
        debug!(event = "command_sent", command = %command);
        Ok(())
    }

    /// Stops accepting commands at once. With a live transport the pump reports
    /// `Closed` once the websocket is shut down.
    pub fn close(&mut self) {
        let had_transport = self.outbound.take().is_some();
        let previous = self.state.send_replace(ChannelState::Closed);
        if !had_transport && previous != ChannelState::Closed {
            let _ = self.events_tx.send(ChannelEvent::Closed { reason: None });
        }
    }

    fn begin(&self) -> Result<(), ChannelError> {
        let state = self.state();
        if state != ChannelState::Idle {
            return Err(ChannelError::AlreadyStarted(state));
        }
        self.state.send_replace(ChannelState::Connecting);
        Ok(())
    }

    fn open<S>(&mut self, endpoint: &str, ws: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.outbound = Some(outbound_tx);
        self.state.send_replace(ChannelState::Open);
        info!(event = "channel_open", endpoint = %endpoint);
        let _ = self.events_tx.send(ChannelEvent::Opened {
            endpoint: endpoint.to_string(),
        });
        tokio::spawn(pump(
            ws,
            outbound_rx,
            self.events_tx.clone(),
            self.state.clone(),
        ));

        if let Err(err) = self.send(&Command::DiscoverAll) {
            warn!(event = "initial_discovery_failed", error = %err);
        }
    }
}

async fn pump<S>(
    mut ws: WebSocketStream<S>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    state: Arc<watch::Sender<ChannelState>>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut close_reason = None;
    loop {
        tokio::select! {
            incoming = ws.next() => match incoming {
                Some(Ok(Message::Text(text))) => forward_update(&text, &events),
                Some(Ok(Message::Close(frame))) => {
                    close_reason = frame
                        .map(|frame| frame.reason.to_string())
                        .filter(|reason| !reason.is_empty());
                    break;
                }
                Some(Ok(Message::Binary(bytes))) => {
                    debug!(event = "channel_binary_ignored", bytes = bytes.len());
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(event = "channel_read_error", error = %err);
                    let _ = events.send(ChannelEvent::Errored(err.to_string()));
                    close_reason = Some(err.to_string());
                    break;
                }
                None => break,
            },
            command = outbound.recv() => match command {
                Some(text) => {
                    if let Err(err) = ws.send(Message::Text(text)).await {
                        warn!(event = "channel_write_error", error = %err);
                        let _ = events.send(ChannelEvent::Errored(err.to_string()));
                        close_reason = Some(err.to_string());
                        break;
                    }
                }
                None => {
                    debug!(event = "channel_close_requested");
                    break;
                }
            },
        }
    }
    outbound.close();
    state.send_replace(ChannelState::Closed);
    let _ = ws.close(None).await;
    info!(event = "channel_closed", reason = close_reason.as_deref().unwrap_or(""));
    let _ = events.send(ChannelEvent::Closed {
        reason: close_reason,
    });
}

fn forward_update(text: &str, events: &mpsc::UnboundedSender<ChannelEvent>) {
    match decode_update(text) {
        Ok(update) => {
            let _ = events.send(ChannelEvent::Update(update));
        }
        Err(ProtocolError::UnrecognizedKind(name)) => {
            debug!(event = "update_unrecognized", update = %name);
        }
        Err(err) => {
            warn!(event = "update_malformed", error = %err, bytes = text.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_before_connect_is_unavailable() {
        let channel = CommandChannel::new();
        let err = channel.send(&Command::RunAll).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::ChannelUnavailable(ChannelState::Idle)
        ));
    }

    #[test]
    fn event_stream_has_a_single_consumer() {
        let mut channel = CommandChannel::new();
        assert!(channel.take_events().is_ok());
        assert!(matches!(
            channel.take_events(),
            Err(ChannelError::HandlerAlreadyRegistered)
        ));
    }

    #[test]
    fn closing_an_idle_channel_is_final() {
        let mut channel = CommandChannel::new();
        let mut events = channel.take_events().expect("events");
        channel.close();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(
            events.try_recv().expect("closed event"),
            ChannelEvent::Closed { reason: None }
        );
        assert!(matches!(
            channel.send(&Command::DiscoverAll),
            Err(ChannelError::ChannelUnavailable(ChannelState::Closed))
        ));

        channel.close();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn attached_stream_requests_discovery_and_forwards_updates() {
        use tokio_tungstenite::tungstenite::protocol::Role;

        let (client_io, server_io) = tokio::io::duplex(4096);
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let mut server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;

        let mut channel = CommandChannel::new();
        let mut events = channel.take_events().expect("events");
        channel.attach("memory", client).expect("attach");
        assert_eq!(channel.state(), ChannelState::Open);

        match server.next().await {
            Some(Ok(Message::Text(text))) => assert_eq!(text, r#"{"commandName":"discover all"}"#),
            other => panic!("expected discovery request, got {other:?}"),
        }
        server
            .send(Message::Text(
                r#"{"updateName":"testlistchanged","data":"Suite"}"#.to_string(),
            ))
            .await
            .expect("send update");

        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Opened {
                endpoint: "memory".to_string(),
            })
        );
        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Update(Update::TestListChanged {
                assembly_name: Some("Suite".to_string()),
            }))
        );

        channel.close();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(matches!(
            channel.send(&Command::RunAll),
            Err(ChannelError::ChannelUnavailable(ChannelState::Closed))
        ));
        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Closed { reason: None })
        );
        assert!(matches!(server.next().await, Some(Ok(Message::Close(_)))));
    }

    #[tokio::test]
    async fn dropped_transport_closes_channel() {
        use tokio_tungstenite::tungstenite::protocol::Role;

        let (client_io, server_io) = tokio::io::duplex(4096);
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let mut server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;

        let mut channel = CommandChannel::new();
        let mut events = channel.take_events().expect("events");
        channel.attach("memory", client).expect("attach");
        assert!(matches!(server.next().await, Some(Ok(Message::Text(_)))));
        drop(server);

        assert!(matches!(
            events.recv().await,
            Some(ChannelEvent::Opened { .. })
        ));
        assert!(matches!(events.recv().await, Some(ChannelEvent::Errored(_))));
        assert!(matches!(
            events.recv().await,
            Some(ChannelEvent::Closed { reason: Some(_) })
        ));
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(matches!(
            channel.send(&Command::RunAll),
            Err(ChannelError::ChannelUnavailable(ChannelState::Closed))
        ));
    }

    #[tokio::test]
    async fn failed_connect_ends_closed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let mut channel = CommandChannel::new();
        let mut events = channel.take_events().expect("events");
        let endpoint = Url::parse(&format!("ws://127.0.0.1:{port}/command")).expect("url");

        let err = channel.connect(&endpoint).await.unwrap_err();
        assert!(matches!(err, ChannelError::Connect { .. }));
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(matches!(
            events.try_recv().expect("errored"),
            ChannelEvent::Errored(_)
        ));
        assert!(matches!(
            events.try_recv().expect("closed"),
            ChannelEvent::Closed { reason: Some(_) }
        ));
        assert!(matches!(
            channel.connect(&endpoint).await,
            Err(ChannelError::AlreadyStarted(ChannelState::Closed))
        ));
    }
}
