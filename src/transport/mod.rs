//! # Transport Sessions
//!
//! A transport session is the bidirectional channel to the remote
//! conversational agent. The pipeline only drives it: audio chunks and text
//! turns go out, audio, text and control events come back.
//!
//! ## Key Components:
//! - **TransportConnector**: opens a session for a given voice and persona
//! - **TransportLink**: the open session, an outbound sender plus an inbound
//!   event receiver, with the I/O task running in the background
//! - **live**: connector for the vendor's streaming WebSocket API
//!
//! ## Delivery:
//! Outbound messages are fire-and-forget and at-most-once. There is no
//! acknowledgment, no timeout and no reconnection; once a send fails the
//! session is gone.

pub mod live;

use crate::audio::codec::EncodedAudioChunk;
use crate::error::PipelineError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

pub use live::LiveTransportConnector;

/// How long a closing link may take to flush its close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Parameters a transport session is opened with.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportSetup {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
}

/// Something the pipeline sends to the remote agent.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// One encoded microphone frame
    Audio(EncodedAudioChunk),
    /// A text turn (greeting or system directive)
    Text { text: String, turn_complete: bool },
}

/// Something the remote agent sent back.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Audio(EncodedAudioChunk),
    Text(String),
    TurnComplete,
    /// The user talked over the agent; queued agent audio is stale
    Interrupted,
    Closed { reason: String },
    Error(String),
}

/// Opens transport sessions.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, setup: &TransportSetup) -> Result<TransportLink, PipelineError>;
}

/// An open transport session.
///
/// ## Ownership:
/// The session that opened the link owns it. Dropping the outbound sender
/// (`close`) tells the I/O task to say goodbye and finish.
pub struct TransportLink {
    outbound: Option<mpsc::UnboundedSender<OutboundMessage>>,
    inbound: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    task: Option<JoinHandle<()>>,
}

impl TransportLink {
    pub fn new(
        outbound: mpsc::UnboundedSender<OutboundMessage>,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound: Some(outbound),
            inbound: Some(inbound),
            task,
        }
    }

    /// Queue a message without waiting for the remote end.
    pub fn send(&self, message: OutboundMessage) -> Result<(), PipelineError> {
        let Some(outbound) = &self.outbound else {
            return Err(PipelineError::Transport("transport is closed".to_string()));
        };
        outbound
            .send(message)
            .map_err(|_| PipelineError::Transport("transport session has ended".to_string()))
    }

    pub fn send_audio(&self, chunk: EncodedAudioChunk) -> Result<(), PipelineError> {
        self.send(OutboundMessage::Audio(chunk))
    }

    pub fn send_text(&self, text: impl Into<String>, turn_complete: bool) -> Result<(), PipelineError> {
        self.send(OutboundMessage::Text {
            text: text.into(),
            turn_complete,
        })
    }

    /// The inbound event stream. Can be taken once.
    pub fn take_inbound(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.inbound.take()
    }

    /// Close the session. Idempotent.
    pub fn close(&mut self) {
        if self.outbound.take().is_none() {
            return;
        }
        self.inbound = None;

        if let Some(task) = self.task.take() {
            let abort = task.abort_handle();
            tokio::spawn(async move {
                if tokio::time::timeout(CLOSE_GRACE, task).await.is_err() {
                    abort.abort();
                }
            });
        }
        debug!("Transport link closed");
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.outbound.is_none()
    }
}

impl Drop for TransportLink {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// In-process connector for tests: the test holds the remote end of every
/// link it hands out.
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// The far side of a mock link.
    pub struct MockRemote {
        pub setup: TransportSetup,
        pub outbound: mpsc::UnboundedReceiver<OutboundMessage>,
        pub inbound: mpsc::UnboundedSender<TransportEvent>,
    }

    #[derive(Default)]
    pub struct MockConnector {
        remotes: Mutex<Vec<MockRemote>>,
        connects: AtomicUsize,
        fail: bool,
    }

    impl MockConnector {
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub fn connect_count(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        /// Oldest remote not yet taken by the test.
        pub fn take_remote(&self) -> Option<MockRemote> {
            let mut remotes = self.remotes.lock().unwrap();
            if remotes.is_empty() {
                None
            } else {
                Some(remotes.remove(0))
            }
        }
    }

    #[async_trait]
    impl TransportConnector for MockConnector {
        async fn connect(&self, setup: &TransportSetup) -> Result<TransportLink, PipelineError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PipelineError::Transport("connection refused".to_string()));
            }

            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            self.remotes.lock().unwrap().push(MockRemote {
                setup: setup.clone(),
                outbound: out_rx,
                inbound: in_tx,
            });
            Ok(TransportLink::new(out_tx, in_rx, None))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockConnector;
    use super::*;

    fn setup() -> TransportSetup {
        TransportSetup {
            model: "live-model".to_string(),
            voice: "Puck".to_string(),
            system_instruction: "You are a friendly caller.".to_string(),
        }
    }

    #[tokio::test]
    async fn test_messages_reach_the_remote_in_order() {
        let connector = MockConnector::default();
        let link = connector.connect(&setup()).await.unwrap();
        let mut remote = connector.take_remote().unwrap();

        link.send_text("hello", true).unwrap();
        link.send_audio(EncodedAudioChunk::new("AAA=".to_string(), "audio/pcm;rate=16000".to_string()))
            .unwrap();

        assert!(matches!(
            remote.outbound.recv().await,
            Some(OutboundMessage::Text { turn_complete: true, .. })
        ));
        assert!(matches!(remote.outbound.recv().await, Some(OutboundMessage::Audio(_))));
        assert_eq!(remote.setup.voice, "Puck");
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_sends() {
        let connector = MockConnector::default();
        let mut link = connector.connect(&setup()).await.unwrap();
        let mut remote = connector.take_remote().unwrap();

        link.close();
        link.close();

        assert!(link.is_closed());
        assert!(link.send_text("late", false).is_err());
        assert!(remote.outbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_fails_once_remote_is_gone() {
        let connector = MockConnector::default();
        let link = connector.connect(&setup()).await.unwrap();
        drop(connector.take_remote());

        let err = link.send_text("anyone there?", true).unwrap_err();
        assert_eq!(err.kind(), "transport_error");
    }

    #[tokio::test]
    async fn test_failing_connector_counts_attempts() {
        let connector = MockConnector::failing();
        assert!(connector.connect(&setup()).await.is_err());
        assert_eq!(connector.connect_count(), 1);
    }
}
