//! # Voice Session Management
//!
//! One [`VoiceSession`] is one live call: microphone frames go out to the
//! remote agent, the agent's audio comes back and is played gaplessly.
//!
//! ## Session Lifecycle:
//! 1. **Closed**: nothing acquired yet
//! 2. **Opening**: microphone, output context and transport are acquired in
//!    that order; a denied microphone stops here and no transport is created
//! 3. **Streaming**: full-duplex audio flow
//! 4. **Closing**: everything is released, then back to **Closed**
//!
//! ## Event Dispatch:
//! Every input of a running session is a [`SessionEvent`]. `next_event` waits
//! for whichever comes first and `dispatch` handles it. There are no
//! callbacks; the session task is just `loop { dispatch(next_event()) }`.
//!
//! ## Rust Concepts:
//! - **Single owner**: the session task owns the session outright. The rest of
//!   the service talks to it through a cloneable [`SessionHandle`].
//! - **Channels**: mpsc for commands, broadcast for notifications, watch for
//!   the current state and the final close report.

use crate::audio::capture::{CaptureDevice, CaptureRequest, CaptureStream};
use crate::audio::codec::{self, SampleConversion};
use crate::audio::buffer::AudioFrameBuffer;
use crate::audio::output::{ContextState, OutputDevice, SourceId};
use crate::audio::scheduler::DownlinkScheduler;
use crate::config::AppConfig;
use crate::error::PipelineError;
use crate::persona::VoiceProfile;
use crate::transport::{TransportConnector, TransportEvent, TransportLink, TransportSetup};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Commands queued per call before senders wait.
const COMMAND_QUEUE: usize = 16;

/// Lifecycle state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Closed,
    Opening,
    Streaming,
    Closing,
}

/// What listeners of a call are told.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallNotification {
    StateChanged { state: SessionState },
    Transcript { text: String },
    AudioScheduled { source: SourceId, start: f64, duration: f64 },
    TurnComplete,
    Interrupted { stopped_sources: usize },
    Ended { reason: String },
}

/// Requests from the UI to a running call.
#[derive(Debug)]
pub enum SessionCommand {
    Directive {
        text: String,
        reply: oneshot::Sender<Result<(), PipelineError>>,
    },
    Close {
        reply: oneshot::Sender<CloseReport>,
    },
}

/// Everything a streaming session reacts to.
#[derive(Debug)]
pub enum SessionEvent {
    Frame(AudioFrameBuffer),
    Inbound(TransportEvent),
    SourceEnded(SourceId),
    Command(SessionCommand),
}

/// Whether the call goes on after an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    Continue,
    End(String),
}

/// What a call did, returned by every close.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CloseReport {
    pub call_id: String,
    pub reason: String,
    pub frames_sent: u64,
    pub chunks_scheduled: u64,
    pub chunks_skipped: u64,
    pub directives_sent: u64,
    pub stopped_sources: usize,
    pub active_sources: usize,
}

/// Formats and model a call is opened with.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub model: String,
    pub capture: CaptureRequest,
    pub output_sample_rate: u32,
    pub output_channels: u16,
    pub uplink_overflow: SampleConversion,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            model: config.transport.model.clone(),
            capture: CaptureRequest {
                sample_rate: config.audio.input_sample_rate,
                channels: config.audio.input_channels,
                frame_size: config.audio.frame_size,
            },
            output_sample_rate: config.audio.output_sample_rate,
            output_channels: config.audio.output_channels,
            uplink_overflow: config.audio.uplink_overflow,
        }
    }
}

/// Platform pieces a call is built from.
#[derive(Clone)]
pub struct SessionDeps {
    pub capture: Arc<dyn CaptureDevice>,
    pub output: Arc<dyn OutputDevice>,
    pub connector: Arc<dyn TransportConnector>,
}

#[derive(Debug, Default)]
struct SessionStats {
    frames_sent: u64,
    chunks_scheduled: u64,
    chunks_skipped: u64,
    directives_sent: u64,
}

async fn recv<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_unbounded<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// One live call and everything it holds.
pub struct VoiceSession {
    id: String,
    profile: VoiceProfile,
    settings: SessionSettings,
    state: SessionState,
    capture: Option<CaptureStream>,
    frames: Option<mpsc::Receiver<AudioFrameBuffer>>,
    downlink: Option<DownlinkScheduler>,
    completions: Option<mpsc::UnboundedReceiver<SourceId>>,
    transport: Option<TransportLink>,
    inbound: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    commands: Option<mpsc::Receiver<SessionCommand>>,
    notifier: broadcast::Sender<CallNotification>,
    state_tx: watch::Sender<SessionState>,
    report_tx: watch::Sender<Option<CloseReport>>,
    stats: SessionStats,
    report: Option<CloseReport>,
}

impl VoiceSession {
    pub fn new(id: String, profile: VoiceProfile, settings: SessionSettings, notification_buffer: usize) -> Self {
        let (notifier, _) = broadcast::channel(notification_buffer.max(1));
        let (state_tx, _) = watch::channel(SessionState::Closed);
        let (report_tx, _) = watch::channel(None);
        Self {
            id,
            profile,
            settings,
            state: SessionState::Closed,
            capture: None,
            frames: None,
            downlink: None,
            completions: None,
            transport: None,
            inbound: None,
            commands: None,
            notifier,
            state_tx,
            report_tx,
            stats: SessionStats::default(),
            report: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallNotification> {
        self.notifier.subscribe()
    }

    /// Sources scheduled on the output context that have not ended.
    pub fn active_sources(&self) -> usize {
        self.downlink.as_ref().map(DownlinkScheduler::active_count).unwrap_or(0)
    }

    fn notify(&self, notification: CallNotification) {
        // nobody listening is fine
        let _ = self.notifier.send(notification);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        debug!(call_id = %self.id, from = ?self.state, to = ?state, "Call state changed");
        self.state = state;
        self.state_tx.send_replace(state);
        self.notify(CallNotification::StateChanged { state });
    }

    /// Acquire microphone, output and transport, greet, then start capture.
    ///
    /// On failure everything acquired so far is released and the session is
    /// back in `Closed`.
    pub async fn open(&mut self, deps: &SessionDeps) -> Result<(), PipelineError> {
        if self.state != SessionState::Closed || self.report.is_some() {
            return Err(PipelineError::InvalidState(format!(
                "call {} cannot be opened from {:?}",
                self.id, self.state
            )));
        }

        self.set_state(SessionState::Opening);
        match self.acquire(deps).await {
            Ok(()) => {
                self.set_state(SessionState::Streaming);
                info!(call_id = %self.id, persona = %self.profile.id, voice = %self.profile.voice, "Call streaming");
                Ok(())
            }
            Err(e) => {
                warn!(call_id = %self.id, kind = e.kind(), error = %e, "Call failed to open");
                self.close_with_reason(e.to_string());
                Err(e)
            }
        }
    }

    async fn acquire(&mut self, deps: &SessionDeps) -> Result<(), PipelineError> {
        // microphone first: a denied permission must not create a transport
        let capture = deps.capture.open(&self.settings.capture).await?;
        self.capture = Some(capture);

        let mut context = deps
            .output
            .open(self.settings.output_sample_rate, self.settings.output_channels)?;
        if context.state() == ContextState::Suspended {
            context.resume()?;
        }
        let mut downlink = DownlinkScheduler::new(context);
        self.completions = downlink.take_completions();
        self.downlink = Some(downlink);

        let setup = TransportSetup {
            model: self.settings.model.clone(),
            voice: self.profile.voice.clone(),
            system_instruction: self.profile.system_instruction.clone(),
        };
        let mut link = deps.connector.connect(&setup).await?;
        self.inbound = link.take_inbound();
        // priming turn goes out before any microphone audio
        link.send_text(self.profile.greeting.clone(), true)?;
        self.transport = Some(link);

        let frames = match self.capture.as_mut() {
            Some(capture) => capture.start()?,
            None => return Err(PipelineError::InvalidState("capture was released".to_string())),
        };
        self.frames = Some(frames);
        Ok(())
    }

    /// Wait for the next input. `None` once every input is gone.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            if self.commands.is_none() && self.inbound.is_none() && self.completions.is_none() && self.frames.is_none() {
                return None;
            }

            let event = tokio::select! {
                biased;
                command = recv(&mut self.commands) => match command {
                    Some(command) => SessionEvent::Command(command),
                    None => {
                        self.commands = None;
                        continue;
                    }
                },
                inbound = recv_unbounded(&mut self.inbound) => match inbound {
                    Some(event) => SessionEvent::Inbound(event),
                    None => {
                        self.inbound = None;
                        SessionEvent::Inbound(TransportEvent::Closed {
                            reason: "transport channel ended".to_string(),
                        })
                    }
                },
                ended = recv_unbounded(&mut self.completions) => match ended {
                    Some(id) => SessionEvent::SourceEnded(id),
                    None => {
                        self.completions = None;
                        continue;
                    }
                },
                frame = recv(&mut self.frames) => match frame {
                    Some(frame) => SessionEvent::Frame(frame),
                    None => {
                        self.frames = None;
                        continue;
                    }
                },
            };
            return Some(event);
        }
    }

    /// Handle one event.
    pub fn dispatch(&mut self, event: SessionEvent) -> Flow {
        match event {
            SessionEvent::Frame(frame) => self.send_frame(&frame),
            SessionEvent::Inbound(event) => self.handle_inbound(event),
            SessionEvent::SourceEnded(id) => {
                if let Some(downlink) = self.downlink.as_mut() {
                    downlink.source_ended(id);
                }
                Flow::Continue
            }
            SessionEvent::Command(SessionCommand::Directive { text, reply }) => {
                let _ = reply.send(self.inject_system_directive(&text));
                Flow::Continue
            }
            SessionEvent::Command(SessionCommand::Close { reply }) => {
                let report = self.close_with_reason("hung up".to_string());
                let _ = reply.send(report);
                Flow::End("hung up".to_string())
            }
        }
    }

    fn send_frame(&mut self, frame: &AudioFrameBuffer) -> Flow {
        if self.state != SessionState::Streaming {
            return Flow::Continue;
        }
        let Some(transport) = self.transport.as_ref() else {
            return Flow::Continue;
        };

        let chunk = codec::encode_float_frame(frame.channel(0), frame.sample_rate(), self.settings.uplink_overflow);
        match transport.send_audio(chunk) {
            Ok(()) => {
                trace!(sequence = frame.sequence(), frames = frame.frame_count(), "Sent uplink frame");
                self.stats.frames_sent += 1;
                Flow::Continue
            }
            // no retry: a failed send means the remote is gone
            Err(e) => Flow::End(e.to_string()),
        }
    }

    fn handle_inbound(&mut self, event: TransportEvent) -> Flow {
        match event {
            TransportEvent::Audio(chunk) => {
                let Some(downlink) = self.downlink.as_mut() else {
                    return Flow::Continue;
                };
                match downlink.schedule(&chunk) {
                    Ok(scheduled) => {
                        self.stats.chunks_scheduled += 1;
                        self.notify(CallNotification::AudioScheduled {
                            source: scheduled.source,
                            start: scheduled.start,
                            duration: scheduled.duration,
                        });
                        Flow::Continue
                    }
                    Err(e) if !e.is_fatal() => {
                        self.stats.chunks_skipped += 1;
                        warn!(call_id = %self.id, error = %e, "Skipping undecodable audio chunk");
                        Flow::Continue
                    }
                    Err(e) => Flow::End(e.to_string()),
                }
            }
            TransportEvent::Text(text) => {
                self.notify(CallNotification::Transcript { text });
                Flow::Continue
            }
            TransportEvent::TurnComplete => {
                self.notify(CallNotification::TurnComplete);
                Flow::Continue
            }
            TransportEvent::Interrupted => {
                let stopped_sources = self.downlink.as_mut().map(DownlinkScheduler::interrupt).unwrap_or(0);
                self.notify(CallNotification::Interrupted { stopped_sources });
                Flow::Continue
            }
            TransportEvent::Closed { reason } => Flow::End(format!("remote closed: {}", reason)),
            TransportEvent::Error(message) => {
                warn!(call_id = %self.id, error = %message, "Transport failed");
                Flow::End(format!("transport error: {}", message))
            }
        }
    }

    /// Send an out-of-band instruction as a text turn. Only while streaming.
    pub fn inject_system_directive(&mut self, text: &str) -> Result<(), PipelineError> {
        if self.state != SessionState::Streaming {
            return Err(PipelineError::InvalidState(format!("call {} is not streaming", self.id)));
        }
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| PipelineError::InvalidState("transport is not open".to_string()))?;
        transport.send_text(text, true)?;
        self.stats.directives_sent += 1;
        debug!(call_id = %self.id, "System directive sent");
        Ok(())
    }

    /// Release everything. Safe from any state and any number of times.
    pub fn close(&mut self) -> CloseReport {
        self.close_with_reason("closed".to_string())
    }

    fn close_with_reason(&mut self, reason: String) -> CloseReport {
        if let Some(report) = &self.report {
            return report.clone();
        }

        let was_open = self.state != SessionState::Closed;
        if was_open {
            self.set_state(SessionState::Closing);
        }

        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        self.frames = None;

        let mut stopped_sources = 0;
        if let Some(mut downlink) = self.downlink.take() {
            stopped_sources = downlink.stop_all();
            downlink.close();
        }
        self.completions = None;

        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.inbound = None;
        self.commands = None;

        let report = CloseReport {
            call_id: self.id.clone(),
            reason: reason.clone(),
            frames_sent: self.stats.frames_sent,
            chunks_scheduled: self.stats.chunks_scheduled,
            chunks_skipped: self.stats.chunks_skipped,
            directives_sent: self.stats.directives_sent,
            stopped_sources,
            active_sources: self.active_sources(),
        };

        // report first, so anyone woken by the state change can read it
        self.report = Some(report.clone());
        self.report_tx.send_replace(Some(report.clone()));
        self.set_state(SessionState::Closed);
        if was_open {
            self.notify(CallNotification::Ended { reason: reason.clone() });
            info!(call_id = %self.id, reason = %reason, frames_sent = report.frames_sent, "Call closed");
        }
        report
    }

    /// Handle for the rest of the service.
    pub fn handle(&self, commands: mpsc::Sender<SessionCommand>) -> SessionHandle {
        SessionHandle {
            id: self.id.clone(),
            persona_id: self.profile.id.clone(),
            started_at: Utc::now(),
            commands,
            notifications: self.notifier.clone(),
            state: self.state_tx.subscribe(),
            report: self.report_tx.subscribe(),
        }
    }

    /// The session task: open, then dispatch until the call ends.
    ///
    /// A close command that arrives while still opening cancels the open.
    pub async fn run(
        mut self,
        deps: SessionDeps,
        mut commands: mpsc::Receiver<SessionCommand>,
        opened: Option<oneshot::Sender<Result<(), PipelineError>>>,
    ) -> CloseReport {
        let mut cancelled_by: Option<oneshot::Sender<CloseReport>> = None;
        let result = {
            let open = self.open(&deps);
            tokio::pin!(open);
            loop {
                tokio::select! {
                    result = &mut open => break result,
                    command = commands.recv() => match command {
                        Some(SessionCommand::Directive { reply, .. }) => {
                            let _ = reply.send(Err(PipelineError::InvalidState("call is still connecting".to_string())));
                        }
                        Some(SessionCommand::Close { reply }) => {
                            cancelled_by = Some(reply);
                            break Err(PipelineError::InvalidState("call was closed while connecting".to_string()));
                        }
                        None => break Err(PipelineError::InvalidState("call handle dropped while connecting".to_string())),
                    },
                }
            }
        };

        if let Err(e) = result {
            let report = self.close_with_reason(e.to_string());
            if let Some(reply) = cancelled_by {
                let _ = reply.send(report.clone());
            }
            if let Some(opened) = opened {
                let _ = opened.send(Err(e));
            }
            return report;
        }
        if let Some(opened) = opened {
            let _ = opened.send(Ok(()));
        }

        self.commands = Some(commands);
        let reason = loop {
            let Some(event) = self.next_event().await else {
                break "session inputs ended".to_string();
            };
            if let Flow::End(reason) = self.dispatch(event) {
                break reason;
            }
        };
        self.close_with_reason(reason)
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.close_with_reason("dropped".to_string());
    }
}

/// Cloneable, UI-facing view of a call.
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    persona_id: String,
    started_at: DateTime<Utc>,
    commands: mpsc::Sender<SessionCommand>,
    notifications: broadcast::Sender<CallNotification>,
    state: watch::Receiver<SessionState>,
    report: watch::Receiver<Option<CloseReport>>,
}

/// Listing entry for a call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSummary {
    pub call_id: String,
    pub persona_id: String,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallNotification> {
        self.notifications.subscribe()
    }

    pub fn summary(&self) -> CallSummary {
        CallSummary {
            call_id: self.id.clone(),
            persona_id: self.persona_id.clone(),
            state: self.state(),
            started_at: self.started_at,
        }
    }

    /// Final report, once the call has closed.
    pub fn report(&self) -> Option<CloseReport> {
        self.report.borrow().clone()
    }

    /// Send a system directive to the running call.
    pub async fn inject(&self, text: impl Into<String>) -> Result<(), PipelineError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(SessionCommand::Directive {
                text: text.into(),
                reply,
            })
            .await
            .map_err(|_| PipelineError::InvalidState(format!("call {} has ended", self.id)))?;
        response
            .await
            .map_err(|_| PipelineError::InvalidState(format!("call {} has ended", self.id)))?
    }

    /// Hang up. Idempotent, also after the call ended on its own.
    pub async fn close(&self) -> CloseReport {
        if let Some(report) = self.report() {
            return report;
        }

        let (reply, response) = oneshot::channel();
        if self.commands.send(SessionCommand::Close { reply }).await.is_ok() {
            if let Ok(report) = response.await {
                return report;
            }
        }

        // the task ended between the check and the send
        let mut report = self.report.clone();
        let waited = report.wait_for(Option::is_some).await.map(|done| done.clone());
        match waited {
            Ok(done) => done.unwrap_or_default(),
            Err(_) => CloseReport {
                call_id: self.id.clone(),
                reason: "session task ended".to_string(),
                ..CloseReport::default()
            },
        }
    }
}

/// Registry of calls.
///
/// ## Resource Management:
/// - Enforces the maximum number of concurrent calls
/// - Prunes calls that have closed
/// - Closes every call on shutdown
pub struct SessionManager {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    max_concurrent_sessions: AtomicUsize,
    notification_buffer: usize,
    deps: SessionDeps,
}

impl SessionManager {
    pub fn new(deps: SessionDeps, max_concurrent_sessions: usize, notification_buffer: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_concurrent_sessions: AtomicUsize::new(max_concurrent_sessions),
            notification_buffer,
            deps,
        }
    }

    pub fn set_limit(&self, max_concurrent_sessions: usize) {
        self.max_concurrent_sessions.store(max_concurrent_sessions, Ordering::SeqCst);
    }

    pub fn limit(&self) -> usize {
        self.max_concurrent_sessions.load(Ordering::SeqCst)
    }

    /// Start a call with `profile` and wait until it is streaming.
    pub async fn start(&self, profile: VoiceProfile, settings: SessionSettings) -> Result<SessionHandle, PipelineError> {
        self.prune();

        let (session, handle, commands) = {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            let limit = self.limit();
            if sessions.len() >= limit {
                return Err(PipelineError::Unavailable(format!(
                    "maximum concurrent calls ({}) reached",
                    limit
                )));
            }

            let id = Uuid::new_v4().to_string();
            let session = VoiceSession::new(id.clone(), profile, settings, self.notification_buffer);
            let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
            let handle = session.handle(commands_tx);
            sessions.insert(id, handle.clone());
            (session, handle, commands_rx)
        };

        let (opened_tx, opened_rx) = oneshot::channel();
        tokio::spawn(session.run(self.deps.clone(), commands, Some(opened_tx)));

        let opened = opened_rx
            .await
            .unwrap_or_else(|_| Err(PipelineError::InvalidState("call task ended while connecting".to_string())));
        match opened {
            Ok(()) => Ok(handle),
            Err(e) => {
                self.remove(handle.id());
                Err(e)
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).get(id).cloned()
    }

    pub fn list(&self) -> Vec<CallSummary> {
        let mut calls: Vec<CallSummary> = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(SessionHandle::summary)
            .collect();
        calls.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        calls
    }

    /// Calls that have not closed yet.
    pub fn active_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|handle| handle.state() != SessionState::Closed)
            .count()
    }

    fn remove(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner()).remove(id)
    }

    /// Drop closed calls from the registry.
    pub fn prune(&self) -> usize {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        sessions.retain(|_, handle| handle.state() != SessionState::Closed);
        before - sessions.len()
    }

    /// Hang up a call. `None` when the id is unknown (or already pruned).
    pub async fn close(&self, id: &str) -> Option<CloseReport> {
        let handle = self.remove(id)?;
        Some(handle.close().await)
    }

    /// Hang up every call.
    pub async fn close_all(&self) -> usize {
        let handles: Vec<SessionHandle> = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in &handles {
            handle.close().await;
        }
        if !handles.is_empty() {
            info!(count = handles.len(), "Closed all calls");
        }
        handles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::capture::{MicrophoneSource, SimulatedMicrophone};
    use crate::audio::codec::{decode_base64, encode_float_frame};
    use crate::audio::output::probe::ProbedOutput;
    use crate::transport::mock::MockConnector;
    use crate::transport::OutboundMessage;
    use std::time::Duration;

    struct Fixture {
        deps: SessionDeps,
        output: Arc<ProbedOutput>,
        connector: Arc<MockConnector>,
    }

    fn fixture(microphone: MicrophoneSource, connector: MockConnector) -> Fixture {
        let output = Arc::new(ProbedOutput::new());
        let connector = Arc::new(connector);
        Fixture {
            deps: SessionDeps {
                capture: Arc::new(SimulatedMicrophone::new(microphone)),
                output: output.clone(),
                connector: connector.clone(),
            },
            output,
            connector,
        }
    }

    fn profile() -> VoiceProfile {
        VoiceProfile {
            id: "mom".to_string(),
            display_name: "Mom".to_string(),
            voice: "Kore".to_string(),
            system_instruction: "You are Mom.".to_string(),
            greeting: "Say hi to your kid.".to_string(),
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings::from_config(&AppConfig::default())
    }

    fn session() -> VoiceSession {
        VoiceSession::new("call-1".to_string(), profile(), settings(), 64)
    }

    fn one_second_chunk() -> TransportEvent {
        TransportEvent::Audio(encode_float_frame(&vec![0.1; 24000], 24000, SampleConversion::Clamp))
    }

    #[tokio::test(start_paused = true)]
    async fn test_mono_agent_audio_on_stereo_output_keeps_duration() {
        let fx = fixture(MicrophoneSource::Silence, MockConnector::default());
        let mut stereo = settings();
        stereo.output_channels = 2;
        let mut session = VoiceSession::new("call-1".to_string(), profile(), stereo, 64);
        session.open(&fx.deps).await.unwrap();

        let remote = fx.connector.take_remote().unwrap();
        remote.inbound.send(one_second_chunk()).unwrap();
        remote.inbound.send(one_second_chunk()).unwrap();
        let mut scheduled = 0;
        while scheduled < 2 {
            let event = session.next_event().await.unwrap();
            if matches!(event, SessionEvent::Inbound(TransportEvent::Audio(_))) {
                scheduled += 1;
            }
            session.dispatch(event);
        }

        let log = fx.output.probes()[0].lock().unwrap().scheduled.clone();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].duration, 1.0);
        assert_eq!(log[0].channels, 2);
        assert!((log[1].start - log[0].start - 1.0).abs() < 1e-9);
        session.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_three_chunks_then_close() {
        let fx = fixture(MicrophoneSource::Silence, MockConnector::default());
        let mut session = session();
        session.open(&fx.deps).await.unwrap();
        assert_eq!(session.state(), SessionState::Streaming);

        let mut remote = fx.connector.take_remote().unwrap();
        assert_eq!(remote.setup.voice, "Kore");
        assert_eq!(remote.setup.system_instruction, "You are Mom.");
        match remote.outbound.recv().await {
            Some(OutboundMessage::Text { text, turn_complete }) => {
                assert_eq!(text, "Say hi to your kid.");
                assert!(turn_complete);
            }
            other => panic!("expected greeting first, got {:?}", other),
        }

        for _ in 0..3 {
            remote.inbound.send(one_second_chunk()).unwrap();
        }
        let mut scheduled = 0;
        while scheduled < 3 {
            let event = session.next_event().await.unwrap();
            if matches!(event, SessionEvent::Inbound(TransportEvent::Audio(_))) {
                scheduled += 1;
            }
            assert_eq!(session.dispatch(event), Flow::Continue);
        }
        assert_eq!(session.active_sources(), 3);

        let starts: Vec<f64> = fx.output.probes()[0]
            .lock()
            .unwrap()
            .scheduled
            .iter()
            .map(|entry| entry.start)
            .collect();
        assert_eq!(starts.len(), 3);
        for pair in starts.windows(2) {
            assert!(pair[1] >= pair[0] + 1.0 - 1e-9, "chunks overlap: {:?}", starts);
        }

        let report = session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(report.active_sources, 0);
        assert_eq!(report.chunks_scheduled, 3);
        assert_eq!(session.active_sources(), 0);
        assert!(fx.output.probes()[0].lock().unwrap().closed);

        // second close is a no-op with the same report
        assert_eq!(session.close(), report);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denial_creates_no_transport() {
        let fx = fixture(MicrophoneSource::Denied, MockConnector::default());
        let mut session = session();
        let mut notifications = session.subscribe();

        let err = session.open(&fx.deps).await.unwrap_err();
        assert_eq!(err.kind(), "permission_error");
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(fx.connector.connect_count(), 0);
        assert!(fx.output.probes().is_empty());

        assert_eq!(
            notifications.recv().await.unwrap(),
            CallNotification::StateChanged { state: SessionState::Opening }
        );
        session.close();
    }

    #[tokio::test]
    async fn test_close_before_open_and_twice() {
        let mut session = session();
        let first = session.close();
        let second = session.close();
        assert_eq!(first, second);
        assert_eq!(first.active_sources, 0);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_releases_capture_and_output() {
        let fx = fixture(MicrophoneSource::Silence, MockConnector::failing());
        let mut session = session();

        let err = session.open(&fx.deps).await.unwrap_err();
        assert_eq!(err.kind(), "transport_error");
        assert_eq!(session.state(), SessionState::Closed);
        assert!(fx.output.probes()[0].lock().unwrap().closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_are_encoded_and_sent() {
        let fx = fixture(MicrophoneSource::Tone { frequency_hz: 440.0 }, MockConnector::default());
        let mut session = session();
        session.open(&fx.deps).await.unwrap();
        let mut remote = fx.connector.take_remote().unwrap();
        remote.outbound.recv().await.unwrap();

        let event = session.next_event().await.unwrap();
        assert!(matches!(event, SessionEvent::Frame(_)));
        session.dispatch(event);

        match remote.outbound.recv().await {
            Some(OutboundMessage::Audio(chunk)) => {
                assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
                assert_eq!(decode_base64(&chunk.data).unwrap().len(), 4096 * 2);
            }
            other => panic!("expected audio, got {:?}", other),
        }
        session.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_frame_send_ends_the_call() {
        let fx = fixture(MicrophoneSource::Silence, MockConnector::default());
        let mut session = session();
        session.open(&fx.deps).await.unwrap();
        let remote = fx.connector.take_remote().unwrap();
        drop(remote.outbound);

        let event = loop {
            let event = session.next_event().await.unwrap();
            if matches!(event, SessionEvent::Frame(_)) {
                break event;
            }
        };
        assert!(matches!(session.dispatch(event), Flow::End(_)));
        session.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_and_bad_chunk() {
        let fx = fixture(MicrophoneSource::Silence, MockConnector::default());
        let mut session = session();
        session.open(&fx.deps).await.unwrap();

        assert_eq!(session.dispatch(SessionEvent::Inbound(one_second_chunk())), Flow::Continue);
        assert_eq!(session.dispatch(SessionEvent::Inbound(one_second_chunk())), Flow::Continue);
        assert_eq!(session.active_sources(), 2);

        let bad = TransportEvent::Audio(crate::audio::codec::EncodedAudioChunk::new(
            "!!".to_string(),
            "audio/pcm;rate=24000".to_string(),
        ));
        assert_eq!(session.dispatch(SessionEvent::Inbound(bad)), Flow::Continue);

        assert_eq!(session.dispatch(SessionEvent::Inbound(TransportEvent::Interrupted)), Flow::Continue);
        assert_eq!(session.active_sources(), 0);

        let closed = TransportEvent::Closed {
            reason: "bye".to_string(),
        };
        assert!(matches!(session.dispatch(SessionEvent::Inbound(closed)), Flow::End(_)));
        let report = session.close();
        assert_eq!(report.chunks_skipped, 1);
    }

    #[tokio::test]
    async fn test_directive_requires_streaming() {
        let mut session = session();
        let err = session.inject_system_directive("hello?").unwrap_err();
        assert_eq!(err.kind(), "invalid_state");
    }

    #[tokio::test(start_paused = true)]
    async fn test_manager_runs_call_through_handle() {
        let fx = fixture(MicrophoneSource::Silence, MockConnector::default());
        let manager = SessionManager::new(fx.deps.clone(), 2, 64);

        let handle = manager.start(profile(), settings()).await.unwrap();
        assert_eq!(handle.state(), SessionState::Streaming);
        assert_eq!(manager.active_count(), 1);
        let mut notifications = handle.subscribe();

        let mut remote = fx.connector.take_remote().unwrap();
        remote.outbound.recv().await.unwrap();

        handle.inject("The user turned on video.").await.unwrap();
        let directive = loop {
            match remote.outbound.recv().await.unwrap() {
                OutboundMessage::Text { text, .. } => break text,
                OutboundMessage::Audio(_) => continue,
            }
        };
        assert_eq!(directive, "The user turned on video.");

        remote.inbound.send(one_second_chunk()).unwrap();
        loop {
            if let CallNotification::AudioScheduled { duration, .. } = notifications.recv().await.unwrap() {
                assert!((duration - 1.0).abs() < 1e-9);
                break;
            }
        }

        let report = handle.close().await;
        assert_eq!(report.reason, "hung up");
        assert_eq!(report.active_sources, 0);
        assert_eq!(handle.close().await, report);
        assert_eq!(handle.state(), SessionState::Closed);
        assert!(handle.inject("too late").await.is_err());

        assert_eq!(manager.prune(), 1);
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manager_enforces_limit_and_reports_denial() {
        let fx = fixture(MicrophoneSource::Silence, MockConnector::default());
        let manager = SessionManager::new(fx.deps.clone(), 1, 64);

        let first = manager.start(profile(), settings()).await.unwrap();
        let err = manager.start(profile(), settings()).await.err().unwrap();
        assert_eq!(err.kind(), "unavailable");

        assert!(manager.close(first.id()).await.is_some());
        assert!(manager.close(first.id()).await.is_none());

        let denied = fixture(MicrophoneSource::Denied, MockConnector::default());
        let manager = SessionManager::new(denied.deps.clone(), 1, 64);
        let err = manager.start(profile(), settings()).await.err().unwrap();
        assert_eq!(err.kind(), "permission_error");
        assert!(manager.list().is_empty());
        assert_eq!(denied.connector.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_hangup_ends_call() {
        let fx = fixture(MicrophoneSource::Silence, MockConnector::default());
        let manager = SessionManager::new(fx.deps.clone(), 1, 64);
        let handle = manager.start(profile(), settings()).await.unwrap();

        let remote = fx.connector.take_remote().unwrap();
        remote
            .inbound
            .send(TransportEvent::Closed {
                reason: "done".to_string(),
            })
            .unwrap();

        let mut state = handle.state.clone();
        tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == SessionState::Closed))
            .await
            .unwrap()
            .unwrap();
        assert!(handle.report().unwrap().reason.contains("done"));
        // hanging up after the remote already did returns the same report
        assert!(handle.close().await.reason.contains("done"));

        assert_eq!(manager.close_all().await, 1);
        assert!(manager.list().is_empty());
    }
}
