//! Call manager
//!
//! A single task owns the call session. User commands, inbound signaling and
//! transport events are all funnelled into it, so every transition happens in
//! one place and in order. Anything that suspends (device acquisition, offer
//! and answer generation, applying the answer) runs in a spawned task that
//! posts its result back tagged with the call id it was started for.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use uuid::Uuid;

use super::candidates::CandidatePump;
use super::config::CallConfig;
use super::session::{CallSession, PendingOp};
use super::timers::{self, TimerKind};
use super::{CallError, CallErrorKind};
use crate::media::{LocalStream, MediaDeviceSource, RemoteStream, TrackKind};
use crate::models::{CallKind, CallRole, CallState, PeerInfo};
use crate::signaling::{
    Dispatcher, Envelope, IceCandidate, InboundSignal, OutboundSignal, SessionDescription,
    SignalingChannel, SignalingError,
};
use crate::state::{CallEvent, CallSnapshot};
use crate::transport::{
    IceServer, PeerTransport, PeerTransportFactory, TransportError, TransportEvent, TransportEvents,
    TransportState,
};

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

/// Messages processed by the manager task
pub(crate) enum Command {
    Initiate {
        peer: PeerInfo,
        kind: CallKind,
        reply: Reply<()>,
    },
    Accept {
        reply: Reply<()>,
    },
    Decline {
        reply: Reply<()>,
    },
    End {
        reply: Reply<()>,
    },
    ToggleMute {
        reply: Reply<bool>,
    },
    ToggleVideo {
        reply: Reply<bool>,
    },
    Dismiss {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    /// Media and local description are ready (or failed)
    Prepared {
        call_id: Uuid,
        outcome: Result<Prepared, CallErrorKind>,
    },
    /// The callee's answer was applied (or rejected)
    AnswerApplied {
        call_id: Uuid,
        result: Result<(), CallErrorKind>,
    },
    Timer {
        call_id: Uuid,
        timer: TimerKind,
    },
}

/// Output of the preparation task
pub(crate) struct Prepared {
    stream: LocalStream,
    transport: Arc<dyn PeerTransport>,
    description: SessionDescription,
}

/// Acquire media, build the transport and produce our half of the negotiation.
///
/// With `remote_offer` this is the callee flow (apply offer, then answer);
/// without it the caller flow (offer). Anything acquired is released again on
/// failure.
async fn prepare(
    devices: Arc<dyn MediaDeviceSource>,
    transports: Arc<dyn PeerTransportFactory>,
    ice_servers: Vec<IceServer>,
    events: TransportEvents,
    kind: CallKind,
    remote_offer: Option<SessionDescription>,
) -> Result<Prepared, CallErrorKind> {
    let call_id = events.call_id();

    let stream = devices.acquire(kind).await.map_err(|e| {
        tracing::warn!("Call {} - media acquisition failed: {}", call_id, e);
        e.kind()
    })?;
    tracing::debug!("Call {} - acquired {} local stream {}", call_id, kind, stream.id());

    let transport = match transports.create(&ice_servers, events).await {
        Ok(transport) => transport,
        Err(e) => {
            tracing::error!("Call {} - failed to create peer transport: {}", call_id, e);
            devices.release(&stream);
            return Err(e.kind());
        }
    };

    match negotiate(transport.as_ref(), &stream, remote_offer).await {
        Ok(description) => Ok(Prepared {
            stream,
            transport,
            description,
        }),
        Err(e) => {
            tracing::error!("Call {} - negotiation setup failed: {}", call_id, e);
            transport.close().await;
            devices.release(&stream);
            Err(e.kind())
        }
    }
}

async fn negotiate(
    transport: &dyn PeerTransport,
    stream: &LocalStream,
    remote_offer: Option<SessionDescription>,
) -> Result<SessionDescription, TransportError> {
    for track in stream.tracks() {
        transport.attach_local_track(track).await?;
    }
    match remote_offer {
        Some(offer) => {
            transport.set_remote_description(offer).await?;
            transport.create_answer().await
        }
        None => transport.create_offer().await,
    }
}

fn active_session(session: &mut Option<CallSession>) -> Result<&mut CallSession, CallError> {
    match session.as_mut() {
        Some(session) if session.state == CallState::Active => Ok(session),
        Some(session) => Err(CallError::InvalidState(format!("call is {}", session.state))),
        None => Err(CallError::InvalidState("no active call".to_string())),
    }
}

/// Owns the call session and reacts to everything that can change it
pub struct CallManager {
    /// Local identity and timeouts
    config: CallConfig,
    /// Microphone and camera access
    devices: Arc<dyn MediaDeviceSource>,
    /// Builds one peer transport per attempt
    transports: Arc<dyn PeerTransportFactory>,
    /// Outbound side of the signaling channel
    signaling: Arc<dyn SignalingChannel>,
    /// Decodes inbound envelopes
    dispatcher: Dispatcher,
    /// The call in flight
    session: Option<CallSession>,
    /// Last failed attempt, shown until the next attempt or a dismiss
    ended: Option<CallSnapshot>,
    /// Loops completions and timer firings back into the task
    commands_tx: mpsc::UnboundedSender<Command>,
    /// Handed to each transport for its events
    transport_tx: mpsc::UnboundedSender<(Uuid, TransportEvent)>,
    /// Published read model
    snapshot_tx: watch::Sender<CallSnapshot>,
    /// Push notifications
    events_tx: broadcast::Sender<CallEvent>,
}

impl CallManager {
    /// Start a manager task and return the handle used to drive it.
    ///
    /// `inbound` carries envelopes the signaling channel received for this user.
    pub fn spawn(
        config: CallConfig,
        devices: Arc<dyn MediaDeviceSource>,
        transports: Arc<dyn PeerTransportFactory>,
        signaling: Arc<dyn SignalingChannel>,
        inbound: mpsc::Receiver<Envelope>,
    ) -> Result<CallHandle, CallError> {
        config.validate().map_err(CallError::Config)?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::idle());
        let (events_tx, _) = broadcast::channel(config.event_capacity);

        let handle = CallHandle {
            user_id: config.user_id.clone(),
            commands: commands_tx.clone(),
            snapshot: snapshot_rx,
            events: events_tx.clone(),
        };

        let manager = Self {
            config,
            devices,
            transports,
            signaling,
            dispatcher: Dispatcher::new(),
            session: None,
            ended: None,
            commands_tx,
            transport_tx,
            snapshot_tx,
            events_tx,
        };
        tokio::spawn(manager.run(commands_rx, inbound, transport_rx));

        Ok(handle)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbound: mpsc::Receiver<Envelope>,
        mut transport_events: mpsc::UnboundedReceiver<(Uuid, TransportEvent)>,
    ) {
        tracing::info!("Call manager for {} started", self.config.user_id);
        let mut inbound_open = true;

        loop {
            tokio::select! {
                Some(command) = commands.recv() => {
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                envelope = inbound.recv(), if inbound_open => match envelope {
                    Some(envelope) => self.handle_envelope(envelope).await,
                    None => {
                        tracing::warn!("Signaling inbox for {} closed", self.config.user_id);
                        inbound_open = false;
                    }
                },
                Some((call_id, event)) = transport_events.recv() => {
                    self.handle_transport_event(call_id, event).await;
                }
                _ = self.snapshot_tx.closed() => {
                    tracing::debug!("All handles for {} dropped", self.config.user_id);
                    self.hang_up().await;
                    break;
                }
            }
        }

        tracing::info!("Call manager for {} stopped", self.config.user_id);
    }

    // ==================== Publishing ====================

    fn publish(&self) {
        let snapshot = match (&self.session, &self.ended) {
            (Some(session), _) => session.snapshot(),
            (None, Some(ended)) => ended.clone(),
            (None, None) => CallSnapshot::idle(),
        };
        self.snapshot_tx.send_replace(snapshot);
    }

    fn emit(&self, event: CallEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }

    /// Move the live session to `to` if the state graph allows it
    fn transition(&mut self, to: CallState) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        let from = session.state;
        if !from.can_transition_to(to) {
            tracing::warn!("Call {} - ignoring transition {} -> {}", session.call_id, from, to);
            return false;
        }
        session.state = to;
        tracing::info!("Call {} - {} -> {}", session.call_id, from, to);
        self.emit(CallEvent::StateChanged { from, to });
        self.publish();
        true
    }

    /// Leave a lingering Ended view before a new attempt starts
    fn clear_ended(&mut self) {
        if self.ended.take().is_some() {
            self.emit(CallEvent::StateChanged {
                from: CallState::Ended,
                to: CallState::Idle,
            });
            self.publish();
        }
    }

    async fn send_signal(&self, signal: &OutboundSignal) -> Result<(), SignalingError> {
        let envelope = signal.to_envelope()?;
        tracing::debug!("Sending {} to {}", signal.event(), signal.to());
        self.signaling.send(envelope).await
    }

    async fn send_candidate(&self, to: &str, candidate: IceCandidate) {
        let signal = OutboundSignal::IceCandidate {
            to: to.to_string(),
            candidate,
        };
        if let Err(e) = self.send_signal(&signal).await {
            tracing::debug!("Dropping local candidate for {}: {}", to, e);
        }
    }

    /// Tell the peer of the current session we won't take its call
    async fn send_decline(&self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let signal = OutboundSignal::CallDeclined {
            to: session.peer.peer_id.clone(),
        };
        if let Err(e) = self.send_signal(&signal).await {
            tracing::warn!("Call {} - could not send decline: {}", session.call_id, e);
        }
    }

    // ==================== Commands ====================

    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Initiate { peer, kind, reply } => {
                let result = self.initiate(peer, kind);
                let _ = reply.send(result);
            }
            Command::Accept { reply } => {
                let _ = reply.send(self.accept());
            }
            Command::Decline { reply } | Command::End { reply } => {
                self.hang_up().await;
                let _ = reply.send(Ok(()));
            }
            Command::ToggleMute { reply } => {
                let _ = reply.send(self.toggle_mute());
            }
            Command::ToggleVideo { reply } => {
                let _ = reply.send(self.toggle_video());
            }
            Command::Dismiss { reply } => {
                self.clear_ended();
                let _ = reply.send(());
            }
            Command::Shutdown { reply } => {
                self.hang_up().await;
                let _ = reply.send(());
                return false;
            }
            Command::Prepared { call_id, outcome } => self.on_prepared(call_id, outcome).await,
            Command::AnswerApplied { call_id, result } => self.on_answer_applied(call_id, result).await,
            Command::Timer { call_id, timer } => self.on_timer(call_id, timer).await,
        }
        true
    }

    fn initiate(&mut self, peer: PeerInfo, kind: CallKind) -> Result<(), CallError> {
        if let Some(session) = &self.session {
            return Err(CallError::InvalidState(format!(
                "already {} with {}",
                session.state, session.peer.peer_id
            )));
        }
        if peer.peer_id.is_empty() {
            return Err(CallError::InvalidState("peer id is required".to_string()));
        }
        if peer.peer_id == self.config.user_id {
            return Err(CallError::InvalidState("cannot call yourself".to_string()));
        }

        self.clear_ended();

        let mut session = CallSession::outgoing(peer, kind);
        session.attempt_count = 1;
        session.pending = Some(PendingOp::Prepare);
        let call_id = session.call_id;
        tracing::info!(
            "Call {} - placing {} call to {} ({})",
            call_id,
            kind,
            session.peer.peer_name,
            session.peer.peer_id
        );
        self.session = Some(session);
        self.transition(CallState::OutgoingRinging);
        self.arm_ringing_timer();

        self.spawn_prepare(call_id, kind, None);
        Ok(())
    }

    fn accept(&mut self) -> Result<(), CallError> {
        let Some(session) = self.session.as_mut() else {
            return Err(CallError::InvalidState("no incoming call".to_string()));
        };
        if session.state != CallState::IncomingRinging {
            return Err(CallError::InvalidState(format!("cannot accept while {}", session.state)));
        }
        if session.pending.is_some() {
            return Err(CallError::InvalidState("already accepting".to_string()));
        }
        let Some(offer) = session.remote_offer.take() else {
            return Err(CallError::InvalidState("incoming call has no offer".to_string()));
        };

        session.attempt_count += 1;
        session.last_error = None;
        session.pending = Some(PendingOp::Prepare);
        let (call_id, kind) = (session.call_id, session.kind);
        tracing::info!("Call {} - accepting {} call from {}", call_id, kind, session.peer.peer_id);

        self.publish();
        self.arm_ringing_timer();
        self.spawn_prepare(call_id, kind, Some(offer));
        Ok(())
    }

    /// `decline` while ringing in, `end` everywhere else. No-op without a call.
    async fn hang_up(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };

        if session.state == CallState::IncomingRinging {
            tracing::info!("Call {} - declining", session.call_id);
            self.send_decline().await;
            self.teardown(None, false).await;
        } else {
            tracing::info!("Call {} - hanging up", session.call_id);
            self.teardown(None, true).await;
        }
    }

    fn toggle_mute(&mut self) -> Result<bool, CallError> {
        let session = active_session(&mut self.session)?;
        let Some(stream) = session.local_stream.as_ref() else {
            return Err(CallError::InvalidState("no local media".to_string()));
        };
        let muted = !session.muted;
        if !self.devices.set_track_enabled(stream, TrackKind::Audio, !muted) {
            return Err(CallError::InvalidState("no audio track".to_string()));
        }
        session.muted = muted;
        tracing::debug!("Call {} - muted: {}", session.call_id, muted);
        self.publish();
        Ok(muted)
    }

    fn toggle_video(&mut self) -> Result<bool, CallError> {
        let session = active_session(&mut self.session)?;
        if !session.kind.has_video() {
            return Err(CallError::InvalidState("voice call has no video".to_string()));
        }
        let Some(stream) = session.local_stream.as_ref() else {
            return Err(CallError::InvalidState("no local media".to_string()));
        };
        let video_off = !session.video_off;
        if !self.devices.set_track_enabled(stream, TrackKind::Video, !video_off) {
            return Err(CallError::InvalidState("no video track".to_string()));
        }
        session.video_off = video_off;
        tracing::debug!("Call {} - video off: {}", session.call_id, video_off);
        self.publish();
        Ok(video_off)
    }

    // ==================== Negotiation ====================

    fn spawn_prepare(&self, call_id: Uuid, kind: CallKind, remote_offer: Option<SessionDescription>) {
        let devices = self.devices.clone();
        let transports = self.transports.clone();
        let ice_servers = self.config.ice_servers.clone();
        let events = TransportEvents::new(call_id, self.transport_tx.clone());
        let commands = self.commands_tx.clone();

        tokio::spawn(async move {
            let outcome = prepare(devices, transports, ice_servers, events, kind, remote_offer).await;
            let _ = commands.send(Command::Prepared { call_id, outcome });
        });
    }

    async fn on_prepared(&mut self, call_id: Uuid, outcome: Result<Prepared, CallErrorKind>) {
        let current = self
            .session
            .as_ref()
            .is_some_and(|s| s.is_current(call_id) && s.pending == Some(PendingOp::Prepare));
        if !current {
            tracing::debug!("Call {} - discarding late preparation result", call_id);
            if let Ok(prepared) = outcome {
                self.devices.release(&prepared.stream);
                prepared.transport.close().await;
            }
            return;
        }

        let prepared = match outcome {
            Ok(prepared) => prepared,
            Err(kind) => {
                // The caller is still waiting on us; tell it we won't answer
                if self.session.as_ref().is_some_and(|s| s.role == CallRole::Callee) {
                    self.send_decline().await;
                }
                self.teardown(Some(kind), false).await;
                return;
            }
        };

        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.pending = None;
        session.local_stream = Some(prepared.stream);
        session.transport = Some(prepared.transport);

        let to = session.peer.peer_id.clone();
        let role = session.role;
        let signal = match role {
            CallRole::Caller => OutboundSignal::CallRequest {
                to: to.clone(),
                offer: prepared.description,
                from: self.config.user_id.clone(),
                from_name: self.config.display_name.clone(),
                kind: session.kind,
            },
            CallRole::Callee => OutboundSignal::CallAnswered {
                to: to.clone(),
                answer: prepared.description,
            },
        };
        self.publish();

        if let Err(e) = self.send_signal(&signal).await {
            tracing::error!("Call {} - failed to send {}: {}", call_id, signal.event(), e);
            self.teardown(Some(e.kind()), false).await;
            return;
        }

        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.signaled = true;
        let held = session.local_candidates.open();
        if !held.is_empty() {
            tracing::debug!("Call {} - sending {} held local candidates", call_id, held.len());
        }
        for candidate in held {
            self.send_candidate(&to, candidate).await;
        }

        if role == CallRole::Callee {
            // The offer was applied during preparation
            self.open_remote_candidates();
            self.enter_negotiating();
        }
    }

    fn on_call_answered(&mut self, answer: SessionDescription) {
        let Some(session) = self.session.as_mut() else {
            tracing::debug!("Ignoring call-answered with no call in progress");
            return;
        };
        let expected = session.role == CallRole::Caller
            && session.state == CallState::OutgoingRinging
            && session.signaled
            && session.pending.is_none();
        let transport = match (&session.transport, expected) {
            (Some(transport), true) => transport.clone(),
            _ => {
                tracing::warn!("Call {} - unexpected call-answered while {}", session.call_id, session.state);
                return;
            }
        };

        tracing::info!("Call {} - answered by {}", session.call_id, session.peer.peer_id);
        session.pending = Some(PendingOp::ApplyAnswer);
        let call_id = session.call_id;
        let commands = self.commands_tx.clone();

        tokio::spawn(async move {
            let result = transport.set_remote_description(answer).await.map_err(|e| {
                tracing::warn!("Call {} - remote answer rejected: {}", call_id, e);
                e.kind()
            });
            let _ = commands.send(Command::AnswerApplied { call_id, result });
        });
    }

    async fn on_answer_applied(&mut self, call_id: Uuid, result: Result<(), CallErrorKind>) {
        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.is_current(call_id) && s.pending == Some(PendingOp::ApplyAnswer))
        else {
            tracing::debug!("Call {} - discarding late answer result", call_id);
            return;
        };
        session.pending = None;

        match result {
            Ok(()) => {
                self.open_remote_candidates();
                self.enter_negotiating();
            }
            Err(kind) => self.teardown(Some(kind), true).await,
        }
    }

    /// Remote description is in place: start applying remote candidates
    fn open_remote_candidates(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(transport) = session.transport.clone() else {
            return;
        };

        let pump = CandidatePump::start(session.call_id, transport, session.cancel.child_token());
        let queued = session.remote_candidates.open();
        if !queued.is_empty() {
            tracing::debug!("Call {} - applying {} queued remote candidates", session.call_id, queued.len());
        }
        for candidate in queued {
            pump.push(candidate);
        }
        session.pump = Some(pump);
    }

    /// (Re)start the clock on ringing out, ringing in, or accepting
    fn arm_ringing_timer(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let call_id = session.call_id;
        let commands = self.commands_tx.clone();
        session.ringing_timer = Some(timers::once(
            &session.cancel,
            self.config.ringing_timeout,
            move || {
                let _ = commands.send(Command::Timer {
                    call_id,
                    timer: TimerKind::Ringing,
                });
            },
        ));
    }

    fn enter_negotiating(&mut self) {
        if !self.transition(CallState::Negotiating) {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Some(timer) = session.ringing_timer.take() {
            timer.cancel();
        }

        let call_id = session.call_id;
        let commands = self.commands_tx.clone();
        session.negotiation_timer = Some(timers::once(
            &session.cancel,
            self.config.negotiation_timeout,
            move || {
                let _ = commands.send(Command::Timer {
                    call_id,
                    timer: TimerKind::Negotiation,
                });
            },
        ));

        if session.media_ready {
            self.go_active();
        }
    }

    fn go_active(&mut self) {
        if !self.transition(CallState::Active) {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };

        if let Some(timer) = session.negotiation_timer.take() {
            timer.cancel();
        }
        session.duration_seconds = 0;
        session.connected_at = Some(Utc::now());

        let call_id = session.call_id;
        let commands = self.commands_tx.clone();
        session.duration_timer = Some(timers::repeating(
            &session.cancel,
            self.config.duration_tick,
            move || {
                commands
                    .send(Command::Timer {
                        call_id,
                        timer: TimerKind::DurationTick,
                    })
                    .is_ok()
            },
        ));
        self.publish();
    }

    /// Connectivity or remote media showed up
    fn media_arrived(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.state {
            CallState::Negotiating => self.go_active(),
            CallState::Active => self.publish(),
            _ => {
                session.media_ready = true;
                self.publish();
            }
        }
    }

    // ==================== Inbound signaling ====================

    async fn handle_envelope(&mut self, envelope: Envelope) {
        match self.dispatcher.decode(envelope) {
            Ok(signal) => {
                tracing::debug!("Received {} from {}", signal.event(), signal.from().unwrap_or("peer"));
                self.handle_signal(signal).await
            }
            Err(e) => tracing::warn!("Dropping inbound message: {}", e),
        }
    }

    async fn handle_signal(&mut self, signal: InboundSignal) {
        match signal {
            InboundSignal::CallRequest {
                from,
                name,
                offer,
                kind,
            } => self.on_call_request(PeerInfo::new(from, name), offer, kind).await,
            InboundSignal::CallAnswered { answer } => self.on_call_answered(answer),
            InboundSignal::CallDeclined { from } => {
                let declined = self
                    .session
                    .as_ref()
                    .is_some_and(|s| s.role == CallRole::Caller && s.is_from_peer(from.as_deref()));
                if declined {
                    tracing::info!("Call declined by {}", from.as_deref().unwrap_or("peer"));
                    self.teardown(None, false).await;
                }
            }
            InboundSignal::CallEnded { from } => {
                if self.session.as_ref().is_some_and(|s| s.is_from_peer(from.as_deref())) {
                    tracing::info!("Call ended by {}", from.as_deref().unwrap_or("peer"));
                    self.teardown(None, false).await;
                }
            }
            InboundSignal::IceCandidate { from, candidate } => {
                let Some(session) = self.session.as_mut() else {
                    tracing::debug!("Dropping remote candidate with no call in progress");
                    return;
                };
                if !session.is_from_peer(from.as_deref()) {
                    return;
                }
                if let Some(candidate) = session.remote_candidates.push(candidate) {
                    if let Some(pump) = &session.pump {
                        pump.push(candidate);
                    }
                }
            }
        }
    }

    async fn on_call_request(&mut self, peer: PeerInfo, offer: SessionDescription, kind: CallKind) {
        if peer.peer_id == self.config.user_id {
            tracing::warn!("Ignoring call-request from ourselves");
            return;
        }

        if let Some(session) = &self.session {
            if session.peer.peer_id != peer.peer_id {
                tracing::info!(
                    "Busy with {}, declining call from {}",
                    session.peer.peer_id,
                    peer.peer_id
                );
                let signal = OutboundSignal::CallDeclined { to: peer.peer_id };
                if let Err(e) = self.send_signal(&signal).await {
                    tracing::warn!("Could not send busy decline: {}", e);
                }
                return;
            }

            // Both sides called each other: the lower user id keeps its call,
            // the other drops its own attempt and rings in instead
            let crossed = session.role == CallRole::Caller && session.state == CallState::OutgoingRinging;
            if !crossed || self.config.user_id < peer.peer_id {
                tracing::debug!(
                    "Call {} - call-request from {} ignored while {}",
                    session.call_id,
                    peer.peer_id,
                    session.state
                );
                return;
            }
            tracing::info!("Call {} - crossed call with {}, answering theirs", session.call_id, peer.peer_id);
            self.teardown(None, false).await;
        }

        self.clear_ended();

        let session = CallSession::incoming(peer.clone(), kind, offer);
        tracing::info!(
            "Call {} - incoming {} call from {} ({})",
            session.call_id,
            kind,
            peer.peer_name,
            peer.peer_id
        );
        self.session = Some(session);
        self.transition(CallState::IncomingRinging);
        self.arm_ringing_timer();
        self.emit(CallEvent::IncomingCall {
            peer_id: peer.peer_id,
            peer_name: peer.peer_name,
            kind,
        });
    }

    // ==================== Transport events ====================

    async fn handle_transport_event(&mut self, call_id: Uuid, event: TransportEvent) {
        let Some(session) = self.session.as_mut().filter(|s| s.is_current(call_id)) else {
            tracing::debug!("Call {} - dropping stale transport event", call_id);
            return;
        };

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if let Some(candidate) = session.local_candidates.push(candidate) {
                    let to = session.peer.peer_id.clone();
                    self.send_candidate(&to, candidate).await;
                }
            }
            TransportEvent::RemoteTrack(track) => {
                let stream_id = match session.remote_stream.as_mut() {
                    Some(stream) => {
                        stream.add_track(track);
                        stream.id().to_string()
                    }
                    None => {
                        tracing::info!("Call {} - remote media arrived", call_id);
                        let stream = RemoteStream::from_track(track);
                        let id = stream.id().to_string();
                        session.remote_stream = Some(stream);
                        id
                    }
                };
                self.emit(CallEvent::RemoteMedia { stream_id });
                self.media_arrived();
            }
            TransportEvent::ConnectionState(state) => {
                session.transport_state = Some(state);
                match state {
                    TransportState::Connected => {
                        if session.grace_timer.take().is_some() {
                            tracing::info!("Call {} - connection recovered", call_id);
                        }
                        self.media_arrived();
                    }
                    TransportState::Disconnected if session.is_connecting_or_active() => {
                        if self.config.disconnect_grace.is_zero() {
                            self.teardown(Some(CallErrorKind::ConnectionLost), true).await;
                        } else if session.grace_timer.is_none() {
                            tracing::warn!("Call {} - connection interrupted, waiting for recovery", call_id);
                            let commands = self.commands_tx.clone();
                            session.grace_timer = Some(timers::once(
                                &session.cancel,
                                self.config.disconnect_grace,
                                move || {
                                    let _ = commands.send(Command::Timer {
                                        call_id,
                                        timer: TimerKind::DisconnectGrace,
                                    });
                                },
                            ));
                        }
                    }
                    TransportState::Failed if session.is_connecting_or_active() => {
                        self.teardown(Some(CallErrorKind::ConnectionLost), true).await;
                    }
                    _ => {}
                }
            }
            TransportEvent::IceFailed => {
                if session.is_connecting_or_active() {
                    self.teardown(Some(CallErrorKind::IceFailure), true).await;
                }
            }
        }
    }

    async fn on_timer(&mut self, call_id: Uuid, timer: TimerKind) {
        let Some(session) = self.session.as_mut().filter(|s| s.is_current(call_id)) else {
            return;
        };

        match timer {
            TimerKind::Ringing => {
                session.ringing_timer = None;
                if !session.state.is_ringing() {
                    return;
                }
                match (session.role, session.pending) {
                    (CallRole::Caller, _) => {
                        tracing::warn!("Call {} - no answer from {}", call_id, session.peer.peer_id);
                        self.teardown(Some(CallErrorKind::NegotiationTimeout), true).await;
                    }
                    (CallRole::Callee, Some(PendingOp::Prepare)) => {
                        tracing::warn!("Call {} - accepting timed out", call_id);
                        self.send_decline().await;
                        self.teardown(Some(CallErrorKind::NegotiationTimeout), false).await;
                    }
                    (CallRole::Callee, _) => {
                        tracing::info!("Call {} - missed call from {}", call_id, session.peer.peer_id);
                        self.hang_up().await;
                    }
                }
            }
            TimerKind::Negotiation => {
                if session.state == CallState::Negotiating {
                    tracing::warn!("Call {} - negotiation timed out", call_id);
                    self.teardown(Some(CallErrorKind::NegotiationTimeout), true).await;
                }
            }
            TimerKind::DurationTick => {
                if session.state == CallState::Active {
                    session.duration_seconds += 1;
                    let seconds = session.duration_seconds;
                    self.emit(CallEvent::DurationTick(seconds));
                    self.publish();
                }
            }
            TimerKind::DisconnectGrace => {
                session.grace_timer = None;
                let recovered = session.transport_state == Some(TransportState::Connected);
                if session.is_connecting_or_active() && !recovered {
                    self.teardown(Some(CallErrorKind::ConnectionLost), true).await;
                }
            }
        }
    }

    // ==================== Teardown ====================

    /// End the live session. Safe to call with no session.
    ///
    /// `notify_peer` sends a best-effort call-ended when the peer has heard
    /// from us. An error is published before any resource is released and the
    /// Ended view then stays until the next attempt or a dismiss.
    async fn teardown(&mut self, error: Option<CallErrorKind>, notify_peer: bool) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let from = session.state;
        let call_id = session.call_id;

        if let Some(kind) = error {
            tracing::warn!("Call {} - failed: {} ({})", call_id, kind.code(), kind);
            session.last_error = Some(kind);
            self.snapshot_tx.send_replace(session.snapshot());
            self.emit(CallEvent::Error(kind));
        }

        if notify_peer && session.signaled {
            let signal = OutboundSignal::CallEnded {
                to: session.peer.peer_id.clone(),
            };
            if let Err(e) = self.send_signal(&signal).await {
                tracing::warn!("Call {} - could not notify peer of hangup: {}", call_id, e);
            }
        }

        session.cancel.cancel();
        session.cancel_timers();
        session.pump = None;
        if let Some(stream) = session.local_stream.take() {
            self.devices.release(&stream);
        }
        if let Some(transport) = session.transport.take() {
            transport.close().await;
        }
        session.remote_stream = None;

        let elapsed = session.elapsed();
        session.state = CallState::Ended;
        tracing::info!("Call {} - ended after {}s", call_id, elapsed);
        self.emit(CallEvent::StateChanged {
            from,
            to: CallState::Ended,
        });

        let ended = session.snapshot();
        if error.is_some() {
            self.ended = Some(ended);
            self.publish();
        } else {
            self.snapshot_tx.send_replace(ended);
            self.emit(CallEvent::StateChanged {
                from: CallState::Ended,
                to: CallState::Idle,
            });
            self.publish();
        }
    }
}

/// Cloneable front end to a running [`CallManager`]
#[derive(Clone)]
pub struct CallHandle {
    user_id: String,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<CallSnapshot>,
    events: broadcast::Sender<CallEvent>,
}

impl CallHandle {
    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| CallError::ManagerClosed)?;
        rx.await.map_err(|_| CallError::ManagerClosed)?
    }

    async fn notify(&self, command: impl FnOnce(oneshot::Sender<()>) -> Command) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| CallError::ManagerClosed)?;
        rx.await.map_err(|_| CallError::ManagerClosed)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Place a call. Returns once the attempt has started; progress shows in the snapshot.
    pub async fn initiate_call(&self, peer_id: &str, peer_name: &str, kind: CallKind) -> Result<(), CallError> {
        let peer = PeerInfo::new(peer_id, peer_name);
        self.request(|reply| Command::Initiate { peer, kind, reply }).await
    }

    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Accept { reply }).await
    }

    pub async fn decline_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Decline { reply }).await
    }

    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::End { reply }).await
    }

    /// Returns the new muted flag
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleMute { reply }).await
    }

    /// Returns the new video-off flag
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleVideo { reply }).await
    }

    /// Clear a failed call's Ended view back to Idle
    pub async fn dismiss(&self) -> Result<(), CallError> {
        self.notify(|reply| Command::Dismiss { reply }).await
    }

    /// Hang up any call and stop the manager
    pub async fn shutdown(&self) -> Result<(), CallError> {
        self.notify(|reply| Command::Shutdown { reply }).await
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Wait until the published snapshot satisfies `predicate`
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&CallSnapshot) -> bool,
    ) -> Result<CallSnapshot, CallError> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(predicate)
            .await
            .map_err(|_| CallError::ManagerClosed)?;
        Ok(snapshot.clone())
    }

    pub fn state(&self) -> CallState {
        self.snapshot.borrow().state
    }

    pub fn duration_seconds(&self) -> u64 {
        self.snapshot.borrow().duration_seconds
    }

    pub fn is_muted(&self) -> bool {
        self.snapshot.borrow().muted
    }

    pub fn is_video_off(&self) -> bool {
        self.snapshot.borrow().video_off
    }

    pub fn last_error(&self) -> Option<CallErrorKind> {
        self.snapshot.borrow().last_error
    }

    pub fn local_stream(&self) -> Option<LocalStream> {
        self.snapshot.borrow().local_stream.clone()
    }

    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.snapshot.borrow().remote_stream.clone()
    }
}
