use super::{InterceptError, TunnelTarget};
use std::fmt;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Listening,
    TunnelRequested,
    HandshakeInProgress,
    Established,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A CONNECT request was decoded
    ConnectReceived,
    /// The CONNECT authority parsed and the client was told to proceed
    TargetAccepted,
    /// TLS is terminated toward both the client and the upstream host
    HandshakesCompleted,
    /// Either side closed the stream cleanly
    StreamEnded,
    /// I/O error, handshake failure or malformed tunnel request
    Failed,
}

impl SessionPhase {
    pub fn next(self, event: SessionEvent) -> Result<SessionPhase, InterceptError> {
        use SessionEvent::*;
        use SessionPhase::*;

        match (self, event) {
            (Listening, ConnectReceived) => Ok(TunnelRequested),
            (TunnelRequested, TargetAccepted) => Ok(HandshakeInProgress),
            (HandshakeInProgress, HandshakesCompleted) => Ok(Established),
            (Listening | Established, StreamEnded) => Ok(Closed),
            (Closed, _) => Err(InterceptError::InvalidTransition { from: self, event }),
            (_, Failed) => Ok(Closed),
            _ => Err(InterceptError::InvalidTransition { from: self, event }),
        }
    }

    pub fn is_closed(self) -> bool {
        self == SessionPhase::Closed
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Listening => "listening",
            SessionPhase::TunnelRequested => "tunnel_requested",
            SessionPhase::HandshakeInProgress => "handshake_in_progress",
            SessionPhase::Established => "established",
            SessionPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One client connection undergoing interception.
#[derive(Debug)]
pub struct InterceptionSession {
    peer: SocketAddr,
    target: Option<TunnelTarget>,
    phase: SessionPhase,
}

impl InterceptionSession {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            target: None,
            phase: SessionPhase::Listening,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn target(&self) -> Option<&TunnelTarget> {
        self.target.as_ref()
    }

    pub fn advance(&mut self, event: SessionEvent) -> Result<SessionPhase, InterceptError> {
        let next = self.phase.next(event)?;
        tracing::trace!(
            peer = %self.peer,
            from = %self.phase,
            to = %next,
            ?event,
            "Session transition"
        );
        self.phase = next;
        Ok(next)
    }

    pub fn accept_target(&mut self, target: TunnelTarget) -> Result<SessionPhase, InterceptError> {
        let next = self.advance(SessionEvent::TargetAccepted)?;
        self.target = Some(target);
        Ok(next)
    }
}
