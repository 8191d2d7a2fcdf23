//! In-process signaling relay
//!
//! [`MemoryRelay`] stands in for the chat server: it pairs participants and
//! forwards call signals between partners with the same routing the server
//! applies. Every delivered signal is encoded to its wire event and decoded
//! again, so anything that crosses the relay also passes the JSON contract.

use crate::identity::PeerId;
use crate::signaling::{InboundSignal, OutboundSignal, SignalingChannel, SignalingError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

struct Participant {
    tx: mpsc::UnboundedSender<InboundSignal>,
    partner: Option<PeerId>,
    connected: bool,
}

#[derive(Default)]
struct RelayState {
    participants: HashMap<PeerId, Participant>,
    next_id: u64,
}

/// In-process relay with the chat server's routing rules
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl std::fmt::Debug for MemoryRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRelay")
            .field("participants", &self.state.lock().participants.len())
            .finish()
    }
}

impl MemoryRelay {
    /// Create an empty relay
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Join with a generated identifier
    #[must_use]
    pub fn join(&self) -> Arc<RelayChannel> {
        let id = {
            let mut state = self.state.lock();
            state.next_id += 1;
            PeerId::numbered("peer", state.next_id)
        };
        self.join_as(id)
    }

    /// Join as `id`, replacing any earlier participant with the same id
    #[must_use]
    pub fn join_as(&self, id: PeerId) -> Arc<RelayChannel> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().participants.insert(
            id.clone(),
            Participant {
                tx,
                partner: None,
                connected: true,
            },
        );
        tracing::debug!(peer = %id, "Participant joined relay");
        Arc::new(RelayChannel {
            relay: self.clone(),
            id,
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    /// Make `a` and `b` chat partners
    pub fn pair(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.state.lock();
        if let Some(p) = state.participants.get_mut(a) {
            p.partner = Some(b.clone());
        }
        if let Some(p) = state.participants.get_mut(b) {
            p.partner = Some(a.clone());
        }
    }

    /// Drop a participant's connection; their emits fail until reconnected
    pub fn disconnect(&self, id: &PeerId) {
        if let Some(p) = self.state.lock().participants.get_mut(id) {
            p.connected = false;
            tracing::debug!(peer = %id, "Participant disconnected from relay");
        }
    }

    /// Restore a dropped connection
    pub fn reconnect(&self, id: &PeerId) {
        if let Some(p) = self.state.lock().participants.get_mut(id) {
            p.connected = true;
        }
    }

    fn is_connected(&self, id: &PeerId) -> bool {
        self.state
            .lock()
            .participants
            .get(id)
            .is_some_and(|p| p.connected)
    }

    fn route(&self, from: &PeerId, signal: OutboundSignal) -> Result<(), SignalingError> {
        let partner = {
            let state = self.state.lock();
            let sender = state
                .participants
                .get(from)
                .filter(|p| p.connected)
                .ok_or(SignalingError::NotConnected)?;
            sender.partner.clone()
        };

        let (target, inbound) = match signal {
            OutboundSignal::Initiate { call_type } => (
                partner,
                InboundSignal::Incoming {
                    call_type,
                    from: from.clone(),
                },
            ),
            OutboundSignal::Accept { to } => (Some(to), InboundSignal::Accepted { from: from.clone() }),
            OutboundSignal::Reject { to } => (Some(to), InboundSignal::Rejected),
            OutboundSignal::End => (partner, InboundSignal::Ended),
            OutboundSignal::Offer { offer } => (
                partner,
                InboundSignal::Offer {
                    offer,
                    from: from.clone(),
                },
            ),
            OutboundSignal::Answer { answer, to } => (Some(to), InboundSignal::Answer { answer }),
            OutboundSignal::IceCandidate { candidate } => {
                (partner, InboundSignal::IceCandidate { candidate })
            }
        };

        let Some(target) = target else {
            tracing::debug!(peer = %from, event = inbound.event_name(), "No partner, dropping signal");
            return Ok(());
        };
        self.deliver(&target, inbound)
    }

    fn deliver(&self, to: &PeerId, signal: InboundSignal) -> Result<(), SignalingError> {
        let (event, payload) = signal.to_event();
        let Some(signal) = InboundSignal::from_event(event, payload)? else {
            return Ok(());
        };
        let state = self.state.lock();
        match state.participants.get(to) {
            Some(p) if p.connected => {
                if p.tx.send(signal).is_err() {
                    tracing::debug!(peer = %to, "Participant gone, dropping signal");
                }
            }
            _ => tracing::debug!(peer = %to, event, "Target offline, dropping signal"),
        }
        Ok(())
    }
}

/// One participant's connection to a [`MemoryRelay`]
pub struct RelayChannel {
    relay: MemoryRelay,
    id: PeerId,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundSignal>>,
}

impl RelayChannel {
    /// Identifier on the relay
    #[must_use]
    pub fn id(&self) -> &PeerId {
        &self.id
    }
}

impl std::fmt::Debug for RelayChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayChannel").field("id", &self.id).finish()
    }
}

#[async_trait]
impl SignalingChannel for RelayChannel {
    async fn emit(&self, signal: OutboundSignal) -> Result<(), SignalingError> {
        self.relay.route(&self.id, signal)
    }

    async fn next_signal(&self) -> Result<Option<InboundSignal>, SignalingError> {
        Ok(self.rx.lock().await.recv().await)
    }

    fn is_connected(&self) -> bool {
        self.relay.is_connected(&self.id)
    }

    fn local_id(&self) -> Option<PeerId> {
        Some(self.id.clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::signaling::SessionDescription;
    use crate::types::CallType;
    use pretty_assertions::assert_eq;

    fn paired() -> (MemoryRelay, Arc<RelayChannel>, Arc<RelayChannel>) {
        let relay = MemoryRelay::new();
        let a = relay.join();
        let b = relay.join();
        relay.pair(a.id(), b.id());
        (relay, a, b)
    }

    #[tokio::test]
    async fn test_initiate_reaches_partner_as_incoming() {
        let (_relay, a, b) = paired();
        a.emit(OutboundSignal::Initiate {
            call_type: CallType::Video,
        })
        .await
        .unwrap();

        assert_eq!(
            b.next_signal().await.unwrap(),
            Some(InboundSignal::Incoming {
                call_type: CallType::Video,
                from: a.id().clone()
            })
        );
    }

    #[tokio::test]
    async fn test_directed_signals() {
        let (_relay, a, b) = paired();
        b.emit(OutboundSignal::Accept { to: a.id().clone() })
            .await
            .unwrap();
        assert_eq!(
            a.next_signal().await.unwrap(),
            Some(InboundSignal::Accepted { from: b.id().clone() })
        );

        b.emit(OutboundSignal::Answer {
            answer: SessionDescription::answer("v=0"),
            to: a.id().clone(),
        })
        .await
        .unwrap();
        assert_eq!(
            a.next_signal().await.unwrap(),
            Some(InboundSignal::Answer {
                answer: SessionDescription::answer("v=0")
            })
        );

        a.emit(OutboundSignal::End).await.unwrap();
        assert_eq!(b.next_signal().await.unwrap(), Some(InboundSignal::Ended));
    }

    #[tokio::test]
    async fn test_disconnected_participant_cannot_emit() {
        let (relay, a, _b) = paired();
        relay.disconnect(a.id());
        assert!(!a.is_connected());
        assert!(matches!(
            a.emit(OutboundSignal::End).await,
            Err(SignalingError::NotConnected)
        ));

        relay.reconnect(a.id());
        assert!(a.is_connected());
        assert!(a.emit(OutboundSignal::End).await.is_ok());
    }

    #[tokio::test]
    async fn test_unpaired_signal_is_dropped() {
        let relay = MemoryRelay::new();
        let a = relay.join();
        assert!(a.emit(OutboundSignal::End).await.is_ok());
    }
}
