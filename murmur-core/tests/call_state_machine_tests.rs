//! Call state machine tests
//!
//! Drives a single manager with scripted signals and records what it emits.

use murmur_core::call::{CallError, CallSessionManager};
use murmur_core::config::CallConfig;
use murmur_core::identity::PeerId;
use murmur_core::media::{MediaError, MediaErrorCategory, MediaKind, VirtualMediaDevices};
use murmur_core::signaling::{
    IceCandidate, InboundSignal, OutboundSignal, SdpType, SessionDescription, SignalingHandler,
};
use murmur_core::testing::{MockBehavior, MockOp, MockPeerTransport, MockTransportFactory, RecordingChannel};
use murmur_core::transport::{OfferOptions, PeerConnectionState, TransportError, TransportEvent};
use murmur_core::types::{CallEvent, CallSnapshot, CallState, CallType, EndReason};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

struct Harness {
    manager: CallSessionManager,
    channel: Arc<RecordingChannel>,
    transports: Arc<MockTransportFactory>,
    media: Arc<VirtualMediaDevices>,
    events: broadcast::Receiver<CallEvent>,
}

impl Harness {
    fn new() -> Self {
        Self::with(CallConfig::default(), MockBehavior::default())
    }

    fn with(config: CallConfig, behavior: MockBehavior) -> Self {
        let channel = Arc::new(RecordingChannel::new(peer("me")));
        let transports = Arc::new(MockTransportFactory::with_behavior(behavior));
        let media = Arc::new(VirtualMediaDevices::with_default_devices());
        let signaling = Arc::new(SignalingHandler::new(channel.clone()));
        let manager = CallSessionManager::new(config, media.clone(), transports.clone(), signaling);
        let events = manager.subscribe_events();
        Self {
            manager,
            channel,
            transports,
            media,
            events,
        }
    }

    fn transport(&self) -> Arc<MockPeerTransport> {
        self.transports.last().unwrap()
    }

    fn drain_events(&mut self) -> Vec<CallEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    async fn wait_for(&self, check: impl Fn(&CallSnapshot) -> bool) {
        let mut rx = self.manager.subscribe();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if check(&rx.borrow_and_update()) {
                    return;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
    }

    async fn wait_for_emits(&self, event: &str, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.channel.count(event) < count {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    /// Caller side through `connected`
    async fn connected_caller(&self, call_type: CallType) {
        self.manager
            .initiate_call(call_type, peer("partner"))
            .await
            .unwrap();
        self.manager
            .handle_signal(InboundSignal::Accepted {
                from: peer("partner"),
            })
            .await
            .unwrap();
        self.manager
            .handle_signal(InboundSignal::Answer {
                answer: SessionDescription::answer("v=0\r\nm=audio\r\nm=video\r\n"),
            })
            .await
            .unwrap();
        assert_eq!(self.manager.state(), CallState::Connected);
    }

    /// Callee side up to `connecting`, before the offer
    async fn accepted_callee(&self, call_type: CallType) {
        self.manager
            .handle_signal(InboundSignal::Incoming {
                call_type,
                from: peer("caller"),
            })
            .await
            .unwrap();
        self.manager.accept_call().await.unwrap();
    }
}

fn peer(id: &str) -> PeerId {
    PeerId::new(id).unwrap()
}

fn candidate(n: u32) -> IceCandidate {
    IceCandidate::new(format!("candidate:{n}"), Some("0".to_string()), Some(0))
}

fn offer_signal() -> InboundSignal {
    InboundSignal::Offer {
        offer: SessionDescription::offer("v=0\r\nm=audio\r\nm=video\r\n"),
        from: peer("caller"),
    }
}

fn assert_fully_idle(h: &Harness) {
    let snapshot = h.manager.snapshot();
    assert_eq!(snapshot.state, CallState::Idle);
    assert!(snapshot.call_id.is_none());
    assert!(snapshot.remote_peer_id.is_none());
    assert!(snapshot.local_stream.is_none());
    assert!(snapshot.remote_stream.is_none());
    assert_eq!(h.manager.pending_candidates(), 0);
    assert!(h.media.live_tracks().is_empty());
}

// ============================================================================
// Placing calls
// ============================================================================

#[tokio::test]
async fn initiate_video_call_enters_calling_and_announces() {
    let h = Harness::new();
    h.manager
        .initiate_call(CallType::Video, peer("partner"))
        .await
        .unwrap();

    let snapshot = h.manager.snapshot();
    assert_eq!(snapshot.state, CallState::Calling);
    assert_eq!(snapshot.remote_peer_id, Some(peer("partner")));
    assert!(!snapshot.is_incoming);
    assert_eq!(snapshot.local_stream.as_ref().unwrap().tracks().len(), 2);

    assert_eq!(
        h.channel.sent(),
        vec![OutboundSignal::Initiate {
            call_type: CallType::Video
        }]
    );
    let adds = h
        .transport()
        .ops()
        .into_iter()
        .filter(|op| matches!(op, MockOp::AddTrack(_)))
        .count();
    assert_eq!(adds, 2);
    assert_eq!(h.transport().sender_count(), 2);
}

#[tokio::test]
async fn voice_call_acquires_audio_only() {
    let h = Harness::new();
    h.manager
        .initiate_call(CallType::Voice, peer("partner"))
        .await
        .unwrap();

    let issued = h.media.issued_tracks();
    assert_eq!(issued.len(), 1);
    assert_eq!(issued[0].kind(), MediaKind::Audio);
}

#[tokio::test]
async fn initiate_without_signaling_stays_idle() {
    let h = Harness::new();
    h.channel.set_connected(false);

    let result = h.manager.initiate_call(CallType::Video, peer("partner")).await;
    assert!(matches!(result, Err(CallError::SignalingUnavailable)));
    assert!(result.unwrap_err().is_recoverable());
    assert_fully_idle(&h);
    assert!(h.media.issued_tracks().is_empty());
    assert!(h.transports.created().is_empty());
}

#[tokio::test]
async fn initiate_while_busy_leaves_session_unchanged() {
    let h = Harness::new();
    let first = h
        .manager
        .initiate_call(CallType::Video, peer("partner"))
        .await
        .unwrap();
    let before = h.manager.snapshot();

    let result = h.manager.initiate_call(CallType::Voice, peer("other")).await;
    assert!(matches!(
        result,
        Err(CallError::InvalidState(CallState::Calling))
    ));

    let after = h.manager.snapshot();
    assert_eq!(after.call_id, Some(first));
    assert_eq!(after.call_type, before.call_type);
    assert_eq!(after.remote_peer_id, before.remote_peer_id);
    assert_eq!(h.transports.created().len(), 1);
    assert_eq!(h.channel.count("call:initiate"), 1);
}

#[tokio::test]
async fn permission_denied_returns_to_idle_with_category() {
    let mut h = Harness::new();
    h.media.set_permission(false);

    let result = h.manager.initiate_call(CallType::Video, peer("partner")).await;
    assert!(matches!(
        result,
        Err(CallError::Media(MediaError::PermissionDenied(_)))
    ));
    assert_fully_idle(&h);
    assert!(h.channel.sent().is_empty());

    let denied = h.drain_events().into_iter().find_map(|e| match e {
        CallEvent::MediaDenied { category, message } => Some((category, message)),
        _ => None,
    });
    let (category, message) = denied.unwrap();
    assert_eq!(category, MediaErrorCategory::PermissionDenied);
    assert!(message.contains("grant permissions"));
}

#[tokio::test]
async fn busy_camera_is_reported_and_nothing_leaks() {
    let mut h = Harness::new();
    h.media.set_busy("cam-front", true);

    let result = h.manager.initiate_call(CallType::Video, peer("partner")).await;
    assert!(matches!(
        result,
        Err(CallError::Media(MediaError::DeviceBusy(_)))
    ));
    assert_fully_idle(&h);
    assert!(h.drain_events().iter().any(|e| matches!(
        e,
        CallEvent::MediaDenied {
            category: MediaErrorCategory::DeviceBusy,
            ..
        }
    )));
}

#[tokio::test]
async fn transport_setup_failure_tears_down() {
    let h = Harness::with(
        CallConfig::default(),
        MockBehavior {
            fail_create: true,
            ..MockBehavior::default()
        },
    );
    let result = h.manager.initiate_call(CallType::Voice, peer("partner")).await;
    assert!(matches!(
        result,
        Err(CallError::Transport(TransportError::Setup(_)))
    ));
    assert!(!result.unwrap_err().is_recoverable());
    assert_fully_idle(&h);
    // The call was never announced
    assert!(h.channel.sent().is_empty());
}

// ============================================================================
// Offer / answer
// ============================================================================

#[tokio::test]
async fn caller_sends_exactly_one_offer_and_connects_on_answer() {
    let h = Harness::new();
    h.manager
        .initiate_call(CallType::Video, peer("partner"))
        .await
        .unwrap();
    h.manager
        .handle_signal(InboundSignal::Accepted {
            from: peer("partner"),
        })
        .await
        .unwrap();

    assert_eq!(h.manager.state(), CallState::Connecting);
    assert_eq!(h.channel.count("webrtc:offer"), 1);
    let ops = h.transport().ops();
    assert!(ops.contains(&MockOp::CreateOffer(OfferOptions {
        receive_audio: true,
        receive_video: true,
    })));
    assert!(ops.contains(&MockOp::SetLocal(SdpType::Offer)));

    h.manager
        .handle_signal(InboundSignal::Answer {
            answer: SessionDescription::answer("v=0"),
        })
        .await
        .unwrap();
    let snapshot = h.manager.snapshot();
    assert_eq!(snapshot.state, CallState::Connected);
    assert!(snapshot.connected_at.is_some());
    assert!(h.transport().ops().contains(&MockOp::SetRemote(SdpType::Answer)));
    assert_eq!(h.channel.count("webrtc:offer"), 1);
}

#[tokio::test]
async fn voice_offer_does_not_request_video() {
    let h = Harness::new();
    h.manager
        .initiate_call(CallType::Voice, peer("partner"))
        .await
        .unwrap();
    h.manager
        .handle_signal(InboundSignal::Accepted {
            from: peer("partner"),
        })
        .await
        .unwrap();
    assert!(h.transport().ops().contains(&MockOp::CreateOffer(OfferOptions {
        receive_audio: true,
        receive_video: false,
    })));
}

#[tokio::test]
async fn accepted_updates_remote_peer() {
    let h = Harness::new();
    h.manager
        .initiate_call(CallType::Voice, peer("partner"))
        .await
        .unwrap();
    h.manager
        .handle_signal(InboundSignal::Accepted {
            from: peer("partner-socket"),
        })
        .await
        .unwrap();
    assert_eq!(
        h.manager.snapshot().remote_peer_id,
        Some(peer("partner-socket"))
    );
}

#[tokio::test]
async fn callee_answers_exactly_once() {
    let mut h = Harness::new();
    h.manager
        .handle_signal(InboundSignal::Incoming {
            call_type: CallType::Video,
            from: peer("caller"),
        })
        .await
        .unwrap();

    let snapshot = h.manager.snapshot();
    assert_eq!(snapshot.state, CallState::Ringing);
    assert!(snapshot.is_incoming);
    assert_eq!(snapshot.remote_peer_id, Some(peer("caller")));
    assert!(h.media.issued_tracks().is_empty());
    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, CallEvent::IncomingCall { call_type: CallType::Video, .. })));

    h.manager.accept_call().await.unwrap();
    assert_eq!(h.manager.state(), CallState::Connecting);
    assert_eq!(
        h.channel.sent(),
        vec![OutboundSignal::Accept { to: peer("caller") }]
    );

    h.manager.handle_signal(offer_signal()).await.unwrap();
    assert_eq!(h.manager.state(), CallState::Connected);
    assert_eq!(h.channel.count("webrtc:answer"), 1);
    assert!(matches!(
        h.channel.sent().last(),
        Some(OutboundSignal::Answer { to, .. }) if *to == peer("caller")
    ));

    // A duplicate offer is not answered again
    h.manager.handle_signal(offer_signal()).await.unwrap();
    assert_eq!(h.channel.count("webrtc:answer"), 1);
}

#[tokio::test]
async fn offer_before_accept_is_ignored() {
    let h = Harness::new();
    h.manager
        .handle_signal(InboundSignal::Incoming {
            call_type: CallType::Voice,
            from: peer("caller"),
        })
        .await
        .unwrap();
    h.manager.handle_signal(offer_signal()).await.unwrap();
    assert_eq!(h.manager.state(), CallState::Ringing);
    assert!(h.channel.sent().is_empty());
}

#[tokio::test]
async fn transport_connected_completes_connecting() {
    let h = Harness::new();
    h.manager
        .initiate_call(CallType::Voice, peer("partner"))
        .await
        .unwrap();
    h.manager
        .handle_signal(InboundSignal::Accepted {
            from: peer("partner"),
        })
        .await
        .unwrap();

    h.transport()
        .inject(TransportEvent::ConnectionState(PeerConnectionState::Connected));
    h.wait_for(|s| s.state == CallState::Connected).await;

    // The answer is still applied afterwards
    h.manager
        .handle_signal(InboundSignal::Answer {
            answer: SessionDescription::answer("v=0"),
        })
        .await
        .unwrap();
    assert!(h.transport().has_remote_description());
    assert_eq!(h.manager.state(), CallState::Connected);
}

#[tokio::test]
async fn negotiation_failure_tears_down_and_notifies_peer() {
    let mut h = Harness::with(
        CallConfig::default(),
        MockBehavior {
            fail_set_remote: true,
            ..MockBehavior::default()
        },
    );
    h.accepted_callee(CallType::Voice).await;

    let result = h.manager.handle_signal(offer_signal()).await;
    assert!(matches!(
        result,
        Err(CallError::Transport(TransportError::Negotiation(_)))
    ));
    assert_fully_idle(&h);
    assert_eq!(h.channel.count("call:end"), 1);
    assert!(h.transport().is_closed());

    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(e, CallEvent::Failed { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        CallEvent::CallEnded {
            reason: EndReason::NegotiationFailed,
            ..
        }
    )));
}

#[tokio::test]
async fn offer_failure_ends_caller_side() {
    let h = Harness::with(
        CallConfig::default(),
        MockBehavior {
            fail_create_offer: true,
            ..MockBehavior::default()
        },
    );
    h.manager
        .initiate_call(CallType::Voice, peer("partner"))
        .await
        .unwrap();
    let result = h
        .manager
        .handle_signal(InboundSignal::Accepted {
            from: peer("partner"),
        })
        .await;
    assert!(result.is_err());
    assert_fully_idle(&h);
    assert_eq!(h.channel.count("webrtc:offer"), 0);
}

// ============================================================================
// ICE candidates
// ============================================================================

#[tokio::test]
async fn early_candidates_are_applied_once_in_order() {
    let h = Harness::new();
    h.manager
        .handle_signal(InboundSignal::Incoming {
            call_type: CallType::Voice,
            from: peer("caller"),
        })
        .await
        .unwrap();

    // Arrives before any peer connection exists
    h.manager
        .handle_signal(InboundSignal::IceCandidate {
            candidate: candidate(0),
        })
        .await
        .unwrap();
    h.manager.accept_call().await.unwrap();
    for n in 1..4 {
        h.manager
            .handle_signal(InboundSignal::IceCandidate {
                candidate: candidate(n),
            })
            .await
            .unwrap();
    }
    assert_eq!(h.manager.pending_candidates(), 4);
    assert!(h.transport().applied_candidates().is_empty());

    h.manager.handle_signal(offer_signal()).await.unwrap();
    assert_eq!(h.manager.pending_candidates(), 0);
    assert_eq!(
        h.transport().applied_candidates(),
        vec!["candidate:0", "candidate:1", "candidate:2", "candidate:3"]
    );

    h.manager
        .handle_signal(InboundSignal::IceCandidate {
            candidate: candidate(4),
        })
        .await
        .unwrap();
    assert_eq!(h.manager.pending_candidates(), 0);
    assert_eq!(h.transport().applied_candidates().len(), 5);
    assert_eq!(
        h.transport().applied_candidates().last().map(String::as_str),
        Some("candidate:4")
    );
}

#[tokio::test]
async fn candidates_while_idle_are_dropped() {
    let h = Harness::new();
    h.manager
        .handle_signal(InboundSignal::IceCandidate {
            candidate: candidate(0),
        })
        .await
        .unwrap();
    assert_eq!(h.manager.pending_candidates(), 0);
    assert_eq!(h.manager.state(), CallState::Idle);
}

#[tokio::test]
async fn queued_candidates_do_not_leak_into_next_call() {
    let h = Harness::new();
    h.manager
        .initiate_call(CallType::Voice, peer("partner"))
        .await
        .unwrap();
    for n in 0..3 {
        h.manager
            .handle_signal(InboundSignal::IceCandidate {
                candidate: candidate(n),
            })
            .await
            .unwrap();
    }
    assert_eq!(h.manager.pending_candidates(), 3);
    h.manager.end_call().await;

    h.manager
        .initiate_call(CallType::Voice, peer("partner"))
        .await
        .unwrap();
    assert_eq!(h.manager.pending_candidates(), 0);
    h.manager
        .handle_signal(InboundSignal::Accepted {
            from: peer("partner"),
        })
        .await
        .unwrap();
    h.manager
        .handle_signal(InboundSignal::Answer {
            answer: SessionDescription::answer("v=0"),
        })
        .await
        .unwrap();
    assert!(h.transport().applied_candidates().is_empty());
}

#[tokio::test]
async fn local_candidates_are_forwarded() {
    let h = Harness::with(
        CallConfig::default(),
        MockBehavior {
            local_candidates: 2,
            ..MockBehavior::default()
        },
    );
    h.manager
        .initiate_call(CallType::Voice, peer("partner"))
        .await
        .unwrap();
    h.manager
        .handle_signal(InboundSignal::Accepted {
            from: peer("partner"),
        })
        .await
        .unwrap();

    h.wait_for_emits("webrtc:ice-candidate", 2).await;
    let forwarded: Vec<_> = h
        .channel
        .sent()
        .into_iter()
        .filter_map(|s| match s {
            OutboundSignal::IceCandidate { candidate } => Some(candidate.candidate),
            _ => None,
        })
        .collect();
    assert!(forwarded[0].starts_with("candidate:0"));
    assert!(forwarded[1].starts_with("candidate:1"));
}

// ============================================================================
// Rejecting and ending
// ============================================================================

#[tokio::test]
async fn reject_emits_one_reject_without_media() {
    let h = Harness::new();
    h.manager
        .handle_signal(InboundSignal::Incoming {
            call_type: CallType::Video,
            from: peer("caller"),
        })
        .await
        .unwrap();

    h.manager.reject_call().await.unwrap();
    assert_eq!(
        h.channel.sent(),
        vec![OutboundSignal::Reject { to: peer("caller") }]
    );
    assert_fully_idle(&h);
    assert!(h.media.issued_tracks().is_empty());
    assert!(h.transports.created().is_empty());
}

#[tokio::test]
async fn reject_requires_ringing() {
    let h = Harness::new();
    assert!(matches!(
        h.manager.reject_call().await,
        Err(CallError::InvalidState(CallState::Idle))
    ));
    h.manager
        .initiate_call(CallType::Voice, peer("partner"))
        .await
        .unwrap();
    assert!(matches!(
        h.manager.reject_call().await,
        Err(CallError::InvalidState(CallState::Calling))
    ));
    assert_eq!(h.manager.state(), CallState::Calling);
}

#[tokio::test]
async fn accept_without_remote_peer_is_refused() {
    let h = Harness::new();
    let result = h.manager.accept_call().await;
    assert!(matches!(result, Err(CallError::MissingRemotePeer)));
    assert!(result.unwrap_err().is_recoverable());
    assert_fully_idle(&h);
    assert!(h.channel.sent().is_empty());
}

#[tokio::test]
async fn accept_while_calling_is_refused() {
    let h = Harness::new();
    h.manager
        .initiate_call(CallType::Voice, peer("partner"))
        .await
        .unwrap();
    assert!(matches!(
        h.manager.accept_call().await,
        Err(CallError::InvalidState(CallState::Calling))
    ));
    assert_eq!(h.manager.state(), CallState::Calling);
    assert_eq!(h.channel.count("call:accept"), 0);
}

#[tokio::test]
async fn accept_with_denied_media_rejects_caller() {
    let h = Harness::new();
    h.manager
        .handle_signal(InboundSignal::Incoming {
            call_type: CallType::Video,
            from: peer("caller"),
        })
        .await
        .unwrap();
    h.media.set_permission(false);

    assert!(h.manager.accept_call().await.is_err());
    assert_fully_idle(&h);
    assert_eq!(
        h.channel.sent(),
        vec![OutboundSignal::Reject { to: peer("caller") }]
    );
}

#[tokio::test]
async fn remote_end_while_connected_does_not_echo() {
    let mut h = Harness::new();
    h.connected_caller(CallType::Video).await;
    let tracks = h.media.issued_tracks();
    h.channel.clear();

    h.manager.handle_signal(InboundSignal::Ended).await.unwrap();
    assert_fully_idle(&h);
    assert!(tracks.iter().all(|t| t.ready_state() == murmur_core::media::TrackState::Ended));
    assert_eq!(h.channel.count("call:end"), 0);
    assert!(h.transport().is_closed());
    assert!(h.drain_events().iter().any(|e| matches!(
        e,
        CallEvent::CallEnded {
            reason: EndReason::RemoteHangup,
            ..
        }
    )));
}

#[tokio::test]
async fn remote_rejection_surfaces_decline() {
    let mut h = Harness::new();
    h.manager
        .initiate_call(CallType::Video, peer("partner"))
        .await
        .unwrap();
    h.channel.clear();

    h.manager.handle_signal(InboundSignal::Rejected).await.unwrap();
    assert_fully_idle(&h);
    assert!(h.channel.sent().is_empty());
    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(e, CallEvent::Declined { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        CallEvent::CallEnded {
            reason: EndReason::Declined,
            ..
        }
    )));
}

#[tokio::test]
async fn end_call_when_idle_is_a_no_op() {
    let h = Harness::new();
    h.manager.end_call().await;
    h.manager.end_call().await;
    assert_fully_idle(&h);
    assert!(h.channel.sent().is_empty());
}

#[tokio::test]
async fn end_call_from_every_state_returns_to_idle() {
    // Calling
    let h = Harness::new();
    h.manager
        .initiate_call(CallType::Video, peer("partner"))
        .await
        .unwrap();
    h.manager.end_call().await;
    assert_fully_idle(&h);
    assert_eq!(h.channel.count("call:end"), 1);
    assert!(h.transport().is_closed());

    // Ringing
    let h = Harness::new();
    h.manager
        .handle_signal(InboundSignal::Incoming {
            call_type: CallType::Video,
            from: peer("caller"),
        })
        .await
        .unwrap();
    h.manager.end_call().await;
    assert_fully_idle(&h);

    // Connecting
    let h = Harness::new();
    h.accepted_callee(CallType::Video).await;
    h.manager.end_call().await;
    assert_fully_idle(&h);
    assert!(h.transport().is_closed());

    // Connected, twice
    let h = Harness::new();
    h.connected_caller(CallType::Video).await;
    h.manager.end_call().await;
    h.manager.end_call().await;
    assert_fully_idle(&h);
    assert_eq!(h.channel.count("call:end"), 1);
    assert!(h
        .media
        .issued_tracks()
        .iter()
        .all(|t| t.ready_state() == murmur_core::media::TrackState::Ended));
}

#[tokio::test]
async fn transport_failure_is_treated_as_hangup() {
    let mut h = Harness::new();
    h.connected_caller(CallType::Voice).await;
    h.channel.clear();

    h.transport()
        .inject(TransportEvent::ConnectionState(PeerConnectionState::Failed));
    h.wait_for(|s| s.state == CallState::Idle).await;

    assert_fully_idle(&h);
    assert_eq!(h.channel.count("call:end"), 1);
    assert!(h.drain_events().iter().any(|e| matches!(
        e,
        CallEvent::CallEnded {
            reason: EndReason::TransportLost,
            ..
        }
    )));
}

#[tokio::test]
async fn stale_offer_is_discarded_after_hangup() {
    let gate = Arc::new(Notify::new());
    let h = Harness::with(
        CallConfig::default(),
        MockBehavior {
            offer_gate: Some(Arc::clone(&gate)),
            ..MockBehavior::default()
        },
    );
    h.manager
        .initiate_call(CallType::Video, peer("partner"))
        .await
        .unwrap();

    let manager = h.manager.clone();
    let pending = tokio::spawn(async move {
        manager
            .handle_signal(InboundSignal::Accepted {
                from: peer("partner"),
            })
            .await
    });
    h.wait_for(|s| s.state == CallState::Connecting).await;

    h.manager.end_call().await;
    gate.notify_one();
    assert!(pending.await.unwrap().is_ok());

    assert_fully_idle(&h);
    assert_eq!(h.channel.count("webrtc:offer"), 0);
    assert_eq!(h.channel.count("call:end"), 1);
}

#[tokio::test]
async fn incoming_call_while_busy_is_ignored() {
    let h = Harness::new();
    let call_id = h
        .manager
        .initiate_call(CallType::Voice, peer("partner"))
        .await
        .unwrap();
    h.manager
        .handle_signal(InboundSignal::Incoming {
            call_type: CallType::Video,
            from: peer("intruder"),
        })
        .await
        .unwrap();

    let snapshot = h.manager.snapshot();
    assert_eq!(snapshot.call_id, Some(call_id));
    assert_eq!(snapshot.state, CallState::Calling);
    assert_eq!(snapshot.remote_peer_id, Some(peer("partner")));
}

// ============================================================================
// In-call controls
// ============================================================================

#[tokio::test]
async fn remote_tracks_merge_into_one_stream() {
    let h = Harness::new();
    h.connected_caller(CallType::Video).await;
    h.wait_for(|s| s.remote_stream.as_ref().is_some_and(|r| r.tracks.len() == 2))
        .await;
    assert!(h.manager.snapshot().remote_stream.unwrap().has_video());
}

#[tokio::test]
async fn mute_and_camera_toggle_track_flags() {
    let h = Harness::new();
    assert!(matches!(
        h.manager.set_audio_muted(true),
        Err(CallError::NotInCall)
    ));

    h.connected_caller(CallType::Video).await;
    h.manager.set_audio_muted(true).unwrap();
    h.manager.set_video_enabled(false).unwrap();

    let snapshot = h.manager.snapshot();
    assert!(snapshot.audio_muted);
    assert!(!snapshot.video_enabled);
    let stream = snapshot.local_stream.unwrap();
    assert!(stream.audio_tracks().all(|t| !t.is_enabled()));
    assert!(stream.video_tracks().all(|t| !t.is_enabled()));

    h.manager.set_audio_muted(false).unwrap();
    assert!(stream.audio_tracks().all(|t| t.is_enabled()));
    // No renegotiation
    assert_eq!(h.channel.count("webrtc:offer"), 1);
}

#[tokio::test]
async fn switch_camera_replaces_sender_track() {
    let mut h = Harness::new();
    h.connected_caller(CallType::Video).await;
    let old = h.manager.snapshot().local_video_track().unwrap();
    assert_eq!(old.device_id(), "cam-front");

    let device = h.manager.switch_camera(None).await.unwrap();
    assert_eq!(device, "cam-rear");

    let new = h.manager.snapshot().local_video_track().unwrap();
    assert_eq!(new.device_id(), "cam-rear");
    assert_eq!(old.ready_state(), murmur_core::media::TrackState::Ended);

    let replaced = h.transport().ops().into_iter().find_map(|op| match op {
        MockOp::ReplaceTrack(sender, track) => Some((sender, track)),
        _ => None,
    });
    let (sender, track) = replaced.unwrap();
    assert_eq!(track, new.id());
    assert_eq!(h.transport().sender_track(sender), Some(new.id().to_string()));

    let live_video = h
        .media
        .live_tracks()
        .into_iter()
        .filter(|t| t.kind() == MediaKind::Video)
        .count();
    assert_eq!(live_video, 1);
    assert_eq!(h.channel.count("webrtc:offer"), 1);
    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, CallEvent::CameraSwitched { device_id, .. } if device_id == "cam-rear")));
}

#[tokio::test]
async fn failed_camera_switch_keeps_current_video() {
    let h = Harness::with(
        CallConfig::default(),
        MockBehavior {
            fail_replace_track: true,
            ..MockBehavior::default()
        },
    );
    h.connected_caller(CallType::Video).await;
    let old = h.manager.snapshot().local_video_track().unwrap();

    let result = h.manager.switch_camera(Some("cam-rear".to_string())).await;
    assert!(matches!(result, Err(CallError::Transport(TransportError::Track(_)))));

    assert_eq!(h.manager.state(), CallState::Connected);
    assert_eq!(old.ready_state(), murmur_core::media::TrackState::Live);
    let current = h.manager.snapshot().local_video_track().unwrap();
    assert_eq!(current.id(), old.id());

    let live_video: Vec<_> = h
        .media
        .live_tracks()
        .into_iter()
        .filter(|t| t.kind() == MediaKind::Video)
        .collect();
    assert_eq!(live_video.len(), 1);
    assert_eq!(live_video[0].id(), old.id());
}

#[tokio::test]
async fn switch_camera_requires_video() {
    let h = Harness::new();
    assert!(matches!(
        h.manager.switch_camera(None).await,
        Err(CallError::NotInCall)
    ));
    h.connected_caller(CallType::Voice).await;
    assert!(matches!(
        h.manager.switch_camera(None).await,
        Err(CallError::NoVideo)
    ));
}

#[tokio::test]
async fn switch_to_unknown_camera_fails_cleanly() {
    let h = Harness::new();
    h.connected_caller(CallType::Video).await;
    let result = h.manager.switch_camera(Some("cam-usb".to_string())).await;
    assert!(matches!(
        result,
        Err(CallError::Media(MediaError::DeviceNotFound(_)))
    ));
    assert_eq!(
        h.manager.snapshot().local_video_track().unwrap().device_id(),
        "cam-front"
    );
}

// ============================================================================
// Ring timeout
// ============================================================================

fn short_ring() -> CallConfig {
    CallConfig {
        ring_timeout: Some(Duration::from_secs(30)),
        ..CallConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn unanswered_outgoing_call_times_out() {
    let mut h = Harness::with(short_ring(), MockBehavior::default());
    h.manager
        .initiate_call(CallType::Voice, peer("partner"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(h.manager.state(), CallState::Calling);

    tokio::time::sleep(Duration::from_secs(2)).await;
    h.wait_for(|s| s.state == CallState::Idle).await;
    h.wait_for_emits("call:end", 1).await;
    assert_fully_idle(&h);
    assert_eq!(h.channel.count("call:end"), 1);
    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, CallEvent::TimedOut { .. })));
}

#[tokio::test(start_paused = true)]
async fn unanswered_incoming_call_is_rejected() {
    let h = Harness::with(short_ring(), MockBehavior::default());
    h.manager
        .handle_signal(InboundSignal::Incoming {
            call_type: CallType::Video,
            from: peer("caller"),
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(31)).await;
    h.wait_for(|s| s.state == CallState::Idle).await;
    h.wait_for_emits("call:reject", 1).await;
    assert_eq!(
        h.channel.sent(),
        vec![OutboundSignal::Reject { to: peer("caller") }]
    );
}

#[tokio::test(start_paused = true)]
async fn accept_during_ring_timeout_reject_is_refused() {
    let h = Harness::with(short_ring(), MockBehavior::default());
    h.manager
        .handle_signal(InboundSignal::Incoming {
            call_type: CallType::Video,
            from: peer("caller"),
        })
        .await
        .unwrap();

    let gate = Arc::new(Notify::new());
    h.channel.hold_emits(Some(gate.clone()));
    tokio::time::sleep(Duration::from_secs(31)).await;
    h.wait_for_emits("call:reject", 1).await;

    // The reject is still in flight; the session is already gone
    assert_eq!(h.manager.state(), CallState::Idle);
    assert!(matches!(
        h.manager.accept_call().await,
        Err(CallError::MissingRemotePeer)
    ));
    assert!(h.transports.created().is_empty());
    assert!(h.media.live_tracks().is_empty());

    h.channel.hold_emits(None);
    gate.notify_one();
    tokio::task::yield_now().await;
    assert_fully_idle(&h);
    assert_eq!(
        h.channel.sent(),
        vec![OutboundSignal::Reject { to: peer("caller") }]
    );
}

#[tokio::test(start_paused = true)]
async fn answered_call_does_not_time_out() {
    let h = Harness::with(short_ring(), MockBehavior::default());
    h.connected_caller(CallType::Voice).await;

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.manager.state(), CallState::Connected);
    assert_eq!(h.channel.count("call:end"), 0);
}
