//! End-to-end call flows between two controllers over the loopback bus

#![allow(clippy::unwrap_used)]

mod common;

use callwire_core::{
    CallError, CallEvent, CallState, ChannelType, EndReason, IceCandidate, LoopbackHub,
    ParticipantId, Role, SessionDescription, SignalingMessage, SignalingTransport,
    SimulatedEngineFactory,
};
use common::{pair, settle, transitions};
use std::time::Duration;

#[tokio::test]
async fn test_video_call_round_trip() {
    let (hub, registry, mut alice, mut bob) = pair();

    let call_id = alice
        .controller()
        .initiate(bob.id.clone(), true)
        .await
        .unwrap();
    assert_eq!(alice.controller().state(), CallState::Dialing);

    settle(&[&alice, &bob]).await;
    assert_eq!(bob.controller().state(), CallState::Ringing);

    let invite = hub
        .delivered()
        .into_iter()
        .find(|e| e.message.message_type() == "call_incoming")
        .unwrap();
    match invite.message {
        SignalingMessage::CallIncoming {
            is_video,
            channel_id,
            ..
        } => {
            assert!(is_video);
            assert_eq!(channel_id, call_id);
        }
        other => unreachable!("unexpected message {other:?}"),
    }

    let bob_events = bob.take_events();
    assert!(bob_events.iter().any(|e| matches!(
        e,
        CallEvent::IncomingCall { is_video: true, from, .. } if *from == alice.id
    )));
    assert!(bob_events.iter().any(|e| matches!(
        e,
        CallEvent::ChannelAnnounced { call_type: ChannelType::Video, .. }
    )));
    // no engine before consent
    assert_eq!(bob.engines.created(), 0);

    bob.controller().accept().await.unwrap();
    settle(&[&alice, &bob]).await;

    assert_eq!(alice.controller().state(), CallState::Active);
    assert_eq!(bob.controller().state(), CallState::Active);
    assert_eq!(
        transitions(&alice.take_events()),
        vec![
            (CallState::Idle, CallState::Dialing),
            (CallState::Dialing, CallState::Connecting),
            (CallState::Connecting, CallState::Active),
        ]
    );

    let bob_session = bob.controller().session().unwrap();
    assert_eq!(bob_session.id, call_id);
    assert_eq!(bob_session.role, Role::Callee);
    assert!(bob_session.started_at.is_some());

    let channel = registry.snapshot(call_id).unwrap();
    assert!(channel.participants.contains(&alice.id));
    assert!(channel.participants.contains(&bob.id));

    // offer or answer always precedes the sender's candidates
    let log = hub.delivered();
    for sender in [&alice.id, &bob.id] {
        let from_sender: Vec<_> = log
            .iter()
            .filter(|e| e.from.as_ref() == Some(sender))
            .map(|e| e.message.message_type())
            .collect();
        let first_candidate = from_sender
            .iter()
            .position(|t| *t == "webrtc_ice_candidate")
            .unwrap();
        let description = from_sender
            .iter()
            .position(|t| *t == "call_incoming" || *t == "webrtc_answer")
            .unwrap();
        assert!(description < first_candidate, "{sender}: {from_sender:?}");
    }
}

#[tokio::test]
async fn test_remote_media_aggregated_per_stream() {
    let (_hub, _registry, alice, mut bob) = pair();

    alice
        .controller()
        .initiate(bob.id.clone(), true)
        .await
        .unwrap();
    settle(&[&alice, &bob]).await;
    bob.take_events();

    bob.controller().accept().await.unwrap();
    settle(&[&alice, &bob]).await;

    let streams: Vec<_> = bob
        .take_events()
        .into_iter()
        .filter_map(|e| match e {
            CallEvent::RemoteMedia { stream, .. } => Some(stream),
            _ => None,
        })
        .collect();
    assert_eq!(streams.len(), 2);
    let merged = streams.last().unwrap();
    assert_eq!(merged.tracks.len(), 2);
    assert!(merged.has_video());
    assert_eq!(merged.stream_id, streams[0].stream_id);
}

#[tokio::test]
async fn test_hang_up_tears_down_both_sides() {
    let (hub, registry, mut alice, bob) = pair();

    let call_id = alice
        .controller()
        .initiate(bob.id.clone(), false)
        .await
        .unwrap();
    settle(&[&alice, &bob]).await;
    bob.controller().accept().await.unwrap();
    settle(&[&alice, &bob]).await;
    alice.take_events();

    alice.controller().hang_up().await.unwrap();
    alice.controller().hang_up().await.unwrap();
    settle(&[&alice, &bob]).await;

    assert_eq!(hub.count_from(&alice.id, "call_ended"), 1);
    assert_eq!(hub.count_from(&bob.id, "call_ended"), 0);
    assert_eq!(alice.controller().state(), CallState::Ended);
    assert_eq!(bob.controller().state(), CallState::Ended);
    assert_eq!(
        bob.controller().session().unwrap().end_reason,
        Some(EndReason::RemoteEnded)
    );

    for p in [&alice, &bob] {
        assert_eq!(p.engines.created(), 1);
        assert_eq!(p.engines.last().unwrap().close_count(), 1);
        assert_eq!(p.media.live_tracks(), 0);
    }
    assert!(registry.snapshot(call_id).is_none());

    let ended: Vec<_> = alice
        .take_events()
        .into_iter()
        .filter(|e| matches!(e, CallEvent::CallEnded { .. }))
        .collect();
    assert_eq!(ended.len(), 1);
}

#[tokio::test]
async fn test_voice_call_rejected() {
    let (hub, registry, alice, bob) = pair();

    let call_id = alice
        .controller()
        .initiate(bob.id.clone(), false)
        .await
        .unwrap();
    settle(&[&alice, &bob]).await;

    bob.controller().reject().await.unwrap();
    settle(&[&alice, &bob]).await;

    assert_eq!(hub.count_from(&bob.id, "call_rejected"), 1);
    assert_eq!(bob.controller().state(), CallState::Ended);
    assert_eq!(bob.engines.created(), 0);

    let session = alice.controller().session().unwrap();
    assert_eq!(session.state, CallState::Ended);
    assert_eq!(session.end_reason, Some(EndReason::RemoteRejected));
    assert!(alice.engines.last().unwrap().is_closed());
    assert!(registry.snapshot(call_id).is_none());
    assert_eq!(hub.count_from(&alice.id, "call_ended"), 0);
}

#[tokio::test]
async fn test_accept_after_caller_cancelled_is_handled() {
    let (hub, _registry, alice, bob) = pair();

    alice
        .controller()
        .initiate(bob.id.clone(), true)
        .await
        .unwrap();
    settle(&[&bob]).await;
    assert_eq!(bob.controller().state(), CallState::Ringing);

    alice.controller().hang_up().await.unwrap();
    assert_eq!(alice.controller().state(), CallState::Ended);
    assert_eq!(hub.count_from(&alice.id, "call_ended"), 1);

    // bob has not seen call_ended yet
    let result = bob.controller().accept().await;
    assert!(matches!(result, Err(CallError::Negotiation(_))));
    let session = bob.controller().session().unwrap();
    assert_eq!(session.state, CallState::Ended);
    assert_eq!(session.end_reason, Some(EndReason::NegotiationFailed));

    settle(&[&alice, &bob]).await;
    assert_eq!(alice.controller().state(), CallState::Ended);
}

#[tokio::test]
async fn test_early_candidates_applied_in_order() {
    let hub = LoopbackHub::new();
    let registry = callwire_core::InMemoryChannelRegistry::new();
    let alice = hub.register("alice");
    let bob = common::Builder::new(&hub, &registry).build("bob");

    let channel = callwire_core::CallChannelRegistry::create(
        &registry,
        ChannelType::Voice,
        &[ParticipantId::from("alice")],
    )
    .await
    .unwrap();

    let candidates: Vec<IceCandidate> = (1..=3)
        .map(|n| IceCandidate::new(format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 600{n} typ host")))
        .collect();
    for c in &candidates {
        alice
            .send_message(&bob.id, SignalingMessage::WebrtcIceCandidate { candidate: c.clone() })
            .await
            .unwrap();
    }
    alice
        .send_message(
            &bob.id,
            SignalingMessage::CallIncoming {
                offer: SessionDescription::offer(
                    "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:0\r\na=msid:a-stream a-mic\r\n",
                ),
                is_video: false,
                channel_id: channel.id,
            },
        )
        .await
        .unwrap();
    settle(&[&bob]).await;
    assert_eq!(bob.controller().state(), CallState::Ringing);

    bob.controller().accept().await.unwrap();
    settle(&[&bob]).await;

    let applied = bob.engines.last().unwrap().applied_candidates();
    let expected: Vec<String> = candidates.iter().map(|c| c.candidate.clone()).collect();
    assert_eq!(applied, expected);
    assert_eq!(bob.controller().state(), CallState::Active);
}

#[tokio::test(start_paused = true)]
async fn test_candidate_order_kept_while_tracks_attach() {
    let hub = LoopbackHub::new();
    let registry = callwire_core::InMemoryChannelRegistry::new();
    let alice = hub.register("alice");
    let bob = common::Builder::new(&hub, &registry)
        .engines(SimulatedEngineFactory::new().with_track_delay(Duration::from_millis(100)))
        .build("bob");

    let channel = callwire_core::CallChannelRegistry::create(
        &registry,
        ChannelType::Voice,
        &[ParticipantId::from("alice")],
    )
    .await
    .unwrap();

    let candidates: Vec<IceCandidate> = (1..=3)
        .map(|n| IceCandidate::new(format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 700{n} typ host")))
        .collect();
    for c in &candidates[..2] {
        alice
            .send_message(&bob.id, SignalingMessage::WebrtcIceCandidate { candidate: c.clone() })
            .await
            .unwrap();
    }
    alice
        .send_message(
            &bob.id,
            SignalingMessage::CallIncoming {
                offer: SessionDescription::offer(
                    "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:0\r\na=msid:a-stream a-mic\r\n",
                ),
                is_video: false,
                channel_id: channel.id,
            },
        )
        .await
        .unwrap();
    settle(&[&bob]).await;
    assert_eq!(bob.controller().state(), CallState::Ringing);

    let controller = bob.controller().clone();
    let accept = tokio::spawn(async move { controller.accept().await });
    while bob.engines.created() == 0 {
        tokio::task::yield_now().await;
    }

    // arrives while the new engine is still attaching tracks
    alice
        .send_message(
            &bob.id,
            SignalingMessage::WebrtcIceCandidate {
                candidate: candidates[2].clone(),
            },
        )
        .await
        .unwrap();
    assert_eq!(bob.drain().await, 1);

    accept.await.unwrap().unwrap();
    settle(&[&bob]).await;

    let applied = bob.engines.last().unwrap().applied_candidates();
    let expected: Vec<String> = candidates.iter().map(|c| c.candidate.clone()).collect();
    assert_eq!(applied, expected);
}

#[tokio::test]
async fn test_candidates_during_ringing_survive_until_accept() {
    let (_hub, _registry, alice, bob) = pair();

    alice
        .controller()
        .initiate(bob.id.clone(), false)
        .await
        .unwrap();
    settle(&[&bob]).await;

    let extra = IceCandidate::new("candidate:9 1 udp 1 10.9.9.9 9999 typ host");
    bob.service
        .dispatch(
            alice.id.clone(),
            SignalingMessage::WebrtcIceCandidate {
                candidate: extra.clone(),
            },
        )
        .await
        .unwrap();

    bob.controller().accept().await.unwrap();
    let applied = bob.engines.last().unwrap().applied_candidates();
    assert_eq!(applied.iter().filter(|c| **c == extra.candidate).count(), 1);
    assert_eq!(applied.last(), Some(&extra.candidate));
}

#[tokio::test]
async fn test_offer_while_ringing_replaces_pending() {
    let (_hub, _registry, alice, bob) = pair();

    alice
        .controller()
        .initiate(bob.id.clone(), false)
        .await
        .unwrap();
    settle(&[&bob]).await;

    let replacement = SessionDescription::offer(
        "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:0\r\na=msid:renegotiated mic-2\r\n",
    );
    bob.service
        .dispatch(
            alice.id.clone(),
            SignalingMessage::WebrtcOffer {
                offer: replacement.clone(),
            },
        )
        .await
        .unwrap();
    assert_eq!(bob.engines.created(), 0);

    bob.controller().accept().await.unwrap();
    assert_eq!(
        bob.engines.last().unwrap().remote_description(),
        Some(replacement)
    );
}

#[tokio::test]
async fn test_renegotiation_offer_answered_in_active_call() {
    let (hub, _registry, alice, bob) = pair();

    alice
        .controller()
        .initiate(bob.id.clone(), false)
        .await
        .unwrap();
    settle(&[&alice, &bob]).await;
    bob.controller().accept().await.unwrap();
    settle(&[&alice, &bob]).await;
    assert_eq!(bob.controller().state(), CallState::Active);

    let offer = alice.engines.last().unwrap().local_description().unwrap();
    bob.service
        .dispatch(alice.id.clone(), SignalingMessage::WebrtcOffer { offer })
        .await
        .unwrap();

    assert_eq!(hub.count_from(&bob.id, "webrtc_answer"), 2);
    assert_eq!(bob.engines.created(), 1);
    assert_eq!(bob.controller().state(), CallState::Active);
}

#[tokio::test]
async fn test_channel_left_ends_call() {
    let (_hub, _registry, alice, bob) = pair();

    let call_id = alice
        .controller()
        .initiate(bob.id.clone(), false)
        .await
        .unwrap();
    settle(&[&alice, &bob]).await;
    bob.controller().accept().await.unwrap();
    settle(&[&alice, &bob]).await;

    alice
        .service
        .dispatch(
            bob.id.clone(),
            SignalingMessage::CallChannelLeft {
                channel_id: call_id,
                user_id: bob.id.clone(),
            },
        )
        .await
        .unwrap();

    let session = alice.controller().session().unwrap();
    assert_eq!(session.state, CallState::Ended);
    assert_eq!(session.end_reason, Some(EndReason::RemoteEnded));
}

#[tokio::test]
async fn test_new_call_after_reset() {
    let (_hub, _registry, alice, bob) = pair();

    alice
        .controller()
        .initiate(bob.id.clone(), false)
        .await
        .unwrap();
    settle(&[&alice, &bob]).await;
    bob.controller().reject().await.unwrap();
    settle(&[&alice, &bob]).await;

    // still Ended: a fresh initiate needs a reset first
    assert!(matches!(
        alice.controller().initiate(bob.id.clone(), false).await,
        Err(CallError::InvalidState { .. })
    ));
    alice.controller().reset().unwrap();
    assert_eq!(alice.controller().state(), CallState::Idle);

    // bob's Ended session is reset implicitly by the new invite
    alice
        .controller()
        .initiate(bob.id.clone(), true)
        .await
        .unwrap();
    settle(&[&alice, &bob]).await;
    assert_eq!(bob.controller().state(), CallState::Ringing);
    assert!(bob.controller().session().unwrap().is_video);
}
