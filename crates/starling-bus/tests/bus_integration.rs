//! Integration tests for the message bus: cross-task delivery, direct
//! request/response traffic, and typed coordination payloads.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use serde_json::json;
use starling_bus::{MessageBus, Payload};
use starling_core::AgentId;

#[tokio::test]
async fn two_agents_exchange_direct_messages() {
    let bus = MessageBus::default();
    let ping = AgentId::new("ping");
    let pong = AgentId::new("pong");

    let mut pong_inbox = bus.subscribe(&pong, &MessageBus::direct_topic(&pong));
    let mut ping_inbox = bus.subscribe(&ping, &MessageBus::direct_topic(&ping));

    // The responder echoes whatever arrives back to the sender.
    let responder_bus = bus.clone();
    let responder_id = pong.clone();
    let responder = tokio::spawn(async move {
        let mut answered = 0;
        while answered < 3 {
            let Some(message) = pong_inbox.recv().await else {
                break;
            };
            responder_bus.send_direct(&responder_id, &message.sender, message.payload);
            answered += 1;
        }
        answered
    });

    for i in 0..3 {
        bus.send_direct(&ping, &pong, Payload::Data(json!({ "seq": i })));
        let reply = ping_inbox.recv().await.unwrap();
        assert_eq!(reply.sender, pong);
        assert_eq!(reply.payload, Payload::Data(json!({ "seq": i })));
    }

    assert_eq!(responder.await.unwrap(), 3);
}

#[tokio::test]
async fn per_topic_order_is_identical_for_all_subscribers() {
    let bus = MessageBus::default();
    let publisher = AgentId::new("publisher");
    let mut first = bus.subscribe(&AgentId::new("first"), "telemetry");
    let mut second = bus.subscribe(&AgentId::new("second"), "telemetry");

    for i in 0..20 {
        bus.publish(&publisher, "telemetry", Payload::Data(json!(i)));
    }

    let drain = |sub: &mut starling_bus::Subscription| {
        let mut seen = Vec::new();
        while let Some(message) = sub.try_recv() {
            seen.push(message.payload);
        }
        seen
    };
    let seen_first = drain(&mut first);
    let seen_second = drain(&mut second);

    assert_eq!(seen_first.len(), 20);
    assert_eq!(seen_first, seen_second);
}

#[tokio::test]
async fn coordination_payloads_survive_the_log() {
    let bus = MessageBus::default();
    let coordinator = AgentId::new("coordinator");
    let round = starling_core::RoundId::new();

    bus.broadcast(
        &coordinator,
        Payload::ConsensusReached {
            round,
            approved: true,
            approvals: 3,
            quorum: 2,
        },
    );

    let logged = bus.recent(MessageBus::BROADCAST, 5);
    assert_eq!(logged.len(), 1);
    match &logged[0].payload {
        Payload::ConsensusReached {
            round: logged_round,
            approved,
            ..
        } => {
            assert_eq!(*logged_round, round);
            assert!(*approved);
        }
        other => panic!("unexpected payload in log: {other:?}"),
    }
}
