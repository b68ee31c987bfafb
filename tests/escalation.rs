//! Search escalation: widening rounds, exclusion of providers already
//! asked, and the terminal no-providers outcome.

use std::sync::Arc;
use std::time::Duration;

use lifeline::config::DispatchConfig;
use lifeline::dispatch::{ChannelMessage, DispatchService, LocalChannelHub, SessionId};
use lifeline::domain::{
    Availability, Capability, GeoPoint, RequestStatus, RequestSubmission,
};
use lifeline::geo::GeoIndex;
use lifeline::store::{DispatchStore, MemoryStore};
use tokio::sync::mpsc;
use uuid::Uuid;

const ORIGIN: GeoPoint = GeoPoint {
    lat: 27.7122,
    lon: 85.3307,
};

fn setup(
    config: DispatchConfig,
) -> (
    DispatchService,
    Arc<LocalChannelHub>,
    Arc<GeoIndex>,
    Arc<MemoryStore>,
) {
    let geo = Arc::new(GeoIndex::new(h3o::Resolution::Seven));
    let hub = Arc::new(LocalChannelHub::new());
    let store = Arc::new(MemoryStore::new());
    let service = DispatchService::new(geo.clone(), store.clone(), hub.clone(), config);
    (service, hub, geo, store)
}

fn ambulance_at(geo: &GeoIndex, lat: f64, lon: f64) -> Uuid {
    let id = Uuid::new_v4();
    geo.upsert(
        id,
        Capability::Ambulance,
        GeoPoint::new(lat, lon),
        Availability::Available,
    )
    .unwrap();
    id
}

fn submission() -> RequestSubmission {
    RequestSubmission {
        requester_id: Uuid::new_v4(),
        capability: Capability::Ambulance,
        origin: ORIGIN,
        description: "house fire spreading".to_string(),
    }
}

async fn next_msg_within(
    rx: &mut mpsc::UnboundedReceiver<ChannelMessage>,
    window: Duration,
) -> ChannelMessage {
    tokio::time::timeout(window, rx.recv())
        .await
        .expect("no message within window")
        .expect("session closed")
}

async fn wait_for_terminal(store: &MemoryStore, request_id: Uuid) -> RequestStatus {
    for _ in 0..200 {
        if let Some(req) = store.get_request(request_id).await.unwrap() {
            if req.status.is_terminal() {
                return req.status;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("request {request_id} never reached a terminal state");
}

#[tokio::test]
async fn declined_round_escalates_and_excludes_the_decliner() {
    // top_k of 1 so only the nearest provider is asked per round
    let config = DispatchConfig {
        top_k: 1,
        initial_radius_km: 2.0,
        radius_step_km: 2.0,
        max_escalations: 3,
        offer_timeout_secs: 20,
    };
    let (service, hub, geo, store) = setup(config);

    let near = ambulance_at(&geo, 27.7194, 85.3307); // ~0.8km
    let far = ambulance_at(&geo, 27.7248, 85.3307); // ~1.4km
    let mut near_rx = hub.register(SessionId(near)).await;
    let mut far_rx = hub.register(SessionId(far)).await;

    let sub = submission();
    let mut requester_rx = hub.register(SessionId(sub.requester_id)).await;
    let request_id = service.submit(sub).await.unwrap();

    // Round one: only the nearest is offered
    assert!(matches!(
        next_msg_within(&mut near_rx, Duration::from_secs(2)).await,
        ChannelMessage::NewEmergency { .. }
    ));

    service
        .handle_message(
            SessionId(near),
            ChannelMessage::DeclineRequest {
                request_id,
                provider_id: near,
            },
        )
        .await
        .unwrap();

    // Everyone in the round declined, so escalation is immediate
    match next_msg_within(&mut requester_rx, Duration::from_secs(2)).await {
        ChannelMessage::SearchExpanded { radius_km, .. } => assert_eq!(radius_km, 4.0),
        other => panic!("expected search expansion, got {other:?}"),
    }

    // Round two skips the decliner and reaches the next candidate
    assert!(matches!(
        next_msg_within(&mut far_rx, Duration::from_secs(2)).await,
        ChannelMessage::NewEmergency { .. }
    ));

    service
        .handle_message(
            SessionId(far),
            ChannelMessage::AcceptRequest {
                request_id,
                provider_id: far,
            },
        )
        .await
        .unwrap();

    match next_msg_within(&mut requester_rx, Duration::from_secs(2)).await {
        ChannelMessage::Assigned { provider_id, .. } => assert_eq!(provider_id, far),
        other => panic!("expected assignment, got {other:?}"),
    }

    // The escalated radius is what got recorded with the acceptance
    let stored = store.get_request(request_id).await.unwrap().unwrap();
    assert_eq!(stored.search_radius_km, 4.0);
    let entries = store.outbox_entries_for(request_id).await.unwrap();
    let accepted = entries
        .iter()
        .find(|e| e.event_type.as_str() == "accepted")
        .expect("accepted event recorded");
    assert_eq!(accepted.payload["radius_km"], 4.0);
    assert_eq!(accepted.payload["provider_id"], far.to_string());
}

#[tokio::test]
async fn exhausted_budget_ends_in_no_providers_available() {
    let config = DispatchConfig {
        top_k: 5,
        initial_radius_km: 2.0,
        radius_step_km: 2.0,
        max_escalations: 2,
        offer_timeout_secs: 20,
    };
    let (service, hub, _geo, store) = setup(config);

    // Nobody is registered at all
    let sub = submission();
    let mut requester_rx = hub.register(SessionId(sub.requester_id)).await;
    let request_id = service.submit(sub).await.unwrap();

    // Every empty round escalates until the budget runs out
    for expected_radius in [4.0, 6.0] {
        match next_msg_within(&mut requester_rx, Duration::from_secs(2)).await {
            ChannelMessage::SearchExpanded { radius_km, .. } => {
                assert_eq!(radius_km, expected_radius)
            }
            other => panic!("expected search expansion, got {other:?}"),
        }
    }
    assert!(matches!(
        next_msg_within(&mut requester_rx, Duration::from_secs(2)).await,
        ChannelMessage::NoProvidersAvailable { .. }
    ));

    assert_eq!(
        wait_for_terminal(&store, request_id).await,
        RequestStatus::NoProvidersAvailable
    );
    let stored = store.get_request(request_id).await.unwrap().unwrap();
    assert_eq!(stored.assigned_provider_id, None);
    assert_eq!(stored.search_radius_km, 6.0);

    // Exactly one terminal event was recorded
    let entries = store.outbox_entries_for(request_id).await.unwrap();
    let terminal: Vec<_> = entries
        .iter()
        .filter(|e| {
            matches!(
                e.event_type.as_str(),
                "no_providers" | "cancelled" | "completed"
            )
        })
        .collect();
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].event_type.as_str(), "no_providers");
    assert_eq!(terminal[0].payload["final_radius_km"], 6.0);
}

#[tokio::test(start_paused = true)]
async fn unanswered_offers_time_out_and_escalate() {
    let config = DispatchConfig {
        top_k: 1,
        initial_radius_km: 2.0,
        radius_step_km: 2.0,
        max_escalations: 3,
        offer_timeout_secs: 20,
    };
    let (service, hub, geo, _store) = setup(config);

    let silent = ambulance_at(&geo, 27.7194, 85.3307);
    let responsive = ambulance_at(&geo, 27.7248, 85.3307);
    let mut silent_rx = hub.register(SessionId(silent)).await;
    let mut responsive_rx = hub.register(SessionId(responsive)).await;

    let sub = submission();
    let mut requester_rx = hub.register(SessionId(sub.requester_id)).await;
    let request_id = service.submit(sub).await.unwrap();

    // With the clock paused, these waits jump straight to the offer deadline
    let window = Duration::from_secs(120);
    assert!(matches!(
        next_msg_within(&mut silent_rx, window).await,
        ChannelMessage::NewEmergency { .. }
    ));

    // The silent provider never answers; its offer is withdrawn on timeout
    assert!(matches!(
        next_msg_within(&mut silent_rx, window).await,
        ChannelMessage::RequestTaken { .. }
    ));
    match next_msg_within(&mut requester_rx, window).await {
        ChannelMessage::SearchExpanded { radius_km, .. } => assert_eq!(radius_km, 4.0),
        other => panic!("expected search expansion, got {other:?}"),
    }

    // The widened round reaches the responsive provider
    assert!(matches!(
        next_msg_within(&mut responsive_rx, window).await,
        ChannelMessage::NewEmergency { .. }
    ));
    service
        .handle_message(
            SessionId(responsive),
            ChannelMessage::AcceptRequest {
                request_id,
                provider_id: responsive,
            },
        )
        .await
        .unwrap();
    match next_msg_within(&mut requester_rx, window).await {
        ChannelMessage::Assigned { provider_id, .. } => assert_eq!(provider_id, responsive),
        other => panic!("expected assignment, got {other:?}"),
    }
}
