
#[cfg(test)]
mod live_query_tests {
    use super::test_utils::shared::*;
    use parse_live::{
        ChannelState, ClientEvent, LiveEvent, ParseObject, ParseQuery, SubscriptionState,
    };
    use serde_json::json;
    use std::time::Duration;

    fn messages_query() -> ParseQuery {
        let mut query = ParseQuery::new("Message");
        query.equal_to("room", "lobby").unwrap();
        query
    }

    fn message(id: &str, updated_at: &str, text: &str) -> serde_json::Value {
        json!({
            "className": "Message",
            "objectId": id,
            "createdAt": "2024-01-01T00:00:00.000Z",
            "updatedAt": updated_at,
            "room": "lobby",
            "text": text
        })
    }

    fn text_of(object: &ParseObject) -> Option<String> {
        object.get_as("text")
    }

    #[tokio::test]
    async fn test_subscribe_is_queued_until_connected() {
        let (mut client, _backend) = setup_memory_client();
        client.set_session_token(Some("r:session".to_string()));
        let (live, mut server) = setup_fake_live(&client, fast_options(), 0);
        let mut sub = live.subscribe(&messages_query()).unwrap();
        assert_eq!(sub.state(), SubscriptionState::Pending);

        let mut conn = server.accept().await;
        let hello = conn.recv_json().await;
        assert_eq!(hello["op"], "connect");
        assert_eq!(hello["applicationId"], "test-app");
        assert_eq!(hello["sessionToken"], "r:session");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(conn.try_recv_json().is_none(), "subscribe sent before connected");

        conn.send_json(json!({"op": "connected", "clientId": "c1"}));
        let frame = conn.accept_subscribe().await;
        assert_eq!(frame["requestId"], sub.id());
        assert_eq!(
            frame["query"],
            json!({"className": "Message", "where": {"room": "lobby"}})
        );
        assert_eq!(frame["sessionToken"], "r:session");

        assert_eq!(next_event(&mut sub).await, LiveEvent::Open);
        assert_eq!(sub.state(), SubscriptionState::Subscribed);
        assert_eq!(live.state(), ChannelState::Connected);
    }

    #[tokio::test]
    async fn test_events_reconcile_with_cache() {
        let (client, _backend) = setup_memory_client();
        let (live, mut server) = setup_fake_live(&client, fast_options(), 0);
        let mut sub = live.subscribe(&messages_query()).unwrap();

        let mut conn = server.accept().await;
        conn.handshake().await;
        let request_id = conn.accept_subscribe().await["requestId"].clone();
        assert_eq!(next_event(&mut sub).await, LiveEvent::Open);

        conn.push_event("create", &request_id, message("m1", "2024-01-02T00:00:00.000Z", "hi"));
        match next_event(&mut sub).await {
            LiveEvent::Create(object) => {
                assert_eq!(object.object_id(), Some("m1"));
                assert!(!object.is_dirty());
            }
            other => panic!("expected create, got {:?}", other),
        }
        assert!(client.cache().contains("Message", "m1"));

        conn.push_event("update", &request_id, message("m1", "2024-01-03T00:00:00.000Z", "edited"));
        match next_event(&mut sub).await {
            LiveEvent::Update { object, .. } => assert_eq!(text_of(&object).as_deref(), Some("edited")),
            other => panic!("expected update, got {:?}", other),
        }

        // an older record loses to the cached state
        conn.push_event("update", &request_id, message("m1", "2024-01-02T12:00:00.000Z", "stale"));
        match next_event(&mut sub).await {
            LiveEvent::Update { object, .. } => {
                assert_eq!(text_of(&object).as_deref(), Some("edited"));
                assert_eq!(
                    object.updated_at().map(|d| d.iso()),
                    Some("2024-01-03T00:00:00.000Z")
                );
            }
            other => panic!("expected update, got {:?}", other),
        }
        let cached = client.cache().get("Message", "m1").unwrap();
        assert_eq!(text_of(&cached).as_deref(), Some("edited"));

        conn.push_event("leave", &request_id, message("m1", "2024-01-04T00:00:00.000Z", "moved"));
        assert!(matches!(next_event(&mut sub).await, LiveEvent::Leave { .. }));
        assert!(client.cache().contains("Message", "m1"));

        conn.push_event("delete", &request_id, message("m1", "2024-01-05T00:00:00.000Z", "moved"));
        assert!(matches!(next_event(&mut sub).await, LiveEvent::Delete(_)));
        assert!(!client.cache().contains("Message", "m1"));
    }

    #[tokio::test]
    async fn test_full_update_drops_removed_fields() {
        let (client, _backend) = setup_memory_client();
        let (live, mut server) = setup_fake_live(&client, fast_options(), 0);
        let mut sub = live.subscribe(&messages_query()).unwrap();

        let mut conn = server.accept().await;
        conn.handshake().await;
        let request_id = conn.accept_subscribe().await["requestId"].clone();
        assert_eq!(next_event(&mut sub).await, LiveEvent::Open);

        let mut tagged = message("m7", "2024-01-02T00:00:00.000Z", "hi");
        tagged["tag"] = json!("hot");
        conn.push_event("create", &request_id, tagged);
        assert!(matches!(next_event(&mut sub).await, LiveEvent::Create(_)));

        conn.push_event("update", &request_id, message("m7", "2024-01-03T00:00:00.000Z", "hi"));
        match next_event(&mut sub).await {
            LiveEvent::Update { object, .. } => assert!(!object.has("tag")),
            other => panic!("expected update, got {:?}", other),
        }
        assert!(!client.cache().get("Message", "m7").unwrap().has("tag"));
    }

    #[tokio::test]
    async fn test_projected_update_keeps_other_fields() {
        let (client, _backend) = setup_memory_client();
        let (live, mut server) = setup_fake_live(&client, fast_options(), 0);
        let mut query = messages_query();
        query.select(&["text"]);
        let mut sub = live.subscribe(&query).unwrap();

        let mut conn = server.accept().await;
        conn.handshake().await;
        let frame = conn.accept_subscribe().await;
        assert!(frame["query"]["keys"].is_array());
        let request_id = frame["requestId"].clone();
        assert_eq!(next_event(&mut sub).await, LiveEvent::Open);

        conn.push_event("create", &request_id, message("m8", "2024-01-02T00:00:00.000Z", "hi"));
        next_event(&mut sub).await;
        conn.push_event(
            "update",
            &request_id,
            json!({
                "className": "Message",
                "objectId": "m8",
                "updatedAt": "2024-01-03T00:00:00.000Z",
                "text": "edited"
            }),
        );
        match next_event(&mut sub).await {
            LiveEvent::Update { object, .. } => {
                assert_eq!(text_of(&object).as_deref(), Some("edited"));
                assert_eq!(object.get_as::<String>("room").as_deref(), Some("lobby"));
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_full_buffer_drops_only_that_subscription() {
        let (client, _backend) = setup_memory_client();
        let options = parse_live::LiveQueryOptions {
            event_channel_capacity: 2,
            ..fast_options()
        };
        let (live, mut server) = setup_fake_live(&client, options, 0);
        let mut idle = live.subscribe(&ParseQuery::new("Message")).unwrap();
        let mut active = live.subscribe(&messages_query()).unwrap();

        let mut conn = server.accept().await;
        conn.handshake().await;
        let idle_id = conn.accept_subscribe().await["requestId"].clone();
        let active_id = conn.accept_subscribe().await["requestId"].clone();
        assert_eq!(next_event(&mut active).await, LiveEvent::Open);

        for id in ["m1", "m2", "m3"] {
            conn.push_event("create", &idle_id, message(id, "2024-01-02T00:00:00.000Z", "queued"));
        }
        conn.push_event("create", &active_id, message("m9", "2024-01-02T00:00:00.000Z", "live"));

        assert_eq!(
            conn.recv_json().await,
            json!({"op": "unsubscribe", "requestId": idle_id})
        );
        match next_event(&mut active).await {
            LiveEvent::Create(object) => assert_eq!(object.object_id(), Some("m9")),
            other => panic!("expected create, got {:?}", other),
        }
        assert_eq!(live.state(), ChannelState::Connected);

        assert_eq!(idle.state(), SubscriptionState::Error);
        assert_eq!(next_event(&mut idle).await, LiveEvent::Open);
        match next_event(&mut idle).await {
            LiveEvent::Create(object) => assert_eq!(object.object_id(), Some("m1")),
            other => panic!("expected create, got {:?}", other),
        }
        assert!(idle.next().await.is_none());
    }

    #[tokio::test]
    async fn test_delete_of_uncached_object_leaves_cache_alone() {
        let (client, _backend) = setup_memory_client();
        let (live, mut server) = setup_fake_live(&client, fast_options(), 0);
        let mut sub = live.subscribe(&messages_query()).unwrap();

        let mut conn = server.accept().await;
        conn.handshake().await;
        let request_id = conn.accept_subscribe().await["requestId"].clone();
        assert_eq!(next_event(&mut sub).await, LiveEvent::Open);

        conn.push_event("delete", &request_id, message("m9", "2024-01-02T00:00:00.000Z", "gone"));
        match next_event(&mut sub).await {
            LiveEvent::Delete(object) => assert_eq!(object.object_id(), Some("m9")),
            other => panic!("expected delete, got {:?}", other),
        }
        assert!(client.cache().is_empty());
    }

    #[tokio::test]
    async fn test_enter_carries_original() {
        let (client, _backend) = setup_memory_client();
        let (live, mut server) = setup_fake_live(&client, fast_options(), 0);
        let mut sub = live.subscribe(&messages_query()).unwrap();

        let mut conn = server.accept().await;
        conn.handshake().await;
        let request_id = conn.accept_subscribe().await["requestId"].clone();
        next_event(&mut sub).await;

        conn.send_json(json!({
            "op": "enter",
            "requestId": request_id,
            "object": message("m2", "2024-01-02T00:00:00.000Z", "now here"),
            "original": {
                "className": "Message",
                "objectId": "m2",
                "updatedAt": "2024-01-01T00:00:00.000Z",
                "room": "attic"
            }
        }));
        match next_event(&mut sub).await {
            LiveEvent::Enter { object, original } => {
                assert_eq!(object.get_as::<String>("room").as_deref(), Some("lobby"));
                let original = original.expect("original missing");
                assert_eq!(original.get_as::<String>("room").as_deref(), Some("attic"));
            }
            other => panic!("expected enter, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let (client, _backend) = setup_memory_client();
        let (live, mut server) = setup_fake_live(&client, fast_options(), 0);
        let mut sub = live.subscribe(&messages_query()).unwrap();
        let mut other = live.subscribe(&ParseQuery::new("Message")).unwrap();

        let mut conn = server.accept().await;
        conn.handshake().await;
        let first = conn.accept_subscribe().await["requestId"].clone();
        let second = conn.accept_subscribe().await["requestId"].clone();
        assert_eq!(first, sub.id());
        assert_eq!(next_event(&mut sub).await, LiveEvent::Open);
        assert_eq!(next_event(&mut other).await, LiveEvent::Open);

        sub.unsubscribe();
        assert_eq!(sub.state(), SubscriptionState::Closed);
        let frame = conn.recv_json().await;
        assert_eq!(frame, json!({"op": "unsubscribe", "requestId": first}));

        conn.push_event("create", &first, message("m3", "2024-01-02T00:00:00.000Z", "late"));
        conn.push_event("create", &second, message("m4", "2024-01-02T00:00:00.000Z", "fresh"));
        match next_event(&mut other).await {
            LiveEvent::Create(object) => assert_eq!(object.object_id(), Some("m4")),
            other => panic!("expected create, got {:?}", other),
        }
        assert!(sub.next().await.is_none());
        assert!(!client.cache().contains("Message", "m3"));
    }

    #[tokio::test]
    async fn test_reconnects_and_resubscribes() {
        let (client, _backend) = setup_memory_client();
        let (live, mut server) = setup_fake_live(&client, fast_options(), 0);
        let mut events = live.events();
        let mut sub = live.subscribe(&messages_query()).unwrap();

        let mut conn = server.accept().await;
        conn.handshake().await;
        let request_id = conn.accept_subscribe().await["requestId"].clone();
        assert_eq!(next_event(&mut sub).await, LiveEvent::Open);

        conn.fail("connection reset");
        match next_event(&mut sub).await {
            LiveEvent::Error(error) => assert!(error.reconnect),
            other => panic!("expected error, got {:?}", other),
        }

        let mut conn = server.accept().await;
        conn.handshake().await;
        let frame = conn.accept_subscribe().await;
        assert_eq!(frame["requestId"], request_id);
        assert_eq!(next_event(&mut sub).await, LiveEvent::Resumed);
        assert_eq!(sub.state(), SubscriptionState::Subscribed);

        conn.push_event("create", &request_id, message("m5", "2024-01-02T00:00:00.000Z", "back"));
        assert!(matches!(next_event(&mut sub).await, LiveEvent::Create(_)));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.len(), 3, "{seen:?}");
        assert_eq!(seen[0], ClientEvent::Open);
        assert!(matches!(seen[1], ClientEvent::Error(_)));
        assert_eq!(seen[2], ClientEvent::Open);
    }

    #[tokio::test]
    async fn test_retries_refused_connections() {
        let (client, _backend) = setup_memory_client();
        let (live, mut server) = setup_fake_live(&client, fast_options(), 2);
        let mut events = live.events();
        let mut sub = live.subscribe(&messages_query()).unwrap();

        let mut conn = server.accept().await;
        conn.handshake().await;
        conn.accept_subscribe().await;

        let mut errors = 0;
        loop {
            match next_event(&mut sub).await {
                LiveEvent::Error(_) => errors += 1,
                LiveEvent::Open => break,
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(errors >= 1);

        let mut refused = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ClientEvent::Error(_)) {
                refused += 1;
            }
        }
        assert_eq!(refused, 2);
        assert_eq!(live.state(), ChannelState::Connected);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let (client, _backend) = setup_memory_client();
        let options = parse_live::LiveQueryOptions {
            max_reconnect_attempts: Some(1),
            ..fast_options()
        };
        let (live, _server) = setup_fake_live(&client, options, 10);
        let mut sub = live.subscribe(&messages_query()).unwrap();

        tokio::time::timeout(WAIT, live.wait_for_state(ChannelState::Closed))
            .await
            .expect("channel did not close")
            .unwrap();

        let mut last = None;
        while let Some(event) = sub.next().await {
            last = Some(event);
        }
        assert_eq!(last, Some(LiveEvent::Closed));
    }

    #[tokio::test]
    async fn test_server_refusing_reconnect_closes_channel() {
        let (client, _backend) = setup_memory_client();
        let (live, mut server) = setup_fake_live(&client, fast_options(), 0);
        let mut sub = live.subscribe(&messages_query()).unwrap();

        let mut conn = server.accept().await;
        conn.handshake().await;
        conn.accept_subscribe().await;
        assert_eq!(next_event(&mut sub).await, LiveEvent::Open);

        conn.send_json(json!({"op": "error", "code": 4, "error": "invalid session", "reconnect": false}));
        match next_event(&mut sub).await {
            LiveEvent::Error(error) => {
                assert_eq!(error.code, Some(4));
                assert_eq!(error.message, "invalid session");
                assert!(!error.reconnect);
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(next_event(&mut sub).await, LiveEvent::Closed);

        tokio::time::timeout(WAIT, live.wait_for_state(ChannelState::Closed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sub.state(), SubscriptionState::Closed);
    }

    #[tokio::test]
    async fn test_subscription_error_is_scoped() {
        let (client, _backend) = setup_memory_client();
        let (live, mut server) = setup_fake_live(&client, fast_options(), 0);
        let mut bad = live.subscribe(&ParseQuery::new("Secret")).unwrap();
        let mut good = live.subscribe(&messages_query()).unwrap();

        let mut conn = server.accept().await;
        conn.handshake().await;
        let bad_id = conn.recv_json().await["requestId"].clone();
        let good_id = conn.accept_subscribe().await["requestId"].clone();
        conn.send_json(json!({
            "op": "error",
            "requestId": bad_id,
            "code": 119,
            "error": "permission denied"
        }));

        match next_event(&mut bad).await {
            LiveEvent::Error(error) => assert_eq!(error.code, Some(119)),
            other => panic!("expected error, got {:?}", other),
        }
        assert!(bad.next().await.is_none());
        assert_eq!(bad.state(), SubscriptionState::Error);

        assert_eq!(next_event(&mut good).await, LiveEvent::Open);
        conn.push_event("create", &good_id, message("m6", "2024-01-02T00:00:00.000Z", "ok"));
        assert!(matches!(next_event(&mut good).await, LiveEvent::Create(_)));
        assert_eq!(live.state(), ChannelState::Connected);
    }

    #[tokio::test]
    async fn test_close_ends_every_subscription() {
        let (client, _backend) = setup_memory_client();
        let (live, mut server) = setup_fake_live(&client, fast_options(), 0);
        let mut events = live.events();
        let mut sub = live.subscribe(&messages_query()).unwrap();

        let mut conn = server.accept().await;
        conn.handshake().await;
        let request_id = conn.accept_subscribe().await["requestId"].clone();
        assert_eq!(next_event(&mut sub).await, LiveEvent::Open);

        live.close();
        assert_eq!(next_event(&mut sub).await, LiveEvent::Closed);
        assert_eq!(
            conn.recv_json().await,
            json!({"op": "unsubscribe", "requestId": request_id})
        );
        assert_eq!(live.state(), ChannelState::Closed);

        let mut closed = false;
        while let Ok(event) = events.try_recv() {
            closed |= event == ClientEvent::Close;
        }
        assert!(closed);
    }

    #[tokio::test]
    #[ignore = "needs a Parse Server with live queries enabled (see .env)"]
    async fn test_live_create_against_server() {
        let client = setup_client_with_master_key();
        let class_name = generate_unique_classname("LiveMessage");
        let live = client.live_query(&client.server_url).unwrap();
        let mut sub = live.subscribe(&ParseQuery::new(&class_name)).unwrap();
        assert_eq!(next_event(&mut sub).await, LiveEvent::Open);

        let mut object = ParseObject::new(&class_name);
        object.set("text", "hello").unwrap();
        object.save(&client).await.unwrap();

        match next_event(&mut sub).await {
            LiveEvent::Create(created) => assert_eq!(created.object_id(), object.object_id()),
            other => panic!("expected create, got {:?}", other),
        }
        object.destroy(&client).await.unwrap();
    }
}
