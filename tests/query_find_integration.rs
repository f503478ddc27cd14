
#[cfg(test)]
mod query_find_tests {
    use super::test_utils::shared::*;
    use parse_live::{ParseClass, ParseError, ParseObject, ParseQuery, ParseValue, Pointer};
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    struct GameScore {
        score: i64,
        player_name: String,
    }

    impl ParseClass for GameScore {
        const CLASS_NAME: &'static str = "GameScore";

        fn from_object(object: &ParseObject) -> Result<Self, ParseError> {
            Ok(GameScore {
                score: object.get_as("score").unwrap_or_default(),
                player_name: object.get_as("playerName").unwrap_or_default(),
            })
        }
    }

    #[tokio::test]
    async fn test_limit_returns_first_matches_by_id() {
        let (client, backend) = setup_memory_client();
        for id in ["a1", "a2", "a3"] {
            backend.insert("Ticket", json!({"objectId": id, "status": "open"}));
        }
        backend.insert("Ticket", json!({"objectId": "a0", "status": "closed"}));

        let mut query = ParseQuery::new("Ticket");
        query.equal_to("status", "open").unwrap().ascending("objectId").limit(2);
        let results = query.find(&client).await.expect("find failed");

        let ids: Vec<&str> = results.iter().filter_map(ParseObject::object_id).collect();
        assert_eq!(ids, vec!["a1", "a2"]);
        assert!(results.iter().all(|o| !o.is_dirty()));

        let request = backend.requests().pop().unwrap();
        assert_eq!(request.path, "classes/Ticket");
        assert_eq!(request.param("limit"), Some("2"));
        assert_eq!(request.param("where"), Some(r#"{"status":"open"}"#));
    }

    #[tokio::test]
    async fn test_default_limit_is_sent() {
        let (client, backend) = setup_memory_client();
        ParseQuery::new("Ticket").find(&client).await.unwrap();
        assert_eq!(backend.requests()[0].param("limit"), Some("100"));
    }

    #[tokio::test]
    async fn test_range_and_exclusion_filters() {
        let (client, backend) = setup_memory_client();
        for (name, score) in [("ann", 50), ("bob", 100), ("cyd", 150), ("dee", 200)] {
            backend.insert("GameScore", json!({"playerName": name, "score": score}));
        }

        let mut query = ParseQuery::new("GameScore");
        query
            .greater_than("score", 50)
            .unwrap()
            .less_than_or_equal_to("score", 200)
            .unwrap()
            .not_contained_in("playerName", ["cyd"])
            .unwrap()
            .descending("score");
        let names: Vec<String> = query
            .find(&client)
            .await
            .unwrap()
            .iter()
            .filter_map(|o| o.get_as::<String>("playerName"))
            .collect();
        assert_eq!(names, vec!["dee".to_string(), "bob".to_string()]);
    }

    #[tokio::test]
    async fn test_include_shares_nested_identity() {
        let (client, backend) = setup_memory_client();
        backend.insert("Team", json!({"objectId": "t1", "name": "Reds"}));
        for id in ["g1", "g2"] {
            backend.insert(
                "GameScore",
                json!({"objectId": id, "team": {"__type": "Pointer", "className": "Team", "objectId": "t1"}}),
            );
        }

        let mut query = ParseQuery::new("GameScore");
        query.include(&["team"]);
        let results = query.find(&client).await.unwrap();
        assert_eq!(results.len(), 2);

        let first = results[0].get("team").unwrap();
        let second = results[1].get("team").unwrap();
        let (first, second) = (first.as_object().unwrap(), second.as_object().unwrap());
        assert!(Arc::ptr_eq(first, second));
        assert_eq!(first.get_as::<String>("name").as_deref(), Some("Reds"));

        let plain = ParseQuery::new("GameScore").find(&client).await.unwrap();
        assert_eq!(
            plain[0].get("team"),
            Some(ParseValue::Pointer(Pointer::new("Team", "t1")))
        );
    }

    #[tokio::test]
    async fn test_select_projects_keys() {
        let (client, backend) = setup_memory_client();
        backend.insert("GameScore", json!({"playerName": "ann", "score": 5, "cheatMode": false}));

        let mut query = ParseQuery::new("GameScore");
        query.select(&["score"]);
        let result = query.first(&client).await.unwrap().expect("no result");
        assert_eq!(result.get_as::<i64>("score"), Some(5));
        assert!(!result.has("playerName"));
        assert!(result.object_id().is_some());
    }

    #[tokio::test]
    async fn test_count_and_first() {
        let (client, backend) = setup_memory_client();
        for score in [1, 2, 3] {
            backend.insert("GameScore", json!({"score": score}));
        }

        let mut query = ParseQuery::new("GameScore");
        query.greater_than_or_equal_to("score", 2).unwrap();
        assert_eq!(query.count(&client).await.unwrap(), 2);
        let request = backend.requests().pop().unwrap();
        assert_eq!(request.param("count"), Some("1"));
        assert_eq!(request.param("limit"), Some("0"));

        let mut none = ParseQuery::new("GameScore");
        none.greater_than("score", 10).unwrap();
        assert!(none.first(&client).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_by_id() {
        let (client, backend) = setup_memory_client();
        let id = backend.insert("GameScore", json!({"score": 7}));

        let object = ParseQuery::new("GameScore").get(&id, &client).await.unwrap();
        assert_eq!(object.object_id(), Some(id.as_str()));
        assert_eq!(object.get_as::<i64>("score"), Some(7));
        assert!(object.created_at().is_some());

        let missing = ParseQuery::new("GameScore").get("nope", &client).await;
        assert!(matches!(missing, Err(ParseError::ObjectNotFound(_))));
        assert!(matches!(
            ParseQuery::new("GameScore").get("", &client).await,
            Err(ParseError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_find_as_typed_class() {
        let (client, backend) = setup_memory_client();
        backend.insert("GameScore", json!({"objectId": "x1", "playerName": "ann", "score": 9}));

        let typed: Vec<GameScore> = ParseQuery::new("GameScore").find_as(&client).await.unwrap();
        assert_eq!(
            typed,
            vec![GameScore {
                score: 9,
                player_name: "ann".into()
            }]
        );

        client.registry().register::<GameScore>();
        let decoded = ParseQuery::new("GameScore").find_decoded(&client).await.unwrap();
        assert!(decoded[0].is_typed());
    }

    #[tokio::test]
    async fn test_or_query() {
        let (client, backend) = setup_memory_client();
        for (name, score) in [("ann", 1), ("bob", 50), ("cyd", 99)] {
            backend.insert("GameScore", json!({"playerName": name, "score": score}));
        }
        let mut low = ParseQuery::new("GameScore");
        low.less_than("score", 10).unwrap();
        let mut high = ParseQuery::new("GameScore");
        high.greater_than("score", 90).unwrap();

        let mut either = ParseQuery::or(&[low, high]).unwrap();
        either.ascending("score");
        let names: Vec<String> = either
            .find(&client)
            .await
            .unwrap()
            .iter()
            .filter_map(|o| o.get_as::<String>("playerName"))
            .collect();
        assert_eq!(names, vec!["ann".to_string(), "cyd".to_string()]);
    }

    #[tokio::test]
    async fn test_distinct_values() {
        let (client, backend) = setup_memory_client();
        for city in ["Paris", "Oslo", "Paris"] {
            backend.insert("Venue", json!({"city": city}));
        }
        let mut cities: Vec<String> = ParseQuery::new("Venue").distinct("city", &client).await.unwrap();
        cities.sort();
        assert_eq!(cities, vec!["Oslo".to_string(), "Paris".to_string()]);
        assert!(backend.requests()[0].auth.use_master_key);
    }

    #[tokio::test]
    async fn test_aggregate_sends_pipeline() {
        let (client, backend) = setup_memory_client();
        for (city, open) in [("Paris", true), ("Oslo", true), ("Rome", false)] {
            backend.insert("Venue", json!({"city": city, "open": open}));
        }

        let pipeline = vec![json!({"$match": {"open": true}}), json!({"$count": "total"})];
        let rows: Vec<serde_json::Value> = ParseQuery::new("Venue")
            .aggregate(pipeline.clone(), &client)
            .await
            .unwrap();
        assert_eq!(rows, vec![json!({"total": 2})]);

        let request = backend.requests().pop().unwrap();
        assert_eq!(request.path, "aggregate/Venue");
        assert!(request.auth.use_master_key);
        let sent: serde_json::Value = serde_json::from_str(request.param("pipeline").unwrap()).unwrap();
        assert_eq!(sent, serde_json::Value::Array(pipeline));

        let empty = ParseQuery::new("Venue")
            .aggregate::<serde_json::Value>(Vec::new(), &client)
            .await;
        assert!(matches!(empty, Err(ParseError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_server_errors_propagate() {
        let (client, backend) = setup_memory_client();
        backend.fail_next(141, "cloud code failed");
        let err = ParseQuery::new("GameScore").find(&client).await.unwrap_err();
        assert!(matches!(err, ParseError::ServerError { code: 141, .. }));
    }

    #[tokio::test]
    async fn test_unsupported_shape_fails_before_sending() {
        let (client, backend) = setup_memory_client();
        let point = parse_live::ParseGeoPoint::new(1.0, 1.0).unwrap();
        let mut query = ParseQuery::new("Place");
        query.near("a", point.clone()).unwrap().near("b", point).unwrap();
        assert!(matches!(
            query.find(&client).await,
            Err(ParseError::UnsupportedQueryShape(_))
        ));
        assert!(backend.requests().is_empty());
    }
}
