use axum::{extract::Path, http::header, routing::get, Json, Router};
use futures_util::StreamExt;
use url::Url;

use tps::{
    feed::{EventSource, FeedEvent, ReceptorEventSource},
    receptor::{ActualLrp, LrpReader, ReceptorClient},
};

const EVENTS: &str = concat!(
    "event: desired_lrp_changed\n",
    "data: {\"desired_lrp_before\":{},\"desired_lrp_after\":{}}\n\n",
    "event: actual_lrp_changed\n",
    "data: {\"actual_lrp_before\":{\"process_guid\":\"web\",\"instance_guid\":\"i-1\",\"domain\":\"cf-apps\",\"index\":2,\"state\":\"RUNNING\"},",
    "\"actual_lrp_after\":{\"process_guid\":\"web\",\"domain\":\"cf-apps\",\"index\":2,\"state\":\"CRASHED\",",
    "\"crash_count\":1,\"crash_reason\":\"exit status 137\",\"since\":1700000000000000000}}\n\n",
);

/// Orchestrator serving one process with two instances and a short feed.
async fn fake_receptor() -> Url {
    let app = Router::new()
        .route(
            "/v1/actual_lrps/{guid}",
            get(|Path(guid): Path<String>| async move {
                let lrps: Vec<ActualLrp> = if guid == "web" {
                    (0..2)
                        .map(|index| ActualLrp {
                            process_guid: guid.clone(),
                            instance_guid: format!("i-{index}"),
                            domain: "cf-apps".to_string(),
                            index,
                            state: "RUNNING".to_string(),
                            ..Default::default()
                        })
                        .collect()
                } else {
                    Vec::new()
                };
                Json(lrps)
            }),
        )
        .route(
            "/v1/events",
            get(|| async { ([(header::CONTENT_TYPE, "text/event-stream")], EVENTS) }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });
    Url::parse(&format!("http://{addr}/")).unwrap()
}

#[tokio::test]
async fn test_reads_actual_lrps() {
    let client = ReceptorClient::new(fake_receptor().await);

    let lrps = client.actual_lrps_by_process_guid("web").await.unwrap();
    assert_eq!(lrps.len(), 2);
    assert_eq!(lrps[1].instance_guid, "i-1");

    assert!(client.actual_lrps_by_process_guid("other").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_read_failure_is_an_error() {
    let client = ReceptorClient::new(Url::parse("http://127.0.0.1:1/").unwrap());
    assert!(client.actual_lrps_by_process_guid("web").await.is_err());
}

#[tokio::test]
async fn test_event_feed_yields_crashes() {
    let source = ReceptorEventSource::new(ReceptorClient::new(fake_receptor().await));

    let events: Vec<FeedEvent> = source
        .subscribe()
        .await
        .unwrap()
        .map(|event| event.unwrap())
        .collect()
        .await;

    assert_eq!(events.len(), 2);
    assert_eq!(events[0], FeedEvent::Other("desired_lrp_changed".to_string()));
    assert!(events[0].crash().is_none());

    let crash = events[1].crash().unwrap();
    assert_eq!(crash.process_guid, "web");
    assert_eq!(crash.instance_guid, "i-1");
    assert_eq!(crash.index, 2);
    assert_eq!(crash.exit_description, "exit status 137");
    assert_eq!(crash.crash_count, 1);
    assert_eq!(crash.crash_timestamp, 1_700_000_000_000_000_000);
}
