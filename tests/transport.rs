use std::sync::Arc;

use tracing_elastic_sink::locator::{ConnectionDescriptor, DatePattern, SystemClock, TargetLocator};
use tracing_elastic_sink::repository::{EventRepository, ShippingRepository};
use tracing_elastic_sink::transform::FieldTransform;
use tracing_elastic_sink::{HttpTransport, LogEvent, Transport, TransportError};
use wiremock::{
    matchers::{basic_auth, header, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

fn locator(server: &MockServer, extra: &str) -> TargetLocator {
    let addr = server.address();
    let cs = format!("Server={};Port={};Index=app;{}", addr.ip(), addr.port(), extra);
    let descriptor = ConnectionDescriptor::parse(&cs).unwrap();
    TargetLocator::new(&descriptor, DatePattern::default(), Arc::new(SystemClock)).unwrap()
}

fn transport() -> HttpTransport {
    HttpTransport::new(Arc::new(FieldTransform::default()))
}

fn events(n: usize) -> Vec<LogEvent> {
    (0..n)
        .map(|i| LogEvent::new("ERROR", "shop::orders", format!("event {}", i)))
        .collect()
}

#[tokio::test]
async fn single_write_requires_created() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/app/_doc"))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let target = locator(&server, "BufferSize=1").resolve();
    transport().send_one(&target, &events(1)[0]).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["message"], "event 0");
    assert_eq!(body["logger_name"], "shop::orders");
    assert!(body.get("@timestamp").is_some());
    assert!(requests[0].headers.get("authorization").is_none());
}

#[tokio::test]
async fn single_write_rejects_ok_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let target = locator(&server, "BufferSize=1").resolve();
    let err = transport().send_one(&target, &events(1)[0]).await.unwrap_err();
    assert_eq!(err.status(), Some(200));
}

#[tokio::test]
async fn bulk_write_sends_action_document_pairs() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/app/_bulk"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let target = locator(&server, "BufferSize=100").resolve();
    transport().send_bulk(&target, &events(4)).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let body = String::from_utf8(requests[0].body.clone()).unwrap();
    assert!(body.ends_with("}\n\n"));

    let lines: Vec<&str> = body.lines().collect();
    assert_eq!(lines.len(), 9);
    assert_eq!(lines[8], "");
    for pair in lines[..8].chunks(2) {
        assert_eq!(pair[0], r#"{"index":{"_index":"app"}}"#);
        let doc: serde_json::Value = serde_json::from_str(pair[1]).unwrap();
        assert!(doc.get("@timestamp").is_some());
    }
}

#[tokio::test]
async fn bulk_write_accepts_created_and_reports_body_on_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("mapper_parsing_exception"))
        .mount(&server)
        .await;

    let target = locator(&server, "BufferSize=10").resolve();
    transport().send_bulk(&target, &events(2)).await.unwrap();

    match transport().send_bulk(&target, &events(2)).await.unwrap_err() {
        TransportError::Status { status, body, url } => {
            assert_eq!(status, 400);
            assert_eq!(body, "mapper_parsing_exception");
            assert!(url.ends_with("/app/_bulk"));
        }
        other => panic!("expected status error, got {:?}", other),
    }
}

#[tokio::test]
async fn credentials_become_basic_auth_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(basic_auth("elastic", "s3cr:t"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let target = locator(&server, "User=elastic;Pwd=s3cr:t;BufferSize=1").resolve();
    transport().send_one(&target, &events(1)[0]).await.unwrap();
}

#[tokio::test]
async fn routing_is_sent_as_query_parameter() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/app/_doc"))
        .and(query_param("routing", "tenant-7"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let target = locator(&server, "Routing=tenant-7").resolve();
    transport().send_one(&target, &events(1)[0]).await.unwrap();
}

#[tokio::test]
async fn connection_failure_is_network_error() {
    let server = MockServer::start().await;
    let target = locator(&server, "BufferSize=1").resolve();
    drop(server);

    let err = transport().send_one(&target, &events(1)[0]).await.unwrap_err();
    assert!(matches!(err, TransportError::Network(_)));
}

#[tokio::test]
async fn single_mode_stops_after_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/app/_doc"))
        .respond_with(ResponseTemplate::new(201))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/app/_doc"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let repository = ShippingRepository::new(locator(&server, "BufferSize=1"), Arc::new(transport()));
    let err = repository.add(&events(3)).await.unwrap_err();
    assert_eq!(err.status(), Some(500));

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let messages: Vec<String> = requests
        .iter()
        .map(|r| {
            let doc: serde_json::Value = serde_json::from_slice(&r.body).unwrap();
            doc["message"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(messages, vec!["event 0", "event 1"]);
}
