//! Broker, worker and client talking over real TCP sockets.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::bytes::Bytes;

use ezrpc_broker::{Broker, BrokerConfig, Router};
use ezrpc_client::ClientConnection;
use ezrpc_client::commands::worker::append_suffix;
use ezrpc_protocol::{Endpoint, ErrorReply, Frames, ServiceName};
use ezrpc_worker::{HandlerError, WorkerConfig, WorkerConnection};

async fn start_broker() -> (Endpoint, Arc<Router>) {
    let broker = Broker::bind(BrokerConfig::new(Endpoint::tcp("127.0.0.1:0")))
        .await
        .unwrap();
    let endpoint = broker.local_endpoint().unwrap();
    let router = broker.router();
    tokio::spawn(async move { broker.run().await });
    (endpoint, router)
}

async fn wait_for_worker(router: &Router, service: &ServiceName) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while router.worker_count(service) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker never registered");
}

async fn echo_pong(body: Frames) -> Result<Frames, HandlerError> {
    Ok(append_suffix(body, b"-pong"))
}

async fn sleepy(body: Frames) -> Result<Frames, HandlerError> {
    tokio::time::sleep(Duration::from_secs(5)).await;
    Ok(body)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_round_trip() {
    let (endpoint, router) = start_broker().await;
    let service = ServiceName::from("echo");

    let worker = WorkerConnection::connect(WorkerConfig::new(endpoint.clone(), service.clone()))
        .await
        .unwrap();
    tokio::spawn(worker.serve(echo_pong));
    wait_for_worker(&router, &service).await;

    let client = ClientConnection::connect(&endpoint).await.unwrap();
    let reply = client
        .request(&service, vec![Bytes::from("ping")], Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(reply, vec![Bytes::from("ping-pong")]);
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_requests_share_one_connection() {
    let (endpoint, router) = start_broker().await;
    let service = ServiceName::from("echo");

    let worker = WorkerConnection::connect(WorkerConfig::new(endpoint.clone(), service.clone()))
        .await
        .unwrap();
    tokio::spawn(worker.serve(echo_pong));
    wait_for_worker(&router, &service).await;

    let client = Arc::new(ClientConnection::connect(&endpoint).await.unwrap());
    let calls: Vec<_> = (0..20)
        .map(|n| {
            let client = Arc::clone(&client);
            let service = service.clone();
            tokio::spawn(async move {
                let body = vec![Bytes::from(format!("msg-{}", n))];
                let reply = client
                    .request(&service, body, Duration::from_secs(2))
                    .await
                    .unwrap();
                (n, reply)
            })
        })
        .collect();

    for call in calls {
        let (n, reply) = call.await.unwrap();
        assert_eq!(reply, vec![Bytes::from(format!("msg-{}-pong", n))]);
    }
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_handler_times_out() {
    let (endpoint, router) = start_broker().await;
    let service = ServiceName::from("slow");

    let worker = WorkerConnection::connect(WorkerConfig::new(endpoint.clone(), service.clone()))
        .await
        .unwrap();
    tokio::spawn(worker.serve(sleepy));
    wait_for_worker(&router, &service).await;

    let client = ClientConnection::connect(&endpoint).await.unwrap();
    let started = Instant::now();
    let reply = client
        .request(&service, vec![Bytes::from("zzz")], Duration::from_millis(500))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(ErrorReply::from_frames(&reply), Some(ErrorReply::Timeout));
    assert!(elapsed >= Duration::from_millis(500), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "returned after {:?}", elapsed);
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_service_replies_no_workers() {
    let (endpoint, _router) = start_broker().await;

    let client = ClientConnection::connect(&endpoint).await.unwrap();
    let reply = client
        .request(
            &ServiceName::from("nobody"),
            vec![Bytes::from("hello")],
            Duration::from_secs(2),
        )
        .await
        .unwrap();

    assert_eq!(ErrorReply::from_frames(&reply), Some(ErrorReply::NoWorkers));
}
