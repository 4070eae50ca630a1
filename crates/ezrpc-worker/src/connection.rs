//! Worker side of the broker protocol.
//!
//! A worker announces its service with periodic heartbeats and answers every
//! REQUEST it receives with an ACK followed by a REPLY carrying the same
//! correlation id.
//!
//! Inbound requests flow from the listener through a one-slot channel to a
//! pool of `queue_length` tasks, each running one handler at a time. When
//! every task is busy the channel holds one more request and the listener
//! stops reading from the connection.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use ezrpc_protocol::{
    Connection, ConnectionReceiver, ConnectionSender, ErrorReply, Frames, Identity, Message,
    ProtocolError, RequestId, ServiceName, encode_ack, encode_heartbeat, encode_reply,
};

use crate::config::WorkerConfig;
use crate::error::{HandlerError, WorkerResult};

/// One decoded request waiting for a handler.
#[derive(Debug)]
struct WorkItem {
    request_id: RequestId,
    body: Frames,
}

/// Connection serving one service for the broker.
pub struct WorkerConnection {
    connection: Connection,
    config: WorkerConfig,
    permits: Arc<Semaphore>,
}

impl WorkerConnection {
    /// Connects to the broker named in `config`.
    pub async fn connect(config: WorkerConfig) -> WorkerResult<Self> {
        config.validate()?;
        let identity = Identity::worker(&config.service);
        let connection = Connection::connect(&config.endpoint, identity).await?;
        Self::from_connection(connection, config)
    }

    /// Wraps an established connection.
    pub fn from_connection(connection: Connection, config: WorkerConfig) -> WorkerResult<Self> {
        config.validate()?;
        let permits = Arc::new(Semaphore::new(config.queue_length));
        Ok(Self {
            connection,
            config,
            permits,
        })
    }

    /// Identity this worker announced to the broker.
    pub fn identity(&self) -> &Identity {
        self.connection.identity()
    }

    /// Handle for observing the worker while it serves.
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            permits: Arc::clone(&self.permits),
            capacity: self.config.queue_length,
        }
    }

    /// Serves requests with `handler` until the connection closes.
    ///
    /// Returns `Ok(())` when the broker closes the connection and an error
    /// for any other transport failure.
    pub async fn serve<F, Fut>(self, handler: F) -> WorkerResult<()>
    where
        F: Fn(Frames) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Frames, HandlerError>> + Send + 'static,
    {
        self.serve_until_shutdown(handler, std::future::pending())
            .await
    }

    /// Like [`WorkerConnection::serve`], also returning once `shutdown`
    /// completes.
    ///
    /// Handlers still running at that point are cancelled and their replies
    /// are not sent.
    pub async fn serve_until_shutdown<F, Fut, S>(self, handler: F, shutdown: S) -> WorkerResult<()>
    where
        F: Fn(Frames) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Frames, HandlerError>> + Send + 'static,
        S: Future<Output = ()>,
    {
        let Self {
            connection,
            config,
            permits,
        } = self;
        let (sender, mut receiver) = connection.into_split();
        let handler = Arc::new(handler);

        let (work_tx, work_rx) = mpsc::channel(1);

        let mut tasks = JoinSet::new();
        tasks.spawn(heartbeat(
            sender.clone(),
            config.service.clone(),
            config.liveliness,
        ));
        spawn_pool(
            &mut tasks,
            config.queue_length,
            work_rx,
            permits,
            &sender,
            handler,
        );

        info!(
            identity = %sender.identity(),
            service = %config.service,
            queue_length = config.queue_length,
            liveliness_ms = config.liveliness.as_millis() as u64,
            "Worker serving"
        );

        let result = tokio::select! {
            result = listen(&mut receiver, work_tx) => result,
            _ = shutdown => {
                info!(service = %config.service, "Worker shutting down");
                Ok(())
            }
        };

        sender.close();
        tasks.shutdown().await;
        result
    }
}

/// Live view of a worker's handler slots.
#[derive(Debug, Clone)]
pub struct WorkerStats {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerStats {
    /// Number of handlers currently running.
    pub fn active(&self) -> usize {
        self.capacity
            .saturating_sub(self.permits.available_permits())
    }

    /// Maximum number of handlers allowed to run at once.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

async fn heartbeat(sender: ConnectionSender, service: ServiceName, liveliness: Duration) {
    let mut ticker = tokio::time::interval(liveliness);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match sender.send(encode_heartbeat(&service)) {
            Ok(()) => trace!(service = %service, "Heartbeat sent"),
            // The broker is behind on reading; try again next tick.
            Err(ProtocolError::SendQueueFull { .. }) => {
                debug!(service = %service, "Send queue full, skipping heartbeat");
            }
            Err(e) => {
                debug!(service = %service, error = %e, "Heartbeat stopped");
                break;
            }
        }
    }
}

async fn listen(
    receiver: &mut ConnectionReceiver,
    work: mpsc::Sender<WorkItem>,
) -> WorkerResult<()> {
    loop {
        let frames = match receiver.receive().await {
            Ok(frames) => frames,
            Err(ProtocolError::ConnectionClosed) => {
                info!(identity = %receiver.identity(), "Broker connection closed");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match Message::decode(frames) {
            Ok(Message::Request {
                request_id, body, ..
            }) => {
                trace!(request_id = %request_id, frames = body.len(), "Request received");
                // Suspends while every slot is busy.
                if work.send(WorkItem { request_id, body }).await.is_err() {
                    return Ok(());
                }
            }
            Ok(other) => {
                warn!(kind = other.kind(), "Ignoring unexpected message");
            }
            Err(e) => {
                warn!(error = %e, "Discarding malformed message");
            }
        }
    }
}

/// Spawns one work loop per handler slot, all pulling from `work`.
fn spawn_pool<F, Fut>(
    tasks: &mut JoinSet<()>,
    queue_length: usize,
    work: mpsc::Receiver<WorkItem>,
    permits: Arc<Semaphore>,
    sender: &ConnectionSender,
    handler: Arc<F>,
) where
    F: Fn(Frames) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Frames, HandlerError>> + Send + 'static,
{
    let work = Arc::new(Mutex::new(work));
    for slot in 0..queue_length {
        tasks.spawn(work_loop(
            slot,
            Arc::clone(&work),
            Arc::clone(&permits),
            sender.clone(),
            Arc::clone(&handler),
        ));
    }
}

async fn work_loop<F, Fut>(
    slot: usize,
    queue: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    permits: Arc<Semaphore>,
    sender: ConnectionSender,
    handler: Arc<F>,
) where
    F: Fn(Frames) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Frames, HandlerError>> + Send + 'static,
{
    loop {
        // Only a task with no handler running takes an item.
        let next = queue.lock().await.recv().await;
        let Some(WorkItem { request_id, body }) = next else {
            break;
        };
        // One permit per loop, so this never waits; it only counts.
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };

        if sender.send_async(encode_ack(&request_id)).await.is_err() {
            break;
        }
        let reply = run_handler(handler.as_ref(), &request_id, body).await;
        drop(permit);
        if sender
            .send_async(encode_reply(&request_id, reply))
            .await
            .is_err()
        {
            break;
        }
    }

    trace!(slot, "Work loop stopped");
}

/// Spawned handler, aborted when dropped before it finishes.
struct HandlerTask<T>(JoinHandle<T>);

impl<T> Drop for HandlerTask<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn run_handler<F, Fut>(handler: &F, request_id: &RequestId, body: Frames) -> Frames
where
    F: Fn(Frames) -> Fut,
    Fut: Future<Output = Result<Frames, HandlerError>> + Send + 'static,
{
    let started = Instant::now();
    let mut task = HandlerTask(tokio::spawn(handler(body)));

    match (&mut task.0).await {
        Ok(Ok(reply)) => {
            debug!(
                request_id = %request_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Request handled"
            );
            reply
        }
        Ok(Err(e)) => {
            error!(request_id = %request_id, error = %e, "Handler failed");
            ErrorReply::HandlerError { message: e.message }.to_frames()
        }
        Err(e) => {
            let message = panic_message(e);
            error!(request_id = %request_id, error = %message, "Handler panicked");
            ErrorReply::HandlerError { message }.to_frames()
        }
    }
}

fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return "handler cancelled".to_string();
    }

    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use ezrpc_protocol::{Endpoint, encode_request};
    use tokio_util::bytes::Bytes;

    fn fake_broker(queue_length: usize, liveliness: Duration) -> (WorkerConnection, Connection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let config = WorkerConfig::new(Endpoint::default(), "echo")
            .with_queue_length(queue_length)
            .with_liveliness(liveliness);
        let worker = WorkerConnection::from_connection(
            Connection::from_stream(a, Identity::from_static(b"echo-test")),
            config,
        )
        .unwrap();
        let broker = Connection::from_stream(b, Identity::from_static(b"broker"));
        (worker, broker)
    }

    async fn next_message(broker: &mut Connection) -> Message {
        Message::decode(broker.receive().await.unwrap()).unwrap()
    }

    fn request(id: u8, body: &'static str) -> Frames {
        encode_request(
            &RequestId::new(vec![0, 0, 0, id]),
            &ServiceName::from("echo"),
            vec![Bytes::from(body)],
        )
    }

    fn id(n: u8) -> RequestId {
        RequestId::new(vec![0, 0, 0, n])
    }

    async fn echo(body: Frames) -> Result<Frames, HandlerError> {
        Ok(body)
    }

    async fn failing(_body: Frames) -> Result<Frames, HandlerError> {
        Err(HandlerError::new("boom"))
    }

    async fn exploding(_body: Frames) -> Result<Frames, HandlerError> {
        panic!("kaboom")
    }

    #[tokio::test]
    async fn heartbeat_is_sent_immediately_and_repeats() {
        let (worker, mut broker) = fake_broker(4, Duration::from_millis(50));
        tokio::spawn(worker.serve(echo));

        let heartbeat = Message::Heartbeat {
            service: ServiceName::from("echo"),
        };
        let first = tokio::time::timeout(Duration::from_millis(40), next_message(&mut broker))
            .await
            .unwrap();
        assert_eq!(first, heartbeat);
        assert_eq!(next_message(&mut broker).await, heartbeat);
    }

    #[tokio::test]
    async fn ack_precedes_reply_with_same_id() {
        let (worker, mut broker) = fake_broker(4, Duration::from_secs(60));
        tokio::spawn(worker.serve(echo));
        next_message(&mut broker).await;

        broker.send(request(1, "ping")).unwrap();

        assert_eq!(
            next_message(&mut broker).await,
            Message::Ack { request_id: id(1) }
        );
        assert_eq!(
            next_message(&mut broker).await,
            Message::Reply {
                request_id: id(1),
                body: vec![Bytes::from("ping")]
            }
        );
    }

    #[tokio::test]
    async fn non_request_messages_are_ignored() {
        let (worker, mut broker) = fake_broker(4, Duration::from_secs(60));
        tokio::spawn(worker.serve(echo));
        next_message(&mut broker).await;

        broker
            .send(encode_heartbeat(&ServiceName::from("other")))
            .unwrap();
        broker.send(vec![Bytes::from("garbage")]).unwrap();
        broker.send(request(2, "still-here")).unwrap();

        assert_eq!(
            next_message(&mut broker).await,
            Message::Ack { request_id: id(2) }
        );
        assert!(matches!(
            next_message(&mut broker).await,
            Message::Reply { request_id, .. } if request_id == id(2)
        ));
    }

    #[tokio::test]
    async fn queue_length_bounds_running_handlers() {
        let (worker, mut broker) = fake_broker(1, Duration::from_secs(60));
        let stats = worker.stats();

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handler = {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            move |body: Frames| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<Frames, HandlerError>(body)
                }
            }
        };
        tokio::spawn(worker.serve(handler));
        next_message(&mut broker).await;

        for n in 1..=3 {
            broker.send(request(n, "work")).unwrap();
        }

        // Only the first request is accepted while its handler runs.
        assert!(matches!(next_message(&mut broker).await, Message::Ack { .. }));
        assert_eq!(stats.active(), 1);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), next_message(&mut broker))
                .await
                .is_err()
        );

        let mut acked: HashMap<RequestId, bool> = HashMap::new();
        acked.insert(id(1), true);
        let mut replies = 0;
        while replies < 3 {
            match next_message(&mut broker).await {
                Message::Ack { request_id } => {
                    acked.insert(request_id, true);
                }
                Message::Reply { request_id, body } => {
                    assert_eq!(acked.get(&request_id), Some(&true), "reply before ack");
                    assert_eq!(body, vec![Bytes::from("work")]);
                    replies += 1;
                }
                other => panic!("unexpected message {:?}", other),
            }
        }

        assert_eq!(acked.len(), 3);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn busy_pool_leaves_one_item_waiting() {
        let (a, _b) = tokio::io::duplex(64 * 1024);
        let (sender, _receiver) =
            Connection::from_stream(a, Identity::from_static(b"echo-test")).into_split();
        let permits = Arc::new(Semaphore::new(1));
        let (work_tx, work_rx) = mpsc::channel(1);

        let mut tasks = JoinSet::new();
        spawn_pool(
            &mut tasks,
            1,
            work_rx,
            Arc::clone(&permits),
            &sender,
            Arc::new(|_body: Frames| std::future::pending::<Result<Frames, HandlerError>>()),
        );

        let mut accepted = 0;
        for n in 1..=4 {
            let item = WorkItem {
                request_id: id(n),
                body: Vec::new(),
            };
            let sent = tokio::time::timeout(Duration::from_millis(100), work_tx.send(item)).await;
            if sent.is_err() {
                break;
            }
            accepted += 1;
        }

        // One item is running and one waits in the channel.
        assert_eq!(accepted, 2);
        assert_eq!(permits.available_permits(), 0);
        tasks.shutdown().await;
    }

    #[tokio::test]
    async fn handler_error_becomes_error_reply() {
        let (worker, mut broker) = fake_broker(4, Duration::from_secs(60));
        tokio::spawn(worker.serve(failing));
        next_message(&mut broker).await;

        broker.send(request(7, "x")).unwrap();
        assert!(matches!(next_message(&mut broker).await, Message::Ack { .. }));

        let Message::Reply { request_id, body } = next_message(&mut broker).await else {
            panic!("expected reply");
        };
        assert_eq!(request_id, id(7));
        assert_eq!(
            ErrorReply::from_frames(&body),
            Some(ErrorReply::HandlerError {
                message: "boom".to_string()
            })
        );
    }

    #[tokio::test]
    async fn handler_panic_becomes_error_reply_and_worker_keeps_serving() {
        let (worker, mut broker) = fake_broker(1, Duration::from_secs(60));
        tokio::spawn(worker.serve(exploding));
        next_message(&mut broker).await;

        for n in [8, 9] {
            broker.send(request(n, "x")).unwrap();
            assert_eq!(
                next_message(&mut broker).await,
                Message::Ack { request_id: id(n) }
            );
            let Message::Reply { body, .. } = next_message(&mut broker).await else {
                panic!("expected reply");
            };
            assert_eq!(
                ErrorReply::from_frames(&body),
                Some(ErrorReply::HandlerError {
                    message: "kaboom".to_string()
                })
            );
        }
    }

    #[tokio::test]
    async fn serve_returns_when_broker_disconnects() {
        let (worker, broker) = fake_broker(2, Duration::from_secs(60));
        drop(broker);

        let result = tokio::time::timeout(Duration::from_secs(1), worker.serve(echo))
            .await
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn serve_until_shutdown_stops_on_signal() {
        let (worker, _broker) = fake_broker(2, Duration::from_secs(60));
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let serving = tokio::spawn(worker.serve_until_shutdown(echo, async {
            let _ = stop_rx.await;
        }));
        stop_tx.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), serving)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn shutdown_cancels_running_handlers() {
        let (worker, mut broker) = fake_broker(1, Duration::from_secs(60));
        let dropped = Arc::new(AtomicBool::new(false));
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();

        let handler = {
            let dropped = Arc::clone(&dropped);
            move |_body: Frames| {
                let flag = SetOnDrop(Arc::clone(&dropped));
                let started = started_tx.clone();
                async move {
                    let _flag = flag;
                    let _ = started.send(());
                    std::future::pending::<()>().await;
                    Ok::<Frames, HandlerError>(Vec::new())
                }
            }
        };

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let serving = tokio::spawn(worker.serve_until_shutdown(handler, async {
            let _ = stop_rx.await;
        }));
        next_message(&mut broker).await;

        broker.send(request(1, "hang")).unwrap();
        started_rx.recv().await.unwrap();
        assert!(!dropped.load(Ordering::SeqCst));

        stop_tx.send(()).unwrap();
        serving.await.unwrap().unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while !dropped.load(Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let (a, _b) = tokio::io::duplex(64);
        let result = WorkerConnection::from_connection(
            Connection::from_stream(a, Identity::from_static(b"w")),
            WorkerConfig::new(Endpoint::default(), "echo").with_queue_length(0),
        );
        assert!(matches!(result, Err(crate::WorkerError::Config(_))));
    }
}
