//! Message routing between clients and workers.
//!
//! The router tracks every connected peer by identity, the workers serving
//! each service, and which client is waiting on each request a worker holds.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use ezrpc_protocol::{
    ConnectionSender, ErrorReply, Frames, Identity, Message, ProtocolError, ProtocolResult,
    RequestId, ServiceName, encode_reply,
};

#[derive(Debug)]
struct WorkerEntry {
    identity: Identity,
    last_seen: Instant,
}

#[derive(Default)]
struct RouterState {
    peers: HashMap<Identity, ConnectionSender>,
    /// Workers per service, in round-robin order.
    services: HashMap<ServiceName, VecDeque<WorkerEntry>>,
    /// `(worker, request id)` to the client awaiting the reply.
    routes: HashMap<(Identity, RequestId), Identity>,
}

impl RouterState {
    fn try_forward(&self, to: &Identity, frames: Frames) -> ProtocolResult<()> {
        self.peers
            .get(to)
            .ok_or(ProtocolError::ConnectionClosed)?
            .send(frames)
    }

    fn forward(&self, to: &Identity, frames: Frames) {
        if let Err(e) = self.try_forward(to, frames) {
            debug!(peer = %to, error = %e, "Dropping message");
        }
    }

    fn prune_service(&mut self, service: &ServiceName, expiry: Duration) -> usize {
        let Some(workers) = self.services.get_mut(service) else {
            return 0;
        };

        let before = workers.len();
        workers.retain(|worker| {
            let alive = worker.last_seen.elapsed() <= expiry;
            if !alive {
                info!(service = %service, worker = %worker.identity, "Worker expired");
            }
            alive
        });
        let pruned = before - workers.len();

        if workers.is_empty() {
            self.services.remove(service);
        }
        pruned
    }

    /// Picks the next live worker for `service` and rotates it to the back.
    fn next_worker(&mut self, service: &ServiceName, expiry: Duration) -> Option<Identity> {
        self.prune_service(service, expiry);
        let workers = self.services.get_mut(service)?;
        let worker = workers.pop_front()?;
        let identity = worker.identity.clone();
        workers.push_back(worker);
        Some(identity)
    }
}

/// Routing table shared by all peer tasks of a broker.
pub struct Router {
    state: Mutex<RouterState>,
    worker_expiry: Duration,
}

impl Router {
    /// Creates a router that forgets workers silent for longer than
    /// `worker_expiry`.
    pub fn new(worker_expiry: Duration) -> Self {
        Self {
            state: Mutex::new(RouterState::default()),
            worker_expiry,
        }
    }

    fn state(&self) -> MutexGuard<'_, RouterState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a connected peer under its identity.
    ///
    /// Returns false if another live peer already uses the identity.
    pub fn register_peer(&self, sender: ConnectionSender) -> bool {
        let mut state = self.state();
        let identity = sender.identity().clone();

        if let Some(existing) = state.peers.get(&identity)
            && !existing.is_closed()
        {
            warn!(peer = %identity, "Rejecting peer with duplicate identity");
            return false;
        }

        debug!(peer = %identity, "Peer registered");
        state.peers.insert(identity, sender);
        true
    }

    /// Forgets a disconnected peer, its worker registrations and every route
    /// it takes part in.
    pub fn remove_peer(&self, identity: &Identity) {
        let mut state = self.state();
        state.peers.remove(identity);

        state.services.retain(|service, workers| {
            workers.retain(|worker| {
                let keep = &worker.identity != identity;
                if !keep {
                    info!(service = %service, worker = %identity, "Worker disconnected");
                }
                keep
            });
            !workers.is_empty()
        });

        let before = state.routes.len();
        state
            .routes
            .retain(|(worker, _), client| worker != identity && *client != *identity);
        let dropped = before - state.routes.len();
        if dropped > 0 {
            debug!(peer = %identity, routes = dropped, "Dropped routes of disconnected peer");
        }

        debug!(peer = %identity, "Peer removed");
    }

    /// Handles one message received from `from`.
    pub fn handle(&self, from: &Identity, frames: Frames) {
        let message = match Message::decode(frames.clone()) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %from, error = %e, "Discarding malformed message");
                return;
            }
        };

        match message {
            Message::Heartbeat { service } => self.heartbeat(from, service),
            Message::Request {
                request_id,
                service,
                ..
            } => self.request(from, request_id, service, frames),
            Message::Ack { request_id } => self.ack(from, request_id, frames),
            Message::Reply { request_id, .. } => self.reply(from, request_id, frames),
        }
    }

    fn heartbeat(&self, worker: &Identity, service: ServiceName) {
        let mut state = self.state();
        let workers = state.services.entry(service.clone()).or_default();

        match workers.iter_mut().find(|entry| &entry.identity == worker) {
            Some(entry) => {
                entry.last_seen = Instant::now();
                trace!(service = %service, worker = %worker, "Heartbeat");
            }
            None => {
                workers.push_back(WorkerEntry {
                    identity: worker.clone(),
                    last_seen: Instant::now(),
                });
                info!(service = %service, worker = %worker, "Worker registered");
            }
        }
    }

    /// Forwards a request to the first live worker, in round-robin order,
    /// whose send queue has room.
    fn request(&self, client: &Identity, request_id: RequestId, service: ServiceName, frames: Frames) {
        let mut state = self.state();
        state.prune_service(&service, self.worker_expiry);
        let candidates = state.services.get(&service).map_or(0, VecDeque::len);

        let mut busy = false;
        for _ in 0..candidates {
            let Some(worker) = state.next_worker(&service, self.worker_expiry) else {
                break;
            };
            match state.try_forward(&worker, frames.clone()) {
                Ok(()) => {
                    trace!(
                        client = %client,
                        worker = %worker,
                        request_id = %request_id,
                        service = %service,
                        "Routed request"
                    );
                    let previous = state
                        .routes
                        .insert((worker.clone(), request_id.clone()), client.clone());
                    if let Some(previous) = previous
                        && &previous != client
                    {
                        warn!(
                            request_id = %request_id,
                            worker = %worker,
                            "Request id reused while in flight; earlier client loses its reply"
                        );
                    }
                    return;
                }
                Err(ProtocolError::SendQueueFull { capacity }) => {
                    debug!(worker = %worker, capacity, "Worker send queue full, trying next");
                    busy = true;
                }
                Err(e) => {
                    debug!(worker = %worker, error = %e, "Worker unreachable, trying next");
                }
            }
        }

        let error = if busy {
            ErrorReply::Busy
        } else {
            ErrorReply::NoWorkers
        };
        debug!(
            client = %client,
            request_id = %request_id,
            service = %service,
            reply = %error,
            "Request not routed"
        );
        state.forward(client, encode_reply(&request_id, error.to_frames()));
    }

    fn ack(&self, worker: &Identity, request_id: RequestId, frames: Frames) {
        let state = self.state();
        match state.routes.get(&(worker.clone(), request_id.clone())) {
            Some(client) => state.forward(client, frames),
            None => debug!(worker = %worker, request_id = %request_id, "Ack without route"),
        }
    }

    fn reply(&self, worker: &Identity, request_id: RequestId, frames: Frames) {
        let mut state = self.state();
        match state.routes.remove(&(worker.clone(), request_id.clone())) {
            Some(client) => state.forward(&client, frames),
            None => warn!(worker = %worker, request_id = %request_id, "Reply without route"),
        }
    }

    /// Drops workers whose heartbeat is older than the expiry.
    ///
    /// Returns how many workers were dropped.
    pub fn prune_expired(&self) -> usize {
        let mut state = self.state();
        let services: Vec<ServiceName> = state.services.keys().cloned().collect();
        services
            .iter()
            .map(|service| state.prune_service(service, self.worker_expiry))
            .sum()
    }

    /// Number of live workers serving `service`.
    pub fn worker_count(&self, service: &ServiceName) -> usize {
        let state = self.state();
        state.services.get(service).map_or(0, |workers| {
            workers
                .iter()
                .filter(|worker| worker.last_seen.elapsed() <= self.worker_expiry)
                .count()
        })
    }

    /// Number of connected peers.
    pub fn peer_count(&self) -> usize {
        self.state().peers.len()
    }

    /// Number of requests held by workers and not yet answered.
    pub fn route_count(&self) -> usize {
        self.state().routes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ezrpc_protocol::{Connection, encode_ack, encode_heartbeat, encode_request};
    use tokio_util::bytes::Bytes;

    const EXPIRY: Duration = Duration::from_secs(3);

    /// A registered peer plus the far end of its connection, where the
    /// router's forwarded messages arrive.
    struct Peer {
        identity: Identity,
        inbox: Connection,
    }

    impl Peer {
        async fn next(&mut self) -> Message {
            Message::decode(self.inbox.receive().await.unwrap()).unwrap()
        }
    }

    fn peer(router: &Router, name: &'static [u8]) -> Peer {
        peer_with_queue(router, name, 64 * 1024, 64)
    }

    /// Peer whose far end only drains when read; `buffer` bytes fit in
    /// transit and `queue` messages wait in the broker-side send queue.
    fn peer_with_queue(router: &Router, name: &'static [u8], buffer: usize, queue: usize) -> Peer {
        let (a, b) = tokio::io::duplex(buffer);
        let identity = Identity::from_static(name);
        let (sender, _receiver) =
            Connection::from_stream_with_capacity(a, identity.clone(), queue).into_split();
        assert!(router.register_peer(sender));
        Peer {
            identity,
            inbox: Connection::from_stream(b, Identity::from_static(b"far-end")),
        }
    }

    fn echo() -> ServiceName {
        ServiceName::from("echo")
    }

    fn id(n: u8) -> RequestId {
        RequestId::new(vec![0, 0, 0, n])
    }

    fn request(n: u8) -> Frames {
        encode_request(&id(n), &echo(), vec![Bytes::from("ping")])
    }

    #[tokio::test]
    async fn request_without_workers_gets_no_workers_reply() {
        let router = Router::new(EXPIRY);
        let mut client = peer(&router, b"client");

        router.handle(&client.identity, request(1));

        let Message::Reply { request_id, body } = client.next().await else {
            panic!("expected reply");
        };
        assert_eq!(request_id, id(1));
        assert_eq!(ErrorReply::from_frames(&body), Some(ErrorReply::NoWorkers));
        assert_eq!(router.route_count(), 0);
    }

    #[tokio::test]
    async fn request_is_forwarded_unchanged_and_reply_routed_back() {
        let router = Router::new(EXPIRY);
        let mut client = peer(&router, b"client");
        let mut worker = peer(&router, b"echo-1");

        router.handle(&worker.identity, encode_heartbeat(&echo()));
        assert_eq!(router.worker_count(&echo()), 1);

        router.handle(&client.identity, request(1));
        assert_eq!(worker.inbox.receive().await.unwrap(), request(1));
        assert_eq!(router.route_count(), 1);

        router.handle(&worker.identity, encode_ack(&id(1)));
        router.handle(
            &worker.identity,
            encode_reply(&id(1), vec![Bytes::from("ping-pong")]),
        );

        assert_eq!(client.next().await, Message::Ack { request_id: id(1) });
        assert_eq!(
            client.next().await,
            Message::Reply {
                request_id: id(1),
                body: vec![Bytes::from("ping-pong")]
            }
        );
        assert_eq!(router.route_count(), 0);
    }

    #[tokio::test]
    async fn workers_are_used_round_robin() {
        let router = Router::new(EXPIRY);
        let client = peer(&router, b"client");
        let mut first = peer(&router, b"echo-1");
        let mut second = peer(&router, b"echo-2");

        router.handle(&first.identity, encode_heartbeat(&echo()));
        router.handle(&second.identity, encode_heartbeat(&echo()));
        // Repeated heartbeats refresh, they do not add entries.
        router.handle(&first.identity, encode_heartbeat(&echo()));
        assert_eq!(router.worker_count(&echo()), 2);

        for n in 1..=3 {
            router.handle(&client.identity, request(n));
        }

        assert_eq!(first.next().await.request_id(), Some(&id(1)));
        assert_eq!(second.next().await.request_id(), Some(&id(2)));
        assert_eq!(first.next().await.request_id(), Some(&id(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_workers_expire() {
        let router = Router::new(EXPIRY);
        let mut client = peer(&router, b"client");
        let worker = peer(&router, b"echo-1");

        router.handle(&worker.identity, encode_heartbeat(&echo()));
        tokio::time::advance(EXPIRY + Duration::from_millis(1)).await;

        assert_eq!(router.worker_count(&echo()), 0);
        router.handle(&client.identity, request(1));
        let Message::Reply { body, .. } = client.next().await else {
            panic!("expected reply");
        };
        assert_eq!(ErrorReply::from_frames(&body), Some(ErrorReply::NoWorkers));
        assert_eq!(router.prune_expired(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn prune_expired_reports_dropped_workers() {
        let router = Router::new(EXPIRY);
        let stale = peer(&router, b"echo-1");
        let fresh = peer(&router, b"echo-2");

        router.handle(&stale.identity, encode_heartbeat(&echo()));
        tokio::time::advance(Duration::from_secs(2)).await;
        router.handle(&fresh.identity, encode_heartbeat(&echo()));
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(router.prune_expired(), 1);
        assert_eq!(router.worker_count(&echo()), 1);
    }

    #[tokio::test]
    async fn removing_worker_drops_registrations_and_routes() {
        let router = Router::new(EXPIRY);
        let mut client = peer(&router, b"client");
        let worker = peer(&router, b"echo-1");

        router.handle(&worker.identity, encode_heartbeat(&echo()));
        router.handle(&client.identity, request(1));
        assert_eq!(router.route_count(), 1);

        router.remove_peer(&worker.identity);
        assert_eq!(router.worker_count(&echo()), 0);
        assert_eq!(router.route_count(), 0);
        assert_eq!(router.peer_count(), 1);

        router.handle(&client.identity, request(2));
        let Message::Reply { body, .. } = client.next().await else {
            panic!("expected reply");
        };
        assert_eq!(ErrorReply::from_frames(&body), Some(ErrorReply::NoWorkers));
    }

    #[tokio::test]
    async fn stray_replies_and_garbage_are_dropped() {
        let router = Router::new(EXPIRY);
        let worker = peer(&router, b"echo-1");

        router.handle(&worker.identity, encode_reply(&id(9), Vec::new()));
        router.handle(&worker.identity, encode_ack(&id(9)));
        router.handle(&worker.identity, vec![Bytes::from("garbage")]);

        assert_eq!(router.route_count(), 0);
        assert_eq!(router.peer_count(), 1);
    }

    /// Sends requests to a single stalled worker until its queue refuses one.
    async fn fill_queue(router: &Router, client: &mut Peer) -> u8 {
        for n in 1..=u8::MAX {
            router.handle(&client.identity, request(n));
            let reply = tokio::time::timeout(Duration::from_millis(20), client.next()).await;
            if let Ok(Message::Reply { request_id, body }) = reply {
                assert_eq!(request_id, id(n));
                assert_eq!(ErrorReply::from_frames(&body), Some(ErrorReply::Busy));
                return n;
            }
        }
        panic!("send queue never filled");
    }

    #[tokio::test]
    async fn stalled_worker_gets_busy_reply() {
        let router = Router::new(EXPIRY);
        let mut client = peer(&router, b"client");
        // Nothing reads the worker's far end, so its queue only fills.
        let mut worker = peer_with_queue(&router, b"echo-1", 16, 2);
        router.handle(&worker.identity, encode_heartbeat(&echo()));

        let refused = fill_queue(&router, &mut client).await;
        // One message held by the writer plus two queued.
        assert_eq!(refused, 4);
        assert_eq!(router.route_count(), 3);

        // Once the worker reads again, the queued requests arrive in order.
        for n in 1..refused {
            assert_eq!(worker.inbox.receive().await.unwrap(), request(n));
        }
    }

    #[tokio::test]
    async fn full_worker_is_skipped_for_next_worker() {
        let router = Router::new(EXPIRY);
        let mut client = peer(&router, b"client");
        let stalled = peer_with_queue(&router, b"echo-1", 16, 1);
        let mut healthy = peer(&router, b"echo-2");
        router.handle(&stalled.identity, encode_heartbeat(&echo()));
        router.handle(&healthy.identity, encode_heartbeat(&echo()));

        let mut delivered = Vec::new();
        for n in 1..=6 {
            router.handle(&client.identity, request(n));
        }
        while let Ok(Ok(frames)) =
            tokio::time::timeout(Duration::from_millis(50), healthy.inbox.receive()).await
        {
            delivered.push(frames);
        }

        // The stalled worker holds at most two; the rest went to the healthy one.
        assert!(delivered.len() >= 4, "healthy worker got {}", delivered.len());
        assert_eq!(router.route_count(), 6);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), client.next())
                .await
                .is_err(),
            "no request should be refused"
        );
    }

    #[tokio::test]
    async fn duplicate_identity_is_rejected_while_live() {
        let router = Router::new(EXPIRY);
        let _first = peer(&router, b"dup");

        let (a, _b) = tokio::io::duplex(1024);
        let (sender, _receiver) =
            Connection::from_stream(a, Identity::from_static(b"dup")).into_split();
        assert!(!router.register_peer(sender));
    }
}
