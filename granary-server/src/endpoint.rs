//! The queue RPC endpoint
//!
//! Accepts mutual-TLS connections and serves length-prefixed
//! request/response frames against the queue map. Handshake failure is the
//! rejection point for unauthorized peers; application errors travel back
//! inside response frames with their kind intact.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use granary_core::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::{read_frame, write_frame, Request, Response};
use crate::queue::{BatchOutcome, Job};
use crate::queuemap::QueueMap;
use crate::tls::peer_node_id;

/// Serves queue operations over the wire.
pub struct Endpoint {
    queues: Arc<QueueMap>,
}

impl Endpoint {
    /// Create an endpoint over the given queue map.
    pub fn new(queues: Arc<QueueMap>) -> Arc<Endpoint> {
        Arc::new(Endpoint { queues })
    }

    /// Accept and serve connections until cancelled.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        acceptor: TlsAcceptor,
        token: CancellationToken,
    ) -> Result<()> {
        info!(addr = %listener.local_addr()?, "queue endpoint listening");
        loop {
            let (tcp, addr) = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };
            let endpoint = self.clone();
            let acceptor = acceptor.clone();
            let token = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = endpoint.handle(tcp, acceptor, addr) => {}
                }
            });
        }
    }

    async fn handle(self: Arc<Self>, tcp: TcpStream, acceptor: TlsAcceptor, addr: SocketAddr) {
        let mut stream = match acceptor.accept(tcp).await {
            Ok(stream) => stream,
            Err(err) => {
                // unauthorized peers fail here, at the handshake
                warn!(%addr, "rejected connection: {err}");
                return;
            }
        };

        let peer = stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| peer_node_id(certs).ok());
        match peer {
            Some(node_id) => debug!(%addr, peer = %node_id, "peer connected"),
            None => debug!(%addr, "peer connected without resolvable identity"),
        }

        loop {
            let body = match read_frame(&mut stream).await {
                Ok(Some(body)) => body,
                Ok(None) => return,
                Err(err) => {
                    debug!(%addr, "connection read failed: {err}");
                    return;
                }
            };
            let reply = match Request::decode(&body) {
                Ok(request) => match self.dispatch(request) {
                    Ok(response) => response.encode(),
                    Err(err) => Response::encode_error(&err),
                },
                Err(err) => {
                    // a frame that does not decode leaves the stream in an
                    // unknown state; answer and hang up
                    let _ = write_frame(&mut stream, &Response::encode_error(&err)).await;
                    return;
                }
            };
            if let Err(err) = write_frame(&mut stream, &reply).await {
                debug!(%addr, "connection write failed: {err}");
                return;
            }
        }
    }

    /// Apply one request against the queue map.
    pub fn dispatch(&self, request: Request) -> Result<Response> {
        match request {
            Request::Push(job) => {
                let evicted = self.queues.get(job.placement)?.push(job)?;
                Ok(Response::Pushed { evicted })
            }
            Request::PushBatch(jobs) => {
                let mut by_placement: HashMap<u16, Vec<Job>> = HashMap::new();
                for job in jobs {
                    by_placement.entry(job.placement).or_default().push(job);
                }
                let mut total = BatchOutcome::default();
                for (placement, batch) in by_placement {
                    let outcome = self.queues.get(placement)?.push_batch(batch);
                    total.pushed += outcome.pushed;
                    total.rejected += outcome.rejected;
                    total.conflicts += outcome.conflicts;
                    total.evicted.extend(outcome.evicted);
                }
                Ok(total.into())
            }
            Request::Pop { placement } => {
                Ok(Response::MaybeJob(self.queues.get(placement)?.pop()))
            }
            Request::Peek { placement } => {
                Ok(Response::MaybeJob(self.queues.get(placement)?.peek()))
            }
            Request::Len { placement } => {
                let (repair, retry) = self.queues.get(placement)?.len();
                Ok(Response::Len {
                    repair: repair as u64,
                    retry: retry as u64,
                })
            }
            Request::Clean { before } => {
                let removed: usize = self
                    .queues
                    .all()
                    .into_iter()
                    .map(|(_, queue)| queue.clean(before))
                    .sum();
                Ok(Response::Removed(removed as u64))
            }
            Request::Trim { health } => {
                let removed: usize = self
                    .queues
                    .all()
                    .into_iter()
                    .map(|(_, queue)| queue.trim(health))
                    .sum();
                Ok(Response::Removed(removed as u64))
            }
            Request::Stat { placement } => {
                Ok(Response::Stat(self.queues.get(placement)?.stat()))
            }
            Request::TrimPlacement { placement, health } => Ok(Response::Removed(
                self.queues.get(placement)?.trim(health) as u64,
            )),
            Request::Destroy { placement } => {
                Ok(Response::Destroyed(self.queues.destroy(placement)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queuemap::QueueFactory;
    use crate::queue::Queue;
    use std::time::Duration;

    fn endpoint() -> Arc<Endpoint> {
        let factory: QueueFactory = Box::new(|placement| {
            Ok(Arc::new(Queue::new(
                placement,
                Duration::from_secs(3600),
                16,
                100,
                0,
            )))
        });
        Endpoint::new(Arc::new(QueueMap::new(factory)))
    }

    fn job(stream: u8, placement: u16, health: f64) -> Job {
        Job {
            stream_id: [stream; 16],
            position: 0,
            segment_health: health,
            placement,
            inserted_at: 0,
            updated_at: 0,
            last_attempted_at: 0,
        }
    }

    #[test]
    fn test_dispatch_push_pop() {
        let endpoint = endpoint();

        let resp = endpoint.dispatch(Request::Push(job(1, 5, 0.4))).unwrap();
        assert_eq!(resp, Response::Pushed { evicted: None });

        let resp = endpoint.dispatch(Request::Pop { placement: 5 }).unwrap();
        let Response::MaybeJob(Some(popped)) = resp else {
            panic!("expected a job, got {resp:?}");
        };
        assert_eq!(popped.stream_id, [1; 16]);

        assert_eq!(
            endpoint.dispatch(Request::Pop { placement: 5 }).unwrap(),
            Response::MaybeJob(None)
        );
    }

    #[test]
    fn test_dispatch_batch_splits_placements() {
        let endpoint = endpoint();
        let resp = endpoint
            .dispatch(Request::PushBatch(vec![
                job(1, 1, 0.1),
                job(2, 2, 0.2),
                job(3, 1, 0.3),
            ]))
            .unwrap();
        let Response::BatchPushed { pushed, .. } = resp else {
            panic!("unexpected {resp:?}");
        };
        assert_eq!(pushed, 3);

        let Response::Len { repair, .. } =
            endpoint.dispatch(Request::Len { placement: 1 }).unwrap()
        else {
            panic!()
        };
        assert_eq!(repair, 2);
    }

    #[test]
    fn test_dispatch_trim_spans_all_placements() {
        let endpoint = endpoint();
        endpoint.dispatch(Request::Push(job(1, 1, 5.0))).unwrap();
        endpoint.dispatch(Request::Push(job(2, 2, 5.0))).unwrap();
        endpoint.dispatch(Request::Push(job(3, 2, 0.5))).unwrap();

        let resp = endpoint.dispatch(Request::Trim { health: 1.0 }).unwrap();
        assert_eq!(resp, Response::Removed(2));
    }

    #[test]
    fn test_dispatch_destroy() {
        let endpoint = endpoint();
        endpoint.dispatch(Request::Push(job(1, 9, 0.5))).unwrap();
        assert_eq!(
            endpoint.dispatch(Request::Destroy { placement: 9 }).unwrap(),
            Response::Destroyed(true)
        );
        assert_eq!(
            endpoint.dispatch(Request::Destroy { placement: 9 }).unwrap(),
            Response::Destroyed(false)
        );
    }
}
