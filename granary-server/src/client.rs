//! Typed client for the queue endpoint

use granary_core::{Error, Result};
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::protocol::{read_frame, write_frame, Request, Response};
use crate::queue::{BatchOutcome, Job, QueueStat};

/// One mutual-TLS connection to a queue endpoint.
pub struct Client {
    stream: TlsStream<TcpStream>,
}

impl Client {
    /// Dial and complete the handshake.
    pub async fn connect(addr: &str, server_name: &str, connector: TlsConnector) -> Result<Client> {
        let tcp = TcpStream::connect(addr).await?;
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| Error::Config(format!("bad server name: {e}")))?;
        let stream = connector.connect(name, tcp).await?;
        Ok(Client { stream })
    }

    async fn call(&mut self, request: Request) -> Result<Response> {
        write_frame(&mut self.stream, &request.encode()).await?;
        let body = read_frame(&mut self.stream)
            .await?
            .ok_or_else(|| Error::Io(std::io::Error::other("connection closed mid-call")))?;
        Response::decode(&body)
    }

    /// Push one job; returns the job evicted to make room, if any.
    pub async fn push(&mut self, job: Job) -> Result<Option<Job>> {
        match self.call(Request::Push(job)).await? {
            Response::Pushed { evicted } => Ok(evicted),
            other => Err(unexpected(other)),
        }
    }

    /// Push many jobs in one round trip.
    pub async fn push_batch(&mut self, jobs: Vec<Job>) -> Result<BatchOutcome> {
        match self.call(Request::PushBatch(jobs)).await? {
            Response::BatchPushed {
                pushed,
                rejected,
                conflicts,
                evicted,
            } => Ok(BatchOutcome {
                pushed,
                rejected,
                conflicts,
                evicted,
            }),
            other => Err(unexpected(other)),
        }
    }

    /// Pop the next eligible job for a placement.
    pub async fn pop(&mut self, placement: u16) -> Result<Option<Job>> {
        match self.call(Request::Pop { placement }).await? {
            Response::MaybeJob(job) => Ok(job),
            other => Err(unexpected(other)),
        }
    }

    /// Inspect the next job without dequeueing it.
    pub async fn peek(&mut self, placement: u16) -> Result<Option<Job>> {
        match self.call(Request::Peek { placement }).await? {
            Response::MaybeJob(job) => Ok(job),
            other => Err(unexpected(other)),
        }
    }

    /// Heap lengths for a placement.
    pub async fn len(&mut self, placement: u16) -> Result<(u64, u64)> {
        match self.call(Request::Len { placement }).await? {
            Response::Len { repair, retry } => Ok((repair, retry)),
            other => Err(unexpected(other)),
        }
    }

    /// Drop jobs updated strictly before the timestamp, in every
    /// placement.
    pub async fn clean(&mut self, before: u64) -> Result<u64> {
        match self.call(Request::Clean { before }).await? {
            Response::Removed(count) => Ok(count),
            other => Err(unexpected(other)),
        }
    }

    /// Drop jobs above the health threshold, in every placement.
    pub async fn trim(&mut self, health: f64) -> Result<u64> {
        match self.call(Request::Trim { health }).await? {
            Response::Removed(count) => Ok(count),
            other => Err(unexpected(other)),
        }
    }

    /// Drop jobs above the health threshold in one placement.
    pub async fn trim_placement(&mut self, placement: u16, health: f64) -> Result<u64> {
        match self.call(Request::TrimPlacement { placement, health }).await? {
            Response::Removed(count) => Ok(count),
            other => Err(unexpected(other)),
        }
    }

    /// Statistics for one placement.
    pub async fn stat(&mut self, placement: u16) -> Result<QueueStat> {
        match self.call(Request::Stat { placement }).await? {
            Response::Stat(stat) => Ok(stat),
            other => Err(unexpected(other)),
        }
    }

    /// Remove a placement's queue entirely.
    pub async fn destroy(&mut self, placement: u16) -> Result<bool> {
        match self.call(Request::Destroy { placement }).await? {
            Response::Destroyed(existed) => Ok(existed),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: Response) -> Error {
    Error::InvalidArgument(format!("unexpected response: {response:?}"))
}
