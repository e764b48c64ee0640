//! Wire protocol for the queue endpoint
//!
//! Frames are length-prefixed: `len u32 | body` (big-endian). A request
//! body is `method u8 | payload`; a response body is `status u8 | payload`
//! where status 0 is success and any other value is the error kind, with
//! the message as the remaining bytes.
//!
//! Jobs travel as schema-driven field maps: every field has an explicit
//! name and a type-specific string encoding (byte arrays hex, integers
//! base-10, floats shortest-roundtrip decimal, booleans `true`/`false`).
//! Marshal then unmarshal is identity for every supported field type.

use bytes::{Buf, BufMut, BytesMut};
use granary_core::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::queue::{BatchOutcome, Job, QueueStat};

/// Upper bound on a single frame.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Typed field-map encoding helpers.
pub mod fields {
    use granary_core::{Error, Result};

    /// A marshalled record: ordered field name/value pairs.
    pub type Fields = Vec<(String, String)>;

    /// Look a field up by name.
    pub fn get<'a>(fields: &'a Fields, key: &str) -> Option<&'a str> {
        fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Append a byte-array field, hex-encoded.
    pub fn put_bytes(fields: &mut Fields, key: &str, value: &[u8]) {
        fields.push((key.to_string(), hex::encode(value)));
    }

    /// Append an unsigned integer field, base-10.
    pub fn put_u64(fields: &mut Fields, key: &str, value: u64) {
        fields.push((key.to_string(), value.to_string()));
    }

    /// Append a float field in shortest round-trippable decimal form.
    pub fn put_f64(fields: &mut Fields, key: &str, value: f64) {
        fields.push((key.to_string(), format!("{value:?}")));
    }

    /// Append a boolean field.
    pub fn put_bool(fields: &mut Fields, key: &str, value: bool) {
        fields.push((key.to_string(), value.to_string()));
    }

    /// Append a string field.
    pub fn put_str(fields: &mut Fields, key: &str, value: &str) {
        fields.push((key.to_string(), value.to_string()));
    }

    /// Parse a fixed-width byte array field.
    pub fn parse_array<const N: usize>(key: &str, value: &str) -> Result<[u8; N]> {
        let bytes = hex::decode(value)
            .map_err(|e| Error::InvalidArgument(format!("field {key}: {e}")))?;
        bytes.as_slice().try_into().map_err(|_| {
            Error::InvalidArgument(format!(
                "field {key}: expected {N} bytes, got {}",
                bytes.len()
            ))
        })
    }

    /// Parse an unsigned integer field.
    pub fn parse_u64(key: &str, value: &str) -> Result<u64> {
        value
            .parse()
            .map_err(|e| Error::InvalidArgument(format!("field {key}: {e}")))
    }

    /// Parse a float field.
    pub fn parse_f64(key: &str, value: &str) -> Result<f64> {
        value
            .parse()
            .map_err(|e| Error::InvalidArgument(format!("field {key}: {e}")))
    }

    /// Parse a boolean field.
    pub fn parse_bool(key: &str, value: &str) -> Result<bool> {
        value
            .parse()
            .map_err(|e| Error::InvalidArgument(format!("field {key}: {e}")))
    }
}

use fields::Fields;

impl Job {
    /// Marshal into the field map form.
    pub fn to_fields(&self) -> Fields {
        let mut out = Fields::new();
        fields::put_bytes(&mut out, "stream_id", &self.stream_id);
        fields::put_u64(&mut out, "position", self.position);
        fields::put_f64(&mut out, "segment_health", self.segment_health);
        fields::put_u64(&mut out, "placement", self.placement as u64);
        fields::put_u64(&mut out, "inserted_at", self.inserted_at);
        fields::put_u64(&mut out, "updated_at", self.updated_at);
        fields::put_u64(&mut out, "last_attempted_at", self.last_attempted_at);
        out
    }

    /// Unmarshal from the field map form. Unknown fields are ignored;
    /// timestamps default to zero when absent.
    pub fn from_fields(fields: &Fields) -> Result<Job> {
        let require = |key: &str| {
            fields::get(fields, key)
                .ok_or_else(|| Error::InvalidArgument(format!("missing field {key}")))
        };
        let optional_u64 = |key: &str| -> Result<u64> {
            match fields::get(fields, key) {
                Some(value) => fields::parse_u64(key, value),
                None => Ok(0),
            }
        };
        Ok(Job {
            stream_id: fields::parse_array("stream_id", require("stream_id")?)?,
            position: fields::parse_u64("position", require("position")?)?,
            segment_health: fields::parse_f64("segment_health", require("segment_health")?)?,
            placement: fields::parse_u64("placement", require("placement")?)? as u16,
            inserted_at: optional_u64("inserted_at")?,
            updated_at: optional_u64("updated_at")?,
            last_attempted_at: optional_u64("last_attempted_at")?,
        })
    }
}

/// Encode a field map: `count u16 | (key_len u16 | key | val_len u32 |
/// val)*`.
pub fn encode_fields(fields: &Fields, buf: &mut BytesMut) {
    buf.put_u16(fields.len() as u16);
    for (key, value) in fields {
        buf.put_u16(key.len() as u16);
        buf.put_slice(key.as_bytes());
        buf.put_u32(value.len() as u32);
        buf.put_slice(value.as_bytes());
    }
}

/// Decode a field map.
pub fn decode_fields(buf: &mut &[u8]) -> Result<Fields> {
    let count = take_u16(buf)? as usize;
    let mut out = Fields::with_capacity(count);
    for _ in 0..count {
        let key_len = take_u16(buf)? as usize;
        let key = take_str(buf, key_len)?;
        let val_len = take_u32(buf)? as usize;
        let value = take_str(buf, val_len)?;
        out.push((key, value));
    }
    Ok(out)
}

/// A request to the endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Store one job in its placement's queue.
    Push(Job),
    /// Store many jobs under one lock per placement.
    PushBatch(Vec<Job>),
    /// Dequeue the highest-priority eligible job.
    Pop { placement: u16 },
    /// Inspect without dequeueing.
    Peek { placement: u16 },
    /// Heap lengths.
    Len { placement: u16 },
    /// Drop entries updated strictly before the timestamp, everywhere.
    Clean { before: u64 },
    /// Drop entries above the health threshold, everywhere.
    Trim { health: f64 },
    /// Aggregate statistics for one placement.
    Stat { placement: u16 },
    /// Drop entries above the health threshold in one placement.
    TrimPlacement { placement: u16, health: f64 },
    /// Remove a placement's queue entirely.
    Destroy { placement: u16 },
}

const METHOD_PUSH: u8 = 1;
const METHOD_PUSH_BATCH: u8 = 2;
const METHOD_POP: u8 = 3;
const METHOD_PEEK: u8 = 4;
const METHOD_LEN: u8 = 5;
const METHOD_CLEAN: u8 = 6;
const METHOD_TRIM: u8 = 7;
const METHOD_STAT: u8 = 8;
const METHOD_TRIM_PLACEMENT: u8 = 9;
const METHOD_DESTROY: u8 = 10;

impl Request {
    /// Serialize into a frame body.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        match self {
            Request::Push(job) => {
                buf.put_u8(METHOD_PUSH);
                encode_fields(&job.to_fields(), &mut buf);
            }
            Request::PushBatch(jobs) => {
                buf.put_u8(METHOD_PUSH_BATCH);
                buf.put_u32(jobs.len() as u32);
                for job in jobs {
                    encode_fields(&job.to_fields(), &mut buf);
                }
            }
            Request::Pop { placement } => {
                buf.put_u8(METHOD_POP);
                buf.put_u16(*placement);
            }
            Request::Peek { placement } => {
                buf.put_u8(METHOD_PEEK);
                buf.put_u16(*placement);
            }
            Request::Len { placement } => {
                buf.put_u8(METHOD_LEN);
                buf.put_u16(*placement);
            }
            Request::Clean { before } => {
                buf.put_u8(METHOD_CLEAN);
                buf.put_u64(*before);
            }
            Request::Trim { health } => {
                buf.put_u8(METHOD_TRIM);
                buf.put_f64(*health);
            }
            Request::Stat { placement } => {
                buf.put_u8(METHOD_STAT);
                buf.put_u16(*placement);
            }
            Request::TrimPlacement { placement, health } => {
                buf.put_u8(METHOD_TRIM_PLACEMENT);
                buf.put_u16(*placement);
                buf.put_f64(*health);
            }
            Request::Destroy { placement } => {
                buf.put_u8(METHOD_DESTROY);
                buf.put_u16(*placement);
            }
        }
        buf.to_vec()
    }

    /// Deserialize a frame body.
    pub fn decode(mut body: &[u8]) -> Result<Request> {
        let buf = &mut body;
        let method = take_u8(buf)?;
        let request = match method {
            METHOD_PUSH => Request::Push(Job::from_fields(&decode_fields(buf)?)?),
            METHOD_PUSH_BATCH => {
                let count = take_u32(buf)? as usize;
                let mut jobs = Vec::with_capacity(count.min(65_536));
                for _ in 0..count {
                    jobs.push(Job::from_fields(&decode_fields(buf)?)?);
                }
                Request::PushBatch(jobs)
            }
            METHOD_POP => Request::Pop { placement: take_u16(buf)? },
            METHOD_PEEK => Request::Peek { placement: take_u16(buf)? },
            METHOD_LEN => Request::Len { placement: take_u16(buf)? },
            METHOD_CLEAN => Request::Clean { before: take_u64(buf)? },
            METHOD_TRIM => Request::Trim { health: take_f64(buf)? },
            METHOD_STAT => Request::Stat { placement: take_u16(buf)? },
            METHOD_TRIM_PLACEMENT => Request::TrimPlacement {
                placement: take_u16(buf)?,
                health: take_f64(buf)?,
            },
            METHOD_DESTROY => Request::Destroy { placement: take_u16(buf)? },
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "unknown method {method}"
                )))
            }
        };
        if !buf.is_empty() {
            return Err(Error::InvalidArgument(
                "trailing bytes after request".to_string(),
            ));
        }
        Ok(request)
    }
}

/// A successful response from the endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Push outcome; carries the evicted job if storing displaced one.
    Pushed { evicted: Option<Job> },
    /// Batch push tallies.
    BatchPushed {
        pushed: u64,
        rejected: u64,
        conflicts: u64,
        evicted: Vec<Job>,
    },
    /// Pop/peek result.
    MaybeJob(Option<Job>),
    /// Heap lengths.
    Len { repair: u64, retry: u64 },
    /// Entries removed by clean/trim.
    Removed(u64),
    /// Queue statistics.
    Stat(QueueStat),
    /// Whether a destroyed placement existed.
    Destroyed(bool),
}

const RESP_PUSHED: u8 = 1;
const RESP_BATCH: u8 = 2;
const RESP_MAYBE_JOB: u8 = 3;
const RESP_LEN: u8 = 4;
const RESP_REMOVED: u8 = 5;
const RESP_STAT: u8 = 6;
const RESP_DESTROYED: u8 = 7;

impl Response {
    /// Serialize into a frame body with a leading success status.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(0); // status: ok
        match self {
            Response::Pushed { evicted } => {
                buf.put_u8(RESP_PUSHED);
                encode_optional_job(evicted.as_ref(), &mut buf);
            }
            Response::BatchPushed {
                pushed,
                rejected,
                conflicts,
                evicted,
            } => {
                buf.put_u8(RESP_BATCH);
                buf.put_u64(*pushed);
                buf.put_u64(*rejected);
                buf.put_u64(*conflicts);
                buf.put_u32(evicted.len() as u32);
                for job in evicted {
                    encode_fields(&job.to_fields(), &mut buf);
                }
            }
            Response::MaybeJob(job) => {
                buf.put_u8(RESP_MAYBE_JOB);
                encode_optional_job(job.as_ref(), &mut buf);
            }
            Response::Len { repair, retry } => {
                buf.put_u8(RESP_LEN);
                buf.put_u64(*repair);
                buf.put_u64(*retry);
            }
            Response::Removed(count) => {
                buf.put_u8(RESP_REMOVED);
                buf.put_u64(*count);
            }
            Response::Stat(stat) => {
                buf.put_u8(RESP_STAT);
                buf.put_u64(stat.count);
                buf.put_f64(stat.min_health);
                buf.put_f64(stat.max_health);
                buf.put_u16(stat.histogram.len() as u16);
                for (bound, count) in &stat.histogram {
                    buf.put_f64(*bound);
                    buf.put_u64(*count);
                }
            }
            Response::Destroyed(existed) => {
                buf.put_u8(RESP_DESTROYED);
                buf.put_u8(*existed as u8);
            }
        }
        buf.to_vec()
    }

    /// Serialize an error into a frame body.
    pub fn encode_error(err: &Error) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(err.kind_code());
        buf.put_slice(err.to_string().as_bytes());
        buf.to_vec()
    }

    /// Deserialize a frame body, resurfacing server-side errors with
    /// their kind.
    pub fn decode(mut body: &[u8]) -> Result<Response> {
        let buf = &mut body;
        let status = take_u8(buf)?;
        if status != 0 {
            let msg = String::from_utf8_lossy(*buf).to_string();
            return Err(Error::from_kind_code(status, msg));
        }
        let kind = take_u8(buf)?;
        let response = match kind {
            RESP_PUSHED => Response::Pushed {
                evicted: decode_optional_job(buf)?,
            },
            RESP_BATCH => {
                let pushed = take_u64(buf)?;
                let rejected = take_u64(buf)?;
                let conflicts = take_u64(buf)?;
                let count = take_u32(buf)? as usize;
                let mut evicted = Vec::with_capacity(count.min(65_536));
                for _ in 0..count {
                    evicted.push(Job::from_fields(&decode_fields(buf)?)?);
                }
                Response::BatchPushed {
                    pushed,
                    rejected,
                    conflicts,
                    evicted,
                }
            }
            RESP_MAYBE_JOB => Response::MaybeJob(decode_optional_job(buf)?),
            RESP_LEN => Response::Len {
                repair: take_u64(buf)?,
                retry: take_u64(buf)?,
            },
            RESP_REMOVED => Response::Removed(take_u64(buf)?),
            RESP_STAT => {
                let count = take_u64(buf)?;
                let min_health = take_f64(buf)?;
                let max_health = take_f64(buf)?;
                let buckets = take_u16(buf)? as usize;
                let mut histogram = Vec::with_capacity(buckets.min(1024));
                for _ in 0..buckets {
                    let bound = take_f64(buf)?;
                    let bucket_count = take_u64(buf)?;
                    histogram.push((bound, bucket_count));
                }
                Response::Stat(QueueStat {
                    count,
                    min_health,
                    max_health,
                    histogram,
                })
            }
            RESP_DESTROYED => Response::Destroyed(take_u8(buf)? != 0),
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "unknown response kind {kind}"
                )))
            }
        };
        Ok(response)
    }
}

impl From<BatchOutcome> for Response {
    fn from(outcome: BatchOutcome) -> Response {
        Response::BatchPushed {
            pushed: outcome.pushed,
            rejected: outcome.rejected,
            conflicts: outcome.conflicts,
            evicted: outcome.evicted,
        }
    }
}

fn encode_optional_job(job: Option<&Job>, buf: &mut BytesMut) {
    match job {
        Some(job) => {
            buf.put_u8(1);
            encode_fields(&job.to_fields(), buf);
        }
        None => buf.put_u8(0),
    }
}

fn decode_optional_job(buf: &mut &[u8]) -> Result<Option<Job>> {
    if take_u8(buf)? == 0 {
        return Ok(None);
    }
    Ok(Some(Job::from_fields(&decode_fields(buf)?)?))
}

/// Write one length-prefixed frame.
pub async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, body: &[u8]) -> Result<()> {
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(Error::InvalidArgument(format!(
            "frame of {} bytes exceeds limit",
            body.len()
        )));
    }
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame; `None` on clean EOF before the length.
pub async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(Error::InvalidArgument(format!(
            "frame of {len} bytes exceeds limit"
        )));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Some(body))
}

fn take_u8(buf: &mut &[u8]) -> Result<u8> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn take_u16(buf: &mut &[u8]) -> Result<u16> {
    need(buf, 2)?;
    Ok(buf.get_u16())
}

fn take_u32(buf: &mut &[u8]) -> Result<u32> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

fn take_u64(buf: &mut &[u8]) -> Result<u64> {
    need(buf, 8)?;
    Ok(buf.get_u64())
}

fn take_f64(buf: &mut &[u8]) -> Result<f64> {
    need(buf, 8)?;
    Ok(buf.get_f64())
}

fn take_str(buf: &mut &[u8], len: usize) -> Result<String> {
    need(buf, len)?;
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|e| Error::InvalidArgument(format!("invalid utf-8: {e}")))
}

fn need(buf: &mut &[u8], n: usize) -> Result<()> {
    if buf.len() < n {
        return Err(Error::InvalidArgument("short message".to_string()));
    }
    Ok(())
}
