//! Remote access: the Dataset/Access contract served over the HTTP wire
//! protocol, plus [`RemoteDataset`] which bootstraps a dataset from a
//! remote catalog.
//!
//! Duplicate concurrent requests for the same `(field, time, block)` are
//! coalesced: the first caller performs the transfer, every other caller
//! waits on the same flight and shares its result.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::access::disk::codec_err;
use crate::access::{Access, AccessKind, IoContext};
use crate::codec::{get_codec, CodecError, CodecTag};
use crate::dataset::{Dataset, DatasetId};
use crate::error::{Error, Result};
use crate::header::DatasetHeader;
use crate::query::BlockQuery;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

type FlightKey = (String, u64, u64); // (field, time bits, first hz address)

#[derive(Clone, Debug)]
enum FlightResult {
    Data(Arc<Vec<u8>>),
    Hole,
    OutOfRange(String),
    Failed(String),
}

#[derive(Debug, Default)]
struct Flight {
    state: Mutex<Option<FlightResult>>,
    cond:  Condvar,
}

#[derive(Debug)]
pub struct RemoteAccess {
    client:       reqwest::blocking::Client,
    base_url:     String,
    dataset_name: String,
    dataset_id:   DatasetId,
    compression:  CodecTag,
    flights:      Mutex<HashMap<FlightKey, Arc<Flight>>>,
}

fn transport_err(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout
    } else {
        Error::Io(std::io::Error::other(e.to_string()))
    }
}

impl RemoteAccess {
    pub fn create(
        ctx: &Arc<IoContext>,
        base_url: &str,
        dataset_name: &str,
        dataset_id: DatasetId,
        compression: CodecTag,
        timeout: Duration,
    ) -> Result<Arc<Access>> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(transport_err)?;
        Ok(Access::new(
            ctx,
            AccessKind::Remote(RemoteAccess {
                client,
                base_url: base_url.trim_end_matches('/').to_owned(),
                dataset_name: dataset_name.to_owned(),
                dataset_id,
                compression,
                flights: Mutex::new(HashMap::new()),
            }),
        ))
    }

    fn flight_key(q: &BlockQuery) -> FlightKey {
        (q.field.name.clone(), q.time.to_bits(), q.a1)
    }

    pub(crate) fn read_sync(&self, ctx: &IoContext, q: &mut BlockQuery) -> Result<()> {
        let key = Self::flight_key(q);
        let (flight, leader) = {
            let mut flights = self.flights.lock().unwrap_or_else(|e| e.into_inner());
            match flights.get(&key) {
                Some(flight) => (Arc::clone(flight), false),
                None => {
                    let flight = Arc::new(Flight::default());
                    flights.insert(key.clone(), Arc::clone(&flight));
                    (flight, true)
                }
            }
        };

        let result = if leader {
            let shared = match self.fetch_block(ctx, q) {
                Ok(bytes) => FlightResult::Data(Arc::new(bytes)),
                Err(Error::NotFound) => FlightResult::Hole,
                Err(Error::OutOfRange(m)) => FlightResult::OutOfRange(m),
                Err(e) => FlightResult::Failed(e.to_string()),
            };
            {
                let mut state = flight.state.lock().unwrap_or_else(|e| e.into_inner());
                *state = Some(shared.clone());
                flight.cond.notify_all();
            }
            self.flights
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&key);
            shared
        } else {
            debug!(field = %key.0, block = q.a1, "coalesced onto in-flight request");
            let mut state = flight.state.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if let Some(result) = state.as_ref() {
                    break result.clone();
                }
                if q.aborted.get() {
                    return Err(Error::Aborted);
                }
                let (next, _) = flight
                    .cond
                    .wait_timeout(state, Duration::from_millis(50))
                    .unwrap_or_else(|e| e.into_inner());
                state = next;
            }
        };

        match result {
            FlightResult::Data(bytes) => {
                q.buffer = bytes.as_ref().clone();
                Ok(())
            }
            FlightResult::Hole => Err(Error::NotFound),
            FlightResult::OutOfRange(m) => Err(Error::OutOfRange(m)),
            FlightResult::Failed(m) => Err(Error::Io(std::io::Error::other(m))),
        }
    }

    /// One `readblock` round trip; returns decoded sample bytes.
    fn fetch_block(&self, ctx: &IoContext, q: &BlockQuery) -> Result<Vec<u8>> {
        let dataset = ctx.registry.get(self.dataset_id)?;
        let block = q.a1 >> dataset.header().bitsperblock;
        let time = crate::header::fmt_f64(q.time);
        let from = q.a1.to_string();
        let to = q.a2.to_string();
        let response = self
            .client
            .get(format!("{}/mod_visus", self.base_url))
            .query(&[
                ("action", "readblock"),
                ("dataset", self.dataset_name.as_str()),
                ("field", q.field.name.as_str()),
                ("time", time.as_str()),
                ("from", from.as_str()),
                ("to", to.as_str()),
                ("compression", self.compression.name()),
            ])
            .send()
            .map_err(transport_err)?;

        match response.status().as_u16() {
            200 => {}
            404 => return Err(Error::NotFound),
            416 => {
                return Err(Error::OutOfRange(format!(
                    "server rejected hz range [{}, {})",
                    q.a1, q.a2
                )))
            }
            503 => return Err(Error::Busy),
            code => {
                return Err(Error::Io(std::io::Error::other(format!(
                    "readblock returned HTTP {code}"
                ))))
            }
        }

        let wire_codec = response
            .headers()
            .get("X-Compression")
            .and_then(|v| v.to_str().ok())
            .and_then(CodecTag::from_name)
            .unwrap_or(self.compression);
        let payload = response.bytes().map_err(transport_err)?;
        ctx.counters.add_read(payload.len() as u64);

        let dims = dataset.block_samples(block).nsamples;
        get_codec(wire_codec)
            .map_err(codec_err)?
            .decode(&payload, q.field.dtype, &dims, &q.aborted)
            .map_err(codec_err)
    }

    pub(crate) fn write_sync(&self, ctx: &IoContext, q: &mut BlockQuery) -> Result<()> {
        let dataset = ctx.registry.get(self.dataset_id)?;
        let block = q.a1 >> dataset.header().bitsperblock;
        let tag = q.effective_codec();
        let dims = dataset.block_samples(block).nsamples;
        let codec = get_codec(tag).map_err(codec_err)?;
        codec.check_compatible(q.field.dtype, &dims).map_err(codec_err)?;
        let payload = codec.encode(&q.buffer, q.field.dtype, &dims).map_err(codec_err)?;
        ctx.counters.add_write(payload.len() as u64);

        let time = crate::header::fmt_f64(q.time);
        let from = q.a1.to_string();
        let to = q.a2.to_string();
        let response = self
            .client
            .post(format!("{}/mod_visus", self.base_url))
            .query(&[
                ("action", "writeblock"),
                ("dataset", self.dataset_name.as_str()),
                ("field", q.field.name.as_str()),
                ("time", time.as_str()),
                ("from", from.as_str()),
                ("to", to.as_str()),
                ("compression", tag.name()),
            ])
            .body(payload)
            .send()
            .map_err(transport_err)?;

        match response.status().as_u16() {
            200 => Ok(()),
            403 => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "server has writes disabled",
            ))),
            409 => Err(Error::Codec(CodecError::Mismatch(tag.name()))),
            416 => Err(Error::OutOfRange(format!(
                "server rejected hz range [{}, {})",
                q.a1, q.a2
            ))),
            503 => Err(Error::Busy),
            code => Err(Error::Io(std::io::Error::other(format!(
                "writeblock returned HTTP {code}"
            )))),
        }
    }
}

// ── RemoteDataset ────────────────────────────────────────────────────────────

/// A dataset whose descriptor and blocks both live behind the HTTP
/// service; exposes the same `(Dataset, Access)` pair local opens do.
#[derive(Debug)]
pub struct RemoteDataset {
    pub dataset: Arc<Dataset>,
    pub access:  Arc<Access>,
    base_url:    String,
    name:        String,
    client:      reqwest::blocking::Client,
}

impl RemoteDataset {
    /// Fetch and parse the remote descriptor, then wire a [`RemoteAccess`]
    /// to it. `base_url` is the service root, e.g. `http://host:1234`.
    pub fn open(
        ctx: &Arc<IoContext>,
        base_url: &str,
        name: &str,
        compression: CodecTag,
        timeout: Duration,
    ) -> Result<RemoteDataset> {
        let base_url = base_url.trim_end_matches('/').to_owned();
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(transport_err)?;

        let response = client
            .get(format!("{base_url}/mod_visus"))
            .query(&[("action", "readdataset"), ("dataset", name)])
            .send()
            .map_err(transport_err)?;
        if response.status().as_u16() == 404 {
            return Err(Error::OutOfRange(format!("no remote dataset named {name:?}")));
        }
        if !response.status().is_success() {
            return Err(Error::Io(std::io::Error::other(format!(
                "readdataset returned HTTP {}",
                response.status().as_u16()
            ))));
        }
        let text = response.text().map_err(transport_err)?;
        let header = DatasetHeader::parse(&text)?;
        let dataset = Dataset::open(header, None);
        ctx.registry.register(&dataset);
        let access =
            RemoteAccess::create(ctx, &base_url, name, dataset.id(), compression, timeout)?;
        Ok(RemoteDataset { dataset, access, base_url, name: name.to_owned(), client })
    }

    /// Server-side box read: one `readbox` round trip. Returns the body
    /// (samples in hz order for that resolution) plus the `X-Dims` shape.
    pub fn read_box_raw(
        &self,
        field: &str,
        time: f64,
        logic_box: &[i64],
        resolution: u32,
    ) -> Result<(Vec<u8>, Vec<u64>)> {
        let box_param = logic_box
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let time = crate::header::fmt_f64(time);
        let res = resolution.to_string();
        let response = self
            .client
            .get(format!("{}/mod_visus", self.base_url))
            .query(&[
                ("action", "readbox"),
                ("dataset", self.name.as_str()),
                ("field", field),
                ("time", time.as_str()),
                ("box", box_param.as_str()),
                ("res", res.as_str()),
            ])
            .send()
            .map_err(transport_err)?;
        match response.status().as_u16() {
            200 => {}
            416 => return Err(Error::OutOfRange("readbox out of range".into())),
            503 => return Err(Error::Busy),
            code => {
                return Err(Error::Io(std::io::Error::other(format!(
                    "readbox returned HTTP {code}"
                ))))
            }
        }
        let dims: Vec<u64> = response
            .headers()
            .get("X-Dims")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.split_whitespace().filter_map(|t| t.parse().ok()).collect())
            .unwrap_or_default();
        let body = response.bytes().map_err(transport_err)?.to_vec();
        Ok((body, dims))
    }
}
