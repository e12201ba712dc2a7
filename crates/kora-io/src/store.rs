use crate::credential::BearerToken;
use crate::protocol::{
    CatalogEntry, IngestAck, IngestRecord, IDEMPOTENCY_HEADER, LOGS_PATH, TAGS_PATH,
};
use reqwest::blocking::{Client, Response};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

const MAX_ERROR_BODY: usize = 256;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid backend response: {0}")]
    Decode(String),
}

impl StoreError {
    /// Network failures, timeouts, 5xx and 429 are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            Self::Decode(_) => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Timeout => "timeout",
            Self::Status { .. } => "status",
            Self::Decode(_) => "decode",
        }
    }
}

/// Persistent storage for readings, reached over the network in production.
pub trait RemoteStore: Send + Sync {
    fn fetch_catalog(&self) -> Result<Vec<CatalogEntry>, StoreError>;

    fn ingest(&self, record: &IngestRecord, idempotency_key: &str) -> Result<IngestAck, StoreError>;
}

impl<S: RemoteStore + ?Sized> RemoteStore for Box<S> {
    fn fetch_catalog(&self) -> Result<Vec<CatalogEntry>, StoreError> {
        (**self).fetch_catalog()
    }

    fn ingest(
        &self,
        record: &IngestRecord,
        idempotency_key: &str,
    ) -> Result<IngestAck, StoreError> {
        (**self).ingest(record, idempotency_key)
    }
}

impl<S: RemoteStore + ?Sized> RemoteStore for Arc<S> {
    fn fetch_catalog(&self) -> Result<Vec<CatalogEntry>, StoreError> {
        (**self).fetch_catalog()
    }

    fn ingest(
        &self,
        record: &IngestRecord,
        idempotency_key: &str,
    ) -> Result<IngestAck, StoreError> {
        (**self).ingest(record, idempotency_key)
    }
}

/// Backend REST API over blocking HTTP.
#[derive(Debug)]
pub struct HttpRemoteStore {
    client: Client,
    base_url: String,
    token: BearerToken,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, token: BearerToken, timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("kora-engine/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn map_transport(e: reqwest::Error) -> StoreError {
    if e.is_timeout() {
        StoreError::Timeout
    } else if e.is_decode() {
        StoreError::Decode(e.to_string())
    } else {
        StoreError::Transport(e.to_string())
    }
}

fn check_status(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut body = response.text().unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Err(StoreError::Status {
        status: status.as_u16(),
        body,
    })
}

impl RemoteStore for HttpRemoteStore {
    fn fetch_catalog(&self) -> Result<Vec<CatalogEntry>, StoreError> {
        let response = self
            .client
            .get(self.url(TAGS_PATH))
            .bearer_auth(self.token.as_str())
            .send()
            .map_err(map_transport)?;
        check_status(response)?
            .json::<Vec<CatalogEntry>>()
            .map_err(|e| StoreError::Decode(e.to_string()))
    }

    fn ingest(
        &self,
        record: &IngestRecord,
        idempotency_key: &str,
    ) -> Result<IngestAck, StoreError> {
        let response = self
            .client
            .post(self.url(LOGS_PATH))
            .bearer_auth(self.token.as_str())
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .json(record)
            .send()
            .map_err(map_transport)?;
        let body = check_status(response)?.text().map_err(map_transport)?;
        // Any 2xx is an acknowledgement; the body is informational.
        Ok(serde_json::from_str(&body).unwrap_or_default())
    }
}

/// Where an injected ingest failure happens relative to the write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePoint {
    /// Nothing is stored.
    BeforeWrite,
    /// The record is stored but the acknowledgement is lost.
    AfterWrite,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: i64,
    pub record: IngestRecord,
    pub idempotency_key: String,
}

/// Records kept by a [`MemoryStore`] unless configured otherwise.
pub const DEFAULT_RETAINED_RECORDS: usize = 1000;

#[derive(Debug)]
struct MemoryInner {
    catalog: Vec<CatalogEntry>,
    records: VecDeque<StoredRecord>,
    by_key: HashMap<String, i64>,
    retention: usize,
    next_id: i64,
    evicted: u64,
    ingest_failures: VecDeque<(FailurePoint, StoreError)>,
    catalog_failures: VecDeque<StoreError>,
    ingest_calls: u64,
    catalog_calls: u64,
}

impl Default for MemoryInner {
    fn default() -> Self {
        Self {
            catalog: Vec::new(),
            records: VecDeque::new(),
            by_key: HashMap::new(),
            retention: DEFAULT_RETAINED_RECORDS,
            next_id: 1,
            evicted: 0,
            ingest_failures: VecDeque::new(),
            catalog_failures: VecDeque::new(),
            ingest_calls: 0,
            catalog_calls: 0,
        }
    }
}

/// In-process store that deduplicates by idempotency key. Cloning shares
/// the same storage.
///
/// Only the most recent `retention` records are kept; evicting a record
/// also forgets its key, so the dedup window matches what is retained.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `retention` records (minimum 1).
    pub fn with_retention(self, retention: usize) -> Self {
        {
            let mut inner = self.lock();
            inner.retention = retention.max(1);
            inner.evict_overflow();
        }
        self
    }

    pub fn with_catalog(catalog: Vec<CatalogEntry>) -> Self {
        let store = Self::new();
        store.set_catalog(catalog);
        store
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_catalog(&self, catalog: Vec<CatalogEntry>) {
        self.lock().catalog = catalog;
    }

    /// Fail the next ingest call with `error`.
    pub fn fail_ingest(&self, point: FailurePoint, error: StoreError) {
        self.lock().ingest_failures.push_back((point, error));
    }

    /// Fail the next catalog fetch with `error`.
    pub fn fail_catalog(&self, error: StoreError) {
        self.lock().catalog_failures.push_back(error);
    }

    /// Retained records, oldest first.
    pub fn records(&self) -> Vec<StoredRecord> {
        self.lock().records.iter().cloned().collect()
    }

    /// Records dropped to stay within the retention limit.
    pub fn evicted(&self) -> u64 {
        self.lock().evicted
    }

    pub fn ingest_calls(&self) -> u64 {
        self.lock().ingest_calls
    }

    pub fn catalog_calls(&self) -> u64 {
        self.lock().catalog_calls
    }
}

impl MemoryInner {
    fn evict_overflow(&mut self) {
        while self.records.len() > self.retention {
            if let Some(oldest) = self.records.pop_front() {
                self.by_key.remove(&oldest.idempotency_key);
                self.evicted += 1;
            }
        }
    }
}

impl RemoteStore for MemoryStore {
    fn fetch_catalog(&self) -> Result<Vec<CatalogEntry>, StoreError> {
        let mut inner = self.lock();
        inner.catalog_calls += 1;
        if let Some(error) = inner.catalog_failures.pop_front() {
            return Err(error);
        }
        Ok(inner.catalog.clone())
    }

    fn ingest(
        &self,
        record: &IngestRecord,
        idempotency_key: &str,
    ) -> Result<IngestAck, StoreError> {
        let mut inner = self.lock();
        inner.ingest_calls += 1;
        let failure = inner.ingest_failures.pop_front();
        if let Some((FailurePoint::BeforeWrite, error)) = failure {
            return Err(error);
        }

        let id = match inner.by_key.get(idempotency_key) {
            Some(&id) => id,
            None => {
                let id = inner.next_id;
                inner.next_id += 1;
                inner.records.push_back(StoredRecord {
                    id,
                    record: record.clone(),
                    idempotency_key: idempotency_key.to_string(),
                });
                inner.by_key.insert(idempotency_key.to_string(), id);
                inner.evict_overflow();
                id
            }
        };

        match failure {
            Some((_, error)) => Err(error),
            None => Ok(IngestAck { id: Some(id) }),
        }
    }
}
