//! Subscriptions to the remote build logs.
//!
//! The remote build writes its progress into a log document at
//! `logs/<serial>/<owner>/<run>`. A [`ChangeStream`] attaches a listener to such
//! a document and forwards every change as a [`Delivery`] on a channel. The
//! [`Subscriber`] keeps at most one live listener per [`SubscriptionKey`]:
//! attaching for a key that already has a listener cancels the old one first.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::{
    auth::TokenSource,
    error::SubscriptionError,
    job::{Delivery, JobContext, JobStatusEvent, SubscriptionKey},
};

// =============================================================================
// Public Interface
// =============================================================================

/// A live listener on a remote log document.
pub trait Listener: Send {
    /// Stop listening. No delivery happens once this returns.
    fn cancel(self: Box<Self>);
}

/// A push mechanism delivering the changes of remote log documents.
pub trait ChangeStream: Send + Sync {
    /// Start listening on `location`. Every change is sent to `sink` together
    /// with an unchanged copy of `context`.
    fn listen(
        &self,
        location: &str,
        context: JobContext,
        sink: Sender<Delivery>,
    ) -> Result<Box<dyn Listener>, SubscriptionError>;
}

/// Registry of the active listeners, one per subscription key.
pub struct Subscriber {
    stream: Arc<dyn ChangeStream>,
    active: Mutex<HashMap<SubscriptionKey, Box<dyn Listener>>>,
}
impl Subscriber {
    pub fn new(stream: Arc<dyn ChangeStream>) -> Self {
        Subscriber {
            stream,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a listener for `key`, cancelling any listener already registered
    /// under the same key.
    pub fn attach(
        &self,
        key: &SubscriptionKey,
        context: JobContext,
        sink: Sender<Delivery>,
    ) -> Result<(), SubscriptionError> {
        let location = key.log_location();
        // Never hold the registry while cancelling, it may wait on a request
        if let Some(stale) = self.registry().remove(key) {
            info!("Dropping previous listener for {}", location);
            stale.cancel();
        }
        info!("Listening to {}", location);
        let listener = self.stream.listen(&location, context, sink)?;
        if let Some(stale) = self.registry().insert(key.clone(), listener) {
            warn!("Concurrent listener for {} dropped", location);
            stale.cancel();
        }
        Ok(())
    }

    /// Cancel the listener registered under `key`, if any.
    pub fn cancel(&self, key: &SubscriptionKey) -> bool {
        let listener = self.registry().remove(key);
        match listener {
            Some(listener) => {
                debug!("Cancelling listener for {}", key.log_location());
                listener.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, key: &SubscriptionKey) -> bool {
        self.registry().contains_key(key)
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<SubscriptionKey, Box<dyn Listener>>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// FirestorePoller =============================================================

/// A [`ChangeStream`] over the Firestore REST API, polling the log document
/// and delivering it whenever its `updateTime` changes.
pub struct FirestorePoller {
    client: reqwest::blocking::Client,
    tokens: Arc<dyn TokenSource>,
    documents_url: String,
    interval: Duration,
}
impl FirestorePoller {
    pub fn new(project: &str, tokens: Arc<dyn TokenSource>, interval: Duration) -> Self {
        let documents_url = format!(
            "https://firestore.googleapis.com/v1/projects/{}/databases/(default)/documents",
            project
        );
        Self::with_documents_url(documents_url, tokens, interval)
    }

    /// Poll another documents root, e.g. the Firestore emulator.
    pub fn with_documents_url(
        documents_url: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
        interval: Duration,
    ) -> Self {
        FirestorePoller {
            client: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| reqwest::blocking::Client::new()),
            tokens,
            documents_url: documents_url.into().trim_end_matches('/').to_owned(),
            interval,
        }
    }
}
impl ChangeStream for FirestorePoller {
    fn listen(
        &self,
        location: &str,
        context: JobContext,
        sink: Sender<Delivery>,
    ) -> Result<Box<dyn Listener>, SubscriptionError> {
        // Fail early on credential problems rather than inside the thread.
        self.tokens.token()?;

        let stop = Arc::new(AtomicBool::new(false));
        let poll = DocumentPoll {
            client: self.client.clone(),
            tokens: self.tokens.clone(),
            url: format!("{}/{}", self.documents_url, location),
            interval: self.interval,
            stop: stop.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("log-{}", context.job_id))
            .spawn(move || poll.run(context, sink))
            .map_err(|source| SubscriptionError::Listener {
                location: location.into(),
                source,
            })?;
        Ok(Box::new(PollListener { stop, handle }))
    }
}

// =============================================================================
// Private stuff
// =============================================================================

struct PollListener {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}
impl Listener for PollListener {
    fn cancel(self: Box<Self>) {
        self.stop.store(true, Ordering::SeqCst);
        self.handle.thread().unpark();
        if self.handle.join().is_err() {
            warn!("log poller panicked");
        }
    }
}

#[derive(Debug, Deserialize)]
struct Document {
    #[serde(default)]
    fields: Map<String, Value>,
    #[serde(rename = "updateTime")]
    update_time: Option<String>,
}

struct DocumentPoll {
    client: reqwest::blocking::Client,
    tokens: Arc<dyn TokenSource>,
    url: String,
    interval: Duration,
    stop: Arc<AtomicBool>,
}
impl DocumentPoll {
    fn run(self, context: JobContext, sink: Sender<Delivery>) {
        let mut last_update: Option<String> = None;
        while !self.stop.load(Ordering::SeqCst) {
            match self.fetch() {
                Ok(Some(doc)) if doc.update_time != last_update => {
                    last_update = doc.update_time.clone();
                    let event = JobStatusEvent::from_payload(flatten_fields(doc.fields));
                    debug!("{} -> {}", self.url, event.status);
                    if self.stop.load(Ordering::SeqCst) {
                        break;
                    }
                    let delivery = Delivery {
                        context: context.clone(),
                        event,
                    };
                    if sink.send(delivery).is_err() {
                        debug!("receiver gone, stop polling {}", self.url);
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("polling {} failed: {}", self.url, e),
            }
            thread::park_timeout(self.interval);
        }
    }

    fn fetch(&self) -> Result<Option<Document>, Box<dyn std::error::Error>> {
        let token = self.tokens.token()?;
        let response = self.client.get(&self.url).bearer_auth(token).send()?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            // The build has not written its log yet.
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json::<Document>()?))
    }
}

/// Turn typed Firestore fields (`{"status": {"stringValue": "x"}}`) into a
/// plain JSON object (`{"status": "x"}`).
fn flatten_fields(fields: Map<String, Value>) -> Value {
    Value::Object(
        fields
            .into_iter()
            .map(|(name, value)| (name, flatten_value(value)))
            .collect(),
    )
}

fn flatten_value(value: Value) -> Value {
    let mut typed = match value {
        Value::Object(typed) => typed,
        other => return other,
    };
    if let Some(v) = typed.remove("integerValue") {
        return v
            .as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .map(Value::from)
            .unwrap_or(v);
    }
    if let Some(Value::Object(mut map)) = typed.remove("mapValue") {
        return match map.remove("fields") {
            Some(Value::Object(fields)) => flatten_fields(fields),
            _ => Value::Object(Map::new()),
        };
    }
    if let Some(Value::Object(mut array)) = typed.remove("arrayValue") {
        return match array.remove("values") {
            Some(Value::Array(values)) => {
                Value::Array(values.into_iter().map(flatten_value).collect())
            }
            _ => Value::Array(vec![]),
        };
    }
    for kind in &[
        "stringValue",
        "timestampValue",
        "booleanValue",
        "doubleValue",
        "referenceValue",
        "bytesValue",
    ] {
        if let Some(v) = typed.remove(*kind) {
            return v;
        }
    }
    Value::Null
}

// =============================================================================
// Unit Tests
// =============================================================================
