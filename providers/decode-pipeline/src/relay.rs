//! Event relay publisher
//!
//! Wraps specs into canonical envelopes and publishes them per name: first
//! a durable append, then a live transmit carrying the returned nonce.
//!
//! Event ids form one hash chain per name:
//!
//! ```text
//! id_0 = sha256_hex("origin")      (empty log)
//! id_n = sha256_hex(id_{n-1})
//! ```
//!
//! The previous id is read from the log tail, so the chain survives
//! restarts. Publishing a name is serialized in-process; two processes
//! publishing the same name concurrently can fork its chain.

use crate::error::{PipelineError, Result};
use crate::event_log::EventLog;
use crate::store::ChainStore;
use crate::transmit::LiveTransmit;
use crate::types::{CallOrigin, CallSpec, EventOrigin, EventSpec};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub id: String,
    pub name: String,
    pub origin: EventOrigin,
    pub data: Map<String, Value>,
    /// Produced by historical generation rather than live decoding
    pub generated: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEnvelope {
    pub id: String,
    pub name: String,
    pub origin: CallOrigin,
    pub inputs: Map<String, Value>,
    pub outputs: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorgEnvelope {
    pub id: String,
    pub chain_id: String,
    pub block_number: i64,
    pub unix_timestamp: i64,
}

/// Next id in a name's hash chain
pub fn next_event_id(previous_id: &str) -> String {
    hex::encode(Sha256::digest(previous_id.as_bytes()))
}

/// Group by name keeping first-seen order of names and specs
fn group_by_name<T>(items: Vec<T>, name: impl Fn(&T) -> &str) -> Vec<(String, Vec<T>)> {
    let mut groups: Vec<(String, Vec<T>)> = Vec::new();
    for item in items {
        let key = name(&item).to_string();
        match groups.iter_mut().find(|(n, _)| *n == key) {
            Some((_, group)) => group.push(item),
            None => groups.push((key, vec![item])),
        }
    }
    groups
}

pub struct EventRelay {
    store: Arc<dyn ChainStore>,
    log: Arc<dyn EventLog>,
    transmit: Arc<dyn LiveTransmit>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl EventRelay {
    pub fn new(store: Arc<dyn ChainStore>, log: Arc<dyn EventLog>, transmit: Arc<dyn LiveTransmit>) -> Self {
        Self {
            store,
            log,
            transmit,
            locks: DashMap::new(),
        }
    }

    async fn batch_timestamp(&self, timestamp: Option<DateTime<Utc>>) -> DateTime<Utc> {
        if let Some(ts) = timestamp {
            return ts;
        }
        match self.store.db_now().await {
            Ok(now) => now,
            Err(e) => {
                warn!("Falling back to local clock for batch timestamp: {}", e);
                Utc::now()
            }
        }
    }

    fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks.entry(name.to_string()).or_default().clone()
    }

    /// Forget the lock of a name no other publisher holds or waits on.
    /// Keeps the map at the number of names currently being published.
    fn release_lock(&self, name: &str) {
        self.locks.remove_if(name, |_, lock| Arc::strong_count(lock) == 1);
    }

    #[cfg(test)]
    fn tracked_names(&self) -> usize {
        self.locks.len()
    }

    /// Id of the newest entry in `log_key`, or the origin seed when empty
    async fn chain_tail(&self, log_key: &str) -> Result<String> {
        match self.log.last_entries(log_key, 1).await?.into_iter().next() {
            None => Ok(stream_registry::ORIGIN_EVENT_ID.to_string()),
            Some(tail) => tail.id().ok_or_else(|| {
                error!("Refusing to reseed {} from an entry without id", log_key);
                PipelineError::BrokenChain {
                    log: log_key.to_string(),
                    nonce: tail.nonce,
                }
            }),
        }
    }

    async fn send(&self, subject: &str, payload: &[u8]) {
        if let Err(e) = self.transmit.transmit(subject, payload).await {
            warn!("Live transmit on {} failed: {}", subject, e);
        }
    }

    /// Publish event specs, chaining ids per name. Returns the published
    /// envelopes in publish order.
    #[instrument(skip(self, specs), fields(count = specs.len()))]
    pub async fn publish_events(
        &self,
        specs: Vec<EventSpec>,
        generated: bool,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventEnvelope>> {
        if specs.is_empty() {
            return Ok(Vec::new());
        }
        let timestamp = self.batch_timestamp(timestamp).await;
        let mut published = Vec::with_capacity(specs.len());

        for (name, group) in group_by_name(specs, |s| s.name.as_str()) {
            let lock = self.name_lock(&name);
            let chained = {
                let _guard = lock.lock().await;
                self.publish_chain(&name, group, generated, timestamp).await
            };
            drop(lock);
            self.release_lock(&name);
            published.extend(chained?);
            debug!("Published events for {}", name);
        }

        info!("Published {} events", published.len());
        Ok(published)
    }

    /// Extend the hash chain of `name` by one envelope per spec. Callers
    /// hold the name's lock.
    async fn publish_chain(
        &self,
        name: &str,
        specs: Vec<EventSpec>,
        generated: bool,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<EventEnvelope>> {
        let log_key = stream_registry::relay::event_log_key(name);
        let subject = stream_registry::relay::live_event_subject(name);
        let mut previous_id = self.chain_tail(&log_key).await?;
        let mut published = Vec::with_capacity(specs.len());

        for spec in specs {
            let mut envelope = EventEnvelope {
                id: next_event_id(&previous_id),
                name: name.to_string(),
                origin: spec.origin,
                data: spec.data,
                generated,
                timestamp,
                nonce: None,
            };
            let nonce = self.log.append(&log_key, &serde_json::to_string(&envelope)?).await?;
            envelope.nonce = Some(nonce);
            self.send(&subject, &serde_json::to_vec(&envelope)?).await;

            previous_id = envelope.id.clone();
            published.push(envelope);
        }
        Ok(published)
    }

    /// Publish call specs under random ids
    #[instrument(skip(self, specs), fields(count = specs.len()))]
    pub async fn publish_calls(
        &self,
        specs: Vec<CallSpec>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<Vec<CallEnvelope>> {
        if specs.is_empty() {
            return Ok(Vec::new());
        }
        let timestamp = self.batch_timestamp(timestamp).await;
        let mut published = Vec::with_capacity(specs.len());

        for (name, group) in group_by_name(specs, |s| s.name.as_str()) {
            let log_key = stream_registry::relay::call_log_key(&name);
            let subject = stream_registry::relay::live_call_subject(&name);
            for spec in group {
                let mut envelope = CallEnvelope {
                    id: uuid::Uuid::new_v4().to_string(),
                    name: name.clone(),
                    origin: spec.origin,
                    inputs: spec.inputs,
                    outputs: spec.outputs,
                    timestamp,
                    nonce: None,
                };
                let nonce = self.log.append(&log_key, &serde_json::to_string(&envelope)?).await?;
                envelope.nonce = Some(nonce);
                self.send(&subject, &serde_json::to_vec(&envelope)?).await;
                published.push(envelope);
            }
        }

        info!("Published {} calls", published.len());
        Ok(published)
    }

    /// Announce a reorg at `block_number` on the chain's reorg stream
    #[instrument(skip(self))]
    pub async fn publish_reorg(&self, id: &str, chain_id: &str, block_number: i64) -> Result<ReorgEnvelope> {
        let stream = stream_registry::relay::reorg_stream(chain_id);
        let envelope = ReorgEnvelope {
            id: id.to_string(),
            chain_id: chain_id.to_string(),
            block_number,
            unix_timestamp: self.batch_timestamp(None).await.timestamp(),
        };
        let payload = serde_json::to_string(&envelope)?;
        self.log
            .append(&stream_registry::relay::event_log_key(&stream), &payload)
            .await?;
        self.send(&stream_registry::relay::live_event_subject(&stream), payload.as_bytes())
            .await;
        info!("Published reorg of chain {} at block {}", chain_id, block_number);
        Ok(envelope)
    }
}
