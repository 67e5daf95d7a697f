//! NATS job listener
//!
//! Scheduler-facing entry points. Every job subject carries a JSON body;
//! request/reply callers get the job result or `{"error": "..."}`.

use crate::config::GeneratorConfig;
use crate::coordinator::DecodeCoordinator;
use crate::cursors::{ChainInputs, CursorBuilder};
use crate::error::{PipelineError, Result};
use crate::generator::{GeneratorDeps, InputBatch, InputGenerator};
use crate::relay::{EventRelay, ReorgEnvelope};
use crate::types::{BlockRef, ContractInstance, InputSpec};

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterInstancesJob {
    pub group: String,
    pub instances: Vec<ContractInstance>,
    #[serde(default)]
    pub at_block: Option<BlockRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterInstancesReply {
    pub new_instances: Vec<ContractInstance>,
    pub published_events: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodeBlockJob {
    pub group: String,
    pub chain_id: String,
    pub block_number: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodeBlockReply {
    pub transactions: usize,
    pub traces: usize,
    pub logs: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateInputsJob {
    pub stream_id: String,
    #[serde(default)]
    pub chain_inputs: BTreeMap<String, ChainInputs>,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_contract_factory: bool,
    /// Also publish the generated inputs through the relay
    #[serde(default)]
    pub publish: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReorgJob {
    pub id: String,
    pub chain_id: String,
    pub block_number: i64,
}

/// Job handlers over the pipeline components
pub struct PipelineJobs {
    coordinator: Arc<DecodeCoordinator>,
    relay: Arc<EventRelay>,
    cursor_builder: Arc<CursorBuilder>,
    generator_deps: GeneratorDeps,
    generator_config: GeneratorConfig,
}

impl PipelineJobs {
    pub fn new(
        coordinator: Arc<DecodeCoordinator>,
        relay: Arc<EventRelay>,
        cursor_builder: Arc<CursorBuilder>,
        generator_deps: GeneratorDeps,
        generator_config: GeneratorConfig,
    ) -> Self {
        Self {
            coordinator,
            relay,
            cursor_builder,
            generator_deps,
            generator_config,
        }
    }

    /// Run the job for `subject` and encode the reply
    pub async fn handle(&self, subject: &str, payload: &[u8]) -> Vec<u8> {
        let reply = match self.dispatch(subject, payload).await {
            Ok(value) => value,
            Err(e) => {
                warn!("Job on {} failed: {}", subject, e);
                json!({ "error": e.to_string() })
            }
        };
        serde_json::to_vec(&reply).unwrap_or_default()
    }

    async fn dispatch(&self, subject: &str, payload: &[u8]) -> Result<serde_json::Value> {
        if subject == stream_registry::jobs::register_instances() {
            let job = serde_json::from_slice(payload)?;
            Ok(serde_json::to_value(self.register_instances(job).await?)?)
        } else if subject == stream_registry::jobs::decode_block() {
            let job = serde_json::from_slice(payload)?;
            Ok(serde_json::to_value(self.decode_block(job).await?)?)
        } else if subject == stream_registry::jobs::generate_inputs() {
            let job = serde_json::from_slice(payload)?;
            Ok(serde_json::to_value(self.generate_inputs(job).await?)?)
        } else if subject == stream_registry::jobs::publish_reorg() {
            let job = serde_json::from_slice(payload)?;
            Ok(serde_json::to_value(self.publish_reorg(job).await?)?)
        } else {
            Err(PipelineError::InvalidRequest(format!("Unknown job subject {}", subject)))
        }
    }

    #[instrument(skip(self, job), fields(group = %job.group))]
    pub async fn register_instances(&self, job: RegisterInstancesJob) -> Result<RegisterInstancesReply> {
        let added = self
            .coordinator
            .add_instances_to_group(&job.instances, &job.group, job.at_block)
            .await?;
        let published = self
            .relay
            .publish_events(added.new_event_specs, false, None)
            .await?;
        Ok(RegisterInstancesReply {
            new_instances: added.new_instances,
            published_events: published.len(),
        })
    }

    #[instrument(skip(self, job), fields(group = %job.group))]
    pub async fn decode_block(&self, job: DecodeBlockJob) -> Result<DecodeBlockReply> {
        let decoded = self
            .coordinator
            .decode_group_block(&job.group, &job.chain_id, job.block_number)
            .await?;
        Ok(DecodeBlockReply {
            transactions: decoded.transactions.len(),
            traces: decoded.traces.len(),
            logs: decoded.logs.len(),
        })
    }

    /// One time-boxed batch of a backfill stream. Cursors are persisted
    /// while the stream has more to generate and dropped once it caught up.
    /// With `publish`, they only advance after the batch was published.
    #[instrument(skip(self, job), fields(stream = %job.stream_id))]
    pub async fn generate_inputs(&self, job: GenerateInputsJob) -> Result<InputBatch> {
        let resumed = InputGenerator::resume(
            self.generator_deps.clone(),
            &job.stream_id,
            job.is_contract_factory,
            self.generator_config.clone(),
        )
        .await?;

        let mut generator = match resumed {
            Some(generator) => generator,
            None => {
                let cursors = self
                    .cursor_builder
                    .input_generator_queries(&job.chain_inputs, job.start_date, job.is_contract_factory)
                    .await?;
                let Some(cursors) = cursors else {
                    debug!("Nothing to generate for {}", job.stream_id);
                    return Ok(InputBatch {
                        inputs: Vec::new(),
                        next_start_date: None,
                        cursors: BTreeMap::new(),
                    });
                };
                InputGenerator::new(
                    self.generator_deps.clone(),
                    cursors,
                    job.is_contract_factory,
                    self.generator_config.clone(),
                )
            }
        };

        let batch = generator.next_batch(None).await?;
        // Stored cursors stay at the window start until the batch is out,
        // so a failed publish is retried from the same window
        if job.publish {
            self.publish_generated(&batch.inputs).await?;
        }
        match batch.next_start_date {
            Some(_) => generator.persist(&job.stream_id).await?,
            None => generator.complete(&job.stream_id).await?,
        }
        Ok(batch)
    }

    async fn publish_generated(&self, inputs: &[InputSpec]) -> Result<()> {
        let mut events = Vec::new();
        let mut calls = Vec::new();
        for input in inputs {
            match input {
                InputSpec::Event(spec) => events.push(spec.clone()),
                InputSpec::Call(spec) => calls.push(spec.clone()),
            }
        }
        self.relay.publish_events(events, true, None).await?;
        self.relay.publish_calls(calls, None).await?;
        Ok(())
    }

    pub async fn publish_reorg(&self, job: PublishReorgJob) -> Result<ReorgEnvelope> {
        self.relay
            .publish_reorg(&job.id, &job.chain_id, job.block_number)
            .await
    }
}

/// NATS listener configuration
#[derive(Debug, Clone)]
pub struct PipelineJobListenerConfig {
    pub nats_url: String,
    pub subscribe_subject: String,
    pub max_concurrency: usize,
}

impl PipelineJobListenerConfig {
    const DEFAULT_NATS_URL: &'static str = "nats://localhost:4222";
    const DEFAULT_MAX_CONCURRENCY: usize = 8;

    pub fn from_env() -> Self {
        let nats_url =
            std::env::var("NATS_URL").unwrap_or_else(|_| Self::DEFAULT_NATS_URL.to_string());
        let subscribe_subject = std::env::var("DECODE_PIPELINE_JOB_SUBJECT")
            .unwrap_or_else(|_| stream_registry::jobs::pattern_jobs_all().to_string());
        let max_concurrency = std::env::var("DECODE_PIPELINE_MAX_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(Self::DEFAULT_MAX_CONCURRENCY);

        Self {
            nats_url,
            subscribe_subject,
            max_concurrency,
        }
    }
}

pub struct PipelineJobListener {
    config: PipelineJobListenerConfig,
    jobs: Arc<PipelineJobs>,
}

impl PipelineJobListener {
    pub fn new(config: PipelineJobListenerConfig, jobs: Arc<PipelineJobs>) -> Self {
        Self { config, jobs }
    }

    #[instrument(skip(self))]
    pub async fn start(self) -> anyhow::Result<()> {
        info!("Connecting to NATS at {}", self.config.nats_url);
        let client = async_nats::connect(&self.config.nats_url)
            .await
            .context("failed to connect to NATS")?;

        info!("Subscribing to {}", self.config.subscribe_subject);
        let mut sub = client
            .subscribe(self.config.subscribe_subject.clone())
            .await
            .context("failed to subscribe")?;

        let sem = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));

        info!("Decode pipeline provider ready");

        loop {
            tokio::select! {
                message = sub.next() => {
                    let Some(message) = message else {
                        break;
                    };
                    let permit = match sem.clone().acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => break,
                    };

                    let client = client.clone();
                    let jobs = self.jobs.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let reply = jobs.handle(message.subject.as_str(), &message.payload).await;
                        if let Some(reply_to) = message.reply {
                            if let Err(e) = client.publish(reply_to, reply.into()).await {
                                error!("Failed to reply to job: {}", e);
                            }
                        }
                    });
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down job listener");
                    break;
                }
            }
        }

        warn!("NATS subscription ended");
        Ok(())
    }
}
