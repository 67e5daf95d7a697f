//! Fire-and-forget live transmission of envelopes

use crate::error::{PipelineError, Result};

use async_trait::async_trait;
use tracing::debug;

#[async_trait]
pub trait LiveTransmit: Send + Sync {
    async fn transmit(&self, subject: &str, payload: &[u8]) -> Result<()>;
}

pub struct NatsTransmit {
    client: async_nats::Client,
}

impl NatsTransmit {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LiveTransmit for NatsTransmit {
    async fn transmit(&self, subject: &str, payload: &[u8]) -> Result<()> {
        self.client
            .publish(subject.to_string(), payload.to_vec().into())
            .await
            .map_err(|e| PipelineError::Nats(e.to_string()))?;
        debug!("Transmitted {} bytes on {}", payload.len(), subject);
        Ok(())
    }
}
