//! Decode coordinator
//!
//! Registers contract instances with a group, keeps per-address ABIs in sync
//! with the group ABI, and decodes the interactions of newly added contracts.

use crate::bulk_writer::{BulkWriter, DecodedBatch, FailurePolicy};
use crate::cache::PipelineCache;
use crate::error::{PipelineError, Result};
use crate::interactions::{InteractionFinder, InteractionQuery};
use crate::store::ChainStore;
use crate::types::{
    AddedInstances, BlockRef, ChainTable, ContractGroup, ContractInstance, EventSpec,
    EventSpecTemplate,
};

use abi_decoder_provider::abi::event_by_topic;
use abi_decoder_provider::{
    decode_function_call, decode_log_event, ensure_signatures, merge_abis, Abi, AbiItem, AbiStore,
    LogRecord, TraceRecord, TransactionRecord,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Contract and instance rows owned by the registry
#[async_trait]
pub trait ContractRegistry: Send + Sync {
    /// Instances registered under any group of `namespace`
    async fn namespace_instances(&self, namespace: &str) -> Result<Vec<ContractInstance>>;

    async fn group_instances(&self, group: &ContractGroup) -> Result<Vec<ContractInstance>>;

    /// Create the group row when missing plus one row per instance, atomically
    async fn create_instances(&self, group: &ContractGroup, instances: &[ContractInstance]) -> Result<()>;
}

/// Derives data views from event shapes
#[async_trait]
pub trait DataModelDesigner: Send + Sync {
    async fn design_views(&self, group: &str, templates: &[EventSpecTemplate]) -> Result<()>;
}

/// Rows decoded and persisted for one block
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedBlock {
    pub transactions: Vec<TransactionRecord>,
    pub traces: Vec<TraceRecord>,
    pub logs: Vec<LogRecord>,
}

impl DecodedBlock {
    pub fn batches(&self) -> [DecodedBatch; 3] {
        [
            DecodedBatch::Transactions(self.transactions.clone()),
            DecodedBatch::Traces(self.traces.clone()),
            DecodedBatch::Logs(self.logs.clone()),
        ]
    }
}

pub struct DecodeCoordinator {
    registry: Arc<dyn ContractRegistry>,
    abis: Arc<dyn AbiStore>,
    store: Arc<dyn ChainStore>,
    finder: InteractionFinder,
    writer: Arc<BulkWriter>,
    cache: Arc<dyn PipelineCache>,
    designer: Arc<dyn DataModelDesigner>,
}

impl DecodeCoordinator {
    pub fn new(
        registry: Arc<dyn ContractRegistry>,
        abis: Arc<dyn AbiStore>,
        store: Arc<dyn ChainStore>,
        writer: Arc<BulkWriter>,
        cache: Arc<dyn PipelineCache>,
        designer: Arc<dyn DataModelDesigner>,
    ) -> Self {
        Self {
            registry,
            abis,
            finder: InteractionFinder::new(store.clone()),
            store,
            writer,
            cache,
            designer,
        }
    }

    /// Add instances to `group_name`.
    ///
    /// Instances already registered anywhere in the group's namespace are
    /// skipped; when none are new nothing is written. With `at_block`, the
    /// new contracts' interactions at that block are decoded and the events
    /// of successful transactions returned. Without it, the earliest block of
    /// each group event is cached for later backfills.
    #[instrument(skip(self, instances), fields(count = instances.len()))]
    pub async fn add_instances_to_group(
        &self,
        instances: &[ContractInstance],
        group_name: &str,
        at_block: Option<BlockRef>,
    ) -> Result<AddedInstances> {
        let group = ContractGroup::parse(group_name)
            .ok_or_else(|| PipelineError::InvalidGroupName(group_name.to_string()))?;
        let mut group_abi = self
            .abis
            .group_abi(group_name)
            .await?
            .ok_or_else(|| PipelineError::MissingGroupAbi(group_name.to_string()))?;
        ensure_signatures(&mut group_abi);

        let existing: HashSet<ContractInstance> = self
            .registry
            .namespace_instances(&group.namespace)
            .await?
            .into_iter()
            .map(|i| ContractInstance::new(&i.chain_id, &i.address))
            .collect();

        let mut new_instances: Vec<ContractInstance> = Vec::new();
        for instance in instances {
            let instance = ContractInstance::new(&instance.chain_id, &instance.address);
            if !existing.contains(&instance) && !new_instances.contains(&instance) {
                new_instances.push(instance);
            }
        }
        if new_instances.is_empty() {
            info!("No new instances for {}", group_name);
            return Ok(AddedInstances::default());
        }

        let by_chain = addresses_by_chain(&new_instances);
        for (chain_id, addresses) in &by_chain {
            let current = self.abis.address_abis(chain_id, addresses).await?;
            for address in addresses {
                let existing_abi = current.get(address).map(Vec::as_slice).unwrap_or_default();
                let merged = merge_abis(existing_abi, &group_abi);
                self.abis.set_address_abi(chain_id, address, &merged).await?;
            }
        }

        self.registry.create_instances(&group, &new_instances).await?;
        info!("Added {} instances to {}", new_instances.len(), group_name);

        let templates: Vec<EventSpecTemplate> = group_abi
            .iter()
            .filter_map(|item| EventSpecTemplate::from_abi_item(group_name, item))
            .collect();
        if !templates.is_empty() {
            if let Err(e) = self.designer.design_views(group_name, &templates).await {
                warn!("Designing views for {} failed: {}", group_name, e);
            }
        }

        let new_event_specs = match at_block {
            Some(block) => {
                let addresses = by_chain.get(&block.chain_id).cloned().unwrap_or_default();
                self.new_event_specs(group_name, &group_abi, &block, &addresses)
                    .await?
            }
            None => {
                self.cache_start_blocks(group_name, &group_abi, &by_chain).await?;
                Vec::new()
            }
        };

        Ok(AddedInstances {
            new_event_specs,
            new_instances,
        })
    }

    /// Decode and persist undecoded interactions of `addresses` at one block
    #[instrument(skip(self, addresses))]
    pub async fn decode_block(&self, chain_id: &str, block_number: i64, addresses: &[String]) -> Result<DecodedBlock> {
        let addresses: Vec<String> = addresses.iter().map(|a| a.to_lowercase()).collect();
        if addresses.is_empty() {
            return Ok(DecodedBlock::default());
        }
        let abis = self.abis.address_abis(chain_id, &addresses).await?;

        let transactions: Vec<TransactionRecord> = self
            .finder
            .find_interactions(chain_id, &InteractionQuery::at_block(ChainTable::Transactions, block_number, &addresses))
            .await?
            .into_transactions()
            .into_iter()
            .map(|tx| {
                let abi = abi_for(&abis, tx.to.as_deref());
                decode_function_call(tx, abi)
            })
            .filter(|tx| tx.function_name.is_some())
            .collect();

        let traces: Vec<TraceRecord> = self
            .finder
            .find_interactions(chain_id, &InteractionQuery::at_block(ChainTable::Traces, block_number, &addresses))
            .await?
            .into_traces()
            .into_iter()
            .map(|trace| {
                let abi = abi_for(&abis, trace.to.as_deref());
                decode_function_call(trace, abi)
            })
            .filter(|trace| trace.function_name.is_some())
            .collect();

        let logs: Vec<LogRecord> = self
            .finder
            .find_interactions(chain_id, &InteractionQuery::at_block(ChainTable::Logs, block_number, &addresses))
            .await?
            .into_logs()
            .into_iter()
            .map(|log| {
                let abi = abi_for(&abis, Some(&log.address));
                decode_log_event(log, abi)
            })
            .filter(LogRecord::is_decoded)
            .collect();

        let decoded = DecodedBlock {
            transactions,
            traces,
            logs,
        };
        for batch in decoded.batches() {
            self.writer
                .bulk_save(chain_id, &batch, FailurePolicy::Propagate)
                .await?;
        }

        debug!(
            "Decoded {} transactions, {} traces, {} logs at block {}",
            decoded.transactions.len(),
            decoded.traces.len(),
            decoded.logs.len(),
            block_number
        );
        Ok(decoded)
    }

    /// `decode_block` for every instance of a group on one chain
    pub async fn decode_group_block(&self, group_name: &str, chain_id: &str, block_number: i64) -> Result<DecodedBlock> {
        let group = ContractGroup::parse(group_name)
            .ok_or_else(|| PipelineError::InvalidGroupName(group_name.to_string()))?;
        let addresses: Vec<String> = self
            .registry
            .group_instances(&group)
            .await?
            .into_iter()
            .filter(|i| i.chain_id == chain_id)
            .map(|i| i.address)
            .collect();
        self.decode_block(chain_id, block_number, &addresses).await
    }

    async fn new_event_specs(
        &self,
        group_name: &str,
        group_abi: &Abi,
        block: &BlockRef,
        addresses: &[String],
    ) -> Result<Vec<EventSpec>> {
        let decoded = self
            .decode_block(&block.chain_id, block.block_number, addresses)
            .await?;
        let group_logs: Vec<LogRecord> = decoded
            .logs
            .into_iter()
            .filter(|log| {
                log.topic0
                    .as_deref()
                    .and_then(|topic| event_by_topic(group_abi, topic))
                    .is_some()
            })
            .collect();
        if group_logs.is_empty() {
            return Ok(Vec::new());
        }

        let mut hashes: Vec<String> = group_logs.iter().map(|l| l.transaction_hash.clone()).collect();
        hashes.sort();
        hashes.dedup();
        let parents: HashMap<String, TransactionRecord> = self
            .store
            .transactions_by_hash(&block.chain_id, &hashes)
            .await?
            .into_iter()
            .map(|tx| (tx.hash.clone(), tx))
            .collect();

        let mut seen = HashSet::new();
        let mut specs = Vec::new();
        for log in &group_logs {
            let Some(parent) = parents.get(&log.transaction_hash) else {
                debug!("Dropping log {}:{} without parent transaction", log.transaction_hash, log.log_index);
                continue;
            };
            if !parent.succeeded() {
                continue;
            }
            if let Some(spec) = EventSpec::from_log(group_name, &block.chain_id, log, Some(parent.clone())) {
                if seen.insert(spec.dedup_key()) {
                    specs.push(spec);
                }
            }
        }
        Ok(specs)
    }

    async fn cache_start_blocks(
        &self,
        group_name: &str,
        group_abi: &Abi,
        by_chain: &BTreeMap<String, Vec<String>>,
    ) -> Result<()> {
        for item in group_abi.iter().filter(|i| i.is_event() && !i.anonymous) {
            let Some(topic0) = item.signature() else {
                continue;
            };
            let version = stream_registry::contract_item_version(group_name, &item.name, &topic0);
            for (chain_id, addresses) in by_chain {
                if let Some(block) = self.store.earliest_log_block(chain_id, addresses, &topic0).await? {
                    self.cache.set_event_start_block(chain_id, &version, block).await?;
                    debug!("Start block of {} on chain {} is {}", version, chain_id, block);
                }
            }
        }
        Ok(())
    }
}

fn abi_for<'a>(abis: &'a HashMap<String, Abi>, address: Option<&str>) -> &'a [AbiItem] {
    address
        .and_then(|a| abis.get(&a.to_lowercase()))
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn addresses_by_chain(instances: &[ContractInstance]) -> BTreeMap<String, Vec<String>> {
    let mut by_chain: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for instance in instances {
        by_chain
            .entry(instance.chain_id.clone())
            .or_default()
            .push(instance.address.clone());
    }
    by_chain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addresses_by_chain() {
        let grouped = addresses_by_chain(&[
            ContractInstance::new("1", "0xA"),
            ContractInstance::new("137", "0xB"),
            ContractInstance::new("1", "0xC"),
        ]);
        assert_eq!(grouped["1"], vec!["0xa".to_string(), "0xc".to_string()]);
        assert_eq!(grouped["137"], vec!["0xb".to_string()]);
    }
}
