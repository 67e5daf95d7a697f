//! Integration tests for the decode pipeline
//!
//! Run the coordinator, cursor builder, generator, relay and job handlers
//! against the in-memory collaborators.

use abi_decoder_provider::{
    parse_abi, AbiStore, DecodedArg, LogRecord, MemoryAbiStore, TraceRecord, TransactionRecord,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use decode_pipeline_provider::config::{BulkWriteConfig, GeneratorConfig};
use decode_pipeline_provider::cursors::{CallInput, EventInput};
use decode_pipeline_provider::memory::{
    LoggingDesigner, MemoryChainStore, MemoryContractRegistry, MemoryEventLog, MemoryPipelineCache,
    MemoryTransmit,
};
use decode_pipeline_provider::{
    next_event_id, BlockRef, BulkWriter, CallOrigin, CallSpec, ChainInputs, ContractGroup, ContractInstance,
    ContractRegistry, CursorBuilder, DecodeCoordinator, DecodedBatch, EventOrigin, EventRelay,
    EventSpec, FailurePolicy, GeneratorDeps, InputGenerator, InputSpec, PipelineCache,
    PipelineJobs,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Map};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

const TOKEN: &str = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48";
const ROUTER: &str = "0x00000000000000000000000000000000000000aa";
const SENDER: &str = "f39fd6e51aad88f6f4ce6ab8827279cfffb92266";
const RECEIVER: &str = "70997970c51812dc3a010c7d01b50e0d17dc79c8";
const TRANSFER_TOPIC: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";
const GROUP: &str = "erc20.Token";

const ERC20_ABI: &str = r#"[
    {"type":"event","name":"Transfer","anonymous":false,"inputs":[
        {"name":"from","type":"address","indexed":true},
        {"name":"to","type":"address","indexed":true},
        {"name":"value","type":"uint256","indexed":false}]},
    {"type":"function","name":"approve","stateMutability":"nonpayable",
     "inputs":[{"name":"spender","type":"address"},{"name":"amount","type":"uint256"}],
     "outputs":[{"name":"","type":"bool"}]}
]"#;

fn transfer_version() -> String {
    format!("{}.Transfer@{}", GROUP, TRANSFER_TOPIC)
}

fn transaction(hash: &str, block_number: i64, ts: DateTime<Utc>, status: i32) -> TransactionRecord {
    TransactionRecord {
        hash: hash.to_string(),
        to: Some(ROUTER.to_string()),
        input: Some("0x".to_string()),
        status: Some(status),
        block_number,
        block_hash: format!("0xblock{}", block_number),
        block_timestamp: ts,
        transaction_index: 0,
        function_name: None,
        function_args: None,
    }
}

fn transfer_log(hash: &str, log_index: i64, block_number: i64, ts: DateTime<Utc>, value: u64) -> LogRecord {
    LogRecord {
        transaction_hash: hash.to_string(),
        log_index,
        transaction_index: 0,
        address: TOKEN.to_string(),
        topic0: Some(TRANSFER_TOPIC.to_string()),
        topic1: Some(format!("0x{:0>64}", SENDER)),
        topic2: Some(format!("0x{:0>64}", RECEIVER)),
        topic3: None,
        data: Some(format!("0x{:064x}", value)),
        block_number,
        block_hash: format!("0xblock{}", block_number),
        block_timestamp: ts,
        event_name: None,
        event_args: None,
    }
}

fn decoded(mut log: LogRecord, value: u64) -> LogRecord {
    log.event_name = Some("Transfer".to_string());
    log.event_args = Some(vec![
        DecodedArg::new("from", "address", json!(format!("0x{}", SENDER))),
        DecodedArg::new("to", "address", json!(format!("0x{}", RECEIVER))),
        DecodedArg::new("value", "uint256", json!(value)),
    ]);
    log
}

struct Pipeline {
    store: Arc<MemoryChainStore>,
    abis: Arc<MemoryAbiStore>,
    registry: Arc<MemoryContractRegistry>,
    cache: Arc<MemoryPipelineCache>,
    designer: Arc<LoggingDesigner>,
    log: Arc<MemoryEventLog>,
    transmit: Arc<MemoryTransmit>,
    writer: Arc<BulkWriter>,
}

impl Pipeline {
    async fn new() -> Self {
        let store = Arc::new(MemoryChainStore::new());
        let abis = Arc::new(MemoryAbiStore::new());
        abis.set_group_abi(GROUP, &parse_abi(ERC20_ABI).unwrap())
            .await
            .unwrap();
        let writer = Arc::new(BulkWriter::new(store.clone(), BulkWriteConfig::default()));
        Self {
            store,
            abis,
            registry: Arc::new(MemoryContractRegistry::new()),
            cache: Arc::new(MemoryPipelineCache::new()),
            designer: Arc::new(LoggingDesigner::new()),
            log: Arc::new(MemoryEventLog::new(100)),
            transmit: Arc::new(MemoryTransmit::new()),
            writer,
        }
    }

    fn coordinator(&self) -> DecodeCoordinator {
        DecodeCoordinator::new(
            self.registry.clone(),
            self.abis.clone(),
            self.store.clone(),
            self.writer.clone(),
            self.cache.clone(),
            self.designer.clone(),
        )
    }

    fn relay(&self) -> EventRelay {
        EventRelay::new(self.store.clone(), self.log.clone(), self.transmit.clone())
    }

    fn cursor_builder(&self) -> CursorBuilder {
        CursorBuilder::new(self.store.clone(), self.cache.clone())
    }

    fn deps(&self) -> GeneratorDeps {
        GeneratorDeps {
            store: self.store.clone(),
            abis: self.abis.clone(),
            writer: self.writer.clone(),
            cache: self.cache.clone(),
        }
    }

    fn jobs(&self) -> PipelineJobs {
        PipelineJobs::new(
            Arc::new(self.coordinator()),
            Arc::new(self.relay()),
            Arc::new(self.cursor_builder()),
            self.deps(),
            generator_config(),
        )
    }
}

fn generator_config() -> GeneratorConfig {
    GeneratorConfig {
        target_batch_size: 5,
        max_parallel_chains: 2,
        time_budget_ms: 5_000,
        ..GeneratorConfig::default()
    }
}

fn token_inputs() -> BTreeMap<String, ChainInputs> {
    let mut inputs = BTreeMap::new();
    inputs.insert(
        "1".to_string(),
        ChainInputs {
            events: vec![EventInput {
                group: GROUP.to_string(),
                event_name: "Transfer".to_string(),
                topic0: TRANSFER_TOPIC.to_string(),
                addresses: vec![TOKEN.to_string()],
            }],
            calls: vec![],
        },
    );
    inputs
}

fn spec(name: &str, log_index: i64) -> EventSpec {
    EventSpec {
        origin: EventOrigin {
            contract_address: TOKEN.to_string(),
            transaction_hash: "0xt1".to_string(),
            log_index,
            transaction_index: 0,
            block_number: 1,
            block_hash: "0xblock1".to_string(),
            block_timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            chain_id: "1".to_string(),
            transaction: None,
        },
        name: name.to_string(),
        data: Map::new(),
    }
}

#[tokio::test]
async fn test_new_instance_at_block_yields_successful_events() {
    let pipeline = Pipeline::new().await;
    let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    pipeline
        .store
        .insert_transactions(
            "1",
            vec![transaction("0xt1", 100, ts, 1), transaction("0xt2", 100, ts, 0)],
        )
        .await;
    pipeline
        .store
        .insert_logs(
            "1",
            vec![
                transfer_log("0xt1", 0, 100, ts, 250),
                // Same row seen twice
                transfer_log("0xt1", 0, 100, ts, 250),
                transfer_log("0xt2", 1, 100, ts, 7),
                // No parent transaction
                transfer_log("0xt3", 2, 100, ts, 9),
            ],
        )
        .await;

    let added = pipeline
        .coordinator()
        .add_instances_to_group(
            &[ContractInstance::new("1", &TOKEN.to_uppercase())],
            GROUP,
            Some(BlockRef {
                chain_id: "1".to_string(),
                block_number: 100,
            }),
        )
        .await
        .unwrap();

    assert_eq!(added.new_instances, vec![ContractInstance::new("1", TOKEN)]);
    assert_eq!(added.new_event_specs.len(), 1);
    let spec = &added.new_event_specs[0];
    assert_eq!(spec.name, transfer_version());
    assert_eq!(spec.data["value"], json!(250));
    assert_eq!(spec.data["from"], json!(format!("0x{}", SENDER)));
    assert_eq!(
        spec.origin.transaction.as_ref().map(|tx| tx.hash.as_str()),
        Some("0xt1")
    );

    // Every log at the block was decoded and persisted
    assert!(pipeline.store.logs("1").await.iter().all(|l| l.is_decoded()));

    let merged = pipeline.abis.address_abi("1", TOKEN).await.unwrap().unwrap();
    assert_eq!(merged.len(), 2);

    let designed = pipeline.designer.designed();
    assert_eq!(designed.len(), 1);
    assert_eq!(designed[0].1.len(), 1);
    assert_eq!(designed[0].1[0].name, transfer_version());
}

#[tokio::test]
async fn test_existing_instance_is_a_no_op() {
    let pipeline = Pipeline::new().await;
    pipeline
        .registry
        .create_instances(
            &ContractGroup::parse("erc20.Other").unwrap(),
            &[ContractInstance::new("1", TOKEN)],
        )
        .await
        .unwrap();

    let added = pipeline
        .coordinator()
        .add_instances_to_group(&[ContractInstance::new("1", TOKEN)], GROUP, None)
        .await
        .unwrap();

    assert!(added.new_instances.is_empty());
    assert!(added.new_event_specs.is_empty());
    assert_eq!(pipeline.registry.writes(), 1);
    assert_eq!(pipeline.abis.address_abi("1", TOKEN).await.unwrap(), None);
    assert!(pipeline.designer.designed().is_empty());
}

#[tokio::test]
async fn test_missing_group_abi_is_an_error() {
    let pipeline = Pipeline::new().await;
    let result = pipeline
        .coordinator()
        .add_instances_to_group(&[ContractInstance::new("1", TOKEN)], "erc20.Unknown", None)
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_start_blocks_cached_without_block() {
    let pipeline = Pipeline::new().await;
    let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    pipeline
        .store
        .insert_logs(
            "1",
            vec![
                transfer_log("0xa", 0, 70, ts, 1),
                transfer_log("0xb", 0, 50, ts, 1),
            ],
        )
        .await;

    pipeline
        .coordinator()
        .add_instances_to_group(&[ContractInstance::new("1", TOKEN)], GROUP, None)
        .await
        .unwrap();

    assert_eq!(
        pipeline
            .cache
            .event_start_block("1", &transfer_version())
            .await
            .unwrap(),
        Some(50)
    );
}

#[tokio::test]
async fn test_cursor_builder_omits_chains_without_inputs() {
    let pipeline = Pipeline::new().await;
    let early = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let late = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
    pipeline
        .store
        .insert_logs(
            "1",
            vec![
                transfer_log("0xa", 0, 50, early, 1),
                transfer_log("0xb", 0, 70, late, 1),
            ],
        )
        .await;

    let mut inputs = token_inputs();
    inputs.insert("137".to_string(), ChainInputs::default());

    let builder = pipeline.cursor_builder();
    let cursors = builder.build_query_cursors(&inputs, None, false).await.unwrap();
    assert_eq!(cursors.keys().collect::<Vec<_>>(), vec!["1"]);
    assert_eq!(cursors["1"].timestamp_cursor, early);
    assert!(cursors["1"].input_event_ids.contains(&transfer_version()));

    // A cached start block bounds the probe
    pipeline
        .cache
        .set_event_start_block("1", &transfer_version(), 60)
        .await
        .unwrap();
    let cursors = builder.build_query_cursors(&inputs, None, false).await.unwrap();
    assert_eq!(cursors["1"].timestamp_cursor, late);

    let mut nothing = BTreeMap::new();
    nothing.insert("137".to_string(), ChainInputs::default());
    assert!(builder
        .input_generator_queries(&nothing, None, false)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_query_failure_is_not_empty() {
    let pipeline = Pipeline::new().await;
    pipeline.store.fail_queries(true);
    let result = pipeline
        .cursor_builder()
        .build_query_cursors(&token_inputs(), None, false)
        .await;
    assert!(result.is_err());
}

async fn seed_history(pipeline: &Pipeline) -> DateTime<Utc> {
    let base = Utc::now() - Duration::minutes(10);
    let mut transactions = Vec::new();
    let mut logs = Vec::new();
    for i in 0..6i64 {
        let ts = base + Duration::seconds(i * 45);
        let hash = format!("0xok{}", i);
        transactions.push(transaction(&hash, 1000 + i, ts, 1));
        logs.push(decoded(transfer_log(&hash, i, 1000 + i, ts, 100 + i as u64), 100 + i as u64));
    }
    let failed_ts = base + Duration::seconds(100);
    transactions.push(transaction("0xfailed", 1100, failed_ts, 0));
    logs.push(decoded(transfer_log("0xfailed", 0, 1100, failed_ts, 1), 1));

    pipeline.store.insert_transactions("1", transactions).await;
    pipeline.store.insert_logs("1", logs).await;
    base
}

fn keys(inputs: &[InputSpec]) -> Vec<(String, i64)> {
    inputs
        .iter()
        .map(|input| match input {
            InputSpec::Event(spec) => (spec.origin.transaction_hash.clone(), spec.origin.log_index),
            InputSpec::Call(spec) => (spec.origin.transaction_hash.clone(), spec.origin.trace_index),
        })
        .collect()
}

#[tokio::test]
async fn test_generator_resumption_is_lossless() {
    let pipeline = Pipeline::new().await;
    let base = seed_history(&pipeline).await;

    let cursors = pipeline
        .cursor_builder()
        .build_query_cursors(&token_inputs(), None, false)
        .await
        .unwrap();
    assert_eq!(cursors["1"].timestamp_cursor, base);

    // One generator kept in memory
    let mut generator = InputGenerator::new(pipeline.deps(), cursors.clone(), false, generator_config());
    assert_eq!(generator.window(), Duration::seconds(60));
    let mut straight = Vec::new();
    loop {
        let batch = generator.next_batch(None).await.unwrap();
        straight.extend(batch.inputs);
        if batch.next_start_date.is_none() {
            break;
        }
    }

    // A fresh generator per batch, resumed from the cache
    InputGenerator::new(pipeline.deps(), cursors, false, generator_config())
        .persist("stream-1")
        .await
        .unwrap();
    let mut resumed = Vec::new();
    loop {
        let mut generator = InputGenerator::resume(pipeline.deps(), "stream-1", false, generator_config())
            .await
            .unwrap()
            .expect("cursors persisted");
        let batch = generator.next_batch(None).await.unwrap();
        resumed.extend(batch.inputs);
        if batch.next_start_date.is_none() {
            generator.complete("stream-1").await.unwrap();
            break;
        }
        generator.persist("stream-1").await.unwrap();
    }

    let expected: Vec<(String, i64)> = (0..6).map(|i| (format!("0xok{}", i), i)).collect();
    assert_eq!(keys(&straight), expected);
    assert_eq!(keys(&resumed), expected);
    assert_eq!(keys(&resumed).into_iter().collect::<HashSet<_>>().len(), 6);
    assert!(pipeline.cache.query_cursors("stream-1").await.unwrap().is_none());

    match &straight[0] {
        InputSpec::Event(spec) => {
            assert_eq!(spec.name, transfer_version());
            assert_eq!(spec.data["value"], json!(100));
        }
        InputSpec::Call(_) => panic!("expected an event"),
    }
}

#[tokio::test]
async fn test_factory_generator_decodes_on_the_fly() {
    let pipeline = Pipeline::new().await;
    let ts = Utc::now() - Duration::minutes(5);
    pipeline
        .store
        .insert_transactions("1", vec![transaction("0xnew", 10, ts, 1)])
        .await;
    pipeline
        .store
        .insert_logs("1", vec![transfer_log("0xnew", 3, 10, ts, 42)])
        .await;

    let cursors = pipeline
        .cursor_builder()
        .build_query_cursors(&token_inputs(), None, true)
        .await
        .unwrap();
    let mut generator = InputGenerator::new(pipeline.deps(), cursors, true, generator_config());

    let mut inputs = Vec::new();
    loop {
        let batch = generator.next_batch(None).await.unwrap();
        inputs.extend(batch.inputs);
        if batch.next_start_date.is_none() {
            break;
        }
    }

    assert_eq!(keys(&inputs), vec![("0xnew".to_string(), 3)]);
    let stored = pipeline.store.logs("1").await;
    assert_eq!(stored[0].event_name.as_deref(), Some("Transfer"));
    assert_eq!(pipeline.store.decode_writes(), 1);
}

fn approve_trace(id: &str, hash: &str, ts: DateTime<Utc>, status: Option<i32>) -> TraceRecord {
    TraceRecord {
        id: id.to_string(),
        transaction_hash: hash.to_string(),
        transaction_index: 0,
        trace_index: 1,
        to: Some(TOKEN.to_string()),
        input: Some(format!("0x095ea7b3{:0>64}{:064x}", RECEIVER, 5u64)),
        output: Some(format!("0x{:064x}", 1u64)),
        trace_type: Some("call".to_string()),
        status,
        block_number: 10,
        block_hash: "0xblock10".to_string(),
        block_timestamp: ts,
        function_name: Some("approve".to_string()),
        function_args: Some(vec![
            DecodedArg::new("spender", "address", json!(format!("0x{}", RECEIVER))),
            DecodedArg::new("amount", "uint256", json!(5)),
        ]),
        function_outputs: Some(vec![DecodedArg::new("", "bool", json!(true))]),
    }
}

#[tokio::test]
async fn test_generator_emits_calls_of_successful_transactions() {
    let pipeline = Pipeline::new().await;
    let base = Utc::now() - Duration::minutes(5);
    pipeline
        .store
        .insert_transactions(
            "1",
            vec![
                transaction("0xc1", 10, base, 1),
                transaction("0xc2", 10, base, 0),
            ],
        )
        .await;
    pipeline
        .store
        .insert_traces(
            "1",
            vec![
                approve_trace("t1", "0xc1", base, Some(1)),
                approve_trace("t2", "0xc2", base + Duration::seconds(1), Some(1)),
                // System traces have no parent transaction
                approve_trace("t3", "", base + Duration::seconds(2), None),
                approve_trace("t4", "", base + Duration::seconds(3), Some(0)),
            ],
        )
        .await;

    let mut inputs = BTreeMap::new();
    inputs.insert(
        "1".to_string(),
        ChainInputs {
            events: vec![],
            calls: vec![CallInput {
                group: GROUP.to_string(),
                function_name: "approve".to_string(),
                selector: "0x095ea7b3".to_string(),
                addresses: vec![TOKEN.to_string()],
            }],
        },
    );
    let cursors = pipeline
        .cursor_builder()
        .build_query_cursors(&inputs, None, false)
        .await
        .unwrap();
    assert_eq!(cursors["1"].timestamp_cursor, base);

    let mut generator = InputGenerator::new(pipeline.deps(), cursors, false, generator_config());
    let mut calls = Vec::new();
    loop {
        let batch = generator.next_batch(None).await.unwrap();
        calls.extend(batch.inputs);
        if batch.next_start_date.is_none() {
            break;
        }
    }

    let ids: Vec<String> = calls
        .iter()
        .map(|input| match input {
            InputSpec::Call(spec) => {
                assert_eq!(spec.name, format!("{}.approve@0x095ea7b3", GROUP));
                assert_eq!(spec.inputs["amount"], json!(5));
                spec.origin.transaction_hash.clone()
            }
            InputSpec::Event(_) => panic!("expected a call"),
        })
        .collect();
    assert_eq!(ids, vec!["0xc1".to_string(), String::new()]);
}

#[tokio::test]
async fn test_bulk_save_is_idempotent() {
    let pipeline = Pipeline::new().await;
    let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    pipeline
        .store
        .insert_logs("1", vec![transfer_log("0xt1", 0, 1, ts, 5)])
        .await;

    let batch = DecodedBatch::Logs(vec![decoded(transfer_log("0xt1", 0, 1, ts, 5), 5)]);
    pipeline
        .writer
        .bulk_save("1", &batch, FailurePolicy::Propagate)
        .await
        .unwrap();
    let once = pipeline.store.logs("1").await;
    pipeline
        .writer
        .bulk_save("1", &batch, FailurePolicy::Propagate)
        .await
        .unwrap();
    let twice = pipeline.store.logs("1").await;

    assert_eq!(once, twice);
    assert_eq!(twice.len(), 1);
    assert_eq!(twice[0].event_name.as_deref(), Some("Transfer"));
}

#[tokio::test]
async fn test_relay_hash_chain() {
    let pipeline = Pipeline::new().await;
    let batch_ts = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
    pipeline.store.set_now(batch_ts).await;

    let published = pipeline
        .relay()
        .publish_events(
            vec![spec("erc20.Transfer", 0), spec("erc20.Transfer", 1)],
            false,
            None,
        )
        .await
        .unwrap();

    let first = next_event_id("origin");
    assert_eq!(
        first,
        "181fdd46fc4a7246b9f4f1eba3129ba5d724011af5f10223b3589955d1df108a"
    );
    assert_eq!(published[0].id, first);
    assert_eq!(published[1].id, next_event_id(&first));
    assert_eq!(published[0].timestamp, batch_ts);
    assert_eq!(published[0].nonce.as_deref(), Some("1-0"));
    assert_eq!(published[1].nonce.as_deref(), Some("2-0"));

    let entries = pipeline.log.entries("events:erc20.Transfer").await;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].id(), Some(published[1].id.clone()));

    let sent = pipeline.transmit.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].0, "relay.events.erc20.Transfer");
    let envelope: serde_json::Value = serde_json::from_slice(&sent[0].1).unwrap();
    assert_eq!(envelope["nonce"], json!("1-0"));
    assert_eq!(envelope["generated"], json!(false));

    // A new relay continues the chain from the log tail, and transmit
    // failures do not fail the publish
    pipeline.transmit.fail(true);
    let next = pipeline
        .relay()
        .publish_events(vec![spec("erc20.Transfer", 2)], true, None)
        .await
        .unwrap();
    assert_eq!(next[0].id, next_event_id(&published[1].id));
    assert_eq!(pipeline.log.entries("events:erc20.Transfer").await.len(), 3);
}

#[tokio::test]
async fn test_relay_calls_and_reorgs() {
    let pipeline = Pipeline::new().await;
    pipeline.store.fail_queries(true);
    let relay = pipeline.relay();

    let reorg = relay.publish_reorg("reorg-1", "137", 500).await.unwrap();
    assert_eq!(reorg.chain_id, "137");
    assert_eq!(reorg.block_number, 500);
    assert!(reorg.unix_timestamp > 0);
    assert_eq!(pipeline.log.entries("events:chain.reorgs@137").await.len(), 1);

    assert!(relay.publish_calls(Vec::new(), None).await.unwrap().is_empty());
}

fn approve_call(trace_index: i64) -> CallSpec {
    CallSpec {
        origin: CallOrigin {
            contract_address: TOKEN.to_string(),
            transaction_hash: format!("0xc{}", trace_index),
            trace_index,
            transaction_index: 0,
            block_number: 10,
            block_hash: "0xblock10".to_string(),
            block_timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            chain_id: "1".to_string(),
            transaction: None,
        },
        name: format!("{}.approve@0x095ea7b3", GROUP),
        inputs: Map::new(),
        outputs: Map::new(),
    }
}

#[tokio::test]
async fn test_relay_calls_get_random_ids() {
    let pipeline = Pipeline::new().await;
    let name = format!("{}.approve@0x095ea7b3", GROUP);

    let published = pipeline
        .relay()
        .publish_calls(vec![approve_call(1), approve_call(2)], None)
        .await
        .unwrap();

    assert_eq!(published.len(), 2);
    assert_ne!(published[0].id, published[1].id);
    assert!(published
        .iter()
        .all(|call| uuid::Uuid::parse_str(&call.id).is_ok()));
    assert_eq!(published[0].nonce.as_deref(), Some("1-0"));
    assert_eq!(published[1].nonce.as_deref(), Some("2-0"));

    let entries = pipeline.log.entries(&format!("calls:{}", name)).await;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].id(), Some(published[0].id.clone()));
    assert!(pipeline.log.entries(&format!("events:{}", name)).await.is_empty());

    let sent = pipeline.transmit.sent();
    assert_eq!(sent.len(), 2);
    for (subject, payload) in &sent {
        assert_eq!(subject, &format!("relay.calls.{}", name));
        let envelope: serde_json::Value = serde_json::from_slice(payload).unwrap();
        assert!(envelope["nonce"].is_string());
    }
}

#[tokio::test]
async fn test_generator_decodes_unsaved_logs_in_memory() {
    let pipeline = Pipeline::new().await;
    let ts = Utc::now() - Duration::minutes(5);
    pipeline
        .store
        .insert_transactions("1", vec![transaction("0xraw", 10, ts, 1)])
        .await;
    pipeline
        .store
        .insert_logs("1", vec![transfer_log("0xraw", 3, 10, ts, 42)])
        .await;

    let cursors = pipeline
        .cursor_builder()
        .build_query_cursors(&token_inputs(), None, false)
        .await
        .unwrap();
    let mut generator = InputGenerator::new(pipeline.deps(), cursors, false, generator_config());
    let mut inputs = Vec::new();
    loop {
        let batch = generator.next_batch(None).await.unwrap();
        inputs.extend(batch.inputs);
        if batch.next_start_date.is_none() {
            break;
        }
    }

    assert_eq!(keys(&inputs), vec![("0xraw".to_string(), 3)]);
    match &inputs[0] {
        InputSpec::Event(spec) => assert_eq!(spec.data["value"], json!(42)),
        InputSpec::Call(_) => panic!("expected an event"),
    }
    // Only contract factories write decodes back
    assert_eq!(pipeline.store.decode_writes(), 0);
    assert!(!pipeline.store.logs("1").await[0].is_decoded());
}

async fn generate_job(jobs: &PipelineJobs, body: &serde_json::Value) -> serde_json::Value {
    let reply = jobs
        .handle(
            stream_registry::jobs::generate_inputs(),
            &serde_json::to_vec(body).unwrap(),
        )
        .await;
    serde_json::from_slice(&reply).unwrap()
}

#[tokio::test]
async fn test_failed_publish_keeps_window_for_retry() {
    let pipeline = Pipeline::new().await;
    seed_history(&pipeline).await;
    let jobs = pipeline.jobs();
    let body = json!({
        "streamId": "backfill-1",
        "chainInputs": token_inputs(),
        "publish": true,
    });

    pipeline.log.fail_appends(true);
    let reply = generate_job(&jobs, &body).await;
    assert!(reply["error"].is_string());
    assert!(pipeline.cache.query_cursors("backfill-1").await.unwrap().is_none());

    pipeline.log.fail_appends(false);
    let mut generated = 0;
    for _ in 0..100 {
        let reply = generate_job(&jobs, &body).await;
        assert!(reply.get("error").is_none(), "unexpected reply {}", reply);
        generated += reply["inputs"].as_array().map_or(0, Vec::len);
        if reply["nextStartDate"].is_null() {
            break;
        }
    }

    assert_eq!(generated, 6);
    let entries = pipeline
        .log
        .entries(&format!("events:{}", transfer_version()))
        .await;
    assert_eq!(entries.len(), 6);
    let ids: HashSet<String> = entries.iter().filter_map(|e| e.id()).collect();
    assert_eq!(ids.len(), 6);
    assert!(pipeline.cache.query_cursors("backfill-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_jobs_reply_with_errors_and_results() {
    let pipeline = Pipeline::new().await;
    let jobs = pipeline.jobs();

    let reply: serde_json::Value =
        serde_json::from_slice(&jobs.handle("pipeline.jobs.unknown", b"{}").await).unwrap();
    assert!(reply["error"].as_str().unwrap().contains("Unknown job subject"));

    let reply: serde_json::Value = serde_json::from_slice(
        &jobs
            .handle(
                stream_registry::jobs::generate_inputs(),
                br#"{"streamId":"s1","chainInputs":{"1":{}}}"#,
            )
            .await,
    )
    .unwrap();
    assert_eq!(
        reply,
        json!({"inputs": [], "nextStartDate": null, "cursors": {}})
    );

    let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    pipeline
        .store
        .insert_transactions("1", vec![transaction("0xt1", 100, ts, 1)])
        .await;
    pipeline
        .store
        .insert_logs("1", vec![transfer_log("0xt1", 0, 100, ts, 250)])
        .await;
    let body = json!({
        "group": GROUP,
        "instances": [{"chainId": "1", "address": TOKEN}],
        "atBlock": {"chainId": "1", "blockNumber": 100}
    });
    let reply: serde_json::Value = serde_json::from_slice(
        &jobs
            .handle(
                stream_registry::jobs::register_instances(),
                &serde_json::to_vec(&body).unwrap(),
            )
            .await,
    )
    .unwrap();
    assert_eq!(reply["publishedEvents"], json!(1));
    assert_eq!(
        pipeline
            .log
            .entries(&format!("events:{}", transfer_version()))
            .await
            .len(),
        1
    );
}
