//! Redis Key Patterns
//!
//! ```text
//! {prefix}abis:{chain_id}                 # hash: contract address -> ABI JSON
//! {prefix}contract-group-abis             # hash: group name -> merged group ABI JSON
//! {prefix}query-cursors:{stream_id}       # serialized cursors of one backfill stream
//! {prefix}event-start-blocks:{chain_id}   # hash: namespaced version -> earliest block
//! ```

/// Hash of per-address ABIs for one chain
///
/// Example: `abis:1`
pub fn address_abis_key(prefix: &str, chain_id: &str) -> String {
    format!("{}abis:{}", prefix, chain_id)
}

/// Hash of merged contract group ABIs
pub fn group_abis_key(prefix: &str) -> String {
    format!("{}contract-group-abis", prefix)
}

/// Serialized query cursors of a backfill stream
pub fn query_cursors_key(prefix: &str, stream_id: &str) -> String {
    format!("{}query-cursors:{}", prefix, stream_id)
}

/// Earliest interaction block per event version for one chain
pub fn event_start_blocks_key(prefix: &str, chain_id: &str) -> String {
    format!("{}event-start-blocks:{}", prefix, chain_id)
}
