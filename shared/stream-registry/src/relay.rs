//! Relay Stream and Subject Patterns
//!
//! ```text
//! events:{name}                      # Durable log key for an event stream
//! calls:{name}                       # Durable log key for a call stream
//! relay.events.{name}                # Live transmit subject for events
//! relay.calls.{name}                 # Live transmit subject for calls
//! chain.reorgs@{chain_id}            # Reorg stream name
//! ```

/// Fixed stream name prefix for reorg envelopes
pub const REORG_STREAM: &str = "chain.reorgs";

/// Reorg stream name for a chain
///
/// Example: `chain.reorgs@137`
pub fn reorg_stream(chain_id: &str) -> String {
    format!("{}@{}", REORG_STREAM, chain_id)
}

/// Durable log key for an event stream
///
/// Example: `events:erc20.Transfer`
pub fn event_log_key(name: &str) -> String {
    format!("events:{}", name)
}

/// Durable log key for a call stream
pub fn call_log_key(name: &str) -> String {
    format!("calls:{}", name)
}

/// Live transmit subject for events
///
/// Example: `relay.events.erc20.Transfer`
pub fn live_event_subject(name: &str) -> String {
    format!("relay.events.{}", name)
}

/// Live transmit subject for calls
pub fn live_call_subject(name: &str) -> String {
    format!("relay.calls.{}", name)
}

// Subscription patterns

/// Pattern for every live event
pub fn pattern_live_events_all() -> &'static str {
    "relay.events.>"
}

/// Pattern for every live call
pub fn pattern_live_calls_all() -> &'static str {
    "relay.calls.>"
}
