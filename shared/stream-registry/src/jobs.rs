//! Pipeline Job Subjects
//!
//! Subjects the scheduler uses to invoke the pipeline:
//! ```text
//! pipeline.jobs.register-instances      # Add contract instances to a group
//! pipeline.jobs.decode-block            # Decode one block for a group
//! pipeline.jobs.generate-inputs         # One windowed input batch (request/reply)
//! pipeline.jobs.publish-reorg           # Publish a reorg envelope
//! ```

/// Register new contract instances with a group
pub fn register_instances() -> &'static str {
    "pipeline.jobs.register-instances"
}

/// Decode every interaction of a group at one block
pub fn decode_block() -> &'static str {
    "pipeline.jobs.decode-block"
}

/// Produce the next batch of inputs for a backfill stream
pub fn generate_inputs() -> &'static str {
    "pipeline.jobs.generate-inputs"
}

/// Publish a reorg envelope
pub fn publish_reorg() -> &'static str {
    "pipeline.jobs.publish-reorg"
}

/// Pattern for all pipeline job subjects
pub fn pattern_jobs_all() -> &'static str {
    "pipeline.jobs.>"
}
