//! Identifiers and encoding traits shared by every stored value
//!
//! - **ChunkId**: SHA-1 content address of a chunk in the chunk store
//! - **JobId**: correlation ID shared by every commit of one job
//! - **Packable/Unpackable**: binary encoding used by the index codec

pub mod chunk_id;
pub mod job_id;
pub mod object;

/// Length of a SHA-1 hash in hexadecimal format
pub const CHUNK_ID_LENGTH: usize = 40;

/// Length of a job ID in hexadecimal format
pub const JOB_ID_LENGTH: usize = 32;
