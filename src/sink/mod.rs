//! The publishing sink: serializes events, chooses a partition key, and
//! delivers them to the broker with batching, compression, and backpressure.

pub mod kafka;

pub use kafka::KafkaSink;
