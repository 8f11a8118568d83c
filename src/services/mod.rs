pub mod aggregator;
pub mod decoder;
pub mod interface;
pub mod pipeline;
pub mod sniffer;
