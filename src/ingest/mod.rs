pub mod polling;
pub mod stream;
pub mod ws_client;

pub use polling::{PollOutcome, PollingConfig, PollingHandle, PollingIngestionClient};
pub use stream::{
    AlertSink, BellAlertSink, LatencyGauge, LogAlertSink, StreamBufferConfig, StreamClient,
    StreamIngestionBuffer,
};
pub use ws_client::WsStreamClient;
