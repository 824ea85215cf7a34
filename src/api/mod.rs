pub mod rest;

pub use rest::{
    ArtifactApi, ArtifactRequest, ConditionalResponse, RestClient, SignalApi, SignalQuery,
};
