pub mod elastic;
pub mod stdout;
pub mod template;

pub use elastic::{ElasticSink, SinkError};
pub use stdout::StdoutSink;
