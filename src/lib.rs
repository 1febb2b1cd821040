//! Follow an nginx JSON access log, index each record into Elasticsearch in
//! bulk chunks, and push time-windowed traffic statistics to carbon.

pub mod ext;
pub mod follower;
pub mod parser;
pub mod pipeline;
pub mod sink;
pub mod stat;
