pub mod access_log;
pub mod document;

pub use access_log::AccessLogParser;
pub use document::Document;
