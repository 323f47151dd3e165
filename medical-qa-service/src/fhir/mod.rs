pub mod client;
pub mod query;
pub mod tool;

pub use client::{FhirClient, FhirError, PageFetcher, RecordServer, SearchRequest};
pub use query::{FhirQuery, QuerySyntaxError, SearchParam};
pub use tool::{FetchRecordsArgs, FetchRecordsTool, TOOL_NAME, ToolOutput};
