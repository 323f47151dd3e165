pub mod answer;
pub mod formatter;
pub mod retriever;
pub mod translator;

pub use answer::AnswerTask;
pub use formatter::{FormatTask, format};
pub use retriever::{MAX_TURNS, RetrieveTask, RetrieverAction, retrieve};
pub use translator::{MAX_ATTEMPTS, TranslateTask, translate};

/// Keys under which the patient pipeline threads its data through the session context.
pub mod session_keys {
    pub const PATIENT_ID: &str = "patient_id";
    pub const DOCTOR_QUERY: &str = "doctor_query";
    pub const TRANSLATED_QUERY: &str = "translated_query";
    pub const RAW_BUNDLE: &str = "raw_bundle";
    pub const FORMATTED_SUMMARY: &str = "formatted_summary";
}
