//! Stack scanning: code modules, frame descriptors, transition records.

pub mod activation_table;
pub mod frame_descriptor;
pub mod scanner;
pub mod transition_record;

pub use self::activation_table::{ActivationRecordTable, CodeModule};
pub use self::scanner::{ScanSummary, StackScanner};
pub use self::transition_record::TransitionRecord;
