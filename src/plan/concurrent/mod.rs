//! On-the-fly mark-sweep: tri-color marking on background threads with
//! handshakes instead of pauses, and a background sweeper.

pub mod colors;
mod global;
pub mod thread_header_queue;
pub mod workers;

pub use self::global::ConcurrentMSCollector;
