//! Process-wide tracing setup shared by every ticketflow binary.

pub mod tracing;

pub use self::tracing::{LogFormat, UnknownLogFormat};

/// Install the global subscriber.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init(format: LogFormat) {
    self::tracing::init(format);
}
