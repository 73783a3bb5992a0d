mod scheduler;
mod store;
mod types;

pub use scheduler::MessageScheduler;
pub use store::MessageStore;
pub use types::{
  DelayUnit, DeliveryLogEntry, DeliveryResult, MessageSpec, ScheduledMessage, format_delay,
  parse_delay,
};
