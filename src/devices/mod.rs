pub mod impulse_counter;
pub mod options;
pub mod traits;

pub use impulse_counter::{CounterSearch, CounterSnapshot, ImpulseCounter};
pub use options::{CommunicationOptions, CounterOptions, CurrentMode, RegisterWrite};
pub use traits::DeviceData;
