pub mod settings;

pub use settings::{
    BaudRate,
    Config,
    DataBits,
    DiscoveryConfig,
    Parity,
    SerialParameters,
    StopBits,
};
