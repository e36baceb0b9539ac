use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),
    #[error("No Bluetooth adapter found")]
    NoAdapter,
    #[error("adapter {index} not found ({count} available)")]
    AdapterIndex { index: usize, count: usize },
    #[error("BLE driver stopped")]
    DriverStopped,
    #[error("no home directory, set SESAME_HOME")]
    NoHome,
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
