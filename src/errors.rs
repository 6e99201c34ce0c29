use thiserror::Error;

/// Transport level failures. Never retried by the transport itself.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BusError {
    #[error("I2C transfer with device {address:#04x} at register {register:#04x} failed: {reason}")]
    Transfer { address: u8, register: u8, reason: String },

    #[error("No device acknowledged address {address:#04x}")]
    Nack { address: u8 },

    #[error("I2C not supported on this platform: {0}")]
    Unsupported(String),
}

/// Errors raised by the BME68x register driver
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SensorError {
    #[error("I2C communication failed: {0}")]
    Bus(#[from] BusError),

    #[error("Sensor '{sensor}' has no new data yet")]
    NotReady { sensor: String },

    #[error("Sensor '{sensor}' is busy with a measurement")]
    Busy { sensor: String },

    #[error("Sensor '{sensor}' has no measurement in progress")]
    NotTriggered { sensor: String },

    #[error("Sensor '{sensor}' used before initialization")]
    Uninitialized { sensor: String },

    #[error("Invalid sensor configuration for '{sensor}': {reason}")]
    Config { sensor: String, reason: String },

    #[error("Sensor '{sensor}' wrong chip ID: expected {expected:#04x}, got {actual:#04x}")]
    WrongChipId { sensor: String, expected: u8, actual: u8 },

    #[error("Sensor '{sensor}' reports variant {actual:#04x}, configured model {model} expects {expected:#04x}")]
    VariantMismatch {
        sensor: String,
        model: String,
        expected: u8,
        actual: u8,
    },

    #[error("Sensor '{sensor}' failed its self-test: {reason}")]
    SelfTest { sensor: String, reason: String },
}

impl SensorError {
    /// Initialization failures that must abort component startup.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            SensorError::Config { .. }
                | SensorError::WrongChipId { .. }
                | SensorError::VariantMismatch { .. }
                | SensorError::SelfTest { .. }
        )
    }
}

/// Errors raised by the fusion bridge and the fusion library behind it
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FusionError {
    #[error("Fusion library initialization failed: {reason}")]
    Init { reason: String },

    #[error("Fusion step failed: {reason}")]
    Process { reason: String },

    #[error("Fusion state rejected: {reason}")]
    State { reason: String },

    #[error("Fusion library used before initialization")]
    NotInitialized,
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration from '{path}': {source}")]
    LoadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration format: {0}")]
    FormatError(#[from] toml::de::Error),

    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Fusion state persistence errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("State file '{path}' I/O failed: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Registry and initialization errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Bus initialization failed: {0}")]
    BusInitError(#[from] ConfigError),

    #[error("Bus '{bus}' could not be opened: {source}")]
    BusOpenError {
        bus: String,
        #[source]
        source: BusError,
    },

    #[error("Bus '{bus}' not found or unavailable")]
    BusNotFound { bus: String },

    #[error("Unsupported bus type '{kind}' for bus '{bus}'")]
    UnsupportedBus { bus: String, kind: String },

    #[error("Sensor '{sensor}' setup failed: {source}")]
    SetupError {
        sensor: String,
        #[source]
        source: SetupError,
    },
}

/// Startup failures of a single component
#[derive(Error, Debug)]
pub enum SetupError {
    #[error(transparent)]
    Sensor(#[from] SensorError),

    #[error(transparent)]
    Fusion(#[from] FusionError),
}

/// Failure to persist or restore the fusion state
#[derive(Error, Debug)]
pub enum StateError {
    #[error(transparent)]
    Fusion(#[from] FusionError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type aliases for convenience
pub type BusResult<T> = Result<T, BusError>;
pub type SensorResult<T> = Result<T, SensorError>;
pub type FusionResult<T> = Result<T, FusionError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type StorageResult<T> = Result<T, StorageError>;
pub type RegistryResult<T> = Result<T, RegistryError>;
