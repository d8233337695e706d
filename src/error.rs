use thiserror::Error;

/// Why `Dispatcher::new` refused to come up.
#[derive(Debug, Error)]
pub enum CreateError {
    #[error("geometry has no parallel units ({channels} channels x {chips_per_channel} chips)")]
    NoUnits {
        channels: usize,
        chips_per_channel: usize,
    },
    #[error("failed to spawn the dispatcher thread")]
    Spawn(#[from] std::io::Error),
}

/// Why a request was not admitted.
///
/// Ownership of the request stays with the caller on error.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("channel {channel}, chip {chip} lies outside the configured geometry")]
    UnitOutOfRange { channel: usize, chip: usize },
    #[error("dispatcher is shutting down")]
    ShuttingDown,
}

/// Returned by a device model that refuses a request.
///
/// The raw status also lands on the rejected request itself, so the upper
/// layer sees it from `end_req`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("device model rejected the request (status {0})")]
pub struct DeviceError(pub u32);
