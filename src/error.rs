use thiserror::Error;

/// Errors a tile source can report for a single fetch or metadata query.
///
/// None of these cross the viewport-facing API: the scheduler logs them and
/// leaves the cell as a miss so a later viewport query retries it.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// Error from the underlying storage or transport
    #[error("I/O error: {0}")]
    Io(String),

    /// Tile or resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Requested level is outside the pyramid
    #[error("Invalid level {level}: source has {level_count} levels")]
    InvalidLevel { level: u32, level_count: u32 },

    /// Tile coordinates are outside the level's tile grid
    #[error("Tile ({x}, {y}) out of bounds at level {level}: grid is {max_x}x{max_y}")]
    TileOutOfBounds {
        level: u32,
        x: u32,
        y: u32,
        max_x: u32,
        max_y: u32,
    },

    /// Pixel data could not be decoded
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// Fetch did not complete within the configured timeout
    #[error("Fetch of tile {level}/{x}/{y} timed out after {millis}ms")]
    Timeout {
        level: u32,
        x: u32,
        y: u32,
        millis: u64,
    },

    /// Source was destroyed and no longer serves tiles
    #[error("Source destroyed")]
    Destroyed,
}

impl From<std::io::Error> for SourceError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            SourceError::NotFound(err.to_string())
        } else {
            SourceError::Io(err.to_string())
        }
    }
}

impl From<image::ImageError> for SourceError {
    fn from(err: image::ImageError) -> Self {
        SourceError::Decode {
            message: err.to_string(),
        }
    }
}

/// Errors raised while constructing a tile manager or synthesizer.
#[derive(Debug, Clone, Error)]
pub enum ManagerError {
    /// The manager needs a tokio runtime to schedule background loads
    #[error("No tokio runtime available: construct the manager inside a runtime")]
    NoRuntime,

    /// Configuration failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
