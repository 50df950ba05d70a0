//! Error types for bulkctl

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed vendor or product id
    #[error("Invalid {name} '{value}': expected a 16-bit hex number")]
    InvalidId { name: &'static str, value: String },

    /// Malformed hex payload
    #[error("Invalid hex payload: {0}")]
    InvalidPayload(#[from] hex::FromHexError),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidId {
            name: "vendor_id",
            value: "zz".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid vendor_id 'zz': expected a 16-bit hex number"
        );

        let err = Error::Config("bad level".into());
        assert_eq!(err.to_string(), "Configuration error: bad level");
    }
}
