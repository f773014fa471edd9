use crate::ConfigResult;

/// Trait for configuration validation
pub trait ConfigValidator {
    fn validate(&self) -> ConfigResult<()>;
}

/// General validation utilities
pub struct ValidationUtils;

impl ValidationUtils {
    /// Validate that a string is not empty
    pub fn validate_not_empty(value: &str, field_name: &str) -> ConfigResult<()> {
        if value.trim().is_empty() {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} cannot be empty"
            )));
        }
        Ok(())
    }

    /// Validate that an interval or timeout lies in `1..=max_seconds`
    pub fn validate_seconds(value: u64, field_name: &str, max_seconds: u64) -> ConfigResult<()> {
        if value == 0 {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        if value > max_seconds {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be less than or equal to {max_seconds}"
            )));
        }
        Ok(())
    }

    /// Validate that a count lies in `1..=max`
    pub fn validate_count(count: u64, field_name: &str, max: u64) -> ConfigResult<()> {
        if count == 0 {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        if count > max {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be less than or equal to {max}"
            )));
        }
        Ok(())
    }

    /// Validate an `http://` or `https://` URL
    pub fn validate_http_url(url: &str, field_name: &str) -> ConfigResult<()> {
        Self::validate_not_empty(url, field_name)?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must start with http:// or https://"
            )));
        }
        Ok(())
    }

    /// Validate a `host:port` socket address
    pub fn validate_socket_addr(addr: &str, field_name: &str) -> ConfigResult<()> {
        addr.parse::<std::net::SocketAddr>().map_err(|e| {
            crate::ConfigError::Validation(format!("{field_name} is not a valid address: {e}"))
        })?;
        Ok(())
    }
}
