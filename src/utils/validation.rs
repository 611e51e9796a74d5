use crate::utils::error::{BootstrapError, Result};
use regex::Regex;
use std::path::{Component, Path};
use std::sync::LazyLock;
use url::Url;

static ENV_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"));

// Area/Location[/Sub], e.g. Asia/Tehran, America/Argentina/Buenos_Aires
static TIMEZONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(UTC|GMT|[A-Z][A-Za-z_+\-]*(/[A-Za-z0-9_+\-]+){1,2})$").expect("valid regex")
});

pub trait Validate {
    fn validate(&self) -> Result<()>;
}

fn invalid(field_name: &str, value: &str, reason: impl Into<String>) -> BootstrapError {
    BootstrapError::InvalidConfigValueError {
        field: field_name.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

pub fn validate_url(field_name: &str, url_str: &str) -> Result<()> {
    if url_str.is_empty() {
        return Err(invalid(field_name, url_str, "URL cannot be empty"));
    }

    match Url::parse(url_str) {
        Ok(url) => match url.scheme() {
            "http" | "https" => Ok(()),
            scheme => Err(invalid(
                field_name,
                url_str,
                format!("Unsupported URL scheme: {}", scheme),
            )),
        },
        Err(e) => Err(invalid(field_name, url_str, format!("Invalid URL format: {}", e))),
    }
}

pub fn validate_path(field_name: &str, path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(invalid(field_name, path, "Path cannot be empty"));
    }

    if path.contains('\0') {
        return Err(invalid(field_name, path, "Path contains null bytes"));
    }

    Ok(())
}

/// Paths inside the image must be absolute and free of `..` segments.
pub fn validate_container_path(field_name: &str, path: &str) -> Result<()> {
    validate_path(field_name, path)?;

    let p = Path::new(path);
    if !path.starts_with('/') {
        return Err(invalid(field_name, path, "Container paths must be absolute"));
    }
    if p.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(invalid(field_name, path, "Container paths cannot contain '..'"));
    }
    Ok(())
}

/// `child` must sit strictly below `parent` (equal paths are rejected).
pub fn validate_strict_subdirectory(field_name: &str, child: &str, parent: &str) -> Result<()> {
    let child_path = Path::new(child);
    let parent_path = Path::new(parent);

    if child_path == parent_path || !child_path.starts_with(parent_path) {
        return Err(invalid(
            field_name,
            child,
            format!("Must be a strict subdirectory of {}", parent),
        ));
    }
    Ok(())
}

pub fn validate_port(field_name: &str, port: u16) -> Result<()> {
    if port == 0 {
        return Err(invalid(field_name, "0", "Port must be between 1 and 65535"));
    }
    Ok(())
}

pub fn validate_env_name(field_name: &str, name: &str) -> Result<()> {
    if !ENV_NAME.is_match(name) {
        return Err(invalid(
            field_name,
            name,
            "Environment variable names must match [A-Za-z_][A-Za-z0-9_]*",
        ));
    }
    Ok(())
}

pub fn validate_timezone(field_name: &str, tz: &str) -> Result<()> {
    if !TIMEZONE.is_match(tz) {
        return Err(invalid(
            field_name,
            tz,
            "Expected an IANA timezone such as 'Asia/Tehran' or 'UTC'",
        ));
    }
    Ok(())
}

pub fn validate_non_empty_string(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(invalid(
            field_name,
            value,
            "Value cannot be empty or whitespace-only",
        ));
    }
    Ok(())
}

pub fn validate_range<T: PartialOrd + std::fmt::Display + Copy>(
    field_name: &str,
    value: T,
    min: T,
    max: T,
) -> Result<()> {
    if value < min || value > max {
        return Err(invalid(
            field_name,
            &value.to_string(),
            format!("Value must be between {} and {}", min, max),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url() {
        assert!(validate_url("dependencies.index_url", "https://pypi.org").is_ok());
        assert!(validate_url("dependencies.index_url", "http://localhost:8080").is_ok());
        assert!(validate_url("dependencies.index_url", "").is_err());
        assert!(validate_url("dependencies.index_url", "invalid-url").is_err());
        assert!(validate_url("dependencies.index_url", "ftp://example.com").is_err());
    }

    #[test]
    fn test_validate_container_path() {
        assert!(validate_container_path("source.destination", "/app").is_ok());
        assert!(validate_container_path("source.destination", "app").is_err());
        assert!(validate_container_path("source.destination", "/app/../etc").is_err());
    }

    #[test]
    fn test_validate_strict_subdirectory() {
        assert!(validate_strict_subdirectory("runtime.workdir", "/app/src", "/app").is_ok());
        assert!(validate_strict_subdirectory("runtime.workdir", "/app", "/app").is_err());
        assert!(validate_strict_subdirectory("runtime.workdir", "/application", "/app").is_err());
        assert!(validate_strict_subdirectory("runtime.workdir", "/srv", "/app").is_err());
    }

    #[test]
    fn test_validate_timezone() {
        assert!(validate_timezone("TZ", "Asia/Tehran").is_ok());
        assert!(validate_timezone("TZ", "UTC").is_ok());
        assert!(validate_timezone("TZ", "America/Argentina/Buenos_Aires").is_ok());
        assert!(validate_timezone("TZ", "tehran").is_err());
        assert!(validate_timezone("TZ", "").is_err());
    }

    #[test]
    fn test_validate_env_name_and_port() {
        assert!(validate_env_name("environment", "PYTHONPATH").is_ok());
        assert!(validate_env_name("environment", "1BAD").is_err());
        assert!(validate_port("runtime.port", 8000).is_ok());
        assert!(validate_port("runtime.port", 0).is_err());
    }
}
