//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (counts > 0, status codes, timeouts ordered)
//! - Validate upstream origins and method names
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: DispatchConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use http::Method;
use thiserror::Error;

use crate::config::schema::DispatchConfig;
use crate::load_balancer::normalize_origin;

/// One rejected setting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// Dotted path of the offending field, e.g. `retry.timeout_factor`.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub fn validate_config(config: &DispatchConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    for (i, upstream) in config.upstreams.iter().enumerate() {
        if let Err(err) = normalize_origin(upstream) {
            errors.push(ValidationError::new(format!("upstreams[{i}]"), err.to_string()));
        }
    }

    let pool = &config.pool;
    if pool.connections == 0 {
        errors.push(ValidationError::new("pool.connections", "must be greater than 0"));
    }
    if pool.pipelining == 0 {
        errors.push(ValidationError::new("pool.pipelining", "must be greater than 0"));
    }
    if pool.headers_timeout_ms == 0 || pool.body_timeout_ms == 0 {
        errors.push(ValidationError::new("pool", "timeouts must be greater than 0"));
    }

    if config.balancer.max_weight_per_server == 0 {
        errors.push(ValidationError::new(
            "balancer.max_weight_per_server",
            "must be greater than 0",
        ));
    }

    let breaker = &config.circuit_breaker;
    if breaker.threshold == 0 {
        errors.push(ValidationError::new("circuit_breaker.threshold", "must be greater than 0"));
    }
    if breaker.success_threshold == 0 {
        errors.push(ValidationError::new(
            "circuit_breaker.success_threshold",
            "must be greater than 0",
        ));
    }
    if breaker.max_half_open_requests == 0 {
        errors.push(ValidationError::new(
            "circuit_breaker.max_half_open_requests",
            "must be greater than 0",
        ));
    }
    check_status_codes("circuit_breaker.status_codes", &breaker.status_codes, &mut errors);

    let retry = &config.retry;
    if retry.timeout_factor == 0 {
        errors.push(ValidationError::new("retry.timeout_factor", "must be at least 1"));
    }
    if retry.min_timeout_ms > retry.max_timeout_ms {
        errors.push(ValidationError::new(
            "retry.min_timeout_ms",
            "must not exceed retry.max_timeout_ms",
        ));
    }
    for method in &retry.methods {
        if method.to_ascii_uppercase().parse::<Method>().is_err() {
            errors.push(ValidationError::new(
                "retry.methods",
                format!("{method:?} is not an HTTP method"),
            ));
        }
    }
    check_status_codes("retry.status_codes", &retry.status_codes, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_status_codes(field: &str, codes: &[u16], errors: &mut Vec<ValidationError>) {
    for code in codes.iter().filter(|code| !(100..=599).contains(*code)) {
        errors.push(ValidationError::new(field, format!("{code} is outside 100..=599")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(validate_config(&DispatchConfig::default()), Ok(()));
    }

    #[test]
    fn test_reports_every_violation() {
        let mut config = DispatchConfig::default();
        config.upstreams = vec!["http://localhost:8080".into(), "ftp://files".into()];
        config.pool.connections = 0;
        config.circuit_breaker.status_codes.push(700);
        config.retry.timeout_factor = 0;
        config.retry.methods.push("NOT A METHOD".into());

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "upstreams[1]",
                "pool.connections",
                "circuit_breaker.status_codes",
                "retry.timeout_factor",
                "retry.methods",
            ]
        );
    }
}
