use thiserror::Error;

/// Error taxonomy shared by every service in the crate.
///
/// NotFound/Forbidden/Conflict/Validation are business outcomes; Infrastructure
/// wraps persistence failures that roll back the surrounding transaction.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Validation(String),

    #[error("database error: {0}")]
    Infrastructure(#[from] sqlx::Error),
}

impl ServiceError {
    pub fn not_found(entity: &str) -> Self {
        ServiceError::NotFound(format!("{} not found", entity))
    }

    /// True when the error is a business-rule outcome rather than a failure of
    /// the system itself.
    pub fn is_business_rule(&self) -> bool {
        matches!(self, ServiceError::Conflict(_))
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = ServiceError::not_found("Company");
        assert_eq!(err.to_string(), "Company not found");
    }

    #[test]
    fn test_business_rule_classification() {
        assert!(ServiceError::Conflict("User limit exceeded".into()).is_business_rule());
        assert!(!ServiceError::Forbidden("cross-tenant access".into()).is_business_rule());
    }
}
