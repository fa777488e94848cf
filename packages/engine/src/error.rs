/// Error taxonomy of the engine. Every failure surfaced to hosts carries a
/// kind, a reason, and (where known) the entity scope plus the fingerprint
/// of the plan that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// SQL could not be parsed or is not supported in this position.
    Parse,
    /// JSON-Schema rejection, CEL evaluation failure, or immutable-field write.
    Validation,
    /// Relational uniqueness/FK violation reported by the backend.
    Constraint,
    /// A rewrite rule violated a documented postcondition. Always a bug.
    PlannerInvariant,
    /// History materialization failure.
    Maintenance,
    /// A plugin rejected its inputs or crashed.
    PluginFailure,
    /// Backend connectivity or transaction failure.
    Io,
    /// Selected entity/file/version missing in an explicit lookup.
    NotFound,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Parse => "parse",
            ErrorKind::Validation => "validation",
            ErrorKind::Constraint => "constraint",
            ErrorKind::PlannerInvariant => "planner_invariant",
            ErrorKind::Maintenance => "maintenance",
            ErrorKind::PluginFailure => "plugin_failure",
            ErrorKind::Io => "io",
            ErrorKind::NotFound => "not_found",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub entity_id: Option<String>,
    pub schema_key: Option<String>,
    pub file_id: Option<String>,
    pub version_id: Option<String>,
    pub plan_fingerprint: Option<String>,
}

impl ErrorContext {
    fn is_empty(&self) -> bool {
        self.entity_id.is_none()
            && self.schema_key.is_none()
            && self.file_id.is_none()
            && self.version_id.is_none()
            && self.plan_fingerprint.is_none()
    }
}

#[derive(Debug)]
pub struct LixError {
    pub kind: ErrorKind,
    pub message: String,
    pub context: ErrorContext,
}

impl LixError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Constraint, message)
    }

    pub fn planner_invariant(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PlannerInvariant, message)
    }

    pub fn maintenance(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Maintenance, message)
    }

    pub fn plugin(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PluginFailure, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.context.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_schema_key(mut self, schema_key: impl Into<String>) -> Self {
        self.context.schema_key = Some(schema_key.into());
        self
    }

    pub fn with_file_id(mut self, file_id: impl Into<String>) -> Self {
        self.context.file_id = Some(file_id.into());
        self
    }

    pub fn with_version_id(mut self, version_id: impl Into<String>) -> Self {
        self.context.version_id = Some(version_id.into());
        self
    }

    pub fn with_plan_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.context.plan_fingerprint = Some(fingerprint.into());
        self
    }
}

impl std::fmt::Display for LixError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)?;
        if !self.context.is_empty() {
            let mut parts = Vec::new();
            if let Some(entity_id) = &self.context.entity_id {
                parts.push(format!("entity_id={entity_id}"));
            }
            if let Some(schema_key) = &self.context.schema_key {
                parts.push(format!("schema_key={schema_key}"));
            }
            if let Some(file_id) = &self.context.file_id {
                parts.push(format!("file_id={file_id}"));
            }
            if let Some(version_id) = &self.context.version_id {
                parts.push(format!("version_id={version_id}"));
            }
            if let Some(fingerprint) = &self.context.plan_fingerprint {
                parts.push(format!("plan={fingerprint}"));
            }
            write!(f, " ({})", parts.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for LixError {}

#[cfg(test)]
mod tests {
    use super::{ErrorKind, LixError};

    #[test]
    fn display_includes_kind_and_context() {
        let err = LixError::validation("value must be a string")
            .with_entity("e1")
            .with_schema_key("demo_schema");
        let rendered = err.to_string();
        assert!(rendered.starts_with("validation: value must be a string"));
        assert!(rendered.contains("entity_id=e1"));
        assert!(rendered.contains("schema_key=demo_schema"));
    }

    #[test]
    fn display_without_context_is_plain() {
        let err = LixError::new(ErrorKind::Io, "connection reset");
        assert_eq!(err.to_string(), "io: connection reset");
    }
}
