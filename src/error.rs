//! Classified build failures.
//!
//! Most of the crate propagates `anyhow::Result` with path context attached at
//! each step. Failures that callers need to tell apart (a malformed GPT
//! header vs. a missing boot binary vs. an SELinux policy conflict) are raised
//! as a [`CustomizerError`] carrying an [`ErrorKind`] and the path or
//! identifier involved. [`kind_of`] recovers the kind from anywhere in an
//! `anyhow` chain.
//!
//! Two `CustomizerError`s compare equal when their kinds are equal; message
//! and context are informational only.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed on-disk structure or unsupported table type.
    StructuralParse,
    /// Loopback, mount or temp-dir setup/teardown failure.
    ResourceLifecycle,
    /// A required file or partition could not be found.
    MissingArtifact,
    /// stat/open/read/write failure while extracting or archiving.
    Io,
    /// Requested feature is infeasible for this image.
    Policy,
    /// Configuration failed validation.
    InvalidConfig,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::StructuralParse => "structural parse error",
            ErrorKind::ResourceLifecycle => "resource lifecycle error",
            ErrorKind::MissingArtifact => "missing artifact",
            ErrorKind::Io => "i/o error",
            ErrorKind::Policy => "policy error",
            ErrorKind::InvalidConfig => "invalid configuration",
        };
        f.write_str(name)
    }
}

/// Path/identifier attached to a classified error.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    pub path: Option<PathBuf>,
    pub identifier: Option<String>,
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.path, &self.identifier) {
            (Some(path), Some(id)) => write!(f, " (path='{}', id='{}')", path.display(), id),
            (Some(path), None) => write!(f, " (path='{}')", path.display()),
            (None, Some(id)) => write!(f, " (id='{}')", id),
            (None, None) => Ok(()),
        }
    }
}

#[derive(Debug, Error)]
#[error("{kind}: {message}{context}")]
pub struct CustomizerError {
    kind: ErrorKind,
    message: String,
    context: ErrorContext,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl CustomizerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: ErrorContext::default(),
            source: None,
        }
    }

    pub fn structural(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StructuralParse, message)
    }

    pub fn lifecycle(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceLifecycle, message)
    }

    pub fn missing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MissingArtifact, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    pub fn policy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Policy, message)
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidConfig, message)
    }

    pub fn with_path(mut self, path: impl AsRef<Path>) -> Self {
        self.context.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.context.identifier = Some(identifier.into());
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl PartialEq for CustomizerError {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

/// First classified kind found in the error chain.
pub fn kind_of(err: &anyhow::Error) -> Option<ErrorKind> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<CustomizerError>())
        .map(CustomizerError::kind)
}

/// Combine a primary failure with errors collected while unwinding.
///
/// The primary error stays at the root of the chain so [`kind_of`] still
/// reports it. With no primary error, the cleanup errors become the result.
pub fn join_cleanup(
    primary: Option<anyhow::Error>,
    cleanup: Vec<anyhow::Error>,
) -> Option<anyhow::Error> {
    if cleanup.is_empty() {
        return primary;
    }

    let joined = cleanup
        .iter()
        .map(|e| format!("  {:#}", e))
        .collect::<Vec<_>>()
        .join("\n");

    match primary {
        Some(err) => Some(err.context(format!("cleanup also failed:\n{}", joined))),
        None => {
            let mut cleanup = cleanup;
            if cleanup.len() == 1 {
                return cleanup.pop();
            }
            Some(anyhow::Error::new(CustomizerError::lifecycle(format!(
                "multiple cleanup failures:\n{}",
                joined
            ))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn kind_survives_context_layers() {
        let err: anyhow::Error = CustomizerError::structural("bad header")
            .with_path("/dev/loop0")
            .into();
        let wrapped = Err::<(), _>(err)
            .context("reading partition table")
            .context("converting image")
            .unwrap_err();

        assert_eq!(kind_of(&wrapped), Some(ErrorKind::StructuralParse));
        assert!(format!("{:#}", wrapped).contains("path='/dev/loop0'"));
    }

    #[test]
    fn equality_ignores_message_and_context() {
        let a = CustomizerError::missing("hash partition").with_identifier("abc");
        let b = CustomizerError::missing("something else");
        let c = CustomizerError::policy("hash partition").with_identifier("abc");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn unclassified_errors_have_no_kind() {
        let err = anyhow::anyhow!("plain failure");
        assert_eq!(kind_of(&err), None);
    }

    #[test]
    fn join_keeps_primary_kind() {
        let primary: anyhow::Error = CustomizerError::policy("selinux").into();
        let joined = join_cleanup(Some(primary), vec![anyhow::anyhow!("umount failed")]).unwrap();
        assert_eq!(kind_of(&joined), Some(ErrorKind::Policy));
        assert!(format!("{:#}", joined).contains("umount failed"));
    }

    #[test]
    fn join_without_primary_reports_cleanup() {
        assert!(join_cleanup(None, vec![]).is_none());

        let single = join_cleanup(None, vec![anyhow::anyhow!("rmdir failed")]).unwrap();
        assert!(single.to_string().contains("rmdir failed"));

        let many = join_cleanup(
            None,
            vec![anyhow::anyhow!("first"), anyhow::anyhow!("second")],
        )
        .unwrap();
        assert_eq!(kind_of(&many), Some(ErrorKind::ResourceLifecycle));
        let text = many.to_string();
        assert!(text.contains("first") && text.contains("second"));
    }
}
