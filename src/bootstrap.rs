//! Bootstrap script rendering for freshly provisioned instances.
//!
//! The template is a shell script executed on first boot. It may reference
//! `{{listen_host}}`, `{{listen_port}}`, `{{offer_id}}` and `{{run_label}}`;
//! every value is shell-escaped before substitution.

use std::borrow::Cow;

use shell_escape::unix::escape;
use thiserror::Error;

use crate::engine::first_placeholder;
use crate::files;

/// Script used when no template file is configured.
pub const DEFAULT_TEMPLATE: &str = "#!/bin/sh
set -eu
export SPOTRUN_OFFER_ID={{offer_id}}
export SPOTRUN_RUN_LABEL={{run_label}}
cd \"${COMFYUI_HOME:-/opt/ComfyUI}\"
exec python main.py --listen {{listen_host}} --port {{listen_port}}
";

/// Errors raised while loading or rendering a bootstrap template.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum BootstrapError {
    /// Raised when a template is empty or only whitespace.
    #[error("bootstrap template must not be empty")]
    Empty,
    /// Raised when a template file path is empty or only whitespace.
    #[error("bootstrap template file path must not be empty")]
    FilePathEmpty,
    /// Raised when reading the template file fails.
    #[error("failed to read bootstrap template `{path}`: {message}")]
    FileRead {
        /// Expanded path that failed to read.
        path: String,
        /// Underlying error message.
        message: String,
    },
    /// Raised when the template references an unknown placeholder.
    #[error("bootstrap template references unknown placeholder `{name}`")]
    UnresolvedPlaceholder {
        /// Placeholder name.
        name: String,
    },
}

/// Values substituted into a bootstrap template for one run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootstrapContext {
    /// Interface the engine binds to.
    pub listen_host: String,
    /// Port the engine listens on.
    pub listen_port: u16,
    /// Offer the instance is rented from.
    pub offer_id: String,
    /// Label identifying the run.
    pub run_label: String,
}

/// Validated bootstrap template.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootstrapTemplate {
    source: String,
}

impl Default for BootstrapTemplate {
    fn default() -> Self {
        Self {
            source: DEFAULT_TEMPLATE.to_owned(),
        }
    }
}

impl BootstrapTemplate {
    /// Wraps inline template text.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Empty`] when the text is blank.
    pub fn new(source: impl Into<String>) -> Result<Self, BootstrapError> {
        let text = source.into();
        if text.trim().is_empty() {
            return Err(BootstrapError::Empty);
        }
        Ok(Self { source: text })
    }

    /// Loads a template from disk.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError`] when the path is blank, the file cannot be
    /// read, or it is empty.
    pub fn from_file(path: &str) -> Result<Self, BootstrapError> {
        if path.trim().is_empty() {
            return Err(BootstrapError::FilePathEmpty);
        }
        let content = files::read_to_string(path).map_err(|err| BootstrapError::FileRead {
            path: files::expand_tilde(path),
            message: err.to_string(),
        })?;
        Self::new(content)
    }

    /// Renders the script for one run.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::UnresolvedPlaceholder`] when the template
    /// references a placeholder other than the supported ones.
    pub fn render(&self, context: &BootstrapContext) -> Result<String, BootstrapError> {
        let port = context.listen_port.to_string();
        let values: [(&str, &str); 4] = [
            ("listen_host", context.listen_host.as_str()),
            ("listen_port", port.as_str()),
            ("offer_id", context.offer_id.as_str()),
            ("run_label", context.run_label.as_str()),
        ];

        let mut rendered = self.source.clone();
        for (name, value) in values {
            let marker = format!("{{{{{name}}}}}");
            rendered = rendered.replace(&marker, &escape(Cow::Borrowed(value)));
        }

        if let Some(name) = first_placeholder(&rendered) {
            return Err(BootstrapError::UnresolvedPlaceholder {
                name: name.to_owned(),
            });
        }
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use rstest::{fixture, rstest};
    use tempfile::NamedTempFile;

    use super::*;

    #[fixture]
    fn context() -> BootstrapContext {
        BootstrapContext {
            listen_host: String::from("0.0.0.0"),
            listen_port: 8188,
            offer_id: String::from("offer-7"),
            run_label: String::from("spotrun-abc"),
        }
    }

    #[rstest]
    fn default_template_starts_engine_on_configured_port(context: BootstrapContext) {
        let script = BootstrapTemplate::default()
            .render(&context)
            .expect("default template renders");

        assert!(script.contains("--listen 0.0.0.0 --port 8188"), "{script}");
        assert!(script.contains("SPOTRUN_OFFER_ID=offer-7"), "{script}");
        assert!(script.contains("SPOTRUN_RUN_LABEL=spotrun-abc"), "{script}");
    }

    #[rstest]
    fn values_are_shell_escaped(mut context: BootstrapContext) {
        context.offer_id = String::from("x; rm -rf /");
        let template = BootstrapTemplate::new("echo {{offer_id}}").expect("template");

        let script = template.render(&context).expect("renders");

        assert_eq!(script, "echo 'x; rm -rf /'");
    }

    #[rstest]
    fn unknown_placeholder_is_rejected(context: BootstrapContext) {
        let template = BootstrapTemplate::new("echo {{gpu_count}}").expect("template");

        let err = template.render(&context).expect_err("unknown placeholder");

        assert_eq!(
            err,
            BootstrapError::UnresolvedPlaceholder {
                name: String::from("gpu_count"),
            }
        );
    }

    #[rstest]
    #[case("")]
    #[case("   \n")]
    fn blank_templates_are_rejected(#[case] source: &str) {
        assert_eq!(BootstrapTemplate::new(source), Err(BootstrapError::Empty));
    }

    #[rstest]
    fn template_loads_from_file(context: BootstrapContext) {
        let mut file = NamedTempFile::new().expect("temp file");
        write!(file, "run --port {{{{listen_port}}}}").expect("write template");
        let path = file.path().to_string_lossy().into_owned();

        let script = BootstrapTemplate::from_file(&path)
            .expect("template loads")
            .render(&context)
            .expect("renders");

        assert_eq!(script, "run --port 8188");
    }

    #[test]
    fn missing_file_reports_path() {
        let err = BootstrapTemplate::from_file("/nonexistent/spotrun/boot.sh")
            .expect_err("missing file");

        assert!(
            matches!(err, BootstrapError::FileRead { ref path, .. } if path == "/nonexistent/spotrun/boot.sh"),
            "{err:?}"
        );
    }

    #[test]
    fn blank_path_is_rejected() {
        assert_eq!(
            BootstrapTemplate::from_file(" "),
            Err(BootstrapError::FilePathEmpty)
        );
    }
}
