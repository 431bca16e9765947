//! Semantic validation of a loaded configuration.

use crate::schema::ClawportConfig;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Dotted path, e.g. "webhooks.handler_timeout_secs"
    pub path: String,
    pub message: String,
}

impl Diagnostic {
    fn new(severity: Severity, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

/// Check cross-field constraints serde cannot express.
#[must_use]
pub fn validate(config: &ClawportConfig) -> ValidationResult {
    let mut diagnostics = Vec::new();
    let hooks = &config.webhooks;

    if hooks.max_body_bytes == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "webhooks.max_body_bytes",
            "must be greater than zero",
        ));
    }
    if hooks.body_timeout_secs == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "webhooks.body_timeout_secs",
            "must be greater than zero",
        ));
    }
    if hooks.handler_timeout_secs == 0 || hooks.handler_timeout_secs >= hooks.body_timeout_secs {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "webhooks.handler_timeout_secs",
            format!(
                "must be non-zero and shorter than webhooks.body_timeout_secs ({})",
                hooks.body_timeout_secs
            ),
        ));
    }

    let restart = &config.gateway.restart;
    if restart.drain_timeout_secs == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            "gateway.restart.drain_timeout_secs",
            "0 closes epochs without waiting for in-flight work",
        ));
    }
    if restart.allow_external_signal && config.gateway.control_token.is_none() {
        diagnostics.push(Diagnostic::new(
            Severity::Info,
            "gateway.restart.allow_external_signal",
            "restart is only reachable through SIGUSR1 (no control_token set)",
        ));
    }

    for (account_id, account) in &config.channels.telegram {
        let path = format!("channels.telegram.{account_id}");
        let token = account
            .get("token")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if token.trim().is_empty() {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                format!("{path}.token"),
                "bot token is required",
            ));
        }
        if config.server.public_url.is_none() {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "server.public_url",
                format!("required to register the webhook for {path}"),
            ));
        }
    }

    ValidationResult { diagnostics }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn parse(toml_str: &str) -> ClawportConfig {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn empty_config_is_valid() {
        let result = validate(&ClawportConfig::default());
        assert!(!result.has_errors(), "{:?}", result.diagnostics);
    }

    #[test]
    fn handler_timeout_must_be_shorter_than_body_timeout() {
        let cfg = parse(
            r#"
            [webhooks]
            body_timeout_secs = 10
            handler_timeout_secs = 10
            "#,
        );
        let result = validate(&cfg);
        assert!(result.has_errors());
        assert!(
            result
                .diagnostics
                .iter()
                .any(|d| d.path == "webhooks.handler_timeout_secs")
        );
    }

    #[rstest]
    #[case("max_body_bytes")]
    #[case("body_timeout_secs")]
    #[case("handler_timeout_secs")]
    fn zero_webhook_limits_are_errors(#[case] field: &str) {
        let cfg = parse(&format!("[webhooks]\n{field} = 0\n"));
        let result = validate(&cfg);
        let path = format!("webhooks.{field}");
        assert!(
            result
                .diagnostics
                .iter()
                .any(|d| d.severity == Severity::Error && d.path == path),
            "{:?}",
            result.diagnostics
        );
    }

    #[test]
    fn telegram_account_requires_token_and_public_url() {
        let cfg = parse(
            r#"
            [channels.telegram.main]
            webhook_path = "/tg"
            "#,
        );
        let result = validate(&cfg);
        let paths: Vec<_> = result.diagnostics.iter().map(|d| d.path.as_str()).collect();
        assert!(paths.contains(&"channels.telegram.main.token"));
        assert!(paths.contains(&"server.public_url"));
    }

    #[test]
    fn complete_telegram_account_passes() {
        let cfg = parse(
            r#"
            [server]
            public_url = "https://bot.example.com"

            [channels.telegram.main]
            token = "123:abc"
            "#,
        );
        assert!(!validate(&cfg).has_errors());
    }

    #[test]
    fn zero_drain_timeout_is_warning() {
        let cfg = parse("[gateway.restart]\ndrain_timeout_secs = 0\n");
        let result = validate(&cfg);
        assert!(!result.has_errors());
        assert_eq!(result.count(Severity::Warning), 1);
    }
}
