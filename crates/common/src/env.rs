//! Environment flag helpers.

/// Interpret an environment value as a boolean switch.
///
/// `1`, `true`, `yes` and `on` (any case, surrounding whitespace ignored)
/// enable the flag; everything else, including an empty string, does not.
#[must_use]
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Read a boolean switch through `lookup`. Unset variables are `false`.
pub fn flag_with(lookup: impl Fn(&str) -> Option<String>, name: &str) -> bool {
    lookup(name).is_some_and(|v| is_truthy(&v))
}

/// `true` when `name` is set to a non-blank value.
pub fn is_present_with(lookup: impl Fn(&str) -> Option<String>, name: &str) -> bool {
    lookup(name).is_some_and(|v| !v.trim().is_empty())
}
