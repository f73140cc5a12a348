//! Predefined device templates.
//!
//! Factory functions building a [`DeviceOperator`] for common network
//! operating systems, pre-configured with their prompts, error messages
//! and mode transitions. Every template names its entry mode `login`, the
//! mode a fresh session starts in.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::device::DeviceOperator;
use crate::error::ConnectError;

/// Built-in template names supported by this crate.
pub const BUILTIN_TEMPLATES: &[&str] = &["cisco", "huawei", "h3c", "juniper"];

/// Metadata for a built-in device template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TemplateMetadata {
    pub name: String,
    pub vendor: String,
    pub family: String,
    /// Modes the template defines prompts for.
    pub modes: Vec<String>,
}

fn metadata_for(name: &str) -> Option<TemplateMetadata> {
    let (vendor, family, modes): (&str, &str, &[&str]) = match name {
        "cisco" => ("Cisco", "IOS/IOS-XE", &["login", "enable", "config"]),
        "huawei" => ("Huawei", "VRP", &["login", "config"]),
        "h3c" => ("H3C", "Comware", &["login", "config"]),
        "juniper" => ("Juniper", "JunOS", &["login", "config"]),
        _ => return None,
    };
    Some(TemplateMetadata {
        name: name.to_string(),
        vendor: vendor.to_string(),
        family: family.to_string(),
        modes: modes.iter().map(|m| m.to_string()).collect(),
    })
}

/// Returns names of all built-in templates.
pub fn available_templates() -> &'static [&'static str] {
    BUILTIN_TEMPLATES
}

/// Returns metadata for all built-in templates.
pub fn template_catalog() -> Vec<TemplateMetadata> {
    BUILTIN_TEMPLATES
        .iter()
        .filter_map(|name| metadata_for(name))
        .collect()
}

/// Returns metadata for one template by name (case-insensitive).
pub fn template_metadata(name: &str) -> Result<TemplateMetadata, ConnectError> {
    let key = name.to_ascii_lowercase();
    metadata_for(&key).ok_or_else(|| ConnectError::TemplateNotFound(name.to_string()))
}

/// Creates a built-in template by name (case-insensitive).
///
/// `enable_password` is only used by templates with a password-protected
/// privileged mode.
pub fn by_name(name: &str, enable_password: Option<&str>) -> Result<DeviceOperator, ConnectError> {
    match name.to_ascii_lowercase().as_str() {
        "cisco" => cisco(enable_password),
        "huawei" => huawei(),
        "h3c" => h3c(),
        "juniper" => juniper(),
        _ => Err(ConnectError::TemplateNotFound(name.to_string())),
    }
}

/// Returns a `DeviceOperator` configured for Cisco IOS/IOS-XE devices.
///
/// When `enable_password` is set it is sent right after `enable`; the
/// password prompt is part of the enable-mode prompt set so each step of
/// the transition is confirmed.
pub fn cisco(enable_password: Option<&str>) -> Result<DeviceOperator, ConnectError> {
    let mut enable = vec!["enable".to_string()];
    if let Some(password) = enable_password {
        enable.push(password.to_string());
    }
    DeviceOperator::new(
        vec![
            ("Login".to_string(), vec![r"[^\s<>#]+>\s*$"]),
            (
                "Enable".to_string(),
                vec![r"[^\s#()]+#\s*$", r"(Enable )?Password:\s*$"],
            ),
            ("Config".to_string(), vec![r"\S+\(\S+\)#\s*$"]),
        ],
        vec![
            r"^% Invalid input detected at '\^' marker\.",
            r"^% Incomplete command\.",
            r"^% Ambiguous command",
            r"^Command authorization failed.*",
            r"^Command rejected:.*",
            r"^ERROR:.+",
            r"Access denied",
        ],
        vec![
            ("Login".to_string(), enable, "Enable".to_string()),
            (
                "Enable".to_string(),
                vec!["configure terminal".to_string()],
                "Config".to_string(),
            ),
            ("Config".to_string(), vec!["end".to_string()], "Enable".to_string()),
            (
                "Enable".to_string(),
                vec!["disable".to_string()],
                "Login".to_string(),
            ),
        ],
    )
}

/// Returns a `DeviceOperator` configured for Huawei VRP devices.
pub fn huawei() -> Result<DeviceOperator, ConnectError> {
    DeviceOperator::new(
        vec![
            ("Login".to_string(), vec![r"^(RBM_P|RBM_S)?<.+>\s*$"]),
            (
                "Config".to_string(),
                vec![r"^(HRP_M|HRP_S)?\[.+]\s*$"],
            ),
        ],
        vec![r"^Error: .+$", r"^\s*\^$"],
        vec![
            (
                "Login".to_string(),
                vec!["system-view".to_string()],
                "Config".to_string(),
            ),
            ("Config".to_string(), vec!["return".to_string()], "Login".to_string()),
        ],
    )
}

/// Returns a `DeviceOperator` configured for H3C Comware devices.
pub fn h3c() -> Result<DeviceOperator, ConnectError> {
    DeviceOperator::new(
        vec![
            ("Login".to_string(), vec![r"^(RBM_P|RBM_S)?<.+>\s*$"]),
            ("Config".to_string(), vec![r"^(RBM_P|RBM_S)?\[.+\]\s*$"]),
        ],
        vec![
            r"^\s*% Unrecognized command found at '\^' position\.",
            r"^\s*% Incomplete command found at '\^' position\.",
            r".+doesn't exist.+",
            r".+does not exist.+",
        ],
        vec![
            (
                "Login".to_string(),
                vec!["system-view".to_string()],
                "Config".to_string(),
            ),
            ("Config".to_string(), vec!["return".to_string()], "Login".to_string()),
        ],
    )
}

/// Returns a `DeviceOperator` configured for Juniper JunOS devices.
pub fn juniper() -> Result<DeviceOperator, ConnectError> {
    DeviceOperator::new(
        vec![
            ("Login".to_string(), vec![r"^\S+@\S+>\s*$"]),
            ("Config".to_string(), vec![r"^\S+@\S+#\s*$"]),
        ],
        vec![
            r".*unknown command.*",
            r"^syntax error.*",
            r"^error:.+",
            r"invalid value .+",
            r"invalid ip address .+",
        ],
        vec![
            (
                "Login".to_string(),
                vec!["configure".to_string()],
                "Config".to_string(),
            ),
            (
                "Config".to_string(),
                vec!["exit configuration-mode".to_string()],
                "Login".to_string(),
            ),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Operator, any_pattern_matches};

    #[test]
    fn available_templates_contains_expected_names() {
        let names = available_templates();
        assert!(names.contains(&"cisco"));
        assert!(names.contains(&"juniper"));
    }

    #[test]
    fn every_builtin_template_builds_and_has_login_mode() {
        for name in BUILTIN_TEMPLATES {
            let operator = by_name(name, None).expect("template should build");
            assert!(
                !operator.prompts("login").is_empty(),
                "{name} has no login prompt"
            );
        }
    }

    #[test]
    fn by_name_returns_template_not_found_for_unknown_name() {
        let err = match by_name("unknown-vendor", None) {
            Ok(_) => panic!("unknown template should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, ConnectError::TemplateNotFound(_)));
    }

    #[test]
    fn template_metadata_is_case_insensitive() {
        let meta = template_metadata("JuNiPeR").expect("metadata should resolve");
        assert_eq!(meta.name, "juniper");
        assert_eq!(meta.vendor, "Juniper");
        assert_eq!(template_catalog().len(), BUILTIN_TEMPLATES.len());
    }

    #[test]
    fn cisco_enable_transition_includes_password() {
        let operator = cisco(Some("secret123")).expect("cisco template");
        let commands: Vec<String> = operator
            .transitions("login", "config")
            .into_iter()
            .map(|step| step.command)
            .collect();
        assert_eq!(commands, vec!["enable", "secret123", "configure terminal"]);
        assert!(any_pattern_matches("Password: ", operator.prompts("enable")).is_some());
    }

    #[test]
    fn cisco_prompts_distinguish_modes() {
        let operator = cisco(None).expect("cisco template");
        assert!(any_pattern_matches("Router>", operator.prompts("login")).is_some());
        assert!(any_pattern_matches("Router#", operator.prompts("enable")).is_some());
        assert!(any_pattern_matches("Router(config)#", operator.prompts("config")).is_some());
        assert!(any_pattern_matches("Router(config)#", operator.prompts("enable")).is_none());
    }

    #[test]
    fn cisco_invalid_input_is_an_error_line() {
        let operator = cisco(None).expect("cisco template");
        assert!(
            any_pattern_matches(
                "% Invalid input detected at '^' marker.",
                operator.error_patterns()
            )
            .is_some()
        );
    }
}
