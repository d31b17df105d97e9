//! Type-directed option validation and `.env` rendering.

use std::collections::BTreeMap;

use url::Url;

use crate::error::NodeError;
use crate::model::{OptionSpec, OptionType};

/// Validate a single option value against its declared type and validator.
/// Returns the problem string on failure, to be aggregated by the caller.
pub fn validate_value(spec: &OptionSpec, value: &str) -> Result<(), String> {
    let validator = spec.validate.as_ref();

    match spec.option_type {
        OptionType::Port => {
            let port: i64 = value
                .parse()
                .map_err(|_| format!("option '{}': '{}' is not an integer", spec.name, value))?;
            if port <= 0 || port > 65535 {
                return Err(format!(
                    "option '{}': port {} out of range (1, 65535]",
                    spec.name, port
                ));
            }
        }
        OptionType::Int => {
            let n: i64 = value
                .parse()
                .map_err(|_| format!("option '{}': '{}' is not an integer", spec.name, value))?;
            if let Some(v) = validator {
                if let Some(min) = v.min_value
                    && (n as f64) < min
                {
                    return Err(format!("option '{}': {} is below min {}", spec.name, n, min));
                }
                if let Some(max) = v.max_value
                    && (n as f64) > max
                {
                    return Err(format!("option '{}': {} is above max {}", spec.name, n, max));
                }
            }
        }
        OptionType::Float => {
            let n: f64 = value
                .parse()
                .map_err(|_| format!("option '{}': '{}' is not a number", spec.name, value))?;
            if let Some(v) = validator {
                if let Some(min) = v.min_value
                    && n < min
                {
                    return Err(format!("option '{}': {} is below min {}", spec.name, n, min));
                }
                if let Some(max) = v.max_value
                    && n > max
                {
                    return Err(format!("option '{}': {} is above max {}", spec.name, n, max));
                }
            }
        }
        OptionType::Bool => {
            if value != "true" && value != "false" {
                return Err(format!("option '{}': '{}' is not a bool", spec.name, value));
            }
        }
        OptionType::Uri => {
            let parsed = Url::parse(value)
                .map_err(|_| format!("option '{}': '{}' is not a valid URI", spec.name, value))?;
            if let Some(schemes) = validator.and_then(|v| v.schemes.as_ref())
                && !schemes.iter().any(|s| s == parsed.scheme())
            {
                return Err(format!(
                    "option '{}': scheme '{}' not in {:?}",
                    spec.name,
                    parsed.scheme(),
                    schemes
                ));
            }
        }
        OptionType::PathFile => {
            if let Some(v) = validator {
                if let Some(regex) = &v.regex
                    && !regex_match(regex, value)
                {
                    return Err(format!("option '{}': '{}' does not match {}", spec.name, value, regex));
                }
                if let Some(format) = &v.format {
                    let ext = std::path::Path::new(value)
                        .extension()
                        .and_then(|e| e.to_str())
                        .unwrap_or("");
                    if ext != format.trim_start_matches('.') {
                        return Err(format!(
                            "option '{}': '{}' does not have extension '{}'",
                            spec.name, value, format
                        ));
                    }
                }
            }
        }
        OptionType::PathDir => {
            // No further structural constraint beyond an optional regex.
            if let Some(regex) = validator.and_then(|v| v.regex.as_ref())
                && !regex_match(regex, value)
            {
                return Err(format!("option '{}': '{}' does not match {}", spec.name, value, regex));
            }
        }
        OptionType::Select => {
            let options = validator
                .and_then(|v| v.options.as_ref())
                .ok_or_else(|| format!("option '{}': select option missing validate.options", spec.name))?;
            if !options.iter().any(|o| o == value) {
                return Err(format!(
                    "option '{}': '{}' is not one of {:?}",
                    spec.name, value, options
                ));
            }
        }
        OptionType::Id => {
            if value.chars().any(char::is_whitespace) {
                return Err(format!("option '{}': id must not contain whitespace", spec.name));
            }
        }
        OptionType::Str => {
            if let Some(regex) = validator.and_then(|v| v.regex.as_ref())
                && !regex_match(regex, value)
            {
                return Err(format!("option '{}': '{}' does not match {}", spec.name, value, regex));
            }
        }
    }

    Ok(())
}

/// Minimal anchored regex match. The option grammars this validates are
/// simple literal/character-class patterns; a full regex engine is not a
/// dependency of this crate's stack, so matching is delegated to a
/// conservative subset: `.`, `*`, `+`, `^`/`$` anchors, and character
/// classes are treated literally except for `.` (any char) and trailing
/// `*`/`+` quantifiers on the preceding token. This covers the validator
/// forms profiles declare in practice (path/extension patterns).
fn regex_match(pattern: &str, value: &str) -> bool {
    fn matches_here(pat: &[char], val: &[char]) -> bool {
        match pat.first() {
            None => val.is_empty(),
            Some('$') if pat.len() == 1 => val.is_empty(),
            Some(&c) => {
                let (literal, rest) = (c, &pat[1..]);
                match rest.first() {
                    Some('*') => {
                        // zero-or-more of `literal`
                        let mut i = 0;
                        loop {
                            if matches_here(&rest[1..], &val[i..]) {
                                return true;
                            }
                            if i >= val.len() || (literal != '.' && val[i] != literal) {
                                break;
                            }
                            i += 1;
                        }
                        false
                    }
                    Some('+') => {
                        if val.is_empty() || (literal != '.' && val[0] != literal) {
                            return false;
                        }
                        let mut i = 1;
                        loop {
                            if matches_here(&rest[1..], &val[i..]) {
                                return true;
                            }
                            if i >= val.len() || (literal != '.' && val[i] != literal) {
                                break;
                            }
                            i += 1;
                        }
                        false
                    }
                    _ => {
                        if val.is_empty() || (literal != '.' && val[0] != literal) {
                            false
                        } else {
                            matches_here(rest, &val[1..])
                        }
                    }
                }
            }
        }
    }

    let anchored_start = pattern.starts_with('^');
    let pat: Vec<char> = pattern.trim_start_matches('^').chars().collect();
    let val: Vec<char> = value.chars().collect();

    if anchored_start {
        matches_here(&pat, &val)
    } else {
        (0..=val.len()).any(|start| matches_here(&pat, &val[start..]))
    }
}

/// Parse a `.env`-style template: `KEY=VALUE` lines, blank lines and `#`
/// comments ignored.
pub fn parse_dotenv(contents: &str) -> BTreeMap<String, String> {
    contents
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let (key, value) = line.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Render a rendered `.env` map back into `KEY=VALUE\n` lines, sorted by
/// key (`BTreeMap` iteration order).
pub fn format_dotenv(rendered: &BTreeMap<String, String>) -> String {
    rendered
        .iter()
        .map(|(k, v)| format!("{k}={v}\n"))
        .collect()
}

/// `render_dotenv(pkg, profile, option_values) -> map<string,string>`,
/// starting from a profile's `.env` template instead of an empty map: keys
/// the template sets and no option targets are carried through unchanged;
/// every option's resolved value is written to (or overrides) its target
/// key on top of the template.
pub fn render_dotenv_with_template(
    template: BTreeMap<String, String>,
    profile_options: &[OptionSpec],
    option_values: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, NodeError> {
    let mut rendered = template;
    rendered.extend(render_dotenv(profile_options, option_values)?);
    Ok(rendered)
}

/// `render_dotenv(pkg, profile, option_values) -> map<string,string>`.
///
/// For every declared option: use the supplied value (validated), else the
/// default, else (if not hidden) fail with `MissingRequiredOption`; hidden
/// options without a default map to the empty string.
pub fn render_dotenv(
    profile_options: &[OptionSpec],
    option_values: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, NodeError> {
    let mut rendered = BTreeMap::new();
    let mut problems = Vec::new();
    let mut missing = Vec::new();

    for spec in profile_options {
        let value = if let Some(supplied) = option_values.get(&spec.name) {
            if let Err(problem) = validate_value(spec, supplied) {
                problems.push(problem);
                continue;
            }
            supplied.clone()
        } else if let Some(default) = &spec.default {
            default.clone()
        } else if spec.hidden {
            String::new()
        } else {
            missing.push(spec.name.clone());
            continue;
        };

        rendered.insert(spec.env_key.clone(), value);
    }

    if missing.len() == 1 && problems.is_empty() {
        return Err(NodeError::MissingRequiredOption {
            option: missing.remove(0),
        });
    }

    if !missing.is_empty() {
        problems.extend(
            missing
                .into_iter()
                .map(|option| format!("missing required option: {option}")),
        );
    }

    if !problems.is_empty() {
        return Err(NodeError::InvalidConf { problems });
    }

    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OptionValidator;

    fn spec(name: &str, ty: OptionType) -> OptionSpec {
        OptionSpec {
            name: name.to_string(),
            env_key: name.to_uppercase(),
            option_type: ty,
            default: None,
            help: String::new(),
            validate: None,
            hidden: false,
        }
    }

    #[test]
    fn port_rejects_boundary_values() {
        let s = spec("p", OptionType::Port);
        assert!(validate_value(&s, "0").is_err());
        assert!(validate_value(&s, "65536").is_err());
        assert!(validate_value(&s, "1").is_ok());
        assert!(validate_value(&s, "65535").is_ok());
    }

    #[test]
    fn id_rejects_whitespace() {
        let s = spec("i", OptionType::Id);
        assert!(validate_value(&s, "has space").is_err());
        assert!(validate_value(&s, "no-space").is_ok());
    }

    #[test]
    fn select_without_options_list_is_invalid() {
        let s = spec("sel", OptionType::Select);
        assert!(validate_value(&s, "a").is_err());
    }

    #[test]
    fn select_validates_membership() {
        let mut s = spec("sel", OptionType::Select);
        s.validate = Some(OptionValidator {
            options: Some(vec!["a".into(), "b".into()]),
            ..Default::default()
        });
        assert!(validate_value(&s, "a").is_ok());
        assert!(validate_value(&s, "c").is_err());
    }

    #[test]
    fn uri_checks_scheme_set() {
        let mut s = spec("u", OptionType::Uri);
        s.validate = Some(OptionValidator {
            schemes: Some(vec!["https".into()]),
            ..Default::default()
        });
        assert!(validate_value(&s, "https://example.com").is_ok());
        assert!(validate_value(&s, "http://example.com").is_err());
    }

    #[test]
    fn render_dotenv_uses_defaults_then_fails_on_missing_required() {
        let mut with_default = spec("a", OptionType::Str);
        with_default.default = Some("d".into());
        let required = spec("b", OptionType::Str);
        let mut hidden = spec("c", OptionType::Str);
        hidden.hidden = true;

        let values = BTreeMap::new();
        let err = render_dotenv(&[with_default.clone(), required.clone()], &values).unwrap_err();
        assert!(matches!(err, NodeError::MissingRequiredOption { .. }));

        let rendered = render_dotenv(&[with_default, hidden], &values).unwrap();
        assert_eq!(rendered.get("A"), Some(&"d".to_string()));
        assert_eq!(rendered.get("C"), Some(&"".to_string()));
    }

    #[test]
    fn render_dotenv_aggregates_invalid_and_missing_options() {
        let port = spec("port", OptionType::Port);
        let required_a = spec("a", OptionType::Str);
        let required_b = spec("b", OptionType::Str);

        let mut values = BTreeMap::new();
        values.insert("port".to_string(), "0".to_string());

        let err = render_dotenv(&[port, required_a, required_b], &values).unwrap_err();
        let NodeError::InvalidConf { problems } = err else {
            panic!("expected InvalidConf, got {err:?}");
        };
        assert_eq!(problems.len(), 3);
        assert!(problems.iter().any(|p| p.contains('a')));
        assert!(problems.iter().any(|p| p.contains('b')));
    }

    #[test]
    fn render_dotenv_validates_supplied_values() {
        let port = spec("port", OptionType::Port);
        let mut values = BTreeMap::new();
        values.insert("port".to_string(), "0".to_string());
        let err = render_dotenv(&[port], &values).unwrap_err();
        assert!(matches!(err, NodeError::InvalidConf { .. }));
    }

    #[test]
    fn dotenv_template_round_trips() {
        let parsed = parse_dotenv("# comment\nFOO=bar\n\nBAZ=qux\n");
        assert_eq!(parsed.get("FOO"), Some(&"bar".to_string()));
        assert_eq!(parsed.get("BAZ"), Some(&"qux".to_string()));
        let formatted = format_dotenv(&parsed);
        assert_eq!(parse_dotenv(&formatted), parsed);
    }

    #[test]
    fn render_dotenv_with_template_overlays_options_onto_template() {
        let mut template = BTreeMap::new();
        template.insert("STATIC_KEY".to_string(), "static-value".to_string());
        template.insert("A".to_string(), "template-default".to_string());

        let mut option = spec("a", OptionType::Str);
        option.env_key = "A".to_string();
        option.default = Some("option-default".to_string());

        let rendered = render_dotenv_with_template(template, &[option], &BTreeMap::new()).unwrap();
        assert_eq!(rendered.get("STATIC_KEY"), Some(&"static-value".to_string()));
        assert_eq!(rendered.get("A"), Some(&"option-default".to_string()));
    }
}
