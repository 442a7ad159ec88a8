//! Model definition document parser.
//!
//! Grammar: one directive per line — `FROM`, `PARAMETER`, `TEMPLATE`,
//! `SYSTEM`, `ADAPTER`, `LICENSE` — `#` line comments, and triple-quoted
//! (`"""`) multi-line string values that may span several lines. Line
//! scanning is grounded on the teacher's straightforward buffered-reader
//! parsing idiom (e.g. `web/model_manager.rs`'s GGUF metadata scan); the
//! grammar itself comes from the spec.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "modelfile parse error at {}:{}: {}",
            self.line, self.column, self.message
        )
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    String(String),
    Int(i64),
    Float(f64),
}

#[derive(Debug, Clone, Default)]
pub struct ModelDefinition {
    pub from: Option<String>,
    pub parameters: Vec<(String, ParameterValue)>,
    pub template: Option<String>,
    pub system: Option<String>,
    pub adapters: Vec<String>,
    pub license: Vec<String>,
}

const KNOWN_INT_KEYS: &[&str] = &[
    "num_ctx",
    "num_predict",
    "top_k",
    "seed",
    "penalty_last_n",
    "mirostat",
];
const KNOWN_FLOAT_KEYS: &[&str] = &[
    "temperature",
    "top_p",
    "min_p",
    "typical_p",
    "repeat_penalty",
    "frequency_penalty",
    "presence_penalty",
    "mirostat_tau",
    "mirostat_eta",
];

/// Parses a complete Modelfile document. `stop` parameters may repeat; every
/// other directive is single-valued except `ADAPTER`, which may also repeat
/// (multiple LoRA layers applied in the order they appear).
pub fn parse(source: &str) -> Result<ModelDefinition, ParseError> {
    let mut def = ModelDefinition::default();
    let lines: Vec<&str> = source.lines().collect();
    let mut i = 0;

    while i < lines.len() {
        let line_no = i + 1;
        let raw = lines[i];
        let trimmed = raw.trim_start();

        if trimmed.is_empty() || trimmed.starts_with('#') {
            i += 1;
            continue;
        }

        let (directive, rest) = split_directive(trimmed);
        let directive_upper = directive.to_ascii_uppercase();

        let (value, consumed) = if rest.trim_start().starts_with(r#"""""#) {
            read_triple_quoted(&lines, i, rest, line_no)?
        } else {
            (rest.trim().to_string(), 1)
        };

        match directive_upper.as_str() {
            "FROM" => def.from = Some(value),
            "TEMPLATE" => def.template = Some(value),
            "SYSTEM" => def.system = Some(value),
            "ADAPTER" => def.adapters.push(value),
            "LICENSE" => def.license.push(value),
            "PARAMETER" => {
                let (key, val) = split_directive(&value);
                let val = val.trim().to_string();
                if key.is_empty() {
                    return Err(ParseError {
                        line: line_no,
                        column: 1,
                        message: "PARAMETER requires a key and a value".to_string(),
                    });
                }
                def.parameters.push((key.to_string(), coerce_value(key, &val)));
            }
            other => {
                return Err(ParseError {
                    line: line_no,
                    column: 1,
                    message: format!("unknown directive: {other}"),
                });
            }
        }

        i += consumed;
    }

    if def.from.is_none() {
        return Err(ParseError {
            line: 0,
            column: 0,
            message: "missing required FROM directive".to_string(),
        });
    }

    Ok(def)
}

fn split_directive(line: &str) -> (&str, &str) {
    match line.find(char::is_whitespace) {
        Some(idx) => (&line[..idx], &line[idx..]),
        None => (line, ""),
    }
}

fn coerce_value(key: &str, raw: &str) -> ParameterValue {
    if KNOWN_INT_KEYS.contains(&key) {
        if let Ok(n) = raw.parse::<i64>() {
            return ParameterValue::Int(n);
        }
    }
    if KNOWN_FLOAT_KEYS.contains(&key) {
        if let Ok(f) = raw.parse::<f64>() {
            return ParameterValue::Float(f);
        }
    }
    ParameterValue::String(raw.trim_matches('"').to_string())
}

/// Reads a (possibly multi-line) triple-quoted value starting on `lines[start]`.
/// Returns the unquoted value and the number of source lines it consumed.
fn read_triple_quoted(
    lines: &[&str],
    start: usize,
    first_rest: &str,
    opening_line: usize,
) -> Result<(String, usize), ParseError> {
    let first_rest = first_rest.trim_start();
    let after_open = &first_rest[3..];

    // Single-line block: `"""value"""`
    if let Some(end) = after_open.find(r#"""""#) {
        return Ok((after_open[..end].to_string(), 1));
    }

    let mut value = String::from(after_open);
    let mut idx = start + 1;
    while idx < lines.len() {
        let line = lines[idx];
        if let Some(end) = line.find(r#"""""#) {
            value.push('\n');
            value.push_str(&line[..end]);
            return Ok((value.trim_matches('\n').to_string(), idx - start + 1));
        }
        value.push('\n');
        value.push_str(line);
        idx += 1;
    }

    Err(ParseError {
        line: opening_line,
        column: 1,
        message: "unterminated triple-quoted string".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_modelfile() {
        let def = parse("FROM llama3.gguf\n").unwrap();
        assert_eq!(def.from.as_deref(), Some("llama3.gguf"));
    }

    #[test]
    fn missing_from_is_an_error() {
        let err = parse("PARAMETER temperature 0.8\n").unwrap_err();
        assert!(err.message.contains("FROM"));
    }

    #[test]
    fn parses_parameters_with_known_types() {
        let def = parse(
            "FROM llama3.gguf\nPARAMETER temperature 0.7\nPARAMETER num_ctx 4096\nPARAMETER stop <|eot|>\n",
        )
        .unwrap();
        assert_eq!(
            def.parameters,
            vec![
                ("temperature".to_string(), ParameterValue::Float(0.7)),
                ("num_ctx".to_string(), ParameterValue::Int(4096)),
                ("stop".to_string(), ParameterValue::String("<|eot|>".to_string())),
            ]
        );
    }

    #[test]
    fn repeated_stop_parameters_are_all_kept() {
        let def = parse(
            "FROM llama3.gguf\nPARAMETER stop <|a|>\nPARAMETER stop <|b|>\n",
        )
        .unwrap();
        let stops: Vec<_> = def
            .parameters
            .iter()
            .filter(|(k, _)| k == "stop")
            .collect();
        assert_eq!(stops.len(), 2);
    }

    #[test]
    fn parses_triple_quoted_multiline_system() {
        let source = "FROM llama3.gguf\nSYSTEM \"\"\"\nYou are a helpful assistant.\nBe concise.\n\"\"\"\n";
        let def = parse(source).unwrap();
        assert_eq!(
            def.system.as_deref(),
            Some("You are a helpful assistant.\nBe concise.")
        );
    }

    #[test]
    fn unterminated_triple_quote_names_opening_line() {
        let source = "FROM llama3.gguf\nSYSTEM \"\"\"\nno closing quotes here\n";
        let err = parse(source).unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn multiple_adapters_preserve_order() {
        let def = parse("FROM llama3.gguf\nADAPTER lora-a.bin\nADAPTER lora-b.bin\n").unwrap();
        assert_eq!(def.adapters, vec!["lora-a.bin", "lora-b.bin"]);
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let def = parse("# comment\nFROM llama3.gguf\n\n# another\n").unwrap();
        assert_eq!(def.from.as_deref(), Some("llama3.gguf"));
    }

    #[test]
    fn unknown_directive_is_an_error() {
        let err = parse("FROM llama3.gguf\nBOGUS x\n").unwrap_err();
        assert!(err.message.contains("unknown directive"));
    }
}
