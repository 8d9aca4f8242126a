//! Script bodies for templates stored on disk.
//!
//! Each directive maps onto one engine operation:
//!
//! ```text
//! {% extends "layout" %}        extend("layout")
//! {% block title "Home" %}      block("title", "Home")
//! {% block sidebar %}           begin(Some("sidebar"))
//! {% block %}                   begin(None)
//! {% endblock %}                endblock()
//! {% endblock h %}              endblock_with(filter "h")
//! {% endescape %}               endescape()
//! {% yield title %}             emit the block "title", or nothing
//! {{ user }}                    emit the variable "user"
//! ```
//!
//! A newline directly following `%}` is dropped.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::error::{TemplateError, TemplateResult};
use crate::loader::TemplateBody;
use crate::template::Template;

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*(?P<var>.*?)\s*\}\}|\{%\s*(?P<tag>.*?)\s*%\}")
            .expect("tag pattern is valid")
    })
}

fn ident_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_.\-]*$").expect("identifier pattern is valid")
    })
}

/// A single script operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Text(String),
    Print(String),
    Extend(String),
    Begin(Option<String>),
    Assign { name: String, value: String },
    End(Option<String>),
    EndEscape,
    Yield(String),
}

/// A parsed template script.
#[derive(Debug, Clone)]
pub struct Script {
    path: PathBuf,
    instructions: Vec<(usize, Instruction)>,
}

impl Script {
    /// Parse `source`. `path` is only used for error reporting.
    pub fn parse(path: &Path, source: &str) -> TemplateResult<Self> {
        let mut parser = Parser {
            path,
            line: 1,
            depth: 0,
            instructions: Vec::new(),
        };
        parser.run(source)?;

        debug!(
            "Parsed {:?}: {} instructions",
            path,
            parser.instructions.len()
        );
        Ok(Self {
            path: path.to_path_buf(),
            instructions: parser.instructions,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.instructions.iter().map(|(_, instruction)| instruction)
    }

    fn runtime_error(&self, line: usize, error: TemplateError) -> TemplateError {
        match error {
            TemplateError::InvalidOperation(message) => TemplateError::InvalidOperation(format!(
                "{} ({:?} line {})",
                message, self.path, line
            )),
            other => other,
        }
    }
}

struct Parser<'a> {
    path: &'a Path,
    line: usize,
    depth: usize,
    instructions: Vec<(usize, Instruction)>,
}

impl Parser<'_> {
    fn syntax(&self, message: impl Into<String>) -> TemplateError {
        TemplateError::Syntax {
            path: self.path.to_path_buf(),
            line: self.line,
            message: message.into(),
        }
    }

    fn run(&mut self, source: &str) -> TemplateResult<()> {
        let mut cursor = 0;
        let mut trim_newline = false;

        for caps in tag_pattern().captures_iter(source) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            self.text(&source[cursor..whole.start()], trim_newline)?;

            if let Some(var) = caps.name("var") {
                let name = var.as_str();
                if !ident_pattern().is_match(name) {
                    return Err(self.syntax(format!("invalid variable name '{}'", name)));
                }
                self.push(Instruction::Print(name.to_string()));
                trim_newline = false;
            } else if let Some(tag) = caps.name("tag") {
                let instruction = self.directive(tag.as_str())?;
                self.push(instruction);
                trim_newline = true;
            }

            self.line += whole.as_str().matches('\n').count();
            cursor = whole.end();
        }
        self.text(&source[cursor..], trim_newline)?;

        if self.depth > 0 {
            return Err(self.syntax(format!("{} block(s) never closed", self.depth)));
        }
        Ok(())
    }

    fn push(&mut self, instruction: Instruction) {
        self.instructions.push((self.line, instruction));
    }

    fn text(&mut self, text: &str, trim_newline: bool) -> TemplateResult<()> {
        let text = match text
            .strip_prefix("\r\n")
            .or_else(|| text.strip_prefix('\n'))
        {
            Some(rest) if trim_newline => {
                self.line += 1;
                rest
            }
            _ => text,
        };

        if let Some(offset) = text.find("{%").or_else(|| text.find("{{")) {
            self.line += text[..offset].matches('\n').count();
            return Err(self.syntax("unterminated tag"));
        }

        if !text.is_empty() {
            self.push(Instruction::Text(text.to_string()));
        }
        self.line += text.matches('\n').count();
        Ok(())
    }

    fn directive(&mut self, tag: &str) -> TemplateResult<Instruction> {
        let (keyword, rest) = match tag.split_once(char::is_whitespace) {
            Some((keyword, rest)) => (keyword, rest.trim()),
            None => (tag, ""),
        };

        match keyword {
            "extends" | "extend" => {
                let name = parse_quoted(rest)
                    .or_else(|| self.ident(rest).ok())
                    .ok_or_else(|| self.syntax("extends expects a template name"))?;
                Ok(Instruction::Extend(name))
            }
            "block" => {
                if rest.is_empty() {
                    self.depth += 1;
                    return Ok(Instruction::Begin(None));
                }
                match rest.split_once(char::is_whitespace) {
                    Some((name, value)) => {
                        let name = self.ident(name)?;
                        let value = parse_quoted(value.trim())
                            .ok_or_else(|| self.syntax("block value must be a quoted string"))?;
                        Ok(Instruction::Assign { name, value })
                    }
                    None => {
                        let name = self.ident(rest)?;
                        self.depth += 1;
                        Ok(Instruction::Begin(Some(name)))
                    }
                }
            }
            "endblock" | "endescape" => {
                if self.depth == 0 {
                    return Err(self.syntax(format!("{} without an open block", keyword)));
                }
                self.depth -= 1;
                if keyword == "endescape" {
                    if !rest.is_empty() {
                        return Err(self.syntax("endescape takes no arguments"));
                    }
                    return Ok(Instruction::EndEscape);
                }
                if rest.is_empty() {
                    Ok(Instruction::End(None))
                } else {
                    Ok(Instruction::End(Some(self.ident(rest)?)))
                }
            }
            "yield" => Ok(Instruction::Yield(self.ident(rest)?)),
            "" => Err(self.syntax("empty tag")),
            other => Err(self.syntax(format!("unknown directive '{}'", other))),
        }
    }

    fn ident(&self, text: &str) -> TemplateResult<String> {
        if ident_pattern().is_match(text) {
            Ok(text.to_string())
        } else {
            Err(self.syntax(format!("invalid name '{}'", text)))
        }
    }
}

/// Parse a single- or double-quoted string with backslash escapes.
fn parse_quoted(text: &str) -> Option<String> {
    let quote = text.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let inner = text.strip_prefix(quote)?.strip_suffix(quote)?;

    let mut value = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next()? {
                'n' => value.push('\n'),
                't' => value.push('\t'),
                escaped => value.push(escaped),
            },
            c if c == quote => return None,
            c => value.push(c),
        }
    }
    Some(value)
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl TemplateBody for Script {
    fn execute(&self, template: &mut Template) -> TemplateResult<()> {
        for (line, instruction) in &self.instructions {
            let line = *line;
            match instruction {
                Instruction::Text(text) => template.emit(text),
                Instruction::Print(name) => match template.var_opt(name) {
                    Some(value) => template.emit(&value_to_text(&value)),
                    None if template.strict_variables() => {
                        return Err(TemplateError::MissingVariable(format!(
                            "{} ({:?} line {})",
                            name, self.path, line
                        )));
                    }
                    None => debug!("Variable {} not set, rendering empty", name),
                },
                Instruction::Extend(name) => template.extend(name),
                Instruction::Begin(name) => template.begin(name.as_deref()),
                Instruction::Assign { name, value } => template
                    .block(name, value.as_str())
                    .map_err(|e| self.runtime_error(line, e))?,
                Instruction::End(None) => {
                    template
                        .endblock()
                        .map_err(|e| self.runtime_error(line, e))?;
                }
                Instruction::End(Some(filter_name)) => {
                    let filter = template.filter(filter_name).ok_or_else(|| {
                        TemplateError::InvalidOperation(format!(
                            "unknown filter '{}' ({:?} line {})",
                            filter_name, self.path, line
                        ))
                    })?;
                    template
                        .endblock_with(|content| filter(content))
                        .map_err(|e| self.runtime_error(line, e))?;
                }
                Instruction::EndEscape => {
                    template
                        .endescape()
                        .map_err(|e| self.runtime_error(line, e))?;
                }
                Instruction::Yield(name) => {
                    let content = template.block_content(name).to_string();
                    template.emit(&content);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Variables;

    fn parse(source: &str) -> TemplateResult<Script> {
        Script::parse(Path::new("test.tpl"), source)
    }

    fn run(source: &str) -> TemplateResult<(String, Template)> {
        let script = parse(source)?;
        let mut template = Template::new(None::<PathBuf>);
        script.execute(&mut template)?;
        let output = template.output().to_string();
        Ok((output, template))
    }

    #[test]
    fn test_parse_directives() {
        let script = parse(
            "{% extends \"layout\" %}\n{% block title \"Home\" %}\n{% block body %}Hi {{ name }}{% endblock h %}\n{% yield title %}",
        )
        .unwrap();

        let instructions: Vec<_> = script.instructions().cloned().collect();
        assert_eq!(
            instructions,
            vec![
                Instruction::Extend("layout".to_string()),
                Instruction::Assign {
                    name: "title".to_string(),
                    value: "Home".to_string()
                },
                Instruction::Begin(Some("body".to_string())),
                Instruction::Text("Hi ".to_string()),
                Instruction::Print("name".to_string()),
                Instruction::End(Some("h".to_string())),
                Instruction::Yield("title".to_string()),
            ]
        );
    }

    #[test]
    fn test_newline_after_tag_is_dropped() {
        let (output, _) = run("a\n{% block x \"1\" %}\nb\n").unwrap();
        assert_eq!(output, "a\nb\n");
    }

    #[test]
    fn test_unknown_directive() {
        let err = parse("line one\n{% loop x %}").unwrap_err();
        match err {
            TemplateError::Syntax { line, message, .. } => {
                assert_eq!(line, 2);
                assert!(message.contains("loop"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unbalanced_blocks() {
        assert!(matches!(
            parse("{% block a %}text"),
            Err(TemplateError::Syntax { .. })
        ));
        assert!(matches!(
            parse("{% endblock %}"),
            Err(TemplateError::Syntax { .. })
        ));
    }

    #[test]
    fn test_unterminated_tag() {
        assert!(matches!(
            parse("hello {% block"),
            Err(TemplateError::Syntax { .. })
        ));
    }

    #[test]
    fn test_assign_requires_quoted_value() {
        assert!(matches!(
            parse("{% block title Home %}"),
            Err(TemplateError::Syntax { .. })
        ));
    }

    #[test]
    fn test_quoted_escapes() {
        assert_eq!(parse_quoted(r#""a \"b\" c""#), Some("a \"b\" c".to_string()));
        assert_eq!(parse_quoted("'it\\'s'"), Some("it's".to_string()));
        assert_eq!(parse_quoted("\"open"), None);
        assert_eq!(parse_quoted("bare"), None);
    }

    #[test]
    fn test_execute_nested_and_filtered() {
        let (output, template) = run(
            "{% block outer %}X{% block inner %}Y{% endblock %}Z{% endblock %}{% block %}<b>{% endescape %}",
        )
        .unwrap();

        assert_eq!(template.block_content("outer"), "XYZ");
        assert_eq!(template.block_content("inner"), "Y");
        assert_eq!(output, "&lt;b&gt;");
    }

    #[test]
    fn test_print_missing_variable_is_strict_without_environment() {
        let err = run("{{ missing }}").unwrap_err();
        assert!(matches!(err, TemplateError::MissingVariable(_)));
    }

    #[test]
    fn test_print_non_string_values() {
        let script = parse("{{ n }}|{{ flag }}|{{ nothing }}").unwrap();
        let mut template = Template::new(None::<PathBuf>);
        template.set_local("n", 3);
        template.set_local("flag", true);
        template.set_local("nothing", Value::Null);
        script.execute(&mut template).unwrap();
        assert_eq!(template.output(), "3|true|");
        assert_eq!(template.render(Variables::new()).unwrap(), "3|true|");
    }

    #[test]
    fn test_unknown_filter_fails_at_runtime() {
        let err = run("{% block x %}a{% endblock shout %}").unwrap_err();
        assert!(matches!(err, TemplateError::InvalidOperation(_)));
    }
}
