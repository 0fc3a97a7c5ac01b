//! Tokenizes a free-form command argument string and validates it against
//! a command's declared parameter schema.
//!
//! Mirrors the source's `argparse` + `shlex.split` combination: a schema
//! violation is printed to stdout (matching the source's captured-stderr
//! behavior) and returns `Err`, never aborts the host process.

use std::collections::HashMap;

use crate::duration::{parse_duration, Duration};
use crate::error::HarnessError;

/// The handful of value kinds every command schema in this harness needs.
#[derive(Clone, Copy, Debug)]
pub enum ParamType {
    Str,
    Int,
    Choice(&'static [&'static str]),
    Duration,
}

#[derive(Clone, Copy, Debug)]
pub struct ParamSpec {
    pub name: &'static str,
    pub ty: ParamType,
    pub required: bool,
}

/// A command's declared parameter schema: named `--flag value` pairs plus
/// an optional trailing variadic flag (`loop`'s `--command-args`) that
/// swallows every token after it, whatever it looks like.
pub struct Schema {
    pub params: &'static [ParamSpec],
    pub variadic: Option<&'static str>,
}

#[derive(Clone, Debug)]
enum ParamValue {
    Str(String),
    Int(i64),
    Duration(Duration),
}

/// The populated parameter record produced by a successful [`parse`].
#[derive(Default, Debug)]
pub struct ParsedArgs {
    values: HashMap<String, ParamValue>,
    pub variadic: Vec<String>,
}

impl ParsedArgs {
    pub fn str(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(ParamValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        match self.values.get(name) {
            Some(ParamValue::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn duration(&self, name: &str) -> Option<Duration> {
        match self.values.get(name) {
            Some(ParamValue::Duration(d)) => Some(*d),
            _ => None,
        }
    }
}

/// Split-word tokenizer with shell-style quoting: backslash escapes, and
/// single/double quotes that preserve embedded spaces. No other shell
/// features (globbing, `$VAR`, pipes) are recognized — this only needs to
/// undo the quoting a human would type at the debugger prompt.
pub fn tokenize(s: &str) -> Result<Vec<String>, HarnessError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' | '\n' if !in_token => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            ' ' | '\t' | '\n' => current.push(c),
            '\\' => {
                in_token = true;
                match chars.next() {
                    Some(next) => current.push(next),
                    None => {
                        return Err(HarnessError::user_input(
                            "dangling backslash escape at end of input",
                        ))
                    }
                }
            }
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(next) => current.push(next),
                        None => return Err(HarnessError::user_input("unterminated single quote")),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(next @ ('"' | '\\')) => current.push(next),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => {
                                return Err(HarnessError::user_input("unterminated double quote"))
                            }
                        },
                        Some(next) => current.push(next),
                        None => return Err(HarnessError::user_input("unterminated double quote")),
                    }
                }
            }
            other => {
                in_token = true;
                current.push(other);
            }
        }
    }

    if !current.is_empty() {
        tokens.push(current);
    }

    Ok(tokens)
}

/// Validate `args_str` against `schema`, printing a human-readable
/// diagnostic (mirroring the source's captured-and-printed argparse error)
/// and returning `Err` on any schema violation. Never panics, never exits.
pub fn parse(schema: &Schema, args_str: &str) -> Result<ParsedArgs, HarnessError> {
    match parse_inner(schema, args_str) {
        Ok(parsed) => Ok(parsed),
        Err(e) => {
            println!("{}", e);
            Err(e)
        }
    }
}

fn parse_inner(schema: &Schema, args_str: &str) -> Result<ParsedArgs, HarnessError> {
    let tokens = tokenize(args_str)?;
    let mut values = HashMap::new();
    let mut variadic = Vec::new();

    let mut i = 0;
    while i < tokens.len() {
        let tok = &tokens[i];
        let name = tok.strip_prefix("--").ok_or_else(|| {
            HarnessError::user_input(format!("unexpected argument: {:?}", tok))
        })?;

        if schema.variadic == Some(name) {
            variadic = tokens[i + 1..].to_vec();
            i = tokens.len();
            break;
        }

        let spec = schema
            .params
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| HarnessError::user_input(format!("unrecognized argument: --{}", name)))?;

        i += 1;
        let raw = tokens.get(i).ok_or_else(|| {
            HarnessError::user_input(format!("argument --{} expects a value", name))
        })?;

        let value = match spec.ty {
            ParamType::Str => ParamValue::Str(raw.clone()),
            ParamType::Int => ParamValue::Int(raw.parse::<i64>().map_err(|_| {
                HarnessError::user_input(format!("argument --{}: invalid integer value: {:?}", name, raw))
            })?),
            ParamType::Choice(choices) => {
                if !choices.contains(&raw.as_str()) {
                    return Err(HarnessError::user_input(format!(
                        "argument --{}: invalid choice: {:?} (choose from {:?})",
                        name, raw, choices
                    )));
                }
                ParamValue::Str(raw.clone())
            }
            ParamType::Duration => ParamValue::Duration(parse_duration(raw)?),
        };

        values.insert(name.to_string(), value);
        i += 1;
    }

    for spec in schema.params {
        if spec.required && !values.contains_key(spec.name) {
            return Err(HarnessError::user_input(format!(
                "the following arguments are required: --{}",
                spec.name
            )));
        }
    }

    Ok(ParsedArgs { values, variadic })
}

/// Split the leading whitespace-delimited word off a command line, the way
/// the debugger shell splits a command name from its argument string.
pub fn split_leading_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(idx) => (&s[..idx], s[idx..].trim_start()),
        None => (s, ""),
    }
}
