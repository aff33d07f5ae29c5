//! Command-line argument grammar: `tapdance <toolName> --param value ...`.
//!
//! Values parse as JSON when they can (numbers, booleans, arrays, objects)
//! and fall back to plain strings, so `--x 300` is a number, `--exact true`
//! a boolean, and `--text "hello world"` a string.

use serde_json::{Map, Value};

#[derive(Debug, PartialEq)]
pub enum Invocation {
    Help { tool: Option<String> },
    Call { tool: String, params: Value },
}

pub fn parse_invocation(args: &[String]) -> Result<Invocation, String> {
    let Some(first) = args.first() else {
        return Ok(Invocation::Help { tool: None });
    };
    match first.as_str() {
        "help" | "-h" | "--help" => {
            return Ok(Invocation::Help {
                tool: args.get(1).cloned(),
            });
        }
        name if name.starts_with('-') => {
            return Err(format!("expected a tool name, got '{name}' (try 'help')"));
        }
        _ => {}
    }

    let mut params = Map::new();
    let mut iter = args[1..].iter();
    while let Some(arg) = iter.next() {
        let Some(key) = arg.strip_prefix("--") else {
            return Err(format!("expected '--param', got '{arg}'"));
        };
        if key.is_empty() {
            return Err("empty parameter name".to_string());
        }
        let value = iter
            .next()
            .ok_or_else(|| format!("parameter '--{key}' is missing a value"))?;
        params.insert(key.to_string(), parse_value(value));
    }

    Ok(Invocation::Call {
        tool: first.clone(),
        params: Value::Object(params),
    })
}

/// JSON when it parses, string otherwise.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
