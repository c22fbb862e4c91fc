//! `when` conditions, evaluated after substitution: `heads == heads`,
//! `{{item}} > 2 && {{inputs.parameters.x}} != skip`.
//!
//! Bare words are string literals, numbers compare numerically. The
//! condition is rewritten into a minijinja expression and evaluated there.

use crate::scope::Renderer;

#[derive(Debug, PartialEq)]
enum Token {
  Open,
  Close,
  And,
  Or,
  Not,
  Compare(&'static str),
  Literal(String),
}

const OPERATOR_CHARS: &[char] = &['(', ')', '!', '=', '<', '>', '&', '|'];

fn tokenize(text: &str) -> Result<Vec<Token>, String> {
  let chars: Vec<char> = text.chars().collect();
  let mut tokens = Vec::new();
  let mut i = 0;
  while i < chars.len() {
    let c = chars[i];
    let next = chars.get(i + 1).copied();
    let (token, width) = match (c, next) {
      (c, _) if c.is_whitespace() => {
        i += 1;
        continue;
      }
      ('(', _) => (Token::Open, 1),
      (')', _) => (Token::Close, 1),
      ('&', Some('&')) => (Token::And, 2),
      ('|', Some('|')) => (Token::Or, 2),
      ('!', Some('=')) => (Token::Compare("!="), 2),
      ('!', _) => (Token::Not, 1),
      ('=', Some('=')) => (Token::Compare("=="), 2),
      ('<', Some('=')) => (Token::Compare("<="), 2),
      ('>', Some('=')) => (Token::Compare(">="), 2),
      ('<', _) => (Token::Compare("<"), 1),
      ('>', _) => (Token::Compare(">"), 1),
      ('\'' | '"', _) => {
        let end = chars[i + 1..]
          .iter()
          .position(|x| *x == c)
          .ok_or_else(|| format!("unterminated string in '{text}'"))?;
        let literal: String = chars[i + 1..i + 1 + end].iter().collect();
        (Token::Literal(quote(&literal)), end + 2)
      }
      (c, _) if OPERATOR_CHARS.contains(&c) => {
        return Err(format!("unexpected '{c}' in '{text}'"));
      }
      _ => {
        let len = chars[i..]
          .iter()
          .position(|x| x.is_whitespace() || OPERATOR_CHARS.contains(x))
          .unwrap_or(chars.len() - i);
        let word: String = chars[i..i + len].iter().collect();
        (Token::Literal(literal(&word)), len)
      }
    };
    tokens.push(token);
    i += width;
  }
  Ok(tokens)
}

fn quote(text: &str) -> String {
  serde_json::Value::String(text.to_string()).to_string()
}

fn literal(word: &str) -> String {
  match word {
    "true" | "True" => "true".to_string(),
    "false" | "False" => "false".to_string(),
    _ if word.parse::<f64>().is_ok_and(f64::is_finite) => word.to_string(),
    _ => quote(word),
  }
}

/// Evaluate a substituted `when` condition.
pub fn evaluate(renderer: &Renderer, text: &str) -> Result<bool, String> {
  let tokens = tokenize(text)?;
  if tokens.is_empty() {
    return Err("empty condition".to_string());
  }
  let expression: Vec<String> = tokens
    .into_iter()
    .map(|t| match t {
      Token::Open => "(".to_string(),
      Token::Close => ")".to_string(),
      Token::And => "and".to_string(),
      Token::Or => "or".to_string(),
      Token::Not => "not".to_string(),
      Token::Compare(op) => op.to_string(),
      Token::Literal(l) => l,
    })
    .collect();
  renderer
    .truthy(&expression.join(" "))
    .map_err(|e| format!("invalid when condition '{text}': {e}"))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn eval(text: &str) -> Result<bool, String> {
    evaluate(&Renderer::new(), text)
  }

  #[test]
  fn test_bare_words_compare_as_strings() {
    assert_eq!(eval("heads == heads"), Ok(true));
    assert_eq!(eval("tails == heads"), Ok(false));
    assert_eq!(eval("tails != heads"), Ok(true));
    assert_eq!(eval("'two words' == \"two words\""), Ok(true));
  }

  #[test]
  fn test_numbers_and_logic() {
    assert_eq!(eval("3 > 2 && 1 <= 1"), Ok(true));
    assert_eq!(eval("3 < 2 || !(a == b)"), Ok(true));
    assert_eq!(eval("true"), Ok(true));
    assert_eq!(eval("false || false"), Ok(false));
  }

  #[test]
  fn test_syntax_errors() {
    assert!(eval("").is_err());
    assert!(eval("a = b").is_err());
    assert!(eval("(a == b").is_err());
    assert!(eval("'open == b").is_err());
  }
}
