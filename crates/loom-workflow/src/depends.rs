//! `depends` expressions on DAG tasks: boolean logic over upstream results,
//! e.g. `A && (B.Failed || B.Errored)`. A bare task name means the task
//! succeeded or was skipped.

use std::collections::BTreeSet;

use crate::error::WorkflowError;
use crate::phase::NodePhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qualifier {
  Succeeded,
  Failed,
  Errored,
  Skipped,
  Omitted,
  Daemoned,
  /// Succeeded or Failed.
  Completed,
  /// At least one iteration of a task group succeeded.
  AnySucceeded,
  /// Every iteration of a task group failed.
  AllFailed,
}

impl Qualifier {
  fn parse(text: &str) -> Option<Self> {
    Some(match text {
      "Succeeded" => Qualifier::Succeeded,
      "Failed" => Qualifier::Failed,
      "Errored" => Qualifier::Errored,
      "Skipped" => Qualifier::Skipped,
      "Omitted" => Qualifier::Omitted,
      "Daemoned" => Qualifier::Daemoned,
      "Completed" => Qualifier::Completed,
      "AnySucceeded" => Qualifier::AnySucceeded,
      "AllFailed" => Qualifier::AllFailed,
      _ => return None,
    })
  }

  /// Whether the qualifier holds for a task in `phase` whose iterations (if
  /// any) ended in `children`.
  pub fn holds(qualifier: Option<Qualifier>, phase: NodePhase, children: &[NodePhase]) -> bool {
    match qualifier {
      None => phase.is_successful(),
      Some(Qualifier::Succeeded) => phase == NodePhase::Succeeded,
      Some(Qualifier::Failed) => phase == NodePhase::Failed,
      Some(Qualifier::Errored) => phase == NodePhase::Error,
      Some(Qualifier::Skipped) => phase == NodePhase::Skipped,
      Some(Qualifier::Omitted) => phase == NodePhase::Omitted,
      Some(Qualifier::Daemoned) => false,
      Some(Qualifier::Completed) => matches!(phase, NodePhase::Succeeded | NodePhase::Failed),
      Some(Qualifier::AnySucceeded) => children.contains(&NodePhase::Succeeded),
      Some(Qualifier::AllFailed) => {
        !children.is_empty() && children.iter().all(|p| *p == NodePhase::Failed)
      }
    }
  }

  /// Qualifiers that can be satisfied by a failed task.
  fn accepts_failure(self) -> bool {
    matches!(
      self,
      Qualifier::Failed | Qualifier::Errored | Qualifier::Completed | Qualifier::AllFailed
    )
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DependsExpr {
  Task {
    name: String,
    qualifier: Option<Qualifier>,
  },
  Not(Box<DependsExpr>),
  And(Box<DependsExpr>, Box<DependsExpr>),
  Or(Box<DependsExpr>, Box<DependsExpr>),
}

impl DependsExpr {
  pub fn parse(text: &str) -> Result<Self, WorkflowError> {
    let tokens = tokenize(text)?;
    let mut parser = Parser {
      tokens: &tokens,
      pos: 0,
      source: text,
    };
    let expr = parser.or()?;
    if parser.pos != tokens.len() {
      return Err(parser.error("unexpected trailing input"));
    }
    Ok(expr)
  }

  /// Every task the expression mentions.
  pub fn tasks(&self) -> BTreeSet<&str> {
    let mut out = BTreeSet::new();
    self.collect(&mut out);
    out
  }

  fn collect<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
    match self {
      DependsExpr::Task { name, .. } => {
        out.insert(name);
      }
      DependsExpr::Not(inner) => inner.collect(out),
      DependsExpr::And(l, r) | DependsExpr::Or(l, r) => {
        l.collect(out);
        r.collect(out);
      }
    }
  }

  pub fn evaluate(&self, holds: &impl Fn(&str, Option<Qualifier>) -> bool) -> bool {
    match self {
      DependsExpr::Task { name, qualifier } => holds(name, *qualifier),
      DependsExpr::Not(inner) => !inner.evaluate(holds),
      DependsExpr::And(l, r) => l.evaluate(holds) && r.evaluate(holds),
      DependsExpr::Or(l, r) => l.evaluate(holds) || r.evaluate(holds),
    }
  }

  /// Whether the expression explicitly reacts to `task` failing, which makes
  /// that failure part of the normal flow of the DAG.
  pub fn handles_failure_of(&self, task: &str) -> bool {
    match self {
      DependsExpr::Task { name, qualifier } => {
        name == task && qualifier.is_some_and(Qualifier::accepts_failure)
      }
      DependsExpr::Not(inner) => inner.tasks().contains(task),
      DependsExpr::And(l, r) | DependsExpr::Or(l, r) => {
        l.handles_failure_of(task) || r.handles_failure_of(task)
      }
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
  And,
  Or,
  Not,
  Open,
  Close,
  Task(String, Option<Qualifier>),
}

fn tokenize(text: &str) -> Result<Vec<Token>, WorkflowError> {
  let invalid = |reason: String| WorkflowError::InvalidDepends {
    expression: text.to_string(),
    reason,
  };
  let is_ident = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';

  let chars: Vec<char> = text.chars().collect();
  let mut tokens = Vec::new();
  let mut i = 0;
  while i < chars.len() {
    let c = chars[i];
    match c {
      ' ' | '\t' | '\n' | '\r' => i += 1,
      '&' if chars.get(i + 1) == Some(&'&') => {
        tokens.push(Token::And);
        i += 2;
      }
      '|' if chars.get(i + 1) == Some(&'|') => {
        tokens.push(Token::Or);
        i += 2;
      }
      '!' => {
        tokens.push(Token::Not);
        i += 1;
      }
      '(' => {
        tokens.push(Token::Open);
        i += 1;
      }
      ')' => {
        tokens.push(Token::Close);
        i += 1;
      }
      c if is_ident(c) => {
        let start = i;
        while i < chars.len() && is_ident(chars[i]) {
          i += 1;
        }
        let name: String = chars[start..i].iter().collect();
        let mut qualifier = None;
        if chars.get(i) == Some(&'.') {
          i += 1;
          let q_start = i;
          while i < chars.len() && chars[i].is_ascii_alphabetic() {
            i += 1;
          }
          let q: String = chars[q_start..i].iter().collect();
          qualifier =
            Some(Qualifier::parse(&q).ok_or_else(|| invalid(format!("unknown result '{q}'")))?);
        }
        tokens.push(Token::Task(name, qualifier));
      }
      other => return Err(invalid(format!("unexpected character '{other}'"))),
    }
  }
  Ok(tokens)
}

struct Parser<'a> {
  tokens: &'a [Token],
  pos: usize,
  source: &'a str,
}

impl Parser<'_> {
  fn error(&self, reason: &str) -> WorkflowError {
    WorkflowError::InvalidDepends {
      expression: self.source.to_string(),
      reason: reason.to_string(),
    }
  }

  fn peek(&self) -> Option<&Token> {
    self.tokens.get(self.pos)
  }

  fn or(&mut self) -> Result<DependsExpr, WorkflowError> {
    let mut left = self.and()?;
    while self.peek() == Some(&Token::Or) {
      self.pos += 1;
      let right = self.and()?;
      left = DependsExpr::Or(Box::new(left), Box::new(right));
    }
    Ok(left)
  }

  fn and(&mut self) -> Result<DependsExpr, WorkflowError> {
    let mut left = self.unary()?;
    while self.peek() == Some(&Token::And) {
      self.pos += 1;
      let right = self.unary()?;
      left = DependsExpr::And(Box::new(left), Box::new(right));
    }
    Ok(left)
  }

  fn unary(&mut self) -> Result<DependsExpr, WorkflowError> {
    match self.peek().cloned() {
      Some(Token::Not) => {
        self.pos += 1;
        Ok(DependsExpr::Not(Box::new(self.unary()?)))
      }
      Some(Token::Open) => {
        self.pos += 1;
        let inner = self.or()?;
        if self.peek() != Some(&Token::Close) {
          return Err(self.error("missing ')'"));
        }
        self.pos += 1;
        Ok(inner)
      }
      Some(Token::Task(name, qualifier)) => {
        self.pos += 1;
        Ok(DependsExpr::Task { name, qualifier })
      }
      Some(_) => Err(self.error("expected a task name")),
      None => Err(self.error("unexpected end of expression")),
    }
  }
}
