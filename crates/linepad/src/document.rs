//! Line-structured documents and the edit operations that mutate them.
//!
//! A [`Document`] is an ordered list of lines. It always holds at least one
//! line and no line contains a line separator. Columns count characters,
//! not bytes.
//!
//! Operations are validated against the current state and either applied
//! completely or rejected without touching the document. Nothing here
//! transforms one operation against another: two participants editing the
//! same spot are applied in whatever order they reach the server.

use crate::error::{ProtocolError, Rejection};
use serde::{Deserialize, Serialize};

/// A column/line pair. Signed because clients may send anything; negative
/// values never pass validation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: i64,
    pub y: i64,
}

impl Position {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

/// A single edit to a document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireOperation", into = "WireOperation")]
pub enum Operation {
    /// Insert `ch` before column `x` of line `y`.
    Insert { x: i64, y: i64, ch: char },
    /// Remove the character at column `x` of line `y`.
    Delete { x: i64, y: i64 },
    /// Split line `y` at column `x`.
    InsertNewline { x: i64, y: i64 },
    /// Join line `y` onto the end of line `y - 1`.
    DeleteNewline { y: i64 },
}

impl Operation {
    /// The wire name of this operation.
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Insert { .. } => OperationKind::Insert,
            Operation::Delete { .. } => OperationKind::Delete,
            Operation::InsertNewline { .. } => OperationKind::InsertNewline,
            Operation::DeleteNewline { .. } => OperationKind::DeleteNewline,
        }
    }

    pub fn position(&self) -> Position {
        match *self {
            Operation::Insert { x, y, .. }
            | Operation::Delete { x, y }
            | Operation::InsertNewline { x, y } => Position::new(x, y),
            Operation::DeleteNewline { y } => Position::new(0, y),
        }
    }
}

/// Operation tags as they appear in the `type` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Delete,
    InsertNewline,
    DeleteNewline,
}

/// Wire shape of an operation payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireOperation {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub position: Position,
    #[serde(default)]
    pub character: String,
    /// Document the edit targets; absent means the shared document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl TryFrom<WireOperation> for Operation {
    type Error = ProtocolError;

    fn try_from(wire: WireOperation) -> Result<Self, Self::Error> {
        let Position { x, y } = wire.position;
        Ok(match wire.kind {
            OperationKind::Insert => {
                let mut chars = wire.character.chars();
                let ch = match (chars.next(), chars.next()) {
                    (Some(ch), None) if !is_line_separator(ch) => ch,
                    _ => {
                        return Err(ProtocolError::malformed(format!(
                            "insert needs exactly one non-separator character, got {:?}",
                            wire.character
                        )))
                    }
                };
                Operation::Insert { x, y, ch }
            }
            OperationKind::Delete => Operation::Delete { x, y },
            OperationKind::InsertNewline => Operation::InsertNewline { x, y },
            OperationKind::DeleteNewline => Operation::DeleteNewline { y },
        })
    }
}

impl From<Operation> for WireOperation {
    fn from(op: Operation) -> Self {
        let character = match op {
            Operation::Insert { ch, .. } => ch.to_string(),
            Operation::InsertNewline { .. } => "\n".to_string(),
            Operation::Delete { .. } | Operation::DeleteNewline { .. } => String::new(),
        };
        Self {
            kind: op.kind(),
            position: op.position(),
            character,
            filename: None,
        }
    }
}

fn is_line_separator(ch: char) -> bool {
    ch == '\n' || ch == '\r'
}

/// An in-memory line document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Document {
    lines: Vec<String>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// Create an empty document holding a single empty line.
    pub fn new() -> Self {
        Self {
            lines: vec![String::new()],
        }
    }

    /// Build a document from stored lines.
    ///
    /// Separators inside a line start a new line; an empty input yields the
    /// single-empty-line document.
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = Vec::new();
        for line in lines {
            out.extend(line.as_ref().lines().map(str::to_string));
            if line.as_ref().is_empty() {
                out.push(String::new());
            }
        }
        if out.is_empty() {
            out.push(String::new());
        }
        Self { lines: out }
    }

    /// Parse newline-separated text (`\n` or `\r\n`).
    pub fn from_text(text: &str) -> Self {
        Self::from_lines(text.lines())
    }

    /// Render as text, each line terminated by `\n`.
    pub fn to_text(&self) -> String {
        let mut text = String::with_capacity(self.lines.iter().map(|l| l.len() + 1).sum());
        for line in &self.lines {
            text.push_str(line);
            text.push('\n');
        }
        text
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Length of line `y` in characters.
    pub fn line_len(&self, y: usize) -> Option<usize> {
        self.lines.get(y).map(|line| line.chars().count())
    }

    /// Check `op` against the current state without applying it.
    pub fn validate(&self, op: &Operation) -> Result<(), Rejection> {
        match *op {
            Operation::Insert { x, y, .. } | Operation::InsertNewline { x, y } => {
                let line = self.line_index(y)?;
                self.column_index(x, y, line, true)?;
            }
            Operation::Delete { x, y } => {
                let line = self.line_index(y)?;
                self.column_index(x, y, line, false)?;
            }
            Operation::DeleteNewline { y } => {
                if y == 0 {
                    return Err(Rejection::NoPreviousLine { y });
                }
                self.line_index(y)?;
            }
        }
        Ok(())
    }

    /// Validate and apply `op`. On rejection the document is unchanged.
    pub fn apply(&mut self, op: &Operation) -> Result<(), Rejection> {
        self.validate(op)?;

        // Indices are known to be in range past this point.
        match *op {
            Operation::Insert { x, y, ch } => {
                let line = &mut self.lines[y as usize];
                let at = byte_offset(line, x as usize);
                line.insert(at, ch);
            }
            Operation::Delete { x, y } => {
                let line = &mut self.lines[y as usize];
                let at = byte_offset(line, x as usize);
                line.remove(at);
            }
            Operation::InsertNewline { x, y } => {
                let y = y as usize;
                let at = byte_offset(&self.lines[y], x as usize);
                let tail = self.lines[y].split_off(at);
                self.lines.insert(y + 1, tail);
            }
            Operation::DeleteNewline { y } => {
                let y = y as usize;
                let joined = self.lines.remove(y);
                self.lines[y - 1].push_str(&joined);
            }
        }
        Ok(())
    }

    fn line_index(&self, y: i64) -> Result<usize, Rejection> {
        usize::try_from(y)
            .ok()
            .filter(|&line| line < self.lines.len())
            .ok_or(Rejection::LineOutOfRange {
                y,
                line_count: self.lines.len(),
            })
    }

    fn column_index(
        &self,
        x: i64,
        y: i64,
        line: usize,
        allow_end: bool,
    ) -> Result<usize, Rejection> {
        let len = self.lines[line].chars().count();
        let limit = if allow_end { len + 1 } else { len };
        usize::try_from(x)
            .ok()
            .filter(|&column| column < limit)
            .ok_or(Rejection::ColumnOutOfRange { x, y, len })
    }
}

/// Byte offset of character column `column`, or the line length at the end.
fn byte_offset(line: &str, column: usize) -> usize {
    line.char_indices()
        .nth(column)
        .map(|(i, _)| i)
        .unwrap_or(line.len())
}
