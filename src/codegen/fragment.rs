//! Code fragments with deferred symbols.
//!
//! Some generated names are only known after a later step of generation
//! (a hash table's element type is the tuple type of whatever feeds its
//! build side). Such names are [`SymbolId`] placeholders inside a
//! [`Fragment`] and are bound in the [`SymbolTable`] once known.

use std::fmt;

use crate::error::{CompileError, CompileResult};

/// Placeholder for a name bound later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(usize);

impl fmt::Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sym_{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Piece {
    Text(String),
    Symbol(SymbolId),
}

/// Text interleaved with unresolved symbols
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Fragment {
    pieces: Vec<Piece>,
}

impl Fragment {
    pub fn new() -> Self {
        Fragment::default()
    }

    pub fn text(mut self, text: impl AsRef<str>) -> Self {
        self.push_str(text.as_ref());
        self
    }

    pub fn symbol(mut self, id: SymbolId) -> Self {
        self.pieces.push(Piece::Symbol(id));
        self
    }

    /// Append another fragment
    pub fn then(mut self, other: Fragment) -> Self {
        self.append(other);
        self
    }

    pub fn push_str(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        match self.pieces.last_mut() {
            Some(Piece::Text(last)) => last.push_str(text),
            _ => self.pieces.push(Piece::Text(text.to_string())),
        }
    }

    pub fn append(&mut self, other: Fragment) {
        for piece in other.pieces {
            match piece {
                Piece::Text(t) => self.push_str(&t),
                symbol => self.pieces.push(symbol),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn symbols(&self) -> impl Iterator<Item = SymbolId> + '_ {
        self.pieces.iter().filter_map(|p| match p {
            Piece::Symbol(id) => Some(*id),
            Piece::Text(_) => None,
        })
    }

    /// Substitute every symbol; fails on the first unbound one
    pub fn render(&self, symbols: &SymbolTable) -> CompileResult<String> {
        let mut out = String::new();
        for piece in &self.pieces {
            match piece {
                Piece::Text(t) => out.push_str(t),
                Piece::Symbol(id) => out.push_str(symbols.value(*id).ok_or(
                    CompileError::UnresolvedSymbol {
                        symbol: id.to_string(),
                    },
                )?),
            }
        }
        Ok(out)
    }
}

impl From<&str> for Fragment {
    fn from(text: &str) -> Self {
        Fragment::new().text(text)
    }
}

impl From<String> for Fragment {
    fn from(text: String) -> Self {
        Fragment::new().text(text)
    }
}

/// Symbol bindings
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    values: Vec<Option<String>>,
}

impl SymbolTable {
    pub fn create(&mut self) -> SymbolId {
        self.values.push(None);
        SymbolId(self.values.len() - 1)
    }

    pub fn resolve(&mut self, id: SymbolId, value: impl Into<String>) {
        if let Some(slot) = self.values.get_mut(id.0) {
            *slot = Some(value.into());
        }
    }

    pub fn value(&self, id: SymbolId) -> Option<&str> {
        self.values.get(id.0).and_then(|v| v.as_deref())
    }

    pub fn is_resolved(&self, id: SymbolId) -> bool {
        self.value(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_after_resolution() {
        let mut table = SymbolTable::default();
        let id = table.create();
        let frag = Fragment::from("Relation<").symbol(id).text("> r;");
        assert!(matches!(
            frag.render(&table),
            Err(CompileError::UnresolvedSymbol { .. })
        ));
        table.resolve(id, "tuple_3");
        assert_eq!(frag.render(&table).unwrap(), "Relation<tuple_3> r;");
    }

    #[test]
    fn test_adjacent_text_merges() {
        let frag = Fragment::from("a").text("b").then(Fragment::from("c"));
        assert_eq!(frag, Fragment::from("abc"));
        assert_eq!(frag.symbols().count(), 0);
    }
}
