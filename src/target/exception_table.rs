//! Exception table: protected instruction offsets mapped to handlers.

use serde::{Deserialize, Serialize};

use crate::runtime::{RuntimeModel, TypeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionRange {
    /// Start offset of the instruction that may throw
    pub protected_offset: u32,
    pub handler_offset: u32,
    /// `None` catches everything
    #[serde(default)]
    pub catch_type: Option<TypeId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExceptionTable {
    ranges: Vec<ExceptionRange>,
}

impl ExceptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, protected_offset: u32, handler_offset: u32, catch_type: Option<TypeId>) {
        self.ranges.push(ExceptionRange {
            protected_offset,
            handler_offset,
            catch_type,
        });
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ExceptionRange> {
        self.ranges.iter()
    }

    /// First entry, in declaration order, protecting `throw_offset` whose
    /// catch type is absent or accepted by `catches`. `None` means the
    /// exception propagates to the caller frame.
    pub fn lookup_with(
        &self,
        throw_offset: u32,
        mut catches: impl FnMut(TypeId) -> bool,
    ) -> Option<u32> {
        self.ranges
            .iter()
            .find(|r| {
                r.protected_offset == throw_offset && r.catch_type.is_none_or(&mut catches)
            })
            .map(|r| r.handler_offset)
    }

    /// Handler offset for an exception of runtime type `thrown`.
    pub fn lookup(&self, throw_offset: u32, thrown: TypeId, model: &RuntimeModel) -> Option<u32> {
        self.lookup_with(throw_offset, |catch| model.is_assignable_from(catch, thrown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_match_in_declaration_order() {
        let mut table = ExceptionTable::new();
        table.push(10, 50, Some(TypeId(1)));
        table.push(10, 60, None);
        table.push(10, 70, Some(TypeId(2)));

        assert_eq!(table.lookup_with(10, |t| t == TypeId(1)), Some(50));
        assert_eq!(table.lookup_with(10, |t| t == TypeId(2)), Some(60));
        assert_eq!(table.lookup_with(11, |_| true), None);
    }
}
