//! Source positions of stops.
//!
//! Methods without inlining store one bytecode index per stop. Methods with
//! inlining store `(method index, bci, caller index)` triples: stop `i` owns
//! triple `i`, caller-only positions follow the stops, and a caller index of
//! -1 marks the outermost frame.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::runtime::MethodId;
use crate::scope::CodePos;

/// Compact entry for a stop without a position.
pub const NO_BCI: u16 = 0xFFFF;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", rename_all = "snake_case")]
pub enum SourceInfo {
    #[default]
    Empty,
    Compact { bcis: Vec<u16> },
    Full {
        triples: Vec<i32>,
        methods: Vec<MethodId>,
    },
}

impl SourceInfo {
    /// Encodes the positions of all stops, in stop order.
    pub fn encode(positions: &[Option<Arc<CodePos>>]) -> SourceInfo {
        if positions.is_empty() {
            return SourceInfo::Empty;
        }
        let needs_full = positions.iter().flatten().any(|pos| {
            pos.caller.is_some() || pos.bci < 0 || pos.bci >= i32::from(NO_BCI)
        });
        if needs_full {
            Self::encode_full(positions)
        } else {
            SourceInfo::Compact {
                bcis: positions
                    .iter()
                    .map(|p| p.as_ref().map_or(NO_BCI, |p| p.bci as u16))
                    .collect(),
            }
        }
    }

    fn encode_full(positions: &[Option<Arc<CodePos>>]) -> SourceInfo {
        let stop_count = positions.len();
        let mut index_of: FxHashMap<*const CodePos, usize> = FxHashMap::default();
        for (i, pos) in positions.iter().enumerate() {
            if let Some(pos) = pos {
                index_of.entry(Arc::as_ptr(pos)).or_insert(i);
            }
        }

        let mut extras: Vec<&CodePos> = Vec::new();
        for pos in positions.iter().flatten() {
            let mut caller = pos.caller.as_deref();
            while let Some(c) = caller {
                let key = c as *const CodePos;
                if !index_of.contains_key(&key) {
                    index_of.insert(key, stop_count + extras.len());
                    extras.push(c);
                }
                caller = c.caller.as_deref();
            }
        }

        let mut methods: Vec<MethodId> = Vec::new();
        let mut method_index: FxHashMap<MethodId, i32> = FxHashMap::default();
        let mut triples = vec![-1; (stop_count + extras.len()) * 3];

        let entries = positions
            .iter()
            .map(|p| p.as_deref())
            .chain(extras.iter().map(|&c| Some(c)));
        for (i, pos) in entries.enumerate() {
            let Some(pos) = pos else { continue };
            let m = *method_index.entry(pos.method).or_insert_with(|| {
                methods.push(pos.method);
                (methods.len() - 1) as i32
            });
            let caller = pos
                .caller
                .as_deref()
                .and_then(|c| index_of.get(&(c as *const CodePos)))
                .map_or(-1, |&idx| idx as i32);
            triples[i * 3] = m;
            triples[i * 3 + 1] = pos.bci;
            triples[i * 3 + 2] = caller;
        }

        SourceInfo::Full { triples, methods }
    }

    pub fn is_inlined(&self) -> bool {
        matches!(self, SourceInfo::Full { .. })
    }

    /// Rebuilds the position of stop `index`, or of a caller entry when
    /// `index` is past the stops. `root` is the compiled method.
    pub fn decode(&self, root: Option<MethodId>, index: usize) -> Option<Arc<CodePos>> {
        match self {
            SourceInfo::Empty => None,
            SourceInfo::Compact { bcis } => {
                let bci = *bcis.get(index)?;
                if bci == NO_BCI {
                    return None;
                }
                Some(Arc::new(CodePos::new(None, root?, i32::from(bci))))
            }
            SourceInfo::Full { triples, methods } => Self::decode_full(triples, methods, index, 0),
        }
    }

    fn decode_full(
        triples: &[i32],
        methods: &[MethodId],
        index: usize,
        depth: usize,
    ) -> Option<Arc<CodePos>> {
        // a well-formed table is acyclic; the bound guards a corrupt one
        if depth > triples.len() / 3 {
            return None;
        }
        let entry = triples.get(index * 3..index * 3 + 3)?;
        let method = *methods.get(usize::try_from(entry[0]).ok()?)?;
        let caller = match usize::try_from(entry[2]) {
            Ok(parent) => Some(Self::decode_full(triples, methods, parent, depth + 1)?),
            Err(_) => None,
        };
        Some(Arc::new(CodePos::new(caller, method, entry[1])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(caller: Option<Arc<CodePos>>, method: u32, bci: i32) -> Arc<CodePos> {
        Arc::new(CodePos::new(caller, MethodId(method), bci))
    }

    #[test]
    fn test_compact_encoding() {
        let positions = vec![Some(pos(None, 0, 3)), None, Some(pos(None, 0, 12))];
        let info = SourceInfo::encode(&positions);
        assert_eq!(
            info,
            SourceInfo::Compact {
                bcis: vec![3, NO_BCI, 12]
            }
        );
        assert_eq!(info.decode(Some(MethodId(0)), 2).unwrap().bci, 12);
        assert!(info.decode(Some(MethodId(0)), 1).is_none());
    }

    #[test]
    fn test_large_bci_forces_full_encoding() {
        let info = SourceInfo::encode(&[Some(pos(None, 4, 70000))]);
        assert!(info.is_inlined());
        let decoded = info.decode(Some(MethodId(4)), 0).unwrap();
        assert_eq!((decoded.method, decoded.bci), (MethodId(4), 70000));
    }

    #[test]
    fn test_full_encoding_shares_callers() {
        let call_site = pos(None, 0, 7);
        let positions = vec![
            Some(pos(Some(call_site.clone()), 1, 2)),
            Some(pos(Some(call_site.clone()), 1, 5)),
            Some(pos(None, 0, 9)),
        ];
        let info = SourceInfo::encode(&positions);
        let SourceInfo::Full { triples, methods } = &info else {
            panic!("expected full encoding");
        };
        assert_eq!(methods, &vec![MethodId(1), MethodId(0)]);
        // three stops plus the one shared caller entry
        assert_eq!(triples.len(), 12);
        assert_eq!(&triples[0..3], &[0, 2, 3]);
        assert_eq!(&triples[3..6], &[0, 5, 3]);
        assert_eq!(&triples[6..9], &[1, 9, -1]);
        assert_eq!(&triples[9..12], &[1, 7, -1]);
    }
}
