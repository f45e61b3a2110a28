//! Stop positions: call sites and safepoints, sorted by code offset.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::runtime::{MethodId, RuntimeCall};

/// Flag set on the encoded position of an indirect call into native code.
pub const NATIVE_FUNCTION_CALL: u32 = 1 << 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopKind {
    DirectCall,
    IndirectCall,
    Safepoint,
}

impl fmt::Display for StopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopKind::DirectCall => "direct call",
            StopKind::IndirectCall => "indirect call",
            StopKind::Safepoint => "safepoint",
        })
    }
}

/// What a call site calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum Callee {
    Method(MethodId),
    Runtime(RuntimeCall),
    /// A generated adapter in front of a runtime routine
    GlobalStub(RuntimeCall),
    Native(String),
}

impl fmt::Display for Callee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callee::Method(m) => write!(f, "method {}", m.0),
            Callee::Runtime(call) => write!(f, "runtime {call}"),
            Callee::GlobalStub(call) => write!(f, "stub {call}"),
            Callee::Native(symbol) => write!(f, "native {symbol}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stop {
    /// Offset of the first byte of the call or safepoint instruction
    pub offset: u32,
    pub kind: StopKind,
    #[serde(default)]
    pub callee: Option<Callee>,
}

impl Stop {
    pub fn is_native_call(&self) -> bool {
        self.kind == StopKind::IndirectCall && matches!(self.callee, Some(Callee::Native(_)))
    }

    /// Offset with the native call flag folded in.
    pub fn encoded_position(&self) -> u32 {
        if self.is_native_call() {
            self.offset | NATIVE_FUNCTION_CALL
        } else {
            self.offset
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Stops {
    stops: Vec<Stop>,
}

impl Stops {
    /// Takes stops that are already sorted by offset.
    pub fn from_sorted(stops: Vec<Stop>) -> Self {
        debug_assert!(stops.windows(2).all(|w| w[0].offset <= w[1].offset));
        Self { stops }
    }

    pub fn len(&self) -> usize {
        self.stops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stops.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Stop> {
        self.stops.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Stop> {
        self.stops.iter()
    }

    pub fn count(&self, kind: StopKind) -> usize {
        self.stops.iter().filter(|s| s.kind == kind).count()
    }

    /// Index of the stop exactly at `offset`.
    pub fn find_exact(&self, offset: u32) -> Option<usize> {
        let i = self.stops.partition_point(|s| s.offset < offset);
        (self.stops.get(i)?.offset == offset).then_some(i)
    }

    /// Index of the last stop at or before `offset`.
    pub fn find_closest(&self, offset: u32) -> Option<usize> {
        self.stops
            .partition_point(|s| s.offset <= offset)
            .checked_sub(1)
    }

    /// The direct call whose instruction starts at `offset`.
    pub fn direct_call_at(&self, offset: u32) -> Option<&Stop> {
        let first = self.find_exact(offset)?;
        self.stops[first..]
            .iter()
            .take_while(|s| s.offset == offset)
            .find(|s| s.kind == StopKind::DirectCall)
    }
}

impl<'a> IntoIterator for &'a Stops {
    type Item = &'a Stop;
    type IntoIter = std::slice::Iter<'a, Stop>;

    fn into_iter(self) -> Self::IntoIter {
        self.stops.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stop(offset: u32, kind: StopKind) -> Stop {
        Stop {
            offset,
            kind,
            callee: None,
        }
    }

    #[test]
    fn test_closest_and_exact_lookup() {
        let stops = Stops::from_sorted(vec![
            stop(16, StopKind::Safepoint),
            stop(40, StopKind::DirectCall),
            stop(72, StopKind::IndirectCall),
        ]);
        assert_eq!(stops.find_closest(15), None);
        assert_eq!(stops.find_closest(16), Some(0));
        assert_eq!(stops.find_closest(44), Some(1));
        assert_eq!(stops.find_closest(1000), Some(2));
        assert_eq!(stops.find_exact(40), Some(1));
        assert_eq!(stops.find_exact(41), None);
        assert!(stops.direct_call_at(40).is_some());
        assert!(stops.direct_call_at(72).is_none());
        assert_eq!(stops.count(StopKind::DirectCall), 1);
    }

    #[test]
    fn test_native_flag() {
        let call = Stop {
            offset: 12,
            kind: StopKind::IndirectCall,
            callee: Some(Callee::Native("getpid".to_string())),
        };
        assert_eq!(call.encoded_position(), 12 | NATIVE_FUNCTION_CALL);
        assert_eq!(stop(12, StopKind::IndirectCall).encoded_position(), 12);
    }
}
