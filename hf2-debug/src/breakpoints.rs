//! Correlating program counters with the compiler's breakpoint table.

use std::collections::HashMap;

use crate::debug_info::Breakpoint;
use crate::Error;

/// Returns the breakpoint that best explains a halt at `pc`.
///
/// The device may stop a few instructions past the armed address, so this is a floor
/// match: the breakpoint with the greatest `bin_addr <= pc` wins, the earliest one on ties.
/// When `pc` is below every breakpoint, `breakpoints[0]` is returned. Only an empty table
/// yields `None`.
pub fn resolve(pc: u32, breakpoints: &[Breakpoint]) -> Option<&Breakpoint> {
    let mut best = breakpoints.first()?;
    let mut best_delta = None;

    for breakpoint in breakpoints {
        let Some(delta) = pc.checked_sub(breakpoint.bin_addr) else {
            continue;
        };

        if best_delta.map_or(true, |best_delta| delta < best_delta) {
            best = breakpoint;
            best_delta = Some(delta);
        }
    }

    Some(best)
}

/// A non-empty breakpoint table with lookup by ID.
///
/// Index 0 is reserved as the fallback match and never selected as the entry breakpoint.
#[derive(Debug, Clone)]
pub struct BreakpointTable {
    breakpoints: Vec<Breakpoint>,
    by_id: HashMap<u32, usize>,
}

impl BreakpointTable {
    pub fn new(breakpoints: Vec<Breakpoint>) -> Result<Self, Error> {
        if breakpoints.is_empty() {
            return Err(Error::NoBreakpoints);
        }

        let mut by_id = HashMap::with_capacity(breakpoints.len());
        for (position, breakpoint) in breakpoints.iter().enumerate() {
            by_id.entry(breakpoint.id).or_insert(position);
        }

        Ok(Self {
            breakpoints,
            by_id,
        })
    }

    /// Resolves `pc` using the floor match, see [`resolve`].
    pub fn resolve(&self, pc: u32) -> &Breakpoint {
        resolve(pc, &self.breakpoints).unwrap_or(&self.breakpoints[0])
    }

    /// The breakpoint to arm before the program first starts.
    ///
    /// This is the lowest non-zero address among all entries except the reserved first one.
    /// Address zero marks a breakpoint the compiler could not place.
    pub fn entry(&self) -> Option<&Breakpoint> {
        self.breakpoints
            .iter()
            .skip(1)
            .filter(|breakpoint| breakpoint.bin_addr != 0)
            .min_by_key(|breakpoint| breakpoint.bin_addr)
    }

    pub fn get(&self, id: u32) -> Option<&Breakpoint> {
        self.by_id.get(&id).map(|&position| &self.breakpoints[position])
    }

    /// Maps the successors of `breakpoint` to the addresses to arm for the next step.
    pub fn successor_addresses(&self, breakpoint: &Breakpoint) -> Vec<u32> {
        breakpoint
            .successors
            .iter()
            .filter_map(|&id| match self.get(id) {
                Some(successor) => Some(successor.bin_addr),
                None => {
                    tracing::warn!(
                        "Breakpoint {} names unknown successor {}, skipping it",
                        breakpoint.id,
                        id
                    );
                    None
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn bp(id: u32, bin_addr: u32, successors: &[u32]) -> Breakpoint {
        Breakpoint {
            id,
            bin_addr,
            successors: successors.to_vec(),
        }
    }

    fn table() -> Vec<Breakpoint> {
        vec![
            bp(0, 0x1000, &[]),
            bp(1, 0x2000, &[2]),
            bp(2, 0x2100, &[]),
            bp(3, 0x2400, &[1, 2]),
        ]
    }

    #[test_case(0x1000, 0; "exact first")]
    #[test_case(0x2000, 1; "exact second")]
    #[test_case(0x2100, 2; "exact third")]
    #[test_case(0x2400, 3; "exact last")]
    fn exact_address_matches_itself(pc: u32, expected: u32) {
        assert_eq!(resolve(pc, &table()).unwrap().id, expected);
    }

    #[test_case(0x2050, 1; "between first and second")]
    #[test_case(0x20ff, 1; "just before next")]
    #[test_case(0x1004, 0; "slack after first")]
    #[test_case(0xffff_0000, 3; "far past the last")]
    fn floor_match_picks_nearest_preceding(pc: u32, expected: u32) {
        assert_eq!(resolve(pc, &table()).unwrap().id, expected);
    }

    #[test]
    fn below_every_breakpoint_falls_back_to_first() {
        let breakpoints = vec![bp(9, 0x4000, &[]), bp(1, 0x3000, &[])];
        assert_eq!(resolve(0x10, &breakpoints).unwrap().id, 9);
    }

    #[test]
    fn unsorted_tables_are_handled() {
        let breakpoints = vec![bp(0, 0x1000, &[]), bp(5, 0x3000, &[]), bp(4, 0x2000, &[])];
        assert_eq!(resolve(0x2800, &breakpoints).unwrap().id, 4);
    }

    #[test]
    fn empty_table_is_rejected() {
        assert!(resolve(0x1000, &[]).is_none());
        assert!(matches!(
            BreakpointTable::new(vec![]),
            Err(Error::NoBreakpoints)
        ));
    }

    #[test]
    fn entry_skips_reserved_first_entry() {
        let table = BreakpointTable::new(vec![
            bp(0, 0x0800, &[]),
            bp(1, 0x2000, &[]),
            bp(2, 0x0000, &[]),
            bp(3, 0x1800, &[]),
        ])
        .unwrap();

        assert_eq!(table.entry().unwrap().id, 3);
    }

    #[test]
    fn entry_requires_second_breakpoint() {
        let table = BreakpointTable::new(vec![bp(0, 0x0800, &[])]).unwrap();
        assert!(table.entry().is_none());
    }

    #[test]
    fn successors_map_to_addresses() {
        let table = BreakpointTable::new(table()).unwrap();
        let third = table.get(3).unwrap().clone();

        assert_eq!(table.successor_addresses(&third), vec![0x2000, 0x2100]);
    }

    #[test]
    fn unknown_successors_are_skipped() {
        let table = BreakpointTable::new(vec![bp(0, 0x1000, &[7, 0])]).unwrap();
        let first = table.get(0).unwrap().clone();

        assert_eq!(table.successor_addresses(&first), vec![0x1000]);
    }
}
