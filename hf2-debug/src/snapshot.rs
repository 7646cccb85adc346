//! Symbolic snapshots of the device's global variables.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::index::CompiledDebugIndex;
use crate::link::{HardwareLink, LinkError};
use crate::protocol;

/// Location and size of the globals area, fixed for the lifetime of a flashed program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticState {
    /// Number of words in the globals area, including the debug-status cell.
    pub num_globals: u32,
    /// Address of the first word, which is the debug-status cell.
    pub globals_ptr: u32,
}

impl StaticState {
    /// Asks the device where its globals live.
    pub async fn fetch(link: &dyn HardwareLink) -> Result<Self, LinkError> {
        let reply = link.talk(protocol::DBG_GET_GLOBAL_STATE, &[]).await?;
        let state = Self {
            num_globals: protocol::word_at(&reply, 0)?,
            globals_ptr: protocol::word_at(&reply, 1)?,
        };

        tracing::debug!(
            "Device has {} globals at {:#010x}",
            state.num_globals,
            state.globals_ptr
        );
        Ok(state)
    }

    /// Address of the debug-status cell.
    pub fn status_cell(&self) -> u32 {
        self.globals_ptr
    }
}

/// The globals of a halted program, keyed by variable name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GlobalSnapshot {
    pub pc: Option<u32>,
    pub globals: BTreeMap<String, u32>,
}

/// Reads the globals area and names each word after the entry procedure's locals.
pub async fn snapshot(
    link: &dyn HardwareLink,
    state: &StaticState,
    index: &CompiledDebugIndex,
    pc: Option<u32>,
) -> Result<GlobalSnapshot, LinkError> {
    let words = link.read_words(state.globals_ptr, state.num_globals).await?;
    if words.len() != state.num_globals as usize {
        return Err(LinkError::Malformed(format!(
            "asked for {} global words, got {}",
            state.num_globals,
            words.len()
        )));
    }

    Ok(GlobalSnapshot {
        pc,
        globals: render_globals(&words, index),
    })
}

/// Names the words of a globals area.
///
/// The first word is the runtime's debug-status cell and is left out. Words without a
/// matching local are reported as `?<n>`, `n` counting from the first real global. A word
/// whose name is already taken falls back to its synthetic name, so every word shows up.
pub fn render_globals(words: &[u32], index: &CompiledDebugIndex) -> BTreeMap<String, u32> {
    let names: BTreeMap<u32, &str> = index
        .entry_procedure()
        .map(|entry| entry.local_slots().collect())
        .unwrap_or_default();

    let mut globals: BTreeMap<String, u32> = BTreeMap::new();
    for (position, value) in words.iter().skip(1).enumerate() {
        let mut name = match names.get(&(position as u32)) {
            Some(name) if !globals.contains_key(*name) => name.to_string(),
            Some(name) => {
                tracing::debug!("Global {position} reuses the name {name:?}");
                format!("?{position}")
            }
            None => format!("?{position}"),
        };
        let mut suffix = 1;
        while globals.contains_key(&name) {
            name = format!("?{position}.{suffix}");
            suffix += 1;
        }
        globals.insert(name, *value);
    }
    globals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug_info::{CompiledDebugInfo, LocalInfo, ProcDebugInfo};
    use crate::link::fake::{FailOn, FakeLink};
    use pretty_assertions::assert_eq;

    fn index_with(locals: Vec<LocalInfo>) -> CompiledDebugIndex {
        CompiledDebugIndex::new(&CompiledDebugInfo {
            proc_debug_info: vec![ProcDebugInfo {
                idx: 0,
                name: "main".into(),
                locals,
                calls: vec![],
                bkpt_loc: None,
                code_start_loc: None,
            }],
            ..Default::default()
        })
    }

    fn index(locals: &[&str]) -> CompiledDebugIndex {
        index_with(
            locals
                .iter()
                .map(|name| LocalInfo {
                    name: name.to_string(),
                    slot: None,
                })
                .collect(),
        )
    }

    #[test]
    fn reserved_word_is_skipped() {
        let globals = render_globals(&[1, 10, 20, 30], &index(&["a", "b", "c"]));

        assert_eq!(globals.len(), 3);
        assert_eq!(
            globals.into_iter().collect::<Vec<_>>(),
            vec![("a".into(), 10), ("b".into(), 20), ("c".into(), 30)]
        );
    }

    #[test]
    fn unnamed_words_get_synthetic_names() {
        let globals = render_globals(&[1, 10, 20, 30], &index(&["a"]));

        assert_eq!(globals.len(), 3);
        assert_eq!(globals["a"], 10);
        assert_eq!(globals["?1"], 20);
        assert_eq!(globals["?2"], 30);
    }

    #[test]
    fn explicit_slots_win_over_position() {
        let index = index_with(vec![LocalInfo {
            name: "late".into(),
            slot: Some(1),
        }]);

        let globals = render_globals(&[0, 5, 6], &index);
        assert_eq!(globals["?0"], 5);
        assert_eq!(globals["late"], 6);
    }

    #[test]
    fn colliding_names_keep_every_word() {
        let globals = render_globals(&[0, 10, 20, 30], &index(&["x", "x", "?0"]));

        assert_eq!(globals.len(), 3);
        assert_eq!(globals["x"], 10);
        assert_eq!(globals["?1"], 20);
        assert_eq!(globals["?0"], 30);
    }

    #[test]
    fn synthetic_name_taken_by_a_local() {
        let globals = render_globals(&[0, 10, 20], &index(&["?1"]));

        assert_eq!(globals.len(), 2);
        assert_eq!(globals["?1"], 10);
        assert_eq!(globals["?1.1"], 20);
    }

    #[test]
    fn empty_area_yields_no_globals() {
        assert!(render_globals(&[], &index(&["a"])).is_empty());
        assert!(render_globals(&[1], &index(&["a"])).is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn snapshot_reads_globals_area() {
        let link = FakeLink::new().with_globals(0x2000_0000, &[42, 7]);

        let state = StaticState::fetch(&link).await.unwrap();
        assert_eq!(
            state,
            StaticState {
                num_globals: 3,
                globals_ptr: 0x2000_0000
            }
        );

        let snapshot = snapshot(&link, &state, &index(&["answer"]), Some(0x2050))
            .await
            .unwrap();
        assert_eq!(snapshot.pc, Some(0x2050));
        assert_eq!(snapshot.globals.len(), state.num_globals as usize - 1);
        assert_eq!(snapshot.globals["answer"], 42);
        assert_eq!(snapshot.globals["?1"], 7);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn read_failure_propagates() {
        let link = FakeLink::new().with_globals(0x2000_0000, &[1]);
        link.inject_failure(FailOn::ReadWords);

        let state = StaticState::fetch(&link).await.unwrap();
        assert!(snapshot(&link, &state, &index(&[]), None).await.is_err());
    }
}
