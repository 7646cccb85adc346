//! Lookup structures built once per session from the compiler output.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::debug_info::{CompiledDebugInfo, ProcDebugInfo};

/// A resolved call site: caller, callee and the stack depth the call introduces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    pub from: Arc<ProcDebugInfo>,
    pub to: Arc<ProcDebugInfo>,
    pub stack: u32,
}

/// Procedure and call-site tables for one compiled program.
#[derive(Debug, Clone, Default)]
pub struct CompiledDebugIndex {
    procs: BTreeMap<u32, Arc<ProcDebugInfo>>,
    call_infos: HashMap<u32, CallInfo>,
    entry: Option<Arc<ProcDebugInfo>>,
}

impl CompiledDebugIndex {
    /// Builds the index.
    ///
    /// Call edges pointing at a procedure index the compiler never emitted are dropped.
    pub fn new(info: &CompiledDebugInfo) -> Self {
        let procs_in_order: Vec<Arc<ProcDebugInfo>> = info
            .proc_debug_info
            .iter()
            .cloned()
            .map(Arc::new)
            .collect();

        let mut procs = BTreeMap::new();
        for proc in &procs_in_order {
            if let Some(previous) = procs.insert(proc.idx, proc.clone()) {
                tracing::warn!(
                    "Procedure index {} is emitted twice ({:?} and {:?}), keeping the latter",
                    proc.idx,
                    previous.name,
                    proc.name
                );
            }
        }

        let mut call_infos = HashMap::new();
        for proc in &procs_in_order {
            for call in &proc.calls {
                let Some(callee) = procs.get(&call.proc_index) else {
                    tracing::debug!(
                        "Dropping call at {:#010x} in {:?}: no procedure with index {}",
                        call.addr,
                        proc.name,
                        call.proc_index
                    );
                    continue;
                };

                call_infos.insert(
                    call.addr,
                    CallInfo {
                        from: proc.clone(),
                        to: callee.clone(),
                        stack: call.stack,
                    },
                );
            }
        }

        tracing::debug!(
            "Indexed {} procedures and {} call sites",
            procs.len(),
            call_infos.len()
        );

        Self {
            procs,
            call_infos,
            entry: procs_in_order.first().cloned(),
        }
    }

    /// Looks up a procedure by its compiler-assigned index.
    pub fn procedure(&self, idx: u32) -> Option<&Arc<ProcDebugInfo>> {
        self.procs.get(&idx)
    }

    /// The procedure whose locals name the global variables.
    pub fn entry_procedure(&self) -> Option<&Arc<ProcDebugInfo>> {
        self.entry.as_ref()
    }

    /// Looks up the call made at `addr`.
    pub fn call_at(&self, addr: u32) -> Option<&CallInfo> {
        self.call_infos.get(&addr)
    }

    /// All resolved call sites, keyed by address.
    pub fn call_infos(&self) -> &HashMap<u32, CallInfo> {
        &self.call_infos
    }

    pub fn procedure_count(&self) -> usize {
        self.procs.len()
    }

    /// Finds the procedure whose step-in trampoline lives at `pc`.
    pub fn landing_pad(&self, pc: u32) -> Option<&Arc<ProcDebugInfo>> {
        self.procs
            .values()
            .find(|proc| proc.bkpt_loc == Some(pc) && proc.code_start_loc.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug_info::{CallEdge, LocalInfo};

    fn proc(idx: u32, name: &str, calls: Vec<CallEdge>) -> ProcDebugInfo {
        ProcDebugInfo {
            idx,
            name: name.to_string(),
            locals: vec![LocalInfo {
                name: "x".into(),
                slot: None,
            }],
            calls,
            bkpt_loc: None,
            code_start_loc: None,
        }
    }

    fn info(procs: Vec<ProcDebugInfo>) -> CompiledDebugInfo {
        CompiledDebugInfo {
            proc_debug_info: procs,
            ..Default::default()
        }
    }

    #[test]
    fn joins_calls_against_procedures() {
        let index = CompiledDebugIndex::new(&info(vec![
            proc(
                0,
                "main",
                vec![CallEdge {
                    addr: 0x2010,
                    proc_index: 7,
                    stack: 3,
                }],
            ),
            proc(7, "helper", vec![]),
        ]));

        let call = index.call_at(0x2010).unwrap();
        assert_eq!(call.from.name, "main");
        assert_eq!(call.to.name, "helper");
        assert_eq!(call.stack, 3);
        assert_eq!(index.entry_procedure().unwrap().name, "main");
    }

    #[test]
    fn sparse_indices_are_supported() {
        let index = CompiledDebugIndex::new(&info(vec![proc(3, "a", vec![]), proc(40, "b", vec![])]));

        assert_eq!(index.procedure(40).unwrap().name, "b");
        assert!(index.procedure(4).is_none());
        assert_eq!(index.procedure_count(), 2);
    }

    #[test]
    fn dangling_call_edges_are_dropped() {
        let index = CompiledDebugIndex::new(&info(vec![proc(
            0,
            "main",
            vec![
                CallEdge {
                    addr: 0x100,
                    proc_index: 99,
                    stack: 0,
                },
                CallEdge {
                    addr: 0x104,
                    proc_index: 0,
                    stack: 1,
                },
            ],
        )]));

        assert!(index.call_at(0x100).is_none());
        assert!(index.call_at(0x104).is_some());
        assert_eq!(index.call_infos().len(), 1);
    }

    #[test]
    fn finds_landing_pad() {
        let mut helper = proc(1, "helper", vec![]);
        helper.bkpt_loc = Some(0x3000);
        helper.code_start_loc = Some(0x3008);

        let index = CompiledDebugIndex::new(&info(vec![proc(0, "main", vec![]), helper]));

        assert_eq!(index.landing_pad(0x3000).unwrap().name, "helper");
        assert!(index.landing_pad(0x3008).is_none());
    }
}
