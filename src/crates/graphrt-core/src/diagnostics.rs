//! Fire-and-forget diagnostics hooks
//!
//! Profiling and dump subsystems observe lifecycle events through
//! [`DiagnosticsHook`]. A failing hook is logged and never aborts the
//! transition that triggered it.

use crate::error::Result;
use std::sync::Arc;
use tracing::warn;

/// Event delivered to every hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticEvent {
    GraphAdded { session_id: u64, graph_id: u32 },
    GraphRemoved { session_id: u64, graph_id: u32 },
    RunStarted { session_id: u64, graph_id: u32 },
    RunFinished { session_id: u64, graph_id: u32, success: bool },
}

pub trait DiagnosticsHook: Send + Sync {
    fn name(&self) -> &str;

    /// Called by Initialize; a failure aborts Initialize
    fn attach(&self, _session_id: u64) -> Result<()> {
        Ok(())
    }

    /// Called by Finalize and by a failed Initialize
    fn detach(&self, _session_id: u64) -> Result<()> {
        Ok(())
    }

    fn on_event(&self, event: &DiagnosticEvent) -> Result<()>;
}

/// Ordered set of hooks of one session
#[derive(Clone, Default)]
pub struct Diagnostics {
    hooks: Vec<Arc<dyn DiagnosticsHook>>,
}

impl Diagnostics {
    pub fn new(hooks: Vec<Arc<dyn DiagnosticsHook>>) -> Self {
        Self { hooks }
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Attach every hook, detaching the ones already attached if one fails
    pub fn attach_all(&self, session_id: u64) -> Result<()> {
        for (idx, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook.attach(session_id) {
                warn!(session_id, hook = hook.name(), error = %e, "Diagnostics hook attach failed");
                self.detach_first(session_id, idx);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn detach_all(&self, session_id: u64) {
        self.detach_first(session_id, self.hooks.len());
    }

    /// Detach the first `count` hooks in reverse order
    fn detach_first(&self, session_id: u64, count: usize) {
        for hook in self.hooks[..count].iter().rev() {
            if let Err(e) = hook.detach(session_id) {
                warn!(session_id, hook = hook.name(), error = %e, "Diagnostics hook detach failed");
            }
        }
    }

    pub fn emit(&self, event: DiagnosticEvent) {
        for hook in &self.hooks {
            if let Err(e) = hook.on_event(&event) {
                warn!(hook = hook.name(), ?event, error = %e, "Diagnostics hook failed");
            }
        }
    }
}

impl std::fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.hooks.iter().map(|h| h.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use parking_lot::Mutex;

    struct RecordingHook {
        name: String,
        fail_attach: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl DiagnosticsHook for RecordingHook {
        fn name(&self) -> &str {
            &self.name
        }

        fn attach(&self, _session_id: u64) -> Result<()> {
            if self.fail_attach {
                return Err(SessionError::device("profiler unavailable"));
            }
            self.log.lock().push(format!("attach {}", self.name));
            Ok(())
        }

        fn detach(&self, _session_id: u64) -> Result<()> {
            self.log.lock().push(format!("detach {}", self.name));
            Ok(())
        }

        fn on_event(&self, _event: &DiagnosticEvent) -> Result<()> {
            Err(SessionError::execution("dump disk full"))
        }
    }

    fn hook(name: &str, fail_attach: bool, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn DiagnosticsHook> {
        Arc::new(RecordingHook {
            name: name.to_string(),
            fail_attach,
            log: log.clone(),
        })
    }

    #[test]
    fn test_attach_failure_rolls_back() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let diagnostics = Diagnostics::new(vec![
            hook("profiler", false, &log),
            hook("dump", false, &log),
            hook("broken", true, &log),
        ]);

        assert!(diagnostics.attach_all(1).is_err());
        assert_eq!(
            *log.lock(),
            vec!["attach profiler", "attach dump", "detach dump", "detach profiler"]
        );
    }

    #[test]
    fn test_emit_swallows_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let diagnostics = Diagnostics::new(vec![hook("dump", false, &log)]);
        diagnostics.emit(DiagnosticEvent::GraphAdded {
            session_id: 1,
            graph_id: 1,
        });
    }
}
