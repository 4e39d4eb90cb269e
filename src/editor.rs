//! Simulated editor used as the demo host.
//!
//! Holds a flat widget tree keyed by slash-separated paths. Reloads are
//! compiled on a background thread that reports back through the
//! [`ReloadNotifier`], the same way a real editor's compiler would.

use hostbridge_core::{Host, HostError, ReloadNotifier, ReloadOutcome};
use hostbridge_protocol::{DiagnosticEntry, MutationDescriptor, ReloadResult, StateQuery, Verbosity};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::thread::JoinHandle;
use std::time::Duration;

/// Widget property that makes the next compile fail.
const COMPILE_ERROR_PROP: &str = "compile_error";

/// Query target returning editor-level counters instead of a widget.
const EDITOR_TARGET: &str = "editor";

pub struct DemoEditor {
    widgets: BTreeMap<String, Map<String, Value>>,
    /// Bumped on every successful mutation.
    revision: u64,
    /// Revision picked up by the last clean compile.
    compiled_revision: u64,
    reloads: u64,
    compile_time: Duration,
    notifier: ReloadNotifier,
    compiler: Option<JoinHandle<()>>,
}

impl DemoEditor {
    pub fn new(notifier: ReloadNotifier, compile_time: Duration) -> Self {
        Self {
            widgets: BTreeMap::new(),
            revision: 0,
            compiled_revision: 0,
            reloads: 0,
            compile_time,
            notifier,
            compiler: None,
        }
    }

    /// Whether the simulated compiler thread is still running.
    pub fn is_compiling(&self) -> bool {
        self.compiler.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn reloads(&self) -> u64 {
        self.reloads
    }

    pub fn widget_count(&self) -> usize {
        self.widgets.len()
    }

    fn widget_json(&self, path: &str) -> Option<Value> {
        self.widgets
            .get(path)
            .map(|props| json!({ "path": path, "props": props }))
    }

    fn set(&mut self, path: &str, args: Option<&Value>) -> Result<Value, HostError> {
        let props = self.widgets.entry(path.to_string()).or_default();
        match args {
            Some(Value::Object(update)) => {
                for (key, value) in update {
                    if value.is_null() {
                        props.remove(key);
                    } else {
                        props.insert(key.clone(), value.clone());
                    }
                }
            }
            Some(value) => {
                props.insert("value".to_string(), value.clone());
            }
            None => {}
        }
        self.widget_json(path)
            .ok_or_else(|| HostError::Fault(format!("widget '{}' vanished", path)))
    }

    /// Removes `path` and everything below it.
    fn remove(&mut self, path: &str) -> Result<Value, HostError> {
        let doomed = self.subtree(path);
        if doomed.is_empty() {
            return Err(HostError::Rejected(format!("no widget at '{}'", path)));
        }
        for p in &doomed {
            self.widgets.remove(p);
        }
        Ok(json!({ "removed": doomed }))
    }

    /// Moves `path` and everything below it to `args.to`.
    fn rename(&mut self, path: &str, args: Option<&Value>) -> Result<Value, HostError> {
        let to = args
            .and_then(|a| a.get("to"))
            .and_then(Value::as_str)
            .filter(|to| !to.is_empty())
            .ok_or_else(|| HostError::Rejected("rename needs args.to".to_string()))?;

        if to == path || to.starts_with(&format!("{}/", path)) {
            return Err(HostError::Rejected(format!(
                "cannot move '{}' into itself",
                path
            )));
        }
        let moving = self.subtree(path);
        if moving.is_empty() {
            return Err(HostError::Rejected(format!("no widget at '{}'", path)));
        }
        let renamed: Vec<(String, String)> = moving
            .iter()
            .map(|p| (p.clone(), format!("{}{}", to, &p[path.len()..])))
            .collect();
        if let Some((_, taken)) = renamed.iter().find(|(_, n)| self.widgets.contains_key(n)) {
            return Err(HostError::Rejected(format!("'{}' already exists", taken)));
        }

        for (old, new) in &renamed {
            if let Some(props) = self.widgets.remove(old) {
                self.widgets.insert(new.clone(), props);
            }
        }
        Ok(json!({ "from": path, "to": to, "moved": renamed.len() }))
    }

    fn subtree(&self, path: &str) -> Vec<String> {
        let prefix = format!("{}/", path);
        self.widgets
            .keys()
            .filter(|p| p.as_str() == path || p.starts_with(&prefix))
            .cloned()
            .collect()
    }

    fn compile_errors(&self) -> Vec<DiagnosticEntry> {
        self.widgets
            .iter()
            .filter_map(|(path, props)| {
                props.get(COMPILE_ERROR_PROP).map(|e| {
                    let text = e.as_str().map(str::to_owned).unwrap_or_else(|| e.to_string());
                    DiagnosticEntry::new("Compiler", Verbosity::Error, format!("{}: {}", path, text))
                })
            })
            .collect()
    }
}

impl Host for DemoEditor {
    fn apply_mutation(&mut self, mutation: &MutationDescriptor) -> Result<Value, HostError> {
        let target = mutation.target.as_str();
        let args = mutation.args.as_ref();
        let result = match mutation.action.as_str() {
            "set" => self.set(target, args)?,
            "remove" => self.remove(target)?,
            "rename" => self.rename(target, args)?,
            "fail" => {
                return Err(HostError::Fault(format!(
                    "mutation on '{}' failed as requested",
                    target
                )))
            }
            "panic" => panic!("editor panicked while mutating '{}'", target),
            other => return Err(HostError::Rejected(format!("unknown action '{}'", other))),
        };
        self.revision += 1;
        tracing::debug!("Applied {} to {} (revision {})", mutation.action, target, self.revision);
        Ok(result)
    }

    fn query_state(&self, query: &StateQuery) -> Result<Value, HostError> {
        match query.target.as_deref() {
            None | Some("") => Ok(json!({
                "widgets": self.widgets,
                "revision": self.revision,
                "reloads": self.reloads,
            })),
            Some(EDITOR_TARGET) => Ok(json!({
                "revision": self.revision,
                "compiled_revision": self.compiled_revision,
                "reloads": self.reloads,
                "compiling": self.is_compiling(),
                "widgets": self.widgets.len(),
            })),
            Some(path) => self
                .widget_json(path)
                .ok_or_else(|| HostError::Rejected(format!("no widget at '{}'", path))),
        }
    }

    fn start_reload(&mut self) -> Result<(), HostError> {
        if self.is_compiling() {
            return Err(HostError::Rejected("compiler is busy".to_string()));
        }

        self.reloads += 1;
        let errors = self.compile_errors();
        let changed = self.revision != self.compiled_revision;
        let outcome = if !errors.is_empty() {
            ReloadOutcome::new(ReloadResult::Failure).with_diagnostics(errors)
        } else if changed {
            self.compiled_revision = self.revision;
            ReloadOutcome::new(ReloadResult::Success).with_diagnostics(vec![DiagnosticEntry::new(
                "LiveCoding",
                Verbosity::Display,
                format!("Patched {} widget(s) at revision {}", self.widgets.len(), self.revision),
            )])
        } else {
            ReloadOutcome::new(ReloadResult::NoChanges)
        };

        let notifier = self.notifier.clone();
        let compile_time = self.compile_time;
        let reload_no = self.reloads;
        let handle = std::thread::Builder::new()
            .name("demo-compiler".to_string())
            .spawn(move || {
                notifier.reload_started();
                std::thread::sleep(compile_time);
                tracing::info!("Simulated compile #{} finished: {}", reload_no, outcome.status);
                notifier.reload_complete(outcome);
            })
            .map_err(|e| HostError::Fault(format!("failed to start compiler: {}", e)))?;
        self.compiler = Some(handle);
        Ok(())
    }
}
