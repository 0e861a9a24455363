//! Filter Chain
//!
//! Ordered list of compiled filter expressions. Every entry is tried for
//! every frame; negation lives inside the expression.

use crate::filter::FilterProgram;
use crate::queue::{InprocRegistry, OutputQueue};
use crate::{entry_name, entry_str, EntryCore, EntryId, Result};
use sensor_common::{AtomicCounter, FrameView};
use serde_json::Value;

/// One filter expression and its queue
#[derive(Debug)]
pub struct FilterEntry {
    core: EntryCore,
    program: FilterProgram,
}

impl FilterEntry {
    pub fn core(&self) -> &EntryCore {
        &self.core
    }

    pub fn program(&self) -> &FilterProgram {
        &self.program
    }
}

/// Insertion-ordered filter entries
#[derive(Debug, Default)]
pub struct FilterChain {
    entries: Vec<FilterEntry>,
    next_id: EntryId,
    matches: AtomicCounter,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `pcap_chain` entries, skipping the ones that fail
    pub fn from_config(entries: &[Value], registry: &InprocRegistry) -> Self {
        let mut chain = Self::new();
        for (index, entry) in entries.iter().enumerate() {
            if let Err(e) = chain.append_entry(entry, index, registry) {
                tracing::warn!(chain = "pcap", index, error = %e, "skipping chain entry");
            }
        }
        chain
    }

    fn append_entry(&mut self, entry: &Value, index: usize, registry: &InprocRegistry) -> Result<EntryId> {
        let filter = entry_str(entry, "filter")?;
        let name = entry_name(entry, || format!("pcap-{}", index));
        let program = FilterProgram::compile(filter)?;
        let queue = OutputQueue::from_entry(entry, registry)?;
        Ok(self.push(name, program, queue))
    }

    /// Compile and append an entry
    pub fn append(&mut self, name: &str, expression: &str, queue: OutputQueue) -> Result<EntryId> {
        let program = FilterProgram::compile(expression)?;
        Ok(self.push(name.to_string(), program, queue))
    }

    fn push(&mut self, name: String, program: FilterProgram, queue: OutputQueue) -> EntryId {
        let id = self.next_id;
        self.next_id += 1;
        tracing::info!(chain = "pcap", id, name = %name, filter = program.expression(), "entry added");
        self.entries.push(FilterEntry {
            core: EntryCore::new(id, name, queue),
            program,
        });
        id
    }

    /// Remove by identifier
    pub fn remove(&mut self, id: EntryId) -> Option<FilterEntry> {
        let index = self.index_of(id)?;
        Some(self.entries.remove(index))
    }

    /// Remove by current position
    pub fn remove_at(&mut self, index: usize) -> Option<FilterEntry> {
        (index < self.entries.len()).then(|| self.entries.remove(index))
    }

    /// Remove the first entry compiled from `expression`
    pub fn remove_by_filter(&mut self, expression: &str) -> Option<FilterEntry> {
        let index = self
            .entries
            .iter()
            .position(|e| e.program.expression() == expression)?;
        Some(self.entries.remove(index))
    }

    /// Current position of an entry
    pub fn index_of(&self, id: EntryId) -> Option<usize> {
        self.entries.iter().position(|e| e.core.id() == id)
    }

    pub fn get(&self, id: EntryId) -> Option<&FilterEntry> {
        self.entries.iter().find(|e| e.core.id() == id)
    }

    pub fn entries(&self) -> &[FilterEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total matches across all entries
    pub fn matches(&self) -> u64 {
        self.matches.get()
    }

    /// Try every entry; `on_match` runs once per matching entry in chain order
    pub fn evaluate<'a>(&'a self, frame: &FrameView<'_>, mut on_match: impl FnMut(&'a EntryCore)) {
        for entry in &self.entries {
            if entry.program.matches(frame) {
                entry.core.record_match();
                self.matches.inc();
                on_match(&entry.core);
            }
        }
    }
}
