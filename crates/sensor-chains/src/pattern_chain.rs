//! Pattern Chain
//!
//! Regular expressions over string fields of the header record. A match is
//! "pattern found in the field" XOR the entry's invert flag. Records without
//! the field never match, inverted or not.

use crate::queue::{InprocRegistry, OutputQueue};
use crate::{entry_name, entry_str, ChainError, EntryCore, EntryId, Result};
use regex::Regex;
use sensor_common::{AtomicCounter, Metadata};
use serde_json::Value;
use std::str::FromStr;

/// Record field a pattern is run against
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PatternField {
    /// DNS query name
    #[default]
    DnsName,
    /// Any DNS answer value
    DnsAnswer,
}

impl FromStr for PatternField {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dns_name" => Ok(Self::DnsName),
            "dns_answer" | "dns_values" => Ok(Self::DnsAnswer),
            other => Err(ChainError::InvalidEntry(format!("unknown pattern field: {}", other))),
        }
    }
}

/// One compiled pattern and its queue
#[derive(Debug)]
pub struct PatternEntry {
    core: EntryCore,
    regex: Regex,
    invert: bool,
    field: PatternField,
}

impl PatternEntry {
    pub fn core(&self) -> &EntryCore {
        &self.core
    }

    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    pub fn invert(&self) -> bool {
        self.invert
    }

    pub fn field(&self) -> PatternField {
        self.field
    }

    /// Whether the record carries the field this entry reads
    pub fn applies_to(&self, metadata: &Metadata) -> bool {
        match self.field {
            PatternField::DnsName => metadata.dns_name.is_some(),
            PatternField::DnsAnswer => !metadata.dns_answers.is_empty(),
        }
    }

    /// Match decision for one record
    pub fn is_match(&self, metadata: &Metadata) -> bool {
        if !self.applies_to(metadata) {
            return false;
        }
        let found = match self.field {
            PatternField::DnsName => self.regex.is_match(metadata.dns_name()),
            PatternField::DnsAnswer => metadata.dns_answers.iter().any(|v| self.regex.is_match(v)),
        };
        found ^ self.invert
    }
}

/// Insertion-ordered pattern entries
#[derive(Debug, Default)]
pub struct PatternChain {
    entries: Vec<PatternEntry>,
    next_id: EntryId,
    matches: AtomicCounter,
}

impl PatternChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `re_chain` entries, skipping the ones that fail
    pub fn from_config(entries: &[Value], registry: &InprocRegistry) -> Self {
        let mut chain = Self::new();
        for (index, entry) in entries.iter().enumerate() {
            if let Err(e) = chain.append_entry(entry, index, registry) {
                tracing::warn!(chain = "re", index, error = %e, "skipping chain entry");
            }
        }
        chain
    }

    fn append_entry(&mut self, entry: &Value, index: usize, registry: &InprocRegistry) -> Result<EntryId> {
        let pattern = entry_str(entry, "re")?;
        let name = entry_name(entry, || format!("re-{}", index));
        let invert = match entry.get("invert") {
            None => false,
            Some(v) => v
                .as_bool()
                .ok_or_else(|| ChainError::InvalidEntry("invert must be a boolean".into()))?,
        };
        let field = match entry.get("field").and_then(Value::as_str) {
            Some(s) => s.parse()?,
            None => PatternField::default(),
        };
        let regex = compile(pattern)?;
        let queue = OutputQueue::from_entry(entry, registry)?;
        Ok(self.push(name, regex, invert, field, queue))
    }

    /// Compile and append an entry
    pub fn append(
        &mut self,
        name: &str,
        pattern: &str,
        invert: bool,
        field: PatternField,
        queue: OutputQueue,
    ) -> Result<EntryId> {
        let regex = compile(pattern)?;
        Ok(self.push(name.to_string(), regex, invert, field, queue))
    }

    fn push(&mut self, name: String, regex: Regex, invert: bool, field: PatternField, queue: OutputQueue) -> EntryId {
        let id = self.next_id;
        self.next_id += 1;
        tracing::info!(chain = "re", id, name = %name, re = regex.as_str(), invert, "entry added");
        self.entries.push(PatternEntry {
            core: EntryCore::new(id, name, queue),
            regex,
            invert,
            field,
        });
        id
    }

    pub fn remove(&mut self, id: EntryId) -> Option<PatternEntry> {
        let index = self.index_of(id)?;
        Some(self.entries.remove(index))
    }

    pub fn remove_at(&mut self, index: usize) -> Option<PatternEntry> {
        (index < self.entries.len()).then(|| self.entries.remove(index))
    }

    /// Remove the first entry compiled from `pattern`
    pub fn remove_by_pattern(&mut self, pattern: &str) -> Option<PatternEntry> {
        let index = self.entries.iter().position(|e| e.pattern() == pattern)?;
        Some(self.entries.remove(index))
    }

    pub fn index_of(&self, id: EntryId) -> Option<usize> {
        self.entries.iter().position(|e| e.core.id() == id)
    }

    pub fn get(&self, id: EntryId) -> Option<&PatternEntry> {
        self.entries.iter().find(|e| e.core.id() == id)
    }

    pub fn entries(&self) -> &[PatternEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn matches(&self) -> u64 {
        self.matches.get()
    }

    /// Try every entry; `on_match` runs once per matching entry in chain order
    pub fn evaluate<'a>(&'a self, metadata: &Metadata, mut on_match: impl FnMut(&'a EntryCore)) {
        for entry in &self.entries {
            if entry.is_match(metadata) {
                entry.core.record_match();
                self.matches.inc();
                on_match(&entry.core);
            }
        }
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| ChainError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{ContentType, QueueDescriptor, QueueFormat, SocketKind};
    use proptest::prelude::*;
    use sensor_common::frame::testing::tcp4;
    use sensor_common::{Direction, FrameView, HeaderExtractor, MetadataExtractor};

    fn queue(registry: &InprocRegistry) -> OutputQueue {
        OutputQueue::open(
            QueueDescriptor {
                url: "inproc://re".into(),
                kind: SocketKind::Pub,
                format: QueueFormat::Metadata,
                content: ContentType::Pcap,
            },
            registry,
        )
        .unwrap()
    }

    fn record(dns_name: Option<&str>, answers: &[&str]) -> Metadata {
        let frame = tcp4([1, 1, 1, 1], [2, 2, 2, 2], 1, 2, 0);
        let view = FrameView::parse(&frame).unwrap();
        let mut md = HeaderExtractor::default().extract(0, Direction::Rx, &view);
        md.dns_name = dns_name.map(str::to_owned);
        md.dns_answers = answers.iter().map(|s| s.to_string()).collect();
        md
    }

    #[test]
    fn test_name_and_answer_fields() {
        let registry = InprocRegistry::new();
        let mut chain = PatternChain::new();
        let by_name = chain
            .append("name", r"\.example\.com$", false, PatternField::DnsName, queue(&registry))
            .unwrap();
        let by_answer = chain
            .append("answer", r"^10\.", false, PatternField::DnsAnswer, queue(&registry))
            .unwrap();

        let md = record(Some("www.example.com"), &["cdn.example.net", "10.9.8.7"]);
        let mut hits = Vec::new();
        chain.evaluate(&md, |e| hits.push(e.id()));
        assert_eq!(hits, vec![by_name, by_answer]);
        assert_eq!(chain.matches(), 2);
    }

    #[test]
    fn test_absent_field_never_matches() {
        let registry = InprocRegistry::new();
        let mut chain = PatternChain::new();
        chain
            .append("not-evil", r"evil\.com$", true, PatternField::DnsName, queue(&registry))
            .unwrap();
        chain
            .append("not-corp", "corp", true, PatternField::DnsAnswer, queue(&registry))
            .unwrap();
        chain
            .append("empty", "^$", false, PatternField::DnsName, queue(&registry))
            .unwrap();

        // plain TCP carries no DNS fields
        let md = record(None, &[]);
        let mut count = 0;
        for _ in 0..100 {
            chain.evaluate(&md, |_| count += 1);
        }
        assert_eq!(count, 0);
        assert_eq!(chain.matches(), 0);

        let md = record(Some("www.example.org"), &["10.0.0.1"]);
        let mut hits = Vec::new();
        chain.evaluate(&md, |e| hits.push(e.name().to_string()));
        assert_eq!(hits, vec!["not-evil", "not-corp"]);
    }

    #[test]
    fn test_from_config() {
        let registry = InprocRegistry::new();
        let entries = vec![
            serde_json::json!({"re": "evil", "invert": true, "nm_queue_url": "inproc://a", "nm_queue_type": "PUSH"}),
            serde_json::json!({"re": "(", "nm_queue_url": "inproc://a", "nm_queue_type": "PUSH"}),
            serde_json::json!({"re": "x", "field": "ttl", "nm_queue_url": "inproc://a", "nm_queue_type": "PUSH"}),
            serde_json::json!({"re": "x", "invert": "yes", "nm_queue_url": "inproc://a", "nm_queue_type": "PUSH"}),
        ];
        let chain = PatternChain::from_config(&entries, &registry);
        assert_eq!(chain.len(), 1);
        assert!(chain.entries()[0].invert());
        assert_eq!(chain.entries()[0].core().name(), "re-0");
    }

    #[test]
    fn test_remove_by_pattern() {
        let registry = InprocRegistry::new();
        let mut chain = PatternChain::new();
        let a = chain.append("a", "a+", false, PatternField::DnsName, queue(&registry)).unwrap();
        let b = chain.append("b", "b+", false, PatternField::DnsName, queue(&registry)).unwrap();

        assert_eq!(chain.remove_by_pattern("a+").unwrap().core().id(), a);
        assert_eq!(chain.index_of(b), Some(0));
        assert!(chain.remove(a).is_none());
    }

    proptest! {
        #[test]
        fn test_invert_is_complement(
            name in proptest::option::of("[a-z.]{0,20}"),
            answers in proptest::collection::vec("[a-z0-9.]{0,12}", 0..3),
            pattern in "[a-z]{1,3}",
        ) {
            let registry = InprocRegistry::new();
            let mut chain = PatternChain::new();
            for field in [PatternField::DnsName, PatternField::DnsAnswer] {
                chain.append("plain", &pattern, false, field, queue(&registry)).unwrap();
                chain.append("inverted", &pattern, true, field, queue(&registry)).unwrap();
            }

            let answers: Vec<&str> = answers.iter().map(String::as_str).collect();
            let md = record(name.as_deref(), &answers);
            for pair in chain.entries().chunks(2) {
                if pair[0].applies_to(&md) {
                    prop_assert_ne!(pair[0].is_match(&md), pair[1].is_match(&md));
                } else {
                    prop_assert!(!pair[0].is_match(&md) && !pair[1].is_match(&md));
                }
            }
        }
    }
}
