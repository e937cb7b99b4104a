use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A stable document identifier derived from the document's source name.
///
/// The numeric value is the key used in every redb table; the short hex
/// prefix is what humans see (e.g. `#a1b2c3`).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct DocumentId(u64);

impl DocumentId {
    /// Generate a stable document ID from a source name (usually the
    /// uploaded filename or an upstream identifier).
    pub fn new(source_name: &str) -> Self {
        let hash = blake3::hash(source_name.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&hash.as_bytes()[..8]);
        Self(u64::from_be_bytes(prefix))
    }

    pub fn from_raw(numeric: u64) -> Self {
        Self(numeric)
    }

    pub fn numeric(self) -> u64 {
        self.0
    }

    /// The six-character hex form used for display.
    pub fn short(self) -> String {
        self.short_hex(6)
    }

    /// A longer hex prefix, clamped to `6..=16` characters, for when six
    /// characters collide.
    pub fn short_hex(self, len: usize) -> String {
        let len = len.clamp(6, 16);
        let full = format!("{:016x}", self.0);
        full[..len].to_string()
    }

    /// Resolve user input against the known documents: a hex prefix of
    /// any length (such as the `#a1b2c3` display form), the full hex form,
    /// or a decimal ID. Fails with `NotFound` when nothing matches and
    /// with `Validation` when the input is ambiguous.
    pub fn resolve(
        input: &str,
        known: impl IntoIterator<Item = DocumentId>,
    ) -> Result<Self> {
        let needle = input.trim().trim_start_matches('#').to_ascii_lowercase();
        if needle.is_empty() {
            return Err(Error::Validation("document id is empty".to_string()));
        }
        let is_hex = needle.len() <= 16 && needle.chars().all(|c| c.is_ascii_hexdigit());
        let decimal = needle.parse::<u64>().ok();

        let mut matches: Vec<DocumentId> = known
            .into_iter()
            .filter(|id| {
                (is_hex && id.short_hex(16).starts_with(&needle))
                    || decimal == Some(id.numeric())
            })
            .collect();
        matches.sort();
        matches.dedup();

        match matches.as_slice() {
            [] => Err(Error::NotFound {
                kind: "document",
                name: input.trim().to_string(),
            }),
            [only] => Ok(*only),
            many => Err(Error::Validation(format!(
                "'{input}' matches {} documents: {}",
                many.len(),
                many.iter()
                    .map(|id| format!("#{}", id.short_hex(16)))
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let a = DocumentId::new("report.pdf");
        let b = DocumentId::new("report.pdf");
        assert_eq!(a, b);
    }

    #[test]
    fn different_inputs_differ() {
        let a = DocumentId::new("report.pdf");
        let b = DocumentId::new("invoice.pdf");
        assert_ne!(a.numeric(), b.numeric());
    }

    #[test]
    fn display_has_hash_prefix() {
        let id = DocumentId::new("report.pdf");
        let s = id.to_string();
        assert!(s.starts_with('#'));
        assert_eq!(s.len(), 7);
    }

    #[test]
    fn short_hex_clamps() {
        let id = DocumentId::new("report.pdf");
        assert_eq!(id.short_hex(2).len(), 6);
        assert_eq!(id.short_hex(100).len(), 16);
        assert!(id.short_hex(10).starts_with(&id.short()));
    }

    #[test]
    fn resolve_accepts_display_form() {
        let report = DocumentId::new("report.pdf");
        let invoice = DocumentId::new("invoice.pdf");
        let known = [report, invoice];

        assert_eq!(
            DocumentId::resolve(&report.to_string(), known).unwrap(),
            report
        );
        assert_eq!(
            DocumentId::resolve(&invoice.short_hex(16), known).unwrap(),
            invoice
        );
        assert_eq!(
            DocumentId::resolve(&report.numeric().to_string(), known).unwrap(),
            report
        );
    }

    #[test]
    fn resolve_reports_missing_and_ambiguous() {
        let a = DocumentId::from_raw(0xabc1_0000_0000_0000);
        let b = DocumentId::from_raw(0xabc2_0000_0000_0000);

        assert!(matches!(
            DocumentId::resolve("#ffffff", [a, b]),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            DocumentId::resolve("#abc", [a, b]),
            Err(Error::Validation(_))
        ));
        assert_eq!(DocumentId::resolve("#ABC2", [a, b]).unwrap(), b);
        assert!(matches!(
            DocumentId::resolve("  ", [a, b]),
            Err(Error::Validation(_))
        ));
    }
}
