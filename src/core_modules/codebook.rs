// THEORY:
// The `Codebook` is the catalog of expected barcodes. Each target (a gene, a
// transcript, a control sequence...) owns one code: the pattern of fluorescence it is
// designed to light up across the (round, channel) grid of the experiment.
//
// Key architectural principles:
// 1.  **Immutable Catalog**: A codebook is validated once when it is built and never
//     changes afterwards. Decoders share it read-only, across threads if needed.
// 2.  **Consistent Shape**: Every code has exactly `n_rounds * n_channels` values, laid
//     out as `round * n_channels + channel`, the same layout the pixel vectorizer uses.
// 3.  **Insertion Order Matters**: Entries keep the order in which they were supplied.
//     The decoders resolve ties by picking the earliest entry, so this order is part
//     of the public contract.
//
// An empty codebook is representable on purpose; it is the decoders that refuse to
// run against one.

use crate::error::{Result, SpotDecodeError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// One target and the code it is expected to produce.
#[derive(Debug, Clone, PartialEq)]
pub struct CodebookEntry {
    pub target: String,
    /// Expected intensities, indexed by `round * n_channels + channel`.
    pub code: Vec<f32>,
}

impl CodebookEntry {
    pub fn new(target: impl Into<String>, code: Vec<f32>) -> Self {
        Self {
            target: target.into(),
            code,
        }
    }
}

/// Upper bound on `rounds * channels` accepted from a codebook document.
const MAX_CODE_LENGTH: usize = 1 << 16;

/// The immutable catalog of targets and their codes.
#[derive(Debug, Clone, PartialEq)]
pub struct Codebook {
    n_rounds: usize,
    n_channels: usize,
    entries: Vec<CodebookEntry>,
}

/// One `(round, channel, value)` cell of a codeword in the JSON document.
#[derive(Debug, Serialize, Deserialize)]
struct CodewordCell {
    r: usize,
    c: usize,
    #[serde(default = "default_cell_value")]
    v: f32,
}

fn default_cell_value() -> f32 {
    1.0
}

#[derive(Debug, Serialize, Deserialize)]
struct CodebookRecord {
    target: String,
    codeword: Vec<CodewordCell>,
}

impl Codebook {
    pub fn new(n_rounds: usize, n_channels: usize, entries: Vec<CodebookEntry>) -> Result<Self> {
        let expected = n_rounds * n_channels;
        let mut seen = HashSet::with_capacity(entries.len());
        for entry in &entries {
            if entry.code.len() != expected {
                return Err(SpotDecodeError::CodeShapeMismatch {
                    target: entry.target.clone(),
                    expected,
                    found: entry.code.len(),
                });
            }
            if !seen.insert(entry.target.as_str()) {
                return Err(SpotDecodeError::DuplicateTarget(entry.target.clone()));
            }
        }
        Ok(Self {
            n_rounds,
            n_channels,
            entries,
        })
    }

    /// Parses the JSON codebook document: an array of
    /// `{"target": name, "codeword": [{"r": round, "c": channel, "v": value}, ...]}`.
    /// Cells that are not listed are zero and `v` defaults to 1.
    pub fn from_json_str(document: &str) -> Result<Self> {
        let records: Vec<CodebookRecord> = serde_json::from_str(document)?;
        if records.is_empty() {
            return Err(SpotDecodeError::EmptyCodebook);
        }

        let cells = records.iter().flat_map(|record| record.codeword.iter());
        let n_rounds = cells.clone().map(|cell| cell.r).max().map_or(Some(0), |r| r.checked_add(1));
        let n_channels = cells.map(|cell| cell.c).max().map_or(Some(0), |c| c.checked_add(1));
        let (Some(n_rounds), Some(n_channels)) = (n_rounds, n_channels) else {
            return Err(SpotDecodeError::InvalidCodebook("round or channel index out of range".to_string()));
        };
        if n_rounds == 0 || n_channels == 0 {
            return Err(SpotDecodeError::InvalidCodebook("no codeword cells in document".to_string()));
        }
        let code_length = n_rounds
            .checked_mul(n_channels)
            .filter(|length| *length <= MAX_CODE_LENGTH)
            .ok_or_else(|| {
                SpotDecodeError::InvalidCodebook(format!(
                    "{n_rounds} rounds x {n_channels} channels exceeds {MAX_CODE_LENGTH} code values"
                ))
            })?;

        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            let mut code = vec![0.0f32; code_length];
            let mut listed = vec![false; code_length];
            for cell in &record.codeword {
                let slot = cell.r * n_channels + cell.c;
                if listed[slot] {
                    return Err(SpotDecodeError::InvalidCodebook(format!(
                        "target {} lists round {} channel {} twice",
                        record.target, cell.r, cell.c
                    )));
                }
                listed[slot] = true;
                code[slot] = cell.v;
            }
            entries.push(CodebookEntry::new(record.target, code));
        }

        Self::new(n_rounds, n_channels, entries)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let document = std::fs::read_to_string(path)?;
        Self::from_json_str(&document)
    }

    /// Serializes back into the sparse JSON document format (zero cells are omitted).
    pub fn to_json_string(&self) -> Result<String> {
        let records: Vec<CodebookRecord> = self
            .entries
            .iter()
            .map(|entry| CodebookRecord {
                target: entry.target.clone(),
                codeword: entry
                    .code
                    .iter()
                    .enumerate()
                    .filter(|(_, value)| **value != 0.0)
                    .map(|(i, value)| CodewordCell {
                        r: i / self.n_channels,
                        c: i % self.n_channels,
                        v: *value,
                    })
                    .collect(),
            })
            .collect();
        Ok(serde_json::to_string_pretty(&records)?)
    }

    /// Builds a codebook in which every code has exactly one channel on per round.
    ///
    /// Code `k` switches on channel `(k / n_channels^r) % n_channels` in round `r`, so
    /// the codes are distinct and the result is deterministic. Names default to
    /// `target_0`, `target_1`, ...
    pub fn synthetic_one_hot(
        n_rounds: usize,
        n_channels: usize,
        n_codes: usize,
        target_names: Option<Vec<String>>,
    ) -> Result<Self> {
        let names = match target_names {
            Some(names) if names.len() != n_codes => {
                return Err(SpotDecodeError::InvalidCodebook(format!(
                    "{} target names supplied for {} codes",
                    names.len(),
                    n_codes
                )));
            }
            Some(names) => names,
            None => (0..n_codes).map(|k| format!("target_{k}")).collect(),
        };

        let available = u32::try_from(n_rounds)
            .ok()
            .and_then(|rounds| n_channels.checked_pow(rounds));
        if matches!(available, Some(available) if available < n_codes) {
            return Err(SpotDecodeError::InvalidCodebook(format!(
                "cannot build {n_codes} distinct one-hot codes from {n_rounds} rounds and {n_channels} channels"
            )));
        }

        let entries = names
            .into_iter()
            .enumerate()
            .map(|(k, name)| {
                let mut code = vec![0.0f32; n_rounds * n_channels];
                let mut rest = k;
                for round in 0..n_rounds {
                    code[round * n_channels + rest % n_channels] = 1.0;
                    rest /= n_channels;
                }
                CodebookEntry::new(name, code)
            })
            .collect();

        Self::new(n_rounds, n_channels, entries)
    }

    pub fn n_rounds(&self) -> usize {
        self.n_rounds
    }

    pub fn n_channels(&self) -> usize {
        self.n_channels
    }

    /// Length of every code vector.
    pub fn code_length(&self) -> usize {
        self.n_rounds * self.n_channels
    }

    pub fn entries(&self) -> &[CodebookEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn target_names(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.target.clone()).collect()
    }

    pub fn index_of(&self, target: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.target == target)
    }
}

/// The brightest channel of every round, first maximum wins. Rounds whose values are
/// all zero (or not comparable) yield `None`.
pub fn max_channel_per_round(values: &[f32], n_rounds: usize, n_channels: usize) -> Vec<Option<usize>> {
    (0..n_rounds)
        .map(|round| {
            let row = &values[round * n_channels..(round + 1) * n_channels];
            let mut best: Option<(usize, f32)> = None;
            for (channel, value) in row.iter().copied().enumerate() {
                if value.is_nan() || value <= 0.0 {
                    continue;
                }
                if best.is_none_or(|(_, top)| value > top) {
                    best = Some((channel, value));
                }
            }
            best.map(|(channel, _)| channel)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_hot_codebook_has_one_channel_per_round() {
        let codebook = Codebook::synthetic_one_hot(4, 2, 3, None).unwrap();
        assert_eq!(codebook.len(), 3);
        assert_eq!(codebook.code_length(), 8);
        for entry in codebook.entries() {
            for round in 0..4 {
                let on: f32 = entry.code[round * 2..round * 2 + 2].iter().sum();
                assert_eq!(on, 1.0);
            }
        }
        let codes: HashSet<Vec<u32>> = codebook
            .entries()
            .iter()
            .map(|entry| entry.code.iter().map(|v| v.to_bits()).collect())
            .collect();
        assert_eq!(codes.len(), 3);
    }

    #[test]
    fn one_hot_codebook_keeps_target_names_in_order() {
        let names = vec!["a".to_string(), "b".to_string()];
        let codebook = Codebook::synthetic_one_hot(3, 6, 2, Some(names.clone())).unwrap();
        assert_eq!(codebook.target_names(), names);
    }

    #[test]
    fn one_hot_codebook_rejects_wrong_number_of_names() {
        let result = Codebook::synthetic_one_hot(2, 2, 3, Some(vec!["a".into(), "b".into()]));
        assert!(matches!(result, Err(SpotDecodeError::InvalidCodebook(_))));
    }

    #[test]
    fn one_hot_codebook_rejects_too_many_codes() {
        assert!(Codebook::synthetic_one_hot(2, 2, 5, None).is_err());
    }

    #[test]
    fn duplicate_targets_and_bad_shapes_are_rejected() {
        let duplicate = Codebook::new(
            1,
            2,
            vec![CodebookEntry::new("a", vec![1.0, 0.0]), CodebookEntry::new("a", vec![0.0, 1.0])],
        );
        assert!(matches!(duplicate, Err(SpotDecodeError::DuplicateTarget(_))));

        let short = Codebook::new(2, 2, vec![CodebookEntry::new("a", vec![1.0, 0.0])]);
        assert!(matches!(short, Err(SpotDecodeError::CodeShapeMismatch { found: 2, .. })));
    }

    #[test]
    fn parses_json_document() {
        let document = r#"[
            {"target": "ACTB", "codeword": [{"r": 0, "c": 0, "v": 1}, {"r": 1, "c": 1}]},
            {"target": "GAPDH", "codeword": [{"r": 0, "c": 1, "v": 0.5}, {"r": 1, "c": 0, "v": 1}]}
        ]"#;
        let codebook = Codebook::from_json_str(document).unwrap();
        assert_eq!(codebook.n_rounds(), 2);
        assert_eq!(codebook.n_channels(), 2);
        assert_eq!(codebook.entries()[0].code, vec![1.0, 0.0, 0.0, 1.0]);
        assert_eq!(codebook.entries()[1].code, vec![0.0, 0.5, 1.0, 0.0]);
        assert_eq!(codebook.index_of("GAPDH"), Some(1));

        let reparsed = Codebook::from_json_str(&codebook.to_json_string().unwrap()).unwrap();
        assert_eq!(reparsed, codebook);
    }

    #[test]
    fn json_document_missing_fields_is_an_error() {
        let document = r#"[{"target": "ACTB", "codeword": [{"r": 0, "v": 1}]}]"#;
        assert!(matches!(Codebook::from_json_str(document), Err(SpotDecodeError::Json(_))));
        assert!(matches!(Codebook::from_json_str("[]"), Err(SpotDecodeError::EmptyCodebook)));
    }

    #[test]
    fn json_document_with_huge_indices_is_rejected() {
        let overflowing = r#"[{"target": "A", "codeword": [{"r": 18446744073709551615, "c": 0}]}]"#;
        assert!(matches!(Codebook::from_json_str(overflowing), Err(SpotDecodeError::InvalidCodebook(_))));

        let oversized = r#"[{"target": "A", "codeword": [{"r": 4000000000, "c": 4000000000}]}]"#;
        let error = Codebook::from_json_str(oversized).unwrap_err();
        assert!(matches!(error, SpotDecodeError::InvalidCodebook(_)));
        assert!(error.is_configuration());
    }

    #[test]
    fn repeated_cell_is_rejected_even_when_zero() {
        let document = r#"[{"target": "A", "codeword": [{"r": 0, "c": 0, "v": 0}, {"r": 0, "c": 0, "v": 1}]}]"#;
        assert!(matches!(Codebook::from_json_str(document), Err(SpotDecodeError::InvalidCodebook(_))));
    }

    #[test]
    fn max_channel_skips_dark_rounds() {
        let values = [0.1, 0.9, 0.0, 0.0, 0.5, 0.5];
        assert_eq!(max_channel_per_round(&values, 3, 2), vec![Some(1), None, Some(0)]);
    }
}
