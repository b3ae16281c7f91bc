use std::collections::BTreeSet;

/// Category labels for a boolean annotation, in code order.
pub const FLAG_CATEGORIES: [&str; 2] = ["False", "True"];

/// A categorical annotation: each entry stores a code into `categories`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Categorical {
    pub categories: Vec<String>,
    pub codes: Vec<u32>,
}

impl Categorical {
    /// Encode string labels. Categories are the distinct labels, sorted.
    pub fn from_labels<S: AsRef<str>>(labels: &[S]) -> Categorical {
        let categories = labels
            .iter()
            .map(|l| l.as_ref().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        let codes = labels
            .iter()
            .map(|l| {
                // categories is sorted and holds every label
                categories
                    .binary_search_by(|c| c.as_str().cmp(l.as_ref()))
                    .unwrap_or_default() as u32
            })
            .collect();
        Categorical { categories, codes }
    }

    /// Encode flags with the fixed categories `False`, `True`.
    pub fn from_flags(flags: &[bool]) -> Categorical {
        Categorical {
            categories: FLAG_CATEGORIES.iter().map(|s| s.to_string()).collect(),
            codes: flags.iter().map(|&f| u32::from(f)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn label(&self, i: usize) -> &str {
        &self.categories[self.codes[i] as usize]
    }

    /// Entries restricted to `rows`, categories unchanged.
    pub fn select(&self, rows: &[usize]) -> Categorical {
        Categorical {
            categories: self.categories.clone(),
            codes: rows.iter().map(|&r| self.codes[r]).collect(),
        }
    }
}
