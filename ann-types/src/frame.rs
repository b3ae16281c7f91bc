use crate::categorical::Categorical;
use anyhow::{bail, Error};

/// One named annotation in a [`Frame`].
#[derive(Clone, Debug, PartialEq)]
pub enum Column {
    Numeric(Vec<f64>),
    Text(Vec<String>),
    Categorical(Categorical),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Numeric(v) => v.len(),
            Column::Text(v) => v.len(),
            Column::Categorical(c) => c.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn select(&self, rows: &[usize]) -> Column {
        match self {
            Column::Numeric(v) => Column::Numeric(rows.iter().map(|&r| v[r]).collect()),
            Column::Text(v) => Column::Text(rows.iter().map(|&r| v[r].clone()).collect()),
            Column::Categorical(c) => Column::Categorical(c.select(rows)),
        }
    }

    pub fn as_numeric(&self) -> Option<&[f64]> {
        match self {
            Column::Numeric(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_categorical(&self) -> Option<&Categorical> {
        match self {
            Column::Categorical(c) => Some(c),
            _ => None,
        }
    }

    /// View the column as categories. Text and numeric values are encoded by
    /// their string form; a categorical column is returned as is.
    pub fn to_categorical(&self) -> Categorical {
        match self {
            Column::Categorical(c) => c.clone(),
            Column::Text(v) => Categorical::from_labels(v),
            Column::Numeric(v) => {
                let labels = v.iter().map(|x| x.to_string()).collect::<Vec<_>>();
                Categorical::from_labels(&labels)
            }
        }
    }

    /// String form of entry `i`, as written to tables.
    pub fn display(&self, i: usize) -> String {
        match self {
            Column::Numeric(v) => v[i].to_string(),
            Column::Text(v) => v[i].clone(),
            Column::Categorical(c) => c.label(i).to_string(),
        }
    }
}

/// Metadata table keyed by an index of identifiers, with ordered named columns.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Frame {
    pub index: Vec<String>,
    columns: Vec<(String, Column)>,
}

impl Frame {
    pub fn new(index: Vec<String>) -> Frame {
        Frame {
            index,
            columns: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.columns.iter().map(|(n, c)| (n.as_str(), c))
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Add a column, replacing in place any column of the same name.
    pub fn insert(&mut self, name: impl Into<String>, column: Column) -> Result<(), Error> {
        let name = name.into();
        if column.len() != self.len() {
            bail!(
                "column {} has {} entries, frame has {} rows",
                name,
                column.len(),
                self.len()
            );
        }
        match self.columns.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = column,
            None => self.columns.push((name, column)),
        }
        Ok(())
    }

    /// Drop a column, returning it if it was present.
    pub fn remove(&mut self, name: &str) -> Option<Column> {
        let pos = self.columns.iter().position(|(n, _)| n == name)?;
        Some(self.columns.remove(pos).1)
    }

    /// Rows restricted to `rows`, in that order.
    pub fn select_rows(&self, rows: &[usize]) -> Frame {
        Frame {
            index: rows.iter().map(|&r| self.index[r].clone()).collect(),
            columns: self
                .columns
                .iter()
                .map(|(n, c)| (n.clone(), c.select(rows)))
                .collect(),
        }
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.iter().position(|x| x == id)
    }
}
