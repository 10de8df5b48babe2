//! Column-role descriptor for input tables.
//!
//! Every column the encoder looks at is named here with exactly one role.
//! `user_side` / `item_side` do not add columns: they tag columns already
//! listed under `sparse` or `dense` as describing the user or the item.

use crate::error::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnRef {
    Position(usize),
    Name(String),
}

impl ColumnRef {
    pub fn name(name: impl Into<String>) -> Self {
        ColumnRef::Name(name.into())
    }

    /// Resolves against a header. Positions are checked later, per row.
    pub fn resolve(&self, header: &[String], role: &'static str) -> Result<usize, SchemaError> {
        match self {
            ColumnRef::Position(pos) => Ok(*pos),
            ColumnRef::Name(name) => header
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| SchemaError::MissingColumn {
                    column: name.clone(),
                    role,
                }),
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnRef::Position(pos) => write!(f, "#{}", pos),
            ColumnRef::Name(name) => write!(f, "{}", name),
        }
    }
}

impl From<&str> for ColumnRef {
    fn from(name: &str) -> Self {
        ColumnRef::Name(name.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureSide {
    User,
    Item,
    Context,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRoles {
    pub user: ColumnRef,
    pub item: ColumnRef,
    pub label: ColumnRef,
    #[serde(default)]
    pub sparse: Vec<ColumnRef>,
    #[serde(default)]
    pub dense: Vec<ColumnRef>,
    #[serde(default)]
    pub user_side: Vec<ColumnRef>,
    #[serde(default)]
    pub item_side: Vec<ColumnRef>,
}

impl Default for ColumnRoles {
    fn default() -> Self {
        Self::pure("user", "item", "label")
    }
}

impl ColumnRoles {
    /// Identifiers and label only, no side features.
    pub fn pure(user: impl Into<ColumnRef>, item: impl Into<ColumnRef>, label: impl Into<ColumnRef>) -> Self {
        Self {
            user: user.into(),
            item: item.into(),
            label: label.into(),
            sparse: Vec::new(),
            dense: Vec::new(),
            user_side: Vec::new(),
            item_side: Vec::new(),
        }
    }

    pub fn with_sparse(mut self, columns: &[&str]) -> Self {
        self.sparse.extend(columns.iter().map(|c| ColumnRef::from(*c)));
        self
    }

    pub fn with_dense(mut self, columns: &[&str]) -> Self {
        self.dense.extend(columns.iter().map(|c| ColumnRef::from(*c)));
        self
    }

    pub fn with_user_side(mut self, columns: &[&str]) -> Self {
        self.user_side.extend(columns.iter().map(|c| ColumnRef::from(*c)));
        self
    }

    pub fn with_item_side(mut self, columns: &[&str]) -> Self {
        self.item_side.extend(columns.iter().map(|c| ColumnRef::from(*c)));
        self
    }

    pub fn side_of(&self, column: &ColumnRef) -> FeatureSide {
        if self.user_side.contains(column) {
            FeatureSide::User
        } else if self.item_side.contains(column) {
            FeatureSide::Item
        } else {
            FeatureSide::Context
        }
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        let mut seen = HashSet::new();
        let all = [&self.user, &self.item, &self.label]
            .into_iter()
            .chain(self.sparse.iter())
            .chain(self.dense.iter());
        for column in all {
            if !seen.insert(column) {
                return Err(SchemaError::DuplicateRole {
                    column: column.to_string(),
                });
            }
        }

        for column in self.user_side.iter().chain(self.item_side.iter()) {
            if !self.sparse.contains(column) && !self.dense.contains(column) {
                return Err(SchemaError::UndeclaredSideColumn {
                    column: column.to_string(),
                });
            }
        }
        if let Some(column) = self.user_side.iter().find(|c| self.item_side.contains(c)) {
            return Err(SchemaError::DuplicateRole {
                column: column.to_string(),
            });
        }

        Ok(())
    }

    /// Column positions resolved against a header, in role order.
    pub fn resolve(&self, header: &[String]) -> Result<ResolvedColumns, SchemaError> {
        self.validate()?;
        let resolved = ResolvedColumns {
            user: self.user.resolve(header, "user")?,
            item: self.item.resolve(header, "item")?,
            label: self.label.resolve(header, "label")?,
            sparse: self
                .sparse
                .iter()
                .map(|c| c.resolve(header, "sparse"))
                .collect::<Result<_, _>>()?,
            dense: self
                .dense
                .iter()
                .map(|c| c.resolve(header, "dense"))
                .collect::<Result<_, _>>()?,
        };

        // a name and a position can still point at the same column
        let mut seen = HashSet::new();
        let positions = [resolved.user, resolved.item, resolved.label]
            .into_iter()
            .chain(resolved.sparse.iter().copied())
            .chain(resolved.dense.iter().copied());
        for position in positions {
            if !seen.insert(position) {
                return Err(SchemaError::DuplicateRole {
                    column: header
                        .get(position)
                        .cloned()
                        .unwrap_or_else(|| ColumnRef::Position(position).to_string()),
                });
            }
        }
        Ok(resolved)
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedColumns {
    pub user: usize,
    pub item: usize,
    pub label: usize,
    pub sparse: Vec<usize>,
    pub dense: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Vec<String> {
        ["user", "item", "label", "genre", "age"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_resolve_by_name_and_position() {
        let roles = ColumnRoles::pure(ColumnRef::Position(0), "item", "label").with_sparse(&["genre"]);
        let resolved = roles.resolve(&header()).unwrap();
        assert_eq!(resolved.user, 0);
        assert_eq!(resolved.item, 1);
        assert_eq!(resolved.sparse, vec![3]);
    }

    #[test]
    fn test_name_and_position_for_same_column_rejected() {
        let roles = ColumnRoles::pure(ColumnRef::Position(0), "user", "label");
        assert!(roles.validate().is_ok());
        let err = roles.resolve(&header()).unwrap_err();
        match err {
            SchemaError::DuplicateRole { column } => assert_eq!(column, "user"),
            other => panic!("unexpected error {:?}", other),
        }

        let with_genre = ColumnRoles::default().with_sparse(&["genre"]);
        let mut roles = with_genre.clone();
        roles.dense.push(ColumnRef::Position(3));
        assert!(matches!(roles.resolve(&header()), Err(SchemaError::DuplicateRole { .. })));
        assert!(with_genre.resolve(&header()).is_ok());
    }

    #[test]
    fn test_missing_label_column() {
        let roles = ColumnRoles::pure("user", "item", "rating");
        let err = roles.resolve(&header()).unwrap_err();
        assert!(matches!(err, SchemaError::MissingColumn { role: "label", .. }));
    }

    #[test]
    fn test_side_column_must_be_declared() {
        let roles = ColumnRoles::default().with_item_side(&["genre"]);
        assert!(matches!(
            roles.validate(),
            Err(SchemaError::UndeclaredSideColumn { .. })
        ));

        let roles = ColumnRoles::default()
            .with_sparse(&["genre"])
            .with_dense(&["age"])
            .with_item_side(&["genre"])
            .with_user_side(&["age"]);
        assert!(roles.validate().is_ok());
        assert_eq!(roles.side_of(&ColumnRef::from("genre")), FeatureSide::Item);
        assert_eq!(roles.side_of(&ColumnRef::from("age")), FeatureSide::User);
    }

    #[test]
    fn test_duplicate_role_rejected() {
        let roles = ColumnRoles::default().with_sparse(&["item"]);
        assert!(matches!(roles.validate(), Err(SchemaError::DuplicateRole { .. })));
    }
}
