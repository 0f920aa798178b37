use std::fmt;

/// Unique identifier of a table within the cluster.
///
/// Table ids are opaque strings assigned by the master at table-creation
/// time; they never change across alters or renames.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(String);

impl TableId {
    /// Create a table id from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TableId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// Unique identifier of a tablet.
///
/// Used as the grouping key when batching operations, so it must be cheap
/// to hash and compare.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TabletId(String);

impl TabletId {
    /// Create a tablet id from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TabletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TabletId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_display_and_order() {
        let a = TabletId::new("tablet-a");
        let b = TabletId::from("tablet-b");
        assert_eq!(a.to_string(), "tablet-a");
        assert_eq!(a.as_str(), "tablet-a");
        assert!(a < b);

        let t = TableId::new("t1");
        assert_eq!(t.to_string(), "t1");
    }
}
