//! Class- and field-level permission actions.

use serde::Deserialize;

/// ACL subject that every caller holds
pub const PUBLIC_SUBJECT: &str = "*";

/// Actions gated by class-level permissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassAction {
    Get,
    Find,
    Count,
    Create,
    Update,
    Delete,
}

/// Actions gated by field-level permissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldAction {
    Read,
    Create,
    Update,
}

/// True if any permitted subject is held by the caller.
///
/// A missing rule means public access.
pub fn is_permitted(rule: Option<&Vec<String>>, acls: &[String]) -> bool {
    match rule {
        None => true,
        Some(subjects) => subjects.iter().any(|s| acls.contains(s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_permitted() {
        let acls = vec!["*".to_string(), "role:admin".to_string()];
        assert!(is_permitted(None, &acls));
        assert!(is_permitted(Some(&vec!["role:admin".to_string()]), &acls));
        assert!(!is_permitted(Some(&vec!["role:editor".to_string()]), &acls));
        assert!(!is_permitted(Some(&Vec::new()), &acls));
    }
}
