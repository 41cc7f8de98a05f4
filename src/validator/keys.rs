//! Key validation and include expansion.

use crate::error::{DbError, DbResult};
use crate::schema::{is_default_key, ClassAction, DataType, FieldAction, DEFAULT_KEYS, READ_ONLY_KEYS};

use super::decoder::QueryDecoder;

/// Path left after an optional leading array index (`0.name` -> `name`)
pub(super) fn skip_index(rest: &str) -> Option<&str> {
    match rest.split_once('.') {
        Some((head, tail)) if is_index(head) => Some(tail),
        None if is_index(rest) => None,
        _ => Some(rest),
    }
}

fn is_index(segment: &str) -> bool {
    !segment.is_empty() && segment.chars().all(|c| c.is_ascii_digit())
}

fn is_relation(data_type: &DataType) -> bool {
    matches!(data_type, DataType::Relation { .. })
}

pub(super) fn push_unique(out: &mut Vec<String>, path: String) {
    if !out.contains(&path) {
        out.push(path);
    }
}

impl QueryDecoder<'_> {
    /// Check that the caller may `action` the dotted `path` of a class.
    ///
    /// Paths reaching through a pointer or relation are checked against the
    /// target class as reads.
    pub fn validate_key(&self, class_name: &str, path: &str, action: FieldAction) -> DbResult<()> {
        let schema = self.schema.get(class_name)?;
        let resolved = self.schema.resolve_column(class_name, path)?;
        let field = resolved.field.as_str();

        if action != FieldAction::Read && READ_ONLY_KEYS.contains(&field) {
            return Err(DbError::InvalidKey(format!("'{}' is read-only", field)));
        }
        if !self.identity.is_master {
            let default_read = action == FieldAction::Read && is_default_key(field);
            if !default_read && !schema.allows_field(field, action, &self.acls) {
                return Err(DbError::NoPermission);
            }
        }
        if action == FieldAction::Read && schema.is_secure(field) && !self.identity.disable_security {
            return Err(DbError::NoPermission);
        }

        let invalid = || DbError::InvalidPath(format!("{}.{}", class_name, path));
        match resolved.data_type {
            DataType::Pointer { target } | DataType::Relation { target, .. } => {
                let rest = match resolved.remaining.as_deref() {
                    Some(rest) if action != FieldAction::Read => {
                        return Err(DbError::InvalidKey(format!("cannot write through '{}'", rest)))
                    }
                    Some(rest) if is_relation(resolved.data_type) => skip_index(rest),
                    Some(rest) => Some(rest),
                    None if action == FieldAction::Read => None,
                    None => return Ok(()),
                };
                self.check_target(resolved.data_type, target)?;
                match rest {
                    Some(rest) => self.validate_key(target, rest, FieldAction::Read),
                    None => Ok(()),
                }
            }
            _ => match resolved.remaining.as_deref() {
                None => Ok(()),
                Some(rest) => {
                    let indexed = rest.split('.').any(is_index);
                    match resolved.data_type {
                        DataType::Array | DataType::StringArray | DataType::Vector { .. } => Ok(()),
                        DataType::Object if !indexed => Ok(()),
                        _ => Err(invalid()),
                    }
                }
            },
        }
    }

    /// Reading a reference reads rows of its target class
    fn check_target(&self, data_type: &DataType, target: &str) -> DbResult<()> {
        let target_schema = self.schema.get(target)?;
        if let DataType::Relation {
            foreign_field: Some(foreign),
            ..
        } = data_type
        {
            match target_schema.fields.get(foreign) {
                Some(DataType::Pointer { .. })
                | Some(DataType::Relation {
                    foreign_field: None,
                    ..
                }) => {}
                _ => return Err(DbError::InvalidPath(format!("{}.{}", target, foreign))),
            }
        }
        if !self.identity.is_master && !target_schema.allows_class(ClassAction::Get, &self.acls) {
            return Err(DbError::NoPermission);
        }
        Ok(())
    }

    /// Every stored column of a class the caller may read
    fn readable_columns(&self, class_name: &str) -> DbResult<Vec<String>> {
        let schema = self.schema.get(class_name)?;
        Ok(schema
            .columns()
            .into_iter()
            .filter(|(_, data_type)| !data_type.is_reference())
            .map(|(column, _)| column)
            .filter(|column| self.validate_key(class_name, column, FieldAction::Read).is_ok())
            .collect())
    }

    /// Expand `*` and `ref.*` into readable columns
    fn expand_include(&self, class_name: &str, path: &str) -> DbResult<Vec<String>> {
        if path == "*" {
            return self.readable_columns(class_name);
        }
        let Some(head) = path.strip_suffix(".*") else {
            return Ok(vec![path.to_string()]);
        };
        let resolved = self.schema.resolve_column(class_name, head)?;
        let target = resolved
            .data_type
            .target()
            .ok_or_else(|| DbError::InvalidPath(format!("{}.{}", class_name, path)))?;
        let rest = match resolved.remaining.as_deref() {
            Some(rest) if is_relation(resolved.data_type) => skip_index(rest),
            rest => rest,
        };
        let nested = match rest {
            Some(rest) => self.expand_include(target, &format!("{}.*", rest))?,
            None => self.readable_columns(target)?,
        };
        Ok(nested
            .into_iter()
            .map(|column| format!("{}.{}", resolved.column, column))
            .collect())
    }

    /// Validated projection: requested paths, paths used elsewhere in the
    /// query, then the default keys.
    pub fn decode_includes(
        &self,
        class_name: &str,
        includes: &[String],
        key_paths: &[String],
    ) -> DbResult<Vec<String>> {
        let mut out = Vec::new();
        for include in includes.iter().chain(key_paths) {
            for path in self.expand_include(class_name, include)? {
                self.validate_key(class_name, &path, FieldAction::Read)?;
                push_unique(&mut out, path);
            }
        }
        for key in DEFAULT_KEYS {
            push_unique(&mut out, key.to_string());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_index() {
        assert_eq!(skip_index("0.name"), Some("name"));
        assert_eq!(skip_index("12"), None);
        assert_eq!(skip_index("name"), Some("name"));
        assert_eq!(skip_index("name.0"), Some("name.0"));
    }
}
