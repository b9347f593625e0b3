//! Predicate trees for queries, updates, and deletes.
//!
//! A selector combines field predicates under `and`/`or`, nests
//! sub-selectors of the same schema, and joins selectors of other schemas
//! on field equality to plan multi-schema queries.

use super::{DbValue, Schema};
use crate::Error;
use bson::{Bson, Document};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SelectorMode {
    And = 0,
    Or = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SelectorOp {
    Eq = 0,
    Lt = 1,
    Le = 2,
    Gt = 3,
    Ge = 4,
    Ne = 5,
}

struct Field {
    name: String,
    op: SelectorOp,
    value: DbValue,
}

struct Join {
    local_field: String,
    other_field: String,
    other: Selector,
}

pub struct Selector {
    schema: Schema,
    mode: SelectorMode,
    fields: Vec<Field>,
    subs: Vec<Selector>,
    joins: Vec<Join>,
}

impl Selector {
    pub fn new(schema: &Schema, mode: SelectorMode) -> Self {
        Self {
            schema: schema.clone(),
            mode,
            fields: Vec::new(),
            subs: Vec::new(),
            joins: Vec::new(),
        }
    }

    pub fn mode(&self) -> SelectorMode {
        self.mode
    }

    pub(crate) fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Add a field predicate. The field must be declared in the selector's
    /// schema and the value must match its type.
    pub fn add_field(
        &mut self,
        name: &str,
        op: SelectorOp,
        value: impl Into<DbValue>,
    ) -> Result<(), Error> {
        let mut value = value.into();
        let declared = self
            .schema
            .field_type(name)
            .ok_or_else(|| Error::Invalid(format!("field '{name}' is not in the schema")))?;
        // By-id predicates may be written with a plain unsigned value.
        if let (super::DbType::Id, DbValue::Uint64(raw)) = (declared, &value) {
            value = DbValue::Id(*raw);
        }
        if declared != value.db_type() {
            return Err(Error::Invalid(format!(
                "field '{name}' is {declared:?}, predicate value is {:?}",
                value.db_type()
            )));
        }

        self.fields.push(Field {
            name: name.to_string(),
            op,
            value,
        });
        Ok(())
    }

    /// Nest a sub-selector of the same schema.
    pub fn add_selector(&mut self, child: Selector) -> Result<(), Error> {
        if !child.schema.equals(&self.schema) {
            return Err(Error::Invalid(
                "sub-selector belongs to a different schema".to_string(),
            ));
        }
        self.subs.push(child);
        Ok(())
    }

    /// Join another schema's selector on `local_field == other_field`. The
    /// joined selector's predicates restrict the joined rows.
    pub fn add_join(
        &mut self,
        local_field: &str,
        other: Selector,
        other_field: &str,
    ) -> Result<(), Error> {
        if self.schema.field_type(local_field).is_none() {
            return Err(Error::Invalid(format!(
                "join field '{local_field}' is not in the schema"
            )));
        }
        if other.schema.field_type(other_field).is_none() {
            return Err(Error::Invalid(format!(
                "join field '{other_field}' is not in the joined schema"
            )));
        }

        self.joins.push(Join {
            local_field: local_field.to_string(),
            other_field: other_field.to_string(),
            other,
        });
        Ok(())
    }

    pub(crate) fn has_joins(&self) -> bool {
        !self.joins.is_empty()
    }

    /// The primary schema plus every joined schema, in join order.
    pub(crate) fn schemas(&self) -> Vec<Schema> {
        let mut schemas = vec![self.schema.clone()];
        for join in &self.joins {
            schemas.extend(join.other.schemas());
        }
        schemas
    }

    pub(crate) fn to_document(&self) -> Document {
        let mut document = Document::new();
        document.insert("mode", Bson::Int32(self.mode as i32));

        let fields: Vec<Bson> = self
            .fields
            .iter()
            .map(|field| {
                let mut doc = Document::new();
                doc.insert("name", field.name.clone());
                doc.insert("op", Bson::Int32(field.op as i32));
                doc.insert("type", Bson::Int32(field.value.db_type().code()));
                doc.insert("value", field.value.to_bson());
                Bson::Document(doc)
            })
            .collect();
        document.insert("fields", fields);

        let subs: Vec<Bson> = self
            .subs
            .iter()
            .map(|sub| Bson::Document(sub.to_document()))
            .collect();
        document.insert("subs", subs);

        let joins: Vec<Bson> = self
            .joins
            .iter()
            .map(|join| {
                let mut doc = Document::new();
                doc.insert("local", join.local_field.clone());
                doc.insert("field", join.other_field.clone());
                doc.insert("namespace", join.other.schema.namespace().to_string());
                doc.insert("name", join.other.schema.name().to_string());
                doc.insert("selector", join.other.to_document());
                Bson::Document(doc)
            })
            .collect();
        document.insert("joins", joins);

        document
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::DbType;

    fn schema(name: &str) -> Schema {
        let schema = Schema::new("test-ns", name).unwrap();
        schema.add_field("file", DbType::String).unwrap();
        schema.add_field("dimensions", DbType::Uint64).unwrap();
        schema
    }

    #[test]
    fn add_field_validates_against_schema() {
        let mut selector = Selector::new(&schema("s"), SelectorMode::And);

        selector
            .add_field("file", SelectorOp::Eq, "demo.bp")
            .unwrap();
        selector
            .add_field("dimensions", SelectorOp::Gt, 2u64)
            .unwrap();
        // By-id predicates are valid on every schema.
        selector.add_field("_id", SelectorOp::Eq, 7u64).unwrap();
        selector
            .add_field("missing", SelectorOp::Eq, "x")
            .unwrap_err();
        assert!(matches!(
            selector.add_field("file", SelectorOp::Eq, 9u64),
            Err(Error::Invalid(_)),
        ));
    }

    #[test]
    fn sub_selectors_must_share_the_schema() {
        let mut parent = Selector::new(&schema("s"), SelectorMode::And);
        let child = Selector::new(&schema("s"), SelectorMode::Or);
        parent.add_selector(child).unwrap();

        let foreign = Selector::new(&schema("other"), SelectorMode::Or);
        assert!(matches!(
            parent.add_selector(foreign),
            Err(Error::Invalid(_)),
        ));
    }

    #[test]
    fn joins_validate_both_fields() {
        let mut parent = Selector::new(&schema("left"), SelectorMode::And);
        let other = Selector::new(&schema("right"), SelectorMode::And);
        parent
            .add_join("dimensions", other, "dimensions")
            .unwrap();
        assert!(parent.has_joins());
        assert_eq!(parent.schemas().len(), 2);

        let other = Selector::new(&schema("right"), SelectorMode::And);
        assert!(matches!(
            parent.add_join("missing", other, "dimensions"),
            Err(Error::Invalid(_)),
        ));
    }

    #[test]
    fn document_encodes_the_tree() {
        let mut selector = Selector::new(&schema("s"), SelectorMode::And);
        selector
            .add_field("file", SelectorOp::Ne, "x.bp")
            .unwrap();
        let mut child = Selector::new(&schema("s"), SelectorMode::Or);
        child
            .add_field("dimensions", SelectorOp::Le, 4u64)
            .unwrap();
        selector.add_selector(child).unwrap();

        let document = selector.to_document();
        assert_eq!(document.get_i32("mode").unwrap(), 0);
        assert_eq!(document.get_array("fields").unwrap().len(), 1);
        assert_eq!(document.get_array("subs").unwrap().len(), 1);
        assert_eq!(document.get_array("joins").unwrap().len(), 0);
    }
}
