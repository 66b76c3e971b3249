//! Field collection
//!
//! Flattens a selection set for one runtime type: fragments whose type
//! condition does not match are dropped, conditional fields are evaluated,
//! and fields sharing a response name are merged.

use super::{CompiledField, Condition, Selection, Variables};

/// A field after collection, with the sub-selections of every merged occurrence
#[derive(Debug, Clone)]
pub struct CollectedField<'a> {
    /// First occurrence of the field; name, alias and arguments come from it
    pub field: &'a CompiledField,

    /// Sub-selections of all occurrences, in document order
    pub selections: Vec<&'a Selection>,
}

impl<'a> CollectedField<'a> {
    pub fn response_name(&self) -> &'a str {
        self.field.response_name()
    }

    pub fn is_composite(&self) -> bool {
        !self.selections.is_empty()
    }
}

/// Collect the fields that apply to an object of type `typename`
pub fn collect_fields<'a, I>(
    selections: I,
    typename: &str,
    variables: &Variables,
) -> Vec<CollectedField<'a>>
where
    I: IntoIterator<Item = &'a Selection>,
{
    let mut collected = Vec::new();
    collect_into(selections, typename, variables, &mut collected);
    collected
}

fn collect_into<'a, I>(
    selections: I,
    typename: &str,
    variables: &Variables,
    out: &mut Vec<CollectedField<'a>>,
) where
    I: IntoIterator<Item = &'a Selection>,
{
    for selection in selections {
        match selection {
            Selection::Field(field) => {
                if !conditions_pass(&field.condition, variables) {
                    continue;
                }
                let name = field.response_name();
                match out.iter_mut().find(|c| c.response_name() == name) {
                    Some(existing) => existing.selections.extend(field.selections.iter()),
                    None => out.push(CollectedField {
                        field,
                        selections: field.selections.iter().collect(),
                    }),
                }
            }
            Selection::Fragment(fragment) => {
                if fragment.applies_to(typename) && conditions_pass(&fragment.condition, variables)
                {
                    collect_into(fragment.selections.iter(), typename, variables, out);
                }
            }
        }
    }
}

fn conditions_pass(conditions: &[Condition], variables: &Variables) -> bool {
    conditions.iter().all(|c| c.passes(variables))
}
